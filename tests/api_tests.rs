use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::{Body, Bytes},
    extract::ConnectInfo,
    http::{header, HeaderMap, Method, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt; // for collecting body
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde_json::{json, Value};
use sqlx::types::Uuid;
use tower::ServiceExt; // for one_shot

use nilepay::middlewares::auth::Claims;
use nilepay::services::supabase::{
    AuthProvider, AuthProviderError, Session, SessionUser, SignInInput,
};
use nilepay::services::validation::Email;
use nilepay::store::MemoryStore;
use nilepay::{create_router, AppState, Config};

const JWT_SECRET: &str = "test-jwt-secret-with-enough-length-for-hs256";

/// Accepts exactly one email/password pair.
struct StubAuth {
    user_id: Uuid,
    email: String,
}

#[async_trait]
impl AuthProvider for StubAuth {
    async fn sign_in_with_password(&self, input: &SignInInput) -> Result<Session, AuthProviderError> {
        if input.email.as_str() == self.email && input.password == "correct-horse" {
            Ok(Session {
                access_token: token_for(self.user_id),
                refresh_token: "refresh-123".into(),
                expires_in: 3600,
                user: SessionUser {
                    id: self.user_id,
                    email: Some(self.email.clone()),
                },
            })
        } else {
            Err(AuthProviderError::InvalidCredentials)
        }
    }

    async fn send_magic_link(&self, _email: &Email, _redirect_to: Option<&str>) -> Result<(), AuthProviderError> {
        Ok(())
    }

    async fn verify_otp(&self, _email: &Email, _token: &str) -> Result<Session, AuthProviderError> {
        Err(AuthProviderError::InvalidCredentials)
    }

    async fn sign_out(&self, _access_token: &str) -> Result<(), AuthProviderError> {
        Ok(())
    }
}

struct TestApp {
    app: Router,
    store: Arc<MemoryStore>,
}

fn config(overrides: &[(&str, &str)]) -> Config {
    let mut env: HashMap<String, String> = [
        ("SUPABASE_URL", "http://localhost:54321"),
        ("SUPABASE_ANON_KEY", "anon-key"),
        ("SUPABASE_JWT_SECRET", JWT_SECRET),
        ("COOKIE_SECURE", "false"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    for (k, v) in overrides {
        env.insert(k.to_string(), v.to_string());
    }
    Config::from_lookup(|key| env.get(key).cloned()).unwrap()
}

fn test_app_with(overrides: &[(&str, &str)]) -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let auth = Arc::new(StubAuth {
        user_id: Uuid::new_v4(),
        email: "sara@example.com".into(),
    });
    let state = AppState::new(config(overrides), store.clone(), auth, None);
    TestApp {
        app: create_router(state),
        store,
    }
}

fn test_app() -> TestApp {
    test_app_with(&[])
}

fn token_for(user_id: Uuid) -> String {
    let claims = Claims {
        sub: user_id,
        email: None,
        exp: (chrono::Utc::now().timestamp() + 3600) as usize,
        aud: "authenticated".into(),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .unwrap()
}

fn request(method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

/// Tags a request with the TCP peer the server would have seen.
fn from_client(mut req: Request<Body>, ip: &str) -> Request<Body> {
    let addr: SocketAddr = format!("{ip}:40000").parse().unwrap();
    req.extensions_mut().insert(ConnectInfo(addr));
    req
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, headers, body)
}

async fn send_json(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let (status, _, body) = send(app, req).await;
    (status, serde_json::from_slice(&body).unwrap())
}

async fn create_account(app: &Router, token: &str, bank: &str, balance: f64) -> Value {
    let (status, body) = send_json(
        app,
        request(
            Method::POST,
            "/api/bank-accounts",
            Some(token),
            Some(json!({
                "bankName": bank,
                "accountName": "Everyday",
                "accountType": "savings",
                "balance": balance
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    body["account"].clone()
}

#[tokio::test]
async fn health_check() {
    let t = test_app();
    let (status, body) = send_json(&t.app, request(Method::GET, "/api/health", None, None)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["database"], "connected");
}

#[tokio::test]
async fn protected_routes_require_a_session() {
    let t = test_app();
    let (status, body) =
        send_json(&t.app, request(Method::GET, "/api/bank-accounts", None, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "UNAUTHORIZED");

    let (status, _) = send_json(
        &t.app,
        request(Method::GET, "/api/bank-accounts", Some("not-a-jwt"), None),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn first_account_is_primary_and_listed_first() {
    let t = test_app();
    let user = t.store.add_user("liya@example.com", Some("Liya"));
    let token = token_for(user.id);

    let first = create_account(&t.app, &token, "Commercial Bank of Ethiopia", 0.0).await;
    assert_eq!(first["is_primary"], true);
    assert!(first["account_number"].as_str().unwrap().starts_with("CBE"));

    let second = create_account(&t.app, &token, "Awash Bank", 10.0).await;
    assert_eq!(second["is_primary"], false);

    let uri = format!("/api/bank-accounts/{}/primary", second["id"].as_str().unwrap());
    let (status, _) = send_json(&t.app, request(Method::POST, &uri, Some(&token), None)).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send_json(
        &t.app,
        request(Method::GET, "/api/bank-accounts", Some(&token), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let accounts = body["accounts"].as_array().unwrap();
    assert_eq!(accounts.len(), 2);
    assert_eq!(accounts[0]["id"], second["id"]);
    assert_eq!(
        accounts.iter().filter(|a| a["is_primary"] == true).count(),
        1
    );
}

#[tokio::test]
async fn other_users_accounts_are_not_found() {
    let t = test_app();
    let owner = t.store.add_user("owner@example.com", None);
    let intruder = t.store.add_user("intruder@example.com", None);
    let account = create_account(&t.app, &token_for(owner.id), "Dashen Bank", 5.0).await;

    let uri = format!("/api/bank-accounts/{}", account["id"].as_str().unwrap());
    let (status, body) = send_json(
        &t.app,
        request(Method::GET, &uri, Some(&token_for(intruder.id)), None),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn user_to_user_transfer_end_to_end() {
    let t = test_app();
    let sender = t.store.add_user("abebe@example.com", Some("Abebe"));
    let receiver = t.store.add_user("almaz@example.com", Some("Almaz"));
    let sender_token = token_for(sender.id);
    let source = create_account(&t.app, &sender_token, "Commercial Bank of Ethiopia", 1000.0).await;
    create_account(&t.app, &token_for(receiver.id), "Awash Bank", 0.0).await;

    let payload = json!({
        "senderId": sender.id,
        "receiverId": receiver.id,
        "senderBankId": source["id"],
        "amount": 250,
        "requestId": "req-1"
    });

    let (status, body) = send_json(
        &t.app,
        request(
            Method::POST,
            "/api/transfers/user-to-user",
            Some(&sender_token),
            Some(payload.clone()),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["success"], true);
    assert_eq!(body["replayed"], false);
    assert_eq!(body["details"]["amount"], 250.0);
    assert_eq!(body["details"]["senderBalance"], 750.0);
    assert_eq!(body["details"]["receiverName"], "Almaz");
    assert!(body["transferId"].as_str().unwrap().starts_with("TRF-"));

    // Same request id, same body: no second debit
    let (status, replay) = send_json(
        &t.app,
        request(
            Method::POST,
            "/api/transfers/user-to-user",
            Some(&sender_token),
            Some(payload),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(replay["replayed"], true);
    assert_eq!(replay["transferId"], body["transferId"]);

    let (_, history) = send_json(
        &t.app,
        request(Method::GET, "/api/transactions", Some(&sender_token), None),
    )
    .await;
    assert_eq!(history["count"], 1);
    assert_eq!(history["transactions"][0]["transaction_type"], "debit");
    assert_eq!(t.store.transactions().len(), 2);
}

#[tokio::test]
async fn transfer_with_insufficient_balance() {
    let t = test_app();
    let sender = t.store.add_user("abebe@example.com", None);
    let receiver = t.store.add_user("almaz@example.com", None);
    let token = token_for(sender.id);
    let source = create_account(&t.app, &token, "Awash Bank", 100.0).await;
    create_account(&t.app, &token_for(receiver.id), "Awash Bank", 0.0).await;

    let (status, body) = send_json(
        &t.app,
        request(
            Method::POST,
            "/api/transfers/user-to-user",
            Some(&token),
            Some(json!({
                "senderId": sender.id,
                "receiverId": receiver.id,
                "senderBankId": source["id"],
                "amount": 150
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Insufficient balance");
    assert_eq!(body["available"], 100.0);
    assert_eq!(body["required"], 150.0);
}

#[tokio::test]
async fn transfer_on_behalf_of_someone_else_is_forbidden() {
    let t = test_app();
    let sender = t.store.add_user("abebe@example.com", None);
    let receiver = t.store.add_user("almaz@example.com", None);
    let source = create_account(&t.app, &token_for(sender.id), "Awash Bank", 100.0).await;

    let (status, body) = send_json(
        &t.app,
        request(
            Method::POST,
            "/api/transfers/user-to-user",
            Some(&token_for(receiver.id)),
            Some(json!({
                "senderId": sender.id,
                "receiverId": receiver.id,
                "senderBankId": source["id"],
                "amount": 10
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "FORBIDDEN");
}

#[tokio::test]
async fn malformed_json_uses_error_envelope() {
    let t = test_app();
    let user = t.store.add_user("liya@example.com", None);
    let req = Request::builder()
        .method(Method::POST)
        .uri("/api/bank-accounts")
        .header(header::AUTHORIZATION, format!("Bearer {}", token_for(user.id)))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{\"bankName\": "))
        .unwrap();

    let (status, body) = send_json(&t.app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");
    assert!(body["message"].as_str().unwrap().starts_with("Invalid JSON"));
}

#[tokio::test]
async fn sign_in_sets_cookies_that_authenticate() {
    let t = test_app();
    let (status, headers, body) = send(
        &t.app,
        request(
            Method::POST,
            "/api/auth/sign-in",
            None,
            Some(json!({ "email": "sara@example.com", "password": "correct-horse" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["user"]["email"], "sara@example.com");

    let cookies: Vec<&str> = headers
        .get_all(header::SET_COOKIE)
        .iter()
        .map(|v| v.to_str().unwrap())
        .collect();
    assert_eq!(cookies.len(), 2);
    assert!(cookies.iter().all(|c| c.contains("HttpOnly")));
    let access = cookies
        .iter()
        .find(|c| c.starts_with("sb-access-token="))
        .unwrap()
        .split(';')
        .next()
        .unwrap()
        .to_string();

    let req = Request::builder()
        .uri("/api/user/profile")
        .header(header::COOKIE, access)
        .body(Body::empty())
        .unwrap();
    let (status, profile) = send_json(&t.app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(profile["user"]["email"], "sara@example.com");
}

#[tokio::test]
async fn sign_in_with_wrong_password() {
    let t = test_app();
    let (status, body) = send_json(
        &t.app,
        request(
            Method::POST,
            "/api/auth/sign-in",
            None,
            Some(json!({ "email": "sara@example.com", "password": "wrong-horse" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["message"], "Invalid email or password");
}

#[tokio::test]
async fn sign_in_is_rate_limited() {
    let t = test_app_with(&[("RATE_LIMIT_PER_MINUTE", "2")]);
    let attempt = || {
        from_client(
            request(
                Method::POST,
                "/api/auth/sign-in",
                None,
                Some(json!({ "email": "sara@example.com", "password": "wrong-horse" })),
            ),
            "198.51.100.1",
        )
    };

    assert_eq!(send_json(&t.app, attempt()).await.0, StatusCode::UNAUTHORIZED);
    assert_eq!(send_json(&t.app, attempt()).await.0, StatusCode::UNAUTHORIZED);
    let (status, body) = send_json(&t.app, attempt()).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["code"], "RATE_LIMITED");
}

#[tokio::test]
async fn clients_are_rate_limited_independently() {
    let t = test_app_with(&[("RATE_LIMIT_PER_MINUTE", "2")]);
    let magic_link = |email: &str, ip: &str| {
        from_client(
            request(
                Method::POST,
                "/api/auth/magic-link",
                None,
                Some(json!({ "email": email })),
            ),
            ip,
        )
    };

    for email in ["a1@example.com", "a2@example.com"] {
        let (status, _) = send_json(&t.app, magic_link(email, "198.51.100.1")).await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, _) = send_json(&t.app, magic_link("a3@example.com", "198.51.100.1")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

    // Another client still has its own quota
    let (status, _) = send_json(&t.app, magic_link("b1@example.com", "198.51.100.2")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn forwarded_for_cannot_dodge_the_limit() {
    let t = test_app_with(&[("RATE_LIMIT_PER_MINUTE", "1")]);
    let magic_link = |email: &str, forwarded: &str| {
        let mut req = request(
            Method::POST,
            "/api/auth/magic-link",
            None,
            Some(json!({ "email": email })),
        );
        req.headers_mut()
            .insert("x-forwarded-for", forwarded.parse().unwrap());
        from_client(req, "198.51.100.1")
    };

    let (status, _) = send_json(&t.app, magic_link("a1@example.com", "1.2.3.4")).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send_json(&t.app, magic_link("a2@example.com", "5.6.7.8")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn sign_in_is_rate_limited_per_email_across_clients() {
    let t = test_app_with(&[("RATE_LIMIT_PER_MINUTE", "2")]);
    let attempt = |ip: &str| {
        from_client(
            request(
                Method::POST,
                "/api/auth/sign-in",
                None,
                Some(json!({ "email": "sara@example.com", "password": "wrong-horse" })),
            ),
            ip,
        )
    };

    assert_eq!(send_json(&t.app, attempt("198.51.100.1")).await.0, StatusCode::UNAUTHORIZED);
    assert_eq!(send_json(&t.app, attempt("198.51.100.2")).await.0, StatusCode::UNAUTHORIZED);
    let (status, _) = send_json(&t.app, attempt("198.51.100.3")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn sign_out_clears_cookies() {
    let t = test_app();
    let (status, headers, _) =
        send(&t.app, request(Method::POST, "/api/auth/sign-out", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers
        .get_all(header::SET_COOKIE)
        .iter()
        .all(|v| v.to_str().unwrap().contains("Max-Age=0")));
}

#[tokio::test]
async fn profile_update_normalizes_phone() {
    let t = test_app();
    let user = t.store.add_user("yonas@example.com", None);
    let token = token_for(user.id);

    let (status, body) = send_json(
        &t.app,
        request(
            Method::PUT,
            "/api/user/profile",
            Some(&token),
            Some(json!({ "phone": "0912345678", "region": "Amhara" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["user"]["phone"], "+251912345678");

    let (status, _) = send_json(
        &t.app,
        request(
            Method::PUT,
            "/api/user/profile",
            Some(&token),
            Some(json!({ "phone": "12345" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send_json(
        &t.app,
        request(Method::DELETE, "/api/user/profile", Some(&token), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send_json(
        &t.app,
        request(Method::GET, "/api/user/profile", Some(&token), None),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn csv_statement_is_an_attachment() {
    let t = test_app();
    let user = t.store.add_user("liya@example.com", Some("Liya"));
    let token = token_for(user.id);
    let account = create_account(&t.app, &token, "Awash Bank", 0.0).await;

    let entry_uri = format!("/api/bank-accounts/{}/transactions", account["id"].as_str().unwrap());
    let (status, _) = send_json(
        &t.app,
        request(
            Method::POST,
            &entry_uri,
            Some(&token),
            Some(json!({ "transactionType": "credit", "amount": 75.5, "description": "Cash, branch" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let today = chrono::Utc::now().date_naive().format("%Y-%m-%d").to_string();
    let (status, headers, body) = send(
        &t.app,
        request(
            Method::POST,
            "/api/statements/generate-csv",
            Some(&token),
            Some(json!({
                "userId": user.id,
                "accountId": account["id"],
                "startDate": today,
                "endDate": today
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let content_type: mime::Mime = headers[header::CONTENT_TYPE].to_str().unwrap().parse().unwrap();
    assert_eq!(content_type.essence_str(), "text/csv");
    let disposition = headers[header::CONTENT_DISPOSITION].to_str().unwrap();
    assert!(disposition.contains(&format!("-{today}-{today}.csv")));

    let csv = std::str::from_utf8(&body).unwrap();
    assert!(csv.contains("\"Cash, branch\""));
    assert!(csv.contains("Total Credits,75.50"));
}

#[tokio::test]
async fn statement_email_without_mailer_is_unavailable() {
    let t = test_app();
    let user = t.store.add_user("liya@example.com", None);
    let token = token_for(user.id);
    let account = create_account(&t.app, &token, "Awash Bank", 0.0).await;

    let (status, body) = send_json(
        &t.app,
        request(
            Method::POST,
            "/api/statements/email",
            Some(&token),
            Some(json!({
                "userId": user.id,
                "accountId": account["id"],
                "startDate": "2026-01-01",
                "endDate": "2026-01-31"
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "SERVICE_UNAVAILABLE");
}
