use axum::{
    extract::{Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use sqlx::types::Uuid;

use crate::error::AppError;
use crate::services::supabase::Session;
use crate::state::AppState;

pub const ACCESS_COOKIE: &str = "sb-access-token";
pub const REFRESH_COOKIE: &str = "sb-refresh-token";

const AUDIENCE: &str = "authenticated";
const REFRESH_MAX_AGE_SECS: i64 = 60 * 60 * 24 * 30;

/// Supabase access-token claims.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub email: Option<String>,
    pub exp: usize,
    pub aud: String,
}

/// Caller identity attached to every authenticated request.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthUser {
    pub id: Uuid,
    pub email: Option<String>,
}

pub struct SessionVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl SessionVerifier {
    pub fn new(jwt_secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[AUDIENCE]);
        Self {
            key: DecodingKey::from_secret(jwt_secret.as_bytes()),
            validation,
        }
    }

    pub fn verify(&self, token: &str) -> Result<AuthUser, AppError> {
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            tracing::debug!(error = %e, "session token rejected");
            AppError::Unauthorized("Invalid or expired session".into())
        })?;
        Ok(AuthUser {
            id: data.claims.sub,
            email: data.claims.email,
        })
    }
}

fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty())
}

/// Bearer header first, then the session cookie.
pub fn session_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .or_else(|| cookie_value(headers, ACCESS_COOKIE))
}

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = session_token(request.headers())
        .ok_or_else(|| AppError::Unauthorized("Authentication required".into()))?;

    let user = state.sessions.verify(token)?;
    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

fn cookie(name: &str, value: &str, max_age: i64, secure: bool) -> String {
    let mut cookie = format!("{name}={value}; Path=/; HttpOnly; SameSite=Lax; Max-Age={max_age}");
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

pub fn session_cookies(session: &Session, secure: bool) -> [String; 2] {
    [
        cookie(ACCESS_COOKIE, &session.access_token, session.expires_in, secure),
        cookie(REFRESH_COOKIE, &session.refresh_token, REFRESH_MAX_AGE_SECS, secure),
    ]
}

pub fn cleared_cookies(secure: bool) -> [String; 2] {
    [
        cookie(ACCESS_COOKIE, "", 0, secure),
        cookie(REFRESH_COOKIE, "", 0, secure),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "super-secret-jwt-token-with-at-least-32-characters";

    fn token(sub: Uuid, aud: &str, exp_offset: i64) -> String {
        let claims = Claims {
            sub,
            email: Some("hanna@example.com".into()),
            exp: (chrono::Utc::now().timestamp() + exp_offset) as usize,
            aud: aud.into(),
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn verifies_supabase_access_token() {
        let id = Uuid::new_v4();
        let user = SessionVerifier::new(SECRET)
            .verify(&token(id, AUDIENCE, 3600))
            .unwrap();
        assert_eq!(user.id, id);
        assert_eq!(user.email.as_deref(), Some("hanna@example.com"));
    }

    #[test]
    fn rejects_wrong_audience_expiry_or_secret() {
        let verifier = SessionVerifier::new(SECRET);
        let id = Uuid::new_v4();
        assert!(verifier.verify(&token(id, "anon", 3600)).is_err());
        assert!(verifier.verify(&token(id, AUDIENCE, -3600)).is_err());
        assert!(SessionVerifier::new("another-secret")
            .verify(&token(id, AUDIENCE, 3600))
            .is_err());
    }

    #[test]
    fn token_from_header_or_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; sb-access-token=from-cookie"),
        );
        assert_eq!(session_token(&headers), Some("from-cookie"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer from-header"));
        assert_eq!(session_token(&headers), Some("from-header"));

        assert_eq!(session_token(&HeaderMap::new()), None);
    }

    #[test]
    fn cookies_are_http_only() {
        let [access, refresh] = cleared_cookies(true);
        assert!(access.starts_with("sb-access-token=;"));
        assert!(access.contains("HttpOnly"));
        assert!(access.contains("Max-Age=0"));
        assert!(refresh.ends_with("; Secure"));
    }
}
