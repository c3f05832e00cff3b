use axum::{
    http::{header, HeaderValue, Method},
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::handlers::{auth, bank_accounts, health, statements, transactions, transfers, user};
use crate::middlewares::auth::auth_middleware;
use crate::middlewares::rate_limit::rate_limit_middleware;
use crate::state::AppState;

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(%origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true)
}

pub fn create_router(state: AppState) -> Router {
    let rate_limited = middleware::from_fn_with_state(state.clone(), rate_limit_middleware);

    // Auth routes
    let auth_routes = Router::new()
        .route("/sign-in", post(auth::sign_in))
        .route("/magic-link", post(auth::magic_link))
        .route("/verify", post(auth::verify))
        .route_layer(rate_limited.clone())
        .route("/sign-out", post(auth::sign_out));

    // Everything below requires a session
    let protected_routes = Router::new()
        .route(
            "/user/profile",
            get(user::get_profile)
                .put(user::update_profile)
                .delete(user::delete_profile),
        )
        .route(
            "/bank-accounts",
            get(bank_accounts::list_accounts).post(bank_accounts::create_account),
        )
        .route(
            "/bank-accounts/{id}",
            get(bank_accounts::get_account)
                .put(bank_accounts::update_account)
                .delete(bank_accounts::delete_account),
        )
        .route("/bank-accounts/{id}/primary", post(bank_accounts::set_primary))
        .route("/bank-accounts/{id}/transactions", post(bank_accounts::post_entry))
        .route("/transactions", get(transactions::list_transactions))
        .route(
            "/transfers/user-to-user",
            post(transfers::user_to_user).route_layer(rate_limited),
        )
        .route("/statements/generate-csv", post(statements::generate_csv))
        .route("/statements/generate-excel", post(statements::generate_excel))
        .route("/statements/generate-pdf", post(statements::generate_pdf))
        .route("/statements/email", post(statements::email))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    let api = Router::new()
        .route("/health", get(health::health_check))
        .nest("/auth", auth_routes)
        .merge(protected_routes);

    Router::new()
        .nest("/api", api)
        .layer(cors_layer(&state.config.cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
