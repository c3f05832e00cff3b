use axum::{
    extract::State,
    http::{header, HeaderMap},
    response::{AppendHeaders, IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::error::AppError;
use crate::extract::ApiJson;
use crate::middlewares::auth::{cleared_cookies, session_cookies, session_token};
use crate::middlewares::rate_limit::limit_email;
use crate::models::{MagicLinkRequest, SignInRequest, VerifyOtpRequest};
use crate::services::supabase::{Session, SignInInput};
use crate::services::validation::{required, Email};
use crate::state::AppState;

/// Mirrors the session user into `users` and sets the session cookies.
async fn establish(state: &AppState, session: Session) -> Result<Response, AppError> {
    let email = session
        .user
        .email
        .clone()
        .ok_or_else(|| AppError::Upstream("Session has no email address".into()))?;

    let user = state
        .store
        .sync_user(session.user.id, &email)
        .await?
        .ok_or_else(|| AppError::Forbidden("This account has been deleted".into()))?;

    tracing::info!(user_id = %user.id, "session established");
    let cookies = session_cookies(&session, state.config.cookie_secure)
        .map(|cookie| (header::SET_COOKIE, cookie));
    Ok((
        AppendHeaders(cookies),
        Json(json!({ "success": true, "user": user })),
    )
        .into_response())
}

pub async fn sign_in(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<SignInRequest>,
) -> Result<Response, AppError> {
    let input = SignInInput::parse(&payload)?;
    limit_email(&state, "sign-in", &input.email)?;
    let session = state.auth.sign_in_with_password(&input).await?;
    establish(&state, session).await
}

pub async fn magic_link(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<MagicLinkRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let email = Email::parse(required(&payload.email, "email")?)?;
    limit_email(&state, "magic-link", &email)?;
    let redirect_to = payload
        .redirect_to
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty());

    state.auth.send_magic_link(&email, redirect_to).await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("Magic link sent to {email}")
    })))
}

pub async fn verify(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<VerifyOtpRequest>,
) -> Result<Response, AppError> {
    let email = Email::parse(required(&payload.email, "email")?)?;
    let token = required(&payload.token, "token")?;
    let session = state.auth.verify_otp(&email, token).await?;
    establish(&state, session).await
}

pub async fn sign_out(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(token) = session_token(&headers) {
        // The cookies go either way
        if let Err(e) = state.auth.sign_out(token).await {
            tracing::warn!(error = %e, "provider sign-out failed");
        }
    }

    let cookies = cleared_cookies(state.config.cookie_secure).map(|cookie| (header::SET_COOKIE, cookie));
    (
        AppendHeaders(cookies),
        Json(json!({ "success": true, "message": "Signed out" })),
    )
        .into_response()
}
