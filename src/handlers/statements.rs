use axum::{
    extract::{Extension, State},
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::error::AppError;
use crate::extract::ApiJson;
use crate::middlewares::auth::AuthUser;
use crate::models::StatementRequest;
use crate::services::mailer::OutgoingMail;
use crate::services::statements::{build_statement, parse_statement_request, Statement};
use crate::state::AppState;

async fn load(state: &AppState, user: &AuthUser, req: &StatementRequest) -> Result<Statement, AppError> {
    let query = parse_statement_request(req)?;
    build_statement(state.store.as_ref(), user.id, &query).await
}

fn attachment(content_type: &'static str, filename: String, body: String) -> Response {
    (
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        body,
    )
        .into_response()
}

pub async fn generate_csv(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    ApiJson(payload): ApiJson<StatementRequest>,
) -> Result<Response, AppError> {
    let statement = load(&state, &user, &payload).await?;
    Ok(attachment(
        "text/csv; charset=utf-8",
        statement.filename("csv"),
        statement.render_csv(),
    ))
}

pub async fn generate_excel(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    ApiJson(payload): ApiJson<StatementRequest>,
) -> Result<Response, AppError> {
    let statement = load(&state, &user, &payload).await?;
    Ok(attachment(
        "application/vnd.ms-excel",
        statement.filename("xls"),
        statement.render_excel(),
    ))
}

pub async fn generate_pdf(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    ApiJson(payload): ApiJson<StatementRequest>,
) -> Result<Response, AppError> {
    let statement = load(&state, &user, &payload).await?;
    Ok(Json(json!({
        "success": true,
        "html": statement.render_html(),
        "filename": statement.filename("pdf")
    }))
    .into_response())
}

pub async fn email(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    ApiJson(payload): ApiJson<StatementRequest>,
) -> Result<Response, AppError> {
    let mailer = state
        .mailer
        .clone()
        .ok_or_else(|| AppError::ServiceUnavailable("Email delivery is not configured".into()))?;

    let query = parse_statement_request(&payload)?;
    let statement = build_statement(state.store.as_ref(), user.id, &query).await?;
    let to = query
        .email
        .map(|email| email.as_str().to_string())
        .unwrap_or_else(|| statement.owner.email.clone());

    mailer
        .send(&OutgoingMail {
            to: to.clone(),
            subject: format!(
                "Your Nile Pay statement for {}",
                statement.account.account_number
            ),
            html: statement.render_html(),
        })
        .await?;

    Ok(Json(json!({
        "success": true,
        "message": format!("Statement sent to {to}")
    }))
    .into_response())
}
