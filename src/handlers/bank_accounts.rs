use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};
use sqlx::types::Uuid;

use crate::error::AppError;
use crate::extract::{ApiJson, ApiQuery};
use crate::middlewares::auth::AuthUser;
use crate::models::{AccountEntryRequest, CreateAccountRequest, GetAccountsQuery, UpdateAccountRequest};
use crate::services::bank_accounts;
use crate::services::validation::parse_uuid;
use crate::state::AppState;

fn account_id(raw: &str) -> Result<Uuid, AppError> {
    Ok(parse_uuid(raw, "id")?)
}

pub async fn list_accounts(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    ApiQuery(params): ApiQuery<GetAccountsQuery>,
) -> Result<Json<Value>, AppError> {
    if let Some(requested) = params.user_id.as_deref() {
        if parse_uuid(requested, "userId")? != user.id {
            return Err(AppError::Forbidden(
                "You can only list your own bank accounts".into(),
            ));
        }
    }

    let accounts = bank_accounts::list_accounts(state.store.as_ref(), user.id).await?;
    Ok(Json(json!({ "success": true, "accounts": accounts })))
}

pub async fn create_account(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    ApiJson(payload): ApiJson<CreateAccountRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let account = bank_accounts::create_account(state.store.as_ref(), user.id, &payload).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "account": account })),
    ))
}

pub async fn get_account(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let account = bank_accounts::get_account(state.store.as_ref(), user.id, account_id(&id)?).await?;
    Ok(Json(json!({ "success": true, "account": account })))
}

pub async fn update_account(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
    ApiJson(payload): ApiJson<UpdateAccountRequest>,
) -> Result<Json<Value>, AppError> {
    let account =
        bank_accounts::update_account(state.store.as_ref(), user.id, account_id(&id)?, &payload)
            .await?;
    Ok(Json(json!({ "success": true, "account": account })))
}

pub async fn set_primary(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let account = bank_accounts::set_primary(state.store.as_ref(), user.id, account_id(&id)?).await?;
    Ok(Json(json!({
        "success": true,
        "message": "Primary account updated",
        "account": account
    })))
}

pub async fn delete_account(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let deleted = bank_accounts::delete_account(state.store.as_ref(), user.id, account_id(&id)?).await?;
    Ok(Json(json!({
        "success": true,
        "message": "Bank account deleted",
        "deletedAccountId": deleted.id,
        "promotedAccountId": deleted.promoted
    })))
}

pub async fn post_entry(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
    ApiJson(payload): ApiJson<AccountEntryRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let (account, transaction) =
        bank_accounts::post_entry(state.store.as_ref(), user.id, account_id(&id)?, &payload).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "account": account,
            "transaction": transaction
        })),
    ))
}
