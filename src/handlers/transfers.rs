use axum::{
    extract::{Extension, State},
    Json,
};

use crate::error::AppError;
use crate::extract::ApiJson;
use crate::middlewares::auth::AuthUser;
use crate::models::{TransferResponse, UserTransferRequest};
use crate::services::transfers;
use crate::state::AppState;

pub async fn user_to_user(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    ApiJson(payload): ApiJson<UserTransferRequest>,
) -> Result<Json<TransferResponse>, AppError> {
    let response = transfers::transfer(state.store.as_ref(), user.id, &payload).await?;
    Ok(Json(response))
}
