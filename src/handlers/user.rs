use axum::{
    extract::{Extension, State},
    Json,
};
use serde_json::{json, Value};

use crate::error::AppError;
use crate::extract::ApiJson;
use crate::middlewares::auth::AuthUser;
use crate::models::UpdateProfileRequest;
use crate::services::profile;
use crate::state::AppState;

pub async fn get_profile(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<Value>, AppError> {
    let profile = profile::get_profile(state.store.as_ref(), user.id).await?;
    Ok(Json(json!({ "success": true, "user": profile })))
}

pub async fn update_profile(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    ApiJson(payload): ApiJson<UpdateProfileRequest>,
) -> Result<Json<Value>, AppError> {
    let profile = profile::update_profile(state.store.as_ref(), user.id, &payload).await?;
    Ok(Json(json!({ "success": true, "user": profile })))
}

pub async fn delete_profile(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<Value>, AppError> {
    profile::delete_profile(state.store.as_ref(), user.id).await?;
    Ok(Json(json!({ "success": true, "message": "Account deleted" })))
}
