use axum::{
    extract::{Extension, State},
    Json,
};
use serde_json::{json, Value};

use crate::error::AppError;
use crate::extract::ApiQuery;
use crate::middlewares::auth::AuthUser;
use crate::models::TransactionsQuery;
use crate::services::validation::parse_uuid;
use crate::state::AppState;
use crate::store::TransactionFilter;

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 200;

pub async fn list_transactions(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    ApiQuery(params): ApiQuery<TransactionsQuery>,
) -> Result<Json<Value>, AppError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT);
    if !(1..=MAX_LIMIT).contains(&limit) {
        return Err(AppError::validation(format!(
            "limit must be between 1 and {MAX_LIMIT}"
        )));
    }

    let account_id = match params.account_id.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => {
            let id = parse_uuid(raw, "accountId")?;
            if state.store.get_account(user.id, id).await?.is_none() {
                return Err(AppError::not_found("Bank account not found"));
            }
            Some(id)
        }
    };

    let transactions = state
        .store
        .list_transactions(&TransactionFilter {
            user_id: user.id,
            account_id,
            limit: Some(limit),
            ..Default::default()
        })
        .await?;

    Ok(Json(json!({
        "success": true,
        "count": transactions.len(),
        "transactions": transactions
    })))
}
