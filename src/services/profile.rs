use sqlx::types::Uuid;

use crate::error::AppError;
use crate::models::{UpdateProfileRequest, User};
use crate::services::validation::{bounded_text, ValidationError};
use crate::store::{ProfileUpdate, Store};

const MAX_FULL_NAME: usize = 120;
const MAX_REGION: usize = 64;
const FAN_DIGITS: usize = 16;

/// Ethiopian mobile number, normalized to `+2519XXXXXXXX` / `+2517XXXXXXXX`.
pub fn normalize_phone(raw: &str) -> Result<String, ValidationError> {
    let compact: String = raw.chars().filter(|c| !matches!(c, ' ' | '-')).collect();
    let subscriber = compact
        .strip_prefix("+251")
        .or_else(|| compact.strip_prefix('0'));

    match subscriber {
        Some(rest)
            if rest.len() == 9
                && matches!(rest.as_bytes()[0], b'9' | b'7')
                && rest.bytes().all(|b| b.is_ascii_digit()) =>
        {
            Ok(format!("+251{rest}"))
        }
        _ => Err(ValidationError::InvalidFormat {
            field: "phone",
            value: raw.trim().to_string(),
            expected: "+2519XXXXXXXX, +2517XXXXXXXX, 09XXXXXXXX or 07XXXXXXXX",
        }),
    }
}

/// 16-digit FAN, spaces ignored.
pub fn normalize_fan(raw: &str) -> Result<String, ValidationError> {
    let digits: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.len() == FAN_DIGITS && digits.bytes().all(|b| b.is_ascii_digit()) {
        Ok(digits)
    } else {
        Err(ValidationError::InvalidFormat {
            field: "fanNumber",
            value: raw.trim().to_string(),
            expected: "16 digits",
        })
    }
}

pub fn parse_profile_update(req: &UpdateProfileRequest) -> Result<ProfileUpdate, ValidationError> {
    let update = ProfileUpdate {
        full_name: req
            .full_name
            .as_deref()
            .map(|v| bounded_text(v, "fullName", MAX_FULL_NAME))
            .transpose()?,
        phone: req.phone.as_deref().map(normalize_phone).transpose()?,
        fan_number: req.fan_number.as_deref().map(normalize_fan).transpose()?,
        region: req
            .region
            .as_deref()
            .map(|v| bounded_text(v, "region", MAX_REGION))
            .transpose()?,
    };

    if update.full_name.is_none()
        && update.phone.is_none()
        && update.fan_number.is_none()
        && update.region.is_none()
    {
        return Err(ValidationError::Invalid {
            field: "profile",
            reason: "no fields to update",
        });
    }
    Ok(update)
}

pub async fn get_profile(store: &dyn Store, user_id: Uuid) -> Result<User, AppError> {
    store
        .get_user(user_id)
        .await?
        .ok_or_else(|| AppError::not_found("User not found"))
}

pub async fn update_profile(
    store: &dyn Store,
    user_id: Uuid,
    req: &UpdateProfileRequest,
) -> Result<User, AppError> {
    let update = parse_profile_update(req)?;
    store
        .update_profile(user_id, &update)
        .await?
        .ok_or_else(|| AppError::not_found("User not found"))
}

pub async fn delete_profile(store: &dyn Store, user_id: Uuid) -> Result<(), AppError> {
    if !store.soft_delete_user(user_id).await? {
        return Err(AppError::not_found("User not found"));
    }
    tracing::info!(%user_id, "user soft-deleted");
    Ok(())
}
