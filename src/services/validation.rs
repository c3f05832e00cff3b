//! Request validation primitives.
//!
//! Raw request bodies arrive with every field optional; these helpers turn
//! them into typed values or a `ValidationError` naming the offending field.

use std::fmt;

use rust_decimal::Decimal;
use sqlx::types::Uuid;

use crate::error::AppError;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    Missing(&'static str),

    #[error("Invalid {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },

    #[error("Invalid format for {field}: '{value}' (expected: {expected})")]
    InvalidFormat {
        field: &'static str,
        value: String,
        expected: &'static str,
    },
}

impl From<ValidationError> for AppError {
    fn from(err: ValidationError) -> Self {
        AppError::Validation(err.to_string())
    }
}

pub fn required<'a>(value: &'a Option<String>, field: &'static str) -> Result<&'a str, ValidationError> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ValidationError::Missing(field)),
    }
}

pub fn parse_uuid(value: &str, field: &'static str) -> Result<Uuid, ValidationError> {
    Uuid::parse_str(value.trim()).map_err(|_| ValidationError::InvalidFormat {
        field,
        value: value.to_string(),
        expected: "UUID",
    })
}

pub fn required_uuid(value: &Option<String>, field: &'static str) -> Result<Uuid, ValidationError> {
    parse_uuid(required(value, field)?, field)
}

/// Non-empty after trimming and at most `max` characters.
pub fn bounded_text(value: &str, field: &'static str, max: usize) -> Result<String, ValidationError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ValidationError::Missing(field));
    }
    if value.chars().count() > max {
        return Err(ValidationError::Invalid {
            field,
            reason: "too long",
        });
    }
    Ok(value.to_string())
}

/// Optional free text: blank collapses to `None`.
pub fn optional_text(value: &Option<String>, field: &'static str, max: usize) -> Result<Option<String>, ValidationError> {
    match value.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(v) => bounded_text(v, field, max).map(Some),
    }
}

/// Positive, at most two decimal places, not above `max`.
pub fn validate_amount(amount: Decimal, max: Decimal) -> Result<Decimal, ValidationError> {
    if amount <= Decimal::ZERO {
        return Err(ValidationError::Invalid {
            field: "amount",
            reason: "must be greater than zero",
        });
    }
    if amount > max {
        return Err(ValidationError::Invalid {
            field: "amount",
            reason: "exceeds the maximum allowed",
        });
    }
    if amount.normalize().scale() > 2 {
        return Err(ValidationError::Invalid {
            field: "amount",
            reason: "more than two decimal places",
        });
    }
    Ok(amount.round_dp(2))
}

/// Syntactically plausible email address, lowercased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email(String);

impl Email {
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let email = raw.trim().to_ascii_lowercase();
        let invalid = || ValidationError::InvalidFormat {
            field: "email",
            value: raw.trim().to_string(),
            expected: "name@domain.tld",
        };

        let (local, domain) = email.split_once('@').ok_or_else(invalid)?;
        if local.is_empty()
            || domain.contains('@')
            || email.chars().any(char::is_whitespace)
            || email.len() > 254
        {
            return Err(invalid());
        }
        match domain.rsplit_once('.') {
            Some((host, tld)) if !host.is_empty() && tld.len() >= 2 => Ok(Email(email)),
            _ => Err(invalid()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Email {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Three uppercase letters followed by 9 to 13 digits, e.g. `CBE1000123456789`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountNumber(String);

impl AccountNumber {
    pub const MIN_DIGITS: usize = 9;
    pub const MAX_DIGITS: usize = 13;

    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let value = raw.trim();
        let valid = value.is_ascii() && value.len() > 3 && {
            let (prefix, digits) = value.split_at(3);
            prefix.chars().all(|c| c.is_ascii_uppercase())
                && (Self::MIN_DIGITS..=Self::MAX_DIGITS).contains(&digits.len())
                && digits.chars().all(|c| c.is_ascii_digit())
        };

        if !valid {
            return Err(ValidationError::InvalidFormat {
                field: "accountNumber",
                value: value.to_string(),
                expected: "3 uppercase letters followed by 9-13 digits",
            });
        }
        Ok(AccountNumber(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_number_format() {
        assert!(AccountNumber::parse("CBE100012345").is_ok());
        assert!(AccountNumber::parse("AWB1234567890123").is_ok());
        assert!(AccountNumber::parse("cbe100012345").is_err());
        assert!(AccountNumber::parse("CB1100012345").is_err());
        assert!(AccountNumber::parse("CBE12345678").is_err());
        assert!(AccountNumber::parse("CBE12345678901234").is_err());
        assert!(AccountNumber::parse("CBE").is_err());
        assert!(AccountNumber::parse("").is_err());
        // Multi-byte input must not panic on the prefix split
        assert!(AccountNumber::parse("ኢት123456789").is_err());
    }

    #[test]
    fn amount_bounds() {
        let max = Decimal::from(100_000);
        assert!(validate_amount(Decimal::ZERO, max).is_err());
        assert!(validate_amount(Decimal::from(-5), max).is_err());
        assert!(validate_amount(Decimal::from(100_001), max).is_err());
        assert_eq!(validate_amount(max, max).unwrap(), max);
        assert!(validate_amount(Decimal::new(1005, 3), max).is_err());
        assert_eq!(
            validate_amount(Decimal::new(12_500, 3), max).unwrap(),
            Decimal::new(1250, 2)
        );
    }

    #[test]
    fn email_shape() {
        assert_eq!(
            Email::parse("  Tigist@Example.com ").unwrap().as_str(),
            "tigist@example.com"
        );
        assert!(Email::parse("tigist").is_err());
        assert!(Email::parse("@example.com").is_err());
        assert!(Email::parse("tigist@example").is_err());
        assert!(Email::parse("ti gist@example.com").is_err());
    }

    #[test]
    fn required_trims_and_rejects_blank() {
        assert_eq!(required(&Some(" x ".into()), "f").unwrap(), "x");
        assert_eq!(
            required(&Some("   ".into()), "f"),
            Err(ValidationError::Missing("f"))
        );
        assert_eq!(required(&None, "f"), Err(ValidationError::Missing("f")));
    }
}
