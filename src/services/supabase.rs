//! Client for the Supabase auth (GoTrue) REST API.
//!
//! Only the password, magic-link and logout flows are used; sessions are
//! verified locally by `middlewares::auth::SessionVerifier`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::json;
use sqlx::types::Uuid;
use thiserror::Error;

use crate::config::SupabaseConfig;
use crate::error::AppError;
use crate::models::SignInRequest;
use crate::services::validation::{required, Email, ValidationError};

const MIN_PASSWORD_LEN: usize = 6;

#[derive(Debug, Error)]
pub enum AuthProviderError {
    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Auth provider rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Auth provider unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Invalid auth provider URL: {0}")]
    Url(String),
}

impl From<AuthProviderError> for AppError {
    fn from(err: AuthProviderError) -> Self {
        match err {
            AuthProviderError::InvalidCredentials => {
                AppError::Unauthorized("Invalid email or password".into())
            }
            AuthProviderError::Rejected { status, message } if (400..500).contains(&status) => {
                AppError::Validation(message)
            }
            other => {
                tracing::warn!(error = %other, "auth provider call failed");
                AppError::Upstream("Authentication service unavailable".into())
            }
        }
    }
}

/// Validated sign-in form.
#[derive(Debug, Clone, PartialEq)]
pub struct SignInInput {
    pub email: Email,
    pub password: String,
}

impl SignInInput {
    pub fn parse(req: &SignInRequest) -> Result<Self, ValidationError> {
        let email = Email::parse(required(&req.email, "email")?)?;
        // Passwords are not trimmed
        let password = match req.password.as_deref() {
            None | Some("") => return Err(ValidationError::Missing("password")),
            Some(p) => p,
        };
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(ValidationError::Invalid {
                field: "password",
                reason: "must be at least 6 characters",
            });
        }
        Ok(SignInInput {
            email,
            password: password.to_string(),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionUser {
    pub id: Uuid,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    pub user: SessionUser,
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn sign_in_with_password(&self, input: &SignInInput) -> Result<Session, AuthProviderError>;

    async fn send_magic_link(
        &self,
        email: &Email,
        redirect_to: Option<&str>,
    ) -> Result<(), AuthProviderError>;

    async fn verify_otp(&self, email: &Email, token: &str) -> Result<Session, AuthProviderError>;

    async fn sign_out(&self, access_token: &str) -> Result<(), AuthProviderError>;
}

#[derive(Debug, Deserialize)]
struct ProviderErrorBody {
    error_description: Option<String>,
    msg: Option<String>,
    message: Option<String>,
    error: Option<String>,
}

pub struct SupabaseAuth {
    client: Client,
    base_url: String,
    anon_key: String,
}

impl SupabaseAuth {
    pub fn new(config: &SupabaseConfig) -> Result<Self, AuthProviderError> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            client,
            base_url: format!("{}/auth/v1", config.url.trim_end_matches('/')),
            anon_key: config.anon_key.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn rejection(response: reqwest::Response) -> AuthProviderError {
        let status = response.status();
        let message = match response.json::<ProviderErrorBody>().await {
            Ok(body) => body
                .error_description
                .or(body.msg)
                .or(body.message)
                .or(body.error)
                .unwrap_or_else(|| status.to_string()),
            Err(_) => status.to_string(),
        };
        AuthProviderError::Rejected {
            status: status.as_u16(),
            message,
        }
    }

    async fn session(&self, url: &str, body: serde_json::Value) -> Result<Session, AuthProviderError> {
        let response = self
            .client
            .post(url)
            .header("apikey", &self.anon_key)
            .json(&body)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(response.json::<Session>().await?),
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                tracing::debug!(status = %response.status(), "credentials rejected");
                Err(AuthProviderError::InvalidCredentials)
            }
            _ => Err(Self::rejection(response).await),
        }
    }
}

#[async_trait]
impl AuthProvider for SupabaseAuth {
    async fn sign_in_with_password(&self, input: &SignInInput) -> Result<Session, AuthProviderError> {
        self.session(
            &self.endpoint("token?grant_type=password"),
            json!({ "email": input.email.as_str(), "password": input.password }),
        )
        .await
    }

    async fn send_magic_link(
        &self,
        email: &Email,
        redirect_to: Option<&str>,
    ) -> Result<(), AuthProviderError> {
        let url = match redirect_to {
            Some(redirect) => Url::parse_with_params(&self.endpoint("otp"), &[("redirect_to", redirect)]),
            None => Url::parse(&self.endpoint("otp")),
        }
        .map_err(|e| AuthProviderError::Url(e.to_string()))?;

        let response = self
            .client
            .post(url)
            .header("apikey", &self.anon_key)
            .json(&json!({ "email": email.as_str(), "create_user": true }))
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::rejection(response).await)
        }
    }

    async fn verify_otp(&self, email: &Email, token: &str) -> Result<Session, AuthProviderError> {
        self.session(
            &self.endpoint("verify"),
            json!({ "type": "magiclink", "email": email.as_str(), "token": token }),
        )
        .await
    }

    async fn sign_out(&self, access_token: &str) -> Result<(), AuthProviderError> {
        let response = self
            .client
            .post(self.endpoint("logout"))
            .header("apikey", &self.anon_key)
            .bearer_auth(access_token)
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::rejection(response).await)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign_in(email: Option<&str>, password: Option<&str>) -> SignInRequest {
        SignInRequest {
            email: email.map(Into::into),
            password: password.map(Into::into),
        }
    }

    #[test]
    fn sign_in_input_validation() {
        let input = SignInInput::parse(&sign_in(Some(" Meron@Example.com"), Some("secret1"))).unwrap();
        assert_eq!(input.email.as_str(), "meron@example.com");

        assert_eq!(
            SignInInput::parse(&sign_in(None, Some("secret1"))),
            Err(ValidationError::Missing("email"))
        );
        assert_eq!(
            SignInInput::parse(&sign_in(Some("meron@example.com"), None)),
            Err(ValidationError::Missing("password"))
        );
        assert!(SignInInput::parse(&sign_in(Some("meron@example.com"), Some("12345"))).is_err());
        assert!(SignInInput::parse(&sign_in(Some("meron"), Some("secret1"))).is_err());
    }

    #[test]
    fn provider_errors_map_to_http() {
        let err: AppError = AuthProviderError::InvalidCredentials.into();
        assert_eq!(err.status(), axum::http::StatusCode::UNAUTHORIZED);

        let err: AppError = AuthProviderError::Rejected {
            status: 422,
            message: "Email rate limit exceeded".into(),
        }
        .into();
        assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);

        let err: AppError = AuthProviderError::Rejected {
            status: 503,
            message: "down".into(),
        }
        .into();
        assert_eq!(err.status(), axum::http::StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn endpoints_are_rooted_at_auth_v1() {
        let auth = SupabaseAuth::new(&SupabaseConfig {
            url: "https://project.supabase.co/".into(),
            anon_key: "anon".into(),
            jwt_secret: "secret".into(),
        })
        .unwrap();
        assert_eq!(
            auth.endpoint("token?grant_type=password"),
            "https://project.supabase.co/auth/v1/token?grant_type=password"
        );
    }
}
