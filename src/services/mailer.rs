use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;

use crate::config::MailConfig;
use crate::error::AppError;

#[derive(Debug, Error)]
pub enum MailError {
    #[error("Mail provider returned HTTP {0}")]
    Rejected(u16),

    #[error("Mail provider unreachable: {0}")]
    Transport(#[from] reqwest::Error),
}

impl From<MailError> for AppError {
    fn from(err: MailError) -> Self {
        tracing::warn!(error = %err, "statement email not sent");
        AppError::Upstream("Failed to send email".into())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OutgoingMail {
    pub to: String,
    pub subject: String,
    pub html: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, mail: &OutgoingMail) -> Result<(), MailError>;
}

/// Posts JSON to a transactional mail API with a bearer key.
pub struct HttpMailer {
    client: Client,
    config: MailConfig,
}

#[derive(Serialize)]
struct Payload<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    html: &'a str,
}

impl HttpMailer {
    pub fn new(config: MailConfig) -> Result<Self, MailError> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    async fn send(&self, mail: &OutgoingMail) -> Result<(), MailError> {
        let response = self
            .client
            .post(&self.config.api_url)
            .bearer_auth(&self.config.api_key)
            .json(&Payload {
                from: &self.config.from,
                to: &mail.to,
                subject: &mail.subject,
                html: &mail.html,
            })
            .send()
            .await?;

        if response.status().is_success() {
            tracing::info!(to = %mail.to, "email sent");
            Ok(())
        } else {
            Err(MailError::Rejected(response.status().as_u16()))
        }
    }
}
