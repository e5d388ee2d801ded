//! Outbound email

use crate::error::{AppError, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;

#[async_trait]
pub trait EmailProvider: Send + Sync {
    async fn send_email(
        &self,
        to: &str,
        subject: &str,
        html: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<()>;
}

#[derive(Serialize)]
struct SendEmailBody<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
    #[serde(skip_serializing_if = "no_headers")]
    headers: &'a BTreeMap<String, String>,
}

fn no_headers(headers: &&BTreeMap<String, String>) -> bool {
    headers.is_empty()
}

/// Transactional email over a JSON HTTP API (Resend-compatible)
pub struct HttpEmailProvider {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    from: String,
}

impl HttpEmailProvider {
    pub fn new(api_url: String, api_key: String, from: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("EchoVault/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            api_url,
            api_key,
            from,
        })
    }
}

#[async_trait]
impl EmailProvider for HttpEmailProvider {
    async fn send_email(
        &self,
        to: &str,
        subject: &str,
        html: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<()> {
        let body = SendEmailBody {
            from: &self.from,
            to: [to],
            subject,
            html,
            headers,
        };

        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::TransientDelivery(format!("email to {}: {}", to, e)))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AppError::TransientDelivery(format!(
                "email provider returned {}: {}",
                status, detail
            )));
        }

        tracing::debug!("Email accepted for {}", to);
        Ok(())
    }
}

/// Used when no email API key is configured; logs instead of sending
#[derive(Debug, Default)]
pub struct LogEmailProvider;

#[async_trait]
impl EmailProvider for LogEmailProvider {
    async fn send_email(
        &self,
        to: &str,
        subject: &str,
        _html: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<()> {
        tracing::info!(
            "Email provider not configured; would send \"{}\" to {} ({} headers)",
            subject,
            to,
            headers.len()
        );
        Ok(())
    }
}
