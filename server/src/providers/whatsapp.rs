//! Outbound WhatsApp messages

use crate::error::{AppError, Result};
use async_trait::async_trait;
use serde::Serialize;

#[async_trait]
pub trait WhatsAppProvider: Send + Sync {
    async fn send_whatsapp(
        &self,
        phone: &str,
        text: &str,
        message_id: &str,
        is_emergency: bool,
    ) -> Result<()>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SendWhatsAppBody<'a> {
    to: &'a str,
    text: &'a str,
    message_id: &'a str,
    is_emergency: bool,
}

/// Relays messages to a WhatsApp gateway endpoint
pub struct HttpWhatsAppProvider {
    client: reqwest::Client,
    api_url: String,
    token: Option<String>,
}

impl HttpWhatsAppProvider {
    pub fn new(api_url: String, token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("EchoVault/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            api_url,
            token,
        })
    }
}

#[async_trait]
impl WhatsAppProvider for HttpWhatsAppProvider {
    async fn send_whatsapp(
        &self,
        phone: &str,
        text: &str,
        message_id: &str,
        is_emergency: bool,
    ) -> Result<()> {
        let mut request = self.client.post(&self.api_url).json(&SendWhatsAppBody {
            to: phone,
            text,
            message_id,
            is_emergency,
        });
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AppError::TransientDelivery(format!("whatsapp to {}: {}", phone, e)))?;

        if !response.status().is_success() {
            return Err(AppError::TransientDelivery(format!(
                "whatsapp gateway returned {}",
                response.status()
            )));
        }

        tracing::debug!("WhatsApp message for {} accepted", message_id);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct LogWhatsAppProvider;

#[async_trait]
impl WhatsAppProvider for LogWhatsAppProvider {
    async fn send_whatsapp(
        &self,
        phone: &str,
        _text: &str,
        message_id: &str,
        is_emergency: bool,
    ) -> Result<()> {
        tracing::info!(
            "WhatsApp gateway not configured; would notify {} about {} (emergency: {})",
            phone,
            message_id,
            is_emergency
        );
        Ok(())
    }
}
