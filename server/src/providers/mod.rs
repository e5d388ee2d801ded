//! Delivery channels
//!
//! Email is the required channel; WhatsApp is optional per condition.

pub mod email;
pub mod whatsapp;

pub use email::{EmailProvider, HttpEmailProvider, LogEmailProvider};
pub use whatsapp::{HttpWhatsAppProvider, LogWhatsAppProvider, WhatsAppProvider};

use crate::config::ServerConfig;
use crate::error::Result;
use std::sync::Arc;

/// Build the email provider from configuration
pub fn email_from_config(config: &ServerConfig) -> Result<Arc<dyn EmailProvider>> {
    match &config.email_api_key {
        Some(key) => {
            tracing::info!("Email delivery via {}", config.email_api_url);
            Ok(Arc::new(HttpEmailProvider::new(
                config.email_api_url.clone(),
                key.clone(),
                config.email_from.clone(),
            )?))
        }
        None => {
            tracing::warn!("EMAIL_API_KEY not set; emails will only be logged");
            Ok(Arc::new(LogEmailProvider))
        }
    }
}

pub fn whatsapp_from_config(config: &ServerConfig) -> Result<Arc<dyn WhatsAppProvider>> {
    match &config.whatsapp_api_url {
        Some(url) if config.whatsapp_configured() => Ok(Arc::new(HttpWhatsAppProvider::new(
            url.clone(),
            config.whatsapp_token.clone(),
        )?)),
        _ => Ok(Arc::new(LogWhatsAppProvider)),
    }
}
