//! Outbound e-mail for receipt delivery.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::debug;

use crate::config::Config;
use crate::errors::{PaymentError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    pub to: String,
    pub subject: String,
    pub html: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &Email) -> Result<()>;
}

/// Posts `{from, to, subject, html}` to a transactional mail API.
pub struct HttpMailer {
    client: Client,
    api_url: String,
    api_key: Option<String>,
    from: String,
}

impl HttpMailer {
    pub fn new(client: Client, config: &Config) -> Self {
        Self {
            client,
            api_url: config.mail_api_url.clone(),
            api_key: config.mail_api_key.clone(),
            from: config.mail_from.clone(),
        }
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    async fn send(&self, email: &Email) -> Result<()> {
        let Some(api_key) = &self.api_key else {
            return Err(PaymentError::Delivery(
                "mail delivery is not configured".to_string(),
            ));
        };

        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(api_key)
            .json(&json!({
                "from": self.from,
                "to": [email.to],
                "subject": email.subject,
                "html": email.html,
            }))
            .send()
            .await
            .map_err(|e| PaymentError::Delivery(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PaymentError::Delivery(format!(
                "mail API answered {status}"
            )));
        }
        debug!(to = %email.to, "Email accepted by mail API");
        Ok(())
    }
}
