//! Application configuration loaded from environment variables.

use std::str::FromStr;

use crate::errors::{PaymentError, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// ISO currency code every order and contribution is denominated in
    pub currency: String,
    /// Base URL of the gateway REST API (e.g. https://api.razorpay.com/v1)
    pub gateway_api_url: String,
    /// Public key id; also handed to the checkout widget
    pub gateway_key_id: Option<String>,
    /// Secret for API basic auth and for checkout signatures
    pub gateway_key_secret: Option<String>,
    /// Secret the gateway signs webhook bodies with
    pub webhook_secret: Option<String>,
    /// Header carrying the webhook body signature
    pub webhook_signature_header: String,
    pub gateway_timeout_secs: u64,
    /// Inclusive order bounds, in the smallest currency unit
    pub min_order_amount: i64,
    pub max_order_amount: i64,
    /// Window in which an unconsumed intent is handed out again instead of
    /// creating a fresh gateway order
    pub intent_reuse_secs: i64,
    /// Directory backing the blob store
    pub blob_dir: String,
    /// Public URL prefix the blob directory is served under
    pub blob_public_url: String,
    pub max_evidence_bytes: usize,
    pub mail_api_url: String,
    pub mail_api_key: Option<String>,
    pub mail_from: String,
    /// How often (in seconds) to reconcile pledged totals; 0 disables
    pub reconcile_interval_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let port = env_or("API_PORT", "3001");
        let config = Config {
            database_url: env_or("DATABASE_URL", "sqlite:./payments.db"),
            api_port: parse("API_PORT", &port)?,
            currency: env_or("CURRENCY", "INR"),
            gateway_api_url: env_or("GATEWAY_API_URL", "https://api.razorpay.com/v1"),
            gateway_key_id: env_opt("GATEWAY_KEY_ID"),
            gateway_key_secret: env_opt("GATEWAY_KEY_SECRET"),
            webhook_secret: env_opt("GATEWAY_WEBHOOK_SECRET"),
            webhook_signature_header: env_or("WEBHOOK_SIGNATURE_HEADER", "x-razorpay-signature")
                .to_ascii_lowercase(),
            gateway_timeout_secs: parse("GATEWAY_TIMEOUT_SECS", &env_or("GATEWAY_TIMEOUT_SECS", "15"))?,
            min_order_amount: parse("MIN_ORDER_AMOUNT", &env_or("MIN_ORDER_AMOUNT", "100"))?,
            max_order_amount: parse("MAX_ORDER_AMOUNT", &env_or("MAX_ORDER_AMOUNT", "50000000"))?,
            intent_reuse_secs: parse("INTENT_REUSE_SECS", &env_or("INTENT_REUSE_SECS", "900"))?,
            blob_dir: env_or("BLOB_DIR", "./blobs"),
            blob_public_url: env_or("BLOB_PUBLIC_URL", &format!("http://localhost:{port}/blobs")),
            max_evidence_bytes: parse(
                "MAX_EVIDENCE_BYTES",
                &env_or("MAX_EVIDENCE_BYTES", "5242880"),
            )?,
            mail_api_url: env_or("MAIL_API_URL", "https://api.resend.com/emails"),
            mail_api_key: env_opt("MAIL_API_KEY"),
            mail_from: env_or("MAIL_FROM", "Fundora <no-reply@fundora.app>"),
            reconcile_interval_secs: parse(
                "RECONCILE_INTERVAL_SECS",
                &env_or("RECONCILE_INTERVAL_SECS", "300"),
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.min_order_amount <= 0 || self.max_order_amount < self.min_order_amount {
            return Err(PaymentError::Config(format!(
                "Invalid order bounds: [{}, {}]",
                self.min_order_amount, self.max_order_amount
            )));
        }
        if self.currency.len() != 3 {
            return Err(PaymentError::Config(format!(
                "Invalid CURRENCY: {}",
                self.currency
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
impl Default for Config {
    fn default() -> Self {
        Config {
            database_url: "sqlite::memory:".to_string(),
            api_port: 3001,
            currency: "INR".to_string(),
            gateway_api_url: "http://gateway.invalid/v1".to_string(),
            gateway_key_id: Some("rzp_test_key".to_string()),
            gateway_key_secret: Some("checkout_secret".to_string()),
            webhook_secret: Some("webhook_secret".to_string()),
            webhook_signature_header: "x-razorpay-signature".to_string(),
            gateway_timeout_secs: 5,
            min_order_amount: 1,
            max_order_amount: 10_000_000,
            intent_reuse_secs: 900,
            blob_dir: "./blobs".to_string(),
            blob_public_url: "https://blobs.test".to_string(),
            max_evidence_bytes: 1024 * 1024,
            mail_api_url: "http://mail.invalid".to_string(),
            mail_api_key: None,
            mail_from: "Fundora <no-reply@fundora.test>".to_string(),
            reconcile_interval_secs: 0,
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| PaymentError::Config(format!("Invalid {key}")))
}
