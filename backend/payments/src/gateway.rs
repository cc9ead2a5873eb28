//! Payment gateway client. Creates orders on a Razorpay-compatible REST API.
//!
//! Order creation is the only outbound gateway call this service makes.
//! Confirmations arrive inbound (browser callback, webhook) and are checked
//! with [`crate::signature`].
//!
//! Nothing here retries: a failed call surfaces as
//! [`PaymentError::GatewayUnavailable`] and the donor simply asks again.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::config::Config;
use crate::errors::{PaymentError, Result};

/// What we ask the gateway for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderRequest {
    pub amount: i64,
    pub currency: String,
    /// Our intent id; echoed back by the gateway as the order receipt.
    pub intent_id: String,
    pub project_id: String,
}

/// What the gateway hands back.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GatewayOrder {
    pub id: String,
    pub amount: i64,
    pub currency: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_order(&self, req: &OrderRequest) -> Result<GatewayOrder>;

    /// Public key the checkout widget is initialised with.
    fn public_key(&self) -> Option<String>;
}

// ─────────────────────────────────────────────────────────
// REST response shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: GatewayErrorBody,
}

#[derive(Debug, Deserialize)]
struct GatewayErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateOrderBody<'a> {
    amount: i64,
    currency: &'a str,
    receipt: &'a str,
    notes: serde_json::Value,
}

// ─────────────────────────────────────────────────────────
// HTTP implementation
// ─────────────────────────────────────────────────────────

pub struct HttpGateway {
    client: Client,
    base_url: String,
    key_id: Option<String>,
    key_secret: Option<String>,
}

impl HttpGateway {
    pub fn new(client: Client, config: &Config) -> Self {
        Self {
            client,
            base_url: config.gateway_api_url.trim_end_matches('/').to_string(),
            key_id: config.gateway_key_id.clone(),
            key_secret: config.gateway_key_secret.clone(),
        }
    }

    pub fn build_client(config: &Config) -> Result<Client> {
        Ok(Client::builder()
            .timeout(Duration::from_secs(config.gateway_timeout_secs))
            .build()?)
    }
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    async fn create_order(&self, req: &OrderRequest) -> Result<GatewayOrder> {
        let (Some(key_id), Some(key_secret)) = (&self.key_id, &self.key_secret) else {
            return Err(PaymentError::GatewayUnavailable(
                "gateway credentials are not configured".to_string(),
            ));
        };

        let body = CreateOrderBody {
            amount: req.amount,
            currency: &req.currency,
            receipt: &req.intent_id,
            notes: json!({
                "project_id": req.project_id,
                "intent_id": req.intent_id,
            }),
        };

        let response = self
            .client
            .post(format!("{}/orders", self.base_url))
            .basic_auth(key_id, Some(key_secret))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                warn!("Gateway order request failed: {e}");
                PaymentError::GatewayUnavailable(e.to_string())
            })?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| PaymentError::GatewayUnavailable(e.to_string()))?;

        if !status.is_success() {
            let detail = describe_error(&bytes);
            warn!(%status, "Gateway rejected order: {detail}");
            return Err(PaymentError::GatewayUnavailable(format!("{status}: {detail}")));
        }

        let order: GatewayOrder = serde_json::from_slice(&bytes).map_err(|e| {
            PaymentError::GatewayUnavailable(format!("unreadable order response: {e}"))
        })?;

        if order.amount != req.amount || !order.currency.eq_ignore_ascii_case(&req.currency) {
            return Err(PaymentError::GatewayUnavailable(format!(
                "gateway created order {} for {} {} instead of {} {}",
                order.id, order.amount, order.currency, req.amount, req.currency
            )));
        }

        debug!(order_id = %order.id, "Gateway order created");
        Ok(order)
    }

    fn public_key(&self) -> Option<String> {
        self.key_id.clone()
    }
}

fn describe_error(body: &[u8]) -> String {
    match serde_json::from_slice::<ErrorEnvelope>(body) {
        Ok(env) => format!(
            "{} {}",
            env.error.code.unwrap_or_else(|| "UNKNOWN".to_string()),
            env.error.description.unwrap_or_default()
        )
        .trim()
        .to_string(),
        Err(_) => String::from_utf8_lossy(body).chars().take(200).collect(),
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
