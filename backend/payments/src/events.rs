//! Gateway webhook event types.
//!
//! Only the fields the ledger needs are modelled; everything else in the
//! gateway's envelope is ignored by serde.

use serde::Deserialize;
use serde_json::Value;

/// All recognised webhook event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Funds were captured for a payment (`payment.captured`).
    PaymentCaptured,
    /// A payment attempt failed (`payment.failed`).
    PaymentFailed,
    /// A refund was processed (`refund.processed`).
    RefundProcessed,
    /// Anything else the gateway is configured to send.
    Unknown,
}

impl EventKind {
    pub fn from_name(name: &str) -> Self {
        match name {
            "payment.captured" => Self::PaymentCaptured,
            "payment.failed" => Self::PaymentFailed,
            "refund.processed" => Self::RefundProcessed,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PaymentCaptured => "payment.captured",
            Self::PaymentFailed => "payment.failed",
            Self::RefundProcessed => "refund.processed",
            Self::Unknown => "unknown",
        }
    }
}

/// The webhook envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayEvent {
    pub event: String,
    #[serde(default)]
    pub payload: EventPayload,
}

impl GatewayEvent {
    pub fn kind(&self) -> EventKind {
        EventKind::from_name(&self.event)
    }

    pub fn payment(&self) -> Option<&PaymentEntity> {
        self.payload.payment.as_ref().map(|w| &w.entity)
    }

    pub fn refund(&self) -> Option<&RefundEntity> {
        self.payload.refund.as_ref().map(|w| &w.entity)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventPayload {
    #[serde(default)]
    pub payment: Option<EntityWrapper<PaymentEntity>>,
    #[serde(default)]
    pub refund: Option<EntityWrapper<RefundEntity>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntityWrapper<T> {
    pub entity: T,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentEntity {
    pub id: String,
    #[serde(default)]
    pub order_id: Option<String>,
    pub amount: i64,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
    #[serde(default)]
    pub notes: Value,
}

impl PaymentEntity {
    /// Project id the checkout attached to the payment notes, if any.
    pub fn project_hint(&self) -> Option<String> {
        extract_field(&self.notes, &["project_id", "projectId"])
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefundEntity {
    pub id: String,
    #[serde(default)]
    pub payment_id: Option<String>,
    #[serde(default)]
    pub amount: Option<i64>,
}

fn extract_field(value: &Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(v) = value.get(key) {
            let s = match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            };
            if let Some(s) = s.filter(|s| !s.is_empty()) {
                return Some(s);
            }
        }
    }
    None
}
