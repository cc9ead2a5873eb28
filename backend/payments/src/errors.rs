//! Application-wide error types.

use axum::http::StatusCode;
use thiserror::Error;

use crate::types::ManualStatus;

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    // ── input validation ────────────────────────────────
    #[error("Invalid amount: {0}")]
    InvalidAmount(i64),

    #[error("Missing payment data: {0}")]
    MissingPaymentData(&'static str),

    #[error("Missing payment evidence")]
    MissingEvidence,

    #[error("Unsupported evidence type: {0}")]
    UnsupportedEvidence(String),

    #[error("Malformed webhook payload: {0}")]
    MalformedPayload(String),

    // ── trust / integrity ───────────────────────────────
    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Order mismatch: {0}")]
    OrderMismatch(String),

    // ── authorization ───────────────────────────────────
    #[error("Missing caller identity")]
    Unauthenticated,

    #[error("Forbidden")]
    Forbidden,

    // ── state conflict ──────────────────────────────────
    #[error("Manual payment {id} is already {current}")]
    InvalidTransition { id: String, current: ManualStatus },

    #[error("Payment intent {0} was already consumed by another payment")]
    IntentConsumed(String),

    #[error("Pledged total of project {0} cannot absorb this amount")]
    PledgeOverflow(String),

    #[error("{0} not found")]
    NotFound(String),

    // ── external dependencies ───────────────────────────
    #[error("Payment gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("Blob storage error: {0}")]
    Storage(String),

    #[error("Delivery error: {0}")]
    Delivery(String),

    #[error("Receipt rendering error: {0}")]
    Render(String),
}

impl PaymentError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidAmount(_)
            | Self::MissingPaymentData(_)
            | Self::MissingEvidence
            | Self::UnsupportedEvidence(_)
            | Self::MalformedPayload(_)
            | Self::InvalidSignature
            | Self::OrderMismatch(_) => StatusCode::BAD_REQUEST,
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidTransition { .. }
            | Self::IntentConsumed(_)
            | Self::PledgeOverflow(_) => StatusCode::CONFLICT,
            Self::GatewayUnavailable(_) => StatusCode::BAD_GATEWAY,
            Self::Database(_)
            | Self::Migrate(_)
            | Self::Http(_)
            | Self::Json(_)
            | Self::Io(_)
            | Self::Config(_)
            | Self::Storage(_)
            | Self::Delivery(_)
            | Self::Render(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message that is safe to hand back to a caller. Internal failures are
    /// collapsed so storage and driver details stay server-side.
    pub fn public_message(&self) -> String {
        match self {
            Self::GatewayUnavailable(_) => "Payment system unavailable".to_string(),
            e if e.status_code().is_server_error() => "Internal error".to_string(),
            e => e.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PaymentError>;
