//! Persisted records of the funding ledger and the payment admission paths.

use std::fmt;

use serde::{Deserialize, Serialize};

/// How a contribution entered the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "lowercase")]
pub enum Origin {
    /// Confirmed by the payment gateway (client callback or webhook).
    Gateway,
    /// Approved by the project owner from donor-submitted evidence.
    Manual,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gateway => "gateway",
            Self::Manual => "manual",
        }
    }
}

/// Review state of a [`ManualPayment`]. `Verified` and `Rejected` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "lowercase")]
pub enum ManualStatus {
    Submitted,
    Verified,
    Rejected,
}

impl ManualStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Verified => "verified",
            Self::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Submitted)
    }
}

impl fmt::Display for ManualStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Project {
    pub id: String,
    pub owner_id: String,
    pub owner_email: Option<String>,
    pub title: String,
    pub goal: i64,
    pub pledged: i64,
    pub deadline: Option<i64>,
}

/// One append-only ledger entry. Amounts are in the smallest currency unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Contribution {
    pub id: String,
    pub project_id: String,
    pub amount: i64,
    pub external_payment_id: Option<String>,
    pub origin: Origin,
    pub donor_ref: Option<String>,
    pub donor_email: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PaymentIntent {
    pub id: String,
    pub project_id: String,
    pub amount: i64,
    pub currency: String,
    pub order_handle: String,
    pub consumed: bool,
    pub contribution_id: Option<String>,
    /// Caller who asked for the order, when known.
    pub requested_by: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ManualPayment {
    pub id: String,
    pub project_id: String,
    pub donor_id: String,
    pub donor_email: Option<String>,
    pub amount: i64,
    pub evidence_ref: String,
    pub status: ManualStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ManualPayment {
    /// Idempotency key under which an approval lands in the ledger.
    pub fn ledger_key(&self) -> String {
        manual_ledger_key(&self.id)
    }
}

const MANUAL_KEY_PREFIX: &str = "manual:";

pub fn manual_ledger_key(manual_payment_id: &str) -> String {
    format!("{MANUAL_KEY_PREFIX}{manual_payment_id}")
}

/// Inverse of [`manual_ledger_key`]; `None` for gateway payment ids.
pub fn manual_payment_id_from_key(key: &str) -> Option<&str> {
    key.strip_prefix(MANUAL_KEY_PREFIX).filter(|id| !id.is_empty())
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Receipt {
    pub id: String,
    pub contribution_id: String,
    pub manual_payment_id: Option<String>,
    pub document_ref: String,
    pub emailed_to_donor: bool,
    pub emailed_to_owner: bool,
    pub created_at: i64,
}

/// Render an amount in minor units as `CUR major.minor`.
pub fn format_amount(amount: i64, currency: &str) -> String {
    let sign = if amount < 0 { "-" } else { "" };
    let abs = amount.unsigned_abs();
    format!("{currency} {sign}{}.{:02}", abs / 100, abs % 100)
}

pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_status_terminality() {
        assert!(!ManualStatus::Submitted.is_terminal());
        assert!(ManualStatus::Verified.is_terminal());
        assert!(ManualStatus::Rejected.is_terminal());
    }

    #[test]
    fn manual_ledger_key_is_deterministic() {
        assert_eq!(manual_ledger_key("abc"), "manual:abc");
        assert_eq!(manual_ledger_key("abc"), manual_ledger_key("abc"));
    }

    #[test]
    fn manual_key_parses_back_to_its_payment() {
        let key = manual_ledger_key("mp_42");
        assert_eq!(manual_payment_id_from_key(&key), Some("mp_42"));
        assert_eq!(manual_payment_id_from_key("pay_Nx81"), None);
        assert_eq!(manual_payment_id_from_key("manual:"), None);
    }

    #[test]
    fn amounts_render_in_major_units() {
        assert_eq!(format_amount(50_000, "INR"), "INR 500.00");
        assert_eq!(format_amount(105, "INR"), "INR 1.05");
        assert_eq!(format_amount(7, "USD"), "USD 0.07");
    }

    #[test]
    fn origin_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Origin::Gateway).unwrap(), "\"gateway\"");
        assert_eq!(Origin::Manual.as_str(), "manual");
    }
}
