//! Browser-relayed checkout confirmations.
//!
//! The payment handle is the ledger key, the same one the webhook path
//! produces for the same payment, so whichever report arrives first records
//! the contribution and the other is a no-op.

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::api::AppState;
use crate::db;
use crate::errors::{PaymentError, Result};
use crate::ledger::{self, NewContribution};
use crate::receipts;
use crate::signature;
use crate::types::Origin;

/// Fields the checkout widget hands to the browser, plus what the page knows.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientConfirmation {
    #[serde(default, alias = "razorpay_order_id")]
    pub order_handle: Option<String>,
    #[serde(default, alias = "razorpay_payment_id")]
    pub payment_handle: Option<String>,
    #[serde(default, alias = "razorpay_signature")]
    pub signature: Option<String>,
    #[serde(default, alias = "projectId")]
    pub project_id: Option<String>,
    /// Amount the page believes it charged. Only checked, never trusted.
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default, alias = "payerEmail", alias = "email")]
    pub payer_email: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfirmResponse {
    pub success: bool,
    pub contribution_id: String,
    /// `true` when the payment was already in the ledger.
    pub duplicate: bool,
    pub receipt_id: Option<String>,
    pub warnings: Vec<String>,
}

fn required(value: Option<String>, field: &'static str) -> Result<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(PaymentError::MissingPaymentData(field))
}

#[instrument(skip(state, req), fields(order = ?req.order_handle, payment = ?req.payment_handle))]
pub async fn confirm_client_payment(
    state: &AppState,
    req: ClientConfirmation,
    donor_ref: Option<String>,
) -> Result<ConfirmResponse> {
    let order_handle = required(req.order_handle, "order_handle")?;
    let payment_handle = required(req.payment_handle, "payment_handle")?;
    let provided = required(req.signature, "signature")?;
    let project_id = required(req.project_id, "project_id")?;

    let Some(secret) = state.config.gateway_key_secret.as_deref() else {
        return Err(PaymentError::GatewayUnavailable(
            "gateway key secret is not configured".to_string(),
        ));
    };

    if !signature::verify_checkout(&order_handle, &payment_handle, &provided, secret) {
        let expected = signature::sign(
            signature::checkout_payload(&order_handle, &payment_handle).as_bytes(),
            secret,
        );
        warn!(
            target: "audit",
            %order_handle,
            %payment_handle,
            %expected,
            received = %provided,
            "Checkout signature mismatch"
        );
        return Err(PaymentError::InvalidSignature);
    }

    let intent = db::get_intent_by_order(&state.pool, &order_handle)
        .await?
        .ok_or_else(|| PaymentError::NotFound(format!("Order {order_handle}")))?;
    if intent.project_id != project_id {
        warn!(target: "audit", %order_handle, %project_id, "Confirmation names a different project");
        return Err(PaymentError::OrderMismatch(format!(
            "order {order_handle} belongs to another project"
        )));
    }
    if let Some(amount) = req.amount {
        if amount != intent.amount {
            warn!(
                target: "audit",
                %order_handle,
                claimed = amount,
                ordered = intent.amount,
                "Confirmation claims a different amount"
            );
            return Err(PaymentError::OrderMismatch(format!(
                "order {order_handle} is for {}, not {amount}",
                intent.amount
            )));
        }
    }

    let outcome = ledger::record_contribution(
        &state.pool,
        NewContribution {
            project_id: intent.project_id,
            amount: intent.amount,
            external_payment_id: payment_handle,
            origin: Origin::Gateway,
            donor_ref,
            donor_email: req
                .payer_email
                .map(|e| e.trim().to_string())
                .filter(|e| !e.is_empty()),
            order_handle: Some(order_handle),
        },
    )
    .await?;

    let duplicate = !outcome.is_new();
    let contribution = outcome.into_contribution();
    let mut warnings = Vec::new();

    let receipt_id = if duplicate {
        db::get_receipt_by_contribution(&state.pool, &contribution.id)
            .await?
            .map(|r| r.id)
    } else {
        match receipts::issue(state, &contribution, None).await {
            Ok(issued) => {
                warnings.extend(issued.warnings);
                Some(issued.receipt.id)
            }
            Err(e) => {
                warn!(contribution_id = %contribution.id, "Receipt generation failed: {e}");
                warnings.push("receipt could not be generated yet".to_string());
                None
            }
        }
    };

    info!(contribution_id = %contribution.id, duplicate, "Client confirmation accepted");
    Ok(ConfirmResponse {
        success: true,
        contribution_id: contribution.id,
        duplicate,
        receipt_id,
        warnings,
    })
}
