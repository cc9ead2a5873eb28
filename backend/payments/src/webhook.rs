//! Gateway webhook ingestion.
//!
//! The signature is checked over the exact bytes the gateway sent; the body
//! is only parsed after that check passes. Deliveries are at-least-once, so
//! every ledger effect goes through the idempotent [`ledger::record_contribution`].

use tracing::{debug, info, instrument, warn};

use crate::api::AppState;
use crate::db;
use crate::errors::{PaymentError, Result};
use crate::events::{EventKind, GatewayEvent, PaymentEntity};
use crate::ledger::{self, NewContribution, RecordOutcome};
use crate::receipts;
use crate::signature;
use crate::types::Origin;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// A captured payment entered the ledger.
    Recorded { contribution_id: String },
    /// The payment was already in the ledger.
    Duplicate { contribution_id: String },
    /// Accepted and logged without a ledger effect.
    Logged,
    /// Accepted and ignored.
    Ignored,
}

#[instrument(skip_all, fields(size = raw.len()))]
pub async fn ingest(state: &AppState, raw: &[u8], provided: Option<&str>) -> Result<WebhookOutcome> {
    let Some(secret) = state.config.webhook_secret.as_deref() else {
        return Err(PaymentError::Config(
            "webhook secret is not configured".to_string(),
        ));
    };

    let Some(provided) = provided else {
        warn!(target: "audit", "Webhook without signature header rejected");
        return Err(PaymentError::InvalidSignature);
    };
    if !signature::verify(raw, provided, secret) {
        warn!(
            target: "audit",
            expected = %signature::sign(raw, secret),
            received = provided,
            "Webhook signature mismatch"
        );
        return Err(PaymentError::InvalidSignature);
    }

    let event: GatewayEvent = serde_json::from_slice(raw)
        .map_err(|e| PaymentError::MalformedPayload(e.to_string()))?;

    let kind = event.kind();
    debug!(event = kind.as_str(), "Webhook verified");

    match kind {
        EventKind::PaymentCaptured => {
            let payment = event
                .payment()
                .ok_or_else(|| PaymentError::MalformedPayload("missing payment entity".into()))?;
            handle_captured(state, payment).await
        }
        EventKind::PaymentFailed => {
            match event.payment() {
                Some(p) => warn!(
                    payment_id = %p.id,
                    order_id = p.order_id.as_deref().unwrap_or("-"),
                    reason = p.error_description.as_deref().unwrap_or("-"),
                    "Gateway reported a failed payment"
                ),
                None => warn!("Gateway reported a failed payment without an entity"),
            }
            Ok(WebhookOutcome::Logged)
        }
        EventKind::RefundProcessed => {
            match event.refund() {
                Some(r) => warn!(
                    refund_id = %r.id,
                    payment_id = r.payment_id.as_deref().unwrap_or("-"),
                    amount = r.amount.unwrap_or_default(),
                    "Refund processed; ledger is not adjusted"
                ),
                None => warn!("Refund event without an entity"),
            }
            Ok(WebhookOutcome::Logged)
        }
        EventKind::Unknown => {
            info!(event = %event.event, "Ignoring unhandled webhook event");
            Ok(WebhookOutcome::Ignored)
        }
    }
}

async fn handle_captured(state: &AppState, payment: &PaymentEntity) -> Result<WebhookOutcome> {
    if let Some(currency) = payment.currency.as_deref() {
        if !currency.eq_ignore_ascii_case(&state.config.currency) {
            warn!(payment_id = %payment.id, currency, "Ignoring payment in foreign currency");
            return Ok(WebhookOutcome::Ignored);
        }
    }
    if payment.amount <= 0 || payment.amount > state.config.max_order_amount {
        warn!(
            target: "audit",
            payment_id = %payment.id,
            amount = payment.amount,
            ceiling = state.config.max_order_amount,
            "Captured amount outside accepted range, ignoring"
        );
        return Ok(WebhookOutcome::Ignored);
    }

    let intent = match payment.order_id.as_deref() {
        Some(order) => db::get_intent_by_order(&state.pool, order).await?,
        None => None,
    };

    let (project_id, order_handle) = match &intent {
        Some(intent) => {
            if intent.amount != payment.amount {
                warn!(
                    target: "audit",
                    payment_id = %payment.id,
                    order_handle = %intent.order_handle,
                    expected = intent.amount,
                    received = payment.amount,
                    "Captured amount differs from order"
                );
                return Err(PaymentError::OrderMismatch(format!(
                    "payment {} captured {} against an order for {}",
                    payment.id, payment.amount, intent.amount
                )));
            }
            (intent.project_id.clone(), Some(intent.order_handle.clone()))
        }
        None => match payment.project_hint() {
            Some(project_id) => (project_id, None),
            None => {
                warn!(payment_id = %payment.id, "Captured payment carries no project, ignoring");
                return Ok(WebhookOutcome::Ignored);
            }
        },
    };

    if db::get_project(&state.pool, &project_id).await?.is_none() {
        warn!(payment_id = %payment.id, %project_id, "Captured payment for unknown project, ignoring");
        return Ok(WebhookOutcome::Ignored);
    }

    let recorded = ledger::record_contribution(
        &state.pool,
        NewContribution {
            project_id,
            amount: payment.amount,
            external_payment_id: payment.id.clone(),
            origin: Origin::Gateway,
            donor_ref: None,
            donor_email: payment.email.clone(),
            order_handle,
        },
    )
    .await;

    // A second capture against a settled order is acknowledged, not retried.
    let outcome = match recorded {
        Err(PaymentError::IntentConsumed(order_handle)) => {
            warn!(
                target: "audit",
                payment_id = %payment.id,
                order_handle = %order_handle,
                amount = payment.amount,
                "Captured payment for an already settled order, not recorded"
            );
            return Ok(WebhookOutcome::Ignored);
        }
        other => other?,
    };

    match outcome {
        RecordOutcome::Recorded(contribution) => {
            match receipts::issue(state, &contribution, None).await {
                Ok(issued) => {
                    for w in &issued.warnings {
                        warn!(contribution_id = %contribution.id, "Receipt: {w}");
                    }
                }
                Err(e) => warn!(
                    contribution_id = %contribution.id,
                    "Receipt generation failed, re-issue later: {e}"
                ),
            }
            Ok(WebhookOutcome::Recorded {
                contribution_id: contribution.id,
            })
        }
        RecordOutcome::Duplicate(contribution) => Ok(WebhookOutcome::Duplicate {
            contribution_id: contribution.id,
        }),
    }
}
