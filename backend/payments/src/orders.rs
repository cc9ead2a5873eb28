//! Order initiation.
//!
//! Creates a gateway order and persists the matching [`PaymentIntent`]. No
//! ledger side effects: an intent only settles when a confirmed payment is
//! recorded against it.

use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::api::AppState;
use crate::db;
use crate::errors::{PaymentError, Result};
use crate::gateway::OrderRequest;
use crate::types::{new_id, now_unix, PaymentIntent};

#[derive(Debug, Clone, Serialize)]
pub struct OrderResponse {
    pub intent_id: String,
    pub order_handle: String,
    pub amount: i64,
    pub currency: String,
    /// Public key the checkout widget is opened with.
    pub key_id: Option<String>,
    /// `true` when an earlier unconsumed intent was handed back.
    pub reused: bool,
}

impl OrderResponse {
    fn from_intent(intent: PaymentIntent, key_id: Option<String>, reused: bool) -> Self {
        Self {
            intent_id: intent.id,
            order_handle: intent.order_handle,
            amount: intent.amount,
            currency: intent.currency,
            key_id,
            reused,
        }
    }
}

#[instrument(skip(state))]
pub async fn create_order(
    state: &AppState,
    project_id: &str,
    amount: i64,
    requested_by: Option<&str>,
) -> Result<OrderResponse> {
    let config = &state.config;
    if amount <= 0 || amount < config.min_order_amount || amount > config.max_order_amount {
        return Err(PaymentError::InvalidAmount(amount));
    }
    if db::get_project(&state.pool, project_id).await?.is_none() {
        return Err(PaymentError::NotFound(format!("Project {project_id}")));
    }

    if let (Some(caller), true) = (requested_by, config.intent_reuse_secs > 0) {
        let not_before = now_unix() - config.intent_reuse_secs;
        if let Some(intent) = db::find_reusable_intent(
            &state.pool,
            project_id,
            amount,
            &config.currency,
            caller,
            not_before,
        )
        .await?
        {
            debug!(intent_id = %intent.id, "Reusing open payment intent");
            return Ok(OrderResponse::from_intent(
                intent,
                state.gateway.public_key(),
                true,
            ));
        }
    }

    let intent_id = new_id();
    let order = state
        .gateway
        .create_order(&OrderRequest {
            amount,
            currency: config.currency.clone(),
            intent_id: intent_id.clone(),
            project_id: project_id.to_string(),
        })
        .await?;

    let intent = PaymentIntent {
        id: intent_id,
        project_id: project_id.to_string(),
        amount,
        currency: config.currency.clone(),
        order_handle: order.id,
        consumed: false,
        contribution_id: None,
        requested_by: requested_by.map(str::to_string),
        created_at: now_unix(),
    };
    db::insert_intent(&state.pool, &intent).await?;
    info!(intent_id = %intent.id, order_handle = %intent.order_handle, "Payment intent opened");

    Ok(OrderResponse::from_intent(
        intent,
        state.gateway.public_key(),
        false,
    ))
}
