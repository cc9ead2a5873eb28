//! Funding ledger and idempotency guard.
//!
//! Every path that moves money (client confirmation, webhook, manual
//! approval) ends in [`apply`]. A contribution row and its pledged delta are
//! written in the same transaction, and the `UNIQUE` external payment id is
//! the only synchronisation between concurrent reporters of one payment:
//! whoever inserts first wins, everyone else reads the winner back.

use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info, instrument};

use crate::db;
use crate::errors::{PaymentError, Result};
use crate::types::{new_id, now_unix, Contribution, Origin};

/// A request to record one contribution.
#[derive(Debug, Clone)]
pub struct NewContribution {
    pub project_id: String,
    pub amount: i64,
    /// Idempotency key: the gateway payment id, or `manual:<id>`.
    pub external_payment_id: String,
    pub origin: Origin,
    pub donor_ref: Option<String>,
    pub donor_email: Option<String>,
    /// Order the payment settles, if any. Consumed in the same transaction.
    pub order_handle: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    /// This call created the contribution and applied the delta.
    Recorded(Contribution),
    /// The key was already in the ledger; nothing changed.
    Duplicate(Contribution),
}

impl RecordOutcome {
    pub fn contribution(&self) -> &Contribution {
        match self {
            Self::Recorded(c) | Self::Duplicate(c) => c,
        }
    }

    pub fn into_contribution(self) -> Contribution {
        match self {
            Self::Recorded(c) | Self::Duplicate(c) => c,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Self::Recorded(_))
    }
}

/// Record a contribution in its own transaction.
#[instrument(skip(pool, req), fields(project_id = %req.project_id, key = %req.external_payment_id))]
pub async fn record_contribution(pool: &SqlitePool, req: NewContribution) -> Result<RecordOutcome> {
    if req.amount <= 0 {
        return Err(PaymentError::InvalidAmount(req.amount));
    }
    // Projects are never deleted by this service, so existence can be checked
    // before the write transaction opens.
    if db::get_project(pool, &req.project_id).await?.is_none() {
        return Err(PaymentError::NotFound(format!("Project {}", req.project_id)));
    }

    let mut tx = pool.begin().await?;
    let outcome = apply(&mut *tx, req).await?;
    tx.commit().await?;

    let c = outcome.contribution();
    if outcome.is_new() {
        info!(
            contribution_id = %c.id,
            amount = c.amount,
            origin = c.origin.as_str(),
            "Contribution recorded"
        );
    } else {
        debug!(contribution_id = %c.id, "Duplicate report acknowledged");
    }
    Ok(outcome)
}

/// Insert-or-read-back plus the pledged delta on an open transaction.
///
/// The caller owns commit/rollback; on any error nothing must be committed.
pub async fn apply(conn: &mut SqliteConnection, req: NewContribution) -> Result<RecordOutcome> {
    if req.amount <= 0 {
        return Err(PaymentError::InvalidAmount(req.amount));
    }

    let contribution = Contribution {
        id: new_id(),
        project_id: req.project_id,
        amount: req.amount,
        external_payment_id: Some(req.external_payment_id.clone()),
        origin: req.origin,
        donor_ref: req.donor_ref,
        donor_email: req.donor_email,
        created_at: now_unix(),
    };

    if !db::insert_contribution_if_absent(&mut *conn, &contribution).await? {
        let existing = db::get_contribution_by_external_id(&mut *conn, &req.external_payment_id)
            .await?
            .ok_or_else(|| {
                PaymentError::NotFound(format!("Contribution {}", req.external_payment_id))
            })?;
        debug!(
            contribution_id = %existing.id,
            "Payment already in the ledger, skipping"
        );
        return Ok(RecordOutcome::Duplicate(existing));
    }

    if !db::increment_pledged(&mut *conn, &contribution.project_id, contribution.amount).await? {
        let project_id = contribution.project_id;
        return Err(match db::get_project(&mut *conn, &project_id).await? {
            Some(_) => PaymentError::PledgeOverflow(project_id),
            None => PaymentError::NotFound(format!("Project {project_id}")),
        });
    }

    if let Some(order_handle) = &req.order_handle {
        if !db::consume_intent(&mut *conn, order_handle, &contribution.id).await? {
            return Err(PaymentError::IntentConsumed(order_handle.clone()));
        }
    }

    Ok(RecordOutcome::Recorded(contribution))
}

/// Cached total versus the sum of the contribution log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reconciliation {
    pub project_id: String,
    pub pledged: i64,
    pub ledger_total: i64,
    pub contribution_count: i64,
    pub consistent: bool,
}

pub async fn reconcile(pool: &SqlitePool, project_id: &str) -> Result<Reconciliation> {
    let project = db::get_project(pool, project_id)
        .await?
        .ok_or_else(|| PaymentError::NotFound(format!("Project {project_id}")))?;
    let (ledger_total, contribution_count) = db::contribution_totals(pool, project_id).await?;
    Ok(Reconciliation {
        project_id: project.id,
        pledged: project.pledged,
        ledger_total,
        contribution_count,
        consistent: project.pledged == ledger_total,
    })
}
