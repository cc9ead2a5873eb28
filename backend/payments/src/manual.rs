//! Manual proof-of-payment workflow.
//!
//! `submitted` → `verified` | `rejected`; both outcomes are terminal. Only the
//! project owner reviews. Approval flips the status and writes the ledger
//! entry in one transaction, keyed by `manual:<id>`, so a retried approval can
//! never count twice.

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{info, instrument, warn};

use crate::api::AppState;
use crate::db;
use crate::errors::{PaymentError, Result};
use crate::ledger::{self, NewContribution};
use crate::receipts;
use crate::storage::image_extension;
use crate::types::{new_id, now_unix, Contribution, ManualPayment, ManualStatus, Origin, Receipt};

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitManualPayment {
    pub amount: i64,
    #[serde(default, alias = "evidenceRef", alias = "screenshot_url")]
    pub evidence_ref: Option<String>,
    #[serde(default, alias = "donorEmail")]
    pub donor_email: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalOutcome {
    pub payment: ManualPayment,
    pub contribution: Contribution,
    pub receipt: Option<Receipt>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManualPaymentDetail {
    pub payment: ManualPayment,
    pub receipt: Option<Receipt>,
}

/// Queue a proof for the owner's review. Amounts are capped at
/// `MAX_ORDER_AMOUNT`, like gateway orders.
#[instrument(skip(state, req), fields(amount = req.amount))]
pub async fn submit(
    state: &AppState,
    project_id: &str,
    donor_id: &str,
    req: SubmitManualPayment,
) -> Result<ManualPayment> {
    if req.amount <= 0 || req.amount > state.config.max_order_amount {
        return Err(PaymentError::InvalidAmount(req.amount));
    }
    let pool = &state.pool;
    let evidence_ref = req
        .evidence_ref
        .map(|e| e.trim().to_string())
        .filter(|e| !e.is_empty())
        .ok_or(PaymentError::MissingEvidence)?;
    if db::get_project(pool, project_id).await?.is_none() {
        return Err(PaymentError::NotFound(format!("Project {project_id}")));
    }

    let now = now_unix();
    let payment = ManualPayment {
        id: new_id(),
        project_id: project_id.to_string(),
        donor_id: donor_id.to_string(),
        donor_email: req.donor_email.filter(|e| !e.trim().is_empty()),
        amount: req.amount,
        evidence_ref,
        status: ManualStatus::Submitted,
        created_at: now,
        updated_at: now,
    };
    db::insert_manual_payment(pool, &payment).await?;
    info!(manual_payment_id = %payment.id, "Manual payment submitted for review");
    Ok(payment)
}

/// Load a payment and its project, refusing anyone but the owner.
async fn load_for_review(
    pool: &SqlitePool,
    id: &str,
    caller_id: &str,
    action: &'static str,
) -> Result<ManualPayment> {
    let payment = db::get_manual_payment(pool, id)
        .await?
        .ok_or_else(|| PaymentError::NotFound(format!("Manual payment {id}")))?;
    let project = db::get_project(pool, &payment.project_id)
        .await?
        .ok_or_else(|| PaymentError::NotFound(format!("Project {}", payment.project_id)))?;
    if project.owner_id != caller_id {
        warn!(
            target: "audit",
            caller_id,
            manual_payment_id = id,
            project_id = %project.id,
            action,
            "Review by non-owner refused"
        );
        return Err(PaymentError::Forbidden);
    }
    Ok(payment)
}

async fn current_status(pool: &SqlitePool, id: &str) -> Result<ManualStatus> {
    db::get_manual_payment(pool, id)
        .await?
        .map(|p| p.status)
        .ok_or_else(|| PaymentError::NotFound(format!("Manual payment {id}")))
}

#[instrument(skip(state))]
pub async fn approve(state: &AppState, id: &str, caller_id: &str) -> Result<ApprovalOutcome> {
    let payment = load_for_review(&state.pool, id, caller_id, "approve").await?;
    if payment.status.is_terminal() {
        return Err(PaymentError::InvalidTransition {
            id: id.to_string(),
            current: payment.status,
        });
    }

    let now = now_unix();
    let mut tx = state.pool.begin().await?;
    if !db::transition_manual_payment(&mut *tx, id, ManualStatus::Submitted, ManualStatus::Verified, now).await? {
        tx.rollback().await?;
        return Err(PaymentError::InvalidTransition {
            id: id.to_string(),
            current: current_status(&state.pool, id).await?,
        });
    }
    let outcome = ledger::apply(
        &mut *tx,
        NewContribution {
            project_id: payment.project_id.clone(),
            amount: payment.amount,
            external_payment_id: payment.ledger_key(),
            origin: Origin::Manual,
            donor_ref: Some(payment.donor_id.clone()),
            donor_email: payment.donor_email.clone(),
            order_handle: None,
        },
    )
    .await?;
    tx.commit().await?;

    let contribution = outcome.into_contribution();
    info!(
        manual_payment_id = id,
        contribution_id = %contribution.id,
        amount = contribution.amount,
        "Manual payment verified"
    );

    let mut warnings = Vec::new();
    let receipt = match receipts::issue(state, &contribution, Some(id)).await {
        Ok(issued) => {
            warnings.extend(issued.warnings);
            Some(issued.receipt)
        }
        Err(e) => {
            warn!(contribution_id = %contribution.id, "Receipt generation failed: {e}");
            warnings.push("receipt could not be generated yet".to_string());
            None
        }
    };

    Ok(ApprovalOutcome {
        payment: ManualPayment {
            status: ManualStatus::Verified,
            updated_at: now,
            ..payment
        },
        contribution,
        receipt,
        warnings,
    })
}

#[instrument(skip(pool))]
pub async fn reject(pool: &SqlitePool, id: &str, caller_id: &str) -> Result<ManualPayment> {
    let payment = load_for_review(pool, id, caller_id, "reject").await?;
    if payment.status.is_terminal() {
        return Err(PaymentError::InvalidTransition {
            id: id.to_string(),
            current: payment.status,
        });
    }

    let now = now_unix();
    let mut conn = pool.acquire().await?;
    let moved =
        db::transition_manual_payment(&mut *conn, id, ManualStatus::Submitted, ManualStatus::Rejected, now)
            .await?;
    drop(conn);
    if !moved {
        return Err(PaymentError::InvalidTransition {
            id: id.to_string(),
            current: current_status(pool, id).await?,
        });
    }

    info!(manual_payment_id = id, "Manual payment rejected");
    Ok(ManualPayment {
        status: ManualStatus::Rejected,
        updated_at: now,
        ..payment
    })
}

/// Review queue for a project; owner only.
pub async fn list_for_owner(
    pool: &SqlitePool,
    project_id: &str,
    caller_id: &str,
) -> Result<Vec<ManualPayment>> {
    let project = db::get_project(pool, project_id)
        .await?
        .ok_or_else(|| PaymentError::NotFound(format!("Project {project_id}")))?;
    if project.owner_id != caller_id {
        warn!(target: "audit", caller_id, project_id, "Review queue requested by non-owner");
        return Err(PaymentError::Forbidden);
    }
    db::list_manual_payments_for_project(pool, project_id).await
}

/// A single payment as seen by its donor or the project owner.
pub async fn detail(pool: &SqlitePool, id: &str, caller_id: &str) -> Result<ManualPaymentDetail> {
    let payment = db::get_manual_payment(pool, id)
        .await?
        .ok_or_else(|| PaymentError::NotFound(format!("Manual payment {id}")))?;
    if payment.donor_id != caller_id {
        let owner = db::get_project(pool, &payment.project_id)
            .await?
            .map(|p| p.owner_id);
        if owner.as_deref() != Some(caller_id) {
            return Err(PaymentError::Forbidden);
        }
    }
    let receipt = db::get_receipt_by_manual_payment(pool, id).await?;
    Ok(ManualPaymentDetail { payment, receipt })
}

/// Store an evidence image and return the reference to submit with.
#[instrument(skip(state, bytes), fields(size = bytes.len()))]
pub async fn upload_evidence(
    state: &AppState,
    caller_id: &str,
    bytes: Vec<u8>,
    content_type: &str,
) -> Result<String> {
    if bytes.is_empty() {
        return Err(PaymentError::MissingEvidence);
    }
    let ext = image_extension(content_type)
        .ok_or_else(|| PaymentError::UnsupportedEvidence(content_type.to_string()))?;
    if bytes.len() > state.config.max_evidence_bytes {
        return Err(PaymentError::UnsupportedEvidence(format!(
            "larger than {} bytes",
            state.config.max_evidence_bytes
        )));
    }

    let path = format!("evidence/{}.{ext}", new_id());
    let url = state.blobs.put(&path, bytes, content_type).await?;
    info!(caller_id, %url, "Evidence uploaded");
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    fn proof(amount: i64) -> SubmitManualPayment {
        SubmitManualPayment {
            amount,
            evidence_ref: Some("https://blobs.test/evidence/upi.png".to_string()),
            donor_email: Some("donor@example.test".to_string()),
        }
    }

    async fn receipt_count(pool: &SqlitePool) -> i64 {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM receipts")
            .fetch_one(pool)
            .await
            .unwrap();
        n
    }

    #[tokio::test]
    async fn approve_records_once_and_issues_one_receipt() {
        let h = testutil::harness().await;
        let project = testutil::seed_project(&h.state.pool, "owner-1", 1_000).await;
        let mp = submit(&h.state, &project, "donor-1", proof(200)).await.unwrap();
        assert_eq!(mp.status, ManualStatus::Submitted);

        let approved = approve(&h.state, &mp.id, "owner-1").await.unwrap();
        assert_eq!(approved.payment.status, ManualStatus::Verified);
        assert_eq!(approved.contribution.origin, Origin::Manual);
        assert_eq!(
            approved.contribution.external_payment_id.as_deref(),
            Some(format!("manual:{}", mp.id).as_str())
        );
        let receipt = approved.receipt.unwrap();
        assert_eq!(receipt.manual_payment_id.as_deref(), Some(mp.id.as_str()));
        assert_eq!(testutil::pledged(&h.state.pool, &project).await, 200);
        assert_eq!(testutil::contribution_count(&h.state.pool, &project).await, 1);
        assert_eq!(receipt_count(&h.state.pool).await, 1);

        match approve(&h.state, &mp.id, "owner-1").await {
            Err(PaymentError::InvalidTransition { current, .. }) => {
                assert_eq!(current, ManualStatus::Verified)
            }
            other => panic!("expected InvalidTransition, got {other:?}"),
        }
        assert_eq!(testutil::pledged(&h.state.pool, &project).await, 200);
        assert_eq!(testutil::contribution_count(&h.state.pool, &project).await, 1);
        assert_eq!(receipt_count(&h.state.pool).await, 1);
    }

    #[tokio::test]
    async fn reject_then_approve_is_invalid() {
        let h = testutil::harness().await;
        let project = testutil::seed_project(&h.state.pool, "owner-1", 1_000).await;
        let mp = submit(&h.state, &project, "donor-1", proof(300)).await.unwrap();

        let rejected = reject(&h.state.pool, &mp.id, "owner-1").await.unwrap();
        assert_eq!(rejected.status, ManualStatus::Rejected);
        assert_eq!(testutil::pledged(&h.state.pool, &project).await, 0);

        match approve(&h.state, &mp.id, "owner-1").await {
            Err(PaymentError::InvalidTransition { current, .. }) => {
                assert_eq!(current, ManualStatus::Rejected)
            }
            other => panic!("expected InvalidTransition, got {other:?}"),
        }
        assert!(matches!(
            reject(&h.state.pool, &mp.id, "owner-1").await,
            Err(PaymentError::InvalidTransition { .. })
        ));
        assert_eq!(testutil::pledged(&h.state.pool, &project).await, 0);
        assert_eq!(testutil::contribution_count(&h.state.pool, &project).await, 0);
    }

    #[tokio::test]
    async fn only_the_owner_reviews() {
        let h = testutil::harness().await;
        let project = testutil::seed_project(&h.state.pool, "owner-1", 1_000).await;
        let mp = submit(&h.state, &project, "donor-1", proof(200)).await.unwrap();

        for caller in ["donor-1", "stranger"] {
            assert!(matches!(
                approve(&h.state, &mp.id, caller).await,
                Err(PaymentError::Forbidden)
            ));
            assert!(matches!(
                reject(&h.state.pool, &mp.id, caller).await,
                Err(PaymentError::Forbidden)
            ));
        }
        assert!(matches!(
            list_for_owner(&h.state.pool, &project, "donor-1").await,
            Err(PaymentError::Forbidden)
        ));
        let still = db::get_manual_payment(&h.state.pool, &mp.id).await.unwrap().unwrap();
        assert_eq!(still.status, ManualStatus::Submitted);
    }

    #[tokio::test]
    async fn submit_validates_before_writing() {
        let h = testutil::harness().await;
        let project = testutil::seed_project(&h.state.pool, "owner-1", 1_000).await;

        let ceiling = h.state.config.max_order_amount;
        for amount in [0, -200, ceiling + 1, i64::MAX] {
            assert!(matches!(
                submit(&h.state, &project, "donor-1", proof(amount)).await,
                Err(PaymentError::InvalidAmount(_))
            ));
        }
        let no_evidence = SubmitManualPayment {
            evidence_ref: Some("   ".into()),
            ..proof(200)
        };
        assert!(matches!(
            submit(&h.state, &project, "donor-1", no_evidence).await,
            Err(PaymentError::MissingEvidence)
        ));
        assert!(matches!(
            submit(&h.state, "missing", "donor-1", proof(200)).await,
            Err(PaymentError::NotFound(_))
        ));
        assert!(list_for_owner(&h.state.pool, &project, "owner-1")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn detail_is_visible_to_donor_and_owner_only() {
        let h = testutil::harness().await;
        let project = testutil::seed_project(&h.state.pool, "owner-1", 1_000).await;
        let mp = submit(&h.state, &project, "donor-1", proof(200)).await.unwrap();
        approve(&h.state, &mp.id, "owner-1").await.unwrap();

        let seen = detail(&h.state.pool, &mp.id, "donor-1").await.unwrap();
        assert_eq!(seen.payment.status, ManualStatus::Verified);
        assert!(seen.receipt.is_some());
        assert!(detail(&h.state.pool, &mp.id, "owner-1").await.is_ok());
        assert!(matches!(
            detail(&h.state.pool, &mp.id, "stranger").await,
            Err(PaymentError::Forbidden)
        ));
        let mine = db::list_manual_payments_for_donor(&h.state.pool, "donor-1").await.unwrap();
        assert_eq!(mine.len(), 1);
    }

    #[tokio::test]
    async fn receipt_failure_does_not_undo_approval() {
        let h = testutil::harness().await;
        let project = testutil::seed_project(&h.state.pool, "owner-1", 1_000).await;
        let mp = submit(&h.state, &project, "donor-1", proof(200)).await.unwrap();

        h.blobs.set_failing(true);
        let approved = approve(&h.state, &mp.id, "owner-1").await.unwrap();
        assert!(approved.receipt.is_none());
        assert_eq!(approved.warnings.len(), 1);
        assert_eq!(testutil::pledged(&h.state.pool, &project).await, 200);

        h.blobs.set_failing(false);
        let issued = receipts::issue(&h.state, &approved.contribution, Some(&mp.id))
            .await
            .unwrap();
        assert!(issued.created);
        assert_eq!(testutil::pledged(&h.state.pool, &project).await, 200);
    }

    #[tokio::test]
    async fn evidence_must_be_a_non_empty_image() {
        let h = testutil::harness().await;

        let url = upload_evidence(&h.state, "donor-1", vec![1, 2, 3], "image/jpeg")
            .await
            .unwrap();
        assert!(url.starts_with("https://blobs.test/evidence/"));
        assert!(url.ends_with(".jpg"));
        assert_eq!(h.blobs.len(), 1);

        assert!(matches!(
            upload_evidence(&h.state, "donor-1", Vec::new(), "image/png").await,
            Err(PaymentError::MissingEvidence)
        ));
        assert!(matches!(
            upload_evidence(&h.state, "donor-1", vec![1], "application/pdf").await,
            Err(PaymentError::UnsupportedEvidence(_))
        ));
        assert_eq!(h.blobs.len(), 1);
    }
}
