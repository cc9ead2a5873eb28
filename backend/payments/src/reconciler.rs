//! Long-running background task that audits every project's cached pledged
//! total against the sum of its contributions.
//!
//! Drift is logged, never corrected: the write path owns `pledged`.

use std::time::Duration;

use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::db;
use crate::errors::Result;
use crate::ledger;

/// Run the reconciliation loop until `shutdown` is cancelled.
pub async fn run(pool: SqlitePool, interval: Duration, shutdown: CancellationToken) {
    info!("Reconciler starting, every {}s", interval.as_secs());

    loop {
        match sweep_once(&pool).await {
            Ok(0) => debug!("Reconciliation sweep clean"),
            Ok(n) => error!("Reconciliation sweep found {n} inconsistent project(s)"),
            Err(e) => error!("Reconciliation sweep error: {e}"),
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    info!("Reconciler stopped");
}

/// Reconcile every project once. Returns how many were inconsistent or
/// could not be read; one bad project never stops the sweep.
pub async fn sweep_once(pool: &SqlitePool) -> Result<usize> {
    let mut inconsistent = 0;
    for project_id in db::list_project_ids(pool).await? {
        let audit = match ledger::reconcile(pool, &project_id).await {
            Ok(audit) => audit,
            Err(e) => {
                inconsistent += 1;
                error!(project_id = %project_id, "Reconciliation failed: {e}");
                continue;
            }
        };
        if !audit.consistent {
            inconsistent += 1;
            error!(
                project_id = %audit.project_id,
                pledged = audit.pledged,
                ledger_total = audit.ledger_total,
                contributions = audit.contribution_count,
                "Pledged total differs from the contribution ledger"
            );
        }
    }
    Ok(inconsistent)
}
