//! Database layer: migrations, ledger writes and read models.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{SqliteConnection, SqliteExecutor, SqlitePool};
use tracing::info;

use crate::errors::Result;
use crate::types::{Contribution, ManualPayment, ManualStatus, PaymentIntent, Project, Receipt};

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };

    let options = SqliteConnectOptions::from_str(&url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    // An in-memory database lives and dies with its connection.
    let pool = if url.contains(":memory:") {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?
    } else {
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?
    };

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

// ─────────────────────────────────────────────────────────
// Projects
// ─────────────────────────────────────────────────────────

pub async fn get_project<'e>(exec: impl SqliteExecutor<'e>, id: &str) -> Result<Option<Project>> {
    let row = sqlx::query_as::<_, Project>(
        r#"
        SELECT id, owner_id, owner_email, title, goal, pledged, deadline
        FROM   projects
        WHERE  id = ?1
        "#,
    )
    .bind(id)
    .fetch_optional(exec)
    .await?;
    Ok(row)
}

pub async fn list_project_ids(pool: &SqlitePool) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as("SELECT id FROM projects ORDER BY created_at ASC")
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Apply a positive delta to the cached pledged total. The arithmetic runs
/// inside SQLite, never as a read-modify-write in the application.
///
/// SQLite turns an overflowing integer sum into a REAL, so the update only
/// matches while `pledged + delta` still fits in an `i64`. Returns `false`
/// when the project does not exist or the sum would overflow.
pub async fn increment_pledged(
    conn: &mut SqliteConnection,
    project_id: &str,
    delta: i64,
) -> Result<bool> {
    let rows = sqlx::query(
        r#"
        UPDATE projects
        SET    pledged = pledged + ?1
        WHERE  id = ?2 AND pledged <= ?3 - ?1
        "#,
    )
    .bind(delta)
    .bind(project_id)
    .bind(i64::MAX)
    .execute(conn)
    .await?
    .rows_affected();
    Ok(rows == 1)
}

// ─────────────────────────────────────────────────────────
// Contributions
// ─────────────────────────────────────────────────────────

/// Insert a contribution unless one already carries the same external
/// payment id. Returns `true` when this call created the row.
pub async fn insert_contribution_if_absent(
    conn: &mut SqliteConnection,
    c: &Contribution,
) -> Result<bool> {
    let rows = sqlx::query(
        r#"
        INSERT INTO contributions
            (id, project_id, amount, external_payment_id, origin, donor_ref, donor_email, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT (external_payment_id) DO NOTHING
        "#,
    )
    .bind(&c.id)
    .bind(&c.project_id)
    .bind(c.amount)
    .bind(&c.external_payment_id)
    .bind(c.origin)
    .bind(&c.donor_ref)
    .bind(&c.donor_email)
    .bind(c.created_at)
    .execute(conn)
    .await?
    .rows_affected();
    Ok(rows == 1)
}

pub async fn get_contribution_by_external_id<'e>(
    exec: impl SqliteExecutor<'e>,
    external_payment_id: &str,
) -> Result<Option<Contribution>> {
    let row = sqlx::query_as::<_, Contribution>(
        r#"
        SELECT id, project_id, amount, external_payment_id, origin, donor_ref, donor_email, created_at
        FROM   contributions
        WHERE  external_payment_id = ?1
        "#,
    )
    .bind(external_payment_id)
    .fetch_optional(exec)
    .await?;
    Ok(row)
}

pub async fn get_contribution(pool: &SqlitePool, id: &str) -> Result<Option<Contribution>> {
    let row = sqlx::query_as::<_, Contribution>(
        r#"
        SELECT id, project_id, amount, external_payment_id, origin, donor_ref, donor_email, created_at
        FROM   contributions
        WHERE  id = ?1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Most recent contributions first.
pub async fn list_contributions_for_project(
    pool: &SqlitePool,
    project_id: &str,
    limit: i64,
) -> Result<Vec<Contribution>> {
    let rows = sqlx::query_as::<_, Contribution>(
        r#"
        SELECT id, project_id, amount, external_payment_id, origin, donor_ref, donor_email, created_at
        FROM   contributions
        WHERE  project_id = ?1
        ORDER  BY created_at DESC, id ASC
        LIMIT  ?2
        "#,
    )
    .bind(project_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// `(sum of amounts, number of rows)` straight from the ledger.
pub async fn contribution_totals(pool: &SqlitePool, project_id: &str) -> Result<(i64, i64)> {
    let row: (i64, i64) = sqlx::query_as(
        "SELECT COALESCE(SUM(amount), 0), COUNT(*) FROM contributions WHERE project_id = ?1",
    )
    .bind(project_id)
    .fetch_one(pool)
    .await?;
    Ok(row)
}

// ─────────────────────────────────────────────────────────
// Payment intents
// ─────────────────────────────────────────────────────────

pub async fn insert_intent(pool: &SqlitePool, intent: &PaymentIntent) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO payment_intents
            (id, project_id, amount, currency, order_handle, consumed, contribution_id,
             requested_by, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
    )
    .bind(&intent.id)
    .bind(&intent.project_id)
    .bind(intent.amount)
    .bind(&intent.currency)
    .bind(&intent.order_handle)
    .bind(intent.consumed)
    .bind(&intent.contribution_id)
    .bind(&intent.requested_by)
    .bind(intent.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_intent_by_order<'e>(
    exec: impl SqliteExecutor<'e>,
    order_handle: &str,
) -> Result<Option<PaymentIntent>> {
    let row = sqlx::query_as::<_, PaymentIntent>(
        r#"
        SELECT id, project_id, amount, currency, order_handle, consumed, contribution_id,
               requested_by, created_at
        FROM   payment_intents
        WHERE  order_handle = ?1
        "#,
    )
    .bind(order_handle)
    .fetch_optional(exec)
    .await?;
    Ok(row)
}

/// Newest unconsumed intent the same caller opened for the same project and
/// amount at or after `not_before`.
pub async fn find_reusable_intent(
    pool: &SqlitePool,
    project_id: &str,
    amount: i64,
    currency: &str,
    requested_by: &str,
    not_before: i64,
) -> Result<Option<PaymentIntent>> {
    let row = sqlx::query_as::<_, PaymentIntent>(
        r#"
        SELECT id, project_id, amount, currency, order_handle, consumed, contribution_id,
               requested_by, created_at
        FROM   payment_intents
        WHERE  project_id = ?1 AND amount = ?2 AND currency = ?3
               AND requested_by = ?4 AND consumed = 0 AND created_at >= ?5
        ORDER  BY created_at DESC
        LIMIT  1
        "#,
    )
    .bind(project_id)
    .bind(amount)
    .bind(currency)
    .bind(requested_by)
    .bind(not_before)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Flip the consumed flag exactly once. Re-consuming with the same
/// contribution is a no-op that still reports success.
pub async fn consume_intent(
    conn: &mut SqliteConnection,
    order_handle: &str,
    contribution_id: &str,
) -> Result<bool> {
    let rows = sqlx::query(
        r#"
        UPDATE payment_intents
        SET    consumed = 1, contribution_id = ?2
        WHERE  order_handle = ?1
               AND (consumed = 0 OR contribution_id = ?2)
        "#,
    )
    .bind(order_handle)
    .bind(contribution_id)
    .execute(conn)
    .await?
    .rows_affected();
    Ok(rows == 1)
}

// ─────────────────────────────────────────────────────────
// Manual payments
// ─────────────────────────────────────────────────────────

pub async fn insert_manual_payment(pool: &SqlitePool, mp: &ManualPayment) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO manual_payments
            (id, project_id, donor_id, donor_email, amount, evidence_ref, status, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
    )
    .bind(&mp.id)
    .bind(&mp.project_id)
    .bind(&mp.donor_id)
    .bind(&mp.donor_email)
    .bind(mp.amount)
    .bind(&mp.evidence_ref)
    .bind(mp.status)
    .bind(mp.created_at)
    .bind(mp.updated_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_manual_payment<'e>(
    exec: impl SqliteExecutor<'e>,
    id: &str,
) -> Result<Option<ManualPayment>> {
    let row = sqlx::query_as::<_, ManualPayment>(
        r#"
        SELECT id, project_id, donor_id, donor_email, amount, evidence_ref, status,
               created_at, updated_at
        FROM   manual_payments
        WHERE  id = ?1
        "#,
    )
    .bind(id)
    .fetch_optional(exec)
    .await?;
    Ok(row)
}

pub async fn list_manual_payments_for_project(
    pool: &SqlitePool,
    project_id: &str,
) -> Result<Vec<ManualPayment>> {
    let rows = sqlx::query_as::<_, ManualPayment>(
        r#"
        SELECT id, project_id, donor_id, donor_email, amount, evidence_ref, status,
               created_at, updated_at
        FROM   manual_payments
        WHERE  project_id = ?1
        ORDER  BY created_at DESC, id ASC
        "#,
    )
    .bind(project_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn list_manual_payments_for_donor(
    pool: &SqlitePool,
    donor_id: &str,
) -> Result<Vec<ManualPayment>> {
    let rows = sqlx::query_as::<_, ManualPayment>(
        r#"
        SELECT id, project_id, donor_id, donor_email, amount, evidence_ref, status,
               created_at, updated_at
        FROM   manual_payments
        WHERE  donor_id = ?1
        ORDER  BY created_at DESC, id ASC
        "#,
    )
    .bind(donor_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Compare-and-set on the review status. Returns `false` if the row is no
/// longer in `from`.
pub async fn transition_manual_payment(
    conn: &mut SqliteConnection,
    id: &str,
    from: ManualStatus,
    to: ManualStatus,
    now: i64,
) -> Result<bool> {
    let rows = sqlx::query(
        "UPDATE manual_payments SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
    )
    .bind(to)
    .bind(now)
    .bind(id)
    .bind(from)
    .execute(conn)
    .await?
    .rows_affected();
    Ok(rows == 1)
}

// ─────────────────────────────────────────────────────────
// Receipts
// ─────────────────────────────────────────────────────────

/// At most one receipt per contribution. Returns `true` when this call
/// created it.
pub async fn insert_receipt_if_absent(pool: &SqlitePool, r: &Receipt) -> Result<bool> {
    let rows = sqlx::query(
        r#"
        INSERT INTO receipts
            (id, contribution_id, manual_payment_id, document_ref,
             emailed_to_donor, emailed_to_owner, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT (contribution_id) DO NOTHING
        "#,
    )
    .bind(&r.id)
    .bind(&r.contribution_id)
    .bind(&r.manual_payment_id)
    .bind(&r.document_ref)
    .bind(r.emailed_to_donor)
    .bind(r.emailed_to_owner)
    .bind(r.created_at)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows == 1)
}

pub async fn get_receipt(pool: &SqlitePool, id: &str) -> Result<Option<Receipt>> {
    let row = sqlx::query_as::<_, Receipt>(
        r#"
        SELECT id, contribution_id, manual_payment_id, document_ref,
               emailed_to_donor, emailed_to_owner, created_at
        FROM   receipts
        WHERE  id = ?1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn get_receipt_by_contribution(
    pool: &SqlitePool,
    contribution_id: &str,
) -> Result<Option<Receipt>> {
    let row = sqlx::query_as::<_, Receipt>(
        r#"
        SELECT id, contribution_id, manual_payment_id, document_ref,
               emailed_to_donor, emailed_to_owner, created_at
        FROM   receipts
        WHERE  contribution_id = ?1
        "#,
    )
    .bind(contribution_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn get_receipt_by_manual_payment(
    pool: &SqlitePool,
    manual_payment_id: &str,
) -> Result<Option<Receipt>> {
    let row = sqlx::query_as::<_, Receipt>(
        r#"
        SELECT id, contribution_id, manual_payment_id, document_ref,
               emailed_to_donor, emailed_to_owner, created_at
        FROM   receipts
        WHERE  manual_payment_id = ?1
        "#,
    )
    .bind(manual_payment_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Delivery flags only ever move from `false` to `true`.
pub async fn mark_receipt_delivered(
    pool: &SqlitePool,
    id: &str,
    to_donor: bool,
    to_owner: bool,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE receipts
        SET    emailed_to_donor = emailed_to_donor OR ?2,
               emailed_to_owner = emailed_to_owner OR ?3
        WHERE  id = ?1
        "#,
    )
    .bind(id)
    .bind(to_donor)
    .bind(to_owner)
    .execute(pool)
    .await?;
    Ok(())
}
