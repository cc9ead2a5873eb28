//! Shared fixtures for unit and HTTP tests.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use sqlx::SqlitePool;

use crate::api::AppState;
use crate::config::Config;
use crate::db;
use crate::errors::{PaymentError, Result};
use crate::gateway::{GatewayOrder, OrderRequest, PaymentGateway};
use crate::notify::{Email, Mailer};
use crate::signature;
use crate::storage::BlobStore;
use crate::types::{new_id, now_unix, PaymentIntent};

pub async fn pool() -> SqlitePool {
    db::init_pool("sqlite::memory:").await.unwrap()
}

/// A WAL database file with the production pool settings, removed on drop.
pub struct FileDb {
    pub pool: SqlitePool,
    path: PathBuf,
}

impl Drop for FileDb {
    fn drop(&mut self) {
        for suffix in ["", "-wal", "-shm"] {
            let mut name = self.path.clone().into_os_string();
            name.push(suffix);
            let _ = std::fs::remove_file(name);
        }
    }
}

pub async fn file_db() -> FileDb {
    let path = std::env::temp_dir().join(format!("payments-test-{}.db", new_id()));
    let pool = db::init_pool(&path.to_string_lossy()).await.unwrap();
    FileDb { pool, path }
}

pub async fn seed_project(pool: &SqlitePool, owner: &str, goal: i64) -> String {
    let id = new_id();
    sqlx::query(
        "INSERT INTO projects (id, owner_id, owner_email, title, goal) VALUES (?1, ?2, ?3, ?4, ?5)",
    )
    .bind(&id)
    .bind(owner)
    .bind(format!("{owner}@example.test"))
    .bind("Solar water pump")
    .bind(goal)
    .execute(pool)
    .await
    .unwrap();
    id
}

pub async fn seed_intent(pool: &SqlitePool, project_id: &str, order_handle: &str, amount: i64) {
    db::insert_intent(
        pool,
        &PaymentIntent {
            id: new_id(),
            project_id: project_id.to_string(),
            amount,
            currency: "INR".to_string(),
            order_handle: order_handle.to_string(),
            consumed: false,
            contribution_id: None,
            requested_by: None,
            created_at: now_unix(),
        },
    )
    .await
    .unwrap();
}

pub async fn pledged(pool: &SqlitePool, project_id: &str) -> i64 {
    db::get_project(pool, project_id)
        .await
        .unwrap()
        .unwrap()
        .pledged
}

pub async fn contribution_count(pool: &SqlitePool, project_id: &str) -> i64 {
    db::contribution_totals(pool, project_id).await.unwrap().1
}

/// Checkout signature under the default test secret.
pub fn checkout_signature(order_handle: &str, payment_handle: &str) -> String {
    signature::sign(
        signature::checkout_payload(order_handle, payment_handle).as_bytes(),
        "checkout_secret",
    )
}

/// Webhook signature under the default test secret.
pub fn webhook_signature(body: &str) -> String {
    signature::sign(body.as_bytes(), "webhook_secret")
}

pub fn captured_event(payment_id: &str, order_id: &str, amount: i64, project_id: &str) -> String {
    json!({
        "event": "payment.captured",
        "payload": {
            "payment": {
                "entity": {
                    "id": payment_id,
                    "order_id": order_id,
                    "amount": amount,
                    "currency": "INR",
                    "email": "payer@example.test",
                    "notes": { "projectId": project_id }
                }
            }
        }
    })
    .to_string()
}

// ─────────────────────────────────────────────────────────
// Fakes
// ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeGateway {
    calls: AtomicUsize,
    failing: AtomicBool,
}

impl FakeGateway {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_order(&self, req: &OrderRequest) -> Result<GatewayOrder> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing.load(Ordering::SeqCst) {
            return Err(PaymentError::GatewayUnavailable("connection refused".into()));
        }
        Ok(GatewayOrder {
            id: format!("order_fake_{n}"),
            amount: req.amount,
            currency: req.currency.clone(),
        })
    }

    fn public_key(&self) -> Option<String> {
        Some("rzp_test_key".to_string())
    }
}

#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    failing: AtomicBool,
}

impl MemoryBlobStore {
    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.blobs.lock().unwrap().get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().unwrap().len()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, path: &str, bytes: Vec<u8>, _content_type: &str) -> Result<String> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PaymentError::Storage("bucket unavailable".into()));
        }
        self.blobs.lock().unwrap().insert(path.to_string(), bytes);
        Ok(format!("https://blobs.test/{path}"))
    }
}

#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<Email>>,
    failing: AtomicBool,
}

impl RecordingMailer {
    pub fn sent(&self) -> Vec<Email> {
        self.sent.lock().unwrap().clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, email: &Email) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PaymentError::Delivery("mail API answered 503".into()));
        }
        self.sent.lock().unwrap().push(email.clone());
        Ok(())
    }
}

pub struct Harness {
    pub state: Arc<AppState>,
    pub gateway: Arc<FakeGateway>,
    pub blobs: Arc<MemoryBlobStore>,
    pub mailer: Arc<RecordingMailer>,
}

pub async fn harness() -> Harness {
    harness_with(Config::default()).await
}

pub async fn harness_with(config: Config) -> Harness {
    let gateway = Arc::new(FakeGateway::default());
    let blobs = Arc::new(MemoryBlobStore::default());
    let mailer = Arc::new(RecordingMailer::default());
    let state = Arc::new(AppState {
        pool: pool().await,
        config,
        gateway: gateway.clone(),
        blobs: blobs.clone(),
        mailer: mailer.clone(),
    });
    Harness {
        state,
        gateway,
        blobs,
        mailer,
    }
}
