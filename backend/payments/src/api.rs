//! Axum REST API handlers.

use std::sync::Arc;

use axum::{
    async_trait,
    body::Bytes,
    extract::{DefaultBodyLimit, FromRequestParts, Path, Query, State},
    http::{header, request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::error;

use crate::config::Config;
use crate::confirm::{self, ClientConfirmation, ConfirmResponse};
use crate::db;
use crate::errors::{PaymentError, Result};
use crate::gateway::PaymentGateway;
use crate::ledger::{self, Reconciliation};
use crate::manual::{self, ApprovalOutcome, ManualPaymentDetail, SubmitManualPayment};
use crate::notify::Mailer;
use crate::orders::{self, OrderResponse};
use crate::receipts::{self, IssuedReceipt};
use crate::storage::BlobStore;
use crate::types::{ManualPayment, ManualStatus, Origin, Receipt};
use crate::webhook::{self, WebhookOutcome};

/// Header the identity provider's proxy sets to the authenticated user id.
pub const CALLER_HEADER: &str = "x-user-id";

pub struct AppState {
    pub pool: SqlitePool,
    pub config: Config,
    pub gateway: Arc<dyn PaymentGateway>,
    pub blobs: Arc<dyn BlobStore>,
    pub mailer: Arc<dyn Mailer>,
}

/// Authenticated caller, as asserted by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller(pub String);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = PaymentError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self> {
        parts
            .headers
            .get(CALLER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| Caller(v.to_string()))
            .ok_or(PaymentError::Unauthenticated)
    }
}

// ─────────────────────────────────────────────────────────
// Response shapes
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    /// Current state of the record when a transition was refused.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ManualStatus>,
}

impl IntoResponse for PaymentError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!("Request failed: {self}");
        }
        let current = match &self {
            PaymentError::InvalidTransition { current, .. } => Some(*current),
            _ => None,
        };
        (
            status,
            Json(ErrorResponse {
                error: self.public_message(),
                status: current,
            }),
        )
            .into_response()
    }
}

#[derive(Serialize)]
pub struct FundingResponse {
    pub project_id: String,
    pub title: String,
    pub goal: i64,
    pub pledged: i64,
    pub currency: String,
    pub progress_percent: f64,
}

#[derive(Serialize)]
pub struct PublicContribution {
    pub supporter: String,
    pub amount: i64,
    pub origin: Origin,
    pub created_at: i64,
}

#[derive(Serialize)]
pub struct ContributionsResponse {
    pub project_id: String,
    pub count: usize,
    pub contributions: Vec<PublicContribution>,
}

#[derive(Serialize)]
pub struct ManualPaymentsResponse {
    pub count: usize,
    pub payments: Vec<ManualPayment>,
}

#[derive(Serialize)]
pub struct EvidenceResponse {
    pub evidence_ref: String,
}

#[derive(Serialize)]
pub struct WebhookResponse {
    pub status: &'static str,
}

// ─────────────────────────────────────────────────────────
// Request shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    #[serde(alias = "projectId")]
    pub project_id: String,
    pub amount: i64,
}

#[derive(Debug, Deserialize)]
pub struct ContributionsQuery {
    pub limit: Option<i64>,
}

// ─────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────

pub fn router(state: Arc<AppState>) -> Router {
    let evidence_limit = state.config.max_evidence_bytes;
    Router::new()
        .route("/health", get(health))
        .route("/orders", post(create_order))
        .route("/payments/confirm", post(confirm_payment))
        .route("/webhooks/gateway", post(ingest_webhook))
        .route(
            "/evidence",
            post(upload_evidence).layer(DefaultBodyLimit::max(evidence_limit)),
        )
        .route(
            "/projects/:id/manual-payments",
            post(submit_manual_payment).get(list_project_manual_payments),
        )
        .route("/projects/:id/funding", get(get_funding))
        .route("/projects/:id/contributions", get(get_contributions))
        .route("/projects/:id/reconciliation", get(get_reconciliation))
        .route("/manual-payments", get(list_my_manual_payments))
        .route("/manual-payments/:id", get(get_manual_payment))
        .route("/manual-payments/:id/approve", post(approve_manual_payment))
        .route("/manual-payments/:id/reject", post(reject_manual_payment))
        .route(
            "/contributions/:id/receipt",
            get(get_receipt).post(issue_receipt),
        )
        .route("/receipts/:id/redeliver", post(redeliver_receipt))
        .with_state(state)
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `POST /orders`
pub async fn create_order(
    State(state): State<Arc<AppState>>,
    caller: Option<Caller>,
    Json(req): Json<CreateOrderRequest>,
) -> Result<Json<OrderResponse>> {
    let requested_by = caller.map(|c| c.0);
    let order = orders::create_order(&state, &req.project_id, req.amount, requested_by.as_deref()).await?;
    Ok(Json(order))
}

/// `POST /payments/confirm`
pub async fn confirm_payment(
    State(state): State<Arc<AppState>>,
    caller: Option<Caller>,
    Json(req): Json<ClientConfirmation>,
) -> Result<Json<ConfirmResponse>> {
    let donor = caller.map(|c| c.0);
    Ok(Json(confirm::confirm_client_payment(&state, req, donor).await?))
}

/// `POST /webhooks/gateway`
///
/// The body is taken as raw bytes; it is verified before it is parsed.
pub async fn ingest_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>> {
    let signature = headers
        .get(state.config.webhook_signature_header.as_str())
        .and_then(|v| v.to_str().ok());
    let outcome = webhook::ingest(&state, &body, signature).await?;
    let status = match outcome {
        WebhookOutcome::Recorded { .. } => "recorded",
        WebhookOutcome::Duplicate { .. } => "duplicate",
        WebhookOutcome::Logged => "logged",
        WebhookOutcome::Ignored => "ignored",
    };
    Ok(Json(WebhookResponse { status }))
}

/// `POST /evidence`
pub async fn upload_evidence(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<EvidenceResponse>> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let evidence_ref = manual::upload_evidence(&state, &caller, body.to_vec(), content_type).await?;
    Ok(Json(EvidenceResponse { evidence_ref }))
}

/// `POST /projects/:id/manual-payments`
pub async fn submit_manual_payment(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
    Caller(caller): Caller,
    Json(req): Json<SubmitManualPayment>,
) -> Result<(StatusCode, Json<ManualPayment>)> {
    let payment = manual::submit(&state, &project_id, &caller, req).await?;
    Ok((StatusCode::CREATED, Json(payment)))
}

/// `GET /projects/:id/manual-payments`: the owner's review queue.
pub async fn list_project_manual_payments(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
    Caller(caller): Caller,
) -> Result<Json<ManualPaymentsResponse>> {
    let payments = manual::list_for_owner(&state.pool, &project_id, &caller).await?;
    Ok(Json(ManualPaymentsResponse {
        count: payments.len(),
        payments,
    }))
}

/// `GET /manual-payments`: the caller's own submissions.
pub async fn list_my_manual_payments(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
) -> Result<Json<ManualPaymentsResponse>> {
    let payments = db::list_manual_payments_for_donor(&state.pool, &caller).await?;
    Ok(Json(ManualPaymentsResponse {
        count: payments.len(),
        payments,
    }))
}

/// `GET /manual-payments/:id`
pub async fn get_manual_payment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Caller(caller): Caller,
) -> Result<Json<ManualPaymentDetail>> {
    Ok(Json(manual::detail(&state.pool, &id, &caller).await?))
}

/// `POST /manual-payments/:id/approve`
pub async fn approve_manual_payment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Caller(caller): Caller,
) -> Result<Json<ApprovalOutcome>> {
    Ok(Json(manual::approve(&state, &id, &caller).await?))
}

/// `POST /manual-payments/:id/reject`
pub async fn reject_manual_payment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Caller(caller): Caller,
) -> Result<Json<ManualPayment>> {
    Ok(Json(manual::reject(&state.pool, &id, &caller).await?))
}

/// `GET /projects/:id/funding`
pub async fn get_funding(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> Result<Json<FundingResponse>> {
    let project = db::get_project(&state.pool, &project_id)
        .await?
        .ok_or_else(|| PaymentError::NotFound(format!("Project {project_id}")))?;
    let progress_percent = if project.goal > 0 {
        (project.pledged as f64 / project.goal as f64) * 100.0
    } else {
        0.0
    };
    Ok(Json(FundingResponse {
        project_id: project.id,
        title: project.title,
        goal: project.goal,
        pledged: project.pledged,
        currency: state.config.currency.clone(),
        progress_percent,
    }))
}

/// `GET /projects/:id/contributions`
///
/// Public supporters list; e-mail addresses are never included.
pub async fn get_contributions(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
    Query(q): Query<ContributionsQuery>,
) -> Result<Json<ContributionsResponse>> {
    let limit = q.limit.unwrap_or(50).clamp(1, 500);
    let rows = db::list_contributions_for_project(&state.pool, &project_id, limit).await?;
    let contributions: Vec<PublicContribution> = rows
        .into_iter()
        .map(|c| PublicContribution {
            supporter: c.donor_ref.unwrap_or_else(|| "Anonymous".to_string()),
            amount: c.amount,
            origin: c.origin,
            created_at: c.created_at,
        })
        .collect();
    Ok(Json(ContributionsResponse {
        project_id,
        count: contributions.len(),
        contributions,
    }))
}

/// `GET /projects/:id/reconciliation`
pub async fn get_reconciliation(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> Result<Json<Reconciliation>> {
    Ok(Json(ledger::reconcile(&state.pool, &project_id).await?))
}

/// `GET /contributions/:id/receipt`
pub async fn get_receipt(
    State(state): State<Arc<AppState>>,
    Path(contribution_id): Path<String>,
    Caller(caller): Caller,
) -> Result<Json<Receipt>> {
    Ok(Json(
        receipts::for_contribution(&state, &contribution_id, &caller).await?,
    ))
}

/// `POST /contributions/:id/receipt`: issue, or return the existing receipt.
pub async fn issue_receipt(
    State(state): State<Arc<AppState>>,
    Path(contribution_id): Path<String>,
    Caller(caller): Caller,
) -> Result<Json<IssuedReceipt>> {
    Ok(Json(
        receipts::reissue(&state, &contribution_id, &caller).await?,
    ))
}

/// `POST /receipts/:id/redeliver`
pub async fn redeliver_receipt(
    State(state): State<Arc<AppState>>,
    Path(receipt_id): Path<String>,
    Caller(caller): Caller,
) -> Result<Json<IssuedReceipt>> {
    Ok(Json(receipts::redeliver(&state, &receipt_id, &caller).await?))
}

// ─────────────────────────────────────────────────────────
// HTTP-level tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::signature;
    use crate::testutil;

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn post_json(uri: &str, caller: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(caller) = caller {
            builder = builder.header(CALLER_HEADER, caller);
        }
        builder
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap()
    }

    fn get(uri: &str, caller: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(caller) = caller {
            builder = builder.header(CALLER_HEADER, caller);
        }
        builder.body(Body::empty()).unwrap()
    }

    fn webhook_request(body: &str, signature: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/webhooks/gateway")
            .header("content-type", "application/json")
            .header("x-razorpay-signature", signature)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let h = testutil::harness().await;
        let app = router(h.state.clone());
        let (status, body) = send(&app, get("/health", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn order_then_confirmation_then_webhook_counts_once() {
        let h = testutil::harness().await;
        let project = testutil::seed_project(&h.state.pool, "owner-1", 1_000_000).await;
        let app = router(h.state.clone());

        let (status, order) = send(
            &app,
            post_json("/orders", Some("donor-1"), json!({ "projectId": project, "amount": 500 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let order_handle = order["order_handle"].as_str().unwrap().to_string();
        assert_eq!(order["amount"], 500);
        assert_eq!(order["currency"], "INR");

        let sig = testutil::checkout_signature(&order_handle, "pay_500");
        let (status, confirmed) = send(
            &app,
            post_json(
                "/payments/confirm",
                Some("donor-1"),
                json!({
                    "razorpay_order_id": order_handle,
                    "razorpay_payment_id": "pay_500",
                    "razorpay_signature": sig,
                    "projectId": project,
                    "amount": 500,
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(confirmed["success"], true);
        assert_eq!(confirmed["duplicate"], false);

        let event = testutil::captured_event("pay_500", &order_handle, 500, &project);
        let (status, body) = send(
            &app,
            webhook_request(&event, &testutil::webhook_signature(&event)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "duplicate");

        let (_, funding) = send(&app, get(&format!("/projects/{project}/funding"), None)).await;
        assert_eq!(funding["pledged"], 500);
        let (_, list) = send(&app, get(&format!("/projects/{project}/contributions"), None)).await;
        assert_eq!(list["count"], 1);
        assert_eq!(list["contributions"][0]["supporter"], "donor-1");
    }

    #[tokio::test]
    async fn webhook_with_bad_signature_is_400_and_changes_nothing() {
        let h = testutil::harness().await;
        let project = testutil::seed_project(&h.state.pool, "owner-1", 10_000).await;
        let app = router(h.state.clone());

        let event = testutil::captured_event("pay_1", "order_x", 700, &project);
        let (status, body) = send(&app, webhook_request(&event, &"0".repeat(64))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid signature");
        assert_eq!(testutil::pledged(&h.state.pool, &project).await, 0);
        assert_eq!(testutil::contribution_count(&h.state.pool, &project).await, 0);
    }

    #[tokio::test]
    async fn create_order_rejects_non_positive_amounts() {
        let h = testutil::harness().await;
        let project = testutil::seed_project(&h.state.pool, "owner-1", 10_000).await;
        let app = router(h.state.clone());

        for amount in [0, -1] {
            let (status, body) = send(
                &app,
                post_json("/orders", None, json!({ "project_id": project, "amount": amount })),
            )
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(body["error"], format!("Invalid amount: {amount}"));
        }
        assert_eq!(h.gateway.calls(), 0);
    }

    #[tokio::test]
    async fn manual_flow_over_http() {
        let h = testutil::harness().await;
        let project = testutil::seed_project(&h.state.pool, "owner-1", 1_000).await;
        let app = router(h.state.clone());

        let upload = Request::builder()
            .method("POST")
            .uri("/evidence")
            .header("content-type", "image/png")
            .header(CALLER_HEADER, "donor-1")
            .body(Body::from(vec![0x89, b'P', b'N', b'G']))
            .unwrap();
        let (status, evidence) = send(&app, upload).await;
        assert_eq!(status, StatusCode::OK);
        let evidence_ref = evidence["evidence_ref"].as_str().unwrap().to_string();

        let (status, submitted) = send(
            &app,
            post_json(
                &format!("/projects/{project}/manual-payments"),
                Some("donor-1"),
                json!({ "amount": 200, "evidence_ref": evidence_ref }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(submitted["status"], "submitted");
        let id = submitted["id"].as_str().unwrap().to_string();

        let (status, _) = send(
            &app,
            post_json(&format!("/manual-payments/{id}/approve"), Some("donor-1"), json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, approved) = send(
            &app,
            post_json(&format!("/manual-payments/{id}/approve"), Some("owner-1"), json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(approved["payment"]["status"], "verified");

        let (status, conflict) = send(
            &app,
            post_json(&format!("/manual-payments/{id}/approve"), Some("owner-1"), json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(conflict["status"], "verified");

        let (_, detail) = send(&app, get(&format!("/manual-payments/{id}"), Some("donor-1"))).await;
        assert!(detail["receipt"]["document_ref"].is_string());

        let (_, audit) = send(
            &app,
            get(&format!("/projects/{project}/reconciliation"), None),
        )
        .await;
        assert_eq!(audit["pledged"], 200);
        assert_eq!(audit["consistent"], true);
    }

    #[tokio::test]
    async fn caller_header_is_required_for_review() {
        let h = testutil::harness().await;
        let app = router(h.state.clone());
        let (status, body) = send(
            &app,
            post_json("/manual-payments/whatever/approve", None, json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Missing caller identity");
    }

    #[tokio::test]
    async fn receipt_routes_are_limited_to_donor_and_owner() {
        let h = testutil::harness().await;
        let project = testutil::seed_project(&h.state.pool, "owner-1", 10_000).await;
        testutil::seed_intent(&h.state.pool, &project, "order_r", 400).await;
        let app = router(h.state.clone());

        let (status, confirmed) = send(
            &app,
            post_json(
                "/payments/confirm",
                Some("donor-1"),
                json!({
                    "razorpay_order_id": "order_r",
                    "razorpay_payment_id": "pay_r",
                    "razorpay_signature": testutil::checkout_signature("order_r", "pay_r"),
                    "projectId": project,
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let uri = format!(
            "/contributions/{}/receipt",
            confirmed["contribution_id"].as_str().unwrap()
        );
        let mails = h.mailer.sent().len();

        let (status, _) = send(&app, get(&uri, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = send(&app, get(&uri, Some("stranger"))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = send(&app, post_json(&uri, Some("stranger"), json!({}))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(h.mailer.sent().len(), mails);

        let (status, donor_view) = send(&app, get(&uri, Some("donor-1"))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(donor_view["document_ref"].as_str().unwrap().ends_with(".pdf"));
        let (status, owner_view) = send(&app, post_json(&uri, Some("owner-1"), json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(owner_view["created"], false);
        assert_eq!(owner_view["receipt"]["id"], donor_view["id"]);
    }

    #[tokio::test]
    async fn tampered_confirmation_is_rejected_over_http() {
        let h = testutil::harness().await;
        let project = testutil::seed_project(&h.state.pool, "owner-1", 10_000).await;
        testutil::seed_intent(&h.state.pool, &project, "order_t", 900).await;
        let app = router(h.state.clone());

        let mut sig = signature::sign(
            signature::checkout_payload("order_t", "pay_t").as_bytes(),
            "checkout_secret",
        );
        sig.replace_range(0..1, if sig.starts_with('0') { "1" } else { "0" });

        let (status, body) = send(
            &app,
            post_json(
                "/payments/confirm",
                None,
                json!({
                    "order_handle": "order_t",
                    "payment_handle": "pay_t",
                    "signature": sig,
                    "project_id": project,
                    "amount": 900,
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid signature");
        assert!(body.get("expected").is_none());
        assert_eq!(testutil::pledged(&h.state.pool, &project).await, 0);
    }
}
