//! Receipt service.
//!
//! Runs after a contribution has been committed. Generating and storing the
//! receipt document must succeed for [`issue`] to succeed; e-mail delivery is
//! best effort and only ever produces warnings. Nothing in here touches the
//! ledger, so [`redeliver`] can be retried freely.

use printpdf::{BuiltinFont, Mm, PdfDocument};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::api::AppState;
use crate::db;
use crate::errors::{PaymentError, Result};
use crate::notify::Email;
use crate::types::{
    format_amount, manual_payment_id_from_key, new_id, now_unix, Contribution, Project, Receipt,
};

#[derive(Debug, Clone, Serialize)]
pub struct IssuedReceipt {
    pub receipt: Receipt,
    /// `false` when an existing receipt was returned.
    pub created: bool,
    pub warnings: Vec<String>,
}

/// Issue the receipt for `contribution`, or return the one that already exists.
#[instrument(skip(state, contribution), fields(contribution_id = %contribution.id))]
pub async fn issue(
    state: &AppState,
    contribution: &Contribution,
    manual_payment_id: Option<&str>,
) -> Result<IssuedReceipt> {
    if let Some(existing) = db::get_receipt_by_contribution(&state.pool, &contribution.id).await? {
        return Ok(IssuedReceipt {
            receipt: existing,
            created: false,
            warnings: Vec::new(),
        });
    }

    let project = db::get_project(&state.pool, &contribution.project_id)
        .await?
        .ok_or_else(|| PaymentError::NotFound(format!("Project {}", contribution.project_id)))?;

    let document = render_document(&project, contribution, &state.config.currency)?;
    // Same path for the same contribution, so a retried upload replaces rather
    // than duplicates.
    let path = format!("receipts/{}.pdf", contribution.id);
    let document_ref = state.blobs.put(&path, document, "application/pdf").await?;

    let receipt = Receipt {
        id: new_id(),
        contribution_id: contribution.id.clone(),
        manual_payment_id: manual_payment_id.map(str::to_string),
        document_ref,
        emailed_to_donor: false,
        emailed_to_owner: false,
        created_at: now_unix(),
    };

    if !db::insert_receipt_if_absent(&state.pool, &receipt).await? {
        let existing = db::get_receipt_by_contribution(&state.pool, &contribution.id)
            .await?
            .ok_or_else(|| PaymentError::NotFound(format!("Receipt for {}", contribution.id)))?;
        return Ok(IssuedReceipt {
            receipt: existing,
            created: false,
            warnings: Vec::new(),
        });
    }
    info!(receipt_id = %receipt.id, "Receipt generated");

    let (receipt, warnings) = deliver(state, receipt, &project, contribution).await;
    Ok(IssuedReceipt {
        receipt,
        created: true,
        warnings,
    })
}

/// The receipt of a contribution, readable by its donor and the project owner.
#[instrument(skip(state))]
pub async fn for_contribution(
    state: &AppState,
    contribution_id: &str,
    caller_id: &str,
) -> Result<Receipt> {
    let contribution = load_contribution(state, contribution_id).await?;
    authorize(state, &contribution, caller_id, "read").await?;
    db::get_receipt_by_contribution(&state.pool, contribution_id)
        .await?
        .ok_or_else(|| PaymentError::NotFound(format!("Receipt for {contribution_id}")))
}

/// Issue a missing receipt on behalf of the donor or the project owner.
#[instrument(skip(state))]
pub async fn reissue(
    state: &AppState,
    contribution_id: &str,
    caller_id: &str,
) -> Result<IssuedReceipt> {
    let contribution = load_contribution(state, contribution_id).await?;
    authorize(state, &contribution, caller_id, "issue").await?;
    let manual_payment_id = contribution
        .external_payment_id
        .as_deref()
        .and_then(manual_payment_id_from_key)
        .map(str::to_string);
    issue(state, &contribution, manual_payment_id.as_deref()).await
}

async fn load_contribution(state: &AppState, contribution_id: &str) -> Result<Contribution> {
    db::get_contribution(&state.pool, contribution_id)
        .await?
        .ok_or_else(|| PaymentError::NotFound(format!("Contribution {contribution_id}")))
}

/// Refuse anyone but the contribution's donor and the project owner.
async fn authorize(
    state: &AppState,
    contribution: &Contribution,
    caller_id: &str,
    action: &'static str,
) -> Result<()> {
    let project = db::get_project(&state.pool, &contribution.project_id)
        .await?
        .ok_or_else(|| PaymentError::NotFound(format!("Project {}", contribution.project_id)))?;
    let is_donor = contribution.donor_ref.as_deref() == Some(caller_id);
    if project.owner_id != caller_id && !is_donor {
        warn!(
            target: "audit",
            caller_id,
            contribution_id = %contribution.id,
            action,
            "Receipt access by stranger refused"
        );
        return Err(PaymentError::Forbidden);
    }
    Ok(())
}

/// Retry delivery to whichever recipients have not received the receipt yet.
/// Only the project owner may trigger this.
#[instrument(skip(state))]
pub async fn redeliver(state: &AppState, receipt_id: &str, caller_id: &str) -> Result<IssuedReceipt> {
    let receipt = db::get_receipt(&state.pool, receipt_id)
        .await?
        .ok_or_else(|| PaymentError::NotFound(format!("Receipt {receipt_id}")))?;
    let contribution = db::get_contribution(&state.pool, &receipt.contribution_id)
        .await?
        .ok_or_else(|| PaymentError::NotFound(format!("Contribution {}", receipt.contribution_id)))?;
    let project = db::get_project(&state.pool, &contribution.project_id)
        .await?
        .ok_or_else(|| PaymentError::NotFound(format!("Project {}", contribution.project_id)))?;

    if project.owner_id != caller_id {
        warn!(target: "audit", caller_id, receipt_id, "Receipt redelivery by non-owner refused");
        return Err(PaymentError::Forbidden);
    }

    let (receipt, warnings) = deliver(state, receipt, &project, &contribution).await;
    Ok(IssuedReceipt {
        receipt,
        created: false,
        warnings,
    })
}

async fn deliver(
    state: &AppState,
    receipt: Receipt,
    project: &Project,
    contribution: &Contribution,
) -> (Receipt, Vec<String>) {
    let mut warnings = Vec::new();
    let amount = format_amount(contribution.amount, &state.config.currency);

    let mut to_donor = receipt.emailed_to_donor;
    if !to_donor {
        match contribution.donor_email.as_deref() {
            Some(addr) => {
                let email = Email {
                    to: addr.to_string(),
                    subject: "Payment Receipt - Fundora".to_string(),
                    html: donor_email_html(&project.title, &amount, &receipt.document_ref),
                };
                match state.mailer.send(&email).await {
                    Ok(()) => to_donor = true,
                    Err(e) => {
                        warn!(receipt_id = %receipt.id, "Receipt delivery to donor failed: {e}");
                        warnings.push(format!("donor delivery failed: {e}"));
                    }
                }
            }
            None => warnings.push("no donor e-mail on file".to_string()),
        }
    }

    let mut to_owner = receipt.emailed_to_owner;
    if !to_owner {
        match project.owner_email.as_deref() {
            Some(addr) => {
                let email = Email {
                    to: addr.to_string(),
                    subject: format!("New contribution to {}", project.title),
                    html: owner_email_html(&project.title, &amount, &receipt.document_ref),
                };
                match state.mailer.send(&email).await {
                    Ok(()) => to_owner = true,
                    Err(e) => {
                        warn!(receipt_id = %receipt.id, "Receipt delivery to owner failed: {e}");
                        warnings.push(format!("owner delivery failed: {e}"));
                    }
                }
            }
            None => warnings.push("no owner e-mail on file".to_string()),
        }
    }

    if to_donor != receipt.emailed_to_donor || to_owner != receipt.emailed_to_owner {
        if let Err(e) = db::mark_receipt_delivered(&state.pool, &receipt.id, to_donor, to_owner).await {
            warn!(receipt_id = %receipt.id, "Could not persist delivery flags: {e}");
            warnings.push("delivery flags not persisted".to_string());
        }
    }

    (
        Receipt {
            emailed_to_donor: to_donor,
            emailed_to_owner: to_owner,
            ..receipt
        },
        warnings,
    )
}

/// Label/value rows printed on the receipt.
pub fn receipt_rows(
    project: &Project,
    contribution: &Contribution,
    currency: &str,
) -> Vec<(&'static str, String)> {
    let date = chrono::DateTime::from_timestamp(contribution.created_at, 0)
        .map(|d| d.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "-".to_string());

    vec![
        ("Project", project.title.clone()),
        ("Amount", format_amount(contribution.amount, currency)),
        ("Status", "VERIFIED".to_string()),
        ("Method", contribution.origin.as_str().to_string()),
        (
            "Payer",
            contribution
                .donor_ref
                .clone()
                .unwrap_or_else(|| "Anonymous".to_string()),
        ),
        (
            "Payer Email",
            contribution
                .donor_email
                .clone()
                .unwrap_or_else(|| "-".to_string()),
        ),
        ("Creator", project.owner_id.clone()),
        ("Contribution ID", contribution.id.clone()),
        (
            "Payment ID",
            contribution
                .external_payment_id
                .clone()
                .unwrap_or_else(|| "-".to_string()),
        ),
        ("Date", date),
    ]
}

/// Render the receipt as a single A4 PDF page.
pub fn render_document(
    project: &Project,
    contribution: &Contribution,
    currency: &str,
) -> Result<Vec<u8>> {
    let render_err = |e: printpdf::Error| PaymentError::Render(e.to_string());

    let (doc, page, layer) = PdfDocument::new("Payment Receipt", Mm(210.0), Mm(297.0), "Receipt");
    let regular = doc
        .add_builtin_font(BuiltinFont::Helvetica)
        .map_err(render_err)?;
    let bold = doc
        .add_builtin_font(BuiltinFont::HelveticaBold)
        .map_err(render_err)?;
    let canvas = doc.get_page(page).get_layer(layer);

    canvas.use_text("Fundora", 24.0, Mm(20.0), Mm(270.0), &bold);
    canvas.use_text(
        "Fund ideas. Fuel innovation. Empower creators.",
        10.0,
        Mm(20.0),
        Mm(262.0),
        &regular,
    );
    canvas.use_text("Payment Receipt", 16.0, Mm(20.0), Mm(245.0), &bold);

    let mut y = 230.0;
    for (label, value) in receipt_rows(project, contribution, currency) {
        canvas.use_text(format!("{label}:"), 11.0, Mm(20.0), Mm(y), &bold);
        canvas.use_text(value, 11.0, Mm(65.0), Mm(y), &regular);
        y -= 8.0;
    }
    canvas.use_text(
        "Thank you for supporting this project on Fundora.",
        10.0,
        Mm(20.0),
        Mm(y - 10.0),
        &regular,
    );

    doc.save_to_bytes().map_err(render_err)
}

fn donor_email_html(project_title: &str, amount: &str, receipt_url: &str) -> String {
    format!(
        "<h2>Payment Successful</h2>\
         <p>Thank you for supporting <b>{project_title}</b>.</p>\
         <p>Amount: {amount}</p>\
         <p><a href=\"{receipt_url}\">Download Receipt</a></p>\
         <br /><p>Regards,<br/>Fundora</p>"
    )
}

fn owner_email_html(project_title: &str, amount: &str, receipt_url: &str) -> String {
    format!(
        "<h2>New contribution</h2>\
         <p><b>{project_title}</b> just received {amount}.</p>\
         <p><a href=\"{receipt_url}\">View Receipt</a></p>"
    )
}
