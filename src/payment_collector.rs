/// Payment Collector
///
/// Drives unpaid and waiting invoices to their terminal states through
/// the payment provider: automatic charges for `charge_automatically`,
/// send-and-poll for `send_invoice`. Every attempt is recorded on the
/// invoice; hitting the attempt cap or the past-due date fails the
/// invoice with `pending_expiration`.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use crate::database::DatabaseManager;
use crate::error::{BillingError, BillingResult};
use crate::payment_provider::{PaymentProvider, ProviderInvoiceStatus};
use crate::types::*;

/// What a collection pass observed; the scheduler maps these onto machine
/// events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionSignal {
    Paid,
    PaymentFailed,
    Waiting,
    Expired,
    Voided,
    Skipped,
}

pub struct PaymentCollector {
    db: Arc<DatabaseManager>,
    provider: Arc<dyn PaymentProvider>,
}

impl PaymentCollector {
    pub fn new(db: Arc<DatabaseManager>, provider: Arc<dyn PaymentProvider>) -> Self {
        Self { db, provider }
    }

    /// One collection pass over a single invoice.
    pub async fn collect_invoice(
        &self,
        project_id: &str,
        invoice_id: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<(Invoice, CollectionSignal)> {
        let mut invoice = self
            .db
            .get_invoice(project_id, invoice_id)?
            .ok_or_else(|| BillingError::NotFound {
                entity: "invoice",
                id: invoice_id.to_string(),
            })?;

        if !matches!(invoice.status, InvoiceStatus::Unpaid | InvoiceStatus::Waiting) {
            return Ok((invoice, CollectionSignal::Skipped));
        }

        // Expiration wins over any further attempt.
        if invoice.payment_attempts.len() >= MAX_PAYMENT_ATTEMPTS || invoice.past_due_at < now {
            invoice.status = InvoiceStatus::Failed;
            invoice.metadata_reason = Some("pending_expiration".to_string());
            self.db.save_invoice(&invoice)?;
            warn!(
                invoice_id,
                attempts = invoice.payment_attempts.len(),
                "invoice expired without payment"
            );
            return Ok((invoice, CollectionSignal::Expired));
        }

        match invoice.status {
            InvoiceStatus::Unpaid => match invoice.collection_method {
                CollectionMethod::ChargeAutomatically => self.charge(&mut invoice, now).await,
                CollectionMethod::SendInvoice => self.send(&mut invoice, now).await,
            },
            InvoiceStatus::Waiting => self.poll(&mut invoice, now).await,
            _ => Ok((invoice, CollectionSignal::Skipped)),
        }
    }

    async fn charge(
        &self,
        invoice: &mut Invoice,
        now: DateTime<Utc>,
    ) -> BillingResult<(Invoice, CollectionSignal)> {
        let Some(provider_invoice_id) = invoice.invoice_payment_provider_id.clone() else {
            return Err(BillingError::Provider(format!(
                "invoice {} has no provider invoice to charge",
                invoice.id
            )));
        };
        let Some(payment_method_id) = invoice.payment_method_id.clone() else {
            invoice.payment_attempts.push(PaymentAttempt {
                at: now,
                succeeded: false,
                error: Some("missing_payment_method".to_string()),
            });
            self.db.save_invoice(invoice)?;
            return Ok((invoice.clone(), CollectionSignal::PaymentFailed));
        };

        let outcome = self
            .provider
            .collect_payment(&provider_invoice_id, &payment_method_id)
            .await?;
        invoice.payment_attempts.push(PaymentAttempt {
            at: now,
            succeeded: outcome.succeeded,
            error: outcome.error.clone(),
        });

        if outcome.succeeded {
            invoice.status = InvoiceStatus::Paid;
            invoice.paid_at = Some(now);
            self.db.save_invoice(invoice)?;
            info!(invoice_id = %invoice.id, "invoice paid");
            Ok((invoice.clone(), CollectionSignal::Paid))
        } else {
            self.db.save_invoice(invoice)?;
            warn!(
                invoice_id = %invoice.id,
                attempts = invoice.payment_attempts.len(),
                error = outcome.error.as_deref().unwrap_or("unknown"),
                "payment attempt failed"
            );
            Ok((invoice.clone(), CollectionSignal::PaymentFailed))
        }
    }

    async fn send(
        &self,
        invoice: &mut Invoice,
        now: DateTime<Utc>,
    ) -> BillingResult<(Invoice, CollectionSignal)> {
        let Some(provider_invoice_id) = invoice.invoice_payment_provider_id.clone() else {
            return Err(BillingError::Provider(format!(
                "invoice {} has no provider invoice to send",
                invoice.id
            )));
        };
        self.provider.send_invoice(&provider_invoice_id).await?;
        invoice.status = InvoiceStatus::Waiting;
        invoice.sent_at = Some(now);
        self.db.save_invoice(invoice)?;
        info!(invoice_id = %invoice.id, "invoice sent, awaiting payment");
        Ok((invoice.clone(), CollectionSignal::Waiting))
    }

    async fn poll(
        &self,
        invoice: &mut Invoice,
        now: DateTime<Utc>,
    ) -> BillingResult<(Invoice, CollectionSignal)> {
        let Some(provider_invoice_id) = invoice.invoice_payment_provider_id.clone() else {
            return Err(BillingError::Provider(format!(
                "invoice {} is waiting without a provider invoice",
                invoice.id
            )));
        };
        match self.provider.get_status_invoice(&provider_invoice_id).await? {
            ProviderInvoiceStatus::Paid => {
                invoice.status = InvoiceStatus::Paid;
                invoice.paid_at = Some(now);
                self.db.save_invoice(invoice)?;
                info!(invoice_id = %invoice.id, "sent invoice paid by customer");
                Ok((invoice.clone(), CollectionSignal::Paid))
            }
            ProviderInvoiceStatus::Void => {
                invoice.status = InvoiceStatus::Void;
                self.db.save_invoice(invoice)?;
                Ok((invoice.clone(), CollectionSignal::Voided))
            }
            _ => Ok((invoice.clone(), CollectionSignal::Waiting)),
        }
    }
}
