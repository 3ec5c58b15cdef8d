/// Payment Provider Interface
///
/// Contract for the external payment provider. The engine upserts invoices
/// and line items, finalizes them, and drives collection through this
/// trait; real integrations (Stripe et al.) are out of scope and live
/// behind it. `MockPaymentProvider` is a deterministic in-process
/// implementation used by the binary and the tests, with knobs for
/// failure injection and total overrides.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

use crate::error::{BillingError, BillingResult};
use crate::types::{new_id, Cents};

/// Provider-side invoice status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderInvoiceStatus {
    Draft,
    Open,
    Paid,
    Void,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderLineItem {
    pub id: String,
    /// Stable reference carried in metadata: the subscription item id for
    /// period lines, or `credit_applied` for the credit line.
    pub reference: String,
    pub description: String,
    pub amount_cents: Cents,
    pub quantity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInvoice {
    pub id: String,
    pub status: ProviderInvoiceStatus,
    pub total_cents: Cents,
    pub currency: String,
    pub url: Option<String>,
    pub line_items: Vec<ProviderLineItem>,
}

#[derive(Debug, Clone)]
pub struct CreateInvoiceRequest {
    pub external_id: String,
    pub customer_id: String,
    pub currency: String,
    pub due_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct LineItemRequest {
    pub reference: String,
    pub description: String,
    pub amount_cents: Cents,
    pub quantity: f64,
}

/// Outcome of a collection attempt.
#[derive(Debug, Clone)]
pub struct PaymentOutcome {
    pub succeeded: bool,
    pub error: Option<String>,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn create_invoice(&self, request: &CreateInvoiceRequest) -> BillingResult<ProviderInvoice>;
    async fn update_invoice(
        &self,
        provider_invoice_id: &str,
        due_at: DateTime<Utc>,
    ) -> BillingResult<ProviderInvoice>;
    async fn get_invoice(&self, provider_invoice_id: &str) -> BillingResult<ProviderInvoice>;
    async fn finalize_invoice(&self, provider_invoice_id: &str) -> BillingResult<ProviderInvoice>;
    async fn add_invoice_item(
        &self,
        provider_invoice_id: &str,
        item: &LineItemRequest,
    ) -> BillingResult<ProviderLineItem>;
    async fn update_invoice_item(
        &self,
        provider_invoice_id: &str,
        item_id: &str,
        item: &LineItemRequest,
    ) -> BillingResult<ProviderLineItem>;
    async fn collect_payment(
        &self,
        provider_invoice_id: &str,
        payment_method_id: &str,
    ) -> BillingResult<PaymentOutcome>;
    async fn send_invoice(&self, provider_invoice_id: &str) -> BillingResult<()>;
    async fn get_status_invoice(&self, provider_invoice_id: &str)
        -> BillingResult<ProviderInvoiceStatus>;
    fn format_amount(&self, amount_cents: Cents, currency: &str) -> String;
}

/// Deterministic in-process provider.
#[derive(Default)]
pub struct MockPaymentProvider {
    invoices: RwLock<HashMap<String, ProviderInvoice>>,
    /// When set, collection attempts fail until cleared.
    fail_collections: AtomicBool,
    /// Random collection failure rate in `[0, 1]`; 0 by default.
    failure_rate: f64,
    /// Reported totals overridden per provider invoice id, to exercise
    /// reconciliation mismatches.
    total_overrides: RwLock<HashMap<String, Cents>>,
    /// Skew applied to every reported total; lets callers provoke a
    /// mismatch before the provider invoice id exists.
    total_delta: std::sync::atomic::AtomicI64,
}

impl MockPaymentProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_rate(failure_rate: f64) -> Self {
        Self {
            failure_rate,
            ..Self::default()
        }
    }

    pub fn set_fail_collections(&self, fail: bool) {
        self.fail_collections.store(fail, Ordering::SeqCst);
    }

    /// Skew every reported total by `delta` cents.
    pub fn set_total_delta(&self, delta: Cents) {
        self.total_delta.store(delta, Ordering::SeqCst);
    }

    /// Force `finalize_invoice`/`get_invoice` to report this total.
    pub async fn override_total(&self, provider_invoice_id: &str, total_cents: Cents) {
        self.total_overrides
            .write()
            .await
            .insert(provider_invoice_id.to_string(), total_cents);
    }

    /// Mark a provider invoice paid out of band (simulates a customer
    /// paying a sent invoice).
    pub async fn mark_paid(&self, provider_invoice_id: &str) -> BillingResult<()> {
        let mut invoices = self.invoices.write().await;
        let invoice = invoices
            .get_mut(provider_invoice_id)
            .ok_or_else(|| BillingError::Provider(format!(
                "unknown provider invoice {provider_invoice_id}"
            )))?;
        invoice.status = ProviderInvoiceStatus::Paid;
        Ok(())
    }

    async fn reported_total(&self, invoice: &ProviderInvoice) -> Cents {
        match self.total_overrides.read().await.get(&invoice.id) {
            Some(total) => *total,
            None => {
                let computed: Cents = invoice.line_items.iter().map(|l| l.amount_cents).sum();
                computed + self.total_delta.load(Ordering::SeqCst)
            }
        }
    }
}

#[async_trait]
impl PaymentProvider for MockPaymentProvider {
    async fn create_invoice(&self, request: &CreateInvoiceRequest) -> BillingResult<ProviderInvoice> {
        let invoice = ProviderInvoice {
            id: format!("pin_{}", new_id()),
            status: ProviderInvoiceStatus::Draft,
            total_cents: 0,
            currency: request.currency.clone(),
            url: Some(format!("https://pay.invalid/i/{}", request.external_id)),
            line_items: Vec::new(),
        };
        self.invoices
            .write()
            .await
            .insert(invoice.id.clone(), invoice.clone());
        Ok(invoice)
    }

    async fn update_invoice(
        &self,
        provider_invoice_id: &str,
        _due_at: DateTime<Utc>,
    ) -> BillingResult<ProviderInvoice> {
        self.get_invoice(provider_invoice_id).await
    }

    async fn get_invoice(&self, provider_invoice_id: &str) -> BillingResult<ProviderInvoice> {
        let invoices = self.invoices.read().await;
        let mut invoice = invoices
            .get(provider_invoice_id)
            .cloned()
            .ok_or_else(|| BillingError::Provider(format!(
                "unknown provider invoice {provider_invoice_id}"
            )))?;
        invoice.total_cents = self.reported_total(&invoice).await;
        Ok(invoice)
    }

    async fn finalize_invoice(&self, provider_invoice_id: &str) -> BillingResult<ProviderInvoice> {
        {
            let mut invoices = self.invoices.write().await;
            let invoice = invoices
                .get_mut(provider_invoice_id)
                .ok_or_else(|| BillingError::Provider(format!(
                    "unknown provider invoice {provider_invoice_id}"
                )))?;
            if invoice.status == ProviderInvoiceStatus::Draft {
                invoice.status = ProviderInvoiceStatus::Open;
            }
        }
        self.get_invoice(provider_invoice_id).await
    }

    async fn add_invoice_item(
        &self,
        provider_invoice_id: &str,
        item: &LineItemRequest,
    ) -> BillingResult<ProviderLineItem> {
        let mut invoices = self.invoices.write().await;
        let invoice = invoices
            .get_mut(provider_invoice_id)
            .ok_or_else(|| BillingError::Provider(format!(
                "unknown provider invoice {provider_invoice_id}"
            )))?;
        let line = ProviderLineItem {
            id: format!("pli_{}", new_id()),
            reference: item.reference.clone(),
            description: item.description.clone(),
            amount_cents: item.amount_cents,
            quantity: item.quantity,
        };
        invoice.line_items.push(line.clone());
        Ok(line)
    }

    async fn update_invoice_item(
        &self,
        provider_invoice_id: &str,
        item_id: &str,
        item: &LineItemRequest,
    ) -> BillingResult<ProviderLineItem> {
        let mut invoices = self.invoices.write().await;
        let invoice = invoices
            .get_mut(provider_invoice_id)
            .ok_or_else(|| BillingError::Provider(format!(
                "unknown provider invoice {provider_invoice_id}"
            )))?;
        let line = invoice
            .line_items
            .iter_mut()
            .find(|l| l.id == item_id)
            .ok_or_else(|| BillingError::Provider(format!("unknown line item {item_id}")))?;
        line.description = item.description.clone();
        line.amount_cents = item.amount_cents;
        line.quantity = item.quantity;
        Ok(line.clone())
    }

    async fn collect_payment(
        &self,
        provider_invoice_id: &str,
        _payment_method_id: &str,
    ) -> BillingResult<PaymentOutcome> {
        if self.fail_collections.load(Ordering::SeqCst) {
            return Ok(PaymentOutcome {
                succeeded: false,
                error: Some("card_declined".to_string()),
            });
        }
        if self.failure_rate > 0.0 && fastrand::f64() < self.failure_rate {
            return Ok(PaymentOutcome {
                succeeded: false,
                error: Some("payment_intent_failed".to_string()),
            });
        }
        let mut invoices = self.invoices.write().await;
        if let Some(invoice) = invoices.get_mut(provider_invoice_id) {
            invoice.status = ProviderInvoiceStatus::Paid;
        }
        Ok(PaymentOutcome {
            succeeded: true,
            error: None,
        })
    }

    async fn send_invoice(&self, provider_invoice_id: &str) -> BillingResult<()> {
        // Sending keeps the invoice open; payment arrives out of band.
        let invoices = self.invoices.read().await;
        if !invoices.contains_key(provider_invoice_id) {
            return Err(BillingError::Provider(format!(
                "unknown provider invoice {provider_invoice_id}"
            )));
        }
        Ok(())
    }

    async fn get_status_invoice(
        &self,
        provider_invoice_id: &str,
    ) -> BillingResult<ProviderInvoiceStatus> {
        Ok(self.get_invoice(provider_invoice_id).await?.status)
    }

    fn format_amount(&self, amount_cents: Cents, currency: &str) -> String {
        format!("{:.2} {}", amount_cents as f64 / 100.0, currency.to_uppercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn request() -> CreateInvoiceRequest {
        CreateInvoiceRequest {
            external_id: "inv_1".into(),
            customer_id: "cus_1".into(),
            currency: "USD".into(),
            due_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_invoice_lifecycle() {
        let provider = MockPaymentProvider::new();
        let invoice = provider.create_invoice(&request()).await.unwrap();
        assert_eq!(invoice.status, ProviderInvoiceStatus::Draft);

        provider
            .add_invoice_item(
                &invoice.id,
                &LineItemRequest {
                    reference: "item_1".into(),
                    description: "api usage".into(),
                    amount_cents: 500,
                    quantity: 5.0,
                },
            )
            .await
            .unwrap();

        let finalized = provider.finalize_invoice(&invoice.id).await.unwrap();
        assert_eq!(finalized.status, ProviderInvoiceStatus::Open);
        assert_eq!(finalized.total_cents, 500);

        let outcome = provider.collect_payment(&invoice.id, "pm_1").await.unwrap();
        assert!(outcome.succeeded);
        assert_eq!(
            provider.get_status_invoice(&invoice.id).await.unwrap(),
            ProviderInvoiceStatus::Paid
        );
    }

    #[tokio::test]
    async fn test_total_override_for_mismatch() {
        let provider = MockPaymentProvider::new();
        let invoice = provider.create_invoice(&request()).await.unwrap();
        provider
            .add_invoice_item(
                &invoice.id,
                &LineItemRequest {
                    reference: "item_1".into(),
                    description: "api usage".into(),
                    amount_cents: 500,
                    quantity: 5.0,
                },
            )
            .await
            .unwrap();
        provider.override_total(&invoice.id, 501).await;

        let finalized = provider.finalize_invoice(&invoice.id).await.unwrap();
        assert_eq!(finalized.total_cents, 501);
    }

    #[tokio::test]
    async fn test_forced_collection_failure() {
        let provider = MockPaymentProvider::new();
        let invoice = provider.create_invoice(&request()).await.unwrap();
        provider.set_fail_collections(true);

        let outcome = provider.collect_payment(&invoice.id, "pm_1").await.unwrap();
        assert!(!outcome.succeeded);
        assert_eq!(outcome.error.as_deref(), Some("card_declined"));
    }

    #[test]
    fn test_format_amount() {
        let provider = MockPaymentProvider::new();
        assert_eq!(provider.format_amount(1250, "usd"), "12.50 USD");
    }
}
