/// Invoice Finalizer
///
/// Turns a draft invoice into a collectable one: recomputes each item's
/// quantity from analytics, prices it through the grant waterfall with its
/// proration factor, applies credits FIFO, and mirrors the result onto the
/// payment provider. The provider upsert happens outside any database
/// transaction; a reported total that disagrees with the internal total is
/// fatal for the invoice and flags it for an operator.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use crate::analytics::{UsageAnalytics, UsageQuery};
use crate::database::DatabaseManager;
use crate::error::{BillingError, BillingResult};
use crate::grant_snapshot;
use crate::payment_provider::{CreateInvoiceRequest, LineItemRequest, PaymentProvider};
use crate::pricing;
use crate::types::*;

/// Provider line reference for the single credit line.
const CREDIT_LINE_REFERENCE: &str = "credit_applied";

pub struct InvoiceFinalizer {
    db: Arc<DatabaseManager>,
    analytics: Arc<dyn UsageAnalytics>,
    provider: Arc<dyn PaymentProvider>,
    /// Bounds concurrent provider upserts across finalizer callers to
    /// avoid rate-limit storms.
    provider_permits: Arc<tokio::sync::Semaphore>,
}

impl InvoiceFinalizer {
    pub fn new(
        db: Arc<DatabaseManager>,
        analytics: Arc<dyn UsageAnalytics>,
        provider: Arc<dyn PaymentProvider>,
        provider_concurrency: usize,
    ) -> Self {
        Self {
            db,
            analytics,
            provider,
            provider_permits: Arc::new(tokio::sync::Semaphore::new(provider_concurrency.max(1))),
        }
    }

    /// Finalize one invoice. Already-final invoices pass through
    /// unchanged; drafts (and unpaid invoices that never reached the
    /// provider) are priced, credited and upserted.
    pub async fn finalize_invoice(
        &self,
        project_id: &str,
        invoice_id: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<Invoice> {
        let mut invoice = self
            .db
            .get_invoice(project_id, invoice_id)?
            .ok_or_else(|| BillingError::NotFound {
                entity: "invoice",
                id: invoice_id.to_string(),
            })?;

        let needs_finalize = invoice.status == InvoiceStatus::Draft
            || (invoice.status == InvoiceStatus::Unpaid
                && invoice.invoice_payment_provider_id.is_none());
        if !needs_finalize {
            return Ok(invoice);
        }

        // 1-3. Quantities and waterfall prices, persisted in one batch.
        let items = self.db.list_items_for_invoice(project_id, invoice_id)?;
        let mut updates = Vec::new();
        let mut subtotal: Cents = 0;
        for item in &items {
            if item.kind == InvoiceItemKind::CreditApplied {
                continue;
            }
            let (quantity, unit, amount_subtotal, is_overage) =
                self.price_item(&invoice, item, now).await?;
            let factor = item.proration_factor.unwrap_or(1.0);
            let amount_total = (amount_subtotal as f64 * factor).round() as Cents;
            subtotal += amount_total;
            updates.push((
                item.id.clone(),
                quantity,
                unit,
                amount_subtotal,
                amount_total,
                is_overage,
            ));
        }
        self.db.update_invoice_item_amounts(project_id, &updates)?;

        // 4. Credits, FIFO by expiry, bounded by the subtotal.
        let (credit_used, _applications) = self.db.apply_credits(
            project_id,
            invoice_id,
            &invoice.customer_id,
            &invoice.currency,
            invoice.payment_provider,
            subtotal,
            now,
        )?;

        // 5. Totals and status.
        invoice.subtotal = subtotal;
        invoice.amount_credit_used = credit_used;
        invoice.total = (subtotal - credit_used).max(0);
        invoice.issue_date = Some(now);
        invoice.status = if invoice.total == 0 {
            InvoiceStatus::Void
        } else {
            InvoiceStatus::Unpaid
        };
        self.db.save_invoice(&invoice)?;
        info!(
            invoice_id,
            subtotal = invoice.subtotal,
            credit = credit_used,
            total = invoice.total,
            status = invoice.status.as_str(),
            "invoice finalized internally"
        );

        // 6. Provider mirror, outside any transaction. Fully credited
        // invoices never reach the provider.
        if invoice.status == InvoiceStatus::Unpaid {
            self.upsert_provider_invoice(project_id, &mut invoice, now)
                .await?;
        }
        Ok(invoice)
    }

    /// Quantity and waterfall subtotal for one invoice item.
    async fn price_item(
        &self,
        invoice: &Invoice,
        item: &InvoiceItem,
        now: DateTime<Utc>,
    ) -> BillingResult<(f64, Option<Cents>, Cents, bool)> {
        if item.kind == InvoiceItemKind::Trial {
            return Ok((0.0, None, 0, false));
        }
        let Some(feature_id) = item.feature_plan_version_id.as_deref() else {
            return Ok((item.quantity, item.unit_amount_cents, item.amount_subtotal, false));
        };
        let feature = self
            .db
            .get_feature_plan_version(&invoice.project_id, feature_id)?
            .ok_or_else(|| BillingError::NotFound {
                entity: "feature_plan_version",
                id: feature_id.to_string(),
            })?;

        let fixed_units = match item.subscription_item_id.as_deref() {
            Some(sub_item_id) => self
                .db
                .get_item(&invoice.project_id, sub_item_id)?
                .and_then(|i| i.units),
            None => None,
        };
        let quantity = match fixed_units {
            Some(units) => units as f64,
            None => {
                self.aggregated_quantity(invoice, &feature, item, now)
                    .await?
            }
        };

        let grants = self.db.list_grants_for_customer_feature(
            &invoice.project_id,
            &invoice.customer_id,
            &feature.feature_slug,
        )?;
        let breakdown = match grant_snapshot::merge(&grants, now)? {
            Some(snapshot) => {
                pricing::waterfall_price(snapshot.feature_type, &snapshot.grants, quantity)?
            }
            // No active grant set: price straight off the feature formula.
            None => {
                let synthetic = Grant {
                    id: feature.id.clone(),
                    project_id: feature.project_id.clone(),
                    subject_type: GrantSubject::Customer,
                    subject_id: invoice.customer_id.clone(),
                    feature_plan_version_id: feature.id.clone(),
                    feature_slug: feature.feature_slug.clone(),
                    feature_type: feature.feature_type,
                    aggregation_method: feature.aggregation_method,
                    reset_config: feature.reset_config,
                    pricing: feature.pricing.clone(),
                    kind: GrantKind::Subscription,
                    priority: GrantKind::Subscription.default_priority(),
                    effective_at: item.cycle_start_at,
                    expires_at: None,
                    limit: feature.limit,
                    hard_limit: feature.hard_limit,
                    units: None,
                    deleted: false,
                    created_at: item.cycle_start_at,
                };
                pricing::waterfall_price(feature.feature_type, &[synthetic], quantity)?
            }
        };

        let is_overage = breakdown.lines.iter().any(|l| l.is_overage);
        let unit = match breakdown.lines.as_slice() {
            [only] => only.unit_amount_cents,
            _ => None,
        };
        Ok((quantity, unit, breakdown.total_cents, is_overage))
    }

    /// Usage quantity for the item's window; `*_all` aggregations read
    /// the entitlement's accumulated usage instead of a window query.
    async fn aggregated_quantity(
        &self,
        invoice: &Invoice,
        feature: &FeaturePlanVersion,
        item: &InvoiceItem,
        _now: DateTime<Utc>,
    ) -> BillingResult<f64> {
        if feature.aggregation_method.ignores_cycle_reset() {
            let entitlement = self.db.get_entitlement(
                &invoice.project_id,
                &invoice.customer_id,
                &feature.feature_slug,
            )?;
            return Ok(entitlement
                .map(|e| e.accumulated_usage + e.meter.usage)
                .unwrap_or(0.0));
        }
        let query = UsageQuery {
            project_id: Some(invoice.project_id.clone()),
            customer_id: Some(invoice.customer_id.clone()),
            feature_slug: Some(feature.feature_slug.clone()),
            start: Some(item.cycle_start_at),
            end: Some(item.cycle_end_at),
            ..Default::default()
        };
        self.analytics
            .aggregate(&query, feature.aggregation_method)
            .await
    }

    /// Create or update the provider invoice and its line items, finalize
    /// it, and verify the provider agrees on the total.
    async fn upsert_provider_invoice(
        &self,
        project_id: &str,
        invoice: &mut Invoice,
        now: DateTime<Utc>,
    ) -> BillingResult<()> {
        let _permit = self
            .provider_permits
            .acquire()
            .await
            .map_err(|_| BillingError::Provider("provider permit pool closed".to_string()))?;
        let provider_invoice = match &invoice.invoice_payment_provider_id {
            Some(id) => self.provider.get_invoice(id).await?,
            None => {
                self.provider
                    .create_invoice(&CreateInvoiceRequest {
                        external_id: invoice.id.clone(),
                        customer_id: invoice.customer_id.clone(),
                        currency: invoice.currency.clone(),
                        due_at: invoice.due_at,
                    })
                    .await?
            }
        };
        let provider_invoice_id = provider_invoice.id.clone();

        // Upsert item lines by their stable subscription-item reference.
        let items = self.db.list_items_for_invoice(project_id, &invoice.id)?;
        for item in &items {
            if item.kind == InvoiceItemKind::CreditApplied {
                continue;
            }
            let reference = item
                .subscription_item_id
                .clone()
                .unwrap_or_else(|| item.id.clone());
            let request = LineItemRequest {
                reference: reference.clone(),
                description: item.description.clone(),
                amount_cents: item.amount_total,
                quantity: item.quantity,
            };
            let existing = provider_invoice
                .line_items
                .iter()
                .find(|l| l.reference == reference);
            let line = match existing {
                Some(line) => {
                    self.provider
                        .update_invoice_item(&provider_invoice_id, &line.id, &request)
                        .await?
                }
                None => {
                    self.provider
                        .add_invoice_item(&provider_invoice_id, &request)
                        .await?
                }
            };
            self.db
                .set_invoice_item_provider_id(project_id, &item.id, &line.id)?;
        }

        // One negative credit line covers every application.
        if invoice.amount_credit_used > 0 {
            let request = LineItemRequest {
                reference: CREDIT_LINE_REFERENCE.to_string(),
                description: "credit applied".to_string(),
                amount_cents: -invoice.amount_credit_used,
                quantity: 1.0,
            };
            let existing = provider_invoice
                .line_items
                .iter()
                .find(|l| l.reference == CREDIT_LINE_REFERENCE);
            match existing {
                Some(line) => {
                    self.provider
                        .update_invoice_item(&provider_invoice_id, &line.id, &request)
                        .await?;
                }
                None => {
                    self.provider
                        .add_invoice_item(&provider_invoice_id, &request)
                        .await?;
                }
            }
        }

        let finalized = self.provider.finalize_invoice(&provider_invoice_id).await?;
        if finalized.total_cents != invoice.total {
            // Reconciliation failure needs an operator; the invoice stays
            // unpaid and is excluded from collection.
            invoice.metadata_reason = Some("provider_mismatch".to_string());
            invoice.invoice_payment_provider_id = Some(provider_invoice_id.clone());
            invoice.invoice_payment_provider_url = finalized.url.clone();
            self.db.save_invoice(invoice)?;
            warn!(
                invoice_id = %invoice.id,
                provider_total = finalized.total_cents,
                internal_total = invoice.total,
                "provider total mismatch after finalize"
            );
            return Err(BillingError::ProviderMismatch {
                invoice_id: invoice.id.clone(),
                provider_total: finalized.total_cents,
                internal_total: invoice.total,
            });
        }

        invoice.invoice_payment_provider_id = Some(provider_invoice_id);
        invoice.invoice_payment_provider_url = finalized.url;
        invoice.issue_date = Some(now);
        self.db.save_invoice(invoice)?;
        Ok(())
    }
}
