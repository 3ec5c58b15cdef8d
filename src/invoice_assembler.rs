/// Invoice Assembler
///
/// Groups due pending billing periods into draft invoices. Periods that
/// share a statement key, phase and invoice date are co-billed on one
/// invoice even when their service windows differ. Both the invoice and
/// its items are inserted idempotently against their uniqueness indices,
/// so a losing concurrent assembler simply re-reads the winner's rows.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::calendar_cycle::next_date_after;
use crate::config::BillingPolicyConfig;
use crate::database::DatabaseManager;
use crate::error::{BillingError, BillingResult};
use crate::period_materializer::PeriodMaterializer;
use crate::types::*;

/// Stable hash identifying the billing periods that must be co-billed on
/// a single invoice: SHA-256 over the pipe-joined ordered fields.
pub fn statement_key(
    project_id: &str,
    customer_id: &str,
    subscription_id: &str,
    invoice_at: DateTime<Utc>,
    currency: &str,
    payment_provider: PaymentProviderKind,
    collection_method: CollectionMethod,
) -> String {
    let joined = format!(
        "{}|{}|{}|{}|{}|{}|{}",
        project_id,
        customer_id,
        subscription_id,
        to_millis(invoice_at),
        currency,
        payment_provider.as_str(),
        collection_method.as_str(),
    );
    let mut hasher = Sha256::new();
    hasher.update(joined.as_bytes());
    hex::encode(hasher.finalize())
}

pub struct InvoiceAssembler {
    db: Arc<DatabaseManager>,
    policy: BillingPolicyConfig,
}

impl InvoiceAssembler {
    pub fn new(db: Arc<DatabaseManager>, policy: BillingPolicyConfig) -> Self {
        Self { db, policy }
    }

    /// Assemble draft invoices from every due pending billing period of
    /// the subscription. Returns the invoices touched (created or reused).
    pub async fn invoice_subscription(
        &self,
        project_id: &str,
        subscription_id: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<Vec<Invoice>> {
        let subscription = self
            .db
            .get_subscription(project_id, subscription_id)?
            .ok_or_else(|| BillingError::NotFound {
                entity: "subscription",
                id: subscription_id.to_string(),
            })?;
        let periods = self
            .db
            .list_due_pending_periods(project_id, subscription_id, now)?;
        if periods.is_empty() {
            return Ok(Vec::new());
        }

        // Group by (phase, statement key, invoice date).
        let mut groups: BTreeMap<(String, String, i64), Vec<BillingPeriod>> = BTreeMap::new();
        for period in periods {
            groups
                .entry((
                    period.subscription_phase_id.clone(),
                    period.statement_key.clone(),
                    to_millis(period.invoice_at),
                ))
                .or_default()
                .push(period);
        }

        let mut invoices = Vec::new();
        for ((phase_id, key, invoice_at_ms), group) in groups {
            let invoice_at = from_millis(invoice_at_ms);
            let phase = self
                .db
                .get_phase(project_id, &phase_id)?
                .ok_or_else(|| BillingError::NotFound {
                    entity: "subscription_phase",
                    id: phase_id.clone(),
                })?;
            let plan = self
                .db
                .get_plan_version(project_id, &phase.plan_version_id)?
                .ok_or_else(|| BillingError::NotFound {
                    entity: "plan_version",
                    id: phase.plan_version_id.clone(),
                })?;

            let statement_start = group.iter().map(|p| p.cycle_start_at).min().unwrap_or(invoice_at);
            let statement_end = group.iter().map(|p| p.cycle_end_at).max().unwrap_or(invoice_at);

            let grace_mins = if plan.billing_config.interval == BillingInterval::Minute {
                self.policy.grace_post_invoice_minute_mins
            } else {
                match plan.when_to_bill {
                    WhenToBill::PayInAdvance => self.policy.grace_post_invoice_advance_mins,
                    WhenToBill::PayInArrear => self.policy.grace_post_invoice_arrear_mins,
                }
            };
            let due_at = invoice_at + chrono::Duration::minutes(grace_mins);
            let past_due_at = next_date_after(due_at, plan.grace_period.unit, plan.grace_period.units);

            let draft = Invoice {
                id: new_id(),
                project_id: project_id.to_string(),
                subscription_id: subscription_id.to_string(),
                subscription_phase_id: phase_id.clone(),
                customer_id: subscription.customer_id.clone(),
                status: InvoiceStatus::Draft,
                statement_key: key.clone(),
                statement_start_at: statement_start,
                statement_end_at: statement_end,
                cycle_start_at: statement_start,
                cycle_end_at: statement_end,
                due_at,
                past_due_at,
                issue_date: None,
                paid_at: None,
                sent_at: None,
                subtotal: 0,
                total: 0,
                amount_credit_used: 0,
                payment_method_id: phase.payment_method_id.clone(),
                payment_provider: plan.payment_provider,
                currency: plan.currency.clone(),
                when_to_bill: plan.when_to_bill,
                collection_method: plan.collection_method,
                invoice_payment_provider_id: None,
                invoice_payment_provider_url: None,
                payment_attempts: Vec::new(),
                metadata_reason: None,
            };
            let invoice = self.db.insert_invoice_idempotent(&draft)?;
            if invoice.id == draft.id {
                info!(subscription_id, invoice_id = %invoice.id, "draft invoice created");
            } else {
                debug!(
                    subscription_id,
                    invoice_id = %invoice.id,
                    "statement already invoiced, reusing"
                );
            }

            let schedule = PeriodMaterializer::phase_schedule(&phase, &plan);
            let mut attached = Vec::new();
            for period in &group {
                let is_trial = period.kind == BillingPeriodKind::Trial;
                let proration = if is_trial {
                    0.0
                } else {
                    schedule.proration_factor(period.cycle_start_at, period.cycle_end_at)
                };
                let item = self.db.get_item(project_id, &period.subscription_item_id)?;
                let feature_plan_version_id = item.map(|i| i.feature_plan_version_id);

                let invoice_item = InvoiceItem {
                    id: new_id(),
                    project_id: project_id.to_string(),
                    invoice_id: invoice.id.clone(),
                    billing_period_id: Some(period.id.clone()),
                    subscription_item_id: Some(period.subscription_item_id.clone()),
                    feature_plan_version_id,
                    kind: if is_trial {
                        InvoiceItemKind::Trial
                    } else {
                        InvoiceItemKind::Period
                    },
                    quantity: 0.0,
                    unit_amount_cents: None,
                    amount_subtotal: 0,
                    amount_total: 0,
                    cycle_start_at: period.cycle_start_at,
                    cycle_end_at: period.cycle_end_at,
                    proration_factor: Some(proration),
                    description: format!(
                        "service {} to {}",
                        period.cycle_start_at.format("%Y-%m-%d"),
                        period.cycle_end_at.format("%Y-%m-%d")
                    ),
                    item_provider_id: None,
                    is_overage: false,
                };
                self.db.insert_invoice_item(&invoice_item)?;
                attached.push(period.id.clone());
            }

            self.db
                .mark_periods_invoiced(project_id, &attached, &invoice.id)?;
            invoices.push(invoice);
        }
        Ok(invoices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statement_key_shape_and_determinism() {
        let at = from_millis(1_704_067_200_000);
        let key = statement_key(
            "proj_1",
            "cus_1",
            "sub_1",
            at,
            "USD",
            PaymentProviderKind::Mock,
            CollectionMethod::ChargeAutomatically,
        );
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));

        let same = statement_key(
            "proj_1",
            "cus_1",
            "sub_1",
            at,
            "USD",
            PaymentProviderKind::Mock,
            CollectionMethod::ChargeAutomatically,
        );
        assert_eq!(key, same);
    }

    #[test]
    fn test_statement_key_field_sensitivity() {
        let at = from_millis(1_704_067_200_000);
        let base = statement_key(
            "proj_1",
            "cus_1",
            "sub_1",
            at,
            "USD",
            PaymentProviderKind::Mock,
            CollectionMethod::ChargeAutomatically,
        );
        let other_collection = statement_key(
            "proj_1",
            "cus_1",
            "sub_1",
            at,
            "USD",
            PaymentProviderKind::Mock,
            CollectionMethod::SendInvoice,
        );
        assert_ne!(base, other_collection);

        let other_time = statement_key(
            "proj_1",
            "cus_1",
            "sub_1",
            at + chrono::Duration::milliseconds(1),
            "USD",
            PaymentProviderKind::Mock,
            CollectionMethod::ChargeAutomatically,
        );
        assert_ne!(base, other_time);
    }
}
