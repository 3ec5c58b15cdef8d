/// Billing Period Materializer
///
/// Generates `BillingPeriod` rows for every item of a subscription's
/// current phase, one per billing cycle. Materialization is idempotent:
/// the period-window uniqueness swallows concurrent inserts. Mid-cycle
/// plan changes close the running phase, open the new one, emit a
/// remainder period, and refund the unused span of a prepaid cycle as a
/// credit grant.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info};

use crate::calendar_cycle::CycleSchedule;
use crate::database::DatabaseManager;
use crate::error::{BillingError, BillingResult};
use crate::invoice_assembler::statement_key;
use crate::types::*;

/// Result of a materialization pass. `has_due_billing_periods` is always
/// populated so machine guards never read a stale flag.
#[derive(Debug, Clone)]
pub struct MaterializeOutcome {
    pub created: usize,
    pub has_due_billing_periods: bool,
}

/// Inputs for a mid-cycle plan change.
#[derive(Debug, Clone)]
pub struct PhaseChange {
    pub new_plan_version_id: String,
    pub payment_method_id: Option<String>,
    /// `(feature_plan_version_id, units)` for the new phase's items.
    pub items: Vec<(String, Option<i64>)>,
}

pub struct PeriodMaterializer {
    db: Arc<DatabaseManager>,
}

impl PeriodMaterializer {
    pub fn new(db: Arc<DatabaseManager>) -> Self {
        Self { db }
    }

    /// Build the cycle schedule for a phase under a plan's billing config,
    /// anchored by the phase.
    pub fn phase_schedule(phase: &SubscriptionPhase, plan: &PlanVersion) -> CycleSchedule {
        let mut spec = plan.billing_config;
        spec.anchor = phase.billing_anchor;
        let mut schedule = CycleSchedule::new(phase.start_at, spec);
        if let Some(end) = phase.end_at {
            schedule = schedule.with_end(end);
        }
        if let Some(trial_end) = phase.trial_ends_at {
            schedule = schedule.with_trial_end(trial_end);
        }
        schedule
    }

    /// Materialize the current cycle's billing periods for every item of
    /// the active phase.
    pub async fn generate_billing_periods(
        &self,
        project_id: &str,
        subscription_id: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<MaterializeOutcome> {
        let subscription = self
            .db
            .get_subscription(project_id, subscription_id)?
            .ok_or_else(|| BillingError::NotFound {
                entity: "subscription",
                id: subscription_id.to_string(),
            })?;

        let mut created = 0;
        if let Some(phase) = self.db.get_active_phase(project_id, subscription_id, now)? {
            let plan = self
                .db
                .get_plan_version(project_id, &phase.plan_version_id)?
                .ok_or_else(|| BillingError::NotFound {
                    entity: "plan_version",
                    id: phase.plan_version_id.clone(),
                })?;
            let schedule = Self::phase_schedule(&phase, &plan);

            if let Some(window) = schedule.cycle_window(now) {
                let in_trial = phase.in_trial_at(now);
                let invoice_at = match plan.when_to_bill {
                    WhenToBill::PayInAdvance => window.start,
                    WhenToBill::PayInArrear => window.end,
                };
                let key = statement_key(
                    project_id,
                    &subscription.customer_id,
                    subscription_id,
                    invoice_at,
                    &plan.currency,
                    plan.payment_provider,
                    plan.collection_method,
                );

                for item in self.db.list_items_for_phase(project_id, &phase.id)? {
                    let period = BillingPeriod {
                        id: new_id(),
                        project_id: project_id.to_string(),
                        subscription_id: subscription_id.to_string(),
                        subscription_phase_id: phase.id.clone(),
                        subscription_item_id: item.id.clone(),
                        grant_id: None,
                        cycle_start_at: window.start,
                        cycle_end_at: window.end,
                        status: BillingPeriodStatus::Pending,
                        kind: if in_trial {
                            BillingPeriodKind::Trial
                        } else {
                            BillingPeriodKind::Normal
                        },
                        invoice_id: None,
                        when_to_bill: plan.when_to_bill,
                        invoice_at,
                        statement_key: key.clone(),
                        amount_estimate_cents: in_trial.then_some(0),
                    };
                    if self.db.insert_billing_period(&period)? {
                        created += 1;
                        debug!(
                            subscription_id,
                            item_id = %item.id,
                            cycle_start = %window.start,
                            "billing period materialized"
                        );
                    }
                }
            }
        }

        let has_due_billing_periods =
            self.db.has_due_pending_periods(project_id, subscription_id, now)?;
        Ok(MaterializeOutcome {
            created,
            has_due_billing_periods,
        })
    }

    /// Close the running phase at `now`, open the replacement, and emit a
    /// `mid_cycle_change` period for the rest of the cycle. When the
    /// outgoing phase was paid in advance, the unused span of its cycle
    /// comes back as a credit grant.
    pub async fn change_phase(
        &self,
        project_id: &str,
        subscription_id: &str,
        change: &PhaseChange,
        now: DateTime<Utc>,
    ) -> BillingResult<SubscriptionPhase> {
        let subscription = self
            .db
            .get_subscription(project_id, subscription_id)?
            .ok_or_else(|| BillingError::NotFound {
                entity: "subscription",
                id: subscription_id.to_string(),
            })?;
        let old_phase = self
            .db
            .get_active_phase(project_id, subscription_id, now)?
            .ok_or_else(|| BillingError::BadRequest(format!(
                "subscription {subscription_id} has no active phase to change"
            )))?;
        let old_plan = self
            .db
            .get_plan_version(project_id, &old_phase.plan_version_id)?
            .ok_or_else(|| BillingError::NotFound {
                entity: "plan_version",
                id: old_phase.plan_version_id.clone(),
            })?;
        let new_plan = self
            .db
            .get_plan_version(project_id, &change.new_plan_version_id)?
            .ok_or_else(|| BillingError::NotFound {
                entity: "plan_version",
                id: change.new_plan_version_id.clone(),
            })?;

        // Refund the unused advance-paid span before touching the phases.
        if old_plan.when_to_bill == WhenToBill::PayInAdvance {
            self.issue_change_credit(project_id, &subscription, &old_phase, &old_plan, now)?;
        }

        self.db.close_phase(project_id, &old_phase.id, now)?;

        let new_anchor = new_plan.billing_config.anchor;
        let mut new_spec = new_plan.billing_config;
        new_spec.anchor = new_anchor;
        let schedule = CycleSchedule::new(now, new_spec);
        let window = schedule.cycle_window(now).ok_or_else(|| {
            BillingError::InvariantViolation(format!(
                "new phase for subscription {subscription_id} has no cycle at change time"
            ))
        })?;

        let new_phase = SubscriptionPhase {
            id: new_id(),
            project_id: project_id.to_string(),
            subscription_id: subscription_id.to_string(),
            plan_version_id: new_plan.id.clone(),
            payment_method_id: change
                .payment_method_id
                .clone()
                .or(old_phase.payment_method_id.clone()),
            trial_ends_at: None,
            start_at: now,
            end_at: None,
            current_cycle_start_at: window.start,
            current_cycle_end_at: window.end,
            renew_at: Some(window.end),
            billing_anchor: new_anchor,
        };
        self.db.insert_phase(&new_phase)?;

        let invoice_at = match new_plan.when_to_bill {
            WhenToBill::PayInAdvance => window.start,
            WhenToBill::PayInArrear => window.end,
        };
        let key = statement_key(
            project_id,
            &subscription.customer_id,
            subscription_id,
            invoice_at,
            &new_plan.currency,
            new_plan.payment_provider,
            new_plan.collection_method,
        );
        for (feature_plan_version_id, units) in &change.items {
            let item = SubscriptionItem {
                id: new_id(),
                project_id: project_id.to_string(),
                subscription_phase_id: new_phase.id.clone(),
                subscription_id: subscription_id.to_string(),
                feature_plan_version_id: feature_plan_version_id.clone(),
                units: *units,
            };
            self.db.insert_item(&item)?;

            let period = BillingPeriod {
                id: new_id(),
                project_id: project_id.to_string(),
                subscription_id: subscription_id.to_string(),
                subscription_phase_id: new_phase.id.clone(),
                subscription_item_id: item.id.clone(),
                grant_id: None,
                cycle_start_at: window.start,
                cycle_end_at: window.end,
                status: BillingPeriodStatus::Pending,
                kind: BillingPeriodKind::MidCycleChange,
                invoice_id: None,
                when_to_bill: new_plan.when_to_bill,
                invoice_at,
                statement_key: key.clone(),
                amount_estimate_cents: None,
            };
            self.db.insert_billing_period(&period)?;
        }

        self.db.update_subscription_cycle(
            project_id,
            subscription_id,
            window.start,
            window.end,
            Some(window.end),
            &new_plan.plan_slug,
        )?;

        info!(
            subscription_id,
            old_phase = %old_phase.id,
            new_phase = %new_phase.id,
            "mid-cycle phase change applied"
        );
        Ok(new_phase)
    }

    /// Credit for the unused remainder of an advance-paid cycle:
    /// `round(paid_total x remaining/full)`.
    fn issue_change_credit(
        &self,
        project_id: &str,
        subscription: &Subscription,
        old_phase: &SubscriptionPhase,
        old_plan: &PlanVersion,
        now: DateTime<Utc>,
    ) -> BillingResult<()> {
        let schedule = Self::phase_schedule(old_phase, old_plan);
        let Some(window) = schedule.cycle_window(now) else {
            return Ok(());
        };

        // The prepaid amount is the invoice covering the running cycle.
        let invoices = self
            .db
            .list_invoices_for_subscription(project_id, &subscription.id)?;
        let Some(paid_invoice) = invoices.iter().find(|inv| {
            inv.subscription_phase_id == old_phase.id
                && inv.cycle_start_at <= now
                && inv.cycle_end_at >= now
                && matches!(inv.status, InvoiceStatus::Paid | InvoiceStatus::Unpaid | InvoiceStatus::Waiting)
        }) else {
            return Ok(());
        };
        if paid_invoice.total <= 0 {
            return Ok(());
        }

        let factor = schedule.proration_factor(now, window.end);
        let amount = (paid_invoice.total as f64 * factor).round() as Cents;
        if amount <= 0 {
            return Ok(());
        }
        self.db.insert_credit_grant(&CreditGrant {
            id: new_id(),
            project_id: project_id.to_string(),
            customer_id: subscription.customer_id.clone(),
            currency: old_plan.currency.clone(),
            payment_provider: old_plan.payment_provider,
            total_amount: amount,
            amount_used: 0,
            expires_at: None,
            active: true,
            reason: "mid_cycle_change".to_string(),
            created_at: now,
        })?;
        info!(
            subscription_id = %subscription.id,
            amount, "issued mid-cycle change credit"
        );
        Ok(())
    }
}
