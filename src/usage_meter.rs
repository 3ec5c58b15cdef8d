/// Usage Meter
///
/// Keeps an entitlement's meter reconciled with the analytics store and
/// advances usage cycles. Reconciliation pulls events past the sequence
/// cursor, folds them into the running aggregate, and detects cycle
/// boundaries from the reset config: crossing a boundary snapshots the
/// running usage into the accumulated total and zeroes the cycle.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;

use crate::analytics::{UsageAnalytics, UsageEvent, UsageQuery};
use crate::calendar_cycle::{CycleSchedule, CycleWindow};
use crate::error::BillingResult;
use crate::types::{AggregationMethod, Entitlement};

/// Result of a reconcile pass.
#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub reset: bool,
    pub window: CycleWindow,
}

pub struct UsageMeter {
    analytics: Arc<dyn UsageAnalytics>,
}

impl UsageMeter {
    pub fn new(analytics: Arc<dyn UsageAnalytics>) -> Self {
        Self { analytics }
    }

    /// Fold `value` into a running aggregate.
    pub fn fold(method: AggregationMethod, current: f64, value: f64) -> f64 {
        match method {
            AggregationMethod::Sum | AggregationMethod::SumAll => current + value,
            AggregationMethod::Max | AggregationMethod::MaxAll => current.max(value),
            AggregationMethod::Count | AggregationMethod::CountAll => current + 1.0,
            AggregationMethod::LastDuringPeriod => value,
        }
    }

    /// Reconcile the entitlement's meter against analytics and advance the
    /// usage cycle at `now`. Mutates the entitlement in place; the caller
    /// persists it.
    pub async fn reconcile(
        &self,
        entitlement: &mut Entitlement,
        now: DateTime<Utc>,
    ) -> BillingResult<ReconcileOutcome> {
        // 1. Pull fresh events past the cursor.
        let query = UsageQuery {
            project_id: Some(entitlement.project_id.clone()),
            entitlement_id: Some(entitlement.id.clone()),
            ..Default::default()
        };
        let fresh = self
            .analytics
            .events_after(&query, entitlement.meter.last_reconciled_seq)
            .await?;
        for event in &fresh {
            entitlement.meter.usage = Self::fold(
                entitlement.aggregation_method,
                entitlement.meter.usage,
                event.value,
            );
            entitlement.meter.last_reconciled_seq =
                entitlement.meter.last_reconciled_seq.max(event.seq);
        }
        if !fresh.is_empty() {
            debug!(
                entitlement_id = %entitlement.id,
                events = fresh.len(),
                cursor = entitlement.meter.last_reconciled_seq,
                "meter reconciled"
            );
        }

        // 2. Advance the cycle from the reset config.
        let schedule = CycleSchedule::new(
            entitlement.current_cycle_start_at.min(
                entitlement
                    .meter
                    .last_cycle_start
                    .unwrap_or(entitlement.current_cycle_start_at),
            ),
            entitlement.reset_config,
        );
        let window = schedule
            .cycle_window(now)
            .unwrap_or(CycleWindow {
                start: entitlement.current_cycle_start_at,
                end: entitlement.current_cycle_end_at,
            });

        let mut reset = false;
        match entitlement.meter.last_cycle_start {
            None => {
                entitlement.meter.last_cycle_start = Some(window.start);
            }
            Some(last_start) if window.start > last_start => {
                entitlement.accumulated_usage += entitlement.meter.usage;
                entitlement.meter.snapshot_usage = entitlement.meter.usage;
                entitlement.meter.usage = 0.0;
                entitlement.meter.last_cycle_start = Some(window.start);
                reset = true;
                debug!(
                    entitlement_id = %entitlement.id,
                    cycle_start = %window.start,
                    "usage cycle reset"
                );
            }
            Some(_) => {}
        }

        // 3. Stamp and mirror onto the entitlement row.
        entitlement.meter.last_updated = now;
        entitlement.current_cycle_start_at = window.start;
        entitlement.current_cycle_end_at = window.end;
        entitlement.current_cycle_usage = entitlement.meter.usage;
        entitlement.updated_at = now;

        Ok(ReconcileOutcome { reset, window })
    }

    /// Persist a usage delta as an analytics event and fold it straight
    /// into the meter (the cursor advances past the new event, so the next
    /// reconcile will not double-count it).
    pub async fn record_delta(
        &self,
        entitlement: &mut Entitlement,
        delta: f64,
        now: DateTime<Utc>,
        idempotence_key: Option<String>,
    ) -> BillingResult<()> {
        let seq = self
            .analytics
            .ingest(UsageEvent {
                seq: 0,
                project_id: entitlement.project_id.clone(),
                customer_id: entitlement.customer_id.clone(),
                feature_slug: entitlement.feature_slug.clone(),
                entitlement_id: Some(entitlement.id.clone()),
                subscription_item_id: None,
                value: delta,
                ts: now,
                idempotence_key,
            })
            .await?;
        entitlement.meter.usage =
            Self::fold(entitlement.aggregation_method, entitlement.meter.usage, delta);
        entitlement.meter.last_reconciled_seq = entitlement.meter.last_reconciled_seq.max(seq);
        entitlement.meter.last_updated = now;
        entitlement.current_cycle_usage = entitlement.meter.usage;
        entitlement.updated_at = now;
        Ok(())
    }

    /// The usage figure a limit check or invoice should see: cycle usage,
    /// or lifetime usage for `*_all` aggregations.
    pub fn effective_usage(entitlement: &Entitlement) -> f64 {
        if entitlement.aggregation_method.ignores_cycle_reset() {
            entitlement.accumulated_usage + entitlement.meter.usage
        } else {
            entitlement.meter.usage
        }
    }
}
