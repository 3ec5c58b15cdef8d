/// Usage Analytics Interface
///
/// The analytics store ingests raw usage events and answers windowed
/// aggregation queries. Real deployments point this at an external
/// analytics pipeline; the in-memory implementation backs tests and
/// single-node runs. Events carry a monotonically increasing sequence
/// number which the usage meter uses as its reconciliation cursor.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

use crate::error::BillingResult;
use crate::types::AggregationMethod;

/// A raw usage event as stored by analytics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    /// Assigned by the store at ingest; 0 before ingestion.
    pub seq: u64,
    pub project_id: String,
    pub customer_id: String,
    pub feature_slug: String,
    pub entitlement_id: Option<String>,
    pub subscription_item_id: Option<String>,
    pub value: f64,
    pub ts: DateTime<Utc>,
    pub idempotence_key: Option<String>,
}

/// Filter for aggregation and listing queries. Unset fields match
/// everything.
#[derive(Debug, Clone, Default)]
pub struct UsageQuery {
    pub project_id: Option<String>,
    pub customer_id: Option<String>,
    pub feature_slug: Option<String>,
    pub entitlement_id: Option<String>,
    pub subscription_item_id: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl UsageQuery {
    fn matches(&self, event: &UsageEvent) -> bool {
        if let Some(p) = &self.project_id {
            if &event.project_id != p {
                return false;
            }
        }
        if let Some(c) = &self.customer_id {
            if &event.customer_id != c {
                return false;
            }
        }
        if let Some(f) = &self.feature_slug {
            if &event.feature_slug != f {
                return false;
            }
        }
        if let Some(e) = &self.entitlement_id {
            if event.entitlement_id.as_deref() != Some(e.as_str()) {
                return false;
            }
        }
        if let Some(s) = &self.subscription_item_id {
            if event.subscription_item_id.as_deref() != Some(s.as_str()) {
                return false;
            }
        }
        if let Some(start) = self.start {
            if event.ts < start {
                return false;
            }
        }
        if let Some(end) = self.end {
            // Half-open window, matching cycle windows.
            if event.ts >= end {
                return false;
            }
        }
        true
    }
}

/// Analytics store contract.
#[async_trait]
pub trait UsageAnalytics: Send + Sync {
    /// Persist an event and return its assigned sequence number.
    async fn ingest(&self, event: UsageEvent) -> BillingResult<u64>;

    /// Events matching the query with `seq > after_seq`, in sequence
    /// order. This is the meter reconciliation feed.
    async fn events_after(&self, query: &UsageQuery, after_seq: u64)
        -> BillingResult<Vec<UsageEvent>>;

    /// Aggregate matching events with the given method. `*_all` variants
    /// aggregate identically here; the caller widens the window instead.
    async fn aggregate(&self, query: &UsageQuery, method: AggregationMethod)
        -> BillingResult<f64>;

    /// Raw events for audit queries.
    async fn list(&self, query: &UsageQuery) -> BillingResult<Vec<UsageEvent>>;
}

/// In-memory analytics store.
pub struct InMemoryAnalytics {
    events: RwLock<Vec<UsageEvent>>,
    next_seq: AtomicU64,
}

impl InMemoryAnalytics {
    pub fn new() -> Self {
        Self {
            events: RwLock::new(Vec::new()),
            // Sequence 0 means "not yet ingested"; real cursors start at 1.
            next_seq: AtomicU64::new(1),
        }
    }
}

impl Default for InMemoryAnalytics {
    fn default() -> Self {
        Self::new()
    }
}

pub fn apply_aggregation(values: &[f64], method: AggregationMethod) -> f64 {
    match method {
        AggregationMethod::Sum | AggregationMethod::SumAll => values.iter().sum(),
        AggregationMethod::Max | AggregationMethod::MaxAll => {
            values.iter().cloned().fold(0.0, f64::max)
        }
        AggregationMethod::Count | AggregationMethod::CountAll => values.len() as f64,
        AggregationMethod::LastDuringPeriod => values.last().copied().unwrap_or(0.0),
    }
}

#[async_trait]
impl UsageAnalytics for InMemoryAnalytics {
    async fn ingest(&self, mut event: UsageEvent) -> BillingResult<u64> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        event.seq = seq;
        self.events.write().await.push(event);
        Ok(seq)
    }

    async fn events_after(
        &self,
        query: &UsageQuery,
        after_seq: u64,
    ) -> BillingResult<Vec<UsageEvent>> {
        let events = self.events.read().await;
        Ok(events
            .iter()
            .filter(|e| e.seq > after_seq && query.matches(e))
            .cloned()
            .collect())
    }

    async fn aggregate(
        &self,
        query: &UsageQuery,
        method: AggregationMethod,
    ) -> BillingResult<f64> {
        let events = self.events.read().await;
        let values: Vec<f64> = events
            .iter()
            .filter(|e| query.matches(e))
            .map(|e| e.value)
            .collect();
        Ok(apply_aggregation(&values, method))
    }

    async fn list(&self, query: &UsageQuery) -> BillingResult<Vec<UsageEvent>> {
        let events = self.events.read().await;
        Ok(events.iter().filter(|e| query.matches(e)).cloned().collect())
    }
}
