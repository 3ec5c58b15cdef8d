/// Entitlement Evaluator
///
/// Decides, per feature usage event, whether to allow, throttle or deny,
/// and at what cost. State is the `Entitlement` row derived from the
/// active grant set; a version hash of that set fences both the in-memory
/// LRU cache and the persisted row, so grant changes self-invalidate
/// stale state. Usage reports are idempotent: outcomes are replayed from
/// a keyed cache.

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::analytics::{UsageAnalytics, UsageEvent};
use crate::calendar_cycle::CycleSchedule;
use crate::config::CacheConfig;
use crate::database::DatabaseManager;
use crate::error::{BillingResult, DeniedReason};
use crate::grant_snapshot::{self, GrantSnapshot};
use crate::pricing;
use crate::types::{new_id, Cents, Entitlement, FeatureType, GrantKind, MeterState};
use crate::usage_meter::UsageMeter;

/// Verification request for `customers.can`.
#[derive(Debug, Clone)]
pub struct VerifyRequest {
    pub project_id: String,
    pub customer_id: String,
    pub feature_slug: String,
    pub now: DateTime<Utc>,
    /// Answer from cached state without reconciling, trading accuracy for
    /// latency.
    pub from_cache: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub allowed: bool,
    pub denied_reason: Option<DeniedReason>,
    pub remaining: Option<f64>,
    pub limit: Option<i64>,
    pub usage: Option<f64>,
    pub feature_type: Option<FeatureType>,
    pub cost_cents: Option<Cents>,
    pub latency_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ReportUsageRequest {
    pub project_id: String,
    pub customer_id: String,
    pub feature_slug: String,
    pub usage: f64,
    pub idempotence_key: String,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportUsageResponse {
    pub allowed: bool,
    pub denied_reason: Option<DeniedReason>,
    pub remaining: Option<f64>,
    pub usage: Option<f64>,
    pub cost_cents: Option<Cents>,
    pub notified_over_limit: bool,
    pub cache_hit: bool,
}

pub struct EntitlementEvaluator {
    db: Arc<DatabaseManager>,
    analytics: Arc<dyn UsageAnalytics>,
    meter: UsageMeter,
    state_cache: RwLock<LruCache<String, Entitlement>>,
    report_cache: RwLock<LruCache<String, ReportUsageResponse>>,
}

impl EntitlementEvaluator {
    pub fn new(
        db: Arc<DatabaseManager>,
        analytics: Arc<dyn UsageAnalytics>,
        cache: &CacheConfig,
    ) -> Self {
        let entitlement_capacity =
            NonZeroUsize::new(cache.entitlement_capacity.max(1)).expect("non-zero capacity");
        let report_capacity =
            NonZeroUsize::new(cache.report_capacity.max(1)).expect("non-zero capacity");
        Self {
            db,
            analytics: analytics.clone(),
            meter: UsageMeter::new(analytics),
            state_cache: RwLock::new(LruCache::new(entitlement_capacity)),
            report_cache: RwLock::new(LruCache::new(report_capacity)),
        }
    }

    /// Verify access to a feature. Reconciles the meter unless
    /// `from_cache` is requested; always audits into analytics.
    pub async fn verify(&self, request: &VerifyRequest) -> BillingResult<VerifyResponse> {
        let started = Instant::now();
        let response = self.verify_inner(request).await?;
        let mut response = response;
        response.latency_ms = started.elapsed().as_millis() as u64;
        self.audit(request, response.allowed).await;
        Ok(response)
    }

    async fn verify_inner(&self, request: &VerifyRequest) -> BillingResult<VerifyResponse> {
        let Some(customer) = self
            .db
            .get_customer(&request.project_id, &request.customer_id)?
        else {
            return Ok(denied(DeniedReason::CustomerNotFound));
        };
        if !customer.active {
            return Ok(denied(DeniedReason::CustomerBlocked));
        }

        let Some((mut entitlement, snapshot)) = self
            .fetch_or_build(&request.project_id, &request.customer_id, &request.feature_slug, request.now)
            .await?
        else {
            return Ok(denied(DeniedReason::FeatureNotEntitled));
        };

        if self.subscription_grants_orphaned(&snapshot, &request.project_id, &request.customer_id)? {
            return Ok(denied(DeniedReason::SubscriptionInactive));
        }

        if !request.from_cache {
            self.meter.reconcile(&mut entitlement, request.now).await?;
            self.db.save_entitlement(&entitlement)?;
            self.cache_state(entitlement.clone()).await;
        }

        let usage = UsageMeter::effective_usage(&entitlement);
        let limit = entitlement.limit;
        let remaining = limit.map(|l| (l as f64 - usage).max(0.0));
        let over_hard_limit = entitlement.hard_limit
            && limit.map_or(false, |l| usage >= l as f64);

        let cost_cents = if entitlement.feature_type.is_metered() && usage > 0.0 {
            Some(
                pricing::waterfall_price(entitlement.feature_type, &snapshot.grants, usage)?
                    .total_cents,
            )
        } else {
            None
        };

        Ok(VerifyResponse {
            allowed: !over_hard_limit,
            denied_reason: over_hard_limit.then_some(DeniedReason::LimitExceeded),
            remaining,
            limit,
            usage: Some(usage),
            feature_type: Some(entitlement.feature_type),
            cost_cents,
            latency_ms: 0,
        })
    }

    /// Report a usage delta. Hard-limited overshoot is denied and not
    /// persisted; soft-limited overshoot is persisted and flagged.
    /// Outcomes replay idempotently per `(entitlement, idempotence_key)`.
    pub async fn report_usage(
        &self,
        request: &ReportUsageRequest,
    ) -> BillingResult<ReportUsageResponse> {
        let cache_key = report_cache_key(request);
        if let Some(cached) = self.report_cache.write().await.get(&cache_key) {
            let mut replay = cached.clone();
            replay.cache_hit = true;
            return Ok(replay);
        }

        let response = self.report_usage_inner(request).await?;
        self.report_cache
            .write()
            .await
            .put(cache_key, response.clone());
        Ok(response)
    }

    async fn report_usage_inner(
        &self,
        request: &ReportUsageRequest,
    ) -> BillingResult<ReportUsageResponse> {
        let Some(customer) = self
            .db
            .get_customer(&request.project_id, &request.customer_id)?
        else {
            return Ok(report_denied(DeniedReason::CustomerNotFound, None, None));
        };
        if !customer.active {
            return Ok(report_denied(DeniedReason::CustomerBlocked, None, None));
        }

        let Some((mut entitlement, snapshot)) = self
            .fetch_or_build(&request.project_id, &request.customer_id, &request.feature_slug, request.now)
            .await?
        else {
            return Ok(report_denied(DeniedReason::FeatureNotEntitled, None, None));
        };

        // Reconcile before judging the limit.
        self.meter.reconcile(&mut entitlement, request.now).await?;

        let usage_before = UsageMeter::effective_usage(&entitlement);
        let folded = UsageMeter::fold(entitlement.aggregation_method, entitlement.meter.usage, request.usage);
        let usage_after = if entitlement.aggregation_method.ignores_cycle_reset() {
            entitlement.accumulated_usage + folded
        } else {
            folded
        };

        if let Some(limit) = entitlement.limit {
            if entitlement.hard_limit && usage_after > limit as f64 {
                // Persist the reconcile, not the rejected delta.
                self.db.save_entitlement(&entitlement)?;
                self.cache_state(entitlement.clone()).await;
                return Ok(report_denied(
                    DeniedReason::LimitExceeded,
                    Some(usage_before),
                    Some((limit as f64 - usage_before).max(0.0)),
                ));
            }
        }

        let cost_before = self.usage_cost(&entitlement, &snapshot, usage_before)?;
        self.meter
            .record_delta(
                &mut entitlement,
                request.usage,
                request.now,
                Some(request.idempotence_key.clone()),
            )
            .await?;
        self.db.save_entitlement(&entitlement)?;
        self.cache_state(entitlement.clone()).await;

        let usage_now = UsageMeter::effective_usage(&entitlement);
        let cost_after = self.usage_cost(&entitlement, &snapshot, usage_now)?;
        let cost_cents = match (cost_before, cost_after) {
            (Some(before), Some(after)) => Some(after - before),
            (None, after) => after,
            _ => None,
        };

        let remaining = entitlement.limit.map(|l| (l as f64 - usage_now).max(0.0));
        let notified_over_limit = entitlement
            .limit
            .map_or(false, |l| usage_now > l as f64);
        if notified_over_limit {
            debug!(
                feature = %entitlement.feature_slug,
                customer = %entitlement.customer_id,
                usage = usage_now,
                "soft limit exceeded"
            );
        }

        Ok(ReportUsageResponse {
            allowed: true,
            denied_reason: None,
            remaining,
            usage: Some(usage_now),
            cost_cents,
            notified_over_limit,
            cache_hit: false,
        })
    }

    fn usage_cost(
        &self,
        entitlement: &Entitlement,
        snapshot: &GrantSnapshot,
        usage: f64,
    ) -> BillingResult<Option<Cents>> {
        if !entitlement.feature_type.is_metered() || usage <= 0.0 {
            return Ok(Some(0));
        }
        Ok(Some(
            pricing::waterfall_price(entitlement.feature_type, &snapshot.grants, usage)?
                .total_cents,
        ))
    }

    /// Fetch the entitlement for `(customer, feature)`, rebuilding it when
    /// the grant set changed. Returns the entitlement plus the fresh
    /// snapshot, or `None` when no grant is active.
    pub async fn fetch_or_build(
        &self,
        project_id: &str,
        customer_id: &str,
        feature_slug: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<Option<(Entitlement, GrantSnapshot)>> {
        let grants = self
            .db
            .list_grants_for_customer_feature(project_id, customer_id, feature_slug)?;
        let Some(snapshot) = grant_snapshot::merge(&grants, now)? else {
            return Ok(None);
        };

        let state_key = state_cache_key(project_id, customer_id, feature_slug);
        if let Some(cached) = self.state_cache.write().await.get(&state_key) {
            if cached.version == snapshot.version {
                return Ok(Some((cached.clone(), snapshot)));
            }
            // Version mismatch is the invalidation signal.
        }

        let existing = self.db.get_entitlement(project_id, customer_id, feature_slug)?;
        let entitlement = match existing {
            Some(existing) if existing.version == snapshot.version => existing,
            existing => {
                let rebuilt = self.rebuild(project_id, customer_id, feature_slug, &snapshot, existing, now);
                self.db.save_entitlement(&rebuilt)?;
                rebuilt
            }
        };
        self.cache_state(entitlement.clone()).await;
        Ok(Some((entitlement, snapshot)))
    }

    /// Recompute the entitlement row from a fresh snapshot, carrying the
    /// meter over so usage survives grant changes.
    fn rebuild(
        &self,
        project_id: &str,
        customer_id: &str,
        feature_slug: &str,
        snapshot: &GrantSnapshot,
        existing: Option<Entitlement>,
        now: DateTime<Utc>,
    ) -> Entitlement {
        let earliest_effective = snapshot
            .grants
            .iter()
            .map(|g| g.effective_at)
            .min()
            .unwrap_or(now);
        let schedule = CycleSchedule::new(earliest_effective, snapshot.reset_config);
        let window = schedule.cycle_window(now);

        let (id, meter, accumulated, timezone) = match existing {
            Some(prev) => (prev.id, prev.meter, prev.accumulated_usage, prev.timezone),
            None => (new_id(), MeterState::empty(now), 0.0, "UTC".to_string()),
        };
        let (cycle_start, cycle_end) = match window {
            Some(w) => (w.start, w.end),
            None => (now, DateTime::<Utc>::MAX_UTC),
        };
        Entitlement {
            id,
            project_id: project_id.to_string(),
            customer_id: customer_id.to_string(),
            feature_slug: feature_slug.to_string(),
            feature_type: snapshot.feature_type,
            limit: snapshot.limit,
            hard_limit: snapshot.hard_limit,
            reset_config: snapshot.reset_config,
            aggregation_method: snapshot.aggregation_method,
            timezone,
            current_cycle_start_at: cycle_start,
            current_cycle_end_at: cycle_end,
            current_cycle_usage: meter.usage,
            accumulated_usage: accumulated,
            version: snapshot.version.clone(),
            grants: snapshot.grants.clone(),
            meter,
            active: true,
            updated_at: now,
        }
    }

    /// Subscription-sourced grants with no live subscription behind them
    /// deny with `SUBSCRIPTION_INACTIVE`.
    fn subscription_grants_orphaned(
        &self,
        snapshot: &GrantSnapshot,
        project_id: &str,
        customer_id: &str,
    ) -> BillingResult<bool> {
        let only_subscription_grants = snapshot
            .grants
            .iter()
            .all(|g| g.kind == GrantKind::Subscription);
        if !only_subscription_grants {
            return Ok(false);
        }
        Ok(!self.db.has_active_subscription(project_id, customer_id)?)
    }

    async fn cache_state(&self, entitlement: Entitlement) {
        let key = state_cache_key(
            &entitlement.project_id,
            &entitlement.customer_id,
            &entitlement.feature_slug,
        );
        self.state_cache.write().await.put(key, entitlement);
    }

    /// Best-effort audit trail of verifications; never affects metering
    /// (audit events carry no entitlement id and zero value).
    async fn audit(&self, request: &VerifyRequest, allowed: bool) {
        let analytics = self.analytics.clone();
        let event = UsageEvent {
            seq: 0,
            project_id: request.project_id.clone(),
            customer_id: request.customer_id.clone(),
            feature_slug: format!("verify:{}:{}", request.feature_slug, allowed),
            entitlement_id: None,
            subscription_item_id: None,
            value: 0.0,
            ts: request.now,
            idempotence_key: None,
        };
        tokio::spawn(async move {
            if let Err(e) = analytics.ingest(event).await {
                warn!("audit ingest failed: {}", e);
            }
        });
    }
}

fn denied(reason: DeniedReason) -> VerifyResponse {
    VerifyResponse {
        allowed: false,
        denied_reason: Some(reason),
        remaining: None,
        limit: None,
        usage: None,
        feature_type: None,
        cost_cents: None,
        latency_ms: 0,
    }
}

fn report_denied(
    reason: DeniedReason,
    usage: Option<f64>,
    remaining: Option<f64>,
) -> ReportUsageResponse {
    ReportUsageResponse {
        allowed: false,
        denied_reason: Some(reason),
        remaining,
        usage,
        cost_cents: None,
        notified_over_limit: false,
        cache_hit: false,
    }
}

fn state_cache_key(project_id: &str, customer_id: &str, feature_slug: &str) -> String {
    format!("{project_id}|{customer_id}|{feature_slug}")
}

fn report_cache_key(request: &ReportUsageRequest) -> String {
    let mut hasher = Sha256::new();
    hasher.update(request.project_id.as_bytes());
    hasher.update(b"|");
    hasher.update(request.customer_id.as_bytes());
    hasher.update(b"|");
    hasher.update(request.feature_slug.as_bytes());
    hasher.update(b"|");
    hasher.update(request.idempotence_key.as_bytes());
    hex::encode(hasher.finalize())
}
