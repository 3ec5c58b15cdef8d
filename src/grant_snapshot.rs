/// Grant Snapshot Merging
///
/// Pure merge of the active grant set into a single effective entitlement.
/// Flat and package features are replace-merged (highest priority wins);
/// metered features (usage, tier) sum limits and units and take the max
/// hard-limit flag. All grants for one feature must agree on feature type,
/// reset config and aggregation method; disagreement is a fatal invariant
/// violation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{BillingError, BillingResult};
use crate::types::{AggregationMethod, BillingCycleSpec, FeatureType, Grant};

/// Effective entitlement derived from the active grant set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrantSnapshot {
    pub feature_type: FeatureType,
    pub limit: Option<i64>,
    pub hard_limit: bool,
    pub aggregation_method: AggregationMethod,
    pub reset_config: BillingCycleSpec,
    /// Active grants sorted by descending priority (waterfall order).
    pub grants: Vec<Grant>,
    /// SHA-256 over the sorted grant set; used as a cache fence.
    pub version: String,
}

/// Merge the grants active at `now`. Returns `None` when no grant is
/// active (the feature is not entitled).
pub fn merge(grants: &[Grant], now: DateTime<Utc>) -> BillingResult<Option<GrantSnapshot>> {
    let mut active: Vec<Grant> = grants
        .iter()
        .filter(|g| g.is_active_at(now))
        .cloned()
        .collect();
    if active.is_empty() {
        return Ok(None);
    }

    // Highest priority first; id as a stable tie-break.
    active.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));

    let head = &active[0];
    for grant in &active[1..] {
        if grant.feature_type != head.feature_type {
            return Err(BillingError::InvariantViolation(format!(
                "grants for feature '{}' disagree on feature type: {} vs {}",
                head.feature_slug,
                head.feature_type.as_str(),
                grant.feature_type.as_str()
            )));
        }
        if grant.aggregation_method != head.aggregation_method {
            return Err(BillingError::InvariantViolation(format!(
                "grants for feature '{}' disagree on aggregation method: {} vs {}",
                head.feature_slug,
                head.aggregation_method.as_str(),
                grant.aggregation_method.as_str()
            )));
        }
        if grant.reset_config != head.reset_config {
            return Err(BillingError::InvariantViolation(format!(
                "grants for feature '{}' disagree on reset config",
                head.feature_slug
            )));
        }
    }

    let (limit, hard_limit) = if head.feature_type.is_metered() {
        // Sum limits; any unlimited grant makes the whole merge unlimited.
        let limit = active
            .iter()
            .map(|g| g.limit)
            .try_fold(0i64, |acc, l| l.map(|v| acc + v));
        let hard_limit = active.iter().any(|g| g.hard_limit);
        (limit, hard_limit)
    } else {
        (head.limit, head.hard_limit)
    };

    let version = version_hash(&active);
    Ok(Some(GrantSnapshot {
        feature_type: head.feature_type,
        limit,
        hard_limit,
        aggregation_method: head.aggregation_method,
        reset_config: head.reset_config,
        grants: active,
        version,
    }))
}

/// SHA-256 of the sorted `(id, priority, limit)` triples.
pub fn version_hash(grants: &[Grant]) -> String {
    let mut triples: Vec<(String, i32, Option<i64>)> = grants
        .iter()
        .map(|g| (g.id.clone(), g.priority, g.limit))
        .collect();
    triples.sort();

    let mut hasher = Sha256::new();
    for (id, priority, limit) in &triples {
        hasher.update(id.as_bytes());
        hasher.update(b":");
        hasher.update(priority.to_string().as_bytes());
        hasher.update(b":");
        match limit {
            Some(l) => hasher.update(l.to_string().as_bytes()),
            None => hasher.update(b"null"),
        }
        hasher.update(b"|");
    }
    hex::encode(hasher.finalize())
}
