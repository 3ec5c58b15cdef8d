/// Waterfall Pricing Engine
///
/// Prices an aggregated quantity against a priority-ordered grant set.
/// Grants are consumed in descending priority up to their limits; any
/// remainder is overage, priced against the formula of the last grant in
/// the waterfall and tagged as such. Graduated tiers cost a consumption
/// range as the difference of the cumulative cost function at the range
/// endpoints; package features bill `ceil(raw / package_size)` packages.

use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};
use crate::types::{Cents, FeatureType, Grant, PriceTier, PricingConfig};

/// One priced slice of the waterfall.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceLine {
    pub grant_id: Option<String>,
    pub quantity: f64,
    /// Effective per-unit rate when the slice has a single rate.
    pub unit_amount_cents: Option<Cents>,
    pub amount_cents: Cents,
    pub is_overage: bool,
    pub description: String,
}

/// Full pricing result for one feature quantity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBreakdown {
    pub lines: Vec<PriceLine>,
    pub total_cents: Cents,
}

impl PriceBreakdown {
    pub fn empty() -> Self {
        Self {
            lines: Vec::new(),
            total_cents: 0,
        }
    }
}

/// Price `quantity` against `grants`, which must already be in waterfall
/// order (descending priority), as produced by the grant snapshot merge.
pub fn waterfall_price(
    feature_type: FeatureType,
    grants: &[Grant],
    quantity: f64,
) -> BillingResult<PriceBreakdown> {
    if grants.is_empty() {
        return Err(BillingError::InvariantViolation(
            "waterfall pricing requires at least one grant".to_string(),
        ));
    }

    match feature_type {
        FeatureType::Flat => flat_price(&grants[0]),
        FeatureType::Package => package_price(&grants[0], quantity),
        FeatureType::Usage | FeatureType::Tier => metered_price(grants, quantity),
    }
}

fn flat_price(grant: &Grant) -> BillingResult<PriceBreakdown> {
    let amount = match &grant.pricing {
        PricingConfig::Flat { amount_cents } => *amount_cents,
        other => {
            return Err(BillingError::InvariantViolation(format!(
                "flat feature '{}' carries non-flat pricing {:?}",
                grant.feature_slug, other
            )))
        }
    };
    Ok(PriceBreakdown {
        lines: vec![PriceLine {
            grant_id: Some(grant.id.clone()),
            quantity: 1.0,
            unit_amount_cents: Some(amount),
            amount_cents: amount,
            is_overage: false,
            description: format!("{} (flat)", grant.feature_slug),
        }],
        total_cents: amount,
    })
}

fn package_price(grant: &Grant, quantity: f64) -> BillingResult<PriceBreakdown> {
    let (size, amount) = match &grant.pricing {
        PricingConfig::Package {
            package_size,
            package_amount_cents,
        } => (*package_size, *package_amount_cents),
        other => {
            return Err(BillingError::InvariantViolation(format!(
                "package feature '{}' carries non-package pricing {:?}",
                grant.feature_slug, other
            )))
        }
    };
    if size <= 0 {
        return Err(BillingError::InvariantViolation(format!(
            "package size must be positive for feature '{}'",
            grant.feature_slug
        )));
    }
    let packages = (quantity / size as f64).ceil().max(0.0);
    let total = (packages * amount as f64).round() as Cents;
    Ok(PriceBreakdown {
        lines: vec![PriceLine {
            grant_id: Some(grant.id.clone()),
            quantity: packages,
            unit_amount_cents: Some(amount),
            amount_cents: total,
            is_overage: false,
            description: format!(
                "{} ({} packages of {})",
                grant.feature_slug, packages, size
            ),
        }],
        total_cents: total,
    })
}

fn metered_price(grants: &[Grant], quantity: f64) -> BillingResult<PriceBreakdown> {
    let mut lines = Vec::new();
    let mut remaining = quantity.max(0.0);

    for grant in grants {
        if remaining <= 0.0 {
            break;
        }
        let capacity = grant.limit.or(grant.units);
        let take = match capacity {
            Some(cap) => remaining.min(cap.max(0) as f64),
            None => remaining,
        };
        if take > 0.0 {
            let cost = formula_range_cost(&grant.pricing, 0.0, take)?;
            lines.push(PriceLine {
                grant_id: Some(grant.id.clone()),
                quantity: take,
                unit_amount_cents: single_rate(&grant.pricing, 0.0, take),
                amount_cents: cost.round() as Cents,
                is_overage: false,
                description: format!("{} ({} units)", grant.feature_slug, take),
            });
            remaining -= take;
        }
    }

    // Remainder past every grant's capacity: overage priced against the
    // last grant's formula, continuing its consumed range.
    if let Some(last) = grants.last().filter(|_| remaining > 0.0) {
        let consumed = match last.limit.or(last.units) {
            Some(cap) => (cap.max(0) as f64).min(quantity),
            None => 0.0,
        };
        let cost = formula_range_cost(&last.pricing, consumed, consumed + remaining)?;
        lines.push(PriceLine {
            grant_id: Some(last.id.clone()),
            quantity: remaining,
            unit_amount_cents: single_rate(&last.pricing, consumed, consumed + remaining),
            amount_cents: cost.round() as Cents,
            is_overage: true,
            description: format!("{} ({} units, overage)", last.feature_slug, remaining),
        });
    }

    let total = lines.iter().map(|l| l.amount_cents).sum();
    Ok(PriceBreakdown {
        lines,
        total_cents: total,
    })
}

/// Cost of consuming `[from, to)` units under a pricing formula, in
/// fractional cents. Tier formulas use the cumulative cost difference.
fn formula_range_cost(pricing: &PricingConfig, from: f64, to: f64) -> BillingResult<f64> {
    if to < from {
        return Err(BillingError::InvariantViolation(format!(
            "pricing range is inverted: {from}..{to}"
        )));
    }
    Ok(match pricing {
        PricingConfig::Usage { unit_amount_cents } => (to - from) * *unit_amount_cents as f64,
        PricingConfig::Tier { tiers } => cumulative_tier_cost(tiers, to) - cumulative_tier_cost(tiers, from),
        PricingConfig::Package {
            package_size,
            package_amount_cents,
        } => {
            let size = (*package_size).max(1) as f64;
            let packages = (to / size).ceil() - (from / size).ceil();
            packages.max(0.0) * *package_amount_cents as f64
        }
        PricingConfig::Flat { amount_cents } => {
            if from == 0.0 && to > 0.0 {
                *amount_cents as f64
            } else {
                0.0
            }
        }
    })
}

/// Cumulative cost of the first `n` units across a graduated ladder.
fn cumulative_tier_cost(tiers: &[PriceTier], n: f64) -> f64 {
    let mut cost = 0.0;
    for tier in tiers {
        let lower = (tier.first_unit - 1).max(0) as f64;
        if n <= lower {
            break;
        }
        let upper = tier.last_unit.map(|l| l as f64).unwrap_or(f64::INFINITY);
        let covered = n.min(upper) - lower;
        if covered > 0.0 {
            cost += covered * tier.unit_amount_cents as f64 + tier.flat_amount_cents as f64;
        }
    }
    cost
}

/// The single per-unit rate covering `[from, to)`, when one exists.
fn single_rate(pricing: &PricingConfig, from: f64, to: f64) -> Option<Cents> {
    match pricing {
        PricingConfig::Usage { unit_amount_cents } => Some(*unit_amount_cents),
        PricingConfig::Package {
            package_amount_cents,
            ..
        } => Some(*package_amount_cents),
        PricingConfig::Flat { amount_cents } => Some(*amount_cents),
        PricingConfig::Tier { tiers } => {
            let mut rate = None;
            for tier in tiers {
                let lower = (tier.first_unit - 1).max(0) as f64;
                let upper = tier.last_unit.map(|l| l as f64).unwrap_or(f64::INFINITY);
                if from < upper && to > lower {
                    match rate {
                        None => rate = Some(tier.unit_amount_cents),
                        Some(r) if r == tier.unit_amount_cents => {}
                        Some(_) => return None,
                    }
                }
            }
            rate
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        new_id, AggregationMethod, BillingCycleSpec, GrantKind, GrantSubject,
    };
    use chrono::{TimeZone, Utc};

    fn grant(priority: i32, limit: Option<i64>, pricing: PricingConfig) -> Grant {
        Grant {
            id: new_id(),
            project_id: "proj_1".into(),
            subject_type: GrantSubject::Customer,
            subject_id: "cus_1".into(),
            feature_plan_version_id: new_id(),
            feature_slug: "api".into(),
            feature_type: FeatureType::Usage,
            aggregation_method: AggregationMethod::Sum,
            reset_config: BillingCycleSpec::monthly(1),
            pricing,
            kind: GrantKind::Subscription,
            priority,
            effective_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            expires_at: None,
            limit,
            hard_limit: false,
            units: None,
            deleted: false,
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_two_grant_waterfall_without_overage() {
        // 10 units at $1.00, then 5 at $0.50.
        let grants = vec![
            grant(10, Some(10), PricingConfig::Usage { unit_amount_cents: 100 }),
            grant(5, Some(10), PricingConfig::Usage { unit_amount_cents: 50 }),
        ];
        let breakdown = waterfall_price(FeatureType::Usage, &grants, 15.0).unwrap();
        assert_eq!(breakdown.total_cents, 1250);
        assert_eq!(breakdown.lines.len(), 2);
        assert_eq!(breakdown.lines[0].quantity, 10.0);
        assert_eq!(breakdown.lines[0].amount_cents, 1000);
        assert_eq!(breakdown.lines[1].quantity, 5.0);
        assert_eq!(breakdown.lines[1].amount_cents, 250);
        assert!(breakdown.lines.iter().all(|l| !l.is_overage));
    }

    #[test]
    fn test_two_grant_waterfall_with_overage() {
        // usage 25 over 10 @ $1.00 and 10 @ $2.00: overage of 5 priced
        // against the last grant's formula.
        let grants = vec![
            grant(10, Some(10), PricingConfig::Usage { unit_amount_cents: 100 }),
            grant(5, Some(10), PricingConfig::Usage { unit_amount_cents: 200 }),
        ];
        let breakdown = waterfall_price(FeatureType::Usage, &grants, 25.0).unwrap();
        assert_eq!(breakdown.total_cents, 4000);
        assert_eq!(breakdown.lines.len(), 3);
        assert!(breakdown.lines[2].is_overage);
        assert_eq!(breakdown.lines[2].quantity, 5.0);
        assert_eq!(breakdown.lines[2].amount_cents, 1000);
    }

    #[test]
    fn test_graduated_tier_overage_continues_the_ladder() {
        // Tiers [1..10 @ $1.00, 11..inf @ $0.50], one grant limited to 5,
        // usage 15: 5 @ $5.00 in-grant, 10 overage costing $7.50.
        let tiers = PricingConfig::Tier {
            tiers: vec![
                PriceTier {
                    first_unit: 1,
                    last_unit: Some(10),
                    unit_amount_cents: 100,
                    flat_amount_cents: 0,
                },
                PriceTier {
                    first_unit: 11,
                    last_unit: None,
                    unit_amount_cents: 50,
                    flat_amount_cents: 0,
                },
            ],
        };
        let grants = vec![grant(10, Some(5), tiers)];
        let breakdown = waterfall_price(FeatureType::Tier, &grants, 15.0).unwrap();
        assert_eq!(breakdown.total_cents, 1250);
        assert_eq!(breakdown.lines.len(), 2);
        assert_eq!(breakdown.lines[0].quantity, 5.0);
        assert_eq!(breakdown.lines[0].amount_cents, 500);
        assert!(breakdown.lines[1].is_overage);
        assert_eq!(breakdown.lines[1].quantity, 10.0);
        assert_eq!(breakdown.lines[1].amount_cents, 750);
    }

    #[test]
    fn test_unlimited_grant_absorbs_everything() {
        let grants = vec![
            grant(10, None, PricingConfig::Usage { unit_amount_cents: 10 }),
        ];
        let breakdown = waterfall_price(FeatureType::Usage, &grants, 1000.0).unwrap();
        assert_eq!(breakdown.total_cents, 10_000);
        assert_eq!(breakdown.lines.len(), 1);
        assert!(!breakdown.lines[0].is_overage);
    }

    #[test]
    fn test_package_rounds_up() {
        let grants = vec![grant(
            10,
            None,
            PricingConfig::Package {
                package_size: 100,
                package_amount_cents: 500,
            },
        )];
        let breakdown = waterfall_price(FeatureType::Package, &grants, 250.0).unwrap();
        // 250 raw units is 3 packages
        assert_eq!(breakdown.lines[0].quantity, 3.0);
        assert_eq!(breakdown.total_cents, 1500);
    }

    #[test]
    fn test_flat_ignores_quantity() {
        let grants = vec![grant(10, None, PricingConfig::Flat { amount_cents: 999 })];
        let breakdown = waterfall_price(FeatureType::Flat, &grants, 123.0).unwrap();
        assert_eq!(breakdown.total_cents, 999);
        assert_eq!(breakdown.lines[0].quantity, 1.0);
    }

    #[test]
    fn test_zero_quantity_is_free_for_metered() {
        let grants = vec![grant(10, Some(10), PricingConfig::Usage { unit_amount_cents: 100 })];
        let breakdown = waterfall_price(FeatureType::Usage, &grants, 0.0).unwrap();
        assert_eq!(breakdown.total_cents, 0);
        assert!(breakdown.lines.is_empty());
    }

    #[test]
    fn test_empty_grant_set_is_an_invariant_violation() {
        let err = waterfall_price(FeatureType::Usage, &[], 1.0).unwrap_err();
        assert!(matches!(err, BillingError::InvariantViolation(_)));
    }
}
