/// Subscription Lifecycle Integration Tests
///
/// Drives the engine end to end across the scenarios the design must
/// honor: trial expiry into the anchored cycle grid, leap-year anchor
/// windows, mid-cycle downgrades with advance-payment refunds, provider
/// total mismatches, and hard usage limits.

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use tempfile::TempDir;

use billmesh::analytics::InMemoryAnalytics;
use billmesh::config::Config;
use billmesh::database::DatabaseManager;
use billmesh::engine::{BillingEngine, CreateSubscriptionRequest};
use billmesh::payment_provider::MockPaymentProvider;
use billmesh::period_materializer::PhaseChange;
use billmesh::subscription_machine::{MachineEvent, MachineState};
use billmesh::types::*;

fn at(y: i32, mo: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, 0, 0, 0).unwrap()
}

fn at_hms(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
}

struct TestSetup {
    _temp: TempDir,
    db: Arc<DatabaseManager>,
    provider: Arc<MockPaymentProvider>,
    engine: BillingEngine,
}

impl TestSetup {
    fn new() -> Result<Self> {
        let temp = TempDir::new()?;
        let db = Arc::new(DatabaseManager::new(&temp.path().join("billing.db"))?);
        let analytics = Arc::new(InMemoryAnalytics::new());
        let provider = Arc::new(MockPaymentProvider::new());
        let engine = BillingEngine::new(
            Config::default(),
            db.clone(),
            analytics,
            provider.clone(),
        );
        Ok(TestSetup {
            _temp: temp,
            db,
            provider,
            engine,
        })
    }

    fn seed_customer(&self) -> Result<()> {
        self.db.insert_customer(&Customer {
            id: "cus_1".into(),
            project_id: "proj_1".into(),
            email: "ada@example.com".into(),
            default_currency: "USD".into(),
            timezone: "UTC".into(),
            active: true,
            stripe_customer_id: None,
            created_at: at(2024, 1, 1),
        })?;
        Ok(())
    }

    /// A published monthly plan with one flat $100 feature.
    fn seed_flat_plan(&self, plan_id: &str, anchor: u32, amount_cents: i64) -> Result<()> {
        self.db.insert_plan_version(&PlanVersion {
            id: plan_id.into(),
            project_id: "proj_1".into(),
            plan_slug: format!("plan-{plan_id}"),
            version: 1,
            currency: "USD".into(),
            payment_provider: PaymentProviderKind::Mock,
            when_to_bill: WhenToBill::PayInAdvance,
            collection_method: CollectionMethod::ChargeAutomatically,
            billing_config: BillingCycleSpec::monthly(anchor),
            grace_period: GracePeriod::default(),
            auto_renew: true,
            requires_payment_method: true,
            published: true,
        })?;
        self.db.insert_feature_plan_version(&FeaturePlanVersion {
            id: format!("{plan_id}-base"),
            project_id: "proj_1".into(),
            plan_version_id: plan_id.into(),
            feature_slug: "base".into(),
            feature_type: FeatureType::Flat,
            aggregation_method: AggregationMethod::Sum,
            pricing: PricingConfig::Flat { amount_cents },
            limit: None,
            hard_limit: false,
            reset_config: BillingCycleSpec::monthly(anchor),
            default_units: None,
        })?;
        Ok(())
    }

    async fn create_subscription(
        &self,
        plan_id: &str,
        trial_days: u32,
        now: DateTime<Utc>,
    ) -> Result<Subscription> {
        Ok(self
            .engine
            .subscriptions_create(&CreateSubscriptionRequest {
                project_id: "proj_1".into(),
                customer_id: "cus_1".into(),
                plan_version_id: plan_id.into(),
                payment_method_id: Some("pm_1".into()),
                trial_days,
                timezone: None,
                now,
            })
            .await?)
    }
}

#[tokio::test]
async fn test_trial_expiry_renews_into_anchored_cycle() -> Result<()> {
    // Subscription created 2024-01-01 with a 7-day trial on a monthly
    // plan anchored at day 15.
    let s = TestSetup::new()?;
    s.seed_customer()?;
    s.seed_flat_plan("plan_a", 15, 10_000)?;
    let sub = s.create_subscription("plan_a", 7, at(2024, 1, 1)).await?;
    assert_eq!(sub.status, SubscriptionStatus::Trialing);
    assert_eq!(sub.current_cycle_start_at, at(2024, 1, 1));
    assert_eq!(sub.current_cycle_end_at, at(2024, 1, 8));

    // RENEW at trial end moves to active with the clamped first window.
    let snapshot = s
        .engine
        .drive_machine("proj_1", &sub.id, MachineEvent::Renew, at(2024, 1, 8))
        .await?;
    assert_eq!(snapshot.state, MachineState::Active);

    let renewed = s.db.get_subscription("proj_1", &sub.id)?.unwrap();
    assert_eq!(renewed.status, SubscriptionStatus::Active);
    assert_eq!(renewed.current_cycle_start_at, at(2024, 1, 8));
    assert_eq!(renewed.current_cycle_end_at, at(2024, 1, 15));
    Ok(())
}

#[tokio::test]
async fn test_trial_renew_guard_failure_is_terminal_with_precise_message() -> Result<()> {
    let s = TestSetup::new()?;
    s.seed_customer()?;
    s.seed_flat_plan("plan_a", 15, 10_000)?;
    let sub = s.create_subscription("plan_a", 7, at(2024, 1, 1)).await?;

    // RENEW while the trial is still running fails every time guard.
    let snapshot = s
        .engine
        .drive_machine("proj_1", &sub.id, MachineEvent::Renew, at(2024, 1, 3))
        .await?;
    assert_eq!(snapshot.state, MachineState::Error);
    let message = snapshot.error.unwrap();
    assert!(message.contains("isTrialExpired"));
    assert!(message.contains("canRenew"));
    Ok(())
}

#[tokio::test]
async fn test_monthly_leap_anchor_window() -> Result<()> {
    // Anchor 29, created 2024-01-10: at 2024-02-15 the current window is
    // [2024-01-29, 2024-02-29).
    let s = TestSetup::new()?;
    s.seed_customer()?;
    s.seed_flat_plan("plan_a", 29, 10_000)?;
    let sub = s.create_subscription("plan_a", 0, at(2024, 1, 10)).await?;
    assert_eq!(sub.current_cycle_start_at, at(2024, 1, 10));
    assert_eq!(sub.current_cycle_end_at, at(2024, 1, 29));

    let snapshot = s
        .engine
        .drive_machine("proj_1", &sub.id, MachineEvent::Renew, at(2024, 2, 15))
        .await?;
    assert_eq!(snapshot.state, MachineState::Active);

    let renewed = s.db.get_subscription("proj_1", &sub.id)?.unwrap();
    assert_eq!(renewed.current_cycle_start_at, at(2024, 1, 29));
    assert_eq!(renewed.current_cycle_end_at, at(2024, 2, 29));
    assert_eq!(renewed.renew_at, Some(at(2024, 2, 29)));
    Ok(())
}

#[tokio::test]
async fn test_mid_cycle_downgrade_refunds_prepaid_remainder() -> Result<()> {
    // $100 prepaid for [2024-01-01, 2024-02-01); downgrade at 2024-01-16
    // refunds round(10000 * 16/31) = 5161 cents.
    let s = TestSetup::new()?;
    s.seed_customer()?;
    s.seed_flat_plan("plan_a", 1, 10_000)?;
    s.seed_flat_plan("plan_b", 1, 5_000)?;
    let sub = s.create_subscription("plan_a", 0, at(2024, 1, 1)).await?;

    // Materialize, invoice, finalize and collect the January cycle.
    s.engine
        .drive_machine("proj_1", &sub.id, MachineEvent::BillingPeriod, at(2024, 1, 1))
        .await?;
    s.engine
        .drive_machine("proj_1", &sub.id, MachineEvent::Invoice, at(2024, 1, 1))
        .await?;
    let schedulers = s.engine.scheduler_set();
    let collect_at = at_hms(2024, 1, 1, 1, 0, 0);
    assert!(schedulers.tick_billing(collect_at).await? >= 1);

    let invoices = s.db.list_invoices_for_subscription("proj_1", &sub.id)?;
    assert_eq!(invoices.len(), 1);
    assert_eq!(invoices[0].status, InvoiceStatus::Paid);
    assert_eq!(invoices[0].total, 10_000);

    // Downgrade mid-cycle.
    let snapshot = s
        .engine
        .subscriptions_update_phase(
            "proj_1",
            &sub.id,
            PhaseChange {
                new_plan_version_id: "plan_b".into(),
                payment_method_id: None,
                items: vec![("plan_b-base".into(), None)],
            },
            at(2024, 1, 16),
        )
        .await?;
    assert_eq!(snapshot.state, MachineState::Active);

    let credits = s.db.list_credit_grants_for_customer("proj_1", "cus_1")?;
    assert_eq!(credits.len(), 1);
    assert_eq!(credits[0].total_amount, 5_161);
    assert_eq!(credits[0].reason, "mid_cycle_change");
    assert!(credits[0].active);

    // The old phase is closed and a new one is active.
    let phases = s.db.list_phases_for_subscription("proj_1", &sub.id)?;
    assert_eq!(phases.len(), 2);
    assert_eq!(phases[0].end_at, Some(at(2024, 1, 16)));
    assert!(phases[1].end_at.is_none());
    Ok(())
}

#[tokio::test]
async fn test_provider_mismatch_leaves_invoice_unpaid_with_reason() -> Result<()> {
    let s = TestSetup::new()?;
    s.seed_customer()?;
    s.seed_flat_plan("plan_a", 1, 500)?;
    let sub = s.create_subscription("plan_a", 0, at(2024, 1, 1)).await?;

    s.engine
        .drive_machine("proj_1", &sub.id, MachineEvent::BillingPeriod, at(2024, 1, 1))
        .await?;
    s.engine
        .drive_machine("proj_1", &sub.id, MachineEvent::Invoice, at(2024, 1, 1))
        .await?;

    // Provider reports one cent more than the internal total.
    s.provider.set_total_delta(1);
    let schedulers = s.engine.scheduler_set();
    let processed = schedulers.tick_billing(at_hms(2024, 1, 1, 1, 0, 0)).await?;
    assert_eq!(processed, 0);

    let invoices = s.db.list_invoices_for_subscription("proj_1", &sub.id)?;
    assert_eq!(invoices.len(), 1);
    assert_eq!(invoices[0].status, InvoiceStatus::Unpaid);
    assert_eq!(invoices[0].metadata_reason.as_deref(), Some("provider_mismatch"));
    assert!(invoices[0].paid_at.is_none());
    Ok(())
}

#[tokio::test]
async fn test_hard_limit_denies_at_the_boundary() -> Result<()> {
    // Feature `api` with hard limit 1000: the report that would land at
    // 1001 is denied and the stored usage stays at 1000.
    let s = TestSetup::new()?;
    s.seed_customer()?;
    s.db.insert_grant(&Grant {
        id: new_id(),
        project_id: "proj_1".into(),
        subject_type: GrantSubject::Customer,
        subject_id: "cus_1".into(),
        feature_plan_version_id: new_id(),
        feature_slug: "api".into(),
        feature_type: FeatureType::Usage,
        aggregation_method: AggregationMethod::Sum,
        reset_config: BillingCycleSpec::monthly(1),
        pricing: PricingConfig::Usage { unit_amount_cents: 1 },
        kind: GrantKind::Manual,
        priority: GrantKind::Manual.default_priority(),
        effective_at: at(2024, 1, 1),
        expires_at: None,
        limit: Some(1000),
        hard_limit: true,
        units: None,
        deleted: false,
        created_at: at(2024, 1, 1),
    })?;

    let fill = s
        .engine
        .customers_report_usage("proj_1", "cus_1", "api", 1000.0, "fill", at(2024, 1, 10))
        .await?;
    assert!(fill.success);

    let over = s
        .engine
        .customers_report_usage("proj_1", "cus_1", "api", 1.0, "over", at(2024, 1, 11))
        .await?;
    assert!(!over.success);
    assert_eq!(over.message.as_deref(), Some("LIMIT_EXCEEDED"));

    let can = s
        .engine
        .customers_can("proj_1", "cus_1", "api", at(2024, 1, 12))
        .await?;
    assert!(!can.access);
    assert_eq!(can.current_usage, Some(1000.0));
    assert_eq!(can.units, Some(0.0));

    let ent = s.db.get_entitlement("proj_1", "cus_1", "api")?.unwrap();
    assert_eq!(ent.meter.usage, 1000.0);
    Ok(())
}

#[tokio::test]
async fn test_cancel_is_terminal() -> Result<()> {
    let s = TestSetup::new()?;
    s.seed_customer()?;
    s.seed_flat_plan("plan_a", 1, 10_000)?;
    let sub = s.create_subscription("plan_a", 0, at(2024, 1, 1)).await?;

    let snapshot = s
        .engine
        .subscriptions_cancel("proj_1", &sub.id, at(2024, 1, 20))
        .await?;
    assert_eq!(snapshot.state, MachineState::Canceled);

    let canceled = s.db.get_subscription("proj_1", &sub.id)?.unwrap();
    assert_eq!(canceled.status, SubscriptionStatus::Canceled);
    assert!(!canceled.active);
    assert_eq!(canceled.end_at, Some(at(2024, 1, 20)));

    // Terminal states accept no further events.
    let err = s
        .engine
        .drive_machine("proj_1", &sub.id, MachineEvent::Renew, at(2024, 2, 1))
        .await
        .unwrap_err();
    assert_eq!(BillingEngine::error_code(&err), billmesh::error::ErrorCode::Conflict);
    Ok(())
}

#[tokio::test]
async fn test_auto_renew_off_expires_at_cycle_end() -> Result<()> {
    let s = TestSetup::new()?;
    s.seed_customer()?;
    s.seed_flat_plan("plan_a", 1, 10_000)?;
    // A second plan with auto-renew disabled.
    s.db.insert_plan_version(&PlanVersion {
        id: "plan_noar".into(),
        project_id: "proj_1".into(),
        plan_slug: "plan-noar".into(),
        version: 1,
        currency: "USD".into(),
        payment_provider: PaymentProviderKind::Mock,
        when_to_bill: WhenToBill::PayInAdvance,
        collection_method: CollectionMethod::ChargeAutomatically,
        billing_config: BillingCycleSpec::monthly(1),
        grace_period: GracePeriod::default(),
        auto_renew: false,
        requires_payment_method: false,
        published: true,
    })?;
    let sub = s.create_subscription("plan_noar", 0, at(2024, 1, 1)).await?;

    let snapshot = s
        .engine
        .drive_machine("proj_1", &sub.id, MachineEvent::Renew, at(2024, 2, 1))
        .await?;
    assert_eq!(snapshot.state, MachineState::Expired);

    let expired = s.db.get_subscription("proj_1", &sub.id)?.unwrap();
    assert_eq!(expired.status, SubscriptionStatus::Expired);
    assert!(!expired.active);
    Ok(())
}

#[tokio::test]
async fn test_payment_failure_marks_past_due_and_recovery_reactivates() -> Result<()> {
    let s = TestSetup::new()?;
    s.seed_customer()?;
    s.seed_flat_plan("plan_a", 1, 10_000)?;
    let sub = s.create_subscription("plan_a", 0, at(2024, 1, 1)).await?;

    s.engine
        .drive_machine("proj_1", &sub.id, MachineEvent::BillingPeriod, at(2024, 1, 1))
        .await?;
    s.engine
        .drive_machine("proj_1", &sub.id, MachineEvent::Invoice, at(2024, 1, 1))
        .await?;

    s.provider.set_fail_collections(true);
    let schedulers = s.engine.scheduler_set();
    schedulers.tick_billing(at_hms(2024, 1, 1, 1, 0, 0)).await?;

    let past_due = s.db.get_subscription("proj_1", &sub.id)?.unwrap();
    assert_eq!(past_due.status, SubscriptionStatus::PastDue);
    let invoice = &s.db.list_invoices_for_subscription("proj_1", &sub.id)?[0];
    assert_eq!(invoice.status, InvoiceStatus::Unpaid);
    assert_eq!(invoice.payment_attempts.len(), 1);
    assert!(!invoice.payment_attempts[0].succeeded);

    // The card starts working again.
    s.provider.set_fail_collections(false);
    schedulers.tick_billing(at_hms(2024, 1, 1, 2, 0, 0)).await?;

    let recovered = s.db.get_subscription("proj_1", &sub.id)?.unwrap();
    assert_eq!(recovered.status, SubscriptionStatus::Active);
    let invoice = &s.db.list_invoices_for_subscription("proj_1", &sub.id)?[0];
    assert_eq!(invoice.status, InvoiceStatus::Paid);
    assert!(invoice.paid_at.is_some());
    Ok(())
}
