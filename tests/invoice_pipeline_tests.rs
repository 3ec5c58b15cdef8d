/// Invoice Pipeline Integration Tests
///
/// Exercises the scheduler-driven path from billing periods through
/// drafts, finalization with waterfall pricing and credits, to
/// collection, plus the idempotence and serialization guarantees the
/// pipeline leans on.

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use tempfile::TempDir;

use billmesh::analytics::{InMemoryAnalytics, UsageEvent};
use billmesh::config::Config;
use billmesh::database::DatabaseManager;
use billmesh::engine::{BillingEngine, CreateSubscriptionRequest, GetUsageRequest};
use billmesh::payment_provider::MockPaymentProvider;
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
    analytics: Arc<InMemoryAnalytics>,
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
            analytics.clone(),
            provider,
        );
        Ok(TestSetup {
            _temp: temp,
            db,
            analytics,
            engine,
        })
    }

    fn seed_customer(&self) -> Result<()> {
        self.db.insert_customer(&Customer {
            id: "cus_1".into(),
            project_id: "proj_1".into(),
            email: "grace@example.com".into(),
            default_currency: "USD".into(),
            timezone: "UTC".into(),
            active: true,
            stripe_customer_id: None,
            created_at: at(2024, 1, 1),
        })?;
        Ok(())
    }

    /// Monthly pay-in-arrear plan with one metered usage feature.
    fn seed_usage_plan(&self, unit_amount_cents: i64) -> Result<()> {
        self.db.insert_plan_version(&PlanVersion {
            id: "plan_usage".into(),
            project_id: "proj_1".into(),
            plan_slug: "metered".into(),
            version: 1,
            currency: "USD".into(),
            payment_provider: PaymentProviderKind::Mock,
            when_to_bill: WhenToBill::PayInArrear,
            collection_method: CollectionMethod::ChargeAutomatically,
            billing_config: BillingCycleSpec::monthly(1),
            grace_period: GracePeriod::default(),
            auto_renew: true,
            requires_payment_method: true,
            published: true,
        })?;
        self.db.insert_feature_plan_version(&FeaturePlanVersion {
            id: "fpv_api".into(),
            project_id: "proj_1".into(),
            plan_version_id: "plan_usage".into(),
            feature_slug: "api".into(),
            feature_type: FeatureType::Usage,
            aggregation_method: AggregationMethod::Sum,
            pricing: PricingConfig::Usage { unit_amount_cents },
            limit: None,
            hard_limit: false,
            reset_config: BillingCycleSpec::monthly(1),
            default_units: None,
        })?;
        Ok(())
    }

    async fn create_subscription(&self, now: DateTime<Utc>) -> Result<Subscription> {
        Ok(self
            .engine
            .subscriptions_create(&CreateSubscriptionRequest {
                project_id: "proj_1".into(),
                customer_id: "cus_1".into(),
                plan_version_id: "plan_usage".into(),
                payment_method_id: Some("pm_1".into()),
                trial_days: 0,
                timezone: None,
                now,
            })
            .await?)
    }

    async fn ingest_usage(&self, value: f64, ts: DateTime<Utc>) -> Result<()> {
        use billmesh::analytics::UsageAnalytics;
        self.analytics
            .ingest(UsageEvent {
                seq: 0,
                project_id: "proj_1".into(),
                customer_id: "cus_1".into(),
                feature_slug: "api".into(),
                entitlement_id: None,
                subscription_item_id: None,
                value,
                ts,
                idempotence_key: None,
            })
            .await?;
        Ok(())
    }
}

#[tokio::test]
async fn test_arrear_pipeline_prices_usage_from_analytics() -> Result<()> {
    let s = TestSetup::new()?;
    s.seed_customer()?;
    s.seed_usage_plan(50)?;
    let sub = s.create_subscription(at(2024, 1, 1)).await?;

    // Usage lands inside the January cycle.
    s.ingest_usage(100.0, at(2024, 1, 10)).await?;
    s.ingest_usage(25.0, at(2024, 1, 20)).await?;

    let schedulers = s.engine.scheduler_set();
    // Periods materialize during the cycle; arrear invoicing becomes due
    // at the cycle end.
    assert!(schedulers.tick_periods(at(2024, 1, 5)).await? >= 1);
    assert_eq!(schedulers.tick_invoicing(at(2024, 1, 5)).await?, 0);
    assert!(schedulers.tick_invoicing(at(2024, 2, 1)).await? >= 1);

    let invoices = s.db.list_invoices_for_subscription("proj_1", &sub.id)?;
    assert_eq!(invoices.len(), 1);
    assert_eq!(invoices[0].status, InvoiceStatus::Draft);
    // Arrear grace: due 60 minutes after the invoice date.
    assert_eq!(invoices[0].due_at, at_hms(2024, 2, 1, 1, 0, 0));

    assert!(schedulers.tick_finalize(at_hms(2024, 2, 1, 1, 0, 0)).await? >= 1);
    let invoice = &s.db.list_invoices_for_subscription("proj_1", &sub.id)?[0];
    assert_eq!(invoice.status, InvoiceStatus::Unpaid);
    // 125 units at 50 cents.
    assert_eq!(invoice.subtotal, 6_250);
    assert_eq!(invoice.total, 6_250);

    let items = s.db.list_items_for_invoice("proj_1", &invoice.id)?;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].quantity, 125.0);
    assert_eq!(items[0].unit_amount_cents, Some(50));

    assert!(schedulers.tick_billing(at_hms(2024, 2, 1, 1, 30, 0)).await? >= 1);
    let invoice = &s.db.list_invoices_for_subscription("proj_1", &sub.id)?[0];
    assert_eq!(invoice.status, InvoiceStatus::Paid);
    Ok(())
}

#[tokio::test]
async fn test_assembly_is_idempotent() -> Result<()> {
    let s = TestSetup::new()?;
    s.seed_customer()?;
    s.seed_usage_plan(50)?;
    let sub = s.create_subscription(at(2024, 1, 1)).await?;

    let schedulers = s.engine.scheduler_set();
    schedulers.tick_periods(at(2024, 1, 5)).await?;
    // Re-materializing the same cycle inserts nothing new.
    schedulers.tick_periods(at(2024, 1, 6)).await?;

    schedulers.tick_invoicing(at(2024, 2, 1)).await?;
    let first_invoices = s.db.list_invoices_for_subscription("proj_1", &sub.id)?;
    let first_items = s.db.list_items_for_invoice("proj_1", &first_invoices[0].id)?;

    // Re-running assembly with identical inputs produces zero new rows.
    schedulers.tick_invoicing(at(2024, 2, 1)).await?;
    let second_invoices = s.db.list_invoices_for_subscription("proj_1", &sub.id)?;
    assert_eq!(second_invoices.len(), first_invoices.len());
    let second_items = s.db.list_items_for_invoice("proj_1", &second_invoices[0].id)?;
    assert_eq!(second_items.len(), first_items.len());
    Ok(())
}

#[tokio::test]
async fn test_credits_cover_invoice_and_void_it() -> Result<()> {
    let s = TestSetup::new()?;
    s.seed_customer()?;
    s.seed_usage_plan(50)?;
    let sub = s.create_subscription(at(2024, 1, 1)).await?;
    s.ingest_usage(10.0, at(2024, 1, 10)).await?;

    // A credit larger than the upcoming invoice.
    s.db.insert_credit_grant(&CreditGrant {
        id: new_id(),
        project_id: "proj_1".into(),
        customer_id: "cus_1".into(),
        currency: "USD".into(),
        payment_provider: PaymentProviderKind::Mock,
        total_amount: 10_000,
        amount_used: 0,
        expires_at: None,
        active: true,
        reason: "goodwill".into(),
        created_at: at(2024, 1, 1),
    })?;

    let schedulers = s.engine.scheduler_set();
    schedulers.tick_periods(at(2024, 1, 5)).await?;
    schedulers.tick_invoicing(at(2024, 2, 1)).await?;
    schedulers.tick_finalize(at_hms(2024, 2, 1, 1, 0, 0)).await?;

    let invoice = &s.db.list_invoices_for_subscription("proj_1", &sub.id)?[0];
    // 10 units at 50 cents, fully covered by credit.
    assert_eq!(invoice.subtotal, 500);
    assert_eq!(invoice.amount_credit_used, 500);
    assert_eq!(invoice.total, 0);
    assert_eq!(invoice.status, InvoiceStatus::Void);

    // Credit accounting is monotonic.
    let applications = s.db.list_credit_applications_for_invoice("proj_1", &invoice.id)?;
    let applied: i64 = applications.iter().map(|a| a.amount_applied).sum();
    let grants = s.db.list_credit_grants_for_customer("proj_1", "cus_1")?;
    let used: i64 = grants.iter().map(|g| g.amount_used).sum();
    assert_eq!(applied, 500);
    assert_eq!(used, applied);
    assert!(grants[0].active);
    assert_eq!(grants[0].remaining(), 9_500);
    Ok(())
}

#[tokio::test]
async fn test_lock_serializes_scheduler_and_caller() -> Result<()> {
    let s = TestSetup::new()?;
    s.seed_customer()?;
    s.seed_usage_plan(50)?;
    let sub = s.create_subscription(at(2024, 1, 1)).await?;

    // A foreign worker holds the subscription lease.
    assert!(s.db.lock_try_acquire(
        "proj_1",
        &sub.id,
        "other-worker",
        at(2024, 1, 5),
        chrono::Duration::seconds(60)
    )?);

    // The periods tick skips the held subscription instead of failing.
    let schedulers = s.engine.scheduler_set();
    assert_eq!(schedulers.tick_periods(at(2024, 1, 5)).await?, 0);
    assert_eq!(
        s.db.list_due_pending_periods("proj_1", &sub.id, at(2024, 2, 1))?.len(),
        0
    );

    // Once released, the next tick proceeds.
    s.db.lock_release("proj_1", &sub.id)?;
    assert!(schedulers.tick_periods(at(2024, 1, 5)).await? >= 1);
    Ok(())
}

#[tokio::test]
async fn test_renew_tick_rolls_the_cycle_forward() -> Result<()> {
    let s = TestSetup::new()?;
    s.seed_customer()?;
    s.seed_usage_plan(50)?;
    let sub = s.create_subscription(at(2024, 1, 1)).await?;
    assert_eq!(sub.renew_at, Some(at(2024, 2, 1)));

    let schedulers = s.engine.scheduler_set();
    // Not due yet.
    assert_eq!(schedulers.tick_renew(at(2024, 1, 20)).await?, 0);

    // Due at the cycle boundary: the window rolls into February.
    assert!(schedulers.tick_renew(at(2024, 2, 1)).await? >= 1);
    let renewed = s.db.get_subscription("proj_1", &sub.id)?.unwrap();
    assert_eq!(renewed.current_cycle_start_at, at(2024, 2, 1));
    assert_eq!(renewed.current_cycle_end_at, at(2024, 3, 1));
    assert_eq!(renewed.renew_at, Some(at(2024, 3, 1)));

    // Re-running at the same instant is a no-op renewal.
    schedulers.tick_renew(at(2024, 2, 1)).await?;
    let again = s.db.get_subscription("proj_1", &sub.id)?.unwrap();
    assert_eq!(again.current_cycle_start_at, at(2024, 2, 1));
    Ok(())
}

#[tokio::test]
async fn test_get_usage_returns_rows_and_empty_on_no_match() -> Result<()> {
    let s = TestSetup::new()?;
    s.seed_customer()?;
    s.ingest_usage(42.0, at(2024, 1, 10)).await?;

    let response = s
        .engine
        .customers_get_usage(&GetUsageRequest {
            project_id: Some("proj_1".into()),
            customer_id: Some("cus_1".into()),
            feature_slug: Some("api".into()),
            ..Default::default()
        })
        .await;
    assert_eq!(response.usage.len(), 1);
    assert_eq!(response.usage[0].value, 42.0);

    let empty = s
        .engine
        .customers_get_usage(&GetUsageRequest {
            project_id: Some("proj_unknown".into()),
            ..Default::default()
        })
        .await;
    assert!(empty.usage.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_entitlements_listing_reflects_grants() -> Result<()> {
    let s = TestSetup::new()?;
    s.seed_customer()?;
    s.seed_usage_plan(50)?;
    s.create_subscription(at(2024, 1, 1)).await?;

    // First verification materializes the entitlement row.
    let can = s
        .engine
        .customers_can("proj_1", "cus_1", "api", at(2024, 1, 2))
        .await?;
    assert!(can.access);
    assert_eq!(can.feature_type, Some(FeatureType::Usage));

    let entitlements = s.engine.customers_entitlements("proj_1", "cus_1")?;
    assert_eq!(entitlements.len(), 1);
    assert_eq!(entitlements[0].feature_slug, "api");
    assert_eq!(entitlements[0].version.len(), 64);
    Ok(())
}
