/// Billing Engine Facade
///
/// Wires the storage, evaluator, machine and payment layers into the
/// public operations callers use: feature access checks, usage reporting,
/// entitlement listings, usage queries, and the subscription lifecycle
/// calls that drive the state machine. Transport, authentication and API
/// key handling live outside this crate; callers arrive here already
/// scoped to a project.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::analytics::{UsageAnalytics, UsageQuery};
use crate::calendar_cycle::CycleSchedule;
use crate::config::Config;
use crate::database::DatabaseManager;
use crate::entitlement::{
    EntitlementEvaluator, ReportUsageRequest, VerifyRequest,
};
use crate::error::{BillingError, BillingResult, DeniedReason, ErrorCode};
use crate::invoice_assembler::InvoiceAssembler;
use crate::invoice_finalizer::InvoiceFinalizer;
use crate::payment_collector::PaymentCollector;
use crate::payment_provider::PaymentProvider;
use crate::period_materializer::{PeriodMaterializer, PhaseChange};
use crate::schedulers::SchedulerSet;
use crate::subscription_lock::SubscriptionLockService;
use crate::subscription_machine::{
    MachineEvent, MachineServices, MachineSnapshot, SubscriptionMachine, INVOICE_TIMEOUT,
    SEND_TIMEOUT,
};
use crate::types::*;

/// `customers.can` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanResponse {
    pub access: bool,
    pub denied_reason: Option<DeniedReason>,
    pub current_usage: Option<f64>,
    pub limit: Option<i64>,
    pub feature_type: Option<FeatureType>,
    pub units: Option<f64>,
}

/// `customers.reportUsage` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportResult {
    pub success: bool,
    pub message: Option<String>,
    pub cache_hit: bool,
}

/// One row of a usage query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRow {
    pub customer_id: String,
    pub feature_slug: String,
    pub value: f64,
    pub ts: DateTime<Utc>,
}

/// `customers.getUsage` response. Errors collapse to an empty usage list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageQueryResponse {
    pub usage: Vec<UsageRow>,
}

#[derive(Debug, Clone, Default)]
pub struct GetUsageRequest {
    pub project_id: Option<String>,
    pub customer_id: Option<String>,
    pub feature_slug: Option<String>,
    pub entitlement_id: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct CreateSubscriptionRequest {
    pub project_id: String,
    pub customer_id: String,
    pub plan_version_id: String,
    pub payment_method_id: Option<String>,
    pub trial_days: u32,
    pub timezone: Option<String>,
    pub now: DateTime<Utc>,
}

pub struct BillingEngine {
    config: Config,
    db: Arc<DatabaseManager>,
    analytics: Arc<dyn UsageAnalytics>,
    evaluator: Arc<EntitlementEvaluator>,
    locks: SubscriptionLockService,
    machine_services: MachineServices,
    finalizer: Arc<InvoiceFinalizer>,
    collector: Arc<PaymentCollector>,
}

impl BillingEngine {
    pub fn new(
        config: Config,
        db: Arc<DatabaseManager>,
        analytics: Arc<dyn UsageAnalytics>,
        provider: Arc<dyn PaymentProvider>,
    ) -> Self {
        let evaluator = Arc::new(EntitlementEvaluator::new(
            db.clone(),
            analytics.clone(),
            &config.cache,
        ));
        let locks = SubscriptionLockService::new(db.clone(), config.lock_ttl());
        let materializer = Arc::new(PeriodMaterializer::new(db.clone()));
        let assembler = Arc::new(InvoiceAssembler::new(db.clone(), config.billing.clone()));
        let machine_services = MachineServices {
            db: db.clone(),
            materializer,
            assembler,
        };
        let finalizer = Arc::new(InvoiceFinalizer::new(
            db.clone(),
            analytics.clone(),
            provider.clone(),
            config.billing.provider_concurrency,
        ));
        let collector = Arc::new(PaymentCollector::new(db.clone(), provider));
        Self {
            config,
            db,
            analytics,
            evaluator,
            locks,
            machine_services,
            finalizer,
            collector,
        }
    }

    pub fn db(&self) -> &Arc<DatabaseManager> {
        &self.db
    }

    pub fn evaluator(&self) -> &Arc<EntitlementEvaluator> {
        &self.evaluator
    }

    /// Build the scheduler set sharing this engine's services.
    pub fn scheduler_set(&self) -> Arc<SchedulerSet> {
        Arc::new(SchedulerSet::new(
            self.db.clone(),
            self.locks.clone(),
            self.machine_services.clone(),
            self.finalizer.clone(),
            self.collector.clone(),
            self.config.schedulers.clone(),
        ))
    }

    // ===== Customer operations =====

    pub async fn customers_can(
        &self,
        project_id: &str,
        customer_id: &str,
        feature_slug: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<CanResponse> {
        let response = self
            .evaluator
            .verify(&VerifyRequest {
                project_id: project_id.to_string(),
                customer_id: customer_id.to_string(),
                feature_slug: feature_slug.to_string(),
                now,
                from_cache: false,
            })
            .await?;
        Ok(CanResponse {
            access: response.allowed,
            denied_reason: response.denied_reason,
            current_usage: response.usage,
            limit: response.limit,
            feature_type: response.feature_type,
            units: response.remaining,
        })
    }

    pub async fn customers_report_usage(
        &self,
        project_id: &str,
        customer_id: &str,
        feature_slug: &str,
        usage: f64,
        idempotence_key: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<ReportResult> {
        let response = self
            .evaluator
            .report_usage(&ReportUsageRequest {
                project_id: project_id.to_string(),
                customer_id: customer_id.to_string(),
                feature_slug: feature_slug.to_string(),
                usage,
                idempotence_key: idempotence_key.to_string(),
                now,
            })
            .await?;
        let message = match (&response.denied_reason, response.notified_over_limit) {
            (Some(reason), _) => Some(reason.as_str().to_string()),
            (None, true) => Some("over soft limit".to_string()),
            _ => None,
        };
        Ok(ReportResult {
            success: response.allowed,
            message,
            cache_hit: response.cache_hit,
        })
    }

    pub fn customers_entitlements(
        &self,
        project_id: &str,
        customer_id: &str,
    ) -> BillingResult<Vec<Entitlement>> {
        self.db.list_entitlements_for_customer(project_id, customer_id)
    }

    /// Usage rows for audits and dashboards. Failures degrade to an empty
    /// usage list rather than a differently-shaped payload.
    pub async fn customers_get_usage(&self, request: &GetUsageRequest) -> UsageQueryResponse {
        let query = UsageQuery {
            project_id: request.project_id.clone(),
            customer_id: request.customer_id.clone(),
            feature_slug: request.feature_slug.clone(),
            entitlement_id: request.entitlement_id.clone(),
            subscription_item_id: None,
            start: request.start,
            end: request.end,
        };
        match self.analytics.list(&query).await {
            Ok(events) => UsageQueryResponse {
                usage: events
                    .into_iter()
                    .map(|e| UsageRow {
                        customer_id: e.customer_id,
                        feature_slug: e.feature_slug,
                        value: e.value,
                        ts: e.ts,
                    })
                    .collect(),
            },
            Err(e) => {
                warn!("usage query failed: {}", e);
                UsageQueryResponse { usage: Vec::new() }
            }
        }
    }

    // ===== Subscription operations =====

    /// Create a subscription on a published plan: the initial phase, its
    /// items, and one subscription grant per plan feature.
    pub async fn subscriptions_create(
        &self,
        request: &CreateSubscriptionRequest,
    ) -> BillingResult<Subscription> {
        let customer = self
            .db
            .get_customer(&request.project_id, &request.customer_id)?
            .ok_or_else(|| BillingError::NotFound {
                entity: "customer",
                id: request.customer_id.clone(),
            })?;
        if !customer.active {
            return Err(BillingError::BadRequest(format!(
                "customer {} is deactivated",
                customer.id
            )));
        }
        let plan = self
            .db
            .get_plan_version(&request.project_id, &request.plan_version_id)?
            .ok_or_else(|| BillingError::NotFound {
                entity: "plan_version",
                id: request.plan_version_id.clone(),
            })?;
        if !plan.published {
            return Err(BillingError::BadRequest(format!(
                "plan version {} is not published",
                plan.id
            )));
        }

        let now = request.now;
        let trial_ends_at = (request.trial_days > 0)
            .then(|| now + chrono::Duration::days(request.trial_days as i64));

        let mut spec = plan.billing_config;
        if spec.anchor == 0 && spec.interval == BillingInterval::Month {
            spec.anchor = chrono::Datelike::day(&now);
        }
        let mut schedule = CycleSchedule::new(now, spec);
        if let Some(trial_end) = trial_ends_at {
            schedule = schedule.with_trial_end(trial_end);
        }
        let window = schedule.cycle_window(now).ok_or_else(|| {
            BillingError::InvariantViolation("new subscription has no cycle window".to_string())
        })?;

        let timezone = request
            .timezone
            .clone()
            .unwrap_or_else(|| customer.timezone.clone());
        let subscription = Subscription {
            id: new_id(),
            project_id: request.project_id.clone(),
            customer_id: request.customer_id.clone(),
            status: if trial_ends_at.is_some() {
                SubscriptionStatus::Trialing
            } else {
                SubscriptionStatus::Active
            },
            active: true,
            plan_slug: plan.plan_slug.clone(),
            current_cycle_start_at: window.start,
            current_cycle_end_at: window.end,
            renew_at: Some(window.end),
            end_at: None,
            timezone: timezone.clone(),
            created_at: now,
        };
        self.db.insert_subscription(&subscription)?;

        let phase = SubscriptionPhase {
            id: new_id(),
            project_id: request.project_id.clone(),
            subscription_id: subscription.id.clone(),
            plan_version_id: plan.id.clone(),
            payment_method_id: request.payment_method_id.clone(),
            trial_ends_at,
            start_at: now,
            end_at: None,
            current_cycle_start_at: window.start,
            current_cycle_end_at: window.end,
            renew_at: Some(window.end),
            billing_anchor: spec.anchor,
        };
        self.db.insert_phase(&phase)?;

        for feature in self
            .db
            .list_features_for_plan_version(&request.project_id, &plan.id)?
        {
            let item = SubscriptionItem {
                id: new_id(),
                project_id: request.project_id.clone(),
                subscription_phase_id: phase.id.clone(),
                subscription_id: subscription.id.clone(),
                feature_plan_version_id: feature.id.clone(),
                units: feature.default_units,
            };
            self.db.insert_item(&item)?;

            self.db.insert_grant(&Grant {
                id: new_id(),
                project_id: request.project_id.clone(),
                subject_type: GrantSubject::Customer,
                subject_id: request.customer_id.clone(),
                feature_plan_version_id: feature.id.clone(),
                feature_slug: feature.feature_slug.clone(),
                feature_type: feature.feature_type,
                aggregation_method: feature.aggregation_method,
                reset_config: feature.reset_config,
                pricing: feature.pricing.clone(),
                kind: GrantKind::Subscription,
                priority: GrantKind::Subscription.default_priority(),
                effective_at: now,
                expires_at: None,
                limit: feature.limit,
                hard_limit: feature.hard_limit,
                units: feature.default_units,
                deleted: false,
                created_at: now,
            })?;
        }

        info!(
            subscription_id = %subscription.id,
            customer_id = %request.customer_id,
            plan = %plan.plan_slug,
            trialing = trial_ends_at.is_some(),
            "subscription created"
        );
        Ok(subscription)
    }

    /// Mid-cycle plan change through the machine's CHANGE event.
    pub async fn subscriptions_update_phase(
        &self,
        project_id: &str,
        subscription_id: &str,
        change: PhaseChange,
        now: DateTime<Utc>,
    ) -> BillingResult<MachineSnapshot> {
        self.drive_machine(project_id, subscription_id, MachineEvent::Change(change), now)
            .await
    }

    pub async fn subscriptions_cancel(
        &self,
        project_id: &str,
        subscription_id: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<MachineSnapshot> {
        self.drive_machine(project_id, subscription_id, MachineEvent::Cancel, now)
            .await
    }

    /// Send one event to a subscription's machine under its lock.
    pub async fn drive_machine(
        &self,
        project_id: &str,
        subscription_id: &str,
        event: MachineEvent,
        now: DateTime<Utc>,
    ) -> BillingResult<MachineSnapshot> {
        let guard = self
            .locks
            .acquire(project_id, subscription_id, now)?
            .ok_or_else(|| BillingError::LockHeld {
                subscription_id: subscription_id.to_string(),
            })?;
        let timeout = match &event {
            MachineEvent::Invoice => INVOICE_TIMEOUT,
            _ => SEND_TIMEOUT,
        };
        let result = async {
            let machine = SubscriptionMachine::spawn(
                self.machine_services.clone(),
                project_id,
                subscription_id,
                now,
            )
            .await?;
            machine.send_and_wait(event, now, timeout).await
        }
        .await;
        guard.release()?;
        result
    }

    /// Map an engine error onto the wire error code.
    pub fn error_code(error: &BillingError) -> ErrorCode {
        error.code()
    }
}
