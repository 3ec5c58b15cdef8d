/// Subscription State Machine
///
/// Actor-style finite state machine orchestrating a subscription's
/// lifecycle. States mirror the persisted subscription statuses plus the
/// transitional states a running invoke passes through; `error` is
/// terminal and carries the externally reported failure message. Events
/// arrive on a per-instance FIFO queue so two events can never drive two
/// overlapping invokes, and every status-tagged transition writes
/// `{status, active}` back to the subscription row in its own short
/// transaction.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use crate::database::DatabaseManager;
use crate::error::{BillingError, BillingResult};
use crate::invoice_assembler::InvoiceAssembler;
use crate::period_materializer::{PeriodMaterializer, PhaseChange};
use crate::types::*;

/// Default wait for a machine answer.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);
/// Renewal runs calendar math plus two row updates.
pub const RENEW_TIMEOUT: Duration = Duration::from_secs(15);
/// Invoicing touches many rows and may suspend on the provider.
pub const INVOICE_TIMEOUT: Duration = Duration::from_secs(30);

/// Machine states. Stable states correspond to persisted statuses;
/// transitional states are only observable while an invoke is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    Loading,
    Restored,
    Trialing,
    Active,
    PastDue,
    GeneratingBillingPeriods,
    Invoicing,
    Renewing,
    Canceling,
    Changing,
    Expiring,
    Canceled,
    Expired,
    Error,
}

impl MachineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MachineState::Loading => "loading",
            MachineState::Restored => "restored",
            MachineState::Trialing => "trialing",
            MachineState::Active => "active",
            MachineState::PastDue => "past_due",
            MachineState::GeneratingBillingPeriods => "generating_billing_periods",
            MachineState::Invoicing => "invoicing",
            MachineState::Renewing => "renewing",
            MachineState::Canceling => "canceling",
            MachineState::Changing => "changing",
            MachineState::Expiring => "expiring",
            MachineState::Canceled => "canceled",
            MachineState::Expired => "expired",
            MachineState::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MachineState::Canceled | MachineState::Expired | MachineState::Error
        )
    }

    fn from_status(status: SubscriptionStatus) -> Self {
        match status {
            SubscriptionStatus::Trialing => MachineState::Trialing,
            SubscriptionStatus::Active => MachineState::Active,
            SubscriptionStatus::PastDue => MachineState::PastDue,
            SubscriptionStatus::Canceled => MachineState::Canceled,
            SubscriptionStatus::Expired => MachineState::Expired,
        }
    }

    fn status(&self) -> Option<SubscriptionStatus> {
        match self {
            MachineState::Trialing => Some(SubscriptionStatus::Trialing),
            MachineState::Active => Some(SubscriptionStatus::Active),
            MachineState::PastDue => Some(SubscriptionStatus::PastDue),
            MachineState::Canceled => Some(SubscriptionStatus::Canceled),
            MachineState::Expired => Some(SubscriptionStatus::Expired),
            _ => None,
        }
    }
}

/// External events accepted by the machine.
#[derive(Debug, Clone)]
pub enum MachineEvent {
    BillingPeriod,
    Invoice,
    Renew,
    Cancel,
    Change(PhaseChange),
    PaymentSuccess,
    PaymentFailure,
    InvoiceSuccess,
    InvoiceFailure,
}

impl MachineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            MachineEvent::BillingPeriod => "BILLING_PERIOD",
            MachineEvent::Invoice => "INVOICE",
            MachineEvent::Renew => "RENEW",
            MachineEvent::Cancel => "CANCEL",
            MachineEvent::Change(_) => "CHANGE",
            MachineEvent::PaymentSuccess => "PAYMENT_SUCCESS",
            MachineEvent::PaymentFailure => "PAYMENT_FAILURE",
            MachineEvent::InvoiceSuccess => "INVOICE_SUCCESS",
            MachineEvent::InvoiceFailure => "INVOICE_FAILURE",
        }
    }
}

/// Observable machine state after an event settles.
#[derive(Debug, Clone)]
pub struct MachineSnapshot {
    pub state: MachineState,
    pub has_due_billing_periods: bool,
    pub error: Option<String>,
}

/// Collaborators a machine instance needs.
#[derive(Clone)]
pub struct MachineServices {
    pub db: Arc<DatabaseManager>,
    pub materializer: Arc<PeriodMaterializer>,
    pub assembler: Arc<InvoiceAssembler>,
}

struct Envelope {
    event: MachineEvent,
    now: DateTime<Utc>,
    reply: oneshot::Sender<BillingResult<MachineSnapshot>>,
}

/// Handle to a spawned machine instance. Dropping the handle stops the
/// instance once its queue drains.
pub struct SubscriptionMachine {
    tx: mpsc::UnboundedSender<Envelope>,
    subscription_id: String,
}

impl SubscriptionMachine {
    /// Load a subscription and settle into its stable state
    /// (`loading -> restored -> <status>`). Load failures surface as the
    /// terminal error state.
    pub async fn spawn(
        services: MachineServices,
        project_id: &str,
        subscription_id: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<Self> {
        let mut runtime = MachineRuntime::load(services, project_id, subscription_id, now).await?;
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let id = subscription_id.to_string();
        tokio::spawn(async move {
            // FIFO: one envelope at a time, in arrival order.
            while let Some(envelope) = rx.recv().await {
                let result = runtime.handle(envelope.event, envelope.now).await;
                let _ = envelope.reply.send(result);
            }
            debug!(subscription_id = %runtime.subscription_id, "machine instance stopped");
        });
        Ok(Self {
            tx,
            subscription_id: id,
        })
    }

    /// Send an event and wait for the machine to settle, bounded by
    /// `timeout`. A timeout leaves the in-flight invoke to finish on the
    /// queue but reports a typed error to the caller.
    pub async fn send_and_wait(
        &self,
        event: MachineEvent,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> BillingResult<MachineSnapshot> {
        let name = event.name();
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Envelope { event, now, reply })
            .map_err(|_| BillingError::Conflict(format!(
                "machine for subscription {} is gone",
                self.subscription_id
            )))?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BillingError::Conflict(format!(
                "machine for subscription {} dropped the event",
                self.subscription_id
            ))),
            Err(_) => Err(BillingError::Timeout {
                waiting_for: format!("{} on subscription {}", name, self.subscription_id),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

/// Guard evaluation with the failed predicate names, for precise error
/// messages.
struct GuardCheck {
    failed: Vec<&'static str>,
}

impl GuardCheck {
    fn new() -> Self {
        Self { failed: Vec::new() }
    }

    fn require(&mut self, name: &'static str, ok: bool) -> &mut Self {
        if !ok {
            self.failed.push(name);
        }
        self
    }

    fn ok(&self) -> bool {
        self.failed.is_empty()
    }

    fn into_error(self, state: MachineState, event: &MachineEvent) -> BillingError {
        BillingError::GuardRejected {
            state: state.as_str().to_string(),
            event: event.name().to_string(),
            failed: self.failed.iter().map(|s| s.to_string()).collect(),
        }
    }
}

struct MachineRuntime {
    services: MachineServices,
    project_id: String,
    subscription_id: String,
    state: MachineState,
    subscription: Subscription,
    phase: Option<SubscriptionPhase>,
    plan: Option<PlanVersion>,
    has_due_billing_periods: bool,
    error: Option<String>,
}

impl MachineRuntime {
    async fn load(
        services: MachineServices,
        project_id: &str,
        subscription_id: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<Self> {
        // loading -> restored
        let subscription = services
            .db
            .get_subscription(project_id, subscription_id)?
            .ok_or_else(|| BillingError::NotFound {
                entity: "subscription",
                id: subscription_id.to_string(),
            })?;
        let phase = services
            .db
            .get_active_phase(project_id, subscription_id, now)?;
        let plan = match &phase {
            Some(phase) => services
                .db
                .get_plan_version(project_id, &phase.plan_version_id)?,
            None => None,
        };
        let has_due_billing_periods =
            services
                .db
                .has_due_pending_periods(project_id, subscription_id, now)?;

        // restored -> stable state by loaded status
        let state = MachineState::from_status(subscription.status);
        debug!(
            subscription_id,
            state = state.as_str(),
            "machine restored"
        );
        Ok(Self {
            services,
            project_id: project_id.to_string(),
            subscription_id: subscription_id.to_string(),
            state,
            subscription,
            phase,
            plan,
            has_due_billing_periods,
            error: None,
        })
    }

    fn snapshot(&self) -> MachineSnapshot {
        MachineSnapshot {
            state: self.state,
            has_due_billing_periods: self.has_due_billing_periods,
            error: self.error.clone(),
        }
    }

    /// Move to a state; status-tagged states persist `{status, active}`.
    fn transition(&mut self, state: MachineState) -> BillingResult<()> {
        if let Some(status) = state.status() {
            if status != self.subscription.status {
                self.services.db.update_subscription_status(
                    &self.project_id,
                    &self.subscription_id,
                    status,
                )?;
                self.subscription.status = status;
                self.subscription.active = !status.is_terminal();
                info!(
                    subscription_id = %self.subscription_id,
                    status = status.as_str(),
                    "subscription status persisted"
                );
            }
        }
        self.state = state;
        Ok(())
    }

    /// Fatal failure: terminal error state with the reported message.
    fn fail(&mut self, message: String) -> MachineSnapshot {
        error!(subscription_id = %self.subscription_id, "machine error: {}", message);
        self.error = Some(message);
        self.state = MachineState::Error;
        self.snapshot()
    }

    // ===== Guards =====

    fn can_renew(&self, now: DateTime<Utc>) -> bool {
        let renew_due = self
            .subscription
            .renew_at
            .map_or(false, |renew_at| now >= renew_at);
        let not_ended = self
            .subscription
            .end_at
            .map_or(true, |end_at| end_at >= now);
        renew_due && not_ended
    }

    fn is_trial_expired(&self, now: DateTime<Utc>) -> bool {
        self.phase
            .as_ref()
            .and_then(|p| p.trial_ends_at)
            .map_or(true, |t| t <= now)
    }

    fn has_valid_payment_method(&self) -> bool {
        let required = self
            .plan
            .as_ref()
            .map_or(false, |p| p.requires_payment_method);
        !required
            || self
                .phase
                .as_ref()
                .map_or(false, |p| p.payment_method_id.is_some())
    }

    fn is_auto_renew_enabled(&self) -> bool {
        self.plan.as_ref().map_or(false, |p| p.auto_renew)
    }

    fn is_advance_billing(&self) -> bool {
        self.plan
            .as_ref()
            .map_or(false, |p| p.when_to_bill == WhenToBill::PayInAdvance)
    }

    // ===== Event dispatch =====

    async fn handle(
        &mut self,
        event: MachineEvent,
        now: DateTime<Utc>,
    ) -> BillingResult<MachineSnapshot> {
        if self.state.is_terminal() {
            return Err(BillingError::Conflict(format!(
                "subscription {} is {} and accepts no events",
                self.subscription_id,
                self.state.as_str()
            )));
        }
        debug!(
            subscription_id = %self.subscription_id,
            state = self.state.as_str(),
            event = event.name(),
            "machine event"
        );
        match (self.state, &event) {
            (MachineState::Trialing, MachineEvent::BillingPeriod)
            | (MachineState::Active, MachineEvent::BillingPeriod)
            | (MachineState::PastDue, MachineEvent::BillingPeriod) => {
                let mut guards = GuardCheck::new();
                guards.require("subscriptionActive", self.subscription.active);
                if !guards.ok() {
                    return Err(guards.into_error(self.state, &event));
                }
                self.invoke_generate_billing_periods(now).await
            }

            (MachineState::Trialing, MachineEvent::Renew) => {
                let mut guards = GuardCheck::new();
                guards
                    .require("isTrialExpired", self.is_trial_expired(now))
                    .require("hasValidPaymentMethod", self.has_valid_payment_method())
                    .require("canRenew", self.can_renew(now));
                if !guards.ok() {
                    let err = guards.into_error(self.state, &event);
                    let message = err.to_string();
                    return Ok(self.fail(message));
                }
                self.invoke_renew(now, MachineState::Active).await
            }

            (MachineState::Active, MachineEvent::Invoice)
            | (MachineState::PastDue, MachineEvent::Invoice) => {
                let mut guards = GuardCheck::new();
                guards
                    .require("hasValidPaymentMethod", self.has_valid_payment_method())
                    .require("hasDueBillingPeriods", self.has_due_billing_periods);
                if !guards.ok() {
                    return Err(guards.into_error(self.state, &event));
                }
                self.invoke_invoice(now).await
            }

            (MachineState::Active, MachineEvent::Renew) => {
                if !self.can_renew(now) {
                    let mut guards = GuardCheck::new();
                    guards.require("canRenew", false);
                    return Err(guards.into_error(self.state, &event));
                }
                if !self.is_auto_renew_enabled() {
                    // Auto-renew off: the subscription runs out instead.
                    self.transition(MachineState::Expiring)?;
                    return self.invoke_expire(now).await;
                }
                self.invoke_renew(now, MachineState::Active).await
            }

            (MachineState::Active, MachineEvent::Cancel)
            | (MachineState::PastDue, MachineEvent::Cancel) => self.invoke_cancel(now).await,

            (MachineState::Active, MachineEvent::Change(change)) => {
                let change = change.clone();
                self.invoke_change(change, now).await
            }

            (MachineState::Active, MachineEvent::PaymentSuccess)
            | (MachineState::Active, MachineEvent::InvoiceSuccess)
            | (MachineState::PastDue, MachineEvent::PaymentSuccess)
            | (MachineState::PastDue, MachineEvent::InvoiceSuccess) => {
                if self.is_advance_billing() && self.can_renew(now) {
                    self.invoke_renew(now, MachineState::Active).await
                } else {
                    // Payment recovers a past-due subscription.
                    self.transition(MachineState::Active)?;
                    Ok(self.snapshot())
                }
            }

            (MachineState::Active, MachineEvent::PaymentFailure)
            | (MachineState::Active, MachineEvent::InvoiceFailure)
            | (MachineState::PastDue, MachineEvent::PaymentFailure)
            | (MachineState::PastDue, MachineEvent::InvoiceFailure) => {
                self.transition(MachineState::PastDue)?;
                Ok(self.snapshot())
            }

            (state, event) => Err(BillingError::GuardRejected {
                state: state.as_str().to_string(),
                event: event.name().to_string(),
                failed: vec!["eventAcceptedInState".to_string()],
            }),
        }
    }

    // ===== Invokes =====

    async fn invoke_generate_billing_periods(
        &mut self,
        now: DateTime<Utc>,
    ) -> BillingResult<MachineSnapshot> {
        let stable = self.state;
        self.state = MachineState::GeneratingBillingPeriods;
        let result = self
            .services
            .materializer
            .generate_billing_periods(&self.project_id, &self.subscription_id, now)
            .await;
        match result {
            Ok(outcome) => {
                // The invoke always repopulates the flag.
                self.has_due_billing_periods = outcome.has_due_billing_periods;
                self.transition(stable)?;
                Ok(self.snapshot())
            }
            Err(e) => Ok(self.fail(format!("generateBillingPeriods failed: {e}"))),
        }
    }

    async fn invoke_invoice(&mut self, now: DateTime<Utc>) -> BillingResult<MachineSnapshot> {
        let stable = self.state;
        self.state = MachineState::Invoicing;
        let result = self
            .services
            .assembler
            .invoice_subscription(&self.project_id, &self.subscription_id, now)
            .await;
        match result {
            Ok(_invoices) => {
                self.has_due_billing_periods = self.services.db.has_due_pending_periods(
                    &self.project_id,
                    &self.subscription_id,
                    now,
                )?;
                self.transition(stable)?;
                Ok(self.snapshot())
            }
            Err(e) => Ok(self.fail(format!("invoiceSubscription failed: {e}"))),
        }
    }

    /// `renewSubscription`: recompute the current and next cycle windows
    /// and advance the stored cycle triple; a no-op when nothing moved.
    async fn invoke_renew(
        &mut self,
        now: DateTime<Utc>,
        settle: MachineState,
    ) -> BillingResult<MachineSnapshot> {
        self.state = MachineState::Renewing;
        let result = self.renew_subscription(now).await;
        match result {
            Ok(()) => {
                self.transition(settle)?;
                Ok(self.snapshot())
            }
            Err(e) => Ok(self.fail(format!("renewSubscription failed: {e}"))),
        }
    }

    async fn renew_subscription(&mut self, now: DateTime<Utc>) -> BillingResult<()> {
        let phase = self.phase.as_ref().ok_or_else(|| {
            BillingError::InvariantViolation(format!(
                "subscription {} has no active phase to renew",
                self.subscription_id
            ))
        })?;
        let plan = self.plan.as_ref().ok_or_else(|| BillingError::NotFound {
            entity: "plan_version",
            id: phase.plan_version_id.clone(),
        })?;

        let schedule = PeriodMaterializer::phase_schedule(phase, plan);
        let current = schedule.cycle_window(now).ok_or_else(|| {
            BillingError::InvariantViolation(format!(
                "subscription {} has no cycle window at renewal time",
                self.subscription_id
            ))
        })?;
        let renew_at = current.end;

        let unchanged = self.subscription.current_cycle_start_at == current.start
            && self.subscription.current_cycle_end_at == current.end
            && self.subscription.renew_at == Some(renew_at);
        if unchanged {
            debug!(subscription_id = %self.subscription_id, "renewal is a no-op");
            return Ok(());
        }

        self.services.db.update_subscription_cycle(
            &self.project_id,
            &self.subscription_id,
            current.start,
            current.end,
            Some(renew_at),
            &plan.plan_slug,
        )?;
        self.services.db.update_phase_cycle(
            &self.project_id,
            &phase.id,
            current.start,
            current.end,
            Some(renew_at),
        )?;
        self.subscription.current_cycle_start_at = current.start;
        self.subscription.current_cycle_end_at = current.end;
        self.subscription.renew_at = Some(renew_at);
        self.subscription.plan_slug = plan.plan_slug.clone();
        if let Some(phase) = self.phase.as_mut() {
            phase.current_cycle_start_at = current.start;
            phase.current_cycle_end_at = current.end;
            phase.renew_at = Some(renew_at);
        }
        info!(
            subscription_id = %self.subscription_id,
            cycle_start = %current.start,
            cycle_end = %current.end,
            "subscription renewed"
        );
        Ok(())
    }

    async fn invoke_cancel(&mut self, now: DateTime<Utc>) -> BillingResult<MachineSnapshot> {
        self.state = MachineState::Canceling;
        let result: BillingResult<()> = (|| {
            if let Some(phase) = &self.phase {
                self.services.db.close_phase(&self.project_id, &phase.id, now)?;
            }
            self.services
                .db
                .set_subscription_end_at(&self.project_id, &self.subscription_id, now)?;
            Ok(())
        })();
        match result {
            Ok(()) => {
                self.transition(MachineState::Canceled)?;
                Ok(self.snapshot())
            }
            Err(e) => Ok(self.fail(format!("cancelSubscription failed: {e}"))),
        }
    }

    async fn invoke_expire(&mut self, now: DateTime<Utc>) -> BillingResult<MachineSnapshot> {
        let result: BillingResult<()> = (|| {
            if let Some(phase) = &self.phase {
                self.services.db.close_phase(&self.project_id, &phase.id, now)?;
            }
            self.services
                .db
                .set_subscription_end_at(&self.project_id, &self.subscription_id, now)?;
            Ok(())
        })();
        match result {
            Ok(()) => {
                self.transition(MachineState::Expired)?;
                Ok(self.snapshot())
            }
            Err(e) => Ok(self.fail(format!("expireSubscription failed: {e}"))),
        }
    }

    async fn invoke_change(
        &mut self,
        change: PhaseChange,
        now: DateTime<Utc>,
    ) -> BillingResult<MachineSnapshot> {
        self.state = MachineState::Changing;
        let result = self
            .services
            .materializer
            .change_phase(&self.project_id, &self.subscription_id, &change, now)
            .await;
        match result {
            Ok(new_phase) => {
                self.plan = self
                    .services
                    .db
                    .get_plan_version(&self.project_id, &new_phase.plan_version_id)?;
                self.phase = Some(new_phase);
                if let Some(sub) = self
                    .services
                    .db
                    .get_subscription(&self.project_id, &self.subscription_id)?
                {
                    self.subscription = sub;
                }
                self.has_due_billing_periods = self.services.db.has_due_pending_periods(
                    &self.project_id,
                    &self.subscription_id,
                    now,
                )?;
                self.transition(MachineState::Active)?;
                Ok(self.snapshot())
            }
            Err(e) => Ok(self.fail(format!("changePhase failed: {e}"))),
        }
    }
}
