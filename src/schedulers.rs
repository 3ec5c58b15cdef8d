/// Periodic Schedulers
///
/// Five interval loops advance subscriptions through their billing
/// lifecycle: `periods` materializes billing periods, `renew` rolls
/// cycles forward, `invoicing` assembles due periods into drafts,
/// `finalize` prices and issues due drafts, and `billing` collects
/// payment, finalizing any stray drafts first and billing only the ones
/// that finalized cleanly. Every per-subscription task runs under the
/// persisted subscription lock; a held lock means another worker owns the
/// subscription and the task skips it. Transient failures retry within
/// the tick; anything fatal is logged and left for the next pass.
///
/// Production cadence corresponds to cron `0 */12 * * *` (UTC),
/// development to `*/5 * * * *`.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::database::DatabaseManager;
use crate::error::{BillingError, BillingResult};
use crate::invoice_finalizer::InvoiceFinalizer;
use crate::payment_collector::{CollectionSignal, PaymentCollector};
use crate::subscription_lock::SubscriptionLockService;
use crate::subscription_machine::{
    MachineEvent, MachineServices, SubscriptionMachine, INVOICE_TIMEOUT, RENEW_TIMEOUT,
    SEND_TIMEOUT,
};
use crate::types::InvoiceStatus;

/// Concurrent per-subscription tasks within one tick.
const FANOUT_CONCURRENCY: usize = 8;

pub struct SchedulerSet {
    db: Arc<DatabaseManager>,
    locks: SubscriptionLockService,
    machine_services: MachineServices,
    finalizer: Arc<InvoiceFinalizer>,
    collector: Arc<PaymentCollector>,
    config: SchedulerConfig,
}

impl SchedulerSet {
    pub fn new(
        db: Arc<DatabaseManager>,
        locks: SubscriptionLockService,
        machine_services: MachineServices,
        finalizer: Arc<InvoiceFinalizer>,
        collector: Arc<PaymentCollector>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            db,
            locks,
            machine_services,
            finalizer,
            collector,
            config,
        }
    }

    /// Spawn the five loops. Handles run until aborted.
    pub fn start(self: &Arc<Self>, tick: Duration) -> Vec<JoinHandle<()>> {
        info!(interval_secs = tick.as_secs(), "starting billing schedulers");
        let mut handles = Vec::new();
        for name in ["periods", "renew", "invoicing", "finalize", "billing"] {
            let this = self.clone();
            handles.push(tokio::spawn(async move {
                let mut ticker = interval(tick);
                loop {
                    ticker.tick().await;
                    let now = Utc::now();
                    let result = match name {
                        "periods" => this.tick_periods(now).await,
                        "renew" => this.tick_renew(now).await,
                        "invoicing" => this.tick_invoicing(now).await,
                        "finalize" => this.tick_finalize(now).await,
                        _ => this.tick_billing(now).await,
                    };
                    match result {
                        Ok(processed) if processed > 0 => {
                            info!(scheduler = name, processed, "scheduler tick done")
                        }
                        Ok(_) => debug!(scheduler = name, "scheduler tick idle"),
                        Err(e) => warn!(scheduler = name, "scheduler tick failed: {}", e),
                    }
                }
            }));
        }
        handles
    }

    /// `periods`: visit phases that are open (or recently ended) on
    /// active subscriptions and materialize their billing periods.
    pub async fn tick_periods(&self, now: DateTime<Utc>) -> BillingResult<usize> {
        let phases = self.db.list_phases_due_for_periods(
            now,
            self.config.periods_lookback_days,
            self.config.periods_batch_cap,
        )?;
        let mut targets: Vec<(String, String)> = phases
            .into_iter()
            .map(|p| (p.project_id, p.subscription_id))
            .collect();
        targets.sort();
        targets.dedup();

        self.fan_out_event(targets, MachineEvent::BillingPeriod, SEND_TIMEOUT, now)
            .await
    }

    /// `renew`: roll due subscriptions into their next cycle.
    pub async fn tick_renew(&self, now: DateTime<Utc>) -> BillingResult<usize> {
        let due = self.db.list_renewal_due(now, self.config.renew_batch_cap)?;
        let targets: Vec<(String, String)> =
            due.into_iter().map(|s| (s.project_id, s.id)).collect();

        self.fan_out_event(targets, MachineEvent::Renew, RENEW_TIMEOUT, now)
            .await
    }

    /// `invoicing`: assemble due pending periods into draft invoices.
    pub async fn tick_invoicing(&self, now: DateTime<Utc>) -> BillingResult<usize> {
        let targets = self
            .db
            .list_subscriptions_with_due_periods(now, self.config.invoicing_batch_cap)?;

        self.fan_out_event(targets, MachineEvent::Invoice, INVOICE_TIMEOUT, now)
            .await
    }

    /// `finalize`: price and issue draft invoices that reached their due
    /// date. External effects are not retried within the tick.
    pub async fn tick_finalize(&self, now: DateTime<Utc>) -> BillingResult<usize> {
        let drafts = self
            .db
            .list_draft_invoices_due(now, self.config.billing_batch_cap)?;
        let mut by_subscription: BTreeMap<(String, String), Vec<String>> = BTreeMap::new();
        for invoice in drafts {
            by_subscription
                .entry((invoice.project_id.clone(), invoice.subscription_id.clone()))
                .or_default()
                .push(invoice.id);
        }

        let mut processed = 0;
        for ((project_id, subscription_id), invoice_ids) in by_subscription {
            let Some(guard) = self.locks.acquire(&project_id, &subscription_id, now)? else {
                debug!(subscription_id = %subscription_id, "skipped, lock held");
                continue;
            };
            for invoice_id in &invoice_ids {
                // Finalization suspends on the provider; keep the lease alive.
                guard.extend(now)?;
                match self
                    .finalizer
                    .finalize_invoice(&project_id, invoice_id, now)
                    .await
                {
                    Ok(_) => processed += 1,
                    Err(e) => warn!(invoice_id = %invoice_id, "finalize failed: {}", e),
                }
            }
            guard.release()?;
        }
        Ok(processed)
    }

    /// `billing`: collect due unpaid/waiting invoices. Drafts found in the
    /// window are finalized first; only invoices that finalized
    /// successfully are billed.
    pub async fn tick_billing(&self, now: DateTime<Utc>) -> BillingResult<usize> {
        let invoices = self
            .db
            .list_collectable_invoices(now, self.config.billing_batch_cap)?;
        let mut by_subscription: BTreeMap<(String, String), Vec<(String, InvoiceStatus)>> =
            BTreeMap::new();
        for invoice in invoices {
            by_subscription
                .entry((invoice.project_id.clone(), invoice.subscription_id.clone()))
                .or_default()
                .push((invoice.id, invoice.status));
        }

        let mut processed = 0;
        for ((project_id, subscription_id), invoice_list) in by_subscription {
            let Some(guard) = self.locks.acquire(&project_id, &subscription_id, now)? else {
                debug!(subscription_id = %subscription_id, "skipped, lock held");
                continue;
            };
            for (invoice_id, status) in invoice_list {
                if status == InvoiceStatus::Draft {
                    // Finalize-then-bill: a draft that fails to finalize
                    // is not collected this tick.
                    match self
                        .finalizer
                        .finalize_invoice(&project_id, &invoice_id, now)
                        .await
                    {
                        Ok(finalized) if finalized.status == InvoiceStatus::Unpaid => {}
                        Ok(_) => continue,
                        Err(e) => {
                            warn!(invoice_id = %invoice_id, "finalize before billing failed: {}", e);
                            continue;
                        }
                    }
                }
                // Provider I/O follows; keep the lease alive.
                guard.extend(now)?;
                match self
                    .collector
                    .collect_invoice(&project_id, &invoice_id, now)
                    .await
                {
                    Ok((_, signal)) => {
                        self.notify_machine(&project_id, &subscription_id, signal, now)
                            .await;
                        processed += 1;
                    }
                    Err(e) => warn!(invoice_id = %invoice_id, "collection failed: {}", e),
                }
            }
            guard.release()?;
        }
        Ok(processed)
    }

    /// Forward a collection outcome to the machine so the subscription
    /// status tracks payment reality.
    async fn notify_machine(
        &self,
        project_id: &str,
        subscription_id: &str,
        signal: CollectionSignal,
        now: DateTime<Utc>,
    ) {
        let event = match signal {
            CollectionSignal::Paid => MachineEvent::PaymentSuccess,
            CollectionSignal::PaymentFailed | CollectionSignal::Expired => {
                MachineEvent::PaymentFailure
            }
            _ => return,
        };
        match SubscriptionMachine::spawn(
            self.machine_services.clone(),
            project_id,
            subscription_id,
            now,
        )
        .await
        {
            Ok(machine) => {
                if let Err(e) = machine.send_and_wait(event, now, SEND_TIMEOUT).await {
                    if !matches!(e, BillingError::GuardRejected { .. }) {
                        warn!(subscription_id, "payment event rejected: {}", e);
                    }
                }
            }
            Err(e) => warn!(subscription_id, "machine spawn for payment event failed: {}", e),
        }
    }

    /// Send one machine event to every target, in parallel across
    /// subscriptions and serialized per subscription by the lock.
    async fn fan_out_event(
        &self,
        targets: Vec<(String, String)>,
        event: MachineEvent,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> BillingResult<usize> {
        let event = &event;
        let processed = stream::iter(targets)
            .map(|(project_id, subscription_id)| async move {
                match self
                    .run_subscription_event(&project_id, &subscription_id, event.clone(), timeout, now)
                    .await
                {
                    Ok(Some(n)) => n,
                    Ok(None) => {
                        debug!(subscription_id = %subscription_id, "skipped, lock held");
                        0
                    }
                    Err(e) => {
                        warn!(subscription_id = %subscription_id, "task failed: {}", e);
                        0
                    }
                }
            })
            .buffer_unordered(FANOUT_CONCURRENCY)
            .fold(0usize, |acc, n| async move { acc + n })
            .await;
        Ok(processed)
    }

    /// One per-subscription task: take the lock, drive the machine,
    /// retry transient failures within the tick's budget. `Ok(None)`
    /// means the lock was held. Guard rejections are routine (nothing
    /// due) and count as skips.
    async fn run_subscription_event(
        &self,
        project_id: &str,
        subscription_id: &str,
        event: MachineEvent,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> BillingResult<Option<usize>> {
        let Some(guard) = self.locks.acquire(project_id, subscription_id, now)? else {
            return Ok(None);
        };

        let mut attempts = 0;
        let result = loop {
            attempts += 1;
            let sent = async {
                let machine = SubscriptionMachine::spawn(
                    self.machine_services.clone(),
                    project_id,
                    subscription_id,
                    now,
                )
                .await?;
                machine.send_and_wait(event.clone(), now, timeout).await
            }
            .await;
            match sent {
                Ok(snapshot) => {
                    debug!(
                        subscription_id,
                        state = snapshot.state.as_str(),
                        "machine settled"
                    );
                    break Ok(Some(1));
                }
                Err(BillingError::GuardRejected { state, event, failed }) => {
                    debug!(
                        subscription_id,
                        state,
                        event,
                        failed = failed.join(","),
                        "event skipped by guards"
                    );
                    break Ok(Some(0));
                }
                Err(e) if e.is_transient() && attempts < self.config.transient_retries => {
                    debug!(
                        subscription_id,
                        attempt = attempts,
                        "transient failure, retrying: {}", e
                    );
                }
                Err(e) => break Err(e),
            }
        };
        guard.release()?;
        result
    }
}
