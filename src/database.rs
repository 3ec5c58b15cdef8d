/// Database Module
///
/// SQLite persistence for every billing entity. Each method opens its own
/// connection, which keeps the manager `Send + Sync` across tokio tasks;
/// SQLite serializes writers at the file level. Multi-step flows that must
/// be atomic (credit application, period flips) run inside an explicit
/// transaction on a single connection.
///
/// Timestamps are stored as epoch milliseconds, money as integer minor
/// units, document-shaped fields (pricing, meter state, grant snapshots)
/// as JSON text columns.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;

use crate::error::{BillingError, BillingResult};
use crate::types::*;

/// Database manager for billing state
#[derive(Debug, Clone)]
pub struct DatabaseManager {
    db_path: PathBuf,
}

fn json_col<T: DeserializeOwned>(idx: usize, raw: String) -> rusqlite::Result<T> {
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn json_val<T: Serialize>(value: &T) -> BillingResult<String> {
    Ok(serde_json::to_string(value)?)
}

fn enum_col<T>(idx: usize, parsed: Option<T>) -> rusqlite::Result<T> {
    parsed.ok_or_else(|| {
        rusqlite::Error::InvalidColumnType(idx, "enum".to_string(), rusqlite::types::Type::Text)
    })
}

fn opt_millis(row_val: Option<i64>) -> Option<DateTime<Utc>> {
    row_val.map(from_millis)
}

impl DatabaseManager {
    /// Create a new database manager and initialize the schema
    pub fn new(db_path: &PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database directory: {:?}", parent))?;
        }
        let manager = DatabaseManager {
            db_path: db_path.clone(),
        };
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {:?}", db_path))?;
        manager.initialize_schema(&conn)?;
        Ok(manager)
    }

    fn conn(&self) -> BillingResult<Connection> {
        let conn = Connection::open(&self.db_path)
            .map_err(|e| BillingError::Database(format!("open {:?}: {}", self.db_path, e)))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(conn)
    }

    /// Initialize the database schema
    fn initialize_schema(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS customers (
                id TEXT NOT NULL,
                project_id TEXT NOT NULL,
                email TEXT NOT NULL,
                default_currency TEXT NOT NULL,
                timezone TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                stripe_customer_id TEXT,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (project_id, id)
            );
            CREATE UNIQUE INDEX IF NOT EXISTS customers_email_unique
                ON customers(project_id, email);

            CREATE TABLE IF NOT EXISTS plan_versions (
                id TEXT NOT NULL,
                project_id TEXT NOT NULL,
                plan_slug TEXT NOT NULL,
                version INTEGER NOT NULL,
                currency TEXT NOT NULL,
                payment_provider TEXT NOT NULL,
                when_to_bill TEXT NOT NULL,
                collection_method TEXT NOT NULL,
                billing_config TEXT NOT NULL,
                grace_period TEXT NOT NULL,
                auto_renew INTEGER NOT NULL,
                requires_payment_method INTEGER NOT NULL,
                published INTEGER NOT NULL,
                PRIMARY KEY (project_id, id)
            );

            CREATE TABLE IF NOT EXISTS feature_plan_versions (
                id TEXT NOT NULL,
                project_id TEXT NOT NULL,
                plan_version_id TEXT NOT NULL,
                feature_slug TEXT NOT NULL,
                feature_type TEXT NOT NULL,
                aggregation_method TEXT NOT NULL,
                pricing TEXT NOT NULL,
                limit_units INTEGER,
                hard_limit INTEGER NOT NULL,
                reset_config TEXT NOT NULL,
                default_units INTEGER,
                PRIMARY KEY (project_id, id)
            );

            CREATE TABLE IF NOT EXISTS subscriptions (
                id TEXT NOT NULL,
                project_id TEXT NOT NULL,
                customer_id TEXT NOT NULL,
                status TEXT NOT NULL,
                active INTEGER NOT NULL,
                plan_slug TEXT NOT NULL,
                current_cycle_start_at INTEGER NOT NULL,
                current_cycle_end_at INTEGER NOT NULL,
                renew_at INTEGER,
                end_at INTEGER,
                timezone TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (project_id, id)
            );
            CREATE INDEX IF NOT EXISTS subscriptions_renew_idx
                ON subscriptions(active, renew_at);

            CREATE TABLE IF NOT EXISTS subscription_phases (
                id TEXT NOT NULL,
                project_id TEXT NOT NULL,
                subscription_id TEXT NOT NULL,
                plan_version_id TEXT NOT NULL,
                payment_method_id TEXT,
                trial_ends_at INTEGER,
                start_at INTEGER NOT NULL,
                end_at INTEGER,
                current_cycle_start_at INTEGER NOT NULL,
                current_cycle_end_at INTEGER NOT NULL,
                renew_at INTEGER,
                billing_anchor INTEGER NOT NULL,
                PRIMARY KEY (project_id, id)
            );
            CREATE INDEX IF NOT EXISTS subscription_phases_window_idx
                ON subscription_phases(subscription_id, start_at, end_at);

            CREATE TABLE IF NOT EXISTS subscription_items (
                id TEXT NOT NULL,
                project_id TEXT NOT NULL,
                subscription_phase_id TEXT NOT NULL,
                subscription_id TEXT NOT NULL,
                feature_plan_version_id TEXT NOT NULL,
                units INTEGER,
                PRIMARY KEY (project_id, id)
            );
            CREATE INDEX IF NOT EXISTS subscription_items_phase_idx
                ON subscription_items(subscription_phase_id);

            CREATE TABLE IF NOT EXISTS grants (
                id TEXT NOT NULL,
                project_id TEXT NOT NULL,
                subject_type TEXT NOT NULL,
                subject_id TEXT NOT NULL,
                feature_plan_version_id TEXT NOT NULL,
                feature_slug TEXT NOT NULL,
                feature_type TEXT NOT NULL,
                aggregation_method TEXT NOT NULL,
                reset_config TEXT NOT NULL,
                pricing TEXT NOT NULL,
                kind TEXT NOT NULL,
                priority INTEGER NOT NULL,
                effective_at INTEGER NOT NULL,
                expires_at INTEGER,
                limit_units INTEGER,
                hard_limit INTEGER NOT NULL,
                units INTEGER,
                deleted INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (project_id, id)
            );
            CREATE INDEX IF NOT EXISTS grants_subject_feature_idx
                ON grants(project_id, subject_id, feature_slug, deleted);

            CREATE TABLE IF NOT EXISTS entitlements (
                id TEXT NOT NULL,
                project_id TEXT NOT NULL,
                customer_id TEXT NOT NULL,
                feature_slug TEXT NOT NULL,
                feature_type TEXT NOT NULL,
                limit_units INTEGER,
                hard_limit INTEGER NOT NULL,
                reset_config TEXT NOT NULL,
                aggregation_method TEXT NOT NULL,
                timezone TEXT NOT NULL,
                current_cycle_start_at INTEGER NOT NULL,
                current_cycle_end_at INTEGER NOT NULL,
                current_cycle_usage REAL NOT NULL,
                accumulated_usage REAL NOT NULL,
                version TEXT NOT NULL,
                grants TEXT NOT NULL,
                meter TEXT NOT NULL,
                active INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (project_id, id)
            );
            CREATE UNIQUE INDEX IF NOT EXISTS entitlements_unique_subject_feature
                ON entitlements(project_id, customer_id, feature_slug);

            CREATE TABLE IF NOT EXISTS billing_periods (
                id TEXT NOT NULL,
                project_id TEXT NOT NULL,
                subscription_id TEXT NOT NULL,
                subscription_phase_id TEXT NOT NULL,
                subscription_item_id TEXT NOT NULL,
                grant_id TEXT,
                cycle_start_at INTEGER NOT NULL,
                cycle_end_at INTEGER NOT NULL,
                status TEXT NOT NULL,
                kind TEXT NOT NULL,
                invoice_id TEXT,
                when_to_bill TEXT NOT NULL,
                invoice_at INTEGER NOT NULL,
                statement_key TEXT NOT NULL,
                amount_estimate_cents INTEGER,
                PRIMARY KEY (project_id, id)
            );
            CREATE UNIQUE INDEX IF NOT EXISTS billing_periods_period_unique
                ON billing_periods(project_id, subscription_id, subscription_phase_id,
                                   subscription_item_id, cycle_start_at, cycle_end_at);
            CREATE INDEX IF NOT EXISTS billing_periods_due_idx
                ON billing_periods(status, invoice_at);

            CREATE TABLE IF NOT EXISTS invoices (
                id TEXT NOT NULL,
                project_id TEXT NOT NULL,
                subscription_id TEXT NOT NULL,
                subscription_phase_id TEXT NOT NULL,
                customer_id TEXT NOT NULL,
                status TEXT NOT NULL,
                statement_key TEXT NOT NULL,
                statement_start_at INTEGER NOT NULL,
                statement_end_at INTEGER NOT NULL,
                cycle_start_at INTEGER NOT NULL,
                cycle_end_at INTEGER NOT NULL,
                due_at INTEGER NOT NULL,
                past_due_at INTEGER NOT NULL,
                issue_date INTEGER,
                paid_at INTEGER,
                sent_at INTEGER,
                subtotal INTEGER NOT NULL,
                total INTEGER NOT NULL,
                amount_credit_used INTEGER NOT NULL,
                payment_method_id TEXT,
                payment_provider TEXT NOT NULL,
                currency TEXT NOT NULL,
                when_to_bill TEXT NOT NULL,
                collection_method TEXT NOT NULL,
                invoice_payment_provider_id TEXT,
                invoice_payment_provider_url TEXT,
                payment_attempts TEXT NOT NULL,
                metadata_reason TEXT,
                PRIMARY KEY (project_id, id)
            );
            CREATE UNIQUE INDEX IF NOT EXISTS invoices_statement_unique
                ON invoices(project_id, subscription_id, customer_id, statement_key);
            CREATE INDEX IF NOT EXISTS invoices_collect_idx
                ON invoices(status, due_at);

            CREATE TABLE IF NOT EXISTS invoice_items (
                id TEXT NOT NULL,
                project_id TEXT NOT NULL,
                invoice_id TEXT NOT NULL,
                billing_period_id TEXT,
                subscription_item_id TEXT,
                feature_plan_version_id TEXT,
                kind TEXT NOT NULL,
                quantity REAL NOT NULL,
                unit_amount_cents INTEGER,
                amount_subtotal INTEGER NOT NULL,
                amount_total INTEGER NOT NULL,
                cycle_start_at INTEGER NOT NULL,
                cycle_end_at INTEGER NOT NULL,
                proration_factor REAL,
                description TEXT NOT NULL,
                item_provider_id TEXT,
                is_overage INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (project_id, id)
            );
            CREATE UNIQUE INDEX IF NOT EXISTS invoice_items_cycle_unique
                ON invoice_items(project_id, invoice_id, billing_period_id)
                WHERE billing_period_id IS NOT NULL;

            CREATE TABLE IF NOT EXISTS credit_grants (
                id TEXT NOT NULL,
                project_id TEXT NOT NULL,
                customer_id TEXT NOT NULL,
                currency TEXT NOT NULL,
                payment_provider TEXT NOT NULL,
                total_amount INTEGER NOT NULL,
                amount_used INTEGER NOT NULL DEFAULT 0,
                expires_at INTEGER,
                active INTEGER NOT NULL DEFAULT 1,
                reason TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (project_id, id)
            );
            CREATE INDEX IF NOT EXISTS credit_grants_customer_idx
                ON credit_grants(project_id, customer_id, currency, active);

            CREATE TABLE IF NOT EXISTS invoice_credit_applications (
                id TEXT NOT NULL,
                project_id TEXT NOT NULL,
                invoice_id TEXT NOT NULL,
                credit_grant_id TEXT NOT NULL,
                amount_applied INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (project_id, id)
            );
            CREATE INDEX IF NOT EXISTS invoice_credit_applications_invoice_idx
                ON invoice_credit_applications(project_id, invoice_id);

            CREATE TABLE IF NOT EXISTS subscription_locks (
                project_id TEXT NOT NULL,
                subscription_id TEXT NOT NULL,
                owner_token TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                PRIMARY KEY (project_id, subscription_id)
            );",
        )?;
        Ok(())
    }

    // ===== Customers =====

    pub fn insert_customer(&self, customer: &Customer) -> BillingResult<()> {
        self.conn()?.execute(
            "INSERT INTO customers (id, project_id, email, default_currency, timezone, active,
                                    stripe_customer_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                customer.id,
                customer.project_id,
                customer.email,
                customer.default_currency,
                customer.timezone,
                customer.active,
                customer.stripe_customer_id,
                to_millis(customer.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_customer(&self, project_id: &str, id: &str) -> BillingResult<Option<Customer>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, project_id, email, default_currency, timezone, active,
                    stripe_customer_id, created_at
             FROM customers WHERE project_id = ?1 AND id = ?2",
        )?;
        let customer = stmt
            .query_row(params![project_id, id], row_to_customer)
            .optional()?;
        Ok(customer)
    }

    pub fn set_customer_active(&self, project_id: &str, id: &str, active: bool) -> BillingResult<()> {
        self.conn()?.execute(
            "UPDATE customers SET active = ?1 WHERE project_id = ?2 AND id = ?3",
            params![active, project_id, id],
        )?;
        Ok(())
    }

    // ===== Plan versions =====

    pub fn insert_plan_version(&self, plan: &PlanVersion) -> BillingResult<()> {
        self.conn()?.execute(
            "INSERT INTO plan_versions (id, project_id, plan_slug, version, currency,
                                        payment_provider, when_to_bill, collection_method,
                                        billing_config, grace_period, auto_renew,
                                        requires_payment_method, published)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                plan.id,
                plan.project_id,
                plan.plan_slug,
                plan.version,
                plan.currency,
                plan.payment_provider.as_str(),
                plan.when_to_bill.as_str(),
                plan.collection_method.as_str(),
                json_val(&plan.billing_config)?,
                json_val(&plan.grace_period)?,
                plan.auto_renew,
                plan.requires_payment_method,
                plan.published,
            ],
        )?;
        Ok(())
    }

    pub fn get_plan_version(&self, project_id: &str, id: &str) -> BillingResult<Option<PlanVersion>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, project_id, plan_slug, version, currency, payment_provider,
                    when_to_bill, collection_method, billing_config, grace_period,
                    auto_renew, requires_payment_method, published
             FROM plan_versions WHERE project_id = ?1 AND id = ?2",
        )?;
        let plan = stmt
            .query_row(params![project_id, id], row_to_plan_version)
            .optional()?;
        Ok(plan)
    }

    pub fn insert_feature_plan_version(&self, feature: &FeaturePlanVersion) -> BillingResult<()> {
        self.conn()?.execute(
            "INSERT INTO feature_plan_versions (id, project_id, plan_version_id, feature_slug,
                                                feature_type, aggregation_method, pricing,
                                                limit_units, hard_limit, reset_config, default_units)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                feature.id,
                feature.project_id,
                feature.plan_version_id,
                feature.feature_slug,
                feature.feature_type.as_str(),
                feature.aggregation_method.as_str(),
                json_val(&feature.pricing)?,
                feature.limit,
                feature.hard_limit,
                json_val(&feature.reset_config)?,
                feature.default_units,
            ],
        )?;
        Ok(())
    }

    pub fn get_feature_plan_version(
        &self,
        project_id: &str,
        id: &str,
    ) -> BillingResult<Option<FeaturePlanVersion>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, project_id, plan_version_id, feature_slug, feature_type,
                    aggregation_method, pricing, limit_units, hard_limit, reset_config,
                    default_units
             FROM feature_plan_versions WHERE project_id = ?1 AND id = ?2",
        )?;
        let feature = stmt
            .query_row(params![project_id, id], row_to_feature_plan_version)
            .optional()?;
        Ok(feature)
    }

    pub fn list_features_for_plan_version(
        &self,
        project_id: &str,
        plan_version_id: &str,
    ) -> BillingResult<Vec<FeaturePlanVersion>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, project_id, plan_version_id, feature_slug, feature_type,
                    aggregation_method, pricing, limit_units, hard_limit, reset_config,
                    default_units
             FROM feature_plan_versions
             WHERE project_id = ?1 AND plan_version_id = ?2 ORDER BY feature_slug",
        )?;
        let rows = stmt.query_map(
            params![project_id, plan_version_id],
            row_to_feature_plan_version,
        )?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    // ===== Subscriptions =====

    pub fn insert_subscription(&self, sub: &Subscription) -> BillingResult<()> {
        self.conn()?.execute(
            "INSERT INTO subscriptions (id, project_id, customer_id, status, active, plan_slug,
                                        current_cycle_start_at, current_cycle_end_at, renew_at,
                                        end_at, timezone, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                sub.id,
                sub.project_id,
                sub.customer_id,
                sub.status.as_str(),
                sub.active,
                sub.plan_slug,
                to_millis(sub.current_cycle_start_at),
                to_millis(sub.current_cycle_end_at),
                sub.renew_at.map(to_millis),
                sub.end_at.map(to_millis),
                sub.timezone,
                to_millis(sub.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_subscription(
        &self,
        project_id: &str,
        id: &str,
    ) -> BillingResult<Option<Subscription>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, project_id, customer_id, status, active, plan_slug,
                    current_cycle_start_at, current_cycle_end_at, renew_at, end_at,
                    timezone, created_at
             FROM subscriptions WHERE project_id = ?1 AND id = ?2",
        )?;
        let sub = stmt
            .query_row(params![project_id, id], row_to_subscription)
            .optional()?;
        Ok(sub)
    }

    /// Persist a machine status transition in a short transaction.
    pub fn update_subscription_status(
        &self,
        project_id: &str,
        id: &str,
        status: SubscriptionStatus,
    ) -> BillingResult<()> {
        self.conn()?.execute(
            "UPDATE subscriptions SET status = ?1, active = ?2
             WHERE project_id = ?3 AND id = ?4",
            params![status.as_str(), !status.is_terminal(), project_id, id],
        )?;
        Ok(())
    }

    pub fn update_subscription_cycle(
        &self,
        project_id: &str,
        id: &str,
        cycle_start: DateTime<Utc>,
        cycle_end: DateTime<Utc>,
        renew_at: Option<DateTime<Utc>>,
        plan_slug: &str,
    ) -> BillingResult<()> {
        self.conn()?.execute(
            "UPDATE subscriptions
             SET current_cycle_start_at = ?1, current_cycle_end_at = ?2, renew_at = ?3,
                 plan_slug = ?4
             WHERE project_id = ?5 AND id = ?6",
            params![
                to_millis(cycle_start),
                to_millis(cycle_end),
                renew_at.map(to_millis),
                plan_slug,
                project_id,
                id,
            ],
        )?;
        Ok(())
    }

    pub fn set_subscription_end_at(
        &self,
        project_id: &str,
        id: &str,
        end_at: DateTime<Utc>,
    ) -> BillingResult<()> {
        self.conn()?.execute(
            "UPDATE subscriptions SET end_at = ?1 WHERE project_id = ?2 AND id = ?3",
            params![to_millis(end_at), project_id, id],
        )?;
        Ok(())
    }

    pub fn has_active_subscription(
        &self,
        project_id: &str,
        customer_id: &str,
    ) -> BillingResult<bool> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM subscriptions
             WHERE project_id = ?1 AND customer_id = ?2 AND active = 1",
            params![project_id, customer_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Subscriptions due for renewal: `renew_at <= now`, still active.
    pub fn list_renewal_due(
        &self,
        now: DateTime<Utc>,
        cap: usize,
    ) -> BillingResult<Vec<Subscription>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, project_id, customer_id, status, active, plan_slug,
                    current_cycle_start_at, current_cycle_end_at, renew_at, end_at,
                    timezone, created_at
             FROM subscriptions
             WHERE active = 1 AND renew_at IS NOT NULL AND renew_at <= ?1
               AND status NOT IN ('canceled', 'expired')
             ORDER BY renew_at ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![to_millis(now), cap as i64], row_to_subscription)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    // ===== Subscription phases =====

    pub fn insert_phase(&self, phase: &SubscriptionPhase) -> BillingResult<()> {
        self.conn()?.execute(
            "INSERT INTO subscription_phases (id, project_id, subscription_id, plan_version_id,
                                              payment_method_id, trial_ends_at, start_at, end_at,
                                              current_cycle_start_at, current_cycle_end_at,
                                              renew_at, billing_anchor)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                phase.id,
                phase.project_id,
                phase.subscription_id,
                phase.plan_version_id,
                phase.payment_method_id,
                phase.trial_ends_at.map(to_millis),
                to_millis(phase.start_at),
                phase.end_at.map(to_millis),
                to_millis(phase.current_cycle_start_at),
                to_millis(phase.current_cycle_end_at),
                phase.renew_at.map(to_millis),
                phase.billing_anchor,
            ],
        )?;
        Ok(())
    }

    pub fn get_phase(
        &self,
        project_id: &str,
        id: &str,
    ) -> BillingResult<Option<SubscriptionPhase>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {PHASE_COLS} FROM subscription_phases WHERE project_id = ?1 AND id = ?2"
        ))?;
        let phase = stmt
            .query_row(params![project_id, id], row_to_phase)
            .optional()?;
        Ok(phase)
    }

    /// The phase active at `now` for a subscription, if any.
    pub fn get_active_phase(
        &self,
        project_id: &str,
        subscription_id: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<Option<SubscriptionPhase>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {PHASE_COLS} FROM subscription_phases
             WHERE project_id = ?1 AND subscription_id = ?2
               AND start_at <= ?3 AND (end_at IS NULL OR end_at > ?3)
             ORDER BY start_at DESC LIMIT 1"
        ))?;
        let phase = stmt
            .query_row(params![project_id, subscription_id, to_millis(now)], row_to_phase)
            .optional()?;
        Ok(phase)
    }

    pub fn list_phases_for_subscription(
        &self,
        project_id: &str,
        subscription_id: &str,
    ) -> BillingResult<Vec<SubscriptionPhase>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {PHASE_COLS} FROM subscription_phases
             WHERE project_id = ?1 AND subscription_id = ?2 ORDER BY start_at ASC"
        ))?;
        let rows = stmt.query_map(params![project_id, subscription_id], row_to_phase)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Close a phase at `end_at` (mid-cycle change or cancellation).
    pub fn close_phase(
        &self,
        project_id: &str,
        id: &str,
        end_at: DateTime<Utc>,
    ) -> BillingResult<()> {
        self.conn()?.execute(
            "UPDATE subscription_phases SET end_at = ?1 WHERE project_id = ?2 AND id = ?3",
            params![to_millis(end_at), project_id, id],
        )?;
        Ok(())
    }

    pub fn update_phase_cycle(
        &self,
        project_id: &str,
        id: &str,
        cycle_start: DateTime<Utc>,
        cycle_end: DateTime<Utc>,
        renew_at: Option<DateTime<Utc>>,
    ) -> BillingResult<()> {
        self.conn()?.execute(
            "UPDATE subscription_phases
             SET current_cycle_start_at = ?1, current_cycle_end_at = ?2, renew_at = ?3
             WHERE project_id = ?4 AND id = ?5",
            params![
                to_millis(cycle_start),
                to_millis(cycle_end),
                renew_at.map(to_millis),
                project_id,
                id,
            ],
        )?;
        Ok(())
    }

    /// Phases the periods scheduler should visit: started, and either open
    /// or recently ended, on active subscriptions.
    pub fn list_phases_due_for_periods(
        &self,
        now: DateTime<Utc>,
        lookback_days: i64,
        cap: usize,
    ) -> BillingResult<Vec<SubscriptionPhase>> {
        let horizon = now - chrono::Duration::days(lookback_days);
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {PHASE_COLS_P} FROM subscription_phases p
             JOIN subscriptions s ON s.project_id = p.project_id AND s.id = p.subscription_id
             WHERE p.start_at <= ?1 AND (p.end_at IS NULL OR p.end_at >= ?2)
               AND s.active = 1
             ORDER BY p.start_at ASC LIMIT ?3"
        ))?;
        let rows = stmt.query_map(
            params![to_millis(now), to_millis(horizon), cap as i64],
            row_to_phase,
        )?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    // ===== Subscription items =====

    pub fn insert_item(&self, item: &SubscriptionItem) -> BillingResult<()> {
        self.conn()?.execute(
            "INSERT INTO subscription_items (id, project_id, subscription_phase_id,
                                             subscription_id, feature_plan_version_id, units)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                item.id,
                item.project_id,
                item.subscription_phase_id,
                item.subscription_id,
                item.feature_plan_version_id,
                item.units,
            ],
        )?;
        Ok(())
    }

    pub fn get_item(
        &self,
        project_id: &str,
        id: &str,
    ) -> BillingResult<Option<SubscriptionItem>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, project_id, subscription_phase_id, subscription_id,
                    feature_plan_version_id, units
             FROM subscription_items WHERE project_id = ?1 AND id = ?2",
        )?;
        let item = stmt
            .query_row(params![project_id, id], row_to_item)
            .optional()?;
        Ok(item)
    }

    pub fn list_items_for_phase(
        &self,
        project_id: &str,
        phase_id: &str,
    ) -> BillingResult<Vec<SubscriptionItem>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, project_id, subscription_phase_id, subscription_id,
                    feature_plan_version_id, units
             FROM subscription_items
             WHERE project_id = ?1 AND subscription_phase_id = ?2 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![project_id, phase_id], row_to_item)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    // ===== Grants =====

    pub fn insert_grant(&self, grant: &Grant) -> BillingResult<()> {
        self.conn()?.execute(
            "INSERT INTO grants (id, project_id, subject_type, subject_id,
                                 feature_plan_version_id, feature_slug, feature_type,
                                 aggregation_method, reset_config, pricing, kind, priority,
                                 effective_at, expires_at, limit_units, hard_limit, units,
                                 deleted, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                     ?17, ?18, ?19)",
            params![
                grant.id,
                grant.project_id,
                match grant.subject_type {
                    GrantSubject::Customer => "customer",
                    GrantSubject::Project => "project",
                },
                grant.subject_id,
                grant.feature_plan_version_id,
                grant.feature_slug,
                grant.feature_type.as_str(),
                grant.aggregation_method.as_str(),
                json_val(&grant.reset_config)?,
                json_val(&grant.pricing)?,
                grant.kind.as_str(),
                grant.priority,
                to_millis(grant.effective_at),
                grant.expires_at.map(to_millis),
                grant.limit,
                grant.hard_limit,
                grant.units,
                grant.deleted,
                to_millis(grant.created_at),
            ],
        )?;
        Ok(())
    }

    /// Grants are append-only; superseding marks `deleted` instead of
    /// removing the row.
    pub fn soft_delete_grant(&self, project_id: &str, id: &str) -> BillingResult<()> {
        self.conn()?.execute(
            "UPDATE grants SET deleted = 1 WHERE project_id = ?1 AND id = ?2",
            params![project_id, id],
        )?;
        Ok(())
    }

    pub fn list_grants_for_customer_feature(
        &self,
        project_id: &str,
        customer_id: &str,
        feature_slug: &str,
    ) -> BillingResult<Vec<Grant>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, project_id, subject_type, subject_id, feature_plan_version_id,
                    feature_slug, feature_type, aggregation_method, reset_config, pricing,
                    kind, priority, effective_at, expires_at, limit_units, hard_limit,
                    units, deleted, created_at
             FROM grants
             WHERE project_id = ?1 AND subject_id = ?2 AND feature_slug = ?3
             ORDER BY priority DESC, id",
        )?;
        let rows = stmt.query_map(params![project_id, customer_id, feature_slug], row_to_grant)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn list_feature_slugs_for_customer(
        &self,
        project_id: &str,
        customer_id: &str,
    ) -> BillingResult<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT feature_slug FROM grants
             WHERE project_id = ?1 AND subject_id = ?2 AND deleted = 0 ORDER BY feature_slug",
        )?;
        let rows = stmt.query_map(params![project_id, customer_id], |row| row.get(0))?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    // ===== Entitlements =====

    /// Insert-or-replace keyed by the `(project, customer, feature)`
    /// uniqueness; grant changes recompute the whole row.
    pub fn save_entitlement(&self, ent: &Entitlement) -> BillingResult<()> {
        self.conn()?.execute(
            "INSERT INTO entitlements (id, project_id, customer_id, feature_slug, feature_type,
                                       limit_units, hard_limit, reset_config, aggregation_method,
                                       timezone, current_cycle_start_at, current_cycle_end_at,
                                       current_cycle_usage, accumulated_usage, version, grants,
                                       meter, active, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                     ?17, ?18, ?19)
             ON CONFLICT(project_id, customer_id, feature_slug) DO UPDATE SET
                feature_type = excluded.feature_type,
                limit_units = excluded.limit_units,
                hard_limit = excluded.hard_limit,
                reset_config = excluded.reset_config,
                aggregation_method = excluded.aggregation_method,
                timezone = excluded.timezone,
                current_cycle_start_at = excluded.current_cycle_start_at,
                current_cycle_end_at = excluded.current_cycle_end_at,
                current_cycle_usage = excluded.current_cycle_usage,
                accumulated_usage = excluded.accumulated_usage,
                version = excluded.version,
                grants = excluded.grants,
                meter = excluded.meter,
                active = excluded.active,
                updated_at = excluded.updated_at",
            params![
                ent.id,
                ent.project_id,
                ent.customer_id,
                ent.feature_slug,
                ent.feature_type.as_str(),
                ent.limit,
                ent.hard_limit,
                json_val(&ent.reset_config)?,
                ent.aggregation_method.as_str(),
                ent.timezone,
                to_millis(ent.current_cycle_start_at),
                to_millis(ent.current_cycle_end_at),
                ent.current_cycle_usage,
                ent.accumulated_usage,
                ent.version,
                json_val(&ent.grants)?,
                json_val(&ent.meter)?,
                ent.active,
                to_millis(ent.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_entitlement(
        &self,
        project_id: &str,
        customer_id: &str,
        feature_slug: &str,
    ) -> BillingResult<Option<Entitlement>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTITLEMENT_COLS} FROM entitlements
             WHERE project_id = ?1 AND customer_id = ?2 AND feature_slug = ?3"
        ))?;
        let ent = stmt
            .query_row(params![project_id, customer_id, feature_slug], row_to_entitlement)
            .optional()?;
        Ok(ent)
    }

    pub fn list_entitlements_for_customer(
        &self,
        project_id: &str,
        customer_id: &str,
    ) -> BillingResult<Vec<Entitlement>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTITLEMENT_COLS} FROM entitlements
             WHERE project_id = ?1 AND customer_id = ?2 ORDER BY feature_slug"
        ))?;
        let rows = stmt.query_map(params![project_id, customer_id], row_to_entitlement)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    // ===== Billing periods =====

    /// Idempotent insert; a uniqueness conflict on the period window is
    /// swallowed. Returns whether a row was actually inserted.
    pub fn insert_billing_period(&self, period: &BillingPeriod) -> BillingResult<bool> {
        let changed = self.conn()?.execute(
            "INSERT OR IGNORE INTO billing_periods
                (id, project_id, subscription_id, subscription_phase_id, subscription_item_id,
                 grant_id, cycle_start_at, cycle_end_at, status, kind, invoice_id, when_to_bill,
                 invoice_at, statement_key, amount_estimate_cents)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                period.id,
                period.project_id,
                period.subscription_id,
                period.subscription_phase_id,
                period.subscription_item_id,
                period.grant_id,
                to_millis(period.cycle_start_at),
                to_millis(period.cycle_end_at),
                period.status.as_str(),
                period.kind.as_str(),
                period.invoice_id,
                period.when_to_bill.as_str(),
                to_millis(period.invoice_at),
                period.statement_key,
                period.amount_estimate_cents,
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn list_due_pending_periods(
        &self,
        project_id: &str,
        subscription_id: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<Vec<BillingPeriod>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {PERIOD_COLS} FROM billing_periods
             WHERE project_id = ?1 AND subscription_id = ?2 AND status = 'pending'
               AND invoice_at <= ?3
             ORDER BY invoice_at ASC, cycle_start_at ASC"
        ))?;
        let rows = stmt.query_map(
            params![project_id, subscription_id, to_millis(now)],
            row_to_period,
        )?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn has_due_pending_periods(
        &self,
        project_id: &str,
        subscription_id: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<bool> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM billing_periods
             WHERE project_id = ?1 AND subscription_id = ?2 AND status = 'pending'
               AND invoice_at <= ?3",
            params![project_id, subscription_id, to_millis(now)],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Distinct `(project, subscription)` pairs with due pending periods,
    /// for the invoicing scheduler fan-out.
    pub fn list_subscriptions_with_due_periods(
        &self,
        now: DateTime<Utc>,
        cap: usize,
    ) -> BillingResult<Vec<(String, String)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT project_id, subscription_id FROM billing_periods
             WHERE status = 'pending' AND invoice_at <= ?1
             ORDER BY project_id, subscription_id LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![to_millis(now), cap as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Attach periods to an invoice and flip them to `invoiced`, in one
    /// transaction.
    pub fn mark_periods_invoiced(
        &self,
        project_id: &str,
        period_ids: &[String],
        invoice_id: &str,
    ) -> BillingResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for id in period_ids {
            tx.execute(
                "UPDATE billing_periods SET status = 'invoiced', invoice_id = ?1
                 WHERE project_id = ?2 AND id = ?3 AND status = 'pending'",
                params![invoice_id, project_id, id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_billing_period(
        &self,
        project_id: &str,
        id: &str,
    ) -> BillingResult<Option<BillingPeriod>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {PERIOD_COLS} FROM billing_periods WHERE project_id = ?1 AND id = ?2"
        ))?;
        let period = stmt
            .query_row(params![project_id, id], row_to_period)
            .optional()?;
        Ok(period)
    }

    // ===== Invoices =====

    /// Idempotent insert on the statement uniqueness; returns the invoice
    /// row that exists after the call (the new one, or the winner of a
    /// concurrent insert).
    pub fn insert_invoice_idempotent(&self, invoice: &Invoice) -> BillingResult<Invoice> {
        self.conn()?.execute(
            "INSERT OR IGNORE INTO invoices
                (id, project_id, subscription_id, subscription_phase_id, customer_id, status,
                 statement_key, statement_start_at, statement_end_at, cycle_start_at,
                 cycle_end_at, due_at, past_due_at, issue_date, paid_at, sent_at, subtotal,
                 total, amount_credit_used, payment_method_id, payment_provider, currency,
                 when_to_bill, collection_method, invoice_payment_provider_id,
                 invoice_payment_provider_url, payment_attempts, metadata_reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                     ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28)",
            params![
                invoice.id,
                invoice.project_id,
                invoice.subscription_id,
                invoice.subscription_phase_id,
                invoice.customer_id,
                invoice.status.as_str(),
                invoice.statement_key,
                to_millis(invoice.statement_start_at),
                to_millis(invoice.statement_end_at),
                to_millis(invoice.cycle_start_at),
                to_millis(invoice.cycle_end_at),
                to_millis(invoice.due_at),
                to_millis(invoice.past_due_at),
                invoice.issue_date.map(to_millis),
                invoice.paid_at.map(to_millis),
                invoice.sent_at.map(to_millis),
                invoice.subtotal,
                invoice.total,
                invoice.amount_credit_used,
                invoice.payment_method_id,
                invoice.payment_provider.as_str(),
                invoice.currency,
                invoice.when_to_bill.as_str(),
                invoice.collection_method.as_str(),
                invoice.invoice_payment_provider_id,
                invoice.invoice_payment_provider_url,
                json_val(&invoice.payment_attempts)?,
                invoice.metadata_reason,
            ],
        )?;
        self.get_invoice_by_statement_key(
            &invoice.project_id,
            &invoice.subscription_id,
            &invoice.customer_id,
            &invoice.statement_key,
        )?
        .ok_or_else(|| BillingError::Database("invoice vanished after idempotent insert".into()))
    }

    pub fn get_invoice(&self, project_id: &str, id: &str) -> BillingResult<Option<Invoice>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {INVOICE_COLS} FROM invoices WHERE project_id = ?1 AND id = ?2"
        ))?;
        let invoice = stmt
            .query_row(params![project_id, id], row_to_invoice)
            .optional()?;
        Ok(invoice)
    }

    pub fn get_invoice_by_statement_key(
        &self,
        project_id: &str,
        subscription_id: &str,
        customer_id: &str,
        statement_key: &str,
    ) -> BillingResult<Option<Invoice>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {INVOICE_COLS} FROM invoices
             WHERE project_id = ?1 AND subscription_id = ?2 AND customer_id = ?3
               AND statement_key = ?4"
        ))?;
        let invoice = stmt
            .query_row(
                params![project_id, subscription_id, customer_id, statement_key],
                row_to_invoice,
            )
            .optional()?;
        Ok(invoice)
    }

    /// Full-row update after finalization or collection.
    pub fn save_invoice(&self, invoice: &Invoice) -> BillingResult<()> {
        self.conn()?.execute(
            "UPDATE invoices SET
                status = ?1, statement_start_at = ?2, statement_end_at = ?3, due_at = ?4,
                past_due_at = ?5, issue_date = ?6, paid_at = ?7, sent_at = ?8, subtotal = ?9,
                total = ?10, amount_credit_used = ?11, payment_method_id = ?12,
                invoice_payment_provider_id = ?13, invoice_payment_provider_url = ?14,
                payment_attempts = ?15, metadata_reason = ?16
             WHERE project_id = ?17 AND id = ?18",
            params![
                invoice.status.as_str(),
                to_millis(invoice.statement_start_at),
                to_millis(invoice.statement_end_at),
                to_millis(invoice.due_at),
                to_millis(invoice.past_due_at),
                invoice.issue_date.map(to_millis),
                invoice.paid_at.map(to_millis),
                invoice.sent_at.map(to_millis),
                invoice.subtotal,
                invoice.total,
                invoice.amount_credit_used,
                invoice.payment_method_id,
                invoice.invoice_payment_provider_id,
                invoice.invoice_payment_provider_url,
                json_val(&invoice.payment_attempts)?,
                invoice.metadata_reason,
                invoice.project_id,
                invoice.id,
            ],
        )?;
        Ok(())
    }

    pub fn list_invoices_for_subscription(
        &self,
        project_id: &str,
        subscription_id: &str,
    ) -> BillingResult<Vec<Invoice>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {INVOICE_COLS} FROM invoices
             WHERE project_id = ?1 AND subscription_id = ?2 ORDER BY due_at ASC"
        ))?;
        let rows = stmt.query_map(params![project_id, subscription_id], row_to_invoice)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Draft invoices whose due date has arrived (finalize scheduler).
    pub fn list_draft_invoices_due(
        &self,
        now: DateTime<Utc>,
        cap: usize,
    ) -> BillingResult<Vec<Invoice>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {INVOICE_COLS} FROM invoices
             WHERE status = 'draft' AND due_at <= ?1
             ORDER BY due_at ASC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![to_millis(now), cap as i64], row_to_invoice)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Invoices the billing scheduler should look at: unpaid or waiting
    /// past their due date, plus drafts in the window (finalize-then-bill).
    pub fn list_collectable_invoices(
        &self,
        now: DateTime<Utc>,
        cap: usize,
    ) -> BillingResult<Vec<Invoice>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {INVOICE_COLS} FROM invoices
             WHERE status IN ('unpaid', 'waiting', 'draft') AND due_at <= ?1
             ORDER BY due_at ASC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![to_millis(now), cap as i64], row_to_invoice)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    // ===== Invoice items =====

    /// Idempotent on `(project, invoice, billing_period)` when the period
    /// id is set. Returns whether a row was inserted.
    pub fn insert_invoice_item(&self, item: &InvoiceItem) -> BillingResult<bool> {
        let changed = self.conn()?.execute(
            "INSERT OR IGNORE INTO invoice_items
                (id, project_id, invoice_id, billing_period_id, subscription_item_id,
                 feature_plan_version_id, kind, quantity, unit_amount_cents, amount_subtotal,
                 amount_total, cycle_start_at, cycle_end_at, proration_factor, description,
                 item_provider_id, is_overage)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                item.id,
                item.project_id,
                item.invoice_id,
                item.billing_period_id,
                item.subscription_item_id,
                item.feature_plan_version_id,
                item.kind.as_str(),
                item.quantity,
                item.unit_amount_cents,
                item.amount_subtotal,
                item.amount_total,
                to_millis(item.cycle_start_at),
                to_millis(item.cycle_end_at),
                item.proration_factor,
                item.description,
                item.item_provider_id,
                item.is_overage,
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn list_items_for_invoice(
        &self,
        project_id: &str,
        invoice_id: &str,
    ) -> BillingResult<Vec<InvoiceItem>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ITEM_COLS} FROM invoice_items
             WHERE project_id = ?1 AND invoice_id = ?2 ORDER BY cycle_start_at ASC, id"
        ))?;
        let rows = stmt.query_map(params![project_id, invoice_id], row_to_invoice_item)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Persist recomputed item amounts in a single statement, CASE per id.
    pub fn update_invoice_item_amounts(
        &self,
        project_id: &str,
        updates: &[(String, f64, Option<Cents>, Cents, Cents, bool)],
    ) -> BillingResult<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut quantity_case = String::from("CASE id ");
        let mut unit_case = String::from("CASE id ");
        let mut subtotal_case = String::from("CASE id ");
        let mut total_case = String::from("CASE id ");
        let mut overage_case = String::from("CASE id ");
        let mut ids = Vec::with_capacity(updates.len());
        for (id, quantity, unit, subtotal, total, is_overage) in updates {
            let quoted = format!("'{}'", id.replace('\'', "''"));
            quantity_case.push_str(&format!("WHEN {} THEN {} ", quoted, quantity));
            match unit {
                Some(u) => unit_case.push_str(&format!("WHEN {} THEN {} ", quoted, u)),
                None => unit_case.push_str(&format!("WHEN {} THEN NULL ", quoted)),
            }
            subtotal_case.push_str(&format!("WHEN {} THEN {} ", quoted, subtotal));
            total_case.push_str(&format!("WHEN {} THEN {} ", quoted, total));
            overage_case.push_str(&format!(
                "WHEN {} THEN {} ",
                quoted,
                if *is_overage { 1 } else { 0 }
            ));
            ids.push(quoted);
        }
        for case in [
            &mut quantity_case,
            &mut unit_case,
            &mut subtotal_case,
            &mut total_case,
            &mut overage_case,
        ] {
            case.push_str("END");
        }
        let sql = format!(
            "UPDATE invoice_items SET quantity = {}, unit_amount_cents = {},
                 amount_subtotal = {}, amount_total = {}, is_overage = {}
             WHERE project_id = ?1 AND id IN ({})",
            quantity_case,
            unit_case,
            subtotal_case,
            total_case,
            overage_case,
            ids.join(", ")
        );
        self.conn()?.execute(&sql, params![project_id])?;
        Ok(())
    }

    pub fn set_invoice_item_provider_id(
        &self,
        project_id: &str,
        item_id: &str,
        provider_id: &str,
    ) -> BillingResult<()> {
        self.conn()?.execute(
            "UPDATE invoice_items SET item_provider_id = ?1 WHERE project_id = ?2 AND id = ?3",
            params![provider_id, project_id, item_id],
        )?;
        Ok(())
    }

    // ===== Credit grants =====

    pub fn insert_credit_grant(&self, grant: &CreditGrant) -> BillingResult<()> {
        self.conn()?.execute(
            "INSERT INTO credit_grants (id, project_id, customer_id, currency, payment_provider,
                                        total_amount, amount_used, expires_at, active, reason,
                                        created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                grant.id,
                grant.project_id,
                grant.customer_id,
                grant.currency,
                grant.payment_provider.as_str(),
                grant.total_amount,
                grant.amount_used,
                grant.expires_at.map(to_millis),
                grant.active,
                grant.reason,
                to_millis(grant.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_credit_grant(
        &self,
        project_id: &str,
        id: &str,
    ) -> BillingResult<Option<CreditGrant>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, project_id, customer_id, currency, payment_provider, total_amount,
                    amount_used, expires_at, active, reason, created_at
             FROM credit_grants WHERE project_id = ?1 AND id = ?2",
        )?;
        let grant = stmt
            .query_row(params![project_id, id], row_to_credit_grant)
            .optional()?;
        Ok(grant)
    }

    pub fn list_credit_grants_for_customer(
        &self,
        project_id: &str,
        customer_id: &str,
    ) -> BillingResult<Vec<CreditGrant>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, project_id, customer_id, currency, payment_provider, total_amount,
                    amount_used, expires_at, active, reason, created_at
             FROM credit_grants WHERE project_id = ?1 AND customer_id = ?2
             ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![project_id, customer_id], row_to_credit_grant)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Apply active credit grants to an invoice, FIFO by earliest expiry,
    /// up to `target` cents. The whole waterfall runs in one transaction;
    /// fully consumed grants are deactivated. Returns the amount applied
    /// and the application rows written.
    pub fn apply_credits(
        &self,
        project_id: &str,
        invoice_id: &str,
        customer_id: &str,
        currency: &str,
        payment_provider: PaymentProviderKind,
        target: Cents,
        now: DateTime<Utc>,
    ) -> BillingResult<(Cents, Vec<InvoiceCreditApplication>)> {
        if target <= 0 {
            return Ok((0, Vec::new()));
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let grants: Vec<CreditGrant> = {
            let mut stmt = tx.prepare(
                "SELECT id, project_id, customer_id, currency, payment_provider, total_amount,
                        amount_used, expires_at, active, reason, created_at
                 FROM credit_grants
                 WHERE project_id = ?1 AND customer_id = ?2 AND currency = ?3
                   AND payment_provider = ?4 AND active = 1 AND amount_used < total_amount
                   AND (expires_at IS NULL OR expires_at > ?5)
                 ORDER BY CASE WHEN expires_at IS NULL THEN 1 ELSE 0 END, expires_at ASC,
                          created_at ASC",
            )?;
            let rows = stmt.query_map(
                params![
                    project_id,
                    customer_id,
                    currency,
                    payment_provider.as_str(),
                    to_millis(now)
                ],
                row_to_credit_grant,
            )?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        let mut remaining = target;
        let mut applications = Vec::new();
        for grant in grants {
            if remaining <= 0 {
                break;
            }
            let take = grant.remaining().min(remaining);
            if take <= 0 {
                continue;
            }
            let new_used = grant.amount_used + take;
            let still_active = new_used < grant.total_amount;
            tx.execute(
                "UPDATE credit_grants SET amount_used = ?1, active = ?2
                 WHERE project_id = ?3 AND id = ?4",
                params![new_used, still_active, project_id, grant.id],
            )?;
            let application = InvoiceCreditApplication {
                id: new_id(),
                project_id: project_id.to_string(),
                invoice_id: invoice_id.to_string(),
                credit_grant_id: grant.id.clone(),
                amount_applied: take,
                created_at: now,
            };
            tx.execute(
                "INSERT INTO invoice_credit_applications
                    (id, project_id, invoice_id, credit_grant_id, amount_applied, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    application.id,
                    application.project_id,
                    application.invoice_id,
                    application.credit_grant_id,
                    application.amount_applied,
                    to_millis(application.created_at),
                ],
            )?;
            remaining -= take;
            applications.push(application);
        }
        tx.commit()?;
        Ok((target - remaining, applications))
    }

    pub fn list_credit_applications_for_invoice(
        &self,
        project_id: &str,
        invoice_id: &str,
    ) -> BillingResult<Vec<InvoiceCreditApplication>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, project_id, invoice_id, credit_grant_id, amount_applied, created_at
             FROM invoice_credit_applications
             WHERE project_id = ?1 AND invoice_id = ?2 ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![project_id, invoice_id], |row| {
            Ok(InvoiceCreditApplication {
                id: row.get(0)?,
                project_id: row.get(1)?,
                invoice_id: row.get(2)?,
                credit_grant_id: row.get(3)?,
                amount_applied: row.get(4)?,
                created_at: from_millis(row.get(5)?),
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    // ===== Subscription locks =====

    /// Try to take the lease. Succeeds when no row exists or the existing
    /// lease has expired; an unexpired lease held by anyone wins.
    pub fn lock_try_acquire(
        &self,
        project_id: &str,
        subscription_id: &str,
        owner_token: &str,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> BillingResult<bool> {
        let expires_at = to_millis(now + ttl);
        let changed = self.conn()?.execute(
            "INSERT INTO subscription_locks (project_id, subscription_id, owner_token, expires_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(project_id, subscription_id) DO UPDATE SET
                owner_token = excluded.owner_token,
                expires_at = excluded.expires_at
             WHERE subscription_locks.expires_at <= ?5",
            params![project_id, subscription_id, owner_token, expires_at, to_millis(now)],
        )?;
        Ok(changed > 0)
    }

    /// Extend the lease, only for the live owner.
    pub fn lock_extend(
        &self,
        project_id: &str,
        subscription_id: &str,
        owner_token: &str,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> BillingResult<bool> {
        let changed = self.conn()?.execute(
            "UPDATE subscription_locks SET expires_at = ?1
             WHERE project_id = ?2 AND subscription_id = ?3 AND owner_token = ?4
               AND expires_at > ?5",
            params![
                to_millis(now + ttl),
                project_id,
                subscription_id,
                owner_token,
                to_millis(now)
            ],
        )?;
        Ok(changed > 0)
    }

    /// Drop the lease row.
    pub fn lock_release(&self, project_id: &str, subscription_id: &str) -> BillingResult<()> {
        self.conn()?.execute(
            "DELETE FROM subscription_locks WHERE project_id = ?1 AND subscription_id = ?2",
            params![project_id, subscription_id],
        )?;
        Ok(())
    }

    pub fn get_lock(
        &self,
        project_id: &str,
        subscription_id: &str,
    ) -> BillingResult<Option<(String, DateTime<Utc>)>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT owner_token, expires_at FROM subscription_locks
                 WHERE project_id = ?1 AND subscription_id = ?2",
                params![project_id, subscription_id],
                |row| Ok((row.get::<_, String>(0)?, from_millis(row.get(1)?))),
            )
            .optional()?;
        Ok(row)
    }
}

// ===== Row mapping =====

const PHASE_COLS: &str = "id, project_id, subscription_id, plan_version_id, payment_method_id,
    trial_ends_at, start_at, end_at, current_cycle_start_at, current_cycle_end_at, renew_at,
    billing_anchor";

const PHASE_COLS_P: &str = "p.id, p.project_id, p.subscription_id, p.plan_version_id,
    p.payment_method_id, p.trial_ends_at, p.start_at, p.end_at, p.current_cycle_start_at,
    p.current_cycle_end_at, p.renew_at, p.billing_anchor";

const ENTITLEMENT_COLS: &str = "id, project_id, customer_id, feature_slug, feature_type,
    limit_units, hard_limit, reset_config, aggregation_method, timezone,
    current_cycle_start_at, current_cycle_end_at, current_cycle_usage, accumulated_usage,
    version, grants, meter, active, updated_at";

const PERIOD_COLS: &str = "id, project_id, subscription_id, subscription_phase_id,
    subscription_item_id, grant_id, cycle_start_at, cycle_end_at, status, kind, invoice_id,
    when_to_bill, invoice_at, statement_key, amount_estimate_cents";

const INVOICE_COLS: &str = "id, project_id, subscription_id, subscription_phase_id, customer_id,
    status, statement_key, statement_start_at, statement_end_at, cycle_start_at, cycle_end_at,
    due_at, past_due_at, issue_date, paid_at, sent_at, subtotal, total, amount_credit_used,
    payment_method_id, payment_provider, currency, when_to_bill, collection_method,
    invoice_payment_provider_id, invoice_payment_provider_url, payment_attempts, metadata_reason";

const ITEM_COLS: &str = "id, project_id, invoice_id, billing_period_id, subscription_item_id,
    feature_plan_version_id, kind, quantity, unit_amount_cents, amount_subtotal, amount_total,
    cycle_start_at, cycle_end_at, proration_factor, description, item_provider_id, is_overage";

fn row_to_customer(row: &Row) -> rusqlite::Result<Customer> {
    Ok(Customer {
        id: row.get(0)?,
        project_id: row.get(1)?,
        email: row.get(2)?,
        default_currency: row.get(3)?,
        timezone: row.get(4)?,
        active: row.get(5)?,
        stripe_customer_id: row.get(6)?,
        created_at: from_millis(row.get(7)?),
    })
}

fn row_to_plan_version(row: &Row) -> rusqlite::Result<PlanVersion> {
    Ok(PlanVersion {
        id: row.get(0)?,
        project_id: row.get(1)?,
        plan_slug: row.get(2)?,
        version: row.get(3)?,
        currency: row.get(4)?,
        payment_provider: enum_col(5, PaymentProviderKind::parse(&row.get::<_, String>(5)?))?,
        when_to_bill: enum_col(6, WhenToBill::parse(&row.get::<_, String>(6)?))?,
        collection_method: enum_col(7, CollectionMethod::parse(&row.get::<_, String>(7)?))?,
        billing_config: json_col(8, row.get(8)?)?,
        grace_period: json_col(9, row.get(9)?)?,
        auto_renew: row.get(10)?,
        requires_payment_method: row.get(11)?,
        published: row.get(12)?,
    })
}

fn row_to_feature_plan_version(row: &Row) -> rusqlite::Result<FeaturePlanVersion> {
    Ok(FeaturePlanVersion {
        id: row.get(0)?,
        project_id: row.get(1)?,
        plan_version_id: row.get(2)?,
        feature_slug: row.get(3)?,
        feature_type: enum_col(4, FeatureType::parse(&row.get::<_, String>(4)?))?,
        aggregation_method: enum_col(5, AggregationMethod::parse(&row.get::<_, String>(5)?))?,
        pricing: json_col(6, row.get(6)?)?,
        limit: row.get(7)?,
        hard_limit: row.get(8)?,
        reset_config: json_col(9, row.get(9)?)?,
        default_units: row.get(10)?,
    })
}

fn row_to_subscription(row: &Row) -> rusqlite::Result<Subscription> {
    Ok(Subscription {
        id: row.get(0)?,
        project_id: row.get(1)?,
        customer_id: row.get(2)?,
        status: enum_col(3, SubscriptionStatus::parse(&row.get::<_, String>(3)?))?,
        active: row.get(4)?,
        plan_slug: row.get(5)?,
        current_cycle_start_at: from_millis(row.get(6)?),
        current_cycle_end_at: from_millis(row.get(7)?),
        renew_at: opt_millis(row.get(8)?),
        end_at: opt_millis(row.get(9)?),
        timezone: row.get(10)?,
        created_at: from_millis(row.get(11)?),
    })
}

fn row_to_phase(row: &Row) -> rusqlite::Result<SubscriptionPhase> {
    Ok(SubscriptionPhase {
        id: row.get(0)?,
        project_id: row.get(1)?,
        subscription_id: row.get(2)?,
        plan_version_id: row.get(3)?,
        payment_method_id: row.get(4)?,
        trial_ends_at: opt_millis(row.get(5)?),
        start_at: from_millis(row.get(6)?),
        end_at: opt_millis(row.get(7)?),
        current_cycle_start_at: from_millis(row.get(8)?),
        current_cycle_end_at: from_millis(row.get(9)?),
        renew_at: opt_millis(row.get(10)?),
        billing_anchor: row.get(11)?,
    })
}

fn row_to_item(row: &Row) -> rusqlite::Result<SubscriptionItem> {
    Ok(SubscriptionItem {
        id: row.get(0)?,
        project_id: row.get(1)?,
        subscription_phase_id: row.get(2)?,
        subscription_id: row.get(3)?,
        feature_plan_version_id: row.get(4)?,
        units: row.get(5)?,
    })
}

fn row_to_grant(row: &Row) -> rusqlite::Result<Grant> {
    let subject: String = row.get(2)?;
    Ok(Grant {
        id: row.get(0)?,
        project_id: row.get(1)?,
        subject_type: match subject.as_str() {
            "project" => GrantSubject::Project,
            _ => GrantSubject::Customer,
        },
        subject_id: row.get(3)?,
        feature_plan_version_id: row.get(4)?,
        feature_slug: row.get(5)?,
        feature_type: enum_col(6, FeatureType::parse(&row.get::<_, String>(6)?))?,
        aggregation_method: enum_col(7, AggregationMethod::parse(&row.get::<_, String>(7)?))?,
        reset_config: json_col(8, row.get(8)?)?,
        pricing: json_col(9, row.get(9)?)?,
        kind: enum_col(10, GrantKind::parse(&row.get::<_, String>(10)?))?,
        priority: row.get(11)?,
        effective_at: from_millis(row.get(12)?),
        expires_at: opt_millis(row.get(13)?),
        limit: row.get(14)?,
        hard_limit: row.get(15)?,
        units: row.get(16)?,
        deleted: row.get(17)?,
        created_at: from_millis(row.get(18)?),
    })
}

fn row_to_entitlement(row: &Row) -> rusqlite::Result<Entitlement> {
    Ok(Entitlement {
        id: row.get(0)?,
        project_id: row.get(1)?,
        customer_id: row.get(2)?,
        feature_slug: row.get(3)?,
        feature_type: enum_col(4, FeatureType::parse(&row.get::<_, String>(4)?))?,
        limit: row.get(5)?,
        hard_limit: row.get(6)?,
        reset_config: json_col(7, row.get(7)?)?,
        aggregation_method: enum_col(8, AggregationMethod::parse(&row.get::<_, String>(8)?))?,
        timezone: row.get(9)?,
        current_cycle_start_at: from_millis(row.get(10)?),
        current_cycle_end_at: from_millis(row.get(11)?),
        current_cycle_usage: row.get(12)?,
        accumulated_usage: row.get(13)?,
        version: row.get(14)?,
        grants: json_col(15, row.get(15)?)?,
        meter: json_col(16, row.get(16)?)?,
        active: row.get(17)?,
        updated_at: from_millis(row.get(18)?),
    })
}

fn row_to_period(row: &Row) -> rusqlite::Result<BillingPeriod> {
    Ok(BillingPeriod {
        id: row.get(0)?,
        project_id: row.get(1)?,
        subscription_id: row.get(2)?,
        subscription_phase_id: row.get(3)?,
        subscription_item_id: row.get(4)?,
        grant_id: row.get(5)?,
        cycle_start_at: from_millis(row.get(6)?),
        cycle_end_at: from_millis(row.get(7)?),
        status: enum_col(8, BillingPeriodStatus::parse(&row.get::<_, String>(8)?))?,
        kind: enum_col(9, BillingPeriodKind::parse(&row.get::<_, String>(9)?))?,
        invoice_id: row.get(10)?,
        when_to_bill: enum_col(11, WhenToBill::parse(&row.get::<_, String>(11)?))?,
        invoice_at: from_millis(row.get(12)?),
        statement_key: row.get(13)?,
        amount_estimate_cents: row.get(14)?,
    })
}

fn row_to_invoice(row: &Row) -> rusqlite::Result<Invoice> {
    Ok(Invoice {
        id: row.get(0)?,
        project_id: row.get(1)?,
        subscription_id: row.get(2)?,
        subscription_phase_id: row.get(3)?,
        customer_id: row.get(4)?,
        status: enum_col(5, InvoiceStatus::parse(&row.get::<_, String>(5)?))?,
        statement_key: row.get(6)?,
        statement_start_at: from_millis(row.get(7)?),
        statement_end_at: from_millis(row.get(8)?),
        cycle_start_at: from_millis(row.get(9)?),
        cycle_end_at: from_millis(row.get(10)?),
        due_at: from_millis(row.get(11)?),
        past_due_at: from_millis(row.get(12)?),
        issue_date: opt_millis(row.get(13)?),
        paid_at: opt_millis(row.get(14)?),
        sent_at: opt_millis(row.get(15)?),
        subtotal: row.get(16)?,
        total: row.get(17)?,
        amount_credit_used: row.get(18)?,
        payment_method_id: row.get(19)?,
        payment_provider: enum_col(20, PaymentProviderKind::parse(&row.get::<_, String>(20)?))?,
        currency: row.get(21)?,
        when_to_bill: enum_col(22, WhenToBill::parse(&row.get::<_, String>(22)?))?,
        collection_method: enum_col(23, CollectionMethod::parse(&row.get::<_, String>(23)?))?,
        invoice_payment_provider_id: row.get(24)?,
        invoice_payment_provider_url: row.get(25)?,
        payment_attempts: json_col(26, row.get(26)?)?,
        metadata_reason: row.get(27)?,
    })
}

fn row_to_invoice_item(row: &Row) -> rusqlite::Result<InvoiceItem> {
    Ok(InvoiceItem {
        id: row.get(0)?,
        project_id: row.get(1)?,
        invoice_id: row.get(2)?,
        billing_period_id: row.get(3)?,
        subscription_item_id: row.get(4)?,
        feature_plan_version_id: row.get(5)?,
        kind: enum_col(6, InvoiceItemKind::parse(&row.get::<_, String>(6)?))?,
        quantity: row.get(7)?,
        unit_amount_cents: row.get(8)?,
        amount_subtotal: row.get(9)?,
        amount_total: row.get(10)?,
        cycle_start_at: from_millis(row.get(11)?),
        cycle_end_at: from_millis(row.get(12)?),
        proration_factor: row.get(13)?,
        description: row.get(14)?,
        item_provider_id: row.get(15)?,
        is_overage: row.get(16)?,
    })
}

fn row_to_credit_grant(row: &Row) -> rusqlite::Result<CreditGrant> {
    Ok(CreditGrant {
        id: row.get(0)?,
        project_id: row.get(1)?,
        customer_id: row.get(2)?,
        currency: row.get(3)?,
        payment_provider: enum_col(4, PaymentProviderKind::parse(&row.get::<_, String>(4)?))?,
        total_amount: row.get(5)?,
        amount_used: row.get(6)?,
        expires_at: opt_millis(row.get(7)?),
        active: row.get(8)?,
        reason: row.get(9)?,
        created_at: from_millis(row.get(10)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn setup() -> (TempDir, DatabaseManager) {
        let temp = TempDir::new().unwrap();
        let db = DatabaseManager::new(&temp.path().join("billing.db")).unwrap();
        (temp, db)
    }

    fn at(y: i32, mo: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, 0, 0, 0).unwrap()
    }

    fn sample_period(sub: &str, item: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> BillingPeriod {
        BillingPeriod {
            id: new_id(),
            project_id: "proj_1".into(),
            subscription_id: sub.into(),
            subscription_phase_id: "phase_1".into(),
            subscription_item_id: item.into(),
            grant_id: None,
            cycle_start_at: start,
            cycle_end_at: end,
            status: BillingPeriodStatus::Pending,
            kind: BillingPeriodKind::Normal,
            invoice_id: None,
            when_to_bill: WhenToBill::PayInAdvance,
            invoice_at: start,
            statement_key: "abc".into(),
            amount_estimate_cents: None,
        }
    }

    #[test]
    fn test_billing_period_uniqueness_is_idempotent() {
        let (_t, db) = setup();
        let period = sample_period("sub_1", "item_1", at(2024, 1, 1), at(2024, 2, 1));
        assert!(db.insert_billing_period(&period).unwrap());

        let mut duplicate = period.clone();
        duplicate.id = new_id();
        assert!(!db.insert_billing_period(&duplicate).unwrap());
    }

    #[test]
    fn test_lock_exclusivity_and_takeover() {
        let (_t, db) = setup();
        let now = at(2024, 1, 1);
        let ttl = chrono::Duration::seconds(60);

        assert!(db.lock_try_acquire("proj_1", "sub_1", "owner_a", now, ttl).unwrap());
        // Held lease refuses a second owner.
        assert!(!db.lock_try_acquire("proj_1", "sub_1", "owner_b", now, ttl).unwrap());
        // Expired lease is taken over.
        let later = now + chrono::Duration::seconds(61);
        assert!(db.lock_try_acquire("proj_1", "sub_1", "owner_b", later, ttl).unwrap());
        let (owner, _) = db.get_lock("proj_1", "sub_1").unwrap().unwrap();
        assert_eq!(owner, "owner_b");
    }

    #[test]
    fn test_lock_extend_requires_live_owner() {
        let (_t, db) = setup();
        let now = at(2024, 1, 1);
        let ttl = chrono::Duration::seconds(60);
        db.lock_try_acquire("proj_1", "sub_1", "owner_a", now, ttl).unwrap();

        // Non-owner cannot extend.
        assert!(!db.lock_extend("proj_1", "sub_1", "owner_b", now, ttl).unwrap());
        // Owner extends while unexpired.
        assert!(db.lock_extend("proj_1", "sub_1", "owner_a", now, ttl).unwrap());
        // Owner cannot extend an expired lease.
        let later = now + chrono::Duration::seconds(120);
        assert!(!db.lock_extend("proj_1", "sub_1", "owner_a", later, ttl).unwrap());
    }

    #[test]
    fn test_apply_credits_fifo_by_expiry() {
        let (_t, db) = setup();
        let now = at(2024, 1, 1);
        let mk = |amount: Cents, expires: Option<DateTime<Utc>>| CreditGrant {
            id: new_id(),
            project_id: "proj_1".into(),
            customer_id: "cus_1".into(),
            currency: "USD".into(),
            payment_provider: PaymentProviderKind::Mock,
            total_amount: amount,
            amount_used: 0,
            expires_at: expires,
            active: true,
            reason: "test".into(),
            created_at: now,
        };
        let early = mk(300, Some(at(2024, 2, 1)));
        let late = mk(300, Some(at(2024, 3, 1)));
        let never = mk(300, None);
        db.insert_credit_grant(&late).unwrap();
        db.insert_credit_grant(&never).unwrap();
        db.insert_credit_grant(&early).unwrap();

        let (applied, applications) = db
            .apply_credits("proj_1", "inv_1", "cus_1", "USD", PaymentProviderKind::Mock, 500, now)
            .unwrap();
        assert_eq!(applied, 500);
        assert_eq!(applications.len(), 2);
        // Earliest expiry consumed first and fully.
        assert_eq!(applications[0].credit_grant_id, early.id);
        assert_eq!(applications[0].amount_applied, 300);
        assert_eq!(applications[1].credit_grant_id, late.id);
        assert_eq!(applications[1].amount_applied, 200);

        // Monotonic: sum of grant usage equals sum of applications.
        let grants = db.list_credit_grants_for_customer("proj_1", "cus_1").unwrap();
        let used: Cents = grants.iter().map(|g| g.amount_used).sum();
        assert_eq!(used, 500);
        let early_after = db.get_credit_grant("proj_1", &early.id).unwrap().unwrap();
        assert!(!early_after.active);
    }

    #[test]
    fn test_invoice_statement_idempotence() {
        let (_t, db) = setup();
        let now = at(2024, 1, 1);
        let invoice = Invoice {
            id: new_id(),
            project_id: "proj_1".into(),
            subscription_id: "sub_1".into(),
            subscription_phase_id: "phase_1".into(),
            customer_id: "cus_1".into(),
            status: InvoiceStatus::Draft,
            statement_key: "key_1".into(),
            statement_start_at: now,
            statement_end_at: at(2024, 2, 1),
            cycle_start_at: now,
            cycle_end_at: at(2024, 2, 1),
            due_at: now,
            past_due_at: at(2024, 1, 4),
            issue_date: None,
            paid_at: None,
            sent_at: None,
            subtotal: 0,
            total: 0,
            amount_credit_used: 0,
            payment_method_id: None,
            payment_provider: PaymentProviderKind::Mock,
            currency: "USD".into(),
            when_to_bill: WhenToBill::PayInAdvance,
            collection_method: CollectionMethod::ChargeAutomatically,
            invoice_payment_provider_id: None,
            invoice_payment_provider_url: None,
            payment_attempts: Vec::new(),
            metadata_reason: None,
        };
        let first = db.insert_invoice_idempotent(&invoice).unwrap();

        let mut second = invoice.clone();
        second.id = new_id();
        let winner = db.insert_invoice_idempotent(&second).unwrap();
        assert_eq!(winner.id, first.id);
    }

    #[test]
    fn test_invoice_item_batch_amount_update() {
        let (_t, db) = setup();
        let now = at(2024, 1, 1);
        let mk_item = |invoice: &str, period: Option<&str>| InvoiceItem {
            id: new_id(),
            project_id: "proj_1".into(),
            invoice_id: invoice.into(),
            billing_period_id: period.map(|p| p.to_string()),
            subscription_item_id: Some("item_1".into()),
            feature_plan_version_id: None,
            kind: InvoiceItemKind::Period,
            quantity: 0.0,
            unit_amount_cents: None,
            amount_subtotal: 0,
            amount_total: 0,
            cycle_start_at: now,
            cycle_end_at: at(2024, 2, 1),
            proration_factor: Some(1.0),
            description: "api usage".into(),
            item_provider_id: None,
            is_overage: false,
        };
        let a = mk_item("inv_1", Some("bp_1"));
        let b = mk_item("inv_1", Some("bp_2"));
        assert!(db.insert_invoice_item(&a).unwrap());
        assert!(db.insert_invoice_item(&b).unwrap());

        // Duplicate insert for the same billing period is swallowed.
        let mut dup = mk_item("inv_1", Some("bp_1"));
        dup.id = new_id();
        assert!(!db.insert_invoice_item(&dup).unwrap());

        db.update_invoice_item_amounts(
            "proj_1",
            &[
                (a.id.clone(), 10.0, Some(100), 1000, 1000, false),
                (b.id.clone(), 5.0, Some(50), 250, 125, true),
            ],
        )
        .unwrap();

        let items = db.list_items_for_invoice("proj_1", "inv_1").unwrap();
        let a_row = items.iter().find(|i| i.id == a.id).unwrap();
        assert_eq!(a_row.quantity, 10.0);
        assert_eq!(a_row.amount_total, 1000);
        let b_row = items.iter().find(|i| i.id == b.id).unwrap();
        assert_eq!(b_row.amount_total, 125);
        assert!(b_row.is_overage);
    }

    #[test]
    fn test_entitlement_upsert_by_subject_feature() {
        let (_t, db) = setup();
        let now = at(2024, 1, 1);
        let mut ent = Entitlement {
            id: new_id(),
            project_id: "proj_1".into(),
            customer_id: "cus_1".into(),
            feature_slug: "api".into(),
            feature_type: FeatureType::Usage,
            limit: Some(1000),
            hard_limit: true,
            reset_config: BillingCycleSpec::monthly(1),
            aggregation_method: AggregationMethod::Sum,
            timezone: "UTC".into(),
            current_cycle_start_at: now,
            current_cycle_end_at: at(2024, 2, 1),
            current_cycle_usage: 0.0,
            accumulated_usage: 0.0,
            version: "v1".into(),
            grants: Vec::new(),
            meter: MeterState::empty(now),
            active: true,
            updated_at: now,
        };
        db.save_entitlement(&ent).unwrap();

        ent.limit = Some(2000);
        ent.version = "v2".into();
        db.save_entitlement(&ent).unwrap();

        let loaded = db.get_entitlement("proj_1", "cus_1", "api").unwrap().unwrap();
        assert_eq!(loaded.limit, Some(2000));
        assert_eq!(loaded.version, "v2");
        assert_eq!(
            db.list_entitlements_for_customer("proj_1", "cus_1").unwrap().len(),
            1
        );
    }
}
