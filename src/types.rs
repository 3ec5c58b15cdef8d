/// Core Data Model
///
/// Shared entities and enumerations of the billing engine. Every entity is
/// scoped by `project_id`; the `(project_id, id)` pair is the primary
/// identity everywhere. Monetary amounts are integer minor units (cents),
/// timestamps are `DateTime<Utc>` in memory and epoch milliseconds at the
/// persistence boundary.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Monetary amount in minor units (cents).
pub type Cents = i64;

/// Project identifier supplied by callers; the engine never mints these.
pub type ProjectId = String;

/// Convert a timestamp to epoch milliseconds for storage.
pub fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

/// Convert stored epoch milliseconds back to a timestamp.
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Mint a fresh entity id.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ===== Status and policy enums =====

/// Subscription lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    PastDue,
    Canceled,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "trialing" => Some(SubscriptionStatus::Trialing),
            "active" => Some(SubscriptionStatus::Active),
            "past_due" => Some(SubscriptionStatus::PastDue),
            "canceled" => Some(SubscriptionStatus::Canceled),
            "expired" => Some(SubscriptionStatus::Expired),
            _ => None,
        }
    }

    /// Terminal statuses keep `active = false` on the subscription row.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubscriptionStatus::Canceled | SubscriptionStatus::Expired)
    }
}

/// Recurrence interval for billing cycles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    Minute,
    Day,
    Week,
    Month,
    Year,
    Onetime,
}

impl BillingInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingInterval::Minute => "minute",
            BillingInterval::Day => "day",
            BillingInterval::Week => "week",
            BillingInterval::Month => "month",
            BillingInterval::Year => "year",
            BillingInterval::Onetime => "onetime",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "minute" => Some(BillingInterval::Minute),
            "day" => Some(BillingInterval::Day),
            "week" => Some(BillingInterval::Week),
            "month" => Some(BillingInterval::Month),
            "year" => Some(BillingInterval::Year),
            "onetime" => Some(BillingInterval::Onetime),
            _ => None,
        }
    }
}

/// Plain calendar units for date stepping (grace periods, past-due dates).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalendarUnit {
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

/// When a billing period is invoiced relative to its service window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WhenToBill {
    PayInAdvance,
    PayInArrear,
}

impl WhenToBill {
    pub fn as_str(&self) -> &'static str {
        match self {
            WhenToBill::PayInAdvance => "pay_in_advance",
            WhenToBill::PayInArrear => "pay_in_arrear",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pay_in_advance" => Some(WhenToBill::PayInAdvance),
            "pay_in_arrear" => Some(WhenToBill::PayInArrear),
            _ => None,
        }
    }
}

/// How an invoice is collected once finalized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionMethod {
    ChargeAutomatically,
    SendInvoice,
}

impl CollectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionMethod::ChargeAutomatically => "charge_automatically",
            CollectionMethod::SendInvoice => "send_invoice",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "charge_automatically" => Some(CollectionMethod::ChargeAutomatically),
            "send_invoice" => Some(CollectionMethod::SendInvoice),
            _ => None,
        }
    }
}

/// Feature pricing shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureType {
    Flat,
    Tier,
    Usage,
    Package,
}

impl FeatureType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureType::Flat => "flat",
            FeatureType::Tier => "tier",
            FeatureType::Usage => "usage",
            FeatureType::Package => "package",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "flat" => Some(FeatureType::Flat),
            "tier" => Some(FeatureType::Tier),
            "usage" => Some(FeatureType::Usage),
            "package" => Some(FeatureType::Package),
            _ => None,
        }
    }

    /// Metered features consume grants by waterfall; entitlement limits sum.
    pub fn is_metered(&self) -> bool {
        matches!(self, FeatureType::Tier | FeatureType::Usage)
    }
}

/// How raw usage events aggregate into a quantity.
///
/// The `*_all` variants ignore cycle resets and read the accumulated
/// usage across the subscription's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMethod {
    Sum,
    SumAll,
    Max,
    MaxAll,
    LastDuringPeriod,
    Count,
    CountAll,
}

impl AggregationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationMethod::Sum => "sum",
            AggregationMethod::SumAll => "sum_all",
            AggregationMethod::Max => "max",
            AggregationMethod::MaxAll => "max_all",
            AggregationMethod::LastDuringPeriod => "last_during_period",
            AggregationMethod::Count => "count",
            AggregationMethod::CountAll => "count_all",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sum" => Some(AggregationMethod::Sum),
            "sum_all" => Some(AggregationMethod::SumAll),
            "max" => Some(AggregationMethod::Max),
            "max_all" => Some(AggregationMethod::MaxAll),
            "last_during_period" => Some(AggregationMethod::LastDuringPeriod),
            "count" => Some(AggregationMethod::Count),
            "count_all" => Some(AggregationMethod::CountAll),
            _ => None,
        }
    }

    pub fn ignores_cycle_reset(&self) -> bool {
        matches!(
            self,
            AggregationMethod::SumAll | AggregationMethod::MaxAll | AggregationMethod::CountAll
        )
    }
}

/// Payment provider selector. Real integrations live behind the
/// `PaymentProvider` trait; this names which one an invoice routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentProviderKind {
    Stripe,
    Mock,
}

impl PaymentProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentProviderKind::Stripe => "stripe",
            PaymentProviderKind::Mock => "mock",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stripe" => Some(PaymentProviderKind::Stripe),
            "mock" => Some(PaymentProviderKind::Mock),
            _ => None,
        }
    }
}

/// Plan recurrence classification carried on the billing config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanType {
    Recurring,
    Onetime,
}

/// Grant origin; determines the default waterfall priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantKind {
    Subscription,
    Trial,
    Promotion,
    Manual,
}

impl GrantKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantKind::Subscription => "subscription",
            GrantKind::Trial => "trial",
            GrantKind::Promotion => "promotion",
            GrantKind::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "subscription" => Some(GrantKind::Subscription),
            "trial" => Some(GrantKind::Trial),
            "promotion" => Some(GrantKind::Promotion),
            "manual" => Some(GrantKind::Manual),
            _ => None,
        }
    }

    pub fn default_priority(&self) -> i32 {
        match self {
            GrantKind::Subscription => 10,
            GrantKind::Trial => 80,
            GrantKind::Promotion => 90,
            GrantKind::Manual => 100,
        }
    }
}

/// Who a grant is allocated to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantSubject {
    Customer,
    Project,
}

/// Billing period lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingPeriodStatus {
    Pending,
    Invoiced,
    Void,
}

impl BillingPeriodStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingPeriodStatus::Pending => "pending",
            BillingPeriodStatus::Invoiced => "invoiced",
            BillingPeriodStatus::Void => "void",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(BillingPeriodStatus::Pending),
            "invoiced" => Some(BillingPeriodStatus::Invoiced),
            "void" => Some(BillingPeriodStatus::Void),
            _ => None,
        }
    }
}

/// What produced a billing period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingPeriodKind {
    Normal,
    MidCycleChange,
    Trial,
}

impl BillingPeriodKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingPeriodKind::Normal => "normal",
            BillingPeriodKind::MidCycleChange => "mid_cycle_change",
            BillingPeriodKind::Trial => "trial",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "normal" => Some(BillingPeriodKind::Normal),
            "mid_cycle_change" => Some(BillingPeriodKind::MidCycleChange),
            "trial" => Some(BillingPeriodKind::Trial),
            _ => None,
        }
    }
}

/// Invoice lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Unpaid,
    Waiting,
    Paid,
    Void,
    Failed,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Unpaid => "unpaid",
            InvoiceStatus::Waiting => "waiting",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Void => "void",
            InvoiceStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(InvoiceStatus::Draft),
            "unpaid" => Some(InvoiceStatus::Unpaid),
            "waiting" => Some(InvoiceStatus::Waiting),
            "paid" => Some(InvoiceStatus::Paid),
            "void" => Some(InvoiceStatus::Void),
            "failed" => Some(InvoiceStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, InvoiceStatus::Paid | InvoiceStatus::Void | InvoiceStatus::Failed)
    }
}

/// Invoice line item classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceItemKind {
    Period,
    Trial,
    Adjustment,
    CreditApplied,
}

impl InvoiceItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceItemKind::Period => "period",
            InvoiceItemKind::Trial => "trial",
            InvoiceItemKind::Adjustment => "adjustment",
            InvoiceItemKind::CreditApplied => "credit_applied",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "period" => Some(InvoiceItemKind::Period),
            "trial" => Some(InvoiceItemKind::Trial),
            "adjustment" => Some(InvoiceItemKind::Adjustment),
            "credit_applied" => Some(InvoiceItemKind::CreditApplied),
            _ => None,
        }
    }
}

// ===== Billing configuration =====

/// Anchored recurrence specification for cycle computation.
///
/// The anchor aligns the recurrence grid: day-of-month for `month`,
/// weekday (0 = Sunday) for `week`, hour for `day`, second for `minute`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BillingCycleSpec {
    pub interval: BillingInterval,
    pub interval_count: u32,
    pub anchor: u32,
    pub plan_type: PlanType,
}

impl BillingCycleSpec {
    pub fn monthly(anchor: u32) -> Self {
        Self {
            interval: BillingInterval::Month,
            interval_count: 1,
            anchor,
            plan_type: PlanType::Recurring,
        }
    }

    pub fn onetime() -> Self {
        Self {
            interval: BillingInterval::Onetime,
            interval_count: 1,
            anchor: 0,
            plan_type: PlanType::Onetime,
        }
    }
}

/// Grace period added to a due date to compute the past-due date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GracePeriod {
    pub unit: CalendarUnit,
    pub units: u32,
}

impl Default for GracePeriod {
    fn default() -> Self {
        Self {
            unit: CalendarUnit::Day,
            units: 3,
        }
    }
}

/// Pricing formula attached to a feature plan version (and denormalized
/// onto grants so waterfall overage can price against the consumed grant).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PricingConfig {
    /// Fixed amount per cycle regardless of usage.
    Flat { amount_cents: Cents },
    /// Linear price per unit of usage.
    Usage { unit_amount_cents: Cents },
    /// Graduated tier ladder; ranges are inclusive on both ends,
    /// `last_unit = None` means unbounded.
    Tier { tiers: Vec<PriceTier> },
    /// Usage is billed in packages of `package_size`, rounded up.
    Package {
        package_size: i64,
        package_amount_cents: Cents,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTier {
    pub first_unit: i64,
    pub last_unit: Option<i64>,
    pub unit_amount_cents: Cents,
    #[serde(default)]
    pub flat_amount_cents: Cents,
}

// ===== Entities =====

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    pub project_id: ProjectId,
    pub email: String,
    pub default_currency: String,
    pub timezone: String,
    pub active: bool,
    pub stripe_customer_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub project_id: ProjectId,
    pub customer_id: String,
    pub status: SubscriptionStatus,
    pub active: bool,
    pub plan_slug: String,
    pub current_cycle_start_at: DateTime<Utc>,
    pub current_cycle_end_at: DateTime<Utc>,
    pub renew_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub timezone: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionPhase {
    pub id: String,
    pub project_id: ProjectId,
    pub subscription_id: String,
    pub plan_version_id: String,
    pub payment_method_id: Option<String>,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub start_at: DateTime<Utc>,
    pub end_at: Option<DateTime<Utc>>,
    pub current_cycle_start_at: DateTime<Utc>,
    pub current_cycle_end_at: DateTime<Utc>,
    pub renew_at: Option<DateTime<Utc>>,
    pub billing_anchor: u32,
}

impl SubscriptionPhase {
    /// A phase is active at `now` when `start_at <= now < end_at` (end
    /// unset means open-ended).
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.start_at <= now && self.end_at.map_or(true, |end| now < end)
    }

    pub fn in_trial_at(&self, now: DateTime<Utc>) -> bool {
        self.trial_ends_at.map_or(false, |t| now < t)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionItem {
    pub id: String,
    pub project_id: ProjectId,
    pub subscription_phase_id: String,
    pub subscription_id: String,
    pub feature_plan_version_id: String,
    /// `None` means usage-based quantity resolved from analytics.
    pub units: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanVersion {
    pub id: String,
    pub project_id: ProjectId,
    pub plan_slug: String,
    pub version: u32,
    pub currency: String,
    pub payment_provider: PaymentProviderKind,
    pub when_to_bill: WhenToBill,
    pub collection_method: CollectionMethod,
    pub billing_config: BillingCycleSpec,
    pub grace_period: GracePeriod,
    pub auto_renew: bool,
    /// Whether a payment method must be on file to leave trial / renew.
    pub requires_payment_method: bool,
    pub published: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturePlanVersion {
    pub id: String,
    pub project_id: ProjectId,
    pub plan_version_id: String,
    pub feature_slug: String,
    pub feature_type: FeatureType,
    pub aggregation_method: AggregationMethod,
    pub pricing: PricingConfig,
    pub limit: Option<i64>,
    pub hard_limit: bool,
    pub reset_config: BillingCycleSpec,
    /// Default included units for per-seat style items.
    pub default_units: Option<i64>,
}

/// Append-only quota allocation. Feature configuration is denormalized
/// from the feature plan version at creation time so snapshot merging and
/// waterfall pricing stay self-contained.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grant {
    pub id: String,
    pub project_id: ProjectId,
    pub subject_type: GrantSubject,
    pub subject_id: String,
    pub feature_plan_version_id: String,
    pub feature_slug: String,
    pub feature_type: FeatureType,
    pub aggregation_method: AggregationMethod,
    pub reset_config: BillingCycleSpec,
    pub pricing: PricingConfig,
    pub kind: GrantKind,
    pub priority: i32,
    pub effective_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub hard_limit: bool,
    pub units: Option<i64>,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
}

impl Grant {
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        !self.deleted
            && self.effective_at <= now
            && self.expires_at.map_or(true, |exp| now < exp)
    }
}

/// Reconciliation state of an entitlement's usage meter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterState {
    /// Analytics sequence cursor; events up to and including this
    /// sequence number have been folded into `usage`.
    pub last_reconciled_seq: u64,
    pub snapshot_usage: f64,
    pub last_updated: DateTime<Utc>,
    pub usage: f64,
    pub last_cycle_start: Option<DateTime<Utc>>,
}

impl MeterState {
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            last_reconciled_seq: 0,
            snapshot_usage: 0.0,
            last_updated: now,
            usage: 0.0,
            last_cycle_start: None,
        }
    }
}

/// Effective limit and usage state of one feature for one customer,
/// derived from the active grant set. Unique per
/// `(project, customer, feature_slug)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entitlement {
    pub id: String,
    pub project_id: ProjectId,
    pub customer_id: String,
    pub feature_slug: String,
    pub feature_type: FeatureType,
    pub limit: Option<i64>,
    pub hard_limit: bool,
    pub reset_config: BillingCycleSpec,
    pub aggregation_method: AggregationMethod,
    pub timezone: String,
    pub current_cycle_start_at: DateTime<Utc>,
    pub current_cycle_end_at: DateTime<Utc>,
    pub current_cycle_usage: f64,
    pub accumulated_usage: f64,
    /// Hash of the active grant set; acts as a cache fence.
    pub version: String,
    pub grants: Vec<Grant>,
    pub meter: MeterState,
    pub active: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingPeriod {
    pub id: String,
    pub project_id: ProjectId,
    pub subscription_id: String,
    pub subscription_phase_id: String,
    pub subscription_item_id: String,
    pub grant_id: Option<String>,
    pub cycle_start_at: DateTime<Utc>,
    pub cycle_end_at: DateTime<Utc>,
    pub status: BillingPeriodStatus,
    pub kind: BillingPeriodKind,
    pub invoice_id: Option<String>,
    pub when_to_bill: WhenToBill,
    pub invoice_at: DateTime<Utc>,
    pub statement_key: String,
    pub amount_estimate_cents: Option<Cents>,
}

/// One payment attempt recorded on an invoice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentAttempt {
    pub at: DateTime<Utc>,
    pub succeeded: bool,
    pub error: Option<String>,
}

/// Maximum number of payment attempts before an invoice fails.
pub const MAX_PAYMENT_ATTEMPTS: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub project_id: ProjectId,
    pub subscription_id: String,
    pub subscription_phase_id: String,
    pub customer_id: String,
    pub status: InvoiceStatus,
    pub statement_key: String,
    pub statement_start_at: DateTime<Utc>,
    pub statement_end_at: DateTime<Utc>,
    pub cycle_start_at: DateTime<Utc>,
    pub cycle_end_at: DateTime<Utc>,
    pub due_at: DateTime<Utc>,
    pub past_due_at: DateTime<Utc>,
    pub issue_date: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub subtotal: Cents,
    pub total: Cents,
    pub amount_credit_used: Cents,
    pub payment_method_id: Option<String>,
    pub payment_provider: PaymentProviderKind,
    pub currency: String,
    pub when_to_bill: WhenToBill,
    pub collection_method: CollectionMethod,
    pub invoice_payment_provider_id: Option<String>,
    pub invoice_payment_provider_url: Option<String>,
    pub payment_attempts: Vec<PaymentAttempt>,
    /// Operator-facing failure annotation, e.g. `provider_mismatch` or
    /// `pending_expiration`.
    pub metadata_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceItem {
    pub id: String,
    pub project_id: ProjectId,
    pub invoice_id: String,
    pub billing_period_id: Option<String>,
    pub subscription_item_id: Option<String>,
    pub feature_plan_version_id: Option<String>,
    pub kind: InvoiceItemKind,
    pub quantity: f64,
    pub unit_amount_cents: Option<Cents>,
    pub amount_subtotal: Cents,
    pub amount_total: Cents,
    pub cycle_start_at: DateTime<Utc>,
    pub cycle_end_at: DateTime<Utc>,
    pub proration_factor: Option<f64>,
    pub description: String,
    pub item_provider_id: Option<String>,
    pub is_overage: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditGrant {
    pub id: String,
    pub project_id: ProjectId,
    pub customer_id: String,
    pub currency: String,
    pub payment_provider: PaymentProviderKind,
    pub total_amount: Cents,
    pub amount_used: Cents,
    pub expires_at: Option<DateTime<Utc>>,
    pub active: bool,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

impl CreditGrant {
    pub fn remaining(&self) -> Cents {
        (self.total_amount - self.amount_used).max(0)
    }

    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        self.active
            && self.amount_used < self.total_amount
            && self.expires_at.map_or(true, |exp| exp > now)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceCreditApplication {
    pub id: String,
    pub project_id: ProjectId,
    pub invoice_id: String,
    pub credit_grant_id: String,
    pub amount_applied: Cents,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_millis_round_trip() {
        let ts = Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 0).unwrap();
        assert_eq!(from_millis(to_millis(ts)), ts);
    }

    #[test]
    fn test_grant_default_priorities() {
        assert_eq!(GrantKind::Subscription.default_priority(), 10);
        assert_eq!(GrantKind::Trial.default_priority(), 80);
        assert_eq!(GrantKind::Promotion.default_priority(), 90);
        assert_eq!(GrantKind::Manual.default_priority(), 100);
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in [
            SubscriptionStatus::Trialing,
            SubscriptionStatus::Active,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Canceled,
            SubscriptionStatus::Expired,
        ] {
            assert_eq!(SubscriptionStatus::parse(status.as_str()), Some(status));
        }
        assert!(SubscriptionStatus::Canceled.is_terminal());
        assert!(!SubscriptionStatus::PastDue.is_terminal());
    }

    #[test]
    fn test_phase_activity_window() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let phase = SubscriptionPhase {
            id: new_id(),
            project_id: "proj_1".into(),
            subscription_id: new_id(),
            plan_version_id: new_id(),
            payment_method_id: None,
            trial_ends_at: None,
            start_at: start,
            end_at: Some(end),
            current_cycle_start_at: start,
            current_cycle_end_at: end,
            renew_at: None,
            billing_anchor: 1,
        };
        assert!(phase.is_active_at(start));
        assert!(!phase.is_active_at(end));
    }

    #[test]
    fn test_credit_grant_usability() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let mut grant = CreditGrant {
            id: new_id(),
            project_id: "proj_1".into(),
            customer_id: new_id(),
            currency: "USD".into(),
            payment_provider: PaymentProviderKind::Mock,
            total_amount: 5000,
            amount_used: 0,
            expires_at: None,
            active: true,
            reason: "mid_cycle_change".into(),
            created_at: now,
        };
        assert!(grant.is_usable_at(now));
        assert_eq!(grant.remaining(), 5000);

        grant.amount_used = 5000;
        assert!(!grant.is_usable_at(now));
        assert_eq!(grant.remaining(), 0);
    }
}
