/// Error Types for the Billing Engine
///
/// Structured error handling across the billing pipeline. Callers match on
/// `BillingError` variants to decide between retry, surfacing a guard
/// message, or routing a machine into its terminal error state. The
/// `DeniedReason` and `ErrorCode` enums are the wire-visible enumerations
/// returned to API callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reasons a usage verification or report can be denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeniedReason {
    LimitExceeded,
    FeatureNotEntitled,
    SubscriptionInactive,
    CustomerBlocked,
    HardLimit,
    CustomerNotFound,
    ProjectInactive,
}

impl DeniedReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeniedReason::LimitExceeded => "LIMIT_EXCEEDED",
            DeniedReason::FeatureNotEntitled => "FEATURE_NOT_ENTITLED",
            DeniedReason::SubscriptionInactive => "SUBSCRIPTION_INACTIVE",
            DeniedReason::CustomerBlocked => "CUSTOMER_BLOCKED",
            DeniedReason::HardLimit => "HARD_LIMIT",
            DeniedReason::CustomerNotFound => "CUSTOMER_NOT_FOUND",
            DeniedReason::ProjectInactive => "PROJECT_INACTIVE",
        }
    }
}

/// Structured error codes surfaced to external callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NotFound,
    BadRequest,
    Conflict,
    InternalServerError,
}

/// Billing engine errors
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Transition rejected in state '{state}' on event '{event}': failed guards [{}]", failed.join(", "))]
    GuardRejected {
        state: String,
        event: String,
        failed: Vec<String>,
    },

    #[error("Subscription lock held for subscription {subscription_id}")]
    LockHeld { subscription_id: String },

    #[error("Subscription lock lost for subscription {subscription_id}: owner token no longer valid")]
    LockLost { subscription_id: String },

    #[error("Payment provider error: {0}")]
    Provider(String),

    #[error("Provider total mismatch for invoice {invoice_id}: provider reported {provider_total}, internal total is {internal_total}")]
    ProviderMismatch {
        invoice_id: String,
        provider_total: i64,
        internal_total: i64,
    },

    #[error("Analytics error: {0}")]
    Analytics(String),

    #[error("Timed out after {timeout_ms}ms waiting for {waiting_for}")]
    Timeout {
        waiting_for: String,
        timeout_ms: u64,
    },

    #[error("Payment failed for invoice {invoice_id}: {reason}")]
    PaymentFailed { invoice_id: String, reason: String },

    #[error("Usage denied: {reason:?} (usage {usage}, limit {limit:?} at {at})")]
    UsageDenied {
        reason: DeniedReason,
        usage: f64,
        limit: Option<i64>,
        at: DateTime<Utc>,
    },
}

impl BillingError {
    /// Map to the caller-visible error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            BillingError::NotFound { .. } => ErrorCode::NotFound,
            BillingError::BadRequest(_) | BillingError::GuardRejected { .. } => {
                ErrorCode::BadRequest
            }
            BillingError::Conflict(_) | BillingError::LockHeld { .. } => ErrorCode::Conflict,
            _ => ErrorCode::InternalServerError,
        }
    }

    /// Whether a scheduler may retry the failed operation.
    ///
    /// Invariant violations, guard rejections and provider mismatches are
    /// final; I/O-shaped failures are retried up to the per-task budget.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BillingError::Database(_)
                | BillingError::Io(_)
                | BillingError::Analytics(_)
                | BillingError::Provider(_)
                | BillingError::Timeout { .. }
                | BillingError::LockHeld { .. }
        )
    }
}

impl From<rusqlite::Error> for BillingError {
    fn from(error: rusqlite::Error) -> Self {
        BillingError::Database(error.to_string())
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(error: serde_json::Error) -> Self {
        BillingError::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for BillingError {
    fn from(error: std::io::Error) -> Self {
        BillingError::Io(error.to_string())
    }
}

impl From<anyhow::Error> for BillingError {
    fn from(error: anyhow::Error) -> Self {
        BillingError::Database(error.to_string())
    }
}

/// Result type alias for billing operations
pub type BillingResult<T> = Result<T, BillingError>;
