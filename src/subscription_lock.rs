/// Subscription Lock
///
/// Persisted lease mutex serializing all writers for one
/// `(project, subscription)` pair. A machine run holds the lease for its
/// whole duration and extends it before long provider I/O; leases expire
/// on their own so a crashed holder never wedges a subscription.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::database::DatabaseManager;
use crate::error::{BillingError, BillingResult};
use crate::types::new_id;

/// Factory for lock guards, carrying the configured TTL.
#[derive(Clone)]
pub struct SubscriptionLockService {
    db: Arc<DatabaseManager>,
    ttl: chrono::Duration,
}

impl SubscriptionLockService {
    pub fn new(db: Arc<DatabaseManager>, ttl: chrono::Duration) -> Self {
        Self { db, ttl }
    }

    /// Try to take the lease with a fresh owner token. `None` means the
    /// lease is held by a live owner and the caller should skip this
    /// subscription.
    pub fn acquire(
        &self,
        project_id: &str,
        subscription_id: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<Option<SubscriptionLockGuard>> {
        let owner_token = new_id();
        let acquired =
            self.db
                .lock_try_acquire(project_id, subscription_id, &owner_token, now, self.ttl)?;
        if !acquired {
            debug!(subscription_id, "subscription lock held, skipping");
            return Ok(None);
        }
        Ok(Some(SubscriptionLockGuard {
            db: self.db.clone(),
            project_id: project_id.to_string(),
            subscription_id: subscription_id.to_string(),
            owner_token,
            ttl: self.ttl,
            released: false,
        }))
    }

    pub fn ttl(&self) -> chrono::Duration {
        self.ttl
    }
}

/// Held lease. All database writes performed while the guard is live are
/// attributable to its owner token; callers must `release` when done.
pub struct SubscriptionLockGuard {
    db: Arc<DatabaseManager>,
    project_id: String,
    subscription_id: String,
    owner_token: String,
    ttl: chrono::Duration,
    released: bool,
}

impl SubscriptionLockGuard {
    pub fn owner_token(&self) -> &str {
        &self.owner_token
    }

    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    /// Push the expiry forward. Fails with `LockLost` when the token no
    /// longer owns a live lease (expired and taken over).
    pub fn extend(&self, now: DateTime<Utc>) -> BillingResult<()> {
        let extended = self.db.lock_extend(
            &self.project_id,
            &self.subscription_id,
            &self.owner_token,
            now,
            self.ttl,
        )?;
        if !extended {
            return Err(BillingError::LockLost {
                subscription_id: self.subscription_id.clone(),
            });
        }
        Ok(())
    }

    /// Drop the lease row.
    pub fn release(mut self) -> BillingResult<()> {
        self.released = true;
        self.db.lock_release(&self.project_id, &self.subscription_id)
    }
}

impl Drop for SubscriptionLockGuard {
    fn drop(&mut self) {
        if !self.released {
            // Best effort; an unreleased lease still expires on its own.
            if let Err(e) = self.db.lock_release(&self.project_id, &self.subscription_id) {
                warn!(
                    subscription_id = %self.subscription_id,
                    "failed to release subscription lock on drop: {}", e
                );
            }
        }
    }
}
