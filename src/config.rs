use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the billing engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Database configuration
    pub database: DatabaseConfig,
    /// Scheduler configuration
    pub schedulers: SchedulerConfig,
    /// Billing policy configuration
    pub billing: BillingPolicyConfig,
    /// Subscription lock configuration
    pub lock: LockConfig,
    /// Entitlement cache configuration
    pub cache: CacheConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database file path; defaults next to the user data dir when unset
    pub db_path: Option<PathBuf>,
}

/// Periodic loop cadence and batch caps.
///
/// Production cadence corresponds to cron `0 */12 * * *` (UTC) and
/// development to `*/5 * * * *`; the runtime drives plain intervals with
/// the equivalent durations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Tick interval in seconds for all five loops
    pub tick_interval_secs: u64,
    /// Max phases selected per periods tick
    pub periods_batch_cap: usize,
    /// Max subscriptions selected per renew tick
    pub renew_batch_cap: usize,
    /// Max pending billing periods selected per invoicing tick
    pub invoicing_batch_cap: usize,
    /// Max invoices selected per billing tick
    pub billing_batch_cap: usize,
    /// Retry attempts for period, renew and invoicing tasks
    pub transient_retries: u32,
    /// Lookback window in days for phase selection in the periods loop
    pub periods_lookback_days: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingPolicyConfig {
    /// Grace between invoice_at and due_at for pay-in-advance invoices, minutes
    pub grace_post_invoice_advance_mins: i64,
    /// Grace between invoice_at and due_at for pay-in-arrear invoices, minutes
    pub grace_post_invoice_arrear_mins: i64,
    /// Grace for minute-interval plans, minutes
    pub grace_post_invoice_minute_mins: i64,
    /// Bounded concurrency for provider side effects per batch
    pub provider_concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lease TTL in seconds; holders extend before provider I/O
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Max cached entitlement states
    pub entitlement_capacity: usize,
    /// Max cached usage-report results (idempotence replay)
    pub report_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log to file
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig { db_path: None },
            schedulers: SchedulerConfig {
                // 12h in production; use 300 for the development cadence
                tick_interval_secs: 12 * 60 * 60,
                periods_batch_cap: 100,
                renew_batch_cap: 200,
                invoicing_batch_cap: 500,
                billing_batch_cap: 100,
                transient_retries: 3,
                periods_lookback_days: 7,
            },
            billing: BillingPolicyConfig {
                grace_post_invoice_advance_mins: 15,
                grace_post_invoice_arrear_mins: 60,
                grace_post_invoice_minute_mins: 1,
                provider_concurrency: 5,
            },
            lock: LockConfig { ttl_secs: 60 },
            cache: CacheConfig {
                entitlement_capacity: 10_000,
                report_capacity: 50_000,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                log_file: None,
            },
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load_from_file(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;
        Ok(())
    }

    /// Load from the default location, falling back to defaults
    pub fn load_or_default() -> Self {
        match Self::default_config_path() {
            Some(path) if path.exists() => {
                Self::load_from_file(&path).unwrap_or_else(|_| Self::default())
            }
            _ => Self::default(),
        }
    }

    /// Default config file path under the user config directory
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("billmesh").join("config.toml"))
    }

    /// Resolved database path (explicit, or the default data dir)
    pub fn database_path(&self) -> PathBuf {
        self.database.db_path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("billmesh")
                .join("billing.db")
        })
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.schedulers.tick_interval_secs)
    }

    pub fn lock_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lock.ttl_secs as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_matches_spec_caps() {
        let config = Config::default();
        assert_eq!(config.schedulers.periods_batch_cap, 100);
        assert_eq!(config.schedulers.renew_batch_cap, 200);
        assert_eq!(config.schedulers.invoicing_batch_cap, 500);
        assert_eq!(config.schedulers.billing_batch_cap, 100);
        assert_eq!(config.lock.ttl_secs, 60);
        assert_eq!(config.billing.grace_post_invoice_advance_mins, 15);
        assert_eq!(config.billing.grace_post_invoice_arrear_mins, 60);
        assert_eq!(config.billing.grace_post_invoice_minute_mins, 1);
    }

    #[test]
    fn test_config_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");

        let mut config = Config::default();
        config.schedulers.tick_interval_secs = 300;
        config.save_to_file(&path).unwrap();

        let loaded = Config::load_from_file(&path).unwrap();
        assert_eq!(loaded.schedulers.tick_interval_secs, 300);
        assert_eq!(loaded.billing.provider_concurrency, 5);
    }
}
