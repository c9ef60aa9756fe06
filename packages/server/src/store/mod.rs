// Durable state: jobs, events, leases, settings, scans, proxies.
//
// The `Store` is the single shared mutable resource of the system (see the
// concurrency model in the crate docs). Every component talks to it by id;
// nothing keeps a write-back cache. Operations either commit or leave no
// observable change.

pub mod db;
pub mod events;
pub mod jobs;
pub mod locks;
pub mod nurture;
pub mod proxies;
pub mod scans;
pub mod settings;
pub mod users;

use std::sync::Mutex;
use std::time::Instant;

use anyhow::Result;
use sqlx::SqlitePool;

pub use events::{EventLogFilter, EventLogStats, LogPolicy, NewEventLog};

/// SQLite-backed store shared by the API, the worker pool, and the
/// schedulers. Cheap to share via `Arc`.
pub struct Store {
    pool: SqlitePool,
    log_policy: std::sync::RwLock<LogPolicy>,
    last_event_cleanup: Mutex<Option<Instant>>,
    last_audit_cleanup: Mutex<Option<Instant>>,
}

impl Store {
    /// Open (or create) the database file and run migrations.
    pub async fn connect(db_path: &str) -> Result<Self> {
        let pool = db::connect(db_path).await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            log_policy: std::sync::RwLock::new(LogPolicy::default()),
            last_event_cleanup: Mutex::new(None),
            last_audit_cleanup: Mutex::new(None),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Swap in the retention/masking policy derived from SystemSettings.
    pub fn set_log_policy(&self, policy: LogPolicy) {
        *self.log_policy.write().unwrap_or_else(|e| e.into_inner()) = policy;
    }

    pub(crate) fn log_policy(&self) -> LogPolicy {
        self.log_policy
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn event_cleanup_due(&self, interval_sec: u64) -> bool {
        let mut last = self
            .last_event_cleanup
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        match *last {
            Some(at) if at.elapsed().as_secs() < interval_sec => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }

    pub(crate) fn audit_cleanup_due(&self, interval_sec: u64) -> bool {
        let mut last = self
            .last_audit_cleanup
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        match *last {
            Some(at) if at.elapsed().as_secs() < interval_sec => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }
}
