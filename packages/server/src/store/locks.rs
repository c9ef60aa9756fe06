//! scheduler_locks: cooperative advisory locks for cross-process schedulers.

use anyhow::Result;
use chrono::{Duration, Utc};

use super::Store;

impl Store {
    /// Single-row upsert that succeeds iff no live lock exists for `key`.
    /// Exactly one caller wins per key per TTL window.
    pub async fn try_acquire_scheduler_lock(
        &self,
        lock_key: &str,
        owner: &str,
        ttl_seconds: i64,
    ) -> Result<bool> {
        let key = lock_key.trim();
        if key.is_empty() {
            return Ok(false);
        }
        let now = Utc::now();
        let locked_until = now + Duration::seconds(ttl_seconds.max(1));

        // The WHERE on the upsert re-checks expiry so two racing callers
        // cannot both take an expired slot.
        let result = sqlx::query(
            r#"
            INSERT INTO scheduler_locks (lock_key, owner, locked_until, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(lock_key) DO UPDATE SET
                owner = excluded.owner,
                locked_until = excluded.locked_until,
                updated_at = excluded.updated_at
            WHERE scheduler_locks.locked_until < ?
            "#,
        )
        .bind(key)
        .bind(owner)
        .bind(locked_until)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Drop expired lock rows; called opportunistically by schedulers.
    pub async fn prune_expired_scheduler_locks(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM scheduler_locks WHERE locked_until < ?")
            .bind(Utc::now())
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }
}
