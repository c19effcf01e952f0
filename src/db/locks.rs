//! Advisory locks held in the database.
//!
//! Cooperative locks keyed by stable strings (`series_prompt:{id}`,
//! `prompt_family:{type}:{document_type}`, `series_create:{identity}`),
//! acquired atomically via `INSERT OR IGNORE` against the primary key.
//! A lease expiry bounds the damage of a crashed holder; waits are
//! bounded and a timeout is a soft deferral, not a failure.
//!
//! Every operation appends a `lock` event: `lock_requested`,
//! `lock_acquired`, `lock_released`, `lock_timeout`.

use std::time::Duration;

use serde_json::json;
use tokio::time::sleep;

use crate::db::{now, Database, NewEvent};
use crate::types::EventCategory;

/// Delay between acquisition attempts while waiting on a held lock.
const RETRY_DELAY: Duration = Duration::from_millis(200);

/// How long an acquired lock may be held before another process may
/// steal it (crashed-holder protection).
const LEASE: Duration = Duration::from_secs(120);

/// Lock key for first-time series prompt creation and evolution.
pub fn series_prompt_lock_key(series_id: i64) -> String {
    format!("series_prompt:{series_id}")
}

/// Lock key for prompt evolution within a family.
pub fn prompt_family_lock_key(prompt_type: &str, document_type: &str) -> String {
    format!("prompt_family:{prompt_type}:{document_type}")
}

/// Lock key for series read-or-create on a normalized identity.
pub fn series_create_lock_key(
    entity_normalized: &str,
    series_type_normalized: &str,
    user_id: &str,
) -> String {
    format!("series_create:{entity_normalized}:{series_type_normalized}:{user_id}")
}

impl Database {
    /// One atomic acquisition attempt.
    ///
    /// Expired leases are reaped first, so a crashed holder delays
    /// waiters by at most the lease length.
    ///
    /// # Errors
    ///
    /// Returns an error if the database access fails.
    async fn try_acquire_lock(&self, key: &str, holder: &str) -> anyhow::Result<bool> {
        sqlx::query("DELETE FROM advisory_locks WHERE lock_key = ?1 AND expires_at < ?2")
            .bind(key)
            .bind(now())
            .execute(self.pool())
            .await?;

        let expires = chrono::Utc::now()
            .checked_add_signed(chrono::Duration::seconds(
                i64::try_from(LEASE.as_secs()).unwrap_or(i64::MAX),
            ))
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(now);

        let acquired = sqlx::query(
            "INSERT OR IGNORE INTO advisory_locks (lock_key, holder, acquired_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(key)
        .bind(holder)
        .bind(now())
        .bind(expires)
        .execute(self.pool())
        .await?
        .rows_affected()
            > 0;
        Ok(acquired)
    }

    /// Acquire an advisory lock, waiting up to `wait_timeout`.
    ///
    /// Returns `true` on acquisition and `false` on timeout. Timeouts
    /// are logged and left for the caller to defer on.
    ///
    /// # Errors
    ///
    /// Returns an error if the database access fails.
    pub async fn acquire_lock(
        &self,
        key: &str,
        holder: &str,
        wait_timeout: Duration,
        user_id: &str,
    ) -> anyhow::Result<bool> {
        self.log_event(&NewEvent {
            category: EventCategory::Lock,
            event_type: "lock_requested".to_owned(),
            details: json!({ "key": key, "holder": holder }),
            user_id: user_id.to_owned(),
            ..NewEvent::default()
        })
        .await?;

        let deadline = tokio::time::Instant::now() + wait_timeout;
        loop {
            if self.try_acquire_lock(key, holder).await? {
                self.log_event(&NewEvent {
                    category: EventCategory::Lock,
                    event_type: "lock_acquired".to_owned(),
                    details: json!({ "key": key, "holder": holder }),
                    user_id: user_id.to_owned(),
                    ..NewEvent::default()
                })
                .await?;
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                self.log_event(&NewEvent {
                    category: EventCategory::Lock,
                    event_type: "lock_timeout".to_owned(),
                    details: json!({ "key": key, "holder": holder }),
                    user_id: user_id.to_owned(),
                    ..NewEvent::default()
                })
                .await?;
                return Ok(false);
            }
            sleep(RETRY_DELAY).await;
        }
    }

    /// Release a held lock.
    ///
    /// Only the holder's own row is removed, so releasing after a lease
    /// steal cannot drop somebody else's lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the database access fails.
    pub async fn release_lock(&self, key: &str, holder: &str, user_id: &str) -> anyhow::Result<()> {
        let released = sqlx::query(
            "DELETE FROM advisory_locks WHERE lock_key = ?1 AND holder = ?2",
        )
        .bind(key)
        .bind(holder)
        .execute(self.pool())
        .await?
        .rows_affected()
            > 0;

        if released {
            self.log_event(&NewEvent {
                category: EventCategory::Lock,
                event_type: "lock_released".to_owned(),
                details: json!({ "key": key, "holder": holder }),
                user_id: user_id.to_owned(),
                ..NewEvent::default()
            })
            .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn db() -> Database {
        Database::open_in_memory().await.expect("in-memory db")
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_released() {
        let db = db().await;
        let key = series_prompt_lock_key(7);

        assert!(db
            .acquire_lock(&key, "worker-a", Duration::from_millis(10), "local")
            .await
            .expect("first acquire"));
        assert!(!db
            .acquire_lock(&key, "worker-b", Duration::from_millis(10), "local")
            .await
            .expect("contended acquire"));

        db.release_lock(&key, "worker-a", "local")
            .await
            .expect("release");
        assert!(db
            .acquire_lock(&key, "worker-b", Duration::from_millis(10), "local")
            .await
            .expect("post-release acquire"));
    }

    #[tokio::test]
    async fn release_by_non_holder_is_a_no_op() {
        let db = db().await;
        let key = prompt_family_lock_key("summarizer", "bill");

        db.acquire_lock(&key, "worker-a", Duration::from_millis(10), "local")
            .await
            .expect("acquire");
        db.release_lock(&key, "worker-b", "local")
            .await
            .expect("foreign release");

        // worker-a's lock still holds.
        assert!(!db
            .acquire_lock(&key, "worker-c", Duration::from_millis(10), "local")
            .await
            .expect("still held"));
    }

    #[tokio::test]
    async fn expired_lease_is_reaped() {
        let db = db().await;
        let key = series_create_lock_key("pg&e", "monthly_utility_bill", "local");

        db.acquire_lock(&key, "worker-a", Duration::from_millis(10), "local")
            .await
            .expect("acquire");
        // Force the lease into the past.
        sqlx::query("UPDATE advisory_locks SET expires_at = '2000-01-01T00:00:00+00:00'")
            .execute(db.pool())
            .await
            .expect("age lease");

        assert!(db
            .acquire_lock(&key, "worker-b", Duration::from_millis(10), "local")
            .await
            .expect("steal expired"));
    }

    #[tokio::test]
    async fn lock_operations_are_logged() {
        let db = db().await;
        let key = series_prompt_lock_key(1);

        db.acquire_lock(&key, "w", Duration::from_millis(10), "local")
            .await
            .expect("acquire");
        db.acquire_lock(&key, "x", Duration::from_millis(10), "local")
            .await
            .expect("timeout");
        db.release_lock(&key, "w", "local").await.expect("release");

        let count = db.count_events(EventCategory::Lock).await.expect("count");
        // requested + acquired + requested + timeout + released
        assert_eq!(count, 5);
    }

    #[test]
    fn lock_keys_are_stable() {
        assert_eq!(series_prompt_lock_key(42), "series_prompt:42");
        assert_eq!(
            prompt_family_lock_key("summarizer", "bill"),
            "prompt_family:summarizer:bill"
        );
        assert_eq!(
            series_create_lock_key("pg&e", "bill", "local"),
            "series_create:pg&e:bill:local"
        );
    }
}
