//! Distributed lease manager: named, expiring, single-holder locks keyed by
//! (kind, resource). Grounded in the original system's `ConcurrencyManager`
//! (local `asyncio.Lock` per key, guarding a DB-backed lease row with TTL
//! expiry) — see SPEC_FULL.md §4.2.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{info, warn};

use tanda_core::{Error, Lease, LeaseId, LockKind};
use tanda_state::StateDb;

fn lock_key(kind: LockKind, resource: &str) -> String {
    format!("{}:{}", kind.as_str(), resource)
}

/// Holds a claimed lease. Dropping without calling `release` leaves the
/// lease in place until its TTL expires — callers should always release
/// explicitly on the happy path and rely on TTL expiry only as a backstop
/// against crashes.
pub struct LeaseGuard {
    db: Arc<StateDb>,
    kind: LockKind,
    resource: String,
    holder_id: String,
    _local_guard: OwnedMutexGuard<()>,
}

impl LeaseGuard {
    pub async fn release(self) -> Result<(), Error> {
        let released = self
            .db
            .delete_lease_if_holder(self.kind, &self.resource, &self.holder_id)?;
        if !released {
            warn!(kind = self.kind.as_str(), resource = %self.resource, "lease already gone on release");
        } else {
            info!(kind = self.kind.as_str(), resource = %self.resource, "lease released");
        }
        Ok(())
    }
}

pub struct LockManager {
    db: Arc<StateDb>,
    local: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    holder_id: String,
}

impl LockManager {
    pub fn new(db: Arc<StateDb>) -> Self {
        let holder_id = format!("pid{}-{}", std::process::id(), uuid::Uuid::new_v4());
        Self {
            db,
            local: StdMutex::new(HashMap::new()),
            holder_id,
        }
    }

    fn local_mutex_for(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut map = self.local.lock().expect("local lock map poisoned");
        map.entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Acquires a lease for (kind, resource). The local per-process mutex is
    /// taken first to prevent intra-process races before the store-backed
    /// lease is attempted, matching the original's local-then-distributed
    /// acquisition order.
    pub async fn acquire(&self, kind: LockKind, resource: &str, ttl: Duration) -> Result<LeaseGuard, Error> {
        let key = lock_key(kind, resource);
        let local_mutex = self.local_mutex_for(&key);
        let local_guard = local_mutex.lock_owned().await;

        let now = Utc::now();
        let expires_at = now
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(300));
        let lease = Lease {
            id: LeaseId::new(),
            kind,
            resource: resource.to_string(),
            holder_id: self.holder_id.clone(),
            expires_at,
        };

        let acquired = if self.db.put_lease_if_absent(&lease)? {
            true
        } else {
            match self.db.get_lease(kind, resource)? {
                Some(existing) if existing.is_expired(now) => self.db.cas_replace_lease(&existing, &lease)?,
                _ => false,
            }
        };

        if !acquired {
            drop(local_guard);
            return Err(Error::AlreadyHeld {
                kind: kind.as_str().to_string(),
                resource: resource.to_string(),
            });
        }

        info!(kind = kind.as_str(), resource, holder = %self.holder_id, "lease acquired");
        Ok(LeaseGuard {
            db: self.db.clone(),
            kind,
            resource: resource.to_string(),
            holder_id: self.holder_id.clone(),
            _local_guard: local_guard,
        })
    }

    /// Removes every lease row whose `expires_at` has passed. Intended to
    /// run periodically from a background task (see `spawn_expiry_sweeper`).
    pub fn sweep_expired(&self) -> Result<usize, Error> {
        let now = Utc::now();
        let expired = self.db.iter_expired_leases(now)?;
        for lease in &expired {
            self.db.delete_lease_key(lease.kind, &lease.resource)?;
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "swept expired leases");
        }
        Ok(expired.len())
    }
}

/// Spawns a background task sweeping expired leases on a fixed interval.
/// Mirrors the original's `_start_cleanup_task` loop.
pub fn spawn_expiry_sweeper(manager: Arc<LockManager>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = manager.sweep_expired() {
                warn!(error = %e, "lease sweep failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tanda_state::StateDb;

    fn temp_db() -> Arc<StateDb> {
        let dir = std::env::temp_dir().join(format!("tanda-locks-test-{}", uuid::Uuid::new_v4()));
        Arc::new(StateDb::open(dir).expect("open temp db"))
    }

    #[tokio::test]
    async fn acquire_then_release_allows_reacquire() {
        let db = temp_db();
        let mgr = LockManager::new(db);
        let guard = mgr.acquire(LockKind::GroupWrite, "g1", Duration::from_secs(5)).await.unwrap();
        guard.release().await.unwrap();
        let _guard2 = mgr.acquire(LockKind::GroupWrite, "g1", Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn contended_acquire_fails() {
        let db = temp_db();
        let mgr = Arc::new(LockManager::new(db));
        let _guard = mgr.acquire(LockKind::RotationAdvance, "g1", Duration::from_secs(5)).await.unwrap();

        let mgr2 = Arc::new(LockManager::new(mgr.db.clone()));
        let err = mgr2
            .acquire(LockKind::RotationAdvance, "g1", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyHeld { .. }));
    }

    #[tokio::test]
    async fn expired_lease_can_be_reclaimed() {
        let db = temp_db();
        let mgr = LockManager::new(db);
        let guard = mgr
            .acquire(LockKind::SecurityDeposit, "m1", Duration::from_millis(1))
            .await
            .unwrap();
        // don't release; let it expire
        tokio::time::sleep(Duration::from_millis(20)).await;
        std::mem::forget(guard);
        let _guard2 = mgr
            .acquire(LockKind::SecurityDeposit, "m1", Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[test]
    fn sweep_removes_expired() {
        let db = temp_db();
        let mgr = LockManager::new(db);
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let guard = mgr
                .acquire(LockKind::MemberWrite, "m2", Duration::from_millis(1))
                .await
                .unwrap();
            std::mem::forget(guard);
            tokio::time::sleep(Duration::from_millis(20)).await;
        });
        let removed = mgr.sweep_expired().unwrap();
        assert_eq!(removed, 1);
    }
}
