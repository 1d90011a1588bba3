//! The allocation engine.
//!
//! [`Ipam`] owns the committed in-memory state and the store. Reads take a
//! shared lock on the state and see whatever was committed when they
//! started. Mutations run in three steps:
//!
//! 1. take the per-pool and per-VRF locks the operation touches (pools
//!    first, then VRFs, each in ascending id order),
//! 2. plan the change against the committed state, producing a batch of
//!    [`Write`]s,
//! 3. commit the batch to the store in one transaction and mirror it into
//!    the in-memory state.
//!
//! Step 3 runs on a spawned task that owns the locks, so a caller that gives
//! up mid-commit can never leave the store and the index disagreeing.
//! `engine.operation_timeout_ms` bounds steps 1 and 2 only. Once a batch is
//! handed to the store it runs to completion, bounded by
//! `engine.conflict_retries`.

mod allocate;
mod feed;
mod pool;
mod prefix;
mod registry;
mod search;
mod vrf;

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use serde::Serialize;
use tokio::sync::{watch, Mutex, OwnedMutexGuard, RwLock};
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, warn};

use crate::auth::Principal;
use crate::config::EngineConfig;
use crate::db::store::{MaxIds, Store, Write};
use crate::error::{IpamError, Result};

pub use allocate::FindFree;
pub use prefix::RemoveOptions;
pub use search::ListSpec;

use registry::Registry;

/// How many times a mutation re-resolves its lock scope before giving up.
const SCOPE_ATTEMPTS: usize = 3;

/// The IPAM engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Ipam {
    inner: Arc<Inner>,
}

struct Inner {
    store: Store,
    config: EngineConfig,
    state: RwLock<Registry>,
    vrf_locks: LockTable,
    pool_locks: LockTable,
    ids: Ids,
    changes: watch::Sender<i64>,
}

impl std::fmt::Debug for Ipam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ipam")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Ipam {
    /// Load the committed state from `store` and build the containment
    /// indexes.
    pub async fn open(store: Store, config: EngineConfig) -> Result<Self> {
        let snapshot = store.load().await?;
        let registry = Registry::from_snapshot(snapshot)?;
        let ids = Ids::new(store.max_ids().await?);
        let (changes, _) = watch::channel(store.last_change_seq().await?);

        Ok(Self {
            inner: Arc::new(Inner {
                store,
                config,
                state: RwLock::new(registry),
                vrf_locks: LockTable::default(),
                pool_locks: LockTable::default(),
                ids,
                changes,
            }),
        })
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Run one mutation: lock `scope`, plan, commit, then build the reply
    /// from the state the commit produced.
    async fn mutate<S, P, R, T>(
        &self,
        principal: &Principal,
        operation: &'static str,
        scope: S,
        plan: P,
        finish: fn(&Registry, R) -> Result<T>,
    ) -> Result<T>
    where
        S: Fn(&Registry) -> Result<LockScope>,
        P: Fn(&Registry) -> Result<(Vec<Write>, R)>,
        R: Send + 'static,
        T: Send + 'static,
    {
        principal.require_write()?;

        let limit = self.inner.config.operation_timeout();
        let deadline = Instant::now() + limit;
        let (guards, writes, staged) = timeout_at(deadline, self.prepare(operation, &scope, &plan))
            .await
            .map_err(|_| IpamError::Timeout(limit))??;

        if writes.is_empty() {
            let state = self.inner.state.read().await;
            drop(guards);
            return finish(&state, staged);
        }

        let inner = Arc::clone(&self.inner);
        let commit = tokio::spawn(async move {
            let _guards = guards;
            let seq = inner.persist(operation, &writes).await?;

            let mut state = inner.state.write().await;
            state.apply(&writes);
            if let Some(seq) = seq {
                advance(&inner.changes, seq);
            }
            debug!(operation, writes = writes.len(), ?seq, "Committed");
            finish(&state, staged)
        });

        commit
            .await
            .map_err(|e| IpamError::Internal(format!("{operation} commit task failed: {e}")))?
    }

    async fn prepare<S, P, R>(
        &self,
        operation: &'static str,
        scope: &S,
        plan: &P,
    ) -> Result<(Vec<OwnedMutexGuard<()>>, Vec<Write>, R)>
    where
        S: Fn(&Registry) -> Result<LockScope>,
        P: Fn(&Registry) -> Result<(Vec<Write>, R)>,
    {
        let mut wanted = scope(&*self.inner.state.read().await)?;

        for _ in 0..SCOPE_ATTEMPTS {
            let guards = self.lock(&wanted).await;
            let state = self.inner.state.read().await;

            // Someone may have moved the target while we waited.
            let current = scope(&state)?;
            if current != wanted {
                debug!(operation, "Lock scope changed, retrying");
                wanted = current;
                continue;
            }

            let (writes, staged) = plan(&state)?;
            return Ok((guards, writes, staged));
        }

        Err(IpamError::Conflict(format!("the target of {operation}")))
    }

    async fn lock(&self, scope: &LockScope) -> Vec<OwnedMutexGuard<()>> {
        let mut guards = Vec::with_capacity(scope.pools.len() + scope.vrfs.len());
        for id in &scope.pools {
            guards.push(self.inner.pool_locks.get(*id).lock_owned().await);
        }
        for id in &scope.vrfs {
            guards.push(self.inner.vrf_locks.get(*id).lock_owned().await);
        }
        guards
    }

    async fn read(&self) -> tokio::sync::RwLockReadGuard<'_, Registry> {
        self.inner.state.read().await
    }

    fn next_vrf_id(&self) -> i64 {
        self.inner.ids.vrf.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn next_pool_id(&self) -> i64 {
        self.inner.ids.pool.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn next_prefix_id(&self) -> i64 {
        self.inner.ids.prefix.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl Inner {
    /// Write a batch, retrying transient lock contention with doubling
    /// backoff.
    async fn persist(&self, operation: &'static str, writes: &[Write]) -> Result<Option<i64>> {
        let mut backoff = self.config.retry_backoff();
        let mut attempt = 0;
        loop {
            match self.store.write(writes).await {
                Ok(seq) => return Ok(seq),
                Err(e) if e.is_retryable() && attempt < self.config.conflict_retries => {
                    attempt += 1;
                    warn!(operation, attempt, error = %e, "Store busy, retrying");
                    sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) if e.is_retryable() => {
                    return Err(IpamError::Conflict(format!("the store during {operation}")))
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Move the published change sequence forward to `seq`. Commits in
/// disjoint lock scopes can finish out of order, so an older number never
/// replaces a newer one.
fn advance(changes: &watch::Sender<i64>, seq: i64) -> bool {
    changes.send_if_modified(|current| {
        if seq > *current {
            *current = seq;
            true
        } else {
            false
        }
    })
}

/// Locks a mutation must hold.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct LockScope {
    pools: BTreeSet<i64>,
    vrfs: BTreeSet<i64>,
}

impl LockScope {
    fn vrf(id: i64) -> Self {
        Self::default().with_vrf(id)
    }

    fn pool(id: i64) -> Self {
        Self::default().with_pool(id)
    }

    fn with_vrf(mut self, id: i64) -> Self {
        self.vrfs.insert(id);
        self
    }

    fn with_pool(mut self, id: i64) -> Self {
        self.pools.insert(id);
        self
    }
}

#[derive(Default)]
struct LockTable {
    locks: StdMutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl LockTable {
    fn get(&self, id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(id).or_default())
    }
}

struct Ids {
    vrf: AtomicI64,
    pool: AtomicI64,
    prefix: AtomicI64,
}

impl Ids {
    fn new(max: MaxIds) -> Self {
        Self {
            vrf: AtomicI64::new(max.vrf),
            pool: AtomicI64::new(max.pool),
            prefix: AtomicI64::new(max.prefix),
        }
    }
}

/// JSON rendering of attributes for audit descriptions.
fn describe<T: Serialize>(attrs: &T) -> String {
    serde_json::to_string(attrs).unwrap_or_default()
}

/// Text attributes that must not be blank when given.
fn non_empty(attribute: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(IpamError::value(attribute, "must not be empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_never_goes_backwards() {
        let (tx, mut rx) = watch::channel(0i64);
        rx.borrow_and_update();

        assert!(advance(&tx, 7));
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 7);

        // a slower commit with an older sequence finishes late
        assert!(!advance(&tx, 5));
        assert!(!advance(&tx, 7));
        assert!(!rx.has_changed().unwrap());
        assert_eq!(*tx.borrow(), 7);

        assert!(advance(&tx, 8));
        assert_eq!(*rx.borrow_and_update(), 8);
    }

    #[test]
    fn test_lock_table_shares_one_mutex_per_id() {
        let table = LockTable::default();
        assert!(Arc::ptr_eq(&table.get(3), &table.get(3)));
        assert!(!Arc::ptr_eq(&table.get(3), &table.get(4)));
    }
}
