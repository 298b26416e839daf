//! Store-backed mutual exclusion.

use crate::error::{Error, Result};
use crate::store::{Compare, EventType, Session, Store, StoreTxn, TxnOp, WatchOptions};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

pub const LOCK_PREFIX: &str = "locks/";

/// A single named mutex. The lock key is bound to the session lease so a
/// crashed holder releases it when the lease expires.
pub struct DistributedMutex {
    store: Arc<dyn Store>,
    session: Arc<Session>,
    id: String,
    key: String,
    token: Vec<u8>,
}

impl DistributedMutex {
    pub fn new(store: Arc<dyn Store>, session: Arc<Session>, id: &str) -> Self {
        Self {
            store,
            session,
            id: id.to_string(),
            key: format!("{}{}", LOCK_PREFIX, id),
            token: Uuid::new_v4().to_string().into_bytes(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn try_lock(&self) -> Result<bool> {
        let txn = StoreTxn::new()
            .when(Compare::KeyMissing(self.key.clone()))
            .and_then(TxnOp::put_with_lease(
                self.key.clone(),
                self.token.clone(),
                self.session.lease(),
            ));
        Ok(self.store.txn(txn).await?.succeeded)
    }

    pub async fn lock(&self, timeout: Duration) -> Result<()> {
        if self.session.is_closed() {
            return Err(Error::SessionClosed);
        }
        match tokio::time::timeout(timeout, self.acquire()).await {
            Ok(result) => result,
            Err(_) => {
                debug!(key = %self.key, "timeout: failed to obtain lock");
                Err(Error::LockTimeout {
                    id: self.id.clone(),
                })
            }
        }
    }

    async fn acquire(&self) -> Result<()> {
        loop {
            if self.try_lock().await? {
                debug!(key = %self.key, "lock obtained");
                return Ok(());
            }

            let current = self.store.get(&self.key).await?;
            let holder = match current.first() {
                Some(kv) => kv,
                None => continue,
            };
            if holder.value == self.token {
                return Ok(());
            }

            let mut watch = self
                .store
                .watch(&self.key, WatchOptions::key().from_revision(current.revision + 1))
                .await?;
            while let Some(event) = watch.next().await {
                if event.kind == EventType::Delete {
                    break;
                }
            }
        }
    }

    pub async fn unlock(&self) -> Result<()> {
        let txn = StoreTxn::new()
            .when(Compare::ValueEquals(self.key.clone(), self.token.clone()))
            .and_then(TxnOp::delete(self.key.clone()));
        if self.store.txn(txn).await?.succeeded {
            debug!(key = %self.key, "lock unlocked");
            Ok(())
        } else {
            Err(Error::LockNotHeld(self.id.clone()))
        }
    }
}

/// The set of locks held by one caller. An id maps to `None` while its
/// acquisition is in flight.
pub struct Locks {
    store: Arc<dyn Store>,
    session: Arc<Session>,
    timeout: Duration,
    held: Mutex<HashMap<String, Option<Arc<DistributedMutex>>>>,
}

/// Drops an in-flight reservation unless the lock was obtained.
struct Reservation<'a> {
    held: &'a Mutex<HashMap<String, Option<Arc<DistributedMutex>>>>,
    id: &'a str,
    armed: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut held = self.held.lock();
        if matches!(held.get(self.id), Some(None)) {
            held.remove(self.id);
        }
    }
}

impl Locks {
    pub fn new(store: Arc<dyn Store>, session: Arc<Session>, timeout: Duration) -> Self {
        Self {
            store,
            session,
            timeout,
            held: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire `id`. Locking an id this set already holds, or is already
    /// acquiring, is `LockExists`.
    pub async fn lock(&self, id: &str) -> Result<()> {
        {
            let mut held = self.held.lock();
            if held.contains_key(id) {
                return Err(Error::LockExists(id.to_string()));
            }
            held.insert(id.to_string(), None);
        }
        let mut reservation = Reservation {
            held: &self.held,
            id,
            armed: true,
        };

        let mutex = Arc::new(DistributedMutex::new(
            self.store.clone(),
            self.session.clone(),
            id,
        ));
        debug!(lock = id, "attempting to lock");
        mutex.lock(self.timeout).await?;

        self.held.lock().insert(id.to_string(), Some(mutex));
        reservation.armed = false;
        Ok(())
    }

    pub async fn unlock(&self, id: &str) -> Result<()> {
        let mutex = {
            let mut held = self.held.lock();
            match held.get(id) {
                Some(Some(_)) => held.remove(id).flatten(),
                _ => None,
            }
        };
        match mutex {
            Some(m) => m.unlock().await,
            None => Err(Error::LockNotHeld(id.to_string())),
        }
    }

    /// Release everything held. Failures are logged, never returned.
    pub async fn unlock_all(&self) {
        let drained: Vec<Arc<DistributedMutex>> = {
            let mut held = self.held.lock();
            let ids: Vec<String> = held
                .iter()
                .filter(|(_, m)| m.is_some())
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| held.remove(id).flatten()).collect()
        };
        for mutex in drained {
            if let Err(e) = mutex.unlock().await {
                warn!(lock = mutex.id(), error = %e, "unlock failed");
            }
        }
    }

    pub fn held_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .held
            .lock()
            .iter()
            .filter(|(_, m)| m.is_some())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn is_empty(&self) -> bool {
        !self.held.lock().values().any(Option::is_some)
    }
}
