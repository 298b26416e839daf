use super::{LeaseId, Store};
use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A lease kept alive for the lifetime of the process.
///
/// Keys written with [`Session::lease`] vanish when the session is closed or
/// when the process stops refreshing it for longer than the TTL.
pub struct Session {
    store: Arc<dyn Store>,
    lease: LeaseId,
    ttl: Duration,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl Session {
    pub async fn new(store: Arc<dyn Store>, ttl: Duration) -> Result<Arc<Self>> {
        let lease = store.grant_lease(ttl).await?;
        let cancel = CancellationToken::new();

        let keepalive_store = store.clone();
        let token = cancel.clone();
        tokio::spawn(async move {
            let interval = (ttl / 3).max(Duration::from_millis(10));
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        match keepalive_store.keep_alive(lease).await {
                            Ok(()) => {}
                            Err(Error::LeaseNotFound(_)) => {
                                warn!(lease, "Session lease lost");
                                token.cancel();
                                break;
                            }
                            Err(e) => warn!(lease, error = %e, "Lease keep-alive failed"),
                        }
                    }
                }
            }
            debug!(lease, "Session keep-alive stopped");
        });

        Ok(Arc::new(Self {
            store,
            lease,
            ttl,
            cancel,
            closed: AtomicBool::new(false),
        }))
    }

    pub fn lease(&self) -> LeaseId {
        self.lease
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.cancel.is_cancelled()
    }

    /// Resolves once the session is closed or its lease is lost.
    pub async fn done(&self) {
        self.cancel.cancelled().await
    }

    /// Stop keep-alives and revoke the lease. Idempotent.
    pub async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match self.store.revoke_lease(self.lease).await {
            Ok(()) | Err(Error::LeaseNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_session_keeps_lease_alive() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let session = Session::new(store.clone(), Duration::from_millis(60))
            .await
            .unwrap();
        store
            .put("k", b"v".to_vec(), Some(session.lease()))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.get("k").await.unwrap().kvs.len(), 1);

        session.close().await.unwrap();
        assert!(session.is_closed());
        assert!(store.get("k").await.unwrap().kvs.is_empty());
        // second close is a no-op
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_session_notices_lost_lease() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let session = Session::new(store.clone(), Duration::from_millis(30))
            .await
            .unwrap();
        store.revoke_lease(session.lease()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), session.done())
            .await
            .unwrap();
        assert!(session.is_closed());
    }
}
