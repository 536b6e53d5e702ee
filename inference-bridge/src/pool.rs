//! Bounded pool of open classification clients
//!
//! A message borrows one client for the duration of its classify call and
//! hands it back when the [`PooledClient`] guard drops. Clients that saw a
//! transport-level failure are discarded instead of returned, so the next
//! borrower opens a fresh connection.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use crate::client::{Classifier, Connector};
use crate::error::BridgeError;

/// Default number of clients that may be borrowed at once
pub const DEFAULT_POOL_SIZE: usize = 4;

/// Pool of clients produced by a [`Connector`]
pub struct ClientPool<C: Connector> {
    connector: C,
    idle: Mutex<Vec<C::Client>>,
    permits: Arc<Semaphore>,
    closed: AtomicBool,
    max_size: usize,
}

impl<C: Connector> ClientPool<C> {
    pub fn new(connector: C, max_size: usize) -> Self {
        let max_size = max_size.max(1);
        info!(endpoint = %connector.endpoint(), max_size, "Client pool created");
        Self {
            connector,
            idle: Mutex::new(Vec::with_capacity(max_size)),
            permits: Arc::new(Semaphore::new(max_size)),
            closed: AtomicBool::new(false),
            max_size,
        }
    }

    /// Borrow a client, opening a new connection if none is idle.
    ///
    /// Waits while `max_size` clients are already borrowed.
    pub async fn acquire(&self) -> Result<PooledClient<'_, C>, BridgeError> {
        if self.is_closed() {
            return Err(BridgeError::PoolClosed);
        }

        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BridgeError::PoolClosed)?;

        let reused = self.lock_idle().pop();
        let client = match reused {
            Some(client) if client.is_open() => client,
            _ => {
                let client = self.connector.connect().await?;
                metrics::counter!(crate::metrics::POOL_CONNECTIONS_OPENED).increment(1);
                debug!(endpoint = %self.connector.endpoint(), "Opened pooled client");
                client
            }
        };

        Ok(PooledClient {
            pool: self,
            client: Some(client),
            healthy: true,
            _permit: permit,
        })
    }

    /// Close all idle clients and refuse further borrows.
    ///
    /// Clients still borrowed are closed when their guards drop.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.permits.close();

        let mut idle = std::mem::take(&mut *self.lock_idle());
        for client in &mut idle {
            client.close();
        }
        info!(endpoint = %self.connector.endpoint(), closed = idle.len(), "Client pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of open clients waiting to be borrowed
    pub fn idle_count(&self) -> usize {
        self.lock_idle().len()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn endpoint(&self) -> String {
        self.connector.endpoint()
    }

    fn lock_idle(&self) -> std::sync::MutexGuard<'_, Vec<C::Client>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn give_back(&self, mut client: C::Client, healthy: bool) {
        if !healthy || self.is_closed() || !client.is_open() {
            client.close();
            debug!(endpoint = %self.connector.endpoint(), healthy, "Discarded pooled client");
            return;
        }
        self.lock_idle().push(client);
    }
}

/// A borrowed client; returned to its pool on drop
pub struct PooledClient<'a, C: Connector> {
    pool: &'a ClientPool<C>,
    client: Option<C::Client>,
    healthy: bool,
    _permit: OwnedSemaphorePermit,
}

impl<C: Connector> PooledClient<'_, C> {
    /// Close the client instead of returning it to the pool.
    pub fn discard(&mut self) {
        self.healthy = false;
    }
}

impl<C: Connector> Deref for PooledClient<'_, C> {
    type Target = C::Client;

    fn deref(&self) -> &Self::Target {
        // Only `Drop` takes the client out
        self.client.as_ref().unwrap_or_else(|| unreachable!("client taken before drop"))
    }
}

impl<C: Connector> DerefMut for PooledClient<'_, C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.client.as_mut().unwrap_or_else(|| unreachable!("client taken before drop"))
    }
}

impl<C: Connector> Drop for PooledClient<'_, C> {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            self.pool.give_back(client, self.healthy);
        }
    }
}
