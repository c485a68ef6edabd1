//! Persistent broker connection with on-demand reconnection.

use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::brokers::{BrokerChannel, BrokerConnection, BrokerConnector};
use crate::error::{EventBusError, Result};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

struct Slot {
    state: ConnectionState,
    connection: Option<Arc<dyn BrokerConnection>>,
    // Bumped on every (re)connect so stale fault callbacks are ignored
    generation: u64,
}

/// Owns the single logical connection of a service.
///
/// The connection is shared by every publisher and by the consumer; each
/// caller multiplexes its own short-lived channel over it. Only the
/// reconnect transition is serialised.
pub struct PersistentConnection {
    connector: Arc<dyn BrokerConnector>,
    retry: RetryPolicy,
    slot: Arc<RwLock<Slot>>,
    connect_lock: Mutex<()>,
}

impl PersistentConnection {
    pub fn new(connector: Arc<dyn BrokerConnector>, retry: RetryPolicy) -> Self {
        Self {
            connector,
            retry,
            slot: Arc::new(RwLock::new(Slot {
                state: ConnectionState::Disconnected,
                connection: None,
                generation: 0,
            })),
            connect_lock: Mutex::new(()),
        }
    }

    /// True only while a broker connection is open.
    pub fn is_connected(&self) -> bool {
        let slot = self.slot.read();
        slot.state == ConnectionState::Connected
            && slot.connection.as_ref().is_some_and(|c| c.is_open())
    }

    pub fn state(&self) -> ConnectionState {
        self.slot.read().state
    }

    /// Log-safe description of the broker endpoint.
    pub fn describe(&self) -> String {
        self.connector.describe()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Connects if not connected, retrying with backoff.
    ///
    /// Concurrent callers wait for the attempt in flight and observe its
    /// outcome instead of opening a second connection.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::Connection`] once the retry budget is spent.
    pub async fn try_connect(&self) -> Result<()> {
        self.connect_with(&self.retry).await
    }

    /// Single connection attempt, for callers running their own retry loop.
    pub(crate) async fn try_connect_once(&self) -> Result<()> {
        self.connect_with(&RetryPolicy::immediate(1)).await
    }

    async fn connect_with(&self, policy: &RetryPolicy) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        let _guard = self.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        self.slot.write().state = ConnectionState::Connecting;
        let endpoint = self.connector.describe();
        debug!(endpoint = %endpoint, "Connecting to broker");

        match policy
            .execute("connect", |_| self.connector.connect())
            .await
        {
            Ok(connection) => {
                self.install(connection);
                info!(endpoint = %endpoint, "Acquired persistent broker connection");
                Ok(())
            }
            Err(e) => {
                let mut slot = self.slot.write();
                slot.state = ConnectionState::Disconnected;
                slot.connection = None;
                error!(endpoint = %endpoint, error = %e, "Could not connect to broker");
                Err(e)
            }
        }
    }

    fn install(&self, connection: Arc<dyn BrokerConnection>) {
        let generation = {
            let mut slot = self.slot.write();
            slot.generation += 1;
            slot.state = ConnectionState::Connected;
            slot.connection = Some(connection.clone());
            slot.generation
        };

        let weak: Weak<RwLock<Slot>> = Arc::downgrade(&self.slot);
        connection.on_fault(Box::new(move |reason| {
            let Some(slot) = weak.upgrade() else {
                return;
            };
            let mut slot = slot.write();
            if slot.generation != generation {
                return;
            }
            warn!(reason = %reason, "Broker connection lost, will reconnect on next use");
            slot.state = ConnectionState::Disconnected;
            slot.connection = None;
        }));
    }

    /// Opens a fresh channel on the current connection.
    ///
    /// # Errors
    ///
    /// Fails with [`EventBusError::Connection`] when not connected; call
    /// [`try_connect`](Self::try_connect) first.
    pub async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let connection = {
            let slot = self.slot.read();
            match (&slot.state, &slot.connection) {
                (ConnectionState::Connected, Some(c)) if c.is_open() => c.clone(),
                _ => {
                    return Err(EventBusError::Connection(
                        "no open broker connection".into(),
                    ))
                }
            }
        };
        connection.create_channel().await
    }

    /// Releases the connection. A later `try_connect` opens a new one.
    pub async fn close(&self) -> Result<()> {
        let connection = {
            let mut slot = self.slot.write();
            slot.generation += 1;
            slot.state = ConnectionState::Disconnected;
            slot.connection.take()
        };
        if let Some(connection) = connection {
            debug!("Closing broker connection");
            connection.close().await?;
        }
        Ok(())
    }
}
