//! Connection lifecycle with automatic reconnection
//!
//! A [`ConnectionManager`] owns the single shared connection of a client and
//! moves it through three states:
//!
//! ```text
//!              connect()                 driver ok
//! Disconnected ─────────► Connecting ─────────────► Connected
//!      ▲                     │                          │
//!      │   driver error      │        close notice      │
//!      └─────────────────────┴──────────────────────────┘
//! ```
//!
//! At most one low-level connect attempt is in flight: callers arriving while
//! the manager is `Connecting` join the pending attempt and receive its outcome.
//! A failed attempt schedules another one after `reconnect_timeout`; retries
//! continue at that fixed interval, without limit, until one succeeds. Callers
//! that need a bound wrap `connect()` in `tokio::time::timeout`.

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;

use gyro_common::GyroError;

use crate::config::ClientConfig;
use crate::driver::{Driver, DriverDatabase, DriverNotice};
use crate::events::{ConnectionEvent, EventBus};
use crate::Result;

/// Observable state of the managed connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

type PendingConnect = Shared<BoxFuture<'static, Result<Arc<dyn DriverDatabase>>>>;

enum Slot {
    Disconnected,
    Connecting(PendingConnect),
    Connected(Arc<dyn DriverDatabase>),
}

struct ManagerState {
    slot: Slot,
    /// Bumped on every established connection; notices from older ones are ignored
    generation: u64,
    /// Connection lost to a close notice, kept until the driver reports it back
    lost: Option<Arc<dyn DriverDatabase>>,
    retry_pending: bool,
    established: bool,
}

struct ManagerInner {
    config: ClientConfig,
    driver: Arc<dyn Driver>,
    events: EventBus,
    state: Mutex<ManagerState>,
    attempts: AtomicU64,
}

/// Owner of the shared connection of a client
///
/// Cloning is cheap and every clone manages the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("address", &self.inner.config.address)
            .field("state", &self.state())
            .field("attempts", &self.connect_attempts())
            .finish()
    }
}

impl ConnectionManager {
    /// Create a manager; nothing is connected until the first `connect()`
    pub fn new(config: ClientConfig, driver: Arc<dyn Driver>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                driver,
                events: EventBus::new(),
                state: Mutex::new(ManagerState {
                    slot: Slot::Disconnected,
                    generation: 0,
                    lost: None,
                    retry_pending: false,
                    established: false,
                }),
                attempts: AtomicU64::new(0),
            }),
        }
    }

    /// Return the live connection, establishing it if necessary
    pub async fn connect(&self) -> Result<Arc<dyn DriverDatabase>> {
        self.inner.connect().await
    }

    /// Current state of the connection
    pub fn state(&self) -> ConnectionState {
        match self.inner.state.lock().slot {
            Slot::Disconnected => ConnectionState::Disconnected,
            Slot::Connecting(_) => ConnectionState::Connecting,
            Slot::Connected(_) => ConnectionState::Connected,
        }
    }

    /// Number of low-level connect attempts made so far
    pub fn connect_attempts(&self) -> u64 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Lifecycle event registry
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Configuration the manager was created with
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }
}

impl ManagerInner {
    async fn connect(self: &Arc<Self>) -> Result<Arc<dyn DriverDatabase>> {
        let pending = {
            let mut state = self.state.lock();
            let in_flight = match &state.slot {
                Slot::Connected(connection) => return Ok(connection.clone()),
                Slot::Connecting(pending) => Some(pending.clone()),
                Slot::Disconnected => None,
            };

            match in_flight {
                Some(pending) => {
                    tracing::debug!(address = %self.config.address, "joining in-flight connection attempt");
                    pending
                }
                None => {
                    let pending = self.start_attempt();
                    state.lost = None;
                    state.slot = Slot::Connecting(pending.clone());
                    pending
                }
            }
        };

        pending.await
    }

    /// Spawn the attempt so that it completes even if every caller goes away
    fn start_attempt(self: &Arc<Self>) -> PendingConnect {
        let handle = tokio::spawn(Self::attempt(self.clone()));
        let inner = self.clone();

        async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(join_error) => {
                    let error = GyroError::Internal(format!("connection attempt aborted: {}", join_error));
                    inner.fail(error.clone());
                    Err(error)
                }
            }
        }
        .boxed()
        .shared()
    }

    async fn attempt(self: Arc<Self>) -> Result<Arc<dyn DriverDatabase>> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let address = self.config.address.clone();
        tracing::info!(address = %address, attempt, "connecting to mongodb");

        match self.driver.connect(&address, &self.config.driver_options).await {
            Ok(connection) => {
                let (generation, reconnected) = {
                    let mut state = self.state.lock();
                    state.generation += 1;
                    state.slot = Slot::Connected(connection.clone());
                    let reconnected = state.established;
                    state.established = true;
                    (state.generation, reconnected)
                };

                self.watch(connection.notices(), generation);
                tracing::info!(address = %address, attempt, "connected to mongodb");
                self.events.emit(&ConnectionEvent::Connect { address: address.clone() });
                if reconnected {
                    self.events.emit(&ConnectionEvent::Reconnect { address });
                }
                Ok(connection)
            }
            Err(error) => {
                tracing::warn!(address = %address, attempt, error = %error, "failed to connect to mongodb");
                self.fail(error.clone());
                Err(error)
            }
        }
    }

    fn fail(self: &Arc<Self>, error: GyroError) {
        self.state.lock().slot = Slot::Disconnected;
        self.events.emit(&ConnectionEvent::Error { error });
        self.schedule_reconnect();
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.retry_pending {
                return;
            }
            state.retry_pending = true;
        }

        let delay = self.config.reconnect_timeout();
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            inner.state.lock().retry_pending = false;
            tracing::info!(address = %inner.config.address, "attempting to reconnect to mongodb");
            // Failures were already reported by the attempt and schedule the next retry.
            let _ = inner.connect().await;
        });
    }

    fn watch(self: &Arc<Self>, mut notices: broadcast::Receiver<DriverNotice>, generation: u64) {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let notice = match notices.recv().await {
                    Ok(notice) => notice,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "lagged behind connection notices");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if !inner.handle_notice(notice, generation) {
                    break;
                }
            }
        });
    }

    /// Apply a driver notice; returns false once the connection was superseded
    fn handle_notice(&self, notice: DriverNotice, generation: u64) -> bool {
        let event = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.generation != generation {
                return false;
            }

            match notice {
                DriverNotice::Close => match std::mem::replace(&mut state.slot, Slot::Disconnected) {
                    Slot::Connected(connection) => {
                        state.lost = Some(connection);
                        Some(ConnectionEvent::Close {
                            address: self.config.address.clone(),
                        })
                    }
                    other => {
                        state.slot = other;
                        None
                    }
                },
                DriverNotice::Reconnect => {
                    let restorable = matches!(state.slot, Slot::Disconnected);
                    match state.lost.take() {
                        Some(connection) if restorable => {
                            state.slot = Slot::Connected(connection);
                            Some(ConnectionEvent::Reconnect {
                                address: self.config.address.clone(),
                            })
                        }
                        lost => {
                            state.lost = lost;
                            None
                        }
                    }
                }
            }
        };

        if let Some(event) = event {
            tracing::info!(address = %self.config.address, event = event.event_type(), "mongodb connection notice");
            self.events.emit(&event);
        }
        true
    }
}
