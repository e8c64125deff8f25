//! Event-stream connection lifecycle.
//!
//! ```text
//! Disconnected --connect()--> Connecting --ok--> Connected
//! Connecting --retries exhausted--> Disconnected (fatal to the caller)
//! Connected --on_disconnected()--> Reconnecting --ok--> Connected
//! Reconnecting --retries exhausted--> Disconnected (terminal until restart)
//! ```
use std::{fmt::Display, sync::Arc, time::Duration};

use gateway::{GatewayError, GatewayService};
use log::{debug, error, info, warn};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{sleep, timeout},
};

use crate::error::SupervisorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Reconnecting => "Reconnecting",
        };
        write!(f, "{state}")
    }
}

/// Bounded linear backoff: one initial attempt, then up to `max_retries`
/// retries, retry `k` waiting `min(step * k, cap)` first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub step: Duration,
    pub cap: Duration,
    /// Wait before the first attempt.
    pub pre_delay: Duration,
}

impl RetryPolicy {
    pub const fn initial_connect() -> Self {
        Self {
            max_retries: 5,
            step: Duration::from_secs(30),
            cap: Duration::from_secs(120),
            pre_delay: Duration::ZERO,
        }
    }

    pub const fn reconnect() -> Self {
        Self {
            max_retries: 5,
            step: Duration::from_secs(15),
            cap: Duration::from_secs(60),
            pre_delay: Duration::from_secs(5),
        }
    }

    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        self.step.saturating_mul(retry).min(self.cap)
    }
}

/// Read-only view of the connection state, cheap to clone.
#[derive(Clone, Debug)]
pub struct ConnectionStatus {
    rx: watch::Receiver<ConnectionState>,
}

impl From<watch::Receiver<ConnectionState>> for ConnectionStatus {
    fn from(rx: watch::Receiver<ConnectionState>) -> Self {
        Self { rx }
    }
}

impl ConnectionStatus {
    pub fn current(&self) -> ConnectionState {
        *self.rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.current() == ConnectionState::Connected
    }

    /// Fail fast with the current state unless connected.
    pub fn ensure_connected(&self) -> Result<(), ConnectionState> {
        match self.current() {
            ConnectionState::Connected => Ok(()),
            other => Err(other),
        }
    }

    /// Wait up to `limit` for the state to become Connected.
    pub async fn wait_until_connected(&self, limit: Duration) -> bool {
        let mut rx = self.rx.clone();
        let connected = timeout(limit, rx.wait_for(|s| *s == ConnectionState::Connected))
            .await
            .is_ok_and(|waited| waited.is_ok());
        connected
    }
}

pub struct ConnectionSupervisor<G> {
    gateway: Arc<G>,
    state: watch::Sender<ConnectionState>,
    connect_policy: RetryPolicy,
    reconnect_policy: RetryPolicy,
}

impl<G: GatewayService> ConnectionSupervisor<G> {
    pub fn new(gateway: Arc<G>) -> Self {
        Self::with_policies(
            gateway,
            RetryPolicy::initial_connect(),
            RetryPolicy::reconnect(),
        )
    }

    pub fn with_policies(
        gateway: Arc<G>,
        connect_policy: RetryPolicy,
        reconnect_policy: RetryPolicy,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            gateway,
            state,
            connect_policy,
            reconnect_policy,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus::from(self.state.subscribe())
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Establish the event stream, retrying with backoff. Exhaustion is
    /// returned to the caller, who should treat it as fatal.
    pub async fn connect(&self) -> Result<(), SupervisorError> {
        let started = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(SupervisorError::AlreadyActive(self.state()));
        }

        info!("Connecting to gateway");
        match self.establish(&self.connect_policy).await {
            Ok(attempts) => {
                self.state.send_replace(ConnectionState::Connected);
                info!("Gateway connected after {attempts} attempt(s)");
                Ok(())
            }
            Err((attempts, source)) => {
                self.state.send_replace(ConnectionState::Disconnected);
                error!("Gateway connect failed after {attempts} attempts: {source}");
                Err(SupervisorError::ConnectExhausted { attempts, source })
            }
        }
    }

    /// React to a dropped stream. Only a drop from Connected schedules a
    /// reconnect; the returned task runs detached and may be ignored.
    pub fn on_disconnected(self: &Arc<Self>, cause: &str) -> Option<JoinHandle<()>> {
        let moved = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Connected {
                *state = ConnectionState::Reconnecting;
                true
            } else {
                false
            }
        });
        if !moved {
            debug!("Ignoring disconnect while {}: {cause}", self.state());
            return None;
        }

        warn!(
            "Gateway connection lost: {cause}; reconnecting in {:?}",
            self.reconnect_policy.pre_delay
        );
        let supervisor = Arc::clone(self);
        Some(tokio::spawn(async move {
            supervisor.reconnect().await;
        }))
    }

    async fn reconnect(&self) {
        match self.establish(&self.reconnect_policy).await {
            Ok(attempts) => {
                self.state.send_replace(ConnectionState::Connected);
                info!("Gateway reconnected after {attempts} attempt(s)");
            }
            Err((attempts, source)) => {
                self.state.send_replace(ConnectionState::Disconnected);
                error!(
                    "Gateway reconnect abandoned after {attempts} attempts: {source}. \
                     Restart required"
                );
            }
        }
    }

    async fn establish(&self, policy: &RetryPolicy) -> Result<u32, (u32, GatewayError)> {
        if !policy.pre_delay.is_zero() {
            sleep(policy.pre_delay).await;
        }

        let mut retry = 0;
        loop {
            match self.gateway.connect().await {
                Ok(()) => return Ok(retry + 1),
                Err(e) if retry >= policy.max_retries => return Err((retry + 1, e)),
                Err(e) => {
                    retry += 1;
                    let delay = policy.delay_for_retry(retry);
                    if e.is_transient() {
                        warn!("Gateway connect attempt {retry} failed: {e}; retrying in {delay:?}");
                    } else {
                        error!(
                            "Gateway connect attempt {retry} rejected: {e}; retrying in {delay:?}"
                        );
                    }
                    sleep(delay).await;
                }
            }
        }
    }
}
