//! Device session cache.
//!
//! The [`SessionManager`] keeps at most one live [`Session`] per device,
//! reuses it across requests, evicts it once it has been idle for the
//! device type's idle timeout, and absorbs one transient transport failure
//! per request by reconnecting.
//!
//! # Main Components
//!
//! - [`SessionManager`] - owns the per-device slots and the retry policy
//! - [`SessionGuard`] - exclusive use of one session; releasing it marks
//!   the session idle again
//! - [`Operation`] / [`Outcome`] - the driver calls a request can make

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, error, warn};
use moka::future::Cache;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::AgentConfig;
use crate::credential::{Credential, CredentialStore};
use crate::device::DeviceDescriptor;
use crate::driver::{DeviceDriver, DriverFactory};
use crate::error::AgentError;
use crate::inventory::Inventory;

mod manager;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Connecting,
    IdleReady,
    Busy,
    Closing,
    Closed,
}

/// A live, driver-backed connection to one device.
pub struct Session {
    device: DeviceDescriptor,
    state: SessionState,
    driver: Option<Box<dyn DeviceDriver>>,
    credential: Option<Arc<Credential>>,
    address: Option<String>,
    last_active: Instant,
}

impl Session {
    fn new(device: DeviceDescriptor) -> Self {
        Self {
            device,
            state: SessionState::Connecting,
            driver: None,
            credential: None,
            address: None,
            last_active: Instant::now(),
        }
    }

    pub fn device(&self) -> &DeviceDescriptor {
        &self.device
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Address the driver is connected to.
    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn last_active(&self) -> Instant {
        self.last_active
    }

    /// Disconnects the driver (if any) and marks the session closed.
    async fn close(&mut self) {
        self.state = SessionState::Closing;
        if let Some(mut driver) = self.driver.take() {
            driver.disconnect().await;
        }
        self.credential = None;
        self.address = None;
        self.state = SessionState::Closed;
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("device", &self.device.name)
            .field("state", &self.state)
            .field("driver", &self.driver.as_ref().map(|d| d.name().to_string()))
            .field("address", &self.address)
            .finish()
    }
}

/// Cache entry for one device.
///
/// The mutex serialises every user of the device's CLI; `killed` is set by
/// [`SessionManager::kill_all`] so that a session in use is torn down when
/// its guard is released. A killed slot stays cached until then.
struct SessionSlot {
    session: Arc<Mutex<Session>>,
    killed: AtomicBool,
}

impl SessionSlot {
    fn new(device: DeviceDescriptor) -> Self {
        Self {
            session: Arc::new(Mutex::new(Session::new(device))),
            killed: AtomicBool::new(false),
        }
    }

    fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }
}

/// Exclusive use of a session.
///
/// Dropping the guard releases the session: it becomes idle again and its
/// `last_active` timestamp is refreshed.
pub struct SessionGuard {
    session: Option<OwnedMutexGuard<Session>>,
    slot: Arc<SessionSlot>,
}

impl SessionGuard {
    fn session(&self) -> &Session {
        self.session
            .as_deref()
            .unwrap_or_else(|| unreachable!("session guard used after release"))
    }

    fn session_mut(&mut self) -> &mut Session {
        self.session
            .as_deref_mut()
            .unwrap_or_else(|| unreachable!("session guard used after release"))
    }

    pub fn device(&self) -> &DeviceDescriptor {
        &self.session().device
    }

    pub fn state(&self) -> SessionState {
        self.session().state
    }

    pub fn address(&self) -> Option<&str> {
        self.session().address()
    }

    /// The connected driver.
    pub fn driver(&mut self) -> Result<&mut dyn DeviceDriver, AgentError> {
        let name = self.session().device.name.clone();
        match self.session_mut().driver.as_deref_mut() {
            Some(driver) => Ok(driver),
            None => Err(AgentError::Internal(format!("session for {name} has no driver"))),
        }
    }

    /// Runs `operation` on the session's driver.
    pub async fn perform(&mut self, operation: &Operation) -> Result<Outcome, AgentError> {
        let driver = self.driver()?;
        operation.perform(driver).await
    }
}

impl fmt::Debug for SessionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.session.as_deref() {
            Some(session) => f.debug_tuple("SessionGuard").field(session).finish(),
            None => f.write_str("SessionGuard(released)"),
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        if !self.slot.is_killed() {
            if session.state == SessionState::Busy {
                session.state = SessionState::IdleReady;
                session.last_active = Instant::now();
            }
            return;
        }
        // The slot stays cached and locked until the driver is gone, so
        // callers queued on it cannot open a second session meanwhile.
        session.state = SessionState::Closing;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    session.close().await;
                    debug!("{}: killed session disconnected after release", session.device.name);
                });
            }
            Err(_) => {
                session.driver = None;
                session.state = SessionState::Closed;
            }
        }
    }
}

/// A driver call made on behalf of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Command {
        command: String,
        mode: Option<String>,
    },
    GetConfig {
        source: String,
        mode: Option<String>,
    },
    SetConfig {
        destination: String,
        data: Vec<u8>,
        mode: Option<String>,
    },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Command { .. } => "command",
            Operation::GetConfig { .. } => "get_config",
            Operation::SetConfig { .. } => "set_config",
        }
    }

    async fn perform(&self, driver: &mut dyn DeviceDriver) -> Result<Outcome, AgentError> {
        match self {
            Operation::Command { command, mode } => driver
                .execute(command, mode.as_deref())
                .await
                .map(Outcome::Bytes),
            Operation::GetConfig { source, mode } => driver
                .get_file(source, mode.as_deref())
                .await
                .map(Outcome::Bytes),
            Operation::SetConfig {
                destination,
                data,
                mode,
            } => driver
                .put_file(destination, data, mode.as_deref())
                .await
                .map(|()| Outcome::Ack),
        }
    }
}

/// Result of a successful [`Operation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Bytes(Vec<u8>),
    Ack,
}

/// Owns the per-device sessions of one agent.
pub struct SessionManager {
    cache: Cache<String, Arc<SessionSlot>>,
    config: Arc<AgentConfig>,
    inventory: Arc<Inventory>,
    credentials: RwLock<Arc<CredentialStore>>,
    factory: Arc<dyn DriverFactory>,
}
