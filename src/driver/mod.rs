//! Device drivers.
//!
//! A [`DeviceDriver`] owns one live connection to one device and knows how
//! to run commands and move files over it. Three families exist:
//!
//! - [`exec::ExecDriver`]: one SSH exec channel per command (JunOS).
//! - [`expect::ExpectDriver`] over an SSH shell ([`stream::SshShellConnector`]).
//! - [`expect::ExpectDriver`] over telnet ([`telnet::TelnetConnector`]).
//!
//! [`memory::MemoryDriver`] simulates a device in process.
//!
//! Drivers are created by a [`DriverFactory`]; the session cache never
//! constructs them directly.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{AgentConfig, Timeouts};
use crate::credential::Credential;
use crate::device::{ConnectMethod, DeviceDescriptor, DeviceType};
use crate::error::AgentError;
use crate::templates::{self, DriverTemplate};

pub mod exec;
pub mod expect;
pub mod memory;
pub mod security;
pub mod ssh;
pub mod stream;
pub mod telnet;

pub use security::{ConnectionSecurityOptions, SecurityLevel};

/// Operations a driver may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Capability {
    Execute,
    GetFile,
    PutFile,
}

/// The set of operations a driver supports.
pub type Capabilities = BTreeSet<Capability>;

/// One live connection to a device.
///
/// Implementations are used by one caller at a time; the session cache
/// serialises access.
#[async_trait]
pub trait DeviceDriver: Send {
    /// Short driver name used in errors and logs.
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// Establishes the connection and completes login.
    async fn connect(
        &mut self,
        address: &str,
        credential: &Credential,
        timeout: Duration,
    ) -> Result<(), AgentError>;

    /// Runs `command` in `mode` (the device's default mode when `None`).
    async fn execute(&mut self, command: &str, mode: Option<&str>) -> Result<Vec<u8>, AgentError>;

    async fn get_file(&mut self, source: &str, mode: Option<&str>) -> Result<Vec<u8>, AgentError> {
        let _ = (source, mode);
        Err(AgentError::UnsupportedOperation(format!(
            "{} cannot get files",
            self.name()
        )))
    }

    async fn put_file(
        &mut self,
        destination: &str,
        data: &[u8],
        mode: Option<&str>,
    ) -> Result<(), AgentError> {
        let _ = (destination, data, mode);
        Err(AgentError::UnsupportedOperation(format!(
            "{} cannot put files",
            self.name()
        )))
    }

    /// Closes the connection. Safe to call more than once.
    async fn disconnect(&mut self);

    fn is_alive(&self) -> bool;
}

/// Creates unconnected drivers for devices.
pub trait DriverFactory: Send + Sync {
    fn create(
        &self,
        device: &DeviceDescriptor,
        credential: &Credential,
    ) -> Result<Box<dyn DeviceDriver>, AgentError>;

    fn timeouts(&self, device_type: DeviceType) -> Timeouts;
}

/// Factory selecting a driver from the device type's template and the
/// credential's connect method.
pub struct DefaultDriverFactory {
    config: Arc<AgentConfig>,
    security: ConnectionSecurityOptions,
}

impl DefaultDriverFactory {
    pub fn new(config: Arc<AgentConfig>) -> Self {
        let security = ConnectionSecurityOptions::from_options(&config.options);
        Self { config, security }
    }
}

impl DriverFactory for DefaultDriverFactory {
    fn create(
        &self,
        device: &DeviceDescriptor,
        credential: &Credential,
    ) -> Result<Box<dyn DeviceDriver>, AgentError> {
        let device_type = device.device_type;
        let timeouts = self.config.timeouts_for(device_type);
        let port = self.config.port_for(device_type);
        match templates::template_for(device_type)? {
            DriverTemplate::Exec => {
                if credential.connect_method == Some(ConnectMethod::Telnet) {
                    return Err(AgentError::UnsupportedOperation(format!(
                        "{device_type} devices cannot be reached over telnet"
                    )));
                }
                Ok(Box::new(exec::ExecDriver::new(
                    self.security.clone(),
                    timeouts,
                    port,
                )))
            }
            DriverTemplate::Expect(dialect) => {
                let method = credential
                    .connect_method
                    .unwrap_or(dialect.default_connect_method);
                if !dialect.connect_methods.contains(&method) {
                    return Err(AgentError::UnsupportedOperation(format!(
                        "{} does not support {method}",
                        dialect.name
                    )));
                }
                let connector: Box<dyn stream::StreamConnector> = match method {
                    ConnectMethod::Ssh => {
                        Box::new(stream::SshShellConnector::new(self.security.clone(), port))
                    }
                    ConnectMethod::Telnet => Box::new(telnet::TelnetConnector::new(port)),
                };
                let auto_enable = credential
                    .auto_enable
                    .or_else(|| self.config.auto_enable_for(device_type))
                    .unwrap_or(dialect.auto_enable);
                Ok(Box::new(expect::ExpectDriver::new(
                    Arc::new(dialect),
                    connector,
                    timeouts,
                    auto_enable,
                )))
            }
        }
    }

    fn timeouts(&self, device_type: DeviceType) -> Timeouts {
        self.config.timeouts_for(device_type)
    }
}
