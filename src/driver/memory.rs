//! In-memory devices for dry runs, demos and tests.
//!
//! A [`MemoryDevice`] answers commands from a table, stores files written
//! to it and can be told to fail the next few operations. The
//! [`MemoryDriverFactory`] hands every session of a device the same
//! `MemoryDevice`, so state survives reconnects the way a real device's
//! configuration does.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use log::trace;

use super::{Capabilities, Capability, DeviceDriver, DriverFactory};
use crate::config::Timeouts;
use crate::credential::Credential;
use crate::device::{DeviceDescriptor, DeviceType};
use crate::error::AgentError;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State of one simulated device.
#[derive(Default)]
pub struct MemoryDevice {
    responses: Mutex<HashMap<String, Vec<u8>>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    connect_failures: Mutex<VecDeque<AgentError>>,
    failures: Mutex<VecDeque<AgentError>>,
    latency: Mutex<Duration>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    operations: AtomicUsize,
}

impl MemoryDevice {
    /// Sets the output returned for `command`.
    pub fn respond(&self, command: &str, output: impl Into<Vec<u8>>) {
        lock(&self.responses).insert(command.to_string(), output.into());
    }

    /// Stores a file readable with `get_file`.
    pub fn put(&self, path: &str, data: impl Into<Vec<u8>>) {
        lock(&self.files).insert(path.to_string(), data.into());
    }

    /// Contents last written to `path`.
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        lock(&self.files).get(path).cloned()
    }

    /// Makes the next operation fail with `error`. Calls queue up.
    pub fn fail_next(&self, error: AgentError) {
        lock(&self.failures).push_back(error);
    }

    /// Makes the next connect attempt fail with `error`. Calls queue up.
    pub fn fail_next_connect(&self, error: AgentError) {
        lock(&self.connect_failures).push_back(error);
    }

    /// Delay added to every operation.
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = latency;
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Number of execute/get/put calls that reached the device.
    pub fn operations(&self) -> usize {
        self.operations.load(Ordering::SeqCst)
    }

    async fn operate(&self) -> Result<(), AgentError> {
        self.operations.fetch_add(1, Ordering::SeqCst);
        let latency = *lock(&self.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match lock(&self.failures).pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Driver bound to one [`MemoryDevice`].
pub struct MemoryDriver {
    device: Arc<MemoryDevice>,
    connected: bool,
}

impl MemoryDriver {
    pub fn new(device: Arc<MemoryDevice>) -> Self {
        Self {
            device,
            connected: false,
        }
    }

    fn check_mode(mode: Option<&str>) -> Result<(), AgentError> {
        match mode {
            None | Some("") | Some("cli") => Ok(()),
            Some(other) => Err(AgentError::UnsupportedMode {
                mode: other.to_string(),
                driver: "memory".to_string(),
            }),
        }
    }

    fn check_connected(&self) -> Result<(), AgentError> {
        if self.connected {
            Ok(())
        } else {
            Err(AgentError::TransientIo("memory device is not connected".to_string()))
        }
    }
}

#[async_trait]
impl DeviceDriver for MemoryDriver {
    fn name(&self) -> &str {
        "memory"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::from([Capability::Execute, Capability::GetFile, Capability::PutFile])
    }

    async fn connect(
        &mut self,
        address: &str,
        credential: &Credential,
        _timeout: Duration,
    ) -> Result<(), AgentError> {
        self.device.connects.fetch_add(1, Ordering::SeqCst);
        trace!("memory connect to {address} as {}", credential.username);
        if let Some(error) = lock(&self.device.connect_failures).pop_front() {
            return Err(error);
        }
        self.connected = true;
        Ok(())
    }

    async fn execute(&mut self, command: &str, mode: Option<&str>) -> Result<Vec<u8>, AgentError> {
        Self::check_mode(mode)?;
        self.check_connected()?;
        self.device.operate().await?;
        lock(&self.device.responses)
            .get(command)
            .cloned()
            .ok_or_else(|| AgentError::Command(format!("% Invalid input: {command}")))
    }

    async fn get_file(&mut self, source: &str, mode: Option<&str>) -> Result<Vec<u8>, AgentError> {
        Self::check_mode(mode)?;
        self.check_connected()?;
        self.device.operate().await?;
        self.device
            .file(source)
            .ok_or_else(|| AgentError::Command(format!("{source}: no such file")))
    }

    async fn put_file(
        &mut self,
        destination: &str,
        data: &[u8],
        mode: Option<&str>,
    ) -> Result<(), AgentError> {
        Self::check_mode(mode)?;
        self.check_connected()?;
        self.device.operate().await?;
        self.device.put(destination, data);
        Ok(())
    }

    async fn disconnect(&mut self) {
        if self.connected {
            self.connected = false;
            self.device.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_alive(&self) -> bool {
        self.connected
    }
}

/// Factory creating [`MemoryDriver`]s, one [`MemoryDevice`] per device name.
#[derive(Default)]
pub struct MemoryDriverFactory {
    devices: Mutex<HashMap<String, Arc<MemoryDevice>>>,
    timeouts: Timeouts,
}

impl MemoryDriverFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The simulated device behind `name`, created on first use.
    pub fn device(&self, name: &str) -> Arc<MemoryDevice> {
        lock(&self.devices).entry(name.to_string()).or_default().clone()
    }
}

impl DriverFactory for MemoryDriverFactory {
    fn create(
        &self,
        device: &DeviceDescriptor,
        _credential: &Credential,
    ) -> Result<Box<dyn DeviceDriver>, AgentError> {
        Ok(Box::new(MemoryDriver::new(self.device(&device.name))))
    }

    fn timeouts(&self, _device_type: DeviceType) -> Timeouts {
        self.timeouts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cred() -> Credential {
        Credential::new(".*", "netops").expect("valid")
    }

    #[tokio::test]
    async fn devices_keep_state_across_drivers() {
        let factory = MemoryDriverFactory::new();
        let descriptor = DeviceDescriptor::new("ar1", DeviceType::CiscoIos, vec!["a".into()]);
        let mut first = factory.create(&descriptor, &cred()).unwrap();
        first.connect("a", &cred(), Duration::from_secs(1)).await.unwrap();
        first.put_file("startup-config", b"hostname ar1\n", None).await.unwrap();
        first.disconnect().await;
        first.disconnect().await;

        let mut second = factory.create(&descriptor, &cred()).unwrap();
        second.connect("a", &cred(), Duration::from_secs(1)).await.unwrap();
        let data = second.get_file("startup-config", None).await.unwrap();
        assert_eq!(data, b"hostname ar1\n");

        let device = factory.device("ar1");
        assert_eq!(device.connects(), 2);
        assert_eq!(device.disconnects(), 1);
    }

    #[tokio::test]
    async fn injected_failures_and_unknown_commands() {
        let device = Arc::new(MemoryDevice::default());
        device.respond("show clock", "12:00\n");
        device.fail_next(AgentError::TransientIo("eof".into()));
        let mut driver = MemoryDriver::new(device.clone());

        assert!(driver.execute("show clock", None).await.unwrap_err().is_retryable());
        driver.connect("a", &cred(), Duration::from_secs(1)).await.unwrap();
        assert!(matches!(
            driver.execute("show clock", None).await,
            Err(AgentError::TransientIo(_))
        ));
        assert_eq!(driver.execute("show clock", None).await.unwrap(), b"12:00\n");
        assert!(matches!(
            driver.execute("show clcok", None).await,
            Err(AgentError::Command(_))
        ));
        assert!(matches!(
            driver.execute("show clock", Some("shell")).await,
            Err(AgentError::UnsupportedMode { .. })
        ));
    }
}
