//! Bounded worker pool for device I/O.
//!
//! Each device operation runs on its own task, gated by a semaphore of
//! `max_workers` permits, so a slow device never stalls the caller's
//! request loop and a caller that goes away does not leave a session
//! half-used.

use std::sync::Arc;

use log::{debug, trace};
use tokio::sync::Semaphore;

use crate::error::AgentError;
use crate::session::{Operation, Outcome, SessionManager};

/// Runs device operations on a bounded pool of tasks.
pub struct RequestExecutor {
    sessions: Arc<SessionManager>,
    workers: Arc<Semaphore>,
    max_workers: usize,
}

impl RequestExecutor {
    pub fn new(sessions: Arc<SessionManager>, max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            sessions,
            workers: Arc::new(Semaphore::new(max_workers)),
            max_workers,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Number of workers currently running a device operation.
    pub fn busy_workers(&self) -> usize {
        self.max_workers - self.workers.available_permits()
    }

    /// Runs `operation` against `device_name` on a worker.
    ///
    /// The session is released when the worker finishes, even if the
    /// returned future is dropped first.
    pub async fn execute(&self, device_name: &str, operation: Operation) -> Result<Outcome, AgentError> {
        let permit = self
            .workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AgentError::Internal("worker pool is closed".to_string()))?;
        trace!("{device_name}: {} dispatched", operation.name());

        let sessions = self.sessions.clone();
        let name = device_name.to_string();
        let worker = tokio::spawn(async move {
            let _permit = permit;
            let result = sessions.execute(&name, &operation).await;
            if let Err(e) = &result {
                debug!("{name}: {} failed: {e}", operation.name());
            }
            result
        });
        worker
            .await
            .map_err(|e| AgentError::Internal(format!("worker for {device_name} died: {e}")))?
    }

    /// Runs `command` and returns the raw device output.
    pub async fn command(
        &self,
        device_name: &str,
        command: &str,
        mode: Option<&str>,
    ) -> Result<Vec<u8>, AgentError> {
        let operation = Operation::Command {
            command: command.to_string(),
            mode: mode.map(str::to_string),
        };
        self.execute(device_name, operation).await.and_then(expect_bytes)
    }

    /// Reads `source` (a configuration file or store) from the device.
    pub async fn get_config(
        &self,
        device_name: &str,
        source: &str,
        mode: Option<&str>,
    ) -> Result<Vec<u8>, AgentError> {
        let operation = Operation::GetConfig {
            source: source.to_string(),
            mode: mode.map(str::to_string),
        };
        self.execute(device_name, operation).await.and_then(expect_bytes)
    }

    /// Writes `data` to `destination` on the device.
    pub async fn set_config(
        &self,
        device_name: &str,
        destination: &str,
        data: Vec<u8>,
        mode: Option<&str>,
    ) -> Result<(), AgentError> {
        let operation = Operation::SetConfig {
            destination: destination.to_string(),
            data,
            mode: mode.map(str::to_string),
        };
        match self.execute(device_name, operation).await? {
            Outcome::Ack => Ok(()),
            Outcome::Bytes(_) => Err(AgentError::Internal(
                "set_config produced a payload".to_string(),
            )),
        }
    }
}

fn expect_bytes(outcome: Outcome) -> Result<Vec<u8>, AgentError> {
    match outcome {
        Outcome::Bytes(bytes) => Ok(bytes),
        Outcome::Ack => Err(AgentError::Internal(
            "operation returned no payload".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::credential::{Credential, CredentialStore};
    use crate::device::{DeviceDescriptor, DeviceType};
    use crate::driver::memory::MemoryDriverFactory;
    use crate::inventory::{Inventory, StaticInventory};
    use std::time::Duration;

    fn executor(max_workers: usize) -> (Arc<RequestExecutor>, Arc<MemoryDriverFactory>) {
        let devices = vec![
            DeviceDescriptor::new("ar1", DeviceType::CiscoIos, vec!["a".into()]),
            DeviceDescriptor::new("ar2", DeviceType::CiscoIos, vec!["b".into()]),
        ];
        let inventory = Inventory::new().with_provider(0, Arc::new(StaticInventory::new("test", devices)));
        let factory = Arc::new(MemoryDriverFactory::new());
        let sessions = Arc::new(SessionManager::new(
            Arc::new(AgentConfig::default()),
            Arc::new(inventory),
            CredentialStore::new(vec![Credential::new(".*", "netops").unwrap()]),
            factory.clone(),
        ));
        (Arc::new(RequestExecutor::new(sessions, max_workers)), factory)
    }

    #[tokio::test(start_paused = true)]
    async fn workers_are_bounded() {
        let (executor, factory) = executor(1);
        for name in ["ar1", "ar2"] {
            factory.device(name).respond("show clock", "now\n");
            factory.device(name).set_latency(Duration::from_secs(10));
        }
        let first = tokio::spawn({
            let executor = executor.clone();
            async move { executor.command("ar1", "show clock", None).await }
        });
        let second = tokio::spawn({
            let executor = executor.clone();
            async move { executor.command("ar2", "show clock", None).await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(executor.busy_workers(), 1);
        assert_eq!(factory.device("ar2").operations(), 0, "second request waits for a worker");

        assert_eq!(first.await.unwrap().unwrap(), b"now\n");
        assert_eq!(second.await.unwrap().unwrap(), b"now\n");
        assert_eq!(executor.busy_workers(), 0);
    }

    #[tokio::test]
    async fn set_config_acknowledges_and_get_config_reads_back() {
        let (executor, factory) = executor(4);
        executor
            .set_config("ar1", "flash:new.cfg", b"hostname ar1\n".to_vec(), None)
            .await
            .unwrap();
        assert_eq!(factory.device("ar1").file("flash:new.cfg").unwrap(), b"hostname ar1\n");
        let read = executor.get_config("ar1", "flash:new.cfg", None).await.unwrap();
        assert_eq!(read, b"hostname ar1\n");
    }

    #[tokio::test]
    async fn unknown_devices_fail_before_taking_a_session() {
        let (executor, _) = executor(4);
        let err = executor.command("nope", "show clock", None).await.unwrap_err();
        assert!(matches!(err, AgentError::NotFound(_)));
        assert!(executor.sessions().snapshot().is_empty());
    }
}
