//! The agent: the externally callable surface over inventory and sessions.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, info, warn};
use tokio::task::JoinHandle;

use crate::config::AgentConfig;
use crate::credential::CredentialStore;
use crate::device::DeviceInfo;
use crate::driver::{DefaultDriverFactory, DriverFactory};
use crate::error::{AgentError, ConfigError};
use crate::executor::RequestExecutor;
use crate::inventory::{Inventory, InventoryProvider, StaticInventory};
use crate::rpc::{RpcReply, RpcRequest, RpcResponse, decode_payload, encode_payload};
use crate::session::SessionManager;

/// Priority of the provider serving devices declared in the configuration.
const CONFIG_PROVIDER_PRIORITY: u32 = 0;

/// Builds an [`Agent`] from configuration plus optional overrides.
pub struct AgentBuilder {
    config: AgentConfig,
    credentials: Option<CredentialStore>,
    factory: Option<Arc<dyn DriverFactory>>,
    providers: Vec<(u32, Arc<dyn InventoryProvider>)>,
}

impl AgentBuilder {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            credentials: None,
            factory: None,
            providers: Vec::new(),
        }
    }

    /// Uses `credentials` instead of the file named in the options.
    pub fn credentials(mut self, credentials: CredentialStore) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Replaces the driver factory (the default builds SSH and telnet drivers).
    pub fn driver_factory(mut self, factory: Arc<dyn DriverFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Adds an inventory provider; lower priorities win on duplicate names.
    pub fn inventory_provider(mut self, priority: u32, provider: Arc<dyn InventoryProvider>) -> Self {
        self.providers.push((priority, provider));
        self
    }

    pub fn build(self) -> Result<Agent, ConfigError> {
        let credentials = match (self.credentials, &self.config.options.credentials) {
            (Some(credentials), _) => credentials,
            (None, Some(path)) => CredentialStore::from_file(path)?,
            (None, None) => CredentialStore::default(),
        };
        if credentials.is_empty() {
            warn!("no credential rules loaded; every device will fail with NoCredential");
        }

        let mut inventory = Inventory::new();
        if !self.config.devices.is_empty() {
            inventory.add_provider(
                CONFIG_PROVIDER_PRIORITY,
                Arc::new(StaticInventory::new("config", self.config.devices.clone())),
            );
        }
        for (priority, provider) in self.providers {
            inventory.add_provider(priority, provider);
        }

        let config = Arc::new(self.config);
        let factory = self
            .factory
            .unwrap_or_else(|| Arc::new(DefaultDriverFactory::new(config.clone())));
        let inventory = Arc::new(inventory);
        let sessions = Arc::new(SessionManager::new(
            config.clone(),
            inventory.clone(),
            credentials,
            factory,
        ));
        let executor = RequestExecutor::new(sessions.clone(), config.options.max_workers);
        Ok(Agent {
            config,
            inventory,
            sessions,
            executor,
            sweeper: Mutex::new(None),
        })
    }
}

/// Serves device requests for one inventory.
pub struct Agent {
    config: Arc<AgentConfig>,
    inventory: Arc<Inventory>,
    sessions: Arc<SessionManager>,
    executor: RequestExecutor,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Agent {
    pub fn builder(config: AgentConfig) -> AgentBuilder {
        AgentBuilder::new(config)
    }

    /// Loads the agent configuration (and its credential file) from YAML.
    pub fn from_config_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        AgentBuilder::new(AgentConfig::from_file(path)?).build()
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn inventory(&self) -> &Arc<Inventory> {
        &self.inventory
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Sorted names of devices matching `regexp`.
    pub fn devices_matching(&self, regexp: &str) -> Result<Vec<String>, AgentError> {
        Ok(self.inventory.devices_matching(regexp)?.iter().cloned().collect())
    }

    pub fn devices_info(&self, regexp: &str) -> Result<BTreeMap<String, DeviceInfo>, AgentError> {
        self.inventory.devices_info(regexp)
    }

    /// Runs `command` and returns the output, base64 encoded.
    pub async fn command(
        &self,
        device_name: &str,
        command: &str,
        mode: Option<&str>,
    ) -> Result<String, AgentError> {
        let output = self.executor.command(device_name, command, mode).await?;
        Ok(encode_payload(&output))
    }

    /// Reads `source` from the device, base64 encoded.
    pub async fn get_config(
        &self,
        device_name: &str,
        source: &str,
        mode: Option<&str>,
    ) -> Result<String, AgentError> {
        let data = self.executor.get_config(device_name, source, mode).await?;
        Ok(encode_payload(&data))
    }

    /// Writes base64 `data` to `destination` on the device.
    pub async fn set_config(
        &self,
        device_name: &str,
        destination: &str,
        data: &str,
        mode: Option<&str>,
    ) -> Result<bool, AgentError> {
        let data = decode_payload(data)?;
        self.executor
            .set_config(device_name, destination, data, mode)
            .await?;
        Ok(true)
    }

    /// Dispatches one request.
    pub async fn handle(&self, request: RpcRequest) -> RpcResponse {
        debug!("handling {}", request.method());
        let result = match request {
            RpcRequest::DevicesMatching { regexp } => {
                self.devices_matching(&regexp).map(RpcReply::DeviceNames)
            }
            RpcRequest::DevicesInfo { regexp } => self.devices_info(&regexp).map(RpcReply::DeviceInfo),
            RpcRequest::Command {
                device_name,
                command,
                mode,
            } => self
                .command(&device_name, &command, mode.as_deref())
                .await
                .map(RpcReply::Payload),
            RpcRequest::GetConfig {
                device_name,
                source,
                mode,
            } => self
                .get_config(&device_name, &source, mode.as_deref())
                .await
                .map(RpcReply::Payload),
            RpcRequest::SetConfig {
                device_name,
                destination,
                data,
                mode,
            } => self
                .set_config(&device_name, &destination, &data, mode.as_deref())
                .await
                .map(RpcReply::Ack),
        };
        RpcResponse::from(result)
    }

    /// Dispatches one JSON-encoded request and returns the JSON response.
    pub async fn handle_json(&self, request: &str) -> String {
        let response = match serde_json::from_str::<RpcRequest>(request) {
            Ok(request) => self.handle(request).await,
            Err(e) => RpcResponse::from(Err(AgentError::InvalidRequest(format!("malformed request: {e}")))),
        };
        serde_json::to_string(&response).unwrap_or_else(|e| {
            format!(r#"{{"error":{{"code":99,"kind":"InternalError","message":"unencodable response: {e}"}}}}"#)
        })
    }

    /// Refreshes every inventory provider.
    pub async fn refresh_inventory(&self) {
        self.inventory.refresh().await;
    }

    /// Starts the idle-session sweeper. Calling it again has no effect.
    pub fn start_maintenance(&self) {
        let mut sweeper = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if sweeper.is_some() {
            return;
        }
        let period = self.config.session_maint_period();
        info!("session maintenance every {period:?}");
        *sweeper = Some(self.sessions.spawn_idle_sweeper(period));
    }

    /// Stops maintenance and disconnects every session.
    ///
    /// Returns the number of sessions torn down.
    pub async fn shutdown(&self) -> usize {
        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }
        let killed = self.sessions.kill_all().await;
        info!("shutdown closed {killed} sessions");
        killed
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        if let Some(sweeper) = self
            .sweeper
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            sweeper.abort();
        }
    }
}
