//! How the client reaches agents.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::ClientError;
use crate::agent::Agent;
use crate::rpc::{RpcRequest, RpcResponse};

/// Delivers requests to named agents.
///
/// Implementations wrap whatever RPC substrate connects clients to agents.
/// A transport error means the agent was not reached; errors raised by the
/// agent come back inside [`RpcResponse::Error`].
#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn call(&self, agent: &str, request: RpcRequest) -> Result<RpcResponse, ClientError>;
}

/// In-process transport calling [`Agent`] instances directly.
#[derive(Default)]
pub struct LocalTransport {
    agents: HashMap<String, Arc<Agent>>,
    json: bool,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_agent(mut self, name: impl Into<String>, agent: Arc<Agent>) -> Self {
        self.agents.insert(name.into(), agent);
        self
    }

    /// Passes every request and response through their JSON encoding, the
    /// way a network substrate would.
    pub fn with_json_encoding(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    /// Names of the registered agents, sorted.
    pub fn agent_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl AgentTransport for LocalTransport {
    async fn call(&self, agent: &str, request: RpcRequest) -> Result<RpcResponse, ClientError> {
        let target = self
            .agents
            .get(agent)
            .ok_or_else(|| ClientError::Transport(format!("unknown agent {agent:?}")))?;
        if !self.json {
            return Ok(target.handle(request).await);
        }
        let encoded = serde_json::to_string(&request)
            .map_err(|e| ClientError::Transport(format!("cannot encode request: {e}")))?;
        let reply = target.handle_json(&encoded).await;
        serde_json::from_str(&reply)
            .map_err(|e| ClientError::Transport(format!("cannot decode response: {e}")))
    }
}
