//! Asynchronous client dispatcher.
//!
//! Every call returns a [`RequestHandle`] immediately. The request is sent
//! to one agent chosen by the [`LoadBalancePolicy`]; when it resolves, its
//! callback (if any) runs and the handle completes. [`Client::wait_all`]
//! waits for every outstanding request and [`Client::kill_all`] cancels
//! them without waiting for the agents.
//!
//! A request is never retried against another agent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, trace};
use thiserror::Error;
use tokio::sync::{Semaphore, oneshot, watch};
use tokio::task::AbortHandle;

use crate::error::WireError;
use crate::rpc::{RpcReply, RpcRequest, RpcResponse, decode_payload, encode_payload};

mod balance;
mod transport;

pub use balance::{BackendStats, LoadBalancePolicy};
use balance::Balancer;
pub use transport::{AgentTransport, LocalTransport};

/// Default bound on requests in flight at once.
pub const DEFAULT_MAX_CONCURRENCY: usize = 1000;

/// Why a client request did not produce a reply.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("request cancelled")]
    Cancelled,

    #[error("no agents configured")]
    NoAgents,

    /// The agent could not be reached.
    #[error("transport error: {0}")]
    Transport(String),

    /// The agent answered with an error.
    #[error("{}: {}", .0.kind, .0.message)]
    Agent(WireError),

    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
}

/// Lifecycle of a client request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Pending,
    Sent,
    Completed,
    Failed,
    Cancelled,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestState::Completed | RequestState::Failed | RequestState::Cancelled
        )
    }

    fn of(result: &Result<RpcReply, ClientError>) -> Self {
        match result {
            Ok(_) => RequestState::Completed,
            Err(ClientError::Cancelled) => RequestState::Cancelled,
            Err(_) => RequestState::Failed,
        }
    }
}

pub type RequestId = u64;

/// Final outcome handed to a request's callback.
#[derive(Debug, Clone)]
pub struct Completion {
    pub id: RequestId,
    pub method: &'static str,
    pub device_name: Option<String>,
    /// Agent the request was sent to; `None` if it never left the client.
    pub agent: Option<String>,
    pub state: RequestState,
    pub result: Result<RpcReply, ClientError>,
}

impl Completion {
    /// Decoded payload of a successful `command` or `get_config`.
    pub fn payload(&self) -> Result<Vec<u8>, ClientError> {
        payload_of(&self.result)
    }
}

fn payload_of(result: &Result<RpcReply, ClientError>) -> Result<Vec<u8>, ClientError> {
    match result {
        Ok(RpcReply::Payload(data)) => {
            decode_payload(data).map_err(|e| ClientError::UnexpectedReply(e.to_string()))
        }
        Ok(other) => Err(ClientError::UnexpectedReply(format!("{other:?}"))),
        Err(e) => Err(e.clone()),
    }
}

pub type Callback = Box<dyn FnOnce(&Completion) + Send + 'static>;

/// Client tuning.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub max_concurrency: usize,
    pub policy: LoadBalancePolicy,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            policy: LoadBalancePolicy::default(),
        }
    }
}

type StateCell = Arc<Mutex<RequestState>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Outstanding {
    method: &'static str,
    device_name: Option<String>,
    agent: Option<String>,
    state: StateCell,
    callback: Option<Callback>,
    done: Option<oneshot::Sender<Result<RpcReply, ClientError>>>,
    task: Option<AbortHandle>,
}

struct Inner {
    transport: Arc<dyn AgentTransport>,
    balancer: Balancer,
    outstanding: Mutex<HashMap<RequestId, Outstanding>>,
    next_id: AtomicU64,
    pending: watch::Sender<usize>,
    limiter: Arc<Semaphore>,
}

impl Inner {
    /// Moves a request to its terminal state. Only the first call for an
    /// id has any effect.
    fn finish(&self, id: RequestId, result: Result<RpcReply, ClientError>) -> bool {
        let Some(entry) = lock(&self.outstanding).remove(&id) else {
            return false;
        };
        self.complete(id, entry, result);
        true
    }

    fn complete(&self, id: RequestId, mut entry: Outstanding, result: Result<RpcReply, ClientError>) {
        let state = RequestState::of(&result);
        *lock(&entry.state) = state;
        trace!("request {id} {state:?}");
        let completion = Completion {
            id,
            method: entry.method,
            device_name: entry.device_name.take(),
            agent: entry.agent.take(),
            state,
            result,
        };
        if let Some(callback) = entry.callback.take() {
            callback(&completion);
        }
        if let Some(done) = entry.done.take() {
            let _ = done.send(completion.result);
        }
        self.pending.send_modify(|n| *n = n.saturating_sub(1));
    }

    /// Marks a pending request as sent to `agent`. False if it was already
    /// resolved.
    fn mark_sent(&self, id: RequestId, agent: &str) -> bool {
        match lock(&self.outstanding).get_mut(&id) {
            Some(entry) => {
                entry.agent = Some(agent.to_string());
                *lock(&entry.state) = RequestState::Sent;
                true
            }
            None => false,
        }
    }

    async fn run(self: Arc<Self>, id: RequestId, request: RpcRequest) {
        let Ok(_permit) = self.limiter.clone().acquire_owned().await else {
            self.finish(id, Err(ClientError::Cancelled));
            return;
        };
        let Some(backend) = self.balancer.pick() else {
            self.finish(id, Err(ClientError::NoAgents));
            return;
        };
        if !self.mark_sent(id, backend.agent()) {
            return;
        }
        debug!("request {id} {} -> {}", request.method(), backend.agent());
        let call = backend.begin();
        let result = match self.transport.call(backend.agent(), request).await {
            Ok(response) => {
                call.finish(true);
                match response {
                    RpcResponse::Result(reply) => Ok(reply),
                    RpcResponse::Error(e) => Err(ClientError::Agent(e)),
                }
            }
            Err(e) => {
                call.finish(false);
                Err(e)
            }
        };
        self.finish(id, result);
    }
}

/// Handle on one outstanding request.
pub struct RequestHandle {
    id: RequestId,
    state: StateCell,
    done: oneshot::Receiver<Result<RpcReply, ClientError>>,
}

impl RequestHandle {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn state(&self) -> RequestState {
        *lock(&self.state)
    }

    /// Waits for the request to resolve.
    pub async fn wait(self) -> Result<RpcReply, ClientError> {
        self.done.await.unwrap_or(Err(ClientError::Cancelled))
    }

    /// Waits for a `command` or `get_config` request and decodes its payload.
    pub async fn payload(self) -> Result<Vec<u8>, ClientError> {
        payload_of(&self.wait().await)
    }
}

/// Dispatches requests to a set of agents.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    pub fn new(transport: Arc<dyn AgentTransport>, agents: Vec<String>) -> Self {
        Self::with_options(transport, agents, ClientOptions::default())
    }

    pub fn with_options(
        transport: Arc<dyn AgentTransport>,
        agents: Vec<String>,
        options: ClientOptions,
    ) -> Self {
        let (pending, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                transport,
                balancer: Balancer::new(agents, options.policy),
                outstanding: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                pending,
                limiter: Arc::new(Semaphore::new(options.max_concurrency.max(1))),
            }),
        }
    }

    /// Sends `request` without a callback.
    pub fn submit(&self, request: RpcRequest) -> RequestHandle {
        self.dispatch(request, None)
    }

    /// Sends `request`; `callback` runs once when it resolves, cancelled or
    /// not.
    pub fn submit_with_callback(
        &self,
        request: RpcRequest,
        callback: impl FnOnce(&Completion) + Send + 'static,
    ) -> RequestHandle {
        self.dispatch(request, Some(Box::new(callback)))
    }

    fn dispatch(&self, request: RpcRequest, callback: Option<Callback>) -> RequestHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let state: StateCell = Arc::new(Mutex::new(RequestState::Pending));
        let (done_tx, done_rx) = oneshot::channel();
        {
            let mut outstanding = lock(&self.inner.outstanding);
            outstanding.insert(
                id,
                Outstanding {
                    method: request.method(),
                    device_name: request.device_name().map(str::to_string),
                    agent: None,
                    state: state.clone(),
                    callback,
                    done: Some(done_tx),
                    task: None,
                },
            );
            self.inner.pending.send_modify(|n| *n += 1);
        }

        let task = tokio::spawn(self.inner.clone().run(id, request));
        if let Some(entry) = lock(&self.inner.outstanding).get_mut(&id) {
            entry.task = Some(task.abort_handle());
        }
        RequestHandle {
            id,
            state,
            done: done_rx,
        }
    }

    pub fn devices_matching(&self, regexp: &str) -> RequestHandle {
        self.submit(RpcRequest::DevicesMatching {
            regexp: regexp.to_string(),
        })
    }

    pub fn devices_info(&self, regexp: &str) -> RequestHandle {
        self.submit(RpcRequest::DevicesInfo {
            regexp: regexp.to_string(),
        })
    }

    pub fn command(&self, device_name: &str, command: &str, mode: Option<&str>) -> RequestHandle {
        self.submit(RpcRequest::Command {
            device_name: device_name.to_string(),
            command: command.to_string(),
            mode: mode.map(str::to_string),
        })
    }

    pub fn get_config(&self, device_name: &str, source: &str, mode: Option<&str>) -> RequestHandle {
        self.submit(RpcRequest::GetConfig {
            device_name: device_name.to_string(),
            source: source.to_string(),
            mode: mode.map(str::to_string),
        })
    }

    /// Writes `data` (raw bytes; encoded here) to `destination`.
    pub fn set_config(
        &self,
        device_name: &str,
        destination: &str,
        data: &[u8],
        mode: Option<&str>,
    ) -> RequestHandle {
        self.submit(RpcRequest::SetConfig {
            device_name: device_name.to_string(),
            destination: destination.to_string(),
            data: encode_payload(data),
            mode: mode.map(str::to_string),
        })
    }

    /// Number of requests not yet resolved.
    pub fn outstanding(&self) -> usize {
        *self.inner.pending.borrow()
    }

    /// State of an outstanding request; `None` once it has resolved.
    pub fn state(&self, id: RequestId) -> Option<RequestState> {
        lock(&self.inner.outstanding)
            .get(&id)
            .map(|entry| *lock(&entry.state))
    }

    /// Waits until every request outstanding at any point during the call
    /// has resolved.
    pub async fn wait_all(&self) {
        let mut pending = self.inner.pending.subscribe();
        let _ = pending.wait_for(|n| *n == 0).await;
    }

    /// Cancels every outstanding request.
    ///
    /// Callbacks run with [`ClientError::Cancelled`] before this returns;
    /// replies that arrive later are discarded. Returns the number of
    /// requests cancelled.
    pub fn kill_all(&self) -> usize {
        let drained: Vec<(RequestId, Outstanding)> = lock(&self.inner.outstanding).drain().collect();
        let count = drained.len();
        for (id, mut entry) in drained {
            if let Some(task) = entry.task.take() {
                task.abort();
            }
            self.inner.complete(id, entry, Err(ClientError::Cancelled));
        }
        if count > 0 {
            debug!("cancelled {count} outstanding requests");
        }
        count
    }

    /// Marks an agent healthy or unhealthy by hand. False if unknown.
    pub fn set_agent_health(&self, agent: &str, healthy: bool) -> bool {
        self.inner.balancer.set_healthy(agent, healthy)
    }

    pub fn backend_stats(&self) -> Vec<BackendStats> {
        self.inner.balancer.stats()
    }
}
