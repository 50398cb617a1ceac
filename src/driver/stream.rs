//! Byte-stream transports for interactive CLIs.
//!
//! A [`CliStream`] is a bidirectional byte pipe to a device's command line.
//! Both the SSH shell and the telnet transport run the socket in a
//! background I/O task and talk to it through `mpsc` channels, so the
//! expect engine only ever sees whole chunks or end-of-stream.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_ssh2_tokio::client::Client;
use async_trait::async_trait;
use log::{debug, trace};
use russh::ChannelMsg;
use tokio::sync::mpsc;

use super::security::ConnectionSecurityOptions;
use super::ssh;
use crate::credential::Credential;
use crate::device::ConnectMethod;
use crate::error::AgentError;

pub(crate) const CHANNEL_DEPTH: usize = 256;

/// Bidirectional byte pipe to a device CLI.
#[async_trait]
pub trait CliStream: Send {
    async fn send(&mut self, data: &[u8]) -> Result<(), AgentError>;

    /// Next chunk from the device; `None` once the stream has ended.
    async fn recv(&mut self) -> Option<Vec<u8>>;

    /// A chunk that has already arrived, without waiting.
    fn try_recv(&mut self) -> Option<Vec<u8>> {
        None
    }

    fn is_open(&self) -> bool;

    async fn close(&mut self);
}

/// Opens [`CliStream`]s for one transport.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    fn method(&self) -> ConnectMethod;

    async fn open(
        &self,
        address: &str,
        credential: &Credential,
        timeout: Duration,
    ) -> Result<Box<dyn CliStream>, AgentError>;
}

/// Stream backed by channels to a background I/O task.
pub(crate) struct ChannelStream {
    label: String,
    to_device: Option<mpsc::Sender<Vec<u8>>>,
    from_device: mpsc::Receiver<Vec<u8>>,
    open: Arc<AtomicBool>,
    /// Keeps the SSH connection alive for as long as the stream is.
    client: Option<Client>,
}

impl ChannelStream {
    pub(crate) fn new(
        label: String,
        to_device: mpsc::Sender<Vec<u8>>,
        from_device: mpsc::Receiver<Vec<u8>>,
        open: Arc<AtomicBool>,
    ) -> Self {
        Self {
            label,
            to_device: Some(to_device),
            from_device,
            open,
            client: None,
        }
    }
}

#[async_trait]
impl CliStream for ChannelStream {
    async fn send(&mut self, data: &[u8]) -> Result<(), AgentError> {
        trace!("{} >> {:?}", self.label, String::from_utf8_lossy(data));
        let sender = self
            .to_device
            .as_ref()
            .ok_or_else(|| AgentError::TransientIo(format!("{} is closed", self.label)))?;
        sender
            .send(data.to_vec())
            .await
            .map_err(|_| AgentError::TransientIo(format!("{} I/O task has ended", self.label)))
    }

    async fn recv(&mut self) -> Option<Vec<u8>> {
        let chunk = self.from_device.recv().await;
        if let Some(data) = chunk.as_ref() {
            trace!("{} << {:?}", self.label, String::from_utf8_lossy(data));
        }
        chunk
    }

    fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.from_device.try_recv().ok()
    }

    fn is_open(&self) -> bool {
        let client_open = self.client.as_ref().is_none_or(|c| !c.is_closed());
        self.to_device.is_some() && self.open.load(Ordering::Acquire) && client_open
    }

    async fn close(&mut self) {
        // Dropping the sender ends the I/O task, dropping the client the connection.
        self.to_device = None;
        self.from_device.close();
        self.client = None;
        self.open.store(false, Ordering::Release);
        debug!("{} closed", self.label);
    }
}

/// Opens an interactive shell (PTY) over SSH.
pub struct SshShellConnector {
    security: ConnectionSecurityOptions,
    port: Option<u16>,
}

impl SshShellConnector {
    pub fn new(security: ConnectionSecurityOptions, port: Option<u16>) -> Self {
        Self { security, port }
    }
}

#[async_trait]
impl StreamConnector for SshShellConnector {
    fn method(&self) -> ConnectMethod {
        ConnectMethod::Ssh
    }

    async fn open(
        &self,
        address: &str,
        credential: &Credential,
        timeout: Duration,
    ) -> Result<Box<dyn CliStream>, AgentError> {
        let client = ssh::connect(address, self.port, credential, &self.security, timeout).await?;

        let mut channel = client
            .get_channel()
            .await
            .map_err(|e| AgentError::Connect(format!("open session channel: {e}")))?;
        channel
            .request_pty(false, "vt100", 511, 24, 0, 0, &[])
            .await
            .map_err(|e| AgentError::Connect(format!("request pty: {e}")))?;
        channel
            .request_shell(false)
            .await
            .map_err(|e| AgentError::Connect(format!("request shell: {e}")))?;
        let label = format!("ssh://{}@{}", credential.username, address);
        debug!("{} shell started", label);

        let (to_device, mut outgoing) = mpsc::channel::<Vec<u8>>(CHANNEL_DEPTH);
        let (incoming, from_device) = mpsc::channel::<Vec<u8>>(CHANNEL_DEPTH);
        let open = Arc::new(AtomicBool::new(true));

        let task_label = label.clone();
        let task_open = open.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    data = outgoing.recv() => {
                        let Some(data) = data else { break };
                        if let Err(e) = channel.data(&data[..]).await {
                            debug!("{} failed to write to shell: {:?}", task_label, e);
                            break;
                        }
                    }
                    msg = channel.wait() => {
                        match msg {
                            Some(ChannelMsg::Data { ref data }) => {
                                if incoming.send(data.to_vec()).await.is_err() {
                                    break;
                                }
                            }
                            Some(ChannelMsg::ExitStatus { exit_status }) => {
                                debug!("{} shell exited with status {}", task_label, exit_status);
                            }
                            Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                                debug!("{} shell sent EOF", task_label);
                                break;
                            }
                            Some(_) => {}
                        }
                    }
                }
            }
            task_open.store(false, Ordering::Release);
            let _ = channel.close().await;
            debug!("{} I/O task ended", task_label);
        });

        let mut stream = ChannelStream::new(label, to_device, from_device, open);
        stream.client = Some(client);
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_stream_round_trips_and_closes() {
        let (to_device, mut device_rx) = mpsc::channel(4);
        let (device_tx, from_device) = mpsc::channel(4);
        let open = Arc::new(AtomicBool::new(true));
        let mut stream = ChannelStream::new("test".into(), to_device, from_device, open.clone());

        stream.send(b"show clock\n").await.expect("send");
        assert_eq!(device_rx.recv().await.expect("delivered"), b"show clock\n".to_vec());

        device_tx.send(b"12:00\n".to_vec()).await.expect("device writes");
        assert_eq!(stream.recv().await, Some(b"12:00\n".to_vec()));
        assert!(stream.is_open());

        stream.close().await;
        assert!(!stream.is_open());
        assert!(matches!(
            stream.send(b"x").await,
            Err(AgentError::TransientIo(_))
        ));
    }

    #[tokio::test]
    async fn ended_io_task_marks_stream_closed() {
        let (to_device, _device_rx) = mpsc::channel(4);
        let (device_tx, from_device) = mpsc::channel::<Vec<u8>>(4);
        let open = Arc::new(AtomicBool::new(true));
        let mut stream = ChannelStream::new("test".into(), to_device, from_device, open.clone());

        drop(device_tx);
        open.store(false, Ordering::Release);
        assert_eq!(stream.recv().await, None);
        assert!(!stream.is_open());
    }
}
