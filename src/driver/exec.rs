//! Exec-channel driver for devices with a usable SSH exec service (JunOS).
//!
//! Every command runs on its own exec channel; the output is stdout and
//! stderr combined. Files move with the classic SCP source/sink protocol.

use std::time::Duration;

use async_ssh2_tokio::client::Client;
use async_trait::async_trait;
use log::{debug, trace};
use russh::ChannelMsg;
use russh::client::Msg;

use super::security::ConnectionSecurityOptions;
use super::ssh::{self, transient};
use super::{Capabilities, Capability, DeviceDriver};
use crate::config::Timeouts;
use crate::credential::Credential;
use crate::error::AgentError;

type Channel = russh::Channel<Msg>;

/// SCP file header: `C<mode> <size> <name>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScpHeader {
    pub mode: u32,
    pub size: usize,
    pub name: String,
}

/// Parses an SCP `C` record (without the trailing newline).
pub fn parse_scp_header(line: &str) -> Result<ScpHeader, AgentError> {
    let bad = || AgentError::Command(format!("malformed SCP header {line:?}"));
    let body = line.strip_prefix('C').ok_or_else(bad)?;
    let mut fields = body.splitn(3, ' ');
    let mode = fields
        .next()
        .and_then(|m| u32::from_str_radix(m, 8).ok())
        .ok_or_else(bad)?;
    let size = fields
        .next()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(bad)?;
    let name = fields.next().filter(|n| !n.is_empty()).ok_or_else(bad)?;
    Ok(ScpHeader {
        mode,
        size,
        name: name.to_string(),
    })
}

/// Builds the sink-side header for a file of `size` bytes.
pub fn scp_header(size: usize, destination: &str) -> String {
    let name = destination.rsplit('/').next().unwrap_or(destination);
    format!("C0644 {size} {name}\n")
}

/// Buffered reader over an exec channel.
struct ChannelReader {
    channel: Channel,
    buffer: Vec<u8>,
}

impl ChannelReader {
    fn new(channel: Channel) -> Self {
        Self {
            channel,
            buffer: Vec::new(),
        }
    }

    async fn fill(&mut self) -> Result<(), AgentError> {
        loop {
            match self.channel.wait().await {
                Some(ChannelMsg::Data { ref data }) => {
                    self.buffer.extend_from_slice(data);
                    return Ok(());
                }
                Some(ChannelMsg::ExtendedData { ref data, .. }) => {
                    trace!("scp stderr: {:?}", String::from_utf8_lossy(data));
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                    return Err(AgentError::TransientIo(
                        "SCP channel closed unexpectedly".to_string(),
                    ));
                }
                Some(_) => {}
            }
        }
    }

    async fn read_exact(&mut self, n: usize) -> Result<Vec<u8>, AgentError> {
        while self.buffer.len() < n {
            self.fill().await?;
        }
        Ok(self.buffer.drain(..n).collect())
    }

    async fn read_line(&mut self) -> Result<String, AgentError> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.buffer.drain(..=pos).collect();
                return Ok(String::from_utf8_lossy(&line[..pos]).to_string());
            }
            self.fill().await?;
        }
    }

    /// Reads one SCP status byte, turning warnings and errors into `Command`.
    async fn ack(&mut self) -> Result<(), AgentError> {
        let status = self.read_exact(1).await?;
        match status[0] {
            0 => Ok(()),
            1 | 2 => {
                let message = self.read_line().await.unwrap_or_default();
                Err(AgentError::Command(format!("scp: {}", message.trim())))
            }
            other => Err(AgentError::Command(format!("unexpected SCP status {other}"))),
        }
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), AgentError> {
        self.channel
            .data(data)
            .await
            .map_err(transient("SCP write"))
    }
}

/// Driver issuing one exec request per command.
pub struct ExecDriver {
    security: ConnectionSecurityOptions,
    timeouts: Timeouts,
    port: Option<u16>,
    client: Option<Client>,
    label: String,
}

impl ExecDriver {
    pub fn new(security: ConnectionSecurityOptions, timeouts: Timeouts, port: Option<u16>) -> Self {
        Self {
            security,
            timeouts,
            port,
            client: None,
            label: "junos".to_string(),
        }
    }

    async fn open_exec(&self, command: &str) -> Result<Channel, AgentError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| AgentError::TransientIo("session is not connected".to_string()))?;
        let channel = client
            .get_channel()
            .await
            .map_err(transient("open exec channel"))?;
        channel
            .exec(true, command)
            .await
            .map_err(transient("exec request"))?;
        Ok(channel)
    }

    async fn collect(mut channel: Channel) -> Result<Vec<u8>, AgentError> {
        let mut output = Vec::new();
        let mut exit_status = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => output.extend_from_slice(data),
                // JunOS prints errors on stderr; callers get both streams.
                ChannelMsg::ExtendedData { ref data, .. } => output.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status: status } => exit_status = Some(status),
                ChannelMsg::Close => break,
                _ => {}
            }
        }
        trace!("exec finished with status {:?}", exit_status);
        if output.is_empty() && exit_status.is_none() {
            return Err(AgentError::TransientIo(
                "exec channel closed without output".to_string(),
            ));
        }
        Ok(output)
    }

    async fn scp_get(&self, source: &str) -> Result<Vec<u8>, AgentError> {
        let channel = self.open_exec(&format!("scp -f {source}")).await?;
        let mut reader = ChannelReader::new(channel);
        reader.send(b"\0").await?;
        let header = loop {
            let first = reader.read_exact(1).await?;
            match first[0] {
                b'C' => {
                    let rest = reader.read_line().await?;
                    break parse_scp_header(&format!("C{rest}"))?;
                }
                // Timestamps are acknowledged and ignored.
                b'T' => {
                    reader.read_line().await?;
                    reader.send(b"\0").await?;
                }
                1 | 2 => {
                    let message = reader.read_line().await.unwrap_or_default();
                    return Err(AgentError::Command(format!("scp: {}", message.trim())));
                }
                other => {
                    return Err(AgentError::Command(format!(
                        "unexpected SCP record {:?}",
                        other as char
                    )));
                }
            }
        };
        debug!("{} receiving {} ({} bytes)", self.label, header.name, header.size);
        reader.send(b"\0").await?;
        let data = reader.read_exact(header.size).await?;
        reader.ack().await?;
        reader.send(b"\0").await?;
        Ok(data)
    }

    async fn scp_put(&self, destination: &str, data: &[u8]) -> Result<(), AgentError> {
        let channel = self.open_exec(&format!("scp -t {destination}")).await?;
        let mut reader = ChannelReader::new(channel);
        reader.ack().await?;
        reader.send(scp_header(data.len(), destination).as_bytes()).await?;
        reader.ack().await?;
        reader.send(data).await?;
        reader.send(b"\0").await?;
        reader.ack().await?;
        let _ = reader.channel.eof().await;
        debug!("{} wrote {} bytes to {}", self.label, data.len(), destination);
        Ok(())
    }

    async fn bounded<T>(
        &self,
        what: &str,
        work: impl std::future::Future<Output = Result<T, AgentError>>,
    ) -> Result<T, AgentError> {
        let limit = self.timeouts.long_response;
        match tokio::time::timeout(limit, work).await {
            Ok(result) => result,
            Err(_) => Err(AgentError::Timeout(format!(
                "{}: {what} did not finish within {limit:?}",
                self.label
            ))),
        }
    }
}

#[async_trait]
impl DeviceDriver for ExecDriver {
    fn name(&self) -> &str {
        "junos"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::from([Capability::Execute, Capability::GetFile, Capability::PutFile])
    }

    async fn connect(
        &mut self,
        address: &str,
        credential: &Credential,
        timeout: Duration,
    ) -> Result<(), AgentError> {
        self.disconnect().await;
        let client = ssh::connect(address, self.port, credential, &self.security, timeout).await?;
        self.label = format!("junos {}@{}", credential.username, address);
        self.client = Some(client);
        debug!("{} ready", self.label);
        Ok(())
    }

    async fn execute(&mut self, command: &str, mode: Option<&str>) -> Result<Vec<u8>, AgentError> {
        if let Some(mode) = mode.filter(|m| !m.is_empty() && !m.eq_ignore_ascii_case("cli")) {
            return Err(AgentError::UnsupportedMode {
                mode: mode.to_string(),
                driver: "junos".to_string(),
            });
        }
        let work = async {
            let channel = self.open_exec(command).await?;
            Self::collect(channel).await
        };
        self.bounded(command, work).await
    }

    async fn get_file(&mut self, source: &str, _mode: Option<&str>) -> Result<Vec<u8>, AgentError> {
        self.bounded("scp get", self.scp_get(source)).await
    }

    async fn put_file(
        &mut self,
        destination: &str,
        data: &[u8],
        _mode: Option<&str>,
    ) -> Result<(), AgentError> {
        self.bounded("scp put", self.scp_put(destination, data)).await
    }

    async fn disconnect(&mut self) {
        if let Some(client) = self.client.take() {
            let _ = tokio::time::timeout(self.timeouts.disconnect, client.disconnect()).await;
            debug!("{} disconnected", self.label);
        }
    }

    fn is_alive(&self) -> bool {
        self.client.as_ref().is_some_and(|c| !c.is_closed())
    }
}
