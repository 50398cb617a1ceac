//! Telnet transport with minimal option negotiation.
//!
//! The agent accepts the server's ECHO and SUPPRESS-GO-AHEAD offers and
//! refuses every other option, which is what network device CLIs expect
//! from a dumb terminal.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use super::stream::{CHANNEL_DEPTH, ChannelStream, CliStream, StreamConnector};
use crate::credential::Credential;
use crate::device::{ConnectMethod, split_host_port};
use crate::error::AgentError;

const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;

const OPT_ECHO: u8 = 1;
const OPT_SGA: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum State {
    #[default]
    Data,
    Iac,
    Negotiate(u8),
    Sub,
    SubIac,
}

/// Incremental telnet decoder.
///
/// Commands may be split across reads; the decoder keeps its state between
/// calls to [`TelnetCodec::decode`].
#[derive(Debug, Default)]
pub struct TelnetCodec {
    state: State,
}

impl TelnetCodec {
    /// Splits `input` into application data and negotiation replies.
    pub fn decode(&mut self, input: &[u8], data: &mut Vec<u8>, replies: &mut Vec<u8>) {
        for &byte in input {
            self.state = match (self.state, byte) {
                (State::Data, IAC) => State::Iac,
                (State::Data, b) => {
                    data.push(b);
                    State::Data
                }
                (State::Iac, IAC) => {
                    data.push(IAC);
                    State::Data
                }
                (State::Iac, cmd @ (DO | DONT | WILL | WONT)) => State::Negotiate(cmd),
                (State::Iac, SB) => State::Sub,
                // NOP, GA, DM and friends carry no payload.
                (State::Iac, _) => State::Data,
                (State::Negotiate(cmd), option) => {
                    if let Some(answer) = Self::answer(cmd, option) {
                        replies.extend_from_slice(&[IAC, answer, option]);
                    }
                    State::Data
                }
                (State::Sub, IAC) => State::SubIac,
                (State::Sub, _) => State::Sub,
                (State::SubIac, SE) => State::Data,
                (State::SubIac, _) => State::Sub,
            };
        }
    }

    fn answer(cmd: u8, option: u8) -> Option<u8> {
        match cmd {
            DO => Some(WONT),
            WILL if option == OPT_ECHO || option == OPT_SGA => Some(DO),
            WILL => Some(DONT),
            _ => None,
        }
    }

    /// Escapes literal 0xFF bytes in outgoing data.
    pub fn encode(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len());
        for &byte in data {
            out.push(byte);
            if byte == IAC {
                out.push(IAC);
            }
        }
        out
    }
}

/// Opens telnet sessions over plain TCP.
pub struct TelnetConnector {
    port: Option<u16>,
}

impl TelnetConnector {
    pub fn new(port: Option<u16>) -> Self {
        Self { port }
    }
}

#[async_trait]
impl StreamConnector for TelnetConnector {
    fn method(&self) -> ConnectMethod {
        ConnectMethod::Telnet
    }

    async fn open(
        &self,
        address: &str,
        _credential: &Credential,
        timeout: Duration,
    ) -> Result<Box<dyn CliStream>, AgentError> {
        let (host, port) =
            split_host_port(address, self.port.unwrap_or(ConnectMethod::Telnet.default_port()));
        let socket = match tokio::time::timeout(timeout, TcpStream::connect((host.as_str(), port))).await {
            Ok(Ok(socket)) => socket,
            Ok(Err(e)) => return Err(AgentError::Connect(format!("telnet {host}:{port}: {e}"))),
            Err(_) => {
                return Err(AgentError::Timeout(format!(
                    "telnet connect to {host}:{port} took longer than {timeout:?}"
                )));
            }
        };
        let _ = socket.set_nodelay(true);
        let label = format!("telnet://{host}:{port}");
        debug!("{} connected", label);

        let (to_device, mut outgoing) = mpsc::channel::<Vec<u8>>(CHANNEL_DEPTH);
        let (incoming, from_device) = mpsc::channel::<Vec<u8>>(CHANNEL_DEPTH);
        let open = Arc::new(AtomicBool::new(true));

        let task_label = label.clone();
        let task_open = open.clone();
        tokio::spawn(async move {
            let (mut reader, mut writer) = socket.into_split();
            let mut codec = TelnetCodec::default();
            let mut buf = vec![0u8; 4096];
            loop {
                tokio::select! {
                    data = outgoing.recv() => {
                        let Some(data) = data else { break };
                        if let Err(e) = writer.write_all(&TelnetCodec::encode(&data)).await {
                            debug!("{} write failed: {}", task_label, e);
                            break;
                        }
                    }
                    read = reader.read(&mut buf) => {
                        let n = match read {
                            Ok(0) => {
                                debug!("{} closed by peer", task_label);
                                break;
                            }
                            Ok(n) => n,
                            Err(e) => {
                                debug!("{} read failed: {}", task_label, e);
                                break;
                            }
                        };
                        let mut data = Vec::with_capacity(n);
                        let mut replies = Vec::new();
                        codec.decode(&buf[..n], &mut data, &mut replies);
                        if !replies.is_empty() && writer.write_all(&replies).await.is_err() {
                            break;
                        }
                        if !data.is_empty() && incoming.send(data).await.is_err() {
                            break;
                        }
                    }
                }
            }
            task_open.store(false, Ordering::Release);
            let _ = writer.shutdown().await;
            debug!("{} I/O task ended", task_label);
        });

        Ok(Box::new(ChannelStream::new(label, to_device, from_device, open)))
    }
}
