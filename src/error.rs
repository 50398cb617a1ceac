//! Error types for device sessions, drivers and configuration.
//!
//! [`AgentError`] is the runtime taxonomy shared by drivers, the session
//! cache, the agent facade and the client dispatcher. [`ConfigError`] covers
//! loading credential and agent configuration files.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while talking to devices or serving requests.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    /// The device rejected the credential (login or enable password).
    #[error("authentication failed: {0}")]
    Auth(String),

    /// No transport connection could be established.
    ///
    /// Raised after every address of the device has been tried.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The device did not answer within the configured timeout.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The transport failed in the middle of an operation.
    ///
    /// Typically an EOF or a dropped channel. The session cache retries
    /// once on a fresh connection before surfacing this.
    #[error("transient I/O failure: {0}")]
    TransientIo(String),

    /// The device answered but the operation itself failed.
    #[error("command failed: {0}")]
    Command(String),

    /// The driver does not implement the requested operation.
    #[error("operation not supported: {0}")]
    UnsupportedOperation(String),

    /// The driver does not know the requested mode.
    #[error("mode {mode:?} is not supported by {driver}")]
    UnsupportedMode { mode: String, driver: String },

    /// No credential rule matches the device name.
    #[error("no credential for device {0:?}")]
    NoCredential(String),

    /// The device name is unknown to every inventory provider.
    #[error("no such device {0:?}")]
    NotFound(String),

    /// The device is known but has no addresses to connect to.
    #[error("device {0:?} has no addresses")]
    NoAddresses(String),

    /// The request itself is malformed (bad regexp, bad base64, ...).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A worker task died before producing a result.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Whether the session cache should retry on a fresh connection.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentError::TransientIo(_) | AgentError::Connect(_) | AgentError::Timeout(_)
        )
    }

    /// Whether a session that produced this error can no longer be trusted.
    pub fn poisons_session(&self) -> bool {
        self.is_retryable() || matches!(self, AgentError::Auth(_))
    }

    /// Stable numeric code carried on the wire.
    pub fn code(&self) -> u16 {
        match self {
            AgentError::Connect(_) => 1,
            AgentError::InvalidRequest(_) => 5,
            AgentError::NoAddresses(_) => 6,
            AgentError::NotFound(_) => 3,
            AgentError::UnsupportedMode { .. } => 4,
            AgentError::Auth(_) => 9,
            AgentError::Timeout(_) => 10,
            AgentError::TransientIo(_) => 11,
            AgentError::Command(_) => 12,
            AgentError::UnsupportedOperation(_) => 13,
            AgentError::NoCredential(_) => 14,
            AgentError::Internal(_) => 99,
        }
    }

    /// Stable error name carried on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::Auth(_) => "AuthError",
            AgentError::Connect(_) => "ConnectError",
            AgentError::Timeout(_) => "TimeoutError",
            AgentError::TransientIo(_) => "TransientIOError",
            AgentError::Command(_) => "CommandError",
            AgentError::UnsupportedOperation(_) => "UnsupportedOperation",
            AgentError::UnsupportedMode { .. } => "UnsupportedMode",
            AgentError::NoCredential(_) => "NoCredential",
            AgentError::NotFound(_) => "NotFound",
            AgentError::NoAddresses(_) => "NoAddresses",
            AgentError::InvalidRequest(_) => "InvalidRequest",
            AgentError::Internal(_) => "InternalError",
        }
    }

    /// Wire form of this error.
    pub fn to_wire(&self) -> WireError {
        WireError {
            code: self.code(),
            kind: self.kind().to_string(),
            message: self.to_string(),
        }
    }
}

/// Serialisable error as returned to RPC callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct WireError {
    pub code: u16,
    pub kind: String,
    pub message: String,
}

/// Errors raised while loading configuration or credential files.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A required field is absent from a record.
    #[error("record {index} is missing field {field:?}")]
    MissingField { index: usize, field: &'static str },

    #[error("invalid regexp {pattern:?}: {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::AgentError;

    #[test]
    fn retryable_errors_are_transport_level_only() {
        assert!(AgentError::TransientIo("eof".into()).is_retryable());
        assert!(AgentError::Connect("refused".into()).is_retryable());
        assert!(AgentError::Timeout("prompt".into()).is_retryable());
        assert!(!AgentError::Auth("bad password".into()).is_retryable());
        assert!(!AgentError::Command("% Invalid input".into()).is_retryable());
        assert!(!AgentError::NoCredential("r1".into()).is_retryable());
    }

    #[test]
    fn auth_failures_poison_the_session_but_command_errors_do_not() {
        assert!(AgentError::Auth("enable".into()).poisons_session());
        assert!(!AgentError::Command("rejected".into()).poisons_session());
        assert!(
            !AgentError::UnsupportedMode {
                mode: "shell".into(),
                driver: "ios".into()
            }
            .poisons_session()
        );
    }

    #[test]
    fn wire_form_carries_code_kind_and_message() {
        let wire = AgentError::NotFound("ar1".into()).to_wire();
        assert_eq!(wire.code, 3);
        assert_eq!(wire.kind, "NotFound");
        assert!(wire.message.contains("ar1"));
    }
}
