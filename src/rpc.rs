//! Request and response values exchanged with an agent.
//!
//! The types serialise to a small JSON shape that any RPC substrate can
//! carry:
//!
//! ```json
//! {"method": "command", "params": {"device_name": "ar1", "command": "show version"}}
//! {"result": "SU9TIFhFIFNvZnR3YXJl..."}
//! {"error": {"code": 3, "kind": "NotFound", "message": "no such device \"ar9\""}}
//! ```
//!
//! Byte payloads (command output, configuration data) always travel as
//! standard base64.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::device::DeviceInfo;
use crate::error::{AgentError, WireError};

/// Encodes a byte payload for the wire.
pub fn encode_payload(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Decodes a byte payload received from the wire.
pub fn decode_payload(data: &str) -> Result<Vec<u8>, AgentError> {
    STANDARD
        .decode(data.trim())
        .map_err(|e| AgentError::InvalidRequest(format!("payload is not valid base64: {e}")))
}

/// One call on the agent surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum RpcRequest {
    /// Names of devices whose name matches `regexp`.
    DevicesMatching { regexp: String },

    /// Type and addresses of devices whose name matches `regexp`.
    DevicesInfo { regexp: String },

    /// Runs a command; the reply is the base64 output.
    Command {
        device_name: String,
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<String>,
    },

    /// Reads a configuration source; the reply is the base64 contents.
    GetConfig {
        device_name: String,
        source: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<String>,
    },

    /// Writes base64 `data` to `destination`.
    SetConfig {
        device_name: String,
        destination: String,
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<String>,
    },
}

impl RpcRequest {
    pub fn method(&self) -> &'static str {
        match self {
            RpcRequest::DevicesMatching { .. } => "devices_matching",
            RpcRequest::DevicesInfo { .. } => "devices_info",
            RpcRequest::Command { .. } => "command",
            RpcRequest::GetConfig { .. } => "get_config",
            RpcRequest::SetConfig { .. } => "set_config",
        }
    }

    /// Target device, for calls that address one.
    pub fn device_name(&self) -> Option<&str> {
        match self {
            RpcRequest::Command { device_name, .. }
            | RpcRequest::GetConfig { device_name, .. }
            | RpcRequest::SetConfig { device_name, .. } => Some(device_name),
            RpcRequest::DevicesMatching { .. } | RpcRequest::DevicesInfo { .. } => None,
        }
    }
}

/// Successful result of an [`RpcRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum RpcReply {
    DeviceNames(Vec<String>),
    DeviceInfo(BTreeMap<String, DeviceInfo>),
    /// Base64 payload.
    Payload(String),
    Ack(bool),
}

impl RpcReply {
    /// Decodes a [`RpcReply::Payload`].
    pub fn payload(&self) -> Option<Result<Vec<u8>, AgentError>> {
        match self {
            RpcReply::Payload(data) => Some(decode_payload(data)),
            _ => None,
        }
    }
}

/// Response envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RpcResponse {
    Result(RpcReply),
    Error(WireError),
}

impl From<Result<RpcReply, AgentError>> for RpcResponse {
    fn from(result: Result<RpcReply, AgentError>) -> Self {
        match result {
            Ok(reply) => RpcResponse::Result(reply),
            Err(e) => RpcResponse::Error(e.to_wire()),
        }
    }
}

impl RpcResponse {
    pub fn into_result(self) -> Result<RpcReply, WireError> {
        match self {
            RpcResponse::Result(reply) => Ok(reply),
            RpcResponse::Error(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn requests_use_method_and_params() {
        let request = RpcRequest::Command {
            device_name: "ar1".into(),
            command: "show version".into(),
            mode: None,
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"method": "command", "params": {"device_name": "ar1", "command": "show version"}})
        );

        let parsed: RpcRequest = serde_json::from_value(json!({
            "method": "set_config",
            "params": {"device_name": "cr1", "destination": "/var/tmp/x", "data": "aGk=", "mode": "cli"}
        }))
        .unwrap();
        assert_eq!(parsed.method(), "set_config");
        assert_eq!(parsed.device_name(), Some("cr1"));
    }

    #[test]
    fn unknown_methods_are_rejected() {
        let parsed = serde_json::from_value::<RpcRequest>(json!({"method": "reboot", "params": {}}));
        assert!(parsed.is_err());
    }

    #[test]
    fn responses_wrap_results_and_errors() {
        let ok = RpcResponse::from(Ok(RpcReply::Payload(encode_payload(b"\x00\xffok"))));
        let text = serde_json::to_string(&ok).unwrap();
        assert_eq!(text, r#"{"result":"AP9vaw=="}"#);
        let back: RpcResponse = serde_json::from_str(&text).unwrap();
        assert_eq!(back.into_result().unwrap().payload().unwrap().unwrap(), b"\x00\xffok");

        let err = RpcResponse::from(Err(AgentError::NotFound("ar9".into())));
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["error"]["code"], 3);
        assert_eq!(value["error"]["kind"], "NotFound");
    }

    #[test]
    fn replies_deserialise_by_shape() {
        let names: RpcReply = serde_json::from_str(r#"["ar1","cr1"]"#).unwrap();
        assert_eq!(names, RpcReply::DeviceNames(vec!["ar1".into(), "cr1".into()]));
        let ack: RpcReply = serde_json::from_str("true").unwrap();
        assert_eq!(ack, RpcReply::Ack(true));
        let info: RpcReply = serde_json::from_str("{}").unwrap();
        assert_eq!(info, RpcReply::DeviceInfo(BTreeMap::new()));
    }

    #[test]
    fn bad_base64_is_an_invalid_request() {
        assert!(matches!(decode_payload("not base64!"), Err(AgentError::InvalidRequest(_))));
        assert_eq!(decode_payload(" aGk=\n").unwrap(), b"hi");
    }
}
