//! SSH connection setup shared by the exec and shell drivers.

use std::fmt::Display;
use std::time::Duration;

use async_ssh2_tokio::Config;
use async_ssh2_tokio::client::{AuthMethod, Client};
use log::debug;

use super::security::ConnectionSecurityOptions;
use crate::credential::Credential;
use crate::device::split_host_port;
use crate::error::AgentError;

const SSH_PORT: u16 = 22;

/// Idle SSH connections are dropped by the library after this long.
const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(3600);

fn auth_method(credential: &Credential) -> AuthMethod {
    match (&credential.ssh_private_key, &credential.password) {
        (Some(key), _) => AuthMethod::with_key(key, credential.password.as_deref()),
        (None, Some(password)) => AuthMethod::with_password(password),
        (None, None) => AuthMethod::with_password(""),
    }
}

/// Maps a connection-phase library error onto the agent taxonomy.
pub(crate) fn classify_connect_error(err: async_ssh2_tokio::Error) -> AgentError {
    match err {
        async_ssh2_tokio::Error::PasswordWrong | async_ssh2_tokio::Error::KeyAuthFailed => {
            AgentError::Auth(err.to_string())
        }
        async_ssh2_tokio::Error::KeyInvalid(_) => AgentError::Auth(err.to_string()),
        other => AgentError::Connect(other.to_string()),
    }
}

/// Wraps a mid-session failure as retryable.
pub(crate) fn transient<E: Display>(context: &'static str) -> impl FnOnce(E) -> AgentError {
    move |e| AgentError::TransientIo(format!("{context}: {e}"))
}

/// Opens an authenticated SSH connection to `address`.
pub(crate) async fn connect(
    address: &str,
    port_override: Option<u16>,
    credential: &Credential,
    security: &ConnectionSecurityOptions,
    timeout: Duration,
) -> Result<Client, AgentError> {
    let (host, port) = split_host_port(address, port_override.unwrap_or(SSH_PORT));
    let config = Config {
        preferred: security.preferred(),
        inactivity_timeout: Some(INACTIVITY_TIMEOUT),
        ..Default::default()
    };

    debug!("{}@{}:{} opening SSH connection", credential.username, host, port);
    let connecting = Client::connect_with_config(
        (host.clone(), port),
        &credential.username,
        auth_method(credential),
        security.server_check.clone(),
        config,
    );
    match tokio::time::timeout(timeout, connecting).await {
        Ok(Ok(client)) => {
            debug!("{}:{} SSH connection established", host, port);
            Ok(client)
        }
        Ok(Err(e)) => Err(classify_connect_error(e)),
        Err(_) => Err(AgentError::Timeout(format!(
            "SSH connect to {host}:{port} took longer than {timeout:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authentication_failures_are_not_retryable() {
        let err = classify_connect_error(async_ssh2_tokio::Error::PasswordWrong);
        assert!(matches!(err, AgentError::Auth(_)));
        assert!(!err.is_retryable());
        let err = classify_connect_error(async_ssh2_tokio::Error::KeyAuthFailed);
        assert!(matches!(err, AgentError::Auth(_)));
    }

    #[test]
    fn other_failures_are_connect_errors() {
        let err = classify_connect_error(async_ssh2_tokio::Error::ServerCheckFailed);
        assert!(matches!(err, AgentError::Connect(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn transient_wraps_with_context() {
        let err = transient::<&str>("open channel")("broken pipe");
        assert_eq!(
            err,
            AgentError::TransientIo("open channel: broken pipe".to_string())
        );
    }
}
