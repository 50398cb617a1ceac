//! Credential rules and their resolution against device names.
//!
//! A credential file is an ordered YAML list of rules. Each rule carries an
//! anchored, case-insensitive regular expression matched against the device
//! name. When several rules match, the one appearing **last** in the file
//! wins, so general rules go first and specific overrides go last:
//!
//! ```yaml
//! - regexp: .*
//!   username: netops
//!   password: default-secret
//! - regexp: ^ar.*
//!   username: core
//!   password: core-secret
//!   enable_password: core-enable
//!   connect_method: telnet
//! ```

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use log::debug;
use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::device::ConnectMethod;
use crate::error::{AgentError, ConfigError};

/// Anchors a user-supplied pattern so it must match the whole name.
///
/// Existing `^`/`$` anchors are folded into the added ones; an escaped
/// `\$` stays a literal dollar.
pub(crate) fn anchor(pattern: &str) -> String {
    let body = pattern.strip_prefix('^').unwrap_or(pattern);
    let body = match body.strip_suffix('$') {
        Some(rest) if !ends_with_escape(rest) => rest,
        _ => body,
    };
    format!("^(?:{body})$")
}

/// True when `s` ends in an odd run of backslashes.
fn ends_with_escape(s: &str) -> bool {
    s.bytes().rev().take_while(|b| *b == b'\\').count() % 2 == 1
}

/// Builds the anchored, case-insensitive matcher used for device names.
pub(crate) fn name_matcher(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(&anchor(pattern))
        .case_insensitive(true)
        .build()
}

#[derive(Debug, Deserialize)]
struct CredentialRecord {
    regexp: Option<String>,
    username: Option<String>,
    password: Option<String>,
    enable_password: Option<String>,
    ssh_private_key: Option<String>,
    connect_method: Option<ConnectMethod>,
    auto_enable: Option<bool>,
}

/// One credential rule.
#[derive(Clone)]
pub struct Credential {
    pattern: String,
    matcher: Regex,
    pub username: String,
    pub password: Option<String>,
    pub enable_password: Option<String>,
    /// PEM/OpenSSH private key material, used instead of the password.
    pub ssh_private_key: Option<String>,
    /// Overrides the device type's default transport.
    pub connect_method: Option<ConnectMethod>,
    /// Overrides the device type's auto-enable setting.
    pub auto_enable: Option<bool>,
}

impl Credential {
    pub fn new(pattern: &str, username: impl Into<String>) -> Result<Self, ConfigError> {
        let matcher = name_matcher(pattern).map_err(|source| ConfigError::InvalidRegex {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self {
            pattern: pattern.to_string(),
            matcher,
            username: username.into(),
            password: None,
            enable_password: None,
            ssh_private_key: None,
            connect_method: None,
            auto_enable: None,
        })
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_enable_password(mut self, enable_password: impl Into<String>) -> Self {
        self.enable_password = Some(enable_password.into());
        self
    }

    pub fn with_connect_method(mut self, method: ConnectMethod) -> Self {
        self.connect_method = Some(method);
        self
    }

    pub fn with_auto_enable(mut self, auto_enable: bool) -> Self {
        self.auto_enable = Some(auto_enable);
        self
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn matches(&self, device_name: &str) -> bool {
        !device_name.is_empty() && self.matcher.is_match(device_name)
    }

    /// SHA-256 over everything that affects how a session is established.
    ///
    /// Two credentials with equal fingerprints produce interchangeable sessions.
    pub fn fingerprint(&self) -> [u8; 32] {
        fn field(hasher: &mut Sha256, value: Option<&str>) {
            match value {
                Some(v) => {
                    hasher.update([1u8]);
                    hasher.update((v.len() as u64).to_be_bytes());
                    hasher.update(v.as_bytes());
                }
                None => hasher.update([0u8]),
            }
        }

        let mut hasher = Sha256::new();
        field(&mut hasher, Some(&self.username));
        field(&mut hasher, self.password.as_deref());
        field(&mut hasher, self.enable_password.as_deref());
        field(&mut hasher, self.ssh_private_key.as_deref());
        let method = self.connect_method.map(|m| m.to_string());
        field(&mut hasher, method.as_deref());
        let auto_enable = self.auto_enable.map(|v| v.to_string());
        field(&mut hasher, auto_enable.as_deref());
        hasher.finalize().into()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("pattern", &self.pattern)
            .field("username", &self.username)
            .field("password", &self.password.is_some())
            .field("enable_password", &self.enable_password.is_some())
            .field("ssh_private_key", &self.ssh_private_key.is_some())
            .field("connect_method", &self.connect_method)
            .field("auto_enable", &self.auto_enable)
            .finish()
    }
}

/// Ordered set of credential rules.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    rules: Vec<Arc<Credential>>,
}

impl CredentialStore {
    pub fn new(rules: Vec<Credential>) -> Self {
        Self {
            rules: rules.into_iter().map(Arc::new).collect(),
        }
    }

    /// Parses a YAML credential list.
    pub fn from_yaml_str(source: &str) -> Result<Self, ConfigError> {
        let records: Option<Vec<CredentialRecord>> = serde_yaml::from_str(source)?;
        let mut rules = Vec::new();
        for (index, record) in records.unwrap_or_default().into_iter().enumerate() {
            let username = record
                .username
                .ok_or(ConfigError::MissingField { index, field: "username" })?;
            let pattern = record.regexp.unwrap_or_else(|| ".*".to_string());
            let mut credential = Credential::new(&pattern, username)?;
            credential.password = record.password;
            credential.enable_password = record.enable_password;
            credential.ssh_private_key = record.ssh_private_key;
            credential.connect_method = record.connect_method;
            credential.auto_enable = record.auto_enable;
            rules.push(credential);
        }
        debug!("loaded {} credential rules", rules.len());
        Ok(Self::new(rules))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&source)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Returns the last rule matching `device_name`.
    ///
    /// Fails closed: no match is [`AgentError::NoCredential`], never a
    /// default credential.
    pub fn resolve(&self, device_name: &str) -> Result<Arc<Credential>, AgentError> {
        self.rules
            .iter()
            .rev()
            .find(|rule| rule.matches(device_name))
            .cloned()
            .ok_or_else(|| AgentError::NoCredential(device_name.to_string()))
    }
}
