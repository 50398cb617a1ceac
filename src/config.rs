//! Agent configuration and SSH algorithm profiles.
//!
//! [`AgentConfig`] is loaded from YAML:
//!
//! ```yaml
//! options:
//!   credentials: /etc/notch/credentials.yaml
//!   max_workers: 64
//!   max_sessions: 512
//!   session_maint_period: 10
//!   security: legacy_compatible
//! devices:
//!   - name: ar1.mel
//!     device_type: cisco
//!     addresses: [10.0.0.1]
//! device_types:
//!   juniper:
//!     idle_timeout: 600
//!     long_response_timeout: 300
//! ```
//!
//! The algorithm lists at the bottom of this module back the
//! [`SecurityLevel`](crate::driver::security::SecurityLevel) profiles.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use russh::keys::{Algorithm, EcdsaCurve, HashAlg};
use russh::{cipher, compression, kex, mac};
use serde::Deserialize;

use crate::device::{DeviceDescriptor, DeviceType};
use crate::driver::security::SecurityLevel;
use crate::error::ConfigError;

/// Sessions idle longer than this are closed by the sweeper.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(1800);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Time allowed for a device to start answering a command.
pub const DEFAULT_SHORT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(4);
/// Time allowed for a command to run to completion.
pub const DEFAULT_LONG_RESPONSE_TIMEOUT: Duration = Duration::from_secs(180);
pub const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_SESSION_MAINT_PERIOD: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_WORKERS: usize = 64;
pub const DEFAULT_MAX_SESSIONS: usize = 512;

/// Timeouts applied by a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub short_response: Duration,
    pub long_response: Duration,
    pub disconnect: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: DEFAULT_CONNECT_TIMEOUT,
            short_response: DEFAULT_SHORT_RESPONSE_TIMEOUT,
            long_response: DEFAULT_LONG_RESPONSE_TIMEOUT,
            disconnect: DEFAULT_DISCONNECT_TIMEOUT,
        }
    }
}

fn secs(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0))
}

/// Top-level agent configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub options: Options,
    /// Devices served by the built-in static inventory provider.
    pub devices: Vec<DeviceDescriptor>,
    pub device_types: HashMap<DeviceType, DeviceTypeOptions>,
}

/// Agent-wide options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Path of the credential YAML file.
    pub credentials: Option<PathBuf>,
    /// Upper bound on concurrent device operations.
    pub max_workers: usize,
    /// Upper bound on cached sessions; the least recently used idle
    /// session is closed to make room.
    pub max_sessions: usize,
    /// Idle-sweep period in seconds.
    pub session_maint_period: f64,
    pub security: SecurityLevel,
    /// Verify SSH host keys against the user's known_hosts file.
    pub host_key_check: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            credentials: None,
            max_workers: DEFAULT_MAX_WORKERS,
            max_sessions: DEFAULT_MAX_SESSIONS,
            session_maint_period: DEFAULT_SESSION_MAINT_PERIOD.as_secs_f64(),
            security: SecurityLevel::LegacyCompatible,
            host_key_check: false,
        }
    }
}

/// Per-device-type overrides, all durations in seconds.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DeviceTypeOptions {
    pub idle_timeout: Option<f64>,
    pub connect_timeout: Option<f64>,
    pub short_response_timeout: Option<f64>,
    pub long_response_timeout: Option<f64>,
    pub disconnect_timeout: Option<f64>,
    /// Enter privileged mode right after login when an enable password is known.
    pub auto_enable: Option<bool>,
    /// Port override for every address of this device type.
    pub port: Option<u16>,
}

impl AgentConfig {
    pub fn from_yaml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Option<AgentConfig> = serde_yaml::from_str(source)?;
        Ok(config.unwrap_or_default())
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&source)
    }

    fn type_options(&self, device_type: DeviceType) -> Option<&DeviceTypeOptions> {
        self.device_types.get(&device_type)
    }

    pub fn timeouts_for(&self, device_type: DeviceType) -> Timeouts {
        let defaults = Timeouts::default();
        let Some(opts) = self.type_options(device_type) else {
            return defaults;
        };
        Timeouts {
            connect: opts.connect_timeout.map(secs).unwrap_or(defaults.connect),
            short_response: opts
                .short_response_timeout
                .map(secs)
                .unwrap_or(defaults.short_response),
            long_response: opts
                .long_response_timeout
                .map(secs)
                .unwrap_or(defaults.long_response),
            disconnect: opts
                .disconnect_timeout
                .map(secs)
                .unwrap_or(defaults.disconnect),
        }
    }

    pub fn idle_timeout_for(&self, device_type: DeviceType) -> Duration {
        self.type_options(device_type)
            .and_then(|opts| opts.idle_timeout)
            .map(secs)
            .unwrap_or(DEFAULT_IDLE_TIMEOUT)
    }

    pub fn auto_enable_for(&self, device_type: DeviceType) -> Option<bool> {
        self.type_options(device_type).and_then(|opts| opts.auto_enable)
    }

    pub fn port_for(&self, device_type: DeviceType) -> Option<u16> {
        self.type_options(device_type).and_then(|opts| opts.port)
    }

    pub fn session_maint_period(&self) -> Duration {
        secs(self.options.session_maint_period)
    }

    /// Sets the idle threshold for a device type.
    pub fn with_idle_timeout(mut self, device_type: DeviceType, idle: Duration) -> Self {
        self.device_types.entry(device_type).or_default().idle_timeout = Some(idle.as_secs_f64());
        self
    }
}

/// Key exchange algorithms without known weaknesses.
pub const SECURE_KEX_ORDER: &[kex::Name] = &[
    kex::CURVE25519,
    kex::CURVE25519_PRE_RFC_8731,
    kex::ECDH_SHA2_NISTP256,
    kex::ECDH_SHA2_NISTP384,
    kex::ECDH_SHA2_NISTP521,
    kex::DH_G16_SHA512,
    kex::DH_G14_SHA256,
];

pub const BALANCED_KEX_ORDER: &[kex::Name] = &[
    kex::CURVE25519,
    kex::CURVE25519_PRE_RFC_8731,
    kex::ECDH_SHA2_NISTP256,
    kex::ECDH_SHA2_NISTP384,
    kex::ECDH_SHA2_NISTP521,
    kex::DH_GEX_SHA256,
    kex::DH_G16_SHA512,
    kex::DH_G14_SHA256,
    kex::DH_G14_SHA1,
];

/// Everything russh can negotiate, including SHA-1 groups older IOS needs.
pub const LEGACY_KEX_ORDER: &[kex::Name] = &[
    kex::CURVE25519,
    kex::CURVE25519_PRE_RFC_8731,
    kex::DH_GEX_SHA1,
    kex::DH_GEX_SHA256,
    kex::DH_G1_SHA1,
    kex::DH_G14_SHA1,
    kex::DH_G14_SHA256,
    kex::DH_G15_SHA512,
    kex::DH_G16_SHA512,
    kex::DH_G17_SHA512,
    kex::DH_G18_SHA512,
    kex::ECDH_SHA2_NISTP256,
    kex::ECDH_SHA2_NISTP384,
    kex::ECDH_SHA2_NISTP521,
    kex::NONE,
];

pub const SECURE_CIPHERS: &[cipher::Name] = &[
    cipher::CHACHA20_POLY1305,
    cipher::AES_256_GCM,
    cipher::AES_256_CTR,
    cipher::AES_192_CTR,
    cipher::AES_128_CTR,
];

pub const BALANCED_CIPHERS: &[cipher::Name] = &[
    cipher::CHACHA20_POLY1305,
    cipher::AES_256_GCM,
    cipher::AES_256_CTR,
    cipher::AES_192_CTR,
    cipher::AES_128_CTR,
    cipher::AES_256_CBC,
    cipher::AES_128_CBC,
];

pub const LEGACY_CIPHERS: &[cipher::Name] = &[
    cipher::AES_128_CTR,
    cipher::AES_192_CTR,
    cipher::AES_256_CTR,
    cipher::AES_256_GCM,
    cipher::CHACHA20_POLY1305,
    cipher::AES_128_CBC,
    cipher::AES_192_CBC,
    cipher::AES_256_CBC,
    cipher::CLEAR,
    cipher::NONE,
];

pub const SECURE_MAC_ALGORITHMS: &[mac::Name] = &[
    mac::HMAC_SHA512_ETM,
    mac::HMAC_SHA256_ETM,
    mac::HMAC_SHA512,
    mac::HMAC_SHA256,
];

pub const BALANCED_MAC_ALGORITHMS: &[mac::Name] = &[
    mac::HMAC_SHA512_ETM,
    mac::HMAC_SHA256_ETM,
    mac::HMAC_SHA512,
    mac::HMAC_SHA256,
    mac::HMAC_SHA1_ETM,
    mac::HMAC_SHA1,
];

pub const LEGACY_MAC_ALGORITHMS: &[mac::Name] = &[
    mac::HMAC_SHA256,
    mac::HMAC_SHA512,
    mac::HMAC_SHA1,
    mac::HMAC_SHA256_ETM,
    mac::HMAC_SHA512_ETM,
    mac::HMAC_SHA1_ETM,
    mac::NONE,
];

pub const DEFAULT_COMPRESSION_ALGORITHMS: &[compression::Name] = &[
    compression::NONE,
    compression::ZLIB,
    compression::ZLIB_LEGACY,
];

pub const SECURE_KEY_TYPES: &[Algorithm] = &[
    Algorithm::Ed25519,
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP256,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP384,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP521,
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha512),
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha256),
    },
];

pub const BALANCED_KEY_TYPES: &[Algorithm] = &[
    Algorithm::Ed25519,
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP256,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP384,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP521,
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha512),
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha256),
    },
    Algorithm::Rsa { hash: None },
];

/// Includes ssh-rsa (SHA-1) and DSA host keys still found on old gear.
pub const LEGACY_KEY_TYPES: &[Algorithm] = &[
    Algorithm::Ed25519,
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP256,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP384,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP521,
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha512),
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha256),
    },
    Algorithm::Rsa { hash: None },
    Algorithm::Dsa,
];
