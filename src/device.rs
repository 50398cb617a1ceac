//! Device model: vendor types, connection methods and device descriptors.

use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Vendor / operating-system family of a device.
///
/// Names follow the RANCID `router.db` vocabulary so that existing
/// inventories can be fed in unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    /// Cisco IOS and IOS-like CLIs.
    #[serde(rename = "cisco", alias = "cisco_ios", alias = "ios")]
    CiscoIos,
    /// Juniper JunOS, driven over SSH exec channels.
    #[serde(alias = "junos")]
    Juniper,
    /// Alcatel-Lucent TiMOS.
    #[serde(alias = "timos")]
    Timetra,
    /// Force10 FTOS.
    #[serde(alias = "ftos")]
    Force10,
    /// Juniper ScreenOS firewalls.
    Netscreen,
    NortelEsr,
    NortelEsu,
    NortelBay,
    Omniswitch,
    Arbor,
    AdvaFsp,
    Nos,
    /// Telco Systems BiNOS.
    #[serde(alias = "binos")]
    Telco,
}

impl DeviceType {
    pub const ALL: &'static [DeviceType] = &[
        DeviceType::CiscoIos,
        DeviceType::Juniper,
        DeviceType::Timetra,
        DeviceType::Force10,
        DeviceType::Netscreen,
        DeviceType::NortelEsr,
        DeviceType::NortelEsu,
        DeviceType::NortelBay,
        DeviceType::Omniswitch,
        DeviceType::Arbor,
        DeviceType::AdvaFsp,
        DeviceType::Nos,
        DeviceType::Telco,
    ];

    /// Canonical (RANCID) name.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::CiscoIos => "cisco",
            DeviceType::Juniper => "juniper",
            DeviceType::Timetra => "timetra",
            DeviceType::Force10 => "force10",
            DeviceType::Netscreen => "netscreen",
            DeviceType::NortelEsr => "nortel_esr",
            DeviceType::NortelEsu => "nortel_esu",
            DeviceType::NortelBay => "nortel_bay",
            DeviceType::Omniswitch => "omniswitch",
            DeviceType::Arbor => "arbor",
            DeviceType::AdvaFsp => "adva_fsp",
            DeviceType::Nos => "nos",
            DeviceType::Telco => "telco",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        let found = match lowered.as_str() {
            "cisco_ios" | "ios" => Some(DeviceType::CiscoIos),
            "junos" => Some(DeviceType::Juniper),
            "timos" => Some(DeviceType::Timetra),
            "ftos" => Some(DeviceType::Force10),
            "binos" => Some(DeviceType::Telco),
            other => DeviceType::ALL.iter().copied().find(|t| t.as_str() == other),
        };
        found.ok_or_else(|| format!("unknown device type {s:?}"))
    }
}

/// Transport used to reach a device's CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ConnectMethod {
    #[serde(rename = "sshv2", alias = "ssh")]
    Ssh,
    Telnet,
}

impl ConnectMethod {
    pub fn default_port(&self) -> u16 {
        match self {
            ConnectMethod::Ssh => 22,
            ConnectMethod::Telnet => 23,
        }
    }
}

impl fmt::Display for ConnectMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectMethod::Ssh => f.write_str("sshv2"),
            ConnectMethod::Telnet => f.write_str("telnet"),
        }
    }
}

/// A device as known to the inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DeviceDescriptor {
    /// Unique name, e.g. `ar1.mel`.
    pub name: String,
    pub device_type: DeviceType,
    /// Addresses tried in order when connecting.
    #[serde(default)]
    pub addresses: Vec<String>,
    /// Name of the inventory provider that supplied this entry.
    #[serde(default)]
    pub source_provider: String,
}

impl DeviceDescriptor {
    pub fn new(name: impl Into<String>, device_type: DeviceType, addresses: Vec<String>) -> Self {
        Self {
            name: name.into(),
            device_type,
            addresses,
            source_provider: String::new(),
        }
    }

    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            device_name: self.name.clone(),
            device_type: self.device_type,
            addresses: self.addresses.clone(),
        }
    }
}

/// Public view of a device returned by `devices_info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DeviceInfo {
    pub device_name: String,
    pub device_type: DeviceType,
    pub addresses: Vec<String>,
}

/// Splits `host`, `host:port` or `[v6]:port` into host and port.
pub(crate) fn split_host_port(address: &str, default_port: u16) -> (String, u16) {
    if let Ok(sock) = address.parse::<std::net::SocketAddr>() {
        return (sock.ip().to_string(), sock.port());
    }
    if address.parse::<std::net::IpAddr>().is_ok() {
        return (address.to_string(), default_port);
    }
    match address.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => match port.parse::<u16>() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (address.to_string(), default_port),
        },
        _ => (address.to_string(), default_port),
    }
}
