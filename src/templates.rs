//! Predefined vendor dialects.
//!
//! A dialect describes everything the expect driver needs to know about a
//! CLI: how its prompts look, how login and privilege escalation go, how to
//! turn the pager off and which modes it can switch into. Dialects are
//! written as [`DialectSpec`] constants and compiled into [`Dialect`]s when a
//! driver is built.

use regex::bytes::Regex;

use crate::device::{ConnectMethod, DeviceType};
use crate::error::AgentError;

/// Built-in dialect names supported by this crate.
pub const BUILTIN_DIALECTS: &[&str] = &[
    "ios", "timos", "ftos", "screenos", "esr", "esu", "baystack", "omniswitch", "arbos", "adva",
    "nos", "binos",
];

/// Static description of the privilege escalation dialogue.
#[derive(Debug, Clone, Copy)]
pub struct EnableSpec {
    pub command: &'static str,
    pub password_prompt: &'static str,
    /// Output meaning the enable password was refused.
    pub failure: &'static str,
    /// Matches the prompt once privileged.
    pub enabled_prompt: &'static str,
}

/// Static description of a vendor CLI.
#[derive(Debug, Clone, Copy)]
pub struct DialectSpec {
    pub name: &'static str,
    /// Matches the CLI prompt at the very end of the received output.
    pub prompt: &'static str,
    pub login_prompt: &'static str,
    pub password_prompt: &'static str,
    /// Banner that needs a keystroke before login continues.
    pub pre_login: Option<(&'static str, &'static [u8])>,
    /// Banners meaning the device will not accept a login right now.
    pub login_errors: &'static [&'static str],
    /// Banners meaning the credential was refused.
    pub auth_failures: &'static [&'static str],
    pub enable: Option<EnableSpec>,
    /// Commands run once after login.
    pub pager_disable: &'static [&'static str],
    pub pager_prompt: Option<&'static str>,
    pub exit_command: &'static str,
    /// Output lines meaning a file could not be read.
    pub error_patterns: &'static [&'static str],
    /// `(name, enter command, exit command)`.
    pub modes: &'static [(&'static str, &'static str, &'static str)],
    /// Command printing a file, `{}` is replaced by the path.
    pub get_file_command: Option<&'static str>,
    /// Supported transports, the first one is the default.
    pub connect_methods: &'static [ConnectMethod],
    pub auto_enable: bool,
}

const BOTH: &[ConnectMethod] = &[ConnectMethod::Ssh, ConnectMethod::Telnet];
const SSH_ONLY: &[ConnectMethod] = &[ConnectMethod::Ssh];
const TELNET_FIRST: &[ConnectMethod] = &[ConnectMethod::Telnet, ConnectMethod::Ssh];

const AUTH_FAILURES: &[&str] = &[
    r"% ?Bad passwords?",
    r"% ?Login invalid",
    r"% ?Authentication failed",
    r"Login incorrect",
    r"Access denied",
];

pub const IOS: DialectSpec = DialectSpec {
    name: "ios",
    prompt: r"(?m)^[^\s>#]+(?:\([^)\r\n]*\))?[>#] ?\z",
    login_prompt: r"[Uu]sername: ?\z",
    password_prompt: r"[Pp]assword: ?\z",
    pre_login: None,
    login_errors: &[r"Password required, but none set", r"Sorry, session limit reached"],
    auth_failures: AUTH_FAILURES,
    enable: Some(EnableSpec {
        command: "enable",
        password_prompt: r"[Pp]assword: ?\z",
        failure: r"% ?(?:Bad secrets|Access denied)",
        enabled_prompt: r"# ?\z",
    }),
    pager_disable: &["terminal length 0"],
    pager_prompt: Some(r" ?--More-- ?"),
    exit_command: "exit",
    error_patterns: &[r"(?m)^%(?: ?Error| ?Invalid|.*[Nn]o such file)"],
    modes: &[("config", "configure terminal", "end")],
    get_file_command: Some("more {}"),
    connect_methods: BOTH,
    auto_enable: true,
};

pub const TIMOS: DialectSpec = DialectSpec {
    name: "timos",
    prompt: r"(?m)^\*?[AB]:[^\s>#]+[>#] ?\z",
    login_prompt: r"[Ll]ogin: ?\z",
    enable: Some(EnableSpec {
        command: "enable-admin",
        password_prompt: r"[Pp]assword: ?\z",
        failure: r"(?i)MINOR: CLI Invalid password",
        enabled_prompt: r"# ?\z",
    }),
    pager_disable: &["environment no more"],
    pager_prompt: Some(r"Press any key to continue \(Q to quit\)"),
    exit_command: "logout",
    error_patterns: &[r"(?m)^(?:MINOR|MAJOR|CRITICAL): "],
    modes: &[],
    get_file_command: Some("file type {}"),
    ..IOS
};

pub const FTOS: DialectSpec = DialectSpec {
    name: "ftos",
    modes: &[("config", "configure", "end")],
    ..IOS
};

pub const SCREENOS: DialectSpec = DialectSpec {
    name: "screenos",
    prompt: r"(?m)^[^\s>#]+(?:\([^)\r\n]*\))?-> ?\z",
    login_prompt: r"login: ?\z",
    enable: None,
    pager_disable: &["set console page 0"],
    pager_prompt: Some(r"--- more ---"),
    error_patterns: &[r"(?m)^\s*\^?-+unknown keyword"],
    modes: &[],
    get_file_command: None,
    connect_methods: SSH_ONLY,
    auto_enable: false,
    ..IOS
};

pub const ESR: DialectSpec = DialectSpec {
    name: "esr",
    login_prompt: r"[Ll]ogin: ?\z",
    password_prompt: r"Password: ?\z",
    enable: None,
    pager_disable: &["config cli more false"],
    pager_prompt: Some(r"--More-- \(q = quit\)"),
    exit_command: "logout",
    modes: &[],
    get_file_command: None,
    auto_enable: false,
    ..IOS
};

pub const ESU: DialectSpec = DialectSpec {
    name: "esu",
    pager_disable: &["disable clipaging"],
    pager_prompt: Some(r"Press any key to continue"),
    ..ESR
};

pub const BAYSTACK: DialectSpec = DialectSpec {
    name: "baystack",
    pre_login: Some((r"Enter Ctrl-Y to begin", b"\x19")),
    password_prompt: r"Enter Password: ?\z",
    auth_failures: &[r"nvalid [pP]assword"],
    pager_disable: &["terminal length 0"],
    pager_prompt: Some(r"----More \(q=Quit, space/return=Continue\)----"),
    exit_command: "logout",
    connect_methods: TELNET_FIRST,
    ..ESR
};

pub const OMNISWITCH: DialectSpec = DialectSpec {
    name: "omniswitch",
    prompt: r"(?m)^[^\r\n]*-> ?\z",
    login_prompt: r"login : ?\z",
    password_prompt: r"password : ?\z",
    enable: None,
    pager_disable: &[],
    pager_prompt: Some(r"More\.\.\. \(Enter for more, Q to quit\)"),
    modes: &[],
    get_file_command: None,
    auto_enable: false,
    ..IOS
};

pub const ARBOS: DialectSpec = DialectSpec {
    name: "arbos",
    prompt: r"(?m)^[^\s]+@[^\s:]+:[^\r\n]*# ?\z",
    enable: None,
    pager_disable: &[],
    pager_prompt: None,
    modes: &[],
    get_file_command: None,
    connect_methods: SSH_ONLY,
    auto_enable: false,
    ..IOS
};

pub const ADVA: DialectSpec = DialectSpec {
    name: "adva",
    prompt: r"(?m)^[^\r\n]*--> ?\z",
    login_prompt: r"[Ll]ogin: ?\z",
    enable: None,
    pager_disable: &[],
    pager_prompt: None,
    exit_command: "logout",
    modes: &[],
    get_file_command: None,
    auto_enable: false,
    ..IOS
};

pub const NOS: DialectSpec = DialectSpec {
    name: "nos",
    enable: None,
    modes: &[("config", "configure terminal", "end")],
    get_file_command: Some("show file {}"),
    connect_methods: SSH_ONLY,
    auto_enable: false,
    ..IOS
};

pub const BINOS: DialectSpec = DialectSpec {
    name: "binos",
    login_prompt: r"(?:[Uu]sername|[Ll]ogin): ?\z",
    modes: &[("config", "configure terminal", "end")],
    get_file_command: None,
    ..IOS
};

/// A named CLI mode.
#[derive(Debug, Clone)]
pub struct Mode {
    pub name: String,
    pub enter: String,
    pub exit: String,
}

#[derive(Debug, Clone)]
pub struct Enable {
    pub command: String,
    pub password_prompt: Regex,
    pub failure: Regex,
    pub enabled_prompt: Regex,
}

/// A compiled dialect.
#[derive(Debug, Clone)]
pub struct Dialect {
    pub name: String,
    pub prompt: Regex,
    pub login_prompt: Regex,
    pub password_prompt: Regex,
    pub pre_login: Option<(Regex, Vec<u8>)>,
    pub login_errors: Vec<Regex>,
    pub auth_failures: Vec<Regex>,
    pub enable: Option<Enable>,
    pub pager_disable: Vec<String>,
    pub pager_prompt: Option<Regex>,
    pub exit_command: String,
    pub error_patterns: Vec<Regex>,
    pub modes: Vec<Mode>,
    pub get_file_command: Option<String>,
    pub connect_methods: Vec<ConnectMethod>,
    pub default_connect_method: ConnectMethod,
    pub auto_enable: bool,
}

fn re(pattern: &str) -> Result<Regex, AgentError> {
    Regex::new(pattern)
        .map_err(|e| AgentError::Internal(format!("dialect pattern {pattern:?}: {e}")))
}

fn all(patterns: &[&str]) -> Result<Vec<Regex>, AgentError> {
    patterns.iter().map(|p| re(p)).collect()
}

impl DialectSpec {
    pub fn compile(&self) -> Result<Dialect, AgentError> {
        let enable = match self.enable {
            Some(spec) => Some(Enable {
                command: spec.command.to_string(),
                password_prompt: re(spec.password_prompt)?,
                failure: re(spec.failure)?,
                enabled_prompt: re(spec.enabled_prompt)?,
            }),
            None => None,
        };
        let pre_login = match self.pre_login {
            Some((banner, keys)) => Some((re(banner)?, keys.to_vec())),
            None => None,
        };
        Ok(Dialect {
            name: self.name.to_string(),
            prompt: re(self.prompt)?,
            login_prompt: re(self.login_prompt)?,
            password_prompt: re(self.password_prompt)?,
            pre_login,
            login_errors: all(self.login_errors)?,
            auth_failures: all(self.auth_failures)?,
            enable,
            pager_disable: self.pager_disable.iter().map(|c| c.to_string()).collect(),
            pager_prompt: self.pager_prompt.map(re).transpose()?,
            exit_command: self.exit_command.to_string(),
            error_patterns: all(self.error_patterns)?,
            modes: self
                .modes
                .iter()
                .map(|(name, enter, exit)| Mode {
                    name: name.to_string(),
                    enter: enter.to_string(),
                    exit: exit.to_string(),
                })
                .collect(),
            get_file_command: self.get_file_command.map(str::to_string),
            connect_methods: self.connect_methods.to_vec(),
            default_connect_method: self
                .connect_methods
                .first()
                .copied()
                .unwrap_or(ConnectMethod::Ssh),
            auto_enable: self.auto_enable,
        })
    }
}

impl Dialect {
    pub fn mode(&self, name: &str) -> Option<&Mode> {
        self.modes.iter().find(|m| m.name.eq_ignore_ascii_case(name))
    }
}

/// How a device type is driven.
#[derive(Debug, Clone)]
pub enum DriverTemplate {
    /// One SSH exec channel per command.
    Exec,
    /// Interactive CLI described by a dialect.
    Expect(Dialect),
}

/// Returns the static spec of a built-in dialect by name (case-insensitive).
pub fn spec_by_name(name: &str) -> Option<&'static DialectSpec> {
    let spec = match name.to_ascii_lowercase().as_str() {
        "ios" => &IOS,
        "timos" => &TIMOS,
        "ftos" => &FTOS,
        "screenos" => &SCREENOS,
        "esr" => &ESR,
        "esu" => &ESU,
        "baystack" => &BAYSTACK,
        "omniswitch" => &OMNISWITCH,
        "arbos" => &ARBOS,
        "adva" => &ADVA,
        "nos" => &NOS,
        "binos" => &BINOS,
        _ => return None,
    };
    Some(spec)
}

/// Compiles a built-in dialect by name.
pub fn by_name(name: &str) -> Result<Dialect, AgentError> {
    spec_by_name(name)
        .ok_or_else(|| AgentError::InvalidRequest(format!("unknown dialect {name:?}")))?
        .compile()
}

/// Driver template for a device type.
pub fn template_for(device_type: DeviceType) -> Result<DriverTemplate, AgentError> {
    let spec = match device_type {
        DeviceType::Juniper => return Ok(DriverTemplate::Exec),
        DeviceType::CiscoIos => &IOS,
        DeviceType::Timetra => &TIMOS,
        DeviceType::Force10 => &FTOS,
        DeviceType::Netscreen => &SCREENOS,
        DeviceType::NortelEsr => &ESR,
        DeviceType::NortelEsu => &ESU,
        DeviceType::NortelBay => &BAYSTACK,
        DeviceType::Omniswitch => &OMNISWITCH,
        DeviceType::Arbor => &ARBOS,
        DeviceType::AdvaFsp => &ADVA,
        DeviceType::Nos => &NOS,
        DeviceType::Telco => &BINOS,
    };
    Ok(DriverTemplate::Expect(spec.compile()?))
}
