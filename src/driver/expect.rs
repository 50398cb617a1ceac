//! Expect engine and the dialect-driven interactive CLI driver.
//!
//! [`Expect`] buffers device output and waits until one of a set of
//! patterns matches, the way a human watches a terminal for a prompt.
//! [`ExpectDriver`] uses it to log in, escalate privileges, page through
//! output and switch modes according to a [`Dialect`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::bytes::Regex;
use tokio::time::Instant;

use super::stream::{CliStream, StreamConnector};
use super::{Capabilities, Capability, DeviceDriver};
use crate::config::Timeouts;
use crate::credential::Credential;
use crate::error::AgentError;
use crate::templates::Dialect;

static NEWLINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\r?\n").expect("valid regex"));

/// Terminal control sequences and pager erase runs.
static TERMINAL_NOISE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b[()][0-9A-Za-z]|\x1b[=>78]|\x08+ *\x08*").expect("valid regex")
});

/// Removes terminal noise and carriage returns from CLI output.
pub fn clean_output(raw: &[u8]) -> Vec<u8> {
    TERMINAL_NOISE
        .replace_all(raw, &b""[..])
        .iter()
        .copied()
        .filter(|b| *b != b'\r')
        .collect()
}

/// Outcome of a successful [`Expect::expect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matched {
    /// Index of the pattern that matched.
    pub index: usize,
    /// Output received before the match.
    pub before: Vec<u8>,
    pub matched: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectError {
    /// The stream ended before any pattern matched.
    Eof,
    Timeout,
}

/// Pattern matcher over a [`CliStream`].
pub struct Expect {
    stream: Box<dyn CliStream>,
    buffer: Vec<u8>,
}

impl Expect {
    pub fn new(stream: Box<dyn CliStream>) -> Self {
        Self {
            stream,
            buffer: Vec::new(),
        }
    }

    pub async fn send(&mut self, data: &[u8]) -> Result<(), AgentError> {
        self.stream.send(data).await
    }

    pub async fn send_line(&mut self, line: &str) -> Result<(), AgentError> {
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');
        self.stream.send(&data).await
    }

    /// Drops buffered output and anything already waiting on the stream.
    pub fn discard_pending(&mut self) {
        self.buffer.clear();
        while self.stream.try_recv().is_some() {}
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_open()
    }

    pub async fn close(&mut self) {
        self.stream.close().await;
    }

    /// Earliest match in the buffer; ties go to the earlier pattern.
    fn search(&self, patterns: &[&Regex]) -> Option<(usize, usize, usize)> {
        let mut best: Option<(usize, usize, usize)> = None;
        for (index, pattern) in patterns.iter().enumerate() {
            if let Some(m) = pattern.find(&self.buffer) {
                if best.is_none_or(|(_, start, _)| m.start() < start) {
                    best = Some((index, m.start(), m.end()));
                }
            }
        }
        best
    }

    pub async fn expect(
        &mut self,
        patterns: &[&Regex],
        timeout: Duration,
    ) -> Result<Matched, ExpectError> {
        self.expect_until(patterns, Instant::now() + timeout).await
    }

    /// Waits until a pattern matches, consuming output up to the match end.
    pub async fn expect_until(
        &mut self,
        patterns: &[&Regex],
        deadline: Instant,
    ) -> Result<Matched, ExpectError> {
        loop {
            if let Some((index, start, end)) = self.search(patterns) {
                let matched = self.buffer[start..end].to_vec();
                let before = self.buffer[..start].to_vec();
                self.buffer.drain(..end);
                return Ok(Matched {
                    index,
                    before,
                    matched,
                });
            }
            match tokio::time::timeout_at(deadline, self.stream.recv()).await {
                Ok(Some(chunk)) => self.buffer.extend_from_slice(&chunk),
                Ok(None) => return Err(ExpectError::Eof),
                Err(_) => return Err(ExpectError::Timeout),
            }
        }
    }

    /// Reads until the peer closes or `deadline` passes.
    async fn drain_until_eof(&mut self, deadline: Instant) {
        while let Ok(Some(_)) = tokio::time::timeout_at(deadline, self.stream.recv()).await {}
    }
}

#[derive(Debug, Clone, Copy)]
enum LoginStep {
    Prompt,
    Username,
    Password,
    PreLogin,
    Refused,
    Unavailable,
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim().to_string()
}

/// Interactive CLI driver over SSH shell or telnet.
pub struct ExpectDriver {
    dialect: Arc<Dialect>,
    connector: Box<dyn StreamConnector>,
    timeouts: Timeouts,
    auto_enable: bool,
    session: Option<Expect>,
    /// Exact prompt learned after login, used to detect command completion.
    prompt: Option<Regex>,
    enabled: bool,
    label: String,
}

impl ExpectDriver {
    pub fn new(
        dialect: Arc<Dialect>,
        connector: Box<dyn StreamConnector>,
        timeouts: Timeouts,
        auto_enable: bool,
    ) -> Self {
        let label = dialect.name.clone();
        Self {
            dialect,
            connector,
            timeouts,
            auto_enable,
            session: None,
            prompt: None,
            enabled: false,
            label,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn session(&mut self) -> Result<&mut Expect, AgentError> {
        self.session
            .as_mut()
            .ok_or_else(|| AgentError::TransientIo("session is not connected".to_string()))
    }

    /// Remembers the prompt in `matched` so later commands wait for exactly it.
    fn learn_prompt(&mut self, matched: &[u8]) -> Result<(), AgentError> {
        let text = String::from_utf8_lossy(matched);
        let line = text.rsplit(['\r', '\n']).next().unwrap_or_default().trim();
        if line.is_empty() {
            self.prompt = None;
            return Ok(());
        }
        let pattern = format!(r"(?m)^{} ?\z", regex::escape(line));
        self.prompt = Some(
            Regex::new(&pattern)
                .map_err(|e| AgentError::Internal(format!("prompt {line:?}: {e}")))?,
        );
        debug!("{} prompt is {:?}", self.label, line);
        Ok(())
    }

    async fn login(&mut self, credential: &Credential, deadline: Instant) -> Result<(), AgentError> {
        let dialect = self.dialect.clone();
        let short = self.timeouts.short_response;
        let label = self.label.clone();

        let mut table: Vec<(&Regex, LoginStep)> = vec![
            (&dialect.prompt, LoginStep::Prompt),
            (&dialect.login_prompt, LoginStep::Username),
            (&dialect.password_prompt, LoginStep::Password),
        ];
        if let Some((banner, _)) = dialect.pre_login.as_ref() {
            table.push((banner, LoginStep::PreLogin));
        }
        table.extend(dialect.auth_failures.iter().map(|r| (r, LoginStep::Refused)));
        table.extend(dialect.login_errors.iter().map(|r| (r, LoginStep::Unavailable)));
        let patterns: Vec<&Regex> = table.iter().map(|(r, _)| *r).collect();

        let session = self.session()?;
        let mut woken = false;
        let mut usernames_sent = 0;
        let mut passwords_sent = 0;
        let matched = loop {
            let wait = if woken {
                deadline
            } else {
                deadline.min(Instant::now() + short)
            };
            let m = match session.expect_until(&patterns, wait).await {
                Ok(m) => m,
                Err(ExpectError::Timeout) if !woken && Instant::now() < deadline => {
                    // Some CLIs print nothing until they see a keystroke.
                    woken = true;
                    session.send(b"\n").await?;
                    continue;
                }
                Err(ExpectError::Timeout) => {
                    return Err(AgentError::Timeout(format!("{label}: no prompt after login")));
                }
                Err(ExpectError::Eof) => {
                    return Err(AgentError::Connect(format!(
                        "{label}: connection closed during login"
                    )));
                }
            };
            match table[m.index].1 {
                LoginStep::Prompt => break m.matched,
                LoginStep::Username => {
                    usernames_sent += 1;
                    if usernames_sent > 1 {
                        return Err(AgentError::Auth(format!("{label}: login refused")));
                    }
                    session.send_line(&credential.username).await?;
                }
                LoginStep::Password => {
                    passwords_sent += 1;
                    if passwords_sent > 1 {
                        return Err(AgentError::Auth(format!("{label}: password refused")));
                    }
                    let password = credential.password.as_deref().ok_or_else(|| {
                        AgentError::Auth(format!("{label}: device asked for a password"))
                    })?;
                    session.send_line(password).await?;
                }
                LoginStep::PreLogin => {
                    if let Some((_, keys)) = dialect.pre_login.as_ref() {
                        session.send(keys).await?;
                    }
                }
                LoginStep::Refused => {
                    return Err(AgentError::Auth(format!("{label}: {}", lossy(&m.matched))));
                }
                LoginStep::Unavailable => {
                    return Err(AgentError::Connect(format!("{label}: {}", lossy(&m.matched))));
                }
            }
        };
        self.learn_prompt(&matched)
    }

    async fn enable(&mut self, password: &str) -> Result<(), AgentError> {
        let dialect = self.dialect.clone();
        let Some(enable) = dialect.enable.as_ref() else {
            return Ok(());
        };
        let short = self.timeouts.short_response;
        let label = self.label.clone();
        let patterns = [&enable.password_prompt, &enable.failure, &dialect.prompt];

        let session = self.session()?;
        session.discard_pending();
        session.send_line(&enable.command).await?;
        let mut password_sent = false;
        let matched = loop {
            match session.expect(&patterns, short).await {
                Ok(m) if m.index == 0 => {
                    if password_sent {
                        return Err(AgentError::Auth(format!("{label}: enable password refused")));
                    }
                    password_sent = true;
                    session.send_line(password).await?;
                }
                Ok(m) if m.index == 1 => {
                    return Err(AgentError::Auth(format!("{label}: enable password refused")));
                }
                Ok(m) => {
                    if !enable.enabled_prompt.is_match(&m.matched) {
                        return Err(AgentError::Auth(format!(
                            "{label}: enable did not reach privileged mode"
                        )));
                    }
                    break m.matched;
                }
                Err(ExpectError::Eof) => {
                    return Err(AgentError::TransientIo(format!(
                        "{label}: connection closed during enable"
                    )));
                }
                Err(ExpectError::Timeout) => {
                    return Err(AgentError::Timeout(format!("{label}: no answer to enable")));
                }
            }
        };
        self.learn_prompt(&matched)?;
        self.enabled = true;
        debug!("{} entered privileged mode", self.label);
        Ok(())
    }

    /// Runs one command and returns its cleaned output.
    ///
    /// With `relearn` the dialect's generic prompt marks completion and the
    /// prompt found becomes the new exact prompt (mode changes).
    async fn run(&mut self, command: &str, relearn: bool) -> Result<Vec<u8>, AgentError> {
        let dialect = self.dialect.clone();
        let short = self.timeouts.short_response;
        let long = self.timeouts.long_response;
        let label = self.label.clone();
        let completion = match (&self.prompt, relearn) {
            (Some(prompt), false) => prompt.clone(),
            _ => dialect.prompt.clone(),
        };
        let mut patterns = vec![&completion];
        if let Some(pager) = dialect.pager_prompt.as_ref() {
            patterns.push(pager);
        }

        let session = self.session()?;
        session.discard_pending();
        session.send_line(command).await?;
        // The first line back is the echo; it proves the device is responding.
        session
            .expect(&[&*NEWLINE], short)
            .await
            .map_err(|e| match e {
                ExpectError::Eof => AgentError::TransientIo(format!(
                    "{label}: connection closed before {command:?} was echoed"
                )),
                ExpectError::Timeout => AgentError::TransientIo(format!(
                    "{label}: {command:?} not echoed within {short:?}"
                )),
            })?;

        let deadline = Instant::now() + long;
        let mut output = Vec::new();
        let final_prompt = loop {
            match session.expect_until(&patterns, deadline).await {
                Ok(m) if m.index == 0 => {
                    output.extend_from_slice(&m.before);
                    break m.matched;
                }
                Ok(m) => {
                    output.extend_from_slice(&m.before);
                    session.send(b" ").await?;
                }
                Err(ExpectError::Eof) => {
                    return Err(AgentError::TransientIo(format!(
                        "{label}: connection closed while running {command:?}"
                    )));
                }
                Err(ExpectError::Timeout) => {
                    return Err(AgentError::Timeout(format!(
                        "{label}: {command:?} did not finish within {long:?}"
                    )));
                }
            }
        };
        if relearn {
            self.learn_prompt(&final_prompt)?;
        }
        Ok(clean_output(&output))
    }

    async fn establish(&mut self, credential: &Credential, deadline: Instant) -> Result<(), AgentError> {
        self.login(credential, deadline).await?;
        if self.auto_enable {
            if let Some(password) = credential.enable_password.as_deref() {
                self.enable(password).await?;
            }
        }
        let pager_commands = self.dialect.pager_disable.clone();
        for command in &pager_commands {
            self.run(command, false).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceDriver for ExpectDriver {
    fn name(&self) -> &str {
        &self.dialect.name
    }

    fn capabilities(&self) -> Capabilities {
        let mut caps = Capabilities::from([Capability::Execute]);
        if self.dialect.get_file_command.is_some() {
            caps.insert(Capability::GetFile);
        }
        caps
    }

    async fn connect(
        &mut self,
        address: &str,
        credential: &Credential,
        timeout: Duration,
    ) -> Result<(), AgentError> {
        self.disconnect().await;
        let deadline = Instant::now() + timeout;
        let stream = self.connector.open(address, credential, timeout).await?;
        self.label = format!(
            "{} {}@{} ({})",
            self.dialect.name,
            credential.username,
            address,
            self.connector.method()
        );
        self.session = Some(Expect::new(stream));
        if let Err(e) = self.establish(credential, deadline).await {
            warn!("{} setup failed: {}", self.label, e);
            if let Some(mut session) = self.session.take() {
                session.close().await;
            }
            self.prompt = None;
            self.enabled = false;
            return Err(e);
        }
        debug!("{} ready", self.label);
        Ok(())
    }

    async fn execute(&mut self, command: &str, mode: Option<&str>) -> Result<Vec<u8>, AgentError> {
        let mode = mode.filter(|m| {
            !m.is_empty() && !m.eq_ignore_ascii_case("cli") && !m.eq_ignore_ascii_case("default")
        });
        let Some(mode) = mode else {
            return self.run(command, false).await;
        };
        let spec = self
            .dialect
            .mode(mode)
            .cloned()
            .ok_or_else(|| AgentError::UnsupportedMode {
                mode: mode.to_string(),
                driver: self.dialect.name.clone(),
            })?;
        self.run(&spec.enter, true).await?;
        let result = self.run(command, true).await;
        let left = self.run(&spec.exit, true).await;
        let output = result?;
        left?;
        Ok(output)
    }

    async fn get_file(&mut self, source: &str, mode: Option<&str>) -> Result<Vec<u8>, AgentError> {
        let Some(template) = self.dialect.get_file_command.clone() else {
            return Err(AgentError::UnsupportedOperation(format!(
                "{} cannot get files",
                self.dialect.name
            )));
        };
        let output = self.execute(&template.replace("{}", source), mode).await?;
        if let Some(found) = self.dialect.error_patterns.iter().find_map(|p| p.find(&output)) {
            let line = output[found.start()..]
                .split(|b| *b == b'\n')
                .next()
                .unwrap_or_default();
            return Err(AgentError::Command(lossy(line)));
        }
        Ok(output)
    }

    async fn disconnect(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        if session.is_open() {
            let deadline = Instant::now() + self.timeouts.disconnect;
            if session.send_line(&self.dialect.exit_command).await.is_ok() {
                session.drain_until_eof(deadline).await;
            }
        }
        session.close().await;
        self.prompt = None;
        self.enabled = false;
        debug!("{} disconnected", self.label);
    }

    fn is_alive(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.is_open())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ConnectMethod;
    use crate::templates;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    type Responder = Box<dyn FnMut(&str) -> Option<Vec<String>> + Send>;

    /// Scripted CLI: each `send` is answered by the responder; `None`
    /// closes the stream.
    struct FakeCli {
        pending: VecDeque<Vec<u8>>,
        respond: Responder,
        closed: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl FakeCli {
        fn new(banner: &str, log: Arc<Mutex<Vec<String>>>, respond: Responder) -> Self {
            Self {
                pending: VecDeque::from([banner.as_bytes().to_vec()]),
                respond,
                closed: false,
                log,
            }
        }
    }

    #[async_trait]
    impl CliStream for FakeCli {
        async fn send(&mut self, data: &[u8]) -> Result<(), AgentError> {
            if self.closed {
                return Err(AgentError::TransientIo("closed".into()));
            }
            let text = String::from_utf8_lossy(data).to_string();
            self.log.lock().unwrap().push(text.clone());
            match (self.respond)(&text) {
                Some(chunks) => self
                    .pending
                    .extend(chunks.into_iter().map(String::into_bytes)),
                None => self.closed = true,
            }
            Ok(())
        }

        async fn recv(&mut self) -> Option<Vec<u8>> {
            if let Some(chunk) = self.pending.pop_front() {
                return Some(chunk);
            }
            if self.closed {
                return None;
            }
            std::future::pending().await
        }

        fn is_open(&self) -> bool {
            !self.closed
        }

        async fn close(&mut self) {
            self.closed = true;
        }
    }

    struct FakeConnector {
        method: ConnectMethod,
        make: Box<dyn Fn() -> FakeCli + Send + Sync>,
    }

    #[async_trait]
    impl StreamConnector for FakeConnector {
        fn method(&self) -> ConnectMethod {
            self.method
        }

        async fn open(
            &self,
            _address: &str,
            _credential: &Credential,
            _timeout: Duration,
        ) -> Result<Box<dyn CliStream>, AgentError> {
            Ok(Box::new((self.make)()))
        }
    }

    /// Responder imitating an IOS box called `ar1`.
    fn ios_responder(telnet: bool) -> Responder {
        let mut enabled = false;
        let mut awaiting = if telnet { "username" } else { "" };
        let mut config = false;
        Box::new(move |input: &str| {
            let line = input.trim_end_matches('\n');
            let prompt = |enabled: bool, config: bool| match (enabled, config) {
                (_, true) => "ar1(config)#",
                (true, false) => "ar1#",
                (false, false) => "ar1>",
            };
            let reply = match awaiting {
                "username" => {
                    awaiting = "password";
                    vec![format!("{line}\r\nPassword: ")]
                }
                "password" => {
                    awaiting = "";
                    if line == "pw" {
                        vec!["\r\n".into(), "ar1>".into()]
                    } else {
                        awaiting = "username";
                        vec!["\r\n% Login invalid\r\n\r\nUsername: ".into()]
                    }
                }
                "enable" => {
                    awaiting = "";
                    if line == "secret" {
                        enabled = true;
                        vec!["\r\nar1#".into()]
                    } else {
                        vec!["\r\n% Bad secrets\r\n\r\nar1>".into()]
                    }
                }
                _ => match line {
                    "exit" => return None,
                    "drop" => return None,
                    "hang" => vec![],
                    " " => vec![
                        "\x08\x08\x08\x08\x08\x08\x08\x08\x08        \x08\x08\x08\x08\x08\x08\x08\x08\x08page two\r\n"
                            .into(),
                        prompt(enabled, config).into(),
                    ],
                    "enable" => {
                        awaiting = "enable";
                        vec!["enable\r\nPassword: ".into()]
                    }
                    "configure terminal" => {
                        config = true;
                        vec![format!(
                            "{line}\r\nEnter configuration commands, one per line.\r\n{}",
                            prompt(enabled, config)
                        )]
                    }
                    "end" => {
                        config = false;
                        vec![format!("{line}\r\n{}", prompt(enabled, config))]
                    }
                    "show long" => vec![format!("{line}\r\npage one\r\n --More-- ")],
                    "show version" => vec![
                        format!("{line}\r\n"),
                        "Cisco IOS Software\r\nuptime is 5 weeks\r\n".into(),
                        prompt(enabled, config).into(),
                    ],
                    "more flash:missing" => vec![format!(
                        "{line}\r\n%Error opening flash:missing (No such file or directory)\r\n{}",
                        prompt(enabled, config)
                    )],
                    "more nvram:startup-config" => vec![format!(
                        "{line}\r\nhostname ar1\r\n!\r\nend\r\n{}",
                        prompt(enabled, config)
                    )],
                    other => vec![format!("{other}\r\n{}", prompt(enabled, config))],
                },
            };
            Some(reply)
        })
    }

    fn timeouts() -> Timeouts {
        Timeouts {
            connect: Duration::from_secs(5),
            short_response: Duration::from_secs(2),
            long_response: Duration::from_secs(10),
            disconnect: Duration::from_secs(1),
        }
    }

    fn ios_driver(telnet: bool, auto_enable: bool) -> (ExpectDriver, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let banner = if telnet {
            "\r\n\r\nUser Access Verification\r\n\r\nUsername: "
        } else {
            "\r\nar1>"
        };
        let make_log = log.clone();
        let connector = FakeConnector {
            method: if telnet {
                ConnectMethod::Telnet
            } else {
                ConnectMethod::Ssh
            },
            make: Box::new(move || FakeCli::new(banner, make_log.clone(), ios_responder(telnet))),
        };
        let dialect = templates::by_name("ios").expect("ios compiles");
        let driver = ExpectDriver::new(Arc::new(dialect), Box::new(connector), timeouts(), auto_enable);
        (driver, log)
    }

    fn cred() -> Credential {
        Credential::new(".*", "netops")
            .expect("valid")
            .with_password("pw")
            .with_enable_password("secret")
    }

    fn sent(log: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    #[tokio::test(start_paused = true)]
    async fn ssh_login_enables_and_disables_pager() {
        let (mut driver, log) = ios_driver(false, true);
        driver
            .connect("10.0.0.1", &cred(), Duration::from_secs(5))
            .await
            .expect("connects");
        assert!(driver.is_alive());
        assert!(driver.is_enabled());
        assert_eq!(
            sent(&log),
            vec!["enable\n", "secret\n", "terminal length 0\n"]
        );

        let output = driver.execute("show version", None).await.expect("runs");
        assert_eq!(output, b"Cisco IOS Software\nuptime is 5 weeks\n".to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn without_auto_enable_the_session_stays_unprivileged() {
        let (mut driver, log) = ios_driver(false, false);
        driver
            .connect("10.0.0.1", &cred(), Duration::from_secs(5))
            .await
            .expect("connects");
        assert!(!driver.is_enabled());
        assert_eq!(sent(&log), vec!["terminal length 0\n"]);
    }

    #[tokio::test(start_paused = true)]
    async fn telnet_login_sends_username_and_password() {
        let (mut driver, log) = ios_driver(true, false);
        driver
            .connect("10.0.0.1", &cred(), Duration::from_secs(5))
            .await
            .expect("connects");
        assert_eq!(sent(&log)[..2], ["netops\n".to_string(), "pw\n".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn telnet_bad_password_is_an_auth_error() {
        let (mut driver, _log) = ios_driver(true, false);
        let bad = Credential::new(".*", "netops").expect("valid").with_password("nope");
        let err = driver
            .connect("10.0.0.1", &bad, Duration::from_secs(5))
            .await
            .expect_err("login refused");
        assert!(matches!(err, AgentError::Auth(_)), "{err:?}");
        assert!(!driver.is_alive());
    }

    #[tokio::test(start_paused = true)]
    async fn bad_enable_secret_is_an_auth_error() {
        let (mut driver, _log) = ios_driver(false, true);
        let cred = cred().with_enable_password("wrong");
        let err = driver
            .connect("10.0.0.1", &cred, Duration::from_secs(5))
            .await
            .expect_err("enable refused");
        assert!(matches!(err, AgentError::Auth(_)), "{err:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn pager_prompts_are_answered_and_stripped() {
        let (mut driver, _log) = ios_driver(false, true);
        driver
            .connect("10.0.0.1", &cred(), Duration::from_secs(5))
            .await
            .expect("connects");
        let output = driver.execute("show long", None).await.expect("runs");
        assert_eq!(String::from_utf8_lossy(&output), "page one\npage two\n");
    }

    #[tokio::test(start_paused = true)]
    async fn modes_are_entered_and_left_around_the_command() {
        let (mut driver, log) = ios_driver(false, true);
        driver
            .connect("10.0.0.1", &cred(), Duration::from_secs(5))
            .await
            .expect("connects");
        driver
            .execute("hostname ar1", Some("config"))
            .await
            .expect("runs in config mode");
        let tail: Vec<String> = sent(&log).into_iter().rev().take(3).collect();
        assert_eq!(tail, vec!["end\n", "hostname ar1\n", "configure terminal\n"]);

        // Back at the exec prompt, ordinary commands still complete.
        driver.execute("show version", Some("cli")).await.expect("runs");
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_mode_is_rejected() {
        let (mut driver, _log) = ios_driver(false, true);
        driver
            .connect("10.0.0.1", &cred(), Duration::from_secs(5))
            .await
            .expect("connects");
        let err = driver
            .execute("ls", Some("shell"))
            .await
            .expect_err("ios has no shell mode");
        assert!(matches!(err, AgentError::UnsupportedMode { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn get_file_uses_show_command_and_detects_errors() {
        let (mut driver, _log) = ios_driver(false, true);
        driver
            .connect("10.0.0.1", &cred(), Duration::from_secs(5))
            .await
            .expect("connects");
        assert!(driver.capabilities().contains(&Capability::GetFile));
        let config = driver
            .get_file("nvram:startup-config", None)
            .await
            .expect("file read");
        assert_eq!(String::from_utf8_lossy(&config), "hostname ar1\n!\nend\n");
        let err = driver
            .get_file("flash:missing", None)
            .await
            .expect_err("missing file");
        assert!(matches!(err, AgentError::Command(ref m) if m.contains("No such file")));
        assert!(matches!(
            driver.put_file("flash:x", b"data", None).await,
            Err(AgentError::UnsupportedOperation(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn eof_and_silence_are_transient() {
        let (mut driver, _log) = ios_driver(false, true);
        driver
            .connect("10.0.0.1", &cred(), Duration::from_secs(5))
            .await
            .expect("connects");
        let err = driver.execute("hang", None).await.expect_err("no echo");
        assert!(matches!(err, AgentError::TransientIo(_)), "{err:?}");
        let err = driver.execute("drop", None).await.expect_err("eof");
        assert!(err.is_retryable(), "{err:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_is_idempotent() {
        let (mut driver, log) = ios_driver(false, true);
        driver
            .connect("10.0.0.1", &cred(), Duration::from_secs(5))
            .await
            .expect("connects");
        driver.disconnect().await;
        driver.disconnect().await;
        assert!(!driver.is_alive());
        assert_eq!(sent(&log).last().map(String::as_str), Some("exit\n"));
        assert!(matches!(
            driver.execute("show version", None).await,
            Err(AgentError::TransientIo(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn session_limit_banner_is_a_connect_error() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let make_log = log.clone();
        let connector = FakeConnector {
            method: ConnectMethod::Telnet,
            make: Box::new(move || {
                FakeCli::new(
                    "\r\nSorry, session limit reached.\r\n",
                    make_log.clone(),
                    Box::new(|_| None),
                )
            }),
        };
        let dialect = templates::by_name("ios").expect("compiles");
        let mut driver = ExpectDriver::new(Arc::new(dialect), Box::new(connector), timeouts(), true);
        let err = driver
            .connect("10.0.0.1", &cred(), Duration::from_secs(5))
            .await
            .expect_err("device full");
        assert!(matches!(err, AgentError::Connect(ref m) if m.contains("session limit")));
    }

    #[tokio::test]
    async fn expect_prefers_the_earliest_match() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let cli = FakeCli::new("abc Password: xyz>", log, Box::new(|_| Some(vec![])));
        let mut session = Expect::new(Box::new(cli));
        let prompt = Regex::new(r">\z").expect("valid");
        let password = Regex::new(r"Password:").expect("valid");
        let m = session
            .expect(&[&prompt, &password], Duration::from_secs(1))
            .await
            .expect("matches");
        assert_eq!(m.index, 1);
        assert_eq!(m.before, b"abc ".to_vec());
        let m = session
            .expect(&[&prompt], Duration::from_secs(1))
            .await
            .expect("matches the rest");
        assert_eq!(m.before, b" xyz".to_vec());
    }

    #[test]
    fn clean_output_strips_terminal_noise() {
        let raw = b"\x1b[0mline one\r\n\x08\x08\x08   \x08\x08\x08line two\r\r\n";
        assert_eq!(clean_output(raw), b"line one\nline two\n".to_vec());
    }
}
