//! Shell command channel over an unframed serial console.
//!
//! The channel logs in (when the console asks for it), pins a recognizable prompt,
//! then runs one command at a time. Completion is detected by appending
//! `EC=$?; echo __CMD_DONE_<seq>__$EC` to each command and polling the line until
//! the marker of that invocation shows up followed by the numeric exit status, or
//! until the deadline. Markers left behind by commands that timed out carry an
//! older sequence number and are skipped.
use once_cell::sync::Lazy;
use regex::bytes::Regex;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use super::{
    error::{Error, Result},
    transport::ByteTransport,
};

pub const COMPLETION_MARKER: &str = "__CMD_DONE_";
pub const SHELL_PROMPT: &str = "PiRF# ";

const PROBE_COMMAND: &str = "echo __HELLO__ && (id || true)";
const PASSWORD_PROMPT: &str = "assword";
const LOGIN_REJECTED: &str = "Login incorrect";
/// Stand-in deadline for timeouts too large to add to `Instant::now()`.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

static EXIT_STATUS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"__CMD_DONE_(\d+)__(-?\d+)\r?\n").expect("static regex"));
static EXIT_STATUS_UNTERMINATED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"__CMD_DONE_(\d+)__(-?\d+)").expect("static regex"));
/// `raspberrypi login: ` as the last thing on a line. `Last login: Tue ...` is not one.
static LOGIN_PROMPT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^(?:\S+ )?login: ?\r?$").expect("static regex"));
static DEFAULT_PROMPT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[@~]# |[@~]\$ ").expect("static regex"));
static PROBE_REPLY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^__HELLO__\r?$").expect("static regex"));
static CUSTOM_PROMPT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^PiRF# ").expect("static regex"));

/// Timing and verification knobs for the handshake and command loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// How long to listen after the wake-up newline
    pub wake_window_ms: u64,
    /// Pause after sending the username
    pub user_settle_ms: u64,
    /// How long to wait for the password prompt
    pub user_window_ms: u64,
    /// Upper bound for authentication, hashing and MOTD banners
    pub login_timeout_ms: u64,
    pub probe_window_ms: u64,
    pub prompt_window_ms: u64,
    /// Granularity of the completion polling loop
    pub poll_interval_ms: u64,
    /// Default deadline for commands that do not pass their own
    pub command_timeout_ms: u64,
    /// Require the probe reply after login
    pub verify_login: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            wake_window_ms: 2000,
            user_settle_ms: 500,
            user_window_ms: 1000,
            login_timeout_ms: 20_000,
            probe_window_ms: 1000,
            prompt_window_ms: 300,
            poll_interval_ms: 50,
            command_timeout_ms: 20_000,
            verify_login: true,
        }
    }
}

impl ChannelConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    #[serde(rename = "user")]
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    fn usable(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => Some((user, pass)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    AwaitingLogin,
    Authenticated,
}

/// Result of one remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// The completion marker arrived, carrying the command's exit status.
    Completed {
        exit_code: i64,
        output: String,
        raw: Vec<u8>,
    },
    /// The deadline passed first. The command may still be running remotely.
    TimedOut { partial_output: String, raw: Vec<u8> },
}

impl CommandOutcome {
    pub fn exit_code(&self) -> Option<i64> {
        match self {
            CommandOutcome::Completed { exit_code, .. } => Some(*exit_code),
            CommandOutcome::TimedOut { .. } => None,
        }
    }

    pub fn output(&self) -> &str {
        match self {
            CommandOutcome::Completed { output, .. } => output,
            CommandOutcome::TimedOut { partial_output, .. } => partial_output,
        }
    }

    pub fn raw(&self) -> &[u8] {
        match self {
            CommandOutcome::Completed { raw, .. } | CommandOutcome::TimedOut { raw, .. } => raw,
        }
    }

    pub fn timed_out(&self) -> bool {
        matches!(self, CommandOutcome::TimedOut { .. })
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code() == Some(0)
    }
}

/// Owns the transport and the login session. Not reentrant: one command at a time.
pub struct CommandChannel<T: ByteTransport> {
    transport: T,
    config: ChannelConfig,
    state: SessionState,
    next_seq: u64,
}

impl<T: ByteTransport> CommandChannel<T> {
    pub fn new(transport: T, config: ChannelConfig) -> Self {
        Self {
            transport,
            config,
            state: SessionState::Disconnected,
            next_seq: 1,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Run the login handshake. A no-op once authenticated.
    pub fn login(&mut self, credentials: Option<&Credentials>) -> Result<()> {
        if self.state == SessionState::Authenticated {
            return Ok(());
        }
        self.state = SessionState::AwaitingLogin;

        self.write_line("")?;
        let banner = self.read_until(ChannelConfig::ms(self.config.wake_window_ms), |buf| {
            LOGIN_PROMPT.is_match(buf) || DEFAULT_PROMPT.is_match(buf)
        })?;
        let prompted = LOGIN_PROMPT.is_match(&banner);

        if prompted {
            let (user, pass) = credentials
                .and_then(Credentials::usable)
                .ok_or(Error::MissingCredentials)?;
            log::info!("Login prompt detected, authenticating as {user}");

            self.write_line(user)?;
            std::thread::sleep(ChannelConfig::ms(self.config.user_settle_ms));
            self.read_until(ChannelConfig::ms(self.config.user_window_ms), |buf| {
                contains(buf, PASSWORD_PROMPT)
            })?;

            self.write_secret(pass)?;
            let reply = self.read_until(ChannelConfig::ms(self.config.login_timeout_ms), |buf| {
                DEFAULT_PROMPT.is_match(buf)
                    || contains(buf, LOGIN_REJECTED)
                    || LOGIN_PROMPT.is_match(buf)
            })?;
            if login_rejected(&reply) {
                return Err(Error::AuthenticationFailed {
                    detail: format!("remote rejected credentials for {user}"),
                });
            }
        } else {
            log::debug!("No login prompt seen, assuming an open shell");
        }

        self.write_line(PROBE_COMMAND)?;
        let probe = self.read_until(ChannelConfig::ms(self.config.probe_window_ms), |buf| {
            PROBE_REPLY.is_match(buf)
        })?;
        let alive = PROBE_REPLY.is_match(&probe);

        self.write_line(&format!("export PS1='{SHELL_PROMPT}'"))?;
        self.read_until(ChannelConfig::ms(self.config.prompt_window_ms), |buf| {
            CUSTOM_PROMPT.is_match(buf)
        })?;

        if !alive {
            if self.config.verify_login {
                return Err(if prompted {
                    Error::AuthenticationFailed {
                        detail: "no shell response after submitting the password".to_string(),
                    }
                } else {
                    Error::ShellUnresponsive
                });
            }
            log::warn!("Probe command got no reply; continuing without verification");
        }

        self.state = SessionState::Authenticated;
        log::info!("Remote shell ready");
        Ok(())
    }

    /// Submit `command`, wait up to `timeout` for the completion marker.
    ///
    /// With `require_success`, a nonzero exit status or a timeout is an error.
    /// Otherwise the outcome is returned as-is and the caller decides.
    pub fn execute(
        &mut self,
        command: &str,
        timeout: Duration,
        require_success: bool,
    ) -> Result<CommandOutcome> {
        if self.state != SessionState::Authenticated {
            return Err(Error::NotAuthenticated);
        }

        let stale = self.transport.read_available(Duration::ZERO)?;
        if !stale.is_empty() {
            log::trace!("Discarding {} stale bytes", stale.len());
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        let wrapped = wrap_command(command, seq);
        self.write_line(&wrapped)?;

        let poll = ChannelConfig::ms(self.config.poll_interval_ms.max(1));
        let deadline = deadline_after(timeout);
        let mut buf: Vec<u8> = Vec::new();
        let status = loop {
            if let Some(found) = find_status(&EXIT_STATUS, &buf, seq) {
                break Some(found);
            }
            let now = Instant::now();
            if now >= deadline {
                break find_status(&EXIT_STATUS_UNTERMINATED, &buf, seq);
            }
            let chunk = self.transport.read_available(poll.min(deadline - now))?;
            if !chunk.is_empty() {
                log::trace!("<< {}", String::from_utf8_lossy(&chunk));
                buf.extend_from_slice(&chunk);
            }
        };

        let outcome = match status {
            Some((exit_code, marker_at)) => CommandOutcome::Completed {
                exit_code,
                output: strip_echo(&buf[..marker_at], seq),
                raw: buf,
            },
            None => CommandOutcome::TimedOut {
                partial_output: strip_echo(&buf, seq),
                raw: buf,
            },
        };

        match &outcome {
            CommandOutcome::Completed { exit_code, .. } => {
                log::debug!("Command finished with rc={exit_code}");
                if require_success && *exit_code != 0 {
                    return Err(Error::RemoteCommandFailed {
                        command: command.to_string(),
                        exit_code: *exit_code,
                        output: outcome.output().to_string(),
                    });
                }
            }
            CommandOutcome::TimedOut { partial_output, .. } => {
                log::warn!("No completion marker within {timeout:?} for: {command}");
                if require_success {
                    return Err(Error::CommandTimedOut {
                        command: command.to_string(),
                        timeout,
                        partial_output: partial_output.clone(),
                    });
                }
            }
        }
        Ok(outcome)
    }

    /// Close the transport. Safe to call more than once.
    pub fn close(&mut self) {
        self.transport.close();
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn write_line(&mut self, line: &str) -> Result<()> {
        log::debug!(">> {line}");
        self.send(line)
    }

    fn write_secret(&mut self, line: &str) -> Result<()> {
        log::debug!(">> ********");
        self.send(line)
    }

    fn send(&mut self, line: &str) -> Result<()> {
        let mut bytes = line.as_bytes().to_vec();
        if !line.ends_with('\n') {
            bytes.push(b'\n');
        }
        self.transport.write(&bytes)
    }

    /// Accumulate input for up to `window`, returning early once `done` holds.
    fn read_until(&mut self, window: Duration, done: impl Fn(&[u8]) -> bool) -> Result<Vec<u8>> {
        let poll = ChannelConfig::ms(self.config.poll_interval_ms.max(1));
        let deadline = deadline_after(window);
        let mut buf = Vec::new();
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let chunk = self.transport.read_available(poll.min(deadline - now))?;
            if !chunk.is_empty() {
                log::trace!("<< {}", String::from_utf8_lossy(&chunk));
                buf.extend_from_slice(&chunk);
                if done(&buf) {
                    break;
                }
            }
        }
        Ok(buf)
    }
}

impl<T: ByteTransport> Drop for CommandChannel<T> {
    fn drop(&mut self) {
        self.transport.close();
    }
}

/// `now + timeout`, saturating for timeouts no clock can represent.
pub fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Append the marker of invocation `seq` so it is echoed after `command` whatever
/// its status.
pub fn wrap_command(command: &str, seq: u64) -> String {
    let body = command.trim_end();
    let body = body.strip_suffix(';').unwrap_or(body).trim_end();
    let separator = if body.contains('\n') {
        "\n"
    } else if body.ends_with('&') && !body.ends_with("&&") {
        " "
    } else {
        "; "
    };
    format!("{body}{separator}EC=$?; echo {}$EC", marker(seq))
}

fn marker(seq: u64) -> String {
    format!("{COMPLETION_MARKER}{seq}__")
}

/// A shell prompt after the password means we are in, whatever the MOTD says.
fn login_rejected(reply: &[u8]) -> bool {
    if contains(reply, LOGIN_REJECTED) {
        return true;
    }
    !DEFAULT_PROMPT.is_match(reply) && LOGIN_PROMPT.is_match(reply)
}

/// Exit status and marker offset for invocation `seq`, ignoring older markers.
fn find_status(re: &Regex, buf: &[u8], seq: u64) -> Option<(i64, usize)> {
    let want = seq.to_string();
    re.captures_iter(buf)
        .find(|caps| caps.get(1).is_some_and(|m| m.as_bytes() == want.as_bytes()))
        .map(|caps| capture_status(&caps))
}

fn capture_status(caps: &regex::bytes::Captures<'_>) -> (i64, usize) {
    let whole = caps.get(0).map_or(0, |m| m.start());
    let digits = caps
        .get(2)
        .map(|m| String::from_utf8_lossy(m.as_bytes()).into_owned())
        .unwrap_or_default();
    let code = digits.parse::<i64>().unwrap_or(if digits.starts_with('-') {
        i64::MIN
    } else {
        i64::MAX
    });
    (code, whole)
}

/// Drop the terminal echo of the submitted line (and any prompt before it), then
/// whatever a timed-out predecessor printed up to its own marker.
fn strip_echo(bytes: &[u8], seq: u64) -> String {
    let text = String::from_utf8_lossy(bytes).replace("\r\n", "\n");
    let echo = format!("echo {}$EC", marker(seq));
    let body = match text.find(&echo) {
        Some(at) => match text[at..].find('\n') {
            Some(nl) => &text[at + nl + 1..],
            None => "",
        },
        None => text.trim_start_matches('\n'),
    };
    let fresh = EXIT_STATUS
        .find_iter(body.as_bytes())
        .last()
        .map_or(0, |m| m.end());
    body[fresh..].to_string()
}

fn contains(haystack: &[u8], needle: &str) -> bool {
    haystack
        .windows(needle.len())
        .any(|window| window == needle.as_bytes())
}
