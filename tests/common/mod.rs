//! Simulated Raspberry Pi console for driving the channel and scenarios in tests.
#![allow(dead_code)]

use parking_lot::Mutex;
use std::sync::Arc;

use pirf::protocol::{channel::ChannelConfig, mock::MockTransport};

pub const USER: &str = "pi";
pub const PASSWORD: &str = "raspberry";

const MARKER_LEAD: &str = "EC=$?; echo ";
const PROBE: &str = "echo __HELLO__ && (id || true)";

/// Stands for the current invocation's completion marker in handler replies.
pub const MARKER: &str = "__CMD_DONE__";
/// Stands for the marker of the last command the shell left hanging.
pub const LATE_MARKER: &str = "__LATE_DONE__";

/// Commands the simulated shell executed, unwrapped, in order.
pub type CommandLog = Arc<Mutex<Vec<String>>>;

/// Maps a command to the raw text the shell prints after echoing it, or `None` to hang.
pub type Handler = Box<dyn FnMut(&str) -> Option<String> + Send>;

/// Output followed by the completion marker and the custom prompt.
pub fn done(output: &str, code: &str) -> Option<String> {
    Some(format!("{output}{MARKER}{code}\r\nPiRF# "))
}

pub fn ok(output: &str) -> Option<String> {
    done(output, "0")
}

/// Windows shrunk so a full login takes a few milliseconds.
pub fn fast_config() -> ChannelConfig {
    ChannelConfig {
        wake_window_ms: 300,
        user_settle_ms: 0,
        user_window_ms: 300,
        login_timeout_ms: 500,
        probe_window_ms: 300,
        prompt_window_ms: 100,
        poll_interval_ms: 5,
        command_timeout_ms: 2000,
        verify_login: true,
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Stage {
    AwaitUser,
    AwaitPassword,
    Shell,
}

pub struct SimShell {
    stage: Stage,
    require_login: bool,
    user_ok: bool,
    pending: Vec<String>,
    hung: Option<String>,
    handler: Handler,
    log: CommandLog,
}

impl SimShell {
    /// Shell that is already logged in.
    pub fn open(handler: impl FnMut(&str) -> Option<String> + Send + 'static) -> Self {
        Self {
            stage: Stage::Shell,
            require_login: false,
            user_ok: false,
            pending: Vec::new(),
            hung: None,
            handler: Box::new(handler),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Console that shows `login:` and accepts [`USER`] / [`PASSWORD`].
    pub fn with_login(handler: impl FnMut(&str) -> Option<String> + Send + 'static) -> Self {
        let mut shell = Self::open(handler);
        shell.stage = Stage::AwaitUser;
        shell.require_login = true;
        shell
    }

    pub fn command_log(&self) -> CommandLog {
        Arc::clone(&self.log)
    }

    pub fn into_transport(mut self) -> MockTransport {
        MockTransport::new(move |line| self.respond(line))
    }

    fn respond(&mut self, line: &str) -> String {
        match self.stage {
            Stage::AwaitUser => {
                if line.is_empty() {
                    "\r\nraspberrypi login: ".to_string()
                } else {
                    self.user_ok = line == USER;
                    self.stage = Stage::AwaitPassword;
                    "Password: ".to_string()
                }
            }
            Stage::AwaitPassword => {
                if self.user_ok && line == PASSWORD {
                    self.stage = Stage::Shell;
                    "\r\nLinux raspberrypi 6.1.21-v8+\r\n\
                     Last login: Tue Oct 14 09:00:01 BST 2026 on ttyS0\r\n\
                     pi@raspberrypi:~$ "
                        .to_string()
                } else {
                    self.stage = Stage::AwaitUser;
                    "\r\nLogin incorrect\r\nraspberrypi login: ".to_string()
                }
            }
            Stage::Shell => self.shell_line(line),
        }
    }

    fn shell_line(&mut self, line: &str) -> String {
        if self.pending.is_empty() {
            if line.is_empty() {
                return "pi@raspberrypi:~$ ".to_string();
            }
            if line == PROBE {
                return "__HELLO__\r\nuid=1000(pi) gid=1000(pi)\r\npi@raspberrypi:~$ ".to_string();
            }
            if line.starts_with("export PS1=") {
                return "PiRF# ".to_string();
            }
        }
        let Some((prefix, marker)) = split_marker(line) else {
            self.pending.push(line.to_string());
            return String::new();
        };
        let prefix = prefix.trim_end();
        let prefix = prefix.strip_suffix(';').unwrap_or(prefix);
        if !prefix.is_empty() {
            self.pending.push(prefix.to_string());
        }
        let command = std::mem::take(&mut self.pending).join("\n");
        self.log.lock().push(command.clone());
        match (self.handler)(&command) {
            Some(reply) => {
                let late = self.hung.take().unwrap_or_default();
                reply.replace(LATE_MARKER, &late).replace(MARKER, &marker)
            }
            None => {
                self.hung = Some(marker);
                String::new()
            }
        }
    }
}

/// Split `cmd; EC=$?; echo __CMD_DONE_<n>__$EC` into `cmd; ` and `__CMD_DONE_<n>__`.
fn split_marker(line: &str) -> Option<(&str, String)> {
    let at = line.rfind(MARKER_LEAD)?;
    let marker = line[at + MARKER_LEAD.len()..].strip_suffix("$EC")?;
    if !marker.starts_with("__CMD_DONE_") || !marker.ends_with("__") {
        return None;
    }
    Some((&line[..at], marker.to_string()))
}

/// Handler where every command succeeds silently except `pkill`, which finds nothing.
pub fn quiet_board(command: &str) -> Option<String> {
    if command.contains("pkill") {
        done("", "1")
    } else {
        ok("")
    }
}

/// Position of the first logged command containing `needle`.
pub fn position(log: &CommandLog, needle: &str) -> Option<usize> {
    log.lock().iter().position(|c| c.contains(needle))
}
