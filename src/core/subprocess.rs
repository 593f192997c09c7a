//! Local helper processes with a bounded lifetime
//!
//! Scenarios bracket remote test commands with local helpers (an iperf3 server or
//! client). A [`ProcessHandle`] terminates its child when dropped, so a helper never
//! outlives the test window even when the scenario bails out with an error.
use std::{
    io::{BufRead, BufReader, Read},
    process::{Child, Command, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use crate::{
    cli::cleanup::{register_cleanup, unregister_cleanup},
    protocol::{
        channel::deadline_after,
        error::{Error, Result},
    },
};

const WAIT_POLL: Duration = Duration::from_millis(50);
const DROP_GRACE: Duration = Duration::from_secs(2);
/// Stderr lines kept for [`ProcessHandle::stderr_lines`]; later ones are only logged.
const STDERR_BACKLOG: usize = 256;

/// A local program invocation, argv style. No shell is involved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl LocalCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

impl std::fmt::Display for LocalCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

pub struct ProcessHandle {
    label: String,
    child: Child,
    exit_code: Option<i32>,
    alive: Arc<AtomicBool>,
    cleanup_id: u64,
    stderr_receiver: flume::Receiver<String>,
}

impl ProcessHandle {
    pub fn spawn(label: &str, command: &LocalCommand) -> Result<Self> {
        log::info!("[local] $ {command}");
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| Error::LocalProcess {
                label: label.to_string(),
                source,
            })?;
        log::debug!("{label} spawned with PID {}", child.id());

        if let Some(stdout) = child.stdout.take() {
            forward_lines(label.to_string(), stdout, None);
        }
        let (stderr_tx, stderr_rx) = flume::bounded(STDERR_BACKLOG);
        if let Some(stderr) = child.stderr.take() {
            forward_lines(label.to_string(), stderr, Some(stderr_tx));
        }

        let alive = Arc::new(AtomicBool::new(true));
        let cleanup_id = {
            let alive = Arc::clone(&alive);
            let pid = child.id();
            register_cleanup(move || {
                if alive.load(Ordering::SeqCst) {
                    send_terminate(pid);
                }
            })
        };

        Ok(Self {
            label: label.to_string(),
            child,
            exit_code: None,
            alive,
            cleanup_id,
            stderr_receiver: stderr_rx,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Exit code if the process has already exited. Signal deaths are negated.
    pub fn try_exit_code(&mut self) -> Result<Option<i32>> {
        if self.exit_code.is_some() {
            return Ok(self.exit_code);
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                let code = exit_code_of(status);
                self.mark_exited(code);
                Ok(Some(code))
            }
            Ok(None) => Ok(None),
            Err(source) => Err(Error::LocalProcess {
                label: self.label.clone(),
                source,
            }),
        }
    }

    /// Ask the process to stop (SIGTERM on unix). No-op once it has exited.
    pub fn terminate(&mut self) -> Result<()> {
        if self.try_exit_code()?.is_some() {
            return Ok(());
        }
        log::debug!("Terminating {} (PID {})", self.label, self.child.id());
        if cfg!(unix) {
            send_terminate(self.child.id());
            Ok(())
        } else {
            self.kill()
        }
    }

    pub fn wait_for(&mut self, timeout: Duration) -> Result<i32> {
        let deadline = deadline_after(timeout);
        loop {
            if let Some(code) = self.try_exit_code()? {
                log::debug!("{} exited with {code}", self.label);
                return Ok(code);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::ProcessTimeout {
                    label: self.label.clone(),
                    timeout,
                });
            }
            thread::sleep(WAIT_POLL.min(deadline - now));
        }
    }

    /// Stderr lines received so far that have not been taken yet, at most
    /// `STDERR_BACKLOG` of them between calls.
    pub fn stderr_lines(&self) -> Vec<String> {
        self.stderr_receiver.try_iter().collect()
    }

    fn kill(&mut self) -> Result<()> {
        use std::io::ErrorKind;
        if let Err(err) = self.child.kill() {
            if err.kind() != ErrorKind::InvalidInput {
                return Err(Error::LocalProcess {
                    label: self.label.clone(),
                    source: err,
                });
            }
        }
        match self.child.wait() {
            Ok(status) => self.mark_exited(exit_code_of(status)),
            Err(err) => log::warn!("Waiting for {} after kill failed: {err}", self.label),
        }
        Ok(())
    }

    fn mark_exited(&mut self, code: i32) {
        self.exit_code = Some(code);
        self.alive.store(false, Ordering::SeqCst);
        unregister_cleanup(self.cleanup_id);
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if matches!(self.try_exit_code(), Ok(Some(_))) {
            return;
        }
        if let Err(err) = self.terminate() {
            log::warn!("Failed to terminate {}: {err}", self.label);
        }
        if self.wait_for(DROP_GRACE).is_err() {
            log::warn!("{} ignored SIGTERM, killing it", self.label);
            if let Err(err) = self.kill() {
                log::warn!("{err}");
            }
        }
    }
}

/// Check that `program` can be run at all; warn when it cannot.
pub fn tool_available(program: &str) -> bool {
    let ok = Command::new(program)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false);
    if !ok {
        log::warn!("{program} not found on this machine; install it before running Wi-Fi scenarios");
    }
    ok
}

fn forward_lines(
    label: String,
    stream: impl Read + Send + 'static,
    sink: Option<flume::Sender<String>>,
) {
    thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim_end_matches(['\r', '\n']);
                    if trimmed.is_empty() {
                        continue;
                    }
                    match &sink {
                        Some(tx) => {
                            log::warn!("[{label}] stderr: {trimmed}");
                            let _ = tx.try_send(trimmed.to_string());
                        }
                        None => log::info!("[{label}] {trimmed}"),
                    }
                }
                Err(err) => {
                    log::warn!("[{label}] reader error: {err}");
                    break;
                }
            }
        }
    });
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    status.code().unwrap_or(-1)
}

#[cfg(unix)]
fn send_terminate(pid: u32) {
    // SAFETY: plain kill(2) on a PID this process spawned.
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn send_terminate(_pid: u32) {}
