use std::time::Duration;

/// Failure kinds surfaced by the serial command channel and everything layered on it.
///
/// Every variant is fatal for the current run. Best-effort steps never produce one of
/// these; they log and move on instead.
#[derive(Debug, derive_more::Display, derive_more::Error)]
pub enum Error {
    #[display("serial device {device} unavailable: {source}")]
    DeviceUnavailable {
        device: String,
        source: std::io::Error,
    },

    #[display("no USB serial devices found; plug in the console cable or pass --port")]
    NoSerialDevice,

    #[display(
        "multiple USB serial devices found ({}); select one with --port",
        candidates.join(", ")
    )]
    AmbiguousDeviceSelection { candidates: Vec<String> },

    #[display("login prompt detected but no username/password configured")]
    MissingCredentials,

    #[display("authentication failed: {detail}")]
    AuthenticationFailed { detail: String },

    #[display("remote shell did not answer the probe command")]
    ShellUnresponsive,

    #[display("command submitted before the login handshake completed")]
    NotAuthenticated,

    #[display("remote command failed (rc={exit_code}): {command}\n---\n{output}\n---")]
    RemoteCommandFailed {
        command: String,
        exit_code: i64,
        output: String,
    },

    #[display("remote command did not complete within {timeout:?}: {command}\n---\n{partial_output}\n---")]
    CommandTimedOut {
        command: String,
        timeout: Duration,
        partial_output: String,
    },

    #[display("no active Wi-Fi/Ethernet address found on {host}")]
    NoActiveInterface { host: String },

    #[display("no suitable local address within {timeout:?}; last: {last}")]
    AddressTimeout { timeout: Duration, last: String },

    #[display("local process {label} failed: {source}")]
    LocalProcess {
        label: String,
        source: std::io::Error,
    },

    #[display("local process {label} still running after {timeout:?}")]
    ProcessTimeout { label: String, timeout: Duration },

    #[display("invalid parameter: {detail}")]
    InvalidParameter { detail: String },

    #[display("config {path}: {detail}")]
    Config { path: String, detail: String },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn device(device: &str, source: impl Into<std::io::Error>) -> Self {
        Error::DeviceUnavailable {
            device: device.to_string(),
            source: source.into(),
        }
    }

    pub(crate) fn invalid(detail: impl Into<String>) -> Self {
        Error::InvalidParameter {
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ambiguous_selection_lists_candidates() {
        let err = Error::AmbiguousDeviceSelection {
            candidates: vec!["/dev/ttyUSB0".into(), "/dev/ttyUSB1".into()],
        };
        let text = err.to_string();
        assert!(text.contains("/dev/ttyUSB0, /dev/ttyUSB1"));
    }

    #[test]
    fn remote_failure_carries_output() {
        let err = Error::RemoteCommandFailed {
            command: "false".into(),
            exit_code: 1,
            output: "boom".into(),
        };
        let text = err.to_string();
        assert!(text.contains("rc=1"));
        assert!(text.contains("boom"));
    }

    #[test]
    fn device_error_exposes_source() {
        use std::error::Error as _;
        let err = Error::device(
            "/dev/ttyUSB0",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(err.source().is_some());
    }
}
