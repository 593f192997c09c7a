//! Scripted in-memory transport for exercising the channel without hardware.
//!
//! [`MockTransport`] feeds every complete line written to it into a responder
//! closure and queues whatever the responder returns for subsequent reads. With
//! echo enabled it first queues the line itself, the way a serial console does.
//!
//! ```
//! use pirf::protocol::mock::MockTransport;
//!
//! let mock = MockTransport::new(|line: &str| {
//!     if line.is_empty() { "pi@raspberrypi:~$ ".to_string() } else { String::new() }
//! });
//! let writes = mock.write_log();
//! # drop((mock, writes));
//! ```

use parking_lot::Mutex;
use std::{collections::VecDeque, sync::Arc, time::Duration};

use super::{
    error::{Error, Result},
    transport::ByteTransport,
};

type Responder = Box<dyn FnMut(&str) -> String + Send>;

/// Shared record of every line written to a [`MockTransport`].
pub type WriteLog = Arc<Mutex<Vec<String>>>;

pub struct MockTransport {
    responder: Responder,
    pending: VecDeque<u8>,
    partial_line: Vec<u8>,
    writes: WriteLog,
    echo: bool,
    closed: bool,
    close_count: usize,
    idle_wait: Duration,
}

impl MockTransport {
    pub fn new(responder: impl FnMut(&str) -> String + Send + 'static) -> Self {
        Self {
            responder: Box::new(responder),
            pending: VecDeque::new(),
            partial_line: Vec::new(),
            writes: Arc::new(Mutex::new(Vec::new())),
            echo: true,
            closed: false,
            close_count: 0,
            idle_wait: Duration::from_millis(2),
        }
    }

    /// Switch terminal echo of written lines on or off (default on).
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Queue bytes that are already waiting on the line before anything is written.
    pub fn with_pending(mut self, text: &str) -> Self {
        self.pending.extend(text.as_bytes());
        self
    }

    pub fn write_log(&self) -> WriteLog {
        Arc::clone(&self.writes)
    }

    pub fn close_count(&self) -> usize {
        self.close_count
    }

    fn closed_error() -> Error {
        Error::device(
            "mock",
            std::io::Error::new(std::io::ErrorKind::NotConnected, "mock transport closed"),
        )
    }
}

impl ByteTransport for MockTransport {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Self::closed_error());
        }
        for &b in bytes {
            if b != b'\n' {
                self.partial_line.push(b);
                continue;
            }
            let line = String::from_utf8_lossy(&self.partial_line).into_owned();
            self.partial_line.clear();
            self.writes.lock().push(line.clone());
            if self.echo {
                self.pending.extend(line.as_bytes());
                self.pending.extend(b"\r\n");
            }
            let reply = (self.responder)(&line);
            self.pending.extend(reply.as_bytes());
        }
        Ok(())
    }

    fn read_available(&mut self, max_wait: Duration) -> Result<Vec<u8>> {
        if self.closed {
            return Err(Self::closed_error());
        }
        if self.pending.is_empty() {
            std::thread::sleep(max_wait.min(self.idle_wait));
            return Ok(Vec::new());
        }
        Ok(self.pending.drain(..).collect())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.close_count += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_are_recorded_echoed_and_answered() {
        let mut mock = MockTransport::new(|line| format!("got {line}\r\n"));
        let log = mock.write_log();
        mock.write(b"hello\nwor").expect("write");
        mock.write(b"ld\n").expect("write");
        assert_eq!(*log.lock(), vec!["hello".to_string(), "world".to_string()]);

        let text = String::from_utf8(mock.read_available(Duration::ZERO).expect("read"))
            .expect("utf8");
        assert_eq!(text, "hello\r\ngot hello\r\nworld\r\ngot world\r\n");
        assert!(mock
            .read_available(Duration::from_millis(1))
            .expect("read")
            .is_empty());
    }

    #[test]
    fn closing_twice_counts_once_and_blocks_io() {
        let mut mock = MockTransport::new(|_| String::new()).with_echo(false);
        mock.close();
        mock.close();
        assert_eq!(mock.close_count(), 1);
        assert!(mock.write(b"x\n").is_err());
        assert!(mock.read_available(Duration::ZERO).is_err());
    }
}
