use std::{
    io::{Read, Write},
    time::{Duration, Instant},
};

use serialport::{DataBits, SerialPort, StopBits};

use super::error::{Error, Result};

/// Unframed byte pipe to the remote console.
///
/// Implementations give no framing and no buffering guarantees beyond what the
/// underlying driver provides.
pub trait ByteTransport: Send {
    /// Write every byte and flush.
    fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Return whatever arrived within `max_wait`, possibly nothing.
    fn read_available(&mut self, max_wait: Duration) -> Result<Vec<u8>>;

    /// Release the device. Calling it more than once is harmless.
    fn close(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    pub baud: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: serialport::Parity,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud: 115_200,
            data_bits: 8,
            stop_bits: 1,
            parity: serialport::Parity::None,
        }
    }
}

impl SerialConfig {
    pub fn with_baud(baud: u32) -> Self {
        Self {
            baud,
            ..Self::default()
        }
    }

    pub fn apply_builder(&self, b: serialport::SerialPortBuilder) -> serialport::SerialPortBuilder {
        let b = b.data_bits(match self.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        });
        let b = b.stop_bits(match self.stop_bits {
            2 => StopBits::Two,
            _ => StopBits::One,
        });
        b.parity(self.parity)
            .flow_control(serialport::FlowControl::None)
    }
}

/// Serial console transport backed by the `serialport` crate.
pub struct SerialTransport {
    device: String,
    port: Option<Box<dyn SerialPort + Send + 'static>>,
}

impl SerialTransport {
    const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

    pub fn open(device: &str, config: &SerialConfig) -> Result<Self> {
        let builder = serialport::new(device, config.baud).timeout(Duration::from_millis(200));
        let port = config
            .apply_builder(builder)
            .open()
            .map_err(|err| Error::device(device, err))?;
        log::info!("Opened serial device {device} at {} baud", config.baud);
        Ok(Self {
            device: device.to_string(),
            port: Some(port),
        })
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort + Send + 'static>> {
        let device = &self.device;
        self.port.as_mut().ok_or_else(|| {
            Error::device(
                device,
                std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"),
            )
        })
    }
}

impl ByteTransport for SerialTransport {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let device = self.device.clone();
        let port = self.port()?;
        port.write_all(bytes)
            .and_then(|_| port.flush())
            .map_err(|err| Error::device(&device, err))
    }

    fn read_available(&mut self, max_wait: Duration) -> Result<Vec<u8>> {
        let device = self.device.clone();
        let port = self.port()?;
        port.set_timeout(max_wait.max(Self::MIN_READ_TIMEOUT))
            .map_err(|err| Error::device(&device, err))?;

        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        let started = Instant::now();
        loop {
            match port.read(&mut buf) {
                Ok(0) => {}
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::device(&device, e)),
            }
            // Drain the rest of what the driver already holds, then hand it back.
            let pending = port.bytes_to_read().unwrap_or(0);
            if pending == 0 || started.elapsed() >= max_wait {
                break;
            }
        }
        Ok(out)
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            log::debug!("Closed serial device {}", self.device);
        }
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.close();
    }
}
