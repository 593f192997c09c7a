// Platform-dispatched serial console discovery

use serialport::{SerialPortInfo, SerialPortType};

use super::error::{Error, Result};

#[cfg(unix)]
mod tty_unix;
#[cfg(unix)]
pub use tty_unix::available_ports_sorted;

// Fallback for other platforms: expose raw available_ports()
#[cfg(not(unix))]
pub fn available_ports_sorted() -> Vec<SerialPortInfo> {
    serialport::available_ports().unwrap_or_default()
}

/// Whether a port looks like a USB serial console cable.
pub fn is_usb_serial(port: &SerialPortInfo) -> bool {
    if matches!(port.port_type, SerialPortType::UsbPort { .. }) {
        return true;
    }
    let name = port.port_name.as_str();
    name.starts_with("/dev/cu.usb")
        || name.contains("usbmodem")
        || name.contains("SLAB")
        || name.contains("wchusbserial")
        || name.contains("ttyUSB")
        || name.contains("ttyACM")
}

pub fn usb_serial_ports() -> Vec<String> {
    available_ports_sorted()
        .into_iter()
        .filter(is_usb_serial)
        .map(|p| p.port_name)
        .collect()
}

/// Use `explicit` when given, otherwise the single USB serial device present.
pub fn choose_serial_port(explicit: Option<&str>) -> Result<String> {
    if let Some(port) = explicit {
        return Ok(port.to_string());
    }
    let port = select_single(usb_serial_ports())?;
    log::info!("Using serial port: {port}");
    Ok(port)
}

pub(crate) fn select_single(mut candidates: Vec<String>) -> Result<String> {
    match candidates.len() {
        0 => Err(Error::NoSerialDevice),
        1 => Ok(candidates.remove(0)),
        _ => Err(Error::AmbiguousDeviceSelection { candidates }),
    }
}
