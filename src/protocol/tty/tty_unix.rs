use serialport::{SerialPortInfo, SerialPortType};
use std::collections::HashSet;

/// Return the list of available serial ports sorted/deduped for Unix.
pub fn available_ports_sorted() -> Vec<SerialPortInfo> {
    let raw_ports = serialport::available_ports().unwrap_or_default();
    sort_and_dedup_ports(raw_ports)
}

/// macOS lists every device twice, as `/dev/tty.X` and `/dev/cu.X`. The call-out
/// node is the one to open from the host side, so keep only that one.
pub(crate) fn sort_and_dedup_ports(raw_ports: Vec<SerialPortInfo>) -> Vec<SerialPortInfo> {
    let callout: HashSet<String> = raw_ports
        .iter()
        .filter_map(|p| p.port_name.strip_prefix("/dev/cu.").map(str::to_string))
        .collect();

    let mut seen: HashSet<String> = HashSet::new();
    let mut ports: Vec<SerialPortInfo> = raw_ports
        .into_iter()
        .filter(|p| match p.port_name.strip_prefix("/dev/tty.") {
            Some(base) => !callout.contains(base),
            None => true,
        })
        .filter(|p| seen.insert(p.port_name.clone()))
        .collect();

    // Priority sort: USB/ACM first, then ttys
    fn priority(port: &SerialPortInfo) -> i32 {
        let n = port.port_name.to_lowercase();
        if matches!(port.port_type, SerialPortType::UsbPort { .. })
            || n.contains("ttyusb")
            || n.contains("usb")
        {
            0
        } else if n.contains("acm") {
            1
        } else if n.contains("ttys") || n.contains("serial") {
            2
        } else {
            10
        }
    }

    ports.sort_by(|a, b| {
        priority(a)
            .cmp(&priority(b))
            .then_with(|| a.port_name.cmp(&b.port_name))
    });
    ports
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make(name: &str) -> SerialPortInfo {
        SerialPortInfo {
            port_name: name.to_string(),
            port_type: SerialPortType::Unknown,
        }
    }

    #[test]
    fn callout_node_replaces_tty_twin() {
        let out = sort_and_dedup_ports(vec![
            make("/dev/tty.usbserial-1410"),
            make("/dev/cu.usbserial-1410"),
            make("/dev/tty.Bluetooth-Incoming-Port"),
        ]);
        let names: Vec<_> = out.iter().map(|p| p.port_name.as_str()).collect();
        assert!(names.contains(&"/dev/cu.usbserial-1410"));
        assert!(!names.contains(&"/dev/tty.usbserial-1410"));
        assert!(names.contains(&"/dev/tty.Bluetooth-Incoming-Port"));
    }

    #[test]
    fn usb_sorted_before_plain_ttys() {
        let out = sort_and_dedup_ports(vec![
            make("/dev/ttyS0"),
            make("/dev/ttyACM0"),
            make("/dev/ttyUSB0"),
            make("/dev/ttyUSB0"),
        ]);
        let names: Vec<_> = out.iter().map(|p| p.port_name.as_str()).collect();
        assert_eq!(names, vec!["/dev/ttyUSB0", "/dev/ttyACM0", "/dev/ttyS0"]);
    }
}
