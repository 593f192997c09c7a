//! Local interface discovery and address selection
//!
//! The local machine needs an address inside the test AP's subnet to serve as iperf3
//! peer. Interfaces are ranked by hardware port name (Wi-Fi first, then anything
//! Ethernet-like) and the first one with an address wins.
use std::{
    process::Command,
    thread,
    time::{Duration, Instant},
};

use crate::protocol::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwarePort {
    /// Human-readable port class, e.g. `Wi-Fi` or `Thunderbolt Ethernet`
    pub name: String,
    /// OS device name, e.g. `en0`
    pub device: String,
}

impl HardwarePort {
    pub fn new(name: &str, device: &str) -> Self {
        Self {
            name: name.to_string(),
            device: device.to_string(),
        }
    }
}

pub trait InterfaceTable {
    fn hardware_ports(&self) -> Vec<HardwarePort>;
    fn address_of(&self, device: &str) -> Option<String>;
}

/// Hardware port name predicate, matched case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortMatcher {
    Exact(String),
    Contains(String),
}

impl PortMatcher {
    pub fn matches(&self, port_name: &str) -> bool {
        let name = port_name.to_lowercase();
        match self {
            PortMatcher::Exact(want) => name == want.to_lowercase(),
            PortMatcher::Contains(fragment) => name.contains(&fragment.to_lowercase()),
        }
    }

    /// Wi-Fi first, then anything Ethernet-like.
    pub fn default_priority() -> Vec<PortMatcher> {
        vec![
            PortMatcher::Exact("wi-fi".into()),
            PortMatcher::Exact("wifi".into()),
            PortMatcher::Contains("ethernet".into()),
        ]
    }
}

pub struct NetworkSelector<'a> {
    table: &'a dyn InterfaceTable,
    priority: Vec<PortMatcher>,
    poll_interval: Duration,
}

impl<'a> NetworkSelector<'a> {
    pub fn new(table: &'a dyn InterfaceTable) -> Self {
        Self {
            table,
            priority: PortMatcher::default_priority(),
            poll_interval: Duration::from_secs(2),
        }
    }

    pub fn with_priority(mut self, priority: Vec<PortMatcher>) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Return `(device, address)` for the highest-priority port that has an address.
    pub fn select_local_address(&self) -> Result<(String, String)> {
        let ports = self.table.hardware_ports();
        for matcher in &self.priority {
            for port in ports.iter().filter(|p| matcher.matches(&p.name)) {
                match self.table.address_of(&port.device) {
                    Some(ip) if !ip.trim().is_empty() => {
                        let ip = ip.trim().to_string();
                        log::info!("Local {} interface '{}' has IP {ip}", port.name, port.device);
                        return Ok((port.device.clone(), ip));
                    }
                    _ => log::debug!("{} ({}) has no address", port.device, port.name),
                }
            }
        }
        Err(Error::NoActiveInterface {
            host: "local machine".to_string(),
        })
    }

    /// Poll until the selected address starts with `required_prefix.` (when given).
    pub fn wait_for_address(
        &self,
        required_prefix: Option<&str>,
        timeout: Duration,
    ) -> Result<(String, String)> {
        let started = Instant::now();
        let mut last: String;
        loop {
            match self.select_local_address() {
                Ok((dev, ip)) if prefix_matches(&ip, required_prefix) => return Ok((dev, ip)),
                Ok((dev, ip)) => {
                    last = format!(
                        "found {dev} with IP {ip}, but not in {}",
                        required_prefix.unwrap_or_default()
                    );
                    log::info!("{last}; retrying");
                }
                Err(err) => {
                    last = err.to_string();
                    log::info!("{last}; retrying");
                }
            }
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(Error::AddressTimeout { timeout, last });
            }
            thread::sleep(self.poll_interval.min(timeout - elapsed));
        }
    }
}

fn prefix_matches(ip: &str, required_prefix: Option<&str>) -> bool {
    match required_prefix {
        Some(prefix) => ip.starts_with(&format!("{prefix}.")),
        None => true,
    }
}

/// Interface table backed by the operating system's own tools.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemInterfaces;

impl InterfaceTable for SystemInterfaces {
    #[cfg(target_os = "macos")]
    fn hardware_ports(&self) -> Vec<HardwarePort> {
        run_tool("networksetup", &["-listallhardwareports"])
            .map(|out| parse_hardware_ports(&out))
            .unwrap_or_default()
    }

    #[cfg(not(target_os = "macos"))]
    fn hardware_ports(&self) -> Vec<HardwarePort> {
        run_tool("ip", &["-o", "link", "show"])
            .map(|out| parse_ip_links(&out))
            .unwrap_or_default()
    }

    #[cfg(target_os = "macos")]
    fn address_of(&self, device: &str) -> Option<String> {
        run_tool("ipconfig", &["getifaddr", device])
            .map(|out| out.trim().to_string())
            .filter(|ip| !ip.is_empty())
    }

    #[cfg(not(target_os = "macos"))]
    fn address_of(&self, device: &str) -> Option<String> {
        run_tool("ip", &["-o", "-4", "addr", "show", "dev", device])
            .and_then(|out| parse_ip_addr(&out))
    }
}

fn run_tool(program: &str, args: &[&str]) -> Option<String> {
    match Command::new(program).args(args).output() {
        Ok(out) if out.status.success() => Some(String::from_utf8_lossy(&out.stdout).into_owned()),
        Ok(out) => {
            log::debug!("{program} {args:?} exited with {}", out.status);
            None
        }
        Err(err) => {
            log::debug!("{program} unavailable: {err}");
            None
        }
    }
}

/// Parse `networksetup -listallhardwareports` into (port, device) pairs.
pub fn parse_hardware_ports(text: &str) -> Vec<HardwarePort> {
    let mut pairs = Vec::new();
    let mut port: Option<String> = None;
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("Hardware Port:") {
            port = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("Device:") {
            let device = rest.trim();
            if let Some(name) = port.take() {
                if !device.is_empty() {
                    pairs.push(HardwarePort::new(&name, device));
                }
            }
        }
    }
    pairs
}

/// Parse `ip -o link show`, naming each link by its class the way macOS does.
pub fn parse_ip_links(text: &str) -> Vec<HardwarePort> {
    text.lines()
        .filter_map(|line| {
            let device = line.split(':').nth(1)?.trim();
            let device = device.split('@').next()?;
            if device.is_empty() || device == "lo" {
                return None;
            }
            let class = if device.starts_with("wl") {
                "Wi-Fi"
            } else if device.starts_with("en") || device.starts_with("eth") {
                "Ethernet"
            } else {
                device
            };
            Some(HardwarePort::new(class, device))
        })
        .collect()
}

/// First IPv4 address in `ip -o -4 addr show` output.
pub fn parse_ip_addr(text: &str) -> Option<String> {
    text.lines().find_map(|line| {
        let mut words = line.split_whitespace();
        words.find(|w| *w == "inet")?;
        let cidr = words.next()?;
        cidr.split('/').next().map(str::to_string)
    })
}
