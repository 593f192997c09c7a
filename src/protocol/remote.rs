//! Structured remote operations and the one place that turns them into shell text.
//!
//! Scenarios never concatenate shell strings themselves. They build a [`RemoteOp`]
//! from typed parameters and the channel runs `op.render()`.
use std::{fmt, net::Ipv4Addr, str::FromStr};

use super::error::{Error, Result};

pub const RF_ROOT: &str = "/opt/rf-tests";
pub const EMC_DIR: &str = "/opt/rf-tests/emc";
pub const WIFI_IF_FILE: &str = "/opt/rf-tests/.wifi_if";
pub const LINK_MONITOR_PATH: &str = "/opt/rf-tests/emc/link_monitor.py";
pub const LINK_MONITOR_LOG: &str = "/opt/rf-tests/emc/link_monitor.log";
pub const LINK_MONITOR_STDOUT: &str = "/opt/rf-tests/emc/monitor_stdout.log";
pub const HCI_DEV: &str = "hci0";
/// Wireless interface assumed when detection has not stored one
pub const DEFAULT_WIFI_IFACE: &str = "wlan0";

const HEREDOC_TERMINATOR: &str = "PIRF_EOF";

/// Network interface name, restricted to characters that need no quoting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Iface(String);

impl Iface {
    pub fn new(name: &str) -> Result<Self> {
        let valid = !name.is_empty()
            && name.len() <= 32
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
        if valid {
            Ok(Self(name.to_string()))
        } else {
            Err(Error::invalid(format!("bad interface name {name:?}")))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Iface {
    fn default() -> Self {
        Self(DEFAULT_WIFI_IFACE.to_string())
    }
}

impl fmt::Display for Iface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Bluetooth device address, `XX:XX:XX:XX:XX:XX`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BdAddr(String);

impl FromStr for BdAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        let valid = parts.len() == 6
            && parts
                .iter()
                .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()));
        if valid {
            Ok(Self(s.to_ascii_uppercase()))
        } else {
            Err(Error::invalid(format!("bad Bluetooth address {s:?}")))
        }
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    TwoGhz,
    FiveGhz,
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Band::TwoGhz => write!(f, "2.4GHz"),
            Band::FiveGhz => write!(f, "5GHz"),
        }
    }
}

/// Single-quote `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOp {
    AptUpdate,
    AptInstall { packages: Vec<String> },
    MakeDir { path: String, sudo: bool },
    ChownToLoginUser { path: String },
    ServiceStop { service: String },
    /// Detect the first wireless interface and store it for later scenarios.
    DetectWifiIface,
    ReadWifiIface,
    KillProcess { name: String },
    KillPattern { pattern: String },
    RfkillUnblockAll,
    AddrFlush { iface: Iface },
    AddrAdd { iface: Iface, cidr: String },
    LinkSet { iface: Iface, up: bool },
    HciSet { up: bool },
    BtPower { on: bool },
    BtLe { on: bool },
    BleTxTest { channel: u8, length: u8, payload: u8 },
    BleRxTest { channel: u8 },
    BleTestEnd,
    WriteFile {
        path: String,
        contents: String,
        executable: bool,
    },
    DnsmasqStart { conf: String },
    HostapdStart { conf: String },
    IperfClient {
        host: Ipv4Addr,
        bitrate: String,
        duration_secs: u64,
    },
    IperfServerDaemon { log: String },
    StationDump { iface: Iface },
    AddressOf { iface: Iface },
    FirstGlobalAddress,
    L2PingFlood { bdaddr: BdAddr, size: u32 },
    LinkMonitorStart { peer: Ipv4Addr },
}

impl RemoteOp {
    pub fn kill(name: &str) -> Self {
        RemoteOp::KillProcess {
            name: name.to_string(),
        }
    }

    pub fn kill_pattern(pattern: &str) -> Self {
        RemoteOp::KillPattern {
            pattern: pattern.to_string(),
        }
    }

    /// Literal file write. Rejects contents that would end the heredoc early.
    pub fn write_file(path: &str, contents: &str, executable: bool) -> Result<Self> {
        if contents.lines().any(|l| l.trim_end() == HEREDOC_TERMINATOR) {
            return Err(Error::invalid(format!(
                "file contents for {path} contain the heredoc terminator"
            )));
        }
        Ok(RemoteOp::WriteFile {
            path: path.to_string(),
            contents: contents.to_string(),
            executable,
        })
    }

    pub fn render(&self) -> String {
        match self {
            RemoteOp::AptUpdate => {
                "sudo DEBIAN_FRONTEND=noninteractive apt-get update".to_string()
            }
            RemoteOp::AptInstall { packages } => {
                let list: Vec<String> = packages.iter().map(|p| shell_quote(p)).collect();
                format!(
                    "sudo DEBIAN_FRONTEND=noninteractive apt-get install -y {}",
                    list.join(" ")
                )
            }
            RemoteOp::MakeDir { path, sudo } => {
                let prefix = if *sudo { "sudo " } else { "" };
                format!("{prefix}mkdir -p {}", shell_quote(path))
            }
            RemoteOp::ChownToLoginUser { path } => {
                format!("sudo chown -R \"$USER:$USER\" {}", shell_quote(path))
            }
            RemoteOp::ServiceStop { service } => {
                format!("sudo systemctl stop {}", shell_quote(service))
            }
            RemoteOp::DetectWifiIface => format!(
                "IFACE=$(iw dev | awk '/Interface/ {{print $2; exit}}'); \
                 [ -n \"$IFACE\" ] || IFACE={DEFAULT_WIFI_IFACE}; \
                 echo \"$IFACE\" | sudo tee {WIFI_IF_FILE} >/dev/null"
            ),
            RemoteOp::ReadWifiIface => {
                format!("cat {WIFI_IF_FILE} 2>/dev/null || echo {DEFAULT_WIFI_IFACE}")
            }
            RemoteOp::KillProcess { name } => format!("sudo pkill {}", shell_quote(name)),
            RemoteOp::KillPattern { pattern } => format!("sudo pkill -f {}", shell_quote(pattern)),
            RemoteOp::RfkillUnblockAll => "sudo rfkill unblock all".to_string(),
            RemoteOp::AddrFlush { iface } => format!("sudo ip addr flush dev {iface}"),
            RemoteOp::AddrAdd { iface, cidr } => {
                format!("sudo ip addr add {} dev {iface}", shell_quote(cidr))
            }
            RemoteOp::LinkSet { iface, up } => {
                format!("sudo ip link set {iface} {}", if *up { "up" } else { "down" })
            }
            RemoteOp::HciSet { up } => {
                format!("sudo hciconfig {HCI_DEV} {}", if *up { "up" } else { "down" })
            }
            RemoteOp::BtPower { on } => {
                format!("sudo btmgmt -i {HCI_DEV} power {}", on_off(*on))
            }
            RemoteOp::BtLe { on } => format!("sudo btmgmt -i {HCI_DEV} le {}", on_off(*on)),
            RemoteOp::BleTxTest {
                channel,
                length,
                payload,
            } => format!("sudo btmgmt -i {HCI_DEV} le-tx-test {channel} {length} 0x{payload:02x}"),
            RemoteOp::BleRxTest { channel } => {
                format!("sudo btmgmt -i {HCI_DEV} le-rx-test {channel}")
            }
            RemoteOp::BleTestEnd => format!("sudo btmgmt -i {HCI_DEV} le-test-end"),
            RemoteOp::WriteFile {
                path,
                contents,
                executable,
            } => {
                let mut text = format!(
                    "cat > {} <<'{HEREDOC_TERMINATOR}'\n{}\n{HEREDOC_TERMINATOR}",
                    shell_quote(path),
                    contents.trim_end_matches('\n')
                );
                if *executable {
                    text.push_str(&format!("\nchmod +x {}", shell_quote(path)));
                }
                text
            }
            RemoteOp::DnsmasqStart { conf } => {
                format!("sudo dnsmasq --conf-file={}", shell_quote(conf))
            }
            RemoteOp::HostapdStart { conf } => format!("sudo hostapd -B {}", shell_quote(conf)),
            RemoteOp::IperfClient {
                host,
                bitrate,
                duration_secs,
            } => format!(
                "iperf3 -c {host} -u -b {} -t {duration_secs}",
                shell_quote(bitrate)
            ),
            RemoteOp::IperfServerDaemon { log } => {
                format!("nohup iperf3 -s > {} 2>&1 &", shell_quote(log))
            }
            RemoteOp::StationDump { iface } => format!("iw dev {iface} station dump"),
            RemoteOp::AddressOf { iface } => format!(
                "ip addr show {iface} 2>/dev/null | grep 'inet ' | awk '{{print $2}}' | cut -d'/' -f1"
            ),
            RemoteOp::FirstGlobalAddress => "ip addr show | grep 'inet ' | grep -v '127.0.0.1' \
                 | grep -v '169.254' | awk '{print $2}' | cut -d'/' -f1 | head -1"
                .to_string(),
            RemoteOp::L2PingFlood { bdaddr, size } => {
                format!("sudo l2ping -i {HCI_DEV} -s {size} -f {bdaddr}")
            }
            RemoteOp::LinkMonitorStart { peer } => format!(
                "nohup env WIFI_PEER_IP={peer} /usr/bin/python3 {LINK_MONITOR_PATH} \
                 >{LINK_MONITOR_STDOUT} 2>&1 &"
            ),
        }
    }
}

fn on_off(on: bool) -> &'static str {
    if on {
        "on"
    } else {
        "off"
    }
}

/// Render the hostapd configuration for an open test AP.
pub fn hostapd_conf(iface: &Iface, ssid: &str, country: &str, band: Band, channel: u8) -> String {
    let (hw_mode, caps) = match band {
        Band::TwoGhz => ("g", "ieee80211n=1\nwmm_enabled=1\n"),
        Band::FiveGhz => ("a", "ieee80211n=1\nieee80211ac=1\nwmm_enabled=1\n"),
    };
    format!(
        "interface={iface}\n\
         driver=nl80211\n\
         ssid={ssid}\n\
         country_code={country}\n\
         hw_mode={hw_mode}\n\
         channel={channel}\n\
         auth_algs=1\n\
         ignore_broadcast_ssid=0\n\
         wpa=0\n\
         {caps}"
    )
}

pub fn dnsmasq_conf(iface: &Iface, subnet: &str) -> String {
    format!(
        "interface={iface}\n\
         bind-interfaces\n\
         dhcp-range={subnet}.10,{subnet}.200,12h\n"
    )
}

pub const LINK_MONITOR_PY: &str = r#"#!/usr/bin/env python3
import subprocess, time, datetime, os
LOG = "/opt/rf-tests/emc/link_monitor.log"
peer_ip = os.environ.get("WIFI_PEER_IP")
def log(msg):
    ts = datetime.datetime.now().isoformat()
    print(msg, flush=True)
    with open(LOG, "a") as f:
        f.write(f"{ts} {msg}\n")
def ping(ip, count=3):
    try:
        subprocess.check_call(["ping", "-c", str(count), ip],
                              stdout=subprocess.DEVNULL, stderr=subprocess.DEVNULL)
        return True
    except Exception:
        return False
log("=== EMC link monitor start ===")
while True:
    if peer_ip:
        ok = ping(peer_ip, 3)
        log(f"WIFI_PING {peer_ip} {'OK' if ok else 'FAIL'}")
    time.sleep(2)
"#;
