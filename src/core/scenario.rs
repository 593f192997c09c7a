//! RF test scenarios driven over the command channel.
//!
//! Each scenario is a fixed sequence of [`RemoteOp`]s on the board, bracketed by
//! local helpers where traffic has to flow between the host and the board.
use std::{fmt, net::Ipv4Addr, str::FromStr, time::Duration};

use crate::{
    cli::config::RunConfig,
    core::{
        network::{InterfaceTable, NetworkSelector},
        subprocess::{tool_available, LocalCommand, ProcessHandle},
    },
    protocol::{
        channel::{CommandChannel, CommandOutcome},
        error::{Error, Result},
        remote::{
            dnsmasq_conf, hostapd_conf, Band, BdAddr, Iface, RemoteOp, DEFAULT_WIFI_IFACE, EMC_DIR,
            LINK_MONITOR_LOG, LINK_MONITOR_PATH, LINK_MONITOR_PY, RF_ROOT,
        },
        transport::ByteTransport,
    },
};

const WIRED_IFACE: &str = "eth0";
const HOSTAPD_CONF: &str = "/tmp/hostapd.conf";
const DNSMASQ_CONF: &str = "/tmp/dnsmasq.conf";
const IPERF_SERVER_LOG: &str = "/tmp/iperf3_srv.log";

const INSTALL_TIMEOUT: Duration = Duration::from_secs(240);
const DAEMON_START_TIMEOUT: Duration = Duration::from_secs(5);
/// Slack on top of the traffic duration for iperf3 setup and the final report.
const TRAFFIC_GRACE: Duration = Duration::from_secs(15);
/// l2ping floods until the board is told to stop.
const FLOOD_TIMEOUT: Duration = Duration::from_secs(999_999);
const BLE_PACKET_LENGTH: u8 = 37;

pub const SETUP_PACKAGES: &[&str] = &[
    "hostapd",
    "dnsmasq",
    "iperf3",
    "iw",
    "rfkill",
    "bluez",
    "bluez-hcidump",
    "python3",
];

/// BLE test channel selector: the lowest or the highest data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BleChannel {
    Low,
    High,
}

impl BleChannel {
    pub fn number(self) -> u8 {
        match self {
            BleChannel::Low => 0,
            BleChannel::High => 39,
        }
    }
}

impl FromStr for BleChannel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "low" => Ok(BleChannel::Low),
            "high" => Ok(BleChannel::High),
            other => Err(Error::invalid(format!(
                "BLE channel must be low or high, got {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorAction {
    Start,
    Stop,
}

impl FromStr for MonitorAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "start" => Ok(MonitorAction::Start),
            "stop" => Ok(MonitorAction::Stop),
            other => Err(Error::invalid(format!(
                "monitor action must be start or stop, got {other:?}"
            ))),
        }
    }
}

impl fmt::Display for MonitorAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorAction::Start => write!(f, "start"),
            MonitorAction::Stop => write!(f, "stop"),
        }
    }
}

pub struct ScenarioRunner<'a, T: ByteTransport> {
    channel: &'a mut CommandChannel<T>,
    config: &'a RunConfig,
    interfaces: &'a dyn InterfaceTable,
}

impl<'a, T: ByteTransport> ScenarioRunner<'a, T> {
    pub fn new(
        channel: &'a mut CommandChannel<T>,
        config: &'a RunConfig,
        interfaces: &'a dyn InterfaceTable,
    ) -> Self {
        Self {
            channel,
            config,
            interfaces,
        }
    }

    /// Return the board to a clean RF state. Every step is best-effort.
    pub fn reset(&mut self) -> Result<Iface> {
        log::info!("Resetting board RF state");
        self.run_teardown(&[
            RemoteOp::kill("hostapd"),
            RemoteOp::kill("dnsmasq"),
            RemoteOp::kill("iperf3"),
            RemoteOp::kill_pattern("link_monitor.py"),
            RemoteOp::kill("l2ping"),
        ]);
        let iface = self.resolve_wifi_iface();
        self.run_teardown(&[
            RemoteOp::RfkillUnblockAll,
            RemoteOp::AddrFlush {
                iface: iface.clone(),
            },
            RemoteOp::LinkSet {
                iface: iface.clone(),
                up: false,
            },
            RemoteOp::kill("wpa_supplicant"),
            RemoteOp::BleTestEnd,
            RemoteOp::HciSet { up: false },
            RemoteOp::HciSet { up: true },
        ]);
        Ok(iface)
    }

    /// Install the board-side toolchain and prepare the test directories.
    pub fn setup(&mut self) -> Result<()> {
        log::info!("Installing board packages");
        self.required_with(&RemoteOp::AptUpdate, INSTALL_TIMEOUT)?;
        self.required_with(
            &RemoteOp::AptInstall {
                packages: SETUP_PACKAGES.iter().map(|p| p.to_string()).collect(),
            },
            INSTALL_TIMEOUT,
        )?;
        self.required(&RemoteOp::MakeDir {
            path: EMC_DIR.to_string(),
            sudo: true,
        })?;
        self.required(&RemoteOp::ChownToLoginUser {
            path: RF_ROOT.to_string(),
        })?;
        self.run_teardown(&["hostapd", "dnsmasq", "wpa_supplicant"].map(|service| {
            RemoteOp::ServiceStop {
                service: service.to_string(),
            }
        }));
        self.required(&RemoteOp::DetectWifiIface)?;
        let iface = self.resolve_wifi_iface();
        self.push_link_monitor()?;
        println!("[board] Setup complete, Wi-Fi interface {iface}");
        Ok(())
    }

    /// Bring up the open test AP. A failed step tears down whatever already started.
    pub fn start_ap(&mut self, iface: &Iface, band: Band, channel: u8) -> Result<()> {
        let result = self.bring_up_ap(iface, band, channel);
        if result.is_err() {
            self.stop_ap(iface);
        }
        result
    }

    fn bring_up_ap(&mut self, iface: &Iface, band: Band, channel: u8) -> Result<()> {
        let config = self.config;
        let ap = &config.access_point;
        let timeout = self.command_timeout();
        log::info!("Starting AP band={band} ch={channel} ssid={}", ap.ssid);
        self.run_teardown(&[
            RemoteOp::RfkillUnblockAll,
            RemoteOp::LinkSet {
                iface: iface.clone(),
                up: false,
            },
            RemoteOp::kill("wpa_supplicant"),
            RemoteOp::AddrFlush {
                iface: iface.clone(),
            },
        ]);

        let hostapd = hostapd_conf(iface, &ap.ssid, &ap.country, band, channel);
        self.required(&RemoteOp::write_file(HOSTAPD_CONF, &hostapd, false)?)?;
        self.required(&RemoteOp::LinkSet {
            iface: iface.clone(),
            up: true,
        })?;
        // Address may already be present after an interrupted run.
        self.best_effort(
            &RemoteOp::AddrAdd {
                iface: iface.clone(),
                cidr: format!("{}/24", ap.board_address()),
            },
            timeout,
        );
        let dnsmasq = dnsmasq_conf(iface, &ap.subnet);
        self.required(&RemoteOp::write_file(DNSMASQ_CONF, &dnsmasq, false)?)?;
        self.required_with(
            &RemoteOp::DnsmasqStart {
                conf: DNSMASQ_CONF.to_string(),
            },
            DAEMON_START_TIMEOUT,
        )?;
        self.required_with(
            &RemoteOp::HostapdStart {
                conf: HOSTAPD_CONF.to_string(),
            },
            DAEMON_START_TIMEOUT,
        )?;
        println!("[board] AP up. Connect this machine to SSID '{}' (open)", ap.ssid);
        Ok(())
    }

    pub fn stop_ap(&mut self, iface: &Iface) {
        log::info!("Stopping AP");
        self.run_teardown(&[
            RemoteOp::kill("hostapd"),
            RemoteOp::kill("dnsmasq"),
            RemoteOp::AddrFlush {
                iface: iface.clone(),
            },
            RemoteOp::LinkSet {
                iface: iface.clone(),
                up: false,
            },
        ]);
    }

    /// Board transmits: remote iperf3 client floods a local server over the test AP.
    pub fn wifi_tx(&mut self, band: Band, channel: u8, duration: Duration) -> Result<()> {
        let iface = self.reset()?;
        self.start_ap(&iface, band, channel)?;
        let result = self.wifi_tx_traffic(duration);
        self.stop_ap(&iface);
        result
    }

    fn wifi_tx_traffic(&mut self, duration: Duration) -> Result<()> {
        let config = self.config;
        let tools = &config.tools;
        tool_available(&tools.iperf3);
        let (device, local_ip) = self.wait_for_local_address()?;
        println!("[host] Using {device} IP {local_ip} for the iperf3 server");
        let host = parse_ipv4(&local_ip)?;

        let mut server =
            ProcessHandle::spawn("iperf3 server", &LocalCommand::new(&tools.iperf3).arg("-s"))?;
        let client = RemoteOp::IperfClient {
            host,
            bitrate: tools.bitrate.clone(),
            duration_secs: duration.as_secs(),
        };
        self.best_effort(&client, duration + TRAFFIC_GRACE);
        if let Err(err) = server.terminate() {
            log::warn!("{err}");
        }
        Ok(())
    }

    /// Board receives: a local iperf3 client floods the board's iperf3 server.
    pub fn wifi_rx(&mut self, band: Band, channel: u8, duration: Duration) -> Result<()> {
        let iface = self.reset()?;
        self.start_ap(&iface, band, channel)?;
        let result = self.wifi_rx_traffic(&iface, duration);
        if result.is_ok() {
            let timeout = self.command_timeout();
            if let Some(dump) = self.best_effort(
                &RemoteOp::StationDump {
                    iface: iface.clone(),
                },
                timeout,
            ) {
                println!("\n[board] Station dump (RSSI etc.):\n{}", dump.output());
            }
        }
        self.stop_ap(&iface);
        result
    }

    fn wifi_rx_traffic(&mut self, iface: &Iface, duration: Duration) -> Result<()> {
        let config = self.config;
        let tools = &config.tools;
        tool_available(&tools.iperf3);
        let (device, local_ip) = self.wait_for_local_address()?;
        println!("[host] {device} IP {local_ip}");

        let timeout = self.command_timeout();
        self.best_effort(&RemoteOp::kill("iperf3"), timeout);
        self.required(&RemoteOp::IperfServerDaemon {
            log: IPERF_SERVER_LOG.to_string(),
        })?;
        let remote = self.remote_address(iface)?;
        log::info!("Board address {remote}");

        let client = LocalCommand::new(&tools.iperf3)
            .arg("-c")
            .arg(remote.to_string())
            .arg("-u")
            .arg("-b")
            .arg(&tools.bitrate)
            .arg("-t")
            .arg(duration.as_secs().to_string());
        let mut client = ProcessHandle::spawn("iperf3 client", &client)?;
        let code = client.wait_for(duration + TRAFFIC_GRACE)?;
        if code != 0 {
            log::warn!("Local iperf3 client exited with {code}");
        }
        Ok(())
    }

    pub fn ble_tx(&mut self, channel: BleChannel) -> Result<()> {
        self.reset()?;
        self.prepare_ble()?;
        self.required(&RemoteOp::BleTxTest {
            channel: channel.number(),
            length: BLE_PACKET_LENGTH,
            payload: 0x00,
        })?;
        println!(
            "[board] BLE LE TX test started on channel {}. Stop with 'ble_end'.",
            channel.number()
        );
        Ok(())
    }

    pub fn ble_rx(&mut self, channel: BleChannel) -> Result<()> {
        self.reset()?;
        self.prepare_ble()?;
        self.required(&RemoteOp::BleRxTest {
            channel: channel.number(),
        })?;
        println!(
            "[board] BLE LE RX test started on channel {}. Stop with 'ble_end'.",
            channel.number()
        );
        Ok(())
    }

    pub fn ble_end(&mut self) -> Result<()> {
        let timeout = self.command_timeout();
        let counters = self
            .best_effort(&RemoteOp::BleTestEnd, timeout)
            .map(|outcome| outcome.output().to_string())
            .unwrap_or_default();
        println!("[board] BLE test end/counters:\n{counters}");
        Ok(())
    }

    pub fn btclassic_tx(&mut self, bdaddr: &BdAddr) -> Result<()> {
        self.reset()?;
        self.required(&RemoteOp::HciSet { up: true })?;
        println!("[board] Starting BT Classic ACL flood to {bdaddr} (Ctrl+C to stop)");
        self.best_effort(
            &RemoteOp::L2PingFlood {
                bdaddr: bdaddr.clone(),
                size: 1024,
            },
            FLOOD_TIMEOUT,
        );
        Ok(())
    }

    pub fn emc_monitor(&mut self, peer: Ipv4Addr, action: MonitorAction) -> Result<()> {
        if action == MonitorAction::Start {
            self.reset()?;
        }
        self.push_link_monitor()?;
        let timeout = self.command_timeout();
        match action {
            MonitorAction::Start => {
                self.best_effort(&RemoteOp::kill_pattern("link_monitor.py"), timeout);
                self.best_effort(&RemoteOp::LinkMonitorStart { peer }, timeout);
                println!("[board] EMC link monitor started. Log: {LINK_MONITOR_LOG}");
            }
            MonitorAction::Stop => {
                self.best_effort(&RemoteOp::kill_pattern("link_monitor.py"), timeout);
                println!("[board] EMC link monitor stopped.");
            }
        }
        Ok(())
    }

    fn prepare_ble(&mut self) -> Result<()> {
        let timeout = self.command_timeout();
        self.best_effort(&RemoteOp::HciSet { up: false }, timeout);
        self.required(&RemoteOp::HciSet { up: true })?;
        self.best_effort(&RemoteOp::BtPower { on: false }, timeout);
        self.required(&RemoteOp::BtLe { on: true })?;
        self.required(&RemoteOp::BtPower { on: true })?;
        Ok(())
    }

    fn push_link_monitor(&mut self) -> Result<()> {
        self.required(&RemoteOp::MakeDir {
            path: EMC_DIR.to_string(),
            sudo: false,
        })?;
        self.required(&RemoteOp::write_file(
            LINK_MONITOR_PATH,
            LINK_MONITOR_PY,
            true,
        )?)?;
        Ok(())
    }

    /// Read the stored wireless interface, falling back to `wlan0`.
    fn resolve_wifi_iface(&mut self) -> Iface {
        let timeout = self.command_timeout();
        let name = self
            .best_effort(&RemoteOp::ReadWifiIface, timeout)
            .and_then(|outcome| last_line(outcome.output()));
        match name.as_deref().map(Iface::new) {
            Some(Ok(iface)) => iface,
            Some(Err(err)) => {
                log::warn!("{err}; using {DEFAULT_WIFI_IFACE}");
                Iface::default()
            }
            None => Iface::default(),
        }
    }

    /// Board address: Wi-Fi interface first, then wired, then any global address.
    fn remote_address(&mut self, iface: &Iface) -> Result<Ipv4Addr> {
        let timeout = self.command_timeout();
        let mut queries = vec![RemoteOp::AddressOf {
            iface: iface.clone(),
        }];
        if iface.as_str() != WIRED_IFACE {
            queries.push(RemoteOp::AddressOf {
                iface: Iface::new(WIRED_IFACE)?,
            });
        }
        queries.push(RemoteOp::FirstGlobalAddress);

        for op in &queries {
            let found = self
                .best_effort(op, timeout)
                .and_then(|outcome| first_ipv4(outcome.output()));
            if let Some(ip) = found {
                return Ok(ip);
            }
        }
        Err(Error::NoActiveInterface {
            host: "remote board".to_string(),
        })
    }

    fn wait_for_local_address(&self) -> Result<(String, String)> {
        let network = &self.config.network;
        NetworkSelector::new(self.interfaces)
            .with_poll_interval(network.poll_interval())
            .wait_for_address(
                Some(&self.config.access_point.subnet),
                network.address_timeout(),
            )
    }

    fn command_timeout(&self) -> Duration {
        self.channel.config().command_timeout()
    }

    fn required(&mut self, op: &RemoteOp) -> Result<CommandOutcome> {
        let timeout = self.command_timeout();
        self.required_with(op, timeout)
    }

    fn required_with(&mut self, op: &RemoteOp, timeout: Duration) -> Result<CommandOutcome> {
        let command = op.render();
        log::info!("[board] $ {command}");
        self.channel.execute(&command, timeout, true)
    }

    /// Run `op`, logging instead of propagating any failure.
    fn best_effort(&mut self, op: &RemoteOp, timeout: Duration) -> Option<CommandOutcome> {
        let command = op.render();
        log::info!("[board] $ {command}");
        match self.channel.execute(&command, timeout, false) {
            Ok(outcome) => {
                match outcome.exit_code() {
                    Some(0) => {}
                    Some(code) => log::warn!("'{command}' exited with {code}, continuing"),
                    None => log::warn!("'{command}' did not finish in {timeout:?}, continuing"),
                }
                Some(outcome)
            }
            Err(err) => {
                log::warn!("'{command}' failed: {err}");
                None
            }
        }
    }

    fn run_teardown(&mut self, ops: &[RemoteOp]) {
        let timeout = self.command_timeout();
        for op in ops {
            self.best_effort(op, timeout);
        }
    }
}

fn last_line(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
        .map(str::to_string)
}

fn first_ipv4(output: &str) -> Option<Ipv4Addr> {
    output.lines().find_map(|l| l.trim().parse().ok())
}

fn parse_ipv4(value: &str) -> Result<Ipv4Addr> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::invalid(format!("not an IPv4 address: {value:?}")))
}
