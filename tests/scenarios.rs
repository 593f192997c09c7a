mod common;

use std::{net::Ipv4Addr, time::Duration};

use common::{done, fast_config, ok, position, quiet_board, CommandLog, SimShell};
use pirf::{
    cli::{actions::run_scenario, build_command, config::RunConfig},
    core::{
        network::{HardwarePort, InterfaceTable},
        scenario::{BleChannel, MonitorAction, ScenarioRunner},
    },
    protocol::{
        channel::CommandChannel,
        mock::MockTransport,
        remote::{Band, BdAddr},
    },
    Error,
};

struct FakeTable {
    wifi_ip: Option<&'static str>,
}

impl InterfaceTable for FakeTable {
    fn hardware_ports(&self) -> Vec<HardwarePort> {
        vec![
            HardwarePort::new("Thunderbolt Ethernet", "en5"),
            HardwarePort::new("Wi-Fi", "en0"),
        ]
    }

    fn address_of(&self, device: &str) -> Option<String> {
        match device {
            "en0" => self.wifi_ip.map(str::to_string),
            _ => None,
        }
    }
}

fn run_config() -> RunConfig {
    let mut config = RunConfig::default();
    config.channel = fast_config();
    config.network.address_timeout_secs = 1;
    config.network.poll_interval_secs = 1;
    // `true` accepts any arguments and exits 0, standing in for iperf3.
    config.tools.iperf3 = "true".to_string();
    config
}

fn board(
    handler: impl FnMut(&str) -> Option<String> + Send + 'static,
) -> (CommandChannel<MockTransport>, CommandLog) {
    let shell = SimShell::open(handler);
    let log = shell.command_log();
    let mut channel = CommandChannel::new(shell.into_transport(), fast_config());
    channel.login(None).expect("login");
    (channel, log)
}

fn board_with_wifi_address(command: &str) -> Option<String> {
    if command.starts_with("ip addr show wlan0") {
        ok("192.168.88.1\r\n")
    } else if command.starts_with("iw dev wlan0 station dump") {
        ok("Station 3c:22:fb:00:11:22 (on wlan0)\r\n\tsignal:  \t-41 dBm\r\n")
    } else {
        quiet_board(command)
    }
}

#[test]
fn reset_twice_is_clean() {
    let (mut channel, log) = board(quiet_board);
    let config = run_config();
    let table = FakeTable { wifi_ip: None };
    let mut runner = ScenarioRunner::new(&mut channel, &config, &table);

    let first = runner.reset().expect("first reset");
    let second = runner.reset().expect("second reset");
    assert_eq!(first, second);
    assert_eq!(first.as_str(), "wlan0");

    let log = log.lock();
    assert_eq!(log.iter().filter(|c| c.as_str() == "sudo pkill 'hostapd'").count(), 2);
    assert!(log.iter().all(|c| !c.contains("|| true")));
}

#[test]
fn reset_uses_stored_interface() {
    let (mut channel, log) = board(|command| {
        if command.starts_with("cat /opt/rf-tests/.wifi_if") {
            ok("wlan1\r\n")
        } else {
            quiet_board(command)
        }
    });
    let config = run_config();
    let table = FakeTable { wifi_ip: None };
    let iface = ScenarioRunner::new(&mut channel, &config, &table)
        .reset()
        .expect("reset");
    assert_eq!(iface.as_str(), "wlan1");
    assert!(position(&log, "sudo ip addr flush dev wlan1").is_some());
}

#[test]
fn hostile_stored_interface_falls_back() {
    let (mut channel, log) = board(|command| {
        if command.starts_with("cat /opt/rf-tests/.wifi_if") {
            ok("wlan0;reboot\r\n")
        } else {
            quiet_board(command)
        }
    });
    let config = run_config();
    let table = FakeTable { wifi_ip: None };
    let iface = ScenarioRunner::new(&mut channel, &config, &table)
        .reset()
        .expect("reset");
    assert_eq!(iface.as_str(), "wlan0");
    assert!(!log.lock().iter().any(|c| c.contains("dev wlan0;reboot")));
}

#[test]
fn setup_installs_and_pushes_monitor() {
    let (mut channel, log) = board(quiet_board);
    let config = run_config();
    let table = FakeTable { wifi_ip: None };
    ScenarioRunner::new(&mut channel, &config, &table)
        .setup()
        .expect("setup");

    let install = position(&log, "apt-get install -y").expect("install");
    assert!(log.lock()[install].contains("'bluez-hcidump'"));
    let detect = position(&log, "sudo tee /opt/rf-tests/.wifi_if").expect("detect");
    let push = position(&log, "link_monitor.py' <<'PIRF_EOF'").expect("push");
    assert!(install < detect && detect < push);
    assert!(log.lock()[push].ends_with("chmod +x '/opt/rf-tests/emc/link_monitor.py'"));
    assert!(position(&log, "sudo pkill 'hostapd'").is_none());
}

#[test]
fn failed_install_aborts_setup() {
    let (mut channel, log) = board(|command| {
        if command.contains("apt-get install") {
            done("E: Unable to locate package\r\n", "100")
        } else {
            quiet_board(command)
        }
    });
    let config = run_config();
    let table = FakeTable { wifi_ip: None };
    let err = ScenarioRunner::new(&mut channel, &config, &table)
        .setup()
        .expect_err("install fails");
    assert!(matches!(err, Error::RemoteCommandFailed { exit_code: 100, .. }));
    assert!(position(&log, "link_monitor.py").is_none());
}

#[cfg(unix)]
#[test]
fn wifi_tx_floods_local_server_then_stops_ap() {
    let (mut channel, log) = board(quiet_board);
    let config = run_config();
    let table = FakeTable {
        wifi_ip: Some("192.168.88.23"),
    };
    ScenarioRunner::new(&mut channel, &config, &table)
        .wifi_tx(Band::TwoGhz, 13, Duration::from_secs(30))
        .expect("wifi_tx");

    let hostapd_conf = position(&log, "cat > '/tmp/hostapd.conf'").expect("hostapd conf");
    assert!(log.lock()[hostapd_conf].contains("channel=13\n"));
    assert!(log.lock()[hostapd_conf].contains("hw_mode=g\n"));
    let address = position(&log, "sudo ip addr add '192.168.88.1/24' dev wlan0").expect("addr");
    let start = position(&log, "sudo hostapd -B '/tmp/hostapd.conf'").expect("hostapd");
    let client = position(&log, "iperf3 -c 192.168.88.23 -u -b '100M' -t 30").expect("client");
    let last_kill = log
        .lock()
        .iter()
        .rposition(|c| c == "sudo pkill 'hostapd'")
        .expect("stop ap");
    assert!(address < start && start < client && client < last_kill);
}

#[cfg(unix)]
#[test]
fn wifi_tx_without_local_address_still_stops_ap() {
    let (mut channel, log) = board(quiet_board);
    let config = run_config();
    let table = FakeTable {
        wifi_ip: Some("10.0.0.5"),
    };
    let err = ScenarioRunner::new(&mut channel, &config, &table)
        .wifi_tx(Band::FiveGhz, 36, Duration::from_secs(5))
        .expect_err("no address in AP subnet");
    assert!(matches!(err, Error::AddressTimeout { .. }));
    assert!(position(&log, "iperf3 -c").is_none());
    let start = position(&log, "sudo hostapd -B").expect("hostapd");
    let last_kill = log
        .lock()
        .iter()
        .rposition(|c| c == "sudo pkill 'hostapd'")
        .expect("stop ap");
    assert!(start < last_kill);
}

#[test]
fn failed_hostapd_start_tears_down_dnsmasq() {
    let (mut channel, log) = board(|command| {
        if command.starts_with("sudo hostapd -B") {
            done("Could not configure driver mode\r\n", "1")
        } else {
            quiet_board(command)
        }
    });
    let config = run_config();
    let table = FakeTable {
        wifi_ip: Some("192.168.88.23"),
    };
    let err = ScenarioRunner::new(&mut channel, &config, &table)
        .wifi_tx(Band::TwoGhz, 1, Duration::from_secs(5))
        .expect_err("hostapd fails");
    assert!(matches!(err, Error::RemoteCommandFailed { exit_code: 1, .. }));

    let start = position(&log, "sudo hostapd -B").expect("hostapd");
    let after: Vec<String> = log.lock()[start + 1..].to_vec();
    assert!(after.iter().any(|c| c == "sudo pkill 'dnsmasq'"), "{after:?}");
    assert!(after.iter().any(|c| c == "sudo ip link set wlan0 down"), "{after:?}");
    assert!(position(&log, "iperf3 -c").is_none());
}

#[cfg(unix)]
#[test]
fn wifi_rx_targets_board_address_and_dumps_stations() {
    let (mut channel, log) = board(board_with_wifi_address);
    let config = run_config();
    let table = FakeTable {
        wifi_ip: Some("192.168.88.57"),
    };
    ScenarioRunner::new(&mut channel, &config, &table)
        .wifi_rx(Band::FiveGhz, 149, Duration::from_secs(1))
        .expect("wifi_rx");

    let conf = position(&log, "cat > '/tmp/hostapd.conf'").expect("conf");
    assert!(log.lock()[conf].contains("ieee80211ac=1\n"));
    let server = position(&log, "nohup iperf3 -s").expect("server");
    let query = position(&log, "ip addr show wlan0").expect("query");
    let dump = position(&log, "iw dev wlan0 station dump").expect("dump");
    assert!(server < query && query < dump);
    assert!(position(&log, "ip addr show eth0").is_none());
}

#[cfg(unix)]
#[test]
fn wifi_rx_falls_back_to_global_address() {
    let (mut channel, log) = board(|command| {
        if command.starts_with("ip addr show | grep") {
            ok("10.1.2.3\r\n")
        } else if command.starts_with("ip addr show") {
            ok("")
        } else {
            quiet_board(command)
        }
    });
    let config = run_config();
    let table = FakeTable {
        wifi_ip: Some("192.168.88.57"),
    };
    ScenarioRunner::new(&mut channel, &config, &table)
        .wifi_rx(Band::TwoGhz, 1, Duration::from_secs(1))
        .expect("wifi_rx");
    let wired = position(&log, "ip addr show eth0").expect("eth0 queried");
    let global = position(&log, "ip addr show | grep").expect("global queried");
    assert!(wired < global);
}

#[cfg(unix)]
#[test]
fn wifi_rx_without_board_address_fails_and_stops_ap() {
    let (mut channel, log) = board(|command| {
        if command.starts_with("ip addr show") {
            ok("")
        } else {
            quiet_board(command)
        }
    });
    let config = run_config();
    let table = FakeTable {
        wifi_ip: Some("192.168.88.57"),
    };
    let err = ScenarioRunner::new(&mut channel, &config, &table)
        .wifi_rx(Band::TwoGhz, 1, Duration::from_secs(1))
        .expect_err("no board address");
    assert!(matches!(err, Error::NoActiveInterface { .. }));
    let global = position(&log, "ip addr show | grep").expect("global queried");
    let last_kill = log
        .lock()
        .iter()
        .rposition(|c| c == "sudo pkill 'hostapd'")
        .expect("stop ap");
    assert!(global < last_kill);
    assert!(position(&log, "station dump").is_none());
}

#[test]
fn ble_tx_prepares_controller_first() {
    let (mut channel, log) = board(quiet_board);
    let config = run_config();
    let table = FakeTable { wifi_ip: None };
    ScenarioRunner::new(&mut channel, &config, &table)
        .ble_tx(BleChannel::Low)
        .expect("ble_tx");

    let le_on = position(&log, "btmgmt -i hci0 le on").expect("le on");
    let power_on = position(&log, "btmgmt -i hci0 power on").expect("power on");
    let test = position(&log, "le-tx-test 0 37 0x00").expect("tx test");
    assert!(le_on < power_on && power_on < test);
}

#[test]
fn ble_end_tolerates_no_running_test() {
    let (mut channel, _log) = board(|command| {
        if command.contains("le-test-end") {
            done("Test End failed: Command Disallowed (0x0c)\r\n", "1")
        } else {
            quiet_board(command)
        }
    });
    let config = run_config();
    let table = FakeTable { wifi_ip: None };
    ScenarioRunner::new(&mut channel, &config, &table)
        .ble_end()
        .expect("best effort");
}

#[test]
fn btclassic_flood_targets_peer() {
    let (mut channel, log) = board(quiet_board);
    let config = run_config();
    let table = FakeTable { wifi_ip: None };
    let peer: BdAddr = "3c:22:fb:00:11:22".parse().expect("bdaddr");
    ScenarioRunner::new(&mut channel, &config, &table)
        .btclassic_tx(&peer)
        .expect("btclassic");
    assert!(position(&log, "sudo l2ping -i hci0 -s 1024 -f 3C:22:FB:00:11:22").is_some());
}

#[test]
fn emc_monitor_stop_skips_reset() {
    let (mut channel, log) = board(quiet_board);
    let config = run_config();
    let table = FakeTable { wifi_ip: None };
    ScenarioRunner::new(&mut channel, &config, &table)
        .emc_monitor(Ipv4Addr::new(192, 168, 88, 10), MonitorAction::Stop)
        .expect("stop");
    assert!(position(&log, "sudo pkill 'hostapd'").is_none());
    let push = position(&log, "link_monitor.py' <<'PIRF_EOF'").expect("push");
    let kill = position(&log, "sudo pkill -f 'link_monitor.py'").expect("kill");
    assert!(push < kill);
}

#[test]
fn emc_monitor_start_passes_peer() {
    let (mut channel, log) = board(quiet_board);
    let config = run_config();
    let table = FakeTable { wifi_ip: None };
    ScenarioRunner::new(&mut channel, &config, &table)
        .emc_monitor(Ipv4Addr::new(192, 168, 88, 10), MonitorAction::Start)
        .expect("start");
    let reset = position(&log, "sudo pkill 'hostapd'").expect("reset");
    let start = position(&log, "WIFI_PEER_IP=192.168.88.10").expect("start");
    assert!(reset < start);
}

#[test]
fn subcommand_dispatch_uses_cli_defaults() {
    let (mut channel, log) = board(quiet_board);
    let config = run_config();
    let table = FakeTable { wifi_ip: None };
    let mut runner = ScenarioRunner::new(&mut channel, &config, &table);

    let matches = build_command()
        .try_get_matches_from(["pirf", "ble_rx"])
        .expect("parse");
    let (name, sub) = matches.subcommand().expect("subcommand");
    run_scenario(&mut runner, name, sub, &config).expect("ble_rx");
    assert!(position(&log, "le-rx-test 39").is_some());

    let matches = build_command()
        .try_get_matches_from(["pirf", "emc_monitor"])
        .expect("parse");
    let (name, sub) = matches.subcommand().expect("subcommand");
    run_scenario(&mut runner, name, sub, &config).expect("emc_monitor");
    assert!(position(&log, "WIFI_PEER_IP=192.168.88.10").is_some());
}
