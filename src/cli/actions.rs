use anyhow::{anyhow, Context, Result};
use clap::ArgMatches;
use serde::Serialize;
use serialport::SerialPortType;
use std::{net::Ipv4Addr, path::Path, time::Duration};

use super::config::RunConfig;
use crate::{
    core::{
        network::SystemInterfaces,
        scenario::{BleChannel, MonitorAction, ScenarioRunner},
    },
    protocol::{
        channel::CommandChannel,
        remote::{Band, BdAddr},
        transport::{ByteTransport, SerialConfig, SerialTransport},
        tty,
    },
};

#[derive(Serialize)]
struct PortInfo<'a> {
    port_name: &'a str,
    usb_serial: bool,
    port_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    vid: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pid: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    serial: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    manufacturer: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    product: Option<&'a str>,
}

/// Dispatch the selected subcommand.
pub fn run(matches: &ArgMatches) -> Result<()> {
    let (name, sub) = matches
        .subcommand()
        .ok_or_else(|| anyhow!("no subcommand given"))?;
    if name == "list-ports" {
        return list_ports(sub.get_flag("json"));
    }

    let config = resolve_config(sub)?;
    let device = tty::choose_serial_port(config.serial.port.as_deref())?;
    let transport = SerialTransport::open(&device, &SerialConfig::with_baud(config.serial.baud))?;
    let mut channel = CommandChannel::new(transport, config.channel.clone());
    channel
        .login(config.credentials())
        .with_context(|| format!("login on {device} failed"))?;

    let interfaces = SystemInterfaces;
    let result = {
        let mut runner = ScenarioRunner::new(&mut channel, &config, &interfaces);
        run_scenario(&mut runner, name, sub, &config)
    };
    channel.close();
    result.with_context(|| format!("{name} failed"))
}

/// Run the scenario named by a subcommand on an already logged-in runner.
pub fn run_scenario<T: ByteTransport>(
    runner: &mut ScenarioRunner<'_, T>,
    name: &str,
    sub: &ArgMatches,
    config: &RunConfig,
) -> Result<()> {
    match name {
        "setup" => runner.setup()?,
        "recover" => {
            runner.reset()?;
            println!("[board] Recovered to a clean RF state");
        }
        "wifi_tx_24" | "wifi_rx_24" | "wifi_tx_5" | "wifi_rx_5" => {
            let band = if name.ends_with("_24") {
                Band::TwoGhz
            } else {
                Band::FiveGhz
            };
            let channel: u8 = sub
                .get_one::<String>("ch")
                .ok_or_else(|| anyhow!("missing --ch"))?
                .parse()
                .context("invalid --ch")?;
            let duration = Duration::from_secs(*sub.get_one::<u64>("duration").unwrap_or(&300));
            if name.starts_with("wifi_tx") {
                runner.wifi_tx(band, channel, duration)?;
            } else {
                runner.wifi_rx(band, channel, duration)?;
            }
        }
        "ble_tx" | "ble_rx" => {
            let channel: BleChannel = sub
                .get_one::<String>("ch")
                .ok_or_else(|| anyhow!("missing --ch"))?
                .parse()?;
            if name == "ble_tx" {
                runner.ble_tx(channel)?;
            } else {
                runner.ble_rx(channel)?;
            }
        }
        "ble_end" => runner.ble_end()?,
        "btclassic_tx" => {
            let bdaddr: BdAddr = sub
                .get_one::<String>("mac-bt")
                .ok_or_else(|| anyhow!("provide --mac-bt for the BT Classic peer BD_ADDR"))?
                .parse()?;
            runner.btclassic_tx(&bdaddr)?;
        }
        "emc_monitor" => {
            let peer = match sub.get_one::<Ipv4Addr>("peer-ip") {
                Some(ip) => *ip,
                None => config
                    .access_point
                    .default_peer()
                    .parse()
                    .context("access_point.subnet does not form a valid peer address")?,
            };
            let action: MonitorAction = sub
                .get_one::<String>("action")
                .map(String::as_str)
                .unwrap_or("start")
                .parse()?;
            log::info!("EMC monitor {action} with peer {peer}");
            runner.emc_monitor(peer, action)?;
        }
        other => return Err(anyhow!("unknown subcommand {other}")),
    }
    Ok(())
}

/// Defaults, then the config file, then CLI flags.
pub fn resolve_config(matches: &ArgMatches) -> Result<RunConfig> {
    let mut config = match matches.get_one::<String>("config") {
        Some(path) => RunConfig::from_file(Path::new(path))?,
        None => RunConfig::default(),
    };
    if let Some(port) = matches.get_one::<String>("port") {
        config.serial.port = Some(port.clone());
    }
    if let Some(baud) = matches.get_one::<u32>("baud") {
        config.serial.baud = *baud;
    }
    if let Some(user) = matches.get_one::<String>("user") {
        config.login.username = Some(user.clone());
    }
    if let Some(password) = matches.get_one::<String>("password") {
        config.login.password = Some(password.clone());
    }
    if let Some(secs) = matches.get_one::<u64>("login-timeout") {
        config.channel.login_timeout_ms = secs.saturating_mul(1000);
    }
    config.validate()?;
    Ok(config)
}

fn list_ports(want_json: bool) -> Result<()> {
    let ports = tty::available_ports_sorted();
    if want_json {
        let out: Vec<PortInfo> = ports
            .iter()
            .map(|p| {
                let usb = match &p.port_type {
                    SerialPortType::UsbPort(info) => Some(info),
                    _ => None,
                };
                PortInfo {
                    port_name: &p.port_name,
                    usb_serial: tty::is_usb_serial(p),
                    port_type: match p.port_type {
                        SerialPortType::UsbPort(_) => "usb",
                        SerialPortType::PciPort => "pci",
                        SerialPortType::BluetoothPort => "bluetooth",
                        SerialPortType::Unknown => "unknown",
                    },
                    vid: usb.map(|u| u.vid),
                    pid: usb.map(|u| u.pid),
                    serial: usb.and_then(|u| u.serial_number.as_deref()),
                    manufacturer: usb.and_then(|u| u.manufacturer.as_deref()),
                    product: usb.and_then(|u| u.product.as_deref()),
                }
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        for p in &ports {
            let marker = if tty::is_usb_serial(p) { " (usb serial)" } else { "" };
            println!("{}{marker}", p.port_name);
        }
    }
    Ok(())
}
