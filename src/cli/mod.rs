pub mod actions;
pub mod cleanup;
pub mod config;

use clap::{Arg, ArgAction, ArgMatches, Command};

/// Parse command line arguments and return ArgMatches.
pub fn parse_args() -> ArgMatches {
    build_command().get_matches()
}

pub fn build_command() -> Command {
    Command::new("pirf")
        .about("Drive RF compliance test scenarios on a Raspberry Pi over its serial console")
        .version(env!("CARGO_PKG_VERSION"))
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("port")
                .long("port")
                .help("Serial device; auto-detected when exactly one USB serial port is present")
                .value_name("DEV")
                .global(true),
        )
        .arg(
            Arg::new("baud")
                .long("baud")
                .help("Serial baud rate [default: 115200]")
                .value_name("N")
                .value_parser(clap::value_parser!(u32))
                .global(true),
        )
        .arg(
            Arg::new("user")
                .long("user")
                .help("Login name, used when the console shows a login prompt")
                .value_name("USER")
                .global(true),
        )
        .arg(
            Arg::new("password")
                .long("password")
                .help("Login password")
                .value_name("PASS")
                .global(true),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .help("TOML config file; CLI flags take precedence over it")
                .value_name("FILE")
                .global(true),
        )
        .arg(
            Arg::new("log-file")
                .long("log-file")
                .help("Write debug logs to FILE (also via PIRF_LOG_FILE)")
                .value_name("FILE")
                .global(true),
        )
        .arg(
            Arg::new("login-timeout")
                .long("login-timeout")
                .help("Seconds to wait for the shell after sending the password [default: 20]")
                .value_name("SECS")
                .value_parser(clap::value_parser!(u64))
                .global(true),
        )
        .subcommand(
            Command::new("list-ports")
                .about("List serial ports and whether they look like USB serial adapters")
                .arg(
                    Arg::new("json")
                        .long("json")
                        .short('j')
                        .help("Output in JSON format")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(Command::new("setup").about("Install board packages and test tooling"))
        .subcommand(Command::new("recover").about("Reset the board to a clean RF state"))
        .subcommand(wifi_command("wifi_tx_24", "Board transmits on 2.4 GHz", &["1", "13"], "1"))
        .subcommand(wifi_command("wifi_rx_24", "Board receives on 2.4 GHz", &["1", "13"], "13"))
        .subcommand(wifi_command("wifi_tx_5", "Board transmits on 5 GHz", &["36", "149"], "36"))
        .subcommand(wifi_command("wifi_rx_5", "Board receives on 5 GHz", &["36", "149"], "149"))
        .subcommand(ble_command("ble_tx", "Start a BLE LE transmitter test", "low"))
        .subcommand(ble_command("ble_rx", "Start a BLE LE receiver test", "high"))
        .subcommand(Command::new("ble_end").about("End the running BLE test and print counters"))
        .subcommand(
            Command::new("btclassic_tx")
                .about("Flood a BT Classic peer with l2ping")
                .arg(
                    Arg::new("mac-bt")
                        .long("mac-bt")
                        .help("Peer BD_ADDR, XX:XX:XX:XX:XX:XX")
                        .value_name("ADDR")
                        .required(true),
                ),
        )
        .subcommand(
            Command::new("emc_monitor")
                .about("Start or stop the board-side EMC link monitor")
                .arg(
                    Arg::new("peer-ip")
                        .long("peer-ip")
                        .help("Address to ping [default: <subnet>.10]")
                        .value_name("IP")
                        .value_parser(clap::value_parser!(std::net::Ipv4Addr)),
                )
                .arg(
                    Arg::new("action")
                        .long("action")
                        .value_parser(["start", "stop"])
                        .default_value("start"),
                ),
        )
}

fn wifi_command(
    name: &'static str,
    about: &'static str,
    channels: &'static [&'static str],
    default_channel: &'static str,
) -> Command {
    Command::new(name)
        .about(about)
        .arg(
            Arg::new("ch")
                .long("ch")
                .help("Wi-Fi channel")
                .value_parser(clap::builder::PossibleValuesParser::new(channels.iter().copied()))
                .default_value(default_channel),
        )
        .arg(
            Arg::new("duration")
                .long("duration")
                .help("Traffic duration in seconds")
                .value_name("SECS")
                .value_parser(clap::value_parser!(u64))
                .default_value("300"),
        )
}

fn ble_command(name: &'static str, about: &'static str, default_channel: &'static str) -> Command {
    Command::new(name).about(about).arg(
        Arg::new("ch")
            .long("ch")
            .help("BLE channel: low (0) or high (39)")
            .value_parser(["low", "high"])
            .default_value(default_channel),
    )
}
