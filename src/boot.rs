use chrono::Local;
use log::LevelFilter;
use std::io::{self, Write};

use env_logger::{Builder, Target};

/// Install the global logger.
///
/// Logs go to stderr at `info` unless a log file is given (argument first, then
/// `PIRF_LOG_FILE`), in which case they go to that file at `debug`. `RUST_LOG`
/// overrides the level either way.
pub fn init_logger(log_file: Option<&str>) {
    let log_file = log_file
        .map(str::to_string)
        .or_else(|| std::env::var("PIRF_LOG_FILE").ok());

    if let Some(path) = log_file {
        if let Err(err) = init_file_logger(&path) {
            eprintln!("Failed to initialize file logger at '{path}': {err}");
            init_stderr_logger();
        }
    } else {
        init_stderr_logger();
    }
}

fn init_stderr_logger() {
    let _ = Builder::new()
        .filter_level(LevelFilter::Info)
        .target(Target::Stderr)
        .parse_default_env()
        .try_init();
}

fn init_file_logger(path: &str) -> io::Result<()> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;

    let mut builder = Builder::new();
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{}:{} {} [{}] - {}",
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.args()
            )
        })
        .target(Target::Pipe(Box::new(file)))
        .filter_level(LevelFilter::Debug)
        .parse_default_env()
        .try_init()
        .map_err(io::Error::other)?;

    log::info!("File logger initialized at {path}");

    Ok(())
}
