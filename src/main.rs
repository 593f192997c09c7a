use pirf::{boot, cli};

fn main() {
    let matches = cli::parse_args();
    let log_file = matches
        .subcommand()
        .and_then(|(_, sub)| sub.get_one::<String>("log-file"))
        .or_else(|| matches.get_one::<String>("log-file"));
    boot::init_logger(log_file.map(String::as_str));
    cli::cleanup::install_interrupt_handler();

    if let Err(err) = cli::actions::run(&matches) {
        log::error!("{err:#}");
        eprintln!("Error: {err:#}");
        cli::cleanup::run_cleanups();
        std::process::exit(1);
    }
}
