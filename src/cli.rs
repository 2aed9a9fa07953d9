use clap::{value_parser, Arg, ArgAction, Command};

pub fn build_cli() -> Command {
    Command::new("factorio-gpt-relay")
        .about("Local relay between the Factorio GPT assistant mod and the OpenAI API")
        .arg(
            Arg::new("setup")
                .long("setup")
                .help("First-run setup: consent terms, API key and model entry")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("status")
                .long("status")
                .help("Print the stored configuration and exit")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("reset")
                .long("reset")
                .help("Delete the stored configuration and exit")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("host")
                .long("host")
                .num_args(1)
                .help("Listen address for this run (not persisted)"),
        )
        .arg(
            Arg::new("port")
                .long("port")
                .num_args(1)
                .value_parser(value_parser!(u16))
                .help("Listen port for this run (not persisted)"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .num_args(1)
                .help("Override RUST_LOG level (e.g., info, debug)"),
        )
        .arg(
            Arg::new("version")
                .long("version")
                .help("Print version and exit")
                .action(ArgAction::SetTrue),
        )
}

pub fn init_logging(level: Option<&str>) {
    // Respect explicit level, else default to info, allow env override via RUST_LOG
    if let Some(lvl) = level {
        std::env::set_var("RUST_LOG", lvl);
    } else if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}
