use clap::{Arg, ArgAction, Command};

pub fn build_cli() -> Command {
    Command::new("danbooru-bridge")
        .about("Danbooru client and subscription dispatcher (stdio JSON-RPC)")
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .num_args(1)
                .help("Override RUST_LOG level (e.g., info, debug)"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .num_args(1)
                .help("Path to a JSON config file (default: $DANBOORU_CONFIG)"),
        )
        .arg(
            Arg::new("watch")
                .long("watch")
                .help("Run the subscription dispatcher and print deliveries as JSON lines")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("version")
                .long("version")
                .help("Print version and exit")
                .action(ArgAction::SetTrue),
        )
}

pub fn init_logging(level: Option<&str>) {
    // Explicit level wins over RUST_LOG; default info. Logs go to stderr.
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(lvl) = level {
        builder.parse_filters(lvl);
    }
    builder.init();
}
