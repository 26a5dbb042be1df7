mod cli;
mod server;

use danbooru_bridge::config::Config;
use std::path::Path;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cmd = cli::build_cli();
    let matches = cmd.get_matches();
    let log_level = matches.get_one::<String>("log-level").cloned();
    let config_path = matches.get_one::<String>("config").cloned();
    let version_flag = matches.get_flag("version");
    let watch_flag = matches.get_flag("watch");

    cli::init_logging(log_level.as_deref());

    if version_flag {
        println!("danbooru-bridge {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let cfg = Config::load(config_path.as_deref().map(Path::new))?;
    if watch_flag {
        server::run_watch(cfg).await
    } else {
        server::run_stdio_server(cfg).await
    }
}
