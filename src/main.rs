use std::sync::Arc;

use factorio_gpt_relay::config::ConfigStore;
use factorio_gpt_relay::http::Upstream;
use factorio_gpt_relay::relay::RelayService;
use factorio_gpt_relay::{cli, server, setup};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = cli::build_cli().get_matches();
    let log_level = matches.get_one::<String>("log-level").cloned();
    cli::init_logging(log_level.as_deref());

    if matches.get_flag("version") {
        println!("factorio-gpt-relay {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let store = ConfigStore::default_location()?;
    let mut config = store.load()?;
    // Runtime-only overrides; they never reach the stored file.
    if let Some(host) = matches.get_one::<String>("host") {
        config.host = host.clone();
    }
    if let Some(port) = matches.get_one::<u16>("port") {
        config.port = *port;
    }

    if matches.get_flag("reset") {
        return setup::run_reset(&store);
    }
    if matches.get_flag("setup") {
        return setup::run_setup(&store, config).await;
    }
    if matches.get_flag("status") {
        setup::run_status(&config);
        return Ok(());
    }

    let upstream = Upstream::from_env()?;
    let service = Arc::new(RelayService::new(config, store, upstream));
    server::serve(service).await
}
