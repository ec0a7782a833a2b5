//! CLI shim (§1 "CLI launcher... out of scope" — this file is intentionally
//! thin: parse the one positional argument and one flag the spec keeps in
//! scope, then hand off to the library crate for everything else).

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use local_traffic::{config, server::Server, state::State};

#[derive(Parser, Debug)]
#[command(name = "local-traffic", about = "A reverse proxy for local development")]
struct Cli {
    /// Path to the JSON config file. Defaults to $LOCAL_TRAFFIC_CONFIG or
    /// $HOME/.local-traffic.json (§4.1).
    config_path: Option<PathBuf>,

    /// Run the built-in self-exercise scenario instead of serving traffic.
    #[arg(long)]
    crash_test: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crash_test {
        return run_crash_test().await;
    }

    let config_path = cli.config_path.unwrap_or_else(config::default_config_path);
    let configuration = config::load(&config_path, true).await;
    let state = State::new(configuration)?;

    let watch_state = state.clone();
    let _watcher = config::watch(config_path.clone(), Duration::from_millis(250), move |new_config| {
        let state = watch_state.clone();
        tokio::spawn(async move {
            if let Err(e) = state
                .update(local_traffic::state::ConfigPatch { new_config })
                .await
            {
                tracing::warn!(error = %e, "failed to apply reloaded config");
            } else {
                tracing::info!("configuration reloaded");
            }
        });
    });

    let bind_host: std::net::IpAddr = "127.0.0.1".parse()?;
    tracing::info!(%bind_host, "starting local-traffic");

    let server = Server::new(state, config_path);
    server.run(bind_host).await
}

/// §1's "CLI launcher... represented only as a stub": a lightweight sanity
/// pass over the pieces that don't need a live socket — config
/// normalization, mapping compilation, and a URL-rewrite round trip — so a
/// bad build fails fast without requiring an actual downstream to proxy to.
async fn run_crash_test() -> anyhow::Result<()> {
    use local_traffic::config::{normalize, Configuration};
    use local_traffic::mapping;

    let configuration = normalize(Configuration::default());
    let routes = mapping::compile(&configuration)?;
    let matched = mapping::determine_mapping(&routes, "/config/")
        .ok_or_else(|| anyhow::anyhow!("crash-test: default mapping did not resolve /config/"))?;
    anyhow::ensure!(matched.target == "config://", "crash-test: unexpected target {}", matched.target);

    println!("crash-test: OK ({} routes compiled)", routes.len());
    Ok(())
}
