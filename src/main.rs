use std::path::PathBuf;

use clap::Parser;
use gatehouse::config::Config;
use gatehouse::proxy::Dispatcher;
use gatehouse::server::Server;
use tracing_subscriber::EnvFilter;

/// Path-prefix reverse proxy with Basic auth and header rewriting.
#[derive(Debug, Parser)]
#[command(name = "gatehouse", version)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "GATEHOUSE_CONFIG", default_value = "gatehouse.yaml")]
    config: PathBuf,

    /// Validate configuration and credentials, then exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_level(true)
        .init();

    let cli = Cli::parse();

    let cfg = Config::load(&cli.config)?;
    let dispatcher = Dispatcher::from_config(&cfg)?;

    if cli.check {
        for route in dispatcher.routes().routes() {
            let auth = match route.auth.realm() {
                Some(realm) => format!("basic realm={:?}", realm),
                None => "none".to_string(),
            };
            println!("{} -> {} (auth: {})", route.prefix, route.upstream, auth);
        }
        println!(
            "configuration ok: {} routes, {} credentials",
            dispatcher.routes().len(),
            dispatcher.credentials().len()
        );
        return Ok(());
    }

    let server = Server::bind(&cfg.server, dispatcher).await?;

    server
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
}
