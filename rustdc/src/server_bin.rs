use std::env;
use std::error::Error;

use datacapsule::server::run_server;
use datacapsule::shared::config::ServerConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};
    // Configure a `tracing` subscriber that logs traces emitted by the
    // server.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("server=info".parse()?)
                .add_directive("datacapsule=info".parse()?),
        )
        .with_span_events(FmtSpan::FULL)
        .init();

    let args: Vec<String> = env::args().collect();
    let config = match args.len() {
        1 => ServerConfig::default(),
        2 => ServerConfig::from_json(&tokio::fs::read_to_string(&args[1]).await?)?,
        4 => ServerConfig::new(args[1].clone(), args[2].clone(), args[3].clone()),
        _ => {
            println!("usage: server [config.json | addr db pk]");
            return Ok(());
        }
    };

    run_server(config).await
}
