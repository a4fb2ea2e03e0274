//! hoardd daemon entry point

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use proto::NamedCacheServer;

use hoardd::{build_resolver, CacheProxy, ProxyConfig};

#[derive(Parser, Debug)]
#[command(name = "hoardd", about = "gRPC access proxy for the hoard cache grid")]
struct Args {
  /// Path to a JSON configuration file
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Override the configured listen address
  #[arg(short, long)]
  listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    )
    .init();

  let args = Args::parse();
  let mut config = ProxyConfig::load(args.config.as_deref())?;
  if let Some(listen) = args.listen {
    config.listen_addr = listen;
  }

  let addr: SocketAddr = config
    .listen_addr
    .parse()
    .map_err(|e| anyhow::anyhow!("invalid listen address '{}': {}", config.listen_addr, e))?;

  let resolver = build_resolver(&config);
  let proxy = CacheProxy::new(resolver, config.clone())?;

  tracing::info!(
    "hoardd listening on {} ({} workers, {} partitions, {} members)",
    addr,
    config.worker_threads,
    config.partitions,
    config.members
  );

  tonic::transport::Server::builder()
    .add_service(NamedCacheServer::new(proxy))
    .serve_with_shutdown(addr, async {
      let _ = tokio::signal::ctrl_c().await;
      tracing::info!("hoardd shutting down");
    })
    .await?;

  Ok(())
}
