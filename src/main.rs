use clap::{Arg, Command};
use tokio::net::TcpListener;
use tracing::info;

use uproxy::cache::DiskCache;
use uproxy::server::Proxy;
use uproxy::upstream::Connector;
use uproxy::{BLOCKLIST_PATH, CACHE_DIR};

fn parse_args() -> (u16, u64) {
    let matches = Command::new("uproxy")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Forwarding HTTP/1.x proxy with an on-disk response cache")
        .arg(
            Arg::new("port")
                .help("Port to listen on")
                .required(true)
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("ttl")
                .help("Seconds a cached response stays valid; 0 disables caching")
                .required(true)
                .value_parser(clap::value_parser!(u64)),
        )
        .get_matches();

    let port = *matches.get_one::<u16>("port").unwrap();
    let ttl = *matches.get_one::<u64>("ttl").unwrap();
    (port, ttl)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (port, ttl) = parse_args();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("uproxy=info".parse()?),
        )
        .init();

    let cache = DiskCache::open(CACHE_DIR, ttl)?;
    let connector = Connector::new(BLOCKLIST_PATH);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;

    info!("uproxy listening on port {port}");
    if ttl == 0 {
        info!("caching disabled (ttl 0)");
    } else {
        info!("cache ttl {ttl}s, entries under {CACHE_DIR}");
    }

    tokio::spawn(cache.clone().run_sweeper());

    let proxy = Proxy::new(cache, connector);

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        _ = sigint.recv() => info!("received SIGINT, shutting down"),
        _ = proxy.serve(listener) => {}
    }

    Ok(())
}
