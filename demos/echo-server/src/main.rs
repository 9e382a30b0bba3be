//! Development backend for Tether clients.
//!
//! Speaks the session socket protocol on any path: acknowledges each user
//! message, shows a typing indicator and streams back an echo. A message of the
//! form `/fail CODE` is answered with an `error` frame carrying that code, to
//! exercise client recovery.
//!
//!   cargo run -p tether-echo-server -- --port 8000
//!   tether --server http://localhost:8000

mod server;

use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tether-echo-server")]
#[command(about = "Echo backend for trying out Tether clients")]
struct Args {
    /// Address to bind
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    host: IpAddr,

    /// Port to listen on
    #[arg(short, long, default_value_t = 8000)]
    port: u16,

    /// Pause between streamed reply chunks, in milliseconds
    #[arg(long, default_value_t = 80)]
    chunk_delay_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("tether_echo_server=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let addr = SocketAddr::new(args.host, args.port);
    server::run(addr, args.chunk_delay_ms).await
}
