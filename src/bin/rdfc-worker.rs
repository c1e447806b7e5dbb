//! Worker process serving the stock processors over the runner protocol.
use clap::Parser;
use rdfc::processors::register_builtins;
use rdfc_processor::processor::ProcessorRegistry;
use rdfc_processor::runtime::{init_logging, run, serve};
use tokio::net::TcpListener;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "rdfc-worker", about = "Host rdfc stages in a separate process", version)]
struct Cli {
    /// Accept one connection on this address instead of using stdio
    #[arg(long)]
    listen: Option<String>,

    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let registry = ProcessorRegistry::new();
    register_builtins(&registry);

    match cli.listen {
        None => run(registry).await,
        Some(addr) => {
            let listener = TcpListener::bind(&addr).await?;
            info!("listening on {}", listener.local_addr()?);
            let (stream, peer) = listener.accept().await?;
            info!(%peer, "orchestrator connected");
            let (read, write) = stream.into_split();
            serve(registry, read, write).await
        }
    }
}
