use clap::Parser;
use dioscuri_proxy::{DEFAULT_CHUNK_SIZE, EgressProxy, IngressProxy, MemStore};
use n0_error::{Result, StdResultExt};
use tokio::net::TcpListener;
use tracing::info;
use url::Url;

#[derive(Parser)]
#[command(name = "dioscuri", about = "Two-hop obfuscating HTTP tunnel")]
enum Cli {
    /// Run the egress agent (reconstructs requests and talks to the real
    /// upstream targets).
    Egress {
        /// Address to listen on for tunnel calls.
        #[clap(short, long, default_value = "0.0.0.0:8000", env = "DIOSCURI_BIND")]
        bind: String,
        /// Shared master key, must match the ingress agent.
        #[clap(long, env = "DIOSCURI_MASTER_KEY")]
        master_key: String,
        /// Plaintext bytes per tunnel frame.
        #[clap(long, default_value_t = DEFAULT_CHUNK_SIZE, env = "DIOSCURI_CHUNK_SIZE")]
        chunk_size: usize,
    },
    /// Run the ingress agent (accepts caller requests and drives the tunnel).
    Ingress {
        /// Address to listen on for caller requests.
        #[clap(short, long, default_value = "0.0.0.0:8001", env = "DIOSCURI_BIND")]
        bind: String,
        /// Shared master key, must match the egress agent.
        #[clap(long, env = "DIOSCURI_MASTER_KEY")]
        master_key: String,
        /// Base URL of the egress agent.
        #[clap(long, env = "DIOSCURI_EGRESS_URL")]
        egress_url: String,
        /// Plaintext bytes per tunnel frame.
        #[clap(long, default_value_t = DEFAULT_CHUNK_SIZE, env = "DIOSCURI_CHUNK_SIZE")]
        chunk_size: usize,
        /// Rewrite all inbound request targets onto this base URL instead of
        /// deriving the target from the request.
        #[clap(long, env = "DIOSCURI_TARGET_URL")]
        target_url: Option<Url>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    match Cli::parse() {
        Cli::Egress {
            bind,
            master_key,
            chunk_size,
        } => {
            let listener = TcpListener::bind(&bind).await.anyerr()?;
            info!(%bind, "egress agent listening");
            EgressProxy::new(MemStore::new(), &master_key)
                .with_chunk_size(chunk_size)
                .serve(listener)
                .await
        }
        Cli::Ingress {
            bind,
            master_key,
            egress_url,
            chunk_size,
            target_url,
        } => {
            let listener = TcpListener::bind(&bind).await.anyerr()?;
            info!(%bind, %egress_url, "ingress agent listening");
            let mut proxy =
                IngressProxy::new(egress_url, &master_key).with_chunk_size(chunk_size);
            if let Some(target_url) = target_url {
                proxy = proxy.with_target_base(target_url);
            }
            proxy.serve(listener).await
        }
    }
}
