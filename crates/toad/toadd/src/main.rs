use std::{path::PathBuf, time::Duration};

use clap::Parser;
use eyre::WrapErr;
use tokio::runtime;
use toad::{Options, Server, ServerConfig, TlsFiles};
use tracing_subscriber::EnvFilter;

/// WebSocket echo server
///
/// Accepts WebSocket connections, answers every text message with
/// "You said: <message>" and echoes binary messages back unchanged.
#[derive(Parser)]
#[command(author, version)]
struct Cli {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on.
    #[arg(short, long, default_value_t = 1701)]
    port: u16,

    /// PEM certificate chain. Serves wss:// together with --key.
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,

    /// PEM private key.
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,

    /// Fire the tick event every this many milliseconds.
    #[arg(long)]
    tick_ms: Option<u64>,

    /// Largest accepted frame payload, in bytes.
    #[arg(long, default_value_t = toad::options::MAX_PAYLOAD)]
    max_payload: usize,

    /// Split outgoing messages into frames of at most this many bytes.
    #[arg(long)]
    fragment_size: Option<usize>,

    /// Ping every open client on each tick and log the round trip time.
    #[arg(long, requires = "tick_ms")]
    ping: bool,
}

fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let runtime = runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .wrap_err("building the runtime")?;
    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> eyre::Result<()> {
    let mut options = Options::default().with_max_payload(cli.max_payload);
    if let Some(size) = cli.fragment_size {
        options = options.with_fragment_size(size);
    }

    let mut config = ServerConfig::new(cli.host, cli.port).with_options(options);
    if let (Some(cert), Some(key)) = (cli.cert, cli.key) {
        config = config.with_tls(TlsFiles::new(cert, key));
    }
    if let Some(ms) = cli.tick_ms {
        config = config.with_tick(Duration::from_millis(ms));
    }

    let server: Server = Server::new(config);
    let ping = cli.ping;
    server
        .hub()
        .on_open(|client| {
            tracing::info!(id = client.id(), peer = ?client.peer_addr(), "client connected");
            None
        })
        .on_message(|target, message| {
            let client = target.client();
            let reply = match message.as_text() {
                Some(text) => client.send(format!("You said: {text}")),
                None => client.send(message.as_bytes().to_vec()),
            };
            if let Err(e) = reply {
                tracing::debug!(id = client.id(), error = %e, "reply dropped");
            }
            None
        })
        .on_error(|target, error| {
            tracing::warn!(id = target.client().id(), %error, "connection error");
        })
        .on_close(|target| {
            tracing::info!(id = target.client().id(), "client disconnected");
        })
        .on_tick(move |hub| {
            if !ping {
                return;
            }
            for client in hub.open_clients() {
                if let Some(ms) = client.last_rtt_ms() {
                    tracing::info!(id = client.id(), rtt_ms = ms, "round trip");
                }
                let _ = client.ping();
            }
        });

    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .wrap_err("serving")
}
