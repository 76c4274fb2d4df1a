use std::{future::Future, net::SocketAddr, time::Duration};

use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    Result, close::CloseCode, connection::CLOSE_TIMEOUT, hub::Hub, options::Options,
    stream::MaybeTlsStream, tick, tls::TlsFiles,
};

/// Pause after a failed `accept`, so a persistent failure (for example
/// running out of file descriptors) does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Where and how a [`Server`] listens.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Serve `wss://` with this certificate and key.
    pub tls: Option<TlsFiles>,
    /// Fire the `tick` event with this period.
    pub tick: Option<Duration>,
    pub options: Options,
}

impl ServerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls: None,
            tick: None,
            options: Options::default(),
        }
    }

    #[must_use]
    pub fn with_tls(self, tls: TlsFiles) -> Self {
        Self {
            tls: Some(tls),
            ..self
        }
    }

    #[must_use]
    pub fn with_tick(self, period: Duration) -> Self {
        Self {
            tick: Some(period),
            ..self
        }
    }

    #[must_use]
    pub fn with_options(self, options: Options) -> Self {
        Self { options, ..self }
    }
}

/// Accepts connections and hands each one to its own task.
///
/// A connection failing, in the TLS handshake or later, only ever affects
/// that connection. The tick task runs alongside the accept loop for as long
/// as the server serves.
pub struct Server<S = ()> {
    config: ServerConfig,
    hub: Hub<S>,
}

impl<S: Send + Sync + 'static> Server<S> {
    pub fn new(config: ServerConfig) -> Self {
        let hub = Hub::new(config.options.clone());
        Self { config, hub }
    }

    /// The hub to register handlers on.
    pub fn hub(&self) -> &Hub<S> {
        &self.hub
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Binds to the configured address and serves forever.
    pub async fn run(&self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Binds to the configured address and serves until `shutdown` resolves.
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        self.serve(listener, shutdown).await
    }

    /// Serves an already bound listener until `shutdown` resolves, then
    /// closes every open client with status 1001.
    ///
    /// Returns once every connection task finished, or after the close
    /// timeout, so the close frames are on the wire before the caller drops
    /// its runtime.
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        let acceptor = self
            .config
            .tls
            .as_ref()
            .map(TlsFiles::acceptor)
            .transpose()?;

        let stop = CancellationToken::new();
        let _stop_on_exit = stop.clone().drop_guard();
        if let Some(period) = self.config.tick {
            let hub = self.hub.clone();
            tokio::spawn(tick::run(period, stop.clone(), move || hub.tick()));
        }

        let addr = listener.local_addr()?;
        tracing::info!(%addr, tls = acceptor.is_some(), "listening");

        let connections = TaskTracker::new();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        self.spawn_connection(&connections, stream, peer, acceptor.clone())
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        tracing::info!("shutting down");
        for client in self.hub.open_clients() {
            client.close_with(CloseCode::Away);
        }
        connections.close();
        if tokio::time::timeout(CLOSE_TIMEOUT, connections.wait()).await.is_err() {
            tracing::warn!(remaining = connections.len(), "connections did not close in time");
        }
        Ok(())
    }

    fn spawn_connection(
        &self,
        connections: &TaskTracker,
        stream: TcpStream,
        peer: SocketAddr,
        acceptor: Option<TlsAcceptor>,
    ) {
        if let Err(e) = stream.set_nodelay(self.config.options.no_delay) {
            tracing::debug!(%peer, error = %e, "failed to set TCP_NODELAY");
        }

        let hub = self.hub.clone();
        connections.spawn(async move {
            let stream = match acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(stream) => MaybeTlsStream::Tls(stream),
                    Err(e) => {
                        tracing::warn!(%peer, error = %e, "tls handshake failed");
                        return;
                    }
                },
                None => MaybeTlsStream::Plain(stream),
            };
            hub.handle(stream, Some(peer)).await;
        });
    }
}
