//! TCP listener for the tower.
//!
//! Accepts connections and hands each one to its own spawned
//! [`ConnectionHandler`]. The acceptor never waits on a handler; finished
//! handlers are reaped from the registry as the loop runs.

use crate::config::{Config, ConfigError};
use crate::counter::ConnectionCounter;
use crate::session::{ConnectionHandler, HandlerSettings, Session};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Longest pause between retries of a failing accept before giving up.
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(64);

/// Server instance
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    counter: Arc<ConnectionCounter>,
    settings: HandlerSettings,
    spell_seed: Option<u64>,
    handlers: JoinSet<()>,
    next_id: u64,
}

impl Server {
    /// Bind and listen on the configured address.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(config: &Config) -> Result<Self, ServerError> {
        let addr = config.bind_addr()?;
        let std_listener =
            create_listener(addr, config.backlog).map_err(|e| ServerError::Bind(addr, e))?;
        let listener = TcpListener::from_std(std_listener).map_err(|e| ServerError::Bind(addr, e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::Bind(addr, e))?;

        info!(address = %local_addr, backlog = config.backlog, "Server listening");

        Ok(Server {
            listener,
            local_addr,
            counter: ConnectionCounter::new(),
            settings: HandlerSettings::from(config),
            spell_seed: config.spell_seed,
            handlers: JoinSet::new(),
            next_id: 0,
        })
    }

    /// Address actually bound (useful when the configured port was 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared live-connection counter.
    pub fn counter(&self) -> Arc<ConnectionCounter> {
        Arc::clone(&self.counter)
    }

    /// Accept connections until `shutdown` resolves.
    ///
    /// The listening socket is closed before this returns. Handlers still in
    /// flight are handed back in a [`Drain`] and keep running.
    pub async fn run<F>(mut self, shutdown: F) -> Result<Drain, ServerError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut backoff = Duration::from_secs(1);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, no longer accepting connections");
                    break;
                }

                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        backoff = Duration::from_secs(1);
                        self.spawn_handler(stream, peer);
                    }
                    Err(e) if is_transient(&e) => {
                        warn!(error = %e, "Failed to accept connection");
                    }
                    Err(e) => {
                        if backoff > MAX_ACCEPT_BACKOFF {
                            error!(error = %e, "Listener unusable, giving up");
                            return Err(ServerError::Accept(e));
                        }
                        error!(error = %e, retry_in = ?backoff, "Failed to accept connection");
                        if backoff_or_shutdown(backoff, shutdown.as_mut()).await {
                            info!("Shutdown requested, no longer accepting connections");
                            break;
                        }
                        backoff *= 2;
                    }
                },

                Some(joined) = self.handlers.join_next(), if !self.handlers.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Connection handler panicked");
                    }
                }
            }
        }

        drop(self.listener);
        Ok(Drain {
            handlers: self.handlers,
        })
    }

    fn spawn_handler(&mut self, stream: tokio::net::TcpStream, peer: SocketAddr) {
        self.next_id += 1;
        let id = self.next_id;
        let label = format!("conn-{id}");
        debug!(%peer, %label, "Accepted connection");

        let rng = match self.spell_seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(id)),
            None => StdRng::from_entropy(),
        };
        let session = Session::new(stream, peer, label);
        let handler =
            ConnectionHandler::new(session, Arc::clone(&self.counter), self.settings, rng);

        self.handlers.spawn(handler.run());
    }
}

/// Handlers still running after the listener stopped.
pub struct Drain {
    handlers: JoinSet<()>,
}

impl Drain {
    /// Number of handlers not yet reaped.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Wait for every remaining handler to finish on its own.
    pub async fn wait(mut self) {
        while let Some(joined) = self.handlers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Connection handler panicked");
            }
        }
    }
}

/// Server startup and accept errors
#[derive(Debug)]
pub enum ServerError {
    Config(ConfigError),
    Bind(SocketAddr, io::Error),
    Accept(io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Config(e) => write!(f, "{e}"),
            ServerError::Bind(addr, e) => write!(f, "Failed to listen on {addr}: {e}"),
            ServerError::Accept(e) => write!(f, "Listener failed: {e}"),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<ConfigError> for ServerError {
    fn from(e: ConfigError) -> Self {
        ServerError::Config(e)
    }
}

/// Sleep for `backoff`, returning `true` early if `shutdown` resolves first.
async fn backoff_or_shutdown<F>(backoff: Duration, shutdown: Pin<&mut F>) -> bool
where
    F: Future<Output = ()>,
{
    tokio::select! {
        _ = shutdown => true,
        _ = tokio::time::sleep(backoff) => false,
    }
}

/// Errors tied to a single pending connection rather than the listener.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

fn create_listener(addr: SocketAddr, backlog: u32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_config() -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = Server::bind(&loopback_config()).unwrap();
        assert_ne!(server.local_addr().port(), 0);
        assert_eq!(server.counter().current(), 0);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let first = Server::bind(&loopback_config()).unwrap();
        let config = Config {
            port: first.local_addr().port(),
            ..loopback_config()
        };

        match Server::bind(&config) {
            Err(ServerError::Bind(addr, _)) => assert_eq!(addr.port(), config.port),
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("second bind to an active port succeeded"),
        }
    }

    #[tokio::test]
    async fn test_shutdown_closes_listener() {
        let server = Server::bind(&loopback_config()).unwrap();
        let addr = server.local_addr();

        let drain = server.run(async {}).await.unwrap();
        assert!(drain.is_empty());
        drain.wait().await;

        let refused = tokio::net::TcpStream::connect(addr).await;
        assert!(refused.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_cuts_accept_backoff_short() {
        let shutdown = async {};
        tokio::pin!(shutdown);

        let stopped = tokio::time::timeout(
            Duration::from_secs(1),
            backoff_or_shutdown(MAX_ACCEPT_BACKOFF, shutdown.as_mut()),
        )
        .await
        .expect("backoff ignored shutdown");
        assert!(stopped);
    }

    #[tokio::test]
    async fn test_backoff_elapses_without_shutdown() {
        let shutdown = std::future::pending::<()>();
        tokio::pin!(shutdown);

        assert!(!backoff_or_shutdown(Duration::from_millis(10), shutdown.as_mut()).await);
    }

    #[test]
    fn test_transient_errors() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }
}
