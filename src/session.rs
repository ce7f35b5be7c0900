//! Connection handler: owns one accepted socket for its whole session.
//!
//! ```text
//! ACCEPTED -> WELCOMED -> AWAITING_COMMAND <-> DISPATCHING
//!                              |
//!                              v
//!                           CLOSED   (empty read, reset, decode error, idle)
//! ```
//!
//! Every exit path closes the socket once and releases the counter slot.

use crate::config::{Config, Framing};
use crate::counter::ConnectionCounter;
use crate::dispatcher::{welcome, Dispatcher};
use bytes::{Bytes, BytesMut};
use rand::rngs::StdRng;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Per-connection state, owned exclusively by its handler.
#[derive(Debug)]
pub struct Session {
    pub peer: SocketAddr,
    pub label: String,
    stream: TcpStream,
}

impl Session {
    pub fn new(stream: TcpStream, peer: SocketAddr, label: String) -> Self {
        Self {
            peer,
            label,
            stream,
        }
    }
}

/// Handler tuning taken from the server configuration.
#[derive(Debug, Clone, Copy)]
pub struct HandlerSettings {
    pub buffer_size: usize,
    pub framing: Framing,
    pub idle_timeout: Option<Duration>,
}

impl From<&Config> for HandlerSettings {
    fn from(config: &Config) -> Self {
        Self {
            buffer_size: config.buffer_size,
            framing: config.framing,
            idle_timeout: config.idle_timeout,
        }
    }
}

/// Why a session ended abnormally.
#[derive(Debug)]
pub enum HandlerError {
    Io(io::Error),
    Decode(std::str::Utf8Error),
    IdleTimeout(Duration),
}

impl HandlerError {
    /// Abrupt peer termination rather than a local fault.
    pub fn is_reset(&self) -> bool {
        matches!(
            self,
            HandlerError::Io(e) if matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            )
        )
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerError::Io(e) => write!(f, "I/O error: {e}"),
            HandlerError::Decode(e) => write!(f, "received invalid UTF-8: {e}"),
            HandlerError::IdleTimeout(limit) => {
                write!(f, "no command received within {}s", limit.as_secs_f64())
            }
        }
    }
}

impl std::error::Error for HandlerError {}

impl From<io::Error> for HandlerError {
    fn from(e: io::Error) -> Self {
        HandlerError::Io(e)
    }
}

/// Drives one session from accept to close.
pub struct ConnectionHandler {
    session: Session,
    counter: Arc<ConnectionCounter>,
    dispatcher: Dispatcher,
    settings: HandlerSettings,
    rng: StdRng,
}

impl ConnectionHandler {
    pub fn new(
        session: Session,
        counter: Arc<ConnectionCounter>,
        settings: HandlerSettings,
        rng: StdRng,
    ) -> Self {
        let dispatcher = Dispatcher::new(Arc::clone(&counter));
        Self {
            session,
            counter,
            dispatcher,
            settings,
            rng,
        }
    }

    /// Run the session to completion. Errors stay inside this connection.
    pub async fn run(self) {
        let ConnectionHandler {
            session,
            counter,
            dispatcher,
            settings,
            mut rng,
        } = self;
        let Session { peer, label, stream } = session;

        let slot = counter.track();
        info!(%peer, %label, active = slot.active_at_entry(), "New connection");

        let (reader, writer) = stream.into_split();
        // Both halves are consumed here, so the socket is closed when this returns.
        let result = serve(reader, writer, &label, &dispatcher, settings, &mut rng).await;

        match result {
            Ok(()) => info!(%peer, %label, "Client disconnected"),
            Err(e) if e.is_reset() => {
                info!(%peer, %label, error = %e, "Connection reset by peer")
            }
            Err(e @ HandlerError::IdleTimeout(_)) => {
                info!(%peer, %label, error = %e, "Closing idle connection")
            }
            Err(e) => warn!(%peer, %label, error = %e, "Error handling client"),
        }

        drop(slot);
        info!(%peer, %label, active = counter.current(), "Closed connection");
    }
}

/// Welcome the peer, then answer commands until it goes away.
///
/// Returns `Ok(())` on a graceful close (zero-length read).
pub async fn serve<R, W>(
    reader: R,
    mut writer: W,
    label: &str,
    dispatcher: &Dispatcher,
    settings: HandlerSettings,
    rng: &mut StdRng,
) -> Result<(), HandlerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer.write_all(welcome(label).as_bytes()).await?;
    writer.flush().await?;

    let mut commands = CommandReader::new(reader, settings.framing, settings.buffer_size);

    loop {
        let frame = match settings.idle_timeout {
            Some(limit) => tokio::time::timeout(limit, commands.next())
                .await
                .map_err(|_| HandlerError::IdleTimeout(limit))??,
            None => commands.next().await?,
        };

        let Some(frame) = frame else {
            return Ok(());
        };

        let message = std::str::from_utf8(&frame)
            .map_err(HandlerError::Decode)?
            .trim_end();
        debug!(%label, command = message, "Received command");

        let response = dispatcher.dispatch(message, rng);
        writer.write_all(response.as_bytes()).await?;
        writer.flush().await?;
        debug!(%label, response = response.trim_end(), "Sent response");
    }
}

/// Splits the inbound byte stream into commands.
struct CommandReader<R> {
    reader: BufReader<R>,
    framing: Framing,
    buffer_size: usize,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> CommandReader<R> {
    fn new(reader: R, framing: Framing, buffer_size: usize) -> Self {
        Self {
            reader: BufReader::with_capacity(buffer_size, reader),
            framing,
            buffer_size,
            buf: BytesMut::with_capacity(buffer_size),
        }
    }

    /// Next command's raw bytes, or `None` once the peer has closed.
    async fn next(&mut self) -> io::Result<Option<Bytes>> {
        match self.framing {
            Framing::Buffer => {
                // One receive is one command, however much it contains.
                self.buf.clear();
                self.buf.resize(self.buffer_size, 0);
                let n = self.reader.read(&mut self.buf[..]).await?;
                if n == 0 {
                    return Ok(None);
                }
                self.buf.truncate(n);
                Ok(Some(self.buf.split().freeze()))
            }
            Framing::Line => {
                let mut line = Vec::with_capacity(64);
                let n = (&mut self.reader)
                    .take(self.buffer_size as u64)
                    .read_until(b'\n', &mut line)
                    .await?;
                if n == 0 {
                    return Ok(None);
                }
                Ok(Some(Bytes::from(line)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use tokio_test::io::Builder;

    fn settings(framing: Framing) -> HandlerSettings {
        HandlerSettings {
            buffer_size: 1024,
            framing,
            idle_timeout: None,
        }
    }

    fn expected(dispatcher: &Dispatcher, input: &str) -> String {
        dispatcher.dispatch(input, &mut StdRng::seed_from_u64(0))
    }

    async fn serve_mock(
        mock: tokio_test::io::Mock,
        label: &str,
        dispatcher: &Dispatcher,
        framing: Framing,
    ) -> Result<(), HandlerError> {
        let (reader, writer) = tokio::io::split(mock);
        let mut rng = StdRng::seed_from_u64(0);
        serve(reader, writer, label, dispatcher, settings(framing), &mut rng).await
    }

    #[tokio::test]
    async fn test_welcome_then_commands() {
        let dispatcher = Dispatcher::new(ConnectionCounter::new());
        let mock = Builder::new()
            .write(welcome("conn-1").as_bytes())
            .read(b"help")
            .write(expected(&dispatcher, "help").as_bytes())
            .read(b"dragon\r\n")
            .write(b"[Echo from Mage's Tower] dragon\n")
            .build();
        let result = serve_mock(mock, "conn-1", &dispatcher, Framing::Buffer).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_buffer_framing_treats_receive_as_one_command() {
        let dispatcher = Dispatcher::new(ConnectionCounter::new());
        let mock = Builder::new()
            .write(welcome("conn-2").as_bytes())
            .read(b"help\nstatus\n")
            .write(b"[Echo from Mage's Tower] help\nstatus\n")
            .build();
        let result = serve_mock(mock, "conn-2", &dispatcher, Framing::Buffer).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_line_framing_splits_commands() {
        let dispatcher = Dispatcher::new(ConnectionCounter::new());
        let mock = Builder::new()
            .write(welcome("conn-3").as_bytes())
            .read(b"quit\ndragon\n")
            .write(b"Farewell, adventurer! May your journey continue...\n")
            .write(b"[Echo from Mage's Tower] dragon\n")
            .build();
        let result = serve_mock(mock, "conn-3", &dispatcher, Framing::Line).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_utf8_closes_session() {
        let dispatcher = Dispatcher::new(ConnectionCounter::new());
        let mock = Builder::new()
            .write(welcome("conn-4").as_bytes())
            .read(&[0xff, 0xfe, 0xfd])
            .build();
        let result = serve_mock(mock, "conn-4", &dispatcher, Framing::Buffer).await;
        assert!(matches!(result, Err(HandlerError::Decode(_))));
    }

    #[tokio::test]
    async fn test_reset_is_reported() {
        let dispatcher = Dispatcher::new(ConnectionCounter::new());
        let mock = Builder::new()
            .write(welcome("conn-5").as_bytes())
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let err = serve_mock(mock, "conn-5", &dispatcher, Framing::Buffer)
            .await
            .unwrap_err();
        assert!(err.is_reset());
    }

    #[test]
    fn test_error_classification() {
        let reset = HandlerError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"));
        assert!(reset.is_reset());
        let other = HandlerError::Io(io::Error::new(io::ErrorKind::Other, "boom"));
        assert!(!other.is_reset());
        assert!(!HandlerError::IdleTimeout(Duration::from_secs(1)).is_reset());
    }
}
