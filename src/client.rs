//! Client for the tower.
//!
//! Connects, consumes the welcome message with a single read, then either
//! sends one message or runs an interactive request/response loop. Every
//! request gets exactly one read for its response.

use bytes::BytesMut;
use clap::{ArgGroup, Parser};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Command-line arguments for the client
#[derive(Parser, Debug, Clone)]
#[command(name = "mage-client")]
#[command(author = "mage-tower authors")]
#[command(version = "0.1.0")]
#[command(about = "Client for the Mage's Tower server", long_about = None)]
#[command(group(ArgGroup::new("mode").required(true).args(["message", "interactive"])))]
pub struct ClientConfig {
    /// Server hostname or IP address
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    pub host: String,

    /// Server port number
    #[arg(short, long, default_value_t = 9999)]
    pub port: u16,

    /// Message to send to the server
    #[arg(short, long, value_parser = clap::builder::NonEmptyStringValueParser::new())]
    pub message: Option<String>,

    /// Run in interactive mode (send multiple messages)
    #[arg(short, long)]
    pub interactive: bool,

    /// Seconds to wait for the connection to be established
    #[arg(short = 't', long = "timeout", default_value_t = 10)]
    pub connect_timeout: u64,

    /// Maximum bytes read from the server in one receive
    #[arg(short = 'b', long, default_value_t = 1024)]
    pub buffer_size: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    pub log_level: String,
}

/// What the client does once connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Single(String),
    Interactive,
}

impl ClientConfig {
    pub fn mode(&self) -> Mode {
        match &self.message {
            Some(message) if !self.interactive => Mode::Single(message.clone()),
            _ => Mode::Interactive,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Client-side failures
#[derive(Debug)]
pub enum ClientError {
    Refused { addr: String },
    Timeout { addr: String, after: Duration },
    Connect { addr: String, source: io::Error },
    Io(io::Error),
    Decode(std::str::Utf8Error),
    ServerClosed,
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Refused { addr } => {
                write!(f, "Connection refused - is the server running on {addr}?")
            }
            ClientError::Timeout { addr, after } => write!(
                f,
                "Connection to {addr} timed out after {}s - server not responding",
                after.as_secs()
            ),
            ClientError::Connect { addr, source } => {
                write!(f, "Could not connect to {addr}: {source}")
            }
            ClientError::Io(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                write!(f, "Connection broken - server may have closed: {e}")
            }
            ClientError::Io(e) => write!(f, "Error during communication: {e}"),
            ClientError::Decode(e) => write!(f, "Server sent invalid UTF-8: {e}"),
            ClientError::ServerClosed => write!(f, "Server closed the connection"),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Connect { source, .. } | ClientError::Io(source) => Some(source),
            ClientError::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> Self {
        ClientError::Io(e)
    }
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Single message sent and its response printed.
    Answered,
    /// Operator typed `quit`.
    Quit,
    /// Server closed the connection.
    ServerClosed,
    /// Operator input reached end-of-file.
    EndOfInput,
    /// Interrupt signal received.
    Interrupted,
}

/// An open connection to the server.
pub struct Client {
    stream: TcpStream,
    peer: SocketAddr,
    buf: BytesMut,
    buffer_size: usize,
}

impl Client {
    /// Connect once; no retries.
    pub async fn connect(config: &ClientConfig) -> Result<Self, ClientError> {
        let addr = config.addr();
        let after = Duration::from_secs(config.connect_timeout);
        info!(%addr, "Connecting");

        let stream = match tokio::time::timeout(after, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
                return Err(ClientError::Refused { addr })
            }
            Ok(Err(e)) if e.kind() == io::ErrorKind::TimedOut => {
                return Err(ClientError::Timeout { addr, after })
            }
            Ok(Err(source)) => return Err(ClientError::Connect { addr, source }),
            Err(_) => return Err(ClientError::Timeout { addr, after }),
        };

        let peer = stream.peer_addr()?;
        info!(%peer, "Connected");

        Ok(Client {
            stream,
            peer,
            buf: BytesMut::with_capacity(config.buffer_size),
            buffer_size: config.buffer_size.max(1),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// One receive, decoded. `None` means the server closed the connection.
    pub async fn receive(&mut self) -> Result<Option<String>, ClientError> {
        self.buf.clear();
        self.buf.resize(self.buffer_size, 0);
        let n = self.stream.read(&mut self.buf[..]).await?;
        if n == 0 {
            debug!(peer = %self.peer, "Server closed the connection");
            return Ok(None);
        }

        let text = std::str::from_utf8(&self.buf[..n]).map_err(ClientError::Decode)?;
        Ok(Some(text.to_string()))
    }

    /// Read the greeting the server sends on connect.
    pub async fn read_welcome(&mut self) -> Result<Option<String>, ClientError> {
        self.receive().await
    }

    /// Send one message and read its response.
    pub async fn request(&mut self, message: &str) -> Result<Option<String>, ClientError> {
        debug!(peer = %self.peer, request = message, "Sending");
        let mut line = String::with_capacity(message.len() + 1);
        line.push_str(message);
        line.push('\n');
        self.stream.write_all(line.as_bytes()).await?;
        self.receive().await
    }

    /// Close the connection; failures here are only logged.
    pub async fn close(mut self) {
        if let Err(e) = self.stream.shutdown().await {
            debug!(peer = %self.peer, error = %e, "Shutdown failed");
        }
        info!(peer = %self.peer, "Connection closed");
    }
}

/// Print the welcome, then run `mode` until it finishes or `interrupt`
/// resolves. The interrupt is watched from the first read onwards.
pub async fn run_session<I, W, F>(
    client: &mut Client,
    mode: Mode,
    input: I,
    out: &mut W,
    interrupt: F,
) -> Result<SessionEnd, ClientError>
where
    I: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    F: Future<Output = ()>,
{
    tokio::pin!(interrupt);

    let welcome = tokio::select! {
        biased;
        _ = &mut interrupt => return Ok(SessionEnd::Interrupted),
        welcome = client.read_welcome() => welcome?,
    };
    if let Some(welcome) = welcome {
        display(out, &welcome).await?;
    }

    match mode {
        Mode::Single(message) => tokio::select! {
            biased;
            _ = &mut interrupt => Ok(SessionEnd::Interrupted),
            sent = run_single(client, &message, out) => sent.map(|()| SessionEnd::Answered),
        },
        Mode::Interactive => run_interactive(client, input, out, interrupt).await,
    }
}

/// Send `message`, print the response to `out`.
pub async fn run_single<W>(client: &mut Client, message: &str, out: &mut W) -> Result<(), ClientError>
where
    W: AsyncWrite + Unpin,
{
    match client.request(message).await? {
        Some(response) => {
            display(out, &response).await?;
            Ok(())
        }
        None => Err(ClientError::ServerClosed),
    }
}

/// Read operator lines from `input` and exchange them with the server
/// until `quit`, server close, end of input, or `interrupt` resolves.
///
/// Blank lines are never sent.
pub async fn run_interactive<I, W, F>(
    client: &mut Client,
    input: I,
    out: &mut W,
    interrupt: F,
) -> Result<SessionEnd, ClientError>
where
    I: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    F: Future<Output = ()>,
{
    tokio::pin!(interrupt);
    let mut lines = input.lines();

    out.write_all(b"Type your messages and press Enter. Type 'quit' to disconnect.\n")
        .await?;

    loop {
        out.write_all(b"[You] > ").await?;
        out.flush().await?;

        let line = tokio::select! {
            biased;
            _ = &mut interrupt => return Ok(SessionEnd::Interrupted),
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            return Ok(SessionEnd::EndOfInput);
        };

        let message = line.trim();
        if message.is_empty() {
            continue;
        }

        let response = tokio::select! {
            biased;
            _ = &mut interrupt => return Ok(SessionEnd::Interrupted),
            response = client.request(message) => response?,
        };
        let Some(response) = response else {
            return Ok(SessionEnd::ServerClosed);
        };
        display(out, &response).await?;

        if message.to_lowercase() == "quit" {
            return Ok(SessionEnd::Quit);
        }
    }
}

/// Print one server message, making sure it ends on its own line.
pub async fn display<W>(out: &mut W, text: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    out.write_all(text.as_bytes()).await?;
    if !text.ends_with('\n') {
        out.write_all(b"\n").await?;
    }
    out.flush().await
}
