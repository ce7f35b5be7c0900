//! mage-tower: a concurrent text command server and its client.
//!
//! Features:
//! - One spawned task per accepted connection, sharing a locked live-connection counter
//! - Case-insensitive `HELP`, `STATUS`, `SPELL`, `QUIT` commands, echo for anything else
//! - Whole-receive or newline framing, optional idle timeout
//! - Graceful drain of in-flight connections on shutdown
//! - Single-message and interactive client modes
//! - Configuration via CLI arguments or TOML file

pub mod client;
pub mod config;
pub mod counter;
pub mod dispatcher;
pub mod logging;
pub mod server;
pub mod session;
