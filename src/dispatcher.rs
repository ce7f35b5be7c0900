//! Command dispatch for the tower's text protocol.
//!
//! ```text
//! Request:  HELP | STATUS | SPELL | QUIT   (any case)
//! Request:  <anything else>
//! Response: one text block per request, always ending in \n
//! ```
//!
//! Dispatch does no I/O. The only shared state it reads is the
//! [`ConnectionCounter`]; randomness is supplied by the caller.

use crate::counter::ConnectionCounter;
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::Arc;

/// Prefix put in front of echoed input.
pub const ECHO_PREFIX: &str = "[Echo from Mage's Tower] ";

const HELP_TEXT: &str = "
Available commands:
- HELP: Show this help message
- STATUS: Show server status
- SPELL: Cast a random spell
- QUIT: Disconnect from server
";

const FAREWELL_TEXT: &str = "Farewell, adventurer! May your journey continue...\n";

/// Flavor lines for `SPELL`.
pub const SPELLS: [&str; 5] = [
    "Lightning Bolt strikes! ⚡",
    "Fireball erupts! 🔥",
    "Ice Shard freezes the enemy! ❄️",
    "Dark Magic overwhelms! 🌑",
    "Healing Light restores health! ✨",
];

/// Parsed client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    Help,
    Status,
    Spell,
    Quit,
    /// Anything unrecognized, echoed back verbatim.
    Echo(&'a str),
}

impl<'a> Command<'a> {
    /// Parse a command. Surrounding whitespace is ignored and keywords are
    /// case-insensitive.
    pub fn parse(input: &'a str) -> Self {
        let trimmed = input.trim();

        if trimmed.eq_ignore_ascii_case("HELP") {
            Command::Help
        } else if trimmed.eq_ignore_ascii_case("STATUS") {
            Command::Status
        } else if trimmed.eq_ignore_ascii_case("SPELL") {
            Command::Spell
        } else if trimmed.eq_ignore_ascii_case("QUIT") {
            Command::Quit
        } else {
            Command::Echo(trimmed)
        }
    }
}

/// Greeting sent once when a connection is accepted.
pub fn welcome(label: &str) -> String {
    format!(
        "Welcome, brave adventurer! You are connected to the Mage's Tower.\n\
         Your connection ID: {label}\n"
    )
}

/// Maps commands to responses.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    counter: Arc<ConnectionCounter>,
}

impl Dispatcher {
    pub fn new(counter: Arc<ConnectionCounter>) -> Self {
        Self { counter }
    }

    /// Produce the response for one raw command.
    ///
    /// `QUIT` only answers with a farewell; closing is left to the client.
    pub fn dispatch<R: Rng + ?Sized>(&self, input: &str, rng: &mut R) -> String {
        match Command::parse(input) {
            Command::Help => HELP_TEXT.to_string(),
            Command::Status => format!(
                "Server Status: Running | Active connections: {}\n",
                self.counter.current()
            ),
            Command::Spell => {
                let spell = SPELLS.choose(rng).copied().unwrap_or(SPELLS[0]);
                format!("The Mage casts: {spell}\n")
            }
            Command::Quit => FAREWELL_TEXT.to_string(),
            Command::Echo(message) => format!("{ECHO_PREFIX}{message}\n"),
        }
    }
}
