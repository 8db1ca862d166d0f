//! Session-scoped diagnostics of card reading
//!
//! [`DiagnosticContext`] replaces any process-wide counter or command log:
//! one context is created per screen visit, handed to the engine and the
//! transport, and reset by the caller when a new screen instance starts.
//! Within that scope the tag-loss counter is monotonic.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::LoginError;

/// Number of bytes kept of a secure messaging APDU
pub const SECURE_MESSAGING_PREFIX_LENGTH: usize = 4;

/// CLA bits signalling secure messaging
const SECURE_MESSAGING_CLA_MASK: u8 = 0x0C;

/// Direction of a logged APDU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Command,
    Response,
}

/// One logged card command or response
///
/// Secure messaging traffic is stored truncated; the full payload never
/// enters the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEntry {
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    pub secure: bool,
    /// Hex of the logged bytes (a prefix for secure messaging)
    pub bytes: String,
    /// Length of the original message
    pub length: usize,
}

impl fmt::Display for CommandEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arrow = match self.direction {
            Direction::Command => ">>",
            Direction::Response => "<<",
        };
        if self.secure {
            write!(f, "{} {}... ({} bytes, secure messaging)", arrow, self.bytes, self.length)
        } else {
            write!(f, "{} {}", arrow, self.bytes)
        }
    }
}

/// Whether a command APDU is sent under secure messaging
pub fn is_secure_messaging(apdu: &[u8]) -> bool {
    apdu.first()
        .map(|cla| cla & SECURE_MESSAGING_CLA_MASK == SECURE_MESSAGING_CLA_MASK)
        .unwrap_or(false)
}

/// Tag-loss counter and command transcript of one screen visit
#[derive(Debug, Default)]
pub struct DiagnosticContext {
    tag_connection_lost: AtomicU32,
    last_command_secure: AtomicBool,
    commands: Mutex<Vec<CommandEntry>>,
}

impl DiagnosticContext {
    pub fn new() -> Self {
        Self::default()
    }

    fn log(&self) -> MutexGuard<'_, Vec<CommandEntry>> {
        self.commands.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Count one tag connection loss and return the new total
    pub fn record_tag_connection_lost(&self) -> u32 {
        let count = self.tag_connection_lost.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Tag connection lost ({} in this screen visit)", count);
        count
    }

    pub fn tag_connection_lost_count(&self) -> u32 {
        self.tag_connection_lost.load(Ordering::SeqCst)
    }

    /// Record an outgoing command APDU
    pub fn log_command(&self, apdu: &[u8]) {
        let secure = is_secure_messaging(apdu);
        self.last_command_secure.store(secure, Ordering::SeqCst);
        self.push(Direction::Command, secure, apdu);
    }

    /// Record a response APDU; it is treated as secure if its command was
    pub fn log_response(&self, apdu: &[u8]) {
        let secure = self.last_command_secure.load(Ordering::SeqCst);
        self.push(Direction::Response, secure, apdu);
    }

    fn push(&self, direction: Direction, secure: bool, apdu: &[u8]) {
        let logged = if secure {
            &apdu[..apdu.len().min(SECURE_MESSAGING_PREFIX_LENGTH)]
        } else {
            apdu
        };
        self.log().push(CommandEntry {
            timestamp: Utc::now(),
            direction,
            secure,
            bytes: hex::encode_upper(logged),
            length: apdu.len(),
        });
    }

    /// Snapshot of the command transcript
    pub fn commands(&self) -> Vec<CommandEntry> {
        self.log().clone()
    }

    /// Start a new screen visit
    pub fn reset(&self) {
        self.tag_connection_lost.store(0, Ordering::SeqCst);
        self.last_command_secure.store(false, Ordering::SeqCst);
        self.log().clear();
        debug!("Diagnostic context reset");
    }
}

/// Textual NFC reading report handed to the diagnostic sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticReport {
    pub timestamp: DateTime<Utc>,
    pub tag_connection_lost_count: u32,
    pub description: String,
    pub recovery_suggestion: String,
    pub raw_error: String,
    pub commands: Vec<CommandEntry>,
}

impl DiagnosticReport {
    /// Capture the current state of `context` for `error`
    pub fn build(
        error: &LoginError,
        tag_connection_lost_count: u32,
        context: &DiagnosticContext,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            tag_connection_lost_count,
            description: error.description(),
            recovery_suggestion: error.recovery_suggestion(),
            raw_error: format!("{:?}", error),
            commands: context.commands(),
        }
    }
}

impl fmt::Display for DiagnosticReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "NFC reading report")?;
        writeln!(f, "Date: {}", self.timestamp.to_rfc3339())?;
        writeln!(f, "Tag connections lost count: {}", self.tag_connection_lost_count)?;
        writeln!(f)?;
        writeln!(f, "Error: {}", self.description)?;
        writeln!(f, "Recovery suggestion: {}", self.recovery_suggestion)?;
        writeln!(f, "Raw error: {}", self.raw_error)?;
        writeln!(f)?;
        writeln!(f, "Commands ({}):", self.commands.len())?;
        for entry in &self.commands {
            writeln!(f, "{}", entry)?;
        }
        Ok(())
    }
}
