//! Card reader collaborator interface
//!
//! The NFC framing, PACE key agreement and APDU encoding live in an external
//! card reader library. The engine only talks to it through these traits.

use async_trait::async_trait;
use cardwall_core::{AutCertificate, Can, Pin, ResponseStatus, TransportError, VerifyPinError};

use crate::config::NfcMessages;

/// Outcome of a PIN verification reported by the card
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyPinResponse {
    Success,
    Failed(VerifyPinError),
}

/// Outcome of a signing command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawSignResponse {
    /// Raw `r || s` signature
    Signed(Vec<u8>),
    /// The card refused with this status word
    Rejected(ResponseStatus),
}

/// Opens reader sessions to a health card
#[async_trait]
pub trait CardTransport: Send + Sync {
    /// Wait for a card, establish the secure channel with `can` and return the connection
    async fn open_session(
        &self,
        can: &Can,
        messages: &NfcMessages,
    ) -> Result<Box<dyn CardConnection>, TransportError>;
}

/// Secure-channel connection to one card
///
/// Owned by exactly one signature session for its lifetime.
#[async_trait]
pub trait CardConnection: Send + Sync {
    /// Verify the card holder PIN
    async fn verify_pin(&mut self, pin: &Pin) -> Result<VerifyPinResponse, TransportError>;

    /// Read the authentication certificate and the key's declared algorithm
    async fn read_aut_certificate(&mut self) -> Result<AutCertificate, TransportError>;

    /// Sign a SHA-256 digest with the authentication key
    async fn raw_sign(&mut self, digest: &[u8]) -> Result<RawSignResponse, TransportError>;

    /// Show a status hint in the reader dialog
    fn update_alert(&self, message: &str);

    /// Tear down the reader session, showing `error` if given
    fn invalidate(&self, error: Option<&str>);
}
