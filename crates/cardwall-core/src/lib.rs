//! Cardwall Core - Shared types, error taxonomy and recovery policy
//!
//! This crate provides the synchronous foundation of the health card
//! authentication flow:
//! - Value types for challenges, signed challenges and tokens
//! - The authentication certificate and its curve gate
//! - Compact JWS assembly for challenge and pairing signatures
//! - The layered error taxonomy of card, PIN, signing and identity failures
//! - The recovery policy mapping every failure to one user action
//! - The session-scoped diagnostic context and NFC reading report
//!
//! # Optional Features
//!
//! - `mock` - Certificate fixtures for tests and simulators

pub mod certificate;
pub mod diagnostics;
pub mod error;
pub mod jws;
pub mod pairing;
pub mod recovery;
pub mod types;

pub use certificate::{ApprovedCertificate, AutCertificate, CardAlgorithm, BRAINPOOL_P256R1};
pub use diagnostics::{CommandEntry, DiagnosticContext, DiagnosticReport, Direction};
pub use error::{
    CardAuthError, Error, IdpError, InputError, LoginError, NfcError, ProfileValidationError,
    ResponseStatus, Result, SecureEnclaveError, SigningError, TransportError, UnspecifiedCause,
    VerifyPinError,
};
pub use jws::{JwsAlgorithm, JwsHeader, JwsSigningInput};
pub use pairing::{
    AuthenticationData, DeviceInformation, DeviceType, PairingData, PairingSession, RegistrationData,
    SignedAuthenticationData,
};
pub use recovery::{classify, Recovery, RecoveryAction, RecoveryPolicy};
pub use types::{
    Can, ChallengeSession, ExchangeToken, IdpToken, Pin, ProfileId, SignedChallenge,
};

/// Number of tag connection losses per screen visit that are offered a plain retry
pub const TAG_LOSS_RETRY_LIMIT: u32 = 3;

/// Length of the card access number
pub const CAN_LENGTH: usize = 6;

/// Minimum PIN length (format 2 PIN block)
pub const MIN_PIN_LENGTH: usize = 4;

/// Maximum PIN length (format 2 PIN block)
pub const MAX_PIN_LENGTH: usize = 12;

/// Length of the temporary key identifier of a pairing session
pub const KEY_IDENTIFIER_LENGTH: usize = 32;
