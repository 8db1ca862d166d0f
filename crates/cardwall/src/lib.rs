//! Cardwall - Health card authentication engine
//!
//! This crate provides:
//! - Collaborator traits for the NFC card reader and the identity provider
//! - Signature sessions over a health card, a virtual card or a device key
//! - The card authentication engine driving one attempt with guaranteed teardown
//! - Identity exchange of signed challenges for tokens
//! - Biometric pairing with device-bound keys
//! - The login flow with per-profile cancellation of stale requests
//!
//! # Optional Features
//!
//! - `mock` - Mock card, transport, identity provider and key store

pub mod biometric;
pub mod config;
pub mod enclave;
pub mod engine;
pub mod error;
pub mod idp;
pub mod login;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod session;
pub mod signer;
pub mod transport;
pub mod virtual_card;

pub use biometric::{BiometricSignatureSession, BiometricSigner};
pub use config::{EngineConfig, NfcMessages, SignerMode};
pub use enclave::{
    CertificateStore, DeviceRegistration, MemoryCertificateStore, SecureEnclave, SoftwareEnclave,
};
pub use engine::{AuthState, CardAuthEngine};
pub use error::{CardwallError, Result};
pub use idp::{IdTokenValidator, IdentityExchange, IdpClient};
pub use login::{CanStore, ChallengeRequests, LoginFlow, LoginOutput, Stage};
pub use session::{CardSessionOpener, CardSignatureSession};
pub use signer::{session_opener, RegistrationDataProvider, SessionOpener, SignatureSession};
pub use transport::{CardConnection, CardTransport, RawSignResponse, VerifyPinResponse};
pub use virtual_card::{SoftwareKey, VirtualCard, VirtualSignatureSession};
