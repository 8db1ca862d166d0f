//! Signature session capability
//!
//! The physical card, the virtual card and the device key all expose the
//! same [`SignatureSession`] contract. Callers above it never learn which
//! implementation is active; [`session_opener`] picks one from the
//! configuration.

use std::sync::Arc;

use async_trait::async_trait;
use cardwall_core::{
    ApprovedCertificate, Can, CardAuthError, ChallengeSession, JwsAlgorithm, JwsHeader,
    JwsSigningInput, PairingSession, Pin, RegistrationData, SecureEnclaveError,
    SignedAuthenticationData, SignedChallenge,
};
use tracing::{info, warn};

use crate::biometric::BiometricSigner;
use crate::config::{EngineConfig, SignerMode};
use crate::enclave::DeviceRegistration;
use crate::error::{CardwallError, Result};
use crate::session::CardSessionOpener;
use crate::transport::CardTransport;
use crate::virtual_card::VirtualCard;

/// One open signing session
///
/// Single owner for its lifetime: all signing takes `&mut self`, so no two
/// signatures can run against the same session concurrently.
#[async_trait]
pub trait SignatureSession: Send + Sync {
    /// Verify the card holder PIN; required before signing
    async fn verify_pin(&mut self, pin: &Pin) -> std::result::Result<(), CardAuthError>;

    /// Sign the challenge
    ///
    /// The certificate must pass the curve gate before any signing command
    /// is issued.
    async fn sign(
        &mut self,
        challenge: &ChallengeSession,
    ) -> std::result::Result<SignedChallenge, CardAuthError>;

    /// Sign pairing data for `pairing` and register the device key
    async fn sign_for_pairing(
        &mut self,
        registration: &dyn RegistrationDataProvider,
        pairing: &PairingSession,
        signed_challenge: SignedChallenge,
    ) -> std::result::Result<(SignedChallenge, RegistrationData), CardAuthError>;

    /// Status hint for the user; never affects control flow
    fn update_alert(&self, message: &str);

    /// Tear down the session; only the first call has an effect
    fn invalidate(&self, error: Option<&str>);
}

/// Opens signature sessions for a card access number
#[async_trait]
pub trait SessionOpener: Send + Sync {
    async fn open(
        &self,
        can: &Can,
    ) -> std::result::Result<Box<dyn SignatureSession>, CardAuthError>;
}

/// Device-bound key registry used for biometric pairing and login
pub trait RegistrationDataProvider: Send + Sync {
    /// Create a pairing session and its device key
    fn create_pairing_session(&self) -> std::result::Result<PairingSession, SecureEnclaveError>;

    /// Pairing data to be signed by the card
    fn pairing_signing_input(
        &self,
        pairing: &PairingSession,
        certificate: &ApprovedCertificate,
    ) -> std::result::Result<JwsSigningInput, SecureEnclaveError>;

    /// Store the pairing and build the registration for the identity provider
    fn complete_pairing(
        &self,
        pairing: &PairingSession,
        certificate: &ApprovedCertificate,
        signed_pairing_data: String,
    ) -> std::result::Result<RegistrationData, SecureEnclaveError>;

    /// Discard everything stored for `pairing`, including the device key
    fn abort(&self, pairing: &PairingSession) -> std::result::Result<(), SecureEnclaveError>;

    /// Sign authentication data for a biometric login
    fn authentication_data(
        &self,
        challenge: &ChallengeSession,
    ) -> std::result::Result<SignedAuthenticationData, SecureEnclaveError>;

    /// Whether a device key and certificate are registered
    fn is_biometrics_registered(&self) -> bool;
}

/// Signing input of a challenge signature
pub(crate) fn challenge_signing_input(
    certificate: &ApprovedCertificate,
    algorithm: JwsAlgorithm,
    challenge: &ChallengeSession,
) -> std::result::Result<JwsSigningInput, CardAuthError> {
    let header = JwsHeader::nested_jwt(algorithm, certificate.x5c());
    JwsSigningInput::for_challenge(&header, challenge.challenge())
        .map_err(|e| CardAuthError::Generic(e.to_string()))
}

/// Build the session opener selected by `config.signer`
///
/// The virtual card is never used unless configured explicitly. The
/// biometric signer needs the device registration holding the paired key.
pub fn session_opener(
    config: &EngineConfig,
    transport: Arc<dyn CardTransport>,
    virtual_card: Option<VirtualCard>,
    registration: Option<Arc<DeviceRegistration>>,
) -> Result<Arc<dyn SessionOpener>> {
    match config.signer {
        SignerMode::Card => {
            info!("Using health card signer");
            Ok(Arc::new(CardSessionOpener::new(transport, config.messages.clone())))
        }
        SignerMode::Virtual => {
            let card = virtual_card.ok_or_else(|| {
                CardwallError::Config("virtual signer selected but no virtual card given".into())
            })?;
            warn!("Using virtual card signer; CAN and PIN are ignored");
            Ok(Arc::new(card))
        }
        SignerMode::Biometric => {
            let registration = registration.ok_or_else(|| {
                CardwallError::Config(
                    "biometric signer selected but no device registration given".into(),
                )
            })?;
            info!("Using biometric device key signer");
            Ok(Arc::new(BiometricSigner::new(registration)))
        }
    }
}
