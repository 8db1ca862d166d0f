//! Virtual health card for debugging
//!
//! Signs with a locally held key and certificate instead of a physical
//! card. The CAN and PIN are ignored. Only used when the configuration
//! selects it explicitly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use cardwall_core::{
    AutCertificate, Can, CardAuthError, ChallengeSession, JwsSigningInput, PairingSession, Pin,
    RegistrationData, SignedChallenge,
};
use tracing::{debug, info};

use crate::signer::{
    challenge_signing_input, RegistrationDataProvider, SessionOpener, SignatureSession,
};

/// Private key of the virtual card
///
/// Signs the SHA-256 digest and returns raw `r || s`. The certificate's
/// curve decides which implementation is needed; the curve gate applies
/// to the certificate as for a physical card.
pub trait SoftwareKey: Send + Sync {
    fn sign_digest(&self, digest: &[u8]) -> Result<Vec<u8>, CardAuthError>;
}

/// Key and certificate pair acting as a health card
#[derive(Clone)]
pub struct VirtualCard {
    certificate: AutCertificate,
    key: Arc<dyn SoftwareKey>,
}

impl VirtualCard {
    pub fn new(certificate: AutCertificate, key: Arc<dyn SoftwareKey>) -> Self {
        Self { certificate, key }
    }
}

#[async_trait]
impl SessionOpener for VirtualCard {
    async fn open(&self, _can: &Can) -> Result<Box<dyn SignatureSession>, CardAuthError> {
        debug!("Opening virtual card session");
        Ok(Box::new(VirtualSignatureSession {
            card: self.clone(),
            invalidated: AtomicBool::new(false),
        }))
    }
}

/// Session on a [`VirtualCard`]
pub struct VirtualSignatureSession {
    card: VirtualCard,
    invalidated: AtomicBool,
}

impl VirtualSignatureSession {
    fn sign_input(&self, input: &JwsSigningInput) -> Result<Vec<u8>, CardAuthError> {
        self.card.key.sign_digest(&input.digest())
    }
}

#[async_trait]
impl SignatureSession for VirtualSignatureSession {
    async fn verify_pin(&mut self, _pin: &Pin) -> Result<(), CardAuthError> {
        Ok(())
    }

    async fn sign(
        &mut self,
        challenge: &ChallengeSession,
    ) -> Result<SignedChallenge, CardAuthError> {
        let certificate = self.card.certificate.approve()?;
        let input = challenge_signing_input(&certificate, certificate.algorithm(), challenge)?;
        let signature = self.sign_input(&input)?;

        info!("Challenge signed with virtual card");
        Ok(SignedChallenge::new(input.finish(&signature), challenge.clone()))
    }

    async fn sign_for_pairing(
        &mut self,
        registration: &dyn RegistrationDataProvider,
        pairing: &PairingSession,
        signed_challenge: SignedChallenge,
    ) -> Result<(SignedChallenge, RegistrationData), CardAuthError> {
        let certificate = self.card.certificate.approve()?;
        let input = registration.pairing_signing_input(pairing, &certificate)?;
        let signature = self.sign_input(&input)?;
        let registration_data =
            registration.complete_pairing(pairing, &certificate, input.finish(&signature))?;

        Ok((signed_challenge, registration_data))
    }

    fn update_alert(&self, message: &str) {
        debug!("Virtual card: {}", message);
    }

    fn invalidate(&self, error: Option<&str>) {
        if !self.invalidated.swap(true, Ordering::SeqCst) {
            debug!("Virtual card session closed (error: {:?})", error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockSoftwareKey;
    use cardwall_core::certificate::fixtures::{brainpool_certificate, prime256_certificate};
    use cardwall_core::SigningError;
    use chrono::{Duration, Utc};

    fn challenge() -> ChallengeSession {
        ChallengeSession::new(
            "challenge.jwt",
            Utc::now() + Duration::seconds(300),
            "state",
            "nonce",
            "verifier",
        )
    }

    #[tokio::test]
    async fn test_virtual_card_ignores_can_and_pin() {
        let key = Arc::new(MockSoftwareKey::new());
        let card = VirtualCard::new(brainpool_certificate(), key.clone());

        let mut session = card.open(&Can::parse("000000").unwrap()).await.unwrap();
        session.verify_pin(&Pin::parse("0000").unwrap()).await.unwrap();
        let signed = session.sign(&challenge()).await.unwrap();

        assert_eq!(signed.signed_challenge().split('.').count(), 3);
        assert_eq!(key.sign_calls(), 1);
    }

    #[tokio::test]
    async fn test_virtual_card_applies_curve_gate() {
        let key = Arc::new(MockSoftwareKey::new());
        let card = VirtualCard::new(prime256_certificate(), key.clone());

        let mut session = card.open(&Can::parse("000000").unwrap()).await.unwrap();
        assert_eq!(
            session.sign(&challenge()).await,
            Err(CardAuthError::Signing(SigningError::UnsupportedAlgorithm))
        );
        assert_eq!(key.sign_calls(), 0);
    }
}
