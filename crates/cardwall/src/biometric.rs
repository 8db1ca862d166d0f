//! Signature session backed by the device key of a biometric registration

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use cardwall_core::{
    Can, CardAuthError, ChallengeSession, JwsAlgorithm, PairingSession, Pin, RegistrationData,
    SecureEnclaveError, SignedAuthenticationData, SignedChallenge,
};
use tracing::{debug, info};

use crate::enclave::DeviceRegistration;
use crate::signer::{
    challenge_signing_input, RegistrationDataProvider, SessionOpener, SignatureSession,
};

/// Opens sessions on the registered device key
///
/// No card is involved, so the CAN is not used.
#[derive(Clone)]
pub struct BiometricSigner {
    registration: Arc<DeviceRegistration>,
}

impl BiometricSigner {
    pub fn new(registration: Arc<DeviceRegistration>) -> Self {
        Self { registration }
    }

    pub fn session(&self) -> BiometricSignatureSession {
        BiometricSignatureSession {
            registration: self.registration.clone(),
            invalidated: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl SessionOpener for BiometricSigner {
    async fn open(&self, _can: &Can) -> Result<Box<dyn SignatureSession>, CardAuthError> {
        if !self.registration.is_biometrics_registered() {
            return Err(SecureEnclaveError::PackagingAuthCertificate.into());
        }
        Ok(Box::new(self.session()))
    }
}

/// Session signing with the device key
///
/// Challenges are signed ES256 with the registered card certificate in the
/// header. New pairings cannot be signed here; they need a health card.
pub struct BiometricSignatureSession {
    registration: Arc<DeviceRegistration>,
    invalidated: AtomicBool,
}

impl BiometricSignatureSession {
    /// Signed authentication data for the alternative verification
    pub fn sign_authentication_data(
        &self,
        challenge: &ChallengeSession,
    ) -> Result<SignedAuthenticationData, CardAuthError> {
        Ok(self.registration.authentication_data(challenge)?)
    }
}

#[async_trait]
impl SignatureSession for BiometricSignatureSession {
    async fn verify_pin(&mut self, _pin: &Pin) -> Result<(), CardAuthError> {
        Ok(())
    }

    async fn sign(
        &mut self,
        challenge: &ChallengeSession,
    ) -> Result<SignedChallenge, CardAuthError> {
        let certificate = self.registration.registered_aut_certificate()?.approve()?;
        let input = challenge_signing_input(&certificate, JwsAlgorithm::Es256, challenge)?;
        let signature = self.registration.sign_with_device_key(&input)?;

        info!("Challenge signed with device key");
        Ok(SignedChallenge::new(input.finish(&signature), challenge.clone()))
    }

    async fn sign_for_pairing(
        &mut self,
        _registration: &dyn RegistrationDataProvider,
        _pairing: &PairingSession,
        _signed_challenge: SignedChallenge,
    ) -> Result<(SignedChallenge, RegistrationData), CardAuthError> {
        Err(SecureEnclaveError::PairingRequiresCard.into())
    }

    fn update_alert(&self, message: &str) {
        debug!("Biometric session: {}", message);
    }

    fn invalidate(&self, error: Option<&str>) {
        if !self.invalidated.swap(true, Ordering::SeqCst) {
            debug!("Biometric session closed (error: {:?})", error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enclave::{CertificateStore, MemoryCertificateStore, SoftwareEnclave};
    use cardwall_core::certificate::fixtures::{brainpool_certificate, prime256_certificate};
    use cardwall_core::{DeviceInformation, SigningError};
    use chrono::{Duration, Utc};

    fn registration() -> Arc<DeviceRegistration> {
        Arc::new(DeviceRegistration::new(
            Arc::new(SoftwareEnclave::new()),
            Arc::new(MemoryCertificateStore::new()),
            DeviceInformation::default(),
        ))
    }

    fn pair(registration: &DeviceRegistration) {
        let pairing = registration.create_pairing_session().unwrap();
        let approved = brainpool_certificate().approve().unwrap();
        registration
            .complete_pairing(&pairing, &approved, "signed".into())
            .unwrap();
    }

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
    async fn test_unregistered_device_cannot_open() {
        let signer = BiometricSigner::new(registration());
        let result = signer.open(&Can::parse("123456").unwrap()).await;
        assert!(matches!(
            result,
            Err(CardAuthError::SecureEnclave(SecureEnclaveError::PackagingAuthCertificate))
        ));
    }

    #[tokio::test]
    async fn test_sign_with_device_key() {
        let registration = registration();
        pair(&registration);

        let mut session = BiometricSigner::new(registration).session();
        let signed = session.sign(&challenge()).await.unwrap();
        assert_eq!(signed.signed_challenge().split('.').count(), 3);
    }

    #[tokio::test]
    async fn test_pairing_requires_card() {
        let registration = registration();
        pair(&registration);
        let pairing = registration.create_pairing_session().unwrap();

        let mut session = BiometricSigner::new(registration.clone()).session();
        let signed = session.sign(&challenge()).await.unwrap();
        assert_eq!(
            session
                .sign_for_pairing(registration.as_ref(), &pairing, signed)
                .await,
            Err(CardAuthError::SecureEnclave(SecureEnclaveError::PairingRequiresCard))
        );
    }

    #[tokio::test]
    async fn test_registered_certificate_on_other_curve_is_rejected() {
        let store = Arc::new(MemoryCertificateStore::new());
        let registration = Arc::new(DeviceRegistration::new(
            Arc::new(SoftwareEnclave::new()),
            store.clone(),
            DeviceInformation::default(),
        ));
        let pairing = registration.create_pairing_session().unwrap();
        store.set_certificate(Some(prime256_certificate().der().to_vec()));
        store.set_key_identifier(Some(pairing.key_identifier().to_string()));

        let mut session = BiometricSigner::new(registration).session();
        assert_eq!(
            session.sign(&challenge()).await,
            Err(CardAuthError::Signing(SigningError::UnsupportedAlgorithm))
        );
    }

    #[test]
    fn test_authentication_data_through_session() {
        let registration = registration();
        pair(&registration);

        let session = BiometricSigner::new(registration).session();
        let signed = session.sign_authentication_data(&challenge()).unwrap();
        assert_eq!(signed.original_challenge().challenge(), "challenge.jwt");
    }
}
