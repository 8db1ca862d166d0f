//! Signature session over a physical health card

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use cardwall_core::{
    ApprovedCertificate, Can, CardAuthError, ChallengeSession, JwsSigningInput, PairingSession,
    Pin, RegistrationData, SignedChallenge, SigningError, TransportError, VerifyPinError,
};
use tracing::{debug, info, warn};

use crate::config::NfcMessages;
use crate::signer::{
    challenge_signing_input, RegistrationDataProvider, SessionOpener, SignatureSession,
};
use crate::transport::{CardConnection, CardTransport, RawSignResponse, VerifyPinResponse};

/// Opens card sessions through the NFC transport
pub struct CardSessionOpener {
    transport: Arc<dyn CardTransport>,
    messages: NfcMessages,
}

impl CardSessionOpener {
    pub fn new(transport: Arc<dyn CardTransport>, messages: NfcMessages) -> Self {
        Self {
            transport,
            messages,
        }
    }
}

#[async_trait]
impl SessionOpener for CardSessionOpener {
    async fn open(&self, can: &Can) -> Result<Box<dyn SignatureSession>, CardAuthError> {
        let connection = self
            .transport
            .open_session(can, &self.messages)
            .await
            .map_err(CardAuthError::from_transport)?;
        debug!("Secure channel to card established");

        Ok(Box::new(CardSignatureSession::new(
            connection,
            self.messages.clone(),
        )))
    }
}

/// Authenticated connection to a health card
///
/// Invalidation is idempotent. Dropping a session that was never
/// invalidated (a cancelled attempt) tears it down with the cancel message.
pub struct CardSignatureSession {
    connection: Box<dyn CardConnection>,
    messages: NfcMessages,
    pin_verified: bool,
    certificate: Option<ApprovedCertificate>,
    invalidated: AtomicBool,
}

impl CardSignatureSession {
    pub fn new(connection: Box<dyn CardConnection>, messages: NfcMessages) -> Self {
        Self {
            connection,
            messages,
            pin_verified: false,
            certificate: None,
            invalidated: AtomicBool::new(false),
        }
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::SeqCst)
    }

    /// Read the AUT certificate once and pass it through the curve gate
    async fn approved_certificate(&mut self) -> Result<ApprovedCertificate, CardAuthError> {
        if let Some(certificate) = &self.certificate {
            return Ok(certificate.clone());
        }

        let certificate = self
            .connection
            .read_aut_certificate()
            .await
            .map_err(reading_error)?;
        let approved = certificate.approve().map_err(|e| {
            warn!("Card certificate rejected: {}", e);
            e
        })?;
        debug!("Card certificate {} approved", approved.serial_number());

        self.certificate = Some(approved.clone());
        Ok(approved)
    }

    async fn card_sign(&mut self, input: &JwsSigningInput) -> Result<Vec<u8>, CardAuthError> {
        match self
            .connection
            .raw_sign(&input.digest())
            .await
            .map_err(signing_error)?
        {
            RawSignResponse::Signed(signature) => Ok(signature),
            RawSignResponse::Rejected(status) => {
                warn!("Card refused to sign: {}", status);
                Err(SigningError::ResponseStatus(status).into())
            }
        }
    }
}

fn reading_error(error: TransportError) -> CardAuthError {
    match error {
        TransportError::Nfc(nfc) => CardAuthError::Card(nfc),
        other => CardAuthError::CardReading(other.to_string()),
    }
}

fn signing_error(error: TransportError) -> CardAuthError {
    match error {
        TransportError::Nfc(nfc) => CardAuthError::Card(nfc),
        other => CardAuthError::Generic(other.to_string()),
    }
}

#[async_trait]
impl SignatureSession for CardSignatureSession {
    async fn verify_pin(&mut self, pin: &Pin) -> Result<(), CardAuthError> {
        let response = self
            .connection
            .verify_pin(pin)
            .await
            .map_err(CardAuthError::from_transport)?;

        match response {
            VerifyPinResponse::Success => {
                debug!("PIN verified");
                self.pin_verified = true;
                Ok(())
            }
            VerifyPinResponse::Failed(error) => {
                warn!("PIN verification failed: {}", error);
                Err(CardAuthError::VerifyCard(error))
            }
        }
    }

    async fn sign(
        &mut self,
        challenge: &ChallengeSession,
    ) -> Result<SignedChallenge, CardAuthError> {
        if !self.pin_verified {
            return Err(VerifyPinError::SecurityStatusNotSatisfied.into());
        }

        let certificate = self.approved_certificate().await?;
        let input = challenge_signing_input(&certificate, certificate.algorithm(), challenge)?;
        let signature = self.card_sign(&input).await?;

        info!("Challenge signed with health card");
        Ok(SignedChallenge::new(input.finish(&signature), challenge.clone()))
    }

    async fn sign_for_pairing(
        &mut self,
        registration: &dyn RegistrationDataProvider,
        pairing: &PairingSession,
        signed_challenge: SignedChallenge,
    ) -> Result<(SignedChallenge, RegistrationData), CardAuthError> {
        if !self.pin_verified {
            return Err(VerifyPinError::SecurityStatusNotSatisfied.into());
        }

        let certificate = self.approved_certificate().await?;
        let input = registration.pairing_signing_input(pairing, &certificate)?;
        let signature = self.card_sign(&input).await?;
        let registration_data =
            registration.complete_pairing(pairing, &certificate, input.finish(&signature))?;

        info!("Pairing data signed with health card");
        Ok((signed_challenge, registration_data))
    }

    fn update_alert(&self, message: &str) {
        if !self.is_invalidated() {
            self.connection.update_alert(message);
        }
    }

    fn invalidate(&self, error: Option<&str>) {
        if self.invalidated.swap(true, Ordering::SeqCst) {
            debug!("Card session already invalidated");
            return;
        }
        match error {
            Some(reason) => info!("Invalidating card session: {}", reason),
            None => info!("Invalidating card session"),
        }
        self.connection.invalidate(error);
    }
}

impl Drop for CardSignatureSession {
    fn drop(&mut self) {
        if !self.is_invalidated() {
            warn!("Card session dropped while open, invalidating");
            self.invalidate(Some(&self.messages.cancel));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockCard, MockRegistration};
    use cardwall_core::certificate::fixtures::{brainpool_certificate, prime256_certificate};
    use cardwall_core::{CardAlgorithm, NfcError, ResponseStatus};
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

    fn session(card: &MockCard) -> CardSignatureSession {
        CardSignatureSession::new(Box::new(card.clone()), NfcMessages::default())
    }

    fn pin() -> Pin {
        Pin::parse("123456").unwrap()
    }

    #[tokio::test]
    async fn test_sign_after_pin() {
        let card = MockCard::new(brainpool_certificate());
        let mut session = session(&card);

        session.verify_pin(&pin()).await.unwrap();
        let signed = session.sign(&challenge()).await.unwrap();

        assert_eq!(signed.signed_challenge().split('.').count(), 3);
        assert_eq!(signed.original_challenge().challenge(), "challenge.jwt");
        assert_eq!(card.sign_calls(), 1);
    }

    #[tokio::test]
    async fn test_sign_requires_verified_pin() {
        let card = MockCard::new(brainpool_certificate());
        let mut session = session(&card);

        let result = session.sign(&challenge()).await;
        assert!(matches!(result, Err(CardAuthError::VerifyCard(_))));
        assert_eq!(card.sign_calls(), 0);
    }

    #[tokio::test]
    async fn test_wrong_curve_never_reaches_card_sign() {
        let card = MockCard::new(prime256_certificate());
        let mut session = session(&card);

        session.verify_pin(&pin()).await.unwrap();
        let result = session.sign(&challenge()).await;

        assert_eq!(
            result,
            Err(CardAuthError::Signing(SigningError::UnsupportedAlgorithm))
        );
        assert_eq!(card.sign_calls(), 0);
    }

    #[tokio::test]
    async fn test_rsa_card_never_reaches_card_sign() {
        let certificate = brainpool_certificate();
        let card = MockCard::new(cardwall_core::AutCertificate::new(
            certificate.der().to_vec(),
            CardAlgorithm::SignPss,
        ));
        let mut session = session(&card);

        session.verify_pin(&pin()).await.unwrap();
        assert_eq!(
            session.sign(&challenge()).await,
            Err(CardAuthError::Signing(SigningError::UnsupportedAlgorithm))
        );
        assert_eq!(card.sign_calls(), 0);
    }

    #[tokio::test]
    async fn test_card_refusal_is_response_status() {
        let card = MockCard::new(brainpool_certificate())
            .with_sign_response(RawSignResponse::Rejected(ResponseStatus::KEY_INVALID));
        let mut session = session(&card);

        session.verify_pin(&pin()).await.unwrap();
        assert_eq!(
            session.sign(&challenge()).await,
            Err(CardAuthError::Signing(SigningError::ResponseStatus(
                ResponseStatus::KEY_INVALID
            )))
        );
    }

    #[tokio::test]
    async fn test_tag_loss_while_reading_certificate() {
        let card = MockCard::new(brainpool_certificate())
            .with_read_error(TransportError::Nfc(NfcError::TagConnectionLost));
        let mut session = session(&card);

        session.verify_pin(&pin()).await.unwrap();
        let error = session.sign(&challenge()).await.unwrap_err();
        assert!(error.is_tag_connection_lost());
    }

    #[tokio::test]
    async fn test_wrong_pin_echoes_card_retry_count() {
        let card = MockCard::new(brainpool_certificate()).with_verify_response(
            VerifyPinResponse::Failed(VerifyPinError::WrongSecretWarning { retry_count: 2 }),
        );
        let mut session = session(&card);

        assert_eq!(
            session.verify_pin(&pin()).await,
            Err(CardAuthError::VerifyCard(VerifyPinError::WrongSecretWarning {
                retry_count: 2
            }))
        );
    }

    #[tokio::test]
    async fn test_invalidate_is_idempotent() {
        let card = MockCard::new(brainpool_certificate());
        let session = session(&card);

        session.invalidate(None);
        session.invalidate(Some("again"));
        drop(session);

        assert_eq!(card.invalidations(), vec![None]);
    }

    #[tokio::test]
    async fn test_drop_invalidates_with_cancel_message() {
        let card = MockCard::new(brainpool_certificate());
        drop(session(&card));

        assert_eq!(
            card.invalidations(),
            vec![Some(NfcMessages::default().cancel)]
        );
    }

    #[tokio::test]
    async fn test_sign_for_pairing_registers_device_key() {
        let card = MockCard::new(brainpool_certificate());
        let registration = MockRegistration::new();
        let pairing = registration.create_pairing_session().unwrap();
        let mut session = session(&card);

        session.verify_pin(&pin()).await.unwrap();
        let signed = session.sign(&challenge()).await.unwrap();
        let (signed_again, data) = session
            .sign_for_pairing(&registration, &pairing, signed.clone())
            .await
            .unwrap();

        assert_eq!(signed_again, signed);
        assert_eq!(data.signed_pairing_data.split('.').count(), 3);
        assert_eq!(card.sign_calls(), 2);
        assert_eq!(card.read_certificate_calls(), 1);
        assert!(registration.is_biometrics_registered());
    }
}
