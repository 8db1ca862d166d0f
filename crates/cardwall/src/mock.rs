//! Mock collaborators for testing without a card reader or identity provider
//!
//! Every mock shares its state behind an `Arc`, so a clone handed to the
//! engine and the one kept by the test observe the same calls.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use cardwall_core::{
    ApprovedCertificate, AutCertificate, Can, CardAuthError, ChallengeSession,
    DeviceInformation, DiagnosticContext, ExchangeToken, IdpError, IdpToken, JwsSigningInput,
    PairingSession, Pin, ProfileId, ProfileValidationError, RegistrationData,
    SecureEnclaveError, SignedAuthenticationData, SignedChallenge, TransportError,
};
use chrono::Utc;

use crate::config::NfcMessages;
use crate::enclave::{DeviceRegistration, MemoryCertificateStore, SoftwareEnclave};
use crate::idp::{IdTokenValidator, IdpClient};
use crate::login::CanStore;
use crate::signer::RegistrationDataProvider;
use crate::transport::{CardConnection, CardTransport, RawSignResponse, VerifyPinResponse};
use crate::virtual_card::SoftwareKey;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// Command APDUs the mock card logs into the diagnostic context
const VERIFY_HEADER: [u8; 8] = [0x0C, 0x20, 0x00, 0x81, 0x0B, 0x87, 0x09, 0x01];
const READ_COMMAND: [u8; 5] = [0x00, 0xB0, 0x85, 0x00, 0x00];
const SIGN_COMMAND: [u8; 9] = [0x0C, 0x88, 0x00, 0x00, 0x20, 0x87, 0x21, 0x01, 0x3F];
const SM_RESPONSE: [u8; 8] = [0x99, 0x02, 0x90, 0x00, 0x8E, 0x08, 0x90, 0x00];
const OK_RESPONSE: [u8; 2] = [0x90, 0x00];

struct CardState {
    certificate: AutCertificate,
    verify_response: Mutex<VerifyPinResponse>,
    verify_error: Mutex<Option<TransportError>>,
    read_error: Mutex<Option<TransportError>>,
    sign_response: Mutex<RawSignResponse>,
    sign_delay: Mutex<Option<Duration>>,
    context: Mutex<Option<Arc<DiagnosticContext>>>,
    verify_calls: AtomicUsize,
    read_certificate_calls: AtomicUsize,
    sign_calls: AtomicUsize,
    alerts: Mutex<Vec<String>>,
    invalidations: Mutex<Vec<Option<String>>>,
}

/// Mock health card connection
#[derive(Clone)]
pub struct MockCard {
    state: Arc<CardState>,
}

impl MockCard {
    /// A card that accepts any PIN and signs with a fixed signature
    pub fn new(certificate: AutCertificate) -> Self {
        Self {
            state: Arc::new(CardState {
                certificate,
                verify_response: Mutex::new(VerifyPinResponse::Success),
                verify_error: Mutex::new(None),
                read_error: Mutex::new(None),
                sign_response: Mutex::new(RawSignResponse::Signed(vec![0x5A; 64])),
                sign_delay: Mutex::new(None),
                context: Mutex::new(None),
                verify_calls: AtomicUsize::new(0),
                read_certificate_calls: AtomicUsize::new(0),
                sign_calls: AtomicUsize::new(0),
                alerts: Mutex::new(Vec::new()),
                invalidations: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn with_verify_response(self, response: VerifyPinResponse) -> Self {
        *lock(&self.state.verify_response) = response;
        self
    }

    pub fn with_verify_error(self, error: TransportError) -> Self {
        *lock(&self.state.verify_error) = Some(error);
        self
    }

    pub fn with_read_error(self, error: TransportError) -> Self {
        *lock(&self.state.read_error) = Some(error);
        self
    }

    pub fn with_sign_response(self, response: RawSignResponse) -> Self {
        *lock(&self.state.sign_response) = response;
        self
    }

    /// Delay every signing command, to cancel an attempt mid-flight
    pub fn with_sign_delay(self, delay: Duration) -> Self {
        *lock(&self.state.sign_delay) = Some(delay);
        self
    }

    /// Log exchanged APDUs into `context`
    pub fn with_context(self, context: Arc<DiagnosticContext>) -> Self {
        *lock(&self.state.context) = Some(context);
        self
    }

    pub fn verify_calls(&self) -> usize {
        self.state.verify_calls.load(Ordering::SeqCst)
    }

    pub fn read_certificate_calls(&self) -> usize {
        self.state.read_certificate_calls.load(Ordering::SeqCst)
    }

    pub fn sign_calls(&self) -> usize {
        self.state.sign_calls.load(Ordering::SeqCst)
    }

    pub fn alerts(&self) -> Vec<String> {
        lock(&self.state.alerts).clone()
    }

    pub fn invalidations(&self) -> Vec<Option<String>> {
        lock(&self.state.invalidations).clone()
    }

    fn log_command(&self, command: &[u8]) {
        if let Some(context) = lock(&self.state.context).as_ref() {
            context.log_command(command);
        }
    }

    fn log_response(&self, response: &[u8]) {
        if let Some(context) = lock(&self.state.context).as_ref() {
            context.log_response(response);
        }
    }
}

#[async_trait]
impl CardConnection for MockCard {
    async fn verify_pin(&mut self, pin: &Pin) -> Result<VerifyPinResponse, TransportError> {
        self.state.verify_calls.fetch_add(1, Ordering::SeqCst);
        // Secure messaging VERIFY carrying the format 2 PIN block (unencrypted here)
        let mut command = VERIFY_HEADER.to_vec();
        command.extend_from_slice(&pin.format2_block());
        self.log_command(&command);
        if let Some(error) = lock(&self.state.verify_error).clone() {
            return Err(error);
        }
        self.log_response(&SM_RESPONSE);
        Ok(*lock(&self.state.verify_response))
    }

    async fn read_aut_certificate(&mut self) -> Result<AutCertificate, TransportError> {
        self.state
            .read_certificate_calls
            .fetch_add(1, Ordering::SeqCst);
        self.log_command(&READ_COMMAND);
        if let Some(error) = lock(&self.state.read_error).clone() {
            return Err(error);
        }
        self.log_response(&OK_RESPONSE);
        Ok(self.state.certificate.clone())
    }

    async fn raw_sign(&mut self, _digest: &[u8]) -> Result<RawSignResponse, TransportError> {
        self.state.sign_calls.fetch_add(1, Ordering::SeqCst);
        self.log_command(&SIGN_COMMAND);
        let delay = *lock(&self.state.sign_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.log_response(&SM_RESPONSE);
        Ok(lock(&self.state.sign_response).clone())
    }

    fn update_alert(&self, message: &str) {
        lock(&self.state.alerts).push(message.to_string());
    }

    fn invalidate(&self, error: Option<&str>) {
        lock(&self.state.invalidations).push(error.map(str::to_string));
    }
}

/// Mock NFC transport handing out one [`MockCard`]
#[derive(Clone)]
pub struct MockTransport {
    card: MockCard,
    open_failures: Arc<Mutex<VecDeque<TransportError>>>,
    open_calls: Arc<AtomicUsize>,
}

impl MockTransport {
    pub fn new(card: MockCard) -> Self {
        Self {
            card,
            open_failures: Arc::new(Mutex::new(VecDeque::new())),
            open_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Fail the next session opening with `error`; failures queue up
    pub fn fail_next_open(&self, error: TransportError) {
        lock(&self.open_failures).push_back(error);
    }

    pub fn open_calls(&self) -> usize {
        self.open_calls.load(Ordering::SeqCst)
    }

    pub fn card(&self) -> &MockCard {
        &self.card
    }
}

#[async_trait]
impl CardTransport for MockTransport {
    async fn open_session(
        &self,
        _can: &Can,
        _messages: &NfcMessages,
    ) -> Result<Box<dyn CardConnection>, TransportError> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        let failure = lock(&self.open_failures).pop_front();
        match failure {
            Some(error) => Err(error),
            None => Ok(Box::new(self.card.clone())),
        }
    }
}

#[derive(Default)]
struct IdpState {
    challenge_ttl: Option<chrono::Duration>,
    challenge_delay: Option<Duration>,
    returned_state: Option<String>,
    challenge_error: Option<IdpError>,
    verify_error: Option<IdpError>,
    exchange_error: Option<IdpError>,
    alt_verify_error: Option<IdpError>,
    pair_error: Option<IdpError>,
}

/// Mock identity provider
#[derive(Clone, Default)]
pub struct MockIdp {
    state: Arc<Mutex<IdpState>>,
    challenge_calls: Arc<AtomicUsize>,
    verify_calls: Arc<AtomicUsize>,
    exchange_calls: Arc<AtomicUsize>,
    alt_verify_calls: Arc<AtomicUsize>,
    pair_device_calls: Arc<AtomicUsize>,
    unregister_calls: Arc<AtomicUsize>,
}

impl MockIdp {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lifetime of issued challenges (default five minutes)
    pub fn with_challenge_ttl(self, ttl: chrono::Duration) -> Self {
        lock(&self.state).challenge_ttl = Some(ttl);
        self
    }

    pub fn with_challenge_delay(self, delay: Duration) -> Self {
        lock(&self.state).challenge_delay = Some(delay);
        self
    }

    /// State returned with exchange tokens instead of the challenge's
    pub fn with_returned_state(self, state: &str) -> Self {
        lock(&self.state).returned_state = Some(state.to_string());
        self
    }

    pub fn with_challenge_error(self, error: IdpError) -> Self {
        lock(&self.state).challenge_error = Some(error);
        self
    }

    pub fn with_verify_error(self, error: IdpError) -> Self {
        lock(&self.state).verify_error = Some(error);
        self
    }

    pub fn with_exchange_error(self, error: IdpError) -> Self {
        lock(&self.state).exchange_error = Some(error);
        self
    }

    pub fn with_alt_verify_error(self, error: IdpError) -> Self {
        lock(&self.state).alt_verify_error = Some(error);
        self
    }

    pub fn with_pair_error(self, error: IdpError) -> Self {
        lock(&self.state).pair_error = Some(error);
        self
    }

    pub fn challenge_calls(&self) -> usize {
        self.challenge_calls.load(Ordering::SeqCst)
    }

    pub fn verify_calls(&self) -> usize {
        self.verify_calls.load(Ordering::SeqCst)
    }

    pub fn exchange_calls(&self) -> usize {
        self.exchange_calls.load(Ordering::SeqCst)
    }

    pub fn alt_verify_calls(&self) -> usize {
        self.alt_verify_calls.load(Ordering::SeqCst)
    }

    pub fn pair_device_calls(&self) -> usize {
        self.pair_device_calls.load(Ordering::SeqCst)
    }

    pub fn unregister_calls(&self) -> usize {
        self.unregister_calls.load(Ordering::SeqCst)
    }

    fn exchange_token(&self, challenge: &ChallengeSession) -> ExchangeToken {
        let state = lock(&self.state)
            .returned_state
            .clone()
            .unwrap_or_else(|| challenge.state().to_string());
        ExchangeToken {
            code: "authorization-code".to_string(),
            state,
        }
    }
}

#[async_trait]
impl IdpClient for MockIdp {
    async fn request_challenge(&self) -> Result<ChallengeSession, IdpError> {
        let n = self.challenge_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let (delay, ttl, error) = {
            let state = lock(&self.state);
            (
                state.challenge_delay,
                state
                    .challenge_ttl
                    .unwrap_or_else(|| chrono::Duration::minutes(5)),
                state.challenge_error.clone(),
            )
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = error {
            return Err(error);
        }
        Ok(ChallengeSession::new(
            format!("challenge-{}", n),
            Utc::now() + ttl,
            format!("state-{}", n),
            format!("nonce-{}", n),
            "code-verifier",
        ))
    }

    async fn verify(&self, signed: &SignedChallenge) -> Result<ExchangeToken, IdpError> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = lock(&self.state).verify_error.clone() {
            return Err(error);
        }
        Ok(self.exchange_token(signed.original_challenge()))
    }

    async fn exchange(
        &self,
        _token: &ExchangeToken,
        _challenge: &ChallengeSession,
    ) -> Result<IdpToken, IdpError> {
        self.exchange_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = lock(&self.state).exchange_error.clone() {
            return Err(error);
        }
        Ok(IdpToken {
            access_token: "access-token".to_string(),
            id_token: "id-token".to_string(),
            expires: Utc::now() + chrono::Duration::minutes(5),
        })
    }

    async fn alt_verify(
        &self,
        data: &SignedAuthenticationData,
    ) -> Result<ExchangeToken, IdpError> {
        self.alt_verify_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = lock(&self.state).alt_verify_error.clone() {
            return Err(error);
        }
        Ok(self.exchange_token(data.original_challenge()))
    }

    async fn pair_device(
        &self,
        _registration: &RegistrationData,
        _token: &IdpToken,
    ) -> Result<(), IdpError> {
        self.pair_device_calls.fetch_add(1, Ordering::SeqCst);
        match lock(&self.state).pair_error.clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn unregister_device(
        &self,
        _key_identifier: &str,
        _token: &IdpToken,
    ) -> Result<(), IdpError> {
        self.unregister_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Mock identity token validator
pub struct MockValidator {
    result: Result<bool, ProfileValidationError>,
    calls: AtomicUsize,
}

impl MockValidator {
    pub fn accepting() -> Self {
        Self::returning(Ok(true))
    }

    pub fn returning(result: Result<bool, ProfileValidationError>) -> Self {
        Self {
            result,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl IdTokenValidator for MockValidator {
    fn validate(&self, _token: &IdpToken) -> Result<bool, ProfileValidationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.result.clone()
    }
}

/// Device registration over a software enclave, counting lifecycle calls
pub struct MockRegistration {
    inner: DeviceRegistration,
    create_calls: AtomicUsize,
    abort_calls: AtomicUsize,
}

impl MockRegistration {
    pub fn new() -> Self {
        Self {
            inner: DeviceRegistration::new(
                Arc::new(SoftwareEnclave::new()),
                Arc::new(MemoryCertificateStore::new()),
                DeviceInformation::default(),
            ),
            create_calls: AtomicUsize::new(0),
            abort_calls: AtomicUsize::new(0),
        }
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn abort_calls(&self) -> usize {
        self.abort_calls.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &DeviceRegistration {
        &self.inner
    }
}

impl Default for MockRegistration {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistrationDataProvider for MockRegistration {
    fn create_pairing_session(&self) -> Result<PairingSession, SecureEnclaveError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.create_pairing_session()
    }

    fn pairing_signing_input(
        &self,
        pairing: &PairingSession,
        certificate: &ApprovedCertificate,
    ) -> Result<JwsSigningInput, SecureEnclaveError> {
        self.inner.pairing_signing_input(pairing, certificate)
    }

    fn complete_pairing(
        &self,
        pairing: &PairingSession,
        certificate: &ApprovedCertificate,
        signed_pairing_data: String,
    ) -> Result<RegistrationData, SecureEnclaveError> {
        self.inner
            .complete_pairing(pairing, certificate, signed_pairing_data)
    }

    fn abort(&self, pairing: &PairingSession) -> Result<(), SecureEnclaveError> {
        self.abort_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.abort(pairing)
    }

    fn authentication_data(
        &self,
        challenge: &ChallengeSession,
    ) -> Result<SignedAuthenticationData, SecureEnclaveError> {
        self.inner.authentication_data(challenge)
    }

    fn is_biometrics_registered(&self) -> bool {
        self.inner.is_biometrics_registered()
    }
}

/// Private key of a virtual card returning a fixed signature
#[derive(Default)]
pub struct MockSoftwareKey {
    sign_calls: AtomicUsize,
}

impl MockSoftwareKey {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sign_calls(&self) -> usize {
        self.sign_calls.load(Ordering::SeqCst)
    }
}

impl SoftwareKey for MockSoftwareKey {
    fn sign_digest(&self, digest: &[u8]) -> Result<Vec<u8>, CardAuthError> {
        self.sign_calls.fetch_add(1, Ordering::SeqCst);
        let mut signature = digest.to_vec();
        signature.extend_from_slice(digest);
        Ok(signature)
    }
}

/// CANs kept in memory, with an optional default for every profile
#[derive(Default)]
pub struct MockCanStore {
    default: Option<String>,
    cans: Mutex<HashMap<ProfileId, String>>,
}

impl MockCanStore {
    pub fn new(default: Option<&str>) -> Self {
        Self {
            default: default.map(str::to_string),
            cans: Mutex::new(HashMap::new()),
        }
    }

    pub fn set(&self, profile: ProfileId, can: &str) {
        lock(&self.cans).insert(profile, can.to_string());
    }
}

impl CanStore for MockCanStore {
    fn can(&self, profile: &ProfileId) -> Option<String> {
        lock(&self.cans)
            .get(profile)
            .cloned()
            .or_else(|| self.default.clone())
    }
}
