//! Login flow
//!
//! Ties the steps of a login together for one profile: request a challenge,
//! sign it with the card, exchange it for tokens, and optionally register
//! the device key for biometric logins. Progress is published through a
//! watch channel.
//!
//! Only one challenge request per profile is in flight; a new request
//! aborts the previous one, whose caller receives
//! [`CardwallError::Cancelled`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use cardwall_core::{
    Can, ChallengeSession, IdpError, IdpToken, InputError, LoginError, PairingSession, Pin,
    ProfileId, Recovery, RecoveryPolicy, SecureEnclaveError, SignedChallenge,
};
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use crate::engine::CardAuthEngine;
use crate::error::{CardwallError, Result};
use crate::idp::{IdTokenValidator, IdentityExchange};
use crate::signer::RegistrationDataProvider;

/// Progress of one step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage {
    Loading,
    Error(LoginError),
}

/// Observable output of the login flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutput {
    Idle,
    RetrievingChallenge(Stage),
    ChallengeLoaded(ChallengeSession),
    SigningChallenge(Stage),
    Verifying(Stage),
    LoggedIn(IdpToken),
}

/// Read access to the card access numbers kept in secure storage
pub trait CanStore: Send + Sync {
    fn can(&self, profile: &ProfileId) -> Option<String>;
}

/// In-flight challenge requests, at most one per profile
#[derive(Debug, Default)]
pub struct ChallengeRequests {
    next_ticket: AtomicU64,
    in_flight: Mutex<HashMap<ProfileId, (u64, AbortHandle)>>,
}

impl ChallengeRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<ProfileId, (u64, AbortHandle)>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Track `handle` for `profile`, aborting the request it replaces
    fn start(&self, profile: ProfileId, handle: AbortHandle) -> u64 {
        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst);
        if let Some((_, previous)) = self.in_flight().insert(profile, (ticket, handle)) {
            debug!("Cancelling previous challenge request for profile {}", profile);
            previous.abort();
        }
        ticket
    }

    fn finish(&self, profile: ProfileId, ticket: u64) {
        let mut in_flight = self.in_flight();
        if in_flight.get(&profile).map(|(t, _)| *t) == Some(ticket) {
            in_flight.remove(&profile);
        }
    }

    /// Whether a request for `profile` is running
    pub fn is_in_flight(&self, profile: &ProfileId) -> bool {
        self.in_flight().contains_key(profile)
    }
}

/// One tracked challenge request
///
/// Dropping it aborts the request task and releases the profile's slot.
struct ChallengeRequest<'a> {
    requests: &'a ChallengeRequests,
    profile: ProfileId,
    ticket: u64,
    handle: AbortHandle,
}

impl<'a> ChallengeRequest<'a> {
    fn start<T>(requests: &'a ChallengeRequests, profile: ProfileId, task: &JoinHandle<T>) -> Self {
        let ticket = requests.start(profile, task.abort_handle());
        Self {
            requests,
            profile,
            ticket,
            handle: task.abort_handle(),
        }
    }
}

impl Drop for ChallengeRequest<'_> {
    fn drop(&mut self) {
        self.handle.abort();
        self.requests.finish(self.profile, self.ticket);
    }
}

/// Aborts a pairing session unless it was committed
///
/// Dropping the guard (on error or cancellation) aborts exactly once.
struct PairingGuard {
    registration: Arc<dyn RegistrationDataProvider>,
    pairing: PairingSession,
    committed: bool,
}

impl PairingGuard {
    fn new(registration: Arc<dyn RegistrationDataProvider>, pairing: PairingSession) -> Self {
        Self {
            registration,
            pairing,
            committed: false,
        }
    }

    fn pairing(&self) -> &PairingSession {
        &self.pairing
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for PairingGuard {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(e) = self.registration.abort(&self.pairing) {
                warn!("Failed to abort pairing session: {}", e);
            }
        }
    }
}

/// Login orchestration for one profile
pub struct LoginFlow {
    profile: ProfileId,
    engine: CardAuthEngine,
    identity: IdentityExchange,
    can_store: Arc<dyn CanStore>,
    validator: Arc<dyn IdTokenValidator>,
    registration: Option<Arc<dyn RegistrationDataProvider>>,
    requests: Arc<ChallengeRequests>,
    policy: RecoveryPolicy,
    output: watch::Sender<LoginOutput>,
}

impl LoginFlow {
    pub fn new(
        profile: ProfileId,
        engine: CardAuthEngine,
        identity: IdentityExchange,
        can_store: Arc<dyn CanStore>,
        validator: Arc<dyn IdTokenValidator>,
    ) -> Self {
        let (output, _) = watch::channel(LoginOutput::Idle);
        Self {
            profile,
            engine,
            identity,
            can_store,
            validator,
            registration: None,
            requests: Arc::new(ChallengeRequests::new()),
            policy: RecoveryPolicy::default(),
            output,
        }
    }

    /// Device key registry used for biometric registration
    pub fn with_registration(mut self, registration: Arc<dyn RegistrationDataProvider>) -> Self {
        self.registration = Some(registration);
        self
    }

    /// Share in-flight challenge requests with other flows
    pub fn with_challenge_requests(mut self, requests: Arc<ChallengeRequests>) -> Self {
        self.requests = requests;
        self
    }

    pub fn with_recovery_policy(mut self, policy: RecoveryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn profile(&self) -> ProfileId {
        self.profile
    }

    pub fn engine(&self) -> &CardAuthEngine {
        &self.engine
    }

    /// Observe the flow's output
    pub fn subscribe(&self) -> watch::Receiver<LoginOutput> {
        self.output.subscribe()
    }

    pub fn output(&self) -> LoginOutput {
        self.output.borrow().clone()
    }

    fn publish(&self, output: LoginOutput) {
        self.output.send_replace(output);
    }

    /// Request a challenge, superseding any request in flight for this profile
    pub async fn request_challenge(&self) -> Result<ChallengeSession> {
        self.publish(LoginOutput::RetrievingChallenge(Stage::Loading));

        let identity = self.identity.clone();
        let task = tokio::spawn(async move { identity.request_challenge().await });
        let request = ChallengeRequest::start(&self.requests, self.profile, &task);
        let result = task.await;
        drop(request);

        match result {
            Ok(Ok(challenge)) => {
                debug!("Challenge loaded for profile {}", self.profile);
                self.publish(LoginOutput::ChallengeLoaded(challenge.clone()));
                Ok(challenge)
            }
            Ok(Err(e)) => {
                let error = LoginError::from_idp(e);
                warn!("Challenge request failed: {}", error);
                self.publish(LoginOutput::RetrievingChallenge(Stage::Error(error.clone())));
                Err(error.into())
            }
            Err(e) if e.is_cancelled() => {
                debug!("Challenge request superseded");
                Err(CardwallError::Cancelled)
            }
            Err(e) => {
                let error = LoginError::Idp(IdpError::Internal(e.to_string()));
                self.publish(LoginOutput::RetrievingChallenge(Stage::Error(error.clone())));
                Err(error.into())
            }
        }
    }

    fn credentials(&self, pin: &str) -> std::result::Result<(Can, Pin), LoginError> {
        let can = self
            .can_store
            .can(&self.profile)
            .ok_or(InputError::MissingCan)
            .and_then(|can| Can::parse(&can))?;
        let pin = Pin::parse(pin)?;
        Ok((can, pin))
    }

    /// Sign `challenge` with the card of this profile
    pub async fn sign_challenge(
        &self,
        challenge: &ChallengeSession,
        pin: &str,
    ) -> Result<SignedChallenge> {
        self.publish(LoginOutput::SigningChallenge(Stage::Loading));

        let result = match self.credentials(pin) {
            Ok((can, pin)) => self
                .engine
                .sign(&can, &pin, challenge)
                .await
                .map_err(LoginError::from),
            Err(e) => Err(e),
        };

        result.map_err(|e| self.signing_failed(e))
    }

    /// Exchange a signed challenge for tokens
    pub async fn verify(&self, signed: &SignedChallenge) -> Result<IdpToken> {
        self.publish(LoginOutput::Verifying(Stage::Loading));

        match self
            .identity
            .verify_and_exchange(signed, self.validator.as_ref())
            .await
        {
            Ok(token) => {
                info!("Logged in profile {}", self.profile);
                self.publish(LoginOutput::LoggedIn(token.clone()));
                Ok(token)
            }
            Err(e) => Err(self.verifying_failed(e)),
        }
    }

    /// Full card login
    pub async fn login(&self, pin: &str) -> Result<IdpToken> {
        let challenge = self.request_challenge().await?;
        let signed = self.sign_challenge(&challenge, pin).await?;
        self.verify(&signed).await
    }

    /// Pair the device key using the card, then log in with the device key
    ///
    /// Any failure after the pairing session is created aborts it.
    pub async fn register_biometrics(&self, pin: &str) -> Result<IdpToken> {
        let registration = self.registration.clone().ok_or_else(|| {
            CardwallError::Login(LoginError::Biometrics(SecureEnclaveError::Internal(
                "no device registration configured".to_string(),
            )))
        })?;

        // 1. Challenge
        let challenge = self.request_challenge().await?;

        // 2. Credentials and pairing session
        self.publish(LoginOutput::SigningChallenge(Stage::Loading));
        let (can, pin) = self.credentials(pin).map_err(|e| self.signing_failed(e))?;
        let pairing = registration
            .create_pairing_session()
            .map_err(|e| self.signing_failed(LoginError::Biometrics(e)))?;
        let guard = PairingGuard::new(registration.clone(), pairing);

        // 3. Sign challenge and pairing data with the card
        let pairing = guard.pairing();
        let (signed, registration_data) = self
            .engine
            .sign_for_biometrics(&can, &pin, &challenge, registration.as_ref(), pairing)
            .await
            .map_err(|e| self.signing_failed(e.into()))?;
        let key_identifier = pairing.key_identifier().to_string();

        // 4. Exchange and pair with the identity provider
        self.publish(LoginOutput::Verifying(Stage::Loading));
        let card_token = self
            .identity
            .verify_and_pair(&signed, &registration_data, self.validator.as_ref())
            .await
            .map_err(|e| self.verifying_failed(e))?;

        // 5. Log in with the new device key
        match self
            .identity
            .login_with_biometrics(registration.as_ref(), self.validator.as_ref())
            .await
        {
            Ok(token) => {
                guard.commit();
                info!("Biometric login registered for profile {}", self.profile);
                self.publish(LoginOutput::LoggedIn(token.clone()));
                Ok(token)
            }
            Err(e) => {
                self.identity
                    .unregister_device(&key_identifier, &card_token)
                    .await;
                Err(self.verifying_failed(e))
            }
        }
    }

    fn signing_failed(&self, error: LoginError) -> CardwallError {
        warn!("Signing the challenge failed: {}", error);
        self.publish(LoginOutput::SigningChallenge(Stage::Error(error.clone())));
        error.into()
    }

    fn verifying_failed(&self, error: LoginError) -> CardwallError {
        warn!("Verification failed: {}", error);
        self.publish(LoginOutput::Verifying(Stage::Error(error.clone())));
        error.into()
    }

    /// Recovery action and report for a failure of this screen visit
    pub fn recover(&self, error: &LoginError) -> Recovery {
        let recovery = self.policy.resolve(error, self.engine.context());
        info!(
            "Login error classified as {:?} (report attached: {})",
            recovery.action,
            recovery.report.is_some()
        );
        recovery
    }

    /// Start a new screen visit
    pub fn reset_screen(&self) {
        self.engine.context().reset();
        self.publish(LoginOutput::Idle);
    }
}
