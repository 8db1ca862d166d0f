//! Card authentication engine
//!
//! Drives one authentication attempt through
//! `Idle -> OpeningSession -> VerifyingPin -> SigningChallenge ->
//! (PairingForBiometrics) -> Done | Failed`.
//!
//! Every exit path invalidates the signature session: with no error on
//! success (after the success alert had time to show), with the error
//! description on failure, and with the cancel message when the attempt is
//! dropped mid-flight. A dropped attempt ends in
//! `Failed(Card(SessionInvalidated))`.
//!
//! Attempts on one engine run one at a time; a second caller waits until
//! the running attempt has torn down its session.

use std::sync::Arc;
use std::time::Duration;

use cardwall_core::{
    Can, CardAuthError, ChallengeSession, DiagnosticContext, NfcError, PairingSession, Pin,
    RegistrationData, SignedChallenge,
};
use tokio::sync::{watch, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, NfcMessages};
use crate::signer::{RegistrationDataProvider, SessionOpener, SignatureSession};

/// State of the current authentication attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    Idle,
    OpeningSession,
    VerifyingPin,
    SigningChallenge,
    PairingForBiometrics,
    Done,
    Failed(CardAuthError),
}

/// Running attempt
///
/// Holds the attempt lock. Dropping it before the attempt reached `Done` or
/// `Failed` publishes the cancellation.
struct Attempt<'a> {
    state: &'a watch::Sender<AuthState>,
    _lock: MutexGuard<'a, ()>,
}

impl Drop for Attempt<'_> {
    fn drop(&mut self) {
        self.state.send_if_modified(|state| match state {
            AuthState::Done | AuthState::Failed(_) => false,
            _ => {
                debug!("Card authentication cancelled in state {:?}", state);
                *state = AuthState::Failed(CardAuthError::Card(NfcError::SessionInvalidated));
                true
            }
        });
    }
}

/// Card authentication engine
pub struct CardAuthEngine {
    opener: Arc<dyn SessionOpener>,
    context: Arc<DiagnosticContext>,
    messages: NfcMessages,
    success_teardown_delay: Duration,
    state: watch::Sender<AuthState>,
    attempt: Mutex<()>,
}

impl CardAuthEngine {
    pub fn new(
        opener: Arc<dyn SessionOpener>,
        context: Arc<DiagnosticContext>,
        config: &EngineConfig,
    ) -> Self {
        let (state, _) = watch::channel(AuthState::Idle);
        Self {
            opener,
            context,
            messages: config.messages.clone(),
            success_teardown_delay: config.success_teardown_delay(),
            state,
            attempt: Mutex::new(()),
        }
    }

    /// Current state
    pub fn state(&self) -> AuthState {
        self.state.borrow().clone()
    }

    /// Observe state transitions
    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    /// Diagnostic context of the current screen visit
    pub fn context(&self) -> &Arc<DiagnosticContext> {
        &self.context
    }

    async fn begin(&self) -> Attempt<'_> {
        let lock = self.attempt.lock().await;
        self.transition(AuthState::OpeningSession);
        Attempt {
            state: &self.state,
            _lock: lock,
        }
    }

    fn transition(&self, next: AuthState) {
        debug!("Card authentication state: {:?}", next);
        self.state.send_replace(next);
    }

    /// Sign `challenge` with the card
    pub async fn sign(
        &self,
        can: &Can,
        pin: &Pin,
        challenge: &ChallengeSession,
    ) -> Result<SignedChallenge, CardAuthError> {
        info!("Starting card authentication");
        let _attempt = self.begin().await;

        // 1. Open the session and verify the PIN
        let mut session = self.open_verified(can, pin).await?;

        // 2. Read the certificate, check its curve and sign
        self.transition(AuthState::SigningChallenge);
        session.update_alert(&self.messages.sign_challenge);
        let result = session.sign(challenge).await;

        // 3. Tear down
        self.finish(session.as_ref(), result).await
    }

    /// Sign `challenge` and the pairing data of `pairing` with the card
    ///
    /// The pairing session is owned by the caller, who aborts it if this or
    /// any later step fails.
    pub async fn sign_for_biometrics(
        &self,
        can: &Can,
        pin: &Pin,
        challenge: &ChallengeSession,
        registration: &dyn RegistrationDataProvider,
        pairing: &PairingSession,
    ) -> Result<(SignedChallenge, RegistrationData), CardAuthError> {
        info!("Starting card authentication with biometric pairing");
        let _attempt = self.begin().await;

        // 1. Open the session and verify the PIN
        let mut session = self.open_verified(can, pin).await?;

        // 2. Sign the challenge
        self.transition(AuthState::SigningChallenge);
        session.update_alert(&self.messages.sign_challenge);
        let result = match session.sign(challenge).await {
            // 3. Sign the pairing data
            Ok(signed) => {
                self.transition(AuthState::PairingForBiometrics);
                session
                    .sign_for_pairing(registration, pairing, signed)
                    .await
            }
            Err(e) => Err(e),
        };

        // 4. Tear down
        self.finish(session.as_ref(), result).await
    }

    async fn open_verified(
        &self,
        can: &Can,
        pin: &Pin,
    ) -> Result<Box<dyn SignatureSession>, CardAuthError> {
        let mut session = match self.opener.open(can).await {
            Ok(session) => session,
            Err(e) => return Err(self.fail(e)),
        };

        self.transition(AuthState::VerifyingPin);
        session.update_alert(&self.messages.verify_pin);
        if let Err(e) = session.verify_pin(pin).await {
            session.invalidate(Some(&e.description()));
            return Err(self.fail(e));
        }

        Ok(session)
    }

    async fn finish<T: Send>(
        &self,
        session: &dyn SignatureSession,
        result: Result<T, CardAuthError>,
    ) -> Result<T, CardAuthError> {
        match result {
            Ok(value) => {
                session.update_alert(&self.messages.success);
                tokio::time::sleep(self.success_teardown_delay).await;
                session.invalidate(None);
                self.transition(AuthState::Done);
                info!("Card authentication finished");
                Ok(value)
            }
            Err(e) => {
                session.invalidate(Some(&e.description()));
                Err(self.fail(e))
            }
        }
    }

    fn fail(&self, error: CardAuthError) -> CardAuthError {
        if error.is_tag_connection_lost() {
            let count = self.context.record_tag_connection_lost();
            warn!("Tag connection lost ({} in this screen visit)", count);
        }
        warn!("Card authentication failed: {}", error);
        self.transition(AuthState::Failed(error.clone()));
        error
    }
}
