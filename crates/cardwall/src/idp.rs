//! Identity exchange
//!
//! Turns a signed challenge into identity provider tokens. The HTTP/JWT
//! protocol lives behind [`IdpClient`]; this module sequences the calls
//! and classifies their errors.

use std::sync::Arc;

use async_trait::async_trait;
use cardwall_core::{
    ChallengeSession, ExchangeToken, IdpError, IdpToken, LoginError, ProfileValidationError,
    RegistrationData, SignedAuthenticationData, SignedChallenge, UnspecifiedCause,
};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::signer::RegistrationDataProvider;

/// Identity provider client
#[async_trait]
pub trait IdpClient: Send + Sync {
    /// Start an authorization and return its challenge
    async fn request_challenge(&self) -> Result<ChallengeSession, IdpError>;

    /// Submit a card-signed challenge
    async fn verify(&self, signed: &SignedChallenge) -> Result<ExchangeToken, IdpError>;

    /// Redeem the authorization code
    async fn exchange(
        &self,
        token: &ExchangeToken,
        challenge: &ChallengeSession,
    ) -> Result<IdpToken, IdpError>;

    /// Submit device-signed authentication data
    async fn alt_verify(&self, data: &SignedAuthenticationData)
        -> Result<ExchangeToken, IdpError>;

    /// Register a device key
    async fn pair_device(
        &self,
        registration: &RegistrationData,
        token: &IdpToken,
    ) -> Result<(), IdpError>;

    /// Remove a device key registration
    async fn unregister_device(&self, key_identifier: &str, token: &IdpToken)
        -> Result<(), IdpError>;
}

/// Profile-scoped check of the issued identity token
pub trait IdTokenValidator: Send + Sync {
    fn validate(&self, token: &IdpToken) -> Result<bool, ProfileValidationError>;
}

/// Sequences identity provider calls
#[derive(Clone)]
pub struct IdentityExchange {
    client: Arc<dyn IdpClient>,
}

impl IdentityExchange {
    pub fn new(client: Arc<dyn IdpClient>) -> Self {
        Self { client }
    }

    /// Request a challenge that has not expired yet
    pub async fn request_challenge(&self) -> Result<ChallengeSession, IdpError> {
        let challenge = self.client.request_challenge().await?;
        if challenge.is_expired_at(Utc::now()) {
            warn!("Identity provider returned an expired challenge");
            return Err(IdpError::Internal("challenge session expired".to_string()));
        }
        debug!("Challenge valid until {}", challenge.expires_at());
        Ok(challenge)
    }

    /// Verify a signed challenge and exchange the code for tokens
    pub async fn verify_and_exchange(
        &self,
        signed: &SignedChallenge,
        validator: &dyn IdTokenValidator,
    ) -> Result<IdpToken, LoginError> {
        let token = self.client.verify(signed).await?;
        self.exchange(token, signed.original_challenge(), validator)
            .await
    }

    /// Verify, exchange and register the device key
    ///
    /// Succeeds only when the pairing succeeds as well.
    pub async fn verify_and_pair(
        &self,
        signed: &SignedChallenge,
        registration: &RegistrationData,
        validator: &dyn IdTokenValidator,
    ) -> Result<IdpToken, LoginError> {
        let token = self.verify_and_exchange(signed, validator).await?;
        self.pair_device(registration, &token).await?;
        Ok(token)
    }

    pub async fn pair_device(
        &self,
        registration: &RegistrationData,
        token: &IdpToken,
    ) -> Result<(), LoginError> {
        self.client.pair_device(registration, token).await?;
        info!("Device paired with identity provider");
        Ok(())
    }

    /// Best-effort removal of a device registration; failures are logged
    pub async fn unregister_device(&self, key_identifier: &str, token: &IdpToken) {
        if let Err(e) = self.client.unregister_device(key_identifier, token).await {
            warn!("Failed to unregister device key: {}", e);
        }
    }

    /// Log in with the registered device key
    pub async fn login_with_biometrics(
        &self,
        registration: &dyn RegistrationDataProvider,
        validator: &dyn IdTokenValidator,
    ) -> Result<IdpToken, LoginError> {
        let challenge = self.request_challenge().await?;
        let data = registration
            .authentication_data(&challenge)
            .map_err(|e| IdpError::Pairing(e.to_string()))?;

        let token = self.client.alt_verify(&data).await?;
        self.exchange(token, &challenge, validator).await
    }

    async fn exchange(
        &self,
        token: ExchangeToken,
        challenge: &ChallengeSession,
        validator: &dyn IdTokenValidator,
    ) -> Result<IdpToken, LoginError> {
        if !challenge.validate_state(&token.state) {
            warn!("State parameter does not match the challenge session");
            return Err(IdpError::InvalidStateParameter.into());
        }

        let idp_token = self.client.exchange(&token, challenge).await?;

        match validator.validate(&idp_token) {
            Ok(true) => {
                info!("Identity token accepted");
                Ok(idp_token)
            }
            Ok(false) => Err(ProfileValidationError::Rejected.into()),
            Err(e) => Err(LoginError::from_idp(IdpError::Unspecified(
                UnspecifiedCause::ProfileValidation(e),
            ))),
        }
    }
}
