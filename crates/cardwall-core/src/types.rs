//! Value types passed between the authentication steps

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::InputError;
use crate::{CAN_LENGTH, MAX_PIN_LENGTH, MIN_PIN_LENGTH};

/// Identifier of the profile an authentication attempt belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProfileId(Uuid);

impl ProfileId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ProfileId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Card access number printed on the card (zeroized on drop)
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Can(String);

impl Can {
    /// Parse a CAN, which must be exactly six digits
    pub fn parse(value: &str) -> Result<Self, InputError> {
        let value = value.trim();
        if value.len() == CAN_LENGTH && value.chars().all(|c| c.is_ascii_digit()) {
            Ok(Self(value.to_string()))
        } else {
            Err(InputError::MissingCan)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Can {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Can(******)")
    }
}

/// Card holder PIN (zeroized on drop)
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Pin(String);

impl Pin {
    /// Parse a PIN usable in a format 2 PIN block (4 to 12 digits)
    pub fn parse(value: &str) -> Result<Self, InputError> {
        let len = value.len();
        if (MIN_PIN_LENGTH..=MAX_PIN_LENGTH).contains(&len)
            && value.chars().all(|c| c.is_ascii_digit())
        {
            Ok(Self(value.to_string()))
        } else {
            Err(InputError::MissingPin)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Encode as format 2 PIN block: `2N` followed by BCD digits padded with `F`
    pub fn format2_block(&self) -> [u8; 8] {
        let mut nibbles = [0xFu8; 16];
        nibbles[0] = 0x2;
        nibbles[1] = self.0.len() as u8;
        for (i, digit) in self.0.bytes().enumerate() {
            nibbles[2 + i] = digit - b'0';
        }
        let mut block = [0u8; 8];
        for (i, byte) in block.iter_mut().enumerate() {
            *byte = (nibbles[2 * i] << 4) | nibbles[2 * i + 1];
        }
        nibbles.zeroize();
        block
    }
}

impl fmt::Debug for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Pin(****)")
    }
}

/// Server-issued challenge of one authentication attempt
///
/// Must be signed exactly once; discarded after the exchange or on failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeSession {
    /// Compact JWT issued by the identity provider
    challenge: String,
    /// Expiry of the challenge
    expires_at: DateTime<Utc>,
    /// State parameter echoed by the provider on verification
    state: String,
    /// Nonce expected in the identity token
    nonce: String,
    /// PKCE code verifier of the authorization request
    code_verifier: String,
}

impl ChallengeSession {
    pub fn new(
        challenge: impl Into<String>,
        expires_at: DateTime<Utc>,
        state: impl Into<String>,
        nonce: impl Into<String>,
        code_verifier: impl Into<String>,
    ) -> Self {
        Self {
            challenge: challenge.into(),
            expires_at,
            state: state.into(),
            nonce: nonce.into(),
            code_verifier: code_verifier.into(),
        }
    }

    pub fn challenge(&self) -> &str {
        &self.challenge
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn state(&self) -> &str {
        &self.state
    }

    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    pub fn code_verifier(&self) -> &str {
        &self.code_verifier
    }

    /// Whether the challenge can no longer be signed at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Check the state parameter returned by the provider
    pub fn validate_state(&self, state: &str) -> bool {
        self.state == state
    }
}

/// Signed challenge together with the challenge it signs
///
/// Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedChallenge {
    signed_challenge: String,
    original_challenge: ChallengeSession,
}

impl SignedChallenge {
    pub fn new(signed_challenge: String, original_challenge: ChallengeSession) -> Self {
        Self {
            signed_challenge,
            original_challenge,
        }
    }

    /// Compact JWS over the challenge
    pub fn signed_challenge(&self) -> &str {
        &self.signed_challenge
    }

    pub fn original_challenge(&self) -> &ChallengeSession {
        &self.original_challenge
    }
}

/// Authorization code returned by a successful verification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeToken {
    pub code: String,
    pub state: String,
}

/// Tokens issued by the identity provider
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdpToken {
    pub access_token: String,
    pub id_token: String,
    pub expires: DateTime<Utc>,
}

impl fmt::Debug for IdpToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdpToken")
            .field("expires", &self.expires)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_can_parsing() {
        assert!(Can::parse("123456").is_ok());
        assert!(Can::parse(" 123456 ").is_ok());
        assert_eq!(Can::parse("12345"), Err(InputError::MissingCan));
        assert_eq!(Can::parse("12345a"), Err(InputError::MissingCan));
        assert_eq!(Can::parse(""), Err(InputError::MissingCan));
    }

    #[test]
    fn test_pin_parsing() {
        assert!(Pin::parse("1234").is_ok());
        assert!(Pin::parse("123456789012").is_ok());
        assert_eq!(Pin::parse("123"), Err(InputError::MissingPin));
        assert_eq!(Pin::parse("1234567890123"), Err(InputError::MissingPin));
        assert_eq!(Pin::parse("12 34"), Err(InputError::MissingPin));
    }

    #[test]
    fn test_secrets_are_not_printed() {
        let can = Can::parse("123456").unwrap();
        let pin = Pin::parse("1234").unwrap();
        assert!(!format!("{:?}", can).contains("123456"));
        assert!(!format!("{:?}", pin).contains("1234"));
    }

    #[test]
    fn test_format2_pin_block() {
        let pin = Pin::parse("1234").unwrap();
        assert_eq!(
            pin.format2_block(),
            [0x24, 0x12, 0x34, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn test_challenge_expiry_and_state() {
        let now = Utc::now();
        let challenge = ChallengeSession::new("jwt", now + Duration::seconds(60), "s1", "n", "v");
        assert!(!challenge.is_expired_at(now));
        assert!(challenge.is_expired_at(now + Duration::seconds(60)));
        assert!(challenge.validate_state("s1"));
        assert!(!challenge.validate_state("s2"));
    }
}
