//! Error taxonomy of the card authentication flow
//!
//! Errors are layered the same way the flow is: transport failures of the
//! card reader, PIN verification outcomes, signing failures, secure enclave
//! failures, identity provider failures and profile validation failures.
//! The engine folds everything that happens on the card into
//! [`CardAuthError`], and the login flow folds everything into
//! [`LoginError`], which is what the recovery policy classifies.
//!
//! Every user-facing error offers a `description()` and a
//! `recovery_suggestion()`.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by core helpers that are not part of the flow taxonomy
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Certificate could not be decoded or encoded
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// Random number generation failed
    #[error("Randomness error: {0}")]
    Randomness(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Status word returned by the card for a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResponseStatus(pub u16);

impl ResponseStatus {
    pub const SUCCESS: Self = Self(0x9000);
    pub const SECURITY_STATUS_NOT_SATISFIED: Self = Self(0x6982);
    pub const KEY_INVALID: Self = Self(0x6A88);
    pub const WRONG_CIPHER_TEXT: Self = Self(0x6A80);
    pub const UNKNOWN: Self = Self(0x6F00);

    /// Build from the two trailing status bytes of a response
    pub fn from_bytes(sw1: u8, sw2: u8) -> Self {
        Self(u16::from_be_bytes([sw1, sw2]))
    }

    pub fn is_success(&self) -> bool {
        *self == Self::SUCCESS
    }
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

/// Failures reported by the platform NFC stack
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NfcError {
    /// The card left the field while a command was in flight
    #[error("Tag connection lost")]
    TagConnectionLost,

    /// The reader session ran into the system timeout
    #[error("Session timeout")]
    SessionTimeout,

    /// The reader session was invalidated by the system or the user
    #[error("Session invalidated")]
    SessionInvalidated,

    /// The device does not support reading health cards
    #[error("Feature not supported")]
    UnsupportedFeature,

    /// Anything else the NFC stack reports
    #[error("NFC error: {0}")]
    Other(String),
}

impl NfcError {
    pub fn description(&self) -> String {
        match self {
            NfcError::TagConnectionLost => "The connection to the card was lost.".to_string(),
            NfcError::SessionTimeout => "The card reading session timed out.".to_string(),
            NfcError::SessionInvalidated => "The card reading session was closed.".to_string(),
            NfcError::UnsupportedFeature => {
                "This device does not support reading health cards.".to_string()
            }
            NfcError::Other(_) => "The card could not be read.".to_string(),
        }
    }

    pub fn recovery_suggestion(&self) -> String {
        match self {
            NfcError::TagConnectionLost => {
                "Hold the card still against the top of the device and try again.".to_string()
            }
            NfcError::SessionTimeout | NfcError::SessionInvalidated => "Please try again.".to_string(),
            NfcError::UnsupportedFeature => {
                "Use a device with NFC support or choose another login method.".to_string()
            }
            NfcError::Other(_) => {
                "Please try again. If the problem persists, send us an error report.".to_string()
            }
        }
    }
}

/// Failures of the card reader session itself
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The reader session could not be started
    #[error("Could not initialize the NFC session")]
    CouldNotInitializeSession,

    /// No card was found in the field
    #[error("No card present")]
    NoCardPresent,

    /// The card rejected the card access number while opening the secure channel
    #[error("Wrong CAN")]
    WrongCan,

    /// Error of the platform NFC stack
    #[error("{0}")]
    Nfc(#[from] NfcError),

    /// Establishing the secure channel failed for another reason
    #[error("Secure channel could not be established: {0}")]
    SecureChannel(String),

    /// A card command failed
    #[error("Card operation failed: {0}")]
    Operation(String),
}

/// Outcome of a PIN verification other than success
///
/// The retry count is echoed from the card's own response and is never
/// computed locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VerifyPinError {
    /// Wrong PIN; `retry_count` attempts are left before the card blocks
    #[error("Wrong PIN ({retry_count} attempts remaining)")]
    WrongSecretWarning { retry_count: u8 },

    /// Access rule evaluation failed
    #[error("Security status not satisfied")]
    SecurityStatusNotSatisfied,

    /// Write action on the card was unsuccessful
    #[error("Memory failure")]
    MemoryFailure,

    /// Retry counter is exhausted
    #[error("Password blocked")]
    PasswordBlocked,

    /// Password is still transport protected
    #[error("Password not usable")]
    PasswordNotUsable,

    /// Referenced password could not be found
    #[error("Password not found")]
    PasswordNotFound,

    /// Any unexpected verification failure
    #[error("Unknown failure")]
    UnknownFailure,
}

impl VerifyPinError {
    /// Whether the card is now blocked for PIN entry
    pub fn is_card_blocked(&self) -> bool {
        matches!(
            self,
            VerifyPinError::PasswordBlocked | VerifyPinError::WrongSecretWarning { retry_count: 0 }
        )
    }

    /// Retry count echoed by the card, if this outcome carries one
    pub fn retry_count(&self) -> Option<u8> {
        match self {
            VerifyPinError::WrongSecretWarning { retry_count } => Some(*retry_count),
            _ => None,
        }
    }

    pub fn description(&self) -> String {
        match self {
            e if e.is_card_blocked() => "Your card is locked.".to_string(),
            VerifyPinError::WrongSecretWarning { .. } => "Incorrect PIN.".to_string(),
            VerifyPinError::SecurityStatusNotSatisfied => {
                "The card denied access to the requested data.".to_string()
            }
            VerifyPinError::MemoryFailure => "The card could not store the data.".to_string(),
            VerifyPinError::PasswordNotUsable => "You have not set your own PIN yet.".to_string(),
            VerifyPinError::PasswordNotFound => "The card has no PIN.".to_string(),
            _ => "The card reported an unknown error.".to_string(),
        }
    }

    pub fn recovery_suggestion(&self) -> String {
        match self {
            e if e.is_card_blocked() => {
                "Unlock the card with the PUK you received from your health insurance.".to_string()
            }
            VerifyPinError::WrongSecretWarning { retry_count } => format!(
                "Please correct your PIN. You have {} attempts left.",
                retry_count
            ),
            VerifyPinError::SecurityStatusNotSatisfied => {
                "Please contact your health insurance.".to_string()
            }
            VerifyPinError::MemoryFailure => {
                "The card may be damaged. Please contact your health insurance.".to_string()
            }
            VerifyPinError::PasswordNotUsable => {
                "Set your own PIN with the transport PIN from your health insurance.".to_string()
            }
            VerifyPinError::PasswordNotFound => {
                "Please contact your health insurance.".to_string()
            }
            _ => "Please try again. If the problem persists, send us an error report.".to_string(),
        }
    }
}

/// Failures while signing with the authentication key
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SigningError {
    /// Certificate or card key does not use the approved curve
    #[error("Unsupported Algorithm")]
    UnsupportedAlgorithm,

    /// The card rejected the signing command
    #[error("Signing failed with status: {0}")]
    ResponseStatus(ResponseStatus),

    /// The certificate could not be decoded
    #[error("Unable to construct the certificate: {0}")]
    Certificate(String),

    /// The card returned no certificate
    #[error("missing certificate")]
    MissingCertificate,
}

/// Failures of the device-bound key store
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecureEnclaveError {
    /// Key store failure not covered below
    #[error("Secure enclave internal error: {0}")]
    Internal(String),

    /// The device key could not be created or loaded
    #[error("Fetching the device key failed: {0}")]
    FetchingPrivateKey(String),

    /// No certificate is registered for biometric login
    #[error("Packaging the authentication certificate failed")]
    PackagingAuthCertificate,

    /// Signing with the device key failed
    #[error("Signing with the device key failed: {0}")]
    Signing(String),

    /// A new pairing can only be signed by a health card
    #[error("Pairing requires a health card")]
    PairingRequiresCard,
}

/// Unified error of the card authentication engine
///
/// No transport or card error leaves the engine without being wrapped into
/// one of these variants.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CardAuthError {
    /// Error while establishing a connection to the card
    #[error("Card error: {0}")]
    Card(NfcError),

    /// The card rejected the CAN
    #[error("Wrong CAN")]
    WrongCan,

    /// Error while establishing the secure channel or card connection
    #[error("Card connection error: {0}")]
    CardConnection(TransportError),

    /// Any PIN verification failure
    #[error("{0}")]
    VerifyCard(#[from] VerifyPinError),

    /// Signing the challenge failed
    #[error("Signing failure: {0}")]
    Signing(#[from] SigningError),

    /// Generic error while signing the challenge
    #[error("Generic card error: {0}")]
    Generic(String),

    /// Generic error while reading from the card
    #[error("Card reading error: {0}")]
    CardReading(String),

    /// Error of the device-bound key store during pairing
    #[error("Secure enclave error: {0}")]
    SecureEnclave(#[from] SecureEnclaveError),

    /// Error of the NFC card session
    #[error("NFC session error: {0}")]
    Session(TransportError),
}

impl CardAuthError {
    /// Fold a failure of the card session into the engine taxonomy
    pub fn from_transport(error: TransportError) -> Self {
        match error {
            TransportError::WrongCan => CardAuthError::WrongCan,
            TransportError::Nfc(nfc) => CardAuthError::Card(nfc),
            TransportError::SecureChannel(_) => CardAuthError::CardConnection(error),
            other => CardAuthError::Session(other),
        }
    }

    /// The platform NFC error at the root of this failure, if any
    pub fn nfc_error(&self) -> Option<&NfcError> {
        match self {
            CardAuthError::Card(nfc)
            | CardAuthError::CardConnection(TransportError::Nfc(nfc))
            | CardAuthError::Session(TransportError::Nfc(nfc)) => Some(nfc),
            _ => None,
        }
    }

    pub fn is_tag_connection_lost(&self) -> bool {
        matches!(self.nfc_error(), Some(NfcError::TagConnectionLost))
    }

    pub fn description(&self) -> String {
        match self {
            CardAuthError::WrongCan => "Incorrect access number (CAN).".to_string(),
            CardAuthError::SecureEnclave(_) => {
                "The secure storage of this device could not be used.".to_string()
            }
            CardAuthError::VerifyCard(pin) => pin.description(),
            other => match other.nfc_error() {
                Some(nfc) => nfc.description(),
                None => "The card could not be read.".to_string(),
            },
        }
    }

    pub fn recovery_suggestion(&self) -> String {
        match self {
            CardAuthError::WrongCan => {
                "Please correct the six digit access number printed on your card.".to_string()
            }
            CardAuthError::VerifyCard(pin) => pin.recovery_suggestion(),
            other => match other.nfc_error() {
                Some(nfc) => nfc.recovery_suggestion(),
                None => "Please try again. If the problem persists, send us an error report."
                    .to_string(),
            },
        }
    }
}

/// Errors returned by the profile-scoped identity token validator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProfileValidationError {
    /// The profile of the attempt no longer exists
    #[error("Profile not found")]
    ProfileNotFound,

    /// The identity belongs to another insurance number than the profile
    #[error("Profile does not match insurance id {0}")]
    NotMatchingInsuranceId(String),

    /// Another profile is already connected to this insurance number
    #[error("Another profile with insurance id {0} exists")]
    InsuranceIdExists(String),

    /// The validator rejected the identity without a reason
    #[error("Identity token rejected")]
    Rejected,

    /// Validator failure
    #[error("Profile validation failed: {0}")]
    Other(String),
}

impl ProfileValidationError {
    pub fn description(&self) -> String {
        match self {
            ProfileValidationError::NotMatchingInsuranceId(_) => {
                "The card belongs to another person than this profile.".to_string()
            }
            ProfileValidationError::InsuranceIdExists(_) => {
                "This card is already connected to another profile.".to_string()
            }
            _ => "The profile could not be validated.".to_string(),
        }
    }

    pub fn recovery_suggestion(&self) -> String {
        match self {
            ProfileValidationError::NotMatchingInsuranceId(_) => {
                "Log in with the card of this profile or create a new profile.".to_string()
            }
            ProfileValidationError::InsuranceIdExists(_) => {
                "Use the existing profile for this card.".to_string()
            }
            _ => "Please try again.".to_string(),
        }
    }
}

/// Underlying cause of an unspecified identity provider failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnspecifiedCause {
    #[error("{0}")]
    ProfileValidation(ProfileValidationError),

    #[error("{0}")]
    Other(String),
}

/// Error body returned by the identity provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerResponse {
    pub error: String,
    #[serde(rename = "gematik_error_text")]
    pub error_text: String,
    #[serde(rename = "gematik_timestamp")]
    pub timestamp: i64,
    #[serde(rename = "gematik_uuid")]
    pub uuid: String,
    #[serde(rename = "gematik_code")]
    pub code: String,
}

impl fmt::Display for ServerResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Error: {}\n{}: {}\nError-ID: {}",
            self.code, self.error, self.error_text, self.uuid
        )
    }
}

/// Errors of the identity provider protocol
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdpError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("No token available")]
    TokenUnavailable,

    #[error("{0}")]
    Unspecified(UnspecifiedCause),

    #[error("Decoding error: {0}")]
    Decoding(String),

    #[error("No certificate found in discovery document")]
    NoCertificateFound,

    #[error("Invalid discovery document")]
    InvalidDiscoveryDocument,

    #[error("Invalid state parameter")]
    InvalidStateParameter,

    #[error("Invalid nonce")]
    InvalidNonce,

    #[error("Unsupported method {0:?}")]
    Unsupported(Option<String>),

    #[error("Encryption failed")]
    Encryption,

    #[error("Decryption failed")]
    Decryption,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Trust store error: {0}")]
    TrustStore(String),

    #[error("Pairing error: {0}")]
    Pairing(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Server error '{0}'")]
    ServerError(ServerResponse),

    #[error("Error running biometrics: {0}")]
    Biometrics(SecureEnclaveError),
}

impl IdpError {
    /// Profile validation failure hidden inside an unspecified error
    pub fn profile_validation_cause(&self) -> Option<&ProfileValidationError> {
        match self {
            IdpError::Unspecified(UnspecifiedCause::ProfileValidation(e)) => Some(e),
            _ => None,
        }
    }
}

/// Errors in the user input of an authentication attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InputError {
    /// PIN missing or not 4 to 12 digits
    #[error("PIN is missing or malformed")]
    MissingPin,

    /// CAN missing or not 6 digits
    #[error("CAN is missing or malformed")]
    MissingCan,
}

/// Error of one login attempt as surfaced to the caller
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoginError {
    /// Identity provider failure
    #[error("idpError: {0}")]
    Idp(IdpError),

    /// Invalid user input
    #[error("{0}")]
    Input(InputError),

    /// Card authentication failure
    #[error("cardError: {0}")]
    SignChallenge(CardAuthError),

    /// Failure of the biometric key store before signing started
    #[error("biometrics error: {0}")]
    Biometrics(SecureEnclaveError),

    /// The identity does not fit the active profile
    #[error("validation error: {0}")]
    ProfileValidation(ProfileValidationError),
}

impl LoginError {
    /// Build from an identity provider error, lifting profile validation causes
    pub fn from_idp(error: IdpError) -> Self {
        match error.profile_validation_cause() {
            Some(validation) => LoginError::ProfileValidation(validation.clone()),
            None => LoginError::Idp(error),
        }
    }

    pub fn card_error(&self) -> Option<&CardAuthError> {
        match self {
            LoginError::SignChallenge(e) => Some(e),
            _ => None,
        }
    }

    pub fn verify_pin_error(&self) -> Option<VerifyPinError> {
        match self {
            LoginError::SignChallenge(CardAuthError::VerifyCard(e)) => Some(*e),
            _ => None,
        }
    }

    pub fn nfc_error(&self) -> Option<&NfcError> {
        self.card_error().and_then(CardAuthError::nfc_error)
    }

    pub fn is_tag_connection_lost(&self) -> bool {
        self.card_error()
            .map(CardAuthError::is_tag_connection_lost)
            .unwrap_or(false)
    }

    pub fn description(&self) -> String {
        match self {
            LoginError::Idp(e) => e.to_string(),
            LoginError::Input(InputError::MissingCan) => {
                "The access number (CAN) is missing.".to_string()
            }
            LoginError::Input(InputError::MissingPin) => "The PIN is missing.".to_string(),
            LoginError::SignChallenge(e) => e.description(),
            LoginError::Biometrics(e) => e.to_string(),
            LoginError::ProfileValidation(e) => e.description(),
        }
    }

    pub fn recovery_suggestion(&self) -> String {
        match self {
            LoginError::Idp(_) | LoginError::Biometrics(_) => {
                "Please try again later.".to_string()
            }
            LoginError::Input(InputError::MissingCan) => {
                "Enter the six digit access number printed on your card.".to_string()
            }
            LoginError::Input(InputError::MissingPin) => {
                "Enter the PIN you received from your health insurance.".to_string()
            }
            LoginError::SignChallenge(e) => e.recovery_suggestion(),
            LoginError::ProfileValidation(e) => e.recovery_suggestion(),
        }
    }
}

impl From<CardAuthError> for LoginError {
    fn from(e: CardAuthError) -> Self {
        LoginError::SignChallenge(e)
    }
}

impl From<InputError> for LoginError {
    fn from(e: InputError) -> Self {
        LoginError::Input(e)
    }
}

impl From<ProfileValidationError> for LoginError {
    fn from(e: ProfileValidationError) -> Self {
        LoginError::ProfileValidation(e)
    }
}

impl From<IdpError> for LoginError {
    fn from(e: IdpError) -> Self {
        LoginError::from_idp(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrong_secret_with_zero_retries_is_blocked() {
        assert!(VerifyPinError::WrongSecretWarning { retry_count: 0 }.is_card_blocked());
        assert!(VerifyPinError::PasswordBlocked.is_card_blocked());
        assert!(!VerifyPinError::WrongSecretWarning { retry_count: 1 }.is_card_blocked());
    }

    #[test]
    fn test_retry_count_is_echoed_in_suggestion() {
        let err = VerifyPinError::WrongSecretWarning { retry_count: 2 };
        assert_eq!(err.retry_count(), Some(2));
        assert!(err.recovery_suggestion().contains("2 attempts"));
        assert_eq!(err.description(), "Incorrect PIN.");
    }

    #[test]
    fn test_transport_error_folding() {
        assert_eq!(
            CardAuthError::from_transport(TransportError::WrongCan),
            CardAuthError::WrongCan
        );
        assert_eq!(
            CardAuthError::from_transport(TransportError::Nfc(NfcError::TagConnectionLost)),
            CardAuthError::Card(NfcError::TagConnectionLost)
        );
        assert!(matches!(
            CardAuthError::from_transport(TransportError::NoCardPresent),
            CardAuthError::Session(TransportError::NoCardPresent)
        ));
    }

    #[test]
    fn test_tag_loss_detected_through_wrappers() {
        let nested = CardAuthError::Session(TransportError::Nfc(NfcError::TagConnectionLost));
        assert!(nested.is_tag_connection_lost());
        assert!(LoginError::SignChallenge(nested).is_tag_connection_lost());
        assert!(!CardAuthError::WrongCan.is_tag_connection_lost());
    }

    #[test]
    fn test_unspecified_profile_validation_is_lifted() {
        let idp = IdpError::Unspecified(UnspecifiedCause::ProfileValidation(
            ProfileValidationError::NotMatchingInsuranceId("X110".to_string()),
        ));
        assert_eq!(
            LoginError::from(idp),
            LoginError::ProfileValidation(ProfileValidationError::NotMatchingInsuranceId(
                "X110".to_string()
            ))
        );

        let other = IdpError::Unspecified(UnspecifiedCause::Other("boom".to_string()));
        assert!(matches!(LoginError::from(other), LoginError::Idp(_)));
    }

    #[test]
    fn test_response_status_display() {
        assert_eq!(ResponseStatus::from_bytes(0x69, 0x82).to_string(), "6982");
        assert!(ResponseStatus::SUCCESS.is_success());
    }
}
