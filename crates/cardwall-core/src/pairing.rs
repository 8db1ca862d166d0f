//! Payloads of biometric device pairing and biometric login

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::certificate::ApprovedCertificate;
use crate::error::{Error, Result};
use crate::types::ChallengeSession;
use crate::KEY_IDENTIFIER_LENGTH;

/// Version of the pairing data structure
pub const PAIRING_DATA_VERSION: &str = "1.0";

/// Version of the authentication data structure
pub const AUTHENTICATION_DATA_VERSION: &str = "1.0";

/// Authentication methods claimed by a biometric login
pub const BIOMETRIC_AMR: [&str; 3] = ["mfa", "hwk", "generic-biometric"];

/// Device type part of the device information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceType {
    pub product: String,
    pub model: String,
    pub os: String,
    pub os_version: String,
    pub manufacturer: String,
}

/// Device description sent with registration and authentication data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInformation {
    pub name: String,
    pub device_type: DeviceType,
}

impl Default for DeviceInformation {
    fn default() -> Self {
        Self {
            name: "Cardwall device".to_string(),
            device_type: DeviceType {
                product: "cardwall".to_string(),
                model: "generic".to_string(),
                os: std::env::consts::OS.to_string(),
                os_version: "unknown".to_string(),
                manufacturer: "unknown".to_string(),
            },
        }
    }
}

/// Ephemeral state of one biometric pairing attempt
///
/// Created only when a new device-bound credential is registered. Owned by
/// that attempt and never reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingSession {
    key_identifier: String,
    device_information: DeviceInformation,
}

impl PairingSession {
    /// Start a pairing session with a fresh random key identifier
    pub fn generate(device_information: DeviceInformation) -> Result<Self> {
        let mut identifier = [0u8; KEY_IDENTIFIER_LENGTH];
        OsRng
            .try_fill_bytes(&mut identifier)
            .map_err(|e| Error::Randomness(e.to_string()))?;

        Ok(Self {
            key_identifier: URL_SAFE_NO_PAD.encode(identifier),
            device_information,
        })
    }

    /// Base64url key identifier under which the device key is stored
    pub fn key_identifier(&self) -> &str {
        &self.key_identifier
    }

    pub fn device_information(&self) -> &DeviceInformation {
        &self.device_information
    }

    /// Pairing data binding the card certificate to the device key
    ///
    /// `device_public_key_info` is the base64url DER SubjectPublicKeyInfo of
    /// the device key.
    pub fn pairing_data(
        &self,
        certificate: &ApprovedCertificate,
        device_public_key_info: String,
    ) -> PairingData {
        PairingData {
            pairing_data_version: PAIRING_DATA_VERSION.to_string(),
            auth_cert_subject_public_key_info: certificate.public_key_info().to_string(),
            not_after: certificate.not_after().timestamp(),
            product: self.device_information.device_type.product.clone(),
            serialnumber: certificate.serial_number().to_string(),
            key_identifier: self.key_identifier.clone(),
            se_subject_public_key_info: device_public_key_info,
            issuer: certificate.issuer().to_string(),
        }
    }
}

/// Payload signed by the health card when pairing a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingData {
    pub pairing_data_version: String,
    pub auth_cert_subject_public_key_info: String,
    pub not_after: i64,
    pub product: String,
    pub serialnumber: String,
    pub key_identifier: String,
    pub se_subject_public_key_info: String,
    pub issuer: String,
}

/// Registration sent to the identity provider to pair a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationData {
    pub auth_cert: String,
    pub signed_pairing_data: String,
    pub device_information: DeviceInformation,
}

/// Payload signed by the device key for a biometric login
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationData {
    pub authentication_data_version: String,
    pub auth_cert: String,
    pub challenge_token: String,
    pub device_information: DeviceInformation,
    pub amr: Vec<String>,
    pub key_identifier: String,
    pub exp: i64,
}

impl AuthenticationData {
    /// Authentication data of a biometric login with the registered certificate
    pub fn biometric(
        certificate: &ApprovedCertificate,
        challenge: &ChallengeSession,
        device_information: DeviceInformation,
        key_identifier: impl Into<String>,
    ) -> Self {
        Self {
            authentication_data_version: AUTHENTICATION_DATA_VERSION.to_string(),
            auth_cert: certificate.base64url(),
            challenge_token: challenge.challenge().to_string(),
            device_information,
            amr: BIOMETRIC_AMR.iter().map(|s| s.to_string()).collect(),
            key_identifier: key_identifier.into(),
            exp: certificate.not_after().timestamp(),
        }
    }
}

/// Authentication data signed by the device key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedAuthenticationData {
    signed_authentication_data: String,
    original_challenge: ChallengeSession,
}

impl SignedAuthenticationData {
    pub fn new(signed_authentication_data: String, original_challenge: ChallengeSession) -> Self {
        Self {
            signed_authentication_data,
            original_challenge,
        }
    }

    /// Compact JWS over the authentication data
    pub fn signed_authentication_data(&self) -> &str {
        &self.signed_authentication_data
    }

    pub fn original_challenge(&self) -> &ChallengeSession {
        &self.original_challenge
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::fixtures::brainpool_certificate;
    use chrono::{Duration, Utc};

    #[test]
    fn test_key_identifier_is_random_32_bytes() {
        let a = PairingSession::generate(DeviceInformation::default()).unwrap();
        let b = PairingSession::generate(DeviceInformation::default()).unwrap();

        let raw = URL_SAFE_NO_PAD.decode(a.key_identifier()).unwrap();
        assert_eq!(raw.len(), KEY_IDENTIFIER_LENGTH);
        assert_ne!(a.key_identifier(), b.key_identifier());
    }

    #[test]
    fn test_pairing_data_fields() {
        let certificate = brainpool_certificate().approve().unwrap();
        let session = PairingSession::generate(DeviceInformation::default()).unwrap();
        let data = session.pairing_data(&certificate, "c2UtcHVi".to_string());

        assert_eq!(data.pairing_data_version, PAIRING_DATA_VERSION);
        assert_eq!(data.key_identifier, session.key_identifier());
        assert_eq!(data.serialnumber, certificate.serial_number());
        assert_eq!(data.not_after, certificate.not_after().timestamp());
        assert_eq!(data.product, "cardwall");

        let json = serde_json::to_value(&data).unwrap();
        assert!(json.get("authCertSubjectPublicKeyInfo").is_some());
        assert!(json.get("seSubjectPublicKeyInfo").is_some());
    }

    #[test]
    fn test_biometric_authentication_data() {
        let certificate = brainpool_certificate().approve().unwrap();
        let challenge = ChallengeSession::new(
            "challenge.jwt",
            Utc::now() + Duration::seconds(300),
            "state",
            "nonce",
            "verifier",
        );
        let data = AuthenticationData::biometric(
            &certificate,
            &challenge,
            DeviceInformation::default(),
            "key-id",
        );

        assert_eq!(data.amr, vec!["mfa", "hwk", "generic-biometric"]);
        assert_eq!(data.exp, certificate.not_after().timestamp());
        assert_eq!(data.challenge_token, "challenge.jwt");
        assert_eq!(data.auth_cert, certificate.base64url());
    }
}
