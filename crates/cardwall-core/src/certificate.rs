//! Authentication certificate (C.CH.AUT) of the health card
//!
//! Only brainpoolP256r1 ECDSA keys are approved for the authentication
//! signature. Any other algorithm is an unrecoverable signing failure and is
//! never substituted.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Utc};
use der::asn1::ObjectIdentifier;
use der::{Decode, Encode, Tag, Tagged};
use x509_cert::Certificate;

use crate::error::SigningError;
use crate::jws::JwsAlgorithm;

/// id-ecPublicKey
pub const ID_EC_PUBLIC_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");

/// brainpoolP256r1, the only approved curve
pub const BRAINPOOL_P256R1: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.36.3.3.2.8.1.1.7");

/// prime256v1 (secp256r1)
pub const PRIME256V1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.3.1.7");

/// ecdsa-with-SHA256
pub const ECDSA_WITH_SHA256: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.2");

/// Signature algorithm the card declares for its authentication key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardAlgorithm {
    /// ECDSA (PSO compute digital signature, elliptic curve)
    SignEcdsa,
    /// RSASSA-PSS
    SignPss,
    /// RSASSA-PKCS1-v1_5
    SignPkcs1V15,
}

/// Certificate as read from the card, not yet checked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutCertificate {
    der: Vec<u8>,
    algorithm: CardAlgorithm,
}

impl AutCertificate {
    pub fn new(der: Vec<u8>, algorithm: CardAlgorithm) -> Self {
        Self { der, algorithm }
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn algorithm(&self) -> CardAlgorithm {
        self.algorithm
    }

    /// Enforce the approved curve and extract the details needed for signing
    ///
    /// Fails with [`SigningError::UnsupportedAlgorithm`] before anything else
    /// when the card does not declare ECDSA, and when the certificate key is
    /// not on brainpoolP256r1.
    pub fn approve(&self) -> Result<ApprovedCertificate, SigningError> {
        if self.algorithm != CardAlgorithm::SignEcdsa {
            return Err(SigningError::UnsupportedAlgorithm);
        }
        if self.der.is_empty() {
            return Err(SigningError::MissingCertificate);
        }

        let certificate = Certificate::from_der(&self.der)
            .map_err(|e| SigningError::Certificate(e.to_string()))?;
        let tbs = &certificate.tbs_certificate;

        let spki_algorithm = &tbs.subject_public_key_info.algorithm;
        if spki_algorithm.oid != ID_EC_PUBLIC_KEY {
            return Err(SigningError::UnsupportedAlgorithm);
        }
        let curve = spki_algorithm
            .parameters
            .as_ref()
            .ok_or(SigningError::UnsupportedAlgorithm)?;
        if curve.tag() != Tag::ObjectIdentifier || curve.value() != BRAINPOOL_P256R1.as_bytes() {
            return Err(SigningError::UnsupportedAlgorithm);
        }

        let not_after_secs = tbs.validity.not_after.to_unix_duration().as_secs();
        let not_after = i64::try_from(not_after_secs)
            .ok()
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
            .ok_or_else(|| SigningError::Certificate("notAfter out of range".to_string()))?;
        let issuer = tbs
            .issuer
            .to_der()
            .map_err(|e| SigningError::Certificate(e.to_string()))?;
        let public_key_info = tbs
            .subject_public_key_info
            .to_der()
            .map_err(|e| SigningError::Certificate(e.to_string()))?;

        Ok(ApprovedCertificate {
            der: self.der.clone(),
            serial_number: hex::encode(tbs.serial_number.as_bytes()),
            issuer: URL_SAFE_NO_PAD.encode(issuer),
            public_key_info: URL_SAFE_NO_PAD.encode(public_key_info),
            not_after,
            algorithm: JwsAlgorithm::Bp256r1,
        })
    }
}

/// Certificate that passed the curve gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovedCertificate {
    der: Vec<u8>,
    serial_number: String,
    issuer: String,
    public_key_info: String,
    not_after: DateTime<Utc>,
    algorithm: JwsAlgorithm,
}

impl ApprovedCertificate {
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Certificate for a JWS `x5c` header (standard base64)
    pub fn x5c(&self) -> String {
        STANDARD.encode(&self.der)
    }

    /// Certificate as base64url, as sent in pairing and authentication data
    pub fn base64url(&self) -> String {
        URL_SAFE_NO_PAD.encode(&self.der)
    }

    /// Hex encoded serial number
    pub fn serial_number(&self) -> &str {
        &self.serial_number
    }

    /// Base64url encoded DER of the issuer name
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Base64url encoded DER of the card key's SubjectPublicKeyInfo
    pub fn public_key_info(&self) -> &str {
        &self.public_key_info
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// Signature algorithm to declare when signing with the card key
    pub fn algorithm(&self) -> JwsAlgorithm {
        self.algorithm
    }
}

/// Certificate fixtures for tests and simulators
#[cfg(any(test, feature = "mock"))]
pub mod fixtures {
    use std::str::FromStr;
    use std::time::Duration;

    use der::asn1::BitString;
    use der::{Any, Encode};
    use x509_cert::name::Name;
    use x509_cert::serial_number::SerialNumber;
    use x509_cert::spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned};
    use x509_cert::time::Validity;
    use x509_cert::{Certificate, TbsCertificate, Version};

    use super::*;

    /// Build a DER certificate with an EC key on `curve`
    ///
    /// The signature is a placeholder; nothing in the flow verifies the
    /// certificate chain.
    pub fn ec_certificate(curve: ObjectIdentifier, public_point: &[u8]) -> Vec<u8> {
        let tbs = TbsCertificate {
            version: Version::V3,
            serial_number: SerialNumber::new(&[0x01, 0x23, 0x45]).expect("serial"),
            signature: AlgorithmIdentifierOwned {
                oid: ECDSA_WITH_SHA256,
                parameters: None,
            },
            issuer: Name::from_str("CN=GEM.EGK-CA10 TEST-ONLY,O=gematik GmbH,C=DE")
                .expect("issuer"),
            validity: Validity::from_now(Duration::from_secs(5 * 365 * 24 * 3600))
                .expect("validity"),
            subject: Name::from_str("CN=Test Versicherter,C=DE").expect("subject"),
            subject_public_key_info: SubjectPublicKeyInfoOwned {
                algorithm: AlgorithmIdentifierOwned {
                    oid: ID_EC_PUBLIC_KEY,
                    parameters: Some(Any::encode_from(&curve).expect("curve")),
                },
                subject_public_key: BitString::from_bytes(public_point).expect("point"),
            },
            issuer_unique_id: None,
            subject_unique_id: None,
            extensions: None,
        };
        let certificate = Certificate {
            tbs_certificate: tbs,
            signature_algorithm: AlgorithmIdentifierOwned {
                oid: ECDSA_WITH_SHA256,
                parameters: None,
            },
            signature: BitString::from_bytes(&[0u8; 64]).expect("signature"),
        };
        certificate.to_der().expect("certificate encoding")
    }

    /// Authentication certificate on the approved curve
    pub fn brainpool_certificate() -> AutCertificate {
        let mut point = [0x11u8; 65];
        point[0] = 0x04;
        AutCertificate::new(
            ec_certificate(BRAINPOOL_P256R1, &point),
            CardAlgorithm::SignEcdsa,
        )
    }

    /// Authentication certificate on prime256v1, which the gate rejects
    pub fn prime256_certificate() -> AutCertificate {
        let mut point = [0x22u8; 65];
        point[0] = 0x04;
        AutCertificate::new(ec_certificate(PRIME256V1, &point), CardAlgorithm::SignEcdsa)
    }
}
