//! Device-bound keys for biometric pairing and login
//!
//! [`DeviceRegistration`] owns the pairing lifecycle on the device: it
//! creates a key per pairing session, builds the pairing data the health
//! card signs, remembers the registered certificate and key identifier, and
//! signs authentication data for biometric logins with the device key.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use cardwall_core::{
    ApprovedCertificate, AuthenticationData, AutCertificate, CardAlgorithm, ChallengeSession,
    DeviceInformation, JwsAlgorithm, JwsHeader, JwsSigningInput, PairingSession,
    RegistrationData, SecureEnclaveError, SignedAuthenticationData,
};
use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::ecdsa::{Signature, SigningKey};
use p256::pkcs8::EncodePublicKey;
use rand::rngs::OsRng;
use tracing::{debug, info, warn};

use crate::signer::RegistrationDataProvider;

/// Key store holding device-bound P-256 keys
pub trait SecureEnclave: Send + Sync {
    /// Create a key under `identifier`, replacing any previous one
    fn generate_key(&self, identifier: &str) -> Result<(), SecureEnclaveError>;

    /// DER SubjectPublicKeyInfo of the key
    fn public_key_info(&self, identifier: &str) -> Result<Vec<u8>, SecureEnclaveError>;

    /// Sign a SHA-256 digest; returns raw `r || s`
    fn sign_digest(&self, identifier: &str, digest: &[u8])
        -> Result<Vec<u8>, SecureEnclaveError>;

    /// Delete the key; deleting a missing key is not an error
    fn delete_key(&self, identifier: &str) -> Result<(), SecureEnclaveError>;
}

/// In-memory P-256 key store for devices without hardware backing and for tests
#[derive(Default)]
pub struct SoftwareEnclave {
    keys: Mutex<HashMap<String, SigningKey>>,
}

impl SoftwareEnclave {
    pub fn new() -> Self {
        Self::default()
    }

    fn keys(&self) -> MutexGuard<'_, HashMap<String, SigningKey>> {
        self.keys.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn key(&self, identifier: &str) -> Result<SigningKey, SecureEnclaveError> {
        self.keys()
            .get(identifier)
            .cloned()
            .ok_or_else(|| SecureEnclaveError::FetchingPrivateKey(identifier.to_string()))
    }
}

impl SecureEnclave for SoftwareEnclave {
    fn generate_key(&self, identifier: &str) -> Result<(), SecureEnclaveError> {
        let key = SigningKey::random(&mut OsRng);
        self.keys().insert(identifier.to_string(), key);
        Ok(())
    }

    fn public_key_info(&self, identifier: &str) -> Result<Vec<u8>, SecureEnclaveError> {
        let key = self.key(identifier)?;
        let document = key
            .verifying_key()
            .to_public_key_der()
            .map_err(|e| SecureEnclaveError::Internal(e.to_string()))?;
        Ok(document.as_bytes().to_vec())
    }

    fn sign_digest(
        &self,
        identifier: &str,
        digest: &[u8],
    ) -> Result<Vec<u8>, SecureEnclaveError> {
        let key = self.key(identifier)?;
        let signature: Signature = key
            .sign_prehash(digest)
            .map_err(|e| SecureEnclaveError::Signing(e.to_string()))?;
        Ok(signature.to_bytes().to_vec())
    }

    fn delete_key(&self, identifier: &str) -> Result<(), SecureEnclaveError> {
        self.keys().remove(identifier);
        Ok(())
    }
}

/// Persistent storage of the registered certificate and key identifier
pub trait CertificateStore: Send + Sync {
    fn certificate(&self) -> Option<Vec<u8>>;
    fn set_certificate(&self, der: Option<Vec<u8>>);
    fn key_identifier(&self) -> Option<String>;
    fn set_key_identifier(&self, identifier: Option<String>);
}

/// Certificate store kept in memory
#[derive(Debug, Default)]
pub struct MemoryCertificateStore {
    certificate: Mutex<Option<Vec<u8>>>,
    key_identifier: Mutex<Option<String>>,
}

impl MemoryCertificateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl CertificateStore for MemoryCertificateStore {
    fn certificate(&self) -> Option<Vec<u8>> {
        lock(&self.certificate).clone()
    }

    fn set_certificate(&self, der: Option<Vec<u8>>) {
        *lock(&self.certificate) = der;
    }

    fn key_identifier(&self) -> Option<String> {
        lock(&self.key_identifier).clone()
    }

    fn set_key_identifier(&self, identifier: Option<String>) {
        *lock(&self.key_identifier) = identifier;
    }
}

/// Biometric registration backed by a secure enclave
pub struct DeviceRegistration {
    enclave: Arc<dyn SecureEnclave>,
    store: Arc<dyn CertificateStore>,
    device: DeviceInformation,
}

impl DeviceRegistration {
    pub fn new(
        enclave: Arc<dyn SecureEnclave>,
        store: Arc<dyn CertificateStore>,
        device: DeviceInformation,
    ) -> Self {
        Self {
            enclave,
            store,
            device,
        }
    }

    /// Certificate stored by the last completed pairing
    pub fn registered_aut_certificate(&self) -> Result<AutCertificate, SecureEnclaveError> {
        let der = self
            .store
            .certificate()
            .ok_or(SecureEnclaveError::PackagingAuthCertificate)?;
        Ok(AutCertificate::new(der, CardAlgorithm::SignEcdsa))
    }

    /// Registered certificate, approved again on every use
    pub fn registered_certificate(&self) -> Result<ApprovedCertificate, SecureEnclaveError> {
        self.registered_aut_certificate()?
            .approve()
            .map_err(|_| SecureEnclaveError::PackagingAuthCertificate)
    }

    /// Key identifier of the registered device key
    pub fn registered_key_identifier(&self) -> Result<String, SecureEnclaveError> {
        self.store
            .key_identifier()
            .ok_or_else(|| SecureEnclaveError::FetchingPrivateKey("no key identifier".into()))
    }

    /// Sign `input` with the registered device key
    pub fn sign_with_device_key(
        &self,
        input: &JwsSigningInput,
    ) -> Result<Vec<u8>, SecureEnclaveError> {
        let identifier = self.registered_key_identifier()?;
        self.enclave.sign_digest(&identifier, &input.digest())
    }
}

impl RegistrationDataProvider for DeviceRegistration {
    fn create_pairing_session(&self) -> Result<PairingSession, SecureEnclaveError> {
        let pairing = PairingSession::generate(self.device.clone())
            .map_err(|e| SecureEnclaveError::Internal(e.to_string()))?;
        self.enclave.generate_key(pairing.key_identifier())?;
        info!("Pairing session created");
        Ok(pairing)
    }

    fn pairing_signing_input(
        &self,
        pairing: &PairingSession,
        certificate: &ApprovedCertificate,
    ) -> Result<JwsSigningInput, SecureEnclaveError> {
        let device_key = self.enclave.public_key_info(pairing.key_identifier())?;
        let pairing_data = pairing.pairing_data(certificate, URL_SAFE_NO_PAD.encode(device_key));
        JwsSigningInput::new(&JwsHeader::jwt(certificate.algorithm()), &pairing_data)
            .map_err(|e| SecureEnclaveError::Internal(e.to_string()))
    }

    fn complete_pairing(
        &self,
        pairing: &PairingSession,
        certificate: &ApprovedCertificate,
        signed_pairing_data: String,
    ) -> Result<RegistrationData, SecureEnclaveError> {
        self.store.set_certificate(Some(certificate.der().to_vec()));
        self.store
            .set_key_identifier(Some(pairing.key_identifier().to_string()));
        debug!("Registered certificate {}", certificate.serial_number());

        Ok(RegistrationData {
            auth_cert: certificate.base64url(),
            signed_pairing_data,
            device_information: pairing.device_information().clone(),
        })
    }

    fn abort(&self, pairing: &PairingSession) -> Result<(), SecureEnclaveError> {
        self.store.set_certificate(None);
        self.store.set_key_identifier(None);
        self.enclave.delete_key(pairing.key_identifier())?;
        warn!("Pairing session aborted");
        Ok(())
    }

    fn authentication_data(
        &self,
        challenge: &ChallengeSession,
    ) -> Result<SignedAuthenticationData, SecureEnclaveError> {
        let certificate = self.registered_certificate()?;
        let identifier = self.registered_key_identifier()?;

        let data = AuthenticationData::biometric(
            &certificate,
            challenge,
            self.device.clone(),
            identifier.clone(),
        );
        let input = JwsSigningInput::new(&JwsHeader::jwt(JwsAlgorithm::Es256), &data)
            .map_err(|e| SecureEnclaveError::Internal(e.to_string()))?;
        let signature = self.enclave.sign_digest(&identifier, &input.digest())?;

        debug!("Authentication data signed with device key");
        Ok(SignedAuthenticationData::new(
            input.finish(&signature),
            challenge.clone(),
        ))
    }

    fn is_biometrics_registered(&self) -> bool {
        self.store.certificate().is_some() && self.store.key_identifier().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cardwall_core::certificate::fixtures::brainpool_certificate;
    use chrono::{Duration, Utc};
    use p256::ecdsa::signature::hazmat::PrehashVerifier;
    use p256::ecdsa::VerifyingKey;
    use p256::pkcs8::DecodePublicKey;

    fn registration() -> (Arc<SoftwareEnclave>, DeviceRegistration) {
        let enclave = Arc::new(SoftwareEnclave::new());
        let registration = DeviceRegistration::new(
            enclave.clone(),
            Arc::new(MemoryCertificateStore::new()),
            DeviceInformation::default(),
        );
        (enclave, registration)
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

    #[test]
    fn test_software_enclave_signature_verifies() {
        let enclave = SoftwareEnclave::new();
        enclave.generate_key("k").unwrap();

        let digest = [7u8; 32];
        let signature = enclave.sign_digest("k", &digest).unwrap();
        assert_eq!(signature.len(), 64);

        let spki = enclave.public_key_info("k").unwrap();
        let verifying = VerifyingKey::from_public_key_der(&spki).unwrap();
        let signature = Signature::from_slice(&signature).unwrap();
        assert!(verifying.verify_prehash(&digest, &signature).is_ok());
    }

    #[test]
    fn test_missing_key() {
        let enclave = SoftwareEnclave::new();
        assert!(matches!(
            enclave.sign_digest("missing", &[0u8; 32]),
            Err(SecureEnclaveError::FetchingPrivateKey(_))
        ));
        assert!(enclave.delete_key("missing").is_ok());
    }

    #[test]
    fn test_pairing_lifecycle() {
        let (enclave, registration) = registration();
        let certificate = brainpool_certificate().approve().unwrap();

        let pairing = registration.create_pairing_session().unwrap();
        assert!(enclave.public_key_info(pairing.key_identifier()).is_ok());
        assert!(!registration.is_biometrics_registered());

        let input = registration
            .pairing_signing_input(&pairing, &certificate)
            .unwrap();
        let data = registration
            .complete_pairing(&pairing, &certificate, input.finish(&[1u8; 64]))
            .unwrap();
        assert_eq!(data.auth_cert, certificate.base64url());
        assert!(registration.is_biometrics_registered());

        registration.abort(&pairing).unwrap();
        assert!(!registration.is_biometrics_registered());
        assert!(enclave.public_key_info(pairing.key_identifier()).is_err());
    }

    #[test]
    fn test_pairing_data_is_declared_bp256r1() {
        let (_, registration) = registration();
        let certificate = brainpool_certificate().approve().unwrap();
        let pairing = registration.create_pairing_session().unwrap();

        let input = registration
            .pairing_signing_input(&pairing, &certificate)
            .unwrap();
        let header = input.as_str().split('.').next().unwrap();
        let header: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(header).unwrap()).unwrap();
        assert_eq!(header["alg"], "BP256R1");
    }

    #[test]
    fn test_authentication_data_requires_registration() {
        let (_, registration) = registration();
        assert_eq!(
            registration.authentication_data(&challenge()),
            Err(SecureEnclaveError::PackagingAuthCertificate)
        );
    }

    #[test]
    fn test_authentication_data_signed_es256() {
        let (_, registration) = registration();
        let certificate = brainpool_certificate().approve().unwrap();
        let pairing = registration.create_pairing_session().unwrap();
        registration
            .complete_pairing(&pairing, &certificate, "signed".to_string())
            .unwrap();

        let signed = registration.authentication_data(&challenge()).unwrap();
        let parts: Vec<&str> = signed.signed_authentication_data().split('.').collect();
        assert_eq!(parts.len(), 3);

        let payload: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(parts[1]).unwrap()).unwrap();
        assert_eq!(payload["keyIdentifier"], pairing.key_identifier());
        assert_eq!(payload["amr"][2], "generic-biometric");
        assert_eq!(payload["challengeToken"], "challenge.jwt");
    }
}
