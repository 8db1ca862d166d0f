//! Signer substitution tests
//!
//! The engine drives the physical card, the virtual card and the device key
//! through the same session contract. These tests check that configuration
//! alone selects the signer and that the curve gate holds for each.

use std::sync::Arc;

use cardwall::mock::{MockCard, MockRegistration, MockSoftwareKey, MockTransport};
use cardwall::{
    session_opener, AuthState, CardAuthEngine, CardwallError,
    DeviceRegistration, EngineConfig, MemoryCertificateStore, RegistrationDataProvider,
    SignerMode, SoftwareEnclave, VirtualCard,
};
use cardwall_core::certificate::fixtures::{brainpool_certificate, prime256_certificate};
use cardwall_core::{
    Can, CardAuthError, ChallengeSession, DeviceInformation, DiagnosticContext, Pin,
    SigningError,
};
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

fn can() -> Can {
    Can::parse("123456").unwrap()
}

fn pin() -> Pin {
    Pin::parse("1234").unwrap()
}

struct Signers {
    transport: MockTransport,
    key: Arc<MockSoftwareKey>,
    virtual_card: VirtualCard,
}

fn signers() -> Signers {
    let key = Arc::new(MockSoftwareKey::new());
    Signers {
        transport: MockTransport::new(MockCard::new(brainpool_certificate())),
        virtual_card: VirtualCard::new(brainpool_certificate(), key.clone()),
        key,
    }
}

fn engine_for(config: &EngineConfig, s: &Signers) -> Result<CardAuthEngine, CardwallError> {
    let opener = session_opener(
        config,
        Arc::new(s.transport.clone()),
        Some(s.virtual_card.clone()),
        None,
    )?;
    Ok(CardAuthEngine::new(
        opener,
        Arc::new(DiagnosticContext::new()),
        config,
    ))
}

#[tokio::test]
async fn test_default_configuration_uses_the_card() {
    let s = signers();
    let engine = engine_for(&EngineConfig::testing(), &s).unwrap();

    engine.sign(&can(), &pin(), &challenge()).await.unwrap();

    assert_eq!(s.transport.open_calls(), 1);
    assert_eq!(s.transport.card().sign_calls(), 1);
    assert_eq!(s.key.sign_calls(), 0);
}

#[tokio::test]
async fn test_virtual_card_only_when_configured() {
    let s = signers();
    let config = EngineConfig {
        signer: SignerMode::Virtual,
        ..EngineConfig::testing()
    };
    let engine = engine_for(&config, &s).unwrap();

    let signed = engine.sign(&can(), &pin(), &challenge()).await.unwrap();

    assert_eq!(signed.signed_challenge().split('.').count(), 3);
    assert_eq!(engine.state(), AuthState::Done);
    assert_eq!(s.transport.open_calls(), 0);
    assert_eq!(s.key.sign_calls(), 1);
}

#[tokio::test]
async fn test_virtual_card_selected_from_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("engine.json");
    std::fs::write(&path, r#"{ "signer": "virtual", "success_teardown_delay_ms": 0 }"#).unwrap();

    let config = EngineConfig::load(&path).unwrap();
    let s = signers();
    let engine = engine_for(&config, &s).unwrap();

    engine.sign(&can(), &pin(), &challenge()).await.unwrap();
    assert_eq!(s.key.sign_calls(), 1);
    assert_eq!(s.transport.open_calls(), 0);
}

#[test]
fn test_virtual_mode_without_card_is_a_config_error() {
    let config = EngineConfig {
        signer: SignerMode::Virtual,
        ..EngineConfig::testing()
    };
    let transport = MockTransport::new(MockCard::new(brainpool_certificate()));

    let result = session_opener(&config, Arc::new(transport), None, None);
    assert!(matches!(result, Err(CardwallError::Config(_))));
}

#[test]
fn test_biometric_mode_without_registration_is_a_config_error() {
    let config = EngineConfig {
        signer: SignerMode::Biometric,
        ..EngineConfig::testing()
    };
    let transport = MockTransport::new(MockCard::new(brainpool_certificate()));

    let result = session_opener(&config, Arc::new(transport), None, None);
    assert!(matches!(result, Err(CardwallError::Config(_))));
}

#[tokio::test]
async fn test_curve_gate_applies_to_every_signer() {
    let config = EngineConfig::testing();
    let gate = Err(CardAuthError::Signing(SigningError::UnsupportedAlgorithm));

    // Physical card
    let transport = MockTransport::new(MockCard::new(prime256_certificate()));
    let opener = session_opener(&config, Arc::new(transport.clone()), None, None).unwrap();
    let engine = CardAuthEngine::new(opener, Arc::new(DiagnosticContext::new()), &config);
    assert_eq!(
        engine.sign(&can(), &pin(), &challenge()).await.map(|_| ()),
        gate
    );
    assert_eq!(transport.card().sign_calls(), 0);

    // Virtual card
    let key = Arc::new(MockSoftwareKey::new());
    let engine = CardAuthEngine::new(
        Arc::new(VirtualCard::new(prime256_certificate(), key.clone())),
        Arc::new(DiagnosticContext::new()),
        &config,
    );
    assert_eq!(
        engine.sign(&can(), &pin(), &challenge()).await.map(|_| ()),
        gate
    );
    assert_eq!(key.sign_calls(), 0);
}

#[tokio::test]
async fn test_biometric_signer_selected_from_config_file() {
    let registration = Arc::new(DeviceRegistration::new(
        Arc::new(SoftwareEnclave::new()),
        Arc::new(MemoryCertificateStore::new()),
        DeviceInformation::default(),
    ));

    // Pair first with a card
    let card_config = EngineConfig::testing();
    let transport = MockTransport::new(MockCard::new(brainpool_certificate()));
    let card_engine = CardAuthEngine::new(
        session_opener(&card_config, Arc::new(transport.clone()), None, None).unwrap(),
        Arc::new(DiagnosticContext::new()),
        &card_config,
    );
    let pairing = registration.create_pairing_session().unwrap();
    card_engine
        .sign_for_biometrics(&can(), &pin(), &challenge(), registration.as_ref(), &pairing)
        .await
        .unwrap();
    assert_eq!(transport.card().sign_calls(), 2);

    // Then sign with the device key alone, selected by configuration
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("engine.json");
    std::fs::write(&path, r#"{ "signer": "biometric", "success_teardown_delay_ms": 0 }"#).unwrap();
    let config = EngineConfig::load(&path).unwrap();

    let engine = CardAuthEngine::new(
        session_opener(
            &config,
            Arc::new(transport.clone()),
            None,
            Some(registration.clone()),
        )
        .unwrap(),
        Arc::new(DiagnosticContext::new()),
        &config,
    );
    let signed = engine.sign(&can(), &pin(), &challenge()).await.unwrap();

    assert_eq!(signed.signed_challenge().split('.').count(), 3);
    assert_eq!(engine.state(), AuthState::Done);
    assert_eq!(transport.open_calls(), 1);
    assert_eq!(transport.card().sign_calls(), 2);
}

#[tokio::test]
async fn test_biometric_signer_cannot_pair() {
    let config = EngineConfig::testing();
    let registration = MockRegistration::new();
    let device = Arc::new(DeviceRegistration::new(
        Arc::new(SoftwareEnclave::new()),
        Arc::new(MemoryCertificateStore::new()),
        DeviceInformation::default(),
    ));
    let pairing = device.create_pairing_session().unwrap();
    device
        .complete_pairing(
            &pairing,
            &brainpool_certificate().approve().unwrap(),
            "signed".into(),
        )
        .unwrap();

    let engine = CardAuthEngine::new(
        session_opener(
            &EngineConfig {
                signer: SignerMode::Biometric,
                ..EngineConfig::testing()
            },
            Arc::new(MockTransport::new(MockCard::new(brainpool_certificate()))),
            None,
            Some(device),
        )
        .unwrap(),
        Arc::new(DiagnosticContext::new()),
        &config,
    );
    let new_pairing = registration.create_pairing_session().unwrap();
    let result = engine
        .sign_for_biometrics(&can(), &pin(), &challenge(), &registration, &new_pairing)
        .await;

    assert!(matches!(
        result,
        Err(CardAuthError::SecureEnclave(
            cardwall_core::SecureEnclaveError::PairingRequiresCard
        ))
    ));
    assert!(matches!(engine.state(), AuthState::Failed(_)));
}
