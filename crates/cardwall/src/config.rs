//! Engine configuration

use std::path::Path;
use std::time::Duration;

use cardwall_core::{DeviceInformation, RecoveryPolicy, TAG_LOSS_RETRY_LIMIT};
use serde::{Deserialize, Serialize};

/// Which signer backs the card authentication engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignerMode {
    /// Physical health card over NFC
    #[default]
    Card,
    /// Software-simulated card for debugging; CAN and PIN are ignored
    Virtual,
    /// Device key of a completed biometric pairing; no card is read
    Biometric,
}

/// Texts shown in the NFC reader dialog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NfcMessages {
    pub discovery: String,
    pub connect: String,
    pub secure_channel: String,
    pub verify_pin: String,
    pub sign_challenge: String,
    pub success: String,
    pub cancel: String,
    pub no_card: String,
    pub multiple_cards: String,
    pub unsupported_card: String,
    pub connection_error: String,
}

impl Default for NfcMessages {
    fn default() -> Self {
        Self {
            discovery: "Hold your health card against the top of the device.".to_string(),
            connect: "Connecting to the card.".to_string(),
            secure_channel: "Establishing a secure connection.".to_string(),
            verify_pin: "Verifying PIN.".to_string(),
            sign_challenge: "Signing the login challenge.".to_string(),
            success: "Card read successfully.".to_string(),
            cancel: "Card reading cancelled.".to_string(),
            no_card: "No card found.".to_string(),
            multiple_cards: "More than one card found. Use only one card.".to_string(),
            unsupported_card: "This card is not supported.".to_string(),
            connection_error: "The connection to the card was interrupted.".to_string(),
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Signer backing the engine
    pub signer: SignerMode,

    /// Delay between the success alert and tearing down the card connection (milliseconds)
    pub success_teardown_delay_ms: u64,

    /// Tag connection losses per screen visit that are offered a plain retry
    pub tag_loss_retry_limit: u32,

    /// NFC dialog texts
    pub messages: NfcMessages,

    /// Device information sent with pairing and authentication data
    pub device: DeviceInformation,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            signer: SignerMode::Card,
            success_teardown_delay_ms: 100,
            tag_loss_retry_limit: TAG_LOSS_RETRY_LIMIT,
            messages: NfcMessages::default(),
            device: DeviceInformation::default(),
        }
    }
}

impl EngineConfig {
    /// Configuration for tests: no teardown delay
    pub fn testing() -> Self {
        Self {
            success_teardown_delay_ms: 0,
            ..Self::default()
        }
    }

    pub fn success_teardown_delay(&self) -> Duration {
        Duration::from_millis(self.success_teardown_delay_ms)
    }

    pub fn recovery_policy(&self) -> RecoveryPolicy {
        RecoveryPolicy::new(self.tag_loss_retry_limit)
    }

    /// Load configuration from file
    pub fn load(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> crate::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
