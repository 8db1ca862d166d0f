//! Recovery policy
//!
//! Maps every login failure to exactly one user recovery action. The mapping
//! is an ordered rule table: the first matching rule wins, and a failure no
//! rule matches falls back to [`RecoveryAction::ReportableGenericFailure`].

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::diagnostics::{DiagnosticContext, DiagnosticReport};
use crate::error::{CardAuthError, InputError, LoginError, NfcError};
use crate::TAG_LOSS_RETRY_LIMIT;

/// What the user is offered after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Plain retry
    Retryable,
    /// Re-enter the card access number
    CorrectCan,
    /// Re-enter the PIN
    CorrectPin,
    /// The card is blocked; close the flow
    CardBlockedClose,
    /// Retry or send a diagnostic report
    ReportableGenericFailure,
    /// The device cannot read health cards; close the flow
    UnsupportedFeatureClose,
}

/// Facts beyond the error itself that rules may look at
#[derive(Debug, Clone, Copy)]
struct Facts {
    tag_loss_count: u32,
    tag_loss_retry_limit: u32,
}

struct Rule {
    name: &'static str,
    matches: fn(&LoginError, &Facts) -> bool,
    action: RecoveryAction,
}

const RULES: &[Rule] = &[
    Rule {
        name: "card_blocked",
        matches: |e, _| e.verify_pin_error().is_some_and(|pin| pin.is_card_blocked()),
        action: RecoveryAction::CardBlockedClose,
    },
    Rule {
        name: "wrong_pin",
        matches: |e, _| e.verify_pin_error().and_then(|pin| pin.retry_count()).is_some(),
        action: RecoveryAction::CorrectPin,
    },
    Rule {
        name: "wrong_can",
        matches: |e, _| matches!(e.card_error(), Some(CardAuthError::WrongCan)),
        action: RecoveryAction::CorrectCan,
    },
    Rule {
        name: "missing_can",
        matches: |e, _| matches!(e, LoginError::Input(InputError::MissingCan)),
        action: RecoveryAction::CorrectCan,
    },
    Rule {
        name: "missing_pin",
        matches: |e, _| matches!(e, LoginError::Input(InputError::MissingPin)),
        action: RecoveryAction::CorrectPin,
    },
    Rule {
        name: "unsupported_feature",
        matches: |e, _| matches!(e.nfc_error(), Some(NfcError::UnsupportedFeature)),
        action: RecoveryAction::UnsupportedFeatureClose,
    },
    Rule {
        name: "tag_connection_lost",
        matches: |e, facts| {
            e.is_tag_connection_lost() && facts.tag_loss_count <= facts.tag_loss_retry_limit
        },
        action: RecoveryAction::Retryable,
    },
];

/// Outcome of classification, with the report for report-worthy failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recovery {
    pub action: RecoveryAction,
    pub report: Option<String>,
}

/// Recovery policy with a configurable tag-loss retry limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryPolicy {
    /// Tag connection losses per screen visit that are offered a plain retry
    pub tag_loss_retry_limit: u32,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            tag_loss_retry_limit: TAG_LOSS_RETRY_LIMIT,
        }
    }
}

impl RecoveryPolicy {
    pub fn new(tag_loss_retry_limit: u32) -> Self {
        Self {
            tag_loss_retry_limit,
        }
    }

    /// Classify `error` given the tag-loss count of the current screen visit
    pub fn classify(&self, error: &LoginError, tag_loss_count: u32) -> RecoveryAction {
        let facts = Facts {
            tag_loss_count,
            tag_loss_retry_limit: self.tag_loss_retry_limit,
        };

        match RULES.iter().find(|rule| (rule.matches)(error, &facts)) {
            Some(rule) => {
                debug!("Recovery rule '{}' matched: {:?}", rule.name, rule.action);
                rule.action
            }
            None => {
                debug!("No recovery rule matched, falling back to generic failure");
                RecoveryAction::ReportableGenericFailure
            }
        }
    }

    /// Classify `error` and build the diagnostic report when one is due
    pub fn resolve(&self, error: &LoginError, context: &DiagnosticContext) -> Recovery {
        let tag_loss_count = context.tag_connection_lost_count();
        let action = self.classify(error, tag_loss_count);
        let report = (action == RecoveryAction::ReportableGenericFailure)
            .then(|| DiagnosticReport::build(error, tag_loss_count, context).to_string());

        Recovery { action, report }
    }
}

/// Classify with the default retry limit
pub fn classify(error: &LoginError, tag_loss_count: u32) -> RecoveryAction {
    RecoveryPolicy::default().classify(error, tag_loss_count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{IdpError, SigningError, TransportError, VerifyPinError};

    fn card(e: CardAuthError) -> LoginError {
        LoginError::SignChallenge(e)
    }

    fn pin(e: VerifyPinError) -> LoginError {
        card(CardAuthError::VerifyCard(e))
    }

    fn nfc(e: NfcError) -> LoginError {
        card(CardAuthError::Card(e))
    }

    #[test]
    fn test_canonical_table() {
        let cases = [
            (pin(VerifyPinError::WrongSecretWarning { retry_count: 0 }), RecoveryAction::CardBlockedClose),
            (pin(VerifyPinError::PasswordBlocked), RecoveryAction::CardBlockedClose),
            (pin(VerifyPinError::WrongSecretWarning { retry_count: 2 }), RecoveryAction::CorrectPin),
            (card(CardAuthError::WrongCan), RecoveryAction::CorrectCan),
            (nfc(NfcError::SessionTimeout), RecoveryAction::ReportableGenericFailure),
            (nfc(NfcError::SessionInvalidated), RecoveryAction::ReportableGenericFailure),
            (nfc(NfcError::Other("x".into())), RecoveryAction::ReportableGenericFailure),
            (nfc(NfcError::UnsupportedFeature), RecoveryAction::UnsupportedFeatureClose),
            (
                card(CardAuthError::Signing(SigningError::UnsupportedAlgorithm)),
                RecoveryAction::ReportableGenericFailure,
            ),
            (pin(VerifyPinError::MemoryFailure), RecoveryAction::ReportableGenericFailure),
            (LoginError::Input(InputError::MissingCan), RecoveryAction::CorrectCan),
            (LoginError::Input(InputError::MissingPin), RecoveryAction::CorrectPin),
            (
                LoginError::Idp(IdpError::Network("offline".into())),
                RecoveryAction::ReportableGenericFailure,
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(classify(&error, 0), expected, "{:?}", error);
        }
    }

    #[test]
    fn test_tag_loss_limit() {
        let lost = nfc(NfcError::TagConnectionLost);
        assert_eq!(classify(&lost, 1), RecoveryAction::Retryable);
        assert_eq!(classify(&lost, 3), RecoveryAction::Retryable);
        assert_eq!(classify(&lost, 4), RecoveryAction::ReportableGenericFailure);

        let nested = card(CardAuthError::Session(TransportError::Nfc(NfcError::TagConnectionLost)));
        assert_eq!(classify(&nested, 2), RecoveryAction::Retryable);
    }

    #[test]
    fn test_custom_limit() {
        let policy = RecoveryPolicy::new(1);
        let lost = nfc(NfcError::TagConnectionLost);
        assert_eq!(policy.classify(&lost, 1), RecoveryAction::Retryable);
        assert_eq!(policy.classify(&lost, 2), RecoveryAction::ReportableGenericFailure);
    }

    #[test]
    fn test_report_only_for_generic_failures() {
        let context = DiagnosticContext::new();
        let policy = RecoveryPolicy::default();

        let wrong_pin = pin(VerifyPinError::WrongSecretWarning { retry_count: 2 });
        let recovery = policy.resolve(&wrong_pin, &context);
        assert_eq!(recovery.action, RecoveryAction::CorrectPin);
        assert!(recovery.report.is_none());

        let timeout = nfc(NfcError::SessionTimeout);
        let recovery = policy.resolve(&timeout, &context);
        assert_eq!(recovery.action, RecoveryAction::ReportableGenericFailure);
        assert!(recovery.report.unwrap().contains("Tag connections lost count: 0"));
    }
}
