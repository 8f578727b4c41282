// Wizard actions
//
// Every change to `WizardState` is expressed as one of these. Orchestrators report outcomes by
// dispatching completion actions; nothing else writes state.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use super::responses::RescanEntry;
use super::state::{
    FieldError, HardwareProfile, InstallItemSpec, SecretValue, TierSelection, WizardError,
    WizardState,
};

#[derive(Debug, Clone, PartialEq)]
pub enum WizardAction {
    SetStep(u32),
    SetTier(TierSelection),
    SetPreference {
        key: String,
        value: String,
    },

    DetectionStarted,
    DetectionSucceeded(HardwareProfile),
    DetectionFailed(WizardError),
    DetectionCancelled,

    RegisterInstallItems(Vec<InstallItemSpec>),
    StartInstall {
        item_id: String,
        generation: u64,
    },
    InstallSucceeded {
        item_id: String,
        generation: u64,
    },
    /// A failed attempt that will be retried.
    InstallAttemptFailed {
        item_id: String,
        generation: u64,
        error: WizardError,
    },
    /// The final failed attempt.
    InstallFailed {
        item_id: String,
        generation: u64,
        error: WizardError,
    },
    InstallCancelled {
        item_id: String,
        generation: u64,
    },
    SkipInstall {
        item_id: String,
    },
    ResetInstallItem {
        item_id: String,
    },

    RescanStarted,
    RescanCompleted(Vec<RescanEntry>),
    RescanFailed(WizardError),
    RescanCancelled,

    SetCredential {
        provider: String,
        secret: SecretValue,
    },
    StartValidation {
        provider: String,
        generation: u64,
    },
    CredentialValidated {
        provider: String,
        generation: u64,
        message: String,
    },
    CredentialRejected {
        provider: String,
        generation: u64,
        message: String,
        field_errors: Vec<FieldError>,
        error: WizardError,
    },
    /// Validation could not reach a verdict.
    ValidationFailed {
        provider: String,
        generation: u64,
        error: WizardError,
    },
    ValidationCancelled {
        provider: String,
        generation: u64,
    },

    ReportError(WizardError),
    ClearError,

    CompleteSetup,
    ResetWizard {
        preserve_data: bool,
    },
    Hydrate(Box<WizardState>),
}

/// Payload-free discriminant of `WizardAction`, used in logs and change notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionKind {
    SetStep,
    SetTier,
    SetPreference,
    DetectionStarted,
    DetectionSucceeded,
    DetectionFailed,
    DetectionCancelled,
    RegisterInstallItems,
    StartInstall,
    InstallSucceeded,
    InstallAttemptFailed,
    InstallFailed,
    InstallCancelled,
    SkipInstall,
    ResetInstallItem,
    RescanStarted,
    RescanCompleted,
    RescanFailed,
    RescanCancelled,
    SetCredential,
    StartValidation,
    CredentialValidated,
    CredentialRejected,
    ValidationFailed,
    ValidationCancelled,
    ReportError,
    ClearError,
    CompleteSetup,
    ResetWizard,
    Hydrate,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl WizardAction {
    pub fn name(&self) -> ActionKind {
        match self {
            WizardAction::SetStep(_) => ActionKind::SetStep,
            WizardAction::SetTier(_) => ActionKind::SetTier,
            WizardAction::SetPreference { .. } => ActionKind::SetPreference,
            WizardAction::DetectionStarted => ActionKind::DetectionStarted,
            WizardAction::DetectionSucceeded(_) => ActionKind::DetectionSucceeded,
            WizardAction::DetectionFailed(_) => ActionKind::DetectionFailed,
            WizardAction::DetectionCancelled => ActionKind::DetectionCancelled,
            WizardAction::RegisterInstallItems(_) => ActionKind::RegisterInstallItems,
            WizardAction::StartInstall { .. } => ActionKind::StartInstall,
            WizardAction::InstallSucceeded { .. } => ActionKind::InstallSucceeded,
            WizardAction::InstallAttemptFailed { .. } => ActionKind::InstallAttemptFailed,
            WizardAction::InstallFailed { .. } => ActionKind::InstallFailed,
            WizardAction::InstallCancelled { .. } => ActionKind::InstallCancelled,
            WizardAction::SkipInstall { .. } => ActionKind::SkipInstall,
            WizardAction::ResetInstallItem { .. } => ActionKind::ResetInstallItem,
            WizardAction::RescanStarted => ActionKind::RescanStarted,
            WizardAction::RescanCompleted(_) => ActionKind::RescanCompleted,
            WizardAction::RescanFailed(_) => ActionKind::RescanFailed,
            WizardAction::RescanCancelled => ActionKind::RescanCancelled,
            WizardAction::SetCredential { .. } => ActionKind::SetCredential,
            WizardAction::StartValidation { .. } => ActionKind::StartValidation,
            WizardAction::CredentialValidated { .. } => ActionKind::CredentialValidated,
            WizardAction::CredentialRejected { .. } => ActionKind::CredentialRejected,
            WizardAction::ValidationFailed { .. } => ActionKind::ValidationFailed,
            WizardAction::ValidationCancelled { .. } => ActionKind::ValidationCancelled,
            WizardAction::ReportError(_) => ActionKind::ReportError,
            WizardAction::ClearError => ActionKind::ClearError,
            WizardAction::CompleteSetup => ActionKind::CompleteSetup,
            WizardAction::ResetWizard { .. } => ActionKind::ResetWizard,
            WizardAction::Hydrate(_) => ActionKind::Hydrate,
        }
    }
}

/// An action plus the dispatch-time context the engine needs to stay deterministic.
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub kind: WizardAction,
    pub correlation_id: Option<String>,
    pub at: DateTime<Utc>,
}

impl Action {
    pub fn new(kind: WizardAction) -> Self {
        Self::at(kind, Utc::now())
    }

    /// Builds an action with a fixed timestamp (replays, tests).
    pub fn at(kind: WizardAction, at: DateTime<Utc>) -> Self {
        Self {
            kind,
            correlation_id: None,
            at,
        }
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

impl From<WizardAction> for Action {
    fn from(kind: WizardAction) -> Self {
        Action::new(kind)
    }
}

/// Actions whose application is persisted locally and replicated.
pub fn is_significant(kind: ActionKind) -> bool {
    matches!(
        kind,
        ActionKind::SetStep
            | ActionKind::SetTier
            | ActionKind::InstallSucceeded
            | ActionKind::SkipInstall
            | ActionKind::CredentialValidated
            | ActionKind::SetPreference
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_kind_names_match_variants() {
        let action = WizardAction::StartInstall {
            item_id: "ffmpeg".to_string(),
            generation: 4,
        };
        assert_eq!(action.name(), ActionKind::StartInstall);
        assert_eq!(action.name().to_string(), "StartInstall");
    }

    #[test]
    fn significant_actions_are_the_persisted_subset() {
        assert!(is_significant(ActionKind::SetStep));
        assert!(is_significant(ActionKind::CredentialValidated));
        assert!(!is_significant(ActionKind::StartInstall));
        assert!(!is_significant(ActionKind::ReportError));
    }

    #[test]
    fn with_correlation_sets_id() {
        let action = Action::new(WizardAction::ClearError).with_correlation("abc123");
        assert_eq!(action.correlation_id.as_deref(), Some("abc123"));
    }
}
