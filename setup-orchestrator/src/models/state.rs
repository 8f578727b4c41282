// Wizard state model
//
// `WizardState` is the single source of truth for the setup flow. It is mutated only by the
// transition engine; everyone else works from cloned snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::actions::ActionKind;

/// Newest entries kept in `WizardState::transition_log`.
pub const TRANSITION_LOG_LIMIT: usize = 256;

/// Step indices shown by the wizard UI.
pub mod steps {
    pub const TIER: u32 = 0;
    pub const HARDWARE: u32 = 1;
    pub const DEPENDENCIES: u32 = 2;
    pub const PROVIDERS: u32 = 3;
    pub const REVIEW: u32 = 4;
    pub const READY: u32 = 5;
    pub const LAST: u32 = READY;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TierSelection {
    #[default]
    Unset,
    /// Hosted model providers only.
    TierA,
    /// Local accelerated workloads in addition to hosted providers.
    TierB,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    #[default]
    NotStarted,
    CheckingEnvironment,
    DependencyCheck,
    DependencyInstalling,
    DependencyReady,
    ProviderConfig,
    Validating,
    Completed,
    Error,
}

impl Phase {
    /// Position on the forward path. `DependencyCheck` and `DependencyInstalling` share a rank
    /// because the wizard moves freely between them. `Error` sits outside the ordering.
    pub fn rank(self) -> Option<u8> {
        match self {
            Phase::NotStarted => Some(0),
            Phase::CheckingEnvironment => Some(1),
            Phase::DependencyCheck | Phase::DependencyInstalling => Some(2),
            Phase::DependencyReady => Some(3),
            Phase::ProviderConfig => Some(4),
            Phase::Validating => Some(5),
            Phase::Completed => Some(6),
            Phase::Error => None,
        }
    }

    /// Phase entered when the UI moves to `step`. Step 5 only becomes `Completed` through
    /// `CompleteSetup`.
    pub fn for_step(step: u32) -> Option<Phase> {
        match step {
            steps::TIER => Some(Phase::NotStarted),
            steps::HARDWARE => Some(Phase::CheckingEnvironment),
            steps::DEPENDENCIES => Some(Phase::DependencyCheck),
            steps::PROVIDERS => Some(Phase::ProviderConfig),
            steps::REVIEW => Some(Phase::Validating),
            _ => None,
        }
    }

    pub fn is_dependency_phase(self) -> bool {
        matches!(
            self,
            Phase::DependencyCheck | Phase::DependencyInstalling | Phase::DependencyReady
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::NotStarted => "not_started",
            Phase::CheckingEnvironment => "checking_environment",
            Phase::DependencyCheck => "dependency_check",
            Phase::DependencyInstalling => "dependency_installing",
            Phase::DependencyReady => "dependency_ready",
            Phase::ProviderConfig => "provider_config",
            Phase::Validating => "validating",
            Phase::Completed => "completed",
            Phase::Error => "error",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Status {
    #[default]
    Idle,
    Validating,
    Valid,
    Invalid,
    Installing,
    Installed,
    Ready,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Idle => "idle",
            Status::Validating => "validating",
            Status::Valid => "valid",
            Status::Invalid => "invalid",
            Status::Installing => "installing",
            Status::Installed => "installed",
            Status::Ready => "ready",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CredentialStatus {
    #[default]
    Idle,
    Validating,
    Valid,
    Invalid,
}

/// A provider secret. `Debug` is redacted and there is deliberately no `Serialize`; the only
/// way a secret reaches disk is through `security::secret_box`.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretValue(***)")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HardwareProfile {
    pub gpu: Option<String>,
    pub vram_gb: Option<f64>,
    pub supports_accelerated_workload: bool,
}

impl HardwareProfile {
    pub fn recommended_tier(&self) -> TierSelection {
        if self.supports_accelerated_workload {
            TierSelection::TierB
        } else {
            TierSelection::TierA
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallItemSpec {
    pub id: String,
    pub display_name: String,
    pub required: bool,
}

impl InstallItemSpec {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>, required: bool) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            required,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallItem {
    pub id: String,
    pub display_name: String,
    pub required: bool,
    pub installed: bool,
    pub installing: bool,
    pub skipped: bool,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    #[serde(default)]
    pub generation: u64,
}

impl InstallItem {
    pub fn from_spec(spec: &InstallItemSpec) -> Self {
        Self {
            id: spec.id.clone(),
            display_name: spec.display_name.clone(),
            required: spec.required,
            installed: false,
            installing: false,
            skipped: false,
            last_error: None,
            last_attempt_at: None,
            retry_count: 0,
            generation: 0,
        }
    }

    /// At most one of `installed`, `installing`, `skipped` holds.
    pub fn flags_consistent(&self) -> bool {
        [self.installed, self.installing, self.skipped]
            .iter()
            .filter(|flag| **flag)
            .count()
            <= 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCategory {
    Network,
    Validation,
    Permission,
    DiskSpace,
    Configuration,
    Internal,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Permission => "permission",
            ErrorCategory::DiskSpace => "disk_space",
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User-facing error. Only `errors::classifier::classify` builds these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WizardError {
    pub code: String,
    pub message: String,
    pub category: ErrorCategory,
    pub can_retry: bool,
    pub recovery_actions: Vec<String>,
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
    pub affected_component: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedCheck {
    pub name: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationSummary {
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
    pub passed: bool,
    pub failed_checks: Vec<FailedCheck>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionLogEntry {
    pub from: Phase,
    pub to: Phase,
    pub action: ActionKind,
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
    pub step: u32,
    pub status: Status,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WizardState {
    pub step: u32,
    pub tier_selection: TierSelection,
    pub tier_locked: bool,
    pub phase: Phase,
    pub status: Status,
    pub last_validation: Option<ValidationSummary>,
    pub current_error: Option<WizardError>,
    pub resume_phase: Option<Phase>,
    pub install_items: Vec<InstallItem>,
    pub credentials: BTreeMap<String, SecretValue>,
    pub credential_status: BTreeMap<String, CredentialStatus>,
    pub credential_errors: BTreeMap<String, String>,
    pub credential_field_errors: BTreeMap<String, Vec<FieldError>>,
    /// Generation of the validation currently in flight per provider.
    pub validation_generations: BTreeMap<String, u64>,
    pub hardware: Option<HardwareProfile>,
    pub detecting: bool,
    pub rescanning: bool,
    pub preferences: BTreeMap<String, String>,
    pub transition_log: Vec<TransitionLogEntry>,
    pub revision: u64,
}

impl WizardState {
    pub fn item(&self, id: &str) -> Option<&InstallItem> {
        self.install_items.iter().find(|item| item.id == id)
    }

    pub fn item_mut(&mut self, id: &str) -> Option<&mut InstallItem> {
        self.install_items.iter_mut().find(|item| item.id == id)
    }

    pub fn any_installing(&self) -> bool {
        self.install_items.iter().any(|item| item.installing)
    }

    /// Every required item is installed. Vacuously true with no catalog.
    pub fn required_dependencies_ready(&self) -> bool {
        self.install_items
            .iter()
            .filter(|item| item.required)
            .all(|item| item.installed)
    }

    pub fn has_valid_credential(&self) -> bool {
        self.credential_status
            .values()
            .any(|status| *status == CredentialStatus::Valid)
    }

    pub fn any_validating(&self) -> bool {
        self.credential_status
            .values()
            .any(|status| *status == CredentialStatus::Validating)
    }

    pub fn is_last_step(&self) -> bool {
        self.step >= steps::LAST
    }

    /// Highest attempt generation recorded in state; orchestrators start counting above it.
    pub fn max_generation(&self) -> u64 {
        let items = self.install_items.iter().map(|item| item.generation);
        let validations = self.validation_generations.values().copied();
        items.chain(validations).max().unwrap_or(0)
    }
}
