// Persisted snapshot
//
// The non-transient subset of `WizardState`. In-flight flags never survive a reload, the
// transition log and the active error are not persisted, and credentials only appear sealed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::state::{
    CredentialStatus, FieldError, HardwareProfile, InstallItem, Phase, Status, TierSelection,
    ValidationSummary, WizardState,
};

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSnapshot {
    pub schema_version: u32,
    pub saved_at: DateTime<Utc>,
    pub step: u32,
    pub tier_selection: TierSelection,
    #[serde(default)]
    pub tier_locked: bool,
    pub phase: Phase,
    pub status: Status,
    #[serde(default)]
    pub last_validation: Option<ValidationSummary>,
    #[serde(default)]
    pub install_items: Vec<InstallItem>,
    #[serde(default)]
    pub credential_status: BTreeMap<String, CredentialStatus>,
    #[serde(default)]
    pub credential_errors: BTreeMap<String, String>,
    #[serde(default)]
    pub credential_field_errors: BTreeMap<String, Vec<FieldError>>,
    #[serde(default)]
    pub hardware: Option<HardwareProfile>,
    #[serde(default)]
    pub preferences: BTreeMap<String, String>,
    /// Provider to `ENCv1:` sealed secret. Local cache only.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub encrypted_credentials: BTreeMap<String, String>,
}

impl PersistedSnapshot {
    pub fn from_state(state: &WizardState, saved_at: DateTime<Utc>) -> Self {
        let phase = if state.phase == Phase::Error {
            state.resume_phase.unwrap_or_default()
        } else {
            state.phase
        };
        Self {
            schema_version: SCHEMA_VERSION,
            saved_at,
            step: state.step,
            tier_selection: state.tier_selection,
            tier_locked: state.tier_locked,
            phase,
            status: state.status,
            last_validation: state.last_validation.clone(),
            install_items: state.install_items.clone(),
            credential_status: state.credential_status.clone(),
            credential_errors: state.credential_errors.clone(),
            credential_field_errors: state.credential_field_errors.clone(),
            hardware: state.hardware.clone(),
            preferences: state.preferences.clone(),
            encrypted_credentials: BTreeMap::new(),
        }
        .normalized()
    }

    /// Rebuilds state. Credentials are restored separately from `encrypted_credentials`.
    pub fn into_state(self) -> WizardState {
        let snapshot = self.normalized();
        WizardState {
            step: snapshot.step,
            tier_selection: snapshot.tier_selection,
            tier_locked: snapshot.tier_locked,
            phase: snapshot.phase,
            status: snapshot.status,
            last_validation: snapshot.last_validation,
            install_items: snapshot.install_items,
            credential_status: snapshot.credential_status,
            credential_errors: snapshot.credential_errors,
            credential_field_errors: snapshot.credential_field_errors,
            hardware: snapshot.hardware,
            preferences: snapshot.preferences,
            ..WizardState::default()
        }
    }

    pub fn is_compatible(&self) -> bool {
        self.schema_version == SCHEMA_VERSION
    }

    /// Nothing a user did is recorded.
    pub fn is_empty(&self) -> bool {
        self.step == 0
            && self.tier_selection == TierSelection::Unset
            && self.phase == Phase::NotStarted
            && self
                .install_items
                .iter()
                .all(|item| !item.installed && !item.skipped)
            && self.credential_status.is_empty()
            && self.hardware.is_none()
            && self.preferences.is_empty()
    }

    /// The same snapshot without sealed credentials, for remote replication.
    pub fn without_credentials(&self) -> Self {
        Self {
            encrypted_credentials: BTreeMap::new(),
            ..self.clone()
        }
    }

    fn normalized(mut self) -> Self {
        for item in &mut self.install_items {
            item.installing = false;
        }
        self.phase = match self.phase {
            Phase::Error => Phase::NotStarted,
            Phase::DependencyInstalling => Phase::DependencyCheck,
            other => other,
        };
        if matches!(self.status, Status::Installing | Status::Validating) {
            self.status = Status::Idle;
        }
        for status in self.credential_status.values_mut() {
            if *status == CredentialStatus::Validating {
                *status = CredentialStatus::Idle;
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::state::{InstallItemSpec, SecretValue};

    fn in_flight_state() -> WizardState {
        let mut state = WizardState {
            step: 2,
            tier_selection: TierSelection::TierB,
            phase: Phase::DependencyInstalling,
            status: Status::Installing,
            ..WizardState::default()
        };
        let mut item = InstallItem::from_spec(&InstallItemSpec::new("ffmpeg", "FFmpeg", true));
        item.installing = true;
        item.generation = 7;
        state.install_items.push(item);
        state
            .credentials
            .insert("openai".to_string(), SecretValue::new("sk-live-abcdef123456"));
        state
            .credential_status
            .insert("openai".to_string(), CredentialStatus::Validating);
        state.revision = 42;
        state
    }

    #[test]
    fn in_flight_flags_reset_on_snapshot() {
        let snapshot = PersistedSnapshot::from_state(&in_flight_state(), Utc::now());
        assert!(!snapshot.install_items[0].installing);
        assert_eq!(snapshot.install_items[0].generation, 7);
        assert_eq!(snapshot.phase, Phase::DependencyCheck);
        assert_eq!(snapshot.status, Status::Idle);
        assert_eq!(snapshot.credential_status["openai"], CredentialStatus::Idle);
    }

    #[test]
    fn secrets_and_bookkeeping_are_not_serialized() {
        let snapshot = PersistedSnapshot::from_state(&in_flight_state(), Utc::now());
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(!json.contains("sk-live"));
        assert!(!json.contains("transitionLog"));
        assert!(!json.contains("encryptedCredentials"));
        assert!(json.contains("\"schemaVersion\":1"));

        let state = snapshot.into_state();
        assert!(state.credentials.is_empty());
        assert_eq!(state.revision, 0);
    }

    #[test]
    fn error_phase_resumes_where_it_was() {
        let state = WizardState {
            phase: Phase::Error,
            resume_phase: Some(Phase::ProviderConfig),
            ..WizardState::default()
        };
        let snapshot = PersistedSnapshot::from_state(&state, Utc::now());
        assert_eq!(snapshot.phase, Phase::ProviderConfig);
        assert!(snapshot.into_state().current_error.is_none());
    }

    #[test]
    fn remote_payloads_are_normalized_on_load() {
        let mut snapshot = PersistedSnapshot::from_state(&WizardState::default(), Utc::now());
        snapshot.status = Status::Validating;
        snapshot.phase = Phase::Error;
        let state = snapshot.into_state();
        assert_eq!(state.status, Status::Idle);
        assert_eq!(state.phase, Phase::NotStarted);
    }

    #[test]
    fn emptiness_tracks_user_progress() {
        let empty = PersistedSnapshot::from_state(&WizardState::default(), Utc::now());
        assert!(empty.is_empty());
        let progressed = PersistedSnapshot::from_state(&in_flight_state(), Utc::now());
        assert!(!progressed.is_empty());
    }
}
