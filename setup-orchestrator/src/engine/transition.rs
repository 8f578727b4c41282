// Transition engine
//
// `transition` is a total, pure function from (state, action) to the next state. All timestamps
// and correlation ids come from the action envelope, so replaying a recorded action log always
// reproduces the same state.

use std::fmt;

use crate::models::actions::{Action, WizardAction};
use crate::models::responses::{RescanEntry, RescanStatus};
use crate::models::state::{
    steps, CredentialStatus, FailedCheck, InstallItem, InstallItemSpec, Phase, Status,
    TierSelection, TransitionLogEntry, ValidationSummary, WizardError, WizardState,
    TRANSITION_LOG_LIMIT,
};

use super::ui::can_advance;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Applied,
    /// The action was valid but changed nothing.
    Unchanged,
    /// A completion for an attempt that is no longer in flight.
    Stale,
    Rejected(&'static str),
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disposition::Applied => f.write_str("applied"),
            Disposition::Unchanged => f.write_str("unchanged"),
            Disposition::Stale => f.write_str("stale"),
            Disposition::Rejected(reason) => write!(f, "rejected ({})", reason),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub state: WizardState,
    pub disposition: Disposition,
    pub correlation_id: String,
}

/// Correlation id for `action` applied on top of `state`.
pub fn correlation_for(state: &WizardState, action: &Action) -> String {
    action
        .correlation_id
        .clone()
        .unwrap_or_else(|| format!("tx-{:06}", state.revision + 1))
}

pub fn transition(state: &WizardState, action: &Action) -> WizardState {
    apply(state, action).state
}

pub fn apply(state: &WizardState, action: &Action) -> Transition {
    let ctx = Ctx {
        correlation_id: correlation_for(state, action),
        action,
    };
    let mut next = state.clone();
    let mut disposition = reduce(&mut next, &ctx);

    if disposition == Disposition::Applied && next == *state {
        disposition = Disposition::Unchanged;
    }

    if disposition != Disposition::Applied {
        return Transition {
            state: state.clone(),
            disposition,
            correlation_id: ctx.correlation_id,
        };
    }

    next.revision = state.revision + 1;
    record(state, &mut next, &ctx);
    Transition {
        state: next,
        disposition,
        correlation_id: ctx.correlation_id,
    }
}

struct Ctx<'a> {
    correlation_id: String,
    action: &'a Action,
}

fn record(prev: &WizardState, next: &mut WizardState, ctx: &Ctx<'_>) {
    let observable_change = prev.phase != next.phase
        || prev.status != next.status
        || prev.step != next.step
        || prev.current_error != next.current_error;
    if !observable_change {
        return;
    }

    next.transition_log.push(TransitionLogEntry {
        from: prev.phase,
        to: next.phase,
        action: ctx.action.kind.name(),
        correlation_id: ctx.correlation_id.clone(),
        timestamp: ctx.action.at,
        step: next.step,
        status: next.status,
    });
    if next.transition_log.len() > TRANSITION_LOG_LIMIT {
        let overflow = next.transition_log.len() - TRANSITION_LOG_LIMIT;
        next.transition_log.drain(..overflow);
    }
}

fn reduce(next: &mut WizardState, ctx: &Ctx<'_>) -> Disposition {
    match &ctx.action.kind {
        WizardAction::SetStep(step) => set_step(next, *step),
        WizardAction::SetTier(tier) => set_tier(next, *tier),
        WizardAction::SetPreference { key, value } => {
            next.preferences.insert(key.clone(), value.clone());
            Disposition::Applied
        }

        WizardAction::DetectionStarted => {
            next.detecting = true;
            advance_phase(next, Phase::CheckingEnvironment);
            Disposition::Applied
        }
        WizardAction::DetectionSucceeded(profile) => {
            if !next.detecting {
                return Disposition::Stale;
            }
            next.detecting = false;
            next.hardware = Some(profile.clone());
            clear_error_for(next, HARDWARE_COMPONENT);
            if next.phase == Phase::CheckingEnvironment {
                next.phase = Phase::DependencyCheck;
            }
            Disposition::Applied
        }
        WizardAction::DetectionFailed(error) => {
            if !next.detecting {
                return Disposition::Stale;
            }
            next.detecting = false;
            enter_error(next, error.clone());
            Disposition::Applied
        }
        WizardAction::DetectionCancelled => {
            if !next.detecting {
                return Disposition::Stale;
            }
            next.detecting = false;
            Disposition::Applied
        }

        WizardAction::RegisterInstallItems(specs) => {
            register_items(next, specs);
            settle_dependencies(next);
            Disposition::Applied
        }
        WizardAction::StartInstall {
            item_id,
            generation,
        } => start_install(next, item_id, *generation, ctx),
        WizardAction::InstallSucceeded {
            item_id,
            generation,
        } => {
            let Some(item) = in_flight_item(next, item_id, *generation) else {
                return Disposition::Stale;
            };
            item.installing = false;
            item.installed = true;
            item.last_error = None;
            clear_error_for(next, item_id);
            settle_dependencies(next);
            Disposition::Applied
        }
        WizardAction::InstallAttemptFailed {
            item_id,
            generation,
            error,
        } => {
            let Some(item) = in_flight_item(next, item_id, *generation) else {
                return Disposition::Stale;
            };
            item.installing = false;
            item.retry_count += 1;
            item.last_error = Some(error.message.clone());
            settle_dependencies(next);
            Disposition::Applied
        }
        WizardAction::InstallFailed {
            item_id,
            generation,
            error,
        } => {
            let Some(item) = in_flight_item(next, item_id, *generation) else {
                return Disposition::Stale;
            };
            item.installing = false;
            item.retry_count += 1;
            item.last_error = Some(error.message.clone());
            let required = item.required;
            if required {
                enter_error(next, error.clone());
            } else {
                next.current_error = Some(error.clone());
            }
            settle_dependencies(next);
            Disposition::Applied
        }
        WizardAction::InstallCancelled {
            item_id,
            generation,
        } => {
            let Some(item) = in_flight_item(next, item_id, *generation) else {
                return Disposition::Stale;
            };
            item.installing = false;
            settle_dependencies(next);
            Disposition::Applied
        }
        WizardAction::SkipInstall { item_id } => {
            let Some(item) = next.item_mut(item_id) else {
                return Disposition::Rejected("unknown install item");
            };
            if item.required {
                return Disposition::Rejected("required items cannot be skipped");
            }
            if item.installing {
                return Disposition::Rejected("item is installing");
            }
            if item.installed {
                return Disposition::Rejected("item is already installed");
            }
            item.skipped = true;
            clear_error_for(next, item_id);
            settle_dependencies(next);
            Disposition::Applied
        }
        WizardAction::ResetInstallItem { item_id } => {
            let Some(item) = next.item_mut(item_id) else {
                return Disposition::Rejected("unknown install item");
            };
            if item.installing {
                return Disposition::Rejected("item is installing");
            }
            item.retry_count = 0;
            item.last_error = None;
            item.last_attempt_at = None;
            item.skipped = false;
            settle_dependencies(next);
            Disposition::Applied
        }

        WizardAction::RescanStarted => {
            next.rescanning = true;
            Disposition::Applied
        }
        WizardAction::RescanCompleted(entries) => {
            if !next.rescanning {
                return Disposition::Stale;
            }
            next.rescanning = false;
            merge_rescan(next, entries);
            clear_error_for(next, RESCAN_COMPONENT);
            settle_dependencies(next);
            Disposition::Applied
        }
        WizardAction::RescanFailed(error) => {
            if !next.rescanning {
                return Disposition::Stale;
            }
            next.rescanning = false;
            next.current_error = Some(error.clone());
            Disposition::Applied
        }
        WizardAction::RescanCancelled => {
            if !next.rescanning {
                return Disposition::Stale;
            }
            next.rescanning = false;
            Disposition::Applied
        }

        WizardAction::SetCredential { provider, secret } => {
            if next.credential_status.get(provider) == Some(&CredentialStatus::Validating) {
                return Disposition::Rejected("validation in progress");
            }
            next.credentials.insert(provider.clone(), secret.clone());
            next.credential_status
                .insert(provider.clone(), CredentialStatus::Idle);
            next.credential_errors.remove(provider);
            next.credential_field_errors.remove(provider);
            if next.status == Status::Invalid {
                next.status = Status::Idle;
            }
            Disposition::Applied
        }
        WizardAction::StartValidation {
            provider,
            generation,
        } => {
            if !next.credentials.contains_key(provider) {
                return Disposition::Rejected("no credential entered for provider");
            }
            next.credential_status
                .insert(provider.clone(), CredentialStatus::Validating);
            next.validation_generations
                .insert(provider.clone(), *generation);
            next.credential_errors.remove(provider);
            next.credential_field_errors.remove(provider);
            next.status = Status::Validating;
            if next.phase == Phase::ProviderConfig {
                next.phase = Phase::Validating;
            }
            Disposition::Applied
        }
        WizardAction::CredentialValidated {
            provider,
            generation,
            ..
        } => {
            if !validation_in_flight(next, provider, *generation) {
                return Disposition::Stale;
            }
            finish_validation(next, provider, CredentialStatus::Valid);
            if next.tier_selection != TierSelection::Unset {
                next.tier_locked = true;
            }
            next.last_validation = Some(ValidationSummary {
                correlation_id: ctx.correlation_id.clone(),
                timestamp: ctx.action.at,
                passed: true,
                failed_checks: Vec::new(),
            });
            clear_error_for(next, provider);
            settle_validation_status(next, Status::Valid);
            Disposition::Applied
        }
        WizardAction::CredentialRejected {
            provider,
            generation,
            message,
            field_errors,
            error,
        } => {
            if !validation_in_flight(next, provider, *generation) {
                return Disposition::Stale;
            }
            finish_validation(next, provider, CredentialStatus::Invalid);
            next.credential_errors
                .insert(provider.clone(), message.clone());
            if !field_errors.is_empty() {
                next.credential_field_errors
                    .insert(provider.clone(), field_errors.clone());
            }
            let failed_checks = if field_errors.is_empty() {
                vec![FailedCheck {
                    name: provider.clone(),
                    message: message.clone(),
                }]
            } else {
                field_errors
                    .iter()
                    .map(|fe| FailedCheck {
                        name: fe.field.clone(),
                        message: fe.message.clone(),
                    })
                    .collect()
            };
            next.last_validation = Some(ValidationSummary {
                correlation_id: ctx.correlation_id.clone(),
                timestamp: ctx.action.at,
                passed: false,
                failed_checks,
            });
            next.current_error = Some(error.clone());
            settle_validation_status(next, Status::Invalid);
            Disposition::Applied
        }
        WizardAction::ValidationFailed {
            provider,
            generation,
            error,
        } => {
            if !validation_in_flight(next, provider, *generation) {
                return Disposition::Stale;
            }
            finish_validation(next, provider, CredentialStatus::Idle);
            settle_validation_status(next, Status::Idle);
            enter_error(next, error.clone());
            Disposition::Applied
        }
        WizardAction::ValidationCancelled {
            provider,
            generation,
        } => {
            if !validation_in_flight(next, provider, *generation) {
                return Disposition::Stale;
            }
            finish_validation(next, provider, CredentialStatus::Idle);
            settle_validation_status(next, Status::Idle);
            Disposition::Applied
        }

        WizardAction::ReportError(error) => {
            enter_error(next, error.clone());
            Disposition::Applied
        }
        WizardAction::ClearError => {
            next.current_error = None;
            if next.phase == Phase::Error {
                next.phase = resume_target(next);
            }
            settle_dependencies(next);
            Disposition::Applied
        }

        WizardAction::CompleteSetup => complete_setup(next),
        WizardAction::ResetWizard { preserve_data } => {
            reset(next, *preserve_data);
            Disposition::Applied
        }
        WizardAction::Hydrate(loaded) => {
            let log = std::mem::take(&mut next.transition_log);
            *next = (**loaded).clone();
            next.transition_log = log;
            Disposition::Applied
        }
    }
}

/// `affected_component` used for hardware detection errors.
pub const HARDWARE_COMPONENT: &str = "hardware";

/// `affected_component` used for dependency rescan errors.
pub const RESCAN_COMPONENT: &str = "rescan";

fn set_step(next: &mut WizardState, step: u32) -> Disposition {
    if next.phase == Phase::Completed {
        return Disposition::Rejected("setup already completed");
    }
    if step > steps::LAST {
        return Disposition::Rejected("step out of range");
    }
    next.step = step;
    if let Some(target) = Phase::for_step(step) {
        advance_phase(next, target);
    }
    Disposition::Applied
}

fn set_tier(next: &mut WizardState, tier: TierSelection) -> Disposition {
    if next.tier_locked && next.tier_selection != tier {
        return Disposition::Rejected("tier is locked after successful validation");
    }
    next.tier_selection = tier;
    Disposition::Applied
}

/// Moves forward only. Inside `Error` the phase waits for `ClearError`.
fn advance_phase(next: &mut WizardState, target: Phase) {
    if next.phase == Phase::Error {
        return;
    }
    if target.rank() > next.phase.rank() {
        next.phase = target;
    }
}

fn enter_error(next: &mut WizardState, error: WizardError) {
    if next.phase != Phase::Error && next.phase != Phase::Completed {
        next.resume_phase = Some(next.phase);
        next.phase = Phase::Error;
    }
    next.current_error = Some(error);
}

/// Success of the operation on `component` clears its error.
fn clear_error_for(next: &mut WizardState, component: &str) {
    let matches = next
        .current_error
        .as_ref()
        .and_then(|e| e.affected_component.as_deref())
        == Some(component);
    if !matches {
        return;
    }
    next.current_error = None;
    if next.phase == Phase::Error {
        next.phase = resume_target(next);
    }
}

/// Phase to return to when leaving `Error`. `enter_error` always records one.
fn resume_target(next: &mut WizardState) -> Phase {
    let resume = next.resume_phase.take();
    debug_assert!(resume.is_some(), "Error phase without a resume phase");
    resume.unwrap_or(Phase::NotStarted)
}

fn register_items(next: &mut WizardState, specs: &[InstallItemSpec]) {
    for spec in specs {
        match next.item_mut(&spec.id) {
            Some(item) => {
                item.display_name = spec.display_name.clone();
                item.required = spec.required;
                if item.required {
                    item.skipped = false;
                }
            }
            None => next.install_items.push(InstallItem::from_spec(spec)),
        }
    }
}

fn start_install(next: &mut WizardState, item_id: &str, generation: u64, ctx: &Ctx<'_>) -> Disposition {
    let Some(item) = next.item_mut(item_id) else {
        return Disposition::Rejected("unknown install item");
    };
    if item.installed {
        return Disposition::Rejected("item is already installed");
    }
    item.installing = true;
    item.skipped = false;
    item.generation = generation;
    item.last_attempt_at = Some(ctx.action.at);

    next.status = Status::Installing;
    if next.phase != Phase::Error && next.phase.rank() <= Phase::DependencyReady.rank() {
        next.phase = Phase::DependencyInstalling;
    }
    Disposition::Applied
}

fn in_flight_item<'s>(
    next: &'s mut WizardState,
    item_id: &str,
    generation: u64,
) -> Option<&'s mut InstallItem> {
    next.item_mut(item_id)
        .filter(|item| item.installing && item.generation == generation)
}

/// Recomputes the dependency sub-phase and install status after an item changed.
fn settle_dependencies(next: &mut WizardState) {
    if next.any_installing() {
        next.status = Status::Installing;
        if next.phase.is_dependency_phase() {
            next.phase = Phase::DependencyInstalling;
        }
        return;
    }

    let ready = next.required_dependencies_ready();
    let in_dependency_phase = next.phase.is_dependency_phase();
    let status_follows_installs = next.status == Status::Installing
        || (in_dependency_phase && matches!(next.status, Status::Idle | Status::Installed));
    if status_follows_installs {
        next.status = if next.any_validating() {
            Status::Validating
        } else if ready {
            Status::Installed
        } else {
            Status::Idle
        };
    }
    if in_dependency_phase {
        next.phase = if ready {
            Phase::DependencyReady
        } else {
            Phase::DependencyCheck
        };
    }
}

fn merge_rescan(next: &mut WizardState, entries: &[RescanEntry]) {
    for entry in entries {
        let Some(item) = next.item_mut(&entry.id) else {
            continue;
        };
        if item.installing {
            continue;
        }
        match entry.status {
            RescanStatus::Installed => {
                item.installed = true;
                item.skipped = false;
                item.last_error = None;
                clear_error_for(next, &entry.id);
            }
            RescanStatus::Missing => {
                item.installed = false;
            }
            RescanStatus::PartiallyInstalled => {
                item.installed = false;
                item.last_error = Some("Partially installed; reinstall required".to_string());
            }
        }
    }
}

fn validation_in_flight(next: &WizardState, provider: &str, generation: u64) -> bool {
    next.credential_status.get(provider) == Some(&CredentialStatus::Validating)
        && next.validation_generations.get(provider) == Some(&generation)
}

fn finish_validation(next: &mut WizardState, provider: &str, outcome: CredentialStatus) {
    next.credential_status.insert(provider.to_string(), outcome);
    next.validation_generations.remove(provider);
}

/// Overall status reflects the last verdict once nothing is installing or validating.
fn settle_validation_status(next: &mut WizardState, outcome: Status) {
    next.status = if next.any_installing() {
        Status::Installing
    } else if next.any_validating() {
        Status::Validating
    } else {
        outcome
    };
}

fn complete_setup(next: &mut WizardState) -> Disposition {
    if next.phase == Phase::Completed {
        return Disposition::Unchanged;
    }
    if next.phase == Phase::Error
        || next.any_installing()
        || next.any_validating()
        || next.detecting
        || !can_advance(next.status)
        || !next.has_valid_credential()
        || !next.required_dependencies_ready()
    {
        return Disposition::Rejected("setup is not ready to complete");
    }
    next.phase = Phase::Completed;
    next.status = Status::Ready;
    next.step = steps::READY;
    next.current_error = None;
    next.resume_phase = None;
    Disposition::Applied
}

fn reset(next: &mut WizardState, preserve_data: bool) {
    let mut fresh = WizardState {
        transition_log: std::mem::take(&mut next.transition_log),
        ..WizardState::default()
    };
    if preserve_data {
        fresh.install_items = next
            .install_items
            .iter()
            .map(|item| InstallItem {
                installing: false,
                retry_count: 0,
                last_error: None,
                last_attempt_at: None,
                ..item.clone()
            })
            .collect();
        fresh.credentials = std::mem::take(&mut next.credentials);
        fresh.credential_status = fresh
            .credentials
            .keys()
            .map(|provider| (provider.clone(), CredentialStatus::Idle))
            .collect();
        fresh.preferences = std::mem::take(&mut next.preferences);
        fresh.hardware = next.hardware.take();
    }
    *next = fresh;
}
