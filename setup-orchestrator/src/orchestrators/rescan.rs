// Dependency rescan

use log::{info, warn};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{new_correlation_id, Attempted, Orchestrator, OperationKey};
use crate::engine::transition::RESCAN_COMPONENT;
use crate::errors::classifier::Operation;
use crate::models::actions::WizardAction;

impl Orchestrator {
    /// Re-reads every item's install state from the backend.
    pub fn start_rescan(self: &Arc<Self>) -> JoinHandle<()> {
        self.spawn_operation(OperationKey::Rescan, |this, token| async move {
            this.run_rescan(&token).await;
        })
    }

    async fn run_rescan(&self, token: &CancellationToken) {
        if token.is_cancelled() || self.store.is_disposed() {
            return;
        }
        let correlation_id = new_correlation_id();
        self.dispatch(&correlation_id, WizardAction::RescanStarted);

        let outcome = self
            .with_retries(
                token,
                self.policy.rescan_timeout,
                Operation::Rescan,
                Some(RESCAN_COMPONENT),
                &correlation_id,
                || self.services.install.rescan_all(),
            )
            .await;

        let action = match outcome {
            Attempted::Done(entries) => {
                info!(
                    "[PHASE: rescan] [STEP: complete] {} item(s) reported correlation_id={}",
                    entries.len(),
                    correlation_id
                );
                WizardAction::RescanCompleted(entries)
            }
            Attempted::Failed(error) => {
                warn!(
                    "[PHASE: rescan] [STEP: failed] {}: {} correlation_id={}",
                    error.code, error.message, correlation_id
                );
                WizardAction::RescanFailed(error)
            }
            Attempted::Cancelled => WizardAction::RescanCancelled,
        };
        self.dispatch(&correlation_id, action);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::WizardStore;
    use crate::errors::ServiceError;
    use crate::models::requests::InstallOptions;
    use crate::models::responses::{RescanEntry, RescanStatus};
    use crate::models::state::{steps, ErrorCategory, InstallItemSpec, Phase, Status, WizardState};
    use crate::orchestrators::OperationPolicy;
    use crate::services::scripted::{Scripted, ScriptedBackend};
    use std::time::Duration;

    fn setup() -> (Arc<Orchestrator>, ScriptedBackend) {
        let backend = ScriptedBackend::new(["ffmpeg", "git"]);
        let store = WizardStore::create(WizardState::default());
        store.dispatch(WizardAction::RegisterInstallItems(vec![
            InstallItemSpec::new("ffmpeg", "FFmpeg", true),
            InstallItemSpec::new("git", "Git", false),
        ]));
        store.dispatch(WizardAction::SetStep(steps::DEPENDENCIES));
        let orchestrator =
            Orchestrator::new(store, backend.services(), OperationPolicy::default());
        (orchestrator, backend)
    }

    #[tokio::test]
    async fn rescan_merges_backend_state() {
        let (orchestrator, backend) = setup();
        backend.install.mark_installed("ffmpeg");

        orchestrator.start_rescan().await.unwrap();

        let state = orchestrator.store().snapshot();
        assert!(!state.rescanning);
        assert!(state.item("ffmpeg").unwrap().installed);
        assert!(!state.item("git").unwrap().installed);
        assert_eq!(state.status, Status::Installed);
        assert_eq!(state.phase, Phase::DependencyReady);
    }

    #[tokio::test(start_paused = true)]
    async fn rescan_leaves_items_mid_install_alone() {
        let (orchestrator, backend) = setup();
        backend.install.script_install(
            "ffmpeg",
            Scripted::Delayed(
                Duration::from_secs(10),
                Ok(crate::models::responses::InstallResult::succeeded()),
            ),
        );
        backend.install.script_rescan(Scripted::ok(vec![RescanEntry {
            id: "ffmpeg".to_string(),
            status: RescanStatus::Missing,
        }]));

        let install = orchestrator.start_install("ffmpeg", InstallOptions::default());
        tokio::time::sleep(Duration::from_secs(1)).await;
        orchestrator.start_rescan().await.unwrap();
        assert!(orchestrator.store().snapshot().item("ffmpeg").unwrap().installing);

        install.await.unwrap();
        assert!(orchestrator.store().snapshot().item("ffmpeg").unwrap().installed);
    }

    #[tokio::test]
    async fn failed_rescan_reports_without_blocking() {
        let (orchestrator, backend) = setup();
        backend.install.script_rescan(Scripted::err(ServiceError::Rejected {
            code: Some("CATALOG_UNAVAILABLE".to_string()),
            message: "catalog missing".to_string(),
        }));

        orchestrator.start_rescan().await.unwrap();

        let state = orchestrator.store().snapshot();
        assert!(!state.rescanning);
        assert_ne!(state.phase, Phase::Error);
        let error = state.current_error.unwrap();
        assert_eq!(error.category, ErrorCategory::Configuration);
        assert_eq!(error.code, "RESCAN_CATALOG_UNAVAILABLE");
        assert_eq!(error.affected_component.as_deref(), Some(RESCAN_COMPONENT));

        orchestrator.start_rescan().await.unwrap();
        assert!(orchestrator.store().snapshot().current_error.is_none());
    }
}
