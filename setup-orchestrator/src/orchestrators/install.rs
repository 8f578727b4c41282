// Dependency installs
//
// One task per item. Every attempt runs under a fresh generation so a late reply from a
// superseded attempt is dropped by the engine.

use futures::future::join_all;
use log::{error, info, warn};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{call_with_timeout, new_correlation_id, sleep_or_cancel, CallOutcome, Orchestrator, OperationKey};
use crate::engine::Disposition;
use crate::errors::classifier::{classify, Operation};
use crate::errors::ServiceError;
use crate::models::actions::WizardAction;
use crate::models::requests::InstallOptions;

enum AttemptEnd {
    Installed,
    Cancelled,
    Failed(ServiceError),
}

impl Orchestrator {
    /// Installs `item_id`, cancelling any install already running for it.
    pub fn start_install(
        self: &Arc<Self>,
        item_id: &str,
        options: InstallOptions,
    ) -> JoinHandle<()> {
        let key = OperationKey::Install(item_id.to_string());
        let item_id = item_id.to_string();
        self.spawn_operation(key, move |this, token| async move {
            this.run_install(&item_id, &options, &token).await;
        })
    }

    /// Starts every item that is neither installed, skipped nor installing.
    pub fn install_missing(self: &Arc<Self>, options: &InstallOptions) -> Vec<JoinHandle<()>> {
        let snapshot = self.store.snapshot();
        snapshot
            .install_items
            .iter()
            .filter(|item| !item.installed && !item.skipped && !item.installing)
            .map(|item| self.start_install(&item.id, options.clone()))
            .collect()
    }

    /// `install_missing` and wait for every task.
    pub async fn install_all(self: &Arc<Self>, options: &InstallOptions) {
        join_all(self.install_missing(options)).await;
    }

    async fn run_install(&self, item_id: &str, options: &InstallOptions, token: &CancellationToken) {
        let correlation_id = new_correlation_id();
        let retry = self.policy.retry;
        let mut attempt: u32 = 0;

        loop {
            if token.is_cancelled() {
                return;
            }
            let generation = self.next_generation();
            let disposition = self.dispatch(
                &correlation_id,
                WizardAction::StartInstall {
                    item_id: item_id.to_string(),
                    generation,
                },
            );
            if disposition != Disposition::Applied {
                info!(
                    "[PHASE: install] [STEP: start] {} not started ({}) correlation_id={}",
                    item_id, disposition, correlation_id
                );
                return;
            }
            info!(
                "[PHASE: install] [STEP: start] {} attempt {} generation {} correlation_id={}",
                item_id,
                attempt + 1,
                generation,
                correlation_id
            );

            let end = self
                .install_attempt(item_id, options, attempt, token, &correlation_id)
                .await;
            let failure = match end {
                AttemptEnd::Installed => {
                    info!(
                        "[PHASE: install] [STEP: complete] {} installed correlation_id={}",
                        item_id, correlation_id
                    );
                    self.dispatch(
                        &correlation_id,
                        WizardAction::InstallSucceeded {
                            item_id: item_id.to_string(),
                            generation,
                        },
                    );
                    return;
                }
                AttemptEnd::Cancelled => {
                    info!(
                        "[PHASE: install] [STEP: cancel] {} cancelled correlation_id={}",
                        item_id, correlation_id
                    );
                    self.dispatch(
                        &correlation_id,
                        WizardAction::InstallCancelled {
                            item_id: item_id.to_string(),
                            generation,
                        },
                    );
                    return;
                }
                AttemptEnd::Failed(failure) => failure,
            };

            let ctx = self
                .context(Operation::Install, &correlation_id, attempt)
                .component(item_id);
            let error = classify(&failure, &ctx);

            if error.can_retry && attempt + 1 < retry.max_attempts {
                let delay = retry.delay_for(attempt);
                warn!(
                    "[PHASE: install] [STEP: retry] {} failed with {} ({}); retrying in {}ms correlation_id={}",
                    item_id,
                    error.code,
                    failure,
                    delay.as_millis(),
                    correlation_id
                );
                self.dispatch(
                    &correlation_id,
                    WizardAction::InstallAttemptFailed {
                        item_id: item_id.to_string(),
                        generation,
                        error,
                    },
                );
                if !sleep_or_cancel(token, delay).await {
                    info!(
                        "[PHASE: install] [STEP: cancel] {} cancelled during backoff correlation_id={}",
                        item_id, correlation_id
                    );
                    return;
                }
                attempt += 1;
                continue;
            }

            error!(
                "[PHASE: install] [STEP: failed] {} failed with {} after {} attempt(s): {} correlation_id={}",
                item_id,
                error.code,
                attempt + 1,
                failure,
                correlation_id
            );
            self.dispatch(
                &correlation_id,
                WizardAction::InstallFailed {
                    item_id: item_id.to_string(),
                    generation,
                    error,
                },
            );
            return;
        }
    }

    async fn install_attempt(
        &self,
        item_id: &str,
        options: &InstallOptions,
        attempt: u32,
        token: &CancellationToken,
        correlation_id: &str,
    ) -> AttemptEnd {
        // A timed-out attempt may still have finished on the backend.
        if attempt > 0 && !options.force {
            let status = self.services.install.status(item_id);
            match call_with_timeout(token, self.policy.status_timeout, status).await {
                CallOutcome::Completed(status) if status.installed && status.valid => {
                    info!(
                        "[PHASE: install] [STEP: status] {} already installed; skipping reinstall correlation_id={}",
                        item_id, correlation_id
                    );
                    return AttemptEnd::Installed;
                }
                CallOutcome::Completed(_) => {}
                CallOutcome::Cancelled => return AttemptEnd::Cancelled,
                CallOutcome::Failed(failure) => {
                    warn!(
                        "[PHASE: install] [STEP: status] status check for {} failed: {} correlation_id={}",
                        item_id, failure, correlation_id
                    );
                }
            }
        }

        let install = self.services.install.install(item_id, options);
        match call_with_timeout(token, self.policy.install_timeout, install).await {
            CallOutcome::Completed(result) if result.success => AttemptEnd::Installed,
            CallOutcome::Completed(result) => AttemptEnd::Failed(ServiceError::from_reported(
                result.error_code.as_deref(),
                result
                    .error
                    .unwrap_or_else(|| "install reported failure".to_string()),
            )),
            CallOutcome::Cancelled => AttemptEnd::Cancelled,
            CallOutcome::Failed(failure) => AttemptEnd::Failed(failure),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::WizardStore;
    use crate::models::actions::WizardAction;
    use crate::models::responses::{DependencyStatus, InstallResult};
    use crate::models::state::{ErrorCategory, InstallItemSpec, Phase, Status, WizardState};
    use crate::orchestrators::OperationPolicy;
    use crate::services::scripted::{Scripted, ScriptedBackend};
    use std::time::Duration;

    fn setup(items: &[(&str, bool)]) -> (Arc<Orchestrator>, ScriptedBackend) {
        let backend = ScriptedBackend::new(items.iter().map(|(id, _)| *id));
        let store = WizardStore::create(WizardState::default());
        store.dispatch(WizardAction::RegisterInstallItems(
            items
                .iter()
                .map(|(id, required)| InstallItemSpec::new(*id, id.to_uppercase(), *required))
                .collect(),
        ));
        let orchestrator =
            Orchestrator::new(store, backend.services(), OperationPolicy::default());
        (orchestrator, backend)
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_retried_and_then_succeeds() {
        let (orchestrator, backend) = setup(&[("ffmpeg", true)]);
        backend.install.script_install("ffmpeg", Scripted::Hang);

        orchestrator
            .start_install("ffmpeg", InstallOptions::default())
            .await
            .unwrap();

        let state = orchestrator.store().snapshot();
        let item = state.item("ffmpeg").unwrap();
        assert!(item.installed);
        assert!(!item.installing);
        assert_eq!(item.retry_count, 1);
        assert!(state.current_error.is_none());
        assert_eq!(state.status, Status::Installed);
        assert_eq!(
            backend.install.calls(),
            vec!["install:ffmpeg", "status:ffmpeg", "install:ffmpeg"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn backend_success_after_timeout_skips_reinstall() {
        let (orchestrator, backend) = setup(&[("ffmpeg", true)]);
        backend.install.script_install("ffmpeg", Scripted::Hang);
        backend.install.script_status(
            "ffmpeg",
            Scripted::ok(DependencyStatus {
                installed: true,
                valid: true,
                version: Some("6.1".to_string()),
            }),
        );

        orchestrator
            .start_install("ffmpeg", InstallOptions::default())
            .await
            .unwrap();

        assert_eq!(backend.install.install_calls("ffmpeg"), 1);
        assert!(orchestrator.store().snapshot().item("ffmpeg").unwrap().installed);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_failure_on_required_item_enters_error() {
        let (orchestrator, backend) = setup(&[("cuda", true)]);
        backend.install.script_install(
            "cuda",
            Scripted::ok(InstallResult::failed(Some("DISK_FULL"), "no space left")),
        );

        orchestrator
            .start_install("cuda", InstallOptions::default())
            .await
            .unwrap();

        let state = orchestrator.store().snapshot();
        assert_eq!(backend.install.install_calls("cuda"), 1);
        assert_eq!(state.phase, Phase::Error);
        let error = state.current_error.as_ref().unwrap();
        assert_eq!(error.category, ErrorCategory::DiskSpace);
        assert!(!error.can_retry);
        assert_eq!(error.affected_component.as_deref(), Some("cuda"));
        assert_eq!(state.item("cuda").unwrap().retry_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_stop_at_max_attempts() {
        let (orchestrator, backend) = setup(&[("ffmpeg", false)]);
        for _ in 0..3 {
            backend.install.script_install(
                "ffmpeg",
                Scripted::err(ServiceError::ConnectionRefused("refused".into())),
            );
        }

        orchestrator
            .start_install("ffmpeg", InstallOptions::default())
            .await
            .unwrap();

        let state = orchestrator.store().snapshot();
        let item = state.item("ffmpeg").unwrap();
        assert_eq!(backend.install.install_calls("ffmpeg"), 3);
        assert_eq!(item.retry_count, 3);
        assert!(!item.installed && !item.installing);
        // Optional item: reported but not blocking.
        assert_ne!(state.phase, Phase::Error);
        assert_eq!(
            state.current_error.map(|e| e.category),
            Some(ErrorCategory::Network)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn restarting_an_install_never_overlaps_calls() {
        let (orchestrator, backend) = setup(&[("ffmpeg", true)]);
        backend.install.script_install(
            "ffmpeg",
            Scripted::Delayed(Duration::from_secs(30), Ok(InstallResult::succeeded())),
        );

        let first = orchestrator.start_install("ffmpeg", InstallOptions::default());
        tokio::time::sleep(Duration::from_secs(1)).await;
        let second = orchestrator.start_install("ffmpeg", InstallOptions::default());
        first.await.unwrap();
        second.await.unwrap();

        assert_eq!(backend.install.max_concurrent_installs("ffmpeg"), 1);
        assert_eq!(backend.install.install_calls("ffmpeg"), 2);
        let state = orchestrator.store().snapshot();
        assert!(state.item("ffmpeg").unwrap().installed);
        assert!(!orchestrator.is_running(&OperationKey::Install("ffmpeg".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_ends_without_error() {
        let (orchestrator, backend) = setup(&[("ffmpeg", true)]);
        backend.install.script_install("ffmpeg", Scripted::Hang);

        let handle = orchestrator.start_install("ffmpeg", InstallOptions::default());
        tokio::time::sleep(Duration::from_secs(5)).await;
        orchestrator.cancel_install("ffmpeg");
        handle.await.unwrap();

        let state = orchestrator.store().snapshot();
        let item = state.item("ffmpeg").unwrap();
        assert!(!item.installing && !item.installed);
        assert_eq!(item.retry_count, 0);
        assert!(state.current_error.is_none());
        assert_ne!(state.status, Status::Installing);
    }

    #[tokio::test(start_paused = true)]
    async fn installed_items_are_not_reinstalled() {
        let (orchestrator, backend) = setup(&[("ffmpeg", true), ("git", false)]);
        orchestrator.install_all(&InstallOptions::default()).await;
        assert_eq!(backend.install.install_calls("ffmpeg"), 1);
        assert_eq!(backend.install.install_calls("git"), 1);

        orchestrator
            .start_install("ffmpeg", InstallOptions::default())
            .await
            .unwrap();
        assert_eq!(backend.install.install_calls("ffmpeg"), 1);
        assert!(orchestrator.install_missing(&InstallOptions::default()).is_empty());
    }
}
