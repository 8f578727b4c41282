// Hardware detection

use log::{info, warn};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{new_correlation_id, Attempted, Orchestrator, OperationKey};
use crate::engine::transition::HARDWARE_COMPONENT;
use crate::errors::classifier::Operation;
use crate::models::actions::WizardAction;
use crate::models::responses::ProbeResult;
use crate::models::state::HardwareProfile;

impl From<ProbeResult> for HardwareProfile {
    fn from(probe: ProbeResult) -> Self {
        Self {
            gpu: probe.gpu,
            vram_gb: probe.vram_gb,
            supports_accelerated_workload: probe.supports_accelerated_workload,
        }
    }
}

impl Orchestrator {
    pub fn start_detection(self: &Arc<Self>) -> JoinHandle<()> {
        self.spawn_operation(OperationKey::Detect, |this, token| async move {
            this.run_detection(&token).await;
        })
    }

    async fn run_detection(&self, token: &CancellationToken) {
        if token.is_cancelled() || self.store.is_disposed() {
            return;
        }
        let correlation_id = new_correlation_id();
        self.dispatch(&correlation_id, WizardAction::DetectionStarted);
        info!(
            "[PHASE: detection] [STEP: probe] probing hardware correlation_id={}",
            correlation_id
        );

        let outcome = self
            .with_retries(
                token,
                self.policy.probe_timeout,
                Operation::HardwareProbe,
                Some(HARDWARE_COMPONENT),
                &correlation_id,
                || self.services.probe.run_probe(),
            )
            .await;

        let action = match outcome {
            Attempted::Done(result) => {
                let profile = HardwareProfile::from(result);
                info!(
                    "[PHASE: detection] [STEP: complete] gpu={:?} vram_gb={:?} recommended={:?} correlation_id={}",
                    profile.gpu,
                    profile.vram_gb,
                    profile.recommended_tier(),
                    correlation_id
                );
                WizardAction::DetectionSucceeded(profile)
            }
            Attempted::Failed(error) => {
                warn!(
                    "[PHASE: detection] [STEP: failed] {}: {} correlation_id={}",
                    error.code, error.message, correlation_id
                );
                WizardAction::DetectionFailed(error)
            }
            Attempted::Cancelled => {
                info!(
                    "[PHASE: detection] [STEP: cancel] detection cancelled correlation_id={}",
                    correlation_id
                );
                WizardAction::DetectionCancelled
            }
        };
        self.dispatch(&correlation_id, action);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::WizardStore;
    use crate::errors::ServiceError;
    use crate::models::state::{ErrorCategory, Phase, TierSelection, WizardState};
    use crate::orchestrators::OperationPolicy;
    use crate::services::scripted::{Scripted, ScriptedBackend};
    use std::time::Duration;

    fn setup() -> (Arc<Orchestrator>, ScriptedBackend) {
        let backend = ScriptedBackend::new(Vec::<String>::new());
        let store = WizardStore::create(WizardState::default());
        let orchestrator =
            Orchestrator::new(store, backend.services(), OperationPolicy::default());
        (orchestrator, backend)
    }

    #[tokio::test]
    async fn successful_probe_records_hardware() {
        let (orchestrator, backend) = setup();
        backend.probe.script(Scripted::ok(ProbeResult {
            gpu: Some("RTX 4090".to_string()),
            vram_gb: Some(24.0),
            supports_accelerated_workload: true,
        }));

        orchestrator.start_detection().await.unwrap();

        let state = orchestrator.store().snapshot();
        assert!(!state.detecting);
        let hardware = state.hardware.unwrap();
        assert_eq!(hardware.recommended_tier(), TierSelection::TierB);
        assert_eq!(state.phase, Phase::DependencyCheck);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_timeouts_are_retried_then_reported() {
        let (orchestrator, backend) = setup();
        for _ in 0..3 {
            backend.probe.script(Scripted::Hang);
        }

        orchestrator.start_detection().await.unwrap();

        let state = orchestrator.store().snapshot();
        assert_eq!(backend.probe.calls(), 3);
        assert!(!state.detecting);
        assert_eq!(state.phase, Phase::Error);
        let error = state.current_error.unwrap();
        assert_eq!(error.category, ErrorCategory::Network);
        assert_eq!(error.affected_component.as_deref(), Some(HARDWARE_COMPONENT));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_then_success() {
        let (orchestrator, backend) = setup();
        backend
            .probe
            .script(Scripted::err(ServiceError::Transport("reset by peer".into())));

        orchestrator.start_detection().await.unwrap();

        let state = orchestrator.store().snapshot();
        assert_eq!(backend.probe.calls(), 2);
        assert!(state.hardware.is_some());
        assert!(state.current_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_detection_clears_flag() {
        let (orchestrator, backend) = setup();
        backend.probe.script(Scripted::Hang);

        let handle = orchestrator.start_detection();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(orchestrator.store().snapshot().detecting);
        orchestrator.cancel_detection();
        handle.await.unwrap();

        let state = orchestrator.store().snapshot();
        assert!(!state.detecting);
        assert!(state.hardware.is_none());
        assert!(state.current_error.is_none());
    }
}
