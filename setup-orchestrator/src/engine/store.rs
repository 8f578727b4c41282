// Wizard store
//
// Owns the live `WizardState`. `dispatch` runs the transition engine under a short mutex and never
// awaits, so engine invocations are serialized. Applied transitions are broadcast to subscribers.

use log::{debug, info, warn};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::transition::{self, Disposition};
use crate::models::actions::{Action, ActionKind};
use crate::models::state::WizardState;

const CHANGE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct StateChange {
    pub action: ActionKind,
    pub correlation_id: String,
    pub revision: u64,
    pub snapshot: Arc<WizardState>,
}

pub struct WizardStore {
    state: Mutex<WizardState>,
    changes: broadcast::Sender<StateChange>,
    shutdown: CancellationToken,
}

impl WizardStore {
    pub fn create(initial: WizardState) -> Arc<Self> {
        Self::with_capacity(initial, CHANGE_CHANNEL_CAPACITY)
    }

    /// `create` with a change channel of `capacity`; slower subscribers lag past it.
    pub fn with_capacity(initial: WizardState, capacity: usize) -> Arc<Self> {
        let (changes, _) = broadcast::channel(capacity.max(1));
        Arc::new(Self {
            state: Mutex::new(initial),
            changes,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn dispatch(&self, action: impl Into<Action>) -> Disposition {
        let action: Action = action.into();
        let kind = action.kind.name();

        if self.shutdown.is_cancelled() {
            warn!(
                "[PHASE: store] [STEP: dispatch] Ignoring {} after dispose",
                kind
            );
            return Disposition::Rejected("store disposed");
        }

        let (outcome, from, change) = {
            let mut guard = self.lock_state();
            let from = (guard.phase, guard.status);
            let outcome = transition::apply(&guard, &action);
            let change = if outcome.disposition == Disposition::Applied {
                *guard = outcome.state.clone();
                Some(StateChange {
                    action: kind,
                    correlation_id: outcome.correlation_id.clone(),
                    revision: guard.revision,
                    snapshot: Arc::new(outcome.state.clone()),
                })
            } else {
                None
            };
            (outcome, from, change)
        };

        match &outcome.disposition {
            Disposition::Applied => info!(
                "[PHASE: store] [STEP: dispatch] {} applied phase={}->{} status={}->{} correlation_id={}",
                kind,
                from.0,
                outcome.state.phase,
                from.1,
                outcome.state.status,
                outcome.correlation_id
            ),
            Disposition::Unchanged => debug!(
                "[PHASE: store] [STEP: dispatch] {} unchanged correlation_id={}",
                kind, outcome.correlation_id
            ),
            Disposition::Stale => info!(
                "[PHASE: store] [STEP: dispatch] Dropped stale {} correlation_id={}",
                kind, outcome.correlation_id
            ),
            Disposition::Rejected(reason) => warn!(
                "[PHASE: store] [STEP: dispatch] {} rejected: {} correlation_id={}",
                kind, reason, outcome.correlation_id
            ),
        }

        if let Some(change) = change {
            // No subscribers is fine.
            let _ = self.changes.send(change);
        }
        outcome.disposition
    }

    pub fn snapshot(&self) -> WizardState {
        self.lock_state().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }

    /// Token cancelled by `dispose`; long-running tasks derive theirs from it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn dispose(&self) {
        if !self.shutdown.is_cancelled() {
            info!("[PHASE: store] [STEP: dispose] Cancelling in-flight work");
            self.shutdown.cancel();
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, WizardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::actions::WizardAction;
    use crate::models::state::{Phase, TierSelection};

    #[tokio::test]
    async fn applied_actions_are_broadcast() {
        let store = WizardStore::create(WizardState::default());
        let mut rx = store.subscribe();

        assert_eq!(store.dispatch(WizardAction::SetStep(1)), Disposition::Applied);
        let change = rx.recv().await.unwrap();
        assert_eq!(change.action, ActionKind::SetStep);
        assert_eq!(change.snapshot.phase, Phase::CheckingEnvironment);
        assert_eq!(change.revision, 1);
    }

    #[tokio::test]
    async fn unchanged_and_rejected_actions_are_not_broadcast() {
        let store = WizardStore::create(WizardState::default());
        let mut rx = store.subscribe();

        assert_eq!(
            store.dispatch(WizardAction::ClearError),
            Disposition::Unchanged
        );
        assert!(matches!(
            store.dispatch(WizardAction::SkipInstall {
                item_id: "nope".into()
            }),
            Disposition::Rejected(_)
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dispatch_after_dispose_is_ignored() {
        let store = WizardStore::create(WizardState::default());
        let token = store.shutdown_token();
        store.dispose();
        assert!(token.is_cancelled());
        assert_eq!(
            store.dispatch(WizardAction::SetTier(TierSelection::TierA)),
            Disposition::Rejected("store disposed")
        );
        assert_eq!(store.snapshot().tier_selection, TierSelection::Unset);
    }

    #[test]
    fn explicit_correlation_id_is_carried_to_the_log() {
        let store = WizardStore::create(WizardState::default());
        store.dispatch(Action::new(WizardAction::SetStep(2)).with_correlation("op-42"));
        let state = store.snapshot();
        assert_eq!(state.transition_log[0].correlation_id, "op-42");
    }
}
