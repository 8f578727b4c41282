// Persistence manager
//
// Observes the store. After every significant transition the snapshot is written to the local
// cache, then queued for remote replication. Replication runs on its own worker with a short
// retry budget; its failures are logged and never reach the local write or the wizard.

pub mod local;
pub mod snapshot;

use chrono::Utc;
use log::{error, info, warn};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::config::ReplicationConfig;
use crate::engine::{StateChange, WizardStore};
use crate::errors::ServiceError;
use crate::models::actions::{is_significant, Action, ActionKind, WizardAction};
use crate::models::requests::{CompleteWizardRequest, ResetWizardRequest, SaveProgressRequest};
use crate::models::state::WizardState;
use crate::orchestrators::new_correlation_id;
use crate::security::secret_box::SecretBox;
use crate::services::ProgressBackend;

pub use local::{FileCache, LocalCache, MemoryCache, PersistenceError};
pub use snapshot::PersistedSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicationPolicy {
    pub base: Duration,
    pub max_delay: Duration,
    pub retries: usize,
    pub timeout: Duration,
}

impl Default for ReplicationPolicy {
    fn default() -> Self {
        Self::from(&ReplicationConfig::default())
    }
}

impl From<&ReplicationConfig> for ReplicationPolicy {
    fn from(cfg: &ReplicationConfig) -> Self {
        Self {
            base: Duration::from_millis(cfg.base_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
            retries: cfg.retries,
            timeout: Duration::from_secs(cfg.timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    Remote,
    Local,
    Default,
}

#[derive(Debug, Clone)]
pub struct LoadedState {
    pub state: WizardState,
    pub source: LoadSource,
}

#[derive(Debug, Clone)]
enum RemoteJob {
    Save(SaveProgressRequest),
    Complete(CompleteWizardRequest),
    Reset(ResetWizardRequest),
}

impl RemoteJob {
    fn label(&self) -> &'static str {
        match self {
            RemoteJob::Save(_) => "save_progress",
            RemoteJob::Complete(_) => "complete_wizard",
            RemoteJob::Reset(_) => "reset_wizard",
        }
    }
}

/// Observer and replication worker of an attached manager.
pub struct PersistenceHandle {
    observer: JoinHandle<()>,
    replicator: JoinHandle<()>,
}

impl PersistenceHandle {
    /// Waits until pending writes are flushed. Returns once the store is disposed.
    pub async fn join(self) {
        if let Err(e) = self.observer.await {
            error!("[PHASE: persistence] [STEP: shutdown] observer task failed: {}", e);
        }
        if let Err(e) = self.replicator.await {
            error!("[PHASE: persistence] [STEP: shutdown] replicator task failed: {}", e);
        }
    }
}

pub struct PersistenceManager {
    local: Arc<dyn LocalCache>,
    remote: Arc<dyn ProgressBackend>,
    secrets: Option<Arc<SecretBox>>,
    policy: ReplicationPolicy,
    user_id: Option<String>,
    jobs: Mutex<Option<mpsc::UnboundedSender<RemoteJob>>>,
}

impl PersistenceManager {
    pub fn new(
        local: Arc<dyn LocalCache>,
        remote: Arc<dyn ProgressBackend>,
        secrets: Option<Arc<SecretBox>>,
        policy: ReplicationPolicy,
        user_id: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local,
            remote,
            secrets,
            policy,
            user_id,
            jobs: Mutex::new(None),
        })
    }

    fn lock_jobs(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<RemoteJob>>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts observing `store`. Runs until the store is disposed.
    pub fn attach(self: &Arc<Self>, store: &Arc<WizardStore>) -> PersistenceHandle {
        let changes = store.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        *self.lock_jobs() = Some(tx);

        let observer = tokio::spawn(Arc::clone(self).observe(Arc::clone(store), changes));
        let replicator = tokio::spawn(Arc::clone(self).replicate(rx));
        PersistenceHandle {
            observer,
            replicator,
        }
    }

    async fn observe(
        self: Arc<Self>,
        store: Arc<WizardStore>,
        mut changes: broadcast::Receiver<StateChange>,
    ) {
        let shutdown = store.shutdown_token();
        loop {
            tokio::select! {
                biased;
                received = changes.recv() => match received {
                    Ok(change) => self.on_change(&change).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            "[PHASE: persistence] [STEP: observe] missed {} change(s); saving current state",
                            skipped
                        );
                        self.persist(&store.snapshot(), &new_correlation_id()).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.cancelled() => break,
            }
        }

        loop {
            match changes.try_recv() {
                Ok(change) => self.on_change(&change).await,
                Err(broadcast::error::TryRecvError::Lagged(_)) => {
                    self.persist(&store.snapshot(), &new_correlation_id()).await;
                }
                Err(_) => break,
            }
        }
        // Dropping the sender lets the replicator drain and stop.
        self.lock_jobs().take();
        info!("[PHASE: persistence] [STEP: shutdown] observer stopped");
    }

    async fn on_change(&self, change: &StateChange) {
        if change.action == ActionKind::CompleteSetup {
            let snapshot = self.save_local(&change.snapshot).await;
            let request = CompleteWizardRequest {
                final_step: snapshot.step,
                final_state: remote_payload(&snapshot),
                correlation_id: change.correlation_id.clone(),
                user_id: self.user_id.clone(),
            };
            self.enqueue_or_drop(RemoteJob::Complete(request));
        } else if is_significant(change.action) {
            self.persist(&change.snapshot, &change.correlation_id).await;
        }
    }

    /// Local write, then queue replication.
    async fn persist(&self, state: &WizardState, correlation_id: &str) {
        let snapshot = self.save_local(state).await;
        let request = SaveProgressRequest {
            step: snapshot.step,
            state: remote_payload(&snapshot),
            correlation_id: correlation_id.to_string(),
            user_id: self.user_id.clone(),
        };
        self.enqueue_or_drop(RemoteJob::Save(request));
    }

    /// Writes the local snapshot. Failures are logged; the snapshot is returned either way.
    async fn save_local(&self, state: &WizardState) -> PersistedSnapshot {
        let mut snapshot = PersistedSnapshot::from_state(state, Utc::now());
        snapshot.encrypted_credentials = self.seal_credentials(state).await;
        if let Err(e) = self.local.save(&snapshot).await {
            error!(
                "[PHASE: persistence] [STEP: local] failed to save snapshot: {}",
                e
            );
        }
        snapshot
    }

    async fn seal_credentials(&self, state: &WizardState) -> BTreeMap<String, String> {
        let mut sealed = BTreeMap::new();
        let Some(secrets) = &self.secrets else {
            return sealed;
        };
        for (provider, secret) in &state.credentials {
            match secrets.seal(secret).await {
                Ok(value) => {
                    sealed.insert(provider.clone(), value);
                }
                Err(e) => warn!(
                    "[PHASE: persistence] [STEP: seal] omitting {} credential: {:#}",
                    provider, e
                ),
            }
        }
        sealed
    }

    async fn open_credentials(&self, state: &mut WizardState, sealed: &BTreeMap<String, String>) {
        let Some(secrets) = &self.secrets else {
            return;
        };
        for (provider, value) in sealed {
            if !SecretBox::is_sealed(value) {
                warn!(
                    "[PHASE: persistence] [STEP: open] ignoring unsealed {} credential",
                    provider
                );
                continue;
            }
            match secrets.open(value).await {
                Ok(secret) => {
                    state.credentials.insert(provider.clone(), secret);
                }
                Err(e) => warn!(
                    "[PHASE: persistence] [STEP: open] dropping unreadable {} credential: {:#}",
                    provider, e
                ),
            }
        }
    }

    fn enqueue(&self, job: RemoteJob) -> Result<(), RemoteJob> {
        match self.lock_jobs().as_ref() {
            Some(tx) => tx.send(job).map_err(|e| e.0),
            None => Err(job),
        }
    }

    fn enqueue_or_drop(&self, job: RemoteJob) {
        if let Err(job) = self.enqueue(job) {
            warn!(
                "[PHASE: persistence] [STEP: replicate] replication stopped; dropping {}",
                job.label()
            );
        }
    }

    async fn replicate(self: Arc<Self>, mut jobs: mpsc::UnboundedReceiver<RemoteJob>) {
        while let Some(job) = jobs.recv().await {
            if let Err(e) = self.send_remote(&job).await {
                warn!(
                    "[PHASE: persistence] [STEP: replicate] {} failed: {}",
                    job.label(),
                    e
                );
            }
        }
        info!("[PHASE: persistence] [STEP: shutdown] replicator stopped");
    }

    async fn send_remote(&self, job: &RemoteJob) -> Result<(), ServiceError> {
        let factor = (self.policy.base.as_millis() as u64 / 2).max(1);
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(self.policy.max_delay)
            .map(jitter)
            .take(self.policy.retries);
        let limit = self.policy.timeout;

        let attempt = || async move {
            let call = async {
                match job {
                    RemoteJob::Save(request) => self.remote.save_progress(request).await,
                    RemoteJob::Complete(request) => self.remote.complete_wizard(request).await,
                    RemoteJob::Reset(request) => self.remote.reset_wizard(request).await,
                }
            };
            match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => Err(ServiceError::Timeout {
                    after_ms: limit.as_millis() as u64,
                }),
            }
        };

        RetryIf::spawn(strategy, attempt, |e: &ServiceError| e.is_infrastructure()).await?;
        info!(
            "[PHASE: persistence] [STEP: replicate] {} replicated",
            job.label()
        );
        Ok(())
    }

    /// Prefers a reachable, non-empty remote state, then the local cache, then a fresh state.
    pub async fn load(&self) -> LoadedState {
        let local = match self.local.load().await {
            Ok(snapshot) => snapshot.filter(|s| {
                let compatible = s.is_compatible();
                if !compatible {
                    warn!(
                        "[PHASE: persistence] [STEP: load] ignoring local snapshot with schema version {}",
                        s.schema_version
                    );
                }
                compatible
            }),
            Err(e) => {
                warn!(
                    "[PHASE: persistence] [STEP: load] local snapshot unreadable: {}",
                    e
                );
                None
            }
        };
        let sealed = local
            .as_ref()
            .map(|s| s.encrypted_credentials.clone())
            .unwrap_or_default();

        if let Some(remote) = self.fetch_remote().await {
            info!("[PHASE: persistence] [STEP: load] resuming from remote progress");
            let mut state = remote.into_state();
            self.open_credentials(&mut state, &sealed).await;
            return LoadedState {
                state,
                source: LoadSource::Remote,
            };
        }
        if let Some(local) = local {
            info!("[PHASE: persistence] [STEP: load] resuming from local snapshot");
            let mut state = local.into_state();
            self.open_credentials(&mut state, &sealed).await;
            return LoadedState {
                state,
                source: LoadSource::Local,
            };
        }
        info!("[PHASE: persistence] [STEP: load] no saved progress; starting fresh");
        LoadedState {
            state: WizardState::default(),
            source: LoadSource::Default,
        }
    }

    async fn fetch_remote(&self) -> Option<PersistedSnapshot> {
        let user_id = self.user_id.as_deref();
        let status =
            match tokio::time::timeout(self.policy.timeout, self.remote.get_status(user_id)).await
            {
                Ok(Ok(status)) => status,
                Ok(Err(e)) => {
                    warn!(
                        "[PHASE: persistence] [STEP: load] remote progress unavailable: {}",
                        e
                    );
                    return None;
                }
                Err(_) => {
                    warn!("[PHASE: persistence] [STEP: load] remote progress timed out");
                    return None;
                }
            };
        if !status.can_resume {
            return None;
        }
        let value = status.state?;
        match serde_json::from_value::<PersistedSnapshot>(value) {
            Ok(snapshot) if snapshot.is_compatible() && !snapshot.is_empty() => Some(snapshot),
            Ok(_) => None,
            Err(e) => {
                warn!(
                    "[PHASE: persistence] [STEP: load] remote progress is not a snapshot: {}",
                    e
                );
                None
            }
        }
    }

    /// Loads saved progress into `store`.
    pub async fn hydrate(&self, store: &WizardStore) -> LoadSource {
        let loaded = self.load().await;
        if loaded.source != LoadSource::Default {
            store.dispatch(WizardAction::Hydrate(Box::new(loaded.state)));
        }
        loaded.source
    }

    /// Resets the wizard, clears the local cache and resets remote progress. While attached the
    /// remote call is queued behind pending replication.
    pub async fn reset(
        &self,
        store: &WizardStore,
        preserve_data: bool,
    ) -> Result<(), PersistenceError> {
        let correlation_id = new_correlation_id();
        store.dispatch(
            Action::new(WizardAction::ResetWizard { preserve_data })
                .with_correlation(&correlation_id),
        );
        self.local.clear().await?;
        if preserve_data {
            let snapshot = self.save_local(&store.snapshot()).await;
            info!(
                "[PHASE: persistence] [STEP: reset] kept {} install item(s) correlation_id={}",
                snapshot.install_items.len(),
                correlation_id
            );
        }

        let request = ResetWizardRequest {
            preserve_data,
            user_id: self.user_id.clone(),
        };
        match self.enqueue(RemoteJob::Reset(request)) {
            Ok(()) => Ok(()),
            Err(job) => self.send_remote(&job).await.map_err(PersistenceError::from),
        }
    }
}

fn remote_payload(snapshot: &PersistedSnapshot) -> serde_json::Value {
    serde_json::to_value(snapshot.without_credentials()).unwrap_or_else(|e| {
        error!(
            "[PHASE: persistence] [STEP: replicate] snapshot serialization failed: {}",
            e
        );
        serde_json::Value::Null
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::state::{
        steps, CredentialStatus, InstallItemSpec, SecretValue, TierSelection,
    };
    use crate::models::responses::ResumeStatus;
    use crate::security::secret_box::default_key_path;
    use crate::services::scripted::{Scripted, ScriptedProgressBackend};

    fn manager(
        local: Arc<dyn LocalCache>,
        remote: Arc<ScriptedProgressBackend>,
        secrets: Option<Arc<SecretBox>>,
    ) -> Arc<PersistenceManager> {
        PersistenceManager::new(
            local,
            remote,
            secrets,
            ReplicationPolicy::default(),
            Some("user-1".to_string()),
        )
    }

    #[tokio::test]
    async fn significant_changes_are_saved_and_replicated() {
        let local = Arc::new(MemoryCache::default());
        let remote = Arc::new(ScriptedProgressBackend::default());
        let persistence = manager(local.clone(), remote.clone(), None);
        let store = WizardStore::create(WizardState::default());
        let handle = persistence.attach(&store);

        store.dispatch(WizardAction::SetTier(TierSelection::TierB));
        store.dispatch(WizardAction::SetStep(steps::HARDWARE));
        store.dispatch(WizardAction::RegisterInstallItems(vec![InstallItemSpec::new(
            "ffmpeg", "FFmpeg", true,
        )]));
        store.dispose();
        handle.join().await;

        assert_eq!(local.save_count(), 2);
        let saved = local.load().await.unwrap().unwrap();
        assert_eq!(saved.step, steps::HARDWARE);
        assert_eq!(saved.tier_selection, TierSelection::TierB);

        let saves = remote.saves();
        assert_eq!(saves.len(), 2);
        assert_eq!(saves[1].step, steps::HARDWARE);
        assert_eq!(saves[1].user_id.as_deref(), Some("user-1"));
        assert!(!saves[0].correlation_id.is_empty());
    }

    #[tokio::test]
    async fn lagging_observer_still_saves_latest_state() {
        let local = Arc::new(MemoryCache::default());
        let remote = Arc::new(ScriptedProgressBackend::default());
        let persistence = manager(local.clone(), remote.clone(), None);
        let store = WizardStore::with_capacity(WizardState::default(), 2);
        let handle = persistence.attach(&store);

        // The observer cannot run before the first await, so it falls three changes behind.
        for step in [steps::HARDWARE, steps::DEPENDENCIES, steps::PROVIDERS, steps::REVIEW] {
            store.dispatch(WizardAction::SetStep(step));
        }
        store.dispatch(WizardAction::SetTier(TierSelection::TierB));
        store.dispose();
        handle.join().await;

        // One catch-up save of the current state, then the two changes still buffered.
        assert_eq!(local.save_count(), 3);
        let saved = local.load().await.unwrap().unwrap();
        assert_eq!(saved.step, steps::REVIEW);
        assert_eq!(saved.tier_selection, TierSelection::TierB);
        assert_eq!(remote.saves().len(), 3);
        assert!(remote.saves().iter().all(|s| s.step == steps::REVIEW));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_replication_failures_are_retried() {
        let local = Arc::new(MemoryCache::default());
        let remote = Arc::new(ScriptedProgressBackend::default());
        remote.fail_next_saves([ServiceError::Http {
            status: 503,
            message: "unavailable".into(),
        }]);
        let persistence = manager(local.clone(), remote.clone(), None);
        let store = WizardStore::create(WizardState::default());
        let handle = persistence.attach(&store);

        store.dispatch(WizardAction::SetStep(steps::HARDWARE));
        store.dispose();
        handle.join().await;

        assert_eq!(remote.saves().len(), 1);
    }

    #[tokio::test]
    async fn replication_rejection_does_not_affect_local_save() {
        let local = Arc::new(MemoryCache::default());
        let remote = Arc::new(ScriptedProgressBackend::default());
        remote.fail_next_saves([ServiceError::Http {
            status: 400,
            message: "bad request".into(),
        }]);
        let persistence = manager(local.clone(), remote.clone(), None);
        let store = WizardStore::create(WizardState::default());
        let handle = persistence.attach(&store);

        store.dispatch(WizardAction::SetStep(steps::HARDWARE));
        store.dispose();
        handle.join().await;

        assert!(remote.saves().is_empty());
        assert_eq!(local.load().await.unwrap().unwrap().step, steps::HARDWARE);
    }

    #[tokio::test]
    async fn saving_the_same_state_twice_reloads_identically() {
        let dir = tempfile::tempdir().unwrap();
        let local = Arc::new(FileCache::new(dir.path().join("wizard-state.json")));
        let remote = Arc::new(ScriptedProgressBackend::default());
        remote.set_status(Scripted::ok(ResumeStatus::default()));
        let persistence = manager(local, remote, None);

        let state = WizardState {
            step: steps::DEPENDENCIES,
            tier_selection: TierSelection::TierA,
            ..WizardState::default()
        };
        persistence.save_local(&state).await;
        let first = persistence.load().await;
        persistence.save_local(&state).await;
        let second = persistence.load().await;

        assert_eq!(first.source, LoadSource::Local);
        assert_eq!(first.state, second.state);

        persistence.save_local(&first.state).await;
        assert_eq!(persistence.load().await.state, first.state);
    }

    #[tokio::test]
    async fn load_prefers_remote_then_local_then_default() {
        let local = Arc::new(MemoryCache::default());
        let remote = Arc::new(ScriptedProgressBackend::default());
        let persistence = manager(local.clone(), remote.clone(), None);

        remote.set_status(Scripted::ok(ResumeStatus::default()));
        assert_eq!(persistence.load().await.source, LoadSource::Default);

        let local_state = WizardState {
            step: steps::HARDWARE,
            ..WizardState::default()
        };
        persistence.save_local(&local_state).await;
        assert_eq!(persistence.load().await.source, LoadSource::Local);

        remote.set_status(Scripted::err(ServiceError::ConnectionRefused(
            "refused".into(),
        )));
        assert_eq!(persistence.load().await.source, LoadSource::Local);

        let remote_state = WizardState {
            step: steps::PROVIDERS,
            ..WizardState::default()
        };
        let payload =
            remote_payload(&PersistedSnapshot::from_state(&remote_state, Utc::now()));
        remote.set_status(Scripted::ok(ResumeStatus {
            can_resume: true,
            state: Some(payload),
        }));
        let loaded = persistence.load().await;
        assert_eq!(loaded.source, LoadSource::Remote);
        assert_eq!(loaded.state.step, steps::PROVIDERS);
    }

    #[tokio::test]
    async fn credentials_are_sealed_locally_and_never_replicated() {
        let dir = tempfile::tempdir().unwrap();
        let secrets = Arc::new(SecretBox::new(default_key_path(dir.path())));
        let local = Arc::new(MemoryCache::default());
        let remote = Arc::new(ScriptedProgressBackend::default());
        let persistence = manager(local.clone(), remote.clone(), Some(secrets));

        let mut state = WizardState {
            step: steps::PROVIDERS,
            ..WizardState::default()
        };
        state
            .credentials
            .insert("openai".to_string(), SecretValue::new("sk-live-abcdef0123456789"));
        state
            .credential_status
            .insert("openai".to_string(), CredentialStatus::Valid);
        persistence.persist(&state, "tx-000001").await;

        let raw = local.raw().unwrap();
        assert!(!raw.contains("sk-live"));
        assert!(raw.contains("ENCv1:"));

        let loaded = persistence.load().await;
        assert_eq!(
            loaded.state.credentials["openai"].expose(),
            "sk-live-abcdef0123456789"
        );
        assert_eq!(
            loaded.state.credential_status["openai"],
            CredentialStatus::Valid
        );
    }

    #[tokio::test]
    async fn credentials_are_omitted_without_a_secret_box() {
        let local = Arc::new(MemoryCache::default());
        let remote = Arc::new(ScriptedProgressBackend::default());
        let persistence = manager(local.clone(), remote, None);
        let mut state = WizardState::default();
        state
            .credentials
            .insert("openai".to_string(), SecretValue::new("sk-live-abcdef0123456789"));
        persistence.save_local(&state).await;
        assert!(!local.raw().unwrap().contains("sk-live"));
        assert!(!local.raw().unwrap().contains("encryptedCredentials"));
    }

    #[tokio::test]
    async fn completion_is_reported() {
        let local = Arc::new(MemoryCache::default());
        let remote = Arc::new(ScriptedProgressBackend::default());
        let persistence = manager(local, remote.clone(), None);
        let mut initial = WizardState::default();
        initial
            .credential_status
            .insert("openai".to_string(), CredentialStatus::Valid);
        let store = WizardStore::create(initial);
        let handle = persistence.attach(&store);

        store.dispatch(WizardAction::CompleteSetup);
        store.dispose();
        handle.join().await;

        let completions = remote.completions();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].final_step, steps::READY);
    }

    #[tokio::test]
    async fn reset_clears_local_and_remote_progress() {
        let local = Arc::new(MemoryCache::default());
        let remote = Arc::new(ScriptedProgressBackend::default());
        let persistence = manager(local.clone(), remote.clone(), None);
        let store = WizardStore::create(WizardState {
            step: steps::PROVIDERS,
            ..WizardState::default()
        });
        persistence.save_local(&store.snapshot()).await;

        persistence.reset(&store, false).await.unwrap();

        assert!(local.raw().is_none());
        assert_eq!(store.snapshot().step, 0);
        let resets = remote.resets();
        assert_eq!(resets.len(), 1);
        assert!(!resets[0].preserve_data);
    }
}
