// Setup session
//
// Wires a store, its orchestrator and the persistence manager together. Saved progress is
// hydrated before the orchestrator is created so attempt generations continue above it.

use anyhow::{Context, Result};
use log::info;
use std::sync::Arc;

use crate::config::WizardConfig;
use crate::engine::WizardStore;
use crate::models::state::WizardState;
use crate::orchestrators::{OperationPolicy, Orchestrator};
use crate::persistence::{
    FileCache, LoadSource, LocalCache, PersistenceError, PersistenceHandle, PersistenceManager,
    ReplicationPolicy,
};
use crate::security::secret_box::{default_key_path, SecretBox};
use crate::services::http::HttpSetupBackend;
use crate::services::probe::LocalHardwareProbe;
use crate::services::{HardwareProbe, ProgressBackend, SetupServices};
use crate::utils::path_resolver;

pub struct SetupSession {
    pub store: Arc<WizardStore>,
    pub orchestrator: Arc<Orchestrator>,
    pub persistence: Arc<PersistenceManager>,
    pub resumed_from: LoadSource,
    handle: PersistenceHandle,
}

impl SetupSession {
    pub async fn start(
        services: SetupServices,
        persistence: Arc<PersistenceManager>,
        policy: OperationPolicy,
    ) -> Self {
        let store = WizardStore::create(WizardState::default());
        let resumed_from = persistence.hydrate(&store).await;
        let handle = persistence.attach(&store);
        let orchestrator = Orchestrator::new(Arc::clone(&store), services, policy);
        info!(
            "[PHASE: session] [STEP: start] session started (resumed_from={:?}, step={})",
            resumed_from,
            store.snapshot().step
        );
        Self {
            store,
            orchestrator,
            persistence,
            resumed_from,
            handle,
        }
    }

    /// Session against the configured HTTP backends.
    pub async fn connect(cfg: &WizardConfig) -> Result<Self> {
        let backend = Arc::new(http_backend(cfg)?);
        let probe: Arc<dyn HardwareProbe> = if cfg.services.probe_api_url.is_some() {
            backend.clone()
        } else {
            Arc::new(LocalHardwareProbe::new(OperationPolicy::from(cfg).probe_timeout))
        };
        let services = SetupServices {
            install: backend.clone(),
            validation: backend.clone(),
            credentials: backend.clone(),
            probe,
        };
        let persistence = persistence_for(cfg, backend);
        Ok(Self::start(services, persistence, OperationPolicy::from(cfg)).await)
    }

    pub async fn reset(&self, preserve_data: bool) -> Result<(), PersistenceError> {
        self.orchestrator.shutdown().await;
        self.persistence.reset(&self.store, preserve_data).await
    }

    /// Cancels in-flight work, disposes the store and flushes pending writes.
    pub async fn shutdown(self) {
        self.orchestrator.shutdown().await;
        self.store.dispose();
        self.handle.join().await;
        info!("[PHASE: session] [STEP: shutdown] session closed");
    }
}

pub fn http_backend(cfg: &WizardConfig) -> Result<HttpSetupBackend> {
    let endpoints = cfg.endpoints().context("Invalid service endpoints")?;
    HttpSetupBackend::new(endpoints, cfg.request_timeout())
}

/// Persistence over the configured cache file and `remote`.
pub fn persistence_for(
    cfg: &WizardConfig,
    remote: Arc<dyn ProgressBackend>,
) -> Arc<PersistenceManager> {
    let local: Arc<dyn LocalCache> = Arc::new(FileCache::new(cfg.cache_path()));
    let secrets = cfg.cache.encrypt_credentials.then(|| {
        Arc::new(SecretBox::new(default_key_path(
            &path_resolver::resolve_data_folder(),
        )))
    });
    PersistenceManager::new(
        local,
        remote,
        secrets,
        ReplicationPolicy::from(&cfg.replication),
        cfg.user_id.clone(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::actions::WizardAction;
    use crate::models::state::{steps, InstallItemSpec};
    use crate::persistence::MemoryCache;
    use crate::services::scripted::ScriptedBackend;

    #[tokio::test]
    async fn session_resumes_saved_progress() {
        let backend = ScriptedBackend::new(["ffmpeg"]);
        let local = Arc::new(MemoryCache::default());
        let persistence = PersistenceManager::new(
            local.clone(),
            backend.progress.clone(),
            None,
            ReplicationPolicy::default(),
            None,
        );

        let first =
            SetupSession::start(backend.services(), persistence.clone(), OperationPolicy::default())
                .await;
        assert_eq!(first.resumed_from, LoadSource::Default);
        first.store.dispatch(WizardAction::RegisterInstallItems(vec![
            InstallItemSpec::new("ffmpeg", "FFmpeg", true),
        ]));
        first.store.dispatch(WizardAction::SetStep(steps::HARDWARE));
        first.shutdown().await;

        let second =
            SetupSession::start(backend.services(), persistence, OperationPolicy::default()).await;
        assert_eq!(second.resumed_from, LoadSource::Remote);
        let state = second.store.snapshot();
        assert_eq!(state.step, steps::HARDWARE);
        assert_eq!(state.install_items.len(), 1);
        second.shutdown().await;
    }
}
