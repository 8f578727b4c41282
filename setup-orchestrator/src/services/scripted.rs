// Scripted in-memory services
//
// Deterministic stand-ins for the remote ports. Each call pops the next scripted outcome for its
// key, falling back to a sensible success. Used by the smoke runner and the test suites.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{
    CredentialStore, HardwareProbe, InstallService, ProgressBackend, SetupServices,
    ValidationService,
};
use crate::errors::ServiceError;
use crate::models::requests::{
    CompleteWizardRequest, InstallOptions, ResetWizardRequest, SaveProgressRequest,
};
use crate::models::responses::{
    BasicValidation, BasicValidationResult, DependencyStatus, EnhancedValidation, InstallResult,
    ProbeResult, RescanEntry, RescanStatus, ResumeStatus,
};
use crate::models::state::SecretValue;
use crate::security::crypto::secret_fingerprint;

#[derive(Debug, Clone)]
pub enum Scripted<T> {
    Reply(Result<T, ServiceError>),
    /// Never completes; the caller's timeout or cancellation must end it.
    Hang,
    Delayed(Duration, Result<T, ServiceError>),
}

impl<T> Scripted<T> {
    pub fn ok(value: T) -> Self {
        Scripted::Reply(Ok(value))
    }

    pub fn err(error: ServiceError) -> Self {
        Scripted::Reply(Err(error))
    }

    async fn play(self) -> Result<T, ServiceError> {
        match self {
            Scripted::Reply(result) => result,
            Scripted::Hang => std::future::pending().await,
            Scripted::Delayed(delay, result) => {
                tokio::time::sleep(delay).await;
                result
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn pop<T>(queues: &mut HashMap<String, VecDeque<Scripted<T>>>, key: &str) -> Option<Scripted<T>> {
    queues.get_mut(key).and_then(VecDeque::pop_front)
}

// =========================
// Install
// =========================

#[derive(Default)]
struct InstallScript {
    installs: HashMap<String, VecDeque<Scripted<InstallResult>>>,
    statuses: HashMap<String, VecDeque<Scripted<DependencyStatus>>>,
    rescans: VecDeque<Scripted<Vec<RescanEntry>>>,
    known: BTreeSet<String>,
    installed: BTreeSet<String>,
    calls: Vec<String>,
    active: HashMap<String, usize>,
    max_active: HashMap<String, usize>,
}

#[derive(Default)]
pub struct ScriptedInstallService {
    script: Mutex<InstallScript>,
}

/// Tracks concurrent `install` calls per item; released on drop so cancelled calls count too.
struct ActiveCall<'a> {
    script: &'a Mutex<InstallScript>,
    item_id: String,
}

impl<'a> ActiveCall<'a> {
    fn enter(script: &'a Mutex<InstallScript>, item_id: &str) -> Self {
        let mut guard = lock(script);
        let active = guard.active.entry(item_id.to_string()).or_insert(0);
        *active += 1;
        let now = *active;
        let max = guard.max_active.entry(item_id.to_string()).or_insert(0);
        *max = (*max).max(now);
        Self {
            script,
            item_id: item_id.to_string(),
        }
    }
}

impl Drop for ActiveCall<'_> {
    fn drop(&mut self) {
        let mut guard = lock(self.script);
        if let Some(active) = guard.active.get_mut(&self.item_id) {
            *active = active.saturating_sub(1);
        }
    }
}

impl ScriptedInstallService {
    pub fn with_items<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let service = Self::default();
        lock(&service.script).known = items.into_iter().map(Into::into).collect();
        service
    }

    pub fn script_install(&self, item_id: &str, step: Scripted<InstallResult>) {
        lock(&self.script)
            .installs
            .entry(item_id.to_string())
            .or_default()
            .push_back(step);
    }

    pub fn script_status(&self, item_id: &str, step: Scripted<DependencyStatus>) {
        lock(&self.script)
            .statuses
            .entry(item_id.to_string())
            .or_default()
            .push_back(step);
    }

    pub fn script_rescan(&self, step: Scripted<Vec<RescanEntry>>) {
        lock(&self.script).rescans.push_back(step);
    }

    pub fn mark_installed(&self, item_id: &str) {
        lock(&self.script).installed.insert(item_id.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.script).calls.clone()
    }

    pub fn install_calls(&self, item_id: &str) -> usize {
        let needle = format!("install:{}", item_id);
        lock(&self.script)
            .calls
            .iter()
            .filter(|c| **c == needle)
            .count()
    }

    pub fn max_concurrent_installs(&self, item_id: &str) -> usize {
        lock(&self.script)
            .max_active
            .get(item_id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl InstallService for ScriptedInstallService {
    async fn install(
        &self,
        item_id: &str,
        _options: &InstallOptions,
    ) -> Result<InstallResult, ServiceError> {
        let step = {
            let mut script = lock(&self.script);
            script.calls.push(format!("install:{}", item_id));
            pop(&mut script.installs, item_id)
        };
        let _active = ActiveCall::enter(&self.script, item_id);
        let result = step
            .unwrap_or_else(|| Scripted::ok(InstallResult::succeeded()))
            .play()
            .await;
        if matches!(&result, Ok(r) if r.success) {
            lock(&self.script).installed.insert(item_id.to_string());
        }
        result
    }

    async fn status(&self, item_id: &str) -> Result<DependencyStatus, ServiceError> {
        let (step, installed) = {
            let mut script = lock(&self.script);
            script.calls.push(format!("status:{}", item_id));
            (
                pop(&mut script.statuses, item_id),
                script.installed.contains(item_id),
            )
        };
        step.unwrap_or_else(|| {
            Scripted::ok(DependencyStatus {
                installed,
                valid: installed,
                version: None,
            })
        })
        .play()
        .await
    }

    async fn rescan_all(&self) -> Result<Vec<RescanEntry>, ServiceError> {
        let (step, entries) = {
            let mut script = lock(&self.script);
            script.calls.push("rescan".to_string());
            let entries: Vec<RescanEntry> = script
                .known
                .iter()
                .map(|id| RescanEntry {
                    id: id.clone(),
                    status: if script.installed.contains(id) {
                        RescanStatus::Installed
                    } else {
                        RescanStatus::Missing
                    },
                })
                .collect();
            (script.rescans.pop_front(), entries)
        };
        step.unwrap_or_else(|| Scripted::ok(entries)).play().await
    }
}

// =========================
// Validation
// =========================

#[derive(Default)]
struct ValidationScript {
    enhanced: HashMap<String, VecDeque<Scripted<EnhancedValidation>>>,
    basic: VecDeque<Scripted<BasicValidation>>,
    calls: Vec<String>,
}

#[derive(Default)]
pub struct ScriptedValidationService {
    script: Mutex<ValidationScript>,
}

impl ScriptedValidationService {
    pub fn script_enhanced(&self, provider: &str, step: Scripted<EnhancedValidation>) {
        lock(&self.script)
            .enhanced
            .entry(provider.to_string())
            .or_default()
            .push_back(step);
    }

    pub fn script_basic(&self, step: Scripted<BasicValidation>) {
        lock(&self.script).basic.push_back(step);
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.script).calls.clone()
    }
}

#[async_trait]
impl ValidationService for ScriptedValidationService {
    async fn validate_enhanced(
        &self,
        provider: &str,
        _fields: &BTreeMap<String, String>,
    ) -> Result<EnhancedValidation, ServiceError> {
        let step = {
            let mut script = lock(&self.script);
            script.calls.push(format!("enhanced:{}", provider));
            pop(&mut script.enhanced, provider)
        };
        step.unwrap_or_else(|| {
            Scripted::ok(EnhancedValidation {
                is_valid: true,
                message: "Credentials accepted".to_string(),
                field_errors: Vec::new(),
            })
        })
        .play()
        .await
    }

    async fn validate_basic(&self, providers: &[String]) -> Result<BasicValidation, ServiceError> {
        let step = {
            let mut script = lock(&self.script);
            script.calls.push(format!("basic:{}", providers.join(",")));
            script.basic.pop_front()
        };
        let default = BasicValidation {
            results: providers
                .iter()
                .map(|name| BasicValidationResult {
                    name: name.clone(),
                    ok: true,
                    details: None,
                })
                .collect(),
        };
        step.unwrap_or_else(|| Scripted::ok(default)).play().await
    }
}

// =========================
// Credentials / probe
// =========================

#[derive(Default)]
pub struct ScriptedCredentialStore {
    failures: Mutex<VecDeque<ServiceError>>,
    stored: Mutex<BTreeMap<String, String>>,
}

impl ScriptedCredentialStore {
    pub fn fail_next(&self, error: ServiceError) {
        lock(&self.failures).push_back(error);
    }

    /// Provider to secret fingerprint for every stored secret.
    pub fn stored(&self) -> BTreeMap<String, String> {
        lock(&self.stored).clone()
    }
}

#[async_trait]
impl CredentialStore for ScriptedCredentialStore {
    async fn set_secret(&self, provider: &str, secret: &SecretValue) -> Result<(), ServiceError> {
        if let Some(error) = lock(&self.failures).pop_front() {
            return Err(error);
        }
        lock(&self.stored).insert(provider.to_string(), secret_fingerprint(secret.expose()));
        Ok(())
    }
}

#[derive(Default)]
pub struct ScriptedProbe {
    steps: Mutex<VecDeque<Scripted<ProbeResult>>>,
    calls: Mutex<usize>,
}

impl ScriptedProbe {
    pub fn script(&self, step: Scripted<ProbeResult>) {
        lock(&self.steps).push_back(step);
    }

    pub fn calls(&self) -> usize {
        *lock(&self.calls)
    }
}

#[async_trait]
impl HardwareProbe for ScriptedProbe {
    async fn run_probe(&self) -> Result<ProbeResult, ServiceError> {
        *lock(&self.calls) += 1;
        let step = lock(&self.steps).pop_front();
        step.unwrap_or_else(|| Scripted::ok(ProbeResult::cpu_only()))
            .play()
            .await
    }
}

// =========================
// Progress replication
// =========================

#[derive(Default)]
struct ProgressScript {
    status: Option<Scripted<ResumeStatus>>,
    save_failures: VecDeque<ServiceError>,
    saves: Vec<SaveProgressRequest>,
    completions: Vec<CompleteWizardRequest>,
    resets: Vec<ResetWizardRequest>,
}

#[derive(Default)]
pub struct ScriptedProgressBackend {
    script: Mutex<ProgressScript>,
}

impl ScriptedProgressBackend {
    /// Every `get_status` call replays this outcome.
    pub fn set_status(&self, step: Scripted<ResumeStatus>) {
        lock(&self.script).status = Some(step);
    }

    pub fn fail_next_saves(&self, errors: impl IntoIterator<Item = ServiceError>) {
        lock(&self.script).save_failures.extend(errors);
    }

    pub fn saves(&self) -> Vec<SaveProgressRequest> {
        lock(&self.script).saves.clone()
    }

    pub fn completions(&self) -> Vec<CompleteWizardRequest> {
        lock(&self.script).completions.clone()
    }

    pub fn resets(&self) -> Vec<ResetWizardRequest> {
        lock(&self.script).resets.clone()
    }
}

#[async_trait]
impl ProgressBackend for ScriptedProgressBackend {
    async fn save_progress(&self, request: &SaveProgressRequest) -> Result<(), ServiceError> {
        let mut script = lock(&self.script);
        if let Some(error) = script.save_failures.pop_front() {
            return Err(error);
        }
        script.saves.push(request.clone());
        Ok(())
    }

    async fn get_status(&self, _user_id: Option<&str>) -> Result<ResumeStatus, ServiceError> {
        let step = lock(&self.script).status.clone();
        match step {
            Some(step) => step.play().await,
            None => {
                let latest = lock(&self.script).saves.last().map(|s| s.state.clone());
                Ok(ResumeStatus {
                    can_resume: latest.is_some(),
                    state: latest,
                })
            }
        }
    }

    async fn complete_wizard(&self, request: &CompleteWizardRequest) -> Result<(), ServiceError> {
        lock(&self.script).completions.push(request.clone());
        Ok(())
    }

    async fn reset_wizard(&self, request: &ResetWizardRequest) -> Result<(), ServiceError> {
        let mut script = lock(&self.script);
        script.resets.push(request.clone());
        if !request.preserve_data {
            script.saves.clear();
        }
        Ok(())
    }
}

/// One scripted instance of every port.
#[derive(Clone)]
pub struct ScriptedBackend {
    pub install: Arc<ScriptedInstallService>,
    pub validation: Arc<ScriptedValidationService>,
    pub credentials: Arc<ScriptedCredentialStore>,
    pub probe: Arc<ScriptedProbe>,
    pub progress: Arc<ScriptedProgressBackend>,
}

impl ScriptedBackend {
    pub fn new<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            install: Arc::new(ScriptedInstallService::with_items(items)),
            validation: Arc::new(ScriptedValidationService::default()),
            credentials: Arc::new(ScriptedCredentialStore::default()),
            probe: Arc::new(ScriptedProbe::default()),
            progress: Arc::new(ScriptedProgressBackend::default()),
        }
    }

    pub fn services(&self) -> SetupServices {
        SetupServices {
            install: self.install.clone(),
            validation: self.validation.clone(),
            credentials: self.credentials.clone(),
            probe: self.probe.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn install_defaults_to_success_and_marks_installed() {
        let service = ScriptedInstallService::with_items(["ffmpeg"]);
        let result = service
            .install("ffmpeg", &InstallOptions::default())
            .await
            .unwrap();
        assert!(result.success);
        assert!(service.status("ffmpeg").await.unwrap().installed);
        let rescan = service.rescan_all().await.unwrap();
        assert_eq!(rescan[0].status, RescanStatus::Installed);
        assert_eq!(service.calls(), vec!["install:ffmpeg", "status:ffmpeg", "rescan"]);
    }

    #[tokio::test]
    async fn scripted_failures_are_replayed_in_order() {
        let service = ScriptedInstallService::default();
        service.script_install("cuda", Scripted::err(ServiceError::DiskSpace("full".into())));
        let first = service.install("cuda", &InstallOptions::default()).await;
        assert!(first.is_err());
        let second = service.install("cuda", &InstallOptions::default()).await;
        assert!(second.unwrap().success);
        assert_eq!(service.max_concurrent_installs("cuda"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_replies_wait_for_virtual_time() {
        let probe = ScriptedProbe::default();
        probe.script(Scripted::Delayed(
            Duration::from_secs(30),
            Ok(ProbeResult::cpu_only()),
        ));
        let started = tokio::time::Instant::now();
        probe.run_probe().await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test]
    async fn credential_store_keeps_only_fingerprints() {
        let store = ScriptedCredentialStore::default();
        store
            .set_secret("openai", &SecretValue::new("sk-abcdefghijklmnop"))
            .await
            .unwrap();
        let stored = store.stored();
        assert_eq!(stored["openai"].len(), 12);
        assert!(!stored["openai"].contains("abcdef"));
    }
}
