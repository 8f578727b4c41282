// Service ports
//
// Everything the orchestrators and the persistence manager talk to sits behind one of these
// traits. `http` talks to the real setup backend, `probe` inspects the local machine and
// `scripted` replays canned outcomes for tests and the smoke runner.

pub mod http;
pub mod probe;
pub mod scripted;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::errors::ServiceError;
use crate::models::requests::{
    CompleteWizardRequest, InstallOptions, ResetWizardRequest, SaveProgressRequest,
};
use crate::models::responses::{
    BasicValidation, DependencyStatus, EnhancedValidation, InstallResult, ProbeResult,
    RescanEntry, ResumeStatus,
};
use crate::models::state::SecretValue;

#[async_trait]
pub trait InstallService: Send + Sync {
    async fn install(
        &self,
        item_id: &str,
        options: &InstallOptions,
    ) -> Result<InstallResult, ServiceError>;

    async fn status(&self, item_id: &str) -> Result<DependencyStatus, ServiceError>;

    async fn rescan_all(&self) -> Result<Vec<RescanEntry>, ServiceError>;
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn set_secret(&self, provider: &str, secret: &SecretValue) -> Result<(), ServiceError>;
}

#[async_trait]
pub trait ValidationService: Send + Sync {
    async fn validate_enhanced(
        &self,
        provider: &str,
        fields: &BTreeMap<String, String>,
    ) -> Result<EnhancedValidation, ServiceError>;

    async fn validate_basic(&self, providers: &[String]) -> Result<BasicValidation, ServiceError>;
}

#[async_trait]
pub trait HardwareProbe: Send + Sync {
    async fn run_probe(&self) -> Result<ProbeResult, ServiceError>;
}

#[async_trait]
pub trait ProgressBackend: Send + Sync {
    async fn save_progress(&self, request: &SaveProgressRequest) -> Result<(), ServiceError>;

    async fn get_status(&self, user_id: Option<&str>) -> Result<ResumeStatus, ServiceError>;

    async fn complete_wizard(&self, request: &CompleteWizardRequest) -> Result<(), ServiceError>;

    async fn reset_wizard(&self, request: &ResetWizardRequest) -> Result<(), ServiceError>;
}

/// The service ports an `Orchestrator` drives.
#[derive(Clone)]
pub struct SetupServices {
    pub install: Arc<dyn InstallService>,
    pub validation: Arc<dyn ValidationService>,
    pub credentials: Arc<dyn CredentialStore>,
    pub probe: Arc<dyn HardwareProbe>,
}
