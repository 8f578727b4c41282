// HTTP adapter for the setup backend
//
// Implements every remote port with one shared `reqwest::Client`. Transport failures are mapped to
// `ServiceError` by their type (timeout, connect, decode, status), never by message text.

use async_trait::async_trait;
use log::debug;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::io;
use std::time::Duration;
use url::Url;

use super::{CredentialStore, HardwareProbe, InstallService, ProgressBackend, ValidationService};
use crate::errors::ServiceError;
use crate::models::requests::{
    BasicValidationRequest, CompleteWizardRequest, EnhancedValidationRequest, InstallOptions,
    ResetWizardRequest, SaveProgressRequest, SetSecretRequest,
};
use crate::models::responses::{
    ApiResponse, BasicValidation, DependencyStatus, EnhancedValidation, InstallResult,
    ProbeResult, RescanEntry, ResumeStatus,
};
use crate::models::state::SecretValue;
use crate::utils::logging::mask_url_credentials;

const ERROR_BODY_LIMIT: usize = 200;

#[derive(Debug, Clone)]
pub struct ServiceEndpoints {
    /// Dependencies, validation and secrets.
    pub setup_api: Url,
    /// Wizard progress replication.
    pub progress_api: Url,
    /// Remote hardware probe; `None` probes locally.
    pub probe_api: Option<Url>,
}

pub struct HttpSetupBackend {
    client: Client,
    endpoints: ServiceEndpoints,
    request_timeout: Duration,
}

impl HttpSetupBackend {
    pub fn new(endpoints: ServiceEndpoints, request_timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            endpoints,
            request_timeout,
        })
    }

    async fn send_json<R: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<R, ServiceError> {
        let response = request
            .send()
            .await
            .map_err(|e| map_transport_error(e, self.request_timeout))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(error_from_status(status.as_u16(), &body));
        }
        response
            .json::<R>()
            .await
            .map_err(|e| map_transport_error(e, self.request_timeout))
    }

    async fn send_envelope<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<Option<T>, ServiceError> {
        let envelope: ApiResponse<T> = self.send_json(request).await?;
        if envelope.success {
            return Ok(envelope.data);
        }
        let message = envelope
            .error
            .or(envelope.message)
            .unwrap_or_else(|| "request failed".to_string());
        Err(ServiceError::from_reported(
            envelope.error_code.as_deref(),
            message,
        ))
    }

    fn probe_base(&self) -> &Url {
        self.endpoints
            .probe_api
            .as_ref()
            .unwrap_or(&self.endpoints.setup_api)
    }
}

/// Appends percent-encoded path segments to `base`.
pub fn endpoint(base: &Url, segments: &[&str]) -> Result<Url, ServiceError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| ServiceError::Rejected {
            code: Some("INVALID_BASE_URL".to_string()),
            message: format!("{} cannot be a base URL", mask_url_credentials(base.as_str())),
        })?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn error_from_status(status: u16, body: &str) -> ServiceError {
    // A typed failure code in the body wins over the bare status.
    if let Ok(envelope) = serde_json::from_str::<ApiResponse<serde_json::Value>>(body) {
        if let Some(code) = envelope.error_code.as_deref() {
            let message = envelope
                .error
                .clone()
                .unwrap_or_else(|| format!("HTTP {}", status));
            let typed = ServiceError::from_reported(Some(code), message);
            if !matches!(typed, ServiceError::Rejected { .. }) {
                return typed;
            }
        }
    }
    let mut message: String = body.chars().take(ERROR_BODY_LIMIT).collect();
    if message.trim().is_empty() {
        message = format!("HTTP {}", status);
    }
    ServiceError::Http { status, message }
}

fn io_error_kind(err: &(dyn StdError + 'static)) -> Option<io::ErrorKind> {
    let mut source = Some(err);
    while let Some(e) = source {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            return Some(io_err.kind());
        }
        source = e.source();
    }
    None
}

pub fn map_transport_error(err: reqwest::Error, timeout: Duration) -> ServiceError {
    if err.is_timeout() {
        return ServiceError::Timeout {
            after_ms: timeout.as_millis() as u64,
        };
    }
    if err.is_decode() {
        return ServiceError::MalformedResponse(err.to_string());
    }
    if err.is_connect() {
        return match io_error_kind(&err) {
            Some(io::ErrorKind::ConnectionRefused) => {
                ServiceError::ConnectionRefused(err.to_string())
            }
            Some(io::ErrorKind::TimedOut) => ServiceError::Timeout {
                after_ms: timeout.as_millis() as u64,
            },
            _ => ServiceError::Transport(err.to_string()),
        };
    }
    if let Some(status) = err.status() {
        return ServiceError::Http {
            status: status.as_u16(),
            message: err.to_string(),
        };
    }
    ServiceError::Transport(err.to_string())
}

#[async_trait]
impl InstallService for HttpSetupBackend {
    async fn install(
        &self,
        item_id: &str,
        options: &InstallOptions,
    ) -> Result<InstallResult, ServiceError> {
        let url = endpoint(
            &self.endpoints.setup_api,
            &["dependencies", item_id, "install"],
        )?;
        debug!("[PHASE: http] [STEP: install] POST {}", url);
        self.send_json(self.client.post(url).json(options)).await
    }

    async fn status(&self, item_id: &str) -> Result<DependencyStatus, ServiceError> {
        let url = endpoint(
            &self.endpoints.setup_api,
            &["dependencies", item_id, "status"],
        )?;
        self.send_json(self.client.get(url)).await
    }

    async fn rescan_all(&self) -> Result<Vec<RescanEntry>, ServiceError> {
        let url = endpoint(&self.endpoints.setup_api, &["dependencies", "rescan"])?;
        self.send_json(self.client.post(url)).await
    }
}

#[async_trait]
impl ValidationService for HttpSetupBackend {
    async fn validate_enhanced(
        &self,
        provider: &str,
        fields: &BTreeMap<String, String>,
    ) -> Result<EnhancedValidation, ServiceError> {
        let url = endpoint(
            &self.endpoints.setup_api,
            &["providers", provider, "validate"],
        )?;
        let body = EnhancedValidationRequest {
            provider: provider.to_string(),
            fields: fields.clone(),
        };
        self.send_json(self.client.post(url).json(&body)).await
    }

    async fn validate_basic(&self, providers: &[String]) -> Result<BasicValidation, ServiceError> {
        let url = endpoint(&self.endpoints.setup_api, &["providers", "validate"])?;
        let body = BasicValidationRequest {
            providers: providers.to_vec(),
        };
        self.send_json(self.client.post(url).json(&body)).await
    }
}

#[async_trait]
impl CredentialStore for HttpSetupBackend {
    async fn set_secret(&self, provider: &str, secret: &SecretValue) -> Result<(), ServiceError> {
        let url = endpoint(&self.endpoints.setup_api, &["secrets", provider])?;
        let body = SetSecretRequest {
            value: secret.expose().to_string(),
        };
        self.send_envelope::<serde_json::Value>(self.client.put(url).json(&body))
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl HardwareProbe for HttpSetupBackend {
    async fn run_probe(&self) -> Result<ProbeResult, ServiceError> {
        let url = endpoint(self.probe_base(), &["hardware", "probe"])?;
        self.send_json(self.client.get(url)).await
    }
}

#[async_trait]
impl ProgressBackend for HttpSetupBackend {
    async fn save_progress(&self, request: &SaveProgressRequest) -> Result<(), ServiceError> {
        let url = endpoint(&self.endpoints.progress_api, &["wizard", "progress"])?;
        self.send_envelope::<serde_json::Value>(self.client.post(url).json(request))
            .await
            .map(|_| ())
    }

    async fn get_status(&self, user_id: Option<&str>) -> Result<ResumeStatus, ServiceError> {
        let mut url = endpoint(&self.endpoints.progress_api, &["wizard", "status"])?;
        if let Some(user_id) = user_id {
            url.query_pairs_mut().append_pair("userId", user_id);
        }
        let status: Option<ResumeStatus> = self.send_envelope(self.client.get(url)).await?;
        Ok(status.unwrap_or_default())
    }

    async fn complete_wizard(&self, request: &CompleteWizardRequest) -> Result<(), ServiceError> {
        let url = endpoint(&self.endpoints.progress_api, &["wizard", "complete"])?;
        self.send_envelope::<serde_json::Value>(self.client.post(url).json(request))
            .await
            .map(|_| ())
    }

    async fn reset_wizard(&self, request: &ResetWizardRequest) -> Result<(), ServiceError> {
        let url = endpoint(&self.endpoints.progress_api, &["wizard", "reset"])?;
        self.send_envelope::<serde_json::Value>(self.client.post(url).json(request))
            .await
            .map(|_| ())
    }
}
