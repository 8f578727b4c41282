// Credential validation
//
// Enhanced validation first. When the enhanced path cannot be reached, basic validation decides.
// Only an explicit negative verdict marks a credential invalid.

use log::{error, info, warn};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{call_with_timeout, new_correlation_id, sleep_or_cancel, CallOutcome, Orchestrator, OperationKey};
use crate::engine::Disposition;
use crate::errors::classifier::{classify, FailureEntity, Operation};
use crate::errors::ServiceError;
use crate::models::actions::WizardAction;
use crate::models::state::{FieldError, SecretValue};
use crate::security::crypto::secret_fingerprint;

/// Field name carrying the secret in enhanced validation requests.
pub const API_KEY_FIELD: &str = "apiKey";

enum Verdict {
    Accepted(String),
    Rejected {
        message: String,
        field_errors: Vec<FieldError>,
        failure: ServiceError,
    },
    Unavailable(ServiceError),
    Cancelled,
}

fn provider_key_regex() -> Option<&'static Regex> {
    static PROVIDER_KEY: OnceLock<Option<Regex>> = OnceLock::new();
    PROVIDER_KEY
        .get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9_-]{0,63}$").ok())
        .as_ref()
}

/// Provider keys are lowercase slugs: `openai`, `azure-openai`, `local_llm`.
pub fn is_valid_provider_key(provider: &str) -> bool {
    provider_key_regex().is_some_and(|re| re.is_match(provider))
}

impl Orchestrator {
    /// Validates the credential entered for `provider`. `extra_fields` are sent alongside the
    /// secret to enhanced validation.
    pub fn start_validation(
        self: &Arc<Self>,
        provider: &str,
        extra_fields: BTreeMap<String, String>,
    ) -> JoinHandle<()> {
        let key = OperationKey::Validate(provider.to_string());
        let provider = provider.to_string();
        self.spawn_operation(key, move |this, token| async move {
            this.run_validation(&provider, extra_fields, &token).await;
        })
    }

    async fn run_validation(
        &self,
        provider: &str,
        mut fields: BTreeMap<String, String>,
        token: &CancellationToken,
    ) {
        let correlation_id = new_correlation_id();
        if token.is_cancelled() {
            return;
        }

        if !is_valid_provider_key(provider) {
            warn!(
                "[PHASE: validation] [STEP: guard] rejected malformed provider key {:?} correlation_id={}",
                provider, correlation_id
            );
            let failure = ServiceError::Rejected {
                code: Some("INVALID_PROVIDER".to_string()),
                message: format!("'{}' is not a valid provider key", provider),
            };
            let ctx = self
                .context(Operation::Validation, &correlation_id, 0)
                .component(provider);
            self.dispatch(&correlation_id, WizardAction::ReportError(classify(&failure, &ctx)));
            return;
        }

        let Some(secret) = self.store.snapshot().credentials.get(provider).cloned() else {
            warn!(
                "[PHASE: validation] [STEP: guard] no credential entered for {} correlation_id={}",
                provider, correlation_id
            );
            let failure = ServiceError::Rejected {
                code: Some("MISSING_CREDENTIAL".to_string()),
                message: format!("no credential entered for '{}'", provider),
            };
            let ctx = self
                .context(Operation::Validation, &correlation_id, 0)
                .component(provider);
            self.dispatch(&correlation_id, WizardAction::ReportError(classify(&failure, &ctx)));
            return;
        };
        fields.insert(API_KEY_FIELD.to_string(), secret.expose().to_string());

        let retry = self.policy.retry;
        let mut attempt: u32 = 0;
        loop {
            if token.is_cancelled() {
                return;
            }
            let generation = self.next_generation();
            let disposition = self.dispatch(
                &correlation_id,
                WizardAction::StartValidation {
                    provider: provider.to_string(),
                    generation,
                },
            );
            if disposition != Disposition::Applied {
                info!(
                    "[PHASE: validation] [STEP: start] {} not started ({}) correlation_id={}",
                    provider, disposition, correlation_id
                );
                return;
            }
            info!(
                "[PHASE: validation] [STEP: start] {} attempt {} key={} correlation_id={}",
                provider,
                attempt + 1,
                secret_fingerprint(secret.expose()),
                correlation_id
            );

            let failure = match self.verdict(provider, &fields, token, &correlation_id).await {
                Verdict::Accepted(message) => {
                    info!(
                        "[PHASE: validation] [STEP: complete] {} accepted correlation_id={}",
                        provider, correlation_id
                    );
                    let applied = self.dispatch(
                        &correlation_id,
                        WizardAction::CredentialValidated {
                            provider: provider.to_string(),
                            generation,
                            message,
                        },
                    );
                    if applied == Disposition::Applied {
                        self.store_secret(provider, &secret, token, &correlation_id)
                            .await;
                    }
                    return;
                }
                Verdict::Rejected {
                    message,
                    field_errors,
                    failure,
                } => {
                    warn!(
                        "[PHASE: validation] [STEP: complete] {} rejected: {} correlation_id={}",
                        provider, message, correlation_id
                    );
                    let ctx = self
                        .context(Operation::Validation, &correlation_id, attempt)
                        .component(provider)
                        .entity(FailureEntity::Secret);
                    self.dispatch(
                        &correlation_id,
                        WizardAction::CredentialRejected {
                            provider: provider.to_string(),
                            generation,
                            message,
                            field_errors,
                            error: classify(&failure, &ctx),
                        },
                    );
                    return;
                }
                Verdict::Cancelled => {
                    info!(
                        "[PHASE: validation] [STEP: cancel] {} cancelled correlation_id={}",
                        provider, correlation_id
                    );
                    self.dispatch(
                        &correlation_id,
                        WizardAction::ValidationCancelled {
                            provider: provider.to_string(),
                            generation,
                        },
                    );
                    return;
                }
                Verdict::Unavailable(failure) => failure,
            };

            let ctx = self
                .context(Operation::Validation, &correlation_id, attempt)
                .component(provider);
            let error = classify(&failure, &ctx);
            if error.can_retry && attempt + 1 < retry.max_attempts {
                let delay = retry.delay_for(attempt);
                warn!(
                    "[PHASE: validation] [STEP: retry] {} unavailable ({}); retrying in {}ms correlation_id={}",
                    provider,
                    error.code,
                    delay.as_millis(),
                    correlation_id
                );
                // The provider stays Validating across the backoff.
                if !sleep_or_cancel(token, delay).await {
                    self.dispatch(
                        &correlation_id,
                        WizardAction::ValidationCancelled {
                            provider: provider.to_string(),
                            generation,
                        },
                    );
                    return;
                }
                attempt += 1;
                continue;
            }

            error!(
                "[PHASE: validation] [STEP: failed] {} could not be validated: {} ({}) correlation_id={}",
                provider, error.code, failure, correlation_id
            );
            self.dispatch(
                &correlation_id,
                WizardAction::ValidationFailed {
                    provider: provider.to_string(),
                    generation,
                    error,
                },
            );
            return;
        }
    }

    async fn verdict(
        &self,
        provider: &str,
        fields: &BTreeMap<String, String>,
        token: &CancellationToken,
        correlation_id: &str,
    ) -> Verdict {
        let limit = self.policy.validation_timeout;
        let enhanced = self.services.validation.validate_enhanced(provider, fields);
        match call_with_timeout(token, limit, enhanced).await {
            CallOutcome::Completed(result) if result.is_valid => {
                return Verdict::Accepted(result.message)
            }
            CallOutcome::Completed(result) => {
                let message = if result.message.is_empty() {
                    "Credentials were rejected".to_string()
                } else {
                    result.message
                };
                return Verdict::Rejected {
                    failure: ServiceError::InvalidCredentials(message.clone()),
                    message,
                    field_errors: result.field_errors,
                };
            }
            CallOutcome::Cancelled => return Verdict::Cancelled,
            CallOutcome::Failed(failure) if failure.is_credential_rejection() => {
                return Verdict::Rejected {
                    message: failure.to_string(),
                    field_errors: Vec::new(),
                    failure,
                };
            }
            CallOutcome::Failed(failure) if !failure.is_infrastructure() => {
                return Verdict::Unavailable(failure);
            }
            CallOutcome::Failed(failure) => {
                warn!(
                    "[PHASE: validation] [STEP: enhanced] {} unreachable ({}); falling back to basic validation correlation_id={}",
                    provider, failure, correlation_id
                );
            }
        }

        let providers = vec![provider.to_string()];
        let basic = self.services.validation.validate_basic(&providers);
        match call_with_timeout(token, limit, basic).await {
            CallOutcome::Completed(result) => {
                match result.results.into_iter().find(|r| r.name == provider) {
                    Some(entry) if entry.ok => Verdict::Accepted(
                        entry
                            .details
                            .unwrap_or_else(|| "Credentials accepted".to_string()),
                    ),
                    Some(entry) => {
                        let message = entry
                            .details
                            .unwrap_or_else(|| "Credentials were rejected".to_string());
                        Verdict::Rejected {
                            failure: ServiceError::InvalidCredentials(message.clone()),
                            message,
                            field_errors: Vec::new(),
                        }
                    }
                    None => Verdict::Unavailable(ServiceError::MalformedResponse(format!(
                        "basic validation returned no result for {}",
                        provider
                    ))),
                }
            }
            CallOutcome::Cancelled => Verdict::Cancelled,
            CallOutcome::Failed(failure) if failure.is_credential_rejection() => {
                Verdict::Rejected {
                    message: failure.to_string(),
                    field_errors: Vec::new(),
                    failure,
                }
            }
            CallOutcome::Failed(failure) => Verdict::Unavailable(failure),
        }
    }

    /// Writes an accepted secret to the credential store. A failure is reported but leaves the
    /// verdict in place.
    async fn store_secret(
        &self,
        provider: &str,
        secret: &SecretValue,
        token: &CancellationToken,
        correlation_id: &str,
    ) {
        let write = self.services.credentials.set_secret(provider, secret);
        match call_with_timeout(token, self.policy.validation_timeout, write).await {
            CallOutcome::Completed(()) => info!(
                "[PHASE: validation] [STEP: store] saved {} credential key={} correlation_id={}",
                provider,
                secret_fingerprint(secret.expose()),
                correlation_id
            ),
            CallOutcome::Cancelled => warn!(
                "[PHASE: validation] [STEP: store] saving {} credential cancelled correlation_id={}",
                provider, correlation_id
            ),
            CallOutcome::Failed(failure) => {
                error!(
                    "[PHASE: validation] [STEP: store] saving {} credential failed: {} correlation_id={}",
                    provider, failure, correlation_id
                );
                let ctx = self
                    .context(Operation::CredentialStore, correlation_id, 0)
                    .component(provider);
                self.dispatch(correlation_id, WizardAction::ReportError(classify(&failure, &ctx)));
            }
        }
    }
}
