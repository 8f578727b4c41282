// Error classifier
//
// Turns a typed `ServiceError` plus the context of the failing call into the user-facing
// `WizardError`. Pure: no I/O, no clock, no knowledge of the HTTP client.

use chrono::{DateTime, Utc};

use super::ServiceError;
use crate::models::state::{ErrorCategory, WizardError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    HardwareProbe,
    Install,
    InstallStatus,
    Rescan,
    Validation,
    CredentialStore,
    Persistence,
}

impl Operation {
    fn code_prefix(self) -> &'static str {
        match self {
            Operation::HardwareProbe => "PROBE",
            Operation::Install => "INSTALL",
            Operation::InstallStatus => "INSTALL_STATUS",
            Operation::Rescan => "RESCAN",
            Operation::Validation => "VALIDATION",
            Operation::CredentialStore => "CREDENTIAL_STORE",
            Operation::Persistence => "PERSISTENCE",
        }
    }

    fn describe(self, component: Option<&str>) -> String {
        let subject = component.unwrap_or("setup");
        match self {
            Operation::HardwareProbe => "Hardware detection".to_string(),
            Operation::Install => format!("Installing {}", subject),
            Operation::InstallStatus => format!("Checking {}", subject),
            Operation::Rescan => "Dependency rescan".to_string(),
            Operation::Validation => format!("Validating {} credentials", subject),
            Operation::CredentialStore => format!("Saving {} credentials", subject),
            Operation::Persistence => "Saving progress".to_string(),
        }
    }

    /// Kind of resource the operation acts on, absent an override.
    fn default_entity(self) -> FailureEntity {
        match self {
            Operation::Validation => FailureEntity::Secret,
            Operation::CredentialStore | Operation::Persistence => FailureEntity::Filesystem,
            _ => FailureEntity::Service,
        }
    }
}

/// What a 401/403 was about. A rejected secret is a validation problem; anything else is a
/// permission problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureEntity {
    Secret,
    Filesystem,
    Service,
}

#[derive(Debug, Clone)]
pub struct ClassifyContext {
    pub operation: Operation,
    pub entity: FailureEntity,
    pub affected_component: Option<String>,
    /// Zero-based attempt that produced the failure.
    pub attempt: u32,
    pub internal_retry_cap: u32,
    pub correlation_id: String,
    pub at: DateTime<Utc>,
}

impl ClassifyContext {
    pub fn new(operation: Operation, correlation_id: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            operation,
            entity: operation.default_entity(),
            affected_component: None,
            attempt: 0,
            internal_retry_cap: 2,
            correlation_id: correlation_id.into(),
            at,
        }
    }

    pub fn component(mut self, component: impl Into<String>) -> Self {
        self.affected_component = Some(component.into());
        self
    }

    pub fn entity(mut self, entity: FailureEntity) -> Self {
        self.entity = entity;
        self
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn internal_retry_cap(mut self, cap: u32) -> Self {
        self.internal_retry_cap = cap;
        self
    }
}

pub fn recovery_actions(category: ErrorCategory) -> Vec<String> {
    let actions: &[&str] = match category {
        ErrorCategory::Network => &["Retry", "Check connection"],
        ErrorCategory::Validation => &["Re-enter credentials", "Check provider account"],
        ErrorCategory::Permission => &["Run with elevated permissions", "Retry"],
        ErrorCategory::DiskSpace => &["Free disk space", "Choose alternate location"],
        ErrorCategory::Configuration => &["Review settings", "Contact support"],
        ErrorCategory::Internal => &["Retry", "Contact support"],
    };
    actions.iter().map(|a| a.to_string()).collect()
}

pub fn classify(failure: &ServiceError, ctx: &ClassifyContext) -> WizardError {
    let (category, can_retry, suffix) = categorize(failure, ctx);
    let code = format!("{}_{}", ctx.operation.code_prefix(), suffix);
    let message = format!(
        "{}: {}",
        ctx.operation.describe(ctx.affected_component.as_deref()),
        failure
    );

    WizardError {
        code,
        message,
        category,
        can_retry,
        recovery_actions: recovery_actions(category),
        correlation_id: ctx.correlation_id.clone(),
        timestamp: ctx.at,
        affected_component: ctx.affected_component.clone(),
    }
}

fn categorize(failure: &ServiceError, ctx: &ClassifyContext) -> (ErrorCategory, bool, String) {
    match failure {
        ServiceError::Timeout { .. } => (ErrorCategory::Network, true, "TIMEOUT".into()),
        ServiceError::ConnectionRefused(_)
        | ServiceError::Dns(_)
        | ServiceError::Transport(_) => (ErrorCategory::Network, true, "UNREACHABLE".into()),
        ServiceError::Http { status, .. } if matches!(status, 408 | 429 | 502 | 503 | 504) => {
            (ErrorCategory::Network, true, "UNAVAILABLE".into())
        }
        err if err.is_credential_rejection() => {
            if ctx.entity == FailureEntity::Secret {
                (
                    ErrorCategory::Validation,
                    false,
                    "INVALID_CREDENTIALS".into(),
                )
            } else {
                (ErrorCategory::Permission, false, "FORBIDDEN".into())
            }
        }
        ServiceError::PermissionDenied { transient, .. } => (
            ErrorCategory::Permission,
            *transient,
            "PERMISSION_DENIED".into(),
        ),
        ServiceError::DiskSpace(_) => (ErrorCategory::DiskSpace, false, "DISK_SPACE".into()),
        ServiceError::MalformedResponse(_) => (
            ErrorCategory::Internal,
            ctx.attempt < ctx.internal_retry_cap,
            "MALFORMED_RESPONSE".into(),
        ),
        ServiceError::Http { status, .. } if *status >= 500 => (
            ErrorCategory::Internal,
            ctx.attempt < ctx.internal_retry_cap,
            "INTERNAL".into(),
        ),
        ServiceError::Rejected {
            code: Some(code), ..
        } => (
            ErrorCategory::Configuration,
            false,
            code.trim().to_ascii_uppercase(),
        ),
        _ => (ErrorCategory::Configuration, false, "FAILED".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ctx(operation: Operation) -> ClassifyContext {
        let at = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        ClassifyContext::new(operation, "corr-1", at)
    }

    #[test]
    fn install_timeout_is_retryable_network_error() {
        let err = classify(
            &ServiceError::Timeout { after_ms: 120_000 },
            &ctx(Operation::Install).component("ffmpeg"),
        );
        assert_eq!(err.category, ErrorCategory::Network);
        assert!(err.can_retry);
        assert_eq!(err.code, "INSTALL_TIMEOUT");
        assert_eq!(err.affected_component.as_deref(), Some("ffmpeg"));
        assert_eq!(err.recovery_actions, vec!["Retry", "Check connection"]);
        assert!(err.message.starts_with("Installing ffmpeg"));
    }

    #[test]
    fn unauthorized_secret_is_validation_error() {
        let err = classify(
            &ServiceError::Http {
                status: 401,
                message: "bad key".into(),
            },
            &ctx(Operation::Validation).component("openai"),
        );
        assert_eq!(err.category, ErrorCategory::Validation);
        assert!(!err.can_retry);
    }

    #[test]
    fn forbidden_outside_secrets_is_permission_error() {
        let err = classify(
            &ServiceError::Http {
                status: 403,
                message: "forbidden".into(),
            },
            &ctx(Operation::Install).component("cuda"),
        );
        assert_eq!(err.category, ErrorCategory::Permission);
        assert!(!err.can_retry);
    }

    #[test]
    fn transient_permission_denial_is_retryable() {
        let failure = ServiceError::PermissionDenied {
            message: "file locked".into(),
            transient: true,
        };
        let err = classify(&failure, &ctx(Operation::Install));
        assert_eq!(err.category, ErrorCategory::Permission);
        assert!(err.can_retry);
    }

    #[test]
    fn disk_space_is_never_retried() {
        let err = classify(
            &ServiceError::DiskSpace("2 MB free".into()),
            &ctx(Operation::Install),
        );
        assert_eq!(err.category, ErrorCategory::DiskSpace);
        assert!(!err.can_retry);
        assert_eq!(
            err.recovery_actions,
            vec!["Free disk space", "Choose alternate location"]
        );
    }

    #[test]
    fn internal_errors_retry_until_cap() {
        let failure = ServiceError::Http {
            status: 500,
            message: "oops".into(),
        };
        let first = classify(&failure, &ctx(Operation::Rescan).attempt(0));
        let capped = classify(
            &failure,
            &ctx(Operation::Rescan).attempt(2).internal_retry_cap(2),
        );
        assert_eq!(first.category, ErrorCategory::Internal);
        assert!(first.can_retry);
        assert!(!capped.can_retry);
    }

    #[test]
    fn gateway_errors_are_network() {
        let err = classify(
            &ServiceError::Http {
                status: 503,
                message: "maintenance".into(),
            },
            &ctx(Operation::Validation),
        );
        assert_eq!(err.category, ErrorCategory::Network);
        assert!(err.can_retry);
    }

    #[test]
    fn unknown_failures_fall_back_to_configuration() {
        let err = classify(
            &ServiceError::Rejected {
                code: Some("unsupported_version".into()),
                message: "version 9 not available".into(),
            },
            &ctx(Operation::Install),
        );
        assert_eq!(err.category, ErrorCategory::Configuration);
        assert!(!err.can_retry);
        assert_eq!(err.code, "INSTALL_UNSUPPORTED_VERSION");
    }

    #[test]
    fn classification_is_pure() {
        let failure = ServiceError::Transport("reset by peer".into());
        let c = ctx(Operation::HardwareProbe);
        assert_eq!(classify(&failure, &c), classify(&failure, &c));
    }
}
