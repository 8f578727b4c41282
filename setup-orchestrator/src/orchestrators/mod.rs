// Operation orchestrators
//
// Each public entry point spawns one tokio task that wraps a single external call with a
// timeout, bounded retries and cancellation. Tasks never return results to the caller: every
// outcome ends as an action dispatched into the store.
//
// At most one task runs per logical operation. Starting a new one cancels the previous task and
// waits for it to finish before the new call begins.

mod detection;
mod install;
mod rescan;
mod validation;

use chrono::Utc;
use log::{info, warn};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::WizardConfig;
use crate::engine::{Disposition, WizardStore};
use crate::errors::classifier::{classify, ClassifyContext, Operation};
use crate::errors::ServiceError;
use crate::models::actions::{Action, WizardAction};
use crate::models::state::WizardError;
use crate::services::SetupServices;

pub use validation::is_valid_provider_key;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
    pub internal_retry_cap: u32,
}

impl RetryPolicy {
    /// `min(base * 2^attempt, cap)` for the zero-based `attempt` that just failed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_millis(8_000),
            max_attempts: 3,
            internal_retry_cap: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationPolicy {
    pub install_timeout: Duration,
    pub status_timeout: Duration,
    pub validation_timeout: Duration,
    pub probe_timeout: Duration,
    pub rescan_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for OperationPolicy {
    fn default() -> Self {
        Self::from(&WizardConfig::default())
    }
}

impl From<&WizardConfig> for OperationPolicy {
    fn from(cfg: &WizardConfig) -> Self {
        Self {
            install_timeout: Duration::from_secs(cfg.timeouts.install_secs),
            status_timeout: Duration::from_secs(cfg.timeouts.status_secs),
            validation_timeout: Duration::from_secs(cfg.timeouts.validation_secs),
            probe_timeout: Duration::from_secs(cfg.timeouts.probe_secs),
            rescan_timeout: Duration::from_secs(cfg.timeouts.rescan_secs),
            retry: RetryPolicy {
                base: Duration::from_millis(cfg.retry.base_ms),
                cap: Duration::from_millis(cfg.retry.cap_ms),
                max_attempts: cfg.retry.max_attempts.max(1),
                internal_retry_cap: cfg.retry.internal_retry_cap,
            },
        }
    }
}

/// A logical operation; at most one task runs per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OperationKey {
    Detect,
    Rescan,
    Install(String),
    Validate(String),
}

struct InFlight {
    task_id: u64,
    token: CancellationToken,
    /// Cancelled when the task has fully finished.
    done: CancellationToken,
}

pub(crate) enum CallOutcome<T> {
    Completed(T),
    Failed(ServiceError),
    Cancelled,
}

pub(crate) enum Attempted<T> {
    Done(T),
    Failed(WizardError),
    Cancelled,
}

pub struct Orchestrator {
    store: Arc<WizardStore>,
    services: SetupServices,
    policy: OperationPolicy,
    inflight: Mutex<HashMap<OperationKey, InFlight>>,
    generation: AtomicU64,
    task_ids: AtomicU64,
}

impl Orchestrator {
    pub fn new(
        store: Arc<WizardStore>,
        services: SetupServices,
        policy: OperationPolicy,
    ) -> Arc<Self> {
        // Generations restored from a snapshot must never be reused.
        let first_generation = store.snapshot().max_generation() + 1;
        Arc::new(Self {
            store,
            services,
            policy,
            inflight: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(first_generation),
            task_ids: AtomicU64::new(1),
        })
    }

    pub fn store(&self) -> &Arc<WizardStore> {
        &self.store
    }

    pub fn policy(&self) -> &OperationPolicy {
        &self.policy
    }

    pub fn is_running(&self, key: &OperationKey) -> bool {
        self.lock_inflight().contains_key(key)
    }

    /// Requests cancellation; the task reports it through the store.
    pub fn cancel(&self, key: &OperationKey) {
        if let Some(entry) = self.lock_inflight().get(key) {
            info!("[PHASE: orchestrator] [STEP: cancel] Cancelling {:?}", key);
            entry.token.cancel();
        }
    }

    pub fn cancel_install(&self, item_id: &str) {
        self.cancel(&OperationKey::Install(item_id.to_string()));
    }

    pub fn cancel_validation(&self, provider: &str) {
        self.cancel(&OperationKey::Validate(provider.to_string()));
    }

    pub fn cancel_detection(&self) {
        self.cancel(&OperationKey::Detect);
    }

    pub fn cancel_all(&self) {
        for entry in self.lock_inflight().values() {
            entry.token.cancel();
        }
    }

    /// Cancels everything and waits for all tasks to finish.
    pub async fn shutdown(&self) {
        let pending: Vec<CancellationToken> = {
            let inflight = self.lock_inflight();
            inflight
                .values()
                .map(|entry| {
                    entry.token.cancel();
                    entry.done.clone()
                })
                .collect()
        };
        for done in pending {
            done.cancelled().await;
        }
    }

    fn lock_inflight(&self) -> MutexGuard<'_, HashMap<OperationKey, InFlight>> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst)
    }

    fn spawn_operation<F, Fut>(self: &Arc<Self>, key: OperationKey, run: F) -> JoinHandle<()>
    where
        F: FnOnce(Arc<Self>, CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task_id = self.task_ids.fetch_add(1, Ordering::SeqCst);
        let token = self.store.shutdown_token().child_token();
        let done = CancellationToken::new();

        let prior = {
            let mut inflight = self.lock_inflight();
            let previous = inflight.insert(
                key.clone(),
                InFlight {
                    task_id,
                    token: token.clone(),
                    done: done.clone(),
                },
            );
            previous.map(|p| {
                p.token.cancel();
                p.done
            })
        };
        if prior.is_some() {
            info!(
                "[PHASE: orchestrator] [STEP: supersede] {:?} restarted; cancelling previous task",
                key
            );
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _finished = done.drop_guard();
            if let Some(prior) = prior {
                prior.cancelled().await;
            }
            run(Arc::clone(&this), token).await;

            let mut inflight = this.lock_inflight();
            if inflight.get(&key).map(|e| e.task_id) == Some(task_id) {
                inflight.remove(&key);
            }
        })
    }

    fn dispatch(&self, correlation_id: &str, action: WizardAction) -> Disposition {
        self.store
            .dispatch(Action::new(action).with_correlation(correlation_id))
    }

    fn context(&self, operation: Operation, correlation_id: &str, attempt: u32) -> ClassifyContext {
        ClassifyContext::new(operation, correlation_id, Utc::now())
            .attempt(attempt)
            .internal_retry_cap(self.policy.retry.internal_retry_cap)
    }

    /// Runs `call` with timeout and retries until it succeeds, fails for good or is cancelled.
    async fn with_retries<T, F, Fut>(
        &self,
        token: &CancellationToken,
        limit: Duration,
        operation: Operation,
        component: Option<&str>,
        correlation_id: &str,
        mut call: F,
    ) -> Attempted<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let retry = self.policy.retry;
        let mut attempt = 0;
        loop {
            let failure = match call_with_timeout(token, limit, call()).await {
                CallOutcome::Completed(value) => return Attempted::Done(value),
                CallOutcome::Cancelled => return Attempted::Cancelled,
                CallOutcome::Failed(failure) => failure,
            };
            let mut ctx = self.context(operation, correlation_id, attempt);
            if let Some(component) = component {
                ctx = ctx.component(component);
            }
            let error = classify(&failure, &ctx);
            if !(error.can_retry && attempt + 1 < retry.max_attempts) {
                return Attempted::Failed(error);
            }
            let delay = retry.delay_for(attempt);
            warn!(
                "[PHASE: orchestrator] [STEP: retry] {:?} attempt {} failed ({}); retrying in {}ms correlation_id={}",
                operation,
                attempt + 1,
                error.code,
                delay.as_millis(),
                correlation_id
            );
            if !sleep_or_cancel(token, delay).await {
                return Attempted::Cancelled;
            }
            attempt += 1;
        }
    }
}

pub(crate) fn new_correlation_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Races `fut` against cancellation and `limit`.
pub(crate) async fn call_with_timeout<T, F>(
    token: &CancellationToken,
    limit: Duration,
    fut: F,
) -> CallOutcome<T>
where
    F: Future<Output = Result<T, ServiceError>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => CallOutcome::Cancelled,
        result = tokio::time::timeout(limit, fut) => match result {
            Ok(Ok(value)) => CallOutcome::Completed(value),
            Ok(Err(failure)) => CallOutcome::Failed(failure),
            Err(_) => CallOutcome::Failed(ServiceError::Timeout {
                after_ms: limit.as_millis() as u64,
            }),
        },
    }
}

/// Sleeps for `delay`; false if cancelled first.
pub(crate) async fn sleep_or_cancel(token: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        biased;
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap() {
        let retry = RetryPolicy {
            base: Duration::from_millis(500),
            cap: Duration::from_millis(3_000),
            max_attempts: 5,
            internal_retry_cap: 2,
        };
        assert_eq!(retry.delay_for(0), Duration::from_millis(500));
        assert_eq!(retry.delay_for(1), Duration::from_millis(1_000));
        assert_eq!(retry.delay_for(2), Duration::from_millis(2_000));
        assert_eq!(retry.delay_for(3), Duration::from_millis(3_000));
        assert_eq!(retry.delay_for(40), Duration::from_millis(3_000));
    }

    #[test]
    fn policy_follows_config() {
        let mut cfg = WizardConfig::default();
        cfg.timeouts.install_secs = 90;
        cfg.retry.max_attempts = 0;
        let policy = OperationPolicy::from(&cfg);
        assert_eq!(policy.install_timeout, Duration::from_secs(90));
        assert_eq!(policy.retry.max_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn call_with_timeout_reports_timeout() {
        let token = CancellationToken::new();
        let outcome = call_with_timeout(
            &token,
            Duration::from_secs(2),
            std::future::pending::<Result<(), ServiceError>>(),
        )
        .await;
        assert!(matches!(
            outcome,
            CallOutcome::Failed(ServiceError::Timeout { after_ms: 2_000 })
        ));
    }

    #[tokio::test]
    async fn cancellation_wins_over_pending_call() {
        let token = CancellationToken::new();
        token.cancel();
        let outcome = call_with_timeout(
            &token,
            Duration::from_secs(60),
            std::future::pending::<Result<(), ServiceError>>(),
        )
        .await;
        assert!(matches!(outcome, CallOutcome::Cancelled));
        assert!(!sleep_or_cancel(&token, Duration::from_secs(1)).await);
    }
}
