// Deterministic end-to-end smoke flow against scripted services.
// Writes `setup_smoke_transcript.log` under the log folder.

use anyhow::{bail, Context, Result};
use log::info;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use crate::engine::ui::get_button_label;
use crate::errors::ServiceError;
use crate::models::actions::WizardAction;
use crate::models::requests::InstallOptions;
use crate::models::responses::ProbeResult;
use crate::models::state::{steps, CredentialStatus, InstallItemSpec, Phase, SecretValue, WizardState};
use crate::orchestrators::{OperationPolicy, RetryPolicy};
use crate::persistence::{MemoryCache, PersistenceManager, ReplicationPolicy};
use crate::services::scripted::{Scripted, ScriptedBackend};
use crate::session::SetupSession;
use crate::utils::path_resolver;

const TRANSCRIPT_FILE: &str = "setup_smoke_transcript.log";
const PROVIDER: &str = "openai";

fn smoke_policy() -> OperationPolicy {
    OperationPolicy {
        install_timeout: Duration::from_millis(300),
        status_timeout: Duration::from_millis(200),
        validation_timeout: Duration::from_millis(300),
        probe_timeout: Duration::from_millis(300),
        rescan_timeout: Duration::from_millis(300),
        retry: RetryPolicy {
            base: Duration::from_millis(20),
            cap: Duration::from_millis(100),
            max_attempts: 3,
            internal_retry_cap: 2,
        },
    }
}

pub async fn setup_smoke() -> Result<()> {
    let log_dir = path_resolver::resolve_log_folder()?;
    let transcript_path = log_dir.join(TRANSCRIPT_FILE);

    let backend = ScriptedBackend::new(["ffmpeg", "git"]);
    backend.probe.script(Scripted::ok(ProbeResult {
        gpu: Some("Smoke GPU".to_string()),
        vram_gb: Some(8.0),
        supports_accelerated_workload: true,
    }));
    backend.install.script_install("ffmpeg", Scripted::Hang);
    backend.validation.script_enhanced(
        PROVIDER,
        Scripted::err(ServiceError::ConnectionRefused("smoke: enhanced offline".into())),
    );

    let persistence = PersistenceManager::new(
        Arc::new(MemoryCache::default()),
        backend.progress.clone(),
        None,
        ReplicationPolicy {
            base: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            retries: 1,
            timeout: Duration::from_secs(2),
        },
        Some("smoke-user".to_string()),
    );
    let session = SetupSession::start(backend.services(), persistence, smoke_policy()).await;
    let store = Arc::clone(&session.store);
    let orchestrator = Arc::clone(&session.orchestrator);

    info!("[PHASE: smoke] [STEP: detection] probing hardware");
    orchestrator.start_detection().await.context("detection task")?;
    let tier = store
        .snapshot()
        .hardware
        .map(|h| h.recommended_tier())
        .context("detection produced no hardware profile")?;
    store.dispatch(WizardAction::SetTier(tier));
    store.dispatch(WizardAction::SetStep(steps::HARDWARE));
    store.dispatch(WizardAction::SetStep(steps::DEPENDENCIES));

    info!("[PHASE: smoke] [STEP: install] installing dependencies");
    store.dispatch(WizardAction::RegisterInstallItems(vec![
        InstallItemSpec::new("ffmpeg", "FFmpeg", true),
        InstallItemSpec::new("git", "Git", false),
    ]));
    orchestrator.install_all(&InstallOptions::default()).await;
    let state = store.snapshot();
    let Some(ffmpeg) = state.item("ffmpeg") else {
        bail!("ffmpeg missing from install items");
    };
    if !ffmpeg.installed || ffmpeg.installing || ffmpeg.retry_count != 1 {
        bail!(
            "ffmpeg expected installed after one retry, got installed={} installing={} retry_count={}",
            ffmpeg.installed,
            ffmpeg.installing,
            ffmpeg.retry_count
        );
    }

    info!("[PHASE: smoke] [STEP: validation] validating provider credentials");
    store.dispatch(WizardAction::SetStep(steps::PROVIDERS));
    store.dispatch(WizardAction::SetCredential {
        provider: PROVIDER.to_string(),
        secret: SecretValue::new("sk-smoke-0000000000000000"),
    });
    orchestrator
        .start_validation(PROVIDER, BTreeMap::new())
        .await
        .context("validation task")?;
    if store.snapshot().credential_status.get(PROVIDER) != Some(&CredentialStatus::Valid) {
        bail!("provider {} was not validated through the basic fallback", PROVIDER);
    }

    store.dispatch(WizardAction::SetStep(steps::REVIEW));
    store.dispatch(WizardAction::CompleteSetup);
    let final_state = store.snapshot();
    if final_state.phase != Phase::Completed {
        bail!("setup did not complete (phase={})", final_state.phase);
    }
    session.shutdown().await;

    let transcript = render_transcript(&final_state, &backend);
    std::fs::write(&transcript_path, &transcript)
        .with_context(|| format!("Failed to write transcript {:?}", transcript_path))?;
    info!(
        "[PHASE: smoke] [STEP: complete] transcript written to {:?}",
        transcript_path
    );
    print!("{}", transcript);

    if backend.progress.completions().len() != 1 {
        bail!("completion was not replicated");
    }
    Ok(())
}

fn render_transcript(state: &WizardState, backend: &ScriptedBackend) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "setup smoke transcript ({})", chrono::Utc::now().to_rfc3339());
    for entry in &state.transition_log {
        let _ = writeln!(
            out,
            "{} {} -> {} via {} step={} status={} correlation_id={}",
            entry.timestamp.to_rfc3339(),
            entry.from,
            entry.to,
            entry.action,
            entry.step,
            entry.status.as_str(),
            entry.correlation_id
        );
    }
    let _ = writeln!(out, "install calls: {}", backend.install.calls().join(", "));
    let _ = writeln!(out, "validation calls: {}", backend.validation.calls().join(", "));
    let _ = writeln!(
        out,
        "replicated saves: {}, completions: {}",
        backend.progress.saves().len(),
        backend.progress.completions().len()
    );
    let _ = writeln!(
        out,
        "button: {}",
        get_button_label(state.status, state.is_last_step())
    );
    out
}
