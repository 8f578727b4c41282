// Setup wizard orchestrator
// Library entry point: logging and the binary's run modes

pub mod config;
pub mod engine;
pub mod errors;
pub mod models;
pub mod orchestrators;
pub mod persistence;
pub mod security;
pub mod services;
pub mod session;
mod smoke;
pub mod utils;

use anyhow::Result;
use log::{error, info};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::WizardConfig;
use crate::models::state::WizardState;
use crate::persistence::{LoadSource, PersistenceManager};
use crate::session::{http_backend, persistence_for};

/// Initialize logging system with dual format (JSON + human-readable)
fn init_logging(with_stdout: bool) -> Result<(), Box<dyn std::error::Error>> {
    let log_dir = utils::path_resolver::resolve_log_folder()?;

    let timestamp = chrono::Utc::now().format("%Y-%m-%d-%H%M%S");
    let json_log_file = log_dir.join(format!("setup-{}.log", timestamp));
    let txt_log_file = log_dir.join(format!("setup-{}.txt", timestamp));

    let mut dispatch = fern::Dispatch::new().level(log::LevelFilter::Debug);

    if with_stdout {
        dispatch = dispatch.chain(
            fern::Dispatch::new()
                .level(log::LevelFilter::Info)
                .format(move |out, message, record| {
                    let timestamp_local = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
                    let message_str = format!("{}", message);
                    let (phase, step, cleaned_message) =
                        utils::logging::parse_log_metadata(&message_str);
                    let txt_line = utils::logging::format_human_readable_log(
                        &timestamp_local.to_string(),
                        record.level(),
                        record.target(),
                        &cleaned_message,
                        phase.as_deref(),
                        step.as_deref(),
                    );
                    out.finish(format_args!("{}", txt_line));
                })
                .chain(std::io::stdout()),
        );
    }

    dispatch = dispatch
        .chain(
            fern::Dispatch::new()
                .format(move |out, message, record| {
                    let timestamp_utc = chrono::Utc::now().to_rfc3339();
                    let message_str = format!("{}", message);
                    let (phase, step, cleaned_message) =
                        utils::logging::parse_log_metadata(&message_str);
                    let json_line = utils::logging::format_json_log(
                        &timestamp_utc,
                        record.level(),
                        record.target(),
                        &cleaned_message,
                        phase.as_deref(),
                        step.as_deref(),
                    );
                    out.finish(format_args!("{}\n", json_line));
                })
                .chain(fern::log_file(json_log_file)?),
        )
        .chain(
            fern::Dispatch::new()
                .format(move |out, message, record| {
                    let timestamp_local = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
                    let message_str = format!("{}", message);
                    let (phase, step, cleaned_message) =
                        utils::logging::parse_log_metadata(&message_str);
                    let txt_line = utils::logging::format_human_readable_log(
                        &timestamp_local.to_string(),
                        record.level(),
                        record.target(),
                        &cleaned_message,
                        phase.as_deref(),
                        step.as_deref(),
                    );
                    out.finish(format_args!("{}\n", txt_line));
                })
                .chain(fern::log_file(txt_log_file)?),
        );

    dispatch.apply()?;

    log::info!(
        "[PHASE: initialization] Logging initialized, log directory: {:?}",
        log_dir
    );
    Ok(())
}

/// Runs `fut` on a current-thread runtime; logs and exits 1 on error.
fn run_blocking<F>(phase: &str, step: &str, fut: F)
where
    F: Future<Output = Result<()>>,
{
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build();
    let result = match rt {
        Ok(rt) => rt.block_on(fut),
        Err(e) => Err(anyhow::anyhow!(
            "Failed to create async runtime for {}: {}",
            step,
            e
        )),
    };

    if let Err(e) = result {
        error!(
            "[PHASE: {}] [STEP: {}] exited with error: {:?}",
            phase, step, e
        );
        eprintln!("Setup wizard error: {:#}", e);
        std::process::exit(1);
    }
}

fn load_config(config_path: Option<PathBuf>) -> Result<WizardConfig> {
    let cfg = WizardConfig::load(config_path.as_deref())?;
    info!(
        "[PHASE: initialization] [STEP: config] setup api {}, progress api {}",
        utils::logging::mask_url_credentials(&cfg.services.setup_api_url),
        utils::logging::mask_url_credentials(&cfg.services.progress_api_url)
    );
    Ok(cfg)
}

fn remote_persistence(cfg: &WizardConfig) -> Result<Arc<PersistenceManager>> {
    let backend = Arc::new(http_backend(cfg)?);
    Ok(persistence_for(cfg, backend))
}

/// Deterministic end-to-end flow against scripted services (for automated checks / log capture).
/// Writes `setup_smoke_transcript.log` under the log folder and exits 0/1.
pub fn run_setup_smoke() {
    if let Err(e) = init_logging(false) {
        eprintln!("Failed to initialize logging: {}", e);
    }
    info!(
        "[PHASE: initialization] Setup smoke starting at {}",
        chrono::Utc::now()
    );
    info!(
        "[PHASE: initialization] [STEP: deployment_folder] Deployment folder: {:?}",
        utils::path_resolver::resolve_deployment_folder()
    );
    run_blocking("smoke", "setup_smoke", smoke::setup_smoke());
}

/// Prints where a resumed wizard would continue.
pub fn run_status(config_path: Option<PathBuf>) {
    if let Err(e) = init_logging(false) {
        eprintln!("Failed to initialize logging: {}", e);
    }
    run_blocking("status", "load", async move {
        let cfg = load_config(config_path)?;
        let loaded = remote_persistence(&cfg)?.load().await;
        print!("{}", describe_progress(&loaded.state, loaded.source));
        Ok(())
    });
}

/// Resets local and remote progress. `preserve_data` keeps installed items, credentials and
/// preferences.
pub fn run_reset(config_path: Option<PathBuf>, preserve_data: bool) {
    if let Err(e) = init_logging(false) {
        eprintln!("Failed to initialize logging: {}", e);
    }
    run_blocking("reset", "reset", async move {
        let cfg = load_config(config_path)?;
        let persistence = remote_persistence(&cfg)?;
        let store = engine::WizardStore::create(WizardState::default());
        persistence.hydrate(&store).await;
        persistence.reset(&store, preserve_data).await?;
        store.dispose();
        println!(
            "Setup progress reset{}.",
            if preserve_data { " (data kept)" } else { "" }
        );
        Ok(())
    });
}

/// Prints the effective configuration as TOML.
pub fn run_print_config(config_path: Option<PathBuf>) {
    match WizardConfig::load(config_path.as_deref()) {
        Ok(cfg) => match cfg.to_toml() {
            Ok(rendered) => print!("{}", rendered),
            Err(e) => {
                eprintln!("Failed to render configuration: {}", e);
                std::process::exit(1);
            }
        },
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    }
}

fn describe_progress(state: &WizardState, source: LoadSource) -> String {
    let installed = state.install_items.iter().filter(|i| i.installed).count();
    let skipped = state.install_items.iter().filter(|i| i.skipped).count();
    let valid: Vec<&str> = state
        .credential_status
        .iter()
        .filter(|(_, status)| **status == models::state::CredentialStatus::Valid)
        .map(|(provider, _)| provider.as_str())
        .collect();
    format!(
        "source: {:?}\nstep: {}\nphase: {}\nstatus: {}\ntier: {:?}{}\ninstalled: {}/{} (skipped {})\nvalidated providers: {}\n",
        source,
        state.step,
        state.phase,
        state.status.as_str(),
        state.tier_selection,
        if state.tier_locked { " (locked)" } else { "" },
        installed,
        state.install_items.len(),
        skipped,
        if valid.is_empty() {
            "none".to_string()
        } else {
            valid.join(", ")
        }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::state::{CredentialStatus, InstallItem, InstallItemSpec, TierSelection};

    #[test]
    fn progress_summary_lists_key_fields() {
        let mut state = WizardState {
            step: 3,
            tier_selection: TierSelection::TierB,
            tier_locked: true,
            ..WizardState::default()
        };
        let mut item = InstallItem::from_spec(&InstallItemSpec::new("ffmpeg", "FFmpeg", true));
        item.installed = true;
        state.install_items.push(item);
        state
            .credential_status
            .insert("openai".to_string(), CredentialStatus::Valid);

        let summary = describe_progress(&state, LoadSource::Local);
        assert!(summary.contains("source: Local"));
        assert!(summary.contains("tier: TierB (locked)"));
        assert!(summary.contains("installed: 1/1"));
        assert!(summary.contains("validated providers: openai"));
    }
}
