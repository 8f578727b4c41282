use anyhow::{Context, Result};
use std::path::PathBuf;

const APP_DIR: &str = "setup-wizard";
const LOG_DIR_ENV: &str = "SETUP_WIZARD_LOG_DIR";

/// Folder the binary runs from, falling back to the current directory.
pub fn resolve_deployment_folder() -> PathBuf {
    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(dir) = exe_path.parent() {
            return dir.to_path_buf();
        }
    }
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

/// Per-user data folder (`~/.local/share/setup-wizard` on Linux).
pub fn resolve_data_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join(APP_DIR))
        .unwrap_or_else(|| resolve_deployment_folder().join(APP_DIR))
}

/// Resolve log folder (absolute path), creating it if needed.
pub fn resolve_log_folder() -> Result<PathBuf> {
    let log_dir = match std::env::var_os(LOG_DIR_ENV) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => resolve_data_folder().join("logs"),
    };
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log folder {}", log_dir.display()))?;
    Ok(log_dir)
}

pub fn default_cache_path() -> PathBuf {
    resolve_data_folder().join("wizard-state.json")
}

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join(APP_DIR).join("setup-wizard.toml"))
        .unwrap_or_else(|| resolve_deployment_folder().join("setup-wizard.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_paths_live_under_app_dir() {
        assert!(default_cache_path().ends_with("setup-wizard/wizard-state.json"));
        assert!(default_config_path().ends_with("setup-wizard.toml"));
    }

    #[test]
    fn deployment_folder_is_absolute_or_dot() {
        let dir = resolve_deployment_folder();
        assert!(dir.is_absolute() || dir == PathBuf::from("."));
    }
}
