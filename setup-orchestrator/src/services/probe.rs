// Local hardware probe
//
// Looks for an NVIDIA GPU through `nvidia-smi`. A machine without the tool is a valid CPU-only
// result, not a failure.

use async_trait::async_trait;
use log::{info, warn};
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use super::HardwareProbe;
use crate::errors::ServiceError;
use crate::models::responses::ProbeResult;
use crate::utils::command::{run_cmd_with_timeout, CommandError};

/// Minimum VRAM for the accelerated tier.
pub const MIN_ACCELERATED_VRAM_GB: f64 = 4.0;

const NVIDIA_SMI: &str = "nvidia-smi";

pub struct LocalHardwareProbe {
    timeout: Duration,
    tool: Option<PathBuf>,
}

impl LocalHardwareProbe {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            tool: which::which(NVIDIA_SMI).ok(),
        }
    }

    /// Uses an explicit tool path instead of searching `PATH`.
    pub fn with_tool(timeout: Duration, tool: Option<PathBuf>) -> Self {
        Self { timeout, tool }
    }
}

#[async_trait]
impl HardwareProbe for LocalHardwareProbe {
    async fn run_probe(&self) -> Result<ProbeResult, ServiceError> {
        let Some(tool) = &self.tool else {
            info!("[PHASE: probe] [STEP: locate] {} not found; assuming CPU only", NVIDIA_SMI);
            return Ok(ProbeResult::cpu_only());
        };

        let args = vec![
            "--query-gpu=name,memory.total".to_string(),
            "--format=csv,noheader,nounits".to_string(),
        ];
        let program = tool.to_string_lossy();
        let output = run_cmd_with_timeout(&program, &args, self.timeout, "hardware_probe")
            .await
            .map_err(command_failure)?;

        if !output.success() {
            warn!(
                "[PHASE: probe] [STEP: run] {} exited with {:?}",
                NVIDIA_SMI, output.exit_code
            );
            return Err(ServiceError::Rejected {
                code: Some("PROBE_TOOL_FAILED".to_string()),
                message: format!(
                    "{} exited with {:?}: {}",
                    NVIDIA_SMI,
                    output.exit_code,
                    output.stderr.trim()
                ),
            });
        }
        parse_nvidia_smi_csv(&output.stdout)
    }
}

fn command_failure(err: CommandError) -> ServiceError {
    match err {
        CommandError::Timeout { after_ms, .. } => ServiceError::Timeout { after_ms },
        CommandError::Spawn { source, .. } | CommandError::Io { source, .. }
            if source.kind() == io::ErrorKind::PermissionDenied =>
        {
            ServiceError::PermissionDenied {
                message: source.to_string(),
                transient: false,
            }
        }
        other => ServiceError::Rejected {
            code: Some("PROBE_TOOL_FAILED".to_string()),
            message: other.to_string(),
        },
    }
}

/// Parses `name, memory.total` rows (MiB). The largest GPU wins.
pub fn parse_nvidia_smi_csv(stdout: &str) -> Result<ProbeResult, ServiceError> {
    let mut best: Option<(String, f64)> = None;
    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let mut cols = line.rsplitn(2, ',');
        let (Some(mem), Some(name)) = (cols.next(), cols.next()) else {
            return Err(ServiceError::MalformedResponse(format!(
                "unexpected {} row: {}",
                NVIDIA_SMI, line
            )));
        };
        let mib: f64 = mem.trim().parse().map_err(|_| {
            ServiceError::MalformedResponse(format!("unparseable memory value: {}", mem.trim()))
        })?;
        let gb = mib / 1024.0;
        if best.as_ref().map_or(true, |(_, current)| gb > *current) {
            best = Some((name.trim().to_string(), gb));
        }
    }

    Ok(match best {
        Some((name, gb)) => ProbeResult {
            gpu: Some(name),
            vram_gb: Some((gb * 10.0).round() / 10.0),
            supports_accelerated_workload: gb >= MIN_ACCELERATED_VRAM_GB,
        },
        None => ProbeResult::cpu_only(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_gpu() {
        let result = parse_nvidia_smi_csv("NVIDIA GeForce RTX 3080, 10240\n").unwrap();
        assert_eq!(result.gpu.as_deref(), Some("NVIDIA GeForce RTX 3080"));
        assert_eq!(result.vram_gb, Some(10.0));
        assert!(result.supports_accelerated_workload);
    }

    #[test]
    fn picks_largest_gpu_and_handles_commas_in_names() {
        let out = "Tesla T4, 15360\nQuadro P400, Rev A, 2048\n";
        let result = parse_nvidia_smi_csv(out).unwrap();
        assert_eq!(result.gpu.as_deref(), Some("Tesla T4"));
    }

    #[test]
    fn small_gpu_does_not_support_acceleration() {
        let result = parse_nvidia_smi_csv("Quadro P400, 2048").unwrap();
        assert!(!result.supports_accelerated_workload);
        assert_eq!(result.vram_gb, Some(2.0));
    }

    #[test]
    fn empty_output_is_cpu_only() {
        assert_eq!(parse_nvidia_smi_csv("\n").unwrap(), ProbeResult::cpu_only());
    }

    #[test]
    fn garbage_output_is_malformed() {
        let err = parse_nvidia_smi_csv("no gpu here").unwrap_err();
        assert!(matches!(err, ServiceError::MalformedResponse(_)));
        let err = parse_nvidia_smi_csv("Tesla, lots").unwrap_err();
        assert!(matches!(err, ServiceError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn missing_tool_reports_cpu_only() {
        let probe = LocalHardwareProbe::with_tool(Duration::from_secs(1), None);
        assert_eq!(probe.run_probe().await.unwrap(), ProbeResult::cpu_only());
    }

    #[test]
    fn command_timeout_maps_to_timeout() {
        let err = command_failure(CommandError::Timeout {
            program: NVIDIA_SMI.to_string(),
            after_ms: 20_000,
        });
        assert_eq!(err, ServiceError::Timeout { after_ms: 20_000 });
    }
}
