// External command runner
//
// Runs a local tool with captured output and a hard timeout. A timed-out child is killed and
// reaped. Retrying is the caller's business.

use log::{debug, warn};
use std::io;
use std::process::Stdio;
use std::time::Instant;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::{timeout, Duration};

use super::logging::mask_sensitive;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u128,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("'{program}' timed out after {after_ms}ms")]
    Timeout { program: String, after_ms: u64 },
    #[error("i/o error while running '{program}': {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },
}

fn mask_arg_for_log(arg: &str) -> String {
    let lower = arg.to_ascii_lowercase();
    if lower.contains("secret")
        || lower.contains("token")
        || lower.contains("apikey")
        || lower.contains("api_key")
        || lower.contains("password")
    {
        return "***".to_string();
    }
    if arg.len() > 32 {
        return mask_sensitive(arg);
    }
    arg.to_string()
}

pub async fn run_cmd_with_timeout(
    program: &str,
    args: &[String],
    timeout_dur: Duration,
    operation: &str,
) -> Result<CommandOutput, CommandError> {
    let started = Instant::now();
    debug!(
        "[PHASE: command] [STEP: spawn] operation={} program={} args=[{}] timeout_ms={}",
        operation,
        program,
        args.iter()
            .map(|a| mask_arg_for_log(a))
            .collect::<Vec<_>>()
            .join(", "),
        timeout_dur.as_millis()
    );

    let io_err = |source: io::Error| CommandError::Io {
        program: program.to_string(),
        source,
    };

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| CommandError::Spawn {
            program: program.to_string(),
            source,
        })?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| io_err(io::Error::new(io::ErrorKind::Other, "stdout not captured")))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| io_err(io::Error::new(io::ErrorKind::Other, "stderr not captured")))?;

    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stdout.read_to_end(&mut buf).await?;
        Ok::<String, io::Error>(String::from_utf8_lossy(&buf).to_string())
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stderr.read_to_end(&mut buf).await?;
        Ok::<String, io::Error>(String::from_utf8_lossy(&buf).to_string())
    });

    let status = match timeout(timeout_dur, child.wait()).await {
        Ok(Ok(status)) => status,
        Ok(Err(e)) => return Err(io_err(e)),
        Err(_) => {
            warn!(
                "[PHASE: command] [STEP: timeout] operation={} program={} timeout_ms={}; killing process",
                operation,
                program,
                timeout_dur.as_millis()
            );
            if let Err(e) = child.kill().await {
                warn!(
                    "[PHASE: command] [STEP: timeout] Failed to kill {} (operation={}): {}",
                    program, operation, e
                );
            }
            let _ = timeout(Duration::from_secs(5), child.wait()).await;
            return Err(CommandError::Timeout {
                program: program.to_string(),
                after_ms: timeout_dur.as_millis() as u64,
            });
        }
    };

    let join = |e: tokio::task::JoinError| io_err(io::Error::new(io::ErrorKind::Other, e));
    let stdout_str = stdout_task.await.map_err(join)?.map_err(io_err)?;
    let stderr_str = stderr_task.await.map_err(join)?.map_err(io_err)?;

    let out = CommandOutput {
        exit_code: status.code(),
        stdout: stdout_str,
        stderr: stderr_str,
        duration_ms: started.elapsed().as_millis(),
    };
    debug!(
        "[PHASE: command] [STEP: exit] operation={} program={} exit_code={:?} duration_ms={} stdout_len={} stderr_len={}",
        operation,
        program,
        out.exit_code,
        out.duration_ms,
        out.stdout.len(),
        out.stderr.len()
    );
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_like_args_are_masked() {
        assert_eq!(mask_arg_for_log("--api_key=abc"), "***");
        assert_eq!(mask_arg_for_log("--format=csv"), "--format=csv");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let out = run_cmd_with_timeout(
            "sh",
            &["-c".to_string(), "echo hello; exit 3".to_string()],
            Duration::from_secs(5),
            "test",
        )
        .await
        .unwrap();
        assert_eq!(out.exit_code, Some(3));
        assert!(!out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_commands_time_out() {
        let err = run_cmd_with_timeout(
            "sh",
            &["-c".to_string(), "sleep 5".to_string()],
            Duration::from_millis(100),
            "test",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CommandError::Timeout { .. }));
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let err = run_cmd_with_timeout(
            "definitely-not-a-real-binary-7f3a",
            &[],
            Duration::from_secs(1),
            "test",
        )
        .await
        .unwrap_err();
        match err {
            CommandError::Spawn { source, .. } => {
                assert_eq!(source.kind(), io::ErrorKind::NotFound)
            }
            other => panic!("expected spawn error, got {:?}", other),
        }
    }
}
