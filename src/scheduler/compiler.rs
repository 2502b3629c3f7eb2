use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

use crate::job::JobId;

/// File names inside a job's `logs/` directory.
pub const COMPILER_STDOUT: &str = "compilerOutput";
pub const COMPILER_STDERR: &str = "compilerError";

/// Result of a compile run, fed back into the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOutcome {
    pub job_id: JobId,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

/// Runs a job's compile command inside its directory.
///
/// The command is split on whitespace, no shell is involved. Output is
/// written to `logs/compilerOutput` and `logs/compilerError`.
#[derive(Debug, Clone)]
pub struct Compiler {
    job_dir: PathBuf,
}

impl Compiler {
    pub fn new(job_dir: impl Into<PathBuf>) -> Self {
        Self {
            job_dir: job_dir.into(),
        }
    }

    pub async fn compile(&self, job_id: JobId, command: &str) -> CompileOutcome {
        let mut parts = command.split_whitespace();
        let Some(program) = parts.next() else {
            return CompileOutcome {
                job_id,
                success: false,
                exit_code: None,
                error: Some("empty compile command".to_string()),
            };
        };

        tracing::info!(job_id, command, dir = %self.job_dir.display(), "Compiling job");

        let result = Command::new(program)
            .args(parts)
            .current_dir(&self.job_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;

        self.process_output(job_id, result).await
    }

    async fn process_output(
        &self,
        job_id: JobId,
        result: Result<std::process::Output, std::io::Error>,
    ) -> CompileOutcome {
        match result {
            Ok(output) => {
                let logs = self.job_dir.join("logs");
                if let Err(e) = write_logs(&logs, &output.stdout, &output.stderr).await {
                    tracing::warn!(job_id, error = %e, "Failed to write compiler logs");
                }

                let exit_code = output.status.code();
                let success = output.status.success();
                let error = if success {
                    None
                } else {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    Some(if stderr.trim().is_empty() {
                        match exit_code {
                            Some(code) => format!("exit code {}", code),
                            None => "terminated by signal".to_string(),
                        }
                    } else {
                        stderr.trim().to_string()
                    })
                };

                tracing::info!(job_id, success, exit_code = ?exit_code, "Compilation finished");
                CompileOutcome {
                    job_id,
                    success,
                    exit_code,
                    error,
                }
            }
            Err(e) => {
                tracing::error!(job_id, error = %e, "Failed to start compiler");
                CompileOutcome {
                    job_id,
                    success: false,
                    exit_code: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}

async fn write_logs(logs: &Path, stdout: &[u8], stderr: &[u8]) -> std::io::Result<()> {
    tokio::fs::create_dir_all(logs).await?;
    tokio::fs::write(logs.join(COMPILER_STDOUT), stdout).await?;
    tokio::fs::write(logs.join(COMPILER_STDERR), stderr).await?;
    Ok(())
}
