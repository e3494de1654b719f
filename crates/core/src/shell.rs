use std::path::Path;
use std::time::Duration;

use anyhow::Result;

/// Output of one whitelisted shell invocation.
#[derive(Debug, Clone)]
pub struct ShellOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Run a single command through the safety kernel's whitelist, with a
/// wall-clock timeout. The program is spawned directly, never through a
/// shell, so no interpolation or chaining can occur.
pub async fn run_whitelisted(command: &str, cwd: &Path, timeout: Duration) -> Result<ShellOutput> {
    sneebly_safety::validate_command(command)?;

    let mut parts = command.split_whitespace();
    let program = parts
        .next()
        .ok_or_else(|| anyhow::anyhow!("empty command"))?;
    let args: Vec<&str> = parts.collect();

    let future = tokio::process::Command::new(program)
        .args(&args)
        .current_dir(cwd)
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(timeout, future).await {
        Ok(Ok(output)) => Ok(ShellOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            timed_out: false,
        }),
        Ok(Err(e)) => Ok(ShellOutput {
            exit_code: -1,
            stdout: String::new(),
            stderr: format!("Failed to execute: {e}"),
            timed_out: false,
        }),
        Err(_) => {
            tracing::warn!(command, "Shell command timed out");
            Ok(ShellOutput {
                exit_code: -1,
                stdout: String::new(),
                stderr: format!("timed out after {}s", timeout.as_secs()),
                timed_out: true,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_whitelisted_command_runs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "hello\n").unwrap();
        let out = run_whitelisted("cat f.txt", dir.path(), Duration::from_secs(10))
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "hello\n");
    }

    #[tokio::test]
    async fn test_denied_command_errors() {
        let dir = tempfile::tempdir().unwrap();
        let result = run_whitelisted("rm -rf /", dir.path(), Duration::from_secs(10)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_chained_command_errors() {
        let dir = tempfile::tempdir().unwrap();
        let result =
            run_whitelisted("ls; cat /etc/passwd", dir.path(), Duration::from_secs(10)).await;
        assert!(result.is_err());
    }
}
