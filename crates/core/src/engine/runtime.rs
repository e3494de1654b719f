use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::probes;

/// Output substrings that mean the host process died or cannot serve.
pub const CRASH_MARKERS: &[&str] = &[
    "SyntaxError",
    "ReferenceError",
    "Cannot find module",
    "EADDRINUSE",
    "Uncaught",
    "FATAL",
    "Segmentation fault",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeVerdict {
    Healthy,
    /// Health endpoint never answered within the timeout.
    Unresponsive,
    /// A crash marker appeared in process output.
    Crashed { marker: String, line: String },
}

/// Passive variant: the host is already running under its own supervisor,
/// so just poll the health endpoint.
pub async fn verify_running(app_url: &str, timeout: Duration) -> RuntimeVerdict {
    if probes::poll_health(app_url, timeout).await {
        RuntimeVerdict::Healthy
    } else {
        RuntimeVerdict::Unresponsive
    }
}

/// Active variant: spawn a fresh host process from the owner-configured
/// start command, watch stdout/stderr for crash markers during the startup
/// window, then poll health. The child is killed before returning.
pub async fn verify_spawned(
    start_command: &str,
    cwd: &Path,
    app_url: &str,
    startup_window: Duration,
    health_timeout: Duration,
) -> Result<RuntimeVerdict> {
    let mut parts = start_command.split_whitespace();
    let program = parts
        .next()
        .ok_or_else(|| anyhow::anyhow!("empty start command"))?;
    let args: Vec<&str> = parts.collect();

    let mut child = tokio::process::Command::new(program)
        .args(&args)
        .current_dir(cwd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    if let Some(stdout) = stdout {
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
    }
    if let Some(stderr) = stderr {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
    }

    let deadline = tokio::time::Instant::now() + startup_window;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(line)) => {
                if let Some(marker) = CRASH_MARKERS.iter().find(|m| line.contains(**m)) {
                    let _ = child.kill().await;
                    return Ok(RuntimeVerdict::Crashed {
                        marker: marker.to_string(),
                        line,
                    });
                }
            }
            Ok(None) | Err(_) => break,
        }
    }

    let verdict = if probes::poll_health(app_url, health_timeout).await {
        RuntimeVerdict::Healthy
    } else {
        RuntimeVerdict::Unresponsive
    };

    let _ = child.kill().await;
    Ok(verdict)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crash_marker_catalogue() {
        let line = "ReferenceError: foo is not defined";
        assert!(CRASH_MARKERS.iter().any(|m| line.contains(m)));
        let clean = "Server listening on port 5000";
        assert!(!CRASH_MARKERS.iter().any(|m| clean.contains(m)));
    }

    #[tokio::test]
    async fn test_unresponsive_when_nothing_listens() {
        // Nothing listens on this port; the poll must time out quickly.
        let verdict =
            verify_running("http://127.0.0.1:59999", Duration::from_millis(600)).await;
        assert_eq!(verdict, RuntimeVerdict::Unresponsive);
    }
}
