use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{AppError, AppResult};
use crate::models::surface::SurfaceCommand;

const BRIDGE_SCRIPT: &str = "bridges/relay/index.js";
const STARTUP_GRACE: Duration = Duration::from_millis(300);
const STOP_GRACE: Duration = Duration::from_millis(500);
const STDERR_KEEP_LINES: usize = 50;

/// One running automation bridge, driving the page of one responder instance.
#[derive(Debug)]
pub struct BridgeProcess {
    pub instance_id: String,
    pub started_at: DateTime<Utc>,
    pub child: Child,
    pub stdin: Arc<AsyncMutex<BufWriter<ChildStdin>>>,
}

/// Spawn a bridge subprocess and return (process, stdout) for the event reader.
pub async fn spawn_bridge(
    instance_id: &str,
    script: &Path,
    config_json: &str,
) -> AppResult<(BridgeProcess, ChildStdout)> {
    log::info!(
        "Spawning bridge process: instance_id={}, path={}",
        instance_id,
        script.display()
    );

    let mut cmd = tokio::process::Command::new("node");
    cmd.arg(script)
        .env("RELAY_BRIDGE_CONFIG", config_json)
        .env("RELAY_INSTANCE_ID", instance_id)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| {
        log::error!("Failed to spawn bridge process: {}", e);
        AppError::Transport(format!("Failed to spawn bridge for '{instance_id}': {e}"))
    })?;

    log::info!("Bridge process spawned with PID: {:?}", child.id());

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::Internal("Failed to capture bridge stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Internal("Failed to capture bridge stdout".into()))?;

    // Keep the first stderr lines for the crash report below
    let stderr_lines = Arc::new(AsyncMutex::new(Vec::<String>::new()));
    if let Some(stderr) = child.stderr.take() {
        let id = instance_id.to_string();
        let buf = Arc::clone(&stderr_lines);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                log::warn!("[Bridge:{}:stderr] {}", id, line);
                let mut buf = buf.lock().await;
                if buf.len() < STDERR_KEEP_LINES {
                    buf.push(line);
                }
            }
        });
    }

    tokio::time::sleep(STARTUP_GRACE).await;
    match child.try_wait() {
        Ok(Some(exit_status)) => {
            let stderr_output = {
                let lines = stderr_lines.lock().await;
                if lines.is_empty() {
                    "(no stderr output)".to_string()
                } else {
                    lines.join("\n")
                }
            };
            let msg = format!("Bridge process exited immediately with {exit_status}\nStderr:\n{stderr_output}");
            log::error!("{}", msg);
            return Err(AppError::Transport(msg));
        }
        Ok(None) => log::info!("Bridge process is running (PID: {:?})", child.id()),
        Err(e) => log::warn!("Could not check bridge process status: {}", e),
    }

    let process = BridgeProcess {
        instance_id: instance_id.to_string(),
        started_at: Utc::now(),
        child,
        stdin: Arc::new(AsyncMutex::new(BufWriter::new(stdin))),
    };
    Ok((process, stdout))
}

/// Write one command as a single NDJSON line and flush.
pub async fn write_command<W>(writer: &mut W, command: &SurfaceCommand) -> AppResult<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(command)?;
    line.push(b'\n');
    writer
        .write_all(&line)
        .await
        .map_err(|e| AppError::Transport(format!("Failed to write to bridge stdin: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| AppError::Transport(format!("Failed to flush bridge stdin: {e}")))?;
    Ok(())
}

pub async fn send_bridge_command(process: &BridgeProcess, command: &SurfaceCommand) -> AppResult<()> {
    let mut stdin = process.stdin.lock().await;
    write_command(&mut *stdin, command).await
}

pub async fn stop_bridge_process(process: &mut BridgeProcess) -> AppResult<()> {
    if let Err(e) = send_bridge_command(process, &SurfaceCommand::Stop).await {
        log::warn!("[Bridge:{}] Failed to send stop command: {}", process.instance_id, e);
    }

    tokio::time::sleep(STOP_GRACE).await;

    let uptime = Utc::now() - process.started_at;
    match process.child.try_wait() {
        Ok(Some(_)) => log::info!(
            "[Bridge:{}] Exited gracefully after {}s",
            process.instance_id,
            uptime.num_seconds()
        ),
        _ => {
            log::info!("[Bridge:{}] Force killing bridge process", process.instance_id);
            process.child.kill().await?;
        }
    }
    Ok(())
}

/// Returns `true` if the bridge process has not yet exited.
pub fn check_process_alive(process: &mut BridgeProcess) -> bool {
    match process.child.try_wait() {
        Ok(Some(_)) => false,
        Ok(None) => true,
        Err(e) => {
            log::warn!("[Bridge:{}] Failed to check process status: {}", process.instance_id, e);
            false
        }
    }
}

/// The configured bridge script, or `bridges/relay/index.js` found by
/// walking up from the executable and then the working directory.
pub fn get_bridge_path(configured: Option<&Path>) -> AppResult<PathBuf> {
    if let Some(script) = configured {
        if script.exists() {
            return Ok(script.to_path_buf());
        }
        return Err(AppError::NotFound(format!(
            "Configured bridge script {} does not exist",
            script.display()
        )));
    }

    let exe_path = std::env::current_exe()?;
    let mut dir = exe_path.parent();
    while let Some(d) = dir {
        let candidate = d.join(BRIDGE_SCRIPT);
        if candidate.exists() {
            return Ok(candidate);
        }
        dir = d.parent();
    }

    let cwd_candidate = PathBuf::from(BRIDGE_SCRIPT);
    if cwd_candidate.exists() {
        return Ok(cwd_candidate);
    }

    Err(AppError::NotFound(format!("Bridge script {BRIDGE_SCRIPT} not found")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_command_emits_one_line() {
        let mut buf: Vec<u8> = Vec::new();
        write_command(&mut buf, &SurfaceCommand::StartMonitoring { request_id: "r1".into() })
            .await
            .expect("write");
        write_command(&mut buf, &SurfaceCommand::Stop).await.expect("write");

        let text = String::from_utf8(buf).expect("utf8");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![r#"{"type":"START_MONITORING","requestId":"r1"}"#, r#"{"type":"STOP"}"#]
        );
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn test_configured_bridge_path_must_exist() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = dir.path().join("bridge.js");

        assert!(matches!(get_bridge_path(Some(script.as_path())), Err(AppError::NotFound(_))));

        std::fs::write(&script, "// bridge").expect("write script");
        assert_eq!(get_bridge_path(Some(script.as_path())).expect("found"), script);
    }
}
