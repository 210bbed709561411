//! Helpers shared by the process-based backends (Apptainer, TinyRange).

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use futures::stream::BoxStream;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::SandboxHandle;
use crate::error::SandboxError;

/// Merges two output pipes into one stream of lines, in the order they are
/// produced. The stream ends once both pipes are closed.
///
/// Lines are decoded lossily: bytes that are not UTF-8 never end the stream.
pub fn merged_lines<O, E>(
    stdout: Option<O>,
    stderr: Option<E>,
) -> BoxStream<'static, Result<String, SandboxError>>
where
    O: AsyncRead + Unpin + Send + 'static,
    E: AsyncRead + Unpin + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut out = stdout.map(BufReader::new);
        let mut err = stderr.map(BufReader::new);
        // Partial lines survive a cancelled read in the losing select branch.
        let mut out_buf = Vec::new();
        let mut err_buf = Vec::new();

        while out.is_some() || err.is_some() {
            let (from_stdout, line) = tokio::select! {
                line = next_line(&mut out, &mut out_buf), if out.is_some() => (true, line),
                line = next_line(&mut err, &mut err_buf), if err.is_some() => (false, line),
            };

            match line {
                Ok(Some(line)) => yield Ok(line),
                Ok(None) => close(from_stdout, &mut out, &mut err),
                Err(e) => {
                    close(from_stdout, &mut out, &mut err);
                    yield Err(SandboxError::Logs(e.to_string()));
                }
            }
        }
    })
}

async fn next_line<R: AsyncBufRead + Unpin>(
    reader: &mut Option<R>,
    buf: &mut Vec<u8>,
) -> std::io::Result<Option<String>> {
    let Some(reader) = reader.as_mut() else {
        return Ok(None);
    };
    let read = reader.read_until(b'\n', buf).await?;
    if read == 0 && buf.is_empty() {
        return Ok(None);
    }
    let line = decode_line(buf);
    buf.clear();
    Ok(Some(line))
}

/// Lossy UTF-8 decoding without the line terminator.
fn decode_line(raw: &[u8]) -> String {
    let mut end = raw.len();
    while end > 0 && matches!(raw[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

fn close<A, B>(from_stdout: bool, out: &mut Option<A>, err: &mut Option<B>) {
    if from_stdout {
        *out = None;
    } else {
        *err = None;
    }
}

/// Takes the child's pipes and returns their merged lines. An empty stream
/// is returned when the handle has no child or the pipes were already taken.
pub fn child_lines(handle: &mut SandboxHandle) -> BoxStream<'static, Result<String, SandboxError>> {
    match handle.child.as_mut() {
        Some(child) => merged_lines(child.stdout.take(), child.stderr.take()),
        None => Box::pin(futures::stream::empty()),
    }
}

/// Waits for the child parked in `handle`.
///
/// A process killed by a signal has no exit code and is reported as `-1`.
pub async fn wait_child(handle: &mut SandboxHandle) -> Result<i64, SandboxError> {
    let child = handle
        .child
        .as_mut()
        .ok_or_else(|| SandboxError::UnitNotFound(handle.unit_name.clone()))?;

    let status = child
        .wait()
        .await
        .map_err(|e| SandboxError::Wait(e.to_string()))?;

    Ok(status.code().map(i64::from).unwrap_or(-1))
}

/// Spawns `command` with piped output.
pub fn spawn_piped(mut command: Command) -> Result<Child, SandboxError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    command
        .spawn()
        .map_err(|e| SandboxError::LaunchFailed(format!("Failed to spawn process: {}", e)))
}

/// Runs a short helper command to completion, returning its trimmed stdout.
pub async fn run_checked(program: &str, args: &[String]) -> Result<String, SandboxError> {
    debug!(program, ?args, "Running helper command");

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| SandboxError::RuntimeUnavailable(format!("{}: {}", program, e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SandboxError::LaunchFailed(format!(
            "{} {} failed: {}",
            program,
            args.join(" "),
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Live unit processes keyed by unit name, so a unit can be killed from
/// `prepare` or `teardown` while its handle is owned elsewhere.
#[derive(Debug, Clone, Default)]
pub struct ProcessRegistry {
    pids: Arc<Mutex<HashMap<String, u32>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, unit_name: &str, pid: u32) {
        self.pids.lock().await.insert(unit_name.to_string(), pid);
    }

    /// Kills the registered process of `unit_name`, if any, and forgets it.
    /// Returns whether a process was registered.
    pub async fn kill(&self, unit_name: &str) -> Result<bool, SandboxError> {
        let Some(pid) = self.pids.lock().await.remove(unit_name) else {
            return Ok(false);
        };

        debug!(unit = unit_name, pid, "Killing unit process");
        let status = Command::new("kill")
            .arg("-KILL")
            .arg(pid.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| SandboxError::Teardown(e.to_string()))?;

        if !status.success() {
            // Already exited.
            warn!(unit = unit_name, pid, "Unit process was not running");
        }
        Ok(true)
    }

    pub async fn forget(&self, unit_name: &str) {
        self.pids.lock().await.remove(unit_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_merged_lines_collects_both_pipes() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo out1; echo err1 >&2; echo out2");
        let mut child = spawn_piped(cmd).unwrap();

        let lines: Vec<String> = merged_lines(child.stdout.take(), child.stderr.take())
            .filter_map(|l| async move { l.ok() })
            .collect()
            .await;
        child.wait().await.unwrap();

        assert_eq!(lines.len(), 3);
        assert!(lines.contains(&"err1".to_string()));
        let out: Vec<_> = lines.iter().filter(|l| l.starts_with("out")).collect();
        assert_eq!(out, vec!["out1", "out2"]);
    }

    #[tokio::test]
    async fn test_merged_lines_survives_invalid_utf8() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg("printf 'progress \\377\\376\\n'; echo after; printf 'tail'");
        let mut child = spawn_piped(cmd).unwrap();

        let lines: Vec<Result<String, SandboxError>> =
            merged_lines(child.stdout.take(), child.stderr.take())
                .collect()
                .await;
        let status = child.wait().await.unwrap();

        assert!(status.success());
        let lines: Vec<String> = lines.into_iter().map(|l| l.unwrap()).collect();
        assert_eq!(lines, vec!["progress \u{FFFD}\u{FFFD}", "after", "tail"]);
    }

    #[test]
    fn test_decode_line_strips_terminator() {
        assert_eq!(decode_line(b"abc\r\n"), "abc");
        assert_eq!(decode_line(b"\n"), "");
        assert_eq!(decode_line(b"a\xffb"), "a\u{FFFD}b");
    }

    #[tokio::test]
    async fn test_wait_child_exit_code() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("exit 3");
        let child = spawn_piped(cmd).unwrap();
        let mut handle = SandboxHandle::new("u", "u").with_child(child);

        assert_eq!(wait_child(&mut handle).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_wait_without_child() {
        let mut handle = SandboxHandle::new("u", "u");
        assert!(matches!(
            wait_child(&mut handle).await,
            Err(SandboxError::UnitNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_registry_kill() {
        let registry = ProcessRegistry::new();
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let mut child = spawn_piped(cmd).unwrap();
        registry.register("unit", child.id().unwrap()).await;

        assert!(registry.kill("unit").await.unwrap());
        assert!(!registry.kill("unit").await.unwrap());

        let status = child.wait().await.unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn test_run_checked_failure() {
        let ok = run_checked("sh", &["-c".to_string(), "echo  hi ".to_string()])
            .await
            .unwrap();
        assert_eq!(ok, "hi");

        let err = run_checked("sh", &["-c".to_string(), "exit 1".to_string()]).await;
        assert!(matches!(err, Err(SandboxError::LaunchFailed(_))));
    }
}
