//! External tool invocation with bounded wall-clock timeouts.
//!
//! Every conversion and OCR step runs as a child process under a per-step
//! timeout. Children are spawned with `kill_on_drop`, so the process handle
//! lives inside the in-flight future: when the per-step timeout fires, or
//! when the global deadline cancels the whole pipeline future, the child is
//! terminated without any ambient registration.

use std::future::Future;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

/// Sentinel retcode for a tool that exceeded its timeout.
pub const RET_TIMEOUT: i32 = -1;
/// Sentinel retcode for a tool that could not be started.
pub const RET_EXEC: i32 = -2;

/// Outcome of one tool invocation.
#[derive(Debug, Clone)]
pub struct ToolResult {
    /// 0 on success, the tool's exit code when positive, or one of the
    /// negative sentinels.
    pub retcode: i32,
    /// Captured output lines, from whichever streams were captured.
    pub lines: Vec<String>,
}

impl ToolResult {
    pub fn ok(&self) -> bool {
        self.retcode == 0
    }

    pub fn timed_out(&self) -> bool {
        self.retcode == RET_TIMEOUT
    }

    pub fn exec_failed(&self) -> bool {
        self.retcode == RET_EXEC
    }

    fn failure(retcode: i32, detail: String) -> Self {
        Self {
            retcode,
            lines: vec![detail],
        }
    }
}

/// Where a child stream goes.
#[derive(Debug, Clone, Copy)]
pub enum Sink<'a> {
    /// Drop the stream.
    Discard,
    /// Collect the stream into `ToolResult::lines`.
    Capture,
    /// Redirect the stream into a file.
    File(&'a Path),
}

/// Stream wiring for one invocation.
#[derive(Debug, Clone, Copy)]
pub struct ToolIo<'a> {
    pub stdin: Option<&'a Path>,
    pub stdout: Sink<'a>,
    pub stderr: Sink<'a>,
}

impl Default for ToolIo<'_> {
    fn default() -> Self {
        Self {
            stdin: None,
            stdout: Sink::Capture,
            stderr: Sink::Discard,
        }
    }
}

impl<'a> ToolIo<'a> {
    /// Capture stdout, discard everything else.
    pub fn capture() -> Self {
        Self::default()
    }

    /// Write stdout to a file, discard stderr.
    pub fn stdout_to(path: &'a Path) -> Self {
        Self {
            stdin: None,
            stdout: Sink::File(path),
            stderr: Sink::Discard,
        }
    }
}

fn open_sink(sink: Sink<'_>) -> std::io::Result<Stdio> {
    Ok(match sink {
        Sink::Discard => Stdio::null(),
        Sink::Capture => Stdio::piped(),
        Sink::File(path) => Stdio::from(std::fs::File::create(path)?),
    })
}

/// Invokes external programs under a fixed per-step timeout.
#[derive(Debug, Clone)]
pub struct ToolRunner {
    timeout: Duration,
}

impl ToolRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Run `program` with `args`, wiring streams per `io`.
    ///
    /// Never returns an error: spawn failures and timeouts are reported
    /// through the retcode sentinels so a failed step aborts only the
    /// image chain that issued it.
    pub async fn invoke(&self, program: &str, args: &[String], io: ToolIo<'_>) -> ToolResult {
        let stdin = match io.stdin {
            Some(path) => match std::fs::File::open(path) {
                Ok(f) => Stdio::from(f),
                Err(e) => {
                    return ToolResult::failure(RET_EXEC, format!("cannot open stdin: {e}"))
                }
            },
            None => Stdio::null(),
        };
        let stdout = match open_sink(io.stdout) {
            Ok(s) => s,
            Err(e) => return ToolResult::failure(RET_EXEC, format!("cannot open stdout: {e}")),
        };
        let stderr = match open_sink(io.stderr) {
            Ok(s) => s,
            Err(e) => return ToolResult::failure(RET_EXEC, format!("cannot open stderr: {e}")),
        };

        let child = Command::new(program)
            .args(args)
            .stdin(stdin)
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(program, "failed to start tool: {e}");
                return ToolResult::failure(RET_EXEC, format!("{program}: {e}"));
            }
        };

        // On timeout the wait future is dropped, taking the child with it;
        // kill_on_drop terminates the process.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                tracing::error!(program, "tool wait failed: {e}");
                return ToolResult::failure(RET_EXEC, format!("{program}: {e}"));
            }
            Err(_) => {
                tracing::warn!(program, timeout = ?self.timeout, "tool timed out");
                return ToolResult {
                    retcode: RET_TIMEOUT,
                    lines: Vec::new(),
                };
            }
        };

        let mut lines = Vec::new();
        if matches!(io.stdout, Sink::Capture) {
            lines.extend(
                String::from_utf8_lossy(&output.stdout)
                    .lines()
                    .map(str::to_string),
            );
        }
        if matches!(io.stderr, Sink::Capture) {
            lines.extend(
                String::from_utf8_lossy(&output.stderr)
                    .lines()
                    .map(str::to_string),
            );
        }

        ToolResult {
            retcode: output.status.code().unwrap_or(RET_EXEC),
            lines,
        }
    }
}

/// Run a pipeline future under the per-message deadline.
///
/// `None` means the deadline fired: the future was dropped, killing any
/// in-flight child process, and the caller must discard the workspace and
/// yield a neutral score.
pub async fn run_with_deadline<T>(limit: Duration, fut: impl Future<Output = T>) -> Option<T> {
    tokio::time::timeout(limit, fut).await.ok()
}

/// Check whether a program resolves on PATH (or as a direct path).
pub fn tool_available(program: &str) -> bool {
    which::which(program).is_ok()
}
