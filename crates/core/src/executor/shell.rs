// Subprocess execution (shell string or argv form)

use super::{render_failure, truncate_output, Invoke, InvokeContext};
use crate::error::ErrorKind;
use crate::template::{Overlay, TemplateEngine};
use crate::types::{CommandSpec, ExecutionResult, ShellExecution, ToolOutput};
use serde_json::{Map, Value};
use parking_lot::Mutex;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;

#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

impl Captured {
    fn into_text(self) -> String {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.truncated {
            text.push_str("\n[output truncated]");
        }
        text
    }
}

/// Kills the whole process group on drop, so cancelled calls and
/// background descendants never outlive the call.
struct GroupGuard {
    pid: Option<u32>,
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if let Some(pid) = self.pid {
            signal_group(pid, true);
        }
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, hard: bool) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let signal = if hard { Signal::SIGKILL } else { Signal::SIGTERM };
    if let Err(e) = killpg(Pid::from_raw(pid as i32), signal) {
        // ESRCH just means the group is already gone
        if e != nix::errno::Errno::ESRCH {
            tracing::debug!(pid, error = %e, "Failed to signal process group");
        }
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _hard: bool) {}

fn shell_command(rendered: &str) -> Command {
    if cfg!(windows) {
        let mut command = Command::new("cmd");
        command.arg("/C").arg(rendered);
        command
    } else {
        let mut command = Command::new("sh");
        command.arg("-c").arg(rendered);
        command
    }
}

/// A reader task filling a buffer that stays readable if the task never finishes
struct Capture {
    buffer: Arc<Mutex<Captured>>,
    task: JoinHandle<()>,
}

fn capture<R>(reader: Option<R>, limit: usize) -> Capture
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let buffer = Arc::new(Mutex::new(Captured::default()));
    let sink = buffer.clone();
    let task = tokio::spawn(async move {
        let Some(mut reader) = reader else {
            return;
        };

        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    // keep draining past the cap so the child never blocks on a full pipe
                    let mut captured = sink.lock();
                    let room = limit.saturating_sub(captured.bytes.len());
                    if n > room {
                        captured.truncated = true;
                    }
                    captured.bytes.extend_from_slice(&buf[..n.min(room)]);
                }
            }
        }
    });
    Capture { buffer, task }
}

/// Waits up to `bound` for EOF and returns whatever was read by then
async fn collect(mut capture: Capture, bound: Duration) -> Captured {
    if timeout(bound, &mut capture.task).await.is_err() {
        tracing::debug!("Output pipe still open after exit, keeping partial output");
        capture.task.abort();
    }
    std::mem::take(&mut *capture.buffer.lock())
}

/// SIGTERM the group, wait up to `grace`, then SIGKILL whatever is left
async fn terminate(child: &mut Child, grace: Duration) {
    match child.id() {
        Some(pid) => {
            signal_group(pid, false);
            if cfg!(not(unix)) {
                let _ = child.start_kill();
            }
            if timeout(grace, child.wait()).await.is_err() {
                tracing::warn!(pid, "Process ignored SIGTERM, sending SIGKILL");
            }
            signal_group(pid, true);
            let _ = child.kill().await;
        }
        None => {
            // already reaped
        }
    }
}

fn describe_status(status: &ExitStatus) -> (ErrorKind, String) {
    if let Some(code) = status.code() {
        return (ErrorKind::NonzeroExit, format!("exited with code {}", code));
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return (ErrorKind::Signal, format!("terminated by signal {}", signal));
        }
    }

    (ErrorKind::Signal, "terminated abnormally".to_string())
}

#[async_trait::async_trait]
impl Invoke for ShellExecution {
    async fn invoke(&self, params: &Map<String, Value>, ctx: &InvokeContext<'_>) -> ExecutionResult {
        let started = Instant::now();
        let env = Overlay {
            overrides: &self.env,
            base: ctx.env,
        };
        let render = |template: &str| TemplateEngine::render(template, params, &env);

        // render everything before spawning anything
        let mut command = match &self.command {
            CommandSpec::Shell(template) => match render(template) {
                Ok(rendered) => shell_command(&rendered),
                Err(e) => return render_failure(e, started),
            },
            CommandSpec::Argv(templates) => {
                let rendered = match templates
                    .iter()
                    .map(|t| render(t))
                    .collect::<Result<Vec<_>, _>>()
                {
                    Ok(rendered) => rendered,
                    Err(e) => return render_failure(e, started),
                };
                let Some((program, args)) = rendered.split_first() else {
                    return ExecutionResult::failed(
                        ErrorKind::SpawnFailed,
                        "empty argv",
                        ToolOutput::default(),
                        started.elapsed(),
                    );
                };
                let mut command = Command::new(program);
                command.args(args);
                command
            }
        };

        if let Some(dir) = &self.working_dir {
            match render(dir) {
                Ok(dir) => {
                    command.current_dir(dir);
                }
                Err(e) => return render_failure(e, started),
            }
        }

        command
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return ExecutionResult::failed(
                    ErrorKind::SpawnFailed,
                    format!("failed to spawn process: {}", e),
                    ToolOutput::default(),
                    started.elapsed(),
                )
            }
        };

        let guard = GroupGuard { pid: child.id() };
        let limit = ctx.settings.max_output_bytes;
        let stdout = capture(child.stdout.take(), limit);
        let stderr = capture(child.stderr.take(), limit);

        let waited = timeout(self.timeout, child.wait()).await;
        let timed_out = waited.is_err();
        if timed_out {
            terminate(&mut child, ctx.settings.kill_grace).await;
        }
        // descendants left holding the pipes die with the group
        drop(guard);

        let drain = ctx.settings.kill_grace.max(Duration::from_millis(100));
        let mut text = collect(stdout, drain).await.into_text();
        text.push_str(&collect(stderr, drain).await.into_text());
        let output = ToolOutput::Text(truncate_output(text, limit * 2));
        let elapsed = started.elapsed();

        match waited {
            Err(_) => ExecutionResult::failed(
                ErrorKind::Timeout,
                format!("timed out after {:.1}s", self.timeout.as_secs_f64()),
                output,
                elapsed,
            ),
            Ok(Err(e)) => ExecutionResult::failed(
                ErrorKind::SpawnFailed,
                format!("failed to wait for process: {}", e),
                output,
                elapsed,
            ),
            Ok(Ok(status)) if status.success() => ExecutionResult::ok(output, elapsed),
            Ok(Ok(status)) => {
                let (kind, message) = describe_status(&status);
                ExecutionResult::failed(kind, message, output, elapsed).with_exit_code(status.code())
            }
        }
    }
}
