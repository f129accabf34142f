//! Deadline-bounded shell execution with process-group teardown.
//!
//! Commands run under `bash -c` in their own process group. On deadline
//! expiry (or run cancellation) the whole group is terminated, so children
//! forked by the shell do not outlive the command. Non-zero exit codes are
//! reported, never raised: a failing command is a normal outcome.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::cancel::CancelHandle;

/// Characters of combined output kept (tail) per command.
pub const OUTPUT_TAIL_CHARS: usize = 6_000;

/// Conventional exit code reported when the deadline expired.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Conventional exit code reported when the run was cancelled mid-command.
pub const CANCELLED_EXIT_CODE: i32 = 143;

/// One command to execute.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    /// Shell command line, passed to `bash -c`.
    pub command: String,
    /// Working directory for the child.
    pub workdir: PathBuf,
    /// Extra environment on top of the inherited one.
    pub env: Vec<(String, String)>,
    /// Wall-clock budget for the command.
    pub deadline: Duration,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            workdir: workdir.into(),
            env: Vec::new(),
            deadline: Duration::from_secs(300),
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// What a command execution produced.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub exit_code: i32,
    /// Combined stdout+stderr, tail-truncated.
    pub output: String,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl CommandOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && !self.timed_out && !self.cancelled
    }
}

/// Execute one command to completion, deadline or cancellation.
pub async fn run_command(
    request: &CommandRequest,
    cancel: Option<&CancelHandle>,
) -> io::Result<CommandOutcome> {
    debug!(
        command = %request.command,
        workdir = %request.workdir.display(),
        deadline_secs = request.deadline.as_secs(),
        "executing command"
    );

    let mut cmd = Command::new("bash");
    cmd.arg("-c")
        .arg(&request.command)
        .current_dir(&request.workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in &request.env {
        cmd.env(key, value);
    }
    // Own process group so deadline teardown reaps shell-forked children.
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn()?;

    // Drain both pipes off-task while waiting; a child that fills one pipe
    // must not deadlock against an un-read buffer.
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let reader = tokio::spawn(async move {
        let mut out = Vec::new();
        let mut err = Vec::new();
        match (stdout, stderr) {
            (Some(mut o), Some(mut e)) => {
                let _ = tokio::join!(o.read_to_end(&mut out), e.read_to_end(&mut err));
            }
            (Some(mut o), None) => {
                let _ = o.read_to_end(&mut out).await;
            }
            (None, Some(mut e)) => {
                let _ = e.read_to_end(&mut err).await;
            }
            (None, None) => {}
        }
        (out, err)
    });

    enum WaitEnd {
        Exited(std::process::ExitStatus),
        DeadlineExpired,
        Cancelled,
    }

    let cancelled = async {
        match cancel {
            Some(handle) => handle.cancelled().await,
            None => std::future::pending().await,
        }
    };

    let end = tokio::select! {
        waited = tokio::time::timeout(request.deadline, child.wait()) => match waited {
            Ok(status) => WaitEnd::Exited(status?),
            Err(_) => WaitEnd::DeadlineExpired,
        },
        _ = cancelled => WaitEnd::Cancelled,
    };

    let (exit_code, timed_out, was_cancelled) = match end {
        WaitEnd::Exited(status) => (exit_code_of(status), false, false),
        WaitEnd::DeadlineExpired => {
            warn!(
                command = %request.command,
                deadline_secs = request.deadline.as_secs(),
                "command exceeded deadline, killing process group"
            );
            kill_tree(&mut child).await;
            (TIMEOUT_EXIT_CODE, true, false)
        }
        WaitEnd::Cancelled => {
            warn!(command = %request.command, "run cancelled, killing process group");
            kill_tree(&mut child).await;
            (CANCELLED_EXIT_CODE, false, true)
        }
    };

    let (out, err) = reader.await.unwrap_or_default();
    let mut combined = String::from_utf8_lossy(&out).into_owned();
    if !err.is_empty() {
        if !combined.is_empty() && !combined.ends_with('\n') {
            combined.push('\n');
        }
        combined.push_str(&String::from_utf8_lossy(&err));
    }

    Ok(CommandOutcome {
        exit_code,
        output: tail_truncate(&combined, OUTPUT_TAIL_CHARS),
        timed_out,
        cancelled: was_cancelled,
    })
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    // Killed by signal: report the shell convention 128+N.
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// Terminate the child's whole process group: SIGTERM, a short grace
/// period, then SIGKILL. The child is reaped before returning so the group
/// is gone when the runner hands back its outcome.
async fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            let pgid = pid as libc::pid_t;
            unsafe {
                libc::killpg(pgid, libc::SIGTERM);
            }
            if tokio::time::timeout(Duration::from_secs(2), child.wait())
                .await
                .is_ok()
            {
                return;
            }
            unsafe {
                libc::killpg(pgid, libc::SIGKILL);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }
    let _ = child.wait().await;
}

/// Keep the last `max_chars` characters of `text`, marking any elision.
pub fn tail_truncate(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let skipped = total - max_chars;
    let tail: String = text.chars().skip(skipped).collect();
    format!("[... {} chars elided ...]\n{}", skipped, tail)
}
