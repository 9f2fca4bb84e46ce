//! Child-process plumbing shared by backup runners and restore sinks.

use std::{io, process::{ExitStatus, Stdio}};
use tokio::{
    io::AsyncReadExt,
    process::{Child, ChildStderr, ChildStdin, ChildStdout, Command},
    task::JoinHandle,
};
use tracing::{debug, warn};

/// What a finished child left behind.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stderr: String,
}

/// A spawned database tool with stderr drained in the background so a
/// chatty tool never blocks on a full pipe.
pub struct ManagedChild {
    command_line: String,
    child: Child,
    stderr: Option<JoinHandle<io::Result<Vec<u8>>>>,
}

impl ManagedChild {
    /// Spawn `program args...` with stdout piped (`pipe_stdout`) or stdin
    /// piped (otherwise). The child is killed if this handle is dropped
    /// without `wait` or `kill`.
    pub fn spawn(program: &str, args: &[String], pipe_stdout: bool) -> io::Result<Self> {
        let mut command = Command::new(program);
        command
            .args(args)
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if pipe_stdout {
            command.stdin(Stdio::null()).stdout(Stdio::piped());
        } else {
            command.stdin(Stdio::piped()).stdout(Stdio::null());
        }

        let command_line = render_command_line(program, args);
        debug!("spawning {}", command_line);
        let mut child = command.spawn()?;
        let stderr = child.stderr.take().map(drain_stderr);
        Ok(Self {
            command_line,
            child,
            stderr,
        })
    }

    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    /// Wait for exit and collect stderr.
    pub async fn wait(mut self) -> io::Result<ProcessOutput> {
        let status = self.child.wait().await?;
        let stderr = match self.stderr.take() {
            Some(handle) => match handle.await {
                Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
                Ok(Err(err)) => return Err(err),
                Err(err) => return Err(io::Error::other(err)),
            },
            None => String::new(),
        };
        debug!("{} exited with {}", self.command_line, status);
        Ok(ProcessOutput { status, stderr })
    }

    /// Force termination; a child that already exited is not an error.
    pub async fn kill(mut self) {
        match self.child.kill().await {
            Ok(()) => debug!("killed {}", self.command_line),
            Err(err) if err.kind() == io::ErrorKind::InvalidInput => {
                debug!("{} already stopped", self.command_line)
            }
            Err(err) => warn!("failed to kill {}: {}", self.command_line, err),
        }
        if let Some(handle) = self.stderr.take() {
            handle.abort();
        }
    }
}

fn drain_stderr(mut stderr: ChildStderr) -> JoinHandle<io::Result<Vec<u8>>> {
    tokio::spawn(async move {
        let mut buf = Vec::new();
        stderr.read_to_end(&mut buf).await?;
        Ok(buf)
    })
}

/// Command line for logs with password arguments masked.
pub fn render_command_line(program: &str, args: &[String]) -> String {
    let mut parts = vec![program.to_string()];
    for arg in args {
        match arg.split_once('=') {
            Some((flag, _)) if flag.contains("password") => parts.push(format!("{flag}=***")),
            _ => parts.push(arg.clone()),
        }
    }
    parts.join(" ")
}

/// Last few lines of a tool's stderr, for error messages.
pub fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().collect();
    let start = lines.len().saturating_sub(5);
    lines[start..].join("\n")
}
