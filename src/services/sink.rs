//! Restore sinks: scoped resources that pipe a restore stream into a
//! database restore tool's stdin and report whether the tool succeeded.

use crate::services::{
    process::{ManagedChild, stderr_tail},
    runner::RunnerError,
};
use async_trait::async_trait;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::AsyncWrite;
use tracing::{info, warn};

pub type RestoreWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A scoped consumer of restore bytes.
///
/// `open` starts the consumer; the caller writes, shuts the writer down,
/// then calls `close`, which waits for the consumer and decides
/// `successful`.
#[async_trait]
pub trait RestoreSink: Send {
    async fn open(&mut self) -> Result<RestoreWriter, RunnerError>;

    async fn close(&mut self) -> Result<(), RunnerError>;

    /// Stop the consumer without waiting for it to finish.
    async fn abort(&mut self);

    fn successful(&self) -> bool;
}

/// Database restore tools a sink can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestoreStrategy {
    /// Replay a SQL dump through the `mysql` client.
    Mysql,
    /// Extract an xbstream archive into the data directory.
    Xbstream,
    /// Extract a tar archive (base backup or WAL files) into the data directory.
    PgTar,
}

#[derive(Debug, Clone)]
pub struct SinkOptions {
    pub db_user: String,
    pub db_password: Option<String>,
    pub parallelism: u32,
    pub data_dir: PathBuf,
}

impl Default for SinkOptions {
    fn default() -> Self {
        Self {
            db_user: "os_admin".into(),
            db_password: None,
            parallelism: 1,
            data_dir: PathBuf::from("/var/lib/mysql/data"),
        }
    }
}

/// Sink backed by an external restore process.
pub struct ProcessSink {
    program: String,
    args: Vec<String>,
    child: Option<ManagedChild>,
    successful: bool,
}

impl ProcessSink {
    pub fn new(strategy: RestoreStrategy, options: &SinkOptions) -> Self {
        let data_dir = options.data_dir.display().to_string();
        let (program, args) = match strategy {
            RestoreStrategy::Mysql => {
                let mut args = vec![format!("--user={}", options.db_user)];
                args.extend(
                    options
                        .db_password
                        .as_ref()
                        .map(|password| format!("--password={password}")),
                );
                ("mysql", args)
            }
            RestoreStrategy::Xbstream => (
                "xbstream",
                vec![
                    "-x".to_string(),
                    format!("--parallel={}", options.parallelism.max(1)),
                    "-C".to_string(),
                    data_dir,
                ],
            ),
            RestoreStrategy::PgTar => (
                "tar",
                vec![
                    "--extract".to_string(),
                    "--file=-".to_string(),
                    format!("--directory={data_dir}"),
                ],
            ),
        };
        Self::with_command(program, args)
    }

    /// Sink for an arbitrary command reading the restore stream on stdin.
    pub fn with_command(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            child: None,
            successful: false,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

#[async_trait]
impl RestoreSink for ProcessSink {
    async fn open(&mut self) -> Result<RestoreWriter, RunnerError> {
        if let Some(child) = &self.child {
            return Err(RunnerError::AlreadyOpen(child.command_line().to_string()));
        }
        let mut child =
            ManagedChild::spawn(&self.program, &self.args, false).map_err(|source| {
                RunnerError::Spawn {
                    command: self.program.clone(),
                    source,
                }
            })?;
        info!("started restore with {}", child.command_line());
        let stdin = child.take_stdin().ok_or(RunnerError::NotOpen)?;
        self.child = Some(child);
        self.successful = false;
        Ok(Box::new(stdin))
    }

    /// Check the restore process's exit status.
    async fn close(&mut self) -> Result<(), RunnerError> {
        let child = self.child.take().ok_or(RunnerError::NotOpen)?;
        let output = child.wait().await?;
        if !output.status.success() {
            return Err(RunnerError::Exit {
                command: self.program.clone(),
                status: output.status.to_string(),
                stderr: stderr_tail(&output.stderr),
            });
        }
        self.successful = true;
        Ok(())
    }

    async fn abort(&mut self) {
        if let Some(child) = self.child.take() {
            warn!("aborting restore process {}", self.program);
            child.kill().await;
        }
        self.successful = false;
    }

    fn successful(&self) -> bool {
        self.successful
    }
}
