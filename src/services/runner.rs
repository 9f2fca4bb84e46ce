//! src/services/runner.rs
//!
//! Backup runners: scoped resources that spawn a database dump tool, expose
//! its stdout as the backup stream, and decide after the fact whether the
//! dump succeeded. Incremental runners also carry their parent backup and
//! report markers (LSN, WAL files) consumed by the catalog and by later
//! incrementals.

use crate::services::{
    backup_metadata::{
        BackupMetadata, LSN, PARENT_CHECKSUM, PARENT_LOCATION, STOP_WAL_FILE, parse_pg_label,
        parse_xtrabackup_lsn,
    },
    process::{ManagedChild, ProcessOutput, stderr_tail},
};
use async_trait::async_trait;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::{
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::io::AsyncRead;
use tracing::{info, warn};

/// Marker xtrabackup-family tools print on stderr after a good backup.
const COMPLETED_OK: &str = "completed OK!";

pub type BackupReader = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("`{0}` is already running")]
    AlreadyOpen(String),
    #[error("no process is running")]
    NotOpen,
    #[error("`{command}` exited with {status}: {stderr}")]
    Exit {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("`{0}` did not report `completed OK!`")]
    Incomplete(String),
    #[error("cannot collect backup metadata: {0}")]
    Metadata(String),
    #[error("{0} requires a parent backup")]
    MissingParent(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A scoped producer of backup bytes.
///
/// `open` starts the producer and hands out its stream. Exactly one of
/// `close` (stream fully consumed) or `abort` (pipeline gave up) must follow;
/// `close` waits for the producer, decides `successful`, and captures
/// metadata.
#[async_trait]
pub trait BackupRunner: Send {
    /// Manifest object name: backup id plus the format's extension.
    fn manifest_name(&self) -> String;

    async fn open(&mut self) -> Result<BackupReader, RunnerError>;

    async fn close(&mut self) -> Result<(), RunnerError>;

    async fn abort(&mut self);

    /// Post-hoc success predicate; false until `close` succeeded.
    fn successful(&self) -> bool;

    /// Markers to store with the backup. Complete only after `close`.
    fn metadata(&self) -> BackupMetadata;

    fn parent(&self) -> Option<&ParentBackup> {
        None
    }
}

/// Database dump tools a runner can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackupStrategy {
    Mysqldump,
    Innobackupex,
    InnobackupexIncremental,
    Mariabackup,
    MariabackupIncremental,
    Xtrabackup,
    XtrabackupIncremental,
    PgBasebackup,
    PgBasebackupIncremental,
}

impl BackupStrategy {
    pub fn is_incremental(self) -> bool {
        matches!(
            self,
            BackupStrategy::InnobackupexIncremental
                | BackupStrategy::MariabackupIncremental
                | BackupStrategy::XtrabackupIncremental
                | BackupStrategy::PgBasebackupIncremental
        )
    }

    fn is_xtrabackup_family(self) -> bool {
        matches!(
            self,
            BackupStrategy::Innobackupex
                | BackupStrategy::InnobackupexIncremental
                | BackupStrategy::Mariabackup
                | BackupStrategy::MariabackupIncremental
                | BackupStrategy::Xtrabackup
                | BackupStrategy::XtrabackupIncremental
        )
    }

    fn is_postgres(self) -> bool {
        matches!(
            self,
            BackupStrategy::PgBasebackup | BackupStrategy::PgBasebackupIncremental
        )
    }

    pub fn manifest_extension(self) -> &'static str {
        match self {
            BackupStrategy::Mysqldump => ".sql",
            BackupStrategy::PgBasebackup | BackupStrategy::PgBasebackupIncremental => ".tar",
            _ => ".xbstream",
        }
    }

    fn name(self) -> &'static str {
        match self {
            BackupStrategy::Mysqldump => "mysqldump",
            BackupStrategy::Innobackupex => "innobackupex",
            BackupStrategy::InnobackupexIncremental => "innobackupex-incremental",
            BackupStrategy::Mariabackup => "mariabackup",
            BackupStrategy::MariabackupIncremental => "mariabackup-incremental",
            BackupStrategy::Xtrabackup => "xtrabackup",
            BackupStrategy::XtrabackupIncremental => "xtrabackup-incremental",
            BackupStrategy::PgBasebackup => "pg-basebackup",
            BackupStrategy::PgBasebackupIncremental => "pg-basebackup-incremental",
        }
    }
}

/// Settings the runner commands are built from.
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub db_user: String,
    pub db_password: Option<String>,
    pub parallelism: u32,
    /// MySQL data directory, or the Postgres WAL archive for incrementals.
    pub data_dir: PathBuf,
    /// Label file written by the tool (Postgres).
    pub metadata_file: Option<PathBuf>,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            db_user: "os_admin".into(),
            db_password: None,
            parallelism: 1,
            data_dir: PathBuf::from("/var/lib/mysql/data"),
            metadata_file: None,
        }
    }
}

/// The backup an incremental builds on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentBackup {
    pub location: String,
    pub checksum: String,
    /// Markers recorded with the parent, e.g. its LSN or last WAL file.
    pub metadata: BackupMetadata,
}

/// Runner backed by an external dump process.
pub struct ProcessRunner {
    strategy: BackupStrategy,
    backup_id: String,
    options: RunnerOptions,
    parent: Option<ParentBackup>,
    program: String,
    args: Vec<String>,
    /// First WAL file to archive; the archive is listed when the runner opens.
    wal_since: Option<String>,
    wal_files: Vec<String>,
    child: Option<ManagedChild>,
    output: Option<ProcessOutput>,
    metadata: BackupMetadata,
    successful: bool,
}

impl ProcessRunner {
    /// Full backup runner. Incremental strategies need [`ProcessRunner::incremental`].
    pub fn new(
        strategy: BackupStrategy,
        backup_id: impl Into<String>,
        options: RunnerOptions,
    ) -> Result<Self, RunnerError> {
        if strategy.is_incremental() {
            return Err(RunnerError::MissingParent(strategy.name()));
        }
        Self::build(strategy, backup_id.into(), options, None)
    }

    pub fn incremental(
        strategy: BackupStrategy,
        backup_id: impl Into<String>,
        options: RunnerOptions,
        parent: ParentBackup,
    ) -> Result<Self, RunnerError> {
        if !strategy.is_incremental() {
            warn!(
                "{} is not incremental; parent {} is recorded but not used",
                strategy.name(),
                parent.location
            );
        }
        Self::build(strategy, backup_id.into(), options, Some(parent))
    }

    /// Runner for an arbitrary command whose stdout is the backup stream.
    /// Success and metadata rules still follow `strategy`.
    pub fn with_command(
        strategy: BackupStrategy,
        backup_id: impl Into<String>,
        program: impl Into<String>,
        args: Vec<String>,
    ) -> Self {
        Self {
            strategy,
            backup_id: backup_id.into(),
            options: RunnerOptions::default(),
            parent: None,
            program: program.into(),
            args,
            wal_since: None,
            wal_files: Vec::new(),
            child: None,
            output: None,
            metadata: BackupMetadata::new(),
            successful: false,
        }
    }

    fn build(
        strategy: BackupStrategy,
        backup_id: String,
        options: RunnerOptions,
        parent: Option<ParentBackup>,
    ) -> Result<Self, RunnerError> {
        let (program, args) = command_for(strategy, &backup_id, &options, parent.as_ref())?;
        let wal_since = match strategy {
            BackupStrategy::PgBasebackupIncremental => {
                Some(parent_stop_wal_file(strategy, parent.as_ref())?.to_string())
            }
            _ => None,
        };
        Ok(Self {
            strategy,
            backup_id,
            options,
            parent,
            program,
            args,
            wal_since,
            wal_files: Vec::new(),
            child: None,
            output: None,
            metadata: BackupMetadata::new(),
            successful: false,
        })
    }

    pub fn strategy(&self) -> BackupStrategy {
        self.strategy
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// WAL files archived by a Postgres incremental, known once opened.
    pub fn wal_files(&self) -> &[String] {
        &self.wal_files
    }

    /// Exit status and stderr of the finished tool.
    pub fn output(&self) -> Option<&ProcessOutput> {
        self.output.as_ref()
    }

    fn check_process(&self, output: &ProcessOutput) -> Result<(), RunnerError> {
        if !output.status.success() {
            return Err(RunnerError::Exit {
                command: self.program.clone(),
                status: output.status.to_string(),
                stderr: stderr_tail(&output.stderr),
            });
        }
        if self.strategy.is_xtrabackup_family() && !output.stderr.contains(COMPLETED_OK) {
            return Err(RunnerError::Incomplete(self.program.clone()));
        }
        Ok(())
    }

    async fn capture_metadata(&mut self, output: &ProcessOutput) -> Result<(), RunnerError> {
        let mut metadata = BackupMetadata::new();
        if self.strategy.is_xtrabackup_family() {
            if let Some(lsn) = parse_xtrabackup_lsn(&output.stderr) {
                metadata.insert(LSN, lsn);
            }
        }
        if self.strategy.is_postgres() {
            if let Some(path) = &self.options.metadata_file {
                let label = tokio::fs::read_to_string(path).await.map_err(|err| {
                    RunnerError::Metadata(format!("reading {}: {}", path.display(), err))
                })?;
                metadata.extend(parse_pg_label(&label));
            }
            if self.strategy == BackupStrategy::PgBasebackupIncremental {
                if let Some(last) = self.wal_files.last() {
                    metadata.insert(STOP_WAL_FILE, last.clone());
                }
            }
        }
        if let Some(parent) = &self.parent {
            metadata.insert(PARENT_LOCATION, parent.location.clone());
            metadata.insert(PARENT_CHECKSUM, parent.checksum.clone());
        }
        self.metadata = metadata;
        Ok(())
    }
}

#[async_trait]
impl BackupRunner for ProcessRunner {
    fn manifest_name(&self) -> String {
        format!("{}{}", self.backup_id, self.strategy.manifest_extension())
    }

    async fn open(&mut self) -> Result<BackupReader, RunnerError> {
        if let Some(child) = &self.child {
            return Err(RunnerError::AlreadyOpen(child.command_line().to_string()));
        }
        let mut args = self.args.clone();
        if let Some(since) = &self.wal_since {
            self.wal_files = wal_files_since(&self.options.data_dir, since).await?;
            args.extend(self.wal_files.iter().cloned());
        }
        let mut child =
            ManagedChild::spawn(&self.program, &args, true).map_err(|source| {
                RunnerError::Spawn {
                    command: self.program.clone(),
                    source,
                }
            })?;
        info!("started backup {} with {}", self.backup_id, child.command_line());
        let stdout = child.take_stdout().ok_or(RunnerError::NotOpen)?;
        self.child = Some(child);
        self.successful = false;
        Ok(Box::new(stdout))
    }

    async fn close(&mut self) -> Result<(), RunnerError> {
        let child = self.child.take().ok_or(RunnerError::NotOpen)?;
        let output = child.wait().await?;
        let checked = self.check_process(&output);
        let captured = match &checked {
            Ok(()) => self.capture_metadata(&output).await,
            Err(_) => Ok(()),
        };
        self.output = Some(output);
        checked?;
        captured?;
        self.successful = true;
        info!("backup {} finished successfully", self.backup_id);
        Ok(())
    }

    async fn abort(&mut self) {
        if let Some(child) = self.child.take() {
            warn!("aborting backup {}", self.backup_id);
            child.kill().await;
        }
        self.successful = false;
    }

    fn successful(&self) -> bool {
        self.successful
    }

    fn metadata(&self) -> BackupMetadata {
        self.metadata.clone()
    }

    fn parent(&self) -> Option<&ParentBackup> {
        self.parent.as_ref()
    }
}

/// Program and arguments for `strategy`.
fn command_for(
    strategy: BackupStrategy,
    backup_id: &str,
    options: &RunnerOptions,
    parent: Option<&ParentBackup>,
) -> Result<(String, Vec<String>), RunnerError> {
    let user = format!("--user={}", options.db_user);
    let password = options
        .db_password
        .as_ref()
        .map(|password| format!("--password={password}"));
    let parallel = format!("--parallel={}", options.parallelism.max(1));
    let data_dir = options.data_dir.display().to_string();
    let parent_lsn = || -> Result<String, RunnerError> {
        let parent = parent.ok_or(RunnerError::MissingParent(strategy.name()))?;
        parent
            .metadata
            .lsn()
            .map(|lsn| format!("--incremental-lsn={lsn}"))
            .ok_or_else(|| RunnerError::Metadata(format!("parent {} has no lsn", parent.location)))
    };

    let mut args: Vec<String> = Vec::new();
    let program = match strategy {
        BackupStrategy::Mysqldump => {
            args.extend([
                "--all-databases".to_string(),
                "--opt".to_string(),
                "--single-transaction".to_string(),
                user,
            ]);
            args.extend(password);
            "mysqldump"
        }
        BackupStrategy::Innobackupex | BackupStrategy::InnobackupexIncremental => {
            args.extend(["--stream=xbstream".to_string(), parallel, user]);
            args.extend(password);
            if strategy.is_incremental() {
                args.push("--incremental".to_string());
                args.push(parent_lsn()?);
            }
            args.push(data_dir);
            "innobackupex"
        }
        BackupStrategy::Mariabackup | BackupStrategy::MariabackupIncremental => {
            args.extend([
                "--backup".to_string(),
                "--stream=xbstream".to_string(),
                parallel,
                user,
            ]);
            args.extend(password);
            if strategy.is_incremental() {
                args.push(parent_lsn()?);
            }
            "mariabackup"
        }
        BackupStrategy::Xtrabackup | BackupStrategy::XtrabackupIncremental => {
            args.extend([
                "--backup".to_string(),
                "--stream=xbstream".to_string(),
                parallel,
                user,
            ]);
            args.extend(password);
            if strategy.is_incremental() {
                args.push(parent_lsn()?);
            }
            args.push(format!("--target-dir={data_dir}"));
            "xtrabackup"
        }
        BackupStrategy::PgBasebackup => {
            args.extend([
                "--pgdata=-".to_string(),
                "--format=tar".to_string(),
                "--wal-method=fetch".to_string(),
                format!("--label={backup_id}"),
                format!("--username={}", options.db_user),
                "--no-password".to_string(),
            ]);
            "pg_basebackup"
        }
        BackupStrategy::PgBasebackupIncremental => {
            args.extend([
                "--create".to_string(),
                "--file=-".to_string(),
                format!("--directory={data_dir}"),
            ]);
            "tar"
        }
    };
    Ok((program.to_string(), args))
}

/// Last WAL file recorded by the parent of a Postgres incremental.
fn parent_stop_wal_file(
    strategy: BackupStrategy,
    parent: Option<&ParentBackup>,
) -> Result<&str, RunnerError> {
    let parent = parent.ok_or(RunnerError::MissingParent(strategy.name()))?;
    parent.metadata.get(STOP_WAL_FILE).ok_or_else(|| {
        RunnerError::Metadata(format!("parent {} has no stop-wal-file", parent.location))
    })
}

/// WAL segment files in `archive` at or after `since`, in name order.
///
/// WAL file names are fixed-width hex, so name order is log order.
async fn wal_files_since(archive: &Path, since: &str) -> Result<Vec<String>, RunnerError> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(archive).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let is_wal = name.len() == 24 && name.chars().all(|c| c.is_ascii_hexdigit());
        if is_wal && name.as_str() >= since {
            files.push(name);
        }
    }
    files.sort();
    if files.is_empty() {
        return Err(RunnerError::Metadata(format!(
            "no WAL files at or after {} in {}",
            since,
            archive.display()
        )));
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn parent_with(key: &str, value: &str) -> ParentBackup {
        let mut metadata = BackupMetadata::new();
        metadata.insert(key, value);
        ParentBackup {
            location: "http://swift/v1/a/database_backups/p.xbstream".into(),
            checksum: "parentsum".into(),
            metadata,
        }
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[test]
    fn builds_incremental_xtrabackup_command_from_parent_lsn() {
        let options = RunnerOptions {
            db_password: Some("pw".into()),
            parallelism: 4,
            ..Default::default()
        };
        let runner = ProcessRunner::incremental(
            BackupStrategy::XtrabackupIncremental,
            "inc1",
            options,
            parent_with(LSN, "1234"),
        )
        .unwrap();
        assert_eq!(runner.program(), "xtrabackup");
        assert!(runner.args().contains(&"--incremental-lsn=1234".to_string()));
        assert!(runner.args().contains(&"--parallel=4".to_string()));
        assert!(runner.args().contains(&"--password=pw".to_string()));
        assert_eq!(runner.manifest_name(), "inc1.xbstream");
    }

    #[test]
    fn incremental_strategy_without_parent_is_rejected() {
        let err = ProcessRunner::new(
            BackupStrategy::InnobackupexIncremental,
            "x",
            RunnerOptions::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, RunnerError::MissingParent(_)));

        let err = ProcessRunner::incremental(
            BackupStrategy::MariabackupIncremental,
            "x",
            RunnerOptions::default(),
            parent_with("label", "no-lsn"),
        )
        .err()
        .unwrap();
        assert!(matches!(err, RunnerError::Metadata(_)));
    }

    #[tokio::test]
    async fn pg_incremental_lists_wal_since_parent_stop_file() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "000000010000000000000002",
            "000000010000000000000003",
            "000000010000000000000004",
            "000000010000000000000003.00000028.backup",
        ] {
            std::fs::write(dir.path().join(name), b"wal").unwrap();
        }
        std::fs::create_dir(dir.path().join("000000010000000000000005")).unwrap();

        let wal = wal_files_since(dir.path(), "000000010000000000000003")
            .await
            .unwrap();
        assert_eq!(
            wal,
            vec!["000000010000000000000003", "000000010000000000000004"]
        );
    }

    #[tokio::test]
    async fn pg_incremental_reads_the_archive_when_opened() {
        let archive = tempfile::tempdir().unwrap();
        let options = RunnerOptions {
            data_dir: archive.path().join("not-yet-created"),
            ..Default::default()
        };
        let mut runner = ProcessRunner::incremental(
            BackupStrategy::PgBasebackupIncremental,
            "pginc",
            options,
            parent_with(STOP_WAL_FILE, "000000010000000000000003"),
        )
        .unwrap();
        assert_eq!(runner.program(), "tar");
        let directory = format!(
            "--directory={}",
            archive.path().join("not-yet-created").display()
        );
        assert_eq!(
            runner.args(),
            vec!["--create".to_string(), "--file=-".to_string(), directory]
        );
        assert_eq!(runner.manifest_name(), "pginc.tar");
        assert!(runner.wal_files().is_empty());

        // The archive is missing until the runner opens.
        assert!(matches!(runner.open().await.err().unwrap(), RunnerError::Io(_)));

        std::fs::create_dir(archive.path().join("not-yet-created")).unwrap();
        assert!(matches!(
            runner.open().await.err().unwrap(),
            RunnerError::Metadata(_)
        ));
    }

    #[test]
    fn pg_incremental_needs_parent_stop_wal_file() {
        let err = ProcessRunner::incremental(
            BackupStrategy::PgBasebackupIncremental,
            "pginc",
            RunnerOptions::default(),
            parent_with(LSN, "42"),
        )
        .err()
        .unwrap();
        assert!(matches!(err, RunnerError::Metadata(_)));
    }

    #[tokio::test]
    async fn successful_runner_streams_stdout() {
        let mut runner = ProcessRunner::with_command(
            BackupStrategy::Mysqldump,
            "dump",
            "sh",
            sh("printf 'CREATE TABLE t;'"),
        );
        let mut stream = runner.open().await.unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        drop(stream);
        runner.close().await.unwrap();
        assert_eq!(out, "CREATE TABLE t;");
        assert!(runner.successful());
        assert_eq!(runner.manifest_name(), "dump.sql");
    }

    #[tokio::test]
    async fn non_zero_exit_is_not_successful() {
        let mut runner = ProcessRunner::with_command(
            BackupStrategy::Mysqldump,
            "dump",
            "sh",
            sh("printf partial; echo 'access denied' >&2; exit 2"),
        );
        let mut stream = runner.open().await.unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        let err = runner.close().await.unwrap_err();
        assert!(matches!(err, RunnerError::Exit { ref stderr, .. } if stderr.contains("access denied")));
        assert!(!runner.successful());
    }

    #[tokio::test]
    async fn xtrabackup_requires_completed_ok_and_yields_lsn() {
        let mut runner = ProcessRunner::with_command(
            BackupStrategy::Xtrabackup,
            "full",
            "sh",
            sh("printf data; echo 'Transaction log of lsn (10) to (250) was copied.' >&2; echo 'completed OK!' >&2"),
        );
        let mut stream = runner.open().await.unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        runner.close().await.unwrap();
        assert!(runner.successful());
        assert_eq!(runner.metadata().lsn(), Some("250"));

        let mut runner = ProcessRunner::with_command(
            BackupStrategy::Xtrabackup,
            "full",
            "sh",
            sh("printf data"),
        );
        let mut stream = runner.open().await.unwrap();
        stream.read_to_end(&mut out).await.unwrap();
        assert!(matches!(
            runner.close().await.unwrap_err(),
            RunnerError::Incomplete(_)
        ));
        assert!(!runner.successful());
    }

    #[tokio::test]
    async fn close_without_open_is_an_error() {
        let mut runner =
            ProcessRunner::with_command(BackupStrategy::Mysqldump, "x", "sh", sh("true"));
        assert!(matches!(runner.close().await, Err(RunnerError::NotOpen)));
        runner.abort().await;
        assert!(!runner.successful());
    }
}
