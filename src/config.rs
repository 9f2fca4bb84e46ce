use crate::services::{
    backup_service::{DEFAULT_CHUNK_SIZE, DEFAULT_SEGMENT_MAX_SIZE},
    runner::{BackupStrategy, RunnerOptions},
    sink::{RestoreStrategy, SinkOptions},
};
use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand, ValueEnum};
use std::{env, fmt::Display, path::PathBuf, str::FromStr};

const ENV_PREFIX: &str = "GUEST_BACKUP_";

/// Which object store the pipelines talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreKind {
    /// SQLite + local disk, no server needed.
    Local,
    /// A Swift endpoint (or `guest-backup serve`) over HTTP.
    Swift,
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub auth_token: Option<String>,
    pub storage_dir: String,
    pub database_url: String,

    pub store: StoreKind,
    pub swift_url: Option<String>,
    pub swift_token: Option<String>,

    pub backup_chunk_size: usize,
    pub backup_segment_max_size: u64,
    pub backup_swift_container: String,
    pub verify_swift_checksum_on_restore: bool,

    pub strategy: BackupStrategy,
    pub restore_strategy: RestoreStrategy,
    pub db_user: String,
    pub db_password: Option<String>,
    pub parallelism: u32,
    pub data_dir: PathBuf,
    pub metadata_file: Option<PathBuf>,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Streams database backups into segmented objects and back")]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Host to bind to (overrides GUEST_BACKUP_HOST)
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Port to bind to (overrides GUEST_BACKUP_PORT)
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Token required in X-Auth-Token by `serve` (overrides GUEST_BACKUP_AUTH_TOKEN)
    #[arg(long, global = true)]
    pub auth_token: Option<String>,

    /// Directory where object payloads are stored (overrides GUEST_BACKUP_STORAGE_DIR)
    #[arg(long, global = true)]
    pub storage_dir: Option<String>,

    /// Database URL of the object catalog (overrides GUEST_BACKUP_DATABASE_URL)
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    /// Object store used by backup and restore (overrides GUEST_BACKUP_STORE)
    #[arg(long, global = true, value_enum)]
    pub store: Option<StoreKind>,

    /// Swift account URL (overrides GUEST_BACKUP_SWIFT_URL)
    #[arg(long, global = true)]
    pub swift_url: Option<String>,

    /// Swift auth token (overrides GUEST_BACKUP_SWIFT_TOKEN)
    #[arg(long, global = true)]
    pub swift_token: Option<String>,

    /// Bytes read from the backup stream at a time (overrides GUEST_BACKUP_CHUNK_SIZE)
    #[arg(long, global = true)]
    pub chunk_size: Option<usize>,

    /// Segment size cap in bytes (overrides GUEST_BACKUP_SEGMENT_MAX_SIZE)
    #[arg(long, global = true)]
    pub segment_max_size: Option<u64>,

    /// Container backups are stored in (overrides GUEST_BACKUP_SWIFT_CONTAINER)
    #[arg(long, global = true)]
    pub container: Option<String>,

    /// Compare the manifest ETag before restoring (overrides GUEST_BACKUP_VERIFY_ON_RESTORE)
    #[arg(long, global = true)]
    pub verify_on_restore: Option<bool>,

    /// Backup tool (overrides GUEST_BACKUP_STRATEGY)
    #[arg(long, global = true, value_enum)]
    pub strategy: Option<BackupStrategy>,

    /// Restore tool (overrides GUEST_BACKUP_RESTORE_STRATEGY)
    #[arg(long, global = true, value_enum)]
    pub restore_strategy: Option<RestoreStrategy>,

    /// Database user (overrides GUEST_BACKUP_DB_USER)
    #[arg(long, global = true)]
    pub db_user: Option<String>,

    /// Database password (overrides GUEST_BACKUP_DB_PASSWORD)
    #[arg(long, global = true)]
    pub db_password: Option<String>,

    /// Tool parallelism (overrides GUEST_BACKUP_PARALLELISM)
    #[arg(long, global = true)]
    pub parallelism: Option<u32>,

    /// Data directory, or the WAL archive for Postgres incrementals (overrides GUEST_BACKUP_DATA_DIR)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Backup label file written by the tool (overrides GUEST_BACKUP_METADATA_FILE)
    #[arg(long, global = true)]
    pub metadata_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Serve the local Swift-compatible object store (default)
    Serve,
    /// Create the object catalog schema and exit
    Migrate,
    /// Run a backup tool and store its output
    Backup {
        /// Backup id; a random UUID when omitted
        #[arg(long)]
        backup_id: Option<String>,
        /// Location of the parent backup, for incremental strategies
        #[arg(long, requires = "parent_checksum")]
        parent_location: Option<String>,
        /// Checksum recorded for the parent backup
        #[arg(long, requires = "parent_location")]
        parent_checksum: Option<String>,
    },
    /// Restore a backup, replaying its parent chain first
    Restore {
        /// Manifest location returned by `backup`
        location: String,
        /// Checksum returned by `backup`
        #[arg(long)]
        checksum: Option<String>,
    },
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and the command.
    pub fn from_env_and_args() -> Result<(Self, Command)> {
        let args = Args::parse();
        Self::from_args(args)
    }

    /// Merge parsed arguments over the environment over defaults.
    pub fn from_args(args: Args) -> Result<(Self, Command)> {
        let cfg = Self {
            host: pick(args.host, "HOST", || "127.0.0.1".into())?,
            port: pick(args.port, "PORT", || 8080)?,
            auth_token: pick_opt(args.auth_token, "AUTH_TOKEN")?,
            storage_dir: pick(args.storage_dir, "STORAGE_DIR", || "./data/objects".into())?,
            database_url: pick(args.database_url, "DATABASE_URL", || {
                "sqlite://./data/meta/backups.db".into()
            })?,
            store: match args.store {
                Some(store) => store,
                None => env_value_enum("STORE")?.unwrap_or(StoreKind::Local),
            },
            swift_url: pick_opt(args.swift_url, "SWIFT_URL")?,
            swift_token: pick_opt(args.swift_token, "SWIFT_TOKEN")?,
            backup_chunk_size: pick(args.chunk_size, "CHUNK_SIZE", || DEFAULT_CHUNK_SIZE)?,
            backup_segment_max_size: pick(args.segment_max_size, "SEGMENT_MAX_SIZE", || {
                DEFAULT_SEGMENT_MAX_SIZE
            })?,
            backup_swift_container: pick(args.container, "SWIFT_CONTAINER", || {
                "database_backups".into()
            })?,
            verify_swift_checksum_on_restore: match args.verify_on_restore {
                Some(verify) => verify,
                None => env_flag("VERIFY_ON_RESTORE")?.unwrap_or(true),
            },
            strategy: match args.strategy {
                Some(strategy) => strategy,
                None => env_value_enum("STRATEGY")?.unwrap_or(BackupStrategy::Mysqldump),
            },
            restore_strategy: match args.restore_strategy {
                Some(strategy) => strategy,
                None => env_value_enum("RESTORE_STRATEGY")?.unwrap_or(RestoreStrategy::Mysql),
            },
            db_user: pick(args.db_user, "DB_USER", || "os_admin".into())?,
            db_password: pick_opt(args.db_password, "DB_PASSWORD")?,
            parallelism: pick(args.parallelism, "PARALLELISM", || 1)?,
            data_dir: pick(args.data_dir, "DATA_DIR", || {
                PathBuf::from("/var/lib/mysql/data")
            })?,
            metadata_file: pick_opt(args.metadata_file, "METADATA_FILE")?,
        };

        if cfg.backup_chunk_size == 0 {
            return Err(anyhow!("chunk size must be positive"));
        }
        if cfg.backup_chunk_size as u64 > cfg.backup_segment_max_size {
            return Err(anyhow!(
                "chunk size {} exceeds segment max size {}",
                cfg.backup_chunk_size,
                cfg.backup_segment_max_size
            ));
        }

        Ok((cfg, args.command.unwrap_or(Command::Serve)))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn runner_options(&self) -> RunnerOptions {
        RunnerOptions {
            db_user: self.db_user.clone(),
            db_password: self.db_password.clone(),
            parallelism: self.parallelism,
            data_dir: self.data_dir.clone(),
            metadata_file: self.metadata_file.clone(),
        }
    }

    pub fn sink_options(&self) -> SinkOptions {
        SinkOptions {
            db_user: self.db_user.clone(),
            db_password: self.db_password.clone(),
            parallelism: self.parallelism,
            data_dir: self.data_dir.clone(),
        }
    }
}

fn env_name(key: &str) -> String {
    format!("{ENV_PREFIX}{key}")
}

/// Raw value of `GUEST_BACKUP_<key>`, `None` when unset.
fn env_raw(key: &str) -> Result<Option<String>> {
    let name = env_name(key);
    match env::var(&name) {
        Ok(value) => Ok(Some(value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    env_raw(key)?
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .map_err(|err| anyhow!("parsing {} value `{}`: {}", env_name(key), value, err))
        })
        .transpose()
}

fn pick<T>(cli: Option<T>, key: &str, default: impl FnOnce() -> T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match cli {
        Some(value) => Ok(value),
        None => Ok(env_parse(key)?.unwrap_or_else(default)),
    }
}

fn pick_opt<T>(cli: Option<T>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    match cli {
        Some(value) => Ok(Some(value)),
        None => env_parse(key),
    }
}

fn env_value_enum<T: ValueEnum>(key: &str) -> Result<Option<T>> {
    env_raw(key)?
        .map(|value| {
            T::from_str(value.trim(), true)
                .map_err(|err| anyhow!("parsing {} value `{}`: {}", env_name(key), value, err))
        })
        .transpose()
}

/// Accepts `true/false`, `1/0`, `yes/no`, `on/off`.
fn env_flag(key: &str) -> Result<Option<bool>> {
    env_raw(key)?
        .map(|value| parse_flag(&value).ok_or_else(|| {
            anyhow!("parsing {} value `{}`: expected a boolean", env_name(key), value)
        }))
        .transpose()
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_values_and_defaults() {
        let args = Args::parse_from([
            "guest-backup",
            "--chunk-size",
            "4096",
            "--segment-max-size",
            "16384",
            "--strategy",
            "xtrabackup-incremental",
            "restore",
            "http://swift/v1/a/c/1.xbstream",
            "--checksum",
            "abc",
        ]);
        let (cfg, command) = AppConfig::from_args(args).unwrap();
        assert_eq!(cfg.backup_chunk_size, 4096);
        assert_eq!(cfg.backup_segment_max_size, 16384);
        assert_eq!(cfg.strategy, BackupStrategy::XtrabackupIncremental);
        assert_eq!(
            command,
            Command::Restore {
                location: "http://swift/v1/a/c/1.xbstream".into(),
                checksum: Some("abc".into()),
            }
        );
    }

    #[test]
    fn chunk_larger_than_segment_is_rejected() {
        let args = Args::parse_from([
            "guest-backup",
            "--chunk-size",
            "2048",
            "--segment-max-size",
            "1024",
            "migrate",
        ]);
        assert!(AppConfig::from_args(args).is_err());
    }

    #[test]
    fn parent_location_requires_checksum() {
        let parsed = Args::try_parse_from([
            "guest-backup",
            "backup",
            "--parent-location",
            "http://swift/v1/a/c/1.xbstream",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn flags_accept_common_spellings() {
        assert_eq!(parse_flag("TRUE"), Some(true));
        assert_eq!(parse_flag(" 0 "), Some(false));
        assert_eq!(parse_flag("off"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }
}
