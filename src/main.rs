use anyhow::{Context, Result, bail};
use axum::Router;
use guest_backup::{
    config::{AppConfig, Command, StoreKind},
    handlers::ServerState,
    routes,
    services::{
        backup_service::BackupService,
        local_store::LocalObjectStore,
        object_store::ObjectStore,
        restore_service::RestoreService,
        runner::{ParentBackup, ProcessRunner},
        sink::{ProcessSink, RestoreSink},
        swift_client::SwiftClient,
    },
};
use serde::Serialize;
use std::{io::ErrorKind, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    // --- Parse config + command ---
    let (cfg, command) = AppConfig::from_env_and_args()?;
    tracing::debug!("Running {:?} with store {:?}", command, cfg.store);

    match command {
        Command::Serve => serve(&cfg).await,
        Command::Migrate => {
            connect_local(&cfg, local_storage_url(&cfg)).await?;
            tracing::info!("Database migration complete.");
            Ok(())
        }
        Command::Backup {
            backup_id,
            parent_location,
            parent_checksum,
        } => {
            let id = backup_id.unwrap_or_else(|| Uuid::new_v4().to_string());
            let parent = parent_location.zip(parent_checksum);
            backup(&cfg, id, parent).await
        }
        Command::Restore { location, checksum } => restore(&cfg, &location, checksum).await,
    }
}

async fn serve(cfg: &AppConfig) -> Result<()> {
    let storage_url = format!("http://{}/v1/AUTH_local", cfg.addr());
    let store = connect_local(cfg, storage_url).await?;
    if cfg.auth_token.is_none() {
        tracing::warn!("No auth token configured; the object API is open");
    }

    // --- Build router ---
    let state = ServerState::new(store, cfg.auth_token.clone());
    let app: Router = routes::routes::routes().with_state(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Object API listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}

async fn backup(cfg: &AppConfig, id: String, parent: Option<(String, String)>) -> Result<()> {
    let store = build_store(cfg).await?;
    let options = cfg.runner_options();

    let mut runner = match parent {
        Some((location, checksum)) => {
            let restore = RestoreService::new(store.clone(), cfg.verify_swift_checksum_on_restore);
            let metadata = restore
                .load_metadata(&location)
                .await
                .with_context(|| format!("reading parent backup {}", location))?;
            let parent = ParentBackup {
                location,
                checksum,
                metadata,
            };
            ProcessRunner::incremental(cfg.strategy, id, options, parent)?
        }
        None => ProcessRunner::new(cfg.strategy, id, options)?,
    };

    let service = BackupService::new(store, cfg.backup_chunk_size, cfg.backup_segment_max_size);
    let outcome = service
        .save(&cfg.backup_swift_container, &mut runner)
        .await;
    print_json(&outcome)?;
    if !outcome.success {
        bail!("{}", outcome.note);
    }
    Ok(())
}

async fn restore(cfg: &AppConfig, location: &str, checksum: Option<String>) -> Result<()> {
    let store = build_store(cfg).await?;
    let service = RestoreService::new(store, cfg.verify_swift_checksum_on_restore);
    let strategy = cfg.restore_strategy;
    let options = cfg.sink_options();

    let report = service
        .restore(location, checksum.as_deref(), |step| {
            tracing::info!(
                "Restoring {} ({} of chain)",
                step.location,
                step.position + 1
            );
            Box::new(ProcessSink::new(strategy, &options)) as Box<dyn RestoreSink>
        })
        .await?;
    print_json(&report)
}

async fn build_store(cfg: &AppConfig) -> Result<Arc<dyn ObjectStore>> {
    Ok(match cfg.store {
        StoreKind::Local => Arc::new(connect_local(cfg, local_storage_url(cfg)).await?),
        StoreKind::Swift => {
            let url = cfg
                .swift_url
                .clone()
                .context("--swift-url or GUEST_BACKUP_SWIFT_URL is required for the swift store")?;
            Arc::new(SwiftClient::new(url, cfg.swift_token.clone())?)
        }
    })
}

fn local_storage_url(cfg: &AppConfig) -> String {
    format!("file://{}", cfg.storage_dir.trim_end_matches('/'))
}

async fn connect_local(cfg: &AppConfig, storage_url: String) -> Result<LocalObjectStore> {
    tracing::debug!("Connecting to object catalog {}", cfg.database_url);
    let store = LocalObjectStore::connect(&cfg.database_url, &cfg.storage_dir, storage_url)
        .await
        .with_context(|| format!("opening object catalog {}", cfg.database_url))?;
    Ok(store)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
