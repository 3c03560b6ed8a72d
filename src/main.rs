use anyhow::{Context, Result};
use axum::Router;
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use stowage::{
    client::Uploader,
    config::{AppConfig, MasterConfig, StorageConfig},
    handlers::transfer_handlers::StorageState,
    routes::routes::{master_routes, storage_routes},
    services::{
        metadata_service::MetadataService,
        observer::{MasterNotifier, NoopObserver, UploadObserver},
        token::TokenIssuer,
        transfer_service::TransferService,
        upload_store::UploadStore,
    },
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = AppConfig::from_env_and_args()?;
    tracing::info!("Starting stowage with config: {:?}", redact(&cfg));

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    match cfg {
        AppConfig::Master(cfg) => {
            let metadata = metadata_service(&cfg);
            serve(&cfg.host, cfg.port, master_routes().with_state(metadata), shutdown).await
        }
        AppConfig::Storage(cfg) => {
            let observer: Arc<dyn UploadObserver> = match &cfg.master_url {
                Some(url) => {
                    tracing::info!("Reporting upload progress to {}", url);
                    let tokens = TokenIssuer::from_optional(cfg.shared_secret.clone());
                    Arc::new(
                        MasterNotifier::new(url, tokens).context("building master client")?,
                    )
                }
                None => {
                    tracing::warn!("No master URL configured; progress reports are disabled");
                    Arc::new(NoopObserver)
                }
            };
            let app = storage_router(&cfg, observer, shutdown.clone())?;
            serve(&cfg.host, cfg.port, app, shutdown).await
        }
        AppConfig::Standalone(cfg) => {
            let metadata = metadata_service(&cfg.master);
            let storage_app =
                storage_router(&cfg.storage, Arc::new(metadata.clone()), shutdown.clone())?;
            let master_app = master_routes().with_state(metadata);

            let (master, storage) = tokio::join!(
                serve(&cfg.master.host, cfg.master.port, master_app, shutdown.clone()),
                serve(&cfg.storage.host, cfg.storage.port, storage_app, shutdown.clone()),
            );
            master.and(storage)
        }
        AppConfig::Upload(cfg) => {
            let uploader = Uploader::new(cfg)?;
            let report = tokio::select! {
                res = uploader.upload() => res?,
                _ = shutdown.cancelled() => anyhow::bail!("upload interrupted"),
            };
            println!(
                "uploaded {} as {} ({} bytes over {} connection(s))",
                report.filename, report.file_id, report.bytes_stored, report.connections
            );
            Ok(())
        }
    }
}

fn metadata_service(cfg: &MasterConfig) -> MetadataService {
    let tokens = TokenIssuer::from_optional(cfg.shared_secret.clone());
    if !tokens.is_signed() {
        tracing::warn!("No shared secret configured; upload tokens and progress reports are not signed");
    }
    MetadataService::new(
        Arc::new(UploadStore::new()),
        tokens,
        cfg.storage_node_address.clone(),
    )
}

fn storage_router(
    cfg: &StorageConfig,
    observer: Arc<dyn UploadObserver>,
    shutdown: CancellationToken,
) -> Result<Router> {
    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)
            .with_context(|| format!("creating storage directory {}", cfg.storage_dir))?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }
    let tokens = TokenIssuer::from_optional(cfg.shared_secret.clone());
    if !tokens.is_signed() {
        tracing::warn!("No shared secret configured; stream tokens are not checked");
    }

    let transfer = TransferService::new(
        cfg.storage_dir.clone(),
        cfg.transfer_settings(),
        tokens,
        observer,
    );
    let state = StorageState {
        transfer,
        shutdown,
        max_message_bytes: cfg.max_message_bytes(),
    };
    Ok(storage_routes().with_state(state))
}

/// Bind and serve until `shutdown` fires.
async fn serve(host: &str, port: u16, app: Router, shutdown: CancellationToken) -> Result<()> {
    let addr = format!("{}:{}", host, port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied && matches!(host, "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err).with_context(|| format!("binding {}", addr)),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for shutdown signal: {}", err);
            return;
        }
        tracing::info!("Shutdown signal received");
        shutdown.cancel();
    });
}

/// Config as logged: secrets masked.
fn redact(cfg: &AppConfig) -> AppConfig {
    let mut cfg = cfg.clone();
    let mask = |secret: &mut Option<String>| {
        if secret.is_some() {
            *secret = Some("***".into());
        }
    };
    match &mut cfg {
        AppConfig::Master(c) => mask(&mut c.shared_secret),
        AppConfig::Storage(c) => mask(&mut c.shared_secret),
        AppConfig::Standalone(c) => {
            mask(&mut c.master.shared_secret);
            mask(&mut c.storage.shared_secret);
        }
        AppConfig::Upload(_) => {}
    }
    cfg
}
