//! AxoShare server binary.
//!
//! Serves a storage directory over a simple file API and WebDAV, accepts
//! anonymous uploads that expire after a chosen time, and runs background
//! cleanup jobs for expired uploads and OS junk files.

mod app;
mod atomic;
mod auth;
mod background;
mod clock;
mod config;
mod db;
mod duration;
mod error;
mod etag;
mod expiration;
mod files;
mod gc;
mod http;
mod logging;
mod storage;
mod upload;
mod webdav;

use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::signal;
use tracing::{error, info};

use crate::app::{AppContext, build_router};
use crate::background::spawn_periodic;
use crate::clock::SystemClock;
use crate::config::{Args, ConfigError, Settings};
use crate::db::DbError;
use crate::expiration::ExpirationError;
use crate::gc::GarbageCollector;
use crate::http::build_cors_layer;
use crate::storage::Storage;
use crate::upload::UploadConfig;

shadow!(build);

#[derive(Debug, Error)]
enum StartupError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Database(#[from] DbError),
    #[error("failed to start expiration: {0}")]
    Expiration(#[from] ExpirationError),
}

/// Starts the AxoShare server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), StartupError> {
    let args = Args::parse();
    logging::init_logging(&args.log_level, args.log_format);

    let settings = Settings::from_args(args)?;
    let storage = Arc::new(Storage::new(settings.storage_dir.clone()));
    storage.ensure_root().await?;
    info!(root = %storage.root_path().display(), "storage ready");

    let pool = db::connect(&settings.database).await?;
    let expiration = expiration::start(
        &settings.expiration,
        pool.clone(),
        storage.clone(),
        Arc::new(SystemClock),
    )
    .await?;
    let gc = spawn_periodic(
        Arc::new(GarbageCollector::new(
            storage.clone(),
            settings.gc_patterns.clone(),
        )),
        settings.gc_interval,
    );

    let router = build_router(AppContext {
        storage: storage.clone(),
        tokens: Arc::new(settings.tokens.clone()),
        upload: Arc::new(UploadConfig {
            max_upload_size: settings.max_upload_size,
            public_prefix: settings.upload_path_prefix.clone(),
        }),
        expiration: expiration.clone(),
        dav_handler: webdav::build_dav_handler(storage.root_path()),
        cors: build_cors_layer(settings.enable_cors, settings.cors_origins.as_deref()),
        timeouts: settings.timeouts,
        web_root: settings.web_root.clone(),
    });

    let handle = Handle::new();
    tokio::spawn(shutdown_signal(handle.clone(), settings.timeouts.shutdown));

    info!("🚀 Starting HTTP server at {}", settings.listen);
    let served = axum_server::bind(settings.listen)
        .handle(handle)
        .serve(router.into_make_service_with_connect_info::<SocketAddr>())
        .await;

    expiration.shutdown().await;
    gc.abort();
    pool.close().await;
    info!("server stopped");

    served.map_err(StartupError::from)
}

async fn shutdown_signal(handle: Handle, grace: Option<std::time::Duration>) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(grace);
}
