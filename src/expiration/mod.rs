//! 匿名上传的过期生命周期：登记 → 到期 → 删除。
//!
//! 两种策略二选一：
//! - [`polling`]：持久化上传记录，周期扫描删除已过期的记录与文件；
//! - [`workflow`]：每个上传登记一个延迟执行、可重试的删除任务。

pub mod polling;
pub mod scheduler;
pub mod workflow;

use async_trait::async_trait;
use clap::ValueEnum;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::info;

use crate::background::spawn_periodic;
use crate::clock::Clock;
use crate::storage::{Storage, StorageError};

use self::polling::{ExpireUploadJob, PollingExpiration, UploadRepository};
use self::scheduler::SqliteScheduler;
use self::workflow::WorkflowExpiration;

#[derive(Debug, Error)]
pub enum ExpirationError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("expiry is out of range")]
    OutOfRange,
    #[error("scheduler is closed")]
    SchedulerClosed,
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("corrupt record {id}: {reason}")]
    CorruptRecord { id: String, reason: String },
}

/// 一个带过期时间的匿名上传，文件路径为 `id + extension`。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiringUpload {
    pub id: String,
    pub extension: String,
}

impl ExpiringUpload {
    pub fn path(&self) -> String {
        format!("{}{}", self.id, self.extension)
    }
}

#[async_trait]
pub trait ExpirationManager: Send + Sync {
    /// 登记过期义务，返回后即可向客户端确认上传。
    async fn register_expiry(
        &self,
        upload: &ExpiringUpload,
        ttl: Duration,
    ) -> Result<(), ExpirationError>;

    /// 标识是否已被尚未过期的上传占用。
    async fn id_in_use(&self, id: &str) -> Result<bool, ExpirationError>;

    async fn shutdown(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExpirationStrategy {
    Polling,
    Workflow,
}

#[derive(Debug, Clone)]
pub struct ExpirationSettings {
    pub strategy: ExpirationStrategy,
    pub sweep_interval: Duration,
    pub scheduler_queue: String,
    pub scheduler_poll_interval: Duration,
}

/// 按策略启动过期管理器及其后台任务。
pub async fn start(
    settings: &ExpirationSettings,
    pool: SqlitePool,
    storage: Arc<Storage>,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn ExpirationManager>, ExpirationError> {
    match settings.strategy {
        ExpirationStrategy::Polling => {
            let repository = UploadRepository::new(pool);
            let job = Arc::new(ExpireUploadJob::new(
                repository.clone(),
                storage,
                clock.clone(),
            ));
            let sweeper = spawn_periodic(job, settings.sweep_interval);
            info!(interval = ?settings.sweep_interval, "polling expiration started");
            Ok(Arc::new(PollingExpiration::new(
                repository,
                clock,
                Some(sweeper),
            )))
        }
        ExpirationStrategy::Workflow => {
            let scheduler = Arc::new(SqliteScheduler::new(
                pool,
                settings.scheduler_queue.clone(),
                storage,
                clock,
            ));
            scheduler.recover().await?;
            scheduler.start(settings.scheduler_poll_interval).await;
            info!(queue = settings.scheduler_queue, "workflow expiration started");
            Ok(Arc::new(WorkflowExpiration::new(scheduler)))
        }
    }
}

pub(crate) async fn stop_task(handle: &tokio::sync::Mutex<Option<JoinHandle<()>>>) {
    if let Some(handle) = handle.lock().await.take() {
        handle.abort();
    }
}
