//! 周期性后台任务：固定间隔触发，上一轮未结束时跳过本轮。

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::expiration::ExpirationError;
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Expiration(#[from] ExpirationError),
}

#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self) -> Result<(), JobError>;
}

/// 保证同一任务同时最多只有一轮在执行。
pub struct SkipIfStillRunning {
    job: Arc<dyn Job>,
    running: Arc<AtomicBool>,
}

struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SkipIfStillRunning {
    pub fn new(job: Arc<dyn Job>) -> Self {
        Self {
            job,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// 启动一轮执行；上一轮仍在进行时返回 None。
    pub fn trigger(&self) -> Option<JoinHandle<()>> {
        if self.running.swap(true, Ordering::AcqRel) {
            debug!(job = self.job.name(), "previous run still active, skipping tick");
            return None;
        }
        let guard = RunningGuard(self.running.clone());
        let job = self.job.clone();
        Some(tokio::spawn(async move {
            let _guard = guard;
            if let Err(err) = job.run().await {
                warn!(job = job.name(), error = %err, "background job failed");
            }
        }))
    }
}

/// 按固定间隔触发任务，第一次触发在一个间隔之后。
pub fn spawn_periodic(job: Arc<dyn Job>, every: Duration) -> JoinHandle<()> {
    let name = job.name();
    let runner = SkipIfStillRunning::new(job);
    info!(job = name, interval = ?every, "periodic job scheduled");
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + every, every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            runner.trigger();
        }
    })
}
