//! 基于 SQLite 的延迟任务调度器，任务在进程重启后依然有效。

use async_trait::async_trait;
use futures_util::future::join_all;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::workflow::{DeletionPayload, DelayedScheduler, RetryPolicy};
use super::{ExpirationError, stop_task};
use crate::background::{Job, JobError, spawn_periodic};
use crate::clock::{Clock, add_duration};
use crate::storage::{Storage, StorageError};

const STATUS_PENDING: &str = "pending";
const STATUS_RUNNING: &str = "running";
const STATUS_COMPLETED: &str = "completed";
const STATUS_FAILED: &str = "failed";

/// 已结束（完成或失败）的任务保留时长，超过后清理。
pub const FINISHED_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, sqlx::FromRow)]
struct DueDeletion {
    id: String,
    path: String,
    attempts: i64,
    max_attempts: i64,
    initial_interval_ms: i64,
    backoff_coefficient: f64,
    maximum_interval_ms: i64,
}

impl DueDeletion {
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_interval: Duration::from_millis(self.initial_interval_ms.max(0) as u64),
            backoff_coefficient: self.backoff_coefficient,
            maximum_interval: Duration::from_millis(self.maximum_interval_ms.max(0) as u64),
            maximum_attempts: self.max_attempts.max(0) as u32,
        }
    }
}

#[derive(Clone)]
struct Executor {
    pool: SqlitePool,
    storage: Arc<Storage>,
    clock: Arc<dyn Clock>,
}

impl Executor {
    async fn execute(&self, task: DueDeletion) -> Result<(), ExpirationError> {
        match self.storage.remove(&task.path).await {
            Ok(()) => {
                info!(path = task.path, task_id = task.id, "expired file deleted");
                self.complete(&task.id).await
            }
            Err(StorageError::NotFound) => {
                debug!(path = task.path, task_id = task.id, "expired file already gone");
                self.complete(&task.id).await
            }
            Err(err) => self.fail_attempt(&task, &err.to_string()).await,
        }
    }

    async fn complete(&self, id: &str) -> Result<(), ExpirationError> {
        sqlx::query(
            "UPDATE scheduled_deletions SET status = ?, last_error = NULL, finished_at = ? \
             WHERE id = ?",
        )
        .bind(STATUS_COMPLETED)
        .bind(self.clock.now().timestamp_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail_attempt(&self, task: &DueDeletion, reason: &str) -> Result<(), ExpirationError> {
        let attempts = task.attempts.max(0) as u32;
        let policy = task.retry_policy();
        if attempts >= policy.maximum_attempts {
            error!(
                path = task.path,
                task_id = task.id,
                attempts,
                error = reason,
                "scheduled deletion failed permanently"
            );
            sqlx::query(
                "UPDATE scheduled_deletions SET status = ?, last_error = ?, finished_at = ? \
                 WHERE id = ?",
            )
            .bind(STATUS_FAILED)
            .bind(reason)
            .bind(self.clock.now().timestamp_millis())
            .bind(&task.id)
            .execute(&self.pool)
            .await?;
            return Ok(());
        }

        let backoff = policy.backoff(attempts);
        let run_at =
            add_duration(self.clock.now(), backoff).ok_or(ExpirationError::OutOfRange)?;
        warn!(
            path = task.path,
            task_id = task.id,
            attempts,
            retry_in = ?backoff,
            error = reason,
            "scheduled deletion failed, will retry"
        );
        sqlx::query(
            "UPDATE scheduled_deletions SET status = ?, run_at = ?, last_error = ? WHERE id = ?",
        )
        .bind(STATUS_PENDING)
        .bind(run_at.timestamp_millis())
        .bind(reason)
        .bind(&task.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// 轮询到期任务并在独立的 tokio 任务中执行删除。
pub struct SqliteScheduler {
    queue: String,
    executor: Executor,
    worker: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SqliteScheduler {
    pub fn new(
        pool: SqlitePool,
        queue: String,
        storage: Arc<Storage>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            queue,
            executor: Executor {
                pool,
                storage,
                clock,
            },
            worker: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// 把上次进程退出时仍在执行中的任务放回待执行状态。
    pub async fn recover(&self) -> Result<u64, ExpirationError> {
        let result = sqlx::query(
            "UPDATE scheduled_deletions SET status = ? WHERE queue = ? AND status = ?",
        )
        .bind(STATUS_PENDING)
        .bind(&self.queue)
        .bind(STATUS_RUNNING)
        .execute(&self.executor.pool)
        .await?;
        let recovered = result.rows_affected();
        if recovered > 0 {
            info!(queue = self.queue, recovered, "interrupted deletions requeued");
        }
        Ok(recovered)
    }

    pub async fn start(self: &Arc<Self>, poll_interval: Duration) {
        let handle = spawn_periodic(self.clone(), poll_interval);
        if let Some(previous) = self.worker.lock().await.replace(handle) {
            previous.abort();
        }
    }

    /// 领取所有已到期的任务并发执行，返回本轮执行的任务数。
    pub async fn run_due(&self) -> Result<usize, ExpirationError> {
        let now = self.executor.clock.now().timestamp_millis();
        let due: Vec<DueDeletion> = sqlx::query_as(
            "UPDATE scheduled_deletions SET status = ?, attempts = attempts + 1 \
             WHERE queue = ? AND status = ? AND run_at <= ? \
             RETURNING id, path, attempts, max_attempts, initial_interval_ms, \
             backoff_coefficient, maximum_interval_ms",
        )
        .bind(STATUS_RUNNING)
        .bind(&self.queue)
        .bind(STATUS_PENDING)
        .bind(now)
        .fetch_all(&self.executor.pool)
        .await?;

        let count = due.len();
        let handles = due.into_iter().map(|task| {
            let executor = self.executor.clone();
            tokio::spawn(async move {
                let id = task.id.clone();
                if let Err(err) = executor.execute(task).await {
                    error!(task_id = id, error = %err, "failed to record deletion outcome");
                }
            })
        });
        for result in join_all(handles).await {
            if let Err(err) = result {
                error!(error = %err, "scheduled deletion task panicked");
            }
        }
        Ok(count)
    }

    /// 删除结束时间早于保留窗口的已完成或失败任务。
    pub async fn prune_finished(&self) -> Result<u64, ExpirationError> {
        let cutoff = self
            .executor
            .clock
            .now()
            .checked_sub_signed(
                chrono::Duration::from_std(FINISHED_RETENTION)
                    .map_err(|_| ExpirationError::OutOfRange)?,
            )
            .ok_or(ExpirationError::OutOfRange)?;
        let result = sqlx::query(
            "DELETE FROM scheduled_deletions \
             WHERE queue = ? AND status IN (?, ?) AND finished_at <= ?",
        )
        .bind(&self.queue)
        .bind(STATUS_COMPLETED)
        .bind(STATUS_FAILED)
        .bind(cutoff.timestamp_millis())
        .execute(&self.executor.pool)
        .await?;
        Ok(result.rows_affected())
    }

    #[cfg(test)]
    async fn task_state(&self, id: &str) -> Option<(String, i64)> {
        sqlx::query_as("SELECT status, attempts FROM scheduled_deletions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.executor.pool)
            .await
            .expect("query task state")
    }
}

#[async_trait]
impl DelayedScheduler for SqliteScheduler {
    async fn schedule_delayed(
        &self,
        delay: Duration,
        retry: RetryPolicy,
        payload: DeletionPayload,
    ) -> Result<String, ExpirationError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ExpirationError::SchedulerClosed);
        }
        let now = self.executor.clock.now();
        let run_at = add_duration(now, delay).ok_or(ExpirationError::OutOfRange)?;
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO scheduled_deletions \
             (id, queue, path, status, run_at, attempts, max_attempts, initial_interval_ms, \
              backoff_coefficient, maximum_interval_ms, created_at) \
             VALUES (?, ?, ?, ?, ?, 0, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&self.queue)
        .bind(&payload.path)
        .bind(STATUS_PENDING)
        .bind(run_at.timestamp_millis())
        .bind(i64::from(retry.maximum_attempts))
        .bind(retry.initial_interval.as_millis() as i64)
        .bind(retry.backoff_coefficient)
        .bind(retry.maximum_interval.as_millis() as i64)
        .bind(now.timestamp_millis())
        .execute(&self.executor.pool)
        .await?;
        Ok(id)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        stop_task(&self.worker).await;
    }
}

#[async_trait]
impl Job for SqliteScheduler {
    fn name(&self) -> &'static str {
        "scheduled-deletions"
    }

    async fn run(&self) -> Result<(), JobError> {
        let executed = self.run_due().await?;
        if executed > 0 {
            debug!(queue = self.queue, executed, "scheduled deletions executed");
        }
        match self.prune_finished().await {
            Ok(0) => {}
            Ok(pruned) => info!(queue = self.queue, pruned, "finished deletions pruned"),
            Err(err) => warn!(queue = self.queue, error = %err, "failed to prune finished deletions"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::ManualClock;
    use crate::db::testing::memory_pool;
    use crate::expiration::workflow::{EXPIRY_SAFETY_MARGIN, WorkflowExpiration};
    use crate::expiration::{ExpirationManager, ExpiringUpload};
    use chrono::DateTime;
    use tempfile::tempdir;

    struct Fixture {
        _temp: tempfile::TempDir,
        storage: Arc<Storage>,
        clock: Arc<ManualClock>,
        scheduler: Arc<SqliteScheduler>,
    }

    async fn fixture() -> Fixture {
        let temp = tempdir().expect("tempdir");
        let storage = Arc::new(Storage::new(temp.path().to_path_buf()));
        let clock = Arc::new(ManualClock::new(
            DateTime::from_timestamp(1_750_000_000, 0).expect("timestamp"),
        ));
        let scheduler = Arc::new(SqliteScheduler::new(
            memory_pool().await,
            "default".to_string(),
            storage.clone(),
            clock.clone(),
        ));
        Fixture {
            _temp: temp,
            storage,
            clock,
            scheduler,
        }
    }

    fn payload(path: &str) -> DeletionPayload {
        DeletionPayload {
            path: path.to_string(),
        }
    }

    #[tokio::test]
    async fn upload_survives_until_ttl_plus_margin() {
        let fx = fixture().await;
        let manager = WorkflowExpiration::new(fx.scheduler.clone());
        let upload = ExpiringUpload {
            id: "Xy12Ab34".into(),
            extension: ".txt".into(),
        };
        std::fs::write(fx.storage.root_path().join(upload.path()), b"bye").expect("seed");
        let ttl = Duration::from_secs(3600);
        manager.register_expiry(&upload, ttl).await.expect("register");

        assert_eq!(fx.scheduler.run_due().await.unwrap(), 0);
        fx.clock.advance(ttl);
        assert_eq!(fx.scheduler.run_due().await.unwrap(), 0);
        fx.clock.advance(EXPIRY_SAFETY_MARGIN - Duration::from_secs(1));
        assert_eq!(fx.scheduler.run_due().await.unwrap(), 0);
        assert!(fx.storage.exists(&upload.path()).await.unwrap());

        fx.clock.advance(Duration::from_secs(2));
        assert_eq!(fx.scheduler.run_due().await.unwrap(), 1);
        assert!(!fx.storage.exists(&upload.path()).await.unwrap());
        assert_eq!(fx.scheduler.run_due().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn missing_file_completes_task() {
        let fx = fixture().await;
        let id = fx
            .scheduler
            .schedule_delayed(Duration::from_secs(1), RetryPolicy::default(), payload("nope.bin"))
            .await
            .expect("schedule");
        fx.clock.advance(Duration::from_secs(1));
        assert_eq!(fx.scheduler.run_due().await.unwrap(), 1);
        assert_eq!(
            fx.scheduler.task_state(&id).await,
            Some((STATUS_COMPLETED.to_string(), 1))
        );
    }

    #[tokio::test]
    async fn failing_deletion_retries_with_backoff_then_fails() {
        let fx = fixture().await;
        // 目录无法按文件删除，每次执行都会失败
        std::fs::create_dir_all(fx.storage.root_path().join("stuck")).expect("mkdir");
        let id = fx
            .scheduler
            .schedule_delayed(Duration::from_secs(1), RetryPolicy::default(), payload("stuck"))
            .await
            .expect("schedule");

        fx.clock.advance(Duration::from_secs(1));
        assert_eq!(fx.scheduler.run_due().await.unwrap(), 1);
        assert_eq!(
            fx.scheduler.task_state(&id).await,
            Some((STATUS_PENDING.to_string(), 1))
        );

        fx.clock.advance(Duration::from_millis(999));
        assert_eq!(fx.scheduler.run_due().await.unwrap(), 0);
        fx.clock.advance(Duration::from_millis(1));
        assert_eq!(fx.scheduler.run_due().await.unwrap(), 1);
        assert_eq!(
            fx.scheduler.task_state(&id).await,
            Some((STATUS_PENDING.to_string(), 2))
        );

        fx.clock.advance(Duration::from_secs(2));
        assert_eq!(fx.scheduler.run_due().await.unwrap(), 1);
        assert_eq!(
            fx.scheduler.task_state(&id).await,
            Some((STATUS_FAILED.to_string(), 3))
        );

        fx.clock.advance(Duration::from_secs(60));
        assert_eq!(fx.scheduler.run_due().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn recover_requeues_interrupted_tasks() {
        let fx = fixture().await;
        let id = fx
            .scheduler
            .schedule_delayed(Duration::from_secs(1), RetryPolicy::default(), payload("a.txt"))
            .await
            .expect("schedule");
        sqlx::query("UPDATE scheduled_deletions SET status = ? WHERE id = ?")
            .bind(STATUS_RUNNING)
            .bind(&id)
            .execute(&fx.scheduler.executor.pool)
            .await
            .expect("simulate crash");

        fx.clock.advance(Duration::from_secs(5));
        assert_eq!(fx.scheduler.run_due().await.unwrap(), 0);
        assert_eq!(fx.scheduler.recover().await.unwrap(), 1);
        assert_eq!(fx.scheduler.run_due().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn one_outstanding_deletion_per_path() {
        let fx = fixture().await;
        fx.scheduler
            .schedule_delayed(Duration::from_secs(1), RetryPolicy::default(), payload("dup.txt"))
            .await
            .expect("first");
        let second = fx
            .scheduler
            .schedule_delayed(Duration::from_secs(1), RetryPolicy::default(), payload("dup.txt"))
            .await;
        assert!(matches!(second, Err(ExpirationError::Database(_))));
    }

    #[tokio::test]
    async fn closed_scheduler_rejects_new_work() {
        let fx = fixture().await;
        fx.scheduler.start(Duration::from_secs(1)).await;
        fx.scheduler.close().await;
        let result = fx
            .scheduler
            .schedule_delayed(Duration::from_secs(1), RetryPolicy::default(), payload("x"))
            .await;
        assert!(matches!(result, Err(ExpirationError::SchedulerClosed)));
    }

    #[tokio::test]
    async fn finished_tasks_are_pruned_after_retention() {
        let fx = fixture().await;
        std::fs::write(fx.storage.root_path().join("old.txt"), b"x").expect("seed");
        let done = fx
            .scheduler
            .schedule_delayed(Duration::from_secs(1), RetryPolicy::default(), payload("old.txt"))
            .await
            .expect("schedule");
        let waiting = fx
            .scheduler
            .schedule_delayed(
                FINISHED_RETENTION * 2,
                RetryPolicy::default(),
                payload("later.txt"),
            )
            .await
            .expect("schedule");
        fx.clock.advance(Duration::from_secs(1));
        assert_eq!(fx.scheduler.run_due().await.unwrap(), 1);

        fx.clock.advance(FINISHED_RETENTION - Duration::from_secs(1));
        assert_eq!(fx.scheduler.prune_finished().await.unwrap(), 0);
        assert!(fx.scheduler.task_state(&done).await.is_some());

        fx.clock.advance(Duration::from_secs(1));
        fx.scheduler.run().await.expect("job run");
        assert_eq!(fx.scheduler.task_state(&done).await, None);
        assert_eq!(
            fx.scheduler.task_state(&waiting).await,
            Some((STATUS_PENDING.to_string(), 0))
        );
    }
}
