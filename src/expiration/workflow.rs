//! 延迟任务策略：每个上传登记一个延迟执行、按策略重试的删除任务。

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{ExpirationError, ExpirationManager, ExpiringUpload};

/// 在名义过期时间之后额外等待的时长，保证文件不会提前删除。
pub const EXPIRY_SAFETY_MARGIN: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub maximum_interval: Duration,
    pub maximum_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            maximum_interval: Duration::from_secs(15),
            maximum_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// 第 `attempt` 次失败后到下一次尝试的等待时长。
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        if !scaled.is_finite() || scaled >= self.maximum_interval.as_secs_f64() {
            return self.maximum_interval;
        }
        Duration::from_secs_f64(scaled.max(0.0))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionPayload {
    pub path: String,
}

/// 延迟任务调度器：任务在 `delay` 之后执行，失败按重试策略重试。
#[async_trait]
pub trait DelayedScheduler: Send + Sync {
    async fn schedule_delayed(
        &self,
        delay: Duration,
        retry: RetryPolicy,
        payload: DeletionPayload,
    ) -> Result<String, ExpirationError>;

    async fn close(&self);
}

pub struct WorkflowExpiration {
    scheduler: Arc<dyn DelayedScheduler>,
    retry: RetryPolicy,
}

impl WorkflowExpiration {
    pub fn new(scheduler: Arc<dyn DelayedScheduler>) -> Self {
        Self {
            scheduler,
            retry: RetryPolicy::default(),
        }
    }
}

#[async_trait]
impl ExpirationManager for WorkflowExpiration {
    async fn register_expiry(
        &self,
        upload: &ExpiringUpload,
        ttl: Duration,
    ) -> Result<(), ExpirationError> {
        if ttl.is_zero() {
            return Err(ExpirationError::OutOfRange);
        }
        let delay = ttl
            .checked_add(EXPIRY_SAFETY_MARGIN)
            .ok_or(ExpirationError::OutOfRange)?;
        let path = upload.path();
        let task_id = self
            .scheduler
            .schedule_delayed(delay, self.retry, DeletionPayload { path: path.clone() })
            .await?;
        debug!(path, task_id, delay = ?delay, "expiry deletion scheduled");
        Ok(())
    }

    // 标识只以文件路径体现，存储层的存在性检查已覆盖。
    async fn id_in_use(&self, _id: &str) -> Result<bool, ExpirationError> {
        Ok(false)
    }

    async fn shutdown(&self) {
        self.scheduler.close().await;
        info!("workflow expiration stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingScheduler {
        calls: Mutex<Vec<(Duration, RetryPolicy, DeletionPayload)>>,
        closed: Mutex<bool>,
    }

    #[async_trait]
    impl DelayedScheduler for RecordingScheduler {
        async fn schedule_delayed(
            &self,
            delay: Duration,
            retry: RetryPolicy,
            payload: DeletionPayload,
        ) -> Result<String, ExpirationError> {
            self.calls.lock().unwrap().push((delay, retry, payload));
            Ok("task-1".to_string())
        }

        async fn close(&self) {
            *self.closed.lock().unwrap() = true;
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(4), Duration::from_secs(8));
        assert_eq!(policy.backoff(5), Duration::from_secs(15));
        assert_eq!(policy.backoff(100), Duration::from_secs(15));
    }

    #[tokio::test]
    async fn schedules_one_deletion_with_safety_margin() {
        let scheduler = Arc::new(RecordingScheduler::default());
        let manager = WorkflowExpiration::new(scheduler.clone());
        let upload = ExpiringUpload {
            id: "AbCd1234".into(),
            extension: ".png".into(),
        };

        manager
            .register_expiry(&upload, Duration::from_secs(3600))
            .await
            .expect("register");

        let calls = scheduler.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        let (delay, retry, payload) = &calls[0];
        assert_eq!(*delay, Duration::from_secs(3600 + 300));
        assert_eq!(*retry, RetryPolicy::default());
        assert_eq!(payload.path, "AbCd1234.png");
        assert!(!manager.id_in_use("AbCd1234").await.unwrap());

        manager.shutdown().await;
        assert!(*scheduler.closed.lock().unwrap());
    }

    #[tokio::test]
    async fn zero_ttl_is_rejected() {
        let scheduler = Arc::new(RecordingScheduler::default());
        let manager = WorkflowExpiration::new(scheduler.clone());
        let upload = ExpiringUpload {
            id: "zero0000".into(),
            extension: String::new(),
        };
        assert!(matches!(
            manager.register_expiry(&upload, Duration::ZERO).await,
            Err(ExpirationError::OutOfRange)
        ));
        assert!(scheduler.calls.lock().unwrap().is_empty());
    }
}
