//! 轮询策略：上传记录落库，周期扫描删除过期记录及其文件。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{ExpirationError, ExpirationManager, ExpiringUpload, stop_task};
use crate::background::{Job, JobError};
use crate::clock::{Clock, add_duration};
use crate::storage::{Storage, StorageError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRecord {
    pub id: String,
    pub file_extension: String,
    pub created_at: DateTime<Utc>,
    pub expired_at: DateTime<Utc>,
}

impl UploadRecord {
    pub fn path(&self) -> String {
        format!("{}{}", self.id, self.file_extension)
    }
}

#[derive(sqlx::FromRow)]
struct UploadRow {
    id: String,
    file_extension: String,
    created_at: i64,
    expired_at: i64,
}

impl TryFrom<UploadRow> for UploadRecord {
    type Error = ExpirationError;

    fn try_from(row: UploadRow) -> Result<Self, Self::Error> {
        let timestamp = |millis: i64| {
            DateTime::from_timestamp_millis(millis).ok_or_else(|| ExpirationError::CorruptRecord {
                id: row.id.clone(),
                reason: format!("timestamp {millis} out of range"),
            })
        };
        let created_at = timestamp(row.created_at)?;
        let expired_at = timestamp(row.expired_at)?;
        Ok(Self {
            id: row.id,
            file_extension: row.file_extension,
            created_at,
            expired_at,
        })
    }
}

/// `uploads` 表的读写。
#[derive(Debug, Clone)]
pub struct UploadRepository {
    pool: SqlitePool,
}

impl UploadRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, record: &UploadRecord) -> Result<(), ExpirationError> {
        sqlx::query(
            "INSERT INTO uploads (id, file_extension, created_at, expired_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.file_extension)
        .bind(record.created_at.timestamp_millis())
        .bind(record.expired_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn find_expired(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<UploadRecord>, ExpirationError> {
        let rows: Vec<UploadRow> = sqlx::query_as(
            "SELECT id, file_extension, created_at, expired_at FROM uploads \
             WHERE expired_at < ? ORDER BY expired_at",
        )
        .bind(now.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(UploadRecord::try_from).collect()
    }

    /// 删除记录，返回是否确有记录被删除。
    pub async fn delete(&self, id: &str) -> Result<bool, ExpirationError> {
        let result = sqlx::query("DELETE FROM uploads WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn exists(&self, id: &str) -> Result<bool, ExpirationError> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM uploads WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }
}

pub struct PollingExpiration {
    repository: UploadRepository,
    clock: Arc<dyn Clock>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl PollingExpiration {
    pub fn new(
        repository: UploadRepository,
        clock: Arc<dyn Clock>,
        sweeper: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            repository,
            clock,
            sweeper: Mutex::new(sweeper),
        }
    }
}

#[async_trait]
impl ExpirationManager for PollingExpiration {
    async fn register_expiry(
        &self,
        upload: &ExpiringUpload,
        ttl: Duration,
    ) -> Result<(), ExpirationError> {
        let now = self.clock.now();
        let expired_at = add_duration(now, ttl).ok_or(ExpirationError::OutOfRange)?;
        if expired_at.timestamp_millis() <= now.timestamp_millis() {
            return Err(ExpirationError::OutOfRange);
        }
        let record = UploadRecord {
            id: upload.id.clone(),
            file_extension: upload.extension.clone(),
            created_at: now,
            expired_at,
        };
        self.repository.create(&record).await?;
        debug!(id = record.id, expired_at = %record.expired_at, "upload expiry recorded");
        Ok(())
    }

    async fn id_in_use(&self, id: &str) -> Result<bool, ExpirationError> {
        self.repository.exists(id).await
    }

    async fn shutdown(&self) {
        stop_task(&self.sweeper).await;
        info!("polling expiration stopped");
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub files_removed: usize,
    pub record_failures: usize,
}

/// 过期扫描：先删记录，再尽力删除文件。
pub struct ExpireUploadJob {
    repository: UploadRepository,
    storage: Arc<Storage>,
    clock: Arc<dyn Clock>,
}

impl ExpireUploadJob {
    pub fn new(repository: UploadRepository, storage: Arc<Storage>, clock: Arc<dyn Clock>) -> Self {
        Self {
            repository,
            storage,
            clock,
        }
    }

    pub async fn run_once(&self) -> Result<SweepReport, ExpirationError> {
        let expired = self.repository.find_expired(self.clock.now()).await?;
        let mut report = SweepReport {
            expired: expired.len(),
            ..SweepReport::default()
        };

        for upload in expired {
            let path = upload.path();
            info!(path, "deleting expired upload");
            match self.repository.delete(&upload.id).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(id = upload.id, "expired upload already removed");
                    continue;
                }
                Err(err) => {
                    error!(id = upload.id, error = %err, "failed to delete expired upload");
                    report.record_failures += 1;
                    continue;
                }
            }

            match self.storage.remove(&path).await {
                Ok(()) => report.files_removed += 1,
                Err(StorageError::NotFound) => {
                    debug!(path, "expired file already gone");
                }
                Err(err) => {
                    warn!(path, error = %err, "failed to remove expired file");
                }
            }
        }

        Ok(report)
    }
}

#[async_trait]
impl Job for ExpireUploadJob {
    fn name(&self) -> &'static str {
        "expire-uploads"
    }

    async fn run(&self) -> Result<(), JobError> {
        let report = self.run_once().await?;
        if report.expired > 0 {
            info!(
                expired = report.expired,
                files_removed = report.files_removed,
                record_failures = report.record_failures,
                "expired uploads swept"
            );
        }
        Ok(())
    }
}
