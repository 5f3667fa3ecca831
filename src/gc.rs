//! 按文件名模式清理垃圾文件（如 macOS 产生的 `._*`、`.DS_Store`）。

use async_trait::async_trait;
use regex::Regex;
use std::sync::Arc;
use tracing::{info, warn};

use crate::background::{Job, JobError};
use crate::storage::{Storage, StorageError};

pub const DEFAULT_GC_PATTERNS: &[&str] = &[r"^\._.+", r"^\.DS_Store$"];

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GcReport {
    pub matched: usize,
    pub deleted: usize,
    pub failed: usize,
}

pub struct GarbageCollector {
    storage: Arc<Storage>,
    patterns: Vec<Regex>,
}

impl GarbageCollector {
    pub fn new(storage: Arc<Storage>, patterns: Vec<Regex>) -> Self {
        Self { storage, patterns }
    }

    pub async fn run_once(&self) -> Result<GcReport, StorageError> {
        let matches = self.storage.list_matching(&self.patterns).await?;
        Ok(self.remove_all(matches).await)
    }

    /// 逐个删除；单个失败只记录日志，继续处理后续文件。
    async fn remove_all(&self, paths: Vec<String>) -> GcReport {
        let mut report = GcReport {
            matched: paths.len(),
            ..GcReport::default()
        };
        for path in paths {
            match self.storage.remove(&path).await {
                Ok(()) | Err(StorageError::NotFound) => {
                    info!(path, "garbage file deleted");
                    report.deleted += 1;
                }
                Err(err) => {
                    warn!(path, error = %err, "failed to delete garbage file");
                    report.failed += 1;
                }
            }
        }
        report
    }
}

#[async_trait]
impl Job for GarbageCollector {
    fn name(&self) -> &'static str {
        "garbage-collection"
    }

    async fn run(&self) -> Result<(), JobError> {
        self.run_once().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn default_patterns() -> Vec<Regex> {
        DEFAULT_GC_PATTERNS
            .iter()
            .map(|pattern| Regex::new(pattern).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn deletes_matches_and_second_run_is_noop() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        std::fs::create_dir_all(root.join("photos")).unwrap();
        std::fs::write(root.join("a.txt"), b"keep").unwrap();
        std::fs::write(root.join("._a.txt"), b"junk").unwrap();
        std::fs::write(root.join("photos/.DS_Store"), b"junk").unwrap();

        let gc = GarbageCollector::new(
            Arc::new(Storage::new(root.to_path_buf())),
            default_patterns(),
        );
        let report = gc.run_once().await.expect("first run");
        assert_eq!(
            report,
            GcReport {
                matched: 2,
                deleted: 2,
                failed: 0
            }
        );
        assert!(root.join("a.txt").exists());
        assert!(!root.join("._a.txt").exists());
        assert!(!root.join("photos/.DS_Store").exists());

        let second = gc.run_once().await.expect("second run");
        assert_eq!(second, GcReport::default());
    }

    #[tokio::test]
    async fn missing_root_is_an_error() {
        let temp = tempdir().expect("tempdir");
        let gc = GarbageCollector::new(
            Arc::new(Storage::new(temp.path().join("missing"))),
            default_patterns(),
        );
        assert!(gc.run_once().await.is_err());
    }

    #[tokio::test]
    async fn failed_delete_does_not_stop_the_sweep() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        std::fs::write(root.join("._a"), b"junk").unwrap();
        // 列举之后被替换成目录，删除会失败
        std::fs::create_dir_all(root.join("._m")).unwrap();
        std::fs::write(root.join("._z"), b"junk").unwrap();

        let gc = GarbageCollector::new(
            Arc::new(Storage::new(root.to_path_buf())),
            default_patterns(),
        );
        let report = gc
            .remove_all(vec!["._a".into(), "._m".into(), "._z".into()])
            .await;
        assert_eq!(
            report,
            GcReport {
                matched: 3,
                deleted: 2,
                failed: 1
            }
        );
        assert!(!root.join("._a").exists());
        assert!(root.join("._m").is_dir());
        assert!(!root.join("._z").exists());
    }

    #[tokio::test]
    async fn in_flight_upload_survives_collection() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        let target = root.join("_report.pdf");
        let mut atomic = crate::atomic::AtomicFile::new(&target)
            .await
            .expect("atomic file");
        tokio::io::AsyncWriteExt::write_all(atomic.file_mut(), b"pdf bytes")
            .await
            .expect("write temp");

        let gc = GarbageCollector::new(
            Arc::new(Storage::new(root.to_path_buf())),
            default_patterns(),
        );
        let report = gc.run_once().await.expect("gc run");
        assert_eq!(report, GcReport::default());

        atomic.finalize().await.expect("finalize after gc");
        assert_eq!(std::fs::read(&target).unwrap(), b"pdf bytes");
    }
}
