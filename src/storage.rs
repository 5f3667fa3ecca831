//! 以根目录为沙箱的文件存储：路径校验、存在性检查、限长写入与匹配列举。

use axum::body::Bytes;
use futures_util::{Stream, StreamExt};
use regex::Regex;
use std::fs::Metadata;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, ErrorKind};
use tracing::debug;

use crate::atomic::{AtomicFile, is_temp_name};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("file not found")]
    NotFound,
    #[error("file path is invalid")]
    PathInvalid,
    #[error("path is a directory")]
    IsDirectory,
    #[error("file size limit of {limit} bytes exceeded")]
    SizeLimitExceeded { limit: u64 },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// 已打开的文件及其元数据。
pub struct OpenedFile {
    pub file: File,
    pub size: u64,
    pub modified: Option<SystemTime>,
    pub metadata: Metadata,
}

#[derive(Clone, Debug)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// 规范化相对路径：去掉前导分隔符与 `.`，拒绝空路径及 `..`/根/前缀组件。
    pub fn normalize(relative: &str) -> Result<String, StorageError> {
        let mut segments = Vec::new();
        let trimmed = relative.trim_start_matches(['/', '\\']);
        for component in Path::new(trimmed).components() {
            match component {
                Component::Normal(segment) => segments.push(
                    segment
                        .to_str()
                        .ok_or(StorageError::PathInvalid)?
                        .to_string(),
                ),
                Component::CurDir => continue,
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(StorageError::PathInvalid);
                }
            }
        }
        if segments.is_empty() {
            return Err(StorageError::PathInvalid);
        }
        Ok(segments.join("/"))
    }

    pub async fn resolve_path_checked(
        &self,
        relative: &str,
        allow_missing_leaf: bool,
    ) -> Result<PathBuf, StorageError> {
        let normalized = Self::normalize(relative)?;
        let target = self.root.join(normalized);
        self.ensure_no_symlink_components(&target, allow_missing_leaf)
            .await?;
        Ok(target)
    }

    async fn ensure_no_symlink_components(
        &self,
        target: &Path,
        allow_missing_leaf: bool,
    ) -> Result<(), StorageError> {
        let relative = target
            .strip_prefix(&self.root)
            .map_err(|_| StorageError::PathInvalid)?;
        let mut current = PathBuf::from(&self.root);
        let mut components = relative.components().peekable();

        while let Some(component) = components.next() {
            current.push(component.as_os_str());
            match fs::symlink_metadata(&current).await {
                Ok(metadata) => {
                    if metadata.file_type().is_symlink() {
                        return Err(StorageError::PathInvalid);
                    }
                    if components.peek().is_some() && !metadata.is_dir() {
                        return Err(StorageError::PathInvalid);
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    if allow_missing_leaf {
                        return Ok(());
                    }
                    return Err(StorageError::NotFound);
                }
                Err(err) => return Err(StorageError::Io(err)),
            }
        }

        Ok(())
    }

    pub async fn exists(&self, relative: &str) -> Result<bool, StorageError> {
        let target = self.resolve_path_checked(relative, true).await?;
        match fs::symlink_metadata(&target).await {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    /// 打开文件用于读取；目录一律拒绝。
    pub async fn open(&self, relative: &str) -> Result<OpenedFile, StorageError> {
        let target = self.resolve_path_checked(relative, false).await?;
        let metadata = fs::metadata(&target).await?;
        if metadata.is_dir() {
            return Err(StorageError::IsDirectory);
        }
        let file = File::open(&target).await?;
        Ok(OpenedFile {
            file,
            size: metadata.len(),
            modified: metadata.modified().ok(),
            metadata,
        })
    }

    /// 将数据流写入目标文件，超过 `max_bytes`（0 表示不限制）时中止。
    ///
    /// 数据先写入同目录临时文件，成功后替换目标；失败时目标保持原样。
    pub async fn write<S, E>(
        &self,
        relative: &str,
        stream: S,
        max_bytes: u64,
    ) -> Result<u64, StorageError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let target = self.resolve_path_checked(relative, true).await?;
        if let Ok(metadata) = fs::metadata(&target).await
            && metadata.is_dir()
        {
            return Err(StorageError::IsDirectory);
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut atomic = AtomicFile::new(&target).await?;
        let write_result: Result<u64, StorageError> = async {
            let mut stream = std::pin::pin!(stream);
            let mut total_written: u64 = 0;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|err| StorageError::Io(io::Error::other(err)))?;
                if chunk.is_empty() {
                    continue;
                }
                total_written += chunk.len() as u64;
                if max_bytes > 0 && total_written > max_bytes {
                    return Err(StorageError::SizeLimitExceeded { limit: max_bytes });
                }
                atomic.file_mut().write_all(&chunk).await?;
            }
            Ok(total_written)
        }
        .await;

        match write_result {
            Ok(total_written) => {
                atomic.finalize().await?;
                debug!(path = relative, bytes = total_written, "file written");
                Ok(total_written)
            }
            Err(err) => {
                atomic.cleanup().await;
                Err(err)
            }
        }
    }

    pub async fn remove(&self, relative: &str) -> Result<(), StorageError> {
        let target = self.resolve_path_checked(relative, false).await?;
        let metadata = fs::symlink_metadata(&target).await?;
        if metadata.is_dir() {
            return Err(StorageError::IsDirectory);
        }
        match fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(StorageError::NotFound),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    /// 遍历整个根目录，返回文件名匹配任一模式的文件相对路径（升序）。
    ///
    /// 不跟随符号链接，跳过写入中的临时文件；任何遍历错误都会使整个列举失败。
    pub async fn list_matching(&self, patterns: &[Regex]) -> Result<Vec<String>, StorageError> {
        let mut matches = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(entry.path());
                    continue;
                }
                if !file_type.is_file() {
                    continue;
                }
                let name = entry.file_name();
                let name = name.to_string_lossy();
                // 写入中的临时文件不属于存储内容
                if is_temp_name(&name) {
                    continue;
                }
                if patterns.iter().any(|pattern| pattern.is_match(&name)) {
                    matches.push(self.relative_path(&entry.path())?);
                }
            }
        }

        matches.sort();
        Ok(matches)
    }

    fn relative_path(&self, path: &Path) -> Result<String, StorageError> {
        Ok(path
            .strip_prefix(&self.root)
            .map_err(|_| StorageError::PathInvalid)?
            .to_string_lossy()
            .replace(std::path::MAIN_SEPARATOR, "/"))
    }
}
