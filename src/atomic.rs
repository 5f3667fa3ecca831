//! 临时写入与原子替换的辅助方法。

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tracing::warn;
use uuid::Uuid;

const TEMP_MARKER: &str = ".tmp.";

/// 临时文件命名为 `.{目标文件名}.tmp.{uuid}`。
pub fn is_temp_name(name: &str) -> bool {
    if !name.starts_with('.') {
        return false;
    }
    name.rsplit_once(TEMP_MARKER)
        .is_some_and(|(_, suffix)| Uuid::parse_str(suffix).is_ok())
}

/// 持有临时文件路径，未被解除时在 Drop 中删除文件。
struct TempGuard {
    path: PathBuf,
    armed: bool,
}

impl TempGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "failed to remove abandoned temp file");
            }
        }
    }
}

/// 在目标文件同目录写入的临时文件，成功后重命名覆盖目标。
///
/// 写入中途被丢弃（请求超时、连接断开）时临时文件随之删除。
pub struct AtomicFile {
    target: PathBuf,
    temp: TempGuard,
    file: File,
}

impl AtomicFile {
    /// 在目标路径同目录创建临时文件。
    pub async fn new(target: &Path) -> io::Result<Self> {
        let parent = target
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "target has no parent"))?;
        let base = target
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_else(|| "file".into());
        let temp_name = format!(".{base}{TEMP_MARKER}{}", Uuid::new_v4());
        let temp_path = parent.join(temp_name);
        let file = File::create(&temp_path).await?;
        Ok(Self {
            target: target.to_path_buf(),
            temp: TempGuard {
                path: temp_path,
                armed: true,
            },
            file,
        })
    }

    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    /// 放弃写入并删除临时文件。
    pub async fn cleanup(self) {
        let AtomicFile { mut temp, file, .. } = self;
        drop(file);
        if fs::remove_file(&temp.path).await.is_ok() {
            temp.disarm();
        }
    }

    /// 落盘后重命名到目标路径。
    pub async fn finalize(self) -> io::Result<()> {
        let AtomicFile {
            target,
            mut temp,
            file,
        } = self;
        file.sync_all().await?;
        drop(file);

        if let Err(err) = fs::rename(&temp.path, &target).await {
            #[cfg(windows)]
            {
                if fs::remove_file(&target).await.is_ok() {
                    fs::rename(&temp.path, &target).await?;
                    temp.disarm();
                    return Ok(());
                }
            }
            return Err(err);
        }

        temp.disarm();
        Ok(())
    }
}
