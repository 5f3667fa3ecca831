//! 匿名上传：随机标识命名、限定有效期，到期后自动删除。

use axum::extract::multipart::MultipartRejection;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Extension, Multipart, Query};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use rand::Rng;
use rand::distr::Alphanumeric;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::duration::parse_duration;
use crate::error::ApiError;
use crate::expiration::{ExpirationManager, ExpiringUpload};
use crate::files::{UploadResponse, bad_multipart, missing_file_field, write_field};
use crate::storage::Storage;

pub const FORM_FILE_KEY: &str = "file";
pub const DEFAULT_EXPIRE: &str = "168h";
pub const MIN_EXPIRE: Duration = Duration::from_secs(60);
pub const MAX_EXPIRE: Duration = Duration::from_secs(30 * 24 * 60 * 60);
pub const UPLOAD_ID_LENGTH: usize = 8;
pub const MAX_EXTENSION_LENGTH: usize = 16;
pub const PATH_OVERWRITE_HEADER: &str = "x-path-overwrite";

#[derive(Debug)]
pub struct UploadConfig {
    /// 单文件大小上限（字节），0 表示不限制。
    pub max_upload_size: u64,
    /// 匿名上传返回路径的默认前缀。
    pub public_prefix: String,
}

#[derive(Deserialize)]
pub(crate) struct AnonymousUploadQuery {
    expire: Option<String>,
}

/// 解析有效期，必须落在 [1 分钟, 30 天] 之间。
pub fn parse_expire(value: &str) -> Result<Duration, ApiError> {
    let ttl = parse_duration(value).map_err(|err| {
        debug!(value, error = %err, "unparseable expire time");
        ApiError::InvalidExpireTime
    })?;
    if !(MIN_EXPIRE..=MAX_EXPIRE).contains(&ttl) {
        return Err(ApiError::InvalidExpireTime);
    }
    Ok(ttl)
}

pub fn generate_upload_id() -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(UPLOAD_ID_LENGTH)
        .map(char::from)
        .collect()
}

/// 取文件名最后一段扩展名（含点号），不合规时返回空串。
pub fn sanitize_extension(file_name: Option<&str>) -> String {
    let Some(name) = file_name else {
        return String::new();
    };
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let Some(dot) = base.rfind('.') else {
        return String::new();
    };
    let ext = &base[dot + 1..];
    if ext.is_empty()
        || ext.len() > MAX_EXTENSION_LENGTH
        || !ext.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return String::new();
    }
    format!(".{ext}")
}

/// 拼接 URL 路径：忽略空段与 `.`、`..`、`/` 等段，合并重复斜杠，去掉首尾多余符号。
pub fn join_url(base: &str, paths: &[&str]) -> String {
    let filtered: Vec<&str> = paths
        .iter()
        .copied()
        .filter(|segment| !matches!(segment.trim(), "" | "." | ".." | "/" | "./" | "../"))
        .collect();
    let joined = clean_path(&filtered.join("/"));
    let combined = format!(
        "{}/{}",
        base.trim_end_matches('/'),
        joined.trim_start_matches('/')
    );
    let combined = combined.strip_prefix('.').unwrap_or(combined.as_str());
    let combined = combined.strip_prefix('/').unwrap_or(combined);
    combined.strip_suffix('/').unwrap_or(combined).to_string()
}

fn clean_path(path: &str) -> String {
    if path.is_empty() {
        return String::new();
    }
    let rooted = path.starts_with('/');
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.last().is_some_and(|last| *last != "..") {
                    segments.pop();
                } else if !rooted {
                    segments.push("..");
                }
            }
            other => segments.push(other),
        }
    }
    let body = segments.join("/");
    match (rooted, body.is_empty()) {
        (true, _) => format!("/{body}"),
        (false, true) => ".".to_string(),
        (false, false) => body,
    }
}

/// 匿名上传处理器。
///
/// 有效期在任何文件 I/O 之前校验；过期登记成功后才返回 201，
/// 登记失败时删除已写入的文件。
pub async fn upload_anonymous(
    query: Result<Query<AnonymousUploadQuery>, QueryRejection>,
    headers: HeaderMap,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(upload): Extension<Arc<UploadConfig>>,
    Extension(expiration): Extension<Arc<dyn ExpirationManager>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ApiError> {
    let Query(query) = query.map_err(|err| ApiError::BadRequest(err.body_text()))?;
    let ttl = parse_expire(query.expire.as_deref().unwrap_or(DEFAULT_EXPIRE))?;

    let mut multipart = multipart.map_err(|err| ApiError::BadRequest(err.body_text()))?;
    while let Some(field) = multipart.next_field().await.map_err(bad_multipart)? {
        if field.name() != Some(FORM_FILE_KEY) {
            continue;
        }

        let item = ExpiringUpload {
            id: generate_upload_id(),
            extension: sanitize_extension(field.file_name()),
        };
        let path = item.path();
        if storage.exists(&path).await? || expiration.id_in_use(&item.id).await? {
            error!(path, "generated upload id collides with an existing upload");
            return Err(ApiError::Internal(format!("upload id {} already in use", item.id)));
        }

        let written = write_field(&storage, &path, field, upload.max_upload_size).await?;

        if let Err(err) = expiration.register_expiry(&item, ttl).await {
            if let Err(cleanup) = storage.remove(&path).await {
                warn!(path, error = %cleanup, "failed to remove upload after expiry registration failure");
            }
            return Err(ApiError::Internal(format!(
                "failed to register expiry for {path}: {err}"
            )));
        }

        let prefix = headers
            .get(PATH_OVERWRITE_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .unwrap_or(upload.public_prefix.as_str());
        let public_path = join_url(prefix, &[path.as_str()]);
        info!(path, public_path, bytes = written, ttl = ?ttl, "anonymous upload stored");
        return Ok((
            StatusCode::CREATED,
            JsonResponse(UploadResponse {
                message: "file created successfully".to_string(),
                path: public_path,
            }),
        )
            .into_response());
    }

    Err(missing_file_field())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expire_bounds_are_inclusive() {
        assert_eq!(parse_expire("1m").unwrap(), MIN_EXPIRE);
        assert_eq!(parse_expire("720h").unwrap(), MAX_EXPIRE);
        assert_eq!(parse_expire("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(
            parse_expire(DEFAULT_EXPIRE).unwrap(),
            Duration::from_secs(7 * 24 * 3600)
        );
    }

    #[test]
    fn expire_out_of_range_or_garbage_is_rejected() {
        for value in ["30s", "59s", "45d", "721h", "", "soon", "-1h", "10"] {
            assert!(
                matches!(parse_expire(value), Err(ApiError::InvalidExpireTime)),
                "{value} should be rejected"
            );
        }
    }

    #[test]
    fn upload_ids_are_alphanumeric() {
        let id = generate_upload_id();
        assert_eq!(id.len(), UPLOAD_ID_LENGTH);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn extension_is_sanitized() {
        assert_eq!(sanitize_extension(Some("photo.JPG")), ".JPG");
        assert_eq!(sanitize_extension(Some("archive.tar.gz")), ".gz");
        assert_eq!(sanitize_extension(Some("dir/notes.md")), ".md");
        assert_eq!(sanitize_extension(Some("README")), "");
        assert_eq!(sanitize_extension(Some("trailing.")), "");
        assert_eq!(sanitize_extension(Some("evil.p/hp")), "");
        assert_eq!(sanitize_extension(Some("x.a-b")), "");
        assert_eq!(sanitize_extension(Some("x.abcdefghijklmnopq")), "");
        assert_eq!(sanitize_extension(None), "");
    }

    #[test]
    fn join_url_cases() {
        let cases: &[(&str, &[&str], &str)] = &[
            ("./files", &["foo", "bar.jpg"], "files/foo/bar.jpg"),
            ("./files", &["./foo/", "./bar.jpg/"], "files/foo/bar.jpg"),
            ("./files/", &["./foo/", "./bar.jpg///"], "files/foo/bar.jpg"),
            ("files", &["foo", "bar", "baz.txt"], "files/foo/bar/baz.txt"),
            ("./files/", &["/foo/", "/bar/", "/baz.txt"], "files/foo/bar/baz.txt"),
            ("files", &["foo"], "files/foo"),
            ("files/", &[], "files"),
            ("./", &["foo", "bar"], "foo/bar"),
            ("", &["foo", "bar"], "foo/bar"),
            ("/", &["foo", "bar"], "foo/bar"),
            ("./files", &[""], "files"),
            ("./files", &["."], "files"),
            ("./files", &[".."], "files"),
            ("./files", &["/"], "files"),
            ("./files", &["./"], "files"),
            ("./files", &["../"], "files"),
            ("./files", &["foo/", "/bar/", "/baz/"], "files/foo/bar/baz"),
            ("./files", &["foo//bar//baz"], "files/foo/bar/baz"),
            ("./files", &["foo", "", "bar.jpg"], "files/foo/bar.jpg"),
            ("./files", &[".", "foo", ".", "bar.jpg"], "files/foo/bar.jpg"),
            ("https://cdn.example.com/s", &["Ab12Cd34.png"], "https://cdn.example.com/s/Ab12Cd34.png"),
        ];
        for (base, paths, expected) in cases {
            assert_eq!(join_url(base, paths), *expected, "join_url({base:?}, {paths:?})");
        }
    }
}
