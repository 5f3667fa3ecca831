//! 按路径的文件下载与上传处理器。

use axum::body::Body as AxumBody;
use axum::extract::multipart::{Field, MultipartError, MultipartRejection};
use axum::extract::{Extension, Multipart, Path};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use httpdate::fmt_http_date;
use serde::Serialize;
use std::io::SeekFrom;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::error::ApiError;
use crate::etag::{etag_from_metadata, if_range_matches, is_not_modified};
use crate::storage::{Storage, StorageError};
use crate::upload::{FORM_FILE_KEY, UploadConfig};

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub message: String,
    pub path: String,
}

/// 下载文件，支持 Range、If-Range 与条件请求。
///
/// 路径为空、非法或指向目录时统一返回 404。
pub async fn download_file(
    path: Option<Path<String>>,
    request_headers: HeaderMap,
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<Response, ApiError> {
    let path = path.map(|Path(path)| path).unwrap_or_default();
    if path.is_empty() {
        return Err(ApiError::NotFound);
    }
    let opened = storage.open(&path).await.map_err(|err| match err {
        StorageError::PathInvalid | StorageError::IsDirectory | StorageError::NotFound => {
            ApiError::NotFound
        }
        other => other.into(),
    })?;

    let file_size = opened.size;
    let modified = opened.modified;
    let etag = etag_from_metadata(&opened.metadata);
    let mime = mime_guess::from_path(&path).first_or_octet_stream();

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::ETAG,
        HeaderValue::from_str(&etag).map_err(|_| ApiError::Internal("响应头构建失败".into()))?,
    );
    if let Some(modified) = modified {
        response_headers.insert(
            header::LAST_MODIFIED,
            HeaderValue::from_str(&fmt_http_date(modified))
                .map_err(|_| ApiError::Internal("响应头构建失败".into()))?,
        );
    }

    if is_not_modified(&request_headers, &etag, modified) {
        debug!(path, "download not modified");
        return Ok((StatusCode::NOT_MODIFIED, response_headers).into_response());
    }

    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.essence_str())
            .map_err(|_| ApiError::Internal("无效的 MIME 类型".into()))?,
    );
    response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

    let range = if if_range_matches(&request_headers, &etag, modified) {
        parse_range(request_headers.get(header::RANGE), file_size)?
    } else {
        None
    };

    let mut file = opened.file;
    if let Some((start, end)) = range {
        let length = end - start + 1;
        debug!(path, start, end, length, "download range request accepted");
        file.seek(SeekFrom::Start(start))
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;
        let stream = ReaderStream::new(file.take(length));
        response_headers.insert(
            header::CONTENT_RANGE,
            HeaderValue::from_str(&format!("bytes {}-{}/{}", start, end, file_size))
                .map_err(|_| ApiError::Internal("响应头构建失败".into()))?,
        );
        response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
        return Ok((
            StatusCode::PARTIAL_CONTENT,
            response_headers,
            AxumBody::from_stream(stream),
        )
            .into_response());
    }

    response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(file_size));
    info!(path, size = file_size, "download full file");
    let stream = ReaderStream::new(file);
    Ok((
        StatusCode::OK,
        response_headers,
        AxumBody::from_stream(stream),
    )
        .into_response())
}

/// 按路径上传文件：POST 仅创建，PUT 允许覆盖。
///
/// 先检查存在性再写入，两步之间没有锁；并发写同一路径时后写者生效，
/// 原子替换保证不会出现半截内容。
pub async fn upload_file(
    method: Method,
    path: Option<Path<String>>,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(upload): Extension<Arc<UploadConfig>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ApiError> {
    let path = path.map(|Path(path)| path).unwrap_or_default();
    let path = Storage::normalize(&path)?;

    let existed = storage.exists(&path).await?;
    if existed && method != Method::PUT {
        debug!(path, "upload rejected, file exists");
        return Err(ApiError::AlreadyExists);
    }

    let mut multipart = multipart.map_err(|err| ApiError::BadRequest(err.body_text()))?;
    while let Some(field) = multipart.next_field().await.map_err(bad_multipart)? {
        if field.name() != Some(FORM_FILE_KEY) {
            continue;
        }
        let written = write_field(&storage, &path, field, upload.max_upload_size).await?;
        info!(path, bytes = written, overwritten = existed, "file uploaded");
        let message = if existed {
            "file overwritten successfully"
        } else {
            "file created successfully"
        };
        return Ok((
            StatusCode::CREATED,
            JsonResponse(UploadResponse {
                message: message.to_string(),
                path: format!("/files/{path}"),
            }),
        )
            .into_response());
    }

    Err(missing_file_field())
}

/// 将 multipart 字段以流的方式写入存储，受上传大小限制。
pub(crate) async fn write_field(
    storage: &Storage,
    path: &str,
    field: Field<'_>,
    max_bytes: u64,
) -> Result<u64, ApiError> {
    storage
        .write(path, field, max_bytes)
        .await
        .map_err(ApiError::from)
}

pub(crate) fn bad_multipart(err: MultipartError) -> ApiError {
    ApiError::BadRequest(format!("invalid multipart data: {}", err.body_text()))
}

pub(crate) fn missing_file_field() -> ApiError {
    ApiError::BadRequest(format!("multipart field `{FORM_FILE_KEY}` is required"))
}

/// 解析 Range 头，返回可读取的范围。
fn parse_range(
    value: Option<&HeaderValue>,
    file_size: u64,
) -> Result<Option<(u64, u64)>, ApiError> {
    let Some(value) = value else {
        return Ok(None);
    };
    if file_size == 0 {
        return Err(ApiError::RangeNotSatisfiable(file_size));
    }
    let value = value
        .to_str()
        .map_err(|_| ApiError::BadRequest("invalid Range header".into()))?;
    let Some(range) = value.strip_prefix("bytes=") else {
        return Err(ApiError::BadRequest("invalid Range header".into()));
    };
    if range.contains(',') {
        return Err(ApiError::BadRequest("multiple ranges not supported".into()));
    }

    let (start_part, end_part) = range
        .split_once('-')
        .ok_or_else(|| ApiError::BadRequest("invalid Range header".into()))?;

    let (start, end) = if start_part.is_empty() {
        let suffix: u64 = end_part
            .parse()
            .map_err(|_| ApiError::BadRequest("invalid Range header".into()))?;
        if suffix == 0 {
            return Err(ApiError::RangeNotSatisfiable(file_size));
        }
        (file_size.saturating_sub(suffix), file_size - 1)
    } else {
        let start: u64 = start_part
            .parse()
            .map_err(|_| ApiError::BadRequest("invalid Range header".into()))?;
        let end: u64 = if end_part.is_empty() {
            file_size - 1
        } else {
            end_part
                .parse()
                .map_err(|_| ApiError::BadRequest("invalid Range header".into()))?
        };
        (start, end.min(file_size - 1))
    };

    if start > end || start >= file_size {
        return Err(ApiError::RangeNotSatisfiable(file_size));
    }

    Ok(Some((start, end)))
}
