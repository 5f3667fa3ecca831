//! ETag 计算与条件请求校验。

use axum::http::{HeaderMap, header};
use httpdate::parse_http_date;
use std::fs::Metadata;
use std::time::{SystemTime, UNIX_EPOCH};

/// 根据文件元数据生成弱 ETag。
pub fn etag_from_metadata(metadata: &Metadata) -> String {
    let size = metadata.len();
    let modified = metadata.modified().ok();
    if let Some(modified) = modified
        && let Ok(duration) = modified.duration_since(UNIX_EPOCH)
    {
        return format!(
            "W/\"{}-{}-{}\"",
            size,
            duration.as_secs(),
            duration.subsec_nanos()
        );
    }
    format!("W/\"{}\"", size)
}

/// 判断条件 GET 是否可以返回 304。
///
/// `If-None-Match` 存在时只看它；否则比较 `If-Modified-Since`（秒级精度）。
pub fn is_not_modified(
    headers: &HeaderMap,
    current_etag: &str,
    modified: Option<SystemTime>,
) -> bool {
    if let Some(value) = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
    {
        return value.trim() == "*" || etag_matches(value, current_etag);
    }

    let Some(since) = headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| parse_http_date(v).ok())
    else {
        return false;
    };
    let Some(modified) = modified else {
        return false;
    };
    truncate_to_secs(modified) <= since
}

/// `If-Range` 是否仍然与当前文件一致（支持 ETag 与日期两种形式）。
///
/// ETag 形式只做强比较，任一方为弱校验器时视为不匹配，返回完整内容。
pub fn if_range_matches(
    headers: &HeaderMap,
    current_etag: &str,
    modified: Option<SystemTime>,
) -> bool {
    let Some(value) = headers
        .get(header::IF_RANGE)
        .and_then(|value| value.to_str().ok())
    else {
        return true;
    };
    let value = value.trim();
    if value.starts_with('"') || value.starts_with("W/") {
        let weak = value.starts_with("W/") || current_etag.starts_with("W/");
        return !weak && value == current_etag;
    }
    match (parse_http_date(value), modified) {
        (Ok(date), Some(ts)) => truncate_to_secs(ts) <= date,
        _ => false,
    }
}

fn etag_matches(header_value: &str, current: &str) -> bool {
    let weak = |tag: &str| tag.trim_start_matches("W/").to_string();
    let current = weak(current);
    header_value
        .split(',')
        .map(|item| item.trim())
        .any(|item| weak(item) == current)
}

fn truncate_to_secs(ts: SystemTime) -> SystemTime {
    match ts.duration_since(UNIX_EPOCH) {
        Ok(duration) => UNIX_EPOCH + std::time::Duration::from_secs(duration.as_secs()),
        Err(_) => ts,
    }
}
