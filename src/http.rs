//! HTTP 辅助工具：CORS、安全头与客户端地址解析。

use axum::body::Body as AxumBody;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode, header};
use axum::{middleware, response::Response};
use std::net::IpAddr;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::warn;

use crate::upload::PATH_OVERWRITE_HEADER;

/// 构建 CORS Layer；未配置来源列表时允许任意来源。
pub fn build_cors_layer(enabled: bool, cors_origins: Option<&str>) -> Option<CorsLayer> {
    if !enabled {
        return None;
    }

    let methods = [
        Method::GET,
        Method::HEAD,
        Method::POST,
        Method::PUT,
        Method::OPTIONS,
    ];
    let headers = [
        header::AUTHORIZATION,
        header::CONTENT_TYPE,
        header::RANGE,
        HeaderName::from_static(PATH_OVERWRITE_HEADER),
    ];
    let base = CorsLayer::new()
        .allow_methods(methods)
        .allow_headers(headers)
        .expose_headers([header::CONTENT_RANGE, header::ETAG]);

    let Some(cors_origins) = cors_origins else {
        return Some(base.allow_origin(Any));
    };
    let origins = cors_origins
        .split(',')
        .map(|origin| origin.trim())
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin, "invalid cors origin");
                None
            }
        })
        .collect::<Vec<_>>();

    if origins.is_empty() {
        return Some(base.allow_origin(Any));
    }

    Some(base.allow_origin(AllowOrigin::list(origins)))
}

/// 从 `x-forwarded-for` 解析客户端 IP。
pub fn extract_forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .and_then(|value| value.parse::<IpAddr>().ok())
}

/// 添加基础安全响应头。
pub async fn add_security_headers(
    request: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, StatusCode> {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarded_ip_takes_first_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        assert_eq!(
            extract_forwarded_ip(&headers),
            Some("203.0.113.7".parse().unwrap())
        );
        headers.insert("x-forwarded-for", HeaderValue::from_static("garbage"));
        assert_eq!(extract_forwarded_ip(&headers), None);
    }

    #[test]
    fn cors_can_be_disabled() {
        assert!(build_cors_layer(false, Some("https://a.example")).is_none());
        assert!(build_cors_layer(true, None).is_some());
        assert!(build_cors_layer(true, Some(" , ")).is_some());
    }
}
