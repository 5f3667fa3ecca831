//! Bearer 令牌鉴权：只读/读写两组令牌，按请求方法判定放行。

use axum::body::Body as AxumBody;
use axum::extract::Extension;
use axum::http::uri::PathAndQuery;
use axum::http::{Method, Request, Uri, header};
use axum::{middleware, response::Response};
use axum_extra::headers::authorization::Bearer;
use axum_extra::headers::{Authorization, HeaderMapExt};
use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::ApiError;

pub const TOKEN_QUERY_KEY: &str = "token";

/// 启动时加载的令牌集合，进程生命周期内不可变。
#[derive(Debug, Default, Clone)]
pub struct TokenSet {
    read_only: HashSet<String>,
    read_write: HashSet<String>,
}

impl TokenSet {
    pub fn new<I, J>(read_only: I, read_write: J) -> Self
    where
        I: IntoIterator<Item = String>,
        J: IntoIterator<Item = String>,
    {
        let clean = |token: String| {
            let token = token.trim().to_string();
            (!token.is_empty()).then_some(token)
        };
        Self {
            read_only: read_only.into_iter().filter_map(clean).collect(),
            read_write: read_write.into_iter().filter_map(clean).collect(),
        }
    }

    /// 两组令牌都为空时鉴权关闭。
    pub fn is_disabled(&self) -> bool {
        self.read_only.is_empty() && self.read_write.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    TokenRequired,
    TokenInvalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Allow,
    Deny(DenyReason),
}

impl From<DenyReason> for ApiError {
    fn from(reason: DenyReason) -> Self {
        match reason {
            DenyReason::TokenRequired => ApiError::TokenRequired,
            DenyReason::TokenInvalid => ApiError::TokenInvalid,
        }
    }
}

/// 只读令牌允许的方法。
pub fn is_safe_method(method: &Method) -> bool {
    method == Method::GET
        || method == Method::HEAD
        || method == Method::OPTIONS
        || method.as_str() == "PROPFIND"
}

pub fn authorize(presented: Option<&str>, method: &Method, tokens: &TokenSet) -> AuthDecision {
    if tokens.is_disabled() {
        return AuthDecision::Allow;
    }
    let Some(token) = presented.filter(|token| !token.is_empty()) else {
        return AuthDecision::Deny(DenyReason::TokenRequired);
    };
    if tokens.read_write.contains(token) {
        return AuthDecision::Allow;
    }
    if tokens.read_only.contains(token) {
        if is_safe_method(method) {
            return AuthDecision::Allow;
        }
        return AuthDecision::Deny(DenyReason::TokenInvalid);
    }
    AuthDecision::Deny(DenyReason::TokenInvalid)
}

/// 鉴权中间件：优先读取 `Authorization: Bearer`，否则读取 `token` 查询参数。
///
/// 放行后移除凭据，下游处理器看不到令牌。
pub async fn token_auth_middleware(
    Extension(tokens): Extension<Arc<TokenSet>>,
    mut req: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, ApiError> {
    if req.method() == Method::OPTIONS || tokens.is_disabled() {
        return Ok(next.run(req).await);
    }

    let header_token = req
        .headers()
        .typed_get::<Authorization<Bearer>>()
        .map(|auth| auth.token().to_string());
    let (query_token, remaining_query) = split_token_query(req.uri().query());
    let presented = header_token.or(query_token);

    match authorize(presented.as_deref(), req.method(), &tokens) {
        AuthDecision::Allow => {
            req.headers_mut().remove(header::AUTHORIZATION);
            if let Some(remaining) = remaining_query {
                let uri = replace_query(req.uri(), remaining)?;
                *req.uri_mut() = uri;
            }
            Ok(next.run(req).await)
        }
        AuthDecision::Deny(reason) => {
            if reason == DenyReason::TokenInvalid {
                warn!(method = %req.method(), path = req.uri().path(), "rejected invalid token");
            } else {
                debug!(method = %req.method(), path = req.uri().path(), "token missing");
            }
            Err(reason.into())
        }
    }
}

/// 取出查询串中的令牌；若存在令牌，同时返回去掉令牌后的查询串。
fn split_token_query(query: Option<&str>) -> (Option<String>, Option<String>) {
    let Some(query) = query else {
        return (None, None);
    };
    let Ok(pairs) = serde_urlencoded::from_str::<Vec<(String, String)>>(query) else {
        return (None, None);
    };
    let mut token = None;
    let mut rest = Vec::with_capacity(pairs.len());
    for (key, value) in pairs {
        if key == TOKEN_QUERY_KEY {
            token.get_or_insert(value);
        } else {
            rest.push((key, value));
        }
    }
    if token.is_none() {
        return (None, None);
    }
    let remaining = serde_urlencoded::to_string(&rest).unwrap_or_default();
    (token, Some(remaining))
}

fn replace_query(uri: &Uri, query: String) -> Result<Uri, ApiError> {
    let path_and_query = if query.is_empty() {
        uri.path().to_string()
    } else {
        format!("{}?{}", uri.path(), query)
    };
    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(
        PathAndQuery::try_from(path_and_query)
            .map_err(|err| ApiError::Internal(err.to_string()))?,
    );
    Uri::from_parts(parts).map_err(|err| ApiError::Internal(err.to_string()))
}

/// 生成 64 位十六进制随机令牌。
pub fn generate_token() -> String {
    let bytes: [u8; 32] = rand::random();
    bytes.iter().fold(String::with_capacity(64), |mut out, byte| {
        let _ = write!(out, "{byte:02x}");
        out
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::any;
    use tower::ServiceExt;

    fn tokens() -> TokenSet {
        TokenSet::new(vec!["reader".to_string()], vec!["writer".to_string()])
    }

    #[test]
    fn empty_sets_allow_everything() {
        let open = TokenSet::default();
        for method in [Method::GET, Method::POST, Method::PUT, Method::DELETE] {
            assert_eq!(authorize(None, &method, &open), AuthDecision::Allow);
        }
    }

    #[test]
    fn missing_token_is_required() {
        assert_eq!(
            authorize(None, &Method::GET, &tokens()),
            AuthDecision::Deny(DenyReason::TokenRequired)
        );
    }

    #[test]
    fn read_only_token_limited_to_safe_methods() {
        let set = tokens();
        let propfind = Method::from_bytes(b"PROPFIND").unwrap();
        assert_eq!(authorize(Some("reader"), &Method::GET, &set), AuthDecision::Allow);
        assert_eq!(authorize(Some("reader"), &propfind, &set), AuthDecision::Allow);
        assert_eq!(
            authorize(Some("reader"), &Method::POST, &set),
            AuthDecision::Deny(DenyReason::TokenInvalid)
        );
        assert_eq!(authorize(Some("writer"), &Method::PUT, &set), AuthDecision::Allow);
    }

    #[test]
    fn unknown_token_is_invalid_for_every_method() {
        let set = tokens();
        for method in [Method::GET, Method::HEAD, Method::POST, Method::PUT] {
            assert_eq!(
                authorize(Some("stranger"), &method, &set),
                AuthDecision::Deny(DenyReason::TokenInvalid)
            );
        }
    }

    #[test]
    fn blank_tokens_are_ignored() {
        let set = TokenSet::new(vec!["  ".to_string()], Vec::new());
        assert!(set.is_disabled());
    }

    #[test]
    fn generated_tokens_are_hex() {
        let token = generate_token();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, generate_token());
    }

    #[test]
    fn split_token_query_keeps_other_params() {
        let (token, rest) = split_token_query(Some("expire=1h&token=abc&x=1"));
        assert_eq!(token.as_deref(), Some("abc"));
        assert_eq!(rest.as_deref(), Some("expire=1h&x=1"));
        assert_eq!(split_token_query(Some("expire=1h")), (None, None));
    }

    fn echo_router() -> Router {
        Router::new()
            .route(
                "/{*path}",
                any(|req: Request<AxumBody>| async move {
                    let has_auth = req.headers().contains_key(header::AUTHORIZATION);
                    format!("{}|{}", req.uri().query().unwrap_or(""), has_auth)
                }),
            )
            .layer(middleware::from_fn(token_auth_middleware))
            .layer(Extension(Arc::new(tokens())))
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn middleware_strips_credentials_before_handler() {
        let response = echo_router()
            .oneshot(
                Request::get("/files/a.txt?token=reader&x=1")
                    .body(AxumBody::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "x=1|false");

        let response = echo_router()
            .oneshot(
                Request::get("/files/a.txt")
                    .header(header::AUTHORIZATION, "Bearer writer")
                    .body(AxumBody::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_text(response).await, "|false");
    }

    #[tokio::test]
    async fn middleware_maps_denials_to_statuses() {
        let response = echo_router()
            .oneshot(Request::post("/files/a.txt").body(AxumBody::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = echo_router()
            .oneshot(
                Request::post("/files/a.txt")
                    .header(header::AUTHORIZATION, "Bearer reader")
                    .body(AxumBody::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = echo_router()
            .oneshot(
                Request::options("/files/a.txt")
                    .body(AxumBody::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
