//! 路由表与中间件装配。

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::{Request, StatusCode};
use axum::routing::{any, get, post};
use axum::{Router, middleware};
use dav_server::DavHandler;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::timeout::{RequestBodyTimeoutLayer, TimeoutLayer};
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info_span};

use crate::auth::{self, TokenSet};
use crate::config::HttpTimeouts;
use crate::expiration::ExpirationManager;
use crate::files;
use crate::http::{self, extract_forwarded_ip};
use crate::storage::Storage;
use crate::upload::{self, UploadConfig};
use crate::webdav;

/// 构建路由所需的共享组件。
pub struct AppContext {
    pub storage: Arc<Storage>,
    pub tokens: Arc<TokenSet>,
    pub upload: Arc<UploadConfig>,
    pub expiration: Arc<dyn ExpirationManager>,
    pub dav_handler: Arc<DavHandler>,
    pub cors: Option<CorsLayer>,
    pub timeouts: HttpTimeouts,
    pub web_root: Option<PathBuf>,
}

pub fn build_router(ctx: AppContext) -> Router {
    let file_routes = get(files::download_file)
        .post(files::upload_file)
        .put(files::upload_file)
        .layer(DefaultBodyLimit::disable());

    let mut app = Router::new()
        .route("/files", file_routes.clone())
        .route("/files/", file_routes.clone())
        .route("/files/{*path}", file_routes)
        .route(
            "/upload",
            post(upload::upload_anonymous).layer(DefaultBodyLimit::disable()),
        )
        .route("/webdav", any(webdav::webdav_handler))
        .route("/webdav/{*path}", any(webdav::webdav_handler));

    if let Some(web_root) = ctx.web_root {
        app = app.fallback_service(ServeDir::new(web_root));
    }

    let mut app = app
        .layer(middleware::from_fn(auth::token_auth_middleware))
        .layer(Extension(ctx.storage))
        .layer(Extension(ctx.tokens))
        .layer(Extension(ctx.upload))
        .layer(Extension(ctx.expiration))
        .layer(Extension(ctx.dav_handler));

    if let Some(read) = ctx.timeouts.read {
        app = app.layer(RequestBodyTimeoutLayer::new(read));
    }
    if let Some(write) = ctx.timeouts.write {
        app = app.layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            write,
        ));
    }

    let mut app = app
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let client_ip = extract_forwarded_ip(request.headers())
                        .map(|ip| ip.to_string())
                        .or_else(|| {
                            request
                                .extensions()
                                .get::<ConnectInfo<SocketAddr>>()
                                .map(|ConnectInfo(addr)| addr.ip().to_string())
                        })
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip = %client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        );

    if let Some(cors) = ctx.cors {
        app = app.layer(cors);
    }
    app
}
