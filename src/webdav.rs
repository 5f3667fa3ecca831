//! WebDAV 挂载：与文件接口共享同一存储根目录。

use axum::extract::Extension;
use axum::http::Request;
use axum::response::Response;
use dav_server::{DavHandler, body::Body as DavBody, fakels::FakeLs, localfs::LocalFs};
use std::path::Path;
use std::sync::Arc;

pub const WEBDAV_PREFIX: &str = "/webdav";

/// 以存储根目录构建 WebDAV 处理器，目录请求返回自动索引页。
pub fn build_dav_handler(root: &Path) -> Arc<DavHandler> {
    Arc::new(
        DavHandler::builder()
            .strip_prefix(WEBDAV_PREFIX)
            .filesystem(LocalFs::new(root, false, false, false))
            .locksystem(FakeLs::new())
            .autoindex(true)
            .build_handler(),
    )
}

/// 代理 WebDAV 请求到 dav-server 处理器。
pub async fn webdav_handler(
    Extension(dav_handler): Extension<Arc<DavHandler>>,
    req: Request<axum::body::Body>,
) -> Response<DavBody> {
    dav_handler.handle(req).await
}
