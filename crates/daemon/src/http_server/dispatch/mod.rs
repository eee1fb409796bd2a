//! Maps a request path to a file or directory and serves it
//!
//! Directories get a trailing-slash redirect, then their index file, then a
//! listing. Files go through the renderer registry. All bodies leave through
//! [`emit`], which takes care of gzip.

mod buffered;
mod directory;
mod emit;
mod file;
mod resolve;

use std::path::Path;

use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::Response;

use common::prelude::{AutoRefresh, CacheError, DataBlock, FileCache, RenderError};
use common::pretty_error;
use common::render::{extension_of, HTML_UTF8};

pub use buffered::BufferedResponse;
pub use directory::{HIDDEN_ENTRY, INDEX_FILES};
pub use emit::{accepts_gzip, emit};
pub use resolve::{clean_url_path, request_domain, serve_root_for, url_to_path};

use super::pages;
use crate::ServiceState;

/// One request on its way through the dispatcher.
pub(crate) struct Request<'a> {
    pub state: &'a ServiceState,
    pub method: &'a Method,
    pub uri: &'a Uri,
    pub headers: &'a HeaderMap,
    /// Root for this request, after per-host resolution.
    pub root: &'a Path,
}

impl Request<'_> {
    fn threshold(&self) -> usize {
        self.state.config().compression_threshold
    }

    /// Script injection settings for this request, `None` when auto-refresh is off.
    fn auto_refresh(&self) -> Option<AutoRefresh> {
        let config = self.state.config();
        if !config.auto_refresh {
            return None;
        }
        let host_port = if config.event_addr.starts_with(':') {
            let host = config
                .server_host
                .as_deref()
                .or_else(|| request_domain(self.headers))
                .unwrap_or("localhost");
            format!("{}{}", host, config.event_addr)
        } else {
            config.event_addr.clone()
        };
        Some(AutoRefresh::new(
            host_port,
            config.event_path.clone(),
            config.refresh_interval,
        ))
    }

    /// Apply auto-refresh to an HTML body.
    fn inject(&self, html: &[u8]) -> Option<Vec<u8>> {
        self.auto_refresh().map(|refresh| refresh.inject(html))
    }

    fn emit(&self, status: StatusCode, content_type: &str, block: &DataBlock) -> Response {
        emit(self.headers, status, content_type, block, self.threshold())
    }

    /// Emit an HTML page, with auto-refresh applied.
    fn emit_html(&self, status: StatusCode, html: impl Into<Vec<u8>>) -> Response {
        let html = html.into();
        let html = self.inject(&html).unwrap_or(html);
        self.emit(status, HTML_UTF8, &DataBlock::new(html))
    }

    fn not_found(&self) -> Response {
        pages::not_found(self.headers, &self.state.config().theme, self.uri.path())
    }

    /// Read a file through the cache. Files the cache mode excludes are
    /// always read from disk, refreshing whatever the cache held for them.
    async fn read(&self, path: &Path, size: u64) -> Result<DataBlock, CacheError> {
        let Some(cache) = self.state.cache() else {
            return FileCache::read_uncached(path).await;
        };
        let allow_from_cache = self
            .state
            .config()
            .cache_mode
            .should_cache_file(&extension_of(path), size);
        match cache.read(path, allow_from_cache).await {
            Err(CacheError::TooLarge { .. }) => FileCache::read_uncached(path).await,
            other => other,
        }
    }

    /// Answer for a file that could not be read.
    fn read_failure(&self, path: &Path, err: CacheError) -> Response {
        match err {
            CacheError::NotFound(_) => self.not_found(),
            err => {
                tracing::error!(path = %path.display(), error = %err, "failed to read file");
                pages::server_error(&self.state.config().theme)
            }
        }
    }

    /// Answer for a render or script failure.
    ///
    /// Debug mode shows the source with the failing line marked; otherwise the
    /// error is logged and the client gets a plain 500 page.
    fn render_failure(&self, path: &Path, source: &[u8], err: &RenderError) -> Response {
        let config = self.state.config();
        if !config.debug {
            tracing::error!(path = %path.display(), error = %err, "render failed");
            return pages::server_error(&config.theme);
        }
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        match pretty_error::error_page(&filename, source, err, self.state.version()) {
            Ok(page) => self.emit_html(StatusCode::OK, page),
            Err(e) => {
                tracing::error!(error = %e, "failed to render error page");
                pages::server_error(&config.theme)
            }
        }
    }
}

/// Fallback handler for everything that is not a status route.
pub async fn handler(
    State(state): State<ServiceState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let root = serve_root_for(state.serve_root(), &headers, state.config().per_host);
    let path = url_to_path(&root, uri.path());
    let request = Request {
        state: &state,
        method: &method,
        uri: &uri,
        headers: &headers,
        root: &root,
    };

    match tokio::fs::metadata(&path).await {
        Ok(metadata) if metadata.is_dir() => directory::serve(&request, &path).await,
        Ok(metadata) => file::serve(&request, &path, metadata.len()).await,
        Err(_) => request.not_found(),
    }
}
