use std::path::Path;
use std::sync::Arc;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;

use common::prelude::{CacheError, DataBlock, Handling, RenderContext, RenderError, Renderer};
use common::render::{ScriptContext, SourceLang, DATA_FILENAME, HTML_UTF8, OCTET_STREAM};

use super::{BufferedResponse, Request};

pub(super) async fn serve(request: &Request<'_>, path: &Path, size: u64) -> Response {
    match request.state.renderers().resolve(path) {
        Handling::Render(renderer) => render(request, path, size, renderer).await,
        Handling::Html => html(request, path, size).await,
        Handling::Script => script(request, path).await,
        Handling::Download => download(request, path, size).await,
        Handling::Static(content_type) => static_file(request, path, size, &content_type).await,
    }
}

async fn static_file(request: &Request<'_>, path: &Path, size: u64, content_type: &str) -> Response {
    match request.read(path, size).await {
        Ok(block) => request.emit(StatusCode::OK, content_type, &block),
        Err(e) => request.read_failure(path, e),
    }
}

async fn html(request: &Request<'_>, path: &Path, size: u64) -> Response {
    let block = match request.read(path, size).await {
        Ok(block) => block,
        Err(e) => return request.read_failure(path, e),
    };
    if request.auto_refresh().is_none() {
        return request.emit(StatusCode::OK, HTML_UTF8, &block);
    }
    match block.uncompressed() {
        Ok(html) => request.emit_html(StatusCode::OK, html.to_vec()),
        Err(e) => request.read_failure(path, e),
    }
}

async fn download(request: &Request<'_>, path: &Path, size: u64) -> Response {
    let mut response = static_file(request, path, size, OCTET_STREAM).await;
    if !response.status().is_success() {
        return response;
    }
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().replace('"', ""))
        .unwrap_or_default();
    if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", name)) {
        response
            .headers_mut()
            .insert(header::CONTENT_DISPOSITION, value);
    }
    response
}

async fn render(
    request: &Request<'_>,
    path: &Path,
    size: u64,
    renderer: Arc<dyn Renderer>,
) -> Response {
    let source = match request.read(path, size).await.and_then(|b| b.uncompressed()) {
        Ok(source) => source,
        Err(e) => return request.read_failure(path, e),
    };

    let data = if renderer.consumes_data_file() {
        match data_file(request, path).await {
            Ok(data) => data,
            Err(e) => return request.read_failure(path, e),
        }
    } else {
        None
    };

    let theme = request.state.config().theme.clone();
    let filename = path.to_path_buf();
    let task_source = source.clone();
    let task_renderer = renderer.clone();
    let rendered = tokio::task::spawn_blocking(move || {
        let ctx = RenderContext {
            filename: &filename,
            theme: &theme,
            data: data.as_ref(),
        };
        task_renderer.render(&ctx, &task_source)
    })
    .await
    .unwrap_or_else(|e| Err(RenderError::new(None::<SourceLang>, format!("renderer panicked: {}", e))));

    match rendered {
        Ok(output) => {
            let content_type = renderer.content_type();
            if content_type.starts_with("text/html") {
                request.emit_html(StatusCode::OK, output)
            } else {
                request.emit(StatusCode::OK, content_type, &DataBlock::new(output))
            }
        }
        Err(e) => request.render_failure(path, &source, &e),
    }
}

/// The `data.lua` next to `path`, if there is one.
async fn data_file(request: &Request<'_>, path: &Path) -> Result<Option<DataBlock>, CacheError> {
    let Some(dir) = path.parent() else {
        return Ok(None);
    };
    let data_path = dir.join(DATA_FILENAME);
    let size = match tokio::fs::metadata(&data_path).await {
        Ok(metadata) if metadata.is_file() => metadata.len(),
        _ => return Ok(None),
    };
    match request.read(&data_path, size).await {
        Ok(block) => Ok(Some(block)),
        Err(CacheError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

async fn script(request: &Request<'_>, path: &Path) -> Response {
    let Some(engine) = request.state.scripts().cloned() else {
        let source = tokio::fs::read(path).await.unwrap_or_default();
        let err = RenderError::new(SourceLang::Lua, "no script engine is installed");
        return request.render_failure(path, &source, &err);
    };

    let method = request.method.clone();
    let uri = request.uri.clone();
    let headers = request.headers.clone();
    let root = request.root.to_path_buf();
    let script_path = path.to_path_buf();
    let output = tokio::task::spawn_blocking(move || {
        let ctx = ScriptContext {
            method: &method,
            uri: &uri,
            headers: &headers,
            root: &root,
        };
        engine.run_file(&script_path, &ctx)
    })
    .await
    .unwrap_or_else(|e| Err(RenderError::new(SourceLang::Lua, format!("script panicked: {}", e))));

    match output {
        Ok(output) => {
            let mut buffered = BufferedResponse::from(output);
            if buffered.content_type().starts_with("text/html") {
                if let Some(body) = request.inject(buffered.body()) {
                    buffered.set_body(body);
                }
            }
            buffered.commit(request.headers, request.threshold())
        }
        Err(e) => {
            let source = tokio::fs::read(path).await.unwrap_or_default();
            request.render_failure(path, &source, &e)
        }
    }
}
