use std::path::Path;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};

use super::{file, Request};
use crate::http_server::pages;

/// Tried in order when a directory is requested.
pub const INDEX_FILES: &[&str] = &[
    "index.lua",
    "index.html",
    "index.md",
    "index.txt",
    "index.pongo2",
    "index.amber",
    "index.tmpl",
    "index.po2",
];

/// Per-directory settings file, never listed.
pub const HIDDEN_ENTRY: &str = ".livesite";

/// Characters escaped in listing links.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

pub(super) async fn serve(request: &Request<'_>, dir: &Path) -> Response {
    let url_path = request.uri.path();
    if !url_path.ends_with('/') {
        return redirect_to_slash(request);
    }

    let has_scripts = request.state.scripts().is_some();
    for name in INDEX_FILES {
        if *name == "index.lua" && !has_scripts {
            continue;
        }
        let candidate = dir.join(name);
        if let Ok(metadata) = tokio::fs::metadata(&candidate).await {
            if metadata.is_file() {
                return file::serve(request, &candidate, metadata.len()).await;
            }
        }
    }

    listing(request, dir, url_path).await
}

fn redirect_to_slash(request: &Request<'_>) -> Response {
    let mut location = format!("{}/", request.uri.path());
    if let Some(query) = request.uri.query() {
        location.push('?');
        location.push_str(query);
    }
    match HeaderValue::from_str(&location) {
        Ok(location) => (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, location)]).into_response(),
        Err(_) => request.not_found(),
    }
}

async fn listing(request: &Request<'_>, dir: &Path, url_path: &str) -> Response {
    let mut entries = match read_entries(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            tracing::error!(dir = %dir.display(), error = %e, "failed to list directory");
            return pages::server_error(&request.state.config().theme);
        }
    };
    entries.sort();

    let mut body = String::new();
    for (name, is_dir) in &entries {
        let slash = if *is_dir { "/" } else { "" };
        body.push_str(&format!(
            "<a href=\"{}{}{}\">{}{}</a><br>",
            url_path,
            utf8_percent_encode(name, PATH_SEGMENT),
            slash,
            html_escape::encode_text(name),
            slash,
        ));
    }
    if body.is_empty() {
        body.push_str("Empty directory");
    }

    let theme = &request.state.config().theme;
    match theme.page(url_path, &body) {
        Ok(page) => request.emit_html(StatusCode::OK, page),
        Err(e) => {
            tracing::error!(error = %e, "failed to render directory listing");
            pages::server_error(theme)
        }
    }
}

/// `(name, is_dir)` for every visible entry.
async fn read_entries(dir: &Path) -> std::io::Result<Vec<(String, bool)>> {
    let mut entries = Vec::new();
    let mut reader = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = reader.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == HIDDEN_ENTRY {
            continue;
        }
        let is_dir = tokio::fs::metadata(entry.path())
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        entries.push((name, is_dir));
    }
    Ok(entries)
}
