use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use common::prelude::Theme;
use common::render::HTML_UTF8;

pub const RATE_LIMIT_TITLE: &str = "Rate-limit exceeded";
const RATE_LIMIT_BODY: &str =
    "<div style='color:red'>You have reached the maximum request limit.</div>";

pub fn html_response(status: StatusCode, body: impl Into<Body>) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, HeaderValue::from_static(HTML_UTF8))],
        body.into(),
    )
        .into_response()
}

/// A short themed page with a heading and some HTML.
pub fn message_page(status: StatusCode, theme: &Theme, title: &str, body_html: &str) -> Response {
    match theme.page(title, body_html) {
        Ok(html) => html_response(status, html),
        Err(e) => {
            tracing::error!(error = %e, "failed to render message page");
            (status, title.to_string()).into_response()
        }
    }
}

pub fn not_found(headers: &HeaderMap, theme: &Theme, path: &str) -> Response {
    let accept = headers.get(header::ACCEPT).and_then(|v| v.to_str().ok());

    match accept {
        Some(accept) if accept.contains("application/json") => {
            let msg = serde_json::json!({"msg": "not found"});
            (StatusCode::NOT_FOUND, Json(msg)).into_response()
        }
        _ => message_page(
            StatusCode::NOT_FOUND,
            theme,
            "Not found",
            &format!(
                "<p>Could not find <code>{}</code>.</p>",
                html_escape::encode_text(path)
            ),
        ),
    }
}

pub fn forbidden(theme: &Theme) -> Response {
    message_page(
        StatusCode::FORBIDDEN,
        theme,
        "Permission denied",
        "<p>You do not have the rights to access this page.</p>",
    )
}

pub fn rate_limited(theme: &Theme) -> Response {
    message_page(
        StatusCode::TOO_MANY_REQUESTS,
        theme,
        RATE_LIMIT_TITLE,
        RATE_LIMIT_BODY,
    )
}

pub fn server_error(theme: &Theme) -> Response {
    message_page(
        StatusCode::INTERNAL_SERVER_ERROR,
        theme,
        "Server error",
        "<p>Something went wrong while handling this request.</p>",
    )
}
