use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;

use common::prelude::DataBlock;
use common::render::OCTET_STREAM;

/// Whether the client listed gzip in `Accept-Encoding` with a non-zero quality.
pub fn accepts_gzip(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|coding| {
            let mut parts = coding.split(';');
            let name = parts.next().unwrap_or_default().trim();
            if !name.eq_ignore_ascii_case("gzip") {
                return false;
            }
            !parts.any(|param| {
                param
                    .trim()
                    .strip_prefix("q=")
                    .and_then(|q| q.trim().parse::<f32>().ok())
                    .is_some_and(|q| q == 0.0)
            })
        })
}

/// Send `block` as the body of a response.
///
/// Clients that accept gzip get the stored compressed bytes as-is, or a
/// freshly compressed body when the content is larger than `threshold`.
/// Everyone else gets the decompressed bytes. `Content-Length` always
/// matches the bytes on the wire.
pub fn emit(
    request_headers: &HeaderMap,
    status: StatusCode,
    content_type: &str,
    block: &DataBlock,
    threshold: usize,
) -> Response {
    let wants_gzip = accepts_gzip(request_headers);
    let mut encoding = None;

    let body = if block.is_empty() {
        Bytes::new()
    } else if wants_gzip && (block.is_compressed() || block.len() > threshold) {
        match block.gzipped() {
            Ok(gzipped) => {
                encoding = Some("gzip");
                gzipped
            }
            Err(e) => {
                tracing::warn!(error = %e, "gzip failed, sending identity");
                encoding = Some("identity");
                match block.uncompressed() {
                    Ok(bytes) => bytes,
                    Err(e) => return corrupt_block(e),
                }
            }
        }
    } else {
        match block.uncompressed() {
            Ok(bytes) => bytes,
            Err(e) => return corrupt_block(e),
        }
    };

    let content_type = HeaderValue::from_str(content_type)
        .unwrap_or_else(|_| HeaderValue::from_static(OCTET_STREAM));
    let length = HeaderValue::from(body.len());

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(header::CONTENT_LENGTH, length);
    headers.insert(header::VARY, HeaderValue::from_static("Accept-Encoding"));
    if let Some(encoding) = encoding {
        headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static(encoding));
    }
    response
}

fn corrupt_block(err: impl std::fmt::Display) -> Response {
    tracing::error!(error = %err, "stored data could not be decompressed");
    StatusCode::INTERNAL_SERVER_ERROR.into_response()
}
