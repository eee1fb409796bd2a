use axum::http::{header, HeaderMap, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};

use super::dispatch::request_domain;

/// Send plain HTTP clients to the same path over HTTPS.
pub async fn to_https(headers: HeaderMap, uri: Uri) -> Response {
    let host = request_domain(&headers).unwrap_or("localhost");
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    match HeaderValue::from_str(&format!("https://{}{}", host, path)) {
        Ok(location) => (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, location)]).into_response(),
        Err(_) => StatusCode::BAD_REQUEST.into_response(),
    }
}
