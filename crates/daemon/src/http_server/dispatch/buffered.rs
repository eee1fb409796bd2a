use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::Response;
use bytes::{BufMut, Bytes, BytesMut};

use common::prelude::DataBlock;
use common::render::{ScriptOutput, HTML_UTF8};

use super::emit::emit;

/// A response held back until the handler is sure it succeeded.
///
/// Nothing reaches the client until [`commit`](Self::commit); a handler
/// that fails simply drops the buffer and answers with something else.
#[derive(Debug)]
pub struct BufferedResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: BytesMut,
}

impl Default for BufferedResponse {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: BytesMut::new(),
        }
    }
}

impl BufferedResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn write(&mut self, data: &[u8]) {
        self.body.put_slice(data);
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Replace the body, e.g. after injecting into it.
    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        let body: Bytes = body.into();
        self.body = BytesMut::from(&body[..]);
    }

    pub fn content_type(&self) -> &str {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(HTML_UTF8)
    }

    /// Send everything that was buffered.
    ///
    /// Length and encoding are decided by the emitter; any such headers
    /// set on the buffer are dropped.
    pub fn commit(self, request_headers: &HeaderMap, threshold: usize) -> Response {
        let content_type = self.content_type().to_string();
        let block = DataBlock::new(self.body.freeze());
        let mut response = emit(request_headers, self.status, &content_type, &block, threshold);

        let mut last_name = None;
        for (name, value) in self.headers {
            if let Some(name) = name {
                last_name = Some(name);
            }
            let Some(name) = &last_name else {
                continue;
            };
            if *name == header::CONTENT_LENGTH
                || *name == header::CONTENT_ENCODING
                || *name == header::CONTENT_TYPE
            {
                continue;
            }
            response.headers_mut().append(name.clone(), value);
        }
        response
    }
}

impl From<ScriptOutput> for BufferedResponse {
    fn from(output: ScriptOutput) -> Self {
        let mut buffered = BufferedResponse::new();
        if let Some(status) = output.status {
            buffered.set_status(status);
        }
        *buffered.headers_mut() = output.headers;
        if !buffered.headers.contains_key(header::CONTENT_TYPE) {
            buffered
                .headers
                .insert(header::CONTENT_TYPE, HeaderValue::from_static(HTML_UTF8));
        }
        buffered.write(&output.body);
        buffered
    }
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;

    use super::*;

    #[tokio::test]
    async fn test_commit_replays_everything() {
        let mut buffered = BufferedResponse::new();
        buffered.set_status(StatusCode::CREATED);
        buffered
            .headers_mut()
            .insert("x-script", HeaderValue::from_static("yes"));
        buffered
            .headers_mut()
            .insert(header::CONTENT_LENGTH, HeaderValue::from_static("999"));
        buffered.write(b"hello ");
        buffered.write(b"there");

        let response = buffered.commit(&HeaderMap::new(), 4096);
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["x-script"], "yes");
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "11");
        assert_eq!(response.headers()[header::CONTENT_TYPE], HTML_UTF8);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"hello there");
    }

    #[test]
    fn test_from_script_output() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        let buffered = BufferedResponse::from(ScriptOutput {
            status: None,
            headers,
            body: Bytes::from_static(b"42"),
        });
        assert_eq!(buffered.content_type(), "text/plain");
        assert_eq!(buffered.body(), b"42");
    }
}
