//! Server-sent event stream of filesystem changes
//!
//! Each connection keeps its own high-water mark into the shared
//! [`EventLog`]. The first snapshot is taken as soon as the client connects;
//! after that the stream polls once per refresh interval and only writes
//! when something changed. The stream ends when the client goes away.

use std::convert::Infallible;
use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;

use common::prelude::{coalesce, EventLog, EventStamp};

use crate::ServiceState;

struct Cursor {
    log: Arc<EventLog>,
    interval: Duration,
    mark: Option<EventStamp>,
    next_id: u64,
    started: bool,
}

impl Cursor {
    /// Events since the mark as SSE messages, advancing the mark.
    fn drain(&mut self) -> String {
        let events = coalesce(self.log.snapshot(self.mark));
        let mut out = String::new();
        for event in &events {
            let _ = writeln!(out, "id: {}", self.next_id);
            for line in event.path.split('\n') {
                let _ = writeln!(out, "data: {}", line.trim_end_matches('\r'));
            }
            out.push('\n');
            self.next_id += 1;
        }
        if let Some(last) = events.last() {
            self.mark = Some(last.stamp);
        }
        out
    }

    async fn next_message(mut self) -> Option<(Result<Bytes, Infallible>, Self)> {
        loop {
            if self.started {
                tokio::time::sleep(self.interval).await;
            }
            self.started = true;
            let message = self.drain();
            if !message.is_empty() {
                return Some((Ok(Bytes::from(message)), self));
            }
        }
    }
}

pub async fn handler(State(state): State<ServiceState>) -> Response {
    let cursor = Cursor {
        log: state.events().clone(),
        interval: state.config().refresh_interval,
        mark: None,
        next_id: 0,
        started: false,
    };
    let stream = futures::stream::unfold(cursor, Cursor::next_message);

    let allow_origin = HeaderValue::from_str(&state.config().event_allow_origin)
        .unwrap_or_else(|_| HeaderValue::from_static("*"));

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream;charset=utf-8")),
            (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
            (header::CONNECTION, HeaderValue::from_static("keep-alive")),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, allow_origin),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}
