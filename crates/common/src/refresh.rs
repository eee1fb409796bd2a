//! Live-reload script injection for served HTML

use std::time::Duration;

/// Where the injected script finds the event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoRefresh {
    /// `host:port` of the event server, as seen by the browser.
    pub host_port: String,
    /// Path of the event stream, like `/fs`.
    pub event_path: String,
    pub refresh_interval: Duration,
}

impl AutoRefresh {
    pub fn new(
        host_port: impl Into<String>,
        event_path: impl Into<String>,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            host_port: host_port.into(),
            event_path: event_path.into(),
            refresh_interval,
        }
    }

    /// Milliseconds to wait before connecting: 70% of the refresh interval.
    pub fn delay_ms(&self) -> u128 {
        self.refresh_interval.as_millis() * 7 / 10
    }

    pub fn script(&self) -> String {
        format!(
            "<script>if(!!window.EventSource){{window.setTimeout(function(){{\
var s=new EventSource(window.location.protocol+'//{}{}');\
s.addEventListener('message',function(e){{const p='/'+e.data;\
if(p.indexOf(window.location.pathname)>=0){{location.reload()}}}},false);}},{});}}</script>",
            self.host_port,
            self.event_path,
            self.delay_ms()
        )
    }

    /// Splice the script into `html`.
    ///
    /// The script goes before `</body>`, else right after `<head>`, else
    /// into a new `<head>` after `<html>`. Without any of those markers the
    /// input is returned unchanged, as it is when the script is already there.
    pub fn inject(&self, html: &[u8]) -> Vec<u8> {
        let script = self.script();
        if find(html, script.as_bytes()).is_some() {
            return html.to_vec();
        }
        if let Some(pos) = find(html, b"</body>") {
            return splice(html, pos, script.as_bytes());
        }
        if let Some(pos) = find(html, b"<head>") {
            return splice(html, pos + b"<head>".len(), script.as_bytes());
        }
        if let Some(pos) = find(html, b"<html>") {
            let head = format!("<head>{}</head>", script);
            return splice(html, pos + b"<html>".len(), head.as_bytes());
        }
        html.to_vec()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn splice(html: &[u8], at: usize, insert: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(html.len() + insert.len());
    out.extend_from_slice(&html[..at]);
    out.extend_from_slice(insert);
    out.extend_from_slice(&html[at..]);
    out
}
