use std::path::{Path, PathBuf};

use axum::http::{header, HeaderMap};
use percent_encoding::percent_decode_str;

/// A request path as it is served: percent-decoded, with empty and `.`
/// segments dropped, always starting with `/`.
///
/// Anything that tries to climb out of the root becomes `/`. Access rules and
/// the dispatcher both work on this form.
pub fn clean_url_path(url_path: &str) -> String {
    let decoded = percent_decode_str(url_path).decode_utf8_lossy();
    if decoded.contains("..") || decoded.contains('\0') || decoded.contains('\\') {
        return "/".to_string();
    }
    let segments: Vec<&str> = decoded
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect();
    format!("/{}", segments.join("/"))
}

/// Filesystem path for a request path under `root`.
pub fn url_to_path(root: &Path, url_path: &str) -> PathBuf {
    let clean = clean_url_path(url_path);
    let relative = clean.trim_start_matches('/');
    if relative.is_empty() {
        root.to_path_buf()
    } else {
        root.join(relative)
    }
}

/// Host of the request without any port, e.g. `example.com` or `[::1]`.
pub fn request_domain(headers: &HeaderMap) -> Option<&str> {
    let host = headers.get(header::HOST)?.to_str().ok()?.trim();
    let domain = if host.starts_with('[') {
        match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        }
    } else {
        host.split(':').next().unwrap_or(host)
    };
    (!domain.is_empty()).then_some(domain)
}

/// Root to serve from: `<root>/<domain>` in per-host mode.
pub fn serve_root_for(root: &Path, headers: &HeaderMap, per_host: bool) -> PathBuf {
    if !per_host {
        return root.to_path_buf();
    }
    match request_domain(headers) {
        Some(domain) if is_plain_name(domain) => root.join(domain),
        _ => root.to_path_buf(),
    }
}

fn is_plain_name(domain: &str) -> bool {
    !domain.contains("..")
        && domain
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn host(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn test_url_to_path() {
        let root = Path::new("/srv");
        assert_eq!(url_to_path(root, "/"), PathBuf::from("/srv"));
        assert_eq!(url_to_path(root, "/a/b.html"), PathBuf::from("/srv/a/b.html"));
        assert_eq!(url_to_path(root, "/my%20page.md"), PathBuf::from("/srv/my page.md"));
        assert_eq!(url_to_path(root, "/../etc/passwd"), PathBuf::from("/srv"));
        assert_eq!(url_to_path(root, "/%2e%2e/etc/passwd"), PathBuf::from("/srv"));
    }

    #[test]
    fn test_clean_url_path() {
        assert_eq!(clean_url_path("/admin/x"), "/admin/x");
        assert_eq!(clean_url_path("/%61dmin/x"), "/admin/x");
        assert_eq!(clean_url_path("//admin//x"), "/admin/x");
        assert_eq!(clean_url_path("/./admin/./x/"), "/admin/x");
        assert_eq!(clean_url_path("/%2F%2Fadmin/x"), "/admin/x");
        assert_eq!(clean_url_path("/a/../admin/x"), "/");
        assert_eq!(clean_url_path(""), "/");
    }

    #[test]
    fn test_request_domain() {
        assert_eq!(request_domain(&host("localhost:3000")), Some("localhost"));
        assert_eq!(request_domain(&host("example.com")), Some("example.com"));
        assert_eq!(request_domain(&host("[::1]:3000")), Some("[::1]"));
        assert_eq!(request_domain(&HeaderMap::new()), None);
    }

    #[test]
    fn test_per_host_root() {
        let root = Path::new("/srv");
        assert_eq!(
            serve_root_for(root, &host("site.test:3000"), true),
            PathBuf::from("/srv/site.test")
        );
        assert_eq!(
            serve_root_for(root, &host("site.test:3000"), false),
            PathBuf::from("/srv")
        );
        assert_eq!(serve_root_for(root, &host("[::1]"), true), PathBuf::from("/srv"));
    }
}
