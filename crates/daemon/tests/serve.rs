//! End-to-end request handling through the main and event routers

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use http_body_util::BodyExt;
use tower::ServiceExt;

use common::prelude::{CacheMode, CookieUserStore, FsEventKind, UserStore};
use common::permissions::static_deny_page;
use livesite_daemon::http_server;
use livesite_daemon::{ServiceConfig, ServiceState};

fn config(dir: &Path) -> ServiceConfig {
    ServiceConfig {
        serve_dir: dir.to_path_buf(),
        cache_mode: CacheMode::On,
        rate_limit: None,
        ..Default::default()
    }
}

fn state(config: &ServiceConfig) -> ServiceState {
    ServiceState::from_config(config).unwrap()
}

async fn get(router: Router, uri: &str, headers: &[(&str, &str)]) -> Response {
    let mut request = Request::builder().uri(uri);
    for (name, value) in headers {
        request = request.header(*name, *value);
    }
    router
        .oneshot(request.body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn body_string(response: Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_static_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a.txt");
    std::fs::write(&path, "hello").unwrap();
    let state = state(&config(dir.path()));
    let router = http_server::router(state.clone());

    let response = get(router, "/a.txt", &[("accept-encoding", "gzip")]).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/plain; charset=utf-8"
    );
    assert!(response.headers().get(header::CONTENT_ENCODING).is_none());
    assert_eq!(response.headers()[header::CONTENT_LENGTH], "5");
    assert_eq!(body_string(response).await, "hello");

    // small entries are kept uncompressed
    let cache = state.cache().unwrap();
    assert!(cache.has_file(&path));
    let block = cache.read(&path, true).await.unwrap();
    assert!(!block.is_compressed());
}

#[tokio::test]
async fn test_directory_redirect() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("sub")).unwrap();
    let router = http_server::router(state(&config(dir.path())));

    let response = get(router, "/sub", &[]).await;
    assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
    assert_eq!(response.headers()[header::LOCATION], "/sub/");
}

#[tokio::test]
async fn test_index_fallback() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("sub")).unwrap();
    std::fs::write(dir.path().join("sub/index.md"), "# hi").unwrap();
    let router = http_server::router(state(&config(dir.path())));

    let response = get(router, "/sub/", &[]).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/html; charset=utf-8"
    );
    assert!(body_string(response).await.contains("<h1>hi</h1>"));
}

#[tokio::test]
async fn test_auto_refresh_injection() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("index.html"),
        "<html><body>x</body></html>",
    )
    .unwrap();
    let mut config = config(dir.path());
    config.auto_refresh = true;
    config.event_path = "/fs".to_string();
    config.refresh_interval = Duration::from_millis(350);
    let router = http_server::router(state(&config));

    let response = get(router, "/index.html", &[("host", "localhost:3000")]).await;
    assert_eq!(response.status(), StatusCode::OK);
    // hardening headers are left off while auto-refresh is on
    assert!(response.headers().get("x-frame-options").is_none());

    let body = body_string(response).await;
    let end = body.find("</body>").unwrap();
    let before_end = &body[..end];
    assert!(before_end.contains("new EventSource("));
    assert!(before_end.contains("'//localhost:5553/fs'"));
    assert!(before_end.contains("245"));
}

#[tokio::test(start_paused = true)]
async fn test_sse_coalesces_writes() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.auto_refresh = true;
    config.refresh_interval = Duration::from_millis(200);
    let state = state(&config);
    assert_eq!(state.events().max_age(), Duration::from_millis(200));

    for _ in 0..3 {
        state.events().record("foo.txt", FsEventKind::Write);
        tokio::time::advance(Duration::from_millis(20)).await;
    }

    let response = get(http_server::event_router(state.clone()), "/fs", &[]).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/event-stream;charset=utf-8"
    );

    let mut body = response.into_body();
    let first = tokio::time::timeout(Duration::from_millis(100), body.frame())
        .await
        .expect("first snapshot")
        .unwrap()
        .unwrap()
        .into_data()
        .unwrap();
    let text = String::from_utf8(first.to_vec()).unwrap();
    assert_eq!(text.matches("data: foo.txt").count(), 1);
    assert_eq!(text, "id: 0\ndata: foo.txt\n\n");

    let next = tokio::time::timeout(Duration::from_millis(500), body.frame()).await;
    assert!(next.is_err(), "no further message without new writes");
}

#[tokio::test]
async fn test_permission_denied_skips_dispatcher() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("admin")).unwrap();
    let secret = dir.path().join("admin/x");
    std::fs::write(&secret, "secret").unwrap();

    let users = Arc::new(CookieUserStore::new());
    users.set_deny_handler(static_deny_page("<p>go away</p>"));
    let state = ServiceState::builder(config(dir.path()))
        .users(users)
        .build()
        .unwrap();
    assert!(state.users().required_role("/admin/x") > common::prelude::Role::Anonymous);
    let router = http_server::router(state.clone());

    let response = get(router, "/admin/x", &[]).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_string(response).await, "<p>go away</p>");

    let cache = state.cache().unwrap();
    assert!(!cache.has_file(&secret));
    assert_eq!(cache.misses(), 0);
}

#[tokio::test]
async fn test_gate_sees_decoded_path() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("admin")).unwrap();
    std::fs::write(dir.path().join("admin/x"), "secret").unwrap();
    let state = state(&config(dir.path()));
    let router = http_server::router(state.clone());

    for uri in ["/admin/x", "/%61dmin/x", "//admin/x", "/./admin/x", "/admin%2Fx"] {
        let response = get(router.clone(), uri, &[]).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN, "{}", uri);
        assert!(!body_string(response).await.contains("secret"), "{}", uri);
    }
    assert_eq!(state.cache().unwrap().misses(), 0);
}

#[tokio::test]
async fn test_admin_session_passes_gate() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("admin")).unwrap();
    std::fs::write(dir.path().join("admin/x"), "secret").unwrap();
    let mut config = config(dir.path());
    config
        .permissions
        .admins
        .insert("root".to_string(), "t0ken".to_string());
    let router = http_server::router(state(&config));

    let response = get(
        router.clone(),
        "/admin/x",
        &[("cookie", "livesite_session=t0ken")],
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "secret");

    let response = get(router, "/admin/x", &[]).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(body_string(response).await.contains("Permission denied"));
}

#[tokio::test]
async fn test_rate_limit() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), "hello").unwrap();
    let mut config = config(dir.path());
    config.rate_limit = Some(2);
    let router = http_server::router(state(&config));

    assert_eq!(get(router.clone(), "/a.txt", &[]).await.status(), StatusCode::OK);
    assert_eq!(get(router.clone(), "/a.txt", &[]).await.status(), StatusCode::OK);
    let response = get(router, "/a.txt", &[]).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/html; charset=utf-8"
    );
    assert!(body_string(response)
        .await
        .contains("You have reached the maximum request limit."));
}

#[tokio::test]
async fn test_response_headers() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), "hello").unwrap();
    let mut config = config(dir.path());
    config.server_name = "example".to_string();
    let router = http_server::router(state(&config));

    let response = get(router.clone(), "/a.txt", &[]).await;
    assert_eq!(response.headers()[header::SERVER], "example");
    assert_eq!(response.headers()["x-content-type-options"], "nosniff");
    assert_eq!(response.headers()["x-frame-options"], "SAMEORIGIN");

    config.security_headers = false;
    let router = http_server::router(state(&config));
    let response = get(router, "/a.txt", &[]).await;
    assert_eq!(response.headers()[header::SERVER], "example");
    assert!(response.headers().get("x-frame-options").is_none());
}

#[tokio::test]
async fn test_large_file_is_gzipped() {
    let dir = tempfile::tempdir().unwrap();
    let content = "all work and no play\n".repeat(500);
    std::fs::write(dir.path().join("big.txt"), &content).unwrap();
    let router = http_server::router(state(&config(dir.path())));

    let response = get(router.clone(), "/big.txt", &[("accept-encoding", "gzip")]).await;
    assert_eq!(response.headers()[header::CONTENT_ENCODING], "gzip");
    let length: usize = response.headers()[header::CONTENT_LENGTH]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(bytes.len(), length);
    assert!(length < content.len());
    assert_eq!(common::cache::decompress(&bytes).unwrap(), content.as_bytes());

    let response = get(router, "/big.txt", &[]).await;
    assert!(response.headers().get(header::CONTENT_ENCODING).is_none());
    assert_eq!(body_string(response).await, content);
}

#[tokio::test]
async fn test_directory_listing() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("docs")).unwrap();
    std::fs::create_dir(dir.path().join("docs/img")).unwrap();
    std::fs::write(dir.path().join("docs/b c.txt"), "x").unwrap();
    std::fs::write(dir.path().join("docs/.livesite"), "").unwrap();
    std::fs::create_dir(dir.path().join("empty")).unwrap();
    let router = http_server::router(state(&config(dir.path())));

    let response = get(router.clone(), "/docs/", &[]).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response).await;
    assert!(body.contains("<a href=\"/docs/b%20c.txt\">b c.txt</a><br>"));
    assert!(body.contains("<a href=\"/docs/img/\">img/</a><br>"));
    assert!(!body.contains(".livesite"));

    let response = get(router, "/empty/", &[]).await;
    assert!(body_string(response).await.contains("Empty directory"));
}

#[tokio::test]
async fn test_not_found_and_traversal() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.html"), "<p>home</p>").unwrap();
    let router = http_server::router(state(&config(dir.path())));

    let response = get(router.clone(), "/nope.html", &[]).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(body_string(response).await.contains("Not found"));

    // climbing out of the root lands on the root, which has an index
    let response = get(router, "/../../etc/passwd/", &[]).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "<p>home</p>");
}

#[tokio::test]
async fn test_render_failure_pages() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("page.amber"), "doctype 5\nhtml").unwrap();
    let mut config = config(dir.path());

    config.debug = true;
    let response = get(http_server::router(state(&config)), "/page.amber", &[]).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response).await;
    assert!(body.contains("Amber Error"));
    assert!(body.contains("Contents of page.amber:"));
    assert!(body.contains("doctype 5"));

    config.debug = false;
    let response = get(http_server::router(state(&config)), "/page.amber", &[]).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(!body_string(response).await.contains("doctype 5"));
}

#[tokio::test]
async fn test_download_extension() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("bundle.zip"), [0x50, 0x4b, 0x03, 0x04]).unwrap();
    let router = http_server::router(state(&config(dir.path())));

    let response = get(router, "/bundle.zip", &[]).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_DISPOSITION],
        "attachment; filename=\"bundle.zip\""
    );
}

#[tokio::test]
async fn test_per_host_roots() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("one.test")).unwrap();
    std::fs::write(dir.path().join("one.test/a.txt"), "one").unwrap();
    let mut config = config(dir.path());
    config.per_host = true;
    let router = http_server::router(state(&config));

    let response = get(router.clone(), "/a.txt", &[("host", "one.test:3000")]).await;
    assert_eq!(body_string(response).await, "one");
    let response = get(router, "/a.txt", &[("host", "two.test")]).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_status_routes() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), "hello").unwrap();
    let mut config = config(dir.path());
    config
        .permissions
        .admins
        .insert("root".to_string(), "t0ken".to_string());
    let state = state(&config);
    let router = http_server::router(state.clone());
    let admin = [("cookie", "livesite_session=t0ken")];

    let response = get(router.clone(), "/_status/livez", &[]).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, r#"{"status":"ok"}"#);

    let response = get(router.clone(), "/_status/version", &[]).await;
    let info: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(info["name"], "livesite");

    // cache stats are for admins only
    let response = get(router.clone(), "/_status/cache", &[]).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    get(router.clone(), "/a.txt", &[]).await;
    assert_eq!(state.cache().unwrap().len(), 1);
    let response = get(router.clone(), "/_status/cache", &admin).await;
    assert!(body_string(response).await.starts_with("Cache information:"));

    let request = Request::builder()
        .method("DELETE")
        .uri("/_status/cache")
        .header("cookie", "livesite_session=t0ken")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(body_string(response).await, "Cache cleared");
    assert!(state.cache().unwrap().is_empty());
}

#[tokio::test]
async fn test_cache_off_serves_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a.txt");
    std::fs::write(&path, "one").unwrap();
    let mut config = config(dir.path());
    config.cache_mode = CacheMode::Off;
    let router = http_server::router(state(&config));

    assert_eq!(body_string(get(router.clone(), "/a.txt", &[]).await).await, "one");
    std::fs::write(&path, "two").unwrap();
    assert_eq!(body_string(get(router.clone(), "/a.txt", &[]).await).await, "two");

    let response = get(router, "/_status/livez", &[]).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_excluded_file_refreshes_cache_entry() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a.txt");
    std::fs::write(&path, "fresh").unwrap();
    let mut config = config(dir.path());
    config.cache_mode = CacheMode::Images;
    let state = state(&config);
    let router = http_server::router(state.clone());

    let cache = state.cache().unwrap();
    cache.store(&path, "stale").unwrap();

    let response = get(router.clone(), "/a.txt", &[]).await;
    assert_eq!(body_string(response).await, "fresh");
    std::fs::write(&path, "newer").unwrap();
    let response = get(router, "/a.txt", &[]).await;
    assert_eq!(body_string(response).await, "newer");

    // read from disk every time, and the entry follows the disk
    assert_eq!(cache.misses(), 0);
    assert_eq!(cache.hits(), 0);
    let block = cache.read(&path, true).await.unwrap();
    assert_eq!(&block.uncompressed().unwrap()[..], b"newer");
}
