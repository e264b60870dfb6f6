//! End-to-end tests: a real upstream target and the gateway on ephemeral ports

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use api_gateway::config::{ClientConfig, Config, RouteConfig};
use api_gateway::gateway::Gateway;
use api_gateway::keys::hash_api_key;
use api_gateway::store::{MemoryLogStore, Stores};
use api_gateway::telemetry::LogRecord;
use axum::{
    Json, Router,
    body::{Body, Bytes, to_bytes},
    extract::State,
    http::{HeaderMap, Request, StatusCode},
    response::{IntoResponse, Response},
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const KEY: &str = "gw_live_test_acme";
const LIMITED_KEY: &str = "gw_live_test_limited";
const REVOKED_KEY: &str = "gw_live_test_revoked";
const ADMIN_TOKEN: &str = "admin-secret";

// ============================================================================
// Upstream target
// ============================================================================

#[derive(Debug, Clone)]
struct Seen {
    method: String,
    path: String,
    query: Option<String>,
    headers: HeaderMap,
    body: Bytes,
}

#[derive(Clone, Default)]
struct Target {
    seen: Arc<Mutex<Vec<Seen>>>,
    hits: Arc<AtomicU64>,
}

impl Target {
    fn seen(&self) -> Vec<Seen> {
        self.seen.lock().clone()
    }

    fn hits(&self) -> u64 {
        self.hits.load(Ordering::SeqCst)
    }
}

async fn target_handler(State(target): State<Target>, request: Request<Body>) -> Response {
    let (parts, body) = request.into_parts();
    let body = to_bytes(body, usize::MAX).await.unwrap();
    let hit = target.hits.fetch_add(1, Ordering::SeqCst) + 1;
    target.seen.lock().push(Seen {
        method: parts.method.to_string(),
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(str::to_string),
        headers: parts.headers.clone(),
        body,
    });

    let path = parts.uri.path();
    if path.starts_with("/stream") {
        let chunks = vec![
            Ok::<_, std::io::Error>(Bytes::from_static(b"chunk-1,")),
            Ok(Bytes::from_static(b"chunk-2")),
        ];
        return Response::builder()
            .header("content-type", "text/plain")
            .header("x-upstream", "yes")
            .body(Body::from_stream(futures::stream::iter(chunks)))
            .unwrap();
    }
    if path.ends_with("/missing") {
        return (StatusCode::NOT_FOUND, Json(json!({ "error": "no such item" }))).into_response();
    }

    Json(json!({
        "method": parts.method.as_str(),
        "path": path,
        "query": parts.uri.query(),
        "hit": hit,
    }))
    .into_response()
}

async fn spawn_target() -> (SocketAddr, Target) {
    let target = Target::default();
    let app = Router::new()
        .fallback(target_handler)
        .with_state(target.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, target)
}

/// A port nothing listens on
async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

// ============================================================================
// Gateway under test
// ============================================================================

struct TestGateway {
    base: String,
    logs: Arc<MemoryLogStore>,
    shutdown: broadcast::Sender<()>,
    handle: JoinHandle<api_gateway::Result<()>>,
    http: reqwest::Client,
}

fn route(id: &str, prefix: &str, target: &str) -> RouteConfig {
    RouteConfig {
        id: id.to_string(),
        path_prefix: prefix.to_string(),
        target_url: target.to_string(),
        ..Default::default()
    }
}

fn client(id: &str, key: &str) -> ClientConfig {
    ClientConfig {
        id: id.to_string(),
        name: id.to_string(),
        key_hash: hash_api_key(key),
        ..Default::default()
    }
}

async fn start_gateway(target: SocketAddr) -> TestGateway {
    let upstream = format!("http://{target}");
    let dead = format!("http://127.0.0.1:{}", closed_port().await);

    let mut config = Config::default();
    config.auth.admin_token = Some(ADMIN_TOKEN.to_string());
    config.log_pipeline.poll_interval = Duration::from_millis(20);
    config.log_pipeline.initial_backoff = Duration::from_millis(10);
    config.server.shutdown_timeout = Duration::from_secs(5);
    config.routes = vec![
        route("api", "/api", &upstream),
        route("users", "/api/users", &upstream),
        route("test-cache", "/test-cache", &upstream),
        RouteConfig {
            methods: vec!["GET".to_string(), "POST".to_string()],
            ..route("readonly", "/readonly", &upstream)
        },
        RouteConfig {
            strip_prefix: true,
            ..route("svc", "/svc", &format!("{upstream}/internal/"))
        },
        route("stream", "/stream", &upstream),
        route("dead", "/dead", &dead),
    ];
    config.clients = vec![
        client("acme", KEY),
        ClientConfig {
            rate_limit: Some(5),
            ..client("limited", LIMITED_KEY)
        },
        ClientConfig {
            active: false,
            ..client("revoked", REVOKED_KEY)
        },
    ];

    let mut stores = Stores::in_memory(&config).unwrap();
    let logs = Arc::new(MemoryLogStore::new());
    stores.logs = logs.clone();

    let gateway = Gateway::with_stores(config, stores);
    let shutdown = gateway.shutdown_handle();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(gateway.serve(listener));

    TestGateway {
        base: format!("http://{addr}"),
        logs,
        shutdown,
        handle,
        http: reqwest::Client::new(),
    }
}

impl TestGateway {
    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.http.get(format!("{}{path}", self.base)).header("x-api-key", KEY)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{path}", self.base))
            .header("x-api-key", KEY)
    }

    fn admin(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{path}", self.base))
            .bearer_auth(ADMIN_TOKEN)
    }

    /// Wait until at least `count` records were persisted
    async fn wait_for_logs(&self, count: usize) -> Vec<LogRecord> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let records = self.logs.records();
            if records.len() >= count || Instant::now() > deadline {
                return records;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn stop(self) {
        let _ = self.shutdown.send(());
        let result = tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("gateway did not stop")
            .unwrap();
        assert!(result.is_ok());
    }
}

fn header<'a>(response: &'a reqwest::Response, name: &str) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

fn records_for<'a>(records: &'a [LogRecord], path: &str) -> Vec<&'a LogRecord> {
    records.iter().filter(|r| r.path == path).collect()
}

// ============================================================================
// Cache
// ============================================================================

#[tokio::test]
async fn test_cache_miss_then_hit() {
    let (addr, target) = spawn_target().await;
    let gw = start_gateway(addr).await;

    let first = gw.get("/test-cache").send().await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(header(&first, "x-cache"), Some("MISS"));
    let first_body: Value = first.json().await.unwrap();

    let second = gw.get("/test-cache").send().await.unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(header(&second, "x-cache"), Some("HIT"));
    let second_body: Value = second.json().await.unwrap();

    assert_eq!(first_body, second_body);
    assert_eq!(target.hits(), 1);

    gw.stop().await;
}

#[tokio::test]
async fn test_query_variants_are_cached_separately() {
    let (addr, target) = spawn_target().await;
    let gw = start_gateway(addr).await;

    let a = gw.get("/test-cache?page=1").send().await.unwrap();
    assert_eq!(header(&a, "x-cache"), Some("MISS"));
    let b = gw.get("/test-cache?page=2").send().await.unwrap();
    assert_eq!(header(&b, "x-cache"), Some("MISS"));
    let c = gw.get("/test-cache?page=1").send().await.unwrap();
    assert_eq!(header(&c, "x-cache"), Some("HIT"));

    assert_eq!(target.hits(), 2);
    gw.stop().await;
}

#[tokio::test]
async fn test_error_responses_are_not_cached() {
    let (addr, target) = spawn_target().await;
    let gw = start_gateway(addr).await;

    for _ in 0..2 {
        let response = gw.get("/api/users/missing").send().await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(header(&response, "x-cache"), Some("MISS"));
    }
    assert_eq!(target.hits(), 2);

    gw.stop().await;
}

#[tokio::test]
async fn test_post_invalidates_cached_path() {
    let (addr, target) = spawn_target().await;
    let gw = start_gateway(addr).await;

    gw.get("/test-cache/items").send().await.unwrap();
    gw.get("/test-cache/items?sort=asc").send().await.unwrap();
    gw.get("/test-cache/items/7").send().await.unwrap();
    gw.get("/test-cache/items2").send().await.unwrap();
    let hit = gw.get("/test-cache/items").send().await.unwrap();
    assert_eq!(header(&hit, "x-cache"), Some("HIT"));

    let post = gw
        .request(reqwest::Method::POST, "/test-cache/items")
        .body(r#"{"name":"widget"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(post.status(), StatusCode::OK);
    assert_eq!(header(&post, "x-cache"), Some("BYPASS"));

    for path in ["/test-cache/items", "/test-cache/items?sort=asc", "/test-cache/items/7"] {
        let after = gw.get(path).send().await.unwrap();
        assert_eq!(header(&after, "x-cache"), Some("MISS"), "{path}");
    }
    // Sibling path sharing a textual prefix is untouched
    let sibling = gw.get("/test-cache/items2").send().await.unwrap();
    assert_eq!(header(&sibling, "x-cache"), Some("HIT"));

    // The POST body reached the target with a defaulted content type
    let posted = target
        .seen()
        .into_iter()
        .find(|s| s.method == "POST")
        .unwrap();
    assert_eq!(posted.body, Bytes::from_static(br#"{"name":"widget"}"#));
    assert_eq!(posted.headers["content-type"], "application/json");

    gw.stop().await;
}

// ============================================================================
// Rate limiting
// ============================================================================

#[tokio::test]
async fn test_sliding_window_admits_exactly_the_limit() {
    let (addr, _target) = spawn_target().await;
    let gw = start_gateway(addr).await;

    let mut statuses = Vec::new();
    for i in 0..6 {
        let response = gw
            .http
            .get(format!("{}/api/users/{i}", gw.base))
            .header("x-api-key", LIMITED_KEY)
            .send()
            .await
            .unwrap();
        assert_eq!(header(&response, "x-ratelimit-limit"), Some("5"));
        assert!(header(&response, "x-ratelimit-reset").is_some_and(|r| r.ends_with('Z')));
        if i == 0 {
            assert_eq!(header(&response, "x-ratelimit-remaining"), Some("4"));
        }
        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            assert_eq!(header(&response, "x-ratelimit-remaining"), Some("0"));
            let retry_after: u64 = header(&response, "retry-after").unwrap().parse().unwrap();
            assert!((1..=60).contains(&retry_after));
        }
        statuses.push(response.status());
    }

    let admitted = statuses.iter().filter(|s| **s == StatusCode::OK).count();
    assert_eq!(admitted, 5);
    assert_eq!(statuses[5], StatusCode::TOO_MANY_REQUESTS);

    // Other clients keep their own window
    let other = gw.get("/api/users/other").send().await.unwrap();
    assert_eq!(other.status(), StatusCode::OK);

    let records = gw.wait_for_logs(7).await;
    let rejected = records_for(&records, "/api/users/5");
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].status_code, 429);
    assert_eq!(rejected[0].client_id, "limited");

    gw.stop().await;
}

// ============================================================================
// Forwarding
// ============================================================================

#[tokio::test]
async fn test_hop_by_hop_headers_are_not_forwarded() {
    let (addr, target) = spawn_target().await;
    let gw = start_gateway(addr).await;

    let response = gw
        .get("/api/users/headers")
        .header("connection", "keep-alive")
        .header("host", "original")
        .header("x-custom", "kept")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let seen = target.seen();
    assert_eq!(seen.len(), 1);
    let headers = &seen[0].headers;
    assert_ne!(
        headers.get("connection").and_then(|v| v.to_str().ok()),
        Some("keep-alive")
    );
    assert_ne!(headers["host"], "original");
    assert_eq!(headers["x-custom"], "kept");
    assert!(headers.contains_key("x-request-id"));

    gw.stop().await;
}

#[tokio::test]
async fn test_chunked_upstream_is_relayed_without_transfer_encoding() {
    let (addr, _target) = spawn_target().await;
    let gw = start_gateway(addr).await;

    let response = gw.get("/stream/data").send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("transfer-encoding").is_none());
    assert_eq!(header(&response, "x-upstream"), Some("yes"));
    assert_eq!(response.text().await.unwrap(), "chunk-1,chunk-2");

    gw.stop().await;
}

#[tokio::test]
async fn test_longest_prefix_and_path_composition() {
    let (addr, target) = spawn_target().await;
    let gw = start_gateway(addr).await;

    gw.get("/api/users/42?fields=name").send().await.unwrap();
    gw.get("/svc/v1/items?a=1").send().await.unwrap();
    gw.get("/svc").send().await.unwrap();

    let seen = target.seen();
    assert_eq!(seen[0].path, "/api/users/42");
    assert_eq!(seen[0].query.as_deref(), Some("fields=name"));
    assert_eq!(seen[1].path, "/internal/v1/items");
    assert_eq!(seen[1].query.as_deref(), Some("a=1"));
    assert_eq!(seen[2].path, "/internal/");

    let records = gw.wait_for_logs(3).await;
    let users = records_for(&records, "/api/users/42");
    assert_eq!(users[0].route_id.as_deref(), Some("users"));

    gw.stop().await;
}

#[tokio::test]
async fn test_method_not_allowed_is_logged() {
    let (addr, target) = spawn_target().await;
    let gw = start_gateway(addr).await;

    let response = gw
        .request(reqwest::Method::PUT, "/readonly/thing")
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(target.hits(), 0);

    let records = gw.wait_for_logs(1).await;
    let logged = records_for(&records, "/readonly/thing");
    assert_eq!(logged.len(), 1);
    assert_eq!(logged[0].status_code, 405);
    assert_eq!(logged[0].method, "PUT");
    assert_eq!(logged[0].route_id.as_deref(), Some("readonly"));

    gw.stop().await;
}

#[tokio::test]
async fn test_unreachable_target_is_bad_gateway() {
    let (addr, _target) = spawn_target().await;
    let gw = start_gateway(addr).await;

    let response = gw.get("/dead/end").send().await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["message"], "Bad Gateway - Target service unavailable");

    gw.stop().await;
}

// ============================================================================
// Authentication
// ============================================================================

#[tokio::test]
async fn test_authentication_failures() {
    let (addr, target) = spawn_target().await;
    let gw = start_gateway(addr).await;

    let missing = gw
        .http
        .get(format!("{}/api/users/probe", gw.base))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);
    let body: Value = missing.json().await.unwrap();
    assert_eq!(body["message"], "API key missing");

    let invalid = gw
        .http
        .get(format!("{}/api/users/probe", gw.base))
        .header("x-api-key", "gw_live_unknown")
        .send()
        .await
        .unwrap();
    assert_eq!(invalid.status(), StatusCode::UNAUTHORIZED);

    let revoked = gw
        .http
        .get(format!("{}/api/users/revoked", gw.base))
        .header("x-api-key", REVOKED_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(revoked.status(), StatusCode::FORBIDDEN);
    assert_eq!(target.hits(), 0);

    let records = gw.wait_for_logs(1).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].client_id, "revoked");
    assert_eq!(records[0].status_code, 403);
    assert!(records_for(&records, "/api/users/probe").is_empty());

    gw.stop().await;
}

// ============================================================================
// Traffic logging
// ============================================================================

#[tokio::test]
async fn test_every_outcome_is_logged_exactly_once() {
    let (addr, _target) = spawn_target().await;
    let gw = start_gateway(addr).await;

    let ok = gw
        .get("/api/users/once")
        .header("user-agent", "gateway-tests")
        .send()
        .await
        .unwrap();
    assert_eq!(ok.status(), StatusCode::OK);
    let not_found = gw.get("/nowhere/once").send().await.unwrap();
    assert_eq!(not_found.status(), StatusCode::NOT_FOUND);
    let bad_gateway = gw.get("/dead/once").send().await.unwrap();
    assert_eq!(bad_gateway.status(), StatusCode::BAD_GATEWAY);

    gw.wait_for_logs(3).await;
    // Give a duplicate a chance to show up
    tokio::time::sleep(Duration::from_millis(100)).await;
    let records = gw.logs.records();
    assert_eq!(records.len(), 3);

    let ok = records_for(&records, "/api/users/once");
    assert_eq!(ok.len(), 1);
    assert_eq!(ok[0].status_code, 200);
    assert_eq!(ok[0].client_id, "acme");
    assert_eq!(ok[0].user_agent.as_deref(), Some("gateway-tests"));
    assert_eq!(ok[0].ip.as_deref(), Some("127.0.0.1"));

    let not_found = records_for(&records, "/nowhere/once");
    assert_eq!(not_found.len(), 1);
    assert_eq!(not_found[0].status_code, 404);
    assert_eq!(not_found[0].route_id, None);

    let bad_gateway = records_for(&records, "/dead/once");
    assert_eq!(bad_gateway.len(), 1);
    assert_eq!(bad_gateway[0].status_code, 502);
    assert_eq!(bad_gateway[0].route_id.as_deref(), Some("dead"));

    gw.stop().await;
}

// ============================================================================
// Administrative API
// ============================================================================

#[tokio::test]
async fn test_admin_cache_clear_and_stats() {
    let (addr, _target) = spawn_target().await;
    let gw = start_gateway(addr).await;

    gw.get("/test-cache/a").send().await.unwrap();
    gw.get("/test-cache/b").send().await.unwrap();
    gw.get("/api/users/1").send().await.unwrap();

    let cleared: Value = gw
        .admin(reqwest::Method::POST, "/api/cache/clear")
        .json(&json!({ "prefix": "cache:GET:/test-cache" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(cleared["message"], "Cache cleared successfully");
    assert_eq!(cleared["deletedKeys"], 2);

    let after = gw.get("/test-cache/a").send().await.unwrap();
    assert_eq!(header(&after, "x-cache"), Some("MISS"));
    let kept = gw.get("/api/users/1").send().await.unwrap();
    assert_eq!(header(&kept, "x-cache"), Some("HIT"));

    let stats: Value = gw
        .admin(reqwest::Method::GET, "/api/cache/stats")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["enabled"], true);
    assert_eq!(stats["hits"], 1);
    assert_eq!(stats["misses"], 4);
    assert_eq!(stats["invalidated"], 2);

    let unauthorized = gw
        .http
        .post(format!("{}/api/cache/clear", gw.base))
        .json(&json!({ "prefix": "cache:" }))
        .send()
        .await
        .unwrap();
    assert_eq!(unauthorized.status(), StatusCode::UNAUTHORIZED);

    gw.stop().await;
}

#[tokio::test]
async fn test_admin_queue_inspection() {
    let (addr, _target) = spawn_target().await;
    let gw = start_gateway(addr).await;

    gw.get("/api/users/queued").send().await.unwrap();
    gw.wait_for_logs(1).await;

    let status: Value = gw
        .admin(reqwest::Method::GET, "/api/logs/queue")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["counts"]["failed"], 0);
    assert_eq!(status["failed"], json!([]));

    gw.stop().await;
}

#[tokio::test]
async fn test_health() {
    let (addr, _target) = spawn_target().await;
    let gw = start_gateway(addr).await;

    let response = gw
        .http
        .get(format!("{}/health", gw.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "OK");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));

    gw.stop().await;
}
