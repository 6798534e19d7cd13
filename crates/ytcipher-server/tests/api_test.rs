//! End-to-end API tests driven through the router with a Boa-backed pool
//! and a pre-seeded player cache.

use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use http_body_util::BodyExt;
use hyper::body::Bytes;
use hyper::{Method, Response, StatusCode};
use serde_json::{json, Value};

use ytcipher_common::player_url::{cache_key, KeyMode};
use ytcipher_common::AuthConfig;
use ytcipher_metrics::PrometheusHandle;
use ytcipher_server::http_server::route;
use ytcipher_server::player_cache::PlayerFileCache;
use ytcipher_server::pool::{PoolConfig, WorkerPool};
use ytcipher_server::runtime::BoaPreprocessor;
use ytcipher_server::{AppState, CacheSizes, SolverOrchestrator};

const PLAYER_URL: &str = "https://www.youtube.com/s/player/abcd1234/player.js";

/// A player whose prepared form (identity preprocessing) defines the stub
/// solvers: sig = reverse, n = append "!".
const STUB_PLAYER: &str = r#"
function decryptSignature(sig) { return sig.split('').reverse().join(''); }
function decryptNSignature(n) { return n + "!"; }
var config = { signatureTimestamp:19834 };
"#;

const IDENTITY_BUNDLE: &str = "function preprocess(src) { return src; }";

fn metrics_handle() -> PrometheusHandle {
    static METRICS: OnceLock<PrometheusHandle> = OnceLock::new();
    METRICS.get_or_init(ytcipher_metrics::init_metrics).clone()
}

fn seed_player(cache_dir: &Path, player_url: &str, content: &str) {
    let key = cache_key(player_url, KeyMode::RegionAware);
    std::fs::write(cache_dir.join(format!("{key}.js")), content).unwrap();
}

fn test_state(cache_dir: &Path, auth: AuthConfig) -> AppState {
    let pool = WorkerPool::new(
        PoolConfig {
            concurrency: 1,
            max_task_age: Duration::from_secs(10),
            in_flight_timeout: Duration::from_secs(10),
            ..PoolConfig::default()
        },
        BoaPreprocessor::factory(Arc::from(IDENTITY_BUNDLE)),
    );
    let player_cache =
        PlayerFileCache::new(cache_dir.to_path_buf(), KeyMode::RegionAware).unwrap();
    player_cache.sweep().unwrap();

    AppState {
        auth,
        orchestrator: SolverOrchestrator::new(pool, player_cache, CacheSizes::default()),
        metrics: metrics_handle(),
    }
}

async fn post(
    state: &AppState,
    path: &str,
    auth: Option<&str>,
    body: Value,
) -> Response<http_body_util::Full<Bytes>> {
    route(
        state,
        &Method::POST,
        path,
        auth,
        Bytes::from(body.to_string()),
    )
    .await
}

async fn json_body(response: Response<http_body_util::Full<Bytes>>) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_decrypt_signature_with_stub_solvers() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path(), AuthConfig::disabled());
    seed_player(dir.path(), PLAYER_URL, STUB_PLAYER);

    let response = post(
        &state,
        "/decrypt_signature",
        None,
        json!({
            "encrypted_signature": "ABCDE",
            "n_param": "xyz",
            "player_url": PLAYER_URL,
        }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        json_body(response).await,
        json!({"decrypted_signature": "EDCBA", "decrypted_n_sig": "xyz!"})
    );
}

#[tokio::test]
async fn test_decrypt_signature_without_solvers_returns_empty_strings() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path(), AuthConfig::disabled());
    seed_player(dir.path(), PLAYER_URL, "var nothing = true;");

    let response = post(
        &state,
        "/decrypt_signature",
        None,
        json!({"encrypted_signature": "ABCDE", "player_url": PLAYER_URL}),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        json_body(response).await,
        json!({"decrypted_signature": "", "decrypted_n_sig": ""})
    );
}

#[tokio::test]
async fn test_get_sts_and_cache_hit_header() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path(), AuthConfig::disabled());
    seed_player(dir.path(), PLAYER_URL, STUB_PLAYER);

    let body = json!({"player_url": PLAYER_URL});

    let first = post(&state, "/get_sts", None, body.clone()).await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(
        first.headers().get("X-Cache-Hit").unwrap().to_str().unwrap(),
        "false"
    );
    assert_eq!(json_body(first).await, json!({"sts": "19834"}));

    let second = post(&state, "/get_sts", None, body).await;
    assert_eq!(
        second.headers().get("X-Cache-Hit").unwrap().to_str().unwrap(),
        "true"
    );
    assert_eq!(json_body(second).await, json!({"sts": "19834"}));
}

#[tokio::test]
async fn test_get_sts_missing_timestamp_is_404() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path(), AuthConfig::disabled());
    seed_player(dir.path(), PLAYER_URL, "var noTimestampHere = 1;");

    let response = post(&state, "/get_sts", None, json!({"player_url": PLAYER_URL})).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_resolve_url_rewrites_query() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path(), AuthConfig::disabled());
    seed_player(dir.path(), PLAYER_URL, STUB_PLAYER);

    let response = post(
        &state,
        "/resolve_url",
        None,
        json!({
            "stream_url": "https://r.example/vi?s=OLD&n=N0&other=1",
            "player_url": PLAYER_URL,
            "encrypted_signature": "OLD",
            "signature_key": "sig",
            "n_param": null,
        }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        json_body(response).await,
        json!({"resolved_url": "https://r.example/vi?n=N0!&other=1&sig=DLO"})
    );
}

#[tokio::test]
async fn test_resolve_url_requires_sig_solver() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path(), AuthConfig::disabled());
    seed_player(dir.path(), PLAYER_URL, "var solverless = 1;");

    let response = post(
        &state,
        "/resolve_url",
        None,
        json!({
            "stream_url": "https://r.example/vi?s=OLD",
            "player_url": PLAYER_URL,
            "encrypted_signature": "OLD",
        }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = json_body(response).await;
    assert!(body["error"].as_str().unwrap().contains("signature solver"));
}

#[tokio::test]
async fn test_resolve_url_requires_n_param_when_solver_exists() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path(), AuthConfig::disabled());
    seed_player(dir.path(), PLAYER_URL, STUB_PLAYER);

    // No n in the body and none in the stream URL.
    let response = post(
        &state,
        "/resolve_url",
        None,
        json!({
            "stream_url": "https://r.example/vi?other=1",
            "player_url": PLAYER_URL,
        }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_auth_missing_and_invalid_token() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path(), AuthConfig::with_token("secret"));
    seed_player(dir.path(), PLAYER_URL, STUB_PLAYER);

    let body = json!({"player_url": PLAYER_URL});

    let missing = post(&state, "/get_sts", None, body.clone()).await;
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        json_body(missing).await,
        json!({"error": "Missing API token"})
    );

    let wrong = post(&state, "/get_sts", Some("wrong"), body.clone()).await;
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        json_body(wrong).await,
        json!({"error": "Invalid API token"})
    );

    let right = post(&state, "/get_sts", Some("secret"), body).await;
    assert_eq!(right.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_auth_does_not_gate_read_only_routes() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path(), AuthConfig::with_token("secret"));

    for path in ["/", "/swagger.yaml", "/metrics"] {
        let response = route(&state, &Method::GET, path, None, Bytes::new()).await;
        assert_eq!(response.status(), StatusCode::OK, "GET {path}");
    }
}

#[tokio::test]
async fn test_invalid_player_url_is_400() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path(), AuthConfig::disabled());

    let response = post(
        &state,
        "/decrypt_signature",
        None,
        json!({"player_url": "https://evil.example/s/player/x/base.js"}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_malformed_json_and_missing_fields_are_400() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path(), AuthConfig::disabled());

    let garbage = route(
        &state,
        &Method::POST,
        "/get_sts",
        None,
        Bytes::from_static(b"{not json"),
    )
    .await;
    assert_eq!(garbage.status(), StatusCode::BAD_REQUEST);

    let missing = post(&state, "/get_sts", None, json!({})).await;
    assert_eq!(missing.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path(), AuthConfig::disabled());

    let response = route(&state, &Method::GET, "/nope", None, Bytes::new()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(response).await, json!({"error": "not found"}));
}

#[tokio::test]
async fn test_relative_player_url_accepted() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path(), AuthConfig::disabled());
    // The relative path normalizes onto the www host; seed under that key.
    seed_player(
        dir.path(),
        "https://www.youtube.com/s/player/rel123/base.js",
        STUB_PLAYER,
    );

    let response = post(
        &state,
        "/get_sts",
        None,
        json!({"player_url": "/s/player/rel123/base.js"}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
}
