//! HTTP server for the ytcipher service.
//!
//! hyper http1 with hand-rolled routing: the surface is three POST
//! operations plus a handful of static GETs, which does not justify a
//! router dependency. Each connection gets its own tokio task; request
//! handling itself never blocks on workers (the pool returns futures).
//!
//! Auth applies to the POST operations only; the homepage, the API
//! description, and the metrics exposition stay open.

use std::sync::Arc;
use std::time::Instant;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{header, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;

use ytcipher_common::{AuthConfig, CipherError};
use ytcipher_metrics::PrometheusHandle;

use crate::handlers;
use crate::orchestrator::SolverOrchestrator;

/// Maximum request body size (1 MiB). Request bodies are tiny JSON
/// envelopes; anything bigger is abuse.
const MAX_BODY_SIZE: usize = 1024 * 1024;

const HOMEPAGE: &str = include_str!("../assets/index.html");
const SWAGGER: &str = include_str!("../assets/swagger.yaml");

/// Everything request handling needs, shared across connections.
pub struct AppState {
    pub auth: AuthConfig,
    pub orchestrator: SolverOrchestrator,
    pub metrics: PrometheusHandle,
}

pub struct HttpServer {
    state: Arc<AppState>,
}

impl HttpServer {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Runs the accept loop forever.
    ///
    /// # Errors
    ///
    /// Returns an error when binding or accepting fails; individual
    /// connection failures are logged and do not stop the server.
    pub async fn run(self, addr: std::net::SocketAddr) -> Result<(), CipherError> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("HTTP server listening on {}", listener.local_addr()?);

        loop {
            let (stream, _) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let state = self.state.clone();

            tokio::task::spawn(async move {
                let service = service_fn(move |req| {
                    let state = state.clone();
                    async move { handle_request(state, req).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    tracing::debug!("error serving connection: {}", err);
                }
            });
        }
    }
}

async fn handle_request(
    state: Arc<AppState>,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();

    ytcipher_metrics::record_http_request(method.as_str(), &path);

    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let response = match req.into_body().collect().await {
        Ok(collected) => {
            let body = collected.to_bytes();
            if body.len() > MAX_BODY_SIZE {
                error_response(StatusCode::BAD_REQUEST, "request body too large")
            } else {
                route(&state, &method, &path, auth_header.as_deref(), body).await
            }
        }
        Err(e) => {
            tracing::debug!("failed to read request body: {}", e);
            error_response(StatusCode::BAD_REQUEST, "failed to read request body")
        }
    };

    ytcipher_metrics::record_http_response(
        method.as_str(),
        &path,
        response.status().as_u16(),
        start.elapsed().as_secs_f64(),
    );

    Ok(response)
}

/// Dispatches one request. Split from the hyper plumbing so tests can drive
/// it with plain values.
pub async fn route(
    state: &AppState,
    method: &Method,
    path: &str,
    auth_header: Option<&str>,
    body: Bytes,
) -> Response<Full<Bytes>> {
    match (method, path) {
        (&Method::GET, "/") => content_response("text/html; charset=utf-8", HOMEPAGE),
        (&Method::GET, "/swagger.yaml") => content_response("application/yaml", SWAGGER),
        (&Method::GET, "/metrics") => {
            content_response("text/plain; version=0.0.4", &state.metrics.render())
        }
        (&Method::POST, "/decrypt_signature") => {
            with_auth_and_body(state, auth_header, &body, |req| async move {
                handlers::decrypt_signature(&state.orchestrator, req)
                    .await
                    .map(|resp| json_response(StatusCode::OK, &resp))
            })
            .await
        }
        (&Method::POST, "/get_sts") => {
            with_auth_and_body(state, auth_header, &body, |req| async move {
                let (resp, cache_hit) = handlers::get_sts(&state.orchestrator, req).await?;
                let mut response = json_response(StatusCode::OK, &resp);
                if let Ok(value) = cache_hit.to_string().parse() {
                    response.headers_mut().insert("X-Cache-Hit", value);
                }
                Ok(response)
            })
            .await
        }
        (&Method::POST, "/resolve_url") => {
            with_auth_and_body(state, auth_header, &body, |req| async move {
                handlers::resolve_url(&state.orchestrator, req)
                    .await
                    .map(|resp| json_response(StatusCode::OK, &resp))
            })
            .await
        }
        _ => error_response(StatusCode::NOT_FOUND, "not found"),
    }
}

/// Auth check, JSON body parse, then the operation; every failure becomes
/// the matching error envelope.
async fn with_auth_and_body<T, F, Fut>(
    state: &AppState,
    auth_header: Option<&str>,
    body: &Bytes,
    op: F,
) -> Response<Full<Bytes>>
where
    T: DeserializeOwned,
    F: FnOnce(T) -> Fut,
    Fut: std::future::Future<Output = Result<Response<Full<Bytes>>, CipherError>>,
{
    if let Err(e) = state.auth.check(auth_header) {
        return cipher_error_response(&e);
    }

    let req: T = match serde_json::from_slice(body) {
        Ok(req) => req,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                &format!("invalid request body: {e}"),
            )
        }
    };

    match op(req).await {
        Ok(response) => response,
        Err(e) => cipher_error_response(&e),
    }
}

fn cipher_error_response(error: &CipherError) -> Response<Full<Bytes>> {
    let status =
        StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        tracing::warn!(error = %error, "request failed");
    }
    error_response(status, &error.to_string())
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json_response(status, &json!({ "error": message }))
}

fn json_response(status: StatusCode, body: &impl Serialize) -> Response<Full<Bytes>> {
    let bytes = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(bytes)))
        .expect("static response parts are valid")
}

fn content_response(content_type: &str, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .body(Full::new(Bytes::from(body.to_owned())))
        .expect("static response parts are valid")
}
