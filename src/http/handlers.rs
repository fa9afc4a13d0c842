//! HTTP request handlers.

use crate::config::HttpConfig;
use crate::http::proxy::Upstream;
use crate::metrics::MetricsCollector;
use crate::state::AppState;
use crate::util::RequestId;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::{Request, Response, StatusCode, Uri};
use serde_json::json;
use std::time::{Instant, SystemTime};
use tracing::{debug, info, warn};

/// Response body type shared by every handler.
pub type HttpBody = BoxBody<Bytes, hyper::Error>;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Everything a handler may need, cheap to clone per request.
#[derive(Clone)]
pub struct HttpContext {
    state: AppState,
    metrics: MetricsCollector,
    upstream: Upstream,
    config: HttpConfig,
}

impl HttpContext {
    pub fn new(state: AppState, metrics: MetricsCollector, config: HttpConfig) -> Self {
        Self {
            upstream: Upstream::new(config.proxy_timeout),
            state,
            metrics,
            config,
        }
    }
}

/// Route a request by path. Never fails; errors become HTTP responses.
pub async fn handle<B>(req: Request<B>, ctx: HttpContext) -> Response<HttpBody> {
    let start = Instant::now();
    // Handlers never read the body.
    let (parts, _) = req.into_parts();
    let path = parts.uri.path().to_string();
    let request_id = parts
        .headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| RequestId::new().to_string());

    let mut response = match path.as_str() {
        "/health" => health(),
        "/proxy" => proxy(&parts.uri, &ctx).await,
        "/grpc-call" => grpc_call(&parts.uri, &ctx).await,
        _ => json_response(
            StatusCode::OK,
            &json!({
                "message": "Ultra Multiplexer HTTP Server",
                "method": parts.method.as_str(),
                "path": path,
            }),
        ),
    };

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    let status = response.status().as_u16();
    let duration = start.elapsed();
    ctx.metrics.record_request(parts.method.as_str(), status, duration);
    debug!(
        request_id = %request_id,
        method = %parts.method,
        path = %path,
        status,
        duration_ms = duration.as_millis(),
        "request completed"
    );

    response
}

fn health() -> Response<HttpBody> {
    let timestamp = humantime::format_rfc3339_seconds(SystemTime::now()).to_string();
    json_response(
        StatusCode::OK,
        &json!({
            "status": "ok",
            "service": "ultra-multiplexer",
            "timestamp": timestamp,
        }),
    )
}

async fn proxy(uri: &Uri, ctx: &HttpContext) -> Response<HttpBody> {
    let Some(target) = query_param(uri, "target") else {
        return error_response(StatusCode::BAD_REQUEST, "target parameter required");
    };

    match ctx.upstream.get(&target).await {
        Ok(upstream) => {
            info!(target = %target, status = upstream.status().as_u16(), "proxied request");
            let (parts, body) = upstream.into_parts();
            Response::from_parts(parts, body.boxed())
        }
        Err(e) => {
            warn!(target = %target, error = %e, "proxy request failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
    }
}

async fn grpc_call(uri: &Uri, ctx: &HttpContext) -> Response<HttpBody> {
    let client = match ctx.state.grpc_client() {
        Ok(client) => client,
        Err(e) => {
            debug!(phase = %e.phase, "rejecting gRPC call before loop-back client is ready");
            return error_response(StatusCode::SERVICE_UNAVAILABLE, "gRPC client not ready");
        }
    };

    let name = query_param(uri, "name").unwrap_or_else(|| "World".to_string());
    match client.say_hello(&name, ctx.config.grpc_call_timeout).await {
        Ok(message) => json_response(StatusCode::OK, &json!({ "grpc_response": message })),
        Err(status) => {
            warn!(error = %status, "loop-back gRPC call failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("gRPC call failed: {status}"),
            )
        }
    }
}

/// First non-empty value of a query parameter.
fn query_param(uri: &Uri, key: &str) -> Option<String> {
    let query = uri.query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.is_empty())
}

fn full(body: impl Into<Bytes>) -> HttpBody {
    Full::new(body.into())
        .map_err(|never| match never {})
        .boxed()
}

fn json_response(status: StatusCode, value: &serde_json::Value) -> Response<HttpBody> {
    let mut body = value.to_string().into_bytes();
    body.push(b'\n');

    let mut response = Response::new(full(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn error_response(status: StatusCode, message: &str) -> Response<HttpBody> {
    let mut response = Response::new(full(format!("{message}\n")));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Phase;
    use http_body_util::Empty;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn test_context(state: AppState) -> HttpContext {
        let config = HttpConfig {
            proxy_timeout: Duration::from_secs(2),
            ..HttpConfig::default()
        };
        HttpContext::new(state, MetricsCollector::new(), config)
    }

    fn get(uri: &str) -> Request<Empty<Bytes>> {
        Request::get(uri).body(Empty::new()).unwrap()
    }

    async fn body_string(response: Response<HttpBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn body_json(response: Response<HttpBody>) -> serde_json::Value {
        serde_json::from_str(&body_string(response).await).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = handle(get("/health"), test_context(AppState::new())).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
        assert!(response.headers().contains_key(REQUEST_ID_HEADER));

        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "ultra-multiplexer");
        assert!(body["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[tokio::test]
    async fn test_default_handler_echoes_method_and_path() {
        let request = Request::post("/some/where")
            .body(Empty::<Bytes>::new())
            .unwrap();
        let response = handle(request, test_context(AppState::new())).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["message"], "Ultra Multiplexer HTTP Server");
        assert_eq!(body["method"], "POST");
        assert_eq!(body["path"], "/some/where");
    }

    #[tokio::test]
    async fn test_request_id_is_propagated() {
        let request = Request::get("/")
            .header(REQUEST_ID_HEADER, "abc-123")
            .body(Empty::<Bytes>::new())
            .unwrap();
        let response = handle(request, test_context(AppState::new())).await;
        assert_eq!(response.headers()[REQUEST_ID_HEADER], "abc-123");
    }

    #[tokio::test]
    async fn test_grpc_call_before_ready_is_503() {
        let state = AppState::new();
        state.advance(Phase::ListenerBound).unwrap();
        state.advance(Phase::MuxBuilt).unwrap();
        state.advance(Phase::ServersStarted).unwrap();

        let response = handle(get("/grpc-call?name=Ann"), test_context(state)).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_string(response).await, "gRPC client not ready\n");
    }

    #[tokio::test]
    async fn test_proxy_requires_target() {
        let ctx = test_context(AppState::new());
        for uri in ["/proxy", "/proxy?target="] {
            let response = handle(get(uri), ctx.clone()).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            assert_eq!(body_string(response).await, "target parameter required\n");
        }
    }

    #[tokio::test]
    async fn test_proxy_copies_upstream_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let _ = stream
                .write_all(
                    b"HTTP/1.1 201 Created\r\nX-Upstream: yes\r\nContent-Length: 2\r\n\r\nhi",
                )
                .await;
        });

        let target = format!("http://{addr}/thing");
        let uri = format!(
            "/proxy?target={}",
            url::form_urlencoded::byte_serialize(target.as_bytes()).collect::<String>()
        );
        let response = handle(get(&uri), test_context(AppState::new())).await;

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["x-upstream"], "yes");
        assert_eq!(body_string(response).await, "hi");
    }

    #[tokio::test]
    async fn test_proxy_failure_is_500() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let uri = format!("/proxy?target=http://{addr}/");
        let response = handle(get(&uri), test_context(AppState::new())).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_requests_are_counted() {
        let ctx = test_context(AppState::new());
        handle(get("/health"), ctx.clone()).await;
        handle(get("/"), ctx.clone()).await;

        let mut encoded = String::new();
        prometheus_client::encoding::text::encode(&mut encoded, ctx.metrics.registry()).unwrap();
        assert!(encoded.contains("ultramux_http_requests_total{method=\"GET\",status=\"200\"} 2"));
    }
}
