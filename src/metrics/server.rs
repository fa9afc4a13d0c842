//! Prometheus metrics HTTP server.
//!
//! Served on its own address so scraping never goes through the multiplexer.

use crate::metrics::MetricsCollector;
use crate::util::ShutdownSignal;
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus_client::encoding::text::encode;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, instrument};

/// Prometheus metrics HTTP server.
pub struct MetricsServer {
    listener: TcpListener,
    path: Arc<str>,
    collector: MetricsCollector,
}

impl MetricsServer {
    /// Bind the metrics server.
    pub async fn bind(
        address: SocketAddr,
        path: &str,
        collector: MetricsCollector,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        info!(address = %listener.local_addr()?, path = %path, "metrics server bound");

        Ok(Self {
            listener,
            path: Arc::from(path),
            collector,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve scrapes until `shutdown` fires.
    #[instrument(skip_all, name = "metrics")]
    pub async fn run(self, shutdown: ShutdownSignal) {
        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, _addr)) => {
                            let collector = self.collector.clone();
                            let path = Arc::clone(&self.path);

                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let collector = collector.clone();
                                    let path = Arc::clone(&path);
                                    async move { handle_request(req, &collector, &path) }
                                });

                                if let Err(e) = http1::Builder::new()
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(error = %e, "metrics connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept metrics connection");
                        }
                    }
                }

                _ = shutdown.wait() => {
                    info!("metrics server shutting down");
                    break;
                }
            }
        }
    }
}

/// Answer a single scrape request.
fn handle_request<B>(
    req: Request<B>,
    collector: &MetricsCollector,
    metrics_path: &str,
) -> Result<Response<Full<Bytes>>, Infallible> {
    if req.method() != Method::GET {
        return Ok(text_response(
            StatusCode::METHOD_NOT_ALLOWED,
            "text/plain",
            "Method not allowed\n".to_string(),
        ));
    }

    if req.uri().path() != metrics_path {
        return Ok(text_response(
            StatusCode::NOT_FOUND,
            "text/plain",
            "Not found\n".to_string(),
        ));
    }

    let mut buffer = String::new();
    if let Err(e) = encode(&mut buffer, collector.registry()) {
        error!(error = %e, "failed to encode metrics");
        return Ok(text_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "text/plain",
            "Failed to encode metrics\n".to_string(),
        ));
    }

    Ok(text_response(
        StatusCode::OK,
        "text/plain; version=0.0.4; charset=utf-8",
        buffer,
    ))
}

fn text_response(status: StatusCode, content_type: &str, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    if let Ok(value) = content_type.parse() {
        response
            .headers_mut()
            .insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}
