//! Upstream client behind `/proxy`.
//!
//! Forwards a bare `GET` to an absolute `http://` URL and hands the upstream
//! response back unchanged.

use bytes::Bytes;
use http_body_util::Empty;
use hyper::body::Incoming;
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid target '{target}': {reason}")]
    InvalidTarget { target: String, reason: String },

    #[error("unsupported scheme '{0}': only http targets can be proxied")]
    UnsupportedScheme(String),

    #[error("upstream request failed: {0}")]
    Request(#[from] hyper_util::client::legacy::Error),

    #[error("upstream did not respond within {0:?}")]
    Timeout(Duration),
}

/// Pooled HTTP/1.1 client with a per-request deadline.
#[derive(Clone, Debug)]
pub struct Upstream {
    client: Client<HttpConnector, Empty<Bytes>>,
    timeout: Duration,
}

impl Upstream {
    pub fn new(timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.set_connect_timeout(Some(timeout));

        Self {
            client: Client::builder(TokioExecutor::new()).build(connector),
            timeout,
        }
    }

    /// `GET` the target, waiting at most the configured timeout for headers.
    #[instrument(skip(self))]
    pub async fn get(&self, target: &str) -> Result<Response<Incoming>, ProxyError> {
        let uri = parse_target(target)?;
        let request = Request::get(uri)
            .body(Empty::new())
            .map_err(|e| invalid(target, e))?;

        let response = tokio::time::timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| ProxyError::Timeout(self.timeout))??;

        debug!(status = response.status().as_u16(), "upstream responded");
        Ok(response)
    }
}

fn invalid(target: &str, reason: impl ToString) -> ProxyError {
    ProxyError::InvalidTarget {
        target: target.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_target(target: &str) -> Result<Uri, ProxyError> {
    let url = url::Url::parse(target).map_err(|e| invalid(target, e))?;
    if url.scheme() != "http" {
        return Err(ProxyError::UnsupportedScheme(url.scheme().to_string()));
    }
    if url.host_str().is_none() {
        return Err(invalid(target, "missing host"));
    }

    url.as_str().parse().map_err(|e| invalid(target, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_target() {
        let uri = parse_target("http://127.0.0.1:9000/status?x=1").unwrap();
        assert_eq!(uri.host(), Some("127.0.0.1"));
        assert_eq!(uri.port_u16(), Some(9000));
        assert_eq!(uri.path_and_query().unwrap().as_str(), "/status?x=1");
    }

    #[test]
    fn test_parse_target_rejects_other_schemes() {
        assert!(matches!(
            parse_target("https://example.com/"),
            Err(ProxyError::UnsupportedScheme(scheme)) if scheme == "https"
        ));
        assert!(matches!(
            parse_target("not a url"),
            Err(ProxyError::InvalidTarget { .. })
        ));
    }

    #[tokio::test]
    async fn test_get_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            tokio::time::sleep(Duration::from_secs(5)).await;
            let _ = stream.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await;
        });

        let upstream = Upstream::new(Duration::from_millis(100));
        let err = upstream.get(&format!("http://{addr}/")).await.unwrap_err();
        assert!(matches!(err, ProxyError::Timeout(_)));
    }
}
