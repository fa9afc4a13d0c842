//! HTTP/1.1 server bound to a virtual listener.

use crate::http::handlers::{HttpContext, handle};
use crate::mux::{Connection, VirtualListener};
use crate::util::ShutdownSignal;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use std::convert::Infallible;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Accepts classified HTTP connections and serves them with hyper.
pub struct HttpServer {
    listener: VirtualListener,
    context: HttpContext,
    header_read_timeout: Duration,
}

impl HttpServer {
    pub fn new(listener: VirtualListener, context: HttpContext, header_read_timeout: Duration) -> Self {
        Self {
            listener,
            context,
            header_read_timeout,
        }
    }

    /// Run until `shutdown` fires or the virtual listener closes.
    ///
    /// In-flight connections are shut down gracefully.
    #[instrument(skip_all, fields(protocol = self.listener.protocol()))]
    pub async fn run(mut self, shutdown: ShutdownSignal) {
        info!(address = %self.listener.local_addr(), "HTTP server starting");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok(conn) => self.handle_connection(conn, shutdown.clone()),
                        Err(e) => {
                            debug!(error = %e, "virtual listener closed");
                            break;
                        }
                    }
                }

                _ = shutdown.wait() => {
                    info!("HTTP server shutting down");
                    break;
                }
            }
        }

        self.listener.close();
        info!("HTTP server stopped");
    }

    fn handle_connection(&self, conn: Connection, shutdown: ShutdownSignal) {
        let context = self.context.clone();
        let header_read_timeout = self.header_read_timeout;
        let peer = conn.peer_addr();
        let conn_id = conn.info().id.clone();

        tokio::spawn(async move {
            let start_time = Instant::now();

            let service = service_fn(move |req| {
                let context = context.clone();
                async move { Ok::<_, Infallible>(handle(req, context).await) }
            });

            let connection = http1::Builder::new()
                .timer(TokioTimer::new())
                .header_read_timeout(header_read_timeout)
                .keep_alive(true)
                .serve_connection(TokioIo::new(conn), service);
            tokio::pin!(connection);

            let result = tokio::select! {
                result = connection.as_mut() => result,
                _ = shutdown.wait() => {
                    connection.as_mut().graceful_shutdown();
                    connection.await
                }
            };

            let duration_ms = start_time.elapsed().as_millis();
            match result {
                Ok(()) => debug!(conn = %conn_id, client = %peer, duration_ms, "connection completed"),
                Err(e) => warn!(
                    conn = %conn_id,
                    client = %peer,
                    duration_ms,
                    error = %e,
                    "connection handling failed"
                ),
            }
        });
    }
}
