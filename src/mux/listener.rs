//! The multiplexing listener.
//!
//! Owns the real TCP listener, accepts connections, and classifies each one
//! on its own task by running the registered matchers in registration order.
//! The first matcher to say yes wins and the connection, sniffed bytes
//! included, is queued on that matcher's virtual listener.

use crate::config::MuxConfig;
use crate::metrics::MetricsCollector;
use crate::mux::error::{ClassificationFailure, MuxError, SniffError};
use crate::mux::matcher::{Match, Matcher};
use crate::mux::sniff::SniffedStream;
use crate::mux::virtual_listener::{self, Connection, ConnectionInfo, VirtualListener, VirtualSender};
use crate::util::{ConnectionId, ShutdownSignal};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, instrument, warn};

/// One registered protocol.
struct Route {
    protocol: Arc<str>,
    matcher: Box<dyn Matcher>,
    sender: VirtualSender,
}

/// Mutable state, frozen once `serve` starts.
struct Registry {
    listener: Option<TcpListener>,
    routes: Vec<Route>,
    closers: Vec<ShutdownSignal>,
    started: bool,
}

/// Accepts on one real listener and fans connections out by protocol.
pub struct MuxListener {
    registry: Mutex<Registry>,
    shutdown: ShutdownSignal,
    local_addr: SocketAddr,
    config: MuxConfig,
    metrics: MetricsCollector,
}

impl MuxListener {
    /// Bind the real listener.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(addr: SocketAddr, config: MuxConfig, metrics: MetricsCollector) -> io::Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(i32::try_from(config.backlog).unwrap_or(i32::MAX))?;

        let listener = TcpListener::from_std(socket.into())?;
        Self::new(listener, config, metrics)
    }

    /// Wrap an already bound listener.
    pub fn new(listener: TcpListener, config: MuxConfig, metrics: MetricsCollector) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "mux listener bound");

        Ok(Self {
            registry: Mutex::new(Registry {
                listener: Some(listener),
                routes: Vec::new(),
                closers: Vec::new(),
                started: false,
            }),
            shutdown: ShutdownSignal::new(),
            local_addr,
            config,
            metrics,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Append a matcher and return the virtual listener it feeds.
    ///
    /// Matchers run in the order they were registered. Nothing may be
    /// registered after a catch-all, or once `serve` has started.
    pub fn register(
        &self,
        protocol: &str,
        matcher: impl Matcher,
    ) -> Result<VirtualListener, MuxError> {
        let mut registry = self.registry.lock();
        if registry.started {
            return Err(MuxError::AlreadyStarted);
        }
        if self.shutdown.is_shutdown() {
            return Err(MuxError::Closed);
        }
        if let Some(catch_all) = registry.routes.iter().find(|r| r.matcher.is_catch_all()) {
            return Err(MuxError::CatchAllNotLast {
                catch_all: catch_all.protocol.to_string(),
                rejected: protocol.to_string(),
            });
        }

        let protocol: Arc<str> = Arc::from(protocol);
        let (sender, listener) = virtual_listener::channel(
            Arc::clone(&protocol),
            self.config.queue_capacity,
            self.local_addr,
        );

        debug!(
            protocol = %protocol,
            matcher = matcher.name(),
            position = registry.routes.len(),
            "matcher registered"
        );

        registry.closers.push(sender.close_signal());
        registry.routes.push(Route {
            protocol,
            matcher: Box::new(matcher),
            sender,
        });

        Ok(listener)
    }

    /// Run the accept loop until `close` is called or accept keeps failing.
    ///
    /// Each accepted connection is classified on its own task, so the loop
    /// never waits on a slow client. Closes the mux on return.
    #[instrument(skip_all, fields(address = %self.local_addr))]
    pub async fn serve(&self) -> Result<(), MuxError> {
        let (listener, classifier) = {
            let mut registry = self.registry.lock();
            if registry.started {
                return Err(MuxError::AlreadyStarted);
            }
            let Some(listener) = registry.listener.take() else {
                return Err(MuxError::Closed);
            };
            registry.started = true;

            let routes: Arc<[Route]> = std::mem::take(&mut registry.routes).into();
            if !routes.iter().any(|r| r.matcher.is_catch_all()) {
                warn!("no catch-all matcher registered; unmatched connections will be closed");
            }

            let classifier = Arc::new(Classifier {
                routes,
                sniff_timeout: self.config.sniff_timeout,
                max_sniff_bytes: self.config.max_sniff_bytes,
                local_addr: self.local_addr,
                metrics: self.metrics.clone(),
            });
            (listener, classifier)
        };

        info!(protocols = classifier.routes.len(), "mux serving");

        let mut failures: u32 = 0;
        let result = loop {
            let accepted = tokio::select! {
                biased;
                _ = self.shutdown.wait() => break Ok(()),
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    failures = 0;
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!(peer = %peer, error = %e, "failed to set TCP_NODELAY");
                    }
                    self.metrics.connection_accepted();
                    self.spawn_classification(&classifier, stream, peer);
                }
                Err(e) => {
                    failures += 1;
                    self.metrics.accept_failed();
                    if failures > self.config.accept_retries {
                        error!(error = %e, attempts = failures, "accept keeps failing, giving up");
                        break Err(MuxError::Accept {
                            attempts: failures,
                            source: e,
                        });
                    }

                    warn!(error = %e, attempt = failures, "accept failed, retrying");
                    tokio::select! {
                        _ = self.shutdown.wait() => break Ok(()),
                        _ = tokio::time::sleep(self.config.accept_backoff) => {}
                    }
                }
            }
        };

        drop(listener);
        self.close();
        result
    }

    fn spawn_classification(&self, classifier: &Arc<Classifier>, stream: TcpStream, peer: SocketAddr) {
        let classifier = Arc::clone(classifier);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.wait() => {
                    debug!(peer = %peer, "mux closed during classification");
                }
                _ = classifier.classify(stream, peer) => {}
            }
        });
    }

    /// Stop accepting and close every virtual listener. Idempotent.
    pub fn close(&self) {
        if !self.shutdown.shutdown() {
            return;
        }

        let mut registry = self.registry.lock();
        registry.listener.take();
        for closer in &registry.closers {
            closer.shutdown();
        }
        info!(address = %self.local_addr, "mux closed");
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_shutdown()
    }
}

/// Frozen routing table shared by classification tasks.
struct Classifier {
    routes: Arc<[Route]>,
    sniff_timeout: Duration,
    max_sniff_bytes: usize,
    local_addr: SocketAddr,
    metrics: MetricsCollector,
}

impl Classifier {
    async fn classify(&self, stream: TcpStream, peer: SocketAddr) {
        let id = ConnectionId::next();
        let mut sniffer = SniffedStream::with_limit(stream, self.max_sniff_bytes);
        let mut replied = false;

        for route in self.routes.iter() {
            let matcher = route.matcher.as_ref();
            let replied_before = replied;
            if !evaluate(matcher, &mut sniffer, &mut replied, self.sniff_timeout, &id).await {
                continue;
            }
            if replied && !replied_before {
                self.settle_reply(matcher, &mut sniffer, &id).await;
            }

            debug!(
                conn = %id,
                peer = %peer,
                protocol = %route.protocol,
                sniffed = sniffer.buffered().len(),
                "connection classified"
            );

            let info = ConnectionInfo {
                id: id.clone(),
                peer_addr: peer,
                local_addr: self.local_addr,
                protocol: Arc::clone(&route.protocol),
            };
            let protocol = Arc::clone(&route.protocol);
            match route.sender.deliver(Connection::new(sniffer, info)).await {
                Ok(()) => self.metrics.connection_routed(&protocol),
                Err(e) => {
                    self.metrics.connection_dropped(&protocol);
                    warn!(
                        conn = %id,
                        peer = %peer,
                        protocol = %protocol,
                        error = %e,
                        "protocol listener gone, dropping connection"
                    );
                }
            }
            return;
        }

        let failure = ClassificationFailure {
            peer,
            buffered: sniffer.buffered().len(),
        };
        self.metrics.classification_failed();
        warn!(conn = %id, error = %failure, "closing unclassified connection");
        drop(sniffer);
    }

    /// Drop the client's answer to the matcher's reply from the buffer,
    /// reading on until it arrives or the sniff timeout passes.
    async fn settle_reply(
        &self,
        matcher: &dyn Matcher,
        sniffer: &mut SniffedStream<TcpStream>,
        id: &ConnectionId,
    ) {
        let settle = async {
            loop {
                if let Some(range) = matcher.reply_answer(sniffer.buffered()) {
                    sniffer.discard(range);
                    return Ok::<(), SniffError>(());
                }
                let wanted = sniffer.buffered().len() + 1;
                sniffer.peek(wanted).await?;
            }
        };

        match tokio::time::timeout(self.sniff_timeout, settle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(conn = %id, matcher = matcher.name(), error = %e, "reply answer not seen");
            }
            Err(_) => {
                debug!(conn = %id, matcher = matcher.name(), "timed out waiting for reply answer");
            }
        }
    }
}

/// Run one matcher to a decision. Errors and timeouts count as no match.
async fn evaluate(
    matcher: &dyn Matcher,
    sniffer: &mut SniffedStream<TcpStream>,
    replied: &mut bool,
    timeout: Duration,
    id: &ConnectionId,
) -> bool {
    match tokio::time::timeout(timeout, decide(matcher, sniffer, replied)).await {
        Ok(Ok(matched)) => matched,
        Ok(Err(e)) => {
            debug!(conn = %id, matcher = matcher.name(), error = %e, "sniff failed, treating as no match");
            false
        }
        Err(_) => {
            debug!(conn = %id, matcher = matcher.name(), "matcher timed out waiting for bytes");
            false
        }
    }
}

async fn decide(
    matcher: &dyn Matcher,
    sniffer: &mut SniffedStream<TcpStream>,
    replied: &mut bool,
) -> Result<bool, SniffError> {
    loop {
        match matcher.matches(sniffer.buffered()) {
            Match::Yes => return Ok(true),
            Match::No => return Ok(false),
            Match::Incomplete => {
                if !*replied {
                    if let Some(reply) = matcher.reply(sniffer.buffered()) {
                        sniffer.write_all(reply).await?;
                        sniffer.flush().await?;
                        *replied = true;
                    }
                }
                let wanted = sniffer.buffered().len() + 1;
                sniffer.peek(wanted).await?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::matcher::tests::{frame, header_block, http2_request};
    use crate::mux::matcher::{HTTP2_PREFACE, HTTP2_SERVER_SETTINGS};
    use crate::mux::matcher::{Any, Http1, Http2HeaderField, Prefix};
    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_config() -> MuxConfig {
        MuxConfig {
            sniff_timeout: Duration::from_secs(2),
            ..MuxConfig::default()
        }
    }

    fn bind_mux() -> Arc<MuxListener> {
        Arc::new(
            MuxListener::bind(
                "127.0.0.1:0".parse().unwrap(),
                test_config(),
                MetricsCollector::new(),
            )
            .unwrap(),
        )
    }

    fn spawn_serve(mux: &Arc<MuxListener>) -> tokio::task::JoinHandle<Result<(), MuxError>> {
        let mux = Arc::clone(mux);
        tokio::spawn(async move { mux.serve().await })
    }

    async fn accept_within(listener: &mut VirtualListener) -> Connection {
        tokio::time::timeout(Duration::from_secs(3), listener.accept())
            .await
            .expect("connection was not delivered in time")
            .unwrap()
    }

    async fn read_exactly(conn: &mut Connection, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        conn.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_grpc_and_http_routed_by_content() {
        let mux = bind_mux();
        let mut grpc = mux.register("grpc", Http2HeaderField::grpc()).unwrap();
        let mut http = mux.register("http", Any).unwrap();
        let serve = spawn_serve(&mux);

        let request = http2_request("application/grpc");
        let mut grpc_client = TcpStream::connect(mux.local_addr()).await.unwrap();
        grpc_client.write_all(&request).await.unwrap();

        let mut http_client = TcpStream::connect(mux.local_addr()).await.unwrap();
        http_client
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();

        let mut conn = accept_within(&mut grpc).await;
        assert_eq!(conn.protocol(), "grpc");
        assert_eq!(read_exactly(&mut conn, request.len()).await, request);

        let mut conn = accept_within(&mut http).await;
        assert_eq!(conn.protocol(), "http");
        assert_eq!(read_exactly(&mut conn, 14).await, b"GET / HTTP/1.1");

        assert_eq!(mux.metrics.connections_routed_to("grpc"), 1);
        assert_eq!(mux.metrics.connections_routed_to("http"), 1);

        mux.close();
        serve.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_http2_without_grpc_falls_through() {
        let mux = bind_mux();
        let mut grpc = mux.register("grpc", Http2HeaderField::grpc()).unwrap();
        let mut http = mux.register("http", Any).unwrap();
        let serve = spawn_serve(&mux);

        let mut client = TcpStream::connect(mux.local_addr()).await.unwrap();
        client.write_all(&http2_request("application/json")).await.unwrap();

        let conn = accept_within(&mut http).await;
        assert_eq!(conn.protocol(), "http");
        assert!(
            tokio::time::timeout(Duration::from_millis(50), grpc.accept())
                .await
                .is_err()
        );

        mux.close();
        serve.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_first_registered_match_wins() {
        for (first, second, expected) in [("get", "http1", "get"), ("http1", "get", "http1")] {
            let mux = bind_mux();
            let mut listeners = Vec::new();
            for name in [first, second] {
                let listener = match name {
                    "get" => mux.register(name, Prefix::new("get", [Bytes::from_static(b"GET ")])),
                    _ => mux.register(name, Http1),
                };
                listeners.push(listener.unwrap());
            }
            let serve = spawn_serve(&mux);

            let mut client = TcpStream::connect(mux.local_addr()).await.unwrap();
            client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

            let conn = accept_within(&mut listeners[0]).await;
            assert_eq!(conn.protocol(), expected);

            mux.close();
            serve.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_short_read_falls_back_to_catch_all() {
        let mux = bind_mux();
        let _grpc = mux.register("grpc", Http2HeaderField::grpc()).unwrap();
        let mut http = mux.register("http", Any).unwrap();
        let serve = spawn_serve(&mux);

        let mut client = TcpStream::connect(mux.local_addr()).await.unwrap();
        client.write_all(b"PRI * HT").await.unwrap();
        client.shutdown().await.unwrap();

        let mut conn = accept_within(&mut http).await;
        let mut received = Vec::new();
        conn.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"PRI * HT");

        mux.close();
        serve.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unmatched_connection_is_closed() {
        let mux = bind_mux();
        let _ssh = mux
            .register("ssh", Prefix::new("ssh", [Bytes::from_static(b"SSH-")]))
            .unwrap();
        let serve = spawn_serve(&mux);

        let mut client = TcpStream::connect(mux.local_addr()).await.unwrap();
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_secs(3), client.read(&mut buf))
            .await
            .expect("unmatched connection should be closed");
        assert!(matches!(read, Ok(0) | Err(_)));
        assert_eq!(mux.metrics.classification_failures(), 1);

        mux.close();
        serve.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_slow_client_does_not_block_others() {
        let mux = bind_mux();
        let _grpc = mux.register("grpc", Http2HeaderField::grpc()).unwrap();
        let mut http = mux.register("http", Any).unwrap();
        let serve = spawn_serve(&mux);

        // Sends nothing, so the gRPC matcher waits on it until the timeout.
        let _silent = TcpStream::connect(mux.local_addr()).await.unwrap();

        let mut client = TcpStream::connect(mux.local_addr()).await.unwrap();
        client.write_all(b"GET /health HTTP/1.1\r\n\r\n").await.unwrap();

        let conn = tokio::time::timeout(Duration::from_millis(500), http.accept())
            .await
            .expect("second client must be classified while the first stalls")
            .unwrap();
        assert_eq!(conn.protocol(), "http");

        mux.close();
        serve.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_catch_all_must_be_last() {
        let mux = bind_mux();
        mux.register("http", Any).unwrap();

        let err = mux.register("grpc", Http2HeaderField::grpc()).unwrap_err();
        match err {
            MuxError::CatchAllNotLast { catch_all, rejected } => {
                assert_eq!(catch_all, "http");
                assert_eq!(rejected, "grpc");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_register_after_serve_fails() {
        let mux = bind_mux();
        mux.register("http", Any).unwrap();
        let serve = spawn_serve(&mux);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(matches!(
            mux.register("grpc", Http2HeaderField::grpc()),
            Err(MuxError::AlreadyStarted)
        ));

        mux.close();
        serve.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_close_unblocks_virtual_accept() {
        let mux = bind_mux();
        let mut http = mux.register("http", Any).unwrap();
        let serve = spawn_serve(&mux);

        let pending = tokio::spawn(async move { http.accept().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        mux.close();

        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("accept must return once the mux is closed")
            .unwrap();
        assert!(matches!(result, Err(MuxError::Closed)));
        serve.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_stops_accepting() {
        let mux = bind_mux();
        let _http = mux.register("http", Any).unwrap();
        let addr = mux.local_addr();
        let serve = spawn_serve(&mux);
        tokio::time::sleep(Duration::from_millis(20)).await;

        mux.close();
        mux.close();
        serve.await.unwrap().unwrap();
        assert!(mux.is_closed());

        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_serve_after_close_fails() {
        let mux = bind_mux();
        mux.close();
        assert!(matches!(mux.serve().await, Err(MuxError::Closed)));
    }

    #[tokio::test]
    async fn test_truncated_hpack_size_update_falls_back_to_catch_all() {
        let mux = bind_mux();
        let _grpc = mux.register("grpc", Http2HeaderField::grpc()).unwrap();
        let mut http = mux.register("http", Any).unwrap();
        let serve = spawn_serve(&mux);

        let mut request = HTTP2_PREFACE.to_vec();
        request.extend(frame(0x1, 0x4, 1, &[0x3f]));
        let mut client = TcpStream::connect(mux.local_addr()).await.unwrap();
        client.write_all(&request).await.unwrap();

        let conn = accept_within(&mut http).await;
        assert_eq!(conn.protocol(), "http");
        assert_eq!(mux.metrics.connections_routed_to("http"), 1);
        assert_eq!(mux.metrics.classification_failures(), 0);

        mux.close();
        serve.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_settings_sent_to_client_waiting_for_server() {
        let mux = bind_mux();
        let mut grpc = mux
            .register("grpc", Http2HeaderField::grpc().send_settings())
            .unwrap();
        let _http = mux.register("http", Any).unwrap();
        let serve = spawn_serve(&mux);

        let mut opening = HTTP2_PREFACE.to_vec();
        opening.extend(frame(0x4, 0, 0, &[]));
        let mut client = TcpStream::connect(mux.local_addr()).await.unwrap();
        client.write_all(&opening).await.unwrap();

        // The client holds back HEADERS until the server speaks.
        let mut settings = [0u8; 9];
        tokio::time::timeout(Duration::from_secs(1), client.read_exact(&mut settings))
            .await
            .expect("server SETTINGS not sent")
            .unwrap();
        assert_eq!(&settings[..], HTTP2_SERVER_SETTINGS);

        let headers = frame(
            0x1,
            0x4,
            1,
            &header_block(&[(":method", "POST"), ("content-type", "application/grpc")]),
        );
        let mut rest = frame(0x4, 0x1, 0, &[]);
        rest.extend_from_slice(&headers);
        client.write_all(&rest).await.unwrap();

        let mut conn = accept_within(&mut grpc).await;
        assert_eq!(conn.protocol(), "grpc");

        // The ACK answers our SETTINGS, so the gRPC server must not see it.
        let mut expected = opening.clone();
        expected.extend_from_slice(&headers);
        assert_eq!(read_exactly(&mut conn, expected.len()).await, expected);

        mux.close();
        serve.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_settings_not_sent_when_headers_arrive_at_once() {
        let mux = bind_mux();
        let mut grpc = mux
            .register("grpc", Http2HeaderField::grpc().send_settings())
            .unwrap();
        let serve = spawn_serve(&mux);

        let request = http2_request("application/grpc");
        let mut client = TcpStream::connect(mux.local_addr()).await.unwrap();
        client.write_all(&request).await.unwrap();

        let mut conn = accept_within(&mut grpc).await;
        assert_eq!(read_exactly(&mut conn, request.len()).await, request);

        mux.close();
        serve.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_delivery_to_dropped_listener_is_counted() {
        let mux = bind_mux();
        drop(mux.register("http", Any).unwrap());
        let serve = spawn_serve(&mux);

        let mut client = TcpStream::connect(mux.local_addr()).await.unwrap();
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        let counted = tokio::time::timeout(Duration::from_secs(3), async {
            while mux.metrics.connections_dropped_for("http") == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(counted.is_ok(), "dropped delivery was not counted");
        assert_eq!(mux.metrics.connections_routed_to("http"), 0);

        mux.close();
        serve.await.unwrap().unwrap();
    }
}
