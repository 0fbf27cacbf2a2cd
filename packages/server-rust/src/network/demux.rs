//! Connection demultiplexer.
//!
//! Accepts raw TCP connections, reads just enough of each to learn what
//! it speaks, and hands it (with the bytes read so far) to one sub-listener.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use super::preface::{parse_preface, ConnectionPreface, Parse};
use super::stream::{ConnectionClass, MuxedStream};
use crate::service::matcher::{is_grpc_content_type, Matcher};

/// Why a connection could not be classified.
#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("read failed: {0}")]
    Io(#[from] io::Error),
    #[error("no classifiable preface within {0:?}")]
    Timeout(Duration),
    #[error("connection closed before sending any data")]
    EarlyEof,
}

/// Callback invoked for every connection that fails classification.
pub type ConnectionErrorHandler = Arc<dyn Fn(SocketAddr, &ClassifyError) + Send + Sync>;

/// Logs the failure at `debug`; scanners and health checks trip it often.
#[must_use]
pub fn log_connection_error() -> ConnectionErrorHandler {
    Arc::new(|remote, err| debug!(%remote, error = %err, "dropping unclassified connection"))
}

/// Ordered classification rules.
///
/// 1. RPC content type -> RPC
/// 2. gateway content type -> gateway, when a gateway is configured
/// 3. recognizable HTTP/1 request -> HTTP
/// 4. anything else -> HTTP
#[derive(Debug, Clone)]
pub struct Rules {
    gateway: Option<Matcher>,
}

impl Rules {
    #[must_use]
    pub fn new(gateway_enabled: bool) -> Self {
        Self {
            gateway: gateway_enabled.then(Matcher::gateway_content_type),
        }
    }

    /// Picks the destination for a parsed preface. First match wins.
    #[must_use]
    pub fn classify(&self, preface: &ConnectionPreface) -> ConnectionClass {
        if let Some(head) = &preface.head {
            if is_grpc_content_type(&head.headers) {
                return ConnectionClass::Rpc;
            }
            if self.gateway.as_ref().is_some_and(|m| m.matches(head)) {
                return ConnectionClass::Gateway;
            }
        }
        // HTTP/1 fast path and catch-all share a destination.
        ConnectionClass::Http
    }
}

/// Senders feeding each sub-listener.
///
/// `gateway` is `None` when no service registered a gateway; such
/// connections are never produced by [`Rules`] in that case.
#[derive(Clone)]
pub struct Routes {
    pub rpc: mpsc::Sender<MuxedStream>,
    pub gateway: Option<mpsc::Sender<MuxedStream>>,
    pub http: mpsc::Sender<MuxedStream>,
}

impl Routes {
    fn sender(&self, class: ConnectionClass) -> &mpsc::Sender<MuxedStream> {
        match (class, &self.gateway) {
            (ConnectionClass::Rpc, _) => &self.rpc,
            (ConnectionClass::Gateway, Some(gateway)) => gateway,
            (ConnectionClass::Gateway | ConnectionClass::Http, _) => &self.http,
        }
    }
}

impl fmt::Debug for Routes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Routes")
            .field("gateway", &self.gateway.is_some())
            .finish_non_exhaustive()
    }
}

/// Classification limits.
#[derive(Debug, Clone, Copy)]
pub struct DemuxLimits {
    pub classify_timeout: Duration,
    pub max_preface_bytes: usize,
}

/// The accept loop.
pub struct Demultiplexer {
    rules: Rules,
    routes: Routes,
    limits: DemuxLimits,
    on_error: ConnectionErrorHandler,
}

impl Demultiplexer {
    #[must_use]
    pub fn new(
        rules: Rules,
        routes: Routes,
        limits: DemuxLimits,
        on_error: ConnectionErrorHandler,
    ) -> Self {
        Self {
            rules,
            routes,
            limits,
            on_error,
        }
    }

    /// Accepts connections until `shutdown` flips to `true`.
    ///
    /// Each connection is classified in its own task so a slow client
    /// cannot stall the loop. Accept errors are logged and the loop keeps
    /// going; they never end it.
    pub async fn run(self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        let this = Arc::new(self);
        // The watch guard must not outlive the wait, or this future is not Send.
        let stopped = async move {
            let _ = shutdown.wait_for(|stopped| *stopped).await;
        };
        tokio::pin!(stopped);
        loop {
            tokio::select! {
                () = &mut stopped => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let this = Arc::clone(&this);
                        tokio::spawn(async move { this.dispatch(stream, remote).await });
                    }
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        // Back off so fd exhaustion does not spin the loop.
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                },
            }
        }
        debug!("demultiplexer stopped accepting");
    }

    async fn dispatch(&self, mut stream: TcpStream, remote: SocketAddr) {
        let read = tokio::time::timeout(
            self.limits.classify_timeout,
            read_preface(&mut stream, self.limits.max_preface_bytes),
        )
        .await
        .unwrap_or(Err(ClassifyError::Timeout(self.limits.classify_timeout)));

        let (prefix, preface) = match read {
            Ok(read) => read,
            Err(err) => {
                (self.on_error)(remote, &err);
                return;
            }
        };

        let class = self.rules.classify(&preface);
        debug!(%remote, class = class.as_str(), "connection classified");

        let muxed = MuxedStream::new(stream, prefix.freeze(), remote, class);
        if self.routes.sender(class).send(muxed).await.is_err() {
            debug!(%remote, class = class.as_str(), "sub-server gone, dropping connection");
        }
    }
}

/// Reads until the preface parses, the limit is hit, or the peer stops sending.
async fn read_preface(
    stream: &mut TcpStream,
    limit: usize,
) -> Result<(BytesMut, ConnectionPreface), ClassifyError> {
    let mut buf = BytesMut::with_capacity(limit.min(4096));
    loop {
        let full = buf.len() >= limit;
        let eof = !full && {
            // Never read past the limit.
            let remaining = u64::try_from(limit - buf.len()).unwrap_or(u64::MAX);
            let mut chunk = (&mut *stream).take(remaining);
            chunk.read_buf(&mut buf).await? == 0
        };
        if eof && buf.is_empty() {
            return Err(ClassifyError::EarlyEof);
        }

        if let Parse::Done(preface) = parse_preface(&buf, full || eof || buf.len() >= limit) {
            return Ok((buf, preface));
        }
    }
}

#[cfg(test)]
mod tests {
    use http::header::CONTENT_TYPE;
    use http::{HeaderMap, HeaderValue};
    use parking_lot::Mutex;
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::network::preface::Protocol;
    use crate::network::listener::{sub_listener, SubListener};
    use crate::network::preface::tests::h2_preface;
    use crate::service::matcher::{RequestHead, GATEWAY_CONTENT_TYPE, GRPC_CONTENT_TYPE};

    fn preface(protocol: Protocol, path: &str, content_type: Option<&'static str>) -> ConnectionPreface {
        let mut headers = HeaderMap::new();
        if let Some(ct) = content_type {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static(ct));
        }
        ConnectionPreface {
            protocol,
            head: Some(RequestHead {
                method: "POST".to_string(),
                path: path.to_string(),
                headers,
            }),
        }
    }

    #[test]
    fn rpc_content_type_wins_regardless_of_path() {
        let rules = Rules::new(true);
        for path in ["/", "/v1/items", "/pkg.Svc/Call"] {
            for protocol in [Protocol::Http1, Protocol::Http2] {
                let p = preface(protocol, path, Some(GRPC_CONTENT_TYPE));
                assert_eq!(rules.classify(&p), ConnectionClass::Rpc);
            }
        }
    }

    #[test]
    fn gateway_content_type_needs_a_gateway() {
        let p = preface(Protocol::Http1, "/v1/items", Some(GATEWAY_CONTENT_TYPE));
        assert_eq!(Rules::new(true).classify(&p), ConnectionClass::Gateway);
        assert_eq!(Rules::new(false).classify(&p), ConnectionClass::Http);
    }

    #[test]
    fn everything_else_is_http() {
        let rules = Rules::new(true);
        assert_eq!(
            rules.classify(&preface(Protocol::Http1, "/", Some("application/json"))),
            ConnectionClass::Http
        );
        assert_eq!(
            rules.classify(&ConnectionPreface { protocol: Protocol::Unknown, head: None }),
            ConnectionClass::Http
        );
    }

    struct Harness {
        addr: SocketAddr,
        rpc: SubListener,
        gateway: SubListener,
        http: SubListener,
        errors: Arc<Mutex<Vec<String>>>,
        stop: watch::Sender<bool>,
    }

    async fn start(limits: DemuxLimits) -> Harness {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (rpc_tx, rpc) = sub_listener(addr);
        let (gw_tx, gateway) = sub_listener(addr);
        let (http_tx, http) = sub_listener(addr);
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        let on_error: ConnectionErrorHandler =
            Arc::new(move |_, err| sink.lock().push(err.to_string()));

        let demux = Demultiplexer::new(
            Rules::new(true),
            Routes { rpc: rpc_tx, gateway: Some(gw_tx), http: http_tx },
            limits,
            on_error,
        );
        let (stop, stop_rx) = watch::channel(false);
        tokio::spawn(demux.run(listener, stop_rx));

        Harness { addr, rpc, gateway, http, errors, stop }
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn accept_loop_can_be_spawned() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (rpc_tx, _rpc) = sub_listener(addr);
        let (http_tx, _http) = sub_listener(addr);
        let demux = Demultiplexer::new(
            Rules::new(false),
            Routes { rpc: rpc_tx, gateway: None, http: http_tx },
            limits(),
            log_connection_error(),
        );
        let (stop, stop_rx) = watch::channel(false);

        let run = demux.run(listener, stop_rx);
        assert_send(&run);
        let task = tokio::spawn(run);

        stop.send_replace(true);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("accept loop stops on shutdown")
            .unwrap();
    }

    fn limits() -> DemuxLimits {
        DemuxLimits {
            classify_timeout: Duration::from_secs(5),
            max_preface_bytes: 16_384,
        }
    }

    async fn next(listener: &mut SubListener) -> MuxedStream {
        use axum::serve::Listener;
        tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .expect("connection should be routed")
            .0
    }

    #[tokio::test]
    async fn routes_http2_grpc_to_rpc_and_replays_bytes() {
        let mut h = start(limits()).await;
        let raw = h2_preface(
            &[
                (":method", "POST"),
                (":path", "/grpc.health.v1.Health/Check"),
                ("content-type", "application/grpc"),
            ],
            true,
        );
        let mut client = TcpStream::connect(h.addr).await.unwrap();
        client.write_all(&raw).await.unwrap();

        let mut routed = next(&mut h.rpc).await;
        assert_eq!(routed.class(), ConnectionClass::Rpc);

        let mut replayed = vec![0u8; raw.len()];
        routed.read_exact(&mut replayed).await.unwrap();
        assert_eq!(replayed, raw);
    }

    #[tokio::test]
    async fn routes_gateway_and_plain_http1() {
        let mut h = start(limits()).await;

        let mut gw = TcpStream::connect(h.addr).await.unwrap();
        gw.write_all(b"POST /v1/x HTTP/1.1\r\nContent-Type: application/grpc-gateway\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(next(&mut h.gateway).await.class(), ConnectionClass::Gateway);

        let mut plain = TcpStream::connect(h.addr).await.unwrap();
        plain.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
        assert_eq!(next(&mut h.http).await.class(), ConnectionClass::Http);
    }

    #[tokio::test]
    async fn oversized_head_falls_back_to_http() {
        let mut h = start(DemuxLimits { max_preface_bytes: 64, ..limits() }).await;
        let mut client = TcpStream::connect(h.addr).await.unwrap();
        let long = format!("GET /{} HTTP/1.1\r\n", "a".repeat(200));
        client.write_all(long.as_bytes()).await.unwrap();

        let routed = next(&mut h.http).await;
        assert_eq!(routed.pending_prefix(), 64);
    }

    #[tokio::test]
    async fn early_eof_and_timeouts_are_reported_and_loop_continues() {
        let mut h = start(DemuxLimits {
            classify_timeout: Duration::from_millis(100),
            ..limits()
        })
        .await;

        drop(TcpStream::connect(h.addr).await.unwrap());
        let _silent = TcpStream::connect(h.addr).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while h.errors.lock().len() < 2 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let errors = h.errors.lock().clone();
        assert!(errors.iter().any(|e| e.contains("before sending")), "{errors:?}");
        assert!(errors.iter().any(|e| e.contains("no classifiable preface")), "{errors:?}");

        let mut plain = TcpStream::connect(h.addr).await.unwrap();
        plain.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        assert_eq!(next(&mut h.http).await.class(), ConnectionClass::Http);
        h.stop.send_replace(true);
    }
}
