//! HTTP/JSON gateway bridge.
//!
//! The gateway calls the same RPC implementations the public listener
//! serves, over a private loopback connection to a second RPC server
//! instance. On Unix the loopback is a per-instance Unix-domain socket;
//! elsewhere it is an ephemeral TCP port on 127.0.0.1.

use std::convert::Infallible;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::response::Response;
use axum::routing::future::RouteFuture;
use axum::routing::MethodRouter;
use axum::Router;
use http::Request;
use tonic::service::Routes as RpcRoutes;
use tonic::transport::{Channel, Endpoint, Server};
use tower::Service;
use tracing::{debug, info, warn};

use super::config::RpcOptions;
use crate::service::matcher::Matcher;

// ---------------------------------------------------------------------------
// GatewayMux
// ---------------------------------------------------------------------------

/// Route table the gateway callbacks fill in.
#[derive(Debug, Default)]
pub struct GatewayMux {
    router: Router,
}

impl GatewayMux {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a route, as [`Router::route`] does.
    ///
    /// # Panics
    ///
    /// Panics if the path is invalid or already routed, like
    /// [`Router::route`].
    pub fn route(&mut self, path: &str, method_router: MethodRouter) -> &mut Self {
        self.router = std::mem::take(&mut self.router).route(path, method_router);
        self
    }

    /// Mounts a whole router under `path`.
    pub fn nest(&mut self, path: &str, router: Router) -> &mut Self {
        self.router = std::mem::take(&mut self.router).nest(path, router);
        self
    }

    #[must_use]
    pub fn into_router(self) -> Router {
        self.router
    }
}

// ---------------------------------------------------------------------------
// HttpDispatch
// ---------------------------------------------------------------------------

/// Routes plain HTTP requests between the gateway and the default handler.
///
/// The gateway content type is checked first, then each registration's
/// matchers in registration order. Without a gateway every request goes to
/// the default handler.
#[derive(Clone)]
pub struct HttpDispatch {
    gateway: Option<(Arc<[Matcher]>, Router)>,
    default: Router,
}

impl HttpDispatch {
    #[must_use]
    pub fn new(default: Router) -> Self {
        Self {
            gateway: None,
            default,
        }
    }

    /// Enables the gateway. `matchers` are the registrations' matchers in
    /// registration order; the gateway content type is prepended.
    #[must_use]
    pub fn with_gateway(mut self, router: Router, matchers: Vec<Matcher>) -> Self {
        let mut all = Vec::with_capacity(matchers.len() + 1);
        all.push(Matcher::gateway_content_type());
        all.extend(matchers);
        self.gateway = Some((all.into(), router));
        self
    }

    fn pick<B>(&self, req: &Request<B>) -> &Router {
        if let Some((matchers, router)) = &self.gateway {
            let path = req.uri().path();
            if matchers.iter().any(|m| m.matches_parts(path, req.headers())) {
                return router;
            }
        }
        &self.default
    }

    #[must_use]
    pub fn into_router(self) -> Router {
        Router::new().fallback_service(self)
    }
}

impl Service<Request<Body>> for HttpDispatch {
    type Response = Response;
    type Error = Infallible;
    type Future = RouteFuture<Infallible>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let mut router = self.pick(&req).clone();
        debug!(path = req.uri().path(), "dispatching HTTP request");
        router.call(req)
    }
}

// ---------------------------------------------------------------------------
// Loopback
// ---------------------------------------------------------------------------

/// Errors establishing the gateway loopback.
#[derive(Debug, thiserror::Error)]
pub enum LoopbackError {
    #[error("failed to bind loopback listener at {path}: {source}")]
    Bind {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to dial loopback: {0}")]
    Dial(#[from] tonic::transport::Error),
}

/// Returns a socket path unique to this process and server instance.
#[must_use]
pub fn loopback_socket_path(dir: &Path) -> PathBuf {
    dir.join(format!(
        "muxgate-{}-{}.sock",
        std::process::id(),
        uuid::Uuid::new_v4().simple()
    ))
}

/// A bound loopback RPC listener; removes its socket file when dropped.
pub struct Loopback {
    incoming: LoopbackIncoming,
    target: LoopbackTarget,
}

#[cfg(unix)]
type LoopbackIncoming = tokio_stream::wrappers::UnixListenerStream;
#[cfg(not(unix))]
type LoopbackIncoming = tokio_stream::wrappers::TcpListenerStream;

#[cfg(unix)]
type LoopbackTarget = SocketFile;
#[cfg(not(unix))]
type LoopbackTarget = std::net::SocketAddr;

/// Unix socket path, unlinked on drop.
#[derive(Debug, Clone)]
pub struct SocketFile(Arc<SocketFileInner>);

#[derive(Debug)]
struct SocketFileInner(PathBuf);

impl SocketFile {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.0 .0
    }
}

impl Drop for SocketFileInner {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.0) {
            Ok(()) => debug!(path = %self.0.display(), "removed loopback socket"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %self.0.display(), error = %err, "failed to remove loopback socket"),
        }
    }
}

impl Loopback {
    /// Binds the loopback listener.
    ///
    /// # Errors
    ///
    /// Returns `Bind` if the socket cannot be created.
    #[cfg(unix)]
    pub fn bind(dir: &Path) -> Result<Self, LoopbackError> {
        let path = loopback_socket_path(dir);
        let listener =
            tokio::net::UnixListener::bind(&path).map_err(|source| LoopbackError::Bind {
                path: path.display().to_string(),
                source,
            })?;
        info!(path = %path.display(), "gateway loopback listening");
        Ok(Self {
            incoming: tokio_stream::wrappers::UnixListenerStream::new(listener),
            target: SocketFile(Arc::new(SocketFileInner(path))),
        })
    }

    /// Binds the loopback listener.
    ///
    /// # Errors
    ///
    /// Returns `Bind` if the port cannot be bound.
    #[cfg(not(unix))]
    pub fn bind(_dir: &Path) -> Result<Self, LoopbackError> {
        let std_listener = std::net::TcpListener::bind("127.0.0.1:0")
            .and_then(|l| l.set_nonblocking(true).map(|()| l))
            .map_err(|source| LoopbackError::Bind {
                path: "127.0.0.1:0".to_string(),
                source,
            })?;
        let addr = std_listener.local_addr().map_err(|source| LoopbackError::Bind {
            path: "127.0.0.1:0".to_string(),
            source,
        })?;
        let listener =
            tokio::net::TcpListener::from_std(std_listener).map_err(|source| LoopbackError::Bind {
                path: addr.to_string(),
                source,
            })?;
        info!(%addr, "gateway loopback listening");
        Ok(Self {
            incoming: tokio_stream::wrappers::TcpListenerStream::new(listener),
            target: addr,
        })
    }

    /// Where the loopback listens, for logs.
    #[must_use]
    pub fn describe(&self) -> String {
        #[cfg(unix)]
        {
            self.target.path().display().to_string()
        }
        #[cfg(not(unix))]
        {
            self.target.to_string()
        }
    }

    /// Splits into the RPC server future and a dialer for the channel.
    ///
    /// The server runs `routes` until `shutdown` resolves.
    pub fn serve(
        self,
        routes: RpcRoutes,
        options: &RpcOptions,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> (
        impl Future<Output = Result<(), tonic::transport::Error>> + Send + 'static,
        LoopbackDialer,
    ) {
        let server = options
            .apply(Server::builder())
            .add_routes(routes)
            .serve_with_incoming_shutdown(self.incoming, shutdown);
        (server, LoopbackDialer(self.target))
    }
}

/// Opens the gateway's client channel to the loopback server.
///
/// Holding a dialer keeps the socket file alive.
#[derive(Debug, Clone)]
pub struct LoopbackDialer(LoopbackTarget);

impl LoopbackDialer {
    /// Connects eagerly so a broken loopback fails startup.
    ///
    /// # Errors
    ///
    /// Returns `Dial` if the connection cannot be established.
    #[cfg(unix)]
    pub async fn connect(&self) -> Result<Channel, LoopbackError> {
        use hyper_util::rt::TokioIo;
        use tokio::net::UnixStream;
        use tonic::transport::Uri;

        let socket = self.0.clone();
        // The authority is required by the URI type but never resolved.
        let channel = Endpoint::from_static("http://[::]:50051")
            .connect_with_connector(tower::service_fn(move |_: Uri| {
                let socket = socket.clone();
                async move { Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(socket.path()).await?)) }
            }))
            .await?;
        Ok(channel)
    }

    /// Connects eagerly so a broken loopback fails startup.
    ///
    /// # Errors
    ///
    /// Returns `Dial` if the connection cannot be established.
    #[cfg(not(unix))]
    pub async fn connect(&self) -> Result<Channel, LoopbackError> {
        let endpoint = Endpoint::from_shared(format!("http://{}", self.0))?;
        Ok(endpoint.connect().await?)
    }
}
