//! Protocol server supervisor.
//!
//! A [`Server`] owns one listener and everything behind it: the
//! demultiplexer, the RPC sub-server, the optional gateway bridge with its
//! loopback RPC server, and the generic HTTP sub-server. All of them share
//! one [`ShutdownController`].

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tonic::service::{Routes as RpcRoutes, RoutesBuilder};
use tonic::transport::Server as RpcServer;
use tonic_health::server::{health_reporter, HealthReporter};
use tonic_health::ServingStatus;
use tracing::{debug, error, info, warn};

use super::config::{ListenAddr, ListenAddrError, ServerConfig};
use super::demux::{
    log_connection_error, ConnectionErrorHandler, Demultiplexer, DemuxLimits, Routes, Rules,
};
use super::gateway::{GatewayMux, HttpDispatch, Loopback, LoopbackError};
use super::listener::sub_listener;
use super::middleware::build_http_layers;
use super::shutdown::{ServerState, ShutdownController};
use crate::service::matcher::Matcher;
use crate::service::registration::{
    GatewayRegisterFn, RegistrationError, ServiceDescriptor, ServiceEntry,
};

/// Name the default health service reports for the server as a whole.
const OVERALL_HEALTH: &str = "";

// ---------------------------------------------------------------------------
// ServerError
// ---------------------------------------------------------------------------

/// Errors returned by [`Server`] and [`ServerBuilder`].
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid service registration: {0}")]
    InvalidRegistration(#[from] RegistrationError),
    #[error(transparent)]
    ListenAddr(#[from] ListenAddrError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("listener has no local address: {0}")]
    LocalAddr(#[source] io::Error),
    #[error("gateway loopback: {0}")]
    Loopback(#[from] LoopbackError),
    #[error("gateway registration for {service} failed: {source}")]
    GatewayRegistration {
        service: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("rpc sub-server failed: {0}")]
    Rpc(#[from] tonic::transport::Error),
    #[error("{name} sub-server failed: {source}")]
    Http {
        name: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("sub-server task aborted: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("server is already serving")]
    AlreadyServing,
    #[error("server is closed")]
    Closed,
    #[error("shutdown did not finish within {0:?}")]
    DeadlineExceeded(Duration),
}

// ---------------------------------------------------------------------------
// ServerBuilder
// ---------------------------------------------------------------------------

/// Collects service registrations and handlers before serving.
#[derive(Default)]
pub struct ServerBuilder {
    entries: Vec<ServiceEntry>,
    http_handler: Option<Router>,
    on_connection_error: Option<ConnectionErrorHandler>,
    health_reporter: Option<HealthReporter>,
}

impl ServerBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an RPC service.
    ///
    /// # Errors
    ///
    /// Fails on an invalid descriptor or a service registered twice.
    pub fn register_service<S>(
        &mut self,
        descriptor: ServiceDescriptor,
        service: S,
    ) -> Result<&mut Self, ServerError>
    where
        S: tower::Service<
                http::Request<tonic::body::Body>,
                Response = http::Response<tonic::body::Body>,
                Error = std::convert::Infallible,
            > + tonic::server::NamedService
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        self.add_entry(ServiceEntry::new(descriptor, service)?)
    }

    /// Registers an RPC service that is also reachable through the gateway.
    ///
    /// Plain HTTP requests matching any of `matchers` (or carrying the
    /// gateway content type) are routed to the gateway.
    ///
    /// # Errors
    ///
    /// Fails on an invalid descriptor or a service registered twice.
    pub fn register_service_with_gateway<S>(
        &mut self,
        descriptor: ServiceDescriptor,
        service: S,
        register: GatewayRegisterFn,
        matchers: Vec<Matcher>,
    ) -> Result<&mut Self, ServerError>
    where
        S: tower::Service<
                http::Request<tonic::body::Body>,
                Response = http::Response<tonic::body::Body>,
                Error = std::convert::Infallible,
            > + tonic::server::NamedService
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        let entry = ServiceEntry::new(descriptor, service)?.with_gateway(register, matchers);
        self.add_entry(entry)
    }

    /// Adds a prepared entry, e.g. one built with
    /// [`ServiceEntry::intercepted`].
    ///
    /// # Errors
    ///
    /// Fails if a service with the same name is already registered.
    pub fn add_entry(&mut self, entry: ServiceEntry) -> Result<&mut Self, ServerError> {
        if self.entries.iter().any(|e| e.name() == entry.name()) {
            return Err(RegistrationError::Duplicate(entry.name().to_string()).into());
        }
        debug!(
            service = entry.name(),
            interception = entry.interception().as_str(),
            gateway = entry.gateway().is_some(),
            "service registered"
        );
        self.entries.push(entry);
        Ok(self)
    }

    /// Sets the handler for plain HTTP traffic. Defaults to a 404 router.
    pub fn http_handler(&mut self, router: Router) -> &mut Self {
        self.http_handler = Some(router);
        self
    }

    /// Hands over the reporter of a user-registered health service.
    ///
    /// Registering `grpc.health.v1.Health` replaces the default health
    /// service; with its reporter the server still flips the registered
    /// services to `NOT_SERVING` when shutdown begins.
    pub fn health_reporter(&mut self, reporter: HealthReporter) -> &mut Self {
        self.health_reporter = Some(reporter);
        self
    }

    /// Sets the callback for connections that fail classification.
    pub fn on_connection_error(&mut self, handler: ConnectionErrorHandler) -> &mut Self {
        self.on_connection_error = Some(handler);
        self
    }

    #[must_use]
    pub fn has_gateway(&self) -> bool {
        self.entries.iter().any(|e| e.gateway().is_some())
    }

    #[must_use]
    pub fn build(self, config: ServerConfig) -> Server {
        Server {
            config,
            entries: self.entries,
            http_handler: self.http_handler.unwrap_or_default(),
            on_connection_error: self.on_connection_error.unwrap_or_else(log_connection_error),
            health_reporter: self.health_reporter,
            shutdown: Arc::new(ShutdownController::new()),
        }
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Serves RPC, gateway and plain HTTP traffic on one listener.
pub struct Server {
    config: ServerConfig,
    entries: Vec<ServiceEntry>,
    http_handler: Router,
    on_connection_error: ConnectionErrorHandler,
    health_reporter: Option<HealthReporter>,
    shutdown: Arc<ShutdownController>,
}

/// Sub-server tasks, each returning its own failure.
type Tasks = JoinSet<Result<(), ServerError>>;

impl Server {
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> ServerState {
        self.shutdown.state()
    }

    #[must_use]
    pub fn has_gateway(&self) -> bool {
        self.entries.iter().any(|e| e.gateway().is_some())
    }

    /// Resolves the configured address, binds it and serves.
    ///
    /// # Errors
    ///
    /// Returns bind errors, or whatever [`serve`](Self::serve) returns.
    pub async fn listen_and_serve(&self) -> Result<(), ServerError> {
        let listener = bind(&self.config.listen).await?;
        self.serve(listener).await
    }

    /// Serves on `listener` until shut down.
    ///
    /// Starts the sub-servers, then blocks until [`shutdown`](Self::shutdown)
    /// or [`close`](Self::close) is called or a sub-server fails. Returns once
    /// every sub-server task has exited.
    ///
    /// # Errors
    ///
    /// Fails at startup on a gateway setup error, or with the first
    /// sub-server failure. Returns `Closed` if the server was already shut
    /// down and `AlreadyServing` on a second call.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        if !self.shutdown.set_serving() {
            return Err(match self.shutdown.state() {
                ServerState::Serving => ServerError::AlreadyServing,
                _ => ServerError::Closed,
            });
        }
        // Startup counts as running, so a shutdown racing it waits for the drain.
        let _serving = self.shutdown.task_guard();
        let local_addr = listener.local_addr().map_err(ServerError::LocalAddr)?;
        info!(%local_addr, services = self.entries.len(), "server starting");

        let (reporter, routes) = self.rpc_routes().await;
        let mut tasks = Tasks::new();

        let started = self.start(listener, local_addr, routes, &mut tasks).await;
        if let Err(err) = started {
            error!(error = %err, "server failed to start");
            self.shutdown.trigger_shutdown();
            drain(&mut tasks).await;
            self.shutdown.set_closed();
            return Err(err);
        }

        self.shutdown.cancelled().await;
        info!(%local_addr, "server shutting down");
        self.set_health(&reporter, ServingStatus::NotServing).await;

        let result = drain(&mut tasks).await;
        self.shutdown.set_closed();
        info!(%local_addr, "server stopped");
        result
    }

    /// Cancels serving and waits up to `timeout` for the sub-servers to
    /// drain.
    ///
    /// The sub-servers keep draining after a timeout; nothing is killed.
    ///
    /// # Errors
    ///
    /// Returns `DeadlineExceeded` if they are still running at the deadline.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), ServerError> {
        self.shutdown.trigger_shutdown();
        if self.shutdown.wait_for_drain(timeout).await {
            Ok(())
        } else {
            Err(ServerError::DeadlineExceeded(timeout))
        }
    }

    /// Cancels serving without waiting.
    pub fn close(&self) {
        self.shutdown.trigger_shutdown();
    }

    async fn rpc_routes(&self) -> (HealthReporter, RpcRoutes) {
        let mut builder = RoutesBuilder::default();
        let health_name = ServiceDescriptor::health().name;
        let reporter = if self.entries.iter().any(|e| e.name() == health_name) {
            self.health_reporter.clone().unwrap_or_else(|| {
                warn!("health service registered without its reporter, serving status is not tracked");
                health_reporter().0
            })
        } else {
            let (reporter, health_service) = health_reporter();
            builder.add_service(health_service);
            reporter
        };
        self.set_health(&reporter, ServingStatus::Serving).await;

        for entry in &self.entries {
            entry.add_to(&mut builder);
        }
        (reporter, builder.routes())
    }

    async fn set_health(&self, reporter: &HealthReporter, status: ServingStatus) {
        reporter.set_service_status(OVERALL_HEALTH, status).await;
        for entry in &self.entries {
            reporter.set_service_status(entry.name(), status).await;
        }
    }

    /// Spawns every sub-server. On error the tasks spawned so far are left
    /// in `tasks` for the caller to drain.
    async fn start(
        &self,
        listener: TcpListener,
        local_addr: std::net::SocketAddr,
        routes: RpcRoutes,
        tasks: &mut Tasks,
    ) -> Result<(), ServerError> {
        let (rpc_tx, rpc_listener) = sub_listener(local_addr);
        let (http_tx, http_listener) = sub_listener(local_addr);

        let mut http = HttpDispatch::new(self.http_handler.clone());
        let mut gateway_tx = None;

        if self.has_gateway() {
            let gateway_router = self.start_gateway(routes.clone(), tasks).await?;
            let matchers = self
                .entries
                .iter()
                .filter_map(ServiceEntry::gateway)
                .flat_map(|g| g.matchers.iter().cloned())
                .collect();
            http = http.with_gateway(gateway_router.clone(), matchers);

            let (tx, gateway_listener) = sub_listener(local_addr);
            gateway_tx = Some(tx);
            let gateway_app =
                gateway_router.layer(build_http_layers(self.config.request_timeout()));
            let served = serve_http(
                "gateway",
                gateway_listener,
                gateway_app,
                self.shutdown.cancelled(),
            );
            self.spawn(tasks, "gateway", served);
        }

        let rpc = self
            .config
            .rpc
            .apply(RpcServer::builder())
            .add_routes(routes)
            .serve_with_incoming_shutdown(rpc_listener.into_incoming(), self.shutdown.cancelled());
        self.spawn(tasks, "rpc", async move { rpc.await.map_err(ServerError::from) });

        let http_app = http
            .into_router()
            .layer(build_http_layers(self.config.request_timeout()));
        let served = serve_http("http", http_listener, http_app, self.shutdown.cancelled());
        self.spawn(tasks, "http", served);

        let gateway_enabled = gateway_tx.is_some();
        let demux = Demultiplexer::new(
            Rules::new(gateway_enabled),
            Routes {
                rpc: rpc_tx,
                gateway: gateway_tx,
                http: http_tx,
            },
            DemuxLimits {
                classify_timeout: self.config.classify_timeout(),
                max_preface_bytes: self.config.max_preface_bytes,
            },
            Arc::clone(&self.on_connection_error),
        );
        let stop = self.shutdown.shutdown_receiver();
        self.spawn(tasks, "demux", async move {
            demux.run(listener, stop).await;
            Ok(())
        });

        info!(%local_addr, gateway = gateway_enabled, "server serving");
        Ok(())
    }

    /// Starts the loopback RPC server, dials it and runs every gateway
    /// callback against the channel.
    async fn start_gateway(
        &self,
        routes: RpcRoutes,
        tasks: &mut Tasks,
    ) -> Result<Router, ServerError> {
        let loopback = Loopback::bind(&self.config.loopback_dir())?;
        debug!(loopback = %loopback.describe(), "starting gateway loopback");

        let (server, dialer) = loopback.serve(routes, &self.config.rpc, self.shutdown.cancelled());
        let keep_socket = dialer.clone();
        self.spawn(tasks, "loopback", async move {
            let result = server.await.map_err(ServerError::from);
            drop(keep_socket);
            result
        });

        let channel = dialer.connect().await?;
        let mut mux = GatewayMux::new();
        for entry in &self.entries {
            let Some(gateway) = entry.gateway() else {
                continue;
            };
            (gateway.register)(&mut mux, channel.clone()).map_err(|source| {
                ServerError::GatewayRegistration {
                    service: entry.name().to_string(),
                    source,
                }
            })?;
        }
        Ok(mux.into_router())
    }

    /// Spawns a sub-server task that holds a drain guard and cancels the
    /// whole server if it fails.
    fn spawn(
        &self,
        tasks: &mut Tasks,
        name: &'static str,
        task: impl Future<Output = Result<(), ServerError>> + Send + 'static,
    ) {
        let guard = self.shutdown.task_guard();
        let shutdown = Arc::clone(&self.shutdown);
        tasks.spawn(async move {
            let _guard = guard;
            let result = task.await;
            match &result {
                Ok(()) => debug!(sub_server = name, "sub-server stopped"),
                Err(err) => {
                    warn!(sub_server = name, error = %err, "sub-server failed, shutting down");
                    shutdown.trigger_shutdown();
                }
            }
            result
        });
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("entries", &self.entries)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Resolves and binds a listen spec.
///
/// # Errors
///
/// Returns `ListenAddr` for a bad spec and `Bind` if binding fails.
pub async fn bind(listen: &str) -> Result<TcpListener, ServerError> {
    let addr = ListenAddr::resolve(listen)?;
    TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })
}

async fn serve_http(
    name: &'static str,
    listener: super::listener::SubListener,
    app: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ServerError> {
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|source| ServerError::Http { name, source })
}

/// Waits for every task, returning the first failure.
async fn drain(tasks: &mut Tasks) -> Result<(), ServerError> {
    let mut first = None;
    while let Some(joined) = tasks.join_next().await {
        let result = joined.map_err(ServerError::from).and_then(|r| r);
        if let Err(err) = result {
            first.get_or_insert(err);
        }
    }
    first.map_or(Ok(()), Err)
}
