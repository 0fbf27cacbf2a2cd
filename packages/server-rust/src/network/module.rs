//! The `server` module: runs a [`Server`] under the module registry.
//!
//! Follows the deferred startup pattern:
//! 1. `new()` -- takes the service registrations, binds nothing
//! 2. `initialize()` -- parses the `server` section, builds the server and
//!    binds the listener, so a taken port fails startup
//! 3. `serve()` -- serves until the registry shuts the module down

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use muxgate_core::Module;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::config::ServerConfig;
use super::server::{bind, Server, ServerBuilder, ServerError};

/// Registry name of the module.
pub const SERVER_MODULE: &str = "server";

/// Module wrapping the protocol server supervisor.
pub struct ServerModule {
    builder: Mutex<Option<ServerBuilder>>,
    server: Mutex<Option<Arc<Server>>>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl ServerModule {
    #[must_use]
    pub fn new(builder: ServerBuilder) -> Self {
        Self {
            builder: Mutex::new(Some(builder)),
            server: Mutex::new(None),
            listener: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    /// Address the listener is bound to, once initialized.
    ///
    /// Differs from the configured address when port 0 was requested.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// The running server, once initialized.
    #[must_use]
    pub fn server(&self) -> Option<Arc<Server>> {
        self.server.lock().clone()
    }
}

#[async_trait]
impl Module for ServerModule {
    fn name(&self) -> &str {
        SERVER_MODULE
    }

    async fn initialize(&self, config: Option<&Value>) -> anyhow::Result<()> {
        let config = match config {
            Some(section) => ServerConfig::deserialize(section)?,
            None => ServerConfig::default(),
        };
        let builder = self
            .builder
            .lock()
            .take()
            .ok_or_else(|| anyhow::anyhow!("server module initialized twice"))?;

        let listener = bind(&config.listen).await?;
        let addr = listener.local_addr()?;
        info!(listen = %config.listen, %addr, gateway = builder.has_gateway(), "server module bound");

        *self.local_addr.lock() = Some(addr);
        *self.listener.lock() = Some(listener);
        *self.server.lock() = Some(Arc::new(builder.build(config)));
        Ok(())
    }

    async fn serve(&self) -> anyhow::Result<()> {
        let listener = self.listener.lock().take();
        let (Some(server), Some(listener)) = (self.server(), listener) else {
            anyhow::bail!("server module served before initialize");
        };
        match server.serve(listener).await {
            Err(ServerError::Closed) => {
                info!("server shut down before it started serving");
                Ok(())
            }
            result => Ok(result?),
        }
    }

    async fn shutdown(&self) {
        let Some(server) = self.server() else {
            return;
        };
        let timeout = server.config().shutdown_timeout();
        match server.shutdown(timeout).await {
            Ok(()) => info!("server drained"),
            Err(ServerError::DeadlineExceeded(t)) => {
                warn!(timeout_ms = t.as_millis(), "server still draining after shutdown deadline");
            }
            Err(err) => warn!(error = %err, "server shutdown failed"),
        }
    }

    async fn finalize(&self) {
        if self.listener.lock().take().is_some() {
            info!("released unused listener");
        }
        self.server.lock().take();
    }
}
