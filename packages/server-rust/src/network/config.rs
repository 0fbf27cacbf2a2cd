//! Configuration types for the multiplexing server.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Configuration of the `server` module, read from its JSON section.
///
/// Every field has a default, so an absent section is a valid configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Listen address, resolved by [`ListenAddr::resolve`].
    pub listen: String,
    /// Upper bound on a graceful shutdown, in milliseconds.
    pub shutdown_timeout_ms: u64,
    /// Time a new connection gets to send enough bytes to be classified.
    pub classify_timeout_ms: u64,
    /// Lookahead limit for classification, in bytes.
    pub max_preface_bytes: usize,
    /// Per-request timeout of the HTTP sub-servers, in milliseconds.
    pub request_timeout_ms: u64,
    /// Directory of the gateway loopback socket. Defaults to the OS temp dir.
    pub loopback_dir: Option<PathBuf>,
    /// Options handed to every RPC sub-server.
    pub rpc: RpcOptions,
}

impl ServerConfig {
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    #[must_use]
    pub fn classify_timeout(&self) -> Duration {
        Duration::from_millis(self.classify_timeout_ms)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Returns the directory the loopback socket is created in.
    #[must_use]
    pub fn loopback_dir(&self) -> PathBuf {
        self.loopback_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: String::new(),
            shutdown_timeout_ms: 1_000,
            classify_timeout_ms: 10_000,
            max_preface_bytes: 16_384, // 16 KB
            request_timeout_ms: 30_000,
            loopback_dir: None,
            rpc: RpcOptions::default(),
        }
    }
}

/// RPC runtime options. Unset fields keep the runtime's defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RpcOptions {
    /// Per-call timeout, in milliseconds.
    pub timeout_ms: Option<u64>,
    /// Maximum concurrent calls per connection.
    pub concurrency_limit_per_connection: Option<usize>,
    /// HTTP/2 keepalive ping interval, in milliseconds.
    pub http2_keepalive_interval_ms: Option<u64>,
}

impl RpcOptions {
    /// Applies the options to an RPC server builder.
    #[must_use]
    pub fn apply<L>(&self, mut builder: tonic::transport::Server<L>) -> tonic::transport::Server<L> {
        if let Some(ms) = self.timeout_ms {
            builder = builder.timeout(Duration::from_millis(ms));
        }
        if let Some(limit) = self.concurrency_limit_per_connection {
            builder = builder.concurrency_limit_per_connection(limit);
        }
        if let Some(ms) = self.http2_keepalive_interval_ms {
            builder = builder.http2_keepalive_interval(Some(Duration::from_millis(ms)));
        }
        builder
    }
}

/// Error resolving a listen address.
#[derive(Debug, thiserror::Error)]
#[error("invalid listen address {addr:?}: {reason}")]
pub struct ListenAddrError {
    pub addr: String,
    pub reason: String,
}

/// Listen address resolution.
///
/// | spec            | resolves to      |
/// |-----------------|------------------|
/// | `""`            | `0.0.0.0:80`     |
/// | `":8080"`       | `0.0.0.0:8080`   |
/// | `":http"`       | `0.0.0.0:80`     |
/// | `":https"`      | `0.0.0.0:443`    |
/// | `"10.0.0.1"`    | `10.0.0.1:80`    |
/// | `"[::1]:9000"`  | `[::1]:9000`     |
///
/// Host names are left to the resolver, so `"localhost:80"` passes through
/// as a string.
pub struct ListenAddr;

impl ListenAddr {
    const DEFAULT_PORT: u16 = 80;

    /// Resolves a listen spec into a `host:port` string accepted by
    /// `TcpListener::bind`.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown service name or a malformed port.
    pub fn resolve(spec: &str) -> Result<String, ListenAddrError> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Ok(any_addr(Self::DEFAULT_PORT).to_string());
        }
        if let Ok(addr) = spec.parse::<SocketAddr>() {
            return Ok(addr.to_string());
        }
        if let Ok(ip) = spec.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, Self::DEFAULT_PORT).to_string());
        }
        if let Some(v6) = spec.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            let ip: IpAddr = v6.parse().map_err(|_| ListenAddrError {
                addr: spec.to_string(),
                reason: "bad IPv6 literal".to_string(),
            })?;
            return Ok(SocketAddr::new(ip, Self::DEFAULT_PORT).to_string());
        }

        match spec.rsplit_once(':') {
            None => Ok(format!("{spec}:{}", Self::DEFAULT_PORT)),
            Some((host, port)) => {
                let port = parse_port(port).ok_or_else(|| ListenAddrError {
                    addr: spec.to_string(),
                    reason: format!("unknown port {port:?}"),
                })?;
                if host.is_empty() {
                    Ok(any_addr(port).to_string())
                } else {
                    Ok(format!("{host}:{port}"))
                }
            }
        }
    }
}

fn any_addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
}

fn parse_port(port: &str) -> Option<u16> {
    match port {
        "" | "http" => Some(80),
        "https" => Some(443),
        _ => port.parse().ok(),
    }
}
