//! Muxgate server: gRPC, gateway and plain HTTP on one listener, run as
//! modules of a [`ModuleRegistry`](muxgate_core::ModuleRegistry).

pub mod config_file;
pub mod logging;
pub mod network;
pub mod service;
pub mod signal;

pub use config_file::{load_config, ConfigError};
pub use logging::{LogModule, LOG_MODULE};
pub use network::{Server, ServerBuilder, ServerConfig, ServerError, ServerModule};
pub use service::{Interception, Matcher, ServiceDescriptor, ServiceEntry};
