//! Listener, connection classification, protocol sub-servers and shutdown control.

pub mod config;
pub mod demux;
pub mod gateway;
pub mod listener;
pub mod middleware;
pub mod module;
pub mod preface;
pub mod server;
pub mod shutdown;
pub mod stream;

pub use config::{ListenAddr, ListenAddrError, RpcOptions, ServerConfig};
pub use demux::{log_connection_error, ClassifyError, ConnectionErrorHandler};
pub use gateway::{GatewayMux, LoopbackError};
pub use module::{ServerModule, SERVER_MODULE};
pub use server::{bind, Server, ServerBuilder, ServerError};
pub use shutdown::{ServerState, ShutdownController, TaskGuard};
pub use stream::{ConnectionClass, MuxConnectInfo, MuxedStream};
