//! muxgate: gRPC, a JSON gateway and plain HTTP on a single port.
//!
//! Usage: `muxgate --config muxgate.toml` (or `MUXGATE_CONFIG`).

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::Query;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use muxgate_core::ModuleRegistry;
use muxgate_server::network::GatewayMux;
use muxgate_server::service::GatewayRegisterFn;
use muxgate_server::signal::shutdown_signal;
use muxgate_server::{load_config, LogModule, Matcher, ServerBuilder, ServerModule, ServiceDescriptor, LOG_MODULE};
use serde::Deserialize;
use serde_json::{json, Value};
use tonic::transport::Channel;
use tonic_health::pb::health_client::HealthClient;
use tonic_health::pb::HealthCheckRequest;
use tonic_health::server::health_reporter;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "muxgate")]
#[command(about = "Serve gRPC, a JSON gateway and plain HTTP on one listener")]
#[command(version)]
struct Args {
    /// Config file (.json or .toml), keyed by module name
    #[arg(short, long, env = "MUXGATE_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct HealthQuery {
    #[serde(default)]
    service: String,
}

/// `GET /v1/health?service=<name>`, answered by the health service over
/// the gateway's loopback channel.
fn register_health_gateway(mux: &mut GatewayMux, channel: Channel) -> anyhow::Result<()> {
    let client = HealthClient::new(channel);
    mux.route(
        "/v1/health",
        get(move |Query(query): Query<HealthQuery>| check_health(client.clone(), query.service)),
    );
    Ok(())
}

async fn check_health(
    mut client: HealthClient<Channel>,
    service: String,
) -> Result<Json<Value>, (StatusCode, String)> {
    let response = client
        .check(HealthCheckRequest {
            service: service.clone(),
        })
        .await
        .map_err(|status| match status.code() {
            tonic::Code::NotFound => (StatusCode::NOT_FOUND, status.message().to_string()),
            _ => (StatusCode::BAD_GATEWAY, status.message().to_string()),
        })?;
    let status = response.into_inner().status().as_str_name();
    Ok(Json(json!({ "service": service, "status": status })))
}

fn server_builder() -> anyhow::Result<ServerBuilder> {
    let (reporter, health) = health_reporter();

    let register: GatewayRegisterFn = Arc::new(register_health_gateway);
    let mut builder = ServerBuilder::new();
    builder
        .register_service_with_gateway(
            ServiceDescriptor::health(),
            health,
            register,
            vec![Matcher::path_prefix("/v1/")],
        )?
        .health_reporter(reporter)
        .http_handler(Router::new().route("/", get(|| async { "ok" })));
    Ok(builder)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => json!({}),
    };
    // The binary always logs; embedders opt in with a `log` section.
    if let Value::Object(sections) = &mut config {
        sections.entry(LOG_MODULE).or_insert_with(|| json!({}));
    }

    let registry = Arc::new(ModuleRegistry::new());
    registry.register(Arc::new(LogModule::new()))?;
    registry.register(Arc::new(ServerModule::new(server_builder()?)))?;
    registry.initialize(&config).await?;
    info!(modules = ?registry.names(), "muxgate started");

    let signals = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            match shutdown_signal().await {
                Ok(()) => registry.shutdown().await,
                Err(err) => error!(error = %err, "failed to install signal handlers"),
            }
        })
    };

    let result = registry.serve().await;
    signals.abort();
    registry.finalize().await;

    if let Err(err) = &result {
        error!(error = %err, "muxgate stopped with an error");
    }
    info!("muxgate stopped");
    Ok(result?)
}
