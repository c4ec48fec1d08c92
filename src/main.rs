//! chatd - chat completion daemon
//!
//! Serves chat completions over gRPC from a pool of local llama.cpp
//! inference contexts.

use anyhow::Context;
use chatd::config::{CliArgs, ServiceConfig};
use chatd::lifecycle::Supervisor;
use chatd::server::proto::chat_service_server::ChatServiceServer;
use chatd::server::{proto, ChatFrontEnd};
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic_reflection::server::Builder;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("chatd=info".parse()?))
        .init();

    let args = CliArgs::parse();
    let config = ServiceConfig::from_args(args).context("invalid configuration")?;

    info!("Starting chatd v{}", env!("CARGO_PKG_VERSION"));

    let supervisor = Arc::new(
        Supervisor::start(&config)
            .await
            .context("failed to start worker pool")?,
    );
    let front_end = ChatFrontEnd::new(supervisor.arbiter().clone(), config.clone());

    let reflection = Builder::configure()
        .register_encoded_file_descriptor_set(proto::FILE_DESCRIPTOR_SET)
        .build_v1()?;

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, workers = config.workers, "listening");

    Server::builder()
        .add_service(reflection)
        .add_service(ChatServiceServer::new(front_end))
        .serve_with_incoming_shutdown(
            TcpListenerStream::new(listener),
            shutdown_signal(Arc::clone(&supervisor), config.grace_period()),
        )
        .await?;

    info!("Service shut down successfully");
    Ok(())
}

/// Waits for Ctrl+C or SIGTERM, then drains the arbiter before letting the
/// server close. In-flight RPCs observe their job outcomes during the drain.
async fn shutdown_signal(supervisor: Arc<Supervisor>, grace: std::time::Duration) {
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C signal"),
        () = terminate => info!("Received SIGTERM signal"),
    }

    supervisor.shutdown(grace).await;
}
