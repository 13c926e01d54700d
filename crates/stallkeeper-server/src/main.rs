use clap::Parser;
use stallkeeper_server::server::{
    config::{CliArgs, EventFormat, ServerConfig},
    events::{EventSink, LineSink, TracingSink},
    service::StallService,
    shutdown::ShutdownCoordinator,
    telemetry::init_telemetry,
};
use std::sync::Arc;
use tokio::signal;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry()?;
    log_startup_info(&config);

    let events: Arc<dyn EventSink> = match config.events {
        EventFormat::Lines => Arc::new(LineSink::new()),
        EventFormat::Tracing => Arc::new(TracingSink),
    };

    let service = StallService::new(config, events)?;
    let signals = tokio::spawn(shutdown_signal(service.coordinator()));

    let result = service.run().await;
    signals.abort();

    if result.is_ok() {
        tracing::info!("Service shut down successfully");
    }
    providers.shutdown();

    result?;
    Ok(())
}

fn log_startup_info(config: &ServerConfig) {
    if cfg!(debug_assertions) {
        tracing::info!("Starting admission service with full config: {config:#?}");
    } else {
        tracing::info!(
            "Starting admission service on {}",
            config.inbound_path.display()
        );
    }
}

/// Triggers shutdown early on Ctrl+C or SIGTERM.
async fn shutdown_signal(coordinator: Arc<ShutdownCoordinator>) {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }

    tracing::info!("Shutdown signal received, draining...");
    coordinator.trigger();
}
