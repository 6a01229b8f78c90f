mod api;
mod authority;
mod config;
mod controller;
mod decoy;
mod error;
mod game;
mod provider;

use std::sync::Arc;
use anyhow::{anyhow, Context, Result};
use crate::authority::Authority;
use crate::config::Config;
use crate::controller::{ControllerOptions, DispatchController, EndpointSpec};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("dispatchd=info"))
        )
        .init();

    tracing::info!("Starting dispatchd");

    // Load config
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/dispatchd/dispatchd.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Loaded config from {} with {} servers", config_path, config.servers.len());

    // Set up resolution authority
    let authority = Arc::new(Authority::new(config.dns.ttl, &config.dns.root_domain, config.dns.listen));
    tracing::info!("Serving zone {} on {}", authority.root_domain(), config.dns.listen);

    // Create dispatch controller
    let controller = DispatchController::new(ControllerOptions::from_config(&config), authority.clone());
    let cancel = controller.quit_token();

    // Start DNS server; it is the one listener we cannot run without
    let mut authority_handle = tokio::spawn(authority.serve());

    // Register configured servers
    for server in &config.servers {
        let provider = match provider::build(&server.provider) {
            Ok(provider) => provider,
            Err(e) => {
                tracing::error!("Failed to build provider for {}: {:#}", server.name, e);
                continue;
            }
        };
        let spec = EndpointSpec {
            name: server.name.clone(),
            sub_domain: server.sub_domain.clone(),
            port: server.port,
            provider,
        };
        if let Err(e) = controller.register_endpoint(spec).await {
            tracing::error!("Failed to register {}: {}", server.name, e);
        }
    }

    // Start idle sweep
    let sweep_handle = tokio::spawn(controller.clone().run());

    // Build API router
    let app = api::routes::router(api::routes::AppState {
        controller: controller.clone(),
    });
    // Bind HTTP server
    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("API listening on {}", config.api.listen);

    // Run server with graceful shutdown
    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    // Wait for shutdown signal or authority failure
    let fatal = tokio::select! {
        result = shutdown_signal() => {
            result?;
            None
        }
        joined = &mut authority_handle => Some(match joined {
            Ok(Ok(())) => anyhow!("resolution authority exited unexpectedly"),
            Ok(Err(e)) => anyhow::Error::new(e),
            Err(e) => anyhow::Error::new(e),
        }),
    };

    // Tear down endpoints and stop background tasks
    controller.shutdown().await;

    if let Some(e) = fatal {
        let _ = tokio::join!(sweep_handle, server_handle);
        return Err(e.context("Resolution authority failed"));
    }

    // Wait for all tasks to complete
    let _ = tokio::join!(authority_handle, sweep_handle, server_handle);

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("Failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("Failed to listen for ctrl-c")?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");
    Ok(())
}
