use anyhow::Result;
use hyper::{server::conn::http1, service::service_fn};
use hyper_util::rt::tokio::TokioIo;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod api;
mod checker;
mod config;

use api::{ApiState, LogOwner};
use checker::RuntimeChecker;
use config::AgentConfig;
use endpoint_core::Owner;
use endpoint_manager::EndpointManager;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting endpoint-agent...");

    let config = AgentConfig::from_env();
    debug!(?config, "Loaded agent configuration");

    let manager = Arc::new(EndpointManager::from_config(&config.manager));
    let owner: Arc<dyn Owner> = Arc::new(LogOwner);
    let cancel = CancellationToken::new();
    info!(
        max_inflight = config.manager.max_inflight,
        "Endpoint manager initialized"
    );

    let gc = if config.manager.gc_interval.is_zero() {
        warn!("Endpoint GC disabled");
        None
    } else {
        let checker = Arc::new(RuntimeChecker::new(
            config.runtime_state_dir.clone(),
            manager.clone(),
            owner.clone(),
        ));
        info!(
            "Endpoint GC running every {:?} against {}",
            config.manager.gc_interval,
            config.runtime_state_dir.display()
        );
        Some(manager.with_periodic_endpoint_gc(
            cancel.clone(),
            checker,
            config.manager.gc_interval,
            config.manager.error_retry_base,
        ))
    };

    let state = ApiState {
        manager: manager.clone(),
        owner,
    };

    let listener = TcpListener::bind(&config.listen).await?;
    info!("Endpoint API listening on {}", config.listen);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        let (stream, peer_addr) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
        };
        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req| api::handle_request(req, state.clone()));

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!("Error serving connection from {}: {}", peer_addr, e);
            }
        });
    }

    cancel.cancel();
    if let Some(gc) = gc {
        gc.stop().await;
    }
    manager.remove_all();
    info!("endpoint-agent stopped");

    Ok(())
}
