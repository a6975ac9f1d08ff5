//! Server lifecycle
//!
//! Starts the HTTP signaling server, logs relay events, and on shutdown ends
//! every stream before letting in-flight requests drain.

use anyhow::Context;
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use whipcast_sfu::{Relay, RelayEvent};

use crate::config::Config;

/// Upper bound on waiting for in-flight requests after shutdown starts
const DRAIN_TIMEOUT: Duration = Duration::from_secs(15);

/// Whipcast server - owns the relay and the HTTP listener
pub struct WhipcastServer {
    config: Config,
    relay: Arc<Relay>,
}

impl WhipcastServer {
    #[must_use]
    pub const fn new(config: Config, relay: Arc<Relay>) -> Self {
        Self { config, relay }
    }

    /// HTTP routes backed by this server's relay
    fn router(&self) -> Router {
        whipcast_api::create_router(
            Arc::clone(&self.relay),
            self.config.server.static_dir.clone(),
        )
    }

    /// Serve until a shutdown signal arrives or the HTTP server dies
    pub async fn start(self) -> anyhow::Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let http_address = self.config.http_address();
        let listener = TcpListener::bind(&http_address)
            .await
            .with_context(|| format!("Failed to bind HTTP address {http_address}"))?;
        info!("HTTP server listening on {}", http_address);

        let mut http_handle = serve(listener, self.router(), shutdown_rx);
        spawn_event_logger(self.relay.subscribe_events());

        let stopped_early = tokio::select! {
            _ = &mut http_handle => {
                error!("HTTP server stopped unexpectedly");
                true
            }
            () = shutdown_signal() => {
                info!("Shutdown signal received, starting graceful shutdown...");
                false
            }
        };

        let _ = shutdown_tx.send(true);
        self.relay.shutdown().await;

        if !stopped_early && tokio::time::timeout(DRAIN_TIMEOUT, http_handle).await.is_err() {
            warn!(
                "Drain timeout reached after {:?}, proceeding with shutdown",
                DRAIN_TIMEOUT
            );
        }

        info!("Whipcast server shut down complete");
        Ok(())
    }
}

/// Run the HTTP server until `shutdown_rx` flips
fn serve(listener: TcpListener, router: Router, shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut rx = shutdown_rx;
        let graceful = async move {
            let _ = rx.changed().await;
        };

        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(graceful)
            .await
        {
            error!("HTTP server error: {}", e);
        }

        info!("HTTP server shut down gracefully");
    })
}

/// Log relay lifecycle events until the relay goes away
fn spawn_event_logger(mut events: broadcast::Receiver<RelayEvent>) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => debug!(event = ?event, "Relay event"),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Relay event logger lagged by {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use whipcast_sfu::testing::MemoryTransport;
    use whipcast_sfu::RelayConfig;

    fn server() -> WhipcastServer {
        let relay = Arc::new(Relay::new(
            RelayConfig::default(),
            Arc::new(MemoryTransport::new()),
        ));
        WhipcastServer::new(Config::default(), relay)
    }

    async fn get(router: Router, path: &str) -> (StatusCode, String) {
        let response = router
            .oneshot(Request::get(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_router_serves_monitoring() {
        let server = server();

        let (status, body) = get(server.router(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK");

        let (status, body) = get(server.router(), "/api/streams").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("\"total\":0"));
    }

    #[tokio::test]
    async fn test_serve_until_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = serve(listener, server().router(), shutdown_rx);
        assert!(!handle.is_finished());

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
