//! `RelayServer` — Axum HTTP server carrying the `/ops` websocket plus the
//! `/health` and `/metrics` endpoints.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::{State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use bridle_registry::registry::SessionRegistry;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::broadcast::ConnectionRegistry;
use crate::commands::OpsCommandRegistry;
use crate::config::RelayConfig;
use crate::health;
use crate::metrics::OPS_CONNECTIONS_REFUSED_TOTAL;
use crate::pressure::{self, MemoryProbe, ProcMemoryProbe};
use crate::runtime::{DebuggerFactory, SessionDrivers};
use crate::session_loop::run_ops_session;
use crate::shutdown::ShutdownCoordinator;

/// Shared state accessible from Axum handlers and the session loop.
#[derive(Clone)]
pub struct AppState {
    /// Connected ops clients.
    pub connections: Arc<ConnectionRegistry>,
    /// Session registry (admission, lookup, lease gate).
    pub registry: Arc<SessionRegistry>,
    /// Per-session runtimes.
    pub drivers: Arc<SessionDrivers>,
    /// Ops command surface.
    pub commands: Arc<OpsCommandRegistry>,
    /// Relay configuration.
    pub config: Arc<RelayConfig>,
    /// When the server started.
    pub start_time: Instant,
    /// Rendering handle for `/metrics`, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
}

/// The relay server.
pub struct RelayServer {
    config: Arc<RelayConfig>,
    connections: Arc<ConnectionRegistry>,
    registry: Arc<SessionRegistry>,
    drivers: Arc<SessionDrivers>,
    commands: Arc<OpsCommandRegistry>,
    shutdown: Arc<ShutdownCoordinator>,
    probe: Arc<dyn MemoryProbe>,
    metrics: Option<PrometheusHandle>,
    start_time: Instant,
}

impl RelayServer {
    /// Build a server around a debugger factory.
    pub fn new(config: RelayConfig, factory: Arc<dyn DebuggerFactory>) -> Self {
        let connections = Arc::new(ConnectionRegistry::new());
        let registry = Arc::new(SessionRegistry::new(config.governor.clone()));
        let drivers = Arc::new(SessionDrivers::new(
            factory,
            Arc::clone(&registry),
            Arc::clone(&connections),
        ));
        Self {
            config: Arc::new(config),
            connections,
            registry,
            drivers,
            commands: Arc::new(OpsCommandRegistry::with_defaults()),
            shutdown: Arc::new(ShutdownCoordinator::new()),
            probe: Arc::new(ProcMemoryProbe),
            metrics: None,
            start_time: Instant::now(),
        }
    }

    /// Attach a Prometheus handle for `/metrics`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Replace the memory probe (tests inject fixed readings).
    #[must_use]
    pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// The session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// The shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// The server configuration.
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    fn state(&self) -> AppState {
        AppState {
            connections: Arc::clone(&self.connections),
            registry: Arc::clone(&self.registry),
            drivers: Arc::clone(&self.drivers),
            commands: Arc::clone(&self.commands),
            config: Arc::clone(&self.config),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
            shutdown: Arc::clone(&self.shutdown),
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/ops", get(ops_handler))
            .layer(CorsLayer::permissive())
            .with_state(self.state())
    }

    /// Bind and serve. Returns once the listener is up; the accept loop and
    /// the pressure sampler run on background tasks until shutdown.
    pub async fn serve(self) -> std::io::Result<RelayHandle> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "relay listening");

        pressure::seed_governors(&self.registry);
        let sampler = pressure::spawn_sampler(
            Arc::clone(&self.registry),
            Arc::clone(&self.drivers),
            Arc::clone(&self.connections),
            Arc::clone(&self.probe),
            Duration::from_secs(self.config.sample_interval_secs),
            Duration::from_secs(self.config.idle_session_ttl_secs),
            self.shutdown.token(),
        );

        let app = self.router();
        let shutdown = Arc::clone(&self.shutdown);
        let drivers = Arc::clone(&self.drivers);
        let serve_token = shutdown.token();
        let server = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { serve_token.cancelled().await })
                .await;
            if let Err(err) = result {
                warn!(%err, "relay server exited with error");
            }
        });

        Ok(RelayHandle {
            addr: local_addr,
            shutdown,
            drivers,
            tasks: vec![server, sampler],
        })
    }
}

/// Handle to a running relay: its bound address and shutdown control.
pub struct RelayHandle {
    /// Address the listener is bound to.
    pub addr: SocketAddr,
    shutdown: Arc<ShutdownCoordinator>,
    drivers: Arc<SessionDrivers>,
    tasks: Vec<JoinHandle<()>>,
}

impl RelayHandle {
    /// `ws://` URL of the ops endpoint.
    #[must_use]
    pub fn ops_url(&self) -> String {
        format!("ws://{}/ops", self.addr)
    }

    /// Signal shutdown and wait for the background tasks to drain.
    pub async fn shutdown(self) {
        self.shutdown.shutdown();
        self.drivers.stop_all().await;
        self.shutdown.graceful_shutdown(self.tasks, None).await;
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<health::HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.connections.count(),
        state.registry.session_count(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => crate::metrics::render(handle).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

/// GET /ops — websocket upgrade, refused past the connection cap.
async fn ops_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    if state.connections.count() >= state.config.max_connections {
        counter!(OPS_CONNECTIONS_REFUSED_TOTAL).increment(1);
        warn!(
            max_connections = state.config.max_connections,
            "refusing upgrade, connection cap reached"
        );
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    }
    if state.shutdown.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }
    ws.on_upgrade(move |socket| run_ops_session(socket, state))
}
