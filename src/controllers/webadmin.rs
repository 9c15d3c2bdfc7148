//! Web administration controller
//!
//! Serves a small JSON API over HTTP while the controller is started:
//!
//! - `GET /health`
//! - `GET /controllers` the state of every supervised controller
//! - `GET /configuration` the exported configuration snapshot
//! - `POST /controllers/{name}/start` and `POST /controllers/{name}/stop`
//!
//! Start and stop requests are forwarded to the director over the message
//! bus, so they go through the same checks as any other remote caller.

use super::Controller;
use crate::bus::MessageBus;
use crate::config::{parse_integer, Section, SharedConfig};
use crate::loader::LoadContext;
use crate::protocol::{controller_state, ControlClient};
use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 9808;

#[derive(Clone)]
struct AdminState {
    config: SharedConfig,
    bus: Option<Arc<dyn MessageBus>>,
}

struct Server {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl Server {
    fn is_running(&self) -> bool {
        self.shutdown.is_some() && !self.task.is_finished()
    }
}

pub struct WebAdminController {
    ctx: LoadContext,
    host: String,
    port: u16,
    server: Option<Server>,
}

impl std::fmt::Debug for WebAdminController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebAdminController")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("addr", &self.local_addr())
            .finish()
    }
}

impl WebAdminController {
    pub fn new(ctx: LoadContext) -> Self {
        Self {
            ctx,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            server: None,
        }
    }

    /// Address the server is listening on while started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server
            .as_ref()
            .filter(|s| s.is_running())
            .map(|s| s.addr)
    }

    fn router(&self) -> Router {
        let state = AdminState {
            config: self.ctx.config.clone(),
            bus: self.ctx.bus.clone(),
        };
        Router::new()
            .route("/health", get(health_check))
            .route("/controllers", get(list_controllers))
            .route("/configuration", get(configuration))
            .route("/controllers/{name}/start", post(start_controller))
            .route("/controllers/{name}/stop", post(stop_controller))
            .layer(CorsLayer::permissive())
            .with_state(state)
    }
}

#[async_trait]
impl Controller for WebAdminController {
    async fn set_up(&mut self, config: &Section) -> Result<()> {
        if let Some(host) = config.get("host") {
            self.host = host.clone();
        }
        if let Some(port) = config.get("port") {
            let port = parse_integer("webadmin", "port", port)?;
            self.port = u16::try_from(port).with_context(|| format!("port {} is out of range", port))?;
        }
        debug!("Web admin will listen on {}:{}", self.host, self.port);
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        if self.local_addr().is_some() {
            debug!("Web admin already running");
            return Ok(());
        }
        if let Some(old) = self.server.take() {
            old.task.abort();
        }

        let bind = format!("{}:{}", self.host, self.port);
        let listener = TcpListener::bind(&bind)
            .await
            .with_context(|| format!("Failed to bind web admin to {}", bind))?;
        let addr = listener.local_addr()?;
        let app = self.router();
        let (tx, rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let shutdown = async move {
                let _ = rx.await;
            };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!("Web admin server error: {}", e);
            }
            debug!("Web admin server finished");
        });

        info!("Web admin listening on http://{}", addr);
        self.server = Some(Server {
            addr,
            shutdown: Some(tx),
            task,
        });
        Ok(())
    }

    async fn is_started(&mut self) -> Result<bool> {
        Ok(self.local_addr().is_some())
    }

    async fn stop(&mut self) -> Result<()> {
        match self.server.as_mut() {
            Some(server) => {
                if let Some(tx) = server.shutdown.take() {
                    info!("Stopping web admin on {}", server.addr);
                    let _ = tx.send(());
                }
            }
            None => debug!("Web admin is not running, ignoring stop"),
        }
        Ok(())
    }

    async fn is_stopped(&mut self) -> Result<bool> {
        Ok(self.local_addr().is_none())
    }

    async fn tear_down(&mut self) -> Result<()> {
        self.stop().await?;
        if let Some(server) = self.server.take() {
            server.task.abort();
        }
        Ok(())
    }
}

async fn health_check() -> (StatusCode, Json<Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "timestamp": chrono::Utc::now().to_rfc3339()
        })),
    )
}

async fn list_controllers(State(state): State<AdminState>) -> (StatusCode, Json<Value>) {
    match controller_state(&state.config).await {
        Ok(entries) => (StatusCode::OK, Json(json!({ "controllers": entries }))),
        Err(e) => {
            error!("{}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
        }
    }
}

async fn configuration(State(state): State<AdminState>) -> (StatusCode, Json<Value>) {
    match state.config.export_configuration() {
        Ok(snapshot) => (StatusCode::OK, Json(snapshot)),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

async fn start_controller(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> (StatusCode, Json<Value>) {
    forward(&state, &name, true).await
}

async fn stop_controller(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> (StatusCode, Json<Value>) {
    forward(&state, &name, false).await
}

async fn forward(state: &AdminState, name: &str, start: bool) -> (StatusCode, Json<Value>) {
    let Some(bus) = state.bus.clone() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "director messaging is disabled" })),
        );
    };
    let client = ControlClient::new(bus);
    let outcome = if start {
        client.controller_start(name).await
    } else {
        client.controller_stop(name).await
    };
    match outcome {
        Ok(data) => (StatusCode::OK, Json(json!({ "result": "ok", "data": data }))),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "result": "error", "data": e.to_string() })),
        ),
    }
}
