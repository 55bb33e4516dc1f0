//! HTTP front end over [`DeviceService`].
//!
//! | Route                          | Response                              |
//! |--------------------------------|---------------------------------------|
//! | `GET /`                        | usage text                            |
//! | `GET /set?param=..&value=..`   | confirmed frame as JSON               |
//! | `GET /getall`                  | fresh frame as JSON                   |
//! | `GET /params`                  | registry contents as JSON             |
//!
//! Validation failures are 400, a rejected write 409, an exhausted budget 504.

use crate::error::ServiceError;
use crate::protocol::registry::ParameterSpec;
use crate::service::DeviceService;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tower_http::trace::{DefaultOnResponse, TraceLayer};
use tower_http::LatencyUnit;
use tracing::Level;

/// Body of a 400 for an unknown or missing parameter.
pub const INCORRECT_PARAM: &str = "error: incorrect param!";
/// Body of a 400 for a bad value.
pub const INCORRECT_VALUE: &str = "error: incorrect value!";

const USAGE: &str = "\
Middleware between the graphitizer microcontroller and its user interface.
Commands are sent to the controller with HTTP GET requests.

SET:
  /set?param=V00&value=255   level V00..V08, 0..255
  /set?param=T01&value=80    threshold T01..T08, 0..999
  /set?param=PUMP_ON         pump on (PUMP_OFF for off)

GET_ALL:
  /getall

PARAMETERS:
  /params
";

#[derive(Debug, Deserialize)]
struct SetQuery {
    param: Option<String>,
    value: Option<String>,
}

/// Build the router. Exposed separately from [`ApiServer`] for embedding.
pub fn router(service: Arc<DeviceService>) -> Router {
    Router::new()
        .route("/", get(usage))
        .route("/set", get(set))
        .route("/getall", get(get_all))
        .route("/params", get(params))
        .layer(
            TraceLayer::new_for_http().on_response(
                DefaultOnResponse::new()
                    .level(Level::INFO)
                    .latency_unit(LatencyUnit::Millis),
            ),
        )
        .with_state(service)
}

async fn usage() -> &'static str {
    USAGE
}

async fn set(State(service): State<Arc<DeviceService>>, Query(query): Query<SetQuery>) -> Response {
    let Some(param) = query.param.filter(|p| !p.is_empty()) else {
        return (StatusCode::BAD_REQUEST, INCORRECT_PARAM).into_response();
    };
    match service.set(&param, query.value.as_deref()).await {
        Ok(frame) => Json(frame).into_response(),
        Err(err) => error_response(err),
    }
}

async fn get_all(State(service): State<Arc<DeviceService>>) -> Response {
    match service.snapshot().await {
        Ok(frame) => Json(frame).into_response(),
        Err(err) => error_response(err),
    }
}

async fn params(State(service): State<Arc<DeviceService>>) -> Json<Vec<ParameterSpec>> {
    Json(service.registry().specs().cloned().collect())
}

fn error_response(err: ServiceError) -> Response {
    match err {
        ServiceError::Validation(validation) => {
            tracing::info!(error = %validation, "Invalid request");
            let body = if validation.is_parameter_error() {
                INCORRECT_PARAM
            } else {
                INCORRECT_VALUE
            };
            (StatusCode::BAD_REQUEST, body).into_response()
        }
        ServiceError::Rejected(reason) => {
            tracing::warn!(%reason, "Write rejected");
            (StatusCode::CONFLICT, format!("error: {reason}")).into_response()
        }
        err @ ServiceError::TimedOut { .. } => {
            tracing::warn!(error = %err, "Device did not confirm");
            (StatusCode::GATEWAY_TIMEOUT, format!("error: {err}")).into_response()
        }
    }
}

/// Binds the listener and serves [`router`] until shut down.
pub struct ApiServer {
    listen: SocketAddr,
    service: Arc<DeviceService>,
}

impl ApiServer {
    /// Server for `service` on `listen`. Port 0 picks a free port.
    pub fn new(listen: SocketAddr, service: Arc<DeviceService>) -> Self {
        Self { listen, service }
    }

    /// Bind and start serving in a background task.
    pub async fn spawn(self) -> std::io::Result<ApiHandle> {
        let listener = TcpListener::bind(self.listen).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(address = %local_addr, "HTTP API listening");

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let server = axum::serve(listener, router(self.service)).with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        });
        let task = tokio::spawn(async move {
            if let Err(err) = server.await {
                tracing::warn!(error = %err, "HTTP API exited with error");
            }
        });

        Ok(ApiHandle {
            address: local_addr,
            task,
            shutdown: shutdown_tx,
        })
    }
}

/// Handle to a running [`ApiServer`].
pub struct ApiHandle {
    address: SocketAddr,
    task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl ApiHandle {
    /// Address actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// Stop accepting connections and wait for in-flight requests.
    pub async fn shutdown(self) -> Result<(), JoinError> {
        let _ = self.shutdown.send(true);
        self.task.await
    }
}
