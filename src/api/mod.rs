//! HTTP surface of the coordinator.
//!
//! | Route | Auth | Purpose |
//! |---|---|---|
//! | `POST /predict` | yes | run or enqueue source references |
//! | `GET /status` | yes | state of a task key |
//! | `GET /health` | no | liveness plus dispatcher and queue stats |
//! | `GET /metrics` | no | Prometheus exposition |

pub mod auth;
pub mod error;
pub mod handlers;

use std::sync::Arc;
use std::time::Instant;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::metrics::metrics_handler;
use crate::scheduler::{Dispatcher, DurableQueue};

pub use auth::auth_middleware;
pub use error::ApiError;
pub use handlers::{PredictRequest, StatusQuery, SubmitMode};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Dispatcher,
    pub queue: Arc<dyn DurableQueue>,
    /// `None` disables authentication.
    pub api_token: Option<Arc<str>>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        dispatcher: Dispatcher,
        queue: Arc<dyn DurableQueue>,
        api_token: Option<String>,
    ) -> Self {
        Self {
            dispatcher,
            queue,
            api_token: api_token.filter(|t| !t.is_empty()).map(Arc::from),
            started_at: Instant::now(),
        }
    }
}

/// Builds the application router.
pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/predict", post(handlers::predict))
        .route("/status", get(handlers::status))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    let public = Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(metrics_handler));

    Router::new().merge(protected).merge(public).with_state(state)
}

/// Serves the router until `shutdown` resolves.
pub async fn serve<F>(
    state: AppState,
    bind_addr: &str,
    shutdown: F,
) -> std::io::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "HTTP API listening");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
