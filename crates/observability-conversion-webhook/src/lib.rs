//! An HTTP server for the `ObservabilityPlatform` CRD conversion webhook.
//!
//! The server exposes the following routes:
//!
//! - `POST /convert` handles `ConversionReview`s sent by the API server
//! - `POST /migrations/plan` and `POST /migrations/dry-run` plan and preview
//!   bulk migrations of the resources sent in the request body
//! - `GET /metrics` returns the webhook and migration conversion counters and
//!   the cache statistics as JSON
//! - `GET /health` always returns `ok`
//!
//! TLS is expected to be terminated in front of the server.
//!
//! ```
//! use observability_conversion_webhook::{ConversionServer, ServerOptions};
//!
//! let options = ServerOptions::builder().bind_port(9443).build();
//! let router = ConversionServer::new(options)?.router();
//! # Ok::<(), observability_conversion_webhook::Error>(())
//! ```
use std::{net::SocketAddr, sync::Arc};

use axum::{
    Router,
    routing::{get, post},
};
use observability_conversion::{
    metrics::{ConversionCounters, ConversionMetrics},
    migration::MigrationManager,
    optimizer::ConversionOptimizer,
    platform,
    preservation::{PreservationEngine, PreservationPolicy},
    webhook::ConversionWebhook,
};
use snafu::{ResultExt, Snafu};
use tokio::{
    net::TcpListener,
    signal::unix::{SignalKind, signal},
};
use tower_http::trace::TraceLayer;

pub mod cli;
pub mod constants;
pub mod handlers;
pub mod logging;
pub mod options;

// Selected re-exports
pub use crate::options::ServerOptions;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to build the built-in converter"))]
    BuildConverter { source: platform::Error },

    #[snafu(display("failed to bind TCP listener to {socket_addr}"))]
    BindTcpListener {
        source: std::io::Error,
        socket_addr: SocketAddr,
    },

    #[snafu(display("failed to create unix signal handler"))]
    CreateSignalHandler { source: std::io::Error },

    #[snafu(display("failed to run server"))]
    RunServer { source: std::io::Error },
}

/// State shared by all request handlers.
#[derive(Debug)]
pub struct AppState {
    pub webhook: ConversionWebhook,
    pub migrations: MigrationManager,
    pub optimizer: Arc<ConversionOptimizer>,

    /// Conversions requested by the API server.
    pub webhook_counters: Arc<ConversionCounters>,

    /// Conversions run by executed migrations. Dry runs are not counted.
    pub migration_counters: Arc<ConversionCounters>,
}

impl AppState {
    /// Wires the built-in converter, the optimizer and the migration manager
    /// together. The webhook and the migrations report to separate counters.
    pub fn new(options: ServerOptions) -> Result<Self> {
        let webhook_counters = Arc::new(ConversionCounters::default());
        let migration_counters = Arc::new(ConversionCounters::default());
        let preservation = PreservationEngine::new(PreservationPolicy::standard())
            .with_max_size(options.max_preserved_bytes);

        let converter = platform::converter()
            .context(BuildConverterSnafu)?
            .with_preservation(preservation);
        let optimizer = Arc::new(ConversionOptimizer::new(
            Arc::new(
                converter
                    .clone()
                    .with_metrics(Arc::clone(&migration_counters) as Arc<dyn ConversionMetrics>),
            ),
            options.optimizer,
        ));
        let converter = converter.with_metrics(Arc::clone(&webhook_counters) as Arc<dyn ConversionMetrics>);

        Ok(Self {
            webhook: ConversionWebhook::for_platform(Arc::new(converter)),
            migrations: MigrationManager::new(Arc::clone(&optimizer))
                .with_batch_config(options.batch),
            optimizer,
            webhook_counters,
            migration_counters,
        })
    }
}

/// A ready-to-use conversion webhook server.
pub struct ConversionServer {
    router: Router,
    socket_addr: SocketAddr,
}

impl ConversionServer {
    pub fn new(options: ServerOptions) -> Result<Self> {
        tracing::debug!(?options, "create conversion server");
        let socket_addr = options.socket_addr;
        let state = Arc::new(AppState::new(options)?);

        Ok(Self {
            router: router(state),
            socket_addr,
        })
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Runs the server until SIGINT or SIGTERM is received. Requests in
    /// flight are completed before this returns.
    pub async fn run(self) -> Result<()> {
        let mut sigint = signal(SignalKind::interrupt()).context(CreateSignalHandlerSnafu)?;
        let mut sigterm = signal(SignalKind::terminate()).context(CreateSignalHandlerSnafu)?;
        let shutdown = async move {
            tokio::select! {
                _ = sigint.recv() => tracing::debug!("received SIGINT"),
                _ = sigterm.recv() => tracing::debug!("received SIGTERM"),
            }
        };

        let listener = TcpListener::bind(self.socket_addr)
            .await
            .context(BindTcpListenerSnafu {
                socket_addr: self.socket_addr,
            })?;
        tracing::info!(socket_addr = %self.socket_addr, "listening for requests");

        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await
            .context(RunServerSnafu)?;

        tracing::info!("server shut down");
        Ok(())
    }
}

/// Creates the router serving all routes with `state`.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/convert", post(handlers::convert))
        .route("/migrations/plan", post(handlers::plan_migration))
        .route("/migrations/dry-run", post(handlers::dry_run_migration))
        .route("/metrics", get(handlers::metrics))
        .layer(TraceLayer::new_for_http())
        // The health route is below the TraceLayer so as not to be traced
        .route("/health", get(|| async { "ok" }))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;

    fn server() -> Router {
        ConversionServer::new(ServerOptions::default())
            .expect("built-in converter is valid")
            .router()
    }

    async fn send(router: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => request.body(Body::empty()),
        }
        .expect("valid request");

        let response = router.oneshot(request).await.expect("router is infallible");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body can be read");

        let body = serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
        (status, body)
    }

    fn platform(name: &str, prometheus_version: &str) -> Value {
        json!({
            "apiVersion": "observability.io/v1alpha1",
            "kind": "ObservabilityPlatform",
            "metadata": {"name": name, "namespace": "monitoring"},
            "spec": {"components": {"prometheus": {"enabled": true, "version": prometheus_version}}},
        })
    }

    fn review(objects: Vec<Value>) -> Value {
        json!({
            "apiVersion": "apiextensions.k8s.io/v1",
            "kind": "ConversionReview",
            "request": {
                "uid": "0c3e4d8f-1f0b-4a4a-9d8e-6a5c2f1f7c11",
                "desiredAPIVersion": "observability.io/v1beta1",
                "objects": objects,
            },
        })
    }

    #[tokio::test]
    async fn health() {
        let (status, body) = send(server(), "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn conversions_are_counted() {
        let router = server();

        let (status, body) = send(
            router.clone(),
            "POST",
            "/convert",
            Some(review(vec![platform("prod", "2.45.0")])),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["response"]["result"]["status"], "Success");
        assert_eq!(
            body["response"]["convertedObjects"][0]["spec"]["components"]["prometheus"]["version"],
            "v2.45.0"
        );

        // Failed conversions still answer with 200 and carry the failure in the review
        let (status, body) = send(
            router.clone(),
            "POST",
            "/convert",
            Some(review(vec![platform("broken", "2.45.0"), json!({"kind": "Unknown"})])),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["response"]["result"]["status"], "Failure");

        // Dry runs are not conversions requested by the API server
        let dry_run = json!({
            "sourceVersion": "v1alpha1",
            "targetVersion": "v1beta1",
            "resources": [platform("staging", "2.48.0")],
        });
        let (status, _) = send(router.clone(), "POST", "/migrations/dry-run", Some(dry_run)).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(router, "GET", "/metrics", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body["conversions"],
            json!({"total": 3, "succeeded": 1, "failed": 2})
        );
        assert_eq!(
            body["migrations"],
            json!({"total": 0, "succeeded": 0, "failed": 0})
        );
    }

    #[tokio::test]
    async fn migrations_can_be_planned() {
        let request = json!({
            "sourceVersion": "v1alpha1",
            "targetVersion": "v1beta1",
            "resources": [platform("prod", "2.45.0"), platform("staging", "2.48.0")],
        });

        let (status, body) = send(server(), "POST", "/migrations/plan", Some(request)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["totalResources"], 2);
        assert_eq!(body["path"], json!(["v1alpha1", "v1beta1"]));
        assert_eq!(body["phases"].as_array().map(Vec::len), Some(4));
    }

    #[tokio::test]
    async fn dry_runs_report_invalid_resources() {
        let request = json!({
            "sourceVersion": "v1alpha1",
            "targetVersion": "v1beta1",
            "resources": [platform("prod", "2.45.0"), platform("broken", "latest")],
        });

        let (status, body) = send(server(), "POST", "/migrations/dry-run", Some(request)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["failed"], 1);
        assert_eq!(body["resources"][1]["key"]["name"], "broken");
    }

    #[tokio::test]
    async fn unknown_versions_are_rejected() {
        let request = json!({
            "sourceVersion": "v1alpha1",
            "targetVersion": "v2",
            "resources": [],
        });

        let (status, body) = send(server(), "POST", "/migrations/plan", Some(request)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(
            body["message"]
                .as_str()
                .is_some_and(|message| message.starts_with("failed to plan migration")),
            "{body}"
        );
    }
}
