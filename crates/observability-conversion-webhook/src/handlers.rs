//! Request handlers of the [`ConversionServer`][crate::ConversionServer].
use std::sync::Arc;

use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use observability_conversion::{
    VersionedResource,
    batch::error_chain,
    metrics::CounterSnapshot,
    migration::{DryRunResult, MigrationPlan},
    optimizer::CacheStats,
    resource::ResourceError,
    schema,
    webhook::ConversionReview,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use snafu::{ResultExt, Snafu};
use tracing::instrument;

use crate::AppState;

#[derive(Debug, Snafu)]
pub enum HandlerError {
    #[snafu(display("failed to parse resource at index {index}"))]
    ParseResource { source: ResourceError, index: usize },

    #[snafu(display("failed to plan migration from {from:?} to {to:?}"))]
    PlanMigration {
        source: schema::Error,
        from: String,
        to: String,
    },
}

impl IntoResponse for HandlerError {
    fn into_response(self) -> Response {
        let message = error_chain(&self);
        tracing::warn!(error = %message, "rejected migration request");

        (StatusCode::BAD_REQUEST, Json(json!({ "message": message }))).into_response()
    }
}

/// The body of the migration endpoints.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRequest {
    pub source_version: String,
    pub target_version: String,
    pub resources: Vec<Value>,
}

impl MigrationRequest {
    fn parse_resources(self) -> Result<(String, String, Vec<VersionedResource>), HandlerError> {
        let resources = self
            .resources
            .into_iter()
            .enumerate()
            .map(|(index, resource)| {
                VersionedResource::from_value(resource).context(ParseResourceSnafu { index })
            })
            .collect::<Result<_, _>>()?;

        Ok((self.source_version, self.target_version, resources))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsResponse {
    /// Conversions requested through `/convert`.
    pub conversions: CounterSnapshot,
    pub migrations: CounterSnapshot,
    pub cache: CacheStats,
}

pub async fn convert(
    State(state): State<Arc<AppState>>,
    Json(review): Json<ConversionReview>,
) -> Json<ConversionReview> {
    // Failures are reported inside the review, the API server always expects 200
    Json(state.webhook.convert_review(review))
}

#[instrument(skip_all, fields(from = %request.source_version, to = %request.target_version))]
pub async fn plan_migration(
    State(state): State<Arc<AppState>>,
    Json(request): Json<MigrationRequest>,
) -> Result<Json<MigrationPlan>, HandlerError> {
    let (from, to, resources) = request.parse_resources()?;

    state
        .migrations
        .plan_migration(&resources, &from, &to)
        .map(Json)
        .context(PlanMigrationSnafu { from, to })
}

#[instrument(skip_all, fields(from = %request.source_version, to = %request.target_version))]
pub async fn dry_run_migration(
    State(state): State<Arc<AppState>>,
    Json(request): Json<MigrationRequest>,
) -> Result<Json<DryRunResult>, HandlerError> {
    let (from, to, resources) = request.parse_resources()?;

    Ok(Json(state.migrations.dry_run_migration(&resources, &from, &to)))
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> Json<MetricsResponse> {
    Json(MetricsResponse {
        conversions: state.webhook_counters.snapshot(),
        migrations: state.migration_counters.snapshot(),
        cache: state.optimizer.cache_stats(),
    })
}
