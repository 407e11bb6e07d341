//! Planning, validation, dry runs and execution of bulk migrations.
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use indexmap::IndexMap;
use serde::{Serialize, Serializer};
use serde_json::Value;
use snafu::{ResultExt, Snafu, ensure};
use strum::Display;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    batch::{BatchConfig, BatchProcessor, BatchResult, ResourceFailure, RetryableError, error_chain},
    convert::{ConversionOutcome, ConversionWarning, Severity},
    optimizer::{self, ComplexityAnalysis, ConversionOptimizer, analyze_complexity},
    path::{self, FieldPath},
    resource::{ResourceKey, VersionedResource},
    schema::{self, SchemaEvolutionTracker, VersionSchema},
    store::{self, ResourceStore},
    validation::{self, FieldError},
};

/// Time to convert a resource of average complexity by a single step.
const BASE_CONVERSION_TIME: Duration = Duration::from_millis(20);
const VALIDATION_TIME: Duration = Duration::from_millis(2);
const CLEANUP_TIME: Duration = Duration::from_secs(1);

/// Scores are relative to this complexity when estimating conversion times.
const REFERENCE_COMPLEXITY: f64 = 50.0;

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum ValidateError {
    #[snafu(display("the resource is stored as {actual:?}, but a migration from {expected:?} was requested"))]
    WrongSourceVersion { expected: String, actual: String },

    #[snafu(display("the resource can not be migrated between the requested versions"))]
    NoMigrationPath { source: schema::Error },

    #[snafu(display("the resource is invalid"))]
    InvalidField { source: FieldError },
}

impl ValidateError {
    /// The offending field, if the resource itself is invalid.
    pub fn field_error(&self) -> Option<&FieldError> {
        match self {
            Self::InvalidField { source } => Some(source),
            Self::WrongSourceVersion { .. } | Self::NoMigrationPath { .. } => None,
        }
    }
}

#[derive(Debug, Snafu)]
pub enum MigrateResourceError {
    #[snafu(display("failed to convert resource"))]
    Convert { source: optimizer::Error },

    #[snafu(display("the converted resource is invalid in {version}"))]
    InvalidConversion { source: FieldError, version: String },

    #[snafu(display("failed to persist the converted resource"))]
    Persist { source: store::Error },

    #[snafu(display("failed to read the latest copy of the modified resource"))]
    Refresh { source: store::Error },
}

impl RetryableError for MigrateResourceError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Persist { source } | Self::Refresh { source } => source.is_retryable(),
            Self::Convert { .. } | Self::InvalidConversion { .. } => false,
        }
    }
}

#[derive(Debug, Snafu)]
pub enum RollbackError {
    #[snafu(display("failed to read the migrated resource"))]
    ReadMigrated { source: store::Error },

    #[snafu(display("failed to restore the original resource"))]
    Restore { source: store::Error },
}

impl RetryableError for RollbackError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::ReadMigrated { source } | Self::Restore { source } => source.is_retryable(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, Serialize)]
pub enum Phase {
    PreMigration,
    Migration,
    Validation,
    Cleanup,
}

fn serialize_duration<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&humantime::format_duration(*duration))
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedPhase {
    pub phase: Phase,
    pub description: String,

    #[serde(serialize_with = "serialize_duration")]
    pub estimated_duration: Duration,
}

/// The plan of a bulk migration. It can not be changed once created.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationPlan {
    source_version: String,
    target_version: String,
    path: Vec<String>,
    total_resources: usize,
    phases: [PlannedPhase; 4],
    complexity: ComplexityAnalysis,

    #[serde(serialize_with = "serialize_duration")]
    estimated_duration: Duration,
}

impl MigrationPlan {
    pub fn source_version(&self) -> &str {
        &self.source_version
    }

    pub fn target_version(&self) -> &str {
        &self.target_version
    }

    /// Every version the resources pass through, including both ends.
    pub fn path(&self) -> &[String] {
        &self.path
    }

    pub fn total_resources(&self) -> usize {
        self.total_resources
    }

    pub fn phases(&self) -> &[PlannedPhase] {
        &self.phases
    }

    pub fn complexity(&self) -> &ComplexityAnalysis {
        &self.complexity
    }

    pub fn estimated_duration(&self) -> Duration {
        self.estimated_duration
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeKind {
    Added,
    Removed,
    Modified,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldChange {
    pub path: FieldPath,
    pub kind: ChangeKind,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDryRun {
    pub key: ResourceKey,
    pub changes: Vec<FieldChange>,
    pub warnings: Vec<ConversionWarning>,

    /// Whether converting back can not restore everything, because
    /// unrecoverable fields were lost.
    pub data_loss: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DryRunResult {
    pub successful: usize,

    /// Resources which converted successfully, but with warnings.
    pub with_warnings: usize,
    pub failed: usize,
    pub resources: Vec<ResourceDryRun>,
}

/// Compares the data (spec and status) of two resources leaf by leaf.
pub fn diff(before: &VersionedResource, after: &VersionedResource) -> Vec<FieldChange> {
    let root = FieldPath::default();
    let mut old: IndexMap<_, _> = path::flatten(&before.data, &root);
    let new = path::flatten(&after.data, &root);

    let mut changes = Vec::new();
    for (path, new_value) in new {
        match old.shift_remove(&path) {
            Some(old_value) if old_value == new_value => {}
            Some(old_value) => changes.push(FieldChange {
                path,
                kind: ChangeKind::Modified,
                old_value: Some(old_value),
                new_value: Some(new_value),
            }),
            None => changes.push(FieldChange {
                path,
                kind: ChangeKind::Added,
                old_value: None,
                new_value: Some(new_value),
            }),
        }
    }

    changes.extend(old.into_iter().map(|(path, old_value)| FieldChange {
        path,
        kind: ChangeKind::Removed,
        old_value: Some(old_value),
        new_value: None,
    }));
    changes.sort_by(|lhs, rhs| lhs.path.cmp(&rhs.path));
    changes
}

/// Plans, validates and runs migrations of many resources between two
/// versions.
#[derive(Debug)]
pub struct MigrationManager {
    optimizer: Arc<ConversionOptimizer>,
    processor: BatchProcessor,
    rollback_on_failure: bool,
}

impl MigrationManager {
    pub fn new(optimizer: Arc<ConversionOptimizer>) -> Self {
        Self {
            optimizer,
            processor: BatchProcessor::default(),
            rollback_on_failure: false,
        }
    }

    pub fn with_batch_config(mut self, config: BatchConfig) -> Self {
        self.processor = BatchProcessor::new(config);
        self
    }

    /// Restores every migrated resource to its source version if any
    /// resource of an executed migration fails.
    pub fn with_rollback_on_failure(mut self, enabled: bool) -> Self {
        self.rollback_on_failure = enabled;
        self
    }

    fn tracker(&self) -> &SchemaEvolutionTracker {
        self.optimizer.converter().tracker()
    }

    /// Plans the migration of `resources` from `from` to `to`.
    ///
    /// Every plan consists of the same four phases. The estimated duration
    /// grows with the number of resources, their average complexity and the
    /// number of conversion steps.
    #[instrument(skip(self, resources), fields(resources = resources.len()))]
    pub fn plan_migration(
        &self,
        resources: &[VersionedResource],
        from: &str,
        to: &str,
    ) -> Result<MigrationPlan, schema::Error> {
        let path = self.tracker().migration_path(from, to)?;
        let hops = path.len().saturating_sub(1);
        let count = resources.len();

        let complexity = analyze_complexity(resources);
        let average = if count == 0 {
            0.0
        } else {
            complexity.score / count as f64
        };

        let per_resource = BASE_CONVERSION_TIME.mul_f64((1.0 + average / REFERENCE_COMPLEXITY) * hops as f64);
        let concurrency = self.processor.config().max_concurrency.max(1);
        let validation = VALIDATION_TIME * count as u32;

        let phases = [
            PlannedPhase {
                phase: Phase::PreMigration,
                description: format!("validate {count} resources against {from}"),
                estimated_duration: validation,
            },
            PlannedPhase {
                phase: Phase::Migration,
                description: format!("convert {count} resources along {}", path.join(" -> ")),
                estimated_duration: per_resource.mul_f64(count as f64 / concurrency as f64),
            },
            PlannedPhase {
                phase: Phase::Validation,
                description: format!("validate converted resources against {to}"),
                estimated_duration: validation,
            },
            PlannedPhase {
                phase: Phase::Cleanup,
                description: "purge expired conversion cache entries".to_owned(),
                estimated_duration: CLEANUP_TIME,
            },
        ];
        let estimated_duration: Duration = phases.iter().map(|phase| phase.estimated_duration).sum();

        tracing::info!(
            hops,
            complexity = complexity.score,
            estimated_duration = %humantime::format_duration(estimated_duration),
            "planned migration"
        );

        Ok(MigrationPlan {
            source_version: from.to_owned(),
            target_version: to.to_owned(),
            path,
            total_resources: count,
            phases,
            complexity,
            estimated_duration,
        })
    }

    /// Checks that `resource` is a valid `from` resource which can be
    /// migrated to `to`, before any conversion is attempted.
    pub fn validate_resource(
        &self,
        resource: &VersionedResource,
        from: &str,
        to: &str,
    ) -> Result<(), ValidateError> {
        ensure!(resource.version() == from, WrongSourceVersionSnafu {
            expected: from,
            actual: resource.version(),
        });

        self.tracker()
            .migration_path(from, to)
            .context(NoMigrationPathSnafu)?;
        let schema = self.tracker().schema(from).context(NoMigrationPathSnafu)?;

        validation::validate(&resource.data, schema).context(InvalidFieldSnafu)
    }

    /// Runs the whole conversion pipeline for every resource without
    /// persisting anything. Converted resources are validated against `to`
    /// just like [`Self::execute`] does.
    #[instrument(skip(self, resources), fields(resources = resources.len()))]
    pub fn dry_run_migration(
        &self,
        resources: &[VersionedResource],
        from: &str,
        to: &str,
    ) -> DryRunResult {
        let mut result = DryRunResult::default();

        for resource in resources {
            let mut summary = ResourceDryRun {
                key: resource.key(),
                changes: Vec::new(),
                warnings: Vec::new(),
                data_loss: false,
                error: None,
            };

            let converted = self
                .validate_resource(resource, from, to)
                .map_err(|error| error_chain(&error))
                .and_then(|()| self.convert_and_validate(resource, from, to));

            match converted {
                Ok(outcome) => {
                    summary.changes = diff(resource, &outcome.resource);
                    summary.data_loss = outcome
                        .warnings
                        .iter()
                        .any(|warning| warning.severity == Severity::Critical);
                    summary.warnings = outcome.warnings;

                    if summary.warnings.is_empty() {
                        result.successful += 1;
                    } else {
                        result.with_warnings += 1;
                    }
                }
                Err(error) => {
                    summary.error = Some(error);
                    result.failed += 1;
                }
            }
            result.resources.push(summary);
        }

        tracing::info!(
            successful = result.successful,
            with_warnings = result.with_warnings,
            failed = result.failed,
            "finished dry run"
        );
        result
    }

    /// Writes the `originals` back, undoing their migration to `to`.
    ///
    /// Resources which are not stored as `to` were never migrated and are
    /// left alone. The returned result counts them as successful, only the
    /// restored ones are counted in [`BatchResult::rolled_back`].
    #[instrument(skip(self, originals, store, cancel), fields(resources = originals.len()))]
    pub async fn rollback(
        &self,
        originals: Vec<VersionedResource>,
        to: &str,
        store: &dyn ResourceStore,
        cancel: &CancellationToken,
    ) -> BatchResult {
        let restored = AtomicUsize::new(0);
        let restored = &restored;

        let mut result = self
            .processor
            .process_batch(
                originals,
                |mut original| async move {
                    let key = original.key();
                    let migrated = match store.get(&key, to).await {
                        Ok(migrated) => migrated,
                        Err(store::Error::NotFound { .. } | store::Error::VersionNotServed { .. }) => {
                            return Ok(());
                        }
                        Err(source) => return Err(RollbackError::ReadMigrated { source }),
                    };

                    original.metadata.resource_version = migrated.metadata.resource_version;
                    store.update(original).await.context(RestoreSnafu)?;
                    restored.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                },
                cancel,
            )
            .await;

        result.rolled_back = restored.load(Ordering::Relaxed);
        tracing::info!(
            rolled_back = result.rolled_back,
            failed = result.failed,
            "finished rollback"
        );
        result
    }

    async fn migrate_one(
        &self,
        resource: VersionedResource,
        from: &str,
        to: &str,
        target: &VersionSchema,
        store: &dyn ResourceStore,
    ) -> Result<(), MigrateResourceError> {
        let outcome = self
            .optimizer
            .convert(resource, from, to)
            .await
            .context(ConvertSnafu)?;

        // Converted resources are validated before they are persisted
        validation::validate(&outcome.resource.data, target)
            .context(InvalidConversionSnafu { version: to })?;

        store
            .update(outcome.resource)
            .await
            .context(PersistSnafu)?;
        Ok(())
    }

    // Dry runs are not recorded in the conversion metrics.
    fn convert_and_validate(
        &self,
        resource: &VersionedResource,
        from: &str,
        to: &str,
    ) -> Result<ConversionOutcome, String> {
        let outcome = self
            .optimizer
            .converter()
            .convert_unrecorded(resource, from, to)
            .map_err(|error| error_chain(&error))?;

        let target = self.tracker().schema(to).map_err(|error| error_chain(&error))?;
        validation::validate(&outcome.resource.data, target)
            .context(InvalidConversionSnafu { version: to })
            .map_err(|error| error_chain(&error))?;

        Ok(outcome)
    }

    /// Executes `plan` for `resources` and writes every converted resource to
    /// `store`.
    ///
    /// Resources failing the pre-migration validation are recorded as failed
    /// and never converted. Converted resources are validated against the
    /// target version before they are written. If a resource was modified
    /// since it was listed, its latest copy is read and migrated instead.
    #[instrument(
        skip_all,
        fields(from = plan.source_version(), to = plan.target_version(), resources = resources.len())
    )]
    pub async fn execute(
        &self,
        plan: &MigrationPlan,
        resources: Vec<VersionedResource>,
        store: &dyn ResourceStore,
        cancel: &CancellationToken,
    ) -> BatchResult {
        let (from, to) = (plan.source_version(), plan.target_version());
        let mut result = BatchResult::default();

        tracing::info!(phase = %Phase::PreMigration, "starting migration phase");
        let mut valid = Vec::with_capacity(resources.len());
        for resource in resources {
            match self.validate_resource(&resource, from, to) {
                Ok(()) => valid.push(resource),
                Err(error) => result.record_failure(ResourceFailure {
                    key: resource.key(),
                    message: error_chain(&error),
                    attempts: 0,
                }),
            }
        }

        // Taken before anything is written, to roll back a failed migration
        let originals = if self.rollback_on_failure {
            valid.clone()
        } else {
            Vec::new()
        };

        tracing::info!(phase = %Phase::Migration, resources = valid.len(), "starting migration phase");
        let target = match self.tracker().schema(to) {
            Ok(target) => target,
            Err(error) => {
                for resource in valid {
                    result.record_failure(ResourceFailure {
                        key: resource.key(),
                        message: error_chain(&error),
                        attempts: 0,
                    });
                }
                return result;
            }
        };

        let migrated = self
            .processor
            .process_batch(
                valid,
                |resource| async move {
                    let key = resource.key();
                    match self.migrate_one(resource, from, to, target, store).await {
                        Err(MigrateResourceError::Persist {
                            source: store::Error::Conflict { .. },
                        }) => {
                            tracing::debug!(
                                resource = %key,
                                "resource was modified since it was listed, migrating the latest copy"
                            );
                            let latest = store.get(&key, from).await.context(RefreshSnafu)?;
                            self.migrate_one(latest, from, to, target, store).await
                        }
                        result => result,
                    }
                },
                cancel,
            )
            .await;
        result.merge(migrated);

        tracing::info!(
            phase = %Phase::Validation,
            successful = result.successful,
            failed = result.failed,
            "starting migration phase"
        );
        if result.failed > 0 {
            tracing::warn!(
                failed = result.failed,
                "some resources were not migrated, see the batch result for details"
            );

            if self.rollback_on_failure && !result.cancelled {
                let rollback = self.rollback(originals, to, store, cancel).await;
                result.rolled_back = rollback.rolled_back;
                result.errors.extend(rollback.errors.into_iter().map(|failure| ResourceFailure {
                    message: format!("failed to roll back: {}", failure.message),
                    ..failure
                }));
            }
        }

        tracing::info!(phase = %Phase::Cleanup, "starting migration phase");
        let purged = self.optimizer.purge_expired();
        tracing::debug!(purged, "purged expired conversion cache entries");

        result
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::{
        api_version::ApiVersion,
        metrics::{ConversionCounters, ConversionMetrics},
        optimizer::OptimizerConfig,
        platform,
    };

    fn manager() -> MigrationManager {
        let converter = platform::converter().expect("built-in versions are valid");
        MigrationManager::new(Arc::new(ConversionOptimizer::new(
            Arc::new(converter),
            OptimizerConfig::default(),
        )))
    }

    fn platform(name: &str, spec: Value) -> VersionedResource {
        VersionedResource::new(
            ApiVersion::new(platform::API_GROUP, platform::V1ALPHA1),
            platform::KIND,
            ObjectMeta {
                name: Some(name.to_owned()),
                namespace: Some("monitoring".to_owned()),
                ..ObjectMeta::default()
            },
        )
        .with_spec(spec)
    }

    fn prometheus(name: &str, version: &str) -> VersionedResource {
        platform(
            name,
            json!({"components": {"prometheus": {"enabled": true, "version": version}}}),
        )
    }

    #[test]
    fn plans_have_four_phases() {
        let manager = manager();
        let resources = [prometheus("a", "2.45.0"), prometheus("b", "2.45.0")];

        let plan = manager
            .plan_migration(&resources, platform::V1ALPHA1, platform::V1BETA1)
            .expect("versions are known");

        let phases: Vec<_> = plan.phases().iter().map(|phase| phase.phase).collect();
        assert_eq!(phases, [
            Phase::PreMigration,
            Phase::Migration,
            Phase::Validation,
            Phase::Cleanup
        ]);
        assert_eq!(plan.total_resources(), 2);
        assert_eq!(plan.path(), [platform::V1ALPHA1, platform::V1BETA1]);
        assert_eq!(
            plan.estimated_duration(),
            plan.phases()
                .iter()
                .map(|phase| phase.estimated_duration)
                .sum::<Duration>()
        );
    }

    #[test]
    fn estimates_grow_with_the_number_of_resources() {
        let manager = manager();
        let estimate = |count: usize| {
            let resources: Vec<_> = (0..count)
                .map(|index| prometheus(&format!("platform-{index}"), "2.45.0"))
                .collect();
            manager
                .plan_migration(&resources, platform::V1ALPHA1, platform::V1BETA1)
                .expect("versions are known")
                .estimated_duration()
        };

        assert!(estimate(100) > estimate(10));
    }

    #[test]
    fn planning_unknown_versions_fails() {
        let error = manager()
            .plan_migration(&[], platform::V1ALPHA1, "v2")
            .expect_err("v2 is unknown");
        assert!(matches!(error, schema::Error::NoPathFound { .. }), "{error}");
    }

    #[rstest]
    #[case::missing_version(
        platform("a", json!({"components": {"prometheus": {"enabled": true}}})),
        "spec.components.prometheus.version"
    )]
    #[case::version_format(prometheus("a", "latest"), "spec.components.prometheus.version")]
    #[case::retention_format(
        platform("a", json!({"components": {"prometheus": {"version": "2.45.0", "retention": "a fortnight"}}})),
        "spec.components.prometheus.retention"
    )]
    #[case::alertmanager_without_prometheus(
        platform("a", json!({
            "components": {"prometheus": {"enabled": false, "version": "2.45.0"}},
            "alerting": {"alertmanager": {"enabled": true}},
        })),
        "spec.alerting.alertmanager.enabled"
    )]
    fn invalid_resources(#[case] resource: VersionedResource, #[case] expected: &str) {
        let error = manager()
            .validate_resource(&resource, platform::V1ALPHA1, platform::V1BETA1)
            .expect_err("resource is invalid");

        let field_error = error.field_error().expect("a field is invalid");
        assert_eq!(field_error.path().to_string(), expected, "{field_error}");
    }

    #[test]
    fn validation_checks_the_source_version() {
        let error = manager()
            .validate_resource(&prometheus("a", "2.45.0"), platform::V1BETA1, platform::V1ALPHA1)
            .expect_err("resource is stored as v1alpha1");
        assert!(matches!(error, ValidateError::WrongSourceVersion { .. }));
    }

    #[test]
    fn dry_runs_summarize_changes() {
        let manager = manager();
        let resources = [prometheus("valid", "2.45.0"), prometheus("invalid", "latest")];

        let result = manager.dry_run_migration(&resources, platform::V1ALPHA1, platform::V1BETA1);

        assert_eq!(result.failed, 1);
        assert_eq!(result.successful + result.with_warnings, 1);

        let valid = &result.resources[0];
        assert!(valid.error.is_none());
        assert!(valid.changes.contains(&FieldChange {
            path: "spec.components.prometheus.version".parse().expect("valid field path"),
            kind: ChangeKind::Modified,
            old_value: Some(json!("2.45.0")),
            new_value: Some(json!("v2.45.0")),
        }));
        assert!(
            valid
                .changes
                .iter()
                .any(|change| change.kind == ChangeKind::Added
                    && change.path.to_string().starts_with("spec.security"))
        );

        let invalid = &result.resources[1];
        assert!(invalid.error.as_deref().is_some_and(|error| error.contains("version")));
    }

    #[test]
    fn dry_runs_validate_the_converted_resources() {
        let counters = Arc::new(ConversionCounters::default());
        let converter = platform::converter()
            .expect("built-in versions are valid")
            .with_metrics(Arc::clone(&counters) as Arc<dyn ConversionMetrics>);
        let manager = MigrationManager::new(Arc::new(ConversionOptimizer::new(
            Arc::new(converter),
            OptimizerConfig::default(),
        )));
        // v1beta1 requires a schedule for enabled backups, v1alpha1 does not
        let resources = [platform(
            "unscheduled",
            json!({
                "components": {"prometheus": {"enabled": true, "version": "2.45.0"}},
                "backup": {"enabled": true, "retentionDays": 3},
            }),
        )];

        manager
            .validate_resource(&resources[0], platform::V1ALPHA1, platform::V1BETA1)
            .expect("valid v1alpha1 resource");
        let result = manager.dry_run_migration(&resources, platform::V1ALPHA1, platform::V1BETA1);

        assert_eq!(result.failed, 1);
        let error = result.resources[0].error.as_deref().unwrap_or_default();
        assert!(error.starts_with("the converted resource is invalid in v1beta1"), "{error}");
        assert!(error.contains("spec.backup.schedule"), "{error}");
        assert_eq!(counters.snapshot().total, 0);
    }

    #[test]
    fn diffs_report_every_kind_of_change() {
        let before = platform("a", json!({"a": 1, "b": 2}));
        let after = platform("a", json!({"b": 3, "c": 4}));

        let kinds: Vec<_> = diff(&before, &after)
            .into_iter()
            .map(|change| (change.path.to_string(), change.kind))
            .collect();
        assert_eq!(kinds, [
            ("spec.a".to_owned(), ChangeKind::Removed),
            ("spec.b".to_owned(), ChangeKind::Modified),
            ("spec.c".to_owned(), ChangeKind::Added),
        ]);
    }
}
