//! Conversion of a single [`VersionedResource`] between registered versions.
//!
//! Every step between two adjacent versions follows the same order:
//!
//! 1. The [`PreservationEngine`] captures metadata and spec fields the target
//!    version can not model.
//! 2. The [`MappingTable`] moves and coerces the fields which changed their
//!    path or type. Everything else passes through unchanged.
//! 3. Fields the target version does not model are removed from the spec.
//! 4. The captured data is re-applied to the converted resource.
//! 5. Missing required fields receive their defaults.
//! 6. The identity of the resource (kind, name and namespace) is checked.
//!
//! Versions which are not adjacent are converted by chaining these steps along
//! the [`SchemaEvolutionTracker::migration_path`].
use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Serialize;
use snafu::{ResultExt, Snafu, ensure};
use strum::Display;
use tracing::instrument;

use crate::{
    metrics::{ConversionCounters, ConversionMetrics},
    path::{self, FieldPath},
    preservation::{
        CaptureScope, Disposition, PRESERVED_FIELDS_ANNOTATION, PreservationEngine,
        UnmodeledField,
    },
    resource::{ResourceError, VersionedResource},
    schema::{self, SchemaEvolutionTracker, VersionSchema},
};

mod mapping;

pub use mapping::*;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to resolve the versions to convert between"))]
    ResolveVersions { source: schema::Error },

    #[snafu(display(
        "the resource is stored as {actual:?}, but a conversion from {expected:?} was requested"
    ))]
    VersionMismatch { expected: String, actual: String },

    #[snafu(display("field {path} can not be converted to {to}"))]
    IncompatibleFieldType {
        source: MappingError,
        path: FieldPath,
        to: String,
    },

    #[snafu(display("required field {path} of {version} is missing and has no default"))]
    RequiredFieldMissing { path: FieldPath, version: String },

    #[snafu(display("conversion changed the {field} of the resource from {before:?} to {after:?}"))]
    IdentityViolation {
        field: &'static str,
        before: Option<String>,
        after: Option<String>,
    },

    #[snafu(display("failed to write converted field {path}"))]
    ConversionFailed {
        source: ResourceError,
        path: FieldPath,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Display, Serialize)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum Severity {
    Warning,

    /// Information was lost which can not be restored by converting back.
    Critical,
}

/// A non-fatal finding of a conversion, usually about a field which does not
/// exist in the target version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConversionWarning {
    pub path: FieldPath,
    pub severity: Severity,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConversionOutcome {
    pub resource: VersionedResource,
    pub warnings: Vec<ConversionWarning>,

    /// Whether preserved data had to be truncated to stay within the size
    /// limit.
    pub truncated: bool,
}

impl ConversionOutcome {
    fn unchanged(resource: &VersionedResource) -> Self {
        Self {
            resource: resource.clone(),
            warnings: Vec::new(),
            truncated: false,
        }
    }
}

/// Converts resources between the versions registered in a
/// [`SchemaEvolutionTracker`].
#[derive(Clone, Debug)]
pub struct VersionConverter {
    tracker: Arc<SchemaEvolutionTracker>,
    mappings: Arc<MappingTable>,
    preservation: PreservationEngine,
    metrics: Arc<dyn ConversionMetrics>,
}

impl VersionConverter {
    pub fn new(tracker: Arc<SchemaEvolutionTracker>, mappings: Arc<MappingTable>) -> Self {
        Self {
            tracker,
            mappings,
            preservation: PreservationEngine::default(),
            metrics: Arc::new(ConversionCounters::default()),
        }
    }

    pub fn with_preservation(mut self, preservation: PreservationEngine) -> Self {
        self.preservation = preservation;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn ConversionMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn tracker(&self) -> &SchemaEvolutionTracker {
        &self.tracker
    }

    pub fn metrics(&self) -> &dyn ConversionMetrics {
        self.metrics.as_ref()
    }

    /// Converts `resource` from version `from` to version `to`, hopping through
    /// intermediate versions if needed. Every call is recorded in the
    /// conversion metrics.
    pub fn convert(
        &self,
        resource: &VersionedResource,
        from: &str,
        to: &str,
    ) -> Result<ConversionOutcome> {
        let result = self.convert_unrecorded(resource, from, to);
        self.metrics.record_conversion(result.is_ok());
        result
    }

    /// Same as [`Self::convert`], but leaves recording the outcome to the
    /// caller.
    #[instrument(
        skip(self, resource),
        fields(
            k8s.resource.name = resource.metadata.name.as_deref(),
            k8s.resource.namespace = resource.metadata.namespace.as_deref(),
        )
    )]
    pub fn convert_unrecorded(
        &self,
        resource: &VersionedResource,
        from: &str,
        to: &str,
    ) -> Result<ConversionOutcome> {
        let result = self.convert_along_path(resource, from, to);

        match &result {
            Ok(outcome) => tracing::debug!(
                warnings = outcome.warnings.len(),
                truncated = outcome.truncated,
                "converted resource"
            ),
            Err(error) => tracing::warn!(%error, "failed to convert resource"),
        }

        result
    }

    fn convert_along_path(
        &self,
        resource: &VersionedResource,
        from: &str,
        to: &str,
    ) -> Result<ConversionOutcome> {
        ensure!(resource.version() == from, VersionMismatchSnafu {
            expected: from,
            actual: resource.version(),
        });

        let path = self
            .tracker
            .migration_path(from, to)
            .context(ResolveVersionsSnafu)?;

        let mut outcome = ConversionOutcome::unchanged(resource);
        for hop in path.windows(2) {
            let step = self.convert_hop(&outcome.resource, &hop[0], &hop[1])?;
            outcome.resource = step.resource;
            outcome.warnings.extend(step.warnings);
            outcome.truncated |= step.truncated;
        }

        Ok(outcome)
    }

    #[instrument(level = "debug", skip(self, resource))]
    fn convert_hop(
        &self,
        resource: &VersionedResource,
        from: &str,
        to: &str,
    ) -> Result<ConversionOutcome> {
        let source = self.tracker.schema(from).context(ResolveVersionsSnafu)?;
        let target = self.tracker.schema(to).context(ResolveVersionsSnafu)?;
        let downgrade = self
            .tracker
            .is_downgrade(from, to)
            .context(ResolveVersionsSnafu)?;

        let target_api_version = resource.api_version.with_version(to);
        let consumed = self.mappings.consumed(from, to);
        let scope = CaptureScope {
            source,
            target,
            target_api_version: &target_api_version,
            consumed: &consumed,
        };

        let preserved = self.preservation.capture(resource, &scope);
        let mut warnings: Vec<_> = preserved
            .unmodeled
            .iter()
            .map(|field| unmodeled_warning(field, to))
            .collect();

        let mut data = resource.data.clone();
        if let Err(source) = self.mappings.apply(from, to, &mut data) {
            let path = source.path().clone();
            return Err(source).context(IncompatibleFieldTypeSnafu { path, to });
        }

        for path in target.unmodeled_paths(&data, &[]).iter().rev() {
            path::remove(&mut data, path);
        }

        let converted = VersionedResource {
            api_version: target_api_version.clone(),
            kind: resource.kind.clone(),
            metadata: ObjectMeta {
                labels: None,
                annotations: None,
                finalizers: None,
                ..resource.metadata.clone()
            },
            data,
        };

        let applied = self.preservation.apply(converted, preserved, &scope);
        if applied.truncated {
            warnings.push(ConversionWarning {
                path: FieldPath::root("metadata").child("annotations"),
                severity: Severity::Warning,
                message: "preserved data exceeded the size limit and was truncated".to_owned(),
            });
        }

        let mut converted = applied.resource;
        populate_required(&mut converted, target, downgrade, &mut warnings)?;
        check_identity(resource, &converted)?;

        Ok(ConversionOutcome {
            resource: converted,
            warnings,
            truncated: applied.truncated,
        })
    }
}

fn unmodeled_warning(field: &UnmodeledField, to: &str) -> ConversionWarning {
    let (severity, message) = match field.disposition {
        Disposition::Preserved => (
            Severity::Warning,
            format!("field is not part of {to}, preserved in the {PRESERVED_FIELDS_ANNOTATION} annotation"),
        ),
        Disposition::Dropped => (
            Severity::Warning,
            format!("field is not part of {to} and is not retained by the preservation policy"),
        ),
        Disposition::Unrecoverable => (
            Severity::Critical,
            format!("field is not part of {to}, the setting is lost and can not be restored"),
        ),
    };

    tracing::warn!(path = %field.path, %severity, "{message}");
    ConversionWarning {
        path: field.path.clone(),
        severity,
        message,
    }
}

/// Fills in the defaults of required fields which are missing although their
/// parent object is present.
fn populate_required(
    resource: &mut VersionedResource,
    target: &VersionSchema,
    downgrade: bool,
    warnings: &mut Vec<ConversionWarning>,
) -> Result<()> {
    // Defaults of parents come first and may satisfy their children.
    loop {
        let missing = target.missing_required(&resource.data);
        let Some((path, info)) = missing
            .into_iter()
            .find(|(path, _)| !warnings.iter().any(|warning| &warning.path == path))
        else {
            return Ok(());
        };

        match &info.default {
            Some(default) if !downgrade || info.default_on_downgrade => {
                resource
                    .set_field(&path, default.clone())
                    .context(ConversionFailedSnafu { path: path.clone() })?;
                tracing::debug!(%path, "populated default of missing required field");
            }
            Some(_) => {
                let message = format!(
                    "required field is missing in {}, its default is not applied on downgrade",
                    target.name()
                );
                tracing::warn!(%path, "{message}");
                warnings.push(ConversionWarning {
                    path,
                    severity: Severity::Warning,
                    message,
                });
            }
            None => {
                return RequiredFieldMissingSnafu {
                    path,
                    version: target.name(),
                }
                .fail();
            }
        }
    }
}

fn check_identity(before: &VersionedResource, after: &VersionedResource) -> Result<()> {
    let fields = [
        ("name", &before.metadata.name, &after.metadata.name),
        ("namespace", &before.metadata.namespace, &after.metadata.namespace),
    ];
    for (field, lhs, rhs) in fields {
        ensure!(lhs == rhs, IdentityViolationSnafu {
            field,
            before: lhs.clone(),
            after: rhs.clone(),
        });
    }

    ensure!(before.kind == after.kind, IdentityViolationSnafu {
        field: "kind",
        before: Some(before.kind.clone()),
        after: Some(after.kind.clone()),
    });
    Ok(())
}
