//! Version conversion and bulk migration of `ObservabilityPlatform` resources.
//!
//! Every version of the resource is described by a [`VersionSchema`] which is
//! registered in a [`SchemaEvolutionTracker`]. The [`VersionConverter`] uses
//! the tracker to convert single resources between any two registered
//! versions, carrying data the target version can not model in annotations
//! with the help of the [`PreservationEngine`].
//!
//! ```
//! use observability_conversion::{platform, resource::VersionedResource};
//! use serde_json::json;
//!
//! let converter = platform::converter()?;
//! let resource = VersionedResource::from_value(json!({
//!     "apiVersion": "observability.io/v1alpha1",
//!     "kind": "ObservabilityPlatform",
//!     "metadata": {"name": "prod", "namespace": "monitoring"},
//!     "spec": {"components": {"prometheus": {"enabled": true, "version": "2.45.0"}}},
//! }))?;
//!
//! let outcome = converter.convert(&resource, "v1alpha1", "v1beta1")?;
//! assert_eq!(outcome.resource.data["spec"]["components"]["prometheus"]["version"], "v2.45.0");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! The API server calls the [`ConversionWebhook`] for single objects. Bulk
//! migrations are planned and executed by the [`MigrationManager`], which
//! runs conversions through the caching [`ConversionOptimizer`] and the
//! concurrency-bounded [`BatchProcessor`].
//!
//! [`VersionSchema`]: crate::schema::VersionSchema
//! [`SchemaEvolutionTracker`]: crate::schema::SchemaEvolutionTracker
//! [`VersionConverter`]: crate::convert::VersionConverter
//! [`PreservationEngine`]: crate::preservation::PreservationEngine
//! [`ConversionWebhook`]: crate::webhook::ConversionWebhook
//! [`MigrationManager`]: crate::migration::MigrationManager
//! [`ConversionOptimizer`]: crate::optimizer::ConversionOptimizer
//! [`BatchProcessor`]: crate::batch::BatchProcessor
pub mod api_version;
pub mod batch;
pub mod convert;
pub mod metrics;
pub mod migration;
pub mod optimizer;
pub mod path;
pub mod platform;
pub mod preservation;
pub mod resource;
pub mod schema;
pub mod store;
pub mod validation;
pub mod webhook;

// Selected re-exports
pub use crate::{
    api_version::ApiVersion,
    convert::{ConversionOutcome, VersionConverter},
    path::FieldPath,
    resource::{ResourceKey, VersionedResource},
};
