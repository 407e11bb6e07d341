//! Handling of `ConversionReview`s sent by the Kubernetes API server.
//!
//! This is the synchronous per-object path. It calls the [`VersionConverter`]
//! directly, without caching or retries.
use std::sync::Arc;

pub use kube::core::conversion::ConversionReview;
use kube::core::{
    DynamicObject,
    conversion::{ConversionRequest, ConversionResponse},
    response::{Status, StatusSummary},
};
use serde_json::Value;
use snafu::{ResultExt, Snafu, ensure};
use tracing::instrument;

use crate::{
    api_version::{ApiVersion, ParseApiVersionError},
    batch::error_chain,
    convert::{self, VersionConverter},
    platform,
    resource::{ResourceError, VersionedResource},
};

#[derive(Debug, Snafu)]
pub enum ConversionError {
    #[snafu(display("failed to parse desired apiVersion {api_version:?}"))]
    ParseDesiredApiVersion {
        source: ParseApiVersionError,
        api_version: String,
    },

    #[snafu(display(
        "I was asked to convert to the group {desired_group:?}, but I can only convert objects of group {expected_group:?}"
    ))]
    WrongDesiredGroup {
        expected_group: String,
        desired_group: String,
    },

    #[snafu(display("failed to parse the object sent for conversion"))]
    ParseObject { source: ResourceError },

    #[snafu(display(
        "I was asked to convert the kind {send_kind:?}, but I can only convert objects of kind {expected_kind:?}"
    ))]
    WrongObjectKind {
        expected_kind: String,
        send_kind: String,
    },

    #[snafu(display(
        "the object sent for conversion belongs to the group {send_group:?}, expected {expected_group:?}"
    ))]
    WrongObjectGroup {
        expected_group: String,
        send_group: String,
    },

    #[snafu(display("failed to convert object {name:?}"))]
    ConvertObject {
        source: convert::Error,
        name: String,
    },

    #[snafu(display("failed to serialize converted object {name:?}"))]
    SerializeObject { source: ResourceError, name: String },
}

impl ConversionError {
    /// The status code handed back to the API server.
    pub fn http_status_code(&self) -> u16 {
        match self {
            Self::ParseDesiredApiVersion { .. }
            | Self::WrongDesiredGroup { .. }
            | Self::ParseObject { .. }
            | Self::WrongObjectKind { .. }
            | Self::WrongObjectGroup { .. } => 400,
            Self::ConvertObject { source, .. } => match source {
                convert::Error::ResolveVersions { .. } | convert::Error::VersionMismatch { .. } => {
                    400
                }
                convert::Error::IncompatibleFieldType { .. }
                | convert::Error::RequiredFieldMissing { .. } => 422,
                convert::Error::IdentityViolation { .. }
                | convert::Error::ConversionFailed { .. } => 500,
            },
            Self::SerializeObject { .. } => 500,
        }
    }

    /// Renders the error and all of its sources on a single line.
    pub fn join_errors(&self) -> String {
        error_chain(self)
    }
}

/// Converts the objects of a [`ConversionReview`] with a [`VersionConverter`].
#[derive(Clone, Debug)]
pub struct ConversionWebhook {
    converter: Arc<VersionConverter>,
    group: String,
    kind: String,
}

impl ConversionWebhook {
    pub fn new(
        converter: Arc<VersionConverter>,
        group: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            converter,
            group: group.into(),
            kind: kind.into(),
        }
    }

    /// A webhook for `ObservabilityPlatform` objects.
    pub fn for_platform(converter: Arc<VersionConverter>) -> Self {
        Self::new(converter, platform::API_GROUP, platform::KIND)
    }

    pub fn converter(&self) -> &VersionConverter {
        &self.converter
    }

    /// Converts every object in `review` to the desired API version.
    ///
    /// The returned review either carries all converted objects or a failure
    /// status. A single failing object fails the whole review.
    #[instrument(skip_all)]
    pub fn convert_review(&self, review: ConversionReview) -> ConversionReview {
        let request = match ConversionRequest::from_review(review) {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!(error = %err, "received invalid conversion review");
                return ConversionResponse::invalid(Status {
                    status: Some(StatusSummary::Failure),
                    message: err.to_string(),
                    reason: err.to_string(),
                    details: None,
                    code: 400,
                })
                .into_review();
            }
        };

        let response = match self.convert_objects(request.objects, &request.desired_api_version) {
            Ok(converted_objects) => {
                tracing::debug!(
                    k8s.conversion.uid = %request.uid,
                    k8s.conversion.objects = converted_objects.len(),
                    "converted objects"
                );

                ConversionResponse {
                    result: Status::success(),
                    types: request.types,
                    uid: request.uid,
                    converted_objects,
                }
            }
            Err(err) => {
                let code = err.http_status_code();
                let message = err.join_errors();
                tracing::warn!(
                    k8s.conversion.uid = %request.uid,
                    code,
                    error = %message,
                    "failed to convert objects"
                );

                ConversionResponse {
                    result: Status {
                        status: Some(StatusSummary::Failure),
                        message: message.clone(),
                        reason: message,
                        details: None,
                        code,
                    },
                    types: request.types,
                    uid: request.uid,
                    converted_objects: vec![],
                }
            }
        };

        response.into_review()
    }

    /// Converts untyped objects as sent by the API server.
    ///
    /// Every object is recorded once in the converter's metrics. It counts as
    /// succeeded only if it is handed back converted, so a single failing
    /// object makes every object of the request count as failed.
    #[instrument(skip(self, objects), fields(objects = objects.len()))]
    pub fn convert_objects(
        &self,
        objects: Vec<Value>,
        desired_api_version: &str,
    ) -> Result<Vec<Value>, ConversionError> {
        let count = objects.len();
        let result = self
            .parse_desired_api_version(desired_api_version)
            .and_then(|desired| self.convert_values(objects, &desired));

        self.record(count, result.is_ok());
        result
    }

    /// Converts a typed [`DynamicObject`].
    pub fn convert_dynamic(
        &self,
        object: DynamicObject,
        desired_api_version: &str,
    ) -> Result<DynamicObject, ConversionError> {
        let result = self
            .parse_desired_api_version(desired_api_version)
            .and_then(|desired| {
                let resource = VersionedResource::try_from(object).context(ParseObjectSnafu)?;
                self.convert_resource(&resource, &desired)
            })
            .map(DynamicObject::from);

        self.record(1, result.is_ok());
        result
    }

    fn convert_values(
        &self,
        objects: Vec<Value>,
        desired: &ApiVersion,
    ) -> Result<Vec<Value>, ConversionError> {
        objects
            .into_iter()
            .map(|object| {
                let resource = VersionedResource::from_value(object).context(ParseObjectSnafu)?;
                let name = resource.metadata.name.clone().unwrap_or_default();
                self.convert_resource(&resource, desired)?
                    .into_value()
                    .context(SerializeObjectSnafu { name })
            })
            .collect()
    }

    fn record(&self, objects: usize, succeeded: bool) {
        let metrics = self.converter.metrics();
        for _ in 0..objects {
            metrics.record_conversion(succeeded);
        }
    }

    fn parse_desired_api_version(&self, api_version: &str) -> Result<ApiVersion, ConversionError> {
        let desired: ApiVersion = api_version
            .parse()
            .context(ParseDesiredApiVersionSnafu { api_version })?;

        let desired_group = desired.group.as_deref().unwrap_or_default();
        ensure!(desired_group == self.group, WrongDesiredGroupSnafu {
            expected_group: &self.group,
            desired_group,
        });
        Ok(desired)
    }

    fn convert_resource(
        &self,
        resource: &VersionedResource,
        desired: &ApiVersion,
    ) -> Result<VersionedResource, ConversionError> {
        ensure!(resource.kind == self.kind, WrongObjectKindSnafu {
            expected_kind: &self.kind,
            send_kind: &resource.kind,
        });

        let send_group = resource.api_version.group.as_deref().unwrap_or_default();
        ensure!(send_group == self.group, WrongObjectGroupSnafu {
            expected_group: &self.group,
            send_group,
        });

        let name = resource.metadata.name.clone().unwrap_or_default();
        let outcome = self
            .converter
            .convert_unrecorded(resource, resource.version(), &desired.version)
            .context(ConvertObjectSnafu { name })?;

        Ok(outcome.resource)
    }
}
