use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::{DynamicObject, TypeMeta};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use snafu::{OptionExt, ResultExt, Snafu};

use crate::{
    api_version::{ApiVersion, ParseApiVersionError},
    path::{self, FieldPath, SetFieldError},
};

#[derive(Debug, Snafu)]
pub enum ResourceError {
    #[snafu(display("the object is not a JSON object"))]
    NotAnObject,

    #[snafu(display("the object has no \"apiVersion\" field"))]
    MissingApiVersion,

    #[snafu(display("the \"apiVersion\" field of the object isn't a String"))]
    ApiVersionNotString { api_version: Value },

    #[snafu(display("failed to parse the apiVersion of the object"))]
    ParseApiVersion { source: ParseApiVersionError },

    #[snafu(display("the object has no \"kind\" field"))]
    MissingKind,

    #[snafu(display("the \"kind\" field of the object isn't a String"))]
    KindNotString { kind: Value },

    #[snafu(display("failed to deserialize the object metadata"))]
    DeserializeMetadata { source: serde_json::Error },

    #[snafu(display("failed to serialize the object metadata"))]
    SerializeMetadata { source: serde_json::Error },

    #[snafu(display("the object has no type information"))]
    MissingTypeMeta,

    #[snafu(display("field paths of a resource must start with \"spec\" or \"status\", got {path}"))]
    OutsideOfData { path: FieldPath },

    #[snafu(display("failed to set field"))]
    SetField { source: SetFieldError },
}

/// Identity of a resource. It never changes across conversions.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{}/{namespace}/{}", self.kind, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// A single resource in one of its versioned representations.
///
/// Everything besides `apiVersion`, `kind` and `metadata` (usually the `spec`
/// and `status` subtrees) is kept as an untyped JSON object, because its shape
/// differs between versions and may contain fields no schema knows about.
#[derive(Clone, Debug, PartialEq)]
pub struct VersionedResource {
    pub api_version: ApiVersion,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub data: Value,
}

impl VersionedResource {
    pub fn new(api_version: ApiVersion, kind: impl Into<String>, metadata: ObjectMeta) -> Self {
        Self {
            api_version,
            kind: kind.into(),
            metadata,
            data: Value::Object(Map::new()),
        }
    }

    pub fn with_spec(mut self, spec: Value) -> Self {
        self.data["spec"] = spec;
        self
    }

    /// Parses an untyped object as it is sent by the API server.
    pub fn from_value(value: Value) -> Result<Self, ResourceError> {
        let Value::Object(mut object) = value else {
            return NotAnObjectSnafu.fail();
        };

        let api_version = match object.remove("apiVersion").context(MissingApiVersionSnafu)? {
            Value::String(api_version) => api_version.parse().context(ParseApiVersionSnafu)?,
            api_version => return ApiVersionNotStringSnafu { api_version }.fail(),
        };

        let kind = match object.remove("kind").context(MissingKindSnafu)? {
            Value::String(kind) => kind,
            kind => return KindNotStringSnafu { kind }.fail(),
        };

        let metadata = match object.remove("metadata") {
            Some(metadata) => serde_json::from_value(metadata).context(DeserializeMetadataSnafu)?,
            None => ObjectMeta::default(),
        };

        Ok(Self {
            api_version,
            kind,
            metadata,
            data: Value::Object(object),
        })
    }

    pub fn into_value(self) -> Result<Value, ResourceError> {
        let mut object = Map::new();
        object.insert(
            "apiVersion".to_owned(),
            Value::String(self.api_version.to_string()),
        );
        object.insert("kind".to_owned(), Value::String(self.kind));
        object.insert(
            "metadata".to_owned(),
            serde_json::to_value(self.metadata).context(SerializeMetadataSnafu)?,
        );

        if let Value::Object(data) = self.data {
            object.extend(data);
        }

        Ok(Value::Object(object))
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey {
            kind: self.kind.clone(),
            namespace: self.metadata.namespace.clone(),
            name: self.metadata.name.clone().unwrap_or_default(),
        }
    }

    pub fn version(&self) -> &str {
        &self.api_version.version
    }

    pub fn spec(&self) -> Option<&Value> {
        self.data.get("spec")
    }

    pub fn field(&self, path: &FieldPath) -> Option<&Value> {
        path::get(&self.data, path)
    }

    pub fn set_field(&mut self, path: &FieldPath, value: Value) -> Result<(), ResourceError> {
        snafu::ensure!(
            is_data_path(path),
            OutsideOfDataSnafu { path: path.clone() }
        );
        path::set(&mut self.data, path, value).context(SetFieldSnafu)
    }

    pub fn remove_field(&mut self, path: &FieldPath) -> Option<Value> {
        path::remove(&mut self.data, path)
    }
}

fn is_data_path(path: &FieldPath) -> bool {
    matches!(
        path.segments().first(),
        Some(path::Segment::Key(key)) if key == "spec" || key == "status"
    )
}

impl TryFrom<DynamicObject> for VersionedResource {
    type Error = ResourceError;

    fn try_from(object: DynamicObject) -> Result<Self, Self::Error> {
        let TypeMeta { api_version, kind } = object.types.context(MissingTypeMetaSnafu)?;
        let data = match object.data {
            Value::Object(data) => Value::Object(data),
            _ => Value::Object(Map::new()),
        };

        Ok(Self {
            api_version: api_version.parse().context(ParseApiVersionSnafu)?,
            kind,
            metadata: object.metadata,
            data,
        })
    }
}

impl From<VersionedResource> for DynamicObject {
    fn from(resource: VersionedResource) -> Self {
        Self {
            types: Some(TypeMeta {
                api_version: resource.api_version.to_string(),
                kind: resource.kind,
            }),
            metadata: resource.metadata,
            data: resource.data,
        }
    }
}
