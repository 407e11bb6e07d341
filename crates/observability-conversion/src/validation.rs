//! Checks a resource against the [`VersionSchema`] of its version before it is
//! converted or persisted.
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use snafu::{Snafu, ensure};

use crate::{
    path::{self, FieldPath},
    schema::{FieldInfo, FieldType, VersionSchema},
};

static VERSION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^v?[0-9]+\.[0-9]+\.[0-9]+(?:-[0-9A-Za-z.-]+)?$")
        .expect("failed to compile semantic version regex")
});

/// Decimal and binary suffixes of Kubernetes quantities.
const QUANTITY_SUFFIXES: &[&str] = &[
    "", "n", "u", "m", "k", "M", "G", "T", "P", "E", "Ki", "Mi", "Gi", "Ti", "Pi", "Ei",
];

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum FieldError {
    #[snafu(display("required field {path} is missing"))]
    RequiredFieldMissing { path: FieldPath },

    #[snafu(display("field {path} has the invalid value {value}, expected {expected}"))]
    InvalidFieldFormat {
        path: FieldPath,
        value: String,
        expected: String,
    },

    #[snafu(display("field {path} is enabled, but {dependency} is not set"))]
    MissingDependency {
        path: FieldPath,
        dependency: FieldPath,
    },
}

impl FieldError {
    pub fn path(&self) -> &FieldPath {
        match self {
            Self::RequiredFieldMissing { path }
            | Self::InvalidFieldFormat { path, .. }
            | Self::MissingDependency { path, .. } => path,
        }
    }
}

/// Validates `data` against `schema` and returns the first violation.
///
/// Required fields are checked first, then the format of every declared field
/// and finally the cross-field dependencies. `null` values are treated like
/// absent ones.
pub fn validate(data: &Value, schema: &VersionSchema) -> Result<(), FieldError> {
    if let Some((path, _)) = schema.missing_required(data).into_iter().next() {
        return RequiredFieldMissingSnafu { path }.fail();
    }

    for (key, info) in schema.fields() {
        let Ok(pattern) = key.parse::<FieldPath>() else {
            continue;
        };
        for concrete in path::expand(data, &pattern) {
            if let Some(value) = path::get(data, &concrete) {
                check_format(&concrete, info, value)?;
            }
        }
    }

    for dependency in schema.dependencies() {
        for field in path::expand(data, &dependency.field) {
            if path::get(data, &field) != Some(&Value::Bool(true)) {
                continue;
            }

            let required = dependency.requires.with_indices(&field.indices());
            ensure!(
                path::get(data, &required).is_some_and(is_set),
                MissingDependencySnafu {
                    path: field,
                    dependency: required,
                }
            );
        }
    }

    Ok(())
}

fn is_set(value: &Value) -> bool {
    !matches!(value, Value::Null | Value::Bool(false)) && value.as_str() != Some("")
}

fn check_format(path: &FieldPath, info: &FieldInfo, value: &Value) -> Result<(), FieldError> {
    let valid = match (info.field_type, value) {
        (_, Value::Null) | (FieldType::Any, _) | (FieldType::Quantity, Value::Number(_)) => true,
        (FieldType::String, value) => value.is_string(),
        (FieldType::Integer, value) => value.is_i64() || value.is_u64(),
        (FieldType::Number, value) => value.is_number(),
        (FieldType::Boolean, value) => value.is_boolean(),
        (FieldType::Object | FieldType::Map, value) => value.is_object(),
        (FieldType::Array, value) => value.is_array(),
        (FieldType::Duration, Value::String(duration)) => {
            humantime::parse_duration(duration).is_ok()
        }
        (FieldType::Quantity, Value::String(quantity)) => is_quantity(quantity),
        (FieldType::Version, Value::String(version)) => VERSION_REGEX.is_match(version),
        (FieldType::Duration | FieldType::Quantity | FieldType::Version, _) => false,
    };

    ensure!(valid, InvalidFieldFormatSnafu {
        path: path.clone(),
        value: value.to_string(),
        expected: expected_format(info.field_type),
    });
    Ok(())
}

fn expected_format(field_type: FieldType) -> String {
    match field_type {
        FieldType::Duration => "a duration like 30s, 15d or 1h 30m".to_owned(),
        FieldType::Quantity => "a resource quantity like 500m or 10Gi".to_owned(),
        FieldType::Version => "a semantic version like 2.45.0 or v2.45.0".to_owned(),
        other => format!("a value of type {other}"),
    }
}

/// Checks the `<number><suffix>` format of Kubernetes resource quantities.
fn is_quantity(input: &str) -> bool {
    if input.is_empty() || !input.is_ascii() {
        return false;
    }

    let (number, suffix) = match input.find(|c: char| c != '.' && !c.is_ascii_digit()) {
        Some(index) => input.split_at(index),
        None => (input, ""),
    };

    number.parse::<f64>().is_ok() && QUANTITY_SUFFIXES.contains(&suffix)
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};
    use serde_json::json;

    use super::*;
    use crate::schema::FieldDependency;

    fn path(input: &str) -> FieldPath {
        input.parse().expect("valid field path")
    }

    #[fixture]
    fn schema() -> VersionSchema {
        VersionSchema::new("v1beta1")
            .with_field(&path("spec"), FieldInfo::new(FieldType::Object))
            .with_field(&path("spec.prometheus"), FieldInfo::new(FieldType::Object))
            .with_field(&path("spec.prometheus.enabled"), FieldInfo::new(FieldType::Boolean))
            .with_field(
                &path("spec.prometheus.version"),
                FieldInfo::new(FieldType::Version).required(),
            )
            .with_field(&path("spec.prometheus.retention"), FieldInfo::new(FieldType::Duration))
            .with_field(&path("spec.prometheus.storage"), FieldInfo::new(FieldType::Quantity))
            .with_field(&path("spec.alertmanager"), FieldInfo::new(FieldType::Object))
            .with_field(&path("spec.alertmanager.enabled"), FieldInfo::new(FieldType::Boolean))
            .with_field(&path("spec.remoteWrite"), FieldInfo::new(FieldType::Array))
            .with_field(&path("spec.remoteWrite[].tls"), FieldInfo::new(FieldType::Boolean))
            .with_field(&path("spec.remoteWrite[].secret"), FieldInfo::new(FieldType::String))
            .with_dependency(FieldDependency::new(
                path("spec.alertmanager.enabled"),
                path("spec.prometheus.enabled"),
            ))
            .with_dependency(FieldDependency::new(
                path("spec.remoteWrite[].tls"),
                path("spec.remoteWrite[].secret"),
            ))
    }

    #[rstest]
    fn valid_resource(schema: VersionSchema) {
        let data = json!({"spec": {
            "prometheus": {
                "enabled": true,
                "version": "v2.45.0",
                "retention": "15d",
                "storage": "10Gi",
            },
            "alertmanager": {"enabled": true},
            "remoteWrite": [{"tls": true, "secret": "rw-tls"}, {"tls": false}],
        }});

        validate(&data, &schema).expect("resource is valid");
    }

    #[rstest]
    #[case::required(
        json!({"spec": {"prometheus": {"enabled": true}}}),
        "spec.prometheus.version"
    )]
    #[case::version_format(
        json!({"spec": {"prometheus": {"version": "latest"}}}),
        "spec.prometheus.version"
    )]
    #[case::duration_format(
        json!({"spec": {"prometheus": {"version": "2.45.0", "retention": "15 parsecs"}}}),
        "spec.prometheus.retention"
    )]
    #[case::quantity_format(
        json!({"spec": {"prometheus": {"version": "2.45.0", "storage": "10GB"}}}),
        "spec.prometheus.storage"
    )]
    #[case::type_mismatch(
        json!({"spec": {"prometheus": {"version": "2.45.0", "enabled": "yes"}}}),
        "spec.prometheus.enabled"
    )]
    #[case::dependency(
        json!({"spec": {"prometheus": {"version": "2.45.0"}, "alertmanager": {"enabled": true}}}),
        "spec.alertmanager.enabled"
    )]
    #[case::dependency_in_array(
        json!({"spec": {"remoteWrite": [{"tls": false}, {"tls": true, "secret": ""}]}}),
        "spec.remoteWrite[1].tls"
    )]
    fn first_error_names_the_field(
        schema: VersionSchema,
        #[case] data: Value,
        #[case] expected: &str,
    ) {
        let err = validate(&data, &schema).expect_err("resource is invalid");
        assert_eq!(err.path(), &path(expected), "unexpected error: {err}");
    }

    #[rstest]
    #[case("500m", true)]
    #[case("10Gi", true)]
    #[case("1.5", true)]
    #[case("0", true)]
    #[case("10GB", false)]
    #[case("", false)]
    #[case("Gi", false)]
    fn quantities(#[case] input: &str, #[case] valid: bool) {
        assert_eq!(is_quantity(input), valid);
    }
}
