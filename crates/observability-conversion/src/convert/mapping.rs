use std::{collections::HashMap, time::Duration};

use serde_json::Value;
use snafu::{ResultExt, Snafu, ensure};

use crate::path::{self, FieldPath, SetFieldError};

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

#[derive(Debug, Snafu)]
pub enum CoercionError {
    #[snafu(display("expected {expected}, got {value}"))]
    UnexpectedType { expected: &'static str, value: Value },

    #[snafu(display("failed to parse embedded JSON document"))]
    ParseJson { source: serde_json::Error },

    #[snafu(display("failed to serialize map as JSON document"))]
    SerializeJson { source: serde_json::Error },

    #[snafu(display("failed to parse duration {duration:?}"))]
    ParseDuration {
        source: humantime::DurationError,
        duration: String,
    },

    #[snafu(display("duration {duration:?} is not a whole number of days"))]
    FractionalDays { duration: String },
}

#[derive(Debug, Snafu)]
pub enum MappingError {
    #[snafu(display("failed to coerce field {path}"))]
    Coerce {
        source: CoercionError,
        path: FieldPath,
    },

    #[snafu(display("failed to move field to {path}"))]
    Move {
        source: SetFieldError,
        path: FieldPath,
    },
}

impl MappingError {
    pub fn path(&self) -> &FieldPath {
        match self {
            Self::Coerce { path, .. } | Self::Move { path, .. } => path,
        }
    }
}

/// A value transformation applied while moving a field.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Coercion {
    #[default]
    None,

    /// `2.45.0` becomes `v2.45.0`.
    EnsureVersionPrefix,

    /// `v2.45.0` becomes `2.45.0`.
    StripVersionPrefix,

    /// A string holding a JSON object becomes that object.
    JsonStringToMap,
    MapToJsonString,

    /// An integer number of days becomes a duration string like `7d`.
    DaysToDuration,
    DurationToDays,
}

impl Coercion {
    pub fn apply(self, value: Value) -> Result<Value, CoercionError> {
        match self {
            Self::None => Ok(value),
            Self::EnsureVersionPrefix => {
                let version = expect_str(&value, "a version string")?;
                if version.starts_with('v') {
                    return Ok(value);
                }
                Ok(Value::String(format!("v{version}")))
            }
            Self::StripVersionPrefix => {
                let version = expect_str(&value, "a version string")?;
                Ok(Value::String(
                    version.strip_prefix('v').unwrap_or(version).to_owned(),
                ))
            }
            Self::JsonStringToMap => {
                let document = expect_str(&value, "a JSON encoded object")?;
                let parsed: Value = serde_json::from_str(document).context(ParseJsonSnafu)?;
                ensure!(
                    parsed.is_object(),
                    UnexpectedTypeSnafu {
                        expected: "a JSON encoded object",
                        value: parsed,
                    }
                );
                Ok(parsed)
            }
            Self::MapToJsonString => {
                ensure!(
                    value.is_object(),
                    UnexpectedTypeSnafu {
                        expected: "an object",
                        value,
                    }
                );
                serde_json::to_string(&value)
                    .map(Value::String)
                    .context(SerializeJsonSnafu)
            }
            Self::DaysToDuration => {
                let days = value.as_u64().ok_or_else(|| {
                    UnexpectedTypeSnafu {
                        expected: "a non-negative number of days",
                        value: value.clone(),
                    }
                    .build()
                })?;
                Ok(Value::String(format!("{days}d")))
            }
            Self::DurationToDays => {
                let duration = expect_str(&value, "a duration string")?;
                let parsed = humantime::parse_duration(duration)
                    .context(ParseDurationSnafu { duration })?;
                Ok(Value::from(whole_days(parsed, duration)?))
            }
        }
    }
}

fn expect_str<'a>(value: &'a Value, expected: &'static str) -> Result<&'a str, CoercionError> {
    value.as_str().ok_or_else(|| {
        UnexpectedTypeSnafu {
            expected,
            value: value.clone(),
        }
        .build()
    })
}

fn whole_days(duration: Duration, input: &str) -> Result<u64, CoercionError> {
    ensure!(
        duration.subsec_nanos() == 0 && duration.as_secs() % SECONDS_PER_DAY == 0,
        FractionalDaysSnafu { duration: input }
    );
    Ok(duration.as_secs() / SECONDS_PER_DAY)
}

/// Moves the value at `source` to `target`, coercing it on the way. Both paths
/// may contain `[]`, in which case every array element is mapped and the
/// indices carry over from source to target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldMapping {
    pub source: FieldPath,
    pub target: FieldPath,
    pub coercion: Coercion,
}

impl FieldMapping {
    pub fn rename(source: FieldPath, target: FieldPath) -> Self {
        Self {
            source,
            target,
            coercion: Coercion::None,
        }
    }

    /// Coerces the value in place.
    pub fn coerce(path: FieldPath, coercion: Coercion) -> Self {
        Self {
            source: path.clone(),
            target: path,
            coercion,
        }
    }

    pub fn with_coercion(mut self, coercion: Coercion) -> Self {
        self.coercion = coercion;
        self
    }

    /// Applies the mapping to every match in `data`. Objects left empty by
    /// moving a field away are removed as well.
    pub fn apply(&self, data: &mut Value) -> Result<(), MappingError> {
        for source in path::expand(data, &self.source) {
            let Some(value) = path::remove(data, &source) else {
                continue;
            };

            let target = self.target.with_indices(&source.indices());
            let value = self
                .coercion
                .apply(value)
                .context(CoerceSnafu { path: source.clone() })?;

            if target != source {
                remove_empty_parents(data, &source);
            }
            path::set(data, &target, value).context(MoveSnafu { path: target })?;
        }

        Ok(())
    }
}

fn remove_empty_parents(data: &mut Value, path: &FieldPath) {
    let mut current = path.parent();
    // Never remove the top-level object, like spec.
    while let Some(parent) = current.filter(|parent| parent.len() > 1) {
        let empty = matches!(path::get(data, &parent), Some(Value::Object(object)) if object.is_empty());
        if !empty {
            break;
        }
        path::remove(data, &parent);
        current = parent.parent();
    }
}

/// The mappings of every version pair which needs more than a pass-through.
#[derive(Clone, Debug, Default)]
pub struct MappingTable {
    mappings: HashMap<(String, String), Vec<FieldMapping>>,
}

impl MappingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mappings(
        mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        mappings: impl IntoIterator<Item = FieldMapping>,
    ) -> Self {
        self.mappings
            .entry((from.into(), to.into()))
            .or_default()
            .extend(mappings);
        self
    }

    pub fn get(&self, from: &str, to: &str) -> &[FieldMapping] {
        self.mappings
            .get(&(from.to_owned(), to.to_owned()))
            .map_or(&[], Vec::as_slice)
    }

    /// Applies every mapping registered for `from` to `to`, in registration
    /// order.
    pub fn apply(&self, from: &str, to: &str, data: &mut Value) -> Result<(), MappingError> {
        for mapping in self.get(from, to) {
            mapping.apply(data)?;
        }
        Ok(())
    }

    /// The concrete-or-pattern source paths consumed by the mappings of the
    /// version pair.
    pub fn consumed(&self, from: &str, to: &str) -> Vec<FieldPath> {
        self.get(from, to)
            .iter()
            .map(|mapping| mapping.source.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    fn path(input: &str) -> FieldPath {
        input.parse().expect("valid field path")
    }

    #[rstest]
    #[case(Coercion::EnsureVersionPrefix, json!("2.45.0"), json!("v2.45.0"))]
    #[case(Coercion::EnsureVersionPrefix, json!("v2.45.0"), json!("v2.45.0"))]
    #[case(Coercion::StripVersionPrefix, json!("v10.0.3"), json!("10.0.3"))]
    #[case(Coercion::DaysToDuration, json!(7), json!("7d"))]
    #[case(Coercion::DurationToDays, json!("14d"), json!(14))]
    #[case(Coercion::DurationToDays, json!("48h"), json!(2))]
    #[case(Coercion::JsonStringToMap, json!(r#"{"job":"node"}"#), json!({"job": "node"}))]
    #[case(Coercion::MapToJsonString, json!({"job": "node"}), json!(r#"{"job":"node"}"#))]
    fn coercions(#[case] coercion: Coercion, #[case] input: Value, #[case] expected: Value) {
        assert_eq!(coercion.apply(input).expect("coercible"), expected);
    }

    #[rstest]
    #[case(Coercion::EnsureVersionPrefix, json!(true))]
    #[case(Coercion::DaysToDuration, json!("seven"))]
    #[case(Coercion::DurationToDays, json!("36h"))]
    #[case(Coercion::DurationToDays, json!("soon"))]
    #[case(Coercion::JsonStringToMap, json!("[1, 2]"))]
    #[case(Coercion::MapToJsonString, json!("already a string"))]
    fn failing_coercions(#[case] coercion: Coercion, #[case] input: Value) {
        coercion.apply(input).expect_err("not coercible");
    }

    #[test]
    fn flat_field_moves_into_nested_object() {
        let mut data = json!({"spec": {"ingress": {"enabled": true, "tlsSecret": "grafana-tls"}}});
        FieldMapping::rename(path("spec.ingress.tlsSecret"), path("spec.ingress.tls.secretName"))
            .apply(&mut data)
            .expect("mapping applies");

        assert_eq!(
            data,
            json!({"spec": {"ingress": {"enabled": true, "tls": {"secretName": "grafana-tls"}}}})
        );
    }

    #[test]
    fn emptied_objects_are_removed() {
        let mut data = json!({"spec": {"global": {"nodeSelector": {"disk": "ssd"}}}});
        FieldMapping::rename(path("spec.global.nodeSelector"), path("spec.nodeSelector"))
            .apply(&mut data)
            .expect("mapping applies");

        assert_eq!(data, json!({"spec": {"nodeSelector": {"disk": "ssd"}}}));
    }

    #[test]
    fn array_elements_keep_their_index() {
        let mut data = json!({"spec": {"remoteWrite": [
            {"url": "https://a", "timeout": "30s"},
            {"url": "https://b"},
            {"url": "https://c", "timeout": "1m"},
        ]}});
        FieldMapping::rename(
            path("spec.remoteWrite[].timeout"),
            path("spec.remoteWrite[].remoteTimeout"),
        )
        .apply(&mut data)
        .expect("mapping applies");

        assert_eq!(data["spec"]["remoteWrite"][0]["remoteTimeout"], json!("30s"));
        assert_eq!(data["spec"]["remoteWrite"][1], json!({"url": "https://b"}));
        assert_eq!(data["spec"]["remoteWrite"][2]["remoteTimeout"], json!("1m"));
    }

    #[test]
    fn coercion_failure_names_the_field() {
        let mut data = json!({"spec": {"backup": {"retentionDays": "a week"}}});
        let err = FieldMapping::rename(path("spec.backup.retentionDays"), path("spec.backup.retention"))
            .with_coercion(Coercion::DaysToDuration)
            .apply(&mut data)
            .expect_err("not a number");

        assert_eq!(err.path(), &path("spec.backup.retentionDays"));
    }

    #[test]
    fn table_is_directional() {
        let table = MappingTable::new().with_mappings("v1alpha1", "v1beta1", [FieldMapping::coerce(
            path("spec.version"),
            Coercion::EnsureVersionPrefix,
        )]);

        assert_eq!(table.get("v1alpha1", "v1beta1").len(), 1);
        assert!(table.get("v1beta1", "v1alpha1").is_empty());
    }
}
