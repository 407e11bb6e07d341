//! Field-level description of every registered version and the
//! [`SchemaEvolutionTracker`] which relates them to each other.
use std::collections::BTreeSet;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};

use crate::path::{self, FieldPath, Segment};

mod graph;
mod tracker;

pub use graph::VersionGraph;
pub use tracker::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum FieldType {
    String,
    Integer,
    Number,
    Boolean,

    /// A string like `30s`, `7d` or `1h 30m`.
    Duration,

    /// A Kubernetes resource quantity like `10Gi` or `500m`.
    Quantity,

    /// A semantic version like `2.45.0` or `v2.45.0`.
    Version,

    /// A structured object whose sub-fields are declared individually.
    Object,

    /// A free-form object. Its keys are never checked against the schema.
    Map,
    Array,
    Any,
}

impl FieldType {
    /// Opaque fields are carried as a whole and never descended into.
    pub fn is_opaque(self) -> bool {
        matches!(self, Self::Map | Self::Any)
    }

    fn is_textual(self) -> bool {
        matches!(
            self,
            Self::String | Self::Duration | Self::Quantity | Self::Version
        )
    }

    fn is_numeric(self) -> bool {
        matches!(self, Self::Integer | Self::Number)
    }

    /// Describes whether values of this type can be carried into `target`
    /// without an explicit mapping.
    pub fn compatibility_with(self, target: Self) -> FieldCompatibility {
        if self == target {
            return FieldCompatibility::Compatible;
        }

        let coercible = (self.is_textual() && target.is_textual())
            || (self.is_numeric() && target.is_numeric())
            || (self.is_numeric() && target == Self::String)
            || matches!(
                (self, target),
                (Self::Object, Self::Map) | (Self::Map, Self::Object) | (_, Self::Any)
            );

        if coercible {
            FieldCompatibility::Coercible {
                from: self,
                to: target,
            }
        } else {
            FieldCompatibility::Incompatible {
                reason: format!("type changes from {self} to {target}, which can not be coerced automatically"),
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldCompatibility {
    Compatible,
    Coercible { from: FieldType, to: FieldType },
    Incompatible { reason: String },
}

impl FieldCompatibility {
    pub fn is_compatible(&self) -> bool {
        !matches!(self, Self::Incompatible { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldInfo {
    pub field_type: FieldType,

    /// Required fields must be present whenever their parent object is.
    pub required: bool,
    pub default: Option<Value>,

    /// Loss of this field during a conversion can not be undone and is not
    /// preserved out-of-band. Used for security relevant settings.
    pub unrecoverable: bool,

    /// Whether a missing required field receives its default when converting
    /// to this version from a newer one. Upgrades always populate defaults.
    pub default_on_downgrade: bool,
    pub deprecated: Option<String>,
}

impl FieldInfo {
    pub fn new(field_type: FieldType) -> Self {
        Self {
            field_type,
            required: false,
            default: None,
            unrecoverable: false,
            default_on_downgrade: false,
            deprecated: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn unrecoverable(mut self) -> Self {
        self.unrecoverable = true;
        self
    }

    pub fn default_on_downgrade(mut self) -> Self {
        self.default_on_downgrade = true;
        self
    }

    pub fn deprecated(mut self, note: impl Into<String>) -> Self {
        self.deprecated = Some(note.into());
        self
    }
}

/// A cross-field rule: whenever `field` is `true`, `requires` must be set to a
/// value other than `false`, `null` or the empty string. `[]` indices of both
/// paths are paired up in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldDependency {
    pub field: FieldPath,
    pub requires: FieldPath,
}

impl FieldDependency {
    pub fn new(field: FieldPath, requires: FieldPath) -> Self {
        Self { field, requires }
    }
}

/// How a concrete path relates to a [`VersionSchema`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldLookup<'a> {
    Declared(&'a FieldInfo),

    /// An element of a declared array.
    ArrayElement,

    /// Somewhere below a declared [`FieldType::Map`] or [`FieldType::Any`].
    WithinOpaque,
    Undeclared,
}

impl FieldLookup<'_> {
    pub fn is_modeled(&self) -> bool {
        !matches!(self, Self::Undeclared)
    }
}

/// The fields of a single version, keyed by schema key (see
/// [`FieldPath::schema_key`]).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionSchema {
    name: String,
    fields: IndexMap<String, FieldInfo>,
    dependencies: Vec<FieldDependency>,
}

impl VersionSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: IndexMap::new(),
            dependencies: Vec::new(),
        }
    }

    /// Declares (or replaces) the field at `path`.
    pub fn with_field(mut self, path: &FieldPath, info: FieldInfo) -> Self {
        self.fields.insert(path.schema_key(), info);
        self
    }

    pub fn with_dependency(mut self, dependency: FieldDependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldInfo)> {
        self.fields.iter().map(|(key, info)| (key.as_str(), info))
    }

    pub fn field(&self, schema_key: &str) -> Option<&FieldInfo> {
        self.fields.get(schema_key)
    }

    pub fn dependencies(&self) -> &[FieldDependency] {
        &self.dependencies
    }

    pub fn lookup(&self, path: &FieldPath) -> FieldLookup<'_> {
        if let Some(info) = self.fields.get(&path.schema_key()) {
            return FieldLookup::Declared(info);
        }

        let within_opaque = path.ancestors().any(|ancestor| {
            self.fields
                .get(&ancestor.schema_key())
                .is_some_and(|info| info.field_type.is_opaque())
        });
        if within_opaque {
            return FieldLookup::WithinOpaque;
        }

        if let (Some(Segment::Index(_)), Some(parent)) = (path.last(), path.parent()) {
            if let Some(info) = self.fields.get(&parent.schema_key()) {
                if info.field_type == FieldType::Array {
                    return FieldLookup::ArrayElement;
                }
            }
        }

        FieldLookup::Undeclared
    }

    /// Returns the required fields missing in `data`. A field only counts as
    /// missing if its parent object exists.
    pub fn missing_required(&self, data: &Value) -> Vec<(FieldPath, &FieldInfo)> {
        let mut missing = Vec::new();
        for (key, info) in self.fields.iter().filter(|(_, info)| info.required) {
            let Ok(pattern) = key.parse::<FieldPath>() else {
                continue;
            };
            let Some(Segment::Key(name)) = pattern.last() else {
                continue;
            };

            let parents = match pattern.parent() {
                Some(parent) => path::expand(data, &parent),
                None => vec![FieldPath::default()],
            };
            missing.extend(
                parents
                    .into_iter()
                    .filter(|parent| {
                        path::get(data, parent)
                            .and_then(Value::as_object)
                            .is_some_and(|object| !object.contains_key(name))
                    })
                    .map(|parent| (parent.child(name.clone()), info)),
            );
        }
        missing
    }

    /// Returns the paths below `data.spec` this schema does not model, skipping
    /// everything matched by one of the `consumed` patterns. Only the topmost
    /// path of an unmodeled subtree is reported.
    pub fn unmodeled_paths(&self, data: &Value, consumed: &[FieldPath]) -> Vec<FieldPath> {
        let mut unmodeled = Vec::new();
        if let Some(spec) = data.get("spec") {
            self.collect_unmodeled(spec, &FieldPath::root("spec"), consumed, &mut unmodeled);
        }
        unmodeled
    }

    fn collect_unmodeled(
        &self,
        value: &Value,
        path: &FieldPath,
        consumed: &[FieldPath],
        unmodeled: &mut Vec<FieldPath>,
    ) {
        let children: Vec<(FieldPath, &Value)> = match value {
            Value::Object(object) => object
                .iter()
                .map(|(key, child)| (path.child(key.clone()), child))
                .collect(),
            Value::Array(items) => items
                .iter()
                .enumerate()
                .map(|(index, child)| (path.index(index), child))
                .collect(),
            _ => return,
        };

        for (child_path, child) in children {
            if consumed.iter().any(|pattern| child_path.matches(pattern)) {
                continue;
            }

            match self.lookup(&child_path) {
                FieldLookup::Declared(info) if info.field_type.is_opaque() => {}
                FieldLookup::Declared(_) | FieldLookup::ArrayElement => {
                    self.collect_unmodeled(child, &child_path, consumed, unmodeled);
                }
                FieldLookup::WithinOpaque => {}
                FieldLookup::Undeclared => {
                    if consumed
                        .iter()
                        .any(|pattern| child_path.is_ancestor_of(pattern))
                    {
                        self.collect_unmodeled(child, &child_path, consumed, unmodeled);
                    } else {
                        unmodeled.push(child_path);
                    }
                }
            }
        }
    }
}

/// Difference between two [`VersionSchema`]s. The three sets are disjoint.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FieldChangeSet {
    pub added: BTreeSet<String>,
    pub removed: BTreeSet<String>,
    pub modified: BTreeSet<String>,
}

impl FieldChangeSet {
    pub fn between(from: &VersionSchema, to: &VersionSchema) -> Self {
        let mut changes = Self::default();

        for (key, info) in &from.fields {
            match to.fields.get(key) {
                None => {
                    changes.removed.insert(key.clone());
                }
                Some(other)
                    if other.field_type != info.field_type || other.required != info.required =>
                {
                    changes.modified.insert(key.clone());
                }
                Some(_) => {}
            }
        }

        for key in to.fields.keys() {
            if !from.fields.contains_key(key) {
                changes.added.insert(key.clone());
            }
        }

        changes
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
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

    fn schema() -> VersionSchema {
        VersionSchema::new("v1")
            .with_field(&path("spec"), FieldInfo::new(FieldType::Object))
            .with_field(&path("spec.paused"), FieldInfo::new(FieldType::Boolean))
            .with_field(&path("spec.nodeSelector"), FieldInfo::new(FieldType::Map))
            .with_field(&path("spec.remoteWrite"), FieldInfo::new(FieldType::Array))
            .with_field(
                &path("spec.remoteWrite[].url"),
                FieldInfo::new(FieldType::String).required(),
            )
    }

    #[rstest]
    #[case(FieldType::Boolean, FieldType::String, false)]
    #[case(FieldType::String, FieldType::Boolean, false)]
    #[case(FieldType::String, FieldType::Duration, true)]
    #[case(FieldType::Integer, FieldType::String, true)]
    #[case(FieldType::String, FieldType::Integer, false)]
    #[case(FieldType::Object, FieldType::Map, true)]
    #[case(FieldType::Array, FieldType::Map, false)]
    #[case(FieldType::Boolean, FieldType::Any, true)]
    fn type_compatibility(#[case] from: FieldType, #[case] to: FieldType, #[case] compatible: bool) {
        assert_eq!(from.compatibility_with(to).is_compatible(), compatible);
    }

    #[rstest]
    #[case("spec.paused", true)]
    #[case("spec.remoteWrite[3]", true)]
    #[case("spec.remoteWrite[3].url", true)]
    #[case(r#"spec.nodeSelector["kubernetes.io/os"]"#, true)]
    #[case("spec.remoteWrite[0].headers", false)]
    #[case("spec.security", false)]
    fn lookup_paths(#[case] input: &str, #[case] modeled: bool) {
        assert_eq!(schema().lookup(&path(input)).is_modeled(), modeled);
    }

    #[test]
    fn unmodeled_paths_reports_topmost_unknown_subtrees() {
        let data = json!({"spec": {
            "paused": false,
            "security": {"tls": {"enabled": true}},
            "nodeSelector": {"disk": "ssd"},
            "remoteWrite": [
                {"url": "https://a", "headers": {"X-Scope": "1"}},
                {"url": "https://b"},
            ],
        }});

        assert_eq!(schema().unmodeled_paths(&data, &[]), vec![
            path("spec.security"),
            path("spec.remoteWrite[0].headers"),
        ]);
    }

    #[test]
    fn unmodeled_paths_skip_consumed_fields() {
        let data = json!({"spec": {"legacy": {"tlsSecret": "tls", "other": 1}}});
        let unmodeled = schema().unmodeled_paths(&data, &[path("spec.legacy.tlsSecret")]);

        assert_eq!(unmodeled, vec![path("spec.legacy.other")]);
    }

    #[test]
    fn required_fields_are_relative_to_their_parent() {
        let data = json!({"spec": {"remoteWrite": [{"url": "https://a"}, {}]}});
        let missing: Vec<_> = schema()
            .missing_required(&data)
            .into_iter()
            .map(|(path, _)| path)
            .collect();

        assert_eq!(missing, vec![path("spec.remoteWrite[1].url")]);
        assert!(schema().missing_required(&json!({})).is_empty());
    }

    #[test]
    fn change_set_is_disjoint() {
        let newer = schema()
            .with_field(&path("spec.paused"), FieldInfo::new(FieldType::String))
            .with_field(&path("spec.security"), FieldInfo::new(FieldType::Object));
        let older = schema().with_field(&path("spec.legacy"), FieldInfo::new(FieldType::String));

        let changes = FieldChangeSet::between(&older, &newer);
        assert_eq!(changes.added, BTreeSet::from(["spec.security".to_owned()]));
        assert_eq!(changes.removed, BTreeSet::from(["spec.legacy".to_owned()]));
        assert_eq!(changes.modified, BTreeSet::from(["spec.paused".to_owned()]));
    }
}
