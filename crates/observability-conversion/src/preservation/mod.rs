//! Carries data across a conversion which the target version can not model.
//!
//! [`PreservationEngine::capture`] runs before the structural transformation
//! of a resource and decides, based on the [`PreservationPolicy`], which
//! labels, annotations, finalizers and unknown spec fields are retained.
//! [`PreservationEngine::apply`] runs afterwards and re-attaches them to the
//! converted resource. Unknown spec fields are parked in the
//! [`PRESERVED_FIELDS_ANNOTATION`] until a later conversion reaches a version
//! which models them again.
use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    api_version::ApiVersion,
    path::FieldPath,
    resource::VersionedResource,
    schema::{FieldLookup, VersionSchema},
};

mod policy;

pub use policy::*;

/// Reserved annotation holding spec fields without a home in the current
/// version.
pub const PRESERVED_FIELDS_ANNOTATION: &str = "conversion.observability.io/preserved-fields";

/// The client-side apply annotation. It embeds the `apiVersion` it was written
/// with, which is rewritten to the target version.
pub const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// The maximum size of all annotations of an object enforced by the API
/// server.
pub const DEFAULT_MAX_PRESERVED_BYTES: usize = 256 * 1024;

/// Priority of system annotations which no rule matched.
const SYSTEM_ANNOTATION_PRIORITY: i32 = i32::MAX;

/// The part of a conversion the engine needs to know about.
#[derive(Clone, Copy, Debug)]
pub struct CaptureScope<'a> {
    pub source: &'a VersionSchema,
    pub target: &'a VersionSchema,
    pub target_api_version: &'a ApiVersion,

    /// Source paths consumed by an explicit field mapping. They are converted,
    /// not preserved.
    pub consumed: &'a [FieldPath],
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetadataEntry {
    pub key: String,
    pub value: String,
    pub priority: i32,
}

impl MetadataEntry {
    fn size(&self) -> usize {
        self.key.len() + self.value.len()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreservedField {
    pub path: FieldPath,
    pub value: Value,
    #[serde(default)]
    pub priority: i32,
}

impl PreservedField {
    fn size(&self) -> usize {
        self.path.to_string().len() + self.value.to_string().len()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PreservedPayload {
    fields: Vec<PreservedField>,
}

/// What happened to a spec field the target version does not model.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Disposition {
    Preserved,

    /// Discarded because a rule drops it or no rule retains it.
    Dropped,

    /// Discarded because the source schema marks it as unrecoverable.
    Unrecoverable,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnmodeledField {
    pub path: FieldPath,
    pub disposition: Disposition,
}

/// Everything [`PreservationEngine::capture`] decided to retain.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PreservedData {
    pub annotations: Vec<MetadataEntry>,
    pub labels: Vec<MetadataEntry>,

    /// Finalizers in their original order. The key is the original finalizer,
    /// the value the (possibly transformed) one to apply.
    pub finalizers: Vec<MetadataEntry>,
    pub fields: Vec<PreservedField>,

    /// The unmodeled spec fields detected in this conversion step.
    pub unmodeled: Vec<UnmodeledField>,

    /// Set if entries were discarded to stay below the size limit.
    pub truncated: bool,
}

impl PreservedData {
    pub fn size(&self) -> usize {
        self.metadata_entries().map(MetadataEntry::size).sum::<usize>()
            + self.fields.iter().map(PreservedField::size).sum::<usize>()
    }

    fn metadata_entries(&self) -> impl Iterator<Item = &MetadataEntry> {
        self.annotations
            .iter()
            .chain(&self.labels)
            .chain(&self.finalizers)
    }

    /// Discards the lowest priority entries until the data fits into
    /// `max_size` bytes. Among entries with equal priority the ones captured
    /// last are discarded first. Returns whether anything was discarded.
    fn truncate(&mut self, max_size: usize) -> bool {
        let mut total = self.size();
        if total <= max_size {
            return false;
        }

        // (priority, capture order, slot, size)
        let mut candidates: Vec<(i32, usize, Slot, usize)> = self
            .annotations
            .iter()
            .enumerate()
            .map(|(index, entry)| (entry.priority, Slot::Annotation(index), entry.size()))
            .chain(
                self.labels
                    .iter()
                    .enumerate()
                    .map(|(index, entry)| (entry.priority, Slot::Label(index), entry.size())),
            )
            .chain(
                self.finalizers
                    .iter()
                    .enumerate()
                    .map(|(index, entry)| (entry.priority, Slot::Finalizer(index), entry.size())),
            )
            .chain(
                self.fields
                    .iter()
                    .enumerate()
                    .map(|(index, field)| (field.priority, Slot::Field(index), field.size())),
            )
            .enumerate()
            .map(|(order, (priority, slot, size))| (priority, order, slot, size))
            .collect();
        candidates.sort_by(|lhs, rhs| lhs.0.cmp(&rhs.0).then(rhs.1.cmp(&lhs.1)));

        let mut discarded = HashSet::new();
        for (_, _, slot, size) in candidates {
            if total <= max_size {
                break;
            }
            total -= size;
            discarded.insert(slot);
        }

        retain_slots(&mut self.annotations, &discarded, Slot::Annotation);
        retain_slots(&mut self.labels, &discarded, Slot::Label);
        retain_slots(&mut self.finalizers, &discarded, Slot::Finalizer);
        retain_slots(&mut self.fields, &discarded, Slot::Field);

        tracing::warn!(
            discarded = discarded.len(),
            max_size,
            "preserved data exceeds the size limit, discarded lowest priority entries"
        );
        true
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Slot {
    Annotation(usize),
    Label(usize),
    Finalizer(usize),
    Field(usize),
}

fn retain_slots<T>(items: &mut Vec<T>, discarded: &HashSet<Slot>, slot: fn(usize) -> Slot) {
    let mut index = 0;
    items.retain(|_| {
        let keep = !discarded.contains(&slot(index));
        index += 1;
        keep
    });
}

#[derive(Clone, Debug, PartialEq)]
pub struct ApplyOutcome {
    pub resource: VersionedResource,
    pub truncated: bool,
}

#[derive(Clone, Debug)]
pub struct PreservationEngine {
    policy: PreservationPolicy,
    max_size: usize,
}

impl Default for PreservationEngine {
    fn default() -> Self {
        Self::new(PreservationPolicy::standard())
    }
}

impl PreservationEngine {
    pub fn new(policy: PreservationPolicy) -> Self {
        Self {
            policy,
            max_size: DEFAULT_MAX_PRESERVED_BYTES,
        }
    }

    /// Sets the maximum size in bytes of all preserved entries.
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn policy(&self) -> &PreservationPolicy {
        &self.policy
    }

    /// Classifies the metadata and the spec fields of `resource` which have no
    /// home in the target version, and returns the retained ones.
    pub fn capture(&self, resource: &VersionedResource, scope: &CaptureScope<'_>) -> PreservedData {
        let mut data = PreservedData::default();

        for (key, value) in resource.metadata.annotations.iter().flatten() {
            if key == PRESERVED_FIELDS_ANNOTATION {
                data.fields.extend(parse_preserved_fields(value));
                continue;
            }

            let rule = self.policy.resolve(RuleType::Annotation, key);
            if key == LAST_APPLIED_ANNOTATION {
                if !matches!(rule.map(|rule| &rule.action), Some(Action::Drop)) {
                    data.annotations.push(MetadataEntry {
                        key: key.clone(),
                        value: rewrite_api_version(value, scope.target_api_version),
                        priority: rule.map_or(SYSTEM_ANNOTATION_PRIORITY, |rule| rule.priority),
                    });
                }
                continue;
            }

            if let Some(entry) = retain(rule, key, value) {
                data.annotations.push(entry);
            }
        }

        for (key, value) in resource.metadata.labels.iter().flatten() {
            if let Some(entry) = retain(self.policy.resolve(RuleType::Label, key), key, value) {
                data.labels.push(entry);
            }
        }

        for finalizer in resource.metadata.finalizers.iter().flatten() {
            let rule = self.policy.resolve(RuleType::Finalizer, finalizer);
            if let Some(entry) = retain(rule, finalizer, finalizer) {
                data.finalizers.push(entry);
            }
        }

        for path in scope.target.unmodeled_paths(&resource.data, scope.consumed) {
            let disposition = self.capture_field(resource, &path, scope, &mut data.fields);
            data.unmodeled.push(UnmodeledField { path, disposition });
        }

        data.truncated = data.truncate(self.max_size);
        data
    }

    fn capture_field(
        &self,
        resource: &VersionedResource,
        path: &FieldPath,
        scope: &CaptureScope<'_>,
        fields: &mut Vec<PreservedField>,
    ) -> Disposition {
        if let FieldLookup::Declared(info) = scope.source.lookup(path) {
            if info.unrecoverable {
                return Disposition::Unrecoverable;
            }
        }

        let Some(value) = resource.field(path) else {
            return Disposition::Dropped;
        };

        let key = path.to_string();
        let Some(rule) = self.policy.resolve(RuleType::CustomField, &key) else {
            return Disposition::Dropped;
        };

        let value = match &rule.action {
            Action::Drop => return Disposition::Dropped,
            Action::Preserve => value.clone(),
            Action::Transform(transformer) => transformer.apply(value),
        };

        // A newer capture of the same path replaces an older one.
        fields.retain(|field| &field.path != path);
        fields.push(PreservedField {
            path: path.clone(),
            value,
            priority: rule.priority,
        });
        Disposition::Preserved
    }

    /// Re-attaches `preserved` to the converted `resource`. Labels,
    /// annotations and finalizers of `resource` are replaced by the retained
    /// ones. Preserved fields the target version models are restored into the
    /// spec unless the conversion already produced a value for them.
    pub fn apply(
        &self,
        mut resource: VersionedResource,
        mut preserved: PreservedData,
        scope: &CaptureScope<'_>,
    ) -> ApplyOutcome {
        let mut parked = Vec::new();
        for field in std::mem::take(&mut preserved.fields) {
            if !scope.target.lookup(&field.path).is_modeled() {
                parked.push(field);
                continue;
            }

            if resource.field(&field.path).is_some() {
                tracing::debug!(path = %field.path, "conversion produced a value, discarding preserved one");
                continue;
            }

            match resource.set_field(&field.path, field.value.clone()) {
                Ok(()) => tracing::debug!(path = %field.path, "restored preserved field"),
                Err(error) => {
                    tracing::warn!(path = %field.path, %error, "failed to restore preserved field, keeping it parked");
                    parked.push(field);
                }
            }
        }
        preserved.fields = parked;
        let truncated = preserved.truncate(self.max_size) || preserved.truncated;

        let mut annotations: BTreeMap<String, String> = preserved
            .annotations
            .into_iter()
            .map(|entry| (entry.key, entry.value))
            .collect();
        if !preserved.fields.is_empty() {
            let payload = PreservedPayload {
                fields: preserved.fields,
            };
            match serde_json::to_string(&payload) {
                Ok(payload) => {
                    annotations.insert(PRESERVED_FIELDS_ANNOTATION.to_owned(), payload);
                }
                Err(error) => tracing::error!(%error, "failed to serialize preserved fields"),
            }
        }

        let labels: BTreeMap<String, String> = preserved
            .labels
            .into_iter()
            .map(|entry| (entry.key, entry.value))
            .collect();
        let finalizers: Vec<String> = preserved
            .finalizers
            .into_iter()
            .map(|entry| entry.value)
            .collect();

        let metadata = &mut resource.metadata;
        metadata.annotations = (!annotations.is_empty()).then_some(annotations);
        metadata.labels = (!labels.is_empty()).then_some(labels);
        metadata.finalizers = (!finalizers.is_empty()).then_some(finalizers);

        ApplyOutcome {
            resource,
            truncated,
        }
    }
}

fn retain(rule: Option<&Rule>, key: &str, value: &str) -> Option<MetadataEntry> {
    let rule = rule?;
    let value = match &rule.action {
        Action::Preserve => value.to_owned(),
        Action::Transform(transformer) => transformer.apply_str(value),
        Action::Drop => return None,
    };

    Some(MetadataEntry {
        key: key.to_owned(),
        value,
        priority: rule.priority,
    })
}

fn parse_preserved_fields(payload: &str) -> Vec<PreservedField> {
    match serde_json::from_str::<PreservedPayload>(payload) {
        Ok(payload) => payload.fields,
        Err(error) => {
            tracing::warn!(%error, "ignoring malformed preserved fields annotation");
            Vec::new()
        }
    }
}

/// Rewrites the `apiVersion` embedded in a last-applied-configuration.
/// Anything which is not a JSON object is returned unchanged.
fn rewrite_api_version(value: &str, target: &ApiVersion) -> String {
    let Ok(Value::Object(mut object)) = serde_json::from_str::<Value>(value) else {
        return value.to_owned();
    };
    if !object.contains_key("apiVersion") {
        return value.to_owned();
    }

    object.insert("apiVersion".to_owned(), Value::String(target.to_string()));
    Value::Object(object).to_string()
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use rstest::{fixture, rstest};
    use serde_json::json;

    use super::*;
    use crate::schema::{FieldInfo, FieldType};

    fn path(input: &str) -> FieldPath {
        input.parse().expect("valid field path")
    }

    struct Versions {
        beta: VersionSchema,
        alpha: VersionSchema,
        alpha_api: ApiVersion,
        beta_api: ApiVersion,
    }

    impl Versions {
        fn downgrade(&self) -> CaptureScope<'_> {
            CaptureScope {
                source: &self.beta,
                target: &self.alpha,
                target_api_version: &self.alpha_api,
                consumed: &[],
            }
        }

        fn upgrade(&self) -> CaptureScope<'_> {
            CaptureScope {
                source: &self.alpha,
                target: &self.beta,
                target_api_version: &self.beta_api,
                consumed: &[],
            }
        }
    }

    #[fixture]
    fn versions() -> Versions {
        let alpha = VersionSchema::new("v1alpha1")
            .with_field(&path("spec"), FieldInfo::new(FieldType::Object))
            .with_field(&path("spec.paused"), FieldInfo::new(FieldType::Boolean));
        let beta = VersionSchema::new("v1beta1")
            .with_field(&path("spec"), FieldInfo::new(FieldType::Object))
            .with_field(&path("spec.paused"), FieldInfo::new(FieldType::Boolean))
            .with_field(&path("spec.serviceMesh"), FieldInfo::new(FieldType::Map))
            .with_field(
                &path("spec.security"),
                FieldInfo::new(FieldType::Object).unrecoverable(),
            );

        Versions {
            beta,
            alpha,
            alpha_api: ApiVersion::new("observability.io", "v1alpha1"),
            beta_api: ApiVersion::new("observability.io", "v1beta1"),
        }
    }

    fn resource(annotations: &[(&str, &str)], labels: &[(&str, &str)]) -> VersionedResource {
        let metadata = ObjectMeta {
            name: Some("prod".into()),
            namespace: Some("monitoring".into()),
            annotations: Some(
                annotations
                    .iter()
                    .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                    .collect(),
            ),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                    .collect(),
            ),
            finalizers: Some(vec!["observability.io/cleanup".into()]),
            ..ObjectMeta::default()
        };

        VersionedResource::new(
            ApiVersion::new("observability.io", "v1beta1"),
            "ObservabilityPlatform",
            metadata,
        )
        .with_spec(json!({
            "paused": false,
            "serviceMesh": {"provider": "istio"},
            "security": {"tls": {"enabled": true}},
        }))
    }

    #[rstest]
    fn capture_classifies_unmodeled_fields(versions: Versions) {
        let engine = PreservationEngine::default();
        let data = engine.capture(&resource(&[], &[]), &versions.downgrade());

        assert_eq!(data.unmodeled, vec![
            UnmodeledField {
                path: path("spec.serviceMesh"),
                disposition: Disposition::Preserved
            },
            UnmodeledField {
                path: path("spec.security"),
                disposition: Disposition::Unrecoverable
            },
        ]);
        assert_eq!(data.fields, vec![PreservedField {
            path: path("spec.serviceMesh"),
            value: json!({"provider": "istio"}),
            priority: 0,
        }]);
    }

    #[rstest]
    fn unknown_fields_survive_a_round_trip(versions: Versions) {
        let engine = PreservationEngine::default();
        let original = resource(&[("team/owner", "sre")], &[("env", "prod")]);

        // Downgrade: the structural conversion drops fields the target lacks.
        let data = engine.capture(&original, &versions.downgrade());
        let mut downgraded = original.clone();
        downgraded.api_version = versions.alpha_api.clone();
        downgraded.remove_field(&path("spec.serviceMesh"));
        downgraded.remove_field(&path("spec.security"));
        let downgraded = engine.apply(downgraded, data, &versions.downgrade()).resource;

        let annotations = downgraded.metadata.annotations.clone().expect("annotations");
        assert!(annotations.contains_key(PRESERVED_FIELDS_ANNOTATION));
        assert_eq!(downgraded.field(&path("spec.serviceMesh")), None);

        // Upgrade: the parked field is restored and the reserved annotation removed.
        let data = engine.capture(&downgraded, &versions.upgrade());
        let mut upgraded = downgraded.clone();
        upgraded.api_version = versions.beta_api.clone();
        let upgraded = engine.apply(upgraded, data, &versions.upgrade()).resource;

        assert_eq!(
            upgraded.field(&path("spec.serviceMesh")),
            Some(&json!({"provider": "istio"}))
        );
        assert_eq!(upgraded.metadata.annotations, original.metadata.annotations);
        assert_eq!(upgraded.metadata.labels, original.metadata.labels);
        assert_eq!(upgraded.metadata.finalizers, original.metadata.finalizers);
    }

    #[rstest]
    fn last_applied_configuration_is_rewritten(versions: Versions) {
        let engine = PreservationEngine::new(PreservationPolicy::empty());
        let last_applied =
            json!({"apiVersion": "observability.io/v1beta1", "kind": "ObservabilityPlatform"})
                .to_string();
        let original = resource(&[(LAST_APPLIED_ANNOTATION, last_applied.as_str())], &[]);

        let data = engine.capture(&original, &versions.downgrade());
        let rewritten: Value =
            serde_json::from_str(&data.annotations[0].value).expect("valid JSON");
        assert_eq!(rewritten["apiVersion"], json!("observability.io/v1alpha1"));
    }

    #[rstest]
    fn policy_decides_on_metadata(versions: Versions) {
        let policy = PreservationPolicy::empty()
            .with_rule(Rule::preserve(RuleType::Annotation, "team/*").with_priority(1))
            .with_rule(Rule::drop(RuleType::Annotation, "team/secret").with_priority(2))
            .with_rule(Rule::transform(
                RuleType::Label,
                "env",
                Transformer::new("uppercase", |value| {
                    json!(value.as_str().unwrap_or_default().to_uppercase())
                }),
            ));
        let engine = PreservationEngine::new(policy);
        let original = resource(
            &[("team/owner", "sre"), ("team/secret", "hunter2"), ("other", "x")],
            &[("env", "prod"), ("tier", "gold")],
        );

        let data = engine.capture(&original, &versions.downgrade());
        let applied = engine.apply(original.clone(), data, &versions.downgrade()).resource;

        let annotations = applied.metadata.annotations.expect("annotations");
        assert_eq!(annotations.get("team/owner").map(String::as_str), Some("sre"));
        assert!(!annotations.contains_key("team/secret"));
        assert!(!annotations.contains_key("other"));
        assert_eq!(
            applied.metadata.labels,
            Some(BTreeMap::from([("env".to_owned(), "PROD".to_owned())]))
        );
        assert_eq!(applied.metadata.finalizers, None);
    }

    #[rstest]
    fn size_limit_truncates_lowest_priority_first(versions: Versions) {
        let policy = PreservationPolicy::empty()
            .with_rule(Rule::preserve(RuleType::Annotation, "important").with_priority(10))
            .with_rule(Rule::preserve(RuleType::Annotation, "*"));
        let engine = PreservationEngine::new(policy).with_max_size(48);
        let large = "x".repeat(40);
        let original = resource(&[("important", "keep-me"), ("bulky", &large)], &[]);

        let data = engine.capture(&original, &versions.downgrade());

        assert!(data.truncated);
        let keys: Vec<_> = data.annotations.iter().map(|entry| entry.key.as_str()).collect();
        assert_eq!(keys, ["important"]);
    }
}
