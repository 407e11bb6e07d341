use std::sync::Arc;

use observability_conversion::{
    VersionedResource,
    convert::{self, Coercion, FieldMapping, MappingTable, Severity, VersionConverter},
    path::FieldPath,
    platform::{self, V1ALPHA1, V1BETA1},
    preservation::PRESERVED_FIELDS_ANNOTATION,
    schema::{FieldInfo, FieldType, SchemaEvolutionTracker, VersionSchema},
};
use serde_json::{Value, json};

fn path(input: &str) -> FieldPath {
    input.parse().expect("valid field path")
}

fn resource(value: Value) -> VersionedResource {
    VersionedResource::from_value(value).expect("valid object")
}

fn alpha_platform() -> VersionedResource {
    resource(json!({
        "apiVersion": "observability.io/v1alpha1",
        "kind": "ObservabilityPlatform",
        "metadata": {
            "name": "prod",
            "namespace": "monitoring",
            "labels": {"team": "sre", "app.kubernetes.io/name": "observability"},
            "annotations": {"example.com/owner": "sre"},
            "finalizers": ["observability.io/finalizer", "example.com/cleanup"],
        },
        "spec": {
            "components": {
                "prometheus": {
                    "enabled": true,
                    "version": "2.45.0",
                    "replicas": 2,
                    "customConfig": {"scrape_interval": "30s"},
                    "remoteWrite": [{"url": "https://metrics.example.com/write", "remoteTimeout": "30s"}],
                },
            },
            "global": {"nodeSelector": {"disktype": "ssd"}},
            "backup": {"enabled": true, "schedule": "0 2 * * *", "retentionDays": 7},
        },
        "status": {"observedGeneration": 4},
    }))
}

fn beta_platform() -> VersionedResource {
    resource(json!({
        "apiVersion": "observability.io/v1beta1",
        "kind": "ObservabilityPlatform",
        "metadata": {"name": "staging", "namespace": "monitoring", "labels": {"team": "sre"}},
        "spec": {
            "components": {
                "prometheus": {"enabled": true, "version": "v2.48.0", "replicas": 1},
                "grafana": {"enabled": true, "version": "10.2.0", "replicas": 1, "plugins": ["grafana-piechart-panel"]},
            },
            "serviceMesh": {"enabled": true, "provider": "istio"},
            "security": {"tls": {"enabled": true}, "podSecurityPolicy": true, "networkPolicy": false},
        },
    }))
}

#[test]
fn prometheus_version_is_normalized_on_upgrade() {
    let converter = platform::converter().expect("built-in versions are valid");
    let input = resource(json!({
        "apiVersion": "observability.io/v1alpha1",
        "kind": "ObservabilityPlatform",
        "metadata": {"name": "prod", "namespace": "monitoring"},
        "spec": {"components": {"prometheus": {"enabled": true, "version": "2.45.0"}}},
    }));

    let outcome = converter
        .convert(&input, V1ALPHA1, V1BETA1)
        .expect("required fields are present");

    assert_eq!(outcome.resource.version(), V1BETA1);
    assert_eq!(
        outcome.resource.field(&path("spec.components.prometheus.version")),
        Some(&json!("v2.45.0"))
    );
    assert_eq!(outcome.resource.metadata.name.as_deref(), Some("prod"));
    assert_eq!(outcome.resource.metadata.namespace.as_deref(), Some("monitoring"));
}

#[test]
fn upgrade_and_downgrade_keep_identity_and_metadata() {
    let converter = platform::converter().expect("built-in versions are valid");
    let original = alpha_platform();

    let upgraded = converter
        .convert(&original, V1ALPHA1, V1BETA1)
        .expect("upgrade succeeds")
        .resource;
    assert_eq!(
        upgraded.field(&path("spec.components.prometheus.additionalScrapeConfigs")),
        Some(&json!(r#"{"scrape_interval":"30s"}"#))
    );
    assert_eq!(upgraded.field(&path("spec.nodeSelector.disktype")), Some(&json!("ssd")));
    assert_eq!(upgraded.field(&path("spec.backup.retention")), Some(&json!("7d")));
    assert_eq!(upgraded.field(&path("spec.security.tls.enabled")), Some(&json!(true)));

    let downgraded = converter
        .convert(&upgraded, V1BETA1, V1ALPHA1)
        .expect("downgrade succeeds");
    let round_tripped = downgraded.resource;

    assert_eq!(round_tripped.key(), original.key());
    assert_eq!(round_tripped.metadata.labels, original.metadata.labels);
    assert_eq!(round_tripped.metadata.finalizers, original.metadata.finalizers);
    assert_eq!(round_tripped.metadata.annotations, original.metadata.annotations);
    assert_eq!(round_tripped.data["status"], original.data["status"]);

    for field in [
        "spec.components.prometheus.customConfig",
        "spec.components.prometheus.remoteWrite",
        "spec.components.prometheus.replicas",
        "spec.global.nodeSelector",
        "spec.backup",
    ] {
        assert_eq!(
            round_tripped.field(&path(field)),
            original.field(&path(field)),
            "{field} changed"
        );
    }
    assert_eq!(
        round_tripped.field(&path("spec.components.prometheus.version")),
        Some(&json!("v2.45.0"))
    );
    assert_eq!(round_tripped.field(&path("spec.nodeSelector")), None);

    // The security settings only exist in v1beta1 and can not be preserved
    assert_eq!(round_tripped.field(&path("spec.security")), None);
    assert!(downgraded.warnings.iter().any(|warning| {
        warning.severity == Severity::Critical && warning.path == path("spec.security")
    }));
}

#[test]
fn fields_without_a_home_survive_a_downgrade() {
    let converter = platform::converter().expect("built-in versions are valid");
    let original = beta_platform();

    let downgraded = converter
        .convert(&original, V1BETA1, V1ALPHA1)
        .expect("downgrade succeeds");
    assert_eq!(downgraded.resource.field(&path("spec.serviceMesh")), None);
    assert!(
        downgraded
            .resource
            .metadata
            .annotations
            .as_ref()
            .is_some_and(|annotations| annotations.contains_key(PRESERVED_FIELDS_ANNOTATION))
    );

    let mut lost: Vec<_> = downgraded
        .warnings
        .iter()
        .map(|warning| (warning.path.to_string(), warning.severity))
        .collect();
    lost.sort();
    assert_eq!(lost, [
        (
            "spec.components.grafana.plugins".to_owned(),
            Severity::Warning
        ),
        ("spec.security".to_owned(), Severity::Critical),
        ("spec.serviceMesh".to_owned(), Severity::Warning),
    ]);

    let upgraded = converter
        .convert(&downgraded.resource, V1ALPHA1, V1BETA1)
        .expect("upgrade succeeds")
        .resource;

    assert_eq!(upgraded.field(&path("spec.serviceMesh")), original.field(&path("spec.serviceMesh")));
    assert_eq!(
        upgraded.field(&path("spec.components.grafana.plugins")),
        Some(&json!(["grafana-piechart-panel"]))
    );
    assert_eq!(upgraded.metadata.annotations, None);

    // Lost security settings fall back to the secure defaults
    assert_eq!(
        upgraded.field(&path("spec.security.networkPolicy")),
        Some(&json!(true))
    );
}

#[test]
fn preserved_fields_past_the_end_of_an_array_stay_parked() {
    let converter = platform::converter().expect("built-in versions are valid");
    let parked = r#"{"fields":[{"path":"spec.components.prometheus.remoteWrite[18446744073709551615]","value":{"url":"x"}}]}"#;
    let input = resource(json!({
        "apiVersion": "observability.io/v1alpha1",
        "kind": "ObservabilityPlatform",
        "metadata": {
            "name": "prod",
            "namespace": "monitoring",
            "annotations": {(PRESERVED_FIELDS_ANNOTATION): parked},
        },
        "spec": {"components": {"prometheus": {"enabled": true, "version": "2.45.0"}}},
    }));

    let converted = converter
        .convert(&input, V1ALPHA1, V1BETA1)
        .expect("out of range preserved fields do not fail the conversion")
        .resource;

    assert_eq!(
        converted.field(&path("spec.components.prometheus.remoteWrite")),
        None
    );
    assert!(
        converted
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(PRESERVED_FIELDS_ANNOTATION))
            .is_some_and(|payload| payload.contains("remoteWrite[18446744073709551615]"))
    );
}

#[test]
fn conversions_hop_through_intermediate_versions() {
    let schema = |name: &str| VersionSchema::new(name).with_field(&path("spec"), FieldInfo::new(FieldType::Object));
    let url = || FieldInfo::new(FieldType::String).required();

    let mut tracker = SchemaEvolutionTracker::new();
    for schema in [
        schema("v1alpha1").with_field(&path("spec.endpoint"), url()),
        schema("v1alpha2").with_field(&path("spec.url"), url()),
        schema("v1beta1")
            .with_field(&path("spec.target"), FieldInfo::new(FieldType::Object))
            .with_field(&path("spec.target.url"), url()),
    ] {
        tracker.register_version(schema).expect("versions are unique");
    }

    let mappings = MappingTable::new()
        .with_mappings("v1alpha1", "v1alpha2", [FieldMapping::rename(
            path("spec.endpoint"),
            path("spec.url"),
        )])
        .with_mappings("v1alpha2", "v1beta1", [FieldMapping::rename(
            path("spec.url"),
            path("spec.target.url"),
        )]);
    let converter = VersionConverter::new(Arc::new(tracker), Arc::new(mappings));

    let input = resource(json!({
        "apiVersion": "example.com/v1alpha1",
        "kind": "HealthCheck",
        "metadata": {"name": "healthz", "namespace": "default"},
        "spec": {"endpoint": "https://example.com/healthz"},
    }));
    let converted = converter
        .convert(&input, "v1alpha1", "v1beta1")
        .expect("every hop is mapped")
        .resource;

    assert_eq!(converted.api_version.to_string(), "example.com/v1beta1");
    assert_eq!(converted.data["spec"], json!({"target": {"url": "https://example.com/healthz"}}));

    let error = converter
        .convert(&input, "v1alpha1", "v2")
        .expect_err("v2 is not registered");
    assert!(matches!(error, convert::Error::ResolveVersions { .. }), "{error}");
}

#[test]
fn unit_conversions_between_versions() {
    let mappings = MappingTable::new().with_mappings(V1ALPHA1, V1BETA1, [FieldMapping::coerce(
        path("spec.retention"),
        Coercion::DaysToDuration,
    )]);

    let mut data = json!({"spec": {"retention": 30}});
    mappings
        .apply(V1ALPHA1, V1BETA1, &mut data)
        .expect("days are coercible");
    assert_eq!(data, json!({"spec": {"retention": "30d"}}));
}
