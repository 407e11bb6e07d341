//! The `ObservabilityPlatform` resource of the `observability.io` group.
//!
//! `v1alpha1` is the original version. `v1beta1` moved the node selector to
//! the top level of the spec, stores Prometheus scrape configs as a JSON
//! document, expresses the backup retention as a duration and added
//! security, service mesh and GitOps settings.
use std::sync::Arc;

use serde_json::json;
use snafu::{ResultExt, Snafu};

use crate::{
    convert::{Coercion, FieldMapping, MappingTable, VersionConverter},
    path::{FieldPath, ParsePathError},
    schema::{self, FieldDependency, FieldInfo, FieldType, SchemaEvolutionTracker, VersionSchema},
};

pub const API_GROUP: &str = "observability.io";
pub const KIND: &str = "ObservabilityPlatform";

pub const V1ALPHA1: &str = "v1alpha1";
pub const V1BETA1: &str = "v1beta1";

const COMPONENTS: &str = "spec.components";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to parse built-in field path {path:?}"))]
    ParsePath {
        source: ParsePathError,
        path: String,
    },

    #[snafu(display("failed to register built-in version"))]
    RegisterVersion { source: schema::Error },
}

type Fields = Vec<(String, FieldInfo)>;

fn parse(path: &str) -> Result<FieldPath, Error> {
    path.parse().context(ParsePathSnafu { path })
}

fn build_schema(name: &str, fields: Fields, dependencies: &[(&str, &str)]) -> Result<VersionSchema, Error> {
    let mut schema = VersionSchema::new(name);
    for (path, info) in fields {
        schema = schema.with_field(&parse(&path)?, info);
    }
    for (field, requires) in dependencies {
        schema = schema.with_dependency(FieldDependency::new(parse(field)?, parse(requires)?));
    }
    Ok(schema)
}

fn field(field_type: FieldType) -> FieldInfo {
    FieldInfo::new(field_type)
}

/// Fields every component has in every version.
fn component(name: &str, replicas: FieldInfo) -> Fields {
    let prefix = format!("{COMPONENTS}.{name}");
    vec![
        (prefix.clone(), field(FieldType::Object)),
        (format!("{prefix}.enabled"), field(FieldType::Boolean)),
        (format!("{prefix}.version"), field(FieldType::Version).required()),
        (format!("{prefix}.replicas"), replicas),
        (format!("{prefix}.resources"), field(FieldType::Map)),
    ]
}

fn storage(prefix: &str) -> Fields {
    vec![
        (format!("{prefix}.storage"), field(FieldType::Object)),
        (format!("{prefix}.storage.size"), field(FieldType::Quantity)),
        (format!("{prefix}.storage.storageClassName"), field(FieldType::String)),
    ]
}

fn remote_write(prefix: &str) -> Fields {
    vec![
        (format!("{prefix}.remoteWrite"), field(FieldType::Array)),
        (format!("{prefix}.remoteWrite[].url"), field(FieldType::String).required()),
        (format!("{prefix}.remoteWrite[].remoteTimeout"), field(FieldType::Duration)),
        (format!("{prefix}.remoteWrite[].headers"), field(FieldType::Map)),
    ]
}

fn grafana_ingress(prefix: &str) -> Fields {
    let ingress = format!("{prefix}.ingress");
    vec![
        (ingress.clone(), field(FieldType::Object)),
        (format!("{ingress}.enabled"), field(FieldType::Boolean)),
        (format!("{ingress}.className"), field(FieldType::String)),
        (format!("{ingress}.host"), field(FieldType::String).required()),
        (format!("{ingress}.path"), field(FieldType::String)),
        (format!("{ingress}.tls"), field(FieldType::Object)),
        (format!("{ingress}.tls.enabled"), field(FieldType::Boolean)),
        (format!("{ingress}.tls.secretName"), field(FieldType::String)),
        (format!("{ingress}.annotations"), field(FieldType::Map)),
    ]
}

fn data_sources(prefix: &str) -> Fields {
    let sources = format!("{prefix}.dataSources");
    vec![
        (sources.clone(), field(FieldType::Array)),
        (format!("{sources}[].name"), field(FieldType::String).required()),
        (format!("{sources}[].type"), field(FieldType::String).required()),
        (format!("{sources}[].url"), field(FieldType::String).required()),
        (format!("{sources}[].access"), field(FieldType::String)),
        (format!("{sources}[].isDefault"), field(FieldType::Boolean)),
        (format!("{sources}[].jsonData"), field(FieldType::Map)),
    ]
}

fn loki_s3(prefix: &str) -> Fields {
    let s3 = format!("{prefix}.s3");
    vec![
        (s3.clone(), field(FieldType::Object)),
        (format!("{s3}.enabled"), field(FieldType::Boolean)),
        (format!("{s3}.bucketName"), field(FieldType::String)),
        (format!("{s3}.region"), field(FieldType::String)),
        (format!("{s3}.endpoint"), field(FieldType::String)),
        (format!("{s3}.accessKeyId"), field(FieldType::String)),
        (format!("{s3}.secretAccessKey"), field(FieldType::String)),
    ]
}

fn alerting() -> Fields {
    vec![
        ("spec.alerting".to_owned(), field(FieldType::Object)),
        ("spec.alerting.alertmanager".to_owned(), field(FieldType::Object)),
        ("spec.alerting.alertmanager.enabled".to_owned(), field(FieldType::Boolean)),
        ("spec.alerting.alertmanager.replicas".to_owned(), field(FieldType::Integer)),
        ("spec.alerting.alertmanager.config".to_owned(), field(FieldType::String)),
        ("spec.alerting.rules".to_owned(), field(FieldType::Any)),
    ]
}

const DEPENDENCIES: &[(&str, &str)] = &[
    (
        "spec.alerting.alertmanager.enabled",
        "spec.components.prometheus.enabled",
    ),
    (
        "spec.components.grafana.ingress.tls.enabled",
        "spec.components.grafana.ingress.tls.secretName",
    ),
    (
        "spec.components.loki.s3.enabled",
        "spec.components.loki.s3.bucketName",
    ),
];

pub fn v1alpha1_schema() -> Result<VersionSchema, Error> {
    let prometheus = format!("{COMPONENTS}.prometheus");
    let grafana = format!("{COMPONENTS}.grafana");
    let loki = format!("{COMPONENTS}.loki");
    let tempo = format!("{COMPONENTS}.tempo");
    let collector = format!("{COMPONENTS}.opentelemetryCollector");

    let mut fields: Fields = vec![
        ("spec".to_owned(), field(FieldType::Object)),
        (COMPONENTS.to_owned(), field(FieldType::Object)),
        ("spec.paused".to_owned(), field(FieldType::Boolean)),
    ];

    fields.extend(component("prometheus", field(FieldType::Integer)));
    fields.extend(storage(&prometheus));
    fields.extend(remote_write(&prometheus));
    fields.extend([
        (format!("{prometheus}.retention"), field(FieldType::Duration)),
        (format!("{prometheus}.customConfig"), field(FieldType::Map)),
        (format!("{prometheus}.serviceMonitorSelector"), field(FieldType::Map)),
    ]);

    fields.extend(component("grafana", field(FieldType::Integer)));
    fields.extend(grafana_ingress(&grafana));
    fields.extend(data_sources(&grafana));
    fields.extend([
        (format!("{grafana}.adminPassword"), field(FieldType::String)),
        (
            format!("{grafana}.dashboards"),
            field(FieldType::Any).deprecated("provision dashboards through the Dashboard resource"),
        ),
    ]);

    fields.extend(component("loki", field(FieldType::Integer)));
    fields.extend(storage(&loki));
    fields.extend(loki_s3(&loki));
    fields.push((format!("{loki}.retention"), field(FieldType::Duration)));

    fields.extend(component("tempo", field(FieldType::Integer)));
    fields.extend(storage(&tempo));
    fields.push((format!("{tempo}.retention"), field(FieldType::Duration)));

    fields.extend(component("opentelemetryCollector", field(FieldType::Integer)));
    fields.push((format!("{collector}.config"), field(FieldType::String)));

    fields.extend([
        ("spec.global".to_owned(), field(FieldType::Object)),
        ("spec.global.externalLabels".to_owned(), field(FieldType::Map)),
        ("spec.global.logLevel".to_owned(), field(FieldType::String)),
        (
            "spec.global.nodeSelector".to_owned(),
            field(FieldType::Map).deprecated("moved to spec.nodeSelector in v1beta1"),
        ),
        ("spec.global.tolerations".to_owned(), field(FieldType::Any)),
        ("spec.global.securityContext".to_owned(), field(FieldType::Map)),
        ("spec.highAvailability".to_owned(), field(FieldType::Object)),
        ("spec.highAvailability.enabled".to_owned(), field(FieldType::Boolean)),
        ("spec.highAvailability.minReplicas".to_owned(), field(FieldType::Integer)),
        ("spec.backup".to_owned(), field(FieldType::Object)),
        ("spec.backup.enabled".to_owned(), field(FieldType::Boolean)),
        ("spec.backup.schedule".to_owned(), field(FieldType::String)),
        ("spec.backup.retentionDays".to_owned(), field(FieldType::Integer)),
        ("spec.backup.destination".to_owned(), field(FieldType::Map)),
    ]);
    fields.extend(alerting());

    build_schema(V1ALPHA1, fields, DEPENDENCIES)
}

pub fn v1beta1_schema() -> Result<VersionSchema, Error> {
    let prometheus = format!("{COMPONENTS}.prometheus");
    let grafana = format!("{COMPONENTS}.grafana");
    let loki = format!("{COMPONENTS}.loki");
    let tempo = format!("{COMPONENTS}.tempo");
    let collector = format!("{COMPONENTS}.opentelemetryCollector");
    let replicas = || {
        field(FieldType::Integer)
            .required()
            .with_default(json!(1))
            .default_on_downgrade()
    };

    let mut fields: Fields = vec![
        ("spec".to_owned(), field(FieldType::Object)),
        (COMPONENTS.to_owned(), field(FieldType::Object)),
        ("spec.paused".to_owned(), field(FieldType::Boolean)),
        ("spec.nodeSelector".to_owned(), field(FieldType::Map)),
        ("spec.gitOps".to_owned(), field(FieldType::Map)),
        ("spec.serviceMesh".to_owned(), field(FieldType::Map)),
    ];

    fields.extend(component("prometheus", replicas()));
    fields.extend(storage(&prometheus));
    fields.extend(remote_write(&prometheus));
    fields.extend([
        (format!("{prometheus}.retention"), field(FieldType::Duration)),
        (format!("{prometheus}.externalLabels"), field(FieldType::Map)),
        (format!("{prometheus}.additionalScrapeConfigs"), field(FieldType::String)),
        (format!("{prometheus}.serviceMonitorSelector"), field(FieldType::Map)),
    ]);

    fields.extend(component("grafana", replicas()));
    fields.extend(grafana_ingress(&grafana));
    fields.extend(data_sources(&grafana));
    fields.extend([
        (format!("{grafana}.adminUser"), field(FieldType::String)),
        (format!("{grafana}.adminPassword"), field(FieldType::String)),
        (format!("{grafana}.plugins"), field(FieldType::Any)),
        (format!("{grafana}.smtp"), field(FieldType::Map)),
    ]);

    fields.extend(component("loki", replicas()));
    fields.extend(storage(&loki));
    fields.extend(loki_s3(&loki));
    fields.extend([
        (format!("{loki}.retention"), field(FieldType::Duration)),
        (format!("{loki}.compactorEnabled"), field(FieldType::Boolean)),
    ]);

    fields.extend(component("tempo", replicas()));
    fields.extend(storage(&tempo));
    fields.extend([
        (format!("{tempo}.retention"), field(FieldType::Duration)),
        (format!("{tempo}.searchEnabled"), field(FieldType::Boolean)),
    ]);

    fields.extend(component("opentelemetryCollector", field(FieldType::Integer)));
    fields.push((format!("{collector}.config"), field(FieldType::String)));

    fields.extend([
        ("spec.global".to_owned(), field(FieldType::Object)),
        ("spec.global.externalLabels".to_owned(), field(FieldType::Map)),
        ("spec.global.logLevel".to_owned(), field(FieldType::String)),
        ("spec.global.tolerations".to_owned(), field(FieldType::Any)),
        ("spec.global.securityContext".to_owned(), field(FieldType::Map)),
        ("spec.global.affinity".to_owned(), field(FieldType::Map)),
        ("spec.global.imagePullSecrets".to_owned(), field(FieldType::Any)),
        ("spec.highAvailability".to_owned(), field(FieldType::Object)),
        ("spec.highAvailability.enabled".to_owned(), field(FieldType::Boolean)),
        ("spec.highAvailability.minReplicas".to_owned(), field(FieldType::Integer)),
        ("spec.highAvailability.antiAffinity".to_owned(), field(FieldType::Object)),
        ("spec.highAvailability.antiAffinity.type".to_owned(), field(FieldType::String)),
        ("spec.highAvailability.antiAffinity.topologyKey".to_owned(), field(FieldType::String)),
        ("spec.backup".to_owned(), field(FieldType::Object)),
        ("spec.backup.enabled".to_owned(), field(FieldType::Boolean)),
        ("spec.backup.schedule".to_owned(), field(FieldType::String)),
        ("spec.backup.retention".to_owned(), field(FieldType::Duration)),
        ("spec.backup.destination".to_owned(), field(FieldType::Map)),
        (
            "spec.security".to_owned(),
            field(FieldType::Object)
                .required()
                .unrecoverable()
                .with_default(json!({
                    "tls": {"enabled": true},
                    "podSecurityPolicy": true,
                    "networkPolicy": true,
                })),
        ),
        ("spec.security.tls".to_owned(), field(FieldType::Object)),
        ("spec.security.tls.enabled".to_owned(), field(FieldType::Boolean)),
        ("spec.security.podSecurityPolicy".to_owned(), field(FieldType::Boolean)),
        ("spec.security.networkPolicy".to_owned(), field(FieldType::Boolean)),
    ]);
    fields.extend(alerting());

    let mut dependencies = DEPENDENCIES.to_vec();
    dependencies.push(("spec.backup.enabled", "spec.backup.schedule"));
    build_schema(V1BETA1, fields, &dependencies)
}

/// Registers every built-in version, oldest first.
pub fn tracker() -> Result<SchemaEvolutionTracker, Error> {
    let mut tracker = SchemaEvolutionTracker::new();
    tracker
        .register_version(v1alpha1_schema()?)
        .context(RegisterVersionSnafu)?;
    tracker
        .register_version(v1beta1_schema()?)
        .context(RegisterVersionSnafu)?;
    Ok(tracker)
}

pub fn mappings() -> Result<MappingTable, Error> {
    let prometheus = format!("{COMPONENTS}.prometheus");
    let rename = |source: &str, target: &str| -> Result<FieldMapping, Error> {
        Ok(FieldMapping::rename(parse(source)?, parse(target)?))
    };

    let upgrade = [
        FieldMapping::coerce(
            parse(&format!("{prometheus}.version"))?,
            Coercion::EnsureVersionPrefix,
        ),
        rename(
            &format!("{prometheus}.customConfig"),
            &format!("{prometheus}.additionalScrapeConfigs"),
        )?
        .with_coercion(Coercion::MapToJsonString),
        rename("spec.global.nodeSelector", "spec.nodeSelector")?,
        rename("spec.backup.retentionDays", "spec.backup.retention")?
            .with_coercion(Coercion::DaysToDuration),
    ];

    let downgrade = [
        rename(
            &format!("{prometheus}.additionalScrapeConfigs"),
            &format!("{prometheus}.customConfig"),
        )?
        .with_coercion(Coercion::JsonStringToMap),
        rename("spec.nodeSelector", "spec.global.nodeSelector")?,
        rename("spec.backup.retention", "spec.backup.retentionDays")?
            .with_coercion(Coercion::DurationToDays),
    ];

    Ok(MappingTable::new()
        .with_mappings(V1ALPHA1, V1BETA1, upgrade)
        .with_mappings(V1BETA1, V1ALPHA1, downgrade))
}

/// A converter for all built-in versions with the default preservation
/// policy and its own conversion counters.
pub fn converter() -> Result<VersionConverter, Error> {
    Ok(VersionConverter::new(
        Arc::new(tracker()?),
        Arc::new(mappings()?),
    ))
}
