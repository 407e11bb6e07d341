//! Strategy selection and result caching on top of the [`VersionConverter`].
use std::{
    collections::HashMap,
    fmt::Write,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use snafu::{ResultExt, Snafu};
use tokio::time::Instant;
use tracing::instrument;

use crate::{
    convert::{self, ConversionOutcome, VersionConverter},
    path::{self, FieldPath},
    resource::{ResourceKey, VersionedResource},
};

const FIELD_WEIGHT: f64 = 1.0;
const METADATA_ENTRY_WEIGHT: f64 = 0.5;
const ARRAY_ELEMENT_WEIGHT: f64 = 2.0;
const KIB_WEIGHT: f64 = 4.0;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to convert resource"))]
    Convert { source: convert::Error },

    #[snafu(display("failed to join blocking conversion task"))]
    BlockingTask { source: tokio::task::JoinError },
}

impl Error {
    /// The underlying conversion error, if the conversion itself failed.
    pub fn conversion_error(&self) -> Option<&convert::Error> {
        match self {
            Self::Convert { source } => Some(source),
            Self::BlockingTask { .. } => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Strategy {
    /// Convert inline on the calling task.
    Direct,

    /// Convert on the blocking thread pool to keep large conversions off the
    /// async workers.
    Optimized,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplexityFactors {
    pub field_count: usize,
    pub label_count: usize,
    pub annotation_count: usize,
    pub array_elements: usize,
    pub serialized_bytes: usize,
}

impl ComplexityFactors {
    pub fn of(resource: &VersionedResource) -> Self {
        let spec = resource.spec().unwrap_or(&Value::Null);
        let serialized_bytes = serde_json::to_vec(&resource.data).map_or(0, |bytes| bytes.len())
            + serde_json::to_vec(&resource.metadata).map_or(0, |bytes| bytes.len());

        Self {
            field_count: path::flatten(spec, &FieldPath::root("spec")).len(),
            label_count: resource.metadata.labels.as_ref().map_or(0, |labels| labels.len()),
            annotation_count: resource
                .metadata
                .annotations
                .as_ref()
                .map_or(0, |annotations| annotations.len()),
            array_elements: count_array_elements(spec),
            serialized_bytes,
        }
    }

    pub fn score(&self) -> f64 {
        self.field_count as f64 * FIELD_WEIGHT
            + (self.label_count + self.annotation_count) as f64 * METADATA_ENTRY_WEIGHT
            + self.array_elements as f64 * ARRAY_ELEMENT_WEIGHT
            + self.serialized_bytes as f64 / 1024.0 * KIB_WEIGHT
    }

    fn add(&mut self, other: &Self) {
        self.field_count += other.field_count;
        self.label_count += other.label_count;
        self.annotation_count += other.annotation_count;
        self.array_elements += other.array_elements;
        self.serialized_bytes += other.serialized_bytes;
    }
}

fn count_array_elements(value: &Value) -> usize {
    match value {
        Value::Array(items) => items.len() + items.iter().map(count_array_elements).sum::<usize>(),
        Value::Object(object) => object.values().map(count_array_elements).sum(),
        _ => 0,
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct ComplexityAnalysis {
    pub score: f64,
    pub factors: ComplexityFactors,
}

/// Sums up the complexity of all `resources`.
pub fn analyze_complexity<'a>(
    resources: impl IntoIterator<Item = &'a VersionedResource>,
) -> ComplexityAnalysis {
    let mut factors = ComplexityFactors::default();
    let mut score = 0.0;
    for resource in resources {
        let own = ComplexityFactors::of(resource);
        score += own.score();
        factors.add(&own);
    }

    ComplexityAnalysis { score, factors }
}

#[derive(Clone, Debug, PartialEq)]
pub struct OptimizerConfig {
    /// Resources scoring above this threshold use [`Strategy::Optimized`].
    pub complexity_threshold: f64,
    pub cache_enabled: bool,
    pub cache_ttl: Duration,
    pub max_cache_entries: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            complexity_threshold: 100.0,
            cache_enabled: true,
            cache_ttl: Duration::from_secs(5 * 60),
            max_cache_entries: 1000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub resource: ResourceKey,
    pub from: String,
    pub to: String,
}

impl CacheKey {
    pub fn new(resource: ResourceKey, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            resource,
            from: from.into(),
            to: to.into(),
        }
    }
}

#[derive(Debug)]
struct CacheEntry {
    /// SHA-256 of the input. Entries stored without one are only returned by
    /// lookups which do not check the input.
    fingerprint: Option<String>,
    outcome: ConversionOutcome,
    inserted: Instant,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// A TTL cache of conversion results. Expired entries are evicted lazily on
/// lookup, or by [`ConversionCache::purge_expired`].
#[derive(Debug)]
pub struct ConversionCache {
    ttl: Duration,
    max_entries: usize,
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ConversionCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries,
            entries: Mutex::default(),
            hits: AtomicU64::default(),
            misses: AtomicU64::default(),
        }
    }

    pub fn get(&self, key: &CacheKey, fingerprint: Option<&str>) -> Option<ConversionOutcome> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        let expired = entries
            .get(key)
            .is_some_and(|entry| entry.inserted.elapsed() >= self.ttl);
        if expired {
            entries.remove(key);
        }

        let found = entries
            .get(key)
            .filter(|entry| {
                fingerprint.is_none_or(|fingerprint| entry.fingerprint.as_deref() == Some(fingerprint))
            })
            .map(|entry| entry.outcome.clone());

        let counter = if found.is_some() {
            &self.hits
        } else {
            &self.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Stores `outcome`, evicting the oldest entry if the cache is full.
    pub fn insert(&self, key: CacheKey, fingerprint: Option<String>, outcome: ConversionOutcome) {
        if self.max_entries == 0 {
            return;
        }

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if !entries.contains_key(&key) && entries.len() >= self.max_entries {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.inserted)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
            }
        }

        entries.insert(key, CacheEntry {
            fingerprint,
            outcome,
            inserted: Instant::now(),
        });
    }

    /// Removes every expired entry and returns how many there were.
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| entry.inserted.elapsed() < self.ttl);
        before - entries.len()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.lock().unwrap_or_else(PoisonError::into_inner).len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// SHA-256 over everything a conversion reads from `resource`.
pub fn fingerprint(resource: &VersionedResource) -> String {
    let mut hasher = Sha256::new();
    hasher.update(resource.api_version.to_string());
    hasher.update(&resource.kind);
    if let Ok(metadata) = serde_json::to_vec(&resource.metadata) {
        hasher.update(metadata);
    }
    if let Ok(data) = serde_json::to_vec(&resource.data) {
        hasher.update(data);
    }

    hasher
        .finalize()
        .iter()
        .fold(String::with_capacity(64), |mut hex, byte| {
            // Writing into a String can not fail
            let _ = write!(hex, "{byte:02x}");
            hex
        })
}

/// Wraps a [`VersionConverter`] with strategy selection and a result cache.
#[derive(Debug)]
pub struct ConversionOptimizer {
    converter: Arc<VersionConverter>,
    config: OptimizerConfig,
    cache: ConversionCache,
}

impl ConversionOptimizer {
    pub fn new(converter: Arc<VersionConverter>, config: OptimizerConfig) -> Self {
        let cache = ConversionCache::new(config.cache_ttl, config.max_cache_entries);
        Self {
            converter,
            config,
            cache,
        }
    }

    pub fn converter(&self) -> &VersionConverter {
        &self.converter
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Multiplies the complexity score of `resource` with the number of
    /// conversion steps between `from` and `to` and compares it with the
    /// configured threshold.
    pub fn select_strategy(&self, resource: &VersionedResource, from: &str, to: &str) -> Strategy {
        let hops = self
            .converter
            .tracker()
            .migration_path(from, to)
            .map_or(1, |path| path.len().saturating_sub(1).max(1));
        let score = ComplexityFactors::of(resource).score() * hops as f64;

        if score > self.config.complexity_threshold {
            Strategy::Optimized
        } else {
            Strategy::Direct
        }
    }

    /// Returns the cached conversion of the resource identified by `key`,
    /// regardless of the input it was computed from.
    pub fn cached_result(&self, key: &ResourceKey, from: &str, to: &str) -> Option<VersionedResource> {
        if !self.config.cache_enabled {
            return None;
        }

        self.cache
            .get(&CacheKey::new(key.clone(), from, to), None)
            .map(|outcome| outcome.resource)
    }

    pub fn cache_result(&self, key: &ResourceKey, from: &str, to: &str, resource: VersionedResource) {
        if !self.config.cache_enabled {
            return;
        }

        let outcome = ConversionOutcome {
            resource,
            warnings: Vec::new(),
            truncated: false,
        };
        self.cache
            .insert(CacheKey::new(key.clone(), from, to), None, outcome);
    }

    pub fn purge_expired(&self) -> usize {
        self.cache.purge_expired()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Converts `resource`, serving unchanged inputs from the cache.
    #[instrument(
        skip(self, resource),
        fields(
            k8s.resource.name = resource.metadata.name.as_deref(),
            k8s.resource.namespace = resource.metadata.namespace.as_deref(),
        )
    )]
    pub async fn convert(
        &self,
        resource: VersionedResource,
        from: &str,
        to: &str,
    ) -> Result<ConversionOutcome, Error> {
        let key = CacheKey::new(resource.key(), from, to);
        let fingerprint = self.config.cache_enabled.then(|| fingerprint(&resource));

        if let Some(fingerprint) = &fingerprint {
            if let Some(outcome) = self.cache.get(&key, Some(fingerprint)) {
                tracing::debug!("serving conversion from cache");
                return Ok(outcome);
            }
        }

        let strategy = self.select_strategy(&resource, from, to);
        tracing::debug!(?strategy, "selected conversion strategy");

        let outcome = match strategy {
            Strategy::Direct => self
                .converter
                .convert(&resource, from, to)
                .context(ConvertSnafu)?,
            Strategy::Optimized => {
                let converter = Arc::clone(&self.converter);
                let (from, to) = (from.to_owned(), to.to_owned());
                tokio::task::spawn_blocking(move || converter.convert(&resource, &from, &to))
                    .await
                    .context(BlockingTaskSnafu)?
                    .context(ConvertSnafu)?
            }
        };

        if fingerprint.is_some() {
            self.cache.insert(key, fingerprint, outcome.clone());
        }
        Ok(outcome)
    }
}
