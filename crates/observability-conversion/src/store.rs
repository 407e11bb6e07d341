//! The resource store consumed by bulk migrations.
use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use snafu::{OptionExt, Snafu, ensure};
use tokio::sync::RwLock;

use crate::resource::{ResourceKey, VersionedResource};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum Error {
    #[snafu(display("resource {key} does not exist"))]
    NotFound { key: ResourceKey },

    #[snafu(display("resource {key} already exists"))]
    AlreadyExists { key: ResourceKey },

    #[snafu(display(
        "resource {key} was modified concurrently, expected resourceVersion {expected:?}, found {actual:?}"
    ))]
    Conflict {
        key: ResourceKey,
        expected: String,
        actual: String,
    },

    #[snafu(display("the resource store is unavailable: {message}"))]
    Unavailable { message: String },

    #[snafu(display("resource {key} is stored as {stored:?}, not as {requested:?}"))]
    VersionNotServed {
        key: ResourceKey,
        stored: String,
        requested: String,
    },
}

impl Error {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Unavailable { .. })
    }
}

/// Storage of [`VersionedResource`]s, usually backed by the Kubernetes API
/// server.
///
/// Updating the `status` is a separate operation, [`ResourceStore::update`]
/// leaves the stored status untouched.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get(&self, key: &ResourceKey, version: &str) -> Result<VersionedResource>;

    /// Lists all resources of `kind`, optionally limited to one namespace.
    async fn list(
        &self,
        kind: &str,
        namespace: Option<&str>,
        version: &str,
    ) -> Result<Vec<VersionedResource>>;

    async fn create(&self, resource: VersionedResource) -> Result<VersionedResource>;

    async fn update(&self, resource: VersionedResource) -> Result<VersionedResource>;

    async fn delete(&self, key: &ResourceKey) -> Result<()>;

    async fn update_status(&self, key: &ResourceKey, status: Value) -> Result<VersionedResource>;
}

/// A [`ResourceStore`] keeping every resource in memory, in the version it
/// was last written with.
///
/// Writes bump `metadata.resourceVersion`. An update carrying a
/// `resourceVersion` fails with [`Error::Conflict`] unless it matches the
/// stored one.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    resources: RwLock<BTreeMap<ResourceKey, VersionedResource>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with_resources(resources: impl IntoIterator<Item = VersionedResource>) -> Self {
        let store = Self::new();
        {
            let mut stored = store.resources.write().await;
            for mut resource in resources {
                resource.metadata.resource_version = Some("1".to_owned());
                stored.insert(resource.key(), resource);
            }
        }
        store
    }

    pub async fn len(&self) -> usize {
        self.resources.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.resources.read().await.is_empty()
    }
}

fn next_resource_version(current: Option<&str>) -> String {
    let current = current.and_then(|version| version.parse::<u64>().ok()).unwrap_or(0);
    (current + 1).to_string()
}

#[async_trait]
impl ResourceStore for InMemoryStore {
    async fn get(&self, key: &ResourceKey, version: &str) -> Result<VersionedResource> {
        let resources = self.resources.read().await;
        let resource = resources
            .get(key)
            .context(NotFoundSnafu { key: key.clone() })?;

        ensure!(resource.version() == version, VersionNotServedSnafu {
            key: key.clone(),
            stored: resource.version(),
            requested: version,
        });
        Ok(resource.clone())
    }

    async fn list(
        &self,
        kind: &str,
        namespace: Option<&str>,
        version: &str,
    ) -> Result<Vec<VersionedResource>> {
        let resources = self.resources.read().await;
        Ok(resources
            .values()
            .filter(|resource| resource.kind == kind && resource.version() == version)
            .filter(|resource| {
                namespace.is_none_or(|namespace| {
                    resource.metadata.namespace.as_deref() == Some(namespace)
                })
            })
            .cloned()
            .collect())
    }

    async fn create(&self, mut resource: VersionedResource) -> Result<VersionedResource> {
        let key = resource.key();
        let mut resources = self.resources.write().await;
        ensure!(!resources.contains_key(&key), AlreadyExistsSnafu { key });

        resource.metadata.resource_version = Some(next_resource_version(None));
        resource.metadata.generation = Some(1);
        resources.insert(key, resource.clone());
        Ok(resource)
    }

    async fn update(&self, mut resource: VersionedResource) -> Result<VersionedResource> {
        let key = resource.key();
        let mut resources = self.resources.write().await;
        let stored = resources
            .get_mut(&key)
            .context(NotFoundSnafu { key: key.clone() })?;

        let actual = stored.metadata.resource_version.clone().unwrap_or_default();
        if let Some(expected) = &resource.metadata.resource_version {
            ensure!(*expected == actual, ConflictSnafu {
                key,
                expected: expected.clone(),
                actual,
            });
        }

        let generation = stored.metadata.generation.unwrap_or(1);
        resource.metadata.generation = Some(if stored.spec() == resource.spec() {
            generation
        } else {
            generation + 1
        });
        resource.metadata.resource_version = Some(next_resource_version(Some(&actual)));

        match stored.data.get("status") {
            Some(status) => resource.data["status"] = status.clone(),
            None => {
                if let Some(data) = resource.data.as_object_mut() {
                    data.remove("status");
                }
            }
        }

        *stored = resource.clone();
        Ok(resource)
    }

    async fn delete(&self, key: &ResourceKey) -> Result<()> {
        self.resources
            .write()
            .await
            .remove(key)
            .map(|_| ())
            .context(NotFoundSnafu { key: key.clone() })
    }

    async fn update_status(&self, key: &ResourceKey, status: Value) -> Result<VersionedResource> {
        let mut resources = self.resources.write().await;
        let stored = resources
            .get_mut(key)
            .context(NotFoundSnafu { key: key.clone() })?;

        stored.data["status"] = status;
        stored.metadata.resource_version = Some(next_resource_version(
            stored.metadata.resource_version.as_deref(),
        ));
        Ok(stored.clone())
    }
}
