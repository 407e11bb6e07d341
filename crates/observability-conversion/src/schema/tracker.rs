use indexmap::IndexMap;
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use tracing::instrument;

use super::{FieldChangeSet, FieldCompatibility, FieldLookup, VersionGraph, VersionSchema};
use crate::{
    api_version::{self, ParseApiVersionError, Version},
    path::FieldPath,
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum Error {
    #[snafu(display("version {version:?} is already registered"))]
    DuplicateVersion { version: String },

    #[snafu(display("invalid version name {version:?}"))]
    InvalidVersionName {
        source: ParseApiVersionError,
        version: String,
    },

    #[snafu(display("version {version:?} is not registered"))]
    UnknownVersion { version: String },

    #[snafu(display("no migration path from {from:?} to {to:?}"))]
    NoPathFound { from: String, to: String },
}

/// Registry of every known [`VersionSchema`].
///
/// Versions form a graph in which consecutively registered versions are
/// adjacent. Additional shortcut edges can be registered for version pairs
/// which have a direct converter. The tracker is filled once during startup
/// and only read afterwards, so it is usually shared as an `Arc` without any
/// locking.
#[derive(Clone, Debug, Default)]
pub struct SchemaEvolutionTracker {
    schemas: IndexMap<String, VersionSchema>,
    graph: VersionGraph,
}

impl SchemaEvolutionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    #[instrument(skip_all, fields(version = schema.name()))]
    pub fn register_version(&mut self, schema: VersionSchema) -> Result<()> {
        let version = schema.name().to_owned();
        let parsed = api_version::validate_version(&version).context(InvalidVersionNameSnafu {
            version: version.clone(),
        })?;
        ensure!(
            !self.schemas.contains_key(&version),
            DuplicateVersionSnafu { version }
        );

        self.graph.add_node(version.clone());
        if let Some(previous) = self.schemas.keys().last() {
            if previous.parse::<Version>().is_ok_and(|previous| previous > parsed) {
                tracing::warn!(
                    previous,
                    "registered a version older than its predecessor, downgrades are detected by registration order"
                );
            }
            self.graph.add_edge(previous, &version);
        }

        tracing::debug!(fields = schema.fields().count(), "registered version schema");
        self.schemas.insert(version, schema);
        Ok(())
    }

    /// Adds an edge between two registered, not necessarily consecutive,
    /// versions.
    pub fn register_direct_path(&mut self, from: &str, to: &str) -> Result<()> {
        self.schema(from)?;
        self.schema(to)?;
        self.graph.add_edge(from, to);
        Ok(())
    }

    pub fn schema(&self, version: &str) -> Result<&VersionSchema> {
        self.schemas
            .get(version)
            .context(UnknownVersionSnafu { version })
    }

    /// Registered version names, in registration order.
    pub fn versions(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }

    pub fn field_changes(&self, from: &str, to: &str) -> Result<FieldChangeSet> {
        Ok(FieldChangeSet::between(self.schema(from)?, self.schema(to)?))
    }

    /// Checks whether the field at `path` can be carried from `from` to `to`
    /// without an explicit mapping.
    pub fn is_field_compatible(
        &self,
        path: &FieldPath,
        from: &str,
        to: &str,
    ) -> Result<FieldCompatibility> {
        let source = self.schema(from)?;
        let target = self.schema(to)?;

        let compatibility = match (source.lookup(path), target.lookup(path)) {
            (FieldLookup::Declared(source_info), FieldLookup::Declared(target_info)) => source_info
                .field_type
                .compatibility_with(target_info.field_type),
            (FieldLookup::Undeclared, _) => FieldCompatibility::Incompatible {
                reason: format!("{path} is not part of {from}"),
            },
            (_, FieldLookup::Undeclared) => FieldCompatibility::Incompatible {
                reason: format!("{path} is not part of {to}"),
            },
            _ => FieldCompatibility::Compatible,
        };

        Ok(compatibility)
    }

    /// Returns the shortest chain of versions connecting `from` and `to`, both
    /// ends included.
    pub fn migration_path(&self, from: &str, to: &str) -> Result<Vec<String>> {
        self.graph
            .shortest_path(from, to)
            .context(NoPathFoundSnafu { from, to })
    }

    /// A conversion is a downgrade if the target was registered before the
    /// source.
    pub fn is_downgrade(&self, from: &str, to: &str) -> Result<bool> {
        let position = |version: &str| {
            self.schemas
                .get_index_of(version)
                .context(UnknownVersionSnafu { version })
        };
        Ok(position(to)? < position(from)?)
    }

    /// Returns the deprecated fields of `version` together with their
    /// deprecation notes.
    pub fn deprecated_fields(&self, version: &str) -> Result<Vec<(&str, &str)>> {
        Ok(self
            .schema(version)?
            .fields()
            .filter_map(|(key, info)| info.deprecated.as_deref().map(|note| (key, note)))
            .collect())
    }
}
