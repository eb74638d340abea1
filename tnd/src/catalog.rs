//! Parsing of the configured catalog into [`StreamConfig`]s.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::bail;
use crate::error::{ErrorKind, TndError, TndResult};
use crate::naming::{IdentifierSet, NamingRules};
use crate::sql::Dialect;
use crate::tnd_error;
use crate::types::{AirbyteType, ColumnId, StreamConfig, StreamId, SyncMode, TableRef};

/// Field whose non-null value marks a record as deleted at the source.
pub const DEFAULT_CDC_DELETION_FIELD: &str = "_ab_cdc_deleted_at";

/// Catalog document as written by the orchestrator.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfiguredCatalog {
    pub streams: Vec<ConfiguredStream>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfiguredStream {
    #[serde(default)]
    pub namespace: Option<String>,
    pub name: String,
    pub json_schema: Value,
    /// Key paths; only single-element paths are supported.
    #[serde(default)]
    pub primary_key: Vec<Vec<String>>,
    pub sync_mode: SyncMode,
    #[serde(default)]
    pub cdc_deletion_field: Option<String>,
}

/// A stream that could not be turned into a [`StreamConfig`].
#[derive(Debug, Clone)]
pub struct RejectedStream {
    /// `namespace.name` as declared.
    pub stream: String,
    pub error: TndError,
}

/// Result of parsing a catalog. Streams are rejected one by one so that a bad
/// declaration fails only its own stream.
#[derive(Debug, Clone, Default)]
pub struct ParsedCatalog {
    pub streams: Vec<StreamConfig>,
    pub rejected: Vec<RejectedStream>,
}

/// Resolves declared streams into destination identifiers for one dialect.
#[derive(Debug, Clone)]
pub struct CatalogParser {
    naming: NamingRules,
    raw_namespace: String,
    default_namespace: String,
}

impl CatalogParser {
    pub fn new(
        dialect: &Dialect,
        raw_namespace: impl Into<String>,
        default_namespace: impl Into<String>,
    ) -> Self {
        Self {
            naming: dialect.naming,
            raw_namespace: raw_namespace.into(),
            default_namespace: default_namespace.into(),
        }
    }

    /// Reads and parses the catalog file at `path`.
    pub async fn load(&self, path: &Path) -> TndResult<ParsedCatalog> {
        let contents = tokio::fs::read_to_string(path).await.map_err(|err| {
            tnd_error!(
                ErrorKind::ConfigError,
                "Catalog file could not be read",
                path.display(),
                source: err
            )
        })?;

        self.parse_str(&contents)
    }

    pub fn parse_str(&self, contents: &str) -> TndResult<ParsedCatalog> {
        let catalog: ConfiguredCatalog = serde_json::from_str(contents).map_err(|err| {
            tnd_error!(
                ErrorKind::ConfigError,
                "Catalog is not a valid configured catalog",
                source: err
            )
        })?;

        self.parse(catalog)
    }

    /// Resolves every stream of `catalog`. Streams are returned in declaration order.
    ///
    /// A (namespace, name) pair declared more than once rejects every one of its
    /// declarations with [`ErrorKind::ConflictingSchema`]. Table names are claimed
    /// per scope without regard to declaration order, so reordering the catalog
    /// never moves a stream to another table.
    ///
    /// Fails as a whole only when the raw namespace itself cannot be resolved.
    pub fn parse(&self, catalog: ConfiguredCatalog) -> TndResult<ParsedCatalog> {
        let raw_namespace = self.naming.resolve(&self.raw_namespace)?;

        let mut declarations: HashMap<(String, String), usize> = HashMap::new();
        let streams: Vec<(String, ConfiguredStream)> = catalog
            .streams
            .into_iter()
            .map(|stream| {
                let namespace = stream
                    .namespace
                    .clone()
                    .filter(|namespace| !namespace.trim().is_empty())
                    .unwrap_or_else(|| self.default_namespace.clone());
                *declarations
                    .entry((namespace.clone(), stream.name.clone()))
                    .or_default() += 1;
                (namespace, stream)
            })
            .collect();

        let mut resolved = Vec::with_capacity(streams.len());
        for (namespace, stream) in streams {
            let label = format!("{namespace}.{}", stream.name);
            let count = declarations
                .get(&(namespace.clone(), stream.name.clone()))
                .copied()
                .unwrap_or(1);
            let result = if count > 1 {
                Err(tnd_error!(
                    ErrorKind::ConflictingSchema,
                    "Stream is declared more than once",
                    format!("stream `{label}` appears {count} times in the catalog")
                ))
            } else {
                self.resolve_stream(stream, namespace)
            };
            resolved.push((label, result));
        }

        self.claim_tables(&mut resolved, &raw_namespace);

        let mut parsed = ParsedCatalog::default();
        for (label, result) in resolved {
            match result {
                Ok(config) => {
                    debug!(stream = %config.id, raw = %config.id.raw, "resolved stream");
                    parsed.streams.push(config);
                }
                Err(error) => parsed.rejected.push(RejectedStream {
                    stream: label,
                    error,
                }),
            }
        }

        Ok(parsed)
    }

    /// Resolves the columns, keys and final namespace of one stream. Table names
    /// are left empty until [`CatalogParser::claim_tables`].
    fn resolve_stream(&self, stream: ConfiguredStream, namespace: String) -> TndResult<StreamConfig> {
        let final_namespace = self.naming.resolve(&namespace)?;
        let columns = self.columns(&stream)?;
        let primary_key = primary_key(&stream, &columns)?;
        let cdc_deletion_column = cdc_deletion_column(&stream, &columns)?;

        Ok(StreamConfig {
            id: StreamId {
                original_namespace: namespace,
                original_name: stream.name,
                raw: TableRef::new(String::new(), String::new()),
                final_table: TableRef::new(final_namespace, String::new()),
            },
            sync_mode: stream.sync_mode,
            primary_key,
            cdc_deletion_column,
            columns,
        })
    }

    /// Claims final table names per final namespace and raw table names across the
    /// raw namespace, for the streams that resolved.
    fn claim_tables(
        &self,
        resolved: &mut [(String, TndResult<StreamConfig>)],
        raw_namespace: &str,
    ) {
        let mut scopes: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (index, (_, result)) in resolved.iter().enumerate() {
            if let Ok(config) = result {
                scopes
                    .entry(config.id.final_table.namespace.to_ascii_lowercase())
                    .or_default()
                    .push(index);
            }
        }

        for members in scopes.values() {
            let names: Vec<String> = members
                .iter()
                .filter_map(|&index| resolved[index].1.as_ref().ok())
                .map(|config| config.id.original_name.clone())
                .collect();
            let names: Vec<&str> = names.iter().map(String::as_str).collect();
            let claimed = IdentifierSet::new(self.naming).claim_all(&names);

            for (&index, name) in members.iter().zip(claimed) {
                assign(&mut resolved[index].1, name, |config, name| {
                    config.id.final_table.name = name;
                });
            }
        }

        let members: Vec<usize> = (0..resolved.len())
            .filter(|&index| resolved[index].1.is_ok())
            .collect();
        let names: Vec<String> = members
            .iter()
            .filter_map(|&index| resolved[index].1.as_ref().ok())
            .map(|config| {
                format!(
                    "{}_raw__stream_{}",
                    config.id.original_namespace, config.id.original_name
                )
            })
            .collect();
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        let claimed = IdentifierSet::new(self.naming).claim_all(&names);

        for (&index, name) in members.iter().zip(claimed) {
            assign(&mut resolved[index].1, name, |config, name| {
                config.id.raw = TableRef::new(raw_namespace, name);
            });
        }
    }

    fn columns(&self, stream: &ConfiguredStream) -> TndResult<Vec<(ColumnId, AirbyteType)>> {
        let properties = match stream.json_schema.get("properties") {
            None | Some(Value::Null) => return Ok(Vec::new()),
            Some(Value::Object(properties)) => properties,
            Some(_) => bail!(
                ErrorKind::InvalidSchema,
                "Stream schema properties are not an object",
                format!("stream `{}`", stream.name)
            ),
        };

        let mut names = IdentifierSet::for_columns(self.naming);
        properties
            .iter()
            .map(|(field, schema)| {
                let name = names.claim(field)?;
                Ok((
                    ColumnId::new(field.clone(), name),
                    AirbyteType::from_json_schema(schema),
                ))
            })
            .collect()
    }
}

/// Applies a claimed name to a resolved stream, or rejects the stream when the
/// claim failed.
fn assign(
    result: &mut TndResult<StreamConfig>,
    claimed: TndResult<String>,
    apply: impl FnOnce(&mut StreamConfig, String),
) {
    if result.is_err() {
        return;
    }

    match claimed {
        Ok(name) => {
            if let Ok(config) = result {
                apply(config, name);
            }
        }
        Err(error) => *result = Err(error),
    }
}

fn find_column(columns: &[(ColumnId, AirbyteType)], field: &str) -> Option<ColumnId> {
    columns
        .iter()
        .find(|(column, _)| column.original == field)
        .map(|(column, _)| column.clone())
}

fn primary_key(
    stream: &ConfiguredStream,
    columns: &[(ColumnId, AirbyteType)],
) -> TndResult<Vec<ColumnId>> {
    if stream.sync_mode != SyncMode::AppendDedup {
        return Ok(Vec::new());
    }

    if stream.primary_key.is_empty() {
        bail!(
            ErrorKind::InvalidSchema,
            "Deduplicated stream has no primary key",
            format!("stream `{}`", stream.name)
        );
    }

    stream
        .primary_key
        .iter()
        .map(|path| {
            let [field] = path.as_slice() else {
                bail!(
                    ErrorKind::InvalidSchema,
                    "Nested or empty primary key paths are not supported",
                    format!("stream `{}` declares key path {path:?}", stream.name)
                );
            };

            find_column(columns, field).ok_or_else(|| {
                tnd_error!(
                    ErrorKind::InvalidSchema,
                    "Primary key field is not declared",
                    format!("stream `{}` has no field `{field}`", stream.name)
                )
            })
        })
        .collect()
}

fn cdc_deletion_column(
    stream: &ConfiguredStream,
    columns: &[(ColumnId, AirbyteType)],
) -> TndResult<Option<ColumnId>> {
    match &stream.cdc_deletion_field {
        Some(field) => find_column(columns, field).map(Some).ok_or_else(|| {
            tnd_error!(
                ErrorKind::InvalidSchema,
                "Deletion marker field is not declared",
                format!("stream `{}` has no field `{field}`", stream.name)
            )
        }),
        None => Ok(find_column(columns, DEFAULT_CDC_DELETION_FIELD)),
    }
}
