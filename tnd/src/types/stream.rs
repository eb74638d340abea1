use std::fmt;

use serde::{Deserialize, Serialize};

use crate::naming::NamingRules;
use crate::types::AirbyteType;

/// Fully qualified, unquoted table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableRef {
    pub namespace: String,
    pub name: String,
}

impl TableRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Same namespace, name with `suffix` appended and shortened to the naming rules.
    pub fn with_suffix(&self, suffix: &str, rules: &NamingRules) -> Self {
        Self::new(self.namespace.clone(), rules.with_suffix(&self.name, suffix))
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.name)
    }
}

/// Identity of one stream and the tables derived from it.
///
/// Computed once per sync attempt by the catalog parser; the derived names are
/// already resolved for the destination dialect.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamId {
    /// Namespace as declared by the source, after defaulting.
    pub original_namespace: String,
    pub original_name: String,
    pub raw: TableRef,
    pub final_table: TableRef,
}

impl StreamId {
    /// Name of the raw table written by previous destination generations.
    pub fn legacy_raw(&self) -> TableRef {
        TableRef::new(
            self.final_table.namespace.clone(),
            format!("_airbyte_raw_{}", self.final_table.name),
        )
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.original_namespace, self.original_name)
    }
}

/// A declared field and the identifier of its column.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnId {
    /// Field name as declared, used for JSON extraction and error entries.
    pub original: String,
    /// Unquoted column name in the destination.
    pub name: String,
}

impl ColumnId {
    pub fn new(original: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            original: original.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ColumnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// How raw records reach the final table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Every record becomes a row.
    Append,
    /// One row per primary key, the most recently extracted one.
    #[serde(alias = "dedup", alias = "append_dedup")]
    AppendDedup,
    /// The final table is rebuilt from the raw table on every sync.
    Overwrite,
}

/// Everything the generator needs to know about one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub id: StreamId,
    pub sync_mode: SyncMode,
    /// Empty unless `sync_mode` is [`SyncMode::AppendDedup`].
    pub primary_key: Vec<ColumnId>,
    pub cdc_deletion_column: Option<ColumnId>,
    /// Declared fields in declaration order.
    pub columns: Vec<(ColumnId, AirbyteType)>,
}

impl StreamConfig {
    pub fn is_dedup(&self) -> bool {
        self.sync_mode == SyncMode::AppendDedup && !self.primary_key.is_empty()
    }

    pub fn column_type(&self, column: &ColumnId) -> Option<&AirbyteType> {
        self.columns
            .iter()
            .find(|(id, _)| id == column)
            .map(|(_, ty)| ty)
    }
}

/// The table readers see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveTable(pub TableRef);

/// The table a rebuild writes into before it is swapped in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingTable {
    /// The table this one replaces.
    pub live: LiveTable,
    pub table: TableRef,
    pub suffix: &'static str,
}

impl StagingTable {
    /// Suffix used when a soft reset rebuilds the final table.
    pub const SOFT_RESET_SUFFIX: &'static str = "_ab_soft_reset";
    /// Suffix used when an overwrite sync rebuilds the final table.
    pub const OVERWRITE_SUFFIX: &'static str = "_airbyte_tmp";

    pub fn for_stream(id: &StreamId, suffix: &'static str, rules: &NamingRules) -> Self {
        Self {
            live: LiveTable(id.final_table.clone()),
            table: id.final_table.with_suffix(suffix, rules),
            suffix,
        }
    }
}
