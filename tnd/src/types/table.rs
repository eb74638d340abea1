/// A column as the destination reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDefinition {
    pub name: String,
    /// Type name from `information_schema`, lowercased.
    pub data_type: String,
}

impl ColumnDefinition {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into().to_lowercase(),
        }
    }
}

/// Columns of an existing table, in ordinal order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableDefinition {
    pub columns: Vec<ColumnDefinition>,
}

impl TableDefinition {
    pub fn column(&self, name: &str) -> Option<&ColumnDefinition> {
        self.columns
            .iter()
            .find(|column| column.name.eq_ignore_ascii_case(name))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }
}

/// What already exists in the destination for one stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExistingTables {
    /// `None` when the final table does not exist.
    pub final_table: Option<TableDefinition>,
    pub raw_table_exists: bool,
    pub legacy_raw_table_exists: bool,
}
