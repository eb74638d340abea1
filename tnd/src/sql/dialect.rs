//! Capabilities and type tables of the supported SQL dialects.

use chrono::{DateTime, SecondsFormat, Utc};
use config::shared::DialectKind;

use crate::naming::{IdentifierCase, NamingRules};
use crate::types::{AirbyteType, PrimitiveKind, TableRef};

/// A column type: the DDL spelling and the name `information_schema` reports for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialectType {
    pub ddl: &'static str,
    pub reported: &'static str,
}

const fn ty(ddl: &'static str, reported: &'static str) -> DialectType {
    DialectType { ddl, reported }
}

/// How fields are read out of the raw JSON document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonSyntax {
    /// `jsonb` operators `->` and `->>`.
    Postgres,
    /// `VARIANT` path access and `TYPEOF`.
    Snowflake,
    /// `JSON_QUERY` / `JSON_VALUE` and `JSON_TYPE`.
    BigQuery,
}

/// How a cast that must not fail is spelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafeCastStyle {
    /// A session-scoped plpgsql helper swallowing cast exceptions.
    PgTempFunction,
    TryCast,
    SafeCast,
}

/// How a rebuilt staging table replaces the live table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableSwap {
    /// `DROP` the live table and `RENAME` the staging table, inside one transaction.
    DropAndRename,
    /// `ALTER TABLE … SWAP WITH`, then drop the old contents.
    SwapWith,
    /// `CREATE OR REPLACE TABLE … COPY`, then drop the staging table.
    CreateOrReplaceCopy,
}

/// Column types per declared type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeTable {
    pub string: DialectType,
    pub integer: DialectType,
    pub number: DialectType,
    pub boolean: DialectType,
    pub date: DialectType,
    pub time_with_timezone: DialectType,
    pub time_without_timezone: DialectType,
    pub timestamp_with_timezone: DialectType,
    pub timestamp_without_timezone: DialectType,
    pub structure: DialectType,
    pub array: DialectType,
    /// Untyped JSON documents, including unresolvable unions.
    pub document: DialectType,
    /// `_airbyte_raw_id`.
    pub raw_id: DialectType,
}

impl TypeTable {
    pub fn primitive(&self, kind: PrimitiveKind) -> DialectType {
        match kind {
            PrimitiveKind::String => self.string,
            PrimitiveKind::Integer => self.integer,
            PrimitiveKind::Number => self.number,
            PrimitiveKind::Boolean => self.boolean,
            PrimitiveKind::Date => self.date,
            PrimitiveKind::TimeWithTimezone => self.time_with_timezone,
            PrimitiveKind::TimeWithoutTimezone => self.time_without_timezone,
            PrimitiveKind::TimestampWithTimezone => self.timestamp_with_timezone,
            PrimitiveKind::TimestampWithoutTimezone => self.timestamp_without_timezone,
            PrimitiveKind::Unknown => self.document,
        }
    }
}

/// Everything the generator needs to know about a destination's SQL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dialect {
    pub kind: DialectKind,
    pub quote: char,
    pub naming: NamingRules,
    pub types: TypeTable,
    pub json: JsonSyntax,
    pub safe_cast: SafeCastStyle,
    pub window_functions: bool,
    /// Whether DDL can run inside a transaction together with DML.
    pub transactional_ddl: bool,
    pub table_swap: TableSwap,
}

impl Dialect {
    pub fn postgres() -> Self {
        Self {
            kind: DialectKind::Postgres,
            quote: '"',
            naming: NamingRules {
                max_length: 63,
                case: IdentifierCase::Lower,
                allow_leading_digit: false,
            },
            types: TypeTable {
                string: ty("varchar", "character varying"),
                integer: ty("bigint", "bigint"),
                number: ty("numeric", "numeric"),
                boolean: ty("boolean", "boolean"),
                date: ty("date", "date"),
                time_with_timezone: ty("time with time zone", "time with time zone"),
                time_without_timezone: ty("time", "time without time zone"),
                timestamp_with_timezone: ty(
                    "timestamp with time zone",
                    "timestamp with time zone",
                ),
                timestamp_without_timezone: ty("timestamp", "timestamp without time zone"),
                structure: ty("jsonb", "jsonb"),
                array: ty("jsonb", "jsonb"),
                document: ty("jsonb", "jsonb"),
                raw_id: ty("varchar", "character varying"),
            },
            json: JsonSyntax::Postgres,
            safe_cast: SafeCastStyle::PgTempFunction,
            window_functions: true,
            transactional_ddl: true,
            table_swap: TableSwap::DropAndRename,
        }
    }

    pub fn snowflake() -> Self {
        Self {
            kind: DialectKind::Snowflake,
            quote: '"',
            naming: NamingRules {
                max_length: 255,
                case: IdentifierCase::Upper,
                allow_leading_digit: false,
            },
            types: TypeTable {
                string: ty("TEXT", "text"),
                integer: ty("NUMBER", "number"),
                number: ty("FLOAT", "float"),
                boolean: ty("BOOLEAN", "boolean"),
                date: ty("DATE", "date"),
                time_with_timezone: ty("TEXT", "text"),
                time_without_timezone: ty("TIME", "time"),
                timestamp_with_timezone: ty("TIMESTAMP_TZ", "timestamp_tz"),
                timestamp_without_timezone: ty("TIMESTAMP_NTZ", "timestamp_ntz"),
                structure: ty("OBJECT", "object"),
                array: ty("ARRAY", "array"),
                document: ty("VARIANT", "variant"),
                raw_id: ty("VARCHAR", "text"),
            },
            json: JsonSyntax::Snowflake,
            safe_cast: SafeCastStyle::TryCast,
            window_functions: true,
            transactional_ddl: false,
            table_swap: TableSwap::SwapWith,
        }
    }

    pub fn bigquery() -> Self {
        Self {
            kind: DialectKind::Bigquery,
            quote: '`',
            naming: NamingRules {
                max_length: 300,
                case: IdentifierCase::Preserve,
                allow_leading_digit: true,
            },
            types: TypeTable {
                string: ty("STRING", "string"),
                integer: ty("INT64", "int64"),
                number: ty("NUMERIC", "numeric"),
                boolean: ty("BOOL", "bool"),
                date: ty("DATE", "date"),
                time_with_timezone: ty("STRING", "string"),
                time_without_timezone: ty("TIME", "time"),
                timestamp_with_timezone: ty("TIMESTAMP", "timestamp"),
                timestamp_without_timezone: ty("DATETIME", "datetime"),
                structure: ty("JSON", "json"),
                array: ty("JSON", "json"),
                document: ty("JSON", "json"),
                raw_id: ty("STRING", "string"),
            },
            json: JsonSyntax::BigQuery,
            safe_cast: SafeCastStyle::SafeCast,
            window_functions: true,
            transactional_ddl: false,
            table_swap: TableSwap::CreateOrReplaceCopy,
        }
    }

    pub fn for_kind(kind: DialectKind) -> Self {
        match kind {
            DialectKind::Postgres => Self::postgres(),
            DialectKind::Snowflake => Self::snowflake(),
            DialectKind::Bigquery => Self::bigquery(),
        }
    }

    /// Column type of a declared field. Total: unions are narrowed first.
    pub fn type_for(&self, airbyte_type: &AirbyteType) -> DialectType {
        match airbyte_type.choose() {
            AirbyteType::Primitive(kind) => self.types.primitive(kind),
            AirbyteType::Struct(_) => self.types.structure,
            AirbyteType::Array(_) => self.types.array,
            AirbyteType::Union(_) | AirbyteType::UnsupportedOneOf => self.types.document,
        }
    }

    /// Whether a scalar of `kind` is stored as plain text in this dialect.
    pub fn stores_as_text(&self, kind: PrimitiveKind) -> bool {
        kind == PrimitiveKind::String || self.types.primitive(kind).ddl == self.types.string.ddl
    }

    /// Quotes an identifier, doubling embedded quote characters.
    pub fn quote(&self, identifier: &str) -> String {
        let escaped = identifier.replace(self.quote, &format!("{0}{0}", self.quote));
        format!("{0}{escaped}{0}", self.quote)
    }

    pub fn table(&self, table: &TableRef) -> String {
        format!("{}.{}", self.quote(&table.namespace), self.quote(&table.name))
    }

    /// A string literal.
    pub fn literal(&self, value: &str) -> String {
        match self.json {
            JsonSyntax::Postgres => pg_escape::quote_literal(value).to_string(),
            JsonSyntax::Snowflake | JsonSyntax::BigQuery => {
                let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
                format!("'{escaped}'")
            }
        }
    }

    /// A timestamp-with-time-zone literal with microsecond precision.
    pub fn timestamp_literal(&self, ts: DateTime<Utc>) -> String {
        let text = ts.to_rfc3339_opts(SecondsFormat::Micros, true);
        match self.kind {
            DialectKind::Postgres => format!("'{text}'::timestamp with time zone"),
            DialectKind::Snowflake => format!("'{text}'::TIMESTAMP_TZ"),
            DialectKind::Bigquery => format!("TIMESTAMP '{text}'"),
        }
    }

    /// `expr` shifted one second into the past.
    pub fn minus_one_second(&self, expr: &str) -> String {
        match self.kind {
            DialectKind::Postgres => format!("({expr}) - interval '1 second'"),
            DialectKind::Snowflake => format!("DATEADD(second, -1, {expr})"),
            DialectKind::Bigquery => format!("TIMESTAMP_SUB({expr}, INTERVAL 1 SECOND)"),
        }
    }
}
