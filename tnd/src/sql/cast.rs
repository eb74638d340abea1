//! Field extraction and typing expressions, per dialect.

use crate::naming::{DATA_COLUMN, META_COLUMN};
use crate::sql::dialect::{Dialect, JsonSyntax, SafeCastStyle};
use crate::types::{AirbyteType, PrimitiveKind};

pub(crate) const CHANGE_NULLED: &str = "NULLED";
pub(crate) const REASON_TYPECAST_ERROR: &str = "DESTINATION_TYPECAST_ERROR";

/// Session helper turning cast exceptions into `NULL`s.
pub(crate) const PG_SAFE_CAST_FUNCTION: &str = r#"CREATE OR REPLACE FUNCTION pg_temp._airbyte_safe_cast(_in text, INOUT _out ANYELEMENT)
LANGUAGE plpgsql AS $$
BEGIN
  EXECUTE format('SELECT %L::%s', $1, pg_typeof(_out)) INTO _out;
EXCEPTION WHEN others THEN
  -- leave _out NULL
END
$$"#;

/// Typed value of one declared field and the error entry produced when typing fails.
pub(crate) struct TypedField {
    pub value: String,
    /// Evaluates to an error object, or `NULL` when the field typed cleanly.
    pub error: String,
}

/// JSON value of `field` inside the raw document, `NULL` when absent.
pub(crate) fn extract_json(dialect: &Dialect, field: &str) -> String {
    let data = dialect.quote(DATA_COLUMN);
    match dialect.json {
        JsonSyntax::Postgres => format!("{data} -> {}", dialect.literal(field)),
        JsonSyntax::Snowflake => format!("{data}:{}", dialect.quote(field)),
        JsonSyntax::BigQuery => format!("JSON_QUERY({data}, {})", json_path(dialect, field)),
    }
}

/// Scalar text of `field`, `NULL` when absent or JSON null.
fn extract_text(dialect: &Dialect, field: &str) -> String {
    let data = dialect.quote(DATA_COLUMN);
    match dialect.json {
        JsonSyntax::Postgres => format!("({data} ->> {})", dialect.literal(field)),
        JsonSyntax::Snowflake => format!("{}::TEXT", extract_json(dialect, field)),
        JsonSyntax::BigQuery => {
            let json = extract_json(dialect, field);
            format!(
                "CASE WHEN JSON_TYPE({json}) IN ('object', 'array') THEN TO_JSON_STRING({json}) ELSE JSON_VALUE({data}, {}) END",
                json_path(dialect, field)
            )
        }
    }
}

fn json_path(dialect: &Dialect, field: &str) -> String {
    let key = field.replace('\\', "\\\\").replace('"', "\\\"");
    dialect.literal(&format!("$.\"{key}\""))
}

fn json_type(dialect: &Dialect, expr: &str) -> String {
    match dialect.json {
        JsonSyntax::Postgres => format!("jsonb_typeof({expr})"),
        JsonSyntax::Snowflake => format!("TYPEOF({expr})"),
        JsonSyntax::BigQuery => format!("JSON_TYPE({expr})"),
    }
}

fn json_type_name(dialect: &Dialect, name: &str) -> String {
    match dialect.json {
        JsonSyntax::Snowflake => match name {
            "null" => "'NULL_VALUE'".to_string(),
            other => format!("'{}'", other.to_ascii_uppercase()),
        },
        JsonSyntax::Postgres | JsonSyntax::BigQuery => format!("'{name}'"),
    }
}

/// True when `field` is present in the raw document with a non-null value.
pub(crate) fn field_present(dialect: &Dialect, field: &str) -> String {
    let null = json_type_name(dialect, "null");
    format!(
        "COALESCE({}, {null}) <> {null}",
        json_type(dialect, &extract_json(dialect, field))
    )
}

fn cast(dialect: &Dialect, expr: &str, ddl: &str, safer: bool) -> String {
    if !safer {
        return format!("CAST({expr} AS {ddl})");
    }

    match dialect.safe_cast {
        SafeCastStyle::PgTempFunction => {
            format!("pg_temp._airbyte_safe_cast({expr}, NULL::{ddl})")
        }
        SafeCastStyle::TryCast => format!("TRY_CAST({expr} AS {ddl})"),
        SafeCastStyle::SafeCast => format!("SAFE_CAST({expr} AS {ddl})"),
    }
}

/// Builds the typed expression of `field`.
///
/// With `safer` unset, a malformed scalar makes the statement fail with a
/// conversion error. With it set, the value becomes `NULL` and `error` reports it.
/// Composite types never fail: a value of the wrong JSON shape is nulled.
pub(crate) fn typed_field(
    dialect: &Dialect,
    field: &str,
    airbyte_type: &AirbyteType,
    safer: bool,
) -> TypedField {
    let json = extract_json(dialect, field);
    let column_type = dialect.type_for(airbyte_type);

    let value = match airbyte_type.choose() {
        AirbyteType::Struct(_) => format!(
            "CASE WHEN {} = {} THEN {json} END",
            json_type(dialect, &json),
            json_type_name(dialect, "object")
        ),
        AirbyteType::Array(_) => format!(
            "CASE WHEN {} = {} THEN {json} END",
            json_type(dialect, &json),
            json_type_name(dialect, "array")
        ),
        AirbyteType::Primitive(PrimitiveKind::Unknown)
        | AirbyteType::Union(_)
        | AirbyteType::UnsupportedOneOf => {
            format!("CASE WHEN {} THEN {json} END", field_present(dialect, field))
        }
        AirbyteType::Primitive(kind) if dialect.stores_as_text(kind) => {
            extract_text(dialect, field)
        }
        AirbyteType::Primitive(_) => cast(
            dialect,
            &extract_text(dialect, field),
            column_type.ddl,
            safer,
        ),
    };

    let error = format!(
        "CASE WHEN {} AND ({value}) IS NULL THEN {} END",
        field_present(dialect, field),
        error_object(dialect, field)
    );

    TypedField { value, error }
}

fn error_object(dialect: &Dialect, field: &str) -> String {
    let args = format!(
        "'field', {}, 'change', '{CHANGE_NULLED}', 'reason', '{REASON_TYPECAST_ERROR}'",
        dialect.literal(field)
    );
    match dialect.json {
        JsonSyntax::Postgres => format!("jsonb_build_object({args})"),
        JsonSyntax::Snowflake => format!("OBJECT_CONSTRUCT({args})"),
        JsonSyntax::BigQuery => format!("JSON_OBJECT({args})"),
    }
}

/// The `_airbyte_meta` document: `{"errors": [...]}` without the `NULL` entries.
pub(crate) fn meta_expression(dialect: &Dialect, errors: &[String]) -> String {
    let list = errors.join(", ");
    match dialect.json {
        JsonSyntax::Postgres => format!(
            "jsonb_build_object('errors', to_jsonb(array_remove(ARRAY[{list}]::jsonb[], NULL)))"
        ),
        JsonSyntax::Snowflake => {
            format!("OBJECT_CONSTRUCT('errors', ARRAY_CONSTRUCT_COMPACT({list}))")
        }
        JsonSyntax::BigQuery => format!(
            "TO_JSON(STRUCT(ARRAY(SELECT e FROM UNNEST(ARRAY<JSON>[{list}]) AS e WHERE e IS NOT NULL) AS errors))"
        ),
    }
}

/// True for final rows whose `_airbyte_meta` lists at least one error.
pub(crate) fn has_errors(dialect: &Dialect) -> String {
    let meta = dialect.quote(META_COLUMN);
    match dialect.json {
        JsonSyntax::Postgres => {
            format!("COALESCE(jsonb_array_length({meta} -> 'errors'), 0) > 0")
        }
        JsonSyntax::Snowflake => format!("COALESCE(ARRAY_SIZE({meta}:\"errors\"), 0) > 0"),
        JsonSyntax::BigQuery => {
            format!("COALESCE(ARRAY_LENGTH(JSON_QUERY_ARRAY({meta}, '$.errors')), 0) > 0")
        }
    }
}
