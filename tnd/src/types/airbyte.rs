//! Declared stream types and their parsing from JSON schemas.

use serde_json::Value;

/// Scalar types a declared field can resolve to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PrimitiveKind {
    String,
    Integer,
    Number,
    Boolean,
    Date,
    TimeWithTimezone,
    TimeWithoutTimezone,
    TimestampWithTimezone,
    TimestampWithoutTimezone,
    /// Anything the schema does not pin down. Stored as a JSON document.
    Unknown,
}

/// Type of a declared field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AirbyteType {
    Primitive(PrimitiveKind),
    /// Object with properties in declaration order.
    Struct(Vec<(String, AirbyteType)>),
    Array(Box<AirbyteType>),
    /// Several admissible types, narrowed by [`AirbyteType::choose`].
    Union(Vec<AirbyteType>),
    /// `oneOf` declarations. Always stored as a JSON document.
    UnsupportedOneOf,
}

const WELL_KNOWN_TYPES_PREFIX: &str = "WellKnownTypes.json#/definitions/";

impl AirbyteType {
    pub const UNKNOWN: AirbyteType = AirbyteType::Primitive(PrimitiveKind::Unknown);

    /// Parses one field declaration.
    ///
    /// Never fails: shapes that cannot be interpreted become [`PrimitiveKind::Unknown`].
    pub fn from_json_schema(schema: &Value) -> AirbyteType {
        let Value::Object(object) = schema else {
            return Self::UNKNOWN;
        };

        if let Some(Value::String(reference)) = object.get("$ref") {
            return Self::from_reference(reference);
        }

        if object.contains_key("oneOf") {
            return AirbyteType::UnsupportedOneOf;
        }

        let declared: Vec<&str> = match object.get("type") {
            Some(Value::String(name)) => vec![name.as_str()],
            Some(Value::Array(names)) => names.iter().filter_map(Value::as_str).collect(),
            _ => return Self::UNKNOWN,
        };

        let mut options: Vec<AirbyteType> = declared
            .into_iter()
            .filter(|name| *name != "null")
            .map(|name| Self::from_type_name(name, schema))
            .collect();

        match options.len() {
            0 => Self::UNKNOWN,
            1 => options.remove(0),
            _ => AirbyteType::Union(options),
        }
    }

    fn from_type_name(name: &str, schema: &Value) -> AirbyteType {
        let format = schema.get("format").and_then(Value::as_str);
        let airbyte_type = schema.get("airbyte_type").and_then(Value::as_str);

        match name {
            "string" => match (format, airbyte_type) {
                (Some("date"), _) => AirbyteType::Primitive(PrimitiveKind::Date),
                (Some("date-time"), Some("timestamp_without_timezone")) => {
                    AirbyteType::Primitive(PrimitiveKind::TimestampWithoutTimezone)
                }
                (Some("date-time"), _) => {
                    AirbyteType::Primitive(PrimitiveKind::TimestampWithTimezone)
                }
                (Some("time"), Some("time_without_timezone")) => {
                    AirbyteType::Primitive(PrimitiveKind::TimeWithoutTimezone)
                }
                (Some("time"), _) => AirbyteType::Primitive(PrimitiveKind::TimeWithTimezone),
                _ => AirbyteType::Primitive(PrimitiveKind::String),
            },
            "number" if airbyte_type == Some("integer") => {
                AirbyteType::Primitive(PrimitiveKind::Integer)
            }
            "number" => AirbyteType::Primitive(PrimitiveKind::Number),
            "integer" => AirbyteType::Primitive(PrimitiveKind::Integer),
            "boolean" => AirbyteType::Primitive(PrimitiveKind::Boolean),
            "object" => {
                let fields = schema
                    .get("properties")
                    .and_then(Value::as_object)
                    .map(|properties| {
                        properties
                            .iter()
                            .map(|(name, field)| (name.clone(), Self::from_json_schema(field)))
                            .collect()
                    })
                    .unwrap_or_default();
                AirbyteType::Struct(fields)
            }
            "array" => match schema.get("items") {
                Some(items @ Value::Object(_)) => {
                    AirbyteType::Array(Box::new(Self::from_json_schema(items)))
                }
                _ => AirbyteType::Array(Box::new(Self::UNKNOWN)),
            },
            _ => Self::UNKNOWN,
        }
    }

    fn from_reference(reference: &str) -> AirbyteType {
        let name = reference
            .strip_prefix(WELL_KNOWN_TYPES_PREFIX)
            .unwrap_or(reference);

        let kind = match name {
            "String" | "BinaryData" => PrimitiveKind::String,
            "Integer" => PrimitiveKind::Integer,
            "Number" => PrimitiveKind::Number,
            "Boolean" => PrimitiveKind::Boolean,
            "Date" => PrimitiveKind::Date,
            "TimestampWithTimezone" => PrimitiveKind::TimestampWithTimezone,
            "TimestampWithoutTimezone" => PrimitiveKind::TimestampWithoutTimezone,
            "TimeWithTimezone" => PrimitiveKind::TimeWithTimezone,
            "TimeWithoutTimezone" => PrimitiveKind::TimeWithoutTimezone,
            _ => PrimitiveKind::Unknown,
        };

        AirbyteType::Primitive(kind)
    }

    /// Narrows a union to the single type its column is declared with.
    ///
    /// Other types are returned unchanged.
    pub fn choose(&self) -> AirbyteType {
        match self {
            AirbyteType::Union(options) => resolve_union(options),
            other => other.clone(),
        }
    }
}

/// Picks the representative type of a union.
///
/// The result does not depend on option order, so a union always maps to the same
/// column type.
pub fn resolve_union(options: &[AirbyteType]) -> AirbyteType {
    let mut flat = Vec::new();
    flatten_into(options, &mut flat);

    if flat.is_empty() {
        return AirbyteType::UNKNOWN;
    }

    let mut structs = 0usize;
    let mut arrays = 0usize;
    let mut primitives = Vec::new();

    for option in &flat {
        match option {
            AirbyteType::Primitive(PrimitiveKind::Unknown) | AirbyteType::UnsupportedOneOf => {
                return AirbyteType::UNKNOWN;
            }
            AirbyteType::Primitive(kind) => primitives.push(*kind),
            AirbyteType::Struct(_) => structs += 1,
            AirbyteType::Array(_) => arrays += 1,
            // Flattened above.
            AirbyteType::Union(_) => {}
        }
    }

    if structs == flat.len() {
        return AirbyteType::Struct(Vec::new());
    }
    if arrays == flat.len() {
        return AirbyteType::Array(Box::new(AirbyteType::UNKNOWN));
    }
    if structs > 0 || arrays > 0 {
        return AirbyteType::UNKNOWN;
    }

    primitives.sort();
    primitives.dedup();

    let kind = match primitives.as_slice() {
        [single] => *single,
        [PrimitiveKind::Integer, PrimitiveKind::Number] => PrimitiveKind::Number,
        _ => PrimitiveKind::String,
    };

    AirbyteType::Primitive(kind)
}

fn flatten_into(options: &[AirbyteType], out: &mut Vec<AirbyteType>) {
    for option in options {
        match option {
            AirbyteType::Union(inner) => flatten_into(inner, out),
            other => out.push(other.clone()),
        }
    }
}
