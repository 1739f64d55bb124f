use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Structural snapshot of one database, as produced by introspection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Schema {
    /// Keyed by qualified name (`schema.table`).
    pub tables: BTreeMap<String, Table>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Table {
    pub name: String,
    pub schema: String,
    /// Columns in declaration order.
    pub columns: Vec<Column>,
    pub indexes: Vec<Index>,
    pub primary_key: Option<PrimaryKey>,
    pub foreign_keys: Vec<ForeignKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub data_type: PgType,
    pub nullable: bool,
    pub default: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PgType {
    SmallInt,
    Integer,
    BigInt,
    Numeric(Option<(u32, u32)>),
    Real,
    DoublePrecision,
    Boolean,
    Char(Option<u32>),
    Varchar(Option<u32>),
    Text,
    Bytea,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Uuid,
    Json,
    Jsonb,
    Other(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Index {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PrimaryKey {
    pub name: Option<String>,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct ForeignKey {
    pub name: String,
    pub columns: Vec<String>,
    pub referenced_schema: String,
    pub referenced_table: String,
    pub referenced_columns: Vec<String>,
    pub on_delete: ReferentialAction,
    pub on_update: ReferentialAction,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum ReferentialAction {
    #[default]
    NoAction,
    Restrict,
    Cascade,
    SetNull,
    SetDefault,
}

impl ReferentialAction {
    pub fn as_sql(&self) -> &'static str {
        match self {
            ReferentialAction::NoAction => "NO ACTION",
            ReferentialAction::Restrict => "RESTRICT",
            ReferentialAction::Cascade => "CASCADE",
            ReferentialAction::SetNull => "SET NULL",
            ReferentialAction::SetDefault => "SET DEFAULT",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_uppercase().replace('_', " ").as_str() {
            "NO ACTION" => Some(ReferentialAction::NoAction),
            "RESTRICT" => Some(ReferentialAction::Restrict),
            "CASCADE" => Some(ReferentialAction::Cascade),
            "SET NULL" => Some(ReferentialAction::SetNull),
            "SET DEFAULT" => Some(ReferentialAction::SetDefault),
            _ => None,
        }
    }
}

impl PgType {
    /// Parses a SQL type name as written in mappings and changelogs
    /// (`varchar(255)`, `BIGINT`, `timestamp(6) with time zone`, `int8`).
    pub fn parse(raw: &str) -> PgType {
        let lowered = raw.trim().to_lowercase();
        let (base, args) = split_type_args(&lowered);
        let first_arg = args.first().copied();

        match base.as_str() {
            "smallint" | "int2" | "smallserial" => PgType::SmallInt,
            "integer" | "int" | "int4" | "serial" => PgType::Integer,
            "bigint" | "int8" | "bigserial" => PgType::BigInt,
            "numeric" | "decimal" => match (args.first(), args.get(1)) {
                (Some(p), Some(s)) => PgType::Numeric(Some((*p, *s))),
                (Some(p), None) => PgType::Numeric(Some((*p, 0))),
                _ => PgType::Numeric(None),
            },
            "real" | "float4" => PgType::Real,
            "double precision" | "float8" | "double" | "float" => PgType::DoublePrecision,
            "boolean" | "bool" => PgType::Boolean,
            "char" | "character" | "bpchar" => PgType::Char(first_arg),
            "varchar" | "character varying" => PgType::Varchar(first_arg),
            "text" | "clob" => PgType::Text,
            "bytea" | "blob" => PgType::Bytea,
            "date" => PgType::Date,
            "time" | "time without time zone" => PgType::Time,
            "timestamp" | "timestamp without time zone" | "datetime" => PgType::Timestamp,
            "timestamptz" | "timestamp with time zone" => PgType::TimestampTz,
            "uuid" => PgType::Uuid,
            "json" => PgType::Json,
            "jsonb" => PgType::Jsonb,
            _ => PgType::Other(lowered),
        }
    }

    /// Whether the declared type is a `serial` pseudo-type, which implies a
    /// sequence default on top of its integer type.
    pub fn is_serial(raw: &str) -> bool {
        matches!(
            raw.trim().to_lowercase().as_str(),
            "serial" | "bigserial" | "smallserial"
        )
    }
}

/// Splits `varchar(255)` into (`varchar`, [255]) and
/// `timestamp(6) with time zone` into (`timestamp with time zone`, [6]).
fn split_type_args(lowered: &str) -> (String, Vec<u32>) {
    match (lowered.find('('), lowered.find(')')) {
        (Some(open), Some(close)) if close > open => {
            let args = lowered[open + 1..close]
                .split(',')
                .filter_map(|a| a.trim().parse::<u32>().ok())
                .collect();
            let base = format!("{}{}", &lowered[..open], &lowered[close + 1..]);
            (crate::util::normalize_sql_whitespace(&base), args)
        }
        _ => (crate::util::normalize_sql_whitespace(lowered), Vec::new()),
    }
}

impl fmt::Display for PgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PgType::SmallInt => write!(f, "SMALLINT"),
            PgType::Integer => write!(f, "INTEGER"),
            PgType::BigInt => write!(f, "BIGINT"),
            PgType::Numeric(Some((p, s))) => write!(f, "NUMERIC({p}, {s})"),
            PgType::Numeric(None) => write!(f, "NUMERIC"),
            PgType::Real => write!(f, "REAL"),
            PgType::DoublePrecision => write!(f, "DOUBLE PRECISION"),
            PgType::Boolean => write!(f, "BOOLEAN"),
            PgType::Char(Some(len)) => write!(f, "CHAR({len})"),
            PgType::Char(None) => write!(f, "CHAR"),
            PgType::Varchar(Some(len)) => write!(f, "VARCHAR({len})"),
            PgType::Varchar(None) => write!(f, "VARCHAR"),
            PgType::Text => write!(f, "TEXT"),
            PgType::Bytea => write!(f, "BYTEA"),
            PgType::Date => write!(f, "DATE"),
            PgType::Time => write!(f, "TIME"),
            PgType::Timestamp => write!(f, "TIMESTAMP"),
            PgType::TimestampTz => write!(f, "TIMESTAMP WITH TIME ZONE"),
            PgType::Uuid => write!(f, "UUID"),
            PgType::Json => write!(f, "JSON"),
            PgType::Jsonb => write!(f, "JSONB"),
            PgType::Other(name) => write!(f, "{}", name.to_uppercase()),
        }
    }
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Table {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Table {
            name: name.into(),
            schema: schema.into(),
            columns: Vec::new(),
            indexes: Vec::new(),
            primary_key: None,
            foreign_keys: Vec::new(),
        }
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_type_spellings() {
        assert_eq!(PgType::parse("varchar(255)"), PgType::Varchar(Some(255)));
        assert_eq!(PgType::parse("VARCHAR"), PgType::Varchar(None));
        assert_eq!(PgType::parse("int8"), PgType::BigInt);
        assert_eq!(PgType::parse("BIGINT"), PgType::BigInt);
        assert_eq!(PgType::parse("numeric(38,2)"), PgType::Numeric(Some((38, 2))));
        assert_eq!(
            PgType::parse("timestamp(6) with time zone"),
            PgType::TimestampTz
        );
        assert_eq!(PgType::parse("timestamp(6)"), PgType::Timestamp);
        assert_eq!(PgType::parse("float8"), PgType::DoublePrecision);
        assert_eq!(PgType::parse("citext"), PgType::Other("citext".to_string()));
    }

    #[test]
    fn displayed_type_parses_back() {
        for ty in [
            PgType::Numeric(Some((10, 2))),
            PgType::Varchar(Some(64)),
            PgType::TimestampTz,
            PgType::DoublePrecision,
            PgType::Char(Some(3)),
        ] {
            assert_eq!(PgType::parse(&ty.to_string()), ty);
        }
    }

    #[test]
    fn referential_action_parses_liquibase_spelling() {
        assert_eq!(
            ReferentialAction::parse("SET NULL"),
            Some(ReferentialAction::SetNull)
        );
        assert_eq!(
            ReferentialAction::parse("cascade"),
            Some(ReferentialAction::Cascade)
        );
        assert_eq!(ReferentialAction::parse("bogus"), None);
    }
}
