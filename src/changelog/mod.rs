//! Changelog documents: ordered changesets of typed schema changes.
//!
//! The on-disk format is the Liquibase XML dialect (`databaseChangeLog` root,
//! `changeSet` children). [`xml`] reads and writes it, [`update`] replays a
//! changelog against a live database.

pub mod update;
pub mod xml;

use crate::model::ReferentialAction;
use serde::Serialize;

pub use update::{update, UpdateOptions, UpdateReport};
pub use xml::{load_changelog, parse_changelog, serialize_change_sets, write_changelog};

/// An ordered, versioned list of changesets.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ChangeLog {
    /// Logical path recorded in the tracking table for each applied changeset.
    pub path: String,
    pub change_sets: Vec<ChangeSet>,
}

/// A named migration unit. Identified by `(id, author, path)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeSet {
    pub id: String,
    pub author: String,
    /// Path of the changelog file that declared this changeset. Differs from
    /// the root changelog path for included files.
    pub path: String,
    pub context: Option<String>,
    pub labels: Option<String>,
    pub comment: Option<String>,
    pub changes: Vec<Change>,
}

/// Reference to a table, optionally schema-qualified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableRef {
    pub schema: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DefaultValue {
    /// A string literal, written as `defaultValue`.
    Literal(String),
    Numeric(String),
    Boolean(bool),
    /// A raw SQL expression, written as `defaultValueComputed`.
    Computed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ColumnConstraints {
    pub nullable: Option<bool>,
    pub primary_key: bool,
    pub primary_key_name: Option<String>,
    pub unique: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnConfig {
    pub name: String,
    pub type_name: Option<String>,
    pub default: Option<DefaultValue>,
    pub auto_increment: bool,
    pub constraints: ColumnConstraints,
}

/// One atomic schema mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Change {
    CreateTable {
        table: TableRef,
        columns: Vec<ColumnConfig>,
    },
    DropTable {
        table: TableRef,
        cascade: bool,
    },
    AddColumn {
        table: TableRef,
        columns: Vec<ColumnConfig>,
    },
    DropColumn {
        table: TableRef,
        column: String,
    },
    ModifyDataType {
        table: TableRef,
        column: String,
        new_data_type: String,
    },
    AddNotNullConstraint {
        table: TableRef,
        column: String,
        column_data_type: Option<String>,
    },
    DropNotNullConstraint {
        table: TableRef,
        column: String,
        column_data_type: Option<String>,
    },
    AddDefaultValue {
        table: TableRef,
        column: String,
        value: DefaultValue,
    },
    DropDefaultValue {
        table: TableRef,
        column: String,
    },
    AddPrimaryKey {
        table: TableRef,
        columns: Vec<String>,
        constraint_name: Option<String>,
    },
    DropPrimaryKey {
        table: TableRef,
        constraint_name: Option<String>,
    },
    CreateIndex {
        table: TableRef,
        index_name: String,
        columns: Vec<String>,
        unique: bool,
    },
    DropIndex {
        table: TableRef,
        index_name: String,
    },
    AddForeignKeyConstraint {
        table: TableRef,
        base_columns: Vec<String>,
        constraint_name: String,
        referenced_table: TableRef,
        referenced_columns: Vec<String>,
        on_delete: Option<ReferentialAction>,
        on_update: Option<ReferentialAction>,
    },
    DropForeignKeyConstraint {
        table: TableRef,
        constraint_name: String,
    },
    Sql {
        sql: String,
    },
}

impl ChangeLog {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            change_sets: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.change_sets.is_empty()
    }

    pub fn change_count(&self) -> usize {
        self.change_sets.iter().map(|cs| cs.changes.len()).sum()
    }
}

impl ChangeSet {
    pub fn new(id: impl Into<String>, author: impl Into<String>, changes: Vec<Change>) -> Self {
        Self {
            id: id.into(),
            author: author.into(),
            path: String::new(),
            context: None,
            labels: None,
            comment: None,
            changes,
        }
    }
}

impl TableRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            schema: None,
            name: name.into(),
        }
    }

    pub fn qualified(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: Some(schema.into()),
            name: name.into(),
        }
    }

    pub fn schema_or_default(&self) -> &str {
        self.schema.as_deref().unwrap_or("public")
    }
}

impl DefaultValue {
    /// Classifies a SQL default expression, the inverse of [`DefaultValue::to_sql`].
    pub fn from_expression(expression: &str) -> Self {
        let trimmed = expression.trim();
        if let Some(inner) = trimmed
            .strip_prefix('\'')
            .and_then(|s| s.strip_suffix('\''))
            .filter(|inner| !inner.replace("''", "").contains('\''))
        {
            return DefaultValue::Literal(inner.replace("''", "'"));
        }
        match trimmed.to_lowercase().as_str() {
            "true" => return DefaultValue::Boolean(true),
            "false" => return DefaultValue::Boolean(false),
            _ => {}
        }
        if trimmed.parse::<f64>().is_ok() {
            return DefaultValue::Numeric(trimmed.to_string());
        }
        DefaultValue::Computed(trimmed.to_string())
    }

    pub fn to_sql(&self) -> String {
        match self {
            DefaultValue::Literal(value) => format!("'{}'", value.replace('\'', "''")),
            DefaultValue::Numeric(value) => value.clone(),
            DefaultValue::Boolean(value) => value.to_string(),
            DefaultValue::Computed(expression) => expression.clone(),
        }
    }
}

impl ColumnConfig {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: Some(type_name.into()),
            default: None,
            auto_increment: false,
            constraints: ColumnConstraints::default(),
        }
    }

    pub fn not_null(mut self) -> Self {
        self.constraints.nullable = Some(false);
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.constraints.primary_key = true;
        self.constraints.nullable = Some(false);
        self
    }
}

impl Change {
    /// The serialized element name of this change, e.g. `createTable`.
    pub fn kind(&self) -> &'static str {
        match self {
            Change::CreateTable { .. } => "createTable",
            Change::DropTable { .. } => "dropTable",
            Change::AddColumn { .. } => "addColumn",
            Change::DropColumn { .. } => "dropColumn",
            Change::ModifyDataType { .. } => "modifyDataType",
            Change::AddNotNullConstraint { .. } => "addNotNullConstraint",
            Change::DropNotNullConstraint { .. } => "dropNotNullConstraint",
            Change::AddDefaultValue { .. } => "addDefaultValue",
            Change::DropDefaultValue { .. } => "dropDefaultValue",
            Change::AddPrimaryKey { .. } => "addPrimaryKey",
            Change::DropPrimaryKey { .. } => "dropPrimaryKey",
            Change::CreateIndex { .. } => "createIndex",
            Change::DropIndex { .. } => "dropIndex",
            Change::AddForeignKeyConstraint { .. } => "addForeignKeyConstraint",
            Change::DropForeignKeyConstraint { .. } => "dropForeignKeyConstraint",
            Change::Sql { .. } => "sql",
        }
    }

    /// The table this change affects. `None` for raw SQL.
    pub fn table(&self) -> Option<&TableRef> {
        match self {
            Change::CreateTable { table, .. }
            | Change::DropTable { table, .. }
            | Change::AddColumn { table, .. }
            | Change::DropColumn { table, .. }
            | Change::ModifyDataType { table, .. }
            | Change::AddNotNullConstraint { table, .. }
            | Change::DropNotNullConstraint { table, .. }
            | Change::AddDefaultValue { table, .. }
            | Change::DropDefaultValue { table, .. }
            | Change::AddPrimaryKey { table, .. }
            | Change::DropPrimaryKey { table, .. }
            | Change::CreateIndex { table, .. }
            | Change::DropIndex { table, .. }
            | Change::AddForeignKeyConstraint { table, .. }
            | Change::DropForeignKeyConstraint { table, .. } => Some(table),
            Change::Sql { .. } => None,
        }
    }

    pub fn table_name(&self) -> Option<&str> {
        self.table().map(|t| t.name.as_str())
    }
}
