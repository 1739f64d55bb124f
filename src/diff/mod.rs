//! Structural diff between two live schemas, expressed as changelog changes.

use crate::changelog::{write_changelog, Change, ChangeLog, ChangeSet, ColumnConfig, DefaultValue, TableRef};
use crate::model::{Column, ForeignKey, Index, PrimaryKey, Schema, Table};
use crate::pg::connection::PgConnection;
use crate::pg::introspect::introspect_schema;
use crate::util::{normalize_default, Result, SchemaError};
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, info};

/// Author recorded on generated changesets when a fixed local user is forced.
pub const DEV_USER: &str = "dev";

/// Changes grouped by the order they must be applied in.
#[derive(Default)]
struct Phases {
    drop_foreign_keys: Vec<Change>,
    drop_indexes: Vec<Change>,
    create_tables: Vec<Change>,
    add_columns: Vec<Change>,
    modify_types: Vec<Change>,
    nullability: Vec<Change>,
    defaults: Vec<Change>,
    primary_keys: Vec<Change>,
    create_indexes: Vec<Change>,
    add_foreign_keys: Vec<Change>,
    drop_columns: Vec<Change>,
    drop_tables: Vec<Change>,
}

impl Phases {
    fn into_changes(self) -> Vec<Change> {
        [
            self.drop_foreign_keys,
            self.drop_indexes,
            self.create_tables,
            self.add_columns,
            self.modify_types,
            self.nullability,
            self.defaults,
            self.primary_keys,
            self.create_indexes,
            self.add_foreign_keys,
            self.drop_columns,
            self.drop_tables,
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

/// Changes that transform `source` into `target`.
pub fn compute_diff(source: &Schema, target: &Schema) -> Vec<Change> {
    let mut phases = Phases::default();

    for (name, table) in &target.tables {
        match source.tables.get(name) {
            Some(existing) => diff_table(&mut phases, existing, table),
            None => create_table(&mut phases, table),
        }
    }

    for (name, table) in &source.tables {
        if !target.tables.contains_key(name) {
            drop_table(&mut phases, table);
        }
    }

    phases.into_changes()
}

fn table_ref(schema: &str, name: &str) -> TableRef {
    if schema == "public" {
        TableRef::new(name)
    } else {
        TableRef::qualified(schema, name)
    }
}

fn table_ref_of(table: &Table) -> TableRef {
    table_ref(&table.schema, &table.name)
}

fn create_table(phases: &mut Phases, table: &Table) {
    let columns = table
        .columns
        .iter()
        .map(|column| {
            let mut config = column_config(column);
            if let Some(pk) = &table.primary_key {
                if pk.columns.contains(&column.name) {
                    config.constraints.primary_key = true;
                    config.constraints.primary_key_name = pk.name.clone();
                }
            }
            config
        })
        .collect();

    phases.create_tables.push(Change::CreateTable {
        table: table_ref_of(table),
        columns,
    });
    for index in &table.indexes {
        phases.create_indexes.push(create_index(table, index));
    }
    for foreign_key in &table.foreign_keys {
        phases.add_foreign_keys.push(add_foreign_key(table, foreign_key));
    }
}

fn drop_table(phases: &mut Phases, table: &Table) {
    for foreign_key in &table.foreign_keys {
        phases.drop_foreign_keys.push(drop_foreign_key(table, foreign_key));
    }
    phases.drop_tables.push(Change::DropTable {
        table: table_ref_of(table),
        cascade: false,
    });
}

fn diff_table(phases: &mut Phases, source: &Table, target: &Table) {
    diff_columns(phases, source, target);
    diff_primary_keys(phases, source, target);
    diff_indexes(phases, source, target);
    diff_foreign_keys(phases, source, target);
}

fn diff_columns(phases: &mut Phases, source: &Table, target: &Table) {
    let table = table_ref_of(target);

    for column in &target.columns {
        let Some(existing) = source.column(&column.name) else {
            phases.add_columns.push(Change::AddColumn {
                table: table.clone(),
                columns: vec![column_config(column)],
            });
            continue;
        };

        if existing.data_type != column.data_type {
            phases.modify_types.push(Change::ModifyDataType {
                table: table.clone(),
                column: column.name.clone(),
                new_data_type: column.data_type.to_string(),
            });
        }

        if existing.nullable != column.nullable {
            let column_data_type = Some(column.data_type.to_string());
            phases.nullability.push(if column.nullable {
                Change::DropNotNullConstraint {
                    table: table.clone(),
                    column: column.name.clone(),
                    column_data_type,
                }
            } else {
                Change::AddNotNullConstraint {
                    table: table.clone(),
                    column: column.name.clone(),
                    column_data_type,
                }
            });
        }

        if default_key(existing) != default_key(column) {
            phases.defaults.push(match &column.default {
                Some(expression) => Change::AddDefaultValue {
                    table: table.clone(),
                    column: column.name.clone(),
                    value: default_value(expression),
                },
                None => Change::DropDefaultValue {
                    table: table.clone(),
                    column: column.name.clone(),
                },
            });
        }
    }

    for column in &source.columns {
        if target.column(&column.name).is_none() {
            phases.drop_columns.push(Change::DropColumn {
                table: table_ref_of(source),
                column: column.name.clone(),
            });
        }
    }
}

fn diff_primary_keys(phases: &mut Phases, source: &Table, target: &Table) {
    let add = |pk: &PrimaryKey| Change::AddPrimaryKey {
        table: table_ref_of(target),
        columns: pk.columns.clone(),
        constraint_name: pk.name.clone(),
    };
    let drop = |pk: &PrimaryKey| Change::DropPrimaryKey {
        table: table_ref_of(source),
        constraint_name: pk.name.clone(),
    };

    match (&source.primary_key, &target.primary_key) {
        (None, Some(pk)) => phases.primary_keys.push(add(pk)),
        (Some(pk), None) => phases.primary_keys.push(drop(pk)),
        (Some(from_pk), Some(to_pk)) if from_pk != to_pk => {
            phases.primary_keys.push(drop(from_pk));
            phases.primary_keys.push(add(to_pk));
        }
        _ => {}
    }
}

fn diff_indexes(phases: &mut Phases, source: &Table, target: &Table) {
    for index in &target.indexes {
        match source.indexes.iter().find(|i| i.name == index.name) {
            Some(existing) if existing == index => {}
            Some(existing) => {
                phases.drop_indexes.push(drop_index(source, existing));
                phases.create_indexes.push(create_index(target, index));
            }
            None => phases.create_indexes.push(create_index(target, index)),
        }
    }

    for index in &source.indexes {
        if !target.indexes.iter().any(|i| i.name == index.name) {
            phases.drop_indexes.push(drop_index(source, index));
        }
    }
}

fn diff_foreign_keys(phases: &mut Phases, source: &Table, target: &Table) {
    for foreign_key in &target.foreign_keys {
        match source.foreign_keys.iter().find(|fk| fk.name == foreign_key.name) {
            Some(existing) if existing == foreign_key => {}
            Some(existing) => {
                phases.drop_foreign_keys.push(drop_foreign_key(source, existing));
                phases.add_foreign_keys.push(add_foreign_key(target, foreign_key));
            }
            None => phases.add_foreign_keys.push(add_foreign_key(target, foreign_key)),
        }
    }

    for foreign_key in &source.foreign_keys {
        if !target.foreign_keys.iter().any(|fk| fk.name == foreign_key.name) {
            phases.drop_foreign_keys.push(drop_foreign_key(source, foreign_key));
        }
    }
}

fn create_index(table: &Table, index: &Index) -> Change {
    Change::CreateIndex {
        table: table_ref_of(table),
        index_name: index.name.clone(),
        columns: index.columns.clone(),
        unique: index.unique,
    }
}

fn drop_index(table: &Table, index: &Index) -> Change {
    Change::DropIndex {
        table: table_ref_of(table),
        index_name: index.name.clone(),
    }
}

fn add_foreign_key(table: &Table, foreign_key: &ForeignKey) -> Change {
    Change::AddForeignKeyConstraint {
        table: table_ref_of(table),
        base_columns: foreign_key.columns.clone(),
        constraint_name: foreign_key.name.clone(),
        referenced_table: table_ref(&foreign_key.referenced_schema, &foreign_key.referenced_table),
        referenced_columns: foreign_key.referenced_columns.clone(),
        on_delete: Some(foreign_key.on_delete),
        on_update: Some(foreign_key.on_update),
    }
}

fn drop_foreign_key(table: &Table, foreign_key: &ForeignKey) -> Change {
    Change::DropForeignKeyConstraint {
        table: table_ref_of(table),
        constraint_name: foreign_key.name.clone(),
    }
}

fn is_sequence_default(expression: &str) -> bool {
    expression.trim_start().to_lowercase().starts_with("nextval(")
}

/// Comparison key of a column default. Sequence defaults compare equal
/// regardless of the sequence name.
fn default_key(column: &Column) -> Option<String> {
    column.default.as_deref().map(|expression| {
        if is_sequence_default(expression) {
            "nextval".to_string()
        } else {
            normalize_default(expression)
        }
    })
}

fn literal_cast() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^('(?:[^']|'')*')::[a-z][a-z0-9_ ]*(\[\])?$").unwrap())
}

/// `'open'::character varying` becomes the literal `open`.
fn default_value(expression: &str) -> DefaultValue {
    let trimmed = expression.trim();
    match literal_cast().captures(trimmed) {
        Some(caps) => DefaultValue::from_expression(&caps[1]),
        None => DefaultValue::from_expression(trimmed),
    }
}

fn column_config(column: &Column) -> ColumnConfig {
    let mut config = ColumnConfig::new(&column.name, column.data_type.to_string());
    if !column.nullable {
        config.constraints.nullable = Some(false);
    }
    match column.default.as_deref() {
        Some(expression) if is_sequence_default(expression) => config.auto_increment = true,
        Some(expression) => config.default = Some(default_value(expression)),
        None => {}
    }
    config
}

/// `dev` when a fixed local user is forced, otherwise the invoking user.
pub fn changeset_author(dev_user: bool) -> String {
    if dev_user {
        return DEV_USER.to_string();
    }
    std::env::var("USER").unwrap_or_else(|_| "unknown".to_string())
}

/// Wraps every change into its own changeset, ids `<stamp>-<n>` from 1.
pub fn to_change_sets(changes: Vec<Change>, author: &str, stamp: i64) -> Vec<ChangeSet> {
    changes
        .into_iter()
        .enumerate()
        .map(|(n, change)| ChangeSet::new(format!("{stamp}-{}", n + 1), author, vec![change]))
        .collect()
}

/// Introspects both databases and diffs source against target.
pub async fn diff_databases(
    source: &PgConnection,
    target: &PgConnection,
    schemas: &[String],
) -> Result<Vec<Change>> {
    let (from, to) = tokio::try_join!(
        introspect_schema(source, schemas),
        introspect_schema(target, schemas)
    )
    .map_err(|e| SchemaError::Diff(format!("Failed to introspect databases: {e}")))?;

    debug!(
        "Source has {} tables, target has {} tables",
        from.tables.len(),
        to.tables.len()
    );
    Ok(compute_diff(&from, &to))
}

/// Writes `change_sets` as a changelog document at `output_file`.
pub fn write_diff(output_file: &Path, change_sets: Vec<ChangeSet>) -> Result<ChangeLog> {
    let path = output_file.to_string_lossy().into_owned();
    let mut changelog = ChangeLog::new(path.clone());
    changelog.change_sets = change_sets
        .into_iter()
        .map(|mut change_set| {
            change_set.path = path.clone();
            change_set
        })
        .collect();

    info!(
        "Writing {} changesets to {}",
        changelog.change_sets.len(),
        output_file.display()
    );
    write_changelog(output_file, &changelog)?;
    Ok(changelog)
}
