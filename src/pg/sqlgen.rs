use crate::changelog::{Change, ColumnConfig, TableRef};
use crate::util::normalize_sql_whitespace;

pub fn generate_sql(changes: &[Change]) -> Vec<String> {
    changes.iter().flat_map(generate_change_sql).collect()
}

/// Renders a statement either multi-line (as generated) or collapsed onto one line.
pub fn format_statement(sql: &str, pretty: bool) -> String {
    if pretty {
        sql.to_string()
    } else {
        normalize_sql_whitespace(sql)
    }
}

fn generate_change_sql(change: &Change) -> Vec<String> {
    match change {
        Change::CreateTable { table, columns } => vec![generate_create_table(table, columns)],

        Change::DropTable { table, cascade } => {
            let cascade = if *cascade { " CASCADE" } else { "" };
            vec![format!("DROP TABLE {}{};", quote_table(table), cascade)]
        }

        Change::AddColumn { table, columns } => columns
            .iter()
            .map(|column| {
                format!(
                    "ALTER TABLE {} ADD COLUMN {};",
                    quote_table(table),
                    format_column(column)
                )
            })
            .chain(columns.iter().filter(|c| c.constraints.primary_key).map(|c| {
                format!(
                    "ALTER TABLE {} ADD PRIMARY KEY ({});",
                    quote_table(table),
                    quote_ident(&c.name)
                )
            }))
            .collect(),

        Change::DropColumn { table, column } => vec![format!(
            "ALTER TABLE {} DROP COLUMN {};",
            quote_table(table),
            quote_ident(column)
        )],

        Change::ModifyDataType {
            table,
            column,
            new_data_type,
        } => vec![format!(
            "ALTER TABLE {} ALTER COLUMN {} TYPE {} USING ({}::{});",
            quote_table(table),
            quote_ident(column),
            new_data_type,
            quote_ident(column),
            new_data_type
        )],

        Change::AddNotNullConstraint { table, column, .. } => vec![format!(
            "ALTER TABLE {} ALTER COLUMN {} SET NOT NULL;",
            quote_table(table),
            quote_ident(column)
        )],

        Change::DropNotNullConstraint { table, column, .. } => vec![format!(
            "ALTER TABLE {} ALTER COLUMN {} DROP NOT NULL;",
            quote_table(table),
            quote_ident(column)
        )],

        Change::AddDefaultValue {
            table,
            column,
            value,
        } => vec![format!(
            "ALTER TABLE {} ALTER COLUMN {} SET DEFAULT {};",
            quote_table(table),
            quote_ident(column),
            value.to_sql()
        )],

        Change::DropDefaultValue { table, column } => vec![format!(
            "ALTER TABLE {} ALTER COLUMN {} DROP DEFAULT;",
            quote_table(table),
            quote_ident(column)
        )],

        Change::AddPrimaryKey {
            table,
            columns,
            constraint_name,
        } => {
            let constraint = constraint_name
                .as_ref()
                .map(|name| format!("CONSTRAINT {} ", quote_ident(name)))
                .unwrap_or_default();
            vec![format!(
                "ALTER TABLE {} ADD {}PRIMARY KEY ({});",
                quote_table(table),
                constraint,
                format_column_list(columns)
            )]
        }

        Change::DropPrimaryKey {
            table,
            constraint_name,
        } => {
            let name = constraint_name
                .clone()
                .unwrap_or_else(|| format!("{}_pkey", table.name));
            vec![format!(
                "ALTER TABLE {} DROP CONSTRAINT {};",
                quote_table(table),
                quote_ident(&name)
            )]
        }

        Change::CreateIndex {
            table,
            index_name,
            columns,
            unique,
        } => {
            let unique = if *unique { "UNIQUE " } else { "" };
            vec![format!(
                "CREATE {}INDEX {} ON {} ({});",
                unique,
                quote_ident(index_name),
                quote_table(table),
                format_column_list(columns)
            )]
        }

        Change::DropIndex { table, index_name } => vec![format!(
            "DROP INDEX {}.{};",
            quote_ident(table.schema_or_default()),
            quote_ident(index_name)
        )],

        Change::AddForeignKeyConstraint {
            table,
            base_columns,
            constraint_name,
            referenced_table,
            referenced_columns,
            on_delete,
            on_update,
        } => {
            let mut sql = format!(
                "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({})",
                quote_table(table),
                quote_ident(constraint_name),
                format_column_list(base_columns),
                quote_table(referenced_table),
                format_column_list(referenced_columns)
            );
            if let Some(action) = on_delete {
                sql.push_str(&format!(" ON DELETE {}", action.as_sql()));
            }
            if let Some(action) = on_update {
                sql.push_str(&format!(" ON UPDATE {}", action.as_sql()));
            }
            sql.push(';');
            vec![sql]
        }

        Change::DropForeignKeyConstraint {
            table,
            constraint_name,
        } => vec![format!(
            "ALTER TABLE {} DROP CONSTRAINT {};",
            quote_table(table),
            quote_ident(constraint_name)
        )],

        Change::Sql { sql } => vec![sql.clone()],
    }
}

fn generate_create_table(table: &TableRef, columns: &[ColumnConfig]) -> String {
    let mut column_defs: Vec<String> = columns.iter().map(format_column).collect();

    let primary_key: Vec<String> = columns
        .iter()
        .filter(|c| c.constraints.primary_key)
        .map(|c| c.name.clone())
        .collect();
    if !primary_key.is_empty() {
        let constraint = columns
            .iter()
            .find_map(|c| c.constraints.primary_key_name.as_ref())
            .map(|name| format!("CONSTRAINT {} ", quote_ident(name)))
            .unwrap_or_default();
        column_defs.push(format!(
            "{}PRIMARY KEY ({})",
            constraint,
            format_column_list(&primary_key)
        ));
    }

    format!(
        "CREATE TABLE {} (\n    {}\n);",
        quote_table(table),
        column_defs.join(",\n    ")
    )
}

fn format_column(column: &ColumnConfig) -> String {
    let type_name = column.type_name.as_deref().unwrap_or("TEXT");
    let type_name = if column.auto_increment {
        serial_type(type_name)
    } else {
        type_name.to_string()
    };
    let mut parts = vec![quote_ident(&column.name), type_name];

    if column.constraints.nullable == Some(false) {
        parts.push("NOT NULL".to_string());
    }

    if column.constraints.unique && !column.constraints.primary_key {
        parts.push("UNIQUE".to_string());
    }

    if let Some(ref default) = column.default {
        if !column.auto_increment {
            parts.push(format!("DEFAULT {}", default.to_sql()));
        }
    }

    parts.join(" ")
}

/// Maps an integer type onto its sequence-backed counterpart.
fn serial_type(type_name: &str) -> String {
    match type_name.trim().to_lowercase().as_str() {
        "smallint" | "int2" | "smallserial" => "SMALLSERIAL".to_string(),
        "integer" | "int" | "int4" | "serial" => "SERIAL".to_string(),
        _ => "BIGSERIAL".to_string(),
    }
}

fn format_column_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn quote_ident(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

pub fn quote_qualified(schema: &str, name: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(name))
}

fn quote_table(table: &TableRef) -> String {
    quote_qualified(table.schema_or_default(), &table.name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::DefaultValue;
    use crate::model::ReferentialAction;

    #[test]
    fn create_table_generates_valid_sql() {
        let changes = vec![Change::CreateTable {
            table: TableRef::new("orders"),
            columns: vec![
                ColumnConfig::new("id", "BIGINT").primary_key(),
                ColumnConfig::new("status", "VARCHAR(32)").not_null(),
            ],
        }];

        let sql = generate_sql(&changes);
        assert_eq!(sql.len(), 1);
        assert_eq!(
            sql[0],
            "CREATE TABLE \"public\".\"orders\" (\n    \"id\" BIGINT NOT NULL,\n    \"status\" VARCHAR(32) NOT NULL,\n    PRIMARY KEY (\"id\")\n);"
        );
    }

    #[test]
    fn named_primary_key_uses_constraint_clause() {
        let mut id = ColumnConfig::new("id", "BIGINT").primary_key();
        id.constraints.primary_key_name = Some("orders_pk".to_string());
        let sql = generate_sql(&[Change::CreateTable {
            table: TableRef::new("orders"),
            columns: vec![id],
        }]);
        assert!(sql[0].contains("CONSTRAINT \"orders_pk\" PRIMARY KEY (\"id\")"));
    }

    #[test]
    fn auto_increment_column_becomes_serial() {
        let mut id = ColumnConfig::new("id", "BIGINT").primary_key();
        id.auto_increment = true;
        id.default = Some(DefaultValue::Computed("nextval('x')".to_string()));
        let sql = generate_sql(&[Change::AddColumn {
            table: TableRef::new("orders"),
            columns: vec![id],
        }]);
        assert_eq!(
            sql,
            vec![
                "ALTER TABLE \"public\".\"orders\" ADD COLUMN \"id\" BIGSERIAL NOT NULL;",
                "ALTER TABLE \"public\".\"orders\" ADD PRIMARY KEY (\"id\");"
            ]
        );
    }

    #[test]
    fn drop_table_respects_cascade() {
        let sql = generate_sql(&[Change::DropTable {
            table: TableRef::qualified("sales", "orders"),
            cascade: true,
        }]);
        assert_eq!(sql[0], "DROP TABLE \"sales\".\"orders\" CASCADE;");
    }

    #[test]
    fn foreign_key_includes_actions() {
        let sql = generate_sql(&[Change::AddForeignKeyConstraint {
            table: TableRef::new("orders"),
            base_columns: vec!["customer_id".to_string()],
            constraint_name: "fk_orders_customer".to_string(),
            referenced_table: TableRef::new("customers"),
            referenced_columns: vec!["id".to_string()],
            on_delete: Some(ReferentialAction::Cascade),
            on_update: None,
        }]);
        assert_eq!(
            sql[0],
            "ALTER TABLE \"public\".\"orders\" ADD CONSTRAINT \"fk_orders_customer\" FOREIGN KEY (\"customer_id\") REFERENCES \"public\".\"customers\" (\"id\") ON DELETE CASCADE;"
        );
    }

    #[test]
    fn drop_primary_key_defaults_constraint_name() {
        let sql = generate_sql(&[Change::DropPrimaryKey {
            table: TableRef::new("orders"),
            constraint_name: None,
        }]);
        assert_eq!(
            sql[0],
            "ALTER TABLE \"public\".\"orders\" DROP CONSTRAINT \"orders_pkey\";"
        );
    }

    #[test]
    fn literal_default_is_escaped() {
        let sql = generate_sql(&[Change::AddDefaultValue {
            table: TableRef::new("orders"),
            column: "note".to_string(),
            value: DefaultValue::Literal("it's".to_string()),
        }]);
        assert_eq!(
            sql[0],
            "ALTER TABLE \"public\".\"orders\" ALTER COLUMN \"note\" SET DEFAULT 'it''s';"
        );
    }

    #[test]
    fn format_statement_collapses_when_not_pretty() {
        let sql = "CREATE TABLE x (\n    id BIGINT\n);";
        assert_eq!(format_statement(sql, false), "CREATE TABLE x ( id BIGINT );");
        assert_eq!(format_statement(sql, true), sql);
    }

    #[test]
    fn quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
