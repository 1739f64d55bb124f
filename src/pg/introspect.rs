//! Catalog snapshot of the tables in a set of schemas.
//!
//! Each object kind is fetched with one query over all requested schemas and
//! attached to its table; rows for tables outside the snapshot (the tracking
//! tables) are dropped.

use crate::model::*;
use crate::pg::connection::PgConnection;
use crate::util::{Result, SchemaError};
use sqlx::postgres::PgRow;
use sqlx::Row;
use std::collections::BTreeMap;

/// Tables maintained by the changelog runner itself; never part of a diff.
pub const TRACKING_TABLES: &[&str] = &["databasechangelog", "databasechangeloglock"];

type Tables = BTreeMap<String, Table>;

pub async fn introspect_schema(
    connection: &PgConnection,
    target_schemas: &[String],
) -> Result<Schema> {
    let mut tables = fetch_tables(connection, target_schemas).await?;
    if tables.is_empty() {
        return Ok(Schema::new());
    }

    attach_columns(connection, target_schemas, &mut tables).await?;
    attach_primary_keys(connection, target_schemas, &mut tables).await?;
    attach_indexes(connection, target_schemas, &mut tables).await?;
    attach_foreign_keys(connection, target_schemas, &mut tables).await?;

    for table in tables.values_mut() {
        table.indexes.sort();
        table.foreign_keys.sort();
    }
    Ok(Schema { tables })
}

async fn fetch_rows(
    connection: &PgConnection,
    what: &str,
    sql: &str,
    target_schemas: &[String],
) -> Result<Vec<PgRow>> {
    sqlx::query(sql)
        .bind(target_schemas)
        .fetch_all(connection.pool())
        .await
        .map_err(|e| SchemaError::DatabaseError(format!("Failed to fetch {what}: {e}")))
}

/// The snapshot table a catalog row belongs to, if it is part of the snapshot.
fn owner<'a>(tables: &'a mut Tables, row: &PgRow) -> Option<&'a mut Table> {
    let schema: String = row.get("table_schema");
    let name: String = row.get("table_name");
    tables.get_mut(&format!("{schema}.{name}"))
}

async fn fetch_tables(connection: &PgConnection, target_schemas: &[String]) -> Result<Tables> {
    let rows = fetch_rows(
        connection,
        "tables",
        r#"
        SELECT table_schema, table_name
        FROM information_schema.tables
        WHERE table_schema = ANY($1::text[]) AND table_type = 'BASE TABLE'
        "#,
        target_schemas,
    )
    .await?;

    let mut tables = Tables::new();
    for row in &rows {
        let schema: String = row.get("table_schema");
        let name: String = row.get("table_name");
        if TRACKING_TABLES.contains(&name.as_str()) {
            continue;
        }
        let table = Table::new(schema, name);
        tables.insert(table.qualified_name(), table);
    }
    Ok(tables)
}

async fn attach_columns(
    connection: &PgConnection,
    target_schemas: &[String],
    tables: &mut Tables,
) -> Result<()> {
    let rows = fetch_rows(
        connection,
        "columns",
        r#"
        SELECT table_schema, table_name, column_name, data_type,
               character_maximum_length, numeric_precision, numeric_scale,
               is_nullable, column_default, udt_name
        FROM information_schema.columns
        WHERE table_schema = ANY($1::text[])
        ORDER BY table_schema, table_name, ordinal_position
        "#,
        target_schemas,
    )
    .await?;

    for row in &rows {
        let Some(table) = owner(tables, row) else {
            continue;
        };
        let data_type: String = row.get("data_type");
        let char_max_length: Option<i32> = row.get("character_maximum_length");
        let numeric_precision: Option<i32> = row.get("numeric_precision");
        let numeric_scale: Option<i32> = row.get("numeric_scale");
        let udt_name: String = row.get("udt_name");

        table.columns.push(Column {
            name: row.get("column_name"),
            data_type: map_pg_type(
                &data_type,
                char_max_length,
                numeric_precision.zip(numeric_scale),
                &udt_name,
            ),
            nullable: row.get::<String, _>("is_nullable") == "YES",
            default: row.get("column_default"),
        });
    }
    Ok(())
}

fn map_pg_type(
    data_type: &str,
    char_max_length: Option<i32>,
    numeric: Option<(i32, i32)>,
    udt_name: &str,
) -> PgType {
    let length = char_max_length.map(|l| l as u32);
    match data_type {
        "smallint" => PgType::SmallInt,
        "integer" => PgType::Integer,
        "bigint" => PgType::BigInt,
        "numeric" => PgType::Numeric(numeric.map(|(p, s)| (p as u32, s as u32))),
        "real" => PgType::Real,
        "double precision" => PgType::DoublePrecision,
        "boolean" => PgType::Boolean,
        "character" => PgType::Char(length),
        "character varying" => PgType::Varchar(length),
        "text" => PgType::Text,
        "bytea" => PgType::Bytea,
        "date" => PgType::Date,
        "time without time zone" => PgType::Time,
        "timestamp without time zone" => PgType::Timestamp,
        "timestamp with time zone" => PgType::TimestampTz,
        "uuid" => PgType::Uuid,
        "json" => PgType::Json,
        "jsonb" => PgType::Jsonb,
        _ => PgType::Other(udt_name.to_string()),
    }
}

async fn attach_primary_keys(
    connection: &PgConnection,
    target_schemas: &[String],
    tables: &mut Tables,
) -> Result<()> {
    let rows = fetch_rows(
        connection,
        "primary keys",
        r#"
        SELECT n.nspname AS table_schema, c.relname AS table_name,
               con.conname AS name,
               array_agg(a.attname ORDER BY array_position(i.indkey, a.attnum)) AS columns
        FROM pg_index i
        JOIN pg_class c ON c.oid = i.indrelid
        JOIN pg_namespace n ON n.oid = c.relnamespace
        JOIN pg_attribute a ON a.attrelid = c.oid AND a.attnum = ANY(i.indkey)
        LEFT JOIN pg_constraint con ON con.conindid = i.indexrelid AND con.contype = 'p'
        WHERE n.nspname = ANY($1::text[]) AND i.indisprimary
        GROUP BY n.nspname, c.relname, i.indexrelid, con.conname
        "#,
        target_schemas,
    )
    .await?;

    for row in &rows {
        if let Some(table) = owner(tables, row) {
            table.primary_key = Some(PrimaryKey {
                name: row.get("name"),
                columns: row.get("columns"),
            });
        }
    }
    Ok(())
}

async fn attach_indexes(
    connection: &PgConnection,
    target_schemas: &[String],
    tables: &mut Tables,
) -> Result<()> {
    let rows = fetch_rows(
        connection,
        "indexes",
        r#"
        SELECT n.nspname AS table_schema, t.relname AS table_name,
               i.relname AS index_name, ix.indisunique AS is_unique,
               array_agg(a.attname ORDER BY array_position(ix.indkey, a.attnum)) AS columns
        FROM pg_index ix
        JOIN pg_class t ON t.oid = ix.indrelid
        JOIN pg_class i ON i.oid = ix.indexrelid
        JOIN pg_namespace n ON n.oid = t.relnamespace
        JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(ix.indkey)
        WHERE n.nspname = ANY($1::text[]) AND NOT ix.indisprimary
        GROUP BY n.nspname, t.relname, i.relname, ix.indisunique
        "#,
        target_schemas,
    )
    .await?;

    for row in &rows {
        if let Some(table) = owner(tables, row) {
            table.indexes.push(Index {
                name: row.get("index_name"),
                columns: row.get("columns"),
                unique: row.get("is_unique"),
            });
        }
    }
    Ok(())
}

async fn attach_foreign_keys(
    connection: &PgConnection,
    target_schemas: &[String],
    tables: &mut Tables,
) -> Result<()> {
    let rows = fetch_rows(
        connection,
        "foreign keys",
        r#"
        SELECT n.nspname AS table_schema, class.relname AS table_name,
               con.conname AS name,
               ref_n.nspname AS referenced_schema, ref_class.relname AS referenced_table,
               array_agg(att.attname ORDER BY u.ord) AS columns,
               array_agg(ref_att.attname ORDER BY u.ord) AS referenced_columns,
               con.confdeltype, con.confupdtype
        FROM pg_constraint con
        JOIN pg_class class ON class.oid = con.conrelid
        JOIN pg_namespace n ON n.oid = class.relnamespace
        JOIN pg_class ref_class ON ref_class.oid = con.confrelid
        JOIN pg_namespace ref_n ON ref_n.oid = ref_class.relnamespace
        CROSS JOIN LATERAL unnest(con.conkey, con.confkey)
            WITH ORDINALITY AS u(attnum, ref_attnum, ord)
        JOIN pg_attribute att ON att.attrelid = class.oid AND att.attnum = u.attnum
        JOIN pg_attribute ref_att ON ref_att.attrelid = ref_class.oid AND ref_att.attnum = u.ref_attnum
        WHERE n.nspname = ANY($1::text[]) AND con.contype = 'f'
        GROUP BY n.nspname, class.relname, con.conname, ref_n.nspname, ref_class.relname,
                 con.confdeltype, con.confupdtype
        "#,
        target_schemas,
    )
    .await?;

    for row in &rows {
        let on_delete = map_referential_action(row.get::<i8, _>("confdeltype") as u8 as char)?;
        let on_update = map_referential_action(row.get::<i8, _>("confupdtype") as u8 as char)?;
        if let Some(table) = owner(tables, row) {
            table.foreign_keys.push(ForeignKey {
                name: row.get("name"),
                columns: row.get("columns"),
                referenced_schema: row.get("referenced_schema"),
                referenced_table: row.get("referenced_table"),
                referenced_columns: row.get("referenced_columns"),
                on_delete,
                on_update,
            });
        }
    }
    Ok(())
}

fn map_referential_action(action: char) -> Result<ReferentialAction> {
    match action {
        'a' => Ok(ReferentialAction::NoAction),
        'r' => Ok(ReferentialAction::Restrict),
        'c' => Ok(ReferentialAction::Cascade),
        'n' => Ok(ReferentialAction::SetNull),
        'd' => Ok(ReferentialAction::SetDefault),
        _ => Err(SchemaError::DatabaseError(format!(
            "Unknown referential action code from PostgreSQL: '{action}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_information_schema_types() {
        assert_eq!(
            map_pg_type("character varying", Some(255), None, "varchar"),
            PgType::Varchar(Some(255))
        );
        assert_eq!(
            map_pg_type("numeric", None, Some((19, 2)), "numeric"),
            PgType::Numeric(Some((19, 2)))
        );
        assert_eq!(
            map_pg_type("USER-DEFINED", None, None, "citext"),
            PgType::Other("citext".to_string())
        );
    }

    #[test]
    fn unknown_referential_action_is_an_error() {
        assert!(map_referential_action('x').is_err());
        assert_eq!(
            map_referential_action('c').unwrap(),
            ReferentialAction::Cascade
        );
    }
}
