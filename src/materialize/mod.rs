//! Builds a live schema from entity mappings.
//!
//! Materializing is create-drop: every mapped table is dropped if present and
//! recreated, and the returned [`SchemaSession`] drops the tables again when
//! it is closed.

use crate::changelog::{Change, ColumnConfig, DefaultValue, TableRef};
use crate::index::{EntityIndex, EntityMapping};
use crate::model::PgType;
use crate::pg::connection::{ConnectionInfo, PgConnection};
use crate::pg::sqlgen::{format_statement, generate_sql, quote_ident, quote_qualified};
use sqlx::Executor;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

use crate::util::{Result, SchemaError};

/// Tenant every session is bound to.
pub const TENANT_ID: &str = "base";

/// Session parameter carrying the tenant identifier.
pub const TENANT_PARAMETER: &str = "app.tenant_id";

const TENANT_COLUMN_TYPE: &str = "VARCHAR(255)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterializeOptions {
    /// Log each DDL statement at info level.
    pub show_sql: bool,
    /// Multi-line statement layout.
    pub format_sql: bool,
    pub tenant_id: String,
}

impl Default for MaterializeOptions {
    fn default() -> Self {
        Self {
            show_sql: true,
            format_sql: true,
            tenant_id: TENANT_ID.to_string(),
        }
    }
}

impl MaterializeOptions {
    pub fn show_sql(mut self, show_sql: bool) -> Self {
        self.show_sql = show_sql;
        self
    }

    pub fn format_sql(mut self, format_sql: bool) -> Self {
        self.format_sql = format_sql;
        self
    }
}

/// DDL needed to materialize a set of entities, grouped by phase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaterializationPlan {
    pub tables: Vec<TableRef>,
    pub changes: Vec<Change>,
}

impl MaterializationPlan {
    /// Schemas the plan creates tables in, always including `public`.
    pub fn schemas(&self) -> Vec<String> {
        let mut schemas: BTreeSet<String> = self
            .tables
            .iter()
            .map(|t| t.schema_or_default().to_string())
            .collect();
        schemas.insert("public".to_string());
        schemas.into_iter().collect()
    }
}

/// Resolves every entity to its mapping and plans drop, create, index and
/// foreign key statements in that order.
pub fn plan(index: &EntityIndex, entities: &[String]) -> Result<MaterializationPlan> {
    let mut seen = BTreeSet::new();
    let mut mapped: Vec<(String, EntityMapping)> = Vec::new();
    for entity in entities {
        if !seen.insert(entity.as_str()) {
            continue;
        }
        if !index.classes.contains_key(entity) {
            return Err(SchemaError::Materialize(format!(
                "Unknown entity class {entity}"
            )));
        }
        let mapping = index.resolve_mapping(entity).ok_or_else(|| {
            SchemaError::Materialize(format!("Entity class {entity} has no mapping"))
        })?;
        mapped.push((entity.clone(), mapping));
    }

    let mut plan = MaterializationPlan::default();
    let mut owners: Vec<(TableRef, &str)> = Vec::new();
    let mut creates = Vec::new();
    let mut indexes = Vec::new();
    let mut foreign_keys = Vec::new();

    for (entity, mapping) in &mapped {
        let table = table_ref(mapping);
        if let Some((_, owner)) = owners.iter().find(|(t, _)| *t == table) {
            return Err(SchemaError::Materialize(format!(
                "Entity classes {owner} and {entity} both map to table {}.{}",
                table.schema_or_default(),
                table.name
            )));
        }
        owners.push((table.clone(), entity.as_str()));

        if mapping.columns.is_empty() && mapping.tenant_discriminator.is_none() {
            return Err(SchemaError::Materialize(format!(
                "Entity class {entity} maps no columns"
            )));
        }

        creates.push(Change::CreateTable {
            table: table.clone(),
            columns: column_configs(mapping),
        });

        for index in &mapping.indexes {
            indexes.push(Change::CreateIndex {
                table: table.clone(),
                index_name: index.name.clone(),
                columns: index.columns.clone(),
                unique: index.unique,
            });
        }

        for fk in &mapping.foreign_keys {
            let referenced_schema = fk
                .referenced_schema
                .clone()
                .unwrap_or_else(|| table.schema_or_default().to_string());
            foreign_keys.push(Change::AddForeignKeyConstraint {
                table: table.clone(),
                base_columns: fk.columns.clone(),
                constraint_name: fk.name.clone(),
                referenced_table: TableRef::qualified(referenced_schema, &fk.referenced_table),
                referenced_columns: fk.referenced_columns.clone(),
                on_delete: Some(fk.on_delete),
                on_update: Some(fk.on_update),
            });
        }

        plan.tables.push(table);
    }

    for schema in plan.schemas().iter().filter(|s| *s != "public") {
        plan.changes.push(Change::Sql {
            sql: format!("CREATE SCHEMA IF NOT EXISTS {};", quote_ident(schema)),
        });
    }
    for table in &plan.tables {
        plan.changes.push(Change::Sql {
            sql: format!(
                "DROP TABLE IF EXISTS {} CASCADE;",
                quote_qualified(table.schema_or_default(), &table.name)
            ),
        });
    }
    plan.changes.extend(creates);
    plan.changes.extend(indexes);
    plan.changes.extend(foreign_keys);
    Ok(plan)
}

fn table_ref(mapping: &EntityMapping) -> TableRef {
    let name = mapping.table.clone().unwrap_or_default();
    TableRef::qualified(
        mapping.schema.clone().unwrap_or_else(|| "public".to_string()),
        name,
    )
}

fn column_configs(mapping: &EntityMapping) -> Vec<ColumnConfig> {
    let mut columns: Vec<ColumnConfig> = mapping
        .columns
        .iter()
        .map(|c| {
            let data_type = PgType::parse(&c.sql_type);
            let mut column = ColumnConfig::new(&c.name, data_type.to_string());
            column.constraints.nullable = Some(c.nullable && !c.primary_key);
            column.constraints.primary_key = c.primary_key;
            column.constraints.unique = c.unique;
            column.auto_increment = c.generated || PgType::is_serial(&c.sql_type);
            column.default = c.default.as_deref().map(DefaultValue::from_expression);
            column
        })
        .collect();

    if let Some(discriminator) = &mapping.tenant_discriminator {
        if !columns.iter().any(|c| &c.name == discriminator) {
            columns.push(ColumnConfig::new(discriminator, TENANT_COLUMN_TYPE).not_null());
        }
    }
    columns
}

/// Live handle on a materialized schema.
pub struct SchemaSession {
    connection: PgConnection,
    plan: MaterializationPlan,
}

impl SchemaSession {
    pub fn connection(&self) -> &PgConnection {
        &self.connection
    }

    pub fn tables(&self) -> &[TableRef] {
        &self.plan.tables
    }

    pub fn schemas(&self) -> Vec<String> {
        self.plan.schemas()
    }

    /// Drops the created tables and releases the connection. Failures are
    /// logged; the tables disappear with the database anyway.
    pub async fn close(self) {
        for table in self.plan.tables.iter().rev() {
            let sql = format!(
                "DROP TABLE IF EXISTS {} CASCADE",
                quote_qualified(table.schema_or_default(), &table.name)
            );
            if let Err(e) = self.connection.pool().execute(sql.as_str()).await {
                warn!("Failed to drop {}: {e}", table.name);
            }
        }
        self.connection.close().await;
    }
}

/// Connects to `target` bound to the configured tenant and materializes the
/// mappings of `entities`.
pub async fn materialize(
    target: &ConnectionInfo,
    index: &EntityIndex,
    entities: &[String],
    options: &MaterializeOptions,
) -> Result<SchemaSession> {
    info!("Execute target database update from entity mappings.");
    let plan = plan(index, entities)?;

    let connect_options = target
        .connect_options()
        .statement_cache_capacity(0)
        .options([(TENANT_PARAMETER, options.tenant_id.as_str())]);
    let connection = PgConnection::with_options(target, connect_options).await?;

    for statement in generate_sql(&plan.changes) {
        let statement = format_statement(&statement, options.format_sql);
        if options.show_sql {
            info!("{statement}");
        } else {
            debug!("{statement}");
        }
        if let Err(e) = connection.pool().execute(statement.as_str()).await {
            connection.close().await;
            return Err(SchemaError::Materialize(format!(
                "Failed to execute {statement}: {e}"
            )));
        }
    }

    info!("Materialized {} tables", plan.tables.len());
    Ok(SchemaSession { connection, plan })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{ClassInfo, ColumnMapping, ForeignKeyMapping, IndexMapping};
    use crate::model::ReferentialAction;

    fn column(name: &str, sql_type: &str) -> ColumnMapping {
        ColumnMapping {
            name: name.to_string(),
            sql_type: sql_type.to_string(),
            nullable: true,
            primary_key: false,
            unique: false,
            default: None,
            generated: false,
        }
    }

    fn id() -> ColumnMapping {
        ColumnMapping {
            primary_key: true,
            nullable: false,
            ..column("id", "bigint")
        }
    }

    fn add_entity(index: &mut EntityIndex, class: &str, mapping: EntityMapping) {
        index.classes.insert(
            class.to_string(),
            ClassInfo {
                name: class.to_string(),
                superclass: None,
                interfaces: Vec::new(),
                annotations: vec!["jakarta.persistence.Entity".to_string()],
                mapping: Some(mapping),
            },
        );
    }

    fn shop_index() -> EntityIndex {
        let mut index = EntityIndex::new();
        add_entity(
            &mut index,
            "shop.Customer",
            EntityMapping {
                table: Some("customers".to_string()),
                columns: vec![id(), column("email", "varchar(255)")],
                ..Default::default()
            },
        );
        add_entity(
            &mut index,
            "shop.Order",
            EntityMapping {
                table: Some("orders".to_string()),
                columns: vec![id(), column("customer_id", "bigint")],
                indexes: vec![IndexMapping {
                    name: "idx_orders_customer".to_string(),
                    columns: vec!["customer_id".to_string()],
                    unique: false,
                }],
                foreign_keys: vec![ForeignKeyMapping {
                    name: "fk_orders_customer".to_string(),
                    columns: vec!["customer_id".to_string()],
                    referenced_table: "customers".to_string(),
                    referenced_schema: None,
                    referenced_columns: vec!["id".to_string()],
                    on_delete: ReferentialAction::Cascade,
                    on_update: ReferentialAction::NoAction,
                }],
                tenant_discriminator: Some("tenant_id".to_string()),
                ..Default::default()
            },
        );
        index
    }

    #[test]
    fn plan_orders_drop_create_index_foreign_key() {
        let entities = vec!["shop.Order".to_string(), "shop.Customer".to_string()];
        let plan = plan(&shop_index(), &entities).unwrap();

        let kinds: Vec<_> = plan.changes.iter().map(|c| c.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                "sql",
                "sql",
                "createTable",
                "createTable",
                "createIndex",
                "addForeignKeyConstraint"
            ]
        );
        assert_eq!(plan.schemas(), vec!["public".to_string()]);
    }

    #[test]
    fn tenant_discriminator_column_is_added() {
        let plan = plan(&shop_index(), &["shop.Order".to_string()]).unwrap();
        let Change::CreateTable { columns, .. } = &plan.changes[1] else {
            panic!("expected createTable, got {:?}", plan.changes[1]);
        };
        let tenant = columns.iter().find(|c| c.name == "tenant_id").unwrap();
        assert_eq!(tenant.type_name.as_deref(), Some("VARCHAR(255)"));
        assert_eq!(tenant.constraints.nullable, Some(false));
    }

    #[test]
    fn mapped_type_spellings_are_normalized() {
        let mut index = EntityIndex::new();
        add_entity(
            &mut index,
            "shop.Ticket",
            EntityMapping {
                table: Some("tickets".to_string()),
                columns: vec![
                    ColumnMapping {
                        primary_key: true,
                        nullable: false,
                        ..column("id", "serial")
                    },
                    column("amount", "decimal(12,2)"),
                    column("code", "character varying(16)"),
                    column("opened_at", "timestamp(6) with time zone"),
                    column("tags", "citext"),
                ],
                ..Default::default()
            },
        );

        let plan = plan(&index, &["shop.Ticket".to_string()]).unwrap();
        let Change::CreateTable { columns, .. } = &plan.changes[1] else {
            panic!("expected createTable, got {:?}", plan.changes[1]);
        };
        let types: Vec<_> = columns
            .iter()
            .map(|c| c.type_name.as_deref().unwrap_or_default())
            .collect();
        assert_eq!(
            types,
            vec![
                "INTEGER",
                "NUMERIC(12, 2)",
                "VARCHAR(16)",
                "TIMESTAMP WITH TIME ZONE",
                "CITEXT"
            ]
        );
        assert!(columns[0].auto_increment);
        assert!(!columns[1].auto_increment);
    }

    #[test]
    fn duplicate_entities_are_mapped_once() {
        let entities = vec!["shop.Customer".to_string(), "shop.Customer".to_string()];
        let plan = plan(&shop_index(), &entities).unwrap();
        assert_eq!(plan.tables.len(), 1);
    }

    #[test]
    fn unknown_entity_is_fatal() {
        let err = plan(&shop_index(), &["shop.Missing".to_string()]).unwrap_err();
        assert!(matches!(err, SchemaError::Materialize(_)));
    }

    #[test]
    fn two_entities_on_one_table_is_fatal() {
        let mut index = shop_index();
        add_entity(
            &mut index,
            "shop.LegacyOrder",
            EntityMapping {
                table: Some("orders".to_string()),
                columns: vec![id()],
                ..Default::default()
            },
        );
        let entities = vec!["shop.Order".to_string(), "shop.LegacyOrder".to_string()];
        let err = plan(&index, &entities).unwrap_err();
        assert!(err.to_string().contains("both map to table public.orders"));
    }

    #[test]
    fn non_public_schema_is_created_first() {
        let mut index = EntityIndex::new();
        add_entity(
            &mut index,
            "billing.Invoice",
            EntityMapping {
                table: Some("invoices".to_string()),
                schema: Some("billing".to_string()),
                columns: vec![id()],
                ..Default::default()
            },
        );
        let plan = plan(&index, &["billing.Invoice".to_string()]).unwrap();
        assert_eq!(
            plan.changes[0],
            Change::Sql {
                sql: "CREATE SCHEMA IF NOT EXISTS \"billing\";".to_string()
            }
        );
        assert_eq!(
            plan.schemas(),
            vec!["billing".to_string(), "public".to_string()]
        );
    }
}
