#![allow(unused_imports, dead_code)]

pub use schemacheck::changelog::{
    load_changelog, update, write_changelog, Change, ChangeLog, ChangeSet, ColumnConfig,
    DefaultValue, TableRef, UpdateOptions,
};
pub use schemacheck::diff::diff_databases;
pub use schemacheck::discover::INDEX_RESOURCE;
pub use schemacheck::materialize::{materialize, MaterializeOptions};
pub use schemacheck::pg::connection::{ConnectionInfo, PgConnection};
pub use schemacheck::pg::introspect::introspect_schema;
pub use schemacheck::prelude::*;
pub use schemacheck::provision::Environment;
pub use serde_json::json;
pub use sqlx::Executor;
pub use std::path::{Path, PathBuf};
pub use tempfile::TempDir;
pub use testcontainers::runners::AsyncRunner;
pub use testcontainers::ContainerAsync;
pub use testcontainers_modules::postgres::Postgres;

pub async fn setup_postgres() -> (ContainerAsync<Postgres>, ConnectionInfo) {
    let container = Postgres::default().start().await.unwrap();
    let port = container.get_host_port_ipv4(5432).await.unwrap();
    let info = ConnectionInfo::new("localhost", port, "postgres", "postgres", "postgres");
    (container, info)
}

/// Two independent databases: source and target.
pub async fn setup_pair() -> (
    (ContainerAsync<Postgres>, ConnectionInfo),
    (ContainerAsync<Postgres>, ConnectionInfo),
) {
    tokio::join!(setup_postgres(), setup_postgres())
}

pub fn column(name: &str, sql_type: &str) -> serde_json::Value {
    json!({ "name": name, "sql_type": sql_type })
}

pub fn id_column() -> serde_json::Value {
    json!({ "name": "id", "sql_type": "bigint", "nullable": false, "primary_key": true })
}

pub fn entity(class: &str, mapping: serde_json::Value) -> (String, serde_json::Value) {
    (class.to_string(), mapping)
}

/// Writes an exploded artifact carrying an entity index for `entities`.
pub fn write_artifact(root: &Path, name: &str, entities: &[(String, serde_json::Value)]) -> PathBuf {
    let annotations: Vec<_> = entities
        .iter()
        .map(|(class, _)| json!({ "name": "jakarta.persistence.Entity", "target": class }))
        .collect();
    let classes: serde_json::Map<String, serde_json::Value> = entities
        .iter()
        .map(|(class, mapping)| {
            (
                class.clone(),
                json!({
                    "name": class,
                    "annotations": ["jakarta.persistence.Entity"],
                    "mapping": mapping,
                }),
            )
        })
        .collect();
    let index = json!({
        "annotations": { "jakarta.persistence.Entity": annotations },
        "classes": classes,
    });

    let artifact = root.join(name);
    let resource = artifact.join(INDEX_RESOURCE);
    std::fs::create_dir_all(resource.parent().unwrap()).unwrap();
    std::fs::write(&resource, serde_json::to_vec_pretty(&index).unwrap()).unwrap();
    artifact
}

pub fn orders_mapping() -> serde_json::Value {
    json!({
        "table": "orders",
        "columns": [id_column(), column("status", "varchar(32)")],
    })
}

/// A changelog creating `orders` the way [`orders_mapping`] maps it, plus the
/// given extra tables with a single id column.
pub fn write_source_changelog(root: &Path, extra_tables: &[&str]) -> PathBuf {
    let path = root.join("db").join("changeLog.xml");
    let mut changelog = ChangeLog::new(path.to_string_lossy());
    let mut tables = vec![Change::CreateTable {
        table: TableRef::new("orders"),
        columns: vec![
            ColumnConfig::new("id", "BIGINT").primary_key(),
            ColumnConfig::new("status", "VARCHAR(32)"),
        ],
    }];
    for name in extra_tables {
        tables.push(Change::CreateTable {
            table: TableRef::new(*name),
            columns: vec![ColumnConfig::new("id", "BIGINT").primary_key()],
        });
    }
    for (n, change) in tables.into_iter().enumerate() {
        changelog
            .change_sets
            .push(ChangeSet::new(format!("init-{}", n + 1), "dev", vec![change]));
    }
    write_changelog(&path, &changelog).unwrap();
    path
}

pub fn diff_options(
    dir: &TempDir,
    artifacts: Vec<PathBuf>,
    changelog_file: PathBuf,
    source: &ConnectionInfo,
    target: &ConnectionInfo,
) -> DiffOptions {
    DiffOptions::default()
        .with_changelog_file(changelog_file)
        .with_output_file(dir.path().join("target").join("schema-diff-changelog.xml"))
        .with_artifacts(
            artifacts
                .into_iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect(),
        )
        .with_external(source.clone(), target.clone())
}

pub fn skip(entries: &[&str]) -> CheckOptions {
    CheckOptions::default().with_skip_rules(SkipRules::parse(entries).unwrap())
}
