mod common;
use common::*;

#[tokio::test]
async fn new_entity_without_changelog_is_unresolved() {
    let ((_s, source), (_t, target)) = setup_pair().await;
    let dir = TempDir::new().unwrap();
    let artifact = write_artifact(
        dir.path(),
        "shop",
        &[entity("shop.Order", orders_mapping())],
    );
    let options = diff_options(
        &dir,
        vec![artifact],
        dir.path().join("db").join("absent.xml"),
        &source,
        &target,
    );

    let outcome = run_verify(&options, &skip(&[])).await.unwrap();

    let Reconciliation::Fail {
        unresolved,
        changelog,
    } = outcome
    else {
        panic!("expected FAIL");
    };
    assert_eq!(unresolved.len(), 1);
    assert_eq!(unresolved[0].kind(), "createTable");
    assert_eq!(unresolved[0].table_name(), Some("orders"));
    assert_eq!(changelog.change_sets.len(), 1);
    assert!(options.output_file.exists());
}

#[tokio::test]
async fn skipped_create_table_passes() {
    let ((_s, source), (_t, target)) = setup_pair().await;
    let dir = TempDir::new().unwrap();
    let artifact = write_artifact(
        dir.path(),
        "shop",
        &[entity("shop.Order", orders_mapping())],
    );
    let options = diff_options(
        &dir,
        vec![artifact],
        dir.path().join("db").join("absent.xml"),
        &source,
        &target,
    );

    let outcome = run_verify(&options, &skip(&["createTable=orders"]))
        .await
        .unwrap();
    assert_eq!(outcome, Reconciliation::Pass);
}

#[tokio::test]
async fn skipped_drop_table_passes() {
    let ((_s, source), (_t, target)) = setup_pair().await;
    let dir = TempDir::new().unwrap();
    let changelog_file = write_source_changelog(dir.path(), &["customers"]);
    let artifact = write_artifact(
        dir.path(),
        "shop",
        &[entity("shop.Order", orders_mapping())],
    );
    let options = diff_options(&dir, vec![artifact], changelog_file, &source, &target);

    let diff = run_diff(&options).await.unwrap();
    let changes: Vec<_> = diff
        .change_sets
        .iter()
        .flat_map(|cs| cs.changes.iter())
        .collect();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].kind(), "dropTable");
    assert_eq!(changes[0].table_name(), Some("customers"));

    let outcome = check_changelog(diff, &skip(&["dropTable=customers,legacy_x"])).unwrap();
    assert!(outcome.is_pass());
}

#[tokio::test]
async fn leftover_change_keeps_only_its_change_set() {
    let ((_s, source), (_t, target)) = setup_pair().await;
    let dir = TempDir::new().unwrap();
    let changelog_file = write_source_changelog(dir.path(), &["customers"]);
    let artifact = write_artifact(
        dir.path(),
        "shop",
        &[entity(
            "shop.Order",
            json!({
                "table": "orders",
                "columns": [id_column(), column("status", "varchar(32)"), column("note", "text")],
            }),
        )],
    );
    let options = diff_options(&dir, vec![artifact], changelog_file, &source, &target);

    let outcome = run_verify(&options, &skip(&["dropTable=customers"]))
        .await
        .unwrap();

    let Reconciliation::Fail { changelog, .. } = outcome else {
        panic!("expected FAIL");
    };
    assert_eq!(changelog.change_sets.len(), 1);
    let remaining = &changelog.change_sets[0].changes;
    assert_eq!(remaining.len(), 1);
    let Change::AddColumn { table, columns } = &remaining[0] else {
        panic!("expected addColumn, got {:?}", remaining[0]);
    };
    assert_eq!(table.name, "orders");
    assert_eq!(columns[0].name, "note");
}

#[tokio::test]
async fn matching_changelog_and_entities_pass_without_skip_rules() {
    let ((_s, source), (_t, target)) = setup_pair().await;
    let dir = TempDir::new().unwrap();
    let changelog_file = write_source_changelog(dir.path(), &[]);
    let artifact = write_artifact(
        dir.path(),
        "shop",
        &[entity("shop.Order", orders_mapping())],
    );
    let options = diff_options(&dir, vec![artifact], changelog_file, &source, &target);

    let diff = run_diff(&options).await.unwrap();
    assert!(diff.is_empty());
    assert!(check_changelog(diff, &skip(&[])).unwrap().is_pass());
}

#[tokio::test]
async fn materialized_tables_are_dropped_on_close() {
    let (_container, target) = setup_postgres().await;
    let dir = TempDir::new().unwrap();
    let artifact = write_artifact(
        dir.path(),
        "shop",
        &[entity("shop.Order", orders_mapping())],
    );
    let discovery =
        schemacheck::discover::discover_entities(&[artifact.to_string_lossy().into_owned()])
            .unwrap();

    let session = materialize(
        &target,
        &discovery.index,
        &discovery.entities,
        &MaterializeOptions::default(),
    )
    .await
    .unwrap();
    let tenant: (String,) = sqlx::query_as("SELECT current_setting('app.tenant_id')")
        .fetch_one(session.connection().pool())
        .await
        .unwrap();
    assert_eq!(tenant.0, "base");
    session.close().await;

    let connection = PgConnection::from_info(&target).await.unwrap();
    let schema = introspect_schema(&connection, &["public".to_string()])
        .await
        .unwrap();
    assert!(schema.tables.is_empty());
}

#[tokio::test]
async fn managed_environment_starts_and_stops() {
    let mut environment = Environment::start(&ProvisionConfig::default())
        .await
        .unwrap();
    let connection = PgConnection::from_info(environment.source()).await.unwrap();
    connection.pool().execute("SELECT 1").await.unwrap();
    connection.close().await;

    environment.stop().await;
    environment.stop().await;
    assert!(!environment.is_managed());
}

#[tokio::test]
async fn failed_replay_still_drops_materialized_tables() {
    let ((_s, source), (_t, target)) = setup_pair().await;
    let dir = TempDir::new().unwrap();
    let changelog_file = dir.path().join("db").join("changeLog.xml");
    let mut changelog = ChangeLog::new(changelog_file.to_string_lossy());
    changelog.change_sets.push(ChangeSet::new(
        "broken-1",
        "dev",
        vec![Change::DropTable {
            table: TableRef::new("never_created"),
            cascade: false,
        }],
    ));
    write_changelog(&changelog_file, &changelog).unwrap();
    let artifact = write_artifact(
        dir.path(),
        "shop",
        &[entity("shop.Order", orders_mapping())],
    );
    let options = diff_options(&dir, vec![artifact], changelog_file, &source, &target);

    let err = run_diff(&options).await.unwrap_err();

    assert!(matches!(err, SchemaError::ChangeLog(_)), "got {err:?}");
    assert!(!options.output_file.exists());
    let connection = PgConnection::from_info(&target).await.unwrap();
    let schema = introspect_schema(&connection, &["public".to_string()])
        .await
        .unwrap();
    assert!(schema.tables.is_empty(), "left behind: {:?}", schema.tables.keys());
}

#[tokio::test]
async fn failed_materialization_reports_and_writes_nothing() {
    let ((_s, source), (_t, target)) = setup_pair().await;
    let dir = TempDir::new().unwrap();
    let changelog_file = write_source_changelog(dir.path(), &[]);
    let artifact = write_artifact(
        dir.path(),
        "shop",
        &[entity("shop.Empty", json!({ "table": "empty", "columns": [] }))],
    );
    let options = diff_options(&dir, vec![artifact], changelog_file, &source, &target);

    let err = run_diff(&options).await.unwrap_err();

    assert!(matches!(err, SchemaError::Materialize(_)), "got {err:?}");
    assert!(!options.output_file.exists());
}

#[tokio::test]
async fn introspection_covers_every_requested_schema() {
    let (_container, info) = setup_postgres().await;
    let connection = PgConnection::from_info(&info).await.unwrap();
    for statement in [
        "CREATE SCHEMA sales",
        "CREATE TABLE customers (id BIGINT PRIMARY KEY, email VARCHAR(255) UNIQUE)",
        "CREATE TABLE sales.orders (id BIGSERIAL PRIMARY KEY, customer_id BIGINT, total NUMERIC(10, 2) NOT NULL DEFAULT 0)",
        "ALTER TABLE sales.orders ADD CONSTRAINT fk_orders_customer FOREIGN KEY (customer_id) REFERENCES customers (id) ON DELETE CASCADE",
        "CREATE INDEX idx_orders_customer ON sales.orders (customer_id)",
        "CREATE TABLE databasechangelog (id VARCHAR(255))",
    ] {
        connection.pool().execute(statement).await.unwrap();
    }

    let schema = introspect_schema(&connection, &["public".to_string(), "sales".to_string()])
        .await
        .unwrap();

    let names: Vec<_> = schema.tables.keys().cloned().collect();
    assert_eq!(names, vec!["public.customers", "sales.orders"]);

    let customers = &schema.tables["public.customers"];
    assert_eq!(customers.primary_key.as_ref().unwrap().columns, vec!["id"]);
    assert_eq!(customers.indexes.len(), 1);
    assert!(customers.indexes[0].unique);

    let orders = &schema.tables["sales.orders"];
    let columns: Vec<_> = orders.columns.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(columns, vec!["id", "customer_id", "total"]);
    assert_eq!(orders.indexes[0].name, "idx_orders_customer");
    let fk = &orders.foreign_keys[0];
    assert_eq!(fk.referenced_schema, "public");
    assert_eq!(fk.referenced_table, "customers");
    assert_eq!(fk.on_delete, schemacheck::model::ReferentialAction::Cascade);
    connection.close().await;
}
