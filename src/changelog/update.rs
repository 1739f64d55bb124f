use super::xml::{load_changelog, serialize_changes};
use super::{ChangeLog, ChangeSet};
use crate::pg::connection::PgConnection;
use crate::pg::sqlgen::generate_sql;
use crate::util::{Result, SchemaError};
use sha2::{Digest, Sha256};
use sqlx::{Executor, Row};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{debug, info};

const TRACKING_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS "public"."databasechangelog" (
    "id" VARCHAR(255) NOT NULL,
    "author" VARCHAR(255) NOT NULL,
    "filename" VARCHAR(255) NOT NULL,
    "dateexecuted" TIMESTAMP NOT NULL,
    "orderexecuted" INTEGER NOT NULL,
    "md5sum" VARCHAR(80),
    "description" VARCHAR(255)
)"#;

#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    /// Log every statement before it runs.
    pub show_sql: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateReport {
    /// False when there was no changelog file to apply.
    pub changelog_found: bool,
    /// Ids of the changesets applied by this run, in order.
    pub applied: Vec<String>,
    /// Changesets already recorded in the tracking table.
    pub already_applied: usize,
}

type ChangeSetKey = (String, String, String);

fn key_of(change_set: &ChangeSet) -> ChangeSetKey {
    (
        change_set.id.clone(),
        change_set.author.clone(),
        change_set.path.clone(),
    )
}

/// Checksum of a changeset's changes, recorded when it is applied.
pub fn checksum(change_set: &ChangeSet) -> Result<String> {
    let serialized = serialize_changes(&change_set.changes)?;
    let hash = Sha256::digest(serialized.as_bytes());
    Ok(format!("sha256:{}", hex::encode(hash)))
}

/// Brings the database up to date with the changelog at `path`.
///
/// A missing file is not an error: the project has no migration history yet.
pub async fn update(
    connection: &PgConnection,
    path: &Path,
    options: &UpdateOptions,
) -> Result<UpdateReport> {
    if !path.exists() {
        info!(
            "No changelog at {}, source database stays empty",
            path.display()
        );
        return Ok(UpdateReport::default());
    }

    info!("Execute source database update from file: {}", path.display());
    let changelog = load_changelog(path)?;
    apply_changelog(connection, &changelog, options).await
}

/// Applies every pending changeset of `changelog` in declaration order. The
/// first failing changeset aborts the run; nothing after it is applied.
pub async fn apply_changelog(
    connection: &PgConnection,
    changelog: &ChangeLog,
    options: &UpdateOptions,
) -> Result<UpdateReport> {
    check_unique_identities(changelog)?;

    connection
        .pool()
        .execute(TRACKING_TABLE_DDL)
        .await
        .map_err(|e| {
            SchemaError::DatabaseError(format!("Failed to create changelog tracking table: {e}"))
        })?;

    let recorded = fetch_recorded(connection).await?;
    let mut order = recorded.len() as i32;
    let mut report = UpdateReport {
        changelog_found: true,
        ..Default::default()
    };

    for change_set in &changelog.change_sets {
        let computed = checksum(change_set)?;
        let key = key_of(change_set);

        if let Some(stored) = recorded.get(&key) {
            if let Some(stored) = stored.as_ref().filter(|s| **s != computed) {
                return Err(SchemaError::ChangeLog(format!(
                    "Changeset {}::{}::{} was modified after it was applied (stored {stored}, computed {computed})",
                    change_set.path, change_set.id, change_set.author
                )));
            }
            debug!("Changeset {} already applied", change_set.id);
            report.already_applied += 1;
            continue;
        }

        order += 1;
        apply_change_set(connection, change_set, &computed, order, options).await?;
        info!(
            "ChangeSet {}::{}::{} ran successfully",
            change_set.path, change_set.id, change_set.author
        );
        report.applied.push(change_set.id.clone());
    }

    Ok(report)
}

fn check_unique_identities(changelog: &ChangeLog) -> Result<()> {
    let mut seen = HashSet::new();
    for change_set in &changelog.change_sets {
        if !seen.insert(key_of(change_set)) {
            return Err(SchemaError::ChangeLog(format!(
                "Duplicate changeset identifier {}::{}::{}",
                change_set.path, change_set.id, change_set.author
            )));
        }
    }
    Ok(())
}

async fn fetch_recorded(
    connection: &PgConnection,
) -> Result<HashMap<ChangeSetKey, Option<String>>> {
    let rows = sqlx::query(
        r#"SELECT "id", "author", "filename", "md5sum" FROM "public"."databasechangelog""#,
    )
    .fetch_all(connection.pool())
    .await
    .map_err(|e| SchemaError::DatabaseError(format!("Failed to read applied changesets: {e}")))?;

    Ok(rows
        .into_iter()
        .map(|row| {
            let key: ChangeSetKey = (row.get("id"), row.get("author"), row.get("filename"));
            (key, row.get::<Option<String>, _>("md5sum"))
        })
        .collect())
}

async fn apply_change_set(
    connection: &PgConnection,
    change_set: &ChangeSet,
    checksum: &str,
    order: i32,
    options: &UpdateOptions,
) -> Result<()> {
    let fail = |what: &str, e: sqlx::Error| {
        SchemaError::ChangeLog(format!(
            "Changeset {}::{}::{} failed to {what}: {e}",
            change_set.path, change_set.id, change_set.author
        ))
    };

    let mut transaction = connection
        .pool()
        .begin()
        .await
        .map_err(|e| fail("begin a transaction", e))?;

    for statement in generate_sql(&change_set.changes) {
        if options.show_sql {
            info!("{statement}");
        } else {
            debug!("{statement}");
        }
        (&mut *transaction)
            .execute(statement.as_str())
            .await
            .map_err(|e| fail("execute", e))?;
    }

    let description = change_set
        .changes
        .iter()
        .map(|c| c.kind())
        .collect::<Vec<_>>()
        .join("; ");
    sqlx::query(
        r#"
        INSERT INTO "public"."databasechangelog"
            ("id", "author", "filename", "dateexecuted", "orderexecuted", "md5sum", "description")
        VALUES ($1, $2, $3, now(), $4, $5, $6)
        "#,
    )
    .bind(&change_set.id)
    .bind(&change_set.author)
    .bind(&change_set.path)
    .bind(order)
    .bind(checksum)
    .bind(description)
    .execute(&mut *transaction)
    .await
    .map_err(|e| fail("record its execution", e))?;

    transaction
        .commit()
        .await
        .map_err(|e| fail("commit", e))
}
