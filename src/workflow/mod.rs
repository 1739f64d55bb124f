//! The `diff`, `check` and `verify` runs.
//!
//! A diff run provisions two databases, replays the changelog into the
//! source, materializes the entity mappings into the target, and writes the
//! difference as a changelog document. A check run reconciles such a document
//! against the skip rules. Verify is a diff followed by a check of its output.

use crate::changelog::{load_changelog, serialize_change_sets, update, ChangeLog, UpdateOptions};
use crate::diff::{changeset_author, diff_databases, to_change_sets, write_diff};
use crate::discover::{discover_entities, Discovery};
use crate::materialize::{materialize, MaterializeOptions, SchemaSession};
use crate::pg::connection::{ConnectionInfo, PgConnection};
use crate::provision::{Environment, ProvisionConfig};
use crate::reconcile::{reconcile, Reconciliation, SkipRules};
use crate::util::Result;
use chrono::Utc;
use std::path::PathBuf;
use tracing::info;

/// Delimiter framing each phase in the log.
pub const LOG_LINE: &str = "--------------------------------------------------------------";

pub const DEFAULT_CHANGELOG_FILE: &str = "src/main/resources/db/changeLog.xml";
pub const DEFAULT_OUTPUT_FILE: &str = "target/schema-diff-changelog.xml";
pub const DEFAULT_HELP_MESSAGE: &str =
    "To generate the changes in the 'target/schema-diff-changelog.xml' file, run: 'schemacheck diff'";

fn phase(title: &str) {
    info!("{LOG_LINE}");
    info!("{title}");
    info!("{LOG_LINE}");
}

#[derive(Debug, Clone)]
pub struct DiffOptions {
    /// Changelog replayed into the source database. May be absent.
    pub changelog_file: PathBuf,
    /// Where the generated changelog is written.
    pub output_file: PathBuf,
    /// Artifact directories, index files or glob patterns.
    pub artifacts: Vec<String>,
    pub provision: ProvisionConfig,
    pub materialize: MaterializeOptions,
    pub update: UpdateOptions,
    /// Record generated changesets under the fixed `dev` author.
    pub dev_user: bool,
    /// Externally managed source and target databases. No containers are
    /// started when set.
    pub external: Option<(ConnectionInfo, ConnectionInfo)>,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            changelog_file: PathBuf::from(DEFAULT_CHANGELOG_FILE),
            output_file: PathBuf::from(DEFAULT_OUTPUT_FILE),
            artifacts: Vec::new(),
            provision: ProvisionConfig::default(),
            materialize: MaterializeOptions::default(),
            update: UpdateOptions::default(),
            dev_user: true,
            external: None,
        }
    }
}

impl DiffOptions {
    pub fn with_changelog_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.changelog_file = path.into();
        self
    }

    pub fn with_output_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_file = path.into();
        self
    }

    pub fn with_artifacts(mut self, artifacts: Vec<String>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn with_external(mut self, source: ConnectionInfo, target: ConnectionInfo) -> Self {
        self.external = Some((source, target));
        self
    }
}

#[derive(Debug, Clone)]
pub struct CheckOptions {
    /// Changelog to reconcile, usually the output of a diff run.
    pub changelog_file: PathBuf,
    pub skip_rules: SkipRules,
    /// Remediation hint shown when unresolved changes remain.
    pub help_message: String,
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self {
            changelog_file: PathBuf::from(DEFAULT_OUTPUT_FILE),
            skip_rules: SkipRules::default(),
            help_message: DEFAULT_HELP_MESSAGE.to_string(),
        }
    }
}

impl CheckOptions {
    pub fn with_skip_rules(mut self, skip_rules: SkipRules) -> Self {
        self.skip_rules = skip_rules;
        self
    }

    pub fn with_changelog_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.changelog_file = path.into();
        self
    }
}

/// Runs a diff and returns the changelog written to the output file.
pub async fn run_diff(options: &DiffOptions) -> Result<ChangeLog> {
    let discovery = discover_entities(&options.artifacts)?;

    let mut environment = match &options.external {
        Some((source, target)) => Environment::external(source.clone(), target.clone()),
        None => {
            phase("Start docker containers.");
            Environment::start(&options.provision).await?
        }
    };

    let result = diff_environment(&environment, &discovery, options).await;
    environment.stop().await;
    result
}

async fn diff_environment(
    environment: &Environment,
    discovery: &Discovery,
    options: &DiffOptions,
) -> Result<ChangeLog> {
    let source = PgConnection::from_info(environment.source()).await?;

    phase("Execute source and target database update.");
    let (updated, session) = tokio::join!(
        update(&source, &options.changelog_file, &options.update),
        materialize(
            environment.target(),
            &discovery.index,
            &discovery.entities,
            &options.materialize
        )
    );

    let session = match session {
        Ok(session) => session,
        Err(e) => {
            source.close().await;
            return Err(e);
        }
    };

    let result = match updated {
        Ok(report) => {
            info!(
                "Applied {} changesets, {} already applied",
                report.applied.len(),
                report.already_applied
            );
            compare(&source, &session, options).await
        }
        Err(e) => Err(e),
    };

    session.close().await;
    source.close().await;
    result
}

async fn compare(
    source: &PgConnection,
    session: &SchemaSession,
    options: &DiffOptions,
) -> Result<ChangeLog> {
    phase(&format!(
        "Execute source-target database diff. Output: {}",
        options.output_file.display()
    ));
    let changes = diff_databases(source, session.connection(), &session.schemas()).await?;
    let author = changeset_author(options.dev_user);
    let change_sets = to_change_sets(changes, &author, Utc::now().timestamp_millis());
    write_diff(&options.output_file, change_sets)
}

/// Reconciles the changelog file named by `options`.
pub fn run_check(options: &CheckOptions) -> Result<Reconciliation> {
    info!("Start changes check.");
    let changelog = load_changelog(&options.changelog_file)?;
    let outcome = check_changelog(changelog, options)?;
    info!("Finished changes check.");
    Ok(outcome)
}

/// Reconciles `changelog` and reports the outcome. Unresolved changes are
/// printed to stdout as a changelog document between framed log lines.
pub fn check_changelog(changelog: ChangeLog, options: &CheckOptions) -> Result<Reconciliation> {
    if !options.skip_rules.is_empty() {
        info!("Skip changes: {}", options.skip_rules);
    }

    let outcome = reconcile(changelog, &options.skip_rules);
    match &outcome {
        Reconciliation::Pass => info!("No unresolved changes found."),
        Reconciliation::Fail {
            unresolved,
            changelog,
        } => {
            let document = serialize_change_sets(&changelog.change_sets)?;
            phase(&format!("Changes to resolve! ({} unresolved)", unresolved.len()));
            println!("{document}");
            phase(&options.help_message);
        }
    }
    Ok(outcome)
}

/// Diff followed by a check of the generated changelog.
pub async fn run_verify(diff: &DiffOptions, check: &CheckOptions) -> Result<Reconciliation> {
    let changelog = run_diff(diff).await?;
    check_changelog(changelog, check)
}
