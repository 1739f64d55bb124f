use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use schemacheck::changelog::UpdateOptions;
use schemacheck::materialize::MaterializeOptions;
use schemacheck::pg::connection::ConnectionInfo;
use schemacheck::provision::ProvisionConfig;
use schemacheck::reconcile::{Reconciliation, SkipRules};
use schemacheck::workflow::{
    self, CheckOptions, DiffOptions, DEFAULT_CHANGELOG_FILE, DEFAULT_HELP_MESSAGE,
    DEFAULT_OUTPUT_FILE,
};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "schemacheck")]
#[command(
    about = "Diff a changelog-built PostgreSQL schema against entity mappings",
    long_about = None
)]
struct Cli {
    /// Debug-level logging
    #[arg(long, global = true, env = "SCHEMACHECK_VERBOSE")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a changelog with the difference between changelog and entities
    Diff(DiffArgs),

    /// Check a generated changelog for unresolved changes
    Check(CheckArgs),

    /// Diff, then check the generated changelog
    Verify {
        #[command(flatten)]
        diff: DiffArgs,
        #[command(flatten)]
        reconcile: ReconcileArgs,
    },
}

#[derive(Args)]
struct DiffArgs {
    /// Changelog replayed into the source database
    #[arg(long, env = "SCHEMACHECK_CHANGELOG_FILE", default_value = DEFAULT_CHANGELOG_FILE)]
    changelog_file: PathBuf,

    /// Where the generated changelog is written
    #[arg(long, env = "SCHEMACHECK_OUTPUT_FILE", default_value = DEFAULT_OUTPUT_FILE)]
    output_file: PathBuf,

    /// Tag of the postgres image
    #[arg(long, env = "SCHEMACHECK_POSTGRES_VERSION", default_value = "16-alpine")]
    postgres_version: String,

    /// Log the generated entity DDL
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    show_sql: bool,

    /// Multi-line DDL layout
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    format_sql: bool,

    /// Record changesets under the fixed `dev` author
    #[arg(long, env = "SCHEMACHECK_DEV_USER", default_value_t = true, action = ArgAction::Set)]
    dev_user: bool,

    /// Artifact directory, entity index file or glob pattern (repeatable)
    #[arg(long = "artifact")]
    artifacts: Vec<String>,

    /// Use an existing source database instead of a container
    #[arg(long, env = "SCHEMACHECK_SOURCE_URL", requires = "target_url")]
    source_url: Option<String>,

    /// Use an existing target database instead of a container
    #[arg(long, env = "SCHEMACHECK_TARGET_URL", requires = "source_url")]
    target_url: Option<String>,
}

#[derive(Args)]
struct ReconcileArgs {
    /// Expected difference as KIND=NAME[,NAME...] (repeatable)
    #[arg(
        long = "skip-change",
        env = "SCHEMACHECK_SKIP_CHANGES",
        value_delimiter = ';'
    )]
    skip_changes: Vec<String>,

    /// Hint shown when unresolved changes remain
    #[arg(long, env = "SCHEMACHECK_HELP_MESSAGE", default_value = DEFAULT_HELP_MESSAGE)]
    help_message: String,
}

#[derive(Args)]
struct CheckArgs {
    /// Changelog to check
    #[arg(long, env = "SCHEMACHECK_CHECK_FILE", default_value = DEFAULT_OUTPUT_FILE)]
    changelog_file: PathBuf,

    #[command(flatten)]
    reconcile: ReconcileArgs,
}

impl DiffArgs {
    fn into_options(self) -> Result<DiffOptions> {
        let external = match (self.source_url, self.target_url) {
            (Some(source), Some(target)) => Some((
                ConnectionInfo::from_url(&source)?,
                ConnectionInfo::from_url(&target)?,
            )),
            _ => None,
        };

        Ok(DiffOptions {
            changelog_file: self.changelog_file,
            output_file: self.output_file,
            artifacts: self.artifacts,
            provision: ProvisionConfig::default().with_postgres_version(self.postgres_version),
            materialize: MaterializeOptions::default()
                .show_sql(self.show_sql)
                .format_sql(self.format_sql),
            update: UpdateOptions {
                show_sql: self.show_sql,
            },
            dev_user: self.dev_user,
            external,
        })
    }
}

impl ReconcileArgs {
    fn into_options(self, changelog_file: PathBuf) -> Result<CheckOptions> {
        Ok(CheckOptions {
            changelog_file,
            skip_rules: SkipRules::parse(&self.skip_changes)?,
            help_message: self.help_message,
        })
    }
}

fn setup_logging(verbose: bool) {
    let level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn finish(outcome: Reconciliation) -> Result<()> {
    match outcome {
        Reconciliation::Pass => Ok(()),
        Reconciliation::Fail { .. } => bail!("Check report status: INVALID"),
    }
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Diff(args) => {
            let options = args.into_options()?;
            let changelog = workflow::run_diff(&options)
                .await
                .context("Schema diff failed")?;
            info!(
                "Generated {} changesets in {}",
                changelog.change_sets.len(),
                options.output_file.display()
            );
            Ok(())
        }
        Commands::Check(args) => {
            let options = args.reconcile.into_options(args.changelog_file)?;
            finish(workflow::run_check(&options)?)
        }
        Commands::Verify { diff, reconcile } => {
            let diff = diff.into_options()?;
            let check = reconcile.into_options(diff.output_file.clone())?;
            let outcome = workflow::run_verify(&diff, &check)
                .await
                .context("Schema verification failed")?;
            finish(outcome)
        }
    }
}
