//! schemacheck - reconcile a changelog-built PostgreSQL schema with entity mappings.
//!
//! Two disposable databases are brought up: the source replays the project's
//! changelog, the target is materialized from the entity mappings shipped in
//! dependency artifacts. Their structural difference is written as a changelog
//! document, and a check decides whether what remains is acceptable.
//!
//! # Quick Start
//!
//! ```no_run
//! use schemacheck::prelude::*;
//!
//! # async fn run() -> schemacheck::util::Result<()> {
//! let diff = DiffOptions::default().with_artifacts(vec!["target/deps/*".into()]);
//! let check = CheckOptions::default()
//!     .with_skip_rules(SkipRules::parse(&["dropTable=legacy_audit"])?);
//!
//! match run_verify(&diff, &check).await? {
//!     Reconciliation::Pass => println!("schema is in sync"),
//!     Reconciliation::Fail { unresolved, .. } => println!("{} changes to resolve", unresolved.len()),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`index`] / [`discover`] - Entity index fragments and their discovery
//! - [`provision`] - Disposable database containers
//! - [`materialize`] - Schema creation from entity mappings
//! - [`changelog`] - Changelog documents and their replay
//! - [`diff`] - Structural diff between two databases
//! - [`reconcile`] - Skip rules and the pass/fail decision
//! - [`workflow`] - The `diff`, `check` and `verify` runs

pub mod changelog;
pub mod diff;
pub mod discover;
pub mod index;
pub mod materialize;
pub mod model;
pub mod pg;
pub mod prelude;
pub mod provision;
pub mod reconcile;
pub mod util;
pub mod workflow;
