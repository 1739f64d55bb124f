//! Convenient re-exports for common schemacheck usage.

// Runs
pub use crate::workflow::{check_changelog, run_check, run_diff, run_verify};

// Options
pub use crate::changelog::UpdateOptions;
pub use crate::materialize::MaterializeOptions;
pub use crate::provision::ProvisionConfig;
pub use crate::workflow::{CheckOptions, DiffOptions};

// Outcomes
pub use crate::reconcile::{Reconciliation, SkipRules};

// Core types
pub use crate::changelog::{Change, ChangeLog, ChangeSet, TableRef};
pub use crate::index::EntityIndex;
pub use crate::pg::connection::ConnectionInfo;
pub use crate::util::SchemaError;
