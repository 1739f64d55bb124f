//! Decides whether a generated diff is acceptable.
//!
//! Only table creation and removal can be pre-approved, per table name. Every
//! other change is unresolved and fails the check.

use crate::changelog::{Change, ChangeLog};
use crate::util::{Result, SchemaError};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, warn};

/// Change kinds a skip rule can exempt.
pub const SKIPPABLE_KINDS: &[&str] = &["createTable", "dropTable"];

/// Change kind to the table names exempted for it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SkipRules {
    rules: BTreeMap<String, BTreeSet<String>>,
}

impl SkipRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `kind=name1,name2` entries. A later entry for the same kind adds
    /// to the earlier ones.
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self> {
        let mut rules = Self::new();
        for entry in entries {
            let entry = entry.as_ref();
            let (kind, names) = entry.split_once('=').ok_or_else(|| {
                SchemaError::Config(format!(
                    "Invalid skip rule '{entry}', expected KIND=NAME[,NAME...]"
                ))
            })?;
            rules.insert(kind.trim(), names);
        }
        Ok(rules)
    }

    /// Adds the comma-separated `names` under `kind`. Blank names are ignored;
    /// if none remain, nothing is added.
    pub fn insert(&mut self, kind: &str, names: &str) {
        let names: BTreeSet<String> = names
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();
        if names.is_empty() {
            debug!("Skip rule for {kind} lists no names, ignoring it");
            return;
        }
        if !SKIPPABLE_KINDS.contains(&kind) {
            warn!(
                "Skip rule for {kind} has no effect: only {} changes can be skipped",
                SKIPPABLE_KINDS.join(" and ")
            );
        }
        self.rules.entry(kind.to_string()).or_default().extend(names);
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn names(&self, kind: &str) -> Option<&BTreeSet<String>> {
        self.rules.get(kind)
    }

    /// Whether `change` is a pre-approved difference.
    pub fn allows(&self, change: &Change) -> bool {
        let kind = change.kind();
        if !SKIPPABLE_KINDS.contains(&kind) {
            return false;
        }
        match (self.rules.get(kind), change.table_name()) {
            (Some(names), Some(table)) => names.contains(table),
            _ => false,
        }
    }
}

impl fmt::Display for SkipRules {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries: Vec<String> = self
            .rules
            .iter()
            .map(|(kind, names)| {
                let names: Vec<&str> = names.iter().map(String::as_str).collect();
                format!("{kind}=[{}]", names.join(", "))
            })
            .collect();
        write!(f, "{{{}}}", entries.join(", "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    Pass,
    Fail {
        /// Changes left after removing exempted ones, in document order.
        unresolved: Vec<Change>,
        /// The document with exempted changes and emptied changesets removed.
        changelog: ChangeLog,
    },
}

impl Reconciliation {
    pub fn is_pass(&self) -> bool {
        matches!(self, Reconciliation::Pass)
    }
}

/// Strips exempted changes from `changelog` and decides the outcome. Every
/// changeset is scanned even after the first unresolved change.
pub fn reconcile(mut changelog: ChangeLog, rules: &SkipRules) -> Reconciliation {
    let mut unresolved = Vec::new();

    for change_set in &mut changelog.change_sets {
        change_set.changes.retain(|change| {
            if rules.allows(change) {
                debug!(
                    "Skipping expected {} of {}",
                    change.kind(),
                    change.table_name().unwrap_or_default()
                );
                false
            } else {
                unresolved.push(change.clone());
                true
            }
        });
    }
    changelog.change_sets.retain(|change_set| !change_set.changes.is_empty());

    if unresolved.is_empty() {
        Reconciliation::Pass
    } else {
        Reconciliation::Fail {
            unresolved,
            changelog,
        }
    }
}
