//! Aggregated class metadata contributed by dependency artifacts.
//!
//! Every artifact may ship a precomputed index fragment describing the
//! classes it contains, which annotations they carry, and, for persistent
//! entities, how they map onto tables. Fragments are merged into one
//! [`EntityIndex`] per run.

use crate::model::ReferentialAction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Marker annotations identifying persistent entities.
pub const ENTITY_ANNOTATIONS: &[&str] = &["jakarta.persistence.Entity", "javax.persistence.Entity"];

/// Marker annotations for superclasses whose columns are inherited by entities.
pub const MAPPED_SUPERCLASS_ANNOTATIONS: &[&str] = &[
    "jakarta.persistence.MappedSuperclass",
    "javax.persistence.MappedSuperclass",
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityIndex {
    /// Annotation name to every usage of it.
    pub annotations: BTreeMap<String, Vec<AnnotationInstance>>,
    /// Class name to its direct subclasses.
    pub subclasses: BTreeMap<String, Vec<String>>,
    /// Interface name to its implementors.
    pub implementors: BTreeMap<String, Vec<String>>,
    pub classes: BTreeMap<String, ClassInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AnnotationInstance {
    pub name: String,
    /// Fully-qualified name of the annotated class.
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassInfo {
    pub name: String,
    #[serde(default)]
    pub superclass: Option<String>,
    #[serde(default)]
    pub interfaces: Vec<String>,
    #[serde(default)]
    pub annotations: Vec<String>,
    #[serde(default)]
    pub mapping: Option<EntityMapping>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityMapping {
    /// Defaults to the snake_cased simple class name.
    pub table: Option<String>,
    pub schema: Option<String>,
    pub columns: Vec<ColumnMapping>,
    pub indexes: Vec<IndexMapping>,
    pub foreign_keys: Vec<ForeignKeyMapping>,
    /// Column holding the tenant identifier of tenant-discriminated entities.
    pub tenant_discriminator: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub name: String,
    pub sql_type: String,
    #[serde(default = "default_true")]
    pub nullable: bool,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub default: Option<String>,
    /// Value drawn from an implicit sequence.
    #[serde(default)]
    pub generated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMapping {
    pub name: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyMapping {
    pub name: String,
    pub columns: Vec<String>,
    pub referenced_table: String,
    #[serde(default)]
    pub referenced_schema: Option<String>,
    #[serde(default = "default_referenced_columns")]
    pub referenced_columns: Vec<String>,
    #[serde(default)]
    pub on_delete: ReferentialAction,
    #[serde(default)]
    pub on_update: ReferentialAction,
}

fn default_true() -> bool {
    true
}

fn default_referenced_columns() -> Vec<String> {
    vec!["id".to_string()]
}

fn merge_lists<T>(target: &mut BTreeMap<String, Vec<T>>, source: BTreeMap<String, Vec<T>>) {
    for (key, values) in source {
        target.entry(key).or_default().extend(values);
    }
}

impl EntityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    /// Merges `other` into this index. List values are concatenated with the
    /// existing entries first; class entries from `other` replace existing ones
    /// of the same name. Duplicates are kept.
    pub fn merge(&mut self, other: EntityIndex) {
        merge_lists(&mut self.annotations, other.annotations);
        merge_lists(&mut self.subclasses, other.subclasses);
        merge_lists(&mut self.implementors, other.implementors);
        self.classes.extend(other.classes);
    }

    pub fn merged(mut self, other: EntityIndex) -> Self {
        self.merge(other);
        self
    }

    pub fn annotated(&self, annotation: &str) -> &[AnnotationInstance] {
        self.annotations
            .get(annotation)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn has_annotation(&self, class: &ClassInfo, markers: &[&str]) -> bool {
        class.annotations.iter().any(|a| markers.contains(&a.as_str()))
            || markers
                .iter()
                .any(|m| self.annotated(m).iter().any(|a| a.target == class.name))
    }

    /// Whether `class` carries an entity marker, either in the annotation
    /// usage map or on its own class entry.
    pub fn is_entity(&self, class: &ClassInfo) -> bool {
        self.has_annotation(class, ENTITY_ANNOTATIONS)
    }

    /// Names of all classes carrying an entity marker. Targets of the usage
    /// map come first, in merge order; classes marked only on their own entry
    /// follow in name order.
    pub fn entity_class_names(&self) -> Vec<String> {
        let mut names: Vec<String> = ENTITY_ANNOTATIONS
            .iter()
            .flat_map(|marker| self.annotated(marker))
            .map(|annotation| annotation.target.clone())
            .collect();
        let listed: BTreeSet<String> = names.iter().cloned().collect();
        names.extend(
            self.classes
                .values()
                .filter(|class| !listed.contains(&class.name) && self.is_entity(class))
                .map(|class| class.name.clone()),
        );
        names
    }

    /// The mapping of `class_name` with the columns of mapped superclasses
    /// prepended, nearest ancestor last.
    pub fn resolve_mapping(&self, class_name: &str) -> Option<EntityMapping> {
        let class = self.classes.get(class_name)?;
        let mut mapping = class.mapping.clone()?;

        let mut inherited = Vec::new();
        let mut visited = vec![class_name.to_string()];
        let mut current = class.superclass.clone();
        while let Some(parent_name) = current {
            if visited.contains(&parent_name) {
                break;
            }
            let Some(parent) = self.classes.get(&parent_name) else {
                break;
            };
            if self.has_annotation(parent, MAPPED_SUPERCLASS_ANNOTATIONS) {
                if let Some(parent_mapping) = &parent.mapping {
                    let mut columns = parent_mapping.columns.clone();
                    columns.extend(inherited);
                    inherited = columns;
                }
            }
            visited.push(parent_name);
            current = parent.superclass.clone();
        }

        inherited.retain(|c: &ColumnMapping| !mapping.columns.iter().any(|own| own.name == c.name));
        inherited.extend(mapping.columns);
        mapping.columns = inherited;
        if mapping.table.is_none() {
            mapping.table = Some(default_table_name(class_name));
        }
        Some(mapping)
    }
}

/// `com.acme.PurchaseOrder` maps to `purchase_order`.
pub fn default_table_name(class_name: &str) -> String {
    let simple = class_name.rsplit(['.', '$']).next().unwrap_or(class_name);
    let mut out = String::with_capacity(simple.len() + 4);
    for (i, ch) in simple.chars().enumerate() {
        if ch.is_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}
