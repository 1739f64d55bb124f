use super::{
    Change, ChangeLog, ChangeSet, ColumnConfig, ColumnConstraints, DefaultValue, TableRef,
};
use crate::model::ReferentialAction;
use crate::util::{Result, SchemaError};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::reader::Reader;
use quick_xml::writer::Writer;
use std::path::{Path, PathBuf};
use tracing::debug;

const NAMESPACE: &str = "http://www.liquibase.org/xml/ns/dbchangelog";
const SCHEMA_LOCATION: &str = "http://www.liquibase.org/xml/ns/dbchangelog http://www.liquibase.org/xml/ns/dbchangelog/dbchangelog-latest.xsd";
const XSI_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema-instance";

// ============================================================================
// Reading
// ============================================================================

#[derive(Debug, Default)]
struct Element {
    name: String,
    attributes: Vec<(String, String)>,
    children: Vec<Element>,
    text: String,
}

impl Element {
    fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn required(&self, key: &str) -> Result<String> {
        self.attr(key).map(str::to_string).ok_or_else(|| {
            SchemaError::ChangeLog(format!(
                "<{}> is missing required attribute '{key}'",
                self.name
            ))
        })
    }

    fn flag(&self, key: &str) -> bool {
        self.attr(key)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }
}

fn xml_error(context: &str, e: impl std::fmt::Display) -> SchemaError {
    SchemaError::ChangeLog(format!("{context}: {e}"))
}

fn read_start(e: &BytesStart<'_>) -> Result<Element> {
    let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
    let mut attributes = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| xml_error("Malformed attribute", e))?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).to_string();
        let value = attr
            .unescape_value()
            .map_err(|e| xml_error("Malformed attribute value", e))?
            .to_string();
        attributes.push((key, value));
    }
    Ok(Element {
        name,
        attributes,
        ..Default::default()
    })
}

fn parse_tree(text: &str) -> Result<Element> {
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => stack.push(read_start(&e)?),
            Ok(Event::Empty(e)) => {
                let element = read_start(&e)?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => root = Some(element),
                }
            }
            Ok(Event::End(_)) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| SchemaError::ChangeLog("Unbalanced closing tag".to_string()))?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => root = Some(element),
                }
            }
            Ok(Event::Text(t)) => {
                if let Some(current) = stack.last_mut() {
                    let value = t.unescape().map_err(|e| xml_error("Malformed text", e))?;
                    current.text.push_str(&value);
                }
            }
            Ok(Event::CData(c)) => {
                if let Some(current) = stack.last_mut() {
                    current
                        .text
                        .push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(xml_error(
                    &format!("XML error at position {}", reader.buffer_position()),
                    e,
                ))
            }
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(SchemaError::ChangeLog(format!(
            "Unclosed element <{}>",
            stack[stack.len() - 1].name
        )));
    }
    root.ok_or_else(|| SchemaError::ChangeLog("Empty changelog document".to_string()))
}

/// Parses a changelog document. `<include>` elements are not followed; use
/// [`load_changelog`] for files on disk.
pub fn parse_changelog(text: &str, path: &str) -> Result<ChangeLog> {
    let root = parse_tree(text)?;
    let mut changelog = ChangeLog::new(path);
    collect_change_sets(&root, path, None, &mut changelog)?;
    Ok(changelog)
}

/// Reads a changelog file, following `<include file="...">` elements.
pub fn load_changelog(path: &Path) -> Result<ChangeLog> {
    let mut changelog = ChangeLog::new(path.to_string_lossy());
    load_into(path, &mut changelog, &mut Vec::new())?;
    Ok(changelog)
}

fn load_into(path: &Path, changelog: &mut ChangeLog, visiting: &mut Vec<PathBuf>) -> Result<()> {
    if visiting.iter().any(|p| p == path) {
        return Err(SchemaError::ChangeLog(format!(
            "Changelog {} includes itself",
            path.display()
        )));
    }
    visiting.push(path.to_path_buf());

    let text = std::fs::read_to_string(path).map_err(|e| SchemaError::io(path, e))?;
    let root = parse_tree(&text)?;
    let logical = path.to_string_lossy().to_string();
    collect_change_sets(&root, &logical, Some((path, &mut *visiting)), changelog)?;

    visiting.pop();
    Ok(())
}

fn collect_change_sets(
    root: &Element,
    path: &str,
    mut includes: Option<(&Path, &mut Vec<PathBuf>)>,
    changelog: &mut ChangeLog,
) -> Result<()> {
    if root.name != "databaseChangeLog" {
        return Err(SchemaError::ChangeLog(format!(
            "Expected <databaseChangeLog> root element, found <{}>",
            root.name
        )));
    }

    for child in &root.children {
        match child.name.as_str() {
            "changeSet" => changelog.change_sets.push(parse_change_set(child, path)?),
            "include" => {
                let Some((current, visiting)) = includes.as_mut() else {
                    debug!("Ignoring <include> in in-memory changelog {path}");
                    continue;
                };
                let file = child.required("file")?;
                let target = if child.flag("relativeToChangelogFile") {
                    current
                        .parent()
                        .map(|dir| dir.join(&file))
                        .unwrap_or_else(|| PathBuf::from(&file))
                } else {
                    PathBuf::from(&file)
                };
                load_into(&target, changelog, visiting)?;
            }
            other => debug!("Skipping <{other}> in changelog {path}"),
        }
    }
    Ok(())
}

fn parse_change_set(element: &Element, path: &str) -> Result<ChangeSet> {
    let id = element.required("id")?;
    let author = element.attr("author").unwrap_or_default().to_string();

    let mut change_set = ChangeSet::new(id, author, Vec::new());
    change_set.path = path.to_string();
    change_set.context = element
        .attr("context")
        .or_else(|| element.attr("contextFilter"))
        .map(str::to_string);
    change_set.labels = element.attr("labels").map(str::to_string);

    for child in &element.children {
        match child.name.as_str() {
            "comment" => change_set.comment = Some(child.text.clone()),
            "rollback" | "preConditions" | "validCheckSum" => {}
            _ => change_set.changes.push(parse_change(child, &change_set.id)?),
        }
    }
    Ok(change_set)
}

fn table_ref(element: &Element, schema_key: &str, table_key: &str) -> Result<TableRef> {
    Ok(TableRef {
        schema: element.attr(schema_key).map(str::to_string),
        name: element.required(table_key)?,
    })
}

fn split_names(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_default(element: &Element) -> Option<DefaultValue> {
    if let Some(value) = element.attr("defaultValueComputed") {
        return Some(DefaultValue::Computed(value.to_string()));
    }
    if let Some(value) = element.attr("defaultValueNumeric") {
        return Some(DefaultValue::Numeric(value.to_string()));
    }
    if let Some(value) = element.attr("defaultValueBoolean") {
        return Some(DefaultValue::Boolean(value.eq_ignore_ascii_case("true")));
    }
    element
        .attr("defaultValue")
        .map(|value| DefaultValue::Literal(value.to_string()))
}

fn parse_column(element: &Element) -> Result<ColumnConfig> {
    let mut constraints = ColumnConstraints::default();
    if let Some(c) = element.children_named("constraints").next() {
        constraints.nullable = c.attr("nullable").map(|v| v.eq_ignore_ascii_case("true"));
        constraints.primary_key = c.flag("primaryKey");
        constraints.primary_key_name = c.attr("primaryKeyName").map(str::to_string);
        constraints.unique = c.flag("unique");
    }
    Ok(ColumnConfig {
        name: element.required("name")?,
        type_name: element.attr("type").map(str::to_string),
        default: parse_default(element),
        auto_increment: element.flag("autoIncrement"),
        constraints,
    })
}

fn parse_columns(element: &Element) -> Result<Vec<ColumnConfig>> {
    element.children_named("column").map(parse_column).collect()
}

fn parse_action(element: &Element, key: &str) -> Result<Option<ReferentialAction>> {
    match element.attr(key) {
        None => Ok(None),
        Some(value) => ReferentialAction::parse(value).map(Some).ok_or_else(|| {
            SchemaError::ChangeLog(format!("Unknown referential action '{value}' in {key}"))
        }),
    }
}

fn parse_change(element: &Element, change_set_id: &str) -> Result<Change> {
    let e = element;
    let change = match e.name.as_str() {
        "createTable" => Change::CreateTable {
            table: table_ref(e, "schemaName", "tableName")?,
            columns: parse_columns(e)?,
        },
        "dropTable" => Change::DropTable {
            table: table_ref(e, "schemaName", "tableName")?,
            cascade: e.flag("cascadeConstraints"),
        },
        "addColumn" => Change::AddColumn {
            table: table_ref(e, "schemaName", "tableName")?,
            columns: parse_columns(e)?,
        },
        "dropColumn" => {
            let column = match e.attr("columnName") {
                Some(name) => name.to_string(),
                None => e
                    .children_named("column")
                    .next()
                    .map(|c| c.required("name"))
                    .transpose()?
                    .ok_or_else(|| {
                        SchemaError::ChangeLog("<dropColumn> names no column".to_string())
                    })?,
            };
            Change::DropColumn {
                table: table_ref(e, "schemaName", "tableName")?,
                column,
            }
        }
        "modifyDataType" => Change::ModifyDataType {
            table: table_ref(e, "schemaName", "tableName")?,
            column: e.required("columnName")?,
            new_data_type: e.required("newDataType")?,
        },
        "addNotNullConstraint" => Change::AddNotNullConstraint {
            table: table_ref(e, "schemaName", "tableName")?,
            column: e.required("columnName")?,
            column_data_type: e.attr("columnDataType").map(str::to_string),
        },
        "dropNotNullConstraint" => Change::DropNotNullConstraint {
            table: table_ref(e, "schemaName", "tableName")?,
            column: e.required("columnName")?,
            column_data_type: e.attr("columnDataType").map(str::to_string),
        },
        "addDefaultValue" => Change::AddDefaultValue {
            table: table_ref(e, "schemaName", "tableName")?,
            column: e.required("columnName")?,
            value: parse_default(e).ok_or_else(|| {
                SchemaError::ChangeLog("<addDefaultValue> declares no value".to_string())
            })?,
        },
        "dropDefaultValue" => Change::DropDefaultValue {
            table: table_ref(e, "schemaName", "tableName")?,
            column: e.required("columnName")?,
        },
        "addPrimaryKey" => Change::AddPrimaryKey {
            table: table_ref(e, "schemaName", "tableName")?,
            columns: split_names(&e.required("columnNames")?),
            constraint_name: e.attr("constraintName").map(str::to_string),
        },
        "dropPrimaryKey" => Change::DropPrimaryKey {
            table: table_ref(e, "schemaName", "tableName")?,
            constraint_name: e.attr("constraintName").map(str::to_string),
        },
        "createIndex" => Change::CreateIndex {
            table: table_ref(e, "schemaName", "tableName")?,
            index_name: e.required("indexName")?,
            columns: e
                .children_named("column")
                .map(|c| c.required("name"))
                .collect::<Result<Vec<_>>>()?,
            unique: e.flag("unique"),
        },
        "dropIndex" => Change::DropIndex {
            table: table_ref(e, "schemaName", "tableName")?,
            index_name: e.required("indexName")?,
        },
        "addForeignKeyConstraint" => Change::AddForeignKeyConstraint {
            table: table_ref(e, "baseTableSchemaName", "baseTableName")?,
            base_columns: split_names(&e.required("baseColumnNames")?),
            constraint_name: e.required("constraintName")?,
            referenced_table: table_ref(e, "referencedTableSchemaName", "referencedTableName")?,
            referenced_columns: split_names(&e.required("referencedColumnNames")?),
            on_delete: parse_action(e, "onDelete")?,
            on_update: parse_action(e, "onUpdate")?,
        },
        "dropForeignKeyConstraint" => Change::DropForeignKeyConstraint {
            table: table_ref(e, "baseTableSchemaName", "baseTableName")?,
            constraint_name: e.required("constraintName")?,
        },
        "sql" => Change::Sql {
            sql: e.text.trim().to_string(),
        },
        other => {
            return Err(SchemaError::ChangeLog(format!(
                "Unsupported change <{other}> in changeSet '{change_set_id}'"
            )))
        }
    };
    Ok(change)
}

// ============================================================================
// Writing
// ============================================================================

struct XmlOut {
    writer: Writer<Vec<u8>>,
}

impl XmlOut {
    fn new() -> Self {
        Self {
            writer: Writer::new_with_indent(Vec::new(), b' ', 4),
        }
    }

    fn emit(&mut self, event: Event<'_>) -> Result<()> {
        self.writer
            .write_event(event)
            .map_err(|e| xml_error("Failed to write changelog", e))
    }

    fn empty(&mut self, element: BytesStart<'_>) -> Result<()> {
        self.emit(Event::Empty(element))
    }

    fn start(&mut self, element: BytesStart<'_>) -> Result<()> {
        self.emit(Event::Start(element))
    }

    fn end(&mut self, name: &str) -> Result<()> {
        self.emit(Event::End(BytesEnd::new(name)))
    }

    fn finish(self) -> Result<String> {
        String::from_utf8(self.writer.into_inner())
            .map_err(|e| xml_error("Changelog is not valid UTF-8", e))
    }
}

fn with_table<'a>(
    mut element: BytesStart<'a>,
    table: &'a TableRef,
    schema_key: &'a str,
    table_key: &'a str,
) -> BytesStart<'a> {
    if let Some(schema) = &table.schema {
        element.push_attribute((schema_key, schema.as_str()));
    }
    element.push_attribute((table_key, table.name.as_str()));
    element
}

fn push_default(element: &mut BytesStart<'_>, value: &DefaultValue) {
    match value {
        DefaultValue::Literal(v) => element.push_attribute(("defaultValue", v.as_str())),
        DefaultValue::Numeric(v) => element.push_attribute(("defaultValueNumeric", v.as_str())),
        DefaultValue::Boolean(v) => {
            element.push_attribute(("defaultValueBoolean", if *v { "true" } else { "false" }))
        }
        DefaultValue::Computed(v) => element.push_attribute(("defaultValueComputed", v.as_str())),
    }
}

fn write_column(out: &mut XmlOut, column: &ColumnConfig) -> Result<()> {
    let mut element = BytesStart::new("column");
    if column.auto_increment {
        element.push_attribute(("autoIncrement", "true"));
    }
    element.push_attribute(("name", column.name.as_str()));
    if let Some(type_name) = &column.type_name {
        element.push_attribute(("type", type_name.as_str()));
    }
    if let Some(default) = &column.default {
        push_default(&mut element, default);
    }

    let c = &column.constraints;
    if c.nullable.is_none() && !c.primary_key && !c.unique {
        return out.empty(element);
    }

    out.start(element)?;
    let mut constraints = BytesStart::new("constraints");
    if let Some(nullable) = c.nullable {
        constraints.push_attribute(("nullable", if nullable { "true" } else { "false" }));
    }
    if c.primary_key {
        constraints.push_attribute(("primaryKey", "true"));
        if let Some(name) = &c.primary_key_name {
            constraints.push_attribute(("primaryKeyName", name.as_str()));
        }
    }
    if c.unique {
        constraints.push_attribute(("unique", "true"));
    }
    out.empty(constraints)?;
    out.end("column")
}

fn write_change(out: &mut XmlOut, change: &Change) -> Result<()> {
    let kind = change.kind();
    let element = BytesStart::new(kind);
    match change {
        Change::CreateTable { table, columns } | Change::AddColumn { table, columns } => {
            out.start(with_table(element, table, "schemaName", "tableName"))?;
            for column in columns {
                write_column(out, column)?;
            }
            out.end(kind)
        }
        Change::DropTable { table, cascade } => {
            let mut element = with_table(element, table, "schemaName", "tableName");
            if *cascade {
                element.push_attribute(("cascadeConstraints", "true"));
            }
            out.empty(element)
        }
        Change::DropColumn { table, column } | Change::DropDefaultValue { table, column } => {
            let mut element = with_table(element, table, "schemaName", "tableName");
            element.push_attribute(("columnName", column.as_str()));
            out.empty(element)
        }
        Change::ModifyDataType {
            table,
            column,
            new_data_type,
        } => {
            let mut element = with_table(element, table, "schemaName", "tableName");
            element.push_attribute(("columnName", column.as_str()));
            element.push_attribute(("newDataType", new_data_type.as_str()));
            out.empty(element)
        }
        Change::AddNotNullConstraint {
            table,
            column,
            column_data_type,
        }
        | Change::DropNotNullConstraint {
            table,
            column,
            column_data_type,
        } => {
            let mut element = with_table(element, table, "schemaName", "tableName");
            element.push_attribute(("columnName", column.as_str()));
            if let Some(data_type) = column_data_type {
                element.push_attribute(("columnDataType", data_type.as_str()));
            }
            out.empty(element)
        }
        Change::AddDefaultValue {
            table,
            column,
            value,
        } => {
            let mut element = with_table(element, table, "schemaName", "tableName");
            element.push_attribute(("columnName", column.as_str()));
            push_default(&mut element, value);
            out.empty(element)
        }
        Change::AddPrimaryKey {
            table,
            columns,
            constraint_name,
        } => {
            let joined = columns.join(", ");
            let mut element = with_table(element, table, "schemaName", "tableName");
            element.push_attribute(("columnNames", joined.as_str()));
            if let Some(name) = constraint_name {
                element.push_attribute(("constraintName", name.as_str()));
            }
            out.empty(element)
        }
        Change::DropPrimaryKey {
            table,
            constraint_name,
        } => {
            let mut element = with_table(element, table, "schemaName", "tableName");
            if let Some(name) = constraint_name {
                element.push_attribute(("constraintName", name.as_str()));
            }
            out.empty(element)
        }
        Change::CreateIndex {
            table,
            index_name,
            columns,
            unique,
        } => {
            let mut element = element;
            element.push_attribute(("indexName", index_name.as_str()));
            let mut element = with_table(element, table, "schemaName", "tableName");
            if *unique {
                element.push_attribute(("unique", "true"));
            }
            out.start(element)?;
            for column in columns {
                let mut c = BytesStart::new("column");
                c.push_attribute(("name", column.as_str()));
                out.empty(c)?;
            }
            out.end(kind)
        }
        Change::DropIndex { table, index_name } => {
            let mut element = element;
            element.push_attribute(("indexName", index_name.as_str()));
            out.empty(with_table(element, table, "schemaName", "tableName"))
        }
        Change::AddForeignKeyConstraint {
            table,
            base_columns,
            constraint_name,
            referenced_table,
            referenced_columns,
            on_delete,
            on_update,
        } => {
            let base = base_columns.join(", ");
            let referenced = referenced_columns.join(", ");
            let mut element = element;
            element.push_attribute(("baseColumnNames", base.as_str()));
            let mut element = with_table(element, table, "baseTableSchemaName", "baseTableName");
            element.push_attribute(("constraintName", constraint_name.as_str()));
            if let Some(action) = on_delete {
                element.push_attribute(("onDelete", action.as_sql()));
            }
            if let Some(action) = on_update {
                element.push_attribute(("onUpdate", action.as_sql()));
            }
            element.push_attribute(("referencedColumnNames", referenced.as_str()));
            let element = with_table(
                element,
                referenced_table,
                "referencedTableSchemaName",
                "referencedTableName",
            );
            out.empty(element)
        }
        Change::DropForeignKeyConstraint {
            table,
            constraint_name,
        } => {
            let mut element = with_table(element, table, "baseTableSchemaName", "baseTableName");
            element.push_attribute(("constraintName", constraint_name.as_str()));
            out.empty(element)
        }
        Change::Sql { sql } => {
            out.start(element)?;
            out.emit(Event::Text(BytesText::new(sql)))?;
            out.end(kind)
        }
    }
}

fn write_change_set(out: &mut XmlOut, change_set: &ChangeSet) -> Result<()> {
    let mut element = BytesStart::new("changeSet");
    element.push_attribute(("author", change_set.author.as_str()));
    element.push_attribute(("id", change_set.id.as_str()));
    if let Some(context) = &change_set.context {
        element.push_attribute(("context", context.as_str()));
    }
    if let Some(labels) = &change_set.labels {
        element.push_attribute(("labels", labels.as_str()));
    }
    out.start(element)?;
    if let Some(comment) = &change_set.comment {
        out.start(BytesStart::new("comment"))?;
        out.emit(Event::Text(BytesText::new(comment)))?;
        out.end("comment")?;
    }
    for change in &change_set.changes {
        write_change(out, change)?;
    }
    out.end("changeSet")
}

/// Serializes changesets as a complete changelog document.
pub fn serialize_change_sets(change_sets: &[ChangeSet]) -> Result<String> {
    let mut out = XmlOut::new();
    out.emit(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), Some("no"))))?;

    let mut root = BytesStart::new("databaseChangeLog");
    root.push_attribute(("xmlns", NAMESPACE));
    root.push_attribute(("xmlns:xsi", XSI_NAMESPACE));
    root.push_attribute(("xsi:schemaLocation", SCHEMA_LOCATION));

    if change_sets.is_empty() {
        out.empty(root)?;
    } else {
        out.start(root)?;
        for change_set in change_sets {
            write_change_set(&mut out, change_set)?;
        }
        out.end("databaseChangeLog")?;
    }

    let mut document = out.finish()?;
    document.push('\n');
    Ok(document)
}

/// Serializes the changes of one changeset, the input of its checksum.
pub(crate) fn serialize_changes(changes: &[Change]) -> Result<String> {
    let mut out = XmlOut::new();
    for change in changes {
        write_change(&mut out, change)?;
    }
    out.finish()
}

/// Writes a changelog document to `path`, creating parent directories.
pub fn write_changelog(path: &Path, changelog: &ChangeLog) -> Result<()> {
    let document = serialize_change_sets(&changelog.change_sets)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| SchemaError::io(parent, e))?;
    }
    std::fs::write(path, document).map_err(|e| SchemaError::io(path, e))
}
