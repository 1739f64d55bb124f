use crate::index::EntityIndex;
use crate::util::{Result, SchemaError};
use glob::glob;
use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use zip::result::ZipError;
use zip::ZipArchive;
use tracing::{debug, info, warn};

/// Well-known location of the entity index inside an artifact directory or archive.
pub const INDEX_RESOURCE: &str = "META-INF/entity-index.json";

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

/// Entities found across all artifacts, with the merged index that describes them.
#[derive(Debug, Clone, Default)]
pub struct Discovery {
    pub index: EntityIndex,
    pub entities: Vec<String>,
}

/// Resolves artifact arguments to index resource paths.
/// Handles: artifact directories, packaged archives (jar/zip), direct index
/// files, and glob patterns over any of them. An archive resolves to itself;
/// [`read_index`] looks inside it.
pub fn enumerate_index_resources(artifacts: &[String]) -> Result<Vec<PathBuf>> {
    let mut resources = Vec::new();
    for artifact in artifacts {
        resources.extend(resolve_artifact(artifact)?);
    }
    Ok(resources)
}

fn resolve_artifact(artifact: &str) -> Result<Vec<PathBuf>> {
    let path = Path::new(artifact);
    if path.exists() || !is_pattern(artifact) {
        return Ok(vec![index_path(path)]);
    }

    let entries = glob(artifact)
        .map_err(|e| SchemaError::Config(format!("Invalid artifact pattern {artifact}: {e}")))?;

    let mut paths = Vec::new();
    for entry in entries {
        match entry {
            Ok(path) => paths.push(index_path(&path)),
            Err(e) => warn!("Skipping unreadable artifact path: {e}"),
        }
    }
    if paths.is_empty() {
        debug!("Artifact pattern {artifact} matched nothing");
    }
    paths.sort();
    Ok(paths)
}

fn is_pattern(artifact: &str) -> bool {
    artifact.contains(['*', '?', '['])
}

fn index_path(artifact: &Path) -> PathBuf {
    if artifact.is_dir() {
        artifact.join(INDEX_RESOURCE)
    } else {
        artifact.to_path_buf()
    }
}

/// Reads one index fragment. Any failure is logged and yields `None`.
pub fn read_index(resource: &Path) -> Option<EntityIndex> {
    let bytes = match fs::read(resource) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Skipping entity index {}: {e}", resource.display());
            return None;
        }
    };
    let bytes = if bytes.starts_with(ZIP_MAGIC) {
        read_archive_entry(resource, bytes)?
    } else {
        bytes
    };
    match EntityIndex::from_json(&bytes) {
        Ok(index) => Some(index),
        Err(e) => {
            warn!("Skipping malformed entity index {}: {e}", resource.display());
            None
        }
    }
}

/// Extracts [`INDEX_RESOURCE`] from a packaged artifact. Archives without an
/// index are common and only logged at debug level.
fn read_archive_entry(archive: &Path, bytes: Vec<u8>) -> Option<Vec<u8>> {
    let mut zip = match ZipArchive::new(Cursor::new(bytes)) {
        Ok(zip) => zip,
        Err(e) => {
            warn!("Skipping unreadable archive {}: {e}", archive.display());
            return None;
        }
    };
    let mut entry = match zip.by_name(INDEX_RESOURCE) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => {
            debug!("No entity index in {}", archive.display());
            return None;
        }
        Err(e) => {
            warn!("Skipping entity index in {}: {e}", archive.display());
            return None;
        }
    };
    let mut contents = Vec::new();
    if let Err(e) = entry.read_to_end(&mut contents) {
        warn!("Skipping entity index in {}: {e}", archive.display());
        return None;
    }
    Some(contents)
}

/// Merges the index fragments of every artifact, in argument order.
pub fn load_entity_index(artifacts: &[String]) -> Result<EntityIndex> {
    let mut aggregate = EntityIndex::new();
    for resource in enumerate_index_resources(artifacts)? {
        if let Some(fragment) = read_index(&resource) {
            debug!(
                "Merging entity index {} ({} classes)",
                resource.display(),
                fragment.classes.len()
            );
            aggregate.merge(fragment);
        }
    }
    Ok(aggregate)
}

pub fn discover_entities(artifacts: &[String]) -> Result<Discovery> {
    let index = load_entity_index(artifacts)?;
    let entities = index.entity_class_names();
    info!("Discovered {} entity classes", entities.len());
    for entity in &entities {
        debug!("Entity: {entity}");
    }
    Ok(Discovery { index, entities })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn write_jar(root: &Path, name: &str, entries: &[(&str, &str)]) -> PathBuf {
        let path = root.join(name);
        let mut jar = ZipWriter::new(fs::File::create(&path).unwrap());
        for (entry, contents) in entries {
            jar.start_file(*entry, SimpleFileOptions::default()).unwrap();
            jar.write_all(contents.as_bytes()).unwrap();
        }
        jar.finish().unwrap();
        path
    }

    fn write_artifact(root: &Path, name: &str, json: &str) -> PathBuf {
        let artifact = root.join(name);
        fs::create_dir_all(artifact.join("META-INF")).unwrap();
        fs::write(artifact.join(INDEX_RESOURCE), json).unwrap();
        artifact
    }

    fn entity_json(class: &str) -> String {
        format!(
            r#"{{
                "annotations": {{
                    "jakarta.persistence.Entity": [{{"name": "jakarta.persistence.Entity", "target": "{class}"}}]
                }},
                "classes": {{
                    "{class}": {{"name": "{class}", "mapping": {{"columns": []}}}}
                }}
            }}"#
        )
    }

    #[test]
    fn directory_resolves_to_index_resource() {
        let dir = TempDir::new().unwrap();
        let artifact = write_artifact(dir.path(), "core", "{}");

        let resources = enumerate_index_resources(&[artifact.to_string_lossy().into()]).unwrap();
        assert_eq!(resources, vec![artifact.join(INDEX_RESOURCE)]);
    }

    #[test]
    fn glob_expands_artifact_directories() {
        let dir = TempDir::new().unwrap();
        write_artifact(dir.path(), "lib-b", &entity_json("b.Customer"));
        write_artifact(dir.path(), "lib-a", entity_json("a.Order").as_str());

        let pattern = dir.path().join("lib-*").to_string_lossy().into_owned();
        let discovery = discover_entities(&[pattern]).unwrap();
        assert_eq!(
            discovery.entities,
            vec!["a.Order".to_string(), "b.Customer".to_string()]
        );
    }

    #[test]
    fn corrupt_index_is_skipped() {
        let dir = TempDir::new().unwrap();
        let good = write_artifact(dir.path(), "good", entity_json("a.Order").as_str());
        let bad = write_artifact(dir.path(), "bad", "{ not json");
        let missing = dir.path().join("missing");

        let artifacts = vec![
            bad.to_string_lossy().into_owned(),
            missing.to_string_lossy().into_owned(),
            good.to_string_lossy().into_owned(),
        ];
        let discovery = discover_entities(&artifacts).unwrap();
        assert_eq!(discovery.entities, vec!["a.Order".to_string()]);
    }

    #[test]
    fn packaged_artifacts_are_read_from_the_archive() {
        let dir = TempDir::new().unwrap();
        let jar = write_jar(
            dir.path(),
            "orders-1.0.jar",
            &[
                ("META-INF/MANIFEST.MF", "Manifest-Version: 1.0\n"),
                (INDEX_RESOURCE, entity_json("a.Order").as_str()),
            ],
        );
        let plain = write_jar(
            dir.path(),
            "commons-1.0.jar",
            &[("META-INF/MANIFEST.MF", "Manifest-Version: 1.0\n")],
        );
        let exploded = write_artifact(dir.path(), "billing", &entity_json("b.Invoice"));

        let artifacts = vec![
            jar.to_string_lossy().into_owned(),
            plain.to_string_lossy().into_owned(),
            exploded.to_string_lossy().into_owned(),
        ];
        let discovery = discover_entities(&artifacts).unwrap();
        assert_eq!(
            discovery.entities,
            vec!["a.Order".to_string(), "b.Invoice".to_string()]
        );
    }

    #[test]
    fn jar_glob_skips_archives_without_index() {
        let dir = TempDir::new().unwrap();
        write_jar(dir.path(), "a.jar", &[(INDEX_RESOURCE, entity_json("a.Order").as_str())]);
        write_jar(dir.path(), "b.jar", &[("readme.txt", "nothing here")]);
        write_jar(dir.path(), "c.jar", &[(INDEX_RESOURCE, "{ not json")]);

        let pattern = dir.path().join("*.jar").to_string_lossy().into_owned();
        let discovery = discover_entities(&[pattern]).unwrap();
        assert_eq!(discovery.entities, vec!["a.Order".to_string()]);
    }

    #[test]
    fn invalid_pattern_is_config_error() {
        let err = load_entity_index(&["target/[".to_string()]).unwrap_err();
        assert!(matches!(err, SchemaError::Config(_)));
    }

    #[test]
    fn no_artifacts_yields_empty_discovery() {
        let discovery = discover_entities(&[]).unwrap();
        assert!(discovery.entities.is_empty());
        assert!(discovery.index.classes.is_empty());
    }
}
