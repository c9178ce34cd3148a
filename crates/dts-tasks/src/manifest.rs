use dts_core::{DataResource, DtsError, Result};
use std::path::{Path, PathBuf};

/// Build the Frictionless-style data package describing the transferred
/// resources, in input order
pub fn build_manifest(resources: &[DataResource]) -> serde_json::Value {
    serde_json::json!({
        "name": "manifest",
        "resources": resources,
    })
}

/// Write the manifest into `dir` as a uniquely named `manifest.*.json` file
/// and return its path. Unique names keep concurrent finalizations from
/// colliding; the caller removes the file once its transfer is terminal.
pub fn write_manifest(dir: &Path, resources: &[DataResource]) -> Result<PathBuf> {
    let file = tempfile::Builder::new()
        .prefix("manifest.")
        .suffix(".json")
        .tempfile_in(dir)
        .map_err(|e| DtsError::Io(e))?;

    serde_json::to_writer_pretty(file.as_file(), &build_manifest(resources))
        .map_err(|e| DtsError::Transfer(format!("cannot write manifest: {e}")))?;

    let (_file, path) = file
        .keep()
        .map_err(|e| DtsError::Transfer(format!("cannot persist manifest: {e}")))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn resource(id: &str) -> DataResource {
        DataResource {
            id: id.to_string(),
            name: id.trim_end_matches(".txt").to_string(),
            path: id.to_string(),
            format: Some("txt".into()),
            media_type: Some("text/plain".into()),
            bytes: 5,
            hash: "deadbeef".into(),
            hash_algorithm: Some("sha256".into()),
            sources: None,
            licenses: None,
            credit: None,
            metadata: None,
        }
    }

    #[test]
    fn test_manifest_shape_and_order() {
        let manifest = build_manifest(&[resource("b.txt"), resource("a.txt")]);
        assert_eq!(manifest["name"], "manifest");
        let resources = manifest["resources"].as_array().unwrap();
        assert_eq!(resources.len(), 2);
        assert_eq!(resources[0]["id"], "b.txt");
        assert_eq!(resources[1]["id"], "a.txt");
    }

    #[test]
    fn test_write_manifest_naming_and_content() {
        let dir = TempDir::new().unwrap();
        let path = write_manifest(dir.path(), &[resource("a.txt")]).unwrap();

        let basename = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(basename.starts_with("manifest."));
        assert!(basename.ends_with(".json"));

        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed["resources"][0]["hash"], "deadbeef");
    }

    #[test]
    fn test_concurrent_manifests_do_not_collide() {
        let dir = TempDir::new().unwrap();
        let first = write_manifest(dir.path(), &[resource("a.txt")]).unwrap();
        let second = write_manifest(dir.path(), &[resource("a.txt")]).unwrap();
        assert_ne!(first, second);
        assert!(first.exists());
        assert!(second.exists());
    }
}
