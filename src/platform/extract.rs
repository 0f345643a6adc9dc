//! Reads the `Space` manifest from a checked-out working tree.

use std::path::Path;

use async_trait::async_trait;

use super::space::Space;
use crate::errors::SourceError;

/// Manifest file names, in lookup order.
pub const MANIFEST_FILES: [&str; 2] = ["tq.json", "tq.yaml"];

#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract_config(&self, dir: &Path) -> Result<Space, SourceError>;
}

/// Decode manifest `content` read from `file_name`, then apply defaults and
/// validate.
pub fn decode_manifest(file_name: &str, content: &str) -> Result<Space, SourceError> {
    let mut space: Space = if file_name.ends_with(".json") {
        serde_json::from_str(content).map_err(|e| SourceError::TqIsNotValidJson(e.to_string()))?
    } else {
        serde_yaml::from_str(content).map_err(|e| SourceError::TqIsNotValidJson(e.to_string()))?
    };
    space.validate().map_err(SourceError::InvalidSpace)?;
    Ok(space)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FileExtractor;

#[async_trait]
impl Extractor for FileExtractor {
    async fn extract_config(&self, dir: &Path) -> Result<Space, SourceError> {
        for name in MANIFEST_FILES {
            let path = dir.join(name);
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => {
                    tracing::debug!(path = %path.display(), "found manifest");
                    return decode_manifest(name, &content);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(anyhow::Error::new(e)
                        .context(format!("failed to read {}", path.display()))
                        .into());
                }
            }
        }
        Err(SourceError::NoTqJsonFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_json_manifest_is_preferred() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("tq.json"),
            r#"{"service": {"name": "from-json", "httpPort": 8000}}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("tq.yaml"),
            "service:\n  name: from-yaml\n  httpPort: 8000\n",
        )
        .unwrap();

        let space = FileExtractor.extract_config(dir.path()).await.unwrap();
        assert_eq!(space.service.name, "from-json");
    }

    #[tokio::test]
    async fn test_yaml_fallback() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("tq.yaml"),
            "service:\n  name: web\n  httpPort: 3000\n  replicas: 2\n",
        )
        .unwrap();

        let space = FileExtractor.extract_config(dir.path()).await.unwrap();
        assert_eq!(space.service.http_port, 3000);
        assert_eq!(space.service.replicas, 2);
        assert_eq!(space.service.dockerfile_path, "Dockerfile");
    }

    #[tokio::test]
    async fn test_missing_manifest() {
        let dir = TempDir::new().unwrap();
        let err = FileExtractor.extract_config(dir.path()).await.unwrap_err();
        assert!(matches!(err, SourceError::NoTqJsonFound));
    }

    #[tokio::test]
    async fn test_malformed_manifest_is_distinguished() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("tq.json"), "{ not json").unwrap();
        let err = FileExtractor.extract_config(dir.path()).await.unwrap_err();
        assert!(matches!(err, SourceError::TqIsNotValidJson(_)));
    }

    #[test]
    fn test_invalid_space_is_reported() {
        let err = decode_manifest("tq.json", r#"{"service": {"name": "web"}}"#).unwrap_err();
        match err {
            SourceError::InvalidSpace(msg) => assert_eq!(msg, "service.httpPort required"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
