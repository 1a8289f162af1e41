use anyhow::{Context, Result};
use std::path::Path;
use tokio::fs;
use walkdir::WalkDir;

use crate::chunk::Document;

const SUPPORTED_EXTENSIONS: [&str; 2] = ["txt", "md"];

pub struct FileReader;

impl FileReader {
    pub async fn read_file(path: &Path) -> Result<Document> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");

        if !SUPPORTED_EXTENSIONS.contains(&extension) {
            anyhow::bail!("Unsupported file format: {}", extension);
        }

        let content = fs::read_to_string(path)
            .await
            .context(format!("Failed to read file: {:?}", path))?;
        let source = path.to_string_lossy().to_string();

        Ok(Document::new(source, content).with_metadata("extension", extension))
    }

    /// Read every supported file below `dir`, sorted by path so repeated runs see the
    /// same document order.
    pub async fn read_directory(dir: &Path) -> Result<Vec<Document>> {
        let mut paths = Vec::new();
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.context(format!("Failed to walk directory: {:?}", dir))?;
            let path = entry.path();
            let supported = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| SUPPORTED_EXTENSIONS.contains(&ext));
            if entry.file_type().is_file() && supported {
                paths.push(path.to_path_buf());
            }
        }

        let mut documents = Vec::with_capacity(paths.len());
        for path in paths {
            documents.push(Self::read_file(&path).await?);
        }
        tracing::debug!(dir = %dir.display(), files = documents.len(), "Read directory");

        Ok(documents)
    }
}
