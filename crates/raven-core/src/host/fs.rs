//! Local filesystem backing for agent `fs/*` requests

use std::path::Path;

use async_trait::async_trait;
use tracing::debug;

use crate::acp::FileSystem;
use crate::error::Result;

/// Serves reads and writes straight from the local disk.
#[derive(Debug, Default)]
pub struct LocalFileSystem;

#[async_trait]
impl FileSystem for LocalFileSystem {
    async fn read_file(&self, path: &Path) -> Result<String> {
        debug!(path = %path.display(), "reading file for agent");
        Ok(tokio::fs::read_to_string(path).await?)
    }

    async fn write_file(&self, path: &Path, content: &str) -> Result<()> {
        debug!(path = %path.display(), bytes = content.len(), "writing file for agent");
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, content).await?;
        Ok(())
    }
}
