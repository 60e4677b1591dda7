use crate::definition::WatchDefinition;
use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use std::path::{Path, PathBuf};

/// Watch definitions persisted as a JSON document.
#[derive(Clone, Debug)]
pub struct WatchStore {
    path: PathBuf,
}

impl WatchStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A store that was never written holds no watches.
    pub async fn load(&self) -> Result<Vec<WatchDefinition>> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).or_raise(|| ErrorKind::Store),
        };
        let definitions: Vec<WatchDefinition> = serde_json::from_slice(&data).or_raise(|| ErrorKind::Store)?;
        tracing::debug!(path = %self.path.display(), count = definitions.len(), "Loaded watch definitions");
        Ok(definitions)
    }

    /// Replace the stored definitions. Readers see either the old document
    /// or the new one, never a partial write.
    pub async fn save(&self, definitions: &[WatchDefinition]) -> Result<()> {
        let json = serde_json::to_vec_pretty(definitions).or_raise(|| ErrorKind::Store)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.or_raise(|| ErrorKind::Store)?;
        }
        let mut temp = self.path.clone().into_os_string();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);
        tokio::fs::write(&temp, &json).await.or_raise(|| ErrorKind::Store)?;
        if let Err(e) = tokio::fs::rename(&temp, &self.path).await {
            _ = tokio::fs::remove_file(&temp).await;
            return Err(e).or_raise(|| ErrorKind::Store);
        }
        tracing::debug!(path = %self.path.display(), count = definitions.len(), "Saved watch definitions");
        Ok(())
    }
}
