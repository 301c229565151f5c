use crate::{
    ClusterInventory, PveKubeError, PveKubeResult,
    core::infrastructure::atomic_file::{read_optional, remove_if_exists, write_atomic},
};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;

/// Durable JSON copy of the [`ClusterInventory`].
#[derive(Debug, Clone)]
pub struct InventoryStore {
    path: PathBuf,
}

impl InventoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn exists(&self) -> bool {
        tokio::fs::try_exists(&self.path).await.unwrap_or(false)
    }

    /// Missing file yields an empty inventory; a malformed one is an error
    /// and is left untouched.
    pub async fn load(&self) -> PveKubeResult<ClusterInventory> {
        match read_optional(&self.path).await? {
            None => Ok(ClusterInventory::default()),
            Some(raw) => Self::parse(&raw),
        }
    }

    pub fn parse(raw: &[u8]) -> PveKubeResult<ClusterInventory> {
        serde_json::from_slice(raw)
            .map_err(|e| PveKubeError::Data(format!("inventory is not valid: {e}")))
    }

    pub async fn save(&self, inventory: &ClusterInventory) -> PveKubeResult<()> {
        let mut stamped = inventory.clone();
        stamped.saved_at = Some(SystemTime::now());
        let json = serde_json::to_string_pretty(&stamped)?;
        write_atomic(&self.path, json.as_bytes()).await?;
        debug!(path = %self.path.display(), "inventory saved");
        Ok(())
    }

    pub async fn clear(&self) -> PveKubeResult<()> {
        remove_if_exists(&self.path).await
    }
}
