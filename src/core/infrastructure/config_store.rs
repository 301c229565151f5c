use crate::{
    ClusterRequest, PveKubeError, PveKubeResult,
    core::infrastructure::atomic_file::{read_optional, remove_if_exists, write_private},
};
use std::path::{Path, PathBuf};

/// The operator's [`ClusterRequest`], stored as YAML.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn exists(&self) -> bool {
        tokio::fs::try_exists(&self.path).await.unwrap_or(false)
    }

    pub async fn load(&self) -> PveKubeResult<ClusterRequest> {
        let raw = read_optional(&self.path).await?.ok_or_else(|| {
            PveKubeError::Precondition(format!(
                "no configuration at {}; run `configure` first",
                self.path.display()
            ))
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &[u8]) -> PveKubeResult<ClusterRequest> {
        serde_yaml::from_slice(raw)
            .map_err(|e| PveKubeError::Data(format!("configuration is not valid: {e}")))
    }

    /// Saved owner-readable only; the file carries platform credentials.
    pub async fn save(&self, request: &ClusterRequest) -> PveKubeResult<()> {
        let yaml = serde_yaml::to_string(request)?;
        write_private(&self.path, yaml.as_bytes()).await
    }

    /// YAML of the request with credentials replaced by a placeholder.
    pub fn render_redacted(request: &ClusterRequest) -> PveKubeResult<String> {
        Ok(serde_yaml::to_string(&request.redacted())?)
    }

    pub async fn clear(&self) -> PveKubeResult<()> {
        remove_if_exists(&self.path).await
    }
}
