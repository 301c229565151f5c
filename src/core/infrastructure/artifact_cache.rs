//! Locally staged binaries and images pushed to nodes.

use crate::{PveKubeError, PveKubeResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ArtifactCache: Send + Sync {
    /// Executable `tool` for a Kubernetes `version`.
    async fn resolve(&self, tool: &str, version: &str) -> PveKubeResult<PathBuf>;

    /// Directory holding the CNI plugin binaries for `version`.
    async fn resolve_cni(&self, version: &str) -> PveKubeResult<PathBuf>;

    /// Guest image archive.
    async fn resolve_image(&self, name: &str) -> PveKubeResult<PathBuf>;
}

/// Reads artifacts from `<root>/{tool}/{version}/{tool}`,
/// `<root>/cni/{version}/` and `<root>/images/{name}`.
#[derive(Debug, Clone)]
pub struct LocalArtifactCache {
    root: PathBuf,
}

impl LocalArtifactCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn existing(path: PathBuf, what: &str) -> PveKubeResult<PathBuf> {
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            Ok(path)
        } else {
            Err(PveKubeError::Precondition(format!(
                "{what} not found at {}; stage it in the artifact cache first",
                path.display()
            )))
        }
    }
}

#[async_trait]
impl ArtifactCache for LocalArtifactCache {
    async fn resolve(&self, tool: &str, version: &str) -> PveKubeResult<PathBuf> {
        let path = self.root.join(tool).join(version).join(tool);
        Self::existing(path, &format!("{tool} {version}")).await
    }

    async fn resolve_cni(&self, version: &str) -> PveKubeResult<PathBuf> {
        let path = self.root.join("cni").join(version);
        Self::existing(path, &format!("CNI plugins for {version}")).await
    }

    async fn resolve_image(&self, name: &str) -> PveKubeResult<PathBuf> {
        let path = self.root.join("images").join(name);
        Self::existing(path, &format!("guest image {name}")).await
    }
}
