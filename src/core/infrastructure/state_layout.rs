//! Where local and mirrored state lives.

use crate::{PveKubeError, PveKubeResult};
use std::path::{Path, PathBuf};

pub const STATE_DIR: &str = ".pvekube";

/// Mirror of the local state directory on the master node.
pub const REMOTE_STATE_DIR: &str = "/root/.pvekube";
pub const REMOTE_ADMIN_CONF: &str = "/etc/kubernetes/admin.conf";

const INVENTORY_FILE: &str = "inventory.json";
const CONFIG_FILE: &str = "config.yaml";
const PRIVATE_KEY_FILE: &str = "id_rsa";
const PUBLIC_KEY_FILE: &str = "id_rsa.pub";
const KNOWN_HOSTS_FILE: &str = "known_hosts";
const CACHE_DIR: &str = "cache";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateLayout {
    state_dir: PathBuf,
    kubeconfig: PathBuf,
}

impl StateLayout {
    /// `~/.pvekube` and `~/.kube/config` of the current user.
    pub fn from_home_dir() -> PveKubeResult<Self> {
        let home = dirs::home_dir().ok_or_else(|| {
            PveKubeError::Precondition("cannot determine the home directory".to_string())
        })?;
        Ok(Self::new(
            home.join(STATE_DIR),
            home.join(".kube").join("config"),
        ))
    }

    pub fn new(state_dir: impl Into<PathBuf>, kubeconfig: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            kubeconfig: kubeconfig.into(),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn inventory_path(&self) -> PathBuf {
        self.state_dir.join(INVENTORY_FILE)
    }

    pub fn config_path(&self) -> PathBuf {
        self.state_dir.join(CONFIG_FILE)
    }

    pub fn private_key_path(&self) -> PathBuf {
        self.state_dir.join(PRIVATE_KEY_FILE)
    }

    pub fn public_key_path(&self) -> PathBuf {
        self.state_dir.join(PUBLIC_KEY_FILE)
    }

    pub fn known_hosts_path(&self) -> PathBuf {
        self.state_dir.join(KNOWN_HOSTS_FILE)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.state_dir.join(CACHE_DIR)
    }

    pub fn kubeconfig_path(&self) -> &Path {
        &self.kubeconfig
    }
}

pub fn remote_inventory_path() -> String {
    format!("{REMOTE_STATE_DIR}/{INVENTORY_FILE}")
}

pub fn remote_config_path() -> String {
    format!("{REMOTE_STATE_DIR}/{CONFIG_FILE}")
}

pub fn remote_private_key_path() -> String {
    format!("{REMOTE_STATE_DIR}/{PRIVATE_KEY_FILE}")
}

pub fn remote_public_key_path() -> String {
    format!("{REMOTE_STATE_DIR}/{PUBLIC_KEY_FILE}")
}
