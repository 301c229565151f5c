//! Minimal typed view of a kubeconfig file, enough to merge the admin
//! credentials of a new cluster into an operator's existing file.

use crate::core::domain::error::PveKubeResult;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kubeconfig {
    #[serde(rename = "apiVersion", default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub clusters: Vec<NamedEntry>,
    #[serde(default)]
    pub contexts: Vec<NamedEntry>,
    #[serde(default)]
    pub users: Vec<NamedEntry>,
    #[serde(rename = "current-context", default)]
    pub current_context: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// A `clusters`, `contexts` or `users` item; only the name is interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedEntry {
    pub name: String,
    #[serde(flatten)]
    pub body: BTreeMap<String, Value>,
}

impl Default for Kubeconfig {
    fn default() -> Self {
        Self {
            api_version: default_api_version(),
            kind: default_kind(),
            clusters: Vec::new(),
            contexts: Vec::new(),
            users: Vec::new(),
            current_context: String::new(),
            extra: BTreeMap::new(),
        }
    }
}

impl Kubeconfig {
    /// Parses a kubeconfig; blank input yields an empty config.
    pub fn parse(raw: &str) -> PveKubeResult<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn to_yaml(&self) -> PveKubeResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Folds `incoming` into `self`.
    ///
    /// Entries are matched by name and replaced in place, unknown ones are
    /// appended, and the current context switches to the incoming one.
    /// Merging the same file twice leaves the result unchanged.
    pub fn merge(&mut self, incoming: Kubeconfig) {
        merge_named(&mut self.clusters, incoming.clusters);
        merge_named(&mut self.contexts, incoming.contexts);
        merge_named(&mut self.users, incoming.users);
        if !incoming.current_context.is_empty() {
            self.current_context = incoming.current_context;
        }
    }
}

fn merge_named(existing: &mut Vec<NamedEntry>, incoming: Vec<NamedEntry>) {
    for entry in incoming {
        match existing.iter_mut().find(|e| e.name == entry.name) {
            Some(slot) => *slot = entry,
            None => existing.push(entry),
        }
    }
}

fn default_api_version() -> String {
    "v1".to_string()
}

fn default_kind() -> String {
    "Config".to_string()
}
