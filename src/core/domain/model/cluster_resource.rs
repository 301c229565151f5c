//! Entries of `GET /cluster/resources?type=vm`.
//!
//! The endpoint returns a heterogeneous list tagged by `type`; only QEMU
//! guests matter here, everything else lands in [`ClusterResource::Other`].

use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClusterResource {
    Qemu(QemuResource),
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct QemuResource {
    /// Platform host the guest is registered on.
    pub node: String,
    pub vmid: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default, deserialize_with = "flag")]
    pub template: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
    /// Semicolon separated tag list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<String>,
}

impl QemuResource {
    pub fn is_named(&self, name: &str) -> bool {
        self.name.as_deref() == Some(name)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags
            .as_deref()
            .is_some_and(|tags| tags.split([';', ',', ' ']).any(|t| t == tag))
    }
}

/// The API renders booleans as `0`/`1`.
fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Int(u8),
        Bool(bool),
    }
    Ok(match Flag::deserialize(deserializer)? {
        Flag::Int(value) => value != 0,
        Flag::Bool(value) => value,
    })
}
