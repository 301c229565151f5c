use crate::core::domain::{
    model::node::{Node, NodeRole},
    value_object::serde_helpers::epoch_seconds,
};
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Local record of which VMs make up the cluster and how far each got.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInventory {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master: Option<Node>,
    #[serde(default)]
    pub workers: Vec<Node>,
    /// Last join command computed on the master.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_command: Option<String>,
    #[serde(
        default,
        with = "epoch_seconds",
        skip_serializing_if = "Option::is_none"
    )]
    pub saved_at: Option<SystemTime>,
}

impl ClusterInventory {
    pub fn is_empty(&self) -> bool {
        self.master.is_none() && self.workers.is_empty()
    }

    pub fn has_ready_master(&self) -> bool {
        self.master.as_ref().is_some_and(|m| m.ready)
    }

    pub fn ready_master(&self) -> Option<&Node> {
        self.master.as_ref().filter(|m| m.ready)
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.master
            .iter()
            .chain(self.workers.iter())
            .find(|n| n.name == name)
    }

    /// Replaces the entry with the same name, or adds it.
    ///
    /// Workers keep their position; new workers are appended.
    pub fn upsert(&mut self, node: Node) {
        match node.role {
            NodeRole::Master => {
                if let Some(join) = &node.join_command {
                    self.join_command = Some(join.clone());
                }
                self.master = Some(node);
            }
            NodeRole::Worker => match self.workers.iter_mut().find(|w| w.name == node.name) {
                Some(slot) => *slot = node,
                None => self.workers.push(node),
            },
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Node> {
        if self.master.as_ref().is_some_and(|m| m.name == name) {
            return self.master.take();
        }
        let position = self.workers.iter().position(|w| w.name == name)?;
        Some(self.workers.remove(position))
    }

    /// Next free worker index, continuing after the highest one in use.
    pub fn next_worker_index(&self) -> u32 {
        self.workers
            .iter()
            .filter_map(Node::worker_index)
            .max()
            .unwrap_or(0)
            + 1
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.master.iter().chain(self.workers.iter())
    }
}
