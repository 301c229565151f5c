//! Host keys of cluster nodes, kept in a private `known_hosts` file.
//!
//! Imported guests get fresh host keys while often reusing addresses, so an
//! address is purged before the first connection to a newly created node.
//! After that, an unknown host is learned on first use and a different key
//! for a known host is refused.

use crate::{
    PveKubeResult,
    core::infrastructure::atomic_file::{read_optional, write_atomic},
};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyVerdict {
    Trusted,
    Learned,
    Mismatch,
}

#[derive(Debug)]
pub struct TrustStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl TrustStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes every plain entry naming `address`; returns how many.
    ///
    /// Hashed entries and entries for other hosts are left alone. A missing
    /// file is not an error.
    pub async fn purge(&self, address: &str) -> PveKubeResult<usize> {
        let _guard = self.write_lock.lock().await;
        let Some(raw) = read_optional(&self.path).await? else {
            return Ok(0);
        };
        let content = String::from_utf8_lossy(&raw);
        let mut removed = 0;
        let kept: Vec<&str> = content
            .lines()
            .filter(|line| {
                let drop = entry_hosts(line).is_some_and(|hosts| names_address(hosts, address));
                removed += usize::from(drop);
                !drop
            })
            .collect();
        if removed > 0 {
            let mut rewritten = kept.join("\n");
            if !rewritten.is_empty() {
                rewritten.push('\n');
            }
            write_atomic(&self.path, rewritten.as_bytes()).await?;
            info!(%address, removed, "purged stale host keys");
        }
        Ok(removed)
    }

    /// Stored `<type> <base64>` key for a host, if any.
    pub async fn lookup(&self, address: &str, port: u16) -> PveKubeResult<Option<String>> {
        let Some(raw) = read_optional(&self.path).await? else {
            return Ok(None);
        };
        let pattern = host_pattern(address, port);
        let content = String::from_utf8_lossy(&raw);
        Ok(content.lines().find_map(|line| {
            let hosts = entry_hosts(line)?;
            if !hosts.split(',').any(|h| h == pattern) {
                return None;
            }
            let mut fields = line.split_whitespace().skip(1);
            Some(format!("{} {}", fields.next()?, fields.next()?))
        }))
    }

    /// Appends a key for a host.
    pub async fn learn(&self, address: &str, port: u16, key: &str) -> PveKubeResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut content = read_optional(&self.path)
            .await?
            .map(|raw| String::from_utf8_lossy(&raw).into_owned())
            .unwrap_or_default();
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(&format!("{} {}\n", host_pattern(address, port), key_fields(key)));
        write_atomic(&self.path, content.as_bytes()).await
    }

    /// Checks a presented key; unknown hosts are learned.
    pub async fn verify(&self, address: &str, port: u16, presented: &str) -> PveKubeResult<HostKeyVerdict> {
        let presented = key_fields(presented);
        match self.lookup(address, port).await? {
            Some(stored) if stored == presented => Ok(HostKeyVerdict::Trusted),
            Some(_) => {
                warn!(%address, port, "host key differs from the trusted one");
                Ok(HostKeyVerdict::Mismatch)
            }
            None => {
                self.learn(address, port, &presented).await?;
                debug!(%address, port, "learned host key");
                Ok(HostKeyVerdict::Learned)
            }
        }
    }
}

/// Host list of a plain entry; `None` for comments, blanks, hashed entries
/// and marker lines.
fn entry_hosts(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('@') {
        return None;
    }
    let hosts = trimmed.split_whitespace().next()?;
    if hosts.starts_with("|1|") {
        return None;
    }
    Some(hosts)
}

fn names_address(hosts: &str, address: &str) -> bool {
    hosts.split(',').any(|host| {
        host == address
            || host
                .strip_prefix('[')
                .and_then(|rest| rest.split_once("]:"))
                .is_some_and(|(inner, _)| inner == address)
    })
}

fn host_pattern(address: &str, port: u16) -> String {
    if port == 22 {
        address.to_string()
    } else {
        format!("[{address}]:{port}")
    }
}

/// `<type> <base64>` without any trailing comment.
fn key_fields(key: &str) -> String {
    key.split_whitespace().take(2).collect::<Vec<_>>().join(" ")
}
