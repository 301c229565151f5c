//! Command execution and file transfer on cluster nodes.

mod rotation;
mod scp;
mod ssh;

pub use rotation::{PasswordRotation, RotationError, RotationState, rotate_password};
pub use ssh::SshConnector;

use crate::TransportError;
use async_trait::async_trait;
use std::path::PathBuf;

/// A file to place on a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub content: Vec<u8>,
    pub target_dir: String,
    pub target_name: String,
    /// Octal mode, e.g. `0750`.
    pub permissions: String,
}

impl RemoteFile {
    /// Splits `target_path` into directory and file name.
    pub fn new(content: Vec<u8>, target_path: &str, permissions: &str) -> Self {
        let (dir, name) = match target_path.rsplit_once('/') {
            Some(("", name)) => ("/", name),
            Some((dir, name)) => (dir, name),
            None => (".", target_path),
        };
        Self {
            content,
            target_dir: dir.to_string(),
            target_name: name.to_string(),
            permissions: permissions.to_string(),
        }
    }

    pub fn target_path(&self) -> String {
        if self.target_dir.ends_with('/') {
            format!("{}{}", self.target_dir, self.target_name)
        } else {
            format!("{}/{}", self.target_dir, self.target_name)
        }
    }
}

/// Where to reach a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    pub address: String,
    pub port: u16,
    pub user: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteAuth {
    PrivateKey(PathBuf),
    Password(String),
}

/// An authenticated session able to run commands on one node.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteCommandRunner: Send + Sync {
    /// Runs `command`; returns stdout and stderr combined. A non-zero exit
    /// status is an error carrying the output.
    async fn run(&self, command: &str) -> Result<String, TransportError>;

    /// Writes a file, replacing whatever is at the target path.
    async fn copy(&self, file: &RemoteFile) -> Result<(), TransportError>;

    /// Reads a remote file (stdout of `cat` only).
    async fn fetch(&self, remote_path: &str) -> Result<Vec<u8>, TransportError>;
}

/// A pseudo-terminal session driven by prompt/response exchanges.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InteractiveShell: Send {
    async fn send(&mut self, input: &[u8]) -> Result<(), TransportError>;

    /// Next chunk of terminal output; `None` once the session closed.
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError>;
}

/// Opens sessions to nodes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn connect(
        &self,
        target: &RemoteTarget,
        auth: &RemoteAuth,
    ) -> Result<Box<dyn RemoteCommandRunner>, TransportError>;

    /// Password login with a pseudo-terminal and an interactive shell.
    async fn open_shell(
        &self,
        target: &RemoteTarget,
        password: &str,
    ) -> Result<Box<dyn InteractiveShell>, TransportError>;
}
