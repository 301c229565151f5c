//! Forced password change on a freshly imported guest.
//!
//! The guest image ships with an expired factory password. Logging in over a
//! pseudo-terminal drops straight into `passwd`, which asks for the current
//! password, the new one and a confirmation. [`PasswordRotation`] tracks that
//! exchange as an explicit state machine fed with terminal output;
//! [`rotate_password`] drives it over an [`InteractiveShell`].

use super::InteractiveShell;
use crate::TransportError;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationState {
    AwaitCurrent,
    AwaitNew,
    AwaitRetype,
    AwaitConfirmation,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Prompt {
    Current,
    New,
    Retype,
    Updated,
    Shell,
    Failure(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RotationError {
    #[error("password change rejected: {0}")]
    Rejected(String),

    #[error("unexpected {prompt} prompt while in {state:?}")]
    UnexpectedPrompt {
        state: RotationState,
        prompt: &'static str,
    },

    #[error("session closed while in {0:?}")]
    Closed(RotationState),
}

impl From<RotationError> for TransportError {
    fn from(error: RotationError) -> Self {
        TransportError::Interactive(error.to_string())
    }
}

const FAILURE_BANNERS: &[&str] = &[
    "authentication token manipulation error",
    "password unchanged",
    "passwords do not match",
    "sorry, passwords do not match",
    "have exhausted maximum number of retries",
    "authentication failure",
];

#[derive(Debug)]
pub struct PasswordRotation {
    state: RotationState,
    current: String,
    new: String,
    buffer: String,
    passwd_requested: bool,
}

impl PasswordRotation {
    pub fn new(current: impl Into<String>, new: impl Into<String>) -> Self {
        Self {
            state: RotationState::AwaitCurrent,
            current: current.into(),
            new: new.into(),
            buffer: String::new(),
            passwd_requested: false,
        }
    }

    pub fn state(&self) -> RotationState {
        self.state
    }

    /// Consumes terminal output; returns the line to answer with, if any.
    pub fn feed(&mut self, output: &str) -> Result<Option<String>, RotationError> {
        self.buffer.push_str(output);
        let Some(prompt) = classify(&self.buffer) else {
            return Ok(None);
        };
        self.buffer.clear();

        use Prompt::*;
        use RotationState::*;
        let (next, reply) = match (self.state, prompt) {
            (_, Failure(banner)) => return Err(RotationError::Rejected(banner)),
            (AwaitCurrent, Current) => (AwaitNew, Some(self.current.clone())),
            // root is not asked for its current password
            (AwaitCurrent, New) | (AwaitNew, New) => (AwaitRetype, Some(self.new.clone())),
            // password not expired: start passwd ourselves, once
            (AwaitCurrent, Shell) if !self.passwd_requested => {
                self.passwd_requested = true;
                (AwaitCurrent, Some("passwd".to_string()))
            }
            (AwaitRetype, Retype) => (AwaitConfirmation, Some(self.new.clone())),
            (AwaitConfirmation, Updated) | (AwaitConfirmation, Shell) => (Done, None),
            (Done, _) => (Done, None),
            (state, prompt) => {
                return Err(RotationError::UnexpectedPrompt {
                    state,
                    prompt: prompt.label(),
                });
            }
        };
        debug!(from = ?self.state, to = ?next, "password rotation step");
        self.state = next;
        Ok(reply)
    }
}

impl Prompt {
    fn label(&self) -> &'static str {
        match self {
            Prompt::Current => "current-password",
            Prompt::New => "new-password",
            Prompt::Retype => "retype-password",
            Prompt::Updated => "updated",
            Prompt::Shell => "shell",
            Prompt::Failure(_) => "failure",
        }
    }
}

fn classify(buffer: &str) -> Option<Prompt> {
    let lower = buffer.to_ascii_lowercase();
    if let Some(banner) = FAILURE_BANNERS.iter().find(|b| lower.contains(*b)) {
        return Some(Prompt::Failure((*banner).to_string()));
    }
    if lower.contains("updated successfully") || lower.contains("all authentication tokens updated")
    {
        return Some(Prompt::Updated);
    }
    let tail = lower.trim_end();
    if tail.ends_with(':') {
        if lower.contains("retype") || lower.contains("re-enter") {
            return Some(Prompt::Retype);
        }
        if lower.contains("new password") {
            return Some(Prompt::New);
        }
        if lower.contains("current") || lower.contains("old password") {
            return Some(Prompt::Current);
        }
    }
    if tail.ends_with('#') || tail.ends_with('$') {
        return Some(Prompt::Shell);
    }
    None
}

/// Runs the rotation over `shell`, bounded by one overall `timeout`.
pub async fn rotate_password(
    shell: &mut dyn InteractiveShell,
    rotation: &mut PasswordRotation,
    timeout: Duration,
) -> Result<(), TransportError> {
    let exchange = async {
        while rotation.state() != RotationState::Done {
            let Some(chunk) = shell.recv().await? else {
                // passwd may hang up right after the confirmation is typed
                return match rotation.state() {
                    RotationState::AwaitConfirmation => Ok(()),
                    state => Err(RotationError::Closed(state).into()),
                };
            };
            let text = String::from_utf8_lossy(&chunk);
            if let Some(reply) = rotation.feed(&text)? {
                shell.send(format!("{reply}\n").as_bytes()).await?;
            }
        }
        // the session may already be gone; nothing left to do on failure
        let _ = shell.send(b"exit\n").await;
        Ok::<(), TransportError>(())
    };
    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| TransportError::Timeout {
            command: "passwd".to_string(),
            timeout,
        })?
}
