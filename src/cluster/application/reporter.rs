//! Human-readable progress for whoever drives a lifecycle operation.

use std::sync::Mutex;
use tracing::{info, warn};

/// Receives progress messages; what happens to them is up to the caller.
pub trait ProgressReporter: Send + Sync + 'static {
    fn emit(&self, node: Option<&str>, message: String);

    /// Something went wrong but the operation carries on.
    fn emit_warning(&self, node: Option<&str>, message: String) {
        self.emit(node, message);
    }
}

/// Forwards progress to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ProgressReporter for TracingReporter {
    fn emit(&self, node: Option<&str>, message: String) {
        match node {
            Some(node) => info!(%node, "{message}"),
            None => info!("{message}"),
        }
    }

    fn emit_warning(&self, node: Option<&str>, message: String) {
        match node {
            Some(node) => warn!(%node, "{message}"),
            None => warn!("{message}"),
        }
    }
}

/// Keeps every message in memory, in order.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    messages: Mutex<Vec<String>>,
}

impl RecordingReporter {
    pub fn messages(&self) -> Vec<String> {
        self.messages
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }
}

impl ProgressReporter for RecordingReporter {
    fn emit(&self, node: Option<&str>, message: String) {
        let line = match node {
            Some(node) => format!("[{node}] {message}"),
            None => message,
        };
        if let Ok(mut messages) = self.messages.lock() {
            messages.push(line);
        }
    }

    fn emit_warning(&self, node: Option<&str>, message: String) {
        self.emit(node, format!("warning: {message}"));
    }
}
