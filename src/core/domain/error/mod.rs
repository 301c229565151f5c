use std::time::Duration;
use thiserror::Error;

/// The main error type for cluster provisioning operations.
///
/// Every failure surfaced by the platform client, the remote transport,
/// the local stores or the lifecycle controller ends up here. Callers that
/// need to branch on the failure class should use [`PveKubeError::kind`].
#[derive(Error, Debug)]
pub enum PveKubeError {
    /// The virtualization platform endpoint could not be reached or answered
    /// with an unexpected HTTP status.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The platform rejected the supplied credentials.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Input failed validation before any side effect happened.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// A required precondition does not hold (missing master, missing join
    /// credential, missing local artifact, unconfirmed overwrite).
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// The platform accepted the request but the operation failed.
    #[error("Platform error: {0}")]
    Platform(String),

    /// A platform object that must exist could not be found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Remote command execution or file transfer failed.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Local or fetched state could not be parsed.
    #[error("Data error: {0}")]
    Data(String),

    /// A failure attributed to a single cluster node.
    #[error("Node '{node}' failed: {source}")]
    Node {
        node: String,
        #[source]
        source: Box<PveKubeError>,
    },

    /// Local filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of a [`PveKubeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connection,
    Authentication,
    Validation,
    Precondition,
    Platform,
    Transport,
    Data,
    Io,
}

impl PveKubeError {
    /// Wraps `source` with the name of the node it belongs to.
    pub fn for_node(node: impl Into<String>, source: PveKubeError) -> Self {
        PveKubeError::Node {
            node: node.into(),
            source: Box::new(source),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PveKubeError::Connection(_) => ErrorKind::Connection,
            PveKubeError::Authentication(_) => ErrorKind::Authentication,
            PveKubeError::Validation(_) => ErrorKind::Validation,
            PveKubeError::Precondition(_) => ErrorKind::Precondition,
            PveKubeError::Platform(_) | PveKubeError::NotFound(_) => ErrorKind::Platform,
            PveKubeError::Transport(_) => ErrorKind::Transport,
            PveKubeError::Data(_) => ErrorKind::Data,
            PveKubeError::Io(_) => ErrorKind::Io,
            PveKubeError::Node { source, .. } => source.kind(),
        }
    }

    /// Name of the node this error is attributed to, if any.
    pub fn node(&self) -> Option<&str> {
        match self {
            PveKubeError::Node { node, .. } => Some(node),
            _ => None,
        }
    }

    /// Whether re-running the same command may succeed unchanged.
    pub fn is_retryable(&self) -> bool {
        match self {
            PveKubeError::Transport(e) => e.is_retryable(),
            PveKubeError::Node { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for PveKubeError {
    fn from(error: serde_json::Error) -> Self {
        PveKubeError::Data(error.to_string())
    }
}

impl From<serde_yaml::Error> for PveKubeError {
    fn from(error: serde_yaml::Error) -> Self {
        PveKubeError::Data(error.to_string())
    }
}

/// Specialized error type for validation failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Represents a validation failure for a specific field
    #[error("Field '{field}' validation failed: {message}")]
    Field { field: String, message: String },

    /// Represents format/syntax validation failures
    #[error("Format error: {0}")]
    Format(String),

    /// Represents violations of domain constraints
    #[error("Domain constraint violation: {0}")]
    ConstraintViolation(String),
}

impl ValidationError {
    pub fn field(field: impl Into<String>, message: impl Into<String>) -> Self {
        ValidationError::Field {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Failures of the remote command transport.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to reach {address}: {message}")]
    Dial { address: String, message: String },

    #[error("authentication rejected for {user}@{address}")]
    AuthenticationRejected { user: String, address: String },

    #[error("channel failure: {0}")]
    Channel(String),

    #[error("`{command}` exited with status {status}: {output}")]
    ExitStatus {
        command: String,
        status: u32,
        output: String,
    },

    #[error("copy to {path} failed: {message}")]
    Copy { path: String, message: String },

    #[error("`{command}` did not finish within {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("interactive session failed: {0}")]
    Interactive(String),

    #[error("local key material unusable: {0}")]
    Key(String),
}

impl TransportError {
    /// `true` when the remote side refused the offered credentials.
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self, TransportError::AuthenticationRejected { .. })
    }

    /// Failures a later re-invocation may get past without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout { .. } | TransportError::Dial { .. }
        )
    }
}

/// Type alias for Results that may fail with a PveKubeError
pub type PveKubeResult<T> = Result<T, PveKubeError>;
