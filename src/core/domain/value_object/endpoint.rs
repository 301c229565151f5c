use crate::core::domain::error::ValidationError;
use std::fmt;
use url::Url;

const MAX_HOSTNAME_LENGTH: usize = 253;
const MAX_LABEL_LENGTH: usize = 63;

/// Hostname or IPv4 address of the platform API endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformHost(String);

impl PlatformHost {
    pub fn new(host: impl Into<String>) -> Result<Self, ValidationError> {
        let host = host.into();
        validate_host(&host)?;
        Ok(Self(host))
    }

    pub(crate) fn new_unchecked(host: String) -> Self {
        Self(host)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlatformHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub(crate) fn validate_host(host: &str) -> Result<(), ValidationError> {
    if host.is_empty() {
        return Err(ValidationError::field("host", "Host cannot be empty"));
    }
    if host.len() > MAX_HOSTNAME_LENGTH {
        return Err(ValidationError::Format(format!(
            "Host cannot exceed {MAX_HOSTNAME_LENGTH} characters"
        )));
    }
    if host.parse::<std::net::Ipv4Addr>().is_ok() {
        return Ok(());
    }
    for label in host.split('.') {
        if label.is_empty() || label.len() > MAX_LABEL_LENGTH {
            return Err(ValidationError::Format(format!(
                "Host label must be between 1 and {MAX_LABEL_LENGTH} characters"
            )));
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(ValidationError::Format(
                "Host labels can only contain alphanumeric characters and hyphens".to_string(),
            ));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(ValidationError::Format(
                "Host labels cannot start or end with a hyphen".to_string(),
            ));
        }
    }
    Ok(())
}

/// TCP port of the platform API endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformPort(u16);

impl PlatformPort {
    pub fn new(port: u16) -> Result<Self, ValidationError> {
        validate_port(port)?;
        Ok(Self(port))
    }

    #[must_use]
    pub fn get(&self) -> u16 {
        self.0
    }
}

impl Default for PlatformPort {
    fn default() -> Self {
        Self(8006)
    }
}

pub(crate) fn validate_port(port: u16) -> Result<(), ValidationError> {
    if port == 0 {
        return Err(ValidationError::field("port", "Port cannot be 0"));
    }
    Ok(())
}

/// Base URL the API client prefixes every request path with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformUrl(Url);

impl PlatformUrl {
    pub fn from_parts(
        host: &PlatformHost,
        port: PlatformPort,
        secure: bool,
    ) -> Result<Self, ValidationError> {
        let scheme = if secure { "https" } else { "http" };
        Self::parse(&format!("{scheme}://{}:{}/", host.as_str(), port.get()))
    }

    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let url = Url::parse(raw)
            .map_err(|e| ValidationError::Format(format!("Invalid endpoint URL '{raw}': {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ValidationError::ConstraintViolation(format!(
                "Unsupported scheme '{}'",
                url.scheme()
            )));
        }
        Ok(Self(url))
    }

    /// Joins an API path under `/api2/json/`.
    #[must_use]
    pub fn api(&self, path: &str) -> String {
        format!(
            "{}/api2/json/{}",
            self.0.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}
