use crate::core::domain::error::ValidationError;
use std::time::{Duration, SystemTime};

/// Authentication ticket returned by `POST /access/ticket`.
#[derive(Debug, Clone)]
pub struct SessionTicket {
    value: String,
    issued_at: SystemTime,
}

impl SessionTicket {
    pub fn new(value: impl Into<String>) -> Result<Self, ValidationError> {
        let value = value.into();
        validate_ticket(&value)?;
        Ok(Self::new_unchecked(value))
    }

    pub(crate) fn new_unchecked(value: String) -> Self {
        Self {
            value,
            issued_at: SystemTime::now(),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.value
    }

    /// `true` once the ticket is older than `lifetime`.
    #[must_use]
    pub fn is_expired(&self, lifetime: Duration) -> bool {
        self.issued_at
            .elapsed()
            .map(|age| age > lifetime)
            .unwrap_or(true)
    }

    #[must_use]
    pub fn as_cookie_header(&self) -> String {
        format!("PVEAuthCookie={}", self.value)
    }
}

pub(crate) fn validate_ticket(ticket: &str) -> Result<(), ValidationError> {
    if ticket.is_empty() {
        return Err(ValidationError::field("ticket", "Ticket cannot be empty"));
    }
    let parts: Vec<&str> = ticket.split(':').collect();
    if parts.len() < 5 || parts[0] != "PVE" {
        return Err(ValidationError::Format(
            "Ticket must start with 'PVE:' and have at least 5 parts".to_string(),
        ));
    }
    Ok(())
}

/// Token sent in the `CSRFPreventionToken` header on writes.
#[derive(Debug, Clone)]
pub struct CsrfToken(String);

impl CsrfToken {
    pub fn new(value: impl Into<String>) -> Result<Self, ValidationError> {
        let value = value.into();
        validate_csrf_token(&value)?;
        Ok(Self(value))
    }

    pub(crate) fn new_unchecked(value: String) -> Self {
        Self(value)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

pub(crate) fn validate_csrf_token(token: &str) -> Result<(), ValidationError> {
    let Some((timestamp, signature)) = token.split_once(':') else {
        return Err(ValidationError::Format(
            "CSRF token must look like '<hex>:<signature>'".to_string(),
        ));
    };
    if timestamp.is_empty() || !timestamp.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ValidationError::Format(
            "CSRF token timestamp must be hexadecimal".to_string(),
        ));
    }
    if signature.is_empty() {
        return Err(ValidationError::Format(
            "CSRF token signature cannot be empty".to_string(),
        ));
    }
    Ok(())
}
