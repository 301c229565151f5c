//! Opaque join token handed to operators so another workstation can attach
//! to a running cluster. The token is the base64 (standard alphabet) text of
//! the master's IPv4 address.

use crate::core::domain::error::{PveKubeError, PveKubeResult};
use base64::{Engine, engine::general_purpose::STANDARD};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinToken(String);

impl JoinToken {
    /// Encodes a master address into a token.
    pub fn encode(master_address: &str) -> Self {
        Self(STANDARD.encode(master_address.as_bytes()))
    }

    /// Wraps a token string received from an operator.
    pub fn from_string(token: impl Into<String>) -> Self {
        Self(token.into().trim().to_string())
    }

    /// Decodes the token into the master's IPv4 address.
    ///
    /// # Errors
    /// Returns `PveKubeError::Data` when the token is not base64, not UTF-8
    /// or does not carry a dotted-quad IPv4 address.
    pub fn decode(&self) -> PveKubeResult<String> {
        let bytes = STANDARD
            .decode(self.0.as_bytes())
            .map_err(|e| PveKubeError::Data(format!("join token is not valid base64: {e}")))?;
        let address = String::from_utf8(bytes)
            .map_err(|_| PveKubeError::Data("join token does not decode to text".to_string()))?;
        if !is_ipv4(&address) {
            return Err(PveKubeError::Data(format!(
                "join token decodes to '{address}', which is not an IPv4 address"
            )));
        }
        Ok(address)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JoinToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Accepts exactly four dot-separated decimal groups, each within 0-255.
pub fn is_ipv4(candidate: &str) -> bool {
    let groups: Vec<&str> = candidate.split('.').collect();
    if groups.len() != 4 {
        return false;
    }
    groups.iter().all(|group| {
        !group.is_empty()
            && group.len() <= 3
            && group.chars().all(|c| c.is_ascii_digit())
            && group.parse::<u16>().is_ok_and(|value| value <= 255)
    })
}
