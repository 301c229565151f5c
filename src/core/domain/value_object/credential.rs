use crate::core::domain::error::ValidationError;
use zxcvbn::zxcvbn;

/// Platform account name, without the realm suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformUsername(String);

impl PlatformUsername {
    pub fn new(username: impl Into<String>) -> Result<Self, ValidationError> {
        let username = username.into();
        validate_username(&username)?;
        Ok(Self(username))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

pub(crate) fn validate_username(username: &str) -> Result<(), ValidationError> {
    if username.is_empty() {
        return Err(ValidationError::field("username", "Username cannot be empty"));
    }
    if username.len() > 64 {
        return Err(ValidationError::Format(
            "Username cannot exceed 64 characters".to_string(),
        ));
    }
    if username.contains('@') {
        return Err(ValidationError::Format(
            "Username must not carry the realm; pass it separately".to_string(),
        ));
    }
    if username.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ValidationError::Format(
            "Username cannot contain whitespace".to_string(),
        ));
    }
    Ok(())
}

/// Plaintext platform password, kept only as long as a session needs it.
#[derive(Clone, PartialEq, Eq)]
pub struct PlatformPassword(String);

impl PlatformPassword {
    pub fn new(
        password: impl Into<String>,
        min_score: Option<zxcvbn::Score>,
    ) -> Result<Self, ValidationError> {
        let password = password.into();
        validate_password(&password, min_score)?;
        Ok(Self(password))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for PlatformPassword {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PlatformPassword(***)")
    }
}

pub(crate) fn validate_password(
    password: &str,
    min_score: Option<zxcvbn::Score>,
) -> Result<(), ValidationError> {
    if password.is_empty() {
        return Err(ValidationError::field("password", "Password cannot be empty"));
    }
    if password.len() > 128 {
        return Err(ValidationError::Format(
            "Password cannot exceed 128 characters".to_string(),
        ));
    }
    if let Some(min_score) = min_score {
        if zxcvbn(password, &[]).score() < min_score {
            return Err(ValidationError::ConstraintViolation(
                "Password is too weak (increase complexity)".to_string(),
            ));
        }
    }
    Ok(())
}

/// Authentication realm (`pam`, `pve` or a configured directory realm).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformRealm(String);

impl PlatformRealm {
    pub fn new(realm: impl Into<String>) -> Result<Self, ValidationError> {
        let realm = realm.into();
        validate_realm(&realm)?;
        Ok(Self(realm))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

pub(crate) fn validate_realm(realm: &str) -> Result<(), ValidationError> {
    if realm.is_empty() {
        return Err(ValidationError::field("realm", "Realm cannot be empty"));
    }
    if realm.len() > 32 {
        return Err(ValidationError::Format(
            "Realm cannot exceed 32 characters".to_string(),
        ));
    }
    if !realm
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ValidationError::Format(
            "Realm can only contain alphanumerics, '-' and '_'".to_string(),
        ));
    }
    Ok(())
}
