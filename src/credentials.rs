//! Backend-service credential.
//!
//! The streaming UI behind the tunnel authenticates with a shared secret that
//! end users must never see. It is read from the environment only and is not
//! part of [`crate::config::Config`], so nothing that serializes configuration
//! can leak it.

use std::fmt;
use std::sync::Arc;

use tracing::warn;

/// Environment variable holding the backend credential.
pub const CREDENTIALS_ENV: &str = "TUNNELVIEW_BACKEND_CREDENTIALS";

/// Development fallback when the variable is unset.
const DEV_CREDENTIALS: &str = "helix";

/// Supplies the credential substituted into relayed requests.
#[derive(Clone)]
pub struct CredentialProvider {
    secret: Arc<str>,
}

impl CredentialProvider {
    /// Read the credential from [`CREDENTIALS_ENV`], falling back to the
    /// development default with a warning.
    pub fn from_env() -> Self {
        match std::env::var(CREDENTIALS_ENV) {
            Ok(value) if !value.is_empty() => Self::new(value),
            _ => {
                warn!("{CREDENTIALS_ENV} not set, using development backend credentials");
                Self::new(DEV_CREDENTIALS)
            }
        }
    }

    pub fn new(secret: impl Into<Arc<str>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// `Authorization` header value for backend requests.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.secret)
    }
}

// Redacted so the secret never lands in logs through `{:?}`.
impl fmt::Debug for CredentialProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialProvider")
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_value() {
        let creds = CredentialProvider::new("s3cret");
        assert_eq!(creds.bearer(), "Bearer s3cret");
        assert_eq!(creds.secret(), "s3cret");
    }

    #[test]
    fn test_debug_is_redacted() {
        let creds = CredentialProvider::new("s3cret");
        let dbg = format!("{creds:?}");
        assert!(!dbg.contains("s3cret"));
    }
}
