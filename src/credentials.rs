//! Access credentials and the hot-swappable provider that hands them to the signer.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// Access key, secret key and optional session token.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
    pub security_token: Option<String>,
}

impl Credentials {
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            security_token: None,
        }
    }

    pub fn with_security_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.security_token = (!token.is_empty()).then_some(token);
        self
    }

    /// Requests made with anonymous credentials are sent unsigned.
    pub fn is_anonymous(&self) -> bool {
        self.access_key.is_empty() || self.secret_key.is_empty()
    }

    pub(crate) fn token(&self) -> Option<&str> {
        self.security_token.as_deref().filter(|t| !t.is_empty())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"******")
            .field("security_token", &self.token().map(|_| "******"))
            .finish()
    }
}

/// Thread-safe holder of the current credentials.
///
/// Every request takes one [`snapshot`](Self::snapshot) and signs with it, so a
/// [`refresh`](Self::refresh) never affects a request that is already being signed
/// or is in flight.
#[derive(Debug, Default)]
pub struct CredentialProvider {
    current: RwLock<Arc<Credentials>>,
}

impl CredentialProvider {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            current: RwLock::new(Arc::new(credentials)),
        }
    }

    /// Returns the credentials in effect right now.
    pub fn snapshot(&self) -> Arc<Credentials> {
        let guard = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    /// Swaps in new credentials for all subsequent requests.
    pub fn refresh(&self, credentials: Credentials) {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::new(credentials);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_keeps_existing_snapshots() {
        let provider = CredentialProvider::new(Credentials::new("ak-1", "sk-1"));
        let before = provider.snapshot();

        provider.refresh(Credentials::new("ak-2", "sk-2").with_security_token("tok"));

        assert_eq!(before.access_key, "ak-1");
        let after = provider.snapshot();
        assert_eq!(after.access_key, "ak-2");
        assert_eq!(after.token(), Some("tok"));
    }

    #[test]
    fn test_anonymous_and_redacted_debug() {
        assert!(Credentials::default().is_anonymous());
        assert!(Credentials::new("ak", "").is_anonymous());

        let creds = Credentials::new("ak", "secret").with_security_token("session");
        let printed = format!("{:?}", creds);
        assert!(!printed.contains("secret"));
        assert!(!printed.contains("session"));
        assert!(printed.contains("ak"));
    }
}
