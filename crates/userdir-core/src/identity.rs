//! Caller identity collaborator interface.
//!
//! The host application decides who the current caller is; the delegate
//! only consumes that identity when `pass-through-caller` binding is
//! configured. The provider is injected, never looked up globally.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

/// An authenticated directory principal: a bind DN plus its secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    /// Distinguished name the principal binds as
    pub dn: String,

    /// Bind secret
    #[serde(skip_serializing)]
    pub secret: SecretString,
}

impl Principal {
    /// Creates a new principal.
    #[must_use]
    pub fn new(dn: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            secret: SecretString::from(secret.into()),
        }
    }

    /// Returns the bind DN.
    #[must_use]
    pub fn dn(&self) -> &str {
        &self.dn
    }

    /// Returns the bind secret.
    #[must_use]
    pub fn secret(&self) -> &str {
        self.secret.expose_secret()
    }
}

/// Supplies the identity of the current caller.
///
/// Returning `None` means the caller is anonymous; the delegate then binds
/// with an empty DN and password.
pub trait IdentityProvider: Send + Sync {
    /// Returns the current caller's principal, if any.
    fn current_principal(&self) -> Option<Principal>;
}

/// Identity provider that never reports a caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymousIdentity;

impl IdentityProvider for AnonymousIdentity {
    fn current_principal(&self) -> Option<Principal> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn principal_accessors() {
        let principal = Principal::new("cn=admin,dc=example,dc=com", "secret");
        assert_eq!(principal.dn(), "cn=admin,dc=example,dc=com");
        assert_eq!(principal.secret(), "secret");
    }

    #[test]
    fn principal_debug_redacts_secret() {
        let principal = Principal::new("cn=admin,dc=example,dc=com", "hunter2");
        let rendered = format!("{principal:?}");
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn principal_serialization_skips_secret() {
        let principal = Principal::new("cn=admin,dc=example,dc=com", "hunter2");
        let json = serde_json::to_string(&principal).unwrap();
        assert!(json.contains("cn=admin"));
        assert!(!json.contains("hunter2"));
    }

    #[test]
    fn anonymous_identity() {
        assert!(AnonymousIdentity.current_principal().is_none());
    }
}
