//! AUTH secret checking.

use std::collections::HashSet;
use std::fmt::Debug;

use serde::Serialize;

/// An opaque secret presented by a client in `AUTH`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Secret(String);

impl Secret {
    pub fn new<S: Into<String>>(value: S) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Body of the successful `AUTH` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthGrant {
    pub identity: String,
    pub identity_url: String,
    pub permission_count: usize,
}

/// Used by the session to decide whether an `AUTH` secret is accepted.
pub trait Authorizer: Send + Sync + Debug {
    fn authorize(&self, remote_address: &str, tls: bool, secret: &Secret) -> Option<AuthGrant>;
}

/// Accepts any of a fixed set of secrets, granting full access.
#[derive(Debug, Clone, Default)]
pub struct StaticSecretAuthorizer {
    secrets: HashSet<Secret>,
}

impl StaticSecretAuthorizer {
    pub fn from_secrets<I, S>(secrets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let secrets = secrets.into_iter().map(Secret::new).collect();
        Self { secrets }
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }
}

impl Authorizer for StaticSecretAuthorizer {
    fn authorize(&self, _remote_address: &str, _tls: bool, secret: &Secret) -> Option<AuthGrant> {
        self.secrets.contains(secret).then(|| AuthGrant {
            identity: "static".to_string(),
            identity_url: String::new(),
            permission_count: 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_configured_secrets_are_accepted() {
        let auth = StaticSecretAuthorizer::from_secrets(["s3cret", "other"]);
        assert!(auth
            .authorize("127.0.0.1:1", false, &Secret::new("s3cret"))
            .is_some());
        assert!(auth
            .authorize("127.0.0.1:1", false, &Secret::new("nope"))
            .is_none());
        assert!(StaticSecretAuthorizer::default().is_empty());
    }
}
