//! Broker credentials.
//!
//! The publisher asks its [`CredentialSource`] for fresh credentials before
//! every connect attempt, so a rotating source (a secret store lease, a
//! mounted file) is picked up on the next reconnect without any renewal
//! logic here.

use std::fmt;

use async_trait::async_trait;

use super::Result;

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Supplies the credentials used for the next connection.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn current(&self) -> Result<Credentials>;
}

/// Fixed credentials from configuration.
#[derive(Debug, Clone)]
pub struct StaticCredentials(Credentials);

impl StaticCredentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self(Credentials::new(user, password))
    }
}

#[async_trait]
impl CredentialSource for StaticCredentials {
    async fn current(&self) -> Result<Credentials> {
        Ok(self.0.clone())
    }
}
