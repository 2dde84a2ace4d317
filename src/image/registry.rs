//! Registry credentials and remote image addressing

use std::fmt;

/// Suffix that selects the service's staging repository ("sr").
///
/// The staging repository only retains tags generated right before
/// a digest is registered with the container service.
pub const STAGING_REPOSITORY_SUFFIX: &str = "/sr";

/// Short-lived login handed out by the container service
#[derive(Clone, PartialEq, Eq)]
pub struct RegistryLogin {
    pub username: String,
    pub password: String,
    /// Registry host, e.g. "123456789012.dkr.ecr.us-west-2.amazonaws.com"
    pub registry: String,
}

/// Credentials and address sufficient to push into the staging repository
#[derive(Clone, PartialEq, Eq)]
pub struct RegistryCredential {
    pub username: String,
    pub password: String,
    pub server_address: String,
}

impl RegistryCredential {
    /// Build push credentials for the staging repository of a registry login
    pub fn for_staging(login: RegistryLogin) -> Self {
        Self {
            username: login.username,
            password: login.password,
            server_address: format!("{}{}", login.registry, STAGING_REPOSITORY_SUFFIX),
        }
    }
}

impl fmt::Debug for RegistryLogin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryLogin")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("registry", &self.registry)
            .finish()
    }
}

impl fmt::Debug for RegistryCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryCredential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("server_address", &self.server_address)
            .finish()
    }
}

/// Everything needed to push one image to the staging repository:
/// the credential with its server address, plus a unique tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteImage {
    pub credential: RegistryCredential,
    pub tag: String,
}

impl RemoteImage {
    pub fn new(credential: RegistryCredential, tag: impl Into<String>) -> Self {
        Self {
            credential,
            tag: tag.into(),
        }
    }

    /// Repository part of the reference (the server address)
    pub fn repository(&self) -> &str {
        &self.credential.server_address
    }

    /// Fully qualified reference, "<server address>:<tag>"
    pub fn reference(&self) -> String {
        format!("{}:{}", self.credential.server_address, self.tag)
    }
}
