//! OCI platform types

use serde::Serialize;
use std::fmt;

/// Target OS and architecture of an image variant.
///
/// Serializes to the JSON the engine takes as the push `platform` query value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    pub fn new(os: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            architecture: architecture.into(),
            os: os.into(),
            variant: None,
        }
    }

    /// The only platform Lightsail container services run
    pub fn linux_amd64() -> Self {
        Self::new("linux", "amd64")
    }

    /// Check whether an engine error message says the image lacks this platform.
    ///
    /// Engines phrase it as either "does not provide the specified platform
    /// (os/arch)" or "does not match the specified platform (os/arch)",
    /// and the message may arrive wrapped in other text.
    pub fn is_mismatch_message(&self, message: &str) -> bool {
        let wanted = format!("the specified platform ({}/{})", self.os, self.architecture);
        ["does not provide ", "does not match "]
            .iter()
            .any(|verb| message.contains(&format!("{}{}", verb, wanted)))
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::linux_amd64()
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{}", variant)?;
        }
        Ok(())
    }
}
