//! Update check against the lightsailctl version the service advertises

use crate::service::ContainerApiMetadataGetter;
use crate::VERSION;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, warn};

pub const DOWNLOAD_URL: &str =
    "https://lightsail.aws.amazon.com/ls/docs/en_us/articles/amazon-lightsail-install-software";

/// Metadata entry that carries the latest released version
const VERSION_METADATA_NAME: &str = "lightsailctlVersion";

/// Semantic version; accepts a leading "v" and "1" / "1.2" shorthands
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Semver(semver::Version);

impl Semver {
    /// Version of this build
    pub fn current() -> Option<Self> {
        VERSION.parse().ok()
    }
}

impl FromStr for Semver {
    type Err = semver::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.strip_prefix('v').unwrap_or(raw);
        // Build metadata does not take part in ordering
        let raw = raw.split('+').next().unwrap_or(raw);

        let (core, pre) = match raw.split_once('-') {
            Some((core, pre)) => (core, Some(pre)),
            None => (raw, None),
        };

        let mut parts: Vec<&str> = core.split('.').collect();
        if pre.is_none() {
            while parts.len() < 3 {
                parts.push("0");
            }
        }

        let mut canonical = parts.join(".");
        if let Some(pre) = pre {
            canonical.push('-');
            canonical.push_str(pre);
        }

        semver::Version::parse(&canonical).map(Self)
    }
}

impl fmt::Display for Semver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum UpdateCheckError {
    #[error("could not get latest lightsailctl version: {0}")]
    Metadata(anyhow::Error),

    #[error("latest lightsailctl version was not in GetContainerAPIMetadata response")]
    Missing,

    #[error("latest lightsailctl version is not a semver: {0:?}")]
    NotSemver(String),
}

/// Latest lightsailctl version advertised by the container API metadata
pub async fn latest_version<G>(getter: &G) -> Result<Semver, UpdateCheckError>
where
    G: ContainerApiMetadataGetter + ?Sized,
{
    let metadata = getter
        .get_container_api_metadata()
        .await
        .map_err(UpdateCheckError::Metadata)?;

    let raw = metadata
        .iter()
        .rev()
        .find(|entry| entry.get("name").map(String::as_str) == Some(VERSION_METADATA_NAME))
        .and_then(|entry| entry.get("value"))
        .filter(|value| !value.is_empty())
        .ok_or(UpdateCheckError::Missing)?;

    raw.parse()
        .map_err(|_| UpdateCheckError::NotSemver(raw.clone()))
}

/// Warn when a newer lightsailctl is available.
///
/// Never fails: lookup problems are only logged at debug level.
/// Returns the newer version, if any.
pub async fn check_for_updates<G>(getter: &G, in_use: &Semver) -> Option<Semver>
where
    G: ContainerApiMetadataGetter + ?Sized,
{
    match latest_version(getter).await {
        Ok(available) if *in_use < available => {
            warn!(
                "You are using lightsailctl {}, but {} is available.\nTo download, visit {}",
                in_use, available, DOWNLOAD_URL
            );
            Some(available)
        }
        Ok(_) => None,
        Err(e) => {
            debug!("{}", e);
            None
        }
    }
}
