//! lightsailctl - AWS CLI plugin for Amazon Lightsail container services
//!
//! This crate pushes a local container image into the staging repository of
//! a Lightsail container service and registers the pushed digest with the
//! service, so the image can be referenced in deployments.

pub mod cli;
pub mod engine;
pub mod image;
pub mod service;
pub mod update;

use image::oci::Platform;
use thiserror::Error;

/// Main error type for lightsailctl operations
#[derive(Error, Debug)]
pub enum LightsailctlError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    InvalidInput(String),

    #[error("unknown plugin operation: {0:?}")]
    UnknownOperation(String),

    /// Registry login could not be created
    #[error(transparent)]
    Authentication(anyhow::Error),

    /// Local image could not be tagged with the remote reference
    #[error(transparent)]
    Tag(anyhow::Error),

    /// Push call or push status stream failed
    #[error(transparent)]
    Push(anyhow::Error),

    /// The image has no variant for the requested platform
    #[error("image does not provide {platform} platform")]
    PlatformMismatch {
        platform: Platform,
        #[source]
        cause: anyhow::Error,
    },

    #[error("image push response does not contain the image digest")]
    MissingDigest,

    /// Pushed digest could not be registered with the container service
    #[error(transparent)]
    Registration(anyhow::Error),

    /// Temporary tag could not be removed; only ever logged
    #[error("untag {reference:?}: {cause}")]
    Untag {
        reference: String,
        cause: anyhow::Error,
    },

    #[error("deadline exceeded while pushing image")]
    DeadlineExceeded,

    #[error("random source failure: {0}")]
    Entropy(#[from] rand::Error),

    #[error("clock error: {0}")]
    Clock(String),
}

pub type Result<T> = std::result::Result<T, LightsailctlError>;

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "lightsailctl";
