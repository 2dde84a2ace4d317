//! Local container engine operations needed for a push

pub mod docker;

use crate::image::oci::Platform;
use crate::image::registry::RemoteImage;
use async_trait::async_trait;
use std::pin::Pin;
use tokio::io::AsyncRead;

/// Raw push status stream: JSON status records, one per line
pub type StatusStream = Pin<Box<dyn AsyncRead + Send>>;

/// Client-side operations against the local container engine
#[async_trait]
pub trait ImageEngine: Send + Sync {
    /// Add `target` as another reference to the local image `source`
    async fn tag_image(&self, source: &str, target: &str) -> anyhow::Result<()>;

    /// Remove the local reference `reference`
    async fn untag_image(&self, reference: &str) -> anyhow::Result<()>;

    /// Start pushing `remote` for `platform` and return its status stream
    async fn push_image(
        &self,
        remote: &RemoteImage,
        platform: &Platform,
    ) -> anyhow::Result<StatusStream>;
}

pub use docker::DockerEngine;
