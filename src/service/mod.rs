//! Lightsail container service operations needed for a push

pub mod lightsail;

use crate::image::registry::RegistryLogin;
use async_trait::async_trait;
use std::collections::HashMap;

/// Image registered with a container service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredImage {
    /// Name to refer to the image by in deployments, e.g. ":doge.www.12"
    pub image: String,
    pub digest: String,
}

/// Creates short-lived logins to the service registry
#[async_trait]
pub trait RegistryLoginCreator: Send + Sync {
    async fn create_registry_login(&self) -> anyhow::Result<RegistryLogin>;
}

/// Registers pushed digests with a container service
#[async_trait]
pub trait ImageRegistrar: Send + Sync {
    async fn register_container_image(
        &self,
        service: &str,
        label: &str,
        digest: &str,
    ) -> anyhow::Result<RegisteredImage>;
}

/// Reads the container API metadata (name/value pairs)
#[async_trait]
pub trait ContainerApiMetadataGetter: Send + Sync {
    async fn get_container_api_metadata(&self) -> anyhow::Result<Vec<HashMap<String, String>>>;
}

pub use lightsail::LightsailService;
