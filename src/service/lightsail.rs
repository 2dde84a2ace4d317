//! Amazon Lightsail adapter

use super::{ContainerApiMetadataGetter, ImageRegistrar, RegisteredImage, RegistryLoginCreator};
use crate::image::registry::RegistryLogin;
use crate::{APP_NAME, VERSION};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_lightsail::config::{FrameworkMetadata, SharedHttpClient};
use aws_sdk_lightsail::error::DisplayErrorContext;
use aws_sdk_lightsail::Client;
use aws_smithy_http_client::tls::rustls_provider::CryptoMode;
use aws_smithy_http_client::tls::{self, TlsContext, TrustStore};
use std::collections::HashMap;
use tracing::debug;

/// Settings applied on top of the default AWS config chain
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    pub region: Option<String>,
    pub profile: Option<String>,
    pub endpoint: Option<String>,
    /// PEM certificates to trust instead of the system roots
    pub ca_bundle: Option<Vec<u8>>,
}

/// Lightsail API client
pub struct LightsailService {
    client: Client,
}

impl LightsailService {
    /// Load AWS config (env, profile, IMDS...) and build a client
    pub async fn connect(options: &ClientOptions) -> anyhow::Result<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());

        if let Some(region) = &options.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(profile) = &options.profile {
            loader = loader.profile_name(profile);
        }
        if let Some(pem) = &options.ca_bundle {
            loader = loader.http_client(https_client_trusting(pem)?);
        }

        let sdk_config = loader.load().await;

        // Shows up as "lib/lightsailctl/<version>" in the user agent
        let mut builder = aws_sdk_lightsail::config::Builder::from(&sdk_config)
            .framework_metadata(FrameworkMetadata::new(APP_NAME, Some(VERSION))?);
        if let Some(endpoint) = &options.endpoint {
            debug!("Using Lightsail endpoint {}", endpoint);
            builder = builder.endpoint_url(endpoint);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
        })
    }
}

/// HTTPS client that trusts only the certificates in `pem`
fn https_client_trusting(pem: &[u8]) -> anyhow::Result<SharedHttpClient> {
    let trust_store = TrustStore::empty().with_pem_certificate(pem.to_vec());
    let tls_context = TlsContext::builder()
        .with_trust_store(trust_store)
        .build()?;

    Ok(aws_smithy_http_client::Builder::new()
        .tls_provider(tls::Provider::Rustls(CryptoMode::AwsLc))
        .tls_context(tls_context)
        .build_https())
}

#[async_trait]
impl RegistryLoginCreator for LightsailService {
    async fn create_registry_login(&self) -> anyhow::Result<RegistryLogin> {
        let output = self
            .client
            .create_container_service_registry_login()
            .send()
            .await
            .map_err(|e| anyhow!("{}", DisplayErrorContext(e)))?;

        let login = output
            .registry_login()
            .context("CreateContainerServiceRegistryLogin returned no registry login")?;

        Ok(RegistryLogin {
            username: login.username().unwrap_or_default().to_string(),
            password: login.password().unwrap_or_default().to_string(),
            registry: login.registry().unwrap_or_default().to_string(),
        })
    }
}

#[async_trait]
impl ImageRegistrar for LightsailService {
    async fn register_container_image(
        &self,
        service: &str,
        label: &str,
        digest: &str,
    ) -> anyhow::Result<RegisteredImage> {
        let output = self
            .client
            .register_container_image()
            .service_name(service)
            .label(label)
            .digest(digest)
            .send()
            .await
            .map_err(|e| anyhow!("{}", DisplayErrorContext(e)))?;

        let image = output
            .container_image()
            .context("RegisterContainerImage returned no container image")?;

        Ok(RegisteredImage {
            image: image.image().unwrap_or_default().to_string(),
            digest: image.digest().unwrap_or_default().to_string(),
        })
    }
}

#[async_trait]
impl ContainerApiMetadataGetter for LightsailService {
    async fn get_container_api_metadata(&self) -> anyhow::Result<Vec<HashMap<String, String>>> {
        let output = self
            .client
            .get_container_api_metadata()
            .send()
            .await
            .map_err(|e| anyhow!("{}", DisplayErrorContext(e)))?;

        Ok(output.metadata().to_vec())
    }
}
