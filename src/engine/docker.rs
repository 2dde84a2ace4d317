//! Docker Engine adapter
//!
//! Tagging and removal go through bollard. Pushes talk to the engine API
//! directly: the push has to select a platform, and the status records must
//! reach the scanner untouched, `id` and `aux` included.

use super::{ImageEngine, StatusStream};
use crate::image::oci::Platform;
use crate::image::registry::{RegistryCredential, RemoteImage};
use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use bollard::auth::DockerCredentials;
use bollard::image::TagImageOptions;
use bollard::Docker;
use bytes::Bytes;
use futures_util::TryStreamExt;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Body, Incoming};
use hyper::header::CONTENT_TYPE;
use hyper::http::uri::PathAndQuery;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use hyperlocal::{UnixClientExt, UnixConnector};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio_util::io::StreamReader;
use tracing::debug;

const DEFAULT_SOCKET: &str = "/var/run/docker.sock";
const REGISTRY_AUTH_HEADER: &str = "X-Registry-Auth";

/// Where the engine API listens
#[derive(Debug, Clone, PartialEq, Eq)]
enum EngineHost {
    Unix(PathBuf),
    /// Plain HTTP `host:port`
    Tcp(String),
}

impl EngineHost {
    fn from_env() -> anyhow::Result<Self> {
        Self::parse(
            std::env::var("DOCKER_HOST").ok().as_deref(),
            std::env::var_os("DOCKER_TLS_VERIFY").is_some(),
        )
    }

    /// Resolve a DOCKER_HOST value; unset means the local socket
    fn parse(docker_host: Option<&str>, tls_verify: bool) -> anyhow::Result<Self> {
        let host = match docker_host.map(str::trim) {
            None | Some("") => return Ok(Self::Unix(PathBuf::from(DEFAULT_SOCKET))),
            Some(host) => host,
        };

        if let Some(path) = host.strip_prefix("unix://") {
            return Ok(Self::Unix(PathBuf::from(path)));
        }

        let authority = host
            .strip_prefix("tcp://")
            .or_else(|| host.strip_prefix("http://"));
        match authority {
            Some(_) if tls_verify => {
                bail!("pushing through a TLS-protected Docker host is not supported: {}", host)
            }
            Some(authority) => Ok(Self::Tcp(authority.trim_end_matches('/').to_string())),
            None => bail!("unsupported DOCKER_HOST {:?}", host),
        }
    }
}

/// Docker Engine reached through DOCKER_HOST, or the local socket
pub struct DockerEngine {
    docker: Docker,
    host: EngineHost,
}

impl DockerEngine {
    /// Connect to the engine
    pub fn connect() -> anyhow::Result<Self> {
        let host = EngineHost::from_env()?;
        let docker =
            Docker::connect_with_defaults().context("Failed to connect to the Docker Engine")?;
        Ok(Self { docker, host })
    }

    async fn post(
        &self,
        path_and_query: &str,
        registry_auth: &str,
    ) -> anyhow::Result<Response<Incoming>> {
        path_and_query
            .parse::<PathAndQuery>()
            .with_context(|| format!("invalid engine request path {:?}", path_and_query))?;

        let request = |uri: Uri| {
            Request::post(uri)
                .header(CONTENT_TYPE, "application/json")
                .header(REGISTRY_AUTH_HEADER, registry_auth)
                .body(Empty::<Bytes>::new())
        };

        let response = match &self.host {
            EngineHost::Unix(socket) => {
                let client: Client<UnixConnector, Empty<Bytes>> = Client::unix();
                let uri = hyperlocal::Uri::new(socket, path_and_query).into();
                client.request(request(uri)?).await?
            }
            EngineHost::Tcp(authority) => {
                let client = Client::builder(TokioExecutor::new()).build_http();
                let uri = format!("http://{}{}", authority, path_and_query).parse()?;
                client.request(request(uri)?).await?
            }
        };

        Ok(response)
    }
}

#[async_trait]
impl ImageEngine for DockerEngine {
    async fn tag_image(&self, source: &str, target: &str) -> anyhow::Result<()> {
        let (repo, tag) = split_reference(target);
        let options = TagImageOptions {
            repo: repo.to_string(),
            tag: tag.unwrap_or("latest").to_string(),
        };

        debug!("Tagging {} as {}", source, target);
        self.docker.tag_image(source, Some(options)).await?;
        Ok(())
    }

    async fn untag_image(&self, reference: &str) -> anyhow::Result<()> {
        debug!("Removing {}", reference);
        self.docker.remove_image(reference, None, None).await?;
        Ok(())
    }

    async fn push_image(
        &self,
        remote: &RemoteImage,
        platform: &Platform,
    ) -> anyhow::Result<StatusStream> {
        let path = push_path(remote, platform)?;
        let auth = registry_auth(&remote.credential)?;

        debug!("Pushing {} for {}", remote.reference(), platform);
        let response = self.post(&path, &auth).await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.into_body().collect().await?.to_bytes();
            return Err(engine_error(status, &body));
        }

        Ok(status_stream(response.into_body()))
    }
}

#[derive(Serialize)]
struct PushQuery<'a> {
    tag: &'a str,
    /// JSON-encoded OCI platform; the engine pushes only that variant
    platform: String,
}

/// Request path for pushing `remote`, restricted to `platform`
fn push_path(remote: &RemoteImage, platform: &Platform) -> anyhow::Result<String> {
    let query = PushQuery {
        tag: &remote.tag,
        platform: serde_json::to_string(platform)?,
    };
    Ok(format!(
        "/images/{}/push?{}",
        remote.repository(),
        serde_urlencoded::to_string(&query)?
    ))
}

/// X-Registry-Auth value for `credential`
fn registry_auth(credential: &RegistryCredential) -> anyhow::Result<String> {
    let credentials = DockerCredentials {
        username: Some(credential.username.clone()),
        password: Some(credential.password.clone()),
        serveraddress: Some(credential.server_address.clone()),
        ..Default::default()
    };
    Ok(URL_SAFE.encode(serde_json::to_vec(&credentials)?))
}

/// Expose a response body as the raw status stream
fn status_stream<B>(body: B) -> StatusStream
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    Box::pin(StreamReader::new(
        body.into_data_stream().map_err(std::io::Error::other),
    ))
}

#[derive(Deserialize)]
struct EngineErrorBody {
    #[serde(default)]
    message: String,
}

fn engine_error(status: StatusCode, body: &[u8]) -> anyhow::Error {
    match serde_json::from_slice::<EngineErrorBody>(body) {
        Ok(parsed) if !parsed.message.is_empty() => {
            anyhow!("Error response from daemon: {}", parsed.message)
        }
        _ => anyhow!(
            "Error response from daemon: {} {}",
            status,
            String::from_utf8_lossy(body).trim()
        ),
    }
}

/// Split "repository[:tag]" without mistaking a registry port for a tag
fn split_reference(reference: &str) -> (&str, Option<&str>) {
    match reference.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo, Some(tag)),
        _ => (reference, None),
    }
}
