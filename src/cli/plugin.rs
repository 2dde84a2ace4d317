//! AWS CLI plugin protocol
//!
//! The AWS CLI `lightsail` customizations invoke this binary with a JSON
//! envelope naming the operation, its payload and the caller's settings.

use crate::engine::DockerEngine;
use crate::image::{ImagePusher, PushRequest};
use crate::service::lightsail::{ClientOptions, LightsailService};
use crate::update::{self, Semver};
use crate::LightsailctlError;
use anyhow::Context;
use clap::Args;
use serde::Deserialize;
use std::io::{self, Read};
use tracing::debug;

const PUSH_CONTAINER_IMAGE: &str = "PushContainerImage";
const PEM_CERTIFICATE_HEADER: &str = "-----BEGIN CERTIFICATE-----";

/// Arguments carrying the plugin envelope
#[derive(Args, Debug, Default)]
pub struct PluginArgs {
    /// Plugin payload
    #[arg(long, value_name = "PAYLOAD")]
    pub input: Option<String>,

    /// Receive plugin payload on stdin
    #[arg(long)]
    pub input_stdin: bool,
}

/// Plugin envelope
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Input {
    #[serde(default)]
    pub input_version: String,
    #[serde(default)]
    pub operation: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub configuration: OperationConfig,
}

/// Settings forwarded by the AWS CLI
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationConfig {
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub profile: String,
    #[serde(default)]
    pub ca_bundle: String,
    #[serde(default, rename = "doNotVerifySSL")]
    pub do_not_verify_ssl: bool,
    /// Version of the calling CLI, for diagnostics
    #[serde(default)]
    pub cli_version: String,
}

impl OperationConfig {
    /// AWS client settings derived from the caller's configuration
    pub fn client_options(&self) -> anyhow::Result<ClientOptions> {
        if self.do_not_verify_ssl {
            anyhow::bail!(
                "doNotVerifySSL is not supported: TLS certificates are always verified, \
                 use caBundle to trust a private certificate authority"
            );
        }

        let ca_bundle = if self.ca_bundle.is_empty() {
            None
        } else {
            let pem = std::fs::read(&self.ca_bundle).context("read CA bundle file")?;
            if !String::from_utf8_lossy(&pem).contains(PEM_CERTIFICATE_HEADER) {
                anyhow::bail!("CA bundle {:?} contains no PEM certificates", self.ca_bundle);
            }
            Some(pem)
        };

        let endpoint = self.endpoint.trim_end_matches('/');

        Ok(ClientOptions {
            region: non_empty(&self.region),
            profile: non_empty(&self.profile),
            endpoint: non_empty(endpoint),
            ca_bundle,
        })
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

#[derive(Debug, Default, Deserialize)]
struct PushContainerImagePayload {
    #[serde(default)]
    service: String,
    #[serde(default)]
    image: String,
    #[serde(default)]
    label: String,
}

/// Decode and validate the envelope
pub fn parse_input<R: Read>(reader: R) -> crate::Result<Input> {
    let input: Input = serde_json::from_reader(reader).map_err(|e| {
        LightsailctlError::InvalidInput(format!("unable to unmarshal JSON input: {}", e))
    })?;

    if input.input_version.parse::<u64>().is_err() {
        return Err(LightsailctlError::InvalidInput(
            "invalid inputVersion: it must contain a non-negative number".to_string(),
        ));
    }

    Ok(input)
}

/// Read the envelope from `--input` or stdin
pub fn read_input(args: &PluginArgs) -> anyhow::Result<Input> {
    let parsed = if args.input_stdin {
        parse_input(io::stdin().lock())
    } else {
        match args.input.as_deref() {
            Some(payload) if !payload.is_empty() => parse_input(payload.as_bytes()),
            _ => anyhow::bail!(
                "no plugin input: either {:?} or {:?} flag must be specified",
                "input",
                "input-stdin"
            ),
        }
    };

    parsed.context("invalid plugin input")
}

/// Turn a PushContainerImage payload into a request
pub fn parse_push_payload(payload: &serde_json::Value) -> crate::Result<PushRequest> {
    let payload = PushContainerImagePayload::deserialize(payload)?;
    PushRequest::new(payload.service, payload.image, payload.label)
}

/// Run the operation named in the envelope
pub async fn execute(input: Input) -> anyhow::Result<()> {
    debug!(
        "Plugin operation {} (input version {}, CLI version {})",
        input.operation, input.input_version, input.configuration.cli_version
    );

    match input.operation.as_str() {
        PUSH_CONTAINER_IMAGE => push_container_image(&input).await,
        other => Err(LightsailctlError::UnknownOperation(other.to_string()).into()),
    }
}

async fn push_container_image(input: &Input) -> anyhow::Result<()> {
    let options = input.configuration.client_options()?;
    let service = LightsailService::connect(&options).await?;

    if let Some(in_use) = Semver::current() {
        update::check_for_updates(&service, &in_use).await;
    }

    let request = parse_push_payload(&input.payload)
        .context("unable to parse the input's payload field")?;

    let engine = DockerEngine::connect()?;

    let mut progress = io::stderr();
    let mut out = io::stdout();
    ImagePusher::new(&service, &engine)
        .push(&request, &mut progress, &mut out)
        .await?;

    Ok(())
}
