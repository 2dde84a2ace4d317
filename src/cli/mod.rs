//! CLI definitions and the AWS CLI plugin runner

pub mod plugin;

use clap::Parser;

/// lightsailctl - Amazon Lightsail plugin for the AWS CLI
#[derive(Parser, Debug)]
#[command(name = "lightsailctl")]
#[command(author, about, long_about = None, disable_version_flag = true)]
pub struct Cli {
    /// Print the version number and exit
    #[arg(long)]
    pub version: bool,

    /// Run as an AWS CLI plugin
    #[arg(long)]
    pub plugin: bool,

    #[command(flatten)]
    pub input: plugin::PluginArgs,
}

/// Log filter used when `RUST_LOG` is unset.
///
/// Debug runs also surface the AWS SDK's request logs.
pub fn default_log_filter(debug: bool) -> &'static str {
    if debug {
        "lightsailctl=debug,aws_config=debug,aws_smithy_runtime=debug,\
         aws_smithy_runtime_api=debug,aws_smithy_http_client=debug,info"
    } else {
        "info"
    }
}
