//! Command-line argument parsing

use crate::config::{PushImagesOptions, RegistryOptions};
use crate::error::{AirgapError, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "airgap-image-pusher")]
#[command(about = "Push the images of an airgap bundle to a private registry")]
#[command(version)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Verbose output
    #[arg(long = "verbose", short = 'v', global = true, help = "Enable verbose output")]
    pub verbose: bool,

    /// Quiet mode
    #[arg(long = "quiet", short = 'q', global = true, help = "Only print errors")]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Push every image of a bundle
    Push(PushArgs),
    /// Print the destination reference of every image without pushing
    List(ListArgs),
}

/// Destination registry flags shared by every command
#[derive(ClapArgs, Debug, Clone)]
pub struct RegistryArgs {
    /// Path to the airgap bundle
    #[arg(long = "bundle", short = 'b', help = "Path to the airgap bundle (.tar.gz)")]
    pub bundle: PathBuf,

    /// Destination registry
    #[arg(
        long = "registry",
        short = 'r',
        help = "Destination registry host, optionally with port"
    )]
    pub registry: String,

    /// Namespace inside the registry
    #[arg(
        long = "namespace",
        short = 'n',
        default_value = "",
        help = "Path placed between the registry host and image names"
    )]
    pub namespace: String,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct PushArgs {
    #[command(flatten)]
    pub target: RegistryArgs,

    /// Registry username
    #[arg(
        long = "username",
        short = 'u',
        help = "Username for registry authentication"
    )]
    pub username: Option<String>,

    /// Registry password
    #[arg(
        long = "password",
        short = 'p',
        help = "Password for registry authentication"
    )]
    pub password: Option<String>,

    /// Tag override for admin console images
    #[arg(
        long = "kotsadm-tag",
        help = "Replace the tag of every admin console image"
    )]
    pub kotsadm_tag: Option<String>,

    /// Structured progress
    #[arg(
        long = "progress-json",
        help = "Write one JSON progress snapshot per line to stdout"
    )]
    pub progress_json: bool,

    /// Stream the bundle instead of extracting it
    #[arg(
        long = "stream",
        help = "Read application images straight from the compressed bundle"
    )]
    pub stream: bool,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct ListArgs {
    #[command(flatten)]
    pub target: RegistryArgs,

    /// Output format for results
    #[arg(
        long = "output",
        short = 'o',
        default_value = "text",
        help = "Output format: text, json, yaml"
    )]
    pub output: String,
}

impl Args {
    pub fn parse_args() -> Self {
        Args::parse()
    }

    /// Validate arguments
    pub fn validate(&self) -> Result<()> {
        match &self.command {
            Command::Push(push) => {
                push.target.validate()?;
                push.options().registry.validate()
            }
            Command::List(list) => {
                list.target.validate()?;
                match list.output.as_str() {
                    "text" | "json" | "yaml" => Ok(()),
                    other => Err(AirgapError::Config(format!(
                        "Unsupported output format: {}",
                        other
                    ))),
                }
            }
        }
    }
}

impl RegistryArgs {
    fn validate(&self) -> Result<()> {
        if !self.bundle.exists() {
            return Err(AirgapError::Config(format!(
                "Bundle does not exist: {}",
                self.bundle.display()
            )));
        }
        Ok(())
    }

    pub fn bundle(&self) -> &Path {
        &self.bundle
    }

    pub fn registry_options(&self) -> RegistryOptions {
        RegistryOptions::new(self.registry.trim()).with_namespace(self.namespace.trim())
    }
}

impl PushArgs {
    pub fn options(&self) -> PushImagesOptions {
        let mut registry = self.target.registry_options();
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            registry = registry.with_credentials(username, password);
        } else if let Some(username) = &self.username {
            registry.username = username.clone();
        } else if let Some(password) = &self.password {
            registry.password = password.clone();
        }

        PushImagesOptions::new(registry)
            .with_log_for_ui(self.progress_json)
            .with_kotsadm_tag(self.kotsadm_tag.clone())
    }
}
