//! Configuration for fx-infra.
//!
//! Holds clap structs for command line arguments and the SSH settings that
//! every remote session is built from.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::cloud::CloudType;
use crate::error::InfraError;
use crate::node::NodeType;

/// Environment variable overriding the SSH private key path.
pub const SSH_KEY_FILE_ENV: &str = "SSH_KEY_FILE";
/// Environment variable overriding the SSH port.
pub const SSH_PORT_ENV: &str = "SSH_PORT";
const DEFAULT_SSH_PORT: u16 = 22;

#[derive(Parser)]
#[command(version, author, about = "Provision k3s clusters over SSH")]
pub struct Config {
    /// Cloud store to use. Defaults to `~/.fx/clouds.yaml`
    #[arg(long, env = "FX_INFRA_STORE")]
    pub store: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Provision a new cloud and make it the current one
    Setup {
        /// Name the cloud is stored under
        #[arg(long)]
        name: String,

        /// Kind of cloud to set up
        #[arg(long = "type", value_enum, default_value = "k8s")]
        kind: CloudType,

        /// (k8s) Master node as <user>@<ip>
        #[arg(long)]
        master: Option<String>,

        /// (k8s) Comma separated agent nodes as <user>@<ip>
        #[arg(long, value_delimiter = ',')]
        agents: Vec<String>,

        /// (k8s) YAML file listing nodes instead of --master/--agents
        #[arg(long, conflicts_with_all = ["master", "agents"])]
        nodes_file: Option<PathBuf>,

        /// (docker) Host as <user>@<ip>
        #[arg(long)]
        host: Option<String>,
    },

    /// Re-run provisioning on a stored cloud
    Provision {
        /// Cloud to provision. Defaults to the current cloud
        #[arg(long)]
        cloud: Option<String>,
    },

    /// Provision a node and add it to a stored cloud
    AddNode {
        /// Node address as <user>@<ip>
        address: String,

        /// Node name
        #[arg(long)]
        name: String,

        /// Node role
        #[arg(long = "type", value_enum, default_value = "agent")]
        role: NodeType,

        /// Cloud to grow. Defaults to the current cloud
        #[arg(long)]
        cloud: Option<String>,
    },

    /// Remove a node from a stored cloud
    DeleteNode {
        /// Node name
        name: String,

        /// Cloud to shrink. Defaults to the current cloud
        #[arg(long)]
        cloud: Option<String>,
    },

    /// Select the current cloud
    Use {
        /// Cloud name
        name: String,
    },

    /// List stored clouds
    List,

    /// Print where functions would be deployed for the current cloud
    Target,
}

/// SSH connection settings shared by every node session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshConfig {
    /// Private key used to authenticate.
    pub key_file: PathBuf,
    /// Port sshd listens on.
    pub port: u16,
}

impl SshConfig {
    /// Resolves settings from `SSH_KEY_FILE` and `SSH_PORT`, falling back to
    /// `~/.ssh/id_rsa` and port 22.
    pub fn from_env() -> Result<Self, InfraError> {
        Self::resolve(
            std::env::var(SSH_KEY_FILE_ENV).ok(),
            std::env::var(SSH_PORT_ENV).ok(),
        )
    }

    pub fn resolve(
        key_file: Option<String>,
        port: Option<String>,
    ) -> Result<Self, InfraError> {
        let key_file = match key_file.filter(|path| !path.is_empty()) {
            Some(path) => PathBuf::from(path),
            None => dirs::home_dir()
                .ok_or_else(|| {
                    InfraError::Config("could not determine the home directory".to_string())
                })?
                .join(".ssh")
                .join("id_rsa"),
        };
        let port = match port.filter(|port| !port.is_empty()) {
            Some(port) => port.parse().map_err(|_| {
                InfraError::Config(format!("{} must be a port number, got '{}'", SSH_PORT_ENV, port))
            })?,
            None => DEFAULT_SSH_PORT,
        };
        Ok(Self { key_file, port })
    }
}
