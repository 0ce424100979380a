//! fx-infra: provision k3s clusters over SSH.

// Serde helper module.
mod serde;
// Command line arguments and SSH settings.
pub mod config;
// Error handling.
pub mod error;
// Remote command execution.
pub mod session;
// Commands run on nodes while provisioning.
pub mod scripts;
// Cluster nodes and their provisioning steps.
pub mod node;
// Clouds: provisioning orchestration and persisted state.
pub mod cloud;
// Node addresses and node list files.
pub mod host;
// Synchronization primitives.
pub mod sync;
// Persisted clouds.
pub mod store;
// Deployment targets.
pub mod target;

pub use cloud::{Cloud, CloudState, CloudType};
pub use config::{Command, Config, SshConfig};
pub use error::{InfraError, NodeFailure};
pub use host::{docker_node, k8s_nodes, read_nodes_file, NodeAddress, NodeSpec, PlannedNode};
pub use node::{create_node, ensure, ClusterMeta, Ensured, Node, NodeInfo, NodeType, RemoteNode};
pub use session::{Session, SshSession};
pub use store::CloudStore;
pub use sync::LockedFile;
pub use target::DeployTarget;
