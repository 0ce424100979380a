//! Node addresses and node list files.
//!
//! Addresses are written `<user>@<ip>`. A node list file is a YAML sequence
//! whose entries are either a bare address or a mapping with an `address`
//! and optional `name` and `type`.

use std::fmt;
use std::fs::File;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;
use void::Void;

use crate::error::InfraError;
use crate::node::{Node, NodeType, RemoteNode};
use crate::serde::string_or_mapping;

/// Where and as whom to reach a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAddress {
    pub user: String,
    pub ip: String,
}

impl FromStr for NodeAddress {
    type Err = InfraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().split_once('@') {
            Some((user, ip)) if !user.is_empty() && !ip.is_empty() && !ip.contains('@') => {
                Ok(Self {
                    user: user.to_string(),
                    ip: ip.to_string(),
                })
            }
            _ => Err(InfraError::Config(format!(
                "incorrect node address '{}', should be <user>@<ip> format",
                s
            ))),
        }
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.ip)
    }
}

/// One entry of a node list file.
#[derive(Debug, Deserialize)]
pub struct NodeSpec(#[serde(deserialize_with = "string_or_mapping")] NodeSpecInner);

#[derive(Debug, Deserialize)]
struct NodeSpecInner {
    address: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default, rename = "type")]
    node_type: Option<NodeType>,
}

impl FromStr for NodeSpecInner {
    type Err = Void;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self {
            address: s.to_string(),
            name: None,
            node_type: None,
        })
    }
}

/// A fully resolved node to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedNode {
    pub address: NodeAddress,
    pub node_type: NodeType,
    pub name: String,
}

impl PlannedNode {
    pub fn create(&self) -> Result<Arc<dyn Node>, InfraError> {
        let node = RemoteNode::create(
            &self.address.ip,
            &self.address.user,
            self.node_type,
            &self.name,
        )?;
        Ok(Arc::new(node))
    }
}

/// Plans a k8s cloud: `master` is named "master", agents "agent-<i>".
pub fn k8s_nodes(master: &str, agents: &[String]) -> Result<Vec<PlannedNode>, InfraError> {
    let mut nodes = Vec::with_capacity(agents.len() + 1);
    nodes.push(PlannedNode {
        address: master.parse()?,
        node_type: NodeType::Master,
        name: "master".to_string(),
    });
    for (i, agent) in agents.iter().filter(|agent| !agent.is_empty()).enumerate() {
        nodes.push(PlannedNode {
            address: agent.parse()?,
            node_type: NodeType::Agent,
            name: format!("agent-{}", i),
        });
    }
    Ok(nodes)
}

/// Plans a docker cloud with its single host.
pub fn docker_node(host: &str, name: &str) -> Result<PlannedNode, InfraError> {
    Ok(PlannedNode {
        address: host.parse()?,
        node_type: NodeType::Agent,
        name: name.to_string(),
    })
}

/// Plans nodes from parsed node list entries.
///
/// The first entry is the master unless some entry sets `type`; unnamed
/// nodes are called "master" and "agent-<i>".
pub fn plan_nodes(specs: Vec<NodeSpec>) -> Result<Vec<PlannedNode>, InfraError> {
    let explicit = specs.iter().any(|NodeSpec(spec)| spec.node_type.is_some());
    let mut agents = 0;
    let mut nodes = Vec::with_capacity(specs.len());
    for (i, NodeSpec(spec)) in specs.into_iter().enumerate() {
        let node_type = match spec.node_type {
            Some(node_type) => node_type,
            None if !explicit && i == 0 => NodeType::Master,
            None => NodeType::Agent,
        };
        let name = match (spec.name, node_type) {
            (Some(name), _) => name,
            (None, NodeType::Master) => "master".to_string(),
            (None, NodeType::Agent) => {
                agents += 1;
                format!("agent-{}", agents - 1)
            }
        };
        nodes.push(PlannedNode {
            address: spec.address.parse()?,
            node_type,
            name,
        });
    }
    Ok(nodes)
}

/// Reads and plans a node list file.
pub fn read_nodes_file(path: &Path) -> Result<Vec<PlannedNode>, InfraError> {
    let file = File::open(path)?;
    let specs: Vec<NodeSpec> = serde_yaml::from_reader(file)?;
    let nodes = plan_nodes(specs)?;
    debug!(path = %path.display(), ?nodes, "nodes read");
    Ok(nodes)
}
