use std::fmt;

use itertools::Itertools;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InfraError {
    #[error("Failed to connect SSH session or execute SSH command: {0}")]
    Ssh(#[from] openssh::Error),
    #[error("Failed to access local file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Remote command '{command}' failed: {status}")]
    CommandFailed { command: String, status: String },
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Malformed cluster state: {0}")]
    DataFormat(String),
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
    #[error("No node named '{0}' in this cloud")]
    NodeNotFound(String),
    #[error("Cluster metadata is missing '{0}'; provision the master first")]
    MissingMeta(&'static str),
    #[error("{} node(s) failed to provision: {}", .0.len(), .0.iter().join("; "))]
    AgentsFailed(Vec<NodeFailure>),
    #[error("Provisioning task panicked: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("Failed to register command template: {0}")]
    Template(#[from] handlebars::TemplateError),
    #[error("Failed to render command template: {0}")]
    Render(#[from] handlebars::RenderError),
    #[error("Failed to (de)serialize YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// One node that failed during a concurrent fan-out.
#[derive(Debug)]
pub struct NodeFailure {
    pub node: String,
    pub error: InfraError,
}

impl NodeFailure {
    pub fn new(node: impl Into<String>, error: InfraError) -> Self {
        Self {
            node: node.into(),
            error,
        }
    }
}

impl fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}] {}", self.node, self.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agents_failed_lists_every_node() {
        let err = InfraError::AgentsFailed(vec![
            NodeFailure::new("agent-0", InfraError::Config("boom".to_string())),
            NodeFailure::new("agent-1", InfraError::MissingMeta("token")),
        ]);
        let message = err.to_string();
        assert!(message.starts_with("2 node(s) failed"));
        assert!(message.contains("[agent-0]"));
        assert!(message.contains("[agent-1]"));
    }
}
