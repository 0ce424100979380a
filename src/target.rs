//! Where functions get deployed for a stored cloud.

use std::fmt;

use serde_yaml::Value;

use crate::cloud::{CloudState, CloudType};
use crate::error::InfraError;

/// Environment variable that forces deployment to a Kubernetes cluster.
pub const KUBECONFIG_ENV: &str = "KUBECONFIG";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployTarget {
    /// A docker daemon on `host`.
    Docker { host: String },
    /// A Kubernetes cluster described by a kubeconfig document or path.
    K8s { kubeconfig: String },
}

impl DeployTarget {
    /// Picks the target for `state`. A non-empty `kubeconfig_env` wins.
    pub fn resolve(state: &Value, kubeconfig_env: Option<String>) -> Result<Self, InfraError> {
        if let Some(kubeconfig) = kubeconfig_env.filter(|path| !path.is_empty()) {
            return Ok(DeployTarget::K8s { kubeconfig });
        }

        let state: CloudState = serde_yaml::from_value(state.clone())?;
        match state.kind {
            Some(CloudType::Docker) => state
                .host
                .or_else(|| state.nodes.values().next().map(|node| node.ip.clone()))
                .map(|host| DeployTarget::Docker { host })
                .ok_or_else(|| InfraError::Config("docker cloud has no host".to_string())),
            Some(CloudType::K8s) => state
                .kubeconfig
                .map(|kubeconfig| DeployTarget::K8s { kubeconfig })
                .ok_or_else(|| {
                    InfraError::Config("k8s cloud has no kubeconfig, provision it first".to_string())
                }),
            None => Err(InfraError::Config(
                "unsupported cloud type, make sure the cloud config is correct".to_string(),
            )),
        }
    }

    pub fn from_env(state: &Value) -> Result<Self, InfraError> {
        Self::resolve(state, std::env::var(KUBECONFIG_ENV).ok())
    }
}

impl fmt::Display for DeployTarget {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DeployTarget::Docker { host } => write!(f, "docker daemon at {}", host),
            DeployTarget::K8s { kubeconfig } => write!(f, "k8s cluster\n{}", kubeconfig),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(text: &str) -> Value {
        serde_yaml::from_str(text).unwrap()
    }

    #[test]
    fn test_env_override_wins() {
        let target =
            DeployTarget::resolve(&yaml("type: docker\nhost: 1.2.3.4"), Some("/kube".into()))
                .unwrap();
        assert_eq!(
            target,
            DeployTarget::K8s {
                kubeconfig: "/kube".to_string()
            }
        );
    }

    #[test]
    fn test_docker_host() {
        let target = DeployTarget::resolve(&yaml("type: docker\nhost: 1.2.3.4"), None).unwrap();
        assert_eq!(
            target,
            DeployTarget::Docker {
                host: "1.2.3.4".to_string()
            }
        );
    }

    #[test]
    fn test_k8s_needs_kubeconfig() {
        assert!(DeployTarget::resolve(&yaml("type: k8s"), None).is_err());
        let target =
            DeployTarget::resolve(&yaml("type: k8s\nkubeconfig: 'apiVersion: v1'"), None).unwrap();
        assert!(matches!(target, DeployTarget::K8s { .. }));
    }

    #[test]
    fn test_untyped_cloud() {
        assert!(DeployTarget::resolve(&yaml("{}"), None).is_err());
    }
}
