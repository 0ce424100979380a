//! Cluster nodes.
//!
//! A node is one SSH-reachable machine with a role. Every provisioning step
//! is guarded by a probe, so provisioning a node twice only re-runs the
//! probes.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::SshConfig;
use crate::error::InfraError;
use crate::scripts::{self, Scripts};
use crate::session::{node_label, Session, SshSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Master,
    Agent,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NodeType::Master => write!(f, "master"),
            NodeType::Agent => write!(f, "agent"),
        }
    }
}

impl FromStr for NodeType {
    type Err = InfraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "master" => Ok(NodeType::Master),
            "agent" => Ok(NodeType::Agent),
            other => Err(InfraError::DataFormat(format!(
                "unknown node type '{}', expected 'master' or 'agent'",
                other
            ))),
        }
    }
}

/// The serializable identity of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub ip: String,
    pub user: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub name: String,
}

impl NodeInfo {
    pub fn new(ip: &str, user: &str, node_type: NodeType, name: &str) -> Self {
        Self {
            ip: ip.to_string(),
            user: user.to_string(),
            node_type,
            name: name.to_string(),
        }
    }
}

/// Cluster-wide values a node needs to join, filled in by provisioning.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterMeta {
    pub url: Option<String>,
    pub token: Option<String>,
    pub kubeconfig: Option<String>,
}

impl ClusterMeta {
    /// The join URL and token, or which of them is missing.
    pub fn join_params(&self) -> Result<(&str, &str), InfraError> {
        let url = self.url.as_deref().ok_or(InfraError::MissingMeta("url"))?;
        let token = self
            .token
            .as_deref()
            .ok_or(InfraError::MissingMeta("token"))?;
        Ok((url, token))
    }
}

/// Outcome of [`ensure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ensured {
    AlreadySatisfied,
    Applied,
}

/// Runs `probe`, and only if it exits non-zero, runs `actions` in order.
///
/// A failing action is fatal. Transport errors while probing propagate.
pub async fn ensure(
    session: &dyn Session,
    probe: &str,
    actions: &[&str],
) -> Result<Ensured, InfraError> {
    if session.probe(probe).await? {
        debug!(probe, "already satisfied");
        return Ok(Ensured::AlreadySatisfied);
    }
    for action in actions {
        session.run(action).await?;
    }
    Ok(Ensured::Applied)
}

/// What a `Cloud` needs from its members.
#[async_trait]
pub trait Node: Send + Sync {
    fn name(&self) -> &str;

    fn ip(&self) -> &str;

    fn node_type(&self) -> NodeType;

    /// Makes sure a container runtime is installed and running.
    async fn ensure_runtime(&self) -> Result<(), InfraError>;

    /// Brings the node to a running k3s server or agent. Agents join using
    /// the URL and token in `meta`.
    async fn provision(&self, meta: &ClusterMeta) -> Result<(), InfraError>;

    /// Reads the join token. Only masters have one.
    async fn get_token(&self) -> Result<String, InfraError>;

    /// Reads a kubeconfig pointing at this master.
    async fn get_config(&self) -> Result<String, InfraError>;

    fn dump(&self) -> NodeInfo;

    /// Releases whatever connection the node holds.
    async fn close(&self) {}
}

/// A node provisioned through a [`Session`], normally SSH.
pub struct RemoteNode {
    info: NodeInfo,
    session: Arc<dyn Session>,
}

impl RemoteNode {
    /// Builds a node whose session uses the SSH settings from the environment.
    pub fn create(
        ip: &str,
        user: &str,
        node_type: NodeType,
        name: &str,
    ) -> Result<Self, InfraError> {
        let config = SshConfig::from_env()?;
        Ok(Self::with_config(
            NodeInfo::new(ip, user, node_type, name),
            config,
        ))
    }

    pub fn with_config(info: NodeInfo, config: SshConfig) -> Self {
        let label = node_label(&info.name, &info.ip, info.node_type == NodeType::Master);
        let session = SshSession::new(&info.ip, &info.user, config, label);
        Self::with_session(info, Arc::new(session))
    }

    pub fn with_session(info: NodeInfo, session: Arc<dyn Session>) -> Self {
        Self { info, session }
    }

    /// Swaps the command executor.
    pub fn set_session(&mut self, session: Arc<dyn Session>) {
        self.session = session;
    }

    fn require_master(&self, what: &str) -> Result<(), InfraError> {
        if self.info.node_type != NodeType::Master {
            return Err(InfraError::InvalidOperation(format!(
                "could not get {} from non-master node '{}'",
                what, self.info.name
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Node for RemoteNode {
    fn name(&self) -> &str {
        &self.info.name
    }

    fn ip(&self) -> &str {
        &self.info.ip
    }

    fn node_type(&self) -> NodeType {
        self.info.node_type
    }

    async fn ensure_runtime(&self) -> Result<(), InfraError> {
        let ensured = ensure(
            self.session.as_ref(),
            scripts::DOCKER_VERSION,
            &[scripts::INSTALL_DOCKER, scripts::START_DOCKERD],
        )
        .await?;
        info!(node = %self.info.name, ?ensured, "docker ready");
        Ok(())
    }

    async fn provision(&self, meta: &ClusterMeta) -> Result<(), InfraError> {
        let templates = Scripts::new()?;
        // Resolve everything before the first remote command.
        let (probe, setup) = match self.info.node_type {
            NodeType::Master => (
                scripts::CHECK_K3S_SERVER,
                templates.setup_k3s_master(&self.info.ip)?,
            ),
            NodeType::Agent => {
                let (url, token) = meta.join_params()?;
                (scripts::CHECK_K3S_AGENT, templates.setup_k3s_agent(url, token)?)
            }
        };

        self.ensure_runtime().await?;
        let ensured = ensure(self.session.as_ref(), probe, &[setup.as_str()]).await?;
        info!(
            node = %self.info.name,
            role = %self.info.node_type,
            ?ensured,
            "k3s ready"
        );
        Ok(())
    }

    async fn get_token(&self) -> Result<String, InfraError> {
        self.require_master("token")?;
        let token = self.session.output(scripts::GET_TOKEN).await?;
        Ok(token.trim().to_string())
    }

    async fn get_config(&self) -> Result<String, InfraError> {
        self.require_master("kubeconfig")?;
        let config = self.session.output(scripts::GET_KUBECONFIG).await?;
        Ok(point_at(&config, &self.info.ip))
    }

    fn dump(&self) -> NodeInfo {
        self.info.clone()
    }

    async fn close(&self) {
        self.session.close().await;
    }
}

/// Rewrites loopback `server:` entries of a kubeconfig to `ip`. Nothing else
/// in the document is touched.
fn point_at(kubeconfig: &str, ip: &str) -> String {
    kubeconfig
        .split_inclusive('\n')
        .map(|line| {
            if line.trim_start().starts_with("server:") {
                line.replacen("127.0.0.1", ip, 1).replacen("localhost", ip, 1)
            } else {
                line.to_string()
            }
        })
        .collect()
}

/// Default node constructor used when loading a cloud.
pub fn create_node(info: &NodeInfo) -> Result<Arc<dyn Node>, InfraError> {
    let node = RemoteNode::create(&info.ip, &info.user, info.node_type, &info.name)?;
    Ok(Arc::new(node))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    /// Replies to commands from a fixed table; anything else succeeds.
    #[derive(Default)]
    struct TableSession {
        failing: Vec<&'static str>,
        outputs: Vec<(&'static str, &'static str)>,
        calls: Mutex<Vec<String>>,
        closed: Mutex<bool>,
    }

    impl TableSession {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Session for TableSession {
        async fn run(&self, command: &str) -> Result<(), InfraError> {
            self.calls.lock().unwrap().push(command.to_string());
            if self.failing.iter().any(|failing| *failing == command) {
                return Err(InfraError::CommandFailed {
                    command: command.to_string(),
                    status: "exit status: 1".to_string(),
                });
            }
            Ok(())
        }

        async fn output(&self, command: &str) -> Result<String, InfraError> {
            self.calls.lock().unwrap().push(command.to_string());
            Ok(self
                .outputs
                .iter()
                .find(|(cmd, _)| *cmd == command)
                .map(|(_, out)| out.to_string())
                .unwrap_or_default())
        }

        async fn close(&self) {
            *self.closed.lock().unwrap() = true;
        }
    }

    fn node(node_type: NodeType, session: Arc<TableSession>) -> RemoteNode {
        RemoteNode::with_session(NodeInfo::new("127.0.0.1", "fx", node_type, "n"), session)
    }

    #[tokio::test]
    async fn test_ensure_skips_actions_when_probe_passes() {
        let session = TableSession::default();
        let ensured = ensure(&session, "probe", &["install", "start"]).await.unwrap();
        assert_eq!(ensured, Ensured::AlreadySatisfied);
        assert_eq!(session.calls(), vec!["probe"]);
    }

    #[tokio::test]
    async fn test_ensure_runs_actions_in_order() {
        let session = TableSession {
            failing: vec!["probe"],
            ..Default::default()
        };
        let ensured = ensure(&session, "probe", &["install", "start"]).await.unwrap();
        assert_eq!(ensured, Ensured::Applied);
        assert_eq!(session.calls(), vec!["probe", "install", "start"]);
    }

    #[tokio::test]
    async fn test_ensure_stops_at_failed_action() {
        let session = TableSession {
            failing: vec!["probe", "install"],
            ..Default::default()
        };
        let err = ensure(&session, "probe", &["install", "start"]).await.unwrap_err();
        assert!(matches!(err, InfraError::CommandFailed { .. }));
        assert_eq!(session.calls(), vec!["probe", "install"]);
    }

    #[tokio::test]
    async fn test_master_already_provisioned() {
        let session = Arc::new(TableSession::default());
        let master = node(NodeType::Master, session.clone());
        master.provision(&ClusterMeta::default()).await.unwrap();
        assert_eq!(
            session.calls(),
            vec![scripts::DOCKER_VERSION, scripts::CHECK_K3S_SERVER]
        );
    }

    #[tokio::test]
    async fn test_master_from_scratch() {
        let session = Arc::new(TableSession {
            failing: vec![scripts::DOCKER_VERSION, scripts::CHECK_K3S_SERVER],
            ..Default::default()
        });
        let master = node(NodeType::Master, session.clone());
        master.provision(&ClusterMeta::default()).await.unwrap();

        let setup = Scripts::new().unwrap().setup_k3s_master("127.0.0.1").unwrap();
        assert_eq!(
            session.calls(),
            vec![
                scripts::DOCKER_VERSION.to_string(),
                scripts::INSTALL_DOCKER.to_string(),
                scripts::START_DOCKERD.to_string(),
                scripts::CHECK_K3S_SERVER.to_string(),
                setup,
            ]
        );
    }

    #[tokio::test]
    async fn test_agent_from_scratch() {
        let session = Arc::new(TableSession {
            failing: vec![scripts::DOCKER_VERSION, scripts::CHECK_K3S_AGENT],
            ..Default::default()
        });
        let agent = node(NodeType::Agent, session.clone());
        let meta = ClusterMeta {
            url: Some("url-1".to_string()),
            token: Some("token-1".to_string()),
            kubeconfig: None,
        };
        agent.provision(&meta).await.unwrap();

        let join = Scripts::new().unwrap().setup_k3s_agent("url-1", "token-1").unwrap();
        assert_eq!(session.calls().last(), Some(&join));
        assert_eq!(session.calls().len(), 5);
    }

    #[tokio::test]
    async fn test_agent_without_token_issues_no_commands() {
        let session = Arc::new(TableSession::default());
        let agent = node(NodeType::Agent, session.clone());
        let meta = ClusterMeta {
            url: Some("url-1".to_string()),
            ..Default::default()
        };
        let err = agent.provision(&meta).await.unwrap_err();
        assert!(matches!(err, InfraError::MissingMeta("token")));
        assert!(session.calls().is_empty());
    }

    #[tokio::test]
    async fn test_get_token_is_trimmed() {
        let session = Arc::new(TableSession {
            outputs: vec![(scripts::GET_TOKEN, "tok-1\n")],
            ..Default::default()
        });
        let master = node(NodeType::Master, session);
        assert_eq!(master.get_token().await.unwrap(), "tok-1");
    }

    #[tokio::test]
    async fn test_get_token_from_agent_fails() {
        let session = Arc::new(TableSession::default());
        let agent = node(NodeType::Agent, session.clone());
        assert!(matches!(
            agent.get_token().await,
            Err(InfraError::InvalidOperation(_))
        ));
        assert!(session.calls().is_empty());
    }

    #[tokio::test]
    async fn test_get_config_points_at_master() {
        let session = Arc::new(TableSession {
            outputs: vec![(
                scripts::GET_KUBECONFIG,
                "clusters:\n- cluster:\n    server: https://127.0.0.1:6443\n",
            )],
            ..Default::default()
        });
        let master = RemoteNode::with_session(
            NodeInfo::new("43.224.35.195", "root", NodeType::Master, "master"),
            session,
        );
        let config = master.get_config().await.unwrap();
        assert!(config.contains("server: https://43.224.35.195:6443"));
    }

    #[test]
    fn test_point_at_only_rewrites_server_lines() {
        let config = "\
clusters:
- cluster:
    server: https://127.0.0.1:6443
  name: localhost
users:
- name: localhost
  user:
    password: 127.0.0.1-secret
";
        let rewritten = point_at(config, "43.224.35.195");
        assert_eq!(
            rewritten,
            "\
clusters:
- cluster:
    server: https://43.224.35.195:6443
  name: localhost
users:
- name: localhost
  user:
    password: 127.0.0.1-secret
"
        );
        assert_eq!(
            point_at("    server: https://localhost:6443", "1.2.3.4"),
            "    server: https://1.2.3.4:6443"
        );
    }

    #[tokio::test]
    async fn test_close_reaches_session() {
        let session = Arc::new(TableSession::default());
        let agent = node(NodeType::Agent, Arc::clone(&session));
        agent.close().await;
        assert!(*session.closed.lock().unwrap());
        assert!(session.calls().is_empty());
    }

    #[test]
    fn test_create_binds_session_without_connecting() {
        let node = RemoteNode::create("127.0.0.1", "fx", NodeType::Master, "master").unwrap();
        assert_eq!(
            node.dump(),
            NodeInfo::new("127.0.0.1", "fx", NodeType::Master, "master")
        );
    }

    #[test]
    fn test_node_type_parsing() {
        assert_eq!("master".parse::<NodeType>().unwrap(), NodeType::Master);
        assert_eq!("agent".parse::<NodeType>().unwrap(), NodeType::Agent);
        assert!("worker".parse::<NodeType>().is_err());
    }
}
