//! Clouds: a set of nodes provisioned into one cluster.
//!
//! The master is always provisioned first, on its own, because agents join
//! with a token that only exists once the master's k3s server is up. Agents
//! are then provisioned concurrently, one tokio task each.

use std::collections::BTreeMap;
use std::fmt;
use std::iter::zip;
use std::str::FromStr;
use std::sync::Arc;

use clap::ValueEnum;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{InfraError, NodeFailure};
use crate::node::{create_node, ClusterMeta, Node, NodeInfo, NodeType};
use crate::scripts::join_url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CloudType {
    /// Every node only runs docker.
    Docker,
    /// One k3s master and any number of agents.
    K8s,
}

impl fmt::Display for CloudType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CloudType::Docker => write!(f, "docker"),
            CloudType::K8s => write!(f, "k8s"),
        }
    }
}

impl FromStr for CloudType {
    type Err = InfraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "docker" => Ok(CloudType::Docker),
            "k8s" => Ok(CloudType::K8s),
            other => Err(InfraError::DataFormat(format!(
                "unknown cloud type '{}', expected 'docker' or 'k8s'",
                other
            ))),
        }
    }
}

/// The persisted form of a [`Cloud`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudState {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<CloudType>,
    /// Address of the docker host, for docker clouds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<String>,
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeInfo>,
}

pub struct Cloud {
    kind: Option<CloudType>,
    /// Persisted docker host, kept for clouds stored without nodes.
    host: Option<String>,
    nodes: BTreeMap<String, Arc<dyn Node>>,
    meta: ClusterMeta,
}

/// What a fan-out task does to its node.
#[derive(Clone)]
enum Step {
    Runtime,
    Join(ClusterMeta),
}

impl Cloud {
    fn empty(kind: Option<CloudType>) -> Self {
        Self {
            kind,
            host: None,
            nodes: BTreeMap::new(),
            meta: ClusterMeta::default(),
        }
    }

    /// Creates a cloud from nodes that have not been provisioned yet.
    pub fn new(kind: CloudType, nodes: Vec<Arc<dyn Node>>) -> Result<Self, InfraError> {
        let mut cloud = Self::empty(Some(kind));
        for node in nodes {
            cloud.check_insert(node.as_ref())?;
            cloud.nodes.insert(node.name().to_string(), node);
        }
        Ok(cloud)
    }

    /// Reconstructs a cloud from its persisted state, connecting nodes over SSH.
    pub fn load(meta: &Value) -> Result<Self, InfraError> {
        Self::load_with(meta, create_node)
    }

    /// Like [`Cloud::load`], building each node with `create`.
    pub fn load_with<F>(meta: &Value, create: F) -> Result<Self, InfraError>
    where
        F: Fn(&NodeInfo) -> Result<Arc<dyn Node>, InfraError>,
    {
        let mapping = match meta {
            Value::Null => return Ok(Self::empty(None)),
            Value::Mapping(mapping) => mapping,
            _ => {
                return Err(InfraError::DataFormat(
                    "cloud state must be a mapping".to_string(),
                ))
            }
        };

        let mut cloud = Self::empty(None);
        if let Some(kind) = string_field(mapping, "type")? {
            cloud.kind = Some(kind.parse()?);
        }
        cloud.host = string_field(mapping, "host")?.map(str::to_string);
        cloud.meta.kubeconfig = string_field(mapping, "kubeconfig")?.map(str::to_string);
        if let Some(nodes) = mapping.get(&key("nodes")) {
            for info in parse_nodes(nodes)? {
                let node = create(&info)?;
                cloud.check_insert(node.as_ref())?;
                // Persisted nodes were provisioned when they were added.
                cloud.nodes.insert(node.name().to_string(), node);
            }
        }
        Ok(cloud)
    }

    pub fn kind(&self) -> Option<CloudType> {
        self.kind
    }

    pub fn meta(&self) -> &ClusterMeta {
        &self.meta
    }

    pub fn node(&self, name: &str) -> Option<&Arc<dyn Node>> {
        self.nodes.get(name)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Arc<dyn Node>> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Provisions every node.
    ///
    /// Safe to repeat: every step probes before acting, and the URL, token,
    /// and kubeconfig are read again. Failed agents do not stop the others;
    /// all failures are reported together.
    pub async fn provision(&mut self) -> Result<(), InfraError> {
        match self.kind {
            Some(CloudType::Docker) => {
                let nodes = self.nodes.values().cloned().collect();
                fan_out(nodes, Step::Runtime).await
            }
            _ => self.provision_cluster().await,
        }
    }

    async fn provision_cluster(&mut self) -> Result<(), InfraError> {
        let (master, agents) = self.partition()?;

        self.meta.url = Some(join_url(master.ip()));
        info!(
            master = master.name(),
            ip = master.ip(),
            agents = agents.len(),
            "provisioning master"
        );
        master.provision(&self.meta).await?;
        self.meta.token = Some(master.get_token().await?);
        self.meta.kubeconfig = Some(master.get_config().await?);

        if agents.is_empty() {
            return Ok(());
        }
        info!(agents = agents.len(), "provisioning agents");
        fan_out(agents, Step::Join(self.meta.clone())).await
    }

    /// Reads the join URL, token, and kubeconfig back from the master
    /// without provisioning anything.
    pub async fn refresh_meta(&mut self) -> Result<(), InfraError> {
        let (master, _) = self.partition()?;
        self.meta = ClusterMeta {
            url: Some(join_url(master.ip())),
            token: Some(master.get_token().await?),
            kubeconfig: Some(master.get_config().await?),
        };
        Ok(())
    }

    /// Splits nodes into the single master and the agents.
    fn partition(&self) -> Result<(Arc<dyn Node>, Vec<Arc<dyn Node>>), InfraError> {
        let (masters, agents): (Vec<_>, Vec<_>) = self
            .nodes
            .values()
            .cloned()
            .partition(|node| node.node_type() == NodeType::Master);
        match masters.len() {
            1 => Ok((Arc::clone(&masters[0]), agents)),
            0 => Err(InfraError::Config(
                "a k8s cloud needs exactly one master node, found none".to_string(),
            )),
            _ => Err(InfraError::Config(format!(
                "a k8s cloud needs exactly one master node, found {}",
                masters.iter().map(|node| node.name()).collect::<Vec<_>>().join(", ")
            ))),
        }
    }

    /// Adds `node`, provisioning it against the current cluster metadata
    /// unless `skip_provision` is set.
    pub async fn add_node(
        &mut self,
        node: Arc<dyn Node>,
        skip_provision: bool,
    ) -> Result<(), InfraError> {
        self.check_insert(node.as_ref())?;
        if !skip_provision {
            match (self.kind, node.node_type()) {
                (Some(CloudType::Docker), _) => node.ensure_runtime().await?,
                (_, NodeType::Master) => {
                    let mut meta = ClusterMeta {
                        url: Some(join_url(node.ip())),
                        ..ClusterMeta::default()
                    };
                    node.provision(&meta).await?;
                    meta.token = Some(node.get_token().await?);
                    meta.kubeconfig = Some(node.get_config().await?);
                    self.meta = meta;
                }
                (_, NodeType::Agent) => node.provision(&self.meta).await?,
            }
        }
        info!(node = node.name(), role = %node.node_type(), "node added");
        self.nodes.insert(node.name().to_string(), node);
        Ok(())
    }

    /// Removes the node called `name`.
    ///
    /// The master can only go once it is the last node, since the others
    /// depend on its join token.
    pub fn delete_node(&mut self, name: &str) -> Result<Arc<dyn Node>, InfraError> {
        let node = self
            .nodes
            .get(name)
            .ok_or_else(|| InfraError::NodeNotFound(name.to_string()))?;
        let is_master = node.node_type() == NodeType::Master;
        if is_master && self.nodes.len() > 1 {
            return Err(InfraError::InvalidOperation(format!(
                "could not delete master node '{}' while {} other node(s) remain",
                name,
                self.nodes.len() - 1
            )));
        }
        let node = self
            .nodes
            .remove(name)
            .ok_or_else(|| InfraError::NodeNotFound(name.to_string()))?;
        if is_master {
            self.meta = ClusterMeta::default();
        }
        info!(node = name, "node deleted");
        Ok(node)
    }

    /// Closes every node's connection.
    pub async fn close(&self) {
        join_all(self.nodes.values().map(|node| node.close())).await;
    }

    pub fn state(&self) -> CloudState {
        let host = match self.kind {
            Some(CloudType::Docker) => self
                .nodes
                .values()
                .next()
                .map(|node| node.ip().to_string())
                .or_else(|| self.host.clone()),
            _ => None,
        };
        CloudState {
            kind: self.kind,
            host,
            kubeconfig: self.meta.kubeconfig.clone(),
            nodes: self
                .nodes
                .iter()
                .map(|(name, node)| (name.clone(), node.dump()))
                .collect(),
        }
    }

    /// The persisted state as a YAML value.
    pub fn to_value(&self) -> Result<Value, InfraError> {
        Ok(serde_yaml::to_value(self.state())?)
    }

    /// The persisted state as YAML bytes.
    pub fn dump(&self) -> Result<Vec<u8>, InfraError> {
        Ok(serde_yaml::to_vec(&self.state())?)
    }

    fn check_insert(&self, node: &dyn Node) -> Result<(), InfraError> {
        if self.nodes.contains_key(node.name()) {
            return Err(InfraError::Config(format!(
                "a node named '{}' already exists",
                node.name()
            )));
        }
        if node.node_type() == NodeType::Master {
            if let Some(master) = self
                .nodes
                .values()
                .find(|other| other.node_type() == NodeType::Master)
            {
                return Err(InfraError::Config(format!(
                    "cloud already has master node '{}', could not add '{}'",
                    master.name(),
                    node.name()
                )));
            }
        }
        Ok(())
    }
}

/// Runs `step` on every node concurrently and waits for all of them.
async fn fan_out(nodes: Vec<Arc<dyn Node>>, step: Step) -> Result<(), InfraError> {
    let errored: Arc<Mutex<Vec<NodeFailure>>> = Arc::new(Mutex::new(vec![]));

    let mut names = Vec::with_capacity(nodes.len());
    let mut tasks = Vec::with_capacity(nodes.len());
    for node in nodes {
        names.push(node.name().to_string());
        tasks.push(spawn_step(node, step.clone(), Arc::clone(&errored)));
    }

    // A panicked task never reached its own error reporting.
    for (name, joined) in zip(names, join_all(tasks).await) {
        if let Err(e) = joined {
            errored.lock().await.push(NodeFailure::new(name, InfraError::Task(e)));
        }
    }

    let mut failures = std::mem::take(&mut *errored.lock().await);
    if failures.is_empty() {
        Ok(())
    } else {
        failures.sort_by(|a, b| a.node.cmp(&b.node));
        Err(InfraError::AgentsFailed(failures))
    }
}

/// Spawns a task running `step` on `node`, recording failure in `errored`.
fn spawn_step(
    node: Arc<dyn Node>,
    step: Step,
    errored: Arc<Mutex<Vec<NodeFailure>>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let result = match &step {
            Step::Runtime => node.ensure_runtime().await,
            Step::Join(meta) => node.provision(meta).await,
        };
        match result {
            Ok(()) => info!(node = node.name(), "node provisioned"),
            Err(error) => {
                warn!(node = node.name(), %error, "node failed to provision");
                errored
                    .lock()
                    .await
                    .push(NodeFailure::new(node.name(), error));
            }
        }
    })
}

fn key(name: &str) -> Value {
    Value::String(name.to_string())
}

fn string_field<'m>(mapping: &'m Mapping, name: &str) -> Result<Option<&'m str>, InfraError> {
    match mapping.get(&key(name)) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.as_str())),
        Some(_) => Err(InfraError::DataFormat(format!("'{}' must be a string", name))),
    }
}

/// Parses `{name: {ip, user, type, name}}`. Every field must be a string.
fn parse_nodes(nodes: &Value) -> Result<Vec<NodeInfo>, InfraError> {
    let nodes = match nodes {
        Value::Null => return Ok(vec![]),
        Value::Mapping(nodes) => nodes,
        _ => {
            return Err(InfraError::DataFormat(
                "'nodes' must map node names to node fields".to_string(),
            ))
        }
    };

    let mut infos = Vec::with_capacity(nodes.len());
    for (node_key, fields) in nodes {
        let node_key = node_key.as_str().ok_or_else(|| {
            InfraError::DataFormat("node names must be strings".to_string())
        })?;
        let fields = fields.as_mapping().ok_or_else(|| {
            InfraError::DataFormat(format!("node '{}' must be a mapping of strings", node_key))
        })?;

        let mut strings = BTreeMap::new();
        for (field, value) in fields {
            match (field.as_str(), value.as_str()) {
                (Some(field), Some(value)) => {
                    strings.insert(field, value);
                }
                _ => {
                    return Err(InfraError::DataFormat(format!(
                        "node '{}' must be a mapping of strings",
                        node_key
                    )))
                }
            }
        }
        let required = |field: &str| {
            strings.get(field).copied().ok_or_else(|| {
                InfraError::DataFormat(format!("node '{}' is missing '{}'", node_key, field))
            })
        };

        infos.push(NodeInfo::new(
            required("ip")?,
            required("user")?,
            required("type")?.parse()?,
            strings.get("name").copied().unwrap_or(node_key),
        ));
    }
    Ok(infos)
}
