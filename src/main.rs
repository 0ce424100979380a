use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fx_infra::host::{docker_node, k8s_nodes, read_nodes_file, PlannedNode};
use fx_infra::store::{self, CloudStore};
use fx_infra::{
    Cloud, CloudType, Command, Config, DeployTarget, InfraError, LockedFile, Node, NodeAddress,
    NodeType, RemoteNode,
};

fn plan(
    kind: CloudType,
    name: &str,
    master: Option<String>,
    agents: &[String],
    nodes_file: Option<PathBuf>,
    host: Option<String>,
) -> Result<Vec<PlannedNode>, InfraError> {
    match kind {
        CloudType::K8s => match (nodes_file, master) {
            (Some(path), _) => read_nodes_file(&path),
            (None, Some(master)) => k8s_nodes(&master, agents),
            (None, None) => Err(InfraError::Config(
                "master required, eg. 'root@123.1.2.12'".to_string(),
            )),
        },
        CloudType::Docker => {
            let host = host.ok_or_else(|| {
                InfraError::Config("host required, eg. 'root@123.1.2.12'".to_string())
            })?;
            Ok(vec![docker_node(&host, name)?])
        }
    }
}

async fn run_setup(
    store_path: &Path,
    name: String,
    kind: CloudType,
    planned: Vec<PlannedNode>,
) -> Result<(), InfraError> {
    let nodes = planned
        .iter()
        .map(PlannedNode::create)
        .collect::<Result<Vec<_>, _>>()?;
    let mut cloud = Cloud::new(kind, nodes)?;

    // Hold the lock while provisioning so the name cannot be taken meanwhile.
    let locked = LockedFile::acquire(store_path).await?;
    let mut store = CloudStore::read(&locked)?;
    store.check_unused(&name)?;

    info!(cloud = %name, %kind, nodes = cloud.len(), "setting up cloud");
    let provisioned = cloud.provision().await;
    cloud.close().await;
    provisioned?;

    store.add_cloud(&name, &cloud)?;
    store.write(&locked)?;
    info!(cloud = %name, store = %store_path.display(), "cloud saved");
    Ok(())
}

async fn run_provision(store_path: &Path, cloud: Option<String>) -> Result<(), InfraError> {
    // Hold the lock for the whole run so concurrent invocations serialize.
    let locked = LockedFile::acquire(store_path).await?;
    let mut store = CloudStore::read(&locked)?;
    let (name, state) = store.resolve(cloud.as_deref())?;
    let name = name.to_string();
    let mut cloud = Cloud::load(state)?;
    let provisioned = cloud.provision().await;
    cloud.close().await;
    provisioned?;
    store.clouds.insert(name.clone(), cloud.to_value()?);
    store.write(&locked)?;
    info!(cloud = %name, "cloud provisioned");
    Ok(())
}

async fn run_add_node(
    store_path: &Path,
    address: &str,
    node_name: &str,
    role: NodeType,
    cloud: Option<String>,
) -> Result<(), InfraError> {
    let address: NodeAddress = address.parse()?;
    let node: Arc<dyn Node> = Arc::new(RemoteNode::create(
        &address.ip,
        &address.user,
        role,
        node_name,
    )?);

    let locked = LockedFile::acquire(store_path).await?;
    let mut store = CloudStore::read(&locked)?;
    let (name, state) = store.resolve(cloud.as_deref())?;
    let name = name.to_string();
    let mut cloud = Cloud::load(state)?;
    // The join token is not persisted; read it back from the master.
    let added = async {
        if role == NodeType::Agent && cloud.kind() != Some(CloudType::Docker) {
            cloud.refresh_meta().await?;
        }
        cloud.add_node(Arc::clone(&node), false).await
    }
    .await;
    // A rejected node is not part of the cloud, so close it separately.
    node.close().await;
    cloud.close().await;
    added?;
    store.clouds.insert(name.clone(), cloud.to_value()?);
    store.write(&locked)?;
    info!(cloud = %name, node = node_name, "node added");
    Ok(())
}

async fn run_delete_node(
    store_path: &Path,
    node_name: &str,
    cloud: Option<String>,
) -> Result<(), InfraError> {
    let locked = LockedFile::acquire(store_path).await?;
    let mut store = CloudStore::read(&locked)?;
    let (name, state) = store.resolve(cloud.as_deref())?;
    let name = name.to_string();
    let mut cloud = Cloud::load(state)?;
    cloud.delete_node(node_name)?;
    store.clouds.insert(name.clone(), cloud.to_value()?);
    store.write(&locked)?;
    info!(cloud = %name, node = node_name, "node deleted");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), InfraError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Config::parse();
    let store_path = match cli.store {
        Some(path) => path,
        None => store::default_path()?,
    };

    match cli.command {
        Command::Setup {
            name,
            kind,
            master,
            agents,
            nodes_file,
            host,
        } => {
            let planned = plan(kind, &name, master, &agents, nodes_file, host)?;
            run_setup(&store_path, name, kind, planned).await?;
        }
        Command::Provision { cloud } => run_provision(&store_path, cloud).await?,
        Command::AddNode {
            address,
            name,
            role,
            cloud,
        } => run_add_node(&store_path, &address, &name, role, cloud).await?,
        Command::DeleteNode { name, cloud } => run_delete_node(&store_path, &name, cloud).await?,
        Command::Use { name } => {
            let locked = LockedFile::acquire(&store_path).await?;
            let mut store = CloudStore::read(&locked)?;
            store.use_cloud(&name)?;
            store.write(&locked)?;
        }
        Command::List => {
            let store = CloudStore::load(&store_path).await?;
            for (name, state) in &store.clouds {
                let marker = if store.current_cloud.as_deref() == Some(name.as_str()) {
                    "*"
                } else {
                    " "
                };
                let cloud = Cloud::load(state)?;
                let kind = cloud
                    .kind()
                    .map(|kind| kind.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!("{} {} ({}, {} node(s))", marker, name, kind, cloud.len());
            }
        }
        Command::Target => {
            let store = CloudStore::load(&store_path).await?;
            let (_, state) = store.resolve(None)?;
            println!("{}", DeployTarget::from_env(state)?);
        }
    }

    Ok(())
}
