//! Remote commands used while provisioning.
//!
//! Probe commands exit non-zero when their step still has to run; every
//! other command must succeed.

use std::collections::HashMap;

use handlebars::Handlebars;

use crate::error::InfraError;

/// k3s release installed on every node.
pub const K3S_VERSION: &str = "v0.9.1";
/// Port the k3s API server listens on.
pub const K3S_API_PORT: u16 = 6443;

pub const DOCKER_VERSION: &str = "docker version";
pub const INSTALL_DOCKER: &str = "curl -fsSL https://get.docker.com | sh";
pub const START_DOCKERD: &str = "systemctl enable docker && systemctl start docker";
pub const CHECK_K3S_SERVER: &str = "systemctl is-active --quiet k3s";
pub const CHECK_K3S_AGENT: &str = "systemctl is-active --quiet k3s-agent";
pub const GET_TOKEN: &str = "cat /var/lib/rancher/k3s/server/node-token";
pub const GET_KUBECONFIG: &str = "cat /etc/rancher/k3s/k3s.yaml";

const SETUP_K3S_MASTER: &str = "setup_k3s_master";
const SETUP_K3S_AGENT: &str = "setup_k3s_agent";

const SETUP_K3S_MASTER_TEMPLATE: &str = "curl -sLS https://get.k3s.io | \
    INSTALL_K3S_EXEC='server --docker --tls-san {{ip}}' \
    INSTALL_K3S_VERSION='{{version}}' sh -";
const SETUP_K3S_AGENT_TEMPLATE: &str = "curl -fL https://get.k3s.io/ | \
    K3S_URL='{{url}}' K3S_TOKEN='{{token}}' \
    INSTALL_K3S_VERSION='{{version}}' sh -s - --docker";

/// Renders the parametrized bootstrap commands.
pub struct Scripts {
    registry: Handlebars<'static>,
}

impl Scripts {
    pub fn new() -> Result<Self, InfraError> {
        let mut registry = Handlebars::new();
        // Commands are shell, not HTML.
        registry.register_escape_fn(handlebars::no_escape);
        registry.set_strict_mode(true);
        registry.register_template_string(SETUP_K3S_MASTER, SETUP_K3S_MASTER_TEMPLATE)?;
        registry.register_template_string(SETUP_K3S_AGENT, SETUP_K3S_AGENT_TEMPLATE)?;
        Ok(Self { registry })
    }

    /// Installs and starts the k3s server, advertising `ip`.
    pub fn setup_k3s_master(&self, ip: &str) -> Result<String, InfraError> {
        self.render(SETUP_K3S_MASTER, &[("ip", ip)])
    }

    /// Installs the k3s agent and joins the cluster at `url`.
    pub fn setup_k3s_agent(&self, url: &str, token: &str) -> Result<String, InfraError> {
        self.render(SETUP_K3S_AGENT, &[("url", url), ("token", token)])
    }

    fn render(&self, name: &str, params: &[(&str, &str)]) -> Result<String, InfraError> {
        let mut params: HashMap<&str, &str> = params.iter().copied().collect();
        params.insert("version", K3S_VERSION);
        Ok(self.registry.render(name, &params)?)
    }
}

/// URL agents use to join the cluster served by `master_ip`.
pub fn join_url(master_ip: &str) -> String {
    format!("https://{}:{}", master_ip, K3S_API_PORT)
}
