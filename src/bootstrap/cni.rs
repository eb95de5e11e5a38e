//! Container network plugin
//!
//! Node readiness, internal-IP to node-name resolution, role labels and the
//! chart install. Labels and the install go through the floating IP; readiness
//! and name resolution run against the bound control-plane node before the
//! VIP exists.

use k8s_openapi::api::core::v1::Node;
use minijinja::{context, Environment};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::classifier::RoleIpSets;
use super::kubeconfig::{api_server, KubeConfigHandle, KubectlTarget};
use super::poll::poll_until;
use crate::error::StepError;
use crate::exec::{argv, ToolAdapter};

pub const CONTROL_PLANE_LABEL: &str = "kube-ovn/role=master";
pub const WORKER_LABEL: &str = "node-role.kubernetes.io/worker=";

pub const CHART_REPO_NAME: &str = "kube-ovn";
pub const CHART_REPO_URL: &str = "https://kubeovn.github.io/kube-ovn/";
pub const CHART: &str = "kube-ovn/kube-ovn";
pub const RELEASE: &str = "kube-ovn";
pub const NAMESPACE: &str = "kube-system";

const VALUES_TEMPLATE: &str = include_str!("../../assets/cni-values.yaml");

/// Internal IP to cluster-assigned node name
pub type IpToNodeName = BTreeMap<String, String>;

/// `kubectl get nodes -o json` returns a `List`, not a typed `NodeList`
#[derive(Debug, Deserialize)]
struct NodeItems {
    #[serde(default)]
    items: Vec<Node>,
}

pub fn parse_nodes(json: &str) -> Result<Vec<Node>, serde_json::Error> {
    Ok(serde_json::from_str::<NodeItems>(json)?.items)
}

/// A node counts as ready only when its `Ready` condition is `True`
pub fn node_is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

pub fn internal_ip_map(nodes: &[Node]) -> IpToNodeName {
    let mut map = IpToNodeName::new();
    for node in nodes {
        let Some(name) = node.metadata.name.as_ref() else {
            continue;
        };
        let addresses = node
            .status
            .as_ref()
            .and_then(|status| status.addresses.as_ref());
        for address in addresses.into_iter().flatten() {
            if address.type_ == "InternalIP" {
                map.insert(address.address.clone(), name.clone());
            }
        }
    }
    map
}

/// Map IPs to node names, skipping unknown IPs and repeated names
pub fn resolve_names(ip_to_name: &IpToNodeName, ips: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut names = Vec::new();

    for ip in ips {
        match ip_to_name.get(ip) {
            Some(name) => {
                if seen.insert(name.clone()) {
                    names.push(name.clone());
                }
            }
            None => warn!(ip = %ip, "IP not found among cluster nodes, skipping"),
        }
    }

    names
}

/// Floating IP first, then control-plane IPs other than the bound node
pub fn render_peer_list(vip: &str, control_plane_ips: &[String], bound_ip: &str) -> Vec<String> {
    let mut peers = vec![vip.to_string()];
    for ip in control_plane_ips {
        if ip == bound_ip {
            debug!(ip = %ip, "Skipping bound control-plane IP");
            continue;
        }
        if !peers.contains(ip) {
            peers.push(ip.clone());
        }
    }
    peers
}

pub fn render_values(peers: &[String]) -> Result<String, StepError> {
    let render_err = |e: minijinja::Error| StepError::Render {
        name: "CNI values".to_string(),
        message: e.to_string(),
    };

    let joined = peers.join(",");
    let mut env = Environment::new();
    env.add_template("cni-values.yaml", VALUES_TEMPLATE)
        .map_err(render_err)?;
    env.get_template("cni-values.yaml")
        .map_err(render_err)?
        .render(context! { MASTER_NODES => joined, NODE_IPS => joined })
        .map_err(render_err)
}

pub struct CniInitializer {
    kubectl: Arc<dyn ToolAdapter>,
    helm: Arc<dyn ToolAdapter>,
    node_poll_interval: Duration,
    node_wait_timeout: Duration,
}

impl CniInitializer {
    pub fn new(
        kubectl: Arc<dyn ToolAdapter>,
        helm: Arc<dyn ToolAdapter>,
        node_poll_interval: Duration,
        node_wait_timeout: Duration,
    ) -> Self {
        Self {
            kubectl,
            helm,
            node_poll_interval,
            node_wait_timeout,
        }
    }

    /// Wait until at least one node reports Ready through `host`
    pub async fn wait_for_nodes(
        &self,
        cancel: &CancellationToken,
        kubeconfig: &KubeConfigHandle,
        host: &str,
    ) -> Result<(), StepError> {
        info!(server = %api_server(host), "Waiting for a Ready node");
        let kubectl = &self.kubectl;
        let args = KubectlTarget::new(host, &kubeconfig.path)
            .insecure()
            .args(&["get", "nodes", "-o", "json", "--request-timeout=15s"]);
        let args = &args;

        poll_until(
            cancel,
            self.node_poll_interval,
            self.node_wait_timeout,
            &format!("Ready node on {host}"),
            move || async move {
                let out = kubectl.execute(cancel, args.clone()).await.ok()?;
                match parse_nodes(&out) {
                    Ok(nodes) if nodes.iter().any(node_is_ready) => Some(()),
                    Ok(_) => None,
                    Err(e) => {
                        warn!(error = %e, "Could not parse node list");
                        None
                    }
                }
            },
        )
        .await?;

        info!("Nodes detected in cluster");
        Ok(())
    }

    /// Read the internal-IP to node-name mapping through `host`
    pub async fn resolve_node_names(
        &self,
        cancel: &CancellationToken,
        kubeconfig: &KubeConfigHandle,
        host: &str,
    ) -> Result<IpToNodeName, StepError> {
        let target = KubectlTarget::new(host, &kubeconfig.path).insecure();
        let out = self
            .kubectl
            .execute(cancel, target.args(&["get", "nodes", "-o", "json"]))
            .await
            .map_err(|e| StepError::tool("list nodes", e))?;

        let nodes = parse_nodes(&out)
            .map_err(|e| StepError::invariant(format!("unreadable node list: {e}")))?;
        let map = internal_ip_map(&nodes);
        if map.is_empty() {
            return Err(StepError::invariant("no node reports an internal IP"));
        }

        info!(nodes = map.len(), "Resolved node names");
        Ok(map)
    }

    /// Label control-plane and worker nodes for the network plugin
    pub async fn label_nodes(
        &self,
        cancel: &CancellationToken,
        kubeconfig: &KubeConfigHandle,
        vip: &str,
        roles: &RoleIpSets,
        ip_to_name: &IpToNodeName,
    ) -> Result<(), StepError> {
        let target = KubectlTarget::new(vip, &kubeconfig.path).insecure();
        let labels = [
            (resolve_names(ip_to_name, &roles.control_plane_ips), CONTROL_PLANE_LABEL),
            (resolve_names(ip_to_name, &roles.worker_ips), WORKER_LABEL),
        ];

        for (names, label) in &labels {
            for name in names {
                info!(node = %name, label = %label, "Labeling node");
                self.kubectl
                    .execute(
                        cancel,
                        target.args(&["label", "node", name, label, "--overwrite"]),
                    )
                    .await
                    .map_err(|e| StepError::tool(format!("label node {name}"), e))?;
            }
        }

        Ok(())
    }

    /// Render the values file and install the chart through the floating IP
    pub async fn install(
        &self,
        cancel: &CancellationToken,
        kubeconfig: &KubeConfigHandle,
        vip: &str,
        roles: &RoleIpSets,
    ) -> Result<(), StepError> {
        let bound = roles.bound_ip().unwrap_or_default();
        let peers = render_peer_list(vip, &roles.control_plane_ips, bound);
        info!(vip = %vip, bound = %bound, peers = ?peers, "Rendering CNI values");

        let values = render_values(&peers)?;
        let mut file = tempfile::Builder::new()
            .prefix("cni-values-")
            .suffix(".yaml")
            .tempfile()
            .map_err(|e| StepError::io("create CNI values file", e))?;
        file.write_all(values.as_bytes())
            .and_then(|_| file.flush())
            .map_err(|e| StepError::io("write CNI values file", e))?;
        let values_path = file.path().display().to_string();

        self.helm
            .execute(
                cancel,
                argv(&["repo", "add", CHART_REPO_NAME, CHART_REPO_URL, "--force-update"]),
            )
            .await
            .map_err(|e| StepError::tool("add CNI chart repository", e))?;

        let kubeconfig_path = kubeconfig.path_str();
        let server = api_server(vip);
        info!(values = %values_path, server = %server, "Installing CNI chart");
        self.helm
            .execute(
                cancel,
                argv(&[
                    "upgrade",
                    "--install",
                    RELEASE,
                    CHART,
                    "-n",
                    NAMESPACE,
                    "-f",
                    &values_path,
                    "--kubeconfig",
                    &kubeconfig_path,
                    "--kube-apiserver",
                    &server,
                    "--kube-insecure-skip-tls-verify",
                ]),
            )
            .await
            .map_err(|e| StepError::tool("install CNI chart", e))?;

        // values file is removed when `file` drops
        info!("CNI installed");
        Ok(())
    }
}

#[cfg(test)]
#[path = "cni_test.rs"]
mod tests;
