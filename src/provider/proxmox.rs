//! Proxmox VE provider
//!
//! Talks to the `/api2/json` REST API with ticket authentication. VM ids are
//! `"{node}/{vmid}"` so a handle carries enough to address the VM later.

use async_trait::async_trait;
use rand::seq::SliceRandom;
use reqwest::header::COOKIE;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{ProviderAdapter, ProviderError, VmHandle, VmRequest, VmStatus};
use crate::config::{ConfigError, ProxmoxConfig};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const STOP_POLL_INTERVAL: Duration = Duration::from_secs(2);
const STOP_POLL_ATTEMPTS: u32 = 30;

#[derive(Debug, Clone)]
struct Session {
    ticket: String,
    csrf_token: String,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct TicketData {
    ticket: String,
    #[serde(rename = "CSRFPreventionToken")]
    csrf_prevention_token: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ClusterVm {
    #[serde(default)]
    name: String,
    node: String,
    vmid: u32,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct AgentInterfaces {
    #[serde(default)]
    result: Vec<AgentInterface>,
}

#[derive(Debug, Deserialize)]
struct AgentInterface {
    #[serde(default)]
    name: String,
    #[serde(rename = "ip-addresses", default)]
    ip_addresses: Vec<AgentAddress>,
}

#[derive(Debug, Deserialize)]
struct AgentAddress {
    #[serde(rename = "ip-address-type")]
    ip_address_type: String,
    #[serde(rename = "ip-address")]
    ip_address: String,
}

#[derive(Debug, Deserialize)]
struct CurrentStatus {
    status: String,
}

/// Body of `POST /nodes/{node}/qemu`
#[derive(Debug, Serialize)]
struct CreateVmBody {
    vmid: u32,
    name: String,
    ostype: &'static str,
    memory: u64,
    cores: u32,
    sockets: u32,
    cpu: &'static str,
    start: u8,
    onboot: u8,
    agent: &'static str,
    ide2: String,
    scsihw: &'static str,
    scsi0: String,
    net0: String,
    /// scsi1, scsi2, ... for extra disks
    #[serde(flatten)]
    extra_disks: BTreeMap<String, String>,
}

/// [`ProviderAdapter`] backed by a Proxmox VE cluster
pub struct ProxmoxProvider {
    config: ProxmoxConfig,
    client: Client,
    session: RwLock<Option<Session>>,
}

impl ProxmoxProvider {
    pub fn new(config: ProxmoxConfig) -> Result<Self, ConfigError> {
        if config.endpoint.trim().is_empty() {
            return Err(ConfigError::InvalidProvider(
                "proxmox.endpoint is required".to_string(),
            ));
        }
        if config.username.trim().is_empty() {
            return Err(ConfigError::InvalidProvider(
                "proxmox.username is required".to_string(),
            ));
        }
        if config.storage_location.trim().is_empty() {
            return Err(ConfigError::InvalidProvider(
                "proxmox.storageLocation is required".to_string(),
            ));
        }
        if config.nodes.is_empty() {
            return Err(ConfigError::InvalidProvider(
                "proxmox.nodes must list at least one node".to_string(),
            ));
        }
        if config.available_vm_id_start > config.available_vm_id_end {
            return Err(ConfigError::InvalidProvider(format!(
                "VM id range {}-{} is empty",
                config.available_vm_id_start, config.available_vm_id_end
            )));
        }

        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(config.insecure_tls)
            .build()
            .map_err(|e| ConfigError::InvalidProvider(format!("HTTP client: {e}")))?;

        Ok(Self {
            config,
            client,
            session: RwLock::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/api2/json{}",
            self.config.endpoint.trim_end_matches('/'),
            path
        )
    }

    async fn login(&self) -> Result<Session, ProviderError> {
        debug!(user = %self.config.username, "Requesting Proxmox ticket");

        let response = self
            .client
            .post(self.url("/access/ticket"))
            .form(&[
                ("username", self.config.username.as_str()),
                ("password", self.config.password.as_str()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Auth(format!("{status}: {body}")));
        }

        let envelope: Envelope<TicketData> = response.json().await?;
        Ok(Session {
            ticket: envelope.data.ticket,
            csrf_token: envelope.data.csrf_prevention_token,
        })
    }

    async fn session(&self) -> Result<Session, ProviderError> {
        if let Some(session) = self.session.read().await.clone() {
            return Ok(session);
        }

        let mut guard = self.session.write().await;
        if let Some(session) = guard.clone() {
            return Ok(session);
        }
        let session = self.login().await?;
        *guard = Some(session.clone());
        Ok(session)
    }

    async fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, ProviderError> {
        let session = self.session().await?;
        let mut builder = self
            .client
            .request(method.clone(), self.url(path))
            .header(COOKIE, format!("PVEAuthCookie={}", session.ticket));
        if method != Method::GET {
            builder = builder.header("CSRFPreventionToken", session.csrf_token);
        }
        Ok(builder)
    }

    /// Send an authenticated request, logging in again once if the ticket was rejected
    async fn call<F>(&self, method: Method, path: &str, build: F) -> Result<Response, ProviderError>
    where
        F: Fn(RequestBuilder) -> RequestBuilder + Send,
    {
        let response = build(self.request(method.clone(), path).await?).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return check(response).await;
        }

        warn!(path = %path, "Proxmox ticket rejected, logging in again");
        self.session.write().await.take();
        let response = build(self.request(method, path).await?).send().await?;
        check(response).await
    }

    async fn fetch<T: DeserializeOwned>(&self, path: &str) -> Result<T, ProviderError> {
        let response = self.call(Method::GET, path, |b| b).await?;
        let envelope: Envelope<T> = response.json().await?;
        Ok(envelope.data)
    }

    async fn cluster_vms(&self) -> Result<Vec<ClusterVm>, ProviderError> {
        let response = self
            .call(Method::GET, "/cluster/resources", |b| b.query(&[("type", "vm")]))
            .await?;
        let envelope: Envelope<Vec<ClusterVm>> = response.json().await?;
        Ok(envelope.data)
    }

    async fn find_vm(&self, name: &str) -> Result<Option<ClusterVm>, ProviderError> {
        Ok(self
            .cluster_vms()
            .await?
            .into_iter()
            .find(|vm| vm.name == name))
    }

    fn next_vm_id(&self, existing: &[ClusterVm]) -> Result<u32, ProviderError> {
        let taken: HashSet<u32> = existing.iter().map(|vm| vm.vmid).collect();
        let start = self.config.available_vm_id_start;
        let end = self.config.available_vm_id_end;

        (start..=end)
            .find(|id| !taken.contains(id))
            .ok_or(ProviderError::NoCapacity { start, end })
    }

    fn pick_node(&self) -> Result<String, ProviderError> {
        self.config
            .nodes
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or(ProviderError::NoPlacement)
    }

    fn create_body(&self, vmid: u32, request: &VmRequest) -> CreateVmBody {
        let storage = &self.config.storage_location;
        let extra_disks = request
            .extra_disks_mib
            .iter()
            .enumerate()
            .map(|(i, mib)| {
                (
                    format!("scsi{}", i + 1),
                    format!("{}:{},iothread=on", storage, gib_ceil(*mib)),
                )
            })
            .collect();

        CreateVmBody {
            vmid,
            name: request.name.clone(),
            ostype: "l26",
            memory: request.memory_mib,
            cores: request.cpu,
            sockets: 1,
            cpu: "host",
            start: 1,
            onboot: 1,
            agent: "1",
            ide2: format!("{},media=cdrom", request.image),
            scsihw: "virtio-scsi-single",
            scsi0: format!("{}:{},iothread=on", storage, gib_ceil(request.disk_mib)),
            net0: format!("virtio,bridge={},firewall=1", self.config.bridge),
            extra_disks,
        }
    }

    /// First non-loopback IPv4 address reported by the guest agent
    async fn guest_ip(&self, vm: &ClusterVm) -> Result<String, ProviderError> {
        let path = format!(
            "/nodes/{}/qemu/{}/agent/network-get-interfaces",
            vm.node, vm.vmid
        );
        let interfaces: AgentInterfaces = self.fetch(&path).await?;

        Ok(interfaces
            .result
            .iter()
            .filter(|iface| iface.name != "lo")
            .flat_map(|iface| iface.ip_addresses.iter())
            .find(|addr| addr.ip_address_type == "ipv4" && !addr.ip_address.starts_with("127."))
            .map(|addr| addr.ip_address.clone())
            .unwrap_or_default())
    }

    async fn wait_stopped(&self, node: &str, vmid: u32) -> Result<(), ProviderError> {
        let path = format!("/nodes/{node}/qemu/{vmid}/status/current");
        for _ in 0..STOP_POLL_ATTEMPTS {
            let status: CurrentStatus = self.fetch(&path).await?;
            if status.status == "stopped" {
                return Ok(());
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }
        warn!(node = %node, vmid = vmid, "VM still running after stop request");
        Ok(())
    }
}

async fn check(response: Response) -> Result<Response, ProviderError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(ProviderError::Api { status, body })
}

fn gib_ceil(mib: u64) -> u64 {
    mib.div_ceil(1024).max(1)
}

fn parse_id(id: &str) -> Result<(&str, u32), ProviderError> {
    let invalid = || ProviderError::InvalidId(id.to_string());
    let (node, vmid) = id.split_once('/').ok_or_else(invalid)?;
    if node.is_empty() {
        return Err(invalid());
    }
    let vmid = vmid.parse().map_err(|_| invalid())?;
    Ok((node, vmid))
}

#[async_trait]
impl ProviderAdapter for ProxmoxProvider {
    async fn create_vm(&self, request: &VmRequest) -> Result<VmHandle, ProviderError> {
        let existing = self.cluster_vms().await?;
        let vmid = self.next_vm_id(&existing)?;
        let node = self.pick_node()?;
        let body = self.create_body(vmid, request);

        info!(
            vm = %request.name,
            node = %node,
            vmid = vmid,
            cpu = request.cpu,
            memory_mib = request.memory_mib,
            "Creating VM"
        );

        let path = format!("/nodes/{node}/qemu");
        self.call(Method::POST, &path, |b| b.json(&body)).await?;

        Ok(VmHandle {
            id: format!("{node}/{vmid}"),
            name: request.name.clone(),
        })
    }

    async fn delete_vm(&self, id: &str) -> Result<(), ProviderError> {
        let (node, vmid) = parse_id(id)?;
        info!(node = %node, vmid = vmid, "Deleting VM");

        let stop = format!("/nodes/{node}/qemu/{vmid}/status/stop");
        self.call(Method::POST, &stop, |b| b).await?;
        self.wait_stopped(node, vmid).await?;

        let path = format!("/nodes/{node}/qemu/{vmid}");
        self.call(Method::DELETE, &path, |b| b.query(&[("purge", "1")]))
            .await?;
        Ok(())
    }

    async fn get_vm_status(&self, name: &str) -> Result<VmStatus, ProviderError> {
        let vm = self
            .find_vm(name)
            .await?
            .ok_or_else(|| ProviderError::NotFound(name.to_string()))?;

        let healthy = vm.status == "running";
        if !healthy {
            return Ok(VmStatus {
                healthy,
                ip: String::new(),
            });
        }

        // The guest agent answers with an error until it has started
        let ip = match self.guest_ip(&vm).await {
            Ok(ip) => ip,
            Err(e) => {
                debug!(vm = %name, error = %e, "Guest agent not answering yet");
                String::new()
            }
        };

        Ok(VmStatus { healthy, ip })
    }

    async fn lookup_vm(&self, name: &str) -> Result<Option<VmHandle>, ProviderError> {
        Ok(self.find_vm(name).await?.map(|vm| VmHandle {
            id: format!("{}/{}", vm.node, vm.vmid),
            name: vm.name,
        }))
    }
}

#[cfg(test)]
#[path = "proxmox_test.rs"]
mod tests;
