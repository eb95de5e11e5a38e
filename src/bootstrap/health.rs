//! Waits for provisioned VMs to report healthy with an address

use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::poll::poll_until;
use super::provisioner::vm_names;
use crate::config::ClusterSpec;
use crate::error::StepError;
use crate::provider::ProviderAdapter;

/// VM name to assigned IP, built once per run
pub type NodeIpMap = BTreeMap<String, String>;

pub struct HealthChecker {
    provider: Arc<dyn ProviderAdapter>,
    interval: Duration,
    concurrency: usize,
}

impl HealthChecker {
    pub fn new(provider: Arc<dyn ProviderAdapter>, interval: Duration, concurrency: usize) -> Self {
        Self {
            provider,
            interval,
            concurrency: concurrency.max(1),
        }
    }

    /// Poll every derived VM until each is healthy with an IP
    ///
    /// All VMs share one deadline. Provider errors count as "not ready yet".
    /// On expiry the error names the first unready VM in node-group order.
    pub async fn wait_for_vms_to_be_ready(
        &self,
        cancel: &CancellationToken,
        spec: &ClusterSpec,
        timeout: Duration,
    ) -> Result<NodeIpMap, StepError> {
        let names = vm_names(spec);
        let deadline = Instant::now() + timeout;

        let results: Vec<Result<(String, String), StepError>> = stream::iter(names.iter().cloned())
            .map(|name| self.wait_for_vm(cancel, name, deadline))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut ips = NodeIpMap::new();
        for result in results {
            match result {
                Ok((name, ip)) => {
                    ips.insert(name, ip);
                }
                Err(StepError::Cancelled) => return Err(StepError::Cancelled),
                Err(_) => {}
            }
        }

        if let Some(missing) = names.iter().find(|name| !ips.contains_key(*name)) {
            return Err(StepError::timeout(format!("VM {missing}")));
        }

        Ok(ips)
    }

    async fn wait_for_vm(
        &self,
        cancel: &CancellationToken,
        name: String,
        deadline: Instant,
    ) -> Result<(String, String), StepError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let resource = format!("VM {name}");
        let provider = &self.provider;
        let vm = name.as_str();

        let ip = poll_until(cancel, self.interval, remaining, &resource, move || async move {
            match provider.get_vm_status(vm).await {
                Ok(status) if status.is_ready() => Some(status.ip),
                Ok(status) => {
                    debug!(vm = %vm, healthy = status.healthy, "VM not ready yet");
                    None
                }
                Err(e) => {
                    warn!(vm = %vm, error = %e, "VM status check failed, will retry");
                    None
                }
            }
        })
        .await?;

        info!(vm = %name, ip = %ip, "VM ready");
        Ok((name, ip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::testing::mgmt_spec;
    use crate::provider::{MockProviderAdapter, ProviderError, VmStatus};
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn ready(ip: &str) -> VmStatus {
        VmStatus {
            healthy: true,
            ip: ip.to_string(),
        }
    }

    /// Provider whose VMs become ready after a given number of status calls
    fn provider_ready_after(polls: u32, fail_first: bool) -> MockProviderAdapter {
        let calls: Arc<Mutex<HashMap<String, u32>>> = Arc::default();
        let mut provider = MockProviderAdapter::new();
        provider.expect_get_vm_status().returning(move |name| {
            let mut calls = calls.lock().unwrap();
            let n = calls.entry(name.to_string()).or_insert(0);
            *n += 1;
            if fail_first && *n == 1 {
                return Err(ProviderError::NotFound(name.to_string()));
            }
            if *n >= polls {
                Ok(ready(&format!("10.0.0.{}", name.len())))
            } else {
                Ok(VmStatus {
                    healthy: true,
                    ip: String::new(),
                })
            }
        });
        provider
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_ip_for_every_vm() {
        let mut provider = MockProviderAdapter::new();
        provider.expect_get_vm_status().returning(|name| {
            Ok(ready(match name {
                "mgmt-control-plane-1" => "10.0.0.11",
                "mgmt-worker-1" => "10.0.0.21",
                _ => "10.0.0.22",
            }))
        });
        let checker = HealthChecker::new(Arc::new(provider), Duration::from_secs(10), 8);

        let ips = checker
            .wait_for_vms_to_be_ready(&CancellationToken::new(), &mgmt_spec(), Duration::from_secs(600))
            .await
            .unwrap();

        assert_eq!(ips.len(), 3);
        assert_eq!(ips["mgmt-control-plane-1"], "10.0.0.11");
        assert_eq!(ips["mgmt-worker-2"], "10.0.0.22");
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_vms_concurrently() {
        // Each VM needs three polls: 20s when concurrent, 60s when sequential
        let checker = HealthChecker::new(
            Arc::new(provider_ready_after(3, false)),
            Duration::from_secs(10),
            8,
        );
        let started = Instant::now();

        let ips = checker
            .wait_for_vms_to_be_ready(&CancellationToken::new(), &mgmt_spec(), Duration::from_secs(600))
            .await
            .unwrap();

        assert_eq!(ips.len(), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_errors_are_not_fatal() {
        let checker = HealthChecker::new(
            Arc::new(provider_ready_after(2, true)),
            Duration::from_secs(10),
            8,
        );

        let ips = checker
            .wait_for_vms_to_be_ready(&CancellationToken::new(), &mgmt_spec(), Duration::from_secs(600))
            .await
            .unwrap();

        assert_eq!(ips.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_names_first_unready_vm() {
        let mut provider = MockProviderAdapter::new();
        provider.expect_get_vm_status().returning(|name| {
            if name == "mgmt-control-plane-1" {
                Ok(ready("10.0.0.11"))
            } else {
                Ok(VmStatus::default())
            }
        });
        let checker = HealthChecker::new(Arc::new(provider), Duration::from_secs(10), 8);

        let err = checker
            .wait_for_vms_to_be_ready(&CancellationToken::new(), &mgmt_spec(), Duration::from_secs(60))
            .await
            .unwrap_err();

        assert!(
            matches!(err, StepError::Timeout { ref resource } if resource == "VM mgmt-worker-1"),
            "got {err:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_deadline_with_low_concurrency() {
        // One slot, VMs never ready: the whole call still ends at the deadline
        let mut provider = MockProviderAdapter::new();
        provider
            .expect_get_vm_status()
            .returning(|_| Ok(VmStatus::default()));
        let checker = HealthChecker::new(Arc::new(provider), Duration::from_secs(10), 1);
        let started = Instant::now();

        let err = checker
            .wait_for_vms_to_be_ready(&CancellationToken::new(), &mgmt_spec(), Duration::from_secs(30))
            .await
            .unwrap_err();

        assert!(matches!(err, StepError::Timeout { .. }));
        assert_eq!(started.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_wins_over_timeout() {
        let mut provider = MockProviderAdapter::new();
        provider
            .expect_get_vm_status()
            .returning(|_| Ok(VmStatus::default()));
        let checker = HealthChecker::new(Arc::new(provider), Duration::from_secs(10), 8);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(25)).await;
            trigger.cancel();
        });

        let err = checker
            .wait_for_vms_to_be_ready(&cancel, &mgmt_spec(), Duration::from_secs(600))
            .await
            .unwrap_err();

        assert!(matches!(err, StepError::Cancelled));
    }
}
