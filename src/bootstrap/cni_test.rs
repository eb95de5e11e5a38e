use super::*;
use crate::exec::fake::FakeTool;
use serde_json::json;
use tokio::time::Instant;

fn node_json(name: &str, ip: &str, ready: &str) -> serde_json::Value {
    json!({
        "apiVersion": "v1",
        "kind": "Node",
        "metadata": { "name": name },
        "status": {
            "addresses": [
                { "type": "InternalIP", "address": ip },
                { "type": "Hostname", "address": name }
            ],
            "conditions": [
                { "type": "MemoryPressure", "status": "False" },
                { "type": "Ready", "status": ready }
            ]
        }
    })
}

fn node_list(nodes: &[serde_json::Value]) -> String {
    json!({ "apiVersion": "v1", "kind": "List", "items": nodes }).to_string()
}

fn mgmt_nodes() -> String {
    node_list(&[
        node_json("talos-cp-abc", "10.0.0.11", "True"),
        node_json("talos-wk-def", "10.0.0.21", "True"),
        node_json("talos-wk-ghi", "10.0.0.22", "False"),
    ])
}

fn roles() -> RoleIpSets {
    RoleIpSets {
        control_plane_ips: vec!["10.0.0.11".to_string()],
        worker_ips: vec!["10.0.0.21".to_string(), "10.0.0.22".to_string()],
    }
}

fn handle() -> KubeConfigHandle {
    KubeConfigHandle::new("work/kubeconfig", "mgmt")
}

fn initializer(kubectl: Arc<FakeTool>, helm: Arc<FakeTool>) -> CniInitializer {
    CniInitializer::new(kubectl, helm, Duration::from_secs(5), Duration::from_secs(120))
}

#[test]
fn test_ready_condition_must_be_true() {
    let nodes = parse_nodes(&mgmt_nodes()).unwrap();

    assert!(node_is_ready(&nodes[0]));
    assert!(!node_is_ready(&nodes[2]));
}

#[test]
fn test_not_ready_text_is_not_ready() {
    // "NotReady" contains "Ready"; only the condition status counts
    let nodes = parse_nodes(&node_list(&[node_json("n1", "10.0.0.11", "Unknown")])).unwrap();
    assert!(!node_is_ready(&nodes[0]));
}

#[test]
fn test_internal_ip_map() {
    let nodes = parse_nodes(&mgmt_nodes()).unwrap();
    let map = internal_ip_map(&nodes);

    assert_eq!(map.len(), 3);
    assert_eq!(map["10.0.0.11"], "talos-cp-abc");
    assert_eq!(map["10.0.0.22"], "talos-wk-ghi");
}

#[test]
fn test_resolve_names_skips_unknown_and_dedups() {
    let map: IpToNodeName = [("10.0.0.11", "cp-1"), ("10.0.0.12", "cp-1")]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let ips = vec![
        "10.0.0.11".to_string(),
        "10.0.0.99".to_string(),
        "10.0.0.12".to_string(),
    ];

    assert_eq!(resolve_names(&map, &ips), vec!["cp-1"]);
}

#[test]
fn test_peer_list_excludes_bound_ip() {
    let cps = vec![
        "10.0.0.11".to_string(),
        "10.0.0.12".to_string(),
        "10.0.0.13".to_string(),
        "10.0.0.12".to_string(),
    ];

    assert_eq!(
        render_peer_list("10.0.0.100", &cps, "10.0.0.11"),
        vec!["10.0.0.100", "10.0.0.12", "10.0.0.13"]
    );
}

#[test]
fn test_peer_list_single_control_plane_is_vip_only() {
    let cps = vec!["10.0.0.11".to_string()];
    assert_eq!(render_peer_list("10.0.0.100", &cps, "10.0.0.11"), vec!["10.0.0.100"]);
}

#[test]
fn test_peer_list_never_repeats_vip() {
    let cps = vec!["10.0.0.100".to_string(), "10.0.0.12".to_string()];
    assert_eq!(
        render_peer_list("10.0.0.100", &cps, "10.0.0.11"),
        vec!["10.0.0.100", "10.0.0.12"]
    );
}

#[test]
fn test_render_values_fills_master_nodes_and_node_ips() {
    let rendered = render_values(&["10.0.0.100".to_string(), "10.0.0.12".to_string()]).unwrap();

    assert!(rendered.contains("MASTER_NODES: \"10.0.0.100,10.0.0.12\""));
    assert!(!rendered.contains("{{"));
    let parsed: serde_yaml::Value = serde_yaml::from_str(&rendered).unwrap();
    assert_eq!(parsed["MASTER_NODES"].as_str(), Some("10.0.0.100,10.0.0.12"));
    assert_eq!(parsed["NODE_IPS"], parsed["MASTER_NODES"]);
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_nodes_polls_until_ready() {
    let not_ready = node_list(&[node_json("n1", "10.0.0.11", "False")]);
    let ready = mgmt_nodes();
    let kubectl = Arc::new(FakeTool::new("kubectl").script(
        "get nodes",
        vec![Err("connection refused"), Ok(not_ready.as_str()), Ok(ready.as_str())],
    ));
    let cni = initializer(kubectl.clone(), Arc::new(FakeTool::new("helm")));
    let started = Instant::now();

    cni.wait_for_nodes(&CancellationToken::new(), &handle(), "10.0.0.11")
        .await
        .unwrap();

    assert_eq!(kubectl.count_matching("get nodes -o json"), 3);
    assert_eq!(started.elapsed(), Duration::from_secs(10));
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_nodes_timeout() {
    let kubectl = Arc::new(FakeTool::new("kubectl").fail("get nodes", "connection refused"));
    let cni = initializer(kubectl, Arc::new(FakeTool::new("helm")));

    let err = cni
        .wait_for_nodes(&CancellationToken::new(), &handle(), "10.0.0.11")
        .await
        .unwrap_err();

    assert!(matches!(err, StepError::Timeout { ref resource } if resource == "Ready node on 10.0.0.11"));
}

#[tokio::test]
async fn test_resolve_node_names_through_bound_node() {
    let nodes = mgmt_nodes();
    let kubectl = Arc::new(FakeTool::new("kubectl").respond("get nodes", &nodes));
    let cni = initializer(kubectl.clone(), Arc::new(FakeTool::new("helm")));

    let map = cni
        .resolve_node_names(&CancellationToken::new(), &handle(), "10.0.0.11")
        .await
        .unwrap();

    assert_eq!(map.len(), 3);
    assert!(kubectl.lines()[0].starts_with("--server https://10.0.0.11:6443"));
}

#[tokio::test]
async fn test_resolve_node_names_rejects_garbage() {
    let kubectl = Arc::new(FakeTool::new("kubectl").respond("get nodes", "NAME STATUS"));
    let cni = initializer(kubectl, Arc::new(FakeTool::new("helm")));

    let err = cni
        .resolve_node_names(&CancellationToken::new(), &handle(), "10.0.0.11")
        .await
        .unwrap_err();

    assert!(matches!(err, StepError::Invariant(_)));
}

#[tokio::test]
async fn test_label_nodes_through_vip() {
    let kubectl = Arc::new(FakeTool::new("kubectl"));
    let cni = initializer(kubectl.clone(), Arc::new(FakeTool::new("helm")));
    let mut map = internal_ip_map(&parse_nodes(&mgmt_nodes()).unwrap());
    map.remove("10.0.0.22");

    cni.label_nodes(&CancellationToken::new(), &handle(), "10.0.0.100", &roles(), &map)
        .await
        .unwrap();

    let lines = kubectl.lines();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("--server https://10.0.0.100:6443"));
    assert!(lines[0].contains("label node talos-cp-abc kube-ovn/role=master --overwrite"));
    assert!(lines[1].contains("label node talos-wk-def node-role.kubernetes.io/worker= --overwrite"));
}

#[tokio::test]
async fn test_label_failure_names_node() {
    let kubectl = Arc::new(FakeTool::new("kubectl").fail("talos-wk-def", "forbidden"));
    let cni = initializer(kubectl, Arc::new(FakeTool::new("helm")));
    let map = internal_ip_map(&parse_nodes(&mgmt_nodes()).unwrap());

    let err = cni
        .label_nodes(&CancellationToken::new(), &handle(), "10.0.0.100", &roles(), &map)
        .await
        .unwrap_err();

    assert!(matches!(err, StepError::Tool { ref action, .. } if action == "label node talos-wk-def"));
}

#[tokio::test]
async fn test_install_adds_repo_then_installs_with_temp_values() {
    let helm = Arc::new(FakeTool::new("helm"));
    let cni = initializer(Arc::new(FakeTool::new("kubectl")), helm.clone());

    cni.install(&CancellationToken::new(), &handle(), "10.0.0.100", &roles())
        .await
        .unwrap();

    let calls = helm.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[0].line().starts_with("repo add kube-ovn https://kubeovn.github.io/kube-ovn/"));

    let install = &calls[1].args;
    assert_eq!(&install[..4], &["upgrade", "--install", "kube-ovn", "kube-ovn/kube-ovn"]);
    let values = &install[install.iter().position(|a| a == "-f").unwrap() + 1];
    assert!(values.ends_with(".yaml"));
    // removed once the install returns
    assert!(!std::path::Path::new(values).exists());
    assert!(calls[1].line().contains("--kube-apiserver https://10.0.0.100:6443"));
}

#[tokio::test]
async fn test_install_failure_is_tool_error() {
    let helm = Arc::new(FakeTool::new("helm").fail("upgrade --install", "cannot re-use a name"));
    let cni = initializer(Arc::new(FakeTool::new("kubectl")), helm);

    let err = cni
        .install(&CancellationToken::new(), &handle(), "10.0.0.100", &roles())
        .await
        .unwrap_err();

    assert!(matches!(err, StepError::Tool { ref action, .. } if action == "install CNI chart"));
}
