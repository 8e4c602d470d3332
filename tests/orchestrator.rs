//! Orchestrator Integration Tests
//!
//! Lifecycle operations end to end on the noop drivers and the in-memory
//! store.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;

use ampctl::adapters::{
    AdapterError, ComputeAdapter, Fault, NoopCompute, NoopDrivers, ProvisionRequest,
};
use ampctl::core::{
    list_executions, FlowError, FlowJournal, RetryPolicy, TaskContext, TaskError, TaskNode,
};
use ampctl::domain::constants::{ADDED_PORTS, AMPHORA, DELTA};
use ampctl::domain::{
    AddedPorts, Amphora, AmphoraRole, AmphoraStatus, ComputeInstance, Flavor, Interface, Listener,
    LoadBalancer, NetworkDelta, Nic, Pool, ProvisioningStatus, Topology,
};
use ampctl::store::Filter;
use ampctl::tasks::HandleNetworkDelta;
use ampctl::{
    ControllerConfig, Flow, FlowEngine, FlowState, MemoryStore, OrchestrationError, Orchestrator,
    Repository,
};

struct Harness {
    drivers: NoopDrivers,
    repo: Arc<dyn Repository>,
    orchestrator: Orchestrator,
}

fn harness() -> Harness {
    harness_with(ControllerConfig::default())
}

fn harness_with(config: ControllerConfig) -> Harness {
    let drivers = NoopDrivers::new();
    let repo: Arc<dyn Repository> = Arc::new(MemoryStore::new());
    let orchestrator = Orchestrator::new(drivers.context(repo.clone(), Arc::new(config)));
    Harness {
        drivers,
        repo,
        orchestrator,
    }
}

impl Harness {
    async fn seed_lb(&self, id: &str, topology: Topology) {
        self.repo
            .insert(&LoadBalancer::new(id, topology))
            .await
            .unwrap();
    }

    async fn create_lb(&self, id: &str, topology: Topology) -> LoadBalancer {
        self.seed_lb(id, topology).await;
        self.orchestrator
            .create_load_balancer(id, None, false)
            .await
            .unwrap()
    }

    async fn amphorae(&self, lb_id: &str) -> Vec<Amphora> {
        self.repo.amphorae_for(lb_id).await.unwrap()
    }

    async fn amphora(&self, id: &str) -> Amphora {
        self.repo.require::<Amphora>(id).await.unwrap()
    }

    async fn all_amphorae(&self) -> Vec<Amphora> {
        self.repo.list(&Filter::new()).await.unwrap()
    }
}

fn rejected(what: &str) -> AdapterError {
    AdapterError::Rejected(format!("{} refused", what))
}

fn networks(interfaces: &[Interface]) -> Vec<String> {
    let mut names: Vec<String> = interfaces.iter().map(|i| i.network_id.clone()).collect();
    names.sort();
    names
}

/// Boots instances on the first requested network only, so a failover has
/// to plug the rest. Remembers the networks each instance still had when it
/// was deleted.
struct PartialBoot {
    inner: Arc<NoopCompute>,
    deleted: Mutex<Vec<Vec<String>>>,
}

impl PartialBoot {
    fn deleted(&self) -> Vec<Vec<String>> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl ComputeAdapter for PartialBoot {
    async fn provision(&self, request: &ProvisionRequest) -> Result<String, AdapterError> {
        let mut request = request.clone();
        request.network_ids.truncate(1);
        self.inner.provision(&request).await
    }

    async fn get_status(&self, compute_id: &str) -> Result<ComputeInstance, AdapterError> {
        self.inner.get_status(compute_id).await
    }

    async fn attach_network_or_port(
        &self,
        compute_id: &str,
        network_id: Option<&str>,
        port_id: Option<&str>,
        ip_address: Option<&str>,
    ) -> Result<Interface, AdapterError> {
        self.inner
            .attach_network_or_port(compute_id, network_id, port_id, ip_address)
            .await
    }

    async fn detach_port(&self, compute_id: &str, port_id: &str) -> Result<(), AdapterError> {
        self.inner.detach_port(compute_id, port_id).await
    }

    async fn delete(&self, compute_id: &str) -> Result<(), AdapterError> {
        if let Ok(interfaces) = self.inner.list_interfaces(compute_id).await {
            self.deleted.lock().unwrap().push(networks(&interfaces));
        }
        self.inner.delete(compute_id).await
    }

    async fn list_interfaces(&self, compute_id: &str) -> Result<Vec<Interface>, AdapterError> {
        self.inner.list_interfaces(compute_id).await
    }

    async fn create_server_group(&self, name: &str, policy: &str) -> Result<String, AdapterError> {
        self.inner.create_server_group(name, policy).await
    }

    async fn delete_server_group(&self, server_group_id: &str) -> Result<(), AdapterError> {
        self.inner.delete_server_group(server_group_id).await
    }
}

fn three_network_config() -> ControllerConfig {
    let mut config = ControllerConfig::default();
    config.controller_worker.amp_boot_network_list =
        vec!["lb-mgmt-net".to_string(), "net-a".to_string(), "net-b".to_string()];
    config.task_retry = RetryPolicy::fixed(3, Duration::ZERO);
    config
}

fn partial_boot_harness() -> (Harness, Arc<PartialBoot>) {
    let drivers = NoopDrivers::new();
    let repo: Arc<dyn Repository> = Arc::new(MemoryStore::new());
    let compute = Arc::new(PartialBoot {
        inner: drivers.compute.clone(),
        deleted: Mutex::new(Vec::new()),
    });
    let ctx = TaskContext {
        compute: compute.clone(),
        network: drivers.network.clone(),
        agent: drivers.agent.clone(),
        certs: drivers.certs.clone(),
        repo: repo.clone(),
        config: Arc::new(three_network_config()),
    };
    let harness = Harness {
        drivers,
        repo,
        orchestrator: Orchestrator::new(ctx),
    };
    (harness, compute)
}

fn journaled_harness(dir: &Path) -> Harness {
    let mut h = harness();
    let ctx = h
        .drivers
        .context(h.repo.clone(), Arc::new(ControllerConfig::default()));
    h.orchestrator = Orchestrator::new(ctx).with_journal_dir(dir);
    h
}

async fn only_execution_state(dir: &Path) -> FlowState {
    let ids = list_executions(dir).await.unwrap();
    assert_eq!(ids.len(), 1);
    FlowJournal::open(dir, ids[0])
        .await
        .unwrap()
        .execution()
        .await
        .unwrap()
        .unwrap()
        .state
}

async fn boot_instance(drivers: &NoopDrivers, network_ids: &[&str]) -> String {
    let request = ProvisionRequest {
        name: "amphora-1".to_string(),
        amphora_id: "amp-1".to_string(),
        image_tag: "amphora".to_string(),
        compute_flavor: "small".to_string(),
        network_ids: network_ids.iter().map(|n| n.to_string()).collect(),
        server_group_id: None,
        build_priority: 40,
        config_drive_files: BTreeMap::new(),
    };
    drivers.compute.provision(&request).await.unwrap()
}

fn plug_flow(compute_id: &str, add: &[&str], retry: RetryPolicy) -> Flow {
    let delta = NetworkDelta {
        amphora_id: "amp-1".to_string(),
        compute_id: compute_id.to_string(),
        add_nics: add
            .iter()
            .map(|network_id| Nic {
                network_id: network_id.to_string(),
                port_id: None,
            })
            .collect(),
        delete_nics: Vec::new(),
    };
    Flow::new("plug").then(
        TaskNode::new(HandleNetworkDelta)
            .inject(AMPHORA, &Amphora::new("amp-1"))
            .inject(DELTA, &delta)
            .retry(retry),
    )
}

#[tokio::test]
async fn test_create_single_load_balancer() {
    let h = harness();
    let lb = h.create_lb("lb-1", Topology::Single).await;

    assert_eq!(lb.provisioning_status, ProvisioningStatus::Active);
    assert!(lb.vip.as_ref().and_then(|v| v.ip_address.as_ref()).is_some());

    let amphorae = h.amphorae("lb-1").await;
    assert_eq!(amphorae.len(), 1);
    assert_eq!(amphorae[0].status, AmphoraStatus::Allocated);
    assert_eq!(amphorae[0].role, Some(AmphoraRole::Standalone));
    assert!(amphorae[0].compute_id.is_some());
    assert_eq!(h.drivers.recorder.count("provision"), 1);
    assert_eq!(h.drivers.recorder.count("start_vrrp_service"), 0);
}

#[tokio::test]
async fn test_create_active_standby_load_balancer() {
    let h = harness();
    let lb = h.create_lb("lb-1", Topology::ActiveStandby).await;

    assert_eq!(lb.provisioning_status, ProvisioningStatus::Active);
    assert_eq!(lb.topology, Topology::ActiveStandby);

    let amphorae = h.amphorae("lb-1").await;
    assert_eq!(amphorae.len(), 2);
    let roles: BTreeSet<&str> = amphorae
        .iter()
        .filter_map(|amp| amp.role.as_ref().map(|r| r.as_str()))
        .collect();
    assert_eq!(roles, BTreeSet::from(["BACKUP", "MASTER"]));
    for amp in &amphorae {
        let expected = match amp.role {
            Some(AmphoraRole::Master) => 100,
            _ => 90,
        };
        assert_eq!(amp.vrrp_priority, Some(expected));
        assert_eq!(amp.status, AmphoraStatus::Allocated);
    }
    assert_eq!(h.drivers.recorder.count("start_vrrp_service"), 2);
}

#[tokio::test]
async fn test_flavor_topology_overrides_stored_one() {
    let h = harness();
    h.seed_lb("lb-1", Topology::Single).await;
    let flavor = Flavor::default().with("loadbalancer_topology", "ACTIVE_STANDBY");

    let lb = h
        .orchestrator
        .create_load_balancer("lb-1", Some(&flavor), false)
        .await
        .unwrap();

    assert_eq!(lb.topology, Topology::ActiveStandby);
    assert_eq!(h.amphorae("lb-1").await.len(), 2);
}

#[tokio::test]
async fn test_invalid_flavor_topology_is_rejected_before_any_work() {
    let h = harness();
    h.seed_lb("lb-1", Topology::Single).await;
    let flavor = Flavor::default().with("loadbalancer_topology", "TRIPLE");

    let err = h
        .orchestrator
        .create_load_balancer("lb-1", Some(&flavor), false)
        .await
        .unwrap_err();

    assert!(matches!(err, OrchestrationError::InvalidTopology(_)));
    assert!(h.drivers.recorder.calls().is_empty());
}

#[tokio::test]
async fn test_vrrp_start_failure_isolates_one_amphora() {
    let h = harness();
    h.seed_lb("lb-1", Topology::ActiveStandby).await;
    h.drivers.recorder.inject(
        Fault::new("start_vrrp_service", AdapterError::Connection("reset".into())).times(1),
    );

    let lb = h
        .orchestrator
        .create_load_balancer("lb-1", None, false)
        .await
        .unwrap();

    assert_eq!(lb.provisioning_status, ProvisioningStatus::Active);
    let statuses: Vec<AmphoraStatus> = h.amphorae("lb-1").await.iter().map(|a| a.status).collect();
    assert_eq!(
        statuses.iter().filter(|s| **s == AmphoraStatus::Error).count(),
        1
    );
    assert_eq!(
        statuses.iter().filter(|s| **s == AmphoraStatus::Allocated).count(),
        1
    );
    // The sibling still got its VRRP service started.
    assert_eq!(h.drivers.recorder.count("start_vrrp_service"), 2);
}

#[tokio::test]
async fn test_vrrp_interface_failure_isolates_one_amphora() {
    let temp = TempDir::new().unwrap();
    let h = journaled_harness(temp.path());
    h.seed_lb("lb-1", Topology::ActiveStandby).await;
    h.drivers.recorder.inject(
        Fault::new("get_vrrp_interface", AdapterError::Connection("reset".into())).times(1),
    );

    let lb = h
        .orchestrator
        .create_load_balancer("lb-1", None, false)
        .await
        .unwrap();

    assert_eq!(lb.provisioning_status, ProvisioningStatus::Active);
    let amphorae = h.amphorae("lb-1").await;
    let failed: Vec<&Amphora> = amphorae
        .iter()
        .filter(|a| a.status == AmphoraStatus::Error)
        .collect();
    let healthy: Vec<&Amphora> = amphorae
        .iter()
        .filter(|a| a.status == AmphoraStatus::Allocated)
        .collect();
    assert_eq!((failed.len(), healthy.len()), (1, 1));

    let recorder = &h.drivers.recorder;
    assert_eq!(recorder.count("get_vrrp_interface"), 2);
    assert_eq!(recorder.count_for("update_vrrp_conf", &failed[0].id), 0);
    assert_eq!(recorder.count_for("update_vrrp_conf", &healthy[0].id), 1);
    assert_eq!(recorder.count_for("start_vrrp_service", &healthy[0].id), 1);
    assert_eq!(healthy[0].vrrp_interface.as_deref(), Some("eth1"));
    assert_eq!(only_execution_state(temp.path()).await, FlowState::Succeeded);
}

#[tokio::test]
async fn test_vrrp_config_failure_isolates_one_amphora() {
    let temp = TempDir::new().unwrap();
    let h = journaled_harness(temp.path());
    h.seed_lb("lb-1", Topology::ActiveStandby).await;
    h.drivers
        .recorder
        .inject(Fault::new("update_vrrp_conf", rejected("keepalived")).times(1));

    let lb = h
        .orchestrator
        .create_load_balancer("lb-1", None, false)
        .await
        .unwrap();

    assert_eq!(lb.provisioning_status, ProvisioningStatus::Active);
    let amphorae = h.amphorae("lb-1").await;
    let failed: Vec<&Amphora> = amphorae
        .iter()
        .filter(|a| a.status == AmphoraStatus::Error)
        .collect();
    let healthy: Vec<&Amphora> = amphorae
        .iter()
        .filter(|a| a.status == AmphoraStatus::Allocated)
        .collect();
    assert_eq!((failed.len(), healthy.len()), (1, 1));

    let recorder = &h.drivers.recorder;
    assert_eq!(recorder.count("update_vrrp_conf"), 2);
    assert_eq!(recorder.count_for("start_vrrp_service", &failed[0].id), 0);
    assert_eq!(recorder.count_for("start_vrrp_service", &healthy[0].id), 1);
    assert_eq!(only_execution_state(temp.path()).await, FlowState::Succeeded);
}

#[tokio::test]
async fn test_failed_create_rolls_back_and_surfaces_the_task_error() {
    let h = harness();
    h.seed_lb("lb-1", Topology::Single).await;
    h.drivers
        .recorder
        .inject(Fault::new("plug_aap_port", rejected("plug")));

    let err = h
        .orchestrator
        .create_load_balancer("lb-1", None, false)
        .await
        .unwrap_err();

    let OrchestrationError::Flow(flow_err) = &err else {
        panic!("expected a flow failure, got {:?}", err);
    };
    assert!(matches!(
        flow_err.task_error(),
        Some(TaskError::Adapter(AdapterError::Rejected(_)))
    ));

    let lb = h.repo.require::<LoadBalancer>("lb-1").await.unwrap();
    assert_eq!(lb.provisioning_status, ProvisioningStatus::Error);
    assert!(h.all_amphorae().await.is_empty());
    assert!(h.drivers.compute.live_instances().is_empty());
}

#[tokio::test]
async fn test_reverted_create_amphora_leaves_no_residue() {
    let h = harness();
    h.drivers.recorder.inject(Fault::new("finalize", rejected("finalize")));

    let err = h.orchestrator.create_amphora(None).await.unwrap_err();
    assert!(matches!(
        err,
        OrchestrationError::Flow(FlowError::TaskFailed { .. })
    ));
    assert!(h.all_amphorae().await.is_empty());
    assert!(h.drivers.compute.live_instances().is_empty());

    h.drivers.recorder.clear_faults();
    let amp = h.orchestrator.create_amphora(None).await.unwrap();

    assert_eq!(amp.status, AmphoraStatus::Allocated);
    assert_eq!(h.all_amphorae().await.len(), 1);
    assert_eq!(h.drivers.compute.live_instances().len(), 1);
}

#[tokio::test]
async fn test_spare_is_claimed_by_new_load_balancer() {
    let h = harness();
    let spare = h.orchestrator.create_amphora(None).await.unwrap();
    assert!(spare.is_spare());
    assert_eq!(spare.status, AmphoraStatus::Allocated);

    h.create_lb("lb-1", Topology::Single).await;

    let amphorae = h.amphorae("lb-1").await;
    assert_eq!(amphorae.len(), 1);
    assert_eq!(amphorae[0].id, spare.id);
    assert_eq!(amphorae[0].role, Some(AmphoraRole::Standalone));
    assert_eq!(h.drivers.recorder.count("provision"), 1);
}

#[tokio::test]
async fn test_failover_of_spare_builds_nothing() {
    let h = harness();
    let spare = h.orchestrator.create_amphora(None).await.unwrap();
    let provisioned = h.drivers.recorder.count("provision");

    let replacement = h.orchestrator.failover_amphora(&spare.id).await.unwrap();

    assert!(replacement.is_none());
    assert_eq!(h.drivers.recorder.count("provision"), provisioned);
    assert_eq!(h.amphora(&spare.id).await.status, AmphoraStatus::Allocated);
}

#[tokio::test]
async fn test_failover_standalone_amphora() {
    let h = harness();
    h.create_lb("lb-1", Topology::Single).await;
    let failed = h.amphorae("lb-1").await.remove(0);

    let replacement = h
        .orchestrator
        .failover_amphora(&failed.id)
        .await
        .unwrap()
        .expect("a replacement amphora");

    assert_ne!(replacement.id, failed.id);
    assert_eq!(replacement.role, Some(AmphoraRole::Standalone));
    assert_eq!(replacement.load_balancer_id.as_deref(), Some("lb-1"));
    assert_eq!(h.amphora(&failed.id).await.status, AmphoraStatus::Deleted);

    let live: Vec<String> = h.amphorae("lb-1").await.into_iter().map(|a| a.id).collect();
    assert_eq!(live, vec![replacement.id.clone()]);
    let lb = h.repo.require::<LoadBalancer>("lb-1").await.unwrap();
    assert_eq!(lb.provisioning_status, ProvisioningStatus::Active);
}

#[tokio::test]
async fn test_failed_network_plug_detaches_what_it_attached() {
    let drivers = NoopDrivers::new();
    let compute_id = boot_instance(&drivers, &["lb-mgmt-net"]).await;
    drivers
        .recorder
        .inject(Fault::new("attach_network_or_port", rejected("attach")).on("net-b"));
    let engine = FlowEngine::new(drivers.context(
        Arc::new(MemoryStore::new()),
        Arc::new(ControllerConfig::default()),
    ));

    let err = engine
        .run(&plug_flow(&compute_id, &["net-a", "net-b"], RetryPolicy::once()), Default::default())
        .await
        .unwrap_err();

    assert!(matches!(
        err.task_error(),
        Some(TaskError::Adapter(AdapterError::Rejected(_)))
    ));
    let interfaces = drivers.compute.list_interfaces(&compute_id).await.unwrap();
    assert_eq!(networks(&interfaces), vec!["lb-mgmt-net"]);
}

#[tokio::test]
async fn test_retried_network_plug_attaches_each_network_once() {
    let drivers = NoopDrivers::new();
    let compute_id = boot_instance(&drivers, &["lb-mgmt-net"]).await;
    drivers.recorder.inject(
        Fault::new("attach_network_or_port", AdapterError::Connection("reset".into()))
            .on("net-b")
            .times(1),
    );
    let engine = FlowEngine::new(drivers.context(
        Arc::new(MemoryStore::new()),
        Arc::new(ControllerConfig::default()),
    ));

    let execution = engine
        .run(
            &plug_flow(&compute_id, &["net-a", "net-b"], RetryPolicy::fixed(3, Duration::ZERO)),
            Default::default(),
        )
        .await
        .unwrap();

    assert_eq!(execution.executions, 2);
    let interfaces = drivers.compute.list_interfaces(&compute_id).await.unwrap();
    assert_eq!(networks(&interfaces), vec!["lb-mgmt-net", "net-a", "net-b"]);
    let added = execution.value::<AddedPorts>(ADDED_PORTS).unwrap();
    assert_eq!(added["amp-1"].len(), 2);
}

#[tokio::test]
async fn test_network_plug_keeps_networks_already_attached() {
    let drivers = NoopDrivers::new();
    let compute_id = boot_instance(&drivers, &["lb-mgmt-net", "net-a"]).await;
    let engine = FlowEngine::new(drivers.context(
        Arc::new(MemoryStore::new()),
        Arc::new(ControllerConfig::default()),
    ));

    let execution = engine
        .run(&plug_flow(&compute_id, &["net-a", "net-b"], RetryPolicy::once()), Default::default())
        .await
        .unwrap();

    assert_eq!(drivers.recorder.count_for("attach_network_or_port", "net-a"), 0);
    assert_eq!(drivers.recorder.count_for("attach_network_or_port", "net-b"), 1);
    let interfaces = drivers.compute.list_interfaces(&compute_id).await.unwrap();
    assert_eq!(networks(&interfaces), vec!["lb-mgmt-net", "net-a", "net-b"]);
    let added = execution.value::<AddedPorts>(ADDED_PORTS).unwrap();
    let plugged: Vec<&str> = added["amp-1"].iter().map(|p| p.network_id.as_str()).collect();
    assert_eq!(plugged, vec!["net-a", "net-b"]);
}

#[tokio::test]
async fn test_failover_with_failed_network_plug_leaves_no_ports_behind() {
    let (h, compute) = partial_boot_harness();
    h.create_lb("lb-1", Topology::Single).await;
    let failed = h.amphorae("lb-1").await.remove(0);
    h.drivers
        .recorder
        .inject(Fault::new("attach_network_or_port", rejected("attach")).on("net-b"));

    let err = h.orchestrator.failover_amphora(&failed.id).await.unwrap_err();

    assert!(matches!(err, OrchestrationError::Flow(FlowError::TaskFailed { .. })));
    // The replacement instance was only on its boot network when reverted.
    assert_eq!(compute.deleted(), vec![vec!["lb-mgmt-net".to_string()]]);
    assert_eq!(h.drivers.compute.live_instances(), vec![failed.compute_id.clone().unwrap()]);
    assert_eq!(h.amphorae("lb-1").await.len(), 1);
    assert_eq!(h.amphora(&failed.id).await.status, AmphoraStatus::Error);
    let lb = h.repo.require::<LoadBalancer>("lb-1").await.unwrap();
    assert_eq!(lb.provisioning_status, ProvisioningStatus::Error);
}

#[tokio::test]
async fn test_failover_survives_transient_network_plug_failure() {
    let (h, _compute) = partial_boot_harness();
    h.create_lb("lb-1", Topology::Single).await;
    let failed = h.amphorae("lb-1").await.remove(0);
    h.drivers.recorder.inject(
        Fault::new("attach_network_or_port", AdapterError::Connection("reset".into()))
            .on("net-b")
            .times(1),
    );

    let replacement = h
        .orchestrator
        .failover_amphora(&failed.id)
        .await
        .unwrap()
        .expect("a replacement amphora");

    let compute_id = replacement.compute_id.clone().unwrap();
    let plugged = networks(&h.drivers.compute.list_interfaces(&compute_id).await.unwrap());
    let distinct: BTreeSet<&String> = plugged.iter().collect();
    assert_eq!(distinct.len(), plugged.len(), "duplicate interfaces: {:?}", plugged);
    for network in ["lb-mgmt-net", "net-a", "net-b"] {
        assert!(plugged.iter().any(|n| n == network), "{} missing", network);
    }
    assert_eq!(h.drivers.recorder.count_for("attach_network_or_port", "net-b"), 2);
    // Once from the new amphora's own plug step, once by index after failover.
    assert_eq!(h.drivers.recorder.count_for("update_listeners", &replacement.id), 2);
    assert_eq!(h.amphora(&failed.id).await.status, AmphoraStatus::Deleted);
}

#[tokio::test]
async fn test_failover_active_standby_load_balancer() {
    let h = harness();
    h.create_lb("lb-1", Topology::ActiveStandby).await;
    let before: BTreeSet<String> = h.amphorae("lb-1").await.into_iter().map(|a| a.id).collect();

    let lb = h.orchestrator.failover_load_balancer("lb-1").await.unwrap();

    assert_eq!(lb.provisioning_status, ProvisioningStatus::Active);
    let after = h.amphorae("lb-1").await;
    assert_eq!(after.len(), 2);
    assert!(after.iter().all(|amp| !before.contains(&amp.id)));
    let roles: BTreeSet<&str> = after
        .iter()
        .filter_map(|amp| amp.role.as_ref().map(|r| r.as_str()))
        .collect();
    assert_eq!(roles, BTreeSet::from(["BACKUP", "MASTER"]));
    for id in &before {
        assert_eq!(h.amphora(id).await.status, AmphoraStatus::Deleted);
    }
}

#[tokio::test]
async fn test_unsupported_agent_config_update_is_tolerated() {
    let h = harness();
    h.create_lb("lb-1", Topology::Single).await;
    let amp = h.amphorae("lb-1").await.remove(0);
    h.drivers.recorder.inject(Fault::new(
        "update_agent_config",
        AdapterError::NotSupported("old image".into()),
    ));

    h.orchestrator
        .update_amphora_agent_config(&amp.id, None)
        .await
        .unwrap();

    assert_eq!(h.drivers.recorder.count_for("update_agent_config", &amp.id), 1);
    assert_eq!(h.amphora(&amp.id).await.status, amp.status);
}

#[tokio::test]
async fn test_update_load_balancer() {
    let h = harness();
    h.create_lb("lb-1", Topology::Single).await;

    let lb = h
        .orchestrator
        .update_load_balancer("lb-1", json!({ "name": "web" }))
        .await
        .unwrap();

    assert_eq!(lb.name.as_deref(), Some("web"));
    assert_eq!(lb.provisioning_status, ProvisioningStatus::Active);
}

#[tokio::test]
async fn test_delete_refuses_live_children_without_cascade() {
    let h = harness();
    h.seed_lb("lb-1", Topology::Single).await;
    h.repo.insert(&Listener::new("listener-1", "lb-1")).await.unwrap();
    h.repo.insert(&Pool::new("pool-1", "lb-1")).await.unwrap();
    h.orchestrator
        .create_load_balancer("lb-1", None, true)
        .await
        .unwrap();

    let err = h
        .orchestrator
        .delete_load_balancer("lb-1", false)
        .await
        .unwrap_err();
    match err {
        OrchestrationError::HasChildren {
            listeners, pools, ..
        } => {
            assert_eq!(listeners, 1);
            assert_eq!(pools, 1);
        }
        other => panic!("expected HasChildren, got {:?}", other),
    }

    h.orchestrator.delete_load_balancer("lb-1", true).await.unwrap();

    let lb = h.repo.require::<LoadBalancer>("lb-1").await.unwrap();
    assert_eq!(lb.provisioning_status, ProvisioningStatus::Deleted);
    let listener = h.repo.require::<Listener>("listener-1").await.unwrap();
    assert_eq!(listener.provisioning_status, ProvisioningStatus::Deleted);
    let pool = h.repo.require::<Pool>("pool-1").await.unwrap();
    assert_eq!(pool.provisioning_status, ProvisioningStatus::Deleted);
    assert!(h.amphorae("lb-1").await.is_empty());
    assert!(h.drivers.compute.live_instances().is_empty());
}

#[tokio::test]
async fn test_delete_amphora() {
    let h = harness();
    let amp = h.orchestrator.create_amphora(None).await.unwrap();

    h.orchestrator.delete_amphora(&amp.id).await.unwrap();

    assert_eq!(h.amphora(&amp.id).await.status, AmphoraStatus::Deleted);
    assert!(h.drivers.compute.live_instances().is_empty());
}

#[tokio::test]
async fn test_rotate_amphora_cert() {
    let h = harness();
    let amp = h.orchestrator.create_amphora(None).await.unwrap();
    let uploads = h.drivers.recorder.count("upload_cert");

    let rotated = h.orchestrator.rotate_amphora_cert(&amp.id).await.unwrap();

    assert_eq!(h.drivers.recorder.count("upload_cert"), uploads + 1);
    assert!(rotated.cert_expiration.is_some());
    assert!(!rotated.cert_busy);
}

#[tokio::test]
async fn test_unknown_entities() {
    let h = harness();

    assert!(matches!(
        h.orchestrator.failover_amphora("missing").await,
        Err(OrchestrationError::NotFound { .. })
    ));
    assert!(matches!(
        h.orchestrator.delete_load_balancer("missing", true).await,
        Err(OrchestrationError::NotFound { .. })
    ));
    assert!(matches!(
        h.orchestrator.create_amphora(Some("missing")).await,
        Err(OrchestrationError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_anti_affinity_server_group_is_recorded_and_released() {
    let mut config = ControllerConfig::default();
    config.controller_worker.enable_anti_affinity = true;
    let h = harness_with(config);

    let lb = h.create_lb("lb-1", Topology::ActiveStandby).await;
    let group = lb.server_group_id.clone().expect("a server group");
    assert_eq!(h.drivers.recorder.count("create_server_group"), 1);

    h.orchestrator.delete_load_balancer("lb-1", true).await.unwrap();
    assert_eq!(h.drivers.recorder.count_for("delete_server_group", &group), 1);
}
