//! In-memory drivers that record every call and hand back consistent fake
//! resources. Faults can be injected per operation and target to exercise
//! failure paths.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use super::{
    AdapterError, AgentClient, CertIssuer, ComputeAdapter, NetworkAdapter, PortRequest,
    ProvisionRequest,
};
use crate::config::ControllerConfig;
use crate::core::TaskContext;
use crate::domain::{
    AgentTimeouts, Amphora, AmphoraNetworkConfig, ComputeInstance, ComputeStatus, FixedIp,
    Interface, Listener, LoadBalancer, NetworkConfigs, Port, ServerCertificate, Subnet, Vip,
};
use crate::store::Repository;

const VIP_NETWORK: &str = "noop-vip-network";
const VIP_SUBNET: &str = "noop-vip-subnet";
const MGMT_SUBNET: &str = "noop-mgmt-subnet";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A recorded driver call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoopCall {
    pub driver: &'static str,
    pub op: String,
    pub target: String,
}

/// An injected failure: `op` fails with `error` for `target` (any target when
/// unset), `remaining` times (forever when unset).
#[derive(Debug, Clone)]
pub struct Fault {
    pub op: String,
    pub target: Option<String>,
    pub error: AdapterError,
    pub remaining: Option<u32>,
}

impl Fault {
    pub fn new(op: &str, error: AdapterError) -> Self {
        Self {
            op: op.to_string(),
            target: None,
            error,
            remaining: None,
        }
    }

    pub fn on(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn times(mut self, count: u32) -> Self {
        self.remaining = Some(count);
        self
    }
}

/// Call log and fault table shared by the noop drivers.
#[derive(Debug, Default)]
pub struct NoopRecorder {
    calls: Mutex<Vec<NoopCall>>,
    faults: Mutex<Vec<Fault>>,
}

impl NoopRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn inject(&self, fault: Fault) {
        lock(&self.faults).push(fault);
    }

    pub fn clear_faults(&self) {
        lock(&self.faults).clear();
    }

    pub fn calls(&self) -> Vec<NoopCall> {
        lock(&self.calls).clone()
    }

    pub fn count(&self, op: &str) -> usize {
        lock(&self.calls).iter().filter(|c| c.op == op).count()
    }

    pub fn count_for(&self, op: &str, target: &str) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| c.op == op && c.target == target)
            .count()
    }

    /// Record a call, then fail it if a matching fault is armed.
    fn record(&self, driver: &'static str, op: &str, target: &str) -> Result<(), AdapterError> {
        debug!(driver, op, target, "noop call");
        lock(&self.calls).push(NoopCall {
            driver,
            op: op.to_string(),
            target: target.to_string(),
        });

        let mut faults = lock(&self.faults);
        let armed = faults.iter_mut().find(|f| {
            f.op == op
                && f.target.as_deref().map_or(true, |t| t == target)
                && f.remaining != Some(0)
        });
        match armed {
            Some(fault) => {
                if let Some(remaining) = fault.remaining.as_mut() {
                    *remaining -= 1;
                }
                Err(fault.error.clone())
            }
            None => Ok(()),
        }
    }
}

#[derive(Debug, Default)]
struct ComputeState {
    instances: BTreeMap<String, ComputeInstance>,
    interfaces: BTreeMap<String, Vec<Interface>>,
    server_groups: BTreeSet<String>,
    next_host: u32,
}

#[derive(Debug)]
pub struct NoopCompute {
    recorder: Arc<NoopRecorder>,
    state: Mutex<ComputeState>,
}

impl NoopCompute {
    pub fn new(recorder: Arc<NoopRecorder>) -> Self {
        Self {
            recorder,
            state: Mutex::new(ComputeState::default()),
        }
    }

    pub fn live_instances(&self) -> Vec<String> {
        lock(&self.state).instances.keys().cloned().collect()
    }

    pub fn server_groups(&self) -> Vec<String> {
        lock(&self.state).server_groups.iter().cloned().collect()
    }
}

#[async_trait]
impl ComputeAdapter for NoopCompute {
    async fn provision(&self, request: &ProvisionRequest) -> Result<String, AdapterError> {
        self.recorder.record("compute", "provision", &request.amphora_id)?;

        let mut state = lock(&self.state);
        state.next_host += 1;
        let mgmt_ip = format!("192.0.2.{}", state.next_host % 250 + 2);
        let compute_id = Uuid::new_v4().to_string();

        let interfaces = request
            .network_ids
            .iter()
            .enumerate()
            .map(|(idx, network_id)| Interface {
                compute_id: compute_id.clone(),
                network_id: network_id.clone(),
                port_id: Uuid::new_v4().to_string(),
                fixed_ips: if idx == 0 {
                    vec![FixedIp {
                        subnet_id: MGMT_SUBNET.to_string(),
                        ip_address: mgmt_ip.clone(),
                    }]
                } else {
                    Vec::new()
                },
            })
            .collect();

        state.instances.insert(
            compute_id.clone(),
            ComputeInstance {
                id: compute_id.clone(),
                status: ComputeStatus::Active,
                lb_network_ip: Some(mgmt_ip),
                image_id: Some(request.image_tag.clone()),
                compute_flavor: Some(request.compute_flavor.clone()),
                server_group_id: request.server_group_id.clone(),
            },
        );
        state.interfaces.insert(compute_id.clone(), interfaces);
        Ok(compute_id)
    }

    async fn get_status(&self, compute_id: &str) -> Result<ComputeInstance, AdapterError> {
        self.recorder.record("compute", "get_status", compute_id)?;
        lock(&self.state)
            .instances
            .get(compute_id)
            .cloned()
            .ok_or_else(|| AdapterError::not_found("compute instance", compute_id))
    }

    /// Recorded against the network when one is named, the instance otherwise.
    async fn attach_network_or_port(
        &self,
        compute_id: &str,
        network_id: Option<&str>,
        port_id: Option<&str>,
        ip_address: Option<&str>,
    ) -> Result<Interface, AdapterError> {
        self.recorder.record(
            "compute",
            "attach_network_or_port",
            network_id.unwrap_or(compute_id),
        )?;

        let mut state = lock(&self.state);
        let interfaces = state
            .interfaces
            .get_mut(compute_id)
            .ok_or_else(|| AdapterError::not_found("compute instance", compute_id))?;
        let interface = Interface {
            compute_id: compute_id.to_string(),
            network_id: network_id.unwrap_or(VIP_NETWORK).to_string(),
            port_id: port_id
                .map(str::to_string)
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            fixed_ips: ip_address
                .map(|ip| {
                    vec![FixedIp {
                        subnet_id: VIP_SUBNET.to_string(),
                        ip_address: ip.to_string(),
                    }]
                })
                .unwrap_or_default(),
        };
        interfaces.push(interface.clone());
        Ok(interface)
    }

    async fn detach_port(&self, compute_id: &str, port_id: &str) -> Result<(), AdapterError> {
        self.recorder.record("compute", "detach_port", compute_id)?;
        if let Some(interfaces) = lock(&self.state).interfaces.get_mut(compute_id) {
            interfaces.retain(|i| i.port_id != port_id);
        }
        Ok(())
    }

    async fn delete(&self, compute_id: &str) -> Result<(), AdapterError> {
        self.recorder.record("compute", "delete", compute_id)?;
        let mut state = lock(&self.state);
        state.instances.remove(compute_id);
        state.interfaces.remove(compute_id);
        Ok(())
    }

    async fn list_interfaces(&self, compute_id: &str) -> Result<Vec<Interface>, AdapterError> {
        self.recorder.record("compute", "list_interfaces", compute_id)?;
        lock(&self.state)
            .interfaces
            .get(compute_id)
            .cloned()
            .ok_or_else(|| AdapterError::not_found("compute instance", compute_id))
    }

    async fn create_server_group(&self, name: &str, policy: &str) -> Result<String, AdapterError> {
        self.recorder.record("compute", "create_server_group", name)?;
        debug!(name, policy, "noop server group");
        let id = Uuid::new_v4().to_string();
        lock(&self.state).server_groups.insert(id.clone());
        Ok(id)
    }

    async fn delete_server_group(&self, server_group_id: &str) -> Result<(), AdapterError> {
        self.recorder
            .record("compute", "delete_server_group", server_group_id)?;
        lock(&self.state).server_groups.remove(server_group_id);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct NetworkState {
    ports: BTreeMap<String, Port>,
    next_address: u32,
}

impl NetworkState {
    fn new_port(&mut self, name: &str, network_id: &str, subnet_id: &str) -> Port {
        self.next_address += 1;
        let port = Port {
            id: Uuid::new_v4().to_string(),
            network_id: network_id.to_string(),
            name: Some(name.to_string()),
            mac_address: Some(format!("fa:16:3e:00:{:02x}:{:02x}", self.next_address / 256 % 256, self.next_address % 256)),
            fixed_ips: vec![FixedIp {
                subnet_id: subnet_id.to_string(),
                ip_address: format!("203.0.113.{}", self.next_address % 250 + 2),
            }],
            security_group_ids: Vec::new(),
        };
        self.ports.insert(port.id.clone(), port.clone());
        port
    }
}

fn noop_subnet(subnet_id: &str) -> Subnet {
    Subnet {
        id: subnet_id.to_string(),
        network_id: VIP_NETWORK.to_string(),
        cidr: "203.0.113.0/24".to_string(),
        gateway_ip: Some("203.0.113.1".to_string()),
    }
}

#[derive(Debug)]
pub struct NoopNetwork {
    recorder: Arc<NoopRecorder>,
    state: Mutex<NetworkState>,
}

impl NoopNetwork {
    pub fn new(recorder: Arc<NoopRecorder>) -> Self {
        Self {
            recorder,
            state: Mutex::new(NetworkState::default()),
        }
    }

    pub fn live_ports(&self) -> usize {
        lock(&self.state).ports.len()
    }
}

#[async_trait]
impl NetworkAdapter for NoopNetwork {
    async fn allocate_vip(&self, lb: &LoadBalancer) -> Result<Vip, AdapterError> {
        self.recorder.record("network", "allocate_vip", &lb.id)?;
        if let Some(vip) = lb.vip.as_ref().filter(|v| v.port_id.is_some()) {
            return Ok(vip.clone());
        }

        let mut state = lock(&self.state);
        let port = state.new_port(&format!("lb-{}", lb.id), VIP_NETWORK, VIP_SUBNET);
        Ok(Vip {
            ip_address: port.fixed_ips.first().map(|ip| ip.ip_address.clone()),
            port_id: Some(port.id),
            subnet_id: Some(VIP_SUBNET.to_string()),
            network_id: Some(VIP_NETWORK.to_string()),
            octavia_owned: true,
        })
    }

    async fn deallocate_vip(&self, vip: &Vip) -> Result<(), AdapterError> {
        let port_id = vip.port_id.clone().unwrap_or_default();
        self.recorder.record("network", "deallocate_vip", &port_id)?;
        lock(&self.state).ports.remove(&port_id);
        Ok(())
    }

    async fn update_vip_sg(
        &self,
        lb: &LoadBalancer,
        _vip: &Vip,
    ) -> Result<Option<String>, AdapterError> {
        self.recorder.record("network", "update_vip_sg", &lb.id)?;
        Ok(Some(format!("lb-sg-{}", lb.id)))
    }

    async fn get_security_group_id(&self, lb_id: &str) -> Result<Option<String>, AdapterError> {
        self.recorder
            .record("network", "get_security_group_id", lb_id)?;
        Ok(Some(format!("lb-sg-{}", lb_id)))
    }

    async fn plug_aap_port(
        &self,
        _lb: &LoadBalancer,
        vip: &Vip,
        amphora: &Amphora,
        subnet: &Subnet,
    ) -> Result<Amphora, AdapterError> {
        self.recorder.record("network", "plug_aap_port", &amphora.id)?;
        let mut state = lock(&self.state);
        let port = state.new_port(
            &format!("octavia-lb-vrrp-{}", amphora.id),
            &subnet.network_id,
            &subnet.id,
        );

        let mut plugged = amphora.clone();
        plugged.vrrp_ip = port.fixed_ips.first().map(|ip| ip.ip_address.clone());
        plugged.vrrp_port_id = Some(port.id);
        plugged.ha_ip = vip.ip_address.clone();
        plugged.ha_port_id = vip.port_id.clone();
        Ok(plugged)
    }

    async fn unplug_aap_port(&self, _vip: &Vip, amphora: &Amphora) -> Result<(), AdapterError> {
        self.recorder
            .record("network", "unplug_aap_port", &amphora.id)?;
        if let Some(port_id) = amphora.vrrp_port_id.as_deref() {
            lock(&self.state).ports.remove(port_id);
        }
        Ok(())
    }

    async fn get_network_configs(
        &self,
        lb: &LoadBalancer,
        amphorae: &[Amphora],
    ) -> Result<NetworkConfigs, AdapterError> {
        self.recorder
            .record("network", "get_network_configs", &lb.id)?;
        let state = lock(&self.state);
        let vip_subnet = lb
            .vip
            .as_ref()
            .and_then(|v| v.subnet_id.as_deref())
            .map(noop_subnet);
        let vip_port = lb
            .vip
            .as_ref()
            .and_then(|v| v.port_id.as_deref())
            .and_then(|id| state.ports.get(id).cloned());

        Ok(amphorae
            .iter()
            .map(|amp| {
                let vrrp_port = amp
                    .vrrp_port_id
                    .as_deref()
                    .and_then(|id| state.ports.get(id).cloned());
                let config = AmphoraNetworkConfig {
                    amphora_id: amp.id.clone(),
                    vip_subnet: vip_subnet.clone(),
                    vip_port: vip_port.clone(),
                    vrrp_subnet: vip_subnet.clone(),
                    vrrp_port,
                    ha_subnet: vip_subnet.clone(),
                    ha_port: vip_port.clone(),
                };
                (amp.id.clone(), config)
            })
            .collect())
    }

    async fn get_amphora_ports(&self, amphora: &Amphora) -> Result<Vec<Port>, AdapterError> {
        self.recorder
            .record("network", "get_amphora_ports", &amphora.id)?;
        Ok(Vec::new())
    }

    async fn create_port(&self, request: &PortRequest) -> Result<Port, AdapterError> {
        self.recorder.record("network", "create_port", &request.name)?;
        let mut state = lock(&self.state);
        let subnet_id = request.subnet_id.as_deref().unwrap_or(VIP_SUBNET);
        let mut port = state.new_port(&request.name, &request.network_id, subnet_id);
        port.security_group_ids = request.security_group_ids.clone();
        state.ports.insert(port.id.clone(), port.clone());
        Ok(port)
    }

    async fn delete_port(&self, port_id: &str) -> Result<(), AdapterError> {
        self.recorder.record("network", "delete_port", port_id)?;
        lock(&self.state).ports.remove(port_id);
        Ok(())
    }

    async fn get_subnet(&self, subnet_id: &str) -> Result<Subnet, AdapterError> {
        self.recorder.record("network", "get_subnet", subnet_id)?;
        Ok(noop_subnet(subnet_id))
    }
}

#[derive(Debug)]
pub struct NoopAgent {
    recorder: Arc<NoopRecorder>,
}

impl NoopAgent {
    pub fn new(recorder: Arc<NoopRecorder>) -> Self {
        Self { recorder }
    }
}

#[async_trait]
impl AgentClient for NoopAgent {
    async fn get_info(
        &self,
        amphora: &Amphora,
        _timeouts: &AgentTimeouts,
    ) -> Result<Value, AdapterError> {
        self.recorder.record("agent", "get_info", &amphora.id)?;
        Ok(json!({"hostname": amphora.id, "api_version": "1.0"}))
    }

    async fn update_listeners(
        &self,
        _lb: &LoadBalancer,
        _listeners: &[Listener],
        amphora: &Amphora,
        _timeouts: &AgentTimeouts,
    ) -> Result<(), AdapterError> {
        self.recorder.record("agent", "update_listeners", &amphora.id)
    }

    async fn reload(
        &self,
        _lb: &LoadBalancer,
        amphora: &Amphora,
        _timeouts: &AgentTimeouts,
    ) -> Result<(), AdapterError> {
        self.recorder.record("agent", "reload", &amphora.id)
    }

    async fn start(
        &self,
        _lb: &LoadBalancer,
        amphora: &Amphora,
        _timeouts: &AgentTimeouts,
    ) -> Result<(), AdapterError> {
        self.recorder.record("agent", "start", &amphora.id)
    }

    async fn delete_listener(
        &self,
        amphora: &Amphora,
        _listener: &Listener,
    ) -> Result<(), AdapterError> {
        self.recorder.record("agent", "delete_listener", &amphora.id)
    }

    async fn upload_cert(&self, amphora: &Amphora, _pem: &str) -> Result<(), AdapterError> {
        self.recorder.record("agent", "upload_cert", &amphora.id)
    }

    async fn update_agent_config(
        &self,
        amphora: &Amphora,
        _rendered: &str,
    ) -> Result<(), AdapterError> {
        self.recorder
            .record("agent", "update_agent_config", &amphora.id)
    }

    async fn get_vrrp_interface(
        &self,
        amphora: &Amphora,
        _timeouts: &AgentTimeouts,
    ) -> Result<String, AdapterError> {
        self.recorder
            .record("agent", "get_vrrp_interface", &amphora.id)?;
        Ok("eth1".to_string())
    }

    async fn update_vrrp_conf(
        &self,
        _lb: &LoadBalancer,
        _network_configs: &NetworkConfigs,
        amphora: &Amphora,
        _timeouts: &AgentTimeouts,
    ) -> Result<(), AdapterError> {
        self.recorder.record("agent", "update_vrrp_conf", &amphora.id)
    }

    async fn start_vrrp_service(
        &self,
        amphora: &Amphora,
        _timeouts: &AgentTimeouts,
    ) -> Result<(), AdapterError> {
        self.recorder
            .record("agent", "start_vrrp_service", &amphora.id)
    }

    async fn finalize(&self, amphora: &Amphora) -> Result<(), AdapterError> {
        self.recorder.record("agent", "finalize", &amphora.id)
    }

    async fn post_network_plug(&self, amphora: &Amphora, _port: &Port) -> Result<(), AdapterError> {
        self.recorder
            .record("agent", "post_network_plug", &amphora.id)
    }

    async fn post_vip_plug(
        &self,
        amphora: &Amphora,
        _lb: &LoadBalancer,
        _network_config: &AmphoraNetworkConfig,
    ) -> Result<(), AdapterError> {
        self.recorder.record("agent", "post_vip_plug", &amphora.id)
    }
}

/// Self-contained certificate issuer. Produces PEM-shaped placeholders with
/// real expiry and fingerprint bookkeeping.
#[derive(Debug)]
pub struct NoopCertIssuer {
    recorder: Arc<NoopRecorder>,
}

impl NoopCertIssuer {
    pub fn new(recorder: Arc<NoopRecorder>) -> Self {
        Self { recorder }
    }
}

#[async_trait]
impl CertIssuer for NoopCertIssuer {
    async fn generate(
        &self,
        common_name: &str,
        validity_days: u32,
    ) -> Result<ServerCertificate, AdapterError> {
        self.recorder.record("certs", "generate", common_name)?;

        let serial = Uuid::new_v4();
        let body = hex::encode(Sha256::digest(format!("{}:{}", common_name, serial).as_bytes()));
        let pem = format!(
            "-----BEGIN CERTIFICATE-----\n{}\n-----END CERTIFICATE-----\n",
            body
        );
        let fingerprint = hex::encode(Sha256::digest(pem.as_bytes()));

        Ok(ServerCertificate {
            pem,
            fingerprint,
            expires_at: Utc::now() + ChronoDuration::days(i64::from(validity_days)),
        })
    }
}

/// One recorder wired into a full set of noop drivers.
#[derive(Debug, Clone)]
pub struct NoopDrivers {
    pub recorder: Arc<NoopRecorder>,
    pub compute: Arc<NoopCompute>,
    pub network: Arc<NoopNetwork>,
    pub agent: Arc<NoopAgent>,
    pub certs: Arc<NoopCertIssuer>,
}

impl NoopDrivers {
    pub fn new() -> Self {
        let recorder = NoopRecorder::new();
        Self {
            compute: Arc::new(NoopCompute::new(recorder.clone())),
            network: Arc::new(NoopNetwork::new(recorder.clone())),
            agent: Arc::new(NoopAgent::new(recorder.clone())),
            certs: Arc::new(NoopCertIssuer::new(recorder.clone())),
            recorder,
        }
    }
}

impl NoopDrivers {
    /// A task context running on these drivers.
    pub fn context(&self, repo: Arc<dyn Repository>, config: Arc<ControllerConfig>) -> TaskContext {
        TaskContext {
            compute: self.compute.clone(),
            network: self.network.clone(),
            agent: self.agent.clone(),
            certs: self.certs.clone(),
            repo,
            config,
        }
    }
}

impl Default for NoopDrivers {
    fn default() -> Self {
        Self::new()
    }
}
