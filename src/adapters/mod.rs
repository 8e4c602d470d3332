//! Collaborator interfaces: compute, networking, amphora agent, certificates.
//!
//! Tasks only talk to the outside world through these traits. The `noop`
//! drivers implement all of them in memory; `rest_agent` is the HTTP agent
//! client.

pub mod agent_config;
pub mod noop;
pub mod rest_agent;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::domain::{
    AgentTimeouts, Amphora, AmphoraNetworkConfig, ComputeInstance, Interface, Listener,
    LoadBalancer, NetworkConfigs, Port, ServerCertificate, Subnet, Vip,
};

pub use noop::{
    Fault, NoopAgent, NoopCall, NoopCertIssuer, NoopCompute, NoopDrivers, NoopNetwork, NoopRecorder,
};
pub use rest_agent::RestAgentClient;

/// Failure reported by a collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    #[error("timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: String, id: String },

    /// The remote side does not implement the operation (e.g. an older
    /// amphora image).
    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("invalid target: {0}")]
    InvalidTarget(String),
}

impl AdapterError {
    pub fn not_found(kind: &str, id: &str) -> Self {
        Self::NotFound {
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }

    /// Worth retrying: the remote side may answer next time.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Connection(_))
    }
}

/// Everything compute needs to boot an amphora.
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionRequest {
    pub name: String,
    pub amphora_id: String,
    pub image_tag: String,
    pub compute_flavor: String,
    pub network_ids: Vec<String>,
    pub server_group_id: Option<String>,
    pub build_priority: u32,
    /// Files handed to the instance at boot (path -> contents).
    pub config_drive_files: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PortRequest {
    pub name: String,
    pub network_id: String,
    pub subnet_id: Option<String>,
    pub security_group_ids: Vec<String>,
}

#[async_trait]
pub trait ComputeAdapter: Send + Sync {
    /// Boot an instance, returning its compute id.
    async fn provision(&self, request: &ProvisionRequest) -> Result<String, AdapterError>;

    async fn get_status(&self, compute_id: &str) -> Result<ComputeInstance, AdapterError>;

    async fn attach_network_or_port(
        &self,
        compute_id: &str,
        network_id: Option<&str>,
        port_id: Option<&str>,
        ip_address: Option<&str>,
    ) -> Result<Interface, AdapterError>;

    async fn detach_port(&self, compute_id: &str, port_id: &str) -> Result<(), AdapterError>;

    /// Deleting an instance that is already gone succeeds.
    async fn delete(&self, compute_id: &str) -> Result<(), AdapterError>;

    async fn list_interfaces(&self, compute_id: &str) -> Result<Vec<Interface>, AdapterError>;

    async fn create_server_group(&self, name: &str, policy: &str) -> Result<String, AdapterError>;

    async fn delete_server_group(&self, server_group_id: &str) -> Result<(), AdapterError>;
}

#[async_trait]
pub trait NetworkAdapter: Send + Sync {
    /// Allocate (or adopt the already allocated) VIP of a load balancer.
    async fn allocate_vip(&self, lb: &LoadBalancer) -> Result<Vip, AdapterError>;

    async fn deallocate_vip(&self, vip: &Vip) -> Result<(), AdapterError>;

    /// Ensure the VIP security group matches the listeners; returns its id.
    async fn update_vip_sg(&self, lb: &LoadBalancer, vip: &Vip)
        -> Result<Option<String>, AdapterError>;

    async fn get_security_group_id(&self, lb_id: &str) -> Result<Option<String>, AdapterError>;

    /// Plug the allowed-address-pairs port for `vip` into an amphora.
    /// Returns the amphora with its VRRP/HA addresses filled in.
    async fn plug_aap_port(
        &self,
        lb: &LoadBalancer,
        vip: &Vip,
        amphora: &Amphora,
        subnet: &Subnet,
    ) -> Result<Amphora, AdapterError>;

    async fn unplug_aap_port(&self, vip: &Vip, amphora: &Amphora) -> Result<(), AdapterError>;

    async fn get_network_configs(
        &self,
        lb: &LoadBalancer,
        amphorae: &[Amphora],
    ) -> Result<NetworkConfigs, AdapterError>;

    /// Ports still attached to an amphora's compute instance.
    async fn get_amphora_ports(&self, amphora: &Amphora) -> Result<Vec<Port>, AdapterError>;

    async fn create_port(&self, request: &PortRequest) -> Result<Port, AdapterError>;

    async fn delete_port(&self, port_id: &str) -> Result<(), AdapterError>;

    async fn get_subnet(&self, subnet_id: &str) -> Result<Subnet, AdapterError>;
}

/// Client for the agent running inside each amphora.
#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn get_info(&self, amphora: &Amphora, timeouts: &AgentTimeouts)
        -> Result<Value, AdapterError>;

    async fn update_listeners(
        &self,
        lb: &LoadBalancer,
        listeners: &[Listener],
        amphora: &Amphora,
        timeouts: &AgentTimeouts,
    ) -> Result<(), AdapterError>;

    async fn reload(
        &self,
        lb: &LoadBalancer,
        amphora: &Amphora,
        timeouts: &AgentTimeouts,
    ) -> Result<(), AdapterError>;

    async fn start(
        &self,
        lb: &LoadBalancer,
        amphora: &Amphora,
        timeouts: &AgentTimeouts,
    ) -> Result<(), AdapterError>;

    async fn delete_listener(&self, amphora: &Amphora, listener: &Listener)
        -> Result<(), AdapterError>;

    async fn upload_cert(&self, amphora: &Amphora, pem: &str) -> Result<(), AdapterError>;

    /// Fails with `NotSupported` on agents too old to accept config updates.
    async fn update_agent_config(&self, amphora: &Amphora, rendered: &str)
        -> Result<(), AdapterError>;

    async fn get_vrrp_interface(
        &self,
        amphora: &Amphora,
        timeouts: &AgentTimeouts,
    ) -> Result<String, AdapterError>;

    async fn update_vrrp_conf(
        &self,
        lb: &LoadBalancer,
        network_configs: &NetworkConfigs,
        amphora: &Amphora,
        timeouts: &AgentTimeouts,
    ) -> Result<(), AdapterError>;

    async fn start_vrrp_service(&self, amphora: &Amphora, timeouts: &AgentTimeouts)
        -> Result<(), AdapterError>;

    async fn finalize(&self, amphora: &Amphora) -> Result<(), AdapterError>;

    async fn post_network_plug(&self, amphora: &Amphora, port: &Port) -> Result<(), AdapterError>;

    async fn post_vip_plug(
        &self,
        amphora: &Amphora,
        lb: &LoadBalancer,
        network_config: &AmphoraNetworkConfig,
    ) -> Result<(), AdapterError>;
}

/// Issues server certificates for amphora agents.
#[async_trait]
pub trait CertIssuer: Send + Sync {
    async fn generate(&self, common_name: &str, validity_days: u32)
        -> Result<ServerCertificate, AdapterError>;
}
