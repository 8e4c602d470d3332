//! Remote resources reported by the compute, network and certificate
//! collaborators. These are passed between tasks but never persisted.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComputeStatus {
    Building,
    Active,
    Error,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeInstance {
    pub id: String,
    pub status: ComputeStatus,
    pub lb_network_ip: Option<String>,
    pub image_id: Option<String>,
    pub compute_flavor: Option<String>,
    pub server_group_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedIp {
    pub subnet_id: String,
    pub ip_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub id: String,
    pub network_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub mac_address: Option<String>,
    #[serde(default)]
    pub fixed_ips: Vec<FixedIp>,
    #[serde(default)]
    pub security_group_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    pub id: String,
    pub network_id: String,
    pub cidr: String,
    #[serde(default)]
    pub gateway_ip: Option<String>,
}

/// A network attachment on a compute instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub compute_id: String,
    pub network_id: String,
    pub port_id: String,
    #[serde(default)]
    pub fixed_ips: Vec<FixedIp>,
}

impl Interface {
    pub fn as_port(&self) -> Port {
        Port {
            id: self.port_id.clone(),
            network_id: self.network_id.clone(),
            name: None,
            mac_address: None,
            fixed_ips: self.fixed_ips.clone(),
            security_group_ids: Vec::new(),
        }
    }
}

/// Network view of one amphora as its agent needs it for VIP and VRRP setup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmphoraNetworkConfig {
    pub amphora_id: String,
    pub vip_subnet: Option<Subnet>,
    pub vip_port: Option<Port>,
    pub vrrp_subnet: Option<Subnet>,
    pub vrrp_port: Option<Port>,
    pub ha_subnet: Option<Subnet>,
    pub ha_port: Option<Port>,
}

/// Keyed by amphora id.
pub type NetworkConfigs = BTreeMap<String, AmphoraNetworkConfig>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nic {
    pub network_id: String,
    #[serde(default)]
    pub port_id: Option<String>,
}

/// Networks to plug into and unplug from one amphora.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDelta {
    pub amphora_id: String,
    pub compute_id: String,
    pub add_nics: Vec<Nic>,
    pub delete_nics: Vec<Nic>,
}

impl NetworkDelta {
    pub fn is_empty(&self) -> bool {
        self.add_nics.is_empty() && self.delete_nics.is_empty()
    }
}

/// Ports added per amphora id by a network delta.
pub type AddedPorts = BTreeMap<String, Vec<Port>>;

/// Server certificate issued for an amphora agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerCertificate {
    pub pem: String,
    pub fingerprint: String,
    pub expires_at: DateTime<Utc>,
}

/// Connection retry budget for talking to an amphora agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentTimeouts {
    pub max_retries: u32,
    pub retry_interval_secs: u64,
}

impl AgentTimeouts {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }
}
