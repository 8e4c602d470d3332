//! Persisted entities: load balancers, amphorae, listeners and pools.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::constants::{COMPUTE_FLAVOR, LOADBALANCER_TOPOLOGY};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid load balancer topology: {0}")]
pub struct InvalidTopology(pub String);

/// Load balancer topology. Determines how many amphorae back a load balancer
/// and whether VRRP is configured between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Topology {
    #[serde(rename = "SINGLE")]
    Single,
    #[serde(rename = "ACTIVE_STANDBY")]
    ActiveStandby,
}

impl Topology {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Single => "SINGLE",
            Self::ActiveStandby => "ACTIVE_STANDBY",
        }
    }

    pub fn amphora_count(&self) -> usize {
        match self {
            Self::Single => 1,
            Self::ActiveStandby => 2,
        }
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::Single
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topology {
    type Err = InvalidTopology;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "SINGLE" => Ok(Self::Single),
            "ACTIVE_STANDBY" => Ok(Self::ActiveStandby),
            _ => Err(InvalidTopology(s.to_string())),
        }
    }
}

/// Role of an amphora within its load balancer.
///
/// Unknown strings are kept verbatim in `Other` so that legacy or corrupt rows
/// still load; flow selection treats them as unrecognized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AmphoraRole {
    Master,
    Backup,
    Standalone,
    Other(String),
}

impl AmphoraRole {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Master => "MASTER",
            Self::Backup => "BACKUP",
            Self::Standalone => "STANDALONE",
            Self::Other(s) => s,
        }
    }

    pub fn is_recognized(&self) -> bool {
        !matches!(self, Self::Other(_))
    }
}

impl From<String> for AmphoraRole {
    fn from(s: String) -> Self {
        match s.as_str() {
            "MASTER" => Self::Master,
            "BACKUP" => Self::Backup,
            "STANDALONE" => Self::Standalone,
            _ => Self::Other(s),
        }
    }
}

impl From<AmphoraRole> for String {
    fn from(role: AmphoraRole) -> Self {
        role.as_str().to_string()
    }
}

impl fmt::Display for AmphoraRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AmphoraStatus {
    PendingCreate,
    Booting,
    Allocated,
    PendingDelete,
    Deleted,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProvisioningStatus {
    PendingCreate,
    PendingUpdate,
    PendingDelete,
    Active,
    Deleted,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperatingStatus {
    Online,
    Offline,
    Degraded,
    Error,
    NoMonitor,
}

/// Virtual IP of a load balancer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vip {
    pub ip_address: Option<String>,
    pub port_id: Option<String>,
    pub subnet_id: Option<String>,
    pub network_id: Option<String>,
    /// Whether the orchestrator allocated the VIP port (and must release it).
    #[serde(default)]
    pub octavia_owned: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancer {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub topology: Topology,
    pub provisioning_status: ProvisioningStatus,
    pub operating_status: OperatingStatus,
    #[serde(default)]
    pub vip: Option<Vip>,
    #[serde(default)]
    pub listener_ids: Vec<String>,
    #[serde(default)]
    pub pool_ids: Vec<String>,
    #[serde(default)]
    pub server_group_id: Option<String>,
    #[serde(default)]
    pub vrrp_group: Option<String>,
}

impl LoadBalancer {
    /// A freshly requested load balancer, as the API layer would persist it.
    pub fn new(id: impl Into<String>, topology: Topology) -> Self {
        Self {
            id: id.into(),
            name: None,
            description: None,
            topology,
            provisioning_status: ProvisioningStatus::PendingCreate,
            operating_status: OperatingStatus::Offline,
            vip: None,
            listener_ids: Vec::new(),
            pool_ids: Vec::new(),
            server_group_id: None,
            vrrp_group: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Amphora {
    pub id: String,
    #[serde(default)]
    pub compute_id: Option<String>,
    pub status: AmphoraStatus,
    #[serde(default)]
    pub role: Option<AmphoraRole>,
    #[serde(default)]
    pub load_balancer_id: Option<String>,
    #[serde(default)]
    pub lb_network_ip: Option<String>,
    #[serde(default)]
    pub vrrp_ip: Option<String>,
    #[serde(default)]
    pub ha_ip: Option<String>,
    #[serde(default)]
    pub vrrp_port_id: Option<String>,
    #[serde(default)]
    pub ha_port_id: Option<String>,
    #[serde(default)]
    pub vrrp_interface: Option<String>,
    #[serde(default)]
    pub vrrp_priority: Option<u32>,
    #[serde(default)]
    pub vrrp_id: Option<u32>,
    #[serde(default)]
    pub compute_flavor: Option<String>,
    #[serde(default)]
    pub image_id: Option<String>,
    #[serde(default)]
    pub cert_expiration: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cert_busy: bool,
    pub created_at: DateTime<Utc>,
}

impl Amphora {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            compute_id: None,
            status: AmphoraStatus::PendingCreate,
            role: None,
            load_balancer_id: None,
            lb_network_ip: None,
            vrrp_ip: None,
            ha_ip: None,
            vrrp_port_id: None,
            ha_port_id: None,
            vrrp_interface: None,
            vrrp_priority: None,
            vrrp_id: None,
            compute_flavor: None,
            image_id: None,
            cert_expiration: None,
            cert_busy: false,
            created_at: Utc::now(),
        }
    }

    /// Unassigned and usable: a member of the spare pool.
    pub fn is_spare(&self) -> bool {
        self.load_balancer_id.is_none() && self.status == AmphoraStatus::Allocated
    }

    pub fn is_deleted(&self) -> bool {
        self.status == AmphoraStatus::Deleted
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listener {
    pub id: String,
    pub load_balancer_id: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default = "default_protocol_port")]
    pub protocol_port: u16,
    pub provisioning_status: ProvisioningStatus,
    pub operating_status: OperatingStatus,
}

fn default_protocol() -> String {
    "HTTP".to_string()
}
fn default_protocol_port() -> u16 {
    80
}

impl Listener {
    pub fn new(id: impl Into<String>, load_balancer_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            load_balancer_id: load_balancer_id.into(),
            protocol: default_protocol(),
            protocol_port: default_protocol_port(),
            provisioning_status: ProvisioningStatus::PendingCreate,
            operating_status: OperatingStatus::Offline,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pool {
    pub id: String,
    pub load_balancer_id: String,
    #[serde(default)]
    pub listener_id: Option<String>,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub provisioning_status: ProvisioningStatus,
}

impl Pool {
    pub fn new(id: impl Into<String>, load_balancer_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            load_balancer_id: load_balancer_id.into(),
            listener_id: None,
            protocol: default_protocol(),
            provisioning_status: ProvisioningStatus::PendingCreate,
        }
    }
}

/// Flavor metadata attached to a load balancer request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Flavor(pub BTreeMap<String, Value>);

impl Flavor {
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    /// Topology override, if the flavor carries one.
    pub fn topology(&self) -> Result<Option<Topology>, InvalidTopology> {
        match self.0.get(LOADBALANCER_TOPOLOGY) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => s.parse().map(Some),
            Some(other) => Err(InvalidTopology(other.to_string())),
        }
    }

    pub fn compute_flavor(&self) -> Option<&str> {
        self.0.get(COMPUTE_FLAVOR).and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_serialization_keeps_unknown_values() {
        let role: AmphoraRole = serde_json::from_str("\"BOGUS\"").unwrap();
        assert_eq!(role, AmphoraRole::Other("BOGUS".to_string()));
        assert!(!role.is_recognized());
        assert_eq!(serde_json::to_string(&AmphoraRole::Master).unwrap(), "\"MASTER\"");
    }

    #[test]
    fn test_topology_parsing() {
        assert_eq!("SINGLE".parse::<Topology>().unwrap(), Topology::Single);
        assert_eq!(
            "active-standby".parse::<Topology>().unwrap(),
            Topology::ActiveStandby
        );
        assert_eq!(
            "BOGUS_TOPOLOGY".parse::<Topology>(),
            Err(InvalidTopology("BOGUS_TOPOLOGY".to_string()))
        );
    }

    #[test]
    fn test_flavor_topology_override() {
        let flavor = Flavor::default().with(LOADBALANCER_TOPOLOGY, "ACTIVE_STANDBY");
        assert_eq!(flavor.topology().unwrap(), Some(Topology::ActiveStandby));
        assert_eq!(Flavor::default().topology().unwrap(), None);

        let bad = Flavor::default().with(LOADBALANCER_TOPOLOGY, 7);
        assert!(bad.topology().is_err());
    }

    #[test]
    fn test_spare_detection() {
        let mut amp = Amphora::new("amp-1");
        assert!(!amp.is_spare());
        amp.status = AmphoraStatus::Allocated;
        assert!(amp.is_spare());
        amp.load_balancer_id = Some("lb-1".to_string());
        assert!(!amp.is_spare());
    }
}
