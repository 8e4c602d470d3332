//! Names of the values that flow between tasks, plus a few fixed numbers.
//!
//! Every task declares its inputs and outputs with these names, so two tasks
//! are wired together when one provides a name the other requires.

pub const LOADBALANCER_ID: &str = "loadbalancer_id";
pub const LOADBALANCER: &str = "loadbalancer";
pub const AMPHORA: &str = "amphora";
pub const AMPHORA_ID: &str = "amphora_id";
pub const AMPHORAE: &str = "amphorae";
pub const COMPUTE_ID: &str = "compute_id";
pub const COMPUTE_OBJ: &str = "compute_obj";
pub const SERVER_PEM: &str = "server_pem";
pub const VIP: &str = "vip";
pub const VIP_SG_ID: &str = "vip_sg_id";
pub const SUBNET: &str = "subnet";
pub const ADDED_PORTS: &str = "added_ports";
pub const AMPHORAE_NETWORK_CONFIG: &str = "amphorae_network_config";
pub const AMPHORA_NETWORK_CONFIG: &str = "amphora_network_config";
pub const BASE_PORT: &str = "base_port";
pub const DELTA: &str = "delta";
pub const AMP_DATA: &str = "amp_data";
pub const BUILD_TYPE_PRIORITY: &str = "build_type_priority";
pub const FLAVOR: &str = "flavor";
pub const AMP_VRRP_INT: &str = "amp_vrrp_int";
pub const LISTENERS: &str = "listeners";
pub const UPDATE_DICT: &str = "update_dict";
pub const SERVER_GROUP_ID: &str = "server_group_id";
pub const FIRST_AMP_NETWORK_CONFIGS: &str = "first_amp_network_configs";
pub const FIRST_AMP_VRRP_INTERFACE: &str = "first_amp_vrrp_interface";
pub const TIMEOUT_DICT: &str = "timeout_dict";

/// Injected-only argument names (never provided by another task).
pub const ROLE: &str = "role";
pub const LISTENER: &str = "listener";
pub const POOL: &str = "pool";

/// Flavor metadata key that overrides the configured topology.
pub const LOADBALANCER_TOPOLOGY: &str = "loadbalancer_topology";
/// Flavor metadata key that overrides the compute flavor.
pub const COMPUTE_FLAVOR: &str = "compute_flavor";

pub const ACTIVE_STANDBY_AMPHORA_COUNT: usize = 2;

pub const ROLE_MASTER_PRIORITY: u32 = 100;
pub const ROLE_BACKUP_PRIORITY: u32 = 90;

/// Build priorities handed to compute provisioning.
pub const LB_CREATE_FAILOVER_PRIORITY: u32 = 20;
pub const LB_CREATE_NORMAL_PRIORITY: u32 = 40;
pub const LB_CREATE_SPARES_POOL_PRIORITY: u32 = 60;
