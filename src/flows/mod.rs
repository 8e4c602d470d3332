//! Flow builders for amphora and load balancer lifecycle operations.
//!
//! Builders are pure: they read configuration and the entities handed to
//! them, and return a `Flow` for the engine to run. Nothing is executed or
//! persisted while building.

pub mod amphora;
pub mod load_balancer;

use crate::core::{Task, TaskNode};
use crate::domain::AgentTimeouts;
use crate::domain::constants::TIMEOUT_DICT;

pub use amphora::{assign_failover_roles, AmphoraFlows};
pub use load_balancer::LoadBalancerFlows;

pub const CREATE_AMPHORA_FLOW: &str = "create-amphora-flow";
pub const CREATE_AMP_FOR_LB_SUBFLOW: &str = "create-amp-for-lb-subflow";
pub const CREATE_AMPHORA_SUBFLOW: &str = "create-amphora-subflow";
pub const POST_MAP_AMP_TO_LB_SUBFLOW: &str = "post-map-amp-to-lb-subflow";
pub const AMP_VRRP_SUBFLOW: &str = "amp-vrrp-subflow";
pub const FAILOVER_LB_AMP_SUBFLOW: &str = "amp-for-lb-failover-subflow";
pub const FAILOVER_AMPHORA_FLOW: &str = "failover-amphora-flow";
pub const DELETE_AMPHORA_FLOW: &str = "delete-amphora-flow";
pub const UPDATE_AMPHORA_CONFIG_FLOW: &str = "update-amphora-config-flow";
pub const CERT_ROTATE_AMPHORA_FLOW: &str = "cert-rotate-amphora-flow";
pub const CREATE_LOADBALANCER_FLOW: &str = "create-loadbalancer-flow";
pub const LB_NETWORKING_SUBFLOW: &str = "lb-networking-subflow";
pub const POST_LB_AMP_ASSOCIATION_SUBFLOW: &str = "post-lb-amp-association-subflow";
pub const DELETE_LOADBALANCER_FLOW: &str = "delete-loadbalancer-flow";
pub const UPDATE_LOADBALANCER_FLOW: &str = "update-loadbalancer-flow";
pub const FAILOVER_LOADBALANCER_FLOW: &str = "failover-loadbalancer-flow";

/// A task node named `<prefix>-<task name>`.
pub(crate) fn step(prefix: &str, task: impl Task + 'static) -> TaskNode {
    let node = TaskNode::new(task);
    let name = format!("{}-{}", prefix, node.name());
    node.named(name)
}

/// Agent tasks get the failover budget injected; otherwise they fall back to
/// the boot-time default.
pub(crate) fn with_timeouts(node: TaskNode, timeouts: Option<&AgentTimeouts>) -> TaskNode {
    match timeouts {
        Some(timeouts) => node.inject(TIMEOUT_DICT, timeouts),
        None => node,
    }
}
