//! Load balancer flows: create, update, delete and full failover.

use std::sync::Arc;

use super::{
    assign_failover_roles, step, with_timeouts, AmphoraFlows, CREATE_LOADBALANCER_FLOW,
    DELETE_LOADBALANCER_FLOW, FAILOVER_LOADBALANCER_FLOW, LB_NETWORKING_SUBFLOW,
    POST_LB_AMP_ASSOCIATION_SUBFLOW, UPDATE_LOADBALANCER_FLOW,
};
use crate::config::ControllerConfig;
use crate::core::Flow;
use crate::domain::constants::{
    ACTIVE_STANDBY_AMPHORA_COUNT, AMPHORAE_NETWORK_CONFIG, AMPHORA_NETWORK_CONFIG,
    AMP_VRRP_INT, FIRST_AMP_NETWORK_CONFIGS, FIRST_AMP_VRRP_INTERFACE, LISTENER, POOL,
};
use crate::domain::{Amphora, AmphoraRole, Listener, LoadBalancer, Pool, Topology};
use crate::tasks::{
    AllocateVip, AmphoraIndexListenersReload, AmphoraPostVipPlug, AmphoraTarget,
    AmphoraUpdateVrrpInterface, AmphoraVrrpStart, AmphoraVrrpUpdate, CreateServerGroup,
    DeallocateVip, DeleteAmphoraeOnLoadBalancer, DeleteServerGroup, GetAmphoraNetworkConfigs,
    GetAmphoraeFromLoadbalancer, GetAmphoraeNetworkConfigs, GetListenersFromLoadbalancer,
    GetSubnetFromVip, ListenerDelete, ListenersUpdate, LoadBalancerIdToErrorOnRevert,
    LoadBalancerToErrorOnRevert, MarkLbActiveInDb, MarkLbAndListenersActiveInDb,
    MarkLbDeletedInDb, MarkListenerDeletedInDb, MarkPoolDeletedInDb, PlugVipAmphora,
    ReloadLoadBalancer, UpdateAmphoraVipData, UpdateLbServerGroupInDb, UpdateLoadbalancerInDb,
    UpdateVipAfterAllocation, UpdateVipSecurityGroup,
};

#[derive(Debug, Clone)]
pub struct LoadBalancerFlows {
    config: Arc<ControllerConfig>,
    amp_flows: AmphoraFlows,
}

impl LoadBalancerFlows {
    pub fn new(config: Arc<ControllerConfig>) -> Self {
        let amp_flows = AmphoraFlows::new(config.clone());
        Self { config, amp_flows }
    }

    pub fn amphora_flows(&self) -> &AmphoraFlows {
        &self.amp_flows
    }

    fn roles_for(topology: Topology) -> Vec<AmphoraRole> {
        match topology {
            Topology::Single => vec![AmphoraRole::Standalone],
            Topology::ActiveStandby => vec![AmphoraRole::Master, AmphoraRole::Backup],
        }
    }

    /// Create a load balancer: amphorae, VIP networking, optionally the
    /// listeners already attached, then the final ACTIVE marking.
    pub fn get_create_load_balancer_flow(&self, topology: Topology, listeners: bool) -> Flow {
        let prefix = CREATE_LOADBALANCER_FLOW;
        let mut flow =
            Flow::new(CREATE_LOADBALANCER_FLOW).then(step(prefix, LoadBalancerIdToErrorOnRevert));

        if topology == Topology::ActiveStandby && self.config.controller_worker.enable_anti_affinity
        {
            flow.push(step(prefix, CreateServerGroup));
            flow.push(step(prefix, UpdateLbServerGroupInDb));
        }

        for role in Self::roles_for(topology) {
            flow.push(
                self.amp_flows
                    .get_amphora_for_lb_subflow(&role.as_str().to_ascii_lowercase(), &role),
            );
        }

        flow.push(self.get_networking_subflow(topology));

        if listeners {
            flow.push(step(prefix, GetListenersFromLoadbalancer));
            flow.push(step(prefix, ListenersUpdate));
            flow.push(step(prefix, MarkLbAndListenersActiveInDb));
        }

        flow.then(self.get_post_lb_amp_association_flow(prefix, topology))
    }

    /// VIP allocation and plugging into every amphora of the load balancer.
    fn get_networking_subflow(&self, topology: Topology) -> Flow {
        let sf_name = format!("{}-{}", CREATE_LOADBALANCER_FLOW, LB_NETWORKING_SUBFLOW);
        let mut flow = Flow::new(sf_name.clone())
            .then(step(&sf_name, ReloadLoadBalancer))
            .then(step(&sf_name, AllocateVip))
            .then(step(&sf_name, UpdateVipAfterAllocation))
            .then(step(&sf_name, UpdateVipSecurityGroup))
            .then(step(&sf_name, GetSubnetFromVip));

        match topology {
            Topology::Single => {
                flow.push(self.plug_vip_subflow(&sf_name, AmphoraTarget::Bound));
            }
            Topology::ActiveStandby => {
                flow.push(step(&sf_name, GetAmphoraeFromLoadbalancer));
                for index in 0..ACTIVE_STANDBY_AMPHORA_COUNT {
                    flow.push(self.plug_vip_subflow(
                        &format!("{}-{}", sf_name, index),
                        AmphoraTarget::Index(index),
                    ));
                }
            }
        }
        flow
    }

    fn plug_vip_subflow(&self, prefix: &str, target: AmphoraTarget) -> Flow {
        let sf_name = format!("{}-plug-vip", prefix);
        Flow::new(sf_name.clone())
            .then(step(&sf_name, PlugVipAmphora { target }).retry(self.config.task_retry.clone()))
            .then(step(&sf_name, UpdateAmphoraVipData))
            .then(step(&sf_name, GetAmphoraNetworkConfigs { target }))
            .then(
                step(&sf_name, AmphoraPostVipPlug { target })
                    .rebind(AMPHORAE_NETWORK_CONFIG, AMPHORA_NETWORK_CONFIG),
            )
    }

    /// Reload the load balancer, persist the requested changes, configure
    /// VRRP for active/standby, and mark it ACTIVE.
    pub fn get_post_lb_amp_association_flow(&self, prefix: &str, topology: Topology) -> Flow {
        let sf_name = format!("{}-{}", prefix, POST_LB_AMP_ASSOCIATION_SUBFLOW);
        let mut flow = Flow::new(sf_name.clone())
            .then(step(&sf_name, ReloadLoadBalancer))
            .then(step(&sf_name, UpdateLoadbalancerInDb));

        if topology == Topology::ActiveStandby {
            flow.push(step(&sf_name, GetAmphoraeFromLoadbalancer));
            flow.push(self.amp_flows.get_vrrp_subflow(&sf_name, None));
        }

        flow.then(step(&sf_name, MarkLbActiveInDb))
    }

    pub fn get_update_load_balancer_flow(&self) -> Flow {
        let prefix = UPDATE_LOADBALANCER_FLOW;
        Flow::new(UPDATE_LOADBALANCER_FLOW)
            .then(step(prefix, LoadBalancerToErrorOnRevert))
            .then(step(prefix, ListenersUpdate))
            .then(step(prefix, UpdateLoadbalancerInDb))
            .then(step(prefix, MarkLbActiveInDb))
    }

    /// Delete a load balancer. With `listeners`/`pools` non-empty the children
    /// are torn down first (cascade).
    pub fn get_delete_load_balancer_flow(&self, listeners: &[Listener], pools: &[Pool]) -> Flow {
        let prefix = DELETE_LOADBALANCER_FLOW;
        let mut flow =
            Flow::new(DELETE_LOADBALANCER_FLOW).then(step(prefix, LoadBalancerToErrorOnRevert));

        for listener in listeners {
            let listener_prefix = format!("{}-listener-{}", prefix, listener.id);
            flow.push(step(&listener_prefix, ListenerDelete).inject(LISTENER, listener));
            flow.push(step(&listener_prefix, MarkListenerDeletedInDb).inject(LISTENER, listener));
        }
        for pool in pools {
            flow.push(
                step(&format!("{}-pool-{}", prefix, pool.id), MarkPoolDeletedInDb)
                    .inject(POOL, pool),
            );
        }

        flow.then(step(prefix, DeallocateVip))
            .then(step(prefix, DeleteAmphoraeOnLoadBalancer))
            .then(step(prefix, DeleteServerGroup))
            .then(step(prefix, MarkLbDeletedInDb))
    }

    /// Rebuild every amphora slot of a load balancer, then delete the
    /// amphorae it had before.
    pub fn get_failover_lb_flow(&self, amphorae: &[Amphora], lb: &LoadBalancer) -> Flow {
        let prefix = FAILOVER_LOADBALANCER_FLOW;
        let timeouts = self.config.haproxy_amphora.active_timeouts();

        let mut flow = Flow::new(FAILOVER_LOADBALANCER_FLOW)
            .then(step(prefix, LoadBalancerToErrorOnRevert))
            .then(step(prefix, AllocateVip))
            .then(step(prefix, UpdateVipSecurityGroup));

        match lb.topology {
            Topology::Single => {
                flow.push(self.amp_flows.get_amphora_for_lb_failover_subflow(
                    "standalone",
                    &AmphoraRole::Standalone,
                    Some(&timeouts),
                ));
                self.push_old_amphora_deletes(&mut flow, amphorae);
            }
            Topology::ActiveStandby => {
                let roles = assign_failover_roles(amphorae);
                let (first, second) = (&roles[0], &roles[1]);

                flow.push(self.amp_flows.get_amphora_for_lb_failover_subflow(
                    &first.as_str().to_ascii_lowercase(),
                    first,
                    Some(&timeouts),
                ));

                // Bring VRRP up on the first new amphora before its peer is
                // built so the VIP keeps an owner.
                let first_prefix = format!("{}-first-amp", prefix);
                flow.push(step(&first_prefix, GetAmphoraeFromLoadbalancer));
                flow.push(
                    step(&first_prefix, GetAmphoraeNetworkConfigs)
                        .provides_as(AMPHORAE_NETWORK_CONFIG, FIRST_AMP_NETWORK_CONFIGS),
                );
                flow.push(with_timeouts(
                    step(
                        &first_prefix,
                        AmphoraUpdateVrrpInterface {
                            target: AmphoraTarget::Bound,
                        },
                    )
                    .provides_as(AMP_VRRP_INT, FIRST_AMP_VRRP_INTERFACE),
                    Some(&timeouts),
                ));
                flow.push(with_timeouts(
                    step(
                        &first_prefix,
                        AmphoraVrrpUpdate {
                            target: AmphoraTarget::Bound,
                        },
                    )
                    .rebind(AMPHORAE_NETWORK_CONFIG, FIRST_AMP_NETWORK_CONFIGS)
                    .rebind(AMP_VRRP_INT, FIRST_AMP_VRRP_INTERFACE),
                    Some(&timeouts),
                ));
                flow.push(with_timeouts(
                    step(
                        &first_prefix,
                        AmphoraVrrpStart {
                            target: AmphoraTarget::Bound,
                        },
                    ),
                    Some(&timeouts),
                ));

                flow.push(self.amp_flows.get_amphora_for_lb_failover_subflow(
                    &second.as_str().to_ascii_lowercase(),
                    second,
                    Some(&timeouts),
                ));

                self.push_old_amphora_deletes(&mut flow, amphorae);

                flow.push(step(prefix, GetAmphoraeFromLoadbalancer));
                flow.push(self.amp_flows.get_vrrp_subflow(prefix, Some(&timeouts)));
                for index in 0..ACTIVE_STANDBY_AMPHORA_COUNT {
                    flow.push(with_timeouts(
                        step(
                            &format!("{}-{}", prefix, index),
                            AmphoraIndexListenersReload { index },
                        ),
                        Some(&timeouts),
                    ));
                }
            }
        }

        flow.then(step(prefix, ReloadLoadBalancer))
            .then(step(prefix, MarkLbActiveInDb))
    }

    fn push_old_amphora_deletes(&self, flow: &mut Flow, amphorae: &[Amphora]) {
        for (index, amphora) in amphorae.iter().enumerate() {
            flow.push(
                self.amp_flows
                    .delete_failed_amphora_subflow(&format!("failed-amp-{}", index), amphora),
            );
        }
    }
}
