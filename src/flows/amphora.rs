//! Amphora flows: creation (standalone spare or for a load balancer), VRRP
//! setup, failover, deletion, agent config refresh and cert rotation.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use super::{
    step, with_timeouts, AMP_VRRP_SUBFLOW, CERT_ROTATE_AMPHORA_FLOW, CREATE_AMPHORA_FLOW,
    CREATE_AMPHORA_SUBFLOW, CREATE_AMP_FOR_LB_SUBFLOW, DELETE_AMPHORA_FLOW,
    FAILOVER_AMPHORA_FLOW, FAILOVER_LB_AMP_SUBFLOW, POST_MAP_AMP_TO_LB_SUBFLOW,
    UPDATE_AMPHORA_CONFIG_FLOW,
};
use crate::config::ControllerConfig;
use crate::core::{produced_value, Branch, Flow, RetryPolicy, TaskNode};
use crate::domain::constants::{
    ACTIVE_STANDBY_AMPHORA_COUNT, AMPHORA, AMPHORA_ID, LOADBALANCER_ID, ROLE,
};
use crate::domain::{AgentTimeouts, Amphora, AmphoraRole};
use crate::tasks::{
    AmpListenersUpdate, AmphoraCertUpload, AmphoraComputeConnectivityWait, AmphoraConfigUpdate,
    AmphoraFinalize, AmphoraIndexListenerUpdate, AmphoraIndexListenersReload,
    AmphoraPostNetworkPlug, AmphoraPostVipPlug, AmphoraTarget, AmphoraToErrorOnRevert,
    AmphoraUpdateVrrpInterface, AmphoraVrrpStart, AmphoraVrrpUpdate, AttachPort, CalculateAmphoraDelta, ComputeActiveWait, ComputeCreate,
    ComputeDelete, CreateAmphoraInDb, CreateVipBasePort, GenerateServerPem,
    GetAmphoraNetworkConfigsById, GetAmphoraeFromLoadbalancer, GetAmphoraeNetworkConfigs,
    HandleNetworkDelta, LoadBalancerIdToErrorOnRevert, LoadBalancerToErrorOnRevert,
    MapLoadbalancerToAmphora, MarkAmphoraAllocatedInDb, MarkAmphoraBootingInDb,
    MarkAmphoraDeletedInDb, MarkAmphoraPendingDeleteInDb, MarkAmphoraRoleInDb, MarkLbActiveInDb,
    ReloadAmphora, ReloadLoadBalancer, UpdateAmphoraInfo, UpdateAmphoraVrrpPortData,
    UpdateVipSecurityGroup, WaitForPortDetach,
};

/// Builds amphora flows from controller settings.
#[derive(Debug, Clone)]
pub struct AmphoraFlows {
    config: Arc<ControllerConfig>,
}

impl AmphoraFlows {
    pub fn new(config: Arc<ControllerConfig>) -> Self {
        Self { config }
    }

    /// Build a spare amphora: booted, certified and ALLOCATED with no load
    /// balancer.
    pub fn get_create_amphora_flow(&self) -> Flow {
        self.create_amphora_chain(CREATE_AMPHORA_FLOW, CREATE_AMPHORA_FLOW, true)
    }

    /// Same chain as a spare, but allocated straight to the load balancer
    /// bound as `loadbalancer_id`.
    pub fn get_create_amphora_for_lb_flow(&self) -> Flow {
        self.create_amphora_chain(CREATE_AMPHORA_FLOW, CREATE_AMPHORA_FLOW, false)
    }

    /// Boot chain shared by every creation path, ending with the ALLOCATED
    /// mark. Spares get a null load balancer id injected.
    fn create_amphora_chain(&self, flow_name: &str, prefix: &str, spare: bool) -> Flow {
        let worker = &self.config.controller_worker;
        let active_wait = RetryPolicy::fixed(
            worker.amp_active_retries.max(1),
            Duration::from_secs(worker.amp_active_wait_sec),
        );

        let allocate = step(prefix, MarkAmphoraAllocatedInDb);
        let allocate = if spare {
            allocate.inject(LOADBALANCER_ID, &Value::Null)
        } else {
            allocate
        };

        Flow::new(flow_name)
            .then(step(prefix, CreateAmphoraInDb))
            .then(step(prefix, GenerateServerPem))
            .then(step(prefix, ComputeCreate))
            .then(step(prefix, MarkAmphoraBootingInDb))
            .then(step(prefix, ComputeActiveWait).retry(active_wait))
            .then(step(prefix, UpdateAmphoraInfo))
            .then(step(prefix, AmphoraComputeConnectivityWait))
            .then(step(prefix, AmphoraCertUpload))
            .then(step(prefix, AmphoraFinalize))
            .then(allocate)
    }

    /// Role marking, only for roles the controller knows.
    fn mark_role(prefix: &str, role: Option<&AmphoraRole>) -> Option<TaskNode> {
        role.filter(|r| r.is_recognized())
            .map(|r| step(prefix, MarkAmphoraRoleInDb).inject(ROLE, r))
    }

    /// Provide an amphora for a load balancer: claim a spare when one fits,
    /// otherwise build a new one.
    pub fn get_amphora_for_lb_subflow(&self, prefix: &str, role: &AmphoraRole) -> Flow {
        let sf_name = format!("{}-{}", prefix, CREATE_AMP_FOR_LB_SUBFLOW);
        let map = step(&sf_name, MapLoadbalancerToAmphora);
        let map_name = map.name().to_string();

        let mut create = self.create_amphora_chain(
            &format!("{}-{}", sf_name, CREATE_AMPHORA_SUBFLOW),
            &sf_name,
            false,
        );
        if let Some(mark) = Self::mark_role(&sf_name, Some(role)) {
            create.push(mark);
        }

        let branch = Branch::new(
            format!("{}-spare-or-create", sf_name),
            map_name,
            |history| produced_value(history, AMPHORA_ID),
            self.get_post_map_subflow(&sf_name, role),
            create,
        );

        Flow::new(sf_name).then(map).then(branch)
    }

    /// After a spare was mapped: reload it, record its role and refresh its
    /// agent configuration for the load balancer's topology.
    pub fn get_post_map_subflow(&self, prefix: &str, role: &AmphoraRole) -> Flow {
        let sf_name = format!("{}-{}", prefix, POST_MAP_AMP_TO_LB_SUBFLOW);
        let mut flow = Flow::new(sf_name.clone()).then(step(&sf_name, ReloadAmphora));
        if let Some(mark) = Self::mark_role(&sf_name, Some(role)) {
            flow.push(mark);
        }
        flow.then(step(&sf_name, AmphoraConfigUpdate))
    }

    /// Interface discovery, keepalived config and start for each amphora of
    /// an active/standby pair.
    pub fn get_vrrp_subflow(&self, prefix: &str, timeouts: Option<&AgentTimeouts>) -> Flow {
        let sf_name = format!("{}-{}", prefix, AMP_VRRP_SUBFLOW);
        let mut flow = Flow::new(sf_name.clone()).then(step(&sf_name, GetAmphoraeNetworkConfigs));

        for index in 0..ACTIVE_STANDBY_AMPHORA_COUNT {
            let target = AmphoraTarget::Index(index);
            let amp_prefix = format!("{}-{}", sf_name, index);
            flow.push(
                Flow::new(format!("{}-amp-vrrp", amp_prefix))
                    .then(with_timeouts(
                        step(&amp_prefix, AmphoraUpdateVrrpInterface { target }),
                        timeouts,
                    ))
                    .then(with_timeouts(
                        step(&amp_prefix, AmphoraVrrpUpdate { target }),
                        timeouts,
                    ))
                    .then(with_timeouts(
                        step(&amp_prefix, AmphoraVrrpStart { target }),
                        timeouts,
                    )),
            );
        }
        flow
    }

    /// Build a replacement amphora for a load balancer and wire it into the
    /// VIP network with a fresh base port.
    pub fn get_amphora_for_lb_failover_subflow(
        &self,
        prefix: &str,
        role: &AmphoraRole,
        timeouts: Option<&AgentTimeouts>,
    ) -> Flow {
        let sf_name = format!("{}-{}", prefix, FAILOVER_LB_AMP_SUBFLOW);
        let mut flow = self.create_amphora_chain(&sf_name, &sf_name, false);
        if let Some(mark) = Self::mark_role(&sf_name, Some(role)) {
            flow.push(mark);
        }

        flow.then(step(&sf_name, CreateVipBasePort))
            .then(step(&sf_name, AttachPort))
            .then(step(&sf_name, UpdateAmphoraVrrpPortData))
            .then(step(&sf_name, GetAmphoraNetworkConfigsById))
            .then(step(&sf_name, CalculateAmphoraDelta))
            .then(step(&sf_name, HandleNetworkDelta).retry(self.config.task_retry.clone()))
            .then(step(&sf_name, AmphoraPostNetworkPlug))
            .then(step(
                &sf_name,
                AmphoraPostVipPlug {
                    target: AmphoraTarget::Bound,
                },
            ))
            .then(with_timeouts(step(&sf_name, AmpListenersUpdate), timeouts))
    }

    /// Replace a failed amphora of a load balancer. `amp_count` is how many
    /// amphorae the load balancer runs once the replacement is in.
    ///
    /// A spare (no role) or an amphora with a role the controller does not
    /// know gets a flow that only guards the load balancer.
    pub fn get_failover_amphora_flow(&self, failed: &Amphora, amp_count: usize) -> Flow {
        let mut flow = Flow::new(FAILOVER_AMPHORA_FLOW);
        let prefix = FAILOVER_AMPHORA_FLOW;

        let role = match failed.role.as_ref() {
            Some(role) if role.is_recognized() => role.clone(),
            _ => return flow.then(step(prefix, LoadBalancerIdToErrorOnRevert)),
        };
        let timeouts = self.config.haproxy_amphora.active_timeouts();

        flow.push(step(prefix, LoadBalancerToErrorOnRevert));
        flow.push(step(prefix, AmphoraToErrorOnRevert).inject(AMPHORA, failed));
        flow.push(step(prefix, UpdateVipSecurityGroup));
        flow.push(self.get_amphora_for_lb_failover_subflow(
            &role.as_str().to_ascii_lowercase(),
            &role,
            Some(&timeouts),
        ));
        flow.push(self.delete_failed_amphora_subflow("failed-amp", failed));
        flow.push(step(prefix, GetAmphoraeFromLoadbalancer));
        for index in 0..amp_count {
            flow.push(with_timeouts(
                step(&format!("{}-{}", prefix, index), AmphoraIndexListenerUpdate { index }),
                Some(&timeouts),
            ));
        }
        if matches!(role, AmphoraRole::Master | AmphoraRole::Backup) {
            flow.push(self.get_vrrp_subflow(prefix, Some(&timeouts)));
        }
        for index in 0..amp_count {
            flow.push(with_timeouts(
                step(&format!("{}-{}", prefix, index), AmphoraIndexListenersReload { index }),
                Some(&timeouts),
            ));
        }
        flow.then(step(prefix, ReloadLoadBalancer))
            .then(step(prefix, MarkLbActiveInDb))
    }

    /// Retire an amphora that has been replaced: every argument is bound at
    /// composition time.
    pub(crate) fn delete_failed_amphora_subflow(&self, prefix: &str, amphora: &Amphora) -> Flow {
        let sf_name = format!("{}-{}-delete-subflow", prefix, amphora.id);
        Flow::new(sf_name.clone())
            .then(step(&sf_name, MarkAmphoraPendingDeleteInDb).inject(AMPHORA, amphora))
            .then(step(&sf_name, ComputeDelete).inject(AMPHORA, amphora))
            .then(step(&sf_name, WaitForPortDetach).inject(AMPHORA, amphora))
            .then(step(&sf_name, MarkAmphoraDeletedInDb).inject(AMPHORA, amphora))
    }

    pub fn get_delete_amphora_flow(&self, amphora: &Amphora) -> Flow {
        let prefix = DELETE_AMPHORA_FLOW;
        Flow::new(DELETE_AMPHORA_FLOW)
            .then(step(prefix, AmphoraToErrorOnRevert).inject(AMPHORA, amphora))
            .then(step(prefix, MarkAmphoraPendingDeleteInDb).inject(AMPHORA, amphora))
            .then(step(prefix, ComputeDelete).inject(AMPHORA, amphora))
            .then(step(prefix, MarkAmphoraDeletedInDb).inject(AMPHORA, amphora))
    }

    pub fn update_amphora_config_upload_flow(&self) -> Flow {
        Flow::new(UPDATE_AMPHORA_CONFIG_FLOW).then(step(UPDATE_AMPHORA_CONFIG_FLOW, AmphoraConfigUpdate))
    }

    pub fn cert_rotate_amphora_flow(&self) -> Flow {
        let prefix = CERT_ROTATE_AMPHORA_FLOW;
        Flow::new(CERT_ROTATE_AMPHORA_FLOW)
            .then(step(prefix, GenerateServerPem))
            .then(step(prefix, AmphoraCertUpload))
    }
}

/// Roles for the two replacement amphorae of an active/standby failover.
/// Distinct MASTER/BACKUP roles already held are kept in order; the rest is
/// filled with MASTER first.
pub fn assign_failover_roles(existing: &[Amphora]) -> Vec<AmphoraRole> {
    let mut roles: Vec<AmphoraRole> = Vec::with_capacity(ACTIVE_STANDBY_AMPHORA_COUNT);
    for role in existing.iter().filter_map(|amp| amp.role.as_ref()) {
        if matches!(role, AmphoraRole::Master | AmphoraRole::Backup) && !roles.contains(role) {
            roles.push(role.clone());
        }
    }
    for role in [AmphoraRole::Master, AmphoraRole::Backup] {
        if !roles.contains(&role) {
            roles.push(role);
        }
    }
    roles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::constants::{
        ADDED_PORTS, AMPHORAE, AMPHORAE_NETWORK_CONFIG, AMP_VRRP_INT, BASE_PORT,
        BUILD_TYPE_PRIORITY, COMPUTE_ID, COMPUTE_OBJ, DELTA, FLAVOR, LOADBALANCER, SERVER_PEM,
        VIP, VIP_SG_ID,
    };
    use std::collections::BTreeSet;

    fn flows() -> AmphoraFlows {
        AmphoraFlows::new(Arc::new(ControllerConfig::default()))
    }

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn with_role(id: &str, role: Option<AmphoraRole>) -> Amphora {
        let mut amp = Amphora::new(id);
        amp.role = role;
        amp
    }

    #[test]
    fn test_create_amphora_flow() {
        let flow = flows().get_create_amphora_flow();

        assert_eq!(flow.requires(), set(&[BUILD_TYPE_PRIORITY, FLAVOR]));
        assert_eq!(
            flow.provides(),
            set(&[AMPHORA, AMPHORA_ID, COMPUTE_ID, COMPUTE_OBJ, SERVER_PEM])
        );
    }

    #[test]
    fn test_amphora_for_lb_subflow_branches_on_spare() {
        let flow = flows().get_amphora_for_lb_subflow("standalone", &AmphoraRole::Standalone);

        assert_eq!(
            flow.requires(),
            set(&[BUILD_TYPE_PRIORITY, FLAVOR, LOADBALANCER_ID])
        );
        assert_eq!(flow.provides().len(), 5);
        assert_eq!(flow.count_subflows(POST_MAP_AMP_TO_LB_SUBFLOW), 1);
        assert_eq!(flow.count_subflows(CREATE_AMPHORA_SUBFLOW), 1);
        assert!(flow
            .task_names()
            .iter()
            .any(|n| n.ends_with("mark-amphora-role-indb")));
    }

    #[test]
    fn test_unrecognized_role_skips_role_mark() {
        let role = AmphoraRole::Other("BOGUS".to_string());
        let flow = flows().get_amphora_for_lb_subflow("bogus", &role);

        assert_eq!(flow.requires().len(), 3);
        assert_eq!(flow.provides().len(), 5);
        assert!(!flow
            .task_names()
            .iter()
            .any(|n| n.ends_with("mark-amphora-role-indb")));
    }

    #[test]
    fn test_post_map_subflow() {
        let flow = flows().get_post_map_subflow("master", &AmphoraRole::Master);
        assert_eq!(flow.requires(), set(&[AMPHORA_ID, FLAVOR]));
        assert_eq!(flow.provides(), set(&[AMPHORA]));
    }

    #[test]
    fn test_vrrp_subflow() {
        let flow = flows().get_vrrp_subflow("lb", None);
        assert_eq!(flow.requires(), set(&[AMPHORAE, LOADBALANCER_ID]));
        assert_eq!(flow.provides(), set(&[AMP_VRRP_INT, AMPHORAE_NETWORK_CONFIG]));
        assert_eq!(flow.count_subflows("-amp-vrrp"), ACTIVE_STANDBY_AMPHORA_COUNT);
    }

    #[test]
    fn test_failover_subflow_contract() {
        let flow = flows().get_amphora_for_lb_failover_subflow("master", &AmphoraRole::Master, None);

        assert_eq!(
            flow.requires(),
            set(&[BUILD_TYPE_PRIORITY, FLAVOR, LOADBALANCER, LOADBALANCER_ID, VIP, VIP_SG_ID])
        );
        assert_eq!(
            flow.provides(),
            set(&[
                ADDED_PORTS,
                AMPHORA,
                AMPHORA_ID,
                AMPHORAE_NETWORK_CONFIG,
                BASE_PORT,
                COMPUTE_ID,
                COMPUTE_OBJ,
                DELTA,
                SERVER_PEM,
            ])
        );
    }

    #[test]
    fn test_failover_of_spare_only_guards() {
        let flow = flows().get_failover_amphora_flow(&with_role("amp-1", None), 1);
        assert_eq!(flow.requires(), set(&[LOADBALANCER_ID]));
        assert!(flow.provides().is_empty());
        assert_eq!(flow.task_names().len(), 1);
    }

    #[test]
    fn test_failover_standalone_and_vrrp_roles() {
        let standalone = flows()
            .get_failover_amphora_flow(&with_role("amp-1", Some(AmphoraRole::Standalone)), 1);
        assert_eq!(standalone.requires().len(), 5);
        assert_eq!(standalone.provides().len(), 12);
        assert_eq!(standalone.count_subflows(AMP_VRRP_SUBFLOW), 0);

        let master =
            flows().get_failover_amphora_flow(&with_role("amp-2", Some(AmphoraRole::Master)), 2);
        assert_eq!(master.requires().len(), 5);
        assert_eq!(master.provides().len(), 13);
        assert_eq!(master.count_subflows(AMP_VRRP_SUBFLOW), 1);
    }

    #[test]
    fn test_failover_updates_then_reloads_listeners_per_amphora() {
        let flow = flows()
            .get_failover_amphora_flow(&with_role("amp-2", Some(AmphoraRole::Backup)), 2);
        let names = flow.task_names();

        let position = |suffix: &str| names.iter().position(|n| n.ends_with(suffix));
        for index in 0..2 {
            let update = position(&format!("{}-amphora-index-listener-update", index))
                .expect("listener update step");
            let reload = position(&format!("{}-amphora-index-listeners-reload", index))
                .expect("listener reload step");
            assert!(update < reload);
        }
        let vrrp = position("amphora-vrrp-start").expect("vrrp start step");
        assert!(position("0-amphora-index-listener-update").unwrap() < vrrp);
        assert!(vrrp < position("0-amphora-index-listeners-reload").unwrap());
    }

    #[test]
    fn test_delete_amphora_flow_is_fully_bound() {
        let flow = flows().get_delete_amphora_flow(&Amphora::new("amp-1"));
        assert!(flow.requires().is_empty());
        assert!(flow.provides().is_empty());
    }

    #[test]
    fn test_assign_failover_roles() {
        assert_eq!(
            assign_failover_roles(&[]),
            vec![AmphoraRole::Master, AmphoraRole::Backup]
        );
        assert_eq!(
            assign_failover_roles(&[with_role("a", Some(AmphoraRole::Backup))]),
            vec![AmphoraRole::Backup, AmphoraRole::Master]
        );
        assert_eq!(
            assign_failover_roles(&[
                with_role("a", Some(AmphoraRole::Master)),
                with_role("b", Some(AmphoraRole::Master)),
                with_role("c", Some(AmphoraRole::Other("X".into()))),
            ]),
            vec![AmphoraRole::Master, AmphoraRole::Backup]
        );
    }
}
