//! Concrete tasks, grouped by the collaborator they drive.
//!
//! - lifecycle: revert-only guards that mark entities ERROR on rollback
//! - database: repository reads and status writes
//! - compute: instance, port attachment and server group handling
//! - network: VIP, security group, port and delta handling
//! - amphora: calls to the agent running inside each amphora
//! - cert: server certificate generation

pub mod amphora;
pub mod cert;
pub mod compute;
pub mod database;
pub mod lifecycle;
pub mod network;

use serde_json::json;
use tracing::{error, warn};

use crate::core::{TaskArgs, TaskContext, TaskError};
use crate::domain::constants::{AMPHORA, AMPHORAE, TIMEOUT_DICT};
use crate::domain::{
    AgentTimeouts, Amphora, AmphoraStatus, Listener, LoadBalancer, ProvisioningStatus,
};

pub use amphora::{
    AmpListenersUpdate, AmphoraCertUpload, AmphoraComputeConnectivityWait, AmphoraConfigUpdate,
    AmphoraFinalize, AmphoraIndexListenerUpdate, AmphoraIndexListenersReload,
    AmphoraPostNetworkPlug, AmphoraPostVipPlug, AmphoraUpdateVrrpInterface, AmphoraVrrpStart,
    AmphoraVrrpUpdate, ListenerDelete, ListenersUpdate,
};
pub use cert::GenerateServerPem;
pub use compute::{
    AttachPort, ComputeActiveWait, ComputeCreate, ComputeDelete, CreateServerGroup,
    DeleteAmphoraeOnLoadBalancer, DeleteServerGroup,
};
pub use database::{
    CreateAmphoraInDb, GetAmphoraeFromLoadbalancer, GetListenersFromLoadbalancer,
    MapLoadbalancerToAmphora, MarkAmphoraAllocatedInDb, MarkAmphoraBootingInDb,
    MarkAmphoraDeletedInDb, MarkAmphoraPendingDeleteInDb, MarkAmphoraRoleInDb,
    MarkLbActiveInDb, MarkLbAndListenersActiveInDb, MarkLbDeletedInDb, MarkListenerDeletedInDb,
    MarkPoolDeletedInDb, ReloadAmphora, ReloadLoadBalancer, UpdateAmphoraInfo,
    UpdateAmphoraVipData, UpdateAmphoraVrrpPortData, UpdateLbServerGroupInDb,
    UpdateLoadbalancerInDb, UpdateVipAfterAllocation,
};
pub use lifecycle::{AmphoraToErrorOnRevert, LoadBalancerIdToErrorOnRevert, LoadBalancerToErrorOnRevert};
pub use network::{
    AllocateVip, CalculateAmphoraDelta, CreateVipBasePort, DeallocateVip,
    GetAmphoraNetworkConfigs, GetAmphoraNetworkConfigsById, GetAmphoraeNetworkConfigs,
    GetSubnetFromVip, HandleNetworkDelta, PlugVipAmphora, UpdateVipSecurityGroup,
    WaitForPortDetach,
};

/// Which amphora an agent task acts on: the one bound as `amphora`, or
/// position `i` of the `amphorae` list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmphoraTarget {
    Bound,
    Index(usize),
}

impl AmphoraTarget {
    pub fn input(&self) -> &'static str {
        match self {
            Self::Bound => AMPHORA,
            Self::Index(_) => AMPHORAE,
        }
    }

    /// `None` when the index is past the end of the list, which happens when
    /// a load balancer has fewer amphorae than its topology calls for.
    pub fn resolve(&self, args: &TaskArgs) -> Result<Option<Amphora>, TaskError> {
        match self {
            Self::Bound => args.get(AMPHORA).map(Some),
            Self::Index(index) => {
                let amphorae: Vec<Amphora> = args.get(AMPHORAE)?;
                let found = amphorae.into_iter().nth(*index);
                if found.is_none() {
                    warn!(index, "No amphora at index, skipping");
                }
                Ok(found)
            }
        }
    }
}

/// Agent call budget: the bound `timeout_dict`, else the boot-time default.
pub(crate) fn agent_timeouts(ctx: &TaskContext, args: &TaskArgs) -> Result<AgentTimeouts, TaskError> {
    Ok(args
        .optional(TIMEOUT_DICT)?
        .unwrap_or_else(|| ctx.config.haproxy_amphora.connection_timeouts()))
}

pub(crate) async fn mark_amphora_error(ctx: &TaskContext, amphora_id: &str) {
    match ctx
        .repo
        .update::<Amphora>(amphora_id, json!({ "status": AmphoraStatus::Error }))
        .await
    {
        Ok(_) => warn!(amphora_id, "Marked amphora ERROR"),
        Err(e) => error!(amphora_id, error = %e, "Failed to mark amphora ERROR"),
    }
}

pub(crate) async fn mark_lb_error(ctx: &TaskContext, loadbalancer_id: &str) {
    match ctx
        .repo
        .update::<LoadBalancer>(
            loadbalancer_id,
            json!({ "provisioning_status": ProvisioningStatus::Error }),
        )
        .await
    {
        Ok(_) => warn!(loadbalancer_id, "Marked load balancer ERROR"),
        Err(e) => error!(loadbalancer_id, error = %e, "Failed to mark load balancer ERROR"),
    }
}

pub(crate) async fn mark_listener_error(ctx: &TaskContext, listener_id: &str) {
    if let Err(e) = ctx
        .repo
        .update::<Listener>(
            listener_id,
            json!({ "provisioning_status": ProvisioningStatus::Error }),
        )
        .await
    {
        error!(listener_id, error = %e, "Failed to mark listener ERROR");
    }
}
