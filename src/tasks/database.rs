//! Repository reads and status writes.
//!
//! Every write here is a single-entity update; reverts restore or mark
//! ERROR only what their own execute touched.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{mark_amphora_error, mark_lb_error, mark_listener_error};
use crate::core::{Outcome, Task, TaskArgs, TaskContext, TaskError, TaskOutputs};
use crate::domain::constants::{
    AMPHORA, AMPHORAE, AMPHORA_ID, AMP_DATA, BASE_PORT, COMPUTE_ID, COMPUTE_OBJ, FLAVOR,
    LISTENER, LISTENERS, LOADBALANCER, LOADBALANCER_ID, POOL, ROLE, ROLE_BACKUP_PRIORITY,
    ROLE_MASTER_PRIORITY, SERVER_GROUP_ID, UPDATE_DICT, VIP,
};
use crate::domain::{
    Amphora, AmphoraRole, AmphoraStatus, ComputeInstance, Flavor, Listener, LoadBalancer,
    OperatingStatus, Pool, Port, ProvisioningStatus, Vip,
};
use crate::store::Filter;

/// Inserts an empty amphora record; revert removes it again so a rerun
/// starts clean.
pub struct CreateAmphoraInDb;

#[async_trait]
impl Task for CreateAmphoraInDb {
    fn name(&self) -> &str {
        "create-amphora-indb"
    }

    fn requires(&self) -> Vec<&'static str> {
        Vec::new()
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![AMPHORA_ID]
    }

    async fn execute(&self, ctx: &TaskContext, _args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let amphora = Amphora::new(Uuid::new_v4().to_string());
        ctx.repo.insert(&amphora).await?;
        info!(amphora_id = %amphora.id, "Created amphora record");
        TaskOutputs::single(AMPHORA_ID, &amphora.id)
    }

    async fn revert(&self, ctx: &TaskContext, _args: &TaskArgs, outcome: &Outcome) -> Result<(), TaskError> {
        let Some(amphora_id) = outcome.output::<String>(AMPHORA_ID) else {
            return Ok(());
        };
        warn!(%amphora_id, "Reverting amphora record creation");
        ctx.repo.delete::<Amphora>(&amphora_id).await?;
        Ok(())
    }
}

pub struct MarkAmphoraBootingInDb;

#[async_trait]
impl Task for MarkAmphoraBootingInDb {
    fn name(&self) -> &str {
        "mark-amphora-booting-indb"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![AMPHORA_ID, COMPUTE_ID]
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let amphora_id: String = args.get(AMPHORA_ID)?;
        let compute_id: String = args.get(COMPUTE_ID)?;
        ctx.repo
            .update::<Amphora>(
                &amphora_id,
                json!({ "status": AmphoraStatus::Booting, "compute_id": compute_id }),
            )
            .await?;
        Ok(TaskOutputs::none())
    }

    async fn revert(&self, ctx: &TaskContext, args: &TaskArgs, outcome: &Outcome) -> Result<(), TaskError> {
        if outcome.is_failure() {
            return Ok(());
        }
        mark_amphora_error(ctx, &args.get::<String>(AMPHORA_ID)?).await;
        Ok(())
    }
}

/// Copies what compute reported about the instance onto the amphora.
pub struct UpdateAmphoraInfo;

#[async_trait]
impl Task for UpdateAmphoraInfo {
    fn name(&self) -> &str {
        "update-amphora-info"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![AMPHORA_ID, COMPUTE_OBJ]
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![AMPHORA]
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let amphora_id: String = args.get(AMPHORA_ID)?;
        let instance: ComputeInstance = args.get(COMPUTE_OBJ)?;
        let amphora: Amphora = ctx
            .repo
            .update(
                &amphora_id,
                json!({
                    "lb_network_ip": instance.lb_network_ip,
                    "compute_flavor": instance.compute_flavor,
                    "image_id": instance.image_id,
                }),
            )
            .await?;
        TaskOutputs::single(AMPHORA, &amphora)
    }
}

/// Marks the amphora ALLOCATED and binds it to the load balancer. Spares
/// get a null `loadbalancer_id` injected.
pub struct MarkAmphoraAllocatedInDb;

#[async_trait]
impl Task for MarkAmphoraAllocatedInDb {
    fn name(&self) -> &str {
        "mark-amphora-allocated-indb"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![AMPHORA, LOADBALANCER_ID]
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let amphora: Amphora = args.get(AMPHORA)?;
        let mut changes = json!({ "status": AmphoraStatus::Allocated });
        if let Some(lb_id) = args.optional::<String>(LOADBALANCER_ID)? {
            changes["load_balancer_id"] = Value::String(lb_id);
        }
        ctx.repo.update::<Amphora>(&amphora.id, changes).await?;
        info!(amphora_id = %amphora.id, "Amphora allocated");
        Ok(TaskOutputs::none())
    }

    async fn revert(&self, ctx: &TaskContext, args: &TaskArgs, outcome: &Outcome) -> Result<(), TaskError> {
        if outcome.is_failure() {
            return Ok(());
        }
        let amphora: Amphora = args.get(AMPHORA)?;
        mark_amphora_error(ctx, &amphora.id).await;
        Ok(())
    }
}

/// Records the role (bound at composition time) and its VRRP priority.
pub struct MarkAmphoraRoleInDb;

#[async_trait]
impl Task for MarkAmphoraRoleInDb {
    fn name(&self) -> &str {
        "mark-amphora-role-indb"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![AMPHORA, ROLE]
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let amphora: Amphora = args.get(AMPHORA)?;
        let role: AmphoraRole = args.get(ROLE)?;
        debug!(amphora_id = %amphora.id, role = %role, "Marking amphora role");
        let (priority, vrrp_id) = match role {
            AmphoraRole::Master => (Some(ROLE_MASTER_PRIORITY), Some(1)),
            AmphoraRole::Backup => (Some(ROLE_BACKUP_PRIORITY), Some(1)),
            _ => (None, None),
        };
        ctx.repo
            .update::<Amphora>(
                &amphora.id,
                json!({ "role": role, "vrrp_priority": priority, "vrrp_id": vrrp_id }),
            )
            .await?;
        Ok(TaskOutputs::none())
    }

    async fn revert(&self, ctx: &TaskContext, args: &TaskArgs, outcome: &Outcome) -> Result<(), TaskError> {
        if outcome.is_failure() {
            return Ok(());
        }
        let amphora: Amphora = args.get(AMPHORA)?;
        ctx.repo
            .update::<Amphora>(
                &amphora.id,
                json!({ "role": Value::Null, "vrrp_priority": Value::Null, "vrrp_id": Value::Null }),
            )
            .await?;
        Ok(())
    }
}

/// Claims a spare amphora for the load balancer. Provides a null id when
/// the pool has none that fits, so the caller builds a new one.
pub struct MapLoadbalancerToAmphora;

#[async_trait]
impl Task for MapLoadbalancerToAmphora {
    fn name(&self) -> &str {
        "map-loadbalancer-to-amphora"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![LOADBALANCER_ID]
    }

    fn optional(&self) -> Vec<&'static str> {
        vec![FLAVOR]
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![AMPHORA_ID]
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let lb_id: String = args.get(LOADBALANCER_ID)?;
        let flavor: Option<Flavor> = args.optional(FLAVOR)?;
        let wanted_flavor = flavor.as_ref().and_then(Flavor::compute_flavor);

        let mut spares: Vec<Amphora> = ctx
            .repo
            .list(&Filter::new().eq("status", json!(AmphoraStatus::Allocated)))
            .await?;
        spares.retain(|amp| {
            amp.is_spare()
                && wanted_flavor.map_or(true, |f| amp.compute_flavor.as_deref() == Some(f))
        });
        spares.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let unclaimed = Filter::new()
            .eq("load_balancer_id", Value::Null)
            .eq("status", json!(AmphoraStatus::Allocated));
        for spare in spares {
            let claimed: Option<Amphora> = ctx
                .repo
                .update_if(&spare.id, &unclaimed, json!({ "load_balancer_id": lb_id }))
                .await?;
            if claimed.is_some() {
                info!(loadbalancer_id = %lb_id, amphora_id = %spare.id, "Mapped spare amphora");
                return TaskOutputs::single(AMPHORA_ID, &spare.id);
            }
            debug!(amphora_id = %spare.id, "Spare claimed elsewhere, trying the next one");
        }

        debug!(loadbalancer_id = %lb_id, "No spare amphora available");
        TaskOutputs::single(AMPHORA_ID, &Value::Null)
    }

    async fn revert(&self, ctx: &TaskContext, _args: &TaskArgs, outcome: &Outcome) -> Result<(), TaskError> {
        let Some(amphora_id) = outcome.output::<String>(AMPHORA_ID) else {
            return Ok(());
        };
        ctx.repo
            .update::<Amphora>(&amphora_id, json!({ "load_balancer_id": Value::Null }))
            .await?;
        Ok(())
    }
}

pub struct ReloadAmphora;

#[async_trait]
impl Task for ReloadAmphora {
    fn name(&self) -> &str {
        "reload-amphora"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![AMPHORA_ID]
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![AMPHORA]
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let amphora: Amphora = ctx.repo.require(&args.get::<String>(AMPHORA_ID)?).await?;
        TaskOutputs::single(AMPHORA, &amphora)
    }
}

pub struct ReloadLoadBalancer;

#[async_trait]
impl Task for ReloadLoadBalancer {
    fn name(&self) -> &str {
        "reload-loadbalancer"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![LOADBALANCER_ID]
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![LOADBALANCER]
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let lb: LoadBalancer = ctx
            .repo
            .require(&args.get::<String>(LOADBALANCER_ID)?)
            .await?;
        TaskOutputs::single(LOADBALANCER, &lb)
    }
}

pub struct UpdateVipAfterAllocation;

#[async_trait]
impl Task for UpdateVipAfterAllocation {
    fn name(&self) -> &str {
        "update-vip-after-allocation"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![LOADBALANCER_ID, VIP]
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![LOADBALANCER]
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let lb_id: String = args.get(LOADBALANCER_ID)?;
        let vip: Vip = args.get(VIP)?;
        let lb: LoadBalancer = ctx.repo.update(&lb_id, json!({ "vip": vip })).await?;
        TaskOutputs::single(LOADBALANCER, &lb)
    }
}

/// Persists the VRRP and HA addresses returned by the VIP plug.
pub struct UpdateAmphoraVipData;

#[async_trait]
impl Task for UpdateAmphoraVipData {
    fn name(&self) -> &str {
        "update-amphora-vip-data"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![AMP_DATA]
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let Some(plugged) = args.get::<Option<Amphora>>(AMP_DATA)? else {
            return Ok(TaskOutputs::none());
        };
        ctx.repo
            .update::<Amphora>(
                &plugged.id,
                json!({
                    "vrrp_ip": plugged.vrrp_ip,
                    "ha_ip": plugged.ha_ip,
                    "vrrp_port_id": plugged.vrrp_port_id,
                    "ha_port_id": plugged.ha_port_id,
                }),
            )
            .await?;
        Ok(TaskOutputs::none())
    }
}

/// Persists the VRRP address of a freshly created base port.
pub struct UpdateAmphoraVrrpPortData;

#[async_trait]
impl Task for UpdateAmphoraVrrpPortData {
    fn name(&self) -> &str {
        "update-amphora-vrrp-port-data"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![AMPHORA_ID, BASE_PORT, VIP]
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![AMPHORA]
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let amphora_id: String = args.get(AMPHORA_ID)?;
        let port: Port = args.get(BASE_PORT)?;
        let vip: Vip = args.get(VIP)?;
        let vrrp_ip = port.fixed_ips.first().map(|ip| ip.ip_address.clone());
        let amphora: Amphora = ctx
            .repo
            .update(
                &amphora_id,
                json!({
                    "vrrp_ip": vrrp_ip,
                    "vrrp_port_id": port.id,
                    "ha_ip": vip.ip_address,
                    "ha_port_id": vip.port_id,
                }),
            )
            .await?;
        TaskOutputs::single(AMPHORA, &amphora)
    }
}

pub struct GetAmphoraeFromLoadbalancer;

#[async_trait]
impl Task for GetAmphoraeFromLoadbalancer {
    fn name(&self) -> &str {
        "get-amphorae-from-loadbalancer"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![LOADBALANCER_ID]
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![AMPHORAE]
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let amphorae = ctx
            .repo
            .amphorae_for(&args.get::<String>(LOADBALANCER_ID)?)
            .await?;
        TaskOutputs::single(AMPHORAE, &amphorae)
    }
}

pub struct UpdateLoadbalancerInDb;

#[async_trait]
impl Task for UpdateLoadbalancerInDb {
    fn name(&self) -> &str {
        "update-loadbalancer-indb"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![LOADBALANCER, UPDATE_DICT]
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let lb: LoadBalancer = args.get(LOADBALANCER)?;
        let update: Value = args.get(UPDATE_DICT)?;
        if update.as_object().map_or(false, |fields| !fields.is_empty()) {
            ctx.repo.update::<LoadBalancer>(&lb.id, update).await?;
        }
        Ok(TaskOutputs::none())
    }

    async fn revert(&self, ctx: &TaskContext, args: &TaskArgs, outcome: &Outcome) -> Result<(), TaskError> {
        if outcome.is_failure() {
            return Ok(());
        }
        let lb: LoadBalancer = args.get(LOADBALANCER)?;
        mark_lb_error(ctx, &lb.id).await;
        Ok(())
    }
}

pub struct MarkLbActiveInDb;

#[async_trait]
impl Task for MarkLbActiveInDb {
    fn name(&self) -> &str {
        "mark-lb-active-indb"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![LOADBALANCER]
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let lb: LoadBalancer = args.get(LOADBALANCER)?;
        ctx.repo
            .update::<LoadBalancer>(
                &lb.id,
                json!({
                    "provisioning_status": ProvisioningStatus::Active,
                    "operating_status": OperatingStatus::Online,
                }),
            )
            .await?;
        info!(loadbalancer_id = %lb.id, "Load balancer ACTIVE");
        Ok(TaskOutputs::none())
    }

    async fn revert(&self, ctx: &TaskContext, args: &TaskArgs, outcome: &Outcome) -> Result<(), TaskError> {
        if outcome.is_failure() {
            return Ok(());
        }
        let lb: LoadBalancer = args.get(LOADBALANCER)?;
        mark_lb_error(ctx, &lb.id).await;
        Ok(())
    }
}

pub struct MarkLbAndListenersActiveInDb;

#[async_trait]
impl Task for MarkLbAndListenersActiveInDb {
    fn name(&self) -> &str {
        "mark-lb-and-listeners-active-indb"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![LOADBALANCER, LISTENERS]
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let lb: LoadBalancer = args.get(LOADBALANCER)?;
        let listeners: Vec<Listener> = args.get(LISTENERS)?;
        let active = json!({
            "provisioning_status": ProvisioningStatus::Active,
            "operating_status": OperatingStatus::Online,
        });
        for listener in &listeners {
            ctx.repo
                .update::<Listener>(&listener.id, active.clone())
                .await?;
        }
        ctx.repo.update::<LoadBalancer>(&lb.id, active).await?;
        Ok(TaskOutputs::none())
    }

    async fn revert(&self, ctx: &TaskContext, args: &TaskArgs, outcome: &Outcome) -> Result<(), TaskError> {
        if outcome.is_failure() {
            return Ok(());
        }
        let lb: LoadBalancer = args.get(LOADBALANCER)?;
        let listeners: Vec<Listener> = args.get(LISTENERS)?;
        for listener in &listeners {
            mark_listener_error(ctx, &listener.id).await;
        }
        mark_lb_error(ctx, &lb.id).await;
        Ok(())
    }
}

pub struct GetListenersFromLoadbalancer;

#[async_trait]
impl Task for GetListenersFromLoadbalancer {
    fn name(&self) -> &str {
        "get-listeners-from-loadbalancer"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![LOADBALANCER]
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![LISTENERS]
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let lb: LoadBalancer = args.get(LOADBALANCER)?;
        let listeners = live_listeners(ctx, &lb.id).await?;
        TaskOutputs::single(LISTENERS, &listeners)
    }
}

/// Listeners of a load balancer that are not deleted.
pub(crate) async fn live_listeners(ctx: &TaskContext, lb_id: &str) -> Result<Vec<Listener>, TaskError> {
    let mut listeners: Vec<Listener> = ctx
        .repo
        .list(&Filter::new().eq("load_balancer_id", lb_id))
        .await?;
    listeners.retain(|l| l.provisioning_status != ProvisioningStatus::Deleted);
    Ok(listeners)
}

pub struct MarkAmphoraPendingDeleteInDb;

#[async_trait]
impl Task for MarkAmphoraPendingDeleteInDb {
    fn name(&self) -> &str {
        "mark-amphora-pending-delete-indb"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![AMPHORA]
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let amphora: Amphora = args.get(AMPHORA)?;
        ctx.repo
            .update::<Amphora>(&amphora.id, json!({ "status": AmphoraStatus::PendingDelete }))
            .await?;
        Ok(TaskOutputs::none())
    }

    async fn revert(&self, ctx: &TaskContext, args: &TaskArgs, outcome: &Outcome) -> Result<(), TaskError> {
        if outcome.is_failure() {
            return Ok(());
        }
        let amphora: Amphora = args.get(AMPHORA)?;
        mark_amphora_error(ctx, &amphora.id).await;
        Ok(())
    }
}

pub struct MarkAmphoraDeletedInDb;

#[async_trait]
impl Task for MarkAmphoraDeletedInDb {
    fn name(&self) -> &str {
        "mark-amphora-deleted-indb"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![AMPHORA]
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let amphora: Amphora = args.get(AMPHORA)?;
        ctx.repo
            .update::<Amphora>(&amphora.id, json!({ "status": AmphoraStatus::Deleted }))
            .await?;
        info!(amphora_id = %amphora.id, "Amphora deleted");
        Ok(TaskOutputs::none())
    }

    async fn revert(&self, ctx: &TaskContext, args: &TaskArgs, outcome: &Outcome) -> Result<(), TaskError> {
        if outcome.is_failure() {
            return Ok(());
        }
        let amphora: Amphora = args.get(AMPHORA)?;
        mark_amphora_error(ctx, &amphora.id).await;
        Ok(())
    }
}

pub struct MarkListenerDeletedInDb;

#[async_trait]
impl Task for MarkListenerDeletedInDb {
    fn name(&self) -> &str {
        "mark-listener-deleted-indb"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![LISTENER]
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let listener: Listener = args.get(LISTENER)?;
        ctx.repo
            .update::<Listener>(
                &listener.id,
                json!({
                    "provisioning_status": ProvisioningStatus::Deleted,
                    "operating_status": OperatingStatus::Offline,
                }),
            )
            .await?;
        Ok(TaskOutputs::none())
    }

    async fn revert(&self, ctx: &TaskContext, args: &TaskArgs, outcome: &Outcome) -> Result<(), TaskError> {
        if outcome.is_failure() {
            return Ok(());
        }
        mark_listener_error(ctx, &args.get::<Listener>(LISTENER)?.id).await;
        Ok(())
    }
}

pub struct MarkPoolDeletedInDb;

#[async_trait]
impl Task for MarkPoolDeletedInDb {
    fn name(&self) -> &str {
        "mark-pool-deleted-indb"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![POOL]
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let pool: Pool = args.get(POOL)?;
        ctx.repo
            .update::<Pool>(
                &pool.id,
                json!({ "provisioning_status": ProvisioningStatus::Deleted }),
            )
            .await?;
        Ok(TaskOutputs::none())
    }

    async fn revert(&self, ctx: &TaskContext, args: &TaskArgs, outcome: &Outcome) -> Result<(), TaskError> {
        if outcome.is_failure() {
            return Ok(());
        }
        let pool: Pool = args.get(POOL)?;
        ctx.repo
            .update::<Pool>(&pool.id, json!({ "provisioning_status": ProvisioningStatus::Error }))
            .await?;
        Ok(())
    }
}

pub struct MarkLbDeletedInDb;

#[async_trait]
impl Task for MarkLbDeletedInDb {
    fn name(&self) -> &str {
        "mark-lb-deleted-indb"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![LOADBALANCER]
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let lb: LoadBalancer = args.get(LOADBALANCER)?;
        ctx.repo
            .update::<LoadBalancer>(
                &lb.id,
                json!({
                    "provisioning_status": ProvisioningStatus::Deleted,
                    "operating_status": OperatingStatus::Offline,
                }),
            )
            .await?;
        info!(loadbalancer_id = %lb.id, "Load balancer deleted");
        Ok(TaskOutputs::none())
    }
}

pub struct UpdateLbServerGroupInDb;

#[async_trait]
impl Task for UpdateLbServerGroupInDb {
    fn name(&self) -> &str {
        "update-lb-server-group-indb"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![LOADBALANCER_ID, SERVER_GROUP_ID]
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let lb_id: String = args.get(LOADBALANCER_ID)?;
        let group: Option<String> = args.optional(SERVER_GROUP_ID)?;
        ctx.repo
            .update::<LoadBalancer>(&lb_id, json!({ "server_group_id": group }))
            .await?;
        Ok(TaskOutputs::none())
    }

    async fn revert(&self, ctx: &TaskContext, args: &TaskArgs, outcome: &Outcome) -> Result<(), TaskError> {
        if outcome.is_failure() {
            return Ok(());
        }
        let lb_id: String = args.get(LOADBALANCER_ID)?;
        ctx.repo
            .update::<LoadBalancer>(&lb_id, json!({ "server_group_id": Value::Null }))
            .await?;
        Ok(())
    }
}
