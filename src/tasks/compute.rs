//! Compute instance, port attachment and server group tasks.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::adapters::agent_config::render_agent_config;
use crate::adapters::{AdapterError, ProvisionRequest};
use crate::core::{Outcome, Task, TaskArgs, TaskContext, TaskError, TaskOutputs};
use crate::domain::constants::{
    AMPHORA, AMPHORA_ID, BASE_PORT, BUILD_TYPE_PRIORITY, COMPUTE_ID, COMPUTE_OBJ, FLAVOR,
    LOADBALANCER, LOADBALANCER_ID, SERVER_GROUP_ID, SERVER_PEM,
};
use crate::domain::{
    Amphora, AmphoraStatus, ComputeStatus, Flavor, LoadBalancer, Port, ServerCertificate,
};

/// Where the rendered agent configuration lands on the config drive.
const AGENT_CONFIG_PATH: &str = "/etc/octavia/amphora-agent.conf";

/// Boots the compute instance for an amphora.
pub struct ComputeCreate;

#[async_trait]
impl Task for ComputeCreate {
    fn name(&self) -> &str {
        "compute-create"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![AMPHORA_ID, BUILD_TYPE_PRIORITY, FLAVOR]
    }

    fn optional(&self) -> Vec<&'static str> {
        vec![SERVER_PEM, SERVER_GROUP_ID]
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![COMPUTE_ID]
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let amphora_id: String = args.get(AMPHORA_ID)?;
        let priority: u32 = args.get(BUILD_TYPE_PRIORITY)?;
        let flavor: Flavor = args.get::<Option<Flavor>>(FLAVOR)?.unwrap_or_default();
        let worker = &ctx.config.controller_worker;

        let topology = flavor
            .topology()
            .map_err(|e| TaskError::InvalidInput {
                name: FLAVOR.to_string(),
                reason: e.to_string(),
            })?
            .unwrap_or(worker.loadbalancer_topology);

        let mut files = BTreeMap::new();
        files.insert(
            AGENT_CONFIG_PATH.to_string(),
            render_agent_config(&amphora_id, topology, &ctx.config),
        );
        if let Some(cert) = args.optional::<ServerCertificate>(SERVER_PEM)? {
            files.insert(ctx.config.amphora_agent.agent_server_cert.clone(), cert.pem);
        }

        let request = ProvisionRequest {
            name: format!("amphora-{}", amphora_id),
            amphora_id: amphora_id.clone(),
            image_tag: worker.amp_image_tag.clone(),
            compute_flavor: flavor
                .compute_flavor()
                .map(str::to_string)
                .unwrap_or_else(|| worker.amp_flavor_id.clone()),
            network_ids: worker.amp_boot_network_list.clone(),
            server_group_id: args.optional(SERVER_GROUP_ID)?,
            build_priority: priority,
            config_drive_files: files,
        };

        let compute_id = ctx.compute.provision(&request).await?;
        info!(%amphora_id, %compute_id, priority, "Compute instance requested");
        TaskOutputs::single(COMPUTE_ID, &compute_id)
    }

    async fn revert(&self, ctx: &TaskContext, _args: &TaskArgs, outcome: &Outcome) -> Result<(), TaskError> {
        let Some(compute_id) = outcome.output::<String>(COMPUTE_ID) else {
            return Ok(());
        };
        warn!(%compute_id, "Reverting compute instance creation");
        ctx.compute.delete(&compute_id).await?;
        Ok(())
    }
}

/// Polls until the instance reports ACTIVE. A building instance is a
/// transient timeout so the node's retry policy drives the polling.
pub struct ComputeActiveWait;

#[async_trait]
impl Task for ComputeActiveWait {
    fn name(&self) -> &str {
        "compute-active-wait"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![COMPUTE_ID, AMPHORA_ID]
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![COMPUTE_OBJ]
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let compute_id: String = args.get(COMPUTE_ID)?;
        let instance = ctx.compute.get_status(&compute_id).await?;
        match instance.status {
            ComputeStatus::Active => TaskOutputs::single(COMPUTE_OBJ, &instance),
            ComputeStatus::Building => {
                debug!(%compute_id, "Instance still building");
                Err(AdapterError::Timeout(format!("instance {} still building", compute_id)).into())
            }
            status => Err(TaskError::Failed(format!(
                "instance {} went to {:?} while booting",
                compute_id, status
            ))),
        }
    }
}

/// Deletes the compute instance behind an amphora.
pub struct ComputeDelete;

#[async_trait]
impl Task for ComputeDelete {
    fn name(&self) -> &str {
        "compute-delete"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![AMPHORA]
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let amphora: Amphora = args.get(AMPHORA)?;
        match amphora.compute_id.as_deref() {
            Some(compute_id) => {
                ctx.compute.delete(compute_id).await?;
                info!(amphora_id = %amphora.id, compute_id, "Compute instance deleted");
            }
            None => debug!(amphora_id = %amphora.id, "Amphora has no compute instance"),
        }
        Ok(TaskOutputs::none())
    }
}

/// Attaches a pre-created port to the amphora's instance.
pub struct AttachPort;

#[async_trait]
impl Task for AttachPort {
    fn name(&self) -> &str {
        "attach-port"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![AMPHORA, BASE_PORT]
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let amphora: Amphora = args.get(AMPHORA)?;
        let port: Port = args.get(BASE_PORT)?;
        let compute_id = compute_id_of(&amphora)?;
        ctx.compute
            .attach_network_or_port(compute_id, None, Some(&port.id), None)
            .await?;
        Ok(TaskOutputs::none())
    }

    async fn revert(&self, ctx: &TaskContext, args: &TaskArgs, outcome: &Outcome) -> Result<(), TaskError> {
        if outcome.is_failure() {
            return Ok(());
        }
        let amphora: Amphora = args.get(AMPHORA)?;
        let port: Port = args.get(BASE_PORT)?;
        if let Some(compute_id) = amphora.compute_id.as_deref() {
            ctx.compute.detach_port(compute_id, &port.id).await?;
        }
        Ok(())
    }
}

/// Deletes every amphora of a load balancer: instance first, then the row.
pub struct DeleteAmphoraeOnLoadBalancer;

#[async_trait]
impl Task for DeleteAmphoraeOnLoadBalancer {
    fn name(&self) -> &str {
        "delete-amphorae-on-loadbalancer"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![LOADBALANCER]
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let lb: LoadBalancer = args.get(LOADBALANCER)?;
        let amphorae = ctx.repo.amphorae_for(&lb.id).await?;
        for amphora in &amphorae {
            if let Some(compute_id) = amphora.compute_id.as_deref() {
                ctx.compute.delete(compute_id).await?;
            }
            ctx.repo
                .update::<Amphora>(&amphora.id, json!({ "status": AmphoraStatus::Deleted }))
                .await?;
        }
        info!(loadbalancer_id = %lb.id, count = amphorae.len(), "Deleted amphorae");
        Ok(TaskOutputs::none())
    }
}

/// Creates the anti-affinity server group for an active/standby pair.
pub struct CreateServerGroup;

#[async_trait]
impl Task for CreateServerGroup {
    fn name(&self) -> &str {
        "create-server-group"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![LOADBALANCER_ID]
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![SERVER_GROUP_ID]
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let lb_id: String = args.get(LOADBALANCER_ID)?;
        let policy = &ctx.config.controller_worker.anti_affinity_policy;
        let group_id = ctx
            .compute
            .create_server_group(&format!("octavia-lb-{}", lb_id), policy)
            .await?;
        info!(loadbalancer_id = %lb_id, server_group_id = %group_id, "Server group created");
        TaskOutputs::single(SERVER_GROUP_ID, &group_id)
    }

    async fn revert(&self, ctx: &TaskContext, _args: &TaskArgs, outcome: &Outcome) -> Result<(), TaskError> {
        let Some(group_id) = outcome.output::<String>(SERVER_GROUP_ID) else {
            return Ok(());
        };
        warn!(server_group_id = %group_id, "Reverting server group creation");
        ctx.compute.delete_server_group(&group_id).await?;
        Ok(())
    }
}

/// Deletes the load balancer's server group; a null id is skipped.
pub struct DeleteServerGroup;

#[async_trait]
impl Task for DeleteServerGroup {
    fn name(&self) -> &str {
        "delete-server-group"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![SERVER_GROUP_ID]
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        if let Some(group_id) = args.optional::<String>(SERVER_GROUP_ID)? {
            ctx.compute.delete_server_group(&group_id).await?;
        }
        Ok(TaskOutputs::none())
    }
}

pub(crate) fn compute_id_of(amphora: &Amphora) -> Result<&str, TaskError> {
    amphora
        .compute_id
        .as_deref()
        .ok_or_else(|| TaskError::InvalidInput {
            name: AMPHORA.to_string(),
            reason: format!("amphora {} has no compute instance", amphora.id),
        })
}
