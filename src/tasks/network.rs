//! VIP, security group, port and network delta tasks.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::compute::compute_id_of;
use super::AmphoraTarget;
use crate::adapters::PortRequest;
use crate::core::{Outcome, Task, TaskArgs, TaskContext, TaskError, TaskOutputs};
use crate::domain::constants::{
    ADDED_PORTS, AMPHORA, AMPHORAE_NETWORK_CONFIG, AMPHORA_ID, AMPHORA_NETWORK_CONFIG, AMP_DATA,
    BASE_PORT, DELTA, LOADBALANCER, LOADBALANCER_ID, SUBNET, VIP, VIP_SG_ID,
};
use crate::domain::{AddedPorts, Amphora, LoadBalancer, NetworkDelta, Nic, Port, Subnet, Vip};

fn vip_of(lb: &LoadBalancer) -> Result<&Vip, TaskError> {
    lb.vip.as_ref().ok_or_else(|| TaskError::InvalidInput {
        name: LOADBALANCER.to_string(),
        reason: format!("load balancer {} has no VIP", lb.id),
    })
}

/// Allocates the VIP port, or adopts the one the load balancer already has.
pub struct AllocateVip;

#[async_trait]
impl Task for AllocateVip {
    fn name(&self) -> &str {
        "allocate-vip"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![LOADBALANCER]
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![VIP]
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let lb: LoadBalancer = args.get(LOADBALANCER)?;
        let vip = ctx.network.allocate_vip(&lb).await?;
        info!(loadbalancer_id = %lb.id, ip = ?vip.ip_address, "VIP allocated");
        TaskOutputs::single(VIP, &vip)
    }

    async fn revert(&self, ctx: &TaskContext, args: &TaskArgs, outcome: &Outcome) -> Result<(), TaskError> {
        let lb: LoadBalancer = args.get(LOADBALANCER)?;
        // An adopted VIP stays; only a port allocated by this run is released.
        if lb.vip.as_ref().map_or(false, |v| v.port_id.is_some()) {
            return Ok(());
        }
        let Some(vip) = outcome.output::<Vip>(VIP) else {
            return Ok(());
        };
        warn!(loadbalancer_id = %lb.id, "Reverting VIP allocation");
        ctx.network.deallocate_vip(&vip).await?;
        Ok(())
    }
}

pub struct UpdateVipSecurityGroup;

#[async_trait]
impl Task for UpdateVipSecurityGroup {
    fn name(&self) -> &str {
        "update-vip-security-group"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![LOADBALANCER, VIP]
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![VIP_SG_ID]
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let lb: LoadBalancer = args.get(LOADBALANCER)?;
        let vip: Vip = args.get(VIP)?;
        let sg_id = ctx.network.update_vip_sg(&lb, &vip).await?;
        TaskOutputs::single(VIP_SG_ID, &sg_id)
    }
}

pub struct GetSubnetFromVip;

#[async_trait]
impl Task for GetSubnetFromVip {
    fn name(&self) -> &str {
        "get-subnet-from-vip"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![LOADBALANCER]
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![SUBNET]
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let lb: LoadBalancer = args.get(LOADBALANCER)?;
        let subnet_id = vip_of(&lb)?
            .subnet_id
            .clone()
            .ok_or_else(|| TaskError::InvalidInput {
                name: LOADBALANCER.to_string(),
                reason: format!("VIP of load balancer {} has no subnet", lb.id),
            })?;
        let subnet = ctx.network.get_subnet(&subnet_id).await?;
        TaskOutputs::single(SUBNET, &subnet)
    }
}

/// Plugs the VIP into one amphora. Provides the amphora with its VRRP and
/// HA addresses filled in.
pub struct PlugVipAmphora {
    pub target: AmphoraTarget,
}

#[async_trait]
impl Task for PlugVipAmphora {
    fn name(&self) -> &str {
        "plug-vip-amphora"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![LOADBALANCER, SUBNET, self.target.input()]
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![AMP_DATA]
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let Some(amphora) = self.target.resolve(args)? else {
            return TaskOutputs::single(AMP_DATA, &Value::Null);
        };
        let lb: LoadBalancer = args.get(LOADBALANCER)?;
        let subnet: Subnet = args.get(SUBNET)?;
        let plugged = ctx
            .network
            .plug_aap_port(&lb, vip_of(&lb)?, &amphora, &subnet)
            .await?;
        debug!(amphora_id = %amphora.id, vrrp_ip = ?plugged.vrrp_ip, "VIP plugged");
        TaskOutputs::single(AMP_DATA, &plugged)
    }

    async fn revert(&self, ctx: &TaskContext, args: &TaskArgs, outcome: &Outcome) -> Result<(), TaskError> {
        let Some(plugged) = outcome.output::<Amphora>(AMP_DATA) else {
            return Ok(());
        };
        let lb: LoadBalancer = args.get(LOADBALANCER)?;
        warn!(amphora_id = %plugged.id, "Reverting VIP plug");
        ctx.network.unplug_aap_port(vip_of(&lb)?, &plugged).await?;
        Ok(())
    }
}

/// Network configuration of a single amphora, keyed by its id.
pub struct GetAmphoraNetworkConfigs {
    pub target: AmphoraTarget,
}

#[async_trait]
impl Task for GetAmphoraNetworkConfigs {
    fn name(&self) -> &str {
        "get-amphora-network-configs"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![LOADBALANCER, self.target.input()]
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![AMPHORA_NETWORK_CONFIG]
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let lb: LoadBalancer = args.get(LOADBALANCER)?;
        let Some(amphora) = self.target.resolve(args)? else {
            return TaskOutputs::single(AMPHORA_NETWORK_CONFIG, &Value::Null);
        };
        // The bound snapshot predates the VIP plug; the repository has the ports.
        let amphora: Amphora = ctx.repo.require(&amphora.id).await?;
        let configs = ctx.network.get_network_configs(&lb, &[amphora]).await?;
        TaskOutputs::single(AMPHORA_NETWORK_CONFIG, &configs)
    }
}

pub struct GetAmphoraNetworkConfigsById;

#[async_trait]
impl Task for GetAmphoraNetworkConfigsById {
    fn name(&self) -> &str {
        "get-amphora-network-configs-by-id"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![LOADBALANCER, AMPHORA_ID]
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![AMPHORAE_NETWORK_CONFIG]
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let lb: LoadBalancer = args.get(LOADBALANCER)?;
        let amphora: Amphora = ctx.repo.require(&args.get::<String>(AMPHORA_ID)?).await?;
        let configs = ctx.network.get_network_configs(&lb, &[amphora]).await?;
        TaskOutputs::single(AMPHORAE_NETWORK_CONFIG, &configs)
    }
}

/// Network configuration of every live amphora of a load balancer.
pub struct GetAmphoraeNetworkConfigs;

#[async_trait]
impl Task for GetAmphoraeNetworkConfigs {
    fn name(&self) -> &str {
        "get-amphorae-network-configs"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![LOADBALANCER_ID]
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![AMPHORAE_NETWORK_CONFIG]
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let lb_id: String = args.get(LOADBALANCER_ID)?;
        let lb: LoadBalancer = ctx.repo.require(&lb_id).await?;
        let amphorae = ctx.repo.amphorae_for(&lb_id).await?;
        let configs = ctx.network.get_network_configs(&lb, &amphorae).await?;
        TaskOutputs::single(AMPHORAE_NETWORK_CONFIG, &configs)
    }
}

/// Creates the VRRP base port a replacement amphora gets attached to.
pub struct CreateVipBasePort;

#[async_trait]
impl Task for CreateVipBasePort {
    fn name(&self) -> &str {
        "create-vip-base-port"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![VIP, VIP_SG_ID, AMPHORA_ID]
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![BASE_PORT]
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let vip: Vip = args.get(VIP)?;
        let sg_id: Option<String> = args.get(VIP_SG_ID)?;
        let amphora_id: String = args.get(AMPHORA_ID)?;
        let network_id = vip.network_id.clone().ok_or_else(|| TaskError::InvalidInput {
            name: VIP.to_string(),
            reason: "VIP has no network".to_string(),
        })?;

        let request = PortRequest {
            name: format!("octavia-lb-vrrp-{}", amphora_id),
            network_id,
            subnet_id: vip.subnet_id.clone(),
            security_group_ids: sg_id.into_iter().collect(),
        };
        let port = ctx.network.create_port(&request).await?;
        info!(%amphora_id, port_id = %port.id, "Created VIP base port");
        TaskOutputs::single(BASE_PORT, &port)
    }

    async fn revert(&self, ctx: &TaskContext, _args: &TaskArgs, outcome: &Outcome) -> Result<(), TaskError> {
        let Some(port) = outcome.output::<Port>(BASE_PORT) else {
            return Ok(());
        };
        warn!(port_id = %port.id, "Reverting VIP base port");
        ctx.network.delete_port(&port.id).await?;
        Ok(())
    }
}

/// Compares the networks an amphora should be on (VIP plus boot networks)
/// with the ones its instance has.
pub struct CalculateAmphoraDelta;

#[async_trait]
impl Task for CalculateAmphoraDelta {
    fn name(&self) -> &str {
        "calculate-amphora-delta"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![LOADBALANCER, AMPHORA, BASE_PORT]
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![DELTA]
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let lb: LoadBalancer = args.get(LOADBALANCER)?;
        let amphora: Amphora = args.get(AMPHORA)?;
        let base_port: Port = args.get(BASE_PORT)?;
        let compute_id = compute_id_of(&amphora)?;

        let mut desired: BTreeSet<String> = ctx
            .config
            .controller_worker
            .amp_boot_network_list
            .iter()
            .cloned()
            .collect();
        if let Some(network_id) = vip_of(&lb)?.network_id.clone() {
            desired.insert(network_id);
        }

        let interfaces = ctx.compute.list_interfaces(compute_id).await?;
        let mut current: BTreeSet<String> = BTreeSet::new();
        let mut delete_nics = Vec::new();
        for interface in &interfaces {
            // The base port carries the VIP network whatever network it reports.
            let network_id = if interface.port_id == base_port.id {
                base_port.network_id.clone()
            } else {
                interface.network_id.clone()
            };
            if desired.contains(&network_id) {
                current.insert(network_id);
            } else {
                delete_nics.push(Nic {
                    network_id,
                    port_id: Some(interface.port_id.clone()),
                });
            }
        }

        let add_nics = desired
            .difference(&current)
            .map(|network_id| Nic {
                network_id: network_id.clone(),
                port_id: None,
            })
            .collect();

        let delta = NetworkDelta {
            amphora_id: amphora.id.clone(),
            compute_id: compute_id.to_string(),
            add_nics,
            delete_nics,
        };
        debug!(
            amphora_id = %amphora.id,
            add = delta.add_nics.len(),
            delete = delta.delete_nics.len(),
            "Calculated network delta"
        );
        TaskOutputs::single(DELTA, &delta)
    }
}

/// Applies a network delta to the amphora's instance.
pub struct HandleNetworkDelta;

#[async_trait]
impl Task for HandleNetworkDelta {
    fn name(&self) -> &str {
        "handle-network-delta"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![AMPHORA, DELTA]
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![ADDED_PORTS]
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let amphora: Amphora = args.get(AMPHORA)?;
        let delta: NetworkDelta = args.get(DELTA)?;

        let mut ports = Vec::new();
        if let Err(e) = apply_delta(ctx, &delta, &mut ports).await {
            warn!(
                amphora_id = %amphora.id,
                attached = ports.len(),
                error = %e,
                "Network delta failed, detaching ports it attached"
            );
            detach_ports(ctx, &delta.compute_id, &ports).await;
            return Err(e);
        }

        let mut added = AddedPorts::new();
        added.insert(amphora.id.clone(), ports);
        TaskOutputs::single(ADDED_PORTS, &added)
    }

    async fn revert(&self, ctx: &TaskContext, args: &TaskArgs, outcome: &Outcome) -> Result<(), TaskError> {
        let Some(added) = outcome.output::<AddedPorts>(ADDED_PORTS) else {
            return Ok(());
        };
        let delta: NetworkDelta = args.get(DELTA)?;
        let ports: Vec<Port> = added.into_values().flatten().collect();
        detach_ports(ctx, &delta.compute_id, &ports).await;
        Ok(())
    }
}

/// Plugs the missing networks, then unplugs the stale ports. Every port
/// attached here lands in `ports`, including ones an earlier attempt left
/// on a network the delta still lists as missing.
async fn apply_delta(
    ctx: &TaskContext,
    delta: &NetworkDelta,
    ports: &mut Vec<Port>,
) -> Result<(), TaskError> {
    let present = ctx.compute.list_interfaces(&delta.compute_id).await?;
    for nic in &delta.add_nics {
        if let Some(existing) = present.iter().find(|i| i.network_id == nic.network_id) {
            debug!(network_id = %nic.network_id, port_id = %existing.port_id, "Network already plugged");
            ports.push(existing.as_port());
            continue;
        }
        let interface = ctx
            .compute
            .attach_network_or_port(&delta.compute_id, Some(&nic.network_id), None, None)
            .await?;
        ports.push(interface.as_port());
    }
    for nic in &delta.delete_nics {
        if let Some(port_id) = nic.port_id.as_deref() {
            ctx.compute.detach_port(&delta.compute_id, port_id).await?;
        }
    }
    Ok(())
}

async fn detach_ports(ctx: &TaskContext, compute_id: &str, ports: &[Port]) {
    for port in ports {
        if let Err(e) = ctx.compute.detach_port(compute_id, &port.id).await {
            warn!(port_id = %port.id, error = %e, "Failed to detach port");
        }
    }
}

/// Waits until compute has let go of every port of a deleted amphora.
pub struct WaitForPortDetach;

#[async_trait]
impl Task for WaitForPortDetach {
    fn name(&self) -> &str {
        "wait-for-port-detach"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![AMPHORA]
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let amphora: Amphora = args.get(AMPHORA)?;
        let settings = &ctx.config.networking;
        let limit = Duration::from_secs(settings.port_detach_timeout);
        let interval = Duration::from_secs(settings.retry_interval);
        let started = Instant::now();

        loop {
            let attached = ctx.network.get_amphora_ports(&amphora).await?;
            if attached.is_empty() {
                return Ok(TaskOutputs::none());
            }
            if started.elapsed() >= limit {
                warn!(amphora_id = %amphora.id, ports = attached.len(), "Ports still attached");
                return Err(TaskError::Timeout(limit));
            }
            debug!(amphora_id = %amphora.id, ports = attached.len(), "Waiting for port detach");
            tokio::time::sleep(interval).await;
        }
    }
}

/// Releases the VIP: unplugs it from every amphora, then deletes the port
/// when it was allocated by the controller.
pub struct DeallocateVip;

#[async_trait]
impl Task for DeallocateVip {
    fn name(&self) -> &str {
        "deallocate-vip"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![LOADBALANCER]
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let lb: LoadBalancer = args.get(LOADBALANCER)?;
        let Some(vip) = lb.vip.as_ref() else {
            debug!(loadbalancer_id = %lb.id, "No VIP to deallocate");
            return Ok(TaskOutputs::none());
        };

        for amphora in ctx.repo.amphorae_for(&lb.id).await? {
            ctx.network.unplug_aap_port(vip, &amphora).await?;
        }
        if vip.octavia_owned {
            ctx.network.deallocate_vip(vip).await?;
        }
        info!(loadbalancer_id = %lb.id, "VIP deallocated");
        Ok(TaskOutputs::none())
    }
}
