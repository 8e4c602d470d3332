//! Tasks that call the agent running inside each amphora.
//!
//! Listener and VRRP calls are isolated: when one amphora fails, it is
//! marked ERROR and the flow carries on with the others. Later tasks for
//! that amphora see the ERROR status and skip it.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use super::database::live_listeners;
use super::{agent_timeouts, mark_amphora_error, mark_listener_error, AmphoraTarget};
use crate::adapters::agent_config::render_agent_config;
use crate::adapters::AdapterError;
use crate::core::{ErrorPolicy, Outcome, Task, TaskArgs, TaskContext, TaskError, TaskOutputs};
use crate::domain::constants::{
    ADDED_PORTS, AMPHORA, AMPHORAE_NETWORK_CONFIG, AMP_VRRP_INT, FLAVOR, LISTENER, LOADBALANCER,
    LOADBALANCER_ID, SERVER_PEM, TIMEOUT_DICT,
};
use crate::domain::{
    AddedPorts, Amphora, AmphoraStatus, Flavor, Listener, LoadBalancer, NetworkConfigs,
    ServerCertificate,
};

/// Fresh copy of the amphora, or `None` when it has been marked ERROR or
/// deleted since the flow read it.
async fn usable(ctx: &TaskContext, amphora: &Amphora) -> Result<Option<Amphora>, TaskError> {
    let current: Option<Amphora> = ctx.repo.get(&amphora.id).await?;
    match current {
        Some(amp) if matches!(amp.status, AmphoraStatus::Error | AmphoraStatus::Deleted) => {
            debug!(amphora_id = %amp.id, status = ?amp.status, "Skipping unusable amphora");
            Ok(None)
        }
        other => Ok(other),
    }
}

async fn resolve_usable(
    ctx: &TaskContext,
    target: AmphoraTarget,
    args: &TaskArgs,
) -> Result<Option<Amphora>, TaskError> {
    match target.resolve(args)? {
        Some(amphora) => usable(ctx, &amphora).await,
        None => Ok(None),
    }
}

async fn isolate(ctx: &TaskContext, target: AmphoraTarget, args: &TaskArgs, task: &str, e: &TaskError) {
    match target.resolve(args) {
        Ok(Some(amphora)) => {
            warn!(amphora_id = %amphora.id, task, error = %e, "Isolating failed amphora");
            mark_amphora_error(ctx, &amphora.id).await;
        }
        _ => error!(task, error = %e, "Isolated failure on an unknown amphora"),
    }
}

/// Pushes the load balancer's listener configuration to one amphora.
pub struct AmpListenersUpdate;

#[async_trait]
impl Task for AmpListenersUpdate {
    fn name(&self) -> &str {
        "amp-listeners-update"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![LOADBALANCER, AMPHORA]
    }

    fn optional(&self) -> Vec<&'static str> {
        vec![TIMEOUT_DICT]
    }

    fn error_policy(&self) -> ErrorPolicy {
        ErrorPolicy::IsolateAndContinue
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let Some(amphora) = resolve_usable(ctx, AmphoraTarget::Bound, args).await? else {
            return Ok(TaskOutputs::none());
        };
        let lb: LoadBalancer = args.get(LOADBALANCER)?;
        let listeners = live_listeners(ctx, &lb.id).await?;
        let timeouts = agent_timeouts(ctx, args)?;
        ctx.agent
            .update_listeners(&lb, &listeners, &amphora, &timeouts)
            .await?;
        Ok(TaskOutputs::none())
    }

    async fn on_isolated_failure(&self, ctx: &TaskContext, args: &TaskArgs, e: &TaskError) {
        isolate(ctx, AmphoraTarget::Bound, args, self.name(), e).await;
    }
}

/// Pushes the listener configuration to the amphora at `index` of a
/// failed-over load balancer.
pub struct AmphoraIndexListenerUpdate {
    pub index: usize,
}

#[async_trait]
impl Task for AmphoraIndexListenerUpdate {
    fn name(&self) -> &str {
        "amphora-index-listener-update"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![LOADBALANCER, AmphoraTarget::Index(self.index).input()]
    }

    fn optional(&self) -> Vec<&'static str> {
        vec![TIMEOUT_DICT]
    }

    fn error_policy(&self) -> ErrorPolicy {
        ErrorPolicy::IsolateAndContinue
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let target = AmphoraTarget::Index(self.index);
        let Some(amphora) = resolve_usable(ctx, target, args).await? else {
            return Ok(TaskOutputs::none());
        };
        let lb: LoadBalancer = args.get(LOADBALANCER)?;
        let listeners = live_listeners(ctx, &lb.id).await?;
        let timeouts = agent_timeouts(ctx, args)?;
        ctx.agent
            .update_listeners(&lb, &listeners, &amphora, &timeouts)
            .await?;
        Ok(TaskOutputs::none())
    }

    async fn on_isolated_failure(&self, ctx: &TaskContext, args: &TaskArgs, e: &TaskError) {
        isolate(ctx, AmphoraTarget::Index(self.index), args, self.name(), e).await;
    }
}

/// Reloads the listeners of the amphora at `index`. Nothing to reload on a
/// load balancer without listeners.
pub struct AmphoraIndexListenersReload {
    pub index: usize,
}

#[async_trait]
impl Task for AmphoraIndexListenersReload {
    fn name(&self) -> &str {
        "amphora-index-listeners-reload"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![LOADBALANCER, AmphoraTarget::Index(self.index).input()]
    }

    fn optional(&self) -> Vec<&'static str> {
        vec![TIMEOUT_DICT]
    }

    fn error_policy(&self) -> ErrorPolicy {
        ErrorPolicy::IsolateAndContinue
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let lb: LoadBalancer = args.get(LOADBALANCER)?;
        if live_listeners(ctx, &lb.id).await?.is_empty() {
            return Ok(TaskOutputs::none());
        }
        let target = AmphoraTarget::Index(self.index);
        let Some(amphora) = resolve_usable(ctx, target, args).await? else {
            return Ok(TaskOutputs::none());
        };
        let timeouts = agent_timeouts(ctx, args)?;
        ctx.agent.reload(&lb, &amphora, &timeouts).await?;
        Ok(TaskOutputs::none())
    }

    async fn on_isolated_failure(&self, ctx: &TaskContext, args: &TaskArgs, e: &TaskError) {
        isolate(ctx, AmphoraTarget::Index(self.index), args, self.name(), e).await;
    }
}

/// Pushes listener configuration to every amphora of the load balancer.
pub struct ListenersUpdate;

#[async_trait]
impl Task for ListenersUpdate {
    fn name(&self) -> &str {
        "listeners-update"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![LOADBALANCER]
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let lb: LoadBalancer = args.get(LOADBALANCER)?;
        let listeners = live_listeners(ctx, &lb.id).await?;
        let timeouts = ctx.config.haproxy_amphora.connection_timeouts();
        for amphora in ctx.repo.amphorae_for(&lb.id).await? {
            ctx.agent
                .update_listeners(&lb, &listeners, &amphora, &timeouts)
                .await?;
        }
        debug!(loadbalancer_id = %lb.id, listeners = listeners.len(), "Listeners updated");
        Ok(TaskOutputs::none())
    }

    async fn revert(&self, ctx: &TaskContext, args: &TaskArgs, outcome: &Outcome) -> Result<(), TaskError> {
        if outcome.is_failure() {
            return Ok(());
        }
        let lb: LoadBalancer = args.get(LOADBALANCER)?;
        for listener in live_listeners(ctx, &lb.id).await? {
            mark_listener_error(ctx, &listener.id).await;
        }
        Ok(())
    }
}

/// Removes one listener from every amphora of the load balancer.
pub struct ListenerDelete;

#[async_trait]
impl Task for ListenerDelete {
    fn name(&self) -> &str {
        "listener-delete"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![LOADBALANCER, LISTENER]
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let lb: LoadBalancer = args.get(LOADBALANCER)?;
        let listener: Listener = args.get(LISTENER)?;
        for amphora in ctx.repo.amphorae_for(&lb.id).await? {
            ctx.agent.delete_listener(&amphora, &listener).await?;
        }
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

/// Tells the agent its configuration is complete.
pub struct AmphoraFinalize;

#[async_trait]
impl Task for AmphoraFinalize {
    fn name(&self) -> &str {
        "amphora-finalize"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![AMPHORA]
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let amphora: Amphora = args.get(AMPHORA)?;
        ctx.agent.finalize(&amphora).await?;
        Ok(TaskOutputs::none())
    }

    async fn revert(&self, ctx: &TaskContext, args: &TaskArgs, outcome: &Outcome) -> Result<(), TaskError> {
        if outcome.is_failure() {
            return Ok(());
        }
        mark_amphora_error(ctx, &args.get::<Amphora>(AMPHORA)?.id).await;
        Ok(())
    }
}

/// Tells the agent about each port a network delta added.
pub struct AmphoraPostNetworkPlug;

#[async_trait]
impl Task for AmphoraPostNetworkPlug {
    fn name(&self) -> &str {
        "amphora-post-network-plug"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![AMPHORA, ADDED_PORTS]
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let amphora: Amphora = args.get(AMPHORA)?;
        let added: AddedPorts = args.get(ADDED_PORTS)?;
        for port in added.get(&amphora.id).into_iter().flatten() {
            ctx.agent.post_network_plug(&amphora, port).await?;
        }
        Ok(TaskOutputs::none())
    }

    async fn revert(&self, ctx: &TaskContext, args: &TaskArgs, outcome: &Outcome) -> Result<(), TaskError> {
        if outcome.is_failure() {
            return Ok(());
        }
        mark_amphora_error(ctx, &args.get::<Amphora>(AMPHORA)?.id).await;
        Ok(())
    }
}

/// Tells the agent the VIP is plugged, with its own network configuration.
pub struct AmphoraPostVipPlug {
    pub target: AmphoraTarget,
}

#[async_trait]
impl Task for AmphoraPostVipPlug {
    fn name(&self) -> &str {
        "amphora-post-vip-plug"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![self.target.input(), LOADBALANCER, AMPHORAE_NETWORK_CONFIG]
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let Some(amphora) = self.target.resolve(args)? else {
            return Ok(TaskOutputs::none());
        };
        let Some(configs) = args.get::<Option<NetworkConfigs>>(AMPHORAE_NETWORK_CONFIG)? else {
            warn!(amphora_id = %amphora.id, "No network configuration, skipping VIP plug notice");
            return Ok(TaskOutputs::none());
        };
        let config = configs
            .get(&amphora.id)
            .ok_or_else(|| TaskError::InvalidInput {
                name: AMPHORAE_NETWORK_CONFIG.to_string(),
                reason: format!("no entry for amphora {}", amphora.id),
            })?;
        let lb: LoadBalancer = args.get(LOADBALANCER)?;
        let amphora: Amphora = ctx.repo.require(&amphora.id).await?;
        ctx.agent.post_vip_plug(&amphora, &lb, config).await?;
        Ok(TaskOutputs::none())
    }

    async fn revert(&self, ctx: &TaskContext, args: &TaskArgs, outcome: &Outcome) -> Result<(), TaskError> {
        if outcome.is_failure() {
            return Ok(());
        }
        if let Some(amphora) = self.target.resolve(args)? {
            mark_amphora_error(ctx, &amphora.id).await;
        }
        Ok(())
    }
}

/// Uploads the server certificate and records its expiry.
pub struct AmphoraCertUpload;

#[async_trait]
impl Task for AmphoraCertUpload {
    fn name(&self) -> &str {
        "amphora-cert-upload"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![AMPHORA, SERVER_PEM]
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let amphora: Amphora = args.get(AMPHORA)?;
        let cert: ServerCertificate = args.get(SERVER_PEM)?;
        ctx.agent.upload_cert(&amphora, &cert.pem).await?;
        ctx.repo
            .update::<Amphora>(
                &amphora.id,
                json!({ "cert_expiration": cert.expires_at, "cert_busy": false }),
            )
            .await?;
        info!(amphora_id = %amphora.id, expires_at = %cert.expires_at, "Server certificate installed");
        Ok(TaskOutputs::none())
    }
}

/// Asks the agent which interface carries VRRP traffic and records it.
pub struct AmphoraUpdateVrrpInterface {
    pub target: AmphoraTarget,
}

#[async_trait]
impl Task for AmphoraUpdateVrrpInterface {
    fn name(&self) -> &str {
        "amphora-update-vrrp-interface"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![self.target.input()]
    }

    fn optional(&self) -> Vec<&'static str> {
        vec![TIMEOUT_DICT]
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![AMP_VRRP_INT]
    }

    fn error_policy(&self) -> ErrorPolicy {
        ErrorPolicy::IsolateAndContinue
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let Some(amphora) = resolve_usable(ctx, self.target, args).await? else {
            return TaskOutputs::single(AMP_VRRP_INT, &Value::Null);
        };
        let timeouts = agent_timeouts(ctx, args)?;
        let interface = ctx.agent.get_vrrp_interface(&amphora, &timeouts).await?;
        ctx.repo
            .update::<Amphora>(&amphora.id, json!({ "vrrp_interface": interface }))
            .await?;
        TaskOutputs::single(AMP_VRRP_INT, &interface)
    }

    async fn on_isolated_failure(&self, ctx: &TaskContext, args: &TaskArgs, e: &TaskError) {
        isolate(ctx, self.target, args, self.name(), e).await;
    }
}

/// Writes the keepalived configuration into one amphora.
pub struct AmphoraVrrpUpdate {
    pub target: AmphoraTarget,
}

#[async_trait]
impl Task for AmphoraVrrpUpdate {
    fn name(&self) -> &str {
        "amphora-vrrp-update"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![
            LOADBALANCER_ID,
            AMPHORAE_NETWORK_CONFIG,
            AMP_VRRP_INT,
            self.target.input(),
        ]
    }

    fn optional(&self) -> Vec<&'static str> {
        vec![TIMEOUT_DICT]
    }

    fn error_policy(&self) -> ErrorPolicy {
        ErrorPolicy::IsolateAndContinue
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let Some(mut amphora) = resolve_usable(ctx, self.target, args).await? else {
            return Ok(TaskOutputs::none());
        };
        let Some(interface) = args.get::<Option<String>>(AMP_VRRP_INT)? else {
            debug!(amphora_id = %amphora.id, "No VRRP interface known, skipping");
            return Ok(TaskOutputs::none());
        };
        let configs: NetworkConfigs = args
            .get::<Option<NetworkConfigs>>(AMPHORAE_NETWORK_CONFIG)?
            .unwrap_or_default();
        let lb: LoadBalancer = ctx
            .repo
            .require(&args.get::<String>(LOADBALANCER_ID)?)
            .await?;
        let timeouts = agent_timeouts(ctx, args)?;

        amphora.vrrp_interface = Some(interface);
        ctx.agent
            .update_vrrp_conf(&lb, &configs, &amphora, &timeouts)
            .await?;
        Ok(TaskOutputs::none())
    }

    async fn on_isolated_failure(&self, ctx: &TaskContext, args: &TaskArgs, e: &TaskError) {
        isolate(ctx, self.target, args, self.name(), e).await;
    }
}

pub struct AmphoraVrrpStart {
    pub target: AmphoraTarget,
}

#[async_trait]
impl Task for AmphoraVrrpStart {
    fn name(&self) -> &str {
        "amphora-vrrp-start"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![self.target.input()]
    }

    fn optional(&self) -> Vec<&'static str> {
        vec![TIMEOUT_DICT]
    }

    fn error_policy(&self) -> ErrorPolicy {
        ErrorPolicy::IsolateAndContinue
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let Some(amphora) = resolve_usable(ctx, self.target, args).await? else {
            return Ok(TaskOutputs::none());
        };
        let timeouts = agent_timeouts(ctx, args)?;
        ctx.agent.start_vrrp_service(&amphora, &timeouts).await?;
        Ok(TaskOutputs::none())
    }

    async fn on_isolated_failure(&self, ctx: &TaskContext, args: &TaskArgs, e: &TaskError) {
        isolate(ctx, self.target, args, self.name(), e).await;
    }
}

/// Waits for the agent to answer. An amphora that never does is marked
/// ERROR before the failure propagates.
pub struct AmphoraComputeConnectivityWait;

#[async_trait]
impl Task for AmphoraComputeConnectivityWait {
    fn name(&self) -> &str {
        "amphora-compute-connectivity-wait"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![AMPHORA]
    }

    fn optional(&self) -> Vec<&'static str> {
        vec![TIMEOUT_DICT]
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let amphora: Amphora = args.get(AMPHORA)?;
        let timeouts = agent_timeouts(ctx, args)?;
        match ctx.agent.get_info(&amphora, &timeouts).await {
            Ok(info) => {
                debug!(amphora_id = %amphora.id, %info, "Amphora agent reachable");
                Ok(TaskOutputs::none())
            }
            Err(e @ (AdapterError::Timeout(_) | AdapterError::Connection(_))) => {
                error!(amphora_id = %amphora.id, error = %e, "Amphora agent unreachable");
                mark_amphora_error(ctx, &amphora.id).await;
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Re-renders the agent configuration and pushes it. Agents too old to take
/// it are left alone.
pub struct AmphoraConfigUpdate;

#[async_trait]
impl Task for AmphoraConfigUpdate {
    fn name(&self) -> &str {
        "amphora-config-update"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![AMPHORA, FLAVOR]
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let amphora: Amphora = args.get(AMPHORA)?;
        let flavor: Flavor = args.get::<Option<Flavor>>(FLAVOR)?.unwrap_or_default();
        let topology = flavor
            .topology()
            .map_err(|e| TaskError::InvalidInput {
                name: FLAVOR.to_string(),
                reason: e.to_string(),
            })?
            .unwrap_or(ctx.config.controller_worker.loadbalancer_topology);

        let rendered = render_agent_config(&amphora.id, topology, &ctx.config);
        match ctx.agent.update_agent_config(&amphora, &rendered).await {
            Ok(()) => {
                info!(amphora_id = %amphora.id, "Agent configuration updated");
                Ok(TaskOutputs::none())
            }
            Err(AdapterError::NotSupported(reason)) => {
                warn!(amphora_id = %amphora.id, %reason, "Amphora does not support agent config update");
                Ok(TaskOutputs::none())
            }
            Err(e) => Err(e.into()),
        }
    }
}
