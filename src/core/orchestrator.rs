//! Lifecycle operations over amphorae and load balancers.
//!
//! Each operation reads the entity snapshot, selects and builds a flow, binds
//! its inputs, runs it on the engine and re-reads the entity for its result.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::config::ControllerConfig;
use crate::domain::constants::{
    AMPHORA, AMPHORA_ID, BUILD_TYPE_PRIORITY, FLAVOR, LB_CREATE_FAILOVER_PRIORITY,
    LB_CREATE_NORMAL_PRIORITY, LB_CREATE_SPARES_POOL_PRIORITY, LOADBALANCER, LOADBALANCER_ID,
    LOADBALANCER_TOPOLOGY, SERVER_GROUP_ID, UPDATE_DICT, VIP,
};
use crate::domain::{
    Amphora, Flavor, FlowExecution, InvalidTopology, Listener, LoadBalancer, Pool,
    ProvisioningStatus,
};
use crate::flows::{AmphoraFlows, LoadBalancerFlows};
use crate::store::{Entity, Filter, Repository, StoreError};

use super::engine::{FlowEngine, FlowError};
use super::flow::Flow;
use super::task::{TaskContext, Values};

#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error(transparent)]
    InvalidTopology(#[from] InvalidTopology),

    #[error("load balancer {id} still has {listeners} listener(s) and {pools} pool(s)")]
    HasChildren {
        id: String,
        listeners: usize,
        pools: usize,
    },

    #[error(transparent)]
    Flow(#[from] FlowError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Entry point for every lifecycle operation.
pub struct Orchestrator {
    engine: FlowEngine,
    amp_flows: AmphoraFlows,
    lb_flows: LoadBalancerFlows,
}

impl Orchestrator {
    pub fn new(ctx: TaskContext) -> Self {
        let lb_flows = LoadBalancerFlows::new(ctx.config.clone());
        Self {
            amp_flows: lb_flows.amphora_flows().clone(),
            lb_flows,
            engine: FlowEngine::new(ctx),
        }
    }

    /// Journal every flow execution under `dir`.
    pub fn with_journal_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.engine = self.engine.with_journal_dir(dir);
        self
    }

    pub fn engine(&self) -> &FlowEngine {
        &self.engine
    }

    fn repo(&self) -> &Arc<dyn Repository> {
        &self.engine.context().repo
    }

    fn config(&self) -> &ControllerConfig {
        &self.engine.context().config
    }

    async fn load<T: Entity>(&self, id: &str) -> Result<T, OrchestrationError> {
        self.repo()
            .get::<T>(id)
            .await?
            .ok_or_else(|| OrchestrationError::NotFound {
                kind: T::KIND,
                id: id.to_string(),
            })
    }

    async fn run(&self, flow: &Flow, inputs: Values) -> Result<FlowExecution, OrchestrationError> {
        let execution = self.engine.run(flow, inputs).await?;
        info!(
            flow = %flow.name(),
            execution_id = %execution.id,
            isolated = execution.isolated.len(),
            "Flow finished"
        );
        Ok(execution)
    }

    /// Build an amphora. Without a target it joins the spare pool.
    #[instrument(skip(self))]
    pub async fn create_amphora(&self, target_lb: Option<&str>) -> Result<Amphora, OrchestrationError> {
        let (flow, mut inputs) = match target_lb {
            Some(lb_id) => {
                let lb: LoadBalancer = self.load(lb_id).await?;
                let inputs = values([
                    (BUILD_TYPE_PRIORITY, json!(LB_CREATE_NORMAL_PRIORITY)),
                    (LOADBALANCER_ID, json!(lb.id)),
                ]);
                (self.amp_flows.get_create_amphora_for_lb_flow(), inputs)
            }
            None => (
                self.amp_flows.get_create_amphora_flow(),
                values([(BUILD_TYPE_PRIORITY, json!(LB_CREATE_SPARES_POOL_PRIORITY))]),
            ),
        };
        inputs.insert(FLAVOR.to_string(), Value::Null);

        let execution = self.run(&flow, inputs).await?;
        let amphora_id: String = execution.value(AMPHORA_ID).ok_or_else(|| {
            OrchestrationError::NotFound {
                kind: Amphora::KIND,
                id: "<created>".to_string(),
            }
        })?;
        self.load(&amphora_id).await
    }

    #[instrument(skip(self))]
    pub async fn delete_amphora(&self, amphora_id: &str) -> Result<(), OrchestrationError> {
        let amphora: Amphora = self.load(amphora_id).await?;
        let flow = self.amp_flows.get_delete_amphora_flow(&amphora);
        self.run(&flow, Values::new()).await?;
        Ok(())
    }

    /// Replace a failed amphora. Spares and amphorae with an unknown role get
    /// no replacement and yield `None`.
    #[instrument(skip(self))]
    pub async fn failover_amphora(&self, amphora_id: &str) -> Result<Option<Amphora>, OrchestrationError> {
        let amphora: Amphora = self.load(amphora_id).await?;
        let lb_id = amphora.load_balancer_id.clone();

        let recognized = amphora.role.as_ref().map_or(false, |role| role.is_recognized());
        if !recognized {
            warn!(
                amphora_id,
                role = ?amphora.role,
                "Amphora has no usable role, not building a replacement"
            );
            let flow = self.amp_flows.get_failover_amphora_flow(&amphora, 0);
            self.run(&flow, values([(LOADBALANCER_ID, json!(lb_id))])).await?;
            return Ok(None);
        }

        let lb_id = lb_id.ok_or_else(|| OrchestrationError::NotFound {
            kind: LoadBalancer::KIND,
            id: format!("<load balancer of amphora {}>", amphora_id),
        })?;
        let lb: LoadBalancer = self.load(&lb_id).await?;

        let flow = self
            .amp_flows
            .get_failover_amphora_flow(&amphora, lb.topology.amphora_count());
        let inputs = values([
            (BUILD_TYPE_PRIORITY, json!(LB_CREATE_FAILOVER_PRIORITY)),
            (FLAVOR, topology_flavor(&lb)),
            (LOADBALANCER_ID, json!(lb.id)),
            (VIP, to_value(&lb.vip)?),
            (LOADBALANCER, to_value(&lb)?),
        ]);

        let execution = self.run(&flow, inputs).await?;
        match execution.value::<String>(AMPHORA_ID) {
            Some(new_id) => {
                info!(amphora_id, replacement = %new_id, "Amphora replaced");
                Ok(Some(self.load(&new_id).await?))
            }
            None => Ok(None),
        }
    }

    /// Provision a load balancer. The flavor's topology wins over the one
    /// stored on the load balancer.
    #[instrument(skip(self, flavor))]
    pub async fn create_load_balancer(
        &self,
        lb_id: &str,
        flavor: Option<&Flavor>,
        listeners: bool,
    ) -> Result<LoadBalancer, OrchestrationError> {
        let lb: LoadBalancer = self.load(lb_id).await?;
        let flavor = flavor.cloned().unwrap_or_default();
        let topology = flavor.topology()?.unwrap_or(lb.topology);
        info!(lb_id, topology = %topology.as_str(), "Creating load balancer");

        let flow = self.lb_flows.get_create_load_balancer_flow(topology, listeners);
        let inputs = values([
            (BUILD_TYPE_PRIORITY, json!(LB_CREATE_NORMAL_PRIORITY)),
            (
                FLAVOR,
                to_value(&flavor.with(LOADBALANCER_TOPOLOGY, topology.as_str()))?,
            ),
            (LOADBALANCER_ID, json!(lb.id)),
            (UPDATE_DICT, json!({ "topology": topology })),
        ]);

        self.run(&flow, inputs).await?;
        self.load(lb_id).await
    }

    #[instrument(skip(self, update_dict))]
    pub async fn update_load_balancer(
        &self,
        lb_id: &str,
        update_dict: Value,
    ) -> Result<LoadBalancer, OrchestrationError> {
        let lb: LoadBalancer = self.load(lb_id).await?;
        let flow = self.lb_flows.get_update_load_balancer_flow();
        let inputs = values([(LOADBALANCER, to_value(&lb)?), (UPDATE_DICT, update_dict)]);

        self.run(&flow, inputs).await?;
        self.load(lb_id).await
    }

    /// Delete a load balancer. Without `cascade` it refuses while live
    /// listeners or pools remain.
    #[instrument(skip(self))]
    pub async fn delete_load_balancer(&self, lb_id: &str, cascade: bool) -> Result<(), OrchestrationError> {
        let lb: LoadBalancer = self.load(lb_id).await?;

        let mut listeners: Vec<Listener> = self
            .repo()
            .list(&Filter::new().eq("load_balancer_id", lb_id))
            .await?;
        listeners.retain(|l| l.provisioning_status != ProvisioningStatus::Deleted);
        let mut pools: Vec<Pool> = self
            .repo()
            .list(&Filter::new().eq("load_balancer_id", lb_id))
            .await?;
        pools.retain(|p| p.provisioning_status != ProvisioningStatus::Deleted);

        if !cascade && (!listeners.is_empty() || !pools.is_empty()) {
            return Err(OrchestrationError::HasChildren {
                id: lb_id.to_string(),
                listeners: listeners.len(),
                pools: pools.len(),
            });
        }

        let flow = self.lb_flows.get_delete_load_balancer_flow(&listeners, &pools);
        let inputs = values([
            (LOADBALANCER, to_value(&lb)?),
            (SERVER_GROUP_ID, json!(lb.server_group_id)),
        ]);
        self.run(&flow, inputs).await?;
        Ok(())
    }

    /// Rebuild every amphora of a load balancer.
    #[instrument(skip(self))]
    pub async fn failover_load_balancer(&self, lb_id: &str) -> Result<LoadBalancer, OrchestrationError> {
        let lb: LoadBalancer = self.load(lb_id).await?;
        let amphorae = self.repo().amphorae_for(lb_id).await?;
        info!(lb_id, amphorae = amphorae.len(), "Failing over load balancer");

        let flow = self.lb_flows.get_failover_lb_flow(&amphorae, &lb);
        let inputs = values([
            (BUILD_TYPE_PRIORITY, json!(LB_CREATE_FAILOVER_PRIORITY)),
            (FLAVOR, topology_flavor(&lb)),
            (LOADBALANCER_ID, json!(lb.id)),
            (LOADBALANCER, to_value(&lb)?),
        ]);

        self.run(&flow, inputs).await?;
        self.load(lb_id).await
    }

    /// Push a freshly rendered agent configuration. Topology comes from the
    /// flavor, else the configured default.
    #[instrument(skip(self, flavor))]
    pub async fn update_amphora_agent_config(
        &self,
        amphora_id: &str,
        flavor: Option<&Flavor>,
    ) -> Result<(), OrchestrationError> {
        let amphora: Amphora = self.load(amphora_id).await?;
        let flavor = flavor.cloned().unwrap_or_default();
        let topology = flavor
            .topology()?
            .unwrap_or(self.config().controller_worker.loadbalancer_topology);

        let flow = self.amp_flows.update_amphora_config_upload_flow();
        let inputs = values([
            (AMPHORA, to_value(&amphora)?),
            (
                FLAVOR,
                to_value(&flavor.with(LOADBALANCER_TOPOLOGY, topology.as_str()))?,
            ),
        ]);
        self.run(&flow, inputs).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn rotate_amphora_cert(&self, amphora_id: &str) -> Result<Amphora, OrchestrationError> {
        let amphora: Amphora = self.load(amphora_id).await?;
        let flow = self.amp_flows.cert_rotate_amphora_flow();
        let inputs = values([
            (AMPHORA_ID, json!(amphora.id)),
            (AMPHORA, to_value(&amphora)?),
        ]);
        self.run(&flow, inputs).await?;
        self.load(amphora_id).await
    }
}

fn values<const N: usize>(pairs: [(&str, Value); N]) -> Values {
    pairs
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect()
}

fn to_value<T: serde::Serialize>(entity: &T) -> Result<Value, OrchestrationError> {
    serde_json::to_value(entity).map_err(|e| OrchestrationError::Store(StoreError::from(e)))
}

/// Flavor carrying the load balancer's own topology, for amphorae built on
/// its behalf.
fn topology_flavor(lb: &LoadBalancer) -> Value {
    json!({ LOADBALANCER_TOPOLOGY: lb.topology.as_str() })
}
