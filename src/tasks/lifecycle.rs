//! Guards placed first in a flow: no work on execute, ERROR marking on revert.

use async_trait::async_trait;

use super::{mark_amphora_error, mark_lb_error};
use crate::core::{Outcome, Task, TaskArgs, TaskContext, TaskError, TaskOutputs};
use crate::domain::constants::{AMPHORA, LOADBALANCER, LOADBALANCER_ID};
use crate::domain::{Amphora, LoadBalancer};

/// Marks the load balancer ERROR when the flow rolls back. A null id (a
/// spare amphora has no load balancer) makes it a no-op.
pub struct LoadBalancerIdToErrorOnRevert;

#[async_trait]
impl Task for LoadBalancerIdToErrorOnRevert {
    fn name(&self) -> &str {
        "lb-id-to-error-on-revert"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![LOADBALANCER_ID]
    }

    async fn execute(&self, _ctx: &TaskContext, _args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        Ok(TaskOutputs::none())
    }

    async fn revert(&self, ctx: &TaskContext, args: &TaskArgs, _: &Outcome) -> Result<(), TaskError> {
        if let Some(id) = args.optional::<String>(LOADBALANCER_ID)? {
            mark_lb_error(ctx, &id).await;
        }
        Ok(())
    }
}

pub struct LoadBalancerToErrorOnRevert;

#[async_trait]
impl Task for LoadBalancerToErrorOnRevert {
    fn name(&self) -> &str {
        "lb-to-error-on-revert"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![LOADBALANCER]
    }

    async fn execute(&self, _ctx: &TaskContext, _args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        Ok(TaskOutputs::none())
    }

    async fn revert(&self, ctx: &TaskContext, args: &TaskArgs, _: &Outcome) -> Result<(), TaskError> {
        let lb: LoadBalancer = args.get(LOADBALANCER)?;
        mark_lb_error(ctx, &lb.id).await;
        Ok(())
    }
}

pub struct AmphoraToErrorOnRevert;

#[async_trait]
impl Task for AmphoraToErrorOnRevert {
    fn name(&self) -> &str {
        "amphora-to-error-on-revert"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![AMPHORA]
    }

    async fn execute(&self, _ctx: &TaskContext, _args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        Ok(TaskOutputs::none())
    }

    async fn revert(&self, ctx: &TaskContext, args: &TaskArgs, _: &Outcome) -> Result<(), TaskError> {
        let amphora: Amphora = args.get(AMPHORA)?;
        mark_amphora_error(ctx, &amphora.id).await;
        Ok(())
    }
}
