//! Sandbox scenarios: lifecycle operations on the noop drivers and an
//! in-memory store, journaled like real executions.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::ValueEnum;

use super::{journal_base, print_execution};
use crate::adapters::{AdapterError, Fault, NoopDrivers};
use crate::config::ResolvedConfig;
use crate::core::{OrchestrationError, Orchestrator};
use crate::domain::{Amphora, Listener, LoadBalancer, Pool, Topology};
use crate::store::{MemoryStore, Repository};

const SIM_LB: &str = "lb-sim";

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Scenario {
    /// Boot a spare amphora
    CreateAmphora,
    /// Provision a load balancer with one listener
    CreateLb,
    /// Provision, then fail over its first amphora
    FailoverAmphora,
    /// Provision, then fail over the whole load balancer
    FailoverLb,
    /// Provision, then cascade-delete it
    DeleteLb,
}

/// Parse `op`, `op@target`, `op*N` or `op@target*N`.
pub fn parse_fault(spec: &str) -> Result<Fault> {
    let (rest, times) = match spec.split_once('*') {
        Some((rest, n)) => (
            rest,
            Some(
                n.parse::<u32>()
                    .with_context(|| format!("Invalid fault count in '{}'", spec))?,
            ),
        ),
        None => (spec, None),
    };
    let (op, target) = match rest.split_once('@') {
        Some((op, target)) => (op, Some(target)),
        None => (rest, None),
    };
    if op.is_empty() {
        bail!("Fault '{}' names no operation", spec);
    }

    let mut fault = Fault::new(op, AdapterError::Connection(format!("injected fault on {}", op)));
    if let Some(target) = target {
        fault = fault.on(target);
    }
    if let Some(times) = times {
        fault = fault.times(times);
    }
    Ok(fault)
}

pub async fn run(
    cfg: &ResolvedConfig,
    scenario: Scenario,
    topology: Topology,
    faults: &[String],
) -> Result<()> {
    let faults = faults
        .iter()
        .map(|spec| parse_fault(spec))
        .collect::<Result<Vec<_>>>()?;

    let drivers = NoopDrivers::new();
    let repo: Arc<dyn Repository> = Arc::new(MemoryStore::new());
    let ctx = drivers.context(repo.clone(), Arc::new(cfg.controller.clone()));
    let journal_dir = journal_base(cfg);
    let orchestrator = Orchestrator::new(ctx).with_journal_dir(&journal_dir);

    if !matches!(scenario, Scenario::CreateAmphora) {
        let lb = LoadBalancer::new(SIM_LB, topology);
        repo.insert(&lb).await?;
        repo.insert(&Listener::new("listener-sim", SIM_LB)).await?;
        repo.insert(&Pool::new("pool-sim", SIM_LB)).await?;
    }

    // Setup runs clean; faults apply to the operation under test.
    if !matches!(scenario, Scenario::CreateAmphora | Scenario::CreateLb) {
        orchestrator.create_load_balancer(SIM_LB, None, true).await?;
    }
    for fault in faults {
        drivers.recorder.inject(fault);
    }

    let outcome = match scenario {
        Scenario::CreateAmphora => orchestrator.create_amphora(None).await.map(|amp| {
            println!("Created amphora {} ({:?})", amp.id, amp.status);
        }),
        Scenario::CreateLb => orchestrator
            .create_load_balancer(SIM_LB, None, true)
            .await
            .map(|lb| println!("Load balancer {} is {:?}", lb.id, lb.provisioning_status)),
        Scenario::FailoverAmphora => {
            let amphorae = repo.amphorae_for(SIM_LB).await?;
            let Some(failed) = amphorae.first() else {
                bail!("Load balancer {} has no amphorae", SIM_LB);
            };
            orchestrator.failover_amphora(&failed.id).await.map(|replacement| {
                match replacement {
                    Some(amp) => println!("Amphora {} replaced by {}", failed.id, amp.id),
                    None => println!("Amphora {} was not replaced", failed.id),
                }
            })
        }
        Scenario::FailoverLb => orchestrator
            .failover_load_balancer(SIM_LB)
            .await
            .map(|lb| println!("Load balancer {} is {:?}", lb.id, lb.provisioning_status)),
        Scenario::DeleteLb => orchestrator
            .delete_load_balancer(SIM_LB, true)
            .await
            .map(|()| println!("Load balancer {} deleted", SIM_LB)),
    };

    if !matches!(scenario, Scenario::CreateAmphora) {
        print_amphorae(&repo.amphorae_for(SIM_LB).await?);
    }
    println!("\nDriver calls: {}", drivers.recorder.calls().len());
    println!("Journals: {}", journal_dir.display());

    match outcome {
        Ok(()) => Ok(()),
        Err(OrchestrationError::Flow(e)) => {
            if let Some(execution) = e.execution() {
                println!();
                print_execution(execution);
            }
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}

fn print_amphorae(amphorae: &[Amphora]) {
    println!("\nAmphorae of {}:", SIM_LB);
    if amphorae.is_empty() {
        println!("  (none)");
    }
    for amp in amphorae {
        println!(
            "  {} role={} status={:?}",
            amp.id,
            amp.role.as_ref().map(|r| r.as_str()).unwrap_or("-"),
            amp.status
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fault_variants() {
        let plain = parse_fault("plug_aap_port").unwrap();
        assert_eq!(plain.op, "plug_aap_port");
        assert!(plain.target.is_none());
        assert!(plain.remaining.is_none());

        let targeted = parse_fault("start_vrrp_service@amp-1*2").unwrap();
        assert_eq!(targeted.op, "start_vrrp_service");
        assert_eq!(targeted.target.as_deref(), Some("amp-1"));
        assert_eq!(targeted.remaining, Some(2));
        assert!(targeted.error.is_transient());
    }

    #[test]
    fn test_parse_fault_rejects_garbage() {
        assert!(parse_fault("@amp-1").is_err());
        assert!(parse_fault("provision*many").is_err());
    }
}
