//! Command-line interface for ampctl.
//!
//! Describes the flows the controller builds, runs lifecycle scenarios
//! against the in-memory drivers, and reads flow journals back.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use uuid::Uuid;

use crate::config::{load_config, ResolvedConfig};
use crate::core::{list_executions, Flow, FlowJournal};
use crate::domain::{
    Amphora, AmphoraRole, FlowExecution, Listener, LoadBalancer, Pool, Topology,
};
use crate::flows::{AmphoraFlows, LoadBalancerFlows};

pub mod simulate;

/// ampctl - amphora lifecycle orchestration
#[derive(Parser, Debug)]
#[command(name = "ampctl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the structure and contract of a flow
    Describe {
        flow: FlowKind,

        /// Topology for load balancer flows (defaults to the configured one)
        #[arg(short, long, value_enum)]
        topology: Option<TopologyArg>,

        /// Role of the failed amphora for failover-amphora
        #[arg(short, long, value_enum, default_value = "standalone")]
        role: RoleArg,

        /// Include listener provisioning in create-lb
        #[arg(long)]
        listeners: bool,
    },

    /// Run a lifecycle scenario on the in-memory drivers
    Simulate {
        scenario: simulate::Scenario,

        #[arg(short, long, value_enum)]
        topology: Option<TopologyArg>,

        /// Make a driver operation fail: `op` or `op@target`, optionally
        /// suffixed with `*N` to fail only N times
        #[arg(short, long)]
        fault: Vec<String>,
    },

    /// List journaled flow executions, or show one
    History {
        /// Execution ID (UUID)
        execution_id: Option<String>,
    },

    /// Show resolved configuration
    Config,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum FlowKind {
    CreateAmphora,
    CreateLb,
    FailoverAmphora,
    FailoverLb,
    DeleteAmphora,
    DeleteLb,
    UpdateLb,
    UpdateAgentConfig,
    RotateCert,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum TopologyArg {
    Single,
    ActiveStandby,
}

impl From<TopologyArg> for Topology {
    fn from(t: TopologyArg) -> Self {
        match t {
            TopologyArg::Single => Topology::Single,
            TopologyArg::ActiveStandby => Topology::ActiveStandby,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum RoleArg {
    Master,
    Backup,
    Standalone,
    /// No role: a spare
    Spare,
}

impl From<RoleArg> for Option<AmphoraRole> {
    fn from(r: RoleArg) -> Self {
        match r {
            RoleArg::Master => Some(AmphoraRole::Master),
            RoleArg::Backup => Some(AmphoraRole::Backup),
            RoleArg::Standalone => Some(AmphoraRole::Standalone),
            RoleArg::Spare => None,
        }
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let cfg = load_config()?;
        match self.command {
            Commands::Describe {
                flow,
                topology,
                role,
                listeners,
            } => describe_flow(&cfg, flow, topology, role, listeners),
            Commands::Simulate {
                scenario,
                topology,
                fault,
            } => {
                let topology = topology
                    .map(Topology::from)
                    .unwrap_or(cfg.controller.controller_worker.loadbalancer_topology);
                simulate::run(&cfg, scenario, topology, &fault).await
            }
            Commands::History { execution_id } => match execution_id {
                Some(id) => show_execution(&journal_base(&cfg), &id).await,
                None => list_history(&journal_base(&cfg)).await,
            },
            Commands::Config => show_config(&cfg),
        }
    }
}

/// Where flow journals live: the configured directory, else `<home>/flows`.
pub fn journal_base(cfg: &ResolvedConfig) -> PathBuf {
    cfg.journal_dir
        .clone()
        .unwrap_or_else(|| cfg.home.join("flows"))
}

fn build_flow(
    cfg: &ResolvedConfig,
    kind: FlowKind,
    topology: Topology,
    role: RoleArg,
    listeners: bool,
) -> Flow {
    let config = Arc::new(cfg.controller.clone());
    let lb_flows = LoadBalancerFlows::new(config.clone());
    let amp_flows = AmphoraFlows::new(config);

    let mut sample = Amphora::new("<amphora>");
    sample.role = role.into();
    sample.load_balancer_id = Some("<loadbalancer>".to_string());

    match kind {
        FlowKind::CreateAmphora => amp_flows.get_create_amphora_flow(),
        FlowKind::CreateLb => lb_flows.get_create_load_balancer_flow(topology, listeners),
        FlowKind::FailoverAmphora => {
            amp_flows.get_failover_amphora_flow(&sample, topology.amphora_count())
        }
        FlowKind::FailoverLb => {
            let lb = LoadBalancer::new("<loadbalancer>", topology);
            lb_flows.get_failover_lb_flow(&[sample], &lb)
        }
        FlowKind::DeleteAmphora => amp_flows.get_delete_amphora_flow(&sample),
        FlowKind::DeleteLb => lb_flows.get_delete_load_balancer_flow(
            &[Listener::new("<listener>", "<loadbalancer>")],
            &[Pool::new("<pool>", "<loadbalancer>")],
        ),
        FlowKind::UpdateLb => lb_flows.get_update_load_balancer_flow(),
        FlowKind::UpdateAgentConfig => amp_flows.update_amphora_config_upload_flow(),
        FlowKind::RotateCert => amp_flows.cert_rotate_amphora_flow(),
    }
}

fn describe_flow(
    cfg: &ResolvedConfig,
    kind: FlowKind,
    topology: Option<TopologyArg>,
    role: RoleArg,
    listeners: bool,
) -> Result<()> {
    let topology = topology
        .map(Topology::from)
        .unwrap_or(cfg.controller.controller_worker.loadbalancer_topology);
    let flow = build_flow(cfg, kind, topology, role, listeners);

    for line in flow.outline() {
        println!("{}", line);
    }
    println!();

    let requires = flow.requires();
    let provides = flow.provides();
    println!("Requires ({}):", requires.len());
    for name in &requires {
        println!("  {}", name);
    }
    println!("Provides ({}):", provides.len());
    for name in &provides {
        println!("  {}", name);
    }

    Ok(())
}

async fn list_history(base: &Path) -> Result<()> {
    let ids = list_executions(base).await?;
    if ids.is_empty() {
        println!("No flow executions found in {}", base.display());
        return Ok(());
    }

    println!("{:<38} {:<40} {:<10}", "EXECUTION ID", "FLOW", "STATE");
    println!("{}", "-".repeat(90));

    for id in ids {
        let journal = FlowJournal::open(base, id).await?;
        match journal.execution().await? {
            Some(execution) => println!(
                "{:<38} {:<40} {:<10}",
                id,
                execution.flow_name,
                format!("{:?}", execution.state).to_lowercase()
            ),
            None => println!("{:<38} (empty journal)", id),
        }
    }

    Ok(())
}

async fn show_execution(base: &Path, id: &str) -> Result<()> {
    let execution_id =
        Uuid::parse_str(id).with_context(|| format!("Invalid execution ID: {}", id))?;
    if !base.join(execution_id.to_string()).is_dir() {
        anyhow::bail!("No journal for execution {}", execution_id);
    }
    let journal = FlowJournal::open(base, execution_id).await?;
    let execution = journal
        .execution()
        .await?
        .with_context(|| format!("No journal for execution {}", execution_id))?;

    print_execution(&execution);
    Ok(())
}

pub(crate) fn print_execution(execution: &FlowExecution) {
    println!("Execution ID: {}", execution.id);
    println!("Flow: {}", execution.flow_name);
    println!("State: {:?}", execution.state);
    println!("Started: {}", execution.started_at);
    if let Some(completed) = execution.completed_at {
        println!("Completed: {}", completed);
    }
    println!("Task executions: {}", execution.executions);
    if let Some(error) = &execution.error {
        println!("Error: {}", error);
    }
    if !execution.decisions.is_empty() {
        println!("\nBranch decisions:");
        for decision in &execution.decisions {
            println!("  {}", decision);
        }
    }
    if !execution.isolated.is_empty() {
        println!("\nIsolated failures:");
        for node in &execution.isolated {
            println!("  {}", node);
        }
    }
    if !execution.reverted.is_empty() {
        println!("\nReverted (in order):");
        for node in &execution.reverted {
            println!("  {}", node);
        }
    }
    println!("\nTask states:");
    for (node, state) in &execution.task_states {
        println!("  {}: {:?}", node, state);
    }
}

fn show_config(cfg: &ResolvedConfig) -> Result<()> {
    let worker = &cfg.controller.controller_worker;
    let haproxy = &cfg.controller.haproxy_amphora;

    println!("ampctl configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:     {}", cfg.home.display());
    println!("  Journals: {}", journal_base(cfg).display());
    println!();
    println!("Controller worker:");
    println!("  Topology:         {}", worker.loadbalancer_topology);
    println!("  Image tag:        {}", worker.amp_image_tag);
    println!("  Compute flavor:   {}", worker.amp_flavor_id);
    println!("  Boot networks:    {}", worker.amp_boot_network_list.join(", "));
    println!(
        "  Active wait:      {} x {}s",
        worker.amp_active_retries, worker.amp_active_wait_sec
    );
    println!(
        "  Anti-affinity:    {} ({})",
        worker.enable_anti_affinity, worker.anti_affinity_policy
    );
    println!();
    println!("Amphora agent:");
    println!("  Endpoint:         {}://<amphora>:{}", haproxy.agent_scheme, haproxy.bind_port);
    println!(
        "  Connection wait:  {} x {}s (failover: {} x {}s)",
        haproxy.connection_max_retries,
        haproxy.connection_retry_interval,
        haproxy.active_connection_max_retries,
        haproxy.active_connection_retry_interval
    );
    println!();
    println!("Task retry:");
    println!("  Max attempts:     {}", cfg.controller.task_retry.max_attempts);
    println!("  Initial delay:    {}ms", cfg.controller.task_retry.initial_delay_ms);

    Ok(())
}
