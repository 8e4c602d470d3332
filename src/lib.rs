//! ampctl - amphora lifecycle orchestration
//!
//! Builds and runs the compensating workflows that create, fail over and
//! delete amphorae and the load balancers they back.
//!
//! # Architecture
//!
//! Every lifecycle operation is a flow of small tasks:
//! - Each task declares the named values it requires and provides
//! - Flows compose tasks, nested subflows and runtime branches
//! - A task that fails for good reverts every completed task, newest first
//! - Best-effort tasks mark their amphora ERROR and let the flow continue
//! - Every state change is journaled as an immutable event
//!
//! # Modules
//!
//! - `adapters`: Compute, network, agent and certificate collaborators
//! - `core`: Task primitive, flows, engine, journal and the orchestrator
//! - `domain`: Entities, remote resources, journal events
//! - `flows`: Flow builders per lifecycle operation
//! - `store`: Repository contract and the in-memory store
//! - `tasks`: The concrete tasks
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Show what a flow requires and provides
//! ampctl describe failover-amphora --role master
//!
//! # Run a scenario on the noop drivers with an injected fault
//! ampctl simulate failover-lb --topology active-standby --fault start_vrrp_service
//!
//! # Inspect a journaled execution
//! ampctl history <execution-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod flows;
pub mod store;
pub mod tasks;

// Re-export main types at crate root for convenience
pub use config::ControllerConfig;
pub use core::{Flow, FlowEngine, FlowError, OrchestrationError, Orchestrator, TaskContext};
pub use domain::{Amphora, AmphoraRole, FlowExecution, FlowState, LoadBalancer, Topology};
pub use flows::{AmphoraFlows, LoadBalancerFlows};
pub use store::{MemoryStore, Repository};
