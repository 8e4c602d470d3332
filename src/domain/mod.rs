//! Domain types for amphora orchestration.
//!
//! Persisted entities, the remote resources tasks pass around, the names
//! tasks use to exchange values, and the flow journal.

pub mod constants;
pub mod events;
pub mod execution;
pub mod models;
pub mod resources;

pub use events::{FlowEvent, FlowEventType, TaskState};
pub use execution::{FlowExecution, FlowState};
pub use models::{
    Amphora, AmphoraRole, AmphoraStatus, Flavor, InvalidTopology, Listener, LoadBalancer,
    OperatingStatus, Pool, ProvisioningStatus, Topology, Vip,
};
pub use resources::{
    AddedPorts, AgentTimeouts, AmphoraNetworkConfig, ComputeInstance, ComputeStatus, FixedIp,
    Interface, NetworkConfigs, NetworkDelta, Nic, Port, ServerCertificate, Subnet,
};
