//! Core data model: Run, Plan, NodeSpec/NodeState, Event, Checkpoint.

pub mod checkpoint;
pub mod event;
pub mod node_state;
pub mod plan;
pub mod run;

pub use checkpoint::CheckpointInput;
pub use event::{Event, EventInput, EventType};
pub use node_state::{NodeState, NodeStatus};
pub use plan::{
    ConditionalBranch, ConditionalConfig, ConditionalType, ControlFlow, EdgeSpec, ForEachConfig,
    NodeSpec, NodeType, Plan, SubflowConfig,
};
pub use run::{Run, RunMode, RunStatus};
