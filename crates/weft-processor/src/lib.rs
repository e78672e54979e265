//! Weft Processor
//!
//! The live side of a workflow. The [`build`] function compiles a
//! [`WorkflowGraph`](weft_model::WorkflowGraph) into a tree of
//! [`WorkflowProcessor`]s, one per graph node, every node starting in
//! [`StateKind::Loaded`]. The scheduler in `weft-engine` then drives the tree
//! through its lifecycle using the pieces in this crate:
//!
//! - [`quorum`] decides composite outcomes from child outcomes
//! - [`evaluate_condition`] reduces a condition sub-tree to a boolean
//! - [`reconcile`] repairs a tree loaded after a restart
//!
//! Task and condition implementations are looked up by key in an
//! [`ExecutionTypeRegistry`]; the builder validates every key up front so an
//! unresolvable class rejects the whole build.

mod builder;
mod condition;
mod error;
mod info;
mod processor;
pub mod quorum;
mod reconcile;
mod registry;
mod state;

pub use builder::build;
pub use condition::evaluate_condition;
pub use error::{ConfigurationError, FailureCause};
pub use info::ProcessorInfo;
pub use processor::{LOCAL_KEYS, ProcessorKind, WorkflowProcessor};
pub use quorum::{QuorumStatus, QuorumTally};
pub use reconcile::{RESET_MESSAGE, reconcile};
pub use registry::{
  ConditionInstance, ExecutionType, ExecutionTypeRegistry, InstanceError, TaskInstance,
};
pub use state::{StateKind, WorkflowState};
