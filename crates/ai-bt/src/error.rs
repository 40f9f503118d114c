use thiserror::Error;

use crate::bt::NodeId;

/// Problems found while compiling an asset into a template.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AssetError {
    #[error("behavior tree '{0}' has no root composite")]
    MissingRoot(String),
    #[error("behavior tree '{asset}' has {count} nodes, more than an execution index can address")]
    TooManyNodes { asset: String, count: usize },
    #[error("composite '{node}' in '{asset}' rejected its children: {reason}")]
    InvalidComposite {
        asset: String,
        node: String,
        reason: String,
    },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("node memory access of {len} bytes at {offset} exceeds slot of {slot} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        slot: usize,
    },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BehaviorTreeError {
    #[error(transparent)]
    Asset(#[from] AssetError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error("instance index {0} is not on the instance stack")]
    InvalidInstance(u16),
    #[error("node {node} does not exist in instance {instance}")]
    InvalidNode { instance: u16, node: NodeId },
    #[error("blackboard is not compatible with schema '{schema}' required by '{asset}'")]
    IncompatibleSchema { asset: String, schema: String },
    #[error("composite '{composite}' does not allow pushing subtree '{asset}'")]
    SubtreeRejected { asset: String, composite: String },
    #[error("instance stack limit of {0} reached")]
    InstanceDepthExceeded(usize),
    #[error("behavior tree execution is disabled by configuration")]
    UsageDisabled,
}

pub type Result<T> = std::result::Result<T, BehaviorTreeError>;
