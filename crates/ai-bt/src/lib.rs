//! Behavior Tree runtime built on `ai-core`.
//!
//! Assets ([`BehaviorTreeAsset`]) are compiled once into shared [`TreeTemplate`]s. Each agent owns
//! a [`BehaviorTreeComponent`] that keeps the instance stack, per-instance node memory and the
//! bound blackboard, and re-runs a priority-ordered search whenever a task finishes or a
//! decorator asks for re-evaluation.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![forbid(unsafe_code)]

pub mod asset;
pub mod bt;
pub mod component;
pub mod config;
pub mod error;
mod execution;
pub mod instance;
pub mod logic;
pub mod manager;
pub mod memory;
pub mod node;
pub mod nodes;
pub mod query;
mod search;
pub mod signal;
mod stack;
pub mod template;

pub use asset::{
    AssetId, BehaviorTreeAsset, ChildDef, ChildNode, CompositeDef, DecoratorDef, ServiceDef, TaskDef,
};
pub use bt::{
    ActiveNodeKind, ChildSelection, ExecutionMode, ExecutionState, FlowAbortMode, NodeId, NodeIndex,
    NodeResult, TaskStatus,
};
pub use component::BehaviorTreeComponent;
pub use config::BehaviorTreeConfig;
#[cfg(feature = "serde")]
pub use config::ConfigError;
pub use error::{AssetError, BehaviorTreeError, MemoryError, Result};
pub use instance::{KnownInstance, ParallelTask, TreeInstance};
pub use logic::DecoratorLogic;
pub use manager::TemplateCache;
pub use memory::{InstanceMemory, MemorySlot};
pub use node::{
    ChildShape, Composite, Decorator, Instancing, NodeBehavior, NodeContext, NodeObject, Service, Task,
    TaskTick,
};
pub use nodes::{
    BlackboardCondition, ForceSuccess, KeyQuery, ParallelFinishMode, RunBehavior, RunQuery, Selector,
    Sequence, SimpleParallel, Wait,
};
pub use query::{QueryFinished, QueryId, QueryMode, QueryRequest, QueryResult, QuerySystem};
pub use signal::TaskHandle;
pub use template::{ChildEdge, NodeKind, TemplateNode, TreeTemplate};
