//! Umbrella crate that re-exports the behavior tree runtime and the crates it is built on.
//!
//! `ai::core` holds the blackboard and memory packing, `ai::bt` the tree engine, and
//! `ai::tools` the trace sinks the engine reports into. [`prelude`] pulls in what a typical
//! agent setup touches.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![forbid(unsafe_code)]

#[cfg(feature = "core")]
#[cfg_attr(docsrs, doc(cfg(feature = "core")))]
pub use ai_core as core;

#[cfg(feature = "tools")]
#[cfg_attr(docsrs, doc(cfg(feature = "tools")))]
pub use ai_tools as tools;

#[cfg(feature = "bt")]
#[cfg_attr(docsrs, doc(cfg(feature = "bt")))]
pub use ai_bt as bt;

pub mod prelude {
    #[cfg(feature = "core")]
    pub use ai_core::{Blackboard, BlackboardSchema, KeyType, TickContext};

    #[cfg(feature = "bt")]
    pub use ai_bt::{
        BehaviorTreeAsset, BehaviorTreeComponent, BehaviorTreeConfig, ChildDef, CompositeDef,
        Decorator, DecoratorDef, ExecutionMode, FlowAbortMode, NodeBehavior, NodeContext, NodeResult,
        Service, ServiceDef, Task, TaskDef,
    };

    #[cfg(feature = "tools")]
    pub use ai_tools::{SharedTraceLog, TraceSink};
}

#[cfg(doc)]
pub mod guides {
    #![allow(clippy::all)]

    #[doc = include_str!("../../../docs/guides/bt-tracing.md")]
    pub mod tracing {}
}
