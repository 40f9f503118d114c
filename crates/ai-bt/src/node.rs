//! Node behavior traits and the context handed to every hook.
//!
//! Behaviors are shared by every component running a template, so hooks take `&self`; per-agent
//! state lives in node memory ([`NodeContext::read_memory`]) or, for nodes reporting
//! [`Instancing::Instanced`], in a per-component object created by `instantiate`.

use std::mem::size_of;
use std::sync::mpsc::Sender;
use std::sync::Arc;

use ai_core::{Blackboard, KeyId, KeyRef, KeySelector, ObserverResult};
use bytemuck::Pod;

use crate::asset::BehaviorTreeAsset;
use crate::bt::{ChildSelection, NodeId, NodeIndex, NodeResult, TaskStatus};
use crate::instance::TreeInstance;
use crate::query::QuerySystem;
use crate::signal::{observer_owner, EngineSignal, TaskHandle};
use crate::template::{TemplateNode, TreeTemplate};

/// Whether a node keeps one behavior object for every agent or one per component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Instancing {
    #[default]
    Shared,
    Instanced,
}

/// Capabilities common to every node kind.
pub trait NodeBehavior: Send + Sync + 'static {
    /// Bytes of per-instance memory this node reads through [`NodeContext`].
    fn instance_memory_size(&self) -> usize {
        0
    }

    fn instancing(&self) -> Instancing {
        Instancing::Shared
    }

    /// Blackboard keys this node reads. Every template resolves them against its own schema;
    /// read the ids back with [`NodeContext::blackboard_key`].
    fn blackboard_keys(&self) -> &[KeySelector] {
        &[]
    }
}

/// Result of a task tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskTick {
    Running,
    Finished(NodeResult),
}

pub trait Task: NodeBehavior {
    fn execute(&self, ctx: &mut NodeContext<'_>) -> NodeResult;

    /// Returning `InProgress` makes the abort latent; finish it later through a handle or by
    /// returning `TaskTick::Finished` from `tick`.
    fn abort(&self, _ctx: &mut NodeContext<'_>) -> NodeResult {
        NodeResult::Aborted
    }

    fn tick(&self, _ctx: &mut NodeContext<'_>, _dt_seconds: f32) -> TaskTick {
        TaskTick::Running
    }

    /// Subtree this task runs; its root decorators are injected onto the task's edge.
    fn injected_subtree(&self) -> Option<Arc<BehaviorTreeAsset>> {
        None
    }

    fn instantiate(&self) -> Option<Arc<dyn Task>> {
        None
    }
}

pub trait Decorator: NodeBehavior {
    fn calculate_raw_condition(&self, _ctx: &mut NodeContext<'_>) -> bool {
        true
    }

    fn on_become_relevant(&self, _ctx: &mut NodeContext<'_>) {}

    fn on_cease_relevant(&self, _ctx: &mut NodeContext<'_>) {}

    fn tick(&self, _ctx: &mut NodeContext<'_>, _dt_seconds: f32) {}

    fn on_node_activation(&self, _ctx: &mut NodeContext<'_>) {}

    fn on_node_deactivation(&self, _ctx: &mut NodeContext<'_>, _result: &mut NodeResult) {}

    /// The guarded child was skipped because the edge's condition failed.
    fn on_node_processed(&self, _ctx: &mut NodeContext<'_>, _result: &mut NodeResult) {}

    /// An observed blackboard key changed. Return `true` to re-evaluate the guarded branch.
    fn on_blackboard_change(&self, _ctx: &mut NodeContext<'_>, _key: KeyId) -> bool {
        true
    }

    fn instantiate(&self) -> Option<Arc<dyn Decorator>> {
        None
    }
}

pub trait Service: NodeBehavior {
    fn on_become_relevant(&self, _ctx: &mut NodeContext<'_>) {}

    fn on_cease_relevant(&self, _ctx: &mut NodeContext<'_>) {}

    /// Called once per service interval with the time elapsed since the previous call.
    fn tick(&self, _ctx: &mut NodeContext<'_>, _elapsed_seconds: f32) {}

    fn instantiate(&self) -> Option<Arc<dyn Service>> {
        None
    }
}

/// Shape of a child as seen by [`Composite::validate_children`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildShape {
    Composite,
    Task,
}

pub trait Composite: NodeBehavior {
    /// Picks the next child. `previous` is `None` when the composite was just entered.
    fn next_child(
        &self,
        ctx: &mut NodeContext<'_>,
        previous: Option<usize>,
        last_result: NodeResult,
    ) -> ChildSelection;

    fn validate_children(&self, _children: &[ChildShape]) -> Result<(), String> {
        Ok(())
    }

    fn can_push_subtree(&self, _ctx: &mut NodeContext<'_>, _child_index: usize) -> bool {
        true
    }

    fn on_node_activation(&self, _ctx: &mut NodeContext<'_>) {}

    fn on_node_deactivation(&self, _ctx: &mut NodeContext<'_>, _result: &mut NodeResult) {}

    fn on_node_restart(&self, _ctx: &mut NodeContext<'_>) {}

    /// A child task reported a result (including `InProgress`).
    fn on_child_execution(
        &self,
        _ctx: &mut NodeContext<'_>,
        _child_index: usize,
        _result: &mut NodeResult,
    ) {
    }

    fn instantiate(&self) -> Option<Arc<dyn Composite>> {
        None
    }
}

/// A node behavior of any kind.
#[derive(Clone)]
pub enum NodeObject {
    Composite(Arc<dyn Composite>),
    Task(Arc<dyn Task>),
    Decorator(Arc<dyn Decorator>),
    Service(Arc<dyn Service>),
}

macro_rules! each_behavior {
    ($object:expr, $node:ident => $body:expr) => {
        match $object {
            NodeObject::Composite($node) => $body,
            NodeObject::Task($node) => $body,
            NodeObject::Decorator($node) => $body,
            NodeObject::Service($node) => $body,
        }
    };
}

impl NodeObject {
    pub fn instance_memory_size(&self) -> usize {
        each_behavior!(self, n => n.instance_memory_size())
    }

    pub fn instancing(&self) -> Instancing {
        each_behavior!(self, n => n.instancing())
    }

    pub fn blackboard_keys(&self) -> &[KeySelector] {
        each_behavior!(self, n => n.blackboard_keys())
    }

    pub(crate) fn instantiate(&self) -> Option<NodeObject> {
        match self {
            NodeObject::Composite(n) => n.instantiate().map(NodeObject::Composite),
            NodeObject::Task(n) => n.instantiate().map(NodeObject::Task),
            NodeObject::Decorator(n) => n.instantiate().map(NodeObject::Decorator),
            NodeObject::Service(n) => n.instantiate().map(NodeObject::Service),
        }
    }

    pub fn as_composite(&self) -> Option<&Arc<dyn Composite>> {
        match self {
            NodeObject::Composite(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_task(&self) -> Option<&Arc<dyn Task>> {
        match self {
            NodeObject::Task(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_decorator(&self) -> Option<&Arc<dyn Decorator>> {
        match self {
            NodeObject::Decorator(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_service(&self) -> Option<&Arc<dyn Service>> {
        match self {
            NodeObject::Service(n) => Some(n),
            _ => None,
        }
    }
}

/// Deferred requests a hook makes of the engine, applied after the hook returns.
pub(crate) enum NodeEffect {
    ObserveTask { request_id: u32 },
    PushSubtree(Arc<BehaviorTreeAsset>),
    RequestExecution {
        child_index: Option<usize>,
        result: NodeResult,
    },
    RequestByDecorator,
    RegisterParallelTask(usize),
    UnregisterParallelTask(usize),
    RemoveParallelTaskOnExit(usize),
}

/// Everything a node hook may touch while it runs.
pub struct NodeContext<'a> {
    pub(crate) template: &'a TreeTemplate,
    pub(crate) node: NodeId,
    pub(crate) instance: u16,
    pub(crate) instance_serial: u32,
    pub(crate) memory: &'a mut [u8],
    pub(crate) blackboard: &'a mut Blackboard,
    pub(crate) stack: &'a [TreeInstance],
    pub(crate) signals: &'a Sender<EngineSignal>,
    pub(crate) next_request_id: &'a mut u32,
    pub(crate) query: Option<&'a mut (dyn QuerySystem + 'static)>,
    pub(crate) effects: &'a mut Vec<NodeEffect>,
    pub(crate) restart_pending: bool,
    pub(crate) tick: u64,
}

impl<'a> NodeContext<'a> {
    pub fn node_id(&self) -> NodeId {
        self.node
    }

    pub fn node_index(&self) -> NodeIndex {
        NodeIndex::new(self.instance, self.node)
    }

    pub fn node(&self) -> &TemplateNode {
        self.template.node(self.node)
    }

    pub fn node_name(&self) -> &str {
        self.template.node(self.node).name()
    }

    pub fn template(&self) -> &TreeTemplate {
        self.template
    }

    pub fn current_tick(&self) -> u64 {
        self.tick
    }

    pub fn blackboard(&self) -> &Blackboard {
        &*self.blackboard
    }

    pub fn blackboard_mut(&mut self) -> &mut Blackboard {
        &mut *self.blackboard
    }

    /// Id of this node's `slot`-th [`NodeBehavior::blackboard_keys`] entry as resolved by the
    /// template. Trees without a schema fall back to a lookup by name in the bound blackboard.
    pub fn blackboard_key(&self, slot: usize) -> Option<KeyId> {
        let node = self.template.node(self.node);
        if let Some(id) = node.resolved_key(slot) {
            return Some(id);
        }
        if self.template.blackboard_schema().is_some() {
            return None;
        }
        let selector = node.object().blackboard_keys().get(slot)?;
        match self.blackboard.schema() {
            Some(schema) => selector.resolve(schema),
            None => None,
        }
    }

    /// Copy of the node's memory as `M`. Zeroed (and logged) when `M` exceeds the declared size.
    pub fn read_memory<M: Pod>(&self) -> M {
        match self.memory.get(..size_of::<M>()) {
            Some(bytes) => bytemuck::pod_read_unaligned(bytes),
            None => {
                tracing::error!(
                    node = %self.node_name(),
                    requested = size_of::<M>(),
                    declared = self.memory.len(),
                    "node memory read exceeds declared size"
                );
                M::zeroed()
            }
        }
    }

    pub fn write_memory<M: Pod>(&mut self, value: M) {
        let declared = self.memory.len();
        match self.memory.get_mut(..size_of::<M>()) {
            Some(bytes) => bytes.copy_from_slice(bytemuck::bytes_of(&value)),
            None => tracing::error!(
                requested = size_of::<M>(),
                declared,
                "node memory write exceeds declared size"
            ),
        }
    }

    pub fn update_memory<M: Pod, R>(&mut self, f: impl FnOnce(&mut M) -> R) -> R {
        let mut value = self.read_memory::<M>();
        let out = f(&mut value);
        self.write_memory(value);
        out
    }

    /// Handle used to finish a latent task (or a latent abort) later.
    pub fn latent_handle(&mut self) -> TaskHandle {
        *self.next_request_id = self.next_request_id.wrapping_add(1);
        let request_id = *self.next_request_id;
        self.effects.push(NodeEffect::ObserveTask { request_id });
        TaskHandle::new(request_id, self.signals.clone())
    }

    /// Runs `asset` as a subtree once this task's `execute` returns `InProgress`.
    pub fn push_subtree(&mut self, asset: Arc<BehaviorTreeAsset>) {
        self.effects.push(NodeEffect::PushSubtree(asset));
    }

    /// Notifies this decorator's `on_blackboard_change` whenever `key` changes.
    pub fn observe_blackboard_key<'k>(&mut self, key: impl Into<KeyRef<'k>>) -> bool {
        let owner = observer_owner(self.instance_serial, self.node);
        let sender = self.signals.clone();
        self.blackboard
            .register_observer(
                key,
                owner,
                Box::new(move |key| {
                    match sender.send(EngineSignal::BlackboardChanged { owner, key }) {
                        Ok(()) => ObserverResult::Keep,
                        Err(_) => ObserverResult::Remove,
                    }
                }),
            )
            .is_some()
    }

    pub fn stop_observing_blackboard(&mut self) {
        self.blackboard
            .unregister_observers_from(observer_owner(self.instance_serial, self.node));
    }

    pub fn query_system(&mut self) -> Option<&mut (dyn QuerySystem + 'static)> {
        self.query.as_deref_mut()
    }

    /// True when an execution request is waiting to be processed.
    pub fn is_restart_pending(&self) -> bool {
        self.restart_pending
    }

    pub fn child_count(&self) -> usize {
        self.template.children(self.node).len()
    }

    /// Status of the task on child edge `child_index` of this composite.
    pub fn child_task_status(&self, child_index: usize) -> TaskStatus {
        let Some(edge) = self.template.children(self.node).get(child_index) else {
            return TaskStatus::Inactive;
        };
        match self.stack.get(self.instance as usize) {
            Some(instance) => instance.task_status(edge.node),
            None => TaskStatus::Inactive,
        }
    }

    /// Asks the engine to continue from this composite (or re-check this decorator's branch).
    pub fn request_execution(&mut self, child_index: Option<usize>, result: NodeResult) {
        self.effects.push(NodeEffect::RequestExecution {
            child_index,
            result,
        });
    }

    /// Decorator-side flow abort request, as if an observed key changed.
    pub fn request_branch_evaluation(&mut self) {
        self.effects.push(NodeEffect::RequestByDecorator);
    }

    pub fn register_parallel_task(&mut self, child_index: usize) {
        self.effects.push(NodeEffect::RegisterParallelTask(child_index));
    }

    pub fn unregister_parallel_task(&mut self, child_index: usize) {
        self.effects.push(NodeEffect::UnregisterParallelTask(child_index));
    }

    /// Queues removal (and abort) of a parallel task as part of the current search.
    pub fn remove_parallel_task(&mut self, child_index: usize) {
        self.effects.push(NodeEffect::RemoveParallelTaskOnExit(child_index));
    }
}
