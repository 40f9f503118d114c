//! Built-in composites, tasks and decorators.

use std::sync::Arc;

use ai_core::{KeySelector, KeyType};
use bytemuck::{Pod, Zeroable};

use crate::asset::BehaviorTreeAsset;
use crate::bt::{ChildSelection, NodeResult, TaskStatus};
use crate::node::{ChildShape, Composite, Decorator, NodeBehavior, NodeContext, Task, TaskTick};
use crate::query::{QueryFinished, QueryId, QueryMode, QueryRequest};

/// Runs children in order until one fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sequence;

impl NodeBehavior for Sequence {}

impl Composite for Sequence {
    fn next_child(
        &self,
        ctx: &mut NodeContext<'_>,
        previous: Option<usize>,
        last_result: NodeResult,
    ) -> ChildSelection {
        let next = match previous {
            None => 0,
            Some(_) if last_result != NodeResult::Succeeded => return ChildSelection::ReturnToParent,
            Some(i) => i + 1,
        };
        if next < ctx.child_count() {
            ChildSelection::Child(next)
        } else {
            ChildSelection::ReturnToParent
        }
    }
}

/// Runs children in order until one succeeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct Selector;

impl NodeBehavior for Selector {}

impl Composite for Selector {
    fn next_child(
        &self,
        ctx: &mut NodeContext<'_>,
        previous: Option<usize>,
        last_result: NodeResult,
    ) -> ChildSelection {
        let next = match previous {
            None => 0,
            Some(_) if last_result != NodeResult::Failed => return ChildSelection::ReturnToParent,
            Some(i) => i + 1,
        };
        if next < ctx.child_count() {
            ChildSelection::Child(next)
        } else {
            ChildSelection::ReturnToParent
        }
    }
}

// ---------------------------------------------------------------------------------------------
// Simple parallel

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParallelFinishMode {
    /// The background branch is aborted as soon as the main task finishes.
    #[default]
    AbortBackground,
    /// The composite finishes once the background branch is done as well.
    WaitForBackground,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
struct ParallelMemory {
    main_result: u8,
    main_active: u8,
    background_done: u8,
    _pad: u8,
}

const MAIN_TASK: usize = 0;
const BACKGROUND: usize = 1;

/// Runs a main task (child 0) alongside a background branch (child 1).
///
/// The composite's result is the main task's result.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimpleParallel {
    pub finish_mode: ParallelFinishMode,
}

impl SimpleParallel {
    pub fn new(finish_mode: ParallelFinishMode) -> Self {
        Self { finish_mode }
    }
}

impl NodeBehavior for SimpleParallel {
    fn instance_memory_size(&self) -> usize {
        std::mem::size_of::<ParallelMemory>()
    }
}

impl Composite for SimpleParallel {
    fn next_child(
        &self,
        ctx: &mut NodeContext<'_>,
        previous: Option<usize>,
        _last_result: NodeResult,
    ) -> ChildSelection {
        let memory: ParallelMemory = ctx.read_memory();
        match previous {
            None => ChildSelection::Child(MAIN_TASK),
            Some(MAIN_TASK) if memory.main_active != 0 => ChildSelection::Child(BACKGROUND),
            Some(BACKGROUND) if memory.main_active != 0 => {
                ctx.update_memory(|m: &mut ParallelMemory| m.background_done = 1);
                ChildSelection::Suspend
            }
            _ => ChildSelection::ReturnToParent,
        }
    }

    fn validate_children(&self, children: &[ChildShape]) -> Result<(), String> {
        match children {
            [ChildShape::Task, _] => Ok(()),
            [_, _] => Err("the first child must be a task".to_string()),
            _ => Err(format!("expected exactly two children, found {}", children.len())),
        }
    }

    fn can_push_subtree(&self, _ctx: &mut NodeContext<'_>, child_index: usize) -> bool {
        child_index != MAIN_TASK
    }

    fn on_node_activation(&self, ctx: &mut NodeContext<'_>) {
        ctx.write_memory(ParallelMemory {
            main_result: NodeResult::Failed.to_byte(),
            ..ParallelMemory::default()
        });
    }

    fn on_node_deactivation(&self, ctx: &mut NodeContext<'_>, result: &mut NodeResult) {
        let memory: ParallelMemory = ctx.read_memory();
        if memory.main_active == 0 {
            *result = NodeResult::from_byte(memory.main_result);
        }
        ctx.remove_parallel_task(MAIN_TASK);
    }

    fn on_child_execution(&self, ctx: &mut NodeContext<'_>, child_index: usize, result: &mut NodeResult) {
        if child_index != MAIN_TASK {
            return;
        }
        let mut memory: ParallelMemory = ctx.read_memory();
        memory.main_result = result.to_byte();

        if *result == NodeResult::InProgress {
            if ctx.child_task_status(MAIN_TASK) == TaskStatus::Active {
                ctx.register_parallel_task(MAIN_TASK);
                memory.main_active = 1;
                memory.background_done = 0;
                ctx.request_execution(Some(MAIN_TASK), NodeResult::InProgress);
            }
        } else if memory.main_active != 0 {
            memory.main_active = 0;
            ctx.unregister_parallel_task(MAIN_TASK);
            let finish_now = self.finish_mode == ParallelFinishMode::AbortBackground
                || memory.background_done != 0;
            if finish_now && *result != NodeResult::Aborted {
                ctx.request_execution(Some(MAIN_TASK), *result);
            }
        }
        ctx.write_memory(memory);
    }
}

// ---------------------------------------------------------------------------------------------
// Tasks

/// Succeeds after `seconds` of tick time.
#[derive(Debug, Clone, Copy)]
pub struct Wait {
    pub seconds: f32,
}

impl Wait {
    pub fn new(seconds: f32) -> Self {
        Self { seconds }
    }
}

impl NodeBehavior for Wait {
    fn instance_memory_size(&self) -> usize {
        std::mem::size_of::<f32>()
    }
}

impl Task for Wait {
    fn execute(&self, ctx: &mut NodeContext<'_>) -> NodeResult {
        if self.seconds <= 0.0 {
            return NodeResult::Succeeded;
        }
        ctx.write_memory(self.seconds);
        NodeResult::InProgress
    }

    fn tick(&self, ctx: &mut NodeContext<'_>, dt_seconds: f32) -> TaskTick {
        let remaining = ctx.update_memory(|left: &mut f32| {
            *left -= dt_seconds;
            *left
        });
        if remaining <= 0.0 {
            TaskTick::Finished(NodeResult::Succeeded)
        } else {
            TaskTick::Running
        }
    }
}

/// Runs another tree asset as a subtree. The asset's root decorators guard this task's edge.
#[derive(Debug, Clone)]
pub struct RunBehavior {
    pub asset: Arc<BehaviorTreeAsset>,
}

impl RunBehavior {
    pub fn new(asset: Arc<BehaviorTreeAsset>) -> Self {
        Self { asset }
    }
}

impl NodeBehavior for RunBehavior {}

impl Task for RunBehavior {
    fn execute(&self, ctx: &mut NodeContext<'_>) -> NodeResult {
        ctx.push_subtree(self.asset.clone());
        NodeResult::InProgress
    }

    fn injected_subtree(&self) -> Option<Arc<BehaviorTreeAsset>> {
        Some(self.asset.clone())
    }
}

/// Runs a query through the component's [`QuerySystem`](crate::query::QuerySystem) and stores
/// the first item in a vector key.
#[derive(Debug, Clone)]
pub struct RunQuery {
    pub request: QueryRequest,
    pub mode: QueryMode,
    pub result_key: KeySelector,
}

impl RunQuery {
    pub fn new(request: QueryRequest, result_key: impl Into<String>) -> Self {
        Self {
            request,
            mode: QueryMode::default(),
            result_key: KeySelector::new(result_key).of_type(KeyType::Vector),
        }
    }

    pub fn mode(mut self, mode: QueryMode) -> Self {
        self.mode = mode;
        self
    }
}

impl NodeBehavior for RunQuery {
    /// Running query id plus one; zero when idle.
    fn instance_memory_size(&self) -> usize {
        std::mem::size_of::<u32>()
    }

    fn blackboard_keys(&self) -> &[KeySelector] {
        std::slice::from_ref(&self.result_key)
    }
}

impl Task for RunQuery {
    fn execute(&self, ctx: &mut NodeContext<'_>) -> NodeResult {
        if ctx.query_system().is_none() {
            tracing::warn!(node = %ctx.node_name(), "no query system installed");
            return NodeResult::Failed;
        }
        let key = ctx.blackboard_key(0);
        let finished = QueryFinished::new(ctx.latent_handle(), key);
        let Some(query) = ctx.query_system() else {
            return NodeResult::Failed;
        };
        let id = query.execute(self.request.clone(), self.mode, finished);
        ctx.write_memory(id.0.wrapping_add(1));
        NodeResult::InProgress
    }

    fn abort(&self, ctx: &mut NodeContext<'_>) -> NodeResult {
        let running: u32 = ctx.read_memory();
        if running != 0 {
            if let Some(query) = ctx.query_system() {
                query.abort(QueryId(running - 1));
            }
            ctx.write_memory(0u32);
        }
        NodeResult::Aborted
    }
}

// ---------------------------------------------------------------------------------------------
// Decorators

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KeyQuery {
    IsSet,
    IsNotSet,
    IntEquals(i32),
    IntAtLeast(i32),
    FloatBelow(f32),
}

/// Gates its branch on a blackboard key and re-evaluates whenever the key changes.
#[derive(Debug, Clone)]
pub struct BlackboardCondition {
    pub key: KeySelector,
    pub query: KeyQuery,
}

impl BlackboardCondition {
    pub fn new(key: impl Into<String>, query: KeyQuery) -> Self {
        Self {
            key: KeySelector::new(key),
            query,
        }
    }

}

impl NodeBehavior for BlackboardCondition {
    fn blackboard_keys(&self) -> &[KeySelector] {
        std::slice::from_ref(&self.key)
    }
}

impl Decorator for BlackboardCondition {
    fn calculate_raw_condition(&self, ctx: &mut NodeContext<'_>) -> bool {
        let Some(key) = ctx.blackboard_key(0) else {
            return false;
        };
        let blackboard = ctx.blackboard();
        match self.query {
            KeyQuery::IsSet => blackboard.is_set(key),
            KeyQuery::IsNotSet => !blackboard.is_set(key),
            KeyQuery::IntEquals(value) => blackboard.get::<i32>(key) == value,
            KeyQuery::IntAtLeast(value) => blackboard.get::<i32>(key) >= value,
            KeyQuery::FloatBelow(value) => blackboard.get::<f32>(key) < value,
        }
    }

    fn on_become_relevant(&self, ctx: &mut NodeContext<'_>) {
        let Some(key) = ctx.blackboard_key(0) else {
            return;
        };
        if !ctx.observe_blackboard_key(key) {
            tracing::warn!(key = %self.key.name(), "failed to observe blackboard key");
        }
    }

    fn on_cease_relevant(&self, ctx: &mut NodeContext<'_>) {
        ctx.stop_observing_blackboard();
    }
}

/// Turns a failed branch into a success.
#[derive(Debug, Default, Clone, Copy)]
pub struct ForceSuccess;

impl NodeBehavior for ForceSuccess {}

impl Decorator for ForceSuccess {
    fn on_node_deactivation(&self, _ctx: &mut NodeContext<'_>, result: &mut NodeResult) {
        if *result == NodeResult::Failed {
            *result = NodeResult::Succeeded;
        }
    }

    fn on_node_processed(&self, _ctx: &mut NodeContext<'_>, result: &mut NodeResult) {
        *result = NodeResult::Succeeded;
    }
}
