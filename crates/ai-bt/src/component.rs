//! Per-agent runner that owns the instance stack, node memory and the bound blackboard.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

use ai_core::{Blackboard, SplitMix64, TickContext};
use ai_tools::{TraceEvent, TraceSink};
use bytemuck::Pod;

use crate::asset::{AssetId, BehaviorTreeAsset};
use crate::bt::{
    ActiveNodeKind, ExecutionMode, ExecutionState, NodeId, NodeIndex, NodeResult, TaskStatus,
};
use crate::config::BehaviorTreeConfig;
use crate::error::{BehaviorTreeError, Result};
use crate::instance::{KnownInstance, TreeInstance};
use crate::manager::TemplateCache;
use crate::memory::{InstanceMemory, MemorySlot};
use crate::node::{Instancing, NodeContext, NodeEffect, NodeObject, TaskTick};
use crate::query::QuerySystem;
use crate::search::{ExecutionRequest, SearchData, SearchUpdate, UpdateMode};
use crate::signal::{split_owner, EngineSignal};
use crate::template::{NodeKind, TreeTemplate};

pub struct BehaviorTreeComponent {
    pub(crate) config: BehaviorTreeConfig,
    pub(crate) cache: Option<Arc<TemplateCache>>,
    pub(crate) blackboard: Blackboard,

    pub(crate) instance_stack: Vec<TreeInstance>,
    /// Parallel to `instance_stack`.
    pub(crate) instance_memory: Vec<InstanceMemory>,
    pub(crate) known_instances: Vec<KnownInstance>,
    pub(crate) node_instances: Vec<NodeObject>,
    pub(crate) active_instance: u16,

    pub(crate) search_data: SearchData,
    pub(crate) execution_request: Option<ExecutionRequest>,
    pub(crate) requested_flow_update: bool,
    pub(crate) waiting_for_aborting_tasks: bool,

    /// Latent tasks waiting for a completion, keyed by request id.
    pub(crate) task_observers: BTreeMap<u32, NodeIndex>,
    pub(crate) signal_tx: Sender<EngineSignal>,
    signal_rx: Receiver<EngineSignal>,
    pub(crate) next_request_id: u32,
    pub(crate) next_instance_serial: u32,

    pub(crate) query: Option<Box<dyn QuerySystem>>,
    trace: Option<Box<dyn TraceSink>>,
    pub(crate) rng: SplitMix64,

    root_asset: Option<Arc<BehaviorTreeAsset>>,
    pub(crate) execution_mode: ExecutionMode,
    pub(crate) running: bool,
    pub(crate) paused: bool,
    pub(crate) stopped: bool,
    pub(crate) current_tick: u64,
}

impl fmt::Debug for BehaviorTreeComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BehaviorTreeComponent")
            .field("running", &self.running)
            .field("paused", &self.paused)
            .field("instances", &self.instance_stack.len())
            .field("active_instance", &self.active_instance)
            .field("pending_request", &self.execution_request)
            .finish()
    }
}

impl Default for BehaviorTreeComponent {
    fn default() -> Self {
        Self::new()
    }
}

impl BehaviorTreeComponent {
    pub fn new() -> Self {
        Self::with_config(BehaviorTreeConfig::default())
    }

    pub fn with_config(config: BehaviorTreeConfig) -> Self {
        let (signal_tx, signal_rx) = mpsc::channel();
        let rng = SplitMix64::new(config.seed);
        Self {
            config,
            cache: None,
            blackboard: Blackboard::new(),
            instance_stack: Vec::new(),
            instance_memory: Vec::new(),
            known_instances: Vec::new(),
            node_instances: Vec::new(),
            active_instance: 0,
            search_data: SearchData::default(),
            execution_request: None,
            requested_flow_update: false,
            waiting_for_aborting_tasks: false,
            task_observers: BTreeMap::new(),
            signal_tx,
            signal_rx,
            next_request_id: 0,
            next_instance_serial: 0,
            query: None,
            trace: None,
            rng,
            root_asset: None,
            execution_mode: ExecutionMode::Looped,
            running: false,
            paused: false,
            stopped: false,
            current_tick: 0,
        }
    }

    /// Loads templates through `cache` instead of [`TemplateCache::global`].
    pub fn with_cache(mut self, cache: Arc<TemplateCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn set_query_system(&mut self, query: impl QuerySystem + 'static) {
        self.query = Some(Box::new(query));
    }

    pub fn set_trace_sink(&mut self, sink: impl TraceSink + 'static) {
        self.trace = Some(Box::new(sink));
    }

    pub fn config(&self) -> &BehaviorTreeConfig {
        &self.config
    }

    pub fn blackboard(&self) -> &Blackboard {
        &self.blackboard
    }

    pub fn blackboard_mut(&mut self) -> &mut Blackboard {
        &mut self.blackboard
    }

    pub(crate) fn templates(&self) -> &TemplateCache {
        match self.cache.as_deref() {
            Some(cache) => cache,
            None => TemplateCache::global(),
        }
    }

    // ---------------------------------------------------------------------------------------
    // Lifecycle

    pub fn start_tree(&mut self, asset: Arc<BehaviorTreeAsset>, mode: ExecutionMode) -> bool {
        match self.try_start_tree(asset, mode) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(%err, "failed to start behavior tree");
                false
            }
        }
    }

    pub fn try_start_tree(&mut self, asset: Arc<BehaviorTreeAsset>, mode: ExecutionMode) -> Result<()> {
        if !self.config.enabled {
            return Err(BehaviorTreeError::UsageDisabled);
        }

        let same_root = self
            .root_asset
            .as_ref()
            .is_some_and(|root| root.id() == asset.id());
        if same_root && self.running && !self.instance_stack.is_empty() {
            tracing::debug!(tree = %asset.name(), "behavior tree already running");
            return Ok(());
        }
        if !self.instance_stack.is_empty() {
            tracing::debug!(tree = %asset.name(), "abandoning running tree to start a new one");
            self.stop_tree("starting new tree");
        }

        if !self.blackboard.is_bound() {
            if let Some(schema) = asset.blackboard_schema() {
                self.blackboard.bind(schema.clone());
            }
        }

        self.execution_mode = mode;
        self.running = true;
        self.stopped = false;
        if let Err(err) = self.try_push_instance(&asset) {
            self.running = false;
            return Err(err);
        }
        tracing::debug!(tree = %asset.name(), ?mode, "behavior tree started");
        self.root_asset = Some(asset);
        self.process_execution_request();
        Ok(())
    }

    /// Aborts running tasks, cleans up every instance and forgets all execution state.
    pub fn stop_tree(&mut self, reason: &str) {
        if self.instance_stack.is_empty() && !self.running {
            return;
        }
        tracing::debug!(reason, "stopping behavior tree");

        self.abort_all_tasks();
        for level in (0..self.instance_stack.len()).rev() {
            self.cleanup_instance(level as u16);
        }
        self.instance_stack.clear();
        self.instance_memory.clear();
        self.known_instances.clear();
        self.node_instances.clear();
        self.task_observers.clear();
        self.search_data.reset();
        self.execution_request = None;
        self.requested_flow_update = false;
        self.waiting_for_aborting_tasks = false;
        self.active_instance = 0;
        self.running = false;
        self.stopped = true;
        self.root_asset = None;
        self.trace_event("bt.tree.stopped", 0, NodeId(0));
    }

    /// Requests a restart from the root tree's first child, aborting whatever runs now.
    pub fn restart_tree(&mut self) {
        let Some(top) = self.instance_stack.first() else {
            return;
        };
        let root = top.root();
        tracing::debug!("restarting behavior tree");
        self.request_execution(root, 0, root, None, NodeResult::Aborted);
    }

    pub fn pause_logic(&mut self, reason: &str) {
        tracing::debug!(reason, "behavior tree paused");
        self.paused = true;
        self.blackboard.pause_updates();
    }

    pub fn resume_logic(&mut self, reason: &str) {
        if !self.paused {
            return;
        }
        tracing::debug!(reason, "behavior tree resumed");
        self.paused = false;
        self.blackboard.resume_updates();
        if self.execution_request.is_some() {
            self.requested_flow_update = true;
        }
    }

    pub fn is_running(&self) -> bool {
        self.running && !self.paused && !self.instance_stack.is_empty()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn root_asset(&self) -> Option<&Arc<BehaviorTreeAsset>> {
        self.root_asset.as_ref()
    }

    // ---------------------------------------------------------------------------------------
    // Tick

    /// Delivers pending signals, ticks aux nodes, parallel tasks and the active task, then runs
    /// the deferred search if anything requested one.
    pub fn tick(&mut self, ctx: &TickContext) {
        self.current_tick = ctx.tick;
        if self.paused {
            return;
        }
        self.drain_signals();
        if self.instance_stack.is_empty() || !self.running {
            return;
        }

        let dt = ctx.dt_seconds;
        for level in 0..self.instance_stack.len() {
            let instance = level as u16;
            let aux = self.instance_stack[level].active_aux.clone();
            for node in aux {
                self.tick_aux(instance, node, dt);
            }
            let tasks: Vec<NodeId> = match self.instance_stack.get(level) {
                Some(info) => info.parallel_tasks.iter().map(|t| t.node).collect(),
                None => Vec::new(),
            };
            for node in tasks {
                self.tick_task(instance, node, dt);
            }
        }

        let active_task = self
            .instance_stack
            .get(self.active_instance as usize)
            .and_then(|info| match info.active_kind {
                ActiveNodeKind::ActiveTask | ActiveNodeKind::AbortingTask => info.active_node,
                _ => None,
            });
        if let Some(task) = active_task {
            self.tick_task(self.active_instance, task, dt);
        }

        self.drain_signals();
        if self.requested_flow_update {
            self.process_execution_request();
        }
    }

    fn tick_aux(&mut self, instance: u16, node: NodeId, dt: f32) {
        let Some(template) = self.template(instance) else {
            return;
        };
        let Some(info) = template.get(node) else {
            return;
        };
        match *info.kind() {
            NodeKind::Decorator { .. } => {
                self.call_node(instance, node, |object, ctx| {
                    if let Some(decorator) = object.as_decorator() {
                        decorator.tick(ctx, dt);
                    }
                });
            }
            NodeKind::Service {
                interval,
                random_deviation,
            } => {
                let slot = info.memory();
                let remaining: f32 = self.read_header(instance, &slot, 0);
                let elapsed: f32 = self.read_header::<f32>(instance, &slot, 4) + dt;
                if remaining - dt > 0.0 {
                    self.write_header(instance, &slot, 0, remaining - dt);
                    self.write_header(instance, &slot, 4, elapsed);
                    return;
                }
                let next = self.rng.jitter(interval, random_deviation);
                self.write_header(instance, &slot, 0, next);
                self.write_header(instance, &slot, 4, 0.0f32);
                self.call_node(instance, node, |object, ctx| {
                    if let Some(service) = object.as_service() {
                        service.tick(ctx, elapsed);
                    }
                });
            }
            _ => {}
        }
    }

    fn tick_task(&mut self, instance: u16, task: NodeId, dt: f32) {
        let outcome = self.call_node(instance, task, |object, ctx| match object.as_task() {
            Some(task) => task.tick(ctx, dt),
            None => TaskTick::Running,
        });
        if let Some(TaskTick::Finished(result)) = outcome {
            if result.is_terminal() {
                self.unregister_task_observers(NodeIndex::new(instance, task));
                self.on_task_finished(instance, task, result);
            }
        }
    }

    fn drain_signals(&mut self) {
        while let Ok(signal) = self.signal_rx.try_recv() {
            match signal {
                EngineSignal::TaskFinished {
                    request_id,
                    result,
                    update,
                } => {
                    let Some(index) = self.task_observers.remove(&request_id) else {
                        tracing::debug!(request = request_id, "ignoring stale task completion");
                        continue;
                    };
                    if let Some(update) = update {
                        update(&mut self.blackboard);
                    }
                    self.unregister_task_observers(index);
                    self.on_task_finished(index.instance, index.node(), result);
                }
                EngineSignal::BlackboardChanged { owner, key } => {
                    let (serial, node) = split_owner(owner);
                    let Some(level) = self.instance_stack.iter().position(|i| i.serial == serial)
                    else {
                        continue;
                    };
                    if !self.instance_stack[level].is_aux_active(node) {
                        continue;
                    }
                    let instance = level as u16;
                    let wants_update = self
                        .call_node(instance, node, |object, ctx| {
                            object
                                .as_decorator()
                                .is_some_and(|decorator| decorator.on_blackboard_change(ctx, key))
                        })
                        .unwrap_or(false);
                    if wants_update {
                        self.request_execution_by_decorator(NodeIndex::new(instance, node));
                    }
                }
            }
        }
    }

    // ---------------------------------------------------------------------------------------
    // Node calls

    pub(crate) fn template(&self, instance: u16) -> Option<Arc<TreeTemplate>> {
        self.instance_stack
            .get(instance as usize)
            .map(|info| info.template.clone())
    }

    /// Behavior object for `node`: the template's for shared nodes, the component's own copy
    /// for instanced ones (created on first use and reused per known instance).
    pub fn get_or_create_node_instance(&mut self, instance: u16, node: NodeId) -> Option<NodeObject> {
        let level = instance as usize;
        let template = self.template(instance)?;
        let info = template.get(node)?;
        if info.instancing() == Instancing::Shared {
            return Some(info.object().clone());
        }

        let slot = info.memory();
        let record = slot.instanced_record_offset();
        let memory = self.instance_memory.get_mut(level)?;
        let stored = memory.read::<i32>(&slot, record).unwrap_or(0);
        if stored > 0 {
            if let Some(object) = self.node_instances.get(stored as usize - 1) {
                return Some(object.clone());
            }
        }

        let known = self.instance_stack.get(level)?.known_instance;
        let reused = self
            .known_instances
            .get(known)
            .and_then(|k| k.node_instances.get(&node).copied());
        let index = match reused {
            Some(index) => index,
            None => {
                let Some(object) = info.object().instantiate() else {
                    tracing::warn!(node = %info.name(), "instanced node did not provide an instance, sharing the template object");
                    return Some(info.object().clone());
                };
                self.node_instances.push(object);
                let index = self.node_instances.len() - 1;
                if let Some(k) = self.known_instances.get_mut(known) {
                    k.node_instances.insert(node, index);
                }
                index
            }
        };
        if let Err(err) = memory.write(&slot, record, index as i32 + 1) {
            tracing::error!(%err, node = %info.name(), "failed to record node instance");
        }
        self.node_instances.get(index).cloned()
    }

    /// Runs `f` with the node's behavior object and a context over its memory. Effects the hook
    /// queued are returned unapplied.
    pub(crate) fn with_node<R>(
        &mut self,
        instance: u16,
        node: NodeId,
        f: impl FnOnce(&NodeObject, &mut NodeContext<'_>) -> R,
    ) -> Option<(R, Vec<NodeEffect>)> {
        let object = self.get_or_create_node_instance(instance, node)?;
        let level = instance as usize;
        let template = self.template(instance)?;
        let slot = template.get(node)?.memory();
        let serial = self.instance_stack.get(level)?.serial;
        let restart_pending = self.execution_request.is_some();
        let mut effects = Vec::new();

        let out = {
            let memory = self.instance_memory.get_mut(level)?.user_region_mut(&slot);
            let mut ctx = NodeContext {
                template: &template,
                node,
                instance,
                instance_serial: serial,
                memory,
                blackboard: &mut self.blackboard,
                stack: &self.instance_stack,
                signals: &self.signal_tx,
                next_request_id: &mut self.next_request_id,
                query: self.query.as_deref_mut(),
                effects: &mut effects,
                restart_pending,
                tick: self.current_tick,
            };
            f(&object, &mut ctx)
        };
        Some((out, effects))
    }

    /// Like [`Self::with_node`], applying effects right away. Subtree pushes are only honored
    /// from task execution.
    pub(crate) fn call_node<R>(
        &mut self,
        instance: u16,
        node: NodeId,
        f: impl FnOnce(&NodeObject, &mut NodeContext<'_>) -> R,
    ) -> Option<R> {
        let (out, effects) = self.with_node(instance, node, f)?;
        let pushes = self.apply_effects(instance, node, effects);
        if !pushes.is_empty() {
            tracing::warn!(instance, node = %node, "subtree push outside task execution ignored");
        }
        Some(out)
    }

    pub(crate) fn apply_effects(
        &mut self,
        instance: u16,
        node: NodeId,
        effects: Vec<NodeEffect>,
    ) -> Vec<Arc<BehaviorTreeAsset>> {
        let mut pushes = Vec::new();
        for effect in effects {
            match effect {
                NodeEffect::ObserveTask { request_id } => {
                    self.task_observers
                        .insert(request_id, NodeIndex::new(instance, node));
                }
                NodeEffect::PushSubtree(asset) => pushes.push(asset),
                NodeEffect::RequestExecution {
                    child_index,
                    result,
                } => self.request_from_node(instance, node, child_index, result),
                NodeEffect::RequestByDecorator => {
                    self.request_execution_by_decorator(NodeIndex::new(instance, node))
                }
                NodeEffect::RegisterParallelTask(child) => {
                    if let Some(task) = self.child_node(instance, node, child) {
                        self.register_parallel_task(instance, task);
                    }
                }
                NodeEffect::UnregisterParallelTask(child) => {
                    if let Some(task) = self.child_node(instance, node, child) {
                        self.unregister_parallel_task(instance, task);
                    }
                }
                NodeEffect::RemoveParallelTaskOnExit(child) => {
                    if let Some(task) = self.child_node(instance, node, child) {
                        self.search_data
                            .add_unique_update(SearchUpdate::task(task, instance, UpdateMode::Remove));
                    }
                }
            }
        }
        pushes
    }

    fn request_from_node(
        &mut self,
        instance: u16,
        node: NodeId,
        child_index: Option<usize>,
        result: NodeResult,
    ) {
        let Some(template) = self.template(instance) else {
            return;
        };
        let Some(info) = template.get(node) else {
            return;
        };
        if info.is_composite() {
            self.request_execution(node, instance, node, child_index, result);
        } else if let Some(parent) = info.parent() {
            self.request_execution(parent, instance, node, info.child_index(), result);
        }
    }

    pub(crate) fn child_node(&self, instance: u16, composite: NodeId, child: usize) -> Option<NodeId> {
        let template = self.instance_stack.get(instance as usize)?.template.clone();
        template.children(composite).get(child).map(|edge| edge.node)
    }

    pub(crate) fn unregister_task_observers(&mut self, task: NodeIndex) {
        self.task_observers.retain(|_, observed| *observed != task);
    }

    // ---------------------------------------------------------------------------------------
    // Engine-owned header fields

    pub(crate) fn read_header<T: Pod>(&self, instance: u16, slot: &MemorySlot, offset: usize) -> T {
        let Some(memory) = self.instance_memory.get(instance as usize) else {
            return T::zeroed();
        };
        match memory.read(slot, offset) {
            Ok(value) => value,
            Err(err) => {
                tracing::error!(%err, instance, "node header read failed");
                T::zeroed()
            }
        }
    }

    pub(crate) fn write_header<T: Pod>(&mut self, instance: u16, slot: &MemorySlot, offset: usize, value: T) {
        let Some(memory) = self.instance_memory.get_mut(instance as usize) else {
            return;
        };
        if let Err(err) = memory.write(slot, offset, value) {
            tracing::error!(%err, instance, "node header write failed");
        }
    }

    pub(crate) fn trace_event(&mut self, tag: &'static str, instance: u16, node: NodeId) {
        if let Some(sink) = self.trace.as_mut() {
            sink.emit(
                TraceEvent::new(self.current_tick, tag)
                    .with_a(instance as u64)
                    .with_b(node.0 as u64),
            );
        }
    }

    // ---------------------------------------------------------------------------------------
    // Introspection

    pub fn node_memory(&self, node: NodeId, instance: u16) -> Result<&[u8]> {
        let info = self
            .instance_stack
            .get(instance as usize)
            .ok_or(BehaviorTreeError::InvalidInstance(instance))?;
        let memory = self
            .instance_memory
            .get(instance as usize)
            .ok_or(BehaviorTreeError::InvalidInstance(instance))?;
        let slot = info
            .template
            .get(node)
            .map(|n| n.memory())
            .ok_or(BehaviorTreeError::InvalidNode { instance, node })?;
        Ok(memory.slot(&slot)?)
    }

    pub fn task_status(&self, task: NodeIndex) -> TaskStatus {
        match self.instance_stack.get(task.instance as usize) {
            Some(info) => info.task_status(task.node()),
            None => TaskStatus::Inactive,
        }
    }

    pub fn is_aux_node_active(&self, node: NodeIndex) -> bool {
        self.instance_stack
            .get(node.instance as usize)
            .is_some_and(|info| info.is_aux_active(node.node()))
    }

    /// True when the active node lies in child edge `child_index` of the node's parent, or
    /// `node` is the active node or root of its instance. A pending restart covering the branch
    /// makes it not executing.
    pub fn is_executing_branch(&self, node: NodeIndex, child_index: usize) -> bool {
        let Some(info) = self.instance_stack.get(node.instance as usize) else {
            return false;
        };
        let Some(active) = info.active_node else {
            return false;
        };
        let template = &info.template;
        let Some(test) = template.get(node.node()) else {
            return false;
        };

        if let Some(request) = &self.execution_request {
            if request.search_start.takes_priority_over(node) || request.search_start == node {
                return false;
            }
            if test.is_decorator()
                && request.execute_instance == node.instance
                && test.parent() == Some(request.execute_node)
            {
                return false;
            }
        }

        if node.node() == info.root() || node.node() == active {
            return true;
        }
        let Some(parent) = test.parent() else {
            return false;
        };
        let next = template.child_execution_index(parent, child_index + 1);
        active.0 >= node.execution && active.0 < next
    }

    /// Lowest stack level running `asset`.
    pub fn find_instance_containing(&self, asset: AssetId) -> Option<u16> {
        self.instance_stack
            .iter()
            .position(|info| info.template.asset_id() == asset)
            .map(|level| level as u16)
    }

    pub fn instance_stack(&self) -> &[TreeInstance] {
        &self.instance_stack
    }

    pub fn active_instance_index(&self) -> u16 {
        self.active_instance
    }

    pub fn active_node(&self) -> Option<NodeIndex> {
        let info = self.instance_stack.get(self.active_instance as usize)?;
        info.active_node
            .map(|node| NodeIndex::new(self.active_instance, node))
    }

    pub fn known_instances(&self) -> &[KnownInstance] {
        &self.known_instances
    }

    pub fn execution_state(&self) -> ExecutionState {
        if self.stopped {
            return ExecutionState::Stopped;
        }
        let Some(info) = self.instance_stack.get(self.active_instance as usize) else {
            return ExecutionState::Idle;
        };
        if !self.running {
            return ExecutionState::Idle;
        }
        if self.waiting_for_aborting_tasks || info.active_kind == ActiveNodeKind::AbortingTask {
            return ExecutionState::TaskAborting;
        }
        if self.requested_flow_update || self.execution_request.is_some() {
            return ExecutionState::Searching;
        }
        match info.active_kind {
            ActiveNodeKind::ActiveTask => ExecutionState::TaskActive,
            ActiveNodeKind::Composite if info.active_node.is_some() => ExecutionState::Suspended,
            _ => ExecutionState::Idle,
        }
    }

    /// Names of running tasks: the active one and every parallel task, in stack order.
    pub fn describe_active_tasks(&self) -> String {
        let mut names = Vec::new();
        for (level, info) in self.instance_stack.iter().enumerate() {
            for task in &info.parallel_tasks {
                let name = info.template.node(task.node).name();
                names.push(format!("{name} ({:?})", task.status));
            }
            if level == self.active_instance as usize {
                if let Some(active) = info.active_node {
                    if matches!(
                        info.active_kind,
                        ActiveNodeKind::ActiveTask | ActiveNodeKind::AbortingTask
                    ) {
                        names.push(info.template.node(active).name().to_string());
                    }
                }
            }
        }
        names.join(", ")
    }

    pub fn describe_active_trees(&self) -> String {
        self.instance_stack
            .iter()
            .map(|info| info.template.name())
            .collect::<Vec<_>>()
            .join(", ")
    }
}
