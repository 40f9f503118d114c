//! Execution requests and the search that turns them into a new active task.

use crate::bt::{
    ActiveNodeKind, ChildSelection, ExecutionMode, FlowAbortMode, NodeId, NodeIndex, NodeResult,
    TaskStatus,
};
use crate::component::BehaviorTreeComponent;
use crate::instance::ParallelTask;
use crate::logic::DecoratorLogic;
use crate::memory::CHILD_NOT_INITIALIZED;
use crate::search::{ExecutionRequest, SearchUpdate, UpdateMode, UpdateTarget};
use crate::signal::observer_owner;
use crate::template::NodeKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassOutcome {
    Done,
    /// A looping tree ran out of nodes and queued a restart from its root.
    LoopRestarted,
}

impl BehaviorTreeComponent {
    // ---------------------------------------------------------------------------------------
    // Requests

    /// Flow-abort request raised by a decorator whose condition may have changed.
    pub fn request_execution_by_decorator(&mut self, decorator: NodeIndex) {
        let Some(template) = self.template(decorator.instance) else {
            return;
        };
        let Some(info) = template.get(decorator.node()) else {
            return;
        };
        let (Some(parent), Some(child)) = (info.parent(), info.child_index()) else {
            return;
        };

        let mut mode = info.abort_mode();
        if mode == FlowAbortMode::None {
            return;
        }
        let executing = self.is_executing_branch(decorator, child);
        match mode {
            FlowAbortMode::Both | FlowAbortMode::SelfBranch => {
                mode = if executing {
                    FlowAbortMode::SelfBranch
                } else {
                    FlowAbortMode::LowerPriority
                };
            }
            _ if executing => {
                tracing::debug!(decorator = %decorator, "lower priority abort ignored, branch is executing");
                return;
            }
            _ => {}
        }

        let result = if mode == FlowAbortMode::SelfBranch {
            NodeResult::Failed
        } else {
            NodeResult::Aborted
        };
        self.request_execution(parent, decorator.instance, decorator.node(), Some(child), result);
    }

    /// Continue from the parent of the task that just finished.
    pub(crate) fn request_execution_after_task(&mut self, result: NodeResult) {
        if matches!(result, NodeResult::Aborted | NodeResult::InProgress) {
            return;
        }
        let level = self.active_instance;
        let Some(info) = self.instance_stack.get(level as usize) else {
            return;
        };
        let root = info.root();
        let (on, by) = match info.active_node {
            None => (root, root),
            Some(node) if info.active_kind == ActiveNodeKind::Composite => (node, node),
            Some(node) => (info.template.parent(node).unwrap_or(root), node),
        };
        self.request_execution(on, level, by, None, result);
    }

    /// Queues a search starting at composite `on`.
    ///
    /// `Aborted` switches to a higher priority branch: the search restarts at child edge
    /// `by_child` from the common ancestor of `on` and whatever runs now. Any other result
    /// continues from `on` with that result. Only the highest priority request is kept.
    pub fn request_execution(
        &mut self,
        on: NodeId,
        instance: u16,
        by: NodeId,
        by_child: Option<usize>,
        result: NodeResult,
    ) {
        tracing::debug!(instance, on = %on, by = %by, ?result, "execution requested");
        if !self.running || self.instance_stack.is_empty() {
            tracing::debug!("request skipped, tree is not running");
            return;
        }
        let Some(template) = self.template(instance) else {
            tracing::debug!(instance, "request skipped, instance is not on the stack");
            return;
        };
        let valid = template.get(on).is_some_and(|n| n.is_composite())
            && template.get(by).is_some()
            && by_child.map_or(true, |child| child < template.children(on).len());
        if !valid {
            tracing::warn!(instance, on = %on, by = %by, ?by_child, "request names nodes outside the template");
            self.discard_request(instance, by, "invalid request target");
            return;
        }

        let switch_to_higher = result == NodeResult::Aborted;
        let execution = if switch_to_higher {
            template.child_execution_index(on, by_child.unwrap_or(0))
        } else {
            by.0
        };
        let search_start = NodeIndex {
            instance,
            execution,
        };

        if let Some(pending) = &self.execution_request {
            if pending.search_start.takes_priority_over(search_start) {
                self.discard_request(instance, by, "pending request has higher priority");
                return;
            }
        }

        let (execute_instance, execute_node) = if switch_to_higher {
            if let Some(child) = by_child {
                if !self.decorators_allow(instance, on, child) {
                    self.discard_request(instance, by, "decorators do not allow execution");
                    return;
                }
            }

            let current = match &self.execution_request {
                Some(pending) => (pending.execute_instance, pending.execute_node),
                None => self.current_search_root(),
            };
            if current == (instance, on) {
                current
            } else {
                let Some((common_instance, common)) =
                    self.find_common_parent(on, instance, current.1, current.0)
                else {
                    tracing::error!(
                        instance,
                        on = %on,
                        current_instance = current.0,
                        current = %current.1,
                        "execution path has no common parent, restarting tree"
                    );
                    self.force_restart();
                    return;
                };

                let mut node = on;
                while !(common_instance == instance && node == common) {
                    let Some(parent) = template.parent(node) else {
                        break;
                    };
                    let child = template.node(node).child_index().unwrap_or(0);
                    if !self.decorators_allow(instance, parent, child) {
                        self.discard_request(instance, by, "decorators above the restart point do not allow execution");
                        return;
                    }
                    node = parent;
                }
                (common_instance, common)
            }
        } else {
            let requested_by_decorator = template.get(by).is_some_and(|n| n.is_decorator());
            if let (true, Some(child)) = (requested_by_decorator, by_child) {
                let guarded = template
                    .children(on)
                    .get(child)
                    .is_some_and(|edge| !edge.decorators.is_empty());
                if guarded && self.decorators_allow(instance, on, child) {
                    self.discard_request(instance, by, "decorators still allow execution");
                    return;
                }
            }
            (instance, on)
        };

        self.execution_request = Some(ExecutionRequest {
            execute_instance,
            execute_node,
            search_start,
            continue_with: result,
            try_next_child: !switch_to_higher,
        });
        self.trace_event("bt.request.accepted", instance, by);
        self.requested_flow_update = true;
    }

    fn discard_request(&mut self, instance: u16, by: NodeId, reason: &'static str) {
        tracing::debug!(instance, by = %by, reason, "execution request discarded");
        self.trace_event("bt.request.discarded", instance, by);
    }

    /// Composite the search would continue from right now.
    fn current_search_root(&self) -> (u16, NodeId) {
        let level = self.active_instance;
        let Some(info) = self.instance_stack.get(level as usize) else {
            return (0, NodeId(0));
        };
        let root = info.root();
        let node = match info.active_node {
            None => root,
            Some(node) if info.active_kind == ActiveNodeKind::Composite => node,
            Some(node) => info.template.parent(node).unwrap_or(root),
        };
        (level, node)
    }

    /// Queues a restart of the root tree without consulting any decorator.
    pub(crate) fn force_restart(&mut self) {
        let Some(top) = self.instance_stack.first() else {
            return;
        };
        let root = top.root();
        let execution = top.template.child_execution_index(root, 0);
        self.execution_request = Some(ExecutionRequest {
            execute_instance: 0,
            execute_node: root,
            search_start: NodeIndex {
                instance: 0,
                execution,
            },
            continue_with: NodeResult::Aborted,
            try_next_child: false,
        });
        self.requested_flow_update = true;
    }

    /// Evaluates the decorators on child edge `child` of `composite` through the edge's logic.
    pub(crate) fn decorators_allow(&mut self, instance: u16, composite: NodeId, child: usize) -> bool {
        let Some(template) = self.template(instance) else {
            return false;
        };
        let Some(edge) = template.children(composite).get(child) else {
            return false;
        };
        if edge.decorators.is_empty() {
            return true;
        }

        let mut results = Vec::with_capacity(edge.decorators.len());
        for &decorator in &edge.decorators {
            let inverse = matches!(
                template.node(decorator).kind(),
                NodeKind::Decorator { inverse: true, .. }
            );
            let raw = self
                .call_node(instance, decorator, |object, ctx| {
                    object
                        .as_decorator()
                        .map_or(true, |d| d.calculate_raw_condition(ctx))
                })
                .unwrap_or(true);
            results.push(raw != inverse);
        }
        DecoratorLogic::evaluate(&edge.logic, &results)
    }

    // ---------------------------------------------------------------------------------------
    // Processing

    /// Runs the deferred search. A looping tree that runs out of nodes restarts at most
    /// `max_loop_restarts_per_pass` times before the rest is left for the next tick.
    pub(crate) fn process_execution_request(&mut self) {
        let mut restarts = 0;
        while self.process_pass() == PassOutcome::LoopRestarted {
            restarts += 1;
            if restarts > self.config.max_loop_restarts_per_pass {
                tracing::debug!(restarts, "loop restart deferred to next tick");
                break;
            }
        }
    }

    fn process_pass(&mut self) -> PassOutcome {
        self.requested_flow_update = false;
        if self.paused {
            tracing::debug!("execution request postponed, logic is paused");
            return PassOutcome::Done;
        }
        if !self.running || self.instance_stack.is_empty() {
            return PassOutcome::Done;
        }
        let Some(request) = self.execution_request else {
            return PassOutcome::Done;
        };
        let mut result = request.continue_with;

        if self.active_info_kind() == Some(ActiveNodeKind::ActiveTask) {
            self.abort_current_task();
        }
        if self.waiting_for_aborting_tasks {
            tracing::debug!("search postponed until aborting tasks finish");
            return PassOutcome::Done;
        }

        let at_target = self.active_instance == request.execute_instance
            && self
                .instance_stack
                .get(self.active_instance as usize)
                .is_some_and(|info| info.active_node == Some(request.execute_node));
        if !at_target {
            if !self.deactivate_up_to(request.execute_node, request.execute_instance, &mut result) {
                return PassOutcome::Done;
            }
            let last_removal = self.search_data.pending_updates.iter().rposition(|u| {
                u.target == UpdateTarget::ParallelTask && u.mode == UpdateMode::Remove
            });
            if let Some(last) = last_removal {
                self.apply_search_data_up_to(last);
            }
        }
        if self.waiting_for_aborting_tasks {
            tracing::debug!("search postponed until aborting parallel tasks finish");
            return PassOutcome::Done;
        }

        let Some(request) = self.execution_request else {
            return PassOutcome::Done;
        };
        self.truncate_instances(self.active_instance as usize + 1);

        let level = self.active_instance;
        if let Some(info) = self.instance_stack.get_mut(level as usize) {
            if info.active_node.is_none() {
                let root = info.root();
                info.active_node = Some(root);
                info.active_kind = ActiveNodeKind::Composite;
                self.activate_composite(level, root);
                tracing::trace!(instance = level, "root activated");
            }
        }

        if request.try_next_child {
            self.search_data.search_start = None;
        } else {
            self.unregister_aux_nodes_up_to(request.search_start);
            self.restart_composite(level, request.execute_node);
            self.search_data.search_start = Some(request.search_start);
        }

        let mut next_task = None;
        let mut suspended = false;
        let mut test = Some(request.execute_node);
        while let Some(composite) = test {
            let level = self.active_instance;
            let Some(template) = self.template(level) else {
                break;
            };
            match self.find_child_to_execute(level, composite, &mut result) {
                ChildSelection::Child(index) => {
                    let Some(child) = template.children(composite).get(index).map(|e| e.node) else {
                        break;
                    };
                    self.search_step(level, child, result);
                    if template.node(child).is_task() {
                        next_task = Some(child);
                        test = None;
                    } else {
                        test = Some(child);
                    }
                }
                ChildSelection::Suspend => {
                    if let Some(info) = self.instance_stack.get_mut(level as usize) {
                        info.active_node = Some(composite);
                        info.active_kind = ActiveNodeKind::Composite;
                    }
                    self.search_step(level, composite, result);
                    suspended = true;
                    test = None;
                }
                ChildSelection::ReturnToParent => {
                    self.search_step(level, composite, result);
                    test = match template.parent(composite) {
                        Some(parent) => {
                            let index = template.node(composite).child_index().unwrap_or(0);
                            self.on_child_deactivation(level, parent, index, &mut result);
                            Some(parent)
                        }
                        None => {
                            self.deactivate_composite(level, composite, &mut result);
                            if level > 0 {
                                self.leave_instance(&mut result)
                            } else {
                                None
                            }
                        }
                    };
                }
            }
        }

        self.execution_request = None;
        let level = self.active_instance;
        self.apply_search_data(next_task.map(|task| NodeIndex::new(level, task)));

        if let Some(task) = next_task {
            self.execute_task(level, task);
            PassOutcome::Done
        } else if suspended {
            tracing::debug!(instance = level, "search suspended on composite");
            PassOutcome::Done
        } else {
            self.on_tree_finished()
        }
    }

    fn active_info_kind(&self) -> Option<ActiveNodeKind> {
        self.instance_stack
            .get(self.active_instance as usize)
            .map(|info| info.active_kind)
    }

    fn search_step(&mut self, instance: u16, node: NodeId, result: NodeResult) {
        tracing::trace!(instance, node = %node, ?result, "search step");
        if self.config.trace_search_steps {
            self.trace_event("bt.search.step", instance, node);
        }
    }

    /// Pops a finished subtree during the walk and returns the composite to continue from in
    /// the level below.
    fn leave_instance(&mut self, result: &mut NodeResult) -> Option<NodeId> {
        self.apply_search_data(None);
        self.pop_instance();
        self.active_instance = self.active_instance.saturating_sub(1);

        let level = self.active_instance;
        let template = self.template(level)?;
        let info = self.instance_stack.get_mut(level as usize)?;
        let Some(caller) = info.active_node else {
            tracing::error!(instance = level, "left a subtree without an active caller");
            return None;
        };
        info.active_kind = ActiveNodeKind::InactiveTask;
        let parent = template.parent(caller)?;
        let index = template.node(caller).child_index()?;
        if !self.decorators_allow(level, parent, index) {
            *result = NodeResult::Failed;
        }
        self.on_child_deactivation(level, parent, index, result);
        Some(parent)
    }

    fn on_tree_finished(&mut self) -> PassOutcome {
        self.active_instance = 0;
        let Some(top) = self.instance_stack.first() else {
            return PassOutcome::Done;
        };
        let root = top.root();
        tracing::debug!(mode = ?self.execution_mode, "behavior tree ran out of nodes");
        self.trace_event("bt.tree.finished", 0, root);

        match self.execution_mode {
            ExecutionMode::Looped => {
                if let Some(top) = self.instance_stack.first_mut() {
                    top.active_node = None;
                    top.active_kind = ActiveNodeKind::Composite;
                }
                self.request_execution(root, 0, root, None, NodeResult::InProgress);
                PassOutcome::LoopRestarted
            }
            ExecutionMode::SingleRun => {
                self.stop_tree("tree finished");
                PassOutcome::Done
            }
        }
    }

    /// Deactivates from the active node up to `node`, crossing instance levels. Returns `false`
    /// when the path does not contain `node`; the tree is then restarted.
    fn deactivate_up_to(&mut self, node: NodeId, node_instance: u16, result: &mut NodeResult) -> bool {
        let Some(info) = self.instance_stack.get(self.active_instance as usize) else {
            return false;
        };
        let mut deactivate_root = true;
        let mut child = info.active_node;
        if child.is_none() && self.active_instance > node_instance {
            child = Some(info.root());
            deactivate_root = false;
        }

        while let Some(current) = child {
            let level = self.active_instance;
            let Some(template) = self.template(level) else {
                return false;
            };
            match template.parent(current) {
                Some(parent) => {
                    let index = template.node(current).child_index().unwrap_or(0);
                    self.on_child_deactivation(level, parent, index, result);
                    self.search_step(level, current, *result);
                    if let Some(info) = self.instance_stack.get_mut(level as usize) {
                        info.active_node = Some(parent);
                        info.active_kind = ActiveNodeKind::Composite;
                    }
                    child = Some(parent);
                }
                None => {
                    if deactivate_root {
                        self.deactivate_composite(level, current, result);
                    }
                    deactivate_root = true;

                    if level == 0 {
                        tracing::error!(
                            target_instance = node_instance,
                            target = %node,
                            "execution path does not contain the search root, restarting tree"
                        );
                        self.force_restart();
                        return false;
                    }
                    self.active_instance -= 1;
                    child = self
                        .instance_stack
                        .get(self.active_instance as usize)
                        .and_then(|info| info.active_node);
                    self.apply_search_data(None);
                }
            }

            if child == Some(node) && self.active_instance == node_instance {
                break;
            }
        }
        true
    }

    fn unregister_aux_nodes_up_to(&mut self, index: NodeIndex) {
        for level in 0..self.instance_stack.len() {
            let instance = level as u16;
            let removals: Vec<NodeId> = self.instance_stack[level]
                .active_aux
                .iter()
                .copied()
                .filter(|&aux| index.takes_priority_over(NodeIndex::new(instance, aux)))
                .collect();
            for aux in removals {
                self.search_data
                    .add_unique_update(SearchUpdate::aux(aux, instance, UpdateMode::Remove));
            }
        }
    }

    // ---------------------------------------------------------------------------------------
    // Composite bookkeeping

    pub(crate) fn current_child(&self, instance: u16, composite: NodeId) -> Option<usize> {
        let slot = self.template(instance)?.get(composite)?.memory();
        let value: i32 = self.read_header(instance, &slot, 0);
        usize::try_from(value).ok()
    }

    pub(crate) fn set_current_child(&mut self, instance: u16, composite: NodeId, child: Option<usize>) {
        let Some(slot) = self
            .template(instance)
            .and_then(|t| t.get(composite).map(|n| n.memory()))
        else {
            return;
        };
        let value = child.map_or(CHILD_NOT_INITIALIZED, |c| c as i32);
        self.write_header(instance, &slot, 0, value);
    }

    fn find_child_to_execute(
        &mut self,
        instance: u16,
        composite: NodeId,
        result: &mut NodeResult,
    ) -> ChildSelection {
        let Some(template) = self.template(instance) else {
            return ChildSelection::ReturnToParent;
        };
        let child_count = template.children(composite).len();
        let previous = self.current_child(instance, composite);
        let mut selection = self.next_child(instance, composite, previous, *result);

        loop {
            match selection {
                ChildSelection::Child(index) if index < child_count => {
                    if self.decorators_allow(instance, composite, index) {
                        self.on_child_activation(instance, composite, index);
                        return ChildSelection::Child(index);
                    }
                    *result = NodeResult::Failed;
                    self.notify_decorators_on_failed_activation(instance, composite, index, result);
                    if let Some(start) = self.search_data.search_start {
                        if start.instance == instance
                            && template.child_containing(composite, start.execution) == Some(index)
                        {
                            self.search_data.search_start = None;
                        }
                    }
                    selection = self.next_child(instance, composite, Some(index), *result);
                }
                ChildSelection::Child(_) => return ChildSelection::ReturnToParent,
                other => return other,
            }
        }
    }

    /// Child under the pending search start, else whatever the composite's policy picks.
    fn next_child(
        &mut self,
        instance: u16,
        composite: NodeId,
        previous: Option<usize>,
        last_result: NodeResult,
    ) -> ChildSelection {
        if let Some(start) = self.search_data.search_start {
            if start.instance == instance {
                if let Some(template) = self.template(instance) {
                    if let Some(child) = template.child_containing(composite, start.execution) {
                        if template.child_execution_index(composite, child) == start.execution {
                            self.search_data.search_start = None;
                        }
                        return ChildSelection::Child(child);
                    }
                }
            }
        }
        self.call_node(instance, composite, |object, ctx| match object.as_composite() {
            Some(policy) => policy.next_child(ctx, previous, last_result),
            None => ChildSelection::ReturnToParent,
        })
        .unwrap_or(ChildSelection::ReturnToParent)
    }

    fn notify_decorators_on_failed_activation(
        &mut self,
        instance: u16,
        composite: NodeId,
        child: usize,
        result: &mut NodeResult,
    ) {
        let Some(template) = self.template(instance) else {
            return;
        };
        let Some(edge) = template.children(composite).get(child) else {
            return;
        };
        for &decorator in &edge.decorators {
            self.call_node(instance, decorator, |object, ctx| {
                if let Some(d) = object.as_decorator() {
                    d.on_node_processed(ctx, result);
                }
            });
            if template.node(decorator).abort_mode().observes_lower_priority() {
                self.search_data.add_unique_update(SearchUpdate::aux(
                    decorator,
                    instance,
                    UpdateMode::AddForLowerPri,
                ));
            }
        }
    }

    fn on_child_activation(&mut self, instance: u16, composite: NodeId, child: usize) {
        let Some(template) = self.template(instance) else {
            return;
        };
        let Some(edge) = template.children(composite).get(child) else {
            return;
        };
        for &decorator in &edge.decorators {
            self.call_node(instance, decorator, |object, ctx| {
                if let Some(d) = object.as_decorator() {
                    d.on_node_activation(ctx);
                }
            });
            self.search_data
                .add_unique_update(SearchUpdate::aux(decorator, instance, UpdateMode::Add));
        }
        if template.node(edge.node).is_composite() {
            self.activate_composite(instance, edge.node);
        }
        self.set_current_child(instance, composite, Some(child));
    }

    pub(crate) fn on_child_deactivation(
        &mut self,
        instance: u16,
        composite: NodeId,
        child: usize,
        result: &mut NodeResult,
    ) {
        let Some(template) = self.template(instance) else {
            return;
        };
        let Some(edge) = template.children(composite).get(child) else {
            return;
        };
        if template.node(edge.node).is_composite() {
            self.deactivate_composite(instance, edge.node, result);
        }
        for &decorator in &edge.decorators {
            self.call_node(instance, decorator, |object, ctx| {
                if let Some(d) = object.as_decorator() {
                    d.on_node_deactivation(ctx, result);
                }
            });
            if template.node(decorator).abort_mode().leaves_with_branch() {
                self.search_data
                    .add_unique_update(SearchUpdate::aux(decorator, instance, UpdateMode::Remove));
            }
        }
    }

    fn activate_composite(&mut self, instance: u16, composite: NodeId) {
        let Some(template) = self.template(instance) else {
            return;
        };
        self.set_current_child(instance, composite, None);
        self.call_node(instance, composite, |object, ctx| {
            if let Some(policy) = object.as_composite() {
                policy.on_node_activation(ctx);
            }
        });
        for &service in template.services(composite) {
            self.search_data
                .add_unique_update(SearchUpdate::aux(service, instance, UpdateMode::Add).post());
        }
    }

    fn restart_composite(&mut self, instance: u16, composite: NodeId) {
        tracing::trace!(instance, composite = %composite, "composite restarted");
        self.set_current_child(instance, composite, None);
        self.call_node(instance, composite, |object, ctx| {
            if let Some(policy) = object.as_composite() {
                policy.on_node_restart(ctx);
            }
        });
    }

    pub(crate) fn deactivate_composite(&mut self, instance: u16, composite: NodeId, result: &mut NodeResult) {
        let Some(template) = self.template(instance) else {
            return;
        };
        self.call_node(instance, composite, |object, ctx| {
            if let Some(policy) = object.as_composite() {
                policy.on_node_deactivation(ctx, result);
            }
        });
        for &service in template.services(composite) {
            self.search_data
                .add_unique_update(SearchUpdate::aux(service, instance, UpdateMode::Remove));
        }
        for edge in template.children(composite) {
            for &decorator in &edge.decorators {
                self.search_data
                    .add_unique_update(SearchUpdate::aux(decorator, instance, UpdateMode::Remove));
            }
        }
    }

    // ---------------------------------------------------------------------------------------
    // Buffered aux/parallel updates

    /// Applies every queued update: regular ones first, then post-updates (service additions).
    pub(crate) fn apply_search_data(&mut self, new_task: Option<NodeIndex>) {
        let updates = std::mem::take(&mut self.search_data.pending_updates);
        self.apply_search_updates(&updates, new_task, false);
        self.apply_search_updates(&updates, new_task, true);
    }

    /// Applies regular updates up to and including `last`; post-updates in that range stay
    /// queued.
    fn apply_search_data_up_to(&mut self, last: usize) {
        let rest = self.search_data.pending_updates.split_off(last + 1);
        let head = std::mem::replace(&mut self.search_data.pending_updates, rest);
        let (post, now): (Vec<_>, Vec<_>) = head.into_iter().partition(|u| u.post_update);
        self.apply_search_updates(&now, None, false);
        let mut pending = post;
        pending.append(&mut self.search_data.pending_updates);
        self.search_data.pending_updates = pending;
    }

    fn apply_search_updates(&mut self, updates: &[SearchUpdate], new_task: Option<NodeIndex>, post: bool) {
        for update in updates {
            if update.post_update != post {
                continue;
            }
            let Some(info) = self.instance_stack.get(update.instance as usize) else {
                continue;
            };
            let is_active = match update.target {
                UpdateTarget::Aux => info.is_aux_active(update.node),
                UpdateTarget::ParallelTask => {
                    info.parallel_task_status(update.node) == Some(TaskStatus::Active)
                }
            };
            let skip = match update.mode {
                UpdateMode::Remove => !is_active,
                UpdateMode::Add => is_active,
                UpdateMode::AddForLowerPri => {
                    is_active
                        || !new_task.is_some_and(|task| update.index().takes_priority_over(task))
                }
            };
            if skip {
                continue;
            }

            match update.target {
                UpdateTarget::Aux => {
                    if update.mode == UpdateMode::Remove
                        && self.is_looping_root_service(update.instance, update.node)
                    {
                        tracing::trace!(node = %update.node, "root service kept across loop");
                        continue;
                    }
                    match update.mode {
                        UpdateMode::Remove => self.deactivate_aux(update.instance, update.node),
                        UpdateMode::Add | UpdateMode::AddForLowerPri => {
                            self.activate_aux(update.instance, update.node)
                        }
                    }
                }
                UpdateTarget::ParallelTask => match update.mode {
                    UpdateMode::Remove => self.abort_parallel_task(update.instance, update.node),
                    UpdateMode::Add | UpdateMode::AddForLowerPri => {
                        self.register_parallel_task(update.instance, update.node)
                    }
                },
            }
        }
    }

    fn is_looping_root_service(&self, instance: u16, node: NodeId) -> bool {
        if self.execution_mode != ExecutionMode::Looped || instance != 0 {
            return false;
        }
        let Some(info) = self.instance_stack.first() else {
            return false;
        };
        info.template
            .get(node)
            .is_some_and(|n| n.is_service() && n.parent() == Some(info.root()))
    }

    pub(crate) fn activate_aux(&mut self, instance: u16, node: NodeId) {
        let Some(template) = self.template(instance) else {
            return;
        };
        let Some(info) = template.get(node) else {
            return;
        };
        let added = self
            .instance_stack
            .get_mut(instance as usize)
            .is_some_and(|i| i.add_aux(node));
        if !added {
            return;
        }
        tracing::trace!(instance, node = %info.name(), "aux node became relevant");
        self.trace_event("bt.aux.add", instance, node);

        match *info.kind() {
            NodeKind::Service {
                interval,
                random_deviation,
            } => {
                let slot = info.memory();
                let next = self.rng.jitter(interval, random_deviation);
                self.write_header(instance, &slot, 0, next);
                self.write_header(instance, &slot, 4, 0.0f32);
                self.call_node(instance, node, |object, ctx| {
                    if let Some(service) = object.as_service() {
                        service.on_become_relevant(ctx);
                    }
                });
            }
            NodeKind::Decorator { .. } => {
                self.call_node(instance, node, |object, ctx| {
                    if let Some(decorator) = object.as_decorator() {
                        decorator.on_become_relevant(ctx);
                    }
                });
            }
            _ => {}
        }
    }

    pub(crate) fn deactivate_aux(&mut self, instance: u16, node: NodeId) {
        let removed = self
            .instance_stack
            .get_mut(instance as usize)
            .is_some_and(|i| i.remove_aux(node));
        if !removed {
            return;
        }
        tracing::trace!(instance, node = %node, "aux node ceased relevance");
        self.trace_event("bt.aux.remove", instance, node);

        self.call_node(instance, node, |object, ctx| {
            if let Some(decorator) = object.as_decorator() {
                decorator.on_cease_relevant(ctx);
            } else if let Some(service) = object.as_service() {
                service.on_cease_relevant(ctx);
            }
        });
        if let Some(serial) = self.instance_stack.get(instance as usize).map(|i| i.serial) {
            self.blackboard
                .unregister_observers_from(observer_owner(serial, node));
        }
    }

    // ---------------------------------------------------------------------------------------
    // Tasks

    fn execute_task(&mut self, instance: u16, task: NodeId) {
        if let Some(info) = self.instance_stack.get_mut(instance as usize) {
            info.active_node = Some(task);
            info.active_kind = ActiveNodeKind::ActiveTask;
        }
        tracing::debug!(instance, task = %task, "executing task");
        self.trace_event("bt.task.execute", instance, task);

        let Some((mut result, effects)) = self.with_node(instance, task, |object, ctx| {
            match object.as_task() {
                Some(task) => task.execute(ctx),
                None => NodeResult::Failed,
            }
        }) else {
            return;
        };

        let mut pushes = self.apply_effects(instance, task, effects).into_iter();
        if result == NodeResult::InProgress {
            if let Some(asset) = pushes.next() {
                if !self.push_instance(&asset) {
                    result = NodeResult::Failed;
                }
            }
        }
        if pushes.next().is_some() {
            tracing::warn!(instance, task = %task, "extra subtree pushes ignored");
        }

        self.on_task_finished(instance, task, result);
    }

    fn abort_current_task(&mut self) {
        let level = self.active_instance;
        let Some(task) = self
            .instance_stack
            .get(level as usize)
            .and_then(|info| info.active_node)
        else {
            return;
        };
        self.unregister_task_observers(NodeIndex::new(level, task));
        tracing::debug!(instance = level, task = %task, "aborting task");
        self.trace_event("bt.task.abort", level, task);

        let result = self
            .call_node(level, task, |object, ctx| match object.as_task() {
                Some(task) => task.abort(ctx),
                None => NodeResult::Aborted,
            })
            .unwrap_or(NodeResult::Aborted);
        if let Some(info) = self.instance_stack.get_mut(level as usize) {
            info.active_kind = ActiveNodeKind::AbortingTask;
        }
        self.on_task_finished(level, task, result);
    }

    fn abort_parallel_task(&mut self, instance: u16, task: NodeId) {
        self.unregister_task_observers(NodeIndex::new(instance, task));
        self.trace_event("bt.task.abort", instance, task);
        let result = self
            .call_node(instance, task, |object, ctx| match object.as_task() {
                Some(task) => task.abort(ctx),
                None => NodeResult::Aborted,
            })
            .unwrap_or(NodeResult::Aborted);
        tracing::debug!(instance, task = %task, ?result, "parallel task aborted");
        if result == NodeResult::InProgress {
            if let Some(info) = self.instance_stack.get_mut(instance as usize) {
                info.set_parallel_status(task, TaskStatus::Aborting);
            }
            self.waiting_for_aborting_tasks = true;
        }
        self.on_task_finished(instance, task, result);
    }

    /// Aborts every running task without waiting for latent aborts.
    pub(crate) fn abort_all_tasks(&mut self) {
        for level in (0..self.instance_stack.len()).rev() {
            let instance = level as u16;
            let info = &self.instance_stack[level];
            let mut tasks: Vec<NodeId> = info
                .parallel_tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Active)
                .map(|t| t.node)
                .collect();
            if level == self.active_instance as usize && info.active_kind == ActiveNodeKind::ActiveTask {
                tasks.extend(info.active_node);
            }
            for task in tasks {
                self.unregister_task_observers(NodeIndex::new(instance, task));
                self.trace_event("bt.task.abort", instance, task);
                self.call_node(instance, task, |object, ctx| {
                    if let Some(task) = object.as_task() {
                        task.abort(ctx);
                    }
                });
            }
        }
    }

    pub(crate) fn on_task_finished(&mut self, instance: u16, task: NodeId, result: NodeResult) {
        let Some(template) = self.template(instance) else {
            return;
        };
        let Some(info) = template.get(task) else {
            return;
        };
        let mut result = result;
        let was_waiting = self.waiting_for_aborting_tasks;

        if let (Some(parent), Some(index)) = (info.parent(), info.child_index()) {
            if let Some(((), effects)) = self.with_node(instance, parent, |object, ctx| {
                if let Some(policy) = object.as_composite() {
                    policy.on_child_execution(ctx, index, &mut result);
                }
            }) {
                self.apply_effects(instance, parent, effects);
            }
        }

        if !result.is_terminal() {
            self.update_aborting_tasks();
            return;
        }

        tracing::debug!(instance, task = %info.name(), ?result, "task finished");
        self.trace_event("bt.task.finished", instance, task);
        self.unregister_task_observers(NodeIndex::new(instance, task));

        let active = self.active_instance;
        match self.instance_stack.get_mut(instance as usize) {
            Some(level) if level.active_node == Some(task) && instance == active => {
                let was_aborting = level.active_kind == ActiveNodeKind::AbortingTask;
                level.active_kind = ActiveNodeKind::InactiveTask;
                if !was_aborting {
                    self.request_execution_after_task(result);
                }
            }
            Some(level) if level.active_node == Some(task) && result == NodeResult::Aborted => {
                level.active_kind = ActiveNodeKind::InactiveTask;
            }
            _ => {}
        }

        self.update_aborting_tasks();
        if was_waiting && !self.waiting_for_aborting_tasks {
            self.requested_flow_update = true;
        }
    }

    fn update_aborting_tasks(&mut self) {
        let top_aborting = self
            .instance_stack
            .last()
            .is_some_and(|info| info.active_kind == ActiveNodeKind::AbortingTask);
        self.waiting_for_aborting_tasks = top_aborting
            || self.instance_stack.iter().any(|info| {
                info.parallel_tasks
                    .iter()
                    .any(|t| t.status == TaskStatus::Aborting)
            });
    }

    pub(crate) fn register_parallel_task(&mut self, instance: u16, task: NodeId) {
        let Some(info) = self.instance_stack.get_mut(instance as usize) else {
            return;
        };
        match info.parallel_tasks.iter_mut().find(|t| t.node == task) {
            Some(existing) => existing.status = TaskStatus::Active,
            None => info.parallel_tasks.push(ParallelTask {
                node: task,
                status: TaskStatus::Active,
            }),
        }
        if info.active_node == Some(task) {
            info.active_kind = ActiveNodeKind::InactiveTask;
        }
        tracing::trace!(instance, task = %task, "parallel task registered");
    }

    pub(crate) fn unregister_parallel_task(&mut self, instance: u16, task: NodeId) {
        let Some(info) = self.instance_stack.get_mut(instance as usize) else {
            return;
        };
        let before = info.parallel_tasks.len();
        info.parallel_tasks.retain(|t| t.node != task);
        if info.parallel_tasks.len() != before {
            tracing::trace!(instance, task = %task, "parallel task unregistered");
            self.update_aborting_tasks();
        }
    }
}
