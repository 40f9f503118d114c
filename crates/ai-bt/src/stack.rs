//! Instance stack: pushing subtrees, popping finished ones and locating common ancestors.

use std::sync::Arc;

use crate::asset::{AssetId, BehaviorTreeAsset};
use crate::bt::{NodeId, NodeResult};
use crate::component::BehaviorTreeComponent;
use crate::error::{BehaviorTreeError, Result};
use crate::instance::{KnownInstance, TreeInstance};
use crate::memory::InstanceMemory;

impl BehaviorTreeComponent {
    /// Pushes `asset` as a new instance on top of the stack and requests execution of its root.
    pub fn push_instance(&mut self, asset: &Arc<BehaviorTreeAsset>) -> bool {
        match self.try_push_instance(asset) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(%err, tree = %asset.name(), "failed to push subtree");
                false
            }
        }
    }

    /// Fails without touching the stack when the template cannot load, the blackboard cannot
    /// serve the asset's schema, the composite owning the active node refuses subtrees, or the
    /// depth limit is reached.
    pub fn try_push_instance(&mut self, asset: &Arc<BehaviorTreeAsset>) -> Result<()> {
        let template = self.templates().load(asset)?;

        if let Some(schema) = template.blackboard_schema() {
            if self.blackboard.is_bound() && !self.blackboard.is_compatible_with(schema) {
                return Err(BehaviorTreeError::IncompatibleSchema {
                    asset: asset.name().to_string(),
                    schema: schema.name().to_string(),
                });
            }
        }

        let origin = self.instance_stack.len().checked_sub(1).map(|level| level as u16);
        let origin_node = origin
            .and_then(|level| self.instance_stack.get(level as usize))
            .and_then(|info| info.active_node);

        if let (Some(level), Some(active)) = (origin, origin_node) {
            if let Some(origin_template) = self.template(level) {
                let owner = origin_template.parent(active);
                let edge = origin_template.node(active).child_index();
                if let (Some(parent), Some(edge)) = (owner, edge) {
                    let allowed = self
                        .call_node(level, parent, |object, ctx| {
                            object
                                .as_composite()
                                .map_or(true, |policy| policy.can_push_subtree(ctx, edge))
                        })
                        .unwrap_or(true);
                    if !allowed {
                        return Err(BehaviorTreeError::SubtreeRejected {
                            asset: asset.name().to_string(),
                            composite: origin_template.node(parent).name().to_string(),
                        });
                    }
                }
            }
        }

        if self.instance_stack.len() >= self.config.max_instance_depth {
            return Err(BehaviorTreeError::InstanceDepthExceeded(
                self.config.max_instance_depth,
            ));
        }

        let known = self.known_instance_for(asset.id(), origin, origin_node);
        let serial = self.next_instance_serial;
        self.next_instance_serial = self.next_instance_serial.wrapping_add(1);
        self.instance_stack
            .push(TreeInstance::new(template.clone(), known, serial));
        self.instance_memory
            .push(InstanceMemory::new(template.instance_memory_size()));
        let level = (self.instance_stack.len() - 1) as u16;
        self.active_instance = level;

        for node in template.nodes() {
            if node.is_composite() {
                self.set_current_child(level, node.execution_index(), None);
            }
        }

        let root = template.root();
        for &service in template.services(root) {
            self.activate_aux(level, service);
        }

        tracing::debug!(tree = %asset.name(), instance = level, "instance pushed");
        self.trace_event("bt.instance.push", level, root);
        self.request_execution(root, level, root, None, NodeResult::InProgress);
        Ok(())
    }

    /// Index into `known_instances` for `asset` entered from the current stack path.
    fn known_instance_for(&mut self, asset: AssetId, origin: Option<u16>, origin_node: Option<NodeId>) -> usize {
        let mut path = vec![origin_node.map_or(u16::MAX, |node| node.0)];
        if let Some(origin) = origin {
            for level in (0..origin as usize).rev() {
                let active = self.instance_stack[level].active_node;
                path.push(active.map_or(u16::MAX, |node| node.0));
            }
        }

        if let Some(index) = self
            .known_instances
            .iter()
            .position(|known| known.asset == asset && known.path == path)
        {
            return index;
        }
        self.known_instances.push(KnownInstance::new(asset, path));
        self.known_instances.len() - 1
    }

    /// Ends relevance of every aux node in `level` and forgets its latent task observers.
    pub(crate) fn cleanup_instance(&mut self, level: u16) {
        let Some(info) = self.instance_stack.get(level as usize) else {
            return;
        };
        let aux = info.active_aux.clone();
        for node in aux.into_iter().rev() {
            self.deactivate_aux(level, node);
        }
        self.task_observers
            .retain(|_, observed| observed.instance != level);
        if let Some(info) = self.instance_stack.get_mut(level as usize) {
            info.parallel_tasks.clear();
        }
    }

    pub(crate) fn pop_instance(&mut self) {
        let Some(level) = self.instance_stack.len().checked_sub(1) else {
            return;
        };
        let level = level as u16;
        self.cleanup_instance(level);
        if let Some(info) = self.instance_stack.pop() {
            tracing::debug!(tree = %info.template.name(), instance = level, "instance popped");
            self.trace_event("bt.instance.pop", level, info.root());
        }
        self.instance_memory.pop();
    }

    pub(crate) fn truncate_instances(&mut self, len: usize) {
        while self.instance_stack.len() > len {
            self.pop_instance();
        }
    }

    /// Deepest composite that is an ancestor of both nodes. The result lives in the lower of
    /// the two instances; the node in the higher instance is represented there by the composite
    /// owning that level's active node.
    pub(crate) fn find_common_parent(
        &self,
        a: NodeId,
        a_instance: u16,
        b: NodeId,
        b_instance: u16,
    ) -> Option<(u16, NodeId)> {
        let common_instance = a_instance.min(b_instance);
        let info = self.instance_stack.get(common_instance as usize)?;
        let template = &info.template;
        let represent = |instance: u16, node: NodeId| {
            if instance == common_instance {
                node
            } else {
                info.active_node
                    .and_then(|active| template.parent(active))
                    .unwrap_or(info.root())
            }
        };

        let mut a = represent(a_instance, a);
        let mut b = represent(b_instance, b);
        let depth = |node: NodeId| template.get(node).map(|n| n.tree_depth());
        let (mut a_depth, mut b_depth) = (depth(a)?, depth(b)?);

        while a_depth > b_depth {
            a = template.parent(a)?;
            a_depth -= 1;
        }
        while b_depth > a_depth {
            b = template.parent(b)?;
            b_depth -= 1;
        }
        while a != b {
            a = template.parent(a)?;
            b = template.parent(b)?;
        }
        Some((common_instance, a))
    }
}
