use std::collections::BTreeMap;
use std::sync::Arc;

use crate::asset::AssetId;
use crate::bt::{ActiveNodeKind, NodeId, TaskStatus};
use crate::template::TreeTemplate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParallelTask {
    pub node: NodeId,
    pub status: TaskStatus,
}

/// One level of the instance stack: a running tree (the root tree or a pushed subtree).
#[derive(Debug, Clone)]
pub struct TreeInstance {
    pub(crate) template: Arc<TreeTemplate>,
    pub(crate) known_instance: usize,
    pub(crate) serial: u32,
    pub(crate) active_node: Option<NodeId>,
    pub(crate) active_kind: ActiveNodeKind,
    pub(crate) active_aux: Vec<NodeId>,
    pub(crate) parallel_tasks: Vec<ParallelTask>,
}

impl TreeInstance {
    pub(crate) fn new(template: Arc<TreeTemplate>, known_instance: usize, serial: u32) -> Self {
        Self {
            template,
            known_instance,
            serial,
            active_node: None,
            active_kind: ActiveNodeKind::Composite,
            active_aux: Vec::new(),
            parallel_tasks: Vec::new(),
        }
    }

    pub fn template(&self) -> &Arc<TreeTemplate> {
        &self.template
    }

    pub fn root(&self) -> NodeId {
        self.template.root()
    }

    pub fn active_node(&self) -> Option<NodeId> {
        self.active_node
    }

    pub fn active_kind(&self) -> ActiveNodeKind {
        self.active_kind
    }

    /// Decorators and services currently relevant, in tree order.
    pub fn active_aux_nodes(&self) -> &[NodeId] {
        &self.active_aux
    }

    pub fn parallel_tasks(&self) -> &[ParallelTask] {
        &self.parallel_tasks
    }

    pub fn is_aux_active(&self, node: NodeId) -> bool {
        self.active_aux.binary_search(&node).is_ok()
    }

    /// Keeps the list sorted; returns `false` if already present.
    pub(crate) fn add_aux(&mut self, node: NodeId) -> bool {
        match self.active_aux.binary_search(&node) {
            Ok(_) => false,
            Err(pos) => {
                self.active_aux.insert(pos, node);
                true
            }
        }
    }

    pub(crate) fn remove_aux(&mut self, node: NodeId) -> bool {
        match self.active_aux.binary_search(&node) {
            Ok(pos) => {
                self.active_aux.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    pub fn task_status(&self, node: NodeId) -> TaskStatus {
        if let Some(task) = self.parallel_tasks.iter().find(|t| t.node == node) {
            return task.status;
        }
        if self.active_node == Some(node) {
            return match self.active_kind {
                ActiveNodeKind::ActiveTask => TaskStatus::Active,
                ActiveNodeKind::AbortingTask => TaskStatus::Aborting,
                _ => TaskStatus::Inactive,
            };
        }
        TaskStatus::Inactive
    }

    pub(crate) fn parallel_task_status(&self, node: NodeId) -> Option<TaskStatus> {
        self.parallel_tasks
            .iter()
            .find(|t| t.node == node)
            .map(|t| t.status)
    }

    pub(crate) fn set_parallel_status(&mut self, node: NodeId, status: TaskStatus) {
        if let Some(task) = self.parallel_tasks.iter_mut().find(|t| t.node == node) {
            task.status = status;
        }
    }
}

/// Stable identity of a tree run at a particular place in the stack, so instanced nodes are
/// reused when the same subtree is entered again from the same path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownInstance {
    pub asset: AssetId,
    pub path: Vec<u16>,
    pub(crate) node_instances: BTreeMap<NodeId, usize>,
}

impl KnownInstance {
    pub(crate) fn new(asset: AssetId, path: Vec<u16>) -> Self {
        Self {
            asset,
            path,
            node_instances: BTreeMap::new(),
        }
    }

    pub fn instanced_node_count(&self) -> usize {
        self.node_instances.len()
    }
}
