use crate::bt::{NodeId, NodeIndex, NodeResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UpdateMode {
    Add,
    Remove,
    /// Activate a lower-priority-abort decorator only if it ends up guarding something with
    /// higher priority than the task the search found.
    AddForLowerPri,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UpdateTarget {
    Aux,
    ParallelTask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SearchUpdate {
    pub(crate) node: NodeId,
    pub(crate) instance: u16,
    pub(crate) target: UpdateTarget,
    pub(crate) mode: UpdateMode,
    pub(crate) post_update: bool,
}

impl SearchUpdate {
    pub(crate) fn aux(node: NodeId, instance: u16, mode: UpdateMode) -> Self {
        Self {
            node,
            instance,
            target: UpdateTarget::Aux,
            mode,
            post_update: false,
        }
    }

    pub(crate) fn task(node: NodeId, instance: u16, mode: UpdateMode) -> Self {
        Self {
            node,
            instance,
            target: UpdateTarget::ParallelTask,
            mode,
            post_update: false,
        }
    }

    pub(crate) fn post(mut self) -> Self {
        self.post_update = true;
        self
    }

    pub(crate) fn index(&self) -> NodeIndex {
        NodeIndex::new(self.instance, self.node)
    }

    fn same_target(&self, other: &SearchUpdate) -> bool {
        self.node == other.node && self.instance == other.instance && self.target == other.target
    }
}

/// Buffered side effects of one search pass.
#[derive(Debug, Default)]
pub(crate) struct SearchData {
    pub(crate) pending_updates: Vec<SearchUpdate>,
    /// Child edge the search must enter first on a restart.
    pub(crate) search_start: Option<NodeIndex>,
}

impl SearchData {
    /// Queues `update`, dropping an earlier update for the same node. An add/remove pair for
    /// the same node cancels out entirely.
    pub(crate) fn add_unique_update(&mut self, update: SearchUpdate) {
        let mut skip = false;
        if let Some(pos) = self
            .pending_updates
            .iter()
            .position(|existing| existing.same_target(&update))
        {
            let existing = self.pending_updates[pos];
            if existing.mode == update.mode {
                return;
            }
            let is_add = |m: UpdateMode| matches!(m, UpdateMode::Add | UpdateMode::AddForLowerPri);
            skip = (existing.mode == UpdateMode::Remove && is_add(update.mode))
                || (is_add(existing.mode) && update.mode == UpdateMode::Remove);
            self.pending_updates.remove(pos);
        }
        if !skip {
            self.pending_updates.push(update);
        }
    }

    pub(crate) fn reset(&mut self) {
        self.pending_updates.clear();
        self.search_start = None;
    }
}

/// The single pending request to re-run the search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ExecutionRequest {
    pub(crate) execute_instance: u16,
    pub(crate) execute_node: NodeId,
    pub(crate) search_start: NodeIndex,
    pub(crate) continue_with: NodeResult,
    pub(crate) try_next_child: bool,
}
