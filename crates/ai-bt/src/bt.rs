use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Outcome reported by tasks and propagated through composites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum NodeResult {
    Succeeded,
    Failed,
    Aborted,
    InProgress,
}

impl NodeResult {
    pub fn is_terminal(self) -> bool {
        !matches!(self, NodeResult::InProgress)
    }

    pub(crate) fn to_byte(self) -> u8 {
        match self {
            NodeResult::Succeeded => 0,
            NodeResult::Failed => 1,
            NodeResult::Aborted => 2,
            NodeResult::InProgress => 3,
        }
    }

    pub(crate) fn from_byte(value: u8) -> Self {
        match value {
            0 => NodeResult::Succeeded,
            2 => NodeResult::Aborted,
            3 => NodeResult::InProgress,
            _ => NodeResult::Failed,
        }
    }
}

/// Status of a task as seen from outside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TaskStatus {
    Active,
    Aborting,
    Inactive,
}

/// What the active node of an instance currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ActiveNodeKind {
    #[default]
    Composite,
    ActiveTask,
    AbortingTask,
    InactiveTask,
}

/// Which branches a decorator may abort when its condition changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum FlowAbortMode {
    #[default]
    None,
    LowerPriority,
    SelfBranch,
    Both,
}

impl FlowAbortMode {
    pub fn observes_lower_priority(self) -> bool {
        matches!(self, FlowAbortMode::LowerPriority | FlowAbortMode::Both)
    }

    /// Decorators in these modes stop being relevant when their branch is left.
    pub(crate) fn leaves_with_branch(self) -> bool {
        matches!(self, FlowAbortMode::None | FlowAbortMode::SelfBranch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ExecutionMode {
    #[default]
    Looped,
    SingleRun,
}

/// Coarse engine state for introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionState {
    Idle,
    Searching,
    TaskActive,
    TaskAborting,
    Suspended,
    Stopped,
}

/// Child picked by a composite during search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildSelection {
    Child(usize),
    ReturnToParent,
    /// Park the search on this composite until something requests execution again.
    Suspend,
}

/// Execution index of a template node. Also its position in the template arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NodeId(pub u16);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A node addressed within the instance stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NodeIndex {
    pub instance: u16,
    pub execution: u16,
}

impl NodeIndex {
    pub fn new(instance: u16, node: NodeId) -> Self {
        Self {
            instance,
            execution: node.0,
        }
    }

    pub fn node(self) -> NodeId {
        NodeId(self.execution)
    }

    /// Instances closer to the root win, then lower execution indices.
    pub fn takes_priority_over(self, other: NodeIndex) -> bool {
        if self.instance != other.instance {
            return self.instance < other.instance;
        }
        self.execution < other.execution
    }
}

impl fmt::Display for NodeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.instance, self.execution)
    }
}
