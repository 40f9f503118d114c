//! Authoring-side tree definitions.
//!
//! An asset is a plain description; [`crate::TemplateCache`] compiles it into an immutable
//! [`crate::TreeTemplate`] that running components share.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ai_core::BlackboardSchema;

use crate::bt::FlowAbortMode;
use crate::logic::DecoratorLogic;
use crate::node::{Composite, Decorator, Service, Task};
use crate::nodes::{Selector, Sequence};

static NEXT_ASSET_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of an asset object. Two separately built assets never share an id, even when
/// their contents are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AssetId(u64);

impl AssetId {
    pub fn get(self) -> u64 {
        self.0
    }
}

pub struct BehaviorTreeAsset {
    id: AssetId,
    name: String,
    root: Option<CompositeDef>,
    blackboard: Option<Arc<BlackboardSchema>>,
    root_decorators: Vec<DecoratorDef>,
    root_decorator_logic: Vec<DecoratorLogic>,
}

impl std::fmt::Debug for BehaviorTreeAsset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BehaviorTreeAsset")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("has_root", &self.root.is_some())
            .finish()
    }
}

impl BehaviorTreeAsset {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: AssetId(NEXT_ASSET_ID.fetch_add(1, Ordering::Relaxed)),
            name: name.into(),
            root: None,
            blackboard: None,
            root_decorators: Vec::new(),
            root_decorator_logic: Vec::new(),
        }
    }

    pub fn root(mut self, root: CompositeDef) -> Self {
        self.root = Some(root);
        self
    }

    pub fn blackboard(mut self, schema: Arc<BlackboardSchema>) -> Self {
        self.blackboard = Some(schema);
        self
    }

    /// Decorators injected onto the edge of any task that runs this tree as a subtree.
    pub fn root_decorator(mut self, decorator: DecoratorDef) -> Self {
        self.root_decorators.push(decorator);
        self
    }

    pub fn root_decorator_logic(mut self, logic: Vec<DecoratorLogic>) -> Self {
        self.root_decorator_logic = logic;
        self
    }

    pub fn build(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn id(&self) -> AssetId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root_node(&self) -> Option<&CompositeDef> {
        self.root.as_ref()
    }

    pub fn blackboard_schema(&self) -> Option<&Arc<BlackboardSchema>> {
        self.blackboard.as_ref()
    }

    pub fn root_decorators(&self) -> &[DecoratorDef] {
        &self.root_decorators
    }

    pub fn root_logic(&self) -> &[DecoratorLogic] {
        &self.root_decorator_logic
    }
}

pub struct CompositeDef {
    pub name: String,
    pub behavior: Arc<dyn Composite>,
    pub services: Vec<ServiceDef>,
    pub children: Vec<ChildDef>,
}

impl CompositeDef {
    pub fn new(name: impl Into<String>, behavior: impl Composite) -> Self {
        Self {
            name: name.into(),
            behavior: Arc::new(behavior),
            services: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn sequence(name: impl Into<String>) -> Self {
        Self::new(name, Sequence)
    }

    pub fn selector(name: impl Into<String>) -> Self {
        Self::new(name, Selector)
    }

    pub fn service(mut self, service: ServiceDef) -> Self {
        self.services.push(service);
        self
    }

    pub fn child(mut self, child: ChildDef) -> Self {
        self.children.push(child);
        self
    }

    pub fn task(self, task: TaskDef) -> Self {
        self.child(ChildDef::task(task))
    }

    pub fn composite(self, composite: CompositeDef) -> Self {
        self.child(ChildDef::composite(composite))
    }
}

pub enum ChildNode {
    Composite(CompositeDef),
    Task(TaskDef),
    /// Unresolved reference; dropped when the template is built.
    Missing,
}

/// One child edge: its decorators and the node below them.
pub struct ChildDef {
    pub decorators: Vec<DecoratorDef>,
    pub logic: Vec<DecoratorLogic>,
    pub node: ChildNode,
}

impl ChildDef {
    pub fn task(task: TaskDef) -> Self {
        Self {
            decorators: Vec::new(),
            logic: Vec::new(),
            node: ChildNode::Task(task),
        }
    }

    pub fn composite(composite: CompositeDef) -> Self {
        Self {
            decorators: Vec::new(),
            logic: Vec::new(),
            node: ChildNode::Composite(composite),
        }
    }

    pub fn missing() -> Self {
        Self {
            decorators: Vec::new(),
            logic: Vec::new(),
            node: ChildNode::Missing,
        }
    }

    pub fn decorator(mut self, decorator: DecoratorDef) -> Self {
        self.decorators.push(decorator);
        self
    }

    pub fn logic(mut self, logic: Vec<DecoratorLogic>) -> Self {
        self.logic = logic;
        self
    }
}

pub struct TaskDef {
    pub name: String,
    pub behavior: Arc<dyn Task>,
}

impl TaskDef {
    pub fn new(name: impl Into<String>, behavior: impl Task) -> Self {
        Self::shared(name, Arc::new(behavior))
    }

    pub fn shared(name: impl Into<String>, behavior: Arc<dyn Task>) -> Self {
        Self {
            name: name.into(),
            behavior,
        }
    }
}

pub struct DecoratorDef {
    pub name: String,
    pub behavior: Option<Arc<dyn Decorator>>,
    pub abort_mode: FlowAbortMode,
    pub inverse: bool,
}

impl DecoratorDef {
    pub fn new(name: impl Into<String>, behavior: impl Decorator) -> Self {
        Self::shared(name, Arc::new(behavior))
    }

    /// Decorator whose behavior object is also used by other edges or assets.
    pub fn shared(name: impl Into<String>, behavior: Arc<dyn Decorator>) -> Self {
        Self {
            name: name.into(),
            behavior: Some(behavior),
            abort_mode: FlowAbortMode::None,
            inverse: false,
        }
    }

    pub fn missing(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            behavior: None,
            abort_mode: FlowAbortMode::None,
            inverse: false,
        }
    }

    pub fn abort_mode(mut self, mode: FlowAbortMode) -> Self {
        self.abort_mode = mode;
        self
    }

    pub fn inverse(mut self, inverse: bool) -> Self {
        self.inverse = inverse;
        self
    }
}

pub struct ServiceDef {
    pub name: String,
    pub behavior: Option<Arc<dyn Service>>,
    pub interval: f32,
    pub random_deviation: f32,
}

impl ServiceDef {
    pub fn new(name: impl Into<String>, behavior: impl Service) -> Self {
        Self {
            name: name.into(),
            behavior: Some(Arc::new(behavior)),
            interval: 0.5,
            random_deviation: 0.0,
        }
    }

    pub fn missing(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            behavior: None,
            interval: 0.5,
            random_deviation: 0.0,
        }
    }

    pub fn interval(mut self, seconds: f32) -> Self {
        self.interval = seconds;
        self
    }

    pub fn random_deviation(mut self, seconds: f32) -> Self {
        self.random_deviation = seconds;
        self
    }
}
