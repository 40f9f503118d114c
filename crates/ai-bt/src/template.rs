//! Compiled, immutable form of a [`BehaviorTreeAsset`].
//!
//! Nodes live in one arena indexed by execution index, assigned in pre-order: a composite, its
//! services, then for each child edge the edge's decorators, decorators injected from a subtree,
//! and finally the child itself.

use std::sync::Arc;

use ai_core::{layout, BlackboardSchema, KeyId};

use crate::asset::{AssetId, BehaviorTreeAsset, ChildNode, CompositeDef, DecoratorDef};
use crate::bt::{FlowAbortMode, NodeId};
use crate::error::AssetError;
use crate::logic::DecoratorLogic;
use crate::memory::{MemorySlot, COMPOSITE_HEADER, INSTANCED_RECORD, SERVICE_HEADER};
use crate::node::{ChildShape, Instancing, NodeObject};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildEdge {
    pub node: NodeId,
    pub decorators: Vec<NodeId>,
    pub logic: Vec<DecoratorLogic>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Composite {
        children: Vec<ChildEdge>,
        services: Vec<NodeId>,
    },
    Task,
    Decorator {
        abort_mode: FlowAbortMode,
        inverse: bool,
        injected: bool,
    },
    Service {
        interval: f32,
        random_deviation: f32,
    },
}

pub struct TemplateNode {
    name: String,
    execution_index: NodeId,
    last_execution_index: NodeId,
    tree_depth: u16,
    parent: Option<NodeId>,
    child_index: Option<usize>,
    memory: MemorySlot,
    instancing: Instancing,
    object: NodeObject,
    keys: Vec<Option<KeyId>>,
    kind: NodeKind,
}

impl std::fmt::Debug for TemplateNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateNode")
            .field("name", &self.name)
            .field("execution_index", &self.execution_index)
            .field("last_execution_index", &self.last_execution_index)
            .field("parent", &self.parent)
            .field("kind", &self.kind)
            .finish()
    }
}

impl TemplateNode {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn execution_index(&self) -> NodeId {
        self.execution_index
    }

    /// Last execution index inside this node's subtree (the node itself for leaves).
    pub fn last_execution_index(&self) -> NodeId {
        self.last_execution_index
    }

    pub fn tree_depth(&self) -> u16 {
        self.tree_depth
    }

    /// Owning composite. `None` only for the root.
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Edge index in the parent composite. `None` for services and the root.
    pub fn child_index(&self) -> Option<usize> {
        self.child_index
    }

    pub fn memory(&self) -> MemorySlot {
        self.memory
    }

    pub fn instancing(&self) -> Instancing {
        self.instancing
    }

    pub fn object(&self) -> &NodeObject {
        &self.object
    }

    /// Key id resolved for the node's `slot`-th blackboard key in this template's schema.
    pub fn resolved_key(&self, slot: usize) -> Option<KeyId> {
        self.keys.get(slot).copied().flatten()
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn is_composite(&self) -> bool {
        matches!(self.kind, NodeKind::Composite { .. })
    }

    pub fn is_task(&self) -> bool {
        matches!(self.kind, NodeKind::Task)
    }

    pub fn is_decorator(&self) -> bool {
        matches!(self.kind, NodeKind::Decorator { .. })
    }

    pub fn is_service(&self) -> bool {
        matches!(self.kind, NodeKind::Service { .. })
    }

    pub fn abort_mode(&self) -> FlowAbortMode {
        match self.kind {
            NodeKind::Decorator { abort_mode, .. } => abort_mode,
            _ => FlowAbortMode::None,
        }
    }
}

pub struct TreeTemplate {
    asset_id: AssetId,
    name: String,
    nodes: Vec<TemplateNode>,
    memory_size: usize,
    blackboard: Option<Arc<BlackboardSchema>>,
}

impl std::fmt::Debug for TreeTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeTemplate")
            .field("name", &self.name)
            .field("nodes", &self.nodes.len())
            .field("memory_size", &self.memory_size)
            .finish()
    }
}

impl TreeTemplate {
    /// Builds a template from `asset`. Prefer [`crate::TemplateCache::load`], which shares the
    /// result between components.
    pub fn compile(asset: &BehaviorTreeAsset) -> Result<Self, AssetError> {
        let root = asset
            .root_node()
            .ok_or_else(|| AssetError::MissingRoot(asset.name().to_string()))?;

        let mut builder = Builder {
            asset: asset.name(),
            nodes: Vec::new(),
        };
        builder.composite(root, None, None, 0)?;
        let mut nodes = builder.nodes;

        let declared: Vec<usize> = nodes.iter().map(declared_size).collect();
        let packed = layout::pack(&declared);
        for (i, node) in nodes.iter_mut().enumerate() {
            let header = declared[i] - node.object.instance_memory_size();
            node.memory = MemorySlot {
                offset: packed.offsets[i],
                size: packed.sizes[i],
                header,
                user: node.object.instance_memory_size(),
            };
        }

        let schema = asset.blackboard_schema().cloned();
        if let Some(schema) = schema.as_deref() {
            for node in &mut nodes {
                node.keys = resolve_keys(&node.name, &node.object, schema);
            }
        }

        tracing::debug!(
            tree = %asset.name(),
            nodes = nodes.len(),
            memory = packed.total,
            "behavior tree template built"
        );

        Ok(Self {
            asset_id: asset.id(),
            name: asset.name().to_string(),
            nodes,
            memory_size: packed.total,
            blackboard: schema,
        })
    }

    pub fn asset_id(&self) -> AssetId {
        self.asset_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn nodes(&self) -> &[TemplateNode] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> &TemplateNode {
        &self.nodes[id.index()]
    }

    pub fn get(&self, id: NodeId) -> Option<&TemplateNode> {
        self.nodes.get(id.index())
    }

    pub fn find_node(&self, name: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .find(|n| n.name == name)
            .map(|n| n.execution_index)
    }

    pub fn instance_memory_size(&self) -> usize {
        self.memory_size
    }

    pub fn blackboard_schema(&self) -> Option<&Arc<BlackboardSchema>> {
        self.blackboard.as_ref()
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.get(id)?.parent
    }

    /// Child edges of composite `id`; empty for other nodes and unknown ids.
    pub fn children(&self, id: NodeId) -> &[ChildEdge] {
        match self.get(id).map(|n| &n.kind) {
            Some(NodeKind::Composite { children, .. }) => children,
            _ => &[],
        }
    }

    pub fn services(&self, id: NodeId) -> &[NodeId] {
        match self.get(id).map(|n| &n.kind) {
            Some(NodeKind::Composite { services, .. }) => services,
            _ => &[],
        }
    }

    /// First execution index reachable through child edge `child_index` of `composite`
    /// (its first decorator, else the child). Past the last edge this is one beyond the
    /// composite's subtree.
    pub fn child_execution_index(&self, composite: NodeId, child_index: usize) -> u16 {
        match self.children(composite).get(child_index) {
            Some(edge) => edge.decorators.first().copied().unwrap_or(edge.node).0,
            None => self
                .get(composite)
                .map_or(u16::MAX, |n| n.last_execution_index.0.saturating_add(1)),
        }
    }

    /// Edge of `composite` whose subtree contains execution index `execution`.
    pub fn child_containing(&self, composite: NodeId, execution: u16) -> Option<usize> {
        let node = self.get(composite)?;
        if execution <= node.execution_index.0 || execution > node.last_execution_index.0 {
            return None;
        }
        let children = self.children(composite);
        (0..children.len())
            .rev()
            .find(|&i| self.child_execution_index(composite, i) <= execution)
    }
}

fn declared_size(node: &TemplateNode) -> usize {
    let header = match node.kind {
        NodeKind::Composite { .. } => COMPOSITE_HEADER,
        NodeKind::Service { .. } => SERVICE_HEADER,
        _ => 0,
    };
    let record = match node.instancing {
        Instancing::Instanced => INSTANCED_RECORD,
        Instancing::Shared => 0,
    };
    header + record + node.object.instance_memory_size()
}

fn resolve_keys(node: &str, object: &NodeObject, schema: &BlackboardSchema) -> Vec<Option<KeyId>> {
    object
        .blackboard_keys()
        .iter()
        .map(|selector| {
            let id = selector.resolve(schema);
            if id.is_none() {
                tracing::warn!(
                    node,
                    key = %selector.name(),
                    schema = %schema.name(),
                    "blackboard key not found in schema"
                );
            }
            id
        })
        .collect()
}

struct Builder<'a> {
    asset: &'a str,
    nodes: Vec<TemplateNode>,
}

impl Builder<'_> {
    fn push(
        &mut self,
        name: &str,
        parent: Option<NodeId>,
        child_index: Option<usize>,
        tree_depth: u16,
        object: NodeObject,
        kind: NodeKind,
    ) -> Result<NodeId, AssetError> {
        if self.nodes.len() >= u16::MAX as usize {
            return Err(AssetError::TooManyNodes {
                asset: self.asset.to_string(),
                count: self.nodes.len() + 1,
            });
        }
        let id = NodeId(self.nodes.len() as u16);
        let instancing = object.instancing();
        self.nodes.push(TemplateNode {
            name: name.to_string(),
            execution_index: id,
            last_execution_index: id,
            tree_depth,
            parent,
            child_index,
            memory: MemorySlot::default(),
            instancing,
            object,
            keys: Vec::new(),
            kind,
        });
        Ok(id)
    }

    fn decorators(
        &mut self,
        defs: &[DecoratorDef],
        parent: NodeId,
        child_index: usize,
        depth: u16,
        injected: bool,
    ) -> Result<(Vec<NodeId>, bool), AssetError> {
        let mut ids = Vec::with_capacity(defs.len());
        let mut dropped = false;
        for def in defs {
            let Some(behavior) = &def.behavior else {
                tracing::warn!(tree = %self.asset, decorator = %def.name, "dropping missing decorator");
                dropped = true;
                continue;
            };
            ids.push(self.push(
                &def.name,
                Some(parent),
                Some(child_index),
                depth,
                NodeObject::Decorator(behavior.clone()),
                NodeKind::Decorator {
                    abort_mode: def.abort_mode,
                    inverse: def.inverse,
                    injected,
                },
            )?);
        }
        Ok((ids, dropped))
    }

    fn checked_logic(&self, logic: &[DecoratorLogic], count: usize, dropped: bool) -> Vec<DecoratorLogic> {
        if logic.is_empty() {
            return Vec::new();
        }
        if dropped || !DecoratorLogic::validate(logic, count) {
            tracing::warn!(tree = %self.asset, "decorator logic unusable, falling back to AND of all decorators");
            return Vec::new();
        }
        logic.to_vec()
    }

    fn composite(
        &mut self,
        def: &CompositeDef,
        parent: Option<NodeId>,
        child_index: Option<usize>,
        depth: u16,
    ) -> Result<NodeId, AssetError> {
        let shapes: Vec<ChildShape> = def
            .children
            .iter()
            .filter_map(|child| match child.node {
                ChildNode::Composite(_) => Some(ChildShape::Composite),
                ChildNode::Task(_) => Some(ChildShape::Task),
                ChildNode::Missing => None,
            })
            .collect();
        def.behavior
            .validate_children(&shapes)
            .map_err(|reason| AssetError::InvalidComposite {
                asset: self.asset.to_string(),
                node: def.name.clone(),
                reason,
            })?;

        let id = self.push(
            &def.name,
            parent,
            child_index,
            depth,
            NodeObject::Composite(def.behavior.clone()),
            NodeKind::Composite {
                children: Vec::new(),
                services: Vec::new(),
            },
        )?;

        let mut services = Vec::with_capacity(def.services.len());
        for service in &def.services {
            let Some(behavior) = &service.behavior else {
                tracing::warn!(tree = %self.asset, service = %service.name, "dropping missing service");
                continue;
            };
            services.push(self.push(
                &service.name,
                Some(id),
                None,
                depth,
                NodeObject::Service(behavior.clone()),
                NodeKind::Service {
                    interval: service.interval,
                    random_deviation: service.random_deviation,
                },
            )?);
        }

        let mut children = Vec::with_capacity(def.children.len());
        for child in &def.children {
            if matches!(child.node, ChildNode::Missing) {
                tracing::warn!(tree = %self.asset, composite = %def.name, "dropping missing child");
                continue;
            }
            let edge_index = children.len();

            let (mut decorators, dropped) =
                self.decorators(&child.decorators, id, edge_index, depth + 1, false)?;
            let mut logic = self.checked_logic(&child.logic, decorators.len(), dropped);

            if let ChildNode::Task(task) = &child.node {
                if let Some(subtree) = task.behavior.injected_subtree() {
                    let (injected, dropped) =
                        self.decorators(subtree.root_decorators(), id, edge_index, depth + 1, true)?;
                    let injected_logic = self.checked_logic(subtree.root_logic(), injected.len(), dropped);
                    logic = DecoratorLogic::merge_injected(
                        &logic,
                        decorators.len(),
                        &injected_logic,
                        injected.len(),
                    );
                    decorators.extend(injected);
                }
            }

            let node = match &child.node {
                ChildNode::Task(task) => self.push(
                    &task.name,
                    Some(id),
                    Some(edge_index),
                    depth + 1,
                    NodeObject::Task(task.behavior.clone()),
                    NodeKind::Task,
                )?,
                ChildNode::Composite(composite) => {
                    self.composite(composite, Some(id), Some(edge_index), depth + 1)?
                }
                ChildNode::Missing => continue,
            };

            children.push(ChildEdge {
                node,
                decorators,
                logic,
            });
        }

        let last = NodeId((self.nodes.len() - 1) as u16);
        let node = &mut self.nodes[id.index()];
        node.last_execution_index = last;
        node.kind = NodeKind::Composite { children, services };
        Ok(id)
    }
}
