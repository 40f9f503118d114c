mod common;

use std::sync::Arc;

use ai_bt::{
    AssetError, BehaviorTreeAsset, ChildDef, CompositeDef, Decorator, DecoratorDef, DecoratorLogic,
    NodeBehavior, NodeId, NodeKind, ParallelFinishMode, RunBehavior, Service, ServiceDef,
    SimpleParallel, TemplateCache, TreeTemplate, Wait,
};
use common::{Behavior, Recorder};
use proptest::prelude::*;

struct Pass {
    memory: usize,
}

impl NodeBehavior for Pass {
    fn instance_memory_size(&self) -> usize {
        self.memory
    }
}

impl Decorator for Pass {}

struct Idle;

impl NodeBehavior for Idle {}

impl Service for Idle {}

#[derive(Debug, Clone)]
enum Shape {
    Task { waits: bool },
    Composite {
        services: usize,
        children: Vec<(usize, Shape)>,
    },
}

fn shape() -> impl Strategy<Value = Shape> {
    let leaf = any::<bool>().prop_map(|waits| Shape::Task { waits });
    leaf.prop_recursive(4, 48, 4, |inner| {
        (0usize..3, prop::collection::vec((0usize..3, inner), 1..4))
            .prop_map(|(services, children)| Shape::Composite { services, children })
    })
}

fn composite(services: usize, children: &[(usize, Shape)], counter: &mut usize) -> CompositeDef {
    *counter += 1;
    let mut def = CompositeDef::sequence(format!("C{counter}"));
    for i in 0..services {
        def = def.service(ServiceDef::new(format!("S{counter}.{i}"), Idle));
    }
    for (decorators, child) in children {
        let mut edge = match child {
            Shape::Task { waits } => {
                *counter += 1;
                let name = format!("T{counter}");
                if *waits {
                    ChildDef::task(ai_bt::TaskDef::new(name, Wait::new(1.0)))
                } else {
                    ChildDef::task(Recorder::new().task(&name, Behavior::Succeed))
                }
            }
            Shape::Composite { services, children } => {
                ChildDef::composite(composite(*services, children, counter))
            }
        };
        for d in 0..*decorators {
            edge = edge.decorator(DecoratorDef::new(format!("D{counter}.{d}"), Pass { memory: d + 1 }));
        }
        def = def.child(edge);
    }
    def
}

fn build(shape: &Shape) -> TreeTemplate {
    let mut counter = 0;
    let root = match shape {
        Shape::Task { .. } => composite(0, &[(0, shape.clone())], &mut counter),
        Shape::Composite { services, children } => composite(*services, children, &mut counter),
    };
    let asset = BehaviorTreeAsset::new("Generated").root(root).build();
    TreeTemplate::compile(&asset).unwrap()
}

proptest! {
    #[test]
    fn execution_indices_are_preorder_with_nested_ranges(shape in shape()) {
        let template = build(&shape);
        for (i, node) in template.nodes().iter().enumerate() {
            prop_assert_eq!(node.execution_index().index(), i);
            prop_assert!(node.last_execution_index() >= node.execution_index());
            if let Some(parent) = node.parent() {
                let owner = template.node(parent);
                prop_assert!(parent < node.execution_index());
                prop_assert!(node.last_execution_index() <= owner.last_execution_index());
            }
        }

        for node in template.nodes().iter().filter(|n| n.is_composite()) {
            let id = node.execution_index();
            let edges = template.children(id);
            for (k, edge) in edges.iter().enumerate() {
                let start = template.child_execution_index(id, k);
                let end = template.node(edge.node).last_execution_index().0;
                prop_assert!(start > id.0);
                prop_assert!(start <= edge.node.0);
                prop_assert!(end < template.child_execution_index(id, k + 1));
                for decorator in &edge.decorators {
                    prop_assert!(*decorator < edge.node);
                    prop_assert_eq!(template.child_containing(id, decorator.0), Some(k));
                }
                prop_assert_eq!(template.child_containing(id, edge.node.0), Some(k));
            }
        }
    }

    #[test]
    fn memory_slots_tile_the_instance_buffer(shape in shape()) {
        let template = build(&shape);
        let mut slots: Vec<_> = template
            .nodes()
            .iter()
            .map(|n| n.memory())
            .filter(|slot| slot.size > 0)
            .collect();
        slots.sort_by_key(|slot| slot.offset);

        let total: usize = slots.iter().map(|slot| slot.size).sum();
        prop_assert_eq!(total, template.instance_memory_size());
        for pair in slots.windows(2) {
            prop_assert_eq!(pair[0].offset + pair[0].size, pair[1].offset);
        }
        for slot in &slots {
            prop_assert!(slot.header + slot.user <= slot.size);
            if slot.size >= 4 {
                prop_assert_eq!(slot.offset % 4, 0);
            }
        }
    }
}

#[test]
fn asset_without_root_is_rejected() {
    let asset = BehaviorTreeAsset::new("Empty").build();
    let err = TreeTemplate::compile(&asset).unwrap_err();
    assert_eq!(err, AssetError::MissingRoot("Empty".to_string()));
}

#[test]
fn missing_slots_are_dropped() {
    let recorder = Recorder::new();
    let asset = BehaviorTreeAsset::new("Holes")
        .root(
            CompositeDef::sequence("Root")
                .service(ServiceDef::missing("Gone"))
                .child(ChildDef::missing())
                .child(
                    ChildDef::task(recorder.task("A", Behavior::Succeed))
                        .decorator(DecoratorDef::missing("Lost"))
                        .decorator(DecoratorDef::new("Kept", Pass { memory: 0 }))
                        .logic(vec![DecoratorLogic::And(2), DecoratorLogic::Test(0), DecoratorLogic::Test(1)]),
                ),
        )
        .build();

    let template = TreeTemplate::compile(&asset).unwrap();
    let names: Vec<_> = template.nodes().iter().map(|n| n.name()).collect();
    assert_eq!(names, vec!["Root", "Kept", "A"]);

    let edges = template.children(template.root());
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].decorators, vec![NodeId(1)]);
    assert!(edges[0].logic.is_empty());
    assert_eq!(template.node(NodeId(2)).child_index(), Some(0));
}

#[test]
fn lookups_with_unknown_ids_are_empty() {
    let recorder = Recorder::new();
    let asset = BehaviorTreeAsset::new("Small")
        .root(CompositeDef::selector("Root").task(recorder.task("A", Behavior::Succeed)))
        .build();
    let template = TreeTemplate::compile(&asset).unwrap();
    let unknown = NodeId(999);

    assert!(template.get(unknown).is_none());
    assert!(template.children(unknown).is_empty());
    assert!(template.services(unknown).is_empty());
    assert_eq!(template.parent(unknown), None);
    assert_eq!(template.child_containing(unknown, 1), None);
    assert_eq!(template.child_execution_index(unknown, 0), u16::MAX);
}

#[test]
fn parallel_requires_a_task_as_main_child() {
    let recorder = Recorder::new();
    let asset = BehaviorTreeAsset::new("BadParallel")
        .root(
            CompositeDef::new("Both", SimpleParallel::new(ParallelFinishMode::AbortBackground))
                .composite(CompositeDef::sequence("Main").task(recorder.task("A", Behavior::Succeed)))
                .task(recorder.task("B", Behavior::Succeed)),
        )
        .build();

    assert!(matches!(
        TreeTemplate::compile(&asset),
        Err(AssetError::InvalidComposite { ref node, .. }) if node == "Both"
    ));
}

#[test]
fn subtree_root_decorators_are_injected_after_own_decorators() {
    let recorder = Recorder::new();
    let inner = BehaviorTreeAsset::new("Inner")
        .root_decorator(DecoratorDef::new("InnerGate", Pass { memory: 0 }))
        .root_decorator(DecoratorDef::new("InnerGate2", Pass { memory: 0 }))
        .root_decorator_logic(vec![DecoratorLogic::Or(2), DecoratorLogic::Test(0), DecoratorLogic::Test(1)])
        .root(CompositeDef::sequence("InnerRoot").task(recorder.task("X", Behavior::Succeed)))
        .build();
    let outer = BehaviorTreeAsset::new("Outer")
        .root(
            CompositeDef::sequence("Root").child(
                ChildDef::task(ai_bt::TaskDef::new("Run", RunBehavior::new(inner)))
                    .decorator(DecoratorDef::new("Own", Pass { memory: 0 })),
            ),
        )
        .build();

    let template = TreeTemplate::compile(&outer).unwrap();
    let edge = &template.children(template.root())[0];
    let names: Vec<_> = edge.decorators.iter().map(|d| template.node(*d).name()).collect();
    assert_eq!(names, vec!["Own", "InnerGate", "InnerGate2"]);
    assert!(matches!(
        template.node(edge.decorators[1]).kind(),
        NodeKind::Decorator { injected: true, .. }
    ));
    assert_eq!(
        edge.logic,
        vec![
            DecoratorLogic::And(2),
            DecoratorLogic::And(1),
            DecoratorLogic::Test(0),
            DecoratorLogic::Or(2),
            DecoratorLogic::Test(1),
            DecoratorLogic::Test(2),
        ]
    );
    assert!(DecoratorLogic::evaluate(&edge.logic, &[true, false, true]));
    assert!(!DecoratorLogic::evaluate(&edge.logic, &[false, true, true]));
}

#[test]
fn cache_shares_templates_until_invalidated() {
    let recorder = Recorder::new();
    let asset = BehaviorTreeAsset::new("Cached")
        .root(CompositeDef::sequence("Root").task(recorder.task("A", Behavior::Succeed)))
        .build();
    let cache = TemplateCache::new();

    let first = cache.load(&asset).unwrap();
    let second = cache.load(&asset).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert!(cache.contains(asset.id()));

    assert!(cache.invalidate(asset.id()));
    assert!(!cache.contains(asset.id()));
    let third = cache.load(&asset).unwrap();
    assert!(!Arc::ptr_eq(&first, &third));
    assert_eq!(first.nodes().len(), third.nodes().len());
}
