mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ai_bt::{
    BehaviorTreeAsset, BlackboardCondition, ChildDef, CompositeDef, Decorator, DecoratorDef, ExecutionMode,
    ExecutionState, FlowAbortMode, KeyQuery, NodeIndex, NodeResult, RunBehavior, TaskDef,
    TaskStatus,
};
use ai_core::{BlackboardSchema, KeyId, KeyType};
use ai_tools::SharedTraceLog;
use common::{component, run_ticks, schema, Behavior, Counter, Recorder};

#[test]
fn simple_sequence_runs_children_in_order_then_stops() {
    let recorder = Recorder::new();
    let asset = BehaviorTreeAsset::new("Simple")
        .root(
            CompositeDef::sequence("Root")
                .task(recorder.task("A", Behavior::Succeed))
                .task(recorder.task("B", Behavior::Succeed)),
        )
        .build();

    let mut bt = component();
    assert!(bt.start_tree(asset, ExecutionMode::SingleRun));
    assert_eq!(recorder.events(), vec!["execute:A"]);

    run_ticks(&mut bt, 1, 3);
    assert_eq!(recorder.events(), vec!["execute:A", "execute:B"]);
    assert!(!bt.is_running());
    assert_eq!(bt.execution_state(), ExecutionState::Stopped);
}

#[test]
fn lower_priority_abort_waits_for_latent_abort() {
    let recorder = Recorder::new();
    let asset = BehaviorTreeAsset::new("Guarded")
        .blackboard(schema())
        .root(
            CompositeDef::selector("Root")
                .child(
                    ChildDef::task(recorder.task("High", Behavior::Latent)).decorator(
                        DecoratorDef::new("IsAlert", BlackboardCondition::new("Alert", KeyQuery::IsSet))
                            .abort_mode(FlowAbortMode::LowerPriority),
                    ),
                )
                .task(recorder.task("Low", Behavior::LatentAbort)),
        )
        .build();

    let mut bt = component();
    assert!(bt.start_tree(asset, ExecutionMode::Looped));
    assert_eq!(recorder.events(), vec!["execute:Low"]);
    assert_eq!(bt.execution_state(), ExecutionState::TaskActive);

    // The failed guard still observes its key on behalf of the lower priority branch.
    let template = bt.instance_stack()[0].template().clone();
    let guard = template.find_node("IsAlert").unwrap();
    assert!(bt.is_aux_node_active(NodeIndex::new(0, guard)));

    bt.blackboard_mut().set("Alert", true);
    run_ticks(&mut bt, 1, 1);
    assert_eq!(recorder.events(), vec!["execute:Low", "abort:Low"]);
    assert_eq!(bt.execution_state(), ExecutionState::TaskAborting);

    // Nothing moves until the abort completes.
    run_ticks(&mut bt, 2, 3);
    assert_eq!(recorder.events(), vec!["execute:Low", "abort:Low"]);

    assert!(recorder.finish("abort:Low", NodeResult::Aborted));
    run_ticks(&mut bt, 5, 1);
    assert_eq!(recorder.events(), vec!["execute:Low", "abort:Low", "execute:High"]);

    let high = template.find_node("High").unwrap();
    assert_eq!(bt.task_status(NodeIndex::new(0, high)), TaskStatus::Active);
}

#[test]
fn self_abort_leaves_branch_when_condition_fails() {
    let recorder = Recorder::new();
    let schema = schema();
    let asset = BehaviorTreeAsset::new("SelfAbort")
        .blackboard(schema.clone())
        .root(
            CompositeDef::selector("Root")
                .child(
                    ChildDef::task(recorder.task("Attack", Behavior::Latent)).decorator(
                        DecoratorDef::new("HasAmmo", BlackboardCondition::new("Ammo", KeyQuery::IntAtLeast(1)))
                            .abort_mode(FlowAbortMode::SelfBranch),
                    ),
                )
                .task(recorder.task("Reload", Behavior::Latent)),
        )
        .build();

    let mut bt = component();
    bt.blackboard_mut().bind(schema);
    bt.blackboard_mut().set("Ammo", 3i32);
    assert!(bt.start_tree(asset, ExecutionMode::Looped));
    assert_eq!(recorder.events(), vec!["execute:Attack"]);

    // Changing the key without flipping the condition keeps the branch running.
    bt.blackboard_mut().set("Ammo", 2i32);
    run_ticks(&mut bt, 1, 2);
    assert_eq!(recorder.events(), vec!["execute:Attack"]);

    bt.blackboard_mut().set("Ammo", 0i32);
    run_ticks(&mut bt, 3, 1);
    assert_eq!(
        recorder.events(),
        vec!["execute:Attack", "abort:Attack", "execute:Reload"]
    );
}

#[test]
fn looping_tree_restarts_once_per_tick() {
    let executions = Arc::new(AtomicUsize::new(0));
    let asset = BehaviorTreeAsset::new("Loop")
        .root(CompositeDef::sequence("Root").task(TaskDef::new("Count", Counter(executions.clone()))))
        .build();

    let mut bt = component();
    assert!(bt.start_tree(asset, ExecutionMode::Looped));
    assert_eq!(executions.load(Ordering::SeqCst), 1);

    run_ticks(&mut bt, 1, 10);
    assert_eq!(executions.load(Ordering::SeqCst), 11);
    assert!(bt.is_running());
}

#[test]
fn subtree_push_pop_with_injected_decorator() {
    let recorder = Recorder::new();
    let trace = SharedTraceLog::new();
    let schema = schema();
    let subtree = BehaviorTreeAsset::new("Sub")
        .blackboard(schema.clone())
        .root_decorator(DecoratorDef::new(
            "SubAlert",
            BlackboardCondition::new("Alert", KeyQuery::IsSet),
        ))
        .root(CompositeDef::sequence("SubRoot").task(recorder.task("Inner", Behavior::Latent)))
        .build();
    let asset = BehaviorTreeAsset::new("Main")
        .blackboard(schema.clone())
        .root(
            CompositeDef::selector("Root")
                .task(TaskDef::new("RunSub", RunBehavior::new(subtree.clone())))
                .task(recorder.task("Fallback", Behavior::Latent)),
        )
        .build();

    let mut bt = component();
    bt.set_trace_sink(trace.clone());
    bt.blackboard_mut().bind(schema);
    bt.blackboard_mut().set("Alert", true);
    assert!(bt.start_tree(asset, ExecutionMode::SingleRun));

    // The subtree's root decorator lives in the calling template, on the RunSub edge.
    let template = bt.instance_stack()[0].template().clone();
    let injected = template.find_node("SubAlert").unwrap();
    let run_sub = template.find_node("RunSub").unwrap();
    assert!(injected.0 < run_sub.0);
    assert_eq!(template.node(injected).parent(), Some(template.root()));

    run_ticks(&mut bt, 1, 1);
    assert_eq!(bt.instance_stack().len(), 2);
    assert_eq!(bt.active_instance_index(), 1);
    assert_eq!(bt.find_instance_containing(subtree.id()), Some(1));
    assert_eq!(recorder.events(), vec!["execute:Inner"]);
    assert_eq!(bt.describe_active_trees(), "Main, Sub");

    assert!(recorder.finish("Inner", NodeResult::Succeeded));
    run_ticks(&mut bt, 2, 2);
    assert_eq!(recorder.events(), vec!["execute:Inner"]);
    assert!(!bt.is_running());

    let log = trace.snapshot();
    assert_eq!(log.with_tag("bt.instance.push").count(), 2);
    assert!(log.with_tag("bt.instance.pop").count() >= 1);
}

#[test]
fn injected_decorator_aborts_running_subtree_when_its_key_changes() {
    let recorder = Recorder::new();
    let schema = schema();
    let subtree = BehaviorTreeAsset::new("Sub")
        .blackboard(schema.clone())
        .root_decorator(
            DecoratorDef::new("SubAlert", BlackboardCondition::new("Alert", KeyQuery::IsSet))
                .abort_mode(FlowAbortMode::SelfBranch),
        )
        .root(CompositeDef::sequence("SubRoot").task(recorder.task("Inner", Behavior::Latent)))
        .build();
    let asset = BehaviorTreeAsset::new("Main")
        .blackboard(schema.clone())
        .root(
            CompositeDef::selector("Root")
                .task(TaskDef::new("RunSub", RunBehavior::new(subtree)))
                .task(recorder.task("Fallback", Behavior::Latent)),
        )
        .build();

    let mut bt = component();
    bt.blackboard_mut().bind(schema);
    bt.blackboard_mut().set("Alert", true);
    assert!(bt.start_tree(asset, ExecutionMode::SingleRun));
    run_ticks(&mut bt, 1, 1);
    assert_eq!(bt.instance_stack().len(), 2);
    assert_eq!(recorder.events(), vec!["execute:Inner"]);

    // The injected decorator sits in the caller and still guards the running subtree.
    bt.blackboard_mut().set("Alert", false);
    run_ticks(&mut bt, 2, 3);
    assert_eq!(
        recorder.events(),
        vec!["execute:Inner", "abort:Inner", "execute:Fallback"]
    );
    assert_eq!(bt.instance_stack().len(), 1);
}

#[test]
fn sequence_moves_to_next_sibling_after_subtree_pops() {
    let recorder = Recorder::new();
    let subtree = BehaviorTreeAsset::new("Sub")
        .root(CompositeDef::sequence("SubRoot").task(recorder.task("X", Behavior::Succeed)))
        .build();
    let asset = BehaviorTreeAsset::new("Main")
        .root(
            CompositeDef::sequence("Root")
                .task(TaskDef::new("RunSub", RunBehavior::new(subtree)))
                .task(recorder.task("Next", Behavior::Latent)),
        )
        .build();

    let mut bt = component();
    assert!(bt.start_tree(asset, ExecutionMode::SingleRun));
    run_ticks(&mut bt, 1, 4);
    assert_eq!(recorder.events(), vec!["execute:X", "execute:Next"]);
    assert_eq!(bt.instance_stack().len(), 1);
    assert!(bt.is_running());
}

#[test]
fn injected_decorator_refusal_skips_subtree() {
    let recorder = Recorder::new();
    let subtree = BehaviorTreeAsset::new("Sub")
        .root_decorator(DecoratorDef::new(
            "SubAlert",
            BlackboardCondition::new("Alert", KeyQuery::IsSet),
        ))
        .root(CompositeDef::sequence("SubRoot").task(recorder.task("Inner", Behavior::Latent)))
        .build();
    let asset = BehaviorTreeAsset::new("Main")
        .blackboard(schema())
        .root(
            CompositeDef::selector("Root")
                .task(TaskDef::new("RunSub", RunBehavior::new(subtree)))
                .task(recorder.task("Fallback", Behavior::Latent)),
        )
        .build();

    let mut bt = component();
    assert!(bt.start_tree(asset, ExecutionMode::Looped));
    assert_eq!(recorder.events(), vec!["execute:Fallback"]);
    assert_eq!(bt.instance_stack().len(), 1);
}

#[test]
fn blackboard_observer_sees_one_notification_per_change() {
    let schema = BlackboardSchema::builder("Sensors")
        .key("Visible", KeyType::Bool)
        .build();
    let mut bt = component();
    assert!(bt.blackboard_mut().bind(schema));

    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    bt.blackboard_mut().register_observer(
        "Visible",
        ai_core::ObserverOwner(9),
        Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            ai_core::ObserverResult::Keep
        }),
    );

    assert!(bt.blackboard_mut().set("Visible", true));
    assert!(bt.blackboard_mut().set("Visible", true));
    assert!(bt.blackboard().get::<bool>("Visible"));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

fn conflict_tree(recorder: &Recorder) -> Arc<BehaviorTreeAsset> {
    let schema = BlackboardSchema::builder("Conflict")
        .key("WantA", KeyType::Bool)
        .key("WantB", KeyType::Bool)
        .build();
    BehaviorTreeAsset::new("Conflict")
        .blackboard(schema)
        .root(
            CompositeDef::selector("Root")
                .child(
                    ChildDef::task(recorder.task("A", Behavior::Latent)).decorator(
                        DecoratorDef::new("GuardA", BlackboardCondition::new("WantA", KeyQuery::IsSet))
                            .abort_mode(FlowAbortMode::LowerPriority),
                    ),
                )
                .composite(
                    CompositeDef::selector("Inner")
                        .child(
                            ChildDef::task(recorder.task("B", Behavior::Latent)).decorator(
                                DecoratorDef::new(
                                    "GuardB",
                                    BlackboardCondition::new("WantB", KeyQuery::IsSet),
                                )
                                .abort_mode(FlowAbortMode::LowerPriority),
                            ),
                        )
                        .task(recorder.task("C", Behavior::Latent)),
                ),
        )
        .build()
}

#[test]
fn lower_priority_request_is_discarded_behind_pending_higher_one() {
    let recorder = Recorder::new();
    let trace = SharedTraceLog::new();
    let mut bt = component();
    bt.set_trace_sink(trace.clone());
    assert!(bt.start_tree(conflict_tree(&recorder), ExecutionMode::Looped));
    assert_eq!(recorder.events(), vec!["execute:C"]);
    trace.clear();

    bt.blackboard_mut().set("WantA", true);
    bt.blackboard_mut().set("WantB", true);
    run_ticks(&mut bt, 1, 1);

    assert_eq!(recorder.events(), vec!["execute:C", "abort:C", "execute:A"]);
    let log = trace.snapshot();
    assert_eq!(log.with_tag("bt.request.discarded").count(), 1);

    let template = bt.instance_stack()[0].template().clone();
    let guard_b = template.find_node("GuardB").unwrap();
    assert!(!bt.is_aux_node_active(NodeIndex::new(0, guard_b)));
}

#[test]
fn higher_priority_request_replaces_pending_lower_one() {
    let recorder = Recorder::new();
    let trace = SharedTraceLog::new();
    let mut bt = component();
    bt.set_trace_sink(trace.clone());
    assert!(bt.start_tree(conflict_tree(&recorder), ExecutionMode::Looped));
    trace.clear();

    bt.blackboard_mut().set("WantB", true);
    bt.blackboard_mut().set("WantA", true);
    run_ticks(&mut bt, 1, 1);

    assert_eq!(recorder.events(), vec!["execute:C", "abort:C", "execute:A"]);
    let log = trace.snapshot();
    assert_eq!(log.with_tag("bt.request.discarded").count(), 0);
    assert_eq!(log.with_tag("bt.request.accepted").count(), 2);
}

#[test]
fn shared_condition_resolves_its_key_in_each_tree_schema() {
    let recorder = Recorder::new();
    let gate: Arc<dyn Decorator> = Arc::new(BlackboardCondition::new("Go", KeyQuery::IsSet));
    let tree = |name: &str, schema: Arc<BlackboardSchema>| {
        BehaviorTreeAsset::new(name)
            .blackboard(schema)
            .root(
                CompositeDef::selector("Root")
                    .child(
                        ChildDef::task(recorder.task(&format!("{name}Guarded"), Behavior::Succeed))
                            .decorator(DecoratorDef::shared("GoGate", gate.clone())),
                    )
                    .task(recorder.task(&format!("{name}Fallback"), Behavior::Succeed)),
            )
            .build()
    };
    let padded = BlackboardSchema::builder("Padded")
        .key("Pad", KeyType::Int)
        .key("Go", KeyType::Bool)
        .build();
    let plain = BlackboardSchema::builder("Plain")
        .key("Go", KeyType::Bool)
        .key("Other", KeyType::Bool)
        .build();
    let a = tree("A", padded);
    let b = tree("B", plain.clone());

    let mut first = component();
    assert!(first.start_tree(a, ExecutionMode::SingleRun));

    let mut second = component();
    assert!(second.blackboard_mut().bind(plain));
    second.blackboard_mut().set("Go", true);
    assert!(second.start_tree(b, ExecutionMode::SingleRun));

    assert_eq!(recorder.events(), vec!["execute:AFallback", "execute:BGuarded"]);

    let resolved = |bt: &ai_bt::BehaviorTreeComponent| {
        let template = bt.instance_stack()[0].template().clone();
        let node = template.find_node("GoGate").unwrap();
        let key = template.node(node).resolved_key(0);
        key
    };
    assert_eq!(resolved(&first), Some(KeyId(1)));
    assert_eq!(resolved(&second), Some(KeyId(0)));
}
