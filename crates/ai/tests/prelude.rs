#![cfg(all(feature = "bt", feature = "tools"))]

use ai::prelude::*;

struct Succeed;

impl NodeBehavior for Succeed {}

impl Task for Succeed {
    fn execute(&self, _ctx: &mut NodeContext<'_>) -> NodeResult {
        NodeResult::Succeeded
    }
}

#[test]
fn prelude_is_enough_to_run_a_tree() {
    let asset = BehaviorTreeAsset::new("Prelude")
        .root(CompositeDef::sequence("Root").task(TaskDef::new("Done", Succeed)))
        .build();
    let trace = SharedTraceLog::new();

    let mut bt = BehaviorTreeComponent::with_config(BehaviorTreeConfig::default());
    bt.set_trace_sink(trace.clone());
    assert!(bt.start_tree(asset, ExecutionMode::SingleRun));
    bt.tick(&TickContext::new(1, 0.1));

    assert!(!bt.is_running());
    let log = trace.snapshot();
    assert_eq!(log.with_tag("bt.task.execute").count(), 1);
    assert_eq!(log.with_tag("bt.tree.finished").count(), 1);
}

#[cfg(feature = "serde")]
#[test]
fn trace_log_round_trips_through_json() {
    let trace = SharedTraceLog::new();
    let mut sink = trace.clone();
    sink.emit(ai::tools::TraceEvent::new(2, "bt.task.abort").with_a(0).with_b(3));

    let json = serde_json::to_string(&trace.snapshot()).unwrap();
    let back: ai::tools::TraceLog = serde_json::from_str(&json).unwrap();
    assert_eq!(back, trace.snapshot());
}
