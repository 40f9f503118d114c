mod common;

use ai_bt::{BehaviorTreeAsset, CompositeDef, ExecutionMode, NodeId, NodeResult};
use ai_tools::SharedTraceLog;
use common::{component, run_ticks, Behavior, Recorder};
use proptest::prelude::*;

const TASKS: usize = 5;

fn selector(recorder: &Recorder) -> std::sync::Arc<BehaviorTreeAsset> {
    let mut root = CompositeDef::selector("Root");
    for i in 0..TASKS {
        root = root.task(recorder.task(&format!("T{i}"), Behavior::Latent));
    }
    BehaviorTreeAsset::new("Requests").root(root).build()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn pending_requests_collapse_to_the_highest_priority_one(
        children in prop::collection::vec(0..TASKS, 1..8),
    ) {
        let recorder = Recorder::new();
        let trace = SharedTraceLog::new();
        let mut bt = component();
        bt.set_trace_sink(trace.clone());
        prop_assert!(bt.start_tree(selector(&recorder), ExecutionMode::Looped));
        recorder.clear();
        trace.clear();

        let root = bt.instance_stack()[0].root();
        for &child in &children {
            bt.request_execution(root, 0, root, Some(child), NodeResult::Aborted);
        }
        let log = trace.snapshot();
        let accepted = log.with_tag("bt.request.accepted").count();
        let discarded = log.with_tag("bt.request.discarded").count();
        prop_assert_eq!(accepted + discarded, children.len());

        run_ticks(&mut bt, 1, 1);
        let winner = children.iter().min().copied().unwrap_or_default();
        prop_assert_eq!(
            recorder.events(),
            vec!["abort:T0".to_string(), format!("execute:T{winner}")]
        );

        // Repeating the same request changes nothing.
        recorder.clear();
        for _ in 0..3 {
            bt.request_execution(root, 0, root, Some(winner), NodeResult::Aborted);
        }
        run_ticks(&mut bt, 2, 1);
        prop_assert_eq!(
            recorder.events(),
            vec![format!("abort:T{winner}"), format!("execute:T{winner}")]
        );
    }
}

#[test]
fn requests_are_ignored_when_the_tree_is_stopped() {
    let recorder = Recorder::new();
    let mut bt = component();
    assert!(bt.start_tree(selector(&recorder), ExecutionMode::Looped));
    let root = bt.instance_stack()[0].root();
    bt.stop_tree("done");

    bt.request_execution(root, 0, root, Some(2), NodeResult::Aborted);
    run_ticks(&mut bt, 1, 2);
    assert_eq!(recorder.events(), vec!["execute:T0", "abort:T0"]);
}

#[test]
fn requests_naming_nodes_outside_the_template_are_discarded() {
    let recorder = Recorder::new();
    let trace = SharedTraceLog::new();
    let mut bt = component();
    bt.set_trace_sink(trace.clone());
    assert!(bt.start_tree(selector(&recorder), ExecutionMode::Looped));
    trace.clear();

    let root = bt.instance_stack()[0].root();
    let task = bt.instance_stack()[0].template().find_node("T1").unwrap();
    bt.request_execution(NodeId(999), 0, NodeId(999), Some(0), NodeResult::Aborted);
    bt.request_execution(root, 0, root, Some(TASKS), NodeResult::Aborted);
    bt.request_execution(task, 0, task, None, NodeResult::Succeeded);

    let log = trace.snapshot();
    assert_eq!(log.with_tag("bt.request.discarded").count(), 3);
    assert_eq!(log.with_tag("bt.request.accepted").count(), 0);

    run_ticks(&mut bt, 1, 2);
    assert_eq!(recorder.events(), vec!["execute:T0"]);
}
