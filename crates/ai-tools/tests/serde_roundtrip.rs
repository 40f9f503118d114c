#![cfg(feature = "serde")]

use ai_tools::{TraceEvent, TraceLog};

#[test]
fn trace_log_json_roundtrip() {
    let log = TraceLog {
        events: vec![
            TraceEvent::new(1, "bt.request.accepted").with_a(0).with_b(3),
            TraceEvent::new(2, "bt.task.execute").with_a(0).with_b(5),
            TraceEvent::new(3, "bt.instance.push").with_a(1).with_b(0),
        ],
    };

    let json = serde_json::to_string(&log).expect("serialize");
    let roundtrip: TraceLog = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(roundtrip, log);
}
