use ai_tools::{SharedTraceLog, TraceEvent, TraceLog, TraceSink, VecTraceSink};

#[test]
fn vec_sink_records_events_in_order() {
    let mut sink = VecTraceSink::default();
    sink.emit(TraceEvent::new(1, "test").with_a(10).with_b(20));
    sink.emit(TraceEvent::new(2, "other"));

    assert_eq!(sink.events.len(), 2);
    assert_eq!(sink.events[0].tick, 1);
    assert_eq!(sink.events[0].tag, "test");
    assert_eq!(sink.events[0].a, 10);
    assert_eq!(sink.events[0].b, 20);
    assert_eq!(sink.events[1].tag, "other");
}

#[test]
fn shared_log_is_visible_through_every_clone() {
    let log = SharedTraceLog::new();
    let mut installed: Box<dyn TraceSink> = Box::new(log.clone());

    installed.emit(TraceEvent::new(3, "bt.task.execute").with_b(4));
    installed.emit(TraceEvent::new(3, "bt.task.finished").with_b(4));

    let snapshot = log.snapshot();
    assert_eq!(snapshot.events.len(), 2);
    assert_eq!(snapshot.with_tag("bt.task.execute").count(), 1);

    log.clear();
    assert_eq!(log.snapshot(), TraceLog::default());
}
