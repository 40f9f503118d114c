#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::sync::{Arc, Mutex};

/// A small, allocation-friendly trace event.
///
/// Plain data so it can be recorded during simulation and rendered later. Behavior tree
/// runtimes use `a` for the instance level and `b` for the node's execution index.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TraceEvent {
    pub tick: u64,
    pub tag: Cow<'static, str>,
    pub a: u64,
    pub b: u64,
}

impl TraceEvent {
    pub fn new(tick: u64, tag: impl Into<Cow<'static, str>>) -> Self {
        Self {
            tick,
            tag: tag.into(),
            a: 0,
            b: 0,
        }
    }

    pub fn with_a(mut self, a: u64) -> Self {
        self.a = a;
        self
    }

    pub fn with_b(mut self, b: u64) -> Self {
        self.b = b;
        self
    }
}

/// Passive observer: receives events, never influences the emitter.
pub trait TraceSink: Send {
    fn emit(&mut self, event: TraceEvent);
}

#[derive(Debug, Default)]
pub struct NullTraceSink;

impl TraceSink for NullTraceSink {
    fn emit(&mut self, _event: TraceEvent) {}
}

#[derive(Debug, Default)]
pub struct VecTraceSink {
    pub events: Vec<TraceEvent>,
}

impl TraceSink for VecTraceSink {
    fn emit(&mut self, event: TraceEvent) {
        self.events.push(event);
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TraceLog {
    pub events: Vec<TraceEvent>,
}

impl TraceLog {
    pub fn push(&mut self, event: TraceEvent) {
        self.events.push(event);
    }

    /// Events carrying `tag`, in emission order.
    pub fn with_tag<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a TraceEvent> + 'a {
        self.events.iter().filter(move |e| e.tag == tag)
    }
}

/// Cloneable sink that appends into a shared [`TraceLog`].
///
/// Install one clone into the runtime and keep another to inspect what was recorded.
#[derive(Debug, Default, Clone)]
pub struct SharedTraceLog(Arc<Mutex<TraceLog>>);

impl SharedTraceLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> TraceLog {
        match self.0.lock() {
            Ok(log) => log.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn clear(&self) {
        match self.0.lock() {
            Ok(mut log) => log.events.clear(),
            Err(poisoned) => poisoned.into_inner().events.clear(),
        }
    }
}

impl TraceSink for SharedTraceLog {
    fn emit(&mut self, event: TraceEvent) {
        match self.0.lock() {
            Ok(mut log) => log.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}
