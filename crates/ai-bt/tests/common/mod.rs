#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use ai_bt::{
    BehaviorTreeComponent, BehaviorTreeConfig, NodeBehavior, NodeContext, NodeResult, Task, TaskDef,
    TaskHandle, TemplateCache,
};
use ai_core::{BlackboardSchema, KeyType, TickContext};

/// How a [`Probe`] task behaves when executed and aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Succeed,
    Fail,
    /// Stays in progress until finished through the recorder.
    Latent,
    /// Latent, and its abort is latent too.
    LatentAbort,
}

/// Shared log of task calls plus the handles of latent tasks, keyed by task name.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<String>>>,
    handles: Arc<Mutex<HashMap<String, TaskHandle>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.events().iter().filter(|e| *e == event).count()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    /// Completes the latent execution (or, with an `abort:` prefix, the latent abort) of `name`.
    pub fn finish(&self, name: &str, result: NodeResult) -> bool {
        match self.handles.lock().unwrap().remove(name) {
            Some(handle) => {
                handle.finish(result);
                true
            }
            None => false,
        }
    }

    pub fn has_handle(&self, name: &str) -> bool {
        self.handles.lock().unwrap().contains_key(name)
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    fn store(&self, name: String, handle: TaskHandle) {
        self.handles.lock().unwrap().insert(name, handle);
    }

    pub fn task(&self, name: &str, behavior: Behavior) -> TaskDef {
        TaskDef::new(
            name,
            Probe {
                name: name.to_string(),
                behavior,
                recorder: self.clone(),
            },
        )
    }
}

pub struct Probe {
    name: String,
    behavior: Behavior,
    recorder: Recorder,
}

impl NodeBehavior for Probe {}

impl Task for Probe {
    fn execute(&self, ctx: &mut NodeContext<'_>) -> NodeResult {
        self.recorder.push(format!("execute:{}", self.name));
        match self.behavior {
            Behavior::Succeed => NodeResult::Succeeded,
            Behavior::Fail => NodeResult::Failed,
            Behavior::Latent | Behavior::LatentAbort => {
                self.recorder.store(self.name.clone(), ctx.latent_handle());
                NodeResult::InProgress
            }
        }
    }

    fn abort(&self, ctx: &mut NodeContext<'_>) -> NodeResult {
        self.recorder.push(format!("abort:{}", self.name));
        self.recorder.handles.lock().unwrap().remove(&self.name);
        if self.behavior == Behavior::LatentAbort {
            self.recorder
                .store(format!("abort:{}", self.name), ctx.latent_handle());
            return NodeResult::InProgress;
        }
        NodeResult::Aborted
    }
}

/// Task that only counts its executions.
pub struct Counter(pub Arc<AtomicUsize>);

impl NodeBehavior for Counter {}

impl Task for Counter {
    fn execute(&self, _ctx: &mut NodeContext<'_>) -> NodeResult {
        self.0.fetch_add(1, Ordering::SeqCst);
        NodeResult::Succeeded
    }
}

pub fn schema() -> Arc<BlackboardSchema> {
    BlackboardSchema::builder("Agent")
        .key("Alert", KeyType::Bool)
        .key("Ammo", KeyType::Int)
        .key("Target", KeyType::Vector)
        .build()
}

pub fn component() -> BehaviorTreeComponent {
    init_tracing();
    BehaviorTreeComponent::with_config(BehaviorTreeConfig::default())
        .with_cache(Arc::new(TemplateCache::new()))
}

pub fn run_ticks(component: &mut BehaviorTreeComponent, first: u64, count: u64) {
    let mut ctx = TickContext::new(first, 0.1);
    for _ in 0..count {
        component.tick(&ctx);
        ctx = ctx.next();
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
