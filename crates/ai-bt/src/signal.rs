use std::fmt;
use std::sync::mpsc::Sender;

use ai_core::{Blackboard, KeyId, ObserverOwner};

use crate::bt::{NodeId, NodeResult};

pub(crate) type BlackboardUpdate = Box<dyn FnOnce(&mut Blackboard) + Send>;

/// Messages delivered to a component between ticks.
pub(crate) enum EngineSignal {
    TaskFinished {
        request_id: u32,
        result: NodeResult,
        update: Option<BlackboardUpdate>,
    },
    BlackboardChanged {
        owner: ObserverOwner,
        key: KeyId,
    },
}

/// Blackboard observer owner for a node of one pushed instance.
pub(crate) fn observer_owner(instance_serial: u32, node: NodeId) -> ObserverOwner {
    ObserverOwner(((instance_serial as u64) << 16) | node.0 as u64)
}

pub(crate) fn split_owner(owner: ObserverOwner) -> (u32, NodeId) {
    ((owner.0 >> 16) as u32, NodeId((owner.0 & 0xFFFF) as u16))
}

/// Completion handle for a task that returned [`NodeResult::InProgress`].
///
/// The handle resolves once; finishing consumes it. Completions that arrive after the engine
/// stopped listening (the task was aborted or the tree stopped) are dropped.
pub struct TaskHandle {
    request_id: u32,
    sender: Sender<EngineSignal>,
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("request_id", &self.request_id)
            .finish()
    }
}

impl TaskHandle {
    pub(crate) fn new(request_id: u32, sender: Sender<EngineSignal>) -> Self {
        Self { request_id, sender }
    }

    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    pub fn finish(self, result: NodeResult) {
        self.send(result, None);
    }

    /// Finishes and applies `update` to the blackboard right before the engine handles the
    /// result.
    pub fn finish_with(
        self,
        result: NodeResult,
        update: impl FnOnce(&mut Blackboard) + Send + 'static,
    ) {
        self.send(result, Some(Box::new(update)));
    }

    fn send(self, result: NodeResult, update: Option<BlackboardUpdate>) {
        let sent = self.sender.send(EngineSignal::TaskFinished {
            request_id: self.request_id,
            result,
            update,
        });
        if sent.is_err() {
            tracing::debug!(request = self.request_id, "task finished after its component was dropped");
        }
    }
}
