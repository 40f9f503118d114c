//! Interface to an external spatial/environment query system.

use ai_core::KeyId;

use crate::bt::NodeResult;
use crate::signal::TaskHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryMode {
    #[default]
    SingleBest,
    SingleRandom,
    AllMatching,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub query: String,
    pub params: Vec<(String, f32)>,
}

impl QueryRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            params: Vec::new(),
        }
    }

    pub fn param(mut self, name: impl Into<String>, value: f32) -> Self {
        self.params.push((name.into(), value));
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub items: Vec<[f32; 3]>,
}

/// Completion callback handed to the query system; resolves the waiting task once.
#[derive(Debug)]
pub struct QueryFinished {
    handle: TaskHandle,
    result_key: Option<KeyId>,
}

impl QueryFinished {
    pub(crate) fn new(handle: TaskHandle, result_key: Option<KeyId>) -> Self {
        Self { handle, result_key }
    }

    /// Stores the first item (if any) and finishes the task: `Succeeded` with items,
    /// `Failed` without.
    pub fn finish(self, result: QueryResult) {
        let Some(first) = result.items.first().copied() else {
            self.handle.finish(NodeResult::Failed);
            return;
        };
        match self.result_key {
            Some(key) => self.handle.finish_with(NodeResult::Succeeded, move |bb| {
                bb.set(key, first);
            }),
            None => self.handle.finish(NodeResult::Succeeded),
        }
    }
}

pub trait QuerySystem: Send {
    fn execute(&mut self, request: QueryRequest, mode: QueryMode, on_finished: QueryFinished) -> QueryId;

    fn abort(&mut self, id: QueryId);
}
