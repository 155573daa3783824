//! Currently open spans, one GC lane plus one work lane per thread.
//!
//! The capture can drop records under load, so a missing span is a normal
//! state and closing an already closed lane is a no-op.

use std::collections::HashMap;

use crate::trace::EventId;

#[derive(Debug, Default)]
pub struct SpanTracker {
    gc: Option<EventId>,
    work: HashMap<i64, EventId>,
}

impl SpanTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_gc(&mut self, event: EventId) {
        if let Some(prev) = self.gc.replace(event) {
            tracing::debug!("GC span {:?} never closed, replaced", prev);
        }
    }

    pub fn close_gc(&mut self) {
        self.gc = None;
    }

    pub fn current_gc(&self) -> Option<EventId> {
        self.gc
    }

    pub fn open_work(&mut self, tid: i64, event: EventId) {
        if let Some(prev) = self.work.insert(tid, event) {
            tracing::debug!("Work span {:?} on thread {} never closed, replaced", prev, tid);
        }
    }

    pub fn close_work(&mut self, tid: i64) {
        self.work.remove(&tid);
    }

    pub fn current_work(&self, tid: i64) -> Option<EventId> {
        self.work.get(&tid).copied()
    }
}
