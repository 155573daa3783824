//! Trace Event Format output model.
//!
//! Events live in an append-only [`EventArena`]. Open spans are tracked by
//! [`EventId`] so that meta records can mutate an event after it was pushed,
//! and the arena is serialized wholesale once the log is consumed.

use std::io::Write;

use anyhow::Result;
use serde::Serialize;
use serde_json::{Map, Value};

/// Name of the work packet event before its type id is resolved.
pub const WORK_EVENT: &str = "WORK";

/// Index of an event inside an [`EventArena`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EventId(usize);

/// A single `traceEvents` entry.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TraceEvent {
    pub name: String,
    pub ph: String,
    pub tid: i64,
    /// Microseconds since the first record of the log.
    pub ts: f64,
    pub args: Map<String, Value>,
    /// Type id waiting for the resolution pass.
    #[serde(skip)]
    pub pending_type_id: Option<u64>,
}

impl TraceEvent {
    pub fn new(name: &str, ph: &str, tid: i64, ts: f64) -> Self {
        Self {
            name: name.to_string(),
            ph: ph.to_string(),
            tid,
            ts,
            args: Map::new(),
            pending_type_id: None,
        }
    }

    pub fn set_arg(&mut self, key: &str, value: impl Into<Value>) {
        self.args.insert(key.to_string(), value.into());
    }

    /// Push `value` onto the list stored at `args[key]`, creating it if needed.
    ///
    /// A non-list value already sitting under `key` is replaced by a fresh list.
    pub fn append_arg(&mut self, key: &str, value: Value) {
        let slot = self
            .args
            .entry(key.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        match slot {
            Value::Array(list) => list.push(value),
            other => *other = Value::Array(vec![value]),
        }
    }
}

/// Append-only storage for the events of one conversion.
#[derive(Debug, Default)]
pub struct EventArena {
    events: Vec<TraceEvent>,
}

impl EventArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: TraceEvent) -> EventId {
        self.events.push(event);
        EventId(self.events.len() - 1)
    }

    pub fn get(&self, id: EventId) -> Option<&TraceEvent> {
        self.events.get(id.0)
    }

    pub fn get_mut(&mut self, id: EventId) -> Option<&mut TraceEvent> {
        self.events.get_mut(id.0)
    }

    /// Borrow two distinct events mutably at once.
    ///
    /// If both ids point at the same event only the first one is returned.
    pub fn get_pair_mut(
        &mut self,
        a: Option<EventId>,
        b: Option<EventId>,
    ) -> (Option<&mut TraceEvent>, Option<&mut TraceEvent>) {
        match (a, b) {
            (Some(a), Some(b)) if a.0 != b.0 => {
                let (lo, hi, swapped) = if a.0 < b.0 { (a, b, false) } else { (b, a, true) };
                if hi.0 >= self.events.len() {
                    return (self.get_mut(a), None);
                }
                let (left, right) = self.events.split_at_mut(hi.0);
                let lo_ref = &mut left[lo.0];
                let hi_ref = &mut right[0];
                if swapped {
                    (Some(hi_ref), Some(lo_ref))
                } else {
                    (Some(lo_ref), Some(hi_ref))
                }
            }
            (Some(a), _) => (self.get_mut(a), None),
            (None, Some(b)) => (None, self.get_mut(b)),
            (None, None) => (None, None),
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TraceEvent> {
        self.events.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut TraceEvent> {
        self.events.iter_mut()
    }

    /// Write `{"traceEvents": [...]}` to `writer`.
    pub fn write_json<W: Write>(&self, writer: W) -> Result<()> {
        serde_json::to_writer(writer, &TraceDocument { trace_events: &self.events })?;
        Ok(())
    }
}

#[derive(Serialize)]
struct TraceDocument<'a> {
    #[serde(rename = "traceEvents")]
    trace_events: &'a [TraceEvent],
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_append_arg_creates_list() {
        let mut event = TraceEvent::new("WORK", "B", 1, 0.0);
        event.append_arg("roots", json!({"kind": "normal_roots"}));
        event.append_arg("roots", json!({"kind": "pinning_roots"}));
        assert_eq!(
            event.args["roots"],
            json!([{"kind": "normal_roots"}, {"kind": "pinning_roots"}])
        );
    }

    #[test]
    fn test_get_pair_mut() {
        let mut arena = EventArena::new();
        let a = arena.push(TraceEvent::new("GC", "B", 0, 0.0));
        let b = arena.push(TraceEvent::new("WORK", "B", 1, 1.0));

        let (gc, work) = arena.get_pair_mut(Some(b), Some(a));
        gc.unwrap().set_arg("x", 1);
        work.unwrap().set_arg("y", 2);
        assert_eq!(arena.get(b).unwrap().args["x"], json!(1));
        assert_eq!(arena.get(a).unwrap().args["y"], json!(2));

        let (first, second) = arena.get_pair_mut(Some(a), Some(a));
        assert!(first.is_some());
        assert!(second.is_none());

        let (first, second) = arena.get_pair_mut(None, Some(b));
        assert!(first.is_none());
        assert_eq!(second.unwrap().name, "WORK");
    }

    #[test]
    fn test_args_keep_insertion_order() {
        let mut arena = EventArena::new();
        let mut event = TraceEvent::new("WORK", "B", 1, 0.0);
        event.set_arg("type_id", 3);
        event.set_arg("num_roots", 1);
        event.set_arg("allocated_blocks", 2);
        arena.push(event);

        let mut buf = Vec::new();
        arena.write_json(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains(r#""args":{"type_id":3,"num_roots":1,"allocated_blocks":2}"#));
    }

    #[test]
    fn test_write_json() {
        let mut arena = EventArena::new();
        let mut event = TraceEvent::new("GC", "B", 0, 0.0);
        event.pending_type_id = Some(3);
        arena.push(event);

        let mut buf = Vec::new();
        arena.write_json(&mut buf).unwrap();
        let doc: Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(
            doc,
            json!({"traceEvents": [{"name": "GC", "ph": "B", "tid": 0, "ts": 0.0, "args": {}}]})
        );
    }
}
