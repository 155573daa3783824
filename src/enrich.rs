//! Per event kind decoding of probe records into trace events.
//!
//! Non-meta records become [`TraceEvent`]s. `GC` and `WORK` records also open
//! and close spans in the [`SpanTracker`], and meta records decorate whichever
//! span is open on their lane. Names outside the core vocabulary go to the
//! configured [`Extension`].

use serde_json::{json, Value};

use crate::extension::{EventContext, Extension, MetaContext};
use crate::record::{DataRecord, Fields, Phase};
use crate::spans::SpanTracker;
use crate::symbols::UNKNOWN_TYPE;
use crate::trace::{EventArena, EventId, TraceEvent, WORK_EVENT};

/// Thread id of the virtual lane all GC begin/end events are drawn on.
pub const GC_TID: i64 = 0;

/// Names for the `semantics` field of `reference_scanned`, by value.
const REFERENCE_SEMANTICS: [&str; 3] = ["SOFT", "WEAK", "PHANTOM"];
const UNKNOWN_SEMANTICS: &str = "(Unknown)";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind<'a> {
    Gc,
    Work,
    BucketOpen,
    Inst,
    Other(&'a str),
}

impl<'a> EventKind<'a> {
    pub fn from_name(name: &'a str) -> Self {
        match name {
            "GC" => EventKind::Gc,
            WORK_EVENT => EventKind::Work,
            "BUCKET_OPEN" => EventKind::BucketOpen,
            "INST" => EventKind::Inst,
            other => EventKind::Other(other),
        }
    }
}

/// Which open span a meta record attaches to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lane {
    Gc,
    Work,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetaKind<'a> {
    GenFullHeap,
    ImmixDefrag,
    Roots,
    ProcessRootNodes,
    ProcessSlots,
    ScanObjects,
    SweepChunk,
    Finalization,
    ReferenceScanned,
    Other(&'a str),
}

impl<'a> MetaKind<'a> {
    pub fn from_name(name: &'a str) -> Self {
        match name {
            "gen_full_heap" => MetaKind::GenFullHeap,
            "immix_defrag" => MetaKind::ImmixDefrag,
            "roots" => MetaKind::Roots,
            "process_root_nodes" => MetaKind::ProcessRootNodes,
            "process_slots" => MetaKind::ProcessSlots,
            "scan_objects" => MetaKind::ScanObjects,
            "sweep_chunk" => MetaKind::SweepChunk,
            "finalization" => MetaKind::Finalization,
            "reference_scanned" => MetaKind::ReferenceScanned,
            other => MetaKind::Other(other),
        }
    }

    /// The lane a core meta attaches to, `None` for unknown names.
    pub fn lane(self) -> Option<Lane> {
        match self {
            MetaKind::GenFullHeap | MetaKind::ImmixDefrag => Some(Lane::Gc),
            MetaKind::Roots
            | MetaKind::ProcessRootNodes
            | MetaKind::ProcessSlots
            | MetaKind::ScanObjects
            | MetaKind::SweepChunk
            | MetaKind::Finalization
            | MetaKind::ReferenceScanned => Some(Lane::Work),
            MetaKind::Other(_) => None,
        }
    }
}

/// What happened to a meta record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetaOutcome {
    /// Decoded by the core into an open span.
    Applied,
    /// Handed to the extension.
    Forwarded,
    /// No open span, no extension, or an unreadable payload.
    Dropped,
}

#[derive(Default)]
pub struct Enricher {
    spans: SpanTracker,
    extension: Option<Box<dyn Extension>>,
}

impl Enricher {
    pub fn new(extension: Option<Box<dyn Extension>>) -> Self {
        Self {
            spans: SpanTracker::new(),
            extension,
        }
    }

    pub fn spans(&self) -> &SpanTracker {
        &self.spans
    }

    /// Turn a non-meta record into an event, push it and update the spans.
    pub fn enrich_event(
        &mut self,
        record: &DataRecord<'_>,
        ts: f64,
        events: &mut EventArena,
    ) -> EventId {
        let fields = Fields::new(&record.fields);
        let kind = EventKind::from_name(record.name);
        let mut event = TraceEvent::new(record.name, record.phase.as_str(), record.tid, ts);

        match kind {
            EventKind::Gc => event.tid = GC_TID,
            EventKind::Work => {
                let type_id = fields
                    .uint(0)
                    .or_else(|| self.open_work_type_id(record, events));
                match (type_id, fields.raw(0).filter(|raw| !raw.is_empty())) {
                    (Some(type_id), _) => {
                        event.set_arg("type_id", type_id);
                        event.pending_type_id = Some(type_id);
                    }
                    (None, Some(raw)) => {
                        tracing::warn!(
                            "WORK record on thread {} at {} has a bad type id {:?}",
                            record.tid,
                            record.ts,
                            raw
                        );
                        event.name = format!("(unknown:{raw})");
                        event.set_arg("type_id", raw);
                    }
                    (None, None) => {
                        tracing::warn!(
                            "WORK record on thread {} at {} has no type id",
                            record.tid,
                            record.ts
                        );
                        event.name = UNKNOWN_TYPE.to_string();
                    }
                }
            }
            EventKind::BucketOpen => {
                if let Some(stage) = fields.uint(0) {
                    event.set_arg("stage", stage);
                }
            }
            EventKind::Inst => {
                if let Some(val) = fields.int(0) {
                    event.set_arg("val", val);
                }
            }
            EventKind::Other(name) => {
                if let Some(ext) = self.extension.as_mut() {
                    let ctx = EventContext {
                        name,
                        phase: &record.phase,
                        tid: record.tid,
                        ts,
                        fields,
                    };
                    ext.enrich_event(&ctx, &mut event);
                }
            }
        }

        let id = events.push(event);
        match (kind, &record.phase) {
            (EventKind::Gc, Phase::Begin) => self.spans.open_gc(id),
            (EventKind::Gc, Phase::End) => self.spans.close_gc(),
            (EventKind::Work, Phase::Begin) => self.spans.open_work(record.tid, id),
            (EventKind::Work, Phase::End) => self.spans.close_work(record.tid),
            _ => {}
        }
        id
    }

    /// End records may omit the type id, in which case it comes from the
    /// span they close.
    fn open_work_type_id(&self, record: &DataRecord<'_>, events: &EventArena) -> Option<u64> {
        if record.phase != Phase::End {
            return None;
        }
        let open = events.get(self.spans.current_work(record.tid)?)?;
        open.pending_type_id
            .or_else(|| open.args.get("type_id").and_then(|v| v.as_u64()))
    }

    /// Attach a meta record to the span open on its lane.
    pub fn enrich_meta(
        &mut self,
        record: &DataRecord<'_>,
        ts: f64,
        events: &mut EventArena,
    ) -> MetaOutcome {
        let fields = Fields::new(&record.fields);
        let kind = MetaKind::from_name(record.name);
        let gc = self.spans.current_gc();
        let work = self.spans.current_work(record.tid);

        let target = match kind.lane() {
            Some(Lane::Gc) => gc,
            Some(Lane::Work) => work,
            None => return self.forward_meta(record, ts, fields, gc, work, events),
        };
        let Some(event) = target.and_then(|id| events.get_mut(id)) else {
            tracing::debug!(
                "Dropping {} on thread {} at {}: no open span",
                record.name,
                record.tid,
                record.ts
            );
            return MetaOutcome::Dropped;
        };

        if apply_meta(kind, &fields, event) {
            MetaOutcome::Applied
        } else {
            tracing::debug!(
                "Dropping {} on thread {} at {}: malformed payload {:?}",
                record.name,
                record.tid,
                record.ts,
                record.fields
            );
            MetaOutcome::Dropped
        }
    }

    fn forward_meta(
        &mut self,
        record: &DataRecord<'_>,
        ts: f64,
        fields: Fields<'_, '_>,
        gc: Option<EventId>,
        work: Option<EventId>,
        events: &mut EventArena,
    ) -> MetaOutcome {
        let Some(ext) = self.extension.as_mut() else {
            tracing::debug!("Dropping unknown meta {}: no extension", record.name);
            return MetaOutcome::Dropped;
        };
        if gc.is_none() && work.is_none() {
            tracing::debug!("Dropping unknown meta {}: no open span", record.name);
            return MetaOutcome::Dropped;
        }

        let ctx = MetaContext {
            name: record.name,
            tid: record.tid,
            ts,
            fields,
        };
        let (gc, work) = events.get_pair_mut(gc, work);
        ext.enrich_meta(&ctx, gc, work);
        MetaOutcome::Forwarded
    }
}

fn bool_arg(event: &mut TraceEvent, key: &str, fields: &Fields<'_, '_>) -> bool {
    match fields.bool(0) {
        Some(value) => {
            event.set_arg(key, value);
            true
        }
        None => false,
    }
}

fn root_entry(kind_id: u64, count: u64) -> Value {
    match kind_id {
        0 => json!({"kind": "normal_roots", "num_slots": count}),
        1 => json!({"kind": "pinning_roots", "num_nodes": count}),
        2 => json!({"kind": "tpinning_roots", "num_nodes": count}),
        other => json!({"kind": UNKNOWN_SEMANTICS, "kind_id": other, "count": count}),
    }
}

fn reference_semantics(value: u64) -> &'static str {
    usize::try_from(value)
        .ok()
        .and_then(|idx| REFERENCE_SEMANTICS.get(idx))
        .copied()
        .unwrap_or(UNKNOWN_SEMANTICS)
}

/// `end - begin` as a signed value, clamped to the `i64` range.
fn signed_diff(begin: u64, end: u64) -> i64 {
    let diff = i128::from(end) - i128::from(begin);
    diff.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
}

fn begin_end(begin: u64, end: u64) -> Value {
    json!({"begin": begin, "end": end, "diff": signed_diff(begin, end)})
}

/// Decode a core meta payload into `event`. Returns false if the payload
/// could not be read, in which case `event` is left untouched.
fn apply_meta(kind: MetaKind<'_>, fields: &Fields<'_, '_>, event: &mut TraceEvent) -> bool {
    match kind {
        MetaKind::GenFullHeap => bool_arg(event, "full_heap", fields),
        MetaKind::ImmixDefrag => bool_arg(event, "immix_is_defrag_gc", fields),
        MetaKind::Roots => {
            let Some([kind_id, count]) = fields.uints::<2>() else {
                return false;
            };
            event.append_arg("roots", root_entry(kind_id, count));
            true
        }
        MetaKind::ProcessRootNodes => {
            let Some([num_roots, num_enqueued_nodes]) = fields.uints::<2>() else {
                return false;
            };
            event.set_arg("num_roots", num_roots);
            event.set_arg("num_enqueued_nodes", num_enqueued_nodes);
            true
        }
        MetaKind::ProcessSlots => {
            let Some([num_slots, is_roots]) = fields.uints::<2>() else {
                return false;
            };
            event.set_arg(
                "process_slots",
                json!({"num_slots": num_slots, "is_roots": is_roots != 0}),
            );
            true
        }
        MetaKind::ScanObjects => {
            let Some([total, traced]) = fields.uints::<2>() else {
                return false;
            };
            event.set_arg(
                "scan_objects",
                json!({
                    "total_scanned": total,
                    "scan_for_slots": total.saturating_sub(traced),
                    "scan_and_trace": traced,
                }),
            );
            true
        }
        MetaKind::SweepChunk => {
            let Some([allocated_blocks]) = fields.uints::<1>() else {
                return false;
            };
            event.set_arg("allocated_blocks", allocated_blocks);
            true
        }
        MetaKind::Finalization => {
            let Some([cand_begin, cand_end, ready_begin, ready_end]) = fields.uints::<4>() else {
                return false;
            };
            event.set_arg("num_candidates", begin_end(cand_begin, cand_end));
            event.set_arg("ready_for_finalize", begin_end(ready_begin, ready_end));
            true
        }
        MetaKind::ReferenceScanned => {
            let Some([semantics, old, new, enqueued]) = fields.uints::<4>() else {
                return false;
            };
            event.append_arg(
                "reference_scanned",
                json!({
                    "semantics": reference_semantics(semantics),
                    "num_old_references": old,
                    "num_new_references": new,
                    "num_enqueued_references": enqueued,
                }),
            );
            true
        }
        MetaKind::Other(_) => false,
    }
}
