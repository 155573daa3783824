//! gc-timeline library - turn GC probe logs into Trace Event Format timelines.
//!
//! The capture side attaches bpftrace to the runtime's USDT probes and prints
//! one comma separated record per probe hit. This crate interprets that log:
//! it tracks the open GC and work packet spans, decorates them with the meta
//! records emitted while they are open, resolves work packet type names and
//! writes a gzip'd `{"traceEvents": [...]}` file for Perfetto UI.
//!
//! # Modules
//!
//! - [`record`] - line classification and field access
//! - [`symbols`] - type id to name table
//! - [`trace`] - output events and the event arena
//! - [`spans`] - currently open spans per lane
//! - [`enrich`] - core event and meta vocabulary
//! - [`extension`] - hooks for vocabulary outside the core
//! - [`processor`] - the conversion driver
//!
//! # Example
//!
//! ```no_run
//! use gc_timeline::{convert, default_output_path};
//! use std::path::Path;
//!
//! let input = Path::new("./gc.log");
//! let summary = convert(input, &default_output_path(input), None)
//!     .expect("Failed to convert log");
//! println!("{} events", summary.events);
//! ```

pub mod enrich;
pub mod extension;
pub mod processor;
pub mod record;
pub mod spans;
pub mod symbols;
pub mod trace;

pub use extension::{EventContext, Extension, MetaContext, RuleExtension};
pub use processor::{convert, default_output_path, ConvertSummary, LogProcessor};
pub use record::ParseError;
pub use trace::{EventArena, EventId, TraceEvent};
