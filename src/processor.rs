//! One pass driver: parse the log, resolve type names, write the trace.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::enrich::{Enricher, MetaOutcome};
use crate::extension::Extension;
use crate::record::{parse_line, LogLine, ParseError, Phase};
use crate::symbols::SymbolTable;
use crate::trace::{EventArena, TraceEvent, WORK_EVENT};

/// Counters describing one conversion.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConvertSummary {
    pub events: usize,
    pub symbols: usize,
    pub metas_applied: usize,
    pub metas_forwarded: usize,
    pub metas_dropped: usize,
    pub skipped_lines: usize,
}

#[derive(Default)]
pub struct LogProcessor {
    symbols: SymbolTable,
    events: EventArena,
    enricher: Enricher,
    start_time: Option<i64>,
    line_no: usize,
    summary: ConvertSummary,
}

impl LogProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_extension(extension: Box<dyn Extension>) -> Self {
        Self {
            enricher: Enricher::new(Some(extension)),
            ..Self::default()
        }
    }

    /// Feed one line of the log.
    pub fn process_line(&mut self, line: &str) -> Result<(), ParseError> {
        self.line_no += 1;
        match parse_line(line, self.line_no)? {
            LogLine::TypeName { id, name } => self.symbols.record(id, name),
            LogLine::Data(record) => {
                let start = *self.start_time.get_or_insert(record.ts);
                // Perfetto wants microseconds.
                let ts = (i128::from(record.ts) - i128::from(start)) as f64 / 1000.0;
                if record.phase == Phase::Meta {
                    match self.enricher.enrich_meta(&record, ts, &mut self.events) {
                        MetaOutcome::Applied => self.summary.metas_applied += 1,
                        MetaOutcome::Forwarded => self.summary.metas_forwarded += 1,
                        MetaOutcome::Dropped => self.summary.metas_dropped += 1,
                    }
                } else {
                    self.enricher.enrich_event(&record, ts, &mut self.events);
                }
            }
            LogLine::Skip => self.summary.skipped_lines += 1,
        }
        Ok(())
    }

    /// Feed every line of `reader`.
    pub fn process_reader<R: BufRead>(&mut self, reader: R) -> Result<()> {
        for line in reader.lines() {
            let line = line.context("Failed to read log line")?;
            self.process_line(&line)?;
        }
        Ok(())
    }

    /// Replace the name of every `WORK` event with its type name.
    ///
    /// Events are only resolved once, so calling this again is a no-op.
    pub fn resolve_results(&mut self) {
        for event in self.events.iter_mut() {
            if event.name != WORK_EVENT {
                continue;
            }
            if let Some(type_id) = event.pending_type_id.take() {
                event.name = self.symbols.resolve(type_id);
            }
        }
    }

    pub fn events(&self) -> impl Iterator<Item = &TraceEvent> {
        self.events.iter()
    }

    pub fn summary(&self) -> ConvertSummary {
        ConvertSummary {
            events: self.events.len(),
            symbols: self.symbols.len(),
            ..self.summary.clone()
        }
    }

    /// Serialize the `traceEvents` document, uncompressed.
    pub fn output<W: Write>(&self, writer: W) -> Result<()> {
        self.events.write_json(writer)
    }

    /// Serialize the `traceEvents` document gzip compressed to `path`.
    pub fn output_gz(&self, path: &Path) -> Result<()> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        self.output(&mut encoder)?;
        encoder
            .finish()
            .and_then(|mut writer| writer.flush())
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }
}

/// `<input>.json.gz`, next to the input.
pub fn default_output_path(input: &Path) -> PathBuf {
    let mut name = input.as_os_str().to_owned();
    name.push(".json.gz");
    PathBuf::from(name)
}

/// Convert the log at `input` into a compressed trace at `output`.
pub fn convert(
    input: &Path,
    output: &Path,
    extension: Option<Box<dyn Extension>>,
) -> Result<ConvertSummary> {
    let mut processor = match extension {
        Some(ext) => LogProcessor::with_extension(ext),
        None => LogProcessor::new(),
    };

    tracing::info!("Parsing lines...");
    let file =
        File::open(input).with_context(|| format!("Failed to open {}", input.display()))?;
    processor
        .process_reader(BufReader::new(file))
        .with_context(|| format!("Failed to parse {}", input.display()))?;

    tracing::info!("Resolving work packet type names...");
    processor.resolve_results();

    tracing::info!("Dumping JSON output to {}", output.display());
    processor.output_gz(output)?;

    let summary = processor.summary();
    tracing::info!(
        events = summary.events,
        symbols = summary.symbols,
        metas_applied = summary.metas_applied,
        metas_forwarded = summary.metas_forwarded,
        metas_dropped = summary.metas_dropped,
        skipped_lines = summary.skipped_lines,
        "Conversion complete"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn process(lines: &[&str]) -> LogProcessor {
        let mut processor = LogProcessor::new();
        for line in lines {
            processor.process_line(line).unwrap();
        }
        processor
    }

    fn document(processor: &LogProcessor) -> Value {
        let mut buf = Vec::new();
        processor.output(&mut buf).unwrap();
        serde_json::from_slice(&buf).unwrap()
    }

    #[test]
    fn test_symbol_round_trip() {
        let mut processor = process(&["@type_name[7]: Foo", "WORK,B,1,10,7", "WORK,E,1,20,7"]);
        processor.resolve_results();
        let names: Vec<&str> = processor.events().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["Foo", "Foo"]);
    }

    #[test]
    fn test_symbol_declared_after_use() {
        let mut processor = process(&["WORK,B,1,10,7", "@type_name[7]: Late", "WORK,E,1,20,7"]);
        processor.resolve_results();
        assert!(processor.events().all(|e| e.name == "Late"));
    }

    #[test]
    fn test_unknown_symbol() {
        let mut processor = process(&["WORK,B,1,10,9"]);
        processor.resolve_results();
        let event = processor.events().next().unwrap();
        assert_eq!(event.name, "(unknown:9)");
        assert_eq!(event.args["type_id"], json!(9));
    }

    #[test]
    fn test_gc_lane_pinning() {
        let processor = process(&["GC,B,1234,10", "GC,E,5678,20"]);
        assert!(processor.events().all(|e| e.tid == 0));
    }

    #[test]
    fn test_timestamp_normalization() {
        let processor = process(&["GC,B,1,5000", "BUCKET_OPEN,i,1,5000000,1", "GC,E,1,9000000"]);
        let ts: Vec<f64> = processor.events().map(|e| e.ts).collect();
        assert_eq!(ts[0], 0.0);
        assert_eq!(ts[1], (5000000 - 5000) as f64 / 1000.0);
        assert_eq!(ts[2], (9000000 - 5000) as f64 / 1000.0);
    }

    #[test]
    fn test_timestamp_origin_from_meta() {
        let processor = process(&["roots,meta,1,1000,0,1", "GC,B,1,3000"]);
        assert_eq!(processor.events().next().unwrap().ts, 2.0);
    }

    #[test]
    fn test_dropped_span_tolerance() {
        let processor = process(&["WORK,B,1,10,0", "roots,meta,2,11,1,4"]);
        assert!(processor.events().all(|e| !e.args.contains_key("roots")));
        assert_eq!(processor.summary().metas_dropped, 1);
    }

    #[test]
    fn test_idempotent_resolution() {
        let mut processor = process(&["@type_name[0]: WORK", "WORK,B,1,10,0", "WORK,B,1,20,1"]);
        processor.resolve_results();
        let once = document(&processor);
        processor.resolve_results();
        assert_eq!(document(&processor), once);
        assert_eq!(once["traceEvents"][0]["name"], json!("WORK"));
        assert_eq!(once["traceEvents"][1]["name"], json!("(unknown:1)"));
    }

    #[test]
    fn test_end_to_end_scenario() {
        let mut processor = process(&[
            "@type_name0: Foo",
            "WORK,B,1,1000,0",
            "roots,meta,1,1500,1,4",
            "WORK,E,1,2000",
        ]);
        processor.resolve_results();
        let doc = document(&processor);
        let events = doc["traceEvents"].as_array().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["name"], json!("Foo"));
        assert_eq!(events[0]["ph"], json!("B"));
        assert_eq!(
            events[0]["args"]["roots"],
            json!([{"kind": "pinning_roots", "num_nodes": 4}])
        );
        assert_eq!(events[1]["ph"], json!("E"));
        assert_eq!(events[1]["ts"], json!(1.0));
    }

    #[test]
    fn test_work_without_type_id_is_unknown() {
        let mut processor = process(&["@type_name0: Foo", "WORK,E,1,2000", "WORK,B,1,3000,x7"]);
        processor.resolve_results();
        let names: Vec<&str> = processor.events().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["(unknown)", "(unknown:x7)"]);
    }

    #[test]
    fn test_extreme_timestamps_do_not_overflow() {
        let processor = process(&["GC,B,1,-9223372036854775808", "GC,E,1,9223372036854775807"]);
        let ts: Vec<f64> = processor.events().map(|e| e.ts).collect();
        assert_eq!(ts[0], 0.0);
        assert_eq!(ts[1], u64::MAX as f64 / 1000.0);
    }

    #[test]
    fn test_malformed_line_is_fatal() {
        let mut processor = LogProcessor::new();
        processor.process_line("GC,B,1,10").unwrap();
        let err = processor.process_line("GC,E").unwrap_err();
        assert!(matches!(err, ParseError::TooFewFields { line_no: 2, .. }));
    }

    #[test]
    fn test_noise_lines_skipped() {
        let processor = process(&["Attaching 9 probes...", "", "GC,B,1,10"]);
        assert_eq!(processor.summary().skipped_lines, 2);
        assert_eq!(processor.summary().events, 1);
    }

    #[test]
    fn test_default_output_path() {
        assert_eq!(
            default_output_path(Path::new("/tmp/log.txt")),
            PathBuf::from("/tmp/log.txt.json.gz")
        );
    }
}
