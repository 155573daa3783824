//! Raw log line classification.
//!
//! The capture script prints two kinds of lines that we care about:
//!
//! ```text
//! @type_name[12]: mmtk::scheduler::gc_work::ScanObjects
//! WORK,B,4242,1715172000000,12
//! ```
//!
//! The first declares a symbol, the second is a data record of the form
//! `name,phase,tid,ts,field...`. Anything else (blank lines, the "Attaching N
//! probes..." banner) is noise and gets skipped.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

/// Prefix of a symbol declaration line.
pub const TYPE_NAME_PREFIX: &str = "@type_name";

/// The phase column of a data record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    Begin,
    End,
    Meta,
    /// Any other Trace Event Format phase, passed through untouched.
    Other(String),
}

impl Phase {
    pub fn parse(ph: &str) -> Self {
        match ph {
            "B" => Phase::Begin,
            "E" => Phase::End,
            "meta" => Phase::Meta,
            other => Phase::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Phase::Begin => "B",
            Phase::End => "E",
            Phase::Meta => "meta",
            Phase::Other(ph) => ph,
        }
    }
}

/// One parsed `name,phase,tid,ts,field...` record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataRecord<'a> {
    pub name: &'a str,
    pub phase: Phase,
    pub tid: i64,
    pub ts: i64,
    pub fields: Vec<&'a str>,
}

/// A classified input line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogLine<'a> {
    TypeName { id: u64, name: &'a str },
    Data(DataRecord<'a>),
    Skip,
}

/// Fatal problems with a single input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// A data record with fewer than the four framing fields.
    TooFewFields { line_no: usize, line: String },
    /// A framing field (tid or ts) that is not an integer.
    BadInteger {
        line_no: usize,
        line: String,
        column: &'static str,
    },
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::TooFewFields { line_no, line } => {
                write!(f, "Abnormal line {line_no}: expected at least 4 fields: {line}")
            }
            ParseError::BadInteger {
                line_no,
                line,
                column,
            } => write!(f, "Abnormal line {line_no}: {column} is not an integer: {line}"),
        }
    }
}

impl std::error::Error for ParseError {}

fn type_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+").expect("static regex"))
}

/// Classify a single line. `line_no` is only used for diagnostics.
pub fn parse_line(line: &str, line_no: usize) -> Result<LogLine<'_>, ParseError> {
    let line = line.trim();
    if line.starts_with(TYPE_NAME_PREFIX) {
        return Ok(parse_type_line(line));
    }
    if !line.contains(',') {
        return Ok(LogLine::Skip);
    }

    let parts: Vec<&str> = line.split(',').collect();
    if parts.len() < 4 {
        return Err(ParseError::TooFewFields {
            line_no,
            line: line.to_string(),
        });
    }

    let parse_int = |s: &str, column: &'static str| {
        s.trim().parse::<i64>().map_err(|_| ParseError::BadInteger {
            line_no,
            line: line.to_string(),
            column,
        })
    };

    Ok(LogLine::Data(DataRecord {
        name: parts[0],
        phase: Phase::parse(parts[1]),
        tid: parse_int(parts[2], "tid")?,
        ts: parse_int(parts[3], "timestamp")?,
        fields: parts[4..].to_vec(),
    }))
}

fn parse_type_line(line: &str) -> LogLine<'_> {
    let Some((left, right)) = line.split_once(':') else {
        tracing::warn!("Symbol declaration without a name: {}", line);
        return LogLine::Skip;
    };
    let id = type_id_regex()
        .find(left)
        .and_then(|m| m.as_str().parse::<u64>().ok());
    match id {
        Some(id) => LogLine::TypeName {
            id,
            name: right.trim(),
        },
        None => {
            tracing::warn!("Symbol declaration without a type id: {}", line);
            LogLine::Skip
        }
    }
}

/// Positional access to the payload fields of a record.
///
/// Missing or garbled payload fields are common when the probe races with
/// the runtime, so every accessor returns an `Option` and callers drop the
/// contribution instead of failing.
#[derive(Clone, Copy, Debug)]
pub struct Fields<'r, 'a> {
    fields: &'r [&'a str],
}

impl<'r, 'a> Fields<'r, 'a> {
    pub fn new(fields: &'r [&'a str]) -> Self {
        Self { fields }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn raw(&self, idx: usize) -> Option<&'a str> {
        self.fields.get(idx).copied().map(str::trim)
    }

    pub fn int(&self, idx: usize) -> Option<i64> {
        self.raw(idx)?.parse().ok()
    }

    /// Counts and ids are printed as unsigned 64 bit values.
    pub fn uint(&self, idx: usize) -> Option<u64> {
        self.raw(idx)?.parse().ok()
    }

    /// Booleans are printed as 0/1 by the probe.
    pub fn bool(&self, idx: usize) -> Option<bool> {
        self.uint(idx)
            .map(|v| v != 0)
            .or_else(|| self.int(idx).map(|v| v != 0))
    }

    /// Decode the first `N` fields as unsigned integers, all or nothing.
    pub fn uints<const N: usize>(&self) -> Option<[u64; N]> {
        let mut out = [0; N];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.uint(i)?;
        }
        Some(out)
    }
}
