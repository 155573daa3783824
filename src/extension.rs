//! Hooks for event vocabulary the core does not know about.
//!
//! Runtime bindings emit their own probe records on top of the core ones.
//! Rather than teaching the enricher every binding's vocabulary, unknown
//! events and metas are handed to an [`Extension`], which mutates the live
//! events in place exactly like the core enrichment does.
//!
//! Besides implementing the trait directly, a JSON rule file can be loaded
//! with [`RuleExtension::load`]. The file format is
//!
//! ```json
//! {
//!   "events": [
//!     { "name": "PLAN_END_OF_GC", "fields": [ { "key": "plan_id", "type": "int" } ] }
//!   ],
//!   "meta": [
//!     {
//!       "name": "alloc_slow",
//!       "target": "work",
//!       "group": "alloc_slow",
//!       "append": true,
//!       "fields": [ { "key": "bytes", "type": "int" }, { "key": "large", "type": "bool" } ]
//!     }
//!   ]
//! }
//! ```
//!
//! Both sections are optional; a missing section disables that hook.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::enrich::{EventKind, MetaKind};
use crate::record::{Fields, Phase};
use crate::trace::TraceEvent;

/// What the enricher knows about a non-meta record it could not handle.
#[derive(Clone, Copy, Debug)]
pub struct EventContext<'r, 'a> {
    pub name: &'a str,
    pub phase: &'r Phase,
    pub tid: i64,
    /// Microseconds since the start of the log.
    pub ts: f64,
    pub fields: Fields<'r, 'a>,
}

/// What the enricher knows about a meta record it could not handle.
#[derive(Clone, Copy, Debug)]
pub struct MetaContext<'r, 'a> {
    pub name: &'a str,
    pub tid: i64,
    pub ts: f64,
    pub fields: Fields<'r, 'a>,
}

/// Optional enrichment for vocabulary outside the core set.
///
/// Both methods default to doing nothing, so an implementation only needs to
/// provide the hook it cares about.
pub trait Extension {
    /// Called for every non-meta record whose name is not a core event.
    /// `event` is pushed to the arena right after this returns and is
    /// serialized as left here.
    fn enrich_event(&mut self, _ctx: &EventContext<'_, '_>, _event: &mut TraceEvent) {}

    /// Called for meta records whose name is not a core meta, when at least
    /// one of the GC span or the thread's work span is open.
    fn enrich_meta(
        &mut self,
        _ctx: &MetaContext<'_, '_>,
        _gc: Option<&mut TraceEvent>,
        _work: Option<&mut TraceEvent>,
    ) {
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Int,
    Bool,
    String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldRule {
    pub key: String,
    #[serde(rename = "type")]
    pub ty: FieldType,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetaTarget {
    Gc,
    Work,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventRule {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<FieldRule>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetaRule {
    pub name: String,
    pub target: MetaTarget,
    #[serde(default)]
    pub fields: Vec<FieldRule>,
    pub group: Option<String>,
    #[serde(default)]
    pub append: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleFile {
    events: Option<Vec<EventRule>>,
    meta: Option<Vec<MetaRule>>,
}

/// An [`Extension`] driven by a declarative JSON rule file.
#[derive(Debug, Default)]
pub struct RuleExtension {
    events: Option<HashMap<String, EventRule>>,
    meta: Option<HashMap<String, MetaRule>>,
}

impl RuleExtension {
    pub fn load(path: &Path) -> Result<Self> {
        let buf = fs::read_to_string(path)
            .with_context(|| format!("Failed to read extension {}", path.display()))?;
        Self::from_json(&buf).with_context(|| format!("Invalid extension {}", path.display()))
    }

    pub fn from_json(buf: &str) -> Result<Self> {
        let file: RuleFile = serde_json::from_str(buf)?;
        let mut ext = RuleExtension::default();

        if let Some(rules) = file.events {
            let mut events = HashMap::new();
            for rule in rules {
                if !matches!(EventKind::from_name(&rule.name), EventKind::Other(_)) {
                    bail!("Event {} is handled by the core and cannot be overridden", rule.name);
                }
                if events.contains_key(&rule.name) {
                    bail!("Event rule {} already exists", rule.name);
                }
                events.insert(rule.name.clone(), rule);
            }
            ext.events = Some(events);
        }

        if let Some(rules) = file.meta {
            let mut meta = HashMap::new();
            for rule in rules {
                if !matches!(MetaKind::from_name(&rule.name), MetaKind::Other(_)) {
                    bail!("Meta {} is handled by the core and cannot be overridden", rule.name);
                }
                if rule.append && rule.group.is_none() {
                    bail!("Meta rule {} appends but has no group", rule.name);
                }
                if meta.contains_key(&rule.name) {
                    bail!("Meta rule {} already exists", rule.name);
                }
                meta.insert(rule.name.clone(), rule);
            }
            ext.meta = Some(meta);
        }

        Ok(ext)
    }

    pub fn has_event_hook(&self) -> bool {
        self.events.is_some()
    }

    pub fn has_meta_hook(&self) -> bool {
        self.meta.is_some()
    }
}

/// Decode `fields` positionally. A field that is missing or does not parse is
/// left out of the result.
fn decode_fields(rules: &[FieldRule], fields: &Fields<'_, '_>) -> Map<String, Value> {
    let mut out = Map::new();
    for (idx, rule) in rules.iter().enumerate() {
        let value = match rule.ty {
            FieldType::Int => fields
                .int(idx)
                .map(Value::from)
                .or_else(|| fields.uint(idx).map(Value::from)),
            FieldType::Bool => fields.bool(idx).map(Value::from),
            FieldType::String => fields.raw(idx).map(Value::from),
        };
        match value {
            Some(value) => {
                out.insert(rule.key.clone(), value);
            }
            None => tracing::debug!("Field {} ({}) missing or malformed", idx, rule.key),
        }
    }
    out
}

impl Extension for RuleExtension {
    fn enrich_event(&mut self, ctx: &EventContext<'_, '_>, event: &mut TraceEvent) {
        let Some(rule) = self.events.as_ref().and_then(|e| e.get(ctx.name)) else {
            return;
        };
        event.args.extend(decode_fields(&rule.fields, &ctx.fields));
    }

    fn enrich_meta(
        &mut self,
        ctx: &MetaContext<'_, '_>,
        gc: Option<&mut TraceEvent>,
        work: Option<&mut TraceEvent>,
    ) {
        let Some(rule) = self.meta.as_ref().and_then(|m| m.get(ctx.name)) else {
            return;
        };
        let target = match rule.target {
            MetaTarget::Gc => gc,
            MetaTarget::Work => work,
        };
        let Some(event) = target else {
            tracing::debug!("No open {:?} span for meta {}", rule.target, ctx.name);
            return;
        };

        let decoded = decode_fields(&rule.fields, &ctx.fields);
        match (&rule.group, rule.append) {
            (Some(group), true) => event.append_arg(group, Value::Object(decoded)),
            (Some(group), false) => event.set_arg(group, Value::Object(decoded)),
            (None, _) => event.args.extend(decoded),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const RULES: &str = r#"
    {
        "events": [
            { "name": "PLAN_END_OF_GC", "fields": [ { "key": "plan_id", "type": "int" } ] }
        ],
        "meta": [
            {
                "name": "alloc_slow",
                "target": "work",
                "group": "alloc_slow",
                "append": true,
                "fields": [
                    { "key": "bytes", "type": "int" },
                    { "key": "large", "type": "bool" }
                ]
            },
            {
                "name": "plan_name",
                "target": "gc",
                "fields": [ { "key": "plan", "type": "string" } ]
            }
        ]
    }
    "#;

    #[test]
    fn test_load_rules() {
        let ext = RuleExtension::from_json(RULES).unwrap();
        assert!(ext.has_event_hook());
        assert!(ext.has_meta_hook());
    }

    #[test]
    fn test_missing_sections_disable_hooks() {
        let ext = RuleExtension::from_json(r#"{ "events": [] }"#).unwrap();
        assert!(ext.has_event_hook());
        assert!(!ext.has_meta_hook());
    }

    #[test]
    fn test_reject_core_names() {
        let json = r#"{ "events": [ { "name": "WORK", "fields": [] } ] }"#;
        assert!(RuleExtension::from_json(json).is_err());
        let json = r#"{ "meta": [ { "name": "roots", "target": "work" } ] }"#;
        assert!(RuleExtension::from_json(json).is_err());
    }

    #[test]
    fn test_reject_unknown_keys() {
        let json = r#"{ "evnts": [] }"#;
        assert!(RuleExtension::from_json(json).is_err());
    }

    #[test]
    fn test_reject_append_without_group() {
        let json = r#"{ "meta": [ { "name": "x", "target": "gc", "append": true } ] }"#;
        assert!(RuleExtension::from_json(json).is_err());
    }

    #[test]
    fn test_event_rule() {
        let mut ext = RuleExtension::from_json(RULES).unwrap();
        let raw = ["3"];
        let ctx = EventContext {
            name: "PLAN_END_OF_GC",
            phase: &Phase::Begin,
            tid: 1,
            ts: 0.0,
            fields: Fields::new(&raw),
        };
        let mut event = TraceEvent::new("PLAN_END_OF_GC", "B", 1, 0.0);
        ext.enrich_event(&ctx, &mut event);
        assert_eq!(event.args["plan_id"], json!(3));
    }

    #[test]
    fn test_meta_rule_append() {
        let mut ext = RuleExtension::from_json(RULES).unwrap();
        let mut work = TraceEvent::new("WORK", "B", 1, 0.0);
        for raw in [["64", "0"], ["8192", "1"]] {
            let ctx = MetaContext {
                name: "alloc_slow",
                tid: 1,
                ts: 0.5,
                fields: Fields::new(&raw),
            };
            ext.enrich_meta(&ctx, None, Some(&mut work));
        }
        assert_eq!(
            work.args["alloc_slow"],
            json!([{"bytes": 64, "large": false}, {"bytes": 8192, "large": true}])
        );
    }

    #[test]
    fn test_meta_rule_missing_target() {
        let mut ext = RuleExtension::from_json(RULES).unwrap();
        let mut work = TraceEvent::new("WORK", "B", 1, 0.0);
        let raw = ["SemiSpace"];
        let ctx = MetaContext {
            name: "plan_name",
            tid: 1,
            ts: 0.5,
            fields: Fields::new(&raw),
        };
        ext.enrich_meta(&ctx, None, Some(&mut work));
        assert!(work.args.is_empty());

        let mut gc = TraceEvent::new("GC", "B", 0, 0.0);
        ext.enrich_meta(&ctx, Some(&mut gc), Some(&mut work));
        assert_eq!(gc.args["plan"], json!("SemiSpace"));
        assert!(work.args.is_empty());
    }
}
