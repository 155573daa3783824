//! Late-binding table of work packet type names.
//!
//! The capture script only prints a `@type_name` line the first time it sees a
//! type id, and that line can land after the first `WORK` record referencing
//! it, so names are collected during the parse pass and resolved at the end.

use std::collections::HashMap;

/// Label stored when the probe could not read the symbol string.
pub const UNKNOWN_TYPE: &str = "(unknown)";

#[derive(Debug, Default, Clone)]
pub struct SymbolTable {
    names: HashMap<u64, String>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a type name. Redeclarations overwrite, last one wins.
    pub fn record(&mut self, id: u64, name: &str) {
        let name = if name.is_empty() {
            // bpftrace's `str()` sometimes reads nothing.
            UNKNOWN_TYPE
        } else {
            name
        };
        self.names.insert(id, name.to_string());
    }

    /// Resolve a type id, synthesizing `(unknown:<id>)` when the name is
    /// missing or unreadable.
    pub fn resolve(&self, id: u64) -> String {
        match self.names.get(&id) {
            Some(name) if name != UNKNOWN_TYPE => name.clone(),
            _ => format!("(unknown:{id})"),
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
