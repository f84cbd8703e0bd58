//! Causal traces recorded while the engine hunts a runaway observer.

use std::fmt::Write as _;
use std::sync::Arc;

use crate::ids::ObjectId;
use crate::value::Value;

/// A value read or written by a traced run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracedValue {
    pub object: ObjectId,
    pub property: Arc<str>,
    pub value: Value,
}

/// One observer run, linked to the run that wrote a value it read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObserverTrace {
    pub object: ObjectId,
    pub observer: Arc<str>,
    /// Number of changing runs of this instance in the current action.
    pub count: u32,
    pub reads: Vec<TracedValue>,
    pub writes: Vec<TracedValue>,
    pub cause: Option<Arc<ObserverTrace>>,
}

impl ObserverTrace {
    /// Runs in the causal chain, this one included.
    pub fn depth(&self) -> usize {
        self.chain().count()
    }

    /// This run followed by its causes, newest first.
    pub fn chain(&self) -> impl Iterator<Item = &ObserverTrace> {
        std::iter::successors(Some(self), |t| t.cause.as_deref())
    }

    /// Human readable chain, at most `limit` runs.
    pub fn render(&self, limit: usize) -> String {
        let mut out = String::new();
        for trace in self.chain().take(limit) {
            let _ = write!(out, "  {}@{} #{}", trace.observer, trace.object, trace.count);
            render_values(&mut out, " read", &trace.reads);
            render_values(&mut out, " wrote", &trace.writes);
            out.push('\n');
        }
        out
    }
}

fn render_values(out: &mut String, label: &str, values: &[TracedValue]) {
    if values.is_empty() {
        return;
    }
    out.push_str(label);
    out.push_str(" {");
    for (i, v) in values.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{}.{}={}", v.object, v.property, v.value);
    }
    out.push('}');
}
