//! Postfix graph dump.
//!
//! Inputs are written before the stage that consumes them, one stage per
//! line: `uri key=value ...`. A stage tagged with `serialise_as` is written
//! under that name without its inputs; an empty tag hides the stage and keeps
//! its inputs.

use std::fmt::Write;

use crate::entities::{Source, SourceRef};

/// Dump lines of `graph`, leaves first
pub fn dump_lines(graph: &SourceRef) -> Vec<String> {
    let mut lines = Vec::new();
    walk(graph.as_ref(), &mut lines);
    lines
}

/// Dump of `graph` as one string
pub fn dump(graph: &SourceRef) -> String {
    dump_lines(graph).join("\n")
}

fn walk(node: &dyn Source, lines: &mut Vec<String>) {
    match node.serialise_as() {
        Some("") => walk_inputs(node, lines),
        Some(tag) => lines.push(tag.to_string()),
        None => {
            walk_inputs(node, lines);
            lines.push(describe(node));
        }
    }
}

fn walk_inputs(node: &dyn Source, lines: &mut Vec<String>) {
    for input in (0..node.slot_count()).filter_map(|slot| node.input(slot)) {
        walk(input.as_ref(), lines);
    }
}

fn describe(node: &dyn Source) -> String {
    let mut line = node.uri().to_string();
    for key in node.option_keys() {
        if let Some(value) = node.option(key) {
            let _ = write!(line, " {}={}", key, value);
        }
    }
    line
}
