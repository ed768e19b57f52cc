//! Graph rewiring passes.
//!
//! A connected graph is a description: the passes here never mutate it. They
//! walk it depth first and return a new graph in which the nodes picked by a
//! replacement callback are swapped out. Every node above a replaced node is
//! rebuilt with `Source::duplicate`; untouched subtrees are shared as is.
//!
//! - [`rewire`] - generic replacement (Fork and Voodoo swap Nudgers)
//! - [`wrap_terminals`] - Scheduler template: every terminal behind a Lock
//! - [`clone_graph`] - one worker copy of a template, Locks shared

use log::trace;
use std::sync::Arc;

use super::lock::Lock;
use crate::entities::{Source, SourceKind, SourceRef, inputs_of, same_source};
use crate::error::GraphResult;

/// How far the walk descends into nested fan-out stages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Descend {
    /// Fork and Voodoo are only descended through slot 0
    FanOutFirstSlot,
    /// Every slot of every stage
    All,
}

impl Descend {
    fn slots(&self, node: &dyn Source) -> usize {
        match self {
            Descend::FanOutFirstSlot if node.kind().is_fan_out() => node.slot_count().min(1),
            _ => node.slot_count(),
        }
    }
}

/// Replacement callback: `Some(new)` swaps the node, `None` descends into it
pub type Replace<'a> = dyn FnMut(&SourceRef) -> GraphResult<Option<SourceRef>> + 'a;

/// New graph with the nodes chosen by `replace` swapped out
pub fn rewire(graph: &SourceRef, descend: Descend, replace: &mut Replace<'_>) -> GraphResult<SourceRef> {
    if let Some(replacement) = replace(graph)? {
        trace!("rewire: {} replaced by {}", graph.uri(), replacement.uri());
        return Ok(replacement);
    }

    let mut inputs = inputs_of(graph.as_ref());
    let mut changed = false;
    for slot in 0..descend.slots(graph.as_ref()) {
        if let Some(input) = inputs[slot].take() {
            let rewired = rewire(&input, descend, replace)?;
            changed |= !same_source(&input, &rewired);
            inputs[slot] = Some(rewired);
        }
    }

    if changed { graph.duplicate(inputs) } else { Ok(Arc::clone(graph)) }
}

/// Every reachable node of `kind`
pub fn find_all(graph: &SourceRef, kind: SourceKind) -> Vec<SourceRef> {
    let mut found = Vec::new();
    collect(graph, &mut |node| node.kind() == kind, true, &mut found);
    found
}

/// Nodes of `kind` nearest to `graph`; the walk stops at each match
pub fn find_nearest(graph: &SourceRef, kind: SourceKind) -> Vec<SourceRef> {
    let mut found = Vec::new();
    collect(graph, &mut |node| node.kind() == kind, false, &mut found);
    found
}

fn collect(graph: &SourceRef, matches: &mut dyn FnMut(&dyn Source) -> bool, through: bool, found: &mut Vec<SourceRef>) {
    if matches(graph.as_ref()) {
        if !found.iter().any(|f| same_source(f, graph)) {
            found.push(Arc::clone(graph));
        }
        if !through {
            return;
        }
    }
    for input in inputs_of(graph.as_ref()).into_iter().flatten() {
        collect(&input, matches, through, found);
    }
}

fn is_terminal(node: &dyn Source) -> bool {
    node.slot_count() == 0 || matches!(node.kind(), SourceKind::Fork | SourceKind::Voodoo | SourceKind::Scheduler)
}

/// Scheduler template: terminals wrapped in a shared Lock, the rest duplicated
///
/// Existing Locks are kept; everything below them is already serialised.
pub fn wrap_terminals(graph: &SourceRef) -> GraphResult<SourceRef> {
    if graph.kind() == SourceKind::Lock {
        return Ok(Arc::clone(graph));
    }
    if is_terminal(graph.as_ref()) {
        trace!("wrap_terminals: lock around {}", graph.uri());
        let lock = Lock::new().with_serialise_as("");
        lock.connect(Arc::clone(graph), 0)?;
        return Ok(Arc::new(lock));
    }
    let inputs = inputs_of(graph.as_ref())
        .into_iter()
        .map(|input| input.map(|i| wrap_terminals(&i)).transpose())
        .collect::<GraphResult<Vec<_>>>()?;
    graph.duplicate(inputs)
}

/// Worker copy of a template: Locks shared, every other stage duplicated
pub fn clone_graph(template: &SourceRef) -> GraphResult<SourceRef> {
    if template.kind() == SourceKind::Lock {
        return Ok(Arc::clone(template));
    }
    let inputs = inputs_of(template.as_ref())
        .into_iter()
        .map(|input| input.map(|i| clone_graph(&i)).transpose())
        .collect::<GraphResult<Vec<_>>>()?;
    template.duplicate(inputs)
}
