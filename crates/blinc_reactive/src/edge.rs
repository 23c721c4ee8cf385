//! The edge registry: §4.1 of the design — one directed dependency record,
//! threaded into two intrusive doubly-linked lists at once (the source's
//! dependents, and the target's sources). These three functions are the
//! *only* code in the crate allowed to touch the sibling pointers.

use crate::graph::Graph;
use crate::node::{Downstream, EdgeId, Upstream};

pub(crate) struct Edge {
    pub source: Upstream,
    pub target: Downstream,
    /// The source's version at the moment `target` last observed it.
    pub version: u64,
    /// Scratch flag, reset at the start of each re-evaluation and set the
    /// moment this edge is (re-)read during that evaluation.
    pub used: bool,
    pub dep_prev: Option<EdgeId>,
    pub dep_next: Option<EdgeId>,
    pub src_prev: Option<EdgeId>,
    pub src_next: Option<EdgeId>,
    /// Saved occupant of `source`'s active-edge slot, restored on cleanup —
    /// this is what makes nested evaluations (a derived's Peek triggering
    /// another derived's recompute mid-formula) safe.
    pub rollback: Option<EdgeId>,
}

pub(crate) fn dependents_head(graph: &Graph, node: Upstream) -> Option<EdgeId> {
    match node {
        Upstream::Source(id) => graph.sources[id].dependents_head,
        Upstream::Derived(id) => graph.deriveds[id].dependents_head,
    }
}

fn set_dependents_head(graph: &mut Graph, node: Upstream, head: Option<EdgeId>) {
    match node {
        Upstream::Source(id) => graph.sources[id].dependents_head = head,
        Upstream::Derived(id) => graph.deriveds[id].dependents_head = head,
    }
}

pub(crate) fn sources_head(graph: &Graph, node: Downstream) -> Option<EdgeId> {
    match node {
        Downstream::Derived(id) => graph.deriveds[id].sources_head,
        Downstream::Effect(id) => graph.effects[id].sources_head,
    }
}

pub(crate) fn set_sources_head(graph: &mut Graph, node: Downstream, head: Option<EdgeId>) {
    match node {
        Downstream::Derived(id) => graph.deriveds[id].sources_head = head,
        Downstream::Effect(id) => graph.effects[id].sources_head = head,
    }
}

pub(crate) fn active_edge(graph: &Graph, node: Upstream) -> Option<EdgeId> {
    match node {
        Upstream::Source(id) => graph.sources[id].active_edge,
        Upstream::Derived(id) => graph.deriveds[id].active_edge,
    }
}

pub(crate) fn set_active_edge(graph: &mut Graph, node: Upstream, edge: Option<EdgeId>) {
    match node {
        Upstream::Source(id) => graph.sources[id].active_edge = edge,
        Upstream::Derived(id) => graph.deriveds[id].active_edge = edge,
    }
}

/// Link `edge` into the head of its source's dependents list.
pub(crate) fn subscribe(graph: &mut Graph, edge_id: EdgeId) {
    let source = graph.edges[edge_id].source;
    let old_head = dependents_head(graph, source);
    graph.edges[edge_id].dep_prev = None;
    graph.edges[edge_id].dep_next = old_head;
    if let Some(head) = old_head {
        graph.edges[head].dep_prev = Some(edge_id);
    }
    set_dependents_head(graph, source, Some(edge_id));
    #[cfg(feature = "tracing")]
    tracing::trace!(?edge_id, "edge subscribed to source dependents list");
}

/// Splice `edge` out of its source's dependents list. The edge itself is
/// left dangling (sibling pointers cleared); callers decide whether to
/// drop it or re-link it elsewhere.
pub(crate) fn unsubscribe(graph: &mut Graph, edge_id: EdgeId) {
    let (source, prev, next) = {
        let e = &graph.edges[edge_id];
        (e.source, e.dep_prev, e.dep_next)
    };
    match prev {
        Some(p) => graph.edges[p].dep_next = next,
        None => set_dependents_head(graph, source, next),
    }
    if let Some(n) = next {
        graph.edges[n].dep_prev = prev;
    }
    let e = &mut graph.edges[edge_id];
    e.dep_prev = None;
    e.dep_next = None;
    #[cfg(feature = "tracing")]
    tracing::trace!(?edge_id, "edge unsubscribed from source dependents list");
}

/// Move `edge` to the head of its target's sources list — an O(1) splice
/// used every time a previously-tracked dependency is read again this
/// evaluation, so the list stays ordered by recency of use.
pub(crate) fn reorder_to_head(graph: &mut Graph, edge_id: EdgeId) {
    let target = graph.edges[edge_id].target;
    let (prev, next) = {
        let e = &graph.edges[edge_id];
        (e.src_prev, e.src_next)
    };
    match prev {
        Some(p) => graph.edges[p].src_next = next,
        None => set_sources_head(graph, target, next),
    }
    if let Some(n) = next {
        graph.edges[n].src_prev = prev;
    }
    push_sources_head(graph, target, edge_id);
}

/// Push a (freshly allocated or just-spliced-out) edge onto the head of a
/// target's sources list.
pub(crate) fn push_sources_head(graph: &mut Graph, target: Downstream, edge_id: EdgeId) {
    let old_head = sources_head(graph, target);
    graph.edges[edge_id].src_prev = None;
    graph.edges[edge_id].src_next = old_head;
    if let Some(head) = old_head {
        graph.edges[head].src_prev = Some(edge_id);
    }
    set_sources_head(graph, target, Some(edge_id));
    #[cfg(feature = "tracing")]
    tracing::trace!(?edge_id, "edge pushed to head of sources list");
}
