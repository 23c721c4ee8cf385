//! The graph itself: process-wide state (§3) and the algorithms that move
//! across node kinds — tracking, the evaluation-context prepare/cleanup
//! dance (§4.5), notification, and the batch scheduler (§4.6).
//!
//! Everything here is `!Send`/`!Sync` by construction (a bare `RefCell`,
//! no `Mutex`): the engine is single-threaded by design, and wrapping it
//! in a lock would advertise a guarantee it doesn't provide.

use std::cell::RefCell;
use std::rc::Rc;

use slotmap::SlotMap;

use crate::edge::{self, Edge};
use crate::error::{EngineError, Result};
use crate::node::{
    DerivedId, DerivedNode, Downstream, EdgeId, EffectId, EffectNode, SourceId, SourceNode,
    Upstream,
};

/// Heuristic cycle guard for the batch drain loop and for source writes
/// made mid-drain — not a correctness bound, a tunable. See DESIGN.md.
pub const CYCLE_GUARD_ITERATIONS: u32 = 100;

pub(crate) struct Graph {
    pub sources: SlotMap<SourceId, SourceNode>,
    pub deriveds: SlotMap<DerivedId, DerivedNode>,
    pub effects: SlotMap<EffectId, EffectNode>,
    pub edges: SlotMap<EdgeId, Edge>,
    /// The node currently running its formula, if any.
    pub eval_context: Option<Downstream>,
    /// Head of the pending-effect queue (LIFO, via `EffectNode::pending_next`).
    pub batched_effect: Option<EffectId>,
    pub batch_depth: u32,
    pub batch_iteration: u32,
    pub global_version: u64,
}

impl Graph {
    pub fn new() -> Self {
        Graph {
            sources: SlotMap::with_key(),
            deriveds: SlotMap::with_key(),
            effects: SlotMap::with_key(),
            edges: SlotMap::with_key(),
            eval_context: None,
            batched_effect: None,
            batch_depth: 0,
            batch_iteration: 0,
            global_version: 0,
        }
    }
}

pub(crate) fn upstream_version(graph: &Graph, node: Upstream) -> u64 {
    match node {
        Upstream::Source(id) => graph.sources[id].version,
        Upstream::Derived(id) => graph.deriveds[id].version,
    }
}

fn downstream_flags_should_subscribe(graph: &Graph, node: Downstream) -> bool {
    match node {
        Downstream::Derived(id) => graph.deriveds[id].flags.should_subscribe,
        Downstream::Effect(id) => graph.effects[id].flags.should_subscribe,
    }
}

/// §4.5: record or refresh the dependency edge from `evaluator` to
/// `source`, handling the three cases named in the design (new edge,
/// reused-but-unmarked edge, already-used-this-evaluation edge).
pub(crate) fn track(graph: &mut Graph, evaluator: Downstream, source: Upstream) -> EdgeId {
    if let Some(eid) = edge::active_edge(graph, source) {
        if graph.edges[eid].target == evaluator {
            if graph.edges[eid].used {
                // Already read this source during this evaluation: free.
                graph.edges[eid].version = upstream_version(graph, source);
                return eid;
            }
            graph.edges[eid].used = true;
            edge::reorder_to_head(graph, eid);
            graph.edges[eid].version = upstream_version(graph, source);
            return eid;
        }
    }

    let eid = graph.edges.insert(Edge {
        source,
        target: evaluator,
        version: upstream_version(graph, source),
        used: true,
        dep_prev: None,
        dep_next: None,
        src_prev: None,
        src_next: None,
        rollback: None,
    });
    edge::push_sources_head(graph, evaluator, eid);

    let prev_occupant = edge::active_edge(graph, source);
    graph.edges[eid].rollback = prev_occupant;
    edge::set_active_edge(graph, source, Some(eid));

    if downstream_flags_should_subscribe(graph, evaluator) {
        subscribe_edge(graph, eid);
    }

    #[cfg(feature = "tracing")]
    tracing::trace!(edge = ?eid, "new dependency edge allocated");
    eid
}

/// §4.5 prepare: redirect every existing source's active-edge slot to this
/// evaluator's own edge (saving whatever was there into `rollback`), and
/// reset the `used` scratch flag so the upcoming formula run can tell
/// which edges it actually touched.
pub(crate) fn prepare(graph: &mut Graph, node: Downstream) {
    let mut cur = edge::sources_head(graph, node);
    while let Some(eid) = cur {
        let (source, next) = {
            let e = &mut graph.edges[eid];
            e.used = false;
            (e.source, e.src_next)
        };
        let prev_occupant = edge::active_edge(graph, source);
        graph.edges[eid].rollback = prev_occupant;
        edge::set_active_edge(graph, source, Some(eid));
        cur = next;
    }
}

/// §4.5 cleanup: walk the sources list, keep only the edges actually
/// touched this evaluation (dropping and unsubscribing the rest), and
/// restore every source's active-edge slot from `rollback`.
pub(crate) fn cleanup(graph: &mut Graph, node: Downstream) {
    let mut cur = edge::sources_head(graph, node);
    let mut new_head: Option<EdgeId> = None;
    let mut tail: Option<EdgeId> = None;

    while let Some(eid) = cur {
        let (source, next, used, rollback) = {
            let e = &graph.edges[eid];
            (e.source, e.src_next, e.used, e.rollback)
        };
        edge::set_active_edge(graph, source, rollback);

        if used {
            graph.edges[eid].src_prev = tail;
            graph.edges[eid].src_next = None;
            match tail {
                Some(t) => graph.edges[t].src_next = Some(eid),
                None => new_head = Some(eid),
            }
            tail = Some(eid);
        } else {
            unsubscribe_edge(graph, eid);
            graph.edges.remove(eid);
            #[cfg(feature = "tracing")]
            tracing::trace!(edge = ?eid, "dropped unused dependency edge");
        }
        cur = next;
    }
    edge::set_sources_head(graph, node, new_head);
}

/// Notification is a pre-order depth-first walk, idempotent via the
/// `notified` flag. It only marks; it never recomputes anything.
pub(crate) fn notify(graph: &mut Graph, target: Downstream) {
    match target {
        Downstream::Derived(id) => {
            if graph.deriveds[id].flags.notified {
                return;
            }
            let was_subscribed = graph.deriveds[id].dependents_head.is_some();
            graph.deriveds[id].flags.notified = true;
            graph.deriveds[id].flags.stale = true;
            #[cfg(feature = "tracing")]
            tracing::trace!(derived = ?id, subscribed = was_subscribed, "derived notified");
            let mut cur = graph.deriveds[id].dependents_head;
            while let Some(eid) = cur {
                let (t, next) = {
                    let e = &graph.edges[eid];
                    (e.target, e.dep_next)
                };
                notify(graph, t);
                cur = next;
            }
        }
        Downstream::Effect(id) => {
            if graph.effects[id].disposed || graph.effects[id].flags.notified {
                return;
            }
            graph.effects[id].flags.notified = true;
            let old_head = graph.batched_effect;
            graph.effects[id].pending_next = old_head;
            graph.batched_effect = Some(id);
            #[cfg(feature = "tracing")]
            tracing::trace!(effect = ?id, "effect enqueued for batch drain");
        }
    }
}

/// Subscribe an edge, then — if its source is a derived — check whether
/// that derived just gained its first dependent and, if so, cascade the
/// lazy-upward-subscription transition from §4.3 one level further up.
pub(crate) fn subscribe_edge(graph: &mut Graph, eid: EdgeId) {
    let source = graph.edges[eid].source;
    edge::subscribe(graph, eid);
    if let Upstream::Derived(did) = source {
        propagate_subscription_gain(graph, did);
    }
}

/// Mirror of [`subscribe_edge`] for the losing-a-dependent direction.
pub(crate) fn unsubscribe_edge(graph: &mut Graph, eid: EdgeId) {
    let source = graph.edges[eid].source;
    edge::unsubscribe(graph, eid);
    if let Upstream::Derived(did) = source {
        propagate_subscription_loss(graph, did);
    }
}

fn propagate_subscription_gain(graph: &mut Graph, did: DerivedId) {
    if graph.deriveds[did].flags.should_subscribe {
        return;
    }
    graph.deriveds[did].flags.should_subscribe = true;
    graph.deriveds[did].flags.stale = true;
    #[cfg(feature = "tracing")]
    tracing::debug!(derived = ?did, "derived gained a subscriber, subscribing upward");
    let mut cur = graph.deriveds[did].sources_head;
    while let Some(eid) = cur {
        let next = graph.edges[eid].src_next;
        subscribe_edge(graph, eid);
        cur = next;
    }
}

fn propagate_subscription_loss(graph: &mut Graph, did: DerivedId) {
    if !graph.deriveds[did].flags.should_subscribe || graph.deriveds[did].dependents_head.is_some()
    {
        return;
    }
    graph.deriveds[did].flags.should_subscribe = false;
    #[cfg(feature = "tracing")]
    tracing::debug!(derived = ?did, "derived lost its last subscriber, unsubscribing upward");
    let mut cur = graph.deriveds[did].sources_head;
    while let Some(eid) = cur {
        let next = graph.edges[eid].src_next;
        unsubscribe_edge(graph, eid);
        cur = next;
    }
}

/// Batch bookkeeping (`enter_batch`/`exit_batch`/`drain`) and the one-level
/// derived short-circuit peek (`peek_upstream_for_version_check`) take the
/// shared `Rc<RefCell<Graph>>` rather than a bare `&mut Graph`: all four can
/// end up calling into a user-written formula (an effect body, or a nested
/// derived's formula), and a formula is free to call back into `Source`/
/// `Derived` handle methods that re-borrow the same `RefCell`. Holding a
/// `RefMut` across that reentry would deadlock/panic, so every borrow here
/// is taken, used, and dropped before control passes to user code.
pub(crate) fn enter_batch(graph: &Rc<RefCell<Graph>>) {
    graph.borrow_mut().batch_depth += 1;
}

/// Exits one level of batch nesting. Draining happens only at the
/// outermost exit; while draining, `batch_depth` is pinned at 1 so that an
/// effect's own open/close-a-batch bracket (and any writes its callback
/// makes) never sees depth reach zero and re-enter `drain` recursively —
/// the drain loop's own `while` is what picks up newly queued effects.
pub(crate) fn exit_batch(graph: &Rc<RefCell<Graph>>) -> Result<()> {
    {
        let mut g = graph.borrow_mut();
        if g.batch_depth == 0 {
            return Ok(());
        }
        g.batch_depth -= 1;
        if g.batch_depth != 0 {
            return Ok(());
        }
        g.batch_depth = 1;
    }
    let result = drain(graph);
    graph.borrow_mut().batch_depth = 0;
    result
}

fn drain(graph: &Rc<RefCell<Graph>>) -> Result<()> {
    let mut first_error: Option<EngineError> = None;
    loop {
        let mut head = graph.borrow_mut().batched_effect.take();
        if head.is_none() {
            break;
        }
        {
            let mut g = graph.borrow_mut();
            g.batch_iteration += 1;
            if g.batch_iteration > CYCLE_GUARD_ITERATIONS {
                g.batch_iteration = 0;
                return Err(EngineError::CycleDetected);
            }
            #[cfg(feature = "tracing")]
            tracing::debug!(iteration = g.batch_iteration, "batch drain pass starting");
        }

        while let Some(eid) = head {
            head = {
                let mut g = graph.borrow_mut();
                let next = g.effects[eid].pending_next;
                g.effects[eid].pending_next = None;
                g.effects[eid].flags.notified = false;
                next
            };
            if let Err(e) = crate::effect::run_effect(graph, eid) {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }
    graph.borrow_mut().batch_iteration = 0;
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Internal helper shared by the derived recomputation's source-version
/// short-circuit scan (§4.3 step 5): bring a transitively-derived upstream
/// up to date, swallowing any formula error it raises. This is the one
/// controlled error swallow in the whole engine — it exists so that a
/// dependency that *will* throw still advances its version, letting the
/// outer formula observe and handle the failure itself.
pub(crate) fn peek_upstream_for_version_check(graph: &Rc<RefCell<Graph>>, source: Upstream) {
    if let Upstream::Derived(did) = source {
        let _ = crate::derived::recompute(graph, did);
    }
}
