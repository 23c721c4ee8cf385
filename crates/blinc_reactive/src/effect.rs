//! Effects: §4.4. The only node kind with a side effect; the thing the
//! batch scheduler actually drains.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::Result;
use crate::graph::{self, Graph};
use crate::node::{Downstream, EffectId, EffectNode, Flags};

/// A handle used only to tear an effect down early. Dropping it does
/// nothing by itself — call [`Disposer::dispose`] explicitly, matching the
/// teacher's preference for explicit lifecycle over drop-glue.
pub struct Disposer {
    id: EffectId,
    graph: Rc<RefCell<Graph>>,
}

impl Disposer {
    /// Unsubscribes the effect from every source it reads and marks it
    /// inert: already-queued runs for it are skipped by the drain loop,
    /// and it can never be enqueued again.
    pub fn dispose(&self) {
        let mut g = self.graph.borrow_mut();
        dispose_effect(&mut g, self.id);
    }
}

pub(crate) fn dispose_effect(graph: &mut Graph, id: EffectId) {
    if graph.effects[id].disposed {
        return;
    }
    graph.effects[id].disposed = true;
    let mut cur = graph.effects[id].sources_head.take();
    while let Some(eid) = cur {
        let next = graph.edges[eid].src_next;
        graph::unsubscribe_edge(graph, eid);
        graph.edges.remove(eid);
        cur = next;
    }
    #[cfg(feature = "tracing")]
    tracing::debug!(effect = ?id, "effect disposed");
}

/// Construct and immediately run an effect once, establishing its initial
/// dependency set. Always runs inside its own batch bracket, so a write
/// made by the very first run is itself coalesced like any other.
pub(crate) fn make_effect(
    graph: Rc<RefCell<Graph>>,
    formula: impl FnMut() -> std::result::Result<(), crate::error::EngineError> + 'static,
) -> Result<Disposer> {
    let id = {
        let mut g = graph.borrow_mut();
        g.effects.insert(EffectNode {
            formula: Some(Box::new(formula)),
            sources_head: None,
            flags: Flags {
                should_subscribe: true,
                ..Flags::default()
            },
            pending_next: None,
            disposed: false,
        })
    };

    let result = run_effect(&graph, id);
    result.map(|()| Disposer { id, graph })
}

/// Run an effect's formula once, subscribing it to whatever it reads this
/// time. Brackets the run in its own batch level so that writes made from
/// inside the effect body are coalesced rather than draining synchronously
/// mid-drain — see the pinning trick documented on `graph::exit_batch`.
///
/// Takes the shared `Rc<RefCell<Graph>>`, not `&mut Graph`: the formula is
/// user code that may call back into `Source`/`Derived` handles on the
/// same graph, so no borrow here is held across the `formula()` call.
pub(crate) fn run_effect(graph: &Rc<RefCell<Graph>>, id: EffectId) -> Result<()> {
    {
        let g = graph.borrow();
        if g.effects[id].disposed {
            // A disposed effect can still be sitting in the drain queue
            // (it was notified before it was disposed) — harmless no-op.
            return Ok(());
        }
        if g.effects[id].flags.running {
            return Err(crate::error::EngineError::CycleDetected);
        }
    }

    graph::enter_batch(graph);

    let (prev_ctx, mut formula) = {
        let mut g = graph.borrow_mut();
        g.effects[id].flags.running = true;
        let prev_ctx = g.eval_context.replace(Downstream::Effect(id));
        graph::prepare(&mut g, Downstream::Effect(id));
        let formula = g.effects[id]
            .formula
            .take()
            .expect("effect formula missing — reentered run_effect for the same node?");
        (prev_ctx, formula)
    };
    #[cfg(feature = "tracing")]
    tracing::trace!(effect = ?id, "running effect");
    let outcome = formula();

    {
        let mut g = graph.borrow_mut();
        g.effects[id].formula = Some(formula);
        graph::cleanup(&mut g, Downstream::Effect(id));
        g.eval_context = prev_ctx;
        g.effects[id].flags.running = false;
    }

    graph::exit_batch(graph)?;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::Engine;

    #[test]
    fn effect_runs_immediately_then_on_every_source_change() {
        let engine = Engine::new();
        let a = engine.source(1i32);
        let log = Rc::new(RefCell::new(Vec::new()));
        let log_clone = log.clone();
        let a_clone = a.clone();
        let _d = engine
            .effect(move || {
                log_clone.borrow_mut().push(a_clone.read());
                Ok(())
            })
            .unwrap();
        assert_eq!(*log.borrow(), vec![1]);

        a.write(2).unwrap();
        assert_eq!(*log.borrow(), vec![1, 2]);
    }

    #[test]
    fn disposed_effect_does_not_run_again() {
        let engine = Engine::new();
        let a = engine.source(1i32);
        let runs = Rc::new(RefCell::new(0));
        let runs_clone = runs.clone();
        let a_clone = a.clone();
        let disposer = engine
            .effect(move || {
                a_clone.read();
                *runs_clone.borrow_mut() += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(*runs.borrow(), 1);

        disposer.dispose();
        a.write(2).unwrap();
        assert_eq!(*runs.borrow(), 1, "disposed effect must not re-run");
    }

    #[test]
    fn batch_coalesces_multiple_writes_into_one_effect_run() {
        let engine = Engine::new();
        let a = engine.source(1i32);
        let b = engine.source(10i32);
        let runs = Rc::new(RefCell::new(0));
        let runs_clone = runs.clone();
        let a_clone = a.clone();
        let b_clone = b.clone();
        let _d = engine
            .effect(move || {
                let _ = (a_clone.read(), b_clone.read());
                *runs_clone.borrow_mut() += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(*runs.borrow(), 1);

        engine
            .batch(|| {
                a.write(2).unwrap();
                b.write(20).unwrap();
            })
            .unwrap();
        assert_eq!(*runs.borrow(), 2, "both writes inside one batch trigger one run");
    }

    #[test]
    fn write_loop_past_guard_is_a_cycle() {
        let engine = Engine::new();
        let armed = engine.source(false);
        let a = engine.source(0i32);
        let (armed_for_effect, a_for_effect) = (armed.clone(), a.clone());
        // Stable while `armed` is false, so constructing the effect itself
        // converges in one run. Flipping `armed` on afterwards makes every
        // run write a strictly larger value with no stopping condition,
        // which must trip the iteration guard rather than loop forever.
        let _d = engine
            .effect(move || {
                if armed_for_effect.read() {
                    let v = a_for_effect.read();
                    a_for_effect.write(v + 1)?;
                }
                Ok(())
            })
            .unwrap();

        let result = armed.write(true);
        assert!(result.is_err(), "runaway effect write loop must be caught");
        assert!(matches!(result, Err(EngineError::CycleDetected)));
    }

    #[test]
    fn batch_drains_effects_in_lifo_order_of_notification() {
        // §5: "within one batch drain pass, effects fire in LIFO order
        // relative to how they were marked (most-recently-notified
        // first)" — `notify` pushes onto the front of `batched_effect`
        // (graph.rs) and `drain` pops from that same front, so the last
        // effect marked during the batch must be the first to run.
        let engine = Engine::new();
        let a = engine.source(1i32);
        let b = engine.source(2i32);
        let c = engine.source(3i32);
        let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

        let (a1, order1) = (a.clone(), order.clone());
        let _da = engine
            .effect(move || {
                a1.read();
                order1.borrow_mut().push("a");
                Ok(())
            })
            .unwrap();
        let (b1, order2) = (b.clone(), order.clone());
        let _db = engine
            .effect(move || {
                b1.read();
                order2.borrow_mut().push("b");
                Ok(())
            })
            .unwrap();
        let (c1, order3) = (c.clone(), order.clone());
        let _dc = engine
            .effect(move || {
                c1.read();
                order3.borrow_mut().push("c");
                Ok(())
            })
            .unwrap();
        order.borrow_mut().clear(); // drop the three initial-construction runs

        // Writes (and so markings) happen in source order a, b, c.
        engine
            .batch(|| {
                a.write(10).unwrap();
                b.write(20).unwrap();
                c.write(30).unwrap();
            })
            .unwrap();

        assert_eq!(*order.borrow(), vec!["c", "b", "a"]);
    }
}
