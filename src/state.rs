//! State nodes and transition selection.
//!
//! A node owns a lazily rebuilt, priority-sorted view of its outgoing
//! edges and answers the three selection queries: by message, by tick
//! window, and by the default transition precomputed on entry. Edges
//! themselves live in the engine's arena; the node holds ids only.

use crate::host::Host;
use crate::id::Id;
use crate::transition::{priority_cmp, TransitionEdge};
use rand::Rng;
use std::collections::HashMap;

/// Default transition precomputed when a node becomes current: the
/// unconditioned delay-only edge with the smallest derived delay.
#[derive(Debug, Clone, Copy, PartialEq)]
struct DefaultTransition {
    edge: Id,
    delay: f64,
}

/// A named mode the subject can be in.
#[derive(Debug, Clone)]
pub struct StateNode {
    id: Id,
    name: String,
    enter_action: Option<String>,
    update_action: Option<String>,
    leave_action: Option<String>,
    /// Editor-only placement metadata, carried through snapshots.
    position: Option<(f64, f64)>,
    sorted_out: Vec<Id>,
    edges_dirty: bool,
    default_transition: Option<DefaultTransition>,
}

impl StateNode {
    pub(crate) fn new(id: Id, name: String) -> Self {
        Self {
            id,
            name,
            enter_action: None,
            update_action: None,
            leave_action: None,
            position: None,
            sorted_out: Vec::new(),
            edges_dirty: true,
            default_transition: None,
        }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn enter_action(&self) -> Option<&str> {
        self.enter_action.as_deref()
    }

    pub fn update_action(&self) -> Option<&str> {
        self.update_action.as_deref()
    }

    pub fn leave_action(&self) -> Option<&str> {
        self.leave_action.as_deref()
    }

    pub fn position(&self) -> Option<(f64, f64)> {
        self.position
    }

    /// The precomputed default transition and its derived delay, if the
    /// node has been entered and an unconditioned delay edge exists.
    pub fn default_transition(&self) -> Option<(Id, f64)> {
        self.default_transition.map(|d| (d.edge, d.delay))
    }

    pub(crate) fn set_name(&mut self, name: String) {
        self.name = name;
    }

    pub(crate) fn set_enter_action(&mut self, action: Option<String>) {
        self.enter_action = action;
    }

    pub(crate) fn set_update_action(&mut self, action: Option<String>) {
        self.update_action = action;
    }

    pub(crate) fn set_leave_action(&mut self, action: Option<String>) {
        self.leave_action = action;
    }

    pub(crate) fn set_position(&mut self, position: Option<(f64, f64)>) {
        self.position = position;
    }

    /// Marks the sorted outgoing-edge cache stale. Called by the engine
    /// whenever an edge touching this node as source is added, removed,
    /// or has an ordering-relevant attribute changed.
    pub(crate) fn invalidate_edges(&mut self) {
        self.edges_dirty = true;
    }

    fn rebuild_edges(&mut self, edges: &HashMap<Id, TransitionEdge>) {
        if !self.edges_dirty {
            return;
        }
        let mut out: Vec<&TransitionEdge> =
            edges.values().filter(|e| e.source() == self.id).collect();
        out.sort_by(|a, b| priority_cmp(a, b));
        self.sorted_out = out.into_iter().map(|e| e.id()).collect();
        self.edges_dirty = false;
    }

    /// Outgoing edges in evaluation-priority order, rebuilding the cache
    /// if stale.
    pub(crate) fn sorted_edges(&mut self, edges: &HashMap<Id, TransitionEdge>) -> &[Id] {
        self.rebuild_edges(edges);
        &self.sorted_out
    }

    /// Selects the first eligible edge for a message at the given state
    /// time, or none.
    pub(crate) fn next_for_message(
        &mut self,
        message: &str,
        state_time: f64,
        edges: &HashMap<Id, TransitionEdge>,
        host: &mut dyn Host,
    ) -> Option<Id> {
        self.rebuild_edges(edges);
        for id in &self.sorted_out {
            let edge = match edges.get(id) {
                Some(e) => e,
                None => continue,
            };
            // Self-loop edges are deliberately unhandled.
            if edge.target() == self.id {
                continue;
            }
            if edge.message() != Some(message) {
                continue;
            }
            if !edge.contains_time(state_time) {
                continue;
            }
            if let Some(cond) = edge.condition() {
                if !eval_condition(cond, *id, host) {
                    continue;
                }
            }
            return Some(*id);
        }
        None
    }

    /// Precomputes the default transition. Called once whenever this node
    /// becomes current.
    ///
    /// Scans the sorted edges for unconditioned ones that carry delay
    /// information and derives a concrete delay for each: `min` exactly
    /// when `min >= max`, otherwise a uniform draw within `[min, max]`.
    /// The candidate with the smallest derived delay wins; ties keep the
    /// earlier edge, which is already the higher-priority one.
    pub(crate) fn entered<R: Rng>(
        &mut self,
        edges: &HashMap<Id, TransitionEdge>,
        rng: &mut R,
    ) {
        self.rebuild_edges(edges);
        let mut best: Option<DefaultTransition> = None;
        for id in &self.sorted_out {
            let edge = match edges.get(id) {
                Some(e) => e,
                None => continue,
            };
            if edge.target() == self.id {
                continue;
            }
            if !edge.is_delay_only() {
                continue;
            }
            let (min, max) = edge.effective_delay_range();
            let delay = if min >= max {
                min
            } else {
                rng.gen_range(min..=max)
            };
            match best {
                Some(b) if b.delay <= delay => {}
                _ => best = Some(DefaultTransition { edge: *id, delay }),
            }
        }
        self.default_transition = best;
    }

    /// Selects the transition firing inside the half-open tick window
    /// `[prev, next)`, or none.
    ///
    /// First pass checks condition-gated, message-free edges whose delay
    /// window overlaps the tick window; message edges fire through
    /// [`next_for_message`](Self::next_for_message) and unconditioned
    /// edges through the precomputed default, which is the fallback here
    /// once `next` reaches its derived delay.
    pub(crate) fn next_in_window(
        &mut self,
        prev: f64,
        next: f64,
        edges: &HashMap<Id, TransitionEdge>,
        host: &mut dyn Host,
    ) -> Option<Id> {
        self.rebuild_edges(edges);
        for id in &self.sorted_out {
            let edge = match edges.get(id) {
                Some(e) => e,
                None => continue,
            };
            if edge.target() == self.id {
                continue;
            }
            let cond = match edge.condition() {
                Some(c) => c,
                None => continue,
            };
            if edge.message().is_some() {
                continue;
            }
            if !edge.overlaps_window(prev, next) {
                continue;
            }
            if eval_condition(cond, *id, host) {
                return Some(*id);
            }
        }

        let default = self.default_transition?;
        if edges.contains_key(&default.edge) && next >= default.delay {
            Some(default.edge)
        } else {
            None
        }
    }
}

/// Evaluates a condition through the host; a host failure is logged and
/// treated as "not eligible", never propagated.
fn eval_condition(name: &str, edge: Id, host: &mut dyn Host) -> bool {
    match host.eval_condition(name) {
        Ok(v) => v,
        Err(err) => {
            tracing::warn!(
                transition = %edge,
                condition = name,
                %err,
                "condition callback failed, treating transition as not eligible"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{NullHost, ScriptedHost};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn node() -> StateNode {
        StateNode::new(Id(0), "test".to_string())
    }

    fn edge_map(edges: Vec<TransitionEdge>) -> HashMap<Id, TransitionEdge> {
        edges.into_iter().map(|e| (e.id(), e)).collect()
    }

    fn edge(id: u64, source: u64, target: u64) -> TransitionEdge {
        TransitionEdge::new(Id(id), Id(source), Id(target))
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn test_sorted_edges_priority_grid() {
        let mut e1 = edge(1, 0, 10);
        e1.set_min_delay(Some(1.0));
        e1.set_max_delay(Some(2.0));

        let mut e2 = edge(2, 0, 10);
        e2.set_min_delay(Some(1.0));
        e2.set_max_delay(Some(3.0));

        let mut e3 = edge(3, 0, 10);
        e3.set_min_delay(Some(0.0));
        e3.set_condition(Some("c".to_string()));

        let mut e4 = edge(4, 0, 10);
        e4.set_min_delay(Some(0.0));

        let mut e5 = edge(5, 0, 10);
        e5.set_min_delay(Some(0.0));
        e5.set_message(Some("m".to_string()));

        // An edge from another source must not appear in the view.
        let foreign = edge(6, 9, 10);

        let edges = edge_map(vec![e1, e2, e3, e4, e5, foreign]);
        let mut node = node();
        let sorted: Vec<u64> = node
            .sorted_edges(&edges)
            .iter()
            .map(|id| id.as_u64())
            .collect();
        assert_eq!(sorted, vec![3, 5, 4, 1, 2]);
    }

    #[test]
    fn test_cache_rebuild_after_invalidation() {
        let mut a = edge(1, 0, 10);
        a.set_min_delay(Some(5.0));
        let mut b = edge(2, 0, 11);
        b.set_min_delay(Some(1.0));

        let mut edges = edge_map(vec![a, b]);
        let mut node = node();
        assert_eq!(node.sorted_edges(&edges), &[Id(2), Id(1)]);

        // Without invalidation the stale ordering is served.
        edges.get_mut(&Id(2)).unwrap().set_min_delay(Some(9.0));
        assert_eq!(node.sorted_edges(&edges), &[Id(2), Id(1)]);

        node.invalidate_edges();
        assert_eq!(node.sorted_edges(&edges), &[Id(1), Id(2)]);
    }

    #[test]
    fn test_message_selection() {
        let mut go = edge(1, 0, 10);
        go.set_message(Some("go".to_string()));

        let mut stop = edge(2, 0, 11);
        stop.set_message(Some("stop".to_string()));

        let edges = edge_map(vec![go, stop]);
        let mut node = node();
        let mut host = NullHost;

        assert_eq!(node.next_for_message("go", 0.0, &edges, &mut host), Some(Id(1)));
        assert_eq!(node.next_for_message("stop", 0.0, &edges, &mut host), Some(Id(2)));
        assert_eq!(node.next_for_message("jump", 0.0, &edges, &mut host), None);
    }

    #[test]
    fn test_message_selection_respects_delay_window() {
        let mut go = edge(1, 0, 10);
        go.set_message(Some("go".to_string()));
        go.set_min_delay(Some(2.0));
        go.set_max_delay(Some(4.0));

        let edges = edge_map(vec![go]);
        let mut node = node();
        let mut host = NullHost;

        assert_eq!(node.next_for_message("go", 1.0, &edges, &mut host), None);
        assert_eq!(node.next_for_message("go", 3.0, &edges, &mut host), Some(Id(1)));
        assert_eq!(node.next_for_message("go", 5.0, &edges, &mut host), None);
    }

    #[test]
    fn test_message_selection_skips_self_loops() {
        let mut looped = edge(1, 0, 0);
        looped.set_message(Some("go".to_string()));

        let edges = edge_map(vec![looped]);
        let mut node = node();
        assert_eq!(node.next_for_message("go", 0.0, &edges, &mut NullHost), None);
    }

    #[test]
    fn test_message_selection_condition_gate() {
        let mut go = edge(1, 0, 10);
        go.set_message(Some("go".to_string()));
        go.set_condition(Some("armed".to_string()));

        let edges = edge_map(vec![go]);
        let mut node = node();
        let mut host = ScriptedHost::new();

        assert_eq!(node.next_for_message("go", 0.0, &edges, &mut host), None);
        host.set_flag("armed", true);
        assert_eq!(node.next_for_message("go", 0.0, &edges, &mut host), Some(Id(1)));
    }

    #[test]
    fn test_failing_condition_is_not_eligible() {
        let mut gated = edge(1, 0, 10);
        gated.set_condition(Some("broken".to_string()));

        let mut fallback = edge(2, 0, 11);
        fallback.set_condition(Some("ok".to_string()));

        let edges = edge_map(vec![gated, fallback]);
        let mut node = node();
        let mut host = ScriptedHost::new();
        host.fail_on("broken");
        host.set_flag("ok", true);

        // The failing condition is swallowed and the next edge wins.
        assert_eq!(
            node.next_in_window(0.0, 1.0, &edges, &mut host),
            Some(Id(2))
        );
    }

    #[test]
    fn test_entered_picks_smallest_derived_delay() {
        let mut exact = edge(1, 0, 10);
        exact.set_min_delay(Some(2.0));
        exact.set_max_delay(Some(2.0));

        let mut ranged = edge(2, 0, 11);
        ranged.set_min_delay(Some(1.0));
        ranged.set_max_delay(Some(5.0));

        let edges = edge_map(vec![exact, ranged]);
        let mut node = node();
        let mut rng = rng();

        // Fixed edge caps the default at 2 regardless of the draw.
        for _ in 0..200 {
            node.entered(&edges, &mut rng);
            let (_, delay) = node.default_transition().unwrap();
            assert!(delay <= 2.0, "derived delay {} exceeds fixed edge", delay);
        }
    }

    #[test]
    fn test_entered_ignores_conditional_and_bare_edges() {
        let mut gated = edge(1, 0, 10);
        gated.set_min_delay(Some(1.0));
        gated.set_condition(Some("c".to_string()));

        // No delay attributes at all: not a default candidate.
        let bare = edge(2, 0, 11);

        let edges = edge_map(vec![gated, bare]);
        let mut node = node();
        node.entered(&edges, &mut rng());
        assert!(node.default_transition().is_none());
    }

    #[test]
    fn test_window_selection_bounds() {
        let mut gated = edge(1, 0, 10);
        gated.set_min_delay(Some(2.0));
        gated.set_max_delay(Some(4.0));
        gated.set_condition(Some("always".to_string()));

        let edges = edge_map(vec![gated]);
        let mut node = node();
        let mut host = ScriptedHost::new();
        host.set_flag("always", true);

        // Entirely before the range.
        assert_eq!(node.next_in_window(0.0, 1.5, &edges, &mut host), None);
        // Overlapping.
        assert_eq!(
            node.next_in_window(1.5, 2.5, &edges, &mut host),
            Some(Id(1))
        );
        // Entirely after the range.
        assert_eq!(node.next_in_window(4.5, 6.0, &edges, &mut host), None);
    }

    #[test]
    fn test_window_selection_skips_message_edges() {
        let mut msg = edge(1, 0, 10);
        msg.set_message(Some("go".to_string()));
        msg.set_condition(Some("always".to_string()));

        let edges = edge_map(vec![msg]);
        let mut node = node();
        let mut host = ScriptedHost::new();
        host.set_flag("always", true);

        assert_eq!(node.next_in_window(0.0, 10.0, &edges, &mut host), None);
    }

    #[test]
    fn test_window_falls_back_to_default() {
        let mut timed = edge(1, 0, 10);
        timed.set_min_delay(Some(3.0));
        timed.set_max_delay(Some(3.0));

        let edges = edge_map(vec![timed]);
        let mut node = node();
        node.entered(&edges, &mut rng());

        let mut host = NullHost;
        assert_eq!(node.next_in_window(0.0, 2.0, &edges, &mut host), None);
        assert_eq!(node.next_in_window(2.0, 3.5, &edges, &mut host), Some(Id(1)));
    }

    #[test]
    fn test_default_ignored_when_edge_removed() {
        let mut timed = edge(1, 0, 10);
        timed.set_min_delay(Some(1.0));
        timed.set_max_delay(Some(1.0));

        let mut edges = edge_map(vec![timed]);
        let mut node = node();
        node.entered(&edges, &mut rng());
        assert!(node.default_transition().is_some());

        edges.remove(&Id(1));
        node.invalidate_edges();
        assert_eq!(node.next_in_window(0.0, 5.0, &edges, &mut NullHost), None);
    }
}
