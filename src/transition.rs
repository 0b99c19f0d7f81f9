//! Transition edges between states.
//!
//! An edge carries an immutable identity (id, source, target) plus
//! optional attributes: a delay window, a message trigger, a condition
//! predicate, and a transition-taken action. Edges hold no scheduling
//! logic of their own; the owning engine mutates attributes and
//! invalidates the source state's ordering cache.

use crate::id::Id;
use std::cmp::Ordering;

/// A directed, conditionally-eligible move between two states.
#[derive(Debug, Clone)]
pub struct TransitionEdge {
    id: Id,
    source: Id,
    target: Id,
    min_delay: Option<f64>,
    max_delay: Option<f64>,
    message: Option<String>,
    condition: Option<String>,
    on_taken: Option<String>,
    /// Engine clock value when this edge last fired. Consumed only by
    /// external visualization; not load-bearing for selection.
    last_fired: Option<f64>,
}

impl TransitionEdge {
    pub(crate) fn new(id: Id, source: Id, target: Id) -> Self {
        Self {
            id,
            source,
            target,
            min_delay: None,
            max_delay: None,
            message: None,
            condition: None,
            on_taken: None,
            last_fired: None,
        }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn source(&self) -> Id {
        self.source
    }

    pub fn target(&self) -> Id {
        self.target
    }

    pub fn min_delay(&self) -> Option<f64> {
        self.min_delay
    }

    pub fn max_delay(&self) -> Option<f64> {
        self.max_delay
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn condition(&self) -> Option<&str> {
        self.condition.as_deref()
    }

    pub fn on_taken(&self) -> Option<&str> {
        self.on_taken.as_deref()
    }

    /// Engine clock value at the last firing, if any.
    pub fn last_fired(&self) -> Option<f64> {
        self.last_fired
    }

    /// Elapsed engine time since the last firing, given the current clock.
    pub fn time_since_fired(&self, clock: f64) -> Option<f64> {
        self.last_fired.map(|at| clock - at)
    }

    /// True when a message or a condition gates this edge.
    pub fn is_conditional(&self) -> bool {
        self.message.is_some() || self.condition.is_some()
    }

    /// Concrete `[min, max]` window derived from the optional bounds.
    ///
    /// A missing minimum is 0. A missing maximum is unbounded for
    /// conditional edges and collapses to the minimum otherwise, so an
    /// attribute-free unconditioned edge derives `[0, 0]`. The maximum is
    /// never below the minimum.
    pub fn effective_delay_range(&self) -> (f64, f64) {
        let min = self.min_delay.unwrap_or(0.0).max(0.0);
        let max = self
            .max_delay
            .unwrap_or(if self.is_conditional() {
                f64::INFINITY
            } else {
                min
            })
            .max(min);
        (min, max)
    }

    /// True when the derived delay window contains the given state time.
    pub fn contains_time(&self, t: f64) -> bool {
        let (min, max) = self.effective_delay_range();
        t >= min && t <= max
    }

    /// True when the derived delay window overlaps the half-open tick
    /// window `[prev, next)`.
    pub fn overlaps_window(&self, prev: f64, next: f64) -> bool {
        let (min, max) = self.effective_delay_range();
        min < next && max >= prev
    }

    /// True for unconditioned edges that carry delay information; these
    /// are the candidates for a state's default transition.
    pub(crate) fn is_delay_only(&self) -> bool {
        !self.is_conditional() && (self.min_delay.is_some() || self.max_delay.is_some())
    }

    pub(crate) fn set_min_delay(&mut self, min: Option<f64>) {
        self.min_delay = min;
    }

    pub(crate) fn set_max_delay(&mut self, max: Option<f64>) {
        self.max_delay = max;
    }

    pub(crate) fn set_message(&mut self, message: Option<String>) {
        self.message = message;
    }

    pub(crate) fn set_condition(&mut self, condition: Option<String>) {
        self.condition = condition;
    }

    pub(crate) fn set_on_taken(&mut self, on_taken: Option<String>) {
        self.on_taken = on_taken;
    }

    pub(crate) fn mark_fired(&mut self, clock: f64) {
        self.last_fired = Some(clock);
    }
}

/// Total evaluation-priority ordering between edges sharing a source.
///
/// Ascending minimum then maximum delay (absent bounds sort last), then
/// condition-carrying edges, then message-carrying edges, then ascending
/// target id. The trailing edge-id comparison only disambiguates edges
/// identical on every other key, keeping rebuilds deterministic.
pub(crate) fn priority_cmp(a: &TransitionEdge, b: &TransitionEdge) -> Ordering {
    let a_min = a.min_delay.unwrap_or(f64::INFINITY);
    let b_min = b.min_delay.unwrap_or(f64::INFINITY);
    let a_max = a.max_delay.unwrap_or(f64::INFINITY);
    let b_max = b.max_delay.unwrap_or(f64::INFINITY);

    a_min
        .total_cmp(&b_min)
        .then_with(|| a_max.total_cmp(&b_max))
        .then_with(|| b.condition.is_some().cmp(&a.condition.is_some()))
        .then_with(|| b.message.is_some().cmp(&a.message.is_some()))
        .then_with(|| a.target.cmp(&b.target))
        .then_with(|| a.id.cmp(&b.id))
}
