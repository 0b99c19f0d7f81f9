//! The state machine engine: tick evaluation, message handling, mutation,
//! and the authoritative/follower replication split.

use crate::error::EngineError;
use crate::host::Host;
use crate::id::Id;
use crate::snapshot::{Snapshot, StateSnapshot, TransitionSnapshot};
use crate::state::StateNode;
use crate::transition::TransitionEdge;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;

/// Upper bound on transitions applied within a single tick. Exhausting it
/// means a zero-delay transition cycle in authored data and halts the
/// engine.
pub const MAX_TRANSITIONS_PER_TICK: usize = 16;

/// Replication role, fixed at construction.
///
/// Exactly one instance per logical subject is authoritative: it owns
/// [`advance`](StateEngine::advance) and
/// [`send_message`](StateEngine::send_message). Followers only apply
/// transitions identified by id and never run selection logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Authority,
    Follower,
}

/// Transport-side half of the replication contract.
///
/// Receives the id of every transition the authority decides to take,
/// before the authority applies it locally. Followers must have a
/// structurally identical snapshot loaded for the id to resolve.
pub trait ReplicationSink {
    fn broadcast_transition(&mut self, id: Id);
}

/// A timed, transition-driven state machine.
///
/// Owns the id-keyed collections of all states and edges in one shared id
/// namespace, tracks which state is current and for how long, and drives
/// the fixed-tick evaluation loop. Single-threaded by contract: nothing
/// here suspends or locks, and callbacks run synchronously inside the
/// tick.
pub struct StateEngine {
    states: HashMap<Id, StateNode>,
    edges: HashMap<Id, TransitionEdge>,
    next_id: u64,
    initial: Option<Id>,
    current: Option<Id>,
    /// Elapsed time since entering the current state.
    state_time: f64,
    /// Total advanced time, feeds the per-edge fired markers.
    clock: f64,
    /// Latch for the first-tick entry hook of the current state.
    entered_current: bool,
    halted: bool,
    role: Role,
    sink: Option<Box<dyn ReplicationSink>>,
    rng: StdRng,
}

impl Default for StateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateEngine {
    /// Creates an authoritative engine with no replication sink.
    pub fn new() -> Self {
        Self::with_role(Role::Authority, None)
    }

    /// Creates an authoritative engine that broadcasts every decided
    /// transition through the given sink before applying it locally.
    pub fn with_replication(sink: Box<dyn ReplicationSink>) -> Self {
        Self::with_role(Role::Authority, Some(sink))
    }

    /// Creates a follower: it only applies transitions identified by id
    /// via [`apply_transition_by_id`](Self::apply_transition_by_id).
    pub fn follower() -> Self {
        Self::with_role(Role::Follower, None)
    }

    /// Creates an authoritative engine with a deterministic delay RNG.
    pub fn with_rng_seed(seed: u64) -> Self {
        let mut engine = Self::new();
        engine.rng = StdRng::seed_from_u64(seed);
        engine
    }

    fn with_role(role: Role, sink: Option<Box<dyn ReplicationSink>>) -> Self {
        Self {
            states: HashMap::new(),
            edges: HashMap::new(),
            next_id: 0,
            initial: None,
            current: None,
            state_time: 0.0,
            clock: 0.0,
            entered_current: false,
            halted: false,
            role,
            sink,
            rng: StdRng::from_entropy(),
        }
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn role(&self) -> Role {
        self.role
    }

    /// True once a runaway-transition fault has halted this engine.
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn current_state(&self) -> Option<Id> {
        self.current
    }

    pub fn initial_state(&self) -> Option<Id> {
        self.initial
    }

    /// Elapsed time since entering the current state.
    pub fn state_time(&self) -> f64 {
        self.state_time
    }

    /// Total time advanced since construction or the last reset.
    pub fn clock(&self) -> f64 {
        self.clock
    }

    pub fn state(&self, id: Id) -> Option<&StateNode> {
        self.states.get(&id)
    }

    pub fn transition(&self, id: Id) -> Option<&TransitionEdge> {
        self.edges.get(&id)
    }

    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    pub fn transition_count(&self) -> usize {
        self.edges.len()
    }

    /// All state ids, unordered.
    pub fn state_ids(&self) -> impl Iterator<Item = Id> + '_ {
        self.states.keys().copied()
    }

    /// All transition ids, unordered.
    pub fn transition_ids(&self) -> impl Iterator<Item = Id> + '_ {
        self.edges.keys().copied()
    }

    /// Outgoing transitions of a state in evaluation-priority order,
    /// rebuilding the cached view if stale.
    pub fn sorted_transitions(&mut self, state: Id) -> Result<&[Id], EngineError> {
        let edges = &self.edges;
        Ok(self
            .states
            .get_mut(&state)
            .ok_or(EngineError::StateNotFound(state))?
            .sorted_edges(edges))
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// Creates a state with the next id. The first state ever added
    /// becomes the initial state.
    pub fn add_state(&mut self, name: impl Into<String>) -> Id {
        let id = self.alloc_id();
        self.states.insert(id, StateNode::new(id, name.into()));
        if self.initial.is_none() {
            self.initial = Some(id);
        }
        id
    }

    /// Removes a state, cascading removal of every edge whose source or
    /// target is that state and clearing the initial/current pointers if
    /// they referenced it.
    pub fn remove_state(&mut self, id: Id) -> Result<(), EngineError> {
        if !self.states.contains_key(&id) {
            return Err(EngineError::StateNotFound(id));
        }
        if self.initial == Some(id) {
            self.initial = None;
        }
        if self.current == Some(id) {
            self.current = None;
        }
        let touching: Vec<Id> = self
            .edges
            .values()
            .filter(|e| e.source() == id || e.target() == id)
            .map(|e| e.id())
            .collect();
        for edge in touching {
            self.remove_transition(edge)?;
        }
        self.states.remove(&id);
        Ok(())
    }

    /// Creates an edge with the next id. Both endpoints must belong to
    /// this engine.
    pub fn add_transition(&mut self, source: Id, target: Id) -> Result<Id, EngineError> {
        if !self.states.contains_key(&source) {
            return Err(EngineError::StateNotFound(source));
        }
        if !self.states.contains_key(&target) {
            return Err(EngineError::StateNotFound(target));
        }
        let id = self.alloc_id();
        self.edges.insert(id, TransitionEdge::new(id, source, target));
        if let Some(node) = self.states.get_mut(&source) {
            node.invalidate_edges();
        }
        Ok(id)
    }

    /// Removes an edge and invalidates the source node's ordering cache.
    pub fn remove_transition(&mut self, id: Id) -> Result<(), EngineError> {
        let edge = self
            .edges
            .remove(&id)
            .ok_or(EngineError::TransitionNotFound(id))?;
        if let Some(node) = self.states.get_mut(&edge.source()) {
            node.invalidate_edges();
        }
        Ok(())
    }

    /// Sets the initial state. Must belong to this engine.
    pub fn set_initial_state(&mut self, id: Id) -> Result<(), EngineError> {
        if !self.states.contains_key(&id) {
            return Err(EngineError::StateNotFound(id));
        }
        self.initial = Some(id);
        Ok(())
    }

    /// Makes the initial state current and arms the first-tick entry
    /// hook; the entry callbacks run on the next `advance`.
    pub fn activate(&mut self) {
        self.current = self.initial;
        self.state_time = 0.0;
        self.entered_current = false;
    }

    /// Empties both collections and resets the id counter, clock, and
    /// halt latch.
    pub fn clear(&mut self) {
        self.states.clear();
        self.edges.clear();
        self.next_id = 0;
        self.initial = None;
        self.current = None;
        self.state_time = 0.0;
        self.clock = 0.0;
        self.entered_current = false;
        self.halted = false;
    }

    fn alloc_id(&mut self) -> Id {
        let id = Id(self.next_id);
        self.next_id += 1;
        id
    }

    // =========================================================================
    // Attribute setters
    // =========================================================================

    pub fn set_state_name(
        &mut self,
        id: Id,
        name: impl Into<String>,
    ) -> Result<(), EngineError> {
        self.state_mut(id)?.set_name(name.into());
        Ok(())
    }

    pub fn set_enter_action(
        &mut self,
        id: Id,
        action: Option<String>,
    ) -> Result<(), EngineError> {
        self.state_mut(id)?.set_enter_action(action);
        Ok(())
    }

    pub fn set_update_action(
        &mut self,
        id: Id,
        action: Option<String>,
    ) -> Result<(), EngineError> {
        self.state_mut(id)?.set_update_action(action);
        Ok(())
    }

    pub fn set_leave_action(
        &mut self,
        id: Id,
        action: Option<String>,
    ) -> Result<(), EngineError> {
        self.state_mut(id)?.set_leave_action(action);
        Ok(())
    }

    pub fn set_position(
        &mut self,
        id: Id,
        position: Option<(f64, f64)>,
    ) -> Result<(), EngineError> {
        self.state_mut(id)?.set_position(position);
        Ok(())
    }

    /// Sets the minimum delay and invalidates the source ordering cache.
    pub fn set_min_delay(&mut self, edge: Id, min: Option<f64>) -> Result<(), EngineError> {
        self.mutate_edge_ordering(edge, |e| e.set_min_delay(min))
    }

    /// Sets the maximum delay and invalidates the source ordering cache.
    pub fn set_max_delay(&mut self, edge: Id, max: Option<f64>) -> Result<(), EngineError> {
        self.mutate_edge_ordering(edge, |e| e.set_max_delay(max))
    }

    /// Sets the message trigger and invalidates the source ordering cache.
    pub fn set_message(
        &mut self,
        edge: Id,
        message: Option<String>,
    ) -> Result<(), EngineError> {
        self.mutate_edge_ordering(edge, |e| e.set_message(message))
    }

    /// Sets the condition predicate name and invalidates the source
    /// ordering cache.
    pub fn set_condition(
        &mut self,
        edge: Id,
        condition: Option<String>,
    ) -> Result<(), EngineError> {
        self.mutate_edge_ordering(edge, |e| e.set_condition(condition))
    }

    /// Sets the transition-taken action name. Not ordering-relevant.
    pub fn set_on_taken(
        &mut self,
        edge: Id,
        on_taken: Option<String>,
    ) -> Result<(), EngineError> {
        self.edges
            .get_mut(&edge)
            .ok_or(EngineError::TransitionNotFound(edge))?
            .set_on_taken(on_taken);
        Ok(())
    }

    fn state_mut(&mut self, id: Id) -> Result<&mut StateNode, EngineError> {
        self.states.get_mut(&id).ok_or(EngineError::StateNotFound(id))
    }

    fn mutate_edge_ordering<F>(&mut self, id: Id, f: F) -> Result<(), EngineError>
    where
        F: FnOnce(&mut TransitionEdge),
    {
        let source = {
            let edge = self
                .edges
                .get_mut(&id)
                .ok_or(EngineError::TransitionNotFound(id))?;
            f(edge);
            edge.source()
        };
        if let Some(node) = self.states.get_mut(&source) {
            node.invalidate_edges();
        }
        Ok(())
    }

    // =========================================================================
    // Evaluation
    // =========================================================================

    /// Advances the engine by one fixed tick. Authoritative only.
    ///
    /// The first call after activation runs the current state's entry
    /// hook and enter action. Transitions eligible inside the tick window
    /// are applied repeatedly, up to [`MAX_TRANSITIONS_PER_TICK`];
    /// exhausting the bound halts the engine. Afterwards the current
    /// state's update action runs.
    pub fn advance(&mut self, dt: f64, host: &mut dyn Host) -> Result<(), EngineError> {
        self.ensure_authoritative()?;
        self.ensure_running()?;
        self.clock += dt;

        if !self.entered_current {
            self.entered_current = true;
            if let Some(current) = self.current {
                self.enter_state(current, host);
            }
        }

        if self.current.is_none() {
            return Ok(());
        }

        let mut prev = self.state_time;
        self.state_time += dt;

        let mut fired = 0usize;
        loop {
            let current = match self.current {
                Some(id) => id,
                None => break,
            };
            if fired >= MAX_TRANSITIONS_PER_TICK {
                self.halted = true;
                tracing::error!(
                    state = %current,
                    limit = MAX_TRANSITIONS_PER_TICK,
                    "runaway transition cycle detected, halting engine"
                );
                return Err(EngineError::RunawayTransitions {
                    state: current,
                    limit: MAX_TRANSITIONS_PER_TICK,
                });
            }
            let picked = match self.states.get_mut(&current) {
                Some(node) => node.next_in_window(prev, self.state_time, &self.edges, host),
                None => None,
            };
            match picked {
                Some(edge) => {
                    self.dispatch(edge, host);
                    fired += 1;
                    // The newly entered state restarts its own window for
                    // the remainder of this tick.
                    prev = 0.0;
                }
                None => break,
            }
        }

        if let Some(current) = self.current {
            let update = self
                .states
                .get(&current)
                .and_then(|s| s.update_action())
                .map(str::to_string);
            if let Some(name) = update {
                run_action(&name, "update", host);
            }
        }

        Ok(())
    }

    /// Delivers a message to the current state. Authoritative only.
    ///
    /// A single message-scoped lookup at the current state time; a no-op
    /// when there is no current state or no eligible edge.
    pub fn send_message(
        &mut self,
        message: &str,
        host: &mut dyn Host,
    ) -> Result<(), EngineError> {
        self.ensure_authoritative()?;
        self.ensure_running()?;

        let current = match self.current {
            Some(id) => id,
            None => return Ok(()),
        };
        let picked = match self.states.get_mut(&current) {
            Some(node) => {
                node.next_for_message(message, self.state_time, &self.edges, host)
            }
            None => None,
        };
        if let Some(edge) = picked {
            self.dispatch(edge, host);
        }
        Ok(())
    }

    /// Applies a transition identified by id.
    ///
    /// The follower entry point of the replication contract; also the
    /// path an authority's transport loop uses for self-delivery.
    pub fn apply_transition_by_id(
        &mut self,
        id: Id,
        host: &mut dyn Host,
    ) -> Result<(), EngineError> {
        self.ensure_running()?;
        if !self.edges.contains_key(&id) {
            return Err(EngineError::TransitionNotFound(id));
        }
        self.apply(id, host);
        Ok(())
    }

    /// Broadcasts the decided transition to followers, then applies it
    /// locally.
    fn dispatch(&mut self, edge: Id, host: &mut dyn Host) {
        if let Some(sink) = self.sink.as_mut() {
            sink.broadcast_transition(edge);
        }
        self.apply(edge, host);
    }

    /// The shared application path, identical on authority and follower:
    /// leave the old state, run the edge's taken action, stamp the fired
    /// marker, enter the target.
    fn apply(&mut self, id: Id, host: &mut dyn Host) {
        let (source, target, on_taken) = match self.edges.get(&id) {
            Some(edge) => (
                edge.source(),
                edge.target(),
                edge.on_taken().map(str::to_string),
            ),
            None => return,
        };

        if self.current != Some(source) {
            // Tolerates replication lag rather than rejecting.
            tracing::warn!(
                transition = %id,
                expected_source = %source,
                current = ?self.current,
                "transition source does not match current state, applying anyway"
            );
        }

        if let Some(current) = self.current {
            let leave = self
                .states
                .get(&current)
                .and_then(|s| s.leave_action())
                .map(str::to_string);
            if let Some(name) = leave {
                run_action(&name, "leave", host);
            }
        }

        if let Some(name) = on_taken {
            run_action(&name, "taken", host);
        }

        if let Some(edge) = self.edges.get_mut(&id) {
            edge.mark_fired(self.clock);
        }

        tracing::debug!(transition = %id, from = ?self.current, to = %target, "applied transition");

        self.current = Some(target);
        self.state_time = 0.0;
        self.entered_current = true;
        self.enter_state(target, host);
    }

    /// Runs the entry hook of a state: precompute its default transition,
    /// then run its enter action.
    fn enter_state(&mut self, id: Id, host: &mut dyn Host) {
        if let Some(node) = self.states.get_mut(&id) {
            node.entered(&self.edges, &mut self.rng);
        }
        let enter = self
            .states
            .get(&id)
            .and_then(|s| s.enter_action())
            .map(str::to_string);
        if let Some(name) = enter {
            run_action(&name, "enter", host);
        }
    }

    fn ensure_authoritative(&self) -> Result<(), EngineError> {
        match self.role {
            Role::Authority => Ok(()),
            Role::Follower => Err(EngineError::NotAuthoritative),
        }
    }

    fn ensure_running(&self) -> Result<(), EngineError> {
        if self.halted {
            Err(EngineError::Halted)
        } else {
            Ok(())
        }
    }

    // =========================================================================
    // Serialization
    // =========================================================================

    /// Serializes every state and edge plus the initial-state pointer.
    pub fn snapshot(&self) -> Snapshot {
        let mut states: Vec<StateSnapshot> =
            self.states.values().map(StateSnapshot::capture).collect();
        states.sort_by_key(|s| s.id);
        let mut edges: Vec<TransitionSnapshot> = self
            .edges
            .values()
            .map(TransitionSnapshot::capture)
            .collect();
        edges.sort_by_key(|e| e.id);
        Snapshot {
            states,
            edges,
            initial_state: self.initial,
        }
    }

    /// Serializes an explicit subset, filtered to states and edges this
    /// engine actually owns, with no initial-state pointer. The
    /// copy/duplicate path.
    pub fn snapshot_subset(&self, state_ids: &[Id], edge_ids: &[Id]) -> Snapshot {
        let mut states: Vec<StateSnapshot> = state_ids
            .iter()
            .filter_map(|id| self.states.get(id))
            .map(StateSnapshot::capture)
            .collect();
        states.sort_by_key(|s| s.id);
        let mut edges: Vec<TransitionSnapshot> = edge_ids
            .iter()
            .filter_map(|id| self.edges.get(id))
            .map(TransitionSnapshot::capture)
            .collect();
        edges.sort_by_key(|e| e.id);
        Snapshot {
            states,
            edges,
            initial_state: None,
        }
    }

    /// Discards all existing content and loads the snapshot with ids
    /// verbatim. The id counter resumes above the highest loaded id.
    pub fn load_replace(&mut self, snapshot: &Snapshot) -> Result<(), EngineError> {
        snapshot.validate()?;
        self.clear();

        let mut next_id = 0u64;
        for state in &snapshot.states {
            self.insert_state_from(state, state.id);
            next_id = next_id.max(state.id.as_u64() + 1);
        }
        for edge in &snapshot.edges {
            self.insert_edge_from(edge, edge.id, edge.source, edge.target);
            next_id = next_id.max(edge.id.as_u64() + 1);
        }
        self.next_id = next_id;
        self.initial = snapshot.initial_state;
        Ok(())
    }

    /// Merges the snapshot into existing content: every loaded id is
    /// offset by the current id counter, edge endpoints are remapped by
    /// the same offset, and the initial/current pointers are untouched.
    pub fn load_insert(&mut self, snapshot: &Snapshot) -> Result<(), EngineError> {
        snapshot.validate()?;

        let offset = self.next_id;
        let mut next_id = self.next_id;
        for state in &snapshot.states {
            let id = Id(state.id.as_u64() + offset);
            self.insert_state_from(state, id);
            next_id = next_id.max(id.as_u64() + 1);
        }
        for edge in &snapshot.edges {
            let id = Id(edge.id.as_u64() + offset);
            let source = Id(edge.source.as_u64() + offset);
            let target = Id(edge.target.as_u64() + offset);
            self.insert_edge_from(edge, id, source, target);
            next_id = next_id.max(id.as_u64() + 1);
        }
        self.next_id = next_id;
        Ok(())
    }

    fn insert_state_from(&mut self, snap: &StateSnapshot, id: Id) {
        let mut node = StateNode::new(id, snap.name.clone());
        node.set_enter_action(snap.enter_action.clone());
        node.set_update_action(snap.update_action.clone());
        node.set_leave_action(snap.leave_action.clone());
        node.set_position(snap.position);
        self.states.insert(id, node);
    }

    fn insert_edge_from(&mut self, snap: &TransitionSnapshot, id: Id, source: Id, target: Id) {
        let mut edge = TransitionEdge::new(id, source, target);
        edge.set_min_delay(snap.min_delay);
        edge.set_max_delay(snap.max_delay);
        edge.set_message(snap.message.clone());
        edge.set_condition(snap.condition.clone());
        edge.set_on_taken(snap.on_taken.clone());
        self.edges.insert(id, edge);
        if let Some(node) = self.states.get_mut(&source) {
            node.invalidate_edges();
        }
    }
}

/// Runs a named action through the host; failures are logged, never
/// propagated into the tick loop.
fn run_action(name: &str, kind: &'static str, host: &mut dyn Host) {
    if let Err(err) = host.run_action(name) {
        tracing::warn!(action = name, kind, %err, "action callback failed");
    }
}
