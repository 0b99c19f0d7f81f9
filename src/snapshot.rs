//! Snapshot model for save/load, copy/paste, duplicate, and undo/redo.
//!
//! A snapshot serializes states and edges by value, including the opaque
//! callback names and editor-only position metadata. Two load modes exist
//! on the engine: replace (ids verbatim, counter resumes above the highest
//! loaded id) and insert (every id offset by the engine's counter so
//! merged content never collides).

use crate::error::EngineError;
use crate::id::Id;
use crate::state::StateNode;
use crate::transition::TransitionEdge;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Serialized form of a state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub id: Id,
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enter_action: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_action: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leave_action: Option<String>,

    /// Editor-only placement metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<(f64, f64)>,
}

impl StateSnapshot {
    pub(crate) fn capture(node: &StateNode) -> Self {
        Self {
            id: node.id(),
            name: node.name().to_string(),
            enter_action: node.enter_action().map(str::to_string),
            update_action: node.update_action().map(str::to_string),
            leave_action: node.leave_action().map(str::to_string),
            position: node.position(),
        }
    }
}

/// Serialized form of a transition edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionSnapshot {
    pub id: Id,
    pub source: Id,
    pub target: Id,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_delay: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_taken: Option<String>,
}

impl TransitionSnapshot {
    pub(crate) fn capture(edge: &TransitionEdge) -> Self {
        Self {
            id: edge.id(),
            source: edge.source(),
            target: edge.target(),
            min_delay: edge.min_delay(),
            max_delay: edge.max_delay(),
            message: edge.message().map(str::to_string),
            condition: edge.condition().map(str::to_string),
            on_taken: edge.on_taken().map(str::to_string),
        }
    }
}

/// A serialized state machine, or a subset of one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub states: Vec<StateSnapshot>,
    pub edges: Vec<TransitionSnapshot>,

    /// Absent for partial (copy/duplicate) snapshots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_state: Option<Id>,
}

impl Snapshot {
    /// Checks structural consistency: pairwise-distinct ids across both
    /// collections, no edge referencing a state missing from this
    /// snapshot, and an initial-state pointer (if present) that resolves.
    pub fn validate(&self) -> Result<(), EngineError> {
        let mut ids = HashSet::new();
        let mut state_ids = HashSet::new();

        for state in &self.states {
            if !ids.insert(state.id) {
                return Err(EngineError::InvalidSnapshot {
                    reason: format!("duplicate id {}", state.id),
                });
            }
            state_ids.insert(state.id);
        }
        for edge in &self.edges {
            if !ids.insert(edge.id) {
                return Err(EngineError::InvalidSnapshot {
                    reason: format!("duplicate id {}", edge.id),
                });
            }
            for endpoint in [edge.source, edge.target] {
                if !state_ids.contains(&endpoint) {
                    return Err(EngineError::InvalidSnapshot {
                        reason: format!(
                            "edge {} references missing state {}",
                            edge.id, endpoint
                        ),
                    });
                }
            }
        }
        if let Some(initial) = self.initial_state {
            if !state_ids.contains(&initial) {
                return Err(EngineError::InvalidSnapshot {
                    reason: format!("initial state {} not in snapshot", initial),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StateEngine;
    use crate::host::NullHost;

    /// Engine with three states and two attributed edges.
    fn sample_engine() -> StateEngine {
        let mut engine = StateEngine::new();
        let a = engine.add_state("a");
        let b = engine.add_state("b");
        let c = engine.add_state("c");
        engine.set_position(a, Some((10.0, 20.0))).unwrap();
        engine.set_enter_action(a, Some("a_enter".to_string())).unwrap();

        let ab = engine.add_transition(a, b).unwrap();
        engine.set_min_delay(ab, Some(1.0)).unwrap();
        engine.set_max_delay(ab, Some(2.0)).unwrap();
        engine.set_on_taken(ab, Some("ab_taken".to_string())).unwrap();

        let bc = engine.add_transition(b, c).unwrap();
        engine.set_message(bc, Some("go".to_string())).unwrap();
        engine.set_condition(bc, Some("ready".to_string())).unwrap();

        engine
    }

    #[test]
    fn test_replace_round_trip() {
        let engine = sample_engine();
        let snapshot = engine.snapshot();

        let mut restored = StateEngine::new();
        restored.add_state("stale");
        restored.load_replace(&snapshot).unwrap();

        assert_eq!(restored.snapshot(), snapshot);
        assert_eq!(restored.initial_state(), engine.initial_state());
        assert_eq!(restored.current_state(), None);
        assert_eq!(restored.state_count(), 3);
        assert_eq!(restored.transition_count(), 2);

        // Counter resumes above the highest loaded id.
        let fresh = restored.add_state("fresh");
        assert_eq!(fresh, Id(5));
    }

    #[test]
    fn test_json_round_trip() {
        let snapshot = sample_engine().snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        let parsed: Snapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, snapshot);
    }

    #[test]
    fn test_absent_fields_are_omitted() {
        let mut engine = StateEngine::new();
        engine.add_state("bare");
        let json = serde_json::to_value(engine.snapshot()).unwrap();
        let state = &json["states"][0];
        assert!(state.get("enter_action").is_none());
        assert!(state.get("position").is_none());
    }

    #[test]
    fn test_insert_offsets_and_remaps() {
        let engine = sample_engine();
        let snapshot = engine.snapshot();

        let mut dest = StateEngine::new();
        let existing = dest.add_state("existing");
        let before = dest.state_count();

        dest.load_insert(&snapshot).unwrap();
        assert_eq!(dest.state_count(), before + 3);
        assert_eq!(dest.transition_count(), 2);

        // Existing content and pointers untouched.
        assert!(dest.state(existing).is_some());
        assert_eq!(dest.initial_state(), Some(existing));

        // All ids distinct, all edges remapped onto inserted states.
        let mut ids: Vec<u64> = dest
            .state_ids()
            .chain(dest.transition_ids())
            .map(|id| id.as_u64())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), dest.state_count() + dest.transition_count());

        for id in dest.transition_ids().collect::<Vec<_>>() {
            let edge = dest.transition(id).unwrap();
            assert!(dest.state(edge.source()).is_some());
            assert!(dest.state(edge.target()).is_some());
            assert_ne!(edge.source(), existing);
        }
    }

    #[test]
    fn test_inserted_content_is_runnable() {
        let snapshot = sample_engine().snapshot();
        let mut dest = StateEngine::new();
        dest.load_insert(&snapshot).unwrap();

        // The inserted copy of `a` has the timed edge toward `b`.
        let a = dest
            .state_ids()
            .find(|id| dest.state(*id).map(|s| s.name()) == Some("a"))
            .unwrap();
        dest.set_initial_state(a).unwrap();
        dest.activate();

        let mut host = NullHost;
        dest.advance(2.5, &mut host).unwrap();
        let current = dest.current_state().unwrap();
        assert_eq!(dest.state(current).unwrap().name(), "b");
    }

    #[test]
    fn test_subset_export() {
        let engine = sample_engine();
        let states: Vec<Id> = engine.state_ids().collect();
        let edges: Vec<Id> = engine.transition_ids().collect();

        // Take two states and only the edges between them; foreign ids
        // are filtered out.
        let a = states.iter().copied().min().unwrap();
        let b = Id(a.as_u64() + 1);
        let owned_edges: Vec<Id> = edges
            .iter()
            .copied()
            .filter(|id| {
                let e = engine.transition(*id).unwrap();
                e.source() == a && e.target() == b
            })
            .chain([Id(12345)])
            .collect();

        let subset = engine.snapshot_subset(&[a, b, Id(54321)], &owned_edges);
        assert_eq!(subset.states.len(), 2);
        assert_eq!(subset.edges.len(), 1);
        assert_eq!(subset.initial_state, None);
        subset.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_dangling_edge() {
        let mut snapshot = sample_engine().snapshot();
        snapshot.states.retain(|s| s.name != "c");

        assert!(matches!(
            snapshot.validate(),
            Err(EngineError::InvalidSnapshot { .. })
        ));
        let mut engine = StateEngine::new();
        assert!(engine.load_replace(&snapshot).is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_ids() {
        let mut snapshot = sample_engine().snapshot();
        let dup = snapshot.states[0].clone();
        snapshot.states.push(dup);
        assert!(matches!(
            snapshot.validate(),
            Err(EngineError::InvalidSnapshot { .. })
        ));
    }

    #[test]
    fn test_replace_releases_halt() {
        let mut engine = StateEngine::new();
        let a = engine.add_state("a");
        let b = engine.add_state("b");
        for (s, t) in [(a, b), (b, a)] {
            let e = engine.add_transition(s, t).unwrap();
            engine.set_min_delay(e, Some(0.0)).unwrap();
            engine.set_max_delay(e, Some(0.0)).unwrap();
        }
        engine.activate();
        assert!(engine.advance(0.1, &mut NullHost).is_err());
        assert!(engine.is_halted());

        let fresh = sample_engine().snapshot();
        engine.load_replace(&fresh).unwrap();
        assert!(!engine.is_halted());
        engine.activate();
        engine.advance(0.1, &mut NullHost).unwrap();
    }
}
