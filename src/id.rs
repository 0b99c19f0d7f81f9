//! Shared identifier namespace for states and transitions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier for a state or a transition.
///
/// States and transitions draw from one monotonically increasing counter,
/// so an id is unique across both collections for the lifetime of an
/// engine. The counter only restarts on [`clear`](crate::StateEngine::clear)
/// or a replace-load, which resumes it above the highest loaded id.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Id(pub u64);

impl Id {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Id {
    fn from(v: u64) -> Self {
        Self(v)
    }
}
