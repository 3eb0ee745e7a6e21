use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub mod moves;
pub mod telemetry;
pub mod wire;

pub use moves::{Color, Move, MoveParseError, Point};
pub use telemetry::{AnalysisReport, Payload, PositionReport};
pub use wire::{EngineFrame, Envelope, Reply};

/// Names of the fields present in a [`RenderState`].
pub type FieldSet = BTreeSet<String>;

/// Sparse view update: a key that is absent means "unchanged", never "empty".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RenderState(BTreeMap<String, serde_json::Value>);

impl RenderState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.insert(field, value);
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.0.insert(field.into(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&serde_json::Value> {
        self.0.get(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn fields(&self) -> FieldSet {
        self.0.keys().cloned().collect()
    }

    /// Later values win.
    pub fn merge(&mut self, other: RenderState) {
        self.0.extend(other.0);
    }
}

pub mod fields {
    pub const STONES: &str = "stones";
    pub const MOVE_NUM: &str = "moveNum";
    pub const TO_PLAY: &str = "toPlay";
    pub const CURRENT: &str = "current";
    pub const VISITS: &str = "visits";
    pub const VALUE: &str = "value";
    pub const CHILD_MOVES: &str = "childMoves";
    pub const CHILD_VISITS: &str = "childN";
    pub const CHILD_VALUES: &str = "childValues";
    pub const VARIATIONS: &str = "variations";
    pub const TOPOLOGY: &str = "topology";
}
