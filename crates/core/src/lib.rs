//! Session state for gobanview: the position tree reconstructed from engine
//! telemetry, its variation layout, and the renderer fan-out.
//!
//! Everything here is synchronous and single-owner; the client crate drives
//! it from one task.

pub mod board;
pub mod broadcast;
pub mod layout;
pub mod tree;

pub use board::{Board, BoardParseError};
pub use broadcast::{Broadcaster, Renderer};
pub use layout::{GridPoint, LayoutConfig, LayoutEngine, SurfaceSize, MAX_SPACING};
pub use tree::{
    Insertion, NodeId, NodeUpdate, PathInsertion, PositionNode, PositionTree, Stats, TreeConfig,
    TreeError, Variation,
};
