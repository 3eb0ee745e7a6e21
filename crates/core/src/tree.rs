//! Append-only tree of positions reported by the engine.
//!
//! Nodes live in an arena owned by [`PositionTree`]; parents are referenced
//! by [`NodeId`] so there are no ownership cycles. `children[0]` of every node
//! is its main-line continuation.

use crate::board::Board;
use gobanview_protocol::{fields, Color, Move, RenderState};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(usize);

impl NodeId {
    pub const ROOT: NodeId = NodeId(0);

    pub fn from_index(index: usize) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    #[error("engine reported different stones for an existing position {node}")]
    Diverged { node: NodeId },
    #[error("tree mutation halted after a consistency violation")]
    Halted,
    #[error("unknown node {0}")]
    UnknownNode(NodeId),
    #[error("board size {found} does not match the game's size {expected}")]
    BoardSize { expected: u8, found: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeConfig {
    pub board_size: u8,
    pub first_to_play: Color,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            board_size: 19,
            first_to_play: Color::Black,
        }
    }
}

/// A principal variation the engine suggests, starting with `lead`.
#[derive(Debug, Clone, PartialEq)]
pub struct Variation {
    pub lead: Move,
    pub line: Vec<Move>,
}

/// Engine-reported statistics, overwritten field by field as search progresses.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Stats {
    pub visits: Option<u64>,
    pub value: Option<f64>,
    pub child_moves: Vec<Move>,
    pub child_visits: Vec<u64>,
    pub child_values: Vec<f64>,
    pub variations: Vec<Variation>,
}

/// Sparse set of statistics to apply to a node; `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeUpdate {
    pub visits: Option<u64>,
    pub value: Option<f64>,
    pub child_moves: Option<Vec<Move>>,
    pub child_visits: Option<Vec<u64>>,
    pub child_values: Option<Vec<f64>>,
    pub variations: Option<Vec<Variation>>,
}

#[derive(Debug, Clone)]
pub struct PositionNode {
    id: NodeId,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    mv: Option<Move>,
    move_number: u32,
    to_play: Color,
    main_line: bool,
    stones: Option<Board>,
    stats: Stats,
}

impl PositionNode {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// The move that produced this position; `None` for the root.
    pub fn mv(&self) -> Option<Move> {
        self.mv
    }

    pub fn move_number(&self) -> u32 {
        self.move_number
    }

    pub fn to_play(&self) -> Color {
        self.to_play
    }

    pub fn is_main_line(&self) -> bool {
        self.main_line
    }

    /// `None` until the engine has reported the stones for this position.
    pub fn stones(&self) -> Option<&Board> {
        self.stones.as_ref()
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }
}

/// Result of [`PositionTree::add_child`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Insertion {
    pub id: NodeId,
    pub created: bool,
}

/// Result of [`PositionTree::ensure_path`]; `created` is in creation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathInsertion {
    pub node: NodeId,
    pub created: Vec<NodeId>,
}

#[derive(Debug, Clone)]
pub struct PositionTree {
    config: TreeConfig,
    nodes: Vec<PositionNode>,
    halted: bool,
}

impl PositionTree {
    pub fn new(config: TreeConfig) -> Self {
        let root = PositionNode {
            id: NodeId::ROOT,
            parent: None,
            children: Vec::new(),
            mv: None,
            move_number: 0,
            to_play: config.first_to_play,
            main_line: true,
            stones: Some(Board::empty(config.board_size)),
            stats: Stats::default(),
        };
        Self {
            config,
            nodes: vec![root],
            halted: false,
        }
    }

    /// Discards every node and starts over from an empty board.
    pub fn reset(&mut self, config: TreeConfig) {
        *self = Self::new(config);
    }

    pub fn config(&self) -> TreeConfig {
        self.config
    }

    pub fn board_size(&self) -> u8 {
        self.config.board_size
    }

    pub fn root(&self) -> NodeId {
        NodeId::ROOT
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn node(&self, id: NodeId) -> Option<&PositionNode> {
        self.nodes.get(id.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PositionNode> {
        self.nodes.iter()
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.node(id).map(|n| n.children.as_slice()).unwrap_or(&[])
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).and_then(|n| n.parent)
    }

    pub fn depth(&self, id: NodeId) -> usize {
        self.node(id).map(|n| n.move_number as usize).unwrap_or(0)
    }

    pub fn find_child(&self, parent: NodeId, mv: Move) -> Option<NodeId> {
        self.children(parent)
            .iter()
            .copied()
            .find(|c| self.nodes[c.0].mv == Some(mv))
    }

    /// Resolves a move path from the root without creating anything.
    pub fn follow(&self, moves: &[Move]) -> Option<NodeId> {
        moves
            .iter()
            .try_fold(self.root(), |at, mv| self.find_child(at, *mv))
    }

    /// Returns the existing child for `mv` or appends a new one.
    ///
    /// Re-adding a known move is idempotent. If both the recorded and the
    /// incoming stones are known and differ, the tree halts: the engine and
    /// this tree no longer agree and there is no safe way to pick a side.
    pub fn add_child(
        &mut self,
        parent: NodeId,
        mv: Move,
        stones: Option<Board>,
    ) -> Result<Insertion, TreeError> {
        self.ensure_live()?;
        let (parent_main, parent_number, parent_to_play, first) = {
            let p = self.node(parent).ok_or(TreeError::UnknownNode(parent))?;
            (p.main_line, p.move_number, p.to_play, p.children.is_empty())
        };
        if let Some(board) = &stones {
            self.check_size(board)?;
        }

        if let Some(existing) = self.find_child(parent, mv) {
            if let Some(board) = stones {
                self.reconcile_stones(existing, board)?;
            }
            return Ok(Insertion {
                id: existing,
                created: false,
            });
        }

        let id = NodeId(self.nodes.len());
        self.nodes.push(PositionNode {
            id,
            parent: Some(parent),
            children: Vec::new(),
            mv: Some(mv),
            move_number: parent_number + 1,
            to_play: parent_to_play.opponent(),
            main_line: parent_main && first,
            stones,
            stats: Stats::default(),
        });
        self.nodes[parent.0].children.push(id);
        Ok(Insertion { id, created: true })
    }

    /// Walks `moves` from the root, creating any missing positions. Only the
    /// final position receives `stones`; intermediate ones stay unknown until
    /// a later report fills them in.
    pub fn ensure_path(
        &mut self,
        moves: &[Move],
        stones: Option<Board>,
    ) -> Result<PathInsertion, TreeError> {
        self.ensure_live()?;
        let mut at = self.root();
        let mut created = Vec::new();
        let mut stones = stones;
        for (i, mv) in moves.iter().enumerate() {
            let last = i + 1 == moves.len();
            let insertion = self.add_child(at, *mv, if last { stones.take() } else { None })?;
            if insertion.created {
                created.push(insertion.id);
            }
            at = insertion.id;
        }
        if let Some(board) = stones {
            self.check_size(&board)?;
            self.reconcile_stones(at, board)?;
        }
        Ok(PathInsertion { node: at, created })
    }

    /// Applies engine statistics without touching topology. Returns the
    /// render fields that changed.
    pub fn update(&mut self, id: NodeId, update: NodeUpdate) -> Result<RenderState, TreeError> {
        self.ensure_live()?;
        let size = self.config.board_size;
        let node = self.nodes.get_mut(id.0).ok_or(TreeError::UnknownNode(id))?;
        let mut changed = RenderState::new();
        if let Some(visits) = update.visits {
            node.stats.visits = Some(visits);
            changed.insert(fields::VISITS, visits);
        }
        if let Some(value) = update.value {
            node.stats.value = Some(value);
            changed.insert(fields::VALUE, value);
        }
        if let Some(moves) = update.child_moves {
            changed.insert(fields::CHILD_MOVES, gtp_list(&moves, size));
            node.stats.child_moves = moves;
        }
        if let Some(visits) = update.child_visits {
            changed.insert(fields::CHILD_VISITS, visits.clone());
            node.stats.child_visits = visits;
        }
        if let Some(values) = update.child_values {
            changed.insert(fields::CHILD_VALUES, values.clone());
            node.stats.child_values = values;
        }
        if let Some(variations) = update.variations {
            changed.insert(fields::VARIATIONS, variations_json(&variations, size));
            node.stats.variations = variations;
        }
        Ok(changed)
    }

    /// Root through `id`, then on through `id`'s main-line descendants to
    /// the leaf of that line.
    pub fn get_full_line(&self, id: NodeId) -> Vec<NodeId> {
        if self.node(id).is_none() {
            return Vec::new();
        }
        let mut line = Vec::new();
        let mut at = Some(id);
        while let Some(n) = at {
            line.push(n);
            at = self.parent(n);
        }
        line.reverse();
        let mut tip = id;
        while let Some(&next) = self.children(tip).first() {
            line.push(next);
            tip = next;
        }
        line
    }

    pub fn main_line(&self) -> Vec<NodeId> {
        self.get_full_line(self.root())
    }

    /// Moves from the root to `id`.
    pub fn path_to(&self, id: NodeId) -> Vec<Move> {
        let mut moves = Vec::new();
        let mut at = self.node(id);
        while let Some(node) = at {
            if let Some(mv) = node.mv {
                moves.push(mv);
            }
            at = node.parent.and_then(|p| self.node(p));
        }
        moves.reverse();
        moves
    }

    /// Every displayable field of `id`, for when the viewed position changes.
    pub fn render_state(&self, id: NodeId) -> RenderState {
        let Some(node) = self.node(id) else {
            return RenderState::new();
        };
        let size = self.config.board_size;
        let mut state = RenderState::new()
            .with(fields::CURRENT, id.0)
            .with(fields::MOVE_NUM, node.move_number)
            .with(fields::TO_PLAY, node.to_play.as_gtp());
        if let Some(board) = &node.stones {
            state.insert(fields::STONES, board.to_text());
        }
        let stats = &node.stats;
        if let Some(visits) = stats.visits {
            state.insert(fields::VISITS, visits);
        }
        if let Some(value) = stats.value {
            state.insert(fields::VALUE, value);
        }
        if !stats.child_moves.is_empty() {
            state.insert(fields::CHILD_MOVES, gtp_list(&stats.child_moves, size));
        }
        if !stats.child_visits.is_empty() {
            state.insert(fields::CHILD_VISITS, stats.child_visits.clone());
        }
        if !stats.child_values.is_empty() {
            state.insert(fields::CHILD_VALUES, stats.child_values.clone());
        }
        if !stats.variations.is_empty() {
            state.insert(fields::VARIATIONS, variations_json(&stats.variations, size));
        }
        state
    }

    fn ensure_live(&self) -> Result<(), TreeError> {
        if self.halted {
            return Err(TreeError::Halted);
        }
        Ok(())
    }

    fn check_size(&self, board: &Board) -> Result<(), TreeError> {
        if board.size() != self.config.board_size {
            return Err(TreeError::BoardSize {
                expected: self.config.board_size,
                found: board.size(),
            });
        }
        Ok(())
    }

    fn reconcile_stones(&mut self, id: NodeId, board: Board) -> Result<(), TreeError> {
        let node = &mut self.nodes[id.0];
        if node.stones.is_none() {
            node.stones = Some(board);
            return Ok(());
        }
        if node.stones.as_ref() == Some(&board) {
            return Ok(());
        }
        self.halted = true;
        error!(
            target: "gobanview.tree",
            node = %id,
            "stones disagree with the recorded position; halting tree updates"
        );
        Err(TreeError::Diverged { node: id })
    }
}

fn gtp_list(moves: &[Move], size: u8) -> Vec<String> {
    moves.iter().map(|m| m.to_gtp(size)).collect()
}

fn variations_json(variations: &[Variation], size: u8) -> serde_json::Value {
    let map: serde_json::Map<String, serde_json::Value> = variations
        .iter()
        .map(|v| (v.lead.to_gtp(size), gtp_list(&v.line, size).into()))
        .collect();
    serde_json::Value::Object(map)
}
