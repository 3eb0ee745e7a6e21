//! Incremental grid layout for the variation tree.
//!
//! Each node gets an integer `(x, y)` cell with `y = depth * spacing`. A new
//! node starts under its parent and is pushed right past the most recently
//! placed node at its own depth and at the next depth. When a node is its
//! parent's first child the parent (and every first-child ancestor above it)
//! is pulled right to match, so the main line stays a straight column.
//!
//! The layout is defined as that placement step applied to the tree in
//! pre-order with children in index order, which makes the result depend
//! only on the tree's shape, never on the order nodes arrived in. A node that
//! lands at the end of pre-order is placed immediately in O(depth); any other
//! insertion marks the layout stale and the next [`LayoutEngine::refresh`]
//! replays the whole tree once.

use crate::tree::{NodeId, PositionTree};
use serde::Serialize;

/// Largest grid spacing accepted. Larger values are clamped so coordinates
/// stay far from `i32` overflow on deep trees.
pub const MAX_SPACING: i32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutConfig {
    pub spacing: i32,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self { spacing: 1 }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct GridPoint {
    pub x: i32,
    pub y: i32,
}

/// Extent of the drawing surface in grid units. Only ever grows within a game.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SurfaceSize {
    pub width: i32,
    pub height: i32,
}

#[derive(Debug, Clone)]
pub struct LayoutEngine {
    spacing: i32,
    points: Vec<Option<GridPoint>>,
    /// Most recently placed node per depth.
    rightmost: Vec<Option<NodeId>>,
    placed: usize,
    stale: bool,
    surface: SurfaceSize,
}

impl LayoutEngine {
    pub fn new(config: LayoutConfig) -> Self {
        Self {
            spacing: config.spacing.clamp(1, MAX_SPACING),
            points: Vec::new(),
            rightmost: Vec::new(),
            placed: 0,
            stale: false,
            surface: SurfaceSize::default(),
        }
    }

    /// Forgets every coordinate, including the surface size. Used for a new game.
    pub fn reset(&mut self) {
        *self = Self::new(LayoutConfig {
            spacing: self.spacing,
        });
    }

    pub fn spacing(&self) -> i32 {
        self.spacing
    }

    pub fn surface(&self) -> SurfaceSize {
        self.surface
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// Coordinates of `id`. Only meaningful once [`refresh`](Self::refresh)
    /// has run after the last stale insertion.
    pub fn point(&self, id: NodeId) -> Option<GridPoint> {
        self.points.get(id.index()).copied().flatten()
    }

    /// Lays out a node the tree has just created. Returns the new surface
    /// size if it had to grow.
    pub fn insert(&mut self, tree: &PositionTree, id: NodeId) -> Option<SurfaceSize> {
        if self.stale || self.point(id).is_some() {
            return None;
        }
        // Ids are handed out in creation order, so the fast path applies when
        // every earlier node is placed and `id` ends the pre-order of them.
        if self.placed == id.index() && is_preorder_tail(tree, id) {
            self.place(tree, id);
            self.grow_to(self.point(id))
        } else {
            self.stale = true;
            None
        }
    }

    /// Replays the layout if any insertion could not take the fast path.
    pub fn refresh(&mut self, tree: &PositionTree) -> Option<SurfaceSize> {
        if !self.stale && self.placed == tree.len() {
            return None;
        }
        self.replay(tree)
    }

    fn replay(&mut self, tree: &PositionTree) -> Option<SurfaceSize> {
        self.points.clear();
        self.rightmost.clear();
        self.placed = 0;
        self.stale = false;

        let mut stack = vec![tree.root()];
        while let Some(id) = stack.pop() {
            self.place(tree, id);
            stack.extend(tree.children(id).iter().rev().copied());
        }

        let mut grown = None;
        for point in self.points.clone() {
            if let Some(size) = self.grow_to(point) {
                grown = Some(size);
            }
        }
        grown
    }

    fn place(&mut self, tree: &PositionTree, id: NodeId) {
        let depth = tree.depth(id);
        let mut x = match tree.parent(id) {
            Some(parent) => self.x_of(parent),
            None => 0,
        };
        if tree.parent(id).is_some() {
            for d in [depth, depth + 1] {
                if let Some(Some(r)) = self.rightmost.get(d) {
                    x = x.max(self.x_of(*r).saturating_add(self.spacing));
                }
            }
        }

        if self.points.len() < tree.len() {
            self.points.resize(tree.len(), None);
        }
        self.points[id.index()] = Some(GridPoint {
            x,
            y: i32::try_from(depth)
                .unwrap_or(i32::MAX)
                .saturating_mul(self.spacing),
        });
        if self.rightmost.len() <= depth {
            self.rightmost.resize(depth + 1, None);
        }
        self.rightmost[depth] = Some(id);
        self.placed += 1;

        let mut child = id;
        while let Some(parent) = tree.parent(child) {
            if tree.children(parent).first() != Some(&child) {
                break;
            }
            let cx = self.x_of(child);
            let Some(Some(p)) = self.points.get_mut(parent.index()) else {
                break;
            };
            if p.x >= cx {
                break;
            }
            p.x = cx;
            child = parent;
        }
    }

    fn x_of(&self, id: NodeId) -> i32 {
        self.point(id).map(|p| p.x).unwrap_or(0)
    }

    fn grow_to(&mut self, point: Option<GridPoint>) -> Option<SurfaceSize> {
        let point = point?;
        let width = self.surface.width.max(point.x.saturating_add(self.spacing));
        let height = self.surface.height.max(point.y.saturating_add(self.spacing));
        if width == self.surface.width && height == self.surface.height {
            return None;
        }
        self.surface = SurfaceSize { width, height };
        Some(self.surface)
    }
}

/// True when `id` is the last node in pre-order among the nodes created up
/// to and including it: no ancestor-or-self has an older later sibling.
fn is_preorder_tail(tree: &PositionTree, id: NodeId) -> bool {
    let mut at = id;
    while let Some(parent) = tree.parent(at) {
        let siblings = tree.children(parent);
        let next = siblings
            .iter()
            .position(|c| *c == at)
            .and_then(|i| siblings.get(i + 1));
        if next.is_some_and(|s| s.index() < id.index()) {
            return false;
        }
        at = parent;
    }
    true
}
