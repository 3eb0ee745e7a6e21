//! Plain-text renderers for terminals.
//!
//! Each keeps the last value of the fields it displays and writes a fresh
//! frame on `draw`. Output errors are ignored; a broken pipe must not stall
//! the session loop.

use gobanview_core::Renderer;
use gobanview_protocol::{fields, FieldSet, RenderState};
use serde::Deserialize;
use serde_json::Value;
use std::io::Write;

pub type Output = Box<dyn Write + Send>;

fn touches(fields: &FieldSet, wanted: &[&str]) -> bool {
    wanted.iter().any(|w| fields.contains(*w))
}

pub struct BoardRenderer {
    out: Output,
    stones: Option<String>,
    move_number: Option<u64>,
    to_play: Option<String>,
    current: Option<u64>,
}

impl BoardRenderer {
    pub fn new(out: Output) -> Self {
        Self {
            out,
            stones: None,
            move_number: None,
            to_play: None,
            current: None,
        }
    }
}

impl Renderer for BoardRenderer {
    fn name(&self) -> &str {
        "board"
    }

    fn update(&mut self, fields: &FieldSet, state: &RenderState) -> bool {
        if !touches(fields, &[fields::STONES, fields::MOVE_NUM, fields::TO_PLAY, fields::CURRENT]) {
            return false;
        }
        if let Some(stones) = state.get(fields::STONES).and_then(Value::as_str) {
            self.stones = Some(stones.to_string());
        }
        if let Some(n) = state.get(fields::MOVE_NUM).and_then(Value::as_u64) {
            self.move_number = Some(n);
        }
        if let Some(color) = state.get(fields::TO_PLAY).and_then(Value::as_str) {
            self.to_play = Some(color.to_string());
        }
        if let Some(id) = state.get(fields::CURRENT).and_then(Value::as_u64) {
            self.current = Some(id);
            // A position without a known board must not show the previous one.
            if !fields.contains(fields::STONES) {
                self.stones = None;
            }
        }
        true
    }

    fn draw(&mut self) {
        let header = format!(
            "move {} #{} {} to play",
            self.move_number.unwrap_or(0),
            self.current.unwrap_or(0),
            self.to_play.as_deref().unwrap_or("?"),
        );
        let _ = writeln!(self.out, "{header}");
        match self.stones.as_deref().and_then(board_rows) {
            Some(rows) => {
                for row in rows {
                    let _ = writeln!(self.out, "  {row}");
                }
            }
            None => {
                let _ = writeln!(self.out, "  (board not reported yet)");
            }
        }
        let _ = self.out.flush();
    }
}

/// Splits a flat square cell string into rows.
fn board_rows(cells: &str) -> Option<Vec<String>> {
    let chars: Vec<char> = cells.chars().collect();
    let size = (1..=chars.len()).find(|s| s * s >= chars.len())?;
    if size * size != chars.len() {
        return None;
    }
    Some(
        chars
            .chunks(size)
            .map(|row| {
                row.iter()
                    .map(|c| c.to_string())
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect(),
    )
}

pub struct StatsRenderer {
    out: Output,
    visits: Option<u64>,
    value: Option<f64>,
}

impl StatsRenderer {
    pub fn new(out: Output) -> Self {
        Self {
            out,
            visits: None,
            value: None,
        }
    }
}

impl Renderer for StatsRenderer {
    fn name(&self) -> &str {
        "stats"
    }

    fn update(&mut self, fields: &FieldSet, state: &RenderState) -> bool {
        if !touches(fields, &[fields::VISITS, fields::VALUE, fields::CURRENT]) {
            return false;
        }
        if fields.contains(fields::CURRENT) {
            self.visits = None;
            self.value = None;
        }
        if let Some(v) = state.get(fields::VISITS).and_then(Value::as_u64) {
            self.visits = Some(v);
        }
        if let Some(v) = state.get(fields::VALUE).and_then(Value::as_f64) {
            self.value = Some(v);
        }
        true
    }

    fn draw(&mut self) {
        let visits = self
            .visits
            .map(|v| v.to_string())
            .unwrap_or_else(|| "-".to_string());
        let value = self
            .value
            .map(|v| format!("{:.1}%", v * 100.0))
            .unwrap_or_else(|| "-".to_string());
        let _ = writeln!(self.out, "visits {visits}  value {value}");
        let _ = self.out.flush();
    }
}

/// Table of the engine's candidate moves, most visited first.
pub struct CandidatesRenderer {
    out: Output,
    moves: Vec<String>,
    visits: Vec<u64>,
    values: Vec<f64>,
    limit: usize,
}

impl CandidatesRenderer {
    pub fn new(out: Output, limit: usize) -> Self {
        Self {
            out,
            moves: Vec::new(),
            visits: Vec::new(),
            values: Vec::new(),
            limit,
        }
    }
}

impl Renderer for CandidatesRenderer {
    fn name(&self) -> &str {
        "candidates"
    }

    fn update(&mut self, fields: &FieldSet, state: &RenderState) -> bool {
        let wanted = [
            fields::CHILD_MOVES,
            fields::CHILD_VISITS,
            fields::CHILD_VALUES,
            fields::CURRENT,
        ];
        if !touches(fields, &wanted) {
            return false;
        }
        if fields.contains(fields::CURRENT) {
            self.moves.clear();
            self.visits.clear();
            self.values.clear();
        }
        if let Some(v) = state.get(fields::CHILD_MOVES) {
            self.moves = Vec::<String>::deserialize(v).unwrap_or_default();
        }
        if let Some(v) = state.get(fields::CHILD_VISITS) {
            self.visits = Vec::<u64>::deserialize(v).unwrap_or_default();
        }
        if let Some(v) = state.get(fields::CHILD_VALUES) {
            self.values = Vec::<f64>::deserialize(v).unwrap_or_default();
        }
        true
    }

    fn draw(&mut self) {
        let mut rows: Vec<(&str, Option<u64>, Option<f64>)> = self
            .moves
            .iter()
            .enumerate()
            .map(|(i, mv)| {
                (
                    mv.as_str(),
                    self.visits.get(i).copied(),
                    self.values.get(i).copied(),
                )
            })
            .collect();
        rows.sort_by(|a, b| b.1.cmp(&a.1));
        for (mv, visits, value) in rows.into_iter().take(self.limit) {
            let visits = visits.map(|v| v.to_string()).unwrap_or_else(|| "-".into());
            let value = value
                .map(|v| format!("{:.1}%", v * 100.0))
                .unwrap_or_else(|| "-".into());
            let _ = writeln!(self.out, "  {mv:<6} {visits:>8} {value:>7}");
        }
        let _ = self.out.flush();
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct Topology {
    width: i32,
    height: i32,
    nodes: Vec<TopologyNode>,
}

#[derive(Debug, Clone, Deserialize)]
struct TopologyNode {
    id: u64,
    x: i32,
    y: i32,
    #[serde(default)]
    main: bool,
}

/// Character grid of the variation tree: `*` main line, `o` variations,
/// `@` the current position.
pub struct TreeRenderer {
    out: Output,
    topology: Topology,
    current: Option<u64>,
    max_width: i32,
}

impl TreeRenderer {
    pub fn new(out: Output, max_width: i32) -> Self {
        Self {
            out,
            topology: Topology::default(),
            current: None,
            max_width,
        }
    }
}

impl Renderer for TreeRenderer {
    fn name(&self) -> &str {
        "tree"
    }

    fn update(&mut self, fields: &FieldSet, state: &RenderState) -> bool {
        let mut changed = false;
        if let Some(v) = state.get(fields::TOPOLOGY) {
            if let Ok(topology) = Topology::deserialize(v) {
                self.topology = topology;
                changed = true;
            }
        }
        if fields.contains(fields::CURRENT) {
            self.current = state.get(fields::CURRENT).and_then(Value::as_u64);
            changed = true;
        }
        changed
    }

    fn draw(&mut self) {
        let width = self.topology.width.clamp(0, self.max_width) as usize;
        let height = self.topology.height.max(0) as usize;
        let mut grid = vec![vec![' '; width]; height];
        for node in &self.topology.nodes {
            let (Ok(x), Ok(y)) = (usize::try_from(node.x), usize::try_from(node.y)) else {
                continue;
            };
            let Some(cell) = grid.get_mut(y).and_then(|row| row.get_mut(x)) else {
                continue;
            };
            *cell = if Some(node.id) == self.current {
                '@'
            } else if node.main {
                '*'
            } else {
                'o'
            };
        }
        for row in grid {
            let line: String = row.into_iter().collect();
            let _ = writeln!(self.out, "{}", line.trim_end());
        }
        let _ = self.out.flush();
    }
}
