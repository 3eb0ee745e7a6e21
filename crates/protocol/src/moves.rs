//! Moves and colours, plus GTP vertex text (`D4`, `pass`, `resign`).
//!
//! Vertex text depends on the board size (row numbers count up from the
//! bottom edge), so every conversion takes the size explicitly.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// GTP column letters; `I` is skipped.
const COLUMNS: &[u8; 25] = b"ABCDEFGHJKLMNOPQRSTUVWXYZ";

pub const MAX_BOARD_SIZE: u8 = COLUMNS.len() as u8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    Black,
    White,
}

impl Color {
    pub fn opponent(self) -> Self {
        match self {
            Self::Black => Self::White,
            Self::White => Self::Black,
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "b" | "black" => Some(Self::Black),
            "w" | "white" => Some(Self::White),
            _ => None,
        }
    }

    pub fn as_gtp(self) -> &'static str {
        match self {
            Self::Black => "B",
            Self::White => "W",
        }
    }
}

/// Row 0 is the top edge of the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Point {
    pub row: u8,
    pub col: u8,
}

impl Point {
    pub fn new(row: u8, col: u8) -> Self {
        Self { row, col }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Move {
    Play(Point),
    Pass,
    Resign,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MoveParseError {
    #[error("empty move text")]
    Empty,
    #[error("unsupported board size {0}")]
    BoardSize(u8),
    #[error("bad column in vertex {0:?}")]
    Column(String),
    #[error("bad row in vertex {0:?}")]
    Row(String),
}

impl Move {
    pub fn play(row: u8, col: u8) -> Self {
        Self::Play(Point::new(row, col))
    }

    pub fn point(&self) -> Option<Point> {
        match self {
            Self::Play(p) => Some(*p),
            Self::Pass | Self::Resign => None,
        }
    }

    pub fn parse_gtp(text: &str, size: u8) -> Result<Self, MoveParseError> {
        if size == 0 || size > MAX_BOARD_SIZE {
            return Err(MoveParseError::BoardSize(size));
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(MoveParseError::Empty);
        }
        let upper = text.to_ascii_uppercase();
        match upper.as_str() {
            "PASS" => return Ok(Self::Pass),
            "RESIGN" => return Ok(Self::Resign),
            _ => {}
        }

        let mut chars = upper.chars();
        let letter = chars.next().ok_or(MoveParseError::Empty)?;
        let digits = chars.as_str();
        let col = COLUMNS[..size as usize]
            .iter()
            .position(|&c| c as char == letter)
            .ok_or_else(|| MoveParseError::Column(text.to_string()))?;
        let number: u8 = digits
            .parse()
            .map_err(|_| MoveParseError::Row(text.to_string()))?;
        if number == 0 || number > size {
            return Err(MoveParseError::Row(text.to_string()));
        }
        Ok(Self::play(size - number, col as u8))
    }

    pub fn to_gtp(&self, size: u8) -> String {
        match self {
            Self::Pass => "pass".to_string(),
            Self::Resign => "resign".to_string(),
            Self::Play(p) => {
                let letter = COLUMNS.get(p.col as usize).copied().unwrap_or(b'?') as char;
                format!("{letter}{}", size.saturating_sub(p.row))
            }
        }
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.row, self.col)
    }
}
