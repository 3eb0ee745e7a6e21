use gobanview_protocol::{Color, Point};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BoardParseError {
    #[error("board text has {found} cells, expected {expected}")]
    Length { expected: usize, found: usize },
    #[error("unexpected cell {0:?} in board text")]
    Cell(char),
}

/// Stones on a square board. Cells are row-major, top row first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Board {
    size: u8,
    cells: Vec<Option<Color>>,
}

impl Board {
    pub fn empty(size: u8) -> Self {
        let n = size as usize * size as usize;
        Self {
            size,
            cells: vec![None; n],
        }
    }

    /// Parses `.`/`X`/`O` cells; whitespace is ignored so multi-line
    /// diagrams parse the same as a flat string.
    pub fn parse(size: u8, text: &str) -> Result<Self, BoardParseError> {
        let mut cells = Vec::with_capacity(size as usize * size as usize);
        for c in text.chars().filter(|c| !c.is_whitespace()) {
            cells.push(match c {
                '.' | '+' => None,
                'X' | 'x' | 'B' | 'b' => Some(Color::Black),
                'O' | 'o' | 'W' | 'w' => Some(Color::White),
                other => return Err(BoardParseError::Cell(other)),
            });
        }
        let expected = size as usize * size as usize;
        if cells.len() != expected {
            return Err(BoardParseError::Length {
                expected,
                found: cells.len(),
            });
        }
        Ok(Self { size, cells })
    }

    pub fn size(&self) -> u8 {
        self.size
    }

    pub fn get(&self, point: Point) -> Option<Color> {
        if point.row >= self.size || point.col >= self.size {
            return None;
        }
        self.cells[point.row as usize * self.size as usize + point.col as usize]
    }

    pub fn set(&mut self, point: Point, stone: Option<Color>) {
        if point.row < self.size && point.col < self.size {
            self.cells[point.row as usize * self.size as usize + point.col as usize] = stone;
        }
    }

    pub fn stone_count(&self) -> usize {
        self.cells.iter().filter(|c| c.is_some()).count()
    }

    /// Flat cell string, the inverse of [`Board::parse`].
    pub fn to_text(&self) -> String {
        self.cells.iter().map(|c| cell_char(*c)).collect()
    }

    pub fn rows(&self) -> impl Iterator<Item = &[Option<Color>]> {
        self.cells.chunks(self.size.max(1) as usize)
    }
}

fn cell_char(cell: Option<Color>) -> char {
    match cell {
        None => '.',
        Some(Color::Black) => 'X',
        Some(Color::White) => 'O',
    }
}

impl fmt::Display for Board {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for row in self.rows() {
            let line: String = row.iter().map(|c| cell_char(*c)).collect();
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}
