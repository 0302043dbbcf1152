//! Deterministic xterm-256 color assignment for result dimensions.
//!
//! Codes come from the 6x6x6 color cube: `code = column + row * 36` with
//! `row` in `0..=5` and `column` in `16..=51`. The walk steps two columns at a
//! time and two rows on column wrap, skipping columns whose hues are reserved
//! for status colors.

use std::collections::{BTreeMap, HashSet};

use super::control_run::ControlRun;
use super::errors::DimensionColorError;

pub const MIN_ROW: u8 = 0;
pub const MAX_ROW: u8 = 5;
pub const MIN_COLUMN: u8 = 16;
pub const MAX_COLUMN: u8 = 51;
pub const DEFAULT_START_ROW: u8 = 4;
pub const DEFAULT_START_COLUMN: u8 = 27;

const COLUMN_STEP: u8 = 2;
const ROW_STEP: u8 = 2;
const COLUMNS_PER_ROW: u8 = MAX_COLUMN - MIN_COLUMN + 1;

/// Columns with no blue component read as red, yellow or green.
pub const FORBIDDEN_COLUMNS: [u8; 12] = [16, 17, 22, 23, 28, 29, 34, 35, 40, 41, 46, 47];

/// `dimension key -> dimension value -> color code`.
pub type DimensionColorMap = BTreeMap<String, BTreeMap<String, u8>>;

#[derive(Debug, Clone)]
pub struct DimensionColorGenerator {
    start_row: u8,
    start_column: u8,
    row: u8,
    column: u8,
    allocated: HashSet<u8>,
    map: DimensionColorMap,
}

impl Default for DimensionColorGenerator {
    fn default() -> Self {
        Self {
            start_row: DEFAULT_START_ROW,
            start_column: DEFAULT_START_COLUMN,
            row: DEFAULT_START_ROW,
            column: DEFAULT_START_COLUMN,
            allocated: HashSet::new(),
            map: DimensionColorMap::new(),
        }
    }
}

impl DimensionColorGenerator {
    pub fn new(start_row: u8, start_column: u8) -> Result<Self, DimensionColorError> {
        if !(MIN_ROW..=MAX_ROW).contains(&start_row) {
            return Err(DimensionColorError::RowOutOfRange(start_row));
        }
        if !(MIN_COLUMN..=MAX_COLUMN).contains(&start_column) {
            return Err(DimensionColorError::ColumnOutOfRange(start_column));
        }
        Ok(Self {
            start_row,
            start_column,
            row: start_row,
            column: start_column,
            ..Self::default()
        })
    }

    /// Next free color. Once the walk is back at its start every color is
    /// released and reuse begins.
    pub fn next_color(&mut self) -> u8 {
        loop {
            self.advance();
            if self.row == self.start_row && self.column == self.start_column {
                self.allocated.clear();
            }
            if FORBIDDEN_COLUMNS.contains(&self.column) {
                continue;
            }
            let code = self.column + self.row * 36;
            if self.allocated.insert(code) {
                return code;
            }
        }
    }

    /// Assign a color to every unseen dimension value, walking rows in document order.
    pub fn populate<'a>(&mut self, runs: impl IntoIterator<Item = &'a ControlRun>) {
        for run in runs {
            run.with_rows(|rows| {
                for dimension in rows.iter().flat_map(|row| row.dimensions.iter()) {
                    let seen = self
                        .map
                        .get(&dimension.key)
                        .is_some_and(|values| values.contains_key(&dimension.value));
                    if seen {
                        continue;
                    }
                    let color = self.next_color();
                    self.map
                        .entry(dimension.key.clone())
                        .or_default()
                        .insert(dimension.value.clone(), color);
                }
            });
        }
    }

    pub fn map(&self) -> &DimensionColorMap {
        &self.map
    }

    pub fn into_map(self) -> DimensionColorMap {
        self.map
    }

    fn advance(&mut self) {
        self.column += COLUMN_STEP;
        if self.column > MAX_COLUMN {
            self.column -= COLUMNS_PER_ROW;
            self.row += ROW_STEP;
            if self.row > MAX_ROW {
                // Alternate parity so both row sets are visited.
                self.row = if (self.row - MAX_ROW - 1) % 2 == 0 { 1 } else { 0 };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_color_follows_the_start() {
        let mut generator = DimensionColorGenerator::default();
        assert_eq!(generator.next_color(), 31 + 4 * 36);
    }

    #[test]
    fn rejects_out_of_range_start() {
        assert_eq!(
            DimensionColorGenerator::new(6, 20).unwrap_err(),
            DimensionColorError::RowOutOfRange(6)
        );
        assert_eq!(
            DimensionColorGenerator::new(0, 52).unwrap_err(),
            DimensionColorError::ColumnOutOfRange(52)
        );
        let mut corner = DimensionColorGenerator::new(MIN_ROW, MIN_COLUMN).unwrap();
        assert_eq!(corner.next_color(), 18);
    }

    #[test]
    fn colors_are_unique_until_palette_cycles() {
        let mut generator = DimensionColorGenerator::default();
        let mut seen = HashSet::new();
        // 12 permitted odd columns on each of 6 rows.
        for _ in 0..72 {
            let code = generator.next_color();
            assert!(seen.insert(code), "duplicate color {code}");
            let column = (code - MIN_COLUMN) % 36 + MIN_COLUMN;
            assert!(!FORBIDDEN_COLUMNS.contains(&column));
        }
        assert!(seen.contains(&generator.next_color()));
    }

    #[test]
    fn walk_is_deterministic() {
        let mut left = DimensionColorGenerator::new(2, 20).unwrap();
        let mut right = DimensionColorGenerator::new(2, 20).unwrap();
        let left: Vec<u8> = (0..40).map(|_| left.next_color()).collect();
        let right: Vec<u8> = (0..40).map(|_| right.next_color()).collect();
        assert_eq!(left, right);
    }
}
