use strata_common::physical::CoordinateType;
use strata_common::range::HyperRect;

use super::{Error, Tile};

/// A forward cursor over the cells of one tile.
///
/// The cursor observes the tile: dereferencing yields a slice into the
/// tile payload and never copies cell bytes. Positions run from `0` to
/// `cell_num`; any position outside `[0, cell_num)` is the end state.
#[derive(Clone, Copy, Debug)]
pub struct TileCellIter<'a> {
    tile: Option<&'a Tile>,
    pos: i64,
    end: bool,
}

/// A reverse cursor over the cells of one tile.
///
/// Identical to [TileCellIter] except that stepping decrements the
/// position, from `cell_num - 1` down to the `-1` sentinel.
#[derive(Clone, Copy, Debug)]
pub struct TileCellRevIter<'a> {
    tile: Option<&'a Tile>,
    pos: i64,
    end: bool,
}

macro_rules! tile_cell_iter_common {
    ($Iter:ident) => {
        /// The end sentinel: no tile, position `-1`.
        impl Default for $Iter<'_> {
            fn default() -> Self {
                $Iter {
                    tile: None,
                    pos: -1,
                    end: true,
                }
            }
        }

        impl<'a> $Iter<'a> {
            pub fn new(tile: &'a Tile, pos: i64) -> Self {
                let end = pos < 0 || pos >= tile.cell_num() as i64;
                $Iter {
                    tile: Some(tile),
                    pos,
                    end,
                }
            }

            pub fn end(&self) -> bool {
                self.end
            }

            pub fn pos(&self) -> i64 {
                self.pos
            }

            pub fn tile(&self) -> Option<&'a Tile> {
                self.tile
            }

            pub fn cell_num(&self) -> i64 {
                self.tile.map(|t| t.cell_num() as i64).unwrap_or(0)
            }

            pub fn tile_id(&self) -> Option<u64> {
                self.tile.map(Tile::tile_id)
            }

            /// The bytes of the current cell, or `None` at the end.
            pub fn cell(&self) -> Option<&'a [u8]> {
                if self.end {
                    return None;
                }
                // In-bounds by the `end` invariant.
                self.tile.and_then(|t| t.cell(self.pos as u64).ok())
            }

            /// Size of the current cell, including the length prefix for
            /// variable-sized cells.
            pub fn cell_size(&self) -> Result<usize, Error> {
                match (self.tile, self.end) {
                    (Some(tile), false) => {
                        tile.cell_size_at(self.pos as u64)
                    }
                    _ => Err(Error::CellOutOfBounds {
                        pos: self.pos.max(0) as u64,
                        cell_num: self.cell_num() as u64,
                    }),
                }
            }

            pub fn is_del(&self) -> Result<bool, Error> {
                match (self.tile, self.end) {
                    (Some(tile), false) => tile.is_del(self.pos as u64),
                    _ => Err(Error::CellOutOfBounds {
                        pos: self.pos.max(0) as u64,
                        cell_num: self.cell_num() as u64,
                    }),
                }
            }

            pub fn is_null(&self) -> Result<bool, Error> {
                match (self.tile, self.end) {
                    (Some(tile), false) => tile.is_null(self.pos as u64),
                    _ => Err(Error::CellOutOfBounds {
                        pos: self.pos.max(0) as u64,
                        cell_num: self.cell_num() as u64,
                    }),
                }
            }

            /// Whether the current coordinates fall inside `range`;
            /// defers to the owning tile.
            pub fn cell_inside_range<T: CoordinateType>(
                &self,
                range: &HyperRect<T>,
            ) -> Result<bool, Error> {
                match (self.tile, self.end) {
                    (Some(tile), false) => {
                        tile.cell_inside_range(self.pos as u64, range)
                    }
                    _ => Err(Error::CellOutOfBounds {
                        pos: self.pos.max(0) as u64,
                        cell_num: self.cell_num() as u64,
                    }),
                }
            }

            fn update_end(&mut self) {
                self.end = match self.tile {
                    Some(tile) => {
                        self.pos < 0 || self.pos >= tile.cell_num() as i64
                    }
                    None => true,
                };
            }
        }

        /// Cursors are equal when they observe the same tile at the same
        /// position.
        impl PartialEq for $Iter<'_> {
            fn eq(&self, other: &Self) -> bool {
                let same_tile = match (self.tile, other.tile) {
                    (Some(a), Some(b)) => std::ptr::eq(a, b),
                    (None, None) => true,
                    _ => false,
                };
                same_tile && self.pos == other.pos
            }
        }

        impl Eq for $Iter<'_> {}
    };
}

tile_cell_iter_common!(TileCellIter);
tile_cell_iter_common!(TileCellRevIter);

impl TileCellIter<'_> {
    /// Steps to the next cell.
    pub fn advance(&mut self) {
        self.pos += 1;
        self.update_end();
    }

    /// Seeks forward by `step` cells.
    pub fn seek(&mut self, step: i64) {
        self.pos += step;
        self.update_end();
    }

    /// A new cursor `step` cells ahead.
    pub fn offset(&self, step: i64) -> Self {
        let mut it = *self;
        it.seek(step);
        it
    }
}

impl TileCellRevIter<'_> {
    /// Steps to the previous cell.
    pub fn advance(&mut self) {
        self.pos -= 1;
        self.update_end();
    }

    /// Seeks backward by `step` cells.
    pub fn seek(&mut self, step: i64) {
        self.pos -= step;
        self.update_end();
    }

    /// A new cursor `step` cells back.
    pub fn offset(&self, step: i64) -> Self {
        let mut it = *self;
        it.seek(step);
        it
    }
}

#[cfg(test)]
mod tests {
    use strata_common::datatype::{CellValNum, Datatype};
    use strata_common::physical::encode_values;

    use super::*;

    fn tile_123() -> Tile {
        let mut tile =
            Tile::new(0, 0, Datatype::Int32, CellValNum::single()).unwrap();
        for v in [1i32, 2, 3] {
            tile.push_cell(&encode_values(&[v])).unwrap();
        }
        tile
    }

    #[test]
    fn forward_walk() {
        let tile = tile_123();
        let mut it = tile.begin();
        let mut seen = Vec::new();
        while let Some(cell) = it.cell() {
            seen.push(i32::from_ne_bytes(cell.try_into().unwrap()));
            it.advance();
        }
        assert_eq!(vec![1, 2, 3], seen);
        assert!(it.end());
    }

    #[test]
    fn reverse_walk() {
        let tile = tile_123();
        let mut it = tile.rbegin();
        let mut seen = Vec::new();
        while let Some(cell) = it.cell() {
            seen.push(i32::from_ne_bytes(cell.try_into().unwrap()));
            it.advance();
        }
        assert_eq!(vec![3, 2, 1], seen);
        assert!(it.end());
    }

    #[test]
    fn seek_and_offset() {
        let tile = tile_123();
        let mut it = tile.begin();
        it.seek(2);
        assert_eq!(2, it.pos());
        assert!(!it.end());

        let past = it.offset(1);
        assert!(past.end());
        assert!(past.cell().is_none());

        let mut rit = tile.rbegin();
        rit.seek(2);
        assert_eq!(0, rit.pos());
        assert!(rit.offset(1).end());
    }

    #[test]
    fn equality_is_tile_and_pos() {
        let tile = tile_123();
        let other = tile_123();
        assert_eq!(tile.begin(), tile.begin());
        assert_ne!(tile.begin(), tile.begin().offset(1));
        assert_ne!(tile.begin(), other.begin());
        assert_eq!(Tile::end(), Tile::end());
    }

    #[test]
    fn end_cursor_accessors_are_errors() {
        let it = Tile::end();
        assert!(it.cell().is_none());
        assert!(it.cell_size().is_err());
        assert!(it.is_del().is_err());
    }

    #[test]
    fn empty_tile_begins_at_end() {
        let tile =
            Tile::new(0, 0, Datatype::Int32, CellValNum::single()).unwrap();
        assert!(tile.begin().end());
        assert!(tile.rbegin().end());
    }
}
