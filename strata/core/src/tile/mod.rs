mod cell_iter;

pub use cell_iter::{TileCellIter, TileCellRevIter};

use thiserror::Error;

use strata_common::coord_type_go;
use strata_common::datatype::{
    CellValNum, Datatype, VAR_CELL_PREFIX_SIZE,
};
use strata_common::physical::CoordinateType;
use strata_common::range::HyperRect;

#[derive(Clone, Debug, Error, PartialEq)]
pub enum Error {
    #[error("Cell position {pos} out of bounds for a tile of {cell_num} cells")]
    CellOutOfBounds { pos: u64, cell_num: u64 },
    #[error("Operation is only defined for coordinate tiles")]
    NotACoordinateTile,
    #[error("Coordinate tiles require a numeric cell type, found {0}")]
    InvalidCoordinateType(Datatype),
    #[error(
        "Coordinate tiles store one value per dimension: \
         dim_num {dim_num} vs. val_num {val_num}"
    )]
    CoordinateValNum { dim_num: usize, val_num: u32 },
    #[error(
        "Payload of {size} bytes does not divide into cells of {cell_size} bytes"
    )]
    PayloadMisaligned { size: usize, cell_size: usize },
    #[error("Variable cell at offset {offset} overruns the payload of {size} bytes")]
    PayloadOverrun { offset: usize, size: usize },
    #[error("Cell of {found} bytes does not match the cell size {expected}")]
    CellSizeMismatch { expected: usize, found: usize },
    #[error("Variable cell of {found} bytes does not match its length prefix")]
    VarCellLengthMismatch { found: usize },
    #[error("MBR of {found} bytes, expected {expected}")]
    MbrSizeMismatch { expected: usize, found: usize },
    #[error("Range has {found} dimensions but the tile has {expected}")]
    RangeDimensionMismatch { expected: usize, found: usize },
    #[error("Tile stores {datatype} coordinates, not the requested type")]
    CoordinateTypeMismatch { datatype: Datatype },
    #[error("Tile holds no cells")]
    EmptyTile,
    #[error("Datatype error: {0}")]
    Datatype(#[from] strata_common::datatype::Error),
}

/// A tile is either a run of values of one attribute or a run of
/// coordinates.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TileType {
    Attribute,
    Coordinate,
}

/// A fixed-capacity group of cells of one attribute, or of coordinates.
///
/// The payload is a contiguous native-endian byte sequence. Fixed-sized
/// cells pack `cell_num * cell_size` bytes; variable-sized cells each
/// carry a `u32` element count followed by that many values. A coordinate
/// tile (`dim_num > 0`) additionally tracks its minimum bounding
/// rectangle; attribute tiles have `dim_num == 0` and no MBR.
#[derive(Clone, Debug)]
pub struct Tile {
    tile_id: u64,
    dim_num: usize,
    datatype: Datatype,
    val_num: CellValNum,
    cell_num: u64,
    payload: Vec<u8>,
    /// Start offset of each cell. Populated only for variable-sized cells.
    offsets: Vec<usize>,
    /// Flat `(lo, hi, ...)` bytes in the cell type. Coordinate tiles only.
    mbr: Option<Vec<u8>>,
}

impl Tile {
    /// Creates an empty tile. `dim_num == 0` makes an attribute tile;
    /// `dim_num > 0` makes a coordinate tile, which must have a numeric
    /// cell type and exactly one value per dimension.
    pub fn new(
        tile_id: u64,
        dim_num: usize,
        datatype: Datatype,
        val_num: CellValNum,
    ) -> Result<Self, Error> {
        if dim_num > 0 {
            if !datatype.is_coordinate_type() {
                return Err(Error::InvalidCoordinateType(datatype));
            }
            match val_num.fixed() {
                Some(nz) if nz.get() as usize == dim_num => {}
                _ => {
                    return Err(Error::CoordinateValNum {
                        dim_num,
                        val_num: val_num.fixed().map(|n| n.get()).unwrap_or(0),
                    })
                }
            }
        }
        Ok(Tile {
            tile_id,
            dim_num,
            datatype,
            val_num,
            cell_num: 0,
            payload: Vec::new(),
            offsets: Vec::new(),
            mbr: None,
        })
    }

    pub fn tile_id(&self) -> u64 {
        self.tile_id
    }

    pub fn dim_num(&self) -> usize {
        self.dim_num
    }

    pub fn datatype(&self) -> Datatype {
        self.datatype
    }

    pub fn val_num(&self) -> CellValNum {
        self.val_num
    }

    pub fn tile_type(&self) -> TileType {
        if self.dim_num > 0 {
            TileType::Coordinate
        } else {
            TileType::Attribute
        }
    }

    pub fn cell_num(&self) -> u64 {
        self.cell_num
    }

    pub fn tile_size(&self) -> usize {
        self.payload.len()
    }

    pub fn type_size(&self) -> usize {
        self.datatype.size()
    }

    pub fn var_size(&self) -> bool {
        self.val_num.is_var_sized()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Size in bytes of every cell. `None` for variable-sized cells.
    pub fn cell_size(&self) -> Option<usize> {
        self.val_num
            .fixed()
            .map(|nz| nz.get() as usize * self.type_size())
    }

    /// Size in bytes of the cell at `pos`, including the length prefix
    /// for variable-sized cells.
    pub fn cell_size_at(&self, pos: u64) -> Result<usize, Error> {
        match self.cell_size() {
            Some(size) => {
                self.check_pos(pos)?;
                Ok(size)
            }
            None => Ok(self.cell(pos)?.len()),
        }
    }

    fn check_pos(&self, pos: u64) -> Result<(), Error> {
        if pos < self.cell_num {
            Ok(())
        } else {
            Err(Error::CellOutOfBounds {
                pos,
                cell_num: self.cell_num,
            })
        }
    }

    /// The bytes of the cell at `pos`. For variable-sized cells the slice
    /// starts at the length prefix and covers the whole cell.
    pub fn cell(&self, pos: u64) -> Result<&[u8], Error> {
        self.check_pos(pos)?;
        match self.cell_size() {
            Some(size) => {
                let start = pos as usize * size;
                Ok(&self.payload[start..start + size])
            }
            None => {
                let start = self.offsets[pos as usize];
                let end = match self.offsets.get(pos as usize + 1) {
                    Some(next) => *next,
                    None => self.payload.len(),
                };
                Ok(&self.payload[start..end])
            }
        }
    }

    /// The value bytes of the cell at `pos`, with the variable-cell
    /// length prefix stripped.
    pub fn cell_values(&self, pos: u64) -> Result<&[u8], Error> {
        let cell = self.cell(pos)?;
        if self.var_size() {
            Ok(&cell[VAR_CELL_PREFIX_SIZE..])
        } else {
            Ok(cell)
        }
    }

    /// Whether the cell at `pos` is a deletion (tombstone) marker.
    /// An empty variable-sized cell is not a deletion.
    pub fn is_del(&self, pos: u64) -> Result<bool, Error> {
        let values = self.cell_values(pos)?;
        if values.is_empty() {
            return Ok(false);
        }
        Ok(self.datatype.is_del(values)?)
    }

    /// Whether the cell at `pos` is NULL.
    /// An empty variable-sized cell is not NULL.
    pub fn is_null(&self, pos: u64) -> Result<bool, Error> {
        let values = self.cell_values(pos)?;
        if values.is_empty() {
            return Ok(false);
        }
        Ok(self.datatype.is_null(values)?)
    }

    /// The MBR bytes in flat `(lo, hi, ...)` layout, if one was computed
    /// or assigned. Coordinate tiles only.
    pub fn mbr(&self) -> Option<&[u8]> {
        self.mbr.as_deref()
    }

    /// The first and last stored coordinates, which bound the tile's cell
    /// id range under the global order.
    pub fn bounding_coordinates(&self) -> Result<(&[u8], &[u8]), Error> {
        if self.tile_type() != TileType::Coordinate {
            return Err(Error::NotACoordinateTile);
        }
        if self.cell_num == 0 {
            return Err(Error::EmptyTile);
        }
        Ok((self.cell(0)?, self.cell(self.cell_num - 1)?))
    }

    /// Whether the coordinates at `pos` fall inside `range`.
    /// Coordinate tiles only.
    pub fn cell_inside_range<T: CoordinateType>(
        &self,
        pos: u64,
        range: &HyperRect<T>,
    ) -> Result<bool, Error> {
        if self.tile_type() != TileType::Coordinate {
            return Err(Error::NotACoordinateTile);
        }
        if !self.datatype.is_compatible_type::<T>() {
            return Err(Error::CoordinateTypeMismatch {
                datatype: self.datatype,
            });
        }
        if range.dim_num() != self.dim_num {
            return Err(Error::RangeDimensionMismatch {
                expected: self.dim_num,
                found: range.dim_num(),
            });
        }
        Ok(range.contains_bytes(self.cell(pos)?))
    }

    /// Replaces the payload wholesale, deriving the cell count and, for
    /// variable-sized cells, the offset table from the length prefixes.
    /// Does not touch the MBR; see [Tile::set_mbr].
    pub fn set_payload(&mut self, payload: Vec<u8>) -> Result<(), Error> {
        match self.cell_size() {
            Some(size) => {
                if payload.len() % size != 0 {
                    return Err(Error::PayloadMisaligned {
                        size: payload.len(),
                        cell_size: size,
                    });
                }
                self.cell_num = (payload.len() / size) as u64;
                self.offsets.clear();
            }
            None => {
                let mut offsets = Vec::new();
                let mut offset = 0;
                while offset < payload.len() {
                    if offset + VAR_CELL_PREFIX_SIZE > payload.len() {
                        return Err(Error::PayloadOverrun {
                            offset,
                            size: payload.len(),
                        });
                    }
                    let count = u32::from_ne_bytes(
                        payload[offset..offset + VAR_CELL_PREFIX_SIZE]
                            .try_into()
                            .unwrap(),
                    ) as usize;
                    offsets.push(offset);
                    offset += VAR_CELL_PREFIX_SIZE
                        + count * self.type_size();
                }
                if offset != payload.len() {
                    return Err(Error::PayloadOverrun {
                        offset,
                        size: payload.len(),
                    });
                }
                self.cell_num = offsets.len() as u64;
                self.offsets = offsets;
            }
        }
        self.payload = payload;
        Ok(())
    }

    /// Assigns the MBR. Coordinate tiles only; the bytes must hold a
    /// lower and upper value per dimension in the cell type.
    pub fn set_mbr(&mut self, mbr: Vec<u8>) -> Result<(), Error> {
        if self.tile_type() != TileType::Coordinate {
            return Err(Error::NotACoordinateTile);
        }
        let expected = 2 * self.dim_num * self.type_size();
        if mbr.len() != expected {
            return Err(Error::MbrSizeMismatch {
                expected,
                found: mbr.len(),
            });
        }
        self.mbr = Some(mbr);
        Ok(())
    }

    /// Appends one cell. For a coordinate tile the MBR expands to cover
    /// the new coordinates.
    pub fn push_cell(&mut self, cell: &[u8]) -> Result<(), Error> {
        match self.cell_size() {
            Some(size) => {
                if cell.len() != size {
                    return Err(Error::CellSizeMismatch {
                        expected: size,
                        found: cell.len(),
                    });
                }
            }
            None => {
                if cell.len() < VAR_CELL_PREFIX_SIZE {
                    return Err(Error::VarCellLengthMismatch {
                        found: cell.len(),
                    });
                }
                let count = u32::from_ne_bytes(
                    cell[..VAR_CELL_PREFIX_SIZE].try_into().unwrap(),
                ) as usize;
                if cell.len()
                    != VAR_CELL_PREFIX_SIZE + count * self.type_size()
                {
                    return Err(Error::VarCellLengthMismatch {
                        found: cell.len(),
                    });
                }
                self.offsets.push(self.payload.len());
            }
        }

        if self.tile_type() == TileType::Coordinate {
            self.expand_mbr(cell);
        }

        self.payload.extend_from_slice(cell);
        self.cell_num += 1;
        Ok(())
    }

    fn expand_mbr(&mut self, coords: &[u8]) {
        coord_type_go!(
            self.datatype,
            DT,
            {
                let mut mbr = match self.mbr.take() {
                    Some(bytes) => strata_common::physical::decode_iter::<DT>(
                        &bytes,
                    )
                    .collect::<Vec<_>>(),
                    None => Vec::new(),
                };
                let decoded =
                    strata_common::physical::decode_iter::<DT>(coords)
                        .collect::<Vec<_>>();
                strata_common::range::expand_mbr(&mut mbr, &decoded);
                self.mbr =
                    Some(strata_common::physical::encode_values(&mbr));
            },
            // Non-coordinate datatypes are rejected at construction.
            unreachable!()
        )
    }

    /// Pre-allocates payload space for `n` fixed-sized cells. A no-op for
    /// variable-sized cells, whose total size is unknown up front.
    pub fn reserve_cells(&mut self, n: u64) {
        if let Some(size) = self.cell_size() {
            self.payload.reserve(n as usize * size);
        }
    }

    /// Drops all cells and the MBR, keeping the tile's identity.
    pub fn clear(&mut self) {
        self.cell_num = 0;
        self.payload.clear();
        self.offsets.clear();
        self.mbr = None;
    }

    /// A cursor at the first cell.
    pub fn begin(&self) -> TileCellIter<'_> {
        TileCellIter::new(self, 0)
    }

    /// The forward end sentinel.
    pub fn end() -> TileCellIter<'static> {
        TileCellIter::default()
    }

    /// A cursor at the last cell, walking backwards.
    pub fn rbegin(&self) -> TileCellRevIter<'_> {
        TileCellRevIter::new(self, self.cell_num as i64 - 1)
    }

    /// The reverse end sentinel.
    pub fn rend() -> TileCellRevIter<'static> {
        TileCellRevIter::default()
    }
}

#[cfg(test)]
mod tests {
    use strata_common::physical::encode_values;

    use super::*;

    fn coord_tile(cells: &[[i32; 2]]) -> Tile {
        let mut tile =
            Tile::new(0, 2, Datatype::Int32, CellValNum::try_from(2).unwrap())
                .unwrap();
        for c in cells {
            tile.push_cell(&encode_values(c)).unwrap();
        }
        tile
    }

    fn var_cell(values: &[u8]) -> Vec<u8> {
        let mut cell = (values.len() as u32).to_ne_bytes().to_vec();
        cell.extend_from_slice(values);
        cell
    }

    #[test]
    fn fixed_cells_pack_contiguously() {
        let mut tile =
            Tile::new(7, 0, Datatype::Int32, CellValNum::single()).unwrap();
        tile.push_cell(&encode_values(&[10i32])).unwrap();
        tile.push_cell(&encode_values(&[20i32])).unwrap();

        assert_eq!(7, tile.tile_id());
        assert_eq!(TileType::Attribute, tile.tile_type());
        assert_eq!(2, tile.cell_num());
        assert_eq!(8, tile.tile_size());
        assert_eq!(Some(4), tile.cell_size());
        assert_eq!(encode_values(&[20i32]), tile.cell(1).unwrap());
        assert!(matches!(
            tile.cell(2),
            Err(Error::CellOutOfBounds { pos: 2, cell_num: 2 })
        ));
    }

    #[test]
    fn fixed_tile_size_invariant() {
        let tile = coord_tile(&[[1, 1], [1, 2], [2, 1]]);
        assert_eq!(
            tile.tile_size(),
            tile.cell_num() as usize * tile.cell_size().unwrap()
        );
    }

    #[test]
    fn coordinate_tile_validation() {
        assert!(matches!(
            Tile::new(0, 2, Datatype::Char, CellValNum::try_from(2).unwrap()),
            Err(Error::InvalidCoordinateType(Datatype::Char))
        ));
        assert!(matches!(
            Tile::new(0, 2, Datatype::Int32, CellValNum::single()),
            Err(Error::CoordinateValNum { .. })
        ));
        assert!(matches!(
            Tile::new(0, 2, Datatype::Int32, CellValNum::Var),
            Err(Error::CoordinateValNum { .. })
        ));
    }

    #[test]
    fn mbr_tracks_pushed_coordinates() {
        let tile = coord_tile(&[[1, 4], [3, 2], [2, 5]]);
        assert_eq!(
            encode_values(&[1i32, 3, 2, 5]),
            tile.mbr().unwrap().to_vec()
        );

        let (first, last) = tile.bounding_coordinates().unwrap();
        assert_eq!(encode_values(&[1i32, 4]), first);
        assert_eq!(encode_values(&[2i32, 5]), last);
    }

    #[test]
    fn attribute_tiles_have_no_mbr() {
        let mut tile =
            Tile::new(0, 0, Datatype::Int32, CellValNum::single()).unwrap();
        tile.push_cell(&encode_values(&[1i32])).unwrap();
        assert!(tile.mbr().is_none());
        assert!(matches!(
            tile.bounding_coordinates(),
            Err(Error::NotACoordinateTile)
        ));
        assert!(matches!(
            tile.set_mbr(vec![0; 16]),
            Err(Error::NotACoordinateTile)
        ));
    }

    #[test]
    fn var_cells_carry_length_prefixes() {
        let mut tile =
            Tile::new(0, 0, Datatype::Char, CellValNum::Var).unwrap();
        tile.push_cell(&var_cell(b"ab")).unwrap();
        tile.push_cell(&var_cell(b"")).unwrap();
        tile.push_cell(&var_cell(b"wxyz")).unwrap();

        assert_eq!(3, tile.cell_num());
        assert_eq!(None, tile.cell_size());
        assert_eq!(var_cell(b"ab"), tile.cell(0).unwrap());
        assert_eq!(b"wxyz", tile.cell_values(2).unwrap());
        assert_eq!(4 + 2, tile.cell_size_at(0).unwrap());
        assert_eq!(4, tile.cell_size_at(1).unwrap());

        // the var-size accounting invariant
        let total: usize = (0..tile.cell_num())
            .map(|pos| tile.cell_size_at(pos).unwrap())
            .sum();
        assert_eq!(tile.tile_size(), total);
    }

    #[test]
    fn var_payload_ingestion_validates_offsets() {
        let mut tile =
            Tile::new(0, 0, Datatype::Char, CellValNum::Var).unwrap();
        let mut payload = var_cell(b"hello");
        payload.extend_from_slice(&var_cell(b"hi"));
        tile.set_payload(payload).unwrap();
        assert_eq!(2, tile.cell_num());
        assert_eq!(b"hi", tile.cell_values(1).unwrap());

        // a truncated trailing cell is rejected
        let mut bad = var_cell(b"hello");
        bad.extend_from_slice(&3u32.to_ne_bytes());
        bad.push(b'x');
        assert!(matches!(
            tile.set_payload(bad),
            Err(Error::PayloadOverrun { .. })
        ));
    }

    #[test]
    fn fixed_payload_ingestion_validates_alignment() {
        let mut tile =
            Tile::new(0, 0, Datatype::Int32, CellValNum::single()).unwrap();
        tile.set_payload(encode_values(&[1i32, 2, 3])).unwrap();
        assert_eq!(3, tile.cell_num());
        assert!(matches!(
            tile.set_payload(vec![0u8; 6]),
            Err(Error::PayloadMisaligned { .. })
        ));
    }

    #[test]
    fn deletion_and_null_probes() {
        let mut tile =
            Tile::new(0, 0, Datatype::Int32, CellValNum::single()).unwrap();
        tile.push_cell(&encode_values(&[5i32])).unwrap();
        tile.push_cell(&Datatype::Int32.del_cell(1)).unwrap();
        tile.push_cell(&encode_values(&[i32::MAX])).unwrap();

        assert!(!tile.is_del(0).unwrap());
        assert!(tile.is_del(1).unwrap());
        assert!(!tile.is_null(1).unwrap());
        assert!(tile.is_null(2).unwrap());
    }

    #[test]
    fn range_membership() {
        let tile = coord_tile(&[[1, 1], [1, 2], [2, 1], [2, 2]]);
        let range =
            HyperRect::new(vec![[1i32, 2], [2, 2]]).unwrap();
        assert!(!tile.cell_inside_range(0, &range).unwrap());
        assert!(tile.cell_inside_range(1, &range).unwrap());
        assert!(!tile.cell_inside_range(2, &range).unwrap());
        assert!(tile.cell_inside_range(3, &range).unwrap());

        let bad = HyperRect::new(vec![[1i32, 2]]).unwrap();
        assert!(matches!(
            tile.cell_inside_range(0, &bad),
            Err(Error::RangeDimensionMismatch { .. })
        ));
    }

    #[test]
    fn every_cell_lies_in_the_mbr() {
        let tile = coord_tile(&[[4, 7], [1, 9], [3, 3], [8, 2]]);
        let mbr = strata_common::physical::decode_iter::<i32>(
            tile.mbr().unwrap(),
        )
        .collect::<Vec<_>>();
        let rect = HyperRect::<i32>::from_flat(&mbr).unwrap();
        for pos in 0..tile.cell_num() {
            assert!(tile.cell_inside_range(pos, &rect).unwrap());
        }
    }
}
