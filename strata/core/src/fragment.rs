use thiserror::Error;

use strata_common::datatype::{CellValNum, VAR_CELL_PREFIX_SIZE};
use strata_common::physical::{encode_values, CoordinateType};
use strata_common::schema::{ArraySchema, Tiling};

use crate::tile::{Tile, TileType};

#[derive(Clone, Debug, Error, PartialEq)]
pub enum Error {
    #[error("A fragment requires a coordinate tile column")]
    NoCoordinateColumn,
    #[error(
        "Attribute {attribute_id} has {found} tiles but the coordinate \
         column has {expected}"
    )]
    TileCountMismatch {
        attribute_id: usize,
        expected: usize,
        found: usize,
    },
    #[error("Attribute {attribute_id} tile at position {pos} has a foreign tile id")]
    TileIdMismatch { attribute_id: usize, pos: usize },
    #[error(
        "Attribute {attribute_id} tile at position {pos} disagrees with the \
         coordinate tile on cell count"
    )]
    CellCountMismatch { attribute_id: usize, pos: usize },
    #[error("Coordinate tile ids decrease at position {pos}")]
    NonMonotonicTileIds { pos: usize },
    #[error("Column {attribute_id} holds the wrong tile type at position {pos}")]
    WrongTileType { attribute_id: usize, pos: usize },
    #[error("Cells must be written in the global cell order")]
    WriteOutOfOrder,
    #[error("Coordinates fall outside the schema domain")]
    CoordsOutOfDomain,
    #[error("Expected {expected} attribute values, found {found}")]
    AttributeCountMismatch { expected: usize, found: usize },
    #[error("Expected {expected} coordinates, found {found}")]
    CoordinateDimensionMismatch { expected: usize, found: usize },
    #[error("Schema error: {0}")]
    Schema(#[from] strata_common::schema::Error),
    #[error("Tile error: {0}")]
    Tile(#[from] crate::tile::Error),
}

/// One immutable write batch: an ordered tile sequence per attribute plus
/// one coordinate tile stream, indexed as pseudo attribute
/// `attribute_num`.
///
/// Construction checks the cross-column invariants the iterators rely on:
/// every column has the same tile count, tiles at the same position share
/// a tile id and cell count, and coordinate tile ids never decrease.
#[derive(Clone, Debug)]
pub struct Fragment {
    /// `tiles[attribute_id][pos]`; the last column holds coordinates.
    tiles: Vec<Vec<Tile>>,
}

impl Fragment {
    pub fn new(tiles: Vec<Vec<Tile>>) -> Result<Self, Error> {
        let Some(coords) = tiles.last() else {
            return Err(Error::NoCoordinateColumn);
        };

        for (pos, tile) in coords.iter().enumerate() {
            if tile.tile_type() != TileType::Coordinate {
                return Err(Error::WrongTileType {
                    attribute_id: tiles.len() - 1,
                    pos,
                });
            }
            if pos > 0 && tile.tile_id() < coords[pos - 1].tile_id() {
                return Err(Error::NonMonotonicTileIds { pos });
            }
        }

        for (attribute_id, column) in
            tiles[..tiles.len() - 1].iter().enumerate()
        {
            if column.len() != coords.len() {
                return Err(Error::TileCountMismatch {
                    attribute_id,
                    expected: coords.len(),
                    found: column.len(),
                });
            }
            for (pos, (tile, coord_tile)) in
                column.iter().zip(coords.iter()).enumerate()
            {
                if tile.tile_type() != TileType::Attribute {
                    return Err(Error::WrongTileType { attribute_id, pos });
                }
                if tile.tile_id() != coord_tile.tile_id() {
                    return Err(Error::TileIdMismatch { attribute_id, pos });
                }
                if tile.cell_num() != coord_tile.cell_num() {
                    return Err(Error::CellCountMismatch {
                        attribute_id,
                        pos,
                    });
                }
            }
        }

        Ok(Fragment { tiles })
    }

    pub fn attribute_num(&self) -> usize {
        self.tiles.len() - 1
    }

    /// Number of tiles per column.
    pub fn tile_num(&self) -> usize {
        self.tiles.last().map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.tile_num() == 0
    }

    /// The tile of column `attribute_id` at ordinal position `pos`.
    pub fn tile(&self, attribute_id: usize, pos: usize) -> Option<&Tile> {
        self.tiles.get(attribute_id).and_then(|col| col.get(pos))
    }

    /// A forward ordinal cursor over the tiles of one column.
    pub fn begin(&self, attribute_id: usize) -> FragmentTileIter<'_> {
        FragmentTileIter::new(self, attribute_id, 0)
    }

    /// A reverse ordinal cursor over the tiles of one column.
    pub fn rbegin(&self, attribute_id: usize) -> FragmentTileRevIter<'_> {
        FragmentTileRevIter::new(
            self,
            attribute_id,
            self.tile_num() as i64 - 1,
        )
    }
}

macro_rules! fragment_tile_iter_common {
    ($Iter:ident) => {
        /// An ordinal cursor over the tiles of one `(fragment, attribute)`
        /// column. Metadata accessors (`tile_id`, `mbr`,
        /// `bounding_coordinates`) are cheap and do not require payload
        /// access; seeking is O(1).
        #[derive(Clone, Copy, Debug, Default)]
        pub struct $Iter<'a> {
            fragment: Option<&'a Fragment>,
            attribute_id: usize,
            pos: i64,
        }

        impl<'a> $Iter<'a> {
            pub fn new(
                fragment: &'a Fragment,
                attribute_id: usize,
                pos: i64,
            ) -> Self {
                $Iter {
                    fragment: Some(fragment),
                    attribute_id,
                    pos,
                }
            }

            pub fn pos(&self) -> i64 {
                self.pos
            }

            pub fn attribute_id(&self) -> usize {
                self.attribute_id
            }

            pub fn tile_num(&self) -> i64 {
                self.fragment.map(|f| f.tile_num() as i64).unwrap_or(0)
            }

            pub fn end(&self) -> bool {
                self.pos < 0 || self.pos >= self.tile_num()
            }

            /// The tile under the cursor, or `None` at the end.
            ///
            /// The reference borrows from the fragment, not the cursor,
            /// so it stays valid while the cursor advances; callers must
            /// still not retain it across a storage-manager reload of
            /// the fragment.
            pub fn tile(&self) -> Option<&'a Tile> {
                if self.end() {
                    return None;
                }
                self.fragment
                    .and_then(|f| f.tile(self.attribute_id, self.pos as usize))
            }

            pub fn tile_id(&self) -> Option<u64> {
                self.tile().map(Tile::tile_id)
            }

            pub fn mbr(&self) -> Option<&'a [u8]> {
                self.tile().and_then(Tile::mbr)
            }

            pub fn bounding_coordinates(
                &self,
            ) -> Option<(&'a [u8], &'a [u8])> {
                self.tile().and_then(|t| t.bounding_coordinates().ok())
            }
        }

        impl PartialEq for $Iter<'_> {
            fn eq(&self, other: &Self) -> bool {
                let same_fragment = match (self.fragment, other.fragment) {
                    (Some(a), Some(b)) => std::ptr::eq(a, b),
                    (None, None) => true,
                    _ => false,
                };
                same_fragment
                    && self.attribute_id == other.attribute_id
                    && self.pos == other.pos
            }
        }

        impl Eq for $Iter<'_> {}
    };
}

fragment_tile_iter_common!(FragmentTileIter);
fragment_tile_iter_common!(FragmentTileRevIter);

impl FragmentTileIter<'_> {
    pub fn advance(&mut self) {
        self.pos += 1;
    }

    pub fn seek(&mut self, step: i64) {
        self.pos += step;
    }

    pub fn offset(&self, step: i64) -> Self {
        let mut it = *self;
        it.seek(step);
        it
    }
}

impl FragmentTileRevIter<'_> {
    pub fn advance(&mut self) {
        self.pos -= 1;
    }

    pub fn seek(&mut self, step: i64) {
        self.pos -= step;
    }

    pub fn offset(&self, step: i64) -> Self {
        let mut it = *self;
        it.seek(step);
        it
    }
}

/// Builds one fragment from cells arriving in the global cell order.
///
/// Irregular tiling cuts a new tile every `capacity` cells with
/// monotonically assigned tile ids; regular tiling cuts whenever the
/// deterministic tile id of the incoming coordinates changes.
pub struct FragmentWriter<'s, T: CoordinateType> {
    schema: &'s ArraySchema,
    domain: strata_common::range::HyperRect<T>,
    staged: Vec<Vec<Tile>>,
    current: Option<Vec<Tile>>,
    current_tile_id: u64,
    next_irregular_id: u64,
    last_coords: Option<Vec<u8>>,
}

impl<'s, T: CoordinateType> FragmentWriter<'s, T> {
    pub fn new(schema: &'s ArraySchema) -> Result<Self, Error> {
        if !schema.coord_type().is_compatible_type::<T>() {
            return Err(Error::Schema(
                strata_common::schema::Error::CoordinateTypeMismatch(
                    schema.coord_type(),
                ),
            ));
        }
        let domain = schema
            .domain_rect::<T>()
            .map_err(|_| Error::CoordsOutOfDomain)?;
        Ok(FragmentWriter {
            schema,
            domain,
            staged: vec![Vec::new(); schema.attribute_num() + 1],
            current: None,
            current_tile_id: 0,
            next_irregular_id: 0,
            last_coords: None,
        })
    }

    /// Appends one cell. `attrs` holds the encoded cell bytes of each
    /// attribute in schema order (length prefix included for var cells).
    pub fn write_cell(
        &mut self,
        coords: &[T],
        attrs: &[&[u8]],
    ) -> Result<(), Error> {
        if attrs.len() != self.schema.attribute_num() {
            return Err(Error::AttributeCountMismatch {
                expected: self.schema.attribute_num(),
                found: attrs.len(),
            });
        }
        let attrs = attrs.iter().map(|a| a.to_vec()).collect();
        self.write_raw(coords, attrs)
    }

    /// Appends a tombstone: every attribute is set to its deletion
    /// marker (one marker element for var-sized attributes).
    pub fn write_deletion(&mut self, coords: &[T]) -> Result<(), Error> {
        let attrs = self
            .schema
            .attributes()
            .iter()
            .map(|a| match a.val_num {
                CellValNum::Fixed(nz) => {
                    a.datatype.del_cell(nz.get() as usize)
                }
                CellValNum::Var => {
                    let mut cell = 1u32.to_ne_bytes().to_vec();
                    cell.extend_from_slice(&a.datatype.del_cell(1));
                    cell
                }
            })
            .collect();
        self.write_raw(coords, attrs)
    }

    fn write_raw(
        &mut self,
        coords: &[T],
        attrs: Vec<Vec<u8>>,
    ) -> Result<(), Error> {
        if coords.len() != self.schema.dim_num() {
            return Err(Error::CoordinateDimensionMismatch {
                expected: self.schema.dim_num(),
                found: coords.len(),
            });
        }
        if !self.domain.contains(coords) {
            return Err(Error::CoordsOutOfDomain);
        }
        let coords_bytes = encode_values(coords);
        let tile_id = self.schema.tile_id::<T>(&coords_bytes);

        // Enforce the global order: (tile id, cell order) strictly
        // increasing for regular tiling, cell order alone otherwise.
        if let Some(last) = &self.last_coords {
            let in_order = match tile_id {
                Some(id) => {
                    let last_id = self
                        .schema
                        .tile_id::<T>(last)
                        .unwrap_or(u64::MAX);
                    id > last_id
                        || (id == last_id
                            && self
                                .schema
                                .precedes::<T>(last, &coords_bytes))
                }
                None => self.schema.precedes::<T>(last, &coords_bytes),
            };
            if !in_order {
                return Err(Error::WriteOutOfOrder);
            }
        }

        self.roll_tile_if_needed(tile_id)?;
        if self.current.is_none() {
            let id = tile_id.unwrap_or(self.next_irregular_id);
            self.open_tiles(id)?;
        }

        let tiles = self.current.as_mut().unwrap();
        let coords_id = tiles.len() - 1;
        tiles[coords_id].push_cell(&coords_bytes)?;
        for (tile, cell) in tiles.iter_mut().zip(attrs.iter()) {
            tile.push_cell(cell)?;
        }

        self.last_coords = Some(coords_bytes);
        Ok(())
    }

    fn roll_tile_if_needed(
        &mut self,
        tile_id: Option<u64>,
    ) -> Result<(), Error> {
        let Some(tiles) = &self.current else {
            return Ok(());
        };
        let cut = match (self.schema.tiling(), tile_id) {
            (Tiling::Regular { .. }, Some(id)) => id != self.current_tile_id,
            _ => {
                let coord_tile = tiles.last().unwrap();
                coord_tile.cell_num() >= self.schema.capacity()
            }
        };
        if cut {
            self.flush_current();
        }
        Ok(())
    }

    fn open_tiles(&mut self, tile_id: u64) -> Result<(), Error> {
        let mut tiles = Vec::with_capacity(self.schema.attribute_num() + 1);
        for attr in self.schema.attributes() {
            tiles.push(Tile::new(tile_id, 0, attr.datatype, attr.val_num)?);
        }
        tiles.push(Tile::new(
            tile_id,
            self.schema.dim_num(),
            self.schema.coord_type(),
            CellValNum::try_from(self.schema.dim_num() as u32)
                .expect("dim_num is nonzero"),
        )?);
        self.current = Some(tiles);
        self.current_tile_id = tile_id;
        Ok(())
    }

    fn flush_current(&mut self) {
        if let Some(tiles) = self.current.take() {
            for (column, tile) in self.staged.iter_mut().zip(tiles) {
                column.push(tile);
            }
            self.next_irregular_id = self.current_tile_id + 1;
        }
    }

    /// Seals the writer into an immutable fragment.
    pub fn finish(mut self) -> Result<Fragment, Error> {
        self.flush_current();
        Fragment::new(self.staged)
    }
}

/// Encodes a variable-sized cell from its value bytes: a `u32` element
/// count followed by the values.
pub fn var_cell_for(type_size: usize, values: &[u8]) -> Vec<u8> {
    debug_assert_eq!(0, values.len() % type_size);
    let count = (values.len() / type_size) as u32;
    let mut cell =
        Vec::with_capacity(VAR_CELL_PREFIX_SIZE + values.len());
    cell.extend_from_slice(&count.to_ne_bytes());
    cell.extend_from_slice(values);
    cell
}

#[cfg(test)]
mod tests {
    use strata_common::datatype::Datatype;
    use strata_common::schema::{
        AttributeSchema, CellOrder, DimensionSchema,
    };

    use super::*;

    fn schema(capacity: u64, tiling: Tiling) -> ArraySchema {
        ArraySchema::new(
            "frag-test",
            vec![
                DimensionSchema::new("i", [1.0, 4.0]),
                DimensionSchema::new("j", [1.0, 4.0]),
            ],
            Datatype::Int32,
            vec![AttributeSchema::new(
                "a",
                Datatype::Int32,
                CellValNum::single(),
            )],
            capacity,
            CellOrder::RowMajor,
            tiling,
        )
        .unwrap()
    }

    fn attr(v: i32) -> Vec<u8> {
        encode_values(&[v])
    }

    #[test]
    fn irregular_writer_cuts_on_capacity() {
        let schema = schema(2, Tiling::Irregular);
        let mut writer = FragmentWriter::<i32>::new(&schema).unwrap();
        writer.write_cell(&[1, 1], &[&attr(10)]).unwrap();
        writer.write_cell(&[1, 2], &[&attr(20)]).unwrap();
        writer.write_cell(&[2, 1], &[&attr(30)]).unwrap();
        let fragment = writer.finish().unwrap();

        assert_eq!(2, fragment.tile_num());
        assert_eq!(1, fragment.attribute_num());
        let coords_id = fragment.attribute_num();
        assert_eq!(Some(0), fragment.tile(coords_id, 0).map(Tile::tile_id));
        assert_eq!(Some(1), fragment.tile(coords_id, 1).map(Tile::tile_id));
        assert_eq!(2, fragment.tile(coords_id, 0).unwrap().cell_num());
        assert_eq!(1, fragment.tile(coords_id, 1).unwrap().cell_num());
        assert_eq!(1, fragment.tile(0, 1).unwrap().cell_num());
    }

    #[test]
    fn regular_writer_cuts_on_tile_id_change() {
        let schema = schema(
            100,
            Tiling::Regular {
                extents: vec![2.0, 2.0],
                tile_order: CellOrder::RowMajor,
            },
        );
        let mut writer = FragmentWriter::<i32>::new(&schema).unwrap();
        // tile 0 holds rows 1-2 x cols 1-2; tile 1 holds rows 1-2 x cols 3-4
        writer.write_cell(&[1, 1], &[&attr(10)]).unwrap();
        writer.write_cell(&[2, 2], &[&attr(20)]).unwrap();
        writer.write_cell(&[1, 3], &[&attr(30)]).unwrap();
        let fragment = writer.finish().unwrap();

        assert_eq!(2, fragment.tile_num());
        let coords_id = fragment.attribute_num();
        assert_eq!(Some(0), fragment.tile(coords_id, 0).map(Tile::tile_id));
        assert_eq!(Some(1), fragment.tile(coords_id, 1).map(Tile::tile_id));
    }

    #[test]
    fn out_of_order_writes_are_rejected() {
        let schema = schema(4, Tiling::Irregular);
        let mut writer = FragmentWriter::<i32>::new(&schema).unwrap();
        writer.write_cell(&[2, 1], &[&attr(1)]).unwrap();
        assert_eq!(
            Err(Error::WriteOutOfOrder),
            writer.write_cell(&[1, 1], &[&attr(2)])
        );
        // duplicate coordinates are also out of order
        assert_eq!(
            Err(Error::WriteOutOfOrder),
            writer.write_cell(&[2, 1], &[&attr(3)])
        );
    }

    #[test]
    fn deletion_cells_carry_markers() {
        let schema = schema(4, Tiling::Irregular);
        let mut writer = FragmentWriter::<i32>::new(&schema).unwrap();
        writer.write_cell(&[1, 1], &[&attr(10)]).unwrap();
        writer.write_deletion(&[1, 2]).unwrap();
        let fragment = writer.finish().unwrap();

        let attr_tile = fragment.tile(0, 0).unwrap();
        assert!(!attr_tile.is_del(0).unwrap());
        assert!(attr_tile.is_del(1).unwrap());
    }

    #[test]
    fn tile_cursor_walks_and_seeks() {
        let schema = schema(1, Tiling::Irregular);
        let mut writer = FragmentWriter::<i32>::new(&schema).unwrap();
        writer.write_cell(&[1, 1], &[&attr(1)]).unwrap();
        writer.write_cell(&[1, 2], &[&attr(2)]).unwrap();
        writer.write_cell(&[2, 1], &[&attr(3)]).unwrap();
        let fragment = writer.finish().unwrap();
        let coords_id = fragment.attribute_num();

        let mut it = fragment.begin(coords_id);
        assert_eq!(3, it.tile_num());
        let mut ids = Vec::new();
        while let Some(tile) = it.tile() {
            ids.push(tile.tile_id());
            it.advance();
        }
        assert_eq!(vec![0, 1, 2], ids);
        assert!(it.end());

        let mut rit = fragment.rbegin(coords_id);
        assert_eq!(Some(2), rit.tile_id());
        rit.seek(2);
        assert_eq!(Some(0), rit.tile_id());
        rit.advance();
        assert!(rit.end());

        // metadata access without touching the payload
        let it = fragment.begin(coords_id);
        assert!(it.mbr().is_some());
        assert!(it.bounding_coordinates().is_some());
    }

    #[test]
    fn fragment_invariants_are_checked() {
        // coordinate column missing
        assert!(matches!(
            Fragment::new(vec![]),
            Err(Error::NoCoordinateColumn)
        ));

        // attribute column with a different tile count
        let schema = schema(4, Tiling::Irregular);
        let mut writer = FragmentWriter::<i32>::new(&schema).unwrap();
        writer.write_cell(&[1, 1], &[&attr(1)]).unwrap();
        let fragment = writer.finish().unwrap();
        let mut columns = fragment.tiles.clone();
        columns[0].clear();
        assert!(matches!(
            Fragment::new(columns),
            Err(Error::TileCountMismatch { .. })
        ));
    }

    #[test]
    fn var_cell_encoding() {
        let cell = var_cell_for(1, b"abc");
        assert_eq!(3u32.to_ne_bytes().to_vec(), cell[..4].to_vec());
        assert_eq!(b"abc", &cell[4..]);
    }
}
