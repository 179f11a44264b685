use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;

use strata_common::datatype::CellValNum;
use strata_common::physical::CoordinateType;
use strata_common::range::{HyperRect, Overlap};
use strata_common::schema::ArraySchema;

use crate::array::{Array, ArrayData};
use crate::fragment::Fragment;
use crate::tile::Tile;

#[derive(Clone, Debug, Error, PartialEq)]
pub enum Error {
    #[error("Array {0:?} already exists")]
    ArrayExists(String),
    #[error("Array {0:?} does not exist")]
    ArrayNotFound(String),
    #[error("No tile with id {tile_id} for attribute {attribute_id}")]
    TileNotFound { attribute_id: usize, tile_id: u64 },
    #[error("Tile rank {rank} out of bounds: {tile_num} tiles")]
    RankOutOfBounds { rank: usize, tile_num: usize },
    #[error("Array error: {0}")]
    Array(#[from] crate::array::Error),
    #[error("Fragment error: {0}")]
    Fragment(#[from] crate::fragment::Error),
    #[error("Tile error: {0}")]
    Tile(#[from] crate::tile::Error),
    #[error("Schema error: {0}")]
    Schema(#[from] strata_common::schema::Error),
}

/// Stages the tiles of one fragment being written to an array.
///
/// Committed by [StorageManager::close_array]; dropping the descriptor
/// without closing abandons the staged tiles, so a failed operator never
/// registers a partial fragment.
#[derive(Debug)]
pub struct WriteDescriptor {
    array_name: String,
    schema: ArraySchema,
    staged: Vec<Vec<Tile>>,
}

impl WriteDescriptor {
    pub fn array_name(&self) -> &str {
        &self.array_name
    }

    pub fn schema(&self) -> &ArraySchema {
        &self.schema
    }
}

/// The in-memory tile store.
///
/// Arrays are registered under their schema name; each holds an immutable
/// `(schema, fragments)` snapshot behind an `Arc`. Opening an array hands
/// out a clone of that snapshot, so tile references stay valid for the
/// lifetime of the [Array] descriptor no matter what writers do
/// concurrently.
#[derive(Debug, Default)]
pub struct StorageManager {
    arrays: Mutex<HashMap<String, Arc<ArrayData>>>,
}

impl StorageManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new, empty array.
    pub fn define_array(&self, schema: ArraySchema) -> Result<(), Error> {
        let mut arrays = self.arrays.lock().unwrap();
        let name = schema.array_name().to_owned();
        if arrays.contains_key(&name) {
            return Err(Error::ArrayExists(name));
        }
        arrays.insert(name, Arc::new(ArrayData::new(schema, Vec::new())));
        Ok(())
    }

    /// Opens a read snapshot of an array.
    pub fn open_array(&self, name: &str) -> Result<Array, Error> {
        let arrays = self.arrays.lock().unwrap();
        arrays
            .get(name)
            .map(|data| Array::new(Arc::clone(data)))
            .ok_or_else(|| Error::ArrayNotFound(name.to_owned()))
    }

    /// Starts a fragment write against an existing array.
    pub fn open_for_write(
        &self,
        name: &str,
    ) -> Result<WriteDescriptor, Error> {
        let arrays = self.arrays.lock().unwrap();
        let data = arrays
            .get(name)
            .ok_or_else(|| Error::ArrayNotFound(name.to_owned()))?;
        let schema = data.schema().clone();
        let staged = vec![Vec::new(); schema.attribute_num() + 1];
        Ok(WriteDescriptor {
            array_name: name.to_owned(),
            schema,
            staged,
        })
    }

    /// Creates an empty result tile for the given column, reserving
    /// payload space for `capacity` cells.
    pub fn new_tile(
        &self,
        schema: &ArraySchema,
        attribute_id: usize,
        tile_id: u64,
        capacity: u64,
    ) -> Result<Tile, Error> {
        let mut tile = if attribute_id == schema.coords_id() {
            Tile::new(
                tile_id,
                schema.dim_num(),
                schema.coord_type(),
                CellValNum::try_from(schema.dim_num() as u32)
                    .expect("schemas have at least one dimension"),
            )?
        } else {
            let attr = schema.attribute(attribute_id)?;
            Tile::new(tile_id, 0, attr.datatype, attr.val_num)?
        };
        tile.reserve_cells(capacity);
        Ok(tile)
    }

    /// Stages a finished tile into the write descriptor's fragment.
    pub fn append_tile(
        &self,
        tile: Tile,
        wd: &mut WriteDescriptor,
        attribute_id: usize,
    ) -> Result<(), Error> {
        wd.schema.check_attribute_ids(&[attribute_id])?;
        wd.staged[attribute_id].push(tile);
        Ok(())
    }

    /// Seals the staged tiles as one fragment appended to the array.
    /// A descriptor with no staged tiles commits nothing.
    pub fn close_array(&self, wd: WriteDescriptor) -> Result<(), Error> {
        if wd.staged.iter().all(Vec::is_empty) {
            return Ok(());
        }
        let fragment = Fragment::new(wd.staged)?;
        self.write_fragment(&wd.array_name, fragment)
    }

    /// Appends a finished fragment (e.g. from a
    /// [FragmentWriter](crate::fragment::FragmentWriter)) to an array.
    /// Open descriptors keep their pre-write snapshot.
    pub fn write_fragment(
        &self,
        name: &str,
        fragment: Fragment,
    ) -> Result<(), Error> {
        let mut arrays = self.arrays.lock().unwrap();
        let data = arrays
            .get(name)
            .ok_or_else(|| Error::ArrayNotFound(name.to_owned()))?;
        let mut fragments = data.fragments_arcs().to_vec();
        fragments.push(Arc::new(fragment));
        let next =
            Arc::new(ArrayData::new(data.schema().clone(), fragments));
        arrays.insert(name.to_owned(), next);
        Ok(())
    }

    /// A forward tile cursor over one `(fragment, attribute)` column of
    /// an open array.
    pub fn begin<'a>(
        &self,
        array: &'a Array,
        fragment_id: usize,
        attribute_id: usize,
    ) -> Result<crate::fragment::FragmentTileIter<'a>, Error> {
        Ok(array.begin(fragment_id, attribute_id)?)
    }

    /// The reverse counterpart of [StorageManager::begin].
    pub fn rbegin<'a>(
        &self,
        array: &'a Array,
        fragment_id: usize,
        attribute_id: usize,
    ) -> Result<crate::fragment::FragmentTileRevIter<'a>, Error> {
        Ok(array.rbegin(fragment_id, attribute_id)?)
    }

    /// The tile with the given id in the array's first fragment.
    ///
    /// Operators address tiles by id against single-fragment (i.e.
    /// consolidated) arrays; multi-fragment reads go through the
    /// array-level merge iterators instead.
    pub fn get_tile<'a>(
        &self,
        array: &'a Array,
        attribute_id: usize,
        tile_id: u64,
    ) -> Result<&'a Tile, Error> {
        array.schema().check_attribute_ids(&[attribute_id])?;
        let fragment = array
            .fragment(0)
            .ok_or(Error::TileNotFound {
                attribute_id,
                tile_id,
            })?;
        (0..fragment.tile_num())
            .filter_map(|pos| fragment.tile(attribute_id, pos))
            .find(|tile| tile.tile_id() == tile_id)
            .ok_or(Error::TileNotFound {
                attribute_id,
                tile_id,
            })
    }

    /// The tile at ordinal `rank` in the array's first fragment.
    pub fn get_tile_by_rank<'a>(
        &self,
        array: &'a Array,
        attribute_id: usize,
        rank: usize,
    ) -> Result<&'a Tile, Error> {
        array.schema().check_attribute_ids(&[attribute_id])?;
        let fragment = array
            .fragment(0)
            .ok_or(Error::RankOutOfBounds { rank, tile_num: 0 })?;
        fragment.tile(attribute_id, rank).ok_or(
            Error::RankOutOfBounds {
                rank,
                tile_num: fragment.tile_num(),
            },
        )
    }

    /// The ids of the coordinate tiles in the array's first fragment
    /// whose MBR overlaps `range`, each flagged `true` when the tile
    /// lies entirely inside the range.
    pub fn get_overlapping_tile_ids<T: CoordinateType>(
        &self,
        array: &Array,
        range: &HyperRect<T>,
    ) -> Result<Vec<(u64, bool)>, Error> {
        array.schema().check_range(range)?;
        let Some(fragment) = array.fragment(0) else {
            return Ok(Vec::new());
        };
        let coords_id = array.schema().coords_id();

        let mut overlapping = Vec::new();
        for pos in 0..fragment.tile_num() {
            let Some(tile) = fragment.tile(coords_id, pos) else {
                continue;
            };
            let Some(mbr) = tile.mbr() else { continue };
            match range.overlap_bytes(mbr) {
                Overlap::None => {}
                Overlap::Partial => {
                    overlapping.push((tile.tile_id(), false))
                }
                Overlap::Full => overlapping.push((tile.tile_id(), true)),
            }
        }
        Ok(overlapping)
    }
}

#[cfg(test)]
mod tests {
    use strata_common::datatype::Datatype;
    use strata_common::physical::encode_values;
    use strata_common::schema::{
        AttributeSchema, CellOrder, DimensionSchema, Tiling,
    };

    use crate::fragment::FragmentWriter;

    use super::*;

    fn schema(name: &str) -> ArraySchema {
        ArraySchema::new(
            name,
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
            2,
            CellOrder::RowMajor,
            Tiling::Irregular,
        )
        .unwrap()
    }

    fn write_cells(
        sm: &StorageManager,
        name: &str,
        cells: &[([i32; 2], i32)],
    ) {
        let array = sm.open_array(name).unwrap();
        let schema = array.schema().clone();
        let mut writer = FragmentWriter::<i32>::new(&schema).unwrap();
        for (coords, value) in cells {
            writer
                .write_cell(coords, &[&encode_values(&[*value])])
                .unwrap();
        }
        sm.write_fragment(name, writer.finish().unwrap()).unwrap();
    }

    #[test]
    fn define_open_and_write() {
        let sm = StorageManager::new();
        sm.define_array(schema("a1")).unwrap();
        assert_eq!(
            Err(Error::ArrayExists("a1".to_owned())),
            sm.define_array(schema("a1"))
        );
        assert!(matches!(
            sm.open_array("missing"),
            Err(Error::ArrayNotFound(_))
        ));

        let empty = sm.open_array("a1").unwrap();
        assert!(empty.empty());

        write_cells(&sm, "a1", &[([1, 1], 10), ([1, 2], 20), ([2, 1], 30)]);

        // the earlier snapshot is unaffected
        assert!(empty.empty());
        let array = sm.open_array("a1").unwrap();
        assert_eq!(1, array.fragment_num());
        assert!(!array.empty());
    }

    #[test]
    fn empty_write_descriptor_commits_nothing() {
        let sm = StorageManager::new();
        sm.define_array(schema("a1")).unwrap();
        let wd = sm.open_for_write("a1").unwrap();
        sm.close_array(wd).unwrap();
        assert!(sm.open_array("a1").unwrap().empty());
    }

    #[test]
    fn abandoned_write_descriptor_commits_nothing() {
        let sm = StorageManager::new();
        sm.define_array(schema("a1")).unwrap();
        {
            let mut wd = sm.open_for_write("a1").unwrap();
            let tile = sm
                .new_tile(&schema("a1"), 0, 0, 2)
                .unwrap();
            sm.append_tile(tile, &mut wd, 0).unwrap();
            // dropped without close_array
        }
        assert!(sm.open_array("a1").unwrap().empty());
    }

    #[test]
    fn tile_lookup_by_id_and_rank() {
        let sm = StorageManager::new();
        sm.define_array(schema("a1")).unwrap();
        write_cells(&sm, "a1", &[([1, 1], 10), ([1, 2], 20), ([2, 1], 30)]);
        let array = sm.open_array("a1").unwrap();

        // capacity 2 cut two tiles: ids 0 and 1
        let t1 = sm.get_tile(&array, 0, 1).unwrap();
        assert_eq!(1, t1.cell_num());
        let by_rank = sm.get_tile_by_rank(&array, 0, 1).unwrap();
        assert_eq!(1, by_rank.tile_id());
        assert!(matches!(
            sm.get_tile(&array, 0, 9),
            Err(Error::TileNotFound { .. })
        ));
        assert!(matches!(
            sm.get_tile_by_rank(&array, 0, 9),
            Err(Error::RankOutOfBounds { .. })
        ));
    }

    #[test]
    fn overlapping_tile_ids_carry_full_flags() {
        let sm = StorageManager::new();
        sm.define_array(schema("a1")).unwrap();
        write_cells(&sm, "a1", &[([1, 1], 10), ([1, 2], 20), ([2, 1], 30)]);
        let array = sm.open_array("a1").unwrap();

        // tile 0 spans rows 1..=1, cols 1..=2; tile 1 is the single cell (2,1)
        let range = HyperRect::new(vec![[1i32, 2], [1, 2]]).unwrap();
        assert_eq!(
            vec![(0, true), (1, true)],
            sm.get_overlapping_tile_ids(&array, &range).unwrap()
        );

        let partial = HyperRect::new(vec![[1i32, 1], [2, 4]]).unwrap();
        assert_eq!(
            vec![(0, false)],
            sm.get_overlapping_tile_ids(&array, &partial).unwrap()
        );

        let disjoint = HyperRect::new(vec![[4i32, 4], [4, 4]]).unwrap();
        assert!(sm
            .get_overlapping_tile_ids(&array, &disjoint)
            .unwrap()
            .is_empty());
    }
}
