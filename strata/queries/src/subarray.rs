use strata_common::physical::CoordinateType;
use strata_common::range::HyperRect;
use strata_common::schema::ArraySchema;
use strata_core::array::Array;
use strata_core::tile::{Tile, TileCellIter};

use crate::result_tiles::ResultTiles;
use crate::{single_fragment, Error, QueryProcessor, Result};

/// One tile per column at the given tile id.
fn get_tiles<'a>(
    qp: &QueryProcessor,
    array: &'a Array,
    tile_id: u64,
) -> Result<Vec<&'a Tile>> {
    (0..=array.schema().attribute_num())
        .map(|attribute_id| {
            qp.storage()
                .get_tile(array, attribute_id, tile_id)
                .map_err(Error::from)
        })
        .collect()
}

pub(crate) fn subarray_irregular<T: CoordinateType>(
    qp: &QueryProcessor,
    array: &Array,
    range: &HyperRect<T>,
    result_schema: ArraySchema,
) -> Result<()> {
    let schema = array.schema();
    let attribute_num = schema.attribute_num();
    let capacity = schema.capacity();

    let mut result = ResultTiles::create(qp, result_schema)?;
    if single_fragment(array)?.is_none() {
        return result.finish();
    };

    let overlapping =
        qp.storage().get_overlapping_tile_ids(array, range)?;

    let mut cell_its = vec![TileCellIter::default(); attribute_num + 1];
    let mut skipped_cells: i64;

    for (tile_id, full_overlap) in overlapping {
        let tiles = get_tiles(qp, array, tile_id)?;
        skipped_cells = 0;

        if full_overlap {
            // Every cell is in range; the per-cell test is elided.
            for (it, tile) in cell_its.iter_mut().zip(tiles.iter()) {
                *it = tile.begin();
            }
            while !cell_its[attribute_num].end() {
                if result.cell_num() == capacity {
                    let next = result.tile_id() + 1;
                    result.roll(next)?;
                }
                result.append(&cell_its)?;
                for it in cell_its.iter_mut() {
                    it.advance();
                }
            }
        } else {
            // Walk the coordinates; attribute cursors catch up on hits.
            cell_its[attribute_num] = tiles[attribute_num].begin();
            let mut attribute_cell_its_initialized = false;
            while !cell_its[attribute_num].end() {
                if cell_its[attribute_num].cell_inside_range(range)? {
                    if result.cell_num() == capacity {
                        let next = result.tile_id() + 1;
                        result.roll(next)?;
                    }
                    if !attribute_cell_its_initialized {
                        for (it, tile) in cell_its[..attribute_num]
                            .iter_mut()
                            .zip(tiles.iter())
                        {
                            *it = tile.begin();
                        }
                        attribute_cell_its_initialized = true;
                    }
                    if skipped_cells != 0 {
                        for it in cell_its[..attribute_num].iter_mut() {
                            it.seek(skipped_cells);
                        }
                        skipped_cells = 0;
                    }
                    result.append(&cell_its)?;
                    for it in cell_its.iter_mut() {
                        it.advance();
                    }
                } else {
                    skipped_cells += 1;
                    cell_its[attribute_num].advance();
                }
            }
        }
    }

    result.finish()
}

pub(crate) fn subarray_regular<T: CoordinateType>(
    qp: &QueryProcessor,
    array: &Array,
    range: &HyperRect<T>,
    result_schema: ArraySchema,
) -> Result<()> {
    let schema = array.schema();
    let attribute_num = schema.attribute_num();

    let mut result = ResultTiles::create(qp, result_schema)?;
    if single_fragment(array)?.is_none() {
        return result.finish();
    };

    let overlapping =
        qp.storage().get_overlapping_tile_ids(array, range)?;

    let mut cell_its = vec![TileCellIter::default(); attribute_num + 1];
    let mut skipped_cells: i64;

    for (tile_id, full_overlap) in overlapping {
        // Result tiles mirror the overlapping input tile ids.
        result.roll(tile_id)?;
        let tiles = get_tiles(qp, array, tile_id)?;
        skipped_cells = 0;

        if full_overlap {
            for (it, tile) in cell_its.iter_mut().zip(tiles.iter()) {
                *it = tile.begin();
            }
            while !cell_its[attribute_num].end() {
                result.append(&cell_its)?;
                for it in cell_its.iter_mut() {
                    it.advance();
                }
            }
        } else {
            cell_its[attribute_num] = tiles[attribute_num].begin();
            let mut attribute_cell_its_initialized = false;
            while !cell_its[attribute_num].end() {
                if cell_its[attribute_num].cell_inside_range(range)? {
                    if !attribute_cell_its_initialized {
                        for (it, tile) in cell_its[..attribute_num]
                            .iter_mut()
                            .zip(tiles.iter())
                        {
                            *it = tile.begin();
                        }
                        attribute_cell_its_initialized = true;
                    }
                    if skipped_cells != 0 {
                        for it in cell_its[..attribute_num].iter_mut() {
                            it.seek(skipped_cells);
                        }
                        skipped_cells = 0;
                    }
                    result.append(&cell_its)?;
                    for it in cell_its.iter_mut() {
                        it.advance();
                    }
                } else {
                    skipped_cells += 1;
                    cell_its[attribute_num].advance();
                }
            }
        }
    }

    result.finish()
}
