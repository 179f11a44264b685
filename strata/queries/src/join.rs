use strata_common::physical::CoordinateType;
use strata_common::range::{HyperRect, Overlap};
use strata_common::schema::ArraySchema;
use strata_core::array::Array;
use strata_core::fragment::FragmentTileIter;
use strata_core::tile::TileCellIter;

use crate::result_tiles::ResultTiles;
use crate::{single_fragment, tile_begin, Error, QueryProcessor, Result};

/// Whether two coordinate tiles can hold joining cells: their MBRs must
/// overlap and their cell id ranges (bounding coordinates, under the
/// global order) must intersect.
fn may_join<T: CoordinateType>(
    schema: &ArraySchema,
    it_a: &FragmentTileIter,
    it_b: &FragmentTileIter,
) -> bool {
    let (Some(mbr_a), Some(mbr_b)) = (it_a.mbr(), it_b.mbr()) else {
        return false;
    };
    let decoded = strata_common::physical::decode_iter::<T>(mbr_a)
        .collect::<Vec<_>>();
    match HyperRect::from_flat(&decoded) {
        Ok(rect_a) => {
            if rect_a.overlap_bytes(mbr_b) == Overlap::None {
                return false;
            }
        }
        Err(_) => return false,
    }

    let (Some(bc_a), Some(bc_b)) =
        (it_a.bounding_coordinates(), it_b.bounding_coordinates())
    else {
        return false;
    };
    !(schema.precedes::<T>(bc_a.1, bc_b.0)
        || schema.succeeds::<T>(bc_a.0, bc_b.1))
}

/// Orders two coordinate tiles from different arrays under the global
/// order by their closing bounding coordinate: the tile that ends
/// earlier can be retired first.
fn tile_precedes<T: CoordinateType>(
    schema: &ArraySchema,
    it_a: &FragmentTileIter,
    it_b: &FragmentTileIter,
) -> bool {
    match (it_a.bounding_coordinates(), it_b.bounding_coordinates()) {
        (Some(bc_a), Some(bc_b)) => {
            schema.precedes::<T>(bc_a.1, bc_b.1)
        }
        _ => false,
    }
}

struct TileJoinState<'f> {
    tile_its: Vec<FragmentTileIter<'f>>,
    cell_its: Vec<TileCellIter<'f>>,
    attribute_num: usize,
    skipped_tiles: i64,
    attribute_cell_its_initialized: bool,
    coordinate_cell_its_initialized: bool,
}

impl<'f> TileJoinState<'f> {
    fn new(
        fragment: &'f strata_core::fragment::Fragment,
        attribute_num: usize,
    ) -> Self {
        TileJoinState {
            tile_its: (0..=attribute_num)
                .map(|id| fragment.begin(id))
                .collect(),
            cell_its: vec![TileCellIter::default(); attribute_num + 1],
            attribute_num,
            skipped_tiles: 0,
            attribute_cell_its_initialized: false,
            coordinate_cell_its_initialized: false,
        }
    }

    fn coords_tile_it(&self) -> &FragmentTileIter<'f> {
        &self.tile_its[self.attribute_num]
    }

    /// Catches the attribute tile cursors up with the coordinate cursor
    /// and rewinds the coordinate cell cursor to the tile start.
    fn refresh_for_join(&mut self) {
        if self.skipped_tiles != 0 {
            let step = self.skipped_tiles;
            for it in self.tile_its[..self.attribute_num].iter_mut() {
                it.seek(step);
            }
            self.skipped_tiles = 0;
            self.cell_its[self.attribute_num] =
                tile_begin(&self.tile_its[self.attribute_num]);
            self.coordinate_cell_its_initialized = true;
            self.attribute_cell_its_initialized = false;
        } else if !self.coordinate_cell_its_initialized {
            self.cell_its[self.attribute_num] =
                tile_begin(&self.tile_its[self.attribute_num]);
            self.coordinate_cell_its_initialized = true;
        }
    }

    /// Retires the current coordinate tile; attribute cursors lag until
    /// the next join hit.
    fn skip_tile(&mut self) {
        self.tile_its[self.attribute_num].advance();
        self.skipped_tiles += 1;
        self.coordinate_cell_its_initialized = false;
    }
}

/// Inner merge of two positioned coordinate tiles: on coordinate
/// equality, emit the concatenated cell; otherwise advance the earlier
/// cursor, counting the skip for the lazy attribute catch-up.
fn join_tiles<T: CoordinateType>(
    schema: &ArraySchema,
    state_a: &mut TileJoinState,
    state_b: &mut TileJoinState,
    result: &mut ResultTiles,
    capacity_roll: Option<u64>,
) -> Result<()> {
    let na = state_a.attribute_num;
    let nb = state_b.attribute_num;

    let mut skipped_cells_a: i64 = if state_a.attribute_cell_its_initialized
    {
        state_a.cell_its[na].pos() - state_a.cell_its[0].pos()
    } else {
        state_a.cell_its[na].pos()
    };
    let mut skipped_cells_b: i64 = if state_b.attribute_cell_its_initialized
    {
        state_b.cell_its[nb].pos() - state_b.cell_its[0].pos()
    } else {
        state_b.cell_its[nb].pos()
    };

    while !state_a.cell_its[na].end() && !state_b.cell_its[nb].end() {
        let coords_a = state_a.cell_its[na]
            .cell()
            .ok_or(Error::LostSynchronization)?;
        let coords_b = state_b.cell_its[nb]
            .cell()
            .ok_or(Error::LostSynchronization)?;

        if coords_a == coords_b {
            if !state_a.attribute_cell_its_initialized {
                for id in 0..na {
                    state_a.cell_its[id] =
                        tile_begin(&state_a.tile_its[id]);
                }
                state_a.attribute_cell_its_initialized = true;
            }
            if !state_b.attribute_cell_its_initialized {
                for id in 0..nb {
                    state_b.cell_its[id] =
                        tile_begin(&state_b.tile_its[id]);
                }
                state_b.attribute_cell_its_initialized = true;
            }
            if skipped_cells_a != 0 {
                for id in 0..na {
                    state_a.cell_its[id].seek(skipped_cells_a);
                }
                skipped_cells_a = 0;
            }
            if skipped_cells_b != 0 {
                for id in 0..nb {
                    state_b.cell_its[id].seek(skipped_cells_b);
                }
                skipped_cells_b = 0;
            }
            if let Some(capacity) = capacity_roll {
                if result.cell_num() == capacity {
                    let next = result.tile_id() + 1;
                    result.roll(next)?;
                }
            }
            result.append_pair(&state_a.cell_its, na, &state_b.cell_its)?;
            for it in state_a.cell_its.iter_mut() {
                it.advance();
            }
            for it in state_b.cell_its.iter_mut() {
                it.advance();
            }
        } else if schema.precedes::<T>(coords_a, coords_b) {
            state_a.cell_its[na].advance();
            skipped_cells_a += 1;
        } else {
            state_b.cell_its[nb].advance();
            skipped_cells_b += 1;
        }
    }

    Ok(())
}

pub(crate) fn join_irregular<T: CoordinateType>(
    qp: &QueryProcessor,
    a: &Array,
    b: &Array,
    result_schema: ArraySchema,
) -> Result<()> {
    let schema_a = a.schema();
    let capacity = result_schema.capacity();

    let mut result = ResultTiles::create(qp, result_schema)?;
    let (Some(fragment_a), Some(fragment_b)) =
        (single_fragment(a)?, single_fragment(b)?)
    else {
        return result.finish();
    };

    let mut state_a =
        TileJoinState::new(fragment_a, schema_a.attribute_num());
    let mut state_b =
        TileJoinState::new(fragment_b, b.schema().attribute_num());

    while !state_a.coords_tile_it().end()
        && !state_b.coords_tile_it().end()
    {
        if may_join::<T>(
            schema_a,
            state_a.coords_tile_it(),
            state_b.coords_tile_it(),
        ) {
            state_a.refresh_for_join();
            state_b.refresh_for_join();
            join_tiles::<T>(
                schema_a,
                &mut state_a,
                &mut state_b,
                &mut result,
                Some(capacity),
            )?;
        }

        if tile_precedes::<T>(
            schema_a,
            state_a.coords_tile_it(),
            state_b.coords_tile_it(),
        ) {
            state_a.skip_tile();
        } else {
            state_b.skip_tile();
        }
    }

    result.finish()
}

pub(crate) fn join_regular<T: CoordinateType>(
    qp: &QueryProcessor,
    a: &Array,
    b: &Array,
    result_schema: ArraySchema,
) -> Result<()> {
    let schema_a = a.schema();

    let mut result = ResultTiles::create(qp, result_schema)?;
    let (Some(fragment_a), Some(fragment_b)) =
        (single_fragment(a)?, single_fragment(b)?)
    else {
        return result.finish();
    };

    let mut state_a =
        TileJoinState::new(fragment_a, schema_a.attribute_num());
    let mut state_b =
        TileJoinState::new(fragment_b, b.schema().attribute_num());

    while !state_a.coords_tile_it().end()
        && !state_b.coords_tile_it().end()
    {
        let tile_id_a = state_a
            .coords_tile_it()
            .tile_id()
            .ok_or(Error::LostSynchronization)?;
        let tile_id_b = state_b
            .coords_tile_it()
            .tile_id()
            .ok_or(Error::LostSynchronization)?;

        // Regular tile precedence is tile id order.
        if tile_id_a == tile_id_b {
            state_a.refresh_for_join();
            state_b.refresh_for_join();
            // Fresh attribute alignment per tile pair.
            state_a.attribute_cell_its_initialized = false;
            state_b.attribute_cell_its_initialized = false;

            result.roll(tile_id_a)?;
            join_tiles::<T>(
                schema_a,
                &mut state_a,
                &mut state_b,
                &mut result,
                None,
            )?;

            state_a.skip_tile();
            state_b.skip_tile();
        } else if tile_id_a < tile_id_b {
            state_a.skip_tile();
        } else {
            state_b.skip_tile();
        }
    }

    result.finish()
}
