use std::sync::Arc;

use strata_common::schema::ArraySchema;
use strata_common::stats::Stats;
use strata_core::storage::{StorageManager, WriteDescriptor};
use strata_core::tile::{Tile, TileCellIter};

use crate::{Error, QueryProcessor, Result};

/// The per-attribute output tiles an operator is building, flushed to
/// the storage manager as a group.
///
/// Irregular outputs roll when the driver tile reaches the schema
/// capacity; regular outputs roll when the driver input tile id changes.
/// Cells land via [append](ResultTiles::append) column-for-column, so
/// the group stays aligned by construction. Dropping the builder without
/// [finish](ResultTiles::finish) abandons everything staged so far.
pub(crate) struct ResultTiles<'sm> {
    storage: &'sm StorageManager,
    wd: WriteDescriptor,
    schema: ArraySchema,
    tiles: Vec<Tile>,
    tile_id: u64,
    stats: Option<Arc<Stats>>,
}

impl<'sm> ResultTiles<'sm> {
    /// Registers the result array and opens the first tile group with
    /// tile id 0.
    pub(crate) fn create(
        qp: &QueryProcessor<'sm>,
        schema: ArraySchema,
    ) -> Result<Self> {
        let storage = qp.storage();
        storage.define_array(schema.clone())?;
        let wd = storage.open_for_write(schema.array_name())?;
        let mut result = ResultTiles {
            storage,
            wd,
            schema,
            tiles: Vec::new(),
            tile_id: 0,
            stats: qp.stats(),
        };
        result.start_tiles(0)?;
        Ok(result)
    }

    pub(crate) fn tile_id(&self) -> u64 {
        self.tile_id
    }

    /// Cells in the current group, read off the driver (coordinate)
    /// tile.
    pub(crate) fn cell_num(&self) -> u64 {
        self.tiles.last().map(Tile::cell_num).unwrap_or(0)
    }

    fn start_tiles(&mut self, tile_id: u64) -> Result<()> {
        self.tile_id = tile_id;
        self.tiles = (0..=self.schema.attribute_num())
            .map(|attribute_id| {
                self.storage.new_tile(
                    &self.schema,
                    attribute_id,
                    tile_id,
                    self.schema.capacity(),
                )
            })
            .collect::<std::result::Result<_, _>>()?;
        Ok(())
    }

    /// Flushes the current group (empty groups are dropped, not stored)
    /// and opens a fresh one under `tile_id`.
    pub(crate) fn roll(&mut self, tile_id: u64) -> Result<()> {
        self.store_current()?;
        self.start_tiles(tile_id)
    }

    fn store_current(&mut self) -> Result<()> {
        let cell_num = self.cell_num();
        if cell_num == 0 {
            self.tiles.clear();
            return Ok(());
        }
        for (attribute_id, tile) in
            std::mem::take(&mut self.tiles).into_iter().enumerate()
        {
            self.storage.append_tile(tile, &mut self.wd, attribute_id)?;
        }
        if let Some(stats) = &self.stats {
            stats.add_counter("result_tiles_flushed", 1);
            stats.add_counter("result_cells", cell_num);
        }
        Ok(())
    }

    /// Appends one cell: every cursor's bytes go to the same-indexed
    /// column (coordinates last).
    pub(crate) fn append(
        &mut self,
        cell_its: &[TileCellIter],
    ) -> Result<()> {
        for (tile, it) in self.tiles.iter_mut().zip(cell_its.iter()) {
            let bytes = it.cell().ok_or(Error::LostSynchronization)?;
            tile.push_cell(bytes)?;
        }
        Ok(())
    }

    /// Appends one joined cell: `a`'s attributes, then `b`'s, then the
    /// (shared) coordinates taken from `b`.
    pub(crate) fn append_pair(
        &mut self,
        cell_its_a: &[TileCellIter],
        attribute_num_a: usize,
        cell_its_b: &[TileCellIter],
    ) -> Result<()> {
        for (idx, it) in cell_its_a[..attribute_num_a].iter().enumerate()
        {
            let bytes = it.cell().ok_or(Error::LostSynchronization)?;
            self.tiles[idx].push_cell(bytes)?;
        }
        for (idx, it) in cell_its_b.iter().enumerate() {
            let bytes = it.cell().ok_or(Error::LostSynchronization)?;
            self.tiles[attribute_num_a + idx].push_cell(bytes)?;
        }
        Ok(())
    }

    /// Appends one cell assembled from raw parts: stored coordinate
    /// bytes plus one cursor-positioned cell per attribute.
    pub(crate) fn append_with_coords(
        &mut self,
        coords: &[u8],
        attr_cells: &[&[u8]],
    ) -> Result<()> {
        let coords_column = self.tiles.len() - 1;
        for (tile, bytes) in
            self.tiles[..coords_column].iter_mut().zip(attr_cells)
        {
            tile.push_cell(bytes)?;
        }
        self.tiles[coords_column].push_cell(coords)?;
        Ok(())
    }

    /// Flushes the last group and registers the fragment.
    pub(crate) fn finish(mut self) -> Result<()> {
        self.store_current()?;
        let ResultTiles { storage, wd, .. } = self;
        storage.close_array(wd)?;
        Ok(())
    }
}
