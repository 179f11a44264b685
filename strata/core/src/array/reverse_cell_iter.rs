use std::marker::PhantomData;
use std::sync::Arc;

use strata_common::physical::CoordinateType;
use strata_common::range::{HyperRect, Overlap};
use strata_common::schema::ArraySchema;
use strata_common::stats::Stats;

use crate::fragment::FragmentTileRevIter;
use crate::tile::TileCellRevIter;

use super::{
    Array, CellIterBuilder, Error, CELL_BUFFER_INITIAL_SIZE,
};

enum Decision {
    Tie,
    ChallengerWins,
    HolderKeeps,
}

/// The back-to-front counterpart of
/// [ArrayCellIter](super::ArrayCellIter): the same merge over the same
/// selections, consuming higher tile ids first and walking each tile from
/// its last cell down.
///
/// "Later fragment wins" applies unchanged: coordinates tied across
/// fragments emit once, from the fragment latest in the array order.
pub struct ArrayCellRevIter<'a, T: CoordinateType> {
    array: &'a Array,
    fragment_ids: Vec<usize>,
    attribute_ids: Vec<usize>,
    range: Option<HyperRect<T>>,
    full_overlap: Vec<bool>,
    tile_its: Vec<Vec<FragmentTileRevIter<'a>>>,
    cell_its: Vec<Vec<TileCellRevIter<'a>>>,
    cell: Vec<u8>,
    cell_len: usize,
    fixed_cell_size: Option<usize>,
    is_del: bool,
    end: bool,
    error: Option<Error>,
    return_del: bool,
    stats: Option<Arc<Stats>>,
    _coord: PhantomData<T>,
}

impl<'a, T: CoordinateType> ArrayCellRevIter<'a, T> {
    pub(crate) fn from_builder(
        builder: CellIterBuilder<'a, T>,
    ) -> Result<Self, Error> {
        let (fragment_ids, attribute_ids) = builder.resolve()?;
        let array = builder.array;
        let schema = array.schema();
        let column_num = schema.attribute_num() + 1;
        let fragment_num = array.fragment_num();

        let mut it = ArrayCellRevIter {
            array,
            fragment_ids,
            attribute_ids,
            range: builder.range,
            full_overlap: vec![false; fragment_num],
            tile_its: vec![
                vec![FragmentTileRevIter::default(); column_num];
                fragment_num
            ],
            cell_its: vec![
                vec![TileCellRevIter::default(); column_num];
                fragment_num
            ],
            cell: Vec::new(),
            cell_len: 0,
            fixed_cell_size: None,
            is_del: false,
            end: false,
            error: None,
            return_del: builder.return_deletions,
            stats: builder.stats,
            _coord: PhantomData,
        };

        if array.empty() {
            it.end = true;
            return Ok(it);
        }

        it.fixed_cell_size = schema.cell_size_of(&it.attribute_ids)?;
        it.cell = match it.fixed_cell_size {
            Some(size) => vec![0u8; size],
            None => vec![0u8; CELL_BUFFER_INITIAL_SIZE],
        };

        if it.range.is_some() {
            it.init_iterators_in_range();
            for idx in 0..it.fragment_ids.len() {
                let f = it.fragment_ids[idx];
                it.find_next_cell_in_range(f);
            }
        } else {
            it.init_iterators();
        }

        it.step();
        it.settle();
        Ok(it)
    }

    fn coords_id(&self) -> usize {
        self.array.schema().coords_id()
    }

    pub fn schema(&self) -> &ArraySchema {
        self.array.schema()
    }

    pub fn attribute_ids(&self) -> &[usize] {
        &self.attribute_ids
    }

    pub fn end(&self) -> bool {
        self.end
    }

    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    pub fn is_deletion(&self) -> bool {
        self.is_del
    }

    pub fn cell(&self) -> Option<&[u8]> {
        if self.end {
            None
        } else {
            Some(&self.cell[..self.cell_len])
        }
    }

    pub fn cell_size(&self) -> Option<usize> {
        if self.end {
            None
        } else {
            Some(self.cell_len)
        }
    }

    /// Steps to the previous cell in the global order.
    pub fn advance(&mut self) {
        self.step();
        self.settle();
    }

    fn step(&mut self) {
        if self.end {
            return;
        }
        match self.get_next_cell() {
            Some(f) => self.advance_source(f),
            None => {
                self.end = true;
                self.is_del = false;
            }
        }
    }

    fn settle(&mut self) {
        while !self.end && self.is_del && !self.return_del {
            self.step();
        }
    }

    fn get_next_cell(&mut self) -> Option<usize> {
        let coords_id = self.coords_id();

        let mut winner: Option<usize> = None;
        for idx in 0..self.fragment_ids.len() {
            let f = self.fragment_ids[idx];
            if self.cell_its[f][coords_id].end() {
                continue;
            }
            let Some(w) = winner else {
                winner = Some(f);
                continue;
            };

            let decision = {
                let challenger = self.cell_its[f][coords_id].cell();
                let holder = self.cell_its[w][coords_id].cell();
                match (challenger, holder) {
                    (Some(c), Some(h)) if c == h => Decision::Tie,
                    (Some(_), Some(_)) => {
                        if self.precedes(f, w) {
                            Decision::ChallengerWins
                        } else {
                            Decision::HolderKeeps
                        }
                    }
                    _ => Decision::HolderKeeps,
                }
            };
            match decision {
                Decision::Tie => {
                    self.advance_source(w);
                    winner = Some(f);
                }
                Decision::ChallengerWins => winner = Some(f),
                Decision::HolderKeeps => {}
            }
        }

        let f = winner?;
        if let Err(e) = self.materialize(f) {
            self.error = Some(e);
            self.end = true;
            return None;
        }
        if let Some(stats) = &self.stats {
            stats.add_counter("cells_emitted", 1);
        }
        Some(f)
    }

    fn materialize(&mut self, f: usize) -> Result<(), Error> {
        let schema = self.array.schema();
        let coords_id = self.coords_id();
        let coords_size = schema.coords_size();

        let total = match self.fixed_cell_size {
            Some(size) => size,
            None => {
                let mut total = std::mem::size_of::<u64>();
                for idx in 0..self.attribute_ids.len() {
                    let a = self.attribute_ids[idx];
                    total += self.cell_its[f][a].cell_size()?;
                }
                total
            }
        };
        if total > self.cell.len() {
            let mut grown = self.cell.len().max(1);
            while grown < total {
                grown *= 2;
            }
            self.cell.resize(grown, 0);
        }
        self.cell_len = total;

        let coords = self.cell_its[f][coords_id]
            .cell()
            .ok_or(Error::LostSynchronization { fragment_id: f })?;
        self.cell[..coords_size].copy_from_slice(coords);
        let mut offset = coords_size;

        if self.fixed_cell_size.is_none() {
            let prefix = (total as u64).to_ne_bytes();
            self.cell[offset..offset + prefix.len()]
                .copy_from_slice(&prefix);
            offset += prefix.len();
        }

        for idx in 0..self.attribute_ids.len() - 1 {
            let a = self.attribute_ids[idx];
            let bytes = self.cell_its[f][a]
                .cell()
                .ok_or(Error::LostSynchronization { fragment_id: f })?;
            self.cell[offset..offset + bytes.len()]
                .copy_from_slice(bytes);
            offset += bytes.len();
        }
        debug_assert_eq!(self.cell_len, offset);

        let first = self.attribute_ids[0];
        self.is_del = if first == coords_id {
            false
        } else {
            self.cell_its[f][first].is_del()?
        };
        Ok(())
    }

    /// "Precedes" here means "is consumed earlier walking backwards":
    /// for regular tiling the greater tile id comes first, and within a
    /// tile the coordinates that succeed in the cell order come first.
    fn precedes(&self, a: usize, b: usize) -> bool {
        let coords_id = self.coords_id();
        let it_a = &self.cell_its[a][coords_id];
        let it_b = &self.cell_its[b][coords_id];
        let (Some(coords_a), Some(coords_b)) = (it_a.cell(), it_b.cell())
        else {
            return false;
        };

        let schema = self.array.schema();
        let regular = schema.has_regular_tiles();
        let tile_id_a = it_a.tile_id().unwrap_or(0);
        let tile_id_b = it_b.tile_id().unwrap_or(0);

        if regular && tile_id_a > tile_id_b {
            return true;
        }

        let coords_precede = schema.succeeds::<T>(coords_a, coords_b);

        if regular && tile_id_a == tile_id_b && coords_precede {
            return true;
        }
        if !regular && coords_precede {
            return true;
        }

        false
    }

    fn advance_source(&mut self, f: usize) {
        if self.range.is_some() {
            self.advance_cell_in_range(f)
        } else {
            self.advance_cell(f)
        }
    }

    fn advance_cell(&mut self, f: usize) {
        let coords_id = self.coords_id();
        for idx in 0..self.attribute_ids.len() {
            let a = self.attribute_ids[idx];
            self.cell_its[f][a].advance();
        }

        if self.cell_its[f][coords_id].end() {
            for idx in 0..self.attribute_ids.len() {
                let a = self.attribute_ids[idx];
                self.tile_its[f][a].advance();
            }
            if !self.tile_its[f][coords_id].end() {
                for idx in 0..self.attribute_ids.len() {
                    let a = self.attribute_ids[idx];
                    self.cell_its[f][a] = match self.tile_its[f][a].tile()
                    {
                        Some(tile) => tile.rbegin(),
                        None => TileCellRevIter::default(),
                    };
                }
            }
        }
    }

    fn advance_cell_in_range(&mut self, f: usize) {
        for idx in 0..self.attribute_ids.len() {
            let a = self.attribute_ids[idx];
            self.cell_its[f][a].advance();
        }
        self.find_next_cell_in_range(f);
    }

    fn find_next_cell_in_range(&mut self, f: usize) {
        let coords_id = self.coords_id();
        let Some(range) = self.range.clone() else {
            return;
        };

        loop {
            if !self.cell_its[f][coords_id].end() && !self.full_overlap[f]
            {
                while let Some(coords) =
                    self.cell_its[f][coords_id].cell()
                {
                    if range.contains_bytes(coords) {
                        break;
                    }
                    self.cell_its[f][coords_id].advance();
                }
            }

            if self.cell_its[f][coords_id].end() {
                self.tile_its[f][coords_id].advance();
                while !self.tile_its[f][coords_id].end() {
                    let overlap = self.tile_its[f][coords_id]
                        .mbr()
                        .map(|mbr| range.overlap_bytes(mbr));
                    match overlap {
                        Some(Overlap::None) | None => {
                            self.tile_its[f][coords_id].advance()
                        }
                        Some(overlap) => {
                            self.full_overlap[f] =
                                overlap == Overlap::Full;
                            break;
                        }
                    }
                }

                if self.tile_its[f][coords_id].end() {
                    break;
                }
                self.cell_its[f][coords_id] =
                    match self.tile_its[f][coords_id].tile() {
                        Some(tile) => tile.rbegin(),
                        None => TileCellRevIter::default(),
                    };
            } else {
                break;
            }
        }

        self.sync_attribute_its(f);
    }

    /// Re-aligns the attribute cursors with the coordinate position.
    /// A reverse cursor counts from the back, so seeking to ordinal
    /// `pos` means stepping `tile_num - pos - 1` (and likewise
    /// `cell_num - pos - 1` within the tile).
    fn sync_attribute_its(&mut self, f: usize) {
        let coords_id = self.coords_id();
        let Some(fragment) = self.array.fragment(f) else {
            return;
        };
        let tile_num = self.tile_its[f][coords_id].tile_num();
        let tile_pos = self.tile_its[f][coords_id].pos();
        let cell_num = self.cell_its[f][coords_id].cell_num();
        let cell_pos = self.cell_its[f][coords_id].pos();

        for idx in 0..self.attribute_ids.len() - 1 {
            let a = self.attribute_ids[idx];
            let mut tile_it = fragment.rbegin(a);
            tile_it.seek(tile_num - tile_pos - 1);
            self.tile_its[f][a] = tile_it;
            self.cell_its[f][a] = match self.tile_its[f][a].tile() {
                Some(tile) => {
                    let mut cell_it = tile.rbegin();
                    cell_it.seek(cell_num - cell_pos - 1);
                    cell_it
                }
                None => TileCellRevIter::default(),
            };
        }
    }

    fn init_iterators(&mut self) {
        for idx in 0..self.fragment_ids.len() {
            let f = self.fragment_ids[idx];
            let Some(fragment) = self.array.fragment(f) else {
                continue;
            };
            for jdx in 0..self.attribute_ids.len() {
                let a = self.attribute_ids[jdx];
                self.tile_its[f][a] = fragment.rbegin(a);
                self.cell_its[f][a] = match self.tile_its[f][a].tile() {
                    Some(tile) => tile.rbegin(),
                    None => TileCellRevIter::default(),
                };
            }
        }
    }

    fn init_iterators_in_range(&mut self) {
        let coords_id = self.coords_id();
        let Some(range) = self.range.clone() else {
            return;
        };

        for idx in 0..self.fragment_ids.len() {
            let f = self.fragment_ids[idx];
            let Some(fragment) = self.array.fragment(f) else {
                continue;
            };

            // Coordinate tile cursor at the last overlapping tile.
            let mut tile_it = fragment.rbegin(coords_id);
            while !tile_it.end() {
                match tile_it.mbr().map(|mbr| range.overlap_bytes(mbr)) {
                    Some(Overlap::None) | None => tile_it.advance(),
                    Some(overlap) => {
                        self.full_overlap[f] = overlap == Overlap::Full;
                        break;
                    }
                }
            }
            let tile_num = tile_it.tile_num();
            let tile_pos = tile_it.pos();
            self.tile_its[f][coords_id] = tile_it;

            for jdx in 0..self.attribute_ids.len() - 1 {
                let a = self.attribute_ids[jdx];
                let mut it = fragment.rbegin(a);
                it.seek(tile_num - tile_pos - 1);
                self.tile_its[f][a] = it;
            }

            for jdx in 0..self.attribute_ids.len() {
                let a = self.attribute_ids[jdx];
                self.cell_its[f][a] = match self.tile_its[f][a].tile() {
                    Some(tile) => tile.rbegin(),
                    None => TileCellRevIter::default(),
                };
            }
        }
    }
}
