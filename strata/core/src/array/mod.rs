mod cell_iter;
mod dense_cell_iter;
mod reverse_cell_iter;


pub use cell_iter::ArrayCellIter;
pub use dense_cell_iter::ArrayDenseCellIter;
pub use reverse_cell_iter::ArrayCellRevIter;

use std::sync::Arc;

use thiserror::Error;

use strata_common::physical::CoordinateType;
use strata_common::range::HyperRect;
use strata_common::schema::ArraySchema;
use strata_common::stats::Stats;

use crate::fragment::{Fragment, FragmentTileIter, FragmentTileRevIter};

/// Initial merged-cell buffer size (in bytes) for variable-sized cells.
/// It keeps doubling from there as larger cells arrive.
pub(crate) const CELL_BUFFER_INITIAL_SIZE: usize = 40000;

#[derive(Clone, Debug, Error, PartialEq)]
pub enum Error {
    #[error("Invalid fragment id {fragment_id}: array has {fragment_num} fragments")]
    InvalidFragmentId {
        fragment_id: usize,
        fragment_num: usize,
    },
    #[error("An iterator requires at least one fragment")]
    EmptyFragmentSelection,
    #[error("Attribute iterators lost synchronization in fragment {fragment_id}")]
    LostSynchronization { fragment_id: usize },
    #[error("Schema error: {0}")]
    Schema(#[from] strata_common::schema::Error),
    #[error("Range error: {0}")]
    Range(#[from] strata_common::range::Error),
    #[error("Tile error: {0}")]
    Tile(#[from] crate::tile::Error),
}

#[derive(Debug)]
pub(crate) struct ArrayData {
    schema: ArraySchema,
    fragments: Vec<Arc<Fragment>>,
}

impl ArrayData {
    pub(crate) fn new(
        schema: ArraySchema,
        fragments: Vec<Arc<Fragment>>,
    ) -> Self {
        ArrayData { schema, fragments }
    }

    pub(crate) fn schema(&self) -> &ArraySchema {
        &self.schema
    }

    pub(crate) fn fragments_arcs(&self) -> &[Arc<Fragment>] {
        &self.fragments
    }
}

/// An open array descriptor: a schema plus a snapshot of the fragments
/// that existed when the array was opened.
///
/// The snapshot is shared, so cloning and holding descriptors is cheap
/// and tile references obtained through one stay valid for its lifetime.
#[derive(Clone, Debug)]
pub struct Array {
    data: Arc<ArrayData>,
}

impl Array {
    pub(crate) fn new(data: Arc<ArrayData>) -> Self {
        Array { data }
    }

    pub fn schema(&self) -> &ArraySchema {
        self.data.schema()
    }

    pub fn fragment_num(&self) -> usize {
        self.data.fragments.len()
    }

    pub fn fragment(&self, fragment_id: usize) -> Option<&Fragment> {
        self.data.fragments.get(fragment_id).map(|f| &**f)
    }

    /// True iff every fragment holds zero tiles.
    pub fn empty(&self) -> bool {
        self.data.fragments.iter().all(|f| f.is_empty())
    }

    fn check_ids(
        &self,
        fragment_id: usize,
        attribute_id: usize,
    ) -> Result<(), Error> {
        if fragment_id >= self.fragment_num() {
            return Err(Error::InvalidFragmentId {
                fragment_id,
                fragment_num: self.fragment_num(),
            });
        }
        self.schema().check_attribute_ids(&[attribute_id])?;
        Ok(())
    }

    /// A forward tile cursor over one `(fragment, attribute)` column.
    pub fn begin(
        &self,
        fragment_id: usize,
        attribute_id: usize,
    ) -> Result<FragmentTileIter<'_>, Error> {
        self.check_ids(fragment_id, attribute_id)?;
        Ok(self.data.fragments[fragment_id].begin(attribute_id))
    }

    /// A reverse tile cursor over one `(fragment, attribute)` column.
    pub fn rbegin(
        &self,
        fragment_id: usize,
        attribute_id: usize,
    ) -> Result<FragmentTileRevIter<'_>, Error> {
        self.check_ids(fragment_id, attribute_id)?;
        Ok(self.data.fragments[fragment_id].rbegin(attribute_id))
    }

    /// Starts configuring an array-level cell iterator.
    pub fn cell_iter<T: CoordinateType>(&self) -> CellIterBuilder<'_, T> {
        CellIterBuilder {
            array: self,
            fragment_ids: None,
            attribute_ids: None,
            range: None,
            return_deletions: false,
            stats: None,
        }
    }
}

/// Configures an array-level cell iterator: fragment subset, attribute
/// projection, range restriction, direction, and deletion visibility.
pub struct CellIterBuilder<'a, T: CoordinateType> {
    pub(crate) array: &'a Array,
    pub(crate) fragment_ids: Option<Vec<usize>>,
    pub(crate) attribute_ids: Option<Vec<usize>>,
    pub(crate) range: Option<HyperRect<T>>,
    pub(crate) return_deletions: bool,
    pub(crate) stats: Option<Arc<Stats>>,
}

impl<'a, T: CoordinateType> CellIterBuilder<'a, T> {
    /// Restricts the iterator to the given fragments. Defaults to all.
    pub fn fragments(mut self, fragment_ids: Vec<usize>) -> Self {
        self.fragment_ids = Some(fragment_ids);
        self
    }

    /// Projects the given attributes. Defaults to all. The coordinate
    /// column is always included, and when deletions are suppressed the
    /// schema's smallest attribute is carried for tombstone probing.
    pub fn attributes(mut self, attribute_ids: Vec<usize>) -> Self {
        self.attribute_ids = Some(attribute_ids);
        self
    }

    /// Restricts iteration to cells whose coordinates fall in `range`.
    pub fn range(mut self, range: HyperRect<T>) -> Self {
        self.range = Some(range);
        self
    }

    /// Emits deletion cells instead of suppressing them.
    pub fn return_deletions(mut self, return_deletions: bool) -> Self {
        self.return_deletions = return_deletions;
        self
    }

    /// Attaches a statistics collector; the iterator bumps its
    /// `cells_emitted` counter.
    pub fn stats(mut self, stats: Arc<Stats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Validates the selection and resolves the canonical id lists.
    pub(crate) fn resolve(
        &self,
    ) -> Result<(Vec<usize>, Vec<usize>), Error> {
        let schema = self.array.schema();
        if let Some(range) = &self.range {
            schema.check_range(range)?;
        } else if !schema.coord_type().is_compatible_type::<T>() {
            return Err(Error::Schema(
                strata_common::schema::Error::CoordinateTypeMismatch(
                    schema.coord_type(),
                ),
            ));
        }

        let mut fragment_ids = match &self.fragment_ids {
            Some(ids) => {
                for id in ids {
                    if *id >= self.array.fragment_num() {
                        return Err(Error::InvalidFragmentId {
                            fragment_id: *id,
                            fragment_num: self.array.fragment_num(),
                        });
                    }
                }
                ids.clone()
            }
            None => (0..self.array.fragment_num()).collect(),
        };
        // Ascending order so that a coordinate tie always resolves to
        // the fragment latest in the array's fragment order.
        fragment_ids.sort_unstable();
        fragment_ids.dedup();
        if fragment_ids.is_empty() && self.array.fragment_num() > 0 {
            return Err(Error::EmptyFragmentSelection);
        }

        let mut attribute_ids = match &self.attribute_ids {
            Some(ids) => {
                schema.check_attribute_ids(ids)?;
                ids.clone()
            }
            None => (0..schema.attribute_num()).collect(),
        };
        // Tombstone probing reads the first projected attribute; make
        // sure there is one when the projection is bare coordinates.
        let has_attribute = attribute_ids
            .iter()
            .any(|id| *id != schema.coords_id());
        if !has_attribute {
            if let Some(smallest) = schema.smallest_attribute() {
                attribute_ids.push(smallest);
            }
        }
        // Coordinates drive the merge and always come last.
        attribute_ids.retain(|id| *id != schema.coords_id());
        attribute_ids.sort_unstable();
        attribute_ids.dedup();
        attribute_ids.push(schema.coords_id());

        Ok((fragment_ids, attribute_ids))
    }

    pub fn build(self) -> Result<ArrayCellIter<'a, T>, Error> {
        ArrayCellIter::from_builder(self)
    }

    pub fn build_reverse(self) -> Result<ArrayCellRevIter<'a, T>, Error> {
        ArrayCellRevIter::from_builder(self)
    }

    pub fn build_dense(self) -> Result<ArrayDenseCellIter<'a, T>, Error> {
        ArrayDenseCellIter::from_builder(self)
    }
}
