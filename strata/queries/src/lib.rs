//! Streaming query operators over the storage core: filter, subarray,
//! join, and nearest neighbors, all built on the tile and cell cursors
//! plus a shared result-tile builder.
//!
//! The operators share one optimization discipline: only the cursors a
//! decision depends on (the expression attributes, the coordinates) are
//! walked eagerly; all other attribute cursors catch up by the
//! accumulated skip counts when a cell is actually emitted.

pub mod expression;

mod filter;
mod join;
mod knn;
mod result_tiles;
mod subarray;

#[cfg(test)]
mod tests;

use thiserror::Error;

use strata_common::coord_type_go;
use strata_common::physical::CoordinateType;
use strata_common::range::HyperRect;
use strata_core::array::Array;
use strata_core::fragment::{Fragment, FragmentTileIter};
use strata_core::storage::StorageManager;
use strata_core::tile::TileCellIter;

use expression::ExpressionTree;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Input arrays are not join-compatible: {0}")]
    NotJoinCompatible(
        #[from] strata_common::schema::JoinCompatibilityError,
    ),
    #[error("Expression references unknown attribute {0:?}")]
    UnknownAttribute(String),
    #[error("Operator requires a schema with at least one attribute")]
    NoAttributes,
    #[error(
        "Operator input must be a single-fragment array; \
         found {fragment_num} fragments"
    )]
    MultipleFragments { fragment_num: usize },
    #[error("Query point has {found} dimensions but the array has {expected}")]
    QueryDimensionMismatch { expected: usize, found: usize },
    #[error("Cursors lost synchronization while scanning")]
    LostSynchronization,
    #[error("Storage error: {0}")]
    Storage(#[from] strata_core::storage::Error),
    #[error("Array error: {0}")]
    Array(#[from] strata_core::array::Error),
    #[error("Tile error: {0}")]
    Tile(#[from] strata_core::tile::Error),
    #[error("Schema error: {0}")]
    Schema(#[from] strata_common::schema::Error),
    #[error("Datatype error: {0}")]
    Datatype(#[from] strata_common::datatype::Error),
    #[error("Fragment error: {0}")]
    Fragment(#[from] strata_core::fragment::Error),
}

pub(crate) type Result<T> = std::result::Result<T, Error>;

/// Executes queries against arrays held by one storage manager, writing
/// each operator's output as a new array.
///
/// Operators run in a single streaming pass and address consolidated
/// (single-fragment) input arrays; merge across fragments first with the
/// array-level iterators if needed. On failure the staged result
/// fragment is abandoned unregistered.
pub struct QueryProcessor<'sm> {
    storage: &'sm StorageManager,
    stats: Option<std::sync::Arc<strata_common::stats::Stats>>,
}

impl<'sm> QueryProcessor<'sm> {
    pub fn new(storage: &'sm StorageManager) -> Self {
        QueryProcessor {
            storage,
            stats: None,
        }
    }

    /// Attaches a statistics collector; operators bump its
    /// `result_cells` and `result_tiles_flushed` counters.
    pub fn with_stats(
        storage: &'sm StorageManager,
        stats: std::sync::Arc<strata_common::stats::Stats>,
    ) -> Self {
        QueryProcessor {
            storage,
            stats: Some(stats),
        }
    }

    pub(crate) fn storage(&self) -> &'sm StorageManager {
        self.storage
    }

    pub(crate) fn stats(
        &self,
    ) -> Option<std::sync::Arc<strata_common::stats::Stats>> {
        self.stats.clone()
    }

    /// Writes the cells satisfying `expression` to a new array named
    /// `result_array_name`, preserving the input schema and order.
    pub fn filter(
        &self,
        array: &Array,
        expression: &dyn ExpressionTree,
        result_array_name: &str,
    ) -> Result<()> {
        let result_schema =
            array.schema().clone_as(result_array_name);
        if array.schema().has_regular_tiles() {
            filter::filter_regular(self, array, expression, result_schema)
        } else {
            filter::filter_irregular(
                self,
                array,
                expression,
                result_schema,
            )
        }
    }

    /// Writes the cells inside `range` to a new array named
    /// `result_array_name`.
    pub fn subarray<T: CoordinateType>(
        &self,
        array: &Array,
        range: &HyperRect<T>,
        result_array_name: &str,
    ) -> Result<()> {
        array.schema().check_range(range)?;
        let result_schema =
            array.schema().clone_as(result_array_name);
        if array.schema().has_regular_tiles() {
            subarray::subarray_regular(self, array, range, result_schema)
        } else {
            subarray::subarray_irregular(
                self,
                array,
                range,
                result_schema,
            )
        }
    }

    /// Equi-joins two arrays on coordinates. The output carries the
    /// attributes of `a` followed by the attributes of `b`.
    pub fn join(
        &self,
        a: &Array,
        b: &Array,
        result_array_name: &str,
    ) -> Result<()> {
        let result_schema =
            strata_common::schema::ArraySchema::join_result_schema(
                a.schema(),
                b.schema(),
                result_array_name,
            )?;

        coord_type_go!(
            a.schema().coord_type(),
            DT,
            {
                if a.schema().has_regular_tiles() {
                    join::join_regular::<DT>(self, a, b, result_schema)
                } else {
                    join::join_irregular::<DT>(self, a, b, result_schema)
                }
            },
            unreachable!("schemas validate their coordinate type")
        )
    }

    /// Writes the `k` cells nearest to `q` (Euclidean distance on
    /// coordinates) to a new array named `result_array_name`.
    pub fn nearest_neighbors(
        &self,
        array: &Array,
        q: &[f64],
        k: usize,
        result_array_name: &str,
    ) -> Result<()> {
        if q.len() != array.schema().dim_num() {
            return Err(Error::QueryDimensionMismatch {
                expected: array.schema().dim_num(),
                found: q.len(),
            });
        }
        let result_schema =
            array.schema().clone_as(result_array_name);
        if array.schema().has_regular_tiles() {
            knn::nearest_neighbors_regular(self, array, q, k, result_schema)
        } else {
            knn::nearest_neighbors_irregular(
                self,
                array,
                q,
                k,
                result_schema,
            )
        }
    }
}

/// The consolidated input fragment of an operator, or `None` for an
/// empty input array.
pub(crate) fn single_fragment(array: &Array) -> Result<Option<&Fragment>> {
    match array.fragment_num() {
        0 => Ok(None),
        1 => Ok(array.fragment(0)),
        fragment_num => Err(Error::MultipleFragments { fragment_num }),
    }
}

/// The cell cursor at the start of a tile cursor's current tile.
pub(crate) fn tile_begin<'a>(it: &FragmentTileIter<'a>) -> TileCellIter<'a> {
    it.tile().map(|t| t.begin()).unwrap_or_default()
}

pub(crate) fn advance_cell_its(
    cell_its: &mut [TileCellIter],
    ids: &[usize],
) {
    for id in ids {
        cell_its[*id].advance();
    }
}

pub(crate) fn seek_cell_its(
    cell_its: &mut [TileCellIter],
    ids: &[usize],
    step: i64,
) {
    for id in ids {
        cell_its[*id].seek(step);
    }
}

pub(crate) fn advance_tile_its(
    tile_its: &mut [FragmentTileIter],
    ids: &[usize],
) {
    for id in ids {
        tile_its[*id].advance();
    }
}

pub(crate) fn seek_tile_its(
    tile_its: &mut [FragmentTileIter],
    ids: &[usize],
    step: i64,
) {
    for id in ids {
        tile_its[*id].seek(step);
    }
}

pub(crate) fn initialize_cell_its<'a>(
    tile_its: &[FragmentTileIter<'a>],
    cell_its: &mut [TileCellIter<'a>],
    ids: &[usize],
) {
    for id in ids {
        cell_its[*id] = tile_begin(&tile_its[*id]);
    }
}
