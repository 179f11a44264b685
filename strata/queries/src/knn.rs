use std::cmp::Ordering;
use std::collections::BinaryHeap;

use strata_common::coord_type_go;
use strata_common::schema::ArraySchema;
use strata_core::array::Array;
use strata_core::tile::Tile;

use crate::result_tiles::ResultTiles;
use crate::{single_fragment, QueryProcessor, Result};

/// A coordinate tile's rank paired with the minimum distance from the
/// query point to its MBR.
struct DistRank {
    dist: f64,
    rank: usize,
}

/// A candidate neighbor. Ordered by distance so that a [BinaryHeap]
/// keeps the worst of the current top k on top.
struct Neighbor {
    dist: f64,
    rank: usize,
    pos: u64,
    coords: Vec<u8>,
}

impl PartialEq for Neighbor {
    fn eq(&self, other: &Self) -> bool {
        self.dist.total_cmp(&other.dist) == Ordering::Equal
    }
}

impl Eq for Neighbor {}

impl PartialOrd for Neighbor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Neighbor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist.total_cmp(&other.dist)
    }
}

fn decode_coords_f64(schema: &ArraySchema, bytes: &[u8]) -> Vec<f64> {
    coord_type_go!(
        schema.coord_type(),
        DT,
        strata_common::physical::decode_iter::<DT>(bytes)
            .map(|v| strata_common::physical::PhysicalType::to_f64(v))
            .collect(),
        unreachable!("schemas validate their coordinate type")
    )
}

/// Minimum Euclidean distance from `q` to an MBR given as flat
/// `(lo, hi, ...)` values.
fn point_to_mbr_distance(q: &[f64], mbr: &[f64]) -> f64 {
    debug_assert_eq!(2 * q.len(), mbr.len());

    let mut dist = 0.0;
    for (d, qd) in q.iter().enumerate() {
        let width = mbr[2 * d + 1] - mbr[2 * d];
        let centroid = mbr[2 * d] + width / 2.0;
        let dq = ((qd - centroid).abs() - width / 2.0).max(0.0);
        dist += dq * dq;
    }
    dist.sqrt()
}

fn point_to_point_distance(q: &[f64], p: &[f64]) -> f64 {
    debug_assert_eq!(q.len(), p.len());

    let mut dist = 0.0;
    for (qd, pd) in q.iter().zip(p.iter()) {
        let diff = qd - pd;
        dist += diff * diff;
    }
    dist.sqrt()
}

/// Ranks every coordinate tile by the distance from `q` to its MBR,
/// nearest first.
fn compute_sorted_dist_ranks(
    array: &Array,
    q: &[f64],
) -> Result<Vec<DistRank>> {
    let Some(fragment) = single_fragment(array)? else {
        return Ok(Vec::new());
    };
    let coords_id = array.schema().coords_id();

    let mut dist_ranks = Vec::with_capacity(fragment.tile_num());
    for rank in 0..fragment.tile_num() {
        let Some(mbr) =
            fragment.tile(coords_id, rank).and_then(Tile::mbr)
        else {
            continue;
        };
        let mbr = decode_coords_f64(array.schema(), mbr);
        dist_ranks.push(DistRank {
            dist: point_to_mbr_distance(q, &mbr),
            rank,
        });
    }
    dist_ranks.sort_by(|a, b| a.dist.total_cmp(&b.dist));
    Ok(dist_ranks)
}

/// Walks the distance-sorted tiles keeping a bounded max-heap of the `k`
/// nearest cells; stops as soon as the next tile's MBR distance exceeds
/// the current k-th best. The survivors come back sorted on
/// `(rank, pos)` so attribute fetches per tile are contiguous.
fn compute_sorted_knn_coords(
    qp: &QueryProcessor,
    array: &Array,
    q: &[f64],
    k: usize,
    sorted_dist_ranks: &[DistRank],
) -> Result<Vec<Neighbor>> {
    if k == 0 {
        return Ok(Vec::new());
    }
    let coords_id = array.schema().coords_id();
    let mut knn: BinaryHeap<Neighbor> = BinaryHeap::with_capacity(k + 1);

    for dist_rank in sorted_dist_ranks {
        if knn.len() == k {
            let worst = knn.peek().map(|n| n.dist).unwrap_or(f64::MAX);
            if dist_rank.dist > worst {
                break;
            }
        }

        let tile = qp.storage().get_tile_by_rank(
            array,
            coords_id,
            dist_rank.rank,
        )?;
        for pos in 0..tile.cell_num() {
            let coords = tile.cell(pos)?;
            let point = decode_coords_f64(array.schema(), coords);
            let dist = point_to_point_distance(q, &point);
            let worst = knn.peek().map(|n| n.dist).unwrap_or(f64::MAX);
            if knn.len() < k || dist < worst {
                knn.push(Neighbor {
                    dist,
                    rank: dist_rank.rank,
                    pos,
                    coords: coords.to_vec(),
                });
                if knn.len() > k {
                    knn.pop();
                }
            }
        }
    }

    let mut neighbors = knn.into_vec();
    neighbors.sort_by(|a, b| (a.rank, a.pos).cmp(&(b.rank, b.pos)));
    Ok(neighbors)
}

pub(crate) fn nearest_neighbors_irregular(
    qp: &QueryProcessor,
    array: &Array,
    q: &[f64],
    k: usize,
    result_schema: ArraySchema,
) -> Result<()> {
    let attribute_num = array.schema().attribute_num();
    let capacity = result_schema.capacity();

    let sorted_dist_ranks = compute_sorted_dist_ranks(array, q)?;
    let neighbors =
        compute_sorted_knn_coords(qp, array, q, k, &sorted_dist_ranks)?;

    let mut result = ResultTiles::create(qp, result_schema)?;
    let mut current_rank: Option<usize> = None;
    let mut tiles: Vec<&Tile> = Vec::new();

    for neighbor in &neighbors {
        if current_rank != Some(neighbor.rank) {
            current_rank = Some(neighbor.rank);
            tiles = (0..attribute_num)
                .map(|id| {
                    qp.storage().get_tile_by_rank(array, id, neighbor.rank)
                })
                .collect::<std::result::Result<_, _>>()?;
        }

        if result.cell_num() == capacity {
            let next = result.tile_id() + 1;
            result.roll(next)?;
        }

        let attr_cells = tiles
            .iter()
            .map(|t| t.cell(neighbor.pos))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        result.append_with_coords(&neighbor.coords, &attr_cells)?;
    }

    result.finish()
}

pub(crate) fn nearest_neighbors_regular(
    qp: &QueryProcessor,
    array: &Array,
    q: &[f64],
    k: usize,
    result_schema: ArraySchema,
) -> Result<()> {
    let schema = array.schema();
    let attribute_num = schema.attribute_num();
    let coords_id = schema.coords_id();

    let sorted_dist_ranks = compute_sorted_dist_ranks(array, q)?;
    let neighbors =
        compute_sorted_knn_coords(qp, array, q, k, &sorted_dist_ranks)?;

    let mut result = ResultTiles::create(qp, result_schema)?;
    let mut current_rank: Option<usize> = None;
    let mut tiles: Vec<&Tile> = Vec::new();

    for neighbor in &neighbors {
        if current_rank != Some(neighbor.rank) {
            current_rank = Some(neighbor.rank);
            tiles = (0..attribute_num)
                .map(|id| {
                    qp.storage().get_tile_by_rank(array, id, neighbor.rank)
                })
                .collect::<std::result::Result<_, _>>()?;

            // Result tiles mirror the input tile ids.
            let input_tile_id = qp
                .storage()
                .get_tile_by_rank(array, coords_id, neighbor.rank)?
                .tile_id();
            result.roll(input_tile_id)?;
        }

        let attr_cells = tiles
            .iter()
            .map(|t| t.cell(neighbor.pos))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        result.append_with_coords(&neighbor.coords, &attr_cells)?;
    }

    result.finish()
}
