use itertools::Itertools;
use proptest::prelude::*;

use strata_common::datatype::{CellValNum, Datatype};
use strata_common::physical::{decode_iter, encode_values};
use strata_common::range::HyperRect;
use strata_common::schema::{
    ArraySchema, AttributeSchema, CellOrder, DimensionSchema, Tiling,
};
use strata_core::fragment::FragmentWriter;
use strata_core::storage::StorageManager;

use crate::expression::FnExpression;
use crate::{Error, QueryProcessor};

/// 2-D i32 schema with i32 attributes named `a`, `b`, ... as requested.
fn schema(
    name: &str,
    attribute_names: &[&str],
    capacity: u64,
    tiling: Tiling,
) -> ArraySchema {
    ArraySchema::new(
        name,
        vec![
            DimensionSchema::new("i", [1.0, 8.0]),
            DimensionSchema::new("j", [1.0, 8.0]),
        ],
        Datatype::Int32,
        attribute_names
            .iter()
            .map(|n| {
                AttributeSchema::new(*n, Datatype::Int32, CellValNum::single())
            })
            .collect(),
        capacity,
        CellOrder::RowMajor,
        tiling,
    )
    .unwrap()
}

/// Defines the array and writes one fragment of `([i, j], attrs)` cells.
fn build_array(
    sm: &StorageManager,
    schema: &ArraySchema,
    cells: &[([i32; 2], &[i32])],
) {
    sm.define_array(schema.clone()).unwrap();
    let mut writer = FragmentWriter::<i32>::new(schema).unwrap();
    for (coords, attrs) in cells {
        let encoded = attrs
            .iter()
            .map(|v| encode_values(&[*v]))
            .collect::<Vec<_>>();
        let refs = encoded.iter().map(Vec::as_slice).collect::<Vec<_>>();
        writer.write_cell(coords, &refs).unwrap();
    }
    sm.write_fragment(schema.array_name(), writer.finish().unwrap())
        .unwrap();
}

/// Reads an array's full merge stream, each cell decoded as a flat
/// `i32` record `[i, j, attrs...]`.
fn read_all(sm: &StorageManager, name: &str) -> Vec<Vec<i32>> {
    let array = sm.open_array(name).unwrap();
    let mut it = array.cell_iter::<i32>().build().unwrap();
    let mut out = Vec::new();
    while let Some(cell) = it.cell() {
        out.push(decode_iter::<i32>(cell).collect());
        it.advance();
    }
    assert!(it.error().is_none());
    out
}

fn rows(cells: &[[i32; 4]]) -> Vec<Vec<i32>> {
    cells.iter().map(|c| c.to_vec()).collect()
}

#[test]
fn filter_with_constant_true_equals_the_merge_stream() {
    let sm = StorageManager::new();
    let input = schema("in", &["a"], 2, Tiling::Irregular);
    build_array(
        &sm,
        &input,
        &[([1, 1], &[10]), ([1, 2], &[20]), ([2, 1], &[30])],
    );

    let qp = QueryProcessor::new(&sm);
    let always = FnExpression::new(Vec::<&str>::new(), |_| true);
    qp.filter(&sm.open_array("in").unwrap(), &always, "out")
        .unwrap();

    assert_eq!(read_all(&sm, "in"), read_all(&sm, "out"));
}

#[test]
fn filter_emits_the_satisfying_subset_in_order() {
    let sm = StorageManager::new();
    // capacity 2 so the scan crosses tile boundaries
    let input = schema("in", &["a", "b"], 2, Tiling::Irregular);
    build_array(
        &sm,
        &input,
        &[
            ([1, 1], &[1, 10]),
            ([1, 2], &[4, 20]),
            ([2, 1], &[2, 30]),
            ([2, 2], &[5, 40]),
            ([3, 1], &[3, 50]),
        ],
    );

    let qp = QueryProcessor::new(&sm);
    let expr = FnExpression::new(vec!["a"], |b| b["a"] >= 3.0);
    qp.filter(&sm.open_array("in").unwrap(), &expr, "out")
        .unwrap();

    // `b` values must come from the same cells as the matching `a`
    // values, which exercises the lazy catch-up of non-expression
    // cursors across skipped cells and tiles.
    assert_eq!(
        rows(&[[1, 2, 4, 20], [2, 2, 5, 40], [3, 1, 3, 50]]),
        read_all(&sm, "out")
    );
}

#[test]
fn filter_regular_catches_up_after_first_match() {
    let sm = StorageManager::new();
    let input = schema(
        "in",
        &["a", "b"],
        100,
        Tiling::Regular {
            extents: vec![8.0, 8.0],
            tile_order: CellOrder::RowMajor,
        },
    );
    // one tile holding all four cells
    build_array(
        &sm,
        &input,
        &[
            ([1, 1], &[1, 10]),
            ([1, 2], &[2, 20]),
            ([1, 3], &[3, 30]),
            ([1, 4], &[4, 40]),
        ],
    );

    let qp = QueryProcessor::new(&sm);
    let expr = FnExpression::new(vec!["a"], |b| {
        b["a"] == 2.0 || b["a"] == 4.0
    });
    qp.filter(&sm.open_array("in").unwrap(), &expr, "out")
        .unwrap();

    // The second match must carry b = 40. Re-initializing the
    // non-expression cursors before it would replay b = 20.
    assert_eq!(
        rows(&[[1, 2, 2, 20], [1, 4, 4, 40]]),
        read_all(&sm, "out")
    );
}

#[test]
fn filter_unknown_attribute_is_an_error() {
    let sm = StorageManager::new();
    let input = schema("in", &["a"], 2, Tiling::Irregular);
    build_array(&sm, &input, &[([1, 1], &[10])]);

    let qp = QueryProcessor::new(&sm);
    let expr = FnExpression::new(vec!["nope"], |_| true);
    let err = qp
        .filter(&sm.open_array("in").unwrap(), &expr, "out")
        .unwrap_err();
    assert!(matches!(err, Error::UnknownAttribute(name) if name == "nope"));

    // nothing was registered for the abandoned result
    assert!(sm.open_array("out").is_err());
}

#[test]
fn operators_reject_multi_fragment_input() {
    let sm = StorageManager::new();
    let input = schema("in", &["a"], 2, Tiling::Irregular);
    build_array(&sm, &input, &[([1, 1], &[10])]);
    let mut writer = FragmentWriter::<i32>::new(&input).unwrap();
    writer.write_cell(&[2, 2], &[&encode_values(&[5i32])]).unwrap();
    sm.write_fragment("in", writer.finish().unwrap()).unwrap();

    let qp = QueryProcessor::new(&sm);
    let always = FnExpression::new(Vec::<&str>::new(), |_| true);
    let err = qp
        .filter(&sm.open_array("in").unwrap(), &always, "out")
        .unwrap_err();
    assert!(matches!(err, Error::MultipleFragments { fragment_num: 2 }));
}

#[test]
fn subarray_with_the_domain_equals_the_merge_stream() -> anyhow::Result<()>
{
    let sm = StorageManager::new();
    let input = schema("in", &["a"], 2, Tiling::Irregular);
    build_array(
        &sm,
        &input,
        &[([1, 1], &[10]), ([1, 2], &[20]), ([2, 1], &[30])],
    );

    let qp = QueryProcessor::new(&sm);
    let domain = input.domain_rect::<i32>()?;
    qp.subarray(&sm.open_array("in")?, &domain, "out")?;

    assert_eq!(read_all(&sm, "in"), read_all(&sm, "out"));
    Ok(())
}

#[test]
fn subarray_irregular_keeps_in_range_cells_in_order() {
    let sm = StorageManager::new();
    let input = schema("in", &["a"], 2, Tiling::Irregular);
    build_array(
        &sm,
        &input,
        &[
            ([1, 1], &[10]),
            ([1, 2], &[20]),
            ([2, 1], &[30]),
            ([2, 2], &[40]),
            ([5, 5], &[50]),
        ],
    );

    let qp = QueryProcessor::new(&sm);
    let range = HyperRect::new(vec![[1, 2], [2, 2]]).unwrap();
    qp.subarray(&sm.open_array("in").unwrap(), &range, "out")
        .unwrap();

    assert_eq!(
        vec![vec![1, 2, 20], vec![2, 2, 40]],
        read_all(&sm, "out")
    );
}

#[test]
fn subarray_regular_walks_partial_tiles() {
    let sm = StorageManager::new();
    let input = schema(
        "in",
        &["a"],
        100,
        Tiling::Regular {
            extents: vec![8.0, 2.0],
            tile_order: CellOrder::RowMajor,
        },
    );
    // tiles: id 0 holds cols 1-2, id 1 holds cols 3-4
    build_array(
        &sm,
        &input,
        &[
            ([1, 1], &[10]),
            ([1, 2], &[20]),
            ([1, 3], &[30]),
            ([1, 4], &[40]),
        ],
    );

    let qp = QueryProcessor::new(&sm);
    let range = HyperRect::new(vec![[1, 8], [2, 3]]).unwrap();
    qp.subarray(&sm.open_array("in").unwrap(), &range, "out")
        .unwrap();

    assert_eq!(
        vec![vec![1, 2, 20], vec![1, 3, 30]],
        read_all(&sm, "out")
    );
}

#[test]
fn join_concatenates_attributes_of_matching_cells() {
    let sm = StorageManager::new();
    let left = schema("left", &["a"], 2, Tiling::Irregular);
    build_array(
        &sm,
        &left,
        &[([1, 1], &[1]), ([1, 2], &[2]), ([2, 1], &[3])],
    );
    let right = schema("right", &["b"], 2, Tiling::Irregular);
    build_array(
        &sm,
        &right,
        &[([1, 2], &[20]), ([2, 1], &[30]), ([2, 2], &[40])],
    );

    let qp = QueryProcessor::new(&sm);
    qp.join(
        &sm.open_array("left").unwrap(),
        &sm.open_array("right").unwrap(),
        "joined",
    )
    .unwrap();

    assert_eq!(
        rows(&[[1, 2, 2, 20], [2, 1, 3, 30]]),
        read_all(&sm, "joined")
    );
}

#[test]
fn join_of_an_array_with_itself_duplicates_attributes() {
    let sm = StorageManager::new();
    let input = schema("in", &["a"], 2, Tiling::Irregular);
    build_array(
        &sm,
        &input,
        &[([1, 1], &[10]), ([1, 2], &[20]), ([2, 1], &[30])],
    );

    let qp = QueryProcessor::new(&sm);
    let array = sm.open_array("in").unwrap();
    qp.join(&array, &array, "selfjoin").unwrap();

    assert_eq!(
        rows(&[[1, 1, 10, 10], [1, 2, 20, 20], [2, 1, 30, 30]]),
        read_all(&sm, "selfjoin")
    );
}

#[test]
fn join_regular_pairs_tiles_by_id() {
    let tiling = Tiling::Regular {
        extents: vec![8.0, 2.0],
        tile_order: CellOrder::RowMajor,
    };
    let sm = StorageManager::new();
    let left = schema("left", &["a"], 100, tiling.clone());
    build_array(
        &sm,
        &left,
        &[([1, 1], &[1]), ([1, 3], &[2]), ([1, 5], &[3])],
    );
    let right = schema("right", &["b"], 100, tiling);
    build_array(&sm, &right, &[([1, 3], &[20]), ([1, 6], &[30])]);

    let qp = QueryProcessor::new(&sm);
    qp.join(
        &sm.open_array("left").unwrap(),
        &sm.open_array("right").unwrap(),
        "joined",
    )
    .unwrap();

    assert_eq!(rows(&[[1, 3, 2, 20]]), read_all(&sm, "joined"));
}

#[test]
fn join_requires_compatible_schemas() {
    let sm = StorageManager::new();
    let left = schema("left", &["a"], 2, Tiling::Irregular);
    build_array(&sm, &left, &[([1, 1], &[1])]);
    let right = schema(
        "right",
        &["b"],
        100,
        Tiling::Regular {
            extents: vec![2.0, 2.0],
            tile_order: CellOrder::RowMajor,
        },
    );
    build_array(&sm, &right, &[([1, 1], &[2])]);

    let qp = QueryProcessor::new(&sm);
    let err = qp
        .join(
            &sm.open_array("left").unwrap(),
            &sm.open_array("right").unwrap(),
            "joined",
        )
        .unwrap_err();
    assert!(matches!(err, Error::NotJoinCompatible(_)));
}

#[test]
fn nearest_neighbors_returns_the_k_closest_cells() {
    let sm = StorageManager::new();
    let input = schema("in", &["a"], 2, Tiling::Irregular);
    build_array(
        &sm,
        &input,
        &[
            ([1, 1], &[10]),
            ([1, 2], &[20]),
            ([2, 1], &[30]),
            ([8, 8], &[80]),
        ],
    );

    let qp = QueryProcessor::new(&sm);
    qp.nearest_neighbors(
        &sm.open_array("in").unwrap(),
        &[1.4, 1.0],
        2,
        "out",
    )
    .unwrap();

    // nearest are (1,1) at 0.4 and (2,1) at 0.6; output is re-sorted
    // on (tile rank, position) for contiguous attribute fetches
    assert_eq!(
        vec![vec![1, 1, 10], vec![2, 1, 30]],
        read_all(&sm, "out")
    );
}

#[test]
fn nearest_neighbors_with_k_zero_is_empty() {
    let sm = StorageManager::new();
    let input = schema("in", &["a"], 2, Tiling::Irregular);
    build_array(&sm, &input, &[([1, 1], &[10])]);

    let qp = QueryProcessor::new(&sm);
    qp.nearest_neighbors(&sm.open_array("in").unwrap(), &[1.0, 1.0], 0, "out")
        .unwrap();

    assert!(read_all(&sm, "out").is_empty());
}

#[test]
fn nearest_neighbors_regular_mirrors_input_tile_ids() {
    let sm = StorageManager::new();
    let input = schema(
        "in",
        &["a"],
        100,
        Tiling::Regular {
            extents: vec![8.0, 2.0],
            tile_order: CellOrder::RowMajor,
        },
    );
    build_array(
        &sm,
        &input,
        &[([1, 1], &[10]), ([1, 3], &[30]), ([1, 5], &[50])],
    );

    let qp = QueryProcessor::new(&sm);
    qp.nearest_neighbors(
        &sm.open_array("in").unwrap(),
        &[1.0, 3.0],
        2,
        "out",
    )
    .unwrap();

    // (1,3) at distance 0 and (1,1) at distance 2
    assert_eq!(
        vec![vec![1, 1, 10], vec![1, 3, 30]],
        read_all(&sm, "out")
    );

    let out = sm.open_array("out").unwrap();
    let fragment = out.fragment(0).unwrap();
    let coords_id = out.schema().coords_id();
    // result tiles carry the ids of the input tiles the cells came from
    let ids = (0..fragment.tile_num())
        .map(|pos| fragment.tile(coords_id, pos).unwrap().tile_id())
        .collect::<Vec<_>>();
    assert_eq!(vec![0, 1], ids);
}

proptest! {
    /// Filter output equals the model subset satisfying the predicate,
    /// in unchanged relative order, for arbitrary cell sets and tile
    /// capacities.
    #[test]
    fn filter_matches_threshold_model(
        cells in proptest::collection::btree_map(
            ((1..=8i32), (1..=8i32)),
            -100..100i32,
            0..20,
        ),
        threshold in -100..100i32,
        capacity in 1u64..4,
    ) {
        let sm = StorageManager::new();
        let input =
            schema("propfilter", &["a"], capacity, Tiling::Irregular);
        sm.define_array(input.clone()).unwrap();
        let mut writer = FragmentWriter::<i32>::new(&input).unwrap();
        for ((i, j), v) in &cells {
            writer
                .write_cell(&[*i, *j], &[&encode_values(&[*v])])
                .unwrap();
        }
        sm.write_fragment("propfilter", writer.finish().unwrap())
            .unwrap();

        let qp = QueryProcessor::new(&sm);
        let expr = FnExpression::new(vec!["a"], move |b| {
            b["a"] >= threshold as f64
        });
        qp.filter(&sm.open_array("propfilter").unwrap(), &expr, "out")
            .unwrap();

        let expected = cells
            .iter()
            .filter(|(_, v)| **v >= threshold)
            .map(|((i, j), v)| vec![*i, *j, *v])
            .collect_vec();
        prop_assert_eq!(expected, read_all(&sm, "out"));
    }
}

#[test]
fn operator_stats_count_result_cells_and_tiles() {
    let sm = StorageManager::new();
    let input = schema("in", &["a"], 2, Tiling::Irregular);
    build_array(
        &sm,
        &input,
        &[([1, 1], &[10]), ([1, 2], &[20]), ([2, 1], &[30])],
    );

    let stats = strata_common::stats::Stats::new("filter");
    let qp =
        QueryProcessor::with_stats(&sm, std::sync::Arc::clone(&stats));
    let always = FnExpression::new(Vec::<&str>::new(), |_| true);
    qp.filter(&sm.open_array("in").unwrap(), &always, "out")
        .unwrap();

    assert_eq!(3, stats.counter("result_cells"));
    assert_eq!(2, stats.counter("result_tiles_flushed"));
}

#[test]
fn empty_input_produces_an_empty_result_array() {
    let sm = StorageManager::new();
    let input = schema("in", &["a"], 2, Tiling::Irregular);
    sm.define_array(input.clone()).unwrap();

    let qp = QueryProcessor::new(&sm);
    let always = FnExpression::new(Vec::<&str>::new(), |_| true);
    qp.filter(&sm.open_array("in").unwrap(), &always, "out")
        .unwrap();

    let out = sm.open_array("out").unwrap();
    assert!(out.empty());
    assert_eq!(input.attributes(), out.schema().attributes());
}
