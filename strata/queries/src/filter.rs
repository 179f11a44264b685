use std::collections::HashMap;

use strata_common::datatype::VAR_CELL_PREFIX_SIZE;
use strata_common::schema::ArraySchema;
use strata_core::array::Array;
use strata_core::tile::TileCellIter;

use crate::expression::ExpressionTree;
use crate::result_tiles::ResultTiles;
use crate::{
    advance_cell_its, advance_tile_its, initialize_cell_its, seek_cell_its,
    seek_tile_its, single_fragment, tile_begin, Error, QueryProcessor,
    Result,
};

/// Splits the schema's attributes into those the expression reads
/// (sorted) and the rest.
fn split_attributes(
    schema: &ArraySchema,
    expression: &dyn ExpressionTree,
) -> Result<(Vec<usize>, Vec<usize>)> {
    let mut expr_ids = Vec::new();
    for name in expression.vars() {
        let id = schema
            .attribute_id(&name)
            .ok_or(Error::UnknownAttribute(name))?;
        expr_ids.push(id);
    }
    expr_ids.sort_unstable();
    expr_ids.dedup();
    if expr_ids.is_empty() {
        // A constant predicate still needs a driving attribute.
        expr_ids.push(schema.smallest_attribute().ok_or(Error::NoAttributes)?);
    }

    let non_expr_ids = (0..schema.attribute_num())
        .filter(|id| !expr_ids.contains(id))
        .collect();
    Ok((expr_ids, non_expr_ids))
}

/// Binds the expression attributes of the current cell and evaluates
/// the predicate.
fn cell_satisfies_expression(
    schema: &ArraySchema,
    cell_its: &[TileCellIter],
    expr_ids: &[usize],
    expression: &dyn ExpressionTree,
) -> Result<bool> {
    let mut bindings = HashMap::new();
    for id in expr_ids {
        let attr = schema.attribute(*id)?;
        let cell =
            cell_its[*id].cell().ok_or(Error::LostSynchronization)?;
        let values = if attr.val_num.is_var_sized() {
            &cell[VAR_CELL_PREFIX_SIZE..]
        } else {
            cell
        };
        let value = if values.is_empty() {
            f64::NAN
        } else {
            attr.datatype.value_as_f64(values)?
        };
        bindings.insert(attr.name.clone(), value);
    }
    Ok(expression.evaluate(&bindings))
}

pub(crate) fn filter_irregular(
    qp: &QueryProcessor,
    array: &Array,
    expression: &dyn ExpressionTree,
    result_schema: ArraySchema,
) -> Result<()> {
    let schema = array.schema();
    let attribute_num = schema.attribute_num();
    let capacity = schema.capacity();
    let (expr_ids, non_expr_ids) = split_attributes(schema, expression)?;
    let end_attribute = expr_ids[0];

    let mut result = ResultTiles::create(qp, result_schema)?;
    let Some(fragment) = single_fragment(array)? else {
        return result.finish();
    };

    let mut tile_its = (0..=attribute_num)
        .map(|id| fragment.begin(id))
        .collect::<Vec<_>>();
    let mut cell_its = vec![TileCellIter::default(); attribute_num + 1];

    // Tiles and cells skipped so far for the attributes the expression
    // does not read; their cursors catch up only when a cell matches.
    let mut skipped_tiles: i64 = 0;
    let mut skipped_cells: i64;

    while !tile_its[end_attribute].end() {
        initialize_cell_its(&tile_its, &mut cell_its, &expr_ids);
        skipped_cells = 0;
        let mut non_expr_cell_its_initialized = false;

        while !cell_its[end_attribute].end() {
            if cell_satisfies_expression(
                schema,
                &cell_its,
                &expr_ids,
                expression,
            )? {
                if skipped_tiles != 0 {
                    seek_tile_its(
                        &mut tile_its,
                        &non_expr_ids,
                        skipped_tiles,
                    );
                    tile_its[attribute_num].seek(skipped_tiles);
                    skipped_tiles = 0;
                }
                if !non_expr_cell_its_initialized {
                    initialize_cell_its(
                        &tile_its,
                        &mut cell_its,
                        &non_expr_ids,
                    );
                    cell_its[attribute_num] =
                        tile_begin(&tile_its[attribute_num]);
                    non_expr_cell_its_initialized = true;
                }
                if skipped_cells != 0 {
                    seek_cell_its(
                        &mut cell_its,
                        &non_expr_ids,
                        skipped_cells,
                    );
                    cell_its[attribute_num].seek(skipped_cells);
                    skipped_cells = 0;
                }
                if result.cell_num() == capacity {
                    let next = result.tile_id() + 1;
                    result.roll(next)?;
                }
                result.append(&cell_its)?;
                for it in cell_its.iter_mut() {
                    it.advance();
                }
            } else {
                advance_cell_its(&mut cell_its, &expr_ids);
                skipped_cells += 1;
            }
        }

        advance_tile_its(&mut tile_its, &expr_ids);
        skipped_tiles += 1;
    }

    result.finish()
}

pub(crate) fn filter_regular(
    qp: &QueryProcessor,
    array: &Array,
    expression: &dyn ExpressionTree,
    result_schema: ArraySchema,
) -> Result<()> {
    let schema = array.schema();
    let attribute_num = schema.attribute_num();
    let (expr_ids, non_expr_ids) = split_attributes(schema, expression)?;
    let end_attribute = expr_ids[0];

    let mut result = ResultTiles::create(qp, result_schema)?;
    let Some(fragment) = single_fragment(array)? else {
        return result.finish();
    };

    let mut tile_its = (0..=attribute_num)
        .map(|id| fragment.begin(id))
        .collect::<Vec<_>>();
    let mut cell_its = vec![TileCellIter::default(); attribute_num + 1];

    let mut skipped_tiles: i64 = 0;
    let mut skipped_cells: i64;

    while !tile_its[end_attribute].end() {
        // Result tiles mirror the input tile ids under regular tiling.
        let tile_id = tile_its[end_attribute]
            .tile_id()
            .ok_or(Error::LostSynchronization)?;
        result.roll(tile_id)?;

        initialize_cell_its(&tile_its, &mut cell_its, &expr_ids);
        skipped_cells = 0;
        let mut non_expr_cell_its_initialized = false;

        while !cell_its[end_attribute].end() {
            if cell_satisfies_expression(
                schema,
                &cell_its,
                &expr_ids,
                expression,
            )? {
                if skipped_tiles != 0 {
                    seek_tile_its(
                        &mut tile_its,
                        &non_expr_ids,
                        skipped_tiles,
                    );
                    tile_its[attribute_num].seek(skipped_tiles);
                    skipped_tiles = 0;
                }
                if !non_expr_cell_its_initialized {
                    initialize_cell_its(
                        &tile_its,
                        &mut cell_its,
                        &non_expr_ids,
                    );
                    cell_its[attribute_num] =
                        tile_begin(&tile_its[attribute_num]);
                    non_expr_cell_its_initialized = true;
                }
                if skipped_cells != 0 {
                    seek_cell_its(
                        &mut cell_its,
                        &non_expr_ids,
                        skipped_cells,
                    );
                    cell_its[attribute_num].seek(skipped_cells);
                    skipped_cells = 0;
                }
                result.append(&cell_its)?;
                for it in cell_its.iter_mut() {
                    it.advance();
                }
            } else {
                advance_cell_its(&mut cell_its, &expr_ids);
                skipped_cells += 1;
            }
        }

        advance_tile_its(&mut tile_its, &expr_ids);
        skipped_tiles += 1;
    }

    result.finish()
}
