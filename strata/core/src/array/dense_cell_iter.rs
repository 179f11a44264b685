use strata_common::datatype::CellValNum;
use strata_common::physical::{CoordinateType, PhysicalType};
use strata_common::schema::ArraySchema;

use super::{ArrayCellIter, CellIterBuilder, Error};

/// Simulates a dense array over the sparse merge stream.
///
/// The cursor walks every coordinate of the schema's domain in the global
/// cell order. When the underlying sparse iterator holds a cell at the
/// current coordinates, that stored cell is emitted (`coords_match()` is
/// true) and the sparse iterator advances; otherwise a *zero cell* is
/// synthesized: the current coordinates, numeric attributes zero, and
/// variable-sized attributes a single NULL element. The emitted stream
/// has exactly one cell per domain coordinate.
pub struct ArrayDenseCellIter<'a, T: CoordinateType> {
    inner: ArrayCellIter<'a, T>,
    current_coords: Vec<T>,
    /// Zero cell, `[coords][u64 total, var layouts only][zero attrs]`.
    /// The attribute part is constant; only the coordinates are
    /// rewritten per step.
    zero_cell: Vec<u8>,
    coords_match: bool,
    end: bool,
}

impl<'a, T: CoordinateType> ArrayDenseCellIter<'a, T> {
    pub(crate) fn from_builder(
        builder: CellIterBuilder<'a, T>,
    ) -> Result<Self, Error> {
        let schema = builder.array.schema();
        let array_empty = builder.array.empty();
        let current_coords = schema.domain_start::<T>();
        let inner = ArrayCellIter::from_builder(builder)?;

        let zero_cell = Self::build_zero_cell(schema, inner.attribute_ids())?;
        let mut it = ArrayDenseCellIter {
            inner,
            current_coords,
            zero_cell,
            coords_match: false,
            end: array_empty,
        };
        if !it.end {
            it.prepare();
        }
        Ok(it)
    }

    /// Lays out the constant zero cell; the coordinate prefix is filled
    /// in per step.
    fn build_zero_cell(
        schema: &ArraySchema,
        attribute_ids: &[usize],
    ) -> Result<Vec<u8>, Error> {
        let mut attr_bytes = Vec::new();
        for id in &attribute_ids[..attribute_ids.len() - 1] {
            let attr = schema.attribute(*id)?;
            match attr.val_num {
                CellValNum::Fixed(nz) => {
                    // all-zero bytes decode to numeric zero for every type
                    attr_bytes.extend_from_slice(&vec![
                        0u8;
                        nz.get() as usize
                            * attr.datatype.size()
                    ]);
                }
                CellValNum::Var => {
                    attr_bytes.extend_from_slice(&1u32.to_ne_bytes());
                    let mut null = vec![0u8; attr.datatype.size()];
                    strata_common::physical_type_go!(
                        attr.datatype,
                        DT,
                        DT::null_value().write_ne_bytes(&mut null)
                    );
                    attr_bytes.extend_from_slice(&null);
                }
            }
        }

        let var_layout =
            schema.cell_size_of(attribute_ids)?.is_none();
        let coords_size = schema.coords_size();
        let total = coords_size
            + if var_layout {
                std::mem::size_of::<u64>()
            } else {
                0
            }
            + attr_bytes.len();

        let mut cell = vec![0u8; total];
        let mut offset = coords_size;
        if var_layout {
            cell[offset..offset + 8]
                .copy_from_slice(&(total as u64).to_ne_bytes());
            offset += 8;
        }
        cell[offset..].copy_from_slice(&attr_bytes);
        Ok(cell)
    }

    /// Writes the current coordinates into the zero-cell prefix and
    /// decides whether the sparse stream matches them.
    fn prepare(&mut self) {
        let coords_size = self.inner.schema().coords_size();
        for (value, chunk) in self
            .current_coords
            .iter()
            .zip(self.zero_cell[..coords_size].chunks_exact_mut(T::SIZE))
        {
            value.write_ne_bytes(chunk);
        }
        self.coords_match = match self.inner.cell() {
            Some(stored) => {
                stored[..coords_size] == self.zero_cell[..coords_size]
            }
            None => false,
        };
    }

    pub fn schema(&self) -> &ArraySchema {
        self.inner.schema()
    }

    pub fn attribute_ids(&self) -> &[usize] {
        self.inner.attribute_ids()
    }

    pub fn end(&self) -> bool {
        self.end
    }

    pub fn error(&self) -> Option<&Error> {
        self.inner.error()
    }

    /// Whether the current cell came from the sparse stream rather than
    /// being zero-filled.
    pub fn coords_match(&self) -> bool {
        self.coords_match
    }

    /// The current cell: the stored cell when the coordinates match,
    /// the synthesized zero cell otherwise.
    pub fn cell(&self) -> Option<&[u8]> {
        if self.end {
            None
        } else if self.coords_match {
            self.inner.cell()
        } else {
            Some(&self.zero_cell)
        }
    }

    pub fn cell_size(&self) -> Option<usize> {
        self.cell().map(<[u8]>::len)
    }

    /// Steps to the next domain coordinate in the global cell order.
    pub fn advance(&mut self) {
        if self.end {
            return;
        }
        if self.coords_match {
            self.inner.advance();
        }
        let schema = self.inner.schema();
        if !schema.advance_coords::<T>(&mut self.current_coords) {
            self.end = true;
            self.coords_match = false;
            return;
        }
        self.prepare();
    }
}
