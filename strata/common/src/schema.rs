use std::cmp::Ordering;

use num_traits::cast;
use thiserror::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::datatype::{CellValNum, Datatype};
use crate::physical::{decode_iter, CoordinateType};
use crate::range::HyperRect;

#[derive(Clone, Debug, Error, PartialEq)]
pub enum Error {
    #[error("Array schema must have at least one dimension")]
    NoDimensions,
    #[error("Datatype {0} is not valid for coordinates")]
    InvalidCoordinateType(Datatype),
    #[error("Duplicate field name: {0}")]
    DuplicateFieldName(String),
    #[error("Invalid domain for dimension {0}: lower bound exceeds upper")]
    InvalidDomain(usize),
    #[error("Capacity must be nonzero")]
    ZeroCapacity,
    #[error(
        "Regular tiling requires one positive extent per dimension: \
         expected {expected}, found {found}"
    )]
    InvalidTileExtents { expected: usize, found: usize },
    #[error("Tile extent for dimension {0} must be positive")]
    NonPositiveTileExtent(usize),
    #[error("Invalid attribute id {id}: schema has {attribute_num} attributes")]
    InvalidAttributeId { id: usize, attribute_num: usize },
    #[error("Range has {found} dimensions but the schema has {expected}")]
    RangeDimensionMismatch { expected: usize, found: usize },
    #[error("Coordinate type mismatch: schema stores {0}")]
    CoordinateTypeMismatch(Datatype),
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum JoinCompatibilityError {
    #[error("Dimension count mismatch: {0} vs. {1}")]
    DimensionCount(usize, usize),
    #[error("Coordinate type mismatch: {0} vs. {1}")]
    CoordinateType(Datatype, Datatype),
    #[error("Domain mismatch in dimension {0}")]
    Domain(usize),
    #[error("Cell order mismatch")]
    CellOrder,
    #[error("Tiling regime mismatch")]
    Tiling,
}

/// The total order imposed on cells within the coordinate space.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub enum CellOrder {
    RowMajor,
    ColumnMajor,
}

/// How an array's coordinate space is cut into tiles.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub enum Tiling {
    /// Tiles are capacity-bounded groups in insertion (global) order;
    /// tile ids are assigned monotonically at write time.
    Irregular,
    /// Tiles tessellate the coordinate space along a fixed extent per
    /// dimension; tile ids are deterministic from coordinates.
    Regular {
        extents: Vec<f64>,
        tile_order: CellOrder,
    },
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct DimensionSchema {
    pub name: String,
    /// Inclusive domain bounds, widened to `f64` regardless of the
    /// coordinate type.
    pub domain: [f64; 2],
}

impl DimensionSchema {
    pub fn new<S: Into<String>>(name: S, domain: [f64; 2]) -> Self {
        DimensionSchema {
            name: name.into(),
            domain,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct AttributeSchema {
    pub name: String,
    pub datatype: Datatype,
    pub val_num: CellValNum,
}

impl AttributeSchema {
    pub fn new<S: Into<String>>(
        name: S,
        datatype: Datatype,
        val_num: CellValNum,
    ) -> Self {
        AttributeSchema {
            name: name.into(),
            datatype,
            val_num,
        }
    }

    /// Size in bytes of one cell of this attribute, or `None` for
    /// variable-sized cells.
    pub fn cell_size(&self) -> Option<usize> {
        self.val_num
            .fixed()
            .map(|nz| nz.get() as usize * self.datatype.size())
    }
}

/// The immutable description of an array: dimensions, attributes, tiling
/// regime, and the global cell order.
///
/// By convention the coordinate column is addressed with the pseudo
/// attribute id `attribute_num()`, following the physical layout where
/// each fragment stores one coordinate tile stream after the attribute
/// streams.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct ArraySchema {
    array_name: String,
    dimensions: Vec<DimensionSchema>,
    coord_type: Datatype,
    attributes: Vec<AttributeSchema>,
    capacity: u64,
    cell_order: CellOrder,
    tiling: Tiling,
}

impl ArraySchema {
    pub fn new<S: Into<String>>(
        array_name: S,
        dimensions: Vec<DimensionSchema>,
        coord_type: Datatype,
        attributes: Vec<AttributeSchema>,
        capacity: u64,
        cell_order: CellOrder,
        tiling: Tiling,
    ) -> Result<Self, Error> {
        if dimensions.is_empty() {
            return Err(Error::NoDimensions);
        }
        if !coord_type.is_coordinate_type() {
            return Err(Error::InvalidCoordinateType(coord_type));
        }
        if capacity == 0 {
            return Err(Error::ZeroCapacity);
        }
        for (d, dim) in dimensions.iter().enumerate() {
            if dim.domain[0] > dim.domain[1] {
                return Err(Error::InvalidDomain(d));
            }
        }
        let mut names = std::collections::HashSet::new();
        for name in dimensions
            .iter()
            .map(|d| &d.name)
            .chain(attributes.iter().map(|a| &a.name))
        {
            if !names.insert(name.as_str()) {
                return Err(Error::DuplicateFieldName(name.clone()));
            }
        }
        if let Tiling::Regular { ref extents, .. } = tiling {
            if extents.len() != dimensions.len() {
                return Err(Error::InvalidTileExtents {
                    expected: dimensions.len(),
                    found: extents.len(),
                });
            }
            for (d, e) in extents.iter().enumerate() {
                if *e <= 0.0 {
                    return Err(Error::NonPositiveTileExtent(d));
                }
            }
        }

        Ok(ArraySchema {
            array_name: array_name.into(),
            dimensions,
            coord_type,
            attributes,
            capacity,
            cell_order,
            tiling,
        })
    }

    /// Clones the schema under a new array name, e.g. for an operator's
    /// result array.
    pub fn clone_as<S: Into<String>>(&self, array_name: S) -> Self {
        ArraySchema {
            array_name: array_name.into(),
            ..self.clone()
        }
    }

    pub fn array_name(&self) -> &str {
        &self.array_name
    }

    pub fn dim_num(&self) -> usize {
        self.dimensions.len()
    }

    pub fn dimensions(&self) -> &[DimensionSchema] {
        &self.dimensions
    }

    pub fn attribute_num(&self) -> usize {
        self.attributes.len()
    }

    pub fn attributes(&self) -> &[AttributeSchema] {
        &self.attributes
    }

    pub fn coord_type(&self) -> Datatype {
        self.coord_type
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn cell_order(&self) -> CellOrder {
        self.cell_order
    }

    pub fn tiling(&self) -> &Tiling {
        &self.tiling
    }

    pub fn has_regular_tiles(&self) -> bool {
        matches!(self.tiling, Tiling::Regular { .. })
    }

    /// Size in bytes of one cell of coordinates.
    pub fn coords_size(&self) -> usize {
        self.dim_num() * self.coord_type.size()
    }

    /// The id addressing the coordinate column.
    pub fn coords_id(&self) -> usize {
        self.attribute_num()
    }

    pub fn attribute(&self, id: usize) -> Result<&AttributeSchema, Error> {
        self.attributes.get(id).ok_or(Error::InvalidAttributeId {
            id,
            attribute_num: self.attribute_num(),
        })
    }

    pub fn attribute_id(&self, name: &str) -> Option<usize> {
        self.attributes.iter().position(|a| a.name == name)
    }

    /// Validates a projection list. Ids up to and including `coords_id()`
    /// are legal.
    pub fn check_attribute_ids(&self, ids: &[usize]) -> Result<(), Error> {
        for id in ids {
            if *id > self.attribute_num() {
                return Err(Error::InvalidAttributeId {
                    id: *id,
                    attribute_num: self.attribute_num(),
                });
            }
        }
        Ok(())
    }

    /// Size in bytes of one cell of the column `id` (which may be
    /// `coords_id()`), or `None` for variable-sized cells.
    pub fn cell_size(&self, id: usize) -> Result<Option<usize>, Error> {
        if id == self.coords_id() {
            Ok(Some(self.coords_size()))
        } else {
            Ok(self.attribute(id)?.cell_size())
        }
    }

    /// Total size of a merged cell over the given columns, or `None` if
    /// any projected column is variable-sized (in which case the merged
    /// layout carries a `u64` total-size prefix after the coordinates).
    pub fn cell_size_of(
        &self,
        ids: &[usize],
    ) -> Result<Option<usize>, Error> {
        let mut total = 0;
        for id in ids {
            match self.cell_size(*id)? {
                Some(size) => total += size,
                None => return Ok(None),
            }
        }
        Ok(Some(total))
    }

    /// The attribute with the smallest fixed cell size (lowest id wins),
    /// used to probe cells for deletion markers cheaply. `None` if the
    /// schema has no fixed-sized attribute.
    pub fn smallest_attribute(&self) -> Option<usize> {
        self.attributes
            .iter()
            .enumerate()
            .filter_map(|(id, a)| a.cell_size().map(|size| (size, id)))
            .min()
            .map(|(_, id)| id)
    }

    /// Checks that a query range matches the schema's dimensionality and
    /// coordinate type.
    pub fn check_range<T: CoordinateType>(
        &self,
        range: &HyperRect<T>,
    ) -> Result<(), Error> {
        if !self.coord_type.is_compatible_type::<T>() {
            return Err(Error::CoordinateTypeMismatch(self.coord_type));
        }
        if range.dim_num() != self.dim_num() {
            return Err(Error::RangeDimensionMismatch {
                expected: self.dim_num(),
                found: range.dim_num(),
            });
        }
        Ok(())
    }

    fn cmp_coords_dims<T: CoordinateType>(
        a: &[u8],
        b: &[u8],
        dims: impl Iterator<Item = usize>,
    ) -> Ordering {
        for d in dims {
            let av = crate::physical::decode_at::<T>(a, d);
            let bv = crate::physical::decode_at::<T>(b, d);
            match crate::physical::BitsOrd::bits_cmp(&av, &bv) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        Ordering::Equal
    }

    /// Compares two packed coordinate cells under the global cell order.
    pub fn cmp_coords<T: CoordinateType>(
        &self,
        a: &[u8],
        b: &[u8],
    ) -> Ordering {
        match self.cell_order {
            CellOrder::RowMajor => {
                Self::cmp_coords_dims::<T>(a, b, 0..self.dim_num())
            }
            CellOrder::ColumnMajor => {
                Self::cmp_coords_dims::<T>(a, b, (0..self.dim_num()).rev())
            }
        }
    }

    /// True if coordinates `a` strictly precede `b` in the cell order.
    pub fn precedes<T: CoordinateType>(&self, a: &[u8], b: &[u8]) -> bool {
        matches!(self.cmp_coords::<T>(a, b), Ordering::Less)
    }

    /// True if coordinates `a` strictly succeed `b` in the cell order.
    pub fn succeeds<T: CoordinateType>(&self, a: &[u8], b: &[u8]) -> bool {
        matches!(self.cmp_coords::<T>(a, b), Ordering::Greater)
    }

    /// Number of tiles along each dimension under regular tiling.
    fn tile_counts(&self) -> Option<Vec<u64>> {
        let Tiling::Regular { ref extents, .. } = self.tiling else {
            return None;
        };
        let pad = if self.coord_type_is_integral() { 1.0 } else { 0.0 };
        Some(
            self.dimensions
                .iter()
                .zip(extents.iter())
                .map(|(dim, extent)| {
                    let span = dim.domain[1] - dim.domain[0] + pad;
                    ((span / extent).ceil() as u64).max(1)
                })
                .collect(),
        )
    }

    fn coord_type_is_integral(&self) -> bool {
        matches!(self.coord_type, Datatype::Int32 | Datatype::Int64)
    }

    /// The deterministic tile id of packed coordinates under regular
    /// tiling: per-dimension grid indices linearized in the tile order.
    /// `None` for irregular tiling.
    pub fn tile_id<T: CoordinateType>(&self, coords: &[u8]) -> Option<u64> {
        let Tiling::Regular {
            ref extents,
            tile_order,
        } = self.tiling
        else {
            return None;
        };
        let counts = self.tile_counts()?;

        let indices = decode_iter::<T>(coords)
            .zip(self.dimensions.iter())
            .zip(extents.iter())
            .map(|((c, dim), extent)| {
                let offset = c.to_f64() - dim.domain[0];
                (offset / extent).floor() as u64
            })
            .collect::<Vec<_>>();

        let mut id = 0u64;
        match tile_order {
            CellOrder::RowMajor => {
                for (idx, count) in indices.iter().zip(counts.iter()) {
                    id = id * count + idx;
                }
            }
            CellOrder::ColumnMajor => {
                for (idx, count) in
                    indices.iter().zip(counts.iter()).rev()
                {
                    id = id * count + idx;
                }
            }
        }
        Some(id)
    }

    /// The inclusive domain bounds of dimension `d` in the coordinate
    /// type.
    ///
    /// # Panics
    ///
    /// Panics if `d >= self.dim_num()`.
    pub fn domain_bound<T: CoordinateType>(&self, d: usize) -> [T; 2] {
        let dom = self.dimensions[d].domain;
        [
            cast::<f64, T>(dom[0]).unwrap_or_else(T::zero),
            cast::<f64, T>(dom[1]).unwrap_or_else(T::zero),
        ]
    }

    /// The whole domain as a query range.
    pub fn domain_rect<T: CoordinateType>(
        &self,
    ) -> Result<HyperRect<T>, crate::range::Error> {
        HyperRect::new(
            (0..self.dim_num()).map(|d| self.domain_bound::<T>(d)).collect(),
        )
    }

    /// The first coordinates of the domain in the global cell order.
    pub fn domain_start<T: CoordinateType>(&self) -> Vec<T> {
        (0..self.dim_num())
            .map(|d| self.domain_bound::<T>(d)[0])
            .collect()
    }

    fn advance_coords_dims<T: CoordinateType>(
        &self,
        coords: &mut [T],
        dims: impl Iterator<Item = usize>,
    ) -> bool {
        for d in dims {
            let [lo, hi] = self.domain_bound::<T>(d);
            let next = coords[d] + T::one();
            if next <= hi {
                coords[d] = next;
                return true;
            }
            coords[d] = lo;
        }
        false
    }

    /// Steps `coords` to the next domain position in the global cell
    /// order; returns `false` once the domain is exhausted.
    pub fn advance_coords<T: CoordinateType>(
        &self,
        coords: &mut [T],
    ) -> bool {
        match self.cell_order {
            CellOrder::RowMajor => self
                .advance_coords_dims(coords, (0..self.dim_num()).rev()),
            CellOrder::ColumnMajor => {
                self.advance_coords_dims(coords, 0..self.dim_num())
            }
        }
    }

    /// Number of cells in the domain, i.e. the length of a full
    /// dense-simulation stream. `None` for float coordinate domains.
    pub fn domain_cell_num(&self) -> Option<u128> {
        if !self.coord_type_is_integral() {
            return None;
        }
        Some(
            self.dimensions
                .iter()
                .map(|d| (d.domain[1] - d.domain[0] + 1.0) as u128)
                .product(),
        )
    }

    /// Checks that two schemas can participate in an equi-join on
    /// coordinates: same dimensionality, coordinate type, domain, cell
    /// order, and tiling regime.
    pub fn join_compatible(
        a: &ArraySchema,
        b: &ArraySchema,
    ) -> Result<(), JoinCompatibilityError> {
        if a.dim_num() != b.dim_num() {
            return Err(JoinCompatibilityError::DimensionCount(
                a.dim_num(),
                b.dim_num(),
            ));
        }
        if a.coord_type != b.coord_type {
            return Err(JoinCompatibilityError::CoordinateType(
                a.coord_type,
                b.coord_type,
            ));
        }
        for (d, (da, db)) in
            a.dimensions.iter().zip(b.dimensions.iter()).enumerate()
        {
            if da.domain != db.domain {
                return Err(JoinCompatibilityError::Domain(d));
            }
        }
        if a.cell_order != b.cell_order {
            return Err(JoinCompatibilityError::CellOrder);
        }
        if a.tiling != b.tiling {
            return Err(JoinCompatibilityError::Tiling);
        }
        Ok(())
    }

    /// The schema of the join of `a` and `b`: `a`'s dimensions and
    /// tiling, with the attributes of `a` followed by those of `b`
    /// (suffixed on name collision).
    pub fn join_result_schema<S: Into<String>>(
        a: &ArraySchema,
        b: &ArraySchema,
        array_name: S,
    ) -> Result<ArraySchema, JoinCompatibilityError> {
        Self::join_compatible(a, b)?;

        let mut attributes = a.attributes.clone();
        for attr in &b.attributes {
            let mut attr = attr.clone();
            if attributes.iter().any(|existing| existing.name == attr.name)
            {
                attr.name = format!("{}_2", attr.name);
            }
            attributes.push(attr);
        }

        Ok(ArraySchema {
            array_name: array_name.into(),
            dimensions: a.dimensions.clone(),
            coord_type: a.coord_type,
            attributes,
            capacity: a.capacity,
            cell_order: a.cell_order,
            tiling: a.tiling.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::physical::encode_values;

    use super::*;

    fn schema_2d(tiling: Tiling) -> ArraySchema {
        ArraySchema::new(
            "test",
            vec![
                DimensionSchema::new("i", [1.0, 4.0]),
                DimensionSchema::new("j", [1.0, 4.0]),
            ],
            Datatype::Int32,
            vec![
                AttributeSchema::new(
                    "a",
                    Datatype::Int32,
                    CellValNum::single(),
                ),
                AttributeSchema::new("v", Datatype::Char, CellValNum::Var),
            ],
            4,
            CellOrder::RowMajor,
            tiling,
        )
        .unwrap()
    }

    #[test]
    fn construction_validation() {
        assert!(matches!(
            ArraySchema::new(
                "bad",
                vec![],
                Datatype::Int32,
                vec![],
                4,
                CellOrder::RowMajor,
                Tiling::Irregular,
            ),
            Err(Error::NoDimensions)
        ));
        assert!(matches!(
            ArraySchema::new(
                "bad",
                vec![DimensionSchema::new("i", [0.0, 1.0])],
                Datatype::Char,
                vec![],
                4,
                CellOrder::RowMajor,
                Tiling::Irregular,
            ),
            Err(Error::InvalidCoordinateType(Datatype::Char))
        ));
        assert!(matches!(
            ArraySchema::new(
                "bad",
                vec![DimensionSchema::new("i", [0.0, 1.0])],
                Datatype::Int32,
                vec![AttributeSchema::new(
                    "i",
                    Datatype::Int32,
                    CellValNum::single()
                )],
                4,
                CellOrder::RowMajor,
                Tiling::Irregular,
            ),
            Err(Error::DuplicateFieldName(_))
        ));
        assert!(matches!(
            ArraySchema::new(
                "bad",
                vec![DimensionSchema::new("i", [0.0, 3.0])],
                Datatype::Int32,
                vec![],
                4,
                CellOrder::RowMajor,
                Tiling::Regular {
                    extents: vec![],
                    tile_order: CellOrder::RowMajor
                },
            ),
            Err(Error::InvalidTileExtents { .. })
        ));
    }

    #[test]
    fn cell_sizes() {
        let s = schema_2d(Tiling::Irregular);
        assert_eq!(8, s.coords_size());
        assert_eq!(Some(4), s.cell_size(0).unwrap());
        assert_eq!(None, s.cell_size(1).unwrap());
        assert_eq!(Some(8), s.cell_size(s.coords_id()).unwrap());
        assert_eq!(Some(12), s.cell_size_of(&[0, s.coords_id()]).unwrap());
        assert_eq!(None, s.cell_size_of(&[0, 1, s.coords_id()]).unwrap());
        assert_eq!(Some(0), s.smallest_attribute());
    }

    #[test]
    fn row_major_order() {
        let s = schema_2d(Tiling::Irregular);
        let a = encode_values(&[1i32, 2]);
        let b = encode_values(&[2i32, 1]);
        assert!(s.precedes::<i32>(&a, &b));
        assert!(s.succeeds::<i32>(&b, &a));
        assert!(!s.precedes::<i32>(&a, &a));
    }

    #[test]
    fn column_major_order_reverses_significance() {
        let mut s = schema_2d(Tiling::Irregular);
        s.cell_order = CellOrder::ColumnMajor;
        let a = encode_values(&[1i32, 2]);
        let b = encode_values(&[2i32, 1]);
        assert!(s.precedes::<i32>(&b, &a));
    }

    #[test]
    fn regular_tile_ids_row_major() {
        let s = schema_2d(Tiling::Regular {
            extents: vec![2.0, 2.0],
            tile_order: CellOrder::RowMajor,
        });
        // 2x2 grid of 2x2 tiles over [1,4]^2
        assert_eq!(Some(0), s.tile_id::<i32>(&encode_values(&[1i32, 1])));
        assert_eq!(Some(0), s.tile_id::<i32>(&encode_values(&[2i32, 2])));
        assert_eq!(Some(1), s.tile_id::<i32>(&encode_values(&[1i32, 3])));
        assert_eq!(Some(2), s.tile_id::<i32>(&encode_values(&[3i32, 1])));
        assert_eq!(Some(3), s.tile_id::<i32>(&encode_values(&[4i32, 4])));
        assert_eq!(
            None,
            schema_2d(Tiling::Irregular)
                .tile_id::<i32>(&encode_values(&[1i32, 1]))
        );
    }

    #[test]
    fn domain_walk_row_major() {
        let s = schema_2d(Tiling::Irregular);
        let mut coords = s.domain_start::<i32>();
        assert_eq!(vec![1, 1], coords);
        let mut seen = vec![coords.clone()];
        while s.advance_coords::<i32>(&mut coords) {
            seen.push(coords.clone());
        }
        assert_eq!(16, seen.len());
        assert_eq!(vec![1, 2], seen[1]);
        assert_eq!(vec![2, 1], seen[4]);
        assert_eq!(vec![4, 4], *seen.last().unwrap());
        assert_eq!(Some(16), s.domain_cell_num());
    }

    #[test]
    fn join_compatibility() {
        let a = schema_2d(Tiling::Irregular);
        let b = schema_2d(Tiling::Irregular);
        assert!(ArraySchema::join_compatible(&a, &b).is_ok());

        let c = ArraySchema::join_result_schema(&a, &b, "joined").unwrap();
        assert_eq!(4, c.attribute_num());
        assert_eq!("a", c.attributes()[0].name);
        assert_eq!("a_2", c.attributes()[2].name);

        let mut d = schema_2d(Tiling::Irregular);
        d.cell_order = CellOrder::ColumnMajor;
        assert_eq!(
            Err(JoinCompatibilityError::CellOrder),
            ArraySchema::join_compatible(&a, &d)
        );
    }
}
