use std::fmt::{Display, Formatter, Result as FmtResult};
use std::num::NonZeroU32;

use thiserror::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::physical::PhysicalType;

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum Error {
    #[error("Datatype {0} is not valid for coordinates")]
    NotACoordinateType(Datatype),
    #[error(
        "Cell value truncation for {datatype}: expected {expected} bytes \
         but found {found}"
    )]
    ValueTruncation {
        datatype: Datatype,
        expected: usize,
        found: usize,
    },
}

/// The cell value types an attribute (or the coordinate column) can carry.
///
/// Every variant has the same in-memory representation in a tile payload
/// as its Rust counterpart, so payload bytes reinterpret directly.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub enum Datatype {
    Char,
    Int32,
    Int64,
    Float32,
    Float64,
}

/// Applies a generic expression to the Rust type underlying a [Datatype].
#[macro_export]
macro_rules! physical_type_go {
    ($datatype:expr, $DT:ident, $then:expr) => {{
        use $crate::datatype::Datatype;
        match $datatype {
            Datatype::Char => {
                type $DT = u8;
                $then
            }
            Datatype::Int32 => {
                type $DT = i32;
                $then
            }
            Datatype::Int64 => {
                type $DT = i64;
                $then
            }
            Datatype::Float32 => {
                type $DT = f32;
                $then
            }
            Datatype::Float64 => {
                type $DT = f64;
                $then
            }
        }
    }};
}

/// Applies a generic expression to the Rust type underlying a coordinate
/// [Datatype], or evaluates the fallback for non-coordinate types.
#[macro_export]
macro_rules! coord_type_go {
    ($datatype:expr, $DT:ident, $then:expr, $else:expr) => {{
        use $crate::datatype::Datatype;
        match $datatype {
            Datatype::Int32 => {
                type $DT = i32;
                $then
            }
            Datatype::Int64 => {
                type $DT = i64;
                $then
            }
            Datatype::Float32 => {
                type $DT = f32;
                $then
            }
            Datatype::Float64 => {
                type $DT = f64;
                $then
            }
            _ => $else,
        }
    }};
}

impl Datatype {
    /// Size in bytes of one value of this type.
    pub fn size(&self) -> usize {
        physical_type_go!(self, DT, std::mem::size_of::<DT>())
    }

    /// Whether this type may serve as the coordinate type of a schema.
    /// `Char` is excluded; the coordinate space is numeric.
    pub fn is_coordinate_type(&self) -> bool {
        !matches!(self, Datatype::Char)
    }

    pub fn is_compatible_type<T: PhysicalType>(&self) -> bool {
        physical_type_go!(
            self,
            DT,
            std::any::TypeId::of::<DT>() == std::any::TypeId::of::<T>()
        )
    }

    fn check_value(&self, bytes: &[u8]) -> Result<(), Error> {
        if bytes.len() < self.size() {
            Err(Error::ValueTruncation {
                datatype: *self,
                expected: self.size(),
                found: bytes.len(),
            })
        } else {
            Ok(())
        }
    }

    /// Whether the leading value of `bytes` is the NULL marker of this type.
    ///
    /// NULL is the type's maximum value (`0xFF` for `Char`). This is a pure
    /// function of the type and the bytes; tiles and iterators delegate
    /// here rather than owning the representation.
    pub fn is_null(&self, bytes: &[u8]) -> Result<bool, Error> {
        use crate::physical::BitsEq;
        self.check_value(bytes)?;
        Ok(physical_type_go!(self, DT, {
            <DT as PhysicalType>::from_ne_bytes(&bytes[..DT::SIZE])
                .bits_eq(&DT::null_value())
        }))
    }

    /// Whether the leading value of `bytes` is the deletion marker of this
    /// type: the value immediately below NULL in the type's total order.
    pub fn is_del(&self, bytes: &[u8]) -> Result<bool, Error> {
        use crate::physical::BitsEq;
        self.check_value(bytes)?;
        Ok(physical_type_go!(self, DT, {
            <DT as PhysicalType>::from_ne_bytes(&bytes[..DT::SIZE])
                .bits_eq(&DT::del_value())
        }))
    }

    /// Decodes the leading value of `bytes` widened to `f64`, for distance
    /// computations and expression variable bindings.
    pub fn value_as_f64(&self, bytes: &[u8]) -> Result<f64, Error> {
        self.check_value(bytes)?;
        Ok(physical_type_go!(self, DT, {
            <DT as PhysicalType>::from_ne_bytes(&bytes[..DT::SIZE]).to_f64()
        }))
    }

    /// Encodes the deletion marker, repeated `val_num` times, as cell bytes.
    pub fn del_cell(&self, val_num: usize) -> Vec<u8> {
        physical_type_go!(self, DT, {
            crate::physical::encode_values(&vec![DT::del_value(); val_num])
        })
    }
}

impl Display for Datatype {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        let name = match self {
            Datatype::Char => "char",
            Datatype::Int32 => "int32",
            Datatype::Int64 => "int64",
            Datatype::Float32 => "float32",
            Datatype::Float64 => "float64",
        };
        write!(f, "{name}")
    }
}

/// Represents the number of values carried within a single cell.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub enum CellValNum {
    /// The number of values per cell is a specific fixed number.
    Fixed(NonZeroU32),
    /// The number of values per cell varies. Each cell is stored as a
    /// `u32` element count followed by that many encoded values.
    Var,
}

impl CellValNum {
    pub fn single() -> Self {
        CellValNum::Fixed(NonZeroU32::new(1).unwrap())
    }

    pub fn is_var_sized(&self) -> bool {
        matches!(self, CellValNum::Var)
    }

    /// Return the fixed number of values per cell, if not variable.
    pub fn fixed(&self) -> Option<NonZeroU32> {
        if let CellValNum::Fixed(nz) = self {
            Some(*nz)
        } else {
            None
        }
    }
}

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum CellValNumError {
    #[error("{} cannot be zero", std::any::type_name::<CellValNum>())]
    CannotBeZero,
}

impl Default for CellValNum {
    fn default() -> Self {
        Self::single()
    }
}

impl TryFrom<u32> for CellValNum {
    type Error = CellValNumError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Err(CellValNumError::CannotBeZero),
            u32::MAX => Ok(CellValNum::Var),
            v => Ok(CellValNum::Fixed(NonZeroU32::new(v).unwrap())),
        }
    }
}

/// Size in bytes of the element-count prefix of a variable-sized cell.
pub const VAR_CELL_PREFIX_SIZE: usize = std::mem::size_of::<u32>();
