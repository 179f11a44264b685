use std::cmp::Ordering;
use std::fmt::Debug;

use crate::private::sealed;

/// Trait for comparisons based on value bits.
/// This exists to work around float `NaN` which is not equal to itself,
/// preventing float types from being `Eq` for generic operations.
pub trait BitsEq {
    /// Test if two values have the same bits.
    ///
    /// This is often the same as `PartialEq::eq`, but is not in the case
    /// of floats where `NaN != NaN`.
    fn bits_eq(&self, other: &Self) -> bool;

    fn bits_ne(&self, other: &Self) -> bool {
        !self.bits_eq(other)
    }
}

/// Trait for ordering based on value bits.
/// This exists to work around float `NaN` which prevents float from being
/// a total order for use with generic operations.
pub trait BitsOrd {
    /// Return the ordering between `self` and `other`.
    /// This function defines a total order for all values of `Self`.
    fn bits_cmp(&self, other: &Self) -> Ordering;

    fn bits_lt(&self, other: &Self) -> bool {
        matches!(self.bits_cmp(other), Ordering::Less)
    }

    fn bits_le(&self, other: &Self) -> bool {
        matches!(self.bits_cmp(other), Ordering::Less | Ordering::Equal)
    }

    fn bits_ge(&self, other: &Self) -> bool {
        matches!(self.bits_cmp(other), Ordering::Equal | Ordering::Greater)
    }

    fn bits_gt(&self, other: &Self) -> bool {
        matches!(self.bits_cmp(other), Ordering::Greater)
    }
}

impl<T> BitsEq for [T]
where
    T: BitsEq,
{
    fn bits_eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self.iter().zip(other.iter()).all(|(l, r)| l.bits_eq(r))
    }
}

/// Implements lexicographic comparison of slices using the `BitsOrd` trait
/// of the element.
impl<T> BitsOrd for [T]
where
    T: BitsOrd,
{
    fn bits_cmp(&self, other: &Self) -> Ordering {
        for (l, r) in self.iter().zip(other.iter()) {
            match l.bits_cmp(r) {
                Ordering::Less => return Ordering::Less,
                Ordering::Greater => return Ordering::Greater,
                Ordering::Equal => continue,
            }
        }
        self.len().cmp(&other.len())
    }
}

/// Trait for generic operations on the primitive cell value types.
///
/// Types which implement this trait have the same representation in a tile
/// payload as in Rust, so cell bytes decode to values (and back) without
/// any conversion beyond a native-endian reinterpretation.
pub trait PhysicalType:
    BitsEq
    + BitsOrd
    + Copy
    + Debug
    + Default
    + PartialEq
    + PartialOrd
    + Send
    + Sync
    + crate::private::Sealed
    + 'static
{
    /// Size in bytes of one encoded value.
    const SIZE: usize;

    /// The reserved value marking a NULL cell: the type's maximum.
    fn null_value() -> Self;

    /// The reserved value marking a deletion (tombstone): the value
    /// immediately below [Self::null_value] in the type's total order.
    fn del_value() -> Self;

    /// Decodes one value from exactly `Self::SIZE` native-endian bytes.
    ///
    /// # Panics
    ///
    /// Panics if `bytes.len() != Self::SIZE`.
    fn from_ne_bytes(bytes: &[u8]) -> Self;

    /// Encodes `self` into `out[..Self::SIZE]` in native-endian order.
    ///
    /// # Panics
    ///
    /// Panics if `out.len() < Self::SIZE`.
    fn write_ne_bytes(&self, out: &mut [u8]);

    /// Widens the value to `f64` for distance math and expression bindings.
    fn to_f64(self) -> f64;
}

/// Marker for the physical types that may carry coordinates.
///
/// Beyond [PhysicalType], coordinate values participate in arithmetic:
/// domain bounds are cast from `f64` and the dense-simulation walk steps
/// by one along each dimension.
pub trait CoordinateType:
    PhysicalType
    + num_traits::NumCast
    + num_traits::One
    + num_traits::Zero
    + std::ops::Add<Output = Self>
    + std::ops::Sub<Output = Self>
{
}

impl CoordinateType for i32 {}
impl CoordinateType for i64 {}
impl CoordinateType for f32 {}
impl CoordinateType for f64 {}

/// Decodes the `idx`-th value of a packed native-endian slice.
///
/// # Panics
///
/// Panics if `bytes` does not cover `idx + 1` full values.
pub fn decode_at<T: PhysicalType>(bytes: &[u8], idx: usize) -> T {
    let start = idx * T::SIZE;
    T::from_ne_bytes(&bytes[start..start + T::SIZE])
}

/// Iterates the values of a packed native-endian slice.
pub fn decode_iter<T: PhysicalType>(
    bytes: &[u8],
) -> impl Iterator<Item = T> + '_ {
    bytes.chunks_exact(T::SIZE).map(T::from_ne_bytes)
}

/// Packs a value slice into native-endian bytes.
pub fn encode_values<T: PhysicalType>(values: &[T]) -> Vec<u8> {
    let mut out = vec![0u8; values.len() * T::SIZE];
    for (value, chunk) in values.iter().zip(out.chunks_exact_mut(T::SIZE)) {
        value.write_ne_bytes(chunk);
    }
    out
}

macro_rules! integral_physical_impls {
    ($($T:ty),+) => {
        sealed!($($T),+);

        $(
            impl BitsEq for $T {
                fn bits_eq(&self, other: &Self) -> bool {
                    <Self as PartialEq>::eq(self, other)
                }
            }

            impl BitsOrd for $T {
                fn bits_cmp(&self, other: &Self) -> Ordering {
                    <Self as Ord>::cmp(self, other)
                }
            }

            impl PhysicalType for $T {
                const SIZE: usize = std::mem::size_of::<$T>();

                fn null_value() -> Self {
                    <$T>::MAX
                }

                fn del_value() -> Self {
                    <$T>::MAX - 1
                }

                fn from_ne_bytes(bytes: &[u8]) -> Self {
                    <$T>::from_ne_bytes(bytes.try_into().unwrap())
                }

                fn write_ne_bytes(&self, out: &mut [u8]) {
                    out[..Self::SIZE].copy_from_slice(&self.to_ne_bytes())
                }

                fn to_f64(self) -> f64 {
                    self as f64
                }
            }
        )+
    }
}

integral_physical_impls!(u8, i32, i64);

macro_rules! float_physical_impls {
    ($($T:ty),+) => {
        sealed!($($T),+);

        $(
            /// The difference from the `PartialEq` implementation is
            /// reflexivity: matching `NaN` bits compare equal here. Zero and
            /// negative zero are also considered equal under this relation.
            impl BitsEq for $T {
                fn bits_eq(&self, other: &Self) -> bool {
                    self.to_bits() == other.to_bits()
                        || (*self == 0.0 && *other == 0.0)
                }
            }

            /// A total order bridging `PartialOrd` (not total due to `NaN`)
            /// and `total_cmp` (which separates 0 and -0): `total_cmp`
            /// except that zero and negative zero are equal.
            impl BitsOrd for $T {
                fn bits_cmp(&self, other: &Self) -> Ordering {
                    if *self == 0.0 && *other == 0.0 {
                        Ordering::Equal
                    } else {
                        self.total_cmp(other)
                    }
                }
            }

            impl PhysicalType for $T {
                const SIZE: usize = std::mem::size_of::<$T>();

                fn null_value() -> Self {
                    <$T>::MAX
                }

                fn del_value() -> Self {
                    <$T>::from_bits(<$T>::MAX.to_bits() - 1)
                }

                fn from_ne_bytes(bytes: &[u8]) -> Self {
                    <$T>::from_ne_bytes(bytes.try_into().unwrap())
                }

                fn write_ne_bytes(&self, out: &mut [u8]) {
                    out[..Self::SIZE].copy_from_slice(&self.to_ne_bytes())
                }

                fn to_f64(self) -> f64 {
                    self as f64
                }
            }
        )+
    }
}

float_physical_impls!(f32, f64);

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    /// Returns a strategy which produces truly any possible f64 bits,
    /// in contrast with [Arbitrary] which skips `NaN` and infinities.
    fn any_f64() -> impl Strategy<Value = f64> {
        any::<[u8; 8]>().prop_map(f64::from_ne_bytes)
    }

    proptest! {
        #[test]
        fn bits_cmp_f64_total_order(f1 in any_f64(), f2 in any_f64()) {
            let lt = f1.bits_lt(&f2);
            let eq = matches!(f1.bits_cmp(&f2), Ordering::Equal);
            let gt = f1.bits_gt(&f2);

            // exactly one of `<`, `==`, and `>` must hold for a total order
            prop_assert_eq!(
                1,
                [lt, eq, gt].iter().filter(|b| **b).count()
            );
        }

        #[test]
        fn bits_cmp_f64_reflexive(f in any_f64()) {
            prop_assert!(matches!(f.bits_cmp(&f), Ordering::Equal));
        }

        #[test]
        fn bits_eq_f64_reflexive(f in any_f64()) {
            prop_assert!(f.bits_eq(&f));
        }

        #[test]
        fn f64_byte_round_trip(f in any_f64()) {
            let mut buf = [0u8; 8];
            f.write_ne_bytes(&mut buf);
            prop_assert!(f.bits_eq(&<f64 as PhysicalType>::from_ne_bytes(&buf)));
        }

        #[test]
        fn i64_byte_round_trip(i in any::<i64>()) {
            let mut buf = [0u8; 8];
            i.write_ne_bytes(&mut buf);
            prop_assert_eq!(i, <i64 as PhysicalType>::from_ne_bytes(&buf));
        }
    }

    #[test]
    fn bits_cmp_zero_signs() {
        assert!(matches!(0f64.bits_cmp(&(-0f64)), Ordering::Equal));
        assert!(matches!((-0f32).bits_cmp(&0f32), Ordering::Equal));
    }

    #[test]
    fn special_values_are_distinct_and_ordered() {
        fn check<T: PhysicalType>() {
            assert!(T::del_value().bits_lt(&T::null_value()));
        }
        check::<u8>();
        check::<i32>();
        check::<i64>();
        check::<f32>();
        check::<f64>();
    }

    #[test]
    fn slice_order_is_lexicographic() {
        assert!([1i32, 5].bits_lt(&[2i32, 0][..]));
        assert!([1i32, 5].bits_lt(&[1i32, 6][..]));
        assert!(matches!(
            [1i32, 5].bits_cmp(&[1i32, 5][..]),
            Ordering::Equal
        ));
    }

    #[test]
    fn decode_at_walks_packed_values() {
        let bytes = encode_values(&[7i64, -2, 40]);
        assert_eq!(7, decode_at::<i64>(&bytes, 0));
        assert_eq!(-2, decode_at::<i64>(&bytes, 1));
        assert_eq!(40, decode_at::<i64>(&bytes, 2));
        assert_eq!(
            vec![7i64, -2, 40],
            decode_iter::<i64>(&bytes).collect::<Vec<_>>()
        );
    }
}
