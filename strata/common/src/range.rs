use thiserror::Error;

use crate::physical::{decode_iter, encode_values, BitsOrd, PhysicalType};

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum Error {
    #[error("Expected bounds for {expected} dimensions but found {found}")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("Empty bound in dimension {0}: lower exceeds upper")]
    EmptyBound(usize),
}

/// How a hyper-rectangle relates to another region of the space.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Overlap {
    /// The regions are disjoint.
    None,
    /// The regions intersect but neither contains the other.
    Partial,
    /// The probed region lies entirely inside this one.
    Full,
}

/// An inclusive hyper-rectangle in the coordinate space: one
/// `[lower, upper]` bound per dimension.
///
/// This is both the shape of a query range and, flattened to
/// `(lo, hi, lo, hi, ...)` bytes, the shape of a coordinate tile's MBR.
#[derive(Clone, Debug, PartialEq)]
pub struct HyperRect<T> {
    bounds: Vec<[T; 2]>,
}

impl<T: PhysicalType> HyperRect<T> {
    pub fn new(bounds: Vec<[T; 2]>) -> Result<Self, Error> {
        for (d, [lo, hi]) in bounds.iter().enumerate() {
            if lo.bits_gt(hi) {
                return Err(Error::EmptyBound(d));
            }
        }
        Ok(HyperRect { bounds })
    }

    /// Builds a rectangle from the flat `(lo, hi, lo, hi, ...)` layout
    /// used by tile MBRs and the original range arguments.
    pub fn from_flat(flat: &[T]) -> Result<Self, Error> {
        if flat.len() % 2 != 0 {
            return Err(Error::DimensionMismatch {
                expected: flat.len() / 2 + 1,
                found: flat.len() / 2,
            });
        }
        Self::new(flat.chunks_exact(2).map(|c| [c[0], c[1]]).collect())
    }

    pub fn dim_num(&self) -> usize {
        self.bounds.len()
    }

    pub fn bounds(&self) -> &[[T; 2]] {
        &self.bounds
    }

    /// Whether `point` lies inside the rectangle. Bounds are inclusive on
    /// both ends in every dimension.
    ///
    /// # Panics
    ///
    /// Panics if `point` has fewer values than there are dimensions.
    pub fn contains(&self, point: &[T]) -> bool {
        self.bounds
            .iter()
            .zip(point.iter())
            .all(|([lo, hi], p)| lo.bits_le(p) && p.bits_le(hi))
    }

    /// Whether the packed coordinates in `bytes` lie inside the rectangle.
    pub fn contains_bytes(&self, bytes: &[u8]) -> bool {
        self.bounds
            .iter()
            .zip(decode_iter::<T>(bytes))
            .all(|([lo, hi], p)| lo.bits_le(&p) && p.bits_le(hi))
    }

    /// Classifies the overlap between this rectangle (the query range) and
    /// an MBR given in flat `(lo, hi, ...)` form.
    pub fn overlap_flat(&self, mbr: &[T]) -> Overlap {
        debug_assert_eq!(2 * self.dim_num(), mbr.len());

        let mut full = true;
        for (d, [lo, hi]) in self.bounds.iter().enumerate() {
            let mbr_lo = &mbr[2 * d];
            let mbr_hi = &mbr[2 * d + 1];
            if mbr_hi.bits_lt(lo) || mbr_lo.bits_gt(hi) {
                return Overlap::None;
            }
            if mbr_lo.bits_lt(lo) || mbr_hi.bits_gt(hi) {
                full = false;
            }
        }

        if full {
            Overlap::Full
        } else {
            Overlap::Partial
        }
    }

    /// Classifies overlap against an MBR in packed byte form.
    pub fn overlap_bytes(&self, mbr: &[u8]) -> Overlap {
        let decoded = decode_iter::<T>(mbr).collect::<Vec<_>>();
        self.overlap_flat(&decoded)
    }

    /// Flattens to the `(lo, hi, lo, hi, ...)` byte layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let flat = self
            .bounds
            .iter()
            .flat_map(|b| b.iter().copied())
            .collect::<Vec<_>>();
        encode_values(&flat)
    }
}

/// Grows a flat MBR in place so that it covers `coords`. An empty `mbr`
/// vector is seeded as the degenerate rectangle at `coords`.
pub fn expand_mbr<T: PhysicalType>(mbr: &mut Vec<T>, coords: &[T]) {
    if mbr.is_empty() {
        for c in coords {
            mbr.push(*c);
            mbr.push(*c);
        }
        return;
    }

    debug_assert_eq!(2 * coords.len(), mbr.len());
    for (d, c) in coords.iter().enumerate() {
        if c.bits_lt(&mbr[2 * d]) {
            mbr[2 * d] = *c;
        }
        if c.bits_gt(&mbr[2 * d + 1]) {
            mbr[2 * d + 1] = *c;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(bounds: &[[i32; 2]]) -> HyperRect<i32> {
        HyperRect::new(bounds.to_vec()).unwrap()
    }

    #[test]
    fn empty_bound_is_rejected() {
        assert_eq!(
            Err(Error::EmptyBound(1)),
            HyperRect::new(vec![[0i32, 4], [3, 2]])
        );
    }

    #[test]
    fn containment_is_inclusive() {
        let r = rect(&[[1, 2], [1, 2]]);
        assert!(r.contains(&[1, 1]));
        assert!(r.contains(&[2, 2]));
        assert!(!r.contains(&[0, 1]));
        assert!(!r.contains(&[1, 3]));
    }

    #[test]
    fn overlap_classification() {
        let r = rect(&[[2, 5], [2, 5]]);
        // disjoint in the first dimension
        assert_eq!(Overlap::None, r.overlap_flat(&[6, 8, 2, 4]));
        // crosses the lower boundary
        assert_eq!(Overlap::Partial, r.overlap_flat(&[1, 3, 2, 4]));
        // sits entirely inside
        assert_eq!(Overlap::Full, r.overlap_flat(&[3, 4, 2, 5]));
        // touching at a corner still overlaps
        assert_eq!(Overlap::Partial, r.overlap_flat(&[0, 2, 0, 2]));
    }

    #[test]
    fn flat_round_trip() {
        let r = rect(&[[1, 2], [3, 4]]);
        let bytes = r.to_bytes();
        assert!(r.contains_bytes(&crate::physical::encode_values(&[2, 3])));
        let back = HyperRect::<i32>::from_flat(
            &crate::physical::decode_iter::<i32>(&bytes).collect::<Vec<_>>(),
        )
        .unwrap();
        assert_eq!(r, back);
    }

    #[test]
    fn mbr_expansion() {
        let mut mbr = Vec::new();
        expand_mbr(&mut mbr, &[3i32, 7]);
        assert_eq!(vec![3, 3, 7, 7], mbr);
        expand_mbr(&mut mbr, &[5i32, 2]);
        assert_eq!(vec![3, 5, 2, 7], mbr);
        expand_mbr(&mut mbr, &[1i32, 9]);
        assert_eq!(vec![1, 5, 2, 9], mbr);
    }

    #[test]
    fn float_overlap_uses_total_order() {
        let r = HyperRect::new(vec![[0.0f64, 1.0]]).unwrap();
        assert_eq!(Overlap::Full, r.overlap_flat(&[0.0, 0.5]));
        assert_eq!(Overlap::None, r.overlap_flat(&[1.5, 2.0]));
    }
}
