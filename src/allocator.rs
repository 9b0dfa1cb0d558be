//! Bucket allocator: lays variants out over the bucket space and resolves a bucket to a variant.
use serde::{Deserialize, Serialize};

use crate::sharder::BUCKET_SPACE;

/// A variant as it appears in the configuration document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantWire {
    pub name: String,
    pub traffic_allocation_basis_points: u32,
}

/// A variant with its physical sub-range `[start, end)` of the bucket space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variant {
    pub name: String,
    pub start: u64,
    pub end: u64,
}

impl Variant {
    fn contains(&self, bucket: u64) -> bool {
        self.start <= bucket && bucket < self.end
    }
}

/// Variants laid out as contiguous, non-overlapping ranges of the bucket space in configuration
/// order. Buckets past the last range are unallocated.
///
/// Reordering variants while keeping their allocations moves them to different physical ranges,
/// so it changes assignments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    variants: Box<[Variant]>,
}

impl Allocation {
    /// Lay out `variants` in order. Returns the total allocation (in basis points) as an error if it
    /// exceeds [`BUCKET_SPACE`].
    pub(crate) fn layout(variants: &[VariantWire]) -> Result<Allocation, u64> {
        let mut start = 0u64;
        let variants = variants
            .iter()
            .map(|variant| {
                let end = start + u64::from(variant.traffic_allocation_basis_points);
                let variant = Variant {
                    name: variant.name.clone(),
                    start,
                    end,
                };
                start = end;
                variant
            })
            .collect::<Box<[_]>>();

        if start > BUCKET_SPACE {
            return Err(start);
        }

        Ok(Allocation { variants })
    }

    /// Resolve `bucket` to a variant, or `None` if it falls into the unallocated remainder.
    pub fn allocate(&self, bucket: u64) -> Option<&Variant> {
        self.variants.iter().find(|variant| variant.contains(bucket))
    }

    pub fn variants(&self) -> &[Variant] {
        &self.variants
    }

    /// Total allocated traffic in basis points.
    pub fn allocated(&self) -> u64 {
        self.variants.last().map_or(0, |variant| variant.end)
    }
}

#[cfg(test)]
mod tests {
    use super::{Allocation, VariantWire};

    fn variants(allocations: &[(&str, u32)]) -> Vec<VariantWire> {
        allocations
            .iter()
            .map(|(name, bp)| VariantWire {
                name: name.to_string(),
                traffic_allocation_basis_points: *bp,
            })
            .collect()
    }

    fn allocate(allocation: &Allocation, bucket: u64) -> Option<&str> {
        allocation.allocate(bucket).map(|v| v.name.as_str())
    }

    #[test]
    fn boundaries_are_half_open() {
        let allocation =
            Allocation::layout(&variants(&[("control", 5000), ("treatment", 5000)])).unwrap();
        assert_eq!(allocate(&allocation, 0), Some("control"));
        assert_eq!(allocate(&allocation, 4999), Some("control"));
        assert_eq!(allocate(&allocation, 5000), Some("treatment"));
        assert_eq!(allocate(&allocation, 9999), Some("treatment"));
        assert_eq!(allocate(&allocation, 10_000), None);
    }

    #[test]
    fn remainder_is_excluded() {
        let allocation = Allocation::layout(&variants(&[("a", 1000), ("b", 2000)])).unwrap();
        assert_eq!(allocation.allocated(), 3000);
        assert_eq!(allocate(&allocation, 999), Some("a"));
        assert_eq!(allocate(&allocation, 1000), Some("b"));
        assert_eq!(allocate(&allocation, 2999), Some("b"));
        assert_eq!(allocate(&allocation, 3000), None);
    }

    #[test]
    fn zero_allocation_variant_never_matches() {
        let allocation =
            Allocation::layout(&variants(&[("a", 0), ("b", 10_000), ("c", 0)])).unwrap();
        for bucket in [0, 1, 5000, 9999] {
            assert_eq!(allocate(&allocation, bucket), Some("b"));
        }
    }

    #[test]
    fn reordering_moves_ranges() {
        let forward = Allocation::layout(&variants(&[("a", 3000), ("b", 7000)])).unwrap();
        let backward = Allocation::layout(&variants(&[("b", 7000), ("a", 3000)])).unwrap();
        assert_eq!(allocate(&forward, 0), Some("a"));
        assert_eq!(allocate(&backward, 0), Some("b"));
    }

    #[test]
    fn rejects_allocations_exceeding_bucket_space() {
        assert_eq!(
            Allocation::layout(&variants(&[("a", 6000), ("b", 6000)])),
            Err(12_000)
        );
        assert!(Allocation::layout(&variants(&[("a", 10_000)])).is_ok());
    }
}
