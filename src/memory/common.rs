//! Primitives shared by every segment manager: segment classification,
//! endianness swapping, and the subobject-containment / pointer-arithmetic
//! algorithms that are independent of which segment a pointer lives in.

use crate::types::Type;
use crate::value::Ptr;

/// Which of the four top-level address ranges a pointer falls in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Segment {
    Global,
    Stack,
    Heap,
    Meta,
}

/// Ascending table of (segment, first address) pairs, used to classify an
/// address by binary search rather than a chain of manual comparisons. The
/// same shape is reused inside the global manager to split its own address
/// range into one-past-the-end / function / object subregions.
#[derive(Debug, Clone)]
pub struct SegmentTable<K> {
    // Sorted ascending by `begin`; `entries[0].1` must be the lowest address
    // this table is willing to classify.
    entries: Vec<(K, u64)>,
}

impl<K: Copy> SegmentTable<K> {
    /// `entries` must be sorted ascending by address and non-empty.
    pub fn new(entries: Vec<(K, u64)>) -> Self {
        debug_assert!(!entries.is_empty());
        debug_assert!(entries.windows(2).all(|w| w[0].1 < w[1].1));
        Self { entries }
    }

    pub fn classify(&self, addr: u64) -> K {
        let idx = self
            .entries
            .partition_point(|&(_, begin)| begin <= addr)
            .saturating_sub(1);
        self.entries[idx].0
    }
}

impl<K: Copy + PartialEq> SegmentTable<K> {
    pub fn begin_of(&self, key: K) -> u64 {
        self.entries
            .iter()
            .find(|&&(k, _)| k == key)
            .map(|&(_, begin)| begin)
            .expect("internal error: key not present in segment table")
    }
}

/// Byte-swap any plain-old-data value. Used when a VM is configured for
/// big-endian emulation while running on a little-endian host (or vice
/// versa); swapping twice must be the identity, which the property test
/// below checks.
pub fn byteswap_bytes(bytes: &mut [u8]) {
    bytes.reverse();
}

/// Result of classifying a pointer-arithmetic step against the object it
/// was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerArithmeticCheckResult {
    /// The resulting address does not designate any subobject of the
    /// source object, nor its one-past-the-end address.
    Fail,
    /// The resulting address designates a live subobject.
    Good,
    /// The resulting address is exactly one past the end of the object (or
    /// of an array element within it); valid to form, not valid to
    /// dereference.
    OnePastTheEnd,
}

/// Is `offset` (in bytes, from `base`) contained within a value of type
/// `object_type`, and if so does it land exactly on a subobject boundary of
/// type `target_type`?
///
/// Ported from the recursive subobject-containment walk of the reference
/// executor: strip one level of (aggregate member | array element) at a
/// time, consuming the matching prefix of `offset`, until the offset is
/// zero at a node whose type equals `target_type`, or the type would need
/// to be split further than its structure allows.
pub fn contained_in_object(object_type: Type, target_type: Type, offset: u64) -> bool {
    if offset == 0 && object_type == target_type {
        return true;
    }
    if offset >= object_type.size {
        return false;
    }
    if object_type.is_aggregate() {
        let members = object_type.aggregate_types();
        let offsets = object_type.aggregate_offsets();
        for (i, &member) in members.iter().enumerate() {
            let start = offsets[i];
            let end = start + member.size;
            if offset >= start && offset < end {
                return contained_in_object(member, target_type, offset - start);
            }
        }
        false
    } else if object_type.is_array() {
        let elem = object_type.array_element_type();
        let elem_size = elem.size;
        if elem_size == 0 {
            return false;
        }
        let index_offset = offset % elem_size;
        contained_in_object(elem, target_type, index_offset)
    } else {
        false
    }
}

/// Like [`contained_in_object`], but for a *slice* of `len` consecutive
/// `target_type` elements starting at `offset`: every element of the slice
/// (not just the first) must be a contained subobject, and the whole span
/// must not run past the end of `object_type`.
pub fn slice_contained_in_object(object_type: Type, target_type: Type, offset: u64, len: u64) -> bool {
    if len == 0 {
        return offset <= object_type.size;
    }
    let span = target_type.size.saturating_mul(len);
    if offset.saturating_add(span) > object_type.size {
        return false;
    }
    // Every individual element must resolve to a valid subobject; checking
    // the first and last is enough because aggregates/arrays place members
    // contiguously and `target_type` is homogeneous across the slice.
    contained_in_object(object_type, target_type, offset)
        && contained_in_object(object_type, target_type, offset + span - target_type.size)
}

/// Classify the result of moving `delta_bytes` from `base_offset` within an
/// object of type `object_type`, where the destination must land on a
/// subobject of type `check_type` (or exactly at the object's end).
///
/// Shared by both pointer-arithmetic (`delta_bytes = element.size * count`)
/// and GEP (`delta_bytes` = the member's byte offset directly) checks; only
/// how `delta_bytes` is derived differs between the two callers.
pub fn check_pointer_step(object_type: Type, base_offset: u64, check_type: Type, delta_bytes: i64) -> PointerArithmeticCheckResult {
    let new_offset = base_offset as i128 + delta_bytes as i128;
    if new_offset < 0 || new_offset > object_type.size as i128 {
        return PointerArithmeticCheckResult::Fail;
    }
    let new_offset = new_offset as u64;
    if new_offset == object_type.size {
        return PointerArithmeticCheckResult::OnePastTheEnd;
    }
    if contained_in_object(object_type, check_type, new_offset) {
        PointerArithmeticCheckResult::Good
    } else {
        PointerArithmeticCheckResult::Fail
    }
}

/// Classify the result of adding `element_count * element_type.size` bytes
/// to a pointer into an object of type `object_type` at `base_offset`.
pub fn check_pointer_arithmetic(object_type: Type, base_offset: u64, element_type: Type, element_count: i64) -> PointerArithmeticCheckResult {
    let delta_bytes = element_type.size as i64 * element_count;
    check_pointer_step(object_type, base_offset, element_type, delta_bytes)
}

pub fn round_up(value: u64, align: u64) -> u64 {
    debug_assert!(align != 0);
    let rem = value % align;
    if rem == 0 {
        value
    } else {
        value + (align - rem)
    }
}

/// A snapshot of one call-stack frame, used both for heap-allocation
/// provenance (recorded at `malloc`/`free` time) and for diagnostic note
/// reconstruction.
#[derive(Debug, Clone)]
pub struct CallStackEntry {
    pub function_signature: crate::common::Id,
    pub call_site_line: u32,
}

/// Marker type returned by address-classification helpers that need to say
/// "this address does not belong to me" without allocating an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressNotFound;

pub(crate) fn ptr_in_range(ptr: Ptr, begin: u64, end: u64) -> bool {
    ptr.addr() >= begin && ptr.addr() < end
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byteswap_is_involution() {
        let mut bytes = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let original = bytes;
        byteswap_bytes(&mut bytes);
        byteswap_bytes(&mut bytes);
        assert_eq!(bytes, original);
    }

    proptest::proptest! {
        #[test]
        fn byteswap_is_involution_for_any_bytes(mut bytes: Vec<u8>) {
            let original = bytes.clone();
            byteswap_bytes(&mut bytes);
            byteswap_bytes(&mut bytes);
            proptest::prop_assert_eq!(bytes, original);
        }

        #[test]
        fn round_up_never_decreases_and_is_aligned(value in 0u64..1_000_000, align_pow in 0u32..6) {
            let align = 1u64 << align_pow;
            let rounded = round_up(value, align);
            proptest::prop_assert!(rounded >= value);
            proptest::prop_assert_eq!(rounded % align, 0);
        }
    }

    #[test]
    fn segment_table_classifies_by_lower_bound() {
        let table = SegmentTable::new(vec![(Segment::Global, 0u64), (Segment::Stack, 100), (Segment::Heap, 200)]);
        assert_eq!(table.classify(0), Segment::Global);
        assert_eq!(table.classify(99), Segment::Global);
        assert_eq!(table.classify(100), Segment::Stack);
        assert_eq!(table.classify(250), Segment::Heap);
    }

    #[test]
    fn contained_in_object_finds_nested_member() {
        use crate::types::{BuiltinKind, PointerWidth, TypeRegistry};
        let reg = TypeRegistry::new(PointerWidth::Bits64);
        let i8t = reg.builtin(BuiltinKind::I8);
        let i32t = reg.builtin(BuiltinKind::I32);
        let agg = reg.aggregate(vec![i8t, i32t]);
        assert!(contained_in_object(agg, i32t, 4));
        assert!(!contained_in_object(agg, i32t, 1));
        assert!(contained_in_object(agg, i8t, 0));
    }

    #[test]
    fn pointer_arithmetic_one_past_the_end() {
        use crate::types::{BuiltinKind, PointerWidth, TypeRegistry};
        let reg = TypeRegistry::new(PointerWidth::Bits64);
        let i32t = reg.builtin(BuiltinKind::I32);
        let arr = reg.array(i32t, 4);
        assert_eq!(
            check_pointer_arithmetic(arr, 12, i32t, 1),
            PointerArithmeticCheckResult::OnePastTheEnd
        );
        assert_eq!(
            check_pointer_arithmetic(arr, 12, i32t, 2),
            PointerArithmeticCheckResult::Fail
        );
        assert_eq!(
            check_pointer_arithmetic(arr, 0, i32t, 2),
            PointerArithmeticCheckResult::Good
        );
    }
}
