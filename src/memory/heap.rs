//! The heap segment: `malloc`/`free`-style allocations with byte-granularity
//! initialization tracking, so a load of partially-written memory is caught
//! as a diagnostic instead of silently returning garbage.
//!
//! Freed allocations are kept around (flagged `is_freed`) rather than
//! removed, so a subsequent use-after-free or double-free can still report
//! which allocation and which call site it belongs to.

use crate::memory::common::{contained_in_object, round_up, CallStackEntry, PointerArithmeticCheckResult};
use crate::types::Type;
use crate::value::Ptr;

/// Heap allocations are rounded up to this alignment regardless of the
/// element type's own alignment, matching a conservative `malloc` that
/// doesn't know what the caller will store.
const HEAP_OBJECT_ALIGN: u64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeResult {
    Good,
    DoubleFree,
    UnknownAddress,
    AddressInsideObject,
}

/// A byte-granularity bitset tracking which bytes of an allocation have
/// been written.
#[derive(Debug, Clone)]
pub struct InitBitmap {
    bits: Vec<bool>,
}

impl InitBitmap {
    fn new(len: usize) -> Self {
        Self { bits: vec![false; len] }
    }

    fn mark_range(&mut self, start: usize, len: usize) {
        for b in &mut self.bits[start..start + len] {
            *b = true;
        }
    }

    fn is_range_initialized(&self, start: usize, len: usize) -> bool {
        self.bits[start..start + len].iter().all(|&b| b)
    }
}

pub struct HeapObject {
    pub address: Ptr,
    pub elem_type: Type,
    pub count: u64,
    pub bytes: Vec<u8>,
    pub init: InitBitmap,
    pub alloc_call_stack: Vec<CallStackEntry>,
    pub free_call_stack: Option<Vec<CallStackEntry>>,
    pub is_freed: bool,
}

impl HeapObject {
    fn total_type(&self) -> u64 {
        self.elem_type.size * self.count
    }
}

pub struct HeapManager {
    heap_begin: u64,
    meta_begin: u64,
    head: u64,
    allocations: Vec<HeapObject>,
}

impl HeapManager {
    pub fn new(heap_begin: u64, meta_begin: u64) -> Self {
        Self {
            heap_begin,
            meta_begin,
            head: heap_begin,
            allocations: Vec::new(),
        }
    }

    pub fn owns(&self, addr: Ptr) -> bool {
        addr.addr() >= self.heap_begin && addr.addr() < self.meta_begin
    }

    pub fn allocate(&mut self, elem_type: Type, count: u64, call_stack: Vec<CallStackEntry>) -> Option<Ptr> {
        let size = elem_type.size * count;
        let addr = self.head;
        let next = round_up(addr + size.max(1), HEAP_OBJECT_ALIGN);
        if next > self.meta_begin {
            return None;
        }
        self.head = next;
        let ptr = Ptr(addr);
        self.allocations.push(HeapObject {
            address: ptr,
            elem_type,
            count,
            bytes: vec![0u8; size as usize],
            init: InitBitmap::new(size as usize),
            alloc_call_stack: call_stack,
            free_call_stack: None,
            is_freed: false,
        });
        Some(ptr)
    }

    fn find(&self, addr: Ptr) -> Option<&HeapObject> {
        self.allocations.iter().find(|o| {
            let size = o.total_type();
            addr.addr() >= o.address.addr() && addr.addr() < o.address.addr() + size.max(1)
        })
    }

    fn find_mut(&mut self, addr: Ptr) -> Option<&mut HeapObject> {
        self.allocations.iter_mut().find(|o| {
            let size = o.total_type();
            addr.addr() >= o.address.addr() && addr.addr() < o.address.addr() + size.max(1)
        })
    }

    /// Free the allocation that begins exactly at `addr`.
    pub fn free(&mut self, addr: Ptr, call_stack: Vec<CallStackEntry>) -> FreeResult {
        let exact = self.allocations.iter_mut().find(|o| o.address == addr);
        match exact {
            Some(obj) if obj.is_freed => FreeResult::DoubleFree,
            Some(obj) => {
                obj.is_freed = true;
                obj.free_call_stack = Some(call_stack);
                FreeResult::Good
            }
            None => match self.find(addr) {
                Some(_) => FreeResult::AddressInsideObject,
                None => FreeResult::UnknownAddress,
            },
        }
    }

    pub fn get_allocation(&self, addr: Ptr) -> Option<&HeapObject> {
        self.find(addr)
    }

    pub fn check_dereference(&self, addr: Ptr, subobject_type: Type) -> bool {
        match self.find(addr) {
            Some(obj) if !obj.is_freed => {
                let offset = addr.addr() - obj.address.addr();
                if !Self::offset_contained(obj, subobject_type, offset) {
                    return false;
                }
                obj.init.is_range_initialized(offset as usize, subobject_type.size as usize)
            }
            _ => false,
        }
    }

    /// A heap allocation of N elements is treated as a flat array for
    /// containment purposes: strip one array dimension by hand (there is
    /// no interned array `Type` standing for "N copies of `elem_type`"
    /// since N is a runtime allocation count, not part of the type system).
    fn offset_contained(obj: &HeapObject, subobject_type: Type, offset: u64) -> bool {
        if offset >= obj.total_type() {
            return false;
        }
        let elem_size = obj.elem_type.size;
        if elem_size == 0 {
            return false;
        }
        let index_offset = offset % elem_size;
        contained_in_object(obj.elem_type, subobject_type, index_offset)
    }

    pub fn check_slice_construction(&self, addr: Ptr, elem_type: Type, len: u64) -> bool {
        match self.find(addr) {
            Some(obj) if !obj.is_freed => {
                let offset = addr.addr() - obj.address.addr();
                let span = elem_type.size.saturating_mul(len);
                if offset.saturating_add(span) > obj.total_type() {
                    return false;
                }
                if len == 0 {
                    return true;
                }
                Self::offset_contained(obj, elem_type, offset) && Self::offset_contained(obj, elem_type, offset + span - elem_type.size)
            }
            _ => len == 0,
        }
    }

    pub fn object_end(&self, addr: Ptr) -> Option<Ptr> {
        self.find(addr).map(|o| Ptr(o.address.addr() + o.total_type()))
    }

    pub fn do_gep(&self, addr: Ptr, member_type: Type, byte_offset: i64) -> PointerArithmeticCheckResult {
        match self.find(addr) {
            Some(obj) => {
                let total = obj.total_type();
                let offset = addr.addr() - obj.address.addr();
                let new_offset = offset as i128 + byte_offset as i128;
                if new_offset < 0 || new_offset > total as i128 {
                    return PointerArithmeticCheckResult::Fail;
                }
                let new_offset = new_offset as u64;
                if new_offset == total {
                    return PointerArithmeticCheckResult::OnePastTheEnd;
                }
                let elem_size = obj.elem_type.size;
                if elem_size == 0 {
                    return PointerArithmeticCheckResult::Fail;
                }
                let index_offset = new_offset % elem_size;
                if contained_in_object(obj.elem_type, member_type, index_offset) {
                    PointerArithmeticCheckResult::Good
                } else {
                    PointerArithmeticCheckResult::Fail
                }
            }
            None => PointerArithmeticCheckResult::Fail,
        }
    }

    pub fn object_base(&self, addr: Ptr) -> Option<u64> {
        self.find(addr).map(|o| o.address.addr())
    }

    pub fn do_pointer_arithmetic(&self, addr: Ptr, elem_type: Type, count: i64) -> PointerArithmeticCheckResult {
        match self.find(addr) {
            Some(obj) => {
                let total_size = obj.total_type();
                let offset = addr.addr() - obj.address.addr();
                let delta = elem_type.size as i128 * count as i128;
                let new_offset = offset as i128 + delta;
                if new_offset < 0 || new_offset > total_size as i128 {
                    PointerArithmeticCheckResult::Fail
                } else if new_offset as u64 == total_size {
                    PointerArithmeticCheckResult::OnePastTheEnd
                } else if (new_offset as u64) % elem_type.size == 0 {
                    PointerArithmeticCheckResult::Good
                } else {
                    PointerArithmeticCheckResult::Fail
                }
            }
            None => PointerArithmeticCheckResult::Fail,
        }
    }

    pub fn mark_initialized(&mut self, addr: Ptr, len: u64) {
        if let Some(obj) = self.find_mut(addr) {
            let offset = (addr.addr() - obj.address.addr()) as usize;
            obj.init.mark_range(offset, len as usize);
        }
    }

    pub fn get_memory(&self, addr: Ptr, len: u64) -> Option<&[u8]> {
        let obj = self.find(addr)?;
        let offset = (addr.addr() - obj.address.addr()) as usize;
        obj.bytes.get(offset..offset + len as usize)
    }

    pub fn get_memory_mut(&mut self, addr: Ptr, len: u64) -> Option<&mut [u8]> {
        let obj = self.find_mut(addr)?;
        let offset = (addr.addr() - obj.address.addr()) as usize;
        obj.bytes.get_mut(offset..offset + len as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BuiltinKind, PointerWidth, TypeRegistry};

    fn reg() -> TypeRegistry {
        TypeRegistry::new(PointerWidth::Bits64)
    }

    #[test]
    fn double_free_is_detected() {
        let t = reg();
        let i32t = t.builtin(BuiltinKind::I32);
        let mut hm = HeapManager::new(0x2000, 0x3000);
        let addr = hm.allocate(i32t, 4, vec![]).unwrap();
        assert_eq!(hm.free(addr, vec![]), FreeResult::Good);
        assert_eq!(hm.free(addr, vec![]), FreeResult::DoubleFree);
    }

    #[test]
    fn free_inside_object_is_rejected() {
        let t = reg();
        let i32t = t.builtin(BuiltinKind::I32);
        let mut hm = HeapManager::new(0x2000, 0x3000);
        let addr = hm.allocate(i32t, 4, vec![]).unwrap();
        let inner = Ptr(addr.addr() + 4);
        assert_eq!(hm.free(inner, vec![]), FreeResult::AddressInsideObject);
    }

    #[test]
    fn uninitialized_bytes_block_dereference() {
        let t = reg();
        let i32t = t.builtin(BuiltinKind::I32);
        let mut hm = HeapManager::new(0x2000, 0x3000);
        let addr = hm.allocate(i32t, 1, vec![]).unwrap();
        assert!(!hm.check_dereference(addr, i32t));
        hm.mark_initialized(addr, 4);
        assert!(hm.check_dereference(addr, i32t));
    }
}
