//! Component B: the Memory Manager.
//!
//! Owns the four segments of the VM's address space (global < stack < heap
//! < meta) and is the *only* code in the crate allowed to read or write raw
//! bytes. Every check an instruction needs — "is this dereference in
//! bounds and initialized", "does this pointer arithmetic stay inside its
//! object", "are these two pointers comparable" — is answered here, so the
//! executor never has to reimplement memory safety per opcode.

pub mod common;
pub mod global;
pub mod heap;
pub mod meta;
pub mod stack;

use crate::common::Id;
use crate::memory::common::{CallStackEntry, PointerArithmeticCheckResult, Segment, SegmentTable};
use crate::types::Type;
use crate::value::Ptr;

pub use global::GlobalObject;
pub use heap::{FreeResult, HeapObject};
pub use stack::{StackFrame, StackObject};

/// Outcome of a pointer-arithmetic or GEP step, already turned into a
/// concrete resulting address (minting a meta one-past-the-end handle where
/// needed) rather than the segment-local [`PointerArithmeticCheckResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithmeticOutcome {
    Fail,
    Ok(Ptr),
}

pub struct MemoryManager {
    top: SegmentTable<Segment>,
    global: global::GlobalMemoryManager,
    stack: stack::StackManager,
    heap: heap::HeapManager,
    meta: meta::MetaMemoryManager,
}

impl MemoryManager {
    pub fn new(global_begin: u64, stack_begin: u64, heap_begin: u64, meta_begin: u64) -> Self {
        Self {
            top: SegmentTable::new(vec![
                (Segment::Global, global_begin),
                (Segment::Stack, stack_begin),
                (Segment::Heap, heap_begin),
                (Segment::Meta, meta_begin),
            ]),
            global: global::GlobalMemoryManager::new(global_begin, stack_begin),
            stack: stack::StackManager::new(stack_begin, heap_begin),
            heap: heap::HeapManager::new(heap_begin, meta_begin),
            meta: meta::MetaMemoryManager::new(meta_begin),
        }
    }

    fn segment_of(&self, addr: Ptr) -> Segment {
        self.top.classify(addr.addr())
    }

    /// Resolve a meta handle down to the real address it designates,
    /// reporting the segment that real address belongs to. Non-meta
    /// addresses resolve to themselves.
    fn resolve(&self, addr: Ptr) -> Option<(Ptr, Segment)> {
        match self.segment_of(addr) {
            Segment::Meta => {
                let real = self.meta.resolve(addr, &self.stack)?;
                Some((real, self.segment_of(real)))
            }
            seg => Some((addr, seg)),
        }
    }

    // ---- global segment ----

    pub fn add_global_object(&mut self, ty: Type, bytes: Vec<u8>, name: Option<Id>) -> Option<Ptr> {
        self.global.add_object(ty, bytes, name)
    }

    pub fn make_function_pointer(&mut self, function_id: Id) -> Option<Ptr> {
        self.global.make_function_pointer(function_id)
    }

    pub fn function_id_at(&self, addr: Ptr) -> Option<Id> {
        self.global.function_id_at(addr)
    }

    // ---- stack segment ----

    pub fn push_stack_frame(&mut self, slot_types: &[Type]) -> Option<u64> {
        self.stack.push_frame(slot_types)
    }

    pub fn pop_stack_frame(&mut self) {
        self.stack.pop_frame()
    }

    pub fn stack_object_address(&self, frame_id: u64, index: usize) -> Option<Ptr> {
        self.stack.object_address(frame_id, index)
    }

    pub fn current_stack_frame_id(&self) -> Option<u64> {
        self.stack.current_frame_id()
    }

    pub fn lifetime_start(&mut self, addr: Ptr) {
        self.stack.set_initialized(addr, true);
    }

    pub fn lifetime_end(&mut self, addr: Ptr) {
        self.stack.set_initialized(addr, false);
    }

    // ---- heap segment ----

    pub fn malloc(&mut self, elem_type: Type, count: u64, call_stack: Vec<CallStackEntry>) -> Option<Ptr> {
        self.heap.allocate(elem_type, count, call_stack)
    }

    pub fn free(&mut self, addr: Ptr, call_stack: Vec<CallStackEntry>) -> FreeResult {
        match self.resolve(addr) {
            Some((real, Segment::Heap)) => self.heap.free(real, call_stack),
            Some(_) => FreeResult::UnknownAddress,
            None => FreeResult::UnknownAddress,
        }
    }

    pub fn get_allocation(&self, addr: Ptr) -> Option<&HeapObject> {
        self.heap.get_allocation(addr)
    }

    // ---- checks shared across segments ----

    pub fn check_dereference(&self, addr: Ptr, subobject_type: Type) -> bool {
        match self.resolve(addr) {
            Some((real, Segment::Global)) => self.global.check_dereference(real, subobject_type),
            Some((real, Segment::Stack)) => self.stack.check_dereference(real, subobject_type),
            Some((real, Segment::Heap)) => self.heap.check_dereference(real, subobject_type),
            Some((_, Segment::Meta)) | None => false,
        }
    }

    pub fn check_slice_construction(&self, addr: Ptr, elem_type: Type, len: u64) -> bool {
        match self.resolve(addr) {
            Some((real, Segment::Global)) => self.global.check_slice_construction(real, elem_type, len),
            Some((real, Segment::Stack)) => self.stack.check_slice_construction(real, elem_type, len),
            Some((real, Segment::Heap)) => self.heap.check_slice_construction(real, elem_type, len),
            Some((_, Segment::Meta)) | None => len == 0,
        }
    }

    /// Diagnostic-facing reason a failed slice construction check failed,
    /// computed lazily only once the executor knows it needs to report an
    /// error (the common success path never builds this string).
    pub fn explain_slice_construction_failure(&self, addr: Ptr, elem_type: Type, len: u64) -> String {
        match self.resolve(addr) {
            None => "pointer does not designate any live object".to_string(),
            Some((_, Segment::Meta)) => "pointer is a dangling one-past-the-end or stack handle".to_string(),
            Some((real, seg)) => {
                let span = elem_type.size.saturating_mul(len);
                format!(
                    "slice of {len} element(s) ({span} bytes) starting at {real} in the {seg:?} segment runs outside its containing object"
                )
            }
        }
    }

    pub fn compare_pointers(&self, a: Ptr, b: Ptr) -> bool {
        let ra = self.resolve(a).map(|(r, _)| r);
        let rb = self.resolve(b).map(|(r, _)| r);
        ra == rb
    }

    fn object_base(&self, real: Ptr, seg: Segment) -> Option<u64> {
        match seg {
            Segment::Global => self.global.object_base(real),
            Segment::Stack => self.stack.object_base(real),
            Segment::Heap => self.heap.object_base(real),
            Segment::Meta => None,
        }
    }

    /// Both pointers must resolve into the *same* object (not merely the
    /// same segment) for their difference to be well-defined.
    pub fn do_pointer_difference(&self, a: Ptr, b: Ptr, elem_type: Type) -> Option<i64> {
        let (ra, sa) = self.resolve(a)?;
        let (rb, sb) = self.resolve(b)?;
        if sa != sb || elem_type.size == 0 {
            return None;
        }
        if self.object_base(ra, sa) != self.object_base(rb, sb) {
            return None;
        }
        let diff = ra.addr() as i128 - rb.addr() as i128;
        if diff % elem_type.size as i128 != 0 {
            return None;
        }
        i64::try_from(diff / elem_type.size as i128).ok()
    }

    /// Shared implementation for both pointer-arithmetic and GEP
    /// instructions: both need "classify the step, then either fail or
    /// produce a concrete resulting pointer (minting a one-past-the-end
    /// meta handle if the step lands exactly there)".
    pub fn do_pointer_arithmetic(&mut self, addr: Ptr, elem_type: Type, count: i64) -> ArithmeticOutcome {
        let Some((real, seg)) = self.resolve(addr) else {
            return ArithmeticOutcome::Fail;
        };
        let result = match seg {
            Segment::Global => self.global.do_pointer_arithmetic(real, elem_type, count),
            Segment::Stack => self.stack.do_pointer_arithmetic(real, elem_type, count),
            Segment::Heap => self.heap.do_pointer_arithmetic(real, elem_type, count),
            Segment::Meta => return ArithmeticOutcome::Fail,
        };
        self.finish_step(real, seg, result, elem_type.size as i64 * count)
    }

    /// A GEP step is the same classification as pointer arithmetic, except
    /// the byte delta is the member's offset directly rather than
    /// `element.size * count`.
    pub fn do_gep(&mut self, addr: Ptr, member_type: Type, byte_offset: i64) -> ArithmeticOutcome {
        let Some((real, seg)) = self.resolve(addr) else {
            return ArithmeticOutcome::Fail;
        };
        let result = match seg {
            Segment::Global => self.global.do_gep(real, member_type, byte_offset),
            Segment::Stack => self.stack.do_gep(real, member_type, byte_offset),
            Segment::Heap => self.heap.do_gep(real, member_type, byte_offset),
            Segment::Meta => return ArithmeticOutcome::Fail,
        };
        self.finish_step(real, seg, result, byte_offset)
    }

    fn finish_step(&mut self, real: Ptr, seg: Segment, result: PointerArithmeticCheckResult, delta_bytes: i64) -> ArithmeticOutcome {
        match result {
            PointerArithmeticCheckResult::Fail => ArithmeticOutcome::Fail,
            PointerArithmeticCheckResult::Good => ArithmeticOutcome::Ok(Ptr(real.addr().wrapping_add_signed(delta_bytes))),
            PointerArithmeticCheckResult::OnePastTheEnd => {
                let end = match seg {
                    Segment::Global => self.global.object_end(real),
                    Segment::Stack => self.stack.object_end(real),
                    Segment::Heap => self.heap.object_end(real),
                    Segment::Meta => None,
                };
                let Some(end) = end else {
                    return ArithmeticOutcome::Fail;
                };
                match seg {
                    Segment::Global => match self.global.make_one_past_the_end(end) {
                        Some(handle) => ArithmeticOutcome::Ok(handle),
                        None => ArithmeticOutcome::Fail,
                    },
                    _ => ArithmeticOutcome::Ok(self.meta.make_one_past_the_end(end)),
                }
            }
        }
    }

    pub fn get_memory(&self, addr: Ptr, len: u64) -> Option<&[u8]> {
        match self.resolve(addr)? {
            (real, Segment::Global) => self.global.get_memory(real, len),
            (real, Segment::Stack) => self.stack.get_memory(real, len),
            (real, Segment::Heap) => self.heap.get_memory(real, len),
            (_, Segment::Meta) => None,
        }
    }

    pub fn get_memory_mut(&mut self, addr: Ptr, len: u64) -> Option<&mut [u8]> {
        let (real, seg) = self.resolve(addr)?;
        match seg {
            Segment::Global => self.global.get_memory_mut(real, len),
            Segment::Stack => self.stack.get_memory_mut(real, len),
            Segment::Heap => {
                let slice = self.heap.get_memory_mut(real, len)?;
                Some(slice)
            }
            Segment::Meta => None,
        }
    }

    /// Mark heap bytes as initialized after a store has written them. A
    /// no-op for addresses outside the heap, since the other segments track
    /// initialization per-object rather than per-byte (see
    /// [`stack::StackManager::set_initialized`]).
    pub fn mark_heap_initialized(&mut self, addr: Ptr, len: u64) {
        if let Some((real, Segment::Heap)) = self.resolve(addr) {
            self.heap.mark_initialized(real, len);
        }
    }

    /// Write `bytes` starting at `addr`, marking them initialized if the
    /// destination is a heap allocation. Returns `false` if the
    /// destination is out of bounds or not writable (dangling meta handle,
    /// one-past-the-end address, unknown location).
    pub fn write_bytes(&mut self, addr: Ptr, bytes: &[u8]) -> bool {
        let Some((_, seg)) = self.resolve(addr) else {
            return false;
        };
        let len = bytes.len() as u64;
        let written = match self.get_memory_mut(addr, len) {
            Some(slice) => {
                slice.copy_from_slice(bytes);
                true
            }
            None => false,
        };
        if written && seg == Segment::Heap {
            self.mark_heap_initialized(addr, len);
        }
        written
    }
}
