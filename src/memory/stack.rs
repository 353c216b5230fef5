//! The stack segment: one region per active call frame, one object per
//! alloca/parameter slot inside it.
//!
//! Each frame carries a monotonically increasing `id` so a meta pointer
//! captured while a frame was live (see [`crate::memory::meta`]) can be told
//! apart from a different, later frame that happens to reuse the same
//! address range after the first one popped.

use crate::memory::common::{check_pointer_arithmetic, contained_in_object, PointerArithmeticCheckResult};
use crate::types::Type;
use crate::value::Ptr;

pub struct StackObject {
    pub address: Ptr,
    pub ty: Type,
    /// Set by a lifetime-start instruction, cleared by lifetime-end; reads
    /// of an object while this is false are use-of-uninitialized-memory
    /// diagnostics, not crashes.
    pub initialized: bool,
    pub bytes: Vec<u8>,
}

pub struct StackFrame {
    pub id: u64,
    pub begin: u64,
    pub end: u64,
    pub objects: Vec<StackObject>,
}

pub struct StackManager {
    stack_begin: u64,
    heap_begin: u64,
    head: u64,
    next_frame_id: u64,
    frames: Vec<StackFrame>,
}

impl StackManager {
    pub fn new(stack_begin: u64, heap_begin: u64) -> Self {
        Self {
            stack_begin,
            heap_begin,
            head: stack_begin,
            next_frame_id: 0,
            frames: Vec::new(),
        }
    }

    pub fn owns(&self, addr: Ptr) -> bool {
        addr.addr() >= self.stack_begin && addr.addr() < self.heap_begin
    }

    /// Push a new frame with one object per entry in `slot_types`, in
    /// order. Returns the new frame's id, or `None` if the stack segment
    /// has been exhausted.
    pub fn push_frame(&mut self, slot_types: &[Type]) -> Option<u64> {
        let frame_begin = self.head;
        let mut objects = Vec::with_capacity(slot_types.len());
        let mut cursor = frame_begin;
        for &ty in slot_types {
            let start = crate::memory::common::round_up(cursor, ty.align.max(1));
            if start + ty.size > self.heap_begin {
                return None;
            }
            objects.push(StackObject {
                address: Ptr(start),
                ty,
                initialized: false,
                bytes: vec![0u8; ty.size as usize],
            });
            cursor = start + ty.size;
        }
        let id = self.next_frame_id;
        self.next_frame_id += 1;
        self.head = cursor;
        self.frames.push(StackFrame {
            id,
            begin: frame_begin,
            end: cursor,
            objects,
        });
        Some(id)
    }

    pub fn pop_frame(&mut self) {
        if let Some(frame) = self.frames.pop() {
            self.head = frame.begin;
        }
    }

    pub fn current_frame_id(&self) -> Option<u64> {
        self.frames.last().map(|f| f.id)
    }

    pub fn is_frame_live(&self, id: u64) -> bool {
        self.frames.iter().any(|f| f.id == id)
    }

    /// Address of the `index`-th object of the frame with the given id, in
    /// declaration order. Used right after [`Self::push_frame`] to seed a
    /// callee's alloca-backed operand slots.
    pub fn object_address(&self, frame_id: u64, index: usize) -> Option<Ptr> {
        self.frames.iter().find(|f| f.id == frame_id)?.objects.get(index).map(|o| o.address)
    }

    fn find_object(&self, addr: Ptr) -> Option<(&StackFrame, &StackObject)> {
        let frame = self.frames.iter().rev().find(|f| addr.addr() >= f.begin && addr.addr() < f.end)?;
        let obj = frame
            .objects
            .iter()
            .find(|o| addr.addr() >= o.address.addr() && addr.addr() < o.address.addr() + o.ty.size)?;
        Some((frame, obj))
    }

    fn find_object_mut(&mut self, addr: Ptr) -> Option<&mut StackObject> {
        let frame = self.frames.iter_mut().rev().find(|f| addr.addr() >= f.begin && addr.addr() < f.end)?;
        frame
            .objects
            .iter_mut()
            .find(|o| addr.addr() >= o.address.addr() && addr.addr() < o.address.addr() + o.ty.size)
    }

    pub fn set_initialized(&mut self, addr: Ptr, initialized: bool) {
        if let Some(obj) = self.find_object_mut(addr) {
            obj.initialized = initialized;
        }
    }

    pub fn check_dereference(&self, addr: Ptr, subobject_type: Type) -> bool {
        match self.find_object(addr) {
            Some((_, obj)) => obj.initialized && contained_in_object(obj.ty, subobject_type, addr.addr() - obj.address.addr()),
            None => false,
        }
    }

    pub fn do_pointer_arithmetic(&self, addr: Ptr, elem_type: Type, count: i64) -> PointerArithmeticCheckResult {
        match self.find_object(addr) {
            Some((_, obj)) => check_pointer_arithmetic(obj.ty, addr.addr() - obj.address.addr(), elem_type, count),
            None => PointerArithmeticCheckResult::Fail,
        }
    }

    pub fn do_gep(&self, addr: Ptr, member_type: Type, byte_offset: i64) -> PointerArithmeticCheckResult {
        match self.find_object(addr) {
            Some((_, obj)) => crate::memory::common::check_pointer_step(obj.ty, addr.addr() - obj.address.addr(), member_type, byte_offset),
            None => PointerArithmeticCheckResult::Fail,
        }
    }

    pub fn object_base(&self, addr: Ptr) -> Option<u64> {
        self.find_object(addr).map(|(_, obj)| obj.address.addr())
    }

    pub fn check_slice_construction(&self, addr: Ptr, elem_type: Type, len: u64) -> bool {
        match self.find_object(addr) {
            Some((_, obj)) => crate::memory::common::slice_contained_in_object(obj.ty, elem_type, addr.addr() - obj.address.addr(), len),
            None => len == 0,
        }
    }

    pub fn object_end(&self, addr: Ptr) -> Option<Ptr> {
        self.find_object(addr).map(|(_, obj)| Ptr(obj.address.addr() + obj.ty.size))
    }

    pub fn get_memory(&self, addr: Ptr, len: u64) -> Option<&[u8]> {
        let (_, obj) = self.find_object(addr)?;
        let offset = (addr.addr() - obj.address.addr()) as usize;
        obj.bytes.get(offset..offset + len as usize)
    }

    pub fn get_memory_mut(&mut self, addr: Ptr, len: u64) -> Option<&mut [u8]> {
        let obj = self.find_object_mut(addr)?;
        let offset = (addr.addr() - obj.address.addr()) as usize;
        obj.bytes.get_mut(offset..offset + len as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BuiltinKind, PointerWidth, TypeRegistry};

    #[test]
    fn push_pop_restores_head() {
        let reg = TypeRegistry::new(PointerWidth::Bits64);
        let i32t = reg.builtin(BuiltinKind::I32);
        let mut sm = StackManager::new(0x1000, 0x2000);
        let id = sm.push_frame(&[i32t, i32t]).unwrap();
        assert_eq!(sm.current_frame_id(), Some(id));
        sm.pop_frame();
        assert_eq!(sm.current_frame_id(), None);
        assert!(!sm.is_frame_live(id));
    }

    #[test]
    fn uninitialized_read_is_rejected() {
        let reg = TypeRegistry::new(PointerWidth::Bits64);
        let i32t = reg.builtin(BuiltinKind::I32);
        let mut sm = StackManager::new(0x1000, 0x2000);
        sm.push_frame(&[i32t]).unwrap();
        let addr = Ptr(0x1000);
        assert!(!sm.check_dereference(addr, i32t));
        sm.set_initialized(addr, true);
        assert!(sm.check_dereference(addr, i32t));
    }
}
