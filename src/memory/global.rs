//! The global segment: constant/static objects, function pointers, and the
//! one-past-the-end handles globals need (since a global array's end
//! address must stay a valid, comparable pointer value even though nothing
//! lives there).
//!
//! The segment is itself subdivided into three disjoint subregions so that
//! addresses in each can be told apart without a discriminant byte, the
//! same trick [`super::common::SegmentTable`] uses one level up.

use crate::common::Id;
use crate::memory::common::{check_pointer_arithmetic, contained_in_object, round_up, PointerArithmeticCheckResult, SegmentTable};
use crate::types::Type;
use crate::value::Ptr;

const MAX_OBJECT_ALIGN: u64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum GlobalRegion {
    OnePastTheEnd,
    Functions,
    Objects,
}

pub struct GlobalObject {
    pub address: Ptr,
    pub ty: Type,
    pub bytes: Vec<u8>,
    pub name: Option<Id>,
}

impl GlobalObject {
    fn end(&self) -> u64 {
        self.address.addr() + self.ty.size
    }
}

struct OnePastTheEndHandle {
    address: Ptr,
    real_end_address: Ptr,
}

struct FunctionPointerHandle {
    address: Ptr,
    function_id: Id,
}

pub struct GlobalMemoryManager {
    regions: SegmentTable<GlobalRegion>,
    one_past_the_end_head: u64,
    functions_head: u64,
    objects_head: u64,
    stack_begin: u64,
    one_past_the_end: Vec<OnePastTheEndHandle>,
    functions: Vec<FunctionPointerHandle>,
    objects: Vec<GlobalObject>,
}

impl GlobalMemoryManager {
    /// `global_begin..stack_begin` is this manager's whole address range,
    /// split into three equal-sized subregions.
    pub fn new(global_begin: u64, stack_begin: u64) -> Self {
        let span = stack_begin - global_begin;
        let third = span / 3;
        let one_past_the_end_begin = global_begin;
        let functions_begin = global_begin + third;
        let objects_begin = global_begin + 2 * third;
        Self {
            regions: SegmentTable::new(vec![
                (GlobalRegion::OnePastTheEnd, one_past_the_end_begin),
                (GlobalRegion::Functions, functions_begin),
                (GlobalRegion::Objects, objects_begin),
            ]),
            one_past_the_end_head: one_past_the_end_begin,
            functions_head: functions_begin,
            objects_head: objects_begin,
            stack_begin,
            one_past_the_end: Vec::new(),
            functions: Vec::new(),
            objects: Vec::new(),
        }
    }

    /// Register a global object's initial bytes and return its address.
    /// Returns `None` if the objects subregion has been exhausted.
    pub fn add_object(&mut self, ty: Type, bytes: Vec<u8>, name: Option<Id>) -> Option<Ptr> {
        let addr = self.objects_head;
        let next = round_up(addr + ty.size, MAX_OBJECT_ALIGN);
        if next > self.stack_begin {
            return None;
        }
        self.objects_head = next;
        let ptr = Ptr(addr);
        self.objects.push(GlobalObject {
            address: ptr,
            ty,
            bytes,
            name,
        });
        Some(ptr)
    }

    pub fn make_one_past_the_end(&mut self, real_end_address: Ptr) -> Option<Ptr> {
        let addr = self.one_past_the_end_head;
        let next = addr + 8;
        if next > self.regions.begin_of(GlobalRegion::Functions) {
            return None;
        }
        self.one_past_the_end_head = next;
        let ptr = Ptr(addr);
        self.one_past_the_end.push(OnePastTheEndHandle {
            address: ptr,
            real_end_address,
        });
        Some(ptr)
    }

    pub fn make_function_pointer(&mut self, function_id: Id) -> Option<Ptr> {
        if let Some(existing) = self.functions.iter().find(|f| f.function_id == function_id) {
            return Some(existing.address);
        }
        let addr = self.functions_head;
        let next = addr + 8;
        if next > self.regions.begin_of(GlobalRegion::Objects) {
            return None;
        }
        self.functions_head = next;
        let ptr = Ptr(addr);
        self.functions.push(FunctionPointerHandle {
            address: ptr,
            function_id,
        });
        Some(ptr)
    }

    pub fn function_id_at(&self, addr: Ptr) -> Option<Id> {
        self.functions.iter().find(|f| f.address == addr).map(|f| f.function_id)
    }

    fn get_object(&self, addr: Ptr) -> Option<&GlobalObject> {
        let idx = self
            .objects
            .partition_point(|o| o.address.addr() <= addr.addr())
            .checked_sub(1)?;
        let obj = &self.objects[idx];
        if addr.addr() < obj.end() {
            Some(obj)
        } else {
            None
        }
    }

    fn get_object_mut(&mut self, addr: Ptr) -> Option<&mut GlobalObject> {
        let idx = self
            .objects
            .partition_point(|o| o.address.addr() <= addr.addr())
            .checked_sub(1)?;
        let obj = &mut self.objects[idx];
        if addr.addr() < obj.end() {
            Some(obj)
        } else {
            None
        }
    }

    pub fn owns(&self, addr: Ptr) -> bool {
        addr.addr() < self.stack_begin
    }

    pub fn check_dereference(&self, addr: Ptr, subobject_type: Type) -> bool {
        match self.regions.classify(addr.addr()) {
            GlobalRegion::Objects => match self.get_object(addr) {
                Some(obj) => contained_in_object(obj.ty, subobject_type, addr.addr() - obj.address.addr()),
                None => false,
            },
            // One-past-the-end and function-pointer handles never refer to
            // readable storage.
            GlobalRegion::OnePastTheEnd | GlobalRegion::Functions => false,
        }
    }

    pub fn check_slice_construction(&self, addr: Ptr, elem_type: Type, len: u64) -> bool {
        match self.regions.classify(addr.addr()) {
            GlobalRegion::Objects => match self.get_object(addr) {
                Some(obj) => crate::memory::common::slice_contained_in_object(obj.ty, elem_type, addr.addr() - obj.address.addr(), len),
                None => false,
            },
            GlobalRegion::OnePastTheEnd | GlobalRegion::Functions => len == 0,
        }
    }

    pub fn do_pointer_arithmetic(&self, addr: Ptr, elem_type: Type, count: i64) -> PointerArithmeticCheckResult {
        match self.regions.classify(addr.addr()) {
            GlobalRegion::Objects => match self.get_object(addr) {
                Some(obj) => check_pointer_arithmetic(obj.ty, addr.addr() - obj.address.addr(), elem_type, count),
                None => PointerArithmeticCheckResult::Fail,
            },
            GlobalRegion::OnePastTheEnd | GlobalRegion::Functions => {
                if count == 0 {
                    PointerArithmeticCheckResult::OnePastTheEnd
                } else {
                    PointerArithmeticCheckResult::Fail
                }
            }
        }
    }

    pub fn do_gep(&self, addr: Ptr, member_type: Type, byte_offset: i64) -> PointerArithmeticCheckResult {
        match self.regions.classify(addr.addr()) {
            GlobalRegion::Objects => match self.get_object(addr) {
                Some(obj) => crate::memory::common::check_pointer_step(obj.ty, addr.addr() - obj.address.addr(), member_type, byte_offset),
                None => PointerArithmeticCheckResult::Fail,
            },
            GlobalRegion::OnePastTheEnd | GlobalRegion::Functions => {
                if byte_offset == 0 {
                    PointerArithmeticCheckResult::OnePastTheEnd
                } else {
                    PointerArithmeticCheckResult::Fail
                }
            }
        }
    }

    pub fn object_base(&self, addr: Ptr) -> Option<u64> {
        self.get_object(addr).map(|o| o.address.addr())
    }

    /// The real one-past-the-end address of the object `addr` points into,
    /// needed by the top-level manager to mint a one-past-the-end handle
    /// when pointer arithmetic lands exactly there.
    pub fn object_end(&self, addr: Ptr) -> Option<Ptr> {
        self.get_object(addr).map(|o| Ptr(o.end()))
    }

    pub fn get_memory(&self, addr: Ptr, len: u64) -> Option<&[u8]> {
        let obj = self.get_object(addr)?;
        let offset = (addr.addr() - obj.address.addr()) as usize;
        obj.bytes.get(offset..offset + len as usize)
    }

    pub fn get_memory_mut(&mut self, addr: Ptr, len: u64) -> Option<&mut [u8]> {
        let obj = self.get_object_mut(addr)?;
        let offset = (addr.addr() - obj.address.addr()) as usize;
        obj.bytes.get_mut(offset..offset + len as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BuiltinKind, PointerWidth, TypeRegistry};

    #[test]
    fn add_and_read_back_object() {
        let reg = TypeRegistry::new(PointerWidth::Bits64);
        let i32t = reg.builtin(BuiltinKind::I32);
        let mut gmm = GlobalMemoryManager::new(0x1000, 0x10000);
        let addr = gmm.add_object(i32t, vec![1, 2, 3, 4], None).unwrap();
        assert!(gmm.check_dereference(addr, i32t));
        assert_eq!(gmm.get_memory(addr, 4).unwrap(), &[1, 2, 3, 4]);
    }

    #[test]
    fn one_past_the_end_is_not_dereferenceable() {
        let mut gmm = GlobalMemoryManager::new(0x1000, 0x10000);
        let handle = gmm.make_one_past_the_end(Ptr(0x1234)).unwrap();
        let reg = TypeRegistry::new(PointerWidth::Bits64);
        let i32t = reg.builtin(BuiltinKind::I32);
        assert!(!gmm.check_dereference(handle, i32t));
    }
}
