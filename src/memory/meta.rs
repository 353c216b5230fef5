//! The top-level meta segment: handles for addresses that are valid
//! pointer *values* but do not designate a byte of storage directly —
//! one-past-the-end addresses into the stack or heap, and pointers into a
//! stack frame that must be checked against that frame's liveness before
//! being followed.

use crate::memory::stack::StackManager;
use crate::value::Ptr;

#[derive(Debug, Clone, Copy)]
pub enum MetaHandle {
    OnePastTheEnd { real_address: Ptr },
    StackObject { frame_id: u64, real_address: Ptr },
}

pub struct MetaMemoryManager {
    meta_begin: u64,
    head: u64,
    handles: Vec<MetaHandle>,
}

impl MetaMemoryManager {
    pub fn new(meta_begin: u64) -> Self {
        Self {
            meta_begin,
            head: meta_begin,
            handles: Vec::new(),
        }
    }

    pub fn owns(&self, addr: Ptr) -> bool {
        addr.addr() >= self.meta_begin
    }

    fn push(&mut self, handle: MetaHandle) -> Ptr {
        let addr = Ptr(self.head);
        self.head += 8;
        self.handles.push(handle);
        addr
    }

    pub fn make_one_past_the_end(&mut self, real_address: Ptr) -> Ptr {
        self.push(MetaHandle::OnePastTheEnd { real_address })
    }

    pub fn make_stack_handle(&mut self, frame_id: u64, real_address: Ptr) -> Ptr {
        self.push(MetaHandle::StackObject { frame_id, real_address })
    }

    fn get(&self, addr: Ptr) -> Option<&MetaHandle> {
        let idx = ((addr.addr() - self.meta_begin) / 8) as usize;
        self.handles.get(idx)
    }

    /// Resolve a meta pointer to its real underlying address, returning
    /// `None` if the pointer has dangled (the stack frame that owned it has
    /// since popped) or is not a known handle at all.
    pub fn resolve(&self, addr: Ptr, stack: &StackManager) -> Option<Ptr> {
        match self.get(addr)? {
            MetaHandle::OnePastTheEnd { real_address } => Some(*real_address),
            MetaHandle::StackObject { frame_id, real_address } => {
                if stack.is_frame_live(*frame_id) {
                    Some(*real_address)
                } else {
                    None
                }
            }
        }
    }

    pub fn is_one_past_the_end(&self, addr: Ptr) -> bool {
        matches!(self.get(addr), Some(MetaHandle::OnePastTheEnd { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_handle_dangles_after_pop() {
        use crate::types::{BuiltinKind, PointerWidth, TypeRegistry};
        let reg = TypeRegistry::new(PointerWidth::Bits64);
        let i32t = reg.builtin(BuiltinKind::I32);
        let mut stack = StackManager::new(0x1000, 0x2000);
        let mut meta = MetaMemoryManager::new(0x3000);
        let frame_id = stack.push_frame(&[i32t]).unwrap();
        let handle = meta.make_stack_handle(frame_id, Ptr(0x1000));
        assert_eq!(meta.resolve(handle, &stack), Some(Ptr(0x1000)));
        stack.pop_frame();
        assert_eq!(meta.resolve(handle, &stack), None);
    }
}
