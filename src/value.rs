//! The value representations instructions operate on: scalars and addresses.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An address in the VM's 64-bit segmented address space.
///
/// `Ptr` is a bare newtype around the numeric address; it does not by
/// itself know which segment it falls in or whether it is valid. Every
/// operation that needs those answers goes through
/// [`crate::memory::MemoryManager`] rather than touching the wrapped value
/// directly, so arithmetic on addresses cannot accidentally bypass bounds
/// and liveness checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ptr(pub u64);

impl Ptr {
    pub const NULL: Ptr = Ptr(0);

    pub const fn addr(self) -> u64 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Byte-level offset used internally by the memory manager once a
    /// pointer-arithmetic operation has already been classified as safe.
    pub fn byte_offset(self, delta: i64) -> Ptr {
        Ptr(self.0.wrapping_add(delta as u64))
    }
}

impl fmt::Display for Ptr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

/// The run-time value an instruction operand carries.
///
/// The reference executor this VM is modeled on stores operands in an
/// untagged union; we use a tagged enum instead, since every instruction's
/// operand types are already fixed by its opcode and the tag costs us
/// nothing but a clearer `match` at each use site.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum InstructionValue {
    I1(bool),
    I8(u8),
    I16(u16),
    I32(u32),
    I64(u64),
    F32(f32),
    F64(f64),
    Ptr(Ptr),
}

impl InstructionValue {
    pub fn as_i64(self) -> Option<i64> {
        match self {
            InstructionValue::I1(b) => Some(b as i64),
            InstructionValue::I8(v) => Some(v as i64),
            InstructionValue::I16(v) => Some(v as i64),
            InstructionValue::I32(v) => Some(v as i64),
            InstructionValue::I64(v) => Some(v as i64),
            _ => None,
        }
    }

    pub fn as_u64(self) -> Option<u64> {
        match self {
            InstructionValue::I1(b) => Some(b as u64),
            InstructionValue::I8(v) => Some(v as u64),
            InstructionValue::I16(v) => Some(v as u64),
            InstructionValue::I32(v) => Some(v as u64),
            InstructionValue::I64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_ptr(self) -> Option<Ptr> {
        match self {
            InstructionValue::Ptr(p) => Some(p),
            _ => None,
        }
    }

    /// Reinterpret the value's bit pattern as bytes, little-endian, matching
    /// the width of its own kind. Used when spilling a value into byte
    /// memory (globals, stack slots, heap allocations).
    pub fn to_le_bytes(self, pointer_width: u64) -> Vec<u8> {
        match self {
            InstructionValue::I1(b) => vec![b as u8],
            InstructionValue::I8(v) => vec![v],
            InstructionValue::I16(v) => v.to_le_bytes().to_vec(),
            InstructionValue::I32(v) => v.to_le_bytes().to_vec(),
            InstructionValue::I64(v) => v.to_le_bytes().to_vec(),
            InstructionValue::F32(v) => v.to_le_bytes().to_vec(),
            InstructionValue::F64(v) => v.to_le_bytes().to_vec(),
            InstructionValue::Ptr(p) => {
                let mut bytes = p.0.to_le_bytes().to_vec();
                bytes.truncate(pointer_width as usize);
                bytes
            }
        }
    }
}
