//! Component G: the constant-value bridge.
//!
//! The embedding compiler's front end deals in its own constant-value
//! representation, not in VM bytes. This module is the seam between the
//! two: it materializes a [`ConstantValue`] as bytes in some segment (for
//! feeding a function argument or a global initializer into the VM) and
//! reads VM memory back out as a [`ConstantValue`] once evaluation
//! finishes (for handing the result back to the compiler).

use thiserror::Error;

use crate::memory::MemoryManager;
use crate::types::Type;
use crate::value::Ptr;

#[derive(Debug, Clone, PartialEq)]
pub enum ConstantValue {
    I1(bool),
    I8(u8),
    I16(u16),
    I32(u32),
    I64(u64),
    F32(f32),
    F64(f64),
    Aggregate(Vec<ConstantValue>),
    Array(Vec<ConstantValue>),
    Pointer(Ptr),
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("constant value does not match the shape of type {ty:?}")]
    ShapeMismatch { ty: Type },
    #[error("memory manager rejected the write: segment exhausted or address invalid")]
    WriteFailed,
    #[error("address {addr} does not designate a live, initialized object of the expected type")]
    ReadFailed { addr: Ptr },
}

/// Write `value` into `len(ty.size)` freshly-allocated global bytes and
/// return its address. Used to seed global initializers and (via a pushed
/// stack frame) function arguments.
pub fn object_from_constant_value(memory: &mut MemoryManager, ty: Type, value: &ConstantValue) -> Result<Ptr, BridgeError> {
    let mut bytes = vec![0u8; ty.size as usize];
    write_into(ty, value, &mut bytes, 0)?;
    memory.add_global_object(ty, bytes, None).ok_or(BridgeError::WriteFailed)
}

fn write_into(ty: Type, value: &ConstantValue, bytes: &mut [u8], offset: usize) -> Result<(), BridgeError> {
    match (ty.builtin_kind(), value) {
        (Some(crate::types::BuiltinKind::I1), ConstantValue::I1(b)) => {
            bytes[offset] = *b as u8;
        }
        (Some(crate::types::BuiltinKind::I8), ConstantValue::I8(v)) => {
            bytes[offset] = *v;
        }
        (Some(crate::types::BuiltinKind::I16), ConstantValue::I16(v)) => {
            bytes[offset..offset + 2].copy_from_slice(&v.to_le_bytes());
        }
        (Some(crate::types::BuiltinKind::I32), ConstantValue::I32(v)) => {
            bytes[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
        }
        (Some(crate::types::BuiltinKind::I64), ConstantValue::I64(v)) => {
            bytes[offset..offset + 8].copy_from_slice(&v.to_le_bytes());
        }
        (Some(crate::types::BuiltinKind::F32), ConstantValue::F32(v)) => {
            bytes[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
        }
        (Some(crate::types::BuiltinKind::F64), ConstantValue::F64(v)) => {
            bytes[offset..offset + 8].copy_from_slice(&v.to_le_bytes());
        }
        _ if ty.is_aggregate() => {
            let members = ty.aggregate_types();
            let offsets = ty.aggregate_offsets();
            let ConstantValue::Aggregate(values) = value else {
                return Err(BridgeError::ShapeMismatch { ty });
            };
            if values.len() != members.len() {
                return Err(BridgeError::ShapeMismatch { ty });
            }
            for ((member, member_offset), member_value) in members.iter().zip(offsets).zip(values) {
                write_into(*member, member_value, bytes, offset + *member_offset as usize)?;
            }
        }
        _ if ty.is_array() => {
            let elem = ty.array_element_type();
            let ConstantValue::Array(values) = value else {
                return Err(BridgeError::ShapeMismatch { ty });
            };
            if values.len() as u64 != ty.array_len() {
                return Err(BridgeError::ShapeMismatch { ty });
            }
            for (i, elem_value) in values.iter().enumerate() {
                write_into(elem, elem_value, bytes, offset + i * elem.size as usize)?;
            }
        }
        _ if ty.is_pointer() => {
            let ConstantValue::Pointer(ptr) = value else {
                return Err(BridgeError::ShapeMismatch { ty });
            };
            bytes[offset..offset + ty.size as usize].copy_from_slice(&ptr.addr().to_le_bytes()[..ty.size as usize]);
        }
        _ => return Err(BridgeError::ShapeMismatch { ty }),
    }
    Ok(())
}

/// Read a [`ConstantValue`] of type `ty` back out of VM memory at `addr`,
/// failing if any byte involved is not live and initialized.
pub fn constant_value_from_object(memory: &MemoryManager, ty: Type, addr: Ptr) -> Result<ConstantValue, BridgeError> {
    if !memory.check_dereference(addr, ty) {
        return Err(BridgeError::ReadFailed { addr });
    }
    let bytes = memory.get_memory(addr, ty.size).ok_or(BridgeError::ReadFailed { addr })?;
    read_from(ty, bytes, memory)
}

fn read_from(ty: Type, bytes: &[u8], memory: &MemoryManager) -> Result<ConstantValue, BridgeError> {
    use crate::types::BuiltinKind;
    if let Some(kind) = ty.builtin_kind() {
        return Ok(match kind {
            BuiltinKind::I1 => ConstantValue::I1(bytes[0] != 0),
            BuiltinKind::I8 => ConstantValue::I8(bytes[0]),
            BuiltinKind::I16 => ConstantValue::I16(u16::from_le_bytes(bytes[0..2].try_into().unwrap())),
            BuiltinKind::I32 => ConstantValue::I32(u32::from_le_bytes(bytes[0..4].try_into().unwrap())),
            BuiltinKind::I64 => ConstantValue::I64(u64::from_le_bytes(bytes[0..8].try_into().unwrap())),
            BuiltinKind::F32 => ConstantValue::F32(f32::from_le_bytes(bytes[0..4].try_into().unwrap())),
            BuiltinKind::F64 => ConstantValue::F64(f64::from_le_bytes(bytes[0..8].try_into().unwrap())),
        });
    }
    if ty.is_pointer() {
        let mut buf = [0u8; 8];
        buf[..bytes.len().min(8)].copy_from_slice(&bytes[..bytes.len().min(8)]);
        return Ok(ConstantValue::Pointer(Ptr(u64::from_le_bytes(buf))));
    }
    if ty.is_aggregate() {
        let members = ty.aggregate_types();
        let offsets = ty.aggregate_offsets();
        let mut values = Vec::with_capacity(members.len());
        for (member, member_offset) in members.iter().zip(offsets) {
            let start = *member_offset as usize;
            let slice = &bytes[start..start + member.size as usize];
            values.push(read_from(*member, slice, memory)?);
        }
        return Ok(ConstantValue::Aggregate(values));
    }
    if ty.is_array() {
        let elem = ty.array_element_type();
        let mut values = Vec::with_capacity(ty.array_len() as usize);
        for i in 0..ty.array_len() as usize {
            let start = i * elem.size as usize;
            let slice = &bytes[start..start + elem.size as usize];
            values.push(read_from(elem, slice, memory)?);
        }
        return Ok(ConstantValue::Array(values));
    }
    Err(BridgeError::ShapeMismatch { ty })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BuiltinKind, PointerWidth, TypeRegistry};

    #[test]
    fn round_trips_a_scalar() {
        let reg = TypeRegistry::new(PointerWidth::Bits64);
        let i32t = reg.builtin(BuiltinKind::I32);
        let mut memory = MemoryManager::new(0x1000, 0x2000, 0x3000, 0x4000);
        let addr = object_from_constant_value(&mut memory, i32t, &ConstantValue::I32(42)).unwrap();
        let value = constant_value_from_object(&memory, i32t, addr).unwrap();
        assert_eq!(value, ConstantValue::I32(42));
    }

    #[test]
    fn round_trips_an_aggregate() {
        let reg = TypeRegistry::new(PointerWidth::Bits64);
        let i8t = reg.builtin(BuiltinKind::I8);
        let i32t = reg.builtin(BuiltinKind::I32);
        let agg = reg.aggregate(vec![i8t, i32t]);
        let mut memory = MemoryManager::new(0x1000, 0x2000, 0x3000, 0x4000);
        let value = ConstantValue::Aggregate(vec![ConstantValue::I8(9), ConstantValue::I32(100)]);
        let addr = object_from_constant_value(&mut memory, agg, &value).unwrap();
        assert_eq!(constant_value_from_object(&memory, agg, addr).unwrap(), value);
    }
}
