//! Component C (function half): a function's code plus the side-tables its
//! instructions index into.
//!
//! Large or variable-length per-instruction data (source positions, switch
//! tables, call argument lists, check configuration) lives in these
//! side-tables rather than inline in [`Instruction`](crate::instructions::Instruction),
//! keeping every instruction a small, fixed-size value.

use serde::{Deserialize, Serialize};

use crate::common::{Id, Map};
use crate::instructions::{BlockIndex, Instruction, OperandIndex};
use crate::types::Type;

/// One line:column span in the source the function was compiled from, used
/// to point diagnostics at the expression that produced a given value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SrcToken {
    pub file_id: u32,
    pub line: u32,
    pub column_begin: u32,
    pub column_end: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WarningKind {
    UnusedResult,
    ImplicitTruncation,
    SignednessMismatch,
}

/// A pre-built error record an `Error` instruction raises directly, rather
/// than one synthesized from a runtime check failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
    pub src_token: SrcToken,
    pub warning: Option<WarningKind>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallArgsInfo {
    pub args: Vec<OperandIndex>,
    pub call_src_token: SrcToken,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchInfo {
    pub cases: Vec<(i64, BlockIndex)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchStrInfo {
    pub cases: Vec<(String, BlockIndex)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceConstructionCheckInfo {
    pub elem_type: Type,
    pub src_token: SrcToken,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointerArithmeticCheckInfo {
    pub elem_type: Type,
    pub src_token: SrcToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryAccessKind {
    Read,
    Write,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryAccessCheckInfo {
    pub accessed_type: Type,
    pub kind: MemoryAccessKind,
    pub src_token: SrcToken,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopyValuesInfo {
    pub elem_type: Type,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddGlobalArrayDataInfo {
    pub elem_type: Type,
    pub bytes: Vec<u8>,
}

/// A function's side-tables, indexed by [`crate::instructions::SideTableIndex`]
/// from its instructions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SideTables {
    pub src_tokens: Vec<SrcToken>,
    pub errors: Vec<ErrorInfo>,
    pub call_args: Vec<CallArgsInfo>,
    pub switch_infos: Vec<SwitchInfo>,
    pub switch_str_infos: Vec<SwitchStrInfo>,
    pub slice_construction_checks: Vec<SliceConstructionCheckInfo>,
    pub pointer_arithmetic_checks: Vec<PointerArithmeticCheckInfo>,
    pub memory_access_checks: Vec<MemoryAccessCheckInfo>,
    pub copy_values_infos: Vec<CopyValuesInfo>,
    pub add_global_array_data_infos: Vec<AddGlobalArrayDataInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicBlock {
    pub instructions: Vec<Instruction>,
}

/// One parameter or local stack slot, materialized as a stack object when
/// the function's frame is pushed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alloca {
    pub ty: Type,
    pub name: Option<Id>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    pub signature: Id,
    pub return_type: Option<Type>,
    pub param_types: Vec<Type>,
    pub allocas: Vec<Alloca>,
    pub blocks: Vec<BasicBlock>,
    pub side_tables: SideTables,
}

impl Function {
    pub fn block(&self, index: BlockIndex) -> &BasicBlock {
        &self.blocks[index.0 as usize]
    }

    /// Total operand-value slots this function's frame needs: one per
    /// alloca (holding that slot's address), then one per instruction that
    /// produces a value, in declaration order across all blocks.
    pub fn operand_slot_count(&self) -> u32 {
        let instruction_results: u32 = self.blocks.iter().map(|b| b.instructions.len() as u32).sum();
        self.allocas.len() as u32 + instruction_results
    }
}

/// All functions available to a single VM run, keyed by signature so
/// `Call` instructions can resolve their callee by [`Id`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Program {
    pub functions: Map<Id, Function>,
    pub entry: Id,
}

impl Program {
    pub fn get(&self, signature: Id) -> Option<&Function> {
        self.functions.get(&signature)
    }
}
