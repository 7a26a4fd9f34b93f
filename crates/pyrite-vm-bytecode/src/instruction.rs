//! Instruction encoding
//!
//! Every instruction is one opcode plus a single 16-bit operand. Call
//! instructions pack two counts into the operand (positional argc in
//! the low byte, keyword-pair count in the high byte).

use serde::{Deserialize, Serialize};

/// Operand value for instructions that take none.
pub const NO_ARG: u16 = 0;

/// Opcodes executed by the dispatch loop.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    /// No operation
    Nop,
    /// Push constant `arg` from the constants table
    LoadConst,
    /// Push `None`
    LoadNone,
    /// Push `True`
    LoadTrue,
    /// Push `False`
    LoadFalse,
    /// Push the operand reinterpreted as a signed 16-bit integer
    LoadSmallInt,
    /// Push the no-receiver marker used in call layouts
    PushNull,
    /// Duplicate the top of stack
    Dup,
    /// Pop and discard the top of stack
    Pop,

    /// Push local slot `arg`
    LoadLocal,
    /// Pop into local slot `arg`
    StoreLocal,
    /// Push the module/global binding named by constant `arg`
    LoadGlobal,
    /// Pop into the module/global binding named by constant `arg`
    StoreGlobal,

    /// Pop object, push its attribute named by constant `arg`
    LoadAttr,
    /// Pop value then object, set attribute named by constant `arg`
    StoreAttr,
    /// Pop object, push `[method_or_attr, self_or_null]` for the
    /// bound-method-free call fast path
    LoadMethod,

    /// Pop index then object, push `object[index]`
    LoadItem,
    /// Pop index, object, value; perform `object[index] = value`
    StoreItem,

    /// Pop `arg` values, push a list
    BuildList,
    /// Pop `arg` values, push a tuple
    BuildTuple,
    /// Pop `2 * arg` values (key/value pairs), push a dict
    BuildDict,

    /// Binary add (delegates to the type's `add` operator)
    Add,
    /// Binary subtract
    Sub,
    /// Binary multiply
    Mul,
    /// Binary true division
    Div,
    /// Binary floor division
    FloorDiv,
    /// Binary modulo
    Mod,
    /// Unary negation
    Neg,
    /// Unary boolean not
    Not,

    /// Equality comparison
    Eq,
    /// Inequality comparison
    Ne,
    /// Less-than comparison
    Lt,
    /// Less-or-equal comparison
    Le,
    /// Greater-than comparison
    Gt,
    /// Greater-or-equal comparison
    Ge,
    /// Identity comparison (`is`)
    Is,

    /// Unconditional jump to absolute offset `arg`
    Jump,
    /// Pop; jump to `arg` if falsy
    PopJumpIfFalse,
    /// Pop; jump to `arg` if truthy
    PopJumpIfTrue,

    /// Call: stack holds `[callable, self_or_null, args.., kw pairs..]`;
    /// operand packs argc (low byte) and kwarg-pair count (high byte)
    Call,
    /// Like `Call` but the callable/self pair was pushed by `LoadMethod`
    CallMethod,
    /// Create a function object from `FuncDecl` `arg`, bound to the
    /// current module
    MakeFunction,

    /// Pop iterable, push its iterator
    GetIter,
    /// Advance the iterator at TOS; push the next value, or on
    /// exhaustion pop the iterator, exit the loop block, and jump to
    /// absolute offset `arg`
    ForIter,
    /// Enter the loop block `arg` (records an unwind target)
    PushLoop,
    /// Break out of block `arg`: run exit semantics for every block
    /// between here and the target, jump to the target's end
    Break,
    /// Continue loop block `arg`: unwind inner blocks, jump to the
    /// target's start
    Continue,

    /// Enter try block `arg` (records an unwind target with the
    /// current operand depth)
    EnterTry,
    /// Leave try block `arg` without an exception
    ExitTry,
    /// Pop the active exception after a handler completes
    PopException,
    /// Pop a value and raise it as an exception
    Raise,
    /// Re-raise the current exception, preserving its traceback
    Reraise,

    /// Enter with block `arg`: TOS is the entered resource, kept on
    /// the stack for the block's duration
    EnterWith,
    /// Leave with block `arg`: pop the resource and call its exit hook
    ExitWith,

    /// Return TOS from the current frame
    Return,
    /// Suspend the current generator frame, yielding TOS
    Yield,

    /// Push the module registered under the name in constant `arg`
    ImportName,
}

/// One executable instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instr {
    /// The opcode
    pub op: Op,
    /// The 16-bit operand (meaning depends on the opcode)
    pub arg: u16,
}

impl Instr {
    /// Create an instruction.
    #[inline]
    pub const fn new(op: Op, arg: u16) -> Self {
        Self { op, arg }
    }

    /// Operand reinterpreted as a signed 16-bit value (`LoadSmallInt`).
    #[inline]
    pub fn arg_i16(&self) -> i16 {
        self.arg as i16
    }

    /// Positional argument count for call instructions (low byte).
    #[inline]
    pub fn argc(&self) -> usize {
        (self.arg & 0xFF) as usize
    }

    /// Keyword-pair count for call instructions (high byte).
    #[inline]
    pub fn kwargc(&self) -> usize {
        (self.arg >> 8) as usize
    }
}

/// Pack positional and keyword counts into a call operand.
pub fn pack_call(argc: u8, kwargc: u8) -> u16 {
    ((kwargc as u16) << 8) | argc as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_packing() {
        let instr = Instr::new(Op::Call, pack_call(3, 2));
        assert_eq!(instr.argc(), 3);
        assert_eq!(instr.kwargc(), 2);
    }

    #[test]
    fn test_small_int_operand() {
        let instr = Instr::new(Op::LoadSmallInt, (-7i16) as u16);
        assert_eq!(instr.arg_i16(), -7);
    }
}
