//! Call frames.
//!
//! A [`Frame`] records everything needed to execute one activation of a
//! code unit: the unit itself, the instruction pointer, where the frame's
//! stack region begins, and the stack of active unwind targets for blocks
//! entered but not yet exited. Frames live in a slab pool owned by the VM
//! so call-heavy code reuses the same slots; a generator's frame is moved
//! out of the pool while suspended.

use std::sync::Arc;

use pyrite_vm_bytecode::CodeUnit;
use smallvec::SmallVec;

use crate::value::Value;

/// One entry of a frame's unwind stack: the block that was entered and
/// the operand depth (relative to the frame's operand base) to restore
/// when leaving it early.
#[derive(Debug, Clone, Copy)]
pub struct UnwindTarget {
    pub block: u16,
    pub depth: usize,
}

pub struct Frame {
    pub code: Arc<CodeUnit>,
    /// The function value being executed, if any; module frames have none.
    pub callable: Option<Value>,
    /// Module object whose namespace resolves this frame's globals.
    pub module: Value,
    pub ip: usize,
    /// Absolute stack index where this frame's locals begin. Stored
    /// depths elsewhere in the frame are relative so a suspended frame
    /// can be re-attached at a different base.
    pub base: usize,
    pub unwind: SmallVec<[UnwindTarget; 4]>,
}

impl Frame {
    pub fn new(code: Arc<CodeUnit>, callable: Option<Value>, module: Value, base: usize) -> Frame {
        Frame {
            code,
            callable,
            module,
            ip: 0,
            base,
            unwind: SmallVec::new(),
        }
    }

    /// Absolute index of the first operand slot, just past the locals.
    #[inline]
    pub fn operand_base(&self) -> usize {
        self.base + self.code.local_count()
    }

    #[inline]
    pub fn local_slot(&self, idx: usize) -> usize {
        self.base + idx
    }

    /// Source line of the most recently executed instruction.
    pub fn current_line(&self) -> u32 {
        self.code.line_of(self.ip.saturating_sub(1))
    }

    /// Display name for tracebacks: the function name, or `<module>` for
    /// a module frame.
    pub fn func_name(&self) -> String {
        if self.callable.is_some() {
            self.code.name.clone()
        } else {
            "<module>".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pyrite_vm_bytecode::{CodeUnitBuilder, Op};

    #[test]
    fn test_operand_base_skips_locals() {
        let mut b = CodeUnitBuilder::new("f", "test.py");
        b.add_name("a");
        b.add_name("b");
        b.emit(Op::LoadLocal, 0);
        b.emit(Op::Return, 0);
        let unit = Arc::new(b.build());
        let frame = Frame::new(unit, None, Value::None, 10);
        assert_eq!(frame.local_slot(1), 11);
        assert_eq!(frame.operand_base(), 10 + frame.code.local_count());
    }
}
