//! Generator objects.
//!
//! A generator owns its frame while suspended: on yield the frame is
//! detached from the VM's frame pool and its stack span (locals plus
//! operands) is copied into the object, so nothing of the generator
//! remains on the shared operand stack between resumes. Resuming pushes
//! the span back and re-attaches the frame at whatever base the stack
//! currently has; all depths inside the frame are relative to its base,
//! so the move is transparent.

use pyrite_vm_gc::Handle;

use crate::frame::Frame;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenState {
    /// Never resumed; the frame holds bound locals but has not run.
    Created,
    /// Parked at a yield.
    Suspended,
    /// Currently executing; re-entry from inside the body is an error.
    Running,
    /// Returned or raised; the retained frame has been dropped.
    Exhausted,
}

/// Outcome of one resume step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResumeResult {
    /// The body reached a yield; carries the yielded value.
    Yielded(Value),
    /// The body returned; carries the return value.
    Done(Value),
}

pub struct GeneratorObj {
    pub state: GenState,
    /// The detached frame, present until exhaustion.
    pub frame: Option<Box<Frame>>,
    /// The frame's saved stack span: locals followed by operands.
    pub saved_stack: Vec<Value>,
}

impl GeneratorObj {
    pub fn new(frame: Frame, locals: Vec<Value>) -> GeneratorObj {
        GeneratorObj {
            state: GenState::Created,
            frame: Some(Box::new(frame)),
            saved_stack: locals,
        }
    }

    /// Drops the retained frame and saved span; called when the body
    /// returns, raises, or the generator is abandoned.
    pub fn exhaust(&mut self) {
        self.state = GenState::Exhausted;
        self.frame = None;
        self.saved_stack.clear();
        self.saved_stack.shrink_to_fit();
    }

    pub fn trace(&self, mark: &mut dyn FnMut(Handle)) {
        for v in &self.saved_stack {
            v.trace(mark);
        }
        if let Some(frame) = &self.frame {
            frame.module.trace(mark);
            if let Some(callable) = frame.callable {
                callable.trace(mark);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pyrite_vm_bytecode::CodeUnitBuilder;
    use std::sync::Arc;

    #[test]
    fn test_exhaust_releases_frame_and_span() {
        let unit = Arc::new(CodeUnitBuilder::new("gen", "<test>").build());
        let frame = Frame::new(unit, None, Value::None, 0);
        let mut generator = GeneratorObj::new(frame, vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(generator.state, GenState::Created);
        generator.exhaust();
        assert!(generator.frame.is_none());
        assert!(generator.saved_stack.is_empty());
        assert_eq!(generator.state, GenState::Exhausted);
    }
}
