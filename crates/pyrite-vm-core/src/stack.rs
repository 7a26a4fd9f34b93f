//! The shared operand stack.
//!
//! All frames execute on one contiguous [`ValueStack`]; each frame owns the
//! region above its base. The backing vector is allocated with a guard
//! region beyond the configured limit, so the overflow check can run
//! *after* a push without ever reallocating or writing out of bounds.

use crate::error::{VmError, VmResult};
use crate::value::Value;

/// Default limit in slots. Values are small, so this is a few hundred KiB.
pub const DEFAULT_STACK_LIMIT: usize = 16 * 1024;

/// Slack beyond the limit. A single instruction pushes at most a handful
/// of values, so overflow is always caught before the guard is exhausted.
const GUARD_SLOTS: usize = 64;

pub struct ValueStack {
    data: Vec<Value>,
    limit: usize,
}

impl ValueStack {
    pub fn new() -> ValueStack {
        ValueStack::with_limit(DEFAULT_STACK_LIMIT)
    }

    pub fn with_limit(limit: usize) -> ValueStack {
        ValueStack {
            data: Vec::with_capacity(limit + GUARD_SLOTS),
            limit,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Pushes `v`, failing once the configured limit is exceeded. The push
    /// itself always lands in the guard region, so the stack stays
    /// well-formed even on the failing call.
    #[inline]
    pub fn push(&mut self, v: Value) -> VmResult<()> {
        self.data.push(v);
        if self.data.len() > self.limit {
            return Err(VmError::StackOverflow);
        }
        Ok(())
    }

    /// Pops the top value. Compiled code is trusted to be stack-balanced,
    /// so an empty stack here is an engine bug.
    #[inline]
    pub fn pop(&mut self) -> Value {
        self.data.pop().expect("operand stack underflow")
    }

    #[inline]
    pub fn peek(&self) -> Value {
        *self.data.last().expect("operand stack underflow")
    }

    #[inline]
    pub fn peek_at(&self, depth: usize) -> Value {
        self.data[self.data.len() - 1 - depth]
    }

    #[inline]
    pub fn get(&self, idx: usize) -> Value {
        self.data[idx]
    }

    #[inline]
    pub fn set(&mut self, idx: usize, v: Value) {
        self.data[idx] = v;
    }

    /// Drops everything above `len`.
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    /// Removes and returns the values in `base..`, preserving order.
    pub fn drain_from(&mut self, base: usize) -> Vec<Value> {
        self.data.split_off(base)
    }

    pub fn extend(&mut self, values: &[Value]) -> VmResult<()> {
        for &v in values {
            self.push(v)?;
        }
        Ok(())
    }

    pub fn slice_from(&self, base: usize) -> &[Value] {
        &self.data[base..]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.data.iter()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}

impl Default for ValueStack {
    fn default() -> ValueStack {
        ValueStack::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_roundtrip() {
        let mut s = ValueStack::new();
        s.push(Value::Int(1)).unwrap();
        s.push(Value::Int(2)).unwrap();
        assert_eq!(s.peek(), Value::Int(2));
        assert_eq!(s.pop(), Value::Int(2));
        assert_eq!(s.pop(), Value::Int(1));
        assert!(s.is_empty());
    }

    #[test]
    fn test_overflow_reported_at_limit() {
        let mut s = ValueStack::with_limit(4);
        for i in 0..4 {
            s.push(Value::Int(i)).unwrap();
        }
        assert!(matches!(
            s.push(Value::Int(99)),
            Err(VmError::StackOverflow)
        ));
        // The failing push still landed in the guard region.
        assert_eq!(s.len(), 5);
        assert_eq!(s.peek(), Value::Int(99));
    }

    #[test]
    fn test_truncate_and_drain() {
        let mut s = ValueStack::new();
        for i in 0..6 {
            s.push(Value::Int(i)).unwrap();
        }
        let tail = s.drain_from(4);
        assert_eq!(tail, vec![Value::Int(4), Value::Int(5)]);
        s.truncate(2);
        assert_eq!(s.len(), 2);
        assert_eq!(s.peek(), Value::Int(1));
    }
}
