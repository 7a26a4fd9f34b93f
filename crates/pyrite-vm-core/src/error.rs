//! Error taxonomy for the execution engine.
//!
//! Guest-level exceptions travel as [`VmError::Exception`] and can be
//! intercepted by try blocks in guest code. The remaining variants are
//! engine faults: they unwind every frame unconditionally and leave the VM
//! reset, never handled by guest code.

use thiserror::Error;

pub type VmResult<T> = Result<T, VmError>;

/// One frame of a guest traceback, innermost last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntry {
    pub source: String,
    pub func: String,
    pub line: u32,
}

/// A guest exception in flight: its type name, message, and the frames it
/// has unwound through so far.
#[derive(Debug, Clone)]
pub struct PyException {
    pub type_name: String,
    pub message: String,
    pub trace: Vec<TraceEntry>,
}

impl PyException {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> PyException {
        PyException {
            type_name: type_name.into(),
            message: message.into(),
            trace: Vec::new(),
        }
    }

    /// Renders the exception the way an uncaught one is reported: header
    /// line, one `File` line per frame outermost first, then the type and
    /// message.
    pub fn format_traceback(&self) -> String {
        let mut out = String::from("Traceback (most recent call last):\n");
        for entry in self.trace.iter().rev() {
            out.push_str(&format!(
                "  File \"{}\", line {}, in {}\n",
                entry.source, entry.line, entry.func
            ));
        }
        if self.message.is_empty() {
            out.push_str(&self.type_name);
        } else {
            out.push_str(&format!("{}: {}", self.type_name, self.message));
        }
        out
    }
}

impl std::fmt::Display for PyException {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            f.write_str(&self.type_name)
        } else {
            write!(f, "{}: {}", self.type_name, self.message)
        }
    }
}

#[derive(Debug, Error)]
pub enum VmError {
    /// A guest exception; catchable by try blocks.
    #[error("{0}")]
    Exception(Box<PyException>),

    /// The operand stack hit its configured limit.
    #[error("operand stack overflow")]
    StackOverflow,

    /// Too many nested guest calls.
    #[error("maximum call depth exceeded")]
    RecursionLimit,

    /// Execution was cancelled via the interrupt flag.
    #[error("execution interrupted")]
    Interrupted,

    /// Invariant violation inside the engine itself.
    #[error("internal error: {0}")]
    Internal(String),
}

impl VmError {
    pub fn exception(type_name: &str, message: impl Into<String>) -> VmError {
        VmError::Exception(Box::new(PyException::new(type_name, message)))
    }

    pub fn type_error(message: impl Into<String>) -> VmError {
        VmError::exception("TypeError", message)
    }

    pub fn value_error(message: impl Into<String>) -> VmError {
        VmError::exception("ValueError", message)
    }

    pub fn name_error(message: impl Into<String>) -> VmError {
        VmError::exception("NameError", message)
    }

    pub fn attribute_error(message: impl Into<String>) -> VmError {
        VmError::exception("AttributeError", message)
    }

    pub fn index_error(message: impl Into<String>) -> VmError {
        VmError::exception("IndexError", message)
    }

    pub fn key_error(message: impl Into<String>) -> VmError {
        VmError::exception("KeyError", message)
    }

    pub fn import_error(message: impl Into<String>) -> VmError {
        VmError::exception("ImportError", message)
    }

    pub fn zero_division(message: impl Into<String>) -> VmError {
        VmError::exception("ZeroDivisionError", message)
    }

    pub fn stop_iteration() -> VmError {
        VmError::exception("StopIteration", "")
    }

    /// True for faults that must unwind every frame regardless of guest
    /// handlers.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, VmError::Exception(_))
    }

    pub fn is_stop_iteration(&self) -> bool {
        matches!(self, VmError::Exception(e) if e.type_name == "StopIteration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_traceback_orders_innermost_last() {
        let mut exc = PyException::new("ValueError", "bad input");
        exc.trace.push(TraceEntry {
            source: "demo.py".into(),
            func: "inner".into(),
            line: 12,
        });
        exc.trace.push(TraceEntry {
            source: "demo.py".into(),
            func: "<module>".into(),
            line: 3,
        });
        let text = exc.format_traceback();
        let inner_at = text.find("in inner").unwrap();
        let module_at = text.find("in <module>").unwrap();
        assert!(module_at < inner_at);
        assert!(text.ends_with("ValueError: bad input"));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(VmError::StackOverflow.is_fatal());
        assert!(VmError::RecursionLimit.is_fatal());
        assert!(!VmError::type_error("nope").is_fatal());
        assert!(VmError::stop_iteration().is_stop_iteration());
    }
}
