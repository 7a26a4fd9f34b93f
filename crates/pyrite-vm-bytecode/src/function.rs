//! Function declaration records
//!
//! A [`FuncDecl`] describes everything the engine needs to bind a
//! call's arguments to the callee's local slots: required positional
//! parameters, keyword defaults for the trailing parameters, optional
//! variadic positional/keyword slots, and whether the body contains a
//! yield (which reclassifies the function as a generator).

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::code::CodeUnit;
use crate::constant::Constant;

/// A nested function declaration inside a code unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuncDecl {
    /// Function name (`<lambda>` for anonymous)
    pub name: String,
    /// The compiled body
    pub code: Arc<CodeUnit>,
    /// Parameter names, in declaration order. These occupy the first
    /// local slots of the body.
    pub params: Vec<String>,
    /// Defaults for the trailing parameters. `defaults[i]` belongs to
    /// `params[params.len() - defaults.len() + i]`.
    pub defaults: Vec<Constant>,
    /// Local slot collecting excess positional arguments (`*args`),
    /// placed immediately after the declared parameters
    pub has_star_args: bool,
    /// Local slot collecting excess keyword arguments (`**kwargs`),
    /// placed after the `*args` slot if both are present
    pub has_star_kwargs: bool,
    /// Whether the body contains a yield
    pub is_generator: bool,
}

impl FuncDecl {
    /// Create a declaration with no defaults or variadic slots.
    pub fn new(name: impl Into<String>, code: CodeUnit, params: Vec<String>) -> Self {
        Self {
            name: name.into(),
            code: Arc::new(code),
            params,
            defaults: Vec::new(),
            has_star_args: false,
            has_star_kwargs: false,
            is_generator: false,
        }
    }

    /// Set keyword defaults for the trailing parameters.
    pub fn with_defaults(mut self, defaults: Vec<Constant>) -> Self {
        self.defaults = defaults;
        self
    }

    /// Declare a variadic positional slot.
    pub fn with_star_args(mut self) -> Self {
        self.has_star_args = true;
        self
    }

    /// Declare a variadic keyword slot.
    pub fn with_star_kwargs(mut self) -> Self {
        self.has_star_kwargs = true;
        self
    }

    /// Mark the body as a generator.
    pub fn generator(mut self) -> Self {
        self.is_generator = true;
        self
    }

    /// Number of required positional parameters (no default).
    #[inline]
    pub fn required_count(&self) -> usize {
        self.params.len() - self.defaults.len()
    }

    /// A "simple" function has no defaults, no variadic slots, and is
    /// not a generator; calls to it skip the general binding path.
    #[inline]
    pub fn is_simple(&self) -> bool {
        self.defaults.is_empty()
            && !self.has_star_args
            && !self.has_star_kwargs
            && !self.is_generator
    }

    /// Index of the `*args` local slot, if declared.
    #[inline]
    pub fn star_args_slot(&self) -> Option<usize> {
        self.has_star_args.then_some(self.params.len())
    }

    /// Index of the `**kwargs` local slot, if declared.
    #[inline]
    pub fn star_kwargs_slot(&self) -> Option<usize> {
        self.has_star_kwargs
            .then_some(self.params.len() + self.has_star_args as usize)
    }
}
