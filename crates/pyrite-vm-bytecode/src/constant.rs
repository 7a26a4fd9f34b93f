//! Compile-time constants

use serde::{Deserialize, Serialize};

/// A constant embedded in a code unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    /// The `None` singleton
    None,
    /// A boolean literal
    Bool(bool),
    /// An integer literal
    Int(i64),
    /// A float literal
    Float(f64),
    /// A string literal (also used for attribute/global names)
    Str(String),
}

impl Constant {
    /// Get the string payload, if this is a string constant.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Get the integer payload, if this is an integer constant.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }
}

impl From<&str> for Constant {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<i64> for Constant {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<f64> for Constant {
    fn from(n: f64) -> Self {
        Self::Float(n)
    }
}
