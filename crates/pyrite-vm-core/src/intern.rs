//! Process-wide name interning.
//!
//! Attribute, global, and parameter names are interned once into a global
//! table and referred to by a small integer id afterwards. All name
//! comparisons inside the VM are integer comparisons; the string itself is
//! only consulted when formatting output or error messages.

use std::fmt;
use std::sync::{Arc, LazyLock};

use dashmap::DashMap;
use parking_lot::RwLock;

/// An interned identifier. Two `Name`s are equal iff their spellings are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Name(u32);

struct Interner {
    ids: DashMap<Arc<str>, u32>,
    spellings: RwLock<Vec<Arc<str>>>,
}

static INTERNER: LazyLock<Interner> = LazyLock::new(|| Interner {
    ids: DashMap::new(),
    spellings: RwLock::new(Vec::new()),
});

impl Name {
    /// Interns `s`, returning the id shared by every equal spelling.
    pub fn intern(s: &str) -> Name {
        let interner = &*INTERNER;
        if let Some(id) = interner.ids.get(s) {
            return Name(*id);
        }
        let mut spellings = interner.spellings.write();
        // Re-check under the write lock in case another thread won the race.
        if let Some(id) = interner.ids.get(s) {
            return Name(*id);
        }
        let arc: Arc<str> = Arc::from(s);
        let id = spellings.len() as u32;
        spellings.push(Arc::clone(&arc));
        interner.ids.insert(arc, id);
        Name(id)
    }

    /// Returns the spelling this id was interned from.
    pub fn as_str(&self) -> Arc<str> {
        Arc::clone(&INTERNER.spellings.read()[self.0 as usize])
    }

    /// Raw id, usable directly as a hash.
    pub fn id(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_dedupes() {
        let a = Name::intern("value");
        let b = Name::intern("value");
        let c = Name::intern("other");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(&*a.as_str(), "value");
    }

    #[test]
    fn test_display_uses_spelling() {
        let n = Name::intern("append");
        assert_eq!(n.to_string(), "append");
    }
}
