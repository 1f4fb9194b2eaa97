//! Interned task tags.
//!
//! A tag names a class of tasks. Dependencies and cancellation are resolved by
//! tag, so the scheduler compares tags constantly; interning turns every
//! comparison and hash into a `u32` operation.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexSet;
use once_cell::sync::Lazy;
use parking_lot::RwLock;

/// Process-wide tag table. Index 0 is always the empty tag.
static INTERNER: Lazy<RwLock<IndexSet<Arc<str>>>> = Lazy::new(|| {
    let mut set = IndexSet::new();
    set.insert(Arc::from(""));
    RwLock::new(set)
});

/// Interned task tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(u32);

impl Tag {
    /// The empty tag. Submitting a task with it is rejected.
    pub const EMPTY: Tag = Tag(0);

    /// Intern `name`, returning the same `Tag` for equal strings.
    pub fn new(name: &str) -> Self {
        if let Some(index) = INTERNER.read().get_index_of(name) {
            return Tag(index as u32);
        }
        let (index, _) = INTERNER.write().insert_full(Arc::from(name));
        Tag(index as u32)
    }

    /// Look up an already interned tag without inserting.
    pub fn lookup(name: &str) -> Option<Self> {
        INTERNER
            .read()
            .get_index_of(name)
            .map(|index| Tag(index as u32))
    }

    /// Get the tag's string.
    pub fn name(&self) -> Arc<str> {
        INTERNER
            .read()
            .get_index(self.0 as usize)
            .cloned()
            .unwrap_or_else(|| Arc::from(""))
    }

    /// Whether this is the empty tag.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Raw interned index.
    #[inline]
    pub fn index(&self) -> u32 {
        self.0
    }
}

impl Default for Tag {
    fn default() -> Self {
        Tag::EMPTY
    }
}

impl fmt::Display for Tag {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl From<&str> for Tag {
    fn from(name: &str) -> Self {
        Tag::new(name)
    }
}

impl From<&String> for Tag {
    fn from(name: &String) -> Self {
        Tag::new(name)
    }
}

impl From<String> for Tag {
    fn from(name: String) -> Self {
        Tag::new(&name)
    }
}
