//! Scope environment
//!
//! A stack of name → binding frames, one per lexical block being visited.
//! Inner frames shadow outer ones; lookups walk outward. The payload is
//! generic so the same stack serves type tracking and SSA value binding.

use crate::error::{LoweringError, Result};
use crate::ir::BlockId;
use indexmap::IndexMap;

/// Bindings introduced while visiting one block
#[derive(Debug, Clone)]
pub struct Frame<T> {
    pub block: BlockId,
    /// In first-definition order
    pub bindings: IndexMap<String, T>,
}

impl<T> Frame<T> {
    pub fn new(block: BlockId) -> Self {
        Self {
            block,
            bindings: IndexMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&T> {
        self.bindings.get(name)
    }

    /// Names bound in this frame, in first-definition order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.bindings.keys().map(|k| k.as_str())
    }
}

/// Scope stack for variable bindings
#[derive(Debug, Clone)]
pub struct ScopeStack<T> {
    frames: Vec<Frame<T>>,
}

impl<T> Default for ScopeStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ScopeStack<T> {
    pub fn new() -> Self {
        Self { frames: Vec::new() }
    }

    /// Push a frame for `block`
    pub fn push(&mut self, block: BlockId) {
        self.frames.push(Frame::new(block));
    }

    /// Pop the innermost frame
    pub fn pop(&mut self) -> Option<Frame<T>> {
        self.frames.pop()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Bind `name` in the innermost frame.
    ///
    /// # Panics
    /// If no frame has been pushed.
    pub fn bind(&mut self, name: &str, value: T) {
        let frame = self.frames.last_mut().expect("bind called with no open scope");
        // Rebinding keeps the original position so frame order reflects first definition.
        if let Some(slot) = frame.bindings.get_mut(name) {
            *slot = value;
        } else {
            frame.bindings.insert(name.to_string(), value);
        }
    }

    /// Look `name` up in the innermost frame only
    pub fn lookup_local(&self, name: &str) -> Option<&T> {
        self.frames.last().and_then(|f| f.get(name))
    }

    /// Look `name` up from the innermost frame outward
    pub fn find(&self, name: &str) -> Option<&T> {
        self.frames.iter().rev().find_map(|f| f.get(name))
    }

    /// Like [`ScopeStack::find`], but a missing binding is an error
    pub fn lookup_outer(&self, name: &str) -> Result<&T> {
        self.find(name).ok_or_else(|| LoweringError::UnresolvedVariable {
            name: name.to_string(),
        })
    }
}
