//! Block-structured graph IR
//!
//! A [`Graph`] owns arenas of nodes, blocks and values addressed by small
//! index handles. Nodes live in ordered blocks; structured nodes (`If`,
//! `Loop`, `Function`) own nested blocks. Every value has exactly one
//! definition site and keeps a list of its users so it can be replaced or
//! deleted safely.

pub mod builder;
pub mod dump;
pub mod graph;
pub mod interp;
pub mod nodes;
pub mod types;
pub mod validation;

pub use builder::*;
pub use graph::*;
pub use nodes::*;
pub use types::*;

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(u32);

        impl $name {
            pub fn new(id: u32) -> Self {
                Self(id)
            }

            pub fn index(self) -> usize {
                self.0 as usize
            }

            pub fn as_u32(self) -> u32 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

define_id!(
    /// Handle to a node in a [`Graph`]
    NodeId,
    "n"
);
define_id!(
    /// Handle to a value (node output or block parameter)
    ValueId,
    "%"
);
define_id!(
    /// Handle to a block
    BlockId,
    "block"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_display() {
        assert_eq!(NodeId::new(3).to_string(), "n3");
        assert_eq!(ValueId::new(7).to_string(), "%7");
        assert_eq!(BlockId::new(0).to_string(), "block0");
    }

    #[test]
    fn test_id_index() {
        assert_eq!(ValueId::new(42).index(), 42);
        assert!(NodeId::new(1) < NodeId::new(2));
    }
}
