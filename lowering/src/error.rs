//! Lowering errors
//!
//! Every error here is an internal invariant violation: a well-formed input
//! graph never produces one. Lowering of the affected graph is abandoned.

use crate::ir::{BlockId, NodeId, ValueId};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LoweringError>;

#[derive(Debug, Error)]
pub enum LoweringError {
    #[error("variable `{name}` is not bound in any enclosing scope")]
    UnresolvedVariable { name: String },

    #[error("cannot unify types of `{name}`: {left} and {right}")]
    UnificationFailed {
        name: String,
        left: String,
        right: String,
    },

    #[error("exit target {block} does not exit on every path")]
    TargetNotExited { block: BlockId },

    #[error("{context}: expected {expected} values, found {found}")]
    ArityMismatch {
        context: String,
        expected: usize,
        found: usize,
    },

    #[error("{kind} at {node} has no enclosing target")]
    ExitWithoutTarget { node: NodeId, kind: String },

    #[error("cannot destroy {node}: output {value} still has {uses} use(s)")]
    DanglingUse {
        node: NodeId,
        value: ValueId,
        uses: usize,
    },

    #[error("loop {node} still has a separate condition block")]
    LoopNotInlined { node: NodeId },

    #[error("malformed {node}: {reason}")]
    MalformedNode { node: NodeId, reason: String },

    #[error("verification failed after `{pass}`: {}", .errors.join("; "))]
    VerificationFailed { pass: String, errors: Vec<String> },

    #[error("invalid pipeline configuration: {0}")]
    Config(#[from] toml::de::Error),
}

impl LoweringError {
    pub fn malformed(node: NodeId, reason: impl Into<String>) -> Self {
        LoweringError::MalformedNode {
            node,
            reason: reason.into(),
        }
    }

    pub fn arity(context: impl Into<String>, expected: usize, found: usize) -> Self {
        LoweringError::ArityMismatch {
            context: context.into(),
            expected,
            found,
        }
    }
}
