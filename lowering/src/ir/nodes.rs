//! IR Node Kinds
//!
//! The closed set of node kinds the lowering pipeline understands. Passes
//! match on [`NodeKind`] exhaustively; ordinary computations are grouped
//! under [`NodeKind::Op`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Literal carried by a constant node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    None,
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Bool(b) => write!(f, "{}", b),
            Literal::Int(i) => write!(f, "{}", i),
            Literal::Float(x) => write!(f, "{:?}", x),
            Literal::Str(s) => write!(f, "{:?}", s),
            Literal::None => write!(f, "None"),
        }
    }
}

/// Ordinary (non-structured) operators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operator {
    Constant(Literal),
    /// Placeholder for a value on a path that never observes it
    Uninitialized,

    Not,
    Neg,

    Add,
    Sub,
    Mul,
    Div,
    Rem,

    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,

    And,
    Or,

    /// Call to an opaque, possibly side-effecting host function
    Call(String),
    /// Call a closure value; input 0 is the closure
    Apply,
}

impl Operator {
    pub fn mnemonic(&self) -> String {
        match self {
            Operator::Constant(lit) => format!("constant[value={}]", lit),
            Operator::Uninitialized => "uninitialized".to_string(),
            Operator::Not => "not".to_string(),
            Operator::Neg => "neg".to_string(),
            Operator::Add => "add".to_string(),
            Operator::Sub => "sub".to_string(),
            Operator::Mul => "mul".to_string(),
            Operator::Div => "div".to_string(),
            Operator::Rem => "rem".to_string(),
            Operator::Eq => "eq".to_string(),
            Operator::Ne => "ne".to_string(),
            Operator::Lt => "lt".to_string(),
            Operator::Le => "le".to_string(),
            Operator::Gt => "gt".to_string(),
            Operator::Ge => "ge".to_string(),
            Operator::And => "and".to_string(),
            Operator::Or => "or".to_string(),
            Operator::Call(name) => format!("call[{}]", name),
            Operator::Apply => "apply".to_string(),
        }
    }
}

/// Kind of a graph node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    Op(Operator),

    /// Inputs `[cond]`, blocks `[then, else]`
    If,

    /// Inputs `[max_trip_count, initial_condition, carried...]`.
    ///
    /// Blocks are `[body]` once the header is inlined, or `[body, condition]`
    /// as produced by a frontend. Body parameters are `[iteration,
    /// carried...]`. An inlined body outputs `[continue_condition,
    /// carried...]`; a non-inlined body outputs `[carried...]` and the
    /// condition block outputs a single `Bool`.
    Loop,

    /// A closure; one block whose parameters are the closure parameters and
    /// whose outputs are the returned values
    Function,

    /// Read the current binding of a named variable
    Load(String),
    /// Rebind a named variable to the node's only input
    Store(String),

    /// Inputs are the loop-carried values at the point of the `break`
    Break,
    /// Inputs `[continue_condition, carried...]`
    Continue,
    /// Inputs are the returned values
    Return,
}

impl NodeKind {
    /// Whether this node is a non-local exit statement
    pub fn is_exit(&self) -> bool {
        matches!(self, NodeKind::Break | NodeKind::Continue | NodeKind::Return)
    }

    pub fn is_scope_op(&self) -> bool {
        matches!(self, NodeKind::Load(_) | NodeKind::Store(_))
    }

    pub fn name(&self) -> String {
        match self {
            NodeKind::Op(op) => op.mnemonic(),
            NodeKind::If => "If".to_string(),
            NodeKind::Loop => "Loop".to_string(),
            NodeKind::Function => "Function".to_string(),
            NodeKind::Load(name) => format!("Load[name=\"{}\"]", name),
            NodeKind::Store(name) => format!("Store[name=\"{}\"]", name),
            NodeKind::Break => "BreakStmt".to_string(),
            NodeKind::Continue => "ContinueStmt".to_string(),
            NodeKind::Return => "ReturnStmt".to_string(),
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_kinds() {
        assert!(NodeKind::Break.is_exit());
        assert!(NodeKind::Return.is_exit());
        assert!(!NodeKind::If.is_exit());
        assert!(NodeKind::Load("x".into()).is_scope_op());
    }

    #[test]
    fn test_names() {
        assert_eq!(NodeKind::Op(Operator::Constant(Literal::Int(3))).name(), "constant[value=3]");
        assert_eq!(NodeKind::Store("a".into()).to_string(), "Store[name=\"a\"]");
    }
}
