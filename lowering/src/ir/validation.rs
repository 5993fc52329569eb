//! Graph Validation
//!
//! Structural checks run between passes. The verifier checks use-list
//! consistency, operand visibility (a value is only usable in the block that
//! defines it, after its definition, or in blocks nested there), the arity
//! contracts of `If`, `Loop` and `Function`, and stage-dependent rules about
//! which node kinds may still appear.

use super::{BlockId, Graph, NodeId, NodeKind, Type, User, ValueId};
use fxhash::{FxHashMap, FxHashSet};
use std::fmt;

/// Which constructs are allowed at the current pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyOptions {
    /// `Load` / `Store` may appear
    pub allow_scope_ops: bool,
    /// `BreakStmt` / `ContinueStmt` may appear
    pub allow_loop_exits: bool,
    /// `ReturnStmt` may appear
    pub allow_returns: bool,
    /// Every loop must have had its condition block inlined
    pub require_inlined_loops: bool,
}

impl VerifyOptions {
    /// Anything a frontend may emit
    pub fn frontend() -> Self {
        Self {
            allow_scope_ops: true,
            allow_loop_exits: true,
            allow_returns: true,
            require_inlined_loops: false,
        }
    }

    /// Fully lowered SSA form
    pub fn lowered() -> Self {
        Self {
            allow_scope_ops: false,
            allow_loop_exits: false,
            allow_returns: false,
            require_inlined_loops: true,
        }
    }
}

/// Validation error
#[derive(Debug, Clone, PartialEq)]
pub struct VerifyError {
    pub kind: VerifyErrorKind,
    pub node: Option<NodeId>,
}

/// Types of validation errors
#[derive(Debug, Clone, PartialEq)]
pub enum VerifyErrorKind {
    /// Operand refers to a destroyed value
    DeadOperand { value: ValueId },

    /// Operand is not visible at its use
    NotVisible { value: ValueId },

    /// A value's use list disagrees with the graph
    UseListMismatch { value: ValueId, recorded: usize, actual: usize },

    /// Wrong number of blocks, inputs or outputs
    BadArity { what: &'static str, expected: usize, found: usize },

    /// A condition or trip count of the wrong type
    BadType { what: &'static str, expected: Type, found: Type },

    /// A node kind that must be gone at this stage
    Forbidden { kind: String },

    /// A loop with a separate condition block
    LoopNotInlined,
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(node) = self.node {
            write!(f, "{}: ", node)?;
        }
        match &self.kind {
            VerifyErrorKind::DeadOperand { value } => write!(f, "operand {} is dead", value),
            VerifyErrorKind::NotVisible { value } => write!(f, "operand {} is not visible here", value),
            VerifyErrorKind::UseListMismatch { value, recorded, actual } => write!(
                f,
                "use list of {} records {} uses, graph has {}",
                value, recorded, actual
            ),
            VerifyErrorKind::BadArity { what, expected, found } => {
                write!(f, "{}: expected {}, found {}", what, expected, found)
            }
            VerifyErrorKind::BadType { what, expected, found } => {
                write!(f, "{} must be {}, found {}", what, expected, found)
            }
            VerifyErrorKind::Forbidden { kind } => write!(f, "{} is not allowed at this stage", kind),
            VerifyErrorKind::LoopNotInlined => write!(f, "loop condition block is not inlined"),
        }
    }
}

/// Validation context
struct Verifier<'a> {
    graph: &'a Graph,
    options: VerifyOptions,
    visible: FxHashSet<ValueId>,
    actual_uses: FxHashMap<(ValueId, User), usize>,
    errors: Vec<VerifyError>,
}

/// Verify `graph`, returning every problem found.
pub fn verify(graph: &Graph, options: VerifyOptions) -> Vec<VerifyError> {
    let mut verifier = Verifier {
        graph,
        options,
        visible: FxHashSet::default(),
        actual_uses: FxHashMap::default(),
        errors: Vec::new(),
    };
    verifier.check_block(graph.root());
    verifier.check_use_lists();
    verifier.errors
}

impl<'a> Verifier<'a> {
    fn error(&mut self, node: Option<NodeId>, kind: VerifyErrorKind) {
        self.errors.push(VerifyError { kind, node });
    }

    fn check_operand(&mut self, node: Option<NodeId>, value: ValueId, user: User) {
        *self.actual_uses.entry((value, user)).or_insert(0) += 1;
        if !self.graph.value(value).live {
            self.error(node, VerifyErrorKind::DeadOperand { value });
        } else if !self.visible.contains(&value) {
            self.error(node, VerifyErrorKind::NotVisible { value });
        }
    }

    fn check_block(&mut self, block: BlockId) {
        let data = self.graph.block(block);
        let mut defined: Vec<ValueId> = data.params.clone();
        self.visible.extend(data.params.iter().copied());

        for &node in &data.nodes {
            self.check_node(node);
            let outputs = &self.graph.node(node).outputs;
            defined.extend(outputs.iter().copied());
            self.visible.extend(outputs.iter().copied());
        }
        for &output in &data.outputs {
            self.check_operand(self.graph.owning_node(block), output, User::Block(block));
        }

        for value in defined {
            self.visible.remove(&value);
        }
    }

    fn check_node(&mut self, node: NodeId) {
        let data = self.graph.node(node);
        for &input in &data.inputs {
            self.check_operand(Some(node), input, User::Node(node));
        }

        match &data.kind {
            NodeKind::If => self.check_if(node),
            NodeKind::Loop => self.check_loop(node),
            NodeKind::Function => {
                self.expect_arity(node, "function blocks", 1, data.blocks.len());
                self.expect_arity(node, "function outputs", 1, data.outputs.len());
            }
            NodeKind::Load(_) | NodeKind::Store(_) if !self.options.allow_scope_ops => {
                self.error(Some(node), VerifyErrorKind::Forbidden { kind: data.kind.name() });
            }
            NodeKind::Break | NodeKind::Continue if !self.options.allow_loop_exits => {
                self.error(Some(node), VerifyErrorKind::Forbidden { kind: data.kind.name() });
            }
            NodeKind::Return if !self.options.allow_returns => {
                self.error(Some(node), VerifyErrorKind::Forbidden { kind: data.kind.name() });
            }
            _ => {}
        }

        for &block in &data.blocks {
            self.check_block(block);
        }
    }

    fn expect_arity(&mut self, node: NodeId, what: &'static str, expected: usize, found: usize) {
        if expected != found {
            self.error(Some(node), VerifyErrorKind::BadArity { what, expected, found });
        }
    }

    fn expect_bool(&mut self, node: NodeId, what: &'static str, value: ValueId) {
        let ty = self.graph.value_type(value);
        if *ty != Type::Bool {
            self.error(
                Some(node),
                VerifyErrorKind::BadType {
                    what,
                    expected: Type::Bool,
                    found: ty.clone(),
                },
            );
        }
    }

    fn check_if(&mut self, node: NodeId) {
        let data = self.graph.node(node);
        self.expect_arity(node, "if inputs", 1, data.inputs.len());
        if data.inputs.len() == 1 {
            self.expect_bool(node, "if condition", data.inputs[0]);
        }
        self.expect_arity(node, "if blocks", 2, data.blocks.len());
        for &block in &data.blocks {
            let outputs = self.graph.block(block).outputs.len();
            self.expect_arity(node, "if branch outputs", data.outputs.len(), outputs);
        }
    }

    fn check_loop(&mut self, node: NodeId) {
        let data = self.graph.node(node);
        let carried = data.outputs.len();
        self.expect_arity(node, "loop inputs", carried + 2, data.inputs.len());
        if data.inputs.len() >= 2 {
            self.expect_bool(node, "loop condition", data.inputs[1]);
        }

        match data.blocks.len() {
            1 => {
                let body = self.graph.block(data.blocks[0]);
                self.expect_arity(node, "loop body params", carried + 1, body.params.len());
                self.expect_arity(node, "loop body outputs", carried + 1, body.outputs.len());
                if let Some(&cond) = body.outputs.first() {
                    self.expect_bool(node, "loop continuation condition", cond);
                }
            }
            2 => {
                if self.options.require_inlined_loops {
                    self.error(Some(node), VerifyErrorKind::LoopNotInlined);
                }
                let body = self.graph.block(data.blocks[0]);
                self.expect_arity(node, "loop body params", carried + 1, body.params.len());
                self.expect_arity(node, "loop body outputs", carried, body.outputs.len());
                let header = self.graph.block(data.blocks[1]);
                self.expect_arity(node, "loop condition outputs", 1, header.outputs.len());
            }
            found => self.expect_arity(node, "loop blocks", 1, found),
        }
    }

    fn check_use_lists(&mut self) {
        let mut recorded: FxHashMap<(ValueId, User), usize> = FxHashMap::default();
        let mut values: FxHashSet<ValueId> = FxHashSet::default();
        for node in self.graph.walk_nodes() {
            let data = self.graph.node(node);
            values.extend(data.inputs.iter().copied());
            values.extend(data.outputs.iter().copied());
            for &block in &data.blocks {
                values.extend(self.graph.block(block).params.iter().copied());
                values.extend(self.graph.block(block).outputs.iter().copied());
            }
        }
        values.extend(self.graph.inputs().iter().copied());
        values.extend(self.graph.outputs().iter().copied());

        for &value in &values {
            for &user in &self.graph.value(value).uses {
                *recorded.entry((value, user)).or_insert(0) += 1;
            }
        }

        let mut keys: Vec<(ValueId, User)> = recorded
            .keys()
            .chain(self.actual_uses.keys())
            .copied()
            .collect::<FxHashSet<_>>()
            .into_iter()
            .collect();
        keys.sort_by_key(|(value, _)| *value);

        for key in keys {
            let r = recorded.get(&key).copied().unwrap_or(0);
            let a = self.actual_uses.get(&key).copied().unwrap_or(0);
            if r != a {
                let node = match key.1 {
                    User::Node(n) => Some(n),
                    User::Block(b) => self.graph.owning_node(b),
                };
                self.error(
                    node,
                    VerifyErrorKind::UseListMismatch {
                        value: key.0,
                        recorded: r,
                        actual: a,
                    },
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{GraphBuilder, InsertPoint, Operator};

    #[test]
    fn test_well_formed_graph_verifies() {
        let mut graph = Graph::new();
        let cond = graph.add_input(Type::Bool);
        let mut b = GraphBuilder::new(&mut graph);
        let node = b
            .if_else(cond, |b| Ok(vec![b.int(1)?]), |b| Ok(vec![b.int(2)?]))
            .unwrap();
        let out = b.outputs(node)[0];
        graph.register_output(out);
        assert!(verify(&graph, VerifyOptions::lowered()).is_empty());
    }

    #[test]
    fn test_branch_value_not_visible_outside() {
        let mut graph = Graph::new();
        let cond = graph.add_input(Type::Bool);
        let mut inner = None;
        let mut b = GraphBuilder::new(&mut graph);
        b.if_else(
            cond,
            |b| {
                inner = Some(b.int(1)?);
                Ok(vec![])
            },
            |_| Ok(vec![]),
        )
        .unwrap();
        graph.register_output(inner.unwrap());

        let errors = verify(&graph, VerifyOptions::lowered());
        assert!(errors
            .iter()
            .any(|e| matches!(e.kind, VerifyErrorKind::NotVisible { .. })));
    }

    #[test]
    fn test_use_before_definition() {
        let mut graph = Graph::new();
        let mut b = GraphBuilder::new(&mut graph);
        let one = b.int(1).unwrap();
        let neg = graph.create_node(NodeKind::Op(Operator::Neg), &[one], vec![Type::Int]);
        graph.insert(neg, InsertPoint::BlockStart(graph.root())).unwrap();

        let errors = verify(&graph, VerifyOptions::lowered());
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].node, Some(neg));
    }

    #[test]
    fn test_stage_rules() {
        let mut graph = Graph::new();
        let mut b = GraphBuilder::new(&mut graph);
        let x = b.load("x", Type::Int).unwrap();
        b.ret(&[x]).unwrap();

        assert!(verify(&graph, VerifyOptions::frontend()).is_empty());
        let errors = verify(&graph, VerifyOptions::lowered());
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_loop_header_must_be_inlined() {
        let mut graph = Graph::new();
        let mut b = GraphBuilder::new(&mut graph);
        let trip = b.int(3).unwrap();
        let cond = b.bool(true).unwrap();
        b.loop_with_header(trip, cond, &[], |_, _, _| Ok(vec![]), |b| b.bool(false))
            .unwrap();

        assert!(verify(&graph, VerifyOptions::frontend()).is_empty());
        let errors = verify(&graph, VerifyOptions::lowered());
        assert!(errors.iter().any(|e| e.kind == VerifyErrorKind::LoopNotInlined));
    }
}
