//! SSA construction
//!
//! Once control flow is decorated, every variable reaching a use is either
//! bound earlier in the same block or in an enclosing one. A single walk
//! with a scope stack therefore resolves each `Load` to the value of the
//! nearest preceding `Store`; both node kinds are then deleted.

use super::{GraphPass, PassResult, ScopeStack};
use crate::error::Result;
use crate::ir::validation::VerifyOptions;
use crate::ir::{BlockId, Graph, NodeKind, ValueId};
use fxhash::FxHashMap;
use log::trace;

pub struct SsaRewriter {
    canonicalize_names: bool,
}

impl SsaRewriter {
    pub fn new() -> Self {
        Self {
            canonicalize_names: true,
        }
    }

    /// Name stored values after their variable and make names unique
    pub fn with_canonical_names(mut self, enabled: bool) -> Self {
        self.canonicalize_names = enabled;
        self
    }
}

impl Default for SsaRewriter {
    fn default() -> Self {
        Self::new()
    }
}

struct SsaContext<'g> {
    graph: &'g mut Graph,
    env: ScopeStack<ValueId>,
    name_values: bool,
    result: PassResult,
}

impl<'g> SsaContext<'g> {
    fn rewrite_block(&mut self, block: BlockId) -> Result<()> {
        self.env.push(block);
        let mut cursor = self.graph.first_node(block);
        while let Some(node) = cursor {
            let next = self.graph.next_node(node);
            match self.graph.kind(node).clone() {
                NodeKind::Store(name) => {
                    let value = self.graph.node(node).inputs[0];
                    if self.name_values && self.graph.value_name(value).is_none() {
                        self.graph.set_value_name(value, name.as_str());
                    }
                    self.env.bind(&name, value);
                    self.graph.destroy_node(node)?;
                    self.result.nodes_removed += 1;
                    self.result.bump("stores_removed");
                }
                NodeKind::Load(name) => {
                    let value = *self.env.lookup_outer(&name)?;
                    let output = self.graph.node(node).outputs[0];
                    trace!("{} resolves `{}` to {}", node, name, value);
                    self.graph.replace_all_uses_with(output, value);
                    self.graph.destroy_node(node)?;
                    self.result.nodes_removed += 1;
                    self.result.bump("loads_resolved");
                }
                _ => {
                    let blocks = self.graph.node(node).blocks.to_vec();
                    for child in blocks {
                        self.rewrite_block(child)?;
                    }
                }
            }
            cursor = next;
        }
        self.env.pop();
        Ok(())
    }
}

/// Strip a `.N` suffix added by an earlier renaming
fn base_name(name: &str) -> &str {
    match name.rsplit_once('.') {
        Some((base, suffix)) if !base.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) => base,
        _ => name,
    }
}

/// Make value names unique in definition order: `x`, `x.1`, `x.2`, ...
pub fn uniquify_names(graph: &mut Graph) -> usize {
    let mut order: Vec<ValueId> = graph.inputs().to_vec();
    for node in graph.walk_nodes() {
        order.extend(graph.node(node).outputs.iter().copied());
        for &block in &graph.node(node).blocks {
            order.extend(graph.block(block).params.iter().copied());
        }
    }

    let mut seen: FxHashMap<String, usize> = FxHashMap::default();
    let mut renamed = 0;
    for value in order {
        let Some(name) = graph.value_name(value) else { continue };
        let base = base_name(name).to_string();
        let count = seen.entry(base.clone()).or_insert(0);
        let unique = if *count == 0 {
            base
        } else {
            format!("{}.{}", base, count)
        };
        *count += 1;
        if graph.value_name(value) != Some(unique.as_str()) {
            graph.set_value_name(value, unique);
            renamed += 1;
        }
    }
    renamed
}

impl GraphPass for SsaRewriter {
    fn name(&self) -> &'static str {
        "ssa-construction"
    }

    fn run_on_graph(&mut self, graph: &mut Graph) -> Result<PassResult> {
        let root = graph.root();
        let mut cx = SsaContext {
            graph: &mut *graph,
            env: ScopeStack::new(),
            name_values: self.canonicalize_names,
            result: PassResult::unchanged(),
        };
        cx.rewrite_block(root)?;

        let mut result = cx.result;
        if self.canonicalize_names {
            let renamed = uniquify_names(graph);
            if renamed > 0 {
                result.stats.insert("values_renamed", renamed);
            }
        }
        Ok(result)
    }

    fn postcondition(&self) -> VerifyOptions {
        VerifyOptions {
            allow_scope_ops: false,
            allow_loop_exits: false,
            allow_returns: true,
            require_inlined_loops: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LoweringError;
    use crate::ir::interp::{Interpreter, RtValue};
    use crate::ir::validation::verify;
    use crate::ir::{GraphBuilder, Operator, Type};
    use crate::passes::ControlFlowDecorator;

    #[test]
    fn test_straight_line() {
        // x = a; x = x + 1; return x
        let mut graph = Graph::new();
        let a = graph.add_input(Type::Int);
        let mut b = GraphBuilder::new(&mut graph);
        b.store("x", a).unwrap();
        let x = b.load("x", Type::Int).unwrap();
        let one = b.int(1).unwrap();
        let sum = b.binary(Operator::Add, x, one).unwrap();
        b.store("x", sum).unwrap();
        let out = b.load("x", Type::Int).unwrap();
        graph.register_output(out);

        let result = SsaRewriter::new().run_on_graph(&mut graph).unwrap();
        assert_eq!(result.stat("loads_resolved"), 2);
        assert_eq!(result.stat("stores_removed"), 2);
        assert_eq!(graph.outputs(), &[sum]);
        assert_eq!(graph.node(graph.producer(sum).unwrap()).inputs[0], a);
        assert_eq!(graph.count_nodes(NodeKind::is_scope_op), 0);
    }

    #[test]
    fn test_unresolved_load() {
        let mut graph = Graph::new();
        let mut b = GraphBuilder::new(&mut graph);
        b.load("missing", Type::Int).unwrap();
        let result = SsaRewriter::new().run_on_graph(&mut graph);
        assert!(matches!(result, Err(LoweringError::UnresolvedVariable { .. })));
    }

    #[test]
    fn test_decorated_loop_to_ssa() {
        // x = 0
        // for i in range(4): x = x + i
        // return x
        let mut graph = Graph::new();
        let mut b = GraphBuilder::new(&mut graph);
        let zero = b.int(0).unwrap();
        b.store("x", zero).unwrap();
        let trip = b.int(4).unwrap();
        let t = b.bool(true).unwrap();
        b.loop_(trip, t, &[], |b, i, _| {
            let x = b.load("x", Type::Int)?;
            let next = b.binary(Operator::Add, x, i)?;
            b.store("x", next)?;
            let more = b.bool(true)?;
            Ok((more, vec![]))
        })
        .unwrap();
        let out = b.load("x", Type::Int).unwrap();
        graph.register_output(out);

        ControlFlowDecorator::new().run_on_graph(&mut graph).unwrap();
        SsaRewriter::new().run_on_graph(&mut graph).unwrap();
        let errors = verify(&graph, VerifyOptions::lowered());
        assert!(errors.is_empty(), "{:?}", errors);

        let mut interp = Interpreter::new(&graph);
        assert_eq!(interp.run(&[]).unwrap(), vec![RtValue::Int(6)]);
    }

    #[test]
    fn test_ssa_is_idempotent() {
        let mut graph = Graph::new();
        let a = graph.add_input(Type::Int);
        let mut b = GraphBuilder::new(&mut graph);
        b.store("x", a).unwrap();
        let x = b.load("x", Type::Int).unwrap();
        graph.register_output(x);

        let mut pass = SsaRewriter::new();
        pass.run_on_graph(&mut graph).unwrap();
        let again = pass.run_on_graph(&mut graph).unwrap();
        assert!(!again.modified);
    }

    #[test]
    fn test_uniquify_names() {
        let mut graph = Graph::new();
        let a = graph.add_input(Type::Int);
        let b_in = graph.add_input(Type::Int);
        let c = graph.add_input(Type::Int);
        graph.set_value_name(a, "x");
        graph.set_value_name(b_in, "x");
        graph.set_value_name(c, "x.1");

        assert_eq!(uniquify_names(&mut graph), 2);
        assert_eq!(graph.value_name(a), Some("x"));
        assert_eq!(graph.value_name(b_in), Some("x.1"));
        assert_eq!(graph.value_name(c), Some("x.2"));
        assert_eq!(uniquify_names(&mut graph), 0);
    }
}
