//! Lowering passes
//!
//! Each pass rewrites a [`Graph`] in place. The standard order is:
//!
//! 1. [`LoopHeaderInliner`] - splice loop condition blocks into loop bodies
//! 2. [`ExitEliminator`] for `break`/`continue`
//! 3. [`ControlFlowDecorator`] - make variables mutated in `If`/`Loop`
//!    explicit inputs and outputs
//! 4. [`SsaRewriter`] - resolve every `Load`, drop every `Store`
//! 5. [`ExitEliminator`] for `return`

pub mod control_flow;
pub mod environment;
pub mod exits;
pub mod loop_header;
pub mod ssa;

pub use control_flow::ControlFlowDecorator;
pub use environment::{Frame, ScopeStack};
pub use exits::{ExitKind, ExitStatus, ExitEliminator};
pub use loop_header::LoopHeaderInliner;
pub use ssa::SsaRewriter;

use crate::error::Result;
use crate::ir::validation::VerifyOptions;
use crate::ir::{Graph, InsertPoint, Literal, NodeId, NodeKind, Operator, Type, ValueId};
use fxhash::FxHashMap;

/// A graph-to-graph lowering pass
pub trait GraphPass: Send {
    /// Get the name of this pass
    fn name(&self) -> &'static str;

    /// Run the pass on a graph
    fn run_on_graph(&mut self, graph: &mut Graph) -> Result<PassResult>;

    /// Constructs that may remain once this pass (and those before it in the
    /// standard order) has run
    fn postcondition(&self) -> VerifyOptions;
}

/// Result of a lowering pass
#[derive(Debug, Clone, Default)]
pub struct PassResult {
    /// Whether the graph was modified
    pub modified: bool,

    /// Nodes created by the pass
    pub nodes_added: usize,

    /// Nodes destroyed by the pass
    pub nodes_removed: usize,

    /// Other statistics
    pub stats: FxHashMap<&'static str, usize>,
}

impl PassResult {
    /// Create a result indicating no changes
    pub fn unchanged() -> Self {
        Self::default()
    }

    /// Bump a named counter, marking the result modified
    pub fn bump(&mut self, key: &'static str) {
        self.modified = true;
        *self.stats.entry(key).or_insert(0) += 1;
    }

    pub fn stat(&self, key: &str) -> usize {
        self.stats.get(key).copied().unwrap_or(0)
    }

    /// Combine results
    pub fn combine(mut self, other: PassResult) -> Self {
        self.modified |= other.modified;
        self.nodes_added += other.nodes_added;
        self.nodes_removed += other.nodes_removed;

        for (key, value) in other.stats {
            *self.stats.entry(key).or_insert(0) += value;
        }

        self
    }
}

/// Lowering pass manager
pub struct PassManager {
    passes: Vec<Box<dyn GraphPass>>,
}

impl Default for PassManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PassManager {
    /// Create an empty pass manager
    pub fn new() -> Self {
        Self { passes: Vec::new() }
    }

    /// Add a pass to the manager
    pub fn add_pass<P: GraphPass + 'static>(&mut self, pass: P) {
        self.passes.push(Box::new(pass));
    }

    pub fn passes_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn GraphPass>> {
        self.passes.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }
}

/// Boolean constants and per-type placeholders, created once per pass run
/// at the start of the graph body so they are visible everywhere.
#[derive(Debug, Default)]
pub(crate) struct ConstantPool {
    true_value: Option<ValueId>,
    false_value: Option<ValueId>,
    placeholders: FxHashMap<Type, ValueId>,
    created: Vec<NodeId>,
}

impl ConstantPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bool(&mut self, graph: &mut Graph, value: bool) -> Result<ValueId> {
        let slot = if value { self.true_value } else { self.false_value };
        if let Some(existing) = slot {
            return Ok(existing);
        }
        let v = self.make(
            graph,
            NodeKind::Op(Operator::Constant(Literal::Bool(value))),
            Type::Bool,
        )?;
        if value {
            self.true_value = Some(v);
        } else {
            self.false_value = Some(v);
        }
        Ok(v)
    }

    pub fn is_false(&self, value: ValueId) -> bool {
        self.false_value == Some(value)
    }

    /// The canonical placeholder of type `ty`
    pub fn placeholder(&mut self, graph: &mut Graph, ty: &Type) -> Result<ValueId> {
        if let Some(&existing) = self.placeholders.get(ty) {
            return Ok(existing);
        }
        let v = self.make(graph, NodeKind::Op(Operator::Uninitialized), ty.clone())?;
        self.placeholders.insert(ty.clone(), v);
        Ok(v)
    }

    fn make(&mut self, graph: &mut Graph, kind: NodeKind, ty: Type) -> Result<ValueId> {
        let node = graph.create_node(kind, &[], vec![ty]);
        graph.insert(node, InsertPoint::BlockStart(graph.root()))?;
        self.created.push(node);
        Ok(graph.node(node).outputs[0])
    }

    pub fn created(&self) -> usize {
        self.created.len()
    }

    /// Destroy the pooled nodes nobody ended up using. Returns how many.
    pub fn prune(&mut self, graph: &mut Graph) -> Result<usize> {
        let mut removed = 0;
        for node in self.created.drain(..) {
            let output = graph.node(node).outputs[0];
            if graph.node(node).live && graph.use_count(output) == 0 {
                graph.destroy_node(node)?;
                removed += 1;
            }
        }
        self.true_value = None;
        self.false_value = None;
        self.placeholders.clear();
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine_results() {
        let mut a = PassResult::unchanged();
        a.bump("loads_resolved");
        let mut b = PassResult::unchanged();
        b.nodes_removed = 3;
        b.bump("loads_resolved");
        b.bump("stores_removed");

        let total = a.combine(b);
        assert!(total.modified);
        assert_eq!(total.nodes_removed, 3);
        assert_eq!(total.stat("loads_resolved"), 2);
        assert_eq!(total.stat("stores_removed"), 1);
        assert_eq!(total.stat("missing"), 0);
    }

    #[test]
    fn test_pool_reuses_and_prunes() {
        let mut graph = Graph::new();
        let mut pool = ConstantPool::new();
        let t1 = pool.bool(&mut graph, true).unwrap();
        let t2 = pool.bool(&mut graph, true).unwrap();
        let f = pool.bool(&mut graph, false).unwrap();
        let p = pool.placeholder(&mut graph, &Type::Int).unwrap();
        assert_eq!(t1, t2);
        assert!(pool.is_false(f));
        assert_eq!(pool.created(), 3);

        graph.register_output(p);
        assert_eq!(pool.prune(&mut graph).unwrap(), 2);
        assert_eq!(graph.node_count(), 1);
    }
}
