//! Control-flow decoration
//!
//! Before SSA construction, every variable written inside an `If` or
//! `Loop` and still visible afterwards must flow through the construct
//! explicitly. For an `If` the branches gain a `Load` of the variable as a
//! new output and a `Store` rebinds the variable to the new `If` output.
//! For a `Loop` the variable becomes loop-carried: loaded before the loop,
//! bound from a body parameter at the start of the body, loaded again as a
//! body output at the end, and stored from the new loop output afterwards.
//!
//! Variables first defined inside a loop body are not carried out of the
//! loop. A variable defined in only one branch of an `If` is exported when
//! the other branch always exits or a later `Load` may read it; the other
//! branch then yields a placeholder. Once loop exits are eliminated, a branch
//! that used to `break` no longer looks like it exits, so the later `Load`
//! is what decides.

use super::{ConstantPool, Frame, GraphPass, PassResult, ScopeStack};
use crate::error::{LoweringError, Result};
use crate::ir::validation::VerifyOptions;
use crate::ir::{unify, BlockId, Graph, InsertPoint, NodeId, NodeKind, Operator, Type, User, ValueId};
use fxhash::FxHashSet;
use log::{debug, trace};

pub struct ControlFlowDecorator {
    prune_constants: bool,
}

impl ControlFlowDecorator {
    pub fn new() -> Self {
        Self {
            prune_constants: true,
        }
    }

    pub fn with_pruning(mut self, prune: bool) -> Self {
        self.prune_constants = prune;
        self
    }
}

impl Default for ControlFlowDecorator {
    fn default() -> Self {
        Self::new()
    }
}

struct DecorateContext<'g> {
    graph: &'g mut Graph,
    env: ScopeStack<Type>,
    pool: ConstantPool,
    result: PassResult,
}

/// Whether every path through `block` ends in an exit statement
pub fn always_exits(graph: &Graph, block: BlockId) -> bool {
    graph.block(block).nodes.iter().any(|&node| match graph.kind(node) {
        NodeKind::Return | NodeKind::Break | NodeKind::Continue => true,
        NodeKind::If => graph
            .node(node)
            .blocks
            .iter()
            .all(|&b| always_exits(graph, b)),
        _ => false,
    })
}

impl<'g> DecorateContext<'g> {
    fn decorate_block(&mut self, block: BlockId) -> Result<()> {
        let mut cursor = self.graph.first_node(block);
        while let Some(node) = cursor {
            match self.graph.kind(node) {
                NodeKind::Store(name) => {
                    let name = name.clone();
                    let input = *self
                        .graph
                        .node(node)
                        .inputs
                        .first()
                        .ok_or_else(|| LoweringError::malformed(node, "store has no operand"))?;
                    let ty = self.graph.value_type(input).clone();
                    trace!("{} binds `{}` : {}", node, name, ty);
                    self.env.bind(&name, ty);
                }
                NodeKind::If => self.decorate_if(node)?,
                NodeKind::Loop => self.decorate_loop(node)?,
                NodeKind::Function => {
                    let blocks = &self.graph.node(node).blocks;
                    if blocks.len() != 1 {
                        return Err(LoweringError::malformed(node, "function must own exactly one block"));
                    }
                    let body = blocks[0];
                    self.decorate_scope(body)?;
                }
                _ => {}
            }
            cursor = self.graph.next_node(node);
        }
        Ok(())
    }

    /// Decorate `block` in a fresh frame, returning the names it bound
    fn decorate_scope(&mut self, block: BlockId) -> Result<Frame<Type>> {
        self.env.push(block);
        let result = self.decorate_block(block);
        let frame = self.env.pop().unwrap_or_else(|| Frame::new(block));
        result.map(|_| frame)
    }

    fn loaded_name(&self, value: ValueId) -> Option<&str> {
        let producer = self.graph.producer(value)?;
        match self.graph.kind(producer) {
            NodeKind::Load(name) => Some(name.as_str()),
            _ => None,
        }
    }

    fn is_placeholder(&self, value: ValueId) -> bool {
        self.graph
            .producer(value)
            .map_or(false, |p| *self.graph.kind(p) == NodeKind::Op(Operator::Uninitialized))
    }

    /// Whether a `Load` of `name` follows `node` in its block or in any
    /// enclosing block up to the nearest function body.
    fn needed_after(&self, node: NodeId, name: &str) -> bool {
        let reads = |n: NodeId| matches!(self.graph.kind(n), NodeKind::Load(loaded) if loaded == name);
        let mut current = node;
        loop {
            for later in self.graph.nodes_after(current) {
                if reads(later) {
                    return true;
                }
                let nested = self.graph.node(later).blocks.to_vec();
                if nested.iter().any(|&b| self.graph.walk_block(b).into_iter().any(|n| reads(n))) {
                    return true;
                }
            }
            let Some(owner) = self.graph.owning_block(current).and_then(|b| self.graph.owning_node(b)) else {
                return false;
            };
            if *self.graph.kind(owner) == NodeKind::Function {
                return false;
            }
            current = owner;
        }
    }

    /// Names already flowing through `node`: outputs stored back to a
    /// variable whose block outputs (shifted by `offset`) load that same
    /// variable, or hold a placeholder, in every block.
    fn carried_names(&self, node: NodeId, blocks: &[BlockId], offset: usize) -> FxHashSet<String> {
        let mut names = FxHashSet::default();
        for (i, &output) in self.graph.node(node).outputs.iter().enumerate() {
            let stored = self.graph.value(output).uses.iter().find_map(|user| match user {
                User::Node(n) => match self.graph.kind(*n) {
                    NodeKind::Store(name) => Some(name.clone()),
                    _ => None,
                },
                User::Block(_) => None,
            });
            let Some(name) = stored else { continue };
            let mut loads = 0;
            let flows_through = blocks.iter().all(|&b| match self.graph.block(b).outputs.get(i + offset) {
                Some(&v) if self.loaded_name(v) == Some(name.as_str()) => {
                    loads += 1;
                    true
                }
                Some(&v) => self.is_placeholder(v),
                None => false,
            });
            if flows_through && loads > 0 {
                names.insert(name);
            }
        }
        names
    }

    fn load_at_end(&mut self, block: BlockId, name: &str, ty: Type) -> Result<ValueId> {
        let node = self.graph.create_node(NodeKind::Load(name.to_string()), &[], vec![ty]);
        self.graph.insert(node, InsertPoint::BlockEnd(block))?;
        let value = self.graph.node(node).outputs[0];
        self.graph.set_value_name(value, name);
        self.result.nodes_added += 1;
        Ok(value)
    }

    fn store_after(&mut self, anchor: NodeId, name: &str, value: ValueId) -> Result<NodeId> {
        let node = self.graph.create_node(NodeKind::Store(name.to_string()), &[value], vec![]);
        self.graph.insert(node, InsertPoint::After(anchor))?;
        self.result.nodes_added += 1;
        Ok(node)
    }

    fn decorate_if(&mut self, node: NodeId) -> Result<()> {
        let blocks = self.graph.node(node).blocks.to_vec();
        if blocks.len() != 2 {
            return Err(LoweringError::malformed(node, "if must own exactly two blocks"));
        }
        let (then_block, else_block) = (blocks[0], blocks[1]);
        let then_frame = self.decorate_scope(then_block)?;
        let else_frame = self.decorate_scope(else_block)?;

        let carried = self.carried_names(node, &blocks, 0);
        let then_exits = always_exits(self.graph, then_block);
        let else_exits = always_exits(self.graph, else_block);

        let mut mutated: Vec<String> = then_frame.names().map(str::to_string).collect();
        for name in else_frame.names() {
            if then_frame.get(name).is_none() {
                mutated.push(name.to_string());
            }
        }

        let mut anchor = node;
        for name in mutated {
            if carried.contains(&name) {
                continue;
            }
            let then_ty = then_frame.get(&name).or_else(|| self.env.find(&name)).cloned();
            let else_ty = else_frame.get(&name).or_else(|| self.env.find(&name)).cloned();

            let (then_value, else_value, ty) = match (then_ty, else_ty) {
                (Some(t), Some(e)) => {
                    let ty = unify(&t, &e).ok_or_else(|| LoweringError::UnificationFailed {
                        name: name.clone(),
                        left: t.to_string(),
                        right: e.to_string(),
                    })?;
                    let then_value = self.load_at_end(then_block, &name, t)?;
                    let else_value = self.load_at_end(else_block, &name, e)?;
                    (then_value, else_value, ty)
                }
                (Some(t), None) if else_exits || self.needed_after(node, &name) => {
                    let then_value = self.load_at_end(then_block, &name, t.clone())?;
                    let placeholder = self.pool.placeholder(self.graph, &t)?;
                    (then_value, placeholder, t)
                }
                (None, Some(e)) if then_exits || self.needed_after(node, &name) => {
                    let placeholder = self.pool.placeholder(self.graph, &e)?;
                    let else_value = self.load_at_end(else_block, &name, e.clone())?;
                    (placeholder, else_value, e)
                }
                // Defined on one path only and never read afterwards.
                _ => continue,
            };

            self.graph.register_block_output(then_block, then_value);
            self.graph.register_block_output(else_block, else_value);
            let output = self.graph.add_output(node, ty);
            self.graph.set_value_name(output, name.as_str());
            anchor = self.store_after(anchor, &name, output)?;
            debug!("{} exports `{}`", node, name);
            self.result.bump("if_outputs_added");
        }
        Ok(())
    }

    fn decorate_loop(&mut self, node: NodeId) -> Result<()> {
        let blocks = self.graph.node(node).blocks.to_vec();
        if blocks.len() != 1 {
            return Err(LoweringError::LoopNotInlined { node });
        }
        let body = blocks[0];
        let frame = self.decorate_scope(body)?;
        let carried = self.carried_names(node, &blocks, 1);

        let mut anchor = node;
        for name in frame.names().map(str::to_string).collect::<Vec<_>>() {
            if carried.contains(&name) {
                continue;
            }
            let Some(outer) = self.env.find(&name).cloned() else {
                // First defined in the body: local to the loop.
                continue;
            };
            let inner = frame.get(&name).cloned().unwrap_or_else(|| outer.clone());
            let ty = unify(&outer, &inner).ok_or_else(|| LoweringError::UnificationFailed {
                name: name.clone(),
                left: outer.to_string(),
                right: inner.to_string(),
            })?;

            let init = self.graph.create_node(NodeKind::Load(name.clone()), &[], vec![outer]);
            self.graph.insert(init, InsertPoint::Before(node))?;
            let init_value = self.graph.node(init).outputs[0];
            self.graph.set_value_name(init_value, name.as_str());
            self.graph.push_input(node, init_value);

            let param = self.graph.add_block_param(body, ty.clone());
            self.graph.set_value_name(param, name.as_str());
            let bind = self.graph.create_node(NodeKind::Store(name.clone()), &[param], vec![]);
            self.graph.insert(bind, InsertPoint::BlockStart(body))?;

            let last = self.load_at_end(body, &name, inner)?;
            self.graph.register_block_output(body, last);

            let output = self.graph.add_output(node, ty);
            self.graph.set_value_name(output, name.as_str());
            anchor = self.store_after(anchor, &name, output)?;
            self.result.nodes_added += 2;
            debug!("{} carries `{}`", node, name);
            self.result.bump("loop_carried_added");
        }
        Ok(())
    }
}

impl GraphPass for ControlFlowDecorator {
    fn name(&self) -> &'static str {
        "control-flow-decoration"
    }

    fn run_on_graph(&mut self, graph: &mut Graph) -> Result<PassResult> {
        let root = graph.root();
        let mut cx = DecorateContext {
            graph,
            env: ScopeStack::new(),
            pool: ConstantPool::new(),
            result: PassResult::unchanged(),
        };
        cx.decorate_scope(root)?;

        cx.result.nodes_added += cx.pool.created();
        if self.prune_constants {
            let pruned = cx.pool.prune(cx.graph)?;
            cx.result.nodes_added -= pruned;
        }
        Ok(cx.result)
    }

    fn postcondition(&self) -> VerifyOptions {
        VerifyOptions {
            allow_scope_ops: true,
            allow_loop_exits: false,
            allow_returns: true,
            require_inlined_loops: true,
        }
    }
}
