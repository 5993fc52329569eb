//! Exit elimination
//!
//! Removes `BreakStmt`/`ContinueStmt` (loop exits) or `ReturnStmt`
//! (function exits) by re-expressing them with structured control flow.
//!
//! Every block is classified while it is scanned:
//!
//! - WONT: no path through the block reaches an exit
//! - WILL: every path does
//! - MIGHT: some paths do; a boolean sentinel value says which
//!
//! Nodes after a WILL point are unreachable and deleted. Nodes after a
//! MIGHT point are moved under a guard `If` on the sentinel. The values an
//! exit carries (returned values, or the loop continuation state) flow out
//! of each construct as extra outputs until they reach the target block,
//! where they become its outputs.
//!
//! Exit values for the loop pass are `[did_break, continue_condition,
//! carried...]`; for the return pass they are the returned values.

use super::{ConstantPool, GraphPass, PassResult};
use crate::error::{LoweringError, Result};
use crate::ir::validation::VerifyOptions;
use crate::ir::{unify, BlockId, Graph, InsertPoint, NodeId, NodeKind, Type, ValueId};
use log::{debug, trace};

/// Which exit statements a pass removes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// `break` and `continue`; the target is the innermost loop body
    Loop,
    /// `return`; the target is the innermost function or graph body
    Return,
}

/// Whether control leaving a block has exited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Wont,
    Might,
    Will,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exited {
    Never,
    Always,
    /// Dynamically decided by a `Bool` value
    Maybe(ValueId),
}

#[derive(Debug, Clone)]
struct ExitPair {
    exited: Exited,
    values: Vec<ValueId>,
}

impl ExitPair {
    fn wont() -> Self {
        Self {
            exited: Exited::Never,
            values: Vec::new(),
        }
    }

    fn will(values: Vec<ValueId>) -> Self {
        Self {
            exited: Exited::Always,
            values,
        }
    }

    fn status(&self) -> ExitStatus {
        match self.exited {
            Exited::Never => ExitStatus::Wont,
            Exited::Always => ExitStatus::Will,
            Exited::Maybe(_) => ExitStatus::Might,
        }
    }
}

/// Exit elimination pass
pub struct ExitEliminator {
    kind: ExitKind,
    prune_constants: bool,
}

impl ExitEliminator {
    pub fn new(kind: ExitKind) -> Self {
        Self {
            kind,
            prune_constants: true,
        }
    }

    /// Keep unused pooled constants and placeholders instead of deleting them
    pub fn with_pruning(mut self, prune: bool) -> Self {
        self.prune_constants = prune;
        self
    }

    pub fn kind(&self) -> ExitKind {
        self.kind
    }
}

struct ExitContext<'g> {
    graph: &'g mut Graph,
    kind: ExitKind,
    /// Block the exits currently being removed leave
    target: Option<BlockId>,
    pool: ConstantPool,
    result: PassResult,
}

impl<'g> ExitContext<'g> {
    fn is_target_exit(&self, node: NodeId) -> bool {
        match (self.kind, self.graph.kind(node)) {
            (ExitKind::Return, NodeKind::Return) => true,
            (ExitKind::Loop, NodeKind::Break | NodeKind::Continue) => true,
            _ => false,
        }
    }

    // === Preprocessing ===

    /// Make every target block end in an explicit exit statement so that
    /// each of them is WILL once scanned.
    fn seal_targets(&mut self) -> Result<()> {
        let root = self.graph.root();
        let mut targets = Vec::new();
        if self.kind == ExitKind::Return {
            targets.push(root);
        }
        for node in self.graph.walk_nodes() {
            let data = self.graph.node(node);
            match (self.kind, &data.kind) {
                (ExitKind::Return, NodeKind::Function) => {
                    if data.blocks.len() != 1 {
                        return Err(LoweringError::malformed(node, "function must own exactly one block"));
                    }
                    targets.push(data.blocks[0]);
                }
                (ExitKind::Loop, NodeKind::Loop) => {
                    if data.blocks.len() != 1 {
                        return Err(LoweringError::LoopNotInlined { node });
                    }
                    targets.push(data.blocks[0]);
                }
                _ => {}
            }
        }

        let exit_kind = match self.kind {
            ExitKind::Return => NodeKind::Return,
            ExitKind::Loop => NodeKind::Continue,
        };
        for block in targets {
            if let Some(last) = self.graph.last_node(block) {
                if self.is_target_exit(last) {
                    continue;
                }
            }
            let outputs = self.graph.clear_block_outputs(block);
            let node = self.graph.create_node(exit_kind.clone(), &outputs, vec![]);
            self.graph.insert(node, InsertPoint::BlockEnd(block))?;
        }
        Ok(())
    }

    // === Scanning ===

    /// Transform the nodes of `block` from `start` (or the first node) on.
    fn scan_block(&mut self, block: BlockId, start: Option<NodeId>) -> Result<ExitPair> {
        let mut cursor = start.or_else(|| self.graph.first_node(block));
        while let Some(node) = cursor {
            if self.is_target_exit(node) {
                return self.capture_exit(node);
            }
            let pair = match self.graph.kind(node) {
                NodeKind::If => self.transform_if(node)?,
                NodeKind::Loop => self.transform_loop(node)?,
                NodeKind::Function => self.transform_function(node)?,
                _ => ExitPair::wont(),
            };
            match pair.status() {
                ExitStatus::Wont => cursor = self.graph.next_node(node),
                ExitStatus::Will => {
                    self.delete_after(node)?;
                    return Ok(pair);
                }
                ExitStatus::Might => {
                    if self.graph.next_node(node).is_none() {
                        return Ok(pair);
                    }
                    return self.guard_rest(block, node, pair);
                }
            }
        }
        Ok(ExitPair::wont())
    }

    fn capture_exit(&mut self, node: NodeId) -> Result<ExitPair> {
        if self.target.is_none() {
            return Err(LoweringError::ExitWithoutTarget {
                node,
                kind: self.graph.kind(node).name(),
            });
        }
        let inputs = self.graph.node(node).inputs.to_vec();
        let values = match self.graph.kind(node) {
            NodeKind::Continue => {
                let mut values = vec![self.pool.bool(self.graph, false)?];
                values.extend(inputs);
                values
            }
            NodeKind::Break => {
                let mut values = vec![
                    self.pool.bool(self.graph, true)?,
                    self.pool.bool(self.graph, false)?,
                ];
                values.extend(inputs);
                values
            }
            _ => inputs,
        };
        trace!("captured {} at {}", self.graph.kind(node), node);
        self.delete_after(node)?;
        self.graph.destroy_node(node)?;
        self.result.nodes_removed += 1;
        self.result.bump("exits_removed");
        Ok(ExitPair::will(values))
    }

    /// Delete every node after `node` in its block, last to first.
    fn delete_after(&mut self, node: NodeId) -> Result<()> {
        for dead in self.graph.nodes_after(node).into_iter().rev() {
            let outputs = self.graph.node(dead).outputs.to_vec();
            for output in outputs {
                if self.graph.use_count(output) > 0 {
                    let ty = self.graph.value_type(output).clone();
                    let placeholder = self.pool.placeholder(self.graph, &ty)?;
                    self.graph.replace_all_uses_with(output, placeholder);
                }
            }
            self.graph.destroy_node(dead)?;
            self.result.nodes_removed += 1;
            self.result.bump("unreachable_nodes_deleted");
        }
        Ok(())
    }

    /// Placeholders typed like `values`
    fn placeholders_like(&mut self, values: &[ValueId]) -> Result<Vec<ValueId>> {
        values
            .iter()
            .map(|&v| {
                let ty = self.graph.value_type(v).clone();
                self.pool.placeholder(self.graph, &ty)
            })
            .collect()
    }

    fn sentinel(&mut self, exited: Exited) -> Result<ValueId> {
        match exited {
            Exited::Never => self.pool.bool(self.graph, false),
            Exited::Always => self.pool.bool(self.graph, true),
            Exited::Maybe(value) => Ok(value),
        }
    }

    // === If ===

    fn transform_if(&mut self, node: NodeId) -> Result<ExitPair> {
        let blocks = self.graph.node(node).blocks.to_vec();
        if blocks.len() != 2 {
            return Err(LoweringError::malformed(node, "if must own exactly two blocks"));
        }
        let (then_block, else_block) = (blocks[0], blocks[1]);
        let mut then_pair = self.scan_block(then_block, None)?;
        let mut else_pair = self.scan_block(else_block, None)?;

        let statuses = (then_pair.status(), else_pair.status());
        if statuses == (ExitStatus::Wont, ExitStatus::Wont) {
            return Ok(ExitPair::wont());
        }

        // One branch exits, the other falls through: the rest of the block
        // only runs on the fall-through path, so it moves into that branch.
        let one_sided = matches!(
            statuses,
            (ExitStatus::Will, ExitStatus::Wont) | (ExitStatus::Wont, ExitStatus::Will)
        );
        if one_sided && !self.statically_exits(node, &then_pair, &else_pair) && self.graph.next_node(node).is_some() {
            let then_falls_through = statuses.0 == ExitStatus::Wont;
            let (open, closed) = if then_falls_through {
                (then_block, else_block)
            } else {
                (else_block, then_block)
            };
            let first = self.sink_rest(node, open, closed)?;
            let pair = self.scan_block(open, Some(first))?;
            if then_falls_through {
                then_pair = pair;
            } else {
                else_pair = pair;
            }
        }

        self.merge_if(node, then_pair, else_pair)
    }

    fn statically_exits(&self, node: NodeId, then_pair: &ExitPair, else_pair: &ExitPair) -> bool {
        let cond = self.graph.node(node).inputs[0];
        match (then_pair.status(), else_pair.status()) {
            (ExitStatus::Will, ExitStatus::Will) => true,
            (ExitStatus::Will, _) => self.graph.constant_bool(cond) == Some(true),
            (_, ExitStatus::Will) => self.graph.constant_bool(cond) == Some(false),
            _ => false,
        }
    }

    /// Move the nodes after `node` to the end of branch `open`, routing the
    /// enclosing block's outputs through new `If` outputs. Returns the first
    /// moved node.
    fn sink_rest(&mut self, node: NodeId, open: BlockId, closed: BlockId) -> Result<NodeId> {
        let rest = self.graph.nodes_after(node);
        let block = self
            .graph
            .owning_block(node)
            .ok_or_else(|| LoweringError::malformed(node, "if is not placed in a block"))?;
        debug!("sinking {} node(s) after {} into {}", rest.len(), node, open);

        for &moved in &rest {
            self.graph.move_node(moved, InsertPoint::BlockEnd(open))?;
        }

        let old_outputs = self.graph.node(node).outputs.to_vec();
        let branch_values: Vec<ValueId> = self
            .graph
            .block(open)
            .outputs
            .get(..old_outputs.len())
            .map(<[ValueId]>::to_vec)
            .ok_or_else(|| {
                LoweringError::arity(
                    format!("branch outputs of {}", node),
                    old_outputs.len(),
                    self.graph.block(open).outputs.len(),
                )
            })?;

        for value in self.graph.clear_block_outputs(block) {
            let ty = self.graph.value_type(value).clone();
            self.graph.register_block_output(open, value);
            let placeholder = self.pool.placeholder(self.graph, &ty)?;
            self.graph.register_block_output(closed, placeholder);
            let routed = self.graph.add_output(node, ty);
            self.graph.register_block_output(block, routed);
        }

        // The moved nodes now sit inside the branch that computes the
        // If's old outputs; read the branch values directly.
        for (old, inner) in old_outputs.into_iter().zip(branch_values) {
            self.graph.replace_all_uses_with(old, inner);
        }

        self.result.bump("sinks");
        Ok(rest[0])
    }

    /// Give an `If` whose branches may exit the sentinel and exit-value
    /// outputs describing both branches.
    fn merge_if(&mut self, node: NodeId, mut then_pair: ExitPair, mut else_pair: ExitPair) -> Result<ExitPair> {
        let cond = self.graph.node(node).inputs[0];
        let [then_block, else_block] = {
            let blocks = &self.graph.node(node).blocks;
            [blocks[0], blocks[1]]
        };
        let static_will = self.statically_exits(node, &then_pair, &else_pair);

        if then_pair.status() == ExitStatus::Wont {
            then_pair.values = self.placeholders_like(&else_pair.values)?;
        }
        if else_pair.status() == ExitStatus::Wont {
            else_pair.values = self.placeholders_like(&then_pair.values)?;
        }
        if then_pair.values.len() != else_pair.values.len() {
            return Err(LoweringError::arity(
                format!("exit values of {}", node),
                then_pair.values.len(),
                else_pair.values.len(),
            ));
        }

        let exited = if static_will {
            Exited::Always
        } else if (then_pair.exited, else_pair.exited) == (Exited::Always, Exited::Never) {
            Exited::Maybe(cond)
        } else {
            let t = self.sentinel(then_pair.exited)?;
            let e = self.sentinel(else_pair.exited)?;
            self.graph.register_block_output(then_block, t);
            self.graph.register_block_output(else_block, e);
            let flag = self.graph.add_output(node, Type::Bool);
            self.graph.set_value_name(flag, "did_exit");
            Exited::Maybe(flag)
        };

        let mut values = Vec::with_capacity(then_pair.values.len());
        for (t, e) in then_pair.values.into_iter().zip(else_pair.values) {
            if t == e {
                values.push(t);
                continue;
            }
            let (tt, et) = (self.graph.value_type(t), self.graph.value_type(e));
            let ty = unify(tt, et).ok_or_else(|| LoweringError::UnificationFailed {
                name: format!("exit value of {}", node),
                left: tt.to_string(),
                right: et.to_string(),
            })?;
            self.graph.register_block_output(then_block, t);
            self.graph.register_block_output(else_block, e);
            values.push(self.graph.add_output(node, ty));
        }

        Ok(ExitPair { exited, values })
    }

    /// Wrap the nodes after a MIGHT point in an `If` on its sentinel.
    fn guard_rest(&mut self, block: BlockId, node: NodeId, pair: ExitPair) -> Result<ExitPair> {
        let sentinel = match pair.exited {
            Exited::Maybe(value) => value,
            _ => return Err(LoweringError::malformed(node, "guard requires a dynamic exit")),
        };
        let rest = self.graph.nodes_after(node);

        let guard = self.graph.create_node(NodeKind::If, &[sentinel], vec![]);
        self.graph.insert(guard, InsertPoint::After(node))?;
        let exited_block = self.graph.add_block(guard);
        let continue_block = self.graph.add_block(guard);
        debug!("guarding {} node(s) after {} with {}", rest.len(), node, guard);

        for moved in rest {
            self.graph.move_node(moved, InsertPoint::BlockEnd(continue_block))?;
        }
        for value in self.graph.clear_block_outputs(block) {
            let ty = self.graph.value_type(value).clone();
            self.graph.register_block_output(continue_block, value);
            let placeholder = self.pool.placeholder(self.graph, &ty)?;
            self.graph.register_block_output(exited_block, placeholder);
            let routed = self.graph.add_output(guard, ty);
            self.graph.register_block_output(block, routed);
        }
        self.result.nodes_added += 1;
        self.result.bump("guards_inserted");

        let continue_pair = self.scan_block(continue_block, None)?;
        self.merge_if(guard, ExitPair::will(pair.values), continue_pair)
    }

    /// `if flag { false } else { cond }`, appended to `block`
    fn select_false(&mut self, block: BlockId, flag: ValueId, cond: ValueId) -> Result<ValueId> {
        let f = self.pool.bool(self.graph, false)?;
        let node = self.graph.create_node(NodeKind::If, &[flag], vec![Type::Bool]);
        self.graph.insert(node, InsertPoint::BlockEnd(block))?;
        let then_block = self.graph.add_block(node);
        let else_block = self.graph.add_block(node);
        self.graph.register_block_output(then_block, f);
        self.graph.register_block_output(else_block, cond);
        self.result.nodes_added += 1;
        Ok(self.graph.node(node).outputs[0])
    }

    // === Loops ===

    fn transform_loop(&mut self, node: NodeId) -> Result<ExitPair> {
        let blocks = self.graph.node(node).blocks.to_vec();
        if blocks.len() != 1 {
            return Err(LoweringError::LoopNotInlined { node });
        }
        let body = blocks[0];

        match self.kind {
            ExitKind::Loop => {
                let saved = self.target.replace(body);
                let pair = self.scan_block(body, None)?;
                self.absorb_loop(node, body, pair)?;
                self.target = saved;
                Ok(ExitPair::wont())
            }
            ExitKind::Return => {
                let pair = self.scan_block(body, None)?;
                if pair.status() == ExitStatus::Wont {
                    return Ok(pair);
                }
                self.carry_exit(node, body, pair)
            }
        }
    }

    /// Install the loop body's exit values as its outputs.
    fn absorb_loop(&mut self, node: NodeId, body: BlockId, pair: ExitPair) -> Result<()> {
        if pair.status() != ExitStatus::Will {
            return Err(LoweringError::TargetNotExited { block: body });
        }
        let carried = self.graph.node(node).outputs.len();
        if pair.values.len() != carried + 2 {
            return Err(LoweringError::arity(
                format!("loop exit values of {}", node),
                carried + 2,
                pair.values.len(),
            ));
        }

        let did_break = pair.values[0];
        let cond = pair.values[1];
        self.graph.clear_block_outputs(body);

        if self.pool.is_false(did_break) {
            self.graph.register_block_output(body, cond);
            for &value in &pair.values[2..] {
                self.graph.register_block_output(body, value);
            }
            return Ok(());
        }

        let next_cond = self.select_false(body, did_break, cond)?;
        self.graph.register_block_output(body, next_cond);
        for &value in &pair.values[2..] {
            self.graph.register_block_output(body, value);
        }
        self.graph.register_block_output(body, did_break);

        let f = self.pool.bool(self.graph, false)?;
        self.graph.push_input(node, f);
        self.graph.add_block_param(body, Type::Bool);
        let out = self.graph.add_output(node, Type::Bool);
        self.graph.set_value_name(out, "did_break");
        self.result.bump("loops_with_break");
        Ok(())
    }

    /// A `return` inside a loop body: stop the loop when it fires and carry
    /// the sentinel and returned values out as loop outputs.
    fn carry_exit(&mut self, node: NodeId, body: BlockId, pair: ExitPair) -> Result<ExitPair> {
        let cond = *self
            .graph
            .block(body)
            .outputs
            .first()
            .ok_or_else(|| LoweringError::malformed(node, "loop body has no condition output"))?;

        let (next_cond, flag) = match pair.exited {
            Exited::Maybe(flag) => (self.select_false(body, flag, cond)?, flag),
            _ => (self.pool.bool(self.graph, false)?, self.pool.bool(self.graph, true)?),
        };
        self.graph.set_block_output(body, 0, next_cond);

        let f = self.pool.bool(self.graph, false)?;
        self.graph.push_input(node, f);
        self.graph.add_block_param(body, Type::Bool);
        self.graph.register_block_output(body, flag);
        let did_return = self.graph.add_output(node, Type::Bool);
        self.graph.set_value_name(did_return, "did_return");

        let mut values = Vec::with_capacity(pair.values.len());
        for value in pair.values {
            let ty = self.graph.value_type(value).clone();
            let placeholder = self.pool.placeholder(self.graph, &ty)?;
            self.graph.push_input(node, placeholder);
            self.graph.add_block_param(body, ty.clone());
            self.graph.register_block_output(body, value);
            values.push(self.graph.add_output(node, ty));
        }
        self.result.bump("loops_carrying_return");

        // Zero iterations never reach the exit, so the loop only MIGHT exit.
        Ok(ExitPair {
            exited: Exited::Maybe(did_return),
            values,
        })
    }

    // === Functions ===

    fn transform_function(&mut self, node: NodeId) -> Result<ExitPair> {
        let blocks = self.graph.node(node).blocks.to_vec();
        if blocks.len() != 1 {
            return Err(LoweringError::malformed(node, "function must own exactly one block"));
        }
        let body = blocks[0];
        let saved = match self.kind {
            ExitKind::Return => self.target.replace(body),
            ExitKind::Loop => self.target.take(),
        };
        let pair = self.scan_block(body, None)?;
        if self.kind == ExitKind::Return {
            self.absorb_values(body, pair)?;
        }
        self.target = saved;
        Ok(ExitPair::wont())
    }

    /// Install returned values as the outputs of a function or graph body.
    fn absorb_values(&mut self, block: BlockId, pair: ExitPair) -> Result<()> {
        if pair.status() != ExitStatus::Will {
            return Err(LoweringError::TargetNotExited { block });
        }
        self.graph.clear_block_outputs(block);
        for value in pair.values {
            self.graph.register_block_output(block, value);
        }
        Ok(())
    }
}

impl GraphPass for ExitEliminator {
    fn name(&self) -> &'static str {
        match self.kind {
            ExitKind::Loop => "loop-exit-elimination",
            ExitKind::Return => "return-elimination",
        }
    }

    fn run_on_graph(&mut self, graph: &mut Graph) -> Result<PassResult> {
        let root = graph.root();
        let mut cx = ExitContext {
            graph,
            kind: self.kind,
            target: None,
            pool: ConstantPool::new(),
            result: PassResult::unchanged(),
        };
        cx.seal_targets()?;

        match self.kind {
            ExitKind::Return => {
                cx.target = Some(root);
                let pair = cx.scan_block(root, None)?;
                cx.absorb_values(root, pair)?;
            }
            ExitKind::Loop => {
                cx.scan_block(root, None)?;
            }
        }

        cx.result.nodes_added += cx.pool.created();
        if self.prune_constants {
            let pruned = cx.pool.prune(cx.graph)?;
            cx.result.nodes_added -= pruned;
        }
        debug!("{}: {:?}", self.name(), cx.result.stats);
        Ok(cx.result)
    }

    fn postcondition(&self) -> VerifyOptions {
        match self.kind {
            ExitKind::Loop => VerifyOptions {
                allow_scope_ops: true,
                allow_loop_exits: false,
                allow_returns: true,
                require_inlined_loops: true,
            },
            ExitKind::Return => VerifyOptions::lowered(),
        }
    }
}
