//! Graph Builder
//!
//! Insertion-point based construction of graphs. A builder places every node
//! it creates at its current insertion point and then advances past it, so a
//! sequence of calls produces nodes in program order.

use tracing::trace;

use super::{unify, BlockId, Graph, InsertPoint, Literal, NodeId, NodeKind, Operator, Type, ValueId};
use crate::error::{LoweringError, Result};

/// Builder for graph construction
pub struct GraphBuilder<'g> {
    graph: &'g mut Graph,
    point: InsertPoint,
}

impl<'g> GraphBuilder<'g> {
    /// Builder appending to the graph body
    pub fn new(graph: &'g mut Graph) -> Self {
        let point = InsertPoint::BlockEnd(graph.root());
        Self { graph, point }
    }

    /// Builder inserting at `point`
    pub fn at(graph: &'g mut Graph, point: InsertPoint) -> Self {
        Self { graph, point }
    }

    pub fn graph(&mut self) -> &mut Graph {
        self.graph
    }

    pub fn insertion_point(&self) -> InsertPoint {
        self.point
    }

    pub fn set_insertion_point(&mut self, point: InsertPoint) {
        self.point = point;
    }

    fn nested(&mut self, block: BlockId) -> GraphBuilder<'_> {
        GraphBuilder {
            graph: &mut *self.graph,
            point: InsertPoint::BlockEnd(block),
        }
    }

    /// Create a node and place it at the insertion point
    pub fn insert(&mut self, kind: NodeKind, inputs: &[ValueId], output_types: Vec<Type>) -> Result<NodeId> {
        let node = self.graph.create_node(kind, inputs, output_types);
        self.graph.insert(node, self.point)?;
        trace!("inserted {} {}", node, self.graph.kind(node));
        self.point = InsertPoint::After(node);
        Ok(node)
    }

    fn single(&mut self, kind: NodeKind, inputs: &[ValueId], ty: Type) -> Result<ValueId> {
        let node = self.insert(kind, inputs, vec![ty])?;
        Ok(self.graph.node(node).outputs[0])
    }

    // === Values ===

    pub fn constant(&mut self, literal: Literal) -> Result<ValueId> {
        let ty = match &literal {
            Literal::Bool(_) => Type::Bool,
            Literal::Int(_) => Type::Int,
            Literal::Float(_) => Type::Float,
            Literal::Str(_) => Type::Str,
            Literal::None => Type::None,
        };
        self.single(NodeKind::Op(Operator::Constant(literal)), &[], ty)
    }

    pub fn int(&mut self, value: i64) -> Result<ValueId> {
        self.constant(Literal::Int(value))
    }

    pub fn bool(&mut self, value: bool) -> Result<ValueId> {
        self.constant(Literal::Bool(value))
    }

    pub fn float(&mut self, value: f64) -> Result<ValueId> {
        self.constant(Literal::Float(value))
    }

    pub fn string(&mut self, value: &str) -> Result<ValueId> {
        self.constant(Literal::Str(value.to_string()))
    }

    pub fn uninitialized(&mut self, ty: Type) -> Result<ValueId> {
        self.single(NodeKind::Op(Operator::Uninitialized), &[], ty)
    }

    /// An operator with a single result of type `ty`
    pub fn op(&mut self, op: Operator, inputs: &[ValueId], ty: Type) -> Result<ValueId> {
        self.single(NodeKind::Op(op), inputs, ty)
    }

    /// A binary operator; the result type follows the operands
    pub fn binary(&mut self, op: Operator, lhs: ValueId, rhs: ValueId) -> Result<ValueId> {
        let ty = match op {
            Operator::Eq
            | Operator::Ne
            | Operator::Lt
            | Operator::Le
            | Operator::Gt
            | Operator::Ge
            | Operator::And
            | Operator::Or => Type::Bool,
            _ => {
                let (l, r) = (self.graph.value_type(lhs), self.graph.value_type(rhs));
                if *l == Type::Float || *r == Type::Float {
                    Type::Float
                } else {
                    l.clone()
                }
            }
        };
        self.op(op, &[lhs, rhs], ty)
    }

    pub fn not(&mut self, value: ValueId) -> Result<ValueId> {
        self.op(Operator::Not, &[value], Type::Bool)
    }

    /// Call a host function returning one value
    pub fn call(&mut self, name: &str, args: &[ValueId], ret: Type) -> Result<ValueId> {
        self.single(NodeKind::Op(Operator::Call(name.to_string())), args, ret)
    }

    /// Call a host function for its side effects
    pub fn call_void(&mut self, name: &str, args: &[ValueId]) -> Result<NodeId> {
        self.insert(NodeKind::Op(Operator::Call(name.to_string())), args, vec![])
    }

    /// Call a closure produced by [`GraphBuilder::function`]
    pub fn apply(&mut self, closure: ValueId, args: &[ValueId], ret: Vec<Type>) -> Result<NodeId> {
        let mut inputs = Vec::with_capacity(args.len() + 1);
        inputs.push(closure);
        inputs.extend_from_slice(args);
        self.insert(NodeKind::Op(Operator::Apply), &inputs, ret)
    }

    // === Variables and exits ===

    pub fn load(&mut self, name: &str, ty: Type) -> Result<ValueId> {
        let value = self.single(NodeKind::Load(name.to_string()), &[], ty)?;
        self.graph.set_value_name(value, name);
        Ok(value)
    }

    pub fn store(&mut self, name: &str, value: ValueId) -> Result<NodeId> {
        self.insert(NodeKind::Store(name.to_string()), &[value], vec![])
    }

    pub fn ret(&mut self, values: &[ValueId]) -> Result<NodeId> {
        self.insert(NodeKind::Return, values, vec![])
    }

    pub fn brk(&mut self, carried: &[ValueId]) -> Result<NodeId> {
        self.insert(NodeKind::Break, carried, vec![])
    }

    pub fn cont(&mut self, cond: ValueId, carried: &[ValueId]) -> Result<NodeId> {
        let mut inputs = Vec::with_capacity(carried.len() + 1);
        inputs.push(cond);
        inputs.extend_from_slice(carried);
        self.insert(NodeKind::Continue, &inputs, vec![])
    }

    // === Structured control flow ===

    /// Build an `If`. Each closure fills one branch and returns its outputs;
    /// the node's outputs take the joined types.
    pub fn if_else<T, E>(&mut self, cond: ValueId, then_fn: T, else_fn: E) -> Result<NodeId>
    where
        T: FnOnce(&mut GraphBuilder<'_>) -> Result<Vec<ValueId>>,
        E: FnOnce(&mut GraphBuilder<'_>) -> Result<Vec<ValueId>>,
    {
        let node = self.insert(NodeKind::If, &[cond], vec![])?;
        let then_block = self.graph.add_block(node);
        let else_block = self.graph.add_block(node);

        let then_outs = then_fn(&mut self.nested(then_block))?;
        let else_outs = else_fn(&mut self.nested(else_block))?;
        if then_outs.len() != else_outs.len() {
            return Err(LoweringError::arity("if branches", then_outs.len(), else_outs.len()));
        }

        for (i, (&t, &e)) in then_outs.iter().zip(&else_outs).enumerate() {
            let (tt, et) = (self.graph.value_type(t), self.graph.value_type(e));
            let ty = unify(tt, et).ok_or_else(|| LoweringError::UnificationFailed {
                name: format!("if output {}", i),
                left: tt.to_string(),
                right: et.to_string(),
            })?;
            self.graph.register_block_output(then_block, t);
            self.graph.register_block_output(else_block, e);
            self.graph.add_output(node, ty);
        }
        Ok(node)
    }

    /// Build an inlined `Loop`. The body closure receives the iteration
    /// counter and the carried parameters and returns the continuation
    /// condition and the next carried values.
    pub fn loop_<F>(&mut self, trip_count: ValueId, cond: ValueId, carried: &[ValueId], body_fn: F) -> Result<NodeId>
    where
        F: FnOnce(&mut GraphBuilder<'_>, ValueId, &[ValueId]) -> Result<(ValueId, Vec<ValueId>)>,
    {
        let (node, body, iter, params) = self.loop_skeleton(trip_count, cond, carried)?;
        let (next_cond, next) = body_fn(&mut self.nested(body), iter, &params)?;
        if next.len() != carried.len() {
            return Err(LoweringError::arity("loop body", carried.len(), next.len()));
        }
        self.graph.register_block_output(body, next_cond);
        for value in next {
            self.graph.register_block_output(body, value);
        }
        Ok(node)
    }

    /// Build a `Loop` with a separate condition block, as a frontend emits
    /// it before header inlining.
    pub fn loop_with_header<F, C>(
        &mut self,
        trip_count: ValueId,
        cond: ValueId,
        carried: &[ValueId],
        body_fn: F,
        cond_fn: C,
    ) -> Result<NodeId>
    where
        F: FnOnce(&mut GraphBuilder<'_>, ValueId, &[ValueId]) -> Result<Vec<ValueId>>,
        C: FnOnce(&mut GraphBuilder<'_>) -> Result<ValueId>,
    {
        let (node, body, iter, params) = self.loop_skeleton(trip_count, cond, carried)?;
        let next = body_fn(&mut self.nested(body), iter, &params)?;
        if next.len() != carried.len() {
            return Err(LoweringError::arity("loop body", carried.len(), next.len()));
        }
        for value in next {
            self.graph.register_block_output(body, value);
        }
        let header = self.graph.add_block(node);
        let next_cond = cond_fn(&mut self.nested(header))?;
        self.graph.register_block_output(header, next_cond);
        Ok(node)
    }

    fn loop_skeleton(
        &mut self,
        trip_count: ValueId,
        cond: ValueId,
        carried: &[ValueId],
    ) -> Result<(NodeId, BlockId, ValueId, Vec<ValueId>)> {
        let mut inputs = vec![trip_count, cond];
        inputs.extend_from_slice(carried);
        let types: Vec<Type> = carried.iter().map(|&v| self.graph.value_type(v).clone()).collect();

        let node = self.insert(NodeKind::Loop, &inputs, types.clone())?;
        let body = self.graph.add_block(node);
        let iter = self.graph.add_block_param(body, Type::Int);
        let params = types
            .into_iter()
            .map(|ty| self.graph.add_block_param(body, ty))
            .collect();
        Ok((node, body, iter, params))
    }

    /// Build a closure. Returns the `Function` value.
    pub fn function<F>(&mut self, param_types: &[Type], body_fn: F) -> Result<ValueId>
    where
        F: FnOnce(&mut GraphBuilder<'_>, &[ValueId]) -> Result<Vec<ValueId>>,
    {
        let node = self.insert(NodeKind::Function, &[], vec![Type::Function])?;
        let body = self.graph.add_block(node);
        let params: Vec<ValueId> = param_types
            .iter()
            .map(|ty| self.graph.add_block_param(body, ty.clone()))
            .collect();
        let outs = body_fn(&mut self.nested(body), &params)?;
        for value in outs {
            self.graph.register_block_output(body, value);
        }
        Ok(self.graph.node(node).outputs[0])
    }

    /// Outputs of a node built earlier
    pub fn outputs(&self, node: NodeId) -> Vec<ValueId> {
        self.graph.node(node).outputs.to_vec()
    }
}
