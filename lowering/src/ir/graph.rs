//! Graph arena
//!
//! Nodes, blocks and values are stored in flat vectors and addressed by
//! [`NodeId`], [`BlockId`] and [`ValueId`]. Destroyed entities are marked
//! dead and never reused, so handles stay stable for the lifetime of a graph.
//!
//! All mutation goes through methods on [`Graph`] so that the per-value use
//! lists stay consistent with node inputs and block outputs.

use super::{BlockId, Literal, NodeId, NodeKind, Operator, Type, ValueId};
use crate::error::{LoweringError, Result};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Where a value is defined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueDef {
    /// Output `index` of `node`
    Node { node: NodeId, index: usize },
    /// Parameter `index` of `block`
    Param { block: BlockId, index: usize },
}

/// Something that reads a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum User {
    /// A node input
    Node(NodeId),
    /// A block output
    Block(BlockId),
}

/// Position at which a detached node is placed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPoint {
    Before(NodeId),
    After(NodeId),
    BlockStart(BlockId),
    BlockEnd(BlockId),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeData {
    pub kind: NodeKind,
    pub inputs: SmallVec<[ValueId; 4]>,
    pub outputs: SmallVec<[ValueId; 4]>,
    pub blocks: SmallVec<[BlockId; 2]>,
    /// Block the node is placed in; `None` while detached
    pub owner: Option<BlockId>,
    pub live: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockData {
    pub params: Vec<ValueId>,
    pub nodes: Vec<NodeId>,
    pub outputs: Vec<ValueId>,
    /// Owning node; `None` for the graph body
    pub owner: Option<NodeId>,
    pub live: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueData {
    pub ty: Type,
    pub def: ValueDef,
    /// One entry per operand occurrence
    pub uses: Vec<User>,
    /// Debug name
    pub name: Option<String>,
    pub live: bool,
}

/// A block-structured graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Graph {
    nodes: Vec<NodeData>,
    blocks: Vec<BlockData>,
    values: Vec<ValueData>,
    root: BlockId,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    /// Create an empty graph with no inputs or outputs
    pub fn new() -> Self {
        let mut graph = Self {
            nodes: Vec::new(),
            blocks: Vec::new(),
            values: Vec::new(),
            root: BlockId::new(0),
        };
        graph.root = graph.alloc_block(None);
        graph
    }

    fn alloc_block(&mut self, owner: Option<NodeId>) -> BlockId {
        let id = BlockId::new(self.blocks.len() as u32);
        self.blocks.push(BlockData {
            params: Vec::new(),
            nodes: Vec::new(),
            outputs: Vec::new(),
            owner,
            live: true,
        });
        id
    }

    fn alloc_value(&mut self, ty: Type, def: ValueDef) -> ValueId {
        let id = ValueId::new(self.values.len() as u32);
        self.values.push(ValueData {
            ty,
            def,
            uses: Vec::new(),
            name: None,
            live: true,
        });
        id
    }

    // === Accessors ===

    /// The graph body
    pub fn root(&self) -> BlockId {
        self.root
    }

    pub fn inputs(&self) -> &[ValueId] {
        &self.blocks[self.root.index()].params
    }

    pub fn outputs(&self) -> &[ValueId] {
        &self.blocks[self.root.index()].outputs
    }

    pub fn node(&self, id: NodeId) -> &NodeData {
        &self.nodes[id.index()]
    }

    pub fn block(&self, id: BlockId) -> &BlockData {
        &self.blocks[id.index()]
    }

    pub fn value(&self, id: ValueId) -> &ValueData {
        &self.values[id.index()]
    }

    pub fn kind(&self, node: NodeId) -> &NodeKind {
        &self.nodes[node.index()].kind
    }

    pub fn value_type(&self, value: ValueId) -> &Type {
        &self.values[value.index()].ty
    }

    pub fn value_name(&self, value: ValueId) -> Option<&str> {
        self.values[value.index()].name.as_deref()
    }

    pub fn set_value_name(&mut self, value: ValueId, name: impl Into<String>) {
        self.values[value.index()].name = Some(name.into());
    }

    pub fn use_count(&self, value: ValueId) -> usize {
        self.values[value.index()].uses.len()
    }

    /// The node defining `value`, if it is a node output
    pub fn producer(&self, value: ValueId) -> Option<NodeId> {
        match self.values[value.index()].def {
            ValueDef::Node { node, .. } => Some(node),
            ValueDef::Param { .. } => None,
        }
    }

    /// Block the node is placed in
    pub fn owning_block(&self, node: NodeId) -> Option<BlockId> {
        self.nodes[node.index()].owner
    }

    /// Node owning the block; `None` for the graph body
    pub fn owning_node(&self, block: BlockId) -> Option<NodeId> {
        self.blocks[block.index()].owner
    }

    /// If `value` is a boolean constant, its literal value
    pub fn constant_bool(&self, value: ValueId) -> Option<bool> {
        let node = self.producer(value)?;
        match &self.nodes[node.index()].kind {
            NodeKind::Op(Operator::Constant(Literal::Bool(b))) => Some(*b),
            _ => None,
        }
    }

    // === Construction ===

    /// Append a graph input
    pub fn add_input(&mut self, ty: Type) -> ValueId {
        self.add_block_param(self.root, ty)
    }

    /// Append a graph output
    pub fn register_output(&mut self, value: ValueId) -> usize {
        self.register_block_output(self.root, value)
    }

    /// Create a detached node. It must be placed with [`Graph::insert`]
    /// before it becomes part of the program.
    pub fn create_node(&mut self, kind: NodeKind, inputs: &[ValueId], output_types: Vec<Type>) -> NodeId {
        let id = NodeId::new(self.nodes.len() as u32);
        self.nodes.push(NodeData {
            kind,
            inputs: inputs.iter().copied().collect(),
            outputs: SmallVec::new(),
            blocks: SmallVec::new(),
            owner: None,
            live: true,
        });
        for &input in inputs {
            self.values[input.index()].uses.push(User::Node(id));
        }
        for ty in output_types {
            self.add_output(id, ty);
        }
        id
    }

    pub fn add_output(&mut self, node: NodeId, ty: Type) -> ValueId {
        let index = self.nodes[node.index()].outputs.len();
        let value = self.alloc_value(ty, ValueDef::Node { node, index });
        self.nodes[node.index()].outputs.push(value);
        value
    }

    /// Add a nested block to `node`
    pub fn add_block(&mut self, node: NodeId) -> BlockId {
        let block = self.alloc_block(Some(node));
        self.nodes[node.index()].blocks.push(block);
        block
    }

    pub fn add_block_param(&mut self, block: BlockId, ty: Type) -> ValueId {
        let index = self.blocks[block.index()].params.len();
        let value = self.alloc_value(ty, ValueDef::Param { block, index });
        self.blocks[block.index()].params.push(value);
        value
    }

    pub fn push_input(&mut self, node: NodeId, value: ValueId) {
        self.nodes[node.index()].inputs.push(value);
        self.values[value.index()].uses.push(User::Node(node));
    }

    pub fn set_input(&mut self, node: NodeId, index: usize, value: ValueId) {
        let old = self.nodes[node.index()].inputs[index];
        if old == value {
            return;
        }
        self.remove_use(old, User::Node(node));
        self.nodes[node.index()].inputs[index] = value;
        self.values[value.index()].uses.push(User::Node(node));
    }

    fn remove_use(&mut self, value: ValueId, user: User) {
        let uses = &mut self.values[value.index()].uses;
        if let Some(pos) = uses.iter().position(|u| *u == user) {
            uses.swap_remove(pos);
        }
    }

    // === Block outputs ===

    pub fn register_block_output(&mut self, block: BlockId, value: ValueId) -> usize {
        let outputs = &mut self.blocks[block.index()].outputs;
        outputs.push(value);
        self.values[value.index()].uses.push(User::Block(block));
        self.blocks[block.index()].outputs.len() - 1
    }

    pub fn insert_block_output(&mut self, block: BlockId, index: usize, value: ValueId) {
        self.blocks[block.index()].outputs.insert(index, value);
        self.values[value.index()].uses.push(User::Block(block));
    }

    pub fn set_block_output(&mut self, block: BlockId, index: usize, value: ValueId) {
        let old = self.blocks[block.index()].outputs[index];
        if old == value {
            return;
        }
        self.remove_use(old, User::Block(block));
        self.blocks[block.index()].outputs[index] = value;
        self.values[value.index()].uses.push(User::Block(block));
    }

    pub fn erase_block_output(&mut self, block: BlockId, index: usize) {
        let old = self.blocks[block.index()].outputs.remove(index);
        self.remove_use(old, User::Block(block));
    }

    /// Remove every output of `block`, returning the old outputs
    pub fn clear_block_outputs(&mut self, block: BlockId) -> Vec<ValueId> {
        let old = std::mem::take(&mut self.blocks[block.index()].outputs);
        for &value in &old {
            self.remove_use(value, User::Block(block));
        }
        old
    }

    // === Placement ===

    /// Place a detached node
    pub fn insert(&mut self, node: NodeId, at: InsertPoint) -> Result<()> {
        if self.nodes[node.index()].owner.is_some() {
            return Err(LoweringError::malformed(node, "node is already placed in a block"));
        }
        let (block, pos) = self.resolve(at)?;
        self.blocks[block.index()].nodes.insert(pos, node);
        self.nodes[node.index()].owner = Some(block);
        Ok(())
    }

    /// Move a placed (or detached) node to a new position
    pub fn move_node(&mut self, node: NodeId, at: InsertPoint) -> Result<()> {
        self.detach(node);
        self.insert(node, at)
    }

    fn resolve(&self, at: InsertPoint) -> Result<(BlockId, usize)> {
        match at {
            InsertPoint::BlockStart(block) => Ok((block, 0)),
            InsertPoint::BlockEnd(block) => Ok((block, self.blocks[block.index()].nodes.len())),
            InsertPoint::Before(anchor) => self
                .position(anchor)
                .ok_or_else(|| LoweringError::malformed(anchor, "insertion anchor is detached")),
            InsertPoint::After(anchor) => self
                .position(anchor)
                .map(|(block, idx)| (block, idx + 1))
                .ok_or_else(|| LoweringError::malformed(anchor, "insertion anchor is detached")),
        }
    }

    fn detach(&mut self, node: NodeId) {
        if let Some((block, idx)) = self.position(node) {
            self.blocks[block.index()].nodes.remove(idx);
        }
        self.nodes[node.index()].owner = None;
    }

    /// Block and index of a placed node
    pub fn position(&self, node: NodeId) -> Option<(BlockId, usize)> {
        let block = self.nodes[node.index()].owner?;
        let idx = self.blocks[block.index()].nodes.iter().position(|&n| n == node)?;
        Some((block, idx))
    }

    pub fn first_node(&self, block: BlockId) -> Option<NodeId> {
        self.blocks[block.index()].nodes.first().copied()
    }

    pub fn last_node(&self, block: BlockId) -> Option<NodeId> {
        self.blocks[block.index()].nodes.last().copied()
    }

    pub fn next_node(&self, node: NodeId) -> Option<NodeId> {
        let (block, idx) = self.position(node)?;
        self.blocks[block.index()].nodes.get(idx + 1).copied()
    }

    /// Nodes following `node` in its block, in order
    pub fn nodes_after(&self, node: NodeId) -> Vec<NodeId> {
        match self.position(node) {
            Some((block, idx)) => self.blocks[block.index()].nodes[idx + 1..].to_vec(),
            None => Vec::new(),
        }
    }

    // === Rewriting ===

    /// Redirect every use of `old` to `new`
    pub fn replace_all_uses_with(&mut self, old: ValueId, new: ValueId) {
        if old == new {
            return;
        }
        let uses = std::mem::take(&mut self.values[old.index()].uses);
        let mut visited: SmallVec<[User; 8]> = SmallVec::new();
        for &user in &uses {
            if visited.contains(&user) {
                continue;
            }
            visited.push(user);
            match user {
                User::Node(node) => {
                    for input in self.nodes[node.index()].inputs.iter_mut() {
                        if *input == old {
                            *input = new;
                        }
                    }
                }
                User::Block(block) => {
                    for output in self.blocks[block.index()].outputs.iter_mut() {
                        if *output == old {
                            *output = new;
                        }
                    }
                }
            }
        }
        self.values[new.index()].uses.extend(uses);
    }

    /// Destroy a node together with its nested blocks.
    ///
    /// Fails if any output of the node is still used.
    pub fn destroy_node(&mut self, node: NodeId) -> Result<()> {
        for &output in &self.nodes[node.index()].outputs {
            let uses = self.values[output.index()].uses.len();
            if uses > 0 {
                return Err(LoweringError::DanglingUse {
                    node,
                    value: output,
                    uses,
                });
            }
        }

        let blocks: Vec<BlockId> = self.nodes[node.index()].blocks.iter().rev().copied().collect();
        for block in blocks {
            self.destroy_block(block)?;
        }

        let inputs = std::mem::take(&mut self.nodes[node.index()].inputs);
        for input in inputs {
            self.remove_use(input, User::Node(node));
        }
        self.detach(node);

        let data = &mut self.nodes[node.index()];
        data.live = false;
        data.blocks.clear();
        let outputs = data.outputs.clone();
        for output in outputs {
            self.values[output.index()].live = false;
        }
        Ok(())
    }

    fn destroy_block(&mut self, block: BlockId) -> Result<()> {
        self.clear_block_outputs(block);
        let nodes: Vec<NodeId> = self.blocks[block.index()].nodes.iter().rev().copied().collect();
        for node in nodes {
            self.destroy_node(node)?;
        }
        let params = self.blocks[block.index()].params.clone();
        for param in params {
            self.values[param.index()].live = false;
        }
        self.blocks[block.index()].live = false;
        Ok(())
    }

    /// Destroy nested block `index` of `node`
    pub fn erase_block(&mut self, node: NodeId, index: usize) -> Result<()> {
        let block = self.nodes[node.index()].blocks[index];
        self.destroy_block(block)?;
        self.nodes[node.index()].blocks.remove(index);
        Ok(())
    }

    // === Traversal ===

    /// All placed nodes in pre-order (a node before the nodes of its blocks)
    pub fn walk_nodes(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.walk_block_into(self.root, &mut out);
        out
    }

    /// All nodes nested in `block`, in pre-order
    pub fn walk_block(&self, block: BlockId) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.walk_block_into(block, &mut out);
        out
    }

    fn walk_block_into(&self, block: BlockId, out: &mut Vec<NodeId>) {
        for &node in &self.blocks[block.index()].nodes {
            out.push(node);
            for &child in &self.nodes[node.index()].blocks {
                self.walk_block_into(child, out);
            }
        }
    }

    /// Number of placed nodes
    pub fn node_count(&self) -> usize {
        self.walk_nodes().len()
    }

    /// Count placed nodes satisfying `pred`
    pub fn count_nodes(&self, pred: impl Fn(&NodeKind) -> bool) -> usize {
        self.walk_nodes()
            .into_iter()
            .filter(|&n| pred(&self.nodes[n.index()].kind))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constant(graph: &mut Graph, value: i64) -> (NodeId, ValueId) {
        let node = graph.create_node(
            NodeKind::Op(Operator::Constant(Literal::Int(value))),
            &[],
            vec![Type::Int],
        );
        graph.insert(node, InsertPoint::BlockEnd(graph.root())).unwrap();
        (node, graph.node(node).outputs[0])
    }

    #[test]
    fn test_use_lists_follow_inputs() {
        let mut graph = Graph::new();
        let (_, a) = constant(&mut graph, 1);
        let add = graph.create_node(NodeKind::Op(Operator::Add), &[a, a], vec![Type::Int]);
        graph.insert(add, InsertPoint::BlockEnd(graph.root())).unwrap();
        assert_eq!(graph.use_count(a), 2);

        let (_, b) = constant(&mut graph, 2);
        graph.set_input(add, 1, b);
        assert_eq!(graph.use_count(a), 1);
        assert_eq!(graph.use_count(b), 1);
    }

    #[test]
    fn test_replace_all_uses_moves_every_occurrence() {
        let mut graph = Graph::new();
        let (_, a) = constant(&mut graph, 1);
        let (_, b) = constant(&mut graph, 2);
        let add = graph.create_node(NodeKind::Op(Operator::Add), &[a, a], vec![Type::Int]);
        graph.insert(add, InsertPoint::BlockEnd(graph.root())).unwrap();
        graph.register_output(a);

        graph.replace_all_uses_with(a, b);
        assert_eq!(graph.use_count(a), 0);
        assert_eq!(graph.use_count(b), 3);
        assert_eq!(graph.node(add).inputs.as_slice(), &[b, b]);
        assert_eq!(graph.outputs(), &[b]);
    }

    #[test]
    fn test_destroy_refuses_used_outputs() {
        let mut graph = Graph::new();
        let (node, a) = constant(&mut graph, 1);
        graph.register_output(a);
        assert!(matches!(
            graph.destroy_node(node),
            Err(LoweringError::DanglingUse { .. })
        ));
        graph.clear_block_outputs(graph.root());
        graph.destroy_node(node).unwrap();
        assert_eq!(graph.node_count(), 0);
        assert!(!graph.value(a).live);
    }

    #[test]
    fn test_destroy_nested_blocks_drops_uses() {
        let mut graph = Graph::new();
        let cond = graph.add_input(Type::Bool);
        let (_, a) = constant(&mut graph, 1);
        let if_node = graph.create_node(NodeKind::If, &[cond], vec![]);
        graph.insert(if_node, InsertPoint::BlockEnd(graph.root())).unwrap();
        let then_block = graph.add_block(if_node);
        graph.add_block(if_node);
        let neg = graph.create_node(NodeKind::Op(Operator::Neg), &[a], vec![Type::Int]);
        graph.insert(neg, InsertPoint::BlockEnd(then_block)).unwrap();
        assert_eq!(graph.use_count(a), 1);

        graph.destroy_node(if_node).unwrap();
        assert_eq!(graph.use_count(a), 0);
        assert_eq!(graph.use_count(cond), 0);
        assert!(!graph.block(then_block).live);
    }

    #[test]
    fn test_placement_and_cursor() {
        let mut graph = Graph::new();
        let (first, _) = constant(&mut graph, 1);
        let (third, _) = constant(&mut graph, 3);
        let second = graph.create_node(
            NodeKind::Op(Operator::Constant(Literal::Int(2))),
            &[],
            vec![Type::Int],
        );
        graph.insert(second, InsertPoint::After(first)).unwrap();
        assert_eq!(graph.next_node(first), Some(second));
        assert_eq!(graph.nodes_after(first), vec![second, third]);

        graph.move_node(third, InsertPoint::BlockStart(graph.root())).unwrap();
        assert_eq!(graph.first_node(graph.root()), Some(third));
        assert!(graph.insert(third, InsertPoint::BlockEnd(graph.root())).is_err());
    }

    #[test]
    fn test_constant_bool() {
        let mut graph = Graph::new();
        let node = graph.create_node(
            NodeKind::Op(Operator::Constant(Literal::Bool(true))),
            &[],
            vec![Type::Bool],
        );
        let value = graph.node(node).outputs[0];
        assert_eq!(graph.constant_bool(value), Some(true));
        let param = graph.add_input(Type::Bool);
        assert_eq!(graph.constant_bool(param), None);
    }
}
