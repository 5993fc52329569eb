//! Loop header inlining
//!
//! A frontend emits a loop's continuation test as a separate condition block
//! evaluated after each iteration. This pass moves the condition block's
//! nodes to the end of the body and makes its result body output 0, giving
//! every loop the single-block layout the later passes expect.

use super::{GraphPass, PassResult};
use crate::error::{LoweringError, Result};
use crate::ir::validation::VerifyOptions;
use crate::ir::{BlockId, Graph, InsertPoint, NodeId, NodeKind};
use log::debug;

pub struct LoopHeaderInliner;

impl LoopHeaderInliner {
    pub fn new() -> Self {
        Self
    }

    fn inline_block(&mut self, graph: &mut Graph, block: BlockId, result: &mut PassResult) -> Result<()> {
        let nodes = graph.block(block).nodes.clone();
        for node in nodes {
            let children = graph.node(node).blocks.to_vec();
            for child in children {
                self.inline_block(graph, child, result)?;
            }
            if *graph.kind(node) == NodeKind::Loop && graph.node(node).blocks.len() == 2 {
                inline_loop(graph, node)?;
                result.bump("loops_inlined");
            }
        }
        Ok(())
    }
}

impl Default for LoopHeaderInliner {
    fn default() -> Self {
        Self::new()
    }
}

fn inline_loop(graph: &mut Graph, node: NodeId) -> Result<()> {
    let body = graph.node(node).blocks[0];
    let header = graph.node(node).blocks[1];

    if !graph.block(header).params.is_empty() {
        return Err(LoweringError::malformed(node, "loop condition block takes parameters"));
    }
    let outputs = graph.block(header).outputs.clone();
    if outputs.len() != 1 {
        return Err(LoweringError::arity("loop condition block outputs", 1, outputs.len()));
    }

    let header_nodes = graph.block(header).nodes.clone();
    debug!("inlining {} condition node(s) into body of {}", header_nodes.len(), node);
    for moved in header_nodes {
        graph.move_node(moved, InsertPoint::BlockEnd(body))?;
    }
    graph.insert_block_output(body, 0, outputs[0]);
    graph.erase_block(node, 1)
}

impl GraphPass for LoopHeaderInliner {
    fn name(&self) -> &'static str {
        "loop-header-inlining"
    }

    fn run_on_graph(&mut self, graph: &mut Graph) -> Result<PassResult> {
        let mut result = PassResult::unchanged();
        let root = graph.root();
        self.inline_block(graph, root, &mut result)?;
        Ok(result)
    }

    fn postcondition(&self) -> VerifyOptions {
        VerifyOptions {
            require_inlined_loops: true,
            ..VerifyOptions::frontend()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::interp::{Interpreter, RtValue};
    use crate::ir::validation::verify;
    use crate::ir::{GraphBuilder, Operator, Type};
    use std::cell::Cell;

    /// `acc = 0; while acc < 10: acc = acc + 3`, as a frontend would lay it out
    /// without variables: the header recomputes the test from the body's result.
    fn counting_loop() -> Graph {
        let mut graph = Graph::new();
        let mut b = GraphBuilder::new(&mut graph);
        let trip = b.int(i64::MAX).unwrap();
        let init = b.bool(true).unwrap();
        let zero = b.int(0).unwrap();
        let next = Cell::new(None);
        let node = b
            .loop_with_header(
                trip,
                init,
                &[zero],
                |b, _, params| {
                    let three = b.int(3)?;
                    let sum = b.binary(Operator::Add, params[0], three)?;
                    next.set(Some(sum));
                    Ok(vec![sum])
                },
                |b| {
                    let ten = b.int(10)?;
                    b.binary(Operator::Lt, next.get().unwrap(), ten)
                },
            )
            .unwrap();
        let out = b.outputs(node)[0];
        graph.register_output(out);
        graph
    }

    #[test]
    fn test_inline_moves_condition_into_body() {
        let mut graph = counting_loop();
        let before = Interpreter::new(&graph).run(&[]).unwrap();

        let result = LoopHeaderInliner::new().run_on_graph(&mut graph).unwrap();
        assert_eq!(result.stat("loops_inlined"), 1);

        let node = graph.walk_nodes().into_iter().find(|&n| *graph.kind(n) == NodeKind::Loop).unwrap();
        assert_eq!(graph.node(node).blocks.len(), 1);
        let body = graph.block(graph.node(node).blocks[0]);
        assert_eq!(body.outputs.len(), 2);
        assert_eq!(graph.value_type(body.outputs[0]), &Type::Bool);

        assert!(verify(&graph, VerifyOptions::lowered()).is_empty());
        assert_eq!(Interpreter::new(&graph).run(&[]).unwrap(), before);
        assert_eq!(before, vec![RtValue::Int(12)]);
    }

    #[test]
    fn test_inline_is_idempotent() {
        let mut graph = counting_loop();
        let mut pass = LoopHeaderInliner::new();
        pass.run_on_graph(&mut graph).unwrap();
        let count = graph.node_count();
        let again = pass.run_on_graph(&mut graph).unwrap();
        assert!(!again.modified);
        assert_eq!(graph.node_count(), count);
    }

    #[test]
    fn test_nested_loop_in_condition_block() {
        let mut graph = Graph::new();
        let mut b = GraphBuilder::new(&mut graph);
        let trip = b.int(2).unwrap();
        let init = b.bool(true).unwrap();
        b.loop_with_header(
            trip,
            init,
            &[],
            |_, _, _| Ok(vec![]),
            |b| {
                let one = b.int(1)?;
                let t = b.bool(true)?;
                b.loop_with_header(one, t, &[], |_, _, _| Ok(vec![]), |b| b.bool(false))?;
                b.bool(true)
            },
        )
        .unwrap();

        let result = LoopHeaderInliner::new().run_on_graph(&mut graph).unwrap();
        assert_eq!(result.stat("loops_inlined"), 2);
        assert!(verify(&graph, VerifyOptions::lowered()).is_empty());
    }
}
