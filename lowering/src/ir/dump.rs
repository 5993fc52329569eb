//! Graph Dump Utility
//!
//! Pretty-prints a graph in an indented textual form:
//!
//! ```text
//! graph(%0 : bool):
//!   %1 : int = constant[value=1]()
//!   %2 : int = If(%0)
//!     block0():
//!       -> (%1)
//!     block1():
//!       -> (%1)
//!   return (%2)
//! ```

use super::{BlockId, Graph, NodeId, ValueId};
use std::fmt::Write;

/// Dump an entire graph to a string.
pub fn dump_graph(graph: &Graph) -> String {
    let mut out = String::new();
    let root = graph.block(graph.root());
    writeln!(out, "graph({}):", typed_list(graph, &root.params)).unwrap();
    for &node in &root.nodes {
        dump_node(graph, node, 1, &mut out);
    }
    writeln!(out, "  return ({})", value_list(graph, &root.outputs)).unwrap();
    out
}

fn dump_node(graph: &Graph, node: NodeId, depth: usize, out: &mut String) {
    let data = graph.node(node);
    let indent = "  ".repeat(depth);
    let lhs = typed_list(graph, &data.outputs);
    if lhs.is_empty() {
        write!(out, "{}= ", indent).unwrap();
    } else {
        write!(out, "{}{} = ", indent, lhs).unwrap();
    }
    writeln!(out, "{}({})", data.kind, value_list(graph, &data.inputs)).unwrap();
    for (i, &block) in data.blocks.iter().enumerate() {
        dump_block(graph, block, i, depth + 1, out);
    }
}

fn dump_block(graph: &Graph, block: BlockId, index: usize, depth: usize, out: &mut String) {
    let data = graph.block(block);
    let indent = "  ".repeat(depth);
    writeln!(out, "{}block{}({}):", indent, index, typed_list(graph, &data.params)).unwrap();
    for &node in &data.nodes {
        dump_node(graph, node, depth + 1, out);
    }
    writeln!(out, "{}  -> ({})", indent, value_list(graph, &data.outputs)).unwrap();
}

/// Format a value reference, e.g. `%x.4` or `%4`.
pub fn value_ref(graph: &Graph, value: ValueId) -> String {
    match graph.value_name(value) {
        Some(name) => format!("%{}.{}", name, value.as_u32()),
        None => value.to_string(),
    }
}

fn value_list(graph: &Graph, values: &[ValueId]) -> String {
    values
        .iter()
        .map(|&v| value_ref(graph, v))
        .collect::<Vec<_>>()
        .join(", ")
}

fn typed_list(graph: &Graph, values: &[ValueId]) -> String {
    values
        .iter()
        .map(|&v| format!("{} : {}", value_ref(graph, v), graph.value_type(v)))
        .collect::<Vec<_>>()
        .join(", ")
}
