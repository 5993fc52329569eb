//! Builds a small loop with an early `break`, lowers it and prints the
//! graph before and after.
//!
//! ```bash
//! RUST_LOG=debug cargo run --bin lower_demo -- 5
//! ```

use lowering::ir::dump::dump_graph;
use lowering::ir::interp::{Interpreter, RtValue};
use lowering::ir::{Graph, GraphBuilder, Operator, Type};
use lowering::{logging, lower_graph, PipelineConfig, Result};

/// total = 0
/// for i in range(n):
///     if i == 3:
///         break
///     total = total + i
/// return total
fn build() -> Result<Graph> {
    let mut graph = Graph::new();
    let n = graph.add_input(Type::Int);
    let mut b = GraphBuilder::new(&mut graph);
    let zero = b.int(0)?;
    b.store("total", zero)?;
    let t = b.bool(true)?;
    b.loop_with_header(
        n,
        t,
        &[],
        |b, i, _| {
            let three = b.int(3)?;
            let hit = b.binary(Operator::Eq, i, three)?;
            b.if_else(
                hit,
                |b| {
                    b.brk(&[])?;
                    Ok(vec![])
                },
                |_| Ok(vec![]),
            )?;
            let total = b.load("total", Type::Int)?;
            let next = b.binary(Operator::Add, total, i)?;
            b.store("total", next)?;
            Ok(vec![])
        },
        |b| b.bool(true),
    )?;
    let total = b.load("total", Type::Int)?;
    b.ret(&[total])?;
    Ok(graph)
}

fn main() {
    logging::init_from_env();

    let n: i64 = match std::env::args().nth(1).map(|arg| arg.parse()) {
        None => 10,
        Some(Ok(n)) => n,
        Some(Err(e)) => {
            eprintln!("invalid trip count: {}", e);
            std::process::exit(2);
        }
    };

    let mut graph = match build() {
        Ok(graph) => graph,
        Err(e) => {
            eprintln!("failed to build graph: {}", e);
            std::process::exit(1);
        }
    };
    println!("=== before ===\n{}", dump_graph(&graph));

    let config = PipelineConfig::default();
    let stats = match lower_graph(&mut graph, &config) {
        Ok(stats) => stats,
        Err(e) => {
            eprintln!("lowering failed: {}", e);
            std::process::exit(1);
        }
    };
    println!("=== after ===\n{}", dump_graph(&graph));
    println!("{}", stats.summary());

    let mut interp = Interpreter::new(&graph);
    match interp.run(&[RtValue::Int(n)]) {
        Ok(values) => {
            let shown: Vec<String> = values.iter().map(|v| v.to_string()).collect();
            println!("result(n={}) = ({})", n, shown.join(", "));
        }
        Err(e) => {
            eprintln!("evaluation failed: {}", e);
            std::process::exit(1);
        }
    }
}
