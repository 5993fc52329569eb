use lowering::ir::interp::{Interpreter, RtValue};
use lowering::ir::validation::{verify, VerifyOptions};
use lowering::ir::{Graph, GraphBuilder, NodeKind, Operator, Type};
use lowering::pipeline::{lower_graph, lower_graphs, PipelineConfig};
use lowering::{LoweringError, Result};

/// b = 0
/// for i in range(n):
///     if i == 3:
///         b = 2
///         break
///     k = 1
/// return b
fn break_in_loop() -> Result<Graph> {
    let mut graph = Graph::new();
    let n = graph.add_input(Type::Int);
    let mut b = GraphBuilder::new(&mut graph);
    let zero = b.int(0)?;
    b.store("b", zero)?;
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
                    let two = b.int(2)?;
                    b.store("b", two)?;
                    b.brk(&[])?;
                    Ok(vec![])
                },
                |_| Ok(vec![]),
            )?;
            let one = b.int(1)?;
            b.store("k", one)?;
            Ok(vec![])
        },
        |b| b.bool(true),
    )?;
    let out = b.load("b", Type::Int)?;
    b.ret(&[out])?;
    Ok(graph)
}

/// if c: return 1
/// f()
/// return 2
fn early_return(c_is_constant: bool) -> Result<Graph> {
    let mut graph = Graph::new();
    let input = graph.add_input(Type::Bool);
    let mut b = GraphBuilder::new(&mut graph);
    let c = if c_is_constant { b.bool(true)? } else { input };
    b.if_else(
        c,
        |b| {
            let one = b.int(1)?;
            b.ret(&[one])?;
            Ok(vec![])
        },
        |_| Ok(vec![]),
    )?;
    b.call_void("f", &[])?;
    let two = b.int(2)?;
    b.ret(&[two])?;
    Ok(graph)
}

fn run(graph: &Graph, args: &[RtValue]) -> (Vec<RtValue>, Vec<String>) {
    let mut interp = Interpreter::new(graph);
    interp.register_host("f", |_| Ok(RtValue::None));
    let out = interp.run(args).unwrap();
    (out, interp.call_trace().to_vec())
}

fn assert_lowered(graph: &Graph) {
    let errors = verify(graph, VerifyOptions::lowered());
    assert!(errors.is_empty(), "{:?}", errors);
    assert_eq!(graph.count_nodes(NodeKind::is_exit), 0);
    assert_eq!(graph.count_nodes(NodeKind::is_scope_op), 0);
}

#[test]
fn test_break_in_loop_carries_did_break() {
    lowering::logging::init_test();
    let mut graph = break_in_loop().unwrap();
    let stats = lower_graph(&mut graph, &PipelineConfig::default()).unwrap();
    assert_lowered(&graph);

    assert_eq!(stats.report("loop-header-inlining").unwrap().result.stat("loops_inlined"), 1);
    assert_eq!(stats.report("loop-exit-elimination").unwrap().result.stat("loops_with_break"), 1);
    assert_eq!(stats.report("control-flow-decoration").unwrap().result.stat("loop_carried_added"), 1);

    let loops: Vec<_> = graph
        .walk_nodes()
        .into_iter()
        .filter(|&n| *graph.kind(n) == NodeKind::Loop)
        .collect();
    assert_eq!(loops.len(), 1);
    let names: Vec<_> = graph
        .node(loops[0])
        .outputs
        .iter()
        .filter_map(|&v| graph.value_name(v))
        .collect();
    assert!(names.iter().any(|n| n.starts_with("did_break")), "{:?}", names);
    assert!(names.iter().any(|n| *n == "b" || n.starts_with("b.")), "{:?}", names);
    assert!(!names.iter().any(|n| n.starts_with('k')), "{:?}", names);

    // Body output 0 is `if did_break { false } else { cond }`.
    let flag = graph
        .node(loops[0])
        .outputs
        .iter()
        .position(|&v| graph.value_name(v).map_or(false, |n| n.starts_with("did_break")))
        .unwrap();
    let body = graph.node(loops[0]).blocks[0];
    let body_outputs = graph.block(body).outputs.clone();
    let select = graph.producer(body_outputs[0]).unwrap();
    assert_eq!(*graph.kind(select), NodeKind::If);
    assert_eq!(graph.owning_block(select), Some(body));
    assert_eq!(graph.node(select).inputs[0], body_outputs[flag + 1]);
    let then_out = graph.block(graph.node(select).blocks[0]).outputs[0];
    let else_out = graph.block(graph.node(select).blocks[1]).outputs[0];
    assert_eq!(graph.constant_bool(then_out), Some(false));
    assert_ne!(else_out, then_out);

    assert_eq!(run(&graph, &[RtValue::Int(5)]).0, vec![RtValue::Int(2)]);
    assert_eq!(run(&graph, &[RtValue::Int(2)]).0, vec![RtValue::Int(0)]);
    assert_eq!(run(&graph, &[RtValue::Int(0)]).0, vec![RtValue::Int(0)]);
}

/// acc = 0
/// for i in range(n):
///     if i < 5:
///         if i == stop: break
///         y = i
///     else:
///         y = 0
///     acc = y
/// return acc
fn break_then_branch_local() -> Result<Graph> {
    let mut graph = Graph::new();
    let n = graph.add_input(Type::Int);
    let stop = graph.add_input(Type::Int);
    let mut b = GraphBuilder::new(&mut graph);
    let zero = b.int(0)?;
    b.store("acc", zero)?;
    let t = b.bool(true)?;
    b.loop_(n, t, &[], |b, i, _| {
        let five = b.int(5)?;
        let small = b.binary(Operator::Lt, i, five)?;
        b.if_else(
            small,
            |b| {
                let hit = b.binary(Operator::Eq, i, stop)?;
                b.if_else(
                    hit,
                    |b| {
                        b.brk(&[])?;
                        Ok(vec![])
                    },
                    |_| Ok(vec![]),
                )?;
                b.store("y", i)?;
                Ok(vec![])
            },
            |b| {
                let zero = b.int(0)?;
                b.store("y", zero)?;
                Ok(vec![])
            },
        )?;
        let y = b.load("y", Type::Int)?;
        b.store("acc", y)?;
        let more = b.bool(true)?;
        Ok((more, vec![]))
    })?;
    let acc = b.load("acc", Type::Int)?;
    b.ret(&[acc])?;
    Ok(graph)
}

#[test]
fn test_variable_defined_on_every_non_breaking_path() {
    let mut graph = break_then_branch_local().unwrap();
    lower_graph(&mut graph, &PipelineConfig::default()).unwrap();
    assert_lowered(&graph);

    for (n, stop, expected) in [(10, 3, 2), (4, 3, 2), (2, 3, 1), (0, 3, 0), (8, 100, 0), (3, 100, 2)] {
        let (out, _) = run(&graph, &[RtValue::Int(n), RtValue::Int(stop)]);
        assert_eq!(out, vec![RtValue::Int(expected)], "n={} stop={}", n, stop);
    }
}

#[test]
fn test_early_return_becomes_single_if() {
    let mut graph = early_return(false).unwrap();
    lower_graph(&mut graph, &PipelineConfig::default()).unwrap();
    assert_lowered(&graph);

    assert_eq!(graph.count_nodes(|k| *k == NodeKind::If), 1);
    assert_eq!(graph.outputs().len(), 1);
    let producer = graph.producer(graph.outputs()[0]).unwrap();
    assert_eq!(*graph.kind(producer), NodeKind::If);

    let (out, calls) = run(&graph, &[RtValue::Bool(true)]);
    assert_eq!(out, vec![RtValue::Int(1)]);
    assert!(calls.is_empty());

    let (out, calls) = run(&graph, &[RtValue::Bool(false)]);
    assert_eq!(out, vec![RtValue::Int(2)]);
    assert_eq!(calls, vec!["f".to_string()]);
}

#[test]
fn test_constant_condition_deletes_unreachable_code() {
    let mut graph = early_return(true).unwrap();
    let stats = lower_graph(&mut graph, &PipelineConfig::default()).unwrap();
    assert_lowered(&graph);

    assert!(stats.report("return-elimination").unwrap().result.stat("unreachable_nodes_deleted") > 0);
    assert_eq!(graph.count_nodes(|k| matches!(k, NodeKind::Op(Operator::Call(_)))), 0);

    let (out, calls) = run(&graph, &[RtValue::Bool(false)]);
    assert_eq!(out, vec![RtValue::Int(1)]);
    assert!(calls.is_empty());
}

#[test]
fn test_closure_with_locals_and_early_return() {
    // g = lambda x:
    //     y = x + 1
    //     if y > 3: return y
    //     return 0
    // return g(n)
    let mut graph = Graph::new();
    let n = graph.add_input(Type::Int);
    let mut b = GraphBuilder::new(&mut graph);
    let g = b
        .function(&[Type::Int], |b, params| {
            let one = b.int(1)?;
            let y = b.binary(Operator::Add, params[0], one)?;
            b.store("y", y)?;
            let three = b.int(3)?;
            let y = b.load("y", Type::Int)?;
            let big = b.binary(Operator::Gt, y, three)?;
            b.if_else(
                big,
                |b| {
                    let y = b.load("y", Type::Int)?;
                    b.ret(&[y])?;
                    Ok(vec![])
                },
                |_| Ok(vec![]),
            )?;
            let zero = b.int(0)?;
            b.ret(&[zero])?;
            Ok(vec![])
        })
        .unwrap();
    let call = b.apply(g, &[n], vec![Type::Int]).unwrap();
    let result = b.outputs(call)[0];
    b.ret(&[result]).unwrap();

    lower_graph(&mut graph, &PipelineConfig::default()).unwrap();
    assert_lowered(&graph);
    assert_eq!(run(&graph, &[RtValue::Int(5)]).0, vec![RtValue::Int(6)]);
    assert_eq!(run(&graph, &[RtValue::Int(1)]).0, vec![RtValue::Int(0)]);
}

#[test]
fn test_lowering_twice_is_stable() {
    let mut graph = break_in_loop().unwrap();
    let config = PipelineConfig::default();
    lower_graph(&mut graph, &config).unwrap();
    let loops = graph.count_nodes(|k| *k == NodeKind::Loop);

    lower_graph(&mut graph, &config).unwrap();
    assert_lowered(&graph);
    assert_eq!(graph.count_nodes(|k| *k == NodeKind::Loop), loops);
    assert_eq!(run(&graph, &[RtValue::Int(5)]).0, vec![RtValue::Int(2)]);
}

#[test]
fn test_unresolved_variable_is_fatal() {
    let mut graph = Graph::new();
    let mut b = GraphBuilder::new(&mut graph);
    let x = b.load("x", Type::Int).unwrap();
    b.ret(&[x]).unwrap();

    let result = lower_graph(&mut graph, &PipelineConfig::default());
    assert!(matches!(result, Err(LoweringError::UnresolvedVariable { ref name }) if name == "x"));
}

#[test]
fn test_config_without_renaming() {
    let config = PipelineConfig::from_toml_str("canonicalize_names = false\ndump_after_each_pass = true").unwrap();
    let mut graph = break_in_loop().unwrap();
    let stats = lower_graph(&mut graph, &config).unwrap();
    assert_lowered(&graph);
    assert_eq!(stats.report("ssa-construction").unwrap().result.stat("values_renamed"), 0);
    assert_eq!(run(&graph, &[RtValue::Int(4)]).0, vec![RtValue::Int(2)]);
}

#[test]
fn test_parallel_lowering() {
    let mut graphs: Vec<Graph> = (0..8)
        .map(|i| if i % 2 == 0 { break_in_loop() } else { early_return(false) })
        .collect::<Result<_>>()
        .unwrap();

    let results = lower_graphs(&mut graphs, &PipelineConfig::default());
    assert_eq!(results.len(), 8);
    for (i, (graph, result)) in graphs.iter().zip(&results).enumerate() {
        assert!(result.is_ok(), "graph {} failed: {:?}", i, result);
        assert_lowered(graph);
        if i % 2 == 0 {
            assert_eq!(run(graph, &[RtValue::Int(10)]).0, vec![RtValue::Int(2)]);
        } else {
            assert_eq!(run(graph, &[RtValue::Bool(true)]).0, vec![RtValue::Int(1)]);
        }
    }
}
