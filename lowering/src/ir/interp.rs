//! Reference Interpreter
//!
//! Evaluates a graph directly, block by block. It understands every
//! structured construct (`If`, both loop layouts, closures) but not
//! variable scope operations or exit statements, so it can run a graph
//! before or after lowering but never in the middle of a pass.
//!
//! ## Design
//! - Values are stored per [`ValueId`]; SSA form means one slot per value
//! - Host functions are registered by name and every call is recorded, so
//!   tests can observe which side effects a lowered graph still performs
//! - Placeholder values may flow through block outputs and loop-carried
//!   slots, but reading one as an operand is an error

use super::{BlockId, Graph, Literal, NodeId, NodeKind, Operator, ValueId};
use fxhash::FxHashMap;
use std::fmt;
use thiserror::Error;

/// Runtime value
#[derive(Debug, Clone, PartialEq)]
pub enum RtValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    None,
    /// Produced by a placeholder; must never be observed
    Uninit,
    /// Closure defined by a `Function` node
    Closure(NodeId),
}

impl fmt::Display for RtValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RtValue::Bool(b) => write!(f, "{}", b),
            RtValue::Int(i) => write!(f, "{}", i),
            RtValue::Float(x) => write!(f, "{:?}", x),
            RtValue::Str(s) => write!(f, "{:?}", s),
            RtValue::None => write!(f, "None"),
            RtValue::Uninit => write!(f, "<uninitialized>"),
            RtValue::Closure(node) => write!(f, "<closure {}>", node),
        }
    }
}

impl From<&Literal> for RtValue {
    fn from(lit: &Literal) -> Self {
        match lit {
            Literal::Bool(b) => RtValue::Bool(*b),
            Literal::Int(i) => RtValue::Int(*i),
            Literal::Float(x) => RtValue::Float(*x),
            Literal::Str(s) => RtValue::Str(s.clone()),
            Literal::None => RtValue::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("{node} read an uninitialized value")]
    UninitializedRead { node: NodeId },

    #[error("{node}: type error: {message}")]
    TypeError { node: NodeId, message: String },

    #[error("{node}: division by zero")]
    DivisionByZero { node: NodeId },

    #[error("no host function named `{0}`")]
    UnknownFunction(String),

    #[error("{node}: cannot evaluate {kind}")]
    Unsupported { node: NodeId, kind: String },

    #[error("expected {expected} arguments, found {found}")]
    ArgumentCount { expected: usize, found: usize },

    #[error("call depth limit exceeded")]
    StackOverflow,

    #[error("host function `{name}` failed: {message}")]
    Host { name: String, message: String },
}

pub type HostFn = Box<dyn Fn(&[RtValue]) -> Result<RtValue, EvalError> + Send + Sync>;

const MAX_CALL_DEPTH: usize = 256;

/// Graph interpreter
pub struct Interpreter<'g> {
    graph: &'g Graph,
    values: FxHashMap<ValueId, RtValue>,
    hosts: FxHashMap<String, HostFn>,
    trace: Vec<String>,
    depth: usize,
}

impl<'g> Interpreter<'g> {
    pub fn new(graph: &'g Graph) -> Self {
        Self {
            graph,
            values: FxHashMap::default(),
            hosts: FxHashMap::default(),
            trace: Vec::new(),
            depth: 0,
        }
    }

    /// Register a host function callable through `call[name]`
    pub fn register_host<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&[RtValue]) -> Result<RtValue, EvalError> + Send + Sync + 'static,
    {
        self.hosts.insert(name.to_string(), Box::new(f));
    }

    /// Names of host functions called so far, in call order
    pub fn call_trace(&self) -> &[String] {
        &self.trace
    }

    /// Run the graph on `args`, returning its outputs
    pub fn run(&mut self, args: &[RtValue]) -> Result<Vec<RtValue>, EvalError> {
        self.eval_block(self.graph.root(), args)
    }

    fn get(&self, value: ValueId) -> RtValue {
        self.values.get(&value).cloned().unwrap_or(RtValue::Uninit)
    }

    /// Read an operand that is actually inspected
    fn read(&self, node: NodeId, value: ValueId) -> Result<RtValue, EvalError> {
        match self.get(value) {
            RtValue::Uninit => Err(EvalError::UninitializedRead { node }),
            v => Ok(v),
        }
    }

    fn read_bool(&self, node: NodeId, value: ValueId) -> Result<bool, EvalError> {
        match self.read(node, value)? {
            RtValue::Bool(b) => Ok(b),
            other => Err(type_error(node, format!("expected bool, found {}", other))),
        }
    }

    fn read_int(&self, node: NodeId, value: ValueId) -> Result<i64, EvalError> {
        match self.read(node, value)? {
            RtValue::Int(i) => Ok(i),
            other => Err(type_error(node, format!("expected int, found {}", other))),
        }
    }

    fn eval_block(&mut self, block: BlockId, args: &[RtValue]) -> Result<Vec<RtValue>, EvalError> {
        let data = self.graph.block(block);
        if data.params.len() != args.len() {
            return Err(EvalError::ArgumentCount {
                expected: data.params.len(),
                found: args.len(),
            });
        }
        for (&param, arg) in data.params.iter().zip(args) {
            self.values.insert(param, arg.clone());
        }
        for &node in &data.nodes {
            self.eval_node(node)?;
        }
        Ok(data.outputs.iter().map(|&v| self.get(v)).collect())
    }

    fn set_outputs(&mut self, node: NodeId, results: Vec<RtValue>) -> Result<(), EvalError> {
        let outputs = &self.graph.node(node).outputs;
        if outputs.len() != results.len() {
            return Err(EvalError::ArgumentCount {
                expected: outputs.len(),
                found: results.len(),
            });
        }
        for (&out, value) in outputs.iter().zip(results) {
            self.values.insert(out, value);
        }
        Ok(())
    }

    fn eval_node(&mut self, node: NodeId) -> Result<(), EvalError> {
        let data = self.graph.node(node);
        match &data.kind {
            NodeKind::Op(op) => self.eval_op(node, op),
            NodeKind::If => {
                let cond = self.read_bool(node, data.inputs[0])?;
                let branch = if cond { data.blocks[0] } else { data.blocks[1] };
                let results = self.eval_block(branch, &[])?;
                self.set_outputs(node, results)
            }
            NodeKind::Loop => self.eval_loop(node),
            NodeKind::Function => self.set_outputs(node, vec![RtValue::Closure(node)]),
            kind => Err(EvalError::Unsupported {
                node,
                kind: kind.name(),
            }),
        }
    }

    fn eval_loop(&mut self, node: NodeId) -> Result<(), EvalError> {
        let data = self.graph.node(node);
        let trip_count = self.read_int(node, data.inputs[0])?;
        let mut cond = self.read_bool(node, data.inputs[1])?;
        let mut carried: Vec<RtValue> = data.inputs[2..].iter().map(|&v| self.get(v)).collect();
        let body = data.blocks[0];
        let header = data.blocks.get(1).copied();

        let mut i = 0;
        while i < trip_count && cond {
            let mut args = Vec::with_capacity(carried.len() + 1);
            args.push(RtValue::Int(i));
            args.extend(carried.iter().cloned());
            let mut results = self.eval_block(body, &args)?;
            match header {
                Some(header) => {
                    carried = results;
                    let next = self.eval_block(header, &[])?;
                    cond = as_bool(node, next.into_iter().next())?;
                }
                None => {
                    if results.is_empty() {
                        return Err(type_error(node, "loop body has no condition output".into()));
                    }
                    let next = results.remove(0);
                    cond = as_bool(node, Some(next))?;
                    carried = results;
                }
            }
            i += 1;
        }
        self.set_outputs(node, carried)
    }

    fn eval_op(&mut self, node: NodeId, op: &Operator) -> Result<(), EvalError> {
        let inputs = &self.graph.node(node).inputs;
        let result = match op {
            Operator::Constant(lit) => Some(RtValue::from(lit)),
            Operator::Uninitialized => Some(RtValue::Uninit),
            Operator::Not => Some(RtValue::Bool(!self.read_bool(node, inputs[0])?)),
            Operator::Neg => match self.read(node, inputs[0])? {
                RtValue::Int(i) => Some(RtValue::Int(-i)),
                RtValue::Float(x) => Some(RtValue::Float(-x)),
                other => return Err(type_error(node, format!("cannot negate {}", other))),
            },
            Operator::And => {
                let (a, b) = (self.read_bool(node, inputs[0])?, self.read_bool(node, inputs[1])?);
                Some(RtValue::Bool(a && b))
            }
            Operator::Or => {
                let (a, b) = (self.read_bool(node, inputs[0])?, self.read_bool(node, inputs[1])?);
                Some(RtValue::Bool(a || b))
            }
            Operator::Add
            | Operator::Sub
            | Operator::Mul
            | Operator::Div
            | Operator::Rem
            | Operator::Eq
            | Operator::Ne
            | Operator::Lt
            | Operator::Le
            | Operator::Gt
            | Operator::Ge => {
                let a = self.read(node, inputs[0])?;
                let b = self.read(node, inputs[1])?;
                Some(binary(node, op, a, b)?)
            }
            Operator::Call(name) => {
                let args = inputs
                    .iter()
                    .map(|&v| self.read(node, v))
                    .collect::<Result<Vec<_>, _>>()?;
                let host = self
                    .hosts
                    .get(name)
                    .ok_or_else(|| EvalError::UnknownFunction(name.clone()))?;
                let value = host(&args)?;
                self.trace.push(name.clone());
                Some(value)
            }
            Operator::Apply => {
                let function = match self.read(node, inputs[0])? {
                    RtValue::Closure(function) => function,
                    other => return Err(type_error(node, format!("cannot apply {}", other))),
                };
                let args: Vec<RtValue> = inputs[1..].iter().map(|&v| self.get(v)).collect();
                if self.depth >= MAX_CALL_DEPTH {
                    return Err(EvalError::StackOverflow);
                }
                self.depth += 1;
                let body = self.graph.node(function).blocks[0];
                let results = self.eval_block(body, &args);
                self.depth -= 1;
                return self.set_outputs(node, results?);
            }
        };

        let outputs = &self.graph.node(node).outputs;
        match (result, outputs.len()) {
            (_, 0) => Ok(()),
            (Some(value), 1) => {
                self.values.insert(outputs[0], value);
                Ok(())
            }
            (_, found) => Err(EvalError::ArgumentCount { expected: 1, found }),
        }
    }
}

fn type_error(node: NodeId, message: String) -> EvalError {
    EvalError::TypeError { node, message }
}

fn as_bool(node: NodeId, value: Option<RtValue>) -> Result<bool, EvalError> {
    match value {
        Some(RtValue::Bool(b)) => Ok(b),
        Some(RtValue::Uninit) => Err(EvalError::UninitializedRead { node }),
        other => Err(type_error(node, format!("expected bool condition, found {:?}", other))),
    }
}

fn binary(node: NodeId, op: &Operator, a: RtValue, b: RtValue) -> Result<RtValue, EvalError> {
    use RtValue::*;
    let value = match (op, a, b) {
        (Operator::Eq, a, b) => Bool(a == b),
        (Operator::Ne, a, b) => Bool(a != b),

        (Operator::Add, Str(x), Str(y)) => Str(x + &y),

        (Operator::Div | Operator::Rem, Int(_), Int(0)) => return Err(EvalError::DivisionByZero { node }),
        (op, Int(x), Int(y)) => match op {
            Operator::Add => Int(x.wrapping_add(y)),
            Operator::Sub => Int(x.wrapping_sub(y)),
            Operator::Mul => Int(x.wrapping_mul(y)),
            Operator::Div => Int(x.div_euclid(y)),
            Operator::Rem => Int(x.rem_euclid(y)),
            Operator::Lt => Bool(x < y),
            Operator::Le => Bool(x <= y),
            Operator::Gt => Bool(x > y),
            _ => Bool(x >= y),
        },
        (op, x @ (Int(_) | Float(_)), y @ (Int(_) | Float(_))) => {
            let (x, y) = (as_float(&x), as_float(&y));
            match op {
                Operator::Add => Float(x + y),
                Operator::Sub => Float(x - y),
                Operator::Mul => Float(x * y),
                Operator::Div => Float(x / y),
                Operator::Rem => Float(x % y),
                Operator::Lt => Bool(x < y),
                Operator::Le => Bool(x <= y),
                Operator::Gt => Bool(x > y),
                _ => Bool(x >= y),
            }
        }
        (op, Str(x), Str(y)) if matches!(op, Operator::Lt | Operator::Le | Operator::Gt | Operator::Ge) => {
            match op {
                Operator::Lt => Bool(x < y),
                Operator::Le => Bool(x <= y),
                Operator::Gt => Bool(x > y),
                _ => Bool(x >= y),
            }
        }
        (op, a, b) => {
            return Err(type_error(
                node,
                format!("unsupported operands for {}: {} and {}", op.mnemonic(), a, b),
            ))
        }
    };
    Ok(value)
}

fn as_float(value: &RtValue) -> f64 {
    match value {
        RtValue::Int(i) => *i as f64,
        RtValue::Float(x) => *x,
        _ => f64::NAN,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{GraphBuilder, Type};

    #[test]
    fn test_arithmetic() {
        let mut graph = Graph::new();
        let x = graph.add_input(Type::Int);
        let mut b = GraphBuilder::new(&mut graph);
        let two = b.int(2).unwrap();
        let prod = b.binary(Operator::Mul, x, two).unwrap();
        let half = b.float(0.5).unwrap();
        let sum = b.binary(Operator::Add, prod, half).unwrap();
        graph.register_output(sum);

        let mut interp = Interpreter::new(&graph);
        assert_eq!(interp.run(&[RtValue::Int(4)]).unwrap(), vec![RtValue::Float(8.5)]);
    }

    #[test]
    fn test_loop_sums_iterations() {
        let mut graph = Graph::new();
        let mut b = GraphBuilder::new(&mut graph);
        let trip = b.int(5).unwrap();
        let t = b.bool(true).unwrap();
        let zero = b.int(0).unwrap();
        let node = b
            .loop_(trip, t, &[zero], |b, i, params| {
                let acc = b.binary(Operator::Add, params[0], i)?;
                let c = b.bool(true)?;
                Ok((c, vec![acc]))
            })
            .unwrap();
        let out = b.outputs(node)[0];
        graph.register_output(out);

        let mut interp = Interpreter::new(&graph);
        assert_eq!(interp.run(&[]).unwrap(), vec![RtValue::Int(10)]);
    }

    #[test]
    fn test_host_calls_are_traced() {
        let mut graph = Graph::new();
        let mut b = GraphBuilder::new(&mut graph);
        let v = b.call("f", &[], Type::Int).unwrap();
        graph.register_output(v);

        let mut interp = Interpreter::new(&graph);
        interp.register_host("f", |_| Ok(RtValue::Int(7)));
        assert_eq!(interp.run(&[]).unwrap(), vec![RtValue::Int(7)]);
        assert_eq!(interp.call_trace(), &["f".to_string()]);
    }

    #[test]
    fn test_uninitialized_read_fails() {
        let mut graph = Graph::new();
        let mut b = GraphBuilder::new(&mut graph);
        let u = b.uninitialized(Type::Int).unwrap();
        let one = b.int(1).unwrap();
        let sum = b.binary(Operator::Add, u, one).unwrap();
        graph.register_output(sum);

        let mut interp = Interpreter::new(&graph);
        assert!(matches!(interp.run(&[]), Err(EvalError::UninitializedRead { .. })));
    }

    #[test]
    fn test_closure_apply() {
        let mut graph = Graph::new();
        let mut b = GraphBuilder::new(&mut graph);
        let f = b
            .function(&[Type::Int], |b, params| {
                let one = b.int(1)?;
                Ok(vec![b.binary(Operator::Add, params[0], one)?])
            })
            .unwrap();
        let arg = b.int(41).unwrap();
        let call = b.apply(f, &[arg], vec![Type::Int]).unwrap();
        let out = b.outputs(call)[0];
        graph.register_output(out);

        let mut interp = Interpreter::new(&graph);
        assert_eq!(interp.run(&[]).unwrap(), vec![RtValue::Int(42)]);
    }

    #[test]
    fn test_scope_ops_unsupported() {
        let mut graph = Graph::new();
        let mut b = GraphBuilder::new(&mut graph);
        b.load("x", Type::Int).unwrap();
        let mut interp = Interpreter::new(&graph);
        assert!(matches!(interp.run(&[]), Err(EvalError::Unsupported { .. })));
    }
}
