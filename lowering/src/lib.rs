//! Structured control-flow lowering
//!
//! Takes a block-scoped graph IR with named variables (`Load`/`Store`) and
//! non-local exits (`Break`/`Continue`/`Return`) and rewrites it into pure
//! SSA form where every exit has been replaced by explicit data flow
//! through `If` and `Loop` outputs.
//!
//! ```rust,ignore
//! use lowering::ir::{Graph, GraphBuilder, Type};
//! use lowering::pipeline::{lower_graph, PipelineConfig};
//!
//! let mut graph = Graph::new();
//! let cond = graph.add_input(Type::Bool);
//! // ... build with GraphBuilder ...
//! let stats = lower_graph(&mut graph, &PipelineConfig::default())?;
//! ```

pub mod error;
pub mod ir;
pub mod logging;
pub mod passes;
pub mod pipeline;

pub use error::{LoweringError, Result};
pub use pipeline::{lower_graph, lower_graphs, PassReport, PipelineConfig, PipelineStats};
