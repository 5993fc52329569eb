//! Lowering pipeline
//!
//! Drives the standard pass sequence over one graph or many, with optional
//! verification and dumping between passes.
//!
//! # Usage
//!
//! ```rust,ignore
//! use lowering::pipeline::{lower_graph, PipelineConfig};
//!
//! let config = PipelineConfig::default();
//! let stats = lower_graph(&mut graph, &config)?;
//! println!("{}", stats.summary());
//! ```

use crate::error::{LoweringError, Result};
use crate::ir::dump::dump_graph;
use crate::ir::validation::verify;
use crate::ir::Graph;
use crate::passes::{
    ControlFlowDecorator, ExitEliminator, ExitKind, LoopHeaderInliner, PassManager, PassResult, SsaRewriter,
};
use log::{debug, info, trace};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::time::Instant;

/// Configuration for the lowering pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Verify the graph after every pass and fail on the first violation
    pub verify_each_pass: bool,

    /// Give SSA values the names of the variables they were stored to,
    /// made unique per graph
    pub canonicalize_names: bool,

    /// Delete pooled constants and placeholders a pass created but did not use
    pub prune_unused_constants: bool,

    /// Log a dump of the graph after every pass (at `trace` level)
    pub dump_after_each_pass: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            verify_each_pass: true,
            canonicalize_names: true,
            prune_unused_constants: true,
            dump_after_each_pass: false,
        }
    }
}

impl PipelineConfig {
    /// Parse a configuration from TOML. Missing keys take their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        Ok(toml::from_str(source)?)
    }

    /// The standard pass sequence, configured
    pub fn pass_manager(&self) -> PassManager {
        let mut manager = PassManager::new();
        manager.add_pass(LoopHeaderInliner::new());
        manager.add_pass(ExitEliminator::new(ExitKind::Loop).with_pruning(self.prune_unused_constants));
        manager.add_pass(ControlFlowDecorator::new().with_pruning(self.prune_unused_constants));
        manager.add_pass(SsaRewriter::new().with_canonical_names(self.canonicalize_names));
        manager.add_pass(ExitEliminator::new(ExitKind::Return).with_pruning(self.prune_unused_constants));
        manager
    }
}

/// Report for one pass run
#[derive(Debug, Clone)]
pub struct PassReport {
    pub name: &'static str,
    pub result: PassResult,
    pub elapsed_us: u64,
    /// Placed nodes once the pass finished
    pub nodes_after: usize,
}

/// Statistics from lowering one graph
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    pub nodes_before: usize,
    pub passes: Vec<PassReport>,
    pub total_time_us: u64,
}

impl PipelineStats {
    pub fn nodes_after(&self) -> usize {
        self.passes.last().map(|p| p.nodes_after).unwrap_or(self.nodes_before)
    }

    /// All pass results combined
    pub fn combined(&self) -> PassResult {
        self.passes
            .iter()
            .fold(PassResult::unchanged(), |acc, p| acc.combine(p.result.clone()))
    }

    pub fn report(&self, pass: &str) -> Option<&PassReport> {
        self.passes.iter().find(|p| p.name == pass)
    }

    /// One line per pass
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for pass in &self.passes {
            let mut stats: Vec<_> = pass.result.stats.iter().collect();
            stats.sort();
            writeln!(
                out,
                "{:<26} {:>6}us  nodes={:<5} {:?}",
                pass.name, pass.elapsed_us, pass.nodes_after, stats
            )
            .unwrap();
        }
        writeln!(
            out,
            "total {}us, nodes {} -> {}",
            self.total_time_us,
            self.nodes_before,
            self.nodes_after()
        )
        .unwrap();
        out
    }
}

/// Lower `graph` in place to pure SSA form without exit statements.
pub fn lower_graph(graph: &mut Graph, config: &PipelineConfig) -> Result<PipelineStats> {
    let start = Instant::now();
    let mut stats = PipelineStats {
        nodes_before: graph.node_count(),
        ..Default::default()
    };
    info!("lowering graph with {} node(s)", stats.nodes_before);

    let mut manager = config.pass_manager();
    for pass in manager.passes_mut() {
        let pass_start = Instant::now();
        let result = pass.run_on_graph(graph)?;
        let elapsed_us = pass_start.elapsed().as_micros() as u64;
        let nodes_after = graph.node_count();
        debug!(
            "{} finished in {}us (modified={}, nodes={})",
            pass.name(),
            elapsed_us,
            result.modified,
            nodes_after
        );

        if config.dump_after_each_pass {
            trace!("after {}:\n{}", pass.name(), dump_graph(graph));
        }
        if config.verify_each_pass {
            let errors = verify(graph, pass.postcondition());
            if !errors.is_empty() {
                return Err(LoweringError::VerificationFailed {
                    pass: pass.name().to_string(),
                    errors: errors.iter().map(|e| e.to_string()).collect(),
                });
            }
        }

        stats.passes.push(PassReport {
            name: pass.name(),
            result,
            elapsed_us,
            nodes_after,
        });
    }

    stats.total_time_us = start.elapsed().as_micros() as u64;
    info!(
        "lowered graph in {}us ({} -> {} nodes)",
        stats.total_time_us,
        stats.nodes_before,
        stats.nodes_after()
    );
    Ok(stats)
}

/// Lower independent graphs in parallel. Results are in input order.
pub fn lower_graphs(graphs: &mut [Graph], config: &PipelineConfig) -> Vec<Result<PipelineStats>> {
    info!("lowering {} graph(s)", graphs.len());
    graphs
        .par_iter_mut()
        .map(|graph| lower_graph(graph, config))
        .collect()
}
