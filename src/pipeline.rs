// ========================================================================================
//
//                  Pipeline composition and the reference executor
//
// ========================================================================================
//
// A forward pass is a DAG: block sources feed map, join, and aggregate stages and
// terminate in a sink whose outputs the caller collects. This module owns the
// composition API, the coordinate-space invariant that makes stages composable
// (every plain map preserves its input's coordinate space, every plain join requires
// both inputs to already share one, and only operators that declare themselves
// coordinate-rekeying may renormalize), and a reference executor that evaluates the
// DAG over materialized block sets. The executor stands in for the external dataflow
// engine: it groups join candidates, runs stages data-parallel over blocks, and
// enforces the invariant the engine's shuffle depends on.
//
// The streaming drivers at the bottom are the per-port adapters for an engine that
// hands this layer channels of blocks rather than materialized sets.

use crate::operator::{AggregateOperator, JoinOperator, MapOperator, OperatorError};
use crate::types::MatrixBlock;
use ahash::AHashMap;
use crossbeam_channel::{Receiver, Sender, bounded, never, select};
use itertools::Itertools;
use log::{debug, info};
use rayon::prelude::*;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

// --- Streaming Tuning Parameters ---

/// Per-core depth of a bounded block port. Provides backpressure against a fast
/// producer without starving a slow consumer.
const PORT_DEPTH_PER_CORE: usize = 4;

/// Creates one bounded input/output port for streaming execution, sized to the
/// machine the way the engine sizes its own buffers.
pub fn block_port() -> (Sender<MatrixBlock>, Receiver<MatrixBlock>) {
    bounded(num_cpus::get().max(1) * PORT_DEPTH_PER_CORE)
}

/// A specialized error type for the pipeline, allowing for robust, clonable error
/// propagation from any concurrent stage.
#[derive(Debug, Clone)]
pub enum PipelineError {
    Operator(OperatorError),
    Graph(String),
    CoordinateSpace(String),
    Channel(String),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Operator(e) => write!(f, "{e}"),
            PipelineError::Graph(msg) => write!(f, "Malformed pipeline graph: {msg}"),
            PipelineError::CoordinateSpace(msg) => {
                write!(f, "Coordinate-space violation: {msg}")
            }
            PipelineError::Channel(msg) => {
                write!(f, "Channel failure during streaming execution: {msg}")
            }
        }
    }
}

impl Error for PipelineError {}

impl From<OperatorError> for PipelineError {
    fn from(e: OperatorError) -> Self {
        PipelineError::Operator(e)
    }
}

/// Handle to one node of a pipeline graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeId(usize);

enum Node {
    Source { port: usize },
    Map { input: NodeId, op: Arc<dyn MapOperator> },
    Join { left: NodeId, right: NodeId, op: Arc<dyn JoinOperator> },
    Aggregate { input: NodeId, op: Arc<dyn AggregateOperator> },
}

/// Builder and reference executor for one operator DAG.
///
/// Nodes are append-only, so a node's inputs always precede it and the graph is
/// topologically ordered by construction; cycles are unrepresentable. Stage results
/// are memoized per node, so a diamond-shaped graph (one set of attention scores
/// feeding both inputs of its own softmax) evaluates each node exactly once.
pub struct Pipeline {
    nodes: Vec<Node>,
    num_sources: usize,
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            num_sources: 0,
        }
    }

    /// Registers an input port. The `n`-th call binds to the `n`-th source set
    /// handed to [`Pipeline::run`].
    pub fn source(&mut self) -> NodeId {
        let port = self.num_sources;
        self.num_sources += 1;
        self.push(Node::Source { port })
    }

    /// Appends a map stage over `input`.
    pub fn map(&mut self, input: NodeId, op: impl MapOperator + 'static) -> NodeId {
        assert!(input.0 < self.nodes.len(), "map input references an unknown node");
        self.push(Node::Map {
            input,
            op: Arc::new(op),
        })
    }

    /// Appends a join stage over `left` and `right`.
    pub fn join(
        &mut self,
        left: NodeId,
        right: NodeId,
        op: impl JoinOperator + 'static,
    ) -> NodeId {
        assert!(left.0 < self.nodes.len(), "join left input references an unknown node");
        assert!(right.0 < self.nodes.len(), "join right input references an unknown node");
        self.push(Node::Join {
            left,
            right,
            op: Arc::new(op),
        })
    }

    /// Appends a keyed aggregation stage over `input`.
    pub fn aggregate(&mut self, input: NodeId, op: impl AggregateOperator + 'static) -> NodeId {
        assert!(input.0 < self.nodes.len(), "aggregate input references an unknown node");
        self.push(Node::Aggregate {
            input,
            op: Arc::new(op),
        })
    }

    fn push(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }

    /// Evaluates the graph and returns the sink node's blocks.
    ///
    /// `sources[n]` feeds the `n`-th registered source port; ownership of every
    /// block transfers into the run. Only nodes the sink depends on are evaluated.
    /// Any stage error aborts the whole run; there is no partial output.
    pub fn run(
        &self,
        mut sources: Vec<Vec<MatrixBlock>>,
        sink: NodeId,
    ) -> Result<Vec<MatrixBlock>, PipelineError> {
        if sink.0 >= self.nodes.len() {
            return Err(PipelineError::Graph(format!(
                "sink node {} is out of range for a {}-node graph",
                sink.0,
                self.nodes.len()
            )));
        }
        if sources.len() != self.num_sources {
            return Err(PipelineError::Graph(format!(
                "graph declares {} source ports but {} source sets were provided",
                self.num_sources,
                sources.len()
            )));
        }

        info!(
            "pipeline run: {} nodes, {} source ports, sink node {}",
            self.nodes.len(),
            self.num_sources,
            sink.0
        );

        // Reverse reachability from the sink; unneeded side branches never run.
        let mut needed = vec![false; self.nodes.len()];
        let mut stack = vec![sink.0];
        while let Some(idx) = stack.pop() {
            if needed[idx] {
                continue;
            }
            needed[idx] = true;
            match &self.nodes[idx] {
                Node::Source { .. } => {}
                Node::Map { input, .. } | Node::Aggregate { input, .. } => stack.push(input.0),
                Node::Join { left, right, .. } => {
                    stack.push(left.0);
                    stack.push(right.0);
                }
            }
        }

        let mut memo: Vec<Option<Vec<MatrixBlock>>> = (0..self.nodes.len()).map(|_| None).collect();
        for idx in 0..=sink.0 {
            if !needed[idx] {
                continue;
            }
            let blocks = match &self.nodes[idx] {
                Node::Source { port } => std::mem::take(&mut sources[*port]),
                Node::Map { input, op } => {
                    let input_blocks = memo[input.0]
                        .as_ref()
                        .expect("append-only graph evaluates inputs first");
                    evaluate_map(op.as_ref(), input_blocks)?
                }
                Node::Join { left, right, op } => {
                    let left_blocks = memo[left.0]
                        .as_ref()
                        .expect("append-only graph evaluates inputs first");
                    let right_blocks = memo[right.0]
                        .as_ref()
                        .expect("append-only graph evaluates inputs first");
                    evaluate_join(op.as_ref(), left_blocks, right_blocks)?
                }
                Node::Aggregate { input, op } => {
                    let input_blocks = memo[input.0]
                        .as_ref()
                        .expect("append-only graph evaluates inputs first");
                    evaluate_aggregate(op.as_ref(), input_blocks)?
                }
            };
            memo[idx] = Some(blocks);
        }

        memo[sink.0]
            .take()
            .ok_or_else(|| PipelineError::Graph("sink node produced no output".to_string()))
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

/// One output per selected input, evaluated data-parallel across blocks. A plain
/// map kernel that silently rekeys its output is a bug the executor refuses to
/// propagate: every downstream join would mis-match on the mutated coordinates.
fn evaluate_map(
    op: &dyn MapOperator,
    inputs: &[MatrixBlock],
) -> Result<Vec<MatrixBlock>, PipelineError> {
    inputs
        .par_iter()
        .filter(|block| op.selects(block))
        .map(|block| {
            let out = op.project(block)?;
            if !op.rekeys() && out.coords() != block.coords() {
                return Err(PipelineError::CoordinateSpace(format!(
                    "map stage moved block {} to {} without declaring itself rekeying",
                    block.coords(),
                    out.coords()
                )));
            }
            Ok(out)
        })
        .collect()
}

/// One output per matched pair. Candidate pairs are found by predicate scan: the
/// matching predicate is operator-defined and opaque to the executor, so no keyed
/// grouping can be assumed here.
fn evaluate_join(
    op: &dyn JoinOperator,
    left: &[MatrixBlock],
    right: &[MatrixBlock],
) -> Result<Vec<MatrixBlock>, PipelineError> {
    let nested: Vec<Vec<MatrixBlock>> = left
        .par_iter()
        .map(|a| -> Result<Vec<MatrixBlock>, PipelineError> {
            right
                .iter()
                .filter(|b| op.matches(a, b))
                .map(|b| -> Result<MatrixBlock, PipelineError> {
                    let out = op.combine(a, b)?;
                    if !op.rekeys() && out.coords() != a.coords() {
                        return Err(PipelineError::CoordinateSpace(format!(
                            "join stage moved block {} to {} without declaring itself rekeying",
                            a.coords(),
                            out.coords()
                        )));
                    }
                    Ok(out)
                })
                .collect()
        })
        .collect::<Result<_, PipelineError>>()?;
    Ok(nested.into_iter().flatten().collect())
}

/// Folds same-keyed blocks into one. Grouping order is whatever the input order
/// happens to be; the merge is associative and commutative, so the fold order does
/// not affect the result. Output is sorted by key only to keep runs deterministic.
fn evaluate_aggregate(
    op: &dyn AggregateOperator,
    inputs: &[MatrixBlock],
) -> Result<Vec<MatrixBlock>, PipelineError> {
    let mut groups: AHashMap<(usize, usize), MatrixBlock> = AHashMap::new();
    for block in inputs {
        let key = op.key(block);
        let merged = match groups.remove(&key) {
            Some(acc) => op.merge(acc, block)?,
            None => block.clone(),
        };
        groups.insert(key, merged);
    }
    Ok(groups
        .into_iter()
        .sorted_by_key(|(key, _)| *key)
        .map(|(_, block)| block)
        .collect())
}

// ========================================================================================
//                              Streaming operator drivers
// ========================================================================================

/// Drives one map operator over a stream of blocks: one output per accepted input,
/// until the input port closes. Returns the number of blocks emitted.
pub fn drive_map(
    op: &dyn MapOperator,
    input: Receiver<MatrixBlock>,
    output: Sender<MatrixBlock>,
) -> Result<usize, PipelineError> {
    let mut emitted = 0;
    for block in input.iter() {
        if !op.selects(&block) {
            continue;
        }
        let out = op.project(&block)?;
        output
            .send(out)
            .map_err(|_| PipelineError::Channel("map output port disconnected".to_string()))?;
        emitted += 1;
    }
    Ok(emitted)
}

/// Drives one join operator over two streams. Arrivals with no partner yet are
/// buffered per side; the kernel fires as soon as a matched pair is complete, so
/// delivery order across the two ports is irrelevant. Each block pairs at most
/// once. Returns the number of pairs emitted.
pub fn drive_join(
    op: &dyn JoinOperator,
    left: Receiver<MatrixBlock>,
    right: Receiver<MatrixBlock>,
    output: Sender<MatrixBlock>,
) -> Result<usize, PipelineError> {
    let mut left_rx = left;
    let mut right_rx = right;
    let mut left_open = true;
    let mut right_open = true;
    let mut left_pending: Vec<MatrixBlock> = Vec::new();
    let mut right_pending: Vec<MatrixBlock> = Vec::new();
    let mut emitted = 0;

    let emit = |out: MatrixBlock, emitted: &mut usize| -> Result<(), PipelineError> {
        output
            .send(out)
            .map_err(|_| PipelineError::Channel("join output port disconnected".to_string()))?;
        *emitted += 1;
        Ok(())
    };

    while left_open || right_open {
        select! {
            recv(left_rx) -> msg => match msg {
                Ok(block) => {
                    if let Some(pos) = right_pending.iter().position(|b| op.matches(&block, b)) {
                        let partner = right_pending.swap_remove(pos);
                        emit(op.combine(&block, &partner)?, &mut emitted)?;
                    } else {
                        left_pending.push(block);
                    }
                }
                Err(_) => {
                    left_open = false;
                    left_rx = never();
                }
            },
            recv(right_rx) -> msg => match msg {
                Ok(block) => {
                    if let Some(pos) = left_pending.iter().position(|a| op.matches(a, &block)) {
                        let partner = left_pending.swap_remove(pos);
                        emit(op.combine(&partner, &block)?, &mut emitted)?;
                    } else {
                        right_pending.push(block);
                    }
                }
                Err(_) => {
                    right_open = false;
                    right_rx = never();
                }
            },
        }
    }

    if !left_pending.is_empty() || !right_pending.is_empty() {
        // The engine guarantees eventual delivery of matches, so leftovers here mean
        // the upstream stage closed with unpaired blocks in flight.
        debug!(
            "join driver closing with {} left / {} right unmatched blocks",
            left_pending.len(),
            right_pending.len()
        );
    }
    Ok(emitted)
}
