//! Discretization
//!
//! Turns a trained search graph into a discrete child network: for every
//! intermediate node keep the `k` strongest incoming edges and on each kept
//! edge keep only its strongest non-`none` operation.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::config::{NoneRanking, SearchConfig};
use super::graph::{Cell, EdgeOp, EdgeTopology, GraphTopology, MacroGraph};
use super::registry::NONE_OP;
use crate::error::{KolosalError, Result};

/// Mixture weights of one incoming edge
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeWeights {
    pub names: Vec<String>,
    pub weights: Vec<f64>,
}

impl EdgeWeights {
    pub fn new<S: AsRef<str>>(names: &[S], weights: Vec<f64>) -> Self {
        Self {
            names: names.iter().map(|s| s.as_ref().to_string()).collect(),
            weights,
        }
    }

    /// Best non-`none` operation; ties go to the lower index
    pub fn representative(&self) -> Option<(usize, f64)> {
        let mut best: Option<(usize, f64)> = None;
        for (i, (name, &w)) in self.names.iter().zip(self.weights.iter()).enumerate() {
            if name == NONE_OP {
                continue;
            }
            let better = match best {
                Some((_, bw)) => w > bw,
                None => !w.is_nan(),
            };
            if better {
                best = Some((i, w));
            }
        }
        best
    }

    fn max_weight(&self) -> f64 {
        self.weights.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }
}

/// One kept edge
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeChoice {
    /// Position among the node's incoming edges
    pub edge: usize,
    /// Index of the chosen operation
    pub op_index: usize,
    pub op: String,
    /// Mixture weight of the chosen operation
    pub weight: f64,
}

/// Keep the `keep` strongest edges of one node.
///
/// Edges are ranked by descending weight with ties broken by ascending
/// position; the result is ordered by position.
pub fn select_edges(edges: &[EdgeWeights], keep: usize, ranking: NoneRanking) -> Result<Vec<EdgeChoice>> {
    if keep == 0 {
        return Err(KolosalError::InvalidParameter {
            name: "n_input_edges".to_string(),
            value: "0".to_string(),
            reason: "every intermediate node needs at least one input edge".to_string(),
        });
    }
    if keep > edges.len() {
        return Err(KolosalError::ConfigMismatch(format!(
            "cannot keep {} of {} incoming edges",
            keep,
            edges.len()
        )));
    }

    let mut ranked: Vec<(EdgeChoice, f64)> = edges
        .iter()
        .enumerate()
        .filter_map(|(edge, weights)| {
            let (op_index, weight) = weights.representative()?;
            let rank = match ranking {
                NoneRanking::Exclude => weight,
                NoneRanking::Include => weights.max_weight(),
            };
            let choice = EdgeChoice {
                edge,
                op_index,
                op: weights.names[op_index].clone(),
                weight,
            };
            Some((choice, rank))
        })
        .collect();

    if ranked.len() < keep {
        return Err(KolosalError::ConfigMismatch(format!(
            "only {} of {} incoming edges carry a non-none operation, {} requested",
            ranked.len(),
            edges.len(),
            keep
        )));
    }

    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.edge.cmp(&b.0.edge)));
    ranked.truncate(keep);

    let mut kept: Vec<EdgeChoice> = ranked.into_iter().map(|(choice, _)| choice).collect();
    kept.sort_by_key(|c| c.edge);
    Ok(kept)
}

/// Kept edges of one node, as `(from, op name)`
type NodeSelection = Vec<(usize, String)>;

fn select_cell(cell: &Cell, n_input_edges: &[usize], ranking: NoneRanking) -> Result<Vec<NodeSelection>> {
    if cell.inter_nodes().len() != n_input_edges.len() {
        return Err(KolosalError::ConfigMismatch(format!(
            "cell {} has {} intermediate nodes, n_input_edges has {} entries",
            cell.index(),
            cell.inter_nodes().len(),
            n_input_edges.len()
        )));
    }
    cell.inter_nodes()
        .iter()
        .zip(n_input_edges.iter())
        .map(|(node, &keep)| -> Result<NodeSelection> {
            let weights: Vec<EdgeWeights> = node
                .edges()
                .iter()
                .map(|edge| match &edge.op {
                    EdgeOp::Mixed(mixed) => EdgeWeights::new(mixed.names(), mixed.mixture_weights().to_vec()),
                    EdgeOp::Fixed { name, .. } => EdgeWeights::new(&[name.as_str()], vec![1.0]),
                })
                .collect();
            let kept = select_edges(&weights, keep, ranking).map_err(|e| match e {
                KolosalError::ConfigMismatch(msg) => KolosalError::ConfigMismatch(format!(
                    "cell {} node {}: {}",
                    cell.index(),
                    node.index(),
                    msg
                )),
                other => other,
            })?;
            debug!(
                cell = cell.index(),
                node = node.index(),
                kept = ?kept.iter().map(|c| (node.edges()[c.edge].from, c.op.as_str())).collect::<Vec<_>>(),
                "Edges selected"
            );
            Ok(kept
                .into_iter()
                .map(|c| (node.edges()[c.edge].from, c.op))
                .collect())
        })
        .collect()
}

impl MacroGraph {
    /// Derive a discrete child network.
    ///
    /// `config` describes the final network (depth, width, classes);
    /// `n_input_edges[i]` is how many incoming edges intermediate node
    /// `i + 2` keeps. Kept operations are built fresh from the registry.
    /// When the final depth differs from the search depth, every final cell
    /// copies the choices of the first search cell of the same type.
    pub fn discretize(&self, config: &SearchConfig, n_input_edges: &[usize]) -> Result<MacroGraph> {
        config.validate()?;
        let steps = self.config().steps;
        if config.steps != steps {
            return Err(KolosalError::ConfigMismatch(format!(
                "final config has {} intermediate nodes, search graph has {}",
                config.steps, steps
            )));
        }
        if n_input_edges.len() != steps {
            return Err(KolosalError::ConfigMismatch(format!(
                "n_input_edges has {} entries for {} intermediate nodes",
                n_input_edges.len(),
                steps
            )));
        }

        let selections = self
            .cells()
            .map(|cell| select_cell(cell, n_input_edges, config.none_ranking))
            .collect::<Result<Vec<_>>>()?;

        let mut plan = GraphTopology::search_space(config)?;
        let same_layout = plan.cells.len() == selections.len()
            && plan
                .cells
                .iter()
                .zip(self.cells())
                .all(|(planned, searched)| planned.reduction == searched.is_reduction());
        if !same_layout {
            warn!(
                search_cells = selections.len(),
                final_cells = plan.cells.len(),
                "Cell layouts differ, reusing the first search cell of each type"
            );
        }

        for cell_plan in plan.cells.iter_mut() {
            let source = if same_layout {
                cell_plan.index
            } else {
                self.cells()
                    .position(|c| c.is_reduction() == cell_plan.reduction)
                    .ok_or_else(|| {
                        KolosalError::ConfigMismatch(format!(
                            "search graph has no {} cell to copy into cell {}",
                            if cell_plan.reduction { "reduction" } else { "normal" },
                            cell_plan.index
                        ))
                    })?
            };
            if selections[source].len() != cell_plan.nodes.len() {
                return Err(KolosalError::ConfigMismatch(format!(
                    "search cell {} selected {} nodes, final cell {} has {}",
                    source,
                    selections[source].len(),
                    cell_plan.index,
                    cell_plan.nodes.len()
                )));
            }
            let reduction = cell_plan.reduction;
            for (node_plan, kept) in cell_plan.nodes.iter_mut().zip(&selections[source]) {
                let to = node_plan.index;
                node_plan.edges = kept
                    .iter()
                    .map(|(from, name)| EdgeTopology {
                        from: *from,
                        to,
                        stride: if reduction && *from < 2 { 2 } else { 1 },
                        ops: vec![name.clone()],
                        mixed: false,
                    })
                    .collect();
            }
        }

        let child = MacroGraph::from_topology(config, Arc::clone(self.registry()), plan)?;
        info!(
            cells = child.num_cells(),
            edges = child.topology().num_edges(),
            params = child.num_parameters(),
            "Architecture discretized"
        );
        Ok(child)
    }
}
