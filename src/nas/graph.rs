//! Macro Graph
//!
//! A cell-based convolutional network: input → stem → cells → global pooling
//! → classifier. Every cell has two input nodes (the outputs of the previous
//! two cells) and `steps` intermediate nodes, each fed by edges from all
//! earlier nodes of the cell. Before discretization every edge is a weighted
//! mixture of candidate operations; afterwards each edge holds exactly one.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use ndarray::{Array1, Array2};
use parking_lot::RwLock;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::config::SearchConfig;
use super::optimizer::ArchOptimizer;
use super::primitives::{ConvNormBlock, FactorizedReduce, Operation};
use super::registry::{OpArgs, OperationRegistry};
use super::tensor::{concat_channels, global_avg_pool, shape_of, softmax, BatchNorm2d, Conv2d, Linear, Tensor};
use crate::error::{KolosalError, Result};

/// Macro node index of the first cell
pub const FIRST_CELL_NODE: usize = 2;

/// Scale of the initial architecture logits
const ALPHA_INIT_SCALE: f64 = 1e-3;

/// Shared handle to the architecture logits (alpha) of one edge.
///
/// The optimizer is the only writer; forward passes and the discretizer
/// take read locks.
pub type ArchWeights = Arc<RwLock<Array1<f64>>>;

/// Deterministic per-operation seed
fn derive_seed(base: u64, parts: &[u64]) -> u64 {
    // splitmix64 over the index path
    let mut state = base;
    for &p in parts {
        state = state.wrapping_add(p.wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15));
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        state = z ^ (z >> 31);
    }
    state
}

// ─── Edges ────────────────────────────────────────────────────────────────────

/// Weighted mixture of every candidate operation
#[derive(Debug, Clone)]
pub struct MixedOp {
    names: Vec<String>,
    ops: Vec<Operation>,
    alpha: ArchWeights,
}

impl MixedOp {
    pub fn new(names: Vec<String>, ops: Vec<Operation>, alpha: ArchWeights) -> Result<Self> {
        let len = alpha.read().len();
        if names.len() != ops.len() || ops.len() != len || ops.is_empty() {
            return Err(KolosalError::ConfigMismatch(format!(
                "mixture with {} names, {} operations and {} weights",
                names.len(),
                ops.len(),
                len
            )));
        }
        Ok(Self { names, ops, alpha })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn ops(&self) -> &[Operation] {
        &self.ops
    }

    /// Handle to the architecture logits
    pub fn arch_weights(&self) -> &ArchWeights {
        &self.alpha
    }

    /// Copy of the raw logits
    pub fn alpha(&self) -> Array1<f64> {
        self.alpha.read().clone()
    }

    /// Overwrite the logits
    pub fn set_alpha(&self, alpha: Array1<f64>) -> Result<()> {
        let mut guard = self.alpha.write();
        if alpha.len() != guard.len() {
            return Err(KolosalError::shape(guard.len(), alpha.len()));
        }
        *guard = alpha;
        Ok(())
    }

    /// Mixture weights, `softmax(alpha)`
    pub fn mixture_weights(&self) -> Array1<f64> {
        softmax(&self.alpha.read())
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let weights = self.mixture_weights();
        let mut acc: Option<Tensor> = None;
        for (op, &w) in self.ops.iter().zip(weights.iter()) {
            if op.is_zero() {
                continue;
            }
            let y = op.forward(x)? * w;
            acc = Some(match acc {
                Some(sum) => sum + y,
                None => y,
            });
        }
        match acc {
            Some(sum) => Ok(sum),
            // every candidate is `none`
            None => self.ops[0].forward(x),
        }
    }
}

/// What an edge computes
#[derive(Debug, Clone)]
pub enum EdgeOp {
    /// Search phase: mixture over candidates
    Mixed(MixedOp),
    /// After discretization: one chosen operation
    Fixed { name: String, op: Operation },
}

/// Directed edge between two nodes of a cell
#[derive(Debug, Clone)]
pub struct Edge {
    pub from: usize,
    pub to: usize,
    pub stride: usize,
    pub op: EdgeOp,
}

impl Edge {
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match &self.op {
            EdgeOp::Mixed(mixed) => mixed.forward(x),
            EdgeOp::Fixed { op, .. } => op.forward(x),
        }
    }

    pub fn is_mixed(&self) -> bool {
        matches!(self.op, EdgeOp::Mixed(_))
    }

    /// Candidate names, or the single chosen name
    pub fn op_names(&self) -> Vec<String> {
        match &self.op {
            EdgeOp::Mixed(mixed) => mixed.names.clone(),
            EdgeOp::Fixed { name, .. } => vec![name.clone()],
        }
    }

    pub fn num_parameters(&self) -> usize {
        match &self.op {
            EdgeOp::Mixed(mixed) => mixed.ops.iter().map(Operation::num_parameters).sum(),
            EdgeOp::Fixed { op, .. } => op.num_parameters(),
        }
    }
}

// ─── Cells ────────────────────────────────────────────────────────────────────

/// Intermediate node of a cell
#[derive(Debug, Clone)]
pub struct CellNode {
    index: usize,
    edges: Vec<Edge>,
}

impl CellNode {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Predecessor node of every incoming edge
    pub fn input_edges(&self) -> Vec<usize> {
        self.edges.iter().map(|e| e.from).collect()
    }

    pub fn num_input_edges(&self) -> usize {
        self.edges.len()
    }
}

/// Normal or reduction cell
#[derive(Debug, Clone)]
pub struct Cell {
    index: usize,
    reduction: bool,
    reduction_prev: bool,
    channels: usize,
    preprocess0: Operation,
    preprocess1: Operation,
    nodes: Vec<CellNode>,
}

impl Cell {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_reduction(&self) -> bool {
        self.reduction
    }

    /// True when the preceding cell halved the resolution
    pub fn follows_reduction(&self) -> bool {
        self.reduction_prev
    }

    /// Width of every node inside the cell
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Width of the cell output (concatenated intermediate nodes)
    pub fn out_channels(&self) -> usize {
        self.channels * self.nodes.len()
    }

    /// Intermediate nodes, indexed from 2
    pub fn inter_nodes(&self) -> &[CellNode] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> Option<&CellNode> {
        self.nodes.iter().find(|n| n.index == index)
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.nodes.iter().flat_map(|n| n.edges.iter())
    }

    pub fn num_parameters(&self) -> usize {
        self.preprocess0.num_parameters()
            + self.preprocess1.num_parameters()
            + self.edges().map(Edge::num_parameters).sum::<usize>()
    }

    /// Consume the outputs of the two previous cells
    pub fn forward(&self, s0: &Tensor, s1: &Tensor) -> Result<Tensor> {
        let mut states = vec![self.preprocess0.forward(s0)?, self.preprocess1.forward(s1)?];
        for node in &self.nodes {
            let mut sum: Option<Tensor> = None;
            for edge in &node.edges {
                let y = edge.forward(&states[edge.from])?;
                sum = Some(match sum {
                    Some(acc) => {
                        if acc.dim() != y.dim() {
                            return Err(KolosalError::shape(shape_of(&acc), shape_of(&y)));
                        }
                        acc + y
                    }
                    None => y,
                });
            }
            let out = sum.ok_or_else(|| {
                KolosalError::ComputationError(format!(
                    "node {} of cell {} has no incoming edges",
                    node.index, self.index
                ))
            })?;
            states.push(out);
        }
        concat_channels(&states[2..])
    }
}

// ─── Topology ─────────────────────────────────────────────────────────────────

/// Serializable edge description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeTopology {
    pub from: usize,
    pub to: usize,
    pub stride: usize,
    /// Candidate names for mixed edges, the chosen name otherwise
    pub ops: Vec<String>,
    pub mixed: bool,
}

/// Serializable intermediate node description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTopology {
    pub index: usize,
    pub edges: Vec<EdgeTopology>,
}

/// Serializable cell description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellTopology {
    pub index: usize,
    pub reduction: bool,
    pub reduction_prev: bool,
    pub c_prev_prev: usize,
    pub c_prev: usize,
    pub channels: usize,
    pub nodes: Vec<NodeTopology>,
}

/// Cell/node/edge topology of a macro graph (no weights)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphTopology {
    pub in_channels: usize,
    pub stem_channels: usize,
    pub num_classes: usize,
    pub steps: usize,
    pub cells: Vec<CellTopology>,
}

impl GraphTopology {
    /// Fully connected search space described by `config`
    pub fn search_space(config: &SearchConfig) -> Result<Self> {
        config.validate()?;
        let stem_channels = config.stem_multiplier * config.init_channels;
        let (mut c_prev_prev, mut c_prev) = (stem_channels, stem_channels);
        let mut channels = config.init_channels;
        let mut reduction_prev = false;
        let mut cells = Vec::with_capacity(config.layers);

        for index in 0..config.layers {
            let reduction = config.is_reduction_cell(index);
            if reduction {
                channels *= 2;
            }
            let nodes = (0..config.steps)
                .map(|step| {
                    let to = step + 2;
                    NodeTopology {
                        index: to,
                        edges: (0..to)
                            .map(|from| EdgeTopology {
                                from,
                                to,
                                stride: if reduction && from < 2 { 2 } else { 1 },
                                ops: config.primitives.clone(),
                                mixed: true,
                            })
                            .collect(),
                    }
                })
                .collect();
            cells.push(CellTopology {
                index,
                reduction,
                reduction_prev,
                c_prev_prev,
                c_prev,
                channels,
                nodes,
            });
            reduction_prev = reduction;
            c_prev_prev = c_prev;
            c_prev = config.steps * channels;
        }

        Ok(Self {
            in_channels: config.in_channels,
            stem_channels,
            num_classes: config.num_classes()?,
            steps: config.steps,
            cells,
        })
    }

    pub fn num_edges(&self) -> usize {
        self.cells
            .iter()
            .flat_map(|c| c.nodes.iter())
            .map(|n| n.edges.len())
            .sum()
    }

    /// Write as pretty JSON, creating parent directories
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

// ─── Macro graph ──────────────────────────────────────────────────────────────

/// 3×3 conv + BatchNorm lifting the image to the stem width
#[derive(Debug, Clone)]
pub struct Stem {
    conv: Conv2d,
    bn: BatchNorm2d,
}

impl Stem {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.bn.forward(&self.conv.forward(x)?)
    }

    fn num_parameters(&self) -> usize {
        self.conv.num_parameters() + self.bn.num_parameters()
    }
}

/// Node of the macro graph
#[derive(Debug, Clone)]
pub enum MacroNode {
    Input { channels: usize },
    Stem(Stem),
    Cell(Cell),
    /// Global average pooling
    Pooling,
    Classifier(Linear),
}

impl MacroNode {
    pub fn as_cell(&self) -> Option<&Cell> {
        match self {
            MacroNode::Cell(cell) => Some(cell),
            _ => None,
        }
    }
}

/// Cell-based network, either a search super-network or a discrete child
#[derive(Debug, Clone)]
pub struct MacroGraph {
    config: SearchConfig,
    registry: Arc<OperationRegistry>,
    topology: GraphTopology,
    nodes: Vec<MacroNode>,
}

impl MacroGraph {
    /// Build the search super-network and persist its topology to `filename`
    pub fn from_config(
        config: &SearchConfig,
        filename: impl AsRef<Path>,
        registry: Arc<OperationRegistry>,
    ) -> Result<Self> {
        let graph = Self::new(config, registry)?;
        graph.save_topology(&filename)?;
        info!(
            path = %filename.as_ref().display(),
            cells = graph.num_cells(),
            edges = graph.topology.num_edges(),
            "Search graph topology written"
        );
        Ok(graph)
    }

    /// Build the search super-network without persisting it
    pub fn new(config: &SearchConfig, registry: Arc<OperationRegistry>) -> Result<Self> {
        config.validate_against(&registry)?;
        let topology = GraphTopology::search_space(config)?;
        Self::from_topology(config, registry, topology)
    }

    /// Rebuild a graph from a topology description
    pub fn from_topology(
        config: &SearchConfig,
        registry: Arc<OperationRegistry>,
        topology: GraphTopology,
    ) -> Result<Self> {
        let mut alpha_rng = Xoshiro256PlusPlus::seed_from_u64(config.seed);
        let mut shared: HashMap<(bool, usize, usize), ArchWeights> = HashMap::new();
        let args = |c_in: usize, c_out: usize, stride: usize, seed: u64| {
            OpArgs::new(c_out, stride)
                .with_channels(c_in, c_out)
                .with_affine(config.affine)
                .with_track_running_stats(config.track_running_stats)
                .with_seed(seed)
        };

        let mut init_rng = Xoshiro256PlusPlus::seed_from_u64(derive_seed(config.seed, &[u64::MAX]));
        let stem = Stem {
            conv: Conv2d::new(topology.in_channels, topology.stem_channels, 3, 1, 1, 1, 1, false, &mut init_rng)?,
            bn: BatchNorm2d::new(topology.stem_channels, true, config.track_running_stats),
        };

        let mut nodes = vec![MacroNode::Input { channels: topology.in_channels }, MacroNode::Stem(stem)];
        let mut c_prev = topology.stem_channels;

        for cell_topo in &topology.cells {
            let CellTopology { index, reduction, reduction_prev, c_prev_prev, channels, .. } = *cell_topo;
            let pre_seed = |slot: u64| derive_seed(config.seed, &[index as u64, slot]);
            let preprocess0 = if reduction_prev {
                Operation::FactorizedReduce(FactorizedReduce::new(
                    c_prev_prev,
                    channels,
                    2,
                    config.affine,
                    config.track_running_stats,
                    &mut Xoshiro256PlusPlus::seed_from_u64(pre_seed(0)),
                )?)
            } else {
                Operation::ConvNormBlock(ConvNormBlock::new(
                    c_prev_prev,
                    channels,
                    1,
                    1,
                    0,
                    1,
                    config.affine,
                    config.track_running_stats,
                    &mut Xoshiro256PlusPlus::seed_from_u64(pre_seed(0)),
                )?)
            };
            let preprocess1 = Operation::ConvNormBlock(ConvNormBlock::new(
                cell_topo.c_prev,
                channels,
                1,
                1,
                0,
                1,
                config.affine,
                config.track_running_stats,
                &mut Xoshiro256PlusPlus::seed_from_u64(pre_seed(1)),
            )?);

            if cell_topo.nodes.is_empty() {
                return Err(KolosalError::ConfigError(format!("cell {} has no intermediate nodes", index)));
            }
            let mut cell_nodes = Vec::with_capacity(cell_topo.nodes.len());
            for (position, node_topo) in cell_topo.nodes.iter().enumerate() {
                // node i may only read states 0..i
                if node_topo.index != position + 2 {
                    return Err(KolosalError::ConfigError(format!(
                        "cell {} lists node {} at position {}, expected node {}",
                        index,
                        node_topo.index,
                        position,
                        position + 2
                    )));
                }
                let mut edges = Vec::with_capacity(node_topo.edges.len());
                for edge_topo in &node_topo.edges {
                    if edge_topo.from >= node_topo.index || edge_topo.to != node_topo.index {
                        return Err(KolosalError::ConfigError(format!(
                            "edge {} -> {} in cell {} breaks the node order",
                            edge_topo.from, edge_topo.to, index
                        )));
                    }
                    let seed_of = |op_idx: usize| {
                        derive_seed(
                            config.seed,
                            &[index as u64, node_topo.index as u64, edge_topo.from as u64, op_idx as u64 + 2],
                        )
                    };
                    let op = if edge_topo.mixed {
                        let ops = edge_topo
                            .ops
                            .iter()
                            .enumerate()
                            .map(|(k, name)| {
                                registry.construct(name, &args(channels, channels, edge_topo.stride, seed_of(k)))
                            })
                            .collect::<Result<Vec<_>>>()?;
                        let key = (reduction, node_topo.index, edge_topo.from);
                        let mut fresh_alpha = || -> ArchWeights {
                            Arc::new(RwLock::new(Array1::from_shape_fn(edge_topo.ops.len(), |_| {
                                (alpha_rng.gen::<f64>() - 0.5) * ALPHA_INIT_SCALE
                            })))
                        };
                        let alpha = if config.share_arch_weights {
                            let reused = shared
                                .get(&key)
                                .filter(|existing| existing.read().len() == edge_topo.ops.len())
                                .cloned();
                            match reused {
                                Some(existing) => existing,
                                None => {
                                    let alpha = fresh_alpha();
                                    shared.insert(key, alpha.clone());
                                    alpha
                                }
                            }
                        } else {
                            fresh_alpha()
                        };
                        EdgeOp::Mixed(MixedOp::new(edge_topo.ops.clone(), ops, alpha)?)
                    } else {
                        let name = match edge_topo.ops.as_slice() {
                            [name] => name.clone(),
                            other => {
                                return Err(KolosalError::ConfigError(format!(
                                    "fixed edge {} -> {} in cell {} lists {} operations",
                                    edge_topo.from,
                                    edge_topo.to,
                                    index,
                                    other.len()
                                )))
                            }
                        };
                        let op = registry.construct(&name, &args(channels, channels, edge_topo.stride, seed_of(0)))?;
                        EdgeOp::Fixed { name, op }
                    };
                    edges.push(Edge {
                        from: edge_topo.from,
                        to: edge_topo.to,
                        stride: edge_topo.stride,
                        op,
                    });
                }
                cell_nodes.push(CellNode { index: node_topo.index, edges });
            }

            let cell = Cell {
                index,
                reduction,
                reduction_prev,
                channels,
                preprocess0,
                preprocess1,
                nodes: cell_nodes,
            };
            c_prev = cell.out_channels();
            debug!(cell = index, reduction, channels, "Cell built");
            nodes.push(MacroNode::Cell(cell));
        }

        nodes.push(MacroNode::Pooling);
        nodes.push(MacroNode::Classifier(Linear::new(c_prev, topology.num_classes, &mut init_rng)));

        Ok(Self {
            config: config.clone(),
            registry,
            topology,
            nodes,
        })
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<OperationRegistry> {
        &self.registry
    }

    pub fn topology(&self) -> &GraphTopology {
        &self.topology
    }

    /// Persist the topology as JSON
    pub fn save_topology(&self, path: impl AsRef<Path>) -> Result<()> {
        self.topology.save(path)
    }

    /// Macro node at `index` (0 input, 1 stem, 2.. cells, then pooling and classifier)
    pub fn get_node_op(&self, index: usize) -> Result<&MacroNode> {
        self.nodes.get(index).ok_or(KolosalError::NodeNotFound(index))
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn cells(&self) -> impl Iterator<Item = &Cell> {
        self.nodes.iter().filter_map(MacroNode::as_cell)
    }

    pub fn cell(&self, index: usize) -> Option<&Cell> {
        self.cells().nth(index)
    }

    pub fn num_cells(&self) -> usize {
        self.cells().count()
    }

    /// True once no edge holds a mixture
    pub fn is_discrete(&self) -> bool {
        self.cells().flat_map(Cell::edges).all(|e| !e.is_mixed())
    }

    /// Distinct architecture weight handles, in graph order
    pub fn arch_weights(&self) -> Vec<ArchWeights> {
        let mut handles: Vec<ArchWeights> = Vec::new();
        for edge in self.cells().flat_map(Cell::edges) {
            if let EdgeOp::Mixed(mixed) = &edge.op {
                if !handles.iter().any(|h| Arc::ptr_eq(h, &mixed.alpha)) {
                    handles.push(mixed.alpha.clone());
                }
            }
        }
        handles
    }

    /// Learnable network parameters (architecture weights excluded)
    pub fn num_parameters(&self) -> usize {
        self.nodes
            .iter()
            .map(|node| match node {
                MacroNode::Stem(stem) => stem.num_parameters(),
                MacroNode::Cell(cell) => cell.num_parameters(),
                MacroNode::Classifier(linear) => linear.num_parameters(),
                MacroNode::Input { .. } | MacroNode::Pooling => 0,
            })
            .sum()
    }

    /// Bind trainable tensors to an external optimizer
    pub fn parse<O: ArchOptimizer + ?Sized>(&self, optimizer: &mut O) {
        let handles = self.arch_weights();
        let n_handles = handles.len();
        for handle in handles {
            optimizer.register_arch_weights(handle);
        }
        for (index, node) in self.nodes.iter().enumerate() {
            match node {
                MacroNode::Stem(stem) => optimizer.register_parameters("stem", stem.num_parameters()),
                MacroNode::Cell(cell) => {
                    optimizer.register_parameters(&format!("cell_{}", cell.index), cell.num_parameters())
                }
                MacroNode::Classifier(linear) => {
                    optimizer.register_parameters("classifier", linear.num_parameters())
                }
                MacroNode::Input { .. } | MacroNode::Pooling => {
                    debug!(node = index, "No parameters to register")
                }
            }
        }
        info!(arch_weights = n_handles, params = self.num_parameters(), "Graph bound to optimizer");
    }

    /// Logits `[batch, num_classes]` for an NCHW image batch
    pub fn forward(&self, x: &Tensor) -> Result<Array2<f64>> {
        let mut s0: Option<Tensor> = None;
        let mut s1: Option<Tensor> = None;
        let mut pooled: Option<Array2<f64>> = None;

        for node in &self.nodes {
            match node {
                MacroNode::Input { channels } => {
                    if x.dim().1 != *channels {
                        return Err(KolosalError::shape(format!("{} input channels", channels), shape_of(x)));
                    }
                }
                MacroNode::Stem(stem) => {
                    let s = stem.forward(x)?;
                    s0 = Some(s.clone());
                    s1 = Some(s);
                }
                MacroNode::Cell(cell) => {
                    let (prev_prev, prev) = match (&s0, &s1) {
                        (Some(a), Some(b)) => (a, b),
                        _ => return Err(KolosalError::ComputationError("cell before stem".to_string())),
                    };
                    let out = cell.forward(prev_prev, prev)?;
                    s0 = s1.take();
                    s1 = Some(out);
                }
                MacroNode::Pooling => {
                    let features = s1
                        .as_ref()
                        .ok_or_else(|| KolosalError::ComputationError("pooling before stem".to_string()))?;
                    pooled = Some(global_avg_pool(features));
                }
                MacroNode::Classifier(linear) => {
                    let features = pooled
                        .as_ref()
                        .ok_or_else(|| KolosalError::ComputationError("classifier before pooling".to_string()))?;
                    return linear.forward(features);
                }
            }
        }
        Err(KolosalError::ComputationError("graph has no classifier".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nas::registry::NONE_OP;

    fn small_config() -> SearchConfig {
        SearchConfig::default()
            .with_channels(4)
            .with_layers(3)
            .with_steps(2)
            .with_input_size(8)
    }

    fn registry() -> Arc<OperationRegistry> {
        Arc::new(OperationRegistry::nas_bench_201())
    }

    #[test]
    fn test_search_space_topology() {
        let topo = GraphTopology::search_space(&small_config()).unwrap();
        assert_eq!(topo.cells.len(), 3);
        assert!(topo.cells[1].reduction);
        assert!(topo.cells[2].reduction);
        assert_eq!(topo.cells[1].channels, 8);
        assert_eq!(topo.cells[2].channels, 16);
        // nodes 2 and 3 have 2 and 3 incoming edges
        assert_eq!(topo.num_edges(), 3 * (2 + 3));
        let reduce_strides: Vec<usize> = topo.cells[1].nodes[1].edges.iter().map(|e| e.stride).collect();
        assert_eq!(reduce_strides, vec![2, 2, 1]);
    }

    #[test]
    fn test_graph_structure() {
        let graph = MacroGraph::new(&small_config(), registry()).unwrap();
        assert_eq!(graph.num_cells(), 3);
        assert_eq!(graph.num_nodes(), 2 + 3 + 2);
        let cell = graph.get_node_op(FIRST_CELL_NODE).unwrap().as_cell().unwrap();
        assert_eq!(cell.inter_nodes().len(), 2);
        assert_eq!(cell.node(3).unwrap().input_edges(), vec![0, 1, 2]);
        assert!(matches!(graph.get_node_op(99), Err(KolosalError::NodeNotFound(99))));
        assert!(!graph.is_discrete());
    }

    #[test]
    fn test_forward_shape() {
        let graph = MacroGraph::new(&small_config(), registry()).unwrap();
        let x = Tensor::from_shape_fn((2, 3, 8, 8), |(n, c, i, j)| ((n + c + i * j) % 5) as f64 * 0.1);
        let logits = graph.forward(&x).unwrap();
        assert_eq!(logits.dim(), (2, 10));
        assert!(logits.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_forward_rejects_wrong_channels() {
        let graph = MacroGraph::new(&small_config(), registry()).unwrap();
        let x = Tensor::zeros((1, 1, 8, 8));
        assert!(matches!(graph.forward(&x), Err(KolosalError::ShapeError { .. })));
    }

    #[test]
    fn test_shared_arch_weights() {
        let shared = MacroGraph::new(&small_config(), registry()).unwrap();
        // one normal and one reduction set, 5 edges each
        assert_eq!(shared.arch_weights().len(), 10);

        let independent =
            MacroGraph::new(&small_config().with_shared_arch_weights(false), registry()).unwrap();
        assert_eq!(independent.arch_weights().len(), 15);
    }

    #[test]
    fn test_mixture_weights_follow_alpha() {
        let graph = MacroGraph::new(&small_config(), registry()).unwrap();
        let edge = graph.cell(0).unwrap().node(2).unwrap().edges()[0].clone();
        let EdgeOp::Mixed(mixed) = &edge.op else { panic!("expected a mixed edge") };
        assert_eq!(mixed.names()[0], NONE_OP);
        mixed.set_alpha(Array1::from(vec![0.0, 5.0, 0.0, 0.0, 0.0])).unwrap();
        let weights = mixed.mixture_weights();
        assert!((weights.sum() - 1.0).abs() < 1e-12);
        assert!(weights[1] > 0.9);
        assert!(mixed.set_alpha(Array1::zeros(2)).is_err());
    }

    #[test]
    fn test_from_config_writes_topology() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("graph.json");
        let graph = MacroGraph::from_config(&small_config(), &path, registry()).unwrap();
        let loaded = GraphTopology::load(&path).unwrap();
        assert_eq!(&loaded, graph.topology());

        let rebuilt = MacroGraph::from_topology(&small_config(), registry(), loaded).unwrap();
        assert_eq!(rebuilt.topology(), graph.topology());
        assert_eq!(rebuilt.num_parameters(), graph.num_parameters());
    }

    #[test]
    fn test_same_seed_same_graph() {
        let a = MacroGraph::new(&small_config(), registry()).unwrap();
        let b = MacroGraph::new(&small_config(), registry()).unwrap();
        let x = Tensor::from_shape_fn((1, 3, 8, 8), |(_, c, i, j)| (c * 7 + i + j) as f64 * 0.05);
        assert_eq!(a.forward(&x).unwrap(), b.forward(&x).unwrap());
        assert_eq!(a.arch_weights()[0].read().clone(), b.arch_weights()[0].read().clone());
    }

    #[test]
    fn test_from_topology_rejects_node_order() {
        let mut swapped = GraphTopology::search_space(&small_config()).unwrap();
        for cell in swapped.cells.iter_mut() {
            cell.nodes.swap(0, 1);
        }
        assert!(matches!(
            MacroGraph::from_topology(&small_config(), registry(), swapped),
            Err(KolosalError::ConfigError(_))
        ));

        let mut gapped = GraphTopology::search_space(&small_config()).unwrap();
        gapped.cells[0].nodes.remove(0);
        assert!(matches!(
            MacroGraph::from_topology(&small_config(), registry(), gapped),
            Err(KolosalError::ConfigError(_))
        ));

        let mut empty = GraphTopology::search_space(&small_config()).unwrap();
        empty.cells[2].nodes.clear();
        assert!(matches!(
            MacroGraph::from_topology(&small_config(), registry(), empty),
            Err(KolosalError::ConfigError(_))
        ));
    }

    #[test]
    fn test_derive_seed_spreads() {
        assert_ne!(derive_seed(1, &[0, 0]), derive_seed(1, &[0, 1]));
        assert_ne!(derive_seed(1, &[0]), derive_seed(2, &[0]));
        assert_eq!(derive_seed(5, &[3, 4]), derive_seed(5, &[3, 4]));
    }
}
