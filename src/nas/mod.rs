//! Neural architecture search
//!
//! Differentiable, cell-based search spaces:
//! - [`registry`] - Named operation factories
//! - [`primitives`] - Convolutional building blocks
//! - [`graph`] - Macro graph of cells with mixed edges
//! - [`discretize`] - Top-k edge selection into a discrete child network
//! - [`optimizer`] - Architecture weight optimizers
//! - [`evaluator`] - Size and forward-pass checks of built networks

pub mod config;
pub mod discretize;
pub mod evaluator;
pub mod graph;
pub mod optimizer;
pub mod primitives;
pub mod registry;
pub mod tensor;

pub use config::{NoneRanking, SearchConfig};
pub use discretize::{select_edges, EdgeChoice, EdgeWeights};
pub use evaluator::{ArchitectureEvaluator, EvaluationConfig, EvaluationResult, Network};
pub use graph::{
    ArchWeights, Cell, CellNode, Edge, EdgeOp, GraphTopology, MacroGraph, MacroNode, MixedOp,
};
pub use optimizer::{ArchOptimizer, ArchOptimizerConfig, DartsArchOptimizer};
pub use primitives::{Operation, OperationKind};
pub use registry::{OpArgs, OpFactory, OperationRegistry, DARTS_PRIMITIVES, NAS_BENCH_201_PRIMITIVES, NONE_OP};
pub use tensor::Tensor;
