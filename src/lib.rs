//! Kolosal NAS - Differentiable neural architecture search
//!
//! Builds cell-based convolutional super-networks whose edges mix candidate
//! operations, and discretizes them into standalone child networks.
//!
//! # Modules
//!
//! - [`nas`] - Operation registry, primitives, macro graph, discretizer
//! - [`cli`] - Command-line search driver

// Core error handling
pub mod error;

pub mod nas;

// Services
pub mod cli;

pub use error::{KolosalError, Result};

/// Re-export commonly used types
pub mod prelude {
    // Error handling
    pub use crate::error::{KolosalError, Result};

    // Neural architecture search
    pub use crate::nas::{
        ArchOptimizer, ArchitectureEvaluator, DartsArchOptimizer, EvaluationConfig, GraphTopology, MacroGraph,
        NoneRanking, OpArgs, Operation, OperationRegistry, SearchConfig, Tensor,
    };
}
