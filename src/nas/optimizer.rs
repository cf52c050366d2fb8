//! Architecture Optimizers
//!
//! Receivers for the trainable tensors of a macro graph. Gradient computation
//! is the caller's concern; optimizers only apply updates.

use ndarray::Array1;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::graph::ArchWeights;
use crate::error::{KolosalError, Result};

/// Something a graph can register its trainable tensors with
pub trait ArchOptimizer {
    /// Register one architecture weight handle (called once per distinct handle)
    fn register_arch_weights(&mut self, weights: ArchWeights);

    /// Register a block of network parameters
    fn register_parameters(&mut self, _name: &str, _count: usize) {}
}

/// Architecture optimizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchOptimizerConfig {
    /// Architecture learning rate
    pub arch_learning_rate: f64,
    /// Architecture weight decay
    pub arch_weight_decay: f64,
}

impl Default for ArchOptimizerConfig {
    fn default() -> Self {
        Self {
            arch_learning_rate: 3e-4,
            arch_weight_decay: 1e-3,
        }
    }
}

/// First-order DARTS update: SGD with weight decay on the logits
#[derive(Debug, Default)]
pub struct DartsArchOptimizer {
    config: ArchOptimizerConfig,
    arch_weights: Vec<ArchWeights>,
    parameter_blocks: Vec<(String, usize)>,
}

impl DartsArchOptimizer {
    pub fn new(config: ArchOptimizerConfig) -> Self {
        Self {
            config,
            arch_weights: Vec::new(),
            parameter_blocks: Vec::new(),
        }
    }

    pub fn config(&self) -> &ArchOptimizerConfig {
        &self.config
    }

    pub fn arch_weights(&self) -> &[ArchWeights] {
        &self.arch_weights
    }

    pub fn num_arch_weights(&self) -> usize {
        self.arch_weights.len()
    }

    /// Total registered network parameters
    pub fn num_parameters(&self) -> usize {
        self.parameter_blocks.iter().map(|(_, n)| n).sum()
    }

    pub fn parameter_blocks(&self) -> &[(String, usize)] {
        &self.parameter_blocks
    }

    /// Apply one gradient per registered handle, in registration order
    pub fn step(&mut self, grads: &[Array1<f64>]) -> Result<()> {
        if grads.len() != self.arch_weights.len() {
            return Err(KolosalError::ConfigMismatch(format!(
                "{} gradients for {} architecture weights",
                grads.len(),
                self.arch_weights.len()
            )));
        }
        let lr = self.config.arch_learning_rate;
        let decay = self.config.arch_weight_decay;
        for (handle, grad) in self.arch_weights.iter().zip(grads) {
            let mut alpha = handle.write();
            if alpha.len() != grad.len() {
                return Err(KolosalError::shape(alpha.len(), grad.len()));
            }
            alpha.zip_mut_with(grad, |a, g| {
                *a -= lr * (g + decay * *a);
            });
        }
        Ok(())
    }
}

impl ArchOptimizer for DartsArchOptimizer {
    fn register_arch_weights(&mut self, weights: ArchWeights) {
        self.arch_weights.push(weights);
    }

    fn register_parameters(&mut self, name: &str, count: usize) {
        debug!(block = name, count, "Parameters registered");
        self.parameter_blocks.push((name.to_string(), count));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nas::config::SearchConfig;
    use crate::nas::graph::MacroGraph;
    use crate::nas::registry::OperationRegistry;
    use std::sync::Arc;

    fn graph() -> MacroGraph {
        let config = SearchConfig::default().with_channels(4).with_layers(3).with_steps(2);
        MacroGraph::new(&config, Arc::new(OperationRegistry::nas_bench_201())).unwrap()
    }

    #[test]
    fn test_parse_registers_each_handle_once() {
        let graph = graph();
        let mut optimizer = DartsArchOptimizer::default();
        graph.parse(&mut optimizer);
        assert_eq!(optimizer.num_arch_weights(), graph.arch_weights().len());
        assert_eq!(optimizer.num_parameters(), graph.num_parameters());
        let names: Vec<&str> = optimizer.parameter_blocks().iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["stem", "cell_0", "cell_1", "cell_2", "classifier"]);
    }

    #[test]
    fn test_step_updates_graph_weights() {
        let graph = graph();
        let mut optimizer = DartsArchOptimizer::new(ArchOptimizerConfig {
            arch_learning_rate: 0.5,
            arch_weight_decay: 0.0,
        });
        graph.parse(&mut optimizer);
        let before = graph.arch_weights()[0].read().clone();
        let grads: Vec<Array1<f64>> = optimizer
            .arch_weights()
            .iter()
            .map(|h| Array1::ones(h.read().len()))
            .collect();
        optimizer.step(&grads).unwrap();
        let after = graph.arch_weights()[0].read().clone();
        for (a, b) in after.iter().zip(before.iter()) {
            assert!((a - (b - 0.5)).abs() < 1e-12);
        }
    }

    #[test]
    fn test_step_rejects_wrong_count() {
        let graph = graph();
        let mut optimizer = DartsArchOptimizer::default();
        graph.parse(&mut optimizer);
        assert!(matches!(optimizer.step(&[]), Err(KolosalError::ConfigMismatch(_))));
    }

    #[test]
    fn test_weight_decay_shrinks_logits() {
        let handle: ArchWeights = Arc::new(parking_lot::RwLock::new(Array1::from(vec![1.0, -1.0])));
        let mut optimizer = DartsArchOptimizer::new(ArchOptimizerConfig {
            arch_learning_rate: 0.1,
            arch_weight_decay: 1.0,
        });
        optimizer.register_arch_weights(handle.clone());
        optimizer.step(&[Array1::zeros(2)]).unwrap();
        let alpha = handle.read();
        assert!((alpha[0] - 0.9).abs() < 1e-12);
        assert!((alpha[1] + 0.9).abs() < 1e-12);
    }
}
