//! Architecture Evaluator
//!
//! Sanity-checks a built network: parameter count, FLOP estimate and a timed
//! forward pass on a synthetic batch. Results are cached by architecture id,
//! which covers the topology and the initialization seed. Weights edited after
//! construction are not part of the id, so call `clear_cache` after training.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use ndarray::Array2;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::config::SearchConfig;
use super::graph::MacroGraph;
use super::tensor::Tensor;
use crate::error::{KolosalError, Result};

/// A network the evaluator can run
pub trait Network {
    /// Logits `[batch, num_classes]`
    fn forward(&self, x: &Tensor) -> Result<Array2<f64>>;

    /// Learnable parameters
    fn num_parameters(&self) -> usize;

    /// Stable identifier of the architecture and its initialization
    fn arch_id(&self) -> u64;

    /// Estimated floating point operations for one square image
    fn estimate_flops(&self, input_size: usize) -> usize;
}

impl Network for MacroGraph {
    fn forward(&self, x: &Tensor) -> Result<Array2<f64>> {
        MacroGraph::forward(self, x)
    }

    fn num_parameters(&self) -> usize {
        MacroGraph::num_parameters(self)
    }

    fn arch_id(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        // topology only holds strings and integers
        serde_json::to_string(self.topology())
            .unwrap_or_default()
            .hash(&mut hasher);
        self.config().seed.hash(&mut hasher);
        hasher.finish()
    }

    fn estimate_flops(&self, input_size: usize) -> usize {
        // multiply-adds per output pixel ≈ parameters
        let mut resolution = input_size;
        let mut flops = 0;
        for cell in self.cells() {
            if cell.is_reduction() {
                resolution = (resolution + 1) / 2;
            }
            flops += 2 * cell.num_parameters() * resolution * resolution;
        }
        let stem = self.topology().stem_channels * self.topology().in_channels * 9;
        flops + 2 * stem * input_size * input_size
    }
}

/// Evaluation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    /// Synthetic batch size
    pub batch_size: usize,
    /// Spatial size of the synthetic images
    pub input_size: usize,
    /// Image channels
    pub in_channels: usize,
    /// Seed of the synthetic batch
    pub seed: u64,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            batch_size: 2,
            input_size: 32,
            in_channels: 3,
            seed: 0,
        }
    }
}

impl From<&SearchConfig> for EvaluationConfig {
    fn from(config: &SearchConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            input_size: config.input_size,
            in_channels: config.in_channels,
            seed: config.seed,
        }
    }
}

/// Result of architecture evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationResult {
    /// Architecture identifier/hash
    pub arch_id: u64,
    /// Number of parameters
    pub num_params: usize,
    /// Number of FLOPs (estimated)
    pub flops: Option<usize>,
    /// Shape of the logits
    pub output_shape: Vec<usize>,
    /// Forward pass time in seconds
    pub forward_time: f64,
    pub evaluated_at: DateTime<Utc>,
    /// Additional metrics
    pub extra_metrics: HashMap<String, f64>,
}

impl EvaluationResult {
    /// Create new result
    pub fn new(arch_id: u64) -> Self {
        Self {
            arch_id,
            num_params: 0,
            flops: None,
            output_shape: Vec::new(),
            forward_time: 0.0,
            evaluated_at: Utc::now(),
            extra_metrics: HashMap::new(),
        }
    }

    /// Set number of parameters
    pub fn with_num_params(mut self, n: usize) -> Self {
        self.num_params = n;
        self
    }

    pub fn with_flops(mut self, flops: usize) -> Self {
        self.flops = Some(flops);
        self
    }

    pub fn with_output_shape(mut self, shape: &[usize]) -> Self {
        self.output_shape = shape.to_vec();
        self
    }

    /// Set forward time
    pub fn with_forward_time(mut self, t: f64) -> Self {
        self.forward_time = t;
        self
    }

    /// Add extra metric
    pub fn add_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.extra_metrics.insert(name.into(), value);
        self
    }
}

/// Architecture evaluator
pub struct ArchitectureEvaluator {
    /// Configuration
    config: EvaluationConfig,
    /// Evaluation cache
    cache: HashMap<u64, EvaluationResult>,
    /// Number of evaluations performed
    eval_count: usize,
}

impl ArchitectureEvaluator {
    /// Create new evaluator
    pub fn new(config: EvaluationConfig) -> Self {
        Self {
            config,
            cache: HashMap::new(),
            eval_count: 0,
        }
    }

    /// Create with default config
    pub fn default_evaluator() -> Self {
        Self::new(EvaluationConfig::default())
    }

    pub fn config(&self) -> &EvaluationConfig {
        &self.config
    }

    /// Check cache for previous evaluation
    pub fn get_cached<N: Network + ?Sized>(&self, net: &N) -> Option<&EvaluationResult> {
        self.cache.get(&net.arch_id())
    }

    /// Add result to cache
    pub fn cache_result(&mut self, result: EvaluationResult) {
        self.cache.insert(result.arch_id, result);
    }

    /// Seeded synthetic image batch
    pub fn synthetic_batch(&self) -> Tensor {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(self.config.seed);
        let c = &self.config;
        Tensor::from_shape_fn((c.batch_size, c.in_channels, c.input_size, c.input_size), |_| {
            rng.gen_range(-1.0..1.0)
        })
    }

    /// Run one forward pass and collect size statistics
    pub fn evaluate<N: Network + ?Sized>(&mut self, net: &N) -> Result<EvaluationResult> {
        let arch_id = net.arch_id();
        if let Some(cached) = self.cache.get(&arch_id) {
            return Ok(cached.clone());
        }
        self.eval_count += 1;

        let x = self.synthetic_batch();
        let start_time = std::time::Instant::now();
        let logits = net.forward(&x)?;
        let forward_time = start_time.elapsed().as_secs_f64();

        if logits.iter().any(|v| !v.is_finite()) {
            return Err(KolosalError::ComputationError(format!(
                "architecture {:016x} produced non-finite logits",
                arch_id
            )));
        }
        let logit_std = logits.std(0.0);

        let result = EvaluationResult::new(arch_id)
            .with_num_params(net.num_parameters())
            .with_flops(net.estimate_flops(self.config.input_size))
            .with_output_shape(logits.shape())
            .with_forward_time(forward_time)
            .add_metric("logit_std", logit_std);

        info!(
            arch_id = %format!("{:016x}", arch_id),
            params = result.num_params,
            forward_ms = forward_time * 1e3,
            "Architecture evaluated"
        );
        self.cache_result(result.clone());
        Ok(result)
    }

    /// Get number of evaluations
    pub fn eval_count(&self) -> usize {
        self.eval_count
    }

    /// Get cache size
    pub fn cache_size(&self) -> usize {
        self.cache.len()
    }

    /// Clear cache
    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nas::registry::OperationRegistry;
    use std::sync::Arc;

    fn small_config() -> SearchConfig {
        SearchConfig::default()
            .with_channels(4)
            .with_layers(3)
            .with_steps(2)
            .with_input_size(8)
    }

    fn child() -> MacroGraph {
        let registry = Arc::new(OperationRegistry::nas_bench_201());
        let search = MacroGraph::new(&small_config(), registry).unwrap();
        search.discretize(&small_config(), &[2, 2]).unwrap()
    }

    #[test]
    fn test_evaluator_creation() {
        let evaluator = ArchitectureEvaluator::default_evaluator();
        assert_eq!(evaluator.eval_count(), 0);
        assert_eq!(evaluator.config().input_size, 32);
    }

    #[test]
    fn test_evaluate_child() {
        let net = child();
        let mut evaluator = ArchitectureEvaluator::new(EvaluationConfig::from(&small_config()));
        let result = evaluator.evaluate(&net).unwrap();
        assert_eq!(result.output_shape, vec![2, 10]);
        assert_eq!(result.num_params, net.num_parameters());
        assert!(result.flops.unwrap() > 0);
        assert!(result.extra_metrics.contains_key("logit_std"));
    }

    #[test]
    fn test_caching() {
        let net = child();
        let mut evaluator = ArchitectureEvaluator::new(EvaluationConfig::from(&small_config()));
        evaluator.evaluate(&net).unwrap();
        assert_eq!(evaluator.eval_count(), 1);
        evaluator.evaluate(&net).unwrap();
        assert_eq!(evaluator.eval_count(), 1);
        assert!(evaluator.get_cached(&net).is_some());
        evaluator.clear_cache();
        assert_eq!(evaluator.cache_size(), 0);
    }

    #[test]
    fn test_arch_id_tracks_topology() {
        let registry = Arc::new(OperationRegistry::nas_bench_201());
        let search = MacroGraph::new(&small_config(), registry).unwrap();
        let a = search.discretize(&small_config(), &[2, 2]).unwrap();
        let b = search.discretize(&small_config(), &[1, 1]).unwrap();
        assert_ne!(a.arch_id(), b.arch_id());
        assert_ne!(search.arch_id(), a.arch_id());
    }

    #[test]
    fn test_cache_separates_seeds() {
        let registry = Arc::new(OperationRegistry::nas_bench_201());
        let search = MacroGraph::new(&small_config(), registry).unwrap();
        let a = search.discretize(&small_config(), &[2, 2]).unwrap();
        let b = search.discretize(&small_config().with_seed(7), &[2, 2]).unwrap();
        assert_eq!(a.topology(), b.topology());
        assert_ne!(a.arch_id(), b.arch_id());

        let mut evaluator = ArchitectureEvaluator::new(EvaluationConfig::from(&small_config()));
        let ra = evaluator.evaluate(&a).unwrap();
        let rb = evaluator.evaluate(&b).unwrap();
        assert_eq!(evaluator.eval_count(), 2);
        assert_eq!(evaluator.cache_size(), 2);
        assert_ne!(ra.arch_id, rb.arch_id);
    }

    #[test]
    fn test_synthetic_batch_is_seeded() {
        let evaluator = ArchitectureEvaluator::new(EvaluationConfig { seed: 9, ..Default::default() });
        assert_eq!(evaluator.synthetic_batch(), evaluator.synthetic_batch());
        assert_eq!(evaluator.synthetic_batch().dim(), (2, 3, 32, 32));
    }

    #[test]
    fn test_evaluation_result_builder() {
        let result = EvaluationResult::new(12345)
            .with_num_params(10000)
            .with_flops(42)
            .add_metric("logit_std", 0.5);
        assert_eq!(result.num_params, 10000);
        assert_eq!(result.flops, Some(42));
        assert_eq!(result.extra_metrics.get("logit_std"), Some(&0.5));
    }
}
