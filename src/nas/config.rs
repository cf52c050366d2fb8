//! Search and evaluation configuration

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::registry::{OperationRegistry, NAS_BENCH_201_PRIMITIVES};
use crate::error::{KolosalError, Result};

/// Whether the `none` operation's weight takes part in ranking edges.
///
/// The representative operation of an edge is never `none`; this only
/// decides which weight is compared across edges of the same node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoneRanking {
    /// Rank by the representative (best non-`none`) weight
    #[default]
    Exclude,
    /// Rank by the largest weight on the edge, `none` included
    Include,
}

/// Configuration of a cell-based search space
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Random seed
    pub seed: u64,
    /// Dataset name (cifar10, cifar100, ImageNet16-120, ...)
    pub dataset: String,
    /// Output directory
    pub save: PathBuf,
    /// Number of search (or retraining) epochs
    pub epochs: usize,
    /// Image channels fed to the stem
    pub in_channels: usize,
    /// Channels of the first cell
    pub init_channels: usize,
    /// Number of cells
    pub layers: usize,
    /// Intermediate nodes per cell
    pub steps: usize,
    /// Stem width as a multiple of `init_channels`
    pub stem_multiplier: usize,
    /// Classifier outputs; derived from the dataset when absent
    pub num_classes: Option<usize>,
    /// Candidate operations on every edge
    pub primitives: Vec<String>,
    /// Learnable affine parameters in normalization layers
    pub affine: bool,
    /// Running statistics in normalization layers
    pub track_running_stats: bool,
    /// Share architecture weights across cells of the same type
    pub share_arch_weights: bool,
    /// Incoming edges kept per intermediate node at discretization
    pub n_input_edges: Option<Vec<usize>>,
    /// Ranking policy for the `none` operation
    pub none_ranking: NoneRanking,
    /// Spatial input size used by the evaluator
    pub input_size: usize,
    /// Batch size used by the evaluator
    pub batch_size: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            seed: 1,
            dataset: "cifar10".to_string(),
            save: PathBuf::from("experiments"),
            epochs: 50,
            in_channels: 3,
            init_channels: 16,
            layers: 8,
            steps: 4,
            stem_multiplier: 3,
            num_classes: None,
            primitives: NAS_BENCH_201_PRIMITIVES.iter().map(|s| s.to_string()).collect(),
            affine: false,
            track_running_stats: false,
            share_arch_weights: true,
            n_input_edges: None,
            none_ranking: NoneRanking::Exclude,
            input_size: 32,
            batch_size: 2,
        }
    }
}

impl SearchConfig {
    /// Create a new configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            KolosalError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    /// Save as pretty JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_dataset(mut self, dataset: impl Into<String>) -> Self {
        self.dataset = dataset.into();
        self
    }

    pub fn with_save(mut self, save: impl Into<PathBuf>) -> Self {
        self.save = save.into();
        self
    }

    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn with_channels(mut self, init_channels: usize) -> Self {
        self.init_channels = init_channels;
        self
    }

    pub fn with_layers(mut self, layers: usize) -> Self {
        self.layers = layers;
        self
    }

    pub fn with_steps(mut self, steps: usize) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_primitives<S: AsRef<str>>(mut self, primitives: &[S]) -> Self {
        self.primitives = primitives.iter().map(|s| s.as_ref().to_string()).collect();
        self
    }

    pub fn with_n_input_edges(mut self, n_input_edges: Vec<usize>) -> Self {
        self.n_input_edges = Some(n_input_edges);
        self
    }

    pub fn with_none_ranking(mut self, ranking: NoneRanking) -> Self {
        self.none_ranking = ranking;
        self
    }

    pub fn with_shared_arch_weights(mut self, shared: bool) -> Self {
        self.share_arch_weights = shared;
        self
    }

    pub fn with_input_size(mut self, size: usize) -> Self {
        self.input_size = size;
        self
    }

    /// Classifier width, from the explicit setting or the dataset name
    pub fn num_classes(&self) -> Result<usize> {
        if let Some(n) = self.num_classes {
            return Ok(n);
        }
        match self.dataset.to_lowercase().as_str() {
            "cifar10" => Ok(10),
            "cifar100" => Ok(100),
            "imagenet16-120" | "imagenet16_120" => Ok(120),
            other => Err(KolosalError::ConfigError(format!(
                "num_classes not set and dataset '{}' is unknown",
                other
            ))),
        }
    }

    /// Reduction cells sit at one and two thirds of the depth
    pub fn is_reduction_cell(&self, index: usize) -> bool {
        self.layers >= 3 && (index == self.layers / 3 || index == 2 * self.layers / 3)
    }

    /// Configured keep counts, or two per intermediate node
    pub fn input_edge_policy(&self) -> Vec<usize> {
        self.n_input_edges
            .clone()
            .unwrap_or_else(|| vec![2; self.steps])
    }

    /// Check structural settings
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("in_channels", self.in_channels),
            ("init_channels", self.init_channels),
            ("layers", self.layers),
            ("steps", self.steps),
            ("stem_multiplier", self.stem_multiplier),
            ("input_size", self.input_size),
            ("batch_size", self.batch_size),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(KolosalError::InvalidParameter {
                    name: name.to_string(),
                    value: value.to_string(),
                    reason: "must be positive".to_string(),
                });
            }
        }
        if self.primitives.is_empty() {
            return Err(KolosalError::ConfigError("primitives must not be empty".to_string()));
        }
        if let Some(policy) = &self.n_input_edges {
            if policy.len() != self.steps {
                return Err(KolosalError::ConfigMismatch(format!(
                    "n_input_edges has {} entries for {} intermediate nodes",
                    policy.len(),
                    self.steps
                )));
            }
        }
        self.num_classes()?;
        Ok(())
    }

    /// Validate, including that every primitive exists in `registry`
    pub fn validate_against(&self, registry: &OperationRegistry) -> Result<()> {
        self.validate()?;
        registry.check_names(&self.primitives)
    }
}
