//! Operation Registry
//!
//! Open mapping from operation names to factories. Registries are ordinary
//! values handed to graph construction, so several search spaces with
//! different operation sets can live in one process.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};

use super::primitives::{
    ConvNormBlock, DualSeparableConvBlock, FactorizedReduce, Operation, PartAwareBlock, Pooling,
    ResidualBlock, SeparableConvBlock, Zero, DEFAULT_PARTS,
};
use super::tensor::PoolMode;
use crate::error::{KolosalError, Result};

/// Name of the "no connection" operation
pub const NONE_OP: &str = "none";

/// Default NAS-Bench-201 candidate set
pub const NAS_BENCH_201_PRIMITIVES: [&str; 5] = [
    "none",
    "skip_connect",
    "nor_conv_1x1",
    "nor_conv_3x3",
    "avg_pool_3x3",
];

/// DARTS candidate set
pub const DARTS_PRIMITIVES: [&str; 8] = [
    "none",
    "max_pool_3x3",
    "avg_pool_3x3",
    "skip_connect",
    "sep_conv_3x3",
    "sep_conv_5x5",
    "dil_conv_3x3",
    "dil_conv_5x5",
];

/// Arguments shared by every operation factory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpArgs {
    /// Input channels
    pub c_in: usize,
    /// Output channels
    pub c_out: usize,
    /// Spatial stride
    pub stride: usize,
    /// Learnable affine parameters in normalization layers
    pub affine: bool,
    /// Keep running statistics in normalization layers
    pub track_running_stats: bool,
    /// Seed for parameter initialization
    pub seed: u64,
}

impl OpArgs {
    /// Same-width arguments, as used on cell edges
    pub fn new(channels: usize, stride: usize) -> Self {
        Self {
            c_in: channels,
            c_out: channels,
            stride,
            affine: true,
            track_running_stats: true,
            seed: 0,
        }
    }

    pub fn with_channels(mut self, c_in: usize, c_out: usize) -> Self {
        self.c_in = c_in;
        self.c_out = c_out;
        self
    }

    pub fn with_affine(mut self, affine: bool) -> Self {
        self.affine = affine;
        self
    }

    pub fn with_track_running_stats(mut self, track: bool) -> Self {
        self.track_running_stats = track;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    fn rng(&self) -> Xoshiro256PlusPlus {
        Xoshiro256PlusPlus::seed_from_u64(self.seed)
    }
}

/// Factory signature shared by all registry entries
pub type OpFactory = Arc<dyn Fn(&OpArgs) -> Result<Operation> + Send + Sync>;

/// Named operation factories
#[derive(Clone, Default)]
pub struct OperationRegistry {
    factories: BTreeMap<String, OpFactory>,
}

impl fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationRegistry")
            .field("operations", &self.names())
            .finish()
    }
}

fn conv_norm(kernel: usize, padding: usize) -> impl Fn(&OpArgs) -> Result<Operation> + Send + Sync {
    move |a: &OpArgs| -> Result<Operation> {
        Ok(Operation::ConvNormBlock(ConvNormBlock::new(
            a.c_in, a.c_out, kernel, a.stride, padding, 1, a.affine, a.track_running_stats, &mut a.rng(),
        )?))
    }
}

fn dual_sep_conv(kernel: usize, padding: usize) -> impl Fn(&OpArgs) -> Result<Operation> + Send + Sync {
    move |a: &OpArgs| -> Result<Operation> {
        Ok(Operation::DualSeparableConvBlock(DualSeparableConvBlock::new(
            a.c_in, a.c_out, kernel, a.stride, padding, 1, a.affine, a.track_running_stats, &mut a.rng(),
        )?))
    }
}

fn dil_sep_conv(kernel: usize, padding: usize) -> impl Fn(&OpArgs) -> Result<Operation> + Send + Sync {
    move |a: &OpArgs| -> Result<Operation> {
        Ok(Operation::SeparableConvBlock(SeparableConvBlock::new(
            a.c_in, a.c_out, kernel, a.stride, padding, 2, a.affine, a.track_running_stats, &mut a.rng(),
        )?))
    }
}

fn pooling(mode: PoolMode) -> impl Fn(&OpArgs) -> Result<Operation> + Send + Sync {
    move |a: &OpArgs| -> Result<Operation> {
        Ok(Operation::Pooling(Pooling::new(
            a.c_in, a.c_out, a.stride, mode, a.affine, a.track_running_stats, &mut a.rng(),
        )?))
    }
}

fn zero(a: &OpArgs) -> Result<Operation> {
    Ok(Operation::Zero(Zero::new(a.c_in, a.c_out, a.stride)?))
}

/// Identity at stride 1, factorized reduction whenever the shape changes
fn skip_connect(a: &OpArgs) -> Result<Operation> {
    if a.stride == 1 && a.c_in == a.c_out {
        Ok(Operation::Identity)
    } else {
        Ok(Operation::FactorizedReduce(FactorizedReduce::new(
            a.c_in, a.c_out, a.stride, a.affine, a.track_running_stats, &mut a.rng(),
        )?))
    }
}

fn part_aware(a: &OpArgs) -> Result<Operation> {
    Ok(Operation::PartAwareBlock(Box::new(PartAwareBlock::new(
        a.c_in, a.c_out, a.stride, DEFAULT_PARTS, a.track_running_stats, &mut a.rng(),
    )?)))
}

fn resnet_block(a: &OpArgs) -> Result<Operation> {
    Ok(Operation::ResidualBlock(Box::new(ResidualBlock::new(
        a.c_in, a.c_out, a.stride, a.affine, a.track_running_stats, &mut a.rng(),
    )?)))
}

impl OperationRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entry<F>(mut self, name: &str, factory: F) -> Self
    where
        F: Fn(&OpArgs) -> Result<Operation> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
        self
    }

    /// NAS-Bench-201 operation table
    pub fn nas_bench_201() -> Self {
        Self::new()
            .with_entry(NONE_OP, zero)
            .with_entry("avg_pool_3x3", pooling(PoolMode::Avg))
            .with_entry("max_pool_3x3", pooling(PoolMode::Max))
            .with_entry("nor_conv_7x7", conv_norm(7, 3))
            .with_entry("nor_conv_3x3", conv_norm(3, 1))
            .with_entry("nor_conv_1x1", conv_norm(1, 0))
            .with_entry("dua_sepc_3x3", dual_sep_conv(3, 1))
            .with_entry("dua_sepc_5x5", dual_sep_conv(5, 2))
            .with_entry("dil_sepc_3x3", dil_sep_conv(3, 2))
            .with_entry("dil_sepc_5x5", dil_sep_conv(5, 4))
            .with_entry("skip_connect", skip_connect)
    }

    /// NAS-Bench-201 table plus the DARTS operation names and the
    /// part-aware / residual primitives
    pub fn darts() -> Self {
        Self::nas_bench_201()
            .with_entry("sep_conv_3x3", dual_sep_conv(3, 1))
            .with_entry("sep_conv_5x5", dual_sep_conv(5, 2))
            .with_entry("dil_conv_3x3", dil_sep_conv(3, 2))
            .with_entry("dil_conv_5x5", dil_sep_conv(5, 4))
            .with_entry("part_aware", part_aware)
            .with_entry("resnet_block", resnet_block)
    }

    /// Add a new named factory. Existing entries are never replaced.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> Result<()>
    where
        F: Fn(&OpArgs) -> Result<Operation> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(KolosalError::AlreadyRegistered(name));
        }
        self.factories.insert(name, Arc::new(factory));
        Ok(())
    }

    /// Build the operation registered under `name`
    pub fn construct(&self, name: &str, args: &OpArgs) -> Result<Operation> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| KolosalError::UnknownOperation(name.to_string()))?;
        factory(args)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Fail on the first name that is not registered
    pub fn check_names<S: AsRef<str>>(&self, names: &[S]) -> Result<()> {
        match names.iter().find(|n| !self.contains(n.as_ref())) {
            Some(missing) => Err(KolosalError::UnknownOperation(missing.as_ref().to_string())),
            None => Ok(()),
        }
    }
}
