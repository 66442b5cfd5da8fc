//! Cavity Model
//!
//! A feed-forward classifier over the voxelized environment of a residue
//! whose own atoms have been removed. Outputs unnormalized logits over the
//! 20 amino acids.
//!
use crate::residues::NUM_AMINO_ACIDS;
use crate::transform::VoxelConfig;
use anyhow::Context;
use candle_core::{DType, Device, Module, ModuleT, Result, Tensor};
use candle_nn::ops::leaky_relu;
use candle_nn::{linear, Dropout, Linear, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CavityModelConfig {
    pub voxel: VoxelConfig,
    pub hidden_dim: usize,
    pub dense_dim: usize,
    pub dropout_ratio: f32,
    pub negative_slope: f64,
}

impl Default for CavityModelConfig {
    fn default() -> Self {
        Self {
            voxel: VoxelConfig::default(),
            hidden_dim: 256,
            dense_dim: 100,
            dropout_ratio: 0.1,
            negative_slope: 0.01,
        }
    }
}

impl CavityModelConfig {
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read model config {}", path.display()))?;
        Ok(serde_json::from_str(&config_str)?)
    }
    pub fn to_json_file(&self, path: &Path) -> anyhow::Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("failed to write model config {}", path.display()))
    }
}

#[derive(Clone, Debug)]
pub struct CavityModel {
    lin1: Linear,
    lin2: Linear,
    lin_out: Linear,
    dropout: Dropout,
    negative_slope: f64,
}

impl CavityModel {
    pub fn new(vb: VarBuilder, config: &CavityModelConfig) -> Result<Self> {
        let in_dim = config.voxel.feature_len();
        let lin1 = linear(in_dim, config.hidden_dim, vb.pp("lin1"))?;
        let lin2 = linear(config.hidden_dim, config.dense_dim, vb.pp("lin2"))?;
        let lin_out = linear(config.dense_dim, NUM_AMINO_ACIDS, vb.pp("lin_out"))?;
        Ok(Self {
            lin1,
            lin2,
            lin_out,
            dropout: Dropout::new(config.dropout_ratio),
            negative_slope: config.negative_slope,
        })
    }

    /// Fresh model whose parameters live in the returned `VarMap`.
    pub fn init(config: &CavityModelConfig, device: &Device) -> Result<(Self, VarMap)> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = Self::new(vb, config)?;
        Ok((model, varmap))
    }

    /// Rebuild the network and restore a snapshot written by the train loop.
    pub fn load_checkpoint(
        path: &Path,
        config: &CavityModelConfig,
        device: &Device,
    ) -> Result<(Self, VarMap)> {
        let (model, mut varmap) = Self::init(config, device)?;
        varmap.load(path)?;
        Ok((model, varmap))
    }
}

impl ModuleT for CavityModel {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let xs = leaky_relu(&self.lin1.forward(xs)?, self.negative_slope)?;
        let xs = self.dropout.forward_t(&xs, train)?;
        let xs = leaky_relu(&self.lin2.forward(&xs)?, self.negative_slope)?;
        self.lin_out.forward(&xs)
    }
}
