//! Featurization of residue environments into model-ready tensors.
//!
//! Each environment is rendered into a gaussian-blurred voxel grid with one
//! channel per atom type. Batches are collated into `[B, C * n^3]` features and
//! `[B, 20]` one-hot labels on the configured device.
use crate::environment::ResidueEnvironment;
use crate::residues::NUM_AMINO_ACIDS;
use anyhow::{bail, Result};
use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoxelConfig {
    /// Number of atom-type channels.
    pub n_atom_types: usize,
    /// Cells per axis.
    pub n_bins: usize,
    /// Edge length of the cubic box in Angstrom, centered on the residue.
    pub box_size: f32,
    /// Gaussian blur width in Angstrom.
    pub sigma: f32,
}

impl Default for VoxelConfig {
    fn default() -> Self {
        Self {
            n_atom_types: 6,
            n_bins: 18,
            box_size: 18.0,
            sigma: 0.6,
        }
    }
}

impl VoxelConfig {
    pub fn feature_len(&self) -> usize {
        self.n_atom_types * self.n_bins.pow(3)
    }
}

#[derive(Debug, Clone)]
pub struct ToTensor {
    device: Device,
    voxel: VoxelConfig,
}

impl ToTensor {
    pub fn new(device: Device, voxel: VoxelConfig) -> Self {
        Self { device, voxel }
    }
    pub fn device(&self) -> &Device {
        &self.device
    }
    pub fn voxel_config(&self) -> &VoxelConfig {
        &self.voxel
    }

    /// Render one environment into a flat `[C * n^3]` host buffer.
    pub fn voxelize(&self, env: &ResidueEnvironment) -> Result<Vec<f32>> {
        let VoxelConfig {
            n_atom_types,
            n_bins,
            box_size,
            sigma,
        } = self.voxel;
        let n3 = n_bins * n_bins * n_bins;
        let mut grid = vec![0f32; n_atom_types * n3];
        let cell = box_size / n_bins as f32;
        let half = box_size / 2.0;
        let cutoff = 3.0 * sigma;
        let inv_two_sigma_sq = 1.0 / (2.0 * sigma * sigma);
        let reach = (cutoff / cell).ceil() as isize;

        for (xyz, &atom_type) in env.xyz_coords().iter().zip(env.atom_types()) {
            if atom_type >= n_atom_types {
                bail!(
                    "atom type {} exceeds the {} configured channels",
                    atom_type,
                    n_atom_types
                );
            }
            let channel = &mut grid[atom_type * n3..(atom_type + 1) * n3];
            // cell index holding the atom on each axis
            let home: Vec<isize> = xyz
                .iter()
                .map(|c| ((c + half) / cell).floor() as isize)
                .collect();
            for i in (home[0] - reach)..=(home[0] + reach) {
                if i < 0 || i >= n_bins as isize {
                    continue;
                }
                for j in (home[1] - reach)..=(home[1] + reach) {
                    if j < 0 || j >= n_bins as isize {
                        continue;
                    }
                    for k in (home[2] - reach)..=(home[2] + reach) {
                        if k < 0 || k >= n_bins as isize {
                            continue;
                        }
                        let center = [
                            (i as f32 + 0.5) * cell - half,
                            (j as f32 + 0.5) * cell - half,
                            (k as f32 + 0.5) * cell - half,
                        ];
                        let d_sq: f32 = center
                            .iter()
                            .zip(xyz.iter())
                            .map(|(a, b)| (a - b) * (a - b))
                            .sum();
                        if d_sq > cutoff * cutoff {
                            continue;
                        }
                        let flat = (i as usize * n_bins + j as usize) * n_bins + k as usize;
                        channel[flat] += (-d_sq * inv_two_sigma_sq).exp();
                    }
                }
            }
        }
        Ok(grid)
    }

    /// Stack a batch of environments into `(features, one_hot_labels)`.
    pub fn collate_cat(&self, batch: &[&ResidueEnvironment]) -> Result<(Tensor, Tensor)> {
        let batch_size = batch.len();
        let feature_len = self.voxel.feature_len();
        let mut features = Vec::with_capacity(batch_size * feature_len);
        let mut labels = vec![0f32; batch_size * NUM_AMINO_ACIDS];
        for (row, env) in batch.iter().enumerate() {
            features.extend(self.voxelize(env)?);
            labels[row * NUM_AMINO_ACIDS + env.restype_index()] = 1.0;
        }
        let x = Tensor::from_vec(features, (batch_size, feature_len), &self.device)?;
        let y = Tensor::from_vec(labels, (batch_size, NUM_AMINO_ACIDS), &self.device)?;
        Ok((x, y))
    }
}
