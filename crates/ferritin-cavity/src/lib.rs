//! ferritin-cavity
//!
//! - train a cavity model that predicts a residue's amino acid from its
//!   structural environment.
//! - score mutation tables with the trained model to get a baseline ddG.
//!
//! ```shell
//! cargo run --bin ferritin-cavity -- train --structures data/parsed --epochs 20
//! cargo run --bin ferritin-cavity -- ddg --model cavity_models/model_epoch_07.pt \
//!     --table mega=data/mega.csv --environments mega=data/parsed_mega
//! ```
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{Device, Result};
use tracing::info;

pub mod ddg;
pub mod environment;
pub mod loader;
pub mod model;
pub mod residues;
pub mod training;
pub mod transform;

pub use ddg::{BackgroundFrequencies, MatchedTable, ScoredTable, Variant};
pub use environment::{EnvironmentLookup, ResidueEnvironment, ResidueEnvironmentsDataset};
pub use loader::{BatchStream, DataLoader, DataLoaderConfig};
pub use model::{CavityModel, CavityModelConfig};
pub use training::{TrainOutcome, TrainingConfig};
pub use transform::{ToTensor, VoxelConfig};

/// Compute device for training and scoring. `cpu` forces the host; otherwise
/// the first CUDA or Metal device the build supports is used.
pub fn device(cpu: bool) -> Result<Device> {
    if cpu {
        return Ok(Device::Cpu);
    }
    if cuda_is_available() {
        let device = Device::new_cuda(0)?;
        info!("cavity model placed on cuda:0");
        return Ok(device);
    }
    if metal_is_available() {
        let device = Device::new_metal(0)?;
        info!("cavity model placed on metal:0");
        return Ok(device);
    }
    let gpu_feature = if cfg!(all(target_os = "macos", target_arch = "aarch64")) {
        "metal"
    } else {
        "cuda"
    };
    info!(
        "no accelerator in this build, using the cpu (enable the `{}` feature for gpu support)",
        gpu_feature
    );
    Ok(Device::Cpu)
}
