use crate::cli::TrainArgs;
use anyhow::{bail, Context, Result};
use candle_core::Device;
use candle_nn::optim::{AdamW, Optimizer, ParamsAdamW};
use ferritin_cavity::environment::{parsed_structure_files, DEFAULT_ENVIRONMENT_RADIUS};
use ferritin_cavity::training::{train_loop, train_val_split};
use ferritin_cavity::{CavityModel, CavityModelConfig, ToTensor, TrainingConfig};
use tracing::info;

fn training_config(args: &TrainArgs) -> TrainingConfig {
    let defaults = TrainingConfig::default();
    TrainingConfig {
        epochs: args.epochs.unwrap_or(defaults.epochs),
        batch_size: args.batch_size.unwrap_or(defaults.batch_size),
        learning_rate: args.learning_rate.unwrap_or(defaults.learning_rate),
        patience_cutoff: args.patience_cutoff.unwrap_or(defaults.patience_cutoff),
        train_val_split: args.train_val_split.unwrap_or(defaults.train_val_split),
        eval_drop_last: !args.eval_keep_last,
        seed: args.seed.unwrap_or(defaults.seed),
        checkpoint_dir: args
            .checkpoint_dir
            .clone()
            .unwrap_or(defaults.checkpoint_dir),
    }
}

pub fn execute(args: TrainArgs, device: Device) -> Result<()> {
    let config = training_config(&args);
    if config.batch_size == 0 {
        bail!("batch size must be positive");
    }
    let model_config = match &args.model_config {
        Some(path) => CavityModelConfig::from_json_file(path)?,
        None => CavityModelConfig::default(),
    };
    let radius = args
        .environment_radius
        .unwrap_or(DEFAULT_ENVIRONMENT_RADIUS);

    let parsed_filenames = parsed_structure_files(&args.structures)?;
    info!(
        "Found {} parsed structures in {}",
        parsed_filenames.len(),
        args.structures.display()
    );

    let transformer = ToTensor::new(device.clone(), model_config.voxel.clone());
    let (mut dataloader_train, mut dataloader_val) =
        train_val_split(&parsed_filenames, &transformer, &config, radius)?;

    let (model, varmap) = CavityModel::init(&model_config, &device)?;
    let mut optimizer = AdamW::new(
        varmap.all_vars(),
        ParamsAdamW {
            lr: config.learning_rate,
            weight_decay: 0.0,
            ..Default::default()
        },
    )?;

    std::fs::create_dir_all(&config.checkpoint_dir).with_context(|| {
        format!("failed to create {}", config.checkpoint_dir.display())
    })?;
    model_config.to_json_file(&config.checkpoint_dir.join("config.json"))?;

    let outcome = train_loop(
        &mut dataloader_train,
        &mut dataloader_val,
        &model,
        &varmap,
        &mut optimizer,
        &config,
    )?;
    info!(
        "Finished after {} epochs ({:?})",
        outcome.history.len(),
        outcome.stop_reason
    );
    println!("{}", outcome.best_model_path.display());
    Ok(())
}
