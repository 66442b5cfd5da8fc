use anyhow::Result;
use candle_core::Device;
use candle_nn::optim::{AdamW, Optimizer, ParamsAdamW};
use ferritin_cavity::environment::{load_environments, parsed_structure_files};
use ferritin_cavity::training::{
    checkpoint_path, eval_loop, train_loop, train_step, train_val_split, StopReason,
};
use ferritin_cavity::{
    BatchStream, CavityModel, CavityModelConfig, ToTensor, TrainingConfig, VoxelConfig,
};
use ferritin_test_data::{write_structures, SyntheticStructure, TestDir};

fn tiny_model_config() -> CavityModelConfig {
    CavityModelConfig {
        voxel: VoxelConfig {
            n_atom_types: 4,
            n_bins: 6,
            box_size: 12.0,
            sigma: 0.6,
        },
        hidden_dim: 16,
        dense_dim: 8,
        dropout_ratio: 0.0,
        negative_slope: 0.01,
    }
}

#[test]
fn test_environments_exclude_own_atoms() -> Result<()> {
    let dir = TestDir::new()?;
    let structure = SyntheticStructure::helix("1abc", 'A', 6);
    let path = structure.write_npz(dir.path())?;

    let envs = load_environments(&path, 9.0)?;
    assert_eq!(envs.len(), 6);
    for (idx, env) in envs.iter().enumerate() {
        assert_eq!(env.key(), structure.key(idx));
        assert_eq!(env.wt_letter(), structure.letter(idx));
        assert!(env.xyz_coords().len() <= 5 * 4);
        assert!(env
            .xyz_coords()
            .iter()
            .all(|c| c.iter().map(|v| v * v).sum::<f32>() <= 81.0));
    }

    // a tiny radius leaves nothing around any residue
    let empty = load_environments(&path, 0.1)?;
    assert!(empty.iter().all(|env| env.xyz_coords().is_empty()));
    Ok(())
}

#[test]
fn test_split_is_per_structure() -> Result<()> {
    let dir = TestDir::new()?;
    write_structures(dir.path(), "s", 5, 12)?;
    let files = parsed_structure_files(dir.path())?;
    assert_eq!(files.len(), 5);

    let transformer = ToTensor::new(Device::Cpu, tiny_model_config().voxel);
    let config = TrainingConfig {
        batch_size: 5,
        ..Default::default()
    };
    let (train, val) = train_val_split(&files, &transformer, &config, 9.0)?;
    assert_eq!(train.dataset().len(), 48);
    assert_eq!(val.dataset().len(), 12);
    assert!(train.dataset().iter().all(|env| env.pdb_id() != "s4"));
    assert!(val.dataset().iter().all(|env| env.pdb_id() == "s4"));

    // both loaders drop the trailing partial batch by default
    assert_eq!(train.num_batches(), 9);
    assert_eq!(val.num_batches(), 2);

    let config = TrainingConfig {
        eval_drop_last: false,
        ..config
    };
    let (_, val) = train_val_split(&files, &transformer, &config, 9.0)?;
    assert_eq!(val.num_batches(), 3);
    Ok(())
}

#[test]
fn test_train_step_updates_parameters() -> Result<()> {
    let dir = TestDir::new()?;
    let files = write_structures(dir.path(), "t", 2, 10)?;
    let model_config = tiny_model_config();
    let transformer = ToTensor::new(Device::Cpu, model_config.voxel.clone());
    let config = TrainingConfig {
        batch_size: 8,
        train_val_split: 0.5,
        ..Default::default()
    };
    let (mut train, _) = train_val_split(&files, &transformer, &config, 9.0)?;

    let (model, varmap) = CavityModel::init(&model_config, &Device::Cpu)?;
    let mut optimizer = AdamW::new(
        varmap.all_vars(),
        ParamsAdamW {
            lr: 1e-2,
            weight_decay: 0.0,
            ..Default::default()
        },
    )?;
    let before = varmap.all_vars()[0].as_tensor().flatten_all()?.to_vec1::<f32>()?;
    let (batch_x, batch_y) = train.batches().next().expect("one batch")?;
    let (pred, loss) = train_step(&batch_x, &batch_y, &model, &mut optimizer)?;
    let after = varmap.all_vars()[0].as_tensor().flatten_all()?.to_vec1::<f32>()?;

    assert_eq!(pred.dims2()?, (8, 20));
    assert!(loss.is_finite() && loss > 0.0);
    assert_ne!(before, after);
    Ok(())
}

#[test]
fn test_train_loop_checkpoints_and_best_epoch() -> Result<()> {
    let dir = TestDir::new()?;
    let structures = dir.subdir("parsed")?;
    let files = write_structures(&structures, "p", 5, 12)?;
    let model_config = tiny_model_config();
    let transformer = ToTensor::new(Device::Cpu, model_config.voxel.clone());
    let config = TrainingConfig {
        epochs: 3,
        batch_size: 6,
        learning_rate: 1e-3,
        patience_cutoff: 10,
        checkpoint_dir: dir.path().join("cavity_models"),
        ..Default::default()
    };
    let (mut train, mut val) = train_val_split(&files, &transformer, &config, 9.0)?;
    let (model, varmap) = CavityModel::init(&model_config, &Device::Cpu)?;
    let mut optimizer = AdamW::new(varmap.all_vars(), ParamsAdamW::default())?;

    let outcome = train_loop(&mut train, &mut val, &model, &varmap, &mut optimizer, &config)?;

    assert_eq!(outcome.stop_reason, StopReason::Completed);
    assert_eq!(outcome.history.len(), 3);
    assert_eq!(outcome.checkpoints.len(), 3);
    for epoch in 0..3 {
        let path = checkpoint_path(&config.checkpoint_dir, epoch);
        assert!(path.exists(), "missing {}", path.display());
        assert_eq!(outcome.checkpoints[&epoch], path);
    }
    assert_eq!(outcome.best_model_path, outcome.checkpoints[&outcome.best_epoch]);
    let min_val = outcome
        .history
        .iter()
        .map(|m| m.loss_val)
        .fold(f32::INFINITY, f32::min);
    assert_eq!(outcome.best_loss_val, min_val);
    assert_eq!(outcome.history[outcome.best_epoch].loss_val, min_val);

    // the best snapshot reloads into an identical network
    let (restored, _) =
        CavityModel::load_checkpoint(&outcome.best_model_path, &model_config, &Device::Cpu)?;
    let (acc, loss) = eval_loop(&restored, &mut val)?;
    assert!((0.0..=1.0).contains(&acc));
    assert!((loss - outcome.best_loss_val).abs() < 1e-4);
    Ok(())
}

#[test]
fn test_train_loop_stops_after_first_non_improving_epoch() -> Result<()> {
    let dir = TestDir::new()?;
    let files = write_structures(dir.path(), "e", 3, 8)?;
    let model_config = tiny_model_config();
    let transformer = ToTensor::new(Device::Cpu, model_config.voxel.clone());
    let config = TrainingConfig {
        epochs: 10,
        batch_size: 4,
        patience_cutoff: 0,
        train_val_split: 0.67,
        checkpoint_dir: dir.path().join("cm"),
        ..Default::default()
    };
    let (mut train, mut val) = train_val_split(&files, &transformer, &config, 9.0)?;
    let (model, varmap) = CavityModel::init(&model_config, &Device::Cpu)?;
    // a zero learning rate freezes the weights, so epoch 1 repeats epoch 0's loss
    let mut optimizer = AdamW::new(
        varmap.all_vars(),
        ParamsAdamW {
            lr: 0.0,
            weight_decay: 0.0,
            ..Default::default()
        },
    )?;

    let outcome = train_loop(&mut train, &mut val, &model, &varmap, &mut optimizer, &config)?;

    assert_eq!(outcome.stop_reason, StopReason::EarlyStopped);
    assert_eq!(outcome.history.len(), 2);
    assert_eq!(outcome.checkpoints.len(), 2);
    assert_eq!(outcome.best_epoch, 0);
    assert!(outcome.best_model_path.ends_with("model_epoch_00.pt"));
    assert_eq!(outcome.best_loss_val, outcome.history[0].loss_val);
    assert!(!checkpoint_path(&config.checkpoint_dir, 2).exists());
    Ok(())
}

#[test]
fn test_train_loop_zero_epochs_is_an_error() -> Result<()> {
    let dir = TestDir::new()?;
    let files = write_structures(dir.path(), "z", 2, 6)?;
    let model_config = tiny_model_config();
    let transformer = ToTensor::new(Device::Cpu, model_config.voxel.clone());
    let config = TrainingConfig {
        epochs: 0,
        batch_size: 2,
        train_val_split: 0.5,
        checkpoint_dir: dir.path().join("cavity_models"),
        ..Default::default()
    };
    let (mut train, mut val) = train_val_split(&files, &transformer, &config, 9.0)?;
    let (model, varmap) = CavityModel::init(&model_config, &Device::Cpu)?;
    let mut optimizer = AdamW::new(varmap.all_vars(), ParamsAdamW::default())?;
    let err = train_loop(&mut train, &mut val, &model, &varmap, &mut optimizer, &config)
        .unwrap_err();
    assert!(err.to_string().contains("invalid index"));
    Ok(())
}
