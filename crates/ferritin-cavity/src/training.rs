//! Training and evaluation of the cavity model.
//!
//! - [`train_val_split`] splits parsed structures at the file level so that no
//!   structure contributes residues to both sides.
//! - [`train_step`] takes one optimizer step on one batch.
//! - [`eval_loop`] scores a held-out stream without touching parameters.
//! - [`train_loop`] runs epochs with per-epoch checkpoints and early stopping.
//!
use crate::environment::ResidueEnvironmentsDataset;
use crate::loader::{BatchStream, DataLoader, DataLoaderConfig};
use crate::transform::ToTensor;
use anyhow::{anyhow, Context, Result};
use candle_core::{ModuleT, Tensor, D};
use candle_nn::loss::cross_entropy;
use candle_nn::{Optimizer, VarMap};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Sentinel starting value for the best validation loss.
pub const INITIAL_BEST_LOSS: f32 = 1e4;

#[derive(Debug, Clone)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    /// Training stops once the number of consecutive non-improving epochs exceeds this.
    pub patience_cutoff: usize,
    /// Fraction of structure files that go to the training side.
    pub train_val_split: f32,
    /// Drop the trailing incomplete validation batch. Residues in that batch are not scored.
    pub eval_drop_last: bool,
    pub seed: u64,
    pub checkpoint_dir: PathBuf,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 20,
            batch_size: 100,
            learning_rate: 3e-4,
            patience_cutoff: 6,
            train_val_split: 0.8,
            eval_drop_last: true,
            seed: 0,
            checkpoint_dir: PathBuf::from("cavity_models"),
        }
    }
}

/// Checkpoint location for an epoch: `<dir>/model_epoch_<NN>.pt`.
pub fn checkpoint_path(dir: &Path, epoch: usize) -> PathBuf {
    dir.join(format!("model_epoch_{:02}.pt", epoch))
}

/// Split file names in order at `floor(len * fraction)`.
pub fn split_filenames<T: Clone>(filenames: &[T], fraction: f32) -> (Vec<T>, Vec<T>) {
    let n_train =
        ((filenames.len() as f64 * fraction as f64).floor() as usize).min(filenames.len());
    let (train, val) = filenames.split_at(n_train);
    (train.to_vec(), val.to_vec())
}

/// Build train/validation loaders from an ordered list of parsed structure files.
pub fn train_val_split(
    parsed_filenames: &[PathBuf],
    transformer: &ToTensor,
    config: &TrainingConfig,
    environment_radius: f32,
) -> Result<(DataLoader, DataLoader)> {
    let (filenames_train, filenames_val) =
        split_filenames(parsed_filenames, config.train_val_split);

    let dataset_train =
        ResidueEnvironmentsDataset::from_files(&filenames_train, environment_radius)?;
    let dataset_val = ResidueEnvironmentsDataset::from_files(&filenames_val, environment_radius)?;

    info!(
        "Training data set includes {} pdbs with {} environments.",
        filenames_train.len(),
        dataset_train.len()
    );
    info!(
        "Validation data set includes {} pdbs with {} environments.",
        filenames_val.len(),
        dataset_val.len()
    );

    let dataloader_train = DataLoader::new(
        dataset_train,
        transformer.clone(),
        DataLoaderConfig::new(config.batch_size)
            .shuffle(true)
            .drop_last(true)
            .seed(config.seed),
    );
    let dataloader_val = DataLoader::new(
        dataset_val,
        transformer.clone(),
        DataLoaderConfig::new(config.batch_size).drop_last(config.eval_drop_last),
    );
    Ok((dataloader_train, dataloader_val))
}

/// One gradient update. Returns the raw predictions and the batch loss.
///
/// `backward_step` computes fresh gradients from `loss` on every call, so
/// there is no accumulated gradient to clear beforehand.
pub fn train_step<M: ModuleT, O: Optimizer>(
    batch_x: &Tensor,
    batch_y: &Tensor,
    model: &M,
    optimizer: &mut O,
) -> Result<(Tensor, f32)> {
    let batch_y_pred = model.forward_t(batch_x, true)?;
    let loss = cross_entropy(&batch_y_pred, &batch_y.argmax(D::Minus1)?)?;
    optimizer.backward_step(&loss)?;
    Ok((batch_y_pred, loss.to_scalar::<f32>()?))
}

/// Running totals for one pass over a batch stream.
#[derive(Debug, Default)]
struct PassMetrics {
    losses: Vec<f32>,
    labels_true: Vec<u32>,
    labels_pred: Vec<u32>,
}

impl PassMetrics {
    fn record(&mut self, batch_y: &Tensor, batch_y_pred: &Tensor, loss: f32) -> Result<()> {
        self.losses.push(loss);
        self.labels_true
            .extend(batch_y.argmax(D::Minus1)?.flatten_all()?.to_vec1::<u32>()?);
        self.labels_pred
            .extend(batch_y_pred.argmax(D::Minus1)?.flatten_all()?.to_vec1::<u32>()?);
        Ok(())
    }
    /// Micro-averaged accuracy over every recorded label. NaN when empty.
    fn accuracy(&self) -> f32 {
        let correct = self
            .labels_true
            .iter()
            .zip(&self.labels_pred)
            .filter(|(t, p)| t == p)
            .count();
        correct as f32 / self.labels_true.len() as f32
    }
    /// Mean of per-batch losses. NaN when empty.
    fn loss(&self) -> f32 {
        self.losses.iter().sum::<f32>() / self.losses.len() as f32
    }
}

/// Accuracy and mean loss over a full validation pass, in evaluation mode.
pub fn eval_loop<M: ModuleT, S: BatchStream + ?Sized>(
    model: &M,
    dataloader_val: &mut S,
) -> Result<(f32, f32)> {
    let mut metrics = PassMetrics::default();
    for batch in dataloader_val.batches() {
        let (batch_x_val, batch_y_val) = batch?;
        let batch_y_pred_val = model.forward_t(&batch_x_val, false)?;
        let loss_val = cross_entropy(&batch_y_pred_val, &batch_y_val.argmax(D::Minus1)?)?;
        metrics.record(&batch_y_val, &batch_y_pred_val, loss_val.to_scalar::<f32>()?)?;
    }
    Ok((metrics.accuracy(), metrics.loss()))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub loss_train: f32,
    pub acc_train: f32,
    pub loss_val: f32,
    pub acc_val: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Completed,
    EarlyStopped,
}

/// Best-epoch bookkeeping threaded through the train loop.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    best_loss: f32,
    best_epoch: Option<usize>,
    patience: usize,
    cutoff: usize,
}

impl EarlyStopping {
    pub fn new(cutoff: usize) -> Self {
        Self {
            best_loss: INITIAL_BEST_LOSS,
            best_epoch: None,
            patience: 0,
            cutoff,
        }
    }
    pub fn best_loss(&self) -> f32 {
        self.best_loss
    }
    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }
    pub fn patience(&self) -> usize {
        self.patience
    }
    /// Record an epoch's validation loss. Returns `true` when training should stop.
    pub fn update(&mut self, epoch: usize, loss_val: f32) -> bool {
        if loss_val < self.best_loss {
            self.best_loss = loss_val;
            self.best_epoch = Some(epoch);
            self.patience = 0;
        } else {
            self.patience += 1;
        }
        self.patience > self.cutoff
    }
}

#[derive(Debug, Clone)]
pub struct TrainOutcome {
    pub best_model_path: PathBuf,
    pub best_epoch: usize,
    pub best_loss_val: f32,
    pub stop_reason: StopReason,
    pub history: Vec<EpochMetrics>,
    /// Every checkpoint written, keyed by epoch.
    pub checkpoints: BTreeMap<usize, PathBuf>,
}

pub fn train_loop<M, O, T, V>(
    dataloader_train: &mut T,
    dataloader_val: &mut V,
    model: &M,
    varmap: &VarMap,
    optimizer: &mut O,
    config: &TrainingConfig,
) -> Result<TrainOutcome>
where
    M: ModuleT,
    O: Optimizer,
    T: BatchStream + ?Sized,
    V: BatchStream + ?Sized,
{
    std::fs::create_dir_all(&config.checkpoint_dir).with_context(|| {
        format!(
            "failed to create checkpoint directory {}",
            config.checkpoint_dir.display()
        )
    })?;

    let mut state = EarlyStopping::new(config.patience_cutoff);
    let mut epoch_idx_to_model_path = BTreeMap::new();
    let mut history = Vec::with_capacity(config.epochs);
    let mut stop_reason = StopReason::Completed;

    for epoch in 0..config.epochs {
        let mut metrics = PassMetrics::default();
        for batch in dataloader_train.batches() {
            let (batch_x, batch_y) = batch?;
            let (batch_y_pred, loss_batch) = train_step(&batch_x, &batch_y, model, optimizer)?;
            metrics.record(&batch_y, &batch_y_pred, loss_batch)?;
        }
        let (acc_train, loss_train) = (metrics.accuracy(), metrics.loss());
        let (acc_val, loss_val) = eval_loop(model, &mut *dataloader_val)?;

        info!(
            "Epoch {:2}. Train loss: {:5.3}. Train Acc: {:4.2}. Val loss: {:5.3}. Val Acc {:4.2}",
            epoch, loss_train, acc_train, loss_val, acc_val
        );
        history.push(EpochMetrics {
            epoch,
            loss_train,
            acc_train,
            loss_val,
            acc_val,
        });

        let model_path = checkpoint_path(&config.checkpoint_dir, epoch);
        varmap
            .save(&model_path)
            .with_context(|| format!("failed to save checkpoint {}", model_path.display()))?;
        debug!("saved {}", model_path.display());
        epoch_idx_to_model_path.insert(epoch, model_path);

        if state.update(epoch, loss_val) {
            info!("Early stopping activated.");
            stop_reason = StopReason::EarlyStopped;
            break;
        }
    }

    let best_epoch = state
        .best_epoch()
        .ok_or_else(|| anyhow!("invalid index: no epoch improved on the initial best loss"))?;
    let best_model_path = epoch_idx_to_model_path
        .get(&best_epoch)
        .cloned()
        .ok_or_else(|| anyhow!("invalid index: no checkpoint for epoch {}", best_epoch))?;
    info!(
        "Best epoch idx: {} with validation loss: {:5.3} and model_path: {}",
        best_epoch,
        state.best_loss(),
        best_model_path.display()
    );

    Ok(TrainOutcome {
        best_model_path,
        best_epoch,
        best_loss_val: state.best_loss(),
        stop_reason,
        history,
        checkpoints: epoch_idx_to_model_path,
    })
}
