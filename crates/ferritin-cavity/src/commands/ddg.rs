use crate::cli::DdgArgs;
use anyhow::{anyhow, Context, Result};
use candle_core::Device;
use ferritin_cavity::ddg::{
    float_column, load_ddg_table, pearson_correlation, populate_with_environments,
    populate_with_nlls_and_nlfs, write_ddg_table,
};
use ferritin_cavity::environment::{parsed_structure_files, DEFAULT_ENVIRONMENT_RADIUS};
use ferritin_cavity::{
    BackgroundFrequencies, CavityModel, CavityModelConfig, EnvironmentLookup,
    ResidueEnvironmentsDataset, ToTensor,
};
use std::collections::{BTreeMap, HashMap};
use tracing::{info, warn};

pub fn execute(args: DdgArgs, device: Device) -> Result<()> {
    let config_path = match &args.model_config {
        Some(path) => path.clone(),
        None => args
            .model
            .parent()
            .ok_or_else(|| anyhow!("cannot locate config.json for {}", args.model.display()))?
            .join("config.json"),
    };
    let model_config = CavityModelConfig::from_json_file(&config_path)?;
    let (model, _varmap) = CavityModel::load_checkpoint(&args.model, &model_config, &device)
        .with_context(|| format!("failed to load checkpoint {}", args.model.display()))?;
    let transformer = ToTensor::new(device, model_config.voxel.clone());
    let radius = args
        .environment_radius
        .unwrap_or(DEFAULT_ENVIRONMENT_RADIUS);

    let mut lookups = HashMap::new();
    for (name, dir) in &args.environments {
        let files = parsed_structure_files(dir)?;
        let dataset = ResidueEnvironmentsDataset::from_files(&files, radius)?;
        let lookup = EnvironmentLookup::from(dataset);
        info!("{}: {} residue environments from {} structures", name, lookup.len(), files.len());
        lookups.insert(name.clone(), lookup);
    }

    let mut ddg_data = BTreeMap::new();
    for (name, path) in &args.tables {
        ddg_data.insert(name.clone(), load_ddg_table(path)?);
    }

    let matched = populate_with_environments(&ddg_data, &lookups)?;
    let background = BackgroundFrequencies::from_npz(&args.frequencies)?;
    let scored = populate_with_nlls_and_nlfs(
        &matched,
        &model,
        &transformer,
        &background,
        args.batch_size,
        args.eps,
        Some(args.display_n_rows),
    )?;

    std::fs::create_dir_all(&args.out_dir)
        .with_context(|| format!("failed to create {}", args.out_dir.display()))?;
    for (name, table) in scored {
        let mut frame = table.frame;
        if frame.column(&args.score_column).is_ok() {
            let (preds, scores): (Vec<f32>, Vec<f32>) = table
                .ddg_pred_no_ds
                .iter()
                .zip(float_column(&frame, &args.score_column)?)
                .filter_map(|(pred, score)| score.map(|s| (*pred, s)))
                .unzip();
            match pearson_correlation(&preds, &scores) {
                Some(r) => info!("{}: pearson r = {:.3} over {} rows", name, r, preds.len()),
                None => warn!("{}: not enough scored rows for a correlation", name),
            }
        }
        let out_path = args.out_dir.join(format!("{}_ddg.csv", name));
        write_ddg_table(&out_path, &mut frame)?;
        info!("wrote {}", out_path.display());
    }
    Ok(())
}
