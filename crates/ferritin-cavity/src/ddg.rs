//! ddG Enrichment
//!
//! Joins mutation-effect tables with matched residue environments, scores them
//! with a trained cavity model and derives a baseline ddG estimate:
//!
//! ```text
//! ddg_pred_no_ds = (mt_nll - mt_nlf) - (wt_nll - wt_nlf)
//! ```
//!
//! where `nll` is the model's negative log likelihood for an amino acid and
//! `nlf` the negative log of its background frequency in the PDB.
//!
//! Stage A ([`populate_with_environments`]) matches rows to environments and
//! drops the ones without a match. Stage B ([`populate_with_nlls_and_nlfs`])
//! runs inference and appends the derived columns. The full per-class NLL
//! vector of each row is kept as one flat column per amino acid, `nll_A`
//! through `nll_Y`, since CSV has no list type.
use crate::environment::{
    environment_key, EnvironmentLookup, ResidueEnvironment, ResidueEnvironmentsDataset,
};
use crate::loader::{BatchStream, DataLoader, DataLoaderConfig};
use crate::residues::{aa1_to_index, index_to_aa1, NUM_AMINO_ACIDS};
use crate::transform::ToTensor;
use anyhow::{anyhow, bail, Context, Result};
use candle_core::npy::NpzTensors;
use candle_core::{DType, ModuleT, Tensor};
use candle_nn::ops::softmax_last_dim;
use itertools::izip;
use polars::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::Path;
use tracing::{debug, info};

/// Environment set shared by every dataset whose name mentions it.
pub const SYMMETRIC_SET: &str = "symmetric";

/// Columns a mutation table must provide.
pub const REQUIRED_COLUMNS: [&str; 3] = ["pdbid", "chainid", "variant"];

/// Default epsilon added to probabilities before taking the logarithm.
pub const DEFAULT_EPS: f64 = 1e-9;

/// Name of the environment lookup a dataset draws from.
///
/// Any dataset whose name *contains* "symmetric" uses the shared "symmetric"
/// environments, whatever the rest of its name is.
pub fn environment_set_name(dataset_name: &str) -> &str {
    if dataset_name.contains(SYMMETRIC_SET) {
        SYMMETRIC_SET
    } else {
        dataset_name
    }
}

/// A point mutation written as `<wt><position><mt>`, e.g. `A123G`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variant {
    pub wt: char,
    pub position: String,
    pub mt: char,
}

impl Variant {
    pub fn parse(variant: &str) -> Result<Self> {
        let chars: Vec<char> = variant.chars().collect();
        if chars.len() < 3 {
            bail!("malformed variant `{}`: expected <wt><position><mt>", variant);
        }
        Ok(Self {
            wt: chars[0],
            position: chars[1..chars.len() - 1].iter().collect(),
            mt: chars[chars.len() - 1],
        })
    }
    /// Environment key for this variant's wild-type residue.
    pub fn environment_key(&self, pdb_id: &str, chain_id: &str) -> String {
        environment_key(pdb_id, chain_id, &self.position, self.wt)
    }
    pub fn wt_index(&self) -> Result<usize> {
        aa1_to_index(self.wt)
    }
    pub fn mt_index(&self) -> Result<usize> {
        aa1_to_index(self.mt)
    }
}

/// Likelihood-ratio ddG estimate against the background distribution.
pub fn baseline_ddg(wt_nll: f32, mt_nll: f32, wt_nlf: f32, mt_nlf: f32) -> f32 {
    (mt_nll - mt_nlf) - (wt_nll - wt_nlf)
}

/// Negative log background frequencies of the 20 amino acids.
#[derive(Debug, Clone, PartialEq)]
pub struct BackgroundFrequencies {
    nlfs: [f32; NUM_AMINO_ACIDS],
}

impl BackgroundFrequencies {
    pub fn from_frequencies(frequencies: &[f32]) -> Result<Self> {
        if frequencies.len() != NUM_AMINO_ACIDS {
            bail!(
                "expected {} background frequencies, found {}",
                NUM_AMINO_ACIDS,
                frequencies.len()
            );
        }
        let mut nlfs = [0f32; NUM_AMINO_ACIDS];
        for (nlf, freq) in nlfs.iter_mut().zip(frequencies) {
            *nlf = -freq.ln();
        }
        Ok(Self { nlfs })
    }
    /// Read the `frequencies` array from an npz archive.
    pub fn from_npz(path: &Path) -> Result<Self> {
        let npz = NpzTensors::new(path)
            .with_context(|| format!("failed to open frequency archive {}", path.display()))?;
        let frequencies = npz
            .get("frequencies")?
            .ok_or_else(|| anyhow!("`frequencies` missing from {}", path.display()))?
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        Self::from_frequencies(&frequencies)
    }
    pub fn nlf(&self, aa_idx: usize) -> f32 {
        self.nlfs[aa_idx]
    }
    pub fn nlfs(&self) -> &[f32] {
        &self.nlfs
    }
}

/// Read a mutation table and check that the columns used for matching exist.
pub fn load_ddg_table(path: &Path) -> Result<DataFrame> {
    let df = CsvReadOptions::default()
        .with_has_header(true)
        .try_into_reader_with_file_path(Some(path.to_path_buf()))?
        .finish()
        .with_context(|| format!("failed to read mutation table {}", path.display()))?;
    for name in REQUIRED_COLUMNS {
        if df.column(name).is_err() {
            bail!("mutation table {} has no `{}` column", path.display(), name);
        }
    }
    Ok(df)
}

pub fn write_ddg_table(path: &Path, frame: &mut DataFrame) -> Result<()> {
    let mut file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    CsvWriter::new(&mut file).include_header(true).finish(frame)?;
    Ok(())
}

/// Column values as strings; nulls become empty strings.
fn string_column(df: &DataFrame, name: &str) -> Result<Vec<String>> {
    let series = df
        .column(name)?
        .as_materialized_series()
        .cast(&DataType::String)?;
    Ok(series
        .str()?
        .into_iter()
        .map(|v| v.unwrap_or_default().to_string())
        .collect())
}

/// Optional float column, e.g. an experimental score.
pub fn float_column(df: &DataFrame, name: &str) -> Result<Vec<Option<f32>>> {
    let series = df
        .column(name)?
        .as_materialized_series()
        .cast(&DataType::Float32)?;
    Ok(series.f32()?.into_iter().collect())
}

/// A mutation table restricted to rows with a matched environment.
#[derive(Debug, Clone)]
pub struct MatchedTable {
    /// Surviving rows, with `wt_idx` and `mt_idx` appended.
    pub frame: DataFrame,
    /// Wild-type environment of each surviving row, in row order.
    pub resenvs: Vec<ResidueEnvironment>,
    pub wt_idx: Vec<usize>,
    pub mt_idx: Vec<usize>,
    pub n_before: usize,
}

impl MatchedTable {
    pub fn n_dropped(&self) -> usize {
        self.n_before - self.frame.height()
    }
}

/// Stage A for one table.
pub fn match_environments(
    dataset_name: &str,
    df: &DataFrame,
    lookups: &HashMap<String, EnvironmentLookup>,
) -> Result<MatchedTable> {
    let lookup = lookups.get(environment_set_name(dataset_name));
    let pdbids = string_column(df, "pdbid")?;
    let chainids = string_column(df, "chainid")?;
    let variants = string_column(df, "variant")?;

    let mut keep = Vec::with_capacity(df.height());
    let mut resenvs = Vec::new();
    let mut wt_idx = Vec::new();
    let mut mt_idx = Vec::new();
    for (pdbid, chainid, variant) in izip!(&pdbids, &chainids, &variants) {
        let variant = Variant::parse(variant)?;
        let key = variant.environment_key(pdbid, chainid);
        match lookup.and_then(|l| l.get(&key)) {
            Some(resenv) => {
                keep.push(true);
                resenvs.push(resenv.clone());
                wt_idx.push(variant.wt_index()?);
                mt_idx.push(variant.mt_index()?);
            }
            None => keep.push(false),
        }
    }

    let mask = BooleanChunked::from_slice("matched".into(), &keep);
    let mut frame = df.filter(&mask)?;
    frame.with_column(Series::new(
        "wt_idx".into(),
        wt_idx.iter().map(|&i| i as u32).collect::<Vec<u32>>(),
    ))?;
    frame.with_column(Series::new(
        "mt_idx".into(),
        mt_idx.iter().map(|&i| i as u32).collect::<Vec<u32>>(),
    ))?;

    Ok(MatchedTable {
        frame,
        resenvs,
        wt_idx,
        mt_idx,
        n_before: df.height(),
    })
}

/// Stage A: attach wild-type environments to every table, dropping unmatched rows.
pub fn populate_with_environments(
    ddg_data: &BTreeMap<String, DataFrame>,
    lookups: &HashMap<String, EnvironmentLookup>,
) -> Result<BTreeMap<String, MatchedTable>> {
    info!(
        "Dropping data points where residue is not defined in structure or due to missing parsed pdb file"
    );
    let mut matched = BTreeMap::new();
    for (name, df) in ddg_data {
        let table = match_environments(name, df, lookups)?;
        info!(
            "dropped {:4} / {:4} data points from dataset {}",
            table.n_dropped(),
            table.n_before,
            name
        );
        matched.insert(name.clone(), table);
    }
    Ok(matched)
}

/// `-ln(softmax(logits) + eps)` along the last axis.
pub fn nll_from_logits(logits: &Tensor, eps: f64) -> candle_core::Result<Tensor> {
    (softmax_last_dim(logits)? + eps)?.log()?.neg()
}

/// Per-class negative log likelihoods for each environment, in input order.
pub fn predict_nlls<M: ModuleT>(
    model: &M,
    resenvs: &[ResidueEnvironment],
    transformer: &ToTensor,
    batch_size: usize,
    eps: f64,
) -> Result<Vec<Vec<f32>>> {
    let mut dataloader = DataLoader::new(
        ResidueEnvironmentsDataset::from_environments(resenvs.to_vec()),
        transformer.clone(),
        DataLoaderConfig::new(batch_size),
    );
    let mut pred_nlls = Vec::with_capacity(resenvs.len());
    for batch in dataloader.batches() {
        let (batch_x, _) = batch?;
        let logits = model.forward_t(&batch_x, false)?;
        pred_nlls.extend(nll_from_logits(&logits, eps)?.to_vec2::<f32>()?);
    }
    Ok(pred_nlls)
}

/// A matched table with model likelihoods and the baseline ddG appended.
#[derive(Debug, Clone)]
pub struct ScoredTable {
    /// Matched rows plus `nll_A..nll_Y`, `wt_nll, mt_nll, wt_nlf, mt_nlf` and
    /// `ddg_pred_no_ds`.
    pub frame: DataFrame,
    /// Full 20-class NLL vector per row.
    pub nlls: Vec<Vec<f32>>,
    pub ddg_pred_no_ds: Vec<f32>,
}

/// Stage B for one matched table.
pub fn score_table<M: ModuleT>(
    table: &MatchedTable,
    model: &M,
    transformer: &ToTensor,
    background: &BackgroundFrequencies,
    batch_size: usize,
    eps: f64,
) -> Result<ScoredTable> {
    let nlls = predict_nlls(model, &table.resenvs, transformer, batch_size, eps)?;
    if nlls.len() != table.frame.height() {
        bail!(
            "{} predictions for {} matched rows",
            nlls.len(),
            table.frame.height()
        );
    }

    let n = nlls.len();
    let (mut wt_nll, mut mt_nll) = (Vec::with_capacity(n), Vec::with_capacity(n));
    let (mut wt_nlf, mut mt_nlf) = (Vec::with_capacity(n), Vec::with_capacity(n));
    let mut ddg = Vec::with_capacity(n);
    for (row_nlls, &wt, &mt) in izip!(&nlls, &table.wt_idx, &table.mt_idx) {
        let (w_nll, m_nll) = (row_nlls[wt], row_nlls[mt]);
        let (w_nlf, m_nlf) = (background.nlf(wt), background.nlf(mt));
        wt_nll.push(w_nll);
        mt_nll.push(m_nll);
        wt_nlf.push(w_nlf);
        mt_nlf.push(m_nlf);
        ddg.push(baseline_ddg(w_nll, m_nll, w_nlf, m_nlf));
    }

    let mut frame = table.frame.clone();
    for class in 0..NUM_AMINO_ACIDS {
        let name = format!("nll_{}", index_to_aa1(class)?);
        let values: Vec<f32> = nlls.iter().map(|row| row[class]).collect();
        frame.with_column(Series::new(name.into(), values))?;
    }
    frame.with_column(Series::new("wt_nll".into(), wt_nll))?;
    frame.with_column(Series::new("mt_nll".into(), mt_nll))?;
    frame.with_column(Series::new("wt_nlf".into(), wt_nlf))?;
    frame.with_column(Series::new("mt_nlf".into(), mt_nlf))?;
    frame.with_column(Series::new("ddg_pred_no_ds".into(), ddg.clone()))?;

    Ok(ScoredTable {
        frame,
        nlls,
        ddg_pred_no_ds: ddg,
    })
}

/// Stage B: score every matched table.
pub fn populate_with_nlls_and_nlfs<M: ModuleT>(
    matched: &BTreeMap<String, MatchedTable>,
    model: &M,
    transformer: &ToTensor,
    background: &BackgroundFrequencies,
    batch_size: usize,
    eps: f64,
    display_n_rows: Option<usize>,
) -> Result<BTreeMap<String, ScoredTable>> {
    let mut scored = BTreeMap::new();
    for (name, table) in matched {
        let table = score_table(table, model, transformer, background, batch_size, eps)?;
        if let Some(n) = display_n_rows {
            debug!("{}\n{}", name, table.frame.head(Some(n)));
        }
        scored.insert(name.clone(), table);
    }
    Ok(scored)
}

/// Pearson correlation over paired values; `None` with fewer than two pairs
/// or zero variance.
pub fn pearson_correlation(xs: &[f32], ys: &[f32]) -> Option<f32> {
    let n = xs.len().min(ys.len());
    if n < 2 {
        return None;
    }
    let mean_x = xs[..n].iter().sum::<f32>() / n as f32;
    let mean_y = ys[..n].iter().sum::<f32>() / n as f32;
    let (mut cov, mut var_x, mut var_y) = (0f32, 0f32, 0f32);
    for (x, y) in xs.iter().zip(ys) {
        cov += (x - mean_x) * (y - mean_y);
        var_x += (x - mean_x).powi(2);
        var_y += (y - mean_y).powi(2);
    }
    if var_x == 0.0 || var_y == 0.0 {
        return None;
    }
    Some(cov / (var_x.sqrt() * var_y.sqrt()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Module};
    use polars::prelude::*;

    #[test]
    fn test_environment_set_name() {
        assert_eq!(environment_set_name("protein_g"), "protein_g");
        assert_eq!(environment_set_name("symmetric_direct"), "symmetric");
        assert_eq!(environment_set_name("symmetric_inverse"), "symmetric");
        assert_eq!(environment_set_name("my_symmetric_set"), "symmetric");
        assert_eq!(environment_set_name("Symmetric"), "Symmetric");
    }

    #[test]
    fn test_variant_parse() {
        let v = Variant::parse("A123G").unwrap();
        assert_eq!(v.wt, 'A');
        assert_eq!(v.position, "123");
        assert_eq!(v.mt, 'G');
        assert_eq!(v.environment_key("1ABC", "A"), "1ABCA_123A");
        assert_eq!(v.wt_index().unwrap(), 0);
        assert_eq!(v.mt_index().unwrap(), 5);
    }

    #[test]
    fn test_variant_parse_malformed() {
        assert!(Variant::parse("").is_err());
        assert!(Variant::parse("A1").is_err());
        assert!(Variant::parse("B12Z").unwrap().wt_index().is_err());
    }

    #[test]
    fn test_baseline_ddg() {
        let ddg = baseline_ddg(2.0, 3.5, 1.0, 1.2);
        assert!((ddg - 1.3).abs() < 1e-6);
    }

    #[test]
    fn test_background_frequencies() {
        let uniform = vec![0.05f32; 20];
        let bg = BackgroundFrequencies::from_frequencies(&uniform).unwrap();
        assert!(bg.nlfs().iter().all(|v| (v - 20f32.ln()).abs() < 1e-5));
        assert!(BackgroundFrequencies::from_frequencies(&uniform[..19]).is_err());
    }

    #[test]
    fn test_nll_from_logits_has_floor() -> Result<()> {
        let logits = Tensor::new(&[[0f32, 0.0], [1000.0, -1000.0]], &Device::Cpu)?;
        let nlls = nll_from_logits(&logits, 1e-9)?.to_vec2::<f32>()?;
        assert!((nlls[0][0] - 2f32.ln()).abs() < 1e-5);
        assert!(nlls[1][0].abs() < 1e-5);
        // p == 0 is floored at eps
        assert!((nlls[1][1] - (-(1e-9f32).ln())).abs() < 1e-2);
        assert!(nlls.iter().flatten().all(|v| v.is_finite()));
        Ok(())
    }

    #[test]
    fn test_pearson() {
        let xs = [1.0, 2.0, 3.0, 4.0];
        assert!((pearson_correlation(&xs, &[2.0, 4.0, 6.0, 8.0]).unwrap() - 1.0).abs() < 1e-6);
        assert!((pearson_correlation(&xs, &[4.0, 3.0, 2.0, 1.0]).unwrap() + 1.0).abs() < 1e-6);
        assert!(pearson_correlation(&xs, &[1.0, 1.0, 1.0, 1.0]).is_none());
        assert!(pearson_correlation(&xs[..1], &xs[..1]).is_none());
    }

    fn lookup_of(keys: &[(&str, char, i64, usize)]) -> EnvironmentLookup {
        keys.iter()
            .map(|&(pdb, chain, num, aa)| {
                ResidueEnvironment::new(pdb, chain, num, aa, vec![], vec![]).unwrap()
            })
            .collect()
    }

    #[test]
    fn test_match_drops_misses() -> Result<()> {
        let df = df!(
            "pdbid" => &["1ABC", "1ABC", "1ABC", "2XYZ", "1ABC"],
            "chainid" => &["A", "A", "B", "A", "A"],
            "variant" => &["A1G", "C2Y", "A1G", "D3E", "W9A"],
            "score" => &[0.5f32, 1.0, 1.5, 2.0, 2.5],
        )?;
        let mut lookups = HashMap::new();
        lookups.insert(
            "mega".to_string(),
            lookup_of(&[("1ABC", 'A', 1, 0), ("1ABC", 'A', 2, 1), ("1ABC", 'A', 9, 18)]),
        );
        let table = match_environments("mega", &df, &lookups)?;
        assert_eq!(table.n_before, 5);
        assert_eq!(table.n_dropped(), 2);
        assert_eq!(table.frame.height(), 3);
        assert_eq!(table.resenvs.len(), 3);
        assert_eq!(table.wt_idx, vec![0, 1, 18]);
        assert_eq!(table.mt_idx, vec![5, 19, 0]);
        assert_eq!(
            float_column(&table.frame, "score")?,
            vec![Some(0.5), Some(1.0), Some(2.5)]
        );
        Ok(())
    }

    #[test]
    fn test_symmetric_datasets_share_lookup() -> Result<()> {
        let df = df!(
            "pdbid" => &["1ABC"],
            "chainid" => &["A"],
            "variant" => &["A1G"],
        )?;
        let mut lookups = HashMap::new();
        lookups.insert("symmetric".to_string(), lookup_of(&[("1ABC", 'A', 1, 0)]));
        let mut tables = BTreeMap::new();
        tables.insert("symmetric_direct".to_string(), df.clone());
        tables.insert("symmetric_inverse".to_string(), df.clone());
        tables.insert("unknown".to_string(), df);
        let matched = populate_with_environments(&tables, &lookups)?;
        assert_eq!(matched["symmetric_direct"].frame.height(), 1);
        assert_eq!(matched["symmetric_inverse"].frame.height(), 1);
        assert_eq!(matched["unknown"].frame.height(), 0);
        assert_eq!(matched["unknown"].n_dropped(), 1);
        Ok(())
    }

    #[test]
    fn test_malformed_variant_is_fatal() -> Result<()> {
        let df = df!(
            "pdbid" => &["1ABC"],
            "chainid" => &["A"],
            "variant" => &["A1"],
        )?;
        assert!(match_environments("mega", &df, &HashMap::new()).is_err());
        Ok(())
    }

    /// Ignores the features and always predicts the same logits.
    struct FixedLogits(Vec<f32>);
    impl Module for FixedLogits {
        fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
            let batch = xs.dim(0)?;
            Tensor::new(self.0.as_slice(), xs.device())?
                .unsqueeze(0)?
                .repeat((batch, 1))
        }
    }

    #[test]
    fn test_score_table() -> Result<()> {
        let df = df!(
            "pdbid" => &["1ABC", "1ABC", "1ABC"],
            "chainid" => &["A", "A", "A"],
            "variant" => &["A1G", "C2Y", "A1C"],
        )?;
        let mut lookups = HashMap::new();
        lookups.insert(
            "mega".to_string(),
            lookup_of(&[("1ABC", 'A', 1, 0), ("1ABC", 'A', 2, 1)]),
        );
        let table = match_environments("mega", &df, &lookups)?;

        let mut logits = vec![0f32; 20];
        logits[0] = 2.0;
        let model = FixedLogits(logits.clone());
        let transformer = ToTensor::new(Device::Cpu, crate::transform::VoxelConfig::default());
        let mut freqs = vec![0.04f32; 20];
        freqs[0] = 0.24;
        let background = BackgroundFrequencies::from_frequencies(&freqs)?;

        // batch size 2 leaves a trailing batch of one, which must still be scored
        let scored = score_table(&table, &model, &transformer, &background, 2, DEFAULT_EPS)?;
        assert_eq!(scored.frame.height(), 3);
        assert_eq!(scored.nlls.len(), 3);
        assert!(scored.nlls.iter().all(|row| row.len() == 20));

        let expected = nll_from_logits(&Tensor::new(logits.as_slice(), &Device::Cpu)?, DEFAULT_EPS)?
            .to_vec1::<f32>()?;
        let want = baseline_ddg(expected[0], expected[5], background.nlf(0), background.nlf(5));
        assert!((scored.ddg_pred_no_ds[0] - want).abs() < 1e-5);
        let column = float_column(&scored.frame, "ddg_pred_no_ds")?;
        assert_eq!(column.len(), 3);
        assert!((column[0].unwrap() - want).abs() < 1e-5);

        // per-class nlls land in the frame in alphabet order
        let nll_c = float_column(&scored.frame, "nll_C")?;
        let nll_y = float_column(&scored.frame, "nll_Y")?;
        for row in 0..3 {
            assert!((nll_c[row].unwrap() - scored.nlls[row][1]).abs() < 1e-6);
            assert!((nll_y[row].unwrap() - scored.nlls[row][19]).abs() < 1e-6);
        }
        Ok(())
    }
}
