//! Residue Environments
//!
//! A residue environment is the set of atoms surrounding a single residue,
//! with the residue's own atoms removed (the "cavity"). Environments are
//! extracted from parsed structure archives (`.npz`) with the following arrays:
//!
//! - `positions`          f32 `[n_atoms, 3]`
//! - `atom_types`         i64 `[n_atoms]`
//! - `atom_residue_index` i64 `[n_atoms]`
//! - `residue_numbers`    i64 `[n_res]`
//! - `aa_indices`         i64 `[n_res]`
//! - `chain_ids`          u8  `[n_res]`
//! - `centers`            f32 `[n_res, 3]`
//!
//! The pdb id is taken from the file name, up to the first `_`.
use crate::residues::{index_to_aa1, NUM_AMINO_ACIDS};
use anyhow::{anyhow, bail, Context, Result};
use candle_core::npy::NpzTensors;
use candle_core::{DType, Tensor};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Default radius (Angstrom) of the sphere of atoms kept around a residue center.
pub const DEFAULT_ENVIRONMENT_RADIUS: f32 = 9.0;

#[derive(Debug, Clone, PartialEq)]
pub struct ResidueEnvironment {
    pdb_id: String,
    chain_id: char,
    residue_number: i64,
    restype_index: usize,
    xyz_coords: Vec<[f32; 3]>,
    atom_types: Vec<usize>,
}

impl ResidueEnvironment {
    pub fn new(
        pdb_id: impl Into<String>,
        chain_id: char,
        residue_number: i64,
        restype_index: usize,
        xyz_coords: Vec<[f32; 3]>,
        atom_types: Vec<usize>,
    ) -> Result<Self> {
        if restype_index >= NUM_AMINO_ACIDS {
            bail!("restype index {} out of range", restype_index);
        }
        if xyz_coords.len() != atom_types.len() {
            bail!(
                "environment has {} coordinates but {} atom types",
                xyz_coords.len(),
                atom_types.len()
            );
        }
        Ok(Self {
            pdb_id: pdb_id.into(),
            chain_id,
            residue_number,
            restype_index,
            xyz_coords,
            atom_types,
        })
    }
    pub fn pdb_id(&self) -> &str {
        &self.pdb_id
    }
    pub fn chain_id(&self) -> char {
        self.chain_id
    }
    pub fn residue_number(&self) -> i64 {
        self.residue_number
    }
    pub fn restype_index(&self) -> usize {
        self.restype_index
    }
    pub fn xyz_coords(&self) -> &[[f32; 3]] {
        &self.xyz_coords
    }
    pub fn atom_types(&self) -> &[usize] {
        &self.atom_types
    }
    pub fn wt_letter(&self) -> char {
        index_to_aa1(self.restype_index).unwrap_or('X')
    }
    /// Lookup key: `{pdbid}{chain}_{position}{wt_letter}`.
    pub fn key(&self) -> String {
        environment_key(
            &self.pdb_id,
            &self.chain_id.to_string(),
            &self.residue_number.to_string(),
            self.wt_letter(),
        )
    }
}

/// Build a lookup key from its parts.
///
/// ```
/// use ferritin_cavity::environment::environment_key;
/// assert_eq!(environment_key("1ABC", "A", "123", 'A'), "1ABCA_123A");
/// ```
pub fn environment_key(pdb_id: &str, chain_id: &str, position: &str, wt_letter: char) -> String {
    format!("{}{}_{}{}", pdb_id, chain_id, position, wt_letter)
}

fn pdb_id_from_path(path: &Path) -> Result<String> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| anyhow!("cannot derive a pdb id from {}", path.display()))?;
    Ok(stem.split('_').next().unwrap_or(stem).to_string())
}

fn npz_array(npz: &NpzTensors, name: &str, path: &Path) -> Result<Tensor> {
    npz.get(name)?
        .ok_or_else(|| anyhow!("array `{}` missing from {}", name, path.display()))
}

/// Read an `[n, 3]` coordinate array.
fn npz_coords(npz: &NpzTensors, name: &str, path: &Path) -> Result<Vec<[f32; 3]>> {
    let array = npz_array(npz, name, path)?;
    let (_, width) = array.dims2()?;
    if width != 3 {
        bail!(
            "array `{}` in {} has {} columns, expected 3",
            name,
            path.display(),
            width
        );
    }
    Ok(array
        .to_dtype(DType::F32)?
        .to_vec2::<f32>()?
        .into_iter()
        .map(|row| [row[0], row[1], row[2]])
        .collect())
}

/// Parsed structure archives (`*.npz`) in a directory, sorted by file name.
pub fn parsed_structure_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("failed to read directory {}", dir.display()))?
    {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "npz") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Extract every residue environment from one parsed structure archive.
pub fn load_environments(path: &Path, radius: f32) -> Result<Vec<ResidueEnvironment>> {
    let npz = NpzTensors::new(path)
        .with_context(|| format!("failed to open parsed structure {}", path.display()))?;
    let pdb_id = pdb_id_from_path(path)?;

    let positions = npz_coords(&npz, "positions", path)?;
    let atom_types = npz_array(&npz, "atom_types", path)?
        .to_dtype(DType::I64)?
        .to_vec1::<i64>()?;
    let atom_residue_index = npz_array(&npz, "atom_residue_index", path)?
        .to_dtype(DType::I64)?
        .to_vec1::<i64>()?;
    let residue_numbers = npz_array(&npz, "residue_numbers", path)?
        .to_dtype(DType::I64)?
        .to_vec1::<i64>()?;
    let aa_indices = npz_array(&npz, "aa_indices", path)?
        .to_dtype(DType::I64)?
        .to_vec1::<i64>()?;
    let chain_ids = npz_array(&npz, "chain_ids", path)?.to_vec1::<u8>()?;
    let centers = npz_coords(&npz, "centers", path)?;

    let n_atoms = positions.len();
    let n_res = residue_numbers.len();
    if atom_types.len() != n_atoms || atom_residue_index.len() != n_atoms {
        bail!("per-atom arrays disagree in length in {}", path.display());
    }
    if aa_indices.len() != n_res || chain_ids.len() != n_res || centers.len() != n_res {
        bail!("per-residue arrays disagree in length in {}", path.display());
    }

    let radius_sq = radius * radius;
    let mut environments = Vec::with_capacity(n_res);
    for res_idx in 0..n_res {
        let aa_idx = aa_indices[res_idx];
        if aa_idx < 0 || aa_idx as usize >= NUM_AMINO_ACIDS {
            continue;
        }
        let center = &centers[res_idx];
        let mut xyz_coords = Vec::new();
        let mut env_atom_types = Vec::new();
        for atom_idx in 0..n_atoms {
            if atom_residue_index[atom_idx] == res_idx as i64 {
                continue;
            }
            let pos = &positions[atom_idx];
            let rel = [pos[0] - center[0], pos[1] - center[1], pos[2] - center[2]];
            if rel.iter().map(|v| v * v).sum::<f32>() > radius_sq {
                continue;
            }
            xyz_coords.push(rel);
            env_atom_types.push(atom_types[atom_idx] as usize);
        }
        environments.push(ResidueEnvironment::new(
            pdb_id.clone(),
            chain_ids[res_idx] as char,
            residue_numbers[res_idx],
            aa_idx as usize,
            xyz_coords,
            env_atom_types,
        )?);
    }
    Ok(environments)
}

/// Ordered collection of residue environments.
#[derive(Debug, Clone, Default)]
pub struct ResidueEnvironmentsDataset {
    environments: Vec<ResidueEnvironment>,
}

impl ResidueEnvironmentsDataset {
    /// Parse every file in order and concatenate their environments.
    pub fn from_files(paths: &[PathBuf], radius: f32) -> Result<Self> {
        let mut environments = Vec::new();
        for path in paths {
            environments.extend(load_environments(path, radius)?);
        }
        Ok(Self { environments })
    }
    pub fn from_environments(environments: Vec<ResidueEnvironment>) -> Self {
        Self { environments }
    }
    pub fn len(&self) -> usize {
        self.environments.len()
    }
    pub fn is_empty(&self) -> bool {
        self.environments.is_empty()
    }
    pub fn get(&self, idx: usize) -> Option<&ResidueEnvironment> {
        self.environments.get(idx)
    }
    pub fn iter(&self) -> impl Iterator<Item = &ResidueEnvironment> {
        self.environments.iter()
    }
}

/// Environments of one dataset, indexed by [`ResidueEnvironment::key`].
#[derive(Debug, Clone, Default)]
pub struct EnvironmentLookup {
    by_key: HashMap<String, ResidueEnvironment>,
}

impl EnvironmentLookup {
    pub fn get(&self, key: &str) -> Option<&ResidueEnvironment> {
        self.by_key.get(key)
    }
    pub fn len(&self) -> usize {
        self.by_key.len()
    }
    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

impl From<ResidueEnvironmentsDataset> for EnvironmentLookup {
    fn from(dataset: ResidueEnvironmentsDataset) -> Self {
        let by_key = dataset
            .environments
            .into_iter()
            .map(|env| (env.key(), env))
            .collect();
        Self { by_key }
    }
}

impl FromIterator<ResidueEnvironment> for EnvironmentLookup {
    fn from_iter<I: IntoIterator<Item = ResidueEnvironment>>(iter: I) -> Self {
        Self {
            by_key: iter.into_iter().map(|env| (env.key(), env)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pdb: &str, chain: char, num: i64, aa: usize) -> ResidueEnvironment {
        ResidueEnvironment::new(pdb, chain, num, aa, vec![[0.0, 0.0, 1.0]], vec![0]).unwrap()
    }

    #[test]
    fn test_key_format() {
        assert_eq!(env("1ABC", 'A', 123, 0).key(), "1ABCA_123A");
        assert_eq!(env("2XYZ", 'B', 7, 5).key(), "2XYZB_7G");
    }

    #[test]
    fn test_invalid_environment() {
        assert!(ResidueEnvironment::new("1ABC", 'A', 1, 20, vec![], vec![]).is_err());
        assert!(ResidueEnvironment::new("1ABC", 'A', 1, 0, vec![[0.0; 3]], vec![]).is_err());
    }

    #[test]
    fn test_lookup_by_key() {
        let dataset = ResidueEnvironmentsDataset::from_environments(vec![
            env("1ABC", 'A', 1, 0),
            env("1ABC", 'A', 2, 1),
        ]);
        let lookup = EnvironmentLookup::from(dataset);
        assert_eq!(lookup.len(), 2);
        assert!(lookup.get("1ABCA_2C").is_some());
        assert!(lookup.get("1ABCA_2A").is_none());
    }

    #[test]
    fn test_coordinates_must_be_three_wide() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("1bad_coordinate_features.npz");
        let dev = candle_core::Device::Cpu;
        Tensor::write_npz(
            &[
                ("positions", Tensor::zeros((2, 2), DType::F32, &dev)?),
                ("atom_types", Tensor::zeros(2, DType::I64, &dev)?),
                ("atom_residue_index", Tensor::zeros(2, DType::I64, &dev)?),
                ("residue_numbers", Tensor::ones(1, DType::I64, &dev)?),
                ("aa_indices", Tensor::zeros(1, DType::I64, &dev)?),
                ("chain_ids", Tensor::from_vec(vec![b'A'], 1, &dev)?),
                ("centers", Tensor::zeros((1, 3), DType::F32, &dev)?),
            ],
            &path,
        )?;
        let err = load_environments(&path, 9.0).unwrap_err();
        assert!(err.to_string().contains("expected 3"), "{}", err);
        Ok(())
    }

    #[test]
    fn test_pdb_id_from_path() {
        let path = Path::new("/tmp/1abc_clean_coordinate_features.npz");
        assert_eq!(pdb_id_from_path(path).unwrap(), "1abc");
    }
}
