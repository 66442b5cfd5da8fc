//! ferritin-test-data
//!
//! Synthetic fixtures for testing: parsed structure archives, background
//! frequency archives and mutation tables, written into temporary directories.
//!
//! The fixtures are represented as builders that write files into a
//! `TempDir`; keep the returned handle alive for as long as the files are used.
//!
//! ```ignore
//! use ferritin_test_data::{SyntheticStructure, TestDir};
//! let dir = TestDir::new()?;
//! let path = SyntheticStructure::helix("1abc", 'A', 12).write_npz(dir.path())?;
//! ```
use anyhow::Result;
use candle_core::{Device, Tensor};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Letters of the 20 amino acids in class-index order.
pub const AA_LETTERS: &str = "ACDEFGHIKLMNPQRSTVWY";

/// Approximate amino-acid frequencies in the PDB, in class-index order.
#[rustfmt::skip]
pub const PDB_FREQUENCIES: [f32; 20] = [
    0.0825, 0.0137, 0.0545, 0.0675, 0.0386,
    0.0707, 0.0227, 0.0596, 0.0584, 0.0966,
    0.0242, 0.0406, 0.0470, 0.0393, 0.0553,
    0.0656, 0.0534, 0.0687, 0.0108, 0.0292,
];

/// Temporary directory that is removed when dropped.
#[derive(Debug)]
pub struct TestDir {
    inner: TempDir,
}

impl TestDir {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            inner: tempfile::Builder::new().prefix("ferritin-cavity").tempdir()?,
        })
    }
    pub fn path(&self) -> &Path {
        self.inner.path()
    }
    /// Create (if needed) and return a subdirectory.
    pub fn subdir(&self, name: &str) -> std::io::Result<PathBuf> {
        let dir = self.inner.path().join(name);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

/// A small, deterministic protein-like structure.
#[derive(Debug, Clone)]
pub struct SyntheticStructure {
    pub pdb_id: String,
    pub chain_id: char,
    /// `(residue number, class index)` per residue.
    pub residues: Vec<(i64, i64)>,
    pub n_atom_types: usize,
}

impl SyntheticStructure {
    /// `n_res` residues on an ideal alpha helix, numbered from 1, with
    /// amino-acid classes cycling through the alphabet.
    pub fn helix(pdb_id: &str, chain_id: char, n_res: usize) -> Self {
        let residues = (0..n_res)
            .map(|i| (i as i64 + 1, ((i * 7) % 20) as i64))
            .collect();
        Self {
            pdb_id: pdb_id.to_string(),
            chain_id,
            residues,
            n_atom_types: 4,
        }
    }
    /// Residue key as used by environment lookups.
    pub fn key(&self, res_idx: usize) -> String {
        let (number, aa) = self.residues[res_idx];
        let letter = AA_LETTERS.as_bytes()[aa as usize] as char;
        format!("{}{}_{}{}", self.pdb_id, self.chain_id, number, letter)
    }
    /// One-letter code of the residue at `res_idx`.
    pub fn letter(&self, res_idx: usize) -> char {
        AA_LETTERS.as_bytes()[self.residues[res_idx].1 as usize] as char
    }

    /// Write `<pdb_id>_coordinate_features.npz` into `dir`.
    pub fn write_npz(&self, dir: &Path) -> Result<PathBuf> {
        let n_res = self.residues.len();
        let atoms_per_res = self.n_atom_types;
        let mut positions = Vec::with_capacity(n_res * atoms_per_res * 3);
        let mut atom_types = Vec::with_capacity(n_res * atoms_per_res);
        let mut atom_residue_index = Vec::with_capacity(n_res * atoms_per_res);
        let mut centers = Vec::with_capacity(n_res * 3);
        for res_idx in 0..n_res {
            // 3.6 residues per turn, 1.5 A rise, 2.3 A radius
            let theta = res_idx as f32 * 100f32.to_radians();
            let center = [2.3 * theta.cos(), 2.3 * theta.sin(), 1.5 * res_idx as f32];
            centers.extend_from_slice(&center);
            for atom in 0..atoms_per_res {
                let offset = 0.7 * (atom as f32 + 1.0);
                positions.extend_from_slice(&[
                    center[0] + offset * theta.cos(),
                    center[1] + offset * theta.sin(),
                    center[2] + 0.3 * atom as f32,
                ]);
                atom_types.push(atom as i64);
                atom_residue_index.push(res_idx as i64);
            }
        }
        let n_atoms = atom_types.len();
        let residue_numbers: Vec<i64> = self.residues.iter().map(|r| r.0).collect();
        let aa_indices: Vec<i64> = self.residues.iter().map(|r| r.1).collect();
        let chain_ids = vec![self.chain_id as u8; n_res];

        let dev = Device::Cpu;
        let path = dir.join(format!("{}_coordinate_features.npz", self.pdb_id));
        Tensor::write_npz(
            &[
                ("positions", Tensor::from_vec(positions, (n_atoms, 3), &dev)?),
                ("atom_types", Tensor::from_vec(atom_types, n_atoms, &dev)?),
                (
                    "atom_residue_index",
                    Tensor::from_vec(atom_residue_index, n_atoms, &dev)?,
                ),
                ("residue_numbers", Tensor::from_vec(residue_numbers, n_res, &dev)?),
                ("aa_indices", Tensor::from_vec(aa_indices, n_res, &dev)?),
                ("chain_ids", Tensor::from_vec(chain_ids, n_res, &dev)?),
                ("centers", Tensor::from_vec(centers, (n_res, 3), &dev)?),
            ],
            &path,
        )?;
        Ok(path)
    }
}

/// Write a set of helices `<prefix>0..<prefix>n` and return their paths in order.
pub fn write_structures(
    dir: &Path,
    prefix: &str,
    n_structures: usize,
    n_res: usize,
) -> Result<Vec<PathBuf>> {
    (0..n_structures)
        .map(|i| SyntheticStructure::helix(&format!("{}{}", prefix, i), 'A', n_res).write_npz(dir))
        .collect()
}

/// Write a background frequency archive holding a `frequencies` array.
pub fn write_frequencies(dir: &Path, frequencies: &[f32]) -> Result<PathBuf> {
    let path = dir.join("pdb_frequencies.npz");
    let tensor = Tensor::from_slice(frequencies, frequencies.len(), &Device::Cpu)?;
    Tensor::write_npz(&[("frequencies", tensor)], &path)?;
    Ok(path)
}

/// Write a mutation table with `pdbid,chainid,variant,score` columns.
pub fn write_ddg_csv(
    dir: &Path,
    name: &str,
    rows: &[(&str, &str, &str, f32)],
) -> Result<PathBuf> {
    let path = dir.join(format!("{}.csv", name));
    let mut content = String::from("pdbid,chainid,variant,score\n");
    for (pdbid, chainid, variant, score) in rows {
        content.push_str(&format!("{},{},{},{}\n", pdbid, chainid, variant, score));
    }
    fs::write(&path, content)?;
    Ok(path)
}
