use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::biom::{self, BiomTable};
use crate::convert::BiomTool;
use crate::error::HarvestError;

/// Lowercase hex SHA-256 over the canonicalized table content. Equal
/// signatures mean the same logical table regardless of filename,
/// download URL, or the upstream file's row/column order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Signature(String);

impl Signature {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Canonicalization: rows and columns sorted lexicographically by
/// label, counts rounded to the nearest integer. The digest streams
/// sorted row labels (NUL-terminated), a separator, sorted column
/// labels (NUL-terminated), a separator, then the row-major
/// little-endian i64 matrix in sorted order.
pub fn table_signature(table: &BiomTable) -> Signature {
    let mut row_order = (0..table.observation_ids.len()).collect::<Vec<_>>();
    row_order.sort_by(|&a, &b| table.observation_ids[a].cmp(&table.observation_ids[b]));
    let mut col_order = (0..table.sample_ids.len()).collect::<Vec<_>>();
    col_order.sort_by(|&a, &b| table.sample_ids[a].cmp(&table.sample_ids[b]));

    let mut hasher = Sha256::new();
    for &row in &row_order {
        hasher.update(table.observation_ids[row].as_bytes());
        hasher.update([0u8]);
    }
    hasher.update(b"|");
    for &col in &col_order {
        hasher.update(table.sample_ids[col].as_bytes());
        hasher.update([0u8]);
    }
    hasher.update(b"|");
    for &row in &row_order {
        for &col in &col_order {
            let value = table.data[row][col].round_ties_even() as i64;
            hasher.update(value.to_le_bytes());
        }
    }
    Signature(hex::encode(hasher.finalize()))
}

/// Signature of a table file on disk. JSON tables are loaded natively;
/// HDF5 tables go through the external converter first. A missing
/// converter makes the signature unavailable (`Ok(None)`), which
/// disables content dedup while link dedup still applies.
pub fn file_signature<T: BiomTool>(
    path: &Utf8Path,
    tool: &T,
) -> Result<Option<Signature>, HarvestError> {
    if biom::is_hdf5(path)? {
        if !tool.is_available() {
            warn!("biom tool not found, content dedup unavailable for {path}");
            return Ok(None);
        }
        let scratch =
            tempfile::tempdir().map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        let json_path = Utf8PathBuf::from_path_buf(scratch.path().join("table.json"))
            .map_err(|_| HarvestError::Filesystem("non-UTF8 temp path".to_string()))?;
        tool.to_json(path, &json_path)?;
        let table = biom::load_json(&json_path)?;
        return Ok(Some(table_signature(&table)));
    }
    let table = biom::load_json(path)?;
    Ok(Some(table_signature(&table)))
}
