use std::fs::{self, File};
use std::io::{self, Read};

use camino::Utf8Path;
use serde::Deserialize;
use serde_json::json;

use crate::error::HarvestError;

const HDF5_MAGIC: [u8; 8] = [0x89, b'H', b'D', b'F', b'\r', b'\n', 0x1a, b'\n'];

/// A BIOM table reduced to what the signature needs: observation ids
/// (rows), sample ids (columns), and a dense row-major count matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct BiomTable {
    pub observation_ids: Vec<String>,
    pub sample_ids: Vec<String>,
    pub data: Vec<Vec<f64>>,
}

impl BiomTable {
    pub fn shape(&self) -> (usize, usize) {
        (self.observation_ids.len(), self.sample_ids.len())
    }
}

#[derive(Debug, Deserialize)]
struct BiomJson {
    rows: Vec<BiomAxis>,
    columns: Vec<BiomAxis>,
    matrix_type: String,
    shape: (usize, usize),
    data: Vec<Vec<f64>>,
}

#[derive(Debug, Deserialize)]
struct BiomAxis {
    id: String,
}

/// Loads a BIOM 1.0 JSON table, dense or sparse.
pub fn load_json(path: &Utf8Path) -> Result<BiomTable, HarvestError> {
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|err| HarvestError::TableFormat(format!("{path}: {err}")))?;
    parse_json(&content).map_err(|message| HarvestError::TableFormat(format!("{path}: {message}")))
}

fn parse_json(content: &str) -> Result<BiomTable, String> {
    let parsed: BiomJson = serde_json::from_str(content).map_err(|err| err.to_string())?;
    let (nrows, ncols) = parsed.shape;
    if parsed.rows.len() != nrows || parsed.columns.len() != ncols {
        return Err(format!(
            "shape {nrows}x{ncols} does not match axes {}x{}",
            parsed.rows.len(),
            parsed.columns.len()
        ));
    }
    let mut data = vec![vec![0.0; ncols]; nrows];
    match parsed.matrix_type.as_str() {
        "dense" => {
            if parsed.data.len() != nrows {
                return Err("dense matrix row count does not match shape".to_string());
            }
            for (index, row) in parsed.data.into_iter().enumerate() {
                if row.len() != ncols {
                    return Err("dense matrix column count does not match shape".to_string());
                }
                data[index] = row;
            }
        }
        "sparse" => {
            for entry in &parsed.data {
                let [row, col, value] = entry.as_slice() else {
                    return Err("sparse entry is not a [row, col, value] triple".to_string());
                };
                let (r, c) = (*row as usize, *col as usize);
                if r >= nrows || c >= ncols {
                    return Err(format!("sparse entry ({r}, {c}) outside shape {nrows}x{ncols}"));
                }
                data[r][c] = *value;
            }
        }
        other => return Err(format!("unsupported matrix_type: {other}")),
    }
    Ok(BiomTable {
        observation_ids: parsed.rows.into_iter().map(|axis| axis.id).collect(),
        sample_ids: parsed.columns.into_iter().map(|axis| axis.id).collect(),
        data,
    })
}

/// Parses a delimited OTU text table. Comment preamble lines without a
/// tab are skipped; the first line with a tab is the header, and its
/// first cell (the index column name) is discarded.
pub fn from_tsv(path: &Utf8Path) -> Result<BiomTable, HarvestError> {
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|err| HarvestError::TableFormat(format!("{path}: {err}")))?;
    parse_tsv(&content).map_err(|message| HarvestError::TableFormat(format!("{path}: {message}")))
}

fn parse_tsv(content: &str) -> Result<BiomTable, String> {
    let mut lines = content.lines().filter(|line| !line.trim().is_empty());
    let header = loop {
        match lines.next() {
            Some(line) if line.contains('\t') => break line,
            Some(_) => continue,
            None => return Err("no tabular header found".to_string()),
        }
    };
    let sample_ids = header
        .split('\t')
        .skip(1)
        .map(|cell| cell.trim().to_string())
        .collect::<Vec<_>>();
    if sample_ids.is_empty() {
        return Err("header has no sample columns".to_string());
    }

    let mut observation_ids = Vec::new();
    let mut data = Vec::new();
    for line in lines {
        let cells = line.split('\t').collect::<Vec<_>>();
        if cells.len() != sample_ids.len() + 1 {
            return Err(format!(
                "row {} has {} value columns, expected {}",
                observation_ids.len() + 1,
                cells.len() - 1,
                sample_ids.len()
            ));
        }
        observation_ids.push(cells[0].trim().to_string());
        let mut row = Vec::with_capacity(sample_ids.len());
        for cell in &cells[1..] {
            let value = cell
                .trim()
                .parse::<f64>()
                .map_err(|_| format!("non-numeric cell: {cell:?}"))?;
            row.push(value);
        }
        data.push(row);
    }
    Ok(BiomTable {
        observation_ids,
        sample_ids,
        data,
    })
}

/// Persists a table as BIOM 1.0 dense JSON. Callers stage the output
/// under a temporary name, so this writes the path directly.
pub fn write_json(
    table: &BiomTable,
    path: &Utf8Path,
    generated_by: &str,
) -> Result<(), HarvestError> {
    let (nrows, ncols) = table.shape();
    let rows = table
        .observation_ids
        .iter()
        .map(|id| json!({"id": id, "metadata": null}))
        .collect::<Vec<_>>();
    let columns = table
        .sample_ids
        .iter()
        .map(|id| json!({"id": id, "metadata": null}))
        .collect::<Vec<_>>();
    let document = json!({
        "id": null,
        "format": "Biological Observation Matrix 1.0.0",
        "format_url": "http://biom-format.org",
        "type": "OTU table",
        "generated_by": generated_by,
        "date": chrono::Utc::now().to_rfc3339(),
        "matrix_type": "dense",
        "matrix_element_type": "float",
        "shape": [nrows, ncols],
        "rows": rows,
        "columns": columns,
        "data": table.data,
    });
    let content = serde_json::to_vec_pretty(&document)
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    fs::write(path.as_std_path(), &content)
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    Ok(())
}

/// True when the file starts with the 8-byte HDF5 signature.
pub fn is_hdf5(path: &Utf8Path) -> Result<bool, HarvestError> {
    let mut file = File::open(path.as_std_path())
        .map_err(|err| HarvestError::TableFormat(format!("{path}: {err}")))?;
    let mut magic = [0u8; 8];
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(magic == HDF5_MAGIC),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(err) => Err(HarvestError::TableFormat(format!("{path}: {err}"))),
    }
}
