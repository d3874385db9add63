use std::path::PathBuf;
use std::process::Command;

use camino::Utf8Path;

use crate::biom;
use crate::error::HarvestError;

/// External `biom` command-line converter. Optional at runtime; the
/// harvest degrades rather than fail when it is absent.
pub trait BiomTool: Send + Sync {
    fn is_available(&self) -> bool;
    /// Delimited OTU text to the binary table encoding.
    fn convert_tsv(&self, tsv: &Utf8Path, dest: &Utf8Path) -> Result<(), HarvestError>;
    /// Binary table to the JSON encoding.
    fn to_json(&self, table: &Utf8Path, dest: &Utf8Path) -> Result<(), HarvestError>;
}

#[derive(Debug, Clone, Default)]
pub struct SystemBiomTool {
    binary: Option<PathBuf>,
}

impl SystemBiomTool {
    pub fn new() -> Self {
        Self {
            binary: find_in_path("biom"),
        }
    }

    fn run_cmd(&self, args: &[String]) -> Result<(), HarvestError> {
        let binary = self
            .binary
            .as_ref()
            .ok_or_else(|| HarvestError::MissingTool("biom".to_string()))?;
        let output = Command::new(binary)
            .args(args)
            .output()
            .map_err(|err| HarvestError::Conversion(err.to_string()))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.is_empty() {
            format!("command failed: {}", binary.display())
        } else {
            stderr
        };
        Err(HarvestError::Conversion(message))
    }
}

impl BiomTool for SystemBiomTool {
    fn is_available(&self) -> bool {
        self.binary.is_some()
    }

    fn convert_tsv(&self, tsv: &Utf8Path, dest: &Utf8Path) -> Result<(), HarvestError> {
        let args = vec![
            "convert".to_string(),
            "-i".to_string(),
            tsv.to_string(),
            "-o".to_string(),
            dest.to_string(),
            "--table-type=OTU table".to_string(),
            "--to-hdf5".to_string(),
        ];
        self.run_cmd(&args)
    }

    fn to_json(&self, table: &Utf8Path, dest: &Utf8Path) -> Result<(), HarvestError> {
        let args = vec![
            "convert".to_string(),
            "-i".to_string(),
            table.to_string(),
            "-o".to_string(),
            dest.to_string(),
            "--table-type=OTU table".to_string(),
            "--to-json".to_string(),
        ];
        self.run_cmd(&args)
    }
}

/// Converts a downloaded OTU text table into a committable table file.
/// The external converter is used when present and its failure is a
/// conversion failure; only its absence selects the native JSON path.
pub fn tsv_to_table_file<T: BiomTool>(
    tool: &T,
    tsv: &Utf8Path,
    dest: &Utf8Path,
) -> Result<(), HarvestError> {
    if tool.is_available() {
        return tool.convert_tsv(tsv, dest);
    }
    let table = biom::from_tsv(tsv)?;
    biom::write_json(&table, dest, "biom-harvester")
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.exists() {
            return Some(plain);
        }
    }
    None
}
