use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;

use crate::domain::ClassName;
use crate::error::HarvestError;

const INDEX_PATTERN: &str = r"^(?i)(?P<cls>[a-z_]+)_(?P<idx>\d+)\.biom$";

/// Output layout: one directory per class under the harvest root,
/// files named `<class>_<index>.biom`.
#[derive(Debug, Clone)]
pub struct OutputStore {
    root: Utf8PathBuf,
}

impl OutputStore {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn class_dir(&self, class: &ClassName) -> Utf8PathBuf {
        self.root.join(class.as_str())
    }

    pub fn ensure_class_dir(&self, class: &ClassName) -> Result<Utf8PathBuf, HarvestError> {
        let dir = self.class_dir(class);
        fs::create_dir_all(dir.as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        Ok(dir)
    }

    pub fn output_name(&self, class: &ClassName, index: usize) -> String {
        format!("{class}_{index}.biom")
    }

    /// Output files belonging to the class, sorted by name.
    pub fn class_files(&self, class: &ClassName) -> Result<Vec<Utf8PathBuf>, HarvestError> {
        Ok(self
            .scan_class(class)?
            .into_iter()
            .map(|(_, path)| path)
            .collect())
    }

    /// Smallest unused index: one past the highest index present on
    /// disk, recomputed by scanning filenames on every call. The
    /// directory is the contract of record, not the state file.
    pub fn next_index(&self, class: &ClassName) -> Result<usize, HarvestError> {
        let max_index = self
            .scan_class(class)?
            .into_iter()
            .map(|(index, _)| index)
            .max()
            .unwrap_or(0);
        Ok(max_index + 1)
    }

    pub fn saved_count(&self, class: &ClassName) -> Result<usize, HarvestError> {
        Ok(self.next_index(class)? - 1)
    }

    fn scan_class(&self, class: &ClassName) -> Result<Vec<(usize, Utf8PathBuf)>, HarvestError> {
        let dir = self.class_dir(class);
        if !dir.as_std_path().is_dir() {
            return Ok(Vec::new());
        }
        let pattern = Regex::new(INDEX_PATTERN).unwrap();
        let mut matches = Vec::new();
        let entries =
            fs::read_dir(dir.as_std_path()).map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| HarvestError::Filesystem(err.to_string()))?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let Some(captures) = pattern.captures(name) else {
                continue;
            };
            if !captures["cls"].eq_ignore_ascii_case(class.as_str()) {
                continue;
            }
            let Ok(index) = captures["idx"].parse::<usize>() else {
                continue;
            };
            matches.push((index, dir.join(name)));
        }
        matches.sort_by(|a, b| a.1.cmp(&b.1));
        Ok(matches)
    }
}
