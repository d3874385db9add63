use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::HarvestError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClassName(String);

impl ClassName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClassName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ClassName {
    type Err = HarvestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase();
        let is_valid = !normalized.is_empty()
            && normalized
                .chars()
                .all(|ch| ch.is_ascii_lowercase() || ch == '_');
        if !is_valid {
            return Err(HarvestError::InvalidClassName(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

/// Colon-delimited biome lineage as MGnify spells it, e.g.
/// `root:Environmental:Terrestrial:Soil:Forest soil`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Lineage(String);

impl Lineage {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn leaf(&self) -> &str {
        self.0.rsplit(':').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for Lineage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Lineage {
    type Err = HarvestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let segments = trimmed.split(':').collect::<Vec<_>>();
        let is_valid = segments.first() == Some(&"root")
            && segments.iter().all(|segment| !segment.is_empty());
        if !is_valid {
            return Err(HarvestError::InvalidLineage(value.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BiomeClass {
    pub name: ClassName,
    pub lineage: Lineage,
    pub target: usize,
}

impl BiomeClass {
    pub fn new(name: ClassName, lineage: Lineage, target: usize) -> Self {
        Self {
            name,
            lineage,
            target,
        }
    }
}

/// CLI shorthand for a class: `name=lineage`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassSpec {
    pub name: ClassName,
    pub lineage: Lineage,
}

impl FromStr for ClassSpec {
    type Err = HarvestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let (name, lineage) = trimmed
            .split_once('=')
            .ok_or_else(|| HarvestError::InvalidClassSpec(value.to_string()))?;
        Ok(Self {
            name: name.parse()?,
            lineage: lineage.parse()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadKind {
    BinaryTable,
    TextTable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadCandidate {
    pub url: String,
    pub alias: String,
    pub kind: DownloadKind,
}
