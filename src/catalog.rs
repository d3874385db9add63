use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer};

use crate::domain::{DownloadCandidate, DownloadKind};

pub const BINARY_TABLE_EXT: &str = ".biom";
pub const TEXT_TABLE_EXT: &str = ".tsv";
pub const OTU_MARKER: &str = "otu";

/// One page of a JSON:API listing, reduced to the fields the harvest
/// actually reads. Absent fields deserialize to their defaults; absence
/// is data here, not an error.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Page {
    #[serde(default, deserialize_with = "one_or_many")]
    pub data: Vec<Resource>,
    #[serde(default)]
    pub links: PageLinks,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageLinks {
    #[serde(default)]
    pub next: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Resource {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub relationships: BTreeMap<String, Relationship>,
    #[serde(default)]
    pub links: ResourceLinks,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Attributes {
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default, rename = "samples-count")]
    pub samples_count: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Relationship {
    #[serde(default)]
    pub links: RelationshipLinks,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelationshipLinks {
    #[serde(default)]
    pub related: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResourceLinks {
    #[serde(default, rename = "self")]
    pub self_link: Option<String>,
}

impl Page {
    pub fn next_link(&self) -> Option<&str> {
        self.links.next.as_deref()
    }
}

impl Resource {
    pub fn related_link(&self, rel: &str) -> Option<&str> {
        self.relationships
            .get(rel)
            .and_then(|relationship| relationship.links.related.as_deref())
    }

    pub fn self_link(&self) -> Option<&str> {
        self.links.self_link.as_deref()
    }

    pub fn alias(&self) -> Option<&str> {
        self.attributes
            .alias
            .as_deref()
            .map(str::trim)
            .filter(|alias| !alias.is_empty())
    }
}

// Detail endpoints carry a single resource object under `data`, listing
// endpoints an array, and some error bodies a null.
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<Resource>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        Many(Vec<Resource>),
        One(Box<Resource>),
        Null,
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::Many(items) => items,
        OneOrMany::One(item) => vec![*item],
        OneOrMany::Null => Vec::new(),
    })
}

#[derive(Debug, Clone, Default)]
pub struct Candidates {
    pub binary: Option<DownloadCandidate>,
    pub text: Option<DownloadCandidate>,
}

impl Candidates {
    /// Binary table if one was listed, else the text fallback.
    pub fn preferred(&self) -> Option<&DownloadCandidate> {
        self.binary.as_ref().or(self.text.as_ref())
    }
}

/// Picks download candidates from a downloads listing. The first alias
/// ending in `.biom` wins outright and scanning stops; the first alias
/// containing `otu` and ending in `.tsv` is kept as the fallback. Items
/// without both an alias and a self link are skipped.
pub fn select_candidates(page: &Page) -> Candidates {
    let mut found = Candidates::default();
    for item in &page.data {
        let (Some(alias), Some(link)) = (item.alias(), item.self_link()) else {
            continue;
        };
        let lowered = alias.to_lowercase();
        if lowered.ends_with(BINARY_TABLE_EXT) {
            found.binary = Some(DownloadCandidate {
                url: link.to_string(),
                alias: alias.to_string(),
                kind: DownloadKind::BinaryTable,
            });
            break;
        }
        if found.text.is_none() && lowered.contains(OTU_MARKER) && lowered.ends_with(TEXT_TABLE_EXT)
        {
            found.text = Some(DownloadCandidate {
                url: link.to_string(),
                alias: alias.to_string(),
                kind: DownloadKind::TextTable,
            });
        }
    }
    found
}
