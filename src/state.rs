use std::collections::{BTreeMap, BTreeSet};
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::convert::BiomTool;
use crate::error::HarvestError;
use crate::signature::{self, Signature};

pub const STATE_FILE: &str = ".state.json";

/// Per-class resume and dedup state, kept as a sidecar in the class
/// directory. Losing it costs dedup history, never committed files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarvestState {
    #[serde(default)]
    pub seen_links: BTreeSet<String>,
    #[serde(default)]
    pub signature_to_name: BTreeMap<String, String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl HarvestState {
    pub fn link_seen(&self, url: &str) -> bool {
        self.seen_links.contains(url)
    }

    pub fn record_link(&mut self, url: &str) {
        self.seen_links.insert(url.to_string());
    }

    pub fn known_signature(&self, signature: &Signature) -> Option<&str> {
        self.signature_to_name
            .get(signature.as_str())
            .map(String::as_str)
    }

    /// First recording wins; a stale mapping is tolerated and later
    /// duplicates against it are still rejected.
    pub fn record_signature(&mut self, signature: Signature, name: &str) {
        self.signature_to_name
            .entry(signature.into_string())
            .or_insert_with(|| name.to_string());
    }
}

fn state_path(class_dir: &Utf8Path) -> Utf8PathBuf {
    class_dir.join(STATE_FILE)
}

/// Missing or unparseable sidecars load as empty state; corruption is
/// never fatal.
pub fn load_state(class_dir: &Utf8Path) -> HarvestState {
    let path = state_path(class_dir);
    if !path.as_std_path().exists() {
        return HarvestState::default();
    }
    match fs::read_to_string(path.as_std_path()) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(state) => state,
            Err(err) => {
                warn!("corrupt state file {path}, starting fresh: {err}");
                HarvestState::default()
            }
        },
        Err(err) => {
            warn!("unreadable state file {path}, starting fresh: {err}");
            HarvestState::default()
        }
    }
}

/// Stamps `updated_at` and writes the sidecar through a temp file and
/// rename.
pub fn save_state(class_dir: &Utf8Path, state: &mut HarvestState) -> Result<(), HarvestError> {
    state.updated_at = Some(chrono::Utc::now().to_rfc3339());
    let path = state_path(class_dir);
    let tmp_path = path.with_extension("json.tmp");
    let content =
        serde_json::to_vec_pretty(state).map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    fs::write(tmp_path.as_std_path(), &content)
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    fs::rename(tmp_path.as_std_path(), path.as_std_path())
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    Ok(())
}

/// When the state records no signatures, computes them for the output
/// files already on disk so a resume after manual edits still dedups.
/// Per-file failures are tolerated.
pub fn backfill_signatures<T: BiomTool>(
    state: &mut HarvestState,
    files: &[Utf8PathBuf],
    tool: &T,
) {
    if !state.signature_to_name.is_empty() {
        return;
    }
    let mut filled = 0usize;
    for path in files {
        let Some(name) = path.file_name() else {
            continue;
        };
        match signature::file_signature(path, tool) {
            Ok(Some(sig)) => {
                state.record_signature(sig, name);
                filled += 1;
            }
            Ok(None) => {}
            Err(err) => warn!("skipping signature backfill for {path}: {err}"),
        }
    }
    if filled > 0 {
        debug!("backfilled {filled} signatures from existing files");
    }
}
