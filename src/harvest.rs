use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info, warn};

use crate::catalog;
use crate::config::HarvestLimits;
use crate::convert::{self, BiomTool};
use crate::domain::{BiomeClass, DownloadCandidate, DownloadKind};
use crate::error::HarvestError;
use crate::mgnify::{self, MgnifyClient};
use crate::shutdown;
use crate::signature;
use crate::state::{self, HarvestState};
use crate::store::OutputStore;

/// Outcome of harvesting one class, whether it ran to target or
/// stopped early on a limit.
#[derive(Debug, Clone)]
pub struct ClassReport {
    pub class: String,
    pub saved: usize,
    pub added: usize,
    pub target: usize,
    pub hit_target: bool,
}

#[derive(Debug)]
pub struct HarvestSummary {
    pub reports: Vec<ClassReport>,
    pub interrupted: bool,
}

impl HarvestSummary {
    pub fn total_saved(&self) -> usize {
        self.reports.iter().map(|report| report.saved).sum()
    }
}

enum Commit {
    Saved,
    Skipped,
}

pub struct Harvester<C: MgnifyClient, T: BiomTool> {
    store: OutputStore,
    client: C,
    tool: T,
    limits: HarvestLimits,
    base_url: String,
    interrupt: &'static AtomicBool,
}

impl<C: MgnifyClient, T: BiomTool> Harvester<C, T> {
    pub fn new(
        store: OutputStore,
        client: C,
        tool: T,
        limits: HarvestLimits,
        base_url: String,
    ) -> Self {
        Self {
            store,
            client,
            tool,
            limits,
            base_url,
            interrupt: shutdown::interrupt_flag(),
        }
    }

    /// Swaps in a caller-owned interrupt flag so tests do not share the
    /// process-wide one.
    pub fn with_interrupt(mut self, flag: &'static AtomicBool) -> Self {
        self.interrupt = flag;
        self
    }

    /// Harvests each class in turn. A class failure is logged and the
    /// next class is attempted; an interrupt stops the remainder. The
    /// summary is produced either way.
    pub fn run(&self, classes: &[BiomeClass]) -> HarvestSummary {
        let mut reports = Vec::new();
        let mut interrupted = false;
        for class in classes {
            if self.interrupted() {
                interrupted = true;
                break;
            }
            match self.harvest_class(class) {
                Ok(report) => reports.push(report),
                Err(HarvestError::Interrupted) => {
                    warn!("interrupted, stopping after class {}", class.name);
                    interrupted = true;
                    break;
                }
                Err(err) => {
                    warn!("class {} failed: {err}", class.name);
                }
            }
        }
        HarvestSummary {
            reports,
            interrupted,
        }
    }

    /// Harvests one class up to its target, resuming from whatever is
    /// already on disk. Reaching the target, the time limit, or the
    /// page cap all end the class gracefully with progress retained;
    /// only interruption and local filesystem trouble abort it.
    pub fn harvest_class(&self, class: &BiomeClass) -> Result<ClassReport, HarvestError> {
        let class_dir = self.store.ensure_class_dir(&class.name)?;
        let mut state = state::load_state(&class_dir);
        let files = self.store.class_files(&class.name)?;
        state::backfill_signatures(&mut state, &files, &self.tool);
        state::save_state(&class_dir, &mut state)?;

        let mut index = self.store.next_index(&class.name)?;
        let resumed = index - 1;
        let mut saved = resumed;
        if saved >= class.target {
            info!(
                "{}: already have {saved}/{} tables, nothing to fetch",
                class.name, class.target
            );
            return Ok(self.report(class, saved, resumed));
        }
        info!(
            "{}: resuming at {saved}/{} for {}",
            class.name, class.target, class.lineage
        );

        let started = Instant::now();
        let samples = mgnify::samples_url(&self.base_url, &class.lineage);
        let mut page_no = 0usize;
        'pages: for page in mgnify::pages(&self.client, &samples, self.limits.max_sample_pages) {
            if self.interrupted() {
                return Err(HarvestError::Interrupted);
            }
            if saved >= class.target {
                break 'pages;
            }
            if self.out_of_time(started) {
                info!("{}: time limit reached", class.name);
                break 'pages;
            }
            let page = match page {
                Ok(page) => page,
                Err(err) if err.is_branch_skip() => {
                    warn!("{}: sample page fetch failed: {err}", class.name);
                    break 'pages;
                }
                Err(err) => return Err(err),
            };
            page_no += 1;
            debug!("{}: page {page_no}, saved {saved}", class.name);

            for sample in &page.data {
                if self.interrupted() {
                    return Err(HarvestError::Interrupted);
                }
                if saved >= class.target {
                    break 'pages;
                }
                let Some(runs_url) = sample.related_link("runs") else {
                    continue;
                };
                let runs = match self.client.fetch_page(runs_url, &[]) {
                    Ok(page) => page,
                    Err(err) if err.is_branch_skip() => {
                        warn!("{}: runs fetch failed: {err}", class.name);
                        continue;
                    }
                    Err(err) => return Err(err),
                };

                for run in runs.data.iter().take(self.limits.max_runs_per_sample) {
                    if saved >= class.target {
                        break 'pages;
                    }
                    let Some(analyses_url) = run.related_link("analyses") else {
                        continue;
                    };
                    let analyses = match self.client.fetch_page(analyses_url, &[]) {
                        Ok(page) => page,
                        Err(err) if err.is_branch_skip() => {
                            warn!("{}: analyses fetch failed: {err}", class.name);
                            continue;
                        }
                        Err(err) => return Err(err),
                    };

                    for analysis in analyses.data.iter().take(self.limits.max_analyses_per_run) {
                        if saved >= class.target {
                            break 'pages;
                        }
                        let Some(downloads_url) = analysis.related_link("downloads") else {
                            continue;
                        };
                        let downloads = match self.client.fetch_page(downloads_url, &[]) {
                            Ok(page) => page,
                            Err(err) if err.is_branch_skip() => {
                                warn!("{}: downloads fetch failed: {err}", class.name);
                                continue;
                            }
                            Err(err) => return Err(err),
                        };
                        let candidates = catalog::select_candidates(&downloads);
                        let Some(candidate) = candidates.preferred() else {
                            continue;
                        };
                        if state.link_seen(&candidate.url) {
                            debug!("{}: already visited {}", class.name, candidate.url);
                            continue;
                        }
                        let outcome =
                            self.commit_candidate(class, &class_dir, candidate, index, &mut state)?;
                        if let Commit::Saved = outcome {
                            saved += 1;
                            index += 1;
                        }
                    }
                }
            }
        }

        let report = self.report(class, saved, resumed);
        if report.hit_target {
            info!("{}: done, {saved}/{} tables", class.name, class.target);
        } else {
            info!(
                "{}: stopping with {saved}/{} tables",
                class.name, class.target
            );
        }
        Ok(report)
    }

    /// Downloads the candidate into a staging file next to its final
    /// name, dedups by content signature, and renames into place.
    /// Branch-skippable failures mark the link seen and leave the
    /// index unconsumed.
    fn commit_candidate(
        &self,
        class: &BiomeClass,
        class_dir: &Utf8Path,
        candidate: &DownloadCandidate,
        index: usize,
        state: &mut HarvestState,
    ) -> Result<Commit, HarvestError> {
        let final_name = self.store.output_name(&class.name, index);
        let final_path = class_dir.join(&final_name);
        let staging = Utf8PathBuf::from(format!("{final_path}.tmp"));

        let staged = match candidate.kind {
            DownloadKind::BinaryTable => self.client.download(&candidate.url, &staging),
            DownloadKind::TextTable => {
                self.stage_text_table(class, candidate, index, class_dir, &staging)
            }
        };
        if let Err(err) = staged {
            remove_file_quietly(&staging);
            if !err.is_branch_skip() {
                return Err(err);
            }
            warn!("{}: {err}", class.name);
            state.record_link(&candidate.url);
            state::save_state(class_dir, state)?;
            return Ok(Commit::Skipped);
        }

        let sig = match signature::file_signature(&staging, &self.tool) {
            Ok(sig) => sig,
            Err(err) if err.is_branch_skip() => {
                // An unreadable table still commits; it only loses
                // content-level dedup.
                warn!("{}: no signature for {final_name}: {err}", class.name);
                None
            }
            Err(err) => {
                remove_file_quietly(&staging);
                return Err(err);
            }
        };
        if let Some(sig) = &sig {
            if let Some(existing) = state.known_signature(sig) {
                debug!(
                    "{}: {} duplicates {existing}, dropping",
                    class.name, candidate.alias
                );
                remove_file_quietly(&staging);
                state.record_link(&candidate.url);
                state::save_state(class_dir, state)?;
                return Ok(Commit::Skipped);
            }
        }

        fs::rename(staging.as_std_path(), final_path.as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        if let Some(sig) = sig {
            state.record_signature(sig, &final_name);
        }
        state.record_link(&candidate.url);
        state::save_state(class_dir, state)?;
        info!(
            "{}: saved {final_name} ({})",
            class.name, candidate.alias
        );
        Ok(Commit::Saved)
    }

    /// Text tables are fetched to a throwaway TSV and converted into
    /// the staging file. The TSV is removed whether or not conversion
    /// succeeds.
    fn stage_text_table(
        &self,
        class: &BiomeClass,
        candidate: &DownloadCandidate,
        index: usize,
        class_dir: &Utf8Path,
        staging: &Utf8Path,
    ) -> Result<(), HarvestError> {
        let tsv = class_dir.join(format!("__tmp_{}_{index}.tsv", class.name));
        let staged = self
            .client
            .download(&candidate.url, &tsv)
            .and_then(|_| convert::tsv_to_table_file(&self.tool, &tsv, staging));
        remove_file_quietly(&tsv);
        staged
    }

    fn report(&self, class: &BiomeClass, saved: usize, resumed: usize) -> ClassReport {
        ClassReport {
            class: class.name.as_str().to_string(),
            saved,
            added: saved - resumed,
            target: class.target,
            hit_target: saved >= class.target,
        }
    }

    fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::Relaxed)
    }

    fn out_of_time(&self, started: Instant) -> bool {
        match self.limits.class_time_limit {
            Some(limit) => started.elapsed() > limit,
            None => false,
        }
    }
}

fn remove_file_quietly(path: &Utf8Path) {
    if path.as_std_path().exists() {
        if let Err(err) = fs::remove_file(path.as_std_path()) {
            warn!("could not remove {path}: {err}");
        }
    }
}
