use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};
use serde_json::json;

use biom_harvester::biom;
use biom_harvester::catalog::Page;
use biom_harvester::config::HarvestLimits;
use biom_harvester::convert::BiomTool;
use biom_harvester::domain::BiomeClass;
use biom_harvester::error::HarvestError;
use biom_harvester::harvest::Harvester;
use biom_harvester::mgnify::{self, MgnifyClient};
use biom_harvester::state::{self, HarvestState, STATE_FILE};
use biom_harvester::store::OutputStore;

const BASE: &str = "https://mg.test/api";

struct NoTool;

impl BiomTool for NoTool {
    fn is_available(&self) -> bool {
        false
    }

    fn convert_tsv(&self, _tsv: &Utf8Path, _dest: &Utf8Path) -> Result<(), HarvestError> {
        Err(HarvestError::MissingTool("biom".to_string()))
    }

    fn to_json(&self, _table: &Utf8Path, _dest: &Utf8Path) -> Result<(), HarvestError> {
        Err(HarvestError::MissingTool("biom".to_string()))
    }
}

/// In-memory catalog; the handle stays with the test while the
/// harvester owns its clone.
#[derive(Clone)]
struct MockMgnify {
    pages: Arc<HashMap<String, Page>>,
    bodies: Arc<HashMap<String, Vec<u8>>>,
    fetches: Arc<Mutex<usize>>,
    downloads: Arc<Mutex<usize>>,
}

impl MockMgnify {
    fn fetches(&self) -> usize {
        *self.fetches.lock().unwrap()
    }

    fn downloads(&self) -> usize {
        *self.downloads.lock().unwrap()
    }
}

impl MgnifyClient for MockMgnify {
    fn fetch_page(&self, url: &str, _params: &[(&str, &str)]) -> Result<Page, HarvestError> {
        *self.fetches.lock().unwrap() += 1;
        self.pages
            .get(url)
            .cloned()
            .ok_or_else(|| HarvestError::ApiStatus {
                url: url.to_string(),
                status: 404,
            })
    }

    fn download(&self, url: &str, dest: &Utf8Path) -> Result<(), HarvestError> {
        *self.downloads.lock().unwrap() += 1;
        match self.bodies.get(url) {
            Some(body) => {
                std::fs::write(dest.as_std_path(), body)
                    .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
                Ok(())
            }
            None => Err(HarvestError::DownloadFailed(url.to_string())),
        }
    }
}

#[derive(Clone)]
enum Candidate {
    Biom(Option<Vec<u8>>),
    Tsv(Option<Vec<u8>>),
}

fn forest_class(target: usize) -> BiomeClass {
    BiomeClass::new(
        "forest".parse().unwrap(),
        "root:Environmental:Terrestrial:Soil:Forest soil"
            .parse()
            .unwrap(),
        target,
    )
}

fn table_body(seed: u32) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "rows": [{"id": "OTU_1", "metadata": null}],
        "columns": [{"id": "S1", "metadata": null}],
        "matrix_type": "dense",
        "shape": [1, 1],
        "data": [[seed]],
    }))
    .unwrap()
}

fn page_of(value: serde_json::Value) -> Page {
    serde_json::from_value(value).unwrap()
}

/// Wires one sample whose single run and analysis expose the given
/// download candidate, and returns the sample resource.
fn wire_chain(
    pages: &mut HashMap<String, Page>,
    bodies: &mut HashMap<String, Vec<u8>>,
    tag: &str,
    candidate: Candidate,
) -> serde_json::Value {
    let runs_url = format!("{BASE}/runs/{tag}");
    let analyses_url = format!("{BASE}/analyses/{tag}");
    let downloads_url = format!("{BASE}/downloads/{tag}");
    let (alias, file_url, body) = match candidate {
        Candidate::Biom(body) => (format!("{tag}.biom"), format!("{BASE}/files/{tag}.biom"), body),
        Candidate::Tsv(body) => (
            format!("{tag}_otu_table.tsv"),
            format!("{BASE}/files/{tag}.tsv"),
            body,
        ),
    };

    pages.insert(
        runs_url.clone(),
        page_of(json!({
            "data": [{"relationships": {"analyses": {"links": {"related": analyses_url.clone()}}}}]
        })),
    );
    pages.insert(
        analyses_url,
        page_of(json!({
            "data": [{"relationships": {"downloads": {"links": {"related": downloads_url.clone()}}}}]
        })),
    );
    pages.insert(
        downloads_url,
        page_of(json!({
            "data": [{"attributes": {"alias": alias}, "links": {"self": file_url.clone()}}]
        })),
    );
    if let Some(body) = body {
        bodies.insert(file_url, body);
    }
    json!({"relationships": {"runs": {"links": {"related": runs_url}}}})
}

fn mock_with_chains(class: &BiomeClass, chains: &[(&str, Candidate)]) -> MockMgnify {
    let mut pages = HashMap::new();
    let mut bodies = HashMap::new();
    let samples: Vec<_> = chains
        .iter()
        .map(|(tag, candidate)| wire_chain(&mut pages, &mut bodies, tag, candidate.clone()))
        .collect();
    pages.insert(
        mgnify::samples_url(BASE, &class.lineage),
        page_of(json!({"data": samples, "links": {"next": null}})),
    );
    MockMgnify {
        pages: Arc::new(pages),
        bodies: Arc::new(bodies),
        fetches: Arc::new(Mutex::new(0)),
        downloads: Arc::new(Mutex::new(0)),
    }
}

fn harvester_with(
    root: &Path,
    client: MockMgnify,
    limits: HarvestLimits,
) -> Harvester<MockMgnify, NoTool> {
    let store = OutputStore::new(Utf8PathBuf::from_path_buf(root.to_path_buf()).unwrap());
    Harvester::new(store, client, NoTool, limits, BASE.to_string())
}

fn harvester(root: &Path, client: MockMgnify) -> Harvester<MockMgnify, NoTool> {
    harvester_with(root, client, HarvestLimits::default())
}

fn forest_state(root: &Path) -> HarvestState {
    state::load_state(&Utf8PathBuf::from_path_buf(root.join("forest")).unwrap())
}

fn leftover_temps(root: &Path) -> Vec<String> {
    std::fs::read_dir(root.join("forest"))
        .unwrap()
        .map(|entry| entry.unwrap().file_name().into_string().unwrap())
        .filter(|name| name.ends_with(".tmp") || name.ends_with(".part") || name.ends_with(".tsv"))
        .collect()
}

#[test]
fn resume_at_target_makes_no_network_requests() {
    let dir = tempfile::tempdir().unwrap();
    let class = forest_class(2);
    let class_dir = dir.path().join("forest");
    std::fs::create_dir_all(&class_dir).unwrap();
    std::fs::write(class_dir.join("forest_1.biom"), table_body(1)).unwrap();
    std::fs::write(class_dir.join("forest_2.biom"), table_body(2)).unwrap();

    let client = mock_with_chains(&class, &[("s1", Candidate::Biom(Some(table_body(9))))]);
    let harvester = harvester(dir.path(), client.clone());

    let report = harvester.harvest_class(&class).unwrap();

    assert_eq!(report.saved, 2);
    assert_eq!(report.added, 0);
    assert!(report.hit_target);
    assert_eq!(client.fetches(), 0);
    assert_eq!(client.downloads(), 0);
    // signatures were still backfilled from the files on disk
    assert_eq!(forest_state(dir.path()).signature_to_name.len(), 2);
}

#[test]
fn harvest_saves_unique_tables_in_index_order() {
    let dir = tempfile::tempdir().unwrap();
    let class = forest_class(2);
    let client = mock_with_chains(
        &class,
        &[
            ("s1", Candidate::Biom(Some(table_body(1)))),
            ("s2", Candidate::Biom(Some(table_body(2)))),
            ("s3", Candidate::Biom(Some(table_body(3)))),
        ],
    );
    let harvester = harvester(dir.path(), client.clone());

    let report = harvester.harvest_class(&class).unwrap();

    assert_eq!(report.saved, 2);
    assert_eq!(report.added, 2);
    assert!(report.hit_target);
    assert!(dir.path().join("forest/forest_1.biom").exists());
    assert!(dir.path().join("forest/forest_2.biom").exists());
    assert!(!dir.path().join("forest/forest_3.biom").exists());
    // target was reached before the third candidate was touched
    assert_eq!(client.downloads(), 2);

    let state = forest_state(dir.path());
    assert_eq!(state.seen_links.len(), 2);
    assert_eq!(state.signature_to_name.len(), 2);
}

#[test]
fn duplicate_content_is_dropped_without_consuming_an_index() {
    let dir = tempfile::tempdir().unwrap();
    let class = forest_class(4);
    let client = mock_with_chains(
        &class,
        &[
            ("s1", Candidate::Biom(Some(table_body(1)))),
            ("s2", Candidate::Biom(Some(table_body(2)))),
            ("s3", Candidate::Biom(Some(table_body(3)))),
            // same content as s2, different URL
            ("s4", Candidate::Biom(Some(table_body(2)))),
        ],
    );
    let harvester = harvester(dir.path(), client.clone());

    let report = harvester.harvest_class(&class).unwrap();

    assert_eq!(report.saved, 3);
    assert!(!report.hit_target);
    for index in 1..=3 {
        assert!(
            dir.path()
                .join(format!("forest/forest_{index}.biom"))
                .exists()
        );
    }
    assert!(!dir.path().join("forest/forest_4.biom").exists());
    // the duplicate was downloaded, matched, and deleted
    assert_eq!(client.downloads(), 4);
    assert!(leftover_temps(dir.path()).is_empty());

    let state = forest_state(dir.path());
    assert_eq!(state.signature_to_name.len(), 3);
    assert_eq!(state.seen_links.len(), 4);
}

#[test]
fn seen_links_are_never_downloaded_again() {
    let dir = tempfile::tempdir().unwrap();
    let class = forest_class(1);
    let class_dir = Utf8PathBuf::from_path_buf(dir.path().join("forest")).unwrap();
    std::fs::create_dir_all(class_dir.as_std_path()).unwrap();
    let mut state = HarvestState::default();
    state.record_link(&format!("{BASE}/files/s1.biom"));
    state::save_state(&class_dir, &mut state).unwrap();

    let client = mock_with_chains(&class, &[("s1", Candidate::Biom(Some(table_body(1))))]);
    let harvester = harvester(dir.path(), client.clone());

    let report = harvester.harvest_class(&class).unwrap();

    assert_eq!(report.saved, 0);
    assert!(!report.hit_target);
    assert_eq!(client.downloads(), 0);
}

#[test]
fn failed_download_marks_the_link_seen() {
    let dir = tempfile::tempdir().unwrap();
    let class = forest_class(1);
    let client = mock_with_chains(&class, &[("s1", Candidate::Biom(None))]);
    let harvester = harvester(dir.path(), client.clone());

    let report = harvester.harvest_class(&class).unwrap();

    assert_eq!(report.saved, 0);
    assert_eq!(client.downloads(), 1);
    assert!(!dir.path().join("forest/forest_1.biom").exists());
    assert!(leftover_temps(dir.path()).is_empty());
    assert!(forest_state(dir.path()).link_seen(&format!("{BASE}/files/s1.biom")));
}

#[test]
fn tsv_fallback_converts_to_a_json_table() {
    let dir = tempfile::tempdir().unwrap();
    let class = forest_class(1);
    let tsv = b"# Constructed from biom file\n#OTU ID\tS1\tS2\nOTU_1\t3.0\t4.0\n".to_vec();
    let client = mock_with_chains(&class, &[("s1", Candidate::Tsv(Some(tsv)))]);
    let harvester = harvester(dir.path(), client.clone());

    let report = harvester.harvest_class(&class).unwrap();

    assert_eq!(report.saved, 1);
    assert!(report.hit_target);
    let table = biom::load_json(
        &Utf8PathBuf::from_path_buf(dir.path().join("forest/forest_1.biom")).unwrap(),
    )
    .unwrap();
    assert_eq!(table.shape(), (1, 2));
    assert_eq!(table.observation_ids, vec!["OTU_1".to_string()]);
    assert!(leftover_temps(dir.path()).is_empty());
}

#[test]
fn unconvertible_tsv_is_skipped_and_marked_seen() {
    let dir = tempfile::tempdir().unwrap();
    let class = forest_class(1);
    let client = mock_with_chains(
        &class,
        &[("s1", Candidate::Tsv(Some(b"this is not a table".to_vec())))],
    );
    let harvester = harvester(dir.path(), client.clone());

    let report = harvester.harvest_class(&class).unwrap();

    assert_eq!(report.saved, 0);
    assert!(leftover_temps(dir.path()).is_empty());
    assert!(forest_state(dir.path()).link_seen(&format!("{BASE}/files/s1.tsv")));
}

#[test]
fn corrupt_state_is_rebuilt_from_existing_files() {
    let dir = tempfile::tempdir().unwrap();
    let class = forest_class(5);
    let class_dir = dir.path().join("forest");
    std::fs::create_dir_all(&class_dir).unwrap();
    std::fs::write(class_dir.join("forest_1.biom"), table_body(1)).unwrap();
    std::fs::write(class_dir.join("forest_2.biom"), table_body(2)).unwrap();
    std::fs::write(class_dir.join(STATE_FILE), b"{ not json").unwrap();

    let client = mock_with_chains(&class, &[]);
    let harvester = harvester(dir.path(), client.clone());

    let report = harvester.harvest_class(&class).unwrap();

    assert_eq!(report.saved, 2);
    assert_eq!(report.added, 0);
    assert!(!report.hit_target);
    assert_eq!(forest_state(dir.path()).signature_to_name.len(), 2);
}

#[test]
fn preset_interrupt_flag_stops_the_run_before_any_class() {
    static FLAG: AtomicBool = AtomicBool::new(true);
    let dir = tempfile::tempdir().unwrap();
    let classes = [forest_class(1)];
    let client = mock_with_chains(&classes[0], &[("s1", Candidate::Biom(Some(table_body(1))))]);
    let harvester = harvester(dir.path(), client.clone()).with_interrupt(&FLAG);

    let summary = harvester.run(&classes);

    assert!(summary.interrupted);
    assert!(summary.reports.is_empty());
    assert_eq!(client.fetches(), 0);
    assert_eq!(summary.total_saved(), 0);
}

#[test]
fn interrupt_inside_a_class_propagates() {
    static FLAG: AtomicBool = AtomicBool::new(true);
    let dir = tempfile::tempdir().unwrap();
    let class = forest_class(1);
    let client = mock_with_chains(&class, &[("s1", Candidate::Biom(Some(table_body(1))))]);
    let harvester = harvester(dir.path(), client).with_interrupt(&FLAG);

    let err = harvester.harvest_class(&class).unwrap_err();

    assert_matches!(err, HarvestError::Interrupted);
}

#[test]
fn a_failing_class_does_not_stop_the_next_one() {
    let dir = tempfile::tempdir().unwrap();
    // a plain file where the bog class dir should go makes that class fail
    std::fs::write(dir.path().join("bog"), b"in the way").unwrap();
    let bog = BiomeClass::new(
        "bog".parse().unwrap(),
        "root:Environmental:Aquatic:Bog".parse().unwrap(),
        1,
    );
    let forest = forest_class(1);
    let client = mock_with_chains(&forest, &[("s1", Candidate::Biom(Some(table_body(1))))]);
    let harvester = harvester(dir.path(), client.clone());

    let summary = harvester.run(&[bog, forest]);

    assert!(!summary.interrupted);
    assert_eq!(summary.reports.len(), 1);
    assert_eq!(summary.reports[0].class, "forest");
    assert_eq!(summary.total_saved(), 1);
}

#[test]
fn elapsed_time_limit_ends_the_class_gracefully() {
    let dir = tempfile::tempdir().unwrap();
    let class = forest_class(1);
    let client = mock_with_chains(&class, &[("s1", Candidate::Biom(Some(table_body(1))))]);
    let limits = HarvestLimits {
        class_time_limit: Some(Duration::from_nanos(1)),
        ..HarvestLimits::default()
    };
    let harvester = harvester_with(dir.path(), client.clone(), limits);

    let report = harvester.harvest_class(&class).unwrap();

    assert_eq!(report.saved, 0);
    assert!(!report.hit_target);
    assert_eq!(client.downloads(), 0);
}
