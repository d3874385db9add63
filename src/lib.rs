//! Resumable, deduplicating harvester of BIOM sample tables from the
//! MGnify metagenomics catalog. The walk Biome -> Sample -> Run ->
//! Analysis -> Download is bounded by per-class limits; downloaded
//! tables are dedup'd by URL and by content signature, with per-class
//! progress kept in a JSON sidecar so interrupted runs resume.

pub mod biom;
pub mod catalog;
pub mod config;
pub mod convert;
pub mod domain;
pub mod error;
pub mod harvest;
pub mod mgnify;
pub mod shutdown;
pub mod signature;
pub mod state;
pub mod store;
