use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::domain::BiomeClass;
use crate::error::HarvestError;
use crate::mgnify::{HttpOptions, MGNIFY_BASE_URL};

pub const DEFAULT_OUT_DIR: &str = "biom_data";
pub const DEFAULT_TARGET_PER_CLASS: usize = 100;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub out_dir: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub target_per_class: Option<usize>,
    #[serde(default)]
    pub classes: Vec<ClassEntry>,
    #[serde(default)]
    pub limits: LimitsEntry,
    #[serde(default)]
    pub http: HttpEntry,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ClassEntry {
    pub name: String,
    pub lineage: String,
    #[serde(default)]
    pub target: Option<usize>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct LimitsEntry {
    #[serde(default)]
    pub max_sample_pages: Option<usize>,
    #[serde(default)]
    pub max_runs_per_sample: Option<usize>,
    #[serde(default)]
    pub max_analyses_per_run: Option<usize>,
    /// 0 disables the per-class time limit.
    #[serde(default)]
    pub class_time_limit_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct HttpEntry {
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub rate_limit_backoff_secs: Option<u64>,
    #[serde(default)]
    pub retry_backoff_secs: Option<u64>,
    #[serde(default)]
    pub pace_ms: Option<u64>,
}

/// Walk fan-out caps, applied per class.
#[derive(Debug, Clone)]
pub struct HarvestLimits {
    pub max_sample_pages: usize,
    pub max_runs_per_sample: usize,
    pub max_analyses_per_run: usize,
    pub class_time_limit: Option<Duration>,
}

impl Default for HarvestLimits {
    fn default() -> Self {
        Self {
            max_sample_pages: 120,
            max_runs_per_sample: 12,
            max_analyses_per_run: 12,
            class_time_limit: Some(Duration::from_secs(12_000)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub out_dir: Utf8PathBuf,
    pub base_url: String,
    pub target_per_class: usize,
    pub classes: Vec<BiomeClass>,
    pub limits: HarvestLimits,
    pub http: HttpOptions,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, HarvestError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from("biom-harvest.json"),
        };

        if path.is_none() && !config_path.exists() {
            return Err(HarvestError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| HarvestError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| HarvestError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, HarvestError> {
        let out_dir =
            Utf8PathBuf::from(config.out_dir.unwrap_or_else(|| DEFAULT_OUT_DIR.to_string()));
        let base_url = config
            .base_url
            .unwrap_or_else(|| MGNIFY_BASE_URL.to_string());
        let target_per_class = config.target_per_class.unwrap_or(DEFAULT_TARGET_PER_CLASS);

        let classes = config
            .classes
            .into_iter()
            .map(|entry| {
                Ok(BiomeClass::new(
                    entry.name.parse()?,
                    entry.lineage.parse()?,
                    entry.target.unwrap_or(target_per_class),
                ))
            })
            .collect::<Result<Vec<_>, HarvestError>>()?;

        let limit_defaults = HarvestLimits::default();
        let class_time_limit = match config.limits.class_time_limit_secs {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => limit_defaults.class_time_limit,
        };
        let limits = HarvestLimits {
            max_sample_pages: config
                .limits
                .max_sample_pages
                .unwrap_or(limit_defaults.max_sample_pages),
            max_runs_per_sample: config
                .limits
                .max_runs_per_sample
                .unwrap_or(limit_defaults.max_runs_per_sample),
            max_analyses_per_run: config
                .limits
                .max_analyses_per_run
                .unwrap_or(limit_defaults.max_analyses_per_run),
            class_time_limit,
        };

        let http_defaults = HttpOptions::default();
        let http = HttpOptions {
            timeout: config
                .http
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(http_defaults.timeout),
            retries: config.http.retries.unwrap_or(http_defaults.retries),
            rate_limit_backoff: config
                .http
                .rate_limit_backoff_secs
                .map(Duration::from_secs)
                .unwrap_or(http_defaults.rate_limit_backoff),
            retry_backoff: config
                .http
                .retry_backoff_secs
                .map(Duration::from_secs)
                .unwrap_or(http_defaults.retry_backoff),
            pace: config
                .http
                .pace_ms
                .map(Duration::from_millis)
                .unwrap_or(http_defaults.pace),
            user_agent: http_defaults.user_agent,
        };

        Ok(ResolvedConfig {
            out_dir,
            base_url,
            target_per_class,
            classes,
            limits,
            http,
        })
    }
}
