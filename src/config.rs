use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

const DEFAULTS: &str = include_str!("../config/default.toml");
const LOCAL_FILE: &str = "addr_scraper";
const ENV_PREFIX: &str = "ADDR_SCRAPER";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub input: InputSettings,
    pub checkpoint: CheckpointSettings,
    pub pacing: PacingSettings,
    pub fetcher: FetcherSettings,
    pub audit: AuditSettings,
    pub search: SearchSettings,
    pub extract: ExtractSettings,
    pub report: ReportSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InputSettings {
    pub column: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckpointSettings {
    pub path: PathBuf,
    pub flush_every: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PacingSettings {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Spider,
    Browserless,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetcherSettings {
    pub backend: Backend,
    pub api_key_env: String,
    pub browserless_url: String,
    pub browserless_token_env: String,
    /// Extra wait after load so injected summary boxes can render.
    pub settle_ms: u64,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditSettings {
    pub enabled: bool,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchSettings {
    pub engine: String,
    pub engines: HashMap<String, EngineProfile>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Tiered,
    Structural,
}

/// Where to send a query and which live-page cascade reads the answer.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineProfile {
    pub url: String,
    pub query_param: String,
    pub qualifiers: String,
    pub strategy: StrategyKind,
    #[serde(default)]
    pub extra_params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractSettings {
    pub region: String,
    pub region_short: String,
    pub markers: Vec<String>,
    pub tiered: Vec<RuleSpec>,
    pub structural: Vec<RuleSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportSettings {
    pub title: String,
    pub head_chars: usize,
    pub primary: Vec<RuleSpec>,
    pub fallback: Vec<RuleSpec>,
    pub loose: Vec<RuleSpec>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeKind {
    Featured,
    #[default]
    Page,
    Entries,
}

/// One row of a cascade as written in configuration. Exactly one of
/// `label` / `pattern` must be set.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleSpec {
    pub tag: String,
    pub tier: u8,
    #[serde(default)]
    pub scope: ScopeKind,
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub stops: Vec<String>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub require: Vec<String>,
    #[serde(default)]
    pub require_marker: bool,
    /// Region prefix followed by 5 to 100 non-punctuation characters that
    /// include a structural marker.
    #[serde(default)]
    pub shape: bool,
    #[serde(default)]
    pub max_chars: Option<usize>,
}

impl Settings {
    /// Layer defaults, then `addr_scraper.toml` (or an explicit file), then env.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            Config::builder().add_source(File::from_str(DEFAULTS, FileFormat::Toml));

        builder = match path {
            Some(p) => builder.add_source(File::from(p).required(true)),
            None => builder.add_source(File::with_name(LOCAL_FILE).required(false)),
        };

        builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to assemble configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }

    #[cfg(test)]
    pub fn defaults() -> Self {
        Config::builder()
            .add_source(File::from_str(DEFAULTS, FileFormat::Toml))
            .build()
            .and_then(|c| c.try_deserialize())
            .unwrap()
    }

    pub fn engine(&self, name: Option<&str>) -> Result<(&str, &EngineProfile)> {
        let name = name.unwrap_or(&self.search.engine);
        self.search
            .engines
            .get_key_value(name)
            .map(|(k, v)| (k.as_str(), v))
            .with_context(|| {
                let mut known: Vec<_> = self.search.engines.keys().cloned().collect();
                known.sort();
                format!("Unknown search engine '{}' (known: {})", name, known.join(", "))
            })
    }
}

// ── Tests ──
