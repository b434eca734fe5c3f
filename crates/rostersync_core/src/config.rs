use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use reqwest::Url;
use serde::{Deserialize, Serialize};

pub const DEFAULT_USER_AGENT: &str = "rostersync/0.1";
pub const DEFAULT_TIMEOUT_MS: u64 = 20_000;
pub const DEFAULT_MIN_DELAY_MS: u64 = 750;
pub const DEFAULT_MAX_BYTES: usize = 4_000_000;
pub const DEFAULT_SOURCE_NAME: &str = "default";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct RosterConfig {
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub http: HttpSection,
    #[serde(default)]
    pub run: RunSection,
    #[serde(default)]
    pub defaults: SourceSection,
    #[serde(default)]
    pub sources: Vec<SourceSection>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct StoreSection {
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct HttpSection {
    pub user_agent: Option<String>,
    pub timeout_ms: Option<u64>,
    pub min_delay_ms: Option<u64>,
    pub max_bytes: Option<usize>,
}

impl HttpSection {
    /// env ROSTERSYNC_USER_AGENT > config > DEFAULT_USER_AGENT.
    pub fn user_agent(&self) -> String {
        if let Some(value) = env_trimmed("ROSTERSYNC_USER_AGENT") {
            return value;
        }
        self.user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    pub fn timeout_ms(&self) -> u64 {
        env_u64("ROSTERSYNC_HTTP_TIMEOUT_MS")
            .or(self.timeout_ms)
            .unwrap_or(DEFAULT_TIMEOUT_MS)
    }

    pub fn min_delay_ms(&self) -> u64 {
        env_u64("ROSTERSYNC_MIN_DELAY_MS")
            .or(self.min_delay_ms)
            .unwrap_or(DEFAULT_MIN_DELAY_MS)
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes.unwrap_or(DEFAULT_MAX_BYTES)
    }
}

/// Whether unmatched roster entries become new athletes.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    #[default]
    UpdateOnly,
    UpdateAndInsert,
}

impl RunMode {
    pub fn parse(value: &str) -> Result<Self> {
        let normalized = value.trim().to_ascii_lowercase().replace('_', "-");
        match normalized.as_str() {
            "update-only" | "update" => Ok(Self::UpdateOnly),
            "update-and-insert" | "insert" | "upsert" => Ok(Self::UpdateAndInsert),
            _ => bail!("unsupported run mode: {value} (expected update-only|update-and-insert)"),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::UpdateOnly => "update-only",
            Self::UpdateAndInsert => "update-and-insert",
        }
    }

    pub fn allows_insert(self) -> bool {
        self == Self::UpdateAndInsert
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct RunSection {
    pub mode: Option<RunMode>,
    #[serde(default)]
    pub teams: Vec<String>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub keep_existing_photo_on_fallback: bool,
}

impl RunSection {
    /// env ROSTERSYNC_RUN_MODE > config > update-only.
    pub fn mode(&self) -> Result<RunMode> {
        if let Some(value) = env_trimmed("ROSTERSYNC_RUN_MODE") {
            return RunMode::parse(&value);
        }
        Ok(self.mode.unwrap_or_default())
    }
}

/// Per-site overrides. Every field is optional; unset fields inherit from
/// `[defaults]` and then from the built-in profile.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct SourceSection {
    pub name: Option<String>,
    #[serde(default)]
    pub hosts: Vec<String>,
    pub profile_path_markers: Option<Vec<String>>,
    pub ignored_anchor_texts: Option<Vec<String>>,
    pub include: Option<Vec<String>>,
    pub exclude: Option<Vec<String>>,
    pub min_width: Option<u32>,
    pub min_height: Option<u32>,
    pub min_ratio: Option<f64>,
    pub max_ratio: Option<f64>,
    pub ideal_ratio: Option<f64>,
    pub tie_tolerance: Option<f64>,
    pub proxy_markers: Option<Vec<String>>,
    pub proxy_query_params: Option<Vec<String>>,
    pub trusted_origins: Option<Vec<String>>,
    pub dimension_params: Option<Vec<String>>,
    pub quality_floor: Option<u32>,
    pub quality_params: Option<Vec<String>>,
    pub quality_target: Option<u32>,
    pub protected_markers: Option<Vec<String>>,
}

impl SourceSection {
    pub fn matches_host(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.hosts.iter().any(|candidate| {
            let candidate = candidate.trim().to_ascii_lowercase();
            !candidate.is_empty()
                && (host == candidate || host.ends_with(&format!(".{candidate}")))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RosterRules {
    pub profile_path_markers: Vec<String>,
    pub ignored_anchor_texts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractionRules {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub min_width: u32,
    pub min_height: u32,
    pub min_ratio: f64,
    pub max_ratio: f64,
    pub ideal_ratio: f64,
    pub tie_tolerance: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolverRules {
    pub proxy_markers: Vec<String>,
    pub proxy_query_params: Vec<String>,
    pub trusted_origins: Vec<String>,
    pub dimension_params: Vec<String>,
    pub quality_floor: u32,
    pub quality_params: Vec<String>,
    pub quality_target: u32,
    pub protected_markers: Vec<String>,
}

/// Fully resolved settings for one source site.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceProfile {
    pub name: String,
    pub roster: RosterRules,
    pub extraction: ExtractionRules,
    pub resolver: ResolverRules,
}

impl Default for RosterRules {
    fn default() -> Self {
        Self {
            profile_path_markers: strings(&["/roster/"]),
            ignored_anchor_texts: strings(&[
                "bio",
                "full bio",
                "view bio",
                "view profile",
                "profile",
                "roster",
                "more",
            ]),
        }
    }
}

impl Default for ExtractionRules {
    fn default() -> Self {
        Self {
            include: Vec::new(),
            exclude: strings(&[
                "logo",
                "sponsor",
                "footer",
                "icon",
                "favicon",
                "placeholder",
                ".svg",
            ]),
            min_width: 80,
            min_height: 80,
            min_ratio: 0.4,
            max_ratio: 1.1,
            ideal_ratio: 0.66,
            tie_tolerance: 0.1,
        }
    }
}

impl Default for ResolverRules {
    fn default() -> Self {
        Self {
            proxy_markers: strings(&["imgproxy"]),
            proxy_query_params: strings(&["url", "image"]),
            trusted_origins: Vec::new(),
            dimension_params: strings(&["width", "height", "w", "h"]),
            quality_floor: 1920,
            quality_params: strings(&["quality", "q"]),
            quality_target: 100,
            protected_markers: strings(&["/storage/", "logo"]),
        }
    }
}

impl Default for SourceProfile {
    fn default() -> Self {
        Self {
            name: DEFAULT_SOURCE_NAME.to_string(),
            roster: RosterRules::default(),
            extraction: ExtractionRules::default(),
            resolver: ResolverRules::default(),
        }
    }
}

impl SourceProfile {
    fn apply(&mut self, section: &SourceSection) {
        if let Some(name) = &section.name {
            self.name = name.clone();
        }
        overlay(&mut self.roster.profile_path_markers, &section.profile_path_markers);
        overlay(&mut self.roster.ignored_anchor_texts, &section.ignored_anchor_texts);

        let extraction = &mut self.extraction;
        overlay(&mut extraction.include, &section.include);
        overlay(&mut extraction.exclude, &section.exclude);
        overlay(&mut extraction.min_width, &section.min_width);
        overlay(&mut extraction.min_height, &section.min_height);
        overlay(&mut extraction.min_ratio, &section.min_ratio);
        overlay(&mut extraction.max_ratio, &section.max_ratio);
        overlay(&mut extraction.ideal_ratio, &section.ideal_ratio);
        overlay(&mut extraction.tie_tolerance, &section.tie_tolerance);

        let resolver = &mut self.resolver;
        overlay(&mut resolver.proxy_markers, &section.proxy_markers);
        overlay(&mut resolver.proxy_query_params, &section.proxy_query_params);
        overlay(&mut resolver.trusted_origins, &section.trusted_origins);
        overlay(&mut resolver.dimension_params, &section.dimension_params);
        overlay(&mut resolver.quality_floor, &section.quality_floor);
        overlay(&mut resolver.quality_params, &section.quality_params);
        overlay(&mut resolver.quality_target, &section.quality_target);
        overlay(&mut resolver.protected_markers, &section.protected_markers);
    }
}

impl RosterConfig {
    /// Profile for the source whose hosts cover `address`, falling back to
    /// `[defaults]` alone.
    pub fn profile_for_address(&self, address: &str) -> SourceProfile {
        let host = Url::parse(address)
            .ok()
            .and_then(|url| url.host_str().map(ToString::to_string))
            .unwrap_or_default();
        let section = self
            .sources
            .iter()
            .find(|source| !host.is_empty() && source.matches_host(&host));
        self.build_profile(section)
    }

    pub fn profile_named(&self, name: &str) -> Result<SourceProfile> {
        if name.eq_ignore_ascii_case(DEFAULT_SOURCE_NAME) {
            return Ok(self.build_profile(None));
        }
        let section = self
            .sources
            .iter()
            .find(|source| {
                source
                    .name
                    .as_deref()
                    .is_some_and(|value| value.eq_ignore_ascii_case(name))
            })
            .ok_or_else(|| anyhow::anyhow!("no [[sources]] entry named {name}"))?;
        Ok(self.build_profile(Some(section)))
    }

    fn build_profile(&self, section: Option<&SourceSection>) -> SourceProfile {
        let mut profile = SourceProfile::default();
        profile.apply(&self.defaults);
        if let Some(section) = section {
            profile.apply(section);
        }
        profile
    }

    pub fn validate(&self) -> Result<()> {
        for (index, section) in std::iter::once(&self.defaults)
            .chain(self.sources.iter())
            .enumerate()
        {
            let label = section
                .name
                .clone()
                .unwrap_or_else(|| format!("sources[{index}]"));
            let profile = self.build_profile(Some(section));
            let rules = &profile.extraction;
            if rules.min_ratio <= 0.0 || rules.min_ratio > rules.max_ratio {
                bail!(
                    "{label}: ratio band [{}, {}] is invalid",
                    rules.min_ratio,
                    rules.max_ratio
                );
            }
            if rules.tie_tolerance < 0.0 {
                bail!("{label}: tie_tolerance must not be negative");
            }
            if profile.resolver.quality_floor == 0 {
                bail!("{label}: quality_floor must be positive");
            }
        }
        Ok(())
    }
}

/// Load and parse a RosterConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<RosterConfig> {
    if !config_path.exists() {
        return Ok(RosterConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: RosterConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    parsed
        .validate()
        .with_context(|| format!("invalid configuration in {}", config_path.display()))?;
    Ok(parsed)
}

pub fn default_config_toml() -> &'static str {
    r#"# rostersync configuration

[store]
# path = ".rostersync/roster.db"

[http]
user_agent = "rostersync/0.1"
timeout_ms = 20000
min_delay_ms = 750

[run]
# update-only | update-and-insert
mode = "update-only"
# Team ids to reconcile; empty means every team in the store.
teams = []
dry_run = false
keep_existing_photo_on_fallback = false

[defaults]
profile_path_markers = ["/roster/"]
exclude = ["logo", "sponsor", "footer", "icon", "favicon", "placeholder", ".svg"]
min_width = 80
min_height = 80
min_ratio = 0.4
max_ratio = 1.1
ideal_ratio = 0.66
tie_tolerance = 0.1
quality_floor = 1920

# [[sources]]
# name = "sidearm"
# hosts = ["gohuskies.com"]
# include = ["/images/", "sidearmdev.com"]
# proxy_markers = ["imgproxy"]
# trusted_origins = ["storage.googleapis.com", "sidearmdev.com"]
"#
}

fn overlay<T: Clone>(target: &mut T, value: &Option<T>) {
    if let Some(value) = value {
        *target = value.clone();
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| (*value).to_string()).collect()
}

fn env_trimmed(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_u64(key: &str) -> Option<u64> {
    env_trimmed(key).and_then(|value| value.parse::<u64>().ok())
}
