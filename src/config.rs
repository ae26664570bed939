// Configuration management module
// Handles loading, saving, and validating configuration

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Listening thresholds for the per-tab state machines
    #[serde(default)]
    pub tracking: TrackingConfig,

    /// Connector polling cadence
    #[serde(default)]
    pub sampler: SamplerConfig,

    /// Retry and deduplication policy for submissions
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Text cleanup configuration
    #[serde(default)]
    pub cleanup: CleanupConfig,

    /// Items that must never be tracked (ads, station jingles)
    #[serde(default)]
    pub filter: FilterConfig,

    /// Last.fm configuration
    pub lastfm: Option<LastFmConfig>,

    /// ListenBrainz configurations (can have multiple instances)
    #[serde(default)]
    pub listenbrainz: Vec<ListenBrainzConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Submit after playing this percentage of the track (50% default)
    pub submission_percent: u8,

    /// Upper bound on the listening time required, regardless of duration
    pub submission_cap_secs: u64,

    /// Items shorter than this are never submitted
    pub min_trackable_duration_secs: u64,

    /// Duration assumed when the connector cannot report one
    pub default_duration_secs: u64,

    /// Only accrue listening time on the tab the user activated last
    pub count_only_active_tab: bool,

    /// A backwards jump in position larger than this restarts the item as a replay
    pub replay_regression_secs: u64,

    /// Gaps between samples longer than this are not credited as listening time
    pub max_accrual_step_secs: u64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            submission_percent: 50,
            submission_cap_secs: 240,
            min_trackable_duration_secs: 30,
            default_duration_secs: 30,
            count_only_active_tab: true,
            replay_regression_secs: 10,
            max_accrual_step_secs: 60,
        }
    }
}

impl TrackingConfig {
    /// Listening time an item of `duration_secs` needs before it can be submitted
    ///
    /// Computed in floating point: odd durations keep their half second and
    /// absurd durations cannot overflow.
    pub fn submission_threshold_secs(&self, duration_secs: u64) -> f64 {
        let by_percent = duration_secs as f64 * f64::from(self.submission_percent) / 100.0;
        by_percent.min(self.submission_cap_secs as f64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Poll interval in milliseconds
    pub interval_ms: u64,

    /// Number of consecutive polls a new track must be reported before it is emitted
    pub debounce_polls: u32,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            debounce_polls: 2,
        }
    }
}

impl SamplerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Retries after the first attempt for transient failures
    pub retry_budget: u32,

    pub initial_backoff_ms: u64,

    pub max_backoff_ms: u64,

    /// How long a successful submission suppresses a repeat of the same listen
    pub dedup_window_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            retry_budget: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
            dedup_window_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Enable text cleanup
    pub enabled: bool,

    /// Regex patterns to remove from track/album/artist names
    /// Applied in order, each pattern is removed from the text
    pub patterns: Vec<String>,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            patterns: vec![
                r"\s*\[Explicit\]".to_string(),
                r"\s*\[Clean\]".to_string(),
                r"\s*\(Explicit\)".to_string(),
                r"\s*\(Clean\)".to_string(),
                r"\s*- Explicit".to_string(),
                r"\s*- Clean".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Case-insensitive substrings; a match in artist or track makes the sample ineligible
    pub denylist: Vec<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            denylist: vec![
                "Advertisement".to_string(),
                "Spotify Ad".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastFmConfig {
    pub enabled: bool,
    pub api_key: String,
    pub api_secret: String,
    pub session_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenBrainzConfig {
    pub enabled: bool,
    pub name: String,
    pub token: String,
    pub api_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tracking: TrackingConfig::default(),
            sampler: SamplerConfig::default(),
            dispatch: DispatchConfig::default(),
            cleanup: CleanupConfig::default(),
            filter: FilterConfig::default(),
            lastfm: Some(LastFmConfig {
                enabled: false,
                api_key: String::new(),
                api_secret: String::new(),
                session_key: String::new(),
            }),
            listenbrainz: vec![ListenBrainzConfig {
                enabled: false,
                name: "Primary".to_string(),
                token: String::new(),
                api_url: "https://api.listenbrainz.org".to_string(),
            }],
        }
    }
}

impl Config {
    /// Get the path to the configuration file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?;

        Ok(config_dir.join("tab_scrobbler.conf"))
    }

    /// Load configuration from the default location, creating it if it doesn't exist
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from `path`, or create a default file there
    pub fn load_from(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            log::info!("Config file not found, creating default at {:?}", config_path);
            let default_config = Self::default();
            default_config.save_to(config_path)?;
            return Ok(default_config);
        }

        let content = fs::read_to_string(config_path)
            .context("Failed to read config file")?;

        let config: Config = toml::from_str(&content)
            .context("Failed to parse config file")?;

        config.validate()?;

        Ok(config)
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)
                .context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        fs::write(config_path, content)
            .context("Failed to write config file")?;

        log::info!("Config saved to {:?}", config_path);

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.sampler.interval_ms == 0 {
            anyhow::bail!("sampler.interval_ms must be greater than 0");
        }

        // Threshold is a percentage of the track (1-100%)
        let percent = self.tracking.submission_percent;
        if percent == 0 || percent > 100 {
            anyhow::bail!("tracking.submission_percent must be between 1 and 100");
        }

        if self.tracking.submission_cap_secs == 0 {
            anyhow::bail!("tracking.submission_cap_secs must be greater than 0");
        }

        if self.dispatch.initial_backoff_ms > self.dispatch.max_backoff_ms {
            anyhow::bail!("dispatch.initial_backoff_ms must not exceed dispatch.max_backoff_ms");
        }

        // Check that at least one scrobbler is enabled
        let lastfm_enabled = self.lastfm.as_ref().map(|l| l.enabled).unwrap_or(false);
        let listenbrainz_enabled = self.listenbrainz.iter().any(|l| l.enabled);

        if !lastfm_enabled && !listenbrainz_enabled {
            log::warn!("No scrobbling services are enabled");
        }

        // Validate Last.fm config if enabled
        if let Some(lastfm) = &self.lastfm {
            if lastfm.enabled {
                if lastfm.api_key.is_empty() {
                    anyhow::bail!("Last.fm api_key is required when Last.fm is enabled");
                }
                if lastfm.api_secret.is_empty() {
                    anyhow::bail!("Last.fm api_secret is required when Last.fm is enabled");
                }
            }
        }

        // Validate ListenBrainz configs if enabled
        for lb in &self.listenbrainz {
            if lb.enabled {
                if lb.token.is_empty() {
                    anyhow::bail!("ListenBrainz token is required when enabled (instance: {})", lb.name);
                }
                if lb.api_url.is_empty() {
                    anyhow::bail!("ListenBrainz api_url is required (instance: {})", lb.name);
                }
            }
        }

        let mut names: Vec<&str> = self.listenbrainz.iter().map(|lb| lb.name.as_str()).collect();
        names.sort_unstable();
        if names.windows(2).any(|pair| pair[0] == pair[1]) {
            anyhow::bail!("ListenBrainz instance names must be unique");
        }

        Ok(())
    }
}
