use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;

const CONFIG_PATH: &str = "data/config.yaml";
pub const MAX_PAGES_HARD_LIMIT: u32 = 50;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Minimum delay between requests to the classifieds site, shared by
    /// all concurrent runs.
    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,
    #[serde(default = "default_geocoder_endpoint")]
    pub geocoder_endpoint: String,
    #[serde(default = "default_geocode_delay_ms")]
    pub geocode_delay_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    /// Consecutive page-fetch failures that abort a run.
    #[serde(default = "default_fail_threshold")]
    pub fail_threshold: u32,
    #[serde(default = "default_tracing_level")]
    pub tracing_level: String,
}

fn default_db_path() -> String {
    "data/listings.db".to_string()
}

fn default_base_url() -> String {
    "https://www.kleinanzeigen.de".to_string()
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (compatible; kleinanzeigen-map/0.1)".to_string()
}

fn default_request_delay_ms() -> u64 {
    1000
}

fn default_geocoder_endpoint() -> String {
    "https://nominatim.openstreetmap.org/search".to_string()
}

fn default_geocode_delay_ms() -> u64 {
    1000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_max_pages() -> u32 {
    25
}

fn default_fail_threshold() -> u32 {
    3
}

fn default_tracing_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            base_url: default_base_url(),
            user_agent: default_user_agent(),
            request_delay_ms: default_request_delay_ms(),
            geocoder_endpoint: default_geocoder_endpoint(),
            geocode_delay_ms: default_geocode_delay_ms(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            max_pages: default_max_pages(),
            fail_threshold: default_fail_threshold(),
            tracing_level: default_tracing_level(),
        }
    }
}

impl Config {
    /// Loads `data/config.yaml` when present, otherwise starts from
    /// defaults; environment variables override either.
    pub fn load() -> Result<Self> {
        let mut config: Config = if let Ok(config_str) = fs::read_to_string(CONFIG_PATH) {
            serde_yaml::from_str(&config_str)
                .with_context(|| format!("failed to parse {}", CONFIG_PATH))?
        } else {
            Config::default()
        };

        if let Ok(db_path) = env::var("KAM_DB_PATH") {
            config.db_path = db_path;
        }
        if let Ok(base_url) = env::var("KAM_BASE_URL") {
            config.base_url = base_url;
        }
        if let Ok(user_agent) = env::var("KAM_USER_AGENT") {
            config.user_agent = user_agent;
        }
        if let Ok(delay) = env::var("KAM_REQUEST_DELAY_MS") {
            config.request_delay_ms = delay
                .parse()
                .context("Failed to parse KAM_REQUEST_DELAY_MS environment variable")?;
        }
        if let Ok(endpoint) = env::var("KAM_GEOCODER_ENDPOINT") {
            config.geocoder_endpoint = endpoint;
        }
        if let Ok(delay) = env::var("KAM_GEOCODE_DELAY_MS") {
            config.geocode_delay_ms = delay
                .parse()
                .context("Failed to parse KAM_GEOCODE_DELAY_MS environment variable")?;
        }
        if let Ok(retries) = env::var("KAM_MAX_RETRIES") {
            config.max_retries = retries
                .parse()
                .context("Failed to parse KAM_MAX_RETRIES environment variable")?;
        }
        if let Ok(delay) = env::var("KAM_RETRY_BASE_DELAY_MS") {
            config.retry_base_delay_ms = delay
                .parse()
                .context("Failed to parse KAM_RETRY_BASE_DELAY_MS environment variable")?;
        }
        if let Ok(pages) = env::var("KAM_MAX_PAGES") {
            config.max_pages = pages
                .parse()
                .context("Failed to parse KAM_MAX_PAGES environment variable")?;
        }
        if let Ok(threshold) = env::var("KAM_FAIL_THRESHOLD") {
            config.fail_threshold = threshold
                .parse()
                .context("Failed to parse KAM_FAIL_THRESHOLD environment variable")?;
        }
        if let Ok(level) = env::var("KAM_TRACING_LEVEL") {
            config.tracing_level = level;
        }

        config.max_pages = config.max_pages.clamp(1, MAX_PAGES_HARD_LIMIT);
        config.fail_threshold = config.fail_threshold.max(1);

        Ok(config)
    }

    pub fn create_default() -> Result<()> {
        fs::create_dir_all("data")?;
        let config_str = serde_yaml::to_string(&Config::default())?;
        fs::write(CONFIG_PATH, config_str)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_field() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.base_url, "https://www.kleinanzeigen.de");
        assert_eq!(config.request_delay_ms, 1000);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.fail_threshold, 3);
        assert_eq!(config.max_pages, 25);
    }

    #[test]
    fn partial_yaml_keeps_remaining_defaults() {
        let config: Config =
            serde_yaml::from_str("request_delay_ms: 250\ntracing_level: debug").unwrap();
        assert_eq!(config.request_delay_ms, 250);
        assert_eq!(config.tracing_level, "debug");
        assert_eq!(config.max_pages, 25);
    }

    #[test]
    fn default_config_serializes_round_trip() {
        let yaml = serde_yaml::to_string(&Config::default()).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.db_path, Config::default().db_path);
    }
}
