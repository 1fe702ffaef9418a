use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;

use crate::error::{Error, Result};

pub const ENV_TOKEN: &str = "CONTRIBREPORT_TOKEN";
pub const ENV_BASE_URL: &str = "CONTRIBREPORT_BASE_URL";

/// Keys accepted by `config set`.
pub const KNOWN_KEYS: &[&str] = &[
    "base_url",
    "token",
    "page_size",
    "request_delay_ms",
    "request_timeout_secs",
    "cache_ttl_secs",
    "cache_capacity",
];

const MIN_REQUEST_DELAY_MS: u64 = 50;
const MAX_REQUEST_DELAY_MS: u64 = 5_000;
const MAX_PAGE_SIZE: u32 = 1_000;

/// Effective settings for one process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Config {
    pub base_url: String,
    #[serde(skip_serializing)]
    pub token: Option<String>,
    pub page_size: u32,
    /// Fixed pause between successive upstream calls.
    pub request_delay_ms: u64,
    pub request_timeout_secs: u64,
    pub cache_ttl_secs: u64,
    pub cache_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api/".to_string(),
            token: None,
            page_size: 50,
            request_delay_ms: 250,
            request_timeout_secs: 30,
            cache_ttl_secs: 300,
            cache_capacity: 256,
        }
    }
}

impl Config {
    /// Defaults, then the config file, then the environment.
    pub fn load(store: &ConfigStore) -> Result<Self> {
        let mut config = Self::default();
        config.apply(&store.values)?;
        config.apply_env();
        Ok(config)
    }

    fn apply(&mut self, values: &BTreeMap<String, String>) -> Result<()> {
        for (key, value) in values {
            match key.as_str() {
                "base_url" => self.base_url = value.clone(),
                "token" => self.token = Some(value.clone()).filter(|t| !t.trim().is_empty()),
                "page_size" => self.page_size = parse_number(key, value)?,
                "request_delay_ms" => self.request_delay_ms = parse_number(key, value)?,
                "request_timeout_secs" => self.request_timeout_secs = parse_number(key, value)?,
                "cache_ttl_secs" => self.cache_ttl_secs = parse_number(key, value)?,
                "cache_capacity" => self.cache_capacity = parse_number(key, value)?,
                other => log::warn!("Ignoring unknown config key: {other}"),
            }
        }
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(Error::Config(format!(
                "page_size must be between 1 and {MAX_PAGE_SIZE}, got {}",
                self.page_size
            )));
        }
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(token) = std::env::var(ENV_TOKEN) {
            if !token.trim().is_empty() {
                self.token = Some(token);
            }
        }
        if let Ok(url) = std::env::var(ENV_BASE_URL) {
            if !url.trim().is_empty() {
                self.base_url = url;
            }
        }
    }

    /// Override the page size, as with the `--page-size` flag.
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        self
    }

    /// Pacing delay, always bounded and never zero.
    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(
            self.request_delay_ms
                .clamp(MIN_REQUEST_DELAY_MS, MAX_REQUEST_DELAY_MS),
        )
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{key} must be a number, got '{value}'")))
}

/// Flat string key/value settings persisted as JSON.
#[derive(Debug, Clone, Default)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    values: BTreeMap<String, String>,
}

impl ConfigStore {
    /// Default location: `~/.contribreport/config.json`.
    pub fn default_path() -> Result<PathBuf> {
        Ok(dirs::home_dir()
            .ok_or_else(|| Error::Config("cannot determine home directory".into()))?
            .join(".contribreport")
            .join("config.json"))
    }

    /// Open the store at the default path.
    pub fn open() -> Result<Self> {
        Self::open_at(Self::default_path()?)
    }

    /// Open the store at the given path. A missing file is an empty store.
    pub fn open_at(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let values = match std::fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => BTreeMap::new(),
            Ok(text) => serde_json::from_str(&text)
                .map_err(|e| Error::Config(format!("invalid config file {}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: Some(path),
            values,
        })
    }

    /// A store that is never written to disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        if !KNOWN_KEYS.contains(&key) {
            return Err(Error::Config(format!(
                "unknown config key '{key}' (known: {})",
                KNOWN_KEYS.join(", ")
            )));
        }
        let mut candidate = self.values.clone();
        candidate.insert(key.to_string(), value.to_string());
        Config::default().apply(&candidate)?;
        self.values = candidate;
        self.save()
    }

    pub fn list(&self) -> Vec<(String, String)> {
        self.values
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&self.values)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = Config::default();
        assert_eq!(c.page_size, 50);
        assert_eq!(c.request_delay(), Duration::from_millis(250));
    }

    #[test]
    fn test_request_delay_is_bounded() {
        let mut c = Config::default();
        c.request_delay_ms = 0;
        assert_eq!(c.request_delay(), Duration::from_millis(MIN_REQUEST_DELAY_MS));
        c.request_delay_ms = 60_000;
        assert_eq!(c.request_delay(), Duration::from_millis(MAX_REQUEST_DELAY_MS));
    }

    #[test]
    fn test_store_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut store = ConfigStore::open_at(&path).unwrap();
        store.set("page_size", "100").unwrap();
        store.set("base_url", "https://example.test/api").unwrap();

        let reopened = ConfigStore::open_at(&path).unwrap();
        assert_eq!(reopened.get("page_size"), Some("100"));
        let config = Config::load(&reopened).unwrap();
        assert_eq!(config.page_size, 100);
        assert_eq!(reopened.list().len(), 2);
    }

    #[test]
    fn test_set_rejects_unknown_and_malformed() {
        let mut store = ConfigStore::in_memory();
        assert!(store.set("colour", "blue").is_err());
        assert!(store.set("page_size", "lots").is_err());
        assert!(store.set("page_size", "0").is_err());
        assert_eq!(store.get("page_size"), None);
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(ConfigStore::open_at(&path), Err(Error::Config(_))));
    }
}
