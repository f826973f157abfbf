use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_API_URL: &str = "https://oldschool.runescape.wiki/api.php";
pub const DEFAULT_USER_AGENT: &str = "skill-unlocks/0.2 (level up table reader)";
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_RATE_LIMIT_MS: u64 = 1_000;
pub const DEFAULT_MAX_RETRIES: usize = 2;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 500;
pub const DEFAULT_CACHE_EXPIRY_HOURS: u32 = 24;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct AppConfig {
    #[serde(default)]
    pub wiki: WikiSection,
    #[serde(default)]
    pub http: HttpSection,
    #[serde(default)]
    pub cache: CacheSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct WikiSection {
    pub api_url: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct HttpSection {
    pub timeout_ms: Option<u64>,
    pub rate_limit_ms: Option<u64>,
    pub max_retries: Option<usize>,
    pub retry_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct CacheSection {
    pub refresh_on_startup: Option<bool>,
    pub expiry_hours: Option<u32>,
}

/// Effective settings after applying env > config file > built-in defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSettings {
    pub api_url: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub rate_limit_ms: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
    pub refresh_on_startup: bool,
    pub cache_expiry_hours: u32,
}

impl Default for ResolvedSettings {
    fn default() -> Self {
        AppConfig::default().resolve_with_lookup(|_| None)
    }
}

impl AppConfig {
    pub fn resolve(&self) -> ResolvedSettings {
        self.resolve_with_lookup(|key| env::var(key).ok())
    }

    pub fn resolve_with_lookup<F>(&self, lookup_env: F) -> ResolvedSettings
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str| {
            lookup_env(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let number = |key: &str| text(key).and_then(|value| parse_trimmed(&value));

        ResolvedSettings {
            api_url: text("WIKI_API_URL")
                .or_else(|| self.wiki.api_url.clone())
                .unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            user_agent: text("WIKI_USER_AGENT")
                .or_else(|| self.wiki.user_agent.clone())
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            timeout_ms: number("WIKI_HTTP_TIMEOUT_MS")
                .or(self.http.timeout_ms)
                .unwrap_or(DEFAULT_TIMEOUT_MS),
            rate_limit_ms: number("WIKI_RATE_LIMIT_MS")
                .or(self.http.rate_limit_ms)
                .unwrap_or(DEFAULT_RATE_LIMIT_MS),
            max_retries: text("WIKI_HTTP_RETRIES")
                .and_then(|value| parse_trimmed(&value))
                .or(self.http.max_retries)
                .unwrap_or(DEFAULT_MAX_RETRIES),
            retry_delay_ms: number("WIKI_HTTP_RETRY_DELAY_MS")
                .or(self.http.retry_delay_ms)
                .unwrap_or(DEFAULT_RETRY_DELAY_MS),
            refresh_on_startup: self.cache.refresh_on_startup.unwrap_or(false),
            cache_expiry_hours: self
                .cache
                .expiry_hours
                .unwrap_or(DEFAULT_CACHE_EXPIRY_HOURS),
        }
    }
}

/// Load and parse an AppConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<AppConfig> {
    if !config_path.exists() {
        return Ok(AppConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: AppConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

/// Writes a config file populated with the built-in defaults.
/// Returns `true` when a write occurred.
pub fn write_default_config(config_path: &Path, force: bool) -> Result<bool> {
    if config_path.exists() && !force {
        return Ok(false);
    }

    let defaults = AppConfig {
        wiki: WikiSection {
            api_url: Some(DEFAULT_API_URL.to_string()),
            user_agent: Some(DEFAULT_USER_AGENT.to_string()),
        },
        http: HttpSection {
            timeout_ms: Some(DEFAULT_TIMEOUT_MS),
            rate_limit_ms: Some(DEFAULT_RATE_LIMIT_MS),
            max_retries: Some(DEFAULT_MAX_RETRIES),
            retry_delay_ms: Some(DEFAULT_RETRY_DELAY_MS),
        },
        cache: CacheSection {
            refresh_on_startup: Some(false),
            expiry_hours: Some(DEFAULT_CACHE_EXPIRY_HOURS),
        },
    };

    let parent = config_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("config path has no parent: {}", config_path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    let rendered = toml::to_string_pretty(&defaults).context("failed to serialize config TOML")?;
    fs::write(config_path, rendered)
        .with_context(|| format!("failed to write {}", config_path.display()))?;
    Ok(true)
}

fn parse_trimmed<T: FromStr>(value: &str) -> Option<T> {
    value.trim().parse::<T>().ok()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use tempfile::tempdir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn default_config_resolves_to_builtin_values() {
        let settings = AppConfig::default().resolve_with_lookup(no_env);
        assert_eq!(settings.api_url, DEFAULT_API_URL);
        assert_eq!(settings.user_agent, DEFAULT_USER_AGENT);
        assert_eq!(settings.rate_limit_ms, 1_000);
        assert_eq!(settings.timeout_ms, 30_000);
        assert_eq!(settings.cache_expiry_hours, 24);
        assert!(!settings.refresh_on_startup);
        assert_eq!(settings, ResolvedSettings::default());
    }

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/config.toml")).expect("load config");
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn load_config_parses_all_sections() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(
            &config_path,
            r#"
[wiki]
api_url = "https://wiki.example.org/api.php"
user_agent = "test-agent/1.0"

[http]
rate_limit_ms = 2500
max_retries = 0

[cache]
refresh_on_startup = true
expiry_hours = 6
"#,
        )
        .expect("write config");

        let settings = load_config(&config_path)
            .expect("load config")
            .resolve_with_lookup(no_env);
        assert_eq!(settings.api_url, "https://wiki.example.org/api.php");
        assert_eq!(settings.user_agent, "test-agent/1.0");
        assert_eq!(settings.rate_limit_ms, 2_500);
        assert_eq!(settings.max_retries, 0);
        assert_eq!(settings.timeout_ms, DEFAULT_TIMEOUT_MS);
        assert!(settings.refresh_on_startup);
        assert_eq!(settings.cache_expiry_hours, 6);
    }

    #[test]
    fn env_overrides_config_values() {
        let config = AppConfig {
            wiki: WikiSection {
                api_url: Some("https://from-config.example/api.php".to_string()),
                user_agent: None,
            },
            http: HttpSection {
                rate_limit_ms: Some(5_000),
                ..HttpSection::default()
            },
            cache: CacheSection::default(),
        };
        let env: HashMap<&str, &str> = HashMap::from([
            ("WIKI_API_URL", " https://from-env.example/api.php "),
            ("WIKI_RATE_LIMIT_MS", "750"),
            ("WIKI_USER_AGENT", "   "),
            ("WIKI_HTTP_RETRIES", "not-a-number"),
        ]);

        let settings =
            config.resolve_with_lookup(|key| env.get(key).map(|value| value.to_string()));
        assert_eq!(settings.api_url, "https://from-env.example/api.php");
        assert_eq!(settings.rate_limit_ms, 750);
        assert_eq!(settings.user_agent, DEFAULT_USER_AGENT);
        assert_eq!(settings.max_retries, DEFAULT_MAX_RETRIES);
    }

    #[test]
    fn load_config_returns_error_for_invalid_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, "[cache\nexpiry_hours = 3").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn write_default_config_round_trips_and_respects_force() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("nested").join("config.toml");

        assert!(write_default_config(&config_path, false).expect("write"));
        assert!(!write_default_config(&config_path, false).expect("second write"));
        assert!(write_default_config(&config_path, true).expect("forced write"));

        let settings = load_config(&config_path)
            .expect("load config")
            .resolve_with_lookup(no_env);
        assert_eq!(settings, ResolvedSettings::default());
    }
}
