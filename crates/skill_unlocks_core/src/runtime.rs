use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

pub const APP_DIR_NAME: &str = "skill-unlocks";
pub const CACHE_DIR_NAME: &str = "level-up-table";
pub const CACHE_FILE_NAME: &str = "skill-data-cache.json";
pub const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Platform,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Platform => "platform",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub data_dir: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
    pub platform_data_dir: Option<PathBuf>,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        Ok(Self {
            cwd,
            platform_data_dir: dirs::data_dir(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub data_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub cache_path: PathBuf,
    pub config_path: PathBuf,
    pub data_source: ValueSource,
    pub config_source: ValueSource,
}

#[derive(Debug, Clone)]
pub struct RuntimeStatus {
    pub data_dir_exists: bool,
    pub config_exists: bool,
    pub cache_exists: bool,
    pub cache_size_bytes: Option<u64>,
    pub cache_modified_at: Option<DateTime<Utc>>,
}

impl ResolvedPaths {
    /// Layout rooted at an explicit data directory.
    pub fn under(data_dir: &Path) -> Self {
        let cache_dir = data_dir.join(CACHE_DIR_NAME);
        Self {
            cache_path: cache_dir.join(CACHE_FILE_NAME),
            config_path: data_dir.join(CONFIG_FILE_NAME),
            cache_dir,
            data_dir: data_dir.to_path_buf(),
            data_source: ValueSource::Flag,
            config_source: ValueSource::Default,
        }
    }

    pub fn diagnostics(&self) -> String {
        format!(
            "data_dir={} ({})\ncache_path={}\nconfig_path={} ({})",
            normalize_for_display(&self.data_dir),
            self.data_source.as_str(),
            normalize_for_display(&self.cache_path),
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
        )
    }
}

pub fn inspect_runtime(paths: &ResolvedPaths) -> Result<RuntimeStatus> {
    let cache_exists = paths.cache_path.exists();
    let (cache_size_bytes, cache_modified_at) = if cache_exists {
        let metadata = fs::metadata(&paths.cache_path)
            .with_context(|| format!("failed to inspect {}", paths.cache_path.display()))?;
        let modified = metadata.modified().ok().map(DateTime::<Utc>::from);
        (Some(metadata.len()), modified)
    } else {
        (None, None)
    };

    Ok(RuntimeStatus {
        data_dir_exists: paths.data_dir.exists(),
        config_exists: paths.config_path.exists(),
        cache_exists,
        cache_size_bytes,
        cache_modified_at,
    })
}

pub fn resolve_paths(
    context: &ResolutionContext,
    overrides: &PathOverrides,
) -> Result<ResolvedPaths> {
    resolve_paths_with_lookup(context, overrides, |key| env::var(key).ok())
}

fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<ResolvedPaths>
where
    F: Fn(&str) -> Option<String>,
{
    let env_path = |key: &str| {
        lookup_env(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
    };

    let (data_dir, data_source) = if let Some(path) = overrides.data_dir.as_deref() {
        (absolutize(path, &context.cwd), ValueSource::Flag)
    } else if let Some(path) = env_path("SKILL_UNLOCKS_DATA_DIR") {
        (absolutize(&path, &context.cwd), ValueSource::Env)
    } else if let Some(platform) = context.platform_data_dir.as_deref() {
        (platform.join(APP_DIR_NAME), ValueSource::Platform)
    } else {
        (
            context.cwd.join(format!(".{APP_DIR_NAME}")),
            ValueSource::Default,
        )
    };

    let (config_path, config_source) = if let Some(path) = overrides.config.as_deref() {
        (absolutize(path, &context.cwd), ValueSource::Flag)
    } else if let Some(path) = env_path("SKILL_UNLOCKS_CONFIG") {
        (absolutize(&path, &context.cwd), ValueSource::Env)
    } else {
        (data_dir.join(CONFIG_FILE_NAME), ValueSource::Default)
    };

    let cache_dir = data_dir.join(CACHE_DIR_NAME);
    Ok(ResolvedPaths {
        cache_path: cache_dir.join(CACHE_FILE_NAME),
        cache_dir,
        data_dir,
        config_path,
        data_source,
        config_source,
    })
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn context(cwd: &Path, platform: Option<&Path>) -> ResolutionContext {
        ResolutionContext {
            cwd: cwd.to_path_buf(),
            platform_data_dir: platform.map(Path::to_path_buf),
        }
    }

    #[test]
    fn flag_overrides_env_and_platform() {
        let temp = tempdir().expect("tempdir");
        let paths = resolve_paths_with_lookup(
            &context(temp.path(), Some(Path::new("/platform"))),
            &PathOverrides {
                data_dir: Some(PathBuf::from("custom")),
                config: None,
            },
            |_| Some("/from-env".to_string()),
        )
        .expect("resolve");

        assert_eq!(paths.data_dir, temp.path().join("custom"));
        assert_eq!(paths.data_source, ValueSource::Flag);
        assert_eq!(paths.config_path, PathBuf::from("/from-env"));
        assert_eq!(paths.config_source, ValueSource::Env);
    }

    #[test]
    fn platform_dir_is_used_without_overrides() {
        let temp = tempdir().expect("tempdir");
        let platform = temp.path().join("share");
        let paths = resolve_paths_with_lookup(
            &context(temp.path(), Some(&platform)),
            &PathOverrides::default(),
            |_| None,
        )
        .expect("resolve");

        assert_eq!(paths.data_dir, platform.join(APP_DIR_NAME));
        assert_eq!(paths.data_source, ValueSource::Platform);
        assert_eq!(
            paths.cache_path,
            platform
                .join(APP_DIR_NAME)
                .join(CACHE_DIR_NAME)
                .join(CACHE_FILE_NAME)
        );
        assert_eq!(paths.config_path, platform.join(APP_DIR_NAME).join(CONFIG_FILE_NAME));
        assert_eq!(paths.config_source, ValueSource::Default);
    }

    #[test]
    fn falls_back_to_hidden_dir_in_cwd() {
        let temp = tempdir().expect("tempdir");
        let paths = resolve_paths_with_lookup(
            &context(temp.path(), None),
            &PathOverrides::default(),
            |key| (key == "SKILL_UNLOCKS_DATA_DIR").then(|| "  ".to_string()),
        )
        .expect("resolve");

        assert_eq!(paths.data_dir, temp.path().join(".skill-unlocks"));
        assert_eq!(paths.data_source, ValueSource::Default);
        assert!(paths.diagnostics().contains("(default)"));
    }

    #[test]
    fn inspect_runtime_reports_cache_file() {
        let temp = tempdir().expect("tempdir");
        let paths = ResolvedPaths::under(temp.path());

        let before = inspect_runtime(&paths).expect("inspect");
        assert!(!before.cache_exists);
        assert!(before.cache_size_bytes.is_none());

        fs::create_dir_all(&paths.cache_dir).expect("create cache dir");
        fs::write(&paths.cache_path, "{}").expect("write cache");
        let after = inspect_runtime(&paths).expect("inspect");
        assert!(after.cache_exists);
        assert_eq!(after.cache_size_bytes, Some(2));
        assert!(after.cache_modified_at.is_some());
    }
}
