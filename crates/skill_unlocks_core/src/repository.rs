use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};

use anyhow::{Context, Result};
use dashmap::DashMap;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::SkillCache;
use crate::client::{MediaWikiClient, MediaWikiClientConfig, SkillPageFetcher, WikiPageSource};
use crate::config::ResolvedSettings;
use crate::model::{Skill, SkillData, SkillDataMap, SkillLevelData, Unlock};
use crate::runtime::ResolvedPaths;

pub const FETCH_WORKERS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    AlreadyInitialized,
    LoadedFromCache {
        skills: usize,
    },
    Fetched {
        skills: usize,
        unlocks: usize,
        failed: usize,
    },
    /// Every skill came back empty and nothing was loaded before; the
    /// repository stays uninitialized.
    NothingFetched {
        failed: usize,
    },
    ShutDown,
}

impl InitOutcome {
    pub fn is_ready(self) -> bool {
        matches!(
            self,
            Self::AlreadyInitialized | Self::LoadedFromCache { .. } | Self::Fetched { .. }
        )
    }
}

impl fmt::Display for InitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyInitialized => f.write_str("already initialized"),
            Self::LoadedFromCache { skills } => write!(f, "loaded {skills} skills from cache"),
            Self::Fetched {
                skills,
                unlocks,
                failed,
            } => write!(
                f,
                "fetched {unlocks} unlocks across {skills} skills ({failed} failed)"
            ),
            Self::NothingFetched { failed } => {
                write!(f, "no unlock data fetched ({failed} skills failed)")
            }
            Self::ShutDown => f.write_str("repository is shut down"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnlockMatch {
    pub skill: Skill,
    pub unlock: Unlock,
}

/// In-memory view of every skill's unlock table, backed by the on-disk cache
/// and refreshed from the wiki on demand.
pub struct UnlockRepository<S> {
    fetcher: SkillPageFetcher<S>,
    cache: SkillCache,
    skill_data: DashMap<Skill, SkillData>,
    initialized: AtomicBool,
    shut_down: AtomicBool,
    pool: RwLock<Option<ThreadPool>>,
    transition: Mutex<()>,
}

impl UnlockRepository<MediaWikiClient> {
    pub fn open(paths: &ResolvedPaths, settings: &ResolvedSettings) -> Result<Self> {
        let client = MediaWikiClient::new(MediaWikiClientConfig::from_settings(settings))?;
        Self::new(client, SkillCache::new(&paths.cache_path))
    }
}

impl<S: WikiPageSource> UnlockRepository<S> {
    pub fn new(source: S, cache: SkillCache) -> Result<Self> {
        Self::with_workers(source, cache, FETCH_WORKERS)
    }

    pub fn with_workers(source: S, cache: SkillCache, workers: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|index| format!("skill-fetch-{index}"))
            .build()
            .context("failed to build fetch worker pool")?;

        Ok(Self {
            fetcher: SkillPageFetcher::new(source),
            cache,
            skill_data: DashMap::new(),
            initialized: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            pool: RwLock::new(Some(pool)),
            transition: Mutex::new(()),
        })
    }

    pub fn source(&self) -> &S {
        self.fetcher.source()
    }

    pub fn cache_path(&self) -> &Path {
        self.cache.path()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn is_cache_expired(&self, ttl_hours: u32) -> bool {
        self.cache.is_expired(ttl_hours)
    }

    pub fn initialize(&self, force_refresh: bool, ttl_hours: u32) -> InitOutcome {
        let _transition = self
            .transition
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.shut_down.load(Ordering::Acquire) {
            return InitOutcome::ShutDown;
        }
        if self.is_initialized() && !force_refresh {
            return InitOutcome::AlreadyInitialized;
        }

        if !force_refresh && !self.cache.is_expired(ttl_hours) {
            let cached = self.cache.load();
            if !cached.is_empty() {
                let skills = cached.len();
                for (skill, data) in cached {
                    self.skill_data.insert(skill, data);
                }
                self.initialized.store(true, Ordering::Release);
                info!(skills, path = %self.cache.path().display(), "loaded unlock data from cache");
                return InitOutcome::LoadedFromCache { skills };
            }
            debug!("cache is empty; fetching from wiki");
        }

        self.fetch_all()
    }

    /// Drops the cache file and everything in memory, then fetches from scratch.
    pub fn refresh_data(&self) -> InitOutcome {
        let _transition = self
            .transition
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.shut_down.load(Ordering::Acquire) {
            return InitOutcome::ShutDown;
        }

        if let Err(error) = self.cache.clear() {
            warn!(error = %format!("{error:#}"), "failed to clear cache before refresh");
        }
        self.skill_data.clear();
        self.initialized.store(false, Ordering::Release);
        self.fetch_all()
    }

    fn fetch_all(&self) -> InitOutcome {
        let pool = self.pool.read().unwrap_or_else(PoisonError::into_inner);
        let Some(pool) = pool.as_ref() else {
            return InitOutcome::ShutDown;
        };

        let skills: Vec<Skill> = Skill::trainable().collect();
        info!(skills = skills.len(), "fetching level up tables");
        let results: Vec<(Skill, Result<usize>)> = pool.install(|| {
            skills
                .par_iter()
                .map(|skill| (*skill, self.fetch_one(*skill)))
                .collect()
        });

        let mut fetched_skills = 0;
        let mut unlocks = 0;
        let mut failed = 0;
        for (skill, result) in results {
            match result {
                Ok(0) => debug!(skill = %skill, "no unlocks found"),
                Ok(count) => {
                    fetched_skills += 1;
                    unlocks += count;
                }
                Err(error) => {
                    failed += 1;
                    warn!(skill = %skill, error = %format!("{error:#}"), "failed to fetch skill");
                }
            }
        }

        if self.skill_data.is_empty() {
            self.initialized.store(false, Ordering::Release);
            warn!(failed, "no unlock data fetched; repository left uninitialized");
            return InitOutcome::NothingFetched { failed };
        }
        if fetched_skills == 0 {
            warn!(
                failed,
                kept = self.skill_data.len(),
                "no unlock data fetched; keeping previously loaded skills"
            );
        }

        self.cache.save(self.snapshot());
        self.initialized.store(true, Ordering::Release);
        info!(skills = fetched_skills, unlocks, failed, "unlock data ready");
        InitOutcome::Fetched {
            skills: fetched_skills,
            unlocks,
            failed,
        }
    }

    fn fetch_one(&self, skill: Skill) -> Result<usize> {
        let data = self.fetcher.fetch_skill_data(skill)?;
        let count = data.unlock_count();
        if count > 0 {
            self.skill_data.insert(skill, data);
        }
        Ok(count)
    }

    /// Stops new fetch rounds, waits for one in flight, and flushes the cache.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        let pool = self
            .pool
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(pool);
        self.cache.shutdown();
    }

    pub fn snapshot(&self) -> SkillDataMap {
        self.skill_data
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    pub fn loaded_skills(&self) -> Vec<Skill> {
        let mut skills: Vec<Skill> = self.skill_data.iter().map(|entry| *entry.key()).collect();
        skills.sort();
        skills
    }

    pub fn get_skill_data(&self, skill: Skill) -> Option<SkillData> {
        self.skill_data.get(&skill).map(|entry| entry.value().clone())
    }

    pub fn get_unlocks_for_level(&self, skill: Skill, level: u8) -> Vec<Unlock> {
        self.skill_data
            .get(&skill)
            .map(|entry| entry.unlocks_for_level(level).to_vec())
            .unwrap_or_default()
    }

    pub fn get_unlocks_up_to_level(&self, skill: Skill, max_level: u8) -> BTreeMap<u8, Vec<Unlock>> {
        self.skill_data
            .get(&skill)
            .map(|entry| {
                entry
                    .unlocks_up_to_level(max_level)
                    .map(|group| (group.level, group.unlocks.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get_next_unlock(&self, skill: Skill, current_level: u8) -> Option<SkillLevelData> {
        self.skill_data
            .get(&skill)
            .and_then(|entry| entry.next_unlock(current_level).cloned())
    }

    /// Next unlock group of every listed skill, concatenated in skill order.
    pub fn get_next_unlocks(&self, current_levels: &BTreeMap<Skill, u8>) -> Vec<Unlock> {
        current_levels
            .iter()
            .filter_map(|(skill, level)| self.get_next_unlock(*skill, *level))
            .flat_map(|group| group.unlocks)
            .collect()
    }

    pub fn search_unlocks(&self, term: &str) -> Vec<UnlockMatch> {
        let needle = term.to_lowercase();
        let mut matches = Vec::new();
        for skill in Skill::ALL {
            let Some(entry) = self.skill_data.get(&skill) else {
                continue;
            };
            for unlock in entry.all_unlocks() {
                if unlock.name.to_lowercase().contains(&needle)
                    || unlock.description.to_lowercase().contains(&needle)
                {
                    matches.push(UnlockMatch {
                        skill,
                        unlock: unlock.clone(),
                    });
                }
            }
        }
        matches.sort_by_key(|found| found.unlock.level);
        matches
    }
}
