use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use reqwest::blocking::Client;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::ResolvedSettings;
use crate::model::{Skill, SkillData};
use crate::parser::parse_skill_page;

pub const LEVEL_UP_TABLE_SUFFIX: &str = "/Level_up_table";

/// Anything that can hand back the raw wikitext of a page.
///
/// `Ok(None)` means the page could not be served (missing, non-success status,
/// malformed envelope). `Err` is reserved for transport failures.
pub trait WikiPageSource: Send + Sync {
    fn fetch_page_wikitext(&self, title: &str) -> Result<Option<String>>;
    fn request_count(&self) -> usize;
}

impl<T: WikiPageSource + ?Sized> WikiPageSource for Arc<T> {
    fn fetch_page_wikitext(&self, title: &str) -> Result<Option<String>> {
        (**self).fetch_page_wikitext(title)
    }

    fn request_count(&self) -> usize {
        (**self).request_count()
    }
}

/// Serializes outgoing requests so consecutive ones start at least
/// `min_interval` apart. Callers block until their slot opens.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last_request_at: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request_at: Mutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Blocks until the next request may go out and returns the granted slot.
    pub fn acquire(&self) -> Instant {
        // The guard is held across the sleep so waiting callers queue up.
        let mut last = self
            .last_request_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                sleep(self.min_interval - elapsed);
            }
        }
        let granted = Instant::now();
        *last = Some(granted);
        granted
    }
}

#[derive(Debug, Clone)]
pub struct MediaWikiClientConfig {
    pub api_url: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub rate_limit_ms: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl MediaWikiClientConfig {
    pub fn from_settings(settings: &ResolvedSettings) -> Self {
        Self {
            api_url: settings.api_url.clone(),
            user_agent: settings.user_agent.clone(),
            timeout_ms: settings.timeout_ms,
            rate_limit_ms: settings.rate_limit_ms,
            max_retries: settings.max_retries,
            retry_delay_ms: settings.retry_delay_ms,
        }
    }
}

impl Default for MediaWikiClientConfig {
    fn default() -> Self {
        Self::from_settings(&ResolvedSettings::default())
    }
}

pub struct MediaWikiClient {
    client: Client,
    config: MediaWikiClientConfig,
    rate_limiter: Arc<RateLimiter>,
    request_count: AtomicUsize,
}

impl MediaWikiClient {
    pub fn new(config: MediaWikiClientConfig) -> Result<Self> {
        let rate_limiter = Arc::new(RateLimiter::new(Duration::from_millis(
            config.rate_limit_ms,
        )));
        Self::with_rate_limiter(config, rate_limiter)
    }

    pub fn with_rate_limiter(
        config: MediaWikiClientConfig,
        rate_limiter: Arc<RateLimiter>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build MediaWiki HTTP client")?;

        Ok(Self {
            client,
            config,
            rate_limiter,
            request_count: AtomicUsize::new(0),
        })
    }

    pub fn config(&self) -> &MediaWikiClientConfig {
        &self.config
    }

    pub fn rate_limiter(&self) -> Arc<RateLimiter> {
        Arc::clone(&self.rate_limiter)
    }

    fn wait_before_retry(&self, attempt: usize) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        let base = self
            .config
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        sleep(Duration::from_millis(base.saturating_add(jitter)));
    }
}

impl WikiPageSource for MediaWikiClient {
    fn fetch_page_wikitext(&self, title: &str) -> Result<Option<String>> {
        let base_url = Url::parse(&self.config.api_url)
            .with_context(|| format!("invalid WIKI_API_URL: {}", self.config.api_url))?;
        let params = [
            ("action", "query"),
            ("prop", "revisions"),
            ("titles", title),
            ("rvslots", "*"),
            ("rvprop", "content"),
            ("format", "json"),
        ];

        for attempt in 0..=self.config.max_retries {
            self.rate_limiter.acquire();
            self.request_count.fetch_add(1, Ordering::Relaxed);
            let response = self
                .client
                .get(base_url.clone())
                .header("User-Agent", self.config.user_agent.as_str())
                .query(&params)
                .send();

            match response {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        if attempt < self.config.max_retries && is_retryable_status(status) {
                            debug!(title, %status, attempt, "retrying wiki request");
                            self.wait_before_retry(attempt);
                            continue;
                        }
                        warn!(title, %status, "wiki request returned non-success status");
                        return Ok(None);
                    }

                    let body = response
                        .text()
                        .with_context(|| format!("failed to read response body for {title}"))?;
                    return Ok(extract_wikitext(title, &body));
                }
                Err(error) => {
                    if attempt < self.config.max_retries && is_retryable_error(&error) {
                        debug!(title, attempt, error = %error, "retrying wiki request");
                        self.wait_before_retry(attempt);
                        continue;
                    }
                    return Err(error).with_context(|| format!("failed to fetch {title}"));
                }
            }
        }

        bail!("MediaWiki API request exhausted retry budget")
    }

    fn request_count(&self) -> usize {
        self.request_count.load(Ordering::Relaxed)
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

#[derive(Debug, Deserialize, Default)]
struct QueryResponse {
    #[serde(default)]
    query: Option<QueryPayload>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize, Default)]
struct QueryPayload {
    #[serde(default)]
    pages: BTreeMap<String, PageEntry>,
}

#[derive(Debug, Deserialize, Default)]
struct PageEntry {
    #[serde(default)]
    missing: Option<Value>,
    #[serde(default)]
    revisions: Vec<RevisionEntry>,
}

#[derive(Debug, Deserialize, Default)]
struct RevisionEntry {
    #[serde(default)]
    slots: Option<RevisionSlots>,
}

#[derive(Debug, Deserialize, Default)]
struct RevisionSlots {
    #[serde(default)]
    main: Option<SlotContent>,
}

#[derive(Debug, Deserialize, Default)]
struct SlotContent {
    #[serde(default, rename = "*")]
    content: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    info: Option<String>,
}

/// Pulls the main-slot wikitext out of a `prop=revisions` response body.
pub fn extract_wikitext(title: &str, body: &str) -> Option<String> {
    let parsed: QueryResponse = match serde_json::from_str(body) {
        Ok(parsed) => parsed,
        Err(error) => {
            warn!(title, error = %error, "failed to decode wiki response");
            return None;
        }
    };

    if let Some(error) = parsed.error {
        warn!(
            title,
            code = error.code.as_deref().unwrap_or("unknown_error"),
            info = error.info.as_deref().unwrap_or("unknown info"),
            "wiki API returned an error"
        );
        return None;
    }

    let Some(page) = parsed
        .query
        .and_then(|query| query.pages.into_values().next())
    else {
        warn!(title, "wiki response contained no pages");
        return None;
    };
    if page.missing.is_some() {
        warn!(title, "wiki page is missing");
        return None;
    }
    let Some(revision) = page.revisions.into_iter().next() else {
        warn!(title, "wiki page has no revisions");
        return None;
    };
    let content = revision
        .slots
        .and_then(|slots| slots.main)
        .and_then(|slot| slot.content);
    if content.is_none() {
        warn!(title, "wiki revision has no main slot content");
    }
    content
}

pub fn level_up_table_title(page_title: &str) -> String {
    format!("{page_title}{LEVEL_UP_TABLE_SUFFIX}")
}

/// Fetches a skill's level up table page and parses it.
pub struct SkillPageFetcher<S> {
    source: S,
}

impl<S: WikiPageSource> SkillPageFetcher<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn fetch_skill_data(&self, skill: Skill) -> Result<SkillData> {
        let Some(page_title) = skill.page_title() else {
            warn!(skill = %skill, "skill has no wiki page mapping");
            return Ok(SkillData::empty(skill));
        };

        let title = level_up_table_title(page_title);
        debug!(skill = %skill, title = %title, "fetching level up table");
        match self.source.fetch_page_wikitext(&title)? {
            Some(wikitext) => Ok(parse_skill_page(skill, &wikitext)),
            None => Ok(SkillData::empty(skill)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSource {
        pages: BTreeMap<String, String>,
        fail_with: Option<String>,
        requested: Mutex<Vec<String>>,
    }

    impl WikiPageSource for RecordingSource {
        fn fetch_page_wikitext(&self, title: &str) -> Result<Option<String>> {
            self.requested
                .lock()
                .expect("requested lock")
                .push(title.to_string());
            if let Some(message) = &self.fail_with {
                bail!("{message}");
            }
            Ok(self.pages.get(title).cloned())
        }

        fn request_count(&self) -> usize {
            self.requested.lock().expect("requested lock").len()
        }
    }

    const ATTACK_TABLE: &str =
        "{{Level up table\n|freeplay1 =\n* Wield {{plink|Bronze dagger}}\n}}";

    fn response_with_content(content: &str) -> String {
        serde_json::json!({
            "batchcomplete": "",
            "query": {
                "pages": {
                    "4242": {
                        "pageid": 4242,
                        "ns": 0,
                        "title": "Attack/Level up table",
                        "revisions": [{
                            "slots": {
                                "main": {
                                    "contentmodel": "wikitext",
                                    "contentformat": "text/x-wiki",
                                    "*": content
                                }
                            }
                        }]
                    }
                }
            }
        })
        .to_string()
    }

    #[test]
    fn extract_wikitext_reads_main_slot() {
        let body = response_with_content(ATTACK_TABLE);
        assert_eq!(
            extract_wikitext("Attack/Level_up_table", &body).as_deref(),
            Some(ATTACK_TABLE)
        );
    }

    #[test]
    fn extract_wikitext_treats_degenerate_envelopes_as_absent() {
        let missing = r#"{"query":{"pages":{"-1":{"ns":0,"title":"Nope","missing":""}}}}"#;
        let no_revisions = r#"{"query":{"pages":{"1":{"pageid":1,"revisions":[]}}}}"#;
        let no_main = r#"{"query":{"pages":{"1":{"revisions":[{"slots":{}}]}}}}"#;
        let api_error = r#"{"error":{"code":"badvalue","info":"Unrecognized value"}}"#;
        let no_pages = r#"{"batchcomplete":""}"#;

        for body in [missing, no_revisions, no_main, api_error, no_pages, "<html>"] {
            assert!(extract_wikitext("T", body).is_none(), "body: {body}");
        }
    }

    #[test]
    fn fetcher_requests_level_up_table_and_parses_it() {
        let source = RecordingSource {
            pages: BTreeMap::from([(
                "Attack/Level_up_table".to_string(),
                ATTACK_TABLE.to_string(),
            )]),
            ..RecordingSource::default()
        };
        let fetcher = SkillPageFetcher::new(source);

        let data = fetcher.fetch_skill_data(Skill::Attack).expect("fetch");
        assert_eq!(data.skill, Skill::Attack);
        assert_eq!(data.unlocks_for_level(1)[0].name, "Wield Bronze dagger");
        assert_eq!(
            *fetcher.source().requested.lock().expect("requested lock"),
            vec!["Attack/Level_up_table".to_string()]
        );
    }

    #[test]
    fn fetcher_returns_empty_data_for_absent_page() {
        let fetcher = SkillPageFetcher::new(RecordingSource::default());
        let data = fetcher.fetch_skill_data(Skill::Hunter).expect("fetch");
        assert!(data.is_empty());
        assert_eq!(fetcher.source().request_count(), 1);
    }

    #[test]
    fn fetcher_skips_network_for_unmapped_skill() {
        let fetcher = SkillPageFetcher::new(RecordingSource::default());
        let data = fetcher.fetch_skill_data(Skill::Overall).expect("fetch");
        assert!(data.is_empty());
        assert_eq!(fetcher.source().request_count(), 0);
    }

    #[test]
    fn fetcher_propagates_transport_errors() {
        let fetcher = SkillPageFetcher::new(RecordingSource {
            fail_with: Some("connection reset".to_string()),
            ..RecordingSource::default()
        });
        let error = fetcher
            .fetch_skill_data(Skill::Mining)
            .expect_err("must fail");
        assert!(error.to_string().contains("connection reset"));
    }

    #[test]
    fn client_rejects_invalid_api_url_without_requesting() {
        let client = MediaWikiClient::new(MediaWikiClientConfig {
            api_url: "not a url".to_string(),
            rate_limit_ms: 0,
            ..MediaWikiClientConfig::default()
        })
        .expect("build client");
        let error = client
            .fetch_page_wikitext("Attack/Level_up_table")
            .expect_err("must fail");
        assert!(error.to_string().contains("invalid WIKI_API_URL"));
        assert_eq!(client.request_count(), 0);
    }

    #[test]
    fn rate_limiter_spaces_consecutive_acquisitions() {
        let limiter = RateLimiter::new(Duration::from_millis(60));
        let started = Instant::now();
        limiter.acquire();
        limiter.acquire();
        limiter.acquire();
        assert!(started.elapsed() >= Duration::from_millis(120));
    }

    #[test]
    fn rate_limiter_spaces_acquisitions_across_threads() {
        let interval = Duration::from_millis(40);
        let limiter = Arc::new(RateLimiter::new(interval));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || limiter.acquire())
            })
            .collect();
        let mut granted: Vec<Instant> = workers
            .into_iter()
            .map(|worker| worker.join().expect("worker thread"))
            .collect();
        granted.sort();

        for pair in granted.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= interval);
        }
        assert!(granted[3].duration_since(granted[0]) >= interval * 3);
    }

    #[test]
    fn rate_limiter_is_shared_between_clients() {
        let limiter = Arc::new(RateLimiter::new(Duration::from_millis(40)));
        let first = MediaWikiClient::with_rate_limiter(
            MediaWikiClientConfig::default(),
            Arc::clone(&limiter),
        )
        .expect("build client");
        let second = MediaWikiClient::with_rate_limiter(
            MediaWikiClientConfig::default(),
            Arc::clone(&limiter),
        )
        .expect("build client");
        assert!(Arc::ptr_eq(&first.rate_limiter(), &second.rate_limiter()));
        assert_eq!(first.rate_limiter().min_interval(), Duration::from_millis(40));
    }
}
