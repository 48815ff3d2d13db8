//! Job orchestration: registry loading, retrying extractor calls, read-merge-write of the feeds.

pub mod health;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, NaiveDate, Offset, Utc};
use compset_adapters::{
    price_extractor, review_extractor_for, AdapterSettings, FetchFailure, Fetched, PriceExtractor,
    ReviewExtractor,
};
use compset_core::{
    local_today, window_dates, HotelRecord, MetaDataset, PriceDataset, Reading, ReviewStats, Source, PRICE_CURRENCY,
    PRICE_SOURCE_ID,
};
use compset_storage::{
    read_dataset, write_dataset, ArtifactStore, BackoffPolicy, HttpClientConfig, HttpFetcher, TokenBucketConfig,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use health::{report, HealthReport, HealthThresholds};

pub const CRATE_NAME: &str = "compset-sync";

pub const HOTEL_MASTER_FILE: &str = "hotel_master.json";
pub const PRICES_FILE: &str = "competitor_min_prices.json";
pub const REVIEWS_FILE: &str = "ota_facility_meta.json";
pub const HEALTH_FILE: &str = "health_report.json";

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub hotel_master: Option<PathBuf>,
    pub artifacts_dir: Option<PathBuf>,
    pub rakuten_app_id: Option<String>,
    pub rakuten_base_url: String,
    pub jalan_base_url: String,
    pub user_agent: String,
    pub accept_language: String,
    pub http_timeout_secs: u64,
    pub window_days: u32,
    pub utc_offset_hours: i32,
    pub concurrency: usize,
    pub max_attempts: usize,
    pub run_timeout_secs: u64,
    pub rakuten_interval_ms: u64,
    pub jalan_interval_ms: u64,
    pub price_max_age_days: f64,
    pub review_max_age_days: f64,
    pub price_last_updated_max_age_hours: f64,
    pub unknown_ratio_limit: f64,
    pub scheduler_enabled: bool,
    pub price_cron: String,
    pub review_cron: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: PathBuf::from(env_or("COMPSET_DATA_DIR", "./data")),
            hotel_master: std::env::var("COMPSET_HOTEL_MASTER").ok().map(PathBuf::from),
            artifacts_dir: std::env::var("COMPSET_ARTIFACTS_DIR").ok().map(PathBuf::from),
            rakuten_app_id: std::env::var("RAKUTEN_APP_ID")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            rakuten_base_url: env_or("COMPSET_RAKUTEN_BASE_URL", compset_adapters::RAKUTEN_API_BASE),
            jalan_base_url: env_or("COMPSET_JALAN_BASE_URL", compset_adapters::JALAN_BASE),
            user_agent: env_or("COMPSET_USER_AGENT", DEFAULT_USER_AGENT),
            accept_language: env_or("COMPSET_ACCEPT_LANGUAGE", "ja-JP,ja;q=0.9,en;q=0.8"),
            http_timeout_secs: env_parse("COMPSET_HTTP_TIMEOUT_SECS", 20),
            window_days: env_parse("COMPSET_WINDOW_DAYS", compset_core::DEFAULT_WINDOW_DAYS).max(1),
            utc_offset_hours: env_parse::<i32>("COMPSET_UTC_OFFSET_HOURS", 9).clamp(-12, 14),
            concurrency: env_parse::<usize>("COMPSET_CONCURRENCY", 4).max(1),
            max_attempts: env_parse::<usize>("COMPSET_MAX_ATTEMPTS", 3).max(1),
            run_timeout_secs: env_parse("COMPSET_RUN_TIMEOUT_SECS", 30 * 60),
            rakuten_interval_ms: env_parse("COMPSET_RAKUTEN_INTERVAL_MS", 1_000),
            jalan_interval_ms: env_parse("COMPSET_JALAN_INTERVAL_MS", 3_000),
            price_max_age_days: env_parse("COMPSET_PRICE_MAX_AGE_DAYS", 2.0),
            review_max_age_days: env_parse("COMPSET_REVIEW_MAX_AGE_DAYS", 8.0),
            price_last_updated_max_age_hours: env_parse("COMPSET_LAST_UPDATED_MAX_AGE_HOURS", 26.0),
            unknown_ratio_limit: env_parse("COMPSET_UNKNOWN_RATIO_LIMIT", 0.5),
            scheduler_enabled: env_flag("COMPSET_SCHEDULER_ENABLED"),
            // 06:00 JST daily, reviews Mondays 06:30 JST
            price_cron: env_or("COMPSET_PRICE_CRON", "0 0 21 * * *"),
            review_cron: env_or("COMPSET_REVIEW_CRON", "0 30 21 * * Sun"),
        }
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    pub fn hotel_master_path(&self) -> PathBuf {
        self.hotel_master
            .clone()
            .unwrap_or_else(|| self.data_dir.join(HOTEL_MASTER_FILE))
    }

    pub fn prices_path(&self) -> PathBuf {
        self.data_dir.join(PRICES_FILE)
    }

    pub fn reviews_path(&self) -> PathBuf {
        self.data_dir.join(REVIEWS_FILE)
    }

    pub fn health_path(&self) -> PathBuf {
        self.data_dir.join(HEALTH_FILE)
    }

    pub fn utc_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_hours * 3600).unwrap_or_else(|| Utc.fix())
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.max_attempts,
            ..BackoffPolicy::default()
        }
    }

    pub fn job_options(&self) -> JobOptions {
        JobOptions {
            window_days: self.window_days,
            utc_offset: self.utc_offset(),
            concurrency: self.concurrency,
            backoff: self.backoff(),
            run_timeout: Duration::from_secs(self.run_timeout_secs),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        let mut token_buckets = HashMap::new();
        token_buckets.insert(
            Source::Rakuten,
            TokenBucketConfig::one_per(Duration::from_millis(self.rakuten_interval_ms)),
        );
        token_buckets.insert(
            Source::Jalan,
            TokenBucketConfig::one_per(Duration::from_millis(self.jalan_interval_ms)),
        );
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            accept_language: Some(self.accept_language.clone()),
            global_concurrency: self.concurrency * 2,
            per_source_concurrency: self.concurrency,
            token_buckets,
        }
    }

    pub fn adapter_settings(&self) -> AdapterSettings {
        AdapterSettings {
            rakuten_app_id: self.rakuten_app_id.clone(),
            rakuten_base_url: self.rakuten_base_url.clone(),
            jalan_base_url: self.jalan_base_url.clone(),
            artifacts: self.artifacts_dir.clone().map(ArtifactStore::new),
        }
    }

    pub fn health_thresholds(&self) -> HealthThresholds {
        HealthThresholds {
            window_days: self.window_days,
            utc_offset: self.utc_offset(),
            price_max_age_days: self.price_max_age_days,
            review_max_age_days: self.review_max_age_days,
            last_updated_max_age_hours: self.price_last_updated_max_age_hours,
            unknown_ratio_limit: self.unknown_ratio_limit,
        }
    }
}

// ---------------------------------------------------------------------------
// Hotel registry

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading hotel master {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing hotel master {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("hotel master entry #{index} has no hotel_id")]
    MissingHotelId { index: usize },
    #[error("hotel {hotel_id} is enabled but has no OTA identifier")]
    NoOtaIdentifier { hotel_id: String },
    #[error("hotel {hotel_id}: jalan_hotel_id {value:?} must start with \"yad\"")]
    BadJalanId { hotel_id: String, value: String },
    #[error("duplicate hotel_id {0}")]
    DuplicateHotelId(String),
    #[error(transparent)]
    Adapter(#[from] compset_adapters::AdapterError),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HotelMasterFile {
    Wrapped { hotels: Vec<HotelMasterEntry> },
    Bare(Vec<HotelMasterEntry>),
}

#[derive(Debug, Deserialize)]
struct HotelMasterEntry {
    #[serde(default, alias = "id")]
    hotel_id: Option<String>,
    #[serde(default)]
    rakuten_hotel_no: Option<u64>,
    #[serde(default)]
    jalan_hotel_id: Option<String>,
    #[serde(default)]
    enabled: bool,
}

/// Parses hotel master JSON and returns the enabled hotels in file order.
pub fn parse_registry(path: &Path, text: &str) -> Result<Vec<HotelRecord>, ConfigError> {
    let file: HotelMasterFile = serde_json::from_str(text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    let entries = match file {
        HotelMasterFile::Wrapped { hotels } => hotels,
        HotelMasterFile::Bare(hotels) => hotels,
    };

    let mut seen = BTreeSet::new();
    let mut enabled = Vec::new();
    for (index, entry) in entries.into_iter().enumerate() {
        let hotel_id = entry
            .hotel_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .ok_or(ConfigError::MissingHotelId { index })?;
        if !seen.insert(hotel_id.clone()) {
            return Err(ConfigError::DuplicateHotelId(hotel_id));
        }

        let jalan_hotel_id = entry
            .jalan_hotel_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty());
        if let Some(value) = &jalan_hotel_id {
            if !value.starts_with("yad") {
                return Err(ConfigError::BadJalanId {
                    hotel_id,
                    value: value.clone(),
                });
            }
        }

        let record = HotelRecord {
            hotel_id,
            rakuten_hotel_no: entry.rakuten_hotel_no,
            jalan_hotel_id,
            enabled: entry.enabled,
        };
        if !record.enabled {
            continue;
        }
        if !Source::ALL.iter().any(|source| record.listed_on(*source)) {
            return Err(ConfigError::NoOtaIdentifier {
                hotel_id: record.hotel_id,
            });
        }
        enabled.push(record);
    }
    Ok(enabled)
}

pub async fn load_registry(path: &Path) -> Result<Vec<HotelRecord>, ConfigError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    parse_registry(path, &text)
}

// ---------------------------------------------------------------------------
// Retry controller

/// Bounded retries around one extractor call, degrading every failure to `Unknown`.
#[derive(Debug, Clone, Copy)]
pub struct RetryController {
    policy: BackoffPolicy,
}

impl RetryController {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy }
    }

    pub async fn run<V, F, Fut>(&self, key: &str, mut call: F) -> Reading<V>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Fetched<V>, FetchFailure>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        for attempt in 0..max_attempts {
            match call().await {
                Ok(Fetched::Value(value)) => {
                    debug!(key, attempt, "confirmed value");
                    return Reading::Confirmed(value);
                }
                Ok(Fetched::NoStock) => {
                    debug!(key, attempt, "confirmed absent");
                    return Reading::ConfirmedAbsent;
                }
                Err(failure) if failure.is_transient() && attempt + 1 < max_attempts => {
                    let delay = self.policy.retry_delay(attempt, failure.retry_after());
                    debug!(key, attempt, failure = %failure, delay_ms = delay.as_millis() as u64, "retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(failure) if failure.is_transient() => {
                    warn!(key, attempts = max_attempts, failure = %failure, "retries exhausted, keeping prior value");
                    return Reading::Unknown;
                }
                Err(failure) => {
                    warn!(key, kind = failure.kind(), failure = %failure, "not retry-worthy, keeping prior value");
                    return Reading::Unknown;
                }
            }
        }
        Reading::Unknown
    }
}

// ---------------------------------------------------------------------------
// Jobs

#[derive(Debug, Clone, Copy)]
pub struct JobOptions {
    pub window_days: u32,
    pub utc_offset: FixedOffset,
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
    pub run_timeout: Duration,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            window_days: compset_core::DEFAULT_WINDOW_DAYS,
            utc_offset: FixedOffset::east_opt(9 * 3600).unwrap_or_else(|| Utc.fix()),
            concurrency: 4,
            backoff: BackoffPolicy::default(),
            run_timeout: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReadingCounts {
    pub confirmed: usize,
    pub confirmed_absent: usize,
    pub unknown: usize,
}

impl ReadingCounts {
    fn record<V>(&mut self, reading: &Reading<V>) {
        match reading {
            Reading::Confirmed(_) => self.confirmed += 1,
            Reading::ConfirmedAbsent => self.confirmed_absent += 1,
            Reading::Unknown => self.unknown += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub job: &'static str,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub hotels: usize,
    pub counts: ReadingCounts,
    pub timed_out: bool,
    pub output: String,
}

/// Drains readings until every task reports or the deadline passes.
///
/// Returns `true` when the deadline hit and outstanding tasks were aborted.
async fn collect_readings<K: Ord, V>(
    mut rx: mpsc::Receiver<(K, Reading<V>)>,
    tasks: &mut JoinSet<()>,
    run_timeout: Duration,
    readings: &mut BTreeMap<K, Reading<V>>,
) -> bool {
    let deadline = Instant::now() + run_timeout;
    let timed_out = loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some((key, reading))) => {
                readings.insert(key, reading);
            }
            Ok(None) => break false,
            Err(_) => {
                tasks.abort_all();
                break true;
            }
        }
    };
    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined {
            if !err.is_cancelled() {
                error!(error = %err, "fetch task failed");
            }
        }
    }
    timed_out
}

/// Refreshes the rolling price window for every enabled Rakuten-listed hotel and rewrites the price feed.
pub async fn run_price_job(
    hotels: &[HotelRecord],
    extractor: Arc<dyn PriceExtractor>,
    options: &JobOptions,
    path: &Path,
    now: DateTime<Utc>,
) -> Result<RunSummary> {
    let run_id = Uuid::new_v4();
    let span = info_span!("price_job", %run_id);
    async move {
        let started_at = Utc::now();
        let mut dataset: PriceDataset = read_dataset(path)
            .await
            .with_context(|| format!("loading prior prices from {}", path.display()))?
            .unwrap_or_else(|| PriceDataset::empty(options.window_days));

        let start = local_today(now, options.utc_offset);
        let dates = window_dates(start, options.window_days);
        let listed: Vec<HotelRecord> = hotels
            .iter()
            .filter(|h| h.enabled && h.listed_on(extractor.source()))
            .cloned()
            .collect();
        info!(hotels = listed.len(), window_start = %start, days = dates.len(), "fetching prices");

        let (tx, rx) = mpsc::channel::<((String, NaiveDate), Reading<u32>)>(options.concurrency.max(1) * 4);
        let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
        let controller = RetryController::new(options.backoff);
        let mut tasks = JoinSet::new();
        for hotel in &listed {
            for date in &dates {
                let hotel = hotel.clone();
                let date = *date;
                let extractor = extractor.clone();
                let semaphore = semaphore.clone();
                let tx = tx.clone();
                tasks.spawn(async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return;
                    };
                    let key = format!("{}@{date}", hotel.hotel_id);
                    let hotel_ref = &hotel;
                    let extractor_ref = &extractor;
                    let reading = controller
                        .run(&key, move || extractor_ref.fetch_price(hotel_ref, date))
                        .await;
                    let _ = tx.send(((hotel.hotel_id.clone(), date), reading)).await;
                });
            }
        }
        drop(tx);

        let mut readings = BTreeMap::new();
        let timed_out = collect_readings(rx, &mut tasks, options.run_timeout, &mut readings).await;
        if timed_out {
            warn!(
                received = readings.len(),
                expected = listed.len() * dates.len(),
                "run timeout reached; missing keys keep their prior values"
            );
        }

        dataset.roll_to(start, options.window_days, listed.iter().map(|h| h.hotel_id.as_str()));
        let mut counts = ReadingCounts::default();
        for hotel in &listed {
            for date in &dates {
                let reading = readings
                    .remove(&(hotel.hotel_id.clone(), *date))
                    .unwrap_or(Reading::Unknown);
                counts.record(&reading);
                dataset.apply(&hotel.hotel_id, *date, reading, now);
            }
        }
        dataset.meta.currency = Some(PRICE_CURRENCY.to_string());
        dataset.meta.source = PRICE_SOURCE_ID.to_string();
        dataset.meta.window_days = Some(options.window_days);
        dataset.meta.last_updated = Some(now);

        write_dataset(path, &dataset)
            .await
            .with_context(|| format!("writing prices to {}", path.display()))?;

        let summary = RunSummary {
            run_id,
            job: "prices",
            started_at,
            finished_at: Utc::now(),
            hotels: listed.len(),
            counts,
            timed_out,
            output: path.display().to_string(),
        };
        info!(
            confirmed = summary.counts.confirmed,
            confirmed_absent = summary.counts.confirmed_absent,
            unknown = summary.counts.unknown,
            "price job finished"
        );
        Ok::<_, anyhow::Error>(summary)
    }
    .instrument(span)
    .await
}

/// Refreshes review stats for every enabled hotel on each given source.
pub async fn run_review_job(
    hotels: &[HotelRecord],
    extractors: &[Arc<dyn ReviewExtractor>],
    options: &JobOptions,
    path: &Path,
    now: DateTime<Utc>,
) -> Result<RunSummary> {
    let run_id = Uuid::new_v4();
    let span = info_span!("review_job", %run_id);
    async move {
        let started_at = Utc::now();
        let mut dataset: MetaDataset = read_dataset(path)
            .await
            .with_context(|| format!("loading prior reviews from {}", path.display()))?
            .unwrap_or_default();

        let enabled: Vec<&HotelRecord> = hotels.iter().filter(|h| h.enabled).collect();
        let (tx, rx) = mpsc::channel::<((String, Source), Reading<ReviewStats>)>(options.concurrency.max(1) * 4);
        let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
        let controller = RetryController::new(options.backoff);
        let mut tasks = JoinSet::new();
        let mut expected = Vec::new();

        for extractor in extractors {
            let source = extractor.source();
            for hotel in enabled.iter().filter(|h| h.listed_on(source)) {
                expected.push((hotel.hotel_id.clone(), source));
                let hotel = (*hotel).clone();
                let extractor = extractor.clone();
                let semaphore = semaphore.clone();
                let tx = tx.clone();
                tasks.spawn(async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return;
                    };
                    let key = format!("{}/{source}", hotel.hotel_id);
                    let hotel_ref = &hotel;
                    let extractor_ref = &extractor;
                    let reading = controller
                        .run(&key, move || extractor_ref.fetch_reviews(hotel_ref))
                        .await;
                    let _ = tx.send(((hotel.hotel_id.clone(), source), reading)).await;
                });
            }
        }
        drop(tx);
        info!(keys = expected.len(), sources = extractors.len(), "fetching reviews");

        let mut readings = BTreeMap::new();
        let timed_out = collect_readings(rx, &mut tasks, options.run_timeout, &mut readings).await;
        if timed_out {
            warn!(
                received = readings.len(),
                expected = expected.len(),
                "run timeout reached; missing keys keep their prior values"
            );
        }

        for hotel in &enabled {
            dataset.hotels.entry(hotel.hotel_id.clone()).or_default();
        }
        let mut counts = ReadingCounts::default();
        for key in &expected {
            let reading = readings.remove(key).unwrap_or(Reading::Unknown);
            counts.record(&reading);
            dataset.apply(&key.0, key.1, reading, now);
        }
        dataset.meta.last_updated = Some(now);

        write_dataset(path, &dataset)
            .await
            .with_context(|| format!("writing reviews to {}", path.display()))?;

        let summary = RunSummary {
            run_id,
            job: "reviews",
            started_at,
            finished_at: Utc::now(),
            hotels: enabled.len(),
            counts,
            timed_out,
            output: path.display().to_string(),
        };
        info!(
            confirmed = summary.counts.confirmed,
            confirmed_absent = summary.counts.confirmed_absent,
            unknown = summary.counts.unknown,
            "review job finished"
        );
        Ok::<_, anyhow::Error>(summary)
    }
    .instrument(span)
    .await
}

/// Builds the health report from whatever is on disk and writes it next to the feeds.
///
/// Unreadable inputs become error checks in the report instead of aborting.
pub async fn run_health_job(config: &SyncConfig, now: DateTime<Utc>) -> Result<HealthReport> {
    let thresholds = config.health_thresholds();
    let mut problems = Vec::new();

    let hotels = match load_registry(&config.hotel_master_path()).await {
        Ok(hotels) => hotels,
        Err(err) => {
            problems.push(health::HealthCheck::error(format!("hotel master unusable: {err}")));
            Vec::new()
        }
    };
    let prices: Option<PriceDataset> = match read_dataset(&config.prices_path()).await {
        Ok(dataset) => dataset,
        Err(err) => {
            problems.push(health::HealthCheck::error(format!("{:#}", anyhow::Error::new(err))));
            None
        }
    };
    let reviews: Option<MetaDataset> = match read_dataset(&config.reviews_path()).await {
        Ok(dataset) => dataset,
        Err(err) => {
            problems.push(health::HealthCheck::error(format!("{:#}", anyhow::Error::new(err))));
            None
        }
    };

    let mut report = report(&hotels, prices.as_ref(), reviews.as_ref(), &thresholds, now);
    for check in problems {
        report = report.with_check(check);
    }
    let path = config.health_path();
    write_dataset(&path, &report)
        .await
        .with_context(|| format!("writing health report to {}", path.display()))?;
    info!(status = ?report.summary.status, path = %path.display(), "health report written");
    Ok(report)
}

pub struct SyncPipeline {
    config: SyncConfig,
    http: Arc<HttpFetcher>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config())?;
        Ok(Self {
            config,
            http: Arc::new(http),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn run_prices(&self) -> Result<RunSummary> {
        let extractor =
            price_extractor(self.http.clone(), &self.config.adapter_settings()).map_err(ConfigError::from)?;
        let hotels = load_registry(&self.config.hotel_master_path()).await?;
        run_price_job(
            &hotels,
            extractor,
            &self.config.job_options(),
            &self.config.prices_path(),
            Utc::now(),
        )
        .await
    }

    pub async fn run_reviews(&self, sources: &[Source]) -> Result<RunSummary> {
        let settings = self.config.adapter_settings();
        let extractors = sources
            .iter()
            .map(|source| review_extractor_for(*source, self.http.clone(), &settings))
            .collect::<Result<Vec<_>, _>>()
            .map_err(ConfigError::from)?;
        let hotels = load_registry(&self.config.hotel_master_path()).await?;
        run_review_job(
            &hotels,
            &extractors,
            &self.config.job_options(),
            &self.config.reviews_path(),
            Utc::now(),
        )
        .await
    }

    pub async fn run_health(&self) -> Result<HealthReport> {
        run_health_job(&self.config, Utc::now()).await
    }
}

async fn refresh_health(pipeline: &SyncPipeline) {
    if let Err(err) = pipeline.run_health().await {
        error!(error = %format!("{err:#}"), "scheduled health report failed");
    }
}

/// One scheduled price run; the health report is rewritten whatever the outcome.
async fn scheduled_price_run(pipeline: &SyncPipeline) {
    match pipeline.run_prices().await {
        Ok(summary) => info!(run_id = %summary.run_id, "scheduled price run finished"),
        Err(err) => error!(error = %format!("{err:#}"), "scheduled price run failed"),
    }
    refresh_health(pipeline).await;
}

async fn scheduled_review_run(pipeline: &SyncPipeline, sources: &[Source]) {
    match pipeline.run_reviews(sources).await {
        Ok(summary) => info!(run_id = %summary.run_id, "scheduled review run finished"),
        Err(err) => error!(error = %format!("{err:#}"), "scheduled review run failed"),
    }
    refresh_health(pipeline).await;
}

/// Registers the daily price job and the weekly review job when the scheduler is enabled.
pub async fn maybe_build_scheduler(pipeline: Arc<SyncPipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let prices = pipeline.clone();
    let price_job = Job::new_async(pipeline.config.price_cron.as_str(), move |_uuid, _l| {
        let pipeline = prices.clone();
        Box::pin(async move { scheduled_price_run(&pipeline).await })
    })
    .with_context(|| format!("creating price job for cron {}", pipeline.config.price_cron))?;
    sched.add(price_job).await.context("adding price job")?;

    let reviews = pipeline.clone();
    let review_job = Job::new_async(pipeline.config.review_cron.as_str(), move |_uuid, _l| {
        let pipeline = reviews.clone();
        Box::pin(async move { scheduled_review_run(&pipeline, &Source::ALL).await })
    })
    .with_context(|| format!("creating review job for cron {}", pipeline.config.review_cron))?;
    sched.add(review_job).await.context("adding review job")?;

    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry(text: &str) -> Result<Vec<HotelRecord>, ConfigError> {
        parse_registry(Path::new("hotel_master.json"), text)
    }

    #[test]
    fn registry_accepts_wrapped_and_bare_layouts() {
        let wrapped = registry(
            r#"{"hotels": [
                {"id": "a", "rakuten_hotel_no": 1, "enabled": true},
                {"id": "b", "jalan_hotel_id": "yad2", "enabled": false}
            ]}"#,
        )
        .expect("wrapped");
        assert_eq!(wrapped.len(), 1);
        assert_eq!(wrapped[0].hotel_id, "a");

        let bare = registry(r#"[{"hotel_id": "c", "jalan_hotel_id": "yad3", "enabled": true}]"#).expect("bare");
        assert_eq!(bare[0].jalan_hotel_id.as_deref(), Some("yad3"));
    }

    #[test]
    fn registry_rejects_structural_problems() {
        assert!(matches!(registry("{"), Err(ConfigError::Parse { .. })));
        assert!(matches!(
            registry(r#"[{"rakuten_hotel_no": 1, "enabled": true}]"#),
            Err(ConfigError::MissingHotelId { index: 0 })
        ));
        assert!(matches!(
            registry(r#"[{"id": "a", "enabled": true}]"#),
            Err(ConfigError::NoOtaIdentifier { .. })
        ));
        assert!(matches!(
            registry(r#"[{"id": "a", "jalan_hotel_id": "318123", "enabled": true}]"#),
            Err(ConfigError::BadJalanId { .. })
        ));
        assert!(matches!(
            registry(r#"[{"id": "a", "rakuten_hotel_no": 1, "enabled": false}, {"id": "a", "rakuten_hotel_no": 2, "enabled": true}]"#),
            Err(ConfigError::DuplicateHotelId(id)) if id == "a"
        ));
    }

    #[test]
    fn sample_hotel_master_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../data").join(HOTEL_MASTER_FILE);
        let text = std::fs::read_to_string(&path).expect("sample master");
        let hotels = parse_registry(&path, &text).expect("valid sample");
        assert_eq!(hotels.len(), 3);
        assert!(hotels.iter().all(|h| h.enabled));
    }

    #[tokio::test]
    async fn retry_exhausts_transient_failures_then_reports_unknown() {
        let calls = AtomicUsize::new(0);
        let controller = RetryController::new(BackoffPolicy::immediate(3));
        let reading: Reading<u32> = controller
            .run("h1", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(FetchFailure::Unavailable("503".into())) }
            })
            .await;
        assert_eq!(reading, Reading::Unknown);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_recovers_after_transient_failure() {
        let calls = AtomicUsize::new(0);
        let controller = RetryController::new(BackoffPolicy::immediate(3));
        let reading = controller
            .run("h1", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(FetchFailure::RateLimited { retry_after: None })
                    } else {
                        Ok(Fetched::Value(9800u32))
                    }
                }
            })
            .await;
        assert_eq!(reading, Reading::Confirmed(9800));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn structural_failures_and_no_stock_are_not_retried() {
        let calls = AtomicUsize::new(0);
        let controller = RetryController::new(BackoffPolicy::immediate(5));
        let reading: Reading<u32> = controller
            .run("h1", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(FetchFailure::ExtractionFailed("layout changed".into())) }
            })
            .await;
        assert_eq!(reading, Reading::Unknown);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let reading: Reading<u32> = controller.run("h2", || async { Ok(Fetched::NoStock) }).await;
        assert_eq!(reading, Reading::ConfirmedAbsent);
    }

    #[test]
    fn config_paths_follow_data_dir() {
        let config = SyncConfig::from_env().with_data_dir("/tmp/compset");
        assert_eq!(config.prices_path(), PathBuf::from("/tmp/compset").join(PRICES_FILE));
        assert_eq!(config.reviews_path(), PathBuf::from("/tmp/compset").join(REVIEWS_FILE));
        assert_eq!(config.http_client_config().token_buckets.len(), 2);
    }

    #[tokio::test]
    async fn scheduled_review_run_refreshes_health_report() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join(HOTEL_MASTER_FILE),
            r#"[{"id": "sakura", "jalan_hotel_id": "yad399001", "enabled": true}]"#,
        )
        .expect("master");
        let mut config = SyncConfig::from_env().with_data_dir(dir.path());
        config.hotel_master = None;
        let pipeline = SyncPipeline::new(config).expect("pipeline");

        scheduled_review_run(&pipeline, &[]).await;

        assert!(dir.path().join(REVIEWS_FILE).exists());
        let text = std::fs::read_to_string(dir.path().join(HEALTH_FILE)).expect("health written");
        let health: HealthReport = serde_json::from_str(&text).expect("health json");
        assert!(health.feed("sakura", health::Feed::JalanReview).is_some());
    }
}
