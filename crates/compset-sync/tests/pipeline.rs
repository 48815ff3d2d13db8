use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone, Utc};
use compset_adapters::{Fetched, FetchFailure, PriceExtractor, ReviewExtractor};
use compset_core::{window_dates, HotelRecord, MetaDataset, PriceDataset, Reading, ReviewStats, Source};
use compset_storage::{read_dataset, write_dataset, BackoffPolicy};
use compset_sync::health::{Feed, FeedStatus};
use compset_sync::{report, run_price_job, run_review_job, HealthThresholds, JobOptions};

#[derive(Clone, Copy)]
enum Behaviour {
    Price(u32),
    NoStock,
    RateLimited,
    Hang,
}

struct FakePrices {
    behaviour: HashMap<String, Behaviour>,
    calls: AtomicUsize,
}

impl FakePrices {
    fn new(behaviour: &[(&str, Behaviour)]) -> Arc<Self> {
        Arc::new(Self {
            behaviour: behaviour.iter().map(|(id, b)| (id.to_string(), *b)).collect(),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl PriceExtractor for FakePrices {
    fn source(&self) -> Source {
        Source::Rakuten
    }

    async fn fetch_price(&self, hotel: &HotelRecord, _checkin: NaiveDate) -> Result<Fetched<u32>, FetchFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.behaviour.get(&hotel.hotel_id).copied() {
            Some(Behaviour::Price(price)) => Ok(Fetched::Value(price)),
            Some(Behaviour::NoStock) => Ok(Fetched::NoStock),
            Some(Behaviour::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(FetchFailure::Unavailable("hung".into()))
            }
            Some(Behaviour::RateLimited) | None => Err(FetchFailure::RateLimited { retry_after: None }),
        }
    }
}

struct FakeReviews {
    source: Source,
    stats: Option<ReviewStats>,
}

#[async_trait]
impl ReviewExtractor for FakeReviews {
    fn source(&self) -> Source {
        self.source
    }

    async fn fetch_reviews(&self, _hotel: &HotelRecord) -> Result<Fetched<ReviewStats>, FetchFailure> {
        match self.stats {
            Some(stats) => Ok(Fetched::Value(stats)),
            None => Err(FetchFailure::ExtractionFailed("layout changed".into())),
        }
    }
}

fn hotel(id: &str) -> HotelRecord {
    HotelRecord {
        hotel_id: id.to_string(),
        rakuten_hotel_no: Some(100),
        jalan_hotel_id: Some(format!("yad{}", id.len())),
        enabled: true,
    }
}

fn now() -> DateTime<Utc> {
    // 2026-10-19 09:00 JST
    Utc.with_ymd_and_hms(2026, 10, 19, 0, 0, 0).single().expect("now")
}

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 10, 19).expect("today")
}

fn options() -> JobOptions {
    JobOptions {
        backoff: BackoffPolicy::immediate(3),
        ..JobOptions::default()
    }
}

fn thresholds() -> HealthThresholds {
    HealthThresholds {
        window_days: 28,
        utc_offset: FixedOffset::east_opt(9 * 3600).expect("jst"),
        price_max_age_days: 2.0,
        review_max_age_days: 8.0,
        last_updated_max_age_hours: 26.0,
        unknown_ratio_limit: 0.5,
    }
}

async fn seed_prior(path: &Path, hotel_id: &str, date: NaiveDate, price: u32) {
    let mut prior = PriceDataset::empty(28);
    prior.roll_to(today(), 28, [hotel_id]);
    prior.apply(hotel_id, date, Reading::Confirmed(price), now() - chrono::Duration::days(1));
    prior.meta.last_updated = Some(now() - chrono::Duration::days(1));
    write_dataset(path, &prior).await.expect("seed prior");
}

#[tokio::test]
async fn rate_limited_hotel_keeps_prior_price_and_no_stock_is_null() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("competitor_min_prices.json");
    let target = today() + chrono::Duration::days(3);
    seed_prior(&path, "H1", target, 12_000).await;

    let hotels = vec![hotel("H1"), hotel("H2")];
    let extractor = FakePrices::new(&[("H1", Behaviour::RateLimited), ("H2", Behaviour::NoStock)]);
    let summary = run_price_job(&hotels, extractor.clone(), &options(), &path, now())
        .await
        .expect("price job");

    // H1: three attempts per date, H2: one
    assert_eq!(extractor.calls.load(Ordering::SeqCst), 28 * 3 + 28);
    assert_eq!(summary.counts.unknown, 28);
    assert_eq!(summary.counts.confirmed_absent, 28);

    let written: PriceDataset = read_dataset(&path).await.expect("read").expect("present");
    assert_eq!(written.price("H1", target), Some(12_000));
    assert_eq!(written.price("H2", target), None);
    assert_eq!(written.days[&target].get("H2"), Some(&None));
    assert!(written.is_no_stock("H2", target));

    let raw = std::fs::read_to_string(&path).expect("raw");
    assert!(raw.contains("\"H2\": null"));

    let health = report(&hotels, Some(&written), None, &thresholds(), now());
    let h2 = health.feed("H2", Feed::RakutenPrice).expect("h2");
    assert_eq!((h2.confirmed_absent, h2.unknown), (28, 0));
    assert_ne!(h2.status, FeedStatus::Stale);
}

#[tokio::test]
async fn successful_run_writes_exactly_the_window_in_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("competitor_min_prices.json");
    // a prior file from three days ago has dates that must be evicted
    let mut prior = PriceDataset::empty(28);
    prior.roll_to(today() - chrono::Duration::days(3), 28, ["H1"]);
    write_dataset(&path, &prior).await.expect("seed");

    let hotels = vec![hotel("H1")];
    let extractor = FakePrices::new(&[("H1", Behaviour::Price(9_800))]);
    run_price_job(&hotels, extractor, &options(), &path, now())
        .await
        .expect("price job");

    let raw = std::fs::read_to_string(&path).expect("raw");
    let value: serde_json::Value = serde_json::from_str(&raw).expect("json");
    let keys: Vec<String> = value["days"]
        .as_object()
        .expect("days object")
        .keys()
        .cloned()
        .collect();
    let expected: Vec<String> = window_dates(today(), 28)
        .into_iter()
        .map(|d| d.format("%Y-%m-%d").to_string())
        .collect();
    assert_eq!(keys, expected);
    assert_eq!(value["meta"]["window_days"], 28);
    assert_eq!(value["meta"]["currency"], "JPY");
    assert_eq!(value["days"]["2026-10-19"]["H1"], 9800);
}

#[tokio::test]
async fn run_timeout_aborts_fetches_and_preserves_prior() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("competitor_min_prices.json");
    seed_prior(&path, "H1", today(), 15_500).await;

    let hotels = vec![hotel("H1"), hotel("H2")];
    let extractor = FakePrices::new(&[("H1", Behaviour::Hang), ("H2", Behaviour::Price(8_000))]);
    let opts = JobOptions {
        run_timeout: Duration::from_millis(300),
        concurrency: 64,
        ..options()
    };
    let summary = run_price_job(&hotels, extractor, &opts, &path, now())
        .await
        .expect("price job");

    assert!(summary.timed_out);
    let written: PriceDataset = read_dataset(&path).await.expect("read").expect("present");
    assert_eq!(written.price("H1", today()), Some(15_500));
    assert_eq!(written.price("H2", today()), Some(8_000));
}

#[tokio::test]
async fn corrupt_prior_file_aborts_without_replacing_it() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("competitor_min_prices.json");
    std::fs::write(&path, "{ not json").expect("write garbage");

    let extractor = FakePrices::new(&[("H1", Behaviour::Price(1))]);
    let result = run_price_job(&[hotel("H1")], extractor, &options(), &path, now()).await;
    assert!(result.is_err());
    assert_eq!(std::fs::read_to_string(&path).expect("raw"), "{ not json");
}

#[tokio::test]
async fn review_failure_on_one_source_leaves_the_other_untouched() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("ota_facility_meta.json");
    let prior_jalan = ReviewStats::new(4.3, 210).expect("stats");
    let mut prior = MetaDataset::default();
    prior.apply("H1", Source::Jalan, Reading::Confirmed(prior_jalan), now());
    write_dataset(&path, &prior).await.expect("seed");

    let fresh_rakuten = ReviewStats::new(4.51, 999).expect("stats");
    let extractors: Vec<Arc<dyn ReviewExtractor>> = vec![
        Arc::new(FakeReviews {
            source: Source::Rakuten,
            stats: Some(fresh_rakuten),
        }),
        Arc::new(FakeReviews {
            source: Source::Jalan,
            stats: None,
        }),
    ];
    let summary = run_review_job(&[hotel("H1")], &extractors, &options(), &path, now())
        .await
        .expect("review job");
    assert_eq!(summary.counts.confirmed, 1);
    assert_eq!(summary.counts.unknown, 1);

    let written: MetaDataset = read_dataset(&path).await.expect("read").expect("present");
    assert_eq!(written.stats("H1", Source::Rakuten), Some(fresh_rakuten));
    assert_eq!(written.stats("H1", Source::Jalan), Some(prior_jalan));
    assert_eq!(written.meta.source, "ota_reviews");
}

#[tokio::test]
async fn review_file_without_meta_envelope_is_merged_not_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("ota_facility_meta.json");
    std::fs::write(
        &path,
        r#"{"hotels":{"H1":{"jalan":{"review_avg":4.3,"review_count":210}}}}"#,
    )
    .expect("seed");

    let extractors: Vec<Arc<dyn ReviewExtractor>> = vec![Arc::new(FakeReviews {
        source: Source::Jalan,
        stats: None,
    })];
    let summary = run_review_job(&[hotel("H1")], &extractors, &options(), &path, now())
        .await
        .expect("review job");
    assert_eq!(summary.counts.unknown, 1);

    let written: MetaDataset = read_dataset(&path).await.expect("read").expect("present");
    assert_eq!(written.stats("H1", Source::Jalan), ReviewStats::new(4.3, 210));
    assert_eq!(written.meta.source, "ota_reviews");
    assert_eq!(written.meta.last_updated, Some(now()));
}

#[tokio::test]
async fn hotels_without_a_rakuten_listing_get_no_price_keys() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("competitor_min_prices.json");
    let jalan_only = HotelRecord {
        rakuten_hotel_no: None,
        ..hotel("sakura")
    };
    let hotels = vec![hotel("H1"), jalan_only];
    let extractor = FakePrices::new(&[("H1", Behaviour::Price(11_000))]);
    run_price_job(&hotels, extractor.clone(), &options(), &path, now())
        .await
        .expect("price job");
    assert_eq!(extractor.calls.load(Ordering::SeqCst), 28);

    let written: PriceDataset = read_dataset(&path).await.expect("read").expect("present");
    assert_eq!(written.days.len(), 28);
    assert!(written.days.values().all(|row| !row.contains_key("sakura")));
    assert!(written.days.values().all(|row| row.get("H1") == Some(&Some(11_000))));

    let health = report(&hotels, Some(&written), None, &thresholds(), now());
    let file_check = health
        .checks
        .iter()
        .find(|c| c.message.starts_with("competitor_min_prices.json days="))
        .expect("file check");
    assert_eq!(file_check.extra["missing_keys"], 0);
    assert_eq!(file_check.extra["null_ratio"], 0.0);
    assert!(health.feed("sakura", Feed::RakutenPrice).is_none());
}
