//! Freshness and completeness report over the persisted feeds.

use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset, Utc};
use compset_core::{
    check_finite_in_range, local_today, DatasetMeta, HotelRecord, MetaDataset, PriceDataset, ReviewStats, Source,
    Validate, ValidationError,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

pub const HEALTH_SOURCE_ID: &str = "health_check";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Ok,
    Warn,
    Error,
}

impl CheckStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckStatus::Ok => "ok",
            CheckStatus::Warn => "warn",
            CheckStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: CheckStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, JsonValue>,
}

impl HealthCheck {
    pub fn new(status: CheckStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            extra: BTreeMap::new(),
        }
    }

    pub fn ok(message: impl Into<String>) -> Self {
        Self::new(CheckStatus::Ok, message)
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self::new(CheckStatus::Warn, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(CheckStatus::Error, message)
    }

    fn with(mut self, key: &str, value: JsonValue) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feed {
    RakutenPrice,
    RakutenReview,
    JalanReview,
}

impl Feed {
    fn source(self) -> Source {
        match self {
            Feed::RakutenPrice | Feed::RakutenReview => Source::Rakuten,
            Feed::JalanReview => Source::Jalan,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedStatus {
    Ok,
    Degraded,
    Stale,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedHealth {
    pub hotel_id: String,
    pub feed: Feed,
    pub cells: u32,
    pub values: u32,
    pub confirmed_absent: u32,
    pub unknown: u32,
    pub null_ratio: f64,
    pub unknown_ratio: f64,
    /// Days since the latest source-confirmed reading; `None` if there never was one.
    pub age_days: Option<f64>,
    pub status: FeedStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub status: CheckStatus,
    pub enabled_hotels: usize,
    pub feeds_ok: usize,
    pub feeds_degraded: usize,
    pub feeds_stale: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub meta: DatasetMeta,
    pub summary: HealthSummary,
    pub checks: Vec<HealthCheck>,
    pub feeds: Vec<FeedHealth>,
}

impl HealthReport {
    pub fn feed(&self, hotel_id: &str, feed: Feed) -> Option<&FeedHealth> {
        self.feeds.iter().find(|f| f.hotel_id == hotel_id && f.feed == feed)
    }

    pub fn with_check(mut self, check: HealthCheck) -> Self {
        self.checks.push(check);
        self.summary = summarize(self.summary.enabled_hotels, &self.checks, &self.feeds);
        self
    }
}

impl Validate for HealthReport {
    fn validate(&self) -> Result<(), ValidationError> {
        for feed in &self.feeds {
            let prefix = format!("feeds.{}.{:?}", feed.hotel_id, feed.feed);
            check_finite_in_range(&format!("{prefix}.null_ratio"), feed.null_ratio, 0.0, 1.0)?;
            check_finite_in_range(&format!("{prefix}.unknown_ratio"), feed.unknown_ratio, 0.0, 1.0)?;
            if let Some(age) = feed.age_days {
                check_finite_in_range(&format!("{prefix}.age_days"), age, f64::MIN, f64::MAX)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HealthThresholds {
    pub window_days: u32,
    pub utc_offset: FixedOffset,
    pub price_max_age_days: f64,
    pub review_max_age_days: f64,
    pub last_updated_max_age_hours: f64,
    pub unknown_ratio_limit: f64,
}

fn ratio(part: u32, whole: u32) -> f64 {
    if whole == 0 {
        0.0
    } else {
        round2(f64::from(part) / f64::from(whole))
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn age_days(now: DateTime<Utc>, at: Option<DateTime<Utc>>) -> Option<f64> {
    at.map(|at| round2((now - at).num_seconds() as f64 / 86_400.0))
}

fn feed_status(unknown_ratio: f64, age_days: Option<f64>, max_age_days: f64, unknown_limit: f64) -> FeedStatus {
    match age_days {
        None => FeedStatus::Stale,
        Some(age) if age > max_age_days => FeedStatus::Stale,
        _ if unknown_ratio > unknown_limit => FeedStatus::Degraded,
        _ => FeedStatus::Ok,
    }
}

fn price_feed(hotel: &HotelRecord, prices: Option<&PriceDataset>, thresholds: &HealthThresholds, now: DateTime<Utc>) -> FeedHealth {
    let (cells, values, confirmed_absent, last_confirmed) = match prices {
        Some(dataset) => {
            let mut values = 0;
            let mut absent = 0;
            for (date, row) in &dataset.days {
                match row.get(&hotel.hotel_id) {
                    Some(Some(_)) => values += 1,
                    _ if dataset.is_no_stock(&hotel.hotel_id, *date) => absent += 1,
                    _ => {}
                }
            }
            let last = dataset
                .observed
                .get(&hotel.hotel_id)
                .and_then(|ledger| ledger.last_confirmed_at);
            (dataset.days.len() as u32, values, absent, last)
        }
        None => (thresholds.window_days, 0, 0, None),
    };
    let unknown = cells - values - confirmed_absent;
    let unknown_ratio = ratio(unknown, cells);
    let age = age_days(now, last_confirmed);
    FeedHealth {
        hotel_id: hotel.hotel_id.clone(),
        feed: Feed::RakutenPrice,
        cells,
        values,
        confirmed_absent,
        unknown,
        null_ratio: ratio(cells - values, cells),
        unknown_ratio,
        age_days: age,
        status: feed_status(unknown_ratio, age, thresholds.price_max_age_days, thresholds.unknown_ratio_limit),
    }
}

fn review_feed(
    hotel: &HotelRecord,
    feed: Feed,
    reviews: Option<&MetaDataset>,
    thresholds: &HealthThresholds,
    now: DateTime<Utc>,
) -> FeedHealth {
    let source = feed.source();
    let value = reviews.and_then(|d| d.stats(&hotel.hotel_id, source));
    let last_confirmed = reviews.and_then(|d| d.last_confirmed_at(&hotel.hotel_id, source));
    let (values, confirmed_absent, unknown) = match (value, last_confirmed) {
        (Some(_), _) => (1, 0, 0),
        (None, Some(_)) => (0, 1, 0),
        (None, None) => (0, 0, 1),
    };
    let unknown_ratio = ratio(unknown, 1);
    let age = age_days(now, last_confirmed);
    FeedHealth {
        hotel_id: hotel.hotel_id.clone(),
        feed,
        cells: 1,
        values,
        confirmed_absent,
        unknown,
        null_ratio: ratio(1 - values, 1),
        unknown_ratio,
        age_days: age,
        status: feed_status(unknown_ratio, age, thresholds.review_max_age_days, thresholds.unknown_ratio_limit),
    }
}

fn price_checks(hotels: &[HotelRecord], prices: Option<&PriceDataset>, thresholds: &HealthThresholds, now: DateTime<Utc>) -> Vec<HealthCheck> {
    let Some(dataset) = prices else {
        return vec![HealthCheck::warn("competitor_min_prices.json not found")];
    };
    let mut checks = Vec::new();

    let window = dataset.meta.window_days;
    if window != Some(thresholds.window_days) {
        checks.push(
            HealthCheck::warn(format!("window_days != {}: {window:?}", thresholds.window_days))
                .with("window_days", json!(window)),
        );
    }
    let expected_start = local_today(now, thresholds.utc_offset);
    let first = dataset.days.keys().next().copied();
    if first != Some(expected_start) {
        checks.push(
            HealthCheck::warn(format!("window starts at {first:?}, expected {expected_start}"))
                .with("expected_start", json!(expected_start)),
        );
    }

    let mut missing_keys = 0u32;
    let mut nulls = 0u32;
    let mut cells = 0u32;
    for row in dataset.days.values() {
        for hotel in hotels.iter().filter(|h| h.enabled && h.listed_on(Source::Rakuten)) {
            cells += 1;
            match row.get(&hotel.hotel_id) {
                None => missing_keys += 1,
                Some(None) => nulls += 1,
                Some(Some(_)) => {}
            }
        }
    }
    let days = dataset.days.len();
    let status = if missing_keys > 0 || days != thresholds.window_days as usize {
        CheckStatus::Warn
    } else {
        CheckStatus::Ok
    };
    checks.push(
        HealthCheck::new(status, format!("competitor_min_prices.json days={days} / cells={cells}"))
            .with("missing_keys", json!(missing_keys))
            .with("null_ratio", json!(ratio(nulls, cells))),
    );

    checks.push(match dataset.meta.last_updated {
        None => HealthCheck::warn("competitor_min_prices.json has no last_updated"),
        Some(at) => {
            let hours = round2((now - at).num_seconds() as f64 / 3600.0);
            let status = if hours <= thresholds.last_updated_max_age_hours {
                CheckStatus::Ok
            } else {
                CheckStatus::Warn
            };
            HealthCheck::new(status, format!("prices last_updated {hours:.2}h ago")).with("hours", json!(hours))
        }
    });
    checks
}

fn review_checks(reviews: Option<&MetaDataset>, thresholds: &HealthThresholds, now: DateTime<Utc>) -> Vec<HealthCheck> {
    let Some(dataset) = reviews else {
        return vec![HealthCheck::warn("ota_facility_meta.json not found")];
    };
    let mut bad_values = 0u32;
    for reviews in dataset.hotels.values() {
        for source in Source::ALL {
            if let Some(stats) = reviews.get(source) {
                let valid = stats.review_avg.is_finite() && (0.0..=ReviewStats::MAX_AVG).contains(&stats.review_avg);
                if !valid {
                    bad_values += 1;
                }
            }
        }
    }
    let mut checks = vec![HealthCheck::new(
        if bad_values == 0 { CheckStatus::Ok } else { CheckStatus::Error },
        format!("ota_facility_meta.json hotels={}", dataset.hotels.len()),
    )
    .with("bad_values", json!(bad_values))];

    if let Some(at) = dataset.meta.last_updated {
        let days = round2((now - at).num_seconds() as f64 / 86_400.0);
        let status = if days <= thresholds.review_max_age_days {
            CheckStatus::Ok
        } else {
            CheckStatus::Warn
        };
        checks.push(HealthCheck::new(status, format!("reviews last_updated {days:.2}d ago")).with("days", json!(days)));
    }
    checks
}

fn summarize(enabled_hotels: usize, checks: &[HealthCheck], feeds: &[FeedHealth]) -> HealthSummary {
    let count = |status: FeedStatus| feeds.iter().filter(|f| f.status == status).count();
    let feeds_stale = count(FeedStatus::Stale);
    let feeds_degraded = count(FeedStatus::Degraded);
    let mut status = checks.iter().map(|c| c.status).max().unwrap_or(CheckStatus::Ok);
    if feeds_stale + feeds_degraded > 0 {
        status = status.max(CheckStatus::Warn);
    }
    HealthSummary {
        status,
        enabled_hotels,
        feeds_ok: count(FeedStatus::Ok),
        feeds_degraded,
        feeds_stale,
    }
}

/// Computes the health report from the registry and the persisted feeds.
pub fn report(
    hotels: &[HotelRecord],
    prices: Option<&PriceDataset>,
    reviews: Option<&MetaDataset>,
    thresholds: &HealthThresholds,
    now: DateTime<Utc>,
) -> HealthReport {
    let enabled: Vec<&HotelRecord> = hotels.iter().filter(|h| h.enabled).collect();

    let mut checks = vec![HealthCheck::ok(format!("hotel master: enabled={}", enabled.len()))];
    checks.extend(price_checks(hotels, prices, thresholds, now));
    checks.extend(review_checks(reviews, thresholds, now));

    let mut feeds = Vec::new();
    for hotel in &enabled {
        if hotel.listed_on(Source::Rakuten) {
            feeds.push(price_feed(hotel, prices, thresholds, now));
            feeds.push(review_feed(hotel, Feed::RakutenReview, reviews, thresholds, now));
        }
        if hotel.listed_on(Source::Jalan) {
            feeds.push(review_feed(hotel, Feed::JalanReview, reviews, thresholds, now));
        }
    }

    HealthReport {
        meta: DatasetMeta {
            currency: None,
            source: HEALTH_SOURCE_ID.to_string(),
            window_days: Some(thresholds.window_days),
            last_updated: Some(now),
        },
        summary: summarize(enabled.len(), &checks, &feeds),
        checks,
        feeds,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate, TimeZone};
    use compset_core::Reading;

    fn thresholds() -> HealthThresholds {
        HealthThresholds {
            window_days: 3,
            utc_offset: FixedOffset::east_opt(9 * 3600).expect("jst"),
            price_max_age_days: 2.0,
            review_max_age_days: 8.0,
            last_updated_max_age_hours: 26.0,
            unknown_ratio_limit: 0.5,
        }
    }

    fn hotel(id: &str, jalan: bool) -> HotelRecord {
        HotelRecord {
            hotel_id: id.to_string(),
            rakuten_hotel_no: Some(1),
            jalan_hotel_id: jalan.then(|| "yad1".to_string()),
            enabled: true,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 3, 0, 0).single().expect("now")
    }

    fn start() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 19).expect("date")
    }

    #[test]
    fn no_stock_counts_as_confirmed_absent_not_unknown() {
        let hotels = vec![hotel("h1", false), hotel("h2", false)];
        let mut prices = PriceDataset::empty(3);
        prices.roll_to(start(), 3, ["h1", "h2"]);
        for offset in 0..3 {
            let date = start() + Duration::days(offset);
            prices.apply("h1", date, Reading::Unknown, now());
            prices.apply("h2", date, Reading::ConfirmedAbsent, now());
        }
        prices.meta.last_updated = Some(now());

        let report = report(&hotels, Some(&prices), None, &thresholds(), now());
        let h2 = report.feed("h2", Feed::RakutenPrice).expect("h2 feed");
        assert_eq!((h2.confirmed_absent, h2.unknown, h2.null_ratio), (3, 0, 1.0));
        assert_eq!(h2.status, FeedStatus::Ok);

        let h1 = report.feed("h1", Feed::RakutenPrice).expect("h1 feed");
        assert_eq!((h1.unknown, h1.unknown_ratio), (3, 1.0));
        assert_eq!(h1.status, FeedStatus::Stale);
        assert_eq!(report.summary.status, CheckStatus::Warn);
    }

    #[test]
    fn old_confirmation_is_stale_and_high_unknown_ratio_is_degraded() {
        let hotels = vec![hotel("h1", false)];
        let mut prices = PriceDataset::empty(3);
        prices.roll_to(start(), 3, ["h1"]);
        prices.apply("h1", start(), Reading::Confirmed(10_000), now() - Duration::hours(2));
        let report_now = report(&hotels, Some(&prices), None, &thresholds(), now());
        assert_eq!(report_now.feed("h1", Feed::RakutenPrice).map(|f| f.status), Some(FeedStatus::Degraded));

        let later = now() + Duration::days(5);
        let report_later = report(&hotels, Some(&prices), None, &thresholds(), later);
        assert_eq!(report_later.feed("h1", Feed::RakutenPrice).map(|f| f.status), Some(FeedStatus::Stale));
    }

    #[test]
    fn file_checks_flag_window_and_missing_keys() {
        let hotels = vec![hotel("h1", false), hotel("late", false)];
        let mut prices = PriceDataset::empty(2);
        prices.roll_to(start(), 2, ["h1"]);
        prices.meta.last_updated = Some(now() - Duration::hours(30));

        let report = report(&hotels, Some(&prices), None, &thresholds(), now());
        let warned: Vec<&str> = report
            .checks
            .iter()
            .filter(|c| c.status == CheckStatus::Warn)
            .map(|c| c.message.as_str())
            .collect();
        assert!(warned.iter().any(|m| m.starts_with("window_days != 3")));
        assert!(warned.iter().any(|m| m.starts_with("competitor_min_prices.json days=2")));
        assert!(warned.iter().any(|m| m.starts_with("prices last_updated")));
        let cells = report
            .checks
            .iter()
            .find(|c| c.message.starts_with("competitor_min_prices.json days="))
            .expect("cells check");
        assert_eq!(cells.extra.get("missing_keys"), Some(&json!(2)));
    }

    #[test]
    fn review_feeds_follow_listing_and_ledger() {
        let hotels = vec![hotel("h1", true)];
        let mut reviews = MetaDataset::default();
        reviews.apply(
            "h1",
            Source::Rakuten,
            Reading::Confirmed(ReviewStats::new(4.2, 10).expect("stats")),
            now(),
        );
        reviews.apply("h1", Source::Jalan, Reading::ConfirmedAbsent, now());

        let report = report(&hotels, None, Some(&reviews), &thresholds(), now());
        let rakuten = report.feed("h1", Feed::RakutenReview).expect("rakuten");
        assert_eq!((rakuten.values, rakuten.status), (1, FeedStatus::Ok));
        let jalan = report.feed("h1", Feed::JalanReview).expect("jalan");
        assert_eq!((jalan.confirmed_absent, jalan.unknown, jalan.status), (1, 0, FeedStatus::Ok));
        assert!(report.validate().is_ok());
    }

    #[test]
    fn missing_files_are_warnings_and_extra_checks_raise_summary() {
        let report = report(&[hotel("h1", false)], None, None, &thresholds(), now());
        assert_eq!(report.summary.status, CheckStatus::Warn);
        assert_eq!(report.feed("h1", Feed::RakutenPrice).map(|f| f.cells), Some(3));

        let report = report.with_check(HealthCheck::error("corrupt prices"));
        assert_eq!(report.summary.status, CheckStatus::Error);
    }
}
