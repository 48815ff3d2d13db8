//! Core domain model for competitor price and review tracking.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Days, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "compset-core";

pub const DEFAULT_WINDOW_DAYS: u32 = 28;
pub const PRICE_CURRENCY: &str = "JPY";
pub const PRICE_SOURCE_ID: &str = "rakuten_travel";
pub const REVIEW_SOURCE_ID: &str = "ota_reviews";

/// Online travel agency a reading was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Rakuten,
    Jalan,
}

impl Source {
    pub const ALL: [Source; 2] = [Source::Rakuten, Source::Jalan];

    pub fn as_str(self) -> &'static str {
        match self {
            Source::Rakuten => "rakuten",
            Source::Jalan => "jalan",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "rakuten" => Some(Source::Rakuten),
            "jalan" => Some(Source::Jalan),
            _ => None,
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the manually maintained hotel master list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HotelRecord {
    #[serde(alias = "id")]
    pub hotel_id: String,
    #[serde(default)]
    pub rakuten_hotel_no: Option<u64>,
    #[serde(default)]
    pub jalan_hotel_id: Option<String>,
    #[serde(default)]
    pub enabled: bool,
}

impl HotelRecord {
    /// Identifier used by `source` for this hotel, if the hotel is listed there.
    pub fn source_ref(&self, source: Source) -> Option<String> {
        match source {
            Source::Rakuten => self.rakuten_hotel_no.map(|no| no.to_string()),
            Source::Jalan => self
                .jalan_hotel_id
                .as_deref()
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(ToString::to_string),
        }
    }

    pub fn listed_on(&self, source: Source) -> bool {
        self.source_ref(source).is_some()
    }
}

/// Review average and count as published by one OTA.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReviewStats {
    pub review_avg: f64,
    pub review_count: u32,
}

impl ReviewStats {
    pub const MAX_AVG: f64 = 5.0;

    /// Builds a structurally valid pair, rounding the average to two decimals.
    pub fn new(review_avg: f64, review_count: u32) -> Option<Self> {
        if !review_avg.is_finite() || !(0.0..=Self::MAX_AVG).contains(&review_avg) {
            return None;
        }
        Some(Self {
            review_avg: (review_avg * 100.0).round() / 100.0,
            review_count,
        })
    }
}

/// Outcome of one acquisition attempt for a single key.
///
/// `ConfirmedAbsent` is a source-verified "nothing here" (sold out, no reviews),
/// while `Unknown` means the run could not learn anything for the key.
#[derive(Debug, Clone, PartialEq)]
pub enum Reading<V> {
    Confirmed(V),
    ConfirmedAbsent,
    Unknown,
}

impl<V> Reading<V> {
    /// True when the source itself answered for this key.
    pub fn is_confirmed(&self) -> bool {
        !matches!(self, Reading::Unknown)
    }

    pub fn map<U>(self, f: impl FnOnce(V) -> U) -> Reading<U> {
        match self {
            Reading::Confirmed(v) => Reading::Confirmed(f(v)),
            Reading::ConfirmedAbsent => Reading::ConfirmedAbsent,
            Reading::Unknown => Reading::Unknown,
        }
    }
}

/// Combines the persisted value for a key with this run's reading.
///
/// Only a source confirmation may change a known value; `Unknown` keeps
/// whatever was there before, and defaults to absent on first observation.
pub fn merge<V>(prior: Option<V>, fresh: Reading<V>) -> Option<V> {
    match fresh {
        Reading::Confirmed(v) => Some(v),
        Reading::ConfirmedAbsent => None,
        Reading::Unknown => prior,
    }
}

/// Envelope written at the top of every published dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_days: Option<u32>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid value at {field}: {reason}")]
pub struct ValidationError {
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Numeric sanity check every dataset passes before it may be written.
pub trait Validate {
    fn validate(&self) -> Result<(), ValidationError>;
}

/// Rejects NaN, infinities and values outside `[min, max]`.
pub fn check_finite_in_range(field: &str, value: f64, min: f64, max: f64) -> Result<(), ValidationError> {
    if value.is_nan() {
        return Err(ValidationError::new(field, "NaN is not allowed"));
    }
    if value.is_infinite() {
        return Err(ValidationError::new(field, "infinite values are not allowed"));
    }
    if value < min || value > max {
        return Err(ValidationError::new(
            field,
            format!("{value} is outside [{min}, {max}]"),
        ));
    }
    Ok(())
}

/// Calendar date "today" in the fixed local reference used for check-in dates.
pub fn local_today(now: DateTime<Utc>, offset: FixedOffset) -> NaiveDate {
    now.with_timezone(&offset).date_naive()
}

/// The `window_days` consecutive dates starting at `start`.
pub fn window_dates(start: NaiveDate, window_days: u32) -> Vec<NaiveDate> {
    (0..window_days as u64)
        .filter_map(|offset| start.checked_add_days(Days::new(offset)))
        .collect()
}

/// Per-hotel bookkeeping that lets health checks tell confirmed emptiness from staleness.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceLedger {
    #[serde(default)]
    pub last_confirmed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub no_stock_dates: BTreeSet<NaiveDate>,
}

/// Rolling window of minimum prices, keyed by check-in date then hotel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceDataset {
    pub meta: DatasetMeta,
    #[serde(default)]
    pub days: BTreeMap<NaiveDate, BTreeMap<String, Option<u32>>>,
    #[serde(default)]
    pub observed: BTreeMap<String, PriceLedger>,
}

impl PriceDataset {
    pub fn empty(window_days: u32) -> Self {
        Self {
            meta: DatasetMeta {
                currency: Some(PRICE_CURRENCY.to_string()),
                source: PRICE_SOURCE_ID.to_string(),
                window_days: Some(window_days),
                last_updated: None,
            },
            days: BTreeMap::new(),
            observed: BTreeMap::new(),
        }
    }

    pub fn window_days(&self) -> u32 {
        self.meta.window_days.unwrap_or(DEFAULT_WINDOW_DAYS)
    }

    /// Moves the window so it covers exactly `window_days` dates from `start`.
    ///
    /// Dates outside the window are evicted, missing dates are appended, and
    /// every listed hotel gets a key on every date (absent when never observed).
    pub fn roll_to<'a>(
        &mut self,
        start: NaiveDate,
        window_days: u32,
        hotel_ids: impl IntoIterator<Item = &'a str>,
    ) {
        let dates = window_dates(start, window_days);
        let keep: BTreeSet<NaiveDate> = dates.iter().copied().collect();
        self.days.retain(|date, _| keep.contains(date));
        for ledger in self.observed.values_mut() {
            ledger.no_stock_dates.retain(|date| keep.contains(date));
        }

        let hotel_ids: Vec<&str> = hotel_ids.into_iter().collect();
        for date in dates {
            let row = self.days.entry(date).or_default();
            for hotel_id in &hotel_ids {
                row.entry((*hotel_id).to_string()).or_insert(None);
            }
        }
        self.meta.window_days = Some(window_days);
    }

    pub fn price(&self, hotel_id: &str, date: NaiveDate) -> Option<u32> {
        self.days
            .get(&date)
            .and_then(|row| row.get(hotel_id))
            .copied()
            .flatten()
    }

    /// Merges one reading into the (hotel, date) cell.
    pub fn apply(
        &mut self,
        hotel_id: &str,
        date: NaiveDate,
        reading: Reading<u32>,
        observed_at: DateTime<Utc>,
    ) {
        let confirmed = reading.is_confirmed();
        let no_stock = matches!(reading, Reading::ConfirmedAbsent);
        let prior = self.price(hotel_id, date);
        let merged = merge(prior, reading);
        self.days
            .entry(date)
            .or_default()
            .insert(hotel_id.to_string(), merged);

        if confirmed {
            let ledger = self.observed.entry(hotel_id.to_string()).or_default();
            ledger.last_confirmed_at = Some(
                ledger
                    .last_confirmed_at
                    .map_or(observed_at, |prev| prev.max(observed_at)),
            );
            if no_stock {
                ledger.no_stock_dates.insert(date);
            } else {
                ledger.no_stock_dates.remove(&date);
            }
        }
    }

    pub fn is_no_stock(&self, hotel_id: &str, date: NaiveDate) -> bool {
        self.observed
            .get(hotel_id)
            .is_some_and(|ledger| ledger.no_stock_dates.contains(&date))
    }
}

impl Validate for PriceDataset {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.meta.window_days == Some(0) {
            return Err(ValidationError::new("meta.window_days", "window must not be empty"));
        }
        Ok(())
    }
}

/// Latest review stats for one hotel; `None` is a confirmed or never-observed absence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HotelReviews {
    #[serde(default)]
    pub rakuten: Option<ReviewStats>,
    #[serde(default)]
    pub jalan: Option<ReviewStats>,
}

impl HotelReviews {
    pub fn get(&self, source: Source) -> Option<ReviewStats> {
        match source {
            Source::Rakuten => self.rakuten,
            Source::Jalan => self.jalan,
        }
    }

    fn slot_mut(&mut self, source: Source) -> &mut Option<ReviewStats> {
        match source {
            Source::Rakuten => &mut self.rakuten,
            Source::Jalan => &mut self.jalan,
        }
    }
}

/// Review metadata per hotel and OTA. Not windowed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaDataset {
    /// Older review files carry only `hotels`; they load with a fresh envelope.
    #[serde(default = "review_meta")]
    pub meta: DatasetMeta,
    #[serde(default)]
    pub hotels: BTreeMap<String, HotelReviews>,
    #[serde(default)]
    pub observed: BTreeMap<String, BTreeMap<Source, DateTime<Utc>>>,
}

fn review_meta() -> DatasetMeta {
    DatasetMeta {
        currency: None,
        source: REVIEW_SOURCE_ID.to_string(),
        window_days: None,
        last_updated: None,
    }
}

impl Default for MetaDataset {
    fn default() -> Self {
        Self {
            meta: review_meta(),
            hotels: BTreeMap::new(),
            observed: BTreeMap::new(),
        }
    }
}

impl MetaDataset {
    pub fn stats(&self, hotel_id: &str, source: Source) -> Option<ReviewStats> {
        self.hotels.get(hotel_id).and_then(|h| h.get(source))
    }

    pub fn last_confirmed_at(&self, hotel_id: &str, source: Source) -> Option<DateTime<Utc>> {
        self.observed
            .get(hotel_id)
            .and_then(|by_source| by_source.get(&source))
            .copied()
    }

    /// Merges one reading into the (hotel, source) slot, leaving other sources untouched.
    pub fn apply(
        &mut self,
        hotel_id: &str,
        source: Source,
        reading: Reading<ReviewStats>,
        observed_at: DateTime<Utc>,
    ) {
        let confirmed = reading.is_confirmed();
        let entry = self.hotels.entry(hotel_id.to_string()).or_default();
        let slot = entry.slot_mut(source);
        *slot = merge(*slot, reading);

        if confirmed {
            self.observed
                .entry(hotel_id.to_string())
                .or_default()
                .insert(source, observed_at);
        }
    }
}

impl Validate for MetaDataset {
    fn validate(&self) -> Result<(), ValidationError> {
        for (hotel_id, reviews) in &self.hotels {
            for source in Source::ALL {
                if let Some(stats) = reviews.get(source) {
                    check_finite_in_range(
                        &format!("hotels.{hotel_id}.{source}.review_avg"),
                        stats.review_avg,
                        0.0,
                        ReviewStats::MAX_AVG,
                    )?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn ts(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, h, 0, 0).single().unwrap()
    }

    #[test]
    fn merge_policy_table() {
        assert_eq!(merge(Some(1), Reading::Confirmed(2)), Some(2));
        assert_eq!(merge(None, Reading::Confirmed(2)), Some(2));
        assert_eq!(merge(Some(1), Reading::<i32>::ConfirmedAbsent), None);
        assert_eq!(merge(None, Reading::<i32>::ConfirmedAbsent), None);
        assert_eq!(merge(Some(1), Reading::Unknown), Some(1));
        assert_eq!(merge(None::<i32>, Reading::Unknown), None);
    }

    proptest! {
        #[test]
        fn unknown_never_regresses_a_known_value(prior in any::<u32>()) {
            prop_assert_eq!(merge(Some(prior), Reading::Unknown), Some(prior));
        }

        #[test]
        fn confirmed_absent_always_clears(prior in proptest::option::of(any::<u32>())) {
            prop_assert_eq!(merge(prior, Reading::ConfirmedAbsent), None);
        }

        #[test]
        fn confirmed_value_always_wins(prior in proptest::option::of(any::<u32>()), fresh in any::<u32>()) {
            prop_assert_eq!(merge(prior, Reading::Confirmed(fresh)), Some(fresh));
        }
    }

    #[test]
    fn local_today_uses_fixed_offset() {
        let jst = FixedOffset::east_opt(9 * 3600).unwrap();
        let late_utc = Utc.with_ymd_and_hms(2026, 10, 19, 16, 30, 0).single().unwrap();
        assert_eq!(local_today(late_utc, jst), date(2026, 10, 20));
    }

    #[test]
    fn roll_evicts_oldest_and_keeps_exact_window() {
        let mut ds = PriceDataset::empty(28);
        let start = date(2026, 10, 19);
        ds.roll_to(start, 28, ["H1"]);
        assert_eq!(ds.days.len(), 28);
        ds.apply("H1", start, Reading::ConfirmedAbsent, ts(1));

        let next = date(2026, 10, 20);
        ds.roll_to(next, 28, ["H1"]);
        assert_eq!(ds.days.len(), 28);
        assert!(!ds.days.contains_key(&start));
        assert_eq!(ds.days.keys().next(), Some(&next));
        assert_eq!(ds.days.keys().last(), Some(&date(2026, 11, 16)));
        assert!(ds.observed["H1"].no_stock_dates.is_empty());
    }

    #[test]
    fn roll_adds_keys_for_new_hotels_without_touching_prices() {
        let mut ds = PriceDataset::empty(3);
        let start = date(2026, 10, 19);
        ds.roll_to(start, 3, ["H1"]);
        ds.apply("H1", start, Reading::Confirmed(12000), ts(1));
        ds.roll_to(start, 3, ["H1", "H2"]);
        assert_eq!(ds.price("H1", start), Some(12000));
        assert_eq!(ds.days[&start].get("H2"), Some(&None));
    }

    #[test]
    fn price_apply_tracks_confirmations() {
        let mut ds = PriceDataset::empty(28);
        let d = date(2026, 10, 19);
        ds.apply("H1", d, Reading::Confirmed(12000), ts(1));
        ds.apply("H1", d, Reading::Unknown, ts(2));
        assert_eq!(ds.price("H1", d), Some(12000));
        assert_eq!(ds.observed["H1"].last_confirmed_at, Some(ts(1)));

        ds.apply("H1", d, Reading::ConfirmedAbsent, ts(3));
        assert_eq!(ds.price("H1", d), None);
        assert!(ds.is_no_stock("H1", d));

        ds.apply("H1", d, Reading::Confirmed(9800), ts(4));
        assert!(!ds.is_no_stock("H1", d));
        assert_eq!(ds.observed["H1"].last_confirmed_at, Some(ts(4)));
    }

    #[test]
    fn review_apply_leaves_other_source_untouched() {
        let mut ds = MetaDataset::default();
        let jalan = ReviewStats::new(4.3, 120).unwrap();
        ds.apply("H1", Source::Jalan, Reading::Confirmed(jalan), ts(1));
        ds.apply("H1", Source::Rakuten, Reading::Unknown, ts(2));
        assert_eq!(ds.stats("H1", Source::Jalan), Some(jalan));
        assert_eq!(ds.stats("H1", Source::Rakuten), None);
        assert_eq!(ds.last_confirmed_at("H1", Source::Rakuten), None);
        assert_eq!(ds.last_confirmed_at("H1", Source::Jalan), Some(ts(1)));
    }

    #[test]
    fn review_stats_round_and_reject_out_of_range() {
        assert_eq!(ReviewStats::new(4.266, 10).unwrap().review_avg, 4.27);
        assert!(ReviewStats::new(f64::NAN, 10).is_none());
        assert!(ReviewStats::new(5.5, 10).is_none());
        assert!(ReviewStats::new(-0.1, 10).is_none());
    }

    #[test]
    fn meta_validation_rejects_non_finite_averages() {
        let mut ds = MetaDataset::default();
        ds.hotels.insert(
            "H1".into(),
            HotelReviews {
                rakuten: Some(ReviewStats {
                    review_avg: f64::INFINITY,
                    review_count: 3,
                }),
                jalan: None,
            },
        );
        let err = ds.validate().unwrap_err();
        assert_eq!(err.field, "hotels.H1.rakuten.review_avg");
    }

    #[test]
    fn hotel_record_accepts_id_alias() {
        let rec: HotelRecord = serde_json::from_str(
            r#"{"id":"H1","rakuten_hotel_no":12345,"jalan_hotel_id":"yad318123","enabled":true}"#,
        )
        .unwrap();
        assert_eq!(rec.hotel_id, "H1");
        assert_eq!(rec.source_ref(Source::Rakuten).as_deref(), Some("12345"));
        assert_eq!(rec.source_ref(Source::Jalan).as_deref(), Some("yad318123"));
    }

    #[test]
    fn price_dataset_serializes_dates_in_ascending_order() {
        let mut ds = PriceDataset::empty(3);
        ds.roll_to(date(2026, 12, 31), 3, ["H1"]);
        let json = serde_json::to_value(&ds).unwrap();
        let keys: Vec<_> = json["days"].as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["2026-12-31", "2027-01-01", "2027-01-02"]);
        assert_eq!(json["meta"]["currency"], "JPY");
        assert_eq!(json["meta"]["window_days"], 3);
    }

    #[test]
    fn review_file_without_meta_envelope_loads() {
        let ds: MetaDataset = serde_json::from_str(
            r#"{"last_updated": "2026-10-12T06:30:00+09:00", "hotels": {"H1": {"jalan": {"review_avg": 4.3, "review_count": 210}}}}"#,
        )
        .unwrap();
        assert_eq!(ds.meta.source, REVIEW_SOURCE_ID);
        assert_eq!(ds.stats("H1", Source::Jalan), ReviewStats::new(4.3, 210));
        assert_eq!(ds.stats("H1", Source::Rakuten), None);
    }
}
