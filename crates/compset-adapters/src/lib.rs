//! Per-source extractors: Rakuten Travel API (prices, reviews) and Jalan facility pages (reviews).

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use compset_core::{HotelRecord, ReviewStats, Source};
use compset_storage::{ArtifactStore, FetchError, FetchRequest, HttpFetcher, RetryDisposition};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "compset-adapters";

pub const RAKUTEN_API_BASE: &str = "https://app.rakuten.co.jp/services/api";
pub const JALAN_BASE: &str = "https://www.jalan.net";

const VACANT_HOTEL_SEARCH: &str = "Travel/VacantHotelSearch/20170426";
const HOTEL_DETAIL_SEARCH: &str = "Travel/HotelDetailSearch/20170426";

/// Successful outcome of a single extractor call.
#[derive(Debug, Clone, PartialEq)]
pub enum Fetched<V> {
    Value(V),
    /// The source explicitly reported that there is nothing to report.
    NoStock,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FetchFailure {
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("source unavailable: {0}")]
    Unavailable(String),
    #[error("request rejected (status {status:?}): {detail}")]
    Rejected { status: Option<u16>, detail: String },
    #[error("extraction failed: {0}")]
    ExtractionFailed(String),
}

impl FetchFailure {
    /// Whether another attempt could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchFailure::RateLimited { .. } | FetchFailure::Unavailable(_))
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            FetchFailure::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FetchFailure::RateLimited { .. } => "rate_limited",
            FetchFailure::Unavailable(_) => "unavailable",
            FetchFailure::Rejected { .. } => "rejected",
            FetchFailure::ExtractionFailed(_) => "extraction_failed",
        }
    }
}

/// Maps a transport level error onto the extractor failure taxonomy.
pub fn classify_fetch_error(err: FetchError) -> FetchFailure {
    match err {
        FetchError::HttpStatus {
            status: 429,
            retry_after,
            ..
        } => FetchFailure::RateLimited { retry_after },
        FetchError::HttpStatus { status, url, .. } if status >= 500 => {
            FetchFailure::Unavailable(format!("http {status} from {url}"))
        }
        FetchError::HttpStatus { status, body, .. } => FetchFailure::Rejected {
            status: Some(status),
            detail: body,
        },
        FetchError::Request(err) => match compset_storage::classify_reqwest_error(&err) {
            RetryDisposition::Retryable => FetchFailure::Unavailable(err.to_string()),
            RetryDisposition::NonRetryable => FetchFailure::Rejected {
                status: None,
                detail: err.to_string(),
            },
        },
        FetchError::Closed => FetchFailure::Unavailable("fetcher closed".to_string()),
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("RAKUTEN_APP_ID is required for {0} extraction")]
    MissingAppId(&'static str),
}

#[async_trait]
pub trait PriceExtractor: Send + Sync {
    fn source(&self) -> Source;

    /// Minimum one-night price for `checkin`.
    async fn fetch_price(&self, hotel: &HotelRecord, checkin: NaiveDate) -> Result<Fetched<u32>, FetchFailure>;
}

#[async_trait]
pub trait ReviewExtractor: Send + Sync {
    fn source(&self) -> Source;

    async fn fetch_reviews(&self, hotel: &HotelRecord) -> Result<Fetched<ReviewStats>, FetchFailure>;
}

fn unlisted(hotel: &HotelRecord, source: Source) -> FetchFailure {
    FetchFailure::Rejected {
        status: None,
        detail: format!("hotel {} has no {} identifier", hotel.hotel_id, source),
    }
}

#[derive(Debug, Clone)]
pub struct AdapterSettings {
    pub rakuten_app_id: Option<String>,
    pub rakuten_base_url: String,
    pub jalan_base_url: String,
    pub artifacts: Option<ArtifactStore>,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            rakuten_app_id: None,
            rakuten_base_url: RAKUTEN_API_BASE.to_string(),
            jalan_base_url: JALAN_BASE.to_string(),
            artifacts: None,
        }
    }
}

pub fn price_extractor(
    http: Arc<HttpFetcher>,
    settings: &AdapterSettings,
) -> Result<Arc<dyn PriceExtractor>, AdapterError> {
    let app_id = settings
        .rakuten_app_id
        .clone()
        .filter(|id| !id.trim().is_empty())
        .ok_or(AdapterError::MissingAppId("price"))?;
    Ok(Arc::new(RakutenPriceApi::new(http, &settings.rakuten_base_url, app_id)))
}

pub fn review_extractor_for(
    source: Source,
    http: Arc<HttpFetcher>,
    settings: &AdapterSettings,
) -> Result<Arc<dyn ReviewExtractor>, AdapterError> {
    match source {
        Source::Rakuten => {
            let app_id = settings
                .rakuten_app_id
                .clone()
                .filter(|id| !id.trim().is_empty())
                .ok_or(AdapterError::MissingAppId("review"))?;
            Ok(Arc::new(RakutenReviewApi::new(http, &settings.rakuten_base_url, app_id)))
        }
        Source::Jalan => {
            let mut extractor = JalanReviewPage::new(http, &settings.jalan_base_url);
            if let Some(store) = &settings.artifacts {
                extractor = extractor.with_artifacts(store.clone());
            }
            Ok(Arc::new(extractor))
        }
    }
}

// ---------------------------------------------------------------------------
// Rakuten Travel API

pub struct RakutenPriceApi {
    http: Arc<HttpFetcher>,
    endpoint: String,
    app_id: String,
}

impl RakutenPriceApi {
    pub fn new(http: Arc<HttpFetcher>, base_url: &str, app_id: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: format!("{}/{VACANT_HOTEL_SEARCH}", base_url.trim_end_matches('/')),
            app_id: app_id.into(),
        }
    }
}

#[async_trait]
impl PriceExtractor for RakutenPriceApi {
    fn source(&self) -> Source {
        Source::Rakuten
    }

    async fn fetch_price(&self, hotel: &HotelRecord, checkin: NaiveDate) -> Result<Fetched<u32>, FetchFailure> {
        let hotel_no = hotel
            .rakuten_hotel_no
            .ok_or_else(|| unlisted(hotel, Source::Rakuten))?;
        let checkout = checkin.succ_opt().unwrap_or(checkin);
        let request = FetchRequest::new(Source::Rakuten, &self.endpoint)
            .query("applicationId", &self.app_id)
            .query("formatVersion", 2)
            .query("checkinDate", checkin.format("%Y-%m-%d"))
            .query("checkoutDate", checkout.format("%Y-%m-%d"))
            .query("hotelNo", hotel_no)
            .query("detailClassCode", "D");

        match self.http.get(request).await {
            Ok(response) => parse_vacant_hotel_response(&response.body),
            Err(FetchError::HttpStatus { status: 404, body, .. }) if is_not_found_body(&body) => {
                Ok(Fetched::NoStock)
            }
            Err(err) => Err(classify_fetch_error(err)),
        }
    }
}

pub struct RakutenReviewApi {
    http: Arc<HttpFetcher>,
    endpoint: String,
    app_id: String,
}

impl RakutenReviewApi {
    pub fn new(http: Arc<HttpFetcher>, base_url: &str, app_id: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: format!("{}/{HOTEL_DETAIL_SEARCH}", base_url.trim_end_matches('/')),
            app_id: app_id.into(),
        }
    }
}

#[async_trait]
impl ReviewExtractor for RakutenReviewApi {
    fn source(&self) -> Source {
        Source::Rakuten
    }

    async fn fetch_reviews(&self, hotel: &HotelRecord) -> Result<Fetched<ReviewStats>, FetchFailure> {
        let hotel_no = hotel
            .rakuten_hotel_no
            .ok_or_else(|| unlisted(hotel, Source::Rakuten))?;
        let request = FetchRequest::new(Source::Rakuten, &self.endpoint)
            .query("applicationId", &self.app_id)
            .query("formatVersion", 2)
            .query("hotelNo", hotel_no);

        let response = self.http.get(request).await.map_err(classify_fetch_error)?;
        parse_hotel_detail_response(&response.body)
    }
}

/// Rakuten answers "no vacancy" with a 404 whose body carries `error: not_found`.
pub fn is_not_found_body(body: &str) -> bool {
    serde_json::from_str::<JsonValue>(body)
        .ok()
        .is_some_and(|value| is_not_found(&value))
}

fn is_not_found(value: &JsonValue) -> bool {
    value.get("error").and_then(JsonValue::as_str) == Some("not_found")
}

fn parse_json(body: &[u8]) -> Result<JsonValue, FetchFailure> {
    serde_json::from_slice(body).map_err(|e| FetchFailure::ExtractionFailed(format!("invalid json: {e}")))
}

fn collect_charges(value: &JsonValue, out: &mut Vec<f64>) {
    match value {
        JsonValue::Object(map) => {
            for (key, child) in map {
                if key == "dailyCharge" || key == "roomCharge" {
                    if let Some(total) = child.get("total").and_then(JsonValue::as_f64) {
                        out.push(total);
                    }
                }
                collect_charges(child, out);
            }
        }
        JsonValue::Array(items) => items.iter().for_each(|item| collect_charges(item, out)),
        _ => {}
    }
}

/// Minimum total charge across every room plan in a VacantHotelSearch response.
pub fn parse_vacant_hotel_response(body: &[u8]) -> Result<Fetched<u32>, FetchFailure> {
    let value = parse_json(body)?;
    if is_not_found(&value) {
        return Ok(Fetched::NoStock);
    }
    let hotels = match value.get("hotels") {
        Some(JsonValue::Array(items)) if !items.is_empty() => &value["hotels"],
        Some(JsonValue::Array(_)) | None => return Ok(Fetched::NoStock),
        Some(other) => {
            return Err(FetchFailure::ExtractionFailed(format!(
                "unexpected hotels payload: {}",
                json_kind(other)
            )))
        }
    };

    let mut charges = Vec::new();
    collect_charges(hotels, &mut charges);
    let min = charges
        .into_iter()
        .filter(|c| c.is_finite() && *c >= 0.0)
        .map(f64::round)
        .fold(None, |acc: Option<f64>, c| Some(acc.map_or(c, |a| a.min(c))));

    match min {
        None => Ok(Fetched::NoStock),
        Some(price) if price <= f64::from(u32::MAX) => Ok(Fetched::Value(price as u32)),
        Some(price) => Err(FetchFailure::ExtractionFailed(format!("charge out of range: {price}"))),
    }
}

fn find_object_with_key<'a>(value: &'a JsonValue, key: &str) -> Option<&'a serde_json::Map<String, JsonValue>> {
    match value {
        JsonValue::Object(map) if map.contains_key(key) => Some(map),
        JsonValue::Object(map) => map.values().find_map(|child| find_object_with_key(child, key)),
        JsonValue::Array(items) => items.iter().find_map(|child| find_object_with_key(child, key)),
        _ => None,
    }
}

/// Review average/count from a HotelDetailSearch response.
pub fn parse_hotel_detail_response(body: &[u8]) -> Result<Fetched<ReviewStats>, FetchFailure> {
    let value = parse_json(body)?;
    let info = find_object_with_key(&value, "reviewCount")
        .ok_or_else(|| FetchFailure::ExtractionFailed("reviewCount missing".to_string()))?;

    let count = info
        .get("reviewCount")
        .and_then(count_like)
        .ok_or_else(|| FetchFailure::ExtractionFailed("reviewCount is not a count".to_string()))?;
    if count == 0 {
        return Ok(Fetched::NoStock);
    }
    let avg = info
        .get("reviewAverage")
        .and_then(number_like)
        .ok_or_else(|| FetchFailure::ExtractionFailed("reviewAverage missing".to_string()))?;

    ReviewStats::new(avg, count)
        .map(Fetched::Value)
        .ok_or_else(|| FetchFailure::ExtractionFailed(format!("reviewAverage out of range: {avg}")))
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

fn number_like(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|v: &f64| v.is_finite())
}

fn count_like(value: &JsonValue) -> Option<u32> {
    match value {
        JsonValue::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0 && f.fract() == 0.0).map(|f| f as u64))
            .and_then(|n| u32::try_from(n).ok()),
        JsonValue::String(s) => parse_count(s),
        _ => None,
    }
}

fn parse_count(raw: &str) -> Option<u32> {
    raw.trim().replace(',', "").parse().ok()
}

// ---------------------------------------------------------------------------
// Jalan facility pages

pub struct JalanReviewPage {
    http: Arc<HttpFetcher>,
    base_url: String,
    artifacts: Option<ArtifactStore>,
}

impl JalanReviewPage {
    pub fn new(http: Arc<HttpFetcher>, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            artifacts: None,
        }
    }

    /// Archive documents that no strategy could read.
    pub fn with_artifacts(mut self, store: ArtifactStore) -> Self {
        self.artifacts = Some(store);
        self
    }

    async fn fetch_document(&self, jalan_id: &str) -> Result<(String, String), FetchFailure> {
        let referer = format!("{}/", self.base_url);
        let mut failure: Option<FetchFailure> = None;

        for url in candidate_urls(&self.base_url, jalan_id) {
            let request = FetchRequest::new(Source::Jalan, &url)
                .header("Referer", referer.clone())
                .header("Accept", "text/html,application/xhtml+xml");
            let attempt = match self.http.get(request).await {
                Ok(response) if response.final_url.contains("robots") => {
                    FetchFailure::Unavailable(format!("{url} redirected to {}", response.final_url))
                }
                Ok(response) => {
                    let text = String::from_utf8_lossy(&response.body).into_owned();
                    if !text.trim().is_empty() {
                        return Ok((url, text));
                    }
                    FetchFailure::Unavailable(format!("{url} returned an empty body"))
                }
                Err(err) => classify_fetch_error(err),
            };
            debug!(url = %url, failure = attempt.kind(), "jalan candidate failed");
            if matches!(attempt, FetchFailure::RateLimited { .. }) {
                return Err(attempt);
            }
            failure = Some(match failure {
                Some(prev) if prev.is_transient() || !attempt.is_transient() => prev,
                _ => attempt,
            });
        }

        Err(failure.unwrap_or_else(|| FetchFailure::Rejected {
            status: None,
            detail: format!("no candidate url for {jalan_id}"),
        }))
    }
}

#[async_trait]
impl ReviewExtractor for JalanReviewPage {
    fn source(&self) -> Source {
        Source::Jalan
    }

    async fn fetch_reviews(&self, hotel: &HotelRecord) -> Result<Fetched<ReviewStats>, FetchFailure> {
        let jalan_id = hotel
            .jalan_hotel_id
            .as_deref()
            .ok_or_else(|| unlisted(hotel, Source::Jalan))?;
        let (url, html) = self.fetch_document(jalan_id).await?;

        let outcome = extract_review_stats(&html);
        if let Some((strategy, stats)) = outcome.winner {
            debug!(hotel_id = %hotel.hotel_id, strategy = strategy.as_str(), "jalan review stats extracted");
            return Ok(Fetched::Value(stats));
        }

        if let Some(store) = &self.artifacts {
            match store
                .store_document(Utc::now(), Source::Jalan, &hotel.hotel_id, "html", html.as_bytes())
                .await
            {
                Ok(artifact) => warn!(
                    hotel_id = %hotel.hotel_id,
                    path = %artifact.relative_path.display(),
                    "archived unreadable jalan page"
                ),
                Err(err) => warn!(hotel_id = %hotel.hotel_id, error = %err, "failed to archive jalan page"),
            }
        }
        Err(FetchFailure::ExtractionFailed(format!(
            "no review strategy matched {url} (tried {})",
            outcome
                .attempted
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        )))
    }
}

/// Facility URLs tried in order for a `yad` identifier.
pub fn candidate_urls(base_url: &str, jalan_id: &str) -> Vec<String> {
    let base = base_url.trim_end_matches('/');
    let mut urls = vec![format!("{base}/{jalan_id}/"), format!("{base}/{jalan_id}/kuchikomi/")];
    let digits: String = jalan_id.chars().filter(char::is_ascii_digit).collect();
    if !digits.is_empty() {
        urls.push(format!("{base}/uw/uwp3200/uww3201.do?yadNo={digits}"));
    }
    urls
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStrategy {
    JsonLd,
    Microdata,
    TextPattern,
}

impl ReviewStrategy {
    pub const CHAIN: [ReviewStrategy; 3] = [
        ReviewStrategy::JsonLd,
        ReviewStrategy::Microdata,
        ReviewStrategy::TextPattern,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ReviewStrategy::JsonLd => "json_ld",
            ReviewStrategy::Microdata => "microdata",
            ReviewStrategy::TextPattern => "text_pattern",
        }
    }

    pub fn extract(self, document: &Html) -> Option<ReviewStats> {
        match self {
            ReviewStrategy::JsonLd => json_ld_stats(document),
            ReviewStrategy::Microdata => microdata_stats(document),
            ReviewStrategy::TextPattern => text_pattern_stats(document),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChainOutcome {
    pub winner: Option<(ReviewStrategy, ReviewStats)>,
    pub attempted: Vec<ReviewStrategy>,
}

/// Runs `chain` in order and stops at the first strategy yielding a valid pair.
pub fn run_fallback_chain(document: &Html, chain: &[ReviewStrategy]) -> ChainOutcome {
    let mut attempted = Vec::with_capacity(chain.len());
    for strategy in chain {
        attempted.push(*strategy);
        if let Some(stats) = strategy.extract(document) {
            return ChainOutcome {
                winner: Some((*strategy, stats)),
                attempted,
            };
        }
    }
    ChainOutcome {
        winner: None,
        attempted,
    }
}

pub fn extract_review_stats(html: &str) -> ChainOutcome {
    let document = Html::parse_document(html);
    run_fallback_chain(&document, &ReviewStrategy::CHAIN)
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn selector(css: &str) -> Option<Selector> {
    Selector::parse(css).ok()
}

fn json_ld_stats(document: &Html) -> Option<ReviewStats> {
    let scripts = selector(r#"script[type="application/ld+json"]"#)?;
    document.select(&scripts).find_map(|script| {
        let raw = script.text().collect::<String>();
        let value = serde_json::from_str::<JsonValue>(raw.trim()).ok()?;
        json_ld_nodes(&value).into_iter().find_map(aggregate_rating_stats)
    })
}

fn json_ld_nodes(value: &JsonValue) -> Vec<&JsonValue> {
    let mut nodes = Vec::new();
    match value {
        JsonValue::Array(items) => items.iter().for_each(|item| nodes.extend(json_ld_nodes(item))),
        JsonValue::Object(map) => {
            nodes.push(value);
            if let Some(graph) = map.get("@graph") {
                nodes.extend(json_ld_nodes(graph));
            }
        }
        _ => {}
    }
    nodes
}

fn aggregate_rating_stats(node: &JsonValue) -> Option<ReviewStats> {
    let rating = node.get("aggregateRating")?;
    let avg = number_like(rating.get("ratingValue")?)?;
    let count = rating
        .get("reviewCount")
        .or_else(|| rating.get("ratingCount"))
        .and_then(count_like)?;
    ReviewStats::new(avg, count)
}

fn microdata_stats(document: &Html) -> Option<ReviewStats> {
    let scope = selector(r#"[itemprop="aggregateRating"]"#)?;
    let scoped: Vec<ElementRef> = document.select(&scope).collect();
    if scoped.is_empty() {
        microdata_pair(document.root_element())
    } else {
        scoped.into_iter().find_map(microdata_pair)
    }
}

fn microdata_pair(root: ElementRef) -> Option<ReviewStats> {
    let avg = itemprop_value(root, "ratingValue")?.parse::<f64>().ok()?;
    let count = itemprop_value(root, "reviewCount")
        .or_else(|| itemprop_value(root, "ratingCount"))
        .and_then(|raw| parse_count(&raw))?;
    ReviewStats::new(avg, count)
}

fn itemprop_value(root: ElementRef, prop: &str) -> Option<String> {
    let sel = selector(&format!(r#"[itemprop="{prop}"]"#))?;
    let element = root.select(&sel).next()?;
    element
        .value()
        .attr("content")
        .and_then(|s| text_or_none(s.to_string()))
        .or_else(|| text_or_none(element.text().collect::<String>()))
}

/// Rendered text of the document, without script and style bodies.
fn visible_text(document: &Html) -> String {
    let mut parts = Vec::new();
    for node in document.root_element().descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node
            .parent()
            .and_then(|parent| parent.value().as_element().map(|el| el.name()))
            .is_some_and(|name| matches!(name, "script" | "style" | "noscript"));
        let trimmed = text.trim();
        if !hidden && !trimmed.is_empty() {
            parts.push(trimmed);
        }
    }
    parts.join(" ")
}

struct TextPatterns {
    averages: Vec<Regex>,
    labelled_counts: Vec<Regex>,
    any_count: Regex,
}

impl TextPatterns {
    fn compile() -> Option<Self> {
        let averages = [
            r"(?:総合(?:評価)?|クチコミ総合)\s*([0-5](?:\.[0-9])?)",
            r"([0-5](?:\.[0-9])?)\s*点",
            r"評価\s*([0-5](?:\.[0-9])?)",
        ]
        .iter()
        .map(|p| Regex::new(p).ok())
        .collect::<Option<Vec<_>>>()?;
        let labelled_counts = ["クチコミ", "口コミ"]
            .iter()
            .map(|word| Regex::new(&format!(r"{word}.{{0,50}}?([0-9][0-9,]*)\s*件")).ok())
            .collect::<Option<Vec<_>>>()?;
        let any_count = Regex::new(r"([0-9][0-9,]*)\s*件").ok()?;
        Some(Self {
            averages,
            labelled_counts,
            any_count,
        })
    }

    fn average(&self, text: &str) -> Option<f64> {
        self.averages
            .iter()
            .find_map(|re| re.captures(text)?.get(1)?.as_str().parse().ok())
    }

    fn count(&self, text: &str) -> Option<u32> {
        let max_of = |re: &Regex| {
            re.captures_iter(text)
                .filter_map(|caps| parse_count(caps.get(1)?.as_str()))
                .max()
        };
        self.labelled_counts
            .iter()
            .filter_map(max_of)
            .max()
            .or_else(|| max_of(&self.any_count))
    }
}

static TEXT_PATTERNS: OnceLock<Option<TextPatterns>> = OnceLock::new();

fn text_patterns() -> Option<&'static TextPatterns> {
    TEXT_PATTERNS.get_or_init(TextPatterns::compile).as_ref()
}

fn text_pattern_stats(document: &Html) -> Option<ReviewStats> {
    let patterns = text_patterns()?;
    let text = visible_text(document);
    let avg = patterns.average(&text)?;
    let count = patterns.count(&text)?;
    ReviewStats::new(avg, count)
}
