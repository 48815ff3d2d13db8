//! Read-only preview server for the published feeds.

use std::path::PathBuf;
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Path as AxumPath, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, FixedOffset, Utc};
use compset_core::{local_today, HotelRecord, MetaDataset, PriceDataset, ReviewStats, Source};
use compset_storage::read_dataset;
use compset_sync::health::HealthReport;
use compset_sync::{load_registry, SyncConfig, HEALTH_FILE, HOTEL_MASTER_FILE, PRICES_FILE, REVIEWS_FILE};
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "compset-web";

/// Files that `/data/{file}` may serve; anything else is a 404.
pub const PUBLISHED_FILES: [&str; 4] = [PRICES_FILE, REVIEWS_FILE, HOTEL_MASTER_FILE, HEALTH_FILE];

#[derive(Clone)]
pub struct AppState {
    pub data_dir: PathBuf,
    pub hotel_master: PathBuf,
    pub utc_offset: FixedOffset,
}

impl AppState {
    pub fn new(data_dir: impl Into<PathBuf>, utc_offset: FixedOffset) -> Self {
        let data_dir = data_dir.into();
        Self {
            hotel_master: data_dir.join(HOTEL_MASTER_FILE),
            data_dir,
            utc_offset,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            data_dir: config.data_dir.clone(),
            hotel_master: config.hotel_master_path(),
            utc_offset: config.utc_offset(),
        }
    }
}

#[derive(Debug, Clone)]
struct HotelRow {
    hotel_id: String,
    today_price: String,
    window_min: String,
    priced_days: usize,
    no_stock_days: usize,
    rakuten_review: String,
    jalan_review: String,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    prices_updated: String,
    reviews_updated: String,
    window_start: String,
    window_end: String,
    window_days: usize,
    health_status: String,
    rows: Vec<HotelRow>,
    files: Vec<&'static str>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/data/{file}", get(data_file_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, data_dir = %state.data_dir.display(), "preview server listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("COMPSET_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    serve(AppState::from_config(&SyncConfig::from_env()), port).await
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    match load_index(&state).await {
        Ok(tpl) => render_html(tpl),
        Err(err) => server_error(err),
    }
}

async fn data_file_handler(State(state): State<Arc<AppState>>, AxumPath(file): AxumPath<String>) -> Response {
    if !PUBLISHED_FILES.contains(&file.as_str()) {
        return (StatusCode::NOT_FOUND, "unknown feed").into_response();
    }
    let path = if file == HOTEL_MASTER_FILE {
        state.hotel_master.clone()
    } else {
        state.data_dir.join(&file)
    };
    match tokio::fs::read(&path).await {
        Ok(bytes) => ([(header::CONTENT_TYPE, "application/json; charset=utf-8")], bytes).into_response(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            (StatusCode::NOT_FOUND, format!("{file} has not been generated yet")).into_response()
        }
        Err(err) => server_error(anyhow::anyhow!("reading {}: {err}", path.display())),
    }
}

async fn healthz_handler() -> Response {
    Json(serde_json::json!({"status": "ok", "service": CRATE_NAME})).into_response()
}

fn format_yen(value: Option<u32>) -> String {
    match value {
        None => "–".to_string(),
        Some(v) => {
            let digits = v.to_string();
            let mut out = String::with_capacity(digits.len() + digits.len() / 3);
            for (i, ch) in digits.chars().enumerate() {
                if i > 0 && (digits.len() - i) % 3 == 0 {
                    out.push(',');
                }
                out.push(ch);
            }
            out
        }
    }
}

fn format_review(stats: Option<ReviewStats>) -> String {
    match stats {
        Some(s) => format!("{:.2} ({})", s.review_avg, s.review_count),
        None => "–".to_string(),
    }
}

fn format_ts(ts: Option<DateTime<Utc>>, offset: FixedOffset) -> String {
    ts.map(|t| t.with_timezone(&offset).format("%Y-%m-%d %H:%M %:z").to_string())
        .unwrap_or_else(|| "never".to_string())
}

fn hotel_row(hotel: &HotelRecord, prices: Option<&PriceDataset>, reviews: Option<&MetaDataset>, today: chrono::NaiveDate) -> HotelRow {
    let id = hotel.hotel_id.as_str();
    let (today_price, window_min, priced_days, no_stock_days) = match prices {
        Some(dataset) => {
            let values: Vec<u32> = dataset
                .days
                .values()
                .filter_map(|row| row.get(id).copied().flatten())
                .collect();
            let no_stock = dataset
                .days
                .keys()
                .filter(|date| dataset.is_no_stock(id, **date))
                .count();
            (dataset.price(id, today), values.iter().min().copied(), values.len(), no_stock)
        }
        None => (None, None, 0, 0),
    };
    HotelRow {
        hotel_id: hotel.hotel_id.clone(),
        today_price: format_yen(today_price),
        window_min: format_yen(window_min),
        priced_days,
        no_stock_days,
        rakuten_review: format_review(reviews.and_then(|r| r.stats(id, Source::Rakuten))),
        jalan_review: format_review(reviews.and_then(|r| r.stats(id, Source::Jalan))),
    }
}

async fn load_index(state: &AppState) -> anyhow::Result<IndexTemplate> {
    let hotels = load_registry(&state.hotel_master).await?;
    let prices: Option<PriceDataset> = read_dataset(&state.data_dir.join(PRICES_FILE)).await?;
    let reviews: Option<MetaDataset> = read_dataset(&state.data_dir.join(REVIEWS_FILE)).await?;
    let health: Option<HealthReport> = read_dataset(&state.data_dir.join(HEALTH_FILE)).await?;

    let today = local_today(Utc::now(), state.utc_offset);
    let rows = hotels
        .iter()
        .map(|hotel| hotel_row(hotel, prices.as_ref(), reviews.as_ref(), today))
        .collect();

    let dates: Vec<_> = prices.iter().flat_map(|p| p.days.keys().copied()).collect();
    let fmt_date = |d: Option<&chrono::NaiveDate>| d.map(|d| d.to_string()).unwrap_or_else(|| "–".to_string());

    Ok(IndexTemplate {
        prices_updated: format_ts(prices.as_ref().and_then(|p| p.meta.last_updated), state.utc_offset),
        reviews_updated: format_ts(reviews.as_ref().and_then(|r| r.meta.last_updated), state.utc_offset),
        window_start: fmt_date(dates.first()),
        window_end: fmt_date(dates.last()),
        window_days: dates.len(),
        health_status: health
            .map(|h| h.summary.status.as_str())
            .unwrap_or("unknown")
            .to_string(),
        rows,
        files: PUBLISHED_FILES.to_vec(),
    })
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {err:#}")),
    )
        .into_response()
}
