//! OHLCV price records: CSV round trip, ordering validation and Binance REST ingestion.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use csv::StringRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

const BINANCE_REST_KLINES_URL: &str = "https://api.binance.com/api/v3/klines";
const CSV_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub const PRICE_CSV_HEADERS: [&str; 6] = [
    "open_time",
    "open_price",
    "high_price",
    "low_price",
    "close_price",
    "volume",
];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceRecord {
    pub open_time_ms: i64,
    pub open_price: f64,
    pub high_price: f64,
    pub low_price: f64,
    pub close_price: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KlineInterval {
    M1,
    M5,
    M15,
    H1,
    H4,
    D1,
}

impl KlineInterval {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
        }
    }

    pub fn step_ms(self) -> i64 {
        match self {
            Self::M1 => 60_000,
            Self::M5 => 5 * 60_000,
            Self::M15 => 15 * 60_000,
            Self::H1 => 3_600_000,
            Self::H4 => 4 * 3_600_000,
            Self::D1 => 86_400_000,
        }
    }
}

pub fn parse_interval(raw: &str) -> Option<KlineInterval> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1m" => Some(KlineInterval::M1),
        "5m" => Some(KlineInterval::M5),
        "15m" => Some(KlineInterval::M15),
        "1h" => Some(KlineInterval::H1),
        "4h" => Some(KlineInterval::H4),
        "1d" => Some(KlineInterval::D1),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KlineFetchRequest {
    pub symbol: String,
    pub interval: KlineInterval,
    pub limit: u32,
}

impl Default for KlineFetchRequest {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            interval: KlineInterval::H1,
            limit: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketDataConfig {
    pub http_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            http_timeout_ms: 15_000,
            max_retries: 2,
            retry_backoff_ms: 200,
        }
    }
}

#[derive(Debug, Error)]
pub enum MarketDataError {
    #[error("data unavailable: {0}")]
    DataUnavailable(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("price table is missing column {0}")]
    MissingColumn(&'static str),
    #[error("failed to parse field {field} value '{value}'")]
    ParseField { field: &'static str, value: String },
    #[error("price records out of order at row {row}: {previous_ms} then {current_ms}")]
    OutOfOrder {
        row: usize,
        previous_ms: i64,
        current_ms: i64,
    },
    #[error("duplicate price record for open_time {open_time_ms} at row {row}")]
    DuplicateTimestamp { row: usize, open_time_ms: i64 },
    #[error("HTTP client build error: {0}")]
    HttpClientBuild(String),
    #[error("HTTP request failed for {url}: {message}")]
    HttpRequest { url: String, message: String },
    #[error("unexpected kline payload: {0}")]
    InvalidPayload(String),
}

/// Supplies an ordered price series to the pipeline.
pub trait PriceSource: Send + Sync {
    fn describe(&self) -> String;
    fn load(&self) -> Result<Vec<PriceRecord>, MarketDataError>;
}

#[derive(Debug, Clone)]
pub struct CsvPriceSource {
    path: PathBuf,
}

impl CsvPriceSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl PriceSource for CsvPriceSource {
    fn describe(&self) -> String {
        format!("csv:{}", self.path.display())
    }

    fn load(&self) -> Result<Vec<PriceRecord>, MarketDataError> {
        read_price_csv(&self.path)
    }
}

#[derive(Debug, Clone)]
pub struct BinancePriceSource {
    request: KlineFetchRequest,
    config: MarketDataConfig,
}

impl BinancePriceSource {
    pub fn new(request: KlineFetchRequest, config: MarketDataConfig) -> Self {
        Self { request, config }
    }
}

impl PriceSource for BinancePriceSource {
    fn describe(&self) -> String {
        format!(
            "binance:{}:{}",
            self.request.symbol,
            self.request.interval.as_str()
        )
    }

    fn load(&self) -> Result<Vec<PriceRecord>, MarketDataError> {
        fetch_binance_klines(&self.request, &self.config)
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryPriceSource {
    records: Vec<PriceRecord>,
}

impl InMemoryPriceSource {
    pub fn new(records: Vec<PriceRecord>) -> Self {
        Self { records }
    }
}

impl PriceSource for InMemoryPriceSource {
    fn describe(&self) -> String {
        format!("memory:{}", self.records.len())
    }

    fn load(&self) -> Result<Vec<PriceRecord>, MarketDataError> {
        if self.records.is_empty() {
            return Err(MarketDataError::DataUnavailable(
                "in-memory source holds no rows".to_string(),
            ));
        }
        validate_price_series(&self.records)?;
        Ok(self.records.clone())
    }
}

pub fn read_price_csv(path: &Path) -> Result<Vec<PriceRecord>, MarketDataError> {
    let file = fs::File::open(path).map_err(|err| {
        MarketDataError::DataUnavailable(format!("cannot open {}: {err}", path.display()))
    })?;
    let records = parse_price_csv(file)?;

    info!(
        component = "market_data",
        event = "market_data.csv.loaded",
        path = %path.display(),
        rows = records.len()
    );

    Ok(records)
}

pub fn parse_price_csv<R: Read>(reader: R) -> Result<Vec<PriceRecord>, MarketDataError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = reader.headers()?.clone();
    let mut indices = [0usize; 6];
    for (slot, name) in indices.iter_mut().zip(PRICE_CSV_HEADERS) {
        *slot = headers
            .iter()
            .position(|header| header == name)
            .ok_or(MarketDataError::MissingColumn(name))?;
    }

    let mut records = Vec::new();
    for record in reader.records() {
        let record = record?;
        records.push(PriceRecord {
            open_time_ms: parse_open_time(field(&record, indices[0]))?,
            open_price: parse_f64(&record, indices[1], "open_price")?,
            high_price: parse_f64(&record, indices[2], "high_price")?,
            low_price: parse_f64(&record, indices[3], "low_price")?,
            close_price: parse_f64(&record, indices[4], "close_price")?,
            volume: parse_f64(&record, indices[5], "volume")?,
        });
    }

    if records.is_empty() {
        return Err(MarketDataError::DataUnavailable(
            "price table has no rows".to_string(),
        ));
    }

    validate_price_series(&records)?;
    Ok(records)
}

pub fn write_price_csv(path: &Path, records: &[PriceRecord]) -> Result<(), MarketDataError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(PRICE_CSV_HEADERS)?;
    for record in records {
        writer.write_record([
            format_open_time(record.open_time_ms)?,
            record.open_price.to_string(),
            record.high_price.to_string(),
            record.low_price.to_string(),
            record.close_price.to_string(),
            record.volume.to_string(),
        ])?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|err| MarketDataError::Io(err.into_error()))?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    write_atomic(path, &bytes)?;

    info!(
        component = "market_data",
        event = "market_data.csv.written",
        path = %path.display(),
        rows = records.len()
    );
    Ok(())
}

/// Rejects series that are not strictly increasing in `open_time_ms`.
pub fn validate_price_series(records: &[PriceRecord]) -> Result<(), MarketDataError> {
    for (row, pair) in records.windows(2).enumerate() {
        let previous_ms = pair[0].open_time_ms;
        let current_ms = pair[1].open_time_ms;
        if current_ms == previous_ms {
            return Err(MarketDataError::DuplicateTimestamp {
                row: row + 1,
                open_time_ms: current_ms,
            });
        }
        if current_ms < previous_ms {
            return Err(MarketDataError::OutOfOrder {
                row: row + 1,
                previous_ms,
                current_ms,
            });
        }
    }
    Ok(())
}

pub fn fetch_binance_klines(
    req: &KlineFetchRequest,
    cfg: &MarketDataConfig,
) -> Result<Vec<PriceRecord>, MarketDataError> {
    info!(
        component = "market_data",
        event = "binance.fetch.start",
        symbol = %req.symbol,
        interval = req.interval.as_str(),
        limit = req.limit
    );

    let fetcher = ReqwestBlockingFetcher::new(cfg.http_timeout_ms)?;
    fetch_binance_klines_with_fetcher(req, cfg, &fetcher)
}

/// Downloads klines, keeps the OHLCV columns and writes the cleaned table.
pub fn run_etl(
    req: &KlineFetchRequest,
    cfg: &MarketDataConfig,
    out_path: &Path,
) -> Result<Vec<PriceRecord>, MarketDataError> {
    let records = fetch_binance_klines(req, cfg)?;
    write_price_csv(out_path, &records)?;
    info!(
        component = "market_data",
        event = "etl.finish",
        symbol = %req.symbol,
        rows = records.len(),
        path = %out_path.display()
    );
    Ok(records)
}

fn fetch_binance_klines_with_fetcher(
    req: &KlineFetchRequest,
    cfg: &MarketDataConfig,
    fetcher: &dyn HttpFetcher,
) -> Result<Vec<PriceRecord>, MarketDataError> {
    if req.symbol.trim().is_empty() || !req.symbol.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(MarketDataError::InvalidPayload(format!(
            "invalid symbol '{}'",
            req.symbol
        )));
    }

    let url = format!(
        "{BINANCE_REST_KLINES_URL}?symbol={}&interval={}&limit={}",
        req.symbol.to_ascii_uppercase(),
        req.interval.as_str(),
        req.limit
    );
    let payload = retry(cfg, || fetcher.get_bytes(&url))?;
    let mut records = parse_kline_payload(&payload)?;

    if records.is_empty() {
        return Err(MarketDataError::DataUnavailable(format!(
            "exchange returned no klines for {}",
            req.symbol
        )));
    }

    records.sort_by_key(|record| record.open_time_ms);
    let before = records.len();
    records.dedup_by_key(|record| record.open_time_ms);
    let duplicates_removed = before - records.len();
    if duplicates_removed > 0 {
        warn!(
            component = "market_data",
            event = "binance.fetch.duplicates_removed",
            symbol = %req.symbol,
            duplicates_removed = duplicates_removed
        );
    }

    info!(
        component = "market_data",
        event = "binance.fetch.finish",
        symbol = %req.symbol,
        rows = records.len()
    );
    Ok(records)
}

fn parse_kline_payload(payload: &[u8]) -> Result<Vec<PriceRecord>, MarketDataError> {
    let value: serde_json::Value = serde_json::from_slice(payload)
        .map_err(|err| MarketDataError::InvalidPayload(err.to_string()))?;
    let rows = value.as_array().ok_or_else(|| {
        MarketDataError::InvalidPayload("expected top-level array".to_string())
    })?;

    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let row = row.as_array().ok_or_else(|| {
            MarketDataError::InvalidPayload("expected kline row array".to_string())
        })?;
        if row.len() < 6 {
            return Err(MarketDataError::InvalidPayload(format!(
                "kline row has {} fields, expected at least 6",
                row.len()
            )));
        }
        records.push(PriceRecord {
            open_time_ms: json_i64(&row[0], "open_time")?,
            open_price: json_f64(&row[1], "open_price")?,
            high_price: json_f64(&row[2], "high_price")?,
            low_price: json_f64(&row[3], "low_price")?,
            close_price: json_f64(&row[4], "close_price")?,
            volume: json_f64(&row[5], "volume")?,
        });
    }
    Ok(records)
}

fn json_i64(value: &serde_json::Value, field: &'static str) -> Result<i64, MarketDataError> {
    if let Some(v) = value.as_i64() {
        return Ok(v);
    }
    let text = value.as_str().unwrap_or_default();
    text.parse().map_err(|_| MarketDataError::ParseField {
        field,
        value: value.to_string(),
    })
}

fn json_f64(value: &serde_json::Value, field: &'static str) -> Result<f64, MarketDataError> {
    if let Some(v) = value.as_f64() {
        return Ok(v);
    }
    let text = value.as_str().unwrap_or_default();
    text.parse().map_err(|_| MarketDataError::ParseField {
        field,
        value: value.to_string(),
    })
}

fn field(record: &StringRecord, idx: usize) -> &str {
    record.get(idx).unwrap_or_default()
}

fn parse_f64(
    record: &StringRecord,
    idx: usize,
    field_name: &'static str,
) -> Result<f64, MarketDataError> {
    let raw = field(record, idx);
    raw.parse::<f64>().map_err(|_| MarketDataError::ParseField {
        field: field_name,
        value: raw.to_string(),
    })
}

fn parse_open_time(raw: &str) -> Result<i64, MarketDataError> {
    if let Ok(ms) = raw.parse::<i64>() {
        return Ok(ms);
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, CSV_TIME_FORMAT) {
        return Ok(naive.and_utc().timestamp_millis());
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.timestamp_millis());
    }
    Err(MarketDataError::ParseField {
        field: "open_time",
        value: raw.to_string(),
    })
}

fn format_open_time(open_time_ms: i64) -> Result<String, MarketDataError> {
    Utc.timestamp_millis_opt(open_time_ms)
        .single()
        .map(|dt| dt.format(CSV_TIME_FORMAT).to_string())
        .ok_or_else(|| MarketDataError::ParseField {
            field: "open_time",
            value: open_time_ms.to_string(),
        })
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), MarketDataError> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| {
            MarketDataError::DataUnavailable(format!("invalid output path: {}", path.display()))
        })?;
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));

    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    fs::rename(tmp_path, path)?;
    Ok(())
}

trait HttpFetcher {
    fn get_bytes(&self, url: &str) -> Result<Vec<u8>, MarketDataError>;
}

struct ReqwestBlockingFetcher {
    client: reqwest::blocking::Client,
}

impl ReqwestBlockingFetcher {
    fn new(timeout_ms: u64) -> Result<Self, MarketDataError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .build()
            .map_err(|err| MarketDataError::HttpClientBuild(err.to_string()))?;
        Ok(Self { client })
    }
}

impl HttpFetcher for ReqwestBlockingFetcher {
    fn get_bytes(&self, url: &str) -> Result<Vec<u8>, MarketDataError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| MarketDataError::HttpRequest {
                url: url.to_string(),
                message: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(MarketDataError::DataUnavailable(format!(
                "unexpected HTTP status {status} from {url}"
            )));
        }

        response
            .bytes()
            .map(|bytes| bytes.to_vec())
            .map_err(|err| MarketDataError::HttpRequest {
                url: url.to_string(),
                message: err.to_string(),
            })
    }
}

fn retry<T>(
    cfg: &MarketDataConfig,
    mut f: impl FnMut() -> Result<T, MarketDataError>,
) -> Result<T, MarketDataError> {
    let mut attempt: u32 = 0;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= cfg.max_retries => return Err(err),
            Err(err) => {
                attempt = attempt.saturating_add(1);
                let shift = attempt.saturating_sub(1).min(10);
                let factor = 1u64 << shift;
                let sleep_ms = cfg.retry_backoff_ms.saturating_mul(factor);
                debug!(
                    component = "market_data",
                    event = "binance.fetch.retry",
                    attempt = attempt,
                    sleep_ms = sleep_ms,
                    error = %err
                );
                std::thread::sleep(std::time::Duration::from_millis(sleep_ms));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MockFetcher {
        responses: HashMap<String, Vec<u8>>,
        calls: Cell<u32>,
    }

    impl MockFetcher {
        fn with(mut self, url: &str, body: &[u8]) -> Self {
            self.responses.insert(url.to_string(), body.to_vec());
            self
        }
    }

    impl HttpFetcher for MockFetcher {
        fn get_bytes(&self, url: &str) -> Result<Vec<u8>, MarketDataError> {
            self.calls.set(self.calls.get() + 1);
            self.responses
                .get(url)
                .cloned()
                .ok_or_else(|| MarketDataError::HttpRequest {
                    url: url.to_string(),
                    message: "missing mock response".to_string(),
                })
        }
    }

    fn fast_cfg() -> MarketDataConfig {
        MarketDataConfig {
            retry_backoff_ms: 0,
            ..MarketDataConfig::default()
        }
    }

    fn klines_url(limit: u32) -> String {
        format!("{BINANCE_REST_KLINES_URL}?symbol=BTCUSDT&interval=1h&limit={limit}")
    }

    #[test]
    fn kline_payload_keeps_ohlcv_columns_sorted_and_deduped() {
        let body = br#"[
            [1704070800000,"101.0","103.0","100.5","102.5","12.0",1704074399999,"0",1,"0","0","0"],
            [1704067200000,"100.0","101.5","99.0","101.0","10.5",1704070799999,"0",1,"0","0","0"],
            [1704070800000,"101.0","103.0","100.5","102.5","12.0",1704074399999,"0",1,"0","0","0"]
        ]"#;
        let fetcher = MockFetcher::default().with(&klines_url(3), body);
        let req = KlineFetchRequest {
            limit: 3,
            ..KlineFetchRequest::default()
        };

        let records = fetch_binance_klines_with_fetcher(&req, &fast_cfg(), &fetcher).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].open_time_ms, 1_704_067_200_000);
        assert_eq!(records[0].close_price, 101.0);
        assert_eq!(records[1].volume, 12.0);
    }

    #[test]
    fn empty_payload_is_data_unavailable() {
        let fetcher = MockFetcher::default().with(&klines_url(1_000), b"[]");
        let err = fetch_binance_klines_with_fetcher(
            &KlineFetchRequest::default(),
            &fast_cfg(),
            &fetcher,
        )
        .unwrap_err();
        assert!(matches!(err, MarketDataError::DataUnavailable(_)));
    }

    #[test]
    fn transport_failures_are_retried_then_surfaced() {
        let fetcher = MockFetcher::default();
        let err = fetch_binance_klines_with_fetcher(
            &KlineFetchRequest::default(),
            &fast_cfg(),
            &fetcher,
        )
        .unwrap_err();
        assert!(matches!(err, MarketDataError::HttpRequest { .. }));
        assert_eq!(fetcher.calls.get(), 3);
    }

    #[test]
    fn open_time_accepts_millis_pandas_and_rfc3339() {
        assert_eq!(parse_open_time("1704067200000").unwrap(), 1_704_067_200_000);
        assert_eq!(
            parse_open_time("2024-01-01 00:00:00").unwrap(),
            1_704_067_200_000
        );
        assert_eq!(
            parse_open_time("2024-01-01T00:00:00Z").unwrap(),
            1_704_067_200_000
        );
        assert!(parse_open_time("yesterday").is_err());
    }

    #[test]
    fn interval_parsing_round_trips() {
        for interval in [
            KlineInterval::M1,
            KlineInterval::M5,
            KlineInterval::M15,
            KlineInterval::H1,
            KlineInterval::H4,
            KlineInterval::D1,
        ] {
            assert_eq!(parse_interval(interval.as_str()), Some(interval));
        }
        assert_eq!(parse_interval("2w"), None);
    }
}
