//! Read-only access to price history and market capitalisation.
//!
//! The evaluator only ever asks for "the last N daily bars of a ticker as of
//! a date" and "the market cap of a ticker as of a date". Where the data comes
//! from is up to the implementation.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use thiserror::Error;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl PriceBar {
    /// A bar where every price is the close.
    pub fn from_close(date: NaiveDate, close: f64) -> Self {
        Self {
            date,
            open: close,
            high: close,
            low: close,
            close,
            volume: 0.0,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProviderError {
    #[error("No data for {ticker} as of {as_of}")]
    NoData { ticker: String, as_of: NaiveDate },
    #[error("Price source failure: {0}")]
    Source(String),
}

pub trait PriceSeriesProvider: Send + Sync {
    /// Daily bars for `ticker` ending at or before `as_of`, oldest first.
    /// Returns at least `min_bars` bars when that much history exists; fewer
    /// is not an error here.
    fn get_series<'a>(
        &'a self,
        ticker: &'a str,
        as_of: NaiveDate,
        min_bars: usize,
    ) -> BoxFuture<'a, Result<Vec<PriceBar>, ProviderError>>;
}

pub trait MarketCapProvider: Send + Sync {
    fn get_market_cap<'a>(
        &'a self,
        ticker: &'a str,
        as_of: NaiveDate,
    ) -> BoxFuture<'a, Result<f64, ProviderError>>;
}

/// One `get_series` call seen by an `InMemoryPriceProvider`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesRequest {
    pub ticker: String,
    pub as_of: NaiveDate,
    pub min_bars: usize,
}

/// Price history held in memory. Records every series request so callers
/// can see which tickers an evaluation read.
#[derive(Debug, Default)]
pub struct InMemoryPriceProvider {
    series: HashMap<String, Vec<PriceBar>>,
    market_caps: HashMap<String, f64>,
    requests: Mutex<Vec<SeriesRequest>>,
}

impl InMemoryPriceProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds bars for `ticker`, keeping the series sorted by date.
    pub fn insert_bars(&mut self, ticker: &str, bars: impl IntoIterator<Item = PriceBar>) {
        let series = self.series.entry(ticker.to_string()).or_default();
        series.extend(bars);
        series.sort_by_key(|bar| bar.date);
    }

    /// Adds one close per consecutive calendar day ending at `last_date`.
    pub fn insert_closes(&mut self, ticker: &str, last_date: NaiveDate, closes: &[f64]) {
        let bars = closes.iter().rev().enumerate().filter_map(|(offset, &close)| {
            last_date
                .checked_sub_days(chrono::Days::new(offset as u64))
                .map(|date| PriceBar::from_close(date, close))
        });
        self.insert_bars(ticker, bars.collect::<Vec<_>>());
    }

    pub fn insert_market_cap(&mut self, ticker: &str, market_cap: f64) {
        self.market_caps.insert(ticker.to_string(), market_cap);
    }

    pub fn with_closes(mut self, ticker: &str, last_date: NaiveDate, closes: &[f64]) -> Self {
        self.insert_closes(ticker, last_date, closes);
        self
    }

    pub fn with_market_cap(mut self, ticker: &str, market_cap: f64) -> Self {
        self.insert_market_cap(ticker, market_cap);
        self
    }

    pub fn requests(&self) -> Vec<SeriesRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    /// Number of series requests made for `ticker`.
    pub fn request_count(&self, ticker: &str) -> usize {
        self.requests()
            .iter()
            .filter(|request| request.ticker == ticker)
            .count()
    }

    fn series_as_of(&self, ticker: &str, as_of: NaiveDate, min_bars: usize) -> Vec<PriceBar> {
        let Some(series) = self.series.get(ticker) else {
            return Vec::new();
        };
        let end = series.partition_point(|bar| bar.date <= as_of);
        let start = end.saturating_sub(min_bars);
        series[start..end].to_vec()
    }
}

impl PriceSeriesProvider for InMemoryPriceProvider {
    fn get_series<'a>(
        &'a self,
        ticker: &'a str,
        as_of: NaiveDate,
        min_bars: usize,
    ) -> BoxFuture<'a, Result<Vec<PriceBar>, ProviderError>> {
        Box::pin(async move {
            if let Ok(mut requests) = self.requests.lock() {
                requests.push(SeriesRequest {
                    ticker: ticker.to_string(),
                    as_of,
                    min_bars,
                });
            }

            let bars = self.series_as_of(ticker, as_of, min_bars);
            if bars.is_empty() {
                return Err(ProviderError::NoData {
                    ticker: ticker.to_string(),
                    as_of,
                });
            }
            Ok(bars)
        })
    }
}

impl MarketCapProvider for InMemoryPriceProvider {
    fn get_market_cap<'a>(
        &'a self,
        ticker: &'a str,
        as_of: NaiveDate,
    ) -> BoxFuture<'a, Result<f64, ProviderError>> {
        Box::pin(async move {
            self.market_caps
                .get(ticker)
                .copied()
                .ok_or_else(|| ProviderError::NoData {
                    ticker: ticker.to_string(),
                    as_of,
                })
        })
    }
}
