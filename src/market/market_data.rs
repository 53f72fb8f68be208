//! Indicator values and market caps for one evaluation date.

use crate::market::indicators::{self, IndicatorError};
use crate::market::price_provider::{MarketCapProvider, PriceSeriesProvider, ProviderError};
use crate::portfolio::blocks::models::{FunctionDefinition, FunctionName};
use chrono::NaiveDate;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MarketDataError {
    #[error("Insufficient data for {ticker}: {reason}")]
    InsufficientData { ticker: String, reason: String },
    #[error("Invalid period for {function}: {reason}")]
    InvalidPeriod {
        function: FunctionName,
        reason: String,
    },
    #[error("Invalid calculation for {ticker}: {reason}")]
    InvalidCalculation { ticker: String, reason: String },
    #[error("Price source failure for {ticker}: {reason}")]
    Source { ticker: String, reason: String },
    #[error("Market cap weighting requires a market cap provider")]
    MarketCapUnavailable,
}

impl MarketDataError {
    /// Missing history, as opposed to a broken calculation or data source.
    pub fn is_insufficient_data(&self) -> bool {
        matches!(self, MarketDataError::InsufficientData { .. })
    }

    fn from_provider(ticker: &str, error: ProviderError) -> Self {
        match error {
            ProviderError::NoData { .. } => MarketDataError::InsufficientData {
                ticker: ticker.to_string(),
                reason: error.to_string(),
            },
            ProviderError::Source(reason) => MarketDataError::Source {
                ticker: ticker.to_string(),
                reason,
            },
        }
    }

    fn from_indicator(function: FunctionName, ticker: &str, error: IndicatorError) -> Self {
        match error {
            IndicatorError::InvalidPeriod(reason) => {
                MarketDataError::InvalidPeriod { function, reason }
            }
            IndicatorError::InsufficientData { .. } => MarketDataError::InsufficientData {
                ticker: ticker.to_string(),
                reason: format!("{}: {}", function, error),
            },
            IndicatorError::InvalidCalculation(reason) => MarketDataError::InvalidCalculation {
                ticker: ticker.to_string(),
                reason,
            },
        }
    }
}

/// The providers an evaluation reads from, pinned to one as-of date.
#[derive(Clone, Copy)]
pub struct MarketData<'a> {
    prices: &'a dyn PriceSeriesProvider,
    market_caps: Option<&'a dyn MarketCapProvider>,
    as_of: NaiveDate,
}

impl<'a> MarketData<'a> {
    pub fn new(
        prices: &'a dyn PriceSeriesProvider,
        market_caps: Option<&'a dyn MarketCapProvider>,
        as_of: NaiveDate,
    ) -> Self {
        Self {
            prices,
            market_caps,
            as_of,
        }
    }

    pub fn as_of(&self) -> NaiveDate {
        self.as_of
    }

    /// Evaluates an indicator call. The window is checked before any data is
    /// requested.
    pub async fn evaluate(&self, function: &FunctionDefinition) -> Result<f64, MarketDataError> {
        self.indicator(function.function_name, function.window_of_days, &function.asset)
            .await
    }

    pub async fn indicator(
        &self,
        function: FunctionName,
        window: Option<u32>,
        ticker: &str,
    ) -> Result<f64, MarketDataError> {
        let period = indicators::check_window(function, window)
            .map_err(|e| MarketDataError::from_indicator(function, ticker, e))?;
        let min_bars = indicators::lookback(function, period);

        let bars = self
            .prices
            .get_series(ticker, self.as_of, min_bars)
            .await
            .map_err(|e| MarketDataError::from_provider(ticker, e))?;
        let closes: Vec<f64> = bars.iter().map(|bar| bar.close).collect();

        let value = indicators::compute(function, window, &closes)
            .map_err(|e| MarketDataError::from_indicator(function, ticker, e))?;
        debug!(
            "{}({}, {:?}) as of {} = {}",
            function, ticker, window, self.as_of, value
        );
        Ok(value)
    }

    pub async fn market_cap(&self, ticker: &str) -> Result<f64, MarketDataError> {
        let provider = self
            .market_caps
            .ok_or(MarketDataError::MarketCapUnavailable)?;
        provider
            .get_market_cap(ticker, self.as_of)
            .await
            .map_err(|e| MarketDataError::from_provider(ticker, e))
    }
}
