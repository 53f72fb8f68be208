//! Splits a Weight block's capital between its resolved children.

use crate::market::market_data::{MarketData, MarketDataError};
use crate::market::price_provider::BoxFuture;
use crate::portfolio::allocation::{Allocation, InvalidWeight};
use crate::portfolio::blocks::models::{FunctionName, WeightSpec};
use futures::stream::{self, StreamExt, TryStreamExt};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum WeightingError {
    #[error(transparent)]
    MarketData(#[from] MarketDataError),
    #[error("{0}")]
    Degenerate(String),
    #[error(transparent)]
    InvalidWeight(#[from] InvalidWeight),
}

/// One resolved child of a Weight block.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedChild<'a> {
    /// Index into the `values` of a specified weight.
    pub slot: usize,
    /// The asset whose volatility or market cap drives the weight.
    pub ticker: Option<&'a str>,
    pub allocation: Allocation,
}

/// Scales every child allocation by its weight under `spec` and merges them,
/// accumulating tickers that appear under more than one child.
///
/// Children that resolved to an empty allocation are dropped and the
/// remaining weights renormalised.
pub async fn allocate(
    spec: &WeightSpec,
    children: Vec<WeightedChild<'_>>,
    market: &MarketData<'_>,
    max_concurrent_tasks: usize,
) -> Result<Allocation, WeightingError> {
    let children: Vec<WeightedChild<'_>> = children
        .into_iter()
        .filter(|child| {
            if child.allocation.is_empty() {
                debug!("Dropping empty weight slot {}", child.slot);
            }
            !child.allocation.is_empty()
        })
        .collect();
    if children.is_empty() {
        return Ok(Allocation::empty());
    }

    let weights = child_weights(spec, &children, market, max_concurrent_tasks).await?;

    let mut merged = Allocation::empty();
    for (child, weight) in children.iter().zip(weights) {
        if weight > 0.0 {
            merged.add_scaled(&child.allocation, weight)?;
        }
    }
    Ok(merged)
}

/// Per-child scalar weights, summing to 1.
pub async fn child_weights(
    spec: &WeightSpec,
    children: &[WeightedChild<'_>],
    market: &MarketData<'_>,
    max_concurrent_tasks: usize,
) -> Result<Vec<f64>, WeightingError> {
    match spec {
        WeightSpec::Equal => {
            let n = children.len() as f64;
            Ok(vec![1.0 / n; children.len()])
        }
        WeightSpec::Specified {
            allocation_type,
            values,
        } => {
            let raw = children
                .iter()
                .map(|child| {
                    values
                        .get(child.slot)
                        .map(|value| allocation_type.to_fraction(*value))
                        .ok_or_else(|| {
                            WeightingError::Degenerate(format!(
                                "No specified value for child {}",
                                child.slot
                            ))
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;
            normalize(raw, "specified values")
        }
        WeightSpec::InverseVolatility {
            window_of_trading_days,
        } => {
            let window = *window_of_trading_days;
            let mut lookups: Vec<BoxFuture<'_, Result<f64, WeightingError>>> =
                Vec::with_capacity(children.len());
            for child in children {
                let ticker = asset_ticker(child)?;
                lookups.push(Box::pin(async move {
                    let vol = market
                        .indicator(FunctionName::ReturnsStandardDeviation, Some(window), ticker)
                        .await?;
                    if !vol.is_finite() || vol <= 0.0 {
                        return Err(WeightingError::Degenerate(format!(
                            "Invalid volatility value for {}: {}",
                            ticker, vol
                        )));
                    }
                    debug!("Volatility of {} over {} days: {}", ticker, window, vol);
                    Ok(1.0 / vol)
                }));
            }
            let inverse_vols: Vec<f64> = stream::iter(lookups)
                .buffered(max_concurrent_tasks.max(1))
                .try_collect()
                .await?;
            normalize(inverse_vols, "inverse volatilities")
        }
        WeightSpec::MarketCap => {
            let mut lookups: Vec<BoxFuture<'_, Result<f64, WeightingError>>> =
                Vec::with_capacity(children.len());
            for child in children {
                let ticker = asset_ticker(child)?;
                lookups.push(Box::pin(async move {
                    let cap = market.market_cap(ticker).await?;
                    if !cap.is_finite() || cap <= 0.0 {
                        return Err(WeightingError::Degenerate(format!(
                            "Invalid market cap for {}: {}",
                            ticker, cap
                        )));
                    }
                    Ok(cap)
                }));
            }
            let caps: Vec<f64> = stream::iter(lookups)
                .buffered(max_concurrent_tasks.max(1))
                .try_collect()
                .await?;
            normalize(caps, "market caps")
        }
    }
}

fn asset_ticker<'a>(child: &WeightedChild<'a>) -> Result<&'a str, WeightingError> {
    child.ticker.ok_or_else(|| {
        WeightingError::Degenerate(format!("Weight slot {} is not an asset", child.slot))
    })
}

fn normalize(raw: Vec<f64>, what: &str) -> Result<Vec<f64>, WeightingError> {
    let total: f64 = raw.iter().sum();
    if !total.is_finite() || total <= 0.0 {
        return Err(WeightingError::Degenerate(format!(
            "Sum of {} is {}",
            what, total
        )));
    }
    Ok(raw.into_iter().map(|value| value / total).collect())
}
