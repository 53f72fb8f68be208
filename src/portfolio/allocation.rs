use crate::portfolio::blocks::models::WEIGHT_EPSILON;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
#[error("Invalid weight value for {ticker}: {weight}")]
pub struct InvalidWeight {
    pub ticker: String,
    pub weight: f64,
}

/// Ticker to portfolio weight, ordered by ticker. A complete allocation
/// sums to 1; an allocation with no tradable assets is empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Allocation {
    weights: BTreeMap<String, f64>,
}

/// One dated row of an allocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationRecord {
    pub ticker: String,
    pub weight: f64,
    pub date: NaiveDate,
}

impl Allocation {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Everything in one ticker.
    pub fn unit(ticker: &str) -> Self {
        let mut weights = BTreeMap::new();
        weights.insert(ticker.to_string(), 1.0);
        Self { weights }
    }

    /// Equal weight across `tickers`; a ticker listed twice gets two shares.
    pub fn equal<'t>(tickers: impl IntoIterator<Item = &'t str>) -> Self {
        let tickers: Vec<&str> = tickers.into_iter().collect();
        let mut allocation = Self::empty();
        if tickers.is_empty() {
            return allocation;
        }
        let share = 1.0 / tickers.len() as f64;
        for ticker in tickers {
            *allocation.weights.entry(ticker.to_string()).or_insert(0.0) += share;
        }
        allocation
    }

    /// Adds `other` scaled by `factor`, accumulating shared tickers.
    pub fn add_scaled(&mut self, other: &Allocation, factor: f64) -> Result<(), InvalidWeight> {
        for (ticker, weight) in &other.weights {
            let scaled = weight * factor;
            if !scaled.is_finite() || scaled < 0.0 {
                return Err(InvalidWeight {
                    ticker: ticker.clone(),
                    weight: scaled,
                });
            }
            *self.weights.entry(ticker.clone()).or_insert(0.0) += scaled;
        }
        Ok(())
    }

    pub fn get(&self, ticker: &str) -> Option<f64> {
        self.weights.get(ticker).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.weights.iter().map(|(ticker, weight)| (ticker.as_str(), *weight))
    }

    pub fn tickers(&self) -> impl Iterator<Item = &str> {
        self.weights.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn total_weight(&self) -> f64 {
        self.weights.values().sum()
    }

    /// True when the weights sum to 1 within `WEIGHT_EPSILON`, or the
    /// allocation is empty.
    pub fn is_complete(&self) -> bool {
        self.is_empty() || (self.total_weight() - 1.0).abs() <= WEIGHT_EPSILON
    }

    pub fn to_records(&self, date: NaiveDate) -> Vec<AllocationRecord> {
        self.iter()
            .map(|(ticker, weight)| AllocationRecord {
                ticker: ticker.to_string(),
                weight,
                date,
            })
            .collect()
    }
}
