use crate::config::Settings;
use crate::market::price_provider::{
    BoxFuture, MarketCapProvider, PriceBar, PriceSeriesProvider, ProviderError,
};
use chrono::{NaiveDate, NaiveDateTime};
use deadpool_postgres::{Pool, PoolConfig, Runtime};
use thiserror::Error;
use tokio_postgres::NoTls;
use tracing::debug;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Database error: {0}")]
    Postgres(#[from] tokio_postgres::Error),
    #[error("Connection pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),
    #[error("Failed to create connection pool: {0}")]
    CreatePool(#[from] deadpool_postgres::CreatePoolError),
    #[error("Invalid ticker symbol: {0}")]
    InvalidTicker(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<DatabaseError> for ProviderError {
    fn from(error: DatabaseError) -> Self {
        ProviderError::Source(error.to_string())
    }
}

pub fn create_pool(settings: &Settings) -> Result<Pool, DatabaseError> {
    let database_url = settings
        .database_url
        .clone()
        .ok_or_else(|| DatabaseError::InvalidInput("DATABASE_URL must be set".to_string()))?;

    let mut config = deadpool_postgres::Config::new();
    config.url = Some(database_url);
    config.pool = Some(PoolConfig::new(settings.pool_max_size));
    Ok(config.create_pool(Some(Runtime::Tokio1), NoTls)?)
}

// Validation functions
fn validate_ticker(ticker: &str) -> Result<(), DatabaseError> {
    if ticker.trim().is_empty() || ticker.len() > 10 {
        return Err(DatabaseError::InvalidTicker(ticker.to_string()));
    }

    if !ticker
        .chars()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '.' || c == '-')
    {
        return Err(DatabaseError::InvalidTicker(ticker.to_string()));
    }

    Ok(())
}

/// Rows are timestamped; a date covers everything up to its last second.
fn end_of_day(date: NaiveDate) -> Result<NaiveDateTime, DatabaseError> {
    date.and_hms_opt(23, 59, 59)
        .ok_or_else(|| DatabaseError::InvalidInput(format!("Invalid date: {}", date)))
}

/// Price history and market caps stored in Postgres-compatible tables:
/// `stock_data (time, ticker, open, high, low, close, volume)` and
/// `market_caps (time, ticker, market_cap)`.
#[derive(Clone)]
pub struct PostgresMarketData {
    pool: Pool,
}

impl PostgresMarketData {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub async fn fetch_bars(
        &self,
        ticker: &str,
        as_of: NaiveDate,
        min_bars: usize,
    ) -> Result<Vec<PriceBar>, DatabaseError> {
        validate_ticker(ticker)?;
        let end = end_of_day(as_of)?;
        let limit = i64::try_from(min_bars)
            .map_err(|_| DatabaseError::InvalidInput(format!("Too many bars: {}", min_bars)))?;

        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT time, open, high, low, close, volume
                 FROM stock_data
                 WHERE ticker = $1
                 AND time <= $2
                 ORDER BY time DESC
                 LIMIT $3",
                &[&ticker, &end, &limit],
            )
            .await?;
        debug!("Fetched {} bars for {} as of {}", rows.len(), ticker, as_of);

        let mut bars = rows
            .iter()
            .map(|row| {
                let time: NaiveDateTime = row.try_get("time")?;
                let volume: i64 = row.try_get("volume")?;
                Ok(PriceBar {
                    date: time.date(),
                    open: row.try_get("open")?,
                    high: row.try_get("high")?,
                    low: row.try_get("low")?,
                    close: row.try_get("close")?,
                    volume: volume as f64,
                })
            })
            .collect::<Result<Vec<_>, DatabaseError>>()?;

        // Newest first from the query; callers expect oldest first.
        bars.reverse();
        Ok(bars)
    }

    pub async fn fetch_market_cap(
        &self,
        ticker: &str,
        as_of: NaiveDate,
    ) -> Result<Option<f64>, DatabaseError> {
        validate_ticker(ticker)?;
        let end = end_of_day(as_of)?;

        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT market_cap
                 FROM market_caps
                 WHERE ticker = $1
                 AND time <= $2
                 ORDER BY time DESC
                 LIMIT 1",
                &[&ticker, &end],
            )
            .await?;

        row.map(|row| row.try_get::<_, f64>("market_cap"))
            .transpose()
            .map_err(DatabaseError::from)
    }
}

impl PriceSeriesProvider for PostgresMarketData {
    fn get_series<'a>(
        &'a self,
        ticker: &'a str,
        as_of: NaiveDate,
        min_bars: usize,
    ) -> BoxFuture<'a, Result<Vec<PriceBar>, ProviderError>> {
        Box::pin(async move {
            let bars = self.fetch_bars(ticker, as_of, min_bars).await?;
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

impl MarketCapProvider for PostgresMarketData {
    fn get_market_cap<'a>(
        &'a self,
        ticker: &'a str,
        as_of: NaiveDate,
    ) -> BoxFuture<'a, Result<f64, ProviderError>> {
        Box::pin(async move {
            self.fetch_market_cap(ticker, as_of)
                .await?
                .ok_or_else(|| ProviderError::NoData {
                    ticker: ticker.to_string(),
                    as_of,
                })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_ticker() {
        assert!(validate_ticker("AAPL").is_ok());
        assert!(validate_ticker("BRK.B").is_ok());
        assert!(validate_ticker("").is_err());
        assert!(validate_ticker("aapl").is_err());
        assert!(validate_ticker("TOOLONGTICKER").is_err());
        assert!(validate_ticker("AAPL; DROP").is_err());
    }

    #[test]
    fn test_end_of_day() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
        assert_eq!(
            end_of_day(date).unwrap(),
            date.and_hms_opt(23, 59, 59).unwrap()
        );
    }

    #[test]
    fn test_create_pool_requires_url() {
        let settings = Settings {
            database_url: None,
            ..Settings::default()
        };
        assert!(matches!(
            create_pool(&settings),
            Err(DatabaseError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_database_error_becomes_source_error() {
        let error: ProviderError = DatabaseError::InvalidTicker("aapl".to_string()).into();
        assert_eq!(
            error,
            ProviderError::Source("Invalid ticker symbol: aapl".to_string())
        );
    }
}
