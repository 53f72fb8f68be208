//! Windowed technical indicators over a series of closing prices.
//!
//! Every function takes closes ordered oldest to newest, so `closes.last()`
//! is the price on the evaluation date. Nothing here touches a data source.

use crate::portfolio::blocks::models::FunctionName;
use thiserror::Error;

/// The exponential moving average is seeded on the oldest `window` closes and
/// smoothed forward through up to this many windows of history.
pub const EMA_LOOKBACK_WINDOWS: usize = 2;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum IndicatorError {
    #[error("Invalid period: {0}")]
    InvalidPeriod(String),
    #[error("Insufficient data: need {required} closes, found {available}")]
    InsufficientData { required: usize, available: usize },
    #[error("Invalid calculation: {0}")]
    InvalidCalculation(String),
}

/// Validates the window of an indicator call and returns it as a length.
/// `current_price` takes no window and yields 1.
pub fn check_window(function: FunctionName, window: Option<u32>) -> Result<usize, IndicatorError> {
    match (function.requires_window_of_days(), window) {
        (false, None) => Ok(1),
        (false, Some(days)) => Err(IndicatorError::InvalidPeriod(format!(
            "{} does not take a window (got {})",
            function, days
        ))),
        (true, None) => Err(IndicatorError::InvalidPeriod(format!(
            "{} requires a window",
            function
        ))),
        (true, Some(days)) => {
            let max = function.max_window_of_days();
            if days == 0 || days > max {
                Err(IndicatorError::InvalidPeriod(format!(
                    "{} window must be between 1 and {} (got {})",
                    function, max, days
                )))
            } else {
                Ok(days as usize)
            }
        }
    }
}

/// Fewest closes the function can be computed from.
pub fn required_observations(function: FunctionName, window: usize) -> usize {
    if function.is_return_based() {
        window + 1
    } else {
        window
    }
}

/// How many closes to request from a price source for one call.
pub fn lookback(function: FunctionName, window: usize) -> usize {
    match function {
        FunctionName::ExponentialMovingAverage => window * EMA_LOOKBACK_WINDOWS,
        _ => required_observations(function, window),
    }
}

/// Computes `function` over `closes`, checking the window first.
pub fn compute(
    function: FunctionName,
    window: Option<u32>,
    closes: &[f64],
) -> Result<f64, IndicatorError> {
    let period = check_window(function, window)?;
    let value = match function {
        FunctionName::CurrentPrice => current_price(closes)?,
        FunctionName::SimpleMovingAverage => simple_moving_average(closes, period)?,
        FunctionName::ExponentialMovingAverage => exponential_moving_average(closes, period)?,
        FunctionName::CumulativeReturn => cumulative_return(closes, period)?,
        FunctionName::MovingAverageOfReturns => moving_average_of_returns(closes, period)?,
        FunctionName::RelativeStrengthIndex => relative_strength_index(closes, period)?,
        FunctionName::PriceStandardDeviation => price_standard_deviation(closes, period)?,
        FunctionName::ReturnsStandardDeviation => returns_standard_deviation(closes, period)?,
        FunctionName::MaxDrawdown => max_drawdown(closes, period)?,
    };

    if !value.is_finite() {
        return Err(IndicatorError::InvalidCalculation(format!(
            "{} resulted in invalid value: {}",
            function, value
        )));
    }
    Ok(value)
}

fn tail(closes: &[f64], required: usize) -> Result<&[f64], IndicatorError> {
    if required == 0 {
        return Err(IndicatorError::InvalidPeriod(
            "Period must be positive".to_string(),
        ));
    }
    if closes.len() < required {
        return Err(IndicatorError::InsufficientData {
            required,
            available: closes.len(),
        });
    }
    Ok(&closes[closes.len() - required..])
}

fn validate_price(price: f64) -> Result<(), IndicatorError> {
    if !price.is_finite() || price <= 0.0 {
        return Err(IndicatorError::InvalidCalculation(format!(
            "Invalid price: {}",
            price
        )));
    }
    Ok(())
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn population_std_dev(values: &[f64]) -> f64 {
    let mean = mean(values);
    let variance = values
        .iter()
        .map(|value| {
            let diff = value - mean;
            diff * diff
        })
        .sum::<f64>()
        / values.len() as f64;
    variance.sqrt()
}

/// Day-over-day percentage changes of `closes`.
fn daily_returns(closes: &[f64]) -> Result<Vec<f64>, IndicatorError> {
    closes
        .windows(2)
        .map(|pair| {
            let previous_close = pair[0];
            validate_price(previous_close)?;
            Ok((pair[1] - previous_close) / previous_close * 100.0)
        })
        .collect()
}

pub fn current_price(closes: &[f64]) -> Result<f64, IndicatorError> {
    tail(closes, 1).map(|last| last[0])
}

pub fn simple_moving_average(closes: &[f64], period: usize) -> Result<f64, IndicatorError> {
    tail(closes, period).map(mean)
}

/// Seeds with the simple average of the oldest `period` closes in the
/// lookback, then smooths forward with `alpha = 2 / (period + 1)`.
pub fn exponential_moving_average(closes: &[f64], period: usize) -> Result<f64, IndicatorError> {
    tail(closes, period)?;
    let available = closes.len().min(period * EMA_LOOKBACK_WINDOWS);
    let prices = &closes[closes.len() - available..];

    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut ema = mean(&prices[..period]);
    for price in &prices[period..] {
        ema = price * multiplier + ema * (1.0 - multiplier);
    }
    Ok(ema)
}

/// Percentage change from the close `period` days ago to the latest close.
pub fn cumulative_return(closes: &[f64], period: usize) -> Result<f64, IndicatorError> {
    let prices = tail(closes, period + 1)?;
    let start_price = prices[0];
    validate_price(start_price)?;
    Ok((prices[period] - start_price) / start_price * 100.0)
}

pub fn moving_average_of_returns(closes: &[f64], period: usize) -> Result<f64, IndicatorError> {
    let prices = tail(closes, period + 1)?;
    Ok(mean(&daily_returns(prices)?))
}

/// Average gain against average loss over the last `period` changes. With
/// exactly `period` changes Wilder's smoothing reduces to the plain mean.
pub fn relative_strength_index(closes: &[f64], period: usize) -> Result<f64, IndicatorError> {
    let prices = tail(closes, period + 1)?;

    let (gains, losses): (Vec<f64>, Vec<f64>) = prices
        .windows(2)
        .map(|pair| {
            let change = pair[1] - pair[0];
            if change > 0.0 {
                (change, 0.0)
            } else {
                (0.0, change.abs())
            }
        })
        .unzip();

    let avg_gain = mean(&gains);
    let avg_loss = mean(&losses);

    if avg_loss == 0.0 {
        return Ok(100.0);
    }
    let rs = avg_gain / avg_loss;
    Ok(100.0 - (100.0 / (1.0 + rs)))
}

pub fn price_standard_deviation(closes: &[f64], period: usize) -> Result<f64, IndicatorError> {
    tail(closes, period).map(population_std_dev)
}

pub fn returns_standard_deviation(closes: &[f64], period: usize) -> Result<f64, IndicatorError> {
    let prices = tail(closes, period + 1)?;
    Ok(population_std_dev(&daily_returns(prices)?))
}

/// Largest peak-to-trough decline within the last `period` closes, as a
/// non-negative percentage of the peak.
pub fn max_drawdown(closes: &[f64], period: usize) -> Result<f64, IndicatorError> {
    let prices = tail(closes, period)?;

    let mut max_drawdown: f64 = 0.0;
    let mut peak_price = f64::NEG_INFINITY;
    for &close in prices {
        if close > peak_price {
            validate_price(close)?;
            peak_price = close;
        }
        let drawdown = (peak_price - close) / peak_price * 100.0;
        max_drawdown = max_drawdown.max(drawdown);
    }
    Ok(max_drawdown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    const CLOSES: [f64; 6] = [10.0, 11.0, 10.5, 12.0, 12.5, 12.0];

    #[test]
    fn test_current_price_and_sma() {
        assert_eq!(current_price(&CLOSES).unwrap(), 12.0);
        assert_abs_diff_eq!(
            simple_moving_average(&CLOSES, 3).unwrap(),
            (12.0 + 12.5 + 12.0) / 3.0,
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(
            simple_moving_average(&CLOSES, 6).unwrap(),
            68.0 / 6.0,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_ema_seeds_with_sma_and_smooths_forward() {
        // Lookback is 2 * 3 = 6 closes: seed on the first three, then three updates.
        let alpha = 2.0 / 4.0;
        let mut expected = (10.0 + 11.0 + 10.5) / 3.0;
        for price in [12.0, 12.5, 12.0] {
            expected = price * alpha + expected * (1.0 - alpha);
        }
        assert_abs_diff_eq!(
            exponential_moving_average(&CLOSES, 3).unwrap(),
            expected,
            epsilon = 1e-12
        );

        // Only one window of history: the EMA is the seed average.
        assert_abs_diff_eq!(
            exponential_moving_average(&CLOSES[3..], 3).unwrap(),
            (12.0 + 12.5 + 12.0) / 3.0,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_ema_ignores_history_beyond_lookback() {
        let mut longer = vec![1000.0, 1000.0];
        longer.extend_from_slice(&CLOSES);
        assert_eq!(
            exponential_moving_average(&longer, 3).unwrap(),
            exponential_moving_average(&CLOSES, 3).unwrap()
        );
    }

    #[test]
    fn test_cumulative_return() {
        assert_abs_diff_eq!(
            cumulative_return(&CLOSES, 5).unwrap(),
            20.0,
            epsilon = 1e-9
        );
        assert_abs_diff_eq!(
            cumulative_return(&CLOSES, 1).unwrap(),
            (12.0 - 12.5) / 12.5 * 100.0,
            epsilon = 1e-9
        );
        assert_eq!(
            cumulative_return(&CLOSES, 6),
            Err(IndicatorError::InsufficientData {
                required: 7,
                available: 6
            })
        );
    }

    #[test]
    fn test_moving_average_of_returns() {
        let closes = [100.0, 110.0, 99.0];
        // +10% then -10%
        assert_abs_diff_eq!(
            moving_average_of_returns(&closes, 2).unwrap(),
            0.0,
            epsilon = 1e-9
        );
        assert_abs_diff_eq!(
            moving_average_of_returns(&closes, 1).unwrap(),
            -10.0,
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_rsi() {
        // Last four changes: -0.5, +1.5, +0.5, -0.5
        let closes = [10.0, 11.0, 10.5, 12.0, 12.5, 12.0];
        let avg_gain = (1.5 + 0.5) / 4.0;
        let avg_loss = (0.5 + 0.5) / 4.0;
        let expected = 100.0 - 100.0 / (1.0 + avg_gain / avg_loss);
        assert_abs_diff_eq!(
            relative_strength_index(&closes, 4).unwrap(),
            expected,
            epsilon = 1e-9
        );

        let rising = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(relative_strength_index(&rising, 3).unwrap(), 100.0);

        let falling = [4.0, 3.0, 2.0, 1.0];
        assert_eq!(relative_strength_index(&falling, 3).unwrap(), 0.0);
    }

    #[test]
    fn test_standard_deviations_are_population() {
        let closes = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert_abs_diff_eq!(
            price_standard_deviation(&closes, 8).unwrap(),
            2.0,
            epsilon = 1e-12
        );

        // Returns: +100%, -50% -> mean 25, deviations 75 -> std 75
        let closes = [1.0, 2.0, 1.0];
        assert_abs_diff_eq!(
            returns_standard_deviation(&closes, 2).unwrap(),
            75.0,
            epsilon = 1e-9
        );

        let flat = [5.0, 5.0, 5.0];
        assert_eq!(returns_standard_deviation(&flat, 2).unwrap(), 0.0);
    }

    #[test]
    fn test_max_drawdown() {
        let rising = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(max_drawdown(&rising, 5).unwrap(), 0.0);

        assert_abs_diff_eq!(
            max_drawdown(&[100.0, 80.0, 120.0], 3).unwrap(),
            20.0,
            epsilon = 1e-12
        );

        // Only the window counts: the 100 -> 50 crash is outside it.
        let closes = [100.0, 50.0, 60.0, 54.0, 70.0];
        assert_abs_diff_eq!(max_drawdown(&closes, 3).unwrap(), 10.0, epsilon = 1e-12);
    }

    #[test]
    fn test_insufficient_data() {
        assert_eq!(
            simple_moving_average(&CLOSES, 7),
            Err(IndicatorError::InsufficientData {
                required: 7,
                available: 6
            })
        );
        assert_eq!(
            relative_strength_index(&CLOSES, 6),
            Err(IndicatorError::InsufficientData {
                required: 7,
                available: 6
            })
        );
        assert!(matches!(
            current_price(&[]),
            Err(IndicatorError::InsufficientData { required: 1, .. })
        ));
    }

    #[test]
    fn test_compute_checks_window_before_data() {
        assert!(matches!(
            compute(FunctionName::SimpleMovingAverage, Some(0), &CLOSES),
            Err(IndicatorError::InvalidPeriod(_))
        ));
        assert!(matches!(
            compute(FunctionName::SimpleMovingAverage, Some(253), &[]),
            Err(IndicatorError::InvalidPeriod(_))
        ));
        assert!(matches!(
            compute(FunctionName::CurrentPrice, Some(5), &CLOSES),
            Err(IndicatorError::InvalidPeriod(_))
        ));
        assert!(matches!(
            compute(FunctionName::MaxDrawdown, None, &CLOSES),
            Err(IndicatorError::InvalidPeriod(_))
        ));
        assert_eq!(compute(FunctionName::CurrentPrice, None, &CLOSES).unwrap(), 12.0);
    }

    #[test]
    fn test_zero_reference_price_is_rejected() {
        assert!(matches!(
            cumulative_return(&[0.0, 1.0], 1),
            Err(IndicatorError::InvalidCalculation(_))
        ));
    }

    #[test]
    fn test_lookback() {
        assert_eq!(lookback(FunctionName::CurrentPrice, 1), 1);
        assert_eq!(lookback(FunctionName::SimpleMovingAverage, 20), 20);
        assert_eq!(lookback(FunctionName::CumulativeReturn, 20), 21);
        assert_eq!(lookback(FunctionName::ExponentialMovingAverage, 20), 40);
    }
}
