use crate::market::market_data::{MarketData, MarketDataError};
use crate::portfolio::blocks::models::{
    CompareToValue, ComparisonOperator, FunctionDefinition, WEIGHT_EPSILON,
};
use tracing::debug;

/// Applies `operator` to two indicator values. Equality is tolerant to
/// `WEIGHT_EPSILON`; `>=` and `<=` accept the same tolerance.
pub fn compare(lhs: f64, operator: ComparisonOperator, rhs: f64) -> bool {
    let equal = (lhs - rhs).abs() <= WEIGHT_EPSILON;
    match operator {
        ComparisonOperator::GreaterThan => lhs > rhs,
        ComparisonOperator::LessThan => lhs < rhs,
        ComparisonOperator::Equal => equal,
        ComparisonOperator::GreaterThanOrEqual => lhs > rhs || equal,
        ComparisonOperator::LessThanOrEqual => lhs < rhs || equal,
    }
}

/// Evaluates `function operator compare_to` as of the market data date.
///
/// Fixed values are compared as written: indicators that report percentages
/// (returns, RSI, drawdown) already use percent units, so a `%` value of 5
/// means 5.
pub async fn resolve(
    function: &FunctionDefinition,
    operator: ComparisonOperator,
    compare_to: &CompareToValue,
    market: &MarketData<'_>,
) -> Result<bool, MarketDataError> {
    let lhs = market.evaluate(function).await?;
    let rhs = match compare_to {
        CompareToValue::Fixed { value, .. } => *value,
        CompareToValue::Function { function } => market.evaluate(function).await?,
    };

    let result = compare(lhs, operator, rhs);
    debug!(
        "Condition {}({}) = {} {} {} -> {}",
        function.function_name, function.asset, lhs, operator, rhs, result
    );
    Ok(result)
}
