use crate::config::{Settings, DEFAULT_MAX_CONCURRENT_TASKS};
use crate::market::market_data::{MarketData, MarketDataError};
use crate::market::price_provider::{BoxFuture, MarketCapProvider, PriceSeriesProvider};
use crate::portfolio::allocation::Allocation;
use crate::portfolio::blocks::condition;
use crate::portfolio::blocks::filter::apply_filter;
use crate::portfolio::blocks::models::{expanded_filter, Block, BlockPath};
use crate::portfolio::blocks::weighting::{self, WeightedChild, WeightingError};
use crate::portfolio::construction::validate_json::{Validate, ValidatedStrategy, ValidationError};
use chrono::NaiveDate;
use futures::stream::{self, StreamExt, TryStreamExt};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EvaluationError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Market data error at {path}: {source}")]
    MarketData {
        path: BlockPath,
        source: MarketDataError,
    },
    #[error("Degenerate weight at {path}: {reason}")]
    DegenerateWeight { path: BlockPath, reason: String },
    #[error("Invalid allocation at {path}: {reason}")]
    InvalidAllocation { path: BlockPath, reason: String },
}

impl EvaluationError {
    /// The block the evaluation failed at.
    pub fn path(&self) -> &BlockPath {
        match self {
            EvaluationError::Validation(error) => &error.path,
            EvaluationError::MarketData { path, .. }
            | EvaluationError::DegenerateWeight { path, .. }
            | EvaluationError::InvalidAllocation { path, .. } => path,
        }
    }

    fn market_data(path: &BlockPath, source: MarketDataError) -> Self {
        EvaluationError::MarketData {
            path: path.clone(),
            source,
        }
    }

    fn weighting(path: &BlockPath, error: WeightingError) -> Self {
        match error {
            WeightingError::MarketData(source) => Self::market_data(path, source),
            WeightingError::Degenerate(reason) => EvaluationError::DegenerateWeight {
                path: path.clone(),
                reason,
            },
            WeightingError::InvalidWeight(error) => EvaluationError::InvalidAllocation {
                path: path.clone(),
                reason: error.to_string(),
            },
        }
    }
}

/// Resolves strategy trees into allocations against a set of price providers.
///
/// Sibling subtrees of a Weight block are evaluated concurrently, at most
/// `max_concurrent_tasks` at a time. Only the taken branch of a Condition is
/// ever evaluated.
#[derive(Clone, Copy)]
pub struct StrategyExecutor<'a> {
    prices: &'a dyn PriceSeriesProvider,
    market_caps: Option<&'a dyn MarketCapProvider>,
    max_concurrent_tasks: usize,
}

impl<'a> StrategyExecutor<'a> {
    pub fn new(prices: &'a dyn PriceSeriesProvider) -> Self {
        Self {
            prices,
            market_caps: None,
            max_concurrent_tasks: DEFAULT_MAX_CONCURRENT_TASKS,
        }
    }

    pub fn with_market_caps(mut self, market_caps: &'a dyn MarketCapProvider) -> Self {
        self.market_caps = Some(market_caps);
        self
    }

    pub fn with_max_concurrent_tasks(mut self, max_concurrent_tasks: usize) -> Self {
        self.max_concurrent_tasks = max_concurrent_tasks.max(1);
        self
    }

    pub fn with_settings(self, settings: &Settings) -> Self {
        self.with_max_concurrent_tasks(settings.max_concurrent_tasks)
    }

    /// Validates `tree`, then evaluates it as of `as_of`. An invalid tree is
    /// rejected before any price data is read.
    pub async fn evaluate(
        &self,
        tree: &Block,
        as_of: NaiveDate,
    ) -> Result<Allocation, EvaluationError> {
        tree.validate()?;
        self.execute_root(tree, as_of).await
    }

    /// Evaluates an already validated strategy.
    pub async fn execute(
        &self,
        strategy: &ValidatedStrategy,
        as_of: NaiveDate,
    ) -> Result<Allocation, EvaluationError> {
        self.execute_root(strategy.root(), as_of).await
    }

    async fn execute_root(
        &self,
        root: &Block,
        as_of: NaiveDate,
    ) -> Result<Allocation, EvaluationError> {
        info!("Starting strategy execution for date: {}", as_of);
        let market = MarketData::new(self.prices, self.market_caps, as_of);
        let allocation =
            execute_block(root, BlockPath::root(), market, self.max_concurrent_tasks).await?;

        if allocation.is_empty() {
            warn!("Strategy has no tradable assets as of {}", as_of);
        } else if !allocation.is_complete() {
            return Err(EvaluationError::InvalidAllocation {
                path: BlockPath::root(),
                reason: format!("weights sum to {}", allocation.total_weight()),
            });
        }
        info!(
            "Strategy execution finished with {} assets",
            allocation.len()
        );
        Ok(allocation)
    }
}

fn execute_block<'a>(
    block: &'a Block,
    path: BlockPath,
    market: MarketData<'a>,
    max_concurrent_tasks: usize,
) -> BoxFuture<'a, Result<Allocation, EvaluationError>> {
    Box::pin(async move {
        match block {
            Block::Asset { ticker, .. } => Ok(Allocation::unit(ticker)),
            Block::Group { name, children } => {
                debug!("Executing group: {}", name);
                match children.first() {
                    Some(weight) => {
                        execute_block(weight, path.child(0), market, max_concurrent_tasks).await
                    }
                    None => Ok(Allocation::empty()),
                }
            }
            Block::Condition {
                function,
                operator,
                compare_to,
                children,
            } => {
                let condition_met = condition::resolve(function, *operator, compare_to, &market)
                    .await
                    .map_err(|e| EvaluationError::market_data(&path, e))?;

                let branch = if condition_met { 0 } else { 1 };
                debug!(
                    "Condition at {} {} - executing branch {}",
                    path,
                    if condition_met { "met" } else { "not met" },
                    branch
                );
                let child = children.get(branch).ok_or_else(|| {
                    EvaluationError::InvalidAllocation {
                        path: path.clone(),
                        reason: format!("condition has no branch {}", branch),
                    }
                })?;
                execute_block(child, path.child(branch), market, max_concurrent_tasks).await
            }
            Block::Filter {
                sort_function,
                select,
                children,
            } => {
                let selection =
                    apply_filter(sort_function, select, children, &market, max_concurrent_tasks)
                        .await
                        .map_err(|e| EvaluationError::market_data(&path, e))?;
                Ok(Allocation::equal(selection.tickers()))
            }
            Block::Weight { weight, children } => {
                debug!("Executing weight block at {}: {:?}", path, weight);
                let weighted: Vec<WeightedChild<'_>> = match expanded_filter(weight, children) {
                    Some((sort_function, select, assets)) => {
                        let filter_path = path.child(0);
                        let selection = apply_filter(
                            sort_function,
                            select,
                            assets,
                            &market,
                            max_concurrent_tasks,
                        )
                        .await
                        .map_err(|e| EvaluationError::market_data(&filter_path, e))?;

                        selection
                            .selected
                            .iter()
                            .enumerate()
                            .map(|(slot, ranked)| WeightedChild {
                                slot,
                                ticker: assets.get(ranked.position).and_then(Block::ticker),
                                allocation: Allocation::unit(&ranked.ticker),
                            })
                            .collect()
                    }
                    None => execute_children(children, &path, market, max_concurrent_tasks)
                        .await?
                        .into_iter()
                        .zip(children)
                        .enumerate()
                        .map(|(slot, (allocation, child))| WeightedChild {
                            slot,
                            ticker: child.ticker(),
                            allocation,
                        })
                        .collect(),
                };

                weighting::allocate(weight, weighted, &market, max_concurrent_tasks)
                    .await
                    .map_err(|e| EvaluationError::weighting(&path, e))
            }
        }
    })
}

/// Evaluates sibling blocks concurrently, keeping child order. The first
/// failing child aborts the rest.
async fn execute_children<'a>(
    children: &'a [Block],
    path: &BlockPath,
    market: MarketData<'a>,
    max_concurrent_tasks: usize,
) -> Result<Vec<Allocation>, EvaluationError> {
    debug!("Executing {} children of {}", children.len(), path);
    let evaluations: Vec<BoxFuture<'a, Result<Allocation, EvaluationError>>> = children
        .iter()
        .enumerate()
        .map(|(index, child)| execute_block(child, path.child(index), market, max_concurrent_tasks))
        .collect();
    stream::iter(evaluations)
        .buffered(max_concurrent_tasks.max(1))
        .try_collect()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::price_provider::InMemoryPriceProvider;
    use crate::portfolio::construction::validate_json::{BlockError, GroupError};
    use approx::assert_abs_diff_eq;
    use serde_json::json;

    fn as_of() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 28).unwrap()
    }

    fn asset(ticker: &str) -> serde_json::Value {
        json!({
            "blocktype": "Asset",
            "ticker": ticker,
            "company_name": format!("{} Corp", ticker),
            "exchange": "NASDAQ"
        })
    }

    fn block(value: serde_json::Value) -> Block {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_equal_weight_group() {
        let provider = InMemoryPriceProvider::new();
        let executor = StrategyExecutor::new(&provider);
        let tree = block(json!({
            "blocktype": "Group",
            "name": "Equal",
            "children": [{
                "blocktype": "Weight",
                "type": "equal",
                "children": [asset("SPY"), asset("TLT"), asset("GLD"), asset("QQQ")]
            }]
        }));

        let allocation = executor.evaluate(&tree, as_of()).await.unwrap();
        assert_eq!(allocation.len(), 4);
        for (_, weight) in allocation.iter() {
            assert_abs_diff_eq!(weight, 0.25, epsilon = 1e-6);
        }
    }

    #[tokio::test]
    async fn test_asset_root() {
        let provider = InMemoryPriceProvider::new();
        let executor = StrategyExecutor::new(&provider);

        let allocation = executor.evaluate(&block(asset("SHY")), as_of()).await.unwrap();
        assert_eq!(allocation, Allocation::unit("SHY"));
    }

    #[tokio::test]
    async fn test_untaken_branch_is_not_evaluated() {
        let provider = InMemoryPriceProvider::new()
            .with_closes("SPY", as_of(), &[100.0, 101.0])
            .with_closes("QQQ", as_of(), &[300.0, 310.0]);
        let executor = StrategyExecutor::new(&provider);
        let tree = block(json!({
            "blocktype": "Condition",
            "function": {"function_name": "current_price", "asset": "SPY"},
            "operator": ">",
            "compare_to": {"type": "fixed", "value": 50},
            "children": [
                asset("SPY"),
                {
                    "blocktype": "Filter",
                    "sort_function": {"function_name": "current_price"},
                    "select": {"option": "Top", "amount": 1},
                    "children": [asset("QQQ")]
                }
            ]
        }));

        let allocation = executor.evaluate(&tree, as_of()).await.unwrap();
        assert_eq!(allocation, Allocation::unit("SPY"));
        assert_eq!(provider.request_count("SPY"), 1);
        assert_eq!(provider.request_count("QQQ"), 0);
    }

    #[tokio::test]
    async fn test_weight_over_filter_uses_rank_order() {
        let provider = InMemoryPriceProvider::new()
            .with_closes("AAA", as_of(), &[10.0])
            .with_closes("BBB", as_of(), &[30.0])
            .with_closes("CCC", as_of(), &[20.0]);
        let executor = StrategyExecutor::new(&provider);
        let tree = block(json!({
            "blocktype": "Weight",
            "type": "specified",
            "allocation_type": "percentage",
            "values": [70, 30],
            "children": [{
                "blocktype": "Filter",
                "sort_function": {"function_name": "current_price"},
                "select": {"option": "Top", "amount": 2},
                "children": [asset("AAA"), asset("BBB"), asset("CCC")]
            }]
        }));

        let allocation = executor.evaluate(&tree, as_of()).await.unwrap();
        assert_abs_diff_eq!(allocation.get("BBB").unwrap(), 0.7, epsilon = 1e-9);
        assert_abs_diff_eq!(allocation.get("CCC").unwrap(), 0.3, epsilon = 1e-9);
        assert_eq!(allocation.get("AAA"), None);
    }

    #[tokio::test]
    async fn test_single_value_over_filter_splits_selection_equally() {
        let provider = InMemoryPriceProvider::new()
            .with_closes("AAA", as_of(), &[10.0])
            .with_closes("BBB", as_of(), &[30.0])
            .with_closes("CCC", as_of(), &[20.0]);
        let executor = StrategyExecutor::new(&provider);
        let tree = block(json!({
            "blocktype": "Weight",
            "type": "specified",
            "allocation_type": "percentage",
            "values": [100],
            "children": [{
                "blocktype": "Filter",
                "sort_function": {"function_name": "current_price"},
                "select": {"option": "Top", "amount": 2},
                "children": [asset("AAA"), asset("BBB"), asset("CCC")]
            }]
        }));

        let allocation = executor.evaluate(&tree, as_of()).await.unwrap();
        assert_eq!(allocation.len(), 2);
        assert_abs_diff_eq!(allocation.get("BBB").unwrap(), 0.5, epsilon = 1e-9);
        assert_abs_diff_eq!(allocation.get("CCC").unwrap(), 0.5, epsilon = 1e-9);
    }

    #[tokio::test]
    async fn test_group_ignores_children_after_weight() {
        let provider = InMemoryPriceProvider::new();
        let executor = StrategyExecutor::new(&provider);
        let tree = block(json!({
            "blocktype": "Group",
            "name": "Core",
            "children": [
                {
                    "blocktype": "Weight",
                    "type": "equal",
                    "children": [asset("SPY"), asset("TLT")]
                },
                {
                    "blocktype": "Condition",
                    "function": {"function_name": "current_price", "asset": "XYZ"},
                    "operator": ">",
                    "compare_to": {"type": "fixed", "value": 1},
                    "children": [asset("XYZ"), asset("SHY")]
                },
                {
                    "blocktype": "Filter",
                    "sort_function": {"function_name": "current_price"},
                    "select": {"option": "Top", "amount": 1},
                    "children": [asset("XYZ")]
                }
            ]
        }));

        let allocation = executor.evaluate(&tree, as_of()).await.unwrap();
        assert_eq!(allocation, Allocation::equal(["SPY", "TLT"]));
        assert_eq!(provider.request_count("XYZ"), 0);
    }

    #[tokio::test]
    async fn test_flat_prices_give_degenerate_inverse_volatility() {
        let provider = InMemoryPriceProvider::new().with_closes("CASH", as_of(), &[1.0; 10]);
        let executor = StrategyExecutor::new(&provider);
        let tree = block(json!({
            "blocktype": "Group",
            "name": "Cash",
            "children": [{
                "blocktype": "Weight",
                "type": "inverse_volatility",
                "window_of_trading_days": 5,
                "children": [asset("CASH")]
            }]
        }));

        let err = executor.evaluate(&tree, as_of()).await.unwrap_err();
        assert!(matches!(err, EvaluationError::DegenerateWeight { .. }));
        assert_eq!(err.path(), &BlockPath::root().child(0));
    }

    #[tokio::test]
    async fn test_evaluation_future_is_send() {
        fn assert_send<T: Send>(future: T) -> T {
            future
        }

        let provider = InMemoryPriceProvider::new()
            .with_closes("AAA", as_of(), &[10.0])
            .with_closes("BBB", as_of(), &[30.0]);
        let executor = StrategyExecutor::new(&provider).with_max_concurrent_tasks(2);
        let tree = block(json!({
            "blocktype": "Weight",
            "type": "equal",
            "children": [
                asset("SPY"),
                {
                    "blocktype": "Filter",
                    "sort_function": {"function_name": "current_price"},
                    "select": {"option": "Top", "amount": 1},
                    "children": [asset("AAA"), asset("BBB")]
                }
            ]
        }));

        let allocation = assert_send(executor.evaluate(&tree, as_of())).await.unwrap();
        assert_eq!(allocation, Allocation::equal(["SPY", "BBB"]));
    }

    #[tokio::test]
    async fn test_filter_with_no_data_yields_empty_allocation() {
        let provider = InMemoryPriceProvider::new();
        let executor = StrategyExecutor::new(&provider);
        let tree = block(json!({
            "blocktype": "Filter",
            "sort_function": {"function_name": "current_price"},
            "select": {"option": "Bottom", "amount": 2},
            "children": [asset("NEW1"), asset("NEW2")]
        }));

        let allocation = executor.evaluate(&tree, as_of()).await.unwrap();
        assert!(allocation.is_empty());
    }

    #[tokio::test]
    async fn test_condition_data_error_reports_path() {
        let provider = InMemoryPriceProvider::new();
        let executor = StrategyExecutor::new(&provider);
        let tree = block(json!({
            "blocktype": "Weight",
            "type": "equal",
            "children": [
                asset("SPY"),
                {
                    "blocktype": "Condition",
                    "function": {"function_name": "rsi", "window_of_days": 14, "asset": "XYZ"},
                    "operator": "<",
                    "compare_to": {"type": "fixed", "value": 30},
                    "children": [asset("SPY"), asset("TLT")]
                }
            ]
        }));

        let err = executor.evaluate(&tree, as_of()).await.unwrap_err();
        assert_eq!(err.path(), &BlockPath::root().child(1));
        assert!(matches!(
            err,
            EvaluationError::MarketData { ref source, .. } if source.is_insufficient_data()
        ));
    }

    #[tokio::test]
    async fn test_invalid_tree_is_rejected_before_fetching() {
        let provider = InMemoryPriceProvider::new();
        let executor = StrategyExecutor::new(&provider);
        let tree = block(json!({
            "blocktype": "Group",
            "name": "Broken",
            "children": [asset("SPY")]
        }));

        let err = executor.evaluate(&tree, as_of()).await.unwrap_err();
        assert_eq!(
            err,
            EvaluationError::Validation(ValidationError::new(
                BlockPath::root(),
                BlockError::Group(GroupError::FirstChildNotWeight(
                    crate::portfolio::blocks::models::BlockType::Asset
                ))
            ))
        );
        assert!(provider.requests().is_empty());
    }

    #[tokio::test]
    async fn test_market_cap_requires_provider() {
        let provider = InMemoryPriceProvider::new()
            .with_market_cap("AAPL", 3.0)
            .with_market_cap("MSFT", 1.0);
        let tree = block(json!({
            "blocktype": "Weight",
            "type": "market_cap",
            "children": [asset("AAPL"), asset("MSFT")]
        }));

        let without = StrategyExecutor::new(&provider)
            .evaluate(&tree, as_of())
            .await
            .unwrap_err();
        assert!(matches!(
            without,
            EvaluationError::MarketData {
                source: MarketDataError::MarketCapUnavailable,
                ..
            }
        ));

        let with = StrategyExecutor::new(&provider)
            .with_market_caps(&provider)
            .evaluate(&tree, as_of())
            .await
            .unwrap();
        assert_abs_diff_eq!(with.get("AAPL").unwrap(), 0.75, epsilon = 1e-9);
    }
}
