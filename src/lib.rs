//! Evaluates block-tree investment strategies into ticker weights.

pub mod config;
pub mod market;
pub mod portfolio;

pub use config::Settings;
pub use market::database_functions::{create_pool, PostgresMarketData};
pub use market::price_provider::{
    InMemoryPriceProvider, MarketCapProvider, PriceBar, PriceSeriesProvider, ProviderError,
};
pub use portfolio::allocation::{Allocation, AllocationRecord};
pub use portfolio::blocks::models::{Block, BlockPath};
pub use portfolio::construction::validate_json::{
    parse_strategy, parse_validated_strategy, serialize_strategy, Validate, ValidatedStrategy,
    ValidationError,
};
pub use portfolio::execution::strategy_executor::{EvaluationError, StrategyExecutor};
