pub mod strategy_executor;
