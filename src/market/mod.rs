pub mod database_functions;
pub mod indicators;
pub mod market_data;
pub mod price_provider;
