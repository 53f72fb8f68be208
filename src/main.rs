use chrono::NaiveDate;
use std::error::Error;
use std::{env, fs};
use strategy_evaluator::{
    create_pool, parse_validated_strategy, PostgresMarketData, Settings, StrategyExecutor,
};
use tracing::info;

const USAGE: &str = "usage: strategy_evaluator <strategy.json> <YYYY-MM-DD>";

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();

    let mut args = env::args().skip(1);
    let (Some(strategy_path), Some(date)) = (args.next(), args.next()) else {
        return Err(USAGE.into());
    };
    let as_of = NaiveDate::parse_from_str(&date, "%Y-%m-%d")?;

    let settings = Settings::from_env()?;
    let strategy = parse_validated_strategy(&fs::read_to_string(&strategy_path)?)?;
    info!("Loaded strategy from {}", strategy_path);

    let market_data = PostgresMarketData::new(create_pool(&settings)?);
    let allocation = StrategyExecutor::new(&market_data)
        .with_market_caps(&market_data)
        .with_settings(&settings)
        .execute(&strategy, as_of)
        .await?;

    println!("{}", serde_json::to_string_pretty(&allocation)?);
    Ok(())
}
