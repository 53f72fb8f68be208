use crate::market::market_data::{MarketData, MarketDataError};
use crate::market::price_provider::BoxFuture;
use crate::portfolio::blocks::models::{Block, SelectConfig, SelectOption, SortFunction};
use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

/// An asset that survived ranking. `position` is its index among the
/// filter's children.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedAsset {
    pub ticker: String,
    pub value: f64,
    pub position: usize,
}

/// An asset left out of ranking because its sort metric had no data.
#[derive(Debug, Clone, PartialEq)]
pub struct Exclusion {
    pub ticker: String,
    pub reason: MarketDataError,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterSelection {
    /// Kept assets, best ranked first.
    pub selected: Vec<RankedAsset>,
    pub excluded: Vec<Exclusion>,
}

impl FilterSelection {
    pub fn tickers(&self) -> impl Iterator<Item = &str> {
        self.selected.iter().map(|asset| asset.ticker.as_str())
    }
}

/// Ranks the Asset children of a filter by `sort_function` and keeps the
/// top or bottom `select.amount`.
///
/// Ties keep child order. Assets whose metric cannot be computed for lack of
/// history are excluded and reported; any other failure aborts the filter.
pub async fn apply_filter(
    sort_function: &SortFunction,
    select: &SelectConfig,
    assets: &[Block],
    market: &MarketData<'_>,
    max_concurrent_tasks: usize,
) -> Result<FilterSelection, MarketDataError> {
    debug!(
        "Starting filter application: function={}, window={:?}, select={:?} {}",
        sort_function.function_name, sort_function.window_of_days, select.option, select.amount
    );

    let mut lookups: Vec<BoxFuture<'_, (usize, &str, Result<f64, MarketDataError>)>> =
        Vec::with_capacity(assets.len());
    for (position, asset) in assets.iter().enumerate() {
        let Some(ticker) = asset.ticker() else {
            continue;
        };
        let function = sort_function.for_asset(ticker);
        lookups.push(Box::pin(async move {
            let value = market.evaluate(&function).await;
            (position, ticker, value)
        }));
    }
    let metrics: Vec<_> = stream::iter(lookups)
        .buffered(max_concurrent_tasks.max(1))
        .collect()
        .await;

    let mut selection = FilterSelection::default();
    for (position, ticker, value) in metrics {
        match value {
            Ok(value) => {
                debug!("Asset {} has value: {}", ticker, value);
                selection.selected.push(RankedAsset {
                    ticker: ticker.to_string(),
                    value,
                    position,
                });
            }
            Err(reason) if reason.is_insufficient_data() => {
                warn!("Excluding {} from filter ranking: {}", ticker, reason);
                selection.excluded.push(Exclusion {
                    ticker: ticker.to_string(),
                    reason,
                });
            }
            Err(reason) => return Err(reason),
        }
    }

    rank(&mut selection.selected, select.option);
    selection.selected.truncate(select.amount as usize);

    if selection.selected.is_empty() {
        warn!("No assets left after filtering");
    } else {
        debug!(
            "Selected tickers: {:?}",
            selection.tickers().collect::<Vec<_>>()
        );
    }
    Ok(selection)
}

/// Stable sort: descending for Top, ascending for Bottom.
fn rank(assets: &mut [RankedAsset], option: SelectOption) {
    match option {
        SelectOption::Top => assets.sort_by(|a, b| b.value.total_cmp(&a.value)),
        SelectOption::Bottom => assets.sort_by(|a, b| a.value.total_cmp(&b.value)),
    }
}
