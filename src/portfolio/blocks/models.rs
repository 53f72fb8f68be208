//! Investment strategy block tree.
//!
//! A strategy is a tree of blocks. Groups name a sub-strategy, Weights split
//! capital between their children, Conditions pick one of two branches,
//! Filters rank a set of assets, and Assets are the leaves.

use crate::portfolio::construction::validate_json::{AssetError, BlockError, ValidationError};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

/// Tolerance used for weight sums and for `=` comparisons.
pub const WEIGHT_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "blocktype")]
pub enum Block {
    Asset {
        ticker: String,
        company_name: String,
        exchange: String,
    },
    Group {
        name: String,
        children: Vec<Block>,
    },
    Weight {
        #[serde(flatten)]
        weight: WeightSpec,
        children: Vec<Block>,
    },
    Condition {
        function: FunctionDefinition,
        operator: ComparisonOperator,
        compare_to: CompareToValue,
        children: Vec<Block>,
    },
    Filter {
        sort_function: SortFunction,
        select: SelectConfig,
        children: Vec<Block>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    Asset,
    Group,
    Weight,
    Condition,
    Filter,
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BlockType::Asset => "Asset",
            BlockType::Group => "Group",
            BlockType::Weight => "Weight",
            BlockType::Condition => "Condition",
            BlockType::Filter => "Filter",
        };
        f.write_str(name)
    }
}

impl Block {
    pub fn blocktype(&self) -> BlockType {
        match self {
            Block::Asset { .. } => BlockType::Asset,
            Block::Group { .. } => BlockType::Group,
            Block::Weight { .. } => BlockType::Weight,
            Block::Condition { .. } => BlockType::Condition,
            Block::Filter { .. } => BlockType::Filter,
        }
    }

    pub fn children(&self) -> &[Block] {
        match self {
            Block::Asset { .. } => &[],
            Block::Group { children, .. }
            | Block::Weight { children, .. }
            | Block::Condition { children, .. }
            | Block::Filter { children, .. } => children,
        }
    }

    /// Ticker of an Asset block.
    pub fn ticker(&self) -> Option<&str> {
        match self {
            Block::Asset { ticker, .. } => Some(ticker),
            _ => None,
        }
    }
}

/// The Filter of a Weight block whose only child is a Filter.
pub fn single_filter(
    weight_children: &[Block],
) -> Option<(&SortFunction, &SelectConfig, &[Block])> {
    match weight_children {
        [Block::Filter {
            sort_function,
            select,
            children,
        }] => Some((sort_function, select, children)),
        _ => None,
    }
}

/// Number of ranked assets a Weight over a single Filter can weight.
pub fn weight_slot_count(weight_children: &[Block]) -> usize {
    match single_filter(weight_children) {
        Some((_, select, assets)) => (select.amount as usize).min(assets.len()),
        None => weight_children.len(),
    }
}

/// A Weight whose only child is a Filter weights the filter's selected
/// assets one by one, in rank order. A specified weight with a single value
/// instead gives the whole filter that value, split equally.
pub fn expanded_filter<'a>(
    weight: &WeightSpec,
    weight_children: &'a [Block],
) -> Option<(&'a SortFunction, &'a SelectConfig, &'a [Block])> {
    match weight {
        WeightSpec::Specified { values, .. } if values.len() == weight_children.len() => None,
        _ => single_filter(weight_children),
    }
}

impl<'de> Deserialize<'de> for Block {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        decode_block(value, &BlockPath::root()).map_err(serde::de::Error::custom)
    }
}

/// Block attributes without children. Children are decoded separately so a
/// failure deep in the tree reports the path of the node that caused it.
#[derive(Deserialize)]
#[serde(tag = "blocktype")]
enum BlockHeader {
    Asset {
        ticker: String,
        company_name: String,
        exchange: String,
    },
    Group {
        name: String,
    },
    Weight {
        #[serde(flatten)]
        weight: WeightSpec,
    },
    Condition {
        #[serde(alias = "function_spec")]
        function: FunctionDefinition,
        operator: ComparisonOperator,
        compare_to: CompareToValue,
    },
    Filter {
        sort_function: SortFunction,
        select: SelectConfig,
    },
}

pub(crate) fn decode_block(value: Value, path: &BlockPath) -> Result<Block, ValidationError> {
    let Value::Object(mut fields) = value else {
        return Err(ValidationError::new(
            path.clone(),
            BlockError::Malformed("block must be a JSON object".to_string()),
        ));
    };

    let raw_children = fields.remove("children");
    let header: BlockHeader = serde_json::from_value(Value::Object(fields))
        .map_err(|e| ValidationError::new(path.clone(), BlockError::Malformed(e.to_string())))?;

    Ok(match header {
        BlockHeader::Asset {
            ticker,
            company_name,
            exchange,
        } => {
            if raw_children.is_some_and(|c| !c.is_null()) {
                return Err(ValidationError::new(
                    path.clone(),
                    BlockError::Asset(AssetError::HasChildren),
                ));
            }
            Block::Asset {
                ticker,
                company_name,
                exchange,
            }
        }
        BlockHeader::Group { name } => Block::Group {
            name,
            children: decode_children(raw_children, path)?,
        },
        BlockHeader::Weight { weight } => Block::Weight {
            weight,
            children: decode_children(raw_children, path)?,
        },
        BlockHeader::Condition {
            function,
            operator,
            compare_to,
        } => Block::Condition {
            function,
            operator,
            compare_to,
            children: decode_children(raw_children, path)?,
        },
        BlockHeader::Filter {
            sort_function,
            select,
        } => Block::Filter {
            sort_function,
            select,
            children: decode_children(raw_children, path)?,
        },
    })
}

fn decode_children(raw: Option<Value>, path: &BlockPath) -> Result<Vec<Block>, ValidationError> {
    match raw {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .into_iter()
            .enumerate()
            .map(|(index, child)| decode_block(child, &path.child(index)))
            .collect(),
        Some(_) => Err(ValidationError::new(
            path.clone(),
            BlockError::Malformed("children must be an array".to_string()),
        )),
    }
}

/// Location of a block inside the tree, as child indices from the root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct BlockPath(Vec<usize>);

impl BlockPath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn child(&self, index: usize) -> Self {
        let mut indices = self.0.clone();
        indices.push(index);
        Self(indices)
    }

    pub fn indices(&self) -> &[usize] {
        &self.0
    }
}

impl fmt::Display for BlockPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("$")?;
        for index in &self.0 {
            write!(f, ".children[{}]", index)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WeightSpec {
    Equal,
    Specified {
        allocation_type: AllocationType,
        values: Vec<f64>,
    },
    InverseVolatility {
        window_of_trading_days: u32,
    },
    MarketCap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationType {
    Percentage,
    Fraction,
}

impl AllocationType {
    /// What the `values` of a specified weight must add up to.
    pub fn target_sum(&self) -> f64 {
        match self {
            AllocationType::Percentage => 100.0,
            AllocationType::Fraction => 1.0,
        }
    }

    pub fn to_fraction(&self, value: f64) -> f64 {
        value / self.target_sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionName {
    CurrentPrice,
    #[serde(alias = "sma")]
    SimpleMovingAverage,
    #[serde(alias = "ema")]
    ExponentialMovingAverage,
    CumulativeReturn,
    #[serde(alias = "ma_of_returns")]
    MovingAverageOfReturns,
    #[serde(alias = "rsi")]
    RelativeStrengthIndex,
    #[serde(alias = "price_std_dev")]
    PriceStandardDeviation,
    #[serde(alias = "returns_std_dev")]
    ReturnsStandardDeviation,
    MaxDrawdown,
}

impl FunctionName {
    pub const ALL: [FunctionName; 9] = [
        FunctionName::CurrentPrice,
        FunctionName::SimpleMovingAverage,
        FunctionName::ExponentialMovingAverage,
        FunctionName::CumulativeReturn,
        FunctionName::MovingAverageOfReturns,
        FunctionName::RelativeStrengthIndex,
        FunctionName::PriceStandardDeviation,
        FunctionName::ReturnsStandardDeviation,
        FunctionName::MaxDrawdown,
    ];

    pub fn requires_window_of_days(&self) -> bool {
        !matches!(self, FunctionName::CurrentPrice)
    }

    pub fn max_window_of_days(&self) -> u32 {
        match self {
            FunctionName::ExponentialMovingAverage => 500,
            _ => 252,
        }
    }

    /// Functions built on day-over-day changes need one extra close as the
    /// reference for the first change.
    pub fn is_return_based(&self) -> bool {
        matches!(
            self,
            FunctionName::CumulativeReturn
                | FunctionName::MovingAverageOfReturns
                | FunctionName::RelativeStrengthIndex
                | FunctionName::ReturnsStandardDeviation
        )
    }
}

impl fmt::Display for FunctionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FunctionName::CurrentPrice => "current_price",
            FunctionName::SimpleMovingAverage => "simple_moving_average",
            FunctionName::ExponentialMovingAverage => "exponential_moving_average",
            FunctionName::CumulativeReturn => "cumulative_return",
            FunctionName::MovingAverageOfReturns => "moving_average_of_returns",
            FunctionName::RelativeStrengthIndex => "relative_strength_index",
            FunctionName::PriceStandardDeviation => "price_standard_deviation",
            FunctionName::ReturnsStandardDeviation => "returns_standard_deviation",
            FunctionName::MaxDrawdown => "max_drawdown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub function_name: FunctionName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_of_days: Option<u32>,
    pub asset: String,
}

/// Sort function of a filter. The asset comes from each ranked child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortFunction {
    pub function_name: FunctionName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_of_days: Option<u32>,
}

impl SortFunction {
    pub fn for_asset(&self, ticker: &str) -> FunctionDefinition {
        FunctionDefinition {
            function_name: self.function_name,
            window_of_days: self.window_of_days,
            asset: ticker.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparisonOperator {
    #[serde(rename = ">")]
    GreaterThan,
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = "=", alias = "==")]
    Equal,
    #[serde(rename = ">=")]
    GreaterThanOrEqual,
    #[serde(rename = "<=")]
    LessThanOrEqual,
}

impl fmt::Display for ComparisonOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            ComparisonOperator::GreaterThan => ">",
            ComparisonOperator::LessThan => "<",
            ComparisonOperator::Equal => "=",
            ComparisonOperator::GreaterThanOrEqual => ">=",
            ComparisonOperator::LessThanOrEqual => "<=",
        };
        f.write_str(symbol)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CompareToValue {
    #[serde(alias = "fixed_value")]
    Fixed {
        value: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        unit: Option<ValueUnit>,
    },
    Function {
        function: FunctionDefinition,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueUnit {
    #[serde(rename = "$")]
    Dollar,
    #[serde(rename = "%")]
    Percent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectOption {
    #[serde(alias = "top")]
    Top,
    #[serde(alias = "bottom")]
    Bottom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectConfig {
    pub option: SelectOption,
    pub amount: u32,
}
