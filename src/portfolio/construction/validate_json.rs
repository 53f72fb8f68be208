//! Investment portfolio block system validator.
//! Implements validation rules for all block types and their configurations.

use crate::portfolio::blocks::models::{
    decode_block, single_filter, weight_slot_count, Block, BlockPath, BlockType,
    CompareToValue, FunctionName, SelectConfig, SortFunction, WeightSpec, WEIGHT_EPSILON,
};
use serde_json::Value;
use thiserror::Error;

/// A rule violation together with the block that broke it.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Invalid block at {path}: {reason}")]
pub struct ValidationError {
    pub path: BlockPath,
    pub reason: BlockError,
}

impl ValidationError {
    pub fn new(path: BlockPath, reason: BlockError) -> Self {
        Self { path, reason }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BlockError {
    #[error("Group block validation failed: {0}")]
    Group(GroupError),

    #[error("Weight block validation failed: {0}")]
    Weight(WeightError),

    #[error("Condition block validation failed: {0}")]
    Condition(ConditionError),

    #[error("Filter block validation failed: {0}")]
    Filter(FilterError),

    #[error("Asset block validation failed: {0}")]
    Asset(AssetError),

    #[error("Malformed block: {0}")]
    Malformed(String),
}

/// Group block specific errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GroupError {
    #[error("Group block must have at least one child")]
    NoChildren,

    #[error("First child must be a Weight block, found {0}")]
    FirstChildNotWeight(BlockType),

    #[error("Missing name attribute")]
    MissingName,
}

/// Weight block specific errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum WeightError {
    #[error("Values array length ({found}) does not match number of weighted children ({expected})")]
    ValueChildrenMismatch { expected: usize, found: usize },

    #[error("Values must sum to {target} (current sum: {sum:.6})")]
    InvalidSum { sum: f64, target: f64 },

    #[error("Value at position {index} is negative: {value}")]
    NegativeValue { index: usize, value: f64 },

    #[error("Value at position {0} is not a finite number")]
    NonFiniteValue(usize),

    #[error("window_of_trading_days must be between 1 and {max} (found {found})")]
    InvalidVolatilityWindow { found: u32, max: u32 },

    #[error("Child at position {0} must be an Asset block for this weight type")]
    NonAssetChild(usize),
}

/// Condition block specific errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConditionError {
    #[error("Must have exactly 2 children (found {0})")]
    InvalidChildCount(usize),

    #[error("Function validation failed: {0}")]
    Function(FunctionError),

    #[error("Comparison function validation failed: {0}")]
    CompareFunction(FunctionError),

    #[error("Fixed comparison value must be finite")]
    NonFiniteCompareValue,
}

/// Filter block specific errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FilterError {
    #[error("Invalid sort function: {0}")]
    SortFunction(FunctionError),

    #[error("Child at position {0} must be an Asset block")]
    NonAssetChild(usize),

    #[error("Select amount must be positive")]
    InvalidSelectAmount,
}

/// Asset block specific errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AssetError {
    #[error("Asset blocks cannot have children")]
    HasChildren,

    #[error("Missing ticker symbol")]
    MissingTicker,

    #[error("Missing company name")]
    MissingCompanyName,

    #[error("Missing exchange")]
    MissingExchange,
}

/// Indicator function configuration errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FunctionError {
    #[error("Asset cannot be empty")]
    EmptyAsset,

    #[error("Missing window of days for {0} function")]
    MissingWindowDays(FunctionName),

    #[error("Window of days not allowed for {0} function")]
    UnexpectedWindowDays(FunctionName),

    #[error("Window of days for {function} must be between 1 and {max} (found {found})")]
    WindowOutOfRange {
        function: FunctionName,
        found: u32,
        max: u32,
    },
}

/// Validation trait for block structures
pub trait Validate {
    fn validate(&self) -> Result<(), ValidationError>;
}

impl Validate for Block {
    fn validate(&self) -> Result<(), ValidationError> {
        match collect_violations(self).into_iter().next() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// A block tree that passed validation. Evaluating it never re-checks the
/// structural rules.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedStrategy {
    root: Block,
}

impl ValidatedStrategy {
    pub fn new(root: Block) -> Result<Self, ValidationError> {
        root.validate()?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Block {
        &self.root
    }

    pub fn into_inner(self) -> Block {
        self.root
    }
}

impl TryFrom<Block> for ValidatedStrategy {
    type Error = ValidationError;

    fn try_from(root: Block) -> Result<Self, Self::Error> {
        Self::new(root)
    }
}

/// Parses a strategy document. Decoding failures carry the path of the
/// offending block; structural rules are checked separately by `validate`.
pub fn parse_strategy(json_str: &str) -> Result<Block, ValidationError> {
    let value: Value = serde_json::from_str(json_str).map_err(|e| {
        ValidationError::new(
            BlockPath::root(),
            BlockError::Malformed(format!(
                "{} (line {}, column {})",
                e,
                e.line(),
                e.column()
            )),
        )
    })?;
    decode_block(value, &BlockPath::root())
}

/// Parses and validates in one step.
pub fn parse_validated_strategy(json_str: &str) -> Result<ValidatedStrategy, ValidationError> {
    ValidatedStrategy::new(parse_strategy(json_str)?)
}

pub fn serialize_strategy(block: &Block) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(block)
}

/// Every violation in the tree, in depth-first order.
pub fn collect_violations(block: &Block) -> Vec<ValidationError> {
    let mut violations = Vec::new();
    collect_into(block, &BlockPath::root(), &mut violations);
    violations
}

fn collect_into(block: &Block, path: &BlockPath, violations: &mut Vec<ValidationError>) {
    let mut errors = Vec::new();
    match block {
        Block::Group { name, children } => validate_group_block(name, children, &mut errors),
        Block::Weight { weight, children } => validate_weight_block(weight, children, &mut errors),
        Block::Condition {
            function,
            compare_to,
            children,
            ..
        } => {
            if let Err(e) = validate_function_definition(
                function.function_name,
                function.window_of_days,
                Some(&function.asset),
            ) {
                errors.push(BlockError::Condition(ConditionError::Function(e)));
            }
            match compare_to {
                CompareToValue::Function { function } => {
                    if let Err(e) = validate_function_definition(
                        function.function_name,
                        function.window_of_days,
                        Some(&function.asset),
                    ) {
                        errors.push(BlockError::Condition(ConditionError::CompareFunction(e)));
                    }
                }
                CompareToValue::Fixed { value, .. } => {
                    if !value.is_finite() {
                        errors.push(BlockError::Condition(ConditionError::NonFiniteCompareValue));
                    }
                }
            }
            if children.len() != 2 {
                errors.push(BlockError::Condition(ConditionError::InvalidChildCount(
                    children.len(),
                )));
            }
        }
        Block::Filter {
            sort_function,
            select,
            children,
        } => validate_filter_block(sort_function, select, children, &mut errors),
        Block::Asset {
            ticker,
            company_name,
            exchange,
        } => {
            if ticker.trim().is_empty() {
                errors.push(BlockError::Asset(AssetError::MissingTicker));
            }
            if company_name.trim().is_empty() {
                errors.push(BlockError::Asset(AssetError::MissingCompanyName));
            }
            if exchange.trim().is_empty() {
                errors.push(BlockError::Asset(AssetError::MissingExchange));
            }
        }
    }

    violations.extend(
        errors
            .into_iter()
            .map(|reason| ValidationError::new(path.clone(), reason)),
    );

    for (index, child) in block.children().iter().enumerate() {
        collect_into(child, &path.child(index), violations);
    }
}

fn validate_group_block(name: &str, children: &[Block], errors: &mut Vec<BlockError>) {
    if name.trim().is_empty() {
        errors.push(BlockError::Group(GroupError::MissingName));
    }

    match children.first() {
        None => errors.push(BlockError::Group(GroupError::NoChildren)),
        Some(first_child) if first_child.blocktype() != BlockType::Weight => errors.push(
            BlockError::Group(GroupError::FirstChildNotWeight(first_child.blocktype())),
        ),
        Some(_) => {}
    }
}

fn validate_weight_block(weight: &WeightSpec, children: &[Block], errors: &mut Vec<BlockError>) {
    match weight {
        WeightSpec::Equal => {}
        WeightSpec::Specified {
            allocation_type,
            values,
        } => {
            // One value per child, or one per ranked asset of a single filter.
            let expected = weight_slot_count(children);
            if values.len() != children.len() && values.len() != expected {
                errors.push(BlockError::Weight(WeightError::ValueChildrenMismatch {
                    expected,
                    found: values.len(),
                }));
            }

            for (index, &value) in values.iter().enumerate() {
                if !value.is_finite() {
                    errors.push(BlockError::Weight(WeightError::NonFiniteValue(index)));
                } else if value < 0.0 {
                    errors.push(BlockError::Weight(WeightError::NegativeValue { index, value }));
                }
            }

            let sum: f64 = values.iter().sum();
            let target = allocation_type.target_sum();
            if sum.is_finite() && (sum - target).abs() > WEIGHT_EPSILON {
                errors.push(BlockError::Weight(WeightError::InvalidSum { sum, target }));
            }
        }
        WeightSpec::InverseVolatility {
            window_of_trading_days,
        } => {
            let max = FunctionName::ReturnsStandardDeviation.max_window_of_days();
            if *window_of_trading_days == 0 || *window_of_trading_days > max {
                errors.push(BlockError::Weight(WeightError::InvalidVolatilityWindow {
                    found: *window_of_trading_days,
                    max,
                }));
            }
            require_asset_children(children, errors);
        }
        WeightSpec::MarketCap => require_asset_children(children, errors),
    }
}

/// Inverse volatility and market cap need a per-asset metric, so their
/// children must be assets (or a single filter over assets).
fn require_asset_children(children: &[Block], errors: &mut Vec<BlockError>) {
    if single_filter(children).is_some() {
        return;
    }
    for (index, child) in children.iter().enumerate() {
        if child.blocktype() != BlockType::Asset {
            errors.push(BlockError::Weight(WeightError::NonAssetChild(index)));
        }
    }
}

fn validate_filter_block(
    sort_function: &SortFunction,
    select: &SelectConfig,
    children: &[Block],
    errors: &mut Vec<BlockError>,
) {
    if let Err(e) =
        validate_function_definition(sort_function.function_name, sort_function.window_of_days, None)
    {
        errors.push(BlockError::Filter(FilterError::SortFunction(e)));
    }

    if select.amount == 0 {
        errors.push(BlockError::Filter(FilterError::InvalidSelectAmount));
    }

    for (index, child) in children.iter().enumerate() {
        if child.blocktype() != BlockType::Asset {
            errors.push(BlockError::Filter(FilterError::NonAssetChild(index)));
        }
    }
}

/// Checks the window rules of an indicator call. `asset` is `None` for
/// filter sort functions, which take the asset from each ranked child.
pub fn validate_function_definition(
    function_name: FunctionName,
    window_of_days: Option<u32>,
    asset: Option<&str>,
) -> Result<(), FunctionError> {
    if asset.is_some_and(|asset| asset.trim().is_empty()) {
        return Err(FunctionError::EmptyAsset);
    }

    match (function_name.requires_window_of_days(), window_of_days) {
        (true, None) => Err(FunctionError::MissingWindowDays(function_name)),
        (true, Some(days)) => {
            let max = function_name.max_window_of_days();
            if days == 0 || days > max {
                Err(FunctionError::WindowOutOfRange {
                    function: function_name,
                    found: days,
                    max,
                })
            } else {
                Ok(())
            }
        }
        (false, Some(_)) => Err(FunctionError::UnexpectedWindowDays(function_name)),
        (false, None) => Ok(()),
    }
}
