pub mod condition;
pub mod filter;
pub mod models;
pub mod weighting;
