pub mod allocation;
pub mod blocks;
pub mod construction;
pub mod execution;
