pub mod config;
pub mod error;
pub mod execution;
pub mod memory;
pub mod types;
