// Library interface for testing
pub mod algo;
pub mod chain;
pub mod claim;
pub mod cli;
pub mod contract;
pub mod coordinator;
pub mod daa;
pub mod engine;
pub mod metadata;
