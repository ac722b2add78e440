pub mod config;
pub mod graph;
pub mod memory_store;
pub mod store;
pub mod types;
