pub mod cache;
pub mod chain;
pub mod cli;
pub mod config;
pub mod data_paths;
pub mod errors;
pub mod logging;
pub mod portfolio;
pub mod providers;
pub mod types;
pub mod utils;
