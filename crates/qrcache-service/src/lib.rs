#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod download;
pub mod images;
pub mod retry;
pub mod utils;
