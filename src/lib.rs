pub mod api;
pub mod app;
pub mod cache;
pub mod config;
pub mod error;
pub mod freshness;
pub mod models;
pub mod pipeline;
pub mod scraper;
pub mod storage;
pub mod universe;
pub mod utils;
pub mod worker;
