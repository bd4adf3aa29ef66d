//! Media ingestion pipeline: library watching, forum scraping, link
//! verification and scheduled jobs around a durable activity log.

pub mod activity;
pub mod backup;
pub mod companion;
pub mod config;
pub mod database;
pub mod jdownloader;
pub mod logger;
pub mod notifications;
pub mod pipeline;
pub mod rate_limiter;
pub mod scheduler;
pub mod scraper;
pub mod verifier;
pub mod watcher;

#[cfg(test)]
mod testing;

pub use pipeline::{Pipeline, PipelineError, PipelineResult};
