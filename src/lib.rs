//! docbatch — batch orchestration and scheduling engine.
//!
//! Ingests archive files, drives them through an external extraction service
//! with bounded per-batch concurrency, persists the resulting artifacts
//! behind swappable storage backends, and materializes batches automatically
//! from cron, directory-watch, and object-store-watch schedules.

pub mod app_state;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod models;
pub mod services;
