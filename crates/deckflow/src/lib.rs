//! Orchestration core for the deck rendering pipeline: job store, queue
//! protocol, stage workers, dedup, retry supervision and housekeeping.

pub mod api;
pub mod config;
pub mod db;
pub mod jobs;
pub mod lease;
pub mod pipeline;
pub mod queue;
pub mod runner;
pub mod stage;
pub mod sweep;
pub mod telemetry;
