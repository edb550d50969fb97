//! Batch orchestration engine for two-stage summary → audio pipelines.
//!
//! A batch of per-user summaries completes independently, one webhook at a
//! time. The engine tracks each batch through its lifecycle, forwards units
//! to the audio worker once enough summaries exist, and reconciles stragglers
//! with a periodic sweep.

pub mod config;
pub mod db;
pub mod dispatcher;
pub mod evaluator;
pub mod generation;
pub mod ingress;
pub mod model;
pub mod retry;
pub mod scheduler;
pub mod server;
pub mod sweep;
pub mod tracker;
pub mod worker;
